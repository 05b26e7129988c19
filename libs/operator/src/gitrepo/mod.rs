pub mod controller;
pub mod reconcile;

#[cfg(test)]
mod test {
    use crate::controller::test_support::{test_context, ApiServerHandle};
    use crate::crd::gitrepo::{GitRepo, GitRepoSpec};
    use crate::error::Result;
    use crate::gitrepo::reconcile::{reconcile, GITREPO_FINALIZER};

    use std::sync::Arc;

    use http::Response;
    use kube::{client::Body, Resource, ResourceExt};

    fn test_gitrepo() -> GitRepo {
        let mut g = GitRepo::new(
            "demo",
            GitRepoSpec {
                repo: "https://example.com/demo.git".to_owned(),
                branch: None,
                revision: None,
                paths: vec![],
                targets: vec![],
                target_namespace: None,
                service_account: None,
                client_secret_name: None,
                polling_interval_seconds: 0,
                force_sync_generation: 0,
                insecure_skip_tls_verify: false,
                ca_bundle: None,
            },
        );
        g.meta_mut().namespace = Some("default".to_owned());
        g
    }

    struct ApiServerVerifier(ApiServerHandle);

    enum Scenario {
        FinalizerCreation(GitRepo),
    }

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FinalizerCreation(gitrepo) => self.handle_finalizer_creation(gitrepo).await,
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_creation(mut self, gitrepo: GitRepo) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/fleet.cattle.io/v1alpha1/namespaces/default/gitrepos/{}?",
                    gitrepo.name_any()
                )
            );
            let mut finalized = gitrepo.clone();
            finalized.finalizers_mut().push(GITREPO_FINALIZER.to_owned());
            let response = serde_json::to_vec(&finalized).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    /// A `GitRepo` without the cleanup finalizer gets one patched in by a
    /// single PATCH, and the reconcile loop does not touch the clone Job or
    /// status this pass.
    #[tokio::test]
    async fn adds_finalizer_before_anything_else() {
        let (ctx, handle) = test_context();
        let gitrepo = test_gitrepo();
        let verifier = ApiServerVerifier(handle);

        let mocksrv = verifier.run(Scenario::FinalizerCreation(gitrepo.clone()));
        reconcile(Arc::new(gitrepo), ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mocksrv).await;
    }
}
