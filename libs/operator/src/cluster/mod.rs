pub mod controller;
pub mod reconcile;

#[cfg(test)]
mod test {
    use crate::cluster::reconcile::{reconcile, CLUSTER_FINALIZER};
    use crate::controller::test_support::{test_context, ApiServerHandle};
    use crate::crd::cluster::{Cluster, ClusterSpec};
    use crate::error::Result;

    use std::sync::Arc;

    use http::Response;
    use kube::{client::Body, Resource, ResourceExt};

    fn test_cluster() -> Cluster {
        let mut c = Cluster::new(
            "downstream-a",
            ClusterSpec {
                client_id: Some("client-a".to_owned()),
                kube_config_secret: None,
                labels: Default::default(),
                agent_namespace: None,
                private_repo_url: None,
                agent_env_vars: vec![],
                agent_affinity: None,
                agent_resources: None,
                agent_tolerations: vec![],
                redeploy_agent_generation: 0,
            },
        );
        c.meta_mut().namespace = Some("default".to_owned());
        c
    }

    struct ApiServerVerifier(ApiServerHandle);

    enum Scenario {
        FinalizerCreation(Cluster),
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
                    Scenario::FinalizerCreation(cluster) => self.handle_finalizer_creation(cluster).await,
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_creation(mut self, cluster: Cluster) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/fleet.cattle.io/v1alpha1/namespaces/default/clusters/{}?",
                    cluster.name_any()
                )
            );
            let mut finalized = cluster.clone();
            finalized.finalizers_mut().push(CLUSTER_FINALIZER.to_owned());
            let response = serde_json::to_vec(&finalized).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    /// A `Cluster` without the cleanup finalizer gets one patched in before
    /// the registration namespace is ever touched.
    #[tokio::test]
    async fn adds_finalizer_before_anything_else() {
        let (ctx, handle) = test_context();
        let cluster = test_cluster();
        let verifier = ApiServerVerifier(handle);

        let mocksrv = verifier.run(Scenario::FinalizerCreation(cluster.clone()));
        reconcile(Arc::new(cluster), ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mocksrv).await;
    }
}
