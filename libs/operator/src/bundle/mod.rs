pub mod controller;
pub mod reconcile;

#[cfg(test)]
mod test {
    use crate::bundle::reconcile::{reconcile, BUNDLE_FINALIZER};
    use crate::controller::test_support::{test_context, ApiServerHandle};
    use crate::crd::bundle::{Bundle, BundleSource, BundleSpec};
    use crate::error::Result;

    use std::sync::Arc;

    use http::Response;
    use kube::{client::Body, Resource, ResourceExt};

    fn test_bundle() -> Bundle {
        let mut b = Bundle::new(
            "demo",
            BundleSpec {
                source: BundleSource::Inline { resources: vec![] },
                targets: vec![],
                target_restrictions: vec![],
                rollout_strategy: Default::default(),
                depends_on: vec![],
                helm: None,
                namespace: None,
                values_hash: None,
                helm_op_options: None,
                default_options: Default::default(),
            },
        );
        b.meta_mut().namespace = Some("default".to_owned());
        b
    }

    struct ApiServerVerifier(ApiServerHandle);

    enum Scenario {
        FinalizerCreation(Bundle),
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
                    Scenario::FinalizerCreation(bundle) => self.handle_finalizer_creation(bundle).await,
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_creation(mut self, bundle: Bundle) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/fleet.cattle.io/v1alpha1/namespaces/default/bundles/{}?",
                    bundle.name_any()
                )
            );
            let mut finalized = bundle.clone();
            finalized.finalizers_mut().push(BUNDLE_FINALIZER.to_owned());
            let response = serde_json::to_vec(&finalized).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    /// A `Bundle` without the cleanup finalizer gets one patched in before
    /// targets are ever resolved, so no `BundleDeployment` call happens yet.
    #[tokio::test]
    async fn adds_finalizer_before_anything_else() {
        let (ctx, handle) = test_context();
        let bundle = test_bundle();
        let verifier = ApiServerVerifier(handle);

        let mocksrv = verifier.run(Scenario::FinalizerCreation(bundle.clone()));
        reconcile(Arc::new(bundle), ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mocksrv).await;
    }
}
