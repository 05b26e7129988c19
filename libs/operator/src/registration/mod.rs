pub mod controller;
pub mod reconcile;

#[cfg(test)]
mod test {
    use crate::controller::test_support::{test_context, ApiServerHandle};
    use crate::crd::registration::{ClusterRegistrationToken, ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus};
    use crate::error::Result;
    use crate::registration::reconcile::reconcile_token;

    use std::sync::Arc;

    use http::Response;
    use k8s_openapi::api::core::v1::Secret;
    use kube::{client::Body, Resource, ResourceExt};

    fn test_token() -> ClusterRegistrationToken {
        let mut t = ClusterRegistrationToken::new("bootstrap", ClusterRegistrationTokenSpec { ttl_seconds: 3600 });
        t.meta_mut().namespace = Some("default".to_owned());
        t
    }

    struct ApiServerVerifier(ApiServerHandle);

    enum Scenario {
        IssueBootstrapSecret(ClusterRegistrationToken),
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
                    Scenario::IssueBootstrapSecret(token) => {
                        self.handle_secret_create(token.clone())
                            .await
                            .unwrap()
                            .handle_status_patch(token)
                            .await
                    }
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_secret_create(mut self, token: ClusterRegistrationToken) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::POST);
            assert_eq!(request.uri().to_string(), "/api/v1/namespaces/default/secrets?");

            let req_body = request.into_body().collect_bytes().await.unwrap();
            let secret: Secret = serde_json::from_slice(&req_body).expect("valid secret");
            assert_eq!(secret.metadata.name.as_deref(), Some(format!("{}-bootstrap", token.name_any()).as_str()));

            let response = serde_json::to_vec(&secret).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_patch(mut self, token: ClusterRegistrationToken) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/fleet.cattle.io/v1alpha1/namespaces/default/clusterregistrationtokens/{}/status?",
                    token.name_any()
                )
            );
            let req_body = request.into_body().collect_bytes().await.unwrap();
            let json: serde_json::Value = serde_json::from_slice(&req_body).expect("patch_status object is json");
            let status_json = json.get("status").expect("status object").clone();
            let status: ClusterRegistrationTokenStatus = serde_json::from_value(status_json).expect("valid status");
            assert_eq!(status.secret_name.as_deref(), Some(format!("{}-bootstrap", token.name_any()).as_str()));

            let mut updated = token.clone();
            updated.status = Some(status);
            let response = serde_json::to_vec(&updated).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    /// A freshly-created `ClusterRegistrationToken` issues a bootstrap secret
    /// and records its name and expiry on status, in that order.
    #[tokio::test]
    async fn issues_bootstrap_secret_then_patches_status() {
        let (ctx, handle) = test_context();
        let token = test_token();
        let verifier = ApiServerVerifier(handle);

        let mocksrv = verifier.run(Scenario::IssueBootstrapSecret(token.clone()));
        reconcile_token(Arc::new(token), ctx).await.expect("reconcile succeeds");
        timeout_after_1s(mocksrv).await;
    }
}
