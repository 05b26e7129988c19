#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use fleet_operator::crd::bundle::{Bundle, BundleSource, BundleSpec, BundleTarget};
    use fleet_operator::crd::bundledeployment::BundleDeployment;
    use fleet_operator::crd::cluster::{Cluster, ClusterSpec};
    use fleet_operator::crd::gitrepo::{GitRepo, GitRepoSpec};
    use kube::api::{Api, Patch, PatchParams, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    fn is_bundle_ready() -> impl Condition<Bundle> {
        |obj: Option<&Bundle>| {
            obj.and_then(|b| b.status.as_ref())
                .is_some_and(|s| s.summary.is_ready() && s.summary.desired_ready > 0)
        }
    }

    fn is_gitrepo_ready() -> impl Condition<GitRepo> {
        |obj: Option<&GitRepo>| {
            obj.and_then(|g| g.status.as_ref())
                .is_some_and(|s| s.conditions.iter().any(|c| c.type_ == "Ready" && c.is_true()))
        }
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(Duration::from_secs(30), await_condition(api, name, condition))
            .await
            .unwrap()
            .unwrap();
    }

    async fn create_cluster(client: &Client, namespace: &str, name: &str, labels: &[(&str, &str)]) -> Cluster {
        let cluster = Cluster {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            spec: ClusterSpec {
                client_id: None,
                kube_config_secret: None,
                labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                agent_namespace: None,
                private_repo_url: None,
                agent_env_vars: vec![],
                agent_affinity: None,
                agent_resources: None,
                agent_tolerations: vec![],
                redeploy_agent_generation: 0,
            },
            status: None,
        };
        let api: Api<Cluster> = Api::namespaced(client.clone(), namespace);
        api.create(&PostParams::default(), &cluster).await.unwrap()
    }

    async fn create_bundle(client: &Client, namespace: &str, name: &str, cluster_labels: BTreeMap<String, String>) -> Bundle {
        let bundle = Bundle {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            spec: BundleSpec {
                source: BundleSource::Inline { resources: vec![] },
                targets: vec![BundleTarget {
                    name: "default".to_owned(),
                    cluster_selector: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                        match_labels: Some(cluster_labels),
                        match_expressions: None,
                    }),
                    cluster_group: None,
                    cluster_group_selector: None,
                    cluster_name: None,
                    custom: None,
                }],
                target_restrictions: vec![],
                rollout_strategy: Default::default(),
                depends_on: vec![],
                helm: None,
                namespace: None,
                values_hash: None,
                helm_op_options: None,
                default_options: Default::default(),
            },
            status: None,
        };
        let api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
        api.create(&PostParams::default(), &bundle).await.unwrap()
    }

    #[tokio::test]
    async fn bundle_creates_one_bundledeployment_per_matching_cluster() {
        let client = Client::try_default().await.unwrap();
        let namespace = "default";
        create_cluster(&client, namespace, "e2e-cluster-a", &[("env", "e2e")]).await;

        let mut labels = BTreeMap::new();
        labels.insert("env".to_owned(), "e2e".to_owned());
        let bundle = create_bundle(&client, namespace, "e2e-bundle-create", labels).await;

        let bundle_api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
        wait_for(bundle_api.clone(), &bundle.name_any(), is_bundle_ready()).await;

        let bd_api: Api<BundleDeployment> = Api::all(client.clone());
        let selector = format!(
            "fleet.cattle.io/bundle-name={},fleet.cattle.io/bundle-namespace={namespace}",
            bundle.name_any()
        );
        let bds = bd_api
            .list(&kube::api::ListParams::default().labels(&selector))
            .await
            .unwrap();
        assert_eq!(bds.items.len(), 1);
    }

    #[tokio::test]
    async fn bundle_delete_cascades_to_bundledeployments() {
        let client = Client::try_default().await.unwrap();
        let namespace = "default";
        create_cluster(&client, namespace, "e2e-cluster-b", &[("env", "e2e-delete")]).await;

        let mut labels = BTreeMap::new();
        labels.insert("env".to_owned(), "e2e-delete".to_owned());
        let bundle = create_bundle(&client, namespace, "e2e-bundle-delete", labels).await;

        let bundle_api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
        wait_for(bundle_api.clone(), &bundle.name_any(), is_bundle_ready()).await;

        let uid = bundle.uid().unwrap();
        bundle_api.delete(&bundle.name_any(), &Default::default()).await.unwrap();
        wait_for(bundle_api.clone(), &bundle.name_any(), conditions::is_deleted(&uid)).await;

        let bd_api: Api<BundleDeployment> = Api::all(client.clone());
        let selector = format!(
            "fleet.cattle.io/bundle-name={},fleet.cattle.io/bundle-namespace={namespace}",
            bundle.name_any()
        );
        let remaining = bd_api
            .list(&kube::api::ListParams::default().labels(&selector))
            .await
            .unwrap();
        assert!(remaining.items.is_empty());
    }

    #[tokio::test]
    async fn gitrepo_reaches_ready_with_no_paths() {
        let client = Client::try_default().await.unwrap();
        let namespace = "default";
        let gitrepo = GitRepo {
            metadata: kube::api::ObjectMeta {
                name: Some("e2e-gitrepo".to_owned()),
                namespace: Some(namespace.to_owned()),
                ..Default::default()
            },
            spec: GitRepoSpec {
                repo: "https://example.com/e2e/fleet-examples.git".to_owned(),
                branch: Some("main".to_owned()),
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
            status: None,
        };
        let api: Api<GitRepo> = Api::namespaced(client.clone(), namespace);
        api.create(&PostParams::default(), &gitrepo).await.unwrap();
        wait_for(api.clone(), "e2e-gitrepo", is_gitrepo_ready()).await;
    }

    #[tokio::test]
    async fn bundle_with_unmatched_target_stays_at_zero_desired() {
        let client = Client::try_default().await.unwrap();
        let namespace = "default";
        let mut labels = BTreeMap::new();
        labels.insert("env".to_owned(), "nothing-matches-this".to_owned());
        let bundle = create_bundle(&client, namespace, "e2e-bundle-no-match", labels).await;

        let bundle_api: Api<Bundle> = Api::namespaced(client.clone(), namespace);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let refreshed = bundle_api.get(&bundle.name_any()).await.unwrap();
        let desired = refreshed.status.map(|s| s.summary.desired_ready).unwrap_or(0);
        assert_eq!(desired, 0);

        let patch = serde_json::json!({ "metadata": { "finalizers": [] } });
        bundle_api
            .patch(&bundle.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .unwrap();
        bundle_api.delete(&bundle.name_any(), &Default::default()).await.unwrap();
    }
}
