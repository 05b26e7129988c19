//! Process-wide configuration: agent image,
//! default polling interval, checkin interval. Loaded once at startup from a
//! `ConfigMap` and kept live via a background watch; readers always see the
//! latest value through `OperatorConfig::current`.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfigData {
    #[serde(default = "default_agent_image")]
    pub agent_image: String,
    #[serde(default = "default_polling_interval_seconds")]
    pub default_polling_interval_seconds: i64,
    #[serde(default = "default_checkin_interval_seconds")]
    pub agent_checkin_interval_seconds: i64,
}

fn default_agent_image() -> String {
    "rancher/fleet-agent:latest".to_owned()
}

fn default_polling_interval_seconds() -> i64 {
    15
}

fn default_checkin_interval_seconds() -> i64 {
    300
}

impl Default for OperatorConfigData {
    fn default() -> Self {
        Self {
            agent_image: default_agent_image(),
            default_polling_interval_seconds: default_polling_interval_seconds(),
            agent_checkin_interval_seconds: default_checkin_interval_seconds(),
        }
    }
}

fn parse_config_map(cm: &ConfigMap) -> OperatorConfigData {
    let Some(data) = &cm.data else {
        return OperatorConfigData::default();
    };
    OperatorConfigData {
        agent_image: data
            .get("agentImage")
            .cloned()
            .unwrap_or_else(default_agent_image),
        default_polling_interval_seconds: data
            .get("defaultPollingIntervalSeconds")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_polling_interval_seconds),
        agent_checkin_interval_seconds: data
            .get("agentCheckinIntervalSeconds")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_checkin_interval_seconds),
    }
}

/// Handle shared across all reconcilers; cloning is cheap (an `Arc` over a
/// `tokio::sync::watch` receiver).
#[derive(Clone)]
pub struct OperatorConfig {
    rx: watch::Receiver<OperatorConfigData>,
}

impl OperatorConfig {
    pub fn current(&self) -> OperatorConfigData {
        self.rx.borrow().clone()
    }

    /// Builds a config handle over a fixed value with no background watch,
    /// for reconciler tests that need a `Context` but not live reload.
    pub fn static_value(data: OperatorConfigData) -> Self {
        let (_tx, rx) = watch::channel(data);
        Self { rx }
    }

    /// Performs one blocking read of the ConfigMap to seed the initial value,
    /// then spawns a background task that keeps it live via a watch stream.
    pub async fn load(client: Client, namespace: &str, name: &str) -> Result<Arc<Self>> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let initial = match api.get_opt(name).await.map_err(Error::KubeError)? {
            Some(cm) => parse_config_map(&cm),
            None => {
                warn!(
                    namespace,
                    name, "operator config ConfigMap not found, using defaults"
                );
                OperatorConfigData::default()
            }
        };

        let (tx, rx) = watch::channel(initial);
        let name_owned = name.to_owned();
        tokio::spawn(async move {
            let watcher_config = watcher::Config::default().fields(&format!("metadata.name={name_owned}"));
            let mut stream = Box::pin(watcher::watcher(api, watcher_config).default_backoff().applied_objects());
            use futures::StreamExt;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(cm) => {
                        let parsed = parse_config_map(&cm);
                        info!(?parsed, "reloaded operator config");
                        let _ = tx.send(parsed);
                    }
                    Err(e) => warn!(error = %e, "operator config watch error"),
                }
            }
        });

        Ok(Arc::new(Self { rx }))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;
    use kube::api::ObjectMeta;

    #[test]
    fn parses_known_keys_and_falls_back_to_defaults() {
        let mut data = BTreeMap::new();
        data.insert("agentImage".to_owned(), "acme/fleet-agent:v9".to_owned());
        let cm = ConfigMap {
            metadata: ObjectMeta::default(),
            data: Some(data),
            ..Default::default()
        };
        let parsed = parse_config_map(&cm);
        assert_eq!(parsed.agent_image, "acme/fleet-agent:v9");
        assert_eq!(parsed.default_polling_interval_seconds, 15);
    }

    #[test]
    fn missing_configmap_data_uses_defaults() {
        let cm = ConfigMap::default();
        let parsed = parse_config_map(&cm);
        assert_eq!(parsed.agent_image, default_agent_image());
    }
}
