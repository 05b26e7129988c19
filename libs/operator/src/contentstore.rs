//! Reference-counted, content-addressed blob store.
//!
//! `Content` objects are cluster-scoped and immutable once created; the only
//! mutable field is `metadata.finalizers`, which doubles as the reference
//! count. Concurrent writers use create-or-update semantics: get, mutate,
//! update; on a version conflict, refetch and retry.

use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::content::{Content, ContentResource, ContentSpec, ContentStatus};
use crate::error::{ignore_not_found, Error, Result};
use crate::hash::content_id;

const MAX_CONFLICT_RETRIES: usize = 5;

pub struct ContentStore {
    api: Api<Content>,
}

impl ContentStore {
    pub fn new(client: kube::Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Canonicalizes `resources`, computes its name, and upserts the object.
    /// Returns the full content id (`s-<12-hex>`). Idempotent: calling this
    /// twice with byte-identical resources is a no-op on the second call.
    pub async fn store(&self, resources: Vec<ContentResource>) -> Result<String> {
        let id = content_id(&resources)?;
        if ignore_not_found(self.api.get(&id).await)?.is_some() {
            return Ok(id);
        }
        let content = Content {
            metadata: kube::api::ObjectMeta {
                name: Some(id.clone()),
                ..Default::default()
            },
            spec: ContentSpec { resources },
            status: Some(ContentStatus { reference_count: 0 }),
        };
        match self.api.create(&PostParams::default(), &content).await {
            Ok(_) => Ok(id),
            // Another reconciler raced us to the same digest; that's fine,
            // the content is identical by construction.
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(id),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    pub async fn get(&self, content_id: &str) -> Result<Option<Content>> {
        ignore_not_found(self.api.get(content_id).await)
    }

    /// Appends `bundle_deployment_name` to the content's finalizers if it is
    /// not already present.
    pub async fn add_reference(&self, content_id: &str, bundle_deployment_name: &str) -> Result<()> {
        self.mutate_finalizers(content_id, |finalizers| {
            if !finalizers.iter().any(|f| f == bundle_deployment_name) {
                finalizers.push(bundle_deployment_name.to_owned());
                true
            } else {
                false
            }
        })
        .await
    }

    /// Removes `bundle_deployment_name` from the content's finalizers
    ///. Once the finalizer list empties,
    /// the content becomes eligible for garbage collection by the API
    /// server once a deletion timestamp is set on it.
    pub async fn remove_reference(&self, content_id: &str, bundle_deployment_name: &str) -> Result<()> {
        self.mutate_finalizers(content_id, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != bundle_deployment_name);
            finalizers.len() != before
        })
        .await
    }

    async fn mutate_finalizers(
        &self,
        content_id: &str,
        mutate: impl Fn(&mut Vec<String>) -> bool,
    ) -> Result<()> {
        for attempt in 0..MAX_CONFLICT_RETRIES {
            let Some(mut content) = ignore_not_found(self.api.get(content_id).await)? else {
                return Ok(());
            };
            let mut finalizers = content.finalizers().to_vec();
            if !mutate(&mut finalizers) {
                return Ok(());
            }
            content.meta_mut().finalizers = Some(finalizers.clone());
            let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
            match self
                .api
                .patch(content_id, &PatchParams::default(), &Patch::Merge(&patch))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(resp)) if resp.code == 409 && attempt + 1 < MAX_CONFLICT_RETRIES => {
                    debug!(content_id, attempt, "conflict updating content finalizers, retrying");
                    continue;
                }
                Err(e) => return Err(Error::KubeError(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_id_is_deterministic_for_store_dedup() {
        let resources = vec![ContentResource {
            name: "a.yaml".into(),
            content: "hi".into(),
            encoding: crate::crd::content::ResourceEncoding::Plain,
        }];
        assert_eq!(content_id(&resources).unwrap(), content_id(&resources).unwrap());
    }
}
