//! Periodic `Content` garbage collector: a `Content` whose
//! finalizer list (its reference count) has drained to empty is no longer
//! needed and can be deleted outright, rather than waiting on a reconcile
//! loop keyed off `Content` spec changes that never happen (the object is
//! immutable after creation).

use std::sync::Arc;
use std::time::Duration;

use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{debug, error, info};

use crate::controller::Context;
use crate::crd::content::Content;
use crate::error::{ignore_not_found, Error};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run(ctx: Arc<Context>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        ctx.record_event(crate::controller::CONTENT_GC).await;
        if let Err(e) = sweep(&ctx).await {
            error!("content GC sweep failed: {e:?}");
        }
    }
}

async fn sweep(ctx: &Context) -> crate::error::Result<()> {
    let api: Api<Content> = Api::all(ctx.client.clone());
    let contents = api.list(&ListParams::default()).await.map_err(Error::KubeError)?;

    let mut deleted = 0usize;
    for content in contents.items.iter().filter(|c| c.reference_count() == 0) {
        let name = content.name_any();
        match ignore_not_found(api.delete(&name, &Default::default()).await) {
            Ok(_) => {
                debug!(content = name, "garbage collected unreferenced content");
                deleted += 1;
            }
            Err(e) => return Err(e.in_step("delete unreferenced content")),
        }
    }
    if deleted > 0 {
        info!(deleted, "content GC sweep complete");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::content::{ContentSpec, ContentStatus};
    use kube::api::ObjectMeta;

    fn content(name: &str, refs: &[&str]) -> Content {
        Content {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                finalizers: if refs.is_empty() {
                    None
                } else {
                    Some(refs.iter().map(|s| s.to_string()).collect())
                },
                ..Default::default()
            },
            spec: ContentSpec { resources: vec![] },
            status: Some(ContentStatus { reference_count: refs.len() as i64 }),
        }
    }

    #[test]
    fn only_unreferenced_content_is_swept() {
        let referenced = content("s-a", &["bd-1"]);
        let unreferenced = content("s-b", &[]);
        assert_eq!(referenced.reference_count(), 1);
        assert_eq!(unreferenced.reference_count(), 0);
    }
}
