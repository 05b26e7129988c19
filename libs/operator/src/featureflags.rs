//! Environment flags that gate experimental features.
//!
//! Values are read once at process start and are case-insensitive `"true"`.

use std::env;

const OCI_STORAGE: &str = "EXPERIMENTAL_OCI_STORAGE";
const HELM_OPS: &str = "EXPERIMENTAL_HELM_OPS";
const COPY_RESOURCES_DOWNSTREAM: &str = "EXPERIMENTAL_COPY_RESOURCES_DOWNSTREAM";

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FeatureFlags {
    pub oci_storage: bool,
    pub helm_ops: bool,
    pub copy_resources_downstream: bool,
}

impl FeatureFlags {
    /// Reads every flag from the process environment.
    pub fn from_env() -> Self {
        Self {
            oci_storage: flag(OCI_STORAGE),
            helm_ops: flag(HELM_OPS),
            copy_resources_downstream: flag(COPY_RESOURCES_DOWNSTREAM),
        }
    }
}
