pub mod bundle;
pub mod cluster;
pub mod clustergroup;
pub mod config;
pub mod content_gc;
pub mod contentstore;
pub mod controller;
pub mod crd;
pub mod error;
pub mod featureflags;
pub mod finalizer;
pub mod gitrepo;
pub mod hash;
pub mod labels;
pub mod metrics;
pub mod registration;
pub mod rollout;
pub mod target;
pub mod telemetry;
