//! Controller for Manifest resources
//!
//! Contains the reconciliation state machine, the per-round response
//! aggregation and the glue between the controller and the install worker
//! pool.

mod manifest;

pub use manifest::{
    collect_responses, end_state, error_policy, reconcile, Context, KubeManifestClient,
    ManifestClient, PipelineHandler,
};
