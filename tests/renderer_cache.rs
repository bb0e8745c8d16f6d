//! Renderer cache sharing across Manifests
//!
//! Manifests carrying the same cache-key label must share exactly one
//! renderer; a changed flag fingerprint re-initializes the shared renderer
//! instead of evicting it.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;

use manifest_operator::check::StateCheck;
use manifest_operator::cluster::ClusterInfo;
use manifest_operator::error::Result;
use manifest_operator::flags::ChartFlags;
use manifest_operator::pipeline::InstallPipeline;
use manifest_operator::prepare::InstallJob;
use manifest_operator::render::engine::{
    HelmEngine, HelmTemplateRequest, KustomizeEngine,
};
use manifest_operator::render::{ChartInfo, RendererCache, RendererFactory};

mod util;
use util::fake_client;

struct StaticHelm;

#[async_trait]
impl HelmEngine for StaticHelm {
    async fn template(&self, _request: &HelmTemplateRequest) -> Result<String> {
        Ok("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: rendered\n".to_string())
    }
}

struct StaticKustomize;

#[async_trait]
impl KustomizeEngine for StaticKustomize {
    async fn build(&self, _target: &str) -> Result<String> {
        Ok(String::new())
    }
}

fn pipeline(cache: Arc<RendererCache>) -> InstallPipeline {
    let factory = RendererFactory::with_engines(Arc::new(StaticHelm), Arc::new(StaticKustomize));
    InstallPipeline::new(cache, factory)
}

fn job(resource_name: &str, owner: &str, flags: &str) -> InstallJob {
    let base_resource: DynamicObject = serde_json::from_value(serde_json::json!({
        "apiVersion": "manifest-operator.io/v1alpha1",
        "kind": "Manifest",
        "metadata": {
            "name": resource_name,
            "namespace": "test-ns",
            "labels": { "manifest-operator.io/cache-key": owner },
        },
    }))
    .unwrap();

    InstallJob {
        cluster: ClusterInfo::host(fake_client()),
        chart: ChartInfo {
            chart_name: "repo/some-chart".to_string(),
            repo_name: "repo".to_string(),
            url: "https://helm.nginx.com/stable".to_string(),
            release_name: "some-chart".to_string(),
            flags: ChartFlags::parse(flags, "").unwrap(),
            ..Default::default()
        },
        crds: Vec::new(),
        base_resource,
        custom_resources: Vec::new(),
        custom_states: Vec::new(),
        check: StateCheck::Default,
        check_ready_states: false,
    }
}

#[tokio::test]
async fn same_owner_and_flags_share_one_renderer() {
    let cache = Arc::new(RendererCache::new());
    let pipeline = pipeline(cache.clone());

    let first = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();
    let second = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.renderer_count(), 1);
}

#[tokio::test]
async fn changed_flags_reinitialize_the_shared_renderer() {
    let cache = Arc::new(RendererCache::new());
    let pipeline = pipeline(cache.clone());

    let initial = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();
    let reseated = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value2")).unwrap();

    // new renderer, same (single) owner entry
    assert!(!Arc::ptr_eq(&initial, &reseated));
    assert_eq!(cache.renderer_count(), 1);

    // the resource now sticks to the reseated renderer
    let again = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value2")).unwrap();
    assert!(Arc::ptr_eq(&reseated, &again));
}

#[tokio::test]
async fn second_resource_with_unseen_flags_overwrites_the_owner_entry() {
    let cache = Arc::new(RendererCache::new());
    let pipeline = pipeline(cache.clone());

    let first = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();
    // same owner, different resource: its fingerprint is unknown, so the
    // owner renderer is re-initialized once for it
    let second = pipeline.renderer_for(&job("resource-b", "owner-1", "Namespace=value1")).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(cache.renderer_count(), 1);

    // both resources are now seeded and share the entry
    let a = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();
    let b = pipeline.renderer_for(&job("resource-b", "owner-1", "Namespace=value1")).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}

#[tokio::test]
async fn distinct_owners_get_distinct_renderers() {
    let cache = Arc::new(RendererCache::new());
    let pipeline = pipeline(cache.clone());

    let one = pipeline.renderer_for(&job("resource-a", "owner-1", "Namespace=value1")).unwrap();
    let two = pipeline.renderer_for(&job("resource-b", "owner-2", "Namespace=value1")).unwrap();

    assert!(!Arc::ptr_eq(&one, &two));
    assert_eq!(cache.renderer_count(), 2);
}

#[tokio::test]
async fn manifests_without_cache_key_bypass_the_cache() {
    let cache = Arc::new(RendererCache::new());
    let pipeline = pipeline(cache.clone());

    let mut no_owner = job("resource-a", "ignored", "Namespace=value1");
    no_owner.base_resource.metadata.labels = None;

    let first = pipeline.renderer_for(&no_owner).unwrap();
    let second = pipeline.renderer_for(&no_owner).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(cache.renderer_count(), 0);
}
