//! Process-wide renderer cache
//!
//! Two levels: the owner level shares one initialized renderer across all
//! Manifests carrying the same cache-key label, the resource level remembers
//! the flag fingerprint last seen per Manifest. A fingerprint change means
//! the cached renderer's flags are stale for that Manifest and it must be
//! re-initialized before the next apply.

use std::sync::Arc;

use dashmap::DashMap;

use crate::crd::ObjectKey;
use crate::render::Renderer;

/// Concurrent two-level cache of renderers and flag fingerprints.
///
/// Writers racing on the same owner key produce logically equivalent
/// renderers; the last writer wins.
#[derive(Default)]
pub struct RendererCache {
    renderers: DashMap<ObjectKey, Arc<dyn Renderer>>,
    configs: DashMap<ObjectKey, u64>,
}

impl RendererCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached renderer for the owner, if any
    pub fn get_renderer(&self, owner: &ObjectKey) -> Option<Arc<dyn Renderer>> {
        self.renderers.get(owner).map(|entry| entry.value().clone())
    }

    /// Store the renderer for an owner. Idempotent; replaces any entry.
    pub fn set_renderer(&self, owner: ObjectKey, renderer: Arc<dyn Renderer>) {
        self.renderers.insert(owner, renderer);
    }

    /// Evict the renderer for an owner
    pub fn delete_renderer(&self, owner: &ObjectKey) {
        self.renderers.remove(owner);
    }

    /// Last-seen flag fingerprint for a resource, `0` when unknown
    pub fn get_config(&self, resource: &ObjectKey) -> u64 {
        self.configs.get(resource).map(|entry| *entry.value()).unwrap_or(0)
    }

    /// Remember the flag fingerprint for a resource
    pub fn set_config(&self, resource: ObjectKey, fingerprint: u64) {
        self.configs.insert(resource, fingerprint);
    }

    /// Forget the flag fingerprint for a resource
    pub fn delete_config(&self, resource: &ObjectKey) {
        self.configs.remove(resource);
    }

    /// Number of cached renderers
    pub fn renderer_count(&self) -> usize {
        self.renderers.len()
    }
}
