//! Target cluster resolution
//!
//! A Manifest installs either into the cluster this operator runs in or,
//! when `spec.remote` is set, into a cluster whose kubeconfig lives in a
//! secret named after the Manifest's owner label. Resolved connections are
//! memoized through the renderer cache: a cached renderer already carries
//! the cluster it talks to.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Manifest, ObjectKey};
use crate::error::{Error, Result};
use crate::labels;
use crate::render::RendererCache;

/// Connection to a target cluster.
///
/// `config` may be present while `client` is still unset; the client is
/// materialized by the renderer factory when the first operation against
/// the target runs.
#[derive(Clone, Default)]
pub struct ClusterInfo {
    /// Client configuration, absent for the host cluster connection
    pub config: Option<kube::Config>,
    /// Established client, absent until materialized
    pub client: Option<kube::Client>,
}

impl ClusterInfo {
    /// Connection to the cluster this operator runs in
    pub fn host(client: kube::Client) -> Self {
        Self {
            config: None,
            client: Some(client),
        }
    }

    /// Connection to a remote cluster known only by its config
    pub fn remote(config: kube::Config) -> Self {
        Self {
            config: Some(config),
            client: None,
        }
    }

    /// Return the established client, building one from the config if
    /// necessary
    pub fn materialize(&self) -> Result<kube::Client> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::cluster("cluster connection carries neither client nor config"))?;
        kube::Client::try_from(config)
            .map_err(|err| Error::cluster(format!("building cluster client failed: {err}")))
    }
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("config", &self.config.as_ref().map(|c| c.cluster_url.to_string()))
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// Produces the client configuration of a remote target cluster.
///
/// The default getter reads a kubeconfig secret; deployments with their own
/// connection brokering install a custom getter at startup.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RestConfigGetter: Send + Sync {
    /// Produce the target cluster's client configuration
    async fn rest_config(&self) -> Result<kube::Config>;
}

/// Resolve the cluster a Manifest installs into.
///
/// Non-remote Manifests target the host cluster. Remote Manifests require
/// the owner label; if a renderer is already cached for the owner its
/// connection is reused, otherwise the kubeconfig is loaded through the
/// custom getter or the owner-named secret in the Manifest's namespace.
pub async fn resolve_target(
    manifest: &Manifest,
    host: &ClusterInfo,
    host_client: &kube::Client,
    cache: &RendererCache,
    custom_getter: Option<&Arc<dyn RestConfigGetter>>,
) -> Result<ClusterInfo> {
    if !manifest.spec.remote {
        return Ok(host.clone());
    }

    let namespace = manifest.namespace().unwrap_or_default();
    let owner = manifest
        .labels()
        .get(labels::CACHE_KEY)
        .cloned()
        .ok_or_else(|| {
            Error::config(format!(
                "label {} not set for manifest resource {}/{}",
                labels::CACHE_KEY,
                namespace,
                manifest.name_any()
            ))
        })?;

    let owner_key = ObjectKey::new(namespace.clone(), owner.clone());
    if let Some(renderer) = cache.get_renderer(&owner_key) {
        return Ok(renderer.cluster_info());
    }

    let config = match custom_getter {
        Some(getter) => getter.rest_config().await?,
        None => rest_config_from_secret(host_client, &owner, &namespace).await?,
    };
    Ok(ClusterInfo::remote(config))
}

/// Load a remote cluster's client configuration from a kubeconfig secret
pub async fn rest_config_from_secret(
    client: &kube::Client,
    secret_name: &str,
    namespace: &str,
) -> Result<kube::Config> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let secret = secrets.get(secret_name).await.map_err(|err| {
        Error::cluster(format!(
            "reading kubeconfig secret {namespace}/{secret_name} failed: {err}"
        ))
    })?;

    let data = secret.data.unwrap_or_default();
    let payload = data
        .get("config")
        .or_else(|| data.values().next())
        .ok_or_else(|| {
            Error::cluster(format!(
                "kubeconfig secret {namespace}/{secret_name} carries no payload"
            ))
        })?;

    let raw = std::str::from_utf8(&payload.0).map_err(|err| {
        Error::cluster(format!(
            "kubeconfig secret {namespace}/{secret_name} is not valid UTF-8: {err}"
        ))
    })?;
    let kubeconfig = Kubeconfig::from_yaml(raw).map_err(|err| {
        Error::cluster(format!(
            "parsing kubeconfig from secret {namespace}/{secret_name} failed: {err}"
        ))
    })?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|err| {
            Error::cluster(format!(
                "loading kubeconfig from secret {namespace}/{secret_name} failed: {err}"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_client() -> kube::Client {
        let service = tower::service_fn(|_request: axum::http::Request<kube::client::Body>| async {
            let response = axum::http::Response::builder()
                .status(404)
                .header("content-type", "application/json")
                .body(kube::client::Body::from(
                    br#"{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"NotFound","code":404}"#.to_vec(),
                ))
                .unwrap();
            Ok::<_, std::convert::Infallible>(response)
        });
        kube::Client::new(service, "default")
    }

    fn remote_manifest(with_owner_label: bool) -> Manifest {
        let mut manifest = Manifest::new("sample", crate::crd::ManifestSpec {
            remote: true,
            ..Default::default()
        });
        manifest.metadata.namespace = Some("edge".to_string());
        if with_owner_label {
            manifest.metadata.labels =
                Some([(labels::CACHE_KEY.to_string(), "owner-a".to_string())].into());
        }
        manifest
    }

    #[test]
    fn cluster_info_without_connection_fails_to_materialize() {
        let info = ClusterInfo::default();
        assert!(matches!(info.materialize(), Err(Error::Cluster(_))));
    }

    #[tokio::test]
    async fn non_remote_manifests_resolve_to_the_host_cluster() {
        let client = fake_client();
        let host = ClusterInfo::host(client.clone());
        let cache = RendererCache::new();

        let mut manifest = remote_manifest(false);
        manifest.spec.remote = false;

        let resolved = resolve_target(&manifest, &host, &client, &cache, None)
            .await
            .unwrap();
        assert!(resolved.client.is_some());
        assert!(resolved.config.is_none());
    }

    #[tokio::test]
    async fn remote_manifest_without_owner_label_is_a_config_error() {
        let client = fake_client();
        let host = ClusterInfo::host(client.clone());
        let cache = RendererCache::new();

        let err = resolve_target(&remote_manifest(false), &host, &client, &cache, None)
            .await
            .unwrap_err();
        match err {
            Error::Config(message) => {
                assert!(message.contains(labels::CACHE_KEY));
                assert!(message.contains("edge/sample"));
            }
            other => panic!("expected config error, got {other}"),
        }
    }

    #[tokio::test]
    async fn remote_manifest_uses_the_custom_config_getter() {
        let client = fake_client();
        let host = ClusterInfo::host(client.clone());
        let cache = RendererCache::new();

        let mut getter = MockRestConfigGetter::new();
        getter.expect_rest_config().times(1).returning(|| {
            Ok(kube::Config::new("https://remote.example.com".parse().unwrap()))
        });
        let getter: Arc<dyn RestConfigGetter> = Arc::new(getter);

        let resolved = resolve_target(&remote_manifest(true), &host, &client, &cache, Some(&getter))
            .await
            .unwrap();
        let config = resolved.config.expect("remote config");
        assert_eq!(config.cluster_url.to_string(), "https://remote.example.com/");
        assert!(resolved.client.is_none());
    }
}
