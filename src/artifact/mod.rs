//! Artifact acquisition: OCI layer pulls and the on-disk cache
//!
//! Layers are addressed by [`ImageSpec`] and land in a content-addressed
//! directory tree shared by every reconcile. Presence of the directory (or
//! decoded config file) is the cache-hit signal; concurrent extractors of
//! the same key race only on directory creation and on writing identical
//! content.

pub mod auth;

use std::io::Read;
use std::sync::Arc;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use flate2::read::GzDecoder;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::crd::ImageSpec;
use crate::error::{Error, Result};

/// Name of the decoded configuration file inside the cache
const CONFIG_FILE_NAME: &str = "installConfig.yaml";

/// Layer media types accepted from registries
const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
    "application/vnd.cncf.helm.chart.content.v1.tar+gzip",
    "application/x-yaml",
    "application/yaml",
];

/// A client able to fetch a single layer from an OCI registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Pull the first layer of the referenced image
    async fn pull_layer(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
        insecure: bool,
    ) -> Result<Vec<u8>>;
}

/// Registry client backed by the OCI distribution protocol
pub struct OciRegistryClient {
    client: Mutex<Client>,
    insecure_client: Mutex<Client>,
}

impl OciRegistryClient {
    /// Create clients for both transport modes; the insecure one is only
    /// exercised when a pull requests it
    pub fn new() -> Self {
        Self {
            client: Mutex::new(Client::new(ClientConfig {
                protocol: ClientProtocol::Https,
                ..Default::default()
            })),
            insecure_client: Mutex::new(Client::new(ClientConfig {
                protocol: ClientProtocol::Http,
                ..Default::default()
            })),
        }
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn pull_layer(
        &self,
        reference: &Reference,
        auth: &RegistryAuth,
        insecure: bool,
    ) -> Result<Vec<u8>> {
        let client = if insecure {
            &self.insecure_client
        } else {
            &self.client
        };
        let image = client
            .lock()
            .await
            .pull(reference, auth, ACCEPTED_MEDIA_TYPES.to_vec())
            .await
            .map_err(|err| Error::registry(format!("pulling layer {reference:?} failed: {err}")))?;
        let layer = image
            .layers
            .into_iter()
            .next()
            .ok_or_else(|| Error::registry(format!("image {reference:?} carries no layers")))?;
        Ok(layer.data)
    }
}

/// Pulls OCI layers and materializes them in the on-disk cache
pub struct ArtifactStore {
    cache_root: PathBuf,
    registry: Arc<dyn RegistryClient>,
    insecure_registry: bool,
}

impl ArtifactStore {
    /// Create a store rooted at `cache_root`
    pub fn new(
        cache_root: impl Into<PathBuf>,
        registry: Arc<dyn RegistryClient>,
        insecure_registry: bool,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            registry,
            insecure_registry,
        }
    }

    /// Cache directory of an extracted chart layer
    pub fn chart_dir(&self, spec: &ImageSpec) -> PathBuf {
        self.cache_root
            .join(format!("{}-{}", spec.name, sanitize_ref(&spec.ref_)))
    }

    /// Destination of a decoded configuration layer
    pub fn config_file(&self, spec: &ImageSpec) -> PathBuf {
        self.cache_root
            .join(sanitize_ref(&spec.ref_))
            .join(CONFIG_FILE_NAME)
    }

    /// Pull a tar+gzip layer and extract it into the cache.
    ///
    /// Returns the extracted directory. If the directory already exists the
    /// pull is skipped entirely.
    pub async fn extract_tar_gz(&self, spec: &ImageSpec, auth: &RegistryAuth) -> Result<PathBuf> {
        let target = self.chart_dir(spec);
        if tokio::fs::metadata(&target).await.is_ok() {
            debug!(dir = %target.display(), image = %spec.reference(), "chart layer already extracted");
            return Ok(target);
        }

        let reference = self.parse_reference(spec)?;
        let compressed = self
            .registry
            .pull_layer(&reference, auth, self.insecure(spec))
            .await?;

        let reference_str = spec.reference();
        let extract_root = target.clone();
        tokio::task::spawn_blocking(move || extract_archive(&extract_root, &compressed, &reference_str))
            .await
            .map_err(|err| Error::registry(format!("extraction task failed: {err}")))??;

        info!(dir = %target.display(), image = %spec.reference(), "extracted chart layer");
        Ok(target)
    }

    /// Pull an uncompressed YAML layer and decode it.
    ///
    /// The decoded value is re-marshalled as canonical YAML next to the
    /// cache so subsequent reconciles read from disk. An empty layer decodes
    /// to null, which callers treat as an absent configuration.
    pub async fn decode_yaml_layer(&self, spec: &ImageSpec, auth: &RegistryAuth) -> Result<Value> {
        let destination = self.config_file(spec);
        match tokio::fs::read(&destination).await {
            Ok(existing) => {
                debug!(file = %destination.display(), "configuration layer already decoded");
                return decode_yaml_or_json(&existing, &spec.reference());
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let reference = self.parse_reference(spec)?;
        let blob = self
            .registry
            .pull_layer(&reference, auth, self.insecure(spec))
            .await?;

        let decoded = decode_yaml_or_json(&blob, &spec.reference())?;
        let canonical = serde_yaml::to_string(&decoded).map_err(|err| {
            Error::serialization(format!(
                "re-marshalling config layer {} failed: {err}",
                spec.reference()
            ))
        })?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&destination, canonical).await?;
        Ok(decoded)
    }

    fn insecure(&self, spec: &ImageSpec) -> bool {
        self.insecure_registry || spec.insecure
    }

    fn parse_reference(&self, spec: &ImageSpec) -> Result<Reference> {
        Reference::try_from(spec.reference())
            .map_err(|err| Error::registry(format!("invalid image reference {}: {err}", spec.reference())))
    }
}

/// Decode a blob as YAML, falling back to JSON. Empty blobs decode to null.
fn decode_yaml_or_json(blob: &[u8], reference: &str) -> Result<Value> {
    if blob.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Null);
    }
    serde_yaml::from_slice(blob)
        .or_else(|_| serde_json::from_slice(blob))
        .map_err(|err| {
            Error::serialization(format!("decoding config layer {reference} failed: {err}"))
        })
}

fn extract_archive(root: &Path, compressed: &[u8], reference: &str) -> Result<()> {
    std::fs::create_dir_all(root)?;
    let mut archive = tar::Archive::new(GzDecoder::new(compressed));
    let entries = archive
        .entries()
        .map_err(|err| Error::registry(format!("reading archive {reference} failed: {err}")))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|err| Error::registry(format!("reading archive {reference} failed: {err}")))?;
        let raw_path = entry
            .path()
            .map_err(|err| Error::registry(format!("archive {reference} has an invalid path: {err}")))?
            .to_string_lossy()
            .into_owned();
        let destination = clean_path_join(root, &raw_path)?;

        match entry.header().entry_type() {
            tar::EntryType::Directory => {
                std::fs::create_dir_all(&destination)?;
            }
            tar::EntryType::Regular => {
                if let Some(parent) = destination.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                std::fs::write(&destination, contents)?;
            }
            other => {
                return Err(Error::registry(format!(
                    "unsupported entry type {other:?} in archive {reference}"
                )));
            }
        }
    }
    Ok(())
}

/// Join an archive member path onto the extraction root, rejecting paths
/// that would escape it: `..` segments, absolute paths and `:` are illegal,
/// and backslash separators are normalized first.
pub fn clean_path_join(root: &Path, dest: &str) -> Result<PathBuf> {
    if dest.contains(':') {
        return Err(Error::registry(format!("archive path {dest:?} contains ':'")));
    }
    let normalized = dest.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(Error::registry(format!("archive path {dest:?} is absolute")));
    }
    let mut cleaned = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(Error::registry(format!("archive path {dest:?} contains '..'")));
            }
            part => cleaned.push(part),
        }
    }
    Ok(root.join(cleaned))
}

/// Turn a layer ref into a filesystem-safe directory component
fn sanitize_ref(ref_: &str) -> String {
    ref_.replace([':', '/'], "-")
}
