//! Artifact store behavior against a fake registry
//!
//! Covers the content-addressed cache fast paths, tar extraction safety and
//! the decoded-config fast path.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;

use manifest_operator::artifact::{ArtifactStore, RegistryClient};
use manifest_operator::crd::{ImageSpec, RefType};
use manifest_operator::error::{Error, Result};

/// Serves canned layer bytes and counts pulls
struct FakeRegistry {
    layer: Vec<u8>,
    pulls: AtomicUsize,
    fail: bool,
}

impl FakeRegistry {
    fn new(layer: Vec<u8>) -> Self {
        Self {
            layer,
            pulls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            layer: Vec::new(),
            pulls: AtomicUsize::new(0),
            fail: true,
        }
    }

    fn pull_count(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn pull_layer(
        &self,
        reference: &Reference,
        _auth: &RegistryAuth,
        _insecure: bool,
    ) -> Result<Vec<u8>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::registry(format!(
                "pulling layer {reference:?} failed: no such host"
            )));
        }
        Ok(self.layer.clone())
    }
}

fn chart_spec(name: &str) -> ImageSpec {
    ImageSpec {
        repo: "registry.example.com/components".to_string(),
        name: name.to_string(),
        ref_: "sha256:1111111111111111111111111111111111111111111111111111111111111111"
            .to_string(),
        type_: Some(RefType::OciRef),
        ..Default::default()
    }
}

fn tar_gz(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    let tarball = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tarball).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn extraction_is_cached_by_image_identity() {
    let layer = tar_gz(&[
        ("Chart.yaml", "name: sample\nversion: 0.1.0\n"),
        ("templates/deployment.yaml", "kind: Deployment\n"),
    ]);
    let registry = Arc::new(FakeRegistry::new(layer));
    let root = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(root.path(), registry.clone(), false);

    let spec = chart_spec("sample");
    let path = store
        .extract_tar_gz(&spec, &RegistryAuth::Anonymous)
        .await
        .unwrap();

    assert!(path.join("Chart.yaml").exists());
    assert!(path.join("templates/deployment.yaml").exists());
    assert_eq!(registry.pull_count(), 1);

    // a second Manifest with the identical image spec reuses the directory
    let again = store
        .extract_tar_gz(&spec, &RegistryAuth::Anonymous)
        .await
        .unwrap();
    assert_eq!(path, again);
    assert_eq!(registry.pull_count(), 1);
}

#[tokio::test]
async fn unresolvable_registry_leaves_no_partial_extraction() {
    let registry = Arc::new(FakeRegistry::failing());
    let root = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(root.path(), registry.clone(), false);

    let spec = ImageSpec {
        repo: "invalid.com".to_string(),
        ..chart_spec("sample")
    };
    let err = store
        .extract_tar_gz(&spec, &RegistryAuth::Anonymous)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Registry(_)));

    assert!(!store.chart_dir(&spec).exists());
}

#[tokio::test]
async fn escaping_archive_entries_are_rejected() {
    let layer = tar_gz(&[("legit.yaml", "kind: ConfigMap\n")]);

    // hand-build a tarball with a traversal entry; append_data would refuse
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    let content = b"owned";
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    {
        let name = b"../outside.txt\0";
        let gnu = header.as_gnu_mut().unwrap();
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_cksum();
    builder.append(&header, content.as_slice()).unwrap();
    let tarball = builder.into_inner().unwrap();
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tarball).unwrap();
    let evil_layer = encoder.finish().unwrap();

    let root = tempfile::tempdir().unwrap();

    let store = ArtifactStore::new(root.path(), Arc::new(FakeRegistry::new(evil_layer)), false);
    let err = store
        .extract_tar_gz(&chart_spec("evil"), &RegistryAuth::Anonymous)
        .await
        .unwrap_err();
    assert!(err.to_string().contains(".."));
    assert!(!root.path().join("outside.txt").exists());

    // the benign layer still extracts under the same root
    let store = ArtifactStore::new(root.path(), Arc::new(FakeRegistry::new(layer)), false);
    store
        .extract_tar_gz(&chart_spec("legit"), &RegistryAuth::Anonymous)
        .await
        .unwrap();
}

#[tokio::test]
async fn config_layers_decode_once_and_persist() {
    let config = "configs:\n- name: nginx\n  clientConfig: namespace=edge\n  overrides: a=1\n";
    let registry = Arc::new(FakeRegistry::new(config.as_bytes().to_vec()));
    let root = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(root.path(), registry.clone(), false);

    let spec = chart_spec("config");
    let decoded = store
        .decode_yaml_layer(&spec, &RegistryAuth::Anonymous)
        .await
        .unwrap();
    assert_eq!(decoded["configs"][0]["name"], "nginx");
    assert!(store.config_file(&spec).exists());
    assert_eq!(registry.pull_count(), 1);

    let redecoded = store
        .decode_yaml_layer(&spec, &RegistryAuth::Anonymous)
        .await
        .unwrap();
    assert_eq!(decoded, redecoded);
    assert_eq!(registry.pull_count(), 1, "second decode must read from disk");
}

#[tokio::test]
async fn empty_config_layer_decodes_to_null() {
    let registry = Arc::new(FakeRegistry::new(Vec::new()));
    let root = tempfile::tempdir().unwrap();
    let store = ArtifactStore::new(root.path(), registry, false);

    let decoded = store
        .decode_yaml_layer(&chart_spec("empty"), &RegistryAuth::Anonymous)
        .await
        .unwrap();
    assert!(decoded.is_null());
}
