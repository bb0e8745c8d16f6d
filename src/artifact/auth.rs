//! Registry authentication from label-selected pull secrets

use std::collections::HashMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use oci_distribution::secrets::RegistryAuth;

use crate::crd::ImageSpec;
use crate::error::{Error, Result};

/// Registry credentials collected from pull secrets.
///
/// An empty keychain resolves every registry to anonymous auth.
#[derive(Clone, Debug, Default)]
pub struct Keychain {
    auths: HashMap<String, (String, String)>,
}

impl Keychain {
    /// Auth method for the given registry host
    pub fn resolve(&self, registry: &str) -> RegistryAuth {
        match self.auths.get(registry) {
            Some((user, password)) => RegistryAuth::Basic(user.clone(), password.clone()),
            None => RegistryAuth::Anonymous,
        }
    }

    /// Number of registries with credentials
    pub fn len(&self) -> usize {
        self.auths.len()
    }

    /// True when no credentials were collected
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    fn absorb_secret(&mut self, secret: &Secret) {
        let Some(data) = &secret.data else { return };
        for payload in data.values() {
            let Ok(config) = serde_json::from_slice::<serde_json::Value>(&payload.0) else {
                continue;
            };
            let Some(auths) = config.get("auths").and_then(|a| a.as_object()) else {
                continue;
            };
            for (registry, creds) in auths {
                let user = creds.get("username").and_then(|u| u.as_str());
                let password = creds.get("password").and_then(|p| p.as_str());
                if let (Some(user), Some(password)) = (user, password) {
                    self.auths
                        .insert(registry.clone(), (user.to_string(), password.to_string()));
                }
            }
        }
    }
}

/// Build the keychain for an image.
///
/// Without a credential selector the ambient (anonymous) keychain is
/// returned. With one, all matching secrets in the namespace contribute
/// their dockerconfigjson payloads; a selector that matches nothing is a
/// hard failure so a typo never degrades silently to anonymous pulls.
pub async fn keychain_for(
    client: &kube::Client,
    namespace: &str,
    spec: &ImageSpec,
) -> Result<Keychain> {
    let Some(selector) = &spec.cred_secret_selector else {
        return Ok(Keychain::default());
    };

    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(&selector_string(selector)?);
    let matched = secrets.list(&params).await?;
    if matched.items.is_empty() {
        return Err(Error::NoAuthSecretFound);
    }

    let mut keychain = Keychain::default();
    for secret in &matched.items {
        keychain.absorb_secret(secret);
    }
    Ok(keychain)
}

/// Convert a LabelSelector into the string form the list API accepts
fn selector_string(selector: &LabelSelector) -> Result<String> {
    let mut terms = Vec::new();
    if let Some(labels) = &selector.match_labels {
        for (key, value) in labels {
            terms.push(format!("{key}={value}"));
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let values = expr.values.as_deref().unwrap_or_default().join(",");
            match expr.operator.as_str() {
                "In" => terms.push(format!("{} in ({values})", expr.key)),
                "NotIn" => terms.push(format!("{} notin ({values})", expr.key)),
                "Exists" => terms.push(expr.key.clone()),
                "DoesNotExist" => terms.push(format!("!{}", expr.key)),
                other => {
                    return Err(Error::auth(format!(
                        "unsupported label selector operator {other:?}"
                    )));
                }
            }
        }
    }
    Ok(terms.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn docker_config_secret(registry: &str, user: &str, password: &str) -> Secret {
        let payload = serde_json::json!({
            "auths": { registry: { "username": user, "password": password } }
        });
        let mut data = BTreeMap::new();
        data.insert(
            ".dockerconfigjson".to_string(),
            ByteString(serde_json::to_vec(&payload).unwrap()),
        );
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn keychain_resolves_known_registry_to_basic_auth() {
        let mut keychain = Keychain::default();
        keychain.absorb_secret(&docker_config_secret("registry.example.com", "bob", "hunter2"));

        match keychain.resolve("registry.example.com") {
            RegistryAuth::Basic(user, password) => {
                assert_eq!(user, "bob");
                assert_eq!(password, "hunter2");
            }
            RegistryAuth::Anonymous => panic!("expected basic auth"),
        }
        assert!(matches!(
            keychain.resolve("other.example.com"),
            RegistryAuth::Anonymous
        ));
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        let mut data = BTreeMap::new();
        data.insert("junk".to_string(), ByteString(b"not json".to_vec()));
        let mut keychain = Keychain::default();
        keychain.absorb_secret(&Secret {
            data: Some(data),
            ..Default::default()
        });
        assert!(keychain.is_empty());
    }

    #[test]
    fn selector_string_covers_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "purpose".to_string(),
                "registry-auth".to_string(),
            )])),
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["prod".to_string(), "stage".to_string()]),
            }]),
        };
        let rendered = selector_string(&selector).unwrap();
        assert!(rendered.contains("purpose=registry-auth"));
        assert!(rendered.contains("env in (prod,stage)"));
    }

    #[test]
    fn unknown_operator_is_an_auth_error() {
        let selector = LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "env".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
            ..Default::default()
        };
        assert!(matches!(
            selector_string(&selector).unwrap_err(),
            Error::Auth(_)
        ));
    }
}
