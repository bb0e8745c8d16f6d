//! Chart flags: strvals parsing, formatting and fingerprinting
//!
//! Install configuration arrives as `key=value[,key=value]` strings where a
//! dotted key addresses a nested map, the syntax Helm uses for `--set`.
//! Flags are parsed into nested JSON maps once, up front; the fingerprint of
//! the parsed flags gates renderer re-initialization between reconciles.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Nested flag map
pub type Flags = Map<String, Value>;

/// The flag pair driving a single install
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartFlags {
    /// Renderer configuration flags (`clientConfig` in the config layer)
    #[serde(default)]
    pub config_flags: Flags,

    /// Chart value overrides (`overrides` in the config layer)
    #[serde(default)]
    pub set_flags: Flags,
}

impl ChartFlags {
    /// Parse both flag strings
    pub fn parse(client_config: &str, overrides: &str) -> Result<Self> {
        Ok(Self {
            config_flags: parse_strvals(client_config)?,
            set_flags: parse_strvals(overrides)?,
        })
    }

    /// Deterministic hash of the flag pair.
    ///
    /// `0` is reserved as the cache-miss sentinel of the renderer cache and
    /// never returned.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes).max(1)
    }
}

/// Parse a `key=value[,key=value]` string into a nested map.
///
/// Dotted keys nest (`a.b=c` becomes `{"a": {"b": "c"}}`); values are read
/// as booleans or integers when they parse as such, strings otherwise. An
/// empty input yields an empty map.
pub fn parse_strvals(input: &str) -> Result<Flags> {
    let mut flags = Flags::new();
    for pair in input.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::config(format!("flag entry {pair:?} is missing '='")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::config(format!("flag entry {pair:?} has an empty key")));
        }
        insert_path(&mut flags, key, parse_value(value.trim()))?;
    }
    Ok(flags)
}

/// Format a nested map back into `key=value[,key=value]` form.
///
/// The inverse of [`parse_strvals`]: parsing the output yields an equal map.
/// Keys come out in map order, which is sorted for the default JSON map.
pub fn format_strvals(flags: &Flags) -> String {
    let mut pairs = Vec::new();
    collect_pairs(flags, String::new(), &mut pairs);
    pairs.join(",")
}

fn collect_pairs(flags: &Flags, prefix: String, pairs: &mut Vec<String>) {
    for (key, value) in flags {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(nested) => collect_pairs(nested, path, pairs),
            Value::String(s) => pairs.push(format!("{path}={s}")),
            other => pairs.push(format!("{path}={other}")),
        }
    }
}

fn parse_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Value::Number(n.into());
    }
    Value::String(raw.to_string())
}

fn insert_path(flags: &mut Flags, path: &str, value: Value) -> Result<()> {
    let mut current = flags;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(Error::config(format!("flag key {path:?} has an empty segment")));
        }
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return Ok(());
        }
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Flags::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| Error::config(format!("flag key {path:?} nests under a scalar")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_scalars_and_nested_paths() {
        let flags = parse_strvals("namespace=istio-system,controller.replicas=2,wait=true").unwrap();
        assert_eq!(flags["namespace"], json!("istio-system"));
        assert_eq!(flags["controller"]["replicas"], json!(2));
        assert_eq!(flags["wait"], json!(true));
    }

    #[test]
    fn empty_input_yields_empty_map() {
        assert!(parse_strvals("").unwrap().is_empty());
        assert!(parse_strvals(" , ").unwrap().is_empty());
    }

    #[test]
    fn missing_equals_is_a_config_error() {
        assert!(matches!(
            parse_strvals("namespace").unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn scalar_under_nested_key_is_a_config_error() {
        assert!(matches!(
            parse_strvals("a=1,a.b=2").unwrap_err(),
            Error::Config(_)
        ));
    }

    #[test]
    fn parse_format_roundtrip_is_lossless() {
        let input = "controller.image.tag=v1.2.3,controller.replicas=3,createNamespace=true,namespace=edge";
        let flags = parse_strvals(input).unwrap();
        let formatted = format_strvals(&flags);
        let reparsed = parse_strvals(&formatted).unwrap();
        assert_eq!(flags, reparsed);
    }

    #[test]
    fn fingerprint_is_stable_and_flag_sensitive() {
        let one = ChartFlags::parse("Namespace=value1", "").unwrap();
        let same = ChartFlags::parse("Namespace=value1", "").unwrap();
        let other = ChartFlags::parse("Namespace=value2", "").unwrap();

        assert_eq!(one.fingerprint(), same.fingerprint());
        assert_ne!(one.fingerprint(), other.fingerprint());
        assert_ne!(one.fingerprint(), 0);
    }

    #[test]
    fn fingerprint_covers_both_flag_maps() {
        let config_only = ChartFlags::parse("wait=true", "").unwrap();
        let set_only = ChartFlags::parse("", "wait=true").unwrap();
        assert_ne!(config_only.fingerprint(), set_only.fingerprint());
    }
}
