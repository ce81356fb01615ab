//! Derivation of lock identities from job options.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::payload::JobOptions;

/// Attribute name that expands to every option key.
pub const ALL_ATTRIBUTES: &str = "all";

/// Which option attributes, under which namespace, identify a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeySpec {
    pub namespace: String,
    pub attributes: Vec<String>,
}

impl LockKeySpec {
    pub fn new<I, A>(namespace: impl Into<String>, attributes: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            attributes: attributes.into_iter().map(Into::into).collect(),
        }
    }

    /// Attribute names actually hashed for `options`, sorted by name.
    ///
    /// An empty list and `["all"]` both mean "every key in the options".
    pub fn resolve_attributes(&self, options: &JobOptions) -> Vec<String> {
        let expand_all = self.attributes.is_empty()
            || (self.attributes.len() == 1 && self.attributes[0] == ALL_ATTRIBUTES);
        let mut keys: Vec<String> = if expand_all {
            options.keys().cloned().collect()
        } else {
            self.attributes.clone()
        };
        keys.sort();
        keys.dedup();
        keys
    }

    /// Deterministic hex digest identifying the lock for `options`.
    pub fn derive(&self, options: &JobOptions) -> String {
        let mut parts = vec![self.namespace.clone()];
        for key in self.resolve_attributes(options) {
            let value = options.get(&key).map(attribute_value).unwrap_or_default();
            parts.push(key);
            parts.push(value);
        }

        let mut hasher = Sha256::new();
        hasher.update(parts.join("-").as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// String form of an option value as it participates in a lock key.
fn attribute_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn options(value: Value) -> JobOptions {
        match value {
            Value::Object(map) => map,
            _ => JobOptions::new(),
        }
    }

    #[test]
    fn same_attributes_give_same_key_regardless_of_declaration_order() {
        let opts = options(json!({"account_id": 42, "user_id": "u1", "noise": true}));
        let a = LockKeySpec::new("Sync", ["account_id", "user_id"]).derive(&opts);
        let b = LockKeySpec::new("Sync", ["user_id", "account_id"]).derive(&opts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unrelated_options_do_not_change_key() {
        let spec = LockKeySpec::new("Sync", ["account_id"]);
        let a = spec.derive(&options(json!({"account_id": 42, "page": 1})));
        let b = spec.derive(&options(json!({"account_id": 42, "page": 2})));
        let c = spec.derive(&options(json!({"account_id": 43, "page": 1})));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn namespace_scopes_the_key() {
        let opts = options(json!({"account_id": 42}));
        let a = LockKeySpec::new("Sync", ["account_id"]).derive(&opts);
        let b = LockKeySpec::new("Export", ["account_id"]).derive(&opts);
        assert_ne!(a, b);
    }

    #[test]
    fn all_and_empty_expand_to_every_option() {
        let opts = options(json!({"b": 2, "a": 1}));
        let all = LockKeySpec::new("Ns", ["all"]);
        let empty = LockKeySpec::new("Ns", Vec::<String>::new());
        assert_eq!(all.resolve_attributes(&opts), vec!["a", "b"]);
        assert_eq!(all.derive(&opts), empty.derive(&opts));

        let changed = options(json!({"b": 3, "a": 1}));
        assert_ne!(all.derive(&opts), all.derive(&changed));
    }

    #[test]
    fn string_and_numeric_ids_hash_alike() {
        let spec = LockKeySpec::new("Ns", ["id"]);
        assert_eq!(
            spec.derive(&options(json!({"id": "7"}))),
            spec.derive(&options(json!({"id": 7})))
        );
        assert_eq!(
            spec.derive(&options(json!({"id": null}))),
            spec.derive(&options(json!({})))
        );
    }
}
