//! Counter key generation.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Which side of the service a rule protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Ingress => write!(f, "ingress"),
            Direction::Egress => write!(f, "egress"),
        }
    }
}

/// Everything that distinguishes one counter from another.
///
/// The key is composed of the configuration namespace, the direction and the
/// rule's matching dimensions, serialized in a fixed order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    /// Configuration namespace shared by all rules of one service
    pub namespace: String,
    /// Ingress or egress
    pub direction: Direction,
    /// Ordered `(dimension, value)` pairs
    pub entries: Vec<(String, String)>,
}

impl DescriptorKey {
    pub fn new(namespace: &str, direction: Direction) -> Self {
        Self {
            namespace: namespace.to_string(),
            direction,
            entries: Vec::new(),
        }
    }

    /// Append a dimension. Order matters.
    pub fn with(mut self, name: &str, value: impl Into<String>) -> Self {
        self.entries.push((name.to_string(), value.into()));
        self
    }

    /// Convert the descriptor key to a string representation.
    ///
    /// Values are length-prefixed so no choice of values can make two
    /// different descriptors serialize identically.
    pub fn to_string_key(&self) -> String {
        let entries_str: Vec<String> = self
            .entries
            .iter()
            .map(|(k, v)| format!("{}={}:{}", k, v.len(), v))
            .collect();

        format!(
            "{}:{}|{}|{}",
            self.namespace.len(),
            self.namespace,
            self.direction,
            entries_str.join(",")
        )
    }

    /// Short, opaque storage key: SHA-256 of the string key, base64url.
    pub fn digest(&self) -> String {
        let hash = Sha256::digest(self.to_string_key().as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}

impl fmt::Display for DescriptorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_key_to_string() {
        let key = DescriptorKey::new("svc", Direction::Ingress).with("uri", "/a");
        assert_eq!(key.to_string_key(), "3:svc|ingress|uri=2:/a");
    }

    #[test]
    fn test_digest_is_stable() {
        let a = DescriptorKey::new("svc", Direction::Egress).with("method", "GET");
        let b = DescriptorKey::new("svc", Direction::Egress).with("method", "GET");

        assert_eq!(a.digest(), b.digest());
        // 32 bytes in unpadded base64url
        assert_eq!(a.digest().len(), 43);
    }

    #[test]
    fn test_digest_changes_with_any_dimension() {
        let base = DescriptorKey::new("svc", Direction::Ingress).with("uri", "/a");

        assert_ne!(
            base.digest(),
            DescriptorKey::new("svc", Direction::Egress).with("uri", "/a").digest()
        );
        assert_ne!(
            base.digest(),
            DescriptorKey::new("other", Direction::Ingress).with("uri", "/a").digest()
        );
        assert_ne!(base.digest(), base.clone().with("identity", "").digest());
    }

    #[test]
    fn test_value_boundaries_do_not_collide() {
        let a = DescriptorKey::new("n", Direction::Ingress).with("x", "a,y=b");
        let b = DescriptorKey::new("n", Direction::Ingress)
            .with("x", "a")
            .with("y", "b");
        assert_ne!(a.to_string_key(), b.to_string_key());
    }
}
