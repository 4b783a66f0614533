//! Store key derivation: caller fingerprinting and scope sanitization.

use sha2::{Digest, Sha256};

/// Hex SHA-256 fingerprint of the caller key. Raw identities (IPs, user
/// ids, API keys) never appear in store keys or logs.
pub fn key_fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sanitize a scope string for use inside a store key: every byte that is
/// whitespace, a control character, `:`, `|`, `/`, `\`, or non-ASCII
/// becomes `_`. An empty scope becomes `default`.
pub fn sanitize_scope(scope: &str) -> String {
    if scope.is_empty() {
        return "default".to_string();
    }

    scope
        .bytes()
        .map(|b| {
            let c = b as char;
            if !b.is_ascii()
                || c.is_ascii_control()
                || c.is_ascii_whitespace()
                || matches!(c, ':' | '|' | '/' | '\\')
            {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// The three store keys of one `(policy, scope, keyHash)` triple
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    pub bucket: String,
    pub block: String,
    pub violation: String,
}

/// Assemble the store keys. `scope_key` and `key_hash` must already be
/// sanitized.
pub fn store_keys(prefix: &str, policy: &str, scope_key: &str, key_hash: &str) -> StoreKeys {
    StoreKeys {
        bucket: format!("{}:bucket:{}:{}:{}", prefix, policy, scope_key, key_hash),
        block: format!("{}:block:{}:{}:{}", prefix, policy, scope_key, key_hash),
        violation: format!("{}:viol:{}:{}:{}", prefix, policy, scope_key, key_hash),
    }
}
