use sha2::{Digest, Sha256};
use sqlx::PgPool;

use crate::protocol::Platform;

#[derive(Debug, thiserror::Error)]
pub enum AgentAuthError {
    #[error("unknown agent")]
    UnknownAgent,

    #[error("invalid api key")]
    BadKey,

    #[error("agent registered for {expected}, claimed {claimed}")]
    PlatformMismatch { expected: String, claimed: String },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Generate an agent API key. Returns `(raw_key, sha256_hash)`; the raw
/// key is shown once to the operator, only the hash is stored.
/// Format: `ssp_agent_` + 32 random bytes as hex.
pub fn generate_agent_key() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::fill(&mut bytes);
    let raw = format!("ssp_agent_{}", hex::encode(bytes));
    let hash = hash_key(&raw);
    (raw, hash)
}

/// SHA-256 of a key string as lowercase hex.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a register frame's credentials against the `agents` row. The
/// claimed platform must match what the operator registered.
pub async fn verify_agent_key(
    pool: &PgPool,
    agent_id: &str,
    claimed_platform: Platform,
    api_key: &str,
) -> Result<(), AgentAuthError> {
    let row: Option<(String, String)> =
        sqlx::query_as("SELECT api_key_hash, platform FROM agents WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(pool)
            .await?;

    let (api_key_hash, platform) = row.ok_or(AgentAuthError::UnknownAgent)?;

    if hash_key(api_key) != api_key_hash {
        return Err(AgentAuthError::BadKey);
    }

    if platform != claimed_platform.as_str() {
        return Err(AgentAuthError::PlatformMismatch {
            expected: platform,
            claimed: claimed_platform.as_str().to_owned(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        let (raw, hash) = generate_agent_key();
        assert!(raw.starts_with("ssp_agent_"));
        assert_eq!(raw.len(), 10 + 64);
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("ssp_agent_abc"), hash_key("ssp_agent_abc"));
    }

    #[test]
    fn different_keys_different_hashes() {
        let (raw1, hash1) = generate_agent_key();
        let (raw2, hash2) = generate_agent_key();
        assert_ne!(raw1, raw2);
        assert_ne!(hash1, hash2);
    }
}
