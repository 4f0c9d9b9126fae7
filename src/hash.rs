//! Content hash utilities with a selectable algorithm (SHA-1 and SHA3-256).
//! The active policy is stored thread-locally; set once per repository open to match
//! that repository's `config.hash-policy` row (§3.1, §4.1.1).

use std::{cell::RefCell, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};
use sha1::Digest as _;
use sha3::Digest as _;

/// Supported hash algorithms for artifact identity. Selector only, no data attached.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize,
)]
pub enum HashPolicy {
    #[default]
    Sha1,
    Sha3_256,
}

impl HashPolicy {
    /// Byte length of the hash output.
    pub const fn size(&self) -> usize {
        match self {
            HashPolicy::Sha1 => 20,
            HashPolicy::Sha3_256 => 32,
        }
    }

    /// Hex string length of the hash output.
    pub const fn hex_len(&self) -> usize {
        match self {
            HashPolicy::Sha1 => 40,
            HashPolicy::Sha3_256 => 64,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            HashPolicy::Sha1 => "sha1",
            HashPolicy::Sha3_256 => "sha3-256",
        }
    }
}

impl Display for HashPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha1" => Ok(HashPolicy::Sha1),
            "sha3-256" | "sha3_256" => Ok(HashPolicy::Sha3_256),
            other => Err(format!("invalid hash policy: {other}")),
        }
    }
}

/// A concrete artifact hash value, one variant per supported algorithm.
///
/// This is the canonical identity of every row in `blob` (§3.1): two puts of identical bytes
/// under the same policy must compute equal `ArtifactHash`es.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub enum ArtifactHash {
    Sha1([u8; 20]),
    Sha3_256([u8; 32]),
}

impl Default for ArtifactHash {
    fn default() -> Self {
        ArtifactHash::Sha1([0u8; 20])
    }
}

impl Display for ArtifactHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_ref()))
    }
}

impl AsRef<[u8]> for ArtifactHash {
    fn as_ref(&self) -> &[u8] {
        match self {
            ArtifactHash::Sha1(bytes) => bytes.as_slice(),
            ArtifactHash::Sha3_256(bytes) => bytes.as_slice(),
        }
    }
}

impl FromStr for ArtifactHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.len() {
            40 => {
                let mut h = [0u8; 20];
                hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
                Ok(ArtifactHash::Sha1(h))
            }
            64 => {
                let mut h = [0u8; 32];
                hex::decode_to_slice(s, &mut h).map_err(|e| e.to_string())?;
                Ok(ArtifactHash::Sha3_256(h))
            }
            n => Err(format!("invalid hash length: {n}")),
        }
    }
}

impl ArtifactHash {
    /// Return the policy this hash was computed under.
    pub fn policy(&self) -> HashPolicy {
        match self {
            ArtifactHash::Sha1(_) => HashPolicy::Sha1,
            ArtifactHash::Sha3_256(_) => HashPolicy::Sha3_256,
        }
    }

    pub fn size(&self) -> usize {
        self.policy().size()
    }

    /// Compute the hash of `data` under the current thread-local policy.
    pub fn compute(data: &[u8]) -> ArtifactHash {
        Self::compute_with(get_hash_policy(), data)
    }

    /// Compute the hash of `data` under an explicit policy, bypassing the thread-local default.
    pub fn compute_with(policy: HashPolicy, data: &[u8]) -> ArtifactHash {
        match policy {
            HashPolicy::Sha1 => {
                let digest = sha1::Sha1::digest(data);
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(&digest);
                ArtifactHash::Sha1(bytes)
            }
            HashPolicy::Sha3_256 => {
                let digest = sha3::Sha3_256::digest(data);
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&digest);
                ArtifactHash::Sha3_256(bytes)
            }
        }
    }

}

thread_local! {
    /// Thread-local hash policy. Configured once per repository open so that different
    /// threads working against different repositories do not interfere with each other.
    static CURRENT_HASH_POLICY: RefCell<HashPolicy> = RefCell::new(HashPolicy::default());
}

pub fn set_hash_policy(policy: HashPolicy) {
    CURRENT_HASH_POLICY.with(|h| *h.borrow_mut() = policy);
}

pub fn get_hash_policy() -> HashPolicy {
    CURRENT_HASH_POLICY.with(|h| *h.borrow())
}

/// Guard that restores the previous thread-local policy when dropped.
pub struct HashPolicyGuard {
    prev: HashPolicy,
}

impl Drop for HashPolicyGuard {
    fn drop(&mut self) {
        set_hash_policy(self.prev);
    }
}

pub fn set_hash_policy_for_test(policy: HashPolicy) -> HashPolicyGuard {
    let prev = get_hash_policy();
    set_hash_policy(policy);
    HashPolicyGuard { prev }
}
