//! Per-repository configuration, mirrored from the `config` table (§3.1) into typed
//! structs at repository open time.

use sea_orm::{DbBackend, Statement};
use serde::{Deserialize, Deserializer, Serialize};

use crate::db::RepoContext;
use crate::errors::FossilError;
use crate::hash::HashPolicy;

/// Which of the three check-in sidecar files (`manifest`, `manifest.uuid`,
/// `manifest.tags`) get written into the working checkout after a commit (§6.4).
///
/// The underlying `config.manifest` value is historically either a bare boolean
/// (`off` / `on`, meaning none or all three) or a string made of the letters
/// `r`, `u`, `t` naming exactly which ones to write.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManifestSidecars {
    pub raw: bool,
    pub uuid: bool,
    pub tags: bool,
}

impl ManifestSidecars {
    pub const ALL: ManifestSidecars = ManifestSidecars {
        raw: true,
        uuid: true,
        tags: true,
    };
    pub const NONE: ManifestSidecars = ManifestSidecars {
        raw: false,
        uuid: false,
        tags: false,
    };

    fn from_letters(s: &str) -> ManifestSidecars {
        let mut flags = ManifestSidecars::NONE;
        for ch in s.chars() {
            match ch {
                'r' => flags.raw = true,
                'u' => flags.uuid = true,
                't' => flags.tags = true,
                _ => {}
            }
        }
        flags
    }

    pub fn any(&self) -> bool {
        self.raw || self.uuid || self.tags
    }
}

fn deserialize_manifest_sidecars<'de, D>(deserializer: D) -> Result<ManifestSidecars, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrLetters {
        Bool(bool),
        Letters(String),
    }

    Ok(match BoolOrLetters::deserialize(deserializer)? {
        BoolOrLetters::Bool(true) => ManifestSidecars::ALL,
        BoolOrLetters::Bool(false) => ManifestSidecars::NONE,
        BoolOrLetters::Letters(s) => ManifestSidecars::from_letters(&s),
    })
}

/// Repository-wide settings that affect blob storage and manifest assembly.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepoConfig {
    /// Hash algorithm new artifacts are identified by. Existing content keeps whatever
    /// policy it was written under; this only governs new `put`/manifest-assembly calls.
    pub hash_policy: HashPolicy,

    /// `config.forbid-delta-manifests` — when set, the check-in engine never emits a
    /// delta-format commit manifest, always a baseline (§4.4.4).
    #[serde(default)]
    pub forbid_delta_manifests: bool,

    /// `config.manifest` — which sidecar files a commit writes into the checkout.
    #[serde(
        default,
        deserialize_with = "deserialize_manifest_sidecars_or_default"
    )]
    pub manifest_sidecars: ManifestSidecars,

    /// Glob patterns (fossil glob syntax) of paths always treated as binary, skipping
    /// content inspection during the warning pipeline (§4.4.3.1).
    #[serde(default)]
    pub binary_glob: Vec<String>,

    /// Glob patterns of paths exempt from the CRLF/mixed-line-ending warning.
    #[serde(default)]
    pub crnl_glob: Vec<String>,

    /// Glob patterns of paths exempt from the non-UTF-8 encoding warning.
    #[serde(default)]
    pub encoding_glob: Vec<String>,
}

fn deserialize_manifest_sidecars_or_default<'de, D>(
    deserializer: D,
) -> Result<ManifestSidecars, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_manifest_sidecars(deserializer)
}

impl RepoConfig {
    /// Load repository settings from the `config` table (§3.1). Rows that are absent keep
    /// their default. Applies `hash_policy` to the thread-local selector (§9) so subsequent
    /// `ArtifactHash::compute` calls on this thread match the repository's own convention.
    pub async fn load(ctx: &RepoContext) -> Result<RepoConfig, FossilError> {
        let mut cfg = RepoConfig::default();

        if let Some(value) = read_config_value(ctx, "hash-policy").await? {
            cfg.hash_policy = value.parse().map_err(FossilError::Integrity)?;
        }
        if let Some(value) = read_config_value(ctx, "forbid-delta-manifests").await? {
            cfg.forbid_delta_manifests = value == "1";
        }
        if let Some(value) = read_config_value(ctx, "manifest").await? {
            cfg.manifest_sidecars = match value.as_str() {
                "1" => ManifestSidecars::ALL,
                "0" => ManifestSidecars::NONE,
                letters => ManifestSidecars::from_letters(letters),
            };
        }
        if let Some(value) = read_config_value(ctx, "binary-glob").await? {
            cfg.binary_glob = split_glob_list(&value);
        }
        if let Some(value) = read_config_value(ctx, "crnl-glob").await? {
            cfg.crnl_glob = split_glob_list(&value);
        }
        if let Some(value) = read_config_value(ctx, "encoding-glob").await? {
            cfg.encoding_glob = split_glob_list(&value);
        }

        crate::hash::set_hash_policy(cfg.hash_policy);
        Ok(cfg)
    }
}

async fn read_config_value(ctx: &RepoContext, name: &str) -> Result<Option<String>, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT value FROM config WHERE name = ?",
            [name.into()],
        ))
        .await?;
    row.map(|r| r.try_get("", "value")).transpose().map_err(FossilError::Db)
}

/// Fossil glob-list settings are comma-separated; blank entries are dropped.
fn split_glob_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            hash_policy: HashPolicy::Sha1,
            forbid_delta_manifests: false,
            manifest_sidecars: ManifestSidecars::NONE,
            binary_glob: Vec::new(),
            crnl_glob: Vec::new(),
            encoding_glob: Vec::new(),
        }
    }
}

/// Knobs for a single check-in operation, layered over `RepoConfig` defaults and
/// overridable per call (the engine-level equivalent of command-line flags).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckinConfig {
    /// Commit even if the warning pipeline flags binary/CRLF/non-UTF8 content.
    pub allow_warnings: bool,

    /// Commit even if the tree is unchanged from its parent (normally rejected, §4.4.4).
    pub allow_empty: bool,

    /// Skip the fork guard (used for scripted/private-branch workflows, §4.4.4).
    pub allow_fork: bool,

    /// Skip the younger-than-ancestor guard (§4.4.5): allow a commit dated before its parent.
    pub allow_older_than_parent: bool,

    /// Mirrors `RepoConfig::forbid_delta_manifests` (§4.4.4): when set, the delta-form
    /// candidate is never chosen regardless of the `D*D < B*3-9` formula.
    pub forbid_delta_manifests: bool,

    /// Private check-in: not pushed to the public feed, no crosslink tag propagation.
    pub private: bool,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            allow_warnings: false,
            allow_empty: false,
            allow_fork: false,
            allow_older_than_parent: false,
            forbid_delta_manifests: false,
            private: false,
        }
    }
}
