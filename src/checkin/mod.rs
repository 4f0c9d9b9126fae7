//! Check-in engine (§4.4): validate a working tree, assemble a new commit manifest, store
//! it, and update checkout state. This is the hardest subsystem; most of the value here is
//! the pre-commit guards and the atomic two-phase checksum verification.
//!
//! No single file grounds this module directly; the `WarningPolicy`/`ContentWarning` seam
//! follows the same trait-at-the-seam idiom as `ObjectTrait`, and binary/BOM detection reuses
//! the same `encoding_rs`/`memchr` choices used elsewhere for this class of byte inspection.

pub mod assemble;
pub mod status;
pub mod warnings;

use chrono::{DateTime, Utc};
use sea_orm::{DbBackend, Statement};
use tracing::info;

use crate::blobstore;
use crate::config::CheckinConfig;
use crate::crosslink;
use crate::db::RepoContext;
use crate::errors::FossilError;
use crate::hash::ArtifactHash;
use crate::manifest::{CherryPick, CommitManifest, FileEntry, TagCard};

use assemble::{choose_manifest_form, ManifestChoice, ManifestChoiceForce};

/// Build the delta-form candidate's F-card list (§4.4.4): files whose hash changed or are new
/// relative to `parent_tree`, plus a removal entry (`hash: None`) for every path present in
/// `parent_tree` but absent from `full_tree`.
fn diff_against_baseline(full_tree: &[FileEntry], parent_tree: &[FileEntry]) -> Vec<FileEntry> {
    let mut out = Vec::new();
    for entry in full_tree {
        match parent_tree.iter().find(|p| p.path == entry.path) {
            Some(prev) if prev.hash == entry.hash && prev.perm == entry.perm => {}
            _ => out.push(entry.clone()),
        }
    }
    for prev in parent_tree {
        if !full_tree.iter().any(|e| e.path == prev.path) {
            out.push(FileEntry {
                path: prev.path.clone(),
                hash: None,
                perm: prev.perm,
                old_path: None,
            });
        }
    }
    out
}

/// Selection mode for which tracked files participate in a commit (§4.4.2).
pub enum Selection {
    Full,
    Partial(Vec<String>),
}

/// Validate a partial selection: rejects partial commits of a merge, and partial selections
/// that split a rename pair.
pub fn validate_selection(
    selection: &Selection,
    renames: &[(String, String)],
    is_merge: bool,
) -> Result<(), FossilError> {
    if let Selection::Partial(paths) = selection {
        if is_merge {
            return Err(FossilError::Conflict(
                "a partial commit of a merge is not allowed".into(),
            ));
        }
        for (old_path, new_path) in renames {
            let src_selected = paths.contains(old_path);
            let dst_selected = paths.contains(new_path);
            if src_selected != dst_selected {
                return Err(FossilError::Conflict(format!(
                    "partial commit splits rename pair {old_path} -> {new_path}"
                )));
            }
        }
    }
    Ok(())
}

/// Everything the guards (§4.4.5) and manifest assembly need to know about the commit being
/// attempted, gathered ahead of time by the caller (working-tree scanning itself is an
/// out-of-scope filesystem concern, §1).
pub struct CommitRequest {
    pub parent_hash: Option<ArtifactHash>,
    pub parent_date: Option<DateTime<Utc>>,
    pub parent_is_leaf: bool,
    pub parent_is_closed: bool,
    pub starts_new_branch: bool,
    pub is_merge: bool,
    /// Complete F-card list of the new commit (not just the files touched by this commit).
    pub files: Vec<FileEntry>,
    /// The nearest baseline ancestor's hash and its complete F-card list, used to build the
    /// delta-form candidate (§4.4.4). `None` for an initial commit or when the parent chain
    /// has no baseline to delta against.
    pub parent_baseline: Option<(ArtifactHash, Vec<FileEntry>)>,
    pub manifest_choice_force: Option<ManifestChoiceForce>,
    pub tags: Vec<TagCard>,
    pub cherrypicks: Vec<CherryPick>,
    pub comment: String,
    pub user: String,
    pub date: DateTime<Utc>,
}

fn fork_guard(req: &CommitRequest, allow_fork: bool) -> Result<(), FossilError> {
    if req.parent_hash.is_none() {
        return Ok(()); // initial commit, no parent to fork from
    }
    if !req.parent_is_leaf && !req.starts_new_branch && !allow_fork {
        return Err(FossilError::Conflict(
            "parent is not a branch leaf; use allow-fork or --branch".into(),
        ));
    }
    Ok(())
}

fn closed_leaf_guard(req: &CommitRequest) -> Result<(), FossilError> {
    if req.parent_is_closed && !req.starts_new_branch {
        return Err(FossilError::Conflict(
            "parent carries the closed tag; cannot commit to a closed leaf".into(),
        ));
    }
    Ok(())
}

fn younger_than_ancestor_guard(req: &CommitRequest, allow_older: bool) -> Result<(), FossilError> {
    if allow_older {
        return Ok(());
    }
    if let Some(parent_date) = req.parent_date {
        if req.date < parent_date {
            return Err(FossilError::Conflict(
                "commit date is older than its parent's".into(),
            ));
        }
    }
    Ok(())
}

fn empty_commit_guard(req: &CommitRequest, allow_empty: bool) -> Result<(), FossilError> {
    if allow_empty {
        return Ok(());
    }
    if req.files.is_empty() && !req.is_merge && req.tags.is_empty() && req.cherrypicks.is_empty() {
        return Err(FossilError::Conflict(
            "commit has no file, merge, or tag changes".into(),
        ));
    }
    Ok(())
}

/// `user(name, cap, mtime)` existence check (§4.4.5.1). Full capability management is out of
/// scope; this table exists only so the user-exists guard has something real to query.
pub async fn ensure_user(ctx: &RepoContext, name: &str) -> Result<(), FossilError> {
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT OR IGNORE INTO user(name, cap, mtime) VALUES (?, '', 0)",
        [name.into()],
    ))
    .await?;
    Ok(())
}

pub async fn user_exists(ctx: &RepoContext, name: &str) -> Result<bool, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT name FROM user WHERE name = ?",
            [name.into()],
        ))
        .await?;
    Ok(row.is_some())
}

async fn user_exists_guard(ctx: &RepoContext, name: &str) -> Result<(), FossilError> {
    if !user_exists(ctx, name).await? {
        return Err(FossilError::Conflict(format!(
            "committing user {name:?} is not registered"
        )));
    }
    Ok(())
}

/// Run every pre-commit guard (§4.4.5) against an already-assembled request.
pub async fn run_guards(
    ctx: &RepoContext,
    req: &CommitRequest,
    cfg: &CheckinConfig,
) -> Result<(), FossilError> {
    fork_guard(req, cfg.allow_fork)?;
    closed_leaf_guard(req)?;
    younger_than_ancestor_guard(req, cfg.allow_older_than_parent)?;
    empty_commit_guard(req, cfg.allow_empty)?;
    user_exists_guard(ctx, &req.user).await?;
    Ok(())
}

/// Recompute the R-card (MD5 over the reconstructed tree) from a set of (path, content)
/// pairs sorted by path, matching the manifest's own F-card ordering.
pub fn compute_tree_checksum(files: &[(String, Vec<u8>)]) -> String {
    use md5::Digest as _;

    let mut sorted = files.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    let mut hasher = md5::Md5::default();
    for (_, content) in &sorted {
        hasher.update(content);
    }
    hex::encode(hasher.finalize())
}

/// Assemble, verify, and atomically store a new commit (§4.4.6). Two checksum verifications
/// run before the transaction commits: the R-card computed from the caller-supplied on-disk
/// tree contents must match the R-card recomputed from the stored blobs of the manifest's own
/// F-cards, and both must match the value written into the manifest.
pub async fn commit(
    ctx: &RepoContext,
    req: CommitRequest,
    disk_tree: &[(String, Vec<u8>)],
    cfg: &CheckinConfig,
) -> Result<(i64, ArtifactHash), FossilError> {
    run_guards(ctx, &req, cfg).await?;

    let parents = req.parent_hash.clone().into_iter().collect::<Vec<_>>();
    let tree_checksum_from_disk = compute_tree_checksum(disk_tree);

    let baseline_candidate = CommitManifest {
        baseline: None,
        comment: bstr::BString::from(req.comment.clone()),
        date: req.date,
        files: req.files.clone(),
        mimetype: None,
        parents: parents.clone(),
        cherrypicks: req.cherrypicks.clone(),
        checksum: Some(tree_checksum_from_disk.clone()),
        tags: req.tags.clone(),
        user: req.user.clone(),
    };

    // Build the delta-form candidate (§4.4.4) only when there's a baseline ancestor to delta
    // against; an initial commit always gets the baseline form.
    let manifest = match &req.parent_baseline {
        Some((baseline_hash, parent_tree)) => {
            let delta_files = diff_against_baseline(&req.files, parent_tree);
            let delta_candidate = CommitManifest {
                baseline: Some(baseline_hash.clone()),
                files: delta_files,
                ..baseline_candidate.clone()
            };
            match choose_manifest_form(
                &baseline_candidate,
                &delta_candidate,
                req.manifest_choice_force,
                cfg.forbid_delta_manifests,
            ) {
                ManifestChoice::Baseline => baseline_candidate,
                ManifestChoice::Delta => delta_candidate,
            }
        }
        None => baseline_candidate,
    };

    let mut reconstructed: Vec<(String, Vec<u8>)> = Vec::with_capacity(req.files.len());
    for entry in &req.files {
        let Some(hash) = &entry.hash else {
            continue;
        };
        let rid = blobstore::rid_for_hash(ctx, hash).await?.ok_or_else(|| {
            FossilError::Integrity(format!(
                "F-card {} references hash {hash} with no stored blob",
                entry.path
            ))
        })?;
        let content = blobstore::get(ctx, rid).await?;
        reconstructed.push((entry.path.to_string(), content));
    }
    let tree_checksum_from_repo = compute_tree_checksum(&reconstructed);

    if tree_checksum_from_disk != tree_checksum_from_repo {
        return Err(FossilError::Integrity(
            "R-card mismatch between disk tree and repository reconstruction".into(),
        ));
    }
    if manifest.checksum.as_deref() != Some(tree_checksum_from_disk.as_str()) {
        return Err(FossilError::Integrity(
            "R-card mismatch between manifest and recomputed checksum".into(),
        ));
    }

    let bytes = manifest.encode();
    let hash = ArtifactHash::compute(&bytes);

    ctx.begin().await?;
    let result: Result<i64, FossilError> = async {
        let rid = crosslink::store_and_apply(ctx, &bytes, cfg.private).await?;
        if !cfg.private {
            crosslink::end(ctx, false, &[]).await?;
        }
        ctx.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT OR REPLACE INTO vvar(name, value) VALUES ('checkout', ?)",
            [rid.to_string().into()],
        ))
        .await?;
        ctx.execute(Statement::from_string(
            DbBackend::Sqlite,
            "DELETE FROM vmerge".to_owned(),
        ))
        .await?;
        ctx.execute(Statement::from_string(
            DbBackend::Sqlite,
            "UPDATE vfile SET chnged = 0, deleted = 0, origname = NULL, rid = mrid".to_owned(),
        ))
        .await?;
        Ok(rid)
    }
    .await;

    match result {
        Ok(rid) => {
            ctx.commit().await?;
            info!(rid, %hash, files = manifest.files.len(), "check-in committed");
            Ok((rid, hash))
        }
        Err(e) => {
            ctx.rollback().await?;
            Err(e)
        }
    }
}

/// Store a single file's content via the blob store, running the warning pipeline first, and
/// deltifying against the parent version when that shrinks storage (§4.4.3).
pub async fn ingest_file(
    ctx: &RepoContext,
    content: &[u8],
    parent_rid: Option<i64>,
    policy: &dyn warnings::WarningPolicy,
    allow_conflict: bool,
) -> Result<ArtifactHash, FossilError> {
    use warnings::{ContentWarning, WarningDecision};

    let mut content = content.to_vec();

    if warnings::looks_binary(&content) {
        match policy.decide(ContentWarning::Binary) {
            WarningDecision::Abort => {
                return Err(FossilError::WarningDeclined("binary content".into()));
            }
            WarningDecision::Convert => content = warnings::convert_to_utf8_lf(&content),
            WarningDecision::Continue => {}
        }
    } else {
        if warnings::has_mixed_line_endings(&content) {
            match policy.decide(ContentWarning::MixedLineEndings) {
                WarningDecision::Abort => {
                    return Err(FossilError::WarningDeclined("mixed line endings".into()));
                }
                WarningDecision::Convert => content = warnings::convert_to_utf8_lf(&content),
                WarningDecision::Continue => {}
            }
        }
        if warnings::is_non_utf8(&content) {
            match policy.decide(ContentWarning::NonUtf8) {
                WarningDecision::Abort => {
                    return Err(FossilError::WarningDeclined("non-UTF-8 content".into()));
                }
                WarningDecision::Convert => content = warnings::convert_to_utf8_lf(&content),
                WarningDecision::Continue => {}
            }
        }
    }

    if !allow_conflict && memchr::memmem::find(&content, b"<<<<<<<").is_some() {
        return Err(FossilError::Conflict(
            "selected file contains a merge-conflict marker".into(),
        ));
    }

    let rid = blobstore::put(ctx, &content, false, None).await?;
    if let Some(parent_rid) = parent_rid {
        blobstore::deltify(ctx, rid, parent_rid, false).await?;
    }

    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT hash FROM blob WHERE rid = ?",
            [rid.into()],
        ))
        .await?
        .ok_or_else(|| FossilError::NotFound(format!("rid {rid}")))?;
    let hash_str: String = row.try_get("", "hash")?;
    hash_str.parse().map_err(FossilError::Integrity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Catalog;
    use crate::manifest::Perm;

    async fn fresh_ctx() -> RepoContext {
        let catalog = Catalog::open_in_memory().await.unwrap();
        RepoContext::new(&catalog)
    }

    fn base_request(user: &str) -> CommitRequest {
        CommitRequest {
            parent_hash: None,
            parent_date: None,
            parent_is_leaf: true,
            parent_is_closed: false,
            starts_new_branch: false,
            is_merge: false,
            files: vec![FileEntry {
                path: bstr::BString::from("a.txt"),
                hash: Some(ArtifactHash::compute(b"hello")),
                perm: Perm::Regular,
                old_path: None,
            }],
            parent_baseline: None,
            manifest_choice_force: None,
            tags: vec![],
            cherrypicks: vec![],
            comment: "first commit".to_string(),
            user: user.to_string(),
            date: "2024-01-01T00:00:00.000"
                .parse::<chrono::NaiveDateTime>()
                .unwrap()
                .and_utc(),
        }
    }

    #[tokio::test]
    async fn commit_fails_without_registered_user() {
        let ctx = fresh_ctx().await;
        let req = base_request("alice");
        let tree = vec![("a.txt".to_string(), b"hello".to_vec())];
        let cfg = CheckinConfig::default();
        let err = commit(&ctx, req, &tree, &cfg).await.unwrap_err();
        assert!(matches!(err, FossilError::Conflict(_)));
    }

    #[tokio::test]
    async fn commit_succeeds_once_user_registered() {
        let ctx = fresh_ctx().await;
        ensure_user(&ctx, "alice").await.unwrap();
        blobstore::put(&ctx, b"hello", false, None).await.unwrap();
        let req = base_request("alice");
        let tree = vec![("a.txt".to_string(), b"hello".to_vec())];
        let cfg = CheckinConfig::default();
        let (rid, _hash) = commit(&ctx, req, &tree, &cfg).await.unwrap();
        assert!(rid > 0);
    }

    #[tokio::test]
    async fn commit_rejects_f_card_with_no_stored_blob() {
        let ctx = fresh_ctx().await;
        ensure_user(&ctx, "alice").await.unwrap();
        let req = base_request("alice");
        let tree = vec![("a.txt".to_string(), b"hello".to_vec())];
        let cfg = CheckinConfig::default();
        let err = commit(&ctx, req, &tree, &cfg).await.unwrap_err();
        assert!(matches!(err, FossilError::Integrity(_)));
    }

    #[tokio::test]
    async fn empty_commit_rejected_without_allow_empty() {
        let ctx = fresh_ctx().await;
        ensure_user(&ctx, "alice").await.unwrap();
        let mut req = base_request("alice");
        req.files.clear();
        let cfg = CheckinConfig::default();
        let err = commit(&ctx, req, &[], &cfg).await.unwrap_err();
        assert!(matches!(err, FossilError::Conflict(_)));
    }

    #[test]
    fn rename_pair_split_is_rejected() {
        let selection = Selection::Partial(vec!["new.txt".to_string()]);
        let renames = vec![("old.txt".to_string(), "new.txt".to_string())];
        let err = validate_selection(&selection, &renames, false).unwrap_err();
        assert!(matches!(err, FossilError::Conflict(_)));
    }

    #[test]
    fn partial_commit_of_merge_is_rejected() {
        let selection = Selection::Partial(vec!["a.txt".to_string()]);
        let err = validate_selection(&selection, &[], true).unwrap_err();
        assert!(matches!(err, FossilError::Conflict(_)));
    }

    #[test]
    fn diff_against_baseline_includes_changed_new_and_removed() {
        let parent = vec![
            FileEntry {
                path: bstr::BString::from("unchanged.txt"),
                hash: Some(ArtifactHash::compute(b"same")),
                perm: Perm::Regular,
                old_path: None,
            },
            FileEntry {
                path: bstr::BString::from("edited.txt"),
                hash: Some(ArtifactHash::compute(b"old")),
                perm: Perm::Regular,
                old_path: None,
            },
            FileEntry {
                path: bstr::BString::from("removed.txt"),
                hash: Some(ArtifactHash::compute(b"gone")),
                perm: Perm::Regular,
                old_path: None,
            },
        ];
        let full = vec![
            parent[0].clone(),
            FileEntry {
                path: bstr::BString::from("edited.txt"),
                hash: Some(ArtifactHash::compute(b"new")),
                perm: Perm::Regular,
                old_path: None,
            },
            FileEntry {
                path: bstr::BString::from("added.txt"),
                hash: Some(ArtifactHash::compute(b"added")),
                perm: Perm::Regular,
                old_path: None,
            },
        ];
        let delta = diff_against_baseline(&full, &parent);
        assert_eq!(delta.len(), 3);
        assert!(delta.iter().any(|f| f.path == "edited.txt" && f.hash.is_some()));
        assert!(delta.iter().any(|f| f.path == "added.txt" && f.hash.is_some()));
        assert!(delta.iter().any(|f| f.path == "removed.txt" && f.hash.is_none()));
        assert!(!delta.iter().any(|f| f.path == "unchanged.txt"));
    }

    #[tokio::test]
    async fn commit_picks_delta_form_when_formula_favors_it() {
        let ctx = fresh_ctx().await;
        ensure_user(&ctx, "alice").await.unwrap();

        // A large baseline (10 files) with only one changed file: D=2 (1 changed + B-card),
        // B=10, so D*D=4 < B*3-9=21 and the delta form should win.
        let parent_tree: Vec<FileEntry> = (0..10)
            .map(|i| FileEntry {
                path: bstr::BString::from(format!("f{i}.txt")),
                hash: Some(ArtifactHash::compute(format!("content{i}").as_bytes())),
                perm: Perm::Regular,
                old_path: None,
            })
            .collect();
        let mut full_tree = parent_tree.clone();
        full_tree[0] = FileEntry {
            path: bstr::BString::from("f0.txt"),
            hash: Some(ArtifactHash::compute(b"changed")),
            perm: Perm::Regular,
            old_path: None,
        };

        let mut req = base_request("alice");
        req.parent_hash = Some(ArtifactHash::compute(b"parent-commit"));
        req.files = full_tree.clone();
        req.parent_baseline = Some((ArtifactHash::compute(b"parent-baseline"), parent_tree));

        // Store the actual blob content behind each F-card's hash so the repo-side
        // reconstruction in `commit` has something real to resolve.
        let mut disk_tree: Vec<(String, Vec<u8>)> = Vec::new();
        for (i, f) in full_tree.iter().enumerate() {
            let content = if i == 0 {
                b"changed".to_vec()
            } else {
                format!("content{i}").into_bytes()
            };
            blobstore::put(&ctx, &content, false, None).await.unwrap();
            disk_tree.push((f.path.to_string(), content));
        }
        let cfg = CheckinConfig::default();
        let (rid, _hash) = commit(&ctx, req, &disk_tree, &cfg).await.unwrap();
        assert!(rid > 0);
    }

    #[tokio::test]
    async fn older_than_parent_rejected_unless_allowed() {
        let ctx = fresh_ctx().await;
        ensure_user(&ctx, "alice").await.unwrap();
        let mut req = base_request("alice");
        req.parent_hash = Some(ArtifactHash::compute(b"parent"));
        req.parent_date = Some(
            "2025-01-01T00:00:00.000"
                .parse::<chrono::NaiveDateTime>()
                .unwrap()
                .and_utc(),
        );
        // req.date defaults to 2024-01-01, older than the parent.
        let tree = vec![("a.txt".to_string(), b"hello".to_vec())];
        let cfg = CheckinConfig::default();
        let err = commit(&ctx, req, &tree, &cfg).await.unwrap_err();
        assert!(matches!(err, FossilError::Conflict(_)));
    }
}
