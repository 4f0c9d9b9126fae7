//! Content-addressed artifact store (§4.1): put/get byte-identical artifacts keyed by
//! content hash, backed by delta chains rooted on zlib-compressed full copies.
//!
//! Modeled on the `ObjectTrait`/`ReadBoxed` split of "raw bytes" from "typed object",
//! re-expressed around catalog rows instead of pack entries. Cycle detection on `deltify`
//! enforces the acyclic-chain invariant that pack-offset-chain code can otherwise assume
//! implicitly, since packs are append-only and a mutable catalog is not.

use std::collections::HashSet;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sea_orm::{DbBackend, Statement};
use tracing::{debug, warn};

use crate::db::RepoContext;
use crate::delta::{DeltaDiff, delta_decode};
use crate::errors::FossilError;
use crate::hash::ArtifactHash;

/// Maximum delta chain depth walked before declaring a cycle. Real chains are bounded by
/// repository history; this is a defensive backstop, not a tuning knob.
const MAX_CHAIN_DEPTH: usize = 100_000;

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

struct BlobRow {
    rid: i64,
    size: i64,
    content: Vec<u8>,
}

async fn fetch_blob_row(ctx: &RepoContext, rid: i64) -> Result<BlobRow, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT rid, size, content FROM blob WHERE rid = ?",
            [rid.into()],
        ))
        .await?
        .ok_or_else(|| FossilError::NotFound(format!("rid {rid}")))?;

    Ok(BlobRow {
        rid: row.try_get("", "rid")?,
        size: row.try_get("", "size")?,
        content: row.try_get("", "content")?,
    })
}

async fn fetch_delta_srcid(ctx: &RepoContext, rid: i64) -> Result<Option<i64>, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT srcid FROM delta WHERE rid = ?",
            [rid.into()],
        ))
        .await?;
    row.map(|r| r.try_get("", "srcid")).transpose()
        .map_err(FossilError::Db)
}

/// Look up the `rid` of the artifact stored under `hash`, if any.
pub async fn rid_for_hash(
    ctx: &RepoContext,
    hash: &ArtifactHash,
) -> Result<Option<i64>, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT rid FROM blob WHERE hash = ?",
            [hash.to_string().into()],
        ))
        .await?;
    row.map(|r| r.try_get("", "rid")).transpose().map_err(FossilError::Db)
}

/// Reconstruct the logical bytes stored at `rid`, walking the delta chain to its root.
pub async fn get(ctx: &RepoContext, rid: i64) -> Result<Vec<u8>, FossilError> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut cur = rid;

    loop {
        if !visited.insert(cur) {
            return Err(FossilError::Integrity(format!(
                "delta chain cycle detected at rid {cur}"
            )));
        }
        if chain.len() > MAX_CHAIN_DEPTH {
            return Err(FossilError::Integrity(format!(
                "delta chain from rid {rid} exceeds {MAX_CHAIN_DEPTH}"
            )));
        }
        let srcid = fetch_delta_srcid(ctx, cur).await?;
        chain.push(cur);
        match srcid {
            Some(src) => cur = src,
            None => break,
        }
    }

    // `chain` now runs target..root; the root is a full copy.
    let root = *chain.last().unwrap();
    let root_row = fetch_blob_row(ctx, root).await?;
    let mut content = decompress(&root_row.content)?;

    for &rid_step in chain.iter().rev().skip(1) {
        let row = fetch_blob_row(ctx, rid_step).await?;
        let delta_bytes = decompress(&row.content)?;
        let mut reader = std::io::Cursor::new(&delta_bytes);
        content = delta_decode(&mut reader, &content)
            .map_err(|e| FossilError::Integrity(format!("corrupt delta chain: {e}")))?;
        if row.size >= 0 && content.len() as i64 != row.size {
            return Err(FossilError::Integrity(format!(
                "rid {} reconstructed length {} does not match stored size {}",
                row.rid,
                content.len(),
                row.size
            )));
        }
    }

    if root_row.size >= 0 && chain.len() == 1 && content.len() as i64 != root_row.size {
        return Err(FossilError::Integrity(format!(
            "rid {root} reconstructed length {} does not match stored size {}",
            content.len(),
            root_row.size
        )));
    }

    Ok(content)
}

/// Store `content`, returning its `rid`. Repeated `put`s of identical bytes under the same
/// hash policy alias to the existing row without rewriting content.
pub async fn put(
    ctx: &RepoContext,
    content: &[u8],
    private: bool,
    hash_override: Option<ArtifactHash>,
) -> Result<i64, FossilError> {
    let hash = hash_override.unwrap_or_else(|| ArtifactHash::compute(content));
    let hash_str = hash.to_string();

    let existing = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT rid, size FROM blob WHERE hash = ?",
            [hash_str.clone().into()],
        ))
        .await?;

    if let Some(row) = existing {
        let rid: i64 = row.try_get("", "rid")?;
        let size: i64 = row.try_get("", "size")?;
        if size >= 0 {
            debug!(rid, %hash, "put: content already present");
            return Ok(rid);
        }
        // Phantom row: populate it.
        let compressed = compress(content)?;
        ctx.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "UPDATE blob SET size = ?, content = ? WHERE rid = ?",
            [
                (content.len() as i64).into(),
                compressed.into(),
                rid.into(),
            ],
        ))
        .await?;
        return Ok(rid);
    }

    let compressed = compress(content)?;
    let result = ctx
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO blob(hash, size, content, rcvid) VALUES (?, ?, ?, 0)",
            [
                hash_str.into(),
                (content.len() as i64).into(),
                compressed.into(),
            ],
        ))
        .await?;
    let rid = result.last_insert_id() as i64;

    if private {
        ctx.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO private(rid) VALUES (?)",
            [rid.into()],
        ))
        .await?;
    } else {
        ctx.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO unsent(rid) VALUES (?)",
            [rid.into()],
        ))
        .await?;
        ctx.execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "INSERT INTO unclustered(rid) VALUES (?)",
            [rid.into()],
        ))
        .await?;
    }

    debug!(rid, %hash, size = content.len(), "put: new artifact stored");
    Ok(rid)
}

/// Rewrite `target`'s stored content as a delta against `source`, provided that shrinks it
/// (or unconditionally, when `force`). Refuses if doing so would introduce a cycle.
pub async fn deltify(
    ctx: &RepoContext,
    target: i64,
    source: i64,
    force: bool,
) -> Result<bool, FossilError> {
    if target == source {
        return Err(FossilError::Usage("cannot deltify a blob against itself".into()));
    }

    // Refuse if `source`'s own chain already passes through `target` — that would cycle.
    let mut cur = source;
    let mut guard = 0;
    loop {
        if cur == target {
            return Err(FossilError::Integrity(format!(
                "deltify({target}, {source}) would introduce a cycle"
            )));
        }
        guard += 1;
        if guard > MAX_CHAIN_DEPTH {
            return Err(FossilError::Integrity("delta chain too deep".into()));
        }
        match fetch_delta_srcid(ctx, cur).await? {
            Some(next) => cur = next,
            None => break,
        }
    }

    let target_row = fetch_blob_row(ctx, target).await?;
    let target_content = get(ctx, target).await?;
    let source_content = get(ctx, source).await?;

    let diff = DeltaDiff::new(&source_content, &target_content);
    let delta_stream = diff.encode();
    let compressed_delta = compress(&delta_stream)?;

    if !force && compressed_delta.len() >= target_row.content.len() {
        debug!(target, source, "deltify: would not shrink, skipping");
        return Ok(false);
    }

    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "UPDATE blob SET content = ? WHERE rid = ?",
        [compressed_delta.into(), target.into()],
    ))
    .await?;
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "DELETE FROM delta WHERE rid = ?",
        [target.into()],
    ))
    .await?;
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT INTO delta(rid, srcid) VALUES (?, ?)",
        [target.into(), source.into()],
    ))
    .await?;

    debug!(target, source, "deltify: rewrote as delta");
    Ok(true)
}

pub async fn content_is_private(ctx: &RepoContext, rid: i64) -> Result<bool, FossilError> {
    let row = ctx
        .query_one(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT rid FROM private WHERE rid = ?",
            [rid.into()],
        ))
        .await?;
    Ok(row.is_some())
}

pub async fn make_public(ctx: &RepoContext, rid: i64) -> Result<(), FossilError> {
    let result = ctx
        .execute(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "DELETE FROM private WHERE rid = ?",
            [rid.into()],
        ))
        .await?;
    if result.rows_affected() == 0 {
        warn!(rid, "make_public: rid was not private");
        return Ok(());
    }
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT OR IGNORE INTO unsent(rid) VALUES (?)",
        [rid.into()],
    ))
    .await?;
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT OR IGNORE INTO unclustered(rid) VALUES (?)",
        [rid.into()],
    ))
    .await?;
    Ok(())
}

/// Resolve a full or abbreviated hex hash to the artifact it names (§6.3). A prefix shorter
/// than 4 hex digits is rejected as usage error; a prefix matching more than one stored hash
/// is `Ambiguous` rather than silently picking one.
pub async fn resolve_hash_prefix(ctx: &RepoContext, prefix: &str) -> Result<ArtifactHash, FossilError> {
    if prefix.len() < 4 {
        return Err(FossilError::Usage(format!(
            "hash prefix {prefix:?} is shorter than the minimum 4 hex digits"
        )));
    }
    if prefix.len() == 40 || prefix.len() == 64 {
        return prefix.parse().map_err(FossilError::Integrity);
    }

    let like_pattern = format!("{prefix}%");
    let rows = ctx
        .query_all(Statement::from_sql_and_values(
            DbBackend::Sqlite,
            "SELECT hash FROM blob WHERE hash LIKE ?",
            [like_pattern.into()],
        ))
        .await?;

    match rows.len() {
        0 => Err(FossilError::NotFound(format!("no artifact matches hash prefix {prefix:?}"))),
        1 => {
            let hash_str: String = rows[0].try_get("", "hash")?;
            hash_str.parse().map_err(FossilError::Integrity)
        }
        n => Err(FossilError::Ambiguous(format!(
            "hash prefix {prefix:?} matches {n} artifacts"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Catalog;

    async fn fresh_ctx() -> RepoContext {
        let catalog = Catalog::open_in_memory().await.unwrap();
        RepoContext::new(&catalog)
    }

    #[tokio::test]
    async fn put_is_idempotent_on_identical_bytes() {
        let ctx = fresh_ctx().await;
        let a = put(&ctx, b"hello\n", false, None).await.unwrap();
        let b = put(&ctx, b"hello\n", false, None).await.unwrap();
        assert_eq!(a, b);
        let content = get(&ctx, a).await.unwrap();
        assert_eq!(content, b"hello\n");
    }

    #[tokio::test]
    async fn deltify_shrinks_and_reconstructs() {
        let ctx = fresh_ctx().await;
        let base = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let mut changed = base.clone();
        changed.extend_from_slice(b" extra tail content appended here");

        let src = put(&ctx, &base, false, None).await.unwrap();
        let tgt = put(&ctx, &changed, false, None).await.unwrap();

        let did = deltify(&ctx, tgt, src, false).await.unwrap();
        assert!(did);

        let reconstructed = get(&ctx, tgt).await.unwrap();
        assert_eq!(reconstructed, changed);
    }

    #[tokio::test]
    async fn deltify_refuses_self_cycle() {
        let ctx = fresh_ctx().await;
        let rid = put(&ctx, b"abc", false, None).await.unwrap();
        let err = deltify(&ctx, rid, rid, true).await.unwrap_err();
        assert!(matches!(err, FossilError::Usage(_)));
    }

    #[tokio::test]
    async fn private_content_is_not_public() {
        let ctx = fresh_ctx().await;
        let rid = put(&ctx, b"secret", true, None).await.unwrap();
        assert!(content_is_private(&ctx, rid).await.unwrap());
        make_public(&ctx, rid).await.unwrap();
        assert!(!content_is_private(&ctx, rid).await.unwrap());
    }

    #[tokio::test]
    async fn resolve_hash_prefix_rejects_short_prefix() {
        let ctx = fresh_ctx().await;
        let err = resolve_hash_prefix(&ctx, "abc").await.unwrap_err();
        assert!(matches!(err, FossilError::Usage(_)));
    }

    #[tokio::test]
    async fn resolve_hash_prefix_finds_unique_match() {
        let ctx = fresh_ctx().await;
        put(&ctx, b"hello\n", false, None).await.unwrap();
        let full = ArtifactHash::compute(b"hello\n").to_string();
        let resolved = resolve_hash_prefix(&ctx, &full[..8]).await.unwrap();
        assert_eq!(resolved.to_string(), full);
    }

    #[tokio::test]
    async fn resolve_hash_prefix_reports_not_found() {
        let ctx = fresh_ctx().await;
        let err = resolve_hash_prefix(&ctx, "deadbeef").await.unwrap_err();
        assert!(matches!(err, FossilError::NotFound(_)));
    }
}
