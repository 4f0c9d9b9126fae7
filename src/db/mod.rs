//! Catalog bootstrap and the `RepoContext` transaction/prepared-statement tracker (§3.5, §5.1).
//!
//! Modeled on the `Pack`/cache constructor pattern of building owned state behind an
//! `Arc`-like handle; this is the crate's first real consumer of the `sea-orm` dependency,
//! accessed through raw `Statement`s rather than the entity-macro layer since §3's schemas
//! are an exact column-for-column contract.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use sea_orm::{
    ConnectOptions, Database, DatabaseConnection, DatabaseTransaction, DbBackend, ExecResult,
    QueryResult, Statement, TransactionTrait,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::errors::FossilError;

/// Working-directory marker file names accepted for checkout-root discovery (§6.2), in the
/// order they are tried at each directory level.
const CHECKOUT_MARKER_NAMES: &[&str] = &["_FOSSIL_", ".fslckout", ".fos"];

const CHECKOUT_MARKER_MIN_SIZE: u64 = 4096;
const CHECKOUT_MARKER_BLOCK_SIZE: u64 = 1024;

/// Walk `start` upward looking for a checkout-root marker file (§6.2): `_FOSSIL_`,
/// `.fslckout`, or the legacy `.fos`. Returns the directory containing the marker and the
/// marker's own path. A marker whose size is not at least 4 KiB and a multiple of 1 KiB is
/// rejected as not a real checkout database, and the walk continues past it.
pub fn locate_checkout_root(start: &Path) -> Result<(PathBuf, PathBuf), FossilError> {
    let mut dir = start
        .canonicalize()
        .map_err(|e| FossilError::Usage(format!("cannot resolve {}: {e}", start.display())))?;
    loop {
        for name in CHECKOUT_MARKER_NAMES {
            let candidate = dir.join(name);
            if let Ok(meta) = std::fs::metadata(&candidate) {
                if meta.is_file()
                    && meta.len() >= CHECKOUT_MARKER_MIN_SIZE
                    && meta.len() % CHECKOUT_MARKER_BLOCK_SIZE == 0
                {
                    return Ok((dir, candidate));
                }
            }
        }
        match dir.parent() {
            Some(parent) => dir = parent.to_path_buf(),
            None => {
                return Err(FossilError::NotFound(format!(
                    "no checkout root found above {}",
                    start.display()
                )));
            }
        }
    }
}

/// Complete the §6.2 validation that `locate_checkout_root`'s size check only approximates:
/// open the candidate marker file read-only and confirm it actually contains a `vfile` table,
/// rather than being some other same-sized file that happened to sit at a candidate name.
pub async fn verify_checkout_marker(path: &Path) -> Result<(), FossilError> {
    let url = format!("sqlite://{}?mode=ro", path.display());
    let conn = Database::connect(url).await.map_err(FossilError::Db)?;
    let row = conn
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='vfile'".to_owned(),
        ))
        .await
        .map_err(FossilError::Db)?;
    if row.is_none() {
        return Err(FossilError::Integrity(format!(
            "{} does not contain a vfile table",
            path.display()
        )));
    }
    Ok(())
}

/// Schema version recorded under `config.content-schema` on a freshly bootstrapped catalog.
pub const CONTENT_SCHEMA: &str = "2.0 fossilite";
/// Schema version recorded under `config.aux-schema` for the checkout-local database.
pub const AUX_SCHEMA: &str = "2.0 fossilite";

const BOOTSTRAP_DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blob(
        rid INTEGER PRIMARY KEY,
        hash TEXT UNIQUE NOT NULL,
        size INTEGER NOT NULL,
        content BLOB,
        rcvid INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS delta(rid INTEGER PRIMARY KEY, srcid INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS unsent(rid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS unclustered(rid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS private(rid INTEGER PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS shun(hash TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS event(
        type TEXT NOT NULL,
        mtime REAL NOT NULL,
        objid INTEGER NOT NULL,
        user TEXT,
        comment TEXT
    )",
    "CREATE TABLE IF NOT EXISTS filename(fnid INTEGER PRIMARY KEY, name TEXT UNIQUE NOT NULL)",
    "CREATE TABLE IF NOT EXISTS mlink(
        mid INTEGER NOT NULL,
        fnid INTEGER NOT NULL,
        pid INTEGER NOT NULL DEFAULT 0,
        fid INTEGER NOT NULL DEFAULT 0,
        pfnid INTEGER NOT NULL DEFAULT 0,
        perm INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS plink(
        pid INTEGER NOT NULL,
        cid INTEGER NOT NULL,
        isprim INTEGER NOT NULL,
        mtime REAL NOT NULL,
        baseid INTEGER,
        PRIMARY KEY(pid, cid)
    )",
    "CREATE TABLE IF NOT EXISTS tag(tagid INTEGER PRIMARY KEY, tagname TEXT UNIQUE NOT NULL)",
    "CREATE TABLE IF NOT EXISTS tagxref(
        tagid INTEGER NOT NULL,
        rid INTEGER NOT NULL,
        origid INTEGER NOT NULL DEFAULT 0,
        value TEXT,
        mtime REAL NOT NULL,
        tagtype INTEGER NOT NULL,
        PRIMARY KEY(tagid, rid)
    )",
    "CREATE TABLE IF NOT EXISTS config(name TEXT PRIMARY KEY, value TEXT, mtime REAL)",
    "CREATE TABLE IF NOT EXISTS user(name TEXT PRIMARY KEY, cap TEXT NOT NULL DEFAULT '', mtime REAL)",
    "CREATE TABLE IF NOT EXISTS vfile(
        id INTEGER PRIMARY KEY,
        pathname TEXT NOT NULL,
        origname TEXT,
        rid INTEGER NOT NULL DEFAULT 0,
        mrid INTEGER NOT NULL DEFAULT 0,
        mhash TEXT,
        chnged INTEGER NOT NULL DEFAULT 0,
        deleted INTEGER NOT NULL DEFAULT 0,
        isexe INTEGER NOT NULL DEFAULT 0,
        islink INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS vmerge(id INTEGER NOT NULL, mhash TEXT NOT NULL, merge INTEGER NOT NULL)",
    "CREATE TABLE IF NOT EXISTS vvar(name TEXT PRIMARY KEY, value TEXT)",
    "CREATE TABLE IF NOT EXISTS sfile(pathname TEXT PRIMARY KEY)",
    "CREATE TABLE IF NOT EXISTS dscan_temp(pathname TEXT PRIMARY KEY)",
];

/// Owns a connection to one repository's catalog database and verifies/bootstraps its schema.
pub struct Catalog {
    conn: DatabaseConnection,
}

impl Catalog {
    /// Open (creating if absent) the SQLite catalog at `path`, run DDL bootstrap, and verify
    /// the schema version markers. `path` is passed through to `sea_orm`'s sqlite URL form.
    pub async fn open(path: &str) -> Result<Self, FossilError> {
        let url = format!("sqlite://{path}?mode=rwc");
        let mut opts = ConnectOptions::new(url);
        opts.sqlx_logging(false);
        let conn = Database::connect(opts)
            .await
            .map_err(FossilError::Db)?;
        conn.execute(Statement::from_string(
            DbBackend::Sqlite,
            "PRAGMA busy_timeout = 5000;".to_owned(),
        ))
        .await
        .map_err(FossilError::Db)?;

        let catalog = Catalog { conn };
        catalog.bootstrap().await?;
        catalog.verify_schema().await?;
        Ok(catalog)
    }

    /// Open an in-memory catalog, primarily for tests.
    pub async fn open_in_memory() -> Result<Self, FossilError> {
        Self::open(":memory:").await
    }

    async fn bootstrap(&self) -> Result<(), FossilError> {
        let txn = self.conn.begin().await.map_err(FossilError::Db)?;
        for ddl in BOOTSTRAP_DDL {
            txn.execute(Statement::from_string(DbBackend::Sqlite, (*ddl).to_owned()))
                .await
                .map_err(FossilError::Db)?;
        }
        txn.commit().await.map_err(FossilError::Db)?;
        debug!("catalog bootstrap DDL applied");
        Ok(())
    }

    async fn verify_schema(&self) -> Result<(), FossilError> {
        self.ensure_schema_row("content-schema", CONTENT_SCHEMA)
            .await?;
        self.ensure_schema_row("aux-schema", AUX_SCHEMA).await?;
        Ok(())
    }

    async fn ensure_schema_row(&self, name: &str, expected: &str) -> Result<(), FossilError> {
        let row: Option<QueryResult> = self
            .conn
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT value FROM config WHERE name = ?",
                [name.into()],
            ))
            .await
            .map_err(FossilError::Db)?;

        match row {
            Some(r) => {
                let value: String = r.try_get("", "value").map_err(FossilError::Db)?;
                if value != expected {
                    return Err(FossilError::Integrity(format!(
                        "schema mismatch for {name}: found {value}, expected {expected}"
                    )));
                }
            }
            None => {
                self.conn
                    .execute(Statement::from_sql_and_values(
                        DbBackend::Sqlite,
                        "INSERT INTO config(name, value, mtime) VALUES (?, ?, 0)",
                        [name.into(), expected.into()],
                    ))
                    .await
                    .map_err(FossilError::Db)?;
                info!(name, expected, "stamped fresh catalog schema version");
            }
        }
        Ok(())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }
}

/// Tracks long-lived prepared statements on a `RepoContext` so forgetting to finalize one is
/// caught as a diagnostic panic at drop time (§5, "forgetting one causes a fatal panic at
/// shutdown").
#[derive(Default)]
pub struct PreparedStatementGuard {
    outstanding: Vec<Statement>,
}

impl PreparedStatementGuard {
    pub fn track(&mut self, stmt: Statement) {
        self.outstanding.push(stmt);
    }

    pub fn release_all(&mut self) {
        self.outstanding.clear();
    }
}

impl Drop for PreparedStatementGuard {
    fn drop(&mut self) {
        debug_assert!(
            self.outstanding.is_empty(),
            "prepared statements leaked past RepoContext shutdown: {}",
            self.outstanding.len()
        );
    }
}

/// The explicit, threaded replacement for a process-global database handle (§9): owns the
/// catalog connection, the reference-counted outer-transaction depth, and the prepared
/// statement guard. "Single-threaded per process" (§5) is preserved here at the transaction
/// level rather than the executor level (§5.1) — concurrent tasks on the same connection
/// serialize on `txn_depth`.
pub struct RepoContext {
    conn: DatabaseConnection,
    txn: Mutex<Option<DatabaseTransaction>>,
    depth: AtomicU32,
    pub statements: Mutex<PreparedStatementGuard>,
}

impl RepoContext {
    pub fn new(catalog: &Catalog) -> Self {
        RepoContext {
            conn: catalog.connection().clone(),
            txn: Mutex::new(None),
            depth: AtomicU32::new(0),
            statements: Mutex::new(PreparedStatementGuard::default()),
        }
    }

    /// Enter a nested transaction scope. Only the outermost `begin` actually opens a SQL
    /// transaction; inner calls just bump the depth counter (§5).
    pub async fn begin(&self) -> Result<(), FossilError> {
        let prev = self.depth.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            let mut guard = self.txn.lock().await;
            *guard = Some(self.conn.begin().await.map_err(FossilError::Db)?);
        }
        Ok(())
    }

    /// Leave a transaction scope. Only the outermost `commit` actually commits.
    pub async fn commit(&self) -> Result<(), FossilError> {
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst);
        if depth == 1 {
            let mut guard = self.txn.lock().await;
            if let Some(txn) = guard.take() {
                txn.commit().await.map_err(FossilError::Db)?;
            }
            self.statements.lock().await.release_all();
        }
        Ok(())
    }

    /// Roll back regardless of nesting depth: any Integrity/Conflict error anywhere in the
    /// outer transaction aborts the whole thing (§4.4.6, §7).
    pub async fn rollback(&self) -> Result<(), FossilError> {
        self.depth.store(0, Ordering::SeqCst);
        let mut guard = self.txn.lock().await;
        if let Some(txn) = guard.take() {
            txn.rollback().await.map_err(FossilError::Db)?;
        }
        self.statements.lock().await.release_all();
        Ok(())
    }

    pub async fn execute(&self, stmt: Statement) -> Result<ExecResult, FossilError> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => txn.execute(stmt).await.map_err(FossilError::Db),
            None => self.conn.execute(stmt).await.map_err(FossilError::Db),
        }
    }

    pub async fn query_one(&self, stmt: Statement) -> Result<Option<QueryResult>, FossilError> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => txn.query_one(stmt).await.map_err(FossilError::Db),
            None => self.conn.query_one(stmt).await.map_err(FossilError::Db),
        }
    }

    pub async fn query_all(&self, stmt: Statement) -> Result<Vec<QueryResult>, FossilError> {
        let guard = self.txn.lock().await;
        match guard.as_ref() {
            Some(txn) => txn.query_all(stmt).await.map_err(FossilError::Db),
            None => self.conn.query_all(stmt).await.map_err(FossilError::Db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_stamps_schema_version() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let ctx = RepoContext::new(&catalog);
        let row = ctx
            .query_one(Statement::from_sql_and_values(
                DbBackend::Sqlite,
                "SELECT value FROM config WHERE name = ?",
                ["content-schema".into()],
            ))
            .await
            .unwrap()
            .unwrap();
        let value: String = row.try_get("", "value").unwrap();
        assert_eq!(value, CONTENT_SCHEMA);
    }

    #[tokio::test]
    async fn nested_transactions_only_commit_outermost() {
        let catalog = Catalog::open_in_memory().await.unwrap();
        let ctx = RepoContext::new(&catalog);
        ctx.begin().await.unwrap();
        ctx.begin().await.unwrap();
        assert_eq!(ctx.depth.load(Ordering::SeqCst), 2);
        ctx.commit().await.unwrap();
        assert_eq!(ctx.depth.load(Ordering::SeqCst), 1);
        ctx.commit().await.unwrap();
        assert_eq!(ctx.depth.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn locate_checkout_root_finds_marker_in_ancestor() {
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join(".fslckout");
        std::fs::write(&marker, vec![0u8; 4096]).unwrap();
        let nested = tmp.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();

        let (root, found) = locate_checkout_root(&nested).unwrap();
        assert_eq!(root, tmp.path().canonicalize().unwrap());
        assert_eq!(found, root.join(".fslckout"));
    }

    #[test]
    fn locate_checkout_root_rejects_undersized_marker() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".fslckout"), vec![0u8; 100]).unwrap();

        assert!(matches!(
            locate_checkout_root(tmp.path()),
            Err(FossilError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn verify_checkout_marker_accepts_real_catalog() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("_FOSSIL_");
        Catalog::open(path.to_str().unwrap()).await.unwrap();

        verify_checkout_marker(&path).await.unwrap();
    }

    #[tokio::test]
    async fn verify_checkout_marker_rejects_table_less_db() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".fslckout");
        let conn = Database::connect(format!("sqlite://{}?mode=rwc", path.display()))
            .await
            .unwrap();
        conn.execute(Statement::from_string(
            DbBackend::Sqlite,
            "CREATE TABLE unrelated(x INTEGER)".to_owned(),
        ))
        .await
        .unwrap();

        let err = verify_checkout_marker(&path).await.unwrap_err();
        assert!(matches!(err, FossilError::Integrity(_)));
    }
}
