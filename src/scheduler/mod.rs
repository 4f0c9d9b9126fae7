//! Backoffice lease scheduler (§4.5): at most one active worker per repository, at most one
//! on-deck successor, forward progress guaranteed across process crashes.
//!
//! No direct analogue exists elsewhere for this subsystem; the `BackofficeTask` trait follows
//! the same trait-at-the-seam idiom as `ObjectTrait`, and `async_trait` (declared but otherwise
//! unused) is put to real use expressing it as an async trait method.

use std::time::Duration;

use async_trait::async_trait;
use sea_orm::{DbBackend, Statement};
use tracing::{info, warn};

use crate::crosslink;
use crate::db::RepoContext;
use crate::errors::FossilError;

/// Lease length in seconds (§4.5.1). Not a tuning knob; a fixed protocol constant.
pub const LEASE_SECONDS: i64 = 60;

/// Exponential back-off bounds and give-up threshold for a stuck active worker (§4.5.2, §9).
/// Preserved verbatim as an unresolved open question: the source does not explain why these
/// particular values, only that back-off starts at 30s, doubles, caps near 240s, and gives up
/// after roughly half an hour.
const BACKOFF_START_SECONDS: u64 = 30;
const BACKOFF_CAP_SECONDS: u64 = 240;
const GIVEUP_SECONDS: i64 = 1800;

/// The `config.backoffice` row (§3.4): `idCurrent tmCurrent idNext tmNext`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lease {
    pub id_current: u32,
    pub tm_current: i64,
    pub id_next: u32,
    pub tm_next: i64,
}

impl Lease {
    pub fn parse(s: &str) -> Result<Lease, FossilError> {
        let mut parts = s.split_ascii_whitespace();
        let mut field = || -> Result<&str, FossilError> {
            parts
                .next()
                .ok_or_else(|| FossilError::Integrity("malformed backoffice lease row".into()))
        };
        let id_current = field()?
            .parse()
            .map_err(|_| FossilError::Integrity("malformed idCurrent".into()))?;
        let tm_current = field()?
            .parse()
            .map_err(|_| FossilError::Integrity("malformed tmCurrent".into()))?;
        let id_next = field()?
            .parse()
            .map_err(|_| FossilError::Integrity("malformed idNext".into()))?;
        let tm_next = field()?
            .parse()
            .map_err(|_| FossilError::Integrity("malformed tmNext".into()))?;
        Ok(Lease {
            id_current,
            tm_current,
            id_next,
            tm_next,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "{} {} {} {}",
            self.id_current, self.tm_current, self.id_next, self.tm_next
        )
    }
}

async fn read_lease(ctx: &RepoContext) -> Result<Lease, FossilError> {
    let row = ctx
        .query_one(Statement::from_string(
            DbBackend::Sqlite,
            "SELECT value FROM config WHERE name = 'backoffice'".to_owned(),
        ))
        .await?;
    match row {
        Some(r) => {
            let value: String = r.try_get("", "value")?;
            Lease::parse(&value)
        }
        None => Ok(Lease::default()),
    }
}

async fn write_lease(ctx: &RepoContext, lease: &Lease) -> Result<(), FossilError> {
    ctx.execute(Statement::from_sql_and_values(
        DbBackend::Sqlite,
        "INSERT INTO config(name, value, mtime) VALUES ('backoffice', ?, 0)
         ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        [lease.render().into()],
    ))
    .await?;
    Ok(())
}

/// Liveness probe seam, re-exported so scheduler tests can supply a fake without reaching
/// into `crate::platform`.
pub use crate::platform::Liveness;

/// Clock seam so the candidate loop is deterministically testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as i64
    }
}

/// Outcome of one candidate's pass through the state machine (§4.5.2).
#[derive(Debug)]
pub enum CandidateOutcome {
    /// Another live process already owns (or is about to own) the lease.
    Yielded,
    /// Took over the lease, ran the worker body, and released it.
    Worked(Vec<(String, TaskOutcome)>),
    /// Queued on-deck but "no delay" mode was requested, so returned immediately instead of
    /// waiting.
    QueuedNoDelay,
    /// Waited past the give-up threshold for a stuck active worker.
    GaveUp,
}

/// Run the candidate state machine to completion: Pending -> (Yielded | Working | OnDeck loop).
pub async fn run_candidate(
    ctx: &RepoContext,
    self_pid: u32,
    clock: &dyn Clock,
    liveness: &dyn Liveness,
    no_delay: bool,
    tasks: &[Box<dyn BackofficeTask>],
) -> Result<CandidateOutcome, FossilError> {
    let mut backoff = BACKOFF_START_SECONDS;
    let mut waited_total: i64 = 0;
    let mut last_tm_current: Option<i64> = None;

    loop {
        ctx.begin().await?;
        let lease = read_lease(ctx).await?;
        let now = clock.now();

        let next_is_live_other =
            lease.id_next != 0 && lease.id_next != self_pid && liveness.is_alive(lease.id_next);
        if lease.tm_next >= now && next_is_live_other {
            ctx.commit().await?;
            return Ok(CandidateOutcome::Yielded);
        }

        let current_is_live = lease.id_current != 0 && liveness.is_alive(lease.id_current);
        if lease.tm_current < now || !current_is_live {
            let taken = Lease {
                id_current: self_pid,
                tm_current: now + LEASE_SECONDS,
                id_next: 0,
                tm_next: 0,
            };
            write_lease(ctx, &taken).await?;
            ctx.commit().await?;
            let results = run_worker(ctx, tasks).await?;
            return Ok(CandidateOutcome::Worked(results));
        }

        let queued = Lease {
            id_current: lease.id_current,
            tm_current: lease.tm_current,
            id_next: self_pid,
            tm_next: now.max(lease.tm_current) + LEASE_SECONDS,
        };
        write_lease(ctx, &queued).await?;
        ctx.commit().await?;

        if no_delay {
            return Ok(CandidateOutcome::QueuedNoDelay);
        }

        let stuck = last_tm_current == Some(lease.tm_current);
        last_tm_current = Some(lease.tm_current);

        let sleep_secs = if stuck {
            warn!(
                backoff,
                "backoffice: active worker lease has not advanced, backing off"
            );
            let s = backoff;
            backoff = (backoff * 2).min(BACKOFF_CAP_SECONDS);
            s
        } else {
            backoff = BACKOFF_START_SECONDS;
            (lease.tm_current - now).max(0) as u64 + 1
        };

        tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
        waited_total += sleep_secs as i64;
        if waited_total >= GIVEUP_SECONDS {
            return Ok(CandidateOutcome::GaveUp);
        }
    }
}

/// One item of background work (§4.5.3.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Ran { detail: String },
    Skipped,
}

#[async_trait]
pub trait BackofficeTask: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, ctx: &RepoContext) -> Result<TaskOutcome, FossilError>;
}

/// Would cluster `unclustered` rids for replication; the wire sync protocol that would consume
/// the cluster is out of scope, so this only reports how much work is pending.
pub struct UnclusteredDrain;

#[async_trait]
impl BackofficeTask for UnclusteredDrain {
    fn name(&self) -> &str {
        "unclustered-drain"
    }

    async fn run(&self, ctx: &RepoContext) -> Result<TaskOutcome, FossilError> {
        let rows = ctx
            .query_all(Statement::from_string(
                DbBackend::Sqlite,
                "SELECT rid FROM unclustered".to_owned(),
            ))
            .await?;
        Ok(TaskOutcome::Ran {
            detail: format!("{} unclustered rid(s) pending replication", rows.len()),
        })
    }
}

/// Re-runs crosslink's tag-propagation fixed point; idempotent, so safe to run even if a
/// previous worker crashed mid-task (§4.5.3).
pub struct TagPropagationRefresh;

#[async_trait]
impl BackofficeTask for TagPropagationRefresh {
    fn name(&self) -> &str {
        "tag-propagation-refresh"
    }

    async fn run(&self, ctx: &RepoContext) -> Result<TaskOutcome, FossilError> {
        crosslink::end(ctx, false, &[]).await?;
        Ok(TaskOutcome::Ran {
            detail: "tag propagation fixed point re-run".into(),
        })
    }
}

pub fn default_tasks() -> Vec<Box<dyn BackofficeTask>> {
    vec![Box::new(UnclusteredDrain), Box::new(TagPropagationRefresh)]
}

/// Run every task in order, logging one summary line with counts and elapsed time (§4.5.3).
pub async fn run_worker(
    ctx: &RepoContext,
    tasks: &[Box<dyn BackofficeTask>],
) -> Result<Vec<(String, TaskOutcome)>, FossilError> {
    let start = std::time::Instant::now();
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        let outcome = task.run(ctx).await?;
        results.push((task.name().to_string(), outcome));
    }
    info!(
        tasks = results.len(),
        elapsed_us = start.elapsed().as_micros() as u64,
        "backoffice worker finished"
    );
    Ok(results)
}
