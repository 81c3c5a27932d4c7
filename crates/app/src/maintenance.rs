use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use anesth_roster_storage::Database;

const TTL_HOURS: i64 = 24 * 30;
const BATCH_LIMIT: i64 = 1000;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(300);

/// Background worker responsible for TTL deletion and WAL checkpoints.
///
/// Read notifications and audit rows expire after [`TTL_HOURS`]; unread
/// notifications are never swept.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl MaintenanceWorker {
    /// Creates a worker with default clock and cadence.
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Overrides the clock used for determining TTL thresholds.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// Executes one maintenance cycle (TTL + checkpoint).
    pub async fn run_once(&self) -> Result<(), MaintenanceError> {
        let now = (self.clock)();
        let threshold = now - ChronoDuration::hours(TTL_HOURS);

        let (notif_deleted, notif_busy) = self
            .delete_expired_rows("notifications", threshold, |repo_threshold| async move {
                self.database
                    .notifications()
                    .delete_read_older_than_batch(repo_threshold, BATCH_LIMIT)
                    .await
            })
            .await?;

        info!(
            stage = "storage",
            table = "notifications",
            deleted = notif_deleted,
            busy = notif_busy,
            threshold = %threshold.to_rfc3339(),
            "notifications TTL sweep completed"
        );

        let (audit_deleted, audit_busy) = self
            .delete_expired_rows("audit_log", threshold, |repo_threshold| async move {
                self.database
                    .audit()
                    .delete_older_than_batch(repo_threshold, BATCH_LIMIT)
                    .await
            })
            .await?;

        info!(
            stage = "storage",
            table = "audit_log",
            deleted = audit_deleted,
            busy = audit_busy,
            threshold = %threshold.to_rfc3339(),
            "audit_log TTL sweep completed"
        );

        self.run_checkpoint().await?;

        Ok(())
    }

    async fn delete_expired_rows<Fut>(
        &self,
        table: &'static str,
        threshold: DateTime<Utc>,
        mut delete_fn: impl FnMut(DateTime<Utc>) -> Fut,
    ) -> Result<(u64, bool), MaintenanceError>
    where
        Fut: std::future::Future<Output = Result<u64, SqlxError>>,
    {
        let mut total_deleted = 0u64;
        let mut busy = false;

        loop {
            match delete_fn(threshold).await {
                Ok(0) => break,
                Ok(batch_deleted) => {
                    total_deleted += batch_deleted;
                    counter!("db_ttl_deleted_total", "table" => table).increment(batch_deleted);
                }
                Err(err) => {
                    if is_sqlite_busy(&err) {
                        busy = true;
                        counter!("db_busy_total", "op" => "ttl").increment(1);
                        warn!(stage = "storage", %table, error = %err, "ttl delete hit busy timeout");
                        break;
                    }

                    return Err(MaintenanceError::TtlDelete { table, source: err });
                }
            }
        }

        Ok((total_deleted, busy))
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        let checkpoint_result = self.database.wal_checkpoint_truncate().await;

        match checkpoint_result {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                let busy = stats.busy_frames > 0;
                if busy {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
            }
            Err(err) => {
                if is_sqlite_busy(&err) {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                    return Ok(());
                }

                return Err(MaintenanceError::Checkpoint { source: err });
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to delete expired rows from {table}")]
    TtlDelete {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
