pub mod assignments;
pub mod leaves;
pub mod notifications;
pub mod quotas;
pub mod rooms;
pub mod rules;
pub mod users;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;

pub use assignments::{
    Assignment, AssignmentError, AssignmentRepository, NewAssignment, NewTrame, NewTrameSlot,
    TrameError, TrameRepository, TrameTemplate, TrameSlot,
};
pub use leaves::{
    DayAbsenceRow, HolidayRepository, LeaveAggregateRow, LeaveError, LeaveFilter, LeaveRepository,
    LeaveTypeError, LeaveTypeRepository, LeaveTypeSettings, NewLeave, PublicHoliday,
};
pub use notifications::{
    AuditEntry, AuditError, AuditLogRepository, NewAuditEntry, NewNotification, Notification,
    NotificationError, NotificationRepository,
};
pub use quotas::{
    BalanceError, BalanceRepository, LeaveBalance, NewQuotaTransfer, QuotaRuleError,
    QuotaRuleRepository, QuotaTransferRecord,
};
pub use rooms::{
    NewOperatingRoom, NewOperatingSector, OperatingRoom, OperatingSector, RoomError,
    RoomRepository, RoomUpdate, SectorError, SectorRepository, SectorUpdate,
};
pub use rules::{NewPlanningRule, PlanningRuleUpdate, RuleError, RuleRepository};
pub use users::{NewUser, User, UserError, UserRepository, UserUpdate};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to interact with user accounts.
    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// Returns a handle for operating sectors.
    pub fn sectors(&self) -> SectorRepository {
        SectorRepository::new(self.pool.clone())
    }

    /// Returns a handle for operating rooms.
    pub fn rooms(&self) -> RoomRepository {
        RoomRepository::new(self.pool.clone())
    }

    /// Returns a handle for leave type settings.
    pub fn leave_types(&self) -> LeaveTypeRepository {
        LeaveTypeRepository::new(self.pool.clone())
    }

    /// Returns a handle to operate on leave requests.
    pub fn leaves(&self) -> LeaveRepository {
        LeaveRepository::new(self.pool.clone())
    }

    /// Returns a handle for public holidays.
    pub fn holidays(&self) -> HolidayRepository {
        HolidayRepository::new(self.pool.clone())
    }

    /// Returns a handle for per-year leave balances.
    pub fn balances(&self) -> BalanceRepository {
        BalanceRepository::new(self.pool.clone())
    }

    /// Returns a handle for quota transfer and carry-over rules.
    pub fn quota_rules(&self) -> QuotaRuleRepository {
        QuotaRuleRepository::new(self.pool.clone())
    }

    /// Returns a handle for planning rules.
    pub fn rules(&self) -> RuleRepository {
        RuleRepository::new(self.pool.clone())
    }

    /// Returns a handle for assignments.
    pub fn assignments(&self) -> AssignmentRepository {
        AssignmentRepository::new(self.pool.clone())
    }

    /// Returns a handle for trame templates.
    pub fn trames(&self) -> TrameRepository {
        TrameRepository::new(self.pool.clone())
    }

    /// Returns a handle for the notification inbox.
    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    /// Returns a handle for the audit trail.
    pub fn audit(&self) -> AuditLogRepository {
        AuditLogRepository::new(self.pool.clone())
    }

    /// Runs a truncating WAL checkpoint and reports frame statistics.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE);")
            .fetch_one(&self.pool)
            .await?;

        Ok(CheckpointStats {
            busy_frames: row.get::<i64, _>(0) as u64,
            log_frames: row.get::<i64, _>(1).max(0) as u64,
            checkpointed_frames: row.get::<i64, _>(2).max(0) as u64,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Frame counters returned by `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointStats {
    pub busy_frames: u64,
    pub log_frames: u64,
    pub checkpointed_frames: u64,
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Returns `true` for the SQLite unique-constraint violation code.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("2067"),
        _ => false,
    }
}

/// Returns `true` for the SQLite foreign-key violation code.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("787"),
        _ => false,
    }
}
