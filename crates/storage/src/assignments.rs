use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::types::{ActivityKind, Period, WeekParity};

use crate::{is_unique_violation, to_rfc3339};

/// A planned assignment for one user, day and period.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: String,
    pub user_id: String,
    pub room_id: Option<String>,
    pub day: NaiveDate,
    pub period: Period,
    pub activity_kind: ActivityKind,
    pub trame_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters required to create an assignment.
pub struct NewAssignment<'a> {
    pub user_id: &'a str,
    pub room_id: Option<&'a str>,
    pub day: NaiveDate,
    pub period: Period,
    pub activity_kind: ActivityKind,
    pub trame_id: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Errors raised while reading or mutating assignments.
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("assignment not found")]
    NotFound,
    #[error("user already assigned for this day and period")]
    SlotTaken,
    #[error("assignment row holds invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct AssignmentRow {
    id: String,
    user_id: String,
    room_id: Option<String>,
    day: NaiveDate,
    period: String,
    activity_kind: String,
    trame_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AssignmentRow {
    fn into_domain(self) -> Result<Assignment, AssignmentError> {
        let period = Period::from_str(&self.period).map_err(|_| AssignmentError::InvalidField {
            field: "period",
            value: self.period.clone(),
        })?;
        let activity_kind =
            ActivityKind::from_str(&self.activity_kind).map_err(|_| {
                AssignmentError::InvalidField {
                    field: "activity_kind",
                    value: self.activity_kind.clone(),
                }
            })?;

        Ok(Assignment {
            id: self.id,
            user_id: self.user_id,
            room_id: self.room_id,
            day: self.day,
            period,
            activity_kind,
            trame_id: self.trame_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Repository for the `assignments` table.
#[derive(Clone)]
pub struct AssignmentRepository {
    pool: SqlitePool,
}

impl AssignmentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begins a SQLite transaction for batch generation.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Inserts one assignment inside the provided transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        assignment: &NewAssignment<'_>,
    ) -> Result<String, AssignmentError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(assignment.created_at);
        sqlx::query(
            "INSERT INTO assignments \
             (id, user_id, room_id, day, period, activity_kind, trame_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(assignment.user_id)
        .bind(assignment.room_id)
        .bind(assignment.day)
        .bind(assignment.period.as_str())
        .bind(assignment.activity_kind.as_str())
        .bind(assignment.trame_id)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                AssignmentError::SlotTaken
            } else {
                AssignmentError::Database(err)
            }
        })?;

        Ok(id)
    }

    /// Returns `true` when the user already has an assignment on (day, period).
    ///
    /// A `FULL_DAY` assignment occupies both half-day periods and vice versa.
    pub async fn occupied(
        &self,
        user_id: &str,
        day: NaiveDate,
        period: Period,
    ) -> Result<bool, AssignmentError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM assignments WHERE user_id = ? AND day = ? \
             AND (period = ? OR period = 'FULL_DAY' OR ? = 'FULL_DAY')",
        )
        .bind(user_id)
        .bind(day)
        .bind(period.as_str())
        .bind(period.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// Lists assignments in a date range, optionally for one user or room.
    pub async fn list(
        &self,
        from: NaiveDate,
        to: NaiveDate,
        user_id: Option<&str>,
        room_id: Option<&str>,
    ) -> Result<Vec<Assignment>, AssignmentError> {
        let mut sql =
            String::from("SELECT * FROM assignments WHERE day >= ? AND day <= ?");
        if user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if room_id.is_some() {
            sql.push_str(" AND room_id = ?");
        }
        sql.push_str(" ORDER BY day, period");

        let mut query = sqlx::query_as::<_, AssignmentRow>(&sql).bind(from).bind(to);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        if let Some(room_id) = room_id {
            query = query.bind(room_id);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(AssignmentRow::into_domain).collect()
    }
}

/// A trame template header.
#[derive(Debug, Clone, PartialEq)]
pub struct TrameTemplate {
    pub id: String,
    pub name: String,
    pub week_parity: WeekParity,
    pub active: bool,
    pub slots: Vec<TrameSlot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One weekly slot of a trame template.
#[derive(Debug, Clone, PartialEq)]
pub struct TrameSlot {
    pub id: String,
    pub weekday: Weekday,
    pub period: Period,
    pub room_id: Option<String>,
    pub activity_kind: ActivityKind,
    pub user_id: Option<String>,
}

/// Parameters required to create a template.
pub struct NewTrame<'a> {
    pub name: &'a str,
    pub week_parity: WeekParity,
    pub slots: Vec<NewTrameSlot>,
    pub created_at: DateTime<Utc>,
}

/// Slot payload accepted at template creation.
pub struct NewTrameSlot {
    pub weekday: Weekday,
    pub period: Period,
    pub room_id: Option<String>,
    pub activity_kind: ActivityKind,
    pub user_id: Option<String>,
}

/// Errors raised while reading or mutating trame templates.
#[derive(Debug, Error)]
pub enum TrameError {
    #[error("trame template not found")]
    NotFound,
    #[error("a template with this name already exists")]
    Duplicate,
    #[error("trame row holds invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct TrameRow {
    id: String,
    name: String,
    week_parity: String,
    active: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct TrameSlotRow {
    id: String,
    weekday: String,
    period: String,
    room_id: Option<String>,
    activity_kind: String,
    user_id: Option<String>,
}

impl TrameSlotRow {
    fn into_domain(self) -> Result<TrameSlot, TrameError> {
        let weekday = parse_weekday(&self.weekday)?;
        let period = Period::from_str(&self.period).map_err(|_| TrameError::InvalidField {
            field: "period",
            value: self.period.clone(),
        })?;
        let activity_kind =
            ActivityKind::from_str(&self.activity_kind).map_err(|_| TrameError::InvalidField {
                field: "activity_kind",
                value: self.activity_kind.clone(),
            })?;
        Ok(TrameSlot {
            id: self.id,
            weekday,
            period,
            room_id: self.room_id,
            activity_kind,
            user_id: self.user_id,
        })
    }
}

fn parse_weekday(raw: &str) -> Result<Weekday, TrameError> {
    match raw {
        "MON" => Ok(Weekday::Mon),
        "TUE" => Ok(Weekday::Tue),
        "WED" => Ok(Weekday::Wed),
        "THU" => Ok(Weekday::Thu),
        "FRI" => Ok(Weekday::Fri),
        "SAT" => Ok(Weekday::Sat),
        "SUN" => Ok(Weekday::Sun),
        other => Err(TrameError::InvalidField {
            field: "weekday",
            value: other.to_string(),
        }),
    }
}

fn weekday_str(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "MON",
        Weekday::Tue => "TUE",
        Weekday::Wed => "WED",
        Weekday::Thu => "THU",
        Weekday::Fri => "FRI",
        Weekday::Sat => "SAT",
        Weekday::Sun => "SUN",
    }
}

/// Repository for trame templates and their slots.
#[derive(Clone)]
pub struct TrameRepository {
    pool: SqlitePool,
}

impl TrameRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a template with its slots in one transaction.
    pub async fn insert(&self, trame: NewTrame<'_>) -> Result<String, TrameError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(trame.created_at);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO trame_templates (id, name, week_parity, active, created_at, updated_at) \
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(trame.name)
        .bind(trame.week_parity.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                TrameError::Duplicate
            } else {
                TrameError::Database(err)
            }
        })?;

        for slot in &trame.slots {
            sqlx::query(
                "INSERT INTO trame_slots \
                 (id, template_id, weekday, period, room_id, activity_kind, user_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(weekday_str(slot.weekday))
            .bind(slot.period.as_str())
            .bind(&slot.room_id)
            .bind(slot.activity_kind.as_str())
            .bind(&slot.user_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Fetches a template together with its slots.
    pub async fn fetch(&self, id: &str) -> Result<TrameTemplate, TrameError> {
        let row = sqlx::query_as::<_, TrameRow>("SELECT * FROM trame_templates WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(TrameError::NotFound)?;

        let week_parity =
            WeekParity::from_str(&row.week_parity).map_err(|_| TrameError::InvalidField {
                field: "week_parity",
                value: row.week_parity.clone(),
            })?;

        let slot_rows = sqlx::query_as::<_, TrameSlotRow>(
            "SELECT id, weekday, period, room_id, activity_kind, user_id \
             FROM trame_slots WHERE template_id = ? ORDER BY weekday, period",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let slots = slot_rows
            .into_iter()
            .map(TrameSlotRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TrameTemplate {
            id: row.id,
            name: row.name,
            week_parity,
            active: row.active != 0,
            slots,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Lists templates without their slots.
    pub async fn list(&self) -> Result<Vec<TrameTemplate>, TrameError> {
        let rows = sqlx::query_as::<_, TrameRow>(
            "SELECT * FROM trame_templates ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let week_parity = WeekParity::from_str(&row.week_parity).map_err(|_| {
                    TrameError::InvalidField {
                        field: "week_parity",
                        value: row.week_parity.clone(),
                    }
                })?;
                Ok(TrameTemplate {
                    id: row.id,
                    name: row.name,
                    week_parity,
                    active: row.active != 0,
                    slots: Vec::new(),
                    created_at: row.created_at,
                    updated_at: row.updated_at,
                })
            })
            .collect()
    }
}
