use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::types::{CountingMethod, DayPart, Leave, LeaveStatus, Role};

use crate::to_rfc3339;

/// Configuration of one leave type.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveTypeSettings {
    pub code: String,
    pub label: String,
    pub counting_method: CountingMethod,
    pub max_duration_days: Option<i64>,
    pub min_lead_time_days: i64,
    pub approver_roles: Vec<Role>,
    pub user_selectable: bool,
    pub active: bool,
}

/// Errors raised while reading leave type settings.
#[derive(Debug, Error)]
pub enum LeaveTypeError {
    #[error("leave type not found")]
    NotFound,
    #[error("leave type row holds invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("failed to decode approver roles: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct LeaveTypeRow {
    code: String,
    label: String,
    counting_method: String,
    max_duration_days: Option<i64>,
    min_lead_time_days: i64,
    approver_roles: String,
    user_selectable: i64,
    active: i64,
}

impl LeaveTypeRow {
    fn into_domain(self) -> Result<LeaveTypeSettings, LeaveTypeError> {
        let counting_method = CountingMethod::from_str(&self.counting_method).map_err(|_| {
            LeaveTypeError::InvalidField {
                field: "counting_method",
                value: self.counting_method.clone(),
            }
        })?;
        let approver_roles: Vec<String> = serde_json::from_str(&self.approver_roles)?;
        let approver_roles = approver_roles
            .iter()
            .map(|value| {
                Role::from_str(value).map_err(|_| LeaveTypeError::InvalidField {
                    field: "approver_roles",
                    value: value.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LeaveTypeSettings {
            code: self.code,
            label: self.label,
            counting_method,
            max_duration_days: self.max_duration_days,
            min_lead_time_days: self.min_lead_time_days,
            approver_roles,
            user_selectable: self.user_selectable != 0,
            active: self.active != 0,
        })
    }
}

/// Repository for the `leave_type_settings` table.
#[derive(Clone)]
pub struct LeaveTypeRepository {
    pool: SqlitePool,
}

impl LeaveTypeRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces a leave type definition.
    pub async fn upsert(&self, settings: &LeaveTypeSettings) -> Result<(), LeaveTypeError> {
        let approver_roles = serde_json::to_string(
            &settings
                .approver_roles
                .iter()
                .map(|role| role.as_str())
                .collect::<Vec<_>>(),
        )?;
        sqlx::query(
            "INSERT INTO leave_type_settings \
             (code, label, counting_method, max_duration_days, min_lead_time_days, \
              approver_roles, user_selectable, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(code) DO UPDATE SET label = excluded.label, \
             counting_method = excluded.counting_method, \
             max_duration_days = excluded.max_duration_days, \
             min_lead_time_days = excluded.min_lead_time_days, \
             approver_roles = excluded.approver_roles, \
             user_selectable = excluded.user_selectable, active = excluded.active",
        )
        .bind(&settings.code)
        .bind(&settings.label)
        .bind(settings.counting_method.as_str())
        .bind(settings.max_duration_days)
        .bind(settings.min_lead_time_days)
        .bind(&approver_roles)
        .bind(settings.user_selectable as i64)
        .bind(settings.active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches one leave type by code.
    pub async fn fetch(&self, code: &str) -> Result<LeaveTypeSettings, LeaveTypeError> {
        let row = sqlx::query_as::<_, LeaveTypeRow>(
            "SELECT * FROM leave_type_settings WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LeaveTypeError::NotFound)?;
        row.into_domain()
    }

    /// Lists active leave types.
    pub async fn list_active(&self) -> Result<Vec<LeaveTypeSettings>, LeaveTypeError> {
        let rows = sqlx::query_as::<_, LeaveTypeRow>(
            "SELECT * FROM leave_type_settings WHERE active = 1 ORDER BY code",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaveTypeRow::into_domain).collect()
    }
}

/// Parameters required to create a leave request.
pub struct NewLeave<'a> {
    pub user_id: &'a str,
    pub type_code: &'a str,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub half_day_start: Option<DayPart>,
    pub half_day_end: Option<DayPart>,
    pub counted_days: f64,
    pub reason: Option<&'a str>,
    pub recurrence_group: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Filters accepted by the leave listing query.
#[derive(Debug, Default, Clone)]
pub struct LeaveFilter {
    pub user_id: Option<String>,
    pub status: Option<LeaveStatus>,
    pub type_code: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Errors raised while reading or mutating leaves.
#[derive(Debug, Error)]
pub enum LeaveError {
    #[error("leave not found")]
    NotFound,
    #[error("leave is not in the required state")]
    IllegalTransition,
    #[error("leave row holds invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct LeaveRow {
    id: String,
    user_id: String,
    type_code: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    half_day_start: Option<String>,
    half_day_end: Option<String>,
    counted_days: f64,
    status: String,
    reason: Option<String>,
    approver_id: Option<String>,
    decided_at: Option<DateTime<Utc>>,
    decision_comment: Option<String>,
    recurrence_group: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl LeaveRow {
    fn into_domain(self) -> Result<Leave, LeaveError> {
        let status = LeaveStatus::from_str(&self.status).map_err(|_| LeaveError::InvalidField {
            field: "status",
            value: self.status.clone(),
        })?;
        let half_day_start = parse_day_part(self.half_day_start.as_deref())?;
        let half_day_end = parse_day_part(self.half_day_end.as_deref())?;

        Ok(Leave {
            id: self.id,
            user_id: self.user_id,
            type_code: self.type_code,
            start_date: self.start_date,
            end_date: self.end_date,
            half_day_start,
            half_day_end,
            counted_days: self.counted_days,
            status,
            reason: self.reason,
            approver_id: self.approver_id,
            decided_at: self.decided_at,
            decision_comment: self.decision_comment,
            recurrence_group: self.recurrence_group,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn parse_day_part(raw: Option<&str>) -> Result<Option<DayPart>, LeaveError> {
    match raw {
        None => Ok(None),
        Some(value) => DayPart::from_str(value)
            .map(Some)
            .map_err(|_| LeaveError::InvalidField {
                field: "half_day",
                value: value.to_string(),
            }),
    }
}

/// Per-day absence count produced for conflict detection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DayAbsenceRow {
    pub day: NaiveDate,
    pub absent: i64,
}

/// Aggregate row returned by the leave analytics query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaveAggregateRow {
    pub type_code: String,
    pub status: String,
    pub count: i64,
    pub total_days: f64,
}

/// Repository for the `leaves` table.
#[derive(Clone)]
pub struct LeaveRepository {
    pool: SqlitePool,
}

impl LeaveRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begins a SQLite transaction for multi-step writes.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Inserts a new leave request inside the provided transaction.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        leave: &NewLeave<'_>,
    ) -> Result<String, LeaveError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(leave.created_at);
        sqlx::query(
            "INSERT INTO leaves \
             (id, user_id, type_code, start_date, end_date, half_day_start, half_day_end, \
              counted_days, status, reason, recurrence_group, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(leave.user_id)
        .bind(leave.type_code)
        .bind(leave.start_date)
        .bind(leave.end_date)
        .bind(leave.half_day_start.map(DayPart::as_str))
        .bind(leave.half_day_end.map(DayPart::as_str))
        .bind(leave.counted_days)
        .bind(leave.reason)
        .bind(leave.recurrence_group)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        Ok(id)
    }

    /// Fetches one leave by id.
    pub async fn fetch(&self, id: &str) -> Result<Leave, LeaveError> {
        let row = sqlx::query_as::<_, LeaveRow>("SELECT * FROM leaves WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LeaveError::NotFound)?;
        row.into_domain()
    }

    /// Lists leaves matching the filter, newest start date first.
    pub async fn list(&self, filter: &LeaveFilter) -> Result<Vec<Leave>, LeaveError> {
        let mut sql = String::from("SELECT * FROM leaves WHERE 1 = 1");
        if filter.user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.type_code.is_some() {
            sql.push_str(" AND type_code = ?");
        }
        if filter.from.is_some() {
            sql.push_str(" AND end_date >= ?");
        }
        if filter.to.is_some() {
            sql.push_str(" AND start_date <= ?");
        }
        sql.push_str(" ORDER BY start_date DESC, created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, LeaveRow>(&sql);
        if let Some(user_id) = &filter.user_id {
            query = query.bind(user_id);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(type_code) = &filter.type_code {
            query = query.bind(type_code);
        }
        if let Some(from) = filter.from {
            query = query.bind(from);
        }
        if let Some(to) = filter.to {
            query = query.bind(to);
        }
        query = query
            .bind(filter.limit.unwrap_or(100))
            .bind(filter.offset.unwrap_or(0));

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(LeaveRow::into_domain).collect()
    }

    /// Rewrites the request fields of a still-pending leave.
    pub async fn update_request(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        half_day_start: Option<DayPart>,
        half_day_end: Option<DayPart>,
        counted_days: f64,
        reason: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), LeaveError> {
        let result = sqlx::query(
            "UPDATE leaves SET start_date = ?, end_date = ?, half_day_start = ?, \
             half_day_end = ?, counted_days = ?, reason = ?, updated_at = ? \
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(start_date)
        .bind(end_date)
        .bind(half_day_start.map(DayPart::as_str))
        .bind(half_day_end.map(DayPart::as_str))
        .bind(counted_days)
        .bind(reason)
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LeaveError::IllegalTransition);
        }
        Ok(())
    }

    /// Moves a pending leave into a terminal state.
    ///
    /// The guard on the current status makes concurrent double decisions
    /// fail with [`LeaveError::IllegalTransition`] instead of overwriting.
    pub async fn set_status(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        id: &str,
        status: LeaveStatus,
        approver_id: Option<&str>,
        decision_comment: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<(), LeaveError> {
        let result = sqlx::query(
            "UPDATE leaves SET status = ?, approver_id = ?, decided_at = ?, \
             decision_comment = ?, updated_at = ? WHERE id = ? AND status = 'PENDING'",
        )
        .bind(status.as_str())
        .bind(approver_id)
        .bind(to_rfc3339(decided_at))
        .bind(decision_comment)
        .bind(to_rfc3339(decided_at))
        .bind(id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LeaveError::IllegalTransition);
        }
        Ok(())
    }

    /// Deletes a leave outright.
    pub async fn delete(&self, id: &str) -> Result<(), LeaveError> {
        let result = sqlx::query("DELETE FROM leaves WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(LeaveError::NotFound);
        }
        Ok(())
    }

    /// Pending or approved leaves of one user intersecting a date range.
    pub async fn overlapping(
        &self,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        exclude_id: Option<&str>,
    ) -> Result<Vec<Leave>, LeaveError> {
        let rows = sqlx::query_as::<_, LeaveRow>(
            "SELECT * FROM leaves WHERE user_id = ? AND status IN ('PENDING', 'APPROVED') \
             AND start_date <= ? AND end_date >= ? AND id <> ? ORDER BY start_date",
        )
        .bind(user_id)
        .bind(end)
        .bind(start)
        .bind(exclude_id.unwrap_or(""))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LeaveRow::into_domain).collect()
    }

    /// Returns `true` when the user has a pending or approved leave covering `day`.
    pub async fn on_leave(&self, user_id: &str, day: NaiveDate) -> Result<bool, LeaveError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM leaves WHERE user_id = ? \
             AND status IN ('PENDING', 'APPROVED') AND start_date <= ? AND end_date >= ?",
        )
        .bind(user_id)
        .bind(day)
        .bind(day)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// Per-day count of absent colleagues of one professional role.
    ///
    /// Counts pending and approved leaves of active users holding `role`,
    /// excluding `exclude_user` (the requester).
    pub async fn absences_by_day(
        &self,
        role: &str,
        start: NaiveDate,
        end: NaiveDate,
        exclude_user: &str,
    ) -> Result<Vec<DayAbsenceRow>, LeaveError> {
        let rows = sqlx::query_as::<_, DayAbsenceRow>(
            "WITH RECURSIVE days(day) AS ( \
                 SELECT ? \
                 UNION ALL \
                 SELECT date(day, '+1 day') FROM days WHERE day < ? \
             ) \
             SELECT day, \
                    (SELECT COUNT(*) FROM leaves l \
                       JOIN users u ON u.id = l.user_id \
                      WHERE l.status IN ('PENDING', 'APPROVED') \
                        AND l.start_date <= days.day AND l.end_date >= days.day \
                        AND u.professional_role = ? AND u.active = 1 \
                        AND l.user_id <> ?) AS absent \
             FROM days",
        )
        .bind(start)
        .bind(end)
        .bind(role)
        .bind(exclude_user)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Per type and status counts plus total counted days over a period.
    pub async fn aggregate_for_period(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<LeaveAggregateRow>, LeaveError> {
        let rows = sqlx::query_as::<_, LeaveAggregateRow>(
            "SELECT type_code, status, COUNT(*) AS count, \
                    COALESCE(SUM(counted_days), 0) AS total_days \
             FROM leaves WHERE start_date <= ? AND end_date >= ? \
             GROUP BY type_code, status ORDER BY type_code, status",
        )
        .bind(to)
        .bind(from)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// A public holiday row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PublicHoliday {
    pub day: NaiveDate,
    pub label: String,
    pub region: Option<String>,
}

/// Repository for the `public_holidays` table.
#[derive(Clone)]
pub struct HolidayRepository {
    pool: SqlitePool,
}

impl HolidayRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces one holiday.
    pub async fn upsert(&self, holiday: &PublicHoliday) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO public_holidays (day, label, region) VALUES (?, ?, ?) \
             ON CONFLICT(day) DO UPDATE SET label = excluded.label, region = excluded.region",
        )
        .bind(holiday.day)
        .bind(&holiday.label)
        .bind(&holiday.region)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Lists holidays inside the inclusive range.
    pub async fn list_between(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<PublicHoliday>, sqlx::Error> {
        sqlx::query_as::<_, PublicHoliday>(
            "SELECT day, label, region FROM public_holidays WHERE day BETWEEN ? AND ? ORDER BY day",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::setup_db;
    use crate::users::NewUser;
    use anesth_roster_core::types::{ProfessionalRole, WorkPattern};
    use chrono::Weekday;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn seed_type(db: &crate::Database, code: &str) {
        db.leave_types()
            .upsert(&LeaveTypeSettings {
                code: code.to_string(),
                label: code.to_string(),
                counting_method: CountingMethod::WeekdaysIfWorking,
                max_duration_days: Some(30),
                min_lead_time_days: 0,
                approver_roles: vec![Role::Admin, Role::Planner],
                user_selectable: true,
                active: true,
            })
            .await
            .expect("seed type");
    }

    async fn seed_user(db: &crate::Database, login: &str, role: ProfessionalRole) -> String {
        let email = format!("{login}@example.org");
        db.users()
            .insert(NewUser {
                login,
                email: &email,
                first_name: "Test",
                last_name: login,
                role: Role::User,
                professional_role: role,
                work_pattern: WorkPattern::FullTime,
                weekdays_even: vec![
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                ],
                weekdays_odd: vec![
                    Weekday::Mon,
                    Weekday::Tue,
                    Weekday::Wed,
                    Weekday::Thu,
                    Weekday::Fri,
                ],
                part_time_percent: None,
                created_at: Utc::now(),
            })
            .await
            .expect("seed user")
    }

    async fn insert_leave(
        db: &crate::Database,
        user_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> String {
        let repo = db.leaves();
        let mut tx = repo.begin().await.expect("begin");
        let id = repo
            .insert(
                &mut tx,
                &NewLeave {
                    user_id,
                    type_code: "ANNUAL",
                    start_date: start,
                    end_date: end,
                    half_day_start: None,
                    half_day_end: None,
                    counted_days: 5.0,
                    reason: Some("summer"),
                    recurrence_group: None,
                    created_at: Utc::now(),
                },
            )
            .await
            .expect("insert leave");
        tx.commit().await.expect("commit");
        id
    }

    #[tokio::test]
    async fn leave_type_round_trips_approver_roles() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;

        let settings = db.leave_types().fetch("ANNUAL").await.expect("fetch");
        assert_eq!(settings.counting_method, CountingMethod::WeekdaysIfWorking);
        assert_eq!(settings.approver_roles, vec![Role::Admin, Role::Planner]);
        assert!(settings.user_selectable);
    }

    #[tokio::test]
    async fn insert_fetch_and_filtered_list() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;
        let user = seed_user(&db, "alice", ProfessionalRole::Mar).await;
        let id = insert_leave(&db, &user, date(2024, 7, 1), date(2024, 7, 5)).await;

        let leave = db.leaves().fetch(&id).await.expect("fetch");
        assert_eq!(leave.status, LeaveStatus::Pending);
        assert_eq!(leave.counted_days, 5.0);

        let listed = db
            .leaves()
            .list(&LeaveFilter {
                user_id: Some(user.clone()),
                status: Some(LeaveStatus::Pending),
                from: Some(date(2024, 7, 3)),
                to: Some(date(2024, 7, 31)),
                ..LeaveFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(listed.len(), 1);

        let outside = db
            .leaves()
            .list(&LeaveFilter {
                from: Some(date(2024, 8, 1)),
                ..LeaveFilter::default()
            })
            .await
            .expect("list");
        assert!(outside.is_empty());
    }

    #[tokio::test]
    async fn status_guard_blocks_double_decisions() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;
        let user = seed_user(&db, "alice", ProfessionalRole::Mar).await;
        let approver = seed_user(&db, "boss", ProfessionalRole::Mar).await;
        let id = insert_leave(&db, &user, date(2024, 7, 1), date(2024, 7, 5)).await;
        let repo = db.leaves();

        let mut tx = repo.begin().await.expect("begin");
        repo.set_status(
            &mut tx,
            &id,
            LeaveStatus::Approved,
            Some(&approver),
            Some("ok"),
            Utc::now(),
        )
        .await
        .expect("approve");
        tx.commit().await.expect("commit");

        let leave = repo.fetch(&id).await.expect("fetch");
        assert_eq!(leave.status, LeaveStatus::Approved);
        assert_eq!(leave.approver_id.as_deref(), Some(approver.as_str()));
        assert!(leave.decided_at.is_some());

        let mut tx = repo.begin().await.expect("begin");
        let err = repo
            .set_status(&mut tx, &id, LeaveStatus::Rejected, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, LeaveError::IllegalTransition));
    }

    #[tokio::test]
    async fn overlapping_ignores_terminal_leaves() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;
        let user = seed_user(&db, "alice", ProfessionalRole::Mar).await;
        let first = insert_leave(&db, &user, date(2024, 7, 1), date(2024, 7, 5)).await;
        let repo = db.leaves();

        let hits = repo
            .overlapping(&user, date(2024, 7, 4), date(2024, 7, 10), None)
            .await
            .expect("overlapping");
        assert_eq!(hits.len(), 1);

        // Excluding the hit itself returns nothing.
        let excluded = repo
            .overlapping(&user, date(2024, 7, 4), date(2024, 7, 10), Some(&first))
            .await
            .expect("overlapping");
        assert!(excluded.is_empty());

        let mut tx = repo.begin().await.expect("begin");
        repo.set_status(&mut tx, &first, LeaveStatus::Cancelled, None, None, Utc::now())
            .await
            .expect("cancel");
        tx.commit().await.expect("commit");

        let hits = repo
            .overlapping(&user, date(2024, 7, 4), date(2024, 7, 10), None)
            .await
            .expect("overlapping");
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn absences_by_day_counts_same_role_only() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;
        let requester = seed_user(&db, "alice", ProfessionalRole::Mar).await;
        let colleague = seed_user(&db, "bob", ProfessionalRole::Mar).await;
        let other_role = seed_user(&db, "carol", ProfessionalRole::Iade).await;

        insert_leave(&db, &colleague, date(2024, 7, 2), date(2024, 7, 3)).await;
        insert_leave(&db, &other_role, date(2024, 7, 2), date(2024, 7, 3)).await;
        // The requester's own leave must not count against them.
        insert_leave(&db, &requester, date(2024, 7, 1), date(2024, 7, 5)).await;

        let rows = db
            .leaves()
            .absences_by_day("MAR", date(2024, 7, 1), date(2024, 7, 4), &requester)
            .await
            .expect("absences");

        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].absent, 0);
        assert_eq!(rows[1].absent, 1);
        assert_eq!(rows[2].absent, 1);
        assert_eq!(rows[3].absent, 0);
    }

    #[tokio::test]
    async fn aggregates_group_by_type_and_status() {
        let db = setup_db().await;
        seed_type(&db, "ANNUAL").await;
        let user = seed_user(&db, "alice", ProfessionalRole::Mar).await;
        insert_leave(&db, &user, date(2024, 7, 1), date(2024, 7, 5)).await;
        insert_leave(&db, &user, date(2024, 8, 1), date(2024, 8, 5)).await;

        let rows = db
            .leaves()
            .aggregate_for_period(date(2024, 7, 1), date(2024, 8, 31))
            .await
            .expect("aggregate");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].type_code, "ANNUAL");
        assert_eq!(rows[0].status, "PENDING");
        assert_eq!(rows[0].count, 2);
        assert_eq!(rows[0].total_days, 10.0);
    }

    #[tokio::test]
    async fn holidays_list_in_range() {
        let db = setup_db().await;
        let repo = db.holidays();
        repo.upsert(&PublicHoliday {
            day: date(2024, 7, 14),
            label: "Bastille Day".to_string(),
            region: None,
        })
        .await
        .expect("upsert");
        repo.upsert(&PublicHoliday {
            day: date(2024, 12, 25),
            label: "Christmas".to_string(),
            region: None,
        })
        .await
        .expect("upsert");

        let july = repo
            .list_between(date(2024, 7, 1), date(2024, 7, 31))
            .await
            .expect("list");
        assert_eq!(july.len(), 1);
        assert_eq!(july[0].label, "Bastille Day");
    }
}
