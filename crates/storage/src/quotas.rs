use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::quota::{BalanceView, CarryOverKind, CarryOverRule, TransferRule};

use crate::to_rfc3339;

/// One (user, type, year) balance row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct LeaveBalance {
    pub user_id: String,
    pub type_code: String,
    pub year: i64,
    pub allowance: f64,
    pub carried_over: f64,
    pub carry_over_expires: Option<NaiveDate>,
    pub used: f64,
    pub pending: f64,
    pub updated_at: DateTime<Utc>,
}

impl LeaveBalance {
    /// Projects the row into the arithmetic view used by core.
    pub fn view(&self) -> BalanceView {
        BalanceView {
            allowance: self.allowance,
            carried_over: self.carried_over,
            used: self.used,
            pending: self.pending,
        }
    }
}

/// Errors raised while mutating balances.
#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("balance not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `leave_balances` table.
///
/// Bucket mutations run inside a caller-provided transaction so the balance
/// moves together with the leave or transfer row that justifies them.
#[derive(Clone)]
pub struct BalanceRepository {
    pool: SqlitePool,
}

impl BalanceRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Begins a SQLite transaction for multi-step writes.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Fetches one balance row when it exists.
    pub async fn fetch(
        &self,
        user_id: &str,
        type_code: &str,
        year: i64,
    ) -> Result<Option<LeaveBalance>, BalanceError> {
        let row = sqlx::query_as::<_, LeaveBalance>(
            "SELECT * FROM leave_balances WHERE user_id = ? AND type_code = ? AND year = ?",
        )
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Lists all balances of one user for a year.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        year: i64,
    ) -> Result<Vec<LeaveBalance>, BalanceError> {
        let rows = sqlx::query_as::<_, LeaveBalance>(
            "SELECT * FROM leave_balances WHERE user_id = ? AND year = ? ORDER BY type_code",
        )
        .bind(user_id)
        .bind(year)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Sets the yearly allowance, creating the row when needed.
    pub async fn upsert_allowance(
        &self,
        user_id: &str,
        type_code: &str,
        year: i64,
        allowance: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        sqlx::query(
            "INSERT INTO leave_balances (user_id, type_code, year, allowance, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, type_code, year) DO UPDATE \
             SET allowance = excluded.allowance, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .bind(allowance)
        .bind(to_rfc3339(updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves days into the pending bucket, creating the row when needed.
    pub async fn add_pending(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        type_code: &str,
        year: i64,
        days: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        sqlx::query(
            "INSERT INTO leave_balances (user_id, type_code, year, pending, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, type_code, year) DO UPDATE \
             SET pending = pending + excluded.pending, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .bind(days)
        .bind(to_rfc3339(updated_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Releases days from the pending bucket.
    pub async fn release_pending(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        type_code: &str,
        year: i64,
        days: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        let result = sqlx::query(
            "UPDATE leave_balances SET pending = MAX(0, pending - ?), updated_at = ? \
             WHERE user_id = ? AND type_code = ? AND year = ?",
        )
        .bind(days)
        .bind(to_rfc3339(updated_at))
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BalanceError::NotFound);
        }
        Ok(())
    }

    /// Moves days from the pending to the used bucket on approval.
    pub async fn settle_pending(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        type_code: &str,
        year: i64,
        days: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        let result = sqlx::query(
            "UPDATE leave_balances SET pending = MAX(0, pending - ?), used = used + ?, \
             updated_at = ? WHERE user_id = ? AND type_code = ? AND year = ?",
        )
        .bind(days)
        .bind(days)
        .bind(to_rfc3339(updated_at))
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BalanceError::NotFound);
        }
        Ok(())
    }

    /// Adds (or removes, with a negative delta) allowance days.
    pub async fn adjust_allowance(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        type_code: &str,
        year: i64,
        delta: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        sqlx::query(
            "INSERT INTO leave_balances (user_id, type_code, year, allowance, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, type_code, year) DO UPDATE \
             SET allowance = allowance + excluded.allowance, updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .bind(delta)
        .bind(to_rfc3339(updated_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Credits a carry-over into the next year's balance with its expiry date.
    pub async fn credit_carry_over(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        type_code: &str,
        year: i64,
        days: f64,
        expires_on: Option<NaiveDate>,
        updated_at: DateTime<Utc>,
    ) -> Result<(), BalanceError> {
        sqlx::query(
            "INSERT INTO leave_balances \
             (user_id, type_code, year, carried_over, carry_over_expires, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, type_code, year) DO UPDATE \
             SET carried_over = carried_over + excluded.carried_over, \
                 carry_over_expires = excluded.carry_over_expires, \
                 updated_at = excluded.updated_at",
        )
        .bind(user_id)
        .bind(type_code)
        .bind(year)
        .bind(days)
        .bind(expires_on)
        .bind(to_rfc3339(updated_at))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

/// Errors raised while reading quota rules.
#[derive(Debug, Error)]
pub enum QuotaRuleError {
    #[error("quota rule row holds invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct TransferRuleRow {
    from_type: String,
    to_type: String,
    conversion_rate: f64,
    max_days_per_year: Option<f64>,
    max_source_fraction: Option<f64>,
    requires_approval: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct CarryOverRuleRow {
    rule_kind: String,
    value: f64,
    max_days: Option<f64>,
    expires_after_days: Option<i64>,
}

/// Executed transfer audit row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct QuotaTransferRecord {
    pub id: String,
    pub user_id: String,
    pub year: i64,
    pub from_type: String,
    pub to_type: String,
    pub requested_days: f64,
    pub converted_days: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters recorded for an executed transfer.
pub struct NewQuotaTransfer<'a> {
    pub user_id: &'a str,
    pub year: i64,
    pub from_type: &'a str,
    pub to_type: &'a str,
    pub requested_days: f64,
    pub converted_days: f64,
    pub created_at: DateTime<Utc>,
}

/// Repository for quota transfer and carry-over configuration.
#[derive(Clone)]
pub struct QuotaRuleRepository {
    pool: SqlitePool,
}

impl QuotaRuleRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetches the active transfer rule for a (from, to) pair.
    pub async fn transfer_rule(
        &self,
        from_type: &str,
        to_type: &str,
    ) -> Result<Option<TransferRule>, QuotaRuleError> {
        let row = sqlx::query_as::<_, TransferRuleRow>(
            "SELECT from_type, to_type, conversion_rate, max_days_per_year, \
                    max_source_fraction, requires_approval \
             FROM quota_transfer_rules WHERE from_type = ? AND to_type = ? AND active = 1",
        )
        .bind(from_type)
        .bind(to_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| TransferRule {
            from_type: row.from_type,
            to_type: row.to_type,
            conversion_rate: row.conversion_rate,
            max_days_per_year: row.max_days_per_year,
            max_source_fraction: row.max_source_fraction,
            requires_approval: row.requires_approval != 0,
        }))
    }

    /// Inserts or replaces a transfer rule.
    pub async fn upsert_transfer_rule(&self, rule: &TransferRule) -> Result<(), QuotaRuleError> {
        sqlx::query(
            "INSERT INTO quota_transfer_rules \
             (id, from_type, to_type, conversion_rate, max_days_per_year, max_source_fraction, \
              requires_approval, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1) \
             ON CONFLICT(from_type, to_type) DO UPDATE \
             SET conversion_rate = excluded.conversion_rate, \
                 max_days_per_year = excluded.max_days_per_year, \
                 max_source_fraction = excluded.max_source_fraction, \
                 requires_approval = excluded.requires_approval, active = 1",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&rule.from_type)
        .bind(&rule.to_type)
        .bind(rule.conversion_rate)
        .bind(rule.max_days_per_year)
        .bind(rule.max_source_fraction)
        .bind(rule.requires_approval as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetches the active carry-over rule for a leave type.
    pub async fn carry_over_rule(
        &self,
        type_code: &str,
    ) -> Result<Option<CarryOverRule>, QuotaRuleError> {
        let row = sqlx::query_as::<_, CarryOverRuleRow>(
            "SELECT rule_kind, value, max_days, expires_after_days \
             FROM quota_carry_over_rules WHERE type_code = ? AND active = 1",
        )
        .bind(type_code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let kind: CarryOverKind =
                row.rule_kind
                    .parse()
                    .map_err(|_| QuotaRuleError::InvalidField {
                        field: "rule_kind",
                        value: row.rule_kind.clone(),
                    })?;
            Ok(CarryOverRule {
                kind,
                value: row.value,
                max_days: row.max_days,
                expires_after_days: row.expires_after_days.map(|days| days.max(0) as u64),
            })
        })
        .transpose()
    }

    /// Inserts or replaces a carry-over rule.
    pub async fn upsert_carry_over_rule(
        &self,
        type_code: &str,
        rule: &CarryOverRule,
    ) -> Result<(), QuotaRuleError> {
        sqlx::query(
            "INSERT INTO quota_carry_over_rules \
             (type_code, rule_kind, value, max_days, expires_after_days, active) \
             VALUES (?, ?, ?, ?, ?, 1) \
             ON CONFLICT(type_code) DO UPDATE \
             SET rule_kind = excluded.rule_kind, value = excluded.value, \
                 max_days = excluded.max_days, \
                 expires_after_days = excluded.expires_after_days, active = 1",
        )
        .bind(type_code)
        .bind(rule.kind.as_str())
        .bind(rule.value)
        .bind(rule.max_days)
        .bind(rule.expires_after_days.map(|days| days as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records an executed transfer inside the surrounding transaction.
    pub async fn record_transfer(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        transfer: &NewQuotaTransfer<'_>,
    ) -> Result<String, QuotaRuleError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO quota_transfers \
             (id, user_id, year, from_type, to_type, requested_days, converted_days, status, \
              created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'EXECUTED', ?)",
        )
        .bind(&id)
        .bind(transfer.user_id)
        .bind(transfer.year)
        .bind(transfer.from_type)
        .bind(transfer.to_type)
        .bind(transfer.requested_days)
        .bind(transfer.converted_days)
        .bind(to_rfc3339(transfer.created_at))
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Sum of source days already moved through a rule this year.
    pub async fn transferred_total(
        &self,
        user_id: &str,
        from_type: &str,
        to_type: &str,
        year: i64,
    ) -> Result<f64, QuotaRuleError> {
        let row: (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(requested_days), 0.0) FROM quota_transfers \
             WHERE user_id = ? AND from_type = ? AND to_type = ? AND year = ? \
             AND status = 'EXECUTED'",
        )
        .bind(user_id)
        .bind(from_type)
        .bind(to_type)
        .bind(year)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Lists executed transfers of one user for a year.
    pub async fn list_transfers(
        &self,
        user_id: &str,
        year: i64,
    ) -> Result<Vec<QuotaTransferRecord>, QuotaRuleError> {
        let rows = sqlx::query_as::<_, QuotaTransferRecord>(
            "SELECT * FROM quota_transfers WHERE user_id = ? AND year = ? ORDER BY created_at",
        )
        .bind(user_id)
        .bind(year)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaves::LeaveTypeSettings;
    use crate::testing::setup_db;
    use crate::users::NewUser;
    use anesth_roster_core::types::{
        CountingMethod, ProfessionalRole, Role, WorkPattern,
    };
    use chrono::Weekday;

    async fn seed(db: &crate::Database) -> String {
        for code in ["ANNUAL", "RECOVERY"] {
            db.leave_types()
                .upsert(&LeaveTypeSettings {
                    code: code.to_string(),
                    label: code.to_string(),
                    counting_method: CountingMethod::WeekdaysIfWorking,
                    max_duration_days: None,
                    min_lead_time_days: 0,
                    approver_roles: vec![Role::Planner],
                    user_selectable: true,
                    active: true,
                })
                .await
                .expect("seed type");
        }
        db.users()
            .insert(NewUser {
                login: "alice",
                email: "alice@example.org",
                first_name: "Alice",
                last_name: "Martin",
                role: Role::User,
                professional_role: ProfessionalRole::Iade,
                work_pattern: WorkPattern::FullTime,
                weekdays_even: vec![Weekday::Mon, Weekday::Tue],
                weekdays_odd: vec![Weekday::Mon, Weekday::Tue],
                part_time_percent: None,
                created_at: Utc::now(),
            })
            .await
            .expect("seed user")
    }

    #[tokio::test]
    async fn pending_lifecycle_moves_between_buckets() {
        let db = setup_db().await;
        let user = seed(&db).await;
        let repo = db.balances();

        repo.upsert_allowance(&user, "ANNUAL", 2024, 25.0, Utc::now())
            .await
            .expect("allowance");

        let mut tx = repo.begin().await.expect("begin");
        repo.add_pending(&mut tx, &user, "ANNUAL", 2024, 5.0, Utc::now())
            .await
            .expect("add pending");
        tx.commit().await.expect("commit");

        let balance = repo
            .fetch(&user, "ANNUAL", 2024)
            .await
            .expect("fetch")
            .expect("row exists");
        assert_eq!(balance.pending, 5.0);
        assert_eq!(balance.view().remaining(), 20.0);

        let mut tx = repo.begin().await.expect("begin");
        repo.settle_pending(&mut tx, &user, "ANNUAL", 2024, 5.0, Utc::now())
            .await
            .expect("settle");
        tx.commit().await.expect("commit");

        let balance = repo
            .fetch(&user, "ANNUAL", 2024)
            .await
            .expect("fetch")
            .expect("row exists");
        assert_eq!(balance.pending, 0.0);
        assert_eq!(balance.used, 5.0);
        assert_eq!(balance.view().remaining(), 20.0);
    }

    #[tokio::test]
    async fn transfer_rule_round_trip_and_totals() {
        let db = setup_db().await;
        let user = seed(&db).await;
        let repo = db.quota_rules();

        repo.upsert_transfer_rule(&TransferRule {
            from_type: "RECOVERY".to_string(),
            to_type: "ANNUAL".to_string(),
            conversion_rate: 0.8,
            max_days_per_year: Some(10.0),
            max_source_fraction: Some(0.5),
            requires_approval: false,
        })
        .await
        .expect("upsert rule");

        let rule = repo
            .transfer_rule("RECOVERY", "ANNUAL")
            .await
            .expect("fetch rule")
            .expect("rule exists");
        assert_eq!(rule.conversion_rate, 0.8);
        assert!(!rule.requires_approval);

        assert!(repo
            .transfer_rule("ANNUAL", "RECOVERY")
            .await
            .expect("fetch")
            .is_none());

        let balances = db.balances();
        let mut tx = balances.begin().await.expect("begin");
        repo.record_transfer(
            &mut tx,
            &NewQuotaTransfer {
                user_id: &user,
                year: 2024,
                from_type: "RECOVERY",
                to_type: "ANNUAL",
                requested_days: 3.0,
                converted_days: 2.5,
                created_at: Utc::now(),
            },
        )
        .await
        .expect("record");
        tx.commit().await.expect("commit");

        let total = repo
            .transferred_total(&user, "RECOVERY", "ANNUAL", 2024)
            .await
            .expect("total");
        assert_eq!(total, 3.0);

        let transfers = repo.list_transfers(&user, 2024).await.expect("list");
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].converted_days, 2.5);
    }

    #[tokio::test]
    async fn carry_over_credits_next_year() {
        let db = setup_db().await;
        let user = seed(&db).await;
        let balances = db.balances();
        let rules = db.quota_rules();

        rules
            .upsert_carry_over_rule(
                "ANNUAL",
                &CarryOverRule {
                    kind: CarryOverKind::Percentage,
                    value: 50.0,
                    max_days: Some(5.0),
                    expires_after_days: Some(90),
                },
            )
            .await
            .expect("upsert");

        let rule = rules
            .carry_over_rule("ANNUAL")
            .await
            .expect("fetch")
            .expect("rule exists");
        assert_eq!(rule.kind, CarryOverKind::Percentage);

        let expires = NaiveDate::from_ymd_opt(2025, 4, 1);
        let mut tx = balances.begin().await.expect("begin");
        balances
            .credit_carry_over(&mut tx, &user, "ANNUAL", 2025, 4.0, expires, Utc::now())
            .await
            .expect("credit");
        tx.commit().await.expect("commit");

        let balance = balances
            .fetch(&user, "ANNUAL", 2025)
            .await
            .expect("fetch")
            .expect("row exists");
        assert_eq!(balance.carried_over, 4.0);
        assert_eq!(balance.carry_over_expires, expires);
    }

    #[tokio::test]
    async fn release_pending_requires_existing_row() {
        let db = setup_db().await;
        let user = seed(&db).await;
        let repo = db.balances();

        let mut tx = repo.begin().await.expect("begin");
        let err = repo
            .release_pending(&mut tx, &user, "ANNUAL", 2024, 1.0, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BalanceError::NotFound));
    }
}
