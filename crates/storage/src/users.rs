use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use anesth_roster_core::types::{
    format_weekdays, parse_weekdays, ProfessionalRole, Role, WorkPattern, WorkSchedule,
};

use crate::{is_unique_violation, to_rfc3339};

/// A staff account as stored in the `users` table.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub login: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub professional_role: ProfessionalRole,
    pub work_pattern: WorkPattern,
    pub weekdays_even: String,
    pub weekdays_odd: String,
    pub part_time_percent: Option<f64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Resolves the work schedule used by leave-day counting.
    pub fn schedule(&self) -> WorkSchedule {
        WorkSchedule {
            pattern: self.work_pattern,
            weekdays_even: parse_weekdays(&self.weekdays_even),
            weekdays_odd: parse_weekdays(&self.weekdays_odd),
        }
    }
}

/// Parameters required to create a user.
pub struct NewUser<'a> {
    pub login: &'a str,
    pub email: &'a str,
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub role: Role,
    pub professional_role: ProfessionalRole,
    pub work_pattern: WorkPattern,
    pub weekdays_even: Vec<chrono::Weekday>,
    pub weekdays_odd: Vec<chrono::Weekday>,
    pub part_time_percent: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Optional field updates applied to an existing user.
#[derive(Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub professional_role: Option<ProfessionalRole>,
    pub work_pattern: Option<WorkPattern>,
    pub weekdays_even: Option<Vec<chrono::Weekday>>,
    pub weekdays_odd: Option<Vec<chrono::Weekday>>,
    pub part_time_percent: Option<Option<f64>>,
    pub active: Option<bool>,
}

/// Errors that can occur while reading or mutating users.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("login or email already in use")]
    Duplicate,
    #[error("user row holds an invalid {field} value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: String,
    login: String,
    email: String,
    first_name: String,
    last_name: String,
    role: String,
    professional_role: String,
    work_pattern: String,
    weekdays_even: String,
    weekdays_odd: String,
    part_time_percent: Option<f64>,
    active: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UserRow {
    fn into_domain(self) -> Result<User, UserError> {
        let role = Role::from_str(&self.role).map_err(|_| UserError::InvalidField {
            field: "role",
            value: self.role.clone(),
        })?;
        let professional_role = ProfessionalRole::from_str(&self.professional_role).map_err(|_| {
            UserError::InvalidField {
                field: "professional_role",
                value: self.professional_role.clone(),
            }
        })?;
        let work_pattern =
            WorkPattern::from_str(&self.work_pattern).map_err(|_| UserError::InvalidField {
                field: "work_pattern",
                value: self.work_pattern.clone(),
            })?;

        Ok(User {
            id: self.id,
            login: self.login,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            role,
            professional_role,
            work_pattern,
            weekdays_even: self.weekdays_even,
            weekdays_odd: self.weekdays_odd,
            part_time_percent: self.part_time_percent,
            active: self.active != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, login, email, first_name, last_name, role, \
     professional_role, work_pattern, weekdays_even, weekdays_odd, part_time_percent, \
     active, created_at, updated_at FROM users";

/// Repository for the `users` table.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new user and returns its generated identifier.
    pub async fn insert(&self, user: NewUser<'_>) -> Result<String, UserError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(user.created_at);
        sqlx::query(
            "INSERT INTO users \
             (id, login, email, first_name, last_name, role, professional_role, work_pattern, \
              weekdays_even, weekdays_odd, part_time_percent, active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(user.login)
        .bind(user.email)
        .bind(user.first_name)
        .bind(user.last_name)
        .bind(user.role.as_str())
        .bind(user.professional_role.as_str())
        .bind(user.work_pattern.as_str())
        .bind(format_weekdays(&user.weekdays_even))
        .bind(format_weekdays(&user.weekdays_odd))
        .bind(user.part_time_percent)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                UserError::Duplicate
            } else {
                UserError::Database(err)
            }
        })?;

        Ok(id)
    }

    /// Fetches one user by id.
    pub async fn fetch(&self, id: &str) -> Result<User, UserError> {
        let row = sqlx::query_as::<_, UserRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)?;
        row.into_domain()
    }

    /// Lists users ordered by last name, optionally only active accounts.
    pub async fn list(&self, active_only: bool) -> Result<Vec<User>, UserError> {
        let sql = if active_only {
            format!("{SELECT_COLUMNS} WHERE active = 1 ORDER BY last_name, first_name")
        } else {
            format!("{SELECT_COLUMNS} ORDER BY last_name, first_name")
        };
        let rows = sqlx::query_as::<_, UserRow>(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(UserRow::into_domain).collect()
    }

    /// Applies a partial update; unset fields keep their current value.
    pub async fn update(
        &self,
        id: &str,
        update: UserUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<User, UserError> {
        let current = self.fetch(id).await?;

        let part_time_percent = match update.part_time_percent {
            Some(value) => value,
            None => current.part_time_percent,
        };

        let result = sqlx::query(
            "UPDATE users SET email = ?, first_name = ?, last_name = ?, role = ?, \
             professional_role = ?, work_pattern = ?, weekdays_even = ?, weekdays_odd = ?, \
             part_time_percent = ?, active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(update.email.as_deref().unwrap_or(&current.email))
        .bind(update.first_name.as_deref().unwrap_or(&current.first_name))
        .bind(update.last_name.as_deref().unwrap_or(&current.last_name))
        .bind(update.role.unwrap_or(current.role).as_str())
        .bind(
            update
                .professional_role
                .unwrap_or(current.professional_role)
                .as_str(),
        )
        .bind(update.work_pattern.unwrap_or(current.work_pattern).as_str())
        .bind(
            update
                .weekdays_even
                .map(|days| format_weekdays(&days))
                .unwrap_or(current.weekdays_even.clone()),
        )
        .bind(
            update
                .weekdays_odd
                .map(|days| format_weekdays(&days))
                .unwrap_or(current.weekdays_odd.clone()),
        )
        .bind(part_time_percent)
        .bind(update.active.map(i64::from).unwrap_or(current.active as i64))
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                UserError::Duplicate
            } else {
                UserError::Database(err)
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(UserError::NotFound);
        }
        self.fetch(id).await
    }

    /// Counts active users holding the given professional role.
    pub async fn count_active_by_professional_role(
        &self,
        role: ProfessionalRole,
    ) -> Result<u32, UserError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM users WHERE professional_role = ? AND active = 1",
        )
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u32)
    }
}
