use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use crate::{is_foreign_key_violation, is_unique_violation, to_rfc3339};

/// An operating sector as stored in `operating_sectors`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OperatingSector {
    pub id: String,
    pub name: String,
    pub category: Option<String>,
    pub color_code: Option<String>,
    pub max_rooms_per_supervisor: i64,
    pub display_order: i64,
    pub active: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters required to create a sector.
pub struct NewOperatingSector<'a> {
    pub name: &'a str,
    pub category: Option<&'a str>,
    pub color_code: Option<&'a str>,
    pub max_rooms_per_supervisor: i64,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
}

/// Optional field updates for a sector.
#[derive(Default)]
pub struct SectorUpdate {
    pub name: Option<String>,
    pub category: Option<Option<String>>,
    pub color_code: Option<Option<String>>,
    pub max_rooms_per_supervisor: Option<i64>,
    pub display_order: Option<i64>,
    pub active: Option<bool>,
}

/// Errors raised by the sector repository.
#[derive(Debug, Error)]
pub enum SectorError {
    #[error("operating sector not found")]
    NotFound,
    #[error("a sector with this name already exists")]
    Duplicate,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `operating_sectors` table.
#[derive(Clone)]
pub struct SectorRepository {
    pool: SqlitePool,
}

impl SectorRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new sector and returns its generated identifier.
    pub async fn insert(&self, sector: NewOperatingSector<'_>) -> Result<String, SectorError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(sector.created_at);
        sqlx::query(
            "INSERT INTO operating_sectors \
             (id, name, category, color_code, max_rooms_per_supervisor, display_order, active, \
              created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(sector.name)
        .bind(sector.category)
        .bind(sector.color_code)
        .bind(sector.max_rooms_per_supervisor)
        .bind(sector.display_order)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                SectorError::Duplicate
            } else {
                SectorError::Database(err)
            }
        })?;

        Ok(id)
    }

    /// Fetches one sector by id.
    pub async fn fetch(&self, id: &str) -> Result<OperatingSector, SectorError> {
        sqlx::query_as::<_, OperatingSector>("SELECT * FROM operating_sectors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SectorError::NotFound)
    }

    /// Lists sectors in display order.
    pub async fn list(&self, active_only: bool) -> Result<Vec<OperatingSector>, SectorError> {
        let sql = if active_only {
            "SELECT * FROM operating_sectors WHERE active = 1 ORDER BY display_order, name"
        } else {
            "SELECT * FROM operating_sectors ORDER BY display_order, name"
        };
        Ok(sqlx::query_as::<_, OperatingSector>(sql)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Applies a partial update; unset fields keep their current value.
    pub async fn update(
        &self,
        id: &str,
        update: SectorUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<OperatingSector, SectorError> {
        let current = self.fetch(id).await?;

        sqlx::query(
            "UPDATE operating_sectors SET name = ?, category = ?, color_code = ?, \
             max_rooms_per_supervisor = ?, display_order = ?, active = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(update.name.as_deref().unwrap_or(&current.name))
        .bind(update.category.unwrap_or(current.category))
        .bind(update.color_code.unwrap_or(current.color_code))
        .bind(
            update
                .max_rooms_per_supervisor
                .unwrap_or(current.max_rooms_per_supervisor),
        )
        .bind(update.display_order.unwrap_or(current.display_order))
        .bind(update.active.map(i64::from).unwrap_or(current.active))
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                SectorError::Duplicate
            } else {
                SectorError::Database(err)
            }
        })?;

        self.fetch(id).await
    }
}

/// An operating room as stored in `operating_rooms`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OperatingRoom {
    pub id: String,
    pub sector_id: String,
    pub name: String,
    pub room_number: String,
    pub supervision_rule: Option<String>,
    pub active: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters required to create a room.
pub struct NewOperatingRoom<'a> {
    pub sector_id: &'a str,
    pub name: &'a str,
    pub room_number: &'a str,
    pub supervision_rule: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

/// Optional field updates for a room.
#[derive(Default)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub room_number: Option<String>,
    pub supervision_rule: Option<Option<String>>,
    pub active: Option<bool>,
}

/// Errors raised by the room repository.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("operating room not found")]
    NotFound,
    #[error("room number already used inside this sector")]
    DuplicateNumber,
    #[error("referenced operating sector does not exist")]
    MissingSector,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `operating_rooms` table.
#[derive(Clone)]
pub struct RoomRepository {
    pool: SqlitePool,
}

impl RoomRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Inserts a new room and returns its generated identifier.
    pub async fn insert(&self, room: NewOperatingRoom<'_>) -> Result<String, RoomError> {
        let id = Uuid::new_v4().to_string();
        let now = to_rfc3339(room.created_at);
        sqlx::query(
            "INSERT INTO operating_rooms \
             (id, sector_id, name, room_number, supervision_rule, active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(room.sector_id)
        .bind(room.name)
        .bind(room.room_number)
        .bind(room.supervision_rule)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RoomError::DuplicateNumber
            } else if is_foreign_key_violation(&err) {
                RoomError::MissingSector
            } else {
                RoomError::Database(err)
            }
        })?;

        Ok(id)
    }

    /// Fetches one room by id.
    pub async fn fetch(&self, id: &str) -> Result<OperatingRoom, RoomError> {
        sqlx::query_as::<_, OperatingRoom>("SELECT * FROM operating_rooms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RoomError::NotFound)
    }

    /// Lists rooms, optionally restricted to one sector.
    pub async fn list(&self, sector_id: Option<&str>) -> Result<Vec<OperatingRoom>, RoomError> {
        let rows = match sector_id {
            Some(sector) => {
                sqlx::query_as::<_, OperatingRoom>(
                    "SELECT * FROM operating_rooms WHERE sector_id = ? ORDER BY room_number",
                )
                .bind(sector)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, OperatingRoom>(
                    "SELECT * FROM operating_rooms ORDER BY sector_id, room_number",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows)
    }

    /// Applies a partial update; unset fields keep their current value.
    pub async fn update(
        &self,
        id: &str,
        update: RoomUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<OperatingRoom, RoomError> {
        let current = self.fetch(id).await?;

        sqlx::query(
            "UPDATE operating_rooms SET name = ?, room_number = ?, supervision_rule = ?, \
             active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(update.name.as_deref().unwrap_or(&current.name))
        .bind(update.room_number.as_deref().unwrap_or(&current.room_number))
        .bind(update.supervision_rule.unwrap_or(current.supervision_rule))
        .bind(update.active.map(i64::from).unwrap_or(current.active))
        .bind(to_rfc3339(updated_at))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RoomError::DuplicateNumber
            } else {
                RoomError::Database(err)
            }
        })?;

        self.fetch(id).await
    }
}
