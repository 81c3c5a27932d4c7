use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};

use anesth_roster_storage::{
    NewOperatingRoom, NewOperatingSector, OperatingRoom, OperatingSector, RoomError, RoomUpdate,
    SectorError, SectorUpdate,
};

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Wire representation of a sector.
#[derive(Debug, Serialize)]
pub struct SectorView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_code: Option<String>,
    pub max_rooms_per_supervisor: i64,
    pub display_order: i64,
    pub active: bool,
}

impl From<OperatingSector> for SectorView {
    fn from(sector: OperatingSector) -> Self {
        Self {
            id: sector.id,
            name: sector.name,
            category: sector.category,
            color_code: sector.color_code,
            max_rooms_per_supervisor: sector.max_rooms_per_supervisor,
            display_order: sector.display_order,
            active: sector.active != 0,
        }
    }
}

/// Wire representation of a room.
#[derive(Debug, Serialize)]
pub struct RoomView {
    pub id: String,
    pub sector_id: String,
    pub name: String,
    pub room_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_rule: Option<String>,
    pub active: bool,
}

impl From<OperatingRoom> for RoomView {
    fn from(room: OperatingRoom) -> Self {
        Self {
            id: room.id,
            sector_id: room.sector_id,
            name: room.name,
            room_number: room.room_number,
            supervision_rule: room.supervision_rule,
            active: room.active != 0,
        }
    }
}

fn map_sector_error(err: SectorError) -> ProblemResponse {
    match err {
        SectorError::NotFound => ProblemResponse::not_found("operating sector not found"),
        SectorError::Duplicate => {
            ProblemResponse::bad_request("duplicate_sector", "a sector with this name exists")
        }
        other => ProblemResponse::internal(other.to_string()),
    }
}

fn map_room_error(err: RoomError) -> ProblemResponse {
    match err {
        RoomError::NotFound => ProblemResponse::not_found("operating room not found"),
        RoomError::DuplicateNumber => ProblemResponse::bad_request(
            "duplicate_room",
            "room number already used inside this sector",
        ),
        RoomError::MissingSector => {
            ProblemResponse::bad_request("unknown_sector", "referenced sector does not exist")
        }
        other => ProblemResponse::internal(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct SectorListQuery {
    #[serde(default)]
    active: Option<bool>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SectorListQuery>,
) -> Result<Json<Vec<SectorView>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let sectors = state
        .storage()
        .sectors()
        .list(query.active.unwrap_or(false))
        .await
        .map_err(map_sector_error)?;
    Ok(Json(sectors.into_iter().map(SectorView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateSectorBody {
    name: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    color_code: Option<String>,
    #[serde(default = "default_max_rooms")]
    max_rooms_per_supervisor: i64,
    #[serde(default)]
    display_order: i64,
}

fn default_max_rooms() -> i64 {
    2
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateSectorBody>,
) -> Result<(StatusCode, Json<SectorView>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if body.name.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_sector",
            "name is required",
        ));
    }
    if body.max_rooms_per_supervisor < 1 {
        return Err(ProblemResponse::bad_request(
            "invalid_sector",
            "max_rooms_per_supervisor must be at least 1",
        ));
    }

    let repo = state.storage().sectors();
    let id = repo
        .insert(NewOperatingSector {
            name: &body.name,
            category: body.category.as_deref(),
            color_code: body.color_code.as_deref(),
            max_rooms_per_supervisor: body.max_rooms_per_supervisor,
            display_order: body.display_order,
            created_at: state.now(),
        })
        .await
        .map_err(map_sector_error)?;

    let sector = repo.fetch(&id).await.map_err(map_sector_error)?;
    Ok((StatusCode::CREATED, Json(SectorView::from(sector))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSectorBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    category: Option<Option<String>>,
    #[serde(default)]
    color_code: Option<Option<String>>,
    #[serde(default)]
    max_rooms_per_supervisor: Option<i64>,
    #[serde(default)]
    display_order: Option<i64>,
    #[serde(default)]
    active: Option<bool>,
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateSectorBody>,
) -> Result<Json<SectorView>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let sector = state
        .storage()
        .sectors()
        .update(
            &id,
            SectorUpdate {
                name: body.name,
                category: body.category,
                color_code: body.color_code,
                max_rooms_per_supervisor: body.max_rooms_per_supervisor,
                display_order: body.display_order,
                active: body.active,
            },
            state.now(),
        )
        .await
        .map_err(map_sector_error)?;
    Ok(Json(SectorView::from(sector)))
}

#[derive(Debug, Deserialize)]
pub struct RoomListQuery {
    #[serde(default)]
    sector_id: Option<String>,
}

pub async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RoomListQuery>,
) -> Result<Json<Vec<RoomView>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let rooms = state
        .storage()
        .rooms()
        .list(query.sector_id.as_deref())
        .await
        .map_err(map_room_error)?;
    Ok(Json(rooms.into_iter().map(RoomView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateRoomBody {
    sector_id: String,
    name: String,
    room_number: String,
    #[serde(default)]
    supervision_rule: Option<String>,
}

pub async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<RoomView>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if body.name.trim().is_empty() || body.room_number.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_room",
            "name and room_number are required",
        ));
    }

    let repo = state.storage().rooms();
    let id = repo
        .insert(NewOperatingRoom {
            sector_id: &body.sector_id,
            name: &body.name,
            room_number: &body.room_number,
            supervision_rule: body.supervision_rule.as_deref(),
            created_at: state.now(),
        })
        .await
        .map_err(map_room_error)?;

    let room = repo.fetch(&id).await.map_err(map_room_error)?;
    Ok((StatusCode::CREATED, Json(RoomView::from(room))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRoomBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    room_number: Option<String>,
    #[serde(default)]
    supervision_rule: Option<Option<String>>,
    #[serde(default)]
    active: Option<bool>,
}

pub async fn update_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRoomBody>,
) -> Result<Json<RoomView>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let room = state
        .storage()
        .rooms()
        .update(
            &id,
            RoomUpdate {
                name: body.name,
                room_number: body.room_number,
                supervision_rule: body.supervision_rule,
                active: body.active,
            },
            state.now(),
        )
        .await
        .map_err(map_room_error)?;
    Ok(Json(RoomView::from(room)))
}
