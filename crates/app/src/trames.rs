use std::collections::BTreeSet;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Datelike, Days, NaiveDate};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use anesth_roster_core::types::{ActivityKind, NotificationKind, Period, WeekParity};
use anesth_roster_storage::{
    AssignmentError, NewAssignment, NewAuditEntry, NewTrame, NewTrameSlot, TrameError,
    TrameTemplate,
};

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::push;
use crate::router::AppState;
use crate::users::parse_weekday_list;

const MAX_APPLY_DAYS: i64 = 366;

fn map_trame_error(err: TrameError) -> ProblemResponse {
    match err {
        TrameError::NotFound => ProblemResponse::not_found("trame template not found"),
        TrameError::Duplicate => {
            ProblemResponse::bad_request("duplicate_trame", "a template with this name exists")
        }
        other => ProblemResponse::internal(other.to_string()),
    }
}

fn trame_view(trame: &TrameTemplate) -> Value {
    json!({
        "id": trame.id,
        "name": trame.name,
        "week_parity": trame.week_parity,
        "active": trame.active,
        "slots": trame.slots
            .iter()
            .map(|slot| json!({
                "id": slot.id,
                "weekday": format!("{:?}", slot.weekday).to_uppercase(),
                "period": slot.period,
                "room_id": slot.room_id,
                "activity_kind": slot.activity_kind,
                "user_id": slot.user_id,
            }))
            .collect::<Vec<_>>(),
    })
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let trames = state.storage().trames().list().await.map_err(map_trame_error)?;
    Ok(Json(trames.iter().map(trame_view).collect()))
}

#[derive(Debug, Deserialize)]
pub struct SlotBody {
    weekday: String,
    period: Period,
    #[serde(default)]
    room_id: Option<String>,
    #[serde(default = "default_activity")]
    activity_kind: ActivityKind,
    #[serde(default)]
    user_id: Option<String>,
}

fn default_activity() -> ActivityKind {
    ActivityKind::Room
}

#[derive(Debug, Deserialize)]
pub struct CreateTrameBody {
    name: String,
    #[serde(default = "default_parity")]
    week_parity: WeekParity,
    slots: Vec<SlotBody>,
}

fn default_parity() -> WeekParity {
    WeekParity::All
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTrameBody>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if body.name.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_trame",
            "name is required",
        ));
    }
    if body.slots.is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_trame",
            "a template needs at least one slot",
        ));
    }

    let mut slots = Vec::with_capacity(body.slots.len());
    for slot in &body.slots {
        let weekday = parse_weekday_list(&[slot.weekday.clone()])?
            .into_iter()
            .next()
            .expect("single weekday parsed");
        slots.push(NewTrameSlot {
            weekday,
            period: slot.period,
            room_id: slot.room_id.clone(),
            activity_kind: slot.activity_kind,
            user_id: slot.user_id.clone(),
        });
    }

    let repo = state.storage().trames();
    let id = repo
        .insert(NewTrame {
            name: &body.name,
            week_parity: body.week_parity,
            slots,
            created_at: state.now(),
        })
        .await
        .map_err(map_trame_error)?;

    let trame = repo.fetch(&id).await.map_err(map_trame_error)?;
    Ok((StatusCode::CREATED, Json(trame_view(&trame))))
}

#[derive(Debug, Deserialize)]
pub struct ApplyBody {
    from: NaiveDate,
    to: NaiveDate,
}

/// Generates assignments from a template over a date range.
///
/// Dates whose weekday and ISO-week parity match a staffed slot produce one
/// assignment each; slots are skipped when the user is away or already
/// assigned, and every skip carries its reason in the response.
pub async fn apply(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<ApplyBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if body.to < body.from {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "to is before from",
        ));
    }
    if (body.to - body.from).num_days() >= MAX_APPLY_DAYS {
        return Err(ProblemResponse::bad_request(
            "range_too_long",
            format!("a template can cover at most {MAX_APPLY_DAYS} days per application"),
        ));
    }

    let trame = state.storage().trames().fetch(&id).await.map_err(map_trame_error)?;
    if !trame.active {
        return Err(ProblemResponse::conflict(
            "inactive_trame",
            "template is inactive",
        ));
    }

    let leaves = state.storage().leaves();
    let assignments = state.storage().assignments();
    let now = state.now();

    let mut created = 0u64;
    let mut skipped: Vec<Value> = Vec::new();
    let mut affected: BTreeSet<String> = BTreeSet::new();

    let mut tx = assignments
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let mut day = body.from;
    loop {
        if trame.week_parity.matches(day) {
            for slot in &trame.slots {
                if slot.weekday != day.weekday() {
                    continue;
                }
                let Some(user_id) = &slot.user_id else {
                    skipped.push(json!({
                        "date": day,
                        "slot_id": slot.id,
                        "reason": "unstaffed",
                    }));
                    continue;
                };

                if leaves
                    .on_leave(user_id, day)
                    .await
                    .map_err(|err| ProblemResponse::internal(err.to_string()))?
                {
                    skipped.push(json!({
                        "date": day,
                        "slot_id": slot.id,
                        "reason": "on_leave",
                    }));
                    continue;
                }

                if assignments
                    .occupied(user_id, day, slot.period)
                    .await
                    .map_err(|err| ProblemResponse::internal(err.to_string()))?
                {
                    skipped.push(json!({
                        "date": day,
                        "slot_id": slot.id,
                        "reason": "occupied",
                    }));
                    continue;
                }

                let insert = assignments
                    .insert(
                        &mut tx,
                        &NewAssignment {
                            user_id,
                            room_id: slot.room_id.as_deref(),
                            day,
                            period: slot.period,
                            activity_kind: slot.activity_kind,
                            trame_id: Some(&trame.id),
                            created_at: now,
                        },
                    )
                    .await;
                match insert {
                    Ok(_) => {
                        created += 1;
                        affected.insert(user_id.clone());
                    }
                    // Same-run collisions (two slots staffing one user on one
                    // day) surface as a skip, not a failure.
                    Err(AssignmentError::SlotTaken) => {
                        skipped.push(json!({
                            "date": day,
                            "slot_id": slot.id,
                            "reason": "occupied",
                        }));
                    }
                    Err(err) => return Err(ProblemResponse::internal(err.to_string())),
                }
            }
        }
        if day == body.to {
            break;
        }
        day = day
            .checked_add_days(Days::new(1))
            .ok_or_else(|| ProblemResponse::bad_request("invalid_range", "date out of range"))?;
    }

    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    counter!("trame_assignments_total", "result" => "created").increment(created);
    counter!("trame_assignments_total", "result" => "skipped").increment(skipped.len() as u64);
    info!(
        stage = "trames",
        trame_id = %trame.id,
        created,
        skipped = skipped.len(),
        "trame applied"
    );

    let audit = state
        .storage()
        .audit()
        .append(NewAuditEntry {
            actor_id: &auth.user_id,
            action: "trame.apply",
            entity_type: "trame",
            entity_id: &trame.id,
            detail: json!({
                "from": body.from,
                "to": body.to,
                "created": created,
                "skipped": skipped.len(),
            }),
            created_at: now,
        })
        .await;
    if let Err(err) = audit {
        tracing::warn!(stage = "audit", error = %err, "failed to append trame audit entry");
    }

    for user_id in &affected {
        if user_id != &auth.user_id {
            push::deliver(
                &state,
                user_id,
                NotificationKind::TrameApplied,
                "Planning updated",
                &format!(
                    "Template {} added assignments for you between {} and {}",
                    trame.name, body.from, body.to
                ),
                None,
            )
            .await;
        }
    }

    Ok(Json(json!({
        "trame_id": trame.id,
        "created": created,
        "skipped": skipped,
    })))
}
