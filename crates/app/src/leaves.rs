use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Datelike, Days, NaiveDate};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use anesth_roster_core::conflict::{
    detect_conflicts, has_blocking, Conflict, ConflictInputs, DayAbsence, OverlappingLeave,
};
use anesth_roster_core::counting::{counted_days, CountingInput};
use anesth_roster_core::types::{DayPart, Leave, LeaveStatus, NotificationKind};
use anesth_roster_storage::{
    BalanceError, LeaveError, LeaveFilter, LeaveTypeError, LeaveTypeSettings, NewAuditEntry,
    NewLeave, User, UserError,
};

use crate::auth::{authenticate, AuthContext};
use crate::problem::ProblemResponse;
use crate::push;
use crate::router::AppState;

const MAX_RECURRENCE_WEEKS: u32 = 26;

fn map_leave_error(err: LeaveError) -> ProblemResponse {
    match err {
        LeaveError::NotFound => ProblemResponse::not_found("leave not found"),
        LeaveError::IllegalTransition => ProblemResponse::conflict(
            "illegal_transition",
            "leave is not in a state that allows this operation",
        ),
        other => ProblemResponse::internal(other.to_string()),
    }
}

async fn load_target_user(state: &AppState, user_id: &str) -> Result<User, ProblemResponse> {
    state
        .storage()
        .users()
        .fetch(user_id)
        .await
        .map_err(|err| match err {
            UserError::NotFound => {
                ProblemResponse::bad_request("unknown_user", "target user does not exist")
            }
            other => ProblemResponse::internal(other.to_string()),
        })
}

async fn load_leave_type(
    state: &AppState,
    code: &str,
) -> Result<LeaveTypeSettings, ProblemResponse> {
    let settings = state
        .storage()
        .leave_types()
        .fetch(code)
        .await
        .map_err(|err| match err {
            LeaveTypeError::NotFound => {
                ProblemResponse::bad_request("unknown_leave_type", "leave type does not exist")
            }
            other => ProblemResponse::internal(other.to_string()),
        })?;
    if !settings.active {
        return Err(ProblemResponse::bad_request(
            "unknown_leave_type",
            "leave type is no longer active",
        ));
    }
    Ok(settings)
}

async fn compute_counted(
    state: &AppState,
    user: &User,
    settings: &LeaveTypeSettings,
    start: NaiveDate,
    end: NaiveDate,
    half_day_start: Option<DayPart>,
    half_day_end: Option<DayPart>,
) -> Result<f64, ProblemResponse> {
    let holidays: HashSet<NaiveDate> = state
        .storage()
        .holidays()
        .list_between(start, end)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .into_iter()
        .map(|holiday| holiday.day)
        .collect();

    let schedule = user.schedule();
    counted_days(&CountingInput {
        start,
        end,
        half_day_start,
        half_day_end,
        method: settings.counting_method,
        schedule: &schedule,
        holidays: &holidays,
    })
    .map_err(|err| ProblemResponse::bad_request("invalid_range", err.to_string()))
}

async fn gather_conflicts(
    state: &AppState,
    user: &User,
    start: NaiveDate,
    end: NaiveDate,
    exclude_id: Option<&str>,
) -> Result<Vec<Conflict>, ProblemResponse> {
    let storage = state.storage();

    let overlapping: Vec<OverlappingLeave> = storage
        .leaves()
        .overlapping(&user.id, start, end, exclude_id)
        .await
        .map_err(map_leave_error)?
        .into_iter()
        .map(|leave| OverlappingLeave {
            id: leave.id,
            start: leave.start_date,
            end: leave.end_date,
            status: leave.status,
        })
        .collect();

    let role_headcount = storage
        .users()
        .count_active_by_professional_role(user.professional_role)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let absent_by_day: Vec<DayAbsence> = storage
        .leaves()
        .absences_by_day(user.professional_role.as_str(), start, end, &user.id)
        .await
        .map_err(map_leave_error)?
        .into_iter()
        .map(|row| DayAbsence {
            date: row.day,
            absent: row.absent.max(0) as u32,
        })
        .collect();

    let window_start = start.checked_sub_days(Days::new(1)).unwrap_or(start);
    let window_end = end.checked_add_days(Days::new(1)).unwrap_or(end);
    let holidays: Vec<(NaiveDate, String)> = storage
        .holidays()
        .list_between(window_start, window_end)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .into_iter()
        .map(|holiday| (holiday.day, holiday.label))
        .collect();

    let conflicts = detect_conflicts(&ConflictInputs {
        start,
        end,
        overlapping_own: &overlapping,
        role_headcount,
        absent_by_day: &absent_by_day,
        team_absence_threshold: state.team_absence_threshold(),
        holidays: &holidays,
    });

    for conflict in &conflicts {
        counter!("conflicts_detected_total", "kind" => conflict.kind.as_str()).increment(1);
    }

    Ok(conflicts)
}

async fn record_audit(state: &AppState, actor: &str, action: &str, leave_id: &str, detail: Value) {
    let result = state
        .storage()
        .audit()
        .append(NewAuditEntry {
            actor_id: actor,
            action,
            entity_type: "leave",
            entity_id: leave_id,
            detail,
            created_at: state.now(),
        })
        .await;
    if let Err(err) = result {
        warn!(stage = "audit", leave_id, error = %err, "failed to append audit entry");
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    status: Option<LeaveStatus>,
    #[serde(default, rename = "type")]
    type_code: Option<String>,
    #[serde(default)]
    from: Option<NaiveDate>,
    #[serde(default)]
    to: Option<NaiveDate>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Leave>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;

    // Plain users only ever see their own requests.
    let user_id = if auth.role.can_plan() {
        query.user_id
    } else {
        Some(auth.user_id.clone())
    };

    let leaves = state
        .storage()
        .leaves()
        .list(&LeaveFilter {
            user_id,
            status: query.status,
            type_code: query.type_code,
            from: query.from,
            to: query.to,
            limit: query.limit,
            offset: query.offset,
        })
        .await
        .map_err(map_leave_error)?;
    Ok(Json(leaves))
}

pub async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Leave>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    let leave = state.storage().leaves().fetch(&id).await.map_err(map_leave_error)?;
    auth.require_self_or_planner(&leave.user_id)?;
    Ok(Json(leave))
}

#[derive(Debug, Deserialize)]
pub struct CreateLeaveBody {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(rename = "type")]
    type_code: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
    #[serde(default)]
    half_day_start: Option<DayPart>,
    #[serde(default)]
    half_day_end: Option<DayPart>,
    #[serde(default)]
    reason: Option<String>,
    /// Additional weekly repetitions creating a recurrence series.
    #[serde(default)]
    repeat_weeks: Option<u32>,
    /// Planner override for blocking conflicts.
    #[serde(default)]
    force: bool,
}

struct Occurrence {
    start: NaiveDate,
    end: NaiveDate,
    counted: f64,
}

struct ValidatedRequest {
    user: User,
    settings: LeaveTypeSettings,
    occurrences: Vec<Occurrence>,
    conflicts: Vec<Conflict>,
    rule_violations: Vec<String>,
    rule_warnings: Vec<String>,
}

/// Evaluates the stored `LEAVE` planning rules against one occurrence.
async fn evaluate_leave_rules(
    state: &AppState,
    user: &User,
    settings: &LeaveTypeSettings,
    occurrence: &Occurrence,
) -> Result<(Vec<String>, Vec<String>), ProblemResponse> {
    let rules: Vec<_> = state
        .storage()
        .rules()
        .list_by_types(&["LEAVE".to_string()])
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .into_iter()
        .filter(|rule| rule.applies_to("leave.create"))
        .collect();
    if rules.is_empty() {
        return Ok((Vec::new(), Vec::new()));
    }

    let context = json!({
        "leave": {
            "type": settings.code,
            "start_date": occurrence.start,
            "end_date": occurrence.end,
            "counted_days": occurrence.counted,
        },
        "user": {
            "id": user.id,
            "role": user.role,
            "professional_role": user.professional_role,
        },
    });

    let outcome = state
        .engine()
        .check(&rules, &context)
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    counter!("rule_evaluations_total").increment(rules.len() as u64);

    let describe = |evaluation: &anesth_roster_core::rules::RuleEvaluation| {
        evaluation
            .fired_actions
            .iter()
            .find_map(|action| action.message.clone())
            .unwrap_or_else(|| evaluation.rule_name.clone())
    };
    Ok((
        outcome.violations.iter().map(describe).collect(),
        outcome.warnings.iter().map(describe).collect(),
    ))
}

async fn validate_request(
    state: &AppState,
    auth: &AuthContext,
    body: &CreateLeaveBody,
) -> Result<ValidatedRequest, ProblemResponse> {
    let target_id = body.user_id.as_deref().unwrap_or(&auth.user_id);
    auth.require_self_or_planner(target_id)?;

    let user = load_target_user(state, target_id).await?;
    let settings = load_leave_type(state, &body.type_code).await?;

    if !settings.user_selectable && !auth.role.can_plan() {
        return Err(ProblemResponse::forbidden(
            "this leave type can only be requested by a planner",
        ));
    }

    if body.end_date < body.start_date {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "end_date is before start_date",
        ));
    }

    if let Some(max) = settings.max_duration_days {
        let span = (body.end_date - body.start_date).num_days() + 1;
        if span > max {
            return Err(ProblemResponse::bad_request(
                "duration_exceeded",
                format!("leave spans {span} days, maximum is {max}"),
            ));
        }
    }

    if !auth.role.can_plan() && settings.min_lead_time_days > 0 {
        let today = state.now().date_naive();
        let lead = (body.start_date - today).num_days();
        if lead < settings.min_lead_time_days {
            return Err(ProblemResponse::bad_request(
                "lead_time",
                format!(
                    "requests of this type need {} days of notice",
                    settings.min_lead_time_days
                ),
            ));
        }
    }

    let repeats = body.repeat_weeks.unwrap_or(0);
    if repeats > MAX_RECURRENCE_WEEKS {
        return Err(ProblemResponse::bad_request(
            "recurrence_too_long",
            format!("at most {MAX_RECURRENCE_WEEKS} weekly repetitions are allowed"),
        ));
    }

    let mut occurrences = Vec::with_capacity(repeats as usize + 1);
    let mut conflicts = Vec::new();
    let mut rule_violations = Vec::new();
    let mut rule_warnings = Vec::new();
    for index in 0..=repeats {
        let offset = Days::new(u64::from(index) * 7);
        let start = body
            .start_date
            .checked_add_days(offset)
            .ok_or_else(|| ProblemResponse::bad_request("invalid_range", "date out of range"))?;
        let end = body
            .end_date
            .checked_add_days(offset)
            .ok_or_else(|| ProblemResponse::bad_request("invalid_range", "date out of range"))?;

        let counted = compute_counted(
            state,
            &user,
            &settings,
            start,
            end,
            body.half_day_start,
            body.half_day_end,
        )
        .await?;
        conflicts.extend(gather_conflicts(state, &user, start, end, None).await?);
        let occurrence = Occurrence {
            start,
            end,
            counted,
        };
        let (violations, warnings) =
            evaluate_leave_rules(state, &user, &settings, &occurrence).await?;
        rule_violations.extend(violations);
        rule_warnings.extend(warnings);
        occurrences.push(occurrence);
    }

    Ok(ValidatedRequest {
        user,
        settings,
        occurrences,
        conflicts,
        rule_violations,
        rule_warnings,
    })
}

fn needed_per_year(occurrences: &[Occurrence]) -> BTreeMap<i64, f64> {
    let mut needed = BTreeMap::new();
    for occurrence in occurrences {
        *needed.entry(i64::from(occurrence.start.year())).or_insert(0.0) += occurrence.counted;
    }
    needed
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLeaveBody>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    let ValidatedRequest {
        user,
        settings,
        occurrences,
        conflicts,
        rule_violations,
        rule_warnings,
    } = validate_request(&state, &auth, &body).await?;

    let forced = body.force && auth.role.can_plan();
    if has_blocking(&conflicts) && !forced {
        counter!("leave_requests_total", "outcome" => "blocked").increment(1);
        let detail = conflicts
            .iter()
            .filter(|conflict| conflict.is_blocking())
            .map(|conflict| conflict.message.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ProblemResponse::bad_request("blocking_conflict", detail));
    }
    if !rule_violations.is_empty() && !forced {
        counter!("leave_requests_total", "outcome" => "rule_violation").increment(1);
        return Err(ProblemResponse::bad_request(
            "rule_violation",
            rule_violations.join("; "),
        ));
    }

    // Reject before writing anything when a tracked balance cannot cover it.
    let needed = needed_per_year(&occurrences);
    let balances = state.storage().balances();
    for (year, days) in &needed {
        let balance = balances
            .fetch(&user.id, &settings.code, *year)
            .await
            .map_err(|err| ProblemResponse::internal(err.to_string()))?;
        if let Some(balance) = balance {
            if balance.view().remaining() < *days {
                counter!("leave_requests_total", "outcome" => "insufficient_balance").increment(1);
                return Err(ProblemResponse::bad_request(
                    "insufficient_balance",
                    format!(
                        "{} days requested for {year} but only {} remaining",
                        days,
                        balance.view().remaining()
                    ),
                ));
            }
        }
    }

    let recurrence_group = if occurrences.len() > 1 {
        Some(Uuid::new_v4().to_string())
    } else {
        None
    };

    let repo = state.storage().leaves();
    let now = state.now();
    let mut tx = repo
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    let mut ids = Vec::with_capacity(occurrences.len());
    for occurrence in &occurrences {
        let id = repo
            .insert(
                &mut tx,
                &NewLeave {
                    user_id: &user.id,
                    type_code: &settings.code,
                    start_date: occurrence.start,
                    end_date: occurrence.end,
                    half_day_start: body.half_day_start,
                    half_day_end: body.half_day_end,
                    counted_days: occurrence.counted,
                    reason: body.reason.as_deref(),
                    recurrence_group: recurrence_group.as_deref(),
                    created_at: now,
                },
            )
            .await
            .map_err(map_leave_error)?;
        ids.push(id);
    }
    for (year, days) in &needed {
        balances
            .add_pending(&mut tx, &user.id, &settings.code, *year, *days, now)
            .await
            .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    }
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    counter!("leave_requests_total", "outcome" => "created").increment(1);
    info!(
        stage = "leaves",
        user_id = %user.id,
        type_code = %settings.code,
        occurrences = occurrences.len(),
        "leave request created"
    );

    if auth.user_id != user.id {
        record_audit(
            &state,
            &auth.user_id,
            "leave.create",
            &ids[0],
            json!({"user_id": user.id, "type": settings.code, "count": ids.len()}),
        )
        .await;
        push::deliver(
            &state,
            &user.id,
            NotificationKind::LeaveRequested,
            "Leave requested on your behalf",
            &format!(
                "A {} leave from {} to {} was filed for you",
                settings.code, body.start_date, body.end_date
            ),
            Some(&format!("/leaves/{}", ids[0])),
        )
        .await;
    }

    let mut leaves = Vec::with_capacity(ids.len());
    for id in &ids {
        leaves.push(repo.fetch(id).await.map_err(map_leave_error)?);
    }
    let warnings: Vec<&Conflict> = conflicts.iter().filter(|c| !c.is_blocking()).collect();
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "leaves": leaves,
            "conflicts": warnings,
            "rule_warnings": rule_warnings,
        })),
    ))
}

/// Dry-run validation: counted days and conflicts, nothing persisted.
pub async fn check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateLeaveBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    let ValidatedRequest {
        occurrences,
        conflicts,
        rule_violations,
        rule_warnings,
        ..
    } = validate_request(&state, &auth, &body).await?;

    let total: f64 = occurrences.iter().map(|occurrence| occurrence.counted).sum();
    Ok(Json(json!({
        "counted_days": total,
        "occurrences": occurrences
            .iter()
            .map(|occurrence| json!({
                "start_date": occurrence.start,
                "end_date": occurrence.end,
                "counted_days": occurrence.counted,
            }))
            .collect::<Vec<_>>(),
        "conflicts": conflicts,
        "rule_violations": rule_violations,
        "rule_warnings": rule_warnings,
        "blocking": has_blocking(&conflicts) || !rule_violations.is_empty(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateLeaveBody {
    #[serde(default)]
    start_date: Option<NaiveDate>,
    #[serde(default)]
    end_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "double_option")]
    half_day_start: Option<Option<DayPart>>,
    #[serde(default, deserialize_with = "double_option")]
    half_day_end: Option<Option<DayPart>>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    force: bool,
}

/// Distinguishes an absent field (no change) from an explicit `null` (clear).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateLeaveBody>,
) -> Result<Json<Leave>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    let repo = state.storage().leaves();
    let leave = repo.fetch(&id).await.map_err(map_leave_error)?;
    auth.require_self_or_planner(&leave.user_id)?;

    if leave.status != LeaveStatus::Pending {
        return Err(ProblemResponse::conflict(
            "illegal_transition",
            "only pending leaves can be modified",
        ));
    }

    let user = load_target_user(&state, &leave.user_id).await?;
    let settings = load_leave_type(&state, &leave.type_code).await?;

    let start = body.start_date.unwrap_or(leave.start_date);
    let end = body.end_date.unwrap_or(leave.end_date);
    let half_day_start = body.half_day_start.unwrap_or(leave.half_day_start);
    let half_day_end = body.half_day_end.unwrap_or(leave.half_day_end);
    let reason = body.reason.or_else(|| leave.reason.clone());

    if end < start {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "end_date is before start_date",
        ));
    }

    let counted =
        compute_counted(&state, &user, &settings, start, end, half_day_start, half_day_end)
            .await?;
    let conflicts = gather_conflicts(&state, &user, start, end, Some(&leave.id)).await?;
    if has_blocking(&conflicts) && !(body.force && auth.role.can_plan()) {
        let detail = conflicts
            .iter()
            .filter(|conflict| conflict.is_blocking())
            .map(|conflict| conflict.message.clone())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ProblemResponse::bad_request("blocking_conflict", detail));
    }

    let now = state.now();
    let balances = state.storage().balances();
    let mut tx = repo
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    repo.update_request(
        &mut tx,
        &leave.id,
        start,
        end,
        half_day_start,
        half_day_end,
        counted,
        reason.as_deref(),
        now,
    )
    .await
    .map_err(map_leave_error)?;

    // The pending bucket follows the request: release the old reservation,
    // take the new one (possibly in a different year).
    match balances
        .release_pending(
            &mut tx,
            &leave.user_id,
            &leave.type_code,
            i64::from(leave.start_date.year()),
            leave.counted_days,
            now,
        )
        .await
    {
        Ok(()) | Err(BalanceError::NotFound) => {}
        Err(err) => return Err(ProblemResponse::internal(err.to_string())),
    }
    balances
        .add_pending(
            &mut tx,
            &leave.user_id,
            &leave.type_code,
            i64::from(start.year()),
            counted,
            now,
        )
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let updated = repo.fetch(&id).await.map_err(map_leave_error)?;
    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_admin()?;

    let repo = state.storage().leaves();
    let leave = repo.fetch(&id).await.map_err(map_leave_error)?;

    if leave.status == LeaveStatus::Pending {
        let now = state.now();
        let balances = state.storage().balances();
        let mut tx = repo
            .begin()
            .await
            .map_err(|err| ProblemResponse::internal(err.to_string()))?;
        match balances
            .release_pending(
                &mut tx,
                &leave.user_id,
                &leave.type_code,
                i64::from(leave.start_date.year()),
                leave.counted_days,
                now,
            )
            .await
        {
            Ok(()) | Err(BalanceError::NotFound) => {}
            Err(err) => return Err(ProblemResponse::internal(err.to_string())),
        }
        tx.commit()
            .await
            .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    }

    repo.delete(&id).await.map_err(map_leave_error)?;
    record_audit(&state, &auth.user_id, "leave.delete", &id, json!({})).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionBody {
    #[serde(default)]
    comment: Option<String>,
}

pub async fn approve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> Result<Json<Leave>, ProblemResponse> {
    decide(state, headers, id, LeaveStatus::Approved, body.map(|b| b.0)).await
}

pub async fn reject(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<DecisionBody>>,
) -> Result<Json<Leave>, ProblemResponse> {
    decide(state, headers, id, LeaveStatus::Rejected, body.map(|b| b.0)).await
}

async fn decide(
    state: AppState,
    headers: HeaderMap,
    id: String,
    decision: LeaveStatus,
    body: Option<DecisionBody>,
) -> Result<Json<Leave>, ProblemResponse> {
    let started = Instant::now();
    let auth = authenticate(state.validator(), &headers, state.now())?;

    let repo = state.storage().leaves();
    let leave = repo.fetch(&id).await.map_err(map_leave_error)?;
    let settings = load_leave_type(&state, &leave.type_code).await?;

    if !settings.approver_roles.contains(&auth.role) {
        return Err(ProblemResponse::forbidden(
            "your role may not decide this leave type",
        ));
    }
    if leave.status != LeaveStatus::Pending {
        return Err(ProblemResponse::conflict(
            "illegal_transition",
            format!("leave is already {}", leave.status),
        ));
    }

    let comment = body.and_then(|body| body.comment);
    let now = state.now();
    let balances = state.storage().balances();
    let year = i64::from(leave.start_date.year());

    let mut tx = repo
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    repo.set_status(
        &mut tx,
        &leave.id,
        decision,
        Some(&auth.user_id),
        comment.as_deref(),
        now,
    )
    .await
    .map_err(map_leave_error)?;

    let balance_move = if decision == LeaveStatus::Approved {
        balances
            .settle_pending(&mut tx, &leave.user_id, &leave.type_code, year, leave.counted_days, now)
            .await
    } else {
        balances
            .release_pending(&mut tx, &leave.user_id, &leave.type_code, year, leave.counted_days, now)
            .await
    };
    match balance_move {
        Ok(()) => {}
        Err(BalanceError::NotFound) => {
            // Types without a tracked quota have no balance row to move.
            warn!(stage = "leaves", leave_id = %leave.id, "no balance row for decided leave");
        }
        Err(err) => return Err(ProblemResponse::internal(err.to_string())),
    }
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let decision_label = if decision == LeaveStatus::Approved {
        "approved"
    } else {
        "rejected"
    };
    counter!("leave_decisions_total", "decision" => decision_label).increment(1);
    histogram!("leave_decision_latency_seconds").record(started.elapsed().as_secs_f64());
    info!(stage = "leaves", leave_id = %leave.id, decision = decision_label, "leave decided");

    record_audit(
        &state,
        &auth.user_id,
        &format!("leave.{decision_label}"),
        &leave.id,
        json!({"user_id": leave.user_id, "comment": comment}),
    )
    .await;
    if auth.user_id != leave.user_id {
        let kind = if decision == LeaveStatus::Approved {
            NotificationKind::LeaveApproved
        } else {
            NotificationKind::LeaveRejected
        };
        push::deliver(
            &state,
            &leave.user_id,
            kind,
            &format!("Leave {decision_label}"),
            &format!(
                "Your {} leave from {} to {} was {decision_label}",
                leave.type_code, leave.start_date, leave.end_date
            ),
            Some(&format!("/leaves/{}", leave.id)),
        )
        .await;
    }

    let updated = repo.fetch(&id).await.map_err(map_leave_error)?;
    Ok(Json(updated))
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Leave>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;

    let repo = state.storage().leaves();
    let leave = repo.fetch(&id).await.map_err(map_leave_error)?;
    auth.require_self_or_planner(&leave.user_id)?;

    if leave.status != LeaveStatus::Pending {
        return Err(ProblemResponse::conflict(
            "illegal_transition",
            format!("leave is already {}", leave.status),
        ));
    }

    let now = state.now();
    let balances = state.storage().balances();
    let mut tx = repo
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    repo.set_status(&mut tx, &leave.id, LeaveStatus::Cancelled, None, None, now)
        .await
        .map_err(map_leave_error)?;
    match balances
        .release_pending(
            &mut tx,
            &leave.user_id,
            &leave.type_code,
            i64::from(leave.start_date.year()),
            leave.counted_days,
            now,
        )
        .await
    {
        Ok(()) | Err(BalanceError::NotFound) => {}
        Err(err) => return Err(ProblemResponse::internal(err.to_string())),
    }
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    counter!("leave_decisions_total", "decision" => "cancelled").increment(1);
    record_audit(&state, &auth.user_id, "leave.cancel", &leave.id, json!({})).await;
    if auth.user_id != leave.user_id {
        push::deliver(
            &state,
            &leave.user_id,
            NotificationKind::LeaveCancelled,
            "Leave cancelled",
            &format!(
                "Your {} leave from {} to {} was cancelled",
                leave.type_code, leave.start_date, leave.end_date
            ),
            Some(&format!("/leaves/{}", leave.id)),
        )
        .await;
    }

    let updated = repo.fetch(&id).await.map_err(map_leave_error)?;
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::app_router;
    use crate::testutil::{
        request, response_json, seed_leave_type, seed_user, setup_state, token_for,
    };
    use anesth_roster_core::types::{ProfessionalRole, Role};
    use tower::ServiceExt;

    async fn allowance(state: &AppState, user: &str, year: i64, days: f64) {
        state
            .storage()
            .balances()
            .upsert_allowance(user, "ANNUAL", year, days, state.now())
            .await
            .expect("allowance");
    }

    #[tokio::test]
    async fn create_counts_days_and_reserves_balance() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        allowance(&state, &alice, 2024, 25.0).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state.clone());

        // Mon 2024-07-01 .. Fri 2024-07-05 is five working days.
        let response = app
            .oneshot(request(
                "POST",
                "/api/leaves",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                    "reason": "summer",
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["leaves"][0]["counted_days"], json!(5.0));
        assert_eq!(body["leaves"][0]["status"], "PENDING");

        let balance = state
            .storage()
            .balances()
            .fetch(&alice, "ANNUAL", 2024)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(balance.pending, 5.0);
    }

    #[tokio::test]
    async fn overlapping_request_is_blocked() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state.clone());

        let first = request(
            "POST",
            "/api/leaves",
            &token,
            Some(json!({
                "type": "ANNUAL",
                "start_date": "2024-07-01",
                "end_date": "2024-07-05",
            })),
        );
        assert_eq!(
            app.clone().oneshot(first).await.expect("response").status(),
            StatusCode::CREATED
        );

        let overlapping = request(
            "POST",
            "/api/leaves",
            &token,
            Some(json!({
                "type": "ANNUAL",
                "start_date": "2024-07-03",
                "end_date": "2024-07-08",
            })),
        );
        let response = app.oneshot(overlapping).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert_eq!(body["type"], "blocking_conflict");
    }

    #[tokio::test]
    async fn insufficient_balance_is_rejected() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        allowance(&state, &alice, 2024, 2.0).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request(
                "POST",
                "/api/leaves",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert_eq!(body["type"], "insufficient_balance");
    }

    #[tokio::test]
    async fn approve_moves_pending_to_used_and_notifies() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let planner = seed_user(&state, "planner", Role::Planner, ProfessionalRole::Mar).await;
        allowance(&state, &alice, 2024, 25.0).await;
        let user_token = token_for(&alice, Role::User, state.now());
        let planner_token = token_for(&planner, Role::Planner, state.now());
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/leaves",
                &user_token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let leave_id = body["leaves"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/leaves/{leave_id}/approve"),
                &planner_token,
                Some(json!({"comment": "enjoy"})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let decided = response_json(response).await;
        assert_eq!(decided["status"], "APPROVED");
        assert_eq!(decided["decision_comment"], "enjoy");

        let balance = state
            .storage()
            .balances()
            .fetch(&alice, "ANNUAL", 2024)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(balance.pending, 0.0);
        assert_eq!(balance.used, 5.0);

        let inbox = state
            .storage()
            .notifications()
            .list_for_user(&alice, true, 10)
            .await
            .expect("inbox");
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].kind, "leave.approved");
    }

    #[tokio::test]
    async fn decisions_on_decided_leaves_conflict() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let planner = seed_user(&state, "planner", Role::Planner, ProfessionalRole::Mar).await;
        let user_token = token_for(&alice, Role::User, state.now());
        let planner_token = token_for(&planner, Role::Planner, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/leaves",
                &user_token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let leave_id = body["leaves"][0]["id"].as_str().unwrap().to_string();

        let approve = |app: axum::Router, token: String, id: String| async move {
            app.oneshot(request(
                "POST",
                &format!("/api/leaves/{id}/approve"),
                &token,
                None,
            ))
            .await
            .expect("response")
        };

        let first = approve(app.clone(), planner_token.clone(), leave_id.clone()).await;
        assert_eq!(first.status(), StatusCode::OK);
        let second = approve(app, planner_token, leave_id).await;
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn plain_users_cannot_approve() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/leaves",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let leave_id = body["leaves"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/leaves/{leave_id}/approve"),
                &token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn owner_cancels_pending_leave() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        allowance(&state, &alice, 2024, 25.0).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state.clone());

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/leaves",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        let leave_id = body["leaves"][0]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/leaves/{leave_id}/cancel"),
                &token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["status"], "CANCELLED");

        let balance = state
            .storage()
            .balances()
            .fetch(&alice, "ANNUAL", 2024)
            .await
            .expect("fetch")
            .expect("row");
        assert_eq!(balance.pending, 0.0);
    }

    #[tokio::test]
    async fn recurrence_creates_a_series() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        // Three consecutive Mondays.
        let response = app
            .oneshot(request(
                "POST",
                "/api/leaves",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-01",
                    "repeat_weeks": 2,
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        let leaves = body["leaves"].as_array().unwrap();
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[1]["start_date"], "2024-07-08");
        let group = leaves[0]["recurrence_group"].as_str().unwrap();
        assert!(leaves.iter().all(|leave| leave["recurrence_group"] == group));
    }

    #[tokio::test]
    async fn check_reports_without_writing() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state.clone());

        let response = app
            .oneshot(request(
                "POST",
                "/api/leaves/check",
                &token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                    "half_day_end": "AM",
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["counted_days"], json!(4.5));
        assert_eq!(body["blocking"], json!(false));

        let listed = state
            .storage()
            .leaves()
            .list(&LeaveFilter::default())
            .await
            .expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn forbid_rule_blocks_creation_unless_forced() {
        use anesth_roster_core::rules::{
            Condition, ConditionOperator, RuleAction, RuleActionKind,
        };
        use anesth_roster_storage::NewPlanningRule;

        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let planner = seed_user(&state, "planner", Role::Planner, ProfessionalRole::Mar).await;
        state
            .storage()
            .rules()
            .insert(NewPlanningRule {
                name: "short leaves only",
                rule_type: "LEAVE",
                description: None,
                priority: 5,
                enabled: true,
                contexts: vec!["leave.create".to_string()],
                conditions: vec![Condition {
                    field: "leave.counted_days".to_string(),
                    operator: ConditionOperator::GreaterThan,
                    value: json!(3),
                }],
                condition_groups: Vec::new(),
                actions: vec![RuleAction {
                    kind: RuleActionKind::Forbid,
                    message: Some("leaves above 3 days need direct planning".to_string()),
                }],
                created_at: state.now(),
            })
            .await
            .expect("seed rule");

        let alice_token = token_for(&alice, Role::User, state.now());
        let planner_token = token_for(&planner, Role::Planner, state.now());
        let app = app_router(state);

        let payload = json!({
            "user_id": alice,
            "type": "ANNUAL",
            "start_date": "2024-07-01",
            "end_date": "2024-07-05",
        });
        let response = app
            .clone()
            .oneshot(request("POST", "/api/leaves", &alice_token, Some(payload.clone())))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response_json(response).await;
        assert_eq!(body["type"], "rule_violation");

        let mut forced = payload;
        forced["force"] = json!(true);
        let response = app
            .oneshot(request("POST", "/api/leaves", &planner_token, Some(forced)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn list_is_scoped_for_plain_users() {
        let state = setup_state().await;
        seed_leave_type(&state, "ANNUAL").await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let bob = seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let alice_token = token_for(&alice, Role::User, state.now());
        let bob_token = token_for(&bob, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/leaves",
                &alice_token,
                Some(json!({
                    "type": "ANNUAL",
                    "start_date": "2024-07-01",
                    "end_date": "2024-07-05",
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);

        // Bob asking for Alice's id still only sees his own (empty) list.
        let response = app
            .oneshot(request(
                "GET",
                &format!("/api/leaves?user_id={alice}"),
                &bob_token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }
}
