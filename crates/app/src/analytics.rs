use std::str::FromStr;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use anesth_roster_core::types::ProfessionalRole;

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct PeriodQuery {
    from: NaiveDate,
    to: NaiveDate,
}

/// Per-type and per-status leave counts plus total counted days for a period.
pub async fn leaves(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PeriodQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if query.to < query.from {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "to is before from",
        ));
    }

    let rows = state
        .storage()
        .leaves()
        .aggregate_for_period(query.from, query.to)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let total_days: f64 = rows.iter().map(|row| row.total_days).sum();
    let total_requests: i64 = rows.iter().map(|row| row.count).sum();
    Ok(Json(json!({
        "from": query.from,
        "to": query.to,
        "total_requests": total_requests,
        "total_days": total_days,
        "by_type_and_status": rows
            .iter()
            .map(|row| json!({
                "type": row.type_code,
                "status": row.status,
                "count": row.count,
                "days": row.total_days,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct AbsenceRateQuery {
    role: String,
    from: NaiveDate,
    to: NaiveDate,
}

/// Per-day absent headcount and rate for one professional role.
pub async fn absence_rate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AbsenceRateQuery>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if query.to < query.from {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "to is before from",
        ));
    }
    let role = ProfessionalRole::from_str(&query.role).map_err(|_| {
        ProblemResponse::bad_request("invalid_role", "role must be MAR, IADE or SECRETARY")
    })?;

    let headcount = state
        .storage()
        .users()
        .count_active_by_professional_role(role)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let rows = state
        .storage()
        .leaves()
        .absences_by_day(role.as_str(), query.from, query.to, "")
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    Ok(Json(json!({
        "role": role,
        "headcount": headcount,
        "days": rows
            .iter()
            .map(|row| {
                let rate = if headcount > 0 {
                    row.absent as f64 / f64::from(headcount)
                } else {
                    0.0
                };
                json!({
                    "date": row.day,
                    "absent": row.absent,
                    "rate": rate,
                })
            })
            .collect::<Vec<_>>(),
    })))
}
