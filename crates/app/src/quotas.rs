use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::Datelike;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use anesth_roster_core::quota::{plan_carry_over, plan_transfer, BalanceView, QuotaError};
use anesth_roster_core::types::NotificationKind;
use anesth_roster_storage::{NewAuditEntry, NewQuotaTransfer};

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::push;
use crate::router::AppState;

fn map_quota_error(err: QuotaError) -> ProblemResponse {
    let problem_type = match err {
        QuotaError::NonPositiveDays => "invalid_amount",
        QuotaError::InsufficientBalance { .. } => "insufficient_balance",
        QuotaError::ExceedsMaxDays { .. } => "transfer_cap",
        QuotaError::ExceedsMaxFraction { .. } => "transfer_cap",
    };
    ProblemResponse::bad_request(problem_type, err.to_string())
}

pub async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, year)): Path<(String, i64)>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_self_or_planner(&user_id)?;

    let balances = state
        .storage()
        .balances()
        .list_for_user(&user_id, year)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    let transfers = state
        .storage()
        .quota_rules()
        .list_transfers(&user_id, year)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    Ok(Json(json!({
        "user_id": user_id,
        "year": year,
        "balances": balances
            .iter()
            .map(|balance| json!({
                "type": balance.type_code,
                "allowance": balance.allowance,
                "carried_over": balance.carried_over,
                "carry_over_expires": balance.carry_over_expires,
                "used": balance.used,
                "pending": balance.pending,
                "remaining": balance.view().remaining(),
            }))
            .collect::<Vec<_>>(),
        "transfers": transfers
            .iter()
            .map(|transfer| json!({
                "id": transfer.id,
                "from": transfer.from_type,
                "to": transfer.to_type,
                "requested_days": transfer.requested_days,
                "converted_days": transfer.converted_days,
                "created_at": transfer.created_at,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct TransferBody {
    #[serde(default)]
    user_id: Option<String>,
    from_type: String,
    to_type: String,
    days: f64,
    #[serde(default)]
    year: Option<i64>,
    #[serde(default)]
    dry_run: bool,
}

pub async fn transfer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TransferBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    let target_id = body.user_id.clone().unwrap_or_else(|| auth.user_id.clone());
    auth.require_self_or_planner(&target_id)?;

    let now = state.now();
    let year = body.year.unwrap_or_else(|| i64::from(now.year()));

    let quota_rules = state.storage().quota_rules();
    let rule = quota_rules
        .transfer_rule(&body.from_type, &body.to_type)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .ok_or_else(|| {
            ProblemResponse::bad_request(
                "no_transfer_rule",
                "no active transfer rule exists for this pair of leave types",
            )
        })?;

    if rule.requires_approval && !auth.role.can_plan() {
        return Err(ProblemResponse::forbidden(
            "this transfer requires a planner to execute it",
        ));
    }

    let balances = state.storage().balances();
    let source = balances
        .fetch(&target_id, &body.from_type, year)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .map(|balance| balance.view())
        .unwrap_or(BalanceView {
            allowance: 0.0,
            carried_over: 0.0,
            used: 0.0,
            pending: 0.0,
        });

    let already_transferred = quota_rules
        .transferred_total(&target_id, &body.from_type, &body.to_type, year)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    let plan = plan_transfer(&rule, &source, body.days, already_transferred)
        .map_err(map_quota_error)?;

    if body.dry_run {
        return Ok(Json(json!({
            "executed": false,
            "requested_days": plan.requested_days,
            "converted_days": plan.converted_days,
        })));
    }

    let mut tx = balances
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    balances
        .adjust_allowance(&mut tx, &target_id, &body.from_type, year, -plan.requested_days, now)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    balances
        .adjust_allowance(&mut tx, &target_id, &body.to_type, year, plan.converted_days, now)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    let transfer_id = quota_rules
        .record_transfer(
            &mut tx,
            &NewQuotaTransfer {
                user_id: &target_id,
                year,
                from_type: &body.from_type,
                to_type: &body.to_type,
                requested_days: plan.requested_days,
                converted_days: plan.converted_days,
                created_at: now,
            },
        )
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    counter!("quota_transfers_total", "outcome" => "executed").increment(1);
    info!(
        stage = "quotas",
        user_id = %target_id,
        from = %body.from_type,
        to = %body.to_type,
        requested = plan.requested_days,
        converted = plan.converted_days,
        "quota transfer executed"
    );

    let audit = state
        .storage()
        .audit()
        .append(NewAuditEntry {
            actor_id: &auth.user_id,
            action: "quota.transfer",
            entity_type: "quota_transfer",
            entity_id: &transfer_id,
            detail: json!({
                "user_id": target_id,
                "from": body.from_type,
                "to": body.to_type,
                "requested_days": plan.requested_days,
                "converted_days": plan.converted_days,
            }),
            created_at: now,
        })
        .await;
    if let Err(err) = audit {
        tracing::warn!(stage = "audit", error = %err, "failed to append transfer audit entry");
    }

    if auth.user_id != target_id {
        push::deliver(
            &state,
            &target_id,
            NotificationKind::QuotaTransferred,
            "Quota transferred",
            &format!(
                "{} {} days were converted into {} {} days",
                plan.requested_days, body.from_type, plan.converted_days, body.to_type
            ),
            None,
        )
        .await;
    }

    Ok(Json(json!({
        "executed": true,
        "id": transfer_id,
        "requested_days": plan.requested_days,
        "converted_days": plan.converted_days,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CarryOverBody {
    user_id: String,
    #[serde(rename = "type")]
    type_code: String,
    /// The closing year whose remainder is carried into the next one.
    year: i64,
}

pub async fn carry_over(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CarryOverBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let rule = state
        .storage()
        .quota_rules()
        .carry_over_rule(&body.type_code)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .ok_or_else(|| {
            ProblemResponse::bad_request(
                "no_carry_over_rule",
                "no active carry-over rule exists for this leave type",
            )
        })?;

    let balances = state.storage().balances();
    let closing = balances
        .fetch(&body.user_id, &body.type_code, body.year)
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?
        .ok_or_else(|| {
            ProblemResponse::bad_request("no_balance", "no balance recorded for the closing year")
        })?;

    let next_year = body.year + 1;
    let plan = plan_carry_over(&rule, closing.view().remaining(), next_year as i32);

    let now = state.now();
    let mut tx = balances
        .begin()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    balances
        .credit_carry_over(
            &mut tx,
            &body.user_id,
            &body.type_code,
            next_year,
            plan.days,
            plan.expires_on,
            now,
        )
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    tx.commit()
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;

    counter!("quota_transfers_total", "outcome" => "carry_over").increment(1);
    info!(
        stage = "quotas",
        user_id = %body.user_id,
        type_code = %body.type_code,
        days = plan.days,
        "carry-over credited"
    );

    let audit = state
        .storage()
        .audit()
        .append(NewAuditEntry {
            actor_id: &auth.user_id,
            action: "quota.carry_over",
            entity_type: "leave_balance",
            entity_id: &format!("{}:{}:{}", body.user_id, body.type_code, next_year),
            detail: json!({"days": plan.days, "expires_on": plan.expires_on}),
            created_at: now,
        })
        .await;
    if let Err(err) = audit {
        tracing::warn!(stage = "audit", error = %err, "failed to append carry-over audit entry");
    }

    if auth.user_id != body.user_id {
        push::deliver(
            &state,
            &body.user_id,
            NotificationKind::QuotaCarriedOver,
            "Days carried over",
            &format!(
                "{} {} days were carried over into {next_year}",
                plan.days, body.type_code
            ),
            None,
        )
        .await;
    }

    Ok(Json(json!({
        "user_id": body.user_id,
        "type": body.type_code,
        "year": next_year,
        "days": plan.days,
        "expires_on": plan.expires_on,
    })))
}
