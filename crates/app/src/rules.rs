use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};

use anesth_roster_core::rules::{
    Condition, ConditionGroup, Rule, RuleAction, RuleEngine, RuleEngineError,
};
use anesth_roster_storage::{NewPlanningRule, PlanningRuleUpdate, RuleError};

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::router::AppState;

fn map_rule_error(err: RuleError) -> ProblemResponse {
    match err {
        RuleError::NotFound => ProblemResponse::not_found("planning rule not found"),
        RuleError::Decode(err) => ProblemResponse::internal(err.to_string()),
        other => ProblemResponse::internal(other.to_string()),
    }
}

fn map_engine_error(err: RuleEngineError) -> ProblemResponse {
    ProblemResponse::bad_request("rule_evaluation", err.to_string())
}

fn rule_view(rule: &Rule, description: Option<&str>) -> Value {
    json!({
        "id": rule.id,
        "name": rule.name,
        "rule_type": rule.rule_type,
        "description": description,
        "priority": rule.priority,
        "enabled": rule.enabled,
        "contexts": rule.contexts,
        "conditions": rule.conditions,
        "condition_groups": rule.condition_groups,
        "actions": rule.actions,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    enabled: Option<bool>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Rule>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let rules = state
        .storage()
        .rules()
        .list(query.enabled.unwrap_or(false))
        .await
        .map_err(map_rule_error)?;
    Ok(Json(rules))
}

#[derive(Debug, Deserialize)]
pub struct CreateRuleBody {
    name: String,
    rule_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: i64,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    contexts: Vec<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
    #[serde(default)]
    condition_groups: Vec<ConditionGroup>,
    #[serde(default)]
    actions: Vec<RuleAction>,
}

fn default_enabled() -> bool {
    true
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateRuleBody>,
) -> Result<(StatusCode, Json<Value>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    if body.name.trim().is_empty() || body.rule_type.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_rule",
            "name and rule_type are required",
        ));
    }
    if body.actions.is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_rule",
            "a rule needs at least one action",
        ));
    }

    let repo = state.storage().rules();
    let id = repo
        .insert(NewPlanningRule {
            name: &body.name,
            rule_type: &body.rule_type,
            description: body.description.as_deref(),
            priority: body.priority,
            enabled: body.enabled,
            contexts: body.contexts,
            conditions: body.conditions,
            condition_groups: body.condition_groups,
            actions: body.actions,
            created_at: state.now(),
        })
        .await
        .map_err(map_rule_error)?;

    let (rule, description) = repo.fetch(&id).await.map_err(map_rule_error)?;
    Ok((
        StatusCode::CREATED,
        Json(rule_view(&rule, description.as_deref())),
    ))
}

pub async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let (rule, description) = state.storage().rules().fetch(&id).await.map_err(map_rule_error)?;
    Ok(Json(rule_view(&rule, description.as_deref())))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRuleBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<Option<String>>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    contexts: Option<Vec<String>>,
    #[serde(default)]
    conditions: Option<Vec<Condition>>,
    #[serde(default)]
    condition_groups: Option<Vec<ConditionGroup>>,
    #[serde(default)]
    actions: Option<Vec<RuleAction>>,
}

pub async fn update(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateRuleBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let (rule, description) = state
        .storage()
        .rules()
        .update(
            &id,
            PlanningRuleUpdate {
                name: body.name,
                description: body.description,
                priority: body.priority,
                enabled: body.enabled,
                contexts: body.contexts,
                conditions: body.conditions,
                condition_groups: body.condition_groups,
                actions: body.actions,
            },
            state.now(),
        )
        .await
        .map_err(map_rule_error)?;
    Ok(Json(rule_view(&rule, description.as_deref())))
}

pub async fn remove(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    state.storage().rules().delete(&id).await.map_err(map_rule_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct SimulateBody {
    context: Value,
    /// Inline rules to simulate; stored rules are loaded when absent.
    #[serde(default)]
    rules: Option<Vec<Rule>>,
    #[serde(default)]
    rule_types: Option<Vec<String>>,
    #[serde(default)]
    strict: bool,
}

/// Runs the engine against a caller-supplied context without persisting
/// anything, returning per-rule traces.
pub async fn simulate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SimulateBody>,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_planner()?;

    let rules = match body.rules {
        Some(rules) => rules,
        None => match &body.rule_types {
            Some(types) => state
                .storage()
                .rules()
                .list_by_types(types)
                .await
                .map_err(map_rule_error)?,
            None => state.storage().rules().list(true).await.map_err(map_rule_error)?,
        },
    };

    let engine = RuleEngine::with_strict(body.strict);
    let evaluations = engine
        .evaluate(&rules, &body.context, body.rule_types.as_deref())
        .map_err(map_engine_error)?;
    counter!("rule_evaluations_total").increment(evaluations.len() as u64);

    let violations: Vec<_> = evaluations.iter().filter(|e| e.is_violation()).collect();
    let warnings: Vec<_> = evaluations.iter().filter(|e| e.is_warning()).collect();

    Ok(Json(json!({
        "passed": violations.is_empty(),
        "violations": violations,
        "warnings": warnings,
        "evaluations": evaluations,
    })))
}
