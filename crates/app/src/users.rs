use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Weekday;
use serde::{Deserialize, Serialize};

use anesth_roster_core::types::{parse_weekdays, ProfessionalRole, Role, WorkPattern};
use anesth_roster_storage::{NewUser, User, UserError, UserUpdate};

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Wire representation of a user.
#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: String,
    pub login: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub professional_role: ProfessionalRole,
    pub work_pattern: WorkPattern,
    pub weekdays_even: Vec<String>,
    pub weekdays_odd: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_time_percent: Option<f64>,
    pub active: bool,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            login: user.login,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role: user.role,
            professional_role: user.professional_role,
            work_pattern: user.work_pattern,
            weekdays_even: weekday_names(&user.weekdays_even),
            weekdays_odd: weekday_names(&user.weekdays_odd),
            part_time_percent: user.part_time_percent,
            active: user.active,
        }
    }
}

fn weekday_names(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_weekday_list(raw: &[String]) -> Result<Vec<Weekday>, ProblemResponse> {
    let parsed = parse_weekdays(&raw.join(","));
    if parsed.len() != raw.len() {
        return Err(ProblemResponse::bad_request(
            "invalid_weekday",
            "weekdays must be three-letter names (MON..SUN)",
        ));
    }
    Ok(parsed)
}

fn map_user_error(err: UserError) -> ProblemResponse {
    match err {
        UserError::NotFound => ProblemResponse::not_found("user not found"),
        UserError::Duplicate => {
            ProblemResponse::bad_request("duplicate_user", "login or email already in use")
        }
        other => ProblemResponse::internal(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    active: Option<bool>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<UserView>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_admin()?;

    let users = state
        .storage()
        .users()
        .list(query.active.unwrap_or(false))
        .await
        .map_err(map_user_error)?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateUserBody {
    login: String,
    email: String,
    first_name: String,
    last_name: String,
    #[serde(default = "default_role")]
    role: Role,
    professional_role: ProfessionalRole,
    #[serde(default = "default_pattern")]
    work_pattern: WorkPattern,
    #[serde(default)]
    weekdays_even: Option<Vec<String>>,
    #[serde(default)]
    weekdays_odd: Option<Vec<String>>,
    #[serde(default)]
    part_time_percent: Option<f64>,
}

fn default_role() -> Role {
    Role::User
}

fn default_pattern() -> WorkPattern {
    WorkPattern::FullTime
}

fn default_weekdays() -> Vec<Weekday> {
    vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
    ]
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> Result<(StatusCode, Json<UserView>), ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_admin()?;

    if body.login.trim().is_empty() || body.email.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_user",
            "login and email are required",
        ));
    }
    if let Some(percent) = body.part_time_percent {
        if !(0.0..=100.0).contains(&percent) {
            return Err(ProblemResponse::bad_request(
                "invalid_user",
                "part_time_percent must be between 0 and 100",
            ));
        }
    }

    let weekdays_even = match &body.weekdays_even {
        Some(raw) => parse_weekday_list(raw)?,
        None => default_weekdays(),
    };
    let weekdays_odd = match &body.weekdays_odd {
        Some(raw) => parse_weekday_list(raw)?,
        None => weekdays_even.clone(),
    };

    let repo = state.storage().users();
    let id = repo
        .insert(NewUser {
            login: &body.login,
            email: &body.email,
            first_name: &body.first_name,
            last_name: &body.last_name,
            role: body.role,
            professional_role: body.professional_role,
            work_pattern: body.work_pattern,
            weekdays_even,
            weekdays_odd,
            part_time_percent: body.part_time_percent,
            created_at: state.now(),
        })
        .await
        .map_err(map_user_error)?;

    let user = repo.fetch(&id).await.map_err(map_user_error)?;
    Ok((StatusCode::CREATED, Json(UserView::from(user))))
}

pub async fn fetch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<UserView>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    if auth.user_id != id {
        auth.require_admin()?;
    }

    let user = state.storage().users().fetch(&id).await.map_err(map_user_error)?;
    Ok(Json(UserView::from(user)))
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserBody {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    role: Option<Role>,
    #[serde(default)]
    professional_role: Option<ProfessionalRole>,
    #[serde(default)]
    work_pattern: Option<WorkPattern>,
    #[serde(default)]
    weekdays_even: Option<Vec<String>>,
    #[serde(default)]
    weekdays_odd: Option<Vec<String>>,
    #[serde(default, deserialize_with = "double_option")]
    part_time_percent: Option<Option<f64>>,
    #[serde(default)]
    active: Option<bool>,
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
    Json(body): Json<UpdateUserBody>,
) -> Result<Json<UserView>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;
    auth.require_admin()?;

    let weekdays_even = match &body.weekdays_even {
        Some(raw) => Some(parse_weekday_list(raw)?),
        None => None,
    };
    let weekdays_odd = match &body.weekdays_odd {
        Some(raw) => Some(parse_weekday_list(raw)?),
        None => None,
    };

    let user = state
        .storage()
        .users()
        .update(
            &id,
            UserUpdate {
                email: body.email,
                first_name: body.first_name,
                last_name: body.last_name,
                role: body.role,
                professional_role: body.professional_role,
                work_pattern: body.work_pattern,
                weekdays_even,
                weekdays_odd,
                part_time_percent: body.part_time_percent,
                active: body.active,
            },
            state.now(),
        )
        .await
        .map_err(map_user_error)?;

    Ok(Json(UserView::from(user)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::app_router;
    use crate::testutil::{request, response_json, seed_user, setup_state, token_for};
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn create_requires_admin() {
        let state = setup_state().await;
        let planner = seed_user(&state, "planner", Role::Planner, ProfessionalRole::Mar).await;
        let token = token_for(&planner, Role::Planner, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request(
                "POST",
                "/api/users",
                &token,
                Some(json!({
                    "login": "new",
                    "email": "new@example.org",
                    "first_name": "New",
                    "last_name": "User",
                    "professional_role": "IADE",
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn admin_creates_and_lists_users() {
        let state = setup_state().await;
        let admin = seed_user(&state, "admin", Role::Admin, ProfessionalRole::Mar).await;
        let token = token_for(&admin, Role::Admin, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/users",
                &token,
                Some(json!({
                    "login": "miade",
                    "email": "miade@example.org",
                    "first_name": "Ines",
                    "last_name": "Bernard",
                    "professional_role": "IADE",
                    "work_pattern": "ALTERNATING_WEEKS",
                    "weekdays_even": ["MON", "TUE"],
                    "weekdays_odd": ["THU", "FRI"],
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response_json(response).await;
        assert_eq!(body["professional_role"], "IADE");
        assert_eq!(body["weekdays_odd"], json!(["THU", "FRI"]));

        let response = app
            .oneshot(request("GET", "/api/users", &token, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn invalid_weekday_is_rejected() {
        let state = setup_state().await;
        let admin = seed_user(&state, "admin", Role::Admin, ProfessionalRole::Mar).await;
        let token = token_for(&admin, Role::Admin, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request(
                "POST",
                "/api/users",
                &token,
                Some(json!({
                    "login": "x",
                    "email": "x@example.org",
                    "first_name": "X",
                    "last_name": "Y",
                    "professional_role": "MAR",
                    "weekdays_even": ["MONDAY"],
                })),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn users_may_fetch_themselves_only() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let bob = seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/api/users/{alice}"), &token, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", &format!("/api/users/{bob}"), &token, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn patch_deactivates_a_user() {
        let state = setup_state().await;
        let admin = seed_user(&state, "admin", Role::Admin, ProfessionalRole::Mar).await;
        let target = seed_user(&state, "target", Role::User, ProfessionalRole::Iade).await;
        let token = token_for(&admin, Role::Admin, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request(
                "PATCH",
                &format!("/api/users/{target}"),
                &token,
                Some(json!({"active": false, "role": "PLANNER"})),
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body["active"], json!(false));
        assert_eq!(body["role"], "PLANNER");
    }
}
