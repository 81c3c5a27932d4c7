use std::time::Duration as StdDuration;

use axum::body::Body;
use axum::http::{header, Request};
use chrono::{DateTime, Duration, Utc, Weekday};
use http_body_util::BodyExt;
use serde_json::Value;

use anesth_roster_core::types::{
    CountingMethod, ProfessionalRole, Role, WorkPattern,
};
use anesth_roster_storage::{Database, LeaveTypeSettings, NewUser};

use crate::auth::issue_token;
use crate::router::AppState;
use crate::telemetry;

pub const TOKEN_SECRET: &[u8] = b"test-token-secret";

/// Application state over a fresh in-memory database.
pub async fn setup_state() -> AppState {
    let metrics = telemetry::init_metrics().expect("metrics init");
    let database = Database::connect("sqlite::memory:?cache=shared")
        .await
        .expect("connect");
    database.run_migrations().await.expect("migrations");

    AppState::new(
        metrics,
        database,
        TOKEN_SECRET,
        0.3,
        64,
        StdDuration::from_secs(60),
        25,
    )
}

/// Creates a user and returns its id.
pub async fn seed_user(
    state: &AppState,
    login: &str,
    role: Role,
    professional_role: ProfessionalRole,
) -> String {
    let email = format!("{login}@example.org");
    state
        .storage()
        .users()
        .insert(NewUser {
            login,
            email: &email,
            first_name: "Test",
            last_name: login,
            role,
            professional_role,
            work_pattern: WorkPattern::FullTime,
            weekdays_even: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            weekdays_odd: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            part_time_percent: None,
            created_at: state.now(),
        })
        .await
        .expect("seed user")
}

/// Creates a standard leave type.
pub async fn seed_leave_type(state: &AppState, code: &str) {
    state
        .storage()
        .leave_types()
        .upsert(&LeaveTypeSettings {
            code: code.to_string(),
            label: code.to_string(),
            counting_method: CountingMethod::WeekdaysIfWorking,
            max_duration_days: Some(60),
            min_lead_time_days: 0,
            approver_roles: vec![Role::Admin, Role::Planner],
            user_selectable: true,
            active: true,
        })
        .await
        .expect("seed leave type");
}

/// Bearer token for a seeded user, valid for one hour.
pub fn token_for(user_id: &str, role: Role, now: DateTime<Utc>) -> String {
    issue_token(TOKEN_SECRET, user_id, role, now + Duration::hours(1))
}

/// Builds an authenticated JSON request.
pub fn request(
    method: &str,
    uri: &str,
    token: &str,
    body: Option<Value>,
) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    match body {
        Some(value) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Reads a response body as JSON.
pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should read")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is json")
}
