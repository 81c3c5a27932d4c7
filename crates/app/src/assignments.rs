use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};

use anesth_roster_storage::Assignment;

use crate::auth::authenticate;
use crate::problem::ProblemResponse;
use crate::router::AppState;

fn assignment_view(assignment: &Assignment) -> Value {
    json!({
        "id": assignment.id,
        "user_id": assignment.user_id,
        "room_id": assignment.room_id,
        "day": assignment.day,
        "period": assignment.period,
        "activity_kind": assignment.activity_kind,
        "trame_id": assignment.trame_id,
    })
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    from: NaiveDate,
    to: NaiveDate,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    room_id: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Value>>, ProblemResponse> {
    let _auth = authenticate(state.validator(), &headers, state.now())?;

    if query.to < query.from {
        return Err(ProblemResponse::bad_request(
            "invalid_range",
            "to is before from",
        ));
    }

    let assignments = state
        .storage()
        .assignments()
        .list(
            query.from,
            query.to,
            query.user_id.as_deref(),
            query.room_id.as_deref(),
        )
        .await
        .map_err(|err| ProblemResponse::internal(err.to_string()))?;
    Ok(Json(assignments.iter().map(assignment_view).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::app_router;
    use crate::testutil::{request, response_json, seed_user, setup_state, token_for};
    use anesth_roster_core::types::{ActivityKind, Period, ProfessionalRole, Role};
    use anesth_roster_storage::NewAssignment;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    #[tokio::test]
    async fn lists_assignments_in_range() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let repo = state.storage().assignments();
        let mut tx = repo.begin().await.expect("begin");
        repo.insert(
            &mut tx,
            &NewAssignment {
                user_id: &alice,
                room_id: None,
                day: NaiveDate::from_ymd_opt(2024, 9, 2).unwrap(),
                period: Period::Morning,
                activity_kind: ActivityKind::Duty,
                trame_id: None,
                created_at: state.now(),
            },
        )
        .await
        .expect("insert");
        tx.commit().await.expect("commit");

        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/api/assignments?from=2024-09-01&to=2024-09-30",
                &token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["activity_kind"], "DUTY");

        let response = app
            .oneshot(request(
                "GET",
                "/api/assignments?from=2024-10-01&to=2024-10-31",
                &token,
                None,
            ))
            .await
            .expect("response");
        let body = response_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn missing_range_is_a_bad_request() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request("GET", "/api/assignments", &token, None))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
