use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::Sse,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use anesth_roster_storage::NotificationError;

use crate::auth::{authenticate, bearer_token};
use crate::problem::ProblemResponse;
use crate::push::{notification_payload, PushStream};
use crate::router::AppState;

fn map_notification_error(err: NotificationError) -> ProblemResponse {
    match err {
        NotificationError::NotFound => ProblemResponse::not_found("notification not found"),
        other => ProblemResponse::internal(other.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    unread: Option<bool>,
    #[serde(default)]
    limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Value>>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let notifications = state
        .storage()
        .notifications()
        .list_for_user(&auth.user_id, query.unread.unwrap_or(false), limit)
        .await
        .map_err(map_notification_error)?;
    Ok(Json(
        notifications.iter().map(notification_payload).collect(),
    ))
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;

    state
        .storage()
        .notifications()
        .mark_read(&id, &auth.user_id)
        .await
        .map_err(map_notification_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn mark_all_read(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ProblemResponse> {
    let auth = authenticate(state.validator(), &headers, state.now())?;

    let updated = state
        .storage()
        .notifications()
        .mark_all_read(&auth.user_id)
        .await
        .map_err(map_notification_error)?;
    Ok(Json(json!({ "updated": updated })))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Bearer token fallback for EventSource clients that cannot set headers.
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    since: Option<u64>,
}

/// Live notification stream.
///
/// Replays events newer than `Last-Event-ID` from the hub ring; when the
/// client has fallen behind the ring it receives one `sync` event carrying
/// its unread notifications instead.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<PushStream>, ProblemResponse> {
    let now = state.now();
    let auth = match bearer_token(&headers) {
        Some(token) => state
            .validator()
            .validate(token, now)
            .map_err(|err| ProblemResponse::unauthorized(err.to_string()))?,
        None => {
            let token = query
                .token
                .as_deref()
                .ok_or_else(|| ProblemResponse::unauthorized("missing bearer token"))?;
            state
                .validator()
                .validate(token, now)
                .map_err(|err| ProblemResponse::unauthorized(err.to_string()))?
        }
    };

    let since = headers
        .get("Last-Event-ID")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u64>().ok())
        .or(query.since);

    let subscription = state.push().subscribe(&auth.user_id, since).await;

    let stream = if subscription.ring_miss() {
        let unread = state
            .storage()
            .notifications()
            .list_for_user(&auth.user_id, true, 200)
            .await
            .map_err(map_notification_error)?;
        let message = state
            .push()
            .sync_message(&auth.user_id, &unread)
            .await
            .map_err(|err| ProblemResponse::internal(err.to_string()))?;
        subscription.into_stream_with_initial(vec![message])
    } else {
        subscription.into_stream()
    };

    let keep_alive = axum::response::sse::KeepAlive::new()
        .interval(Duration::from_secs(state.sse_heartbeat()))
        .text("heartbeat");

    Ok(Sse::new(stream).keep_alive(keep_alive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::app_router;
    use crate::testutil::{request, response_json, seed_user, setup_state, token_for};
    use anesth_roster_core::types::{NotificationKind, ProfessionalRole, Role};
    use anesth_roster_storage::NewNotification;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tokio::time::{self, Duration as TokioDuration};
    use tower::ServiceExt;

    async fn seed_notification(state: &AppState, recipient: &str, title: &str) -> String {
        state
            .storage()
            .notifications()
            .insert(NewNotification {
                recipient_id: recipient,
                kind: NotificationKind::LeaveApproved,
                title,
                body: "body",
                link: None,
                created_at: state.now(),
            })
            .await
            .expect("insert")
            .id
    }

    #[tokio::test]
    async fn inbox_lists_and_marks_read() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let first = seed_notification(&state, &alice, "first").await;
        seed_notification(&state, &alice, "second").await;
        let token = token_for(&alice, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                &format!("/api/notifications/{first}/read"),
                &token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(request("GET", "/api/notifications?unread=true", &token, None))
            .await
            .expect("response");
        let body = response_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["title"], "second");

        let response = app
            .oneshot(request("POST", "/api/notifications/read-all", &token, None))
            .await
            .expect("response");
        let body = response_json(response).await;
        assert_eq!(body["updated"], json!(1));
    }

    #[tokio::test]
    async fn cannot_read_someone_elses_notification() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let bob = seed_user(&state, "bob", Role::User, ProfessionalRole::Mar).await;
        let id = seed_notification(&state, &alice, "private").await;
        let token = token_for(&bob, Role::User, state.now());
        let app = app_router(state);

        let response = app
            .oneshot(request(
                "POST",
                &format!("/api/notifications/{id}/read"),
                &token,
                None,
            ))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stream_delivers_published_events() {
        let state = setup_state().await;
        let alice = seed_user(&state, "alice", Role::User, ProfessionalRole::Mar).await;
        let token = token_for(&alice, Role::User, state.now());
        let push = state.push().clone();
        let recipient = alice.clone();
        let app = app_router(state);

        let uri = format!("/api/notifications/stream?token={token}");
        let publish = tokio::spawn(async move {
            time::sleep(TokioDuration::from_millis(25)).await;
            push.publish(
                &recipient,
                "leave.approved",
                &json!({"title": "Leave approved"}),
            )
            .await
            .expect("publish");
        });

        let mut response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let frame = time::timeout(TokioDuration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");
        let data = frame.into_data().expect("data frame");
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("event: notification"));
        assert!(text.contains("leave.approved"));

        publish.await.expect("publish task");
    }

    #[tokio::test]
    async fn stream_requires_a_token() {
        let state = setup_state().await;
        let app = app_router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/notifications/stream")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
