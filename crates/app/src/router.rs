use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;

use anesth_roster_core::rules::RuleEngine;
use anesth_roster_storage::Database;

use crate::auth::TokenValidator;
use crate::push::NotificationHub;
use crate::{
    analytics, assignments, leaves, notifications, quotas, rules, sectors, telemetry, trames,
    users,
};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    validator: TokenValidator,
    push: NotificationHub,
    engine: Arc<RuleEngine>,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    team_absence_threshold: f64,
    sse_heartbeat_secs: u64,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        token_secret: &[u8],
        team_absence_threshold: f64,
        sse_ring_max: usize,
        sse_ring_ttl: Duration,
        sse_heartbeat_secs: u64,
    ) -> Self {
        Self {
            metrics,
            storage,
            validator: TokenValidator::new(token_secret),
            push: NotificationHub::new(sse_ring_max, sse_ring_ttl),
            engine: Arc::new(RuleEngine::new()),
            clock: Arc::new(Utc::now),
            team_absence_threshold,
            sse_heartbeat_secs,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn validator(&self) -> &TokenValidator {
        &self.validator
    }

    pub fn push(&self) -> &NotificationHub {
        &self.push
    }

    pub fn engine(&self) -> &RuleEngine {
        &self.engine
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub fn team_absence_threshold(&self) -> f64 {
        self.team_absence_threshold
    }

    pub fn sse_heartbeat(&self) -> u64 {
        self.sse_heartbeat_secs
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/users", get(users::list).post(users::create))
        .route("/api/users/:id", get(users::fetch).patch(users::update))
        .route("/api/sectors", get(sectors::list).post(sectors::create))
        .route("/api/sectors/:id", patch(sectors::update))
        .route("/api/rooms", get(sectors::list_rooms).post(sectors::create_room))
        .route("/api/rooms/:id", patch(sectors::update_room))
        .route("/api/leaves", get(leaves::list).post(leaves::create))
        .route("/api/leaves/check", post(leaves::check))
        .route(
            "/api/leaves/:id",
            get(leaves::fetch).patch(leaves::update).delete(leaves::remove),
        )
        .route("/api/leaves/:id/approve", post(leaves::approve))
        .route("/api/leaves/:id/reject", post(leaves::reject))
        .route("/api/leaves/:id/cancel", post(leaves::cancel))
        .route("/api/quotas/transfer", post(quotas::transfer))
        .route("/api/quotas/carry-over", post(quotas::carry_over))
        .route("/api/quotas/:user_id/:year", get(quotas::fetch))
        .route("/api/rules", get(rules::list).post(rules::create))
        .route("/api/rules/simulate", post(rules::simulate))
        .route(
            "/api/rules/:id",
            get(rules::fetch).patch(rules::update).delete(rules::remove),
        )
        .route("/api/trames", get(trames::list).post(trames::create))
        .route("/api/trames/:id/apply", post(trames::apply))
        .route("/api/assignments", get(assignments::list))
        .route(
            "/api/notifications",
            get(notifications::list),
        )
        .route("/api/notifications/stream", get(notifications::stream))
        .route("/api/notifications/read-all", post(notifications::mark_all_read))
        .route("/api/notifications/:id/read", post(notifications::mark_read))
        .route("/api/analytics/leaves", get(analytics::leaves))
        .route("/api/analytics/absence-rate", get(analytics::absence_rate))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .unwrap()
}
