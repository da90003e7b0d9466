use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use sns_trigger_aws::{HttpApi, SignatureVerifier};
use sns_trigger_core::TriggerDescriptor;
use tracing::error;

use crate::problem::ProblemResponse;
use crate::registry::{Lifecycle, TriggerEntry, TriggerRegistry};
use crate::trigger::TriggerService;
use crate::{telemetry, webhook};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    registry: TriggerRegistry,
    service: TriggerService,
    verifier: Arc<SignatureVerifier>,
    http: Arc<dyn HttpApi>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        registry: TriggerRegistry,
        service: TriggerService,
        verifier: Arc<SignatureVerifier>,
        http: Arc<dyn HttpApi>,
    ) -> Self {
        Self {
            metrics,
            registry,
            service,
            verifier,
            http,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    pub fn service(&self) -> &TriggerService {
        &self.service
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    pub fn http(&self) -> &Arc<dyn HttpApi> {
        &self.http
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/admin/triggers", get(list_triggers))
        .route("/admin/triggers/:uuid/activate", post(activate_trigger))
        .route("/admin/triggers/:uuid/deactivate", post(deactivate_trigger))
        .route(
            &format!("{}/*path", webhook::WEBHOOK_PREFIX),
            any(webhook::handle),
        )
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

#[derive(Debug, Serialize)]
struct TriggerView {
    #[serde(flatten)]
    descriptor: TriggerDescriptor,
    enabled: bool,
    state: Lifecycle,
}

impl TriggerView {
    async fn of(entry: &TriggerEntry) -> Self {
        Self {
            descriptor: entry.descriptor().clone(),
            enabled: entry.enabled(),
            state: entry.current().await,
        }
    }
}

async fn list_triggers(State(state): State<AppState>) -> Json<Vec<TriggerView>> {
    let mut views = Vec::with_capacity(state.registry().len());
    for entry in state.registry().entries() {
        views.push(TriggerView::of(entry).await);
    }
    Json(views)
}

#[derive(Debug, Clone, Copy)]
enum Transition {
    Activate,
    Deactivate,
}

async fn activate_trigger(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ProblemResponse> {
    transition(&state, &uuid, Transition::Activate).await
}

async fn deactivate_trigger(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Response, ProblemResponse> {
    transition(&state, &uuid, Transition::Deactivate).await
}

async fn transition(
    state: &AppState,
    uuid: &str,
    transition: Transition,
) -> Result<Response, ProblemResponse> {
    let entry = state.registry().find_by_uuid(uuid).ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::NOT_FOUND,
            "trigger_not_found",
            format!("no trigger with uuid {uuid}"),
        )
    })?;

    let result = match transition {
        Transition::Activate => state.service().activate(&entry).await,
        Transition::Deactivate => state.service().deactivate(&entry).await,
    };
    if let Err(err) = result {
        error!(
            stage = "trigger",
            trigger = %entry.descriptor().name(),
            ?transition,
            error = %err,
            "trigger transition failed"
        );
        return Err(ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "trigger_transition_failed",
            err.to_string(),
        ));
    }

    Ok(Json(TriggerView::of(&entry).await).into_response())
}
