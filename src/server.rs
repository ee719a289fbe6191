use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::State,
    response::Html,
    routing::get,
    routing::post,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{GenerationRequest, GenerationResponse, ModelMetadata, ModelRegistry},
    page::{GenerateForm, description, render_page},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<ModelRegistry>,
}

#[derive(Serialize)]
struct MetadataResponse {
    model: ModelMetadata,
    description: Vec<DescriptionLine>,
}

#[derive(Serialize)]
struct DescriptionLine {
    label: &'static str,
    value: String,
}

pub fn build_router(config: Arc<AppConfig>, registry: Arc<ModelRegistry>) -> Router {
    let state = AppState { registry, config };

    Router::new()
        .route("/", get(index).post(submit_form))
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/metadata", get(metadata))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(render_page(
        state.registry.metadata(),
        &GenerateForm::default(),
        None,
        None,
    ))
}

/// Form submissions always re-render the page; failures show up in place of the output.
async fn submit_form(State(state): State<AppState>, Form(form): Form<GenerateForm>) -> Html<String> {
    let request = GenerationRequest::from(form.clone());
    let page = match state.registry.generate(request).await {
        Ok(response) => render_page(
            state.registry.metadata(),
            &form,
            Some(&response.output),
            None,
        ),
        Err(err) => {
            warn!(%err, "form generation failed");
            render_page(
                state.registry.metadata(),
                &form,
                None,
                Some(&err.to_string()),
            )
        }
    };
    Html(page)
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, ServiceError> {
    let response = state.registry.generate(request).await?;
    Ok(Json(response))
}

async fn metadata(State(state): State<AppState>) -> Json<MetadataResponse> {
    let model = state.registry.metadata().clone();
    let description = description(&model)
        .into_iter()
        .map(|(label, value)| DescriptionLine { label, value })
        .collect();
    Json(MetadataResponse { model, description })
}
