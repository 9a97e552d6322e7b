use crate::{api, config::UploadPolicy, storage::Store};
use axum::{Router, extract::DefaultBodyLimit, routing::any};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct AppState {
    pub store: Arc<Store>,
    pub upload: UploadPolicy,
    pub max_body_size: usize,
    pub url_prefix: String,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_body_size);
    Router::new()
        .fallback(any(api::dispatch))
        .layer(body_limit)
        .with_state(state)
}
