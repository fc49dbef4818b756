use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
};
use std::sync::Arc;

use super::coordinator::NamingService;
use super::namespace::NamespaceStats;
use super::protocol::EvictResponse;
use crate::membership::types::{NodeId, NodeSummary};

pub fn router(service: Arc<NamingService>) -> Router {
    Router::new()
        .route("/admin/nodes", get(handle_nodes))
        .route("/admin/evict/:id", post(handle_evict))
        .route("/admin/stats", get(handle_stats))
        .layer(Extension(service))
}

pub async fn handle_nodes(
    Extension(service): Extension<Arc<NamingService>>,
) -> Json<Vec<NodeSummary>> {
    Json(service.nodes().await)
}

pub async fn handle_evict(
    Extension(service): Extension<Arc<NamingService>>,
    Path(id): Path<u64>,
) -> (StatusCode, Json<EvictResponse>) {
    match service.evict(NodeId(id)).await {
        Some(node) => {
            tracing::info!("Admin evicted {}", node.id);
            (
                StatusCode::OK,
                Json(EvictResponse {
                    evicted: true,
                    node: Some(node),
                }),
            )
        }
        None => {
            tracing::warn!("Admin asked to evict unknown node-{}", id);
            (
                StatusCode::NOT_FOUND,
                Json(EvictResponse {
                    evicted: false,
                    node: None,
                }),
            )
        }
    }
}

pub async fn handle_stats(
    Extension(service): Extension<Arc<NamingService>>,
) -> Json<NamespaceStats> {
    Json(service.stats().await)
}
