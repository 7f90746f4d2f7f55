//! Out-of-band diagnostics server. An HTTP JSON API stands in for a literal
//! `MONITOR-SOURCE`-style text protocol, built in the style of an
//! `axum::Router` + `axum::Json` health/sync endpoint pair.

use crate::delaunay::DelaunayNetwork;
use crate::registry::StationRegistry;
use crate::solver::SolverPool;
use crate::store::ObservationStore;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use cors_types::SourceId;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

#[derive(Clone)]
pub struct MonitorState {
    pub registry: Arc<StationRegistry>,
    pub store: Arc<ObservationStore>,
    pub solver: Arc<SolverPool>,
    pub station_info: Arc<tokio::sync::RwLock<Vec<crate::config::StationInfoRow>>>,
    pub net: Arc<tokio::sync::RwLock<DelaunayNetwork>>,
}

pub fn router(state: MonitorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sourceinfo/:name", get(source_info))
        .route("/sourceinfo", get(all_source_info))
        .route("/bstadistr/:province", get(base_station_distribution))
        .route("/triangulation", get(triangulation_summary))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub fn spawn(bind_addr: String, state: MonitorState) {
    tokio::spawn(async move {
        let app = router(state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "monitor listening");
                let _ = axum::serve(listener, app).await;
            }
            Err(e) => {
                tracing::warn!(addr = %bind_addr, error = %e, "monitor failed to bind");
            }
        }
    });
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// `MONITOR-SOURCE <name>` equivalent: registry entry, latest epoch summary,
/// and nav cache depth for one source.
async fn source_info(State(state): State<MonitorState>, Path(name): Path<String>) -> Json<Value> {
    let Some(id) = state.registry.lookup_by_name(&name).await else {
        return Json(json!({ "error": "no such source" }));
    };
    Json(source_snapshot(&state, id, &name).await)
}

/// `MONITOR-SOURCE all` equivalent.
async fn all_source_info(State(state): State<MonitorState>) -> Json<Value> {
    let sources = state.registry.all().await;
    let mut out = Vec::with_capacity(sources.len());
    for s in sources {
        out.push(source_snapshot(&state, s.id, &s.name).await);
    }
    Json(json!({ "sources": out }))
}

async fn source_snapshot(state: &MonitorState, id: SourceId, name: &str) -> Value {
    let epoch = state.store.latest_obs(id).await;
    let nav = state.store.nav_snapshot(id).await;
    let meta = state.store.metadata(id).await;
    json!({
        "name": name,
        "id": id.0,
        "n_sat": epoch.as_ref().map(|e| e.obs.len()).unwrap_or(0),
        "epoch_time": epoch.map(|e| e.time.0),
        "n_gps_eph": nav.gps_family.len(),
        "n_glonass_eph": nav.glonass.len(),
        "antenna": meta.as_ref().map(|m| m.antenna_descriptor.clone()),
        "receiver": meta.map(|m| m.receiver_descriptor.clone()),
    })
}

/// `MONITOR-BSTADISTR <province> {physics|virtual|all}` equivalent: counts
/// physical/virtual base stations by province from the loaded station-info
/// side table.
async fn base_station_distribution(State(state): State<MonitorState>, Path(province): Path<String>) -> Json<Value> {
    let rows = state.station_info.read().await;
    let mut by_type: HashMap<String, u32> = HashMap::new();
    for row in rows.iter().filter(|r| province == "all" || r.province == province) {
        *by_type.entry(row.station_type.clone()).or_insert(0) += 1;
    }
    Json(json!({ "province": province, "counts": by_type }))
}

/// Diagnostic-only view over the Delaunay network's current vertex/edge/
/// triangle counts, a natural extension of the diagnostics surface beyond
/// the bare per-source and per-message counters.
async fn triangulation_summary(State(state): State<MonitorState>) -> Json<Value> {
    let net = state.net.read().await;
    let vertex_count = net.vertices().count();
    let triangle_count = net.triangles().count();
    Json(json!({
        "vertices": vertex_count,
        "edges": net.edge_ids().len(),
        "triangles": triangle_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
