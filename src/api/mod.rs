//! HTTP read API.
//!
//! Read-only surface over the store and the statistics registry:
//! `/opportunities`, `/opportunities/{id}`, `/statistics`, `/prices`,
//! `/health`. Store queries run on the blocking pool; handlers never touch
//! engine state directly.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::stats::Stats;
use crate::store::{BufferedStore, OpportunityQuery, OpportunityStore, PriceQuery, SqliteStore};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<BufferedStore<SqliteStore>>,
    pub stats: Arc<Stats>,
    pub unhealthy_after: Duration,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/opportunities", get(list_opportunities))
        .route("/opportunities/:id", get(get_opportunity))
        .route("/statistics", get(statistics))
        .route("/prices", get(prices))
        .route("/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until `shutdown` flips.
pub async fn serve(
    state: ApiState,
    listen: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(%listen, "read api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct OpportunityParams {
    limit: Option<usize>,
    kind: Option<String>,
    min_profit: Option<f64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn list_opportunities(
    State(state): State<ApiState>,
    Query(params): Query<OpportunityParams>,
) -> Response {
    let query = OpportunityQuery {
        limit: params.limit,
        kind: params.kind,
        min_profit: params.min_profit,
        from: params.from,
        to: params.to,
    };
    let store = Arc::clone(&state.store);
    let result =
        tokio::task::spawn_blocking(move || store.inner().query_opportunities(&query)).await;

    match result {
        Ok(Ok(records)) => Json(records).into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}

async fn get_opportunity(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.inner().get_opportunity(&id)).await;

    match result {
        Ok(Ok(Some(record))) => Json(record).into_response(),
        Ok(Ok(None)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "opportunity not found" })),
        )
            .into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}

async fn statistics(State(state): State<ApiState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

#[derive(Debug, Deserialize)]
struct PriceParams {
    pair: Option<String>,
    venue: Option<String>,
    limit: Option<usize>,
}

async fn prices(State(state): State<ApiState>, Query(params): Query<PriceParams>) -> Response {
    let query = PriceQuery {
        pair: params.pair,
        venue: params.venue,
        limit: params.limit,
    };
    let store = Arc::clone(&state.store);
    let result = tokio::task::spawn_blocking(move || store.inner().query_prices(&query)).await;

    match result {
        Ok(Ok(rows)) => Json(rows).into_response(),
        Ok(Err(e)) => internal_error(e),
        Err(e) => internal_error(e),
    }
}

async fn health(State(state): State<ApiState>) -> Response {
    let status = state.stats.health(state.unhealthy_after);
    Json(json!({
        "status": status,
        "last_block_number": state.stats.last_block_number.load(std::sync::atomic::Ordering::Relaxed),
        "last_block_at": state.stats.last_block_at(),
        "endpoint_index": state.stats.endpoint_index.load(std::sync::atomic::Ordering::Relaxed),
        "endpoint_errors": state.stats.endpoint_errors.load(std::sync::atomic::Ordering::Relaxed),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OpportunityRecord;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn state() -> ApiState {
        ApiState {
            store: Arc::new(BufferedStore::new(
                SqliteStore::open_in_memory().unwrap(),
                100,
            )),
            stats: Arc::new(Stats::new()),
            unhealthy_after: Duration::from_secs(30),
        }
    }

    fn record(id: &str) -> OpportunityRecord {
        OpportunityRecord {
            id: id.into(),
            kind: "two_leg".into(),
            pair_path: "a>b>a".into(),
            venue_path: "uniswap>sushiswap".into(),
            trade_amount_in: "1000".into(),
            gross_profit_quote: "100".into(),
            net_profit_quote: "90".into(),
            gas_cost_quote: "5".into(),
            fee_cost_quote: "5".into(),
            margin: 9.0,
            status: "qualified".into(),
            reason: None,
            block_number: 100,
            block_hash: "0x00".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
        }
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn opportunities_list_and_fetch() {
        let state = state();
        state.store.inner().insert(&record("opp-1")).unwrap();
        let router = router(state);

        let (status, body) = get(&router, "/opportunities?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, body) = get(&router, "/opportunities/opp-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], "opp-1");

        let (status, _) = get(&router, "/opportunities/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn statistics_and_health_shapes() {
        let state = state();
        state.stats.record_block(123);
        let router = router(state);

        let (status, body) = get(&router, "/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_block_number"], 123);

        let (status, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["last_block_number"], 123);
    }
}
