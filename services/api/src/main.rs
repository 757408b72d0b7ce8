//! API Service - Read-only query interface over the quinzena fact table
//!
//! The charting front end consumes these endpoints; nothing here writes.
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /metrics - Closed list of queryable metric keys
//! - GET /units - Producing units
//! - GET /periods - Safra periods, ordered by reference date
//! - GET /quinzenas - Fact rows joined to both dimensions, with filters
//! - GET /series - One metric for one unit over time
//! - GET /compare - One metric across units for one period

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Metric catalog
// ============================================================================

/// Queryable metric keys mapped to fact-table columns and display labels.
/// The map is closed on purpose: an unknown key is a 400, never an SQL
/// fragment.
const METRICS: &[(&str, &str)] = &[
    ("cana_propria_t", "Cana própria (t) - Moída"),
    ("cana_terceiros_t", "Cana de terceiros (t) - Moída"),
    ("cana_total_t", "Cana total (t) - Moída"),
    ("acucar_total_t", "Açúcar total (t) - Produção"),
    ("etanol_total_m3", "Etanol total (m³) - Produção"),
    ("estoque_acucar_total_t", "Estoque açúcar (t)"),
    ("estoque_etanol_total_m3", "Estoque etanol (m³)"),
];

/// Resolve a metric key to its column name, or None for unknown keys.
fn metric_column(key: &str) -> Option<&'static str> {
    METRICS.iter().find(|(k, _)| *k == key).map(|(k, _)| *k)
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct MetricEntry {
    key: &'static str,
    label: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct UnitResponse {
    id: i32,
    cod_mapa: Option<i32>,
    nome: String,
    apelido: String,
}

#[derive(Serialize, sqlx::FromRow)]
struct PeriodResponse {
    id: i32,
    safra: String,
    periodo_codigo: String,
    periodo_desc: String,
    data_referencia: NaiveDate,
}

#[derive(Serialize)]
struct QuinzenaResponse {
    safra: String,
    periodo_codigo: String,
    data_referencia: NaiveDate,
    unidade: String,
    cana_propria_t: f64,
    cana_terceiros_t: f64,
    cana_total_t: f64,
    acucar_total_t: f64,
    etanol_total_m3: f64,
    estoque_acucar_total_t: f64,
    estoque_etanol_total_m3: f64,
}

#[derive(Serialize)]
struct SeriesPoint {
    data_referencia: NaiveDate,
    safra: String,
    periodo_codigo: String,
    value: f64,
}

#[derive(Serialize)]
struct SeriesResponse {
    unidade: String,
    metric: String,
    points: Vec<SeriesPoint>,
}

#[derive(Serialize)]
struct CompareEntry {
    unidade: String,
    nome: String,
    value: f64,
}

#[derive(Serialize)]
struct CompareResponse {
    periodo_codigo: String,
    metric: String,
    rows: Vec<CompareEntry>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct QuinzenasQuery {
    safra: Option<String>,
    unidade: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SeriesQuery {
    unidade: String,
    metric: String,
}

#[derive(Deserialize)]
struct CompareQuery {
    periodo_codigo: String,
    safra: Option<String>,
    metric: String,
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn metrics_handler() -> Json<serde_json::Value> {
    let entries: Vec<MetricEntry> = METRICS
        .iter()
        .map(|&(key, label)| MetricEntry { key, label })
        .collect();
    Json(serde_json::json!({ "metrics": entries }))
}

async fn units_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let units: Result<Vec<UnitResponse>, _> = sqlx::query_as(
        "SELECT id, cod_mapa, nome, apelido FROM unidade_produtora ORDER BY apelido",
    )
    .fetch_all(&state.pool)
    .await;

    match units {
        Ok(u) => Json(serde_json::json!({ "units": u })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn periods_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let periods: Result<Vec<PeriodResponse>, _> = sqlx::query_as(
        r#"
        SELECT id, safra, periodo_codigo, periodo_desc, data_referencia
        FROM safra_periodo
        ORDER BY data_referencia
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match periods {
        Ok(p) => Json(serde_json::json!({ "periods": p })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn quinzenas_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QuinzenasQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(500).min(5000);

    // Build dynamic query
    let mut query = String::from(
        r#"
        SELECT sp.safra, sp.periodo_codigo, sp.data_referencia, u.apelido AS unidade,
               frq.cana_propria_t, frq.cana_terceiros_t, frq.cana_total_t,
               frq.acucar_total_t, frq.etanol_total_m3,
               frq.estoque_acucar_total_t, frq.estoque_etanol_total_m3
        FROM fato_resumo_quinzena frq
        JOIN safra_periodo sp ON sp.id = frq.safra_periodo_id
        JOIN unidade_produtora u ON u.id = frq.unidade_id
        WHERE 1=1
        "#,
    );

    let mut idx = 1;
    if params.safra.is_some() {
        query.push_str(&format!(" AND sp.safra = ${idx}"));
        idx += 1;
    }
    if params.unidade.is_some() {
        query.push_str(&format!(" AND u.apelido = ${idx}"));
        idx += 1;
    }
    query.push_str(&format!(" ORDER BY sp.data_referencia LIMIT ${idx}"));

    let mut q = sqlx::query(&query);
    if let Some(safra) = &params.safra {
        q = q.bind(safra);
    }
    if let Some(unidade) = &params.unidade {
        q = q.bind(unidade);
    }
    q = q.bind(limit);

    match q.fetch_all(&state.pool).await {
        Ok(rows) => {
            let quinzenas: Vec<QuinzenaResponse> = rows
                .iter()
                .map(|row| QuinzenaResponse {
                    safra: row.get("safra"),
                    periodo_codigo: row.get("periodo_codigo"),
                    data_referencia: row.get("data_referencia"),
                    unidade: row.get("unidade"),
                    cana_propria_t: row.get("cana_propria_t"),
                    cana_terceiros_t: row.get("cana_terceiros_t"),
                    cana_total_t: row.get("cana_total_t"),
                    acucar_total_t: row.get("acucar_total_t"),
                    etanol_total_m3: row.get("etanol_total_m3"),
                    estoque_acucar_total_t: row.get("estoque_acucar_total_t"),
                    estoque_etanol_total_m3: row.get("estoque_etanol_total_m3"),
                })
                .collect();
            Json(serde_json::json!({ "quinzenas": quinzenas })).into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn series_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SeriesQuery>,
) -> impl IntoResponse {
    let Some(column) = metric_column(&params.metric) else {
        return bad_request(format!("unknown metric '{}'", params.metric));
    };

    // column comes from the closed METRICS map, never from the caller
    let query = format!(
        r#"
        SELECT sp.data_referencia, sp.safra, sp.periodo_codigo, frq.{column} AS value
        FROM fato_resumo_quinzena frq
        JOIN safra_periodo sp ON sp.id = frq.safra_periodo_id
        JOIN unidade_produtora u ON u.id = frq.unidade_id
        WHERE u.apelido = $1
        ORDER BY sp.data_referencia
        "#
    );

    match sqlx::query(&query)
        .bind(&params.unidade)
        .fetch_all(&state.pool)
        .await
    {
        Ok(rows) => {
            let points: Vec<SeriesPoint> = rows
                .iter()
                .map(|row| SeriesPoint {
                    data_referencia: row.get("data_referencia"),
                    safra: row.get("safra"),
                    periodo_codigo: row.get("periodo_codigo"),
                    value: row.get("value"),
                })
                .collect();
            Json(SeriesResponse {
                unidade: params.unidade,
                metric: params.metric,
                points,
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CompareQuery>,
) -> impl IntoResponse {
    let Some(column) = metric_column(&params.metric) else {
        return bad_request(format!("unknown metric '{}'", params.metric));
    };

    let query = if params.safra.is_some() {
        format!(
            r#"
            SELECT u.apelido AS unidade, u.nome, frq.{column} AS value
            FROM fato_resumo_quinzena frq
            JOIN safra_periodo sp ON sp.id = frq.safra_periodo_id
            JOIN unidade_produtora u ON u.id = frq.unidade_id
            WHERE sp.periodo_codigo = $1 AND sp.safra = $2
            ORDER BY value DESC
            "#
        )
    } else {
        format!(
            r#"
            SELECT u.apelido AS unidade, u.nome, frq.{column} AS value
            FROM fato_resumo_quinzena frq
            JOIN safra_periodo sp ON sp.id = frq.safra_periodo_id
            JOIN unidade_produtora u ON u.id = frq.unidade_id
            WHERE sp.periodo_codigo = $1
            ORDER BY value DESC
            "#
        )
    };

    let rows = if let Some(safra) = &params.safra {
        sqlx::query(&query)
            .bind(&params.periodo_codigo)
            .bind(safra)
            .fetch_all(&state.pool)
            .await
    } else {
        sqlx::query(&query)
            .bind(&params.periodo_codigo)
            .fetch_all(&state.pool)
            .await
    };

    match rows {
        Ok(rows) => {
            let entries: Vec<CompareEntry> = rows
                .iter()
                .map(|row| CompareEntry {
                    unidade: row.get("unidade"),
                    nome: row.get("nome"),
                    value: row.get("value"),
                })
                .collect();
            Json(CompareResponse {
                periodo_codigo: params.periodo_codigo,
                metric: params.metric,
                rows: entries,
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: sqlx::Error) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse { error: message }),
    )
        .into_response()
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== SapCana API ===");
    println!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    println!("Database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/units", get(units_handler))
        .route("/periods", get(periods_handler))
        .route("/quinzenas", get(quinzenas_handler))
        .route("/series", get(series_handler))
        .route("/compare", get(compare_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /metrics");
    println!("  GET /units");
    println!("  GET /periods");
    println!("  GET /quinzenas?safra=&unidade=&limit=");
    println!("  GET /series?unidade=&metric=");
    println!("  GET /compare?periodo_codigo=&safra=&metric=");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
