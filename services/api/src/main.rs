//! API Service - Read-only query surface over ingested service requests
//!
//! Endpoints:
//! - GET /health - Health check
//! - GET /search - Paginated filtered search
//! - GET /aggregate/borough - Complaint counts per borough
//!
//! This service never writes: the ETL binary owns the table.

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

const PAGE_SIZE: i64 = 20;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize, sqlx::FromRow)]
struct SearchRow {
    request_id: i64,
    created_at: NaiveDateTime,
    borough: String,
    complaint_type: String,
    descriptor: Option<String>,
    status: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    total: i64,
    page: i64,
    pages: i64,
    page_size: i64,
    rows: Vec<SearchRow>,
}

#[derive(Serialize, sqlx::FromRow)]
struct BoroughCount {
    borough: String,
    total: i64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Deserialize)]
struct SearchQuery {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    borough: Option<String>,
    complaint: Option<String>,
    page: Option<i64>,
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

fn page_count(total: i64, page_size: i64) -> i64 {
    if total == 0 {
        0
    } else {
        (total + page_size - 1) / page_size
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Response {
    let page = params.page.unwrap_or(1).max(1);

    // Date range applies only when both ends are given
    let range = match (params.start, params.end) {
        (Some(start), Some(end)) => {
            Some((start.and_time(NaiveTime::MIN), end.and_time(NaiveTime::MIN)))
        }
        _ => None,
    };
    let borough = params.borough.filter(|b| !b.is_empty());
    let complaint = params.complaint.filter(|c| !c.is_empty());

    // Build dynamic WHERE clause
    let mut where_sql = String::from(" WHERE 1=1");
    let mut idx = 1;

    if range.is_some() {
        where_sql.push_str(&format!(" AND created_at BETWEEN ${} AND ${}", idx, idx + 1));
        idx += 2;
    }
    if borough.is_some() {
        where_sql.push_str(&format!(" AND borough = ${}", idx));
        idx += 1;
    }
    if complaint.is_some() {
        where_sql.push_str(&format!(" AND complaint_type ILIKE ${}", idx));
        idx += 1;
    }

    let count_sql = format!("SELECT COUNT(*) FROM service_requests{}", where_sql);
    let mut count_q = sqlx::query_scalar::<_, i64>(&count_sql);
    if let Some((start, end)) = range {
        count_q = count_q.bind(start).bind(end);
    }
    if let Some(b) = &borough {
        count_q = count_q.bind(b);
    }
    if let Some(c) = &complaint {
        count_q = count_q.bind(format!("%{}%", c));
    }

    let total = match count_q.fetch_one(&state.pool).await {
        Ok(total) => total,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    let rows_sql = format!(
        "SELECT request_id, created_at, borough, complaint_type, descriptor, status \
         FROM service_requests{} ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
        where_sql,
        idx,
        idx + 1
    );
    let mut rows_q = sqlx::query_as::<_, SearchRow>(&rows_sql);
    if let Some((start, end)) = range {
        rows_q = rows_q.bind(start).bind(end);
    }
    if let Some(b) = &borough {
        rows_q = rows_q.bind(b);
    }
    if let Some(c) = &complaint {
        rows_q = rows_q.bind(format!("%{}%", c));
    }
    rows_q = rows_q.bind(PAGE_SIZE).bind((page - 1) * PAGE_SIZE);

    match rows_q.fetch_all(&state.pool).await {
        Ok(rows) => Json(SearchResponse {
            total,
            page,
            pages: page_count(total, PAGE_SIZE),
            page_size: PAGE_SIZE,
            rows,
        })
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

async fn aggregate_borough_handler(State(state): State<Arc<AppState>>) -> Response {
    let counts: Result<Vec<BoroughCount>, _> = sqlx::query_as(
        r#"
        SELECT borough, COUNT(*) AS total
        FROM service_requests
        GROUP BY borough
        ORDER BY total DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await;

    match counts {
        Ok(counts) => Json(serde_json::json!({ "aggregate": counts })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    println!("=== Service Request API ===");
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
        .route("/search", get(search_handler))
        .route("/aggregate/borough", get(aggregate_borough_handler))
        .layer(cors)
        .with_state(state);

    println!("API listening on http://{}", bind);
    println!("\nEndpoints:");
    println!("  GET /health");
    println!("  GET /search?start=&end=&borough=&complaint=&page=");
    println!("  GET /aggregate/borough");

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0, 20), 0);
        assert_eq!(page_count(1, 20), 1);
        assert_eq!(page_count(20, 20), 1);
        assert_eq!(page_count(21, 20), 2);
        assert_eq!(page_count(399, 20), 20);
    }
}
