//! ETL Service - Ingests monthly service-request CSV extracts
//!
//! Responsibilities:
//! - Stream arbitrarily large CSV extracts in bounded chunks
//! - Normalize and validate raw rows into the canonical schema
//! - Replace all rows for the target reporting period, then upsert
//! - Write clean batches in sub-batch transactions
//! - Record run outcomes in the ingestion_log ledger
//!
//! A rerun for the same period is idempotent: prior rows for that period
//! are deleted before any write, so the period is fully superseded.
//!
//! Usage:
//!   cargo run --bin etl -- --file data/311_2024-03.csv --period 2024-03
//!   cargo run --bin etl -- --file data/311_2024-03.csv --period 2024-03 --limit 100000

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use clap::Parser;
use csv::StringRecord;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::Path;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "etl", about = "Loads a service-request CSV extract for one reporting period")]
struct Args {
    /// Path to the source CSV extract
    #[arg(long)]
    file: String,

    /// Reporting period to load (YYYY-MM)
    #[arg(long)]
    period: String,

    /// Raw rows read per chunk
    #[arg(long, default_value_t = 50_000)]
    chunk_size: usize,

    /// Rows written per transaction
    #[arg(long, default_value_t = 10_000)]
    batch: usize,

    /// Stop after this many clean rows (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    limit: u64,

    /// Reject rows created before this date
    #[arg(long, default_value = "2010-01-01")]
    min_date: NaiveDate,
}

// =============================================================================
// Source schema
// =============================================================================

/// Canonical placeholder for missing/invalid categorical fields
const UNKNOWN: &str = "UNKNOWN";

/// Columns the extract must carry. Resolved against the header row by name,
/// order-independent; any missing column halts the run before any write.
const SOURCE_COLUMNS: &[&str] = &[
    "Unique Key",
    "Created Date",
    "Closed Date",
    "Agency",
    "Agency Name",
    "Complaint Type",
    "Descriptor",
    "Borough",
    "City",
    "Latitude",
    "Longitude",
    "Status",
    "Resolution Description",
];

/// Header-name to field-index mapping for one source file
#[derive(Debug)]
struct ColumnMap {
    unique_key: usize,
    created_date: usize,
    closed_date: usize,
    agency: usize,
    agency_name: usize,
    complaint_type: usize,
    descriptor: usize,
    borough: usize,
    city: usize,
    latitude: usize,
    longitude: usize,
    status: usize,
    resolution_description: usize,
}

impl ColumnMap {
    fn resolve(headers: &StringRecord) -> Result<Self> {
        let find = |name: &str| -> Result<usize> {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .with_context(|| format!("Source file is missing required column '{}'", name))
        };

        Ok(Self {
            unique_key: find("Unique Key")?,
            created_date: find("Created Date")?,
            closed_date: find("Closed Date")?,
            agency: find("Agency")?,
            agency_name: find("Agency Name")?,
            complaint_type: find("Complaint Type")?,
            descriptor: find("Descriptor")?,
            borough: find("Borough")?,
            city: find("City")?,
            latitude: find("Latitude")?,
            longitude: find("Longitude")?,
            status: find("Status")?,
            resolution_description: find("Resolution Description")?,
        })
    }
}

// =============================================================================
// Record normalizer
// =============================================================================

/// Canonical row ready for upsert
#[derive(Debug, Clone, PartialEq)]
struct ServiceRequest {
    request_id: i64,
    created_at: NaiveDateTime,
    closed_at: Option<NaiveDateTime>,
    agency: Option<String>,
    agency_name: Option<String>,
    complaint_type: String,
    descriptor: Option<String>,
    borough: String,
    city: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    status: Option<String>,
    resolution_description: Option<String>,
    period_key: String,
}

/// Why a raw row was dropped. Row-level only, never a run-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reject {
    MissingRequestId,
    BadRequestId,
    MissingCreatedDate,
    BadCreatedDate,
    BeforeMinimumDate,
}

/// Timestamp formats seen in the feed. The primary export format is
/// "03/15/2024 10:30:00 AM"; the rest cover re-exported files.
const DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d"];

fn parse_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(d.and_time(NaiveTime::MIN));
        }
    }
    None
}

fn opt_text(record: &StringRecord, idx: usize) -> Option<String> {
    record
        .get(idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn opt_float(record: &StringRecord, idx: usize) -> Option<f64> {
    record.get(idx).and_then(|s| s.trim().parse().ok())
}

/// Normalize one raw record into the canonical schema, or reject it.
///
/// Identity and creation date are hard gates; everything else degrades to
/// null (or the UNKNOWN sentinel for categorical fields). Pure transform.
fn normalize_record(
    columns: &ColumnMap,
    record: &StringRecord,
    min_created: NaiveDate,
) -> Result<ServiceRequest, Reject> {
    let raw_id = record.get(columns.unique_key).map(str::trim).unwrap_or("");
    if raw_id.is_empty() {
        return Err(Reject::MissingRequestId);
    }
    let request_id: i64 = raw_id.parse().map_err(|_| Reject::BadRequestId)?;

    let raw_created = record
        .get(columns.created_date)
        .map(str::trim)
        .unwrap_or("");
    if raw_created.is_empty() {
        return Err(Reject::MissingCreatedDate);
    }
    let created_at = parse_datetime(raw_created).ok_or(Reject::BadCreatedDate)?;
    if created_at.date() < min_created {
        return Err(Reject::BeforeMinimumDate);
    }

    // Closed-date problems never reject the record
    let closed_at = record.get(columns.closed_date).and_then(parse_datetime);

    let borough = match opt_text(record, columns.borough) {
        Some(b) if !b.eq_ignore_ascii_case("unspecified") => b,
        _ => UNKNOWN.to_string(),
    };
    let complaint_type =
        opt_text(record, columns.complaint_type).unwrap_or_else(|| UNKNOWN.to_string());

    let period_key = created_at.format("%Y-%m").to_string();

    Ok(ServiceRequest {
        request_id,
        created_at,
        closed_at,
        agency: opt_text(record, columns.agency),
        agency_name: opt_text(record, columns.agency_name),
        complaint_type,
        descriptor: opt_text(record, columns.descriptor),
        borough,
        city: opt_text(record, columns.city),
        latitude: opt_float(record, columns.latitude),
        longitude: opt_float(record, columns.longitude),
        status: opt_text(record, columns.status),
        resolution_description: opt_text(record, columns.resolution_description),
        period_key,
    })
}

// =============================================================================
// Chunk processor
// =============================================================================

/// Clean batch produced from one raw chunk
#[derive(Debug)]
struct CleanBatch {
    rows: Vec<ServiceRequest>,
    rejected: u64,
}

/// Normalize a chunk of raw records, dropping rejects and preserving input
/// order. When a remaining-row budget is given, the clean batch is truncated
/// to fit it; the caller derives consumption from `rows.len()`.
fn clean_chunk(
    columns: &ColumnMap,
    records: &[StringRecord],
    min_created: NaiveDate,
    remaining: Option<u64>,
) -> CleanBatch {
    let mut rows = Vec::with_capacity(records.len());
    let mut rejected = 0u64;

    for record in records {
        match normalize_record(columns, record, min_created) {
            Ok(row) => rows.push(row),
            Err(_) => rejected += 1,
        }
    }

    if let Some(budget) = remaining {
        rows.truncate(budget as usize);
    }

    CleanBatch { rows, rejected }
}

/// Read up to `chunk_size` records from the stream. Unreadable lines are
/// counted and skipped, never fatal.
fn read_chunk(
    records: &mut csv::StringRecordsIntoIter<std::fs::File>,
    chunk_size: usize,
    read_errors: &mut u64,
) -> Vec<StringRecord> {
    let mut chunk = Vec::with_capacity(chunk_size);
    while chunk.len() < chunk_size {
        match records.next() {
            Some(Ok(record)) => chunk.push(record),
            Some(Err(e)) => {
                eprintln!("Warning: skipping unreadable line: {}", e);
                *read_errors += 1;
            }
            None => break,
        }
    }
    chunk
}

// =============================================================================
// Run ledger
// =============================================================================

/// Ledger details payload, always stored as well-formed JSON
#[derive(Debug, Clone, PartialEq)]
struct RunDetails(serde_json::Value);

impl RunDetails {
    fn from_value(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// A string that already parses as JSON is stored parsed; anything else
    /// is wrapped as {"message": ...} so the column stays queryable.
    fn from_text(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(value) => Self(value),
            Err(_) => Self(serde_json::json!({ "message": text })),
        }
    }
}

/// Upsert a started ledger entry for the period, clearing any prior outcome
async fn start_run(pool: &PgPool, period_key: &str, source_file: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ingestion_log (period_key, source_file, started_at, status)
        VALUES ($1, $2, now(), 'started')
        ON CONFLICT (period_key) DO UPDATE
        SET source_file = EXCLUDED.source_file,
            started_at = now(),
            finished_at = NULL,
            row_count = 0,
            status = 'started',
            details = NULL
        "#,
    )
    .bind(period_key)
    .bind(source_file)
    .execute(pool)
    .await?;
    Ok(())
}

/// Finalize the period's ledger entry as success or failed
async fn finish_run(
    pool: &PgPool,
    period_key: &str,
    row_count: u64,
    status: &str,
    details: RunDetails,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE ingestion_log
        SET finished_at = now(), row_count = $2, status = $3, details = $4
        WHERE period_key = $1
        "#,
    )
    .bind(period_key)
    .bind(row_count as i64)
    .bind(status)
    .bind(details.0)
    .execute(pool)
    .await?;
    Ok(())
}

// =============================================================================
// Period loader
// =============================================================================

/// Delete all rows for the period so the rerun is a clean replace
async fn delete_period(pool: &PgPool, period_key: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM service_requests WHERE period_key = $1")
        .bind(period_key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Upsert one sub-batch inside a single transaction. Any failure rolls the
/// whole sub-batch back (on drop) and aborts the run.
async fn upsert_batch(pool: &PgPool, rows: &[ServiceRequest]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO service_requests
            (request_id, created_at, closed_at, agency, agency_name, complaint_type, descriptor,
             borough, city, latitude, longitude, status, resolution_description, period_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (request_id) DO UPDATE SET
              created_at = EXCLUDED.created_at,
              closed_at = EXCLUDED.closed_at,
              agency = EXCLUDED.agency,
              agency_name = EXCLUDED.agency_name,
              complaint_type = EXCLUDED.complaint_type,
              descriptor = EXCLUDED.descriptor,
              borough = EXCLUDED.borough,
              city = EXCLUDED.city,
              latitude = EXCLUDED.latitude,
              longitude = EXCLUDED.longitude,
              status = EXCLUDED.status,
              resolution_description = EXCLUDED.resolution_description,
              period_key = EXCLUDED.period_key
            "#,
        )
        .bind(row.request_id)
        .bind(row.created_at)
        .bind(row.closed_at)
        .bind(&row.agency)
        .bind(&row.agency_name)
        .bind(&row.complaint_type)
        .bind(&row.descriptor)
        .bind(&row.borough)
        .bind(&row.city)
        .bind(row.latitude)
        .bind(row.longitude)
        .bind(&row.status)
        .bind(&row.resolution_description)
        .bind(&row.period_key)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Running totals for one ingestion run. Held by the caller so a failed run
/// still reports the rows committed before the failure.
#[derive(Debug, Default)]
struct RunTotals {
    inserted: u64,
    rejected: u64,
}

/// Execute one full ingestion run for the target period.
///
/// Chunks are processed strictly in order: the remaining-row budget from
/// earlier chunks decides how much of later ones is kept.
async fn run_ingest(pool: &PgPool, args: &Args, totals: &mut RunTotals) -> Result<()> {
    let t0 = Instant::now();
    let source_file = Path::new(&args.file)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| args.file.clone());

    start_run(pool, &args.period, &source_file).await?;

    let deleted = delete_period(pool, &args.period).await?;
    println!("Replaced period {}: {} prior rows deleted", args.period, deleted);

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(&args.file)
        .with_context(|| format!("Failed to open source file '{}'", args.file))?;
    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let columns = ColumnMap::resolve(&headers)?;
    let mut records = reader.into_records();

    let mut remaining = (args.limit > 0).then_some(args.limit);
    let mut chunk_index = 0u64;

    loop {
        let chunk = read_chunk(&mut records, args.chunk_size, &mut totals.rejected);
        if chunk.is_empty() {
            break;
        }
        chunk_index += 1;

        let batch = clean_chunk(&columns, &chunk, args.min_date, remaining);
        totals.rejected += batch.rejected;
        if let Some(budget) = remaining.as_mut() {
            *budget -= batch.rows.len() as u64;
        }

        for sub_batch in batch.rows.chunks(args.batch) {
            upsert_batch(pool, sub_batch).await?;
            totals.inserted += sub_batch.len() as u64;
        }

        let elapsed = t0.elapsed().as_secs_f64();
        let rps = if elapsed > 0.0 {
            totals.inserted as f64 / elapsed
        } else {
            0.0
        };
        println!(
            "[chunk {}] inserted={} rejected={} rps={:.0}",
            chunk_index, totals.inserted, totals.rejected, rps
        );

        if remaining == Some(0) {
            println!("Row limit reached, stopping");
            break;
        }
    }

    Ok(())
}

// =============================================================================
// Main
// =============================================================================

/// Details summary stored on a successful run
#[derive(Debug, Serialize)]
struct RunSummary {
    duration_sec: f64,
    chunk_size: usize,
    batch: usize,
    inserted: u64,
    rejected: u64,
}

fn validate_period(period: &str) -> Result<()> {
    let bytes = period.as_bytes();
    let ok = bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
        && matches!(period[5..].parse::<u32>(), Ok(1..=12));
    if !ok {
        bail!("Invalid period '{}'. Expected format: YYYY-MM", period);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    validate_period(&args.period)?;

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;

    println!("=== Service Request ETL ===");
    println!("File: {}", args.file);
    println!("Period: {}", args.period);
    println!(
        "Chunk size: {}, batch: {}, limit: {}",
        args.chunk_size,
        args.batch,
        if args.limit > 0 {
            args.limit.to_string()
        } else {
            "unlimited".to_string()
        }
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let t0 = Instant::now();
    let mut totals = RunTotals::default();
    let result = run_ingest(&pool, &args, &mut totals).await;

    match &result {
        Ok(()) => {
            let summary = RunSummary {
                duration_sec: (t0.elapsed().as_secs_f64() * 100.0).round() / 100.0,
                chunk_size: args.chunk_size,
                batch: args.batch,
                inserted: totals.inserted,
                rejected: totals.rejected,
            };
            finish_run(
                &pool,
                &args.period,
                totals.inserted,
                "success",
                RunDetails::from_value(serde_json::to_value(&summary)?),
            )
            .await?;
            println!(
                "[done] rows={} rejected={}",
                totals.inserted, totals.rejected
            );
        }
        Err(e) => {
            // Rows committed before the failure stay committed; the ledger
            // records how far the run got.
            finish_run(
                &pool,
                &args.period,
                totals.inserted,
                "failed",
                RunDetails::from_text(&format!("{:#}", e)),
            )
            .await?;
            eprintln!("ETL FAILED: {:#}", e);
        }
    }

    result
}

// =============================================================================
// Tests
// =============================================================================
