//! Pipeline Service - Extracts quinzena production data from mill PDF bulletins
//!
//! Responsibilities:
//! - Discover PDF bulletins in an input directory (one per unit per quinzena)
//! - Extract the text layer and parse header + per-product metric blocks
//! - Decode the quinzena period code into a calendar reference date
//! - Write one consolidated CSV with all extracted rows
//! - Upsert period/unit dimensions and the quinzena fact into PostgreSQL
//!
//! CRITICAL: This service must be DETERMINISTIC
//! Same set of PDFs = same CSV and same database state (upserts by natural key)
//!
//! Usage:
//!   cargo run --bin pipeline -- <pdf_dir> <output_csv> [--dry-run]

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::Parser;
use regex::Regex;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Postgres, Transaction};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Loads quinzenal mill bulletins into the fact table")]
struct Args {
    /// Directory containing the PDF bulletins
    input_dir: PathBuf,

    /// Path for the consolidated CSV export
    output_csv: PathBuf,

    /// Dry run - extract and export, don't save to database
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

// =============================================================================
// Document text layout markers
// =============================================================================
// The bulletins are a fixed SAP report template. Extracted text (horizontal
// whitespace collapsed) keeps two stable markers per product block:
//   "Matéria prima / Produto / Subproduto"  starts a block
//   "Tipo Lançamento Valor"                 separates product name from entries

const BLOCK_MARKER: &str = "Matéria prima / Produto / Subproduto";
const ENTRY_MARKER: &str = "Tipo Lançamento Valor";

// =============================================================================
// Data types
// =============================================================================

/// Header fields of one bulletin. Every field is independently optional:
/// a partial text layer must not abort extraction of the rest.
#[derive(Debug, Default, Clone, PartialEq)]
struct HeaderInfo {
    /// Harvest year, e.g. "2025/2026"
    safra: Option<String>,
    /// Raw period token, e.g. "2025/10-Quinz.02"
    raw_period: Option<String>,
    producer_code: Option<i32>,
    producer_name: Option<String>,
}

/// Decoded quinzena period.
#[derive(Debug, Clone, PartialEq)]
struct PeriodInfo {
    /// Canonical code, e.g. "2025/10-Q2"
    code: String,
    description: String,
    reference_date: NaiveDate,
}

/// Product block classification. The template only ever reports these
/// categories; anything else (yeast, bagasse, molasses lines) is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProductCategory {
    OwnCane,
    ThirdPartyCane,
    AnhydrousEthanol,
    HydratedEthanol,
    Sugar,
    Ignored,
}

/// Accumulated raw metrics of one bulletin. Cane and production values
/// accumulate across blocks; ethanol stock is a snapshot the report already
/// aggregates, so it is overwritten rather than summed. Sugar stock is summed
/// across sub-types (Cristal, VHP, ...) because each sub-type reports its own.
#[derive(Debug, Default, Clone, PartialEq)]
struct MetricBundle {
    own_cane_t: f64,
    third_party_cane_t: f64,
    anhydrous_prod_m3: f64,
    anhydrous_stock_m3: f64,
    hydrated_prod_m3: f64,
    hydrated_stock_m3: f64,
    sugar_total_t: f64,
    sugar_stock_t: f64,
}

/// One fully assembled row, ready for CSV export and persistence.
/// Immutable after assembly; derived totals are computed here and nowhere else.
#[derive(Debug, Clone, PartialEq)]
struct QuinzenaRecord {
    safra: String,
    /// None when the period token was absent or malformed. Such a record is
    /// still exported to CSV but skipped at persistence time.
    period: Option<PeriodInfo>,
    unit_alias: String,
    producer_code: Option<i32>,
    producer_name: String,
    metrics: MetricBundle,
    total_cane_t: f64,
    total_ethanol_m3: f64,
    total_ethanol_stock_m3: f64,
}

// =============================================================================
// Number parsing (pt-BR locale)
// =============================================================================

/// Parse a pt-BR formatted decimal ("1.234,50") into f64.
/// Returns None when the substring is not a valid numeral; callers treat
/// that as a zero contribution, not as a document failure.
fn parse_decimal_br(raw: &str) -> Option<f64> {
    let canonical = raw.replace('.', "").replace(',', ".");
    canonical.parse::<f64>().ok()
}

// =============================================================================
// Header extraction
// =============================================================================

fn parse_header(text: &str) -> HeaderInfo {
    let safra = Regex::new(r"([0-9]{4}/[0-9]{4})\s*Safra:")
        .ok()
        .and_then(|re| re.captures(text).map(|c| c[1].to_string()));

    let raw_period = Regex::new(r"Periodo de Lançamento:\s*([0-9]{4}/[0-9]{2}-Quinz\.0[12])")
        .ok()
        .and_then(|re| re.captures(text).map(|c| c[1].to_string()));

    // "Produtor: 13737 - JAPUNGU AGROINDUSTRIAL LTDA Matéria prima ..."
    let producer = Regex::new(r"Produtor:\s*([0-9]+)\s*-\s*(.+?)\s*Matéria prima")
        .ok()
        .and_then(|re| {
            re.captures(text)
                .map(|c| (c[1].to_string(), c[2].trim().to_string()))
        });

    let (producer_code, producer_name) = match producer {
        Some((code, name)) => (code.parse::<i32>().ok(), Some(name)),
        None => (None, None),
    };

    HeaderInfo {
        safra,
        raw_period,
        producer_code,
        producer_name,
    }
}

// =============================================================================
// Period decoding
// =============================================================================

/// Decode a raw period token ("2025/10-Quinz.02") into the canonical code,
/// a human description and the quinzena reference date: day 15 for the first
/// quinzena, the true last day of the month for the second.
fn decode_period(raw: &str) -> Option<PeriodInfo> {
    let re = Regex::new(r"^([0-9]{4})/([0-9]{2})-Quinz\.0([12])$").ok()?;
    let cap = re.captures(raw)?;

    let year: i32 = cap[1].parse().ok()?;
    let month: u32 = cap[2].parse().ok()?;
    let quinzena: u32 = cap[3].parse().ok()?;

    let day = if quinzena == 1 {
        15
    } else {
        last_day_of_month(year, month)?
    };
    let reference_date = NaiveDate::from_ymd_opt(year, month, day)?;

    Some(PeriodInfo {
        code: format!("{year}/{month:02}-Q{quinzena}"),
        description: format!("{quinzena}ª quinzena de {month:02}/{year}"),
        reference_date,
    })
}

/// Number of days in (year, month), leap-year correct: the day before the
/// first of the following month.
fn last_day_of_month(year: i32, month: u32) -> Option<u32> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }?;
    Some(first_of_next.pred_opt()?.day())
}

// =============================================================================
// Metric extraction
// =============================================================================

/// Classify a product block name into the closed category set.
/// "Açúcar -" is a shared prefix: Cristal, VHP etc. all aggregate into one
/// sugar total. Unknown products map to Ignored, never to an error.
fn classify_product(name: &str) -> ProductCategory {
    if name.contains("Cana moída - Própria") {
        ProductCategory::OwnCane
    } else if name.contains("Cana moída - Terceiros") {
        ProductCategory::ThirdPartyCane
    } else if name.contains("Etanol - Anidro") {
        ProductCategory::AnhydrousEthanol
    } else if name.contains("Etanol - Hidratado") {
        ProductCategory::HydratedEthanol
    } else if name.contains("Açúcar -") {
        ProductCategory::Sugar
    } else {
        ProductCategory::Ignored
    }
}

/// Capture the production/intake value of a line:
/// "Entrada t 1.234,50 Produção" or "Entrada m³ 2.000,00 Produção".
fn production_value(line: &str, unit: &str) -> Option<f64> {
    let re = Regex::new(&format!(
        r"Entrada {} ?([0-9.,]+) Produção",
        regex::escape(unit)
    ))
    .ok()?;
    parse_decimal_br(&re.captures(line)?[1])
}

/// Capture the current-period physical stock value of a line:
/// "Estoque físico do período atual t 120,00".
fn stock_value(line: &str, unit: &str) -> Option<f64> {
    let re = Regex::new(&format!(
        r"Estoque físico do período atual {} ?([0-9.,]+)",
        regex::escape(unit)
    ))
    .ok()?;
    parse_decimal_br(&re.captures(line)?[1])
}

/// Walk the product blocks of one bulletin and accumulate metrics.
/// The text before the first block marker is the report header and carries
/// no product data.
fn parse_metrics(text: &str) -> MetricBundle {
    let mut metrics = MetricBundle::default();

    let mut blocks = text.split(BLOCK_MARKER);
    blocks.next();

    for block in blocks {
        let (name, body) = match block.split_once(ENTRY_MARKER) {
            Some((name, body)) => (name, body),
            None => (block, ""),
        };
        let name = name.trim().replace('\n', " ");
        let category = classify_product(&name);

        for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match category {
                ProductCategory::OwnCane => {
                    if let Some(v) = production_value(line, "t") {
                        metrics.own_cane_t += v;
                    }
                }
                ProductCategory::ThirdPartyCane => {
                    if let Some(v) = production_value(line, "t") {
                        metrics.third_party_cane_t += v;
                    }
                }
                ProductCategory::AnhydrousEthanol => {
                    if let Some(v) = production_value(line, "m³") {
                        metrics.anhydrous_prod_m3 += v;
                    }
                    if let Some(v) = stock_value(line, "m³") {
                        metrics.anhydrous_stock_m3 = v;
                    }
                }
                ProductCategory::HydratedEthanol => {
                    if let Some(v) = production_value(line, "m³") {
                        metrics.hydrated_prod_m3 += v;
                    }
                    if let Some(v) = stock_value(line, "m³") {
                        metrics.hydrated_stock_m3 = v;
                    }
                }
                ProductCategory::Sugar => {
                    if let Some(v) = production_value(line, "t") {
                        metrics.sugar_total_t += v;
                    }
                    if let Some(v) = stock_value(line, "t") {
                        metrics.sugar_stock_t += v;
                    }
                }
                ProductCategory::Ignored => {}
            }
        }
    }

    metrics
}

// =============================================================================
// Record assembly
// =============================================================================

/// Unit alias: the last whitespace-delimited token of the producer name.
/// A naming heuristic, so alias collisions are a data-quality concern for the
/// operator, not a program error.
fn unit_alias(producer_name: &str) -> Option<String> {
    producer_name
        .split_whitespace()
        .last()
        .map(|s| s.to_string())
}

/// Assemble the canonical row of one bulletin. Fails only when the mandatory
/// identity fields (harvest code, producing-unit alias) cannot be derived;
/// every metric miss degrades to zero instead.
fn assemble_record(text: &str) -> Result<QuinzenaRecord> {
    let header = parse_header(text);
    let metrics = parse_metrics(text);
    let period = header.raw_period.as_deref().and_then(decode_period);

    let safra = header
        .safra
        .context("harvest code (Safra) not found in document")?;
    let producer_name = header
        .producer_name
        .context("producer (Produtor) not found in document")?;
    let alias = unit_alias(&producer_name)
        .context("unit alias could not be derived from producer name")?;

    let total_cane_t = metrics.own_cane_t + metrics.third_party_cane_t;
    let total_ethanol_m3 = metrics.anhydrous_prod_m3 + metrics.hydrated_prod_m3;
    let total_ethanol_stock_m3 = metrics.anhydrous_stock_m3 + metrics.hydrated_stock_m3;

    Ok(QuinzenaRecord {
        safra,
        period,
        unit_alias: alias,
        producer_code: header.producer_code,
        producer_name,
        metrics,
        total_cane_t,
        total_ethanol_m3,
        total_ethanol_stock_m3,
    })
}

/// Collapse runs of spaces/tabs into single spaces, preserving line breaks.
/// PDF text layers pad columns with variable spacing; the patterns above
/// assume single spaces.
fn normalize_whitespace(text: &str) -> String {
    match Regex::new(r"[ \t]+") {
        Ok(re) => re.replace_all(text, " ").into_owned(),
        Err(_) => text.to_string(),
    }
}

/// One-shot document read: PDF file -> normalized text -> assembled record.
fn extract_record(path: &Path) -> Result<QuinzenaRecord> {
    let text = pdf_extract::extract_text(path)
        .map_err(|e| anyhow::anyhow!("failed to extract text layer: {e}"))?;
    assemble_record(&normalize_whitespace(&text))
}

// =============================================================================
// CSV export
// =============================================================================

const CSV_COLUMNS: [&str; 12] = [
    "safra",
    "periodo_codigo",
    "periodo_desc",
    "data_referencia",
    "unidade_apelido",
    "cana_propria_t",
    "cana_terceiros_t",
    "cana_total_t",
    "acucar_total_t",
    "etanol_total_m3",
    "estoque_acucar_total_t",
    "estoque_etanol_total_m3",
];

/// Render a numeric field with the pt-BR decimal comma.
fn decimal_comma(value: f64) -> String {
    format!("{value:.2}").replace('.', ",")
}

fn csv_row(record: &QuinzenaRecord) -> Vec<String> {
    let (code, desc, date) = match &record.period {
        Some(p) => (
            p.code.clone(),
            p.description.clone(),
            p.reference_date.format("%Y-%m-%d").to_string(),
        ),
        None => (String::new(), String::new(), String::new()),
    };

    vec![
        record.safra.clone(),
        code,
        desc,
        date,
        record.unit_alias.clone(),
        decimal_comma(record.metrics.own_cane_t),
        decimal_comma(record.metrics.third_party_cane_t),
        decimal_comma(record.total_cane_t),
        decimal_comma(record.metrics.sugar_total_t),
        decimal_comma(record.total_ethanol_m3),
        decimal_comma(record.metrics.sugar_stock_t),
        decimal_comma(record.total_ethanol_stock_m3),
    ]
}

fn write_csv(path: &Path, records: &[QuinzenaRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create CSV at {}", path.display()))?;

    writer.write_record(CSV_COLUMNS)?;
    for record in records {
        writer.write_record(csv_row(record))?;
    }
    writer.flush()?;

    Ok(())
}

// =============================================================================
// Persistence - natural-key upserts, one transaction per batch
// =============================================================================

/// Upsert the quinzena period dimension by (safra, periodo_codigo),
/// returning the surrogate id.
async fn upsert_period(
    tx: &mut Transaction<'_, Postgres>,
    safra: &str,
    period: &PeriodInfo,
) -> Result<i32> {
    let (id,): (i32,) = sqlx::query_as(
        r#"
        INSERT INTO safra_periodo (safra, periodo_codigo, periodo_desc, data_referencia)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (safra, periodo_codigo) DO UPDATE
        SET periodo_desc = EXCLUDED.periodo_desc,
            data_referencia = EXCLUDED.data_referencia
        RETURNING id
        "#,
    )
    .bind(safra)
    .bind(&period.code)
    .bind(&period.description)
    .bind(period.reference_date)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Upsert the producing-unit dimension by alias, returning the surrogate id.
/// The alias is the stable key; code and name follow the latest bulletin.
async fn upsert_unit(tx: &mut Transaction<'_, Postgres>, record: &QuinzenaRecord) -> Result<i32> {
    let (id,): (i32,) = sqlx::query_as(
        r#"
        INSERT INTO unidade_produtora (cod_mapa, nome, apelido)
        VALUES ($1, $2, $3)
        ON CONFLICT (apelido) DO UPDATE
        SET cod_mapa = EXCLUDED.cod_mapa,
            nome = EXCLUDED.nome
        RETURNING id
        "#,
    )
    .bind(record.producer_code)
    .bind(&record.producer_name)
    .bind(&record.unit_alias)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Upsert the quinzena fact by (safra_periodo_id, unidade_id). Re-processing
/// the same bulletin overwrites the metric fields and bumps updated_at; it
/// never duplicates the row.
async fn upsert_fact(
    tx: &mut Transaction<'_, Postgres>,
    period_id: i32,
    unit_id: i32,
    record: &QuinzenaRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO fato_resumo_quinzena (
            safra_periodo_id, unidade_id,
            cana_propria_t, cana_terceiros_t, cana_total_t,
            acucar_total_t, etanol_total_m3,
            estoque_acucar_total_t, estoque_etanol_total_m3
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (safra_periodo_id, unidade_id) DO UPDATE SET
            cana_propria_t = EXCLUDED.cana_propria_t,
            cana_terceiros_t = EXCLUDED.cana_terceiros_t,
            cana_total_t = EXCLUDED.cana_total_t,
            acucar_total_t = EXCLUDED.acucar_total_t,
            etanol_total_m3 = EXCLUDED.etanol_total_m3,
            estoque_acucar_total_t = EXCLUDED.estoque_acucar_total_t,
            estoque_etanol_total_m3 = EXCLUDED.estoque_etanol_total_m3,
            updated_at = now()
        "#,
    )
    .bind(period_id)
    .bind(unit_id)
    .bind(record.metrics.own_cane_t)
    .bind(record.metrics.third_party_cane_t)
    .bind(record.total_cane_t)
    .bind(record.metrics.sugar_total_t)
    .bind(record.total_ethanol_m3)
    .bind(record.metrics.sugar_stock_t)
    .bind(record.total_ethanol_stock_m3)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

// =============================================================================
// Main
// =============================================================================

/// List the PDF bulletins of the input directory, sorted for determinism.
fn discover_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read input directory {}", dir.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
        })
        .collect();
    paths.sort();

    Ok(paths)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::try_parse().unwrap_or_else(|err| {
        let _ = err.print();
        std::process::exit(1);
    });

    println!("=== SapCana Quinzena Pipeline ===");
    println!("Input: {}", args.input_dir.display());
    println!("Output: {}", args.output_csv.display());
    println!("Mode: {}", if args.dry_run { "dry-run" } else { "live" });

    let pdf_paths = discover_pdfs(&args.input_dir)?;
    if pdf_paths.is_empty() {
        println!("No PDF files found in {}", args.input_dir.display());
        return Ok(());
    }
    println!("Found {} PDF file(s)\n", pdf_paths.len());

    // Extraction phase: per-document failures are isolated, the batch goes on.
    let mut records: Vec<QuinzenaRecord> = Vec::new();
    let mut extraction_skips = 0usize;

    for path in &pdf_paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        println!("Processing {name} ...");

        match extract_record(path) {
            Ok(record) => {
                println!(
                    "  ✓ {} | {} | {}",
                    record.safra,
                    record
                        .period
                        .as_ref()
                        .map(|p| p.code.as_str())
                        .unwrap_or("period missing"),
                    record.unit_alias
                );
                records.push(record);
            }
            Err(e) => {
                println!("  ✗ Skipping {name}: {e:#}");
                extraction_skips += 1;
            }
        }
    }

    if records.is_empty() {
        println!("\nNo valid records extracted. Check the input directory and the PDFs.");
        return Ok(());
    }

    // Consolidated export of every assembled record, persisted or not.
    write_csv(&args.output_csv, &records)?;
    println!(
        "\nConsolidated CSV with {} row(s) written to {}",
        records.len(),
        args.output_csv.display()
    );

    if args.dry_run {
        println!("Dry run - nothing saved to database");
        return Ok(());
    }

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    // All upserts of the batch share one transaction: a fact row is never
    // committed without its dimension rows.
    let mut tx = pool.begin().await?;
    let mut persisted = 0usize;
    let mut persistence_skips = 0usize;

    for record in &records {
        if record.safra.is_empty() || record.unit_alias.is_empty() {
            println!(
                "  ✗ Record for unit '{}' is missing mandatory keys. Skipping.",
                record.unit_alias
            );
            persistence_skips += 1;
            continue;
        }
        let Some(period) = &record.period else {
            println!(
                "  ✗ Record for unit '{}' has no decodable period. Skipping.",
                record.unit_alias
            );
            persistence_skips += 1;
            continue;
        };

        let period_id = upsert_period(&mut tx, &record.safra, period).await?;
        let unit_id = upsert_unit(&mut tx, record).await?;
        upsert_fact(&mut tx, period_id, unit_id, record).await?;
        persisted += 1;
    }

    tx.commit().await.context("Failed to commit batch")?;

    println!("\n=== Pipeline Complete ===");
    println!("Documents processed: {}", pdf_paths.len());
    println!("Documents skipped: {extraction_skips}");
    println!("Records persisted: {persisted}");
    println!("Records skipped at persistence: {persistence_skips}");

    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A representative bulletin after text extraction and whitespace
    /// normalization: header, then one block per product.
    const SAMPLE_DOC: &str = "\
Boletim de Produção Quinzenal
2025/2026Safra: Periodo de Lançamento: 2025/10-Quinz.02
Produtor: 13737 - JAPUNGU AGROINDUSTRIAL LTDA Matéria prima / Produto / Subproduto
Cana moída - Própria Tipo Lançamento Valor
Entrada t 1.234,50 Produção
Matéria prima / Produto / Subproduto
Cana moída - Terceiros Tipo Lançamento Valor
Entrada t 500,00 Produção
Matéria prima / Produto / Subproduto
Etanol - Anidro Tipo Lançamento Valor
Entrada m³ 2.000,00 Produção
Estoque físico do período atual m³ 750,00
Matéria prima / Produto / Subproduto
Etanol - Hidratado Tipo Lançamento Valor
Entrada m³ 1.500,00 Produção
Estoque físico do período atual m³ 250,50
Matéria prima / Produto / Subproduto
Açúcar - Cristal Tipo Lançamento Valor
Entrada t 300,00 Produção
Estoque físico do período atual t 120,00
Matéria prima / Produto / Subproduto
Açúcar - VHP Tipo Lançamento Valor
Entrada t 200,00 Produção
Estoque físico do período atual t 80,00
Matéria prima / Produto / Subproduto
Levedura seca Tipo Lançamento Valor
Entrada t 999,99 Produção
";

    // -------------------------------------------------------------------------
    // NUMBER PARSING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_decimal_br_thousands_and_comma() {
        assert_eq!(parse_decimal_br("1.234,50"), Some(1234.50));
    }

    #[test]
    fn test_parse_decimal_br_no_thousands() {
        assert_eq!(parse_decimal_br("500,00"), Some(500.0));
    }

    #[test]
    fn test_parse_decimal_br_integer() {
        assert_eq!(parse_decimal_br("42"), Some(42.0));
    }

    #[test]
    fn test_parse_decimal_br_large() {
        assert_eq!(parse_decimal_br("12.345.678,901"), Some(12345678.901));
    }

    #[test]
    fn test_parse_decimal_br_garbage() {
        assert_eq!(parse_decimal_br("abc"), None);
        assert_eq!(parse_decimal_br(""), None);
        assert_eq!(parse_decimal_br("1,2,3"), None);
    }

    // -------------------------------------------------------------------------
    // PERIOD DECODING TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_decode_period_first_quinzena_day_15() {
        let p = decode_period("2025/10-Quinz.01").unwrap();
        assert_eq!(p.code, "2025/10-Q1");
        assert_eq!(
            p.reference_date,
            NaiveDate::from_ymd_opt(2025, 10, 15).unwrap()
        );
    }

    #[test]
    fn test_decode_period_second_quinzena_month_end() {
        let p = decode_period("2025/10-Quinz.02").unwrap();
        assert_eq!(p.code, "2025/10-Q2");
        assert_eq!(
            p.reference_date,
            NaiveDate::from_ymd_opt(2025, 10, 31).unwrap()
        );
    }

    #[test]
    fn test_decode_period_leap_february() {
        let p = decode_period("2024/02-Quinz.02").unwrap();
        assert_eq!(
            p.reference_date,
            NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }

    #[test]
    fn test_decode_period_non_leap_february() {
        let p = decode_period("2025/02-Quinz.02").unwrap();
        assert_eq!(
            p.reference_date,
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
    }

    #[test]
    fn test_decode_period_december_year_boundary() {
        let p = decode_period("2025/12-Quinz.02").unwrap();
        assert_eq!(
            p.reference_date,
            NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()
        );
    }

    #[test]
    fn test_decode_period_first_quinzena_ignores_month_length() {
        // Day 15 regardless of how long the month is
        for month in 1..=12u32 {
            let p = decode_period(&format!("2025/{month:02}-Quinz.01")).unwrap();
            assert_eq!(p.reference_date.day(), 15);
        }
    }

    #[test]
    fn test_decode_period_description() {
        let p = decode_period("2025/10-Quinz.02").unwrap();
        assert_eq!(p.description, "2ª quinzena de 10/2025");
    }

    #[test]
    fn test_decode_period_malformed() {
        assert_eq!(decode_period(""), None);
        assert_eq!(decode_period("2025/10"), None);
        assert_eq!(decode_period("2025/10-Quinz.03"), None);
        assert_eq!(decode_period("25/10-Quinz.01"), None);
    }

    #[test]
    fn test_last_day_of_month() {
        assert_eq!(last_day_of_month(2025, 1), Some(31));
        assert_eq!(last_day_of_month(2025, 4), Some(30));
        assert_eq!(last_day_of_month(2024, 2), Some(29));
        assert_eq!(last_day_of_month(2100, 2), Some(28)); // century non-leap
        assert_eq!(last_day_of_month(2000, 2), Some(29)); // 400-year leap
    }

    // -------------------------------------------------------------------------
    // HEADER EXTRACTION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_header_full() {
        let h = parse_header(SAMPLE_DOC);
        assert_eq!(h.safra.as_deref(), Some("2025/2026"));
        assert_eq!(h.raw_period.as_deref(), Some("2025/10-Quinz.02"));
        assert_eq!(h.producer_code, Some(13737));
        assert_eq!(
            h.producer_name.as_deref(),
            Some("JAPUNGU AGROINDUSTRIAL LTDA")
        );
    }

    #[test]
    fn test_parse_header_missing_safra() {
        let h = parse_header("Periodo de Lançamento: 2025/10-Quinz.01\n");
        assert_eq!(h.safra, None);
        assert_eq!(h.raw_period.as_deref(), Some("2025/10-Quinz.01"));
    }

    #[test]
    fn test_parse_header_missing_producer() {
        let h = parse_header("2025/2026Safra:\n");
        assert_eq!(h.safra.as_deref(), Some("2025/2026"));
        assert_eq!(h.producer_code, None);
        assert_eq!(h.producer_name, None);
    }

    #[test]
    fn test_parse_header_empty_text() {
        assert_eq!(parse_header(""), HeaderInfo::default());
    }

    // -------------------------------------------------------------------------
    // PRODUCT CLASSIFICATION TESTS - closed category set
    // -------------------------------------------------------------------------

    #[test]
    fn test_classify_product_known_prefixes() {
        assert_eq!(
            classify_product("Cana moída - Própria"),
            ProductCategory::OwnCane
        );
        assert_eq!(
            classify_product("Cana moída - Terceiros"),
            ProductCategory::ThirdPartyCane
        );
        assert_eq!(
            classify_product("Etanol - Anidro"),
            ProductCategory::AnhydrousEthanol
        );
        assert_eq!(
            classify_product("Etanol - Hidratado"),
            ProductCategory::HydratedEthanol
        );
        assert_eq!(classify_product("Açúcar - Cristal"), ProductCategory::Sugar);
        assert_eq!(classify_product("Açúcar - VHP"), ProductCategory::Sugar);
        assert_eq!(classify_product("Açúcar - Demerara"), ProductCategory::Sugar);
    }

    #[test]
    fn test_classify_product_unknown_is_ignored() {
        assert_eq!(classify_product("Levedura seca"), ProductCategory::Ignored);
        assert_eq!(classify_product("Bagaço"), ProductCategory::Ignored);
        assert_eq!(classify_product(""), ProductCategory::Ignored);
    }

    // -------------------------------------------------------------------------
    // METRIC EXTRACTION TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_parse_metrics_sample_doc() {
        let m = parse_metrics(SAMPLE_DOC);
        assert_eq!(m.own_cane_t, 1234.50);
        assert_eq!(m.third_party_cane_t, 500.00);
        assert_eq!(m.anhydrous_prod_m3, 2000.00);
        assert_eq!(m.anhydrous_stock_m3, 750.00);
        assert_eq!(m.hydrated_prod_m3, 1500.00);
        assert_eq!(m.hydrated_stock_m3, 250.50);
    }

    #[test]
    fn test_parse_metrics_sugar_aggregates_subtypes() {
        let m = parse_metrics(SAMPLE_DOC);
        // Cristal + VHP, production and stock both additive
        assert_eq!(m.sugar_total_t, 500.00);
        assert_eq!(m.sugar_stock_t, 200.00);
    }

    #[test]
    fn test_parse_metrics_unknown_product_ignored() {
        // The "Levedura seca" block carries a value that must not leak into
        // any category.
        let m = parse_metrics(SAMPLE_DOC);
        let total = m.own_cane_t + m.third_party_cane_t + m.sugar_total_t;
        assert_eq!(total, 1234.50 + 500.00 + 500.00);
    }

    #[test]
    fn test_parse_metrics_ethanol_stock_is_snapshot() {
        // Two stock lines in one block: last writer wins, no accumulation.
        let text = "\
Matéria prima / Produto / Subproduto
Etanol - Anidro Tipo Lançamento Valor
Estoque físico do período atual m³ 100,00
Estoque físico do período atual m³ 300,00
";
        let m = parse_metrics(text);
        assert_eq!(m.anhydrous_stock_m3, 300.00);
    }

    #[test]
    fn test_parse_metrics_malformed_value_contributes_zero() {
        let text = "\
Matéria prima / Produto / Subproduto
Cana moída - Própria Tipo Lançamento Valor
Entrada t Produção
";
        let m = parse_metrics(text);
        assert_eq!(m.own_cane_t, 0.0);
    }

    #[test]
    fn test_parse_metrics_empty_text() {
        assert_eq!(parse_metrics(""), MetricBundle::default());
    }

    #[test]
    fn test_parse_metrics_block_without_entry_marker() {
        let text = "Matéria prima / Produto / Subproduto\nCana moída - Própria\n";
        assert_eq!(parse_metrics(text), MetricBundle::default());
    }

    // -------------------------------------------------------------------------
    // RECORD ASSEMBLY TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_assemble_record_end_to_end() {
        let r = assemble_record(SAMPLE_DOC).unwrap();
        assert_eq!(r.safra, "2025/2026");
        assert_eq!(r.unit_alias, "LTDA");
        assert_eq!(r.producer_code, Some(13737));
        assert_eq!(r.period.as_ref().unwrap().code, "2025/10-Q2");
        assert_eq!(r.metrics.own_cane_t, 1234.50);
        assert_eq!(r.metrics.third_party_cane_t, 500.00);
        assert_eq!(r.total_cane_t, 1734.50);
    }

    #[test]
    fn test_assemble_record_derived_totals_are_component_sums() {
        let r = assemble_record(SAMPLE_DOC).unwrap();
        assert_eq!(
            r.total_cane_t,
            r.metrics.own_cane_t + r.metrics.third_party_cane_t
        );
        assert_eq!(
            r.total_ethanol_m3,
            r.metrics.anhydrous_prod_m3 + r.metrics.hydrated_prod_m3
        );
        assert_eq!(
            r.total_ethanol_stock_m3,
            r.metrics.anhydrous_stock_m3 + r.metrics.hydrated_stock_m3
        );
    }

    #[test]
    fn test_assemble_record_missing_safra_fails() {
        let text = "Produtor: 1 - USINA TESTE Matéria prima / Produto / Subproduto\n";
        let err = assemble_record(text).unwrap_err();
        assert!(err.to_string().contains("Safra"));
    }

    #[test]
    fn test_assemble_record_missing_producer_fails() {
        let text = "2025/2026Safra: Periodo de Lançamento: 2025/10-Quinz.01\n";
        let err = assemble_record(text).unwrap_err();
        assert!(err.to_string().contains("Produtor"));
    }

    #[test]
    fn test_assemble_record_tolerates_missing_period() {
        let text = "\
2025/2026Safra:
Produtor: 42 - USINA SANTA CRUZ Matéria prima / Produto / Subproduto
Cana moída - Própria Tipo Lançamento Valor
Entrada t 100,00 Produção
";
        let r = assemble_record(text).unwrap();
        assert_eq!(r.period, None);
        assert_eq!(r.unit_alias, "CRUZ");
        assert_eq!(r.metrics.own_cane_t, 100.00);
    }

    #[test]
    fn test_unit_alias_last_token() {
        assert_eq!(
            unit_alias("JAPUNGU AGROINDUSTRIAL LTDA").as_deref(),
            Some("LTDA")
        );
        assert_eq!(unit_alias("USINA MONTE ALEGRE").as_deref(), Some("ALEGRE"));
        assert_eq!(unit_alias("  "), None);
    }

    #[test]
    fn test_normalize_whitespace_preserves_lines() {
        let text = "Entrada t\t 1.234,50   Produção\nnext  line";
        assert_eq!(
            normalize_whitespace(text),
            "Entrada t 1.234,50 Produção\nnext line"
        );
    }

    // -------------------------------------------------------------------------
    // CSV EXPORT TESTS
    // -------------------------------------------------------------------------

    #[test]
    fn test_decimal_comma_rendering() {
        assert_eq!(decimal_comma(1234.5), "1234,50");
        assert_eq!(decimal_comma(0.0), "0,00");
        assert_eq!(decimal_comma(1734.5), "1734,50");
    }

    #[test]
    fn test_csv_row_layout() {
        let r = assemble_record(SAMPLE_DOC).unwrap();
        let row = csv_row(&r);
        assert_eq!(row.len(), CSV_COLUMNS.len());
        assert_eq!(row[0], "2025/2026");
        assert_eq!(row[1], "2025/10-Q2");
        assert_eq!(row[3], "2025-10-31");
        assert_eq!(row[4], "LTDA");
        assert_eq!(row[5], "1234,50");
        assert_eq!(row[6], "500,00");
        assert_eq!(row[7], "1734,50");
        assert_eq!(row[8], "500,00");
        assert_eq!(row[9], "3500,00");
        assert_eq!(row[10], "200,00");
        assert_eq!(row[11], "1000,50");
    }

    #[test]
    fn test_csv_row_empty_period_fields() {
        let text = "\
2025/2026Safra:
Produtor: 42 - USINA SANTA CRUZ Matéria prima / Produto / Subproduto
";
        let row = csv_row(&assemble_record(text).unwrap());
        assert_eq!(row[1], "");
        assert_eq!(row[2], "");
        assert_eq!(row[3], "");
    }

    // -------------------------------------------------------------------------
    // BATCH ISOLATION TESTS - one bad document must not poison the batch
    // -------------------------------------------------------------------------

    #[test]
    fn test_batch_one_good_one_headerless() {
        let good = SAMPLE_DOC;
        let bad = "completely unrelated text with no labels at all";

        let results: Vec<_> = [good, bad].iter().map(|t| assemble_record(t)).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let skipped = results.iter().filter(|r| r.is_err()).count();
        assert_eq!(ok, 1);
        assert_eq!(skipped, 1);
    }
}
