//! Schema unification and conversion engine
//!
//! Turns extracted delimited parts into parquet shards and merges the
//! shards of a logical table into its final columnar artifact.
//!
//! The source files are latin-1, semicolon-delimited, and carry no header
//! row; the per-table column dictionary supplies names and types. Rows are
//! streamed in bounded batches so multi-gigabyte shards never materialize
//! in memory. Values are normalized on the way in: empty strings and the
//! literal `NULL`/`null` become nulls (never the text "None" or "NaN"),
//! compact `YYYYMMDD` dates become date columns, comma-decimal monetary
//! values become fixed-precision decimals, and `S`/`N` codes become
//! booleans.
//!
//! A malformed row (wrong column count, or an empty value in a key column)
//! is dropped and counted; a shard whose malformed rate exceeds the
//! configured threshold is excluded entirely. Duplicate rows are removed by
//! the registry key both within a shard and again across shards at merge
//! time, matching the upstream dataset's semantics.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, BooleanBuilder, Date32Builder, Decimal128Array, RecordBatch,
    StringArray, StringBuilder,
};
use arrow::compute::filter_record_batch;
use arrow::error::ArrowError;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, info, warn};

use crate::dictionary::{ColumnSpec, ColumnType, TableKind, MONEY_PRECISION, MONEY_SCALE};
use crate::error::{IngestError, Result};

/// Conversion tuning knobs, lifted from the pipeline configuration
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Rows accumulated before a record batch is flushed to the writer
    pub batch_size: usize,
    /// Fraction of malformed rows above which the shard is excluded
    pub malformed_row_threshold: f64,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            batch_size: 65_536,
            malformed_row_threshold: 0.05,
        }
    }
}

/// Outcome of converting one shard
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardStats {
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_malformed: u64,
    pub rows_deduped: u64,
}

/// Outcome of merging a table's shards into its artifact
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeStats {
    pub shards_merged: usize,
    pub rows_written: u64,
    pub rows_deduped: u64,
}

/// A parsed cell, ready for its column sink
enum Cell {
    Null,
    Text(String),
    Date(i32),
    Decimal(i128),
    Flag(bool),
}

/// Value could not be coerced to the column's declared type
struct BadValue;

/// Latin-1 maps bytes 0x00..=0xFF directly onto U+0000..=U+00FF
fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn is_null_text(value: &str) -> bool {
    value.is_empty() || value == "NULL" || value == "null"
}

fn parse_date(value: &str) -> std::result::Result<Cell, BadValue> {
    // The registry writes absent dates as 0 or 00000000
    if value.chars().all(|c| c == '0') {
        return Ok(Cell::Null);
    }
    let date = NaiveDate::parse_from_str(value, "%Y%m%d").map_err(|_| BadValue)?;
    let days = (date - NaiveDate::default()).num_days();
    Ok(Cell::Date(days as i32))
}

fn parse_money(value: &str) -> std::result::Result<Cell, BadValue> {
    let (int_part, frac_part) = match value.split_once(',') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    let negative = int_part.starts_with('-');
    let int_digits = int_part.trim_start_matches('-');
    if int_digits.is_empty() && frac_part.is_empty() {
        return Err(BadValue);
    }
    if !int_digits.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(BadValue);
    }

    let int_value: i128 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().map_err(|_| BadValue)?
    };
    let cents: i128 = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i128>().map_err(|_| BadValue)? * 10,
        _ => frac_part[..2].parse().map_err(|_| BadValue)?,
    };

    let scaled = int_value * 100 + cents;
    // Must fit the artifact's declared precision
    if scaled >= 10i128.pow(MONEY_PRECISION as u32) {
        return Err(BadValue);
    }
    Ok(Cell::Decimal(if negative { -scaled } else { scaled }))
}

fn parse_flag(value: &str) -> std::result::Result<Cell, BadValue> {
    match value {
        "S" | "s" => Ok(Cell::Flag(true)),
        "N" | "n" => Ok(Cell::Flag(false)),
        _ => Err(BadValue),
    }
}

/// Coerce one raw field to its dictionary type.
///
/// Unparseable values in nullable columns degrade to null; an empty value
/// in a non-nullable (key) column rejects the whole row.
fn parse_field(spec: &ColumnSpec, raw: &[u8]) -> std::result::Result<Cell, BadValue> {
    let text = latin1_to_string(raw);
    let text = text.trim();

    if is_null_text(text) {
        return if spec.nullable { Ok(Cell::Null) } else { Err(BadValue) };
    }

    let parsed = match spec.ty {
        ColumnType::Text => Ok(Cell::Text(text.to_string())),
        ColumnType::Date => parse_date(text),
        ColumnType::Decimal => parse_money(text),
        ColumnType::Flag => parse_flag(text),
    };

    match parsed {
        Ok(cell) => Ok(cell),
        Err(BadValue) if spec.nullable => Ok(Cell::Null),
        Err(BadValue) => Err(BadValue),
    }
}

fn parse_row(
    columns: &[ColumnSpec],
    record: &csv::ByteRecord,
) -> std::result::Result<Vec<Cell>, BadValue> {
    if record.len() != columns.len() {
        return Err(BadValue);
    }
    columns
        .iter()
        .zip(record.iter())
        .map(|(spec, raw)| parse_field(spec, raw))
        .collect()
}

/// Row identity for duplicate removal; key cells are guaranteed text
fn row_key(kind: TableKind, cells: &[Cell]) -> String {
    let mut key = String::new();
    for &idx in kind.key_columns() {
        if !key.is_empty() {
            key.push('|');
        }
        if let Cell::Text(value) = &cells[idx] {
            key.push_str(value);
        }
    }
    key
}

/// Per-column accumulation into arrow arrays
enum ColumnSink {
    Text(StringBuilder),
    Date(Date32Builder),
    Decimal(Vec<Option<i128>>),
    Flag(BooleanBuilder),
}

impl ColumnSink {
    fn for_spec(spec: &ColumnSpec) -> Self {
        match spec.ty {
            ColumnType::Text => ColumnSink::Text(StringBuilder::new()),
            ColumnType::Date => ColumnSink::Date(Date32Builder::new()),
            ColumnType::Decimal => ColumnSink::Decimal(Vec::new()),
            ColumnType::Flag => ColumnSink::Flag(BooleanBuilder::new()),
        }
    }

    fn append(&mut self, cell: Cell) {
        match (self, cell) {
            (ColumnSink::Text(b), Cell::Text(v)) => b.append_value(v),
            (ColumnSink::Text(b), _) => b.append_null(),
            (ColumnSink::Date(b), Cell::Date(v)) => b.append_value(v),
            (ColumnSink::Date(b), _) => b.append_null(),
            (ColumnSink::Decimal(v), Cell::Decimal(value)) => v.push(Some(value)),
            (ColumnSink::Decimal(v), _) => v.push(None),
            (ColumnSink::Flag(b), Cell::Flag(v)) => b.append_value(v),
            (ColumnSink::Flag(b), _) => b.append_null(),
        }
    }

    fn finish(self) -> Result<ArrayRef> {
        Ok(match self {
            ColumnSink::Text(mut b) => Arc::new(b.finish()),
            ColumnSink::Date(mut b) => Arc::new(b.finish()),
            ColumnSink::Decimal(values) => Arc::new(
                Decimal128Array::from(values)
                    .with_precision_and_scale(MONEY_PRECISION, MONEY_SCALE)?,
            ),
            ColumnSink::Flag(mut b) => Arc::new(b.finish()),
        })
    }
}

fn make_sinks(columns: &[ColumnSpec]) -> Vec<ColumnSink> {
    columns.iter().map(ColumnSink::for_spec).collect()
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

/// Convert one extracted part into a staged parquet shard at `staged_path`.
///
/// Streams the part in batches of `opts.batch_size` rows and stages the
/// output through a `.tmp` sibling, so an interrupted conversion never
/// leaves a partial shard at a path the merge step trusts.
pub fn convert_part(
    kind: TableKind,
    part_path: &Path,
    staged_path: &Path,
    opts: &ConvertOptions,
) -> Result<ShardStats> {
    let shard_name = part_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| part_path.display().to_string());

    let schema = kind.arrow_schema();
    let columns = kind.columns();

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_reader(BufReader::new(File::open(part_path)?));

    if let Some(parent) = staged_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = staged_path.with_extension("parquet.tmp");
    let mut writer = ArrowWriter::try_new(
        File::create(&tmp_path)?,
        schema.clone(),
        Some(writer_properties()),
    )?;

    let mut stats = ShardStats::default();
    let mut sinks = make_sinks(columns);
    let mut pending = 0usize;
    let mut seen: HashSet<String> = HashSet::new();
    let mut record = csv::ByteRecord::new();

    while reader.read_byte_record(&mut record)? {
        stats.rows_read += 1;

        let Ok(cells) = parse_row(columns, &record) else {
            stats.rows_malformed += 1;
            continue;
        };

        if !seen.insert(row_key(kind, &cells)) {
            stats.rows_deduped += 1;
            continue;
        }

        for (sink, cell) in sinks.iter_mut().zip(cells) {
            sink.append(cell);
        }
        pending += 1;
        stats.rows_written += 1;

        if pending == opts.batch_size {
            flush_batch(&mut writer, &schema, std::mem::replace(&mut sinks, make_sinks(columns)))?;
            pending = 0;
        }
    }

    if pending > 0 {
        flush_batch(&mut writer, &schema, sinks)?;
    }

    let malformed_rate = stats.rows_malformed as f64 / stats.rows_read.max(1) as f64;
    if stats.rows_read > 0 && malformed_rate > opts.malformed_row_threshold {
        drop(writer);
        std::fs::remove_file(&tmp_path)?;
        return Err(IngestError::ConversionFailed {
            shard: shard_name,
            reason: format!(
                "{:.1}% malformed rows ({} of {}) exceeds threshold of {:.1}%",
                malformed_rate * 100.0,
                stats.rows_malformed,
                stats.rows_read,
                opts.malformed_row_threshold * 100.0
            ),
        });
    }

    writer.close()?;
    std::fs::rename(&tmp_path, staged_path)?;

    if stats.rows_malformed > 0 {
        warn!(
            table = %kind,
            shard = %shard_name,
            dropped = stats.rows_malformed,
            "dropped malformed rows"
        );
    }
    info!(
        table = %kind,
        shard = %shard_name,
        rows = stats.rows_written,
        deduped = stats.rows_deduped,
        "shard converted"
    );

    Ok(stats)
}

fn flush_batch(
    writer: &mut ArrowWriter<File>,
    schema: &arrow::datatypes::SchemaRef,
    sinks: Vec<ColumnSink>,
) -> Result<()> {
    let arrays: Vec<ArrayRef> = sinks
        .into_iter()
        .map(ColumnSink::finish)
        .collect::<Result<_>>()?;
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    writer.write(&batch)?;
    Ok(())
}

/// Streaming union of a table's staged shards into `dest_path`.
///
/// Shard order does not affect the resulting row set: rows are
/// deduplicated by the registry key across all shards, so the output is a
/// set union. The caller atomically promotes `dest_path` into the table
/// store afterwards.
pub fn merge_shards(kind: TableKind, staged: &[PathBuf], dest_path: &Path) -> Result<MergeStats> {
    let schema = kind.arrow_schema();

    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = ArrowWriter::try_new(
        File::create(dest_path)?,
        schema.clone(),
        Some(writer_properties()),
    )?;

    let mut stats = MergeStats::default();
    let mut seen: HashSet<String> = HashSet::new();

    for shard_path in staged {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(shard_path)?)?
            .with_batch_size(8_192)
            .build()?;

        for batch in reader {
            let batch = batch?;
            let mask = fresh_row_mask(kind, &batch, &mut seen)?;
            let filtered = filter_record_batch(&batch, &mask)?;

            stats.rows_deduped += (batch.num_rows() - filtered.num_rows()) as u64;
            stats.rows_written += filtered.num_rows() as u64;
            if filtered.num_rows() > 0 {
                writer.write(&filtered)?;
            }
        }

        stats.shards_merged += 1;
        debug!(table = %kind, shard = %shard_path.display(), "shard merged");
    }

    writer.close()?;

    info!(
        table = %kind,
        shards = stats.shards_merged,
        rows = stats.rows_written,
        deduped = stats.rows_deduped,
        "table assembled"
    );

    Ok(stats)
}

/// True for rows whose key has not been seen in any earlier shard or batch
fn fresh_row_mask(
    kind: TableKind,
    batch: &RecordBatch,
    seen: &mut HashSet<String>,
) -> Result<BooleanArray> {
    let key_columns: Vec<&StringArray> = kind
        .key_columns()
        .iter()
        .map(|&idx| {
            batch
                .column(idx)
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    ArrowError::SchemaError(format!(
                        "key column {} of {} is not a string column",
                        idx, kind
                    ))
                })
        })
        .collect::<std::result::Result<_, _>>()?;

    let mask: BooleanArray = (0..batch.num_rows())
        .map(|row| {
            let key = key_columns
                .iter()
                .map(|col| col.value(row))
                .collect::<Vec<_>>()
                .join("|");
            Some(seen.insert(key))
        })
        .collect();

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, BooleanArray as BA, Date32Array};
    use tempfile::TempDir;

    fn read_batches(path: &Path) -> Vec<RecordBatch> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(path).unwrap())
            .unwrap()
            .build()
            .unwrap();
        reader.map(|b| b.unwrap()).collect()
    }

    fn convert(
        kind: TableKind,
        content: &[u8],
        opts: &ConvertOptions,
    ) -> (TempDir, Result<ShardStats>, PathBuf) {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("PART");
        std::fs::write(&part, content).unwrap();
        let staged = dir.path().join("staged.parquet");
        let result = convert_part(kind, &part, &staged, opts);
        (dir, result, staged)
    }

    #[test]
    fn converts_companies_with_typed_columns() {
        // Second row carries a latin-1 'Ç' (0xC7) and an explicit NULL
        let content: &[u8] = b"\
11111111;ALFA COMERCIO LTDA;2062;49;000000001000,00;05;\n\
22222222;A\xC7OS BETA SA;2046;49;123456,78;03;NULL\n";

        let (_dir, result, staged) =
            convert(TableKind::Companies, content, &ConvertOptions::default());
        let stats = result.unwrap();
        assert_eq!(stats.rows_read, 2);
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.rows_malformed, 0);

        let batches = read_batches(&staged);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.num_columns(), 7);

        let razao = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(razao.value(1), "AÇOS BETA SA");

        let capital = batch
            .column(4)
            .as_any()
            .downcast_ref::<Decimal128Array>()
            .unwrap();
        assert_eq!(capital.precision(), MONEY_PRECISION);
        assert_eq!(capital.scale(), MONEY_SCALE);
        assert_eq!(capital.value(0), 100_000); // 1000,00 in cents
        assert_eq!(capital.value(1), 12_345_678);

        // "" and "NULL" are nulls, never literal text
        let ente = batch
            .column(6)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert!(ente.is_null(0));
        assert!(ente.is_null(1));
    }

    #[test]
    fn converts_dates_and_flags() {
        let content: &[u8] = b"\
11111111;S;20070701;00000000;N;0;20191231\n\
22222222;N;0;0;S;20150101;\n";

        let (_dir, result, staged) =
            convert(TableKind::SimpleNational, content, &ConvertOptions::default());
        result.unwrap();

        let batch = &read_batches(&staged)[0];

        let opcao_simples = batch.column(1).as_any().downcast_ref::<BA>().unwrap();
        assert!(opcao_simples.value(0));
        assert!(!opcao_simples.value(1));

        let data_opcao = batch
            .column(2)
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        let expected = (NaiveDate::from_ymd_opt(2007, 7, 1).unwrap() - NaiveDate::default())
            .num_days() as i32;
        assert_eq!(data_opcao.value(0), expected);
        assert!(data_opcao.is_null(1)); // "0" date is null

        let data_exclusao = batch
            .column(3)
            .as_any()
            .downcast_ref::<Date32Array>()
            .unwrap();
        assert!(data_exclusao.is_null(0)); // "00000000" date is null
    }

    #[test]
    fn unparseable_nullable_values_degrade_to_null() {
        // Garbage date and flag in nullable columns must not drop the row
        let content: &[u8] = b"11111111;X;banana;0;S;0;0\n";

        let (_dir, result, staged) =
            convert(TableKind::SimpleNational, content, &ConvertOptions::default());
        let stats = result.unwrap();
        assert_eq!(stats.rows_written, 1);
        assert_eq!(stats.rows_malformed, 0);

        let batch = &read_batches(&staged)[0];
        assert!(batch.column(1).is_null(0));
        assert!(batch.column(2).is_null(0));
    }

    #[test]
    fn malformed_rows_below_threshold_are_dropped() {
        // Row 2 has the wrong column count; row 3 has an empty key
        let content: &[u8] = b"\
001;Alpha\n\
002;Beta;extra\n\
;Gamma\n\
004;Delta\n";

        let opts = ConvertOptions {
            malformed_row_threshold: 0.6,
            ..Default::default()
        };
        let (_dir, result, staged) = convert(TableKind::EconomicActivities, content, &opts);
        let stats = result.unwrap();

        assert_eq!(stats.rows_read, 4);
        assert_eq!(stats.rows_malformed, 2);
        assert_eq!(stats.rows_written, 2);

        let batch = &read_batches(&staged)[0];
        let codigo = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(codigo.value(0), "001");
        assert_eq!(codigo.value(1), "004");
    }

    #[test]
    fn shard_above_threshold_is_excluded() {
        let content: &[u8] = b"\
001;Alpha\n\
bad;row;extra\n\
another;bad;row\n";

        let opts = ConvertOptions {
            malformed_row_threshold: 0.5,
            ..Default::default()
        };
        let (_dir, result, staged) = convert(TableKind::EconomicActivities, content, &opts);

        let err = result.unwrap_err();
        assert!(matches!(err, IngestError::ConversionFailed { .. }));
        // Neither the shard nor its temp file survives
        assert!(!staged.exists());
        assert!(!staged.with_extension("parquet.tmp").exists());
    }

    #[test]
    fn duplicate_keys_within_shard_are_removed() {
        let content: &[u8] = b"\
001;Alpha\n\
001;Alpha again\n\
002;Beta\n";

        let (_dir, result, staged) = convert(
            TableKind::EconomicActivities,
            content,
            &ConvertOptions::default(),
        );
        let stats = result.unwrap();
        assert_eq!(stats.rows_written, 2);
        assert_eq!(stats.rows_deduped, 1);

        let batch = &read_batches(&staged)[0];
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn small_batch_size_produces_multiple_batches() {
        let content: &[u8] = b"001;A\n002;B\n003;C\n";
        let opts = ConvertOptions {
            batch_size: 2,
            ..Default::default()
        };
        let (_dir, result, staged) = convert(TableKind::Municipalities, content, &opts);
        assert_eq!(result.unwrap().rows_written, 3);

        let total: usize = read_batches(&staged).iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn merge_unions_shards_and_dedups_across_them() {
        let dir = TempDir::new().unwrap();
        let opts = ConvertOptions::default();

        let part_a = dir.path().join("A");
        std::fs::write(&part_a, b"001;Alpha\n002;Beta\n").unwrap();
        let shard_a = dir.path().join("a.parquet");
        convert_part(TableKind::EconomicActivities, &part_a, &shard_a, &opts).unwrap();

        let part_b = dir.path().join("B");
        std::fs::write(&part_b, b"002;Beta duplicate\n003;Gamma\n").unwrap();
        let shard_b = dir.path().join("b.parquet");
        convert_part(TableKind::EconomicActivities, &part_b, &shard_b, &opts).unwrap();

        let dest = dir.path().join("cnaes.parquet");
        let stats = merge_shards(
            TableKind::EconomicActivities,
            &[shard_a, shard_b],
            &dest,
        )
        .unwrap();

        assert_eq!(stats.shards_merged, 2);
        assert_eq!(stats.rows_written, 3);
        assert_eq!(stats.rows_deduped, 1);

        let rows: usize = read_batches(&dest).iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);
    }

    #[test]
    fn merge_of_empty_shard_list_writes_empty_artifact() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("paises.parquet");
        let stats = merge_shards(TableKind::Countries, &[], &dest).unwrap();
        assert_eq!(stats.rows_written, 0);

        let batches = read_batches(&dest);
        assert!(batches.iter().all(|b| b.num_rows() == 0));
    }

    #[test]
    fn money_parser_handles_registry_formats() {
        assert!(matches!(parse_money("0,00"), Ok(Cell::Decimal(0))));
        assert!(matches!(
            parse_money("000000001000,00"),
            Ok(Cell::Decimal(100_000))
        ));
        assert!(matches!(parse_money("5"), Ok(Cell::Decimal(500))));
        assert!(matches!(parse_money("12,5"), Ok(Cell::Decimal(1_250))));
        assert!(parse_money("abc").is_err());
        assert!(parse_money("1.000,00").is_err());
    }
}
