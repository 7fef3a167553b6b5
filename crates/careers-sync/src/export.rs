//! Parquet snapshot of the ranked ledger plus a checksum manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use careers_core::{pageview_bucket, Career};
use careers_storage::CareerStore;
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub rows: usize,
    pub parquet_path: PathBuf,
    pub manifest_path: PathBuf,
}

pub async fn export_snapshot(store: &CareerStore, out_dir: &Path) -> Result<ExportSummary> {
    fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("creating {}", out_dir.display()))?;

    let careers = store.all_ranked().await.context("loading ranked careers")?;
    let parquet_path = out_dir.join("careers.parquet");
    write_careers_parquet(&parquet_path, &careers)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        generated_at: Utc::now(),
        files: vec![manifest_entry("careers", out_dir, &parquet_path, careers.len())?],
    };
    let manifest_path = out_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    info!(rows = careers.len(), path = %parquet_path.display(), "exported snapshot");
    Ok(ExportSummary {
        rows: careers.len(),
        parquet_path,
        manifest_path,
    })
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_careers_parquet(path: &Path, careers: &[Career]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("traffic_bucket", DataType::Utf8, true),
        ArrowField::new("pageview_daily_avg", DataType::Float64, true),
        ArrowField::new("pageview_total", DataType::Int64, true),
        ArrowField::new("pageview_days", DataType::Int64, true),
        ArrowField::new("resolved_title", DataType::Utf8, true),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("enrichment_status", DataType::Utf8, false),
        ArrowField::new("review_status", DataType::Utf8, false),
    ]));

    let ranks = UInt32Array::from((1..=careers.len() as u32).collect::<Vec<_>>());
    let ids = StringArray::from(careers.iter().map(|c| c.id.as_str()).collect::<Vec<_>>());
    let names = StringArray::from(careers.iter().map(|c| c.name.as_str()).collect::<Vec<_>>());
    let categories = StringArray::from(
        careers
            .iter()
            .map(|c| c.category.as_str())
            .collect::<Vec<_>>(),
    );
    let buckets = StringArray::from(
        careers
            .iter()
            .map(|c| c.pageview_daily_avg.map(|avg| pageview_bucket(avg).1))
            .collect::<Vec<_>>(),
    );
    let averages = Float64Array::from(
        careers
            .iter()
            .map(|c| c.pageview_daily_avg)
            .collect::<Vec<_>>(),
    );
    let totals = Int64Array::from(
        careers
            .iter()
            .map(|c| c.pageview_total)
            .collect::<Vec<_>>(),
    );
    let days = Int64Array::from(careers.iter().map(|c| c.pageview_days).collect::<Vec<_>>());
    let resolved = StringArray::from(
        careers
            .iter()
            .map(|c| c.resolved_title.as_deref())
            .collect::<Vec<_>>(),
    );
    let urls = StringArray::from(
        careers
            .iter()
            .map(|c| c.source_url.as_str())
            .collect::<Vec<_>>(),
    );
    let enrichment = StringArray::from(
        careers
            .iter()
            .map(|c| c.enrichment_status.as_str())
            .collect::<Vec<_>>(),
    );
    let review = StringArray::from(
        careers
            .iter()
            .map(|c| c.review_status.as_str())
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ranks),
            Arc::new(ids),
            Arc::new(names),
            Arc::new(categories),
            Arc::new(buckets),
            Arc::new(averages),
            Arc::new(totals),
            Arc::new(days),
            Arc::new(resolved),
            Arc::new(urls),
            Arc::new(enrichment),
            Arc::new(review),
        ],
    )
    .context("building careers record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, out_dir: &Path, path: &Path, rows: usize) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(out_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        rows,
        sha256,
        bytes: bytes.len() as u64,
    })
}
