use std::path::PathBuf;

use anyhow::{Context, Result};
use careers_core::{pageview_bucket, Career, EnrichmentStatus, ReviewStatus};
use careers_storage::CareerStore;
use careers_sync::{CareerPipeline, PipelineConfig, RunSummary};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "careers")]
#[command(about = "Discover occupations and rank them by article traffic")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Discover careers, persist them and enrich pending ones with pageviews
    #[command(alias = "fetch")]
    DiscoverAndEnrich {
        /// Cap on newly discovered and enriched careers, for test runs
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Re-enrich every career that is not complete
    Resume,
    /// Ledger counts and the most viewed career
    Stats,
    /// Careers ranked by average daily views
    Top {
        #[arg(default_value_t = 20)]
        n: usize,
    },
    /// Find careers by name
    Search {
        term: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Careers in one review or enrichment status, grouped by traffic bucket
    #[command(group(ArgGroup::new("status").required(true).args(["review", "enrichment"])))]
    List {
        /// unreviewed, needs_attention, resolved or not_applicable
        #[arg(long)]
        review: Option<ReviewStatus>,
        /// pending, in_progress, complete or failed
        #[arg(long)]
        enrichment: Option<EnrichmentStatus>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Write a Parquet snapshot of the ranked ledger and its manifest
    Export {
        #[arg(long, default_value = "snapshots")]
        out: PathBuf,
    },
    /// Regenerate the taxonomy allow-list from the Wikidata class hierarchy
    RefreshTaxonomy {
        /// Defaults to CAREERS_TAXONOMY_PATH
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "careers=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;

    match cli.command {
        Commands::DiscoverAndEnrich { limit } => {
            let pipeline = CareerPipeline::from_config(config).await?;
            let summary = pipeline.discover_and_enrich(limit).await?;
            print_run(&summary);
            pipeline.store().close().await;
        }
        Commands::Resume => {
            let pipeline = CareerPipeline::from_config(config).await?;
            let summary = pipeline.resume().await?;
            print_run(&summary);
            pipeline.store().close().await;
        }
        Commands::Stats => {
            let store = open_store(&config).await?;
            print_stats(&store).await?;
            store.close().await;
        }
        Commands::Top { n } => {
            let store = open_store(&config).await?;
            let careers = store.top(n).await.context("loading ranked careers")?;
            print_ranked(&careers);
            store.close().await;
        }
        Commands::Search { term, limit } => {
            let store = open_store(&config).await?;
            let careers = store.search(&term, limit).await.context("searching careers")?;
            if careers.is_empty() {
                println!("no careers match `{term}`");
            }
            print_ranked(&careers);
            store.close().await;
        }
        Commands::List {
            review,
            enrichment,
            limit,
        } => {
            let store = open_store(&config).await?;
            let careers = match (review, enrichment) {
                (Some(status), _) => store.by_review_status(status, limit).await,
                (None, Some(status)) => store.by_enrichment_status(status, limit).await,
                (None, None) => Ok(Vec::new()),
            }
            .context("listing careers by status")?;
            if careers.is_empty() {
                println!("no careers in that status");
            }
            print_ranked(&careers);
            store.close().await;
        }
        Commands::RefreshTaxonomy { out } => {
            let out = out.unwrap_or_else(|| config.taxonomy_path.clone());
            let summary = careers_sync::refresh_taxonomy_file(&config, &out).await?;
            println!(
                "taxonomy written: {} classes ({} base, {} generated) to {}",
                summary.classes,
                summary.stats.base_classes,
                summary.stats.generated,
                summary.path.display()
            );
        }
        Commands::Export { out } => {
            let store = open_store(&config).await?;
            let summary = careers_sync::export_snapshot(&store, &out).await?;
            println!(
                "export complete: rows={} parquet={} manifest={}",
                summary.rows,
                summary.parquet_path.display(),
                summary.manifest_path.display()
            );
            store.close().await;
        }
    }

    Ok(())
}

/// Reporting commands never create or migrate the ledger.
async fn open_store(config: &PipelineConfig) -> Result<CareerStore> {
    info!(database_url = %config.database_url, "opening career store read-only");
    CareerStore::connect_read_only(&config.database_url)
        .await
        .with_context(|| {
            format!(
                "opening career store {} (run `careers discover-and-enrich` to create it)",
                config.database_url
            )
        })
}

fn print_run(summary: &RunSummary) {
    println!("run {} ({:?})", summary.run_id, summary.mode);
    if let Some(discovery) = &summary.discovery {
        println!(
            "  discovery: {} entities, {} accepted, {} rejected, {} unlabeled",
            discovery.candidate_entities,
            discovery.accepted,
            discovery.rejected_unlisted,
            discovery.skipped_unlabeled
        );
        println!(
            "  ledger: {} new, {} updated, {} unchanged",
            summary.upsert.inserted, summary.upsert.updated, summary.upsert.unchanged
        );
    }
    if let Some(err) = &summary.discovery_error {
        println!("  discovery failed: {err}");
    }
    if summary.stale_reset > 0 || summary.requeued > 0 {
        println!(
            "  requeued: {} interrupted, {} failed",
            summary.stale_reset, summary.requeued
        );
    }
    let e = &summary.enrichment;
    println!(
        "  enrichment: {} claimed, {} complete, {} failed, {} via redirect",
        e.claimed, e.completed, e.failed, e.redirected
    );
    if e.failed > 0 {
        println!("  run `careers resume` to retry failed careers");
    }
}

async fn print_stats(store: &CareerStore) -> Result<()> {
    let stats = store.stats().await.context("reading ledger stats")?;
    println!("careers:        {}", stats.total_careers);
    println!("with pageviews: {}", stats.with_pageviews);
    println!("total views:    {}", stats.total_views);
    println!("enrichment:");
    for status in EnrichmentStatus::ALL {
        println!("  {:<12} {}", status.as_str(), stats.count_for(status));
    }
    println!("category:");
    for (category, count) in &stats.by_category {
        println!("  {:<12} {}", category.as_str(), count);
    }
    println!("review:");
    for (status, count) in &stats.by_review_status {
        println!("  {:<16} {}", status.as_str(), count);
    }
    if let Some((name, avg)) = &stats.top_career {
        println!("top career: {name} ({avg:.1} views/day)");
    }
    Ok(())
}

fn print_ranked(careers: &[Career]) {
    for (rank, career) in careers.iter().enumerate() {
        let (avg, bucket) = match career.pageview_daily_avg {
            Some(avg) => (format!("{avg:>10.1}"), pageview_bucket(avg).1),
            None => (format!("{:>10}", "-"), "unranked"),
        };
        println!(
            "{:>4}. {:<40} {:<10} {} {}",
            rank + 1,
            career.name,
            career.category.as_str(),
            avg,
            bucket
        );
    }
}
