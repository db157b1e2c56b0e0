//! Scrape-and-merge pipeline: listing source → normalizer → history merge → reports.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{BooleanArray, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use jobwatch_adapters::{
    FixtureListingSource, ItJobsConfig, ItJobsSource, ListingSource, ScrapeBatch, ScrapeContext,
    ITJOBS_SOURCE_ID,
};
use jobwatch_core::{
    merge_with_stats, sort_newest_first, JobPosting, MergeStats, Normalizer, PORTUGUESE_MONTHS,
};
use jobwatch_storage::{
    ArtifactStore, BackoffPolicy, HistoryStore, HttpClientConfig, HttpFetcher, DATASET_COLUMNS,
};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0 Safari/537.36"
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceMode {
    Live,
    Fixture,
}

impl SourceMode {
    fn from_env_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("fixture") {
            SourceMode::Fixture
        } else {
            SourceMode::Live
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dataset_path: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: Option<PathBuf>,
    pub source_mode: SourceMode,
    pub fixture_dir: PathBuf,
    pub query: String,
    pub max_pages: u32,
    pub page_delay_ms: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub allow_empty_batch: bool,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = ItJobsConfig::default();
        Self {
            dataset_path: std::env::var("JOBWATCH_DATASET_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./itjobs_data_analyst.csv")),
            reports_dir: std::env::var("JOBWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            artifacts_dir: std::env::var("JOBWATCH_ARTIFACTS_DIR").ok().map(PathBuf::from),
            source_mode: std::env::var("JOBWATCH_SOURCE_MODE")
                .map(|v| SourceMode::from_env_value(&v))
                .unwrap_or(SourceMode::Live),
            fixture_dir: std::env::var("JOBWATCH_FIXTURE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./fixtures/itjobs")),
            query: std::env::var("JOBWATCH_QUERY").unwrap_or(defaults.query),
            max_pages: env_parse("JOBWATCH_MAX_PAGES", defaults.max_pages),
            page_delay_ms: env_parse(
                "JOBWATCH_PAGE_DELAY_MS",
                defaults.page_delay.as_millis() as u64,
            ),
            user_agent: std::env::var("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_parse("JOBWATCH_HTTP_TIMEOUT_SECS", 20),
            allow_empty_batch: env_flag("JOBWATCH_ALLOW_EMPTY_BATCH"),
            scheduler_enabled: env_flag("JOBWATCH_SCHEDULER_ENABLED"),
            sync_cron_1: std::env::var("SYNC_CRON_1")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2")
                .unwrap_or_else(|_| "0 0 18 * * *".to_string()),
        }
    }

    fn itjobs_config(&self) -> ItJobsConfig {
        ItJobsConfig {
            query: self.query.clone(),
            max_pages: self.max_pages,
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Merged,
    SkippedEmptyBatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub scraped_pages: usize,
    pub raw_listings: usize,
    pub normalized: usize,
    pub rejected: usize,
    pub unknown_dates: usize,
    pub merge: Option<MergeStats>,
    pub dataset_rows: usize,
    pub dataset_path: String,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: HistoryStore,
    artifact_store: Option<ArtifactStore>,
    source: Box<dyn ListingSource>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let source: Box<dyn ListingSource> = match config.source_mode {
            SourceMode::Fixture => Box::new(FixtureListingSource::new(config.fixture_dir.clone())),
            SourceMode::Live => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    backoff: BackoffPolicy::default(),
                })?;
                Box::new(ItJobsSource::new(http, config.itjobs_config()))
            }
        };
        Self::with_source(config, source)
    }

    pub fn with_source(config: SyncConfig, source: Box<dyn ListingSource>) -> Result<Self> {
        PORTUGUESE_MONTHS
            .validate()
            .context("validating month table")?;
        Ok(Self {
            store: HistoryStore::new(config.dataset_path.clone()),
            artifact_store: config.artifacts_dir.clone().map(ArtifactStore::new),
            config,
            source,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One scrape-and-merge run. A failed scrape returns an error before the history is read.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let ctx = ScrapeContext::new();
        let source_id = self.source.source_id();
        info!(run_id = %ctx.run_id, source_id, "sync run started");

        let batch = self
            .source
            .fetch_listings(&ctx)
            .await
            .with_context(|| format!("scraping {source_id}; history left untouched"))?;
        self.archive_pages(&batch).await?;

        let normalizer = Normalizer::itjobs(ctx.started_at.date_naive())?;
        let normalized = normalizer.normalize_batch(&batch.listings);
        for rejected in &normalized.rejected {
            warn!(run_id = %ctx.run_id, %rejected, "listing skipped");
        }
        if normalized.unknown_dates > 0 {
            warn!(
                run_id = %ctx.run_id,
                unknown_dates = normalized.unknown_dates,
                "listings kept with unknown date"
            );
        }
        let mut fresh = normalized.postings;
        sort_newest_first(&mut fresh);
        let normalized_count = fresh.len();

        let history = self.store.load().await.context("loading history")?;

        let (status, merge, dataset) = if fresh.is_empty() && !self.config.allow_empty_batch {
            warn!(
                run_id = %ctx.run_id,
                history_rows = history.len(),
                "scrape returned no postings; not merging so history stays as it was"
            );
            (RunStatus::SkippedEmptyBatch, None, history)
        } else {
            let outcome = merge_with_stats(history, fresh);
            self.store
                .save(outcome.postings.clone())
                .await
                .context("saving history")?;
            info!(
                run_id = %ctx.run_id,
                added = outcome.stats.added,
                reactivated = outcome.stats.reactivated,
                deactivated = outcome.stats.deactivated,
                total = outcome.stats.total,
                "history merged"
            );
            (RunStatus::Merged, Some(outcome.stats), outcome.postings)
        };

        let reports_dir = self.config.reports_dir.join(ctx.run_id.to_string());
        let mut summary = SyncRunSummary {
            run_id: ctx.run_id,
            source_id: source_id.to_string(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            status,
            scraped_pages: batch.pages.len(),
            raw_listings: batch.listings.len(),
            normalized: normalized_count,
            rejected: normalized.rejected.len(),
            unknown_dates: normalized.unknown_dates,
            merge,
            dataset_rows: dataset.len(),
            dataset_path: self.store.path().display().to_string(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: String::new(),
        };

        let manifest_path = export_parquet_snapshot(&reports_dir, &dataset).await?;
        summary.parquet_manifest = manifest_path.display().to_string();
        write_reports(&reports_dir, &summary).await?;

        Ok(summary)
    }

    /// Like [`run_once`](Self::run_once), but skips instead of overlapping a run in progress.
    pub async fn run_exclusive(&self) -> Result<Option<SyncRunSummary>> {
        let Ok(_guard) = self.run_lock.try_lock() else {
            warn!("previous sync run still in progress; skipping this trigger");
            return Ok(None);
        };
        self.run_once().await.map(Some)
    }

    async fn archive_pages(&self, batch: &ScrapeBatch) -> Result<()> {
        let Some(store) = &self.artifact_store else {
            return Ok(());
        };
        for page in &batch.pages {
            let stored = store
                .store_bytes(page.fetched_at, ITJOBS_SOURCE_ID, "html", page.body.as_bytes())
                .await
                .with_context(|| format!("archiving {}", page.url))?;
            if !stored.deduplicated {
                info!(url = %page.url, path = %stored.relative_path.display(), "archived page");
            }
        }
        Ok(())
    }
}

/// Registers both cron triggers when the scheduler is enabled. Overlapping triggers are skipped.
pub async fn maybe_build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let crons = [
        pipeline.config.sync_cron_1.clone(),
        pipeline.config.sync_cron_2.clone(),
    ];
    for cron in crons {
        let job_pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&job_pipeline);
            Box::pin(async move {
                match pipeline.run_exclusive().await {
                    Ok(Some(summary)) => info!(
                        run_id = %summary.run_id,
                        status = ?summary.status,
                        rows = summary.dataset_rows,
                        "scheduled sync finished"
                    ),
                    Ok(None) => {}
                    Err(err) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled sync");
    }
    Ok(Some(sched))
}

pub async fn run_scheduler_until_ctrl_c(pipeline: Arc<SyncPipeline>) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(pipeline).await? else {
        bail!("scheduler is disabled (set JOBWATCH_SCHEDULER_ENABLED=1)");
    };
    sched.start().await.context("starting scheduler")?;
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_once().await
}

async fn write_reports(reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let merge_lines = match &summary.merge {
        Some(stats) => format!(
            "- New postings: {}\n- Reactivated: {}\n- Deactivated: {}\n- Still active: {}\n",
            stats.added, stats.reactivated, stats.deactivated, stats.still_active
        ),
        None => "- Merge skipped: scrape returned no postings\n".to_string(),
    };
    let brief = format!(
        concat!(
            "# Jobwatch Daily Brief\n\n",
            "- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n",
            "- Pages read: {}\n- Listings scraped: {}\n- Listings skipped: {}\n",
            "- Unknown dates: {}\n\n## History\n{}- Rows in dataset: {}\n",
        ),
        summary.run_id,
        summary.source_id,
        summary.started_at,
        summary.finished_at,
        summary.scraped_pages,
        summary.raw_listings,
        summary.rejected,
        summary.unknown_dates,
        merge_lines,
        summary.dataset_rows,
    );
    fs::write(reports_dir.join("daily_brief.md"), brief)
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    Ok(())
}

async fn export_parquet_snapshot(reports_dir: &Path, postings: &[JobPosting]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let postings_path = snapshot_dir.join("postings.parquet");
    write_postings_parquet(&postings_path, postings)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![manifest_entry("postings", reports_dir, &postings_path)?],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_postings_parquet(path: &Path, postings: &[JobPosting]) -> Result<()> {
    let [date, title, company, details, link, active] = DATASET_COLUMNS;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new(date, DataType::Utf8, true),
        ArrowField::new(title, DataType::Utf8, false),
        ArrowField::new(company, DataType::Utf8, false),
        ArrowField::new(details, DataType::Utf8, false),
        ArrowField::new(link, DataType::Utf8, false),
        ArrowField::new(active, DataType::Boolean, false),
    ]));

    let dates = StringArray::from(
        postings
            .iter()
            .map(|p| p.date.map(|d| d.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );
    let titles = StringArray::from(postings.iter().map(|p| p.title.as_str()).collect::<Vec<_>>());
    let companies = StringArray::from(
        postings
            .iter()
            .map(|p| p.company.as_str())
            .collect::<Vec<_>>(),
    );
    let details_col = StringArray::from(
        postings
            .iter()
            .map(|p| p.details.as_str())
            .collect::<Vec<_>>(),
    );
    let links = StringArray::from(postings.iter().map(|p| p.link.as_str()).collect::<Vec<_>>());
    let actives = BooleanArray::from(postings.iter().map(|p| p.active).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(dates),
            Arc::new(titles),
            Arc::new(companies),
            Arc::new(details_col),
            Arc::new(links),
            Arc::new(actives),
        ],
    )
    .context("building postings record batch")?;

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

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the most recent runs, newest first.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        {
            let summary_path = entry.path().join("run_summary.json");
            if !summary_path.exists() {
                continue;
            }
            let summary: SyncRunSummary = serde_json::from_str(
                &std::fs::read_to_string(&summary_path)
                    .with_context(|| format!("reading {}", summary_path.display()))?,
            )
            .with_context(|| format!("parsing {}", summary_path.display()))?;
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut status_counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut lines = vec!["# Jobwatch Report".to_string(), String::new()];
    for summary in summaries.iter().take(runs.max(1)) {
        let status = match summary.status {
            RunStatus::Merged => "merged",
            RunStatus::SkippedEmptyBatch => "skipped-empty-batch",
        };
        *status_counts.entry(status).or_default() += 1;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!("- status: {status}"));
        lines.push(format!("- listings scraped: {}", summary.raw_listings));
        if let Some(stats) = &summary.merge {
            lines.push(format!(
                "- new: {}, reactivated: {}, deactivated: {}",
                stats.added, stats.reactivated, stats.deactivated
            ));
        }
        lines.push(format!("- dataset rows: {}", summary.dataset_rows));
        lines.push(format!("- parquet manifest: `{}`", summary.parquet_manifest));
        lines.push(String::new());
    }
    if status_counts.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    } else {
        lines.push("## Totals".to_string());
        for (status, count) in status_counts {
            lines.push(format!("- {status}: {count}"));
        }
    }

    Ok(lines.join("\n"))
}
