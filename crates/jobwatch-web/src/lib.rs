//! Read-only dashboard over the posting history (axum + askama).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use jobwatch_core::{sort_newest_first, JobPosting};
use jobwatch_storage::parse_dataset;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "jobwatch-web";

pub const APP_TITLE: &str = "ITJobs Data Analyst Tracker";

/// Where the dashboard reads the history file from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    Path(PathBuf),
    Url(String),
}

impl DatasetSource {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.starts_with("http://") || value.starts_with("https://") {
            DatasetSource::Url(value.to_string())
        } else {
            DatasetSource::Path(PathBuf::from(value))
        }
    }

    fn describe(&self) -> String {
        match self {
            DatasetSource::Path(path) => path.display().to_string(),
            DatasetSource::Url(url) => url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub dataset: DatasetSource,
    pub freshness_url: Option<String>,
    pub assets_dir: PathBuf,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let dataset = std::env::var("JOBWATCH_DATASET_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .or_else(|| std::env::var("JOBWATCH_DATASET_PATH").ok())
            .map(|v| DatasetSource::parse(&v))
            .unwrap_or_else(|| DatasetSource::Path(PathBuf::from("./itjobs_data_analyst.csv")));
        Self {
            dataset,
            freshness_url: std::env::var("JOBWATCH_FRESHNESS_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            assets_dir: PathBuf::from("assets/static"),
            port: std::env::var("JOBWATCH_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }

    pub fn for_dataset(dataset: DatasetSource) -> Self {
        Self {
            dataset,
            freshness_url: None,
            assets_dir: PathBuf::from("assets/static"),
            port: 8000,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: WebConfig,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(config: WebConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("jobwatch-dashboard/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building reqwest client")?;
        Ok(Self { config, http })
    }
}

/// When the dataset was last refreshed, best effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fetched(DateTime<Utc>),
    Fallback(NaiveDate),
    Unknown,
}

impl Freshness {
    pub fn from_dataset(postings: &[JobPosting]) -> Self {
        postings
            .iter()
            .filter_map(|p| p.date)
            .max()
            .map(Freshness::Fallback)
            .unwrap_or(Freshness::Unknown)
    }

    pub fn caption(&self) -> String {
        match self {
            Freshness::Fetched(ts) => ts.format("%d %b %Y %H:%M UTC").to_string(),
            Freshness::Fallback(date) => format!("{} (from dataset)", date.format("%Y-%m-%d")),
            Freshness::Unknown => "Unknown".to_string(),
        }
    }
}

/// Reads `[0].commit.committer.date` from a commits listing.
pub fn parse_commit_timestamp(body: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = body.get(0)?.get("commit")?.get("committer")?.get("date")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

async fn fetch_commit_timestamp(
    client: &reqwest::Client,
    url: &str,
) -> anyhow::Result<DateTime<Utc>> {
    let body: serde_json::Value = client
        .get(url)
        .send()
        .await
        .context("requesting freshness endpoint")?
        .error_for_status()
        .context("freshness endpoint status")?
        .json()
        .await
        .context("decoding freshness response")?;
    parse_commit_timestamp(&body).context("no commit timestamp in freshness response")
}

/// Never fails: endpoint problems degrade to the newest known posting date.
pub async fn resolve_freshness(
    client: &reqwest::Client,
    url: Option<&str>,
    postings: &[JobPosting],
) -> Freshness {
    if let Some(url) = url {
        match fetch_commit_timestamp(client, url).await {
            Ok(ts) => return Freshness::Fetched(ts),
            Err(err) => warn!(
                error = %format!("{err:#}"),
                "freshness lookup failed; using dataset dates"
            ),
        }
    }
    Freshness::from_dataset(postings)
}

/// Postings per `YYYY-MM`, ascending, with undated postings in a trailing `Unknown` bucket.
pub fn monthly_counts(postings: &[JobPosting]) -> Vec<(String, usize)> {
    let mut months = BTreeMap::<String, usize>::new();
    let mut unknown = 0usize;
    for p in postings {
        match p.date {
            Some(date) => *months.entry(date.format("%Y-%m").to_string()).or_default() += 1,
            None => unknown += 1,
        }
    }
    let mut out = months.into_iter().collect::<Vec<_>>();
    if unknown > 0 {
        out.push(("Unknown".to_string(), unknown));
    }
    out
}

pub async fn load_dataset(state: &AppState) -> anyhow::Result<Vec<JobPosting>> {
    let mut postings = match &state.config.dataset {
        DatasetSource::Path(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading dataset {}", path.display()))?;
            parse_dataset(&bytes, path)?
        }
        DatasetSource::Url(url) => {
            let bytes = state
                .http
                .get(url)
                .send()
                .await
                .with_context(|| format!("requesting dataset {url}"))?
                .error_for_status()
                .with_context(|| format!("dataset status {url}"))?
                .bytes()
                .await
                .with_context(|| format!("downloading dataset {url}"))?;
            parse_dataset(&bytes, Path::new(url))?
        }
    };
    sort_newest_first(&mut postings);
    Ok(postings)
}

#[derive(Debug, Clone)]
struct PostingRow {
    date: String,
    title: String,
    company: String,
    details: String,
    link: String,
    active: bool,
}

impl From<&JobPosting> for PostingRow {
    fn from(p: &JobPosting) -> Self {
        Self {
            date: p.date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
            title: p.title.clone(),
            company: p.company.clone(),
            details: p.details.clone(),
            link: p.link.clone(),
            active: p.active,
        }
    }
}

#[derive(Debug, Clone)]
struct CompanyOption {
    name: String,
    selected: bool,
}

#[derive(Debug, Deserialize, Default)]
struct OpeningsQuery {
    company: Option<String>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    app_title: &'static str,
    last_update: String,
    total: usize,
    active: usize,
    inactive: usize,
}

#[derive(Template)]
#[template(path = "openings.html")]
struct OpeningsTemplate {
    app_title: &'static str,
    companies: Vec<CompanyOption>,
    all_selected: bool,
    rows: Vec<PostingRow>,
}

#[derive(Template)]
#[template(path = "history.html")]
struct HistoryTemplate {
    app_title: &'static str,
    rows: Vec<PostingRow>,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    app_title: &'static str,
    source: String,
    message: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/openings", get(openings_handler))
        .route("/history", get(history_handler))
        .route("/history/chart", get(history_chart_handler))
        .route("/api/postings", get(api_postings_handler))
        .route("/assets/static/app.css", get(app_css_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let port = config.port;
    let state = AppState::new(config)?;
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, dataset = %state.config.dataset.describe(), "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state).await {
        Ok(postings) => {
            let freshness = resolve_freshness(
                &state.http,
                state.config.freshness_url.as_deref(),
                &postings,
            )
            .await;
            let active = postings.iter().filter(|p| p.active).count();
            render_html(IndexTemplate {
                app_title: APP_TITLE,
                last_update: freshness.caption(),
                total: postings.len(),
                active,
                inactive: postings.len() - active,
            })
        }
        Err(err) => dataset_unavailable(&state, err),
    }
}

async fn openings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpeningsQuery>,
) -> Response {
    match load_dataset(&state).await {
        Ok(postings) => {
            let (rows, companies, all_selected) = filtered_openings(&postings, &query);
            render_html(OpeningsTemplate {
                app_title: APP_TITLE,
                companies,
                all_selected,
                rows,
            })
        }
        Err(err) => dataset_unavailable(&state, err),
    }
}

async fn history_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state).await {
        Ok(postings) => render_html(HistoryTemplate {
            app_title: APP_TITLE,
            rows: postings.iter().map(PostingRow::from).collect(),
        }),
        Err(err) => dataset_unavailable(&state, err),
    }
}

async fn history_chart_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state).await {
        Ok(postings) => {
            let counts = monthly_counts(&postings);
            let x = counts.iter().map(|(m, _)| m.clone()).collect::<Vec<_>>();
            let y = counts.iter().map(|(_, n)| *n as i64).collect::<Vec<_>>();
            Json(serde_json::json!({
                "data": [{
                    "type": "bar",
                    "x": x,
                    "y": y,
                    "text": y,
                    "textposition": "auto",
                    "marker": {"color": "#0ea5e9"}
                }],
                "layout": {
                    "title": "Number of job postings per month",
                    "xaxis": {"title": "month", "type": "category"},
                    "yaxis": {"title": "num_jobs"},
                    "paper_bgcolor": "#ffffff",
                    "plot_bgcolor": "#f8fafc"
                }
            }))
            .into_response()
        }
        Err(err) => dataset_unavailable(&state, err),
    }
}

async fn api_postings_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_dataset(&state).await {
        Ok(postings) => Json(postings).into_response(),
        Err(err) => dataset_unavailable(&state, err),
    }
}

async fn app_css_handler(State(state): State<Arc<AppState>>) -> Response {
    let css_path = state.config.assets_dir.join("app.css");
    match tokio::fs::read_to_string(&css_path).await {
        Ok(css) => ([(header::CONTENT_TYPE, "text/css; charset=utf-8")], css).into_response(),
        Err(_) => {
            (StatusCode::NOT_FOUND, Html("/* missing app.css */".to_string())).into_response()
        }
    }
}

fn filtered_openings(
    all: &[JobPosting],
    query: &OpeningsQuery,
) -> (Vec<PostingRow>, Vec<CompanyOption>, bool) {
    let active = all.iter().filter(|p| p.active).collect::<Vec<_>>();
    let selected = query
        .company
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty() && *c != "All")
        .unwrap_or_default();

    let companies = active
        .iter()
        .map(|p| p.company.as_str())
        .filter(|c| !c.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|name| CompanyOption {
            selected: name == selected,
            name: name.to_string(),
        })
        .collect::<Vec<_>>();

    let rows = active
        .into_iter()
        .filter(|p| selected.is_empty() || p.company == selected)
        .map(PostingRow::from)
        .collect::<Vec<_>>();

    (rows, companies, selected.is_empty())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn dataset_unavailable(state: &AppState, err: anyhow::Error) -> Response {
    let source = state.config.dataset.describe();
    error!(error = %format!("{err:#}"), %source, "dataset unavailable");
    let page = ErrorTemplate {
        app_title: APP_TITLE,
        source,
        message: format!("{err:#}"),
    };
    match page.render() {
        Ok(html) => (StatusCode::SERVICE_UNAVAILABLE, Html(html)).into_response(),
        Err(render_err) => server_error(anyhow::anyhow!(render_err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
