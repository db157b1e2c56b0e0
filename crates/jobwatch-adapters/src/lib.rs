//! Listing source contracts + the itjobs.pt listing adapter.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::RawListing;
use jobwatch_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const ITJOBS_SOURCE_ID: &str = "itjobs";
pub const ITJOBS_SEARCH_URL: &str = "https://www.itjobs.pt/emprego";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl ScrapeContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

impl Default for ScrapeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a scrape that ran to completion. Zero listings is a valid outcome here;
/// a failed scrape is an [`AdapterError`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeBatch {
    pub listings: Vec<RawListing>,
    pub pages: Vec<FetchedPage>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetching {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("invalid search url for query {query:?}: {message}")]
    SearchUrl { query: String, message: String },
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Either every page was read, or the whole scrape fails. Partial batches are never returned.
    async fn fetch_listings(&self, ctx: &ScrapeContext) -> Result<ScrapeBatch, AdapterError>;
}

/// One parsed results page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    pub day_blocks: usize,
    pub listings: Vec<RawListing>,
}

impl ListingPage {
    /// A page with no day blocks marks the end of pagination.
    pub fn is_last(&self) -> bool {
        self.day_blocks == 0
    }
}

struct PageSelectors {
    block: Selector,
    date_box: Selector,
    day: Selector,
    month: Selector,
    item: Selector,
    title: Selector,
    company: Selector,
    details: Selector,
}

impl PageSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            block: selector("div.block.borderless")?,
            date_box: selector(".date-box")?,
            day: selector(".d-d")?,
            month: selector(".d-m")?,
            item: selector("ul.listing > li")?,
            title: selector(".list-title a")?,
            company: selector(".list-name a")?,
            details: selector(".list-details")?,
        })
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// Text nodes trimmed individually and joined by single spaces.
fn spaced_text(el: ElementRef<'_>) -> Option<String> {
    let joined = el
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    text_or_none(joined)
}

fn block_date_text(block: ElementRef<'_>, sel: &PageSelectors) -> Option<String> {
    let date_box = block.select(&sel.date_box).next()?;
    let day = first_text(date_box, &sel.day).unwrap_or_default();
    let month = first_text(date_box, &sel.month).unwrap_or_default();
    Some(format!("{day} {month}"))
}

/// Parses a results page: day blocks, each holding a date box and a list of postings.
pub fn parse_listing_page(html: &str) -> Result<ListingPage, AdapterError> {
    let sel = PageSelectors::new()?;
    let document = Html::parse_document(html);

    let mut page = ListingPage::default();
    for block in document.select(&sel.block) {
        page.day_blocks += 1;
        let date_text = block_date_text(block, &sel);

        for item in block.select(&sel.item) {
            let title_tag = item.select(&sel.title).next();
            page.listings.push(RawListing {
                date_text: date_text.clone(),
                title: title_tag.and_then(|t| text_or_none(t.text().collect::<String>())),
                link: title_tag
                    .and_then(|t| t.value().attr("href"))
                    .and_then(|h| text_or_none(h.to_string())),
                company: first_text(item, &sel.company),
                details: item.select(&sel.details).next().and_then(spaced_text),
            });
        }
    }
    Ok(page)
}

#[derive(Debug, Clone)]
pub struct ItJobsConfig {
    pub query: String,
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for ItJobsConfig {
    fn default() -> Self {
        Self {
            query: "data analyst".to_string(),
            max_pages: 9,
            page_delay: Duration::from_millis(1500),
        }
    }
}

impl ItJobsConfig {
    /// Search URL for one results page; the query is form-encoded.
    pub fn page_url(&self, page: u32) -> Result<Url, AdapterError> {
        let query = self.query.split_whitespace().collect::<Vec<_>>().join(" ");
        let page = page.to_string();
        Url::parse_with_params(
            ITJOBS_SEARCH_URL,
            [("q", query.as_str()), ("sort", "relevance"), ("page", page.as_str())],
        )
        .map_err(|e| AdapterError::SearchUrl {
            query: self.query.clone(),
            message: e.to_string(),
        })
    }
}

pub struct ItJobsSource {
    http: HttpFetcher,
    config: ItJobsConfig,
}

impl ItJobsSource {
    pub fn new(http: HttpFetcher, config: ItJobsConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl ListingSource for ItJobsSource {
    fn source_id(&self) -> &'static str {
        ITJOBS_SOURCE_ID
    }

    async fn fetch_listings(&self, ctx: &ScrapeContext) -> Result<ScrapeBatch, AdapterError> {
        let mut batch = ScrapeBatch::default();
        for page_no in 1..=self.config.max_pages.max(1) {
            if page_no > 1 {
                tokio::time::sleep(self.config.page_delay).await;
            }
            let url = self.config.page_url(page_no)?.to_string();
            let response = self
                .http
                .fetch_bytes(ctx.run_id, ITJOBS_SOURCE_ID, &url)
                .await
                .map_err(|source| AdapterError::Fetch {
                    url: url.clone(),
                    source,
                })?;
            let body = response.text();
            let page = parse_listing_page(&body)?;
            batch.pages.push(FetchedPage {
                url,
                body,
                fetched_at: Utc::now(),
            });

            if page.is_last() {
                info!(page = page_no, "no more results; stopping pagination");
                break;
            }
            info!(page = page_no, listings = page.listings.len(), "parsed results page");
            batch.listings.extend(page.listings);
        }
        Ok(batch)
    }
}

/// Reads saved results pages (`page-*.html`, in name order) instead of hitting the network.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    dir: PathBuf,
}

impl FixtureListingSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn page_paths(&self) -> Result<Vec<PathBuf>, AdapterError> {
        let fixture_err = |source: std::io::Error| AdapterError::Fixture {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(fixture_err)?;
        let mut pages = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(fixture_err)? {
            let path = entry.path();
            let number = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(fixture_page_number);
            if let Some(number) = number {
                pages.push((number, path));
            }
        }
        pages.sort();
        Ok(pages.into_iter().map(|(_, path)| path).collect())
    }
}

/// `page-12.html` → 12. Other file names are not pages.
fn fixture_page_number(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix("page-")?
        .strip_suffix(".html")?
        .parse()
        .ok()
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        ITJOBS_SOURCE_ID
    }

    async fn fetch_listings(&self, _ctx: &ScrapeContext) -> Result<ScrapeBatch, AdapterError> {
        let mut batch = ScrapeBatch::default();
        for path in self.page_paths().await? {
            let body = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| AdapterError::Fixture {
                    path: path.clone(),
                    source,
                })?;
            let page = parse_listing_page(&body)?;
            batch.pages.push(FetchedPage {
                url: format!("file://{}", path.display()),
                body,
                fetched_at: Utc::now(),
            });
            if page.is_last() {
                break;
            }
            batch.listings.extend(page.listings);
        }
        Ok(batch)
    }
}
