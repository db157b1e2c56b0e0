//! Persisted posting history: one CSV file, replaced atomically on every save.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use jobwatch_core::{dedup_keep_last, JobPosting};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// Column order of the dataset file. Readers rely on it.
pub const DATASET_COLUMNS: [&str; 6] = ["date", "title", "company", "details", "link", "active"];

const BOM: &str = "\u{feff}";
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("invalid row {line} in {path}: {message}")]
    InvalidRow {
        path: PathBuf,
        line: u64,
        message: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct DatasetRow {
    #[serde(default)]
    date: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    company: String,
    #[serde(default)]
    details: String,
    link: String,
    #[serde(default, alias = "ativo")]
    active: String,
}

impl From<&JobPosting> for DatasetRow {
    fn from(p: &JobPosting) -> Self {
        Self {
            date: p
                .date
                .map(|d| d.format(DATE_FORMAT).to_string())
                .unwrap_or_default(),
            title: p.title.clone(),
            company: p.company.clone(),
            details: p.details.clone(),
            link: p.link.clone(),
            active: if p.active { "1" } else { "0" }.to_string(),
        }
    }
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part (`' '` or `'T'` separated).
pub fn parse_stored_date(value: &str) -> Option<NaiveDate> {
    let (date, rest) = NaiveDate::parse_and_remainder(value.trim(), DATE_FORMAT).ok()?;
    (rest.is_empty() || rest.starts_with([' ', 'T'])).then_some(date)
}

/// Empty means the row predates the flag and is treated as active.
pub fn parse_active_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "1.0" | "true" => Some(true),
        "0" | "0.0" | "false" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub written: usize,
    pub duplicates_dropped: usize,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is the first run, not an error.
    pub async fn load(&self) -> Result<Vec<JobPosting>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no history yet; starting empty");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let postings = parse_dataset(&bytes, &self.path)?;
        info!(path = %self.path.display(), rows = postings.len(), "loaded history");
        Ok(postings)
    }

    /// Deduplicates by link (keep last) and atomically replaces the dataset file.
    pub async fn save(&self, postings: Vec<JobPosting>) -> Result<SaveReport, StoreError> {
        let before = postings.len();
        let postings = dedup_keep_last(postings);
        let duplicates_dropped = before - postings.len();
        if duplicates_dropped > 0 {
            warn!(duplicates_dropped, "dropping duplicate links before save");
        }

        let bytes = render_dataset(&postings, &self.path)?;
        write_atomically(&self.path, &bytes).await?;

        info!(path = %self.path.display(), rows = postings.len(), "saved history");
        Ok(SaveReport {
            written: postings.len(),
            duplicates_dropped,
        })
    }
}

/// Parses dataset bytes (BOM tolerated). Shared with read-only consumers.
pub fn parse_dataset(bytes: &[u8], origin: &Path) -> Result<Vec<JobPosting>, StoreError> {
    let bytes = bytes.strip_prefix(BOM.as_bytes()).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(bytes);

    let csv_err = |source: csv::Error| StoreError::Csv {
        path: origin.to_path_buf(),
        source,
    };
    let headers = reader.headers().map_err(csv_err)?.clone();

    let mut postings = Vec::new();
    let mut unknown_dates = 0usize;
    let mut empty_links = 0usize;
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record).map_err(csv_err)? {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        let row: DatasetRow = record.deserialize(Some(&headers)).map_err(csv_err)?;
        // Older files carry rows scraped without a title anchor; keep them so a save never
        // drops history.
        let link = row.link.trim().to_string();
        if link.is_empty() {
            empty_links += 1;
        }
        let active = parse_active_flag(&row.active).ok_or_else(|| StoreError::InvalidRow {
            path: origin.to_path_buf(),
            line,
            message: format!("unrecognised active flag {:?}", row.active),
        })?;
        let date = parse_stored_date(&row.date);
        if date.is_none() && !row.date.trim().is_empty() {
            unknown_dates += 1;
        }
        postings.push(JobPosting {
            date,
            title: row.title,
            company: row.company,
            details: row.details,
            link,
            active,
        });
    }
    if unknown_dates > 0 {
        warn!(
            path = %origin.display(),
            unknown_dates,
            "stored dates could not be parsed; kept as unknown"
        );
    }
    if empty_links > 0 {
        warn!(path = %origin.display(), empty_links, "rows without a link kept as-is");
    }
    Ok(postings)
}

fn render_dataset(postings: &[JobPosting], target: &Path) -> Result<Vec<u8>, StoreError> {
    let csv_err = |source: csv::Error| StoreError::Csv {
        path: target.to_path_buf(),
        source,
    };
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(BOM.as_bytes().to_vec());
    writer.write_record(DATASET_COLUMNS).map_err(csv_err)?;
    for posting in postings {
        writer.serialize(DatasetRow::from(posting)).map_err(csv_err)?;
    }
    writer
        .into_inner()
        .map_err(|err| StoreError::Io {
            path: target.to_path_buf(),
            source: err.into_error(),
        })
}

/// Temp file in the target directory, fsync, rename. The previous file survives any failure.
pub(crate) async fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    let parent = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "dataset".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, target).await
    }
    .await;

    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn posting(link: &str, active: bool) -> JobPosting {
        JobPosting {
            date: NaiveDate::from_ymd_opt(2025, 10, 12),
            title: "Analista de Dados Júnior".to_string(),
            company: "Ação, Lda".to_string(),
            details: "Lisboa \"híbrido\"\nRemoto".to_string(),
            link: link.to_string(),
            active,
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.csv"));
        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_non_ascii_and_unknown_dates() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("nested/history.csv"));
        let mut undated = posting("https://www.itjobs.pt/oferta/2", false);
        undated.date = None;
        let postings = vec![posting("https://www.itjobs.pt/oferta/1", true), undated];

        store.save(postings.clone()).await.expect("save");
        assert_eq!(store.load().await.expect("load"), postings);
    }

    #[tokio::test]
    async fn file_has_bom_and_fixed_header() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.csv");
        HistoryStore::new(&path)
            .save(vec![posting("l1", true)])
            .await
            .expect("save");
        let text = std::fs::read_to_string(&path).expect("read");
        let text = text.strip_prefix(BOM).expect("bom");
        assert!(text.starts_with("date,title,company,details,link,active\n"));
        assert!(text.contains("2025-10-12,"));
        assert!(text.trim_end().ends_with(",l1,1"));
    }

    #[tokio::test]
    async fn save_drops_duplicates_keeping_last() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.csv"));
        let report = store
            .save(vec![posting("a", true), posting("b", true), posting("a", false)])
            .await
            .expect("save");
        assert_eq!(report.duplicates_dropped, 1);
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].link, "a");
        assert!(!loaded[1].active);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.csv"));
        store.save(vec![posting("a", true)]).await.expect("first");
        store.save(vec![posting("b", true)]).await.expect("second");
        let names = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["history.csv".to_string()]);
    }

    #[tokio::test]
    async fn failed_save_keeps_previous_dataset() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.csv");
        let store = HistoryStore::new(&path);
        store.save(vec![posting("a", true)]).await.expect("save");
        let before = std::fs::read(&path).expect("read");

        // A regular file in place of the parent directory makes the write fail.
        let blocked = HistoryStore::new(path.join("child.csv"));
        assert!(blocked.save(vec![posting("b", true)]).await.is_err());

        assert_eq!(std::fs::read(&path).expect("read"), before);
    }

    #[test]
    fn legacy_files_are_readable() {
        let text = "\u{feff}date,title,company,ativo,details,link\n\
                    2025-10-12 00:00:00,Analyst,Acme,0,,https://x/1\n\
                    ,Engineer,,1.0,Porto,https://x/2\n\
                    not-a-date,Dev,,true,,https://x/3\n";
        let postings = parse_dataset(text.as_bytes(), Path::new("legacy.csv")).expect("parse");
        assert_eq!(postings.len(), 3);
        assert_eq!(postings[0].date, NaiveDate::from_ymd_opt(2025, 10, 12));
        assert!(!postings[0].active);
        assert_eq!(postings[1].date, None);
        assert!(postings[1].active);
        assert_eq!(postings[2].date, None);
    }

    #[test]
    fn legacy_rows_without_link_are_kept() {
        let text = "\u{feff}date,title,company,details,link,ativo\n\
                    2025-10-12,Analyst,Acme,,https://x/1,1\n\
                    2025-10-11,,,Lisboa,,0\n\
                    2025-10-10,,,Porto,,1\n\
                    2025-10-09,BI,Beta,,https://x/2,1\n";
        let postings = parse_dataset(text.as_bytes(), Path::new("legacy.csv")).expect("parse");
        assert_eq!(postings.len(), 4);
        assert_eq!(postings[1].link, "");
        assert_eq!(postings[1].details, "Lisboa");

        // Repeated empty links collapse like any other key.
        let deduped = dedup_keep_last(postings);
        assert_eq!(deduped.len(), 3);
        assert_eq!(deduped[1].details, "Porto");
    }

    #[test]
    fn stored_dates_reject_trailing_garbage() {
        assert_eq!(parse_stored_date("2025-10-12"), NaiveDate::from_ymd_opt(2025, 10, 12));
        assert_eq!(
            parse_stored_date(" 2025-10-12 00:00:00"),
            NaiveDate::from_ymd_opt(2025, 10, 12)
        );
        assert_eq!(
            parse_stored_date("2025-10-12T08:30:00Z"),
            NaiveDate::from_ymd_opt(2025, 10, 12)
        );
        assert_eq!(parse_stored_date("2025-10-12garbage"), None);
        assert_eq!(parse_stored_date("12/10/2025"), None);
    }

    #[test]
    fn invalid_row_reports_file_line_after_multiline_cell() {
        let text = "date,title,company,details,link,active\n\
                    2025-01-01,a,b,\"Lisboa\nRemoto\",https://x/1,1\n\
                    2025-01-02,c,d,,https://x/2,maybe\n";
        let err = parse_dataset(text.as_bytes(), Path::new("multi.csv")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow { line: 4, .. }), "{err}");
    }

    #[test]
    fn bad_flag_is_an_error() {
        let text = "date,title,company,details,link,active\n2025-01-01,a,b,c,https://x/1,maybe\n";
        let err = parse_dataset(text.as_bytes(), Path::new("bad.csv")).unwrap_err();
        assert!(matches!(err, StoreError::InvalidRow { line: 2, .. }));
    }
}
