//! Raw listing → canonical [`JobPosting`] conversion.

use chrono::{Datelike, NaiveDate};
use thiserror::Error;

use crate::{dedup_keep_last, JobPosting, RawListing};

pub const ITJOBS_ORIGIN: &str = "https://www.itjobs.pt";

/// Abbreviated Portuguese month names as printed in the listing date boxes.
pub const PORTUGUESE_MONTHS: MonthTable = MonthTable::new([
    ("jan", 1),
    ("fev", 2),
    ("mar", 3),
    ("abr", 4),
    ("mai", 5),
    ("jun", 6),
    ("jul", 7),
    ("ago", 8),
    ("set", 9),
    ("out", 10),
    ("nov", 11),
    ("dez", 12),
]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("listing has no link (title: {title:?})")]
    MissingLink { title: Option<String> },
    #[error("month table is incomplete: {0}")]
    IncompleteMonthTable(String),
}

/// Locale month abbreviation → month number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthTable {
    entries: [(&'static str, u32); 12],
}

impl MonthTable {
    pub const fn new(entries: [(&'static str, u32); 12]) -> Self {
        Self { entries }
    }

    /// Every month 1..=12 must be mapped exactly once, by a distinct non-empty token.
    pub fn validate(&self) -> Result<(), NormalizeError> {
        let mut seen = [false; 12];
        for (idx, (token, month)) in self.entries.iter().enumerate() {
            if token.trim().is_empty() {
                return Err(NormalizeError::IncompleteMonthTable(format!(
                    "empty token for month {month}"
                )));
            }
            if !(1..=12).contains(month) {
                return Err(NormalizeError::IncompleteMonthTable(format!(
                    "token {token:?} maps to invalid month {month}"
                )));
            }
            let slot = &mut seen[(*month - 1) as usize];
            if *slot {
                return Err(NormalizeError::IncompleteMonthTable(format!(
                    "month {month} mapped more than once"
                )));
            }
            *slot = true;
            if self.entries[..idx]
                .iter()
                .any(|(other, _)| other.eq_ignore_ascii_case(token))
            {
                return Err(NormalizeError::IncompleteMonthTable(format!(
                    "token {token:?} listed twice"
                )));
            }
        }
        Ok(())
    }

    /// Case-insensitive; a trailing `.` is ignored and only the first three characters count,
    /// so `Out`, `out.` and `outubro` all resolve to October.
    pub fn month_for(&self, token: &str) -> Option<u32> {
        let token = token.trim().trim_end_matches('.').to_lowercase();
        let prefix = token.chars().take(3).collect::<String>();
        if prefix.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|(abbrev, _)| abbrev.eq_ignore_ascii_case(&prefix))
            .map(|(_, month)| *month)
    }
}

/// Parse `"<day> <month-token>"` in the given year. Anything else is an unknown date.
pub fn parse_listing_date(text: &str, year: i32, months: &MonthTable) -> Option<NaiveDate> {
    let mut parts = text.split_whitespace();
    let day = parts.next()?.parse::<u32>().ok()?;
    let month = months.month_for(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Resolve a scraped href against the site origin.
pub fn resolve_link(origin: &str, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    let origin = origin.trim_end_matches('/');
    if raw.starts_with('/') {
        Some(format!("{origin}{raw}"))
    } else {
        Some(format!("{origin}/{raw}"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedBatch {
    pub postings: Vec<JobPosting>,
    pub rejected: Vec<NormalizeError>,
    pub unknown_dates: usize,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    origin: String,
    year: i32,
    months: MonthTable,
}

impl Normalizer {
    /// The listing pages omit the year, so postings are dated in the year of the scrape run.
    pub fn new(
        origin: impl Into<String>,
        scrape_date: NaiveDate,
        months: MonthTable,
    ) -> Result<Self, NormalizeError> {
        months.validate()?;
        Ok(Self {
            origin: origin.into(),
            year: scrape_date.year(),
            months,
        })
    }

    pub fn itjobs(scrape_date: NaiveDate) -> Result<Self, NormalizeError> {
        Self::new(ITJOBS_ORIGIN, scrape_date, PORTUGUESE_MONTHS)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn normalize(&self, raw: &RawListing) -> Result<JobPosting, NormalizeError> {
        let link = raw
            .link
            .as_deref()
            .and_then(|l| resolve_link(&self.origin, l))
            .ok_or_else(|| NormalizeError::MissingLink {
                title: raw.title.clone(),
            })?;
        let date = raw
            .date_text
            .as_deref()
            .and_then(|t| parse_listing_date(t, self.year, &self.months));

        Ok(JobPosting {
            date,
            title: clean(raw.title.as_deref()),
            company: clean(raw.company.as_deref()),
            details: clean(raw.details.as_deref()),
            link,
            active: true,
        })
    }

    /// Normalizes a whole scrape, keeping the last listing per link in scrape order.
    pub fn normalize_batch(&self, raws: &[RawListing]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();
        for raw in raws {
            match self.normalize(raw) {
                Ok(posting) => {
                    if posting.date.is_none() {
                        batch.unknown_dates += 1;
                    }
                    batch.postings.push(posting);
                }
                Err(err) => batch.rejected.push(err),
            }
        }
        batch.postings = dedup_keep_last(batch.postings);
        batch
    }
}

fn clean(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}
