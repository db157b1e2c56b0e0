//! Core domain model for jobwatch: canonical postings, normalization and history merge.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod merge;
pub mod normalize;

pub use merge::{dedup_keep_last, merge, merge_with_stats, MergeOutcome, MergeStats};
pub use normalize::{
    parse_listing_date, resolve_link, MonthTable, NormalizeError, NormalizedBatch, Normalizer,
    ITJOBS_ORIGIN, PORTUGUESE_MONTHS,
};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Raw listing fragment as handed over by a listing source, before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub date_text: Option<String>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub company: Option<String>,
    pub details: Option<String>,
}

/// Canonical posting record, keyed by `link`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub date: Option<NaiveDate>,
    pub title: String,
    pub company: String,
    pub details: String,
    pub link: String,
    pub active: bool,
}

impl JobPosting {
    pub fn new(link: impl Into<String>) -> Self {
        Self {
            date: None,
            title: String::new(),
            company: String::new(),
            details: String::new(),
            link: link.into(),
            active: true,
        }
    }
}

/// Newest first, unknown dates last.
pub fn newest_first(a: &Option<NaiveDate>, b: &Option<NaiveDate>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Stable sort by date descending; postings without a date keep their relative order at the end.
pub fn sort_newest_first(postings: &mut [JobPosting]) {
    postings.sort_by(|a, b| newest_first(&a.date, &b.date));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dated(link: &str, date: Option<(i32, u32, u32)>) -> JobPosting {
        JobPosting {
            date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            ..JobPosting::new(link)
        }
    }

    #[test]
    fn unknown_dates_sort_last() {
        let mut postings = vec![
            dated("a", None),
            dated("b", Some((2025, 1, 3))),
            dated("c", Some((2025, 2, 1))),
            dated("d", None),
        ];
        sort_newest_first(&mut postings);
        let links = postings.iter().map(|p| p.link.as_str()).collect::<Vec<_>>();
        assert_eq!(links, vec!["c", "b", "a", "d"]);
    }
}
