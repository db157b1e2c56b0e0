//! Incremental history merge.
//!
//! History rows are never removed: a merge only flips `active` on rows it already knows and
//! appends postings it has not seen before. Content fields (including `date`) are first write
//! wins. Callers must only pass a batch from a scrape that actually succeeded; an empty batch
//! deactivates every history row.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::JobPosting;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub added: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    pub still_active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub postings: Vec<JobPosting>,
    pub stats: MergeStats,
}

/// Drops every record whose link appears again later; survivors keep the position of their
/// last occurrence.
pub fn dedup_keep_last(postings: Vec<JobPosting>) -> Vec<JobPosting> {
    let mut seen = HashSet::with_capacity(postings.len());
    let mut kept = postings
        .into_iter()
        .rev()
        .filter(|p| seen.insert(p.link.clone()))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

pub fn merge(history: Vec<JobPosting>, batch: Vec<JobPosting>) -> Vec<JobPosting> {
    merge_with_stats(history, batch).postings
}

pub fn merge_with_stats(history: Vec<JobPosting>, batch: Vec<JobPosting>) -> MergeOutcome {
    let history = dedup_keep_last(history);
    let batch = dedup_keep_last(batch);
    let fresh_links = batch.iter().map(|p| p.link.as_str()).collect::<HashSet<_>>();

    let mut stats = MergeStats::default();
    let mut known_links = HashSet::with_capacity(history.len());
    let mut merged = Vec::with_capacity(history.len() + batch.len());

    for mut posting in history {
        let now_active = fresh_links.contains(posting.link.as_str());
        match (posting.active, now_active) {
            (false, true) => stats.reactivated += 1,
            (true, false) => stats.deactivated += 1,
            (true, true) => stats.still_active += 1,
            (false, false) => {}
        }
        posting.active = now_active;
        known_links.insert(posting.link.clone());
        merged.push(posting);
    }

    for mut posting in batch {
        if known_links.contains(&posting.link) {
            continue;
        }
        posting.active = true;
        stats.added += 1;
        merged.push(posting);
    }

    let postings = dedup_keep_last(merged);
    stats.total = postings.len();
    MergeOutcome { postings, stats }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn posting(link: &str, active: bool, date: Option<(i32, u32, u32)>) -> JobPosting {
        JobPosting {
            date: date.and_then(|(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
            title: format!("title {link}"),
            company: format!("company {link}"),
            details: String::new(),
            link: link.to_string(),
            active,
        }
    }

    fn find<'a>(postings: &'a [JobPosting], link: &str) -> &'a JobPosting {
        let matches = postings.iter().filter(|p| p.link == link).collect::<Vec<_>>();
        assert_eq!(matches.len(), 1, "expected exactly one row for {link}");
        matches[0]
    }

    fn assert_unique(postings: &[JobPosting]) {
        let links = postings.iter().map(|p| &p.link).collect::<HashSet<_>>();
        assert_eq!(links.len(), postings.len());
    }

    fn sample_histories() -> Vec<Vec<JobPosting>> {
        vec![
            vec![],
            vec![posting("a", true, Some((2024, 1, 1)))],
            vec![
                posting("a", false, Some((2024, 1, 1))),
                posting("b", true, None),
                posting("c", true, Some((2024, 3, 1))),
            ],
            vec![
                posting("a", true, Some((2024, 1, 1))),
                posting("a", false, Some((2023, 1, 1))),
                posting("d", false, None),
            ],
        ]
    }

    fn sample_batches() -> Vec<Vec<JobPosting>> {
        vec![
            vec![],
            vec![posting("a", true, Some((2025, 6, 1)))],
            vec![
                posting("b", true, Some((2024, 2, 1))),
                posting("e", true, Some((2024, 5, 1))),
            ],
            vec![
                posting("e", false, None),
                posting("c", true, None),
                posting("e", true, Some((2024, 5, 2))),
            ],
        ]
    }

    #[test]
    fn scenario_existing_plus_new() {
        let history = vec![posting("a", true, Some((2024, 1, 1)))];
        let batch = vec![
            posting("a", true, Some((2024, 1, 1))),
            posting("b", true, Some((2024, 2, 1))),
        ];
        let merged = merge(history, batch);
        assert_eq!(
            merged,
            vec![
                posting("a", true, Some((2024, 1, 1))),
                posting("b", true, Some((2024, 2, 1))),
            ]
        );
    }

    #[test]
    fn empty_batch_deactivates_everything() {
        let history = vec![posting("a", true, None), posting("b", false, None)];
        let outcome = merge_with_stats(history, vec![]);
        assert!(outcome.postings.iter().all(|p| !p.active));
        assert_eq!(outcome.stats.deactivated, 1);
        assert_eq!(outcome.stats.total, 2);
    }

    #[test]
    fn merge_is_idempotent() {
        for history in sample_histories() {
            for batch in sample_batches() {
                let once = merge(history.clone(), batch.clone());
                let twice = merge(once.clone(), batch.clone());
                assert_eq!(once, twice);
            }
        }
    }

    #[test]
    fn merge_keeps_links_unique_and_never_shrinks_known_links() {
        for history in sample_histories() {
            let distinct_history = history.iter().map(|p| &p.link).collect::<HashSet<_>>().len();
            for batch in sample_batches() {
                let merged = merge(history.clone(), batch.clone());
                assert_unique(&merged);
                assert!(merged.len() >= distinct_history);
                for p in &history {
                    assert!(merged.iter().any(|m| m.link == p.link), "lost {}", p.link);
                }
            }
        }
    }

    #[test]
    fn reactivation_keeps_original_fields() {
        let original = posting("a", false, Some((2024, 1, 1)));
        let mut rescraped = posting("a", true, Some((2025, 9, 9)));
        rescraped.title = "renamed".to_string();

        let outcome = merge_with_stats(vec![original.clone()], vec![rescraped]);
        let row = find(&outcome.postings, "a");
        assert!(row.active);
        assert_eq!(row.date, original.date);
        assert_eq!(row.title, original.title);
        assert_eq!(row.company, original.company);
        assert_eq!(outcome.stats.reactivated, 1);
        assert_eq!(outcome.stats.added, 0);
    }

    #[test]
    fn deactivation_changes_only_the_flag() {
        let original = posting("a", true, Some((2024, 1, 1)));
        let merged = merge(vec![original.clone()], vec![posting("b", true, None)]);
        let row = find(&merged, "a");
        assert_eq!(
            row,
            &JobPosting {
                active: false,
                ..original
            }
        );
    }

    #[test]
    fn new_postings_come_from_the_batch_and_are_active() {
        let mut fresh = posting("z", false, Some((2024, 7, 7)));
        fresh.details = "Lisboa | Remoto".to_string();
        let outcome = merge_with_stats(vec![posting("a", true, None)], vec![fresh.clone()]);
        let row = find(&outcome.postings, "z");
        assert!(row.active);
        assert_eq!(row.details, fresh.details);
        assert_eq!(row.date, fresh.date);
        assert_eq!(outcome.stats.added, 1);
        assert_eq!(outcome.stats.deactivated, 1);
    }

    #[test]
    fn dates_survive_disappear_and_reappear_cycles() {
        let history = vec![posting("a", true, Some((2024, 1, 1)))];
        let gone = merge(history, vec![posting("b", true, None)]);
        assert!(!find(&gone, "a").active);

        let back = merge(gone, vec![posting("a", true, Some((2024, 12, 31)))]);
        let row = find(&back, "a");
        assert!(row.active);
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2024, 1, 1));
        assert!(!find(&back, "b").active);
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn malformed_history_is_deduplicated_keep_last() {
        let history = vec![
            posting("a", true, Some((2024, 1, 1))),
            posting("b", true, None),
            posting("a", true, Some((2023, 6, 6))),
        ];
        let merged = merge(history, vec![posting("a", true, None)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].link, "b");
        assert_eq!(merged[1].date, NaiveDate::from_ymd_opt(2023, 6, 6));
    }

    #[test]
    fn dedup_keeps_position_of_last_occurrence() {
        let deduped = dedup_keep_last(vec![
            posting("a", true, None),
            posting("b", true, None),
            posting("a", false, None),
            posting("c", true, None),
        ]);
        let links = deduped.iter().map(|p| p.link.as_str()).collect::<Vec<_>>();
        assert_eq!(links, vec!["b", "a", "c"]);
        assert!(!deduped[1].active);
    }
}
