//! Core domain model for the career pipeline: entities, ledger states and pageview math.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "careers-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Closed set of categories an accepted entity can be filed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Profession,
    Occupation,
    Job,
    Position,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Profession,
        Category::Occupation,
        Category::Job,
        Category::Position,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Profession => "profession",
            Category::Occupation => "occupation",
            Category::Job => "job",
            Category::Position => "position",
        }
    }
}

impl FromStr for Category {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "category",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resume ledger state. Moves pending -> in_progress -> {complete, failed};
/// resume sends interrupted and failed rows back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl EnrichmentStatus {
    pub const ALL: [EnrichmentStatus; 4] = [
        EnrichmentStatus::Pending,
        EnrichmentStatus::InProgress,
        EnrichmentStatus::Complete,
        EnrichmentStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::InProgress => "in_progress",
            EnrichmentStatus::Complete => "complete",
            EnrichmentStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: EnrichmentStatus) -> bool {
        use EnrichmentStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (Failed, Pending)
        )
    }
}

impl FromStr for EnrichmentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnrichmentStatus::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "enrichment status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reviewer decision. Written only by the review UI, never by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Unreviewed,
    NeedsAttention,
    Resolved,
    NotApplicable,
}

impl ReviewStatus {
    pub const ALL: [ReviewStatus; 4] = [
        ReviewStatus::Unreviewed,
        ReviewStatus::NeedsAttention,
        ReviewStatus::Resolved,
        ReviewStatus::NotApplicable,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Unreviewed => "unreviewed",
            ReviewStatus::NeedsAttention => "needs_attention",
            ReviewStatus::Resolved => "resolved",
            ReviewStatus::NotApplicable => "not_applicable",
        }
    }
}

impl FromStr for ReviewStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReviewStatus::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "review status",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric part of a `Q<digits>` entity id.
pub fn qid_number(id: &str) -> Option<u64> {
    id.strip_prefix('Q')?.parse().ok()
}

/// Sort key ordering entity ids numerically (Q2 before Q10). Ids without a
/// numeric part sort after every well-formed one.
pub fn qid_sort_key(id: &str) -> (u64, &str) {
    (qid_number(id).unwrap_or(u64::MAX), id)
}

/// Discovery handoff: an accepted, classified entity ready to be upserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredCareer {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub source_url: String,
}

/// Persisted career row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Career {
    pub id: String,
    pub name: String,
    pub category: Category,
    pub source_url: String,
    pub resolved_title: Option<String>,
    pub pageview_total: Option<i64>,
    pub pageview_daily_avg: Option<f64>,
    pub pageview_days: Option<i64>,
    pub pageviews_updated_at: Option<DateTime<Utc>>,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment_attempts: i64,
    pub last_error: Option<String>,
    pub review_status: ReviewStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Views reported for one monthly period of the metrics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodCount {
    pub period_start: NaiveDate,
    pub views: u64,
}

/// Inclusive date range pageviews are summed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageviewWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl PageviewWindow {
    /// The `months` complete calendar months preceding the month of `today`.
    pub fn trailing_months(today: NaiveDate, months: u32) -> Option<Self> {
        let this_month = today.with_day(1)?;
        let end = this_month.pred_opt()?;
        let start = this_month.checked_sub_months(Months::new(months.max(1)))?;
        Some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Days from `first_reported` (clamped to the window) through the window end.
    pub fn days_from(&self, first_reported: NaiveDate) -> u32 {
        let from = first_reported.max(self.start);
        if from > self.end {
            return 0;
        }
        ((self.end - from).num_days() + 1) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageviewSummary {
    pub total: u64,
    pub days_covered: u32,
    pub daily_avg: f64,
}

pub fn daily_average(total: u64, days: u32) -> f64 {
    if days == 0 {
        0.0
    } else {
        total as f64 / f64::from(days)
    }
}

/// Sum reported periods inside the window. Gaps count as zero views and
/// coverage starts at the first reported period.
pub fn summarize_pageviews(window: &PageviewWindow, periods: &[PeriodCount]) -> PageviewSummary {
    let in_window = periods
        .iter()
        .filter(|p| window.contains(p.period_start))
        .collect::<Vec<_>>();
    let total = in_window.iter().map(|p| p.views).sum::<u64>();
    let days_covered = in_window
        .iter()
        .map(|p| p.period_start)
        .min()
        .map(|first| window.days_from(first))
        .unwrap_or(0);
    PageviewSummary {
        total,
        days_covered,
        daily_avg: daily_average(total, days_covered),
    }
}

/// Traffic buckets used to group ranked listings, highest first.
pub const PAGEVIEW_BUCKETS: [(f64, &str); 7] = [
    (2000.0, ">2,000"),
    (1000.0, "1,000-2,000"),
    (500.0, "500-1,000"),
    (200.0, "200-500"),
    (100.0, "100-200"),
    (50.0, "50-100"),
    (0.0, "<50"),
];

pub fn pageview_bucket(avg_daily: f64) -> (usize, &'static str) {
    PAGEVIEW_BUCKETS
        .iter()
        .enumerate()
        .find(|(_, (lower, _))| avg_daily >= *lower)
        .map(|(idx, (_, label))| (idx, *label))
        .unwrap_or_else(|| {
            let last = PAGEVIEW_BUCKETS.len() - 1;
            (last, PAGEVIEW_BUCKETS[last].1)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn trailing_window_covers_previous_complete_months() {
        let window = PageviewWindow::trailing_months(d(2026, 10, 19), 12).unwrap();
        assert_eq!(window.start, d(2025, 10, 1));
        assert_eq!(window.end, d(2026, 9, 30));
        assert_eq!(window.days_from(window.start), 365);
    }

    #[test]
    fn daily_average_divides_by_covered_days() {
        assert_eq!(daily_average(3650, 365), 10.0);
        assert_eq!(daily_average(0, 0), 0.0);
        assert_eq!(daily_average(1234, 0), 0.0);
    }

    #[test]
    fn summary_treats_gaps_as_zero_and_starts_at_first_period() {
        let window = PageviewWindow {
            start: d(2025, 1, 1),
            end: d(2025, 3, 31),
        };
        // February missing: counted as zero, its days still covered.
        let periods = vec![
            PeriodCount {
                period_start: d(2025, 1, 1),
                views: 900,
            },
            PeriodCount {
                period_start: d(2025, 3, 1),
                views: 0,
            },
        ];
        let summary = summarize_pageviews(&window, &periods);
        assert_eq!(summary.total, 900);
        assert_eq!(summary.days_covered, 90);
        assert_eq!(summary.daily_avg, 10.0);

        let late = vec![PeriodCount {
            period_start: d(2025, 3, 1),
            views: 62,
        }];
        let summary = summarize_pageviews(&window, &late);
        assert_eq!(summary.days_covered, 31);
        assert_eq!(summary.daily_avg, 2.0);
    }

    #[test]
    fn empty_summary_has_zero_average() {
        let window = PageviewWindow {
            start: d(2025, 1, 1),
            end: d(2025, 12, 31),
        };
        let summary = summarize_pageviews(&window, &[]);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.days_covered, 0);
        assert_eq!(summary.daily_avg, 0.0);
    }

    #[test]
    fn status_transitions_follow_ledger_order() {
        use EnrichmentStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Complete));
        assert!(InProgress.can_transition_to(Failed));
        assert!(InProgress.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(InProgress));
        assert!(!Complete.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Complete));
    }

    #[test]
    fn entity_ids_sort_numerically() {
        let mut ids = vec!["Q30", "Q10", "Q2", "L5", "Q100"];
        ids.sort_by(|a, b| qid_sort_key(a).cmp(&qid_sort_key(b)));
        assert_eq!(ids, vec!["Q2", "Q10", "Q30", "Q100", "L5"]);
        assert_eq!(qid_number("Q28640"), Some(28640));
        assert_eq!(qid_number("Q"), None);
    }

    #[test]
    fn enums_round_trip_through_their_column_text() {
        for status in ReviewStatus::ALL {
            assert_eq!(status.as_str().parse::<ReviewStatus>().unwrap(), status);
        }
        assert!("needs_diverse_images".parse::<ReviewStatus>().is_err());
        assert_eq!(
            "in_progress".parse::<EnrichmentStatus>().unwrap(),
            EnrichmentStatus::InProgress
        );
        assert_eq!("job".parse::<Category>().unwrap(), Category::Job);
    }

    #[test]
    fn buckets_pick_highest_matching_lower_bound() {
        assert_eq!(pageview_bucket(2500.0).0, 0);
        assert_eq!(pageview_bucket(1000.0).0, 1);
        assert_eq!(pageview_bucket(75.5).1, "50-100");
        assert_eq!(pageview_bucket(0.0).1, "<50");
    }
}
