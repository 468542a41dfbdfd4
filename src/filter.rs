#![forbid(unsafe_code)]

//! Candidate filtering by popularity and length.

use serde::{Deserialize, Serialize};

use crate::model::CandidateItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterThresholds {
    pub min_view_count: u64,
    pub max_duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    pub accepted: bool,
    pub reasons: Vec<String>,
}

impl FilterThresholds {
    pub fn accepts(&self, item: &CandidateItem) -> bool {
        item.view_count >= self.min_view_count && item.duration_secs <= self.max_duration_secs
    }

    /// Same decision as [`accepts`](Self::accepts), with the reasons spelled out.
    pub fn evaluate(&self, item: &CandidateItem) -> FilterResult {
        let mut reasons = Vec::new();
        if item.view_count < self.min_view_count {
            reasons.push(format!(
                "view count {} below minimum {}",
                item.view_count, self.min_view_count
            ));
        }
        if item.duration_secs > self.max_duration_secs {
            reasons.push(format!(
                "duration {}s above maximum {}s",
                item.duration_secs, self.max_duration_secs
            ));
        }
        FilterResult {
            accepted: reasons.is_empty(),
            reasons,
        }
    }

    pub fn apply(&self, items: Vec<CandidateItem>) -> Vec<CandidateItem> {
        items
            .into_iter()
            .filter(|item| {
                let verdict = self.evaluate(item);
                if !verdict.accepted {
                    log::debug!("Rejected {}: {}", item.id, verdict.reasons.join("; "));
                }
                verdict.accepted
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_item;
    use std::collections::HashSet;

    const THRESHOLDS: FilterThresholds = FilterThresholds {
        min_view_count: 500,
        max_duration_secs: 600,
    };

    #[test]
    fn boundaries_are_inclusive() {
        assert!(THRESHOLDS.accepts(&sample_item("BV1aa411c7aa", 500, 600)));
        assert!(!THRESHOLDS.accepts(&sample_item("BV1aa411c7aa", 499, 600)));
        assert!(!THRESHOLDS.accepts(&sample_item("BV1aa411c7aa", 500, 601)));
    }

    #[test]
    fn evaluate_lists_every_reason() {
        let verdict = THRESHOLDS.evaluate(&sample_item("BV1aa411c7aa", 10, 900));
        assert!(!verdict.accepted);
        assert_eq!(verdict.reasons.len(), 2);
        assert!(verdict.reasons[0].contains("view count 10"));
        assert!(verdict.reasons[1].contains("900s"));
    }

    #[test]
    fn stricter_thresholds_accept_a_subset() {
        let candidates: Vec<_> = [0u64, 499, 500, 501, 10_000]
            .into_iter()
            .flat_map(|views| {
                [0u64, 300, 599, 600, 601].into_iter().map(move |duration| {
                    sample_item(&format!("BV{views}x{duration}"), views, duration)
                })
            })
            .collect();
        let accepted_ids = |thresholds: FilterThresholds| -> HashSet<String> {
            thresholds
                .apply(candidates.clone())
                .into_iter()
                .map(|item| item.id)
                .collect()
        };

        let base = accepted_ids(THRESHOLDS);
        for min_view_count in [500, 501, 10_000, 10_001] {
            let raised = accepted_ids(FilterThresholds {
                min_view_count,
                ..THRESHOLDS
            });
            assert!(raised.is_subset(&base), "min_view_count {min_view_count}");
        }
        for max_duration_secs in [600, 599, 300, 0] {
            let lowered = accepted_ids(FilterThresholds {
                max_duration_secs,
                ..THRESHOLDS
            });
            assert!(lowered.is_subset(&base), "max_duration_secs {max_duration_secs}");
        }
        let both = accepted_ids(FilterThresholds {
            min_view_count: 10_000,
            max_duration_secs: 300,
        });
        assert!(both.is_subset(&base));
        assert!(both.len() < base.len());
    }

    #[test]
    fn apply_keeps_only_accepted() {
        let kept = THRESHOLDS.apply(vec![
            sample_item("BV1aa411c7aa", 1000, 60),
            sample_item("BV1bb411c7bb", 10, 60),
            sample_item("BV1cc411c7cc", 1000, 6000),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "BV1aa411c7aa");
    }
}
