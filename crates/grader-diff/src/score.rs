//! Score rollup over a set of verdicts.

use serde::{Deserialize, Serialize};

use crate::verdict::Verdict;

/// Totals shown next to the diff report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub available: u32,
    pub achieved: u32,
    /// 0 when nothing is available
    pub percentage: f64,
}

/// Pluggable scoring policy.
///
/// The defaults total each verdict's points and award them when the verdict
/// is correct.
pub trait ScorePolicy {
    /// Points a single verdict is worth
    fn points_for(&self, verdict: &Verdict) -> u32 {
        verdict.points
    }

    fn total_available(&self, verdicts: &[Verdict]) -> u32 {
        verdicts.iter().map(|v| self.points_for(v)).sum()
    }

    fn total_achieved(&self, verdicts: &[Verdict]) -> u32 {
        verdicts
            .iter()
            .filter(|v| v.is_correct())
            .map(|v| self.points_for(v))
            .sum()
    }

    fn percentage(&self, verdicts: &[Verdict]) -> f64 {
        let available = self.total_available(verdicts);
        if available == 0 {
            0.0
        } else {
            f64::from(self.total_achieved(verdicts)) / f64::from(available) * 100.0
        }
    }

    fn summarize(&self, verdicts: &[Verdict]) -> ScoreSummary {
        ScoreSummary {
            available: self.total_available(verdicts),
            achieved: self.total_achieved(verdicts),
            percentage: self.percentage(verdicts),
        }
    }
}

/// Sum of the verdicts' own points
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicScore;

impl ScorePolicy for BasicScore {}

/// Adds points lost outside the diffs (e.g. manual grading) to the total
#[derive(Debug, Clone, Copy)]
pub struct ScoreWithExtraMissing {
    pub points_missing: u32,
}

impl ScorePolicy for ScoreWithExtraMissing {
    fn total_available(&self, verdicts: &[Verdict]) -> u32 {
        BasicScore.total_available(verdicts) + self.points_missing
    }
}

/// Uses a fixed total regardless of the verdicts
#[derive(Debug, Clone, Copy)]
pub struct ScoreWithSetTotal {
    pub total: u32,
}

impl ScorePolicy for ScoreWithSetTotal {
    fn total_available(&self, _verdicts: &[Verdict]) -> u32 {
        self.total
    }
}

/// Summarize with [`BasicScore`]
pub fn summarize(verdicts: &[Verdict]) -> ScoreSummary {
    BasicScore.summarize(verdicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(points: u32, correct: bool) -> Verdict {
        Verdict {
            test_case_id: u64::from(points),
            name: String::new(),
            points,
            wrong_things: if correct {
                Vec::new()
            } else {
                vec!["wrong".to_string()]
            },
            show_table: false,
            diff: None,
        }
    }

    #[test]
    fn test_empty_summary_is_zero() {
        let summary = summarize(&[]);
        assert_eq!(summary.available, 0);
        assert_eq!(summary.achieved, 0);
        assert_eq!(summary.percentage, 0.0);
    }

    #[test]
    fn test_basic_score() {
        let verdicts = [verdict(3, true), verdict(1, false)];
        let summary = summarize(&verdicts);
        assert_eq!(summary.available, 4);
        assert_eq!(summary.achieved, 3);
        assert_eq!(summary.percentage, 75.0);
    }

    #[test]
    fn test_extra_missing_points() {
        let verdicts = [verdict(2, true), verdict(2, true)];
        let summary = ScoreWithExtraMissing { points_missing: 4 }.summarize(&verdicts);
        assert_eq!(summary.available, 8);
        assert_eq!(summary.achieved, 4);
        assert_eq!(summary.percentage, 50.0);
    }

    #[test]
    fn test_set_total() {
        let verdicts = [verdict(5, true)];
        let summary = ScoreWithSetTotal { total: 20 }.summarize(&verdicts);
        assert_eq!(summary.available, 20);
        assert_eq!(summary.percentage, 25.0);

        let summary = ScoreWithSetTotal { total: 0 }.summarize(&verdicts);
        assert_eq!(summary.percentage, 0.0);
    }
}
