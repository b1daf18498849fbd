//! Verdicts: correctness and human-readable reasons for one test case.

use grader_common::{ExecutionOutcome, TestCase, TestCaseId};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::diff::{self, DiffModel};

pub const PRODUCED_UNEXPECTED_OUTPUT: &str = "You produced output, but the correct solution did not";
pub const PRODUCED_NO_OUTPUT: &str = "You produced no output";
pub const MISSING_TRAILING_NEWLINE: &str = "Your output is missing the final newline";
pub const EXTRA_TRAILING_NEWLINE: &str = "Your output ends with a newline the correct solution does not have";
pub const OUTPUT_MISMATCH: &str = "Your output did not match the expected output";

/// Expected output compared against what the program produced.
///
/// Holds the facts the reasons are derived from; can be stored and reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comparison {
    expected_empty: bool,
    actual_empty: bool,
    /// Texts agree once one trailing newline is stripped from each
    newline_only: bool,
    expected_newline: bool,
    diff: Option<DiffModel>,
}

impl Comparison {
    pub fn new(expected: &[u8], actual: &[u8]) -> Self {
        let strip = |s: &[u8]| s.strip_suffix(b"\n").unwrap_or(s).to_vec();
        let expected_newline = expected.ends_with(b"\n");
        let actual_newline = actual.ends_with(b"\n");
        Self {
            expected_empty: expected.is_empty(),
            actual_empty: actual.is_empty(),
            newline_only: expected_newline != actual_newline && strip(expected) == strip(actual),
            expected_newline,
            diff: diff::compute_bytes(expected, actual),
        }
    }

    pub fn outputs_match(&self) -> bool {
        self.diff.is_none()
    }

    pub fn diff(&self) -> Option<&DiffModel> {
        self.diff.as_ref()
    }

    /// Content reason, first applicable only
    fn wrong_thing(&self) -> Option<&'static str> {
        if self.outputs_match() {
            None
        } else if self.expected_empty && !self.actual_empty {
            Some(PRODUCED_UNEXPECTED_OUTPUT)
        } else if self.actual_empty && !self.expected_empty {
            Some(PRODUCED_NO_OUTPUT)
        } else if self.newline_only {
            Some(if self.expected_newline {
                MISSING_TRAILING_NEWLINE
            } else {
                EXTRA_TRAILING_NEWLINE
            })
        } else {
            Some(OUTPUT_MISMATCH)
        }
    }

    /// A table is worth drawing when some row differs and both sides have
    /// content; empty-vs-something is already covered by its reason.
    fn should_show_table(&self) -> bool {
        self.diff.as_ref().is_some_and(DiffModel::has_changes)
            && !self.expected_empty
            && !self.actual_empty
    }
}

/// Reasons derived from how the program terminated.
///
/// Any of these faults makes content comparison meaningless, so they are
/// reported alone.
fn outcome_faults(outcome: &ExecutionOutcome) -> Option<String> {
    match outcome {
        ExecutionOutcome::NonexistentExecutable => {
            Some("The executable was not produced by the build".to_string())
        }
        ExecutionOutcome::Signal { signum } => Some(match Signal::try_from(*signum) {
            Ok(signal) => format!(
                "Your program was terminated by signal {signum} ({})",
                signal.as_str()
            ),
            Err(_) => format!("Your program was terminated by signal {signum}"),
        }),
        ExecutionOutcome::TimedOut => Some("Your program timed out".to_string()),
        ExecutionOutcome::OutputLimitExceeded => {
            Some("Your program produced too much output (or none where a file was expected)".to_string())
        }
        ExecutionOutcome::Success { .. } => None,
    }
}

/// Final judgment for one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub test_case_id: TestCaseId,
    pub name: String,
    pub points: u32,
    pub wrong_things: Vec<String>,
    pub show_table: bool,
    pub diff: Option<DiffModel>,
}

impl Verdict {
    /// Correct iff nothing was found wrong
    pub fn is_correct(&self) -> bool {
        self.wrong_things.is_empty()
    }
}

/// Derive the verdict for one test case.
///
/// `comparison` is absent when no output could be compared at all (for
/// instance the output file was never written).
pub fn present(
    test_case: &TestCase,
    comparison: Option<Comparison>,
    outcome: &ExecutionOutcome,
) -> Verdict {
    let mut wrong_things = Vec::new();
    let mut show_table = false;

    if let Some(fault) = outcome_faults(outcome) {
        wrong_things.push(fault);
        // Partial output of a crashed or timed-out run is still worth showing.
        show_table = !matches!(outcome, ExecutionOutcome::NonexistentExecutable)
            && comparison.as_ref().is_some_and(Comparison::should_show_table);
    } else {
        match comparison.as_ref() {
            Some(comparison) => {
                wrong_things.extend(comparison.wrong_thing().map(str::to_string));
                show_table = comparison.should_show_table();
            }
            None => wrong_things.push(PRODUCED_NO_OUTPUT.to_string()),
        }
        if let ExecutionOutcome::Success { exit_code } = outcome {
            if *exit_code != 0 {
                wrong_things.push(format!("Your program terminated with exit code {exit_code}"));
            }
        }
    }

    Verdict {
        test_case_id: test_case.id,
        name: test_case.name.clone(),
        points: test_case.points,
        wrong_things,
        show_table: show_table && !test_case.hide_expected,
        diff: comparison.and_then(|c| c.diff),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grader_common::{OutputSource, OutputType};

    fn test_case(hide_expected: bool) -> TestCase {
        TestCase {
            id: 1,
            name: "echo".to_string(),
            args: vec!["a.out".to_string()],
            stdin: None,
            source: OutputSource::Stdout,
            output_filename: None,
            output_type: OutputType::Diff,
            points: 5,
            hide_expected,
        }
    }

    const OK: ExecutionOutcome = ExecutionOutcome::Success { exit_code: 0 };

    fn verdict(expected: &str, actual: &str) -> Verdict {
        let comparison = Comparison::new(expected.as_bytes(), actual.as_bytes());
        present(&test_case(false), Some(comparison), &OK)
    }

    #[test]
    fn test_identical_output_is_correct() {
        let v = verdict("a\nb\n", "a\nb\n");
        assert!(v.is_correct());
        assert!(v.wrong_things.is_empty());
        assert!(!v.show_table);
        assert!(v.diff.is_none());
    }

    #[test]
    fn test_unexpected_output() {
        let v = verdict("", "x");
        assert!(!v.is_correct());
        assert_eq!(v.wrong_things, vec![PRODUCED_UNEXPECTED_OUTPUT]);
        assert!(!v.show_table);
    }

    #[test]
    fn test_no_output() {
        let v = verdict("hello\n", "");
        assert_eq!(v.wrong_things, vec![PRODUCED_NO_OUTPUT]);
        assert!(!v.show_table);
    }

    #[test]
    fn test_trailing_newline_mismatch() {
        let v = verdict("a\nb\n", "a\nb");
        assert_eq!(v.wrong_things, vec![MISSING_TRAILING_NEWLINE]);

        let v = verdict("a\nb", "a\nb\n");
        assert_eq!(v.wrong_things, vec![EXTRA_TRAILING_NEWLINE]);
    }

    #[test]
    fn test_generic_mismatch_shows_table() {
        let v = verdict("1\n2\n", "1\n3\n");
        assert_eq!(v.wrong_things, vec![OUTPUT_MISMATCH]);
        assert!(v.show_table);
    }

    #[test]
    fn test_outcome_faults_are_exclusive() {
        let comparison = Comparison::new(b"1\n", b"2\n");
        let v = present(&test_case(false), Some(comparison), &ExecutionOutcome::TimedOut);
        assert_eq!(v.wrong_things, vec!["Your program timed out"]);
        assert!(v.show_table);

        let comparison = Comparison::new(b"1\n", b"");
        let v = present(
            &test_case(false),
            Some(comparison),
            &ExecutionOutcome::NonexistentExecutable,
        );
        assert_eq!(v.wrong_things.len(), 1);
        assert!(!v.show_table);
    }

    #[test]
    fn test_signal_reason_names_signal() {
        let v = present(&test_case(false), None, &ExecutionOutcome::Signal { signum: 11 });
        assert_eq!(
            v.wrong_things,
            vec!["Your program was terminated by signal 11 (SIGSEGV)"]
        );
    }

    #[test]
    fn test_nonzero_exit_is_reported_after_content() {
        let comparison = Comparison::new(b"ok\n", b"ok\n");
        let v = present(
            &test_case(false),
            Some(comparison),
            &ExecutionOutcome::Success { exit_code: 3 },
        );
        assert_eq!(v.wrong_things, vec!["Your program terminated with exit code 3"]);
    }

    #[test]
    fn test_hidden_expected_output_never_shows_table() {
        let comparison = Comparison::new(b"1\n", b"2\n");
        let v = present(&test_case(true), Some(comparison), &OK);
        assert!(!v.is_correct());
        assert!(!v.show_table);
    }

    #[test]
    fn test_missing_comparison_is_wrong() {
        let v = present(&test_case(false), None, &OK);
        assert_eq!(v.wrong_things, vec![PRODUCED_NO_OUTPUT]);
    }
}
