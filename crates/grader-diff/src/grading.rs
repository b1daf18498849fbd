//! Turn a worker's results directory into verdicts.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use grader_common::{GraderError, GraderResult, OutputType, ResultsMap, TestCase, TestCaseId};
use tracing::{debug, warn};

use crate::verdict::{present, Comparison, Verdict};

/// File holding the output of one test case, both for expected and actual.
pub fn output_path(dir: &Path, id: TestCaseId) -> PathBuf {
    dir.join(format!("tc_{id}"))
}

fn read_optional(path: &Path) -> GraderResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Grade every test case that has an outcome in `results`.
///
/// Expected outputs live in `expected_dir/tc_<id>`, produced outputs in
/// `results_dir/tc_<id>`. Test cases without an outcome are skipped.
pub fn grade_results(
    test_cases: &[TestCase],
    expected_dir: &Path,
    results_dir: &Path,
    results: &ResultsMap,
) -> GraderResult<Vec<Verdict>> {
    let mut verdicts = Vec::with_capacity(test_cases.len());

    for test_case in test_cases {
        let Some(outcome) = results.get(&test_case.id) else {
            warn!(test_case_id = test_case.id, "No outcome recorded; skipping");
            continue;
        };

        let expected = read_optional(&output_path(expected_dir, test_case.id))?.ok_or_else(|| {
            GraderError::InvalidTestCase(format!(
                "test case {} has no expected output",
                test_case.id
            ))
        })?;
        let actual = read_optional(&output_path(results_dir, test_case.id))?;

        let comparison = actual.map(|actual| Comparison::new(&expected, &actual));
        let mut verdict = present(test_case, comparison, outcome);

        // Only textual diffs get a table; images and plain text are compared whole.
        if test_case.output_type != OutputType::Diff {
            verdict.show_table = false;
            verdict.diff = None;
        }

        debug!(
            test_case_id = test_case.id,
            outcome = %outcome,
            correct = verdict.is_correct(),
            "Graded test case"
        );
        verdicts.push(verdict);
    }

    Ok(verdicts)
}
