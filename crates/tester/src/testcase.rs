//! Test case driver: runs every test case of a job and collects outcomes

use std::time::Instant;

use grader_common::{
    ExecutionOutcome, GraderResult, OutputSource, OutputType, ResultsMap, TestCase,
};
use tokio::fs;

use crate::config::ExecutionConfig;
use crate::executor::{Capture, Executor, RunRequest, SaveArtifact};
use crate::layout::WorkLayout;
use crate::metrics;

/// Load the test case definitions file
pub async fn load_test_cases(layout: &WorkLayout) -> GraderResult<Vec<TestCase>> {
    let path = layout.test_cases();
    if !path.exists() {
        tracing::info!("No test cases delivered");
        return Ok(Vec::new());
    }
    let content = fs::read(&path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Write the results map where the sync agent collects it
pub async fn write_results(layout: &WorkLayout, results: &ResultsMap) -> GraderResult<()> {
    fs::create_dir_all(layout.results()).await?;
    let json = serde_json::to_vec(results)?;
    fs::write(layout.results_file(), json).await?;
    Ok(())
}

/// Results for a job whose build failed
pub fn unbuilt_results(test_cases: &[TestCase]) -> ResultsMap {
    test_cases
        .iter()
        .map(|tc| (tc.id, ExecutionOutcome::NonexistentExecutable))
        .collect()
}

/// Runs test cases one after another
pub struct TestCaseDriver<'a> {
    executor: &'a Executor,
    execution: &'a ExecutionConfig,
    layout: &'a WorkLayout,
}

impl<'a> TestCaseDriver<'a> {
    pub fn new(executor: &'a Executor, execution: &'a ExecutionConfig, layout: &'a WorkLayout) -> Self {
        Self {
            executor,
            execution,
            layout,
        }
    }

    /// Run every test case; a fault in one never stops the others.
    pub async fn run_all(&self, test_cases: &[TestCase]) -> ResultsMap {
        let mut results = ResultsMap::new();

        for test_case in test_cases {
            let start = Instant::now();
            let outcome = self.run_one(test_case).await;
            let elapsed = start.elapsed().as_secs_f64();

            metrics::record_outcome(outcome.status().as_str(), elapsed);
            tracing::debug!(
                test_case_id = test_case.id,
                outcome = %outcome,
                elapsed_secs = elapsed,
                "Test case finished"
            );
            results.insert(test_case.id, outcome);
        }

        results
    }

    async fn run_one(&self, test_case: &TestCase) -> ExecutionOutcome {
        if let Err(e) = test_case.validate() {
            tracing::error!(test_case_id = test_case.id, error = %e, "Skipping test case");
            return ExecutionOutcome::NonexistentExecutable;
        }

        let output_file = self.layout.output_file(test_case.id);
        let (capture, save_artifact) = match test_case.source {
            OutputSource::Stdout => (Capture::Stdout, None),
            OutputSource::Stderr => (Capture::Stderr, None),
            OutputSource::File => (
                Capture::Nothing,
                test_case.output_filename.clone().map(|file_name| SaveArtifact {
                    file_name,
                    destination: output_file.clone(),
                }),
            ),
        };

        let request = RunRequest {
            args: test_case.args.clone(),
            stdin: test_case.stdin.as_ref().map(|name| self.layout.input().join(name)),
            capture,
            sink: Some(output_file.clone()),
            time_limit: self.execution.time_limit_for(&test_case.command_line()),
            save_artifact,
        };

        let outcome = match self.executor.run(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(test_case_id = test_case.id, error = %e, "Could not run test case");
                return ExecutionOutcome::NonexistentExecutable;
            }
        };

        if outcome == ExecutionOutcome::NonexistentExecutable {
            return outcome;
        }

        let cap = match test_case.output_type {
            OutputType::Image => self.execution.image_truncate_bytes,
            OutputType::Diff | OutputType::Text => self.execution.output_truncate_bytes,
        };

        match self.enforce_cap(&output_file, cap).await {
            Ok(OutputState::Fits) => outcome,
            Ok(OutputState::Missing | OutputState::Truncated) if outcome.is_success() => {
                ExecutionOutcome::OutputLimitExceeded
            }
            Ok(_) => outcome,
            Err(e) => {
                tracing::error!(test_case_id = test_case.id, error = %e, "Failed to check output file");
                outcome
            }
        }
    }

    /// Truncate the output file in place when it exceeds `cap`
    async fn enforce_cap(&self, path: &std::path::Path, cap: u64) -> std::io::Result<OutputState> {
        let len = match fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(OutputState::Missing),
            Err(e) => return Err(e),
        };
        if len <= cap {
            return Ok(OutputState::Fits);
        }

        let file = fs::OpenOptions::new().write(true).open(path).await?;
        file.set_len(cap).await?;
        tracing::debug!(path = %path.display(), len, cap, "Truncated output");
        Ok(OutputState::Truncated)
    }
}

enum OutputState {
    Fits,
    Missing,
    Truncated,
}
