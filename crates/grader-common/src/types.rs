//! Common types used across the grading services.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::GraderError;

/// Submission ID type
pub type SubmissionId = u64;

/// Testable (build target) ID type
pub type TestableId = u64;

/// Test case ID type
pub type TestCaseId = u64;

/// Where a test case's output is collected from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    #[default]
    Stdout,
    Stderr,
    /// A file the program writes into its working directory
    File,
}

/// How the collected output is presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Diff,
    Image,
    Text,
}

/// One instructor-defined test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestCaseId,
    #[serde(default)]
    pub name: String,
    /// Argument vector; `args[0]` is the command
    #[serde(deserialize_with = "deserialize_args")]
    pub args: Vec<String>,
    /// File name inside the input fixtures directory
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub source: OutputSource,
    #[serde(default)]
    pub output_filename: Option<String>,
    #[serde(default)]
    pub output_type: OutputType,
    #[serde(default)]
    pub points: u32,
    #[serde(default)]
    pub hide_expected: bool,
}

impl TestCase {
    /// Check the fields that depend on each other
    pub fn validate(&self) -> Result<(), GraderError> {
        if self.args.is_empty() {
            return Err(GraderError::InvalidTestCase(format!(
                "test case {} has an empty command",
                self.id
            )));
        }
        if self.source == OutputSource::File && self.output_filename.is_none() {
            return Err(GraderError::InvalidTestCase(format!(
                "test case {} reads output from a file but names none",
                self.id
            )));
        }
        Ok(())
    }

    /// The command line as a single string, used for time limit lookups
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

/// Accepts either a JSON list of strings or a single command string.
fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Args {
        List(Vec<String>),
        Line(String),
    }

    Ok(match Args::deserialize(deserializer)? {
        Args::List(args) => args,
        Args::Line(line) => line.split_whitespace().map(str::to_owned).collect(),
    })
}

/// Status vocabulary of the results file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    NonexistentExecutable,
    Signal,
    TimedOut,
    OutputLimitExceeded,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::NonexistentExecutable => "nonexistent_executable",
            ExecutionStatus::Signal => "signal",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::OutputLimitExceeded => "output_limit_exceeded",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified result of running one test case's command.
///
/// Serialized as `{"status": ..., "extra": ...}` where `extra` is the exit
/// code for `success`, the signal number for `signal` and null otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "OutcomeRecord", try_from = "OutcomeRecord")]
pub enum ExecutionOutcome {
    Success { exit_code: i32 },
    NonexistentExecutable,
    Signal { signum: i32 },
    TimedOut,
    OutputLimitExceeded,
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Success { .. } => ExecutionStatus::Success,
            ExecutionOutcome::NonexistentExecutable => ExecutionStatus::NonexistentExecutable,
            ExecutionOutcome::Signal { .. } => ExecutionStatus::Signal,
            ExecutionOutcome::TimedOut => ExecutionStatus::TimedOut,
            ExecutionOutcome::OutputLimitExceeded => ExecutionStatus::OutputLimitExceeded,
        }
    }

    pub fn extra(&self) -> Option<i32> {
        match self {
            ExecutionOutcome::Success { exit_code } => Some(*exit_code),
            ExecutionOutcome::Signal { signum } => Some(*signum),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.extra() {
            Some(extra) => write!(f, "{}({})", self.status(), extra),
            None => write!(f, "{}", self.status()),
        }
    }
}

/// Wire form of an [`ExecutionOutcome`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutcomeRecord {
    status: ExecutionStatus,
    #[serde(default)]
    extra: Option<i32>,
}

impl From<ExecutionOutcome> for OutcomeRecord {
    fn from(outcome: ExecutionOutcome) -> Self {
        OutcomeRecord {
            status: outcome.status(),
            extra: outcome.extra(),
        }
    }
}

impl TryFrom<OutcomeRecord> for ExecutionOutcome {
    type Error = String;

    fn try_from(record: OutcomeRecord) -> Result<Self, Self::Error> {
        Ok(match (record.status, record.extra) {
            (ExecutionStatus::Success, Some(exit_code)) => ExecutionOutcome::Success { exit_code },
            (ExecutionStatus::Success, None) => return Err("success without exit code".into()),
            (ExecutionStatus::Signal, Some(signum)) => ExecutionOutcome::Signal { signum },
            (ExecutionStatus::Signal, None) => return Err("signal without signal number".into()),
            (ExecutionStatus::NonexistentExecutable, _) => ExecutionOutcome::NonexistentExecutable,
            (ExecutionStatus::TimedOut, _) => ExecutionOutcome::TimedOut,
            (ExecutionStatus::OutputLimitExceeded, _) => ExecutionOutcome::OutputLimitExceeded,
        })
    }
}

/// Test case id to outcome, written once per job
pub type ResultsMap = BTreeMap<TestCaseId, ExecutionOutcome>;

/// Job pulled from the work queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub submission_id: SubmissionId,
    pub testable_id: TestableId,
}

impl JobMessage {
    /// Key echoed into handoff messages and expected inside sentinel files
    pub fn key(&self) -> String {
        format!("{}.{}", self.submission_id, self.testable_id)
    }
}

/// Request for the external sync agent to move files for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffMessage {
    /// Sentinel file the agent writes once it is done
    pub complete_file: String,
    /// Worker's working directory
    pub remote_dir: String,
    pub user: String,
    pub host: String,
    pub submission_id: SubmissionId,
    pub testable_id: TestableId,
}
