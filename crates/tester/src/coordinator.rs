//! Job coordinator
//!
//! Drives one job through `received -> files_synced -> built -> tested ->
//! results_reported`. File movement is done by an external sync agent: the
//! coordinator publishes a handoff and waits for the agent's sentinel file,
//! whose content must be the job key.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use grader_common::{GraderError, GraderResult, HandoffMessage, JobMessage, ResultsMap};
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};
use walkdir::WalkDir;

use crate::config::{ExecutionConfig, QueueConfig, StorageConfig};
use crate::executor::{self, Executor};
use crate::layout::WorkLayout;
use crate::metrics::BUILD_FAILURES;
use crate::queue::HandoffPublisher;
use crate::testcase::{self, TestCaseDriver};

/// Sentinel written by the sync agent once a job's files are in place
pub const SYNC_SENTINEL: &str = "sync_files";

/// Sentinel written by the sync agent once it collected the results
pub const FETCH_SENTINEL: &str = "results_fetched";

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    FilesSynced,
    Built,
    Tested,
    ResultsReported,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Received => "received",
            JobState::FilesSynced => "files_synced",
            JobState::Built => "built",
            JobState::Tested => "tested",
            JobState::ResultsReported => "results_reported",
        })
    }
}

/// Who the sync agent should connect to
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub user: String,
    pub host: String,
}

impl WorkerIdentity {
    /// Current user and host name
    pub fn detect() -> Self {
        let user = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| "unknown".to_string());
        let host = nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        Self { user, host }
    }
}

/// Runs jobs in one working directory
pub struct JobCoordinator<P> {
    layout: WorkLayout,
    execution: ExecutionConfig,
    queue: QueueConfig,
    identity: WorkerIdentity,
    executor: Executor,
    publisher: P,
}

impl<P: HandoffPublisher> JobCoordinator<P> {
    pub fn new(
        storage: &StorageConfig,
        execution: ExecutionConfig,
        queue: QueueConfig,
        identity: WorkerIdentity,
        publisher: P,
    ) -> Self {
        let layout = WorkLayout::new(&storage.working_dir);
        let executor = Executor::new(
            layout.src(),
            layout.execution_files(),
            execution.interpreters.clone(),
            execution.capture_limit_bytes,
        );
        Self {
            layout,
            execution,
            queue,
            identity,
            executor,
            publisher,
        }
    }

    /// Process one job; job-level faults are returned to the caller.
    pub async fn process(&self, job: &JobMessage) -> GraderResult<ResultsMap> {
        let key = job.key();
        tracing::info!(job = %key, state = %JobState::Received, "Got job");
        self.clean_working_dir().await?;

        self.handoff(&self.queue.sync_stream, SYNC_SENTINEL, job).await?;
        tracing::info!(job = %key, state = %JobState::FilesSynced, "Files synced");

        fs::create_dir_all(self.layout.results()).await?;
        let test_cases = testcase::load_test_cases(&self.layout).await?;

        let results = match self.build().await {
            Ok(()) => {
                tracing::info!(job = %key, state = %JobState::Built, "Build finished");
                TestCaseDriver::new(&self.executor, &self.execution, &self.layout)
                    .run_all(&test_cases)
                    .await
            }
            Err(e) if !e.is_fatal() => {
                BUILD_FAILURES.inc();
                tracing::warn!(job = %key, error = %e, "Build failed; no test case can run");
                testcase::unbuilt_results(&test_cases)
            }
            Err(e) => return Err(e),
        };

        testcase::write_results(&self.layout, &results).await?;
        tracing::info!(
            job = %key,
            state = %JobState::Tested,
            test_cases = results.len(),
            "Results written"
        );

        self.handoff(&self.queue.fetch_stream, FETCH_SENTINEL, job).await?;
        tracing::info!(job = %key, state = %JobState::ResultsReported, "Results fetched");

        Ok(results)
    }

    /// Remove everything left in the working directory by the previous job
    async fn clean_working_dir(&self) -> GraderResult<()> {
        let root = self.layout.root();
        fs::create_dir_all(root).await?;

        for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if entry.file_type().is_dir() {
                fs::remove_dir_all(entry.path()).await?;
            } else {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn handoff(&self, queue: &str, complete_file: &str, job: &JobMessage) -> GraderResult<()> {
        let message = HandoffMessage {
            complete_file: complete_file.to_string(),
            remote_dir: self.layout.root().display().to_string(),
            user: self.identity.user.clone(),
            host: self.identity.host.clone(),
            submission_id: job.submission_id,
            testable_id: job.testable_id,
        };
        self.publisher.publish(queue, &message).await?;
        self.wait_for_sentinel(complete_file, &job.key()).await
    }

    /// Poll for a sentinel file and check it names this job
    async fn wait_for_sentinel(&self, name: &str, expected: &str) -> GraderResult<()> {
        let path = self.layout.sentinel(name);
        let start = Instant::now();

        loop {
            match fs::read_to_string(&path).await {
                Ok(content) => {
                    let found = content.trim_end_matches(['\n', '\r']);
                    if found != expected {
                        return Err(GraderError::JobIntegrityFault {
                            file: name.to_string(),
                            expected: expected.to_string(),
                            found: found.to_string(),
                        });
                    }
                    tracing::debug!(
                        sentinel = name,
                        waited_ms = start.elapsed().as_millis() as u64,
                        "Sentinel found"
                    );
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= self.queue.sentinel_timeout {
                return Err(GraderError::SentinelTimeout {
                    file: name.to_string(),
                    waited_secs: start.elapsed().as_secs(),
                });
            }
            sleep(self.queue.sentinel_poll).await;
        }
    }

    /// Run the build command if the job ships a Makefile
    async fn build(&self) -> GraderResult<()> {
        if !self.layout.makefile().is_file() {
            return Ok(());
        }
        let Some((program, args)) = self.execution.build_command.split_first() else {
            return Ok(());
        };

        let log = std::fs::File::create(self.layout.build_log())?;
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(self.layout.root())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);
        executor::own_process_group(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| GraderError::BuildFailure(format!("could not start {program}: {e}")))?;
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));

        let limit = Duration::from_secs(self.execution.build_timeout_secs);
        let status = match timeout(limit, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                executor::kill_group(pgid);
                if let Err(e) = child.wait().await {
                    tracing::warn!(error = %e, "Failed to reap timed out build");
                }
                return Err(GraderError::BuildFailure(format!(
                    "build timed out after {}s",
                    limit.as_secs()
                )));
            }
        };
        executor::kill_group(pgid);

        if status.success() {
            Ok(())
        } else {
            Err(GraderError::BuildFailure(format!("build exited with {status}")))
        }
    }
}
