//! Process runner for submitted programs
//!
//! Each run gets a fresh scratch directory populated with the auxiliary
//! files. The child leads its own process group so a timeout can take down
//! everything it spawned.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use grader_common::ExecutionOutcome;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setpgid, Pid};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use walkdir::WalkDir;

const READ_CHUNK: usize = 8192;

/// Failures to set up or supervise a run; not outcomes of the program itself
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to prepare scratch directory: {0}")]
    Scratch(#[source] io::Error),

    #[error("Failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] io::Error),

    #[error("I/O error while supervising process: {0}")]
    Io(#[from] io::Error),
}

/// Which child stream is collected into the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capture {
    Stdout,
    Stderr,
    /// Nothing is captured; the program writes an output file instead
    Nothing,
}

/// Copy a file the program wrote out of the scratch directory after it exits
#[derive(Debug, Clone)]
pub struct SaveArtifact {
    pub file_name: String,
    pub destination: PathBuf,
}

/// One invocation of a program
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Argument vector; `args[0]` is the command
    pub args: Vec<String>,
    /// File fed to the child's stdin; `/dev/null` when absent
    pub stdin: Option<PathBuf>,
    pub capture: Capture,
    /// File receiving the captured bytes
    pub sink: Option<PathBuf>,
    pub time_limit: Duration,
    pub save_artifact: Option<SaveArtifact>,
}

/// Process runner
pub struct Executor {
    /// Compiled sources; non-interpreter commands must live here
    src_dir: PathBuf,
    /// Auxiliary files copied into every scratch directory
    aux_dir: PathBuf,
    interpreters: Vec<String>,
    capture_limit_bytes: u64,
}

impl Executor {
    pub fn new(
        src_dir: PathBuf,
        aux_dir: PathBuf,
        interpreters: Vec<String>,
        capture_limit_bytes: u64,
    ) -> Self {
        Self {
            src_dir,
            aux_dir,
            interpreters,
            capture_limit_bytes,
        }
    }

    /// Resolve a command to an executable path.
    ///
    /// Interpreters are looked up on PATH; anything else must name a file
    /// inside the sources directory.
    pub fn resolve(&self, command: &str) -> Option<PathBuf> {
        if self.interpreters.iter().any(|i| i == command) {
            return which::which(command).ok();
        }

        let relative = Path::new(command);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if command.is_empty() || escapes {
            return None;
        }

        let path = self.src_dir.join(relative);
        path.is_file().then_some(path)
    }

    /// Run one program to completion, deadline or output ceiling.
    pub async fn run(&self, request: &RunRequest) -> Result<ExecutionOutcome, RunnerError> {
        let Some(program) = request.args.first().and_then(|cmd| self.resolve(cmd)) else {
            tracing::debug!(args = ?request.args, "Command not found");
            return Ok(ExecutionOutcome::NonexistentExecutable);
        };

        let scratch = tempfile::Builder::new()
            .prefix("tester_")
            .tempdir()
            .map_err(RunnerError::Scratch)?;
        self.copy_aux_files(scratch.path()).await?;

        let outcome = self.supervise(&program, request, scratch.path()).await?;

        if let Some(artifact) = &request.save_artifact {
            if outcome != ExecutionOutcome::NonexistentExecutable {
                save_artifact(scratch.path(), artifact).await?;
            }
        }

        // Scratch directory is removed when `scratch` drops.
        Ok(outcome)
    }

    async fn copy_aux_files(&self, scratch: &Path) -> Result<(), RunnerError> {
        if !self.aux_dir.is_dir() {
            return Ok(());
        }

        for entry in WalkDir::new(&self.aux_dir).min_depth(1) {
            let entry = entry.map_err(|e| RunnerError::Scratch(e.into()))?;
            let Ok(relative) = entry.path().strip_prefix(&self.aux_dir) else {
                continue;
            };
            let target = scratch.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target)
                    .await
                    .map_err(RunnerError::Scratch)?;
            } else {
                fs::copy(entry.path(), &target)
                    .await
                    .map_err(RunnerError::Scratch)?;
            }
        }
        Ok(())
    }

    async fn supervise(
        &self,
        program: &Path,
        request: &RunRequest,
        scratch: &Path,
    ) -> Result<ExecutionOutcome, RunnerError> {
        let stdin = match &request.stdin {
            Some(path) => Stdio::from(std::fs::File::open(path).map_err(|source| {
                RunnerError::Open {
                    path: path.clone(),
                    source,
                }
            })?),
            None => Stdio::null(),
        };

        let piped = |wanted: Capture| {
            if request.capture == wanted {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };

        let mut command = Command::new(program);
        command
            .args(&request.args[1..])
            .current_dir(scratch)
            .stdin(stdin)
            .stdout(piped(Capture::Stdout))
            .stderr(piped(Capture::Stderr))
            .kill_on_drop(true);

        own_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                tracing::debug!(program = %program.display(), error = %e, "Program not runnable");
                return Ok(ExecutionOutcome::NonexistentExecutable);
            }
            Err(e) => return Err(RunnerError::Spawn(e)),
        };

        // Taken now: `child.id()` is gone once the leader has been reaped.
        let pgid = child.id().map(|id| Pid::from_raw(id as i32));
        let deadline = Instant::now() + request.time_limit;

        let reader: Option<Box<dyn AsyncRead + Unpin + Send>> = match request.capture {
            Capture::Stdout => child
                .stdout
                .take()
                .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
            Capture::Stderr => child
                .stderr
                .take()
                .map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
            Capture::Nothing => None,
        };

        if let Some(reader) = reader {
            let sink = request.sink.as_deref().ok_or_else(|| {
                RunnerError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "captured output needs a sink",
                ))
            })?;
            match self.pump(&mut child, pgid, reader, sink, deadline).await {
                Ok(None) => {}
                Ok(Some(outcome)) => return Ok(outcome),
                Err(e) => {
                    kill_group(pgid);
                    let _ = child.wait().await;
                    return Err(e);
                }
            }
        }

        let status = match timeout_at(deadline, child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Ok(time_out(&mut child, pgid).await),
        };
        // Anything the program left running in the background goes with it.
        kill_group(pgid);

        Ok(match status.signal() {
            Some(signum) => ExecutionOutcome::Signal { signum },
            None => ExecutionOutcome::Success {
                exit_code: status.code().unwrap_or(-1),
            },
        })
    }

    /// Copy the captured stream into the sink until EOF, the deadline or the
    /// ceiling; returns an outcome when the run ended early.
    async fn pump(
        &self,
        child: &mut Child,
        pgid: Option<Pid>,
        mut reader: Box<dyn AsyncRead + Unpin + Send>,
        sink: &Path,
        deadline: Instant,
    ) -> Result<Option<ExecutionOutcome>, RunnerError> {
        use tokio::io::AsyncReadExt;

        let mut out = fs::File::create(sink)
            .await
            .map_err(|source| RunnerError::Open {
                path: sink.to_path_buf(),
                source,
            })?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut written: u64 = 0;

        loop {
            let n = match timeout_at(deadline, reader.read(&mut buf)).await {
                Ok(read) => read?,
                Err(_) => {
                    out.flush().await?;
                    return Ok(Some(time_out(child, pgid).await));
                }
            };
            if n == 0 {
                break;
            }

            let room = self.capture_limit_bytes.saturating_sub(written);
            if n as u64 > room {
                out.write_all(&buf[..room as usize]).await?;
                out.flush().await?;
                kill_group(pgid);
                let _ = child.wait().await;
                tracing::debug!(limit = self.capture_limit_bytes, "Output ceiling reached");
                return Ok(Some(ExecutionOutcome::OutputLimitExceeded));
            }

            out.write_all(&buf[..n]).await?;
            written += n as u64;
        }

        out.flush().await?;
        Ok(None)
    }
}

/// Make the spawned command lead a new process group.
pub(crate) fn own_process_group(command: &mut Command) {
    // SAFETY: setpgid is async-signal-safe and touches no parent state.
    unsafe {
        command.pre_exec(|| setpgid(Pid::from_raw(0), Pid::from_raw(0)).map_err(io::Error::from));
    }
}

/// Kill a process group; it may already be gone.
pub(crate) fn kill_group(pgid: Option<Pid>) {
    let Some(pgid) = pgid else {
        return;
    };
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill process group"),
    }
}

async fn time_out(child: &mut Child, pgid: Option<Pid>) -> ExecutionOutcome {
    kill_group(pgid);
    if let Err(e) = child.wait().await {
        tracing::warn!(error = %e, "Failed to reap timed out process");
    }
    ExecutionOutcome::TimedOut
}

async fn save_artifact(scratch: &Path, artifact: &SaveArtifact) -> Result<(), RunnerError> {
    let source = scratch.join(&artifact.file_name);
    match fs::copy(&source, &artifact.destination).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(file = %artifact.file_name, "Program did not write its output file");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Whether the process recorded in `pid_file` has died (or is a zombie)
/// within a short grace period.
#[cfg(test)]
pub(crate) async fn recorded_process_gone(pid_file: &Path) -> bool {
    let pid = std::fs::read_to_string(pid_file).unwrap();
    let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
    for _ in 0..50 {
        let running = match std::fs::read_to_string(&stat) {
            Ok(content) => content
                .rsplit_once(')')
                .is_some_and(|(_, rest)| !rest.trim_start().starts_with('Z')),
            Err(_) => false,
        };
        if !running {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        root: TempDir,
        executor: Executor,
    }

    fn fixture(capture_limit_bytes: u64) -> Fixture {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::create_dir_all(root.path().join("execution_files")).unwrap();
        let executor = Executor::new(
            root.path().join("src"),
            root.path().join("execution_files"),
            vec!["sh".to_string()],
            capture_limit_bytes,
        );
        Fixture { root, executor }
    }

    fn shell(script: &str, sink: &Path) -> RunRequest {
        RunRequest {
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            stdin: None,
            capture: Capture::Stdout,
            sink: Some(sink.to_path_buf()),
            time_limit: Duration::from_secs(5),
            save_artifact: None,
        }
    }

    #[tokio::test]
    async fn test_success_keeps_output() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let outcome = f.executor.run(&shell("printf 'hello\\n'", &sink)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Success { exit_code: 0 });
        assert_eq!(std::fs::read(&sink).unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_exit_code() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let outcome = f.executor.run(&shell("exit 3", &sink)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Success { exit_code: 3 });
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let pid_file = f.root.path().join("background.pid");
        let script = format!(
            "echo started; sleep 5 >/dev/null 2>&1 & echo $! > {}; sleep 5",
            pid_file.display()
        );
        let mut request = shell(&script, &sink);
        request.time_limit = Duration::from_millis(300);

        let start = StdInstant::now();
        let outcome = f.executor.run(&request).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(std::fs::read(&sink).unwrap(), b"started\n");
        assert!(recorded_process_gone(&pid_file).await);
    }

    #[tokio::test]
    async fn test_background_process_killed_after_exit() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let pid_file = f.root.path().join("background.pid");
        let script = format!(
            "sleep 30 >/dev/null 2>&1 & echo $! > {}; echo done",
            pid_file.display()
        );
        let mut request = shell(&script, &sink);
        request.time_limit = Duration::from_secs(2);

        let outcome = f.executor.run(&request).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Success { exit_code: 0 });
        assert_eq!(std::fs::read(&sink).unwrap(), b"done\n");
        assert!(recorded_process_gone(&pid_file).await);
    }

    #[tokio::test]
    async fn test_signal_termination() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let outcome = f.executor.run(&shell("kill -SEGV $$", &sink)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Signal { signum: 11 });
    }

    #[tokio::test]
    async fn test_missing_command() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let request = RunRequest {
            args: vec!["a.out".to_string()],
            ..shell("", &sink)
        };
        let outcome = f.executor.run(&request).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::NonexistentExecutable);
        assert_eq!(outcome.extra(), None);
        assert!(!sink.exists());
    }

    #[tokio::test]
    async fn test_capture_ceiling() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let outcome = f.executor.run(&shell("yes", &sink)).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::OutputLimitExceeded);
        assert_eq!(std::fs::metadata(&sink).unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_stderr_capture_and_stdin() {
        let f = fixture(1024);
        let sink = f.root.path().join("out");
        let input = f.root.path().join("in");
        std::fs::write(&input, "abc").unwrap();

        let mut request = shell("cat 1>&2; echo ignored", &sink);
        request.capture = Capture::Stderr;
        request.stdin = Some(input);
        let outcome = f.executor.run(&request).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(std::fs::read(&sink).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_aux_files_and_artifact() {
        let f = fixture(1024);
        let aux = f.root.path().join("execution_files");
        std::fs::create_dir_all(aux.join("data")).unwrap();
        std::fs::write(aux.join("data/words.txt"), "alpha\n").unwrap();

        let destination = f.root.path().join("artifact");
        let request = RunRequest {
            capture: Capture::Nothing,
            sink: None,
            save_artifact: Some(SaveArtifact {
                file_name: "result.txt".to_string(),
                destination: destination.clone(),
            }),
            ..shell("cat data/words.txt > result.txt", Path::new("/dev/null"))
        };
        let outcome = f.executor.run(&request).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(std::fs::read(&destination).unwrap(), b"alpha\n");
    }

    #[test]
    fn test_resolve() {
        let f = fixture(1024);
        let program = f.root.path().join("src/prog");
        std::fs::write(&program, "#!/bin/sh\n").unwrap();

        assert_eq!(f.executor.resolve("prog"), Some(program));
        assert!(f.executor.resolve("missing").is_none());
        assert!(f.executor.resolve("../src/prog").is_none());
        assert!(f.executor.resolve("/bin/sh").is_none());
        assert!(f.executor.resolve("sh").is_some());
    }
}
