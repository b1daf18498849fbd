//! Fixed layout of a job's working directory

use std::path::{Path, PathBuf};

use grader_common::TestCaseId;

pub const SRC_PATH: &str = "src";
pub const INPUT_PATH: &str = "input";
pub const EXECUTION_FILES_PATH: &str = "execution_files";
pub const RESULTS_PATH: &str = "results";

/// Paths inside one working directory
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compiled sources
    pub fn src(&self) -> PathBuf {
        self.root.join(SRC_PATH)
    }

    /// Stdin fixtures
    pub fn input(&self) -> PathBuf {
        self.root.join(INPUT_PATH)
    }

    /// Auxiliary files copied into every scratch directory
    pub fn execution_files(&self) -> PathBuf {
        self.root.join(EXECUTION_FILES_PATH)
    }

    pub fn results(&self) -> PathBuf {
        self.root.join(RESULTS_PATH)
    }

    /// Test case definitions delivered with the job
    pub fn test_cases(&self) -> PathBuf {
        self.root.join("test_cases")
    }

    pub fn makefile(&self) -> PathBuf {
        self.root.join("Makefile")
    }

    pub fn build_log(&self) -> PathBuf {
        self.results().join("make")
    }

    pub fn results_file(&self) -> PathBuf {
        self.results().join("test_cases")
    }

    pub fn output_file(&self, id: TestCaseId) -> PathBuf {
        self.results().join(format!("tc_{id}"))
    }

    pub fn sentinel(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}
