//! Line diffs, verdicts, HTML presentation and scoring of test case output.
//!
//! # Example
//!
//! ```ignore
//! use grader_diff::prelude::*;
//!
//! let verdicts = grade_results(&test_cases, &expected_dir, &results_dir, &results)?;
//! let mut cache = RenderCache::new();
//! let html = render_report(&verdicts, &BasicScore, &RenderOptions::default(), &mut cache);
//! ```

pub mod diff;
pub mod grading;
pub mod render;
pub mod score;
pub mod verdict;

/// Prelude module - import everything you need with `use grader_diff::prelude::*`
pub mod prelude {
    pub use crate::diff::{compute, compute_bytes, DiffLine, DiffModel, DiffRow, Segment, SegmentKind};
    pub use crate::grading::{grade_results, output_path};
    pub use crate::render::{render_report, render_table, render_verdict, RenderCache, RenderOptions};
    pub use crate::score::{
        summarize, BasicScore, ScorePolicy, ScoreSummary, ScoreWithExtraMissing, ScoreWithSetTotal,
    };
    pub use crate::verdict::{present, Comparison, Verdict};
}
