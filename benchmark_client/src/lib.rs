pub mod harness;
pub mod report;

pub use harness::{Harness, Stage};
pub use report::{BatchSummary, HarnessReport, StageTiming};
