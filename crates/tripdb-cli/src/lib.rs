//! Report layer for `tripdb`: the analysis battery, console output and the JSON report.

pub mod analyses;
pub mod print;
pub mod report;
