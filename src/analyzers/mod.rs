//! Ride and park statistics.
//!
//! Raw observations become classified per-ride timelines, then hourly and
//! daily ride rows, tier-weighted park rows and finally weekly, monthly and
//! yearly rollups of the daily rows. Published results go out as JSON.

pub mod aggregate;
pub mod analyzer;
pub mod park;
pub mod publish;
pub mod rollup;
pub mod timeline;
pub mod types;
pub mod utility;
pub mod writetos3;
