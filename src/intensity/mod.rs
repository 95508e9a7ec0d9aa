//! Normalized intensity handling: polar transform and output tables.

pub mod polar;
pub mod table;

pub use polar::{to_polar, transform, PolarIntensity, RawIntensity};
pub use table::{render, write_table, WrittenTable, HEADER, TABLE_SUFFIX};
