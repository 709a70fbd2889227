//! Conversion of cluster objects into store records.
//!
//! Converters never fail on missing optional fields. They fail when an
//! object lacks an identity field the record cannot do without, or when a
//! payload cannot be serialized.

pub mod cron;
pub mod evaluate;
pub mod job;
pub mod notebook;
pub mod pod;
pub mod resources;

pub use job::JobView;
