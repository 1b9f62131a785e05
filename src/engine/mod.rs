//! Apply engine module
//!
//! Update records, declared validation rules, and the backup → validate →
//! atomic-write pipeline.

mod apply;
mod update;
mod validation;

pub use apply::{ApplyEngine, ResourceGuard};
pub use update::{ConfigUpdate, UpdateState};
pub use validation::{BusinessLimits, ConfigValidator};
