//! Proposal module
//!
//! Signals in, optimization proposals out: data model, typed change
//! operations and the factory that classifies signals.

mod changes;
mod factory;
mod models;
mod signal;

pub use changes::*;
pub use factory::ProposalFactory;
pub use models::*;
pub use signal::*;
