//! Core data model of the array engine: datatypes, typed ranges, domains,
//! array schemas, the Hilbert order, memory accounting and configuration.

pub mod concurrency;
pub use concurrency::*;
pub mod config;
pub use config::*;
pub mod domain;
pub use domain::*;
pub mod hilbert;
pub use hilbert::*;
pub mod memory;
pub use memory::*;
pub mod types;
pub use types::*;
