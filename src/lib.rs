//! Warden library interface
//!
//! Security event reporting and statistical aggregation engine. Invoked as
//! a library by an external scheduler, one reporting unit (abuse group x
//! severity x time window) per call.

pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod report;
pub mod services;
pub mod stats;
pub mod threshold;

pub use error::{WardenError, WardenResult};
