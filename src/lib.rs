//! tartex library exports.
//!
//! The binary is a thin clap wrapper around [`pipeline::run`]; everything
//! else is exposed for integration testing.

pub mod archive;
pub mod cache;
pub mod classify;
pub mod common;
pub mod compile;
pub mod config;
pub mod context;
pub mod error;
pub mod packages;
pub mod patterns;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod report;
pub mod revision;
pub mod timing;
pub mod trace;

pub use error::{Error, Result};
