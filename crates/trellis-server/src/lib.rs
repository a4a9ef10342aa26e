//! Trellis server library.
//!
//! Configuration loading, logging and metric setup for the `trellis-server`
//! binary, which boots an in-process replicated cluster.

pub mod config;
pub mod metrics;
pub mod startup;
