//! Distributed lock primitive
//!
//! This module provides:
//! - Lock data model with a fenced holder and a FIFO waiter queue
//! - Lock state machine service applying lock commands from the log
//! - Release of locks and queued waits held by closed or expired sessions

mod model;
mod service;

pub use model::*;
pub use service::*;
