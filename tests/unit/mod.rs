// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the MySQL Operator
//!
//! This module contains unit tests for:
//! - Lifecycle state machines for clusters and backups
//! - Validation logic
//! - Status management
//! - Action planning against observed snapshots
//! - Full reconcile passes driven against an in-memory API server

#[path = "../common/mod.rs"]
mod common;

mod planner;
mod reconciler;
mod state_machine;
