//! `SQLite` storage for the ccfleet daemon.
//!
//! Provides persistence for projects, tasks, dependency edges, agent
//! instances, and execution phases.

mod db;
mod models;
mod queries;
mod queries_instances;
mod queries_phases;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::{TaskDeletion, TaskParams};
pub use queries_instances::InstanceParams;
