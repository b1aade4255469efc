//! Persistence layer for the background task subsystem.
//!
//! Owns the `tasks`, `task_dependencies`, and `backup_config` tables and
//! exposes typed query functions over them. Holds no scheduling or policy
//! logic — callers (`taskforge-core`) compose these functions into the
//! Task Store contract.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
