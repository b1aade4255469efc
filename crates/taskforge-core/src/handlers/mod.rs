//! Built-in handler implementations for the maintenance-class task types
//! that run against this subsystem's own store: cleanup, audit, backup,
//! and reporting.
//!
//! Enrichment/supplier-facing task types (`part_enrichment`,
//! `fetch_datasheet`, and similar) are contract-only here: they name a real
//! `TaskType` a caller can submit and a real `TaskHandler` shape to
//! register, but the integration with an external parts/supplier service
//! lives outside this crate. [`reference::ReferenceHandler`] is a minimal
//! example implementation of that contract for demonstration and testing.

pub mod backup;
pub mod database_cleanup;
pub mod inventory_audit;
pub mod reference;
pub mod report_generation;
