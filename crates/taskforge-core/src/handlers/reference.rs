//! Minimal example implementation of the supplier-facing enrichment
//! contract (`part_enrichment`, `fetch_datasheet`, `fetch_image`,
//! `fetch_pricing`, `fetch_stock`, `fetch_specifications`, `price_update`,
//! `part_validation`, `file_import_enrichment`, `bulk_enrichment`,
//! `datasheet_download`, `printer_discovery`, `email_notification`).
//!
//! These task types describe calling out to an external parts/supplier
//! service that this crate does not embed. [`ReferenceHandler`] echoes its
//! input back as the result after validating the `part_id` field is
//! present, so the dispatch path, registry, and Progress Reporter wiring
//! can be exercised without a live supplier integration. A real deployment
//! registers a handler per enrichment task type backed by the actual
//! supplier client instead of this one.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::Result;
use crate::handler::{TaskHandler, require_input_keys};
use crate::reporter::ProgressReporter;

pub struct ReferenceHandler {
    handler_name: &'static str,
}

impl ReferenceHandler {
    pub fn new(handler_name: &'static str) -> Self {
        Self { handler_name }
    }
}

#[async_trait]
impl TaskHandler for ReferenceHandler {
    async fn execute(&self, input: &Value, reporter: &ProgressReporter) -> Result<Value> {
        require_input_keys(reporter.task_id(), input, &["part_id"])?;

        reporter.update_progress(50, Some("processing")).await;
        reporter.log_info(format!("{} handled part_id={:?}", self.handler_name, input.get("part_id"))).await;
        reporter.update_progress(100, Some("done")).await;

        Ok(json!({ "echo": input, "handled_by": self.handler_name }))
    }

    fn name(&self) -> &'static str {
        self.handler_name
    }
}
