//! Origin adapters.
//!
//! A [`Source`] knows how to fetch each collection of one integration. Query
//! construction and field mapping live behind this trait; the orchestrator
//! only sees pages of stamped [`Record`]s.

mod rest;

pub use rest::*;

use crate::models::{PipelineTask, PrimaryEntity, Record, Result};
use crate::pagination::{CursorPage, CursorRequest, OffsetPage, OffsetRequest};
use async_trait::async_trait;

/// Fetches pages of one integration.
///
/// Every returned record must already carry `ref_type`, `id` and `hashcode`.
#[async_trait]
pub trait Source: Send + Sync {
    /// Every primary entity, unfiltered.
    async fn primary_entities(&self) -> Result<Vec<PrimaryEntity>>;

    /// Primary records updated since `request.stop_on`, newest first.
    async fn primary_page(&self, request: CursorRequest) -> Result<CursorPage<Record>>;

    /// Records linking contributors to one primary entity.
    async fn linking_page(
        &self,
        _primary: &PrimaryEntity,
        _request: OffsetRequest,
    ) -> Result<OffsetPage<Record>> {
        Ok(OffsetPage {
            items: Vec::new(),
            has_more: false,
            page_size: None,
            total: Some(0),
        })
    }

    /// Task records of one primary entity, newest first.
    async fn tasks_page(
        &self,
        _primary: &PrimaryEntity,
        _request: CursorRequest,
    ) -> Result<CursorPage<Record>> {
        Ok(CursorPage::last(Vec::new()))
    }

    /// Records of the dependent collection `model` for one task.
    async fn dependent_page(
        &self,
        _model: &str,
        _task: &PipelineTask,
        _request: OffsetRequest,
    ) -> Result<OffsetPage<Record>> {
        Ok(OffsetPage {
            items: Vec::new(),
            has_more: false,
            page_size: None,
            total: Some(0),
        })
    }
}
