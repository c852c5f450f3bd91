//! Generic JSON-over-REST source.
//!
//! Every endpoint answers with the envelope
//! `{"items": [...], "has_more": bool, "next_cursor": str?, "total": int?}`.
//! Cursor endpoints receive `cursor`, `since` and `limit`; offset endpoints
//! receive `offset` and `limit`.

use crate::client::{ApiRequest, Requester};
use crate::models::{
    DependentConfig, EndpointConfig, ExportError, PipelineTask, PrimaryEntity, Record, Result,
    SourceConfig,
};
use crate::pagination::{CursorPage, CursorPaginator, CursorRequest, OffsetPage, OffsetRequest};
use crate::source::Source;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    items: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    page_size: Option<u64>,
}

/// [`Source`] backed by a configurable REST API.
pub struct RestSource {
    requester: Arc<Requester>,
    config: SourceConfig,
}

impl RestSource {
    pub fn new(requester: Arc<Requester>, config: SourceConfig) -> Self {
        Self { requester, config }
    }

    pub fn requester(&self) -> &Arc<Requester> {
        &self.requester
    }

    async fn fetch(&self, request: ApiRequest) -> Result<Envelope> {
        let body = self.requester.execute(&request).await?;
        serde_json::from_value(body).map_err(|e| {
            ExportError::Parse(format!("unexpected envelope from {}: {}", request.path(), e))
        })
    }

    async fn cursor_page(&self, path: String, request: CursorRequest) -> Result<CursorPage<Record>> {
        let mut api = ApiRequest::get(path).param("limit", self.config.page_size);
        if let Some(after) = &request.after {
            api = api.param("cursor", after);
        }
        if let Some(since) = request.stop_on {
            api = api.param("since", since.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        let envelope = self.fetch(api).await?;
        let mut items = self.stamp_all(envelope.items)?;
        // Taken before filtering so the paginator can see the stop date crossed.
        let newest_updated_at = items.iter().filter_map(Record::updated_at).max();
        if let Some(since) = request.stop_on {
            items.retain(|r| r.updated_at().is_none_or(|at| at >= since));
        }

        Ok(CursorPage {
            items,
            has_more: envelope.has_more,
            next_cursor: envelope.next_cursor,
            newest_updated_at,
        })
    }

    async fn offset_page(&self, path: String, request: OffsetRequest) -> Result<OffsetPage<Record>> {
        let api = ApiRequest::get(path)
            .param("offset", request.offset)
            .param("limit", request.page_size);
        let envelope = self.fetch(api).await?;

        Ok(OffsetPage {
            items: self.stamp_all(envelope.items)?,
            has_more: envelope.has_more,
            page_size: envelope.page_size,
            total: envelope.total,
        })
    }

    /// Normalise ids to strings and stamp `ref_type` and `hashcode`.
    fn stamp_all(&self, items: Vec<Value>) -> Result<Vec<Record>> {
        items
            .into_iter()
            .map(|item| {
                let mut record = Record::from_value(item)?;
                match record.get("id") {
                    Some(Value::String(_)) => {}
                    Some(Value::Number(n)) => {
                        let id = n.to_string();
                        record.set("id", id);
                    }
                    _ => return Err(ExportError::MissingField("id")),
                }
                record.stamp(&self.config.ref_type);
                Ok(record)
            })
            .collect()
    }

    fn to_primary(&self, record: &Record) -> Result<PrimaryEntity> {
        let id = record.id().ok_or(ExportError::MissingField("id"))?.to_string();
        let name = record
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| id.clone());
        let clone_url = match &self.config.clone_url_template {
            Some(template) => Some(template.replace("{name}", &name).replace("{id}", &id)),
            None => record
                .get("clone_url")
                .and_then(Value::as_str)
                .map(str::to_string),
        };

        Ok(PrimaryEntity {
            id,
            name,
            clone_url,
            updated_at: record.updated_at(),
        })
    }

    fn dependent(&self, model: &str) -> Result<&DependentConfig> {
        self.config
            .dependents
            .iter()
            .find(|d| d.model == model)
            .ok_or_else(|| ExportError::InvalidInput(format!("unknown dependent model {model}")))
    }
}

/// Substitute `{primary_id}`, `{primary_name}` and `{task_id}` in a path.
fn render_path(template: &str, primary: Option<&PrimaryEntity>, task: Option<&PipelineTask>) -> String {
    let mut path = template.to_string();
    if let Some(p) = primary {
        path = path
            .replace("{primary_id}", &p.id)
            .replace("{primary_name}", &p.name);
    }
    if let Some(t) = task {
        path = path
            .replace("{primary_id}", &t.primary_id)
            .replace("{task_id}", t.id().unwrap_or_default());
    }
    path
}

fn endpoint<'a>(endpoint: &'a Option<EndpointConfig>, name: &str) -> Result<&'a EndpointConfig> {
    endpoint
        .as_ref()
        .ok_or_else(|| ExportError::InvalidInput(format!("source.{name} is not configured")))
}

#[async_trait]
impl Source for RestSource {
    async fn primary_entities(&self) -> Result<Vec<PrimaryEntity>> {
        let this = self;
        let path = &self.config.primary.path;
        let mut entities = Vec::new();

        let pages = CursorPaginator::new(None, move |req| this.cursor_page(path.clone(), req))
            .drain(|page| {
                let mapped: Result<Vec<_>> = page.items.iter().map(|r| self.to_primary(r)).collect();
                let outcome = mapped.map(|batch| entities.extend(batch));
                async move { outcome }
            })
            .await?;

        info!(count = entities.len(), pages, "Fetched primary entities");
        Ok(entities)
    }

    async fn primary_page(&self, request: CursorRequest) -> Result<CursorPage<Record>> {
        self.cursor_page(self.config.primary.path.clone(), request).await
    }

    async fn linking_page(
        &self,
        primary: &PrimaryEntity,
        request: OffsetRequest,
    ) -> Result<OffsetPage<Record>> {
        let linking = endpoint(&self.config.linking, "linking")?;
        self.offset_page(render_path(&linking.path, Some(primary), None), request)
            .await
    }

    async fn tasks_page(
        &self,
        primary: &PrimaryEntity,
        request: CursorRequest,
    ) -> Result<CursorPage<Record>> {
        let tasks = endpoint(&self.config.tasks, "tasks")?;
        self.cursor_page(render_path(&tasks.path, Some(primary), None), request)
            .await
    }

    async fn dependent_page(
        &self,
        model: &str,
        task: &PipelineTask,
        request: OffsetRequest,
    ) -> Result<OffsetPage<Record>> {
        let dependent = self.dependent(model)?;
        let path = render_path(&dependent.path, None, Some(task));
        debug!(model, %path, offset = request.offset, "Fetching dependent page");
        self.offset_page(path, request).await
    }
}
