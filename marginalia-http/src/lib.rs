//! HTTP adapter for the annotation service contract.
//!
//! The transport and schema are owned by the backend; this crate only maps
//! the wire surface onto [`AnnotationService`] and translates failure
//! statuses into the [`ServiceError`] taxonomy. Nothing here retries:
//! `create_anchor` in particular must never be retried automatically, since
//! a duplicate POST could mint a duplicate anchor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use serde::Serialize;
use tracing::debug;
use url::Url;

use marginalia_core::{Anchor, AnchorBody, AnchorId, DocumentCopyId, PageRegion, ReadingPosition, SearchHit};
use marginalia_sync::{AnchorDraft, AnnotationService, ServiceError};

pub struct HttpAnnotationService {
    http: reqwest::Client,
    base: Url,
}

impl HttpAnnotationService {
    pub fn new(base: Url) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(http: reqwest::Client, base: Url) -> Self {
        Self { http, base }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ServiceError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| ServiceError::Transport("base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn copy_endpoint(&self, copy_id: DocumentCopyId, leaf: &str) -> Result<Url, ServiceError> {
        self.endpoint(&["copies", &copy_id.to_string(), leaf])
    }
}

fn transport(err: reqwest::Error) -> ServiceError {
    ServiceError::Transport(err.to_string())
}

fn decode(err: reqwest::Error) -> ServiceError {
    ServiceError::Decode(err.to_string())
}

fn status_error(status: StatusCode) -> ServiceError {
    if status == StatusCode::NOT_FOUND {
        ServiceError::NotFound
    } else {
        ServiceError::Status {
            status: status.as_u16(),
        }
    }
}

fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status))
    }
}

#[derive(Serialize)]
struct CreateAnnotationRequest<'a> {
    page: u32,
    text: &'a str,
    region: &'a PageRegion,
    #[serde(flatten)]
    body: &'a AnchorBody,
}

#[derive(Serialize)]
struct ProgressPayload {
    page: u32,
    total_pages: u32,
    zoom: f32,
    percent_complete: f32,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    copy_id: Option<DocumentCopyId>,
}

#[async_trait]
impl AnnotationService for HttpAnnotationService {
    async fn list_anchors(&self, copy_id: DocumentCopyId) -> Result<Vec<Anchor>, ServiceError> {
        let url = self.copy_endpoint(copy_id, "annotations")?;
        let response = self.http.get(url).send().await.map_err(transport)?;
        let anchors: Vec<Anchor> = check_status(response)?.json().await.map_err(decode)?;
        debug!(copy = %copy_id, count = anchors.len(), "fetched annotations");
        Ok(anchors)
    }

    async fn create_anchor(&self, draft: AnchorDraft) -> Result<Anchor, ServiceError> {
        let url = self.copy_endpoint(draft.copy_id, "annotations")?;
        let payload = CreateAnnotationRequest {
            page: draft.page,
            text: &draft.text,
            region: &draft.region,
            body: &draft.body,
        };
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        check_status(response)?.json().await.map_err(decode)
    }

    async fn delete_anchor(&self, id: AnchorId) -> Result<(), ServiceError> {
        let url = self.endpoint(&["annotations", &id.to_string()])?;
        let response = self.http.delete(url).send().await.map_err(transport)?;
        check_status(response)?;
        Ok(())
    }

    async fn save_progress(&self, position: &ReadingPosition) -> Result<(), ServiceError> {
        let url = self.copy_endpoint(position.copy_id, "progress")?;
        let payload = ProgressPayload {
            page: position.page,
            total_pages: position.total_pages,
            zoom: position.zoom,
            percent_complete: position.percent_complete(),
            updated_at: position.updated_at,
        };
        let response = self
            .http
            .put(url)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        check_status(response)?;
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        copy_id: Option<DocumentCopyId>,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let url = self.endpoint(&["search"])?;
        let payload = SearchRequest { query, copy_id };
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        let hits: Vec<SearchHit> = check_status(response)?.json().await.map_err(decode)?;
        debug!(query, count = hits.len(), "search resolved");
        Ok(hits)
    }
}
