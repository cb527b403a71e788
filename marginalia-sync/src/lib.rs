//! Client-side reconciliation of annotation state with a remote store.
//!
//! Everything here tolerates partial failure of the remote service: the
//! document stays readable and navigable when annotation or search calls
//! fail. Cancellation is cooperative: stale responses are detected and
//! discarded, never aborted at the transport level.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use marginalia_core::{
    Anchor, AnchorBody, AnchorId, Candidate, DocumentCopyId, GeometryNormalizer, HighlightColor,
    MatchKind, Notice, PageMetrics, PageRegion, PageView, PageWindow, RawSelection,
    ReadingPosition, SearchHit, SelectionMachine, SelectionPhase,
};

/// Default quiet window for the reading-position debounce.
pub const DEFAULT_QUIET_WINDOW: Duration = Duration::from_millis(1000);

/// Default page size for windowed result lists.
pub const RESULT_PAGE_SIZE: usize = 10;

pub const MIN_ZOOM: f32 = 0.25;
pub const MAX_ZOOM: f32 = 4.0;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("remote returned status {status}")]
    Status { status: u16 },
    #[error("annotation not found")]
    NotFound,
    #[error("failed to decode remote payload: {0}")]
    Decode(String),
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::NotFound)
    }
}

/// What the remote service needs to mint a new anchor. The id and creation
/// timestamp are assigned server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorDraft {
    pub copy_id: DocumentCopyId,
    pub page: u32,
    pub region: PageRegion,
    pub text: String,
    pub body: AnchorBody,
}

/// Remote contract for annotations, reading progress and search.
///
/// `list_anchors`, `delete_anchor`, `save_progress` and `search` are
/// idempotent and safe to retry or drop. `create_anchor` is not: a silent
/// automatic retry could mint duplicates, so failures are surfaced to the
/// caller for a manual retry instead.
#[async_trait]
pub trait AnnotationService: Send + Sync {
    async fn list_anchors(&self, copy_id: DocumentCopyId) -> Result<Vec<Anchor>, ServiceError>;
    async fn create_anchor(&self, draft: AnchorDraft) -> Result<Anchor, ServiceError>;
    async fn delete_anchor(&self, id: AnchorId) -> Result<(), ServiceError>;
    async fn save_progress(&self, position: &ReadingPosition) -> Result<(), ServiceError>;
    async fn search(
        &self,
        query: &str,
        copy_id: Option<DocumentCopyId>,
    ) -> Result<Vec<SearchHit>, ServiceError>;
}

/// In-memory twin of the remote service, used by tests and offline runs.
#[derive(Default)]
pub struct MemoryAnnotationService {
    anchors: Mutex<HashMap<DocumentCopyId, Vec<Anchor>>>,
    progress: Mutex<HashMap<DocumentCopyId, ReadingPosition>>,
}

impl MemoryAnnotationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved_progress(&self, copy_id: DocumentCopyId) -> Option<ReadingPosition> {
        self.progress.lock().get(&copy_id).cloned()
    }
}

fn score_match(needle: &str, haystack: &str) -> Option<f32> {
    if haystack.to_lowercase().contains(&needle.to_lowercase()) {
        let ratio = needle.chars().count() as f32 / haystack.chars().count().max(1) as f32;
        Some(ratio.min(1.0))
    } else {
        None
    }
}

fn excerpt_of(text: &str) -> String {
    const MAX_CHARS: usize = 80;
    if text.chars().count() <= MAX_CHARS {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX_CHARS).collect();
        format!("{cut}...")
    }
}

#[async_trait]
impl AnnotationService for MemoryAnnotationService {
    async fn list_anchors(&self, copy_id: DocumentCopyId) -> Result<Vec<Anchor>, ServiceError> {
        Ok(self
            .anchors
            .lock()
            .get(&copy_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_anchor(&self, draft: AnchorDraft) -> Result<Anchor, ServiceError> {
        let anchor = Anchor {
            id: Uuid::new_v4(),
            copy_id: draft.copy_id,
            page: draft.page,
            region: draft.region,
            text: draft.text,
            body: draft.body,
            created_at: Utc::now(),
        };
        self.anchors
            .lock()
            .entry(draft.copy_id)
            .or_default()
            .push(anchor.clone());
        Ok(anchor)
    }

    async fn delete_anchor(&self, id: AnchorId) -> Result<(), ServiceError> {
        let mut anchors = self.anchors.lock();
        for list in anchors.values_mut() {
            if let Some(index) = list.iter().position(|anchor| anchor.id == id) {
                list.remove(index);
                return Ok(());
            }
        }
        Err(ServiceError::NotFound)
    }

    async fn save_progress(&self, position: &ReadingPosition) -> Result<(), ServiceError> {
        self.progress
            .lock()
            .insert(position.copy_id, position.clone());
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        copy_id: Option<DocumentCopyId>,
    ) -> Result<Vec<SearchHit>, ServiceError> {
        let needle = query.trim();
        if needle.is_empty() {
            return Ok(Vec::new());
        }

        let anchors = self.anchors.lock();
        let mut hits = Vec::new();
        for (copy, list) in anchors.iter() {
            if copy_id.is_some_and(|wanted| wanted != *copy) {
                continue;
            }
            for anchor in list {
                let text_score = score_match(needle, &anchor.text);
                let body_score = match &anchor.body {
                    AnchorBody::Comment { body } => score_match(needle, body),
                    AnchorBody::Highlight { .. } => None,
                };
                let score = match (text_score, body_score) {
                    (Some(text), Some(body)) => Some(text.max(body)),
                    (text, body) => text.or(body),
                };
                let Some(score) = score else {
                    continue;
                };
                hits.push(SearchHit {
                    score,
                    page: anchor.page,
                    kind: anchor.body.match_kind(),
                    excerpt: excerpt_of(&anchor.text),
                });
            }
        }
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        Ok(hits)
    }
}

/// Client-side collection of anchors for one document copy, newest first.
pub struct AnnotationStore {
    service: Arc<dyn AnnotationService>,
    copy_id: DocumentCopyId,
    anchors: Vec<Anchor>,
}

impl AnnotationStore {
    pub fn new(service: Arc<dyn AnnotationService>, copy_id: DocumentCopyId) -> Self {
        Self {
            service,
            copy_id,
            anchors: Vec::new(),
        }
    }

    pub fn copy_id(&self) -> DocumentCopyId {
        self.copy_id
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn get(&self, id: AnchorId) -> Option<&Anchor> {
        self.anchors.iter().find(|anchor| anchor.id == id)
    }

    /// Anchors are only ever rendered on their own page; cross-page geometry
    /// is meaningless.
    pub fn on_page(&self, page: u32) -> impl Iterator<Item = &Anchor> {
        self.anchors.iter().filter(move |anchor| anchor.page == page)
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Fetches all anchors for the copy. On failure the local list ends up
    /// empty and the error is returned for the caller to surface; the
    /// viewer keeps working without annotations.
    pub async fn load(&mut self) -> Result<(), ServiceError> {
        match self.service.list_anchors(self.copy_id).await {
            Ok(mut anchors) => {
                anchors.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                self.anchors = anchors;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "failed to load annotations");
                self.anchors.clear();
                Err(err)
            }
        }
    }

    /// Issues the remote create and prepends the confirmed anchor. There is
    /// no optimistic insert: an anchor without a server id could never be
    /// deleted.
    pub async fn create(&mut self, draft: AnchorDraft) -> Result<AnchorId, ServiceError> {
        let anchor = self.service.create_anchor(draft).await?;
        let id = anchor.id;
        self.anchors.insert(0, anchor);
        Ok(id)
    }

    /// Optimistic removal: the anchor disappears locally before the remote
    /// delete resolves. A repeat delete of an already-removed id counts as
    /// success. On other failures the item is not restored; callers reload
    /// to resynchronize rather than silently resurrecting a deleted item.
    pub async fn remove(&mut self, id: AnchorId) -> Result<(), ServiceError> {
        self.anchors.retain(|anchor| anchor.id != id);
        match self.service.delete_anchor(id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                warn!(error = %err, anchor = %id, "remote delete failed; reload to resynchronize");
                Err(err)
            }
        }
    }
}

/// Debounced persistence of the reading position.
///
/// One tracker per open document; the quiet-window timer is the only timer
/// the tracker owns. Every mutation restarts the window (debounce, not
/// throttle), so only the latest state inside a quiet window is sent. A save
/// already in flight is never cancelled; a mutation arriving during it just
/// schedules the next round. Saves are best-effort and never block
/// navigation.
pub struct ProgressTracker {
    service: Arc<dyn AnnotationService>,
    tx: watch::Sender<ReadingPosition>,
    worker: JoinHandle<()>,
    quiet: Duration,
}

impl ProgressTracker {
    /// Must be called from within a Tokio runtime.
    pub fn spawn(service: Arc<dyn AnnotationService>, initial: ReadingPosition) -> Self {
        Self::with_quiet_window(service, initial, DEFAULT_QUIET_WINDOW)
    }

    pub fn with_quiet_window(
        service: Arc<dyn AnnotationService>,
        initial: ReadingPosition,
        quiet: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(initial);
        let worker = tokio::spawn(debounce_worker(Arc::clone(&service), rx, quiet));
        Self {
            service,
            tx,
            worker,
            quiet,
        }
    }

    pub fn quiet_window(&self) -> Duration {
        self.quiet
    }

    /// Records a navigation or zoom mutation and restarts the quiet window.
    pub fn record(&self, page: u32, total_pages: u32, zoom: f32) {
        self.tx.send_modify(|position| {
            position.page = page;
            position.total_pages = total_pages;
            position.zoom = zoom;
            position.updated_at = Utc::now();
        });
    }

    pub fn position(&self) -> ReadingPosition {
        self.tx.borrow().clone()
    }

    /// Persists the current state immediately, bypassing the quiet window.
    /// Used at teardown; best-effort like every progress save.
    pub async fn flush(&self) {
        let snapshot = self.position();
        if let Err(err) = self.service.save_progress(&snapshot).await {
            warn!(error = %err, "failed to flush reading position");
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn debounce_worker(
    service: Arc<dyn AnnotationService>,
    mut rx: watch::Receiver<ReadingPosition>,
    quiet: Duration,
) {
    while rx.changed().await.is_ok() {
        loop {
            match tokio::time::timeout(quiet, rx.changed()).await {
                // Another mutation before the window elapsed: restart it.
                Ok(Ok(())) => continue,
                // Tracker dropped; the final flush is explicit.
                Ok(Err(_)) => return,
                // The window stayed quiet.
                Err(_) => break,
            }
        }
        let snapshot = rx.borrow_and_update().clone();
        if let Err(err) = service.save_progress(&snapshot).await {
            warn!(error = %err, "failed to persist reading position");
        }
    }
}

/// Ties a search response to the query text it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    seq: u64,
    query: String,
}

impl SearchTicket {
    pub fn query(&self) -> &str {
        &self.query
    }
}

/// Issues queries against the semantic index and windows the scored results.
///
/// There is no transport-level cancellation: a superseded request keeps
/// running, but its response no longer matches the current ticket and is
/// discarded on arrival.
pub struct SearchController {
    copy_id: Option<DocumentCopyId>,
    seq: u64,
    current: Option<SearchTicket>,
    hits: Vec<SearchHit>,
    window: PageWindow,
}

impl SearchController {
    pub fn new(copy_id: Option<DocumentCopyId>) -> Self {
        Self::with_page_size(copy_id, RESULT_PAGE_SIZE)
    }

    pub fn with_page_size(copy_id: Option<DocumentCopyId>, page_size: usize) -> Self {
        Self {
            copy_id,
            seq: 0,
            current: None,
            hits: Vec::new(),
            window: PageWindow::new(page_size),
        }
    }

    /// Starts a query. Empty input short-circuits: results are cleared and no
    /// ticket is produced, so no network call happens.
    pub fn begin(&mut self, query: &str) -> Option<SearchTicket> {
        let query = query.trim();
        if query.is_empty() {
            self.current = None;
            self.hits.clear();
            self.window.reset();
            return None;
        }
        self.seq += 1;
        let ticket = SearchTicket {
            seq: self.seq,
            query: query.to_string(),
        };
        self.current = Some(ticket.clone());
        Some(ticket)
    }

    /// Applies a response. A response whose ticket no longer matches the
    /// current query is discarded: out-of-order resolution must not render
    /// stale results.
    pub fn accept(&mut self, ticket: &SearchTicket, hits: Vec<SearchHit>) -> bool {
        if self.current.as_ref() != Some(ticket) {
            debug!(query = %ticket.query, "discarding stale search response");
            return false;
        }
        self.hits = hits;
        // A new source list: the old page position has no meaning for it.
        self.window.reset();
        true
    }

    pub fn hits(&self) -> &[SearchHit] {
        &self.hits
    }

    pub fn page(&mut self) -> PageView<'_, SearchHit> {
        self.window.view(&self.hits)
    }

    pub fn go_to_page(&mut self, index: usize) {
        self.window.go_to(index);
    }

    pub fn next_page(&mut self) {
        self.window.next();
    }

    pub fn prev_page(&mut self) {
        self.window.prev();
    }

    /// Begin, remote call and accept in one awaited step. Returns whether the
    /// response was applied. On failure the previous results are kept; stale
    /// is better than flickering empty while the user retries.
    pub async fn run(
        &mut self,
        service: &dyn AnnotationService,
        query: &str,
    ) -> Result<bool, ServiceError> {
        let Some(ticket) = self.begin(query) else {
            return Ok(false);
        };
        let hits = service.search(ticket.query(), self.copy_id).await?;
        Ok(self.accept(&ticket, hits))
    }
}

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("comment body is empty")]
    EmptyBody,
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Clone)]
pub enum Command {
    GotoPage { page: u32 },
    NextPage,
    PrevPage,
    SetZoom { zoom: f32 },
    ZoomBy { factor: f32 },
    PointerDown { within_viewer: bool },
    PointerUp { selection: RawSelection },
    SelectionChanged { selection: RawSelection },
    ClickOutside,
    RequestAuthoring,
    CancelAuthoring,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PageChanged { page: u32 },
    ZoomChanged { zoom: f32 },
    PopoverShown,
    AuthoringOpened,
    SelectionCleared,
    AnchorCreated { id: AnchorId },
    AnchorRemoved { id: AnchorId },
    SearchUpdated,
}

/// Interactive state of one open document copy.
///
/// Synchronous [`apply`](ReaderSession::apply) handles navigation, zoom and
/// pointer events; the async methods handle everything that touches the
/// network. Creates are awaited before the UI can produce the next one, so
/// they are never reordered against each other.
pub struct ReaderSession {
    service: Arc<dyn AnnotationService>,
    copy_id: DocumentCopyId,
    page: u32,
    total_pages: u32,
    zoom: f32,
    geometry: GeometryNormalizer,
    selection: SelectionMachine,
    annotations: AnnotationStore,
    annotations_window: PageWindow,
    progress: ProgressTracker,
    search: SearchController,
    events: Vec<SessionEvent>,
    notices: Vec<Notice>,
}

impl ReaderSession {
    /// Must be called from within a Tokio runtime (the progress tracker
    /// spawns its debounce worker).
    pub fn new(
        service: Arc<dyn AnnotationService>,
        copy_id: DocumentCopyId,
        total_pages: u32,
    ) -> Self {
        let initial = ReadingPosition::new(copy_id, 1, total_pages, 1.0);
        Self {
            annotations: AnnotationStore::new(Arc::clone(&service), copy_id),
            annotations_window: PageWindow::new(RESULT_PAGE_SIZE),
            progress: ProgressTracker::spawn(Arc::clone(&service), initial),
            search: SearchController::new(Some(copy_id)),
            selection: SelectionMachine::new(),
            geometry: GeometryNormalizer::new(),
            service,
            copy_id,
            page: 1,
            total_pages,
            zoom: 1.0,
            events: Vec::new(),
            notices: Vec::new(),
        }
    }

    pub fn copy_id(&self) -> DocumentCopyId {
        self.copy_id
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn zoom(&self) -> f32 {
        self.zoom
    }

    pub fn selection(&self) -> &SelectionMachine {
        &self.selection
    }

    pub fn annotations(&self) -> &AnnotationStore {
        &self.annotations
    }

    /// Windowed view over the anchor list for "recently added" displays.
    pub fn annotations_page(&mut self) -> PageView<'_, Anchor> {
        self.annotations_window.view(self.annotations.anchors())
    }

    pub fn annotations_window(&mut self) -> &mut PageWindow {
        &mut self.annotations_window
    }

    pub fn search_controller(&mut self) -> &mut SearchController {
        &mut self.search
    }

    pub fn reading_position(&self) -> ReadingPosition {
        self.progress.position()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Render-complete hook from the rendering collaborator: re-measure the
    /// container origin for the page and scale now displayed.
    pub fn render_complete(&mut self, metrics: &dyn PageMetrics) {
        self.geometry.set_scale(self.zoom);
        self.geometry.remeasure(metrics, self.page);
    }

    /// Navigation callback exposed to the rendering collaborator.
    pub fn go_to_page(&mut self, page: u32) {
        self.apply(Command::GotoPage { page });
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::GotoPage { page } => self.navigate_to(page),
            Command::NextPage => self.navigate_to(self.page.saturating_add(1)),
            Command::PrevPage => self.navigate_to(self.page.saturating_sub(1)),
            Command::SetZoom { zoom } => self.set_zoom(zoom),
            Command::ZoomBy { factor } => self.set_zoom(self.zoom * factor),
            Command::PointerDown { within_viewer } => self.selection.pointer_down(within_viewer),
            Command::PointerUp { selection } => {
                if self.selection.pointer_up(&selection, self.page) {
                    self.events.push(SessionEvent::PopoverShown);
                }
            }
            Command::SelectionChanged { selection } => {
                if self.selection.selection_changed(&selection, self.page) {
                    self.events.push(SessionEvent::PopoverShown);
                }
            }
            Command::ClickOutside => self.selection.click_outside(),
            Command::RequestAuthoring => {
                if self.selection.request_authoring() {
                    self.events.push(SessionEvent::AuthoringOpened);
                }
            }
            Command::CancelAuthoring => {
                if self.selection.cancel() {
                    self.events.push(SessionEvent::SelectionCleared);
                }
            }
        }
    }

    fn navigate_to(&mut self, page: u32) {
        let next = page.clamp(1, self.total_pages.max(1));
        if next == self.page {
            return;
        }
        self.page = next;
        self.selection.navigation_changed();
        // Origin is stale until the next render_complete.
        self.geometry.invalidate();
        self.progress.record(self.page, self.total_pages, self.zoom);
        self.events.push(SessionEvent::PageChanged { page: self.page });
    }

    fn set_zoom(&mut self, zoom: f32) {
        let next = zoom.clamp(MIN_ZOOM, MAX_ZOOM);
        if (next - self.zoom).abs() < f32::EPSILON {
            return;
        }
        self.zoom = next;
        self.selection.navigation_changed();
        self.geometry.set_scale(next);
        self.geometry.invalidate();
        self.progress.record(self.page, self.total_pages, self.zoom);
        self.events.push(SessionEvent::ZoomChanged { zoom: self.zoom });
    }

    /// Loads (or reloads) the anchor list. Failure surfaces as a notice and
    /// leaves the viewer readable with an empty list.
    pub async fn reload(&mut self) -> Result<(), ServiceError> {
        match self.annotations.load().await {
            Ok(()) => {
                // A reloaded list is a new source list for the window.
                self.annotations_window.reset();
                Ok(())
            }
            Err(err) => {
                self.notices
                    .push(Notice::error(format!("Could not load annotations: {err}")));
                Err(err)
            }
        }
    }

    /// Commits the authored comment for the locked candidate. An empty body
    /// is rejected locally without a network call; a commit with no candidate
    /// (a race) is a no-op.
    pub async fn commit_comment(&mut self, body: &str) -> Result<Option<AnchorId>, CommitError> {
        if self.selection.phase() != SelectionPhase::AuthoringLocked {
            return Ok(None);
        }
        let Some(candidate) = self.selection.commit_begin() else {
            return Ok(None);
        };
        let body = body.trim();
        if body.is_empty() {
            return Err(CommitError::EmptyBody);
        }
        let anchor_body = AnchorBody::Comment {
            body: body.to_string(),
        };
        self.finish_commit(candidate, anchor_body).await
    }

    /// Highlights commit straight from the popover; no authoring surface is
    /// involved.
    pub async fn commit_highlight(
        &mut self,
        color: HighlightColor,
    ) -> Result<Option<AnchorId>, CommitError> {
        let Some(candidate) = self.selection.commit_begin() else {
            return Ok(None);
        };
        self.finish_commit(candidate, AnchorBody::Highlight { color })
            .await
    }

    async fn finish_commit(
        &mut self,
        candidate: Candidate,
        body: AnchorBody,
    ) -> Result<Option<AnchorId>, CommitError> {
        let region = self.geometry.normalize(candidate.bounds);
        // Comments anchor at the start of the span; highlights keep the box.
        let region = if body.is_comment() {
            region.collapsed()
        } else {
            region
        };
        let draft = AnchorDraft {
            copy_id: self.copy_id,
            page: candidate.page,
            region,
            text: candidate.text.clone(),
            body,
        };
        match self.annotations.create(draft).await {
            Ok(id) => {
                self.selection.complete_commit();
                self.events.push(SessionEvent::AnchorCreated { id });
                self.events.push(SessionEvent::SelectionCleared);
                Ok(Some(id))
            }
            Err(err) => {
                // Back to the popover with the candidate intact; the user
                // retries without re-selecting the text.
                self.selection.commit_failed();
                self.notices
                    .push(Notice::error(format!("Could not save annotation: {err}")));
                Err(CommitError::Service(err))
            }
        }
    }

    pub async fn remove_anchor(&mut self, id: AnchorId) -> Result<(), ServiceError> {
        self.events.push(SessionEvent::AnchorRemoved { id });
        match self.annotations.remove(id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.notices.push(Notice::warning(format!(
                    "Could not delete annotation: {err}"
                )));
                Err(err)
            }
        }
    }

    pub async fn submit_search(&mut self, query: &str) -> Result<(), ServiceError> {
        match self.search.run(self.service.as_ref(), query).await {
            Ok(applied) => {
                if applied || query.trim().is_empty() {
                    self.events.push(SessionEvent::SearchUpdated);
                }
                Ok(())
            }
            Err(err) => {
                self.notices
                    .push(Notice::warning(format!("Search failed: {err}")));
                Err(err)
            }
        }
    }

    /// Persists the latest reading position immediately; call on teardown.
    pub async fn persist(&self) {
        self.progress.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marginalia_core::ViewportRect;

    fn raw_selection(text: &str) -> RawSelection {
        RawSelection {
            text: text.to_string(),
            bounds: ViewportRect::new(12.0, 40.0, 120.0, 18.0),
            within_viewer: true,
            page_hint: Some(3),
        }
    }

    fn draft(copy_id: DocumentCopyId, page: u32, text: &str, body: &str) -> AnchorDraft {
        AnchorDraft {
            copy_id,
            page,
            region: PageRegion::Point { x: 4.0, y: 8.0 },
            text: text.to_string(),
            body: AnchorBody::Comment {
                body: body.to_string(),
            },
        }
    }

    /// Service that only records progress saves.
    #[derive(Default)]
    struct CountingProgressService {
        saves: Mutex<Vec<ReadingPosition>>,
    }

    #[async_trait]
    impl AnnotationService for CountingProgressService {
        async fn list_anchors(&self, _: DocumentCopyId) -> Result<Vec<Anchor>, ServiceError> {
            Ok(Vec::new())
        }

        async fn create_anchor(&self, _: AnchorDraft) -> Result<Anchor, ServiceError> {
            Err(ServiceError::Transport("not supported".to_string()))
        }

        async fn delete_anchor(&self, _: AnchorId) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn save_progress(&self, position: &ReadingPosition) -> Result<(), ServiceError> {
            self.saves.lock().push(position.clone());
            Ok(())
        }

        async fn search(
            &self,
            _: &str,
            _: Option<DocumentCopyId>,
        ) -> Result<Vec<SearchHit>, ServiceError> {
            Ok(Vec::new())
        }
    }

    /// Memory-backed service whose next create or list call can be failed.
    #[derive(Default)]
    struct FlakyService {
        inner: MemoryAnnotationService,
        fail_next_create: Mutex<bool>,
        fail_next_list: Mutex<bool>,
    }

    impl FlakyService {
        fn fail_create_once(&self) {
            *self.fail_next_create.lock() = true;
        }

        fn fail_list_once(&self) {
            *self.fail_next_list.lock() = true;
        }
    }

    #[async_trait]
    impl AnnotationService for FlakyService {
        async fn list_anchors(&self, copy_id: DocumentCopyId) -> Result<Vec<Anchor>, ServiceError> {
            if std::mem::take(&mut *self.fail_next_list.lock()) {
                return Err(ServiceError::Transport("connection reset".to_string()));
            }
            self.inner.list_anchors(copy_id).await
        }

        async fn create_anchor(&self, anchor_draft: AnchorDraft) -> Result<Anchor, ServiceError> {
            if std::mem::take(&mut *self.fail_next_create.lock()) {
                return Err(ServiceError::Status { status: 502 });
            }
            self.inner.create_anchor(anchor_draft).await
        }

        async fn delete_anchor(&self, id: AnchorId) -> Result<(), ServiceError> {
            self.inner.delete_anchor(id).await
        }

        async fn save_progress(&self, position: &ReadingPosition) -> Result<(), ServiceError> {
            self.inner.save_progress(position).await
        }

        async fn search(
            &self,
            query: &str,
            copy_id: Option<DocumentCopyId>,
        ) -> Result<Vec<SearchHit>, ServiceError> {
            self.inner.search(query, copy_id).await
        }
    }

    fn test_copy() -> DocumentCopyId {
        marginalia_core::copy_id_for("test-reader", "test-document")
    }

    #[tokio::test]
    async fn deleting_twice_leaves_the_store_unchanged() {
        let service = Arc::new(MemoryAnnotationService::new());
        let copy_id = test_copy();
        let mut store = AnnotationStore::new(service, copy_id);

        let id = store
            .create(draft(copy_id, 1, "Hello world", "note"))
            .await
            .unwrap();
        let keeper = store
            .create(draft(copy_id, 2, "other text", "keep"))
            .await
            .unwrap();

        store.remove(id).await.unwrap();
        let after_first: Vec<AnchorId> = store.anchors().iter().map(|a| a.id).collect();

        // Second delete of the same id: NotFound from the service, success
        // for the caller.
        store.remove(id).await.unwrap();
        let after_second: Vec<AnchorId> = store.anchors().iter().map(|a| a.id).collect();

        assert_eq!(after_first, after_second);
        assert_eq!(after_first, vec![keeper]);
    }

    #[tokio::test]
    async fn created_anchors_are_newest_first() {
        let service = Arc::new(MemoryAnnotationService::new());
        let copy_id = test_copy();
        let mut store = AnnotationStore::new(service, copy_id);

        store
            .create(draft(copy_id, 1, "first", "a"))
            .await
            .unwrap();
        let second = store
            .create(draft(copy_id, 1, "second", "b"))
            .await
            .unwrap();

        assert_eq!(store.anchors()[0].id, second);
    }

    #[tokio::test]
    async fn load_failure_leaves_an_empty_recoverable_store() {
        let service = Arc::new(FlakyService::default());
        let copy_id = test_copy();
        let mut store = AnnotationStore::new(Arc::clone(&service) as Arc<dyn AnnotationService>, copy_id);

        store
            .create(draft(copy_id, 1, "Hello world", "note"))
            .await
            .unwrap();

        service.fail_list_once();
        assert!(store.load().await.is_err());
        assert!(store.is_empty());

        // The next load resynchronizes.
        store.load().await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn end_to_end_comment_round_trip() {
        let service = Arc::new(MemoryAnnotationService::new());
        let copy_id = test_copy();
        let mut session =
            ReaderSession::new(Arc::clone(&service) as Arc<dyn AnnotationService>, copy_id, 10);

        session.reload().await.unwrap();
        assert!(session.annotations().is_empty());

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::PointerUp {
            selection: raw_selection("Hello world"),
        });
        session.apply(Command::RequestAuthoring);

        let id = session.commit_comment("note").await.unwrap().unwrap();
        assert_eq!(session.annotations().len(), 1);
        let anchor = session.annotations().get(id).unwrap();
        assert_eq!(anchor.page, 3);
        assert_eq!(anchor.text, "Hello world");

        session.reload().await.unwrap();
        assert_eq!(session.annotations().len(), 1);
        assert_eq!(session.annotations().on_page(3).count(), 1);

        let recent = session.annotations_page();
        assert_eq!(recent.index, 1);
        assert_eq!(recent.items.len(), 1);
    }

    #[tokio::test]
    async fn authoring_mutex_survives_unrelated_events() {
        let service = Arc::new(MemoryAnnotationService::new());
        let copy_id = test_copy();
        let mut session =
            ReaderSession::new(Arc::clone(&service) as Arc<dyn AnnotationService>, copy_id, 10);

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::PointerUp {
            selection: raw_selection("Hello world"),
        });
        session.apply(Command::RequestAuthoring);

        // Click-outside and a collapsed selection arrive while the modal
        // mounts.
        session.apply(Command::ClickOutside);
        session.apply(Command::SelectionChanged {
            selection: RawSelection {
                text: String::new(),
                bounds: ViewportRect::default(),
                within_viewer: true,
                page_hint: None,
            },
        });

        let id = session.commit_comment("still here").await.unwrap().unwrap();
        assert_eq!(session.annotations().get(id).unwrap().text, "Hello world");
    }

    #[tokio::test]
    async fn redundant_selection_change_shows_one_popover() {
        let service = Arc::new(MemoryAnnotationService::new());
        let mut session = ReaderSession::new(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            test_copy(),
            10,
        );

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::SelectionChanged {
            selection: raw_selection("Hello world"),
        });
        session.apply(Command::SelectionChanged {
            selection: raw_selection("Hello world"),
        });

        let popovers = session
            .take_events()
            .into_iter()
            .filter(|event| *event == SessionEvent::PopoverShown)
            .count();
        assert_eq!(popovers, 1);
    }

    #[tokio::test]
    async fn empty_body_is_rejected_without_a_network_call() {
        let service = Arc::new(MemoryAnnotationService::new());
        let mut session = ReaderSession::new(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            test_copy(),
            10,
        );

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::PointerUp {
            selection: raw_selection("Hello world"),
        });
        session.apply(Command::RequestAuthoring);

        assert!(matches!(
            session.commit_comment("   ").await,
            Err(CommitError::EmptyBody)
        ));
        assert_eq!(session.selection().phase(), SelectionPhase::AuthoringLocked);
        assert!(session.annotations().is_empty());
    }

    #[tokio::test]
    async fn failed_create_reopens_the_popover_for_retry() {
        let service = Arc::new(FlakyService::default());
        let copy_id = test_copy();
        let mut session =
            ReaderSession::new(Arc::clone(&service) as Arc<dyn AnnotationService>, copy_id, 10);

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::PointerUp {
            selection: raw_selection("Hello world"),
        });
        session.apply(Command::RequestAuthoring);

        service.fail_create_once();
        assert!(session.commit_comment("note").await.is_err());
        assert_eq!(session.selection().phase(), SelectionPhase::Popover);
        assert_eq!(session.selection().candidate().unwrap().text, "Hello world");
        assert!(session.annotations().is_empty());
        assert!(!session.take_notices().is_empty());

        // Retry without re-selecting the text.
        session.apply(Command::RequestAuthoring);
        session.commit_comment("note").await.unwrap().unwrap();
        assert_eq!(session.annotations().len(), 1);
    }

    #[tokio::test]
    async fn navigation_discards_the_candidate_and_clamps() {
        let service = Arc::new(MemoryAnnotationService::new());
        let mut session = ReaderSession::new(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            test_copy(),
            10,
        );

        session.apply(Command::PointerDown {
            within_viewer: true,
        });
        session.apply(Command::PointerUp {
            selection: raw_selection("Hello world"),
        });
        assert_eq!(session.selection().phase(), SelectionPhase::Popover);

        session.go_to_page(99);
        assert_eq!(session.page(), 10);
        assert_eq!(session.selection().phase(), SelectionPhase::Idle);
        assert!(session.selection().candidate().is_none());

        assert!(session.commit_comment("late").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_a_burst_into_one_save() {
        let service = Arc::new(CountingProgressService::default());
        let tracker = ProgressTracker::with_quiet_window(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            ReadingPosition::new(test_copy(), 1, 10, 1.0),
            Duration::from_millis(1000),
        );

        tracker.record(2, 10, 1.0);
        tracker.record(3, 10, 1.0);
        tracker.record(4, 10, 1.25);

        tokio::time::sleep(Duration::from_millis(1500)).await;

        let saves = service.saves.lock();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].page, 4);
        assert_eq!(saves[0].zoom, 1.25);
    }

    #[tokio::test(start_paused = true)]
    async fn each_update_restarts_the_quiet_window() {
        let service = Arc::new(CountingProgressService::default());
        let tracker = ProgressTracker::with_quiet_window(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            ReadingPosition::new(test_copy(), 1, 10, 1.0),
            Duration::from_millis(1000),
        );

        tracker.record(2, 10, 1.0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        tracker.record(3, 10, 1.0);
        tokio::time::sleep(Duration::from_millis(600)).await;

        // 1200 ms elapsed but the window restarted at 600 ms: nothing sent
        // yet.
        assert!(service.saves.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        let saves = service.saves.lock();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].page, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_bypasses_the_quiet_window() {
        let service = Arc::new(CountingProgressService::default());
        let tracker = ProgressTracker::with_quiet_window(
            Arc::clone(&service) as Arc<dyn AnnotationService>,
            ReadingPosition::new(test_copy(), 1, 10, 1.0),
            Duration::from_millis(1000),
        );

        tracker.record(7, 10, 2.0);
        tracker.flush().await;

        let saves = service.saves.lock();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].page, 7);
    }

    #[tokio::test]
    async fn stale_search_responses_are_discarded() {
        let mut controller = SearchController::new(None);

        let alpha = controller.begin("alpha").unwrap();
        let beta = controller.begin("beta").unwrap();

        let alpha_hits = vec![SearchHit {
            score: 0.9,
            page: 1,
            kind: MatchKind::Comment,
            excerpt: "from alpha".to_string(),
        }];
        let beta_hits = vec![SearchHit {
            score: 0.7,
            page: 2,
            kind: MatchKind::Highlight,
            excerpt: "from beta".to_string(),
        }];

        // Alpha resolves late, after beta superseded it.
        assert!(!controller.accept(&alpha, alpha_hits));
        assert!(controller.hits().is_empty());

        assert!(controller.accept(&beta, beta_hits));
        assert_eq!(controller.hits().len(), 1);
        assert_eq!(controller.hits()[0].excerpt, "from beta");
    }

    #[tokio::test]
    async fn empty_query_short_circuits() {
        let mut controller = SearchController::new(None);
        let ticket = controller.begin("alpha").unwrap();
        controller.accept(
            &ticket,
            vec![SearchHit {
                score: 1.0,
                page: 1,
                kind: MatchKind::Comment,
                excerpt: "hit".to_string(),
            }],
        );

        assert!(controller.begin("   ").is_none());
        assert!(controller.hits().is_empty());
    }

    #[tokio::test]
    async fn accepted_results_reset_the_result_window() {
        let mut controller = SearchController::with_page_size(None, 5);
        let many: Vec<SearchHit> = (0..12)
            .map(|i| SearchHit {
                score: 1.0 - i as f32 * 0.01,
                page: i,
                kind: MatchKind::Comment,
                excerpt: format!("hit {i}"),
            })
            .collect();

        let first = controller.begin("alpha").unwrap();
        assert!(controller.accept(&first, many.clone()));
        controller.go_to_page(3);
        assert_eq!(controller.page().index, 3);

        let second = controller.begin("beta").unwrap();
        assert!(controller.accept(&second, many));
        assert_eq!(controller.page().index, 1);
    }

    #[tokio::test]
    async fn memory_search_scores_and_scopes() {
        let service = MemoryAnnotationService::new();
        let copy_id = test_copy();
        let other_copy = marginalia_core::copy_id_for("someone", "else.pdf");

        service
            .create_anchor(draft(copy_id, 3, "the quick brown fox", "about foxes"))
            .await
            .unwrap();
        service
            .create_anchor(draft(other_copy, 1, "fox elsewhere", "x"))
            .await
            .unwrap();

        let hits = service.search("fox", Some(copy_id)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].page, 3);
        assert_eq!(hits[0].kind, MatchKind::Comment);

        let all = service.search("fox", None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].score >= all[1].score);
    }
}
