use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AnchorId, DocumentCopyId};

/// Position of an anchor in unscaled document units.
///
/// Positions are stored independent of the zoom level, so the same anchor can
/// be projected back to screen space at whatever scale is current at render
/// time: `display = stored * current_scale`. Comments anchor at a point,
/// highlights cover the selected span.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PageRegion {
    Rect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
    Point {
        x: f32,
        y: f32,
    },
}

impl PageRegion {
    pub fn origin(&self) -> (f32, f32) {
        match *self {
            PageRegion::Rect { x, y, .. } => (x, y),
            PageRegion::Point { x, y } => (x, y),
        }
    }

    pub fn size(&self) -> Option<(f32, f32)> {
        match *self {
            PageRegion::Rect { width, height, .. } => Some((width, height)),
            PageRegion::Point { .. } => None,
        }
    }

    /// Collapses the region to its top-left corner.
    pub fn collapsed(&self) -> PageRegion {
        let (x, y) = self.origin();
        PageRegion::Point { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HighlightColor {
    #[default]
    Yellow,
    Green,
    Blue,
    Pink,
}

impl HighlightColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            HighlightColor::Yellow => "yellow",
            HighlightColor::Green => "green",
            HighlightColor::Blue => "blue",
            HighlightColor::Pink => "pink",
        }
    }
}

/// Payload distinguishing a comment from a highlight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorBody {
    Comment { body: String },
    Highlight { color: HighlightColor },
}

impl AnchorBody {
    pub fn is_comment(&self) -> bool {
        matches!(self, AnchorBody::Comment { .. })
    }

    pub fn match_kind(&self) -> MatchKind {
        match self {
            AnchorBody::Comment { .. } => MatchKind::Comment,
            AnchorBody::Highlight { .. } => MatchKind::Highlight,
        }
    }
}

/// A persisted comment or highlight tied to a text span on one page.
///
/// Anchors are never mutated in place; the only supported operations are
/// create and delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: AnchorId,
    pub copy_id: DocumentCopyId,
    pub page: u32,
    pub region: PageRegion,
    /// The exact text that was selected when the anchor was captured.
    pub text: String,
    #[serde(flatten)]
    pub body: AnchorBody,
    pub created_at: DateTime<Utc>,
}

/// Reading position of one document copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub copy_id: DocumentCopyId,
    pub page: u32,
    pub total_pages: u32,
    pub zoom: f32,
    pub updated_at: DateTime<Utc>,
}

impl ReadingPosition {
    pub fn new(copy_id: DocumentCopyId, page: u32, total_pages: u32, zoom: f32) -> Self {
        Self {
            copy_id,
            page,
            total_pages,
            zoom,
            updated_at: Utc::now(),
        }
    }

    pub fn percent_complete(&self) -> f32 {
        if self.total_pages == 0 {
            return 0.0;
        }
        (self.page as f32 / self.total_pages as f32 * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Comment,
    Highlight,
}

/// One scored match from the semantic index. Discarded when the query
/// changes; never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub score: f32,
    pub page: u32,
    pub kind: MatchKind,
    pub excerpt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A dismissible notification surfaced to the embedding UI. Transient
/// failures produce one of these; validation failures never do.
#[derive(Debug, Clone)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}
