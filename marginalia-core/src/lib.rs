use once_cell::sync::Lazy;
use uuid::Uuid;

pub mod geometry;
pub mod model;
pub mod paging;
pub mod selection;

pub use geometry::{GeometryNormalizer, PageMetrics, ViewportPoint, ViewportRect, MIN_SCALE};
pub use model::{
    Anchor, AnchorBody, HighlightColor, MatchKind, Notice, NoticeLevel, PageRegion,
    ReadingPosition, SearchHit,
};
pub use paging::{PageView, PageWindow};
pub use selection::{
    clean_selection_text, Candidate, RawSelection, RejectReason, SelectionMachine, SelectionPhase,
    SelectionValidator, AUTHORING_GRACE, MAX_SELECTION_LINES, MAX_WHITESPACE_RATIO,
    MIN_SELECTION_CHARS,
};

/// Per-reader instance of a shared document. Each copy owns its own
/// annotations and reading position.
pub type DocumentCopyId = Uuid;

/// Server-assigned identifier of a persisted anchor.
pub type AnchorId = Uuid;

static COPY_NAMESPACE: Lazy<Uuid> = Lazy::new(|| {
    Uuid::parse_str("f4d9a1c2-6d0b-5e83-9a47-31b28cd0f5e6").expect("valid namespace UUID")
});

/// Derives a stable copy id from a reader and a document name, so repeated
/// sessions address the same annotation set.
pub fn copy_id_for(reader: &str, document: &str) -> DocumentCopyId {
    let mut seed = String::with_capacity(reader.len() + document.len() + 1);
    seed.push_str(reader);
    seed.push('\n');
    seed.push_str(document);
    Uuid::new_v5(&COPY_NAMESPACE, seed.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_id_is_stable_for_same_reader_and_document() {
        let first = copy_id_for("ada", "structures.pdf");
        let second = copy_id_for("ada", "structures.pdf");
        assert_eq!(first, second);
    }

    #[test]
    fn copy_id_distinguishes_readers() {
        assert_ne!(
            copy_id_for("ada", "structures.pdf"),
            copy_id_for("grace", "structures.pdf")
        );
    }
}
