use std::time::{Duration, Instant};

use tracing::debug;

use crate::geometry::ViewportRect;

/// Minimum cleaned length for a selection to count as intentional.
pub const MIN_SELECTION_CHARS: usize = 2;

/// Selections spanning more than this many non-blank lines are treated as
/// accidental whole-page grabs.
pub const MAX_SELECTION_LINES: usize = 3;

/// Selections whose raw text is mostly layout whitespace are noise.
pub const MAX_WHITESPACE_RATIO: f32 = 0.5;

/// How long the authoring mutex absorbs stray events after it is taken. The
/// authoring surface's own mount fires a burst of selection-change and click
/// events that must not tear down the state it was opened for.
pub const AUTHORING_GRACE: Duration = Duration::from_millis(300);

/// Raw output of the embedding viewer's selection API. Ephemeral: discarded
/// on the next selection change, navigation, or commit.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSelection {
    pub text: String,
    pub bounds: ViewportRect,
    /// Whether the selection's common ancestor lies inside the viewer
    /// subtree.
    pub within_viewer: bool,
    /// Page resolved from the nearest ancestor carrying a page marker.
    pub page_hint: Option<u32>,
}

/// A validated selection under consideration for annotation. Exclusively
/// owned by the [`SelectionMachine`]; other components only request
/// transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub text: String,
    pub bounds: ViewportRect,
    pub page: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    OutsideViewer,
    TooShort,
    TooManyLines,
    MostlyWhitespace,
    DuplicateOfLast,
}

/// Collapses whitespace runs to single spaces and trims the ends; embedded
/// newlines become spaces.
pub fn clean_selection_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Classifies a raw selection as a genuine annotation target or noise,
/// before it triggers any UI.
#[derive(Debug, Default)]
pub struct SelectionValidator {
    last_processed: Option<String>,
}

impl SelectionValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(
        &mut self,
        raw: &RawSelection,
        current_page: u32,
    ) -> Result<Candidate, RejectReason> {
        if !raw.within_viewer {
            return Err(RejectReason::OutsideViewer);
        }

        let cleaned = clean_selection_text(&raw.text);
        if cleaned.chars().count() < MIN_SELECTION_CHARS {
            return Err(RejectReason::TooShort);
        }

        let lines = raw.text.lines().filter(|line| !line.trim().is_empty()).count();
        if lines > MAX_SELECTION_LINES {
            return Err(RejectReason::TooManyLines);
        }

        // The ratio is computed over the raw text: cleaning collapses exactly
        // the whitespace this heuristic is meant to detect.
        let total = raw.text.chars().count();
        let blank = raw.text.chars().filter(|c| c.is_whitespace()).count();
        if total > 0 && blank as f32 / total as f32 > MAX_WHITESPACE_RATIO {
            return Err(RejectReason::MostlyWhitespace);
        }

        if self.last_processed.as_deref() == Some(cleaned.as_str()) {
            return Err(RejectReason::DuplicateOfLast);
        }
        self.last_processed = Some(cleaned.clone());

        Ok(Candidate {
            text: cleaned,
            bounds: raw.bounds,
            page: raw.page_hint.unwrap_or(current_page),
        })
    }

    /// Clears the duplicate memo so the next genuine selection of the same
    /// text is not rejected.
    pub fn forget_last(&mut self) {
        self.last_processed = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPhase {
    Idle,
    Selecting,
    Popover,
    AuthoringLocked,
}

/// Lifecycle of a selection: `Idle -> Selecting -> Popover ->
/// AuthoringLocked -> Idle`.
///
/// Entering `AuthoringLocked` takes a hard mutex: selection-change and
/// click-outside handling is suppressed until release, so opening an
/// authoring surface can never silently clear the candidate it was opened
/// for. Any page or zoom change force-resets to `Idle` from every state.
#[derive(Debug)]
pub struct SelectionMachine {
    phase: SelectionPhase,
    candidate: Option<Candidate>,
    validator: SelectionValidator,
    locked_at: Option<Instant>,
    grace: Duration,
}

impl Default for SelectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionMachine {
    pub fn new() -> Self {
        Self::with_grace(AUTHORING_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            phase: SelectionPhase::Idle,
            candidate: None,
            validator: SelectionValidator::new(),
            locked_at: None,
            grace,
        }
    }

    pub fn phase(&self) -> SelectionPhase {
        self.phase
    }

    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    pub fn is_locked(&self) -> bool {
        self.phase == SelectionPhase::AuthoringLocked
    }

    fn within_grace(&self) -> bool {
        self.locked_at
            .is_some_and(|taken| taken.elapsed() < self.grace)
    }

    /// Pointer pressed. Inside the viewer this begins a new selection and
    /// dismisses any popover; outside it behaves like a click-outside.
    pub fn pointer_down(&mut self, within_viewer: bool) {
        if self.is_locked() {
            debug!("pointer down suppressed while authoring is locked");
            return;
        }
        // A press starts a fresh gesture; the previous selection's memo no
        // longer guards against redundant event re-firing.
        self.validator.forget_last();
        if within_viewer {
            self.candidate = None;
            self.phase = SelectionPhase::Selecting;
        } else {
            self.click_outside();
        }
    }

    /// Pointer released with the viewer's current raw selection. Returns
    /// true when a popover should be shown.
    pub fn pointer_up(&mut self, raw: &RawSelection, current_page: u32) -> bool {
        self.process_selection(raw, current_page)
    }

    /// Redundant selection-change events take the same path as pointer-up;
    /// the duplicate memo keeps them from re-opening the popover.
    pub fn selection_changed(&mut self, raw: &RawSelection, current_page: u32) -> bool {
        self.process_selection(raw, current_page)
    }

    fn process_selection(&mut self, raw: &RawSelection, current_page: u32) -> bool {
        if self.is_locked() {
            debug!("selection change suppressed while authoring is locked");
            return false;
        }
        match self.validator.validate(raw, current_page) {
            Ok(candidate) => {
                self.candidate = Some(candidate);
                self.phase = SelectionPhase::Popover;
                true
            }
            Err(RejectReason::DuplicateOfLast) => {
                debug!("duplicate selection event ignored");
                false
            }
            Err(reason) => {
                debug!(?reason, "selection rejected");
                // Noise must not tear down an existing popover: the act of
                // clicking the popover itself collapses the native selection.
                if self.phase == SelectionPhase::Selecting {
                    self.phase = SelectionPhase::Idle;
                    self.candidate = None;
                }
                false
            }
        }
    }

    /// Click landed outside both viewer and popover. Suppressed while
    /// authoring is locked.
    pub fn click_outside(&mut self) {
        if self.is_locked() {
            debug!("click outside suppressed while authoring is locked");
            return;
        }
        self.phase = SelectionPhase::Idle;
        self.candidate = None;
    }

    /// User asked to author a comment for the popover candidate. Takes the
    /// authoring mutex.
    pub fn request_authoring(&mut self) -> bool {
        if self.phase != SelectionPhase::Popover || self.candidate.is_none() {
            return false;
        }
        self.phase = SelectionPhase::AuthoringLocked;
        self.locked_at = Some(Instant::now());
        true
    }

    /// Snapshot of the candidate for a commit attempt. `None` when no
    /// candidate exists: a commit fired during a race is a no-op, not an
    /// error.
    pub fn commit_begin(&self) -> Option<Candidate> {
        match self.phase {
            SelectionPhase::Popover | SelectionPhase::AuthoringLocked => self.candidate.clone(),
            _ => None,
        }
    }

    /// The remote create succeeded. Releases the mutex, clears the candidate
    /// and the duplicate memo so the next genuine selection is accepted.
    pub fn complete_commit(&mut self) {
        self.phase = SelectionPhase::Idle;
        self.candidate = None;
        self.locked_at = None;
        self.validator.forget_last();
    }

    /// The remote create failed. Falls back to the popover with the candidate
    /// intact so the user can retry without re-selecting the text.
    pub fn commit_failed(&mut self) {
        self.locked_at = None;
        self.phase = if self.candidate.is_some() {
            SelectionPhase::Popover
        } else {
            SelectionPhase::Idle
        };
    }

    /// Dismisses authoring or the popover. Inside the grace window after the
    /// mutex was taken the request is absorbed; the mount burst of the
    /// authoring surface is indistinguishable from a real escape.
    pub fn cancel(&mut self) -> bool {
        if self.is_locked() && self.within_grace() {
            debug!("cancel absorbed within the authoring grace period");
            return false;
        }
        self.phase = SelectionPhase::Idle;
        self.candidate = None;
        self.locked_at = None;
        self.validator.forget_last();
        true
    }

    /// Page or zoom changed: stale candidates must never survive navigation,
    /// whatever state the machine is in.
    pub fn navigation_changed(&mut self) {
        self.phase = SelectionPhase::Idle;
        self.candidate = None;
        self.locked_at = None;
        self.validator.forget_last();
    }
}
