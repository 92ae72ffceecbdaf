//! Diagram block entity used by the repair loop.

use serde::{Deserialize, Serialize};

/// Validation state of one extracted diagram block.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    /// Not yet submitted to the external renderer.
    Unvalidated,
    /// Renderer accepted the source.
    Valid,
    /// Renderer rejected the source.
    Invalid,
}

/// One fenced diagram extracted from a completed document.
///
/// Owned by the repair loop for the duration of a single pass and
/// discarded once the pass concludes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DiagramBlock {
    /// Stable 0-based position within the document.
    pub index: usize,
    /// Raw diagram source between the fences.
    pub source: String,
    /// Current validation state.
    pub validation: ValidationState,
    /// Correction cycles consumed by this block.
    pub fix_attempts: u32,
    /// Most recent validator error, if any.
    pub last_error: Option<String>,
}

impl DiagramBlock {
    /// Construct an unvalidated block at the given document position.
    #[must_use]
    pub fn new(index: usize, source: String) -> Self {
        Self {
            index,
            source,
            validation: ValidationState::Unvalidated,
            fix_attempts: 0,
            last_error: None,
        }
    }
}
