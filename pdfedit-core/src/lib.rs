//! Session orchestration, page mutation and render scheduling for a
//! multi-document PDF editor.
//!
//! The heavy lifting (parsing, rasterizing, drawing) belongs to the
//! collaborators declared in [`engine`]; this crate keeps their per-document
//! state consistent across session switches, structural edits and render
//! bursts.

pub mod annotations;
pub mod config;
pub mod engine;
pub mod error;
pub mod mutation;
pub mod remap;
pub mod scheduler;
pub mod session;
pub mod text_edit;
pub mod workbench;

#[cfg(test)]
mod fixtures;

use std::collections::BTreeMap;

pub use annotations::{AnnotationBlob, AnnotationStore};
pub use config::{EditorConfig, ZoomConfig};
pub use engine::{
    AnnotationCanvas, DocumentModel, EditorHost, ModelHandle, NullSurface, PageSize,
    RasterDocument, RasterEngine, RasterHandle, RenderImage, RenderSurface, RenderedFrame,
    StructuralDocument, Viewport,
};
pub use error::{EditorError, EditorResult, Rejection};
pub use mutation::{parse_page_ranges, PageMutation, PageMutationEngine, SplitOutput};
pub use remap::PageIndexRemap;
pub use scheduler::{RenderOutcome, RenderScheduler};
pub use session::{CloseDecision, EditorEvent, Session, SessionId, SessionRegistry};
pub use text_edit::{
    ExitAction, TextEditMachine, TextEditState, TextObjectId, TextStyleChange, Tool,
};
pub use workbench::{ScrollOffset, SessionSnapshot, Workbench};

/// Sparse page-keyed side table. Keys are 1-based page numbers.
pub type PageMap<V> = BTreeMap<usize, V>;

/// Quarter-turn page rotation in degrees: one of 0, 90, 180 or 270.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rotation(u16);

impl Rotation {
    pub const NONE: Rotation = Rotation(0);

    /// Normalizes any multiple of 90 (negative included) into `0..360`.
    pub fn from_degrees(degrees: i32) -> Self {
        let snapped = (degrees / 90) * 90;
        Rotation(snapped.rem_euclid(360) as u16)
    }

    pub fn degrees(self) -> u16 {
        self.0
    }

    pub fn rotate_by(self, delta: i32) -> Self {
        let delta = Rotation::from_degrees(delta);
        Rotation::from_degrees(i32::from(self.0) + i32::from(delta.0))
    }

    /// Native rotation plus a user override, modulo 360.
    pub fn combine(self, other: Rotation) -> Self {
        Rotation((self.0 + other.0) % 360)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Converts a 1-based page number into the 0-based index structural
/// collaborators work with.
pub(crate) fn page_index(page: usize) -> usize {
    page.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_normalizes_negative_and_oversized_turns() {
        assert_eq!(Rotation::from_degrees(-90).degrees(), 270);
        assert_eq!(Rotation::from_degrees(450).degrees(), 90);
        assert_eq!(Rotation::NONE.rotate_by(-180).degrees(), 180);
        assert_eq!(Rotation::from_degrees(270).rotate_by(180).degrees(), 90);
    }

    #[test]
    fn rotate_by_extreme_deltas_does_not_overflow() {
        // i32::MAX - 7 snaps to 2147483610, which is 90 modulo 360.
        assert_eq!(Rotation::NONE.rotate_by(90).rotate_by(i32::MAX - 7).degrees(), 180);
        // i32::MIN snaps to -2147483610, which is 270 modulo 360.
        assert_eq!(Rotation::from_degrees(270).rotate_by(i32::MIN).degrees(), 180);
    }
}
