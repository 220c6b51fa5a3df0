use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::engine::AnnotationCanvas;
use crate::remap::PageIndexRemap;
use crate::PageMap;

/// Serialized vector layer of one page. Opaque to the core: it is only ever
/// moved between page keys, never inspected.
#[derive(Clone, PartialEq, Eq)]
pub struct AnnotationBlob(Arc<[u8]>);

impl AnnotationBlob {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for AnnotationBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnnotationBlob({} bytes)", self.0.len())
    }
}

/// Per-document page → annotation layer table.
#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    pages: PageMap<AnnotationBlob>,
}

impl AnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures what the canvas currently shows as the layer of `page`. An
    /// empty canvas removes the entry instead of storing a blank layer.
    pub fn store_page(&mut self, canvas: &dyn AnnotationCanvas, page: usize) {
        match canvas.serialize_current_page() {
            Some(blob) => {
                trace!(page, "storing annotation layer");
                self.pages.insert(page, blob);
            }
            None => {
                self.pages.remove(&page);
            }
        }
    }

    /// Clears the canvas and restores the layer of `page`, if any.
    pub fn load_page(&self, canvas: &dyn AnnotationCanvas, page: usize) {
        canvas.clear();
        if let Some(blob) = self.pages.get(&page) {
            canvas.restore(blob);
        }
    }

    pub fn get(&self, page: usize) -> Option<&AnnotationBlob> {
        self.pages.get(&page)
    }

    pub fn has_annotations(&self, page: usize) -> bool {
        self.pages.contains_key(&page)
    }

    pub fn insert(&mut self, page: usize, blob: AnnotationBlob) {
        self.pages.insert(page, blob);
    }

    pub fn remap(&mut self, remap: &PageIndexRemap) {
        let pages = std::mem::take(&mut self.pages);
        self.pages = remap.apply(pages);
    }

    pub fn pages(&self) -> &PageMap<AnnotationBlob> {
        &self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
