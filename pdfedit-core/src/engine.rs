//! Contracts for the collaborators the core drives but never implements:
//! the rasterizer, the structural document model, the annotation canvas and
//! the host that owns dialogs and files.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::annotations::AnnotationBlob;
use crate::session::CloseDecision;
use crate::Rotation;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageSize {
    pub width: f32,
    pub height: f32,
}

impl PageSize {
    pub const US_LETTER: PageSize = PageSize {
        width: 612.0,
        height: 792.0,
    };
}

impl Default for PageSize {
    fn default() -> Self {
        Self::US_LETTER
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// A finished rasterization handed to the [`RenderSurface`].
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub page: usize,
    pub scale: f32,
    pub rotation: Rotation,
    pub viewport: Viewport,
    pub image: RenderImage,
}

/// The shared rasterizer pipeline. One instance serves every session; each
/// loaded document is a separate [`RasterHandle`].
#[async_trait]
pub trait RasterEngine: Send + Sync {
    async fn load(&self, bytes: &[u8]) -> Result<RasterHandle>;
}

pub type RasterHandle = Arc<dyn RasterDocument>;

/// A document loaded into the rasterizer. Pages are 1-based.
#[async_trait]
pub trait RasterDocument: Send + Sync {
    fn page_count(&self) -> usize;

    /// Rotation stored in the document itself, before user overrides.
    fn native_rotation(&self, page: usize) -> Result<Rotation>;

    fn viewport(&self, page: usize, scale: f32, rotation: Rotation) -> Result<Viewport>;

    async fn render_page(&self, page: usize, scale: f32, rotation: Rotation)
        -> Result<RenderImage>;

    /// Releases native raster state. Later calls on this handle may fail.
    fn destroy(&self);
}

#[async_trait]
pub trait DocumentModel: Send + Sync {
    async fn load(&self, bytes: &[u8]) -> Result<ModelHandle>;

    /// A new document with no pages.
    async fn create(&self) -> Result<ModelHandle>;
}

pub type ModelHandle = Arc<dyn StructuralDocument>;

/// Page-level editing surface of the structural model. Indices are 0-based.
#[async_trait]
pub trait StructuralDocument: Send + Sync {
    fn page_count(&self) -> usize;

    fn page_size(&self, index: usize) -> Result<PageSize>;

    fn rotation(&self, index: usize) -> Result<Rotation>;

    fn set_rotation(&self, index: usize, rotation: Rotation) -> Result<()>;

    fn remove_page(&self, index: usize) -> Result<()>;

    fn insert_blank_page(&self, index: usize, size: PageSize) -> Result<()>;

    /// Copies `indices` of `source` (which may be `self`) and inserts them, in
    /// order, starting at `at`.
    fn import_pages(&self, source: &dyn StructuralDocument, indices: &[usize], at: usize)
        -> Result<()>;

    /// Draws a full-page PNG overlay on top of the page content.
    fn stamp_overlay(&self, index: usize, png: &[u8]) -> Result<()>;

    async fn serialize(&self) -> Result<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;
}

/// The vector overlay editor. It only ever shows the current page; the core
/// moves serialized layers in and out of it.
pub trait AnnotationCanvas: Send + Sync {
    /// `None` when the current layer holds no objects.
    fn serialize_current_page(&self) -> Option<AnnotationBlob>;

    fn restore(&self, blob: &AnnotationBlob);

    fn clear(&self);

    fn resize(&self, width: f32, height: f32);

    /// Rasterizes the current layer for flattening into the page at save time.
    fn export_png(&self) -> Result<Vec<u8>>;
}

pub trait RenderSurface: Send + Sync {
    fn present(&self, frame: &RenderedFrame);
}

/// Dialogs and file access owned by the embedding application.
#[async_trait]
pub trait EditorHost: Send + Sync {
    async fn confirm_unsaved(&self, display_name: &str) -> CloseDecision;

    /// Writes `bytes` to `path`, or asks for one when `path` is `None`.
    /// Returns the path written, or `None` if the user abandoned the save.
    async fn write_document(&self, path: Option<&Path>, bytes: Vec<u8>)
        -> Result<Option<PathBuf>>;
}

/// A surface that discards frames, for hosts that only care about the
/// scheduler's bookkeeping.
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn present(&self, _frame: &RenderedFrame) {}
}
