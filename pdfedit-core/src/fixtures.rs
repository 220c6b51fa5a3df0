//! In-memory collaborators shared by the unit tests.
//!
//! Fake documents serialize to JSON: a list of pages, each with a label, a
//! size, a stored rotation and the overlays stamped onto it.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, Semaphore};

use crate::annotations::AnnotationBlob;
use crate::engine::{
    AnnotationCanvas, DocumentModel, EditorHost, ModelHandle, PageSize, RasterDocument,
    RasterEngine, RasterHandle, RenderImage, RenderSurface, RenderedFrame, StructuralDocument,
    Viewport,
};
use crate::session::CloseDecision;
use crate::Rotation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakePage {
    pub label: String,
    pub size: PageSize,
    pub rotation: u16,
    #[serde(default)]
    pub overlays: Vec<String>,
}

impl FakePage {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            size: PageSize::US_LETTER,
            rotation: 0,
            overlays: Vec::new(),
        }
    }
}

pub fn document_bytes(labels: &[&str]) -> Vec<u8> {
    let pages: Vec<FakePage> = labels.iter().map(|l| FakePage::new(l)).collect();
    encode(&pages)
}

pub fn encode(pages: &[FakePage]) -> Vec<u8> {
    serde_json::to_vec(pages).expect("fake pages serialize")
}

pub fn decode(bytes: &[u8]) -> Result<Vec<FakePage>> {
    serde_json::from_slice(bytes).context("not a fake document")
}

pub fn labels(bytes: &[u8]) -> Vec<String> {
    decode(bytes)
        .expect("valid fake document")
        .into_iter()
        .map(|p| p.label)
        .collect()
}

// ---------------------------------------------------------------------------
// Structural model

#[derive(Default)]
pub struct FakeModel {
    pub loads: AtomicUsize,
}

#[async_trait]
impl DocumentModel for FakeModel {
    async fn load(&self, bytes: &[u8]) -> Result<ModelHandle> {
        let pages = decode(bytes)?;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeDocument {
            pages: Mutex::new(pages),
        }))
    }

    async fn create(&self) -> Result<ModelHandle> {
        Ok(Arc::new(FakeDocument {
            pages: Mutex::new(Vec::new()),
        }))
    }
}

pub struct FakeDocument {
    pub pages: Mutex<Vec<FakePage>>,
}

impl FakeDocument {
    fn check(&self, index: usize) -> Result<()> {
        let count = self.pages.lock().len();
        if index >= count {
            bail!("index {index} out of range for {count} pages");
        }
        Ok(())
    }
}

#[async_trait]
impl StructuralDocument for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    fn page_size(&self, index: usize) -> Result<PageSize> {
        self.check(index)?;
        Ok(self.pages.lock()[index].size)
    }

    fn rotation(&self, index: usize) -> Result<Rotation> {
        self.check(index)?;
        Ok(Rotation::from_degrees(i32::from(self.pages.lock()[index].rotation)))
    }

    fn set_rotation(&self, index: usize, rotation: Rotation) -> Result<()> {
        self.check(index)?;
        self.pages.lock()[index].rotation = rotation.degrees();
        Ok(())
    }

    fn remove_page(&self, index: usize) -> Result<()> {
        self.check(index)?;
        self.pages.lock().remove(index);
        Ok(())
    }

    fn insert_blank_page(&self, index: usize, size: PageSize) -> Result<()> {
        let mut pages = self.pages.lock();
        if index > pages.len() {
            bail!("insert index {index} out of range");
        }
        let mut page = FakePage::new("blank");
        page.size = size;
        pages.insert(index, page);
        Ok(())
    }

    fn import_pages(
        &self,
        source: &dyn StructuralDocument,
        indices: &[usize],
        at: usize,
    ) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<FakeDocument>()
            .ok_or_else(|| anyhow!("foreign document"))?;
        let copied: Vec<FakePage> = {
            let pages = source.pages.lock();
            indices
                .iter()
                .map(|&i| pages.get(i).cloned().ok_or_else(|| anyhow!("no page {i}")))
                .collect::<Result<_>>()?
        };
        let mut pages = self.pages.lock();
        if at > pages.len() {
            bail!("insert index {at} out of range");
        }
        for (offset, page) in copied.into_iter().enumerate() {
            pages.insert(at + offset, page);
        }
        Ok(())
    }

    fn stamp_overlay(&self, index: usize, png: &[u8]) -> Result<()> {
        self.check(index)?;
        self.pages.lock()[index]
            .overlays
            .push(String::from_utf8_lossy(png).into_owned());
        Ok(())
    }

    async fn serialize(&self) -> Result<Vec<u8>> {
        Ok(encode(&self.pages.lock()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Rasterizer

/// Lets a test hold a render open until it releases a permit.
pub struct RenderGate {
    pub started: Notify,
    pub permits: Semaphore,
}

impl RenderGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Notify::new(),
            permits: Semaphore::new(0),
        })
    }

    pub fn release(&self, renders: usize) {
        self.permits.add_permits(renders);
    }
}

#[derive(Default)]
pub struct FakeRaster {
    pub renders: Arc<Mutex<Vec<(usize, u32, u16)>>>,
    pub destroyed: Arc<Mutex<Vec<usize>>>,
    pub gate: Option<Arc<RenderGate>>,
    pub fail_loads: AtomicBool,
    pub failing_pages: Arc<Mutex<HashSet<usize>>>,
    next_id: AtomicUsize,
}

impl FakeRaster {
    pub fn gated(gate: Arc<RenderGate>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn rendered_pages(&self) -> Vec<usize> {
        self.renders.lock().iter().map(|(page, _, _)| *page).collect()
    }
}

#[async_trait]
impl RasterEngine for FakeRaster {
    async fn load(&self, bytes: &[u8]) -> Result<RasterHandle> {
        if self.fail_loads.load(Ordering::SeqCst) {
            bail!("rasterizer refused the document");
        }
        let pages = decode(bytes)?;
        Ok(Arc::new(FakeRasterDocument {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            pages,
            renders: Arc::clone(&self.renders),
            destroyed: Arc::clone(&self.destroyed),
            failing_pages: Arc::clone(&self.failing_pages),
            gate: self.gate.clone(),
        }))
    }
}

pub struct FakeRasterDocument {
    pub id: usize,
    pages: Vec<FakePage>,
    renders: Arc<Mutex<Vec<(usize, u32, u16)>>>,
    destroyed: Arc<Mutex<Vec<usize>>>,
    failing_pages: Arc<Mutex<HashSet<usize>>>,
    gate: Option<Arc<RenderGate>>,
}

impl FakeRasterDocument {
    fn page(&self, page: usize) -> Result<&FakePage> {
        page.checked_sub(1)
            .and_then(|i| self.pages.get(i))
            .ok_or_else(|| anyhow!("page {page} out of range"))
    }
}

#[async_trait]
impl RasterDocument for FakeRasterDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn native_rotation(&self, page: usize) -> Result<Rotation> {
        Ok(Rotation::from_degrees(i32::from(self.page(page)?.rotation)))
    }

    fn viewport(&self, page: usize, scale: f32, rotation: Rotation) -> Result<Viewport> {
        let size = self.page(page)?.size;
        let (width, height) = match rotation.degrees() {
            90 | 270 => (size.height, size.width),
            _ => (size.width, size.height),
        };
        Ok(Viewport {
            width: width * scale,
            height: height * scale,
        })
    }

    async fn render_page(&self, page: usize, scale: f32, rotation: Rotation) -> Result<RenderImage> {
        self.page(page)?;
        self.renders
            .lock()
            .push((page, (scale * 1000.0).round() as u32, rotation.degrees()));
        if let Some(gate) = &self.gate {
            gate.started.notify_one();
            gate.permits
                .acquire()
                .await
                .map_err(|err| anyhow!(err))?
                .forget();
        }
        if self.failing_pages.lock().contains(&page) {
            bail!("simulated raster failure");
        }
        Ok(RenderImage {
            width: 1,
            height: 1,
            pixels: vec![page as u8, 0, 0, 255],
        })
    }

    fn destroy(&self) {
        self.destroyed.lock().push(self.id);
    }
}

// ---------------------------------------------------------------------------
// Canvas, surface, host

#[derive(Default)]
pub struct FakeCanvas {
    contents: Mutex<Option<String>>,
    pub sizes: Mutex<Vec<(f32, f32)>>,
}

impl FakeCanvas {
    pub fn draw(&self, text: &str) {
        *self.contents.lock() = Some(text.to_owned());
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.lock().clone()
    }
}

impl AnnotationCanvas for FakeCanvas {
    fn serialize_current_page(&self) -> Option<AnnotationBlob> {
        self.contents
            .lock()
            .as_ref()
            .map(|text| AnnotationBlob::new(text.as_bytes().to_vec()))
    }

    fn restore(&self, blob: &AnnotationBlob) {
        *self.contents.lock() = Some(String::from_utf8_lossy(blob.as_bytes()).into_owned());
    }

    fn clear(&self) {
        *self.contents.lock() = None;
    }

    fn resize(&self, width: f32, height: f32) {
        self.sizes.lock().push((width, height));
    }

    fn export_png(&self) -> Result<Vec<u8>> {
        Ok(self.contents().unwrap_or_default().into_bytes())
    }
}

#[derive(Default)]
pub struct RecordingSurface {
    pub frames: Mutex<Vec<usize>>,
}

impl RenderSurface for RecordingSurface {
    fn present(&self, frame: &RenderedFrame) {
        self.frames.lock().push(frame.page);
    }
}

#[derive(Default)]
pub struct FakeHost {
    pub decisions: Mutex<VecDeque<CloseDecision>>,
    pub prompts: Mutex<Vec<String>>,
    pub writes: Mutex<Vec<(Option<PathBuf>, Vec<u8>)>>,
    pub save_as: Mutex<Option<PathBuf>>,
    pub fail_writes: AtomicBool,
}

impl FakeHost {
    pub fn answering(decisions: &[CloseDecision]) -> Self {
        Self {
            decisions: Mutex::new(decisions.iter().copied().collect()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl EditorHost for FakeHost {
    async fn confirm_unsaved(&self, display_name: &str) -> CloseDecision {
        self.prompts.lock().push(display_name.to_owned());
        self.decisions
            .lock()
            .pop_front()
            .unwrap_or(CloseDecision::Cancel)
    }

    async fn write_document(&self, path: Option<&Path>, bytes: Vec<u8>) -> Result<Option<PathBuf>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        let target = match path {
            Some(path) => Some(path.to_path_buf()),
            None => self.save_as.lock().clone(),
        };
        self.writes.lock().push((path.map(Path::to_path_buf), bytes));
        Ok(target)
    }
}
