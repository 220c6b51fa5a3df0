use std::any::Any;
use std::convert::TryFrom;
use std::mem;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfedit_core::{
    DocumentModel, ModelHandle, PageSize, RasterDocument, RasterEngine, RasterHandle,
    RenderImage, Rotation, StructuralDocument, Viewport,
};
use pdfium_render::prelude::*;
use tracing::{debug, instrument, warn};

/// Environment variable naming a pdfium shared library to bind before the
/// default search locations.
pub const PDFIUM_LIBRARY_ENV: &str = "PDFEDIT_PDFIUM_LIBRARY_PATH";

/// Shared pdfium bindings. Serves as both the rasterizer and the structural
/// document model; every loaded document is an independent pdfium handle.
pub struct PdfiumEngine {
    pdfium: Arc<Pdfium>,
}

impl PdfiumEngine {
    /// Binds pdfium from `library` if given, then from
    /// [`PDFIUM_LIBRARY_ENV`], then from the working directory or the system.
    pub fn new(library: Option<&Path>) -> Result<Self> {
        let pdfium = match library.and_then(bind_pdfium_at) {
            Some(pdfium) => pdfium,
            None => match bind_pdfium_from_env() {
                Some(pdfium) => pdfium,
                None => bind_pdfium_default()?,
            },
        };
        Ok(Self {
            pdfium: Arc::new(pdfium),
        })
    }
}

#[async_trait]
impl RasterEngine for PdfiumEngine {
    #[instrument(skip_all, fields(len = bytes.len()))]
    async fn load(&self, bytes: &[u8]) -> Result<RasterHandle> {
        let pdf = LoadedPdf::load(&self.pdfium, bytes.to_vec())?;
        let page_count = pdf.page_count()?;
        debug!(page_count, "raster document loaded");
        Ok(Arc::new(PdfiumRasterDocument { page_count, pdf }))
    }
}

#[async_trait]
impl DocumentModel for PdfiumEngine {
    async fn load(&self, bytes: &[u8]) -> Result<ModelHandle> {
        let pdf = LoadedPdf::load(&self.pdfium, bytes.to_vec())?;
        Ok(Arc::new(PdfiumStructuralDocument { pdf }))
    }

    async fn create(&self) -> Result<ModelHandle> {
        let pdf = LoadedPdf::create(&self.pdfium)?;
        Ok(Arc::new(PdfiumStructuralDocument { pdf }))
    }
}

/// A pdfium document kept open next to the bindings it borrows from.
struct LoadedPdf {
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
}

impl LoadedPdf {
    fn load(pdfium: &Arc<Pdfium>, bytes: Vec<u8>) -> Result<Self> {
        let document = pdfium
            .load_pdf_from_byte_vec(bytes, None)
            .context("failed to parse PDF bytes")?;
        Ok(Self::hold(pdfium, document))
    }

    fn create(pdfium: &Arc<Pdfium>) -> Result<Self> {
        let document = pdfium
            .create_new_pdf()
            .context("failed to create empty PDF")?;
        Ok(Self::hold(pdfium, document))
    }

    fn hold(pdfium: &Arc<Pdfium>, document: PdfDocument<'_>) -> Self {
        // SAFETY: the document borrows the bindings behind `pdfium`. Both are
        // stored in the same struct and `document` is declared first, so it is
        // dropped before this struct's reference to the bindings.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Self {
            document: Mutex::new(Some(document)),
            pdfium: Arc::clone(pdfium),
        }
    }

    fn with_document<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut PdfDocument<'static>) -> Result<R>,
    {
        let mut guard = self.document.lock();
        let document = guard
            .as_mut()
            .ok_or_else(|| anyhow!("document has been released"))?;
        f(document)
    }

    fn page_count(&self) -> Result<usize> {
        self.with_document(|document| Ok(usize::try_from(document.pages().len()).unwrap_or_default()))
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        self.with_document(|document| document.save_to_bytes().context("failed to serialize PDF"))
    }

    fn release(&self) {
        self.document.lock().take();
    }
}

fn pdfium_index(index: usize) -> Result<PdfPageIndex> {
    index
        .try_into()
        .map_err(|_| anyhow!("page index {} is out of supported range", index))
}

fn page_at(document: &PdfDocument<'static>, index: usize) -> Result<PdfPage<'static>> {
    document
        .pages()
        .get(pdfium_index(index)?)
        .with_context(|| format!("page index {} out of range", index))
}

fn rotation_from_pdfium(rotation: PdfPageRenderRotation) -> Rotation {
    match rotation {
        PdfPageRenderRotation::None => Rotation::NONE,
        PdfPageRenderRotation::Degrees90 => Rotation::from_degrees(90),
        PdfPageRenderRotation::Degrees180 => Rotation::from_degrees(180),
        PdfPageRenderRotation::Degrees270 => Rotation::from_degrees(270),
    }
}

fn rotation_to_pdfium(rotation: Rotation) -> PdfPageRenderRotation {
    match rotation.degrees() {
        90 => PdfPageRenderRotation::Degrees90,
        180 => PdfPageRenderRotation::Degrees180,
        270 => PdfPageRenderRotation::Degrees270,
        _ => PdfPageRenderRotation::None,
    }
}

/// pdfium reports page extents with the stored rotation already applied, so
/// only the part of `effective` beyond `native` is left for the renderer.
fn relative_rotation(effective: Rotation, native: Rotation) -> Rotation {
    Rotation::from_degrees(i32::from(effective.degrees()) - i32::from(native.degrees()))
}

fn rotated_extent(width: f32, height: f32, scale: f32, relative: Rotation) -> Viewport {
    let (width, height) = match relative.degrees() {
        90 | 270 => (height, width),
        _ => (width, height),
    };
    Viewport {
        width: width * scale,
        height: height * scale,
    }
}

pub struct PdfiumRasterDocument {
    page_count: usize,
    pdf: LoadedPdf,
}

impl PdfiumRasterDocument {
    fn page_index(&self, page: usize) -> Result<usize> {
        if page == 0 || page > self.page_count {
            return Err(anyhow!("page {} outside 1..={}", page, self.page_count));
        }
        Ok(page - 1)
    }
}

#[async_trait]
impl RasterDocument for PdfiumRasterDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn native_rotation(&self, page: usize) -> Result<Rotation> {
        let index = self.page_index(page)?;
        self.pdf.with_document(|document| {
            let rotation = page_at(document, index)?.rotation()?;
            Ok(rotation_from_pdfium(rotation))
        })
    }

    fn viewport(&self, page: usize, scale: f32, rotation: Rotation) -> Result<Viewport> {
        let index = self.page_index(page)?;
        self.pdf.with_document(|document| {
            let page = page_at(document, index)?;
            let native = rotation_from_pdfium(page.rotation()?);
            Ok(rotated_extent(
                page.width().value,
                page.height().value,
                scale,
                relative_rotation(rotation, native),
            ))
        })
    }

    #[instrument(skip(self))]
    async fn render_page(&self, page: usize, scale: f32, rotation: Rotation) -> Result<RenderImage> {
        let index = self.page_index(page)?;
        self.pdf.with_document(|document| {
            let pdf_page = page_at(document, index)?;
            let native = rotation_from_pdfium(pdf_page.rotation()?);
            let config = PdfRenderConfig::new()
                .scale_page_by_factor(scale.max(0.1))
                .rotate(rotation_to_pdfium(relative_rotation(rotation, native)), true);
            let bitmap = pdf_page
                .render_with_config(&config)
                .with_context(|| format!("failed to render page {}", page))?;
            let pixels = bitmap.as_image().to_rgba8().into_raw();
            Ok(RenderImage {
                width: u32::try_from(bitmap.width()).unwrap_or_default(),
                height: u32::try_from(bitmap.height()).unwrap_or_default(),
                pixels,
            })
        })
    }

    fn destroy(&self) {
        self.pdf.release();
    }
}

pub struct PdfiumStructuralDocument {
    pdf: LoadedPdf,
}

impl PdfiumStructuralDocument {
    fn copy_pages(
        target: &mut PdfDocument<'static>,
        source: &PdfDocument<'static>,
        indices: &[usize],
        at: usize,
    ) -> Result<()> {
        for (offset, &index) in indices.iter().enumerate() {
            target
                .pages_mut()
                .copy_page_from_document(source, pdfium_index(index)?, pdfium_index(at + offset)?)
                .with_context(|| format!("failed to copy page index {}", index))?;
        }
        Ok(())
    }
}

#[async_trait]
impl StructuralDocument for PdfiumStructuralDocument {
    fn page_count(&self) -> usize {
        self.pdf.page_count().unwrap_or_else(|err| {
            warn!(?err, "page count unavailable");
            0
        })
    }

    fn page_size(&self, index: usize) -> Result<PageSize> {
        self.pdf.with_document(|document| {
            let page = page_at(document, index)?;
            Ok(PageSize {
                width: page.width().value,
                height: page.height().value,
            })
        })
    }

    fn rotation(&self, index: usize) -> Result<Rotation> {
        self.pdf.with_document(|document| {
            Ok(rotation_from_pdfium(page_at(document, index)?.rotation()?))
        })
    }

    fn set_rotation(&self, index: usize, rotation: Rotation) -> Result<()> {
        self.pdf.with_document(|document| {
            let mut page = page_at(document, index)?;
            page.set_rotation(rotation_to_pdfium(rotation));
            Ok(())
        })
    }

    fn remove_page(&self, index: usize) -> Result<()> {
        self.pdf.with_document(|document| {
            page_at(document, index)?
                .delete()
                .with_context(|| format!("failed to delete page index {}", index))
        })
    }

    fn insert_blank_page(&self, index: usize, size: PageSize) -> Result<()> {
        self.pdf.with_document(|document| {
            let paper = PdfPagePaperSize::new_custom(
                PdfPoints::new(size.width),
                PdfPoints::new(size.height),
            );
            document
                .pages_mut()
                .create_page_at_index(paper, pdfium_index(index)?)
                .with_context(|| format!("failed to insert blank page at index {}", index))?;
            Ok(())
        })
    }

    fn import_pages(
        &self,
        source: &dyn StructuralDocument,
        indices: &[usize],
        at: usize,
    ) -> Result<()> {
        let source = source
            .as_any()
            .downcast_ref::<PdfiumStructuralDocument>()
            .ok_or_else(|| anyhow!("cannot import pages from a non-pdfium document"))?;

        if std::ptr::eq(source, self) {
            // pdfium copies between two open documents only.
            let snapshot = LoadedPdf::load(&self.pdf.pdfium, self.pdf.to_bytes()?)?;
            return snapshot.with_document(|origin| {
                self.pdf
                    .with_document(|target| Self::copy_pages(target, origin, indices, at))
            });
        }

        source.pdf.with_document(|origin| {
            self.pdf
                .with_document(|target| Self::copy_pages(target, origin, indices, at))
        })
    }

    fn stamp_overlay(&self, index: usize, png: &[u8]) -> Result<()> {
        let overlay = image::load_from_memory_with_format(png, image::ImageFormat::Png)
            .context("annotation overlay is not a PNG")?;
        self.pdf.with_document(|document| {
            let mut page = page_at(document, index)?;
            let width = page.width();
            let height = page.height();
            page.objects_mut()
                .create_image_object(PdfPoints::ZERO, PdfPoints::ZERO, &overlay, Some(width), Some(height))
                .with_context(|| format!("failed to stamp overlay on page index {}", index))?;
            Ok(())
        })
    }

    async fn serialize(&self) -> Result<Vec<u8>> {
        self.pdf.to_bytes()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn bind_pdfium_at(path: &Path) -> Option<Pdfium> {
    match Pdfium::bind_to_library(path) {
        Ok(bindings) => Some(Pdfium::new(bindings)),
        Err(err) => {
            warn!(
                "failed to load Pdfium from configured path {}: {}",
                path.display(),
                err
            );
            None
        }
    }
}

fn bind_pdfium_from_env() -> Option<Pdfium> {
    match std::env::var_os(PDFIUM_LIBRARY_ENV) {
        Some(path) if !path.is_empty() => bind_pdfium_at(Path::new(&path)),
        _ => None,
    }
}

fn bind_pdfium_default() -> Result<Pdfium> {
    let mut errors = Vec::new();

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");

    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("{}: {}", cwd_path.display(), err));
        }
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; set {} or install it ({})",
                PDFIUM_LIBRARY_ENV,
                errors.join(", ")
            ))
        }
    }
}
