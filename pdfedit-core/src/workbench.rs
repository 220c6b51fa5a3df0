//! The live collaborator bindings.
//!
//! There is one rasterizer, one annotation canvas and one set of view state.
//! A session becomes live by restoring its [`SessionSnapshot`] into the
//! workbench and stops being live when the workbench state is captured back.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::annotations::AnnotationStore;
use crate::config::EditorConfig;
use crate::engine::{
    AnnotationCanvas, DocumentModel, ModelHandle, RasterEngine, RasterHandle, RenderSurface,
    RenderedFrame,
};
use crate::error::{check_page, EditorError, EditorResult};
use crate::mutation::{PageMutation, PageMutationEngine, SplitOutput};
use crate::remap::PageIndexRemap;
use crate::scheduler::{RenderOutcome, RenderScheduler};
use crate::text_edit::TextEditMachine;
use crate::{PageMap, Rotation};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollOffset {
    pub x: f32,
    pub y: f32,
}

/// Everything a session needs to become live again.
#[derive(Clone)]
pub struct SessionSnapshot {
    pub raster: RasterHandle,
    pub document: ModelHandle,
    pub original_bytes: Arc<[u8]>,
    pub current_page: usize,
    pub scale: f32,
    pub rotations: PageMap<Rotation>,
    pub annotations: AnnotationStore,
    pub scroll: ScrollOffset,
}

impl SessionSnapshot {
    /// A freshly opened document: first page, unit scale, no overrides.
    pub fn opened(raster: RasterHandle, document: ModelHandle, original_bytes: Vec<u8>) -> Self {
        Self {
            raster,
            document,
            original_bytes: original_bytes.into(),
            current_page: 1,
            scale: 1.0,
            rotations: PageMap::new(),
            annotations: AnnotationStore::new(),
            scroll: ScrollOffset::default(),
        }
    }

    pub fn page_count(&self) -> usize {
        self.document.page_count()
    }
}

struct LiveDocument {
    document: ModelHandle,
    original_bytes: Arc<[u8]>,
    current_page: usize,
    annotations: AnnotationStore,
    scroll: ScrollOffset,
}

/// Sizes the annotation canvas to each presented frame before forwarding it.
struct CanvasSizedSurface {
    canvas: Arc<dyn AnnotationCanvas>,
    inner: Arc<dyn RenderSurface>,
}

impl RenderSurface for CanvasSizedSurface {
    fn present(&self, frame: &RenderedFrame) {
        self.canvas.resize(frame.viewport.width, frame.viewport.height);
        self.inner.present(frame);
    }
}

pub struct Workbench {
    raster: Arc<dyn RasterEngine>,
    mutations: PageMutationEngine,
    canvas: Arc<dyn AnnotationCanvas>,
    scheduler: Arc<RenderScheduler>,
    config: EditorConfig,
    live: Option<LiveDocument>,
    text_edit: TextEditMachine,
}

impl Workbench {
    pub fn new(
        raster: Arc<dyn RasterEngine>,
        model: Arc<dyn DocumentModel>,
        canvas: Arc<dyn AnnotationCanvas>,
        surface: Arc<dyn RenderSurface>,
        config: EditorConfig,
    ) -> Self {
        let surface = Arc::new(CanvasSizedSurface {
            canvas: Arc::clone(&canvas),
            inner: surface,
        });
        Self {
            raster,
            mutations: PageMutationEngine::new(model, config.default_page_size),
            canvas,
            scheduler: Arc::new(RenderScheduler::new(surface)),
            config,
            live: None,
            text_edit: TextEditMachine::new(),
        }
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<RenderScheduler> {
        &self.scheduler
    }

    pub fn canvas(&self) -> &Arc<dyn AnnotationCanvas> {
        &self.canvas
    }

    pub fn text_edit(&self) -> &TextEditMachine {
        &self.text_edit
    }

    pub fn text_edit_mut(&mut self) -> &mut TextEditMachine {
        &mut self.text_edit
    }

    pub fn is_bound(&self) -> bool {
        self.live.is_some()
    }

    pub fn current_page(&self) -> Option<usize> {
        self.live.as_ref().map(|live| live.current_page)
    }

    pub fn page_count(&self) -> usize {
        self.live
            .as_ref()
            .map_or(0, |live| live.document.page_count())
    }

    pub fn scale(&self) -> f32 {
        self.scheduler.scale()
    }

    pub fn scroll(&self) -> Option<ScrollOffset> {
        self.live.as_ref().map(|live| live.scroll)
    }

    pub fn annotations(&self) -> Option<&AnnotationStore> {
        self.live.as_ref().map(|live| &live.annotations)
    }

    pub fn original_bytes(&self) -> Option<Arc<[u8]>> {
        self.live.as_ref().map(|live| Arc::clone(&live.original_bytes))
    }

    /// Loads `bytes` through both engines without touching the live state.
    #[instrument(skip_all, fields(len = bytes.len()))]
    pub async fn load(&self, bytes: &[u8]) -> EditorResult<(RasterHandle, ModelHandle)> {
        let document = self.mutations.load(bytes).await?;
        let raster = self.raster.load(bytes).await.map_err(EditorError::Load)?;
        debug!(pages = raster.page_count(), "document loaded");
        Ok((raster, document))
    }

    /// Makes `snapshot` the live state. The caller captures whatever was live
    /// before.
    pub fn bind(&mut self, snapshot: SessionSnapshot) {
        self.text_edit.force_exit();
        self.scheduler
            .bind(snapshot.raster, snapshot.scale, snapshot.rotations);
        snapshot
            .annotations
            .load_page(self.canvas.as_ref(), snapshot.current_page);
        self.live = Some(LiveDocument {
            document: snapshot.document,
            original_bytes: snapshot.original_bytes,
            current_page: snapshot.current_page,
            annotations: snapshot.annotations,
            scroll: snapshot.scroll,
        });
    }

    /// Writes the canvas back into the annotation store and returns the full
    /// live state. The workbench stays bound.
    pub fn capture(&mut self) -> Option<SessionSnapshot> {
        if let Some(object) = self.text_edit.force_exit() {
            debug!(object = object.0, "text editing closed for capture");
        }
        let raster = self.scheduler.document()?;
        let live = self.live.as_mut()?;
        live.annotations
            .store_page(self.canvas.as_ref(), live.current_page);
        Some(SessionSnapshot {
            raster,
            document: Arc::clone(&live.document),
            original_bytes: Arc::clone(&live.original_bytes),
            current_page: live.current_page,
            scale: self.scheduler.scale(),
            rotations: self.scheduler.rotations(),
            annotations: live.annotations.clone(),
            scroll: live.scroll,
        })
    }

    /// Drops the live state and hands back the raster handle that was bound,
    /// so the caller can release it.
    pub fn unbind(&mut self) -> Option<RasterHandle> {
        self.text_edit.force_exit();
        self.live = None;
        self.canvas.clear();
        self.scheduler.unbind()
    }

    fn live(&self) -> EditorResult<&LiveDocument> {
        self.live.as_ref().ok_or(EditorError::NoActiveSession)
    }

    fn live_mut(&mut self) -> EditorResult<&mut LiveDocument> {
        self.live.as_mut().ok_or(EditorError::NoActiveSession)
    }

    pub async fn render_current(&self) -> EditorResult<RenderOutcome> {
        let page = self.live()?.current_page;
        self.scheduler.request_render(page).await
    }

    /// Renders the current page after a state change that already succeeded.
    /// A failed frame is logged by the scheduler and does not undo the change.
    pub async fn refresh(&self) -> Option<RenderOutcome> {
        self.render_current().await.ok()
    }

    pub async fn go_to_page(&mut self, page: usize) -> EditorResult<RenderOutcome> {
        let canvas = Arc::clone(&self.canvas);
        let live = self.live.as_mut().ok_or(EditorError::NoActiveSession)?;
        check_page(page, live.document.page_count())?;
        if page != live.current_page {
            self.text_edit.force_exit();
            live.annotations.store_page(canvas.as_ref(), live.current_page);
            live.current_page = page;
            live.annotations.load_page(canvas.as_ref(), page);
        }
        self.scheduler.request_render(page).await
    }

    /// `None` when already on the last page.
    pub async fn next_page(&mut self) -> EditorResult<Option<RenderOutcome>> {
        let live = self.live()?;
        if live.current_page >= live.document.page_count() {
            return Ok(None);
        }
        let next = live.current_page + 1;
        self.go_to_page(next).await.map(Some)
    }

    /// `None` when already on the first page.
    pub async fn prev_page(&mut self) -> EditorResult<Option<RenderOutcome>> {
        let current = self.live()?.current_page;
        if current <= 1 {
            return Ok(None);
        }
        self.go_to_page(current - 1).await.map(Some)
    }

    pub async fn set_scale(&mut self, scale: f32) -> EditorResult<RenderOutcome> {
        self.live()?;
        let scale = self.config.zoom.clamp(scale);
        self.scheduler.set_scale(scale);
        self.render_current().await
    }

    pub async fn zoom_in(&mut self) -> EditorResult<RenderOutcome> {
        let scale = self.scheduler.scale() + self.config.zoom.step;
        self.set_scale(scale).await
    }

    pub async fn zoom_out(&mut self) -> EditorResult<RenderOutcome> {
        let scale = self.scheduler.scale() - self.config.zoom.step;
        self.set_scale(scale).await
    }

    /// Scales the current page so it fills `container_width` minus padding.
    pub async fn fit_width(&mut self, container_width: f32) -> EditorResult<RenderOutcome> {
        let page = self.live()?.current_page;
        let natural = self
            .scheduler
            .viewport(page, 1.0)
            .map_err(|source| EditorError::Render { page, source })?;
        let available = container_width - self.config.fit_padding;
        self.set_scale(available / natural.width).await
    }

    /// Turns the current page by `degrees` on top of its native rotation.
    pub async fn rotate_page(&mut self, degrees: i32) -> EditorResult<RenderOutcome> {
        let page = self.live()?.current_page;
        let rotation = self.scheduler.rotate_page(page, degrees);
        debug!(page, degrees = rotation.degrees(), "rotation override updated");
        self.scheduler.request_render(page).await
    }

    /// Renders a strip of thumbnails, one per page, at the configured width.
    /// Pages that fail to render are logged and left out.
    pub async fn render_thumbnails(&self) -> EditorResult<Vec<RenderedFrame>> {
        let page_count = self.live()?.document.page_count();
        let max_width = self.config.thumbnail_width;
        let mut frames = Vec::with_capacity(page_count);
        for page in 1..=page_count {
            match self.scheduler.render_thumbnail(page, max_width).await {
                Ok(frame) => frames.push(frame),
                Err(err) => warn!(page, error = ?err, "thumbnail render failed"),
            }
        }
        Ok(frames)
    }

    pub fn set_scroll(&mut self, offset: ScrollOffset) -> EditorResult<()> {
        self.live_mut()?.scroll = offset;
        Ok(())
    }

    /// Runs `mutation` against a working copy and, only if every step
    /// succeeds, swaps the live handles and remaps the side tables.
    #[instrument(skip_all, fields(op = mutation.name()))]
    pub async fn apply_mutation(&mut self, mutation: PageMutation) -> EditorResult<PageIndexRemap> {
        let canvas = Arc::clone(&self.canvas);
        {
            let live = self.live_mut()?;
            live.annotations
                .store_page(canvas.as_ref(), live.current_page);
        }
        let live_document = Arc::clone(&self.live()?.document);
        let output = self
            .mutations
            .execute(live_document.as_ref(), &mutation)
            .await?;
        let raster = self
            .raster
            .load(&output.bytes)
            .await
            .map_err(EditorError::Engine)?;

        // Commit.
        self.text_edit.force_exit();
        let remap = output.remap;
        let rotations = remap.apply(self.scheduler.rotations());
        let scale = self.scheduler.scale();
        let previous = self.scheduler.unbind();
        self.scheduler.bind(raster, scale, rotations);
        if let Some(previous) = previous {
            previous.destroy();
        }

        let live = self.live_mut()?;
        live.document = output.document;
        live.original_bytes = output.bytes.into();
        live.annotations.remap(&remap);
        live.current_page = remap
            .new_page(live.current_page)
            .unwrap_or(live.current_page)
            .clamp(1, remap.new_count().max(1));
        live.annotations.load_page(canvas.as_ref(), live.current_page);
        info!(
            pages = remap.new_count(),
            current = live.current_page,
            "document reloaded"
        );
        Ok(remap)
    }

    /// Loads every input, then appends their pages in order.
    pub async fn merge(&mut self, inputs: &[Vec<u8>]) -> EditorResult<PageIndexRemap> {
        self.live()?;
        let mutation = self.mutations.load_merge_sources(inputs).await?;
        self.apply_mutation(mutation).await
    }

    pub async fn split(&self, expression: &str) -> EditorResult<SplitOutput> {
        let live = self.live()?;
        self.mutations
            .split(live.document.as_ref(), &self.scheduler.rotations(), expression)
            .await
    }

    /// Serializes the live document with overrides and annotations baked in.
    /// The canvas shows the current page again afterwards, success or not.
    pub async fn export(&mut self) -> EditorResult<Vec<u8>> {
        let canvas = Arc::clone(&self.canvas);
        self.text_edit.force_exit();
        let live = self.live.as_mut().ok_or(EditorError::NoActiveSession)?;
        live.annotations
            .store_page(canvas.as_ref(), live.current_page);
        let result = self
            .mutations
            .export(
                live.document.as_ref(),
                &self.scheduler.rotations(),
                &live.annotations,
                canvas.as_ref(),
            )
            .await;
        live.annotations.load_page(canvas.as_ref(), live.current_page);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationBlob;
    use crate::error::Rejection;
    use crate::fixtures::{decode, document_bytes, labels, FakeCanvas, FakeModel, FakeRaster, RecordingSurface};

    struct Rig {
        bench: Workbench,
        raster: Arc<FakeRaster>,
        canvas: Arc<FakeCanvas>,
    }

    async fn rig(pages: &[&str]) -> Rig {
        let raster = Arc::new(FakeRaster::default());
        let canvas = Arc::new(FakeCanvas::default());
        let mut bench = Workbench::new(
            raster.clone(),
            Arc::new(FakeModel::default()),
            canvas.clone(),
            Arc::new(RecordingSurface::default()),
            EditorConfig::default(),
        );
        let bytes = document_bytes(pages);
        let (raster_doc, model_doc) = bench.load(&bytes).await.unwrap();
        bench.bind(SessionSnapshot::opened(raster_doc, model_doc, bytes));
        Rig {
            bench,
            raster,
            canvas,
        }
    }

    #[tokio::test]
    async fn navigation_swaps_annotation_layers() {
        let Rig { mut bench, canvas, .. } = rig(&["1", "2", "3"]).await;

        canvas.draw("first");
        bench.go_to_page(2).await.unwrap();
        assert_eq!(canvas.contents(), None);

        canvas.draw("second");
        bench.prev_page().await.unwrap();
        assert_eq!(canvas.contents().as_deref(), Some("first"));
        assert_eq!(bench.prev_page().await.unwrap(), None);

        let stored = bench.annotations().unwrap();
        assert!(stored.has_annotations(2));
    }

    #[tokio::test]
    async fn go_to_page_out_of_range_is_rejected() {
        let Rig { mut bench, .. } = rig(&["1", "2"]).await;
        let err = bench.go_to_page(3).await.unwrap_err();
        assert!(matches!(
            err,
            EditorError::MutationRejected(Rejection::PageOutOfRange { page: 3, .. })
        ));
        assert_eq!(bench.current_page(), Some(1));
    }

    #[tokio::test]
    async fn zoom_is_clamped_and_fit_width_uses_padding() {
        let Rig { mut bench, canvas, .. } = rig(&["1"]).await;

        bench.set_scale(9.0).await.unwrap();
        assert_eq!(bench.scale(), 4.0);
        bench.zoom_in().await.unwrap();
        assert_eq!(bench.scale(), 4.0);
        bench.zoom_out().await.unwrap();
        assert_eq!(bench.scale(), 3.75);

        bench.fit_width(652.0).await.unwrap();
        assert_eq!(bench.scale(), 1.0);
        let sizes = canvas.sizes.lock().clone();
        assert_eq!(sizes.last(), Some(&(612.0, 792.0)));
    }

    #[tokio::test]
    async fn rotate_renders_with_override() {
        let Rig { mut bench, raster, .. } = rig(&["1"]).await;
        let outcome = bench.rotate_page(90).await.unwrap();
        match outcome {
            RenderOutcome::Presented { rotation, viewport, .. } => {
                assert_eq!(rotation.degrees(), 90);
                assert_eq!(viewport.width, 792.0);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(raster.renders.lock().last().unwrap().2, 90);
    }

    #[tokio::test]
    async fn move_remaps_annotations_and_rotations() {
        let Rig { mut bench, raster, canvas } = rig(&["1", "2", "3", "4", "5"]).await;
        bench.go_to_page(2).await.unwrap();
        canvas.draw("A");
        bench.rotate_page(90).await.unwrap();
        bench.go_to_page(4).await.unwrap();
        canvas.draw("B");

        let remap = bench
            .apply_mutation(PageMutation::Move { from: 2, to: 4 })
            .await
            .unwrap();

        assert_eq!(
            remap.order(),
            vec![Some(1), Some(3), Some(4), Some(2), Some(5)]
        );
        let store = bench.annotations().unwrap();
        assert_eq!(store.get(3), Some(&AnnotationBlob::new(b"B".to_vec())));
        assert_eq!(store.get(4), Some(&AnnotationBlob::new(b"A".to_vec())));
        assert_eq!(store.get(2), None);
        assert_eq!(bench.scheduler().rotation_override(4).degrees(), 90);
        assert_eq!(bench.current_page(), Some(3));
        assert_eq!(canvas.contents().as_deref(), Some("B"));
        assert_eq!(*raster.destroyed.lock(), vec![0]);
        assert_eq!(
            labels(&bench.original_bytes().unwrap()),
            vec!["1", "3", "4", "2", "5"]
        );
    }

    #[tokio::test]
    async fn delete_of_current_last_page_clamps_position() {
        let Rig { mut bench, .. } = rig(&["1", "2", "3"]).await;
        bench.go_to_page(3).await.unwrap();
        bench
            .apply_mutation(PageMutation::Delete { page: 3 })
            .await
            .unwrap();
        assert_eq!(bench.current_page(), Some(2));
        assert_eq!(bench.page_count(), 2);
    }

    #[tokio::test]
    async fn rejected_mutation_changes_nothing() {
        let Rig { mut bench, raster, canvas } = rig(&["only"]).await;
        canvas.draw("ink");
        bench.rotate_page(90).await.unwrap();
        let err = bench
            .apply_mutation(PageMutation::Delete { page: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, EditorError::MutationRejected(Rejection::LastPage)));
        assert_eq!(bench.page_count(), 1);
        assert!(raster.destroyed.lock().is_empty());
        assert_eq!(canvas.contents().as_deref(), Some("ink"));
        assert_eq!(
            bench.scheduler().rotations(),
            PageMap::from([(1, Rotation::from_degrees(90))])
        );
    }

    #[tokio::test]
    async fn export_after_mutation_sequence_bakes_remapped_rotations() {
        let Rig { mut bench, .. } = rig(&["1", "2", "3", "4"]).await;
        bench.go_to_page(2).await.unwrap();
        bench.rotate_page(90).await.unwrap();

        bench
            .apply_mutation(PageMutation::Move { from: 2, to: 4 })
            .await
            .unwrap();
        bench
            .apply_mutation(PageMutation::Delete { page: 1 })
            .await
            .unwrap();
        bench
            .apply_mutation(PageMutation::Duplicate { page: 1 })
            .await
            .unwrap();
        assert_eq!(
            bench.scheduler().rotations(),
            PageMap::from([(4, Rotation::from_degrees(90))])
        );

        let bytes = bench.export().await.unwrap();
        let pages: Vec<(String, u16)> = decode(&bytes)
            .unwrap()
            .into_iter()
            .map(|page| (page.label, page.rotation))
            .collect();
        assert_eq!(
            pages,
            vec![
                ("3".to_owned(), 0),
                ("3".to_owned(), 0),
                ("4".to_owned(), 0),
                ("2".to_owned(), 90),
            ]
        );
        assert_eq!(bench.current_page(), Some(4));
    }

    #[tokio::test]
    async fn thumbnails_skip_pages_that_fail() {
        let Rig { mut bench, raster, .. } = rig(&["1", "2", "3"]).await;
        bench.go_to_page(3).await.unwrap();
        bench.rotate_page(270).await.unwrap();
        raster.failing_pages.lock().insert(2);
        let before = raster.renders.lock().len();

        let frames = bench.render_thumbnails().await.unwrap();

        let pages: Vec<usize> = frames.iter().map(|frame| frame.page).collect();
        assert_eq!(pages, vec![1, 3]);
        assert!(frames.iter().all(|frame| (frame.viewport.width - 120.0).abs() < 1e-3));
        assert_eq!(frames[1].rotation.degrees(), 270);
        assert_eq!(raster.renders.lock().len(), before + 3);
        assert_eq!(bench.current_page(), Some(3));
    }

    #[tokio::test]
    async fn raster_reload_failure_keeps_live_document() {
        let Rig { mut bench, raster, .. } = rig(&["1", "2"]).await;
        raster
            .fail_loads
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = bench
            .apply_mutation(PageMutation::Duplicate { page: 1 })
            .await
            .unwrap_err();

        assert!(matches!(err, EditorError::Engine(_)));
        assert_eq!(bench.page_count(), 2);
        assert_eq!(bench.scheduler().page_count(), 2);
        assert!(raster.destroyed.lock().is_empty());
    }

    #[tokio::test]
    async fn export_restores_current_layer() {
        let Rig { mut bench, canvas, .. } = rig(&["1", "2"]).await;
        canvas.draw("note");
        bench.rotate_page(-90).await.unwrap();

        let bytes = bench.export().await.unwrap();

        let pages = decode(&bytes).unwrap();
        assert_eq!(pages[0].overlays, vec!["note".to_owned()]);
        assert_eq!(pages[0].rotation, 270);
        assert_eq!(canvas.contents().as_deref(), Some("note"));
    }

    #[tokio::test]
    async fn capture_then_bind_round_trips_view_state() {
        let Rig { mut bench, canvas, .. } = rig(&["1", "2"]).await;
        bench.go_to_page(2).await.unwrap();
        canvas.draw("kept");
        bench.set_scroll(ScrollOffset { x: 0.0, y: 120.0 }).unwrap();

        let snapshot = bench.capture().unwrap();
        let released = bench.unbind();
        assert!(released.is_some());
        assert!(!bench.is_bound());
        assert_eq!(canvas.contents(), None);

        bench.bind(snapshot);
        assert_eq!(bench.current_page(), Some(2));
        assert_eq!(bench.scroll().unwrap().y, 120.0);
        assert_eq!(canvas.contents().as_deref(), Some("kept"));
    }
}
