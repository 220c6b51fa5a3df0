//! Admission control for the shared rasterizer.
//!
//! At most one render runs at a time. Requests that arrive while a render is
//! in flight overwrite a single pending slot; when the render finishes the
//! slot is drained, so a burst of requests costs at most one extra render
//! for the newest page.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use crate::engine::{RasterHandle, RenderSurface, RenderedFrame, Viewport};
use crate::error::{EditorError, EditorResult};
use crate::{PageMap, Rotation};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutcome {
    /// A render was already running; the page now holds the pending slot.
    Deferred,
    /// No document is bound to the rasterizer.
    Unbound,
    /// The drain finished; this is the last frame presented.
    Presented {
        page: usize,
        rotation: Rotation,
        viewport: Viewport,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Rendering { pending: Option<usize> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RenderKey {
    generation: u64,
    page: usize,
    scale_milli: u32,
    rotation: Rotation,
}

struct Binding {
    document: Option<RasterHandle>,
    generation: u64,
    scale: f32,
    rotations: PageMap<Rotation>,
}

impl Binding {
    fn override_for(&self, page: usize) -> Rotation {
        self.rotations.get(&page).copied().unwrap_or_default()
    }

    fn key_for(&self, page: usize) -> Option<RenderKey> {
        let document = self.document.as_ref()?;
        let native = document.native_rotation(page).ok()?;
        Some(RenderKey {
            generation: self.generation,
            page,
            scale_milli: quantize_scale(self.scale),
            rotation: native.combine(self.override_for(page)),
        })
    }
}

struct SchedulerState {
    binding: Binding,
    phase: Phase,
    displayed: Option<usize>,
}

struct RenderJob {
    document: RasterHandle,
    page: usize,
    scale: f32,
    generation: u64,
    rotation_override: Rotation,
}

pub struct RenderScheduler {
    state: Mutex<SchedulerState>,
    surface: Arc<dyn RenderSurface>,
}

impl RenderScheduler {
    pub fn new(surface: Arc<dyn RenderSurface>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                binding: Binding {
                    document: None,
                    generation: 0,
                    scale: 1.0,
                    rotations: PageMap::new(),
                },
                phase: Phase::Idle,
                displayed: None,
            }),
            surface,
        }
    }

    /// Points the pipeline at another loaded document. Renders already in
    /// flight finish against the document they started with.
    pub fn bind(&self, document: RasterHandle, scale: f32, rotations: PageMap<Rotation>) {
        let mut state = self.state.lock();
        state.binding.document = Some(document);
        state.binding.generation += 1;
        state.binding.scale = scale;
        state.binding.rotations = rotations;
        state.displayed = None;
    }

    /// Detaches the current document and hands it back so the caller can
    /// release it.
    pub fn unbind(&self) -> Option<RasterHandle> {
        let mut state = self.state.lock();
        state.binding.generation += 1;
        state.binding.rotations.clear();
        state.displayed = None;
        state.binding.document.take()
    }

    pub fn document(&self) -> Option<RasterHandle> {
        self.state.lock().binding.document.clone()
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().binding.document.is_some()
    }

    pub fn page_count(&self) -> usize {
        self.state
            .lock()
            .binding
            .document
            .as_ref()
            .map_or(0, |doc| doc.page_count())
    }

    pub fn scale(&self) -> f32 {
        self.state.lock().binding.scale
    }

    pub fn set_scale(&self, scale: f32) {
        self.state.lock().binding.scale = scale;
    }

    pub fn rotations(&self) -> PageMap<Rotation> {
        self.state.lock().binding.rotations.clone()
    }

    pub fn rotation_override(&self, page: usize) -> Rotation {
        self.state.lock().binding.override_for(page)
    }

    /// Adds `degrees` to the override of `page`; a resulting zero override is
    /// dropped from the table.
    pub fn rotate_page(&self, page: usize, degrees: i32) -> Rotation {
        let mut state = self.state.lock();
        let next = state.binding.override_for(page).rotate_by(degrees);
        if next.is_none() {
            state.binding.rotations.remove(&page);
        } else {
            state.binding.rotations.insert(page, next);
        }
        next
    }

    /// Native rotation of `page` plus its override, modulo 360.
    pub fn effective_rotation(&self, page: usize) -> Result<Rotation> {
        let state = self.state.lock();
        let document = state
            .binding
            .document
            .as_ref()
            .ok_or_else(|| anyhow!("no document bound"))?;
        Ok(document
            .native_rotation(page)?
            .combine(state.binding.override_for(page)))
    }

    pub fn viewport(&self, page: usize, scale: f32) -> Result<Viewport> {
        let rotation = self.effective_rotation(page)?;
        let document = self.document().ok_or_else(|| anyhow!("no document bound"))?;
        document.viewport(page, scale, rotation)
    }

    /// Renders `page` scaled so its rotated width is `max_width` pixels.
    ///
    /// Thumbnails bypass the pending slot and are never presented to the
    /// surface, so they neither wait for nor displace the page view.
    #[instrument(skip(self))]
    pub async fn render_thumbnail(&self, page: usize, max_width: f32) -> EditorResult<RenderedFrame> {
        let document = self
            .document()
            .ok_or_else(|| render_error(page, anyhow!("no document bound")))?;
        let rotation = self
            .effective_rotation(page)
            .map_err(|err| render_error(page, err))?;
        let natural = document
            .viewport(page, 1.0, rotation)
            .map_err(|err| render_error(page, err))?;
        if !(natural.width > 0.0) {
            return Err(render_error(page, anyhow!("page has no width")));
        }
        let scale = max_width / natural.width;
        let viewport = document
            .viewport(page, scale, rotation)
            .map_err(|err| render_error(page, err))?;
        let image = document
            .render_page(page, scale, rotation)
            .await
            .map_err(|err| render_error(page, err))?;
        Ok(RenderedFrame {
            page,
            scale,
            rotation,
            viewport,
            image,
        })
    }

    pub fn is_rendering(&self) -> bool {
        matches!(self.state.lock().phase, Phase::Rendering { .. })
    }

    pub fn pending(&self) -> Option<usize> {
        match self.state.lock().phase {
            Phase::Rendering { pending } => pending,
            Phase::Idle => None,
        }
    }

    /// The page of the last frame presented for the current binding.
    pub fn displayed_page(&self) -> Option<usize> {
        self.state.lock().displayed
    }

    /// Renders `page`, or parks it in the pending slot if a render is
    /// already running. The caller that started the render keeps draining
    /// the slot until it is empty or names the page just rendered with
    /// unchanged parameters.
    #[instrument(skip(self))]
    pub async fn request_render(&self, page: usize) -> EditorResult<RenderOutcome> {
        {
            let mut state = self.state.lock();
            if let Phase::Rendering { pending } = &mut state.phase {
                debug!(page, replaced = ?pending, "render in flight; parking request");
                *pending = Some(page);
                return Ok(RenderOutcome::Deferred);
            }
            if state.binding.document.is_none() {
                return Ok(RenderOutcome::Unbound);
            }
            state.phase = Phase::Rendering { pending: None };
        }

        let mut guard = RenderingGuard {
            state: &self.state,
            armed: true,
        };
        let mut target = page;
        loop {
            let attempt = self.render_once(target).await;
            let rendered_key = attempt.as_ref().ok().map(|(key, _)| *key);
            if let Err(err) = &attempt {
                warn!(page = target, error = ?err, "page render failed");
            }

            let next = {
                let mut state = self.state.lock();
                let pending = match &mut state.phase {
                    Phase::Rendering { pending } => pending.take(),
                    Phase::Idle => None,
                };
                let next = pending.filter(|&candidate| {
                    if candidate != target {
                        return true;
                    }
                    // Same page: repaint only if zoom, rotation or binding moved on.
                    match rendered_key {
                        Some(key) => state.binding.key_for(candidate) != Some(key),
                        None => false,
                    }
                });
                if next.is_none() {
                    state.phase = Phase::Idle;
                    guard.disarm();
                }
                next
            };

            match next {
                Some(page) => {
                    debug!(page, "draining pending render");
                    target = page;
                }
                None => {
                    return attempt.map(|(key, viewport)| RenderOutcome::Presented {
                        page: key.page,
                        rotation: key.rotation,
                        viewport,
                    });
                }
            }
        }
    }

    async fn render_once(&self, page: usize) -> EditorResult<(RenderKey, Viewport)> {
        let job = {
            let state = self.state.lock();
            let document = state
                .binding
                .document
                .clone()
                .ok_or_else(|| render_error(page, anyhow!("no document bound")))?;
            RenderJob {
                document,
                page,
                scale: state.binding.scale,
                generation: state.binding.generation,
                rotation_override: state.binding.override_for(page),
            }
        };
        let rotation = job
            .document
            .native_rotation(page)
            .map_err(|err| render_error(page, err))?
            .combine(job.rotation_override);

        let viewport = job
            .document
            .viewport(page, job.scale, rotation)
            .map_err(|err| render_error(page, err))?;
        let image = job
            .document
            .render_page(page, job.scale, rotation)
            .await
            .map_err(|err| render_error(page, err))?;

        let frame = RenderedFrame {
            page,
            scale: job.scale,
            rotation,
            viewport,
            image,
        };
        {
            let mut state = self.state.lock();
            if state.binding.generation == job.generation {
                state.displayed = Some(page);
            }
        }
        self.surface.present(&frame);

        Ok((
            RenderKey {
                generation: job.generation,
                page,
                scale_milli: quantize_scale(job.scale),
                rotation,
            },
            viewport,
        ))
    }
}

fn render_error(page: usize, source: anyhow::Error) -> EditorError {
    EditorError::Render { page, source }
}

/// Returns the scheduler to idle if a drain is abandoned mid-render.
struct RenderingGuard<'a> {
    state: &'a Mutex<SchedulerState>,
    armed: bool,
}

impl RenderingGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RenderingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().phase = Phase::Idle;
        }
    }
}

fn quantize_scale(scale: f32) -> u32 {
    let scaled = (scale * 1000.0).round();
    if !scaled.is_finite() || scaled <= 0.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}
