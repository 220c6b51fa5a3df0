use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{EditorHost, ModelHandle, RasterHandle, RenderedFrame};
use crate::error::{EditorError, EditorResult};
use crate::mutation::{PageMutation, SplitOutput};
use crate::remap::PageIndexRemap;
use crate::scheduler::{RenderOutcome, RenderScheduler};
use crate::workbench::{ScrollOffset, SessionSnapshot, Workbench};

pub type SessionId = Uuid;

/// Answer to the unsaved-changes prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    Save,
    Discard,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    SessionOpened(SessionId),
    SessionClosed(SessionId),
    ActiveSessionChanged(SessionId),
    /// The last session was closed.
    AllSessionsClosed,
    DocumentReloaded(SessionId),
    DocumentSaved(SessionId),
}

/// One open document. While the session is active its snapshot is stale;
/// the workbench holds the authoritative state until the next switch.
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub path: Option<PathBuf>,
    pub modified: bool,
    snapshot: SessionSnapshot,
}

impl Session {
    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }
}

/// Display name for `path`: the last component after either separator.
pub fn display_name(path: &Path) -> String {
    let rendered = path.to_string_lossy();
    rendered
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(&*rendered)
        .to_owned()
}

fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| {
            if path.is_absolute() {
                Ok(path.to_path_buf())
            } else {
                std::env::current_dir().map(|cwd| cwd.join(path))
            }
        })
        .unwrap_or_else(|_| path.to_path_buf())
}

pub struct SessionRegistry {
    sessions: Vec<Session>,
    active: Option<SessionId>,
    workbench: Workbench,
    events: Arc<Mutex<Vec<EditorEvent>>>,
}

impl SessionRegistry {
    pub fn new(workbench: Workbench) -> Self {
        Self {
            sessions: Vec::new(),
            active: None,
            workbench,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<EditorEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn workbench(&self) -> &Workbench {
        &self.workbench
    }

    pub fn workbench_mut(&mut self) -> &mut Workbench {
        &mut self.workbench
    }

    pub fn scheduler(&self) -> Arc<RenderScheduler> {
        Arc::clone(self.workbench.scheduler())
    }

    /// Sessions in creation order.
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|session| session.id == id)
    }

    pub fn active_id(&self) -> Option<SessionId> {
        self.active
    }

    pub fn active(&self) -> Option<&Session> {
        self.active.and_then(|id| self.session(id))
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn position(&self, id: SessionId) -> EditorResult<usize> {
        self.sessions
            .iter()
            .position(|session| session.id == id)
            .ok_or(EditorError::UnknownSession(id))
    }

    fn active_mut(&mut self) -> Option<&mut Session> {
        let id = self.active?;
        self.sessions.iter_mut().find(|session| session.id == id)
    }

    fn require_active(&self) -> EditorResult<SessionId> {
        self.active.ok_or(EditorError::NoActiveSession)
    }

    fn push_event(&self, event: EditorEvent) {
        self.events.lock().push(event);
    }

    /// Registers a loaded document. The new session is not activated.
    pub fn create_session(
        &mut self,
        name: impl Into<String>,
        path: Option<PathBuf>,
        document: ModelHandle,
        raster: RasterHandle,
        original_bytes: Vec<u8>,
    ) -> SessionId {
        let id = Uuid::new_v4();
        let name = name.into();
        info!(%id, %name, pages = document.page_count(), "session created");
        self.sessions.push(Session {
            id,
            name,
            path,
            modified: false,
            snapshot: SessionSnapshot::opened(raster, document, original_bytes),
        });
        self.push_event(EditorEvent::SessionOpened(id));
        id
    }

    /// Writes the live state back into the active record, binds `id` and
    /// renders its current page.
    #[instrument(skip(self))]
    pub async fn switch_session(&mut self, id: SessionId) -> EditorResult<()> {
        if self.active == Some(id) {
            return Ok(());
        }
        let target = self.position(id)?;

        if let Some(captured) = self.workbench.capture() {
            if let Some(current) = self.active_mut() {
                current.snapshot = captured;
            }
        }
        let snapshot = self.sessions[target].snapshot.clone();
        self.workbench.bind(snapshot);
        self.active = Some(id);
        debug!(%id, "session activated");
        self.push_event(EditorEvent::ActiveSessionChanged(id));

        self.workbench.refresh().await;
        Ok(())
    }

    /// Closes `id` after resolving unsaved changes. Returns `false` when the
    /// user cancelled or abandoned the save; nothing changes in that case and
    /// the session that was active before the prompt is active again.
    #[instrument(skip(self, host))]
    pub async fn close_session(&mut self, id: SessionId, host: &dyn EditorHost) -> EditorResult<bool> {
        let index = self.position(id)?;
        if self.sessions[index].modified {
            let name = self.sessions[index].name.clone();
            match host.confirm_unsaved(&name).await {
                CloseDecision::Cancel => {
                    debug!(%id, "close cancelled");
                    return Ok(false);
                }
                CloseDecision::Save => {
                    let previous = self.active;
                    self.switch_session(id).await?;
                    let saved = self.save(host).await;
                    if !matches!(saved, Ok(true)) {
                        // The session stays open, so hand focus back.
                        if let Some(previous) = previous.filter(|&previous| previous != id) {
                            self.switch_session(previous).await?;
                        }
                    }
                    if !saved? {
                        return Ok(false);
                    }
                }
                CloseDecision::Discard => {}
            }
        }

        let was_active = self.active == Some(id);
        let index = self.position(id)?;
        let record = self.sessions.remove(index);
        let released = if was_active {
            self.active = None;
            self.workbench.unbind()
        } else {
            Some(record.snapshot.raster)
        };
        if let Some(raster) = released {
            raster.destroy();
        }
        info!(%id, name = %record.name, "session closed");
        self.push_event(EditorEvent::SessionClosed(id));

        if was_active {
            match self.sessions.last().map(|session| session.id) {
                Some(next) => self.switch_session(next).await?,
                None => {
                    info!("no documents open");
                    self.push_event(EditorEvent::AllSessionsClosed);
                }
            }
        }
        Ok(true)
    }

    /// Walks every dirty session through the unsaved-changes prompt. Stops
    /// and returns `false` at the first cancel.
    pub async fn confirm_close_all(&mut self, host: &dyn EditorHost) -> EditorResult<bool> {
        let dirty: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|session| session.modified)
            .map(|session| session.id)
            .collect();
        for id in dirty {
            self.switch_session(id).await?;
            let name = self.sessions[self.position(id)?].name.clone();
            match host.confirm_unsaved(&name).await {
                CloseDecision::Cancel => return Ok(false),
                CloseDecision::Save => {
                    if !self.save(host).await? {
                        return Ok(false);
                    }
                }
                CloseDecision::Discard => {}
            }
        }
        Ok(true)
    }

    pub fn mark_modified(&mut self) {
        if let Some(session) = self.active_mut() {
            session.modified = true;
        }
    }

    pub fn mark_saved(&mut self) {
        if let Some(session) = self.active_mut() {
            session.modified = false;
        }
    }

    pub fn update_file_path(&mut self, path: PathBuf) {
        if let Some(session) = self.active_mut() {
            session.name = display_name(&path);
            session.path = Some(path);
        }
    }

    pub fn find_by_path(&self, path: &Path) -> Option<SessionId> {
        let wanted = normalize_path(path);
        self.sessions
            .iter()
            .find(|session| {
                session
                    .path
                    .as_deref()
                    .is_some_and(|candidate| normalize_path(candidate) == wanted)
            })
            .map(|session| session.id)
    }

    /// Opens `bytes` as a new active session, or activates the session that
    /// already has `path` open.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn open_document(
        &mut self,
        name: impl Into<String> + std::fmt::Debug,
        path: Option<PathBuf>,
        bytes: Vec<u8>,
    ) -> EditorResult<SessionId> {
        if let Some(existing) = path.as_deref().and_then(|p| self.find_by_path(p)) {
            debug!(%existing, "document already open");
            self.switch_session(existing).await?;
            return Ok(existing);
        }
        let (raster, document) = self.workbench.load(&bytes).await?;
        let id = self.create_session(name, path, document, raster, bytes);
        self.switch_session(id).await?;
        Ok(id)
    }

    /// Exports the active document and hands it to the host. Returns `false`
    /// if the host abandoned a save-as; the session then stays dirty.
    #[instrument(skip(self, host))]
    pub async fn save(&mut self, host: &dyn EditorHost) -> EditorResult<bool> {
        let id = self.require_active()?;
        let bytes = self.workbench.export().await?;
        let path = self.active().and_then(|session| session.path.clone());
        let written = host
            .write_document(path.as_deref(), bytes)
            .await
            .map_err(EditorError::Save)?;
        let Some(written) = written else {
            warn!(%id, "save abandoned");
            return Ok(false);
        };
        if path.as_ref() != Some(&written) {
            self.update_file_path(written);
        }
        self.mark_saved();
        info!(%id, "document saved");
        self.push_event(EditorEvent::DocumentSaved(id));
        Ok(true)
    }

    async fn mutate(&mut self, mutation: PageMutation) -> EditorResult<PageIndexRemap> {
        let id = self.require_active()?;
        let remap = self.workbench.apply_mutation(mutation).await?;
        self.mark_modified();
        self.push_event(EditorEvent::DocumentReloaded(id));
        self.workbench.refresh().await;
        Ok(remap)
    }

    pub async fn delete_page(&mut self, page: usize) -> EditorResult<PageIndexRemap> {
        self.mutate(PageMutation::Delete { page }).await
    }

    pub async fn duplicate_page(&mut self, page: usize) -> EditorResult<PageIndexRemap> {
        self.mutate(PageMutation::Duplicate { page }).await
    }

    pub async fn insert_blank_page(&mut self, after: usize) -> EditorResult<PageIndexRemap> {
        self.mutate(PageMutation::InsertBlank { after }).await
    }

    pub async fn move_page(&mut self, from: usize, to: usize) -> EditorResult<PageIndexRemap> {
        self.mutate(PageMutation::Move { from, to }).await
    }

    pub async fn merge(&mut self, inputs: &[Vec<u8>]) -> EditorResult<PageIndexRemap> {
        let id = self.require_active()?;
        let remap = self.workbench.merge(inputs).await?;
        self.mark_modified();
        self.push_event(EditorEvent::DocumentReloaded(id));
        self.workbench.refresh().await;
        Ok(remap)
    }

    /// Extracts pages into a new document; the active session is unchanged.
    pub async fn split(&self, expression: &str) -> EditorResult<SplitOutput> {
        self.require_active()?;
        self.workbench.split(expression).await
    }

    pub async fn rotate_page(&mut self, degrees: i32) -> EditorResult<RenderOutcome> {
        self.require_active()?;
        self.mark_modified();
        self.workbench.rotate_page(degrees).await
    }

    pub async fn go_to_page(&mut self, page: usize) -> EditorResult<RenderOutcome> {
        self.workbench.go_to_page(page).await
    }

    pub async fn next_page(&mut self) -> EditorResult<Option<RenderOutcome>> {
        self.workbench.next_page().await
    }

    pub async fn prev_page(&mut self) -> EditorResult<Option<RenderOutcome>> {
        self.workbench.prev_page().await
    }

    pub async fn set_scale(&mut self, scale: f32) -> EditorResult<RenderOutcome> {
        self.workbench.set_scale(scale).await
    }

    pub async fn zoom_in(&mut self) -> EditorResult<RenderOutcome> {
        self.workbench.zoom_in().await
    }

    pub async fn zoom_out(&mut self) -> EditorResult<RenderOutcome> {
        self.workbench.zoom_out().await
    }

    pub async fn fit_width(&mut self, container_width: f32) -> EditorResult<RenderOutcome> {
        self.workbench.fit_width(container_width).await
    }

    pub fn set_scroll(&mut self, offset: ScrollOffset) -> EditorResult<()> {
        self.workbench.set_scroll(offset)
    }

    pub async fn render_current(&self) -> EditorResult<RenderOutcome> {
        self.workbench.render_current().await
    }

    /// Thumbnail strip for the active document. Hosts call this again after
    /// a reload or a session switch.
    pub async fn render_thumbnails(&self) -> EditorResult<Vec<RenderedFrame>> {
        self.require_active()?;
        self.workbench.render_thumbnails().await
    }
}
