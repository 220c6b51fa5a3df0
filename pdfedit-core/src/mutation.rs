//! Structural page operations.
//!
//! Every edit runs against a working copy of the live document, loaded from
//! its serialized bytes. The live handle is only replaced once the working
//! copy has been edited and re-serialized, so a failure at any step leaves
//! the session exactly as it was.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, instrument, warn};

use crate::annotations::AnnotationStore;
use crate::engine::{AnnotationCanvas, DocumentModel, ModelHandle, PageSize, StructuralDocument};
use crate::error::{check_page, EditorError, EditorResult, Rejection};
use crate::remap::PageIndexRemap;
use crate::{page_index, PageMap, Rotation};

#[derive(Clone)]
pub enum PageMutation {
    Delete { page: usize },
    Duplicate { page: usize },
    /// `after = 0` inserts in front of the first page.
    InsertBlank { after: usize },
    Move { from: usize, to: usize },
    Merge { sources: Vec<ModelHandle> },
}

impl PageMutation {
    pub fn name(&self) -> &'static str {
        match self {
            PageMutation::Delete { .. } => "delete",
            PageMutation::Duplicate { .. } => "duplicate",
            PageMutation::InsertBlank { .. } => "insert-blank",
            PageMutation::Move { .. } => "move",
            PageMutation::Merge { .. } => "merge",
        }
    }

    /// Validates the arguments against `page_count` and computes the remap.
    /// Depends on nothing but page numbers.
    pub fn plan(&self, page_count: usize) -> Result<PageIndexRemap, Rejection> {
        match *self {
            PageMutation::Delete { page } => {
                if page_count <= 1 {
                    return Err(Rejection::LastPage);
                }
                check_page(page, page_count)?;
                Ok(PageIndexRemap::delete(page_count, page))
            }
            PageMutation::Duplicate { page } => {
                check_page(page, page_count)?;
                Ok(PageIndexRemap::insert_after(page_count, page))
            }
            PageMutation::InsertBlank { after } => {
                if after > page_count {
                    return Err(Rejection::PageOutOfRange {
                        page: after,
                        page_count,
                    });
                }
                Ok(PageIndexRemap::insert_after(page_count, after))
            }
            PageMutation::Move { from, to } => {
                check_page(from, page_count)?;
                check_page(to, page_count)?;
                if from == to {
                    return Err(Rejection::SamePosition(from));
                }
                Ok(PageIndexRemap::move_page(page_count, from, to))
            }
            PageMutation::Merge { ref sources } => {
                if sources.is_empty() {
                    return Err(Rejection::NothingToMerge);
                }
                let added = sources.iter().map(|source| source.page_count()).sum();
                Ok(PageIndexRemap::append(page_count, added))
            }
        }
    }

    fn apply(&self, document: &dyn StructuralDocument, default_size: PageSize) -> anyhow::Result<()> {
        match self {
            PageMutation::Delete { page } => document.remove_page(page_index(*page)),
            PageMutation::Duplicate { page } => {
                let index = page_index(*page);
                document.import_pages(document, &[index], index + 1)
            }
            PageMutation::InsertBlank { after } => {
                let size = match after.checked_sub(1) {
                    Some(reference) if reference < document.page_count() => {
                        document.page_size(reference)?
                    }
                    _ => default_size,
                };
                document.insert_blank_page(*after, size)
            }
            PageMutation::Move { from, to } => {
                let from = page_index(*from);
                let to = page_index(*to);
                // Copy first, then drop the original wherever it ended up.
                if to > from {
                    document.import_pages(document, &[from], to + 1)?;
                    document.remove_page(from)
                } else {
                    document.import_pages(document, &[from], to)?;
                    document.remove_page(from + 1)
                }
            }
            PageMutation::Merge { sources } => {
                for source in sources {
                    let indices: Vec<usize> = (0..source.page_count()).collect();
                    document.import_pages(source.as_ref(), &indices, document.page_count())?;
                }
                Ok(())
            }
        }
    }
}

/// Result of a committed-able structural edit: the new bytes, a structural
/// handle already holding them, and how old pages map onto new ones.
pub struct MutationOutput {
    pub bytes: Vec<u8>,
    pub document: ModelHandle,
    pub remap: PageIndexRemap,
}

#[derive(Debug, Clone)]
pub struct SplitOutput {
    pub bytes: Vec<u8>,
    /// Source page numbers, ascending, in the order they were extracted.
    pub pages: Vec<usize>,
}

pub struct PageMutationEngine {
    model: Arc<dyn DocumentModel>,
    default_page_size: PageSize,
}

impl PageMutationEngine {
    pub fn new(model: Arc<dyn DocumentModel>, default_page_size: PageSize) -> Self {
        Self {
            model,
            default_page_size,
        }
    }

    pub async fn load(&self, bytes: &[u8]) -> EditorResult<ModelHandle> {
        self.model.load(bytes).await.map_err(EditorError::Load)
    }

    async fn working_copy(&self, live: &dyn StructuralDocument) -> EditorResult<ModelHandle> {
        let bytes = live
            .serialize()
            .await
            .context("failed to serialize live document")
            .map_err(EditorError::Engine)?;
        self.model
            .load(&bytes)
            .await
            .context("failed to reload live document")
            .map_err(EditorError::Engine)
    }

    #[instrument(skip_all, fields(op = mutation.name()))]
    pub async fn execute(
        &self,
        live: &dyn StructuralDocument,
        mutation: &PageMutation,
    ) -> EditorResult<MutationOutput> {
        let remap = mutation.plan(live.page_count())?;
        debug!(?remap, "planned page remap");

        let working = self.working_copy(live).await?;
        mutation
            .apply(working.as_ref(), self.default_page_size)
            .map_err(EditorError::Engine)?;
        let bytes = working.serialize().await.map_err(EditorError::Engine)?;

        if working.page_count() != remap.new_count() {
            return Err(EditorError::Engine(anyhow::anyhow!(
                "{} left {} pages, expected {}",
                mutation.name(),
                working.page_count(),
                remap.new_count()
            )));
        }

        Ok(MutationOutput {
            bytes,
            document: working,
            remap,
        })
    }

    /// Loads every merge input up front so an unreadable file aborts the
    /// merge before anything is copied.
    pub async fn load_merge_sources(&self, inputs: &[Vec<u8>]) -> EditorResult<PageMutation> {
        let mut sources = Vec::with_capacity(inputs.len());
        for bytes in inputs {
            sources.push(self.load(bytes).await?);
        }
        Ok(PageMutation::Merge { sources })
    }

    /// Extracts the pages selected by `expression` into a new document. The
    /// live document is not touched; rotation overrides are baked into the
    /// extracted pages, annotation layers are not.
    #[instrument(skip(self, live, rotations))]
    pub async fn split(
        &self,
        live: &dyn StructuralDocument,
        rotations: &PageMap<Rotation>,
        expression: &str,
    ) -> EditorResult<SplitOutput> {
        let pages = parse_page_ranges(expression, live.page_count());
        if pages.is_empty() {
            return Err(Rejection::EmptySelection(expression.to_owned()).into());
        }

        let working = self.working_copy(live).await?;
        apply_rotation_overrides(working.as_ref(), rotations).map_err(EditorError::Engine)?;

        let target = self.model.create().await.map_err(EditorError::Engine)?;
        let indices: Vec<usize> = pages.iter().map(|&p| page_index(p)).collect();
        target
            .import_pages(working.as_ref(), &indices, 0)
            .map_err(EditorError::Engine)?;
        let bytes = target.serialize().await.map_err(EditorError::Engine)?;
        Ok(SplitOutput { bytes, pages })
    }

    /// Serializes the live document for saving: rotation overrides written
    /// into the pages and annotation layers flattened on top of them. The
    /// canvas is left cleared; the caller restores the current page.
    #[instrument(skip_all)]
    pub async fn export(
        &self,
        live: &dyn StructuralDocument,
        rotations: &PageMap<Rotation>,
        annotations: &AnnotationStore,
        canvas: &dyn AnnotationCanvas,
    ) -> EditorResult<Vec<u8>> {
        let working = self.working_copy(live).await.map_err(into_save_error)?;
        apply_rotation_overrides(working.as_ref(), rotations).map_err(EditorError::Save)?;

        for (&page, blob) in annotations.pages() {
            if page == 0 || page > working.page_count() {
                warn!(page, "annotation layer for missing page skipped");
                continue;
            }
            canvas.clear();
            canvas.restore(blob);
            let png = canvas
                .export_png()
                .with_context(|| format!("failed to rasterize annotations of page {page}"))
                .map_err(EditorError::Save)?;
            working
                .stamp_overlay(page_index(page), &png)
                .map_err(EditorError::Save)?;
        }
        canvas.clear();

        working.serialize().await.map_err(EditorError::Save)
    }
}

fn into_save_error(err: EditorError) -> EditorError {
    match err {
        EditorError::Engine(source) => EditorError::Save(source),
        other => other,
    }
}

fn apply_rotation_overrides(
    document: &dyn StructuralDocument,
    rotations: &PageMap<Rotation>,
) -> anyhow::Result<()> {
    for (&page, &rotation) in rotations {
        if page == 0 || page > document.page_count() {
            continue;
        }
        let index = page_index(page);
        let native = document.rotation(index)?;
        document.set_rotation(index, native.combine(rotation))?;
    }
    Ok(())
}

/// Parses `"1-3, 5, 7-10"` into ascending, deduplicated page numbers within
/// `1..=page_count`. Ranges are intersected with the document; single pages
/// outside it and tokens that do not start with a number select nothing.
///
/// Numbers are read from the leading digits of each token, so `"2abc"` is
/// page 2, and a range only looks at its first two `-` separated parts, so
/// `"2-3-4"` is `2-3`.
pub fn parse_page_ranges(expression: &str, page_count: usize) -> Vec<usize> {
    let mut pages = BTreeSet::new();
    for part in expression.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if part.contains('-') {
            let mut bounds = part.split('-').map(leading_number);
            match (bounds.next().flatten(), bounds.next().flatten()) {
                (Some(start), Some(end)) => {
                    pages.extend(start.max(1)..=end.min(page_count));
                }
                _ => warn!(token = part, "ignoring malformed page range"),
            }
            continue;
        }
        match leading_number(part) {
            Some(page) if (1..=page_count).contains(&page) => {
                pages.insert(page);
            }
            Some(page) => debug!(page, page_count, "page outside document ignored"),
            None => warn!(token = part, "ignoring malformed page number"),
        }
    }
    pages.into_iter().collect()
}

/// The number spelled by the leading ASCII digits of `token`. Values too
/// large for `usize` saturate, which every caller clamps to the document.
fn leading_number(token: &str) -> Option<usize> {
    let token = token.trim_start();
    let end = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let digits = &token[..end];
    if digits.is_empty() {
        return None;
    }
    Some(digits.parse().unwrap_or(usize::MAX))
}
