use thiserror::Error;

use crate::session::SessionId;

pub type EditorResult<T> = Result<T, EditorError>;

#[derive(Debug, Error)]
pub enum EditorError {
    #[error("failed to load document")]
    Load(#[source] anyhow::Error),

    #[error("mutation rejected: {0}")]
    MutationRejected(Rejection),

    #[error("failed to save document")]
    Save(#[source] anyhow::Error),

    #[error("failed to render page {page}")]
    Render {
        page: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A structural collaborator call failed part way through a mutation.
    /// The working copy is discarded, so the live document is unchanged.
    #[error("structural edit failed")]
    Engine(#[source] anyhow::Error),

    #[error("no document is open")]
    NoActiveSession,

    #[error("unknown session {0}")]
    UnknownSession(SessionId),
}

impl EditorError {
    pub fn is_rejection(&self) -> bool {
        matches!(self, EditorError::MutationRejected(_))
    }
}

impl From<Rejection> for EditorError {
    fn from(rejection: Rejection) -> Self {
        EditorError::MutationRejected(rejection)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("page {page} is outside 1..={page_count}")]
    PageOutOfRange { page: usize, page_count: usize },

    #[error("a document must keep at least one page")]
    LastPage,

    #[error("page range `{0}` selects no pages")]
    EmptySelection(String),

    #[error("page {0} is already at that position")]
    SamePosition(usize),

    #[error("no documents to merge")]
    NothingToMerge,
}

/// Rejects `page` unless it lies in `1..=page_count`.
pub(crate) fn check_page(page: usize, page_count: usize) -> Result<(), Rejection> {
    if page == 0 || page > page_count {
        return Err(Rejection::PageOutOfRange { page, page_count });
    }
    Ok(())
}
