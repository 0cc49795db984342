use crate::firestore::error::FirestoreError;
use crate::firestore::model::{DocumentKey, MutableDocument, TargetId};
use crate::firestore::remote::existence_filter::ExistenceFilter;

/// One decoded message from the watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterWatchChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// State change for a set of targets; an empty `target_ids` addresses every active target.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: impl Into<Vec<u8>>) -> Self {
        self.resume_token = resume_token.into();
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entering, changing in, or leaving the result sets of targets.
///
/// `new_document` is `None` when the document merely left the listed
/// targets; a `NoDocument` reports an explicit deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_document: Option<MutableDocument>,
}

impl DocumentWatchChange {
    pub fn updated(document: MutableDocument, target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: target_ids,
            removed_target_ids: Vec::new(),
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    pub fn deleted(document: MutableDocument, target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids,
            key: document.key().clone(),
            new_document: Some(document),
        }
    }

    pub fn removed(key: DocumentKey, target_ids: Vec<TargetId>) -> Self {
        Self {
            updated_target_ids: Vec::new(),
            removed_target_ids: target_ids,
            key,
            new_document: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterWatchChange {
    pub filter: ExistenceFilter,
    pub target_id: TargetId,
}
