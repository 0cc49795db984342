pub mod document_set;
mod drain_queue;
pub mod query;
pub mod sync_engine;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

#[doc(inline)]
pub use document_set::DocumentSet;

#[doc(inline)]
pub use query::{
    DocumentComparator, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query,
};

#[doc(inline)]
pub use sync_engine::{
    ListenOptions, ListenerRegistration, PendingWrite, SnapshotStream, SyncEngine,
    SyncEngineSettings, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
};

#[doc(inline)]
pub use target_id_generator::TargetIdGenerator;

#[doc(inline)]
pub use view::{
    LimboChangeKind, LimboDocumentChange, OnlineState, SyncState, View, ViewChange,
    ViewDocumentChanges,
};

#[doc(inline)]
pub use view_snapshot::{ChangeKind, DocumentViewChange, DocumentViewChangeSet, ViewSnapshot};
