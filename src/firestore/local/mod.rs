pub mod globals_cache;
mod journal;
pub mod local_documents_view;
pub(crate) mod local_serializer;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod storage;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use globals_cache::GlobalsCache;
#[doc(inline)]
pub use local_documents_view::LocalDocumentsView;
#[doc(inline)]
pub use local_store::{
    DocumentMap, LocalStore, LocalViewChanges, LocalWriteResult, QueryResult,
    RESUME_TOKEN_MAX_AGE_SECONDS,
};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults, CACHE_SIZE_UNLIMITED};
#[doc(inline)]
pub use mutation_queue::MutationQueue;
#[doc(inline)]
pub use persistence::{Persistence, Transaction};
#[doc(inline)]
pub use query_engine::QueryEngine;
#[doc(inline)]
pub use reference_set::ReferenceSet;
#[doc(inline)]
pub use remote_document_cache::RemoteDocumentCache;
#[doc(inline)]
pub use storage::{DurableStorage, MemoryStorage, StorageRow, StorageTable, StorageWrite};
#[doc(inline)]
pub use target_cache::TargetCache;
#[doc(inline)]
pub use target_data::{QueryPurpose, TargetData};
