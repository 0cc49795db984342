pub mod bloom_filter;
pub mod existence_filter;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use existence_filter::{BloomFilterParameters, ExistenceFilter};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilterWatchChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::{
    BloomFilterApplicationStatus, TargetMetadataProvider, WatchChangeAggregator,
};
