use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore/query_engine"));

/// Runs queries against the local view without a persisted index.
///
/// When a target's previous results are known (its remote keys plus the
/// snapshot at which it was last free of limbo documents), only those keys
/// and documents changed since that snapshot are read. Everything else falls
/// back to a collection scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn get_documents_matching_query(
        &self,
        view: &LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() || last_limbo_free_snapshot_version.is_none() {
            return self.execute_full_collection_scan(view, query);
        }

        let previous = view.get_documents(remote_keys);
        let mut previous_results: Vec<MutableDocument> = previous
            .into_values()
            .filter(|document| query.matches(document))
            .collect();
        previous_results.sort_by(|left, right| query.compare_documents(left, right));

        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return self.execute_full_collection_scan(view, query);
        }

        LOGGER.debug(format!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        ));

        let mut results = view.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        for document in previous_results {
            results.insert(document.key().clone(), document);
        }
        results
    }

    fn execute_full_collection_scan(
        &self,
        view: &LocalDocumentsView<'_>,
        query: &Query,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        LOGGER.debug(format!("Using full collection scan to execute query: {}", query.canonical_id()));
        view.get_documents_matching_query(query, SnapshotVersion::none())
    }
}

/// Whether the cached window of a limit query may be missing documents.
///
/// A refill is needed when some remote key no longer matches, or when the
/// document at the edge of the window has pending writes or changed after the
/// last limbo-free snapshot, since it may have been pushed out of the window.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[MutableDocument],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}
