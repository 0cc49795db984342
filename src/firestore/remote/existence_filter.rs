use crate::firestore::error::FirestoreResult;
use crate::firestore::remote::bloom_filter::BloomFilter;

/// Raw bloom filter parameters as delivered with an existence filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BloomFilterParameters {
    pub bitmap: Vec<u8>,
    pub padding: i32,
    pub hash_count: i32,
}

impl BloomFilterParameters {
    pub fn to_bloom_filter(&self) -> FirestoreResult<BloomFilter> {
        BloomFilter::new(self.bitmap.clone(), self.padding, self.hash_count)
    }
}

/// Backend assertion of how many documents currently match a target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExistenceFilter {
    pub count: i32,
    /// Names of documents that still match, if the backend sent them.
    pub unchanged_names: Option<BloomFilterParameters>,
}

impl ExistenceFilter {
    pub fn new(count: i32) -> Self {
        Self {
            count,
            unchanged_names: None,
        }
    }

    pub fn with_bloom_filter(count: i32, unchanged_names: BloomFilterParameters) -> Self {
        Self {
            count,
            unchanged_names: Some(unchanged_names),
        }
    }
}
