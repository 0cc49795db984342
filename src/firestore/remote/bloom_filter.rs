use crate::firestore::error::{invalid_argument, FirestoreResult};

/// Probabilistic set of document names sent by the backend alongside an
/// existence filter.
///
/// Membership is tested with double hashing over the MD5 digest of the
/// name: the two little-endian 64-bit halves of the digest seed `hash_count`
/// bit probes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bitmap: Vec<u8>,
    hash_count: i32,
    bit_count: u64,
}

impl BloomFilter {
    pub fn new(bitmap: Vec<u8>, padding: i32, hash_count: i32) -> FirestoreResult<Self> {
        if !(0..8).contains(&padding) {
            return Err(invalid_argument(format!("Invalid padding: {padding}")));
        }
        if hash_count < 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }
        if bitmap.is_empty() {
            if padding != 0 {
                return Err(invalid_argument(format!("Invalid padding: {padding}")));
            }
        } else if hash_count == 0 {
            return Err(invalid_argument(format!("Invalid hash count: {hash_count}")));
        }

        let bit_count = bitmap.len() as u64 * 8 - padding as u64;
        Ok(Self {
            bitmap,
            hash_count,
            bit_count,
        })
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn hash_count(&self) -> i32 {
        self.hash_count
    }

    pub fn might_contain(&self, value: &str) -> bool {
        if self.bit_count == 0 {
            return false;
        }
        let digest = md5::compute(value.as_bytes());
        let (hash1, hash2) = split_digest(&digest.0);
        (0..self.hash_count as u64).all(|round| {
            let index = hash1.wrapping_add(hash2.wrapping_mul(round)) % self.bit_count;
            self.is_bit_set(index)
        })
    }

    fn is_bit_set(&self, index: u64) -> bool {
        let byte = self.bitmap[(index / 8) as usize];
        byte & (1 << (index % 8)) != 0
    }
}

fn split_digest(digest: &[u8; 16]) -> (u64, u64) {
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&digest[..8]);
    high.copy_from_slice(&digest[8..]);
    (u64::from_le_bytes(low), u64::from_le_bytes(high))
}
