use crate::firestore::error::FirestoreResult;
use crate::firestore::local::journal::JournaledCell;
use crate::firestore::local::local_serializer::{decode_bytes, encode_bytes, SESSION_TOKEN_KEY};
use crate::firestore::local::storage::{StorageRow, StorageTable, StorageWrite};

/// Cross-session values that belong to no other cache.
#[derive(Debug, Default)]
pub struct GlobalsCache {
    session_token: JournaledCell<Vec<u8>>,
}

impl GlobalsCache {
    pub fn session_token(&self) -> &[u8] {
        self.session_token.get()
    }

    pub fn set_session_token(&mut self, token: Vec<u8>) {
        self.session_token.set(token);
    }

    pub(crate) fn load(rows: &[StorageRow]) -> FirestoreResult<Self> {
        let mut cache = Self::default();
        for row in rows {
            if row.table == StorageTable::Globals && row.key == SESSION_TOKEN_KEY {
                cache.session_token = JournaledCell::new(decode_bytes("session token", &row.value)?);
            }
        }
        Ok(cache)
    }

    pub(crate) fn pending_writes(&self, writes: &mut Vec<StorageWrite>) {
        if self.session_token.is_dirty() {
            writes.push(StorageWrite::Put(StorageRow {
                table: StorageTable::Globals,
                key: SESSION_TOKEN_KEY.to_string(),
                value: encode_bytes(self.session_token.get()),
            }));
        }
    }

    pub(crate) fn commit(&mut self) {
        self.session_token.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.session_token.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_token_is_written_once_dirty() {
        let mut cache = GlobalsCache::default();
        let mut writes = Vec::new();
        cache.pending_writes(&mut writes);
        assert!(writes.is_empty());

        cache.set_session_token(b"session".to_vec());
        cache.pending_writes(&mut writes);
        assert_eq!(writes.len(), 1);

        let StorageWrite::Put(row) = &writes[0] else {
            panic!("expected a put");
        };
        let restored = GlobalsCache::load(std::slice::from_ref(row)).unwrap();
        assert_eq!(restored.session_token(), b"session");
    }
}
