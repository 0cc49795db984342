pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
