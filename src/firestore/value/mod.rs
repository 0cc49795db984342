mod array_value;
mod bytes_value;
mod map_value;
mod server_timestamp;
mod value;
pub mod value_util;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use server_timestamp::PendingServerTimestamp;
pub use value::{FirestoreValue, ValueKind};
