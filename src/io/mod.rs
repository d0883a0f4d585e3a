/// Scalar codec helpers (ints, floats, VarInt/VarLong, prefixed arrays)
pub mod codec;

/// Byte meters and metered reader/writer wrappers
pub mod metered;

/// Generic thread-safe object pool
pub mod pool;

pub use codec::ByteOrder;
pub use metered::{Meter, MeteredReader, MeteredWriter};
pub use pool::Pool;
