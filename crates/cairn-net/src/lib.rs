//! Blocking framed transport for the engine: byte streams, frame codec,
//! sockets with magic resynchronization, and the connection pool.

pub mod bytestream;
pub mod connpool;
pub mod frame;
pub mod pool;
pub mod socket;

pub use bytestream::ByteStream;
pub use connpool::{ConnectionPool, PoolConfig, PooledConnection, DEFAULT_MAX_IDLE};
pub use frame::{COMPRESSED_MAGIC, COMPRESSION_THRESHOLD, MAX_PAYLOAD_BYTES, PLAIN_MAGIC};
pub use pool::ByteStreamPool;
pub use socket::{
    FramedListener, FramedSocket, Liveness, PollStatus, ReadResult, TransportOptions,
};
