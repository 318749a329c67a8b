//! Worker and connection pools.

pub mod conn_pool;
pub mod thread_pool;

pub use conn_pool::{ConnPool, PoolError, PooledConn};
pub use thread_pool::ThreadPool;
