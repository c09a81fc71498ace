//! Model Connection Routing
//!
//! Every completion in the process goes through one [`ConnectionPool`],
//! which resolves an endpoint prefix to a model server and bounds how many
//! clients are open at once.
//!
//! # Architecture
//!
//! ```text
//! +------------------+
//! |   Completions    |  <-- Entry point for all model requests
//! +--------+---------+
//!          |  prefix ("" or "Cheap")
//!          v
//! +------------------+
//! |  ConnectionPool  |  <-- N permits, FIFO wait, optional timeout
//! +--------+---------+
//!          |
//!          v
//! +------------------+
//! |  BackendFactory  |  <-- Fresh client per unit of work
//! +------------------+
//! ```

pub mod connection_pool;

pub use connection_pool::{ConnectionPool, PoolError, PoolStats};
