//! qgate-pool — backend sessions and the credential-aware session pool.
//!
//! # Components
//!
//! - **`backend`** — [`Connector`] / [`Session`] / [`RowCursor`] traits the
//!   gateway runs queries through, plus [`CellValue`]
//! - **`session`** — [`PooledSession`], one backend handle with its expiry and metrics
//! - **`pool`** — [`SessionPool`], idle sessions keyed by connection descriptor
//! - **`clock`** — wall-clock injection for expiry checks

pub mod backend;
pub mod clock;
pub mod error;
pub mod pool;
pub mod session;

pub use backend::{CancelHandle, CellValue, Command, Connector, RowCursor, Session};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackendError, PoolError, PoolResult};
pub use pool::{KeyStats, PoolConfig, PoolCounters, PoolStats, SessionPool};
pub use session::{PooledSession, SessionMetrics, SessionSnapshot};
