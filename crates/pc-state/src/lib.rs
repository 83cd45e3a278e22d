//! Reactive client state for the prompt compiler: the store, the derived
//! caches, live job streams and the history refresh loop.

pub mod config;
pub mod history_cache;
pub mod job_stream;
pub mod keys;
pub mod preflight_cache;
pub mod refresh_scheduler;
pub mod runtime;
pub mod store;
pub mod transport;

pub use config::{parse_bool_flag, ConfigError, RuntimeConfig};
pub use history_cache::HistoryCache;
pub use job_stream::{JobStreamCoordinator, StreamState};
pub use preflight_cache::PreflightCache;
pub use refresh_scheduler::{RefreshPhase, RefreshScheduler};
pub use runtime::PcRuntime;
pub use store::{Store, Subscription};
pub use transport::{
    JobTransport, LiveConnection, MemoryTransport, TransportEvent, TransportLogEntry,
};
