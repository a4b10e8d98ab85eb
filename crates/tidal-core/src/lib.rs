pub mod chunk;
pub mod config;
pub mod controller;
pub mod errors;
pub mod estimate;
pub mod events;
pub mod perf_history;
pub mod perf_tracker;
pub mod profile;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod units;

pub use errors::{TransferError, TransferResult};
pub use profile::{ConnectionClass, Profile};
pub use session::{start_transfer, SessionHandle, SessionState, TransferRequest, TransferSession, TransferSummary};
