//! Shared helpers: socket binding, worker threads, log throttling

pub mod net;
pub mod throttle;
pub mod worker;

pub use net::bind_rtp_socket;
pub use throttle::LogThrottler;
pub use worker::{WorkerThread, TERMINATE_TIMEOUT};
