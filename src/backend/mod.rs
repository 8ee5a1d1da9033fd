//! Backend lifecycle: ports, readiness polling, server processes
//!
//! - `port`: ephemeral port allocation
//! - `wait`: bounded retry utility used for readiness
//! - `server`: `BackendProvisioner` and the `BackendHandle` it returns

pub mod port;
pub mod server;
pub mod wait;

pub use port::allocate_port;
pub use server::{BackendHandle, BackendProvisioner, READINESS_PATH};
pub use wait::{wait_until, Attempt, WaitOutcome};
