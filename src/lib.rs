//! Cross-implementation conformance harness for experiment-tracking clients
//!
//! Every client-under-test performs the same recording workload against a
//! fresh backend, once per storage mode (local file store, HTTP tracking
//! server). The harness then reads the backend back and checks that the
//! recorded run is exactly the one the workload describes.

pub mod api;
pub mod backend;
pub mod core;
pub mod store;
pub mod suite;
pub mod verify;
pub mod workload;

/// Testing utilities for integration tests.
pub mod testing;

pub use crate::core::{HarnessConfig, HarnessError, StorageMode, TrackingTarget};
pub use crate::suite::{ConformanceSuite, SuiteReport};
