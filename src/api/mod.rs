//! HTTP API served by the harness's stand-in tracking server

pub mod tracking_http;

pub use tracking_http::{create_tracking_router, SharedStore};
