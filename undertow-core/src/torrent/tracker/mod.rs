//! HTTP tracker announces.
//!
//! The coordinator only needs "announce(event) -> peers"; this module
//! supplies that over HTTP GET with compact peer lists.

pub mod client;
pub mod types;

pub use client::HttpTrackerClient;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
