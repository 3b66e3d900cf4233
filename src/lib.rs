//! chunkd Library
//!
//! Embedded-style HTTP file server built around a bounded, buffered
//! storage-to-network transfer pipeline

pub mod buffer;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod logging;
pub mod server;
pub mod status;
pub mod storage;
pub mod transfer;
pub mod worker;
