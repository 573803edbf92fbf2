//! # incus-core
//!
//! Core types and utilities for talking to an Incus server over its REST API.
//!
//! This crate provides the error taxonomy, response envelope decoding, HTTP
//! policies and the transport abstraction that the higher-level client crate
//! builds on.
//!
//! ## Modules
//!
//! - [`error`] - Error taxonomy and translation of HTTP outcomes
//! - [`types`] - Response envelope and background operation types
//! - [`config`] - Validated client configuration
//! - [`client`] - HTTP client settings, retry and polling policies
//! - [`query`] - Query parameter builder
//! - [`transport`] - Transport trait and the reqwest-backed implementation

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;
pub mod query;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::{ApiResponse, Operation, OperationStatus, ResponseType};
