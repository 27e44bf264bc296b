//! Proxy daemon support.
//!
//! This module provides:
//! - Configuration types (`config`)
//! - The axum reverse proxy in front of the interceptor (`service`)
//!
//! # Transport Extensibility
//!
//! Only TCP is supported. Clients point their GraphQL endpoint at the
//! daemon's address; everything the daemon receives is forwarded to the
//! configured upstream origin.

pub mod config;
pub mod service;

pub use service::{HEALTH_PATH, router};
