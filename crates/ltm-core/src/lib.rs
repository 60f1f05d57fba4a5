//! Core types and trait definitions for the bitemporal knowledge store.
//!
//! This crate is deliberately free of HTTP and database dependencies.
//! All other crates depend on it.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod clock;
pub mod entity;
pub mod error;
pub mod history;
pub mod query;
pub mod store;
pub mod time;
pub mod value;
pub mod version;

pub use error::{Error, Result};
