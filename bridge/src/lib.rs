//! Content-addressed analysis cache with bounded task orchestration.
//!
//! The server side ([`api`], [`analysis`], [`task`]) accepts documents,
//! analyses them on a bounded worker pool and caches results by content
//! hash. The client side ([`client`], [`poll`], [`import`], [`prefetch`],
//! [`speech`]) consumes that service, keeps its own local caches and
//! cancels superseded work through [`generation`].

pub mod analysis;
pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod generation;
pub mod hash;
pub mod import;
pub mod llm;
pub mod poll;
pub mod prefetch;
pub mod security;
pub mod speech;
pub mod task;

pub use config::Config;
pub use error::{Error, Result};
