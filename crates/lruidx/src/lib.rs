#![forbid(unsafe_code)]
//! Bucket LRU index public API facade.
//!
//! Re-exports `lru-core` through a stable external interface. Downstream
//! allocators and tools depend on this crate.

pub use lru_core::*;
