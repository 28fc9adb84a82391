//! Core types and utilities for the multi-component transform engine
//!
//! This crate provides the fundamental data structures shared by the
//! transform network and its concurrency machinery: error types, row
//! buffers, fixed-point constants, and the arena/handle storage scheme.

pub mod arena;
pub mod consts;
pub mod error;
pub mod line_buf;
pub mod types;

pub use arena::{Arena, ArenaHandle, BlockHandle, LineHandle};
pub use error::{MctError, MctResult};
pub use line_buf::LineBuf;
pub use types::*;
