//! evalbridge library
//!
//! This crate provides the pieces of the out-of-process evaluator:
//! - Length-prefixed framing and the binary message codec
//! - Handle table, expression assembly and result marshaling
//! - Scripting engine trait with a rhai implementation
//! - Worker thread and the supervisor that relays the byte stream

pub mod assembly;
pub mod config;
pub mod engine;
pub mod error;
pub mod handles;
pub mod marshal;
pub mod supervisor;
pub mod transport;
pub mod worker;
