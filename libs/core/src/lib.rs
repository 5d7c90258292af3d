//! Guildsmith core contracts and value types.
//!
//! This crate exposes the data structures exchanged between the broker
//! consumers, the synthesis engine, and the worker binary: the inbound event
//! envelope, the synthesis job model, declarative manifests, and runtime
//! configuration. It has no I/O of its own.

pub mod config;
pub mod event;
pub mod job;
pub mod keys;

pub use config::*;
pub use event::*;
pub use job::*;
pub use keys::*;
