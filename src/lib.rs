//! # OPC UA register-access backend
//!
//! Core of an OPC UA client backend that exposes remote OPC UA variables as
//! a uniform register-access API: callers name a register by path, obtain a
//! typed [`accessor::Accessor`], and perform synchronous reads, synchronous
//! writes, or subscription-driven asynchronous reads with exception-carrying
//! notification streams.
//!
//! ## Responsibilities
//!
//! 1. Establish and supervise an OPC UA secure channel/session
//!    ([`connection`]), tracking liveness and driving recovery through
//!    [`backend::Backend::open`].
//! 2. Multiplex many monitored items onto a single OPC UA subscription,
//!    de-duplicating requests for the same node and fanning values out to
//!    every accessor observing it ([`subscription`]).
//! 3. Bridge native OPC UA wire values to typed user buffers, including
//!    partial-array read-modify-write and cross-accessor version
//!    consistency ([`accessor`], [`codec`], [`version_map`]).
//!
//! ## NOT responsible for
//!
//! - Reading the on-disk XML catalogue cache or mapfile into memory (disk
//!   I/O): this crate only consumes already-parsed [`catalogue::mapfile::MapEntry`]
//!   lists and [`catalogue::cache::CatalogueDocument`]s.
//! - CLI/parameter parsing at process level: [`config::BackendParameters`]
//!   is built from a `HashMap<String, String>`, not `std::env`/`argv`.
//! - An embedded OPC UA test server (out of scope; unit tests use the
//!   in-memory [`native::fake::FakeClient`] instead).
//! - OPC UA server implementation, structured/complex types, method calls,
//!   events, history, alarms, or cross-subscription ordering.

pub mod accessor;
pub mod backend;
pub mod catalogue;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod native;
pub mod subscription;
pub mod types;
pub mod version_map;

pub use accessor::{Accessor, ReadOutcome};
pub use backend::Backend;
pub use codec::AccessorValue;
pub use config::BackendParameters;
pub use error::{BackendError, BackendResult, ConversionError};
pub use types::{NodeId, RegisterInfo, TypeCode};
pub use version_map::VersionNumber;
