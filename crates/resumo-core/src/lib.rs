//! Core types and error definitions for the Resumo session engine.
//!
//! This crate provides the foundational types shared across all Resumo crates:
//! the unified error enum and the durable shapes of a conversation session.
//!
//! # Main types
//!
//! - [`ResumoError`]: Unified error enum for all Resumo subsystems.
//! - [`ResumoResult`]: Convenience alias for `Result<T, ResumoError>`.
//! - [`SessionId`]: Opaque, filesystem-safe session identifier.
//! - [`Role`]: Turn role (user, assistant, system, tool).
//! - [`Turn`]: One role-tagged, sequence-numbered unit of exchanged content.
//! - [`SessionRecord`]: The durable state of one session.
//! - [`SessionSummary`]: Lightweight per-session metadata used for listings.

/// Error types shared by every Resumo crate.
pub mod error;
/// Session identifiers, records and summaries.
pub mod record;
/// Roles and turns.
pub mod turn;

pub use error::{DecodeError, DecodeErrorKind, ResumoError, ResumoResult};
pub use record::{SessionId, SessionRecord, SessionSummary};
pub use turn::{Role, Turn};
