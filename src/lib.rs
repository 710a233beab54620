//! `turn-kernel`: deterministic turn orchestration core for the realtime
//! speech pipeline.
//!
//! The crate has no I/O of its own — transports, provider adapters, and
//! control-plane backends are injected by the host process as trait objects
//! (`control_plane::backends`, `provider::invocation::Adapter`). What this
//! crate guarantees is the turn lifecycle itself: exactly-once
//! terminalization, deterministic plan/replay artifacts, and fixed-order
//! pre-turn and flow-control decisions, independent of wall-clock jitter or
//! backend response order.
//!
//! Module map (spec component numbering in parentheses):
//!
//! - [`event`] — inbound event normalization (C1)
//! - [`control_plane`] — backend collaborator traits and turn-start bundle
//!   resolution (C2)
//! - [`guard`] — pre-turn authority/admission guard (C3)
//! - [`plan`] — deterministic turn plan resolution (C4)
//! - [`arbiter`] — the turn state machine (C5)
//! - [`provider`] — provider invocation controller (C6)
//! - [`streaming`] — streaming handoff scheduler (C7)
//! - [`fence`] — cancellation output fence (C8)
//! - [`flow`] — buffering and flow control (C9)
//! - [`recorder`] — baseline recorder (C10)
//! - [`replay`] — replay comparator (C11)
//! - [`slo`] — SLO gate evaluator (C12)
//! - [`session`] — session orchestrator façade (C13)
//! - [`telemetry`] — observability facade (C14)
//!
//! Cross-cutting primitives (`ids`, `error`, `time`, `contract`, `config`)
//! are shared by every component above.

pub mod arbiter;
pub mod config;
pub mod contract;
pub mod control_plane;
pub mod error;
pub mod event;
pub mod fence;
pub mod flow;
pub mod guard;
pub mod ids;
pub mod plan;
pub mod provider;
pub mod recorder;
pub mod replay;
pub mod session;
pub mod slo;
pub mod streaming;
pub mod telemetry;
pub mod time;

pub use error::{CoreError, ErrorKind, Result};
