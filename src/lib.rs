//! Multi-workspace pipeline orchestration engine for EverUI.
//!
//! Two components form the core, in dependency order:
//!
//! - [`workspace`] — a durable, file-backed store of workspace records keyed
//!   by an `{org}/{repo}/{feature}` triple. One JSON document per workspace.
//! - [`pipeline`] — an in-memory, per-workspace state machine that drives an
//!   ordered list of prompt-based steps through an injected [`pipeline::StepExecutor`],
//!   with pause/resume/rewind/jump and a status broadcast channel.
//!
//! The hosting UI selects or creates a workspace through the store, points a
//! [`pipeline::PipelineRunner`] at that workspace id, and supplies the executor
//! that performs the actual step work. Everything else (rendering, terminals,
//! git, prompt generation) lives outside this crate.

pub mod errors;
pub mod pipeline;
pub mod workspace;

pub use errors::{OrchestratorError, Result};
