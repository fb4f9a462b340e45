//! Core domain types for tether.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! The supervisor, configuration and CLI crates all speak in these terms.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod ids;
mod launch;
mod project;
mod restart;
mod state;

pub use ids::{ChannelId, ProcessExit, ProcessId};
pub use launch::{
    DescriptorError, ExecutionTarget, LaunchDescriptor, LaunchDescriptorBuilder, ProgramSpec,
    StderrPolicy,
};
pub use project::ProjectKey;
pub use restart::RestartPolicy;
pub use state::SupervisorState;
