// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! warden
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod process;

pub use command::{
    run_command, run_command_group, run_command_group_continue_on_error, run_remote_command,
    run_remote_command_group, run_remote_command_group_continue_on_error, Command, Precondition,
};
pub use process::{create, ActorProcess, Process, ReactorKind, SharedProcess};

#[cfg(unix)]
pub use process::Signal;

pub use warden_core::{
    options_closers_trigger, ByteSink, CancelToken, CaptureSink, Closer, CloserSet, ErrorBundle,
    ExecError, Latch, LogWriter, ProcessInfo, SpawnOptions, Trigger, TriggerSequence, ENVIRON_ID,
};

// The level a command's per-invocation records are emitted at is plain
// `tracing::Level`; re-exported so callers need no direct tracing dependency.
pub use tracing::Level;
