// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! warden-core
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod info;
pub mod options;
pub mod sink;
pub mod sync;
pub mod trigger;

pub use error::{ErrorBundle, ExecError};
pub use info::ProcessInfo;
pub use options::{SpawnOptions, ENVIRON_ID};
pub use sink::{ByteSink, CaptureSink, Closer, CloserSet, LogWriter};
pub use sync::{CancelToken, Latch};
pub use trigger::{options_closers_trigger, Trigger, TriggerSequence};
