// SPDX-License-Identifier: MIT OR Apache-2.0
//! Observable and terminal process snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::options::SpawnOptions;

/// Point-in-time view of a supervised process.
///
/// While the child runs the snapshot is interim; at termination the reactor
/// writes it once, after which no field other than informational copies
/// changes again.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Stable unique id assigned by the factory.
    pub id: String,
    /// Copy of the options the process was spawned with.
    pub options: SpawnOptions,
    /// Hostname of the machine supervising the process.
    pub host: String,
    /// OS process id: 0 before start, positive while alive.
    pub pid: i32,
    /// Whether the child is alive.
    pub is_running: bool,
    /// Whether the terminal snapshot has been written.
    pub complete: bool,
    /// Whether the child exited with status zero.
    pub successful: bool,
    /// Exit status; the signal number when signal-killed, -1 when the
    /// supervisor was cancelled before the child exited.
    pub exit_code: i32,
    /// When the child was spawned.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the terminal snapshot was written.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInfo {
    /// The result every `wait` call derives from a terminal snapshot.
    ///
    /// `Ok(exit_code)` for a successful exit, [`ExecError::ChildExit`]
    /// otherwise. Calling this on a non-terminal snapshot is a logic error
    /// and reports [`ExecError::Canceled`].
    pub fn wait_result(&self) -> Result<i32, ExecError> {
        if !self.complete {
            return Err(ExecError::Canceled);
        }
        if self.successful {
            Ok(self.exit_code)
        } else {
            Err(ExecError::ChildExit {
                code: self.exit_code,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
