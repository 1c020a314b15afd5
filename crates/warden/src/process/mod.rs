// SPDX-License-Identifier: MIT OR Apache-2.0
//! The process capability trait, its factory, and the two reactor
//! implementations.

pub mod actor;
pub mod shared;

use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use uuid::Uuid;

use warden_core::{ByteSink, CancelToken, ExecError, ProcessInfo, SpawnOptions, Trigger, ENVIRON_ID};

pub use actor::ActorProcess;
pub use shared::SharedProcess;

#[cfg(unix)]
pub use nix::sys::signal::Signal;

/// Reactor flavor used to supervise a child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReactorKind {
    /// Lock-guarded state readable by any task; the reactor populates it on
    /// spawn and at exit.
    #[default]
    Shared,
    /// Single-owner reactor; all queries and mutations are marshalled over
    /// an operation channel.
    Actor,
}

/// Supervised handle to a single OS process.
///
/// Both reactor flavors implement this trait; callers that only need the
/// capability should hold an `Arc<dyn Process>`.
#[async_trait]
pub trait Process: Send + Sync {
    /// Stable unique id for this handle. Never blocks.
    fn id(&self) -> &str;

    /// Snapshot of the process, blocking until the PID is known or `cancel`
    /// fires. After termination this returns the cached terminal snapshot.
    async fn info(&self, cancel: &CancelToken) -> Result<ProcessInfo, ExecError>;

    /// Whether the child is currently alive.
    async fn running(&self, cancel: &CancelToken) -> bool;

    /// Whether the terminal snapshot has been written. Never blocks.
    fn complete(&self) -> bool;

    /// Deliver `signal` to the child. Fails with [`ExecError::Terminated`]
    /// once the process has completed.
    #[cfg(unix)]
    async fn signal(&self, cancel: &CancelToken, signal: Signal) -> Result<(), ExecError>;

    /// Block until the child terminates, returning its exit code.
    ///
    /// A failed child reports [`ExecError::ChildExit`]; if `cancel` fires
    /// first the call returns [`ExecError::Canceled`] without consuming the
    /// terminal snapshot for other waiters. Once terminated, every call
    /// returns the same result.
    async fn wait(&self, cancel: &CancelToken) -> Result<i32, ExecError>;

    /// Start a fresh process from this handle's original options, with the
    /// closer list reset.
    async fn respawn(&self, cancel: &CancelToken) -> Result<Arc<dyn Process>, ExecError>;

    /// Register a completion trigger. Fails with [`ExecError::Terminated`]
    /// once the terminal snapshot is set.
    async fn register_trigger(
        &self,
        cancel: &CancelToken,
        trigger: Trigger,
    ) -> Result<(), ExecError>;

    /// Add a tag to the handle and its spawn options.
    fn tag(&self, tag: &str);

    /// Remove all tags.
    fn reset_tags(&self);

    /// Current tags, in deterministic order.
    fn get_tags(&self) -> Vec<String>;
}

/// Spawn a child under the given reactor flavor.
///
/// This is the factory consumed by registries and the command composer: it
/// assigns the process id, injects [`ENVIRON_ID`], installs the
/// options-closers trigger, resolves the options, and launches the reactor
/// task. Must be called from within a tokio runtime.
pub fn create(
    kind: ReactorKind,
    cancel: &CancelToken,
    options: SpawnOptions,
) -> Result<Arc<dyn Process>, ExecError> {
    match kind {
        ReactorKind::Shared => SharedProcess::spawn(cancel, options).map(|p| p as Arc<dyn Process>),
        ReactorKind::Actor => ActorProcess::spawn(cancel, options).map(|p| p as Arc<dyn Process>),
    }
}

// ---------------------------------------------------------------------------
// Spawn plumbing shared by both reactors
// ---------------------------------------------------------------------------

/// Assign an id, inject it into the child environment, and resolve the host
/// name. Returns `(id, host)`.
fn prepare(options: &mut SpawnOptions) -> (String, String) {
    let id = Uuid::new_v4().to_string();
    options.add_env(ENVIRON_ID, &id);
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    (id, host)
}

/// Attach pump tasks copying the child's piped output into the configured
/// sinks.
///
/// The reactor awaits the returned handles after the child exits, so the
/// terminal snapshot is only published once every captured byte has reached
/// its sink.
fn pump_output(child: &mut Child, options: &SpawnOptions) -> Vec<tokio::task::JoinHandle<()>> {
    let mut pumps = Vec::new();
    if let (Some(stdout), Some(sink)) = (child.stdout.take(), options.stdout.clone()) {
        pumps.push(tokio::spawn(copy_to_sink(stdout, sink)));
    }
    if let (Some(stderr), Some(sink)) = (child.stderr.take(), options.stderr.clone()) {
        pumps.push(tokio::spawn(copy_to_sink(stderr, sink)));
    }
    pumps
}

async fn copy_to_sink<R>(mut reader: R, sink: ByteSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if sink.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }
}

/// Derive the reported exit code from an OS status: the signal number when
/// the child was signal-killed, the plain status otherwise.
fn exit_code_of(status: &ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Convert a delivery failure from the OS into the handle error.
#[cfg(unix)]
fn signal_error(id: &str, errno: nix::errno::Errno) -> ExecError {
    ExecError::Signal {
        id: id.to_string(),
        source: std::io::Error::from_raw_os_error(errno as i32),
    }
}

/// Clone a terminal snapshot's options for a respawn: same argv, directory,
/// environment, and tags, but fresh closers and a cleared started latch.
fn respawn_options(info: &ProcessInfo) -> SpawnOptions {
    let mut options = info.options.clone();
    options.reset_closers();
    options.started = false;
    options
}
