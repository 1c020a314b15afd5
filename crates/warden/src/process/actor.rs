// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-owner process handle.
//!
//! The reactor task exclusively owns the OS child. Queries marshal
//! themselves as closures over an operation channel and wait on a one-shot
//! reply; once the terminal snapshot exists they short-circuit to it without
//! touching the channel, so a finished reactor can never wedge a caller.

use std::process::ExitStatus;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use warden_core::{
    options_closers_trigger, CancelToken, ExecError, Latch, ProcessInfo, SpawnOptions, Trigger,
    TriggerSequence,
};

use super::{exit_code_of, prepare, pump_output, respawn_options, Process};

#[cfg(unix)]
use super::{signal_error, Signal};

/// Closure executed by the reactor with exclusive access to the child.
type Op = Box<dyn FnOnce(&mut Child) + Send>;

/// Upper bound for the wait-poll backoff, in milliseconds.
const WAIT_JITTER_MS: u64 = 50;

struct ActorState {
    options: SpawnOptions,
    info: Option<ProcessInfo>,
    triggers: TriggerSequence,
}

/// Process handle whose child is owned by a single reactor task.
pub struct ActorProcess {
    id: String,
    host: String,
    ops: mpsc::Sender<Op>,
    state: Arc<RwLock<ActorState>>,
    started_at: DateTime<Utc>,
    // Opened after the terminal snapshot is written and the triggers have
    // run, so waiters observe both in that order.
    wait_processed: Latch,
}

impl ActorProcess {
    /// Spawn a child and launch its reactor.
    pub fn spawn(
        cancel: &CancelToken,
        mut options: SpawnOptions,
    ) -> Result<Arc<Self>, ExecError> {
        let (id, host) = prepare(&mut options);
        let mut command = options.resolve()?;
        let mut child = command.spawn().map_err(ExecError::Start)?;
        options.started = true;
        let pumps = pump_output(&mut child, &options);

        let pid = child.id().map(|pid| pid as i32).unwrap_or(0);
        let started_at = Utc::now();

        let mut triggers = TriggerSequence::new();
        triggers.push(options_closers_trigger());

        let state = Arc::new(RwLock::new(ActorState {
            options,
            info: None,
            triggers,
        }));

        let (ops_tx, ops_rx) = mpsc::channel::<Op>(1);
        let process = Arc::new(Self {
            id: id.clone(),
            host: host.clone(),
            ops: ops_tx,
            state: Arc::clone(&state),
            started_at,
            wait_processed: Latch::new(),
        });

        tokio::spawn(reactor(
            state,
            cancel.clone(),
            ops_rx,
            child,
            pumps,
            process.wait_processed.clone(),
            ReactorIdentity {
                id,
                host,
                pid,
                started_at,
            },
        ));

        Ok(process)
    }

    fn cached(&self) -> Option<ProcessInfo> {
        self.state
            .read()
            .expect("process state lock poisoned")
            .info
            .clone()
    }

    fn has_info(&self) -> bool {
        self.state
            .read()
            .expect("process state lock poisoned")
            .info
            .is_some()
    }
}

struct ReactorIdentity {
    id: String,
    host: String,
    pid: i32,
    started_at: DateTime<Utc>,
}

async fn reactor(
    state: Arc<RwLock<ActorState>>,
    cancel: CancelToken,
    mut ops_rx: mpsc::Receiver<Op>,
    mut child: Child,
    mut pumps: Vec<tokio::task::JoinHandle<()>>,
    wait_processed: Latch,
    identity: ReactorIdentity,
) {
    let mut ops_open = true;
    loop {
        tokio::select! {
            status = child.wait() => {
                // Let the output pumps reach EOF before the snapshot becomes
                // visible to waiters.
                for pump in pumps.drain(..) {
                    let _ = pump.await;
                }
                finalize(&state, &identity, status.ok());
                wait_processed.open();
                return;
            }
            _ = cancel.cancelled() => {
                // Supervision stops here; the child itself is left running.
                finalize(&state, &identity, None);
                wait_processed.open();
                return;
            }
            op = ops_rx.recv(), if ops_open => {
                match op {
                    Some(op) => op(&mut child),
                    None => ops_open = false,
                }
            }
        }
    }
}

/// Write the terminal snapshot, then run the triggers taken under the same
/// lock. `status` is `None` when supervision was cancelled before exit.
fn finalize(
    state: &Arc<RwLock<ActorState>>,
    identity: &ReactorIdentity,
    status: Option<ExitStatus>,
) {
    let (snapshot, triggers) = {
        let mut st = state.write().expect("process state lock poisoned");
        let mut info = ProcessInfo {
            id: identity.id.clone(),
            options: st.options.clone(),
            host: identity.host.clone(),
            pid: identity.pid,
            is_running: false,
            complete: true,
            successful: false,
            exit_code: -1,
            started_at: Some(identity.started_at),
            ended_at: Some(Utc::now()),
        };
        if let Some(status) = status {
            info.exit_code = exit_code_of(&status);
            info.successful = status.success();
        }
        st.info = Some(info.clone());
        (info, st.triggers.take())
    };

    debug!(
        id = %snapshot.id,
        cmd = %snapshot.options.args.join(" "),
        success = snapshot.successful,
        num_triggers = triggers.len(),
        "process reactor finished"
    );

    triggers.run(&snapshot);
}

#[async_trait]
impl Process for ActorProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn info(&self, cancel: &CancelToken) -> Result<ProcessInfo, ExecError> {
        if let Some(info) = self.cached() {
            return Ok(info);
        }

        let (tx, rx) = oneshot::channel();
        let id = self.id.clone();
        let host = self.host.clone();
        let state = Arc::clone(&self.state);
        let started_at = self.started_at;
        let op: Op = Box::new(move |child| {
            let pid = child.id().map(|pid| pid as i32).unwrap_or(0);
            let options = state
                .read()
                .expect("process state lock poisoned")
                .options
                .clone();
            let _ = tx.send(ProcessInfo {
                id,
                options,
                host,
                pid,
                is_running: pid > 0,
                complete: false,
                successful: false,
                exit_code: -1,
                started_at: Some(started_at),
                ended_at: None,
            });
        });

        tokio::select! {
            sent = self.ops.send(op) => {
                if sent.is_err() {
                    // The reactor has exited, so the terminal snapshot exists.
                    return self.cached().ok_or(ExecError::Canceled);
                }
                tokio::select! {
                    out = rx => match out {
                        Ok(info) => Ok(info),
                        Err(_) => self.cached().ok_or(ExecError::Canceled),
                    },
                    _ = cancel.cancelled() => self.cached().ok_or(ExecError::Canceled),
                }
            }
            _ = cancel.cancelled() => self.cached().ok_or(ExecError::Canceled),
        }
    }

    async fn running(&self, cancel: &CancelToken) -> bool {
        if self.has_info() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        let op: Op = Box::new(move |child| {
            let _ = tx.send(child.id().is_some());
        });

        tokio::select! {
            sent = self.ops.send(op) => {
                if sent.is_err() {
                    return false;
                }
                tokio::select! {
                    out = rx => out.unwrap_or(false),
                    _ = cancel.cancelled() => false,
                }
            }
            _ = cancel.cancelled() => false,
        }
    }

    fn complete(&self) -> bool {
        self.has_info()
    }

    #[cfg(unix)]
    async fn signal(&self, cancel: &CancelToken, signal: Signal) -> Result<(), ExecError> {
        if self.has_info() {
            return Err(ExecError::Terminated);
        }

        let (tx, rx) = oneshot::channel::<Result<(), ExecError>>();
        let id = self.id.clone();
        let op: Op = Box::new(move |child| {
            let res = match child.id() {
                Some(pid) => {
                    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), signal)
                        .map_err(|errno| signal_error(&id, errno))
                }
                None => Err(ExecError::Terminated),
            };
            let _ = tx.send(res);
        });

        tokio::select! {
            sent = self.ops.send(op) => {
                if sent.is_err() {
                    return Err(ExecError::Terminated);
                }
                tokio::select! {
                    out = rx => out.unwrap_or(Err(ExecError::Terminated)),
                    _ = cancel.cancelled() => Err(ExecError::Canceled),
                }
            }
            _ = cancel.cancelled() => Err(ExecError::Canceled),
        }
    }

    async fn wait(&self, cancel: &CancelToken) -> Result<i32, ExecError> {
        loop {
            if let Some(info) = self.cached() {
                // The snapshot lands before the triggers run; hold waiters
                // until both are done.
                tokio::select! {
                    biased;
                    _ = self.wait_processed.wait() => {}
                    _ = cancel.cancelled() => return Err(ExecError::Canceled),
                }
                return info.wait_result();
            }

            // Race a submit attempt against a short, jittered sleep so a
            // reactor that has already exited cannot strand this caller.
            let jitter = rand::thread_rng().gen_range(0..WAIT_JITTER_MS);
            let (tx, rx) = oneshot::channel::<()>();
            let state = Arc::clone(&self.state);
            let waiter: Op = Box::new(move |_child| {
                let terminal = state
                    .read()
                    .expect("process state lock poisoned")
                    .info
                    .is_some();
                if terminal {
                    let _ = tx.send(());
                }
                // Otherwise the reply channel is dropped and the caller
                // retries.
            });

            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(jitter)) => continue,
                sent = self.ops.send(waiter) => {
                    if sent.is_err() {
                        continue;
                    }
                    tokio::select! {
                        out = rx => match out {
                            // Terminal: loop back through the cached path.
                            Ok(()) => continue,
                            // The waiter ran before exit; back off, then probe
                            // again.
                            Err(_) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(Duration::from_millis(jitter.max(1))) => continue,
                                    _ = cancel.cancelled() => return Err(ExecError::Canceled),
                                }
                            }
                        },
                        _ = cancel.cancelled() => return Err(ExecError::Canceled),
                    }
                }
            }
        }
    }

    async fn respawn(&self, cancel: &CancelToken) -> Result<Arc<dyn Process>, ExecError> {
        let info = self.info(cancel).await?;
        let options = respawn_options(&info);
        Self::spawn(cancel, options).map(|p| p as Arc<dyn Process>)
    }

    async fn register_trigger(
        &self,
        cancel: &CancelToken,
        trigger: Trigger,
    ) -> Result<(), ExecError> {
        if cancel.is_cancelled() {
            return Err(ExecError::Canceled);
        }
        let mut st = self.state.write().expect("process state lock poisoned");
        if st.info.is_some() {
            return Err(ExecError::Terminated);
        }
        st.triggers.push(trigger);
        Ok(())
    }

    fn tag(&self, tag: &str) {
        self.state
            .write()
            .expect("process state lock poisoned")
            .options
            .tag(tag);
    }

    fn reset_tags(&self) {
        self.state
            .write()
            .expect("process state lock poisoned")
            .options
            .reset_tags();
    }

    fn get_tags(&self) -> Vec<String> {
        self.state
            .read()
            .expect("process state lock poisoned")
            .options
            .tags
            .iter()
            .cloned()
            .collect()
    }
}
