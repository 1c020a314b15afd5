// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lock-guarded process handle.
//!
//! The reactor populates shared state as soon as the PID is known and again
//! at exit; external queries block on the `initialized` latch and then read
//! under the lock. Triggers are taken under the lock but invoked after it is
//! released, so a trigger that calls back into the handle cannot deadlock.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Child;
use tracing::debug;

use warden_core::{
    options_closers_trigger, CancelToken, ExecError, Latch, ProcessInfo, SpawnOptions, Trigger,
    TriggerSequence,
};

use super::{exit_code_of, prepare, pump_output, respawn_options, Process};

#[cfg(unix)]
use super::{signal_error, Signal};

struct SharedState {
    info: ProcessInfo,
    triggers: TriggerSequence,
}

/// Process handle whose state is guarded by a shared lock.
pub struct SharedProcess {
    id: String,
    state: Arc<RwLock<SharedState>>,
    initialized: Latch,
    wait_processed: Latch,
}

impl SharedProcess {
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

        let info = ProcessInfo {
            id: id.clone(),
            options,
            host,
            started_at: Some(Utc::now()),
            ..ProcessInfo::default()
        };

        let mut triggers = TriggerSequence::new();
        triggers.push(options_closers_trigger());

        let process = Arc::new(Self {
            id,
            state: Arc::new(RwLock::new(SharedState { info, triggers })),
            initialized: Latch::new(),
            wait_processed: Latch::new(),
        });

        tokio::spawn(reactor(
            Arc::clone(&process.state),
            process.initialized.clone(),
            process.wait_processed.clone(),
            cancel.clone(),
            child,
            pumps,
        ));

        Ok(process)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SharedState> {
        self.state.read().expect("process state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SharedState> {
        self.state.write().expect("process state lock poisoned")
    }

    async fn wait_initialized(&self, cancel: &CancelToken) -> Result<(), ExecError> {
        tokio::select! {
            biased;
            _ = self.initialized.wait() => Ok(()),
            _ = cancel.cancelled() => Err(ExecError::Canceled),
        }
    }
}

async fn reactor(
    state: Arc<RwLock<SharedState>>,
    initialized: Latch,
    wait_processed: Latch,
    cancel: CancelToken,
    mut child: Child,
    pumps: Vec<tokio::task::JoinHandle<()>>,
) {
    let pid = child.id().map(|pid| pid as i32).unwrap_or(0);
    {
        let mut st = state.write().expect("process state lock poisoned");
        st.info.pid = pid;
        st.info.is_running = pid > 0;
    }
    initialized.open();

    let status = tokio::select! {
        status = child.wait() => {
            // Let the output pumps reach EOF before the snapshot becomes
            // visible to waiters.
            for pump in pumps {
                let _ = pump.await;
            }
            status.ok()
        }
        _ = cancel.cancelled() => None,
    };

    let (snapshot, triggers) = {
        let mut st = state.write().expect("process state lock poisoned");
        st.info.is_running = false;
        st.info.complete = true;
        st.info.ended_at = Some(Utc::now());
        match status {
            Some(status) => {
                st.info.exit_code = exit_code_of(&status);
                st.info.successful = status.success();
            }
            None => {
                st.info.exit_code = -1;
                st.info.successful = false;
            }
        }
        (st.info.clone(), st.triggers.take())
    };

    debug!(
        id = %snapshot.id,
        cmd = %snapshot.options.args.join(" "),
        success = snapshot.successful,
        num_triggers = triggers.len(),
        "process reactor finished"
    );

    triggers.run(&snapshot);
    wait_processed.open();
}

#[async_trait]
impl Process for SharedProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn info(&self, cancel: &CancelToken) -> Result<ProcessInfo, ExecError> {
        self.wait_initialized(cancel).await?;
        Ok(self.read().info.clone())
    }

    async fn running(&self, cancel: &CancelToken) -> bool {
        if self.wait_initialized(cancel).await.is_err() {
            return false;
        }
        self.read().info.is_running
    }

    fn complete(&self) -> bool {
        self.read().info.complete
    }

    #[cfg(unix)]
    async fn signal(&self, cancel: &CancelToken, signal: Signal) -> Result<(), ExecError> {
        self.wait_initialized(cancel).await?;
        let pid = {
            let st = self.read();
            if st.info.complete {
                return Err(ExecError::Terminated);
            }
            st.info.pid
        };
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal)
            .map_err(|errno| signal_error(&self.id, errno))
    }

    async fn wait(&self, cancel: &CancelToken) -> Result<i32, ExecError> {
        {
            let st = self.read();
            if st.info.complete {
                return st.info.wait_result();
            }
        }

        tokio::select! {
            biased;
            _ = self.wait_processed.wait() => {}
            _ = cancel.cancelled() => return Err(ExecError::Canceled),
        }

        self.read().info.wait_result()
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
        let mut st = self.write();
        if st.info.complete {
            return Err(ExecError::Terminated);
        }
        st.triggers.push(trigger);
        Ok(())
    }

    fn tag(&self, tag: &str) {
        self.write().info.options.tag(tag);
    }

    fn reset_tags(&self) {
        self.write().info.options.reset_tags();
    }

    fn get_tags(&self) -> Vec<String> {
        self.read().info.options.tags.iter().cloned().collect()
    }
}
