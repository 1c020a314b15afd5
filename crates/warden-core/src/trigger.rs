// SPDX-License-Identifier: MIT OR Apache-2.0
//! Completion triggers: ordered callbacks run once with the terminal
//! snapshot.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

use crate::info::ProcessInfo;

/// Callback invoked with the terminal process snapshot.
///
/// Triggers must not fail; a panic is caught and isolated from sibling
/// triggers and from the reactor.
pub type Trigger = Box<dyn FnOnce(&ProcessInfo) + Send + Sync>;

/// Ordered list of [`Trigger`]s, each run exactly once.
#[derive(Default)]
pub struct TriggerSequence {
    triggers: Vec<Trigger>,
}

impl TriggerSequence {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trigger; it will run after every earlier registration.
    pub fn push(&mut self, trigger: Trigger) {
        self.triggers.push(trigger);
    }

    /// Number of registered triggers.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Whether no trigger is registered.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Move all registered triggers into a new sequence, leaving this one
    /// empty.
    ///
    /// Reactors take the sequence while holding their state lock and invoke
    /// it after releasing, so a trigger that calls back into the handle
    /// cannot deadlock.
    pub fn take(&mut self) -> TriggerSequence {
        TriggerSequence {
            triggers: std::mem::take(&mut self.triggers),
        }
    }

    /// Run every trigger in registration order with the given snapshot.
    ///
    /// A panicking trigger is logged and skipped; the rest still run.
    pub fn run(self, info: &ProcessInfo) {
        for trigger in self.triggers {
            if catch_unwind(AssertUnwindSafe(|| trigger(info))).is_err() {
                warn!(id = %info.id, "completion trigger panicked");
            }
        }
    }
}

impl fmt::Debug for TriggerSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerSequence")
            .field("len", &self.len())
            .finish()
    }
}

/// The default trigger installed by the process factory: drains the spawn
/// option's closers once the process has terminated.
pub fn options_closers_trigger() -> Trigger {
    Box::new(|info: &ProcessInfo| {
        for err in info.options.closers.drain() {
            warn!(id = %info.id, error = %err, "closer failed during process teardown");
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn snapshot() -> ProcessInfo {
        ProcessInfo {
            id: "t-1".into(),
            complete: true,
            ..ProcessInfo::default()
        }
    }

    #[test]
    fn triggers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut seq = TriggerSequence::new();
        for idx in 0..4 {
            let order = Arc::clone(&order);
            seq.push(Box::new(move |_| order.lock().unwrap().push(idx)));
        }
        seq.run(&snapshot());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn take_leaves_the_sequence_empty() {
        let mut seq = TriggerSequence::new();
        seq.push(Box::new(|_| {}));
        let taken = seq.take();
        assert_eq!(taken.len(), 1);
        assert!(seq.is_empty());
    }

    #[test]
    fn a_panicking_trigger_does_not_stop_siblings() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut seq = TriggerSequence::new();

        let first = Arc::clone(&order);
        seq.push(Box::new(move |_| first.lock().unwrap().push("first")));
        seq.push(Box::new(|_| panic!("trigger blew up")));
        let last = Arc::clone(&order);
        seq.push(Box::new(move |_| last.lock().unwrap().push("last")));

        seq.run(&snapshot());
        assert_eq!(*order.lock().unwrap(), vec!["first", "last"]);
    }

    #[test]
    fn closers_trigger_drains_the_option_set() {
        let ran = Arc::new(Mutex::new(false));
        let mut info = snapshot();
        let flag = Arc::clone(&ran);
        info.options.closers.push(Box::new(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        }));

        let mut seq = TriggerSequence::new();
        seq.push(options_closers_trigger());
        seq.run(&info);

        assert!(*ran.lock().unwrap());
        assert!(info.options.closers.is_empty());
    }
}
