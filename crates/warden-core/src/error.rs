// SPDX-License-Identifier: MIT OR Apache-2.0
//! Error taxonomy for spawn resolution, process supervision, and command runs.

use std::fmt;

use thiserror::Error;

/// Errors surfaced by spawn-option resolution, process handles, and the
/// command composer.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The argument vector was empty.
    #[error("args invalid")]
    InvalidArgs,

    /// A command string could not be split with POSIX shell rules.
    #[error("problem splitting command string: {0}")]
    Parse(#[from] shell_words::ParseError),

    /// The OS refused to start the child process.
    #[error("problem starting process: {0}")]
    Start(#[source] std::io::Error),

    /// The operation is not valid once the process has terminated.
    #[error("process has already terminated")]
    Terminated,

    /// The governing cancel token fired before the operation finished.
    #[error("operation canceled")]
    Canceled,

    /// The child exited with a non-zero status, or was killed by a signal
    /// (in which case `code` is the signal number).
    #[error("exit status {code}")]
    ChildExit {
        /// Exit status, or the signal number when signal-killed.
        code: i32,
    },

    /// Delivering a signal to the child failed at the OS level.
    #[error("problem sending signal to '{id}': {source}")]
    Signal {
        /// Id of the process the signal was aimed at.
        id: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An output sink or closer failed during teardown.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Several errors collected from one command batch.
    #[error("{0}")]
    Batch(ErrorBundle),
}

// ---------------------------------------------------------------------------
// ErrorBundle
// ---------------------------------------------------------------------------

/// Ordered collector of errors from a multi-step operation.
///
/// Collect with [`push`](ErrorBundle::push), then finish with
/// [`into_result`](ErrorBundle::into_result): an empty bundle resolves to
/// `Ok(())`, a single entry resolves to that error unchanged, and anything
/// larger resolves to [`ExecError::Batch`].
#[derive(Debug, Default)]
pub struct ErrorBundle {
    errors: Vec<ExecError>,
}

impl ErrorBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error.
    pub fn push(&mut self, err: ExecError) {
        self.errors.push(err);
    }

    /// Record the error half of a result, discarding the success value.
    pub fn record<T>(&mut self, res: Result<T, ExecError>) {
        if let Err(err) = res {
            self.push(err);
        }
    }

    /// Number of errors collected so far.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no error has been collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Resolve the bundle into a single result.
    pub fn into_result(mut self) -> Result<(), ExecError> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(ExecError::Batch(self)),
        }
    }
}

impl fmt::Display for ErrorBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for err in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
            first = false;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_args_display_is_stable() {
        assert_eq!(ExecError::InvalidArgs.to_string(), "args invalid");
    }

    #[test]
    fn child_exit_display_carries_code() {
        let err = ExecError::ChildExit { code: 2 };
        assert_eq!(err.to_string(), "exit status 2");
    }

    #[test]
    fn empty_bundle_resolves_ok() {
        assert!(ErrorBundle::new().into_result().is_ok());
    }

    #[test]
    fn single_entry_bundle_resolves_to_that_error() {
        let mut bundle = ErrorBundle::new();
        bundle.push(ExecError::InvalidArgs);
        let err = bundle.into_result().unwrap_err();
        assert_eq!(err.to_string(), "args invalid");
        assert!(matches!(err, ExecError::InvalidArgs));
    }

    #[test]
    fn larger_bundle_joins_messages() {
        let mut bundle = ErrorBundle::new();
        bundle.push(ExecError::InvalidArgs);
        bundle.push(ExecError::ChildExit { code: 1 });
        let err = bundle.into_result().unwrap_err();
        assert_eq!(err.to_string(), "args invalid; exit status 1");
        assert_eq!(
            match &err {
                ExecError::Batch(b) => b.len(),
                _ => 0,
            },
            2
        );
    }

    #[test]
    fn record_keeps_only_errors() {
        let mut bundle = ErrorBundle::new();
        bundle.record::<()>(Ok(()));
        bundle.record::<()>(Err(ExecError::Terminated));
        assert_eq!(bundle.len(), 1);
    }
}
