// SPDX-License-Identifier: MIT OR Apache-2.0
//! Spawn options: the description of one process invocation and its
//! resolution into an OS-level launch descriptor.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::ExecError;
use crate::sink::{ByteSink, CloserSet};

/// Environment variable injected into every supervised child, carrying the
/// process id assigned by the factory.
pub const ENVIRON_ID: &str = "WARDEN_ID";

/// Description of a single process invocation.
///
/// A command composer clones one of these per argv batch; the process
/// factory then consumes the clone, after which it is frozen for that
/// invocation. Mutating the originating copy does not affect a running
/// process.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// Argument vector; the first element is the program.
    pub args: Vec<String>,
    /// Working directory for the child, when set.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables, applied on top of the inherited
    /// environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// When set, the invocation is wrapped as `ssh <host> "<command>"`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_host: Option<String>,
    /// Free-form labels mirrored onto the process handle.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Destination for child stdout, when captured.
    #[serde(skip)]
    pub stdout: Option<ByteSink>,
    /// Destination for child stderr, when captured.
    #[serde(skip)]
    pub stderr: Option<ByteSink>,
    /// Disposers run once after the process terminates.
    #[serde(skip)]
    pub closers: CloserSet,
    /// Set by the factory once it has consumed this option.
    #[serde(default)]
    pub started: bool,
}

impl SpawnOptions {
    /// Create options for the given argument vector.
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set or replace one environment variable.
    pub fn add_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    /// Add a tag. Tags have set semantics; re-adding is a no-op.
    pub fn tag(&mut self, tag: impl Into<String>) {
        self.tags.insert(tag.into());
    }

    /// Remove all tags.
    pub fn reset_tags(&mut self) {
        self.tags.clear();
    }

    /// Replace the closer list with a fresh, empty one.
    ///
    /// Used by respawn so a fresh handle does not re-run the original
    /// invocation's disposers.
    pub fn reset_closers(&mut self) {
        self.closers = CloserSet::new();
    }

    /// Normalize the argument vector in place.
    ///
    /// Fails with [`ExecError::InvalidArgs`] when the vector is empty. A
    /// one-element vector whose only entry contains whitespace or a quote
    /// character is treated as a whole command line and split with POSIX
    /// shell rules.
    pub fn expand_args(&mut self) -> Result<(), ExecError> {
        match self.args.len() {
            0 => Err(ExecError::InvalidArgs),
            1 => {
                if needs_lexing(&self.args[0]) {
                    let split = shell_words::split(&self.args[0])?;
                    if split.is_empty() {
                        return Err(ExecError::InvalidArgs);
                    }
                    self.args = split;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Rewrite these options in place as a remote shell invocation.
    ///
    /// The argument vector becomes `["ssh", host, command]`, with the
    /// working directory folded into the command string as a `cd` prefix.
    /// Both the host and the directory are cleared afterwards, so resolving
    /// the rewritten options spawns the `ssh` client locally. A no-op when
    /// no host is set.
    pub fn wrap_remote(&mut self) -> Result<(), ExecError> {
        if self.args.is_empty() {
            return Err(ExecError::InvalidArgs);
        }
        if let Some(host) = self.remote_host.take() {
            self.args = remote_args(&host, &self.args, self.working_dir.take().as_deref());
        }
        Ok(())
    }

    /// Resolve these options into a launch descriptor.
    ///
    /// Normalizes the argument vector (remote wrapping when a host is set,
    /// shell-lex expansion otherwise) and materializes working directory,
    /// environment, and output pipes. Call [`add_env`](Self::add_env) with
    /// [`ENVIRON_ID`] first so the child can identify itself.
    pub fn resolve(&self) -> Result<Command, ExecError> {
        let mut normalized = self.clone();
        if normalized.remote_host.is_some() {
            normalized.wrap_remote()?;
        } else {
            normalized.expand_args()?;
        }

        let mut command = Command::new(&normalized.args[0]);
        command.args(&normalized.args[1..]);

        if let Some(dir) = &normalized.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &normalized.env {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        command.stdout(pipe_or_null(self.stdout.is_some()));
        command.stderr(pipe_or_null(self.stderr.is_some()));
        command.kill_on_drop(false);

        Ok(command)
    }
}

fn pipe_or_null(captured: bool) -> Stdio {
    if captured {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

fn needs_lexing(arg: &str) -> bool {
    arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'')
}

/// Rewrite an argument vector as a remote shell invocation.
///
/// The elements are joined with single spaces and are not re-quoted, so
/// arguments containing shell metacharacters are unsafe to wrap.
fn remote_args(host: &str, args: &[String], dir: Option<&std::path::Path>) -> Vec<String> {
    let mut command = String::new();
    if let Some(dir) = dir {
        command.push_str(&format!("cd {} && ", dir.display()));
    }
    command.push_str(&args.join(" "));
    vec!["ssh".to_string(), host.to_string(), command]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_are_invalid() {
        let mut opts = SpawnOptions::default();
        assert!(matches!(opts.expand_args(), Err(ExecError::InvalidArgs)));
        assert!(SpawnOptions::default().resolve().is_err());
    }

    #[test]
    fn plain_vectors_pass_through() {
        let mut opts = SpawnOptions::new(["echo", "hello world"]);
        opts.expand_args().unwrap();
        assert_eq!(opts.args, vec!["echo", "hello world"]);
    }

    #[test]
    fn single_string_with_whitespace_is_lexed() {
        let mut opts = SpawnOptions::new(["echo hello world"]);
        opts.expand_args().unwrap();
        assert_eq!(opts.args, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn single_string_with_quotes_is_lexed() {
        let mut opts = SpawnOptions::new([r#"echo "hello world""#]);
        opts.expand_args().unwrap();
        assert_eq!(opts.args, vec!["echo", "hello world"]);
    }

    #[test]
    fn bare_single_token_is_left_alone() {
        let mut opts = SpawnOptions::new(["true"]);
        opts.expand_args().unwrap();
        assert_eq!(opts.args, vec!["true"]);
    }

    #[test]
    fn unbalanced_quote_is_a_parse_error() {
        let mut opts = SpawnOptions::new(["echo 'oops"]);
        assert!(matches!(opts.expand_args(), Err(ExecError::Parse(_))));
    }

    #[test]
    fn blank_single_string_is_invalid() {
        let mut opts = SpawnOptions::new([" "]);
        assert!(matches!(opts.expand_args(), Err(ExecError::InvalidArgs)));
    }

    #[test]
    fn remote_wrapping_without_dir() {
        let args = vec!["echo".to_string(), "hi".to_string()];
        let wrapped = remote_args("worker-1", &args, None);
        assert_eq!(wrapped, vec!["ssh", "worker-1", "echo hi"]);
    }

    #[test]
    fn remote_wrapping_prefixes_dir_change() {
        let args = vec!["make".to_string(), "test".to_string()];
        let wrapped = remote_args("worker-1", &args, Some(std::path::Path::new("/srv/app")));
        assert_eq!(wrapped, vec!["ssh", "worker-1", "cd /srv/app && make test"]);
    }

    #[test]
    fn wrap_remote_rewrites_in_place() {
        let mut opts = SpawnOptions::new(["echo", "hi"]);
        opts.remote_host = Some("worker-1".to_string());
        opts.working_dir = Some(PathBuf::from("/srv/app"));
        opts.wrap_remote().unwrap();
        assert_eq!(opts.args, vec!["ssh", "worker-1", "cd /srv/app && echo hi"]);
        assert!(opts.remote_host.is_none());
        assert!(opts.working_dir.is_none());

        // Already wrapped: a second pass changes nothing.
        opts.wrap_remote().unwrap();
        assert_eq!(opts.args.len(), 3);
    }

    #[test]
    fn wrap_remote_rejects_empty_args() {
        let mut opts = SpawnOptions::default();
        opts.remote_host = Some("worker-1".to_string());
        assert!(matches!(opts.wrap_remote(), Err(ExecError::InvalidArgs)));
    }

    #[test]
    fn resolve_wraps_remote_invocations() {
        let mut opts = SpawnOptions::new(["echo", "hi"]);
        opts.remote_host = Some("worker-1".to_string());
        opts.working_dir = Some(PathBuf::from("/srv/app"));

        let command = opts.resolve().unwrap();
        let std_cmd = command.as_std();
        assert_eq!(std_cmd.get_program(), std::ffi::OsStr::new("ssh"));
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["worker-1", "cd /srv/app && echo hi"]);
        // The directory lives inside the wrapped command string, not the
        // local spawn.
        assert!(std_cmd.get_current_dir().is_none());
    }

    #[test]
    fn env_entries_accumulate() {
        let mut opts = SpawnOptions::new(["true"]);
        opts.add_env("A", "1");
        opts.add_env("A", "2");
        opts.add_env(ENVIRON_ID, "some-id");
        assert_eq!(opts.env.get("A").map(String::as_str), Some("2"));
        assert_eq!(opts.env.get(ENVIRON_ID).map(String::as_str), Some("some-id"));
    }

    #[test]
    fn tags_have_set_semantics() {
        let mut opts = SpawnOptions::new(["true"]);
        opts.tag("a");
        opts.tag("a");
        opts.tag("b");
        assert_eq!(opts.tags.len(), 2);
        opts.reset_tags();
        assert!(opts.tags.is_empty());
    }

    #[test]
    fn reset_closers_detaches_the_shared_list() {
        let mut opts = SpawnOptions::new(["true"]);
        opts.closers.push(Box::new(|| Ok(())));
        let mut clone = opts.clone();
        clone.reset_closers();
        assert_eq!(opts.closers.len(), 1);
        assert!(clone.closers.is_empty());
    }

    #[test]
    fn serde_skips_runtime_fields() {
        let mut opts = SpawnOptions::new(["echo", "hi"]);
        opts.working_dir = Some(PathBuf::from("/tmp"));
        opts.add_env("K", "V");
        opts.tag("batch");
        opts.stdout = Some(crate::sink::CaptureSink::new().sink());
        opts.closers.push(Box::new(|| Ok(())));

        let json = serde_json::to_string(&opts).unwrap();
        let back: SpawnOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.args, opts.args);
        assert_eq!(back.working_dir, opts.working_dir);
        assert_eq!(back.env, opts.env);
        assert_eq!(back.tags, opts.tags);
        assert!(back.stdout.is_none());
        assert!(back.closers.is_empty());
    }
}
