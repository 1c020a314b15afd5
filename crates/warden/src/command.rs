// SPDX-License-Identifier: MIT OR Apache-2.0
//! Command composer: accumulate argv batches, expand them into spawn
//! options, and run them sequentially or in parallel under an error policy.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use futures::future::join_all;
use tracing::{debug, warn, Level};

use warden_core::{
    ByteSink, CancelToken, CaptureSink, ErrorBundle, ExecError, LogWriter, SpawnOptions,
};

use crate::process::{self, ReactorKind};

/// Predicate consulted before a run; a `false` result short-circuits the run
/// to success.
pub type Precondition = Box<dyn Fn() -> bool + Send + Sync>;

/// Builder and runner for a batch of process invocations.
///
/// Accumulate argument vectors with [`add`](Command::add) /
/// [`extend`](Command::extend) / [`append_string`](Command::append_string),
/// configure the shared spawn state and error policy, then consume the
/// command with [`run`](Command::run) or [`run_parallel`](Command::run_parallel).
pub struct Command {
    batches: Vec<Vec<String>>,
    opts: SpawnOptions,
    id: String,
    priority: Level,
    kind: ReactorKind,
    continue_on_error: bool,
    stop_on_error: bool,
    ignore_error: bool,
    precondition: Option<Precondition>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            batches: Vec::new(),
            opts: SpawnOptions::default(),
            id: String::new(),
            priority: Level::DEBUG,
            kind: ReactorKind::default(),
            continue_on_error: false,
            stop_on_error: false,
            ignore_error: false,
            precondition: None,
        }
    }
}

impl Command {
    /// Create an empty command.
    pub fn new() -> Self {
        Self::default()
    }

    // -- batch accumulation -------------------------------------------------

    /// Append one argument vector.
    pub fn add<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.batches
            .push(args.into_iter().map(Into::into).collect());
        self
    }

    /// Append several argument vectors.
    pub fn extend<I, A, S>(mut self, batches: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for args in batches {
            self = self.add(args);
        }
        self
    }

    /// Split a whole command line with POSIX shell rules and append it.
    ///
    /// A string that fails to lex is dropped with a logged warning; the
    /// command itself stays runnable.
    pub fn append_string(mut self, command: &str) -> Self {
        match shell_words::split(command) {
            Ok(args) => self.batches.push(args),
            Err(err) => {
                warn!(input = command, error = %err, "dropping unparseable command string");
            }
        }
        self
    }

    // -- shared spawn state -------------------------------------------------

    /// Working directory for every batch.
    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.opts.working_dir = Some(dir.into());
        self
    }

    /// Remote host; when set every batch is wrapped as an `ssh` invocation.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.opts.remote_host = Some(host.into());
        self
    }

    /// Replace the environment map.
    pub fn environment(mut self, env: BTreeMap<String, String>) -> Self {
        self.opts.env = env;
        self
    }

    /// Set one environment variable.
    pub fn add_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.opts.add_env(key, value);
        self
    }

    /// Add a tag propagated to every spawned process.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.opts.tag(tag);
        self
    }

    /// Identifier included in every per-invocation log record.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Level the per-invocation log records are emitted at.
    pub fn priority(mut self, level: Level) -> Self {
        self.priority = level;
        self
    }

    /// Reactor flavor used for the spawned processes.
    pub fn reactor(mut self, kind: ReactorKind) -> Self {
        self.kind = kind;
        self
    }

    // -- error policy -------------------------------------------------------

    /// Keep executing later batches after a failure (sequential mode).
    pub fn continue_on_error(mut self, cont: bool) -> Self {
        self.continue_on_error = cont;
        self
    }

    /// Stop at the first failure (sequential mode).
    pub fn stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Exclude per-batch failures from the aggregated result. They are
    /// still logged.
    pub fn ignore_error(mut self, ignore: bool) -> Self {
        self.ignore_error = ignore;
        self
    }

    /// Predicate consulted at the top of a run; `false` short-circuits to
    /// success without spawning anything.
    pub fn precondition(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.precondition = Some(Box::new(check));
        self
    }

    // -- output plumbing ----------------------------------------------------

    /// Bind child stdout to a sink; its flush is registered as a closer.
    pub fn output_writer(mut self, sink: ByteSink) -> Self {
        self.push_flush_closer(&sink);
        self.opts.stdout = Some(sink);
        self
    }

    /// Bind child stderr to a sink; its flush is registered as a closer.
    pub fn error_writer(mut self, sink: ByteSink) -> Self {
        self.push_flush_closer(&sink);
        self.opts.stderr = Some(sink);
        self
    }

    /// Bind both child streams to one sink; its flush is registered as a
    /// closer.
    pub fn combined_writer(mut self, sink: ByteSink) -> Self {
        self.push_flush_closer(&sink);
        self.opts.stdout = Some(sink.clone());
        self.opts.stderr = Some(sink);
        self
    }

    /// Forward child stdout lines to `tracing` events at `level`.
    pub fn output_log(self, level: Level) -> Self {
        let sink = ByteSink::new(LogWriter::new(level, "out"));
        self.output_writer(sink)
    }

    /// Forward child stderr lines to `tracing` events at `level`.
    pub fn error_log(self, level: Level) -> Self {
        let sink = ByteSink::new(LogWriter::new(level, "err"));
        self.error_writer(sink)
    }

    /// Forward both child streams to `tracing` events at `level`.
    pub fn combined_log(self, level: Level) -> Self {
        let sink = ByteSink::new(LogWriter::new(level, "output"));
        self.combined_writer(sink)
    }

    fn push_flush_closer(&mut self, sink: &ByteSink) {
        let sink = sink.clone();
        self.opts.closers.push(Box::new(move || sink.flush()));
    }

    // -- execution ----------------------------------------------------------

    /// Run every batch in order.
    ///
    /// Expansion errors abort the run before anything is spawned. The N-th
    /// process is fully terminated, its triggers fired and its log record
    /// emitted, before the (N+1)-th starts. The aggregated error reflects
    /// the configured continue/stop/ignore policy; closers run exactly once
    /// on the way out.
    pub async fn run(mut self, cancel: &CancelToken) -> Result<(), ExecError> {
        if !self.check_precondition() {
            return Ok(());
        }
        self.finalize_writers();

        let mut bundle = ErrorBundle::new();
        match self.expand() {
            Err(err) => bundle.push(err),
            Ok(specs) => {
                let len = specs.len();
                for (idx, spec) in specs.into_iter().enumerate() {
                    if cancel.is_cancelled() {
                        bundle.push(ExecError::Canceled);
                        break;
                    }

                    let err = self.exec(cancel, spec, idx, len).await.err();
                    let failed = err.is_some();
                    if !self.ignore_error {
                        if let Some(err) = err {
                            bundle.push(err);
                        }
                    }

                    if self.continue_on_error {
                        continue;
                    }
                    if failed && self.stop_on_error {
                        break;
                    }
                }
            }
        }

        self.close(&mut bundle);
        bundle.into_result()
    }

    /// Run every batch concurrently.
    ///
    /// All batches are expanded up front and all processes started before
    /// any is awaited. `continue_on_error` and `stop_on_error` do not apply
    /// here; `ignore_error` still excludes individual failures from the
    /// aggregate.
    pub async fn run_parallel(mut self, cancel: &CancelToken) -> Result<(), ExecError> {
        if !self.check_precondition() {
            return Ok(());
        }
        self.finalize_writers();

        let mut bundle = ErrorBundle::new();
        match self.expand() {
            Err(err) => bundle.push(err),
            Ok(specs) => {
                let len = specs.len();
                let runs = specs
                    .into_iter()
                    .enumerate()
                    .map(|(idx, spec)| self.exec(cancel, spec, idx, len));
                for result in join_all(runs).await {
                    if !self.ignore_error {
                        bundle.record(result);
                    }
                }
            }
        }

        self.close(&mut bundle);
        bundle.into_result()
    }

    fn check_precondition(&self) -> bool {
        match &self.precondition {
            Some(check) if !check() => {
                debug!(id = %self.id, cmd = %self, "noop after precondition returned false");
                false
            }
            _ => true,
        }
    }

    /// When only one of the two streams has a sink, alias the other to it.
    fn finalize_writers(&mut self) {
        match (&self.opts.stdout, &self.opts.stderr) {
            (Some(out), None) => self.opts.stderr = Some(out.clone()),
            (None, Some(err)) => self.opts.stdout = Some(err.clone()),
            _ => {}
        }
    }

    /// Expand every batch into a spawn option, collecting per-batch errors.
    ///
    /// Remote batches are ssh-wrapped here, so the expanded argument vector
    /// is exactly what executes and what the log record reports. A remote
    /// batch's single string is wrapped verbatim, never shell-lexed.
    fn expand(&self) -> Result<Vec<SpawnOptions>, ExecError> {
        let mut bundle = ErrorBundle::new();
        let mut specs = Vec::new();
        for args in &self.batches {
            let mut spec = SpawnOptions::new(args.clone());
            spec.working_dir = self.opts.working_dir.clone();
            spec.env = self.opts.env.clone();
            spec.remote_host = self.opts.remote_host.clone();
            spec.tags = self.opts.tags.clone();
            spec.stdout = self.opts.stdout.clone();
            spec.stderr = self.opts.stderr.clone();
            let prepared = if spec.remote_host.is_some() {
                spec.wrap_remote()
            } else {
                spec.expand_args()
            };
            match prepared {
                Ok(()) => specs.push(spec),
                Err(err) => bundle.push(err),
            }
        }
        bundle.into_result()?;
        Ok(specs)
    }

    /// Spawn one expanded batch, wait for it, and emit its log record.
    async fn exec(
        &self,
        cancel: &CancelToken,
        mut spec: SpawnOptions,
        idx: usize,
        len: usize,
    ) -> Result<(), ExecError> {
        let cmd_line = spec.args.join(" ");

        // Without caller-supplied sinks, capture both streams into a
        // per-process buffer surfaced through the log record.
        let capture = match spec.stdout {
            None => {
                let capture = CaptureSink::new();
                spec.stdout = Some(capture.sink());
                spec.stderr = Some(capture.sink());
                Some(capture)
            }
            Some(_) => None,
        };

        let result = match process::create(self.kind, cancel, spec) {
            Ok(process) => process.wait(cancel).await.map(|_| ()),
            Err(err) => Err(err),
        };

        let err_text = result
            .as_ref()
            .err()
            .map(ToString::to_string)
            .unwrap_or_default();
        let out_text = capture
            .as_ref()
            .map(|c| format_log_output(&c.to_string_lossy()))
            .unwrap_or_default();
        log_record(
            self.priority,
            &self.id,
            &cmd_line,
            idx,
            len,
            &out_text,
            &err_text,
        );

        result
    }

    /// Drain the command-level closers, folding their failures into the
    /// aggregate.
    fn close(&self, bundle: &mut ErrorBundle) {
        for err in self.opts.closers.drain() {
            bundle.push(ExecError::Io(err));
        }
    }

    fn render_batches(&self) -> String {
        let env = self
            .opts
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.batches
            .iter()
            .map(|args| format!("{} '{}';\n", env, args.join(" ")))
            .collect()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id='{}', cmd='{}'", self.id, self.render_batches())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("batches", &self.batches)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("continue_on_error", &self.continue_on_error)
            .field("stop_on_error", &self.stop_on_error)
            .field("ignore_error", &self.ignore_error)
            .finish_non_exhaustive()
    }
}

/// Emit the per-invocation record at a runtime-chosen level.
fn log_record(level: Level, id: &str, cmd: &str, idx: usize, len: usize, out: &str, err: &str) {
    if level == Level::ERROR {
        tracing::error!(id, cmd, idx, len, out, err, "command batch entry finished");
    } else if level == Level::WARN {
        tracing::warn!(id, cmd, idx, len, out, err, "command batch entry finished");
    } else if level == Level::INFO {
        tracing::info!(id, cmd, idx, len, out, err, "command batch entry finished");
    } else if level == Level::DEBUG {
        tracing::debug!(id, cmd, idx, len, out, err, "command batch entry finished");
    } else {
        tracing::trace!(id, cmd, idx, len, out, err, "command batch entry finished");
    }
}

/// Indent captured output for a one-line-per-record log field.
fn format_log_output(out: &str) -> String {
    out.trim_end_matches('\n').replace('\n', "\n\t out -> ")
}

// ---------------------------------------------------------------------------
// Convenience runners
// ---------------------------------------------------------------------------

/// Run a single argument vector and wait for it.
pub async fn run_command(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new()
        .id(id)
        .priority(priority)
        .add(args)
        .environment(env);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

/// Run a single argument vector on a remote host over ssh.
pub async fn run_remote_command(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    host: impl Into<String>,
    args: Vec<String>,
    dir: Option<PathBuf>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new().id(id).priority(priority).host(host).add(args);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

/// Run a group of argument vectors in order, stopping policy-free.
pub async fn run_command_group(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    batches: Vec<Vec<String>>,
    dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new()
        .id(id)
        .priority(priority)
        .extend(batches)
        .environment(env);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

/// Run a group of argument vectors in order, continuing past failures.
pub async fn run_command_group_continue_on_error(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    batches: Vec<Vec<String>>,
    dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new()
        .id(id)
        .priority(priority)
        .extend(batches)
        .environment(env)
        .continue_on_error(true);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

/// Run a group of argument vectors on a remote host over ssh.
pub async fn run_remote_command_group(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    host: impl Into<String>,
    batches: Vec<Vec<String>>,
    dir: Option<PathBuf>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new()
        .id(id)
        .priority(priority)
        .host(host)
        .extend(batches);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

/// Run a group of argument vectors on a remote host, continuing past
/// failures.
pub async fn run_remote_command_group_continue_on_error(
    cancel: &CancelToken,
    id: impl Into<String>,
    priority: Level,
    host: impl Into<String>,
    batches: Vec<Vec<String>>,
    dir: Option<PathBuf>,
) -> Result<(), ExecError> {
    let mut cmd = Command::new()
        .id(id)
        .priority(priority)
        .host(host)
        .extend(batches)
        .continue_on_error(true);
    if let Some(dir) = dir {
        cmd = cmd.directory(dir);
    }
    cmd.run(cancel).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_log_output_indents_inner_lines() {
        assert_eq!(format_log_output("one\ntwo\n"), "one\n\t out -> two");
        assert_eq!(format_log_output("single"), "single");
        assert_eq!(format_log_output(""), "");
    }

    #[test]
    fn finalize_writers_aliases_the_missing_stream() {
        let capture = CaptureSink::new();

        let mut cmd = Command::new().output_writer(capture.sink());
        cmd.finalize_writers();
        assert!(cmd.opts.stdout.is_some());
        assert!(cmd.opts.stderr.is_some());

        let mut cmd = Command::new().error_writer(capture.sink());
        cmd.finalize_writers();
        assert!(cmd.opts.stdout.is_some());

        let mut cmd = Command::new();
        cmd.finalize_writers();
        assert!(cmd.opts.stdout.is_none());
        assert!(cmd.opts.stderr.is_none());
    }

    #[test]
    fn expand_collects_invalid_batches() {
        let cmd = Command::new()
            .add(["echo", "ok"])
            .add(Vec::<String>::new())
            .add(["echo 'unterminated"]);
        let err = cmd.expand().unwrap_err();
        let text = err.to_string();
        assert!(text.contains("args invalid"), "got: {text}");
    }

    #[test]
    fn expand_applies_shared_state() {
        let cmd = Command::new()
            .add(["echo", "hi"])
            .directory("/tmp")
            .add_env("K", "V")
            .tag("batch");
        let specs = cmd.expand().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
        assert_eq!(specs[0].env.get("K").map(String::as_str), Some("V"));
        assert!(specs[0].tags.contains("batch"));
    }

    #[test]
    fn expand_wraps_remote_batches() {
        let cmd = Command::new()
            .host("worker-1")
            .directory("/srv/app")
            .add(["echo", "hi"]);
        let specs = cmd.expand().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].args, ["ssh", "worker-1", "cd /srv/app && echo hi"]);
        assert!(specs[0].remote_host.is_none());
        assert!(specs[0].working_dir.is_none());
    }

    #[test]
    fn append_string_drops_unparseable_input() {
        let cmd = Command::new()
            .append_string("echo hello")
            .append_string("echo 'broken");
        assert_eq!(cmd.batches.len(), 1);
        assert_eq!(cmd.batches[0], ["echo", "hello"]);
    }

    #[test]
    fn display_renders_id_and_batches() {
        let cmd = Command::new()
            .id("my-batch")
            .add(["echo", "hi"])
            .add_env("K", "V");
        let rendered = cmd.to_string();
        assert!(rendered.contains("id='my-batch'"));
        assert!(rendered.contains("K=V 'echo hi';"));
    }
}
