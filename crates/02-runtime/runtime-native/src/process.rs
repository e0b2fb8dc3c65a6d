//! Spawning and supervising the engine process.
//!
//! The engine is started as `<engine> msgpack run --input <endpoint>` and
//! watched from a background thread that reaps it. An exit the host did not
//! ask for is turned into a [`BackendError::Process`] and handed to the
//! owning backend so it can reject whatever is still queued.

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use transport_fabric::{BackendError, BackendResult, LogSink};

const REAP_INTERVAL: Duration = Duration::from_millis(20);

/// Settings shared by the native backends.
#[derive(Clone)]
pub struct NativeOptions {
    pub engine_path: PathBuf,
    /// Passed to the engine as `HARDWARE_CONCURRENCY`.
    pub threads: Option<usize>,
    /// Where sockets and shared-memory files are created.
    pub endpoint_dir: Option<PathBuf>,
    /// Shared memory only.
    pub max_clients: u32,
    /// Shared memory only; each backend has its own default.
    pub ring_size: Option<u32>,
    /// When set, engine output goes to a log file instead of being discarded.
    pub logger: Option<LogSink>,
}

impl NativeOptions {
    pub fn new(engine_path: impl Into<PathBuf>) -> Self {
        Self {
            engine_path: engine_path.into(),
            threads: None,
            endpoint_dir: None,
            max_clients: 1,
            ring_size: None,
            logger: None,
        }
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn endpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.endpoint_dir = Some(dir.into());
        self
    }

    pub fn logger(mut self, logger: LogSink) -> Self {
        self.logger = Some(logger);
        self
    }

    pub(crate) fn log(&self, line: &str) {
        if let Some(logger) = &self.logger {
            logger(line);
        }
    }

    /// Log file for an endpoint named `name`, or `None` when output is discarded.
    pub(crate) fn log_file(&self, dir: &Path, name: &str) -> Option<PathBuf> {
        self.logger.as_ref()?;
        let path = dir.join(format!("{name}.log"));
        self.log(&format!("engine logs redirected to {}", path.display()));
        Some(path)
    }
}

impl fmt::Debug for NativeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeOptions")
            .field("engine_path", &self.engine_path)
            .field("threads", &self.threads)
            .field("endpoint_dir", &self.endpoint_dir)
            .field("max_clients", &self.max_clients)
            .field("ring_size", &self.ring_size)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// A fresh `bb-<pid>-<nanos>` endpoint name, unique within this process.
pub fn unique_name() -> String {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos() as u64);
    let mut prev = LAST.load(Ordering::Relaxed);
    let nanos = loop {
        let next = now.max(prev + 1);
        match LAST.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break next,
            Err(actual) => prev = actual,
        }
    };
    format!("bb-{}-{nanos}", std::process::id())
}

/// Directory for shared-memory files: `/dev/shm` when the host has one.
pub fn shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Command line for one engine process.
#[derive(Clone, Debug)]
pub struct EngineCommand {
    program: PathBuf,
    args: Vec<OsString>,
    threads: Option<usize>,
    log_file: Option<PathBuf>,
}

impl EngineCommand {
    /// `<program> msgpack run --input <input>`.
    pub fn msgpack_run(program: impl Into<PathBuf>, input: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: vec!["msgpack".into(), "run".into(), "--input".into(), input.into()],
            threads: None,
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }

    pub fn log_to(mut self, path: Option<PathBuf>) -> Self {
        self.log_file = path;
        self
    }

    fn build(&self) -> BackendResult<Command> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).stdin(Stdio::null());
        if let Some(threads) = self.threads {
            command.env("HARDWARE_CONCURRENCY", threads.to_string());
        }
        match &self.log_file {
            Some(path) => {
                let out = File::create(path).map_err(|err| {
                    BackendError::Process(format!(
                        "failed to open engine log {}: {err}",
                        path.display()
                    ))
                })?;
                let err = out.try_clone()?;
                command.stdout(out).stderr(err);
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }
        Ok(command)
    }
}

/// Why the engine went away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    Code(i32),
    Signal(i32),
    /// A clean exit, or one caused by the graceful-termination signal.
    Unexpected,
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) if code != 0 => ExitReason::Code(code),
            (_, Some(signal)) if signal != libc::SIGTERM => ExitReason::Signal(signal),
            _ => ExitReason::Unexpected,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ExitReason::Code(code) => format!("engine process exited with code {code}"),
            ExitReason::Signal(signal) => {
                format!("engine process killed with signal {}", signal_name(*signal))
            }
            ExitReason::Unexpected => "engine process exited unexpectedly".to_owned(),
        }
    }

    pub fn into_error(self) -> BackendError {
        BackendError::Process(self.message())
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

fn signal_name(signal: i32) -> String {
    let name = match signal {
        libc::SIGKILL => "SIGKILL",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGINT => "SIGINT",
        libc::SIGHUP => "SIGHUP",
        libc::SIGPIPE => "SIGPIPE",
        _ => return signal.to_string(),
    };
    name.to_owned()
}

struct Supervised {
    child: Mutex<Child>,
    exit: Mutex<Option<ExitReason>>,
    exited: Condvar,
    terminating: AtomicBool,
}

/// A running engine and the thread that reaps it.
///
/// Dropping the handle sends the graceful-termination signal.
pub struct EngineProcess {
    pid: u32,
    shared: Arc<Supervised>,
}

impl EngineProcess {
    /// Starts the engine. `on_exit` runs once, on the reaper thread, if the
    /// process ends before [`EngineProcess::terminate`] was called.
    pub fn spawn(
        command: &EngineCommand,
        on_exit: impl FnOnce(BackendError) + Send + 'static,
    ) -> BackendResult<Self> {
        if !command.program.is_file() {
            return Err(BackendError::unavailable(format!(
                "engine binary not found at {}",
                command.program.display()
            )));
        }
        let child = command.build()?.spawn().map_err(|err| {
            BackendError::Process(format!("failed to spawn engine process: {err}"))
        })?;
        let pid = child.id();
        let shared = Arc::new(Supervised {
            child: Mutex::new(child),
            exit: Mutex::new(None),
            exited: Condvar::new(),
            terminating: AtomicBool::new(false),
        });

        let reaper = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("engine-reaper-{pid}"))
            .spawn(move || reap(pid, &reaper, on_exit))?;
        info!(pid, program = %command.program.display(), "spawned engine process");
        Ok(Self { pid, shared })
    }

    pub fn id(&self) -> u32 {
        self.pid
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.shared.exit.lock()
    }

    /// Fails with the exit diagnostic once the engine is gone.
    pub fn ensure_running(&self) -> BackendResult<()> {
        match self.exit_reason() {
            Some(reason) => Err(reason.into_error()),
            None => Ok(()),
        }
    }

    /// Blocks until the engine exits or `timeout` passes.
    pub fn wait_exit(&self, timeout: Duration) -> Option<ExitReason> {
        let deadline = Instant::now() + timeout;
        let mut exit = self.shared.exit.lock();
        while exit.is_none() {
            if self.shared.exited.wait_until(&mut exit, deadline).timed_out() {
                break;
            }
        }
        *exit
    }

    /// Sends SIGTERM. Exit diagnostics are suppressed from here on.
    pub fn terminate(&self) {
        self.signal(libc::SIGTERM);
    }

    /// Sends SIGKILL.
    pub fn kill(&self) {
        self.signal(libc::SIGKILL);
    }

    fn signal(&self, signal: i32) {
        self.shared.terminating.store(true, Ordering::Release);
        // The reaper only reaps under this lock, so the pid still names our child.
        let _child = self.shared.child.lock();
        if self.shared.exit.lock().is_some() {
            return;
        }
        // SAFETY: plain syscall on a pid we own and have not reaped.
        if unsafe { libc::kill(self.pid as libc::pid_t, signal) } != 0 {
            debug!(pid = self.pid, signal, "engine already gone");
        }
    }

    /// Polls `attempt` every `interval` until it yields, the engine exits, or
    /// `timeout` passes.
    pub fn await_endpoint<T>(
        &self,
        what: &str,
        timeout: Duration,
        interval: Duration,
        mut attempt: impl FnMut() -> BackendResult<Option<T>>,
    ) -> BackendResult<T> {
        let started = Instant::now();
        loop {
            self.ensure_running()?;
            if let Some(value) = attempt()? {
                debug!(pid = self.pid, what, waited = ?started.elapsed(), "engine endpoint ready");
                return Ok(value);
            }
            if started.elapsed() >= timeout {
                self.ensure_running()?;
                return Err(BackendError::Timeout {
                    what: what.to_owned(),
                    waited: timeout,
                });
            }
            thread::sleep(interval);
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn reap(pid: u32, shared: &Supervised, on_exit: impl FnOnce(BackendError)) {
    let reason = loop {
        let mut child = shared.child.lock();
        let reason = match child.try_wait() {
            Ok(Some(status)) => ExitReason::from_status(status),
            Ok(None) => {
                drop(child);
                thread::sleep(REAP_INTERVAL);
                continue;
            }
            Err(err) => {
                warn!(pid, %err, "lost track of engine process");
                ExitReason::Unexpected
            }
        };
        // Recorded before the child lock is released so `signal` never
        // targets a reaped pid.
        *shared.exit.lock() = Some(reason);
        break reason;
    };
    shared.exited.notify_all();

    if shared.terminating.load(Ordering::Acquire) {
        debug!(pid, %reason, "engine process stopped");
        return;
    }
    warn!(pid, %reason, "engine process ended");
    on_exit(reason.into_error());
}
