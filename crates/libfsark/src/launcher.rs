//! Runs a bundle through the low-level runtime and relays its standard
//! streams.
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::bundle::Bundle;

/// Overrides the configured runtime.
pub const RUNTIME_ENV: &str = "FSARK_RUNTIME";
/// Exit code reported for failures of the launcher itself.
pub const INTERNAL_FAILURE: i32 = 1;
const RELAY_BUFFER_SIZE: usize = 1024;
/// Signals passed on to the runtime instead of terminating the launcher, so
/// the bundle is still removed when the container is interrupted.
const FORWARDED_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

// signal handlers are process wide, so only one container runs at a time
static RUNNING: Mutex<()> = Mutex::new(());
static CHILD_PID: AtomicI32 = AtomicI32::new(0);
static CAUGHT_SIGNAL: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("container runtime {runtime:?} not found")]
    RuntimeNotFound {
        runtime: String,
        source: which::Error,
    },
    #[error("failed to start {runtime:?}")]
    Spawn { runtime: PathBuf, source: io::Error },
    #[error("{runtime:?} was started without a {stream} pipe")]
    MissingPipe {
        runtime: PathBuf,
        stream: &'static str,
    },
    #[error("failed to start the {stream} relay")]
    RelayThread {
        stream: &'static str,
        source: io::Error,
    },
    #[error("failed to wait for {runtime:?}")]
    Wait { runtime: PathBuf, source: io::Error },
    #[error("failed to install a handler for {signal}")]
    SignalHandler { signal: Signal, source: nix::Error },
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to read from source")]
    Read(#[source] io::Error),
    #[error("failed to write to destination")]
    Write(#[source] io::Error),
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Copies `reader` into `writer` chunk by chunk until end of stream, flushing
/// after every chunk. A chunk that is not written in one piece is an error.
/// Returns the number of bytes relayed.
pub fn relay<R: Read, W: Write>(mut reader: R, mut writer: W) -> Result<u64, RelayError> {
    let mut buffer = [0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let count = match reader.read(&mut buffer) {
            Ok(0) => return Ok(total),
            Ok(count) => count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(RelayError::Read(err)),
        };
        let written = writer
            .write(&buffer[..count])
            .map_err(RelayError::Write)?;
        if written != count {
            return Err(RelayError::ShortWrite {
                written,
                expected: count,
            });
        }
        writer.flush().map_err(RelayError::Write)?;
        total += count as u64;
    }
}

/// Maps a runtime exit status onto the launcher's own exit code. A child
/// killed by a signal reports `128 + signal`, as shells do.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => INTERNAL_FAILURE,
    }
}

extern "C" fn forward_signal(signal: nix::libc::c_int) {
    CAUGHT_SIGNAL.store(signal, Ordering::SeqCst);
    let pid = CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe
        unsafe {
            nix::libc::kill(pid, signal);
        }
    }
}

/// Forwards [`FORWARDED_SIGNALS`] to the attached child while alive and
/// restores the previous dispositions on drop.
struct SignalForwarding {
    previous: Vec<(Signal, SigAction)>,
}

impl SignalForwarding {
    fn install() -> Result<Self, LaunchError> {
        CHILD_PID.store(0, Ordering::SeqCst);
        CAUGHT_SIGNAL.store(0, Ordering::SeqCst);
        // SA_RESTART keeps the relays' blocking reads and writes going
        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let mut forwarding = Self {
            previous: Vec::with_capacity(FORWARDED_SIGNALS.len()),
        };
        for signal in FORWARDED_SIGNALS {
            // SAFETY: the handler only touches atomics and calls kill(2)
            let previous = unsafe { sigaction(signal, &action) }
                .map_err(|err| LaunchError::SignalHandler { signal, source: err })?;
            forwarding.previous.push((signal, previous));
        }
        Ok(forwarding)
    }

    /// A signal that arrived before the child existed is delivered now.
    fn attach(&self, child: &Child) {
        let pid = child.id() as i32;
        CHILD_PID.store(pid, Ordering::SeqCst);
        let pending = CAUGHT_SIGNAL.load(Ordering::SeqCst);
        if pending != 0 {
            if let Ok(signal) = Signal::try_from(pending) {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal);
            }
        }
    }

    fn caught(&self) -> Option<i32> {
        match CAUGHT_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            signal => Some(signal),
        }
    }
}

impl Drop for SignalForwarding {
    fn drop(&mut self) {
        CHILD_PID.store(0, Ordering::SeqCst);
        for (signal, previous) in self.previous.drain(..) {
            // SAFETY: restores a disposition that was installed before
            if let Err(err) = unsafe { sigaction(signal, &previous) } {
                tracing::warn!(%signal, ?err, "failed to restore signal disposition");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Launcher {
    runtime: PathBuf,
}

impl Launcher {
    /// A bare name is searched on `$PATH` only, never in the working
    /// directory. A value containing `/` is used as a path.
    pub fn locate(runtime: &str) -> Result<Self, LaunchError> {
        let found = which::which(runtime).map_err(|err| LaunchError::RuntimeNotFound {
            runtime: runtime.to_owned(),
            source: err,
        })?;
        let runtime = fs::canonicalize(&found).unwrap_or(found);
        tracing::debug!(?runtime, "located container runtime");
        Ok(Self { runtime })
    }

    /// Like [`Launcher::locate`], with `$FSARK_RUNTIME` taking precedence
    /// over `configured`.
    pub fn from_env(configured: &str) -> Result<Self, LaunchError> {
        match std::env::var(RUNTIME_ENV) {
            Ok(runtime) if !runtime.is_empty() => Self::locate(&runtime),
            _ => Self::locate(configured),
        }
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    /// `<runtime> run --bundle <bundle> <id>`
    pub fn command(&self, bundle: &Path, id: &str) -> Command {
        let mut command = Command::new(&self.runtime);
        command.arg("run").arg("--bundle").arg(bundle).arg(id);
        command
    }

    /// Runs `bundle` attached to this process's standard streams.
    pub fn run(&self, bundle: &Bundle) -> Result<i32, LaunchError> {
        self.run_with(bundle.path(), bundle.id(), io::stdin(), io::stdout())
    }

    /// Runs the bundle at `bundle` as container `id`, feeding `input` to the
    /// runtime's stdin and relaying its stdout into `output`. Stderr is
    /// inherited.
    ///
    /// SIGINT, SIGTERM and SIGHUP received meanwhile are forwarded to the
    /// runtime; the result is then `128 + signal` no matter how it exits.
    ///
    /// Returns once the runtime has exited and all of its output has been
    /// relayed. The input relay is never joined: it may stay blocked reading
    /// `input` until the process exits. Dropping the child's stdin, which the
    /// input relay does when `input` ends, is how the runtime learns there is
    /// no more input.
    pub fn run_with<I, O>(&self, bundle: &Path, id: &str, input: I, output: O) -> Result<i32, LaunchError>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
    {
        let mut command = self.command(bundle, id);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let _running = RUNNING.lock().unwrap_or_else(PoisonError::into_inner);
        let forwarding = SignalForwarding::install()?;

        tracing::debug!(runtime = ?self.runtime, ?bundle, id, "starting container");
        let mut child = command.spawn().map_err(|err| LaunchError::Spawn {
            runtime: self.runtime.clone(),
            source: err,
        })?;
        forwarding.attach(&child);

        let output_relay = match self.start_relays(&mut child, input, output) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(err);
            }
        };

        match output_relay.join() {
            Ok(Ok(bytes)) => tracing::debug!(bytes, "output relay finished"),
            Ok(Err(err)) => tracing::warn!(?err, "output relay stopped early"),
            Err(_) => tracing::error!("output relay panicked"),
        }

        let status = child.wait().map_err(|err| LaunchError::Wait {
            runtime: self.runtime.clone(),
            source: err,
        })?;
        tracing::debug!(?status, "container exited");
        match forwarding.caught() {
            Some(signal) => {
                tracing::debug!(signal, "launcher was interrupted");
                Ok(128 + signal)
            }
            None => Ok(exit_code(status)),
        }
    }

    fn start_relays<I, O>(
        &self,
        child: &mut Child,
        input: I,
        output: O,
    ) -> Result<thread::JoinHandle<Result<u64, RelayError>>, LaunchError>
    where
        I: Read + Send + 'static,
        O: Write + Send + 'static,
    {
        let missing = |stream| LaunchError::MissingPipe {
            runtime: self.runtime.clone(),
            stream,
        };
        let child_stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let child_stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

        let output_relay = thread::Builder::new()
            .name("stdout-relay".to_owned())
            .spawn(move || relay(child_stdout, output))
            .map_err(|err| LaunchError::RelayThread {
                stream: "stdout",
                source: err,
            })?;

        // detached on purpose, see `run_with`
        thread::Builder::new()
            .name("stdin-relay".to_owned())
            .spawn(move || {
                if let Err(err) = relay(input, child_stdin) {
                    tracing::debug!(?err, "input relay stopped");
                }
            })
            .map_err(|err| LaunchError::RelayThread {
                stream: "stdin",
                source: err,
            })?;

        Ok(output_relay)
    }
}
