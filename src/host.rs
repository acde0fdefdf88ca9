// LOADSWEEP HOST COMMANDS
// EVERY DEVICE INTERACTION IS A SHELL COMMAND ON THE DUT OR GENERATOR HOST.
// OUTPUT OF BOTH STREAMS IS FORWARDED LINE BY LINE OVER A CHANNEL, APPENDED
// TO THE HOST LOG, AND MATCHED AGAINST AN OPTIONAL STOP PATTERN.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use crate::error::{HarnessError, Result};

const POLL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_millis(500);
const CTRL_C: &[u8] = b"\x03";

pub type LogSink = Arc<Mutex<Box<dyn Write + Send>>>;

pub fn open_log(path: &Path) -> Result<LogSink> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Arc::new(Mutex::new(Box::new(file))))
}

pub fn null_log() -> LogSink {
    Arc::new(Mutex::new(Box::new(std::io::sink())))
}

fn write_log(log: &LogSink, line: &str) {
    if let Ok(mut sink) = log.lock() {
        let _ = writeln!(sink, "{}", line);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Matched,
    Exited,
    Interrupted,
    TimedOut,
}

pub trait CommandHandle: Send {
    // BLOCK UNTIL A LINE MATCHES stop_pattern, THE PROCESS EXITS, OR interrupt IS SET
    fn watch(&mut self, stop_pattern: Option<&Regex>, interrupt: Option<&AtomicBool>)
        -> Result<WatchOutcome>;

    // BOUNDED VARIANT: GIVE UP AFTER timeout
    fn watch_for(&mut self, timeout: Duration) -> Result<WatchOutcome>;

    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    fn exit_status_ready(&mut self) -> bool;

    // WAITS FOR EXIT IF THE PROCESS IS STILL RUNNING
    fn exit_status(&mut self) -> Result<i32>;
}

pub trait Host: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, cmd: &str) -> Result<Box<dyn CommandHandle>>;

    // COPY A FILE FROM THIS HOST TO THE LOCAL MACHINE
    fn fetch(&self, remote: &str, local: &Path) -> Result<()>;
}

// RUN TO COMPLETION. NON-ZERO EXIT IS A DEVICE COMMAND ERROR, NEVER RETRIED.
pub fn run_checked(host: &dyn Host, cmd: &str) -> Result<()> {
    let mut handle = host.run(cmd)?;
    handle.watch(None, None)?;
    let status = handle.exit_status()?;
    if status != 0 {
        return Err(HarnessError::DeviceCommand { cmd: cmd.to_string(), status });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SHELL HOST (LOCAL sh OR REMOTE ssh)
// ---------------------------------------------------------------------------

pub struct ShellHost {
    hostname: String,
    log: LogSink,
}

impl ShellHost {
    pub fn new(hostname: &str, log: LogSink) -> Self {
        Self { hostname: hostname.to_string(), log }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.hostname.as_str(), "" | "localhost" | "127.0.0.1")
    }
}

impl Host for ShellHost {
    fn name(&self) -> &str {
        &self.hostname
    }

    fn run(&self, cmd: &str) -> Result<Box<dyn CommandHandle>> {
        write_log(&self.log, &format!("[{}] $ {}", self.hostname, cmd));
        debug!(host = %self.hostname, cmd, "run");

        let local = self.is_local();
        let mut command = if local {
            let mut c = Command::new("sh");
            c.arg("-c").arg(cmd);
            c
        } else {
            // -tt: REMOTE PTY SO A WRITTEN ^C BECOMES SIGINT ON THE FAR SIDE
            let mut c = Command::new("ssh");
            c.arg("-tt").arg(&self.hostname).arg(cmd);
            c
        };
        let mut child = command
            .process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            forward_lines(out, tx.clone());
        }
        if let Some(err) = child.stderr.take() {
            forward_lines(err, tx);
        }
        let stdin = child.stdin.take();

        Ok(Box::new(ProcessHandle {
            pgid: child.id() as i32,
            child,
            stdin,
            lines: rx,
            log: self.log.clone(),
            local,
            status: None,
        }))
    }

    fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if self.is_local() {
            std::fs::copy(remote, local)?;
            return Ok(());
        }
        let source = format!("{}:{}", self.hostname, remote);
        write_log(&self.log, &format!("$ scp {} {}", source, local.display()));
        let status = Command::new("scp")
            .arg(&source)
            .arg(local)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(HarnessError::DeviceCommand {
                cmd: format!("scp {} {}", source, local.display()),
                status: exit_code(status),
            });
        }
        Ok(())
    }
}

fn forward_lines<R: Read + Send + 'static>(stream: R, tx: Sender<String>) {
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

struct ProcessHandle {
    child: Child,
    pgid: i32,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    log: LogSink,
    local: bool,
    status: Option<i32>,
}

impl ProcessHandle {
    fn reap(&mut self) -> Result<i32> {
        if let Some(code) = self.status {
            return Ok(code);
        }
        let code = exit_code(self.child.wait()?);
        self.status = Some(code);
        Ok(code)
    }

    fn pump(
        &mut self,
        stop_pattern: Option<&Regex>,
        interrupt: Option<&AtomicBool>,
        deadline: Option<Instant>,
    ) -> Result<WatchOutcome> {
        loop {
            if interrupt.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                return Ok(WatchOutcome::Interrupted);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(WatchOutcome::TimedOut);
            }
            match self.lines.recv_timeout(POLL) {
                Ok(line) => {
                    write_log(&self.log, &line);
                    if stop_pattern.is_some_and(|p| p.is_match(&line)) {
                        return Ok(WatchOutcome::Matched);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.reap()?;
                    return Ok(WatchOutcome::Exited);
                }
            }
        }
    }
}

impl CommandHandle for ProcessHandle {
    fn watch(&mut self, stop_pattern: Option<&Regex>, interrupt: Option<&AtomicBool>)
        -> Result<WatchOutcome>
    {
        self.pump(stop_pattern, interrupt, None)
    }

    fn watch_for(&mut self, timeout: Duration) -> Result<WatchOutcome> {
        self.pump(None, None, Some(Instant::now() + timeout))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        // NO PTY LOCALLY: DELIVER ^C AS A SIGNAL TO THE WHOLE GROUP
        if self.local && bytes == CTRL_C {
            unsafe { libc::killpg(self.pgid, libc::SIGINT); }
            return Ok(());
        }
        if let Some(stdin) = self.stdin.as_mut() {
            stdin.write_all(bytes)?;
            stdin.flush()?;
        }
        Ok(())
    }

    fn exit_status_ready(&mut self) -> bool {
        if self.status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.status = Some(exit_code(status));
                true
            }
            _ => false,
        }
    }

    fn exit_status(&mut self) -> Result<i32> {
        if self.status.is_none() {
            self.pump(None, None, None)?;
        }
        self.reap()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_status_ready() {
            return;
        }
        unsafe { libc::killpg(self.pgid, libc::SIGINT); }
        let deadline = Instant::now() + KILL_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
        unsafe { libc::killpg(self.pgid, libc::SIGKILL); }
        let _ = self.child.wait();
    }
}
