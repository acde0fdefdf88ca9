// SCRIPTED STAND-INS FOR THE DUT HOST, THE GENERATOR AND THE CONSOLE.
// EVERYTHING IS RECORDED SO TESTS CAN ASSERT ON WHAT WOULD HAVE HIT HARDWARE.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;

use loadsweep::dut::{DutBackend, DutController, EnsoEcho};
use loadsweep::error::{HarnessError, Result};
use loadsweep::generator::Generator;
use loadsweep::host::{CommandHandle, Host, WatchOutcome};
use loadsweep::hw::{ClockManager, DdioManager};
use loadsweep::runner::{Reporter, TaskId};

pub const ECHO_CMD: &str = "sudo /eval/enso/build/software/examples/echo";
pub const SET_CLOCK: &str = "sudo /eval/tools/set-clock";
pub const CHANGE_DDIO: &str = "sudo /eval/tools/ddio-bench/change-ddio";
pub const DUT_PCIE: &str = "0000:17:00.0";
pub const LLC_WAYS: u32 = 11;

// === FAKE HOST ===

// HOW A LONG-RUNNING PROCESS BEHAVES WHEN WATCHED FOR ITS SENTINEL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startup {
    Ready,
    ExitEarly(i32),
    // NEVER PRINTS THE SENTINEL; ONLY AN INTERRUPT ENDS THE WAIT
    Hang,
}

#[derive(Default)]
struct HostState {
    commands: Vec<String>,
    sent: Vec<Vec<u8>>,
    failures: Vec<(String, i32)>,
    fetched: Vec<String>,
}

pub struct FakeHost {
    name: String,
    startup: Mutex<Startup>,
    fetch_body: Mutex<String>,
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            startup: Mutex::new(Startup::Ready),
            fetch_body: Mutex::new("0,1\n".to_string()),
            state: Arc::new(Mutex::new(HostState::default())),
        })
    }

    pub fn set_startup(&self, startup: Startup) {
        *self.startup.lock().unwrap() = startup;
    }

    // WHAT EVERY fetch() WRITES LOCALLY
    pub fn set_fetch_body(&self, body: &str) {
        *self.fetch_body.lock().unwrap() = body.to_string();
    }

    // ANY COMMAND CONTAINING `needle` EXITS WITH `status`
    pub fn fail_on(&self, needle: &str, status: i32) {
        self.state.lock().unwrap().failures.push((needle.to_string(), status));
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.commands().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl Host for FakeHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, cmd: &str) -> Result<Box<dyn CommandHandle>> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(cmd.to_string());
        let status = state
            .failures
            .iter()
            .find(|(needle, _)| cmd.contains(needle.as_str()))
            .map(|(_, s)| *s)
            .unwrap_or(0);
        Ok(Box::new(FakeHandle {
            startup: *self.startup.lock().unwrap(),
            status,
            exited: false,
            state: Arc::clone(&self.state),
        }))
    }

    fn fetch(&self, remote: &str, local: &Path) -> Result<()> {
        self.state.lock().unwrap().fetched.push(remote.to_string());
        std::fs::write(local, self.fetch_body.lock().unwrap().as_str())?;
        Ok(())
    }
}

struct FakeHandle {
    startup: Startup,
    status: i32,
    exited: bool,
    state: Arc<Mutex<HostState>>,
}

impl CommandHandle for FakeHandle {
    fn watch(&mut self, stop_pattern: Option<&Regex>, interrupt: Option<&AtomicBool>)
        -> Result<WatchOutcome>
    {
        if stop_pattern.is_none() {
            self.exited = true;
            return Ok(WatchOutcome::Exited);
        }
        match self.startup {
            Startup::Ready => Ok(WatchOutcome::Matched),
            Startup::ExitEarly(status) => {
                self.status = status;
                self.exited = true;
                Ok(WatchOutcome::Exited)
            }
            Startup::Hang => loop {
                match interrupt {
                    Some(flag) if flag.load(Ordering::Relaxed) => {
                        return Ok(WatchOutcome::Interrupted)
                    }
                    Some(_) => std::thread::sleep(Duration::from_millis(5)),
                    None => return Ok(WatchOutcome::TimedOut),
                }
            },
        }
    }

    fn watch_for(&mut self, _timeout: Duration) -> Result<WatchOutcome> {
        Ok(WatchOutcome::TimedOut)
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.state.lock().unwrap().sent.push(bytes.to_vec());
        Ok(())
    }

    fn exit_status_ready(&mut self) -> bool {
        self.exited
    }

    fn exit_status(&mut self) -> Result<i32> {
        self.exited = true;
        Ok(self.status)
    }
}

// === DUT ===

pub fn dut_with(host: &Arc<FakeHost>, backend: Box<dyn DutBackend>, ddio_ways: u32)
    -> (DutController, Arc<AtomicBool>)
{
    let interrupt = Arc::new(AtomicBool::new(false));
    let clock = ClockManager::new(SET_CLOCK, 3_100_000).with_settle(Duration::ZERO);
    let ddio = DdioManager::new(CHANGE_DDIO, LLC_WAYS, ddio_ways).unwrap();
    let host: Arc<dyn Host> = host.clone();
    let dut = DutController::new(host, backend, DUT_PCIE, clock, ddio, Arc::clone(&interrupt))
        .unwrap();
    (dut, interrupt)
}

pub fn echo_dut(host: &Arc<FakeHost>) -> DutController {
    dut_with(host, Box::new(EnsoEcho::new(ECHO_CMD)), 2).0
}

// === FAKE GENERATOR ===

#[derive(Default)]
pub struct FakeGenerator {
    // RATES AT WHICH wait_transmission_done FAILS
    pub fail_at: HashSet<u64>,
    // RATES ABOVE THIS LOSE ONE PACKET (ZERO-LOSS PROBE)
    pub loss_above: Option<u64>,
    // RATES AT WHICH ONE EXTRA PACKET COMES BACK
    pub overcount_at: HashSet<u64>,
    // RATES AT WHICH THE COUNTS CANNOT BE READ BACK
    pub stats_lost_at: HashSet<u64>,
    pub starts: Vec<(u64, u64)>,
    pub params: Vec<(u32, u32, u32)>,
    pub hist_at_start: Vec<bool>,
    pub fetched: Vec<std::path::PathBuf>,
    pub stops: usize,
    hist: bool,
    rate: u64,
    sent: u64,
    received: u64,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rates(&self) -> Vec<u64> {
        self.starts.iter().map(|(r, _)| *r).collect()
    }
}

impl Generator for FakeGenerator {
    fn set_params(&mut self, pkt_size: u32, nb_src: u32, nb_dst: u32) -> Result<()> {
        self.params.push((pkt_size, nb_src, nb_dst));
        Ok(())
    }

    fn start(&mut self, rate_bps: u64, nb_pkts: u64) -> Result<()> {
        self.starts.push((rate_bps, nb_pkts));
        self.hist_at_start.push(self.hist);
        self.rate = rate_bps;
        Ok(())
    }

    fn wait_transmission_done(&mut self) -> Result<()> {
        let nb_pkts = self.starts.last().map(|(_, n)| *n).unwrap_or(0);
        if self.stats_lost_at.contains(&self.rate) {
            return Err(HarnessError::GeneratorStats("missing field `rx_packets`".into()));
        }
        self.sent = nb_pkts;
        self.received = nb_pkts;
        if self.overcount_at.contains(&self.rate) {
            self.received = nb_pkts + 1;
        }
        if self.loss_above.is_some_and(|limit| self.rate > limit) {
            self.received = nb_pkts.saturating_sub(1);
        }
        if self.fail_at.contains(&self.rate) {
            self.received = nb_pkts / 2;
            return Err(HarnessError::Transmission("generator exited with status 1".into()));
        }
        Ok(())
    }

    fn watch_for(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stops += 1;
        Ok(())
    }

    fn clean_stats(&mut self) {
        self.sent = 0;
        self.received = 0;
    }

    fn sent_count(&self) -> u64 {
        self.sent
    }

    fn received_count(&self) -> u64 {
        self.received
    }

    fn rx_throughput(&self) -> f64 {
        self.rate as f64
    }

    fn histogram_capture(&self) -> bool {
        self.hist
    }

    fn set_histogram_capture(&mut self, enabled: bool) {
        self.hist = enabled;
    }

    fn fetch_histogram(&mut self, local: &Path) -> Result<()> {
        std::fs::write(local, "0,1\n")?;
        self.fetched.push(local.to_path_buf());
        Ok(())
    }
}

// === REPORTER ===

#[derive(Debug, Default)]
pub struct RecordingReporter {
    pub tasks: Vec<(String, u64)>,
    pub progress: Vec<u64>,
    pub messages: Vec<(TaskId, String)>,
    pub finished: Vec<TaskId>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_of(&self, name: &str) -> u64 {
        self.tasks
            .iter()
            .rposition(|(n, _)| n == name)
            .map(|i| self.progress[i])
            .unwrap_or(0)
    }
}

impl Reporter for RecordingReporter {
    fn begin_task(&mut self, name: &str, total: u64) -> TaskId {
        self.tasks.push((name.to_string(), total));
        self.progress.push(0);
        self.tasks.len() - 1
    }

    fn set_message(&mut self, task: TaskId, msg: &str) {
        self.messages.push((task, msg.to_string()));
    }

    fn advance(&mut self, task: TaskId, steps: u64) {
        self.progress[task] += steps;
    }

    fn finish(&mut self, task: TaskId) {
        self.finished.push(task);
    }
}
