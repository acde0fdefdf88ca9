// LOADSWEEP DUT CONTROLLER
// OWNS THE DEVICE-UNDER-TEST PROCESS AND ITS HARDWARE SETTINGS.
//
// STATE MACHINE:
//   STOPPED --start()--> STARTING --wait_ready()--> RUNNING
//   STARTING/RUNNING --stop()--> STOPPED   (SYNCHRONOUS, NO DURABLE STOPPING)
//
// WHAT GETS LAUNCHED IS A DutBackend STRATEGY (ENSO/DPDK, ECHO/MAGLEV).
// CLOCK AND DDIO HANDLING IS SHARED AND INDEPENDENT OF THE BACKEND.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tracing::{info, warn};

use crate::error::{HarnessError, Result};
use crate::generator::Generator;
use crate::host::{run_checked, CommandHandle, Host, WatchOutcome};
use crate::hw::{ClockManager, DdioManager};
use crate::probe;

const CTRL_C: &[u8] = b"\x03";

pub const ENSO_READY: &str = "Mbps";
pub const DPDK_READY: &str = "Starting core 0 with first queue 0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutState {
    Stopped,
    Starting,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub cores: u32,
    pub queues_per_core: u32,
    pub cycles: u32,
}

pub trait DutBackend: Send {
    fn label(&self) -> &str;

    fn command(&self, params: &RunParams) -> String;

    fn ready_pattern(&self) -> &str;

    fn before_start(&mut self, _host: &dyn Host, _params: &RunParams) -> Result<()> {
        Ok(())
    }

    fn after_stop(&mut self, _host: &dyn Host) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BACKENDS
// ---------------------------------------------------------------------------

// ENSO NIC KNOBS TOUCHED BY THE DUT BACKENDS
#[derive(Debug, Clone)]
pub struct NicTool {
    cmd: String,
}

impl NicTool {
    pub fn new(cmd: &str) -> Self {
        Self { cmd: cmd.to_string() }
    }

    pub fn set_desc_per_pkt(&self, host: &dyn Host, enabled: bool) -> Result<()> {
        run_checked(host, &format!("{} --desc-per-pkt {}", self.cmd, u8::from(enabled)))
    }

    pub fn set_fallback_queues(&self, host: &dyn Host, queues: u32) -> Result<()> {
        run_checked(host, &format!("{} --fallback-queues {}", self.cmd, queues))
    }
}

pub struct EnsoEcho {
    cmd: String,
    notif_per_pkt: Option<NicTool>,
}

impl EnsoEcho {
    pub fn new(cmd: &str) -> Self {
        Self { cmd: cmd.to_string(), notif_per_pkt: None }
    }

    // ONE NOTIFICATION PER PACKET INSTEAD OF PER BATCH WHILE RUNNING
    pub fn with_notif_per_pkt(mut self, nic: NicTool) -> Self {
        self.notif_per_pkt = Some(nic);
        self
    }
}

impl DutBackend for EnsoEcho {
    fn label(&self) -> &str {
        "enso-echo"
    }

    fn command(&self, p: &RunParams) -> String {
        format!("{} {} {} {}", self.cmd, p.cores, p.queues_per_core, p.cycles)
    }

    fn ready_pattern(&self) -> &str {
        ENSO_READY
    }

    fn before_start(&mut self, host: &dyn Host, _params: &RunParams) -> Result<()> {
        match &self.notif_per_pkt {
            Some(nic) => nic.set_desc_per_pkt(host, true),
            None => Ok(()),
        }
    }

    fn after_stop(&mut self, host: &dyn Host) -> Result<()> {
        match &self.notif_per_pkt {
            Some(nic) => nic.set_desc_per_pkt(host, false),
            None => Ok(()),
        }
    }
}

pub struct EnsoMaglev {
    cmd: String,
    nic: NicTool,
    nb_backends: u32,
}

impl EnsoMaglev {
    pub fn new(cmd: &str, nic: NicTool, nb_backends: u32) -> Self {
        Self { cmd: cmd.to_string(), nic, nb_backends }
    }
}

impl DutBackend for EnsoMaglev {
    fn label(&self) -> &str {
        "enso-maglev"
    }

    fn command(&self, p: &RunParams) -> String {
        format!(
            "{} -l 0-{} -- {} {} {}",
            self.cmd,
            p.cores.saturating_sub(1),
            p.cores,
            p.queues_per_core,
            self.nb_backends
        )
    }

    fn ready_pattern(&self) -> &str {
        ENSO_READY
    }

    // MAGLEV HASHES FLOWS TO CORES, SO EVERY PIPE MUST BE A FALLBACK QUEUE
    fn before_start(&mut self, host: &dyn Host, p: &RunParams) -> Result<()> {
        self.nic.set_fallback_queues(host, p.cores * p.queues_per_core)
    }
}

#[derive(Debug, Clone)]
pub struct EalConfig {
    pub mem_channels: u32,
    pub pcie_addr: String,
}

impl EalConfig {
    pub fn args(&self, cores: u32) -> String {
        let list: Vec<String> = (0..cores).map(|c| c.to_string()).collect();
        format!("-l {} -n {} -a {}", list.join(","), self.mem_channels, self.pcie_addr)
    }
}

pub struct DpdkEcho {
    cmd: String,
    eal: EalConfig,
}

impl DpdkEcho {
    pub fn new(cmd: &str, eal: EalConfig) -> Self {
        Self { cmd: cmd.to_string(), eal }
    }
}

impl DutBackend for DpdkEcho {
    fn label(&self) -> &str {
        "dpdk-echo"
    }

    fn command(&self, p: &RunParams) -> String {
        format!(
            "{} {} -- --q-per-core {} --nb-cycles {}",
            self.cmd,
            self.eal.args(p.cores),
            p.queues_per_core,
            p.cycles
        )
    }

    fn ready_pattern(&self) -> &str {
        DPDK_READY
    }
}

pub struct DpdkMaglev {
    cmd: String,
    eal: EalConfig,
    nb_backends: u32,
}

impl DpdkMaglev {
    pub fn new(cmd: &str, eal: EalConfig, nb_backends: u32) -> Self {
        Self { cmd: cmd.to_string(), eal, nb_backends }
    }
}

impl DutBackend for DpdkMaglev {
    fn label(&self) -> &str {
        "dpdk-maglev"
    }

    fn command(&self, p: &RunParams) -> String {
        format!(
            "{} {} -- --q-per-core {} --nb-backends {}",
            self.cmd,
            self.eal.args(p.cores),
            p.queues_per_core,
            self.nb_backends
        )
    }

    fn ready_pattern(&self) -> &str {
        DPDK_READY
    }
}

// ---------------------------------------------------------------------------
// CONTROLLER
// ---------------------------------------------------------------------------

pub struct DutController {
    host: Arc<dyn Host>,
    backend: Box<dyn DutBackend>,
    pcie_addr: String,
    clock: ClockManager,
    ddio: DdioManager,
    ready: Regex,
    interrupt: Arc<AtomicBool>,
    state: DutState,
    instance: Option<Box<dyn CommandHandle>>,
    running: Option<RunParams>,
}

impl DutController {
    pub fn new(
        host: Arc<dyn Host>,
        backend: Box<dyn DutBackend>,
        pcie_addr: &str,
        clock: ClockManager,
        ddio: DdioManager,
        interrupt: Arc<AtomicBool>,
    ) -> Result<Self> {
        let ready = Regex::new(&regex::escape(backend.ready_pattern()))?;
        Ok(Self {
            host,
            backend,
            pcie_addr: pcie_addr.to_string(),
            clock,
            ddio,
            ready,
            interrupt,
            state: DutState::Stopped,
            instance: None,
            running: None,
        })
    }

    pub fn state(&self) -> DutState {
        self.state
    }

    // TAKES EFFECT AT THE NEXT start()
    pub fn set_clock(&mut self, freq: u32) {
        self.clock.set_target(freq);
    }

    // APPLIED NOW WHEN IDLE, OTHERWISE AT THE NEXT start()
    pub fn set_cache_ways(&mut self, ways: u32) -> Result<()> {
        self.ddio.set_target(ways)?;
        if self.state == DutState::Stopped {
            self.ddio.apply(self.host.as_ref(), &self.pcie_addr)?;
        }
        Ok(())
    }

    pub fn apply_clock_to_cores(&mut self, nb_cores: u32) -> Result<()> {
        self.clock.apply(self.host.as_ref(), nb_cores)
    }

    pub fn start(&mut self, cores: u32, queues_per_core: u32, cycles: u32) -> Result<()> {
        if self.state != DutState::Stopped {
            return Err(HarnessError::AlreadyRunning);
        }
        let params = RunParams { cores, queues_per_core, cycles };

        self.backend.before_start(self.host.as_ref(), &params)?;
        self.clock.apply(self.host.as_ref(), cores)?;
        self.ddio.apply(self.host.as_ref(), &self.pcie_addr)?;

        let cmd = self.backend.command(&params);
        info!(backend = self.backend.label(), cores, queues_per_core, cycles, "starting DUT");
        self.instance = Some(self.host.run(&cmd)?);
        self.running = Some(params);
        self.state = DutState::Starting;
        Ok(())
    }

    pub fn wait_ready(&mut self) -> Result<()> {
        match self.state {
            DutState::Running => return Ok(()),
            DutState::Stopped => return Err(HarnessError::NotRunning),
            DutState::Starting => {}
        }

        let (outcome, exited) = {
            let handle = self.instance.as_mut().ok_or(HarnessError::NotRunning)?;
            let outcome = handle.watch(Some(&self.ready), Some(self.interrupt.as_ref()))?;
            let exited = outcome == WatchOutcome::Exited || handle.exit_status_ready();
            (outcome, exited)
        };

        if outcome == WatchOutcome::Interrupted {
            warn!("interrupted while waiting for DUT, stopping it");
            self.stop()?;
            return Err(HarnessError::Interrupted);
        }
        if exited {
            let status = self
                .instance
                .take()
                .map(|mut h| h.exit_status().unwrap_or(-1))
                .unwrap_or(-1);
            self.state = DutState::Stopped;
            return Err(HarnessError::StartupFailure(format!(
                "{} exited with status {}", self.backend.label(), status
            )));
        }

        self.state = DutState::Running;
        Ok(())
    }

    // NO-OP WHEN STOPPED. OTHERWISE ^C, WAIT FOR EXIT, RESET CLOCKS.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == DutState::Stopped {
            return Ok(());
        }
        if let Some(mut handle) = self.instance.take() {
            handle.send(CTRL_C)?;
            handle.watch(None, None)?;
        }
        self.state = DutState::Stopped;

        let cores = self.running.map(|p| p.cores).unwrap_or(0);
        self.clock.reset(self.host.as_ref(), cores)?;
        self.backend.after_stop(self.host.as_ref())?;
        info!(backend = self.backend.label(), "DUT stopped");
        Ok(())
    }

    // stop() ALREADY WAITED FOR THE PROCESS TO EXIT
    pub fn wait_stop(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn restart(&mut self) -> Result<()> {
        if self.state != DutState::Running {
            return Err(HarnessError::NotRunning);
        }
        let p = self.running.ok_or(HarnessError::NotRunning)?;
        self.stop()?;
        self.wait_stop()?;
        self.start(p.cores, p.queues_per_core, p.cycles)?;
        self.wait_ready()
    }

    // STOPS THE DUT AND FAILS IF THE OPERATOR ASKED TO QUIT
    pub fn check_interrupt(&mut self) -> Result<()> {
        if self.interrupt.load(Ordering::Relaxed) {
            self.stop()?;
            return Err(HarnessError::Interrupted);
        }
        Ok(())
    }

    pub fn zero_loss_throughput<G: Generator + ?Sized>(
        &mut self,
        gen: &mut G,
        pkt_size: u32,
        max_rate: u64,
        precision: u64,
        warmup: Duration,
    ) -> Result<u64> {
        self.wait_ready()?;
        if !warmup.is_zero() {
            probe::warmup(gen, pkt_size, max_rate, warmup)?;
        }
        probe::zero_loss_throughput(gen, pkt_size, max_rate, precision, probe::PROBE_DURATION)
    }
}
