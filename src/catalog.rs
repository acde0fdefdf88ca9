// LOADSWEEP EXPERIMENT CATALOGS
// THE FIXED SET OF EXPERIMENTS RUN AGAINST EACH DEVICE FAMILY. EVERY
// EXPERIMENT GETS ITS OWN DUT CONTROLLER; THROUGHPUT EXPERIMENTS OF ONE
// FAMILY SHARE A LOG FILE AND TELL THEIR ROWS APART BY KEY.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::config::{Commands, Config};
use crate::dut::{
    DpdkEcho, DpdkMaglev, DutBackend, DutController, EalConfig, EnsoEcho, EnsoMaglev, NicTool,
};
use crate::error::{HarnessError, Result};
use crate::generator::TrafficOverrides;
use crate::host::Host;
use crate::hw::{ClockManager, DdioManager};
use crate::latency::{LatencyGrid, LatencySweepEngine};
use crate::runner::Experiment;
use crate::sweep::{SweepEngine, SweepGrid, ThroughputSettings};

pub const MAX_CLOCK: u32 = 3_100_000;

pub const THROUGHPUT_LOADS_GBPS: [u64; 13] = [1, 10, 20, 30, 40, 50, 60, 70, 80, 90, 95, 99, 100];

pub const PKT_SIZES: [u32; 6] = [64, 128, 256, 512, 1024, 1518];

pub const MAGLEV_BACKENDS: u32 = 1000;

// SYN FLOOD: EVERY PACKET A NEW FLOW. CACHED: FEW FLOWS, HOT LOOKUP TABLE.
pub const SYN_FLOOD_FLOWS: u32 = 1_048_576;
pub const CACHED_FLOWS: u32 = 16;

// ENOUGH FLOWS FOR RSS TO SPREAD EVENLY OVER DPDK QUEUES
pub const DPDK_FLOWS: u32 = 1024;

pub fn throughput_loads() -> Vec<u64> {
    THROUGHPUT_LOADS_GBPS.iter().map(|g| g * 1_000_000_000).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DpdkType {
    E810,
}

impl DpdkType {
    pub fn as_str(self) -> &'static str {
        match self {
            DpdkType::E810 => "e810",
        }
    }
}

pub struct CatalogContext {
    pub config: Config,
    pub commands: Commands,
    pub data_dir: PathBuf,
    pub iterations: u32,
    pub dut_host: Arc<dyn Host>,
    pub interrupt: Arc<AtomicBool>,
}

impl CatalogContext {
    pub fn new(
        config: Config,
        data_dir: &Path,
        iterations: u32,
        dut_host: Arc<dyn Host>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        let commands = config.commands();
        Self {
            config,
            commands,
            data_dir: data_dir.to_path_buf(),
            iterations,
            dut_host,
            interrupt,
        }
    }

    fn save_path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    fn nic(&self) -> NicTool {
        NicTool::new(&self.commands.nic_config)
    }

    fn eal(&self) -> Result<EalConfig> {
        let pcie_addr = self.config.devices.dpdk_dut_pcie.clone();
        if pcie_addr.trim().is_empty() {
            return Err(HarnessError::Configuration(
                "must define devices.dpdk_dut_pcie for DPDK experiments".into(),
            ));
        }
        Ok(EalConfig { mem_channels: self.config.extra.dpdk_mem_channels, pcie_addr })
    }

    pub fn dut(&self, backend: Box<dyn DutBackend>, pcie_addr: &str) -> Result<DutController> {
        let clock = ClockManager::new(&self.commands.set_clock, MAX_CLOCK);
        let ddio = DdioManager::new(
            &self.commands.change_ddio,
            self.config.nb_llc_ways()?,
            self.config.default_nb_ddio_ways()?,
        )?;
        DutController::new(
            Arc::clone(&self.dut_host),
            backend,
            pcie_addr,
            clock,
            ddio,
            Arc::clone(&self.interrupt),
        )
    }

    fn enso_dut(&self, backend: Box<dyn DutBackend>) -> Result<DutController> {
        let pcie = self.config.devices.enso_dut_pcie.clone();
        self.dut(backend, &pcie)
    }

    fn dpdk_dut(&self, backend: Box<dyn DutBackend>) -> Result<DutController> {
        let pcie = self.eal()?.pcie_addr;
        self.dut(backend, &pcie)
    }

    // DEFAULT THROUGHPUT GRID: 64B, MAX CLOCK, NO EXTRA CYCLES, DEFAULT DDIO
    fn grid(&self, pkt_sizes: &[u32], nb_cores: &[u32], queues_per_core: &[u32]) -> Result<SweepGrid> {
        Ok(SweepGrid {
            pkt_sizes: pkt_sizes.to_vec(),
            nb_cores: nb_cores.to_vec(),
            queues_per_core: queues_per_core.to_vec(),
            cpu_clocks: vec![MAX_CLOCK],
            nb_cycles: vec![0],
            ddio_ways: vec![self.config.default_nb_ddio_ways()?],
        })
    }

    fn throughput(
        &self,
        name: &str,
        file: &str,
        dut: DutController,
        grid: SweepGrid,
        traffic: TrafficOverrides,
    ) -> Result<Box<dyn Experiment>> {
        let engine = SweepEngine::new(
            name,
            self.iterations,
            &self.save_path(file),
            dut,
            grid,
            ThroughputSettings::default(),
            traffic,
        )?;
        Ok(Box::new(engine))
    }

    // RTT RAMPS RUN ONCE; REPEATING THEM WOULD ONLY FIND THEIR OWN HISTOGRAMS
    fn rtt(
        &self,
        name: &str,
        file: &str,
        dut: DutController,
        grid: LatencyGrid,
        traffic: TrafficOverrides,
    ) -> Result<Box<dyn Experiment>> {
        let engine = LatencySweepEngine::new(
            name,
            1,
            &self.save_path(file),
            dut,
            grid,
            throughput_loads(),
            traffic,
        )?
        .with_always_save(true);
        Ok(Box::new(engine))
    }
}

fn rtt_grid(pkt_sizes: &[u32], queues_per_core: u32) -> LatencyGrid {
    LatencyGrid {
        pkt_sizes: pkt_sizes.to_vec(),
        nb_cores: vec![1],
        queues_per_core: vec![queues_per_core],
        cpu_clocks: vec![MAX_CLOCK],
    }
}

pub fn enso_experiments(ctx: &CatalogContext) -> Result<Vec<Box<dyn Experiment>>> {
    let cmds = &ctx.commands;
    let cores = [1, 2, 4, 8];
    let maglev = || -> Result<DutController> {
        ctx.enso_dut(Box::new(EnsoMaglev::new(&cmds.enso_maglev, ctx.nic(), MAGLEV_BACKENDS)))
    };
    let echo = || -> Result<DutController> { ctx.enso_dut(Box::new(EnsoEcho::new(&cmds.enso_echo))) };

    let mut experiments = vec![
        ctx.throughput(
            "Enso Maglev throughput (SYN flood)",
            "enso_maglev_throughput_1000_1048576.csv",
            maglev()?,
            ctx.grid(&[64], &cores, &[4])?,
            TrafficOverrides::flows(1, SYN_FLOOD_FLOWS),
        )?,
        ctx.throughput(
            "Enso Maglev throughput (Cached)",
            "enso_maglev_throughput_1000_16.csv",
            maglev()?,
            ctx.grid(&[64], &cores, &[4])?,
            TrafficOverrides::flows(1, CACHED_FLOWS),
        )?,
        ctx.rtt(
            "Enso RTT vs. load",
            "enso_hist.csv",
            echo()?,
            rtt_grid(&[64], 2),
            TrafficOverrides::default(),
        )?,
        ctx.rtt(
            "Enso (prefetching) RTT vs. load",
            "enso_prefetch_hist.csv",
            ctx.enso_dut(Box::new(EnsoEcho::new(&cmds.enso_echo_prefetch)))?,
            rtt_grid(&[64], 2),
            TrafficOverrides::default(),
        )?,
        ctx.rtt(
            "Enso (notification per packet) RTT vs. load",
            "enso_notif_per_pkt_hist.csv",
            ctx.enso_dut(Box::new(EnsoEcho::new(&cmds.enso_echo).with_notif_per_pkt(ctx.nic())))?,
            rtt_grid(&[64], 2),
            TrafficOverrides::default(),
        )?,
        ctx.throughput(
            "Enso throughput vs. cores",
            "enso_throughput.csv",
            echo()?,
            ctx.grid(&[64], &cores, &[2])?,
            TrafficOverrides::default(),
        )?,
        ctx.throughput(
            "Enso throughput vs. packet size",
            "enso_throughput.csv",
            echo()?,
            ctx.grid(&PKT_SIZES, &cores, &[2])?,
            TrafficOverrides::default(),
        )?,
    ];

    // PIPES PER CORE, CAPPED SO cores * pipes STAYS AT 1024
    for nb_cores in cores {
        let pipes: Vec<u32> = (0..=10).map(|s| 1u32 << s).filter(|p| p * nb_cores <= 1024).collect();
        experiments.push(ctx.throughput(
            &format!(
                "Enso throughput vs. enso pipes ({} core{})",
                nb_cores,
                if nb_cores == 1 { "" } else { "s" }
            ),
            "enso_throughput.csv",
            echo()?,
            ctx.grid(&[64], &[nb_cores], &pipes)?,
            TrafficOverrides::default(),
        )?);
    }

    Ok(experiments)
}

pub fn dpdk_experiments(ctx: &CatalogContext, dpdk_type: DpdkType) -> Result<Vec<Box<dyn Experiment>>> {
    let cmds = &ctx.commands;
    let ty = dpdk_type.as_str();
    let cores = [1, 2, 4, 8];
    let eal = ctx.eal()?;
    let maglev = || -> Result<DutController> {
        ctx.dpdk_dut(Box::new(DpdkMaglev::new(&cmds.dpdk_maglev, eal.clone(), MAGLEV_BACKENDS)))
    };
    let echo = || -> Result<DutController> {
        ctx.dpdk_dut(Box::new(DpdkEcho::new(&cmds.dpdk_echo, eal.clone())))
    };

    Ok(vec![
        ctx.throughput(
            "DPDK Maglev throughput (SYN flood)",
            &format!("dpdk_{}_maglev_throughput_1000_1048576.csv", ty),
            maglev()?,
            ctx.grid(&[64], &cores, &[1])?,
            TrafficOverrides::flows(1, SYN_FLOOD_FLOWS),
        )?,
        ctx.throughput(
            "DPDK Maglev throughput (Cached)",
            &format!("dpdk_{}_maglev_throughput_1000_16.csv", ty),
            maglev()?,
            ctx.grid(&[64], &cores, &[1])?,
            TrafficOverrides::flows(1, CACHED_FLOWS),
        )?,
        ctx.rtt(
            "DPDK RTT vs. load",
            &format!("dpdk_{}_hist.csv", ty),
            echo()?,
            rtt_grid(&PKT_SIZES, 1),
            TrafficOverrides::flows(1, DPDK_FLOWS),
        )?,
        ctx.throughput(
            "DPDK throughput vs. cores",
            &format!("dpdk_{}_throughput.csv", ty),
            echo()?,
            ctx.grid(&PKT_SIZES, &cores, &[1])?,
            TrafficOverrides::flows(1, DPDK_FLOWS),
        )?,
    ])
}
