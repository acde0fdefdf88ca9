// LOADSWEEP LATENCY SWEEP
// PER (PKT SIZE, CORES, QUEUES, CLOCK) POINT, RAMP THE OFFERED LOAD UPWARD.
// EACH COMPLETED LEVEL LEAVES ONE RTT HISTOGRAM FILE AND ONE SUMMARY ROW.
//
// RESUMABLE BY ARTIFACT: A LEVEL WHOSE HISTOGRAM FILE EXISTS IS DONE.
// THE FIRST LEVEL THAT LOSES PACKETS ENDS THE RAMP FOR THAT POINT.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::dut::DutController;
use crate::error::{HarnessError, Result};
use crate::generator::{packets_for, Generator, HistogramCapture, TrafficOverrides};
use crate::runner::{Experiment, Reporter};
use crate::sweep::ResultLog;

pub const LATENCY_HEADER: &[&str] =
    &["pkt_size", "nb_cores", "queues_per_core", "cpu_clock", "load", "throughput"];

pub const DEFAULT_TARGET_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LatencyPoint {
    pub pkt_size: u32,
    pub nb_cores: u32,
    pub queues_per_core: u32,
    pub cpu_clock: u32,
}

impl LatencyPoint {
    // LEADING COLUMNS OF A LOG ROW
    pub fn fields(&self, load: u64) -> Vec<String> {
        let mut fields: Vec<String> =
            [self.pkt_size, self.nb_cores, self.queues_per_core, self.cpu_clock]
                .iter()
                .map(u32::to_string)
                .collect();
        fields.push(load.to_string());
        fields
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatencyGrid {
    pub pkt_sizes: Vec<u32>,
    pub nb_cores: Vec<u32>,
    pub queues_per_core: Vec<u32>,
    pub cpu_clocks: Vec<u32>,
}

impl LatencyGrid {
    pub fn points(&self) -> Vec<LatencyPoint> {
        let mut points = Vec::new();
        for &pkt_size in &self.pkt_sizes {
            for &nb_cores in &self.nb_cores {
                for &queues_per_core in &self.queues_per_core {
                    for &cpu_clock in &self.cpu_clocks {
                        points.push(LatencyPoint { pkt_size, nb_cores, queues_per_core, cpu_clock });
                    }
                }
            }
        }
        points
    }
}

// <dir>/<stem>-<pkt>_<cores>_<q>_<clock>_<load>.<ext>
pub fn histogram_path(base: &Path, point: &LatencyPoint, load: u64) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!(
        "{}-{}_{}_{}_{}_{}",
        stem, point.pkt_size, point.nb_cores, point.queues_per_core, point.cpu_clock, load
    );
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

// OUTCOME OF ONE LOAD LEVEL
struct Level {
    completed: bool,
    received: u64,
    throughput: f64,
}

pub struct LatencySweepEngine {
    name: String,
    iterations: u32,
    base: PathBuf,
    log: ResultLog,
    dut: DutController,
    grid: LatencyGrid,
    loads: Vec<u64>,
    target_duration: Duration,
    always_save: bool,
    traffic: TrafficOverrides,
}

impl LatencySweepEngine {
    pub fn new(
        name: &str,
        iterations: u32,
        base_save_path: &Path,
        dut: DutController,
        grid: LatencyGrid,
        mut loads: Vec<u64>,
        traffic: TrafficOverrides,
    ) -> Result<Self> {
        loads.sort_unstable();
        let log = ResultLog::open(base_save_path, LATENCY_HEADER)?;
        Ok(Self {
            name: name.to_string(),
            iterations,
            base: base_save_path.to_path_buf(),
            log,
            dut,
            grid,
            loads,
            target_duration: DEFAULT_TARGET_DURATION,
            always_save: false,
            traffic,
        })
    }

    pub fn with_target_duration(mut self, duration: Duration) -> Self {
        self.target_duration = duration;
        self
    }

    // KEEP THE LEVEL THAT FAILED (THE RAMP STILL ENDS THERE)
    pub fn with_always_save(mut self, always_save: bool) -> Self {
        self.always_save = always_save;
        self
    }

    pub fn loads(&self) -> &[u64] {
        &self.loads
    }

    pub fn dut(&self) -> &DutController {
        &self.dut
    }

    fn run_level(
        &mut self,
        gen: &mut dyn Generator,
        point: &LatencyPoint,
        load: u64,
    ) -> Result<(Level, u64)> {
        let pkt_size = self
            .traffic
            .apply(gen, point.pkt_size, point.nb_cores, point.queues_per_core)?;

        // DDIO STAYS AT THE CONTROLLER'S TARGET; start() WRITES IT IF NEEDED
        self.dut.set_clock(point.cpu_clock);
        self.dut.start(point.nb_cores, point.queues_per_core, 0)?;
        self.dut.wait_ready()?;

        let nb_pkts = packets_for(load, pkt_size, self.target_duration);

        let level = {
            let mut gen = HistogramCapture::enable(&mut *gen);
            gen.clean_stats();
            gen.start(load, nb_pkts)?;
            let completed = match gen.wait_transmission_done() {
                Ok(()) => true,
                Err(e) if e.is_transmission() => {
                    warn!(load, error = %e, "transmission failed");
                    false
                }
                Err(e) => return Err(e),
            };
            Level {
                completed,
                received: gen.received_count(),
                throughput: gen.rx_throughput(),
            }
        };

        self.dut.stop()?;
        Ok((level, nb_pkts))
    }
}

impl Experiment for LatencySweepEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    fn run_pass(
        &mut self,
        gen: &mut dyn Generator,
        reporter: &mut dyn Reporter,
        _iteration: u32,
    ) -> Result<()> {
        let points = self.grid.points();
        let loads = self.loads.clone();
        let task = reporter.begin_task(&self.name, (points.len() * loads.len()) as u64);

        for point in &points {
            for (i, &load) in loads.iter().enumerate() {
                let artifact = histogram_path(&self.base, point, load);
                if artifact.exists() {
                    info!(path = %artifact.display(), "skipping");
                    reporter.advance(task, 1);
                    continue;
                }
                self.dut.check_interrupt()?;
                let mut record = point.fields(load);
                reporter.set_message(task, &format!("({})", record.join(",")));

                let (level, nb_pkts) = self.run_level(gen, point, load)?;

                let save = level.completed || self.always_save;
                if !save {
                    reporter.advance(task, (loads.len() - i) as u64);
                    break;
                }

                if level.received > nb_pkts {
                    return Err(HarnessError::MeasurementIntegrity {
                        sent: nb_pkts,
                        received: level.received,
                    });
                }

                gen.fetch_histogram(&artifact)?;
                record.push(level.throughput.to_string());
                self.log.append(&record)?;

                if !level.completed {
                    // SAVED BUT SATURATED: HIGHER LOADS WOULD FAIL TOO
                    reporter.advance(task, (loads.len() - i) as u64);
                    break;
                }
                reporter.advance(task, 1);
            }
        }

        reporter.finish(task);
        Ok(())
    }
}
