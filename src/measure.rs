// LOADSWEEP OPEN-LOOP DUT MEASUREMENT
// START THE DUT, HOLD ONE OFFERED LOAD, LET A PROBE SAMPLE THE DUT DURING
// STEADY STATE, THEN TEAR DOWN. WHAT THE PROBE RECORDS IS UP TO THE PROBE.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::info;

use crate::dut::DutController;
use crate::error::{HarnessError, Result};
use crate::generator::{Generator, TrafficOverrides};
use crate::latency::{histogram_path, LatencyGrid, LATENCY_HEADER};
use crate::runner::{Experiment, Reporter};
use crate::sweep::ResultLog;

pub const MIN_TARGET_DURATION: Duration = Duration::from_secs(5);
pub const DEFAULT_RAMP: Duration = Duration::from_secs(1);

// BOUNDED WAIT ON THE GENERATOR AFTER THE PROBE RETURNS
const DRAIN: Duration = Duration::from_secs(1);

// TELEMETRY HOOK RUN WHILE THE DUT IS UNDER STEADY LOAD. THE PROBE OWNS
// save_path AND SAMPLES FOR AT MOST duration.
pub trait Probe {
    fn measure(
        &mut self,
        _dut: &mut DutController,
        _save_path: &Path,
        _duration: Duration,
    ) -> Result<()> {
        Err(HarnessError::NotImplemented("DUT probe"))
    }
}

// PLACEHOLDER FOR EXPERIMENTS WITHOUT A CONCRETE PROBE
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl Probe for NoProbe {}

pub struct MeasureDutExperiment<P: Probe> {
    name: String,
    iterations: u32,
    base: PathBuf,
    log: ResultLog,
    dut: DutController,
    grid: LatencyGrid,
    loads: Vec<u64>,
    target_duration: Duration,
    ramp: Duration,
    traffic: TrafficOverrides,
    probe: P,
}

impl<P: Probe> MeasureDutExperiment<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        iterations: u32,
        base_save_path: &Path,
        dut: DutController,
        grid: LatencyGrid,
        loads: Vec<u64>,
        target_duration: Duration,
        traffic: TrafficOverrides,
        probe: P,
    ) -> Result<Self> {
        if target_duration <= MIN_TARGET_DURATION {
            return Err(HarnessError::Configuration(format!(
                "{}: target duration must exceed {}s", name, MIN_TARGET_DURATION.as_secs()
            )));
        }
        let log = ResultLog::open(base_save_path, LATENCY_HEADER)?;
        Ok(Self {
            name: name.to_string(),
            iterations,
            base: base_save_path.to_path_buf(),
            log,
            dut,
            grid,
            loads,
            target_duration,
            ramp: DEFAULT_RAMP,
            traffic,
            probe,
        })
    }

    // TIME BETWEEN OFFERING LOAD AND RUNNING THE PROBE
    pub fn with_ramp(mut self, ramp: Duration) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }
}

impl<P: Probe> Experiment for MeasureDutExperiment<P> {
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
            for &load in &loads {
                let save_path = histogram_path(&self.base, point, load);
                if save_path.exists() {
                    info!(path = %save_path.display(), "skipping");
                    reporter.advance(task, 1);
                    continue;
                }
                self.dut.check_interrupt()?;
                let mut record = point.fields(load);
                reporter.set_message(task, &format!("({})", record.join(",")));

                self.dut.set_clock(point.cpu_clock);
                self.traffic
                    .apply(gen, point.pkt_size, point.nb_cores, point.queues_per_core)?;
                self.dut.start(point.nb_cores, point.queues_per_core, 0)?;
                self.dut.wait_ready()?;

                gen.start(load, 0)?;
                std::thread::sleep(self.ramp);

                self.probe.measure(&mut self.dut, &save_path, self.target_duration)?;

                gen.watch_for(DRAIN)?;
                gen.stop()?;
                self.dut.stop()?;

                record.push(gen.rx_throughput().to_string());
                self.log.append(&record)?;
                reporter.advance(task, 1);
            }
        }

        reporter.finish(task);
        Ok(())
    }
}
