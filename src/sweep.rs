// LOADSWEEP THROUGHPUT SWEEP
// CARTESIAN PRODUCT OVER PACKET SIZE, CORES, QUEUES, CLOCK, CYCLES AND DDIO
// WAYS. ONE ZERO-LOSS MEASUREMENT PER POINT PER ITERATION.
//
// RESUMABLE: THE CSV LOG IS THE ONLY STATE. ON STARTUP EVERY ROW BUMPS A
// COUNTER FOR ITS KEY (ALL COLUMNS BUT THE MEASURED VALUE). A POINT IS
// SKIPPED IN ITERATION i IFF ITS COUNTER IS ALREADY > i.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use csv::StringRecord;
use tracing::info;

use crate::dut::DutController;
use crate::error::{HarnessError, Result};
use crate::generator::{Generator, TrafficOverrides};
use crate::probe;
use crate::runner::{Experiment, Reporter};

pub const THROUGHPUT_HEADER: &[&str] = &[
    "pkt_size", "nb_cores", "queues_per_core", "cpu_clock",
    "nb_cycles", "ddio_ways", "precision", "throughput",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SweepPoint {
    pub pkt_size: u32,
    pub nb_cores: u32,
    pub queues_per_core: u32,
    pub cpu_clock: u32,
    pub nb_cycles: u32,
    pub ddio_ways: u32,
}

impl SweepPoint {
    // LEADING COLUMNS OF A LOG ROW
    pub fn fields(&self) -> Vec<String> {
        [
            self.pkt_size, self.nb_cores, self.queues_per_core,
            self.cpu_clock, self.nb_cycles, self.ddio_ways,
        ]
        .iter()
        .map(u32::to_string)
        .collect()
    }

    // CANONICAL SERIALIZATION
    pub fn key(&self) -> String {
        self.fields().join(",")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepGrid {
    pub pkt_sizes: Vec<u32>,
    pub nb_cores: Vec<u32>,
    pub queues_per_core: Vec<u32>,
    pub cpu_clocks: Vec<u32>,
    pub nb_cycles: Vec<u32>,
    pub ddio_ways: Vec<u32>,
}

impl SweepGrid {
    // ROW-MAJOR: LAST DIMENSION VARIES FASTEST
    pub fn points(&self) -> Vec<SweepPoint> {
        let mut points = Vec::with_capacity(self.len());
        for &pkt_size in &self.pkt_sizes {
            for &nb_cores in &self.nb_cores {
                for &queues_per_core in &self.queues_per_core {
                    for &cpu_clock in &self.cpu_clocks {
                        for &nb_cycles in &self.nb_cycles {
                            for &ddio_ways in &self.ddio_ways {
                                points.push(SweepPoint {
                                    pkt_size, nb_cores, queues_per_core,
                                    cpu_clock, nb_cycles, ddio_ways,
                                });
                            }
                        }
                    }
                }
            }
        }
        points
    }

    pub fn len(&self) -> usize {
        self.pkt_sizes.len() * self.nb_cores.len() * self.queues_per_core.len()
            * self.cpu_clocks.len() * self.nb_cycles.len() * self.ddio_ways.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// DURABLE LOG
// ---------------------------------------------------------------------------

// APPEND-ONLY CSV. CREATED WITH ITS HEADER; AN EXISTING FILE MUST CARRY THE
// SAME HEADER OR ITS ROWS MEAN SOMETHING ELSE.
#[derive(Debug, Clone)]
pub struct ResultLog {
    path: PathBuf,
}

impl ResultLog {
    pub fn open(path: &Path, header: &[&str]) -> Result<Self> {
        if path.exists() {
            let mut reader = csv::Reader::from_path(path)?;
            let found = reader.headers()?;
            if !found.iter().eq(header.iter().copied()) {
                return Err(HarnessError::Configuration(format!(
                    "{} has header \"{}\", expected \"{}\"",
                    path.display(),
                    found.iter().collect::<Vec<_>>().join(","),
                    header.join(",")
                )));
            }
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut writer = csv::Writer::from_path(path)?;
            writer.write_record(header)?;
            writer.flush()?;
        }
        Ok(Self { path: path.to_path_buf() })
    }

    pub fn rows(&self) -> Result<Vec<StringRecord>> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let rows = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn append<I, T>(&self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(record)?;
        writer.flush()?;
        Ok(())
    }
}

// EVERY COLUMN BUT THE MEASURED VALUE
pub fn row_key(record: &StringRecord) -> Option<String> {
    let n = record.len().checked_sub(1).filter(|n| *n > 0)?;
    Some(record.iter().take(n).collect::<Vec<_>>().join(","))
}

// COMPLETED ITERATIONS PER CANONICAL KEY
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    counts: HashMap<String, u32>,
}

impl ProgressCounter {
    pub fn from_rows(rows: &[StringRecord]) -> Self {
        let mut counter = Self::default();
        for key in rows.iter().filter_map(row_key) {
            counter.increment(&key);
        }
        counter
    }

    pub fn get(&self, key: &str) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn increment(&mut self, key: &str) {
        *self.counts.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ENGINE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ThroughputSettings {
    pub precision: u64,
    pub max_rate: u64,
    pub warmup: Duration,
}

impl Default for ThroughputSettings {
    fn default() -> Self {
        Self {
            precision: probe::DEFAULT_PRECISION,
            max_rate: probe::DEFAULT_MAX_RATE,
            warmup: probe::DEFAULT_WARMUP,
        }
    }
}

pub struct SweepEngine {
    name: String,
    iterations: u32,
    log: ResultLog,
    progress: ProgressCounter,
    dut: DutController,
    grid: SweepGrid,
    settings: ThroughputSettings,
    traffic: TrafficOverrides,
}

impl SweepEngine {
    pub fn new(
        name: &str,
        iterations: u32,
        save_path: &Path,
        dut: DutController,
        grid: SweepGrid,
        settings: ThroughputSettings,
        traffic: TrafficOverrides,
    ) -> Result<Self> {
        let log = ResultLog::open(save_path, THROUGHPUT_HEADER)?;
        let progress = ProgressCounter::from_rows(&log.rows()?);
        Ok(Self {
            name: name.to_string(),
            iterations,
            log,
            progress,
            dut,
            grid,
            settings,
            traffic,
        })
    }

    pub fn progress(&self) -> &ProgressCounter {
        &self.progress
    }

    pub fn dut(&self) -> &DutController {
        &self.dut
    }

    // POINT PLUS PRECISION: A FINER SEARCH IS A DIFFERENT MEASUREMENT
    fn row_fields(&self, point: &SweepPoint) -> Vec<String> {
        let mut fields = point.fields();
        fields.push(self.settings.precision.to_string());
        fields
    }

    fn measure(&mut self, gen: &mut dyn Generator, p: &SweepPoint) -> Result<u64> {
        let pkt_size = self.traffic.apply(gen, p.pkt_size, p.nb_cores, p.queues_per_core)?;

        self.dut.set_clock(p.cpu_clock);
        self.dut.set_cache_ways(p.ddio_ways)?;
        self.dut.start(p.nb_cores, p.queues_per_core, p.nb_cycles)?;

        let throughput = self.dut.zero_loss_throughput(
            gen,
            pkt_size,
            self.settings.max_rate,
            self.settings.precision,
            self.settings.warmup,
        )?;

        self.dut.stop()?;
        self.dut.wait_stop()?;
        Ok(throughput)
    }
}

impl Experiment for SweepEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn iterations(&self) -> u32 {
        self.iterations
    }

    fn prepare(&mut self) -> Result<()> {
        self.progress = ProgressCounter::from_rows(&self.log.rows()?);
        Ok(())
    }

    fn run_pass(
        &mut self,
        gen: &mut dyn Generator,
        reporter: &mut dyn Reporter,
        iteration: u32,
    ) -> Result<()> {
        let points = self.grid.points();
        let task = reporter.begin_task(&self.name, points.len() as u64);

        for point in &points {
            let mut record = self.row_fields(point);
            let key = record.join(",");
            if self.progress.get(&key) > iteration {
                info!(key = %key, "skipping");
                reporter.advance(task, 1);
                continue;
            }
            self.dut.check_interrupt()?;
            reporter.set_message(task, &format!("({})", point.key()));

            let throughput = self.measure(gen, point)?;

            record.push(throughput.to_string());
            self.log.append(&record)?;
            self.progress.increment(&key);
            reporter.advance(task, 1);
        }

        reporter.finish(task);
        Ok(())
    }
}
