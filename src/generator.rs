// LOADSWEEP TRAFFIC GENERATOR
// THE GENERATOR OFFERS LOAD AT A RATE FOR A PACKET COUNT, THEN REPORTS
// TX/RX COUNTS, RX THROUGHPUT AND (OPTIONALLY) AN RTT HISTOGRAM.

use std::fs::File;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{HarnessError, Result};
use crate::host::{run_checked, CommandHandle, Host};

// PREAMBLE + SFD + IFG + CRC OVERHEAD PER FRAME ON THE WIRE
pub const FRAME_OVERHEAD_BYTES: u32 = 20;

pub fn bits_per_packet(pkt_size: u32) -> u64 {
    (pkt_size as u64 + FRAME_OVERHEAD_BYTES as u64) * 8
}

// PACKETS NEEDED TO SUSTAIN rate_bps FOR duration
pub fn packets_for(rate_bps: u64, pkt_size: u32, duration: Duration) -> u64 {
    let pps = rate_bps as f64 / bits_per_packet(pkt_size) as f64;
    (pps * duration.as_secs_f64()) as u64
}

pub trait Generator {
    fn set_params(&mut self, pkt_size: u32, nb_src: u32, nb_dst: u32) -> Result<()>;

    // nb_pkts == 0 TRANSMITS UNTIL stop()
    fn start(&mut self, rate_bps: u64, nb_pkts: u64) -> Result<()>;

    // FAILS WITH Transmission IF NOT EVERY PACKET WAS ACCOUNTED FOR,
    // GeneratorStats IF THE COUNTS CANNOT BE READ
    fn wait_transmission_done(&mut self) -> Result<()>;

    // BOUNDED WAIT ON A RUNNING TRANSMISSION
    fn watch_for(&mut self, timeout: Duration) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    fn clean_stats(&mut self);

    fn sent_count(&self) -> u64;

    fn received_count(&self) -> u64;

    fn rx_throughput(&self) -> f64;

    fn histogram_capture(&self) -> bool;

    fn set_histogram_capture(&mut self, enabled: bool);

    fn fetch_histogram(&mut self, local: &Path) -> Result<()>;
}

// FORCES HISTOGRAM CAPTURE ON FOR ITS LIFETIME. THE PRIOR FLAG IS RESTORED
// ON DROP, WHICHEVER WAY THE SCOPE IS LEFT.
pub struct HistogramCapture<'a, G: Generator + ?Sized> {
    inner: &'a mut G,
    prior: bool,
}

impl<'a, G: Generator + ?Sized> HistogramCapture<'a, G> {
    pub fn enable(inner: &'a mut G) -> Self {
        let prior = inner.histogram_capture();
        inner.set_histogram_capture(true);
        Self { inner, prior }
    }
}

impl<G: Generator + ?Sized> Deref for HistogramCapture<'_, G> {
    type Target = G;

    fn deref(&self) -> &G {
        &*self.inner
    }
}

impl<G: Generator + ?Sized> DerefMut for HistogramCapture<'_, G> {
    fn deref_mut(&mut self) -> &mut G {
        &mut *self.inner
    }
}

impl<G: Generator + ?Sized> Drop for HistogramCapture<'_, G> {
    fn drop(&mut self) {
        self.inner.set_histogram_capture(self.prior);
    }
}

// PER-EXPERIMENT GENERATOR OVERRIDES. UNSET FIELDS DEFAULT TO THE POINT:
// ONE SOURCE AND ONE DESTINATION PER DUT QUEUE.
#[derive(Debug, Clone, Default)]
pub struct TrafficOverrides {
    pub pkt_size: Option<u32>,
    pub nb_src: Option<u32>,
    pub nb_dst: Option<u32>,
    pub pcap: Option<PathBuf>,
}

impl TrafficOverrides {
    pub fn flows(nb_src: u32, nb_dst: u32) -> Self {
        Self { nb_src: Some(nb_src), nb_dst: Some(nb_dst), ..Self::default() }
    }

    // CONFIGURES THE GENERATOR AND RETURNS THE PACKET SIZE ACTUALLY SENT
    pub fn apply<G: Generator + ?Sized>(
        &self,
        gen: &mut G,
        pkt_size: u32,
        cores: u32,
        queues_per_core: u32,
    ) -> Result<u32> {
        if self.pcap.is_some() {
            return Err(HarnessError::NotImplemented("pcap traffic generation"));
        }
        let size = self.pkt_size.unwrap_or(pkt_size);
        let nb_src = self.nb_src.unwrap_or(1);
        let nb_dst = self.nb_dst.unwrap_or(queues_per_core * cores);
        gen.set_params(size, nb_src, nb_dst)?;
        Ok(size)
    }
}

// ---------------------------------------------------------------------------
// STATS FILE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GenStats {
    pub sent: u64,
    pub received: u64,
    pub rx_goodput_mbps: f64,
}

// COLUMNS WE READ. EnsoGen WRITES MORE; EXTRAS ARE IGNORED.
#[derive(Debug, Deserialize)]
struct StatsRecord {
    tx_packets: u64,
    rx_packets: u64,
    rx_goodput_mbps: f64,
}

// CSV WITH A HEADER ROW. THE LAST RECORD HOLDS THE CUMULATIVE COUNTS.
// ANY READ FAILURE IS GeneratorStats: A RUN WITHOUT COUNTS IS NOT LOSS.
pub fn parse_stats<R: Read>(source: R) -> Result<GenStats> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);

    let mut last = None;
    for record in reader.deserialize::<StatsRecord>() {
        last = Some(record.map_err(|e| HarnessError::GeneratorStats(e.to_string()))?);
    }
    let last = last.ok_or_else(|| HarnessError::GeneratorStats("no samples".into()))?;

    Ok(GenStats {
        sent: last.tx_packets,
        received: last.rx_packets,
        rx_goodput_mbps: last.rx_goodput_mbps,
    })
}

// ---------------------------------------------------------------------------
// ENSO GENERATOR CLIENT
// ---------------------------------------------------------------------------

const REMOTE_STATS: &str = "/tmp/loadsweep_ensogen_stats.csv";
const REMOTE_HIST: &str = "/tmp/loadsweep_ensogen_hist.csv";
const CTRL_C: &[u8] = b"\x03";

pub struct EnsoGen {
    host: Arc<dyn Host>,
    enso_path: String,
    pcie_addr: String,
    params: Option<(u32, u32, u32)>,
    pcap: Option<String>,
    rtt_hist: bool,
    running: Option<Box<dyn CommandHandle>>,
    stats: GenStats,
    local_stats: PathBuf,
}

impl EnsoGen {
    pub fn new(host: Arc<dyn Host>, enso_path: &str, pcie_addr: &str) -> Self {
        // ONE LOCAL COPY PER PROCESS AND HOST
        let local_stats = std::env::temp_dir().join(format!(
            "loadsweep_ensogen_stats_{}_{}.csv", std::process::id(), host.name()
        ));
        Self {
            host,
            enso_path: enso_path.trim_end_matches('/').to_string(),
            pcie_addr: pcie_addr.to_string(),
            params: None,
            pcap: None,
            rtt_hist: false,
            running: None,
            stats: GenStats::default(),
            local_stats,
        }
    }

    fn start_command(&self, pcap: &str, rate_bps: u64, nb_pkts: u64) -> String {
        let mut cmd = format!(
            "{}/scripts/ensogen.sh {} {} --pcie-addr {} --count {} --save {}",
            self.enso_path,
            pcap,
            rate_bps as f64 / 1e9,
            self.pcie_addr,
            nb_pkts,
            REMOTE_STATS,
        );
        if self.rtt_hist {
            cmd.push_str(&format!(" --rtt --rtt-hist {}", REMOTE_HIST));
        }
        cmd
    }

    fn refresh_stats(&mut self) -> Result<()> {
        self.host.fetch(REMOTE_STATS, &self.local_stats)?;
        let file = File::open(&self.local_stats).map_err(|e| {
            HarnessError::GeneratorStats(format!("{}: {}", self.local_stats.display(), e))
        })?;
        self.stats = parse_stats(file)?;
        debug!(sent = self.stats.sent, received = self.stats.received, "generator stats");
        Ok(())
    }
}

impl Generator for EnsoGen {
    fn set_params(&mut self, pkt_size: u32, nb_src: u32, nb_dst: u32) -> Result<()> {
        let params = (pkt_size, nb_src, nb_dst);
        if self.params == Some(params) {
            return Ok(());
        }
        let pcap = format!("/tmp/loadsweep_{}_{}_{}.pcap", pkt_size, nb_src, nb_dst);
        run_checked(
            self.host.as_ref(),
            &format!(
                "python3 {}/hardware_test/generate_synthetic_trace.py {} {} {} {}",
                self.enso_path, nb_src, nb_dst, pkt_size, pcap
            ),
        )?;
        self.params = Some(params);
        self.pcap = Some(pcap);
        Ok(())
    }

    fn start(&mut self, rate_bps: u64, nb_pkts: u64) -> Result<()> {
        if self.running.is_some() {
            return Err(HarnessError::AlreadyRunning);
        }
        let pcap = self.pcap.clone().ok_or_else(|| {
            HarnessError::Configuration("generator parameters not set before start".into())
        })?;
        let cmd = self.start_command(&pcap, rate_bps, nb_pkts);
        self.running = Some(self.host.run(&cmd)?);
        Ok(())
    }

    fn wait_transmission_done(&mut self) -> Result<()> {
        let Some(mut handle) = self.running.take() else {
            return Err(HarnessError::NotRunning);
        };
        let status = handle.exit_status()?;
        // A FAILED LEVEL MAY STILL BE SAVED, SO ITS COUNTS MUST BE REAL TOO
        self.refresh_stats()?;
        if status != 0 {
            return Err(HarnessError::Transmission(format!(
                "generator exited with status {}", status
            )));
        }
        Ok(())
    }

    fn watch_for(&mut self, timeout: Duration) -> Result<()> {
        if let Some(handle) = self.running.as_mut() {
            handle.watch_for(timeout)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(mut handle) = self.running.take() else {
            return Ok(());
        };
        handle.send(CTRL_C)?;
        handle.watch(None, None)?;
        self.refresh_stats()
    }

    fn clean_stats(&mut self) {
        self.stats = GenStats::default();
    }

    fn sent_count(&self) -> u64 {
        self.stats.sent
    }

    fn received_count(&self) -> u64 {
        self.stats.received
    }

    fn rx_throughput(&self) -> f64 {
        self.stats.rx_goodput_mbps * 1e6
    }

    fn histogram_capture(&self) -> bool {
        self.rtt_hist
    }

    fn set_histogram_capture(&mut self, enabled: bool) {
        self.rtt_hist = enabled;
    }

    fn fetch_histogram(&mut self, local: &Path) -> Result<()> {
        self.host.fetch(REMOTE_HIST, local)
    }
}
