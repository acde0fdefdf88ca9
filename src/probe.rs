// LOADSWEEP ZERO-LOSS PROBE
// BINARY SEARCH FOR THE HIGHEST OFFERED RATE THAT COMES BACK WITHOUT LOSS.
// EACH PROBE SENDS ENOUGH PACKETS TO HOLD THE RATE FOR A FIXED WINDOW.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::generator::{packets_for, Generator};

pub const DEFAULT_MAX_RATE: u64 = 100_000_000_000;    // 100 GBPS
pub const DEFAULT_PRECISION: u64 = 100_000_000;       // 100 MBPS
pub const DEFAULT_WARMUP: Duration = Duration::from_secs(5);
pub const PROBE_DURATION: Duration = Duration::from_secs(1);

// FIXED-LENGTH BURST AT max_rate. LOSS DURING WARMUP IS EXPECTED AND IGNORED.
pub fn warmup<G: Generator + ?Sized>(
    gen: &mut G,
    pkt_size: u32,
    max_rate: u64,
    duration: Duration,
) -> Result<()> {
    let nb_pkts = packets_for(max_rate, pkt_size, duration);
    if nb_pkts == 0 {
        return Ok(());
    }
    gen.start(max_rate, nb_pkts)?;
    match gen.wait_transmission_done() {
        Ok(()) => Ok(()),
        Err(e) if e.is_transmission() => {
            debug!(error = %e, "loss during warmup");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

// ONE PROBE: true IFF EVERY PACKET SENT CAME BACK
fn lossless_at<G: Generator + ?Sized>(
    gen: &mut G,
    pkt_size: u32,
    rate: u64,
    duration: Duration,
) -> Result<bool> {
    let nb_pkts = packets_for(rate, pkt_size, duration);
    if nb_pkts == 0 {
        return Ok(true);
    }
    gen.clean_stats();
    gen.start(rate, nb_pkts)?;
    match gen.wait_transmission_done() {
        Ok(()) => {}
        Err(e) if e.is_transmission() => return Ok(false),
        Err(e) => return Err(e),
    }
    let sent = gen.sent_count();
    let received = gen.received_count();
    if received > sent {
        return Err(HarnessError::MeasurementIntegrity { sent, received });
    }
    debug!(rate, sent, received, "probe");
    Ok(received == sent && sent > 0)
}

pub fn zero_loss_throughput<G: Generator + ?Sized>(
    gen: &mut G,
    pkt_size: u32,
    max_rate: u64,
    precision: u64,
    duration: Duration,
) -> Result<u64> {
    let precision = precision.max(1);

    if lossless_at(gen, pkt_size, max_rate, duration)? {
        info!(rate = max_rate, "zero loss at maximum rate");
        return Ok(max_rate);
    }

    let mut lo = 0u64;
    let mut hi = max_rate;
    while hi - lo > precision {
        let mid = lo + (hi - lo) / 2;
        if lossless_at(gen, pkt_size, mid, duration)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    info!(rate = lo, "zero-loss throughput");
    Ok(lo)
}
