// LOADSWEEP HARDWARE SETTINGS
// CORE CLOCKS AND DDIO WAY ALLOCATION ON THE DUT HOST.
// EACH RESOURCE CACHES THE LAST VALUE WRITTEN TO IT. A WRITE IS ISSUED ONLY
// WHEN THE TARGET DIFFERS FROM THE CACHED VALUE FOR THAT RESOURCE ID.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::host::{run_checked, Host};

// FREQUENCY CHANGES LEAVE A TRANSIENT PERFORMANCE DIP ON THE AFFECTED CORES
pub const CLOCK_SETTLE: Duration = Duration::from_secs(5);

// CLOCK VALUE THAT RESETS A CORE TO ITS MAXIMUM FREQUENCY
pub const CLOCK_MAX: u32 = 0;

const DDIO_WAYS_MSR: &str = "0xc8b";

// LAST VALUE APPLIED PER RESOURCE ID (CORE INDEX, PCI BUS)
#[derive(Debug)]
pub struct AppliedSetting<K, V> {
    applied: HashMap<K, V>,
}

impl<K: Eq + Hash, V: PartialEq> AppliedSetting<K, V> {
    pub fn new() -> Self {
        Self { applied: HashMap::new() }
    }

    pub fn needs_write(&self, id: &K, target: &V) -> bool {
        self.applied.get(id) != Some(target)
    }

    pub fn record(&mut self, id: K, value: V) {
        self.applied.insert(id, value);
    }

    pub fn get(&self, id: &K) -> Option<&V> {
        self.applied.get(id)
    }
}

impl<K: Eq + Hash, V: PartialEq> Default for AppliedSetting<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// CLOCK
// ---------------------------------------------------------------------------

pub struct ClockManager {
    cmd: String,
    settle: Duration,
    target: u32,
    cores: AppliedSetting<u32, u32>,
}

impl ClockManager {
    pub fn new(cmd: &str, target: u32) -> Self {
        Self {
            cmd: cmd.to_string(),
            settle: CLOCK_SETTLE,
            target,
            cores: AppliedSetting::new(),
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn set_target(&mut self, freq: u32) {
        self.target = freq;
    }

    pub fn applied(&self, core: u32) -> Option<u32> {
        self.cores.get(&core).copied()
    }

    // APPLY THE TARGET TO CORES 0..nb_cores. SLEEPS ONCE IF ANY CORE CHANGED.
    pub fn apply(&mut self, host: &dyn Host, nb_cores: u32) -> Result<()> {
        let mut changed = false;
        for core in 0..nb_cores {
            if !self.cores.needs_write(&core, &self.target) {
                continue;
            }
            set_host_clock(host, &self.cmd, self.target, &[core])?;
            self.cores.record(core, self.target);
            changed = true;
        }
        if changed && !self.settle.is_zero() {
            debug!(settle_ms = self.settle.as_millis() as u64, "waiting for clock to settle");
            std::thread::sleep(self.settle);
        }
        Ok(())
    }

    // RESET THE GIVEN CORES TO MAXIMUM. THE CACHE FOLLOWS THE HARDWARE.
    pub fn reset(&mut self, host: &dyn Host, nb_cores: u32) -> Result<()> {
        if nb_cores == 0 {
            return Ok(());
        }
        let cores: Vec<u32> = (0..nb_cores).collect();
        set_host_clock(host, &self.cmd, CLOCK_MAX, &cores)?;
        for core in cores {
            self.cores.record(core, CLOCK_MAX);
        }
        Ok(())
    }
}

pub fn clock_command(cmd: &str, freq: u32, cores: &[u32]) -> String {
    let list: Vec<String> = cores.iter().map(|c| c.to_string()).collect();
    format!("{} {} {}", cmd, freq, list.join(","))
}

fn set_host_clock(host: &dyn Host, cmd: &str, freq: u32, cores: &[u32]) -> Result<()> {
    run_checked(host, &clock_command(cmd, freq, cores))
}

// ---------------------------------------------------------------------------
// DDIO WAYS
// ---------------------------------------------------------------------------

// MASK OF WIDTH total_ways WITH THE `ways` HIGHEST-ORDER BITS SET
pub fn ddio_mask(ways: u32, total_ways: u32) -> u64 {
    if ways == 0 || total_ways == 0 {
        return 0;
    }
    let full = if total_ways >= 64 { u64::MAX } else { (1u64 << total_ways) - 1 };
    let shift = total_ways.saturating_sub(ways);
    (full << shift) & full
}

// "0000:17:00.0" AND "17:00.0" BOTH YIELD "17"
pub fn pcie_bus(addr: &str) -> Result<String> {
    let parts: Vec<&str> = addr.trim().split(':').collect();
    if parts.len() < 2 || parts[parts.len() - 2].is_empty() {
        return Err(HarnessError::Configuration(format!("bad PCIe address \"{}\"", addr)));
    }
    let bus = parts[parts.len() - 2];
    Ok(bus.rsplit("0x").next().unwrap_or(bus).to_string())
}

pub struct DdioManager {
    change_cmd: String,
    total_ways: u32,
    target: u32,
    buses: AppliedSetting<String, u32>,
}

impl DdioManager {
    pub fn new(change_cmd: &str, total_ways: u32, target: u32) -> Result<Self> {
        check_ways(target, total_ways)?;
        Ok(Self {
            change_cmd: change_cmd.to_string(),
            total_ways,
            target,
            buses: AppliedSetting::new(),
        })
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn set_target(&mut self, ways: u32) -> Result<()> {
        check_ways(ways, self.total_ways)?;
        self.target = ways;
        Ok(())
    }

    pub fn apply(&mut self, host: &dyn Host, pcie_addr: &str) -> Result<()> {
        let bus = pcie_bus(pcie_addr)?;
        if !self.buses.needs_write(&bus, &self.target) {
            return Ok(());
        }
        set_ddio_ways(host, &self.change_cmd, &bus, self.target, self.total_ways)?;
        self.buses.record(bus, self.target);
        Ok(())
    }
}

fn check_ways(ways: u32, total_ways: u32) -> Result<()> {
    if ways > total_ways {
        return Err(HarnessError::Configuration(format!(
            "cannot set number of DDIO ways to {}, only {} available", ways, total_ways
        )));
    }
    Ok(())
}

// ways == 0 DISABLES DDIO AND SKIPS THE MASK WRITE
fn set_ddio_ways(host: &dyn Host, change_cmd: &str, bus: &str, ways: u32, total_ways: u32)
    -> Result<()>
{
    let enable = u32::from(ways > 0);
    run_checked(host, &format!("{} 0x{} {}", change_cmd, bus, enable))?;
    if ways == 0 {
        info!(bus, "DDIO disabled");
        return Ok(());
    }
    let mask = ddio_mask(ways, total_ways);
    run_checked(host, &format!("sudo wrmsr {} {:#x}", DDIO_WAYS_MSR, mask))?;
    info!(bus, ways, mask = format!("{:#x}", mask), "DDIO ways set");
    Ok(())
}
