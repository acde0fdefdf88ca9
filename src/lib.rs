// LOADSWEEP -- HARDWARE-IN-THE-LOOP NETWORK BENCHMARK HARNESS
// SWEEPS DUT CONFIGURATIONS, MEASURES ZERO-LOSS THROUGHPUT AND RTT VS LOAD,
// AND RESUMES FROM ITS OWN RESULT LOGS AFTER ANY INTERRUPTION.

pub mod catalog;
pub mod config;
pub mod dut;
pub mod error;
pub mod generator;
pub mod host;
pub mod hw;
pub mod latency;
pub mod measure;
pub mod probe;
pub mod runner;
pub mod setup;
pub mod sweep;

pub use error::{HarnessError, Result};
