// LOADSWEEP CONFIGURATION
// ONE TOML FILE DESCRIBES BOTH HOSTS, THEIR CHECKOUTS, THE DEVICES UNDER
// TEST AND THE CACHE GEOMETRY. EVERY COMMAND PATH IS DERIVED FROM IT.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{HarnessError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "experiment_config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hosts: Hosts,
    pub paths: Paths,
    pub devices: Devices,
    pub extra: Extra,
    pub logs: Logs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hosts {
    pub dut: String,
    pub pktgen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    pub dut_path: String,
    pub pktgen_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Devices {
    pub enso_dut_pcie: String,
    pub dut_fpga_id: String,
    #[serde(default)]
    pub dpdk_dut_pcie: String,
    #[serde(default)]
    pub enso_pktgen_pcie: String,
    #[serde(default)]
    pub dpdk_pktgen_pcie: String,
    #[serde(default)]
    pub enso_pktgen_fpga_id: String,
    #[serde(default)]
    pub dpdk_pktgen_fpga_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Extra {
    pub nb_llc_ways: Option<u32>,
    pub default_nb_ddio_ways: Option<u32>,
    #[serde(default = "default_mem_channels")]
    pub dpdk_mem_channels: u32,
}

fn default_mem_channels() -> u32 {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct Logs {
    pub dut_log: PathBuf,
    pub pktgen_log: PathBuf,
}

// COMMAND LINES DERIVED FROM THE CHECKOUT PATHS ON EACH HOST

#[derive(Debug, Clone)]
pub struct Commands {
    pub dut_enso_path: String,
    pub pktgen_enso_path: String,
    pub enso_echo: String,
    pub enso_echo_prefetch: String,
    pub enso_maglev: String,
    pub dpdk_echo: String,
    pub dpdk_maglev: String,
    pub dut_setup: String,
    pub change_ddio: String,
    pub set_clock: String,
    pub nic_config: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = toml::from_str(&raw).map_err(|e| {
            HarnessError::Configuration(format!("{}: {}", path.display(), e))
        })?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let required = [
            ("hosts.dut", &self.hosts.dut),
            ("hosts.pktgen", &self.hosts.pktgen),
            ("paths.dut_path", &self.paths.dut_path),
            ("paths.pktgen_path", &self.paths.pktgen_path),
            ("devices.enso_dut_pcie", &self.devices.enso_dut_pcie),
            ("devices.dut_fpga_id", &self.devices.dut_fpga_id),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(HarnessError::Configuration(format!(
                    "must define {} in {}", key, path.display()
                )));
            }
        }

        let llc = self.nb_llc_ways()?;
        let ddio = self.default_nb_ddio_ways()?;
        if ddio > llc {
            return Err(HarnessError::Configuration(format!(
                "extra.default_nb_ddio_ways ({}) exceeds extra.nb_llc_ways ({})", ddio, llc
            )));
        }
        Ok(())
    }

    pub fn nb_llc_ways(&self) -> Result<u32> {
        self.extra.nb_llc_ways.ok_or_else(|| {
            HarnessError::Configuration("must define extra.nb_llc_ways".into())
        })
    }

    pub fn default_nb_ddio_ways(&self) -> Result<u32> {
        self.extra.default_nb_ddio_ways.ok_or_else(|| {
            HarnessError::Configuration("must define extra.default_nb_ddio_ways".into())
        })
    }

    pub fn commands(&self) -> Commands {
        let dut = self.paths.dut_path.trim_end_matches('/');
        let pktgen = self.paths.pktgen_path.trim_end_matches('/');
        let dut_enso = format!("{}/enso", dut);
        let maglev = format!("{}/maglev/build_release/bin", dut);
        let tools = format!("{}/tools", dut);
        Commands {
            enso_echo: format!("sudo {}/build/software/examples/echo", dut_enso),
            enso_echo_prefetch: format!("sudo {}/build/software/examples/echo_prefetch", dut_enso),
            enso_maglev: format!("sudo {}/enso_maglev", maglev),
            dpdk_echo: format!("sudo {}/dpdk_echo/build_release/bin/dpdk_echo", dut),
            dpdk_maglev: format!("sudo {}/dpdk_maglev", maglev),
            dut_setup: format!("{}/dut_setup.sh", dut),
            change_ddio: format!("sudo {}/ddio-bench/change-ddio", tools),
            set_clock: format!("sudo {}/set-clock", tools),
            nic_config: format!("sudo {}/scripts/nic_config.sh", dut_enso),
            pktgen_enso_path: format!("{}/enso", pktgen),
            dut_enso_path: dut_enso,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[hosts]
dut = "dut-host"
pktgen = "pktgen-host"

[paths]
dut_path = "/home/user/eval/"
pktgen_path = "/home/user/eval"

[devices]
enso_dut_pcie = "0000:17:00.0"
dut_fpga_id = "1-13"
dpdk_dut_pcie = "0000:65:00.0"

[extra]
nb_llc_ways = 11
default_nb_ddio_ways = 2

[logs]
dut_log = "dut.log"
pktgen_log = "pktgen.log"
"#;

    fn write(content: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_sample() {
        let f = write(SAMPLE);
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.nb_llc_ways().unwrap(), 11);
        assert_eq!(cfg.default_nb_ddio_ways().unwrap(), 2);
        assert_eq!(cfg.extra.dpdk_mem_channels, 4);
    }

    #[test]
    fn derived_commands_strip_trailing_slash() {
        let f = write(SAMPLE);
        let cmds = Config::load(f.path()).unwrap().commands();
        assert_eq!(cmds.enso_echo, "sudo /home/user/eval/enso/build/software/examples/echo");
        assert_eq!(cmds.change_ddio, "sudo /home/user/eval/tools/ddio-bench/change-ddio");
        assert_eq!(cmds.pktgen_enso_path, "/home/user/eval/enso");
    }

    #[test]
    fn empty_host_is_rejected() {
        let f = write(&SAMPLE.replace("dut = \"dut-host\"", "dut = \"\""));
        let err = Config::load(f.path()).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(ref m) if m.contains("hosts.dut")));
    }

    #[test]
    fn missing_host_key_is_configuration_error() {
        let f = write(&SAMPLE.replace("dut = \"dut-host\"\n", ""));
        let err = Config::load(f.path()).unwrap_err();
        assert!(matches!(err, HarnessError::Configuration(ref m) if m.contains("missing field")));
    }

    #[test]
    fn missing_devices_table_is_configuration_error() {
        let devices = "[devices]\nenso_dut_pcie = \"0000:17:00.0\"\ndut_fpga_id = \"1-13\"\ndpdk_dut_pcie = \"0000:65:00.0\"\n";
        assert!(SAMPLE.contains(devices));
        let f = write(&SAMPLE.replace(devices, ""));
        assert!(matches!(Config::load(f.path()), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn missing_llc_ways_is_rejected() {
        let f = write(&SAMPLE.replace("nb_llc_ways = 11\n", ""));
        assert!(matches!(Config::load(f.path()), Err(HarnessError::Configuration(_))));
    }

    #[test]
    fn ddio_above_llc_is_rejected() {
        let f = write(&SAMPLE.replace("default_nb_ddio_ways = 2", "default_nb_ddio_ways = 12"));
        assert!(matches!(Config::load(f.path()), Err(HarnessError::Configuration(_))));
    }
}
