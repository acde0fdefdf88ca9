// LOADSWEEP STARTUP
// EVERYTHING THAT HAPPENS BEFORE THE FIRST EXPERIMENT: SYNC THE CHECKOUTS ON
// BOTH HOSTS, LOAD THE NIC IMAGES, RUN THE DUT SETUP SCRIPT.
//
// THE DUT AND THE GENERATOR ARE PHYSICALLY INDEPENDENT, SO THEIR PREPARATION
// RUNS ON SCOPED THREADS. ALL THREADS ARE JOINED BEFORE ANY ERROR IS RETURNED.

use std::path::Path;
use std::thread::ScopedJoinHandle;

use tracing::info;

use crate::error::Result;
use crate::host::{run_checked, Host};

// JOIN A SCOPED TASK. A PANIC IN THE TASK IS RE-RAISED HERE.
fn join<T>(handle: ScopedJoinHandle<'_, Result<T>>) -> Result<T> {
    match handle.join() {
        Ok(result) => result,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

// ---------------------------------------------------------------------------
// NIC IMAGES
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NicImage {
    pub fpga_id: String,
    pub enso_path: String,
}

impl NicImage {
    pub fn new(fpga_id: &str, enso_path: &str) -> Self {
        Self {
            fpga_id: fpga_id.to_string(),
            enso_path: enso_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn load_command(&self) -> String {
        format!("{}/scripts/load_bitstream.sh {}", self.enso_path, self.fpga_id)
    }

    pub fn config_command(&self) -> String {
        format!("sudo {}/scripts/nic_config.sh --defaults", self.enso_path)
    }

    // WITHOUT A RELOAD THE NIC KEEPS ITS CURRENT IMAGE AND CONFIGURATION
    pub fn load(&self, host: &dyn Host, load_bitstream: bool) -> Result<()> {
        if !load_bitstream {
            info!(host = host.name(), fpga = %self.fpga_id, "keeping loaded NIC image");
            return Ok(());
        }
        info!(host = host.name(), fpga = %self.fpga_id, "loading NIC image");
        run_checked(host, &self.load_command())?;
        run_checked(host, &self.config_command())?;
        info!(host = host.name(), "NIC image loaded");
        Ok(())
    }
}

pub struct Startup<'a> {
    pub dut_host: &'a dyn Host,
    pub pktgen_host: &'a dyn Host,
    pub pktgen_nic: NicImage,
    pub setup_cmd: String,
    pub load_bitstream: bool,
}

impl Startup<'_> {
    fn run_dut_setup(&self) -> Result<()> {
        info!(host = self.dut_host.name(), "running DUT setup");
        run_checked(self.dut_host, &self.setup_cmd)
    }

    fn load_pktgen(&self) -> Result<()> {
        self.pktgen_nic.load(self.pktgen_host, self.load_bitstream)
    }

    // ENSO DUT: LOAD THE DUT NIC, THEN RUN SETUP. THE GENERATOR NIC LOADS
    // ALONGSIDE BOTH.
    pub fn enso(&self, dut_nic: &NicImage) -> Result<()> {
        std::thread::scope(|s| {
            let pktgen = s.spawn(|| self.load_pktgen());
            let dut = dut_nic
                .load(self.dut_host, self.load_bitstream)
                .and_then(|()| self.run_dut_setup());
            first_error(vec![dut, join(pktgen)])
        })
    }

    // DPDK DUT: NOTHING TO LOAD ON THE DUT SIDE
    pub fn dpdk(&self) -> Result<()> {
        std::thread::scope(|s| {
            let pktgen = s.spawn(|| self.load_pktgen());
            let dut = self.run_dut_setup();
            first_error(vec![dut, join(pktgen)])
        })
    }
}

// ---------------------------------------------------------------------------
// REMOTE SYNC
// ---------------------------------------------------------------------------

pub struct SyncTarget<'a> {
    pub host: &'a dyn Host,
    pub path: String,
}

pub fn rsync_command(local_root: &Path, hostname: &str, remote_path: &str) -> String {
    format!(
        "rsync -rlptz --exclude .git --filter=':- .gitignore' {}/ {}:{}",
        local_root.display(),
        hostname,
        remote_path.trim_end_matches('/')
    )
}

fn sync_one(local: &dyn Host, local_root: &Path, target: &SyncTarget<'_>) -> Result<()> {
    let path = target.path.trim_end_matches('/');
    info!(host = target.host.name(), path, "syncing checkout");
    run_checked(target.host, &format!("mkdir -p {}", path))?;
    run_checked(local, &rsync_command(local_root, target.host.name(), path))?;
    run_checked(target.host, &format!("{}/enso/setup.sh", path))?;
    info!(host = target.host.name(), "checkout ready");
    Ok(())
}

// ONE THREAD PER HOST: COPY THE LOCAL CHECKOUT OVER, THEN RUN ITS SETUP
pub fn sync_remotes(local: &dyn Host, local_root: &Path, targets: &[SyncTarget<'_>]) -> Result<()> {
    std::thread::scope(|s| {
        let handles: Vec<_> = targets
            .iter()
            .map(|t| s.spawn(move || sync_one(local, local_root, t)))
            .collect();
        first_error(handles.into_iter().map(join).collect())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsync_targets_remote_checkout() {
        let cmd = rsync_command(Path::new("/src/eval"), "dut-host", "/home/user/eval/");
        assert_eq!(
            cmd,
            "rsync -rlptz --exclude .git --filter=':- .gitignore' /src/eval/ dut-host:/home/user/eval"
        );
    }

    #[test]
    fn nic_commands() {
        let nic = NicImage::new("1-13", "/home/user/eval/enso/");
        assert_eq!(nic.load_command(), "/home/user/eval/enso/scripts/load_bitstream.sh 1-13");
        assert_eq!(nic.config_command(), "sudo /home/user/eval/enso/scripts/nic_config.sh --defaults");
    }
}
