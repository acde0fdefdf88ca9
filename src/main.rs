// LOADSWEEP v1.0.0 -- NETWORK DUT BENCHMARK HARNESS
// DRIVES THE DUT AND THE TRAFFIC GENERATOR OVER SSH, ONE SWEEP POINT AT A TIME
//
// RESULTS ARE APPEND-ONLY CSV FILES UNDER DATA_DIR. RE-RUNNING THE SAME
// COMMAND AFTER A CRASH OR CTRL+C MEASURES ONLY WHAT IS MISSING.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing::level_filters::LevelFilter;

use loadsweep::catalog::{self, CatalogContext, DpdkType};
use loadsweep::config::{Config, DEFAULT_CONFIG_FILE};
use loadsweep::generator::EnsoGen;
use loadsweep::host::{open_log, Host, ShellHost};
use loadsweep::runner::{ConsoleReporter, ExperimentRunner};
use loadsweep::setup::{self, NicImage, Startup, SyncTarget};

#[derive(Parser)]
#[command(name = "loadsweep")]
#[command(about = "LOADSWEEP -- RESUMABLE THROUGHPUT AND LATENCY SWEEPS AGAINST A NETWORK DUT")]
struct Cli {
    // WHERE RESULT LOGS AND HISTOGRAMS ARE WRITTEN (CREATED IF MISSING)
    data_dir: PathBuf,

    // RELOAD THE NIC BITSTREAMS BEFORE RUNNING (DEFAULT)
    #[arg(long, overrides_with = "no_load_bitstream")]
    load_bitstream: bool,

    // KEEP WHATEVER IMAGE THE NICS ARE RUNNING
    #[arg(long)]
    no_load_bitstream: bool,

    // RUN THE DPDK CATALOG INSTEAD OF THE ENSO ONE
    #[arg(long, value_enum, ignore_case = true)]
    dpdk: Option<DpdkType>,

    // ONLY RUN EXPERIMENTS WHOSE NAME CONTAINS ONE OF THESE (REPEATABLE)
    #[arg(short = 'f', long = "filter")]
    filter: Vec<String>,

    // ITERATIONS PER THROUGHPUT EXPERIMENT
    #[arg(short = 'i', long = "iters", default_value_t = 1)]
    iters: u32,

    #[arg(short = 'c', long = "config-file", default_value = DEFAULT_CONFIG_FILE)]
    config_file: PathBuf,

    // RSYNC THE CHECKOUT TO BOTH HOSTS AND RUN ITS SETUP (DEFAULT)
    #[arg(long, overrides_with = "no_sync")]
    sync: bool,

    #[arg(long)]
    no_sync: bool,

    // STOP AFTER SYNC
    #[arg(long)]
    setup_only: bool,

    // DEBUG-LEVEL LOGGING
    #[arg(long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::INFO })
        .with_target(false)
        .init();

    // FIRST CTRL+C: STOP THE DUT AT THE NEXT SAFE POINT. SECOND: BAIL OUT.
    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let interrupt = Arc::clone(&interrupt);
        ctrlc::set_handler(move || {
            if interrupt.swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })?;
    }

    let load_bitstream = !cli.no_load_bitstream;
    let sync = !cli.no_sync;

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("cannot create {}", cli.data_dir.display()))?;
    let config = Config::load(&cli.config_file)
        .with_context(|| format!("loading {}", cli.config_file.display()))?;

    println!("LOADSWEEP v1.0.0");
    println!("DATA DIR:        {}", cli.data_dir.display());
    println!("CONFIG:          {}", cli.config_file.display());
    println!("DUT HOST:        {}", config.hosts.dut);
    println!("PKTGEN HOST:     {}", config.hosts.pktgen);
    println!("FAMILY:          {}", cli.dpdk.map_or("enso", DpdkType::as_str));
    println!("ITERATIONS:      {}", cli.iters);
    println!("LOAD BITSTREAM:  {}", load_bitstream);
    println!("SYNC:            {}", sync);
    if !cli.filter.is_empty() {
        println!("FILTERS:         {}", cli.filter.join(" | "));
    }
    println!();

    let dut_log = open_log(&config.logs.dut_log)
        .with_context(|| format!("opening {}", config.logs.dut_log.display()))?;
    let pktgen_log = open_log(&config.logs.pktgen_log)
        .with_context(|| format!("opening {}", config.logs.pktgen_log.display()))?;

    let dut_host: Arc<dyn Host> = Arc::new(ShellHost::new(&config.hosts.dut, dut_log.clone()));
    let pktgen_host: Arc<dyn Host> = Arc::new(ShellHost::new(&config.hosts.pktgen, pktgen_log));

    if sync {
        let local = ShellHost::new("localhost", dut_log);
        let local_root = std::env::current_dir()?;
        let targets = [
            SyncTarget { host: dut_host.as_ref(), path: config.paths.dut_path.clone() },
            SyncTarget { host: pktgen_host.as_ref(), path: config.paths.pktgen_path.clone() },
        ];
        setup::sync_remotes(&local, &local_root, &targets).context("syncing remote checkouts")?;
        info!("remote checkouts ready");
    } else {
        warn!("skipping remote sync");
    }

    if cli.setup_only {
        println!("SETUP DONE.");
        return Ok(());
    }

    let commands = config.commands();
    let devices = &config.devices;
    let (pktgen_fpga, pktgen_pcie) = match cli.dpdk {
        Some(_) => (&devices.dpdk_pktgen_fpga_id, &devices.dpdk_pktgen_pcie),
        None => (&devices.enso_pktgen_fpga_id, &devices.enso_pktgen_pcie),
    };

    let startup = Startup {
        dut_host: dut_host.as_ref(),
        pktgen_host: pktgen_host.as_ref(),
        pktgen_nic: NicImage::new(pktgen_fpga, &commands.pktgen_enso_path),
        setup_cmd: format!("{} {}", commands.dut_setup, devices.dpdk_dut_pcie),
        load_bitstream,
    };
    let prepared = match cli.dpdk {
        Some(_) => startup.dpdk(),
        None => startup.enso(&NicImage::new(&devices.dut_fpga_id, &commands.dut_enso_path)),
    };
    prepared.context("preparing devices")?;
    info!("devices ready");

    let mut pktgen = EnsoGen::new(Arc::clone(&pktgen_host), &commands.pktgen_enso_path, pktgen_pcie);

    let ctx = CatalogContext::new(config, &cli.data_dir, cli.iters, dut_host, interrupt);
    let experiments = match cli.dpdk {
        Some(ty) => catalog::dpdk_experiments(&ctx, ty)?,
        None => catalog::enso_experiments(&ctx)?,
    };

    let mut runner = ExperimentRunner::new();
    runner.add_filtered(experiments, &cli.filter);
    if runner.is_empty() {
        println!("NO EXPERIMENT MATCHES THE FILTERS.");
        return Ok(());
    }
    for name in runner.names() {
        println!("  - {}", name);
    }
    println!();

    let mut reporter = ConsoleReporter::new();
    runner
        .run(&mut pktgen, &mut reporter)
        .context("running experiments")?;

    reporter.println("LOADSWEEP OUT.");
    Ok(())
}
