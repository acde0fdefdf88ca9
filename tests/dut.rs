// LOADSWEEP DUT CONTROLLER TESTS
// STATE MACHINE, HARDWARE WRITE SUPPRESSION, DDIO MASKS, INTERRUPT PATH.
//
// EVERY COMMAND GOES TO A FakeHost, SO NO HARDWARE IS TOUCHED.

mod common;

use loadsweep::dut::{DutState, EnsoEcho, EnsoMaglev, NicTool};
use loadsweep::error::HarnessError;

use common::{dut_with, echo_dut, FakeHost, Startup, CHANGE_DDIO, ECHO_CMD, SET_CLOCK};

// === CLOCK ===

#[test]
fn same_clock_twice_writes_once() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_clock(2_000_000);
    dut.apply_clock_to_cores(1).unwrap();
    dut.set_clock(2_000_000);
    dut.apply_clock_to_cores(1).unwrap();

    assert_eq!(host.count(SET_CLOCK), 1);
    assert_eq!(host.commands(), vec![format!("{} 2000000 0", SET_CLOCK)]);
}

#[test]
fn clock_written_per_core() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_clock(2_000_000);
    dut.apply_clock_to_cores(2).unwrap();
    assert_eq!(host.count(SET_CLOCK), 2);

    // CORES 0-1 CACHED, ONLY CORE 2 IS NEW
    dut.apply_clock_to_cores(3).unwrap();
    assert_eq!(host.count(SET_CLOCK), 3);
    assert_eq!(host.count(&format!("{} 2000000 2", SET_CLOCK)), 1);

    dut.set_clock(1_500_000);
    dut.apply_clock_to_cores(3).unwrap();
    assert_eq!(host.count(&format!("{} 1500000", SET_CLOCK)), 3);
}

#[test]
fn stop_resets_clock_and_next_start_reapplies() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.start(1, 2, 0).unwrap();
    dut.wait_ready().unwrap();
    dut.stop().unwrap();
    assert_eq!(host.count(&format!("{} 0 0", SET_CLOCK)), 1);
    assert_eq!(dut.clock().applied(0), Some(0));

    dut.start(1, 2, 0).unwrap();
    assert_eq!(host.count(&format!("{} 3100000 0", SET_CLOCK)), 2);
}

// === DDIO ===

#[test]
fn four_of_eleven_ways_sets_top_bits() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_cache_ways(4).unwrap();

    assert_eq!(
        host.commands(),
        vec![format!("{} 0x17 1", CHANGE_DDIO), "sudo wrmsr 0xc8b 0x780".to_string()]
    );
}

#[test]
fn zero_ways_disables_without_mask_write() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_cache_ways(0).unwrap();

    assert_eq!(host.commands(), vec![format!("{} 0x17 0", CHANGE_DDIO)]);
    assert_eq!(host.count("wrmsr"), 0);
}

#[test]
fn all_ways_is_full_mask() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_cache_ways(11).unwrap();

    assert_eq!(host.count("sudo wrmsr 0xc8b 0x7ff"), 1);
}

#[test]
fn unchanged_ways_not_rewritten() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.set_cache_ways(4).unwrap();
    dut.set_cache_ways(4).unwrap();
    dut.start(1, 1, 0).unwrap();

    assert_eq!(host.count(CHANGE_DDIO), 1);
    assert_eq!(host.count("wrmsr"), 1);
}

#[test]
fn too_many_ways_is_configuration_error() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    let err = dut.set_cache_ways(12).unwrap_err();
    assert!(matches!(err, HarnessError::Configuration(_)));
    assert!(host.commands().is_empty());
}

#[test]
fn failed_ddio_command_aborts_before_mask() {
    let host = FakeHost::new("dut");
    host.fail_on(CHANGE_DDIO, 1);
    let mut dut = echo_dut(&host);

    let err = dut.set_cache_ways(4).unwrap_err();
    assert!(matches!(err, HarnessError::DeviceCommand { status: 1, .. }));
    assert_eq!(host.count("wrmsr"), 0);
}

// === STATE MACHINE ===

#[test]
fn start_applies_settings_then_launches() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.start(1, 2, 0).unwrap();
    assert_eq!(dut.state(), DutState::Starting);

    let cmds = host.commands();
    assert_eq!(cmds.last().unwrap(), &format!("{} 1 2 0", ECHO_CMD));
    let clock = cmds.iter().position(|c| c.starts_with(SET_CLOCK)).unwrap();
    let launch = cmds.len() - 1;
    assert!(clock < launch);

    dut.wait_ready().unwrap();
    assert_eq!(dut.state(), DutState::Running);
}

#[test]
fn start_twice_is_already_running() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    dut.start(1, 1, 0).unwrap();
    assert!(matches!(dut.start(1, 1, 0), Err(HarnessError::AlreadyRunning)));

    dut.wait_ready().unwrap();
    assert!(matches!(dut.start(1, 1, 0), Err(HarnessError::AlreadyRunning)));
    assert_eq!(host.count(ECHO_CMD), 1);
}

#[test]
fn stop_is_idempotent() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    // NOTHING RUNNING: NO COMMANDS
    dut.stop().unwrap();
    assert!(host.commands().is_empty());

    dut.start(1, 1, 0).unwrap();
    dut.wait_ready().unwrap();
    dut.stop().unwrap();
    dut.stop().unwrap();

    assert_eq!(dut.state(), DutState::Stopped);
    assert_eq!(host.sent(), vec![b"\x03".to_vec()]);
    assert_eq!(host.count(&format!("{} 0 0", SET_CLOCK)), 1);
}

#[test]
fn wait_ready_when_stopped_fails() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);
    assert!(matches!(dut.wait_ready(), Err(HarnessError::NotRunning)));
}

#[test]
fn early_exit_is_startup_failure() {
    let host = FakeHost::new("dut");
    host.set_startup(Startup::ExitEarly(1));
    let mut dut = echo_dut(&host);

    dut.start(1, 1, 0).unwrap();
    let err = dut.wait_ready().unwrap_err();

    assert!(matches!(err, HarnessError::StartupFailure(ref m) if m.contains("status 1")));
    assert_eq!(dut.state(), DutState::Stopped);
    // BACK TO STOPPED, SO A NEW START IS LEGAL
    host.set_startup(Startup::Ready);
    dut.start(1, 1, 0).unwrap();
}

#[test]
fn interrupt_while_waiting_stops_dut() {
    let host = FakeHost::new("dut");
    host.set_startup(Startup::Hang);
    let (mut dut, interrupt) = dut_with(&host, Box::new(EnsoEcho::new(ECHO_CMD)), 2);

    dut.start(2, 1, 0).unwrap();
    interrupt.store(true, std::sync::atomic::Ordering::Relaxed);
    let err = dut.wait_ready().unwrap_err();

    assert!(matches!(err, HarnessError::Interrupted));
    assert_eq!(dut.state(), DutState::Stopped);
    assert_eq!(host.sent(), vec![b"\x03".to_vec()]);
    assert_eq!(host.count(&format!("{} 0 0,1", SET_CLOCK)), 1);
}

#[test]
fn check_interrupt_between_points() {
    let host = FakeHost::new("dut");
    let (mut dut, interrupt) = dut_with(&host, Box::new(EnsoEcho::new(ECHO_CMD)), 2);

    dut.check_interrupt().unwrap();
    dut.start(1, 1, 0).unwrap();
    dut.wait_ready().unwrap();

    interrupt.store(true, std::sync::atomic::Ordering::Relaxed);
    assert!(matches!(dut.check_interrupt(), Err(HarnessError::Interrupted)));
    assert_eq!(dut.state(), DutState::Stopped);
}

#[test]
fn restart_relaunches_with_prior_params() {
    let host = FakeHost::new("dut");
    let mut dut = echo_dut(&host);

    assert!(matches!(dut.restart(), Err(HarnessError::NotRunning)));

    dut.start(4, 2, 100).unwrap();
    dut.wait_ready().unwrap();
    dut.restart().unwrap();

    assert_eq!(dut.state(), DutState::Running);
    assert_eq!(host.count(&format!("{} 4 2 100", ECHO_CMD)), 2);
    assert_eq!(host.sent().len(), 1);
}

// === BACKEND HOOKS ===

#[test]
fn maglev_programs_fallback_queues() {
    let host = FakeHost::new("dut");
    let backend = EnsoMaglev::new("sudo maglev", NicTool::new("sudo nic_config.sh"), 1000);
    let (mut dut, _) = dut_with(&host, Box::new(backend), 2);

    dut.start(2, 4, 0).unwrap();

    assert_eq!(host.count("sudo nic_config.sh --fallback-queues 8"), 1);
    assert_eq!(host.commands().last().unwrap(), "sudo maglev -l 0-1 -- 2 4 1000");
}

#[test]
fn notif_per_pkt_toggled_around_run() {
    let host = FakeHost::new("dut");
    let backend = EnsoEcho::new(ECHO_CMD).with_notif_per_pkt(NicTool::new("nic"));
    let (mut dut, _) = dut_with(&host, Box::new(backend), 2);

    dut.start(1, 1, 0).unwrap();
    assert_eq!(host.commands().first().unwrap(), "nic --desc-per-pkt 1");

    dut.wait_ready().unwrap();
    dut.stop().unwrap();
    assert_eq!(host.commands().last().unwrap(), "nic --desc-per-pkt 0");
}
