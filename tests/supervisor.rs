#![cfg(target_family = "unix")]

use assert_matches::assert_matches;
use proc_watchdog::logging::session::SessionLog;
use proc_watchdog::supervisor::{
    ExitClassification, MaxRestarts, RestartPolicy, StopReason, SupervisedCommand, Supervisor,
    SupervisorConfig,
};
use rstest::rstest;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn sh(script: &str) -> SupervisedCommand {
    SupervisedCommand::new(PathBuf::from("sh"))
        .with_args(vec!["-c".to_string(), script.to_string()])
}

fn messages(log: &SessionLog) -> Vec<String> {
    fs::read_to_string(log.path())
        .unwrap()
        .lines()
        .filter_map(|line| line.splitn(3, " - ").nth(2))
        .map(str::to_string)
        .collect()
}

fn launches(messages: &[String]) -> usize {
    messages
        .iter()
        .filter(|m| m.starts_with("Starting process (attempt #"))
        .count()
}

#[rstest]
#[case::no_restarts(0)]
#[case::one_restart(1)]
#[case::three_restarts(3)]
fn always_failing_child_restarts_exactly_max_times(#[case] max_restarts: u32) {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("exit 1"),
        RestartPolicy::new(Duration::ZERO).with_max_restarts(MaxRestarts::Limited(max_restarts)),
    );

    let outcome = Supervisor::new(config, log.clone()).unwrap().run();
    drop(guard);

    assert_eq!(StopReason::RestartLimitExceeded, outcome.reason);
    assert_eq!(max_restarts, outcome.restarts);
    assert_eq!(1, outcome.exit_code());
    assert_matches!(outcome.last_exit, ExitClassification::Exited(status) if status.code() == Some(1));
    assert_eq!(max_restarts as usize + 1, launches(&messages(&log)));
}

#[test]
fn restart_delay_is_honoured_between_launches() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("exit 1"),
        RestartPolicy::new(Duration::from_secs(1)).with_max_restarts(MaxRestarts::Limited(2)),
    );

    let timer = Instant::now();
    let outcome = Supervisor::new(config, log.clone()).unwrap().run();
    let elapsed = timer.elapsed();
    drop(guard);

    assert_eq!(StopReason::RestartLimitExceeded, outcome.reason);
    assert_eq!(2, outcome.restarts);
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "elapsed {elapsed:?}");

    let messages = messages(&log);
    assert_eq!(3, launches(&messages));
    assert!(messages.contains(&"Waiting 1.0s before restart #1".to_string()));
    assert!(messages.contains(&"Waiting 1.0s before restart #2".to_string()));
    assert!(messages.contains(&"Maximum restart limit (2) reached, giving up".to_string()));
}

#[test]
fn shutdown_stops_a_running_child_gracefully() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(sh("sleep 1000"), RestartPolicy::default())
        .with_grace_period(Duration::from_secs(2));

    let supervisor = Supervisor::new(config, log.clone()).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        shutdown.request_shutdown();
    });

    let timer = Instant::now();
    let outcome = supervisor.run();
    let elapsed = timer.elapsed();
    signaller.join().unwrap();
    drop(guard);

    assert_eq!(StopReason::ShutdownRequested, outcome.reason);
    assert_eq!(0, outcome.restarts);
    assert_eq!(0, outcome.exit_code());
    assert_matches!(outcome.last_exit, ExitClassification::Exited(status) if status.signal() == Some(15));
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
    assert_eq!(1, launches(&messages(&log)));
}

#[test]
fn shutdown_interrupts_the_restart_delay() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(sh("exit 1"), RestartPolicy::new(Duration::from_secs(30)));

    let supervisor = Supervisor::new(config, log.clone()).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        shutdown.request_shutdown();
    });

    let timer = Instant::now();
    let outcome = supervisor.run();
    signaller.join().unwrap();
    drop(guard);

    assert!(timer.elapsed() < Duration::from_secs(5));
    assert_eq!(StopReason::ShutdownRequested, outcome.reason);
    assert_eq!(0, outcome.restarts);
    assert_eq!(1, launches(&messages(&log)));
}

#[test]
fn test_mode_launches_once_regardless_of_status() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("exit 7"),
        RestartPolicy::default().with_test_mode(true),
    );

    let outcome = Supervisor::new(config, log.clone()).unwrap().run();
    drop(guard);

    assert_eq!(StopReason::TestCompleted, outcome.reason);
    assert_eq!(0, outcome.exit_code());
    assert!(outcome.into_result().is_ok());
    assert_eq!(1, launches(&messages(&log)));
}

#[test]
fn child_ignoring_sigterm_is_killed_after_the_grace_period() {
    let tmp = tempdir().unwrap();
    let (log, _guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("trap '' TERM; while true; do sleep 1; done"),
        RestartPolicy::default(),
    )
    .with_grace_period(Duration::from_millis(500));

    let supervisor = Supervisor::new(config, log).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        shutdown.request_shutdown();
    });

    let outcome = supervisor.run();
    signaller.join().unwrap();

    assert_eq!(StopReason::ShutdownRequested, outcome.reason);
    assert_matches!(outcome.last_exit, ExitClassification::Exited(status) if status.signal() == Some(9));
}

#[cfg(target_os = "linux")]
#[test]
fn shutdown_leaves_no_grandchild_running() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("sleep 1000 & echo \"grandchild $!\"; wait"),
        RestartPolicy::default(),
    )
    .with_grace_period(Duration::from_secs(1));

    let supervisor = Supervisor::new(config, log.clone()).unwrap();
    let shutdown = supervisor.shutdown_handle();
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        shutdown.request_shutdown();
    });

    supervisor.run();
    signaller.join().unwrap();
    drop(guard);

    let grandchild = messages(&log)
        .iter()
        .find_map(|m| m.strip_prefix("[stdout] grandchild ").map(str::to_string))
        .unwrap();

    assert!(eventually_gone(&grandchild), "process {grandchild} still running");
}

#[cfg(target_os = "linux")]
#[test]
fn grandchildren_do_not_outlive_a_leader_that_exits_on_its_own() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("sleep 1000 >/dev/null 2>&1 & echo \"grandchild $!\"; exit 1"),
        RestartPolicy::new(Duration::ZERO).with_max_restarts(MaxRestarts::Limited(1)),
    )
    .with_grace_period(Duration::from_secs(1));

    let outcome = Supervisor::new(config, log.clone()).unwrap().run();
    drop(guard);

    assert_eq!(StopReason::RestartLimitExceeded, outcome.reason);
    let grandchildren: Vec<String> = messages(&log)
        .iter()
        .filter_map(|m| m.strip_prefix("[stdout] grandchild ").map(str::to_string))
        .collect();
    assert_eq!(2, grandchildren.len());
    for pid in grandchildren {
        assert!(eventually_gone(&pid), "process {pid} still running");
    }
}

/// Reaping of orphans depends on the init process, a zombie is as good as gone.
#[cfg(target_os = "linux")]
fn eventually_gone(pid: &str) -> bool {
    let gone = |pid: &str| match fs::read_to_string(format!("/proc/{pid}/stat")) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
    };
    let deadline = Instant::now() + Duration::from_secs(3);
    while !gone(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    gone(pid)
}

#[test]
fn child_output_is_logged_in_order_per_stream() {
    let tmp = tempdir().unwrap();
    let (log, guard) = SessionLog::create(tmp.path()).unwrap();
    let config = SupervisorConfig::new(
        sh("i=1; while [ $i -le 200 ]; do echo \"out $i\"; echo \"err $i\" >&2; i=$((i+1)); done"),
        RestartPolicy::default().with_test_mode(true),
    );

    Supervisor::new(config, log.clone()).unwrap().run();
    drop(guard);

    let messages = messages(&log);
    for (stream, prefix) in [("stdout", "out"), ("stderr", "err")] {
        let lines: Vec<&String> = messages
            .iter()
            .filter(|m| m.starts_with(&format!("[{stream}] ")))
            .collect();
        let expected: Vec<String> = (1..=200)
            .map(|i| format!("[{stream}] {prefix} {i}"))
            .collect();
        assert_eq!(expected.iter().collect::<Vec<_>>(), lines);
    }
}

#[test]
fn every_session_gets_its_own_log_file() {
    let tmp = tempdir().unwrap();
    let run = || {
        let (log, guard) = SessionLog::create(tmp.path()).unwrap();
        let config = SupervisorConfig::new(
            sh("echo detecting"),
            RestartPolicy::default().with_test_mode(true),
        );
        Supervisor::new(config, log.clone()).unwrap().run();
        drop(guard);
        log.path().to_path_buf()
    };

    let first = run();
    let second = run();

    assert_ne!(first, second);
    assert_eq!(2, fs::read_dir(tmp.path()).unwrap().count());
}
