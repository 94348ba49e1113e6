/*!
 * Launch Tests
 * Spawning, stream wiring and exit status
 */

use popen_io::{
    Chunk, CountingCloser, LaunchOptions, OutputDrain, PopenConfig, PopenError, ProcessLauncher,
    StreamMode,
};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

fn launcher(dir: &std::path::Path) -> ProcessLauncher {
    ProcessLauncher::builder()
        .with_config(PopenConfig::default().with_fifo_dir(dir))
        .build()
}

/// Scheduler state letter from /proc, `None` once the pid is gone
fn proc_state(pid: u32) -> Option<char> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.trim_start().chars().next()
}

fn drain() -> OutputDrain {
    OutputDrain::new(Duration::from_millis(2)).with_timeout(Duration::from_secs(30))
}

#[test]
#[serial]
fn test_echo_asynchronous() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("echo hello").asynchronous(true))
        .unwrap();

    let output = drain()
        .capture(&mut child.stdout, &mut child.stderr)
        .unwrap();
    assert_eq!(output.stdout_lossy(), "hello\n");
    assert!(output.stderr.is_empty());

    let status = launcher
        .wait(child.pid, Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(status.exit_code, Some(0));
}

#[test]
#[serial]
fn test_stdin_roundtrip_synchronous() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let child = launcher.launch(&LaunchOptions::new("cat")).unwrap();
    let (mut stdin, mut stdout) = (child.stdin, child.stdout);

    stdin.write_all(b"ping\npong\n").unwrap();
    stdin.close().unwrap();

    let mut text = String::new();
    stdout.read_to_string(&mut text).unwrap();
    assert_eq!(text, "ping\npong\n");
}

#[test]
#[serial]
fn test_large_stdout_with_stderr_unread() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("head -c 1048576 /dev/zero").asynchronous(true))
        .unwrap();

    let mut total = 0;
    loop {
        match child.stdout.poll().unwrap() {
            Chunk::Data(bytes) => {
                assert!(bytes.len() <= 4096);
                total += bytes.len();
            }
            Chunk::TryAgain => std::thread::sleep(Duration::from_millis(1)),
            Chunk::Closed => break,
        }
    }
    assert_eq!(total, 1_048_576);
    assert_eq!(child.stdout.poll().unwrap(), Chunk::Closed);
}

#[test]
#[serial]
fn test_both_streams_large_without_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(
            &LaunchOptions::new("head -c 200000 /dev/zero; head -c 300000 /dev/zero >&2")
                .asynchronous(true),
        )
        .unwrap();

    let output = drain()
        .capture(&mut child.stdout, &mut child.stderr)
        .unwrap();
    assert_eq!(output.stdout.len(), 200_000);
    assert_eq!(output.stderr.len(), 300_000);
}

#[test]
#[serial]
fn test_synchronous_large_output() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("head -c 300000 /dev/zero"))
        .unwrap();

    let mut bytes = Vec::new();
    child.stdout.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes.len(), 300_000);
}

#[test]
#[serial]
fn test_carriage_returns_by_mode() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let script = r"printf 'a\r\nb\r\n'";

    let mut asynchronous = launcher
        .launch(&LaunchOptions::new(script).asynchronous(true))
        .unwrap();
    let output = drain()
        .capture(&mut asynchronous.stdout, &mut asynchronous.stderr)
        .unwrap();
    assert_eq!(output.stdout_lossy(), "a\nb\n");

    let mut text = launcher.launch(&LaunchOptions::new(script)).unwrap();
    let mut out = String::new();
    text.stdout.read_to_string(&mut out).unwrap();
    assert_eq!(out, "a\nb\n");

    let mut binary = launcher
        .launch(&LaunchOptions::new(script).with_mode(StreamMode::Binary))
        .unwrap();
    let mut raw = Vec::new();
    binary.stdout.read_to_end(&mut raw).unwrap();
    assert_eq!(raw, b"a\r\nb\r\n");
}

#[test]
#[serial]
fn test_environment_and_working_dir() {
    let dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(
            &LaunchOptions::new("echo \"$POPEN_TEST_VAR\"; pwd")
                .with_environment([("POPEN_TEST_VAR", "from-parent")])
                .with_working_dir(work.path())
                .asynchronous(true),
        )
        .unwrap();

    let output = drain()
        .capture(&mut child.stdout, &mut child.stderr)
        .unwrap();
    let expected = format!(
        "from-parent\n{}\n",
        work.path().canonicalize().unwrap().display()
    );
    assert_eq!(output.stdout_lossy(), expected);
}

#[test]
#[serial]
fn test_exit_status_independent_of_streams() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("echo bye >&2; exit 3").asynchronous(true))
        .unwrap();
    let pid = child.pid;

    let status = launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(status.exit_code, Some(3));
    assert_eq!(status.success(), Some(false));

    // Still known after the streams close
    drop(child);
    assert!(launcher.registry().is_empty());
    assert_eq!(launcher.try_wait(pid).unwrap(), Some(status));
}

#[test]
#[serial]
fn test_waited_child_keeps_pid_until_streams_close() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("exit 4").asynchronous(true))
        .unwrap();
    let pid = child.pid;

    let status = launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(status.exit_code, Some(4));
    // Status collected, but the zombie still pins the pid
    assert_eq!(proc_state(pid), Some('Z'));
    assert!(launcher.registry().find_by_process_id(pid).is_some());
    assert_eq!(launcher.try_wait(pid).unwrap(), Some(status));

    drop(child);
    assert_eq!(proc_state(pid), None);
    assert_eq!(launcher.registry().orphan_count(), 0);
    assert_eq!(launcher.try_wait(pid).unwrap(), Some(status));
}

#[test]
#[serial]
fn test_killed_child_reports_signal() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("kill -9 $$").asynchronous(true))
        .unwrap();

    let status = launcher
        .wait(child.pid, Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(status.signal, Some(9));
    assert_eq!(status.success(), None);
    assert!(!status.exited());
}

#[test]
#[serial]
fn test_spawn_failure_closes_every_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let closer = Arc::new(CountingCloser::new());
    let launcher = ProcessLauncher::builder()
        .with_config(
            PopenConfig::default()
                .with_fifo_dir(dir.path())
                .with_shell("/nonexistent/shell"),
        )
        .with_closer(closer.clone())
        .build();

    let err = launcher
        .launch(&LaunchOptions::new("echo never").asynchronous(true))
        .unwrap_err();
    assert!(matches!(err, PopenError::ProcessSpawnFailed { .. }));
    assert_eq!(closer.count(), 9);
    assert!(launcher.registry().is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
#[serial]
fn test_show_window_has_no_effect() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(
            &LaunchOptions::new("echo shown")
                .with_show_window(true)
                .asynchronous(true),
        )
        .unwrap();
    let output = drain()
        .capture(&mut child.stdout, &mut child.stderr)
        .unwrap();
    assert_eq!(output.stdout_lossy(), "shown\n");
}
