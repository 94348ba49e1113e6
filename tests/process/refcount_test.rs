/*!
 * Reference Count Tests
 * Stream close ordering, teardown and handle accounting
 */

use popen_io::{
    CountingCloser, LaunchOptions, LaunchedProcess, PopenConfig, PopenError, ProcessLauncher,
    StreamKind,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn counting_launcher(dir: &std::path::Path) -> (ProcessLauncher, Arc<CountingCloser>) {
    let closer = Arc::new(CountingCloser::new());
    let launcher = ProcessLauncher::builder()
        .with_config(PopenConfig::default().with_fifo_dir(dir))
        .with_closer(closer.clone())
        .build();
    (launcher, closer)
}

fn close_in_order(child: LaunchedProcess, order: &[StreamKind]) {
    let LaunchedProcess {
        stdin,
        stdout,
        stderr,
        ..
    } = child;
    let (mut stdin, mut stdout, mut stderr) = (Some(stdin), Some(stdout), Some(stderr));
    for kind in order {
        match kind {
            StreamKind::Stdin => stdin.take().unwrap().close().unwrap(),
            StreamKind::Stdout => stdout.take().unwrap().close().unwrap(),
            StreamKind::Stderr => stderr.take().unwrap().close().unwrap(),
        }
    }
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
#[serial]
fn test_close_counts_asynchronous() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, closer) = counting_launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("true").asynchronous(true))
        .unwrap();
    let pid = child.pid;
    assert_eq!(closer.count(), 6);

    let LaunchedProcess {
        stdin,
        stdout,
        stderr,
        ..
    } = child;
    stdin.close().unwrap();
    assert_eq!(closer.count(), 7);
    stdout.close().unwrap();
    assert_eq!(closer.count(), 8);
    assert!(launcher.registry().find_by_process_id(pid).is_some());
    stderr.close().unwrap();
    assert_eq!(closer.count(), 9);
    assert!(launcher.registry().find_by_process_id(pid).is_none());

    launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(closer.count(), 9);
}

#[test]
#[serial]
fn test_close_counts_synchronous() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, closer) = counting_launcher(dir.path());
    let child = launcher.launch(&LaunchOptions::new("true")).unwrap();
    assert_eq!(closer.count(), 6);
    drop(child);
    assert_eq!(closer.count(), 9);
    assert!(launcher.registry().is_empty());
}

#[test]
#[serial]
fn test_every_close_order_tears_down_once() {
    let dir = tempfile::tempdir().unwrap();
    let orders = [
        [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr],
        [StreamKind::Stdin, StreamKind::Stderr, StreamKind::Stdout],
        [StreamKind::Stdout, StreamKind::Stdin, StreamKind::Stderr],
        [StreamKind::Stdout, StreamKind::Stderr, StreamKind::Stdin],
        [StreamKind::Stderr, StreamKind::Stdin, StreamKind::Stdout],
        [StreamKind::Stderr, StreamKind::Stdout, StreamKind::Stdin],
    ];

    for asynchronous in [false, true] {
        for order in &orders {
            let (launcher, closer) = counting_launcher(dir.path());
            let child = launcher
                .launch(&LaunchOptions::new("true").asynchronous(asynchronous))
                .unwrap();
            let pid = child.pid;
            close_in_order(child, order);

            assert_eq!(closer.count(), 9, "order {:?}", order);
            assert!(launcher.registry().is_empty());
            let status = launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
            assert_eq!(status.exit_code, Some(0));
        }
    }
}

#[test]
#[serial]
fn test_random_close_orders_share_registry() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, closer) = counting_launcher(dir.path());
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let children: Vec<LaunchedProcess> = (0..8)
        .map(|i| {
            launcher
                .launch(&LaunchOptions::new("true").asynchronous(i % 2 == 0))
                .unwrap()
        })
        .collect();
    assert_eq!(launcher.registry().len(), 8);
    assert_eq!(closer.count(), 8 * 6);

    for child in children {
        let mut order = [StreamKind::Stdin, StreamKind::Stdout, StreamKind::Stderr];
        order.shuffle(&mut rng);
        close_in_order(child, &order);
    }
    assert!(launcher.registry().is_empty());
    assert_eq!(closer.count(), 8 * 9);
}

#[test]
#[serial]
fn test_repeated_close_report_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, _closer) = counting_launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("true").asynchronous(true))
        .unwrap();
    let refs = child.stream_refs();
    let LaunchedProcess {
        stdin,
        stdout: _stdout,
        stderr: _stderr,
        ..
    } = child;

    stdin.close().unwrap();
    let err = launcher
        .registry()
        .notify_stream_closed(refs.stdin)
        .unwrap_err();
    assert!(matches!(err, PopenError::InvalidState(_)));
    assert_eq!(launcher.registry().len(), 1);
}

#[test]
#[serial]
fn test_lookup_by_stream_reference() {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, _closer) = counting_launcher(dir.path());
    let child = launcher
        .launch(&LaunchOptions::new("true").asynchronous(true))
        .unwrap();
    let refs = child.stream_refs();

    for stream in [refs.stdin, refs.stdout, refs.stderr] {
        let live = launcher.registry().find_by_stream_ref(stream).unwrap();
        assert_eq!(live.pid(), child.pid);
        assert_eq!(live.streams(), refs);
    }
    assert!(matches!(
        launcher.registry().poll(refs.stdin),
        Err(PopenError::InvalidStreamHandle(_))
    ));

    drop(child);
    assert!(launcher.registry().find_by_stream_ref(refs.stdout).is_none());
}

#[test]
#[serial]
fn test_no_descriptor_leak() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = ProcessLauncher::builder()
        .with_config(PopenConfig::default().with_fifo_dir(dir.path()))
        .build();
    let before = open_fd_count();

    for asynchronous in [false, true, false, true] {
        let child = launcher
            .launch(&LaunchOptions::new("echo leak-check").asynchronous(asynchronous))
            .unwrap();
        let pid = child.pid;
        drop(child);
        launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
    }

    assert_eq!(open_fd_count(), before);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
