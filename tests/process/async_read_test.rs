/*!
 * Asynchronous Read Tests
 * Non-blocking polls, cancellation on close and the stream adapter
 */

use bytes::Bytes;
use futures::TryStreamExt;
use popen_io::{Chunk, LaunchOptions, PopenConfig, PopenError, ProcessLauncher};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::io::Read;
use std::time::{Duration, Instant};

fn launcher(dir: &std::path::Path) -> ProcessLauncher {
    ProcessLauncher::builder()
        .with_config(PopenConfig::default().with_fifo_dir(dir))
        .build()
}

fn poll_until_data(output: &mut popen_io::ChildOutput) -> Chunk {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match output.poll().unwrap() {
            Chunk::TryAgain if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            other => return other,
        }
    }
}

#[test]
#[serial]
fn test_poll_does_not_block_on_quiet_child() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("sleep 0.3; echo late").asynchronous(true))
        .unwrap();

    let start = Instant::now();
    assert_eq!(child.stdout.poll().unwrap(), Chunk::TryAgain);
    assert!(start.elapsed() < Duration::from_millis(200));

    assert_eq!(
        poll_until_data(&mut child.stdout),
        Chunk::Data(Bytes::from_static(b"late\n"))
    );
    assert_eq!(poll_until_data(&mut child.stdout), Chunk::Closed);
    for _ in 0..3 {
        assert_eq!(child.stdout.poll().unwrap(), Chunk::Closed);
    }
}

#[test]
#[serial]
fn test_close_with_pending_read() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("sleep 1").asynchronous(true))
        .unwrap();
    let pid = child.pid;

    assert_eq!(child.stdout.poll().unwrap(), Chunk::TryAgain);
    assert_eq!(child.stderr.poll().unwrap(), Chunk::TryAgain);
    drop(child);

    assert!(launcher.registry().is_empty());
    assert_eq!(launcher.registry().orphan_count(), 1);
    let status = launcher.wait(pid, Some(Duration::from_secs(10))).unwrap();
    assert_eq!(status.exit_code, Some(0));
    assert_eq!(launcher.registry().orphan_count(), 0);
}

#[test]
#[serial]
fn test_poll_on_synchronous_stream_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher.launch(&LaunchOptions::new("true")).unwrap();

    assert!(matches!(
        child.stdout.poll(),
        Err(PopenError::InvalidState(_))
    ));
    assert!(matches!(
        launcher.registry().poll(child.stderr.stream_ref()),
        Err(PopenError::InvalidState(_))
    ));
}

#[test]
#[serial]
fn test_read_trait_reports_would_block() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let mut child = launcher
        .launch(&LaunchOptions::new("sleep 0.2; printf 'abcdef'").asynchronous(true))
        .unwrap();

    let mut small = [0u8; 4];
    let err = child.stdout.read(&mut small).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut collected = Vec::new();
    loop {
        match child.stdout.read(&mut small) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&small[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5))
            }
            Err(e) => panic!("unexpected read error: {}", e),
        }
    }
    assert_eq!(collected, b"abcdef");
}

#[tokio::test]
#[serial]
async fn test_stream_adapter_collects_output() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = launcher(dir.path());
    let child = launcher
        .launch(
            &LaunchOptions::new("head -c 20000 /dev/zero | tr '\\0' x").asynchronous(true),
        )
        .unwrap();
    let pid = child.pid;

    let chunks: Vec<Bytes> = child
        .stdout
        .into_stream(Duration::from_millis(2))
        .try_collect()
        .await
        .unwrap();
    let total: usize = chunks.iter().map(|c| c.len()).sum();
    assert_eq!(total, 20_000);
    assert!(chunks.iter().all(|c| c.iter().all(|&b| b == b'x')));

    let status = launcher
        .wait_async(pid, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(status.exit_code, Some(0));
}
