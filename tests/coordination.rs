//! End-to-end tests of the coordination server and client over TCP.
//!
//! Each test boots an in-process `LockServer` on an ephemeral port and
//! drives it with real clients, covering the protocol scenarios: reader
//! batching with writer preference, timeouts, re-entrancy, crash cleanup
//! and clean handoff.

use std::time::Duration;

use lab_coord::config::CoordConfig;
use lab_coord::net::framing::{read_message, write_message};
use lab_coord::net::protocol::{Reply, Request, DEFAULT_MAX_MESSAGE_BYTES};
use lab_coord::{CoordClient, CoordError, LockMode, LockServer};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

const KEY: &str = "z:\\experiments\\2025\\shot.h5";

async fn start_server() -> CoordConfig {
    let mut config = CoordConfig::default();
    config.security.allow_insecure = true;
    config.timeouts.session_ms = 2_000;

    let server = LockServer::bind("127.0.0.1:0", &config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    config.server.host = addr.ip().to_string();
    config.server.port = addr.port();
    config
}

async fn client(config: &CoordConfig) -> CoordClient {
    CoordClient::connect(config.clone()).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_batching_and_writer_preference() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;
    let c3 = client(&config).await;
    let c4 = client(&config).await;

    // Two readers share the key.
    let r1 = c1.acquire_with_timeout(KEY, LockMode::Read, 10_000).await.unwrap();
    let r2 = c2.acquire_with_timeout(KEY, LockMode::Read, 10_000).await.unwrap();

    // A writer queues behind them.
    let w3 = tokio::spawn(async move {
        c3.acquire_with_timeout(KEY, LockMode::Write, 10_000).await
    });
    sleep(Duration::from_millis(300)).await;
    assert!(!w3.is_finished(), "writer must wait for readers");

    // A later reader must not overtake the queued writer.
    let r4 = tokio::spawn(async move {
        c4.acquire_with_timeout(KEY, LockMode::Read, 10_000).await
    });
    sleep(Duration::from_millis(300)).await;
    assert!(!r4.is_finished(), "reader must not overtake a queued writer");

    r1.release().await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(!w3.is_finished(), "writer needs every reader gone");

    r2.release().await.unwrap();
    let w3_guard = timeout(Duration::from_secs(5), w3).await.unwrap().unwrap().unwrap();
    assert_eq!(w3_guard.mode(), LockMode::Write);
    assert!(!r4.is_finished(), "reader waits for the writer");

    w3_guard.release().await.unwrap();
    let r4_guard = timeout(Duration::from_secs(5), r4).await.unwrap().unwrap().unwrap();
    r4_guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn acquire_times_out_and_queue_is_cleared() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let held = c1.acquire_with_timeout(KEY, LockMode::Write, 10_000).await.unwrap();

    let started = Instant::now();
    let err = c2
        .acquire_with_timeout(KEY, LockMode::Write, 100)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Timeout { .. }), "got {err}");
    assert!(started.elapsed() >= Duration::from_millis(100));

    // The expired request was removed from the queue: a release hands the
    // key straight to the next acquire, not to a ghost waiter.
    held.release().await.unwrap();
    let guard = c2
        .acquire_with_timeout(KEY, LockMode::Write, 2_000)
        .await
        .unwrap();
    guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn nonblocking_acquire_would_block() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let held = c1.acquire_with_timeout(KEY, LockMode::Write, 10_000).await.unwrap();
    let err = c2
        .acquire_with_timeout(KEY, LockMode::Write, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::WouldBlock { .. }));
    held.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn reentrant_read_needs_both_releases() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let first = c1.acquire_with_timeout(KEY, LockMode::Read, 10_000).await.unwrap();
    let second = c1.acquire_with_timeout(KEY, LockMode::Read, 10_000).await.unwrap();
    assert_ne!(first.token(), second.token());

    let writer = tokio::spawn(async move {
        c2.acquire_with_timeout(KEY, LockMode::Write, 10_000).await
    });
    sleep(Duration::from_millis(300)).await;
    assert!(!writer.is_finished());

    first.release().await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(!writer.is_finished(), "one token still held");

    second.release().await.unwrap();
    let guard = timeout(Duration::from_secs(5), writer).await.unwrap().unwrap().unwrap();
    guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn mode_change_while_holding_is_denied() {
    let config = start_server().await;
    let c1 = client(&config).await;

    let read_guard = c1.acquire_with_timeout(KEY, LockMode::Read, 10_000).await.unwrap();
    let err = c1
        .acquire_with_timeout(KEY, LockMode::Write, 10_000)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::UpgradeDenied { .. }));
    read_guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_client_is_cleaned_up() {
    let config = start_server().await;
    let addr = config.server_addr();

    // A bare-transport client takes the write lock and then vanishes
    // without releasing, as a killed process would.
    let mut socket = TcpStream::connect(&addr).await.unwrap();
    let acquire = Request::Acquire {
        key: KEY.into(),
        client_id: "crashy-client".into(),
        token: "t-crash".into(),
        mode: LockMode::Write,
        timeout_ms: 1_000,
    };
    write_message(&mut socket, &acquire.to_frames()).await.unwrap();
    let frames = read_message(&mut socket, DEFAULT_MAX_MESSAGE_BYTES).await.unwrap();
    assert_eq!(Reply::from_frames(&frames).unwrap(), Reply::Ok);
    drop(socket);

    // Its grant is released once the server notices the transport is gone,
    // well within the session timeout.
    let c2 = client(&config).await;
    let guard = c2
        .acquire_with_timeout(KEY, LockMode::Write, config.timeouts.session_ms)
        .await
        .unwrap();
    guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn release_hands_over_within_one_round_trip() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let held = c1.acquire_with_timeout(KEY, LockMode::Write, 10_000).await.unwrap();
    let waiter = tokio::spawn(async move {
        let started = Instant::now();
        let guard = c2.acquire_with_timeout(KEY, LockMode::Write, 10_000).await;
        (started.elapsed(), guard)
    });
    sleep(Duration::from_millis(300)).await;

    let released_at = Instant::now();
    held.release().await.unwrap();
    let (_, guard) = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
    let handoff = released_at.elapsed();
    assert!(
        handoff < Duration::from_secs(1),
        "handoff took {handoff:?}, no lost wakeup allowed"
    );
    guard.unwrap().release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_guard_is_released_in_background() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let guard = c1.acquire_with_timeout(KEY, LockMode::Write, 10_000).await.unwrap();
    drop(guard);

    // The drop-release goes through the client's background task; the key
    // must become free without any explicit release call.
    let guard = c2
        .acquire_with_timeout(KEY, LockMode::Write, 5_000)
        .await
        .unwrap();
    guard.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn independent_keys_do_not_interfere() {
    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let a = c1
        .acquire_with_timeout("z:\\runs\\a.h5", LockMode::Write, 10_000)
        .await
        .unwrap();
    // A different key is grantable immediately even while a.h5 is held.
    let b = c2
        .acquire_with_timeout("z:\\runs\\b.h5", LockMode::Write, 0)
        .await
        .unwrap();

    a.release().await.unwrap();
    b.release().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_round_trips() {
    let config = start_server().await;
    let c1 = client(&config).await;
    c1.ping().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn release_of_foreign_token_is_not_held() {
    let config = start_server().await;
    let addr = config.server_addr();
    let mut socket = TcpStream::connect(&addr).await.unwrap();

    let release = Request::Release {
        key: KEY.into(),
        client_id: "nobody".into(),
        token: "never-granted".into(),
    };
    write_message(&mut socket, &release.to_frames()).await.unwrap();
    let frames = read_message(&mut socket, DEFAULT_MAX_MESSAGE_BYTES).await.unwrap();
    assert_eq!(Reply::from_frames(&frames).unwrap(), Reply::NotHeld);
}

#[tokio::test(flavor = "multi_thread")]
async fn same_lock_key_from_two_host_mappings() {
    use lab_coord::PathMap;
    use std::path::Path;

    let config = start_server().await;
    let c1 = client(&config).await;
    let c2 = client(&config).await;

    let host_a = PathMap::new("/mnt/lab", "Z:\\");
    let host_b = PathMap::new("/home/user/lab", "Z:\\");
    let key_a = host_a.lock_key(Path::new("/mnt/lab/experiments/shot.h5"));
    let key_b = host_b.lock_key(Path::new("/home/user/lab/experiments/shot.h5"));

    let held = c1
        .acquire_with_timeout(key_a, LockMode::Write, 10_000)
        .await
        .unwrap();
    // The same file seen from another host maps to the same lock.
    let err = c2
        .acquire_with_timeout(key_b, LockMode::Write, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::WouldBlock { .. }));
    held.release().await.unwrap();
}
