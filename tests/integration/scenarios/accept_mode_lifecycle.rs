//! Scenario 1 of the testable-properties list, driven end to end against the
//! real `sockunitd` binary: a stream listener in accept mode accepts a
//! connection, then the unit shuts down cleanly on SIGTERM.

use crate::integration::infrastructure::{ProcessTestHarness, SocketTestUtils};
use anyhow::Result;
use nix::sys::signal::{kill, Signal};
use std::time::Duration;

#[tokio::test]
async fn accepts_a_connection_and_shuts_down_on_sigterm() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let socket_utils = SocketTestUtils::new();
    let port = socket_utils.get_free_port()?;

    let listen = format!("127.0.0.1:{port}");
    let mut process = harness
        .spawn_sockunitd(&[
            "--identity",
            "accept-lifecycle.socket",
            "--listen",
            &listen,
            "--accept",
            "--max-connections",
            "4",
            "--timeout-secs",
            "5",
        ])
        .await?;

    // Give the unit time to walk start-pre/start-post and reach listening.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(process.is_running(), "sockunitd exited before reaching listening");

    socket_utils
        .test_socket_connectivity("127.0.0.1", port)
        .await
        .expect("listening socket should accept a connection");

    kill(process.pid, Signal::SIGTERM)?;
    let exit_status = process
        .wait_for_exit_timeout(Duration::from_secs(5))
        .await?;
    assert!(exit_status.is_some(), "sockunitd did not exit after SIGTERM");

    Ok(())
}
