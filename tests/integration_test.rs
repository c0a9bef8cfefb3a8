//! Entry point for `sockunitd` integration tests. Individual scenarios live
//! under `tests/integration/scenarios/`; this file just wires the module
//! tree and carries a smoke test for the harness itself.

mod integration;

// A basic smoke test to verify the test harness itself works
#[tokio::test]
async fn test_framework_smoke_test() -> anyhow::Result<()> {
    use integration::infrastructure::ProcessTestHarness;
    use nix::sys::signal::Signal;

    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut process = harness
        .spawn_sockunitd(&[
            "--identity",
            "smoke.socket",
            "--listen",
            "127.0.0.1:0",
            "--accept",
            "--timeout-secs",
            "5",
        ])
        .await?;

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(process.is_running(), "sockunitd should be running");

    nix::sys::signal::kill(process.pid, Signal::SIGTERM)?;

    let exit_status = process
        .wait_for_exit_timeout(std::time::Duration::from_secs(5))
        .await?;

    assert!(
        exit_status.is_some(),
        "sockunitd did not exit within timeout after SIGTERM"
    );

    Ok(())
}