//! Configuration validation (§7 "validation" error kind) is permanent and
//! reported at load, before any port is ever opened — so an invalid
//! invocation must fail fast rather than hang or bind anything.

use crate::integration::infrastructure::ProcessTestHarness;
use anyhow::Result;
use std::time::Duration;

#[tokio::test]
async fn shared_service_mode_without_a_service_exits_nonzero_promptly() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut harness = ProcessTestHarness::new()?;
    let mut process = harness
        .spawn_sockunitd(&[
            "--identity",
            "invalid.socket",
            "--listen",
            "127.0.0.1:0",
            "--timeout-secs",
            "5",
        ])
        .await?;

    let exit_status = process
        .wait_for_exit_timeout(Duration::from_secs(2))
        .await?
        .expect("sockunitd should exit immediately on a validation error, not hang");

    assert!(
        !exit_status.success(),
        "sockunitd should exit non-zero when --service is missing in shared-service mode"
    );

    Ok(())
}
