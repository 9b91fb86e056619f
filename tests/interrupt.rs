//! SIGINT handling for `impairlab run`
//!
//! Kept in its own test binary: the signal is raised against the whole
//! test process.

use impairlab::interrupt_signal;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::time::Duration;

#[tokio::test]
async fn test_interrupt_during_setup_is_held_for_run() {
    let shutdown = interrupt_signal().unwrap();

    // Raised before anything polls the future, as when Ctrl-C lands
    // while namespaces are still being created
    kill(Pid::this(), Signal::SIGINT).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .expect("interrupt was not delivered to the shutdown future");
}
