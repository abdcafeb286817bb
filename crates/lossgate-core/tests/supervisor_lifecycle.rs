//! Process-group lifecycle tests against real `sh` jobs.
#![cfg(unix)]

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use lossgate_core::platform::{group_alive, GroupGuard};
use lossgate_core::{CommandSpec, Job, JobState, ProcessSupervisor};

/// Wait for EOF on a job's output. Background children keep the pipe open,
/// so EOF means every writer in the group is gone.
async fn output_closed(lines: BoxStream<'static, std::io::Result<String>>) -> bool {
    tokio::time::timeout(Duration::from_secs(10), lines.collect::<Vec<_>>())
        .await
        .is_ok()
}

/// Test: teardown kills background grandchildren too
#[tokio::test]
async fn test_teardown_kills_whole_group() {
    let spec = CommandSpec::new("sleep 30 & echo ready; sleep 30");
    let mut job = ProcessSupervisor::spawn(&spec).expect("spawn failed");
    let mut lines = job.lines();

    assert_eq!(lines.next().await.unwrap().unwrap(), "ready");
    assert!(job.teardown());
    assert_eq!(job.state(), JobState::Killed);

    // The background sleep holds the pipe open; EOF proves it died.
    let rest = tokio::time::timeout(Duration::from_secs(10), lines.collect::<Vec<_>>())
        .await
        .expect("output stayed open after teardown");
    assert!(rest.is_empty());

    let exit = job.wait().await.unwrap();
    assert_eq!(exit.signal, Some(9));
}

/// Test: only the first teardown fires
#[tokio::test]
async fn test_teardown_is_idempotent() {
    let mut job = ProcessSupervisor::spawn(&CommandSpec::new("sleep 30")).unwrap();
    assert!(job.teardown());
    assert!(!job.teardown());
    assert_eq!(job.state(), JobState::Killed);
    job.wait().await.unwrap();
    assert_eq!(job.state(), JobState::Killed);
}

/// Test: teardown after a reaped exit with an empty group sends no signal
#[tokio::test]
async fn test_teardown_after_exit_keeps_exited_state() {
    let mut job = ProcessSupervisor::spawn(&CommandSpec::new("exit 0")).unwrap();
    let pgid = job.pgid().unwrap();
    let _: Vec<_> = job.lines().collect().await;
    job.wait().await.unwrap();
    assert!(!group_alive(pgid));

    assert!(!job.teardown());
    assert!(!job.teardown());
    assert_eq!(
        job.state(),
        JobState::Exited {
            code: Some(0),
            signal: None
        }
    );
}

/// Test: a leader that exits while background members run still gets torn down
#[tokio::test]
async fn test_teardown_after_leader_exit_kills_stragglers() {
    let mut job = ProcessSupervisor::spawn(&CommandSpec::new("sleep 30 & echo ready")).unwrap();
    let mut lines = job.lines();
    assert_eq!(lines.next().await.unwrap().unwrap(), "ready");
    job.wait().await.unwrap();

    assert!(job.teardown());
    assert!(output_closed(lines).await, "background sleep survived teardown");
    assert_eq!(
        job.state(),
        JobState::Exited {
            code: Some(0),
            signal: None
        }
    );
}

/// Test: dropping the handle kills the group
#[tokio::test]
async fn test_drop_kills_group() {
    let mut job = ProcessSupervisor::spawn(&CommandSpec::new("sleep 30 & sleep 30")).unwrap();
    let pgid = job.pgid().unwrap();
    let lines = job.lines();
    assert!(group_alive(pgid));

    drop(job);

    assert!(output_closed(lines).await, "group {pgid} survived drop");
}

/// Test: cancelling the future that owns the job kills the group
#[tokio::test]
async fn test_cancelled_owner_kills_group() {
    let mut job = ProcessSupervisor::spawn(&CommandSpec::new("sleep 30 & sleep 30")).unwrap();
    let lines = job.lines();

    let owner = async move {
        let mut job = job;
        job.wait().await
    };
    let result = tokio::time::timeout(Duration::from_millis(200), owner).await;

    assert!(result.is_err());
    assert!(output_closed(lines).await);
}

/// Test: guard refuses to signal the caller's own group or init
#[test]
fn test_guard_rejects_reserved_pgids() {
    for pgid in [0, 1] {
        let guard = GroupGuard::new(pgid);
        assert!(guard.fire());
        assert!(guard.has_fired());
        assert!(!guard.fire());
    }
    assert!(lossgate_core::platform::kill_group(0).is_err());
}

/// Test: a missing executable still spawns the shell and exits 127
#[tokio::test]
async fn test_missing_executable_exit_code() {
    let mut job =
        ProcessSupervisor::spawn(&CommandSpec::new("definitely-not-a-real-binary-xyz")).unwrap();
    let lines: Vec<String> = job.lines().map(|l| l.unwrap()).collect().await;
    let exit = job.wait().await.unwrap();
    assert_eq!(exit.code, Some(127));
    assert!(!lines.is_empty(), "shell should report the missing command");
}
