//! Reconciliation against real processes: crash recovery, lost
//! hypervisors and orphans nobody owns.

mod common;

use std::time::Duration;

use uuid::Uuid;

use common::{TestHost, kill_group, spawn_fake_process, wait_for_status};
use labwarden::lab::{FailureReason, Lab, LabStatus, LabUpdate};
use labwarden::runtime::RuntimeKind;
use labwarden::vm::LabPaths;
use labwarden::vm::lifecycle::pid_alive;

async fn wait_dead(pid: u32) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while pid_alive(pid) {
        assert!(tokio::time::Instant::now() < deadline, "pid {pid} survived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_ending_lab_is_finished_after_restart() {
    let host = TestHost::start().await;
    let (lab_id, pid) = {
        let manager = host.manager();
        let lab = manager.create_lab("tenant-a", "web-basic").await.unwrap();
        let ready = wait_for_status(&manager, &lab.lab_id, LabStatus::Ready).await;
        // End accepted, then the process dies before teardown runs.
        manager
            .store()
            .transition(&lab.lab_id, LabStatus::Ending, LabUpdate::default())
            .unwrap();
        (lab.lab_id, ready.vm_handle.unwrap().pid)
    };
    assert!(pid_alive(pid));

    let manager = host.manager();
    let report = host.reconciler(manager.clone(), false).tick().await.unwrap();
    assert_eq!(report.resumed, vec![lab_id]);

    let finished = manager.store().get(&lab_id).unwrap().unwrap();
    assert_eq!(finished.status, LabStatus::Finished);
    assert!(!pid_alive(pid));
    assert!(host.is_clean(&lab_id).await);
}

#[tokio::test]
async fn test_lost_hypervisor_fails_the_lab() {
    let host = TestHost::start().await;
    let manager = host.manager();
    let lab = manager.create_lab("tenant-a", "web-basic").await.unwrap();
    let ready = wait_for_status(&manager, &lab.lab_id, LabStatus::Ready).await;

    let pid = ready.vm_handle.unwrap().pid;
    kill_group(pid);
    wait_dead(pid).await;

    let reconciler = host.reconciler(manager.clone(), false);
    let drift = reconciler.detect_drift().await.unwrap();
    assert_eq!(drift.missing, vec![lab.lab_id]);
    assert!(drift.orphaned.is_empty());

    let report = reconciler.tick().await.unwrap();
    assert_eq!(report.missing, vec![lab.lab_id]);
    let failed = manager.store().get(&lab.lab_id).unwrap().unwrap();
    assert_eq!(failed.status, LabStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::LostProcess));
    assert_eq!(failed.connection_endpoint, None);
    assert!(host.is_clean(&lab.lab_id).await);
}

#[tokio::test]
async fn test_orphans_are_reported_then_killed_on_request() {
    let host = TestHost::start().await;
    let manager = host.manager();

    let stray_id = Uuid::new_v4();
    let stray_paths = LabPaths::new(&host.microvm.state_root, &stray_id);
    std::fs::create_dir_all(&stray_paths.state_dir).unwrap();
    let stray = spawn_fake_process(&stray_paths.api_socket, "while :; do sleep 1; done").unwrap();

    let scratch = host.microvm.state_root.join("scratch").join("api.sock");
    let anonymous = spawn_fake_process(&scratch, "while :; do sleep 1; done").unwrap();

    let report = host.reconciler(manager.clone(), false).tick().await.unwrap();
    let mut pids: Vec<_> = report.orphaned.iter().filter_map(|o| o.pid).collect();
    pids.sort();
    let mut expected = vec![stray, anonymous];
    expected.sort();
    assert_eq!(pids, expected);
    assert!(report.terminated.is_empty());
    assert!(pid_alive(stray) && pid_alive(anonymous));

    let report = host.reconciler(manager.clone(), true).tick().await.unwrap();
    assert_eq!(report.terminated.len(), 2);
    wait_dead(stray).await;
    wait_dead(anonymous).await;
    assert!(!stray_paths.state_dir.exists());

    let report = host.reconciler(manager, false).tick().await.unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_abandoned_provisioning_is_interrupted_and_released() {
    let host = TestHost::start().await;
    let manager = host.manager();

    // A driver allocated the network and then died with the process.
    let lab = Lab::new("tenant-a", "web-basic", RuntimeKind::MicroVm);
    manager.store().insert_new(&lab, 8).unwrap();
    manager
        .store()
        .transition(&lab.lab_id, LabStatus::Provisioning, LabUpdate::default())
        .unwrap();
    host.netd.alloc_vm_net(&lab.lab_id).await.unwrap();
    assert!(!host.is_clean(&lab.lab_id).await);

    let report = host.reconciler(manager.clone(), false).tick().await.unwrap();
    assert_eq!(report.interrupted, vec![lab.lab_id]);
    let failed = manager.store().get(&lab.lab_id).unwrap().unwrap();
    assert_eq!(failed.failure_reason, Some(FailureReason::Interrupted));
    assert!(host.is_clean(&lab.lab_id).await);

    // The owner may start again.
    manager.create_lab("tenant-a", "web-basic").await.unwrap();
}

#[tokio::test]
async fn test_live_labs_are_not_drift() {
    let host = TestHost::start().await;
    let manager = host.manager();
    let lab = manager.create_lab("tenant-a", "web-basic").await.unwrap();
    wait_for_status(&manager, &lab.lab_id, LabStatus::Ready).await;

    let report = host.reconciler(manager.clone(), true).tick().await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert!(report.terminated.is_empty());
    assert_eq!(
        manager.store().get(&lab.lab_id).unwrap().unwrap().status,
        LabStatus::Ready
    );
}
