// Integration tests for registry reconciliation
mod common;

use common::{RecordingApi, vm};
use std::sync::atomic::Ordering;
use vessel::{
    VesselError,
    api::parse_vm_list,
    events::PushEvent,
    reconciler::{PushOutcome, Reconciler, RegistryChange},
    vm::LifecycleState,
};

#[tokio::test]
async fn test_full_listing_then_push_last_write_wins() {
    let api = RecordingApi::new(Vec::new());
    let reconciler = Reconciler::new();

    // GET /vms answered with {"vms": [{"name": "vm2", "state": 5}]}
    let listing = parse_vm_list(br#"{"vms": [{"name": "vm2", "state": 5}]}"#).unwrap();
    api.set_vms(listing);
    reconciler.refresh(api.as_ref()).await.unwrap();
    assert_eq!(
        reconciler.view().state_of("vm2"),
        Some(LifecycleState::Shutoff)
    );

    let event = PushEvent::parse(
        r#"{"event": "vm_status_updated", "data": {"name": "vm2", "state": "running"}}"#,
    )
    .unwrap()
    .unwrap();
    assert_eq!(reconciler.apply_push(event), PushOutcome::Applied);
    assert_eq!(
        reconciler.view().state_of("vm2"),
        Some(LifecycleState::Running)
    );

    // And a later listing wins again.
    reconciler.refresh(api.as_ref()).await.unwrap();
    assert_eq!(
        reconciler.view().state_of("vm2"),
        Some(LifecycleState::Shutoff)
    );
}

#[test]
fn test_push_for_unknown_vm_is_dropped() {
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Running)]);
    let before = reconciler.view().snapshot();

    let outcome = reconciler.apply_push(PushEvent::VmStatusUpdated {
        name: "deleted-meanwhile".to_string(),
        state: LifecycleState::Running,
    });

    assert_eq!(outcome, PushOutcome::Dropped);
    assert!(reconciler.view().get("deleted-meanwhile").is_none());
    assert_eq!(reconciler.view().snapshot(), before);

    let cpu = reconciler.apply_push(PushEvent::VmCpuUpdated {
        name: "deleted-meanwhile".to_string(),
        cpu_usage_percentage: 40.0,
    });
    assert_eq!(cpu, PushOutcome::Dropped);
}

#[test]
fn test_applying_same_listing_twice_is_idempotent() {
    let reconciler = Reconciler::new();
    let listing = vec![
        vm("web", LifecycleState::Running),
        vm("db", LifecycleState::Paused),
        vm("build", LifecycleState::Shutoff),
    ];

    reconciler.apply_full_list(listing.clone());
    let first = reconciler.view().snapshot();
    reconciler.apply_full_list(listing);
    let second = reconciler.view().snapshot();

    assert_eq!(first, second);
    assert_eq!(reconciler.view().names(), vec!["web", "db", "build"]);
}

#[test]
fn test_state_push_only_touches_state() {
    let reconciler = Reconciler::new();
    let mut detailed = vm("db", LifecycleState::Shutoff);
    detailed.vcpus = 8;
    detailed.memory = 16 * 1024 * 1024 * 1024;
    detailed.vm_os = "debian12".to_string();
    reconciler.apply_full_list(vec![detailed.clone()]);

    reconciler.apply_push(PushEvent::VmStatusUpdated {
        name: "db".to_string(),
        state: LifecycleState::Running,
    });

    let stored = reconciler.view().get("db").unwrap();
    assert_eq!(stored.state, LifecycleState::Running);
    assert_eq!(stored.vcpus, 8);
    assert_eq!(stored.memory, detailed.memory);
    assert_eq!(stored.vm_os, "debian12");
}

#[test]
fn test_cpu_push_is_kept_beside_the_record() {
    let reconciler = Reconciler::new();
    let original = vm("web", LifecycleState::Running);
    reconciler.apply_full_list(vec![original.clone()]);

    let outcome = reconciler.apply_push(PushEvent::VmCpuUpdated {
        name: "web".to_string(),
        cpu_usage_percentage: 37.5,
    });

    assert_eq!(outcome, PushOutcome::Applied);
    assert_eq!(reconciler.view().cpu_usage("web"), Some(37.5));
    assert_eq!(reconciler.view().get("web").unwrap(), original);
}

#[test]
fn test_vm_created_push_inserts_record() {
    let reconciler = Reconciler::new();
    let mut feed = reconciler.subscribe();

    reconciler.apply_push(PushEvent::VmCreated(vm("fresh", LifecycleState::Shutoff)));

    assert!(reconciler.view().get("fresh").is_some());
    assert_eq!(
        feed.try_recv().unwrap(),
        RegistryChange::Added {
            name: "fresh".to_string(),
            state: LifecycleState::Shutoff
        }
    );
}

#[test]
fn test_vms_absent_from_listing_are_kept() {
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![
        vm("a", LifecycleState::Running),
        vm("b", LifecycleState::Running),
    ]);

    reconciler.apply_full_list(vec![vm("a", LifecycleState::Paused)]);

    assert_eq!(reconciler.view().len(), 2);
    assert_eq!(reconciler.view().state_of("b"), Some(LifecycleState::Running));
}

#[test]
fn test_delete_acknowledgement_removes_record() {
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("old", LifecycleState::Shutoff)]);
    let mut feed = reconciler.subscribe();

    assert!(reconciler.acknowledge_delete("old").is_some());
    assert!(reconciler.acknowledge_delete("old").is_none());
    assert!(reconciler.view().is_empty());
    assert_eq!(
        feed.try_recv().unwrap(),
        RegistryChange::Removed {
            name: "old".to_string()
        }
    );
}

#[tokio::test]
async fn test_failed_fetch_leaves_registry_untouched() {
    let api = RecordingApi::new(vec![vm("vm1", LifecycleState::Paused)]);
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Running)]);
    let before = reconciler.view().snapshot();
    api.fail_list.store(true, Ordering::SeqCst);

    let err = reconciler.refresh(api.as_ref()).await.unwrap_err();

    assert!(matches!(err, VesselError::NetworkFailure(_)));
    assert_eq!(reconciler.view().snapshot(), before);
}

#[test]
fn test_malformed_listing_is_rejected() {
    let err = parse_vm_list(br#"{"machines": []}"#).unwrap_err();
    assert!(matches!(err, VesselError::UnexpectedResponseShape(_)));
}

#[test]
fn test_change_feed_reports_transitions_only() {
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Shutoff)]);
    let mut feed = reconciler.subscribe();

    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Shutoff)]);
    reconciler.apply_push(PushEvent::VmStatusUpdated {
        name: "vm1".to_string(),
        state: LifecycleState::Running,
    });

    assert_eq!(
        feed.try_recv().unwrap(),
        RegistryChange::StateChanged {
            name: "vm1".to_string(),
            from: LifecycleState::Shutoff,
            to: LifecycleState::Running
        }
    );
    assert!(feed.try_recv().is_err());
}

#[test]
fn test_duplicate_names_in_one_listing_report_in_order() {
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Shutoff)]);
    let mut feed = reconciler.subscribe();

    reconciler.apply_full_list(vec![
        vm("vm2", LifecycleState::Shutoff),
        vm("vm1", LifecycleState::Running),
        vm("vm2", LifecycleState::Running),
        vm("vm1", LifecycleState::Running),
    ]);

    let changes: Vec<_> = std::iter::from_fn(|| feed.try_recv().ok()).collect();
    assert_eq!(
        changes,
        vec![
            RegistryChange::Added {
                name: "vm2".to_string(),
                state: LifecycleState::Shutoff
            },
            RegistryChange::StateChanged {
                name: "vm1".to_string(),
                from: LifecycleState::Shutoff,
                to: LifecycleState::Running
            },
            RegistryChange::StateChanged {
                name: "vm2".to_string(),
                from: LifecycleState::Shutoff,
                to: LifecycleState::Running
            },
        ]
    );
    assert_eq!(
        reconciler.view().state_of("vm2"),
        Some(LifecycleState::Running)
    );
}

#[tokio::test]
async fn test_detail_fetch_replaces_record() {
    let mut detailed = vm("vm1", LifecycleState::Running);
    detailed.vcpus = 4;
    let api = RecordingApi::new(vec![detailed]);
    let reconciler = Reconciler::new();
    reconciler.apply_full_list(vec![vm("vm1", LifecycleState::Shutoff)]);

    let fetched = reconciler.refresh_vm(api.as_ref(), "vm1").await.unwrap();

    assert_eq!(fetched.vcpus, 4);
    assert_eq!(reconciler.view().get("vm1").unwrap(), fetched);
    assert_eq!(api.calls(), vec!["GET /vms/vm1"]);
}
