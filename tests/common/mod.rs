// Shared in-memory hypervisor for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use vessel::{
    Result, VesselError,
    api::HypervisorApi,
    confirmation::{ConfirmationRequest, Confirmer},
    vm::{Action, CreateVmRequest, LifecycleState, ScheduleRequest, Snapshot, Vm, VmStats},
};

pub fn vm(name: &str, state: LifecycleState) -> Vm {
    Vm::new(name, state)
}

/// Pauses `control` calls until released, to observe a command in flight.
pub struct ControlGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Records every request as "METHOD /path" and applies control actions to
/// its own inventory, like a real backend would.
#[derive(Default)]
pub struct RecordingApi {
    calls: Mutex<Vec<String>>,
    vms: Mutex<Vec<Vm>>,
    snapshots: Mutex<HashMap<String, Vec<Snapshot>>>,
    gate: Mutex<Option<(Arc<Notify>, Arc<Notify>)>>,
    pub fail_list: AtomicBool,
    pub fail_control: AtomicBool,
    pub fail_snapshots_for: Mutex<Option<String>>,
    pub cpu_usage: Mutex<f64>,
}

impl RecordingApi {
    pub fn new(vms: Vec<Vm>) -> Arc<Self> {
        Arc::new(Self {
            vms: Mutex::new(vms),
            ..Default::default()
        })
    }

    pub fn set_vms(&self, vms: Vec<Vm>) {
        *self.vms.lock().unwrap() = vms;
    }

    pub fn add_snapshot(&self, vm_name: &str, name: &str) {
        self.snapshots
            .lock()
            .unwrap()
            .entry(vm_name.to_string())
            .or_default()
            .push(Snapshot {
                vm_name: vm_name.to_string(),
                name: name.to_string(),
                date: Some("2024-05-01 10:00:00".to_string()),
                size: Some("1.2 GB".to_string()),
            });
    }

    pub fn snapshot_names(&self, vm_name: &str) -> Vec<String> {
        self.snapshots
            .lock()
            .unwrap()
            .get(vm_name)
            .map(|list| list.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn hold_control(&self) -> ControlGate {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some((entered.clone(), release.clone()));
        ControlGate { entered, release }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn control_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.contains("/control/")).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn backend_error(what: &str) -> VesselError {
        VesselError::NetworkFailure(format!("{} returned 500 Internal Server Error: boom", what))
    }
}

#[async_trait]
impl HypervisorApi for RecordingApi {
    async fn list_vms(&self) -> Result<Vec<Vm>> {
        self.record("GET /vms");
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::backend_error("GET /vms"));
        }
        Ok(self.vms.lock().unwrap().clone())
    }

    async fn get_vm(&self, name: &str) -> Result<Vm> {
        self.record(format!("GET /vms/{}", name));
        self.vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.name == name)
            .cloned()
            .ok_or_else(|| VesselError::UnknownVm(name.to_string()))
    }

    async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm> {
        self.record("POST /vms/create");
        let mut created = Vm::new(&request.name, LifecycleState::Shutoff);
        created.vcpus = request.cpu;
        created.memory = request.ram * 1024 * 1024 * 1024;
        created.disk_capacity = request.disk * 1024 * 1024 * 1024;
        created.vm_os = request.os.clone();
        self.vms.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn delete_vm(&self, name: &str) -> Result<()> {
        self.record(format!("DELETE /vms/{}", name));
        self.vms.lock().unwrap().retain(|vm| vm.name != name);
        Ok(())
    }

    async fn control(&self, name: &str, action: Action) -> Result<()> {
        self.record(format!("POST /vms/{}/control/{}", name, action));

        let gate = self.gate.lock().unwrap().clone();
        if let Some((entered, release)) = gate {
            entered.notify_one();
            release.notified().await;
        }

        if self.fail_control.load(Ordering::SeqCst) {
            return Err(Self::backend_error("control"));
        }

        let next = match action {
            Action::Start | Action::Resume | Action::Reboot => LifecycleState::Running,
            Action::Shutdown | Action::Poweroff => LifecycleState::Shutoff,
            Action::Pause => LifecycleState::Paused,
        };
        if let Some(vm) = self.vms.lock().unwrap().iter_mut().find(|vm| vm.name == name) {
            vm.state = next;
        }
        Ok(())
    }

    async fn vm_stats(&self, name: &str) -> Result<VmStats> {
        self.record(format!("GET /vms/{}/stats", name));
        Ok(VmStats {
            cpu_usage_percentage: *self.cpu_usage.lock().unwrap(),
        })
    }

    async fn list_snapshots(&self, vm_name: &str) -> Result<Vec<Snapshot>> {
        self.record(format!("GET /vms/{}/snapshots", vm_name));
        if self.fail_snapshots_for.lock().unwrap().as_deref() == Some(vm_name) {
            return Err(Self::backend_error("snapshots"));
        }
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(vm_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        self.record(format!("POST /vms/{}/snapshots", vm_name));
        self.add_snapshot(vm_name, snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        self.record(format!("DELETE /vms/{}/snapshots/{}", vm_name, snapshot));
        if let Some(list) = self.snapshots.lock().unwrap().get_mut(vm_name) {
            list.retain(|s| s.name != snapshot);
        }
        Ok(())
    }

    async fn restore_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        self.record(format!("POST /vms/{}/snapshots/{}/restore", vm_name, snapshot));
        Ok(())
    }

    async fn schedule_snapshot(&self, _request: &ScheduleRequest) -> Result<()> {
        self.record("POST /scheduler");
        Ok(())
    }
}

/// Gives a fixed answer and remembers every prompt it was shown.
pub struct ScriptedConfirmer {
    answer: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedConfirmer {
    pub fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        self.prompts.lock().unwrap().push(request.prompt());
        self.answer
    }
}
