use crate::{
    Result,
    api::HypervisorApi,
    events::PushEvent,
    log_debug, log_info, log_warn,
    registry::{RegistryView, SharedRegistry, VmRegistry, lock},
    vm::{LifecycleState, Vm},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const CHANGE_FEED_CAPACITY: usize = 256;

/// What a reconciliation step did to the registry, for views that re-render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    Added {
        name: String,
        state: LifecycleState,
    },
    StateChanged {
        name: String,
        from: LifecycleState,
        to: LifecycleState,
    },
    Removed {
        name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Applied,
    /// The event named a VM the registry does not know.
    Dropped,
}

/// Sole writer of the VM registry. Merges full listings, single-VM fetches and
/// push events; the latest arrival wins for `state`.
pub struct Reconciler {
    registry: SharedRegistry,
    changes: broadcast::Sender<RegistryChange>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::with_registry(VmRegistry::new())
    }

    pub fn with_registry(registry: VmRegistry) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(registry)),
            changes,
        }
    }

    pub fn view(&self) -> RegistryView {
        RegistryView::new(self.registry.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    /// Authoritative for every VM in the listing. Absent VMs stay.
    pub fn apply_full_list(&self, vms: Vec<Vm>) -> usize {
        let count = vms.len();
        let changes = {
            let mut registry = lock(&self.registry);
            // A name listed twice is compared against its earlier entry, not the old registry.
            let mut seen: HashMap<&str, LifecycleState> = HashMap::new();
            let mut changes = Vec::new();
            for vm in &vms {
                let previous = seen
                    .get(vm.name.as_str())
                    .copied()
                    .or_else(|| registry.get(&vm.name).map(|v| v.state));
                changes.extend(describe_change(previous, vm));
                seen.insert(vm.name.as_str(), vm.state);
            }
            registry.apply_full_list(vms);
            changes
        };

        log_debug!(
            "Applied full listing of {} VMs ({} changes)",
            count,
            changes.len()
        );
        self.publish(changes);
        count
    }

    /// Detail fetches and `vm_created` pushes replace the whole record.
    pub fn apply_vm(&self, vm: Vm) {
        let change = {
            let mut registry = lock(&self.registry);
            let change = describe_change(registry.get(&vm.name).map(|v| v.state), &vm);
            registry.upsert(vm);
            change
        };
        self.publish(change);
    }

    pub fn apply_push(&self, event: PushEvent) -> PushOutcome {
        match event {
            PushEvent::VmCreated(vm) => {
                log_info!("VM '{}' created on the hypervisor", vm.name);
                self.apply_vm(vm);
                PushOutcome::Applied
            }
            PushEvent::VmStatusUpdated { name, state } => {
                let change = {
                    let mut registry = lock(&self.registry);
                    let previous = registry.get(&name).map(|vm| vm.state);
                    match previous {
                        Some(from) => {
                            registry.patch_state(&name, state);
                            Some((from != state).then(|| RegistryChange::StateChanged {
                                name: name.clone(),
                                from,
                                to: state,
                            }))
                        }
                        None => None,
                    }
                };

                match change {
                    Some(change) => {
                        self.publish(change);
                        PushOutcome::Applied
                    }
                    None => {
                        log_debug!(
                            "Dropping state push for unknown VM '{}' ({})",
                            name,
                            state
                        );
                        PushOutcome::Dropped
                    }
                }
            }
            PushEvent::VmCpuUpdated {
                name,
                cpu_usage_percentage,
            } => {
                if self.record_cpu_usage(&name, cpu_usage_percentage) {
                    PushOutcome::Applied
                } else {
                    log_debug!("Dropping CPU push for unknown VM '{}'", name);
                    PushOutcome::Dropped
                }
            }
        }
    }

    pub fn record_cpu_usage(&self, name: &str, percentage: f64) -> bool {
        lock(&self.registry).patch_cpu_usage(name, percentage)
    }

    /// Removes a VM once the backend has confirmed its deletion.
    pub fn acknowledge_delete(&self, name: &str) -> Option<Vm> {
        let removed = lock(&self.registry).remove(name);
        if removed.is_some() {
            self.publish(Some(RegistryChange::Removed {
                name: name.to_string(),
            }));
        }
        removed
    }

    /// Full re-fetch. On failure the registry is left exactly as it was.
    pub async fn refresh(&self, api: &dyn HypervisorApi) -> Result<usize> {
        match api.list_vms().await {
            Ok(vms) => Ok(self.apply_full_list(vms)),
            Err(err) => {
                log_warn!("VM list refresh failed: {}", err);
                Err(err)
            }
        }
    }

    pub async fn refresh_vm(&self, api: &dyn HypervisorApi, name: &str) -> Result<Vm> {
        let vm = api.get_vm(name).await?;
        self.apply_vm(vm.clone());
        Ok(vm)
    }

    fn publish(&self, changes: impl IntoIterator<Item = RegistryChange>) {
        for change in changes {
            let _ = self.changes.send(change);
        }
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn describe_change(previous: Option<LifecycleState>, vm: &Vm) -> Option<RegistryChange> {
    match previous {
        None => Some(RegistryChange::Added {
            name: vm.name.clone(),
            state: vm.state,
        }),
        Some(from) if from != vm.state => Some(RegistryChange::StateChanged {
            name: vm.name.clone(),
            from,
            to: vm.state,
        }),
        Some(_) => None,
    }
}
