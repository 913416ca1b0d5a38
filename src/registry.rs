use crate::vm::{LifecycleState, Vm};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Last-known-good state of every VM the console has seen, keyed by name.
///
/// Order follows the most recent full refresh. VMs that dropped out of a later
/// refresh keep their previous relative order behind it; single inserts append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmRegistry {
    order: Vec<String>,
    vms: HashMap<String, Vm>,
    cpu_usage: HashMap<String, f64>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> Vec<Vm> {
        self.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vm> {
        self.order.iter().filter_map(|name| self.vms.get(name))
    }

    pub fn get(&self, name: &str) -> Option<&Vm> {
        self.vms.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vms.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// Inserts or replaces the whole record. Returns true when the name was new.
    pub fn upsert(&mut self, vm: Vm) -> bool {
        let is_new = !self.vms.contains_key(&vm.name);
        if is_new {
            self.order.push(vm.name.clone());
        }
        self.vms.insert(vm.name.clone(), vm);
        is_new
    }

    /// Updates only `state`. Unknown names are ignored; returns whether a record was touched.
    pub fn patch_state(&mut self, name: &str, state: LifecycleState) -> bool {
        match self.vms.get_mut(name) {
            Some(vm) => {
                vm.state = state;
                true
            }
            None => false,
        }
    }

    pub fn patch_cpu_usage(&mut self, name: &str, percentage: f64) -> bool {
        if !self.vms.contains_key(name) {
            return false;
        }
        self.cpu_usage.insert(name.to_string(), percentage);
        true
    }

    pub fn cpu_usage(&self, name: &str) -> Option<f64> {
        self.cpu_usage.get(name).copied()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vm> {
        let removed = self.vms.remove(name)?;
        self.order.retain(|entry| entry != name);
        self.cpu_usage.remove(name);
        Some(removed)
    }

    /// Applies a full listing: every entry is upserted and the listing order
    /// becomes the leading order. Nothing is removed.
    pub fn apply_full_list(&mut self, vms: Vec<Vm>) {
        let mut order: Vec<String> = Vec::with_capacity(vms.len().max(self.order.len()));
        for vm in vms {
            if !order.contains(&vm.name) {
                order.push(vm.name.clone());
            }
            self.vms.insert(vm.name.clone(), vm);
        }

        for name in &self.order {
            if !order.contains(name) {
                order.push(name.clone());
            }
        }
        self.order = order;
    }
}

/// Shared handle for the single writer.
pub(crate) type SharedRegistry = Arc<Mutex<VmRegistry>>;

pub(crate) fn lock(registry: &SharedRegistry) -> MutexGuard<'_, VmRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Read-only access to the registry for everything except the reconciler.
#[derive(Debug, Clone)]
pub struct RegistryView {
    inner: SharedRegistry,
}

impl RegistryView {
    pub(crate) fn new(inner: SharedRegistry) -> Self {
        Self { inner }
    }

    pub fn get(&self, name: &str) -> Option<Vm> {
        lock(&self.inner).get(name).cloned()
    }

    pub fn state_of(&self, name: &str) -> Option<LifecycleState> {
        lock(&self.inner).get(name).map(|vm| vm.state)
    }

    pub fn list(&self) -> Vec<Vm> {
        lock(&self.inner).list()
    }

    pub fn names(&self) -> Vec<String> {
        lock(&self.inner).names()
    }

    pub fn cpu_usage(&self, name: &str) -> Option<f64> {
        lock(&self.inner).cpu_usage(name)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Point-in-time copy of the whole table.
    pub fn snapshot(&self) -> VmRegistry {
        lock(&self.inner).clone()
    }
}
