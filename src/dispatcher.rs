use crate::{
    Result, VesselError,
    api::HypervisorApi,
    log_debug, log_info,
    notifications::NotificationCenter,
    reconciler::Reconciler,
    vm::{Action, LifecycleState, PendingCommand},
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// States in which an action would not change what the user can observe.
/// Actions missing from the table are never redundant.
const REDUNDANT_STATES: &[(Action, &[LifecycleState])] = &[
    (Action::Start, &[LifecycleState::Running]),
    (Action::Resume, &[LifecycleState::Running]),
    (
        Action::Shutdown,
        &[LifecycleState::Shutdown, LifecycleState::Shutoff],
    ),
    (
        Action::Poweroff,
        &[LifecycleState::Shutdown, LifecycleState::Shutoff],
    ),
    (Action::Pause, &[LifecycleState::Paused]),
];

pub fn is_redundant(action: Action, state: LifecycleState) -> bool {
    REDUNDANT_STATES
        .iter()
        .find(|(candidate, _)| *candidate == action)
        .is_some_and(|(_, states)| states.contains(&state))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub command_id: Uuid,
    pub vm_name: String,
    pub action: Action,
    /// Whether the follow-up full listing succeeded.
    pub refreshed: bool,
}

/// Validates and sends lifecycle commands, one in flight per VM.
pub struct CommandDispatcher {
    api: Arc<dyn HypervisorApi>,
    reconciler: Arc<Reconciler>,
    notifications: NotificationCenter,
    pending: Mutex<HashMap<String, PendingCommand>>,
}

impl CommandDispatcher {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        reconciler: Arc<Reconciler>,
        notifications: NotificationCenter,
    ) -> Self {
        Self {
            api,
            reconciler,
            notifications,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Entry point for free-form action names (CLI arguments, key bindings).
    pub async fn dispatch(&self, vm_name: &str, action: &str) -> Result<DispatchReport> {
        match action.parse::<Action>() {
            Ok(action) => self.dispatch_action(vm_name, action).await,
            Err(err) => {
                self.notifications.failure(err.to_string());
                Err(err)
            }
        }
    }

    pub async fn dispatch_action(&self, vm_name: &str, action: Action) -> Result<DispatchReport> {
        let result = self.execute(vm_name, action).await;

        match &result {
            Ok(report) => {
                self.notifications
                    .success(format!("{} sent to VM '{}'", action, vm_name));
                if !report.refreshed {
                    self.notifications.warning(format!(
                        "Could not refresh the VM list after {} of '{}'",
                        action, vm_name
                    ));
                }
            }
            Err(err) => self.notifications.failure(err.to_string()),
        }

        result
    }

    /// Runs the local checks without sending anything, e.g. before asking for confirmation.
    pub fn check(&self, vm_name: &str, action: Action) -> Result<()> {
        let pending = self.lock_pending();
        self.validate(&pending, vm_name, action)
    }

    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        self.lock_pending().values().cloned().collect()
    }

    pub fn is_pending(&self, vm_name: &str) -> bool {
        self.lock_pending().contains_key(vm_name)
    }

    async fn execute(&self, vm_name: &str, action: Action) -> Result<DispatchReport> {
        let guard = self.begin(vm_name, action)?;
        let command_id = guard.command_id;
        log_debug!("Dispatching {} to '{}' ({})", action, vm_name, command_id);

        self.api
            .control(vm_name, action)
            .await
            .map_err(|source| VesselError::ActionFailed {
                action,
                vm: vm_name.to_string(),
                source: Box::new(source),
            })?;
        log_info!("{} accepted for VM '{}'", action, vm_name);

        // The terminal state is not knowable here, so re-read everything.
        let refreshed = self.reconciler.refresh(self.api.as_ref()).await.is_ok();
        drop(guard);

        Ok(DispatchReport {
            command_id,
            vm_name: vm_name.to_string(),
            action,
            refreshed,
        })
    }

    /// Checks and registration happen under one lock so two callers can't both pass.
    fn begin(&self, vm_name: &str, action: Action) -> Result<PendingGuard<'_>> {
        let mut pending = self.lock_pending();
        self.validate(&pending, vm_name, action)?;

        let command = PendingCommand::new(vm_name, action);
        let command_id = command.id;
        pending.insert(vm_name.to_string(), command);

        Ok(PendingGuard {
            pending: &self.pending,
            vm_name: vm_name.to_string(),
            command_id,
        })
    }

    fn validate(
        &self,
        pending: &HashMap<String, PendingCommand>,
        vm_name: &str,
        action: Action,
    ) -> Result<()> {
        // Read now, not before any earlier await.
        let state = self
            .reconciler
            .view()
            .state_of(vm_name)
            .ok_or_else(|| VesselError::UnknownVm(vm_name.to_string()))?;

        if is_redundant(action, state) {
            return Err(VesselError::RedundantAction {
                vm: vm_name.to_string(),
                action,
                state,
            });
        }

        if let Some(in_flight) = pending.get(vm_name) {
            return Err(VesselError::CommandInFlight {
                vm: vm_name.to_string(),
                action: in_flight.action,
            });
        }

        Ok(())
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingCommand>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the pending entry however the dispatch ends.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<String, PendingCommand>>,
    vm_name: String,
    command_id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending
            .get(&self.vm_name)
            .is_some_and(|command| command.id == self.command_id)
        {
            pending.remove(&self.vm_name);
        }
    }
}
