//! One console session: the core components wired to a backend, plus the
//! background tasks that keep the registry in sync.

use crate::{
    Result, VesselError,
    api::{HttpHypervisorClient, HypervisorApi},
    config::VesselConfig,
    confirmation::{ConfirmationGateway, Confirmed, Confirmer, Operation},
    dispatcher::{CommandDispatcher, DispatchReport},
    events::EventListener,
    log_debug, log_info,
    notifications::NotificationCenter,
    reconciler::{Reconciler, RegistryChange},
    registry::RegistryView,
    snapshots::SnapshotService,
    vm::{Action, CreateVmRequest, ScheduleRequest, Snapshot, Vm, VmStats},
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

const PUSH_QUEUE_DEPTH: usize = 64;

pub struct ConsoleSession {
    config: VesselConfig,
    api: Arc<dyn HypervisorApi>,
    reconciler: Arc<Reconciler>,
    dispatcher: Arc<CommandDispatcher>,
    gateway: Arc<ConfirmationGateway>,
    snapshots: SnapshotService,
    notifications: NotificationCenter,
}

impl ConsoleSession {
    pub fn new(
        config: VesselConfig,
        api: Arc<dyn HypervisorApi>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        let notifications = NotificationCenter::new(config.ui.notification_history);
        let reconciler = Arc::new(Reconciler::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            api.clone(),
            reconciler.clone(),
            notifications.clone(),
        ));
        let gateway = Arc::new(ConfirmationGateway::new(
            confirmer,
            config.ui.confirm_instance_actions,
        ));
        let snapshots = SnapshotService::new(api.clone(), gateway.clone(), notifications.clone());

        Self {
            config,
            api,
            reconciler,
            dispatcher,
            gateway,
            snapshots,
            notifications,
        }
    }

    /// Session against the HTTP backend named in `config`.
    pub fn connect(config: VesselConfig, confirmer: Arc<dyn Confirmer>) -> Result<Self> {
        let client = HttpHypervisorClient::new(&config.api)?;
        log_info!("Using hypervisor API at {}", client.base_url());
        Ok(Self::new(config, Arc::new(client), confirmer))
    }

    pub fn config(&self) -> &VesselConfig {
        &self.config
    }

    pub fn view(&self) -> RegistryView {
        self.reconciler.view()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn notifications(&self) -> &NotificationCenter {
        &self.notifications
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.reconciler.subscribe()
    }

    pub async fn refresh(&self) -> Result<usize> {
        self.reconciler
            .refresh(self.api.as_ref())
            .await
            .inspect_err(|err| self.notifications.failure(format!("Failed to load VMs: {}", err)))
    }

    /// Confirmation (when required) followed by dispatch. Local checks run
    /// first so nobody is asked to confirm a command that would be rejected.
    pub async fn control(&self, vm_name: &str, action: &str) -> Result<Confirmed<DispatchReport>> {
        let action = action
            .parse::<Action>()
            .and_then(|action| self.dispatcher.check(vm_name, action).map(|()| action))
            .inspect_err(|err| self.notifications.failure(err.to_string()))?;

        self.gateway
            .with_confirmation(Operation::Control(action), vm_name, || {
                self.dispatcher.dispatch_action(vm_name, action)
            })
            .await
    }

    pub async fn create_vm(&self, request: &CreateVmRequest) -> Result<Vm> {
        let result = async {
            request.validate()?;
            self.api.create_vm(request).await
        }
        .await;

        match result {
            Ok(vm) => {
                self.reconciler.apply_vm(vm.clone());
                self.notifications
                    .success(format!("VM '{}' created", vm.name));
                Ok(vm)
            }
            Err(err) => {
                self.notifications
                    .failure(format!("Failed to create VM '{}': {}", request.name, err));
                Err(err)
            }
        }
    }

    pub async fn delete_vm(&self, vm_name: &str) -> Result<Confirmed<()>> {
        let outcome = async {
            if self.view().get(vm_name).is_none() {
                return Err(VesselError::UnknownVm(vm_name.to_string()));
            }

            self.gateway
                .with_confirmation(Operation::DeleteVm, vm_name, || async {
                    self.api.delete_vm(vm_name).await?;
                    self.reconciler.acknowledge_delete(vm_name);
                    Ok(())
                })
                .await
        }
        .await;

        match &outcome {
            Ok(Confirmed::Proceeded(())) => {
                self.notifications
                    .success(format!("VM '{}' deleted", vm_name));
            }
            Ok(Confirmed::Declined) => {}
            Err(err) => self.notifications.failure(err.to_string()),
        }
        outcome
    }

    /// Fetches one VM's full record and merges it into the registry.
    pub async fn vm_details(&self, vm_name: &str) -> Result<Vm> {
        self.reconciler.refresh_vm(self.api.as_ref(), vm_name).await
    }

    pub async fn vm_stats(&self, vm_name: &str) -> Result<VmStats> {
        let stats = self.api.vm_stats(vm_name).await?;
        self.reconciler
            .record_cpu_usage(vm_name, stats.cpu_usage_percentage);
        Ok(stats)
    }

    pub async fn list_snapshots(&self, vm_name: &str) -> Result<Vec<Snapshot>> {
        self.snapshots.list(vm_name).await
    }

    /// Snapshots of every VM currently in the registry.
    pub async fn list_all_snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.list_all(&self.view().names()).await
    }

    pub async fn create_snapshot(&self, vm_name: &str, name: &str) -> Result<String> {
        self.snapshots.create(vm_name, name).await
    }

    pub async fn restore_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<Confirmed<()>> {
        self.snapshots.restore(vm_name, snapshot).await
    }

    pub async fn delete_snapshot(&self, vm_name: &str, snapshot: &str) -> Result<Confirmed<()>> {
        self.snapshots.delete(vm_name, snapshot).await
    }

    pub async fn schedule_snapshot(&self, request: &ScheduleRequest) -> Result<()> {
        self.snapshots.schedule(request).await
    }

    /// Starts the periodic refresh (when `ui.auto_refresh`) and the push
    /// listener (when `api.events_url` is set). Both stop when the handle drops.
    pub fn spawn_sync(&self) -> SyncHandle {
        let mut tasks = Vec::new();

        if self.config.ui.auto_refresh {
            tasks.push(self.spawn_poller());
        }

        if let Some(url) = self.config.api.events_url.clone() {
            let (sender, mut receiver) = mpsc::channel(PUSH_QUEUE_DEPTH);
            tasks.push(tokio::spawn(EventListener::new(url).run(sender)));

            let reconciler = self.reconciler.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = receiver.recv().await {
                    reconciler.apply_push(event);
                }
            }));
        }

        log_debug!("Started {} background sync tasks", tasks.len());
        SyncHandle { tasks }
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let api = self.api.clone();
        let reconciler = self.reconciler.clone();
        let notifications = self.notifications.clone();
        let period = self.config.ui.refresh_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut healthy = true;

            loop {
                ticker.tick().await;
                match reconciler.refresh(api.as_ref()).await {
                    Ok(_) if !healthy => {
                        healthy = true;
                        notifications.info("Connection to the hypervisor restored");
                    }
                    Ok(_) => {}
                    // Only the first failure in a row is worth telling the user about.
                    Err(err) if healthy => {
                        healthy = false;
                        notifications.warning(format!("Auto-refresh failed: {}", err));
                    }
                    Err(_) => {}
                }
            }
        })
    }
}

/// Background sync tasks; aborted on drop.
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.iter().any(|task| !task.is_finished())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
