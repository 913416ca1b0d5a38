use crate::{
    Result, VesselError,
    api::HypervisorApi,
    confirmation::{ConfirmationGateway, Confirmed, Operation},
    log_warn,
    notifications::NotificationCenter,
    vm::{ScheduleRequest, Snapshot},
};
use chrono::{NaiveDate, Utc};
use futures_util::future::join_all;
use std::sync::Arc;

/// Snapshot names carry the day they were taken.
pub fn dated_snapshot_name(base: &str, date: NaiveDate) -> String {
    format!("{} {}", base.trim(), date.format("%Y-%m-%d"))
}

pub struct SnapshotService {
    api: Arc<dyn HypervisorApi>,
    gateway: Arc<ConfirmationGateway>,
    notifications: NotificationCenter,
}

impl SnapshotService {
    pub fn new(
        api: Arc<dyn HypervisorApi>,
        gateway: Arc<ConfirmationGateway>,
        notifications: NotificationCenter,
    ) -> Self {
        Self {
            api,
            gateway,
            notifications,
        }
    }

    pub async fn list(&self, vm_name: &str) -> Result<Vec<Snapshot>> {
        self.api.list_snapshots(vm_name).await
    }

    /// Snapshots of several VMs. A VM whose listing fails contributes nothing.
    pub async fn list_all(&self, vm_names: &[String]) -> Vec<Snapshot> {
        let listings = join_all(vm_names.iter().map(|name| self.api.list_snapshots(name))).await;

        vm_names
            .iter()
            .zip(listings)
            .flat_map(|(name, listing)| match listing {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    log_warn!("Could not list snapshots of '{}': {}", name, err);
                    Vec::new()
                }
            })
            .collect()
    }

    /// Returns the stored (dated) name.
    pub async fn create(&self, vm_name: &str, name: &str) -> Result<String> {
        if name.trim().is_empty() {
            return Err(VesselError::ConfigError(
                "snapshot name must not be empty".to_string(),
            ));
        }

        let snapshot = dated_snapshot_name(name, Utc::now().date_naive());
        let result = self.api.create_snapshot(vm_name, &snapshot).await;
        self.report(
            &result,
            format!("Snapshot '{}' created for VM '{}'", snapshot, vm_name),
        );
        result.map(|()| snapshot)
    }

    pub async fn restore(&self, vm_name: &str, snapshot: &str) -> Result<Confirmed<()>> {
        let outcome = async {
            self.ensure_exists(vm_name, snapshot).await?;
            self.gateway
                .with_confirmation(
                    Operation::RestoreSnapshot(snapshot.to_string()),
                    vm_name,
                    || self.api.restore_snapshot(vm_name, snapshot),
                )
                .await
        }
        .await;
        self.report(
            &outcome,
            format!("VM '{}' restored to snapshot '{}'", vm_name, snapshot),
        );
        outcome
    }

    pub async fn delete(&self, vm_name: &str, snapshot: &str) -> Result<Confirmed<()>> {
        let outcome = async {
            self.ensure_exists(vm_name, snapshot).await?;
            self.gateway
                .with_confirmation(
                    Operation::DeleteSnapshot(snapshot.to_string()),
                    vm_name,
                    || self.api.delete_snapshot(vm_name, snapshot),
                )
                .await
        }
        .await;
        self.report(
            &outcome,
            format!("Snapshot '{}' of VM '{}' deleted", snapshot, vm_name),
        );
        outcome
    }

    pub async fn schedule(&self, request: &ScheduleRequest) -> Result<()> {
        let result = self.api.schedule_snapshot(request).await;
        self.report(
            &result,
            format!(
                "Snapshot '{}' of VM '{}' scheduled ({} {})",
                request.snapshot_name, request.vm_name, request.day, request.interval
            ),
        );
        result
    }

    async fn ensure_exists(&self, vm_name: &str, snapshot: &str) -> Result<()> {
        let snapshots = self.api.list_snapshots(vm_name).await?;
        if snapshots.iter().any(|s| s.name == snapshot) {
            Ok(())
        } else {
            Err(VesselError::SnapshotNotFound {
                vm: vm_name.to_string(),
                snapshot: snapshot.to_string(),
            })
        }
    }

    fn report<T: Reportable>(&self, result: &Result<T>, success: String) {
        match result {
            Ok(value) if value.was_declined() => {}
            Ok(_) => self.notifications.success(success),
            Err(err) => self.notifications.failure(err.to_string()),
        }
    }
}

trait Reportable {
    fn was_declined(&self) -> bool {
        false
    }
}

impl Reportable for () {}

impl Reportable for Confirmed<()> {
    fn was_declined(&self) -> bool {
        self.is_declined()
    }
}
