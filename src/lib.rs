pub mod api;
pub mod config;
pub mod confirmation;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logger;
pub mod notifications;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod snapshots;
pub mod vm;

pub use error::VesselError;
pub use vm::{Action, LifecycleState, Vm};

pub type Result<T> = std::result::Result<T, VesselError>;

// Convenience re-exports for the lifecycle core
pub use api::{HttpHypervisorClient, HypervisorApi};
pub use confirmation::{AutoConfirm, ConfirmationGateway, Confirmed, Confirmer, TerminalConfirmer};
pub use dispatcher::{CommandDispatcher, DispatchReport};
pub use notifications::{Notification, NotificationCenter, NotificationLevel};
pub use reconciler::{PushOutcome, Reconciler, RegistryChange};
pub use registry::{RegistryView, VmRegistry};
pub use session::{ConsoleSession, SyncHandle};
