use crate::{Result, log_debug, log_warn, vm::Action};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

/// An operation that may need the user's go-ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Control(Action),
    DeleteVm,
    RestoreSnapshot(String),
    DeleteSnapshot(String),
}

impl Operation {
    /// Destructive or service-interrupting operations are always confirmed.
    pub fn always_confirm(&self) -> bool {
        match self {
            Operation::Control(action) => action.is_destructive(),
            Operation::DeleteVm | Operation::RestoreSnapshot(_) | Operation::DeleteSnapshot(_) => {
                true
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Control(action) => write!(f, "{}", action),
            Operation::DeleteVm => f.write_str("delete"),
            Operation::RestoreSnapshot(snapshot) => write!(f, "restore snapshot '{}'", snapshot),
            Operation::DeleteSnapshot(snapshot) => write!(f, "delete snapshot '{}'", snapshot),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    pub operation: Operation,
    pub vm_name: String,
}

impl ConfirmationRequest {
    pub fn prompt(&self) -> String {
        match &self.operation {
            Operation::Control(action) => {
                format!("Are you sure you want to {} VM '{}'?", action, self.vm_name)
            }
            Operation::DeleteVm => format!("Are you sure you want to delete VM '{}'?", self.vm_name),
            Operation::RestoreSnapshot(snapshot) => format!(
                "Are you sure you want to restore the snapshot \"{}\" for VM \"{}\"?",
                snapshot, self.vm_name
            ),
            Operation::DeleteSnapshot(snapshot) => format!(
                "Are you sure you want to delete the snapshot \"{}\" for VM \"{}\"?",
                snapshot, self.vm_name
            ),
        }
    }
}

/// Source of the user's yes/no decision. The answer may take arbitrarily long.
#[async_trait]
pub trait Confirmer: Send + Sync {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool;
}

/// Answers every request the same way (`--yes`, scripted runs).
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, _request: &ConfirmationRequest) -> bool {
        self.0
    }
}

/// Prompts on the controlling terminal without blocking the async runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalConfirmer;

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, request: &ConfirmationRequest) -> bool {
        let prompt = request.prompt();
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stdout = io::stdout();
            write!(stdout, "{} [y/N]: ", prompt)?;
            stdout.flush()?;

            let mut input = String::new();
            io::stdin().lock().read_line(&mut input)?;
            Ok(input)
        })
        .await;

        match answer {
            Ok(Ok(input)) => matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Ok(Err(err)) => {
                log_warn!("Failed to read confirmation: {}", err);
                false
            }
            Err(err) => {
                log_warn!("Confirmation prompt aborted: {}", err);
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmed<T> {
    Proceeded(T),
    Declined,
}

impl<T> Confirmed<T> {
    pub fn is_declined(&self) -> bool {
        matches!(self, Confirmed::Declined)
    }

    pub fn proceeded(self) -> Option<T> {
        match self {
            Confirmed::Proceeded(value) => Some(value),
            Confirmed::Declined => None,
        }
    }
}

pub struct ConfirmationGateway {
    confirmer: Arc<dyn Confirmer>,
    confirm_optional: bool,
}

impl ConfirmationGateway {
    /// `confirm_optional` extends confirmation to non-destructive operations.
    pub fn new(confirmer: Arc<dyn Confirmer>, confirm_optional: bool) -> Self {
        Self {
            confirmer,
            confirm_optional,
        }
    }

    pub fn requires_confirmation(&self, operation: &Operation) -> bool {
        operation.always_confirm() || self.confirm_optional
    }

    /// Asks when required, then runs `proceed`. A "no" has no side effects and is not an error.
    pub async fn with_confirmation<F, Fut, T>(
        &self,
        operation: Operation,
        vm_name: &str,
        proceed: F,
    ) -> Result<Confirmed<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.requires_confirmation(&operation) {
            let request = ConfirmationRequest {
                operation,
                vm_name: vm_name.to_string(),
            };
            if !self.confirmer.confirm(&request).await {
                log_debug!("User declined to {} '{}'", request.operation, vm_name);
                return Ok(Confirmed::Declined);
            }
        }

        proceed().await.map(Confirmed::Proceeded)
    }
}
