use crate::{log_error, log_info, log_warn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Failure,
}

impl fmt::Display for NotificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NotificationLevel::Info => "info",
            NotificationLevel::Success => "ok",
            NotificationLevel::Warning => "warning",
            NotificationLevel::Failure => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// User-visible outcome feed: a bounded history plus a live broadcast.
#[derive(Debug, Clone)]
pub struct NotificationCenter {
    history: Arc<Mutex<VecDeque<Notification>>>,
    capacity: usize,
    sender: broadcast::Sender<Notification>,
}

impl NotificationCenter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            sender,
        }
    }

    pub fn push(&self, level: NotificationLevel, message: impl Into<String>) {
        let notification = Notification {
            level,
            message: message.into(),
            at: Utc::now(),
        };

        match level {
            NotificationLevel::Failure => log_error!("{}", notification.message),
            NotificationLevel::Warning => log_warn!("{}", notification.message),
            _ => log_info!("{}", notification.message),
        }

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(notification.clone());
        }

        // No live subscribers is fine.
        let _ = self.sender.send(notification);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(NotificationLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(NotificationLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(NotificationLevel::Warning, message);
    }

    pub fn failure(&self, message: impl Into<String>) {
        self.push(NotificationLevel::Failure, message);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<Notification> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<Notification> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .back()
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }
}

impl Default for NotificationCenter {
    fn default() -> Self {
        Self::new(200)
    }
}
