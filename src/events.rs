use crate::{
    Result, VesselError, log_debug, log_info, log_warn,
    vm::{LifecycleState, Vm},
};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Unsolicited notification from the hypervisor's push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    VmCreated(Vm),
    VmStatusUpdated {
        name: String,
        state: LifecycleState,
    },
    VmCpuUpdated {
        name: String,
        cpu_usage_percentage: f64,
    },
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(alias = "vm_name")]
    name: String,
    #[serde(alias = "status")]
    state: LifecycleState,
}

#[derive(Deserialize)]
struct CpuPayload {
    #[serde(alias = "vm_name")]
    name: String,
    cpu_usage_percentage: f64,
}

impl PushEvent {
    pub fn vm_name(&self) -> &str {
        match self {
            PushEvent::VmCreated(vm) => &vm.name,
            PushEvent::VmStatusUpdated { name, .. } => name,
            PushEvent::VmCpuUpdated { name, .. } => name,
        }
    }

    /// Parses one text frame `{"event": ..., "data": {...}}`.
    /// Returns `Ok(None)` for events the console does not track.
    pub fn parse(frame: &str) -> Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(frame)?;

        let event = match envelope.event.as_str() {
            "vm_created" => PushEvent::VmCreated(serde_json::from_value(envelope.data)?),
            "vm_status_updated" => {
                let payload: StatusPayload = serde_json::from_value(envelope.data)?;
                PushEvent::VmStatusUpdated {
                    name: payload.name,
                    state: payload.state,
                }
            }
            "vm_cpu_updated" => {
                let payload: CpuPayload = serde_json::from_value(envelope.data)?;
                PushEvent::VmCpuUpdated {
                    name: payload.name,
                    cpu_usage_percentage: payload.cpu_usage_percentage,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

/// Keeps a WebSocket subscription open and forwards parsed events.
pub struct EventListener {
    url: String,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl EventListener {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_reconnect_delay)
    }

    /// Runs until the receiving side of `events` is dropped.
    pub async fn run(self, events: mpsc::Sender<PushEvent>) {
        let mut delay = self.reconnect_delay;

        loop {
            match self.read_session(&events).await {
                Ok(SessionEnd::ReceiverGone) => {
                    log_debug!("Push listener for {} stopped", self.url);
                    return;
                }
                Ok(SessionEnd::Closed) => {
                    log_info!("Push channel {} closed, reconnecting", self.url);
                    delay = self.reconnect_delay;
                }
                Err(err) => {
                    log_warn!("Push channel {} unavailable: {}", self.url, err);
                }
            }

            if events.is_closed() {
                return;
            }
            sleep(delay).await;
            delay = self.next_delay(delay);
        }
    }

    async fn read_session(&self, events: &mpsc::Sender<PushEvent>) -> Result<SessionEnd> {
        let (mut stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| VesselError::NetworkFailure(e.to_string()))?;
        log_info!("Connected to push channel {}", self.url);

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| VesselError::NetworkFailure(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(SessionEnd::Closed),
                _ => continue,
            };

            match PushEvent::parse(text.as_str()) {
                Ok(Some(event)) => {
                    if events.send(event).await.is_err() {
                        return Ok(SessionEnd::ReceiverGone);
                    }
                }
                Ok(None) => log_debug!("Ignoring untracked push event: {}", text.as_str()),
                Err(err) => log_warn!("Dropping malformed push frame: {}", err),
            }
        }

        Ok(SessionEnd::Closed)
    }
}

enum SessionEnd {
    Closed,
    ReceiverGone,
}
