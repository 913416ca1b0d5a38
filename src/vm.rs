use crate::{Result, VesselError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Attached disk or cdrom as reported by the backend (`target`, `location`, ...).
pub type MediaDescriptor = BTreeMap<String, serde_json::Value>;

/// Renders a media descriptor as `target -> location`; an empty drive shows `-`.
pub fn describe_media(media: &MediaDescriptor) -> String {
    let field = |key: &str| media.get(key).and_then(|v| v.as_str()).unwrap_or("-");
    format!("{} -> {}", field("target"), field("location"))
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Domain lifecycle state, integer-coded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
    #[default]
    Unknown,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 8] = [
        LifecycleState::Running,
        LifecycleState::Blocked,
        LifecycleState::Paused,
        LifecycleState::Shutdown,
        LifecycleState::Shutoff,
        LifecycleState::Crashed,
        LifecycleState::Suspended,
        LifecycleState::Unknown,
    ];

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => LifecycleState::Running,
            2 => LifecycleState::Blocked,
            3 => LifecycleState::Paused,
            4 => LifecycleState::Shutdown,
            5 => LifecycleState::Shutoff,
            6 => LifecycleState::Crashed,
            7 => LifecycleState::Suspended,
            _ => LifecycleState::Unknown,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            LifecycleState::Running => 1,
            LifecycleState::Blocked => 2,
            LifecycleState::Paused => 3,
            LifecycleState::Shutdown => 4,
            LifecycleState::Shutoff => 5,
            LifecycleState::Crashed => 6,
            LifecycleState::Suspended => 7,
            LifecycleState::Unknown => 0,
        }
    }

    /// Labels used by push events. Numeric strings are treated as codes.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        if let Ok(code) = label.parse::<i64>() {
            return Self::from_code(code);
        }

        match label.to_ascii_lowercase().as_str() {
            "running" | "start" | "started" | "resumed" => LifecycleState::Running,
            "blocked" => LifecycleState::Blocked,
            "paused" | "pause" => LifecycleState::Paused,
            "shutdown" | "shutting-down" => LifecycleState::Shutdown,
            "shutoff" | "poweroff" | "powered-off" | "stopped" => LifecycleState::Shutoff,
            "crashed" => LifecycleState::Crashed,
            "suspended" | "pmsuspended" => LifecycleState::Suspended,
            _ => LifecycleState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Running => "running",
            LifecycleState::Blocked => "blocked",
            LifecycleState::Paused => "paused",
            LifecycleState::Shutdown => "shutdown",
            LifecycleState::Shutoff => "shutoff",
            LifecycleState::Crashed => "crashed",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LifecycleState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawState {
    Code(i64),
    Label(String),
}

impl<'de> Deserialize<'de> for LifecycleState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<RawState>::deserialize(deserializer)?;
        Ok(match raw {
            Some(RawState::Code(code)) => LifecycleState::from_code(code),
            Some(RawState::Label(label)) => LifecycleState::from_label(&label),
            None => LifecycleState::Unknown,
        })
    }
}

/// Backend identifier. libvirt reports `-1` for inactive domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VmId {
    Numeric(i64),
    Text(String),
}

impl Default for VmId {
    fn default() -> Self {
        VmId::Numeric(-1)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmId::Numeric(id) if *id < 0 => f.write_str("-"),
            VmId::Numeric(id) => write!(f, "{}", id),
            VmId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    #[serde(default)]
    pub id: VmId,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    /// Bytes.
    #[serde(default)]
    pub memory: u64,
    /// Bytes.
    #[serde(default)]
    pub disk_capacity: u64,
    #[serde(default)]
    pub vm_os: String,
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub disks: Vec<MediaDescriptor>,
    #[serde(default)]
    pub cdroms: Vec<MediaDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_flag"
    )]
    pub autostart: Option<bool>,
}

fn default_vcpus() -> u32 {
    1
}

// libvirt bindings report autostart as 0/1.
fn deserialize_flag<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<bool>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFlag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Option::<RawFlag>::deserialize(deserializer)? {
        Some(RawFlag::Bool(flag)) => Some(flag),
        Some(RawFlag::Int(value)) => Some(value != 0),
        None => None,
    })
}

impl Vm {
    pub fn new(name: impl Into<String>, state: LifecycleState) -> Self {
        Self {
            name: name.into(),
            id: VmId::default(),
            vcpus: default_vcpus(),
            memory: 0,
            disk_capacity: 0,
            vm_os: String::new(),
            state,
            disks: Vec::new(),
            cdroms: Vec::new(),
            uuid: None,
            max_memory: None,
            autostart: None,
        }
    }

    pub fn memory_gib(&self) -> f64 {
        self.memory as f64 / GIB
    }

    pub fn disk_capacity_gib(&self) -> f64 {
        self.disk_capacity as f64 / GIB
    }

    /// Short OS label from an osinfo URI such as `http://ubuntu.com/ubuntu/22.04`.
    pub fn os_label(&self) -> String {
        let segments: Vec<&str> = self.vm_os.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [scheme, _host, distro, version, ..] if scheme.ends_with(':') => {
                format!("{} {}", distro, version)
            }
            [scheme, _host, distro] if scheme.ends_with(':') => distro.to_string(),
            _ if self.vm_os.is_empty() => "-".to_string(),
            _ => self.vm_os.clone(),
        }
    }
}

/// Control action a user can request for a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Resume,
    Reboot,
    Shutdown,
    Poweroff,
    Pause,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Start,
        Action::Resume,
        Action::Reboot,
        Action::Shutdown,
        Action::Poweroff,
        Action::Pause,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Resume => "resume",
            Action::Reboot => "reboot",
            Action::Shutdown => "shutdown",
            Action::Poweroff => "poweroff",
            Action::Pause => "pause",
        }
    }

    /// Service-interrupting actions that always go through a confirmation.
    pub fn is_destructive(&self) -> bool {
        matches!(self, Action::Shutdown | Action::Poweroff)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = VesselError;

    fn from_str(s: &str) -> Result<Self> {
        Action::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| VesselError::UnknownAction(s.to_string()))
    }
}

/// A control request between dispatch and resolution. Never stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub id: Uuid,
    pub vm_name: String,
    pub action: Action,
    pub submitted_at: DateTime<Utc>,
}

impl PendingCommand {
    pub fn new(vm_name: impl Into<String>, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            vm_name: vm_name.into(),
            action,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub vm_name: String,
    pub name: String,
    /// Creation date as reported by the backend.
    #[serde(default)]
    pub date: Option<String>,
    /// Approximate size, e.g. "3.2 GB".
    #[serde(default)]
    pub size: Option<String>,
}

/// Body of `POST /vms/create`. `ram` and `disk` are whole GiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    pub cpu: u32,
    pub ram: u64,
    pub disk: u64,
    pub os: String,
}

impl CreateVmRequest {
    pub fn validate(&self) -> Result<()> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

        if !valid_name {
            return Err(VesselError::ConfigError(format!(
                "VM name '{}' contains unsupported characters. Use letters, numbers, '-', '_' or '.'.",
                self.name
            )));
        }
        if self.cpu == 0 {
            return Err(VesselError::ConfigError(
                "a VM needs at least one vCPU".to_string(),
            ));
        }
        if self.ram == 0 || self.disk == 0 {
            return Err(VesselError::ConfigError(
                "RAM and disk must be at least 1 GiB".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VmStats {
    pub cpu_usage_percentage: f64,
}

/// Body of `POST /scheduler`: cron-style recurring snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub vm_name: String,
    pub snapshot_name: String,
    pub day: String,
    pub interval: String,
}

impl ScheduleRequest {
    pub fn new(vm_name: impl Into<String>, snapshot_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            snapshot_name: snapshot_name.into(),
            day: "*".to_string(),
            interval: "*/1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_codes_round_trip_through_the_enum() {
        for code in 1..=7 {
            assert_eq!(LifecycleState::from_code(code).code(), code);
        }
        assert_eq!(LifecycleState::from_code(0), LifecycleState::Unknown);
        assert_eq!(LifecycleState::from_code(42), LifecycleState::Unknown);
    }

    #[test]
    fn state_accepts_codes_and_labels() {
        let code: LifecycleState = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(code, LifecycleState::Shutoff);

        let label: LifecycleState = serde_json::from_value(json!("running")).unwrap();
        assert_eq!(label, LifecycleState::Running);

        let numeric_label: LifecycleState = serde_json::from_value(json!("3")).unwrap();
        assert_eq!(numeric_label, LifecycleState::Paused);

        let null: LifecycleState = serde_json::from_value(json!(null)).unwrap();
        assert_eq!(null, LifecycleState::Unknown);

        assert_eq!(LifecycleState::from_label("POWEROFF"), LifecycleState::Shutoff);
        assert_eq!(LifecycleState::from_label("bogus"), LifecycleState::Unknown);
    }

    #[test]
    fn vm_parses_backend_payload() {
        let vm: Vm = serde_json::from_value(json!({
            "name": "web-01",
            "id": 7,
            "state": 1,
            "uuid": "3c7a4d0e-0000-4000-8000-000000000001",
            "max_memory": 4194304,
            "memory": 2147483648u64,
            "vcpus": 2,
            "autostart": 1,
            "disk_capacity": 21474836480u64,
            "vm_os": "http://ubuntu.com/ubuntu/22.04",
            "disks": [{"target": "vda", "location": "/var/lib/libvirt/images/web-01.qcow2"}],
            "cdroms": [{"target": "sda", "location": null}]
        }))
        .unwrap();

        assert_eq!(vm.id, VmId::Numeric(7));
        assert_eq!(vm.state, LifecycleState::Running);
        assert_eq!(vm.autostart, Some(true));
        assert_eq!(vm.memory_gib(), 2.0);
        assert_eq!(vm.disk_capacity_gib(), 20.0);
        assert_eq!(vm.os_label(), "ubuntu 22.04");
        assert_eq!(vm.disks[0]["target"], json!("vda"));
        assert!(vm.cdroms[0]["location"].is_null());
        assert_eq!(
            describe_media(&vm.disks[0]),
            "vda -> /var/lib/libvirt/images/web-01.qcow2"
        );
        assert_eq!(describe_media(&vm.cdroms[0]), "sda -> -");
    }

    #[test]
    fn vm_defaults_missing_fields() {
        let vm: Vm = serde_json::from_value(json!({"name": "bare"})).unwrap();
        assert_eq!(vm.state, LifecycleState::Unknown);
        assert_eq!(vm.vcpus, 1);
        assert_eq!(vm.id.to_string(), "-");
        assert_eq!(vm.os_label(), "-");
    }

    #[test]
    fn vm_serializes_wire_field_names() {
        let mut vm = Vm::new("db", LifecycleState::Paused);
        vm.disk_capacity = 10;
        vm.vm_os = "http://debian.org/debian/12".to_string();

        let value = serde_json::to_value(&vm).unwrap();
        assert_eq!(value["state"], json!(3));
        assert_eq!(value["disk_capacity"], json!(10));
        assert_eq!(value["vm_os"], json!("http://debian.org/debian/12"));
        assert!(value.get("uuid").is_none());
    }

    #[test]
    fn action_parsing_rejects_unmapped_names() {
        assert_eq!("poweroff".parse::<Action>().unwrap(), Action::Poweroff);
        assert!(matches!(
            "stop".parse::<Action>(),
            Err(VesselError::UnknownAction(name)) if name == "stop"
        ));
        assert!("Start".parse::<Action>().is_err());
    }

    #[test]
    fn create_request_validation() {
        let mut request = CreateVmRequest {
            name: "build-runner".to_string(),
            cpu: 2,
            ram: 4,
            disk: 40,
            os: "ubuntu".to_string(),
        };
        assert!(request.validate().is_ok());

        request.name = "bad name".to_string();
        assert!(request.validate().is_err());

        request.name = "ok".to_string();
        request.cpu = 0;
        assert!(request.validate().is_err());
    }
}
