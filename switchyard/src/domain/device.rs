//! Device targets as seen by the fan-out, and the filters that select them.

use std::collections::BTreeSet;
use std::net::IpAddr;

use device_fanout::FanoutTarget;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role of a switch in the fabric.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    #[default]
    Unknown,
    Access,
    Dist,
    Core,
}

/// Provisioning state of a device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    #[default]
    Unknown,
    Discovered,
    Init,
    Managed,
    Unmanaged,
}

/// Read-only view of one device, supplied by the inventory.
///
/// Whether a device is managed follows from its `state`; see [`DeviceTarget::managed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTarget {
    pub hostname: String,
    /// True when the deployed configuration matches the desired one.
    pub synchronized: bool,
    #[serde(default)]
    pub groups: BTreeSet<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub device_type: DeviceType,
    pub state: DeviceState,
    #[serde(default)]
    pub management_ip: Option<IpAddr>,
}

impl DeviceTarget {
    /// A managed, synchronized device with no explicit groups.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            synchronized: true,
            groups: BTreeSet::new(),
            platform: String::new(),
            device_type: DeviceType::Unknown,
            state: DeviceState::Managed,
            management_ip: None,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn with_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn managed(&self) -> bool {
        self.state == DeviceState::Managed
    }

    pub fn unsynchronized(mut self) -> Self {
        self.synchronized = false;
        self
    }

    /// Explicit groups plus the implicit `T_<TYPE>` and `S_<STATE>` groups.
    pub fn memberships(&self) -> BTreeSet<String> {
        let mut groups = self.groups.clone();
        groups.insert(format!("T_{}", self.device_type));
        groups.insert(format!("S_{}", self.state));
        groups
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.contains(group)
            || group == format!("T_{}", self.device_type)
            || group == format!("S_{}", self.state)
    }
}

impl FanoutTarget for DeviceTarget {
    fn hostname(&self) -> &str {
        &self.hostname
    }
}

/// Selects the devices an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFilter {
    /// One managed device by hostname.
    Hostname(String),
    /// Every member of a group.
    Group(String),
    /// Managed devices with pending configuration changes.
    Unsynchronized,
}

impl DeviceFilter {
    /// Build a filter from optional `hostname` / `group` arguments.
    ///
    /// Neither given selects [`DeviceFilter::Unsynchronized`].
    pub fn from_selection(hostname: Option<String>, group: Option<String>) -> Result<Self> {
        match (hostname, group) {
            (Some(_), Some(_)) => Err(Error::validation(
                "only one of hostname or group may be given",
            )),
            (Some(hostname), None) => Ok(Self::Hostname(hostname)),
            (None, Some(group)) => Ok(Self::Group(group)),
            (None, None) => Ok(Self::Unsynchronized),
        }
    }

    pub fn matches(&self, device: &DeviceTarget) -> bool {
        match self {
            Self::Hostname(hostname) => device.managed() && &device.hostname == hostname,
            Self::Group(group) => device.is_member_of(group),
            Self::Unsynchronized => device.managed() && !device.synchronized,
        }
    }
}

impl std::fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hostname(hostname) => write!(f, "hostname {hostname}"),
            Self::Group(group) => write!(f, "group {group}"),
            Self::Unsynchronized => write!(f, "managed devices not synchronized"),
        }
    }
}
