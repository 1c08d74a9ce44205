use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Identifier of a fleet member (e.g. a compute instance id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Lifecycle state reported by the fleet API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    /// Transitional "pending" counts as running so the controller does not
    /// start the same capacity twice.
    pub fn counts_as_running(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub state: InstanceState,
}

/// Partition of the configured instances into running and stopped, each in
/// ascending identifier order. Instances in any other state are in neither.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetState {
    pub running: Vec<InstanceId>,
    pub stopped: Vec<InstanceId>,
}

impl FleetState {
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = InstanceStatus>,
    {
        let mut fleet = Self::default();
        for status in statuses {
            if status.state.counts_as_running() {
                fleet.running.push(status.instance_id);
            } else if status.state == InstanceState::Stopped {
                fleet.stopped.push(status.instance_id);
            }
        }
        fleet.running.sort();
        fleet.running.dedup();
        fleet.stopped.sort();
        fleet.stopped.dedup();
        fleet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str, state: InstanceState) -> InstanceStatus {
        InstanceStatus {
            instance_id: id.into(),
            state,
        }
    }

    #[test]
    fn test_pending_counts_as_running() {
        let fleet = FleetState::from_statuses(vec![
            status("i-3", InstanceState::Stopped),
            status("i-2", InstanceState::Pending),
            status("i-1", InstanceState::Running),
            status("i-4", InstanceState::Stopping),
        ]);
        assert_eq!(fleet.running, vec!["i-1".into(), "i-2".into()]);
        assert_eq!(fleet.stopped, vec![InstanceId::from("i-3")]);
    }

    #[test]
    fn test_state_parsing() {
        let state: InstanceState = serde_json::from_str("\"shutting-down\"").unwrap();
        assert_eq!(state, InstanceState::ShuttingDown);
        let state: InstanceState = serde_json::from_str("\"rebooting\"").unwrap();
        assert_eq!(state, InstanceState::Unknown);
        assert_eq!("stopped".parse::<InstanceState>().unwrap(), InstanceState::Stopped);
        assert_eq!(InstanceState::Running.to_string(), "running");
    }
}
