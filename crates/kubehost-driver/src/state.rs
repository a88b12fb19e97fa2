//! Host state as reported to the plugin framework

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a host
///
/// `None` means the host's Pod does not exist. It is only ever produced from
/// a lookup that found nothing, never from a Pod phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    /// No Pod exists for the host
    #[default]
    None,
    /// Pod accepted but not yet running
    Starting,
    /// Pod running
    Running,
    /// Pod finished, failed, or in a phase we don't recognize
    Stopped,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HostState::None => "None",
            HostState::Starting => "Starting",
            HostState::Running => "Running",
            HostState::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// Map a Pod phase onto a host state
///
/// Several phases collapse into `Stopped`; that loss is fine because the
/// framework only distinguishes running from not running.
pub fn map_phase(phase: Option<&str>) -> HostState {
    match phase {
        Some("Pending") => HostState::Starting,
        Some("Running") => HostState::Running,
        _ => HostState::Stopped,
    }
}

/// Map the result of a Pod lookup onto a host state
pub fn state_of(pod: Option<&Pod>) -> HostState {
    match pod {
        None => HostState::None,
        Some(pod) => map_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref())),
    }
}

/// The Pod's IP, if one has been assigned
pub fn pod_ip(pod: &Pod) -> Option<String> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn pod_with(phase: Option<&str>, ip: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: phase.map(str::to_string),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn known_phases_map_directly() {
        assert_eq!(map_phase(Some("Pending")), HostState::Starting);
        assert_eq!(map_phase(Some("Running")), HostState::Running);
    }

    #[test]
    fn everything_else_is_stopped() {
        for phase in ["Succeeded", "Failed", "Unknown", "", "Terminating"] {
            assert_eq!(map_phase(Some(phase)), HostState::Stopped, "phase {phase}");
        }
        assert_eq!(map_phase(None), HostState::Stopped);
    }

    #[test]
    fn missing_pod_is_none_but_missing_status_is_stopped() {
        assert_eq!(state_of(None), HostState::None);
        assert_eq!(state_of(Some(&Pod::default())), HostState::Stopped);
        assert_eq!(
            state_of(Some(&pod_with(Some("Running"), None))),
            HostState::Running
        );
    }

    #[test]
    fn empty_pod_ip_is_no_ip() {
        assert_eq!(pod_ip(&pod_with(Some("Pending"), Some(""))), None);
        assert_eq!(pod_ip(&pod_with(Some("Pending"), None)), None);
        assert_eq!(
            pod_ip(&pod_with(Some("Running"), Some("10.0.0.5"))).as_deref(),
            Some("10.0.0.5")
        );
    }

    #[test]
    fn display_uses_framework_names() {
        assert_eq!(HostState::None.to_string(), "None");
        assert_eq!(HostState::Running.to_string(), "Running");
        assert_eq!(HostState::default(), HostState::None);
    }
}
