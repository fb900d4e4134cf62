use serde::{Deserialize, Serialize};

/// Identity of a capture target: some entity with its own network stack,
/// such as a container, a pod, or a process-less virtual IP stack.
///
/// The `netns` inode is the authoritative identifier; `pid` and `starttime`
/// together act as a freshness witness (a pid alone can be reused, a pid plus
/// its kernel start time cannot). `name` and `prefix` survive restarts of the
/// workload and allow re-discovery when the inode has gone stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Inode number of the target's network namespace; 0 means unknown.
    #[serde(default)]
    pub netns: u64,

    /// A process known to live in that namespace, usually the workload's
    /// root process; 0 means unknown.
    #[serde(default)]
    pub pid: i32,

    /// Start time of `pid` in kernel clock ticks, as reported by the
    /// per-process stat record; 0 means unknown.
    #[serde(default, rename = "starttime")]
    pub start_time: i64,

    /// Workload name, stable across restarts.
    #[serde(default)]
    pub name: String,

    /// Namespacing prefix qualifying `name` (such as a pod name or a
    /// container engine prefix).
    #[serde(default)]
    pub prefix: String,

    /// Network interfaces inside the target's stack to capture from.
    #[serde(default, rename = "network-interfaces")]
    pub network_interfaces: Vec<String>,

    /// What kind of workload this is; informational only.
    #[serde(default, rename = "type")]
    pub kind: String,
}

impl Target {
    /// A display name in the same `prefix:name` form the discovery service
    /// UI uses.
    pub fn qualified_name(&self) -> String {
        if self.prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.prefix, self.name)
        }
    }
}

/// The discovery service's answer: all capture targets it currently knows
/// about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetList {
    #[serde(default)]
    pub targets: Vec<Target>,
}
