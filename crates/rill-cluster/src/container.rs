use std::collections::BTreeMap;

use serde::Serialize;

/// The exit status the cluster reports when it releases or loses a
/// container (preemption, node failure). Such completions are not the
/// worker's fault and never count against the retry budget.
pub const RELEASED_EXIT_STATUS: i32 = -100;

/// The token kind granted to the application master for talking to the
/// resource manager. It must never be shipped to workers.
pub const AM_RM_TOKEN_KIND: &str = "APPLICATION_MASTER_RESOURCE_MANAGER_TOKEN";

/// A memory/CPU capability, either requested for or granted to a container.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Resource {
    pub memory_mb: u64,
    pub cpu_cores: u32,
}

impl Resource {
    /// Whether this capability can accommodate `required`.
    pub fn satisfies(&self, required: &Resource) -> bool {
        self.memory_mb >= required.memory_mb && self.cpu_cores >= required.cpu_cores
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} MB, {} cores", self.memory_mb, self.cpu_cores)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An execution slot granted by the cluster. The core treats the
/// identifier as opaque and only uses the node location and granted
/// capability for launching and logging.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub node_host: String,
    pub node_port: u16,
    pub resource: Resource,
}

impl ContainerHandle {
    pub fn node(&self) -> String {
        format!("{}:{}", self.node_host, self.node_port)
    }
}

/// The terminal report for a container.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub container_id: ContainerId,
    pub exit_status: i32,
    pub diagnostics: Option<String>,
}

impl ContainerStatus {
    pub fn was_released(&self) -> bool {
        self.exit_status == RELEASED_EXIT_STATUS
    }
}

/// Security tokens shipped to launched containers.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    tokens: BTreeMap<String, Vec<u8>>,
}

impl Credentials {
    pub fn insert(&mut self, kind: impl Into<String>, token: Vec<u8>) {
        self.tokens.insert(kind.into(), token);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.tokens.contains_key(kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.tokens.keys().map(|kind| kind.as_str())
    }

    /// A copy of these credentials with the application-master token
    /// removed. Workers authenticate to the node manager with the
    /// remaining tokens only.
    pub fn sanitized(&self) -> Credentials {
        let mut tokens = self.tokens.clone();
        tokens.remove(AM_RM_TOKEN_KIND);
        Credentials { tokens }
    }
}
