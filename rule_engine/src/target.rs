// Identity and addressing value objects for profiled targets.
//
// A Target is what discovery hands us: where to connect, what to call it,
// and the attributes that match expressions are evaluated against.
// ConnectionDescriptor is what callers hand the connection manager.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a target.
/// This is the connect URL (or any other stable address) the target was
/// discovered under. Two targets with the same id are the same runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// Creates a new TargetId from a connect URL or address.
    pub fn new(id: impl Into<String>) -> Self {
        TargetId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TargetId {
    fn from(s: String) -> Self {
        TargetId(s)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        TargetId(s.to_string())
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote managed runtime that can be profiled.
///
/// Targets are created and removed by the discovery feed and never change
/// after construction. The `with_*` methods are construction-time helpers
/// that consume the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Connect URL, doubles as the identity
    #[serde(rename = "connectUrl")]
    id: TargetId,
    /// Display alias (often the main class or pod name)
    alias: String,
    /// Discovered labels
    labels: BTreeMap<String, String>,
    /// Annotations supplied by the deployment platform
    platform_annotations: BTreeMap<String, String>,
    /// Annotations describing the runtime itself (host, port, pid, ...)
    runtime_annotations: BTreeMap<String, String>,
}

impl Target {
    pub fn new(id: impl Into<TargetId>, alias: impl Into<String>) -> Self {
        Target {
            id: id.into(),
            alias: alias.into(),
            labels: BTreeMap::new(),
            platform_annotations: BTreeMap::new(),
            runtime_annotations: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_platform_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.platform_annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_runtime_annotation(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.runtime_annotations.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &TargetId {
        &self.id
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    pub fn platform_annotations(&self) -> &BTreeMap<String, String> {
        &self.platform_annotations
    }

    pub fn runtime_annotations(&self) -> &BTreeMap<String, String> {
        &self.runtime_annotations
    }

    /// Descriptor addressing this target with no credential override.
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor::new(self.id.clone())
    }
}

/// Username/password pair used to override stored credentials for one call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Never print the password.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Target identity plus an optional credential override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    target_id: TargetId,
    credentials: Option<Credentials>,
}

impl ConnectionDescriptor {
    pub fn new(target_id: impl Into<TargetId>) -> Self {
        ConnectionDescriptor {
            target_id: target_id.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn target_id(&self) -> &TargetId {
        &self.target_id
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

impl From<&Target> for ConnectionDescriptor {
    fn from(target: &Target) -> Self {
        target.descriptor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_from_target_has_no_credentials() {
        let target = Target::new("service:jmx:rmi:///jndi/rmi://app:9091/jmxrmi", "app");
        let descriptor = ConnectionDescriptor::from(&target);
        assert_eq!(descriptor.target_id(), target.id());
        assert!(descriptor.credentials().is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("admin"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_target_serializes_connect_url() {
        let target = Target::new("localhost:9091", "foo").with_label("app", "web");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["connectUrl"], "localhost:9091");
        assert_eq!(json["alias"], "foo");
        assert_eq!(json["labels"]["app"], "web");
    }
}
