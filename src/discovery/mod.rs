//! # Service Discovery
//!
//! The discovery collaborator advertises services, browses for them and
//! resolves a found instance to a dialable host and port. The wire protocol
//! behind it (mDNS / DNS-SD) lives outside this crate; anything implementing
//! [`Discovery`] can be plugged into servers and client sessions.
//!
//! [`LocalDiscovery`] is an in-process registry. One instance is created per
//! process (or per test) and handed around as `Arc<dyn Discovery>`; there is
//! no hidden global registry.

use std::fmt;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};

mod local;

pub use local::LocalDiscovery;

/// Default browse / advertise domain
pub const DEFAULT_DOMAIN: &str = "local.";

/// A service type such as `_chat._tcp.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceType {
    name: String,
    transport: String,
}

impl ServiceType {
    /// Build a service type; leading underscores are stripped
    pub fn new(name: &str, transport: &str) -> Self {
        Self {
            name: name.trim_start_matches('_').to_string(),
            transport: transport.trim_start_matches('_').to_ascii_lowercase(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// DNS-SD form, e.g. `_chat._tcp.`
    pub fn combined_type(&self) -> String {
        format!("_{}._{}.", self.name, self.transport)
    }

    /// Check the naming rules used by DNS-SD service types
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 15 {
            return Err(ProtocolError::ConfigError(format!(
                "Service type '{}' must be 1-15 characters",
                self.name
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ProtocolError::ConfigError(format!(
                "Service type '{}' may only contain letters, digits and '-'",
                self.name
            )));
        }
        if self.transport != "tcp" && self.transport != "udp" {
            return Err(ProtocolError::ConfigError(format!(
                "Transport protocol '{}' must be 'tcp' or 'udp'",
                self.transport
            )));
        }
        Ok(())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.combined_type())
    }
}

/// A found (or advertised) service instance. Needs resolving before dialling.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub service: ServiceType,
    pub domain: String,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, service: ServiceType) -> Self {
        Self {
            name: name.into(),
            service,
            domain: DEFAULT_DOMAIN.to_string(),
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.name, self.service, self.domain)
    }
}

/// Receipt for an advertisement, needed to withdraw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    id: u64,
    instance: ServiceInstance,
}

impl ServiceHandle {
    pub fn new(id: u64, instance: ServiceInstance) -> Self {
        Self { id, instance }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Advertised instance name
    pub fn name(&self) -> &str {
        &self.instance.name
    }
}

/// Resolution result for a [`ServiceInstance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub host: String,
    pub port: u16,
}

/// Browse notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(ServiceInstance),
    Lost(ServiceInstance),
}

/// Advertise, browse and resolve services on the local network
pub trait Discovery: Send + Sync {
    /// Advertise `instance_name` for `service` on `port`
    fn advertise<'a>(
        &'a self,
        service: &'a ServiceType,
        instance_name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<ServiceHandle>>;

    /// Withdraw a previous advertisement
    fn withdraw<'a>(&'a self, handle: &'a ServiceHandle) -> BoxFuture<'a, Result<()>>;

    /// Start browsing; events arrive until the receiver is dropped
    fn browse<'a>(
        &'a self,
        service: &'a ServiceType,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<DiscoveryEvent>>>;

    /// Resolve a found instance to a dialable host and port
    fn resolve<'a>(&'a self, instance: &'a ServiceInstance)
        -> BoxFuture<'a, Result<ResolvedAddress>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_type_uses_dns_sd_form() {
        let kind = ServiceType::new("chat", "TCP");
        assert_eq!(kind.combined_type(), "_chat._tcp.");
        assert_eq!(ServiceType::new("_chat", "_tcp"), kind);
    }

    #[test]
    fn validation_rejects_bad_names() {
        assert!(ServiceType::new("chat", "tcp").validate().is_ok());
        assert!(ServiceType::new("", "tcp").validate().is_err());
        assert!(ServiceType::new("has space", "tcp").validate().is_err());
        assert!(ServiceType::new("chat", "sctp").validate().is_err());
        assert!(ServiceType::new("a-very-long-service-name", "tcp")
            .validate()
            .is_err());
    }

    #[test]
    fn instance_display_is_fully_qualified() {
        let instance = ServiceInstance::new("kitchen", ServiceType::new("chat", "tcp"));
        assert_eq!(instance.to_string(), "kitchen._chat._tcp.local.");
    }
}
