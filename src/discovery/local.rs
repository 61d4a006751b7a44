//! In-process discovery registry.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    Discovery, DiscoveryEvent, ResolvedAddress, ServiceHandle, ServiceInstance, ServiceType,
};
use crate::error::constants::{
    ERR_DUPLICATE_INSTANCE, ERR_LOCK_POISONED, ERR_UNKNOWN_HANDLE, ERR_UNKNOWN_INSTANCE,
};
use crate::error::{ProtocolError, Result};

/// Host reported by [`LocalDiscovery`] when resolving
pub const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";

struct Advertised {
    handle: u64,
    instance: ServiceInstance,
    port: u16,
}

#[derive(Default)]
struct Registry {
    next_handle: u64,
    services: HashMap<ServiceType, Vec<Advertised>>,
    browsers: HashMap<ServiceType, Vec<mpsc::UnboundedSender<DiscoveryEvent>>>,
}

impl Registry {
    fn notify(&mut self, service: &ServiceType, event: DiscoveryEvent) {
        if let Some(browsers) = self.browsers.get_mut(service) {
            browsers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// Discovery registry shared by every server and client in one process.
///
/// Advertisements resolve to the configured host, which makes it suitable for
/// loopback deployments and tests.
pub struct LocalDiscovery {
    host: String,
    registry: Mutex<Registry>,
}

impl Default for LocalDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalDiscovery {
    pub fn new() -> Self {
        Self::with_host(DEFAULT_LOCAL_HOST)
    }

    /// Resolve every advertisement to `host`
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Instances currently advertised for `service`
    pub fn advertised(&self, service: &ServiceType) -> Result<Vec<ServiceInstance>> {
        let registry = self.lock()?;
        Ok(registry
            .services
            .get(service)
            .map(|list| list.iter().map(|a| a.instance.clone()).collect())
            .unwrap_or_default())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| ProtocolError::Custom(ERR_LOCK_POISONED.to_string()))
    }

    fn register(&self, service: &ServiceType, instance_name: &str, port: u16) -> Result<ServiceHandle> {
        service.validate()?;
        if instance_name.is_empty() {
            return Err(ProtocolError::DiscoveryError(
                "Instance name cannot be empty".to_string(),
            ));
        }

        let mut registry = self.lock()?;
        let entries = registry.services.entry(service.clone()).or_default();
        if entries.iter().any(|a| a.instance.name == instance_name) {
            return Err(ProtocolError::DiscoveryError(format!(
                "{ERR_DUPLICATE_INSTANCE}: {instance_name}"
            )));
        }

        let instance = ServiceInstance::new(instance_name, service.clone());
        let handle = registry.next_handle;
        registry.next_handle += 1;
        registry
            .services
            .entry(service.clone())
            .or_default()
            .push(Advertised {
                handle,
                instance: instance.clone(),
                port,
            });
        registry.notify(service, DiscoveryEvent::Found(instance.clone()));

        info!(service = %service, instance = instance_name, port, "Service advertised");
        Ok(ServiceHandle::new(handle, instance))
    }

    fn unregister(&self, handle: &ServiceHandle) -> Result<()> {
        let service = &handle.instance().service;
        let mut registry = self.lock()?;

        let entries = registry
            .services
            .get_mut(service)
            .ok_or_else(|| ProtocolError::DiscoveryError(ERR_UNKNOWN_HANDLE.to_string()))?;
        let position = entries
            .iter()
            .position(|a| a.handle == handle.id())
            .ok_or_else(|| ProtocolError::DiscoveryError(ERR_UNKNOWN_HANDLE.to_string()))?;
        let removed = entries.remove(position);
        registry.notify(service, DiscoveryEvent::Lost(removed.instance));

        info!(service = %service, instance = handle.name(), "Service withdrawn");
        Ok(())
    }

    fn subscribe(&self, service: &ServiceType) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.lock()?;

        if let Some(entries) = registry.services.get(service) {
            for advertised in entries {
                // Receiver is alive, the send cannot fail
                let _ = tx.send(DiscoveryEvent::Found(advertised.instance.clone()));
            }
        }
        registry
            .browsers
            .entry(service.clone())
            .or_default()
            .push(tx);

        debug!(service = %service, "Browser registered");
        Ok(rx)
    }

    fn lookup(&self, instance: &ServiceInstance) -> Result<ResolvedAddress> {
        let registry = self.lock()?;
        registry
            .services
            .get(&instance.service)
            .and_then(|entries| entries.iter().find(|a| a.instance.name == instance.name))
            .map(|a| ResolvedAddress {
                host: self.host.clone(),
                port: a.port,
            })
            .ok_or_else(|| ProtocolError::ResolveFailed(format!("{ERR_UNKNOWN_INSTANCE}: {instance}")))
    }
}

impl Discovery for LocalDiscovery {
    fn advertise<'a>(
        &'a self,
        service: &'a ServiceType,
        instance_name: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<ServiceHandle>> {
        future::ready(self.register(service, instance_name, port)).boxed()
    }

    fn withdraw<'a>(&'a self, handle: &'a ServiceHandle) -> BoxFuture<'a, Result<()>> {
        future::ready(self.unregister(handle)).boxed()
    }

    fn browse<'a>(
        &'a self,
        service: &'a ServiceType,
    ) -> BoxFuture<'a, Result<mpsc::UnboundedReceiver<DiscoveryEvent>>> {
        future::ready(self.subscribe(service)).boxed()
    }

    fn resolve<'a>(
        &'a self,
        instance: &'a ServiceInstance,
    ) -> BoxFuture<'a, Result<ResolvedAddress>> {
        future::ready(self.lookup(instance)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ServiceType {
        ServiceType::new("chat", "tcp")
    }

    #[tokio::test]
    async fn advertise_then_resolve() {
        let discovery = LocalDiscovery::with_host("10.1.2.3");
        let handle = discovery.advertise(&chat(), "kitchen", 4000).await.unwrap();
        assert_eq!(handle.name(), "kitchen");

        let resolved = discovery.resolve(handle.instance()).await.unwrap();
        assert_eq!(
            resolved,
            ResolvedAddress {
                host: "10.1.2.3".into(),
                port: 4000
            }
        );
    }

    #[tokio::test]
    async fn duplicate_instance_is_rejected() {
        let discovery = LocalDiscovery::new();
        discovery.advertise(&chat(), "kitchen", 1).await.unwrap();
        assert!(matches!(
            discovery.advertise(&chat(), "kitchen", 2).await,
            Err(ProtocolError::DiscoveryError(_))
        ));
    }

    #[tokio::test]
    async fn browse_sees_existing_and_later_changes() {
        let discovery = LocalDiscovery::new();
        let first = discovery.advertise(&chat(), "kitchen", 1).await.unwrap();

        let mut events = discovery.browse(&chat()).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::Found(first.instance().clone()))
        );

        let second = discovery.advertise(&chat(), "garage", 2).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::Found(second.instance().clone()))
        );

        discovery.withdraw(&first).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(DiscoveryEvent::Lost(first.instance().clone()))
        );
        assert_eq!(discovery.advertised(&chat()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn withdrawn_instance_no_longer_resolves() {
        let discovery = LocalDiscovery::new();
        let handle = discovery.advertise(&chat(), "kitchen", 1).await.unwrap();
        discovery.withdraw(&handle).await.unwrap();

        assert!(matches!(
            discovery.resolve(handle.instance()).await,
            Err(ProtocolError::ResolveFailed(_))
        ));
        assert!(discovery.withdraw(&handle).await.is_err());
    }

    #[tokio::test]
    async fn other_service_types_are_isolated() {
        let discovery = LocalDiscovery::new();
        discovery.advertise(&chat(), "kitchen", 1).await.unwrap();

        let mut events = discovery
            .browse(&ServiceType::new("files", "tcp"))
            .await
            .unwrap();
        assert!(events.try_recv().is_err());
    }
}
