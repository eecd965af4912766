use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{HostnameResolutionEvent, ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::{DiscoveryError, DnsSdBackend, ResolvedService, ServiceInstance, SrvRecord, Stage};

const REPLY_CHANNEL_DEPTH: usize = 16;
const RESOLVED_BROADCAST_DEPTH: usize = 64;
const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Services resolved by the browse loop, keyed by full name. Every insert is
/// announced on a broadcast channel so queries can wait for a name that has
/// not been resolved yet.
pub(crate) struct ResolvedCache<T> {
    entries: Mutex<HashMap<String, T>>,
    notify: broadcast::Sender<String>,
}

impl<T: Clone> ResolvedCache<T> {
    pub(crate) fn new(depth: usize) -> Self {
        let (notify, _) = broadcast::channel(depth);
        Self {
            entries: Mutex::new(HashMap::new()),
            notify,
        }
    }

    pub(crate) fn insert(&self, full_name: String, value: T) {
        self.entries.lock().insert(full_name.clone(), value);
        let _ = self.notify.send(full_name);
    }

    pub(crate) fn get(&self, full_name: &str) -> Option<T> {
        self.entries.lock().get(full_name).cloned()
    }

    pub(crate) fn find_map<R>(&self, f: impl FnMut(&T) -> Option<R>) -> Option<R> {
        self.entries.lock().values().find_map(f)
    }

    /// Subscribe before the first [`get`](Self::get) so an insert landing in
    /// between is still seen by [`wait_for`](Self::wait_for).
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<String> {
        self.notify.subscribe()
    }

    /// Resolves once `full_name` is cached. Lagging behind the notifications
    /// only means re-checking the cache.
    pub(crate) async fn wait_for(
        &self,
        full_name: &str,
        mut notifications: broadcast::Receiver<String>,
    ) -> Option<T> {
        loop {
            if let Some(value) = self.get(full_name) {
                return Some(value);
            }
            match notifications.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// `mdns-sd` daemon behind the four-stage interface.
///
/// The daemon resolves services as part of browsing, so `ServiceResolved`
/// events seen by the browse loop are cached by full name; `resolve` and
/// `query_srv` answer from that cache (waiting for it if needed) and
/// `query_ipv4` asks the daemon to resolve the host target.
pub struct MdnsSdBackend {
    daemon: ServiceDaemon,
    resolved: Arc<ResolvedCache<ServiceInfo>>,
    address_timeout: Duration,
}

impl MdnsSdBackend {
    pub fn new() -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(|err| DiscoveryError::Daemon(err.to_string()))?;
        Ok(Self {
            daemon,
            resolved: Arc::new(ResolvedCache::new(RESOLVED_BROADCAST_DEPTH)),
            address_timeout: DEFAULT_ADDRESS_TIMEOUT,
        })
    }

    pub fn with_address_timeout(mut self, timeout: Duration) -> Self {
        self.address_timeout = timeout;
        self
    }

    /// Stops the daemon; outstanding queries end and their threads exit.
    pub fn shutdown(&self) {
        if let Err(err) = self.daemon.shutdown() {
            debug!(error = %err, "mdns daemon already stopped");
        }
    }
}

impl Drop for MdnsSdBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `_airplay._tcp` -> `_airplay._tcp.local.`
pub fn qualify_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim_end_matches('.');
    if trimmed.ends_with(".local") {
        format!("{trimmed}.")
    } else {
        format!("{trimmed}.local.")
    }
}

fn instance_from_full_name(service_type: &str, full_name: &str) -> ServiceInstance {
    let name = full_name
        .strip_suffix(service_type)
        .map(|prefix| prefix.trim_end_matches('.'))
        .unwrap_or(full_name);
    let registration_type = service_type
        .strip_suffix("local.")
        .unwrap_or(service_type)
        .trim_end_matches('.');
    ServiceInstance {
        interface_index: 0,
        name: name.to_string(),
        registration_type: registration_type.to_string(),
        domain: "local.".to_string(),
    }
}

fn full_name(instance: &ServiceInstance) -> String {
    format!(
        "{}.{}.{}",
        instance.name, instance.registration_type, instance.domain
    )
}

fn spawn_query_thread<F>(label: &str, work: F) -> Result<(), DiscoveryError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(format!("mdns-{label}"))
        .spawn(work)
        .map(|_| ())
        .map_err(|err| DiscoveryError::Daemon(format!("failed to spawn {label} thread: {err}")))
}

#[async_trait]
impl DnsSdBackend for MdnsSdBackend {
    async fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<ServiceInstance>, DiscoveryError> {
        let qualified = qualify_service_type(service_type);
        let events = self
            .daemon
            .browse(&qualified)
            .map_err(|err| DiscoveryError::Browse {
                service_type: qualified.clone(),
                reason: err.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_DEPTH);
        let resolved = Arc::clone(&self.resolved);
        let daemon = self.daemon.clone();

        spawn_query_thread("browse", move || {
            while let Ok(event) = events.recv() {
                match event {
                    ServiceEvent::ServiceFound(ty, full_name) => {
                        let instance = instance_from_full_name(&ty, &full_name);
                        if tx.blocking_send(instance).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let full_name = info.get_fullname().to_string();
                        trace!(full_name = %full_name, host = info.get_hostname(), port = info.get_port(), "service resolved");
                        resolved.insert(full_name, info);
                    }
                    ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
            if let Err(err) = daemon.stop_browse(&qualified) {
                trace!(error = %err, "stop_browse after browse loop");
            }
        })?;

        Ok(rx)
    }

    async fn resolve(
        &self,
        instance: &ServiceInstance,
    ) -> Result<mpsc::Receiver<ResolvedService>, DiscoveryError> {
        let full_name = full_name(instance);
        let interface_index = instance.interface_index;
        let (tx, rx) = mpsc::channel(1);
        let notifications = self.resolved.subscribe();
        let resolved = Arc::clone(&self.resolved);

        tokio::spawn(async move {
            let info = tokio::select! {
                _ = tx.closed() => return,
                info = resolved.wait_for(&full_name, notifications) => info,
            };
            if let Some(info) = info {
                let _ = tx.try_send(ResolvedService {
                    interface_index,
                    full_name: info.get_fullname().to_string(),
                    host_target: info.get_hostname().to_string(),
                });
            }
        });

        Ok(rx)
    }

    async fn query_srv(
        &self,
        service: &ResolvedService,
    ) -> Result<mpsc::Receiver<SrvRecord>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(1);
        match self.resolved.get(&service.full_name) {
            Some(info) => {
                let _ = tx.try_send(SrvRecord {
                    port: info.get_port(),
                });
            }
            None => debug!(full_name = %service.full_name, "no srv record cached"),
        }
        Ok(rx)
    }

    async fn query_ipv4(
        &self,
        host_target: &str,
    ) -> Result<mpsc::Receiver<Ipv4Addr>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_DEPTH);

        let known = self.resolved.find_map(|info| {
            if info.get_hostname() != host_target {
                return None;
            }
            info.get_addresses().iter().find_map(|addr| match addr {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
        });
        if let Some(addr) = known {
            let _ = tx.try_send(addr);
            return Ok(rx);
        }

        let timeout_ms = u64::try_from(self.address_timeout.as_millis()).unwrap_or(u64::MAX);
        let events = self
            .daemon
            .resolve_hostname(host_target, Some(timeout_ms))
            .map_err(|err| DiscoveryError::Stage {
                stage: Stage::AddressLookup,
                reason: err.to_string(),
            })?;
        let host = host_target.to_string();

        spawn_query_thread("address", move || {
            while let Ok(event) = events.recv() {
                match event {
                    HostnameResolutionEvent::AddressesFound(_, addrs) => {
                        let v4 = addrs.into_iter().find_map(|addr| match addr {
                            IpAddr::V4(v4) => Some(v4),
                            IpAddr::V6(_) => None,
                        });
                        if let Some(v4) = v4 {
                            let _ = tx.blocking_send(v4);
                            break;
                        }
                    }
                    HostnameResolutionEvent::SearchTimeout(_)
                    | HostnameResolutionEvent::SearchStopped(_) => {
                        warn!(host = %host, "no ipv4 address resolved");
                        break;
                    }
                    _ => {}
                }
            }
        })?;

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn service_types_are_fully_qualified() {
        assert_eq!(qualify_service_type("_airplay._tcp"), "_airplay._tcp.local.");
        assert_eq!(qualify_service_type("_airplay._tcp."), "_airplay._tcp.local.");
        assert_eq!(
            qualify_service_type("_airplay._tcp.local."),
            "_airplay._tcp.local."
        );
    }

    #[test_timeout::timeout]
    fn browse_reply_splits_full_name() {
        let instance =
            instance_from_full_name("_airplay._tcp.local.", "Living Room._airplay._tcp.local.");
        assert_eq!(instance.name, "Living Room");
        assert_eq!(instance.registration_type, "_airplay._tcp");
        assert_eq!(instance.domain, "local.");
        assert_eq!(full_name(&instance), "Living Room._airplay._tcp.local.");
    }

    const LIVING_ROOM: &str = "Living Room._airplay._tcp.local.";

    #[test_timeout::tokio_timeout_test(5)]
    async fn wait_returns_service_resolved_before_query() {
        let cache = ResolvedCache::new(4);
        cache.insert(LIVING_ROOM.to_string(), 7000u16);

        let notifications = cache.subscribe();
        assert_eq!(cache.wait_for(LIVING_ROOM, notifications).await, Some(7000));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn wait_returns_service_resolved_after_query() {
        let cache = Arc::new(ResolvedCache::new(4));
        let notifications = cache.subscribe();
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_for(LIVING_ROOM, notifications).await })
        };
        tokio::task::yield_now().await;

        cache.insert("Kitchen._airplay._tcp.local.".to_string(), 7100u16);
        cache.insert(LIVING_ROOM.to_string(), 7000u16);

        assert_eq!(waiter.await.expect("waiter"), Some(7000));
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn wait_rechecks_cache_after_lagging() {
        let cache = Arc::new(ResolvedCache::new(2));
        let notifications = cache.subscribe();
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.wait_for(LIVING_ROOM, notifications).await })
        };
        tokio::task::yield_now().await;

        // Overflow the notification queue before the waiter runs again.
        for port in 0..5u16 {
            cache.insert(format!("Display {port}._airplay._tcp.local."), port);
        }
        cache.insert(LIVING_ROOM.to_string(), 7000u16);

        assert_eq!(waiter.await.expect("waiter"), Some(7000));
    }

    #[test_timeout::timeout]
    fn cache_answers_srv_and_address_lookups() {
        let cache = ResolvedCache::new(4);
        cache.insert(LIVING_ROOM.to_string(), ("living-room.local.", 7000u16));
        cache.insert(
            "Kitchen._airplay._tcp.local.".to_string(),
            ("kitchen.local.", 7100u16),
        );

        assert_eq!(cache.get(LIVING_ROOM).map(|(_, port)| port), Some(7000));
        assert_eq!(cache.get("Attic._airplay._tcp.local."), None);
        assert_eq!(
            cache.find_map(|(host, port)| (*host == "kitchen.local.").then_some(*port)),
            Some(7100)
        );
    }
}
