pub mod mdns;

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use mdns::MdnsSdBackend;

const ENDPOINT_CHANNEL_DEPTH: usize = 16;

/// A resolved display address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Browse reply: one advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub interface_index: u32,
    pub name: String,
    pub registration_type: String,
    pub domain: String,
}

/// Resolve reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub interface_index: u32,
    pub full_name: String,
    pub host_target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SrvRecord {
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    SrvLookup,
    AddressLookup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Resolve => "resolve",
            Stage::SrvLookup => "srv lookup",
            Stage::AddressLookup => "address lookup",
        })
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("browse for {service_type} failed: {reason}")]
    Browse { service_type: String, reason: String },
    #[error("{stage} failed: {reason}")]
    Stage { stage: Stage, reason: String },
    #[error("mdns daemon error: {0}")]
    Daemon(String),
    #[error("no device found within {window:?}")]
    NotFound { window: Duration },
}

/// The four DNS-SD queries. Each call starts one query and returns the
/// receiver its replies arrive on; the query's processing runs on its own
/// task until the replies end or the receiver is dropped.
#[async_trait]
pub trait DnsSdBackend: Send + Sync + 'static {
    async fn browse(
        &self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<ServiceInstance>, DiscoveryError>;

    async fn resolve(
        &self,
        instance: &ServiceInstance,
    ) -> Result<mpsc::Receiver<ResolvedService>, DiscoveryError>;

    async fn query_srv(
        &self,
        service: &ResolvedService,
    ) -> Result<mpsc::Receiver<SrvRecord>, DiscoveryError>;

    async fn query_ipv4(
        &self,
        host_target: &str,
    ) -> Result<mpsc::Receiver<Ipv4Addr>, DiscoveryError>;
}

pub struct Resolver<B> {
    backend: Arc<B>,
}

impl<B> Clone for Resolver<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: DnsSdBackend> Resolver<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn with_shared(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Starts browsing and returns the endpoint channel without any bound.
    /// A failing browse call is returned here; later per-instance failures
    /// are logged and skipped. Dropping the receiver stops the pipeline.
    pub async fn stream(
        &self,
        service_type: &str,
    ) -> Result<mpsc::Receiver<Endpoint>, DiscoveryError> {
        let mut instances = self.backend.browse(service_type).await?;
        let (tx, rx) = mpsc::channel(ENDPOINT_CHANNEL_DEPTH);
        let backend = Arc::clone(&self.backend);

        tokio::spawn(async move {
            loop {
                let instance = tokio::select! {
                    _ = tx.closed() => break,
                    next = instances.recv() => match next {
                        Some(instance) => instance,
                        None => break,
                    },
                };
                debug!(name = %instance.name, interface = instance.interface_index, "service instance found");
                tokio::spawn(resolve_instance(Arc::clone(&backend), instance, tx.clone()));
            }
            debug!("browse loop finished");
        });

        Ok(rx)
    }

    /// Collects endpoints for `window`, then closes the endpoint channel.
    /// Each endpoint is reported once; an empty result is
    /// [`DiscoveryError::NotFound`].
    pub async fn discover(
        &self,
        service_type: &str,
        window: Duration,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        let deadline = Instant::now() + window;
        let mut rx = self.stream(service_type).await?;
        info!(service_type, ?window, "browsing for displays");

        let mut seen = HashSet::new();
        let mut endpoints = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(endpoint)) => {
                    if seen.insert(endpoint) {
                        info!(%endpoint, "display found");
                        endpoints.push(endpoint);
                    }
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }
        rx.close();

        if endpoints.is_empty() {
            return Err(DiscoveryError::NotFound { window });
        }
        Ok(endpoints)
    }
}

async fn resolve_instance<B: DnsSdBackend>(
    backend: Arc<B>,
    instance: ServiceInstance,
    tx: mpsc::Sender<Endpoint>,
) {
    let name = instance.name.clone();
    let endpoint = tokio::select! {
        _ = tx.closed() => return,
        result = run_stages(backend.as_ref(), &instance) => match result {
            Ok(endpoint) => endpoint,
            Err(err) => {
                warn!(name = %name, error = %err, "service instance dropped");
                return;
            }
        },
    };
    let _ = tx.send(endpoint).await;
}

async fn run_stages<B: DnsSdBackend>(
    backend: &B,
    instance: &ServiceInstance,
) -> Result<Endpoint, DiscoveryError> {
    let resolved = first_reply(Stage::Resolve, backend.resolve(instance).await?).await?;
    let srv = first_reply(Stage::SrvLookup, backend.query_srv(&resolved).await?).await?;
    let address = first_reply(
        Stage::AddressLookup,
        backend.query_ipv4(&resolved.host_target).await?,
    )
    .await?;
    debug!(host = %resolved.host_target, %address, port = srv.port, "service instance resolved");
    Ok(Endpoint::new(address, srv.port))
}

async fn first_reply<T>(stage: Stage, mut replies: mpsc::Receiver<T>) -> Result<T, DiscoveryError> {
    replies.recv().await.ok_or_else(|| DiscoveryError::Stage {
        stage,
        reason: "query ended without a reply".into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Scripted backend: answers every stage from fixed tables and keeps the
    /// browse channel open until the test drops it.
    #[derive(Default)]
    struct FakeBackend {
        instances: Vec<ServiceInstance>,
        hosts: HashMap<String, (String, u16)>,
        addresses: HashMap<String, Ipv4Addr>,
        fail_browse: bool,
        browse_keepalive: Mutex<Vec<mpsc::Sender<ServiceInstance>>>,
    }

    impl FakeBackend {
        fn with_device(mut self, name: &str, host: &str, port: u16, addr: Ipv4Addr) -> Self {
            self.instances.push(ServiceInstance {
                interface_index: 1,
                name: name.into(),
                registration_type: "_airplay._tcp.".into(),
                domain: "local.".into(),
            });
            self.hosts.insert(name.into(), (host.into(), port));
            self.addresses.insert(host.into(), addr);
            self
        }

        fn reply<T: Send + 'static>(value: Option<T>) -> mpsc::Receiver<T> {
            let (tx, rx) = mpsc::channel(1);
            if let Some(value) = value {
                let _ = tx.try_send(value);
            }
            rx
        }
    }

    #[async_trait]
    impl DnsSdBackend for FakeBackend {
        async fn browse(
            &self,
            service_type: &str,
        ) -> Result<mpsc::Receiver<ServiceInstance>, DiscoveryError> {
            if self.fail_browse {
                return Err(DiscoveryError::Browse {
                    service_type: service_type.into(),
                    reason: "daemon unavailable".into(),
                });
            }
            let (tx, rx) = mpsc::channel(8);
            for instance in &self.instances {
                let _ = tx.try_send(instance.clone());
            }
            self.browse_keepalive.lock().push(tx);
            Ok(rx)
        }

        async fn resolve(
            &self,
            instance: &ServiceInstance,
        ) -> Result<mpsc::Receiver<ResolvedService>, DiscoveryError> {
            Ok(Self::reply(self.hosts.get(&instance.name).map(|(host, _)| {
                ResolvedService {
                    interface_index: instance.interface_index,
                    full_name: format!("{}._airplay._tcp.local.", instance.name),
                    host_target: host.clone(),
                }
            })))
        }

        async fn query_srv(
            &self,
            service: &ResolvedService,
        ) -> Result<mpsc::Receiver<SrvRecord>, DiscoveryError> {
            let port = self
                .hosts
                .values()
                .find(|(host, _)| *host == service.host_target)
                .map(|(_, port)| SrvRecord { port: *port });
            Ok(Self::reply(port))
        }

        async fn query_ipv4(
            &self,
            host_target: &str,
        ) -> Result<mpsc::Receiver<Ipv4Addr>, DiscoveryError> {
            Ok(Self::reply(self.addresses.get(host_target).copied()))
        }
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn discovers_every_announced_device() {
        let backend = FakeBackend::default()
            .with_device("Living Room", "living.local.", 7000, Ipv4Addr::new(10, 0, 0, 2))
            .with_device("Office", "office.local.", 7100, Ipv4Addr::new(10, 0, 0, 3));
        let resolver = Resolver::new(backend);

        let mut endpoints = resolver
            .discover("_airplay._tcp", Duration::from_secs(5))
            .await
            .expect("endpoints");
        endpoints.sort_by_key(|endpoint| endpoint.port);
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new(Ipv4Addr::new(10, 0, 0, 2), 7000),
                Endpoint::new(Ipv4Addr::new(10, 0, 0, 3), 7100),
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn empty_network_reports_not_found_after_window() {
        let resolver = Resolver::new(FakeBackend::default());
        let window = Duration::from_secs(5);
        let started = Instant::now();

        let err = resolver.discover("_airplay._tcp", window).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::NotFound { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= window);
        assert!(elapsed < window + Duration::from_millis(50));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn browse_failure_is_not_swallowed() {
        let resolver = Resolver::new(FakeBackend {
            fail_browse: true,
            ..FakeBackend::default()
        });
        let err = resolver
            .discover("_airplay._tcp", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Browse { .. }));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn failed_instance_does_not_stop_others() {
        let mut backend = FakeBackend::default()
            .with_device("Broken", "broken.local.", 7000, Ipv4Addr::new(10, 0, 0, 9))
            .with_device("Office", "office.local.", 7100, Ipv4Addr::new(10, 0, 0, 3));
        backend.addresses.remove("broken.local.");
        let resolver = Resolver::new(backend);

        let endpoints = resolver
            .discover("_airplay._tcp", Duration::from_secs(2))
            .await
            .expect("endpoints");
        assert_eq!(endpoints, vec![Endpoint::new(Ipv4Addr::new(10, 0, 0, 3), 7100)]);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn duplicate_announcements_are_reported_once() {
        let mut backend =
            FakeBackend::default().with_device("TV", "tv.local.", 7000, Ipv4Addr::new(10, 0, 0, 4));
        let mut second = backend.instances[0].clone();
        second.interface_index = 2;
        backend.instances.push(second);
        let resolver = Resolver::new(backend);

        let endpoints = resolver
            .discover("_airplay._tcp", Duration::from_secs(2))
            .await
            .expect("endpoints");
        assert_eq!(endpoints.len(), 1);
    }

    #[test_timeout::timeout]
    fn endpoint_displays_as_host_port() {
        let endpoint = Endpoint::new(Ipv4Addr::new(192, 168, 1, 20), 7000);
        assert_eq!(endpoint.to_string(), "192.168.1.20:7000");
    }
}
