use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use ahash::RandomState;
use bon::Builder;
use dashmap::DashMap;
use itertools::Itertools;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, error, info, warn};

use crate::{
    error::ForwardError,
    hosts::{HostsFileEditor, HostsUpdate, PrivilegedFileAccess},
    http::parse_host,
    proxy::{ProxyState, ReverseProxyServer},
    registry::SessionRegistry,
    router::{DEFAULT_HTTP_PORT, routing_key},
    session::{SessionError, SessionInfo, SessionKey},
    tunnel::TunnelOpener,
};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// A request to forward a pod port, optionally reachable through a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub key: SessionKey,
    // Zero lets the OS pick any free port.
    pub desired_local_port: u16,
    pub domain: Option<String>,
}

// Domain attached to a running forward.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardDomain {
    // Key in the route table (`host` or `host:port`).
    routing_key: String,
    // Name written to the hosts file.
    host: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub session: SessionInfo,
    pub domain: Option<String>,
}

// Result of applying the current forwards to the proxy and hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    // Port of the reverse proxy, if it's running.
    pub proxy_port: Option<u16>,
    // Outcome of the hosts file update, if one was attempted.
    pub hosts: Option<HostsUpdate>,
}

#[derive(Default)]
struct CommitState {
    // Domains in the hosts file as of the last successful write.
    last_written: Option<Vec<String>>,
}

// Ties together sessions, routes, the reverse proxy and the hosts file.
#[derive(Builder)]
pub struct ForwardManager<T, A> {
    registry: SessionRegistry<T>,
    proxy: ReverseProxyServer,
    // Hosts file editor, unless hosts management is disabled.
    hosts: Option<HostsFileEditor<A>>,
    // Port the reverse proxy tries first.
    #[builder(default = DEFAULT_HTTP_PORT)]
    proxy_port: u16,
    // Upper bound for the whole shutdown sequence.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    shutdown_timeout: Duration,
    #[builder(skip = DashMap::default())]
    domains: DashMap<SessionKey, ForwardDomain, RandomState>,
    // Serializes route changes, commits and shutdown.
    #[builder(skip = Mutex::new(CommitState::default()))]
    lock: Mutex<CommitState>,
    #[builder(skip = AtomicBool::new(false))]
    shutting_down: AtomicBool,
}

impl<T: TunnelOpener, A: PrivilegedFileAccess> ForwardManager<T, A> {
    // State of the reverse proxy. Routes and sessions are only changed through the manager.
    pub fn proxy_state(&self) -> ProxyState {
        self.proxy.state()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    // Start a forwarding session and register its domain as a route.
    // Routes and hosts entries only take effect on the next `commit`.
    pub async fn start_forward(&self, request: ForwardRequest) -> Result<SessionInfo, ForwardError> {
        if self.is_shutting_down() {
            return Err(ForwardError::ShutdownInProgress);
        }
        let ForwardRequest {
            key,
            desired_local_port,
            domain,
        } = request;
        let domain = domain.map(|domain| parse_domain(&domain)).transpose()?;
        if let Some(domain) = domain.as_ref() {
            self.check_domain_available(&key, domain)?;
        }
        let info = self
            .registry
            .start_session(key.clone(), desired_local_port)
            .await?;
        let _lock = self.lock.lock().await;
        // Shutdown, a stop or another forward may have happened while the session was starting.
        if let Err(error) = self.check_started(&info, domain.as_ref()) {
            // Leave alone a newer session started for the same key.
            let ours = self
                .registry
                .get(&key)
                .is_some_and(|current| current.local_port == info.local_port);
            if ours {
                if let Err(stop_error) = self.registry.stop_session(&key).await {
                    warn!(%key, error = %stop_error, "Failed to stop session after rejecting forward.");
                }
            }
            return Err(error);
        }
        if let Some(domain) = domain {
            self.proxy
                .router()
                .add_route(&domain.routing_key, info.local_port);
            info!(%key, domain = %domain.routing_key, local_port = %info.local_port, "Forward started.");
            self.domains.insert(key, domain);
        } else {
            info!(%key, local_port = %info.local_port, "Forward started.");
        }
        Ok(info)
    }

    // Must be called with the lock held.
    fn check_started(
        &self,
        info: &SessionInfo,
        domain: Option<&ForwardDomain>,
    ) -> Result<(), ForwardError> {
        if self.is_shutting_down() {
            return Err(ForwardError::ShutdownInProgress);
        }
        let running = self.registry.get(&info.key).is_some_and(|current| {
            current.local_port == info.local_port && current.status.is_active()
        });
        if !running {
            return Err(SessionError::SessionNotFound(info.key.clone()).into());
        }
        match domain {
            Some(domain) => self.check_domain_available(&info.key, domain),
            None => Ok(()),
        }
    }

    fn check_domain_available(
        &self,
        key: &SessionKey,
        domain: &ForwardDomain,
    ) -> Result<(), ForwardError> {
        match self
            .domains
            .iter()
            .find(|entry| entry.value().routing_key == domain.routing_key && entry.key() != key)
        {
            Some(entry) => Err(ForwardError::DomainInUse {
                domain: domain.routing_key.clone(),
                owner: entry.key().clone(),
            }),
            None => Ok(()),
        }
    }

    // Remove the forward's route, then stop its session. Stopping an unknown forward is a no-op.
    pub async fn stop_forward(&self, key: &SessionKey) -> Result<(), ForwardError> {
        let _lock = self.lock.lock().await;
        if let Some((_, domain)) = self.domains.remove(key) {
            self.proxy.router().remove_route(&domain.routing_key);
        }
        self.registry.stop_session(key).await?;
        info!(%key, "Forward stopped.");
        Ok(())
    }

    // Active forwards sorted by key, with their domains.
    pub fn list_active(&self) -> Vec<ForwardInfo> {
        self.registry
            .list_active()
            .into_iter()
            .map(|session| {
                let domain = self
                    .domains
                    .get(&session.key)
                    .map(|domain| domain.routing_key.clone());
                ForwardInfo { session, domain }
            })
            .collect()
    }

    // Domains of active forwards, in key order and without duplicates.
    fn active_hosts(&self) -> Vec<String> {
        self.domains
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().host.clone()))
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, host)| host)
            .unique()
            .collect()
    }

    // Apply the current routes: start the proxy when routes appear, stop it when none are
    // left, and rewrite the hosts file if its domains changed since the last successful write.
    pub async fn commit(&self) -> Result<CommitOutcome, ForwardError> {
        let mut state = self.lock.lock().await;
        if self.is_shutting_down() {
            return Err(ForwardError::ShutdownInProgress);
        }
        let route_count = self.proxy.router().len();
        let proxy_port = match (route_count, self.proxy.state()) {
            (0, ProxyState::Stopped) => None,
            (0, _) => {
                self.proxy.stop().await;
                None
            }
            (_, ProxyState::Listening(port)) => Some(port),
            (_, _) => {
                let port = self.proxy.start(self.proxy_port).await?;
                if port != self.proxy_port {
                    warn!(
                        preferred = %self.proxy_port,
                        %port,
                        "Reverse proxy is not on the preferred port. Domains must include the port."
                    );
                }
                Some(port)
            }
        };
        let Some(hosts) = self.hosts.as_ref() else {
            return Ok(CommitOutcome {
                proxy_port,
                hosts: None,
            });
        };
        let domains = self.active_hosts();
        if state.last_written.as_ref() == Some(&domains) {
            debug!("Hosts file domains unchanged since last commit.");
            return Ok(CommitOutcome {
                proxy_port,
                hosts: Some(HostsUpdate::Unchanged),
            });
        }
        match hosts.update(&domains).await {
            Ok(update) => {
                state.last_written = Some(domains);
                Ok(CommitOutcome {
                    proxy_port,
                    hosts: Some(update),
                })
            }
            // Sessions and routes stay up; the next commit retries the write.
            Err(error) => {
                warn!(%error, "Unable to update hosts file. Domains may not resolve until it's updated.");
                Err(error.into())
            }
        }
    }

    // Stop every session, stop the proxy and empty the hosts file section, in that order.
    // Later calls are no-ops. Failures are collected rather than stopping the sequence.
    pub async fn shutdown(&self) -> Result<(), ForwardError> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already requested.");
            return Ok(());
        }
        info!("Shutting down forwards...");
        let mut failures = Vec::new();
        if timeout(self.shutdown_timeout, self.teardown(&mut failures))
            .await
            .is_err()
        {
            failures.push(format!(
                "shutdown timed out after {}",
                humantime::format_duration(self.shutdown_timeout)
            ));
        }
        if failures.is_empty() {
            info!("Shutdown complete.");
            Ok(())
        } else {
            error!(count = failures.len(), "Shutdown finished with failures.");
            Err(ForwardError::ShutdownPartialFailure(failures))
        }
    }

    async fn teardown(&self, failures: &mut Vec<String>) {
        let mut state = self.lock.lock().await;
        self.proxy.router().set_routes(Default::default());
        self.domains.clear();
        for error in self.registry.stop_all().await {
            failures.push(error.to_string());
        }
        self.proxy.stop().await;
        if let Some(hosts) = self.hosts.as_ref() {
            match hosts.cleanup().await {
                Ok(_) => state.last_written = Some(Vec::new()),
                Err(error) => {
                    warn!(%error, "Unable to clean up hosts file.");
                    failures.push(error.to_string());
                }
            }
        }
    }
}

// Turn a domain into its routing key and hosts file name.
fn parse_domain(domain: &str) -> Result<ForwardDomain, ForwardError> {
    let (host, port) =
        parse_host(domain.trim()).map_err(|_| ForwardError::InvalidDomain(domain.to_string()))?;
    // Hosts file entries must be plain names.
    if host.starts_with('[') || host.contains('*') {
        return Err(ForwardError::InvalidDomain(domain.to_string()));
    }
    Ok(ForwardDomain {
        routing_key: routing_key(&host, port),
        host,
    })
}
