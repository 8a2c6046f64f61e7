use std::{
    future::Future,
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::RandomState;
use bon::Builder;
use dashmap::{DashMap, mapref::entry::Entry};
use itertools::Itertools;
use tracing::{info, warn};

use crate::{
    port_allocator::{PortAllocator, is_port_taken},
    session::{
        ForwardSession, SessionError, SessionInfo, SessionKey, SessionOptions, SessionStatus,
    },
    tunnel::TunnelOpener,
};

// How many times to re-allocate when the port is grabbed between probe and bind.
pub const MAX_BIND_ATTEMPTS: usize = 8;

enum SessionSlot {
    // Key is reserved while the listener is being bound, tagged with the reservation's ID.
    Requesting(u64),
    Running(ForwardSession),
}

// Owns every forwarding session, keyed by target. Only one session may be active per key.
#[derive(Builder)]
pub struct SessionRegistry<T> {
    // Capability used by every session to reach the cluster.
    opener: Arc<T>,
    // Allocator for local ports, which also defines the listening address.
    #[builder(default)]
    allocator: PortAllocator,
    // Options applied to each new session.
    #[builder(default)]
    options: SessionOptions,
    #[builder(skip = DashMap::default())]
    sessions: DashMap<SessionKey, SessionSlot, RandomState>,
    // Index of local ports owned by running sessions.
    #[builder(skip = DashMap::default())]
    ports: DashMap<u16, SessionKey, RandomState>,
    #[builder(skip = AtomicU64::new(0))]
    next_reservation: AtomicU64,
}

impl<T: TunnelOpener> SessionRegistry<T> {
    pub fn listen_address(&self) -> IpAddr {
        self.allocator.listen_address()
    }

    // Start a session for the key, listening on the desired port or the next free one.
    pub async fn start_session(
        &self,
        key: SessionKey,
        desired_local_port: u16,
    ) -> Result<SessionInfo, SessionError> {
        // Reserve the key before anything else, so concurrent starts can't both succeed.
        let reservation = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        match self.sessions.entry(key.clone()) {
            Entry::Occupied(_) => return Err(SessionError::SessionAlreadyActive(key)),
            Entry::Vacant(entry) => {
                entry.insert(SessionSlot::Requesting(reservation));
            }
        }
        match self.bind_session(&key, desired_local_port).await {
            Ok(session) => {
                let info = session.info();
                let orphan = match self.sessions.get_mut(&key) {
                    Some(mut slot)
                        if matches!(*slot, SessionSlot::Requesting(id) if id == reservation) =>
                    {
                        self.ports.insert(info.local_port, key.clone());
                        *slot = SessionSlot::Running(session);
                        None
                    }
                    _ => Some(session),
                };
                match orphan {
                    None => Ok(info),
                    // Stopped while we were binding, possibly followed by a newer start.
                    Some(session) => {
                        info!(%key, "Session stopped before it finished starting.");
                        session.stop().await?;
                        Err(SessionError::SessionNotFound(key))
                    }
                }
            }
            Err(error) => {
                self.sessions.remove_if(&key, |_, slot| {
                    matches!(slot, SessionSlot::Requesting(id) if *id == reservation)
                });
                warn!(%key, status = ?SessionStatus::Failed, %error, "Failed to start session.");
                Err(error)
            }
        }
    }

    async fn bind_session(
        &self,
        key: &SessionKey,
        desired_local_port: u16,
    ) -> Result<ForwardSession, SessionError> {
        if let Some(owner) = self.ports.get(&desired_local_port) {
            if *owner != *key {
                return Err(SessionError::PortInUseByAnotherActiveSession {
                    port: desired_local_port,
                    owner: owner.clone(),
                });
            }
        }
        bind_with_retry(
            key,
            &self.allocator,
            desired_local_port,
            |port| self.ports.contains_key(&port),
            |port| {
                ForwardSession::bind(
                    key.clone(),
                    self.allocator.listen_address(),
                    port,
                    Arc::clone(&self.opener),
                    &self.options,
                )
            },
        )
        .await
    }

    // Stop the session for the key. Stopping an unknown or stopped session is not an error.
    pub async fn stop_session(&self, key: &SessionKey) -> Result<(), SessionError> {
        let Some((key, slot)) = self.sessions.remove(key) else {
            return Ok(());
        };
        match slot {
            SessionSlot::Requesting(_) => Ok(()),
            SessionSlot::Running(session) => {
                self.ports
                    .remove_if(&session.local_port(), |_, owner| *owner == key);
                session.stop().await
            }
        }
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.sessions.get(key).is_some_and(|slot| match &*slot {
            SessionSlot::Requesting(_) => false,
            SessionSlot::Running(session) => session.status().is_active(),
        })
    }

    pub fn get(&self, key: &SessionKey) -> Option<SessionInfo> {
        self.sessions.get(key).and_then(|slot| match &*slot {
            SessionSlot::Requesting(_) => None,
            SessionSlot::Running(session) => Some(session.info()),
        })
    }

    // All listening or active sessions, sorted by key.
    pub fn list_active(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .filter_map(|entry| match entry.value() {
                SessionSlot::Running(session) if session.status().is_active() => {
                    Some(session.info())
                }
                _ => None,
            })
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .collect()
    }

    pub fn is_port_tracked(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    // Stop every session, continuing past failures. Returns the errors encountered.
    pub async fn stop_all(&self) -> Vec<SessionError> {
        let keys: Vec<SessionKey> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut errors = Vec::new();
        for key in keys {
            if let Err(error) = self.stop_session(&key).await {
                warn!(%key, %error, "Failed to stop session.");
                errors.push(error);
            }
        }
        errors
    }
}

// Allocate a port and bind it, allocating again when the port is taken between probe and bind.
async fn bind_with_retry<S, B, Fut>(
    key: &SessionKey,
    allocator: &PortAllocator,
    desired_local_port: u16,
    is_tracked: impl Fn(u16) -> bool,
    mut bind: B,
) -> Result<S, SessionError>
where
    B: FnMut(u16) -> Fut,
    Fut: Future<Output = Result<S, SessionError>>,
{
    let mut candidate = desired_local_port;
    let mut attempts = 0;
    loop {
        attempts += 1;
        let port = allocator.allocate(candidate, &is_tracked).await?;
        match bind(port).await {
            Ok(bound) => return Ok(bound),
            // Someone else grabbed the port after our probe.
            Err(SessionError::Bind { port, source })
                if is_port_taken(&source) && attempts < MAX_BIND_ATTEMPTS =>
            {
                warn!(%key, %port, "Port taken after allocation. Retrying.");
                candidate = port.checked_add(1).unwrap_or(1);
            }
            Err(error) => return Err(error),
        }
    }
}
