use crate::{
    hosts::HostsError, port_allocator::PortError, proxy::ProxyError,
    session::{SessionError, SessionKey},
};

// Errors surfaced to the orchestrator's caller.
#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Hosts(#[from] HostsError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("Failed to start reverse proxy: {0}")]
    Proxy(#[from] ProxyError),
    #[error("Invalid domain {0:?}")]
    InvalidDomain(String),
    #[error("Domain {domain} is already used by {owner}")]
    DomainInUse { domain: String, owner: SessionKey },
    #[error("Shutdown already in progress")]
    ShutdownInProgress,
    #[error("Shutdown finished with {} failure(s): {}", .0.len(), .0.join("; "))]
    ShutdownPartialFailure(Vec<String>),
}
