#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod config;
mod droppable_handle;
mod entrypoint;
mod error;
mod hosts;
mod http;
mod manager;
mod port_allocator;
mod proxy;
mod registry;
mod router;
mod session;
mod tunnel;

pub use config::{ApplicationConfig, parse_forward};
pub use entrypoint::{entrypoint, entrypoint_with};
pub use error::ForwardError;
pub use hosts::{
    DirectFileAccess, ElevatedFileAccess, HostsError, HostsFileEditor, HostsUpdate,
    PrivilegedFileAccess, SECTION_END, SECTION_START, default_hosts_path,
};
pub use manager::{CommitOutcome, ForwardInfo, ForwardManager, ForwardRequest};
pub use port_allocator::{PortAllocator, PortError};
pub use proxy::{FALLBACK_PROXY_PORT, ProxyError, ProxyState, ReverseProxyServer};
pub use registry::SessionRegistry;
pub use router::{DomainRouter, RouteNotFound, routing_key};
pub use session::{SessionError, SessionInfo, SessionKey, SessionOptions, SessionStatus};
pub use tunnel::{KubeTunnelOpener, TunnelError, TunnelOpener, TunnelStream};
