use std::{
    io,
    net::{IpAddr, Ipv4Addr},
    ops::RangeInclusive,
};

use tokio::net::TcpListener;
use tracing::{debug, trace};

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("No free port available (starting from {0})")]
    PortUnavailable(u16),
    #[error("Error probing port {port}: {source}")]
    Probe { port: u16, source: io::Error },
}

// Finds free local TCP ports. Probing is advisory: the caller's own bind is the
// final authority, and must retry through the allocator if it loses the race.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    listen_address: IpAddr,
}

impl Default for PortAllocator {
    fn default() -> Self {
        PortAllocator::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

impl PortAllocator {
    pub fn new(listen_address: IpAddr) -> Self {
        PortAllocator { listen_address }
    }

    pub fn listen_address(&self) -> IpAddr {
        self.listen_address
    }

    // Find a free port starting from `preferred` and scanning upwards,
    // skipping any port for which `is_tracked` returns true.
    // If the upper range is exhausted, let the OS pick any free port.
    pub async fn allocate<F>(&self, preferred: u16, is_tracked: F) -> Result<u16, PortError>
    where
        F: Fn(u16) -> bool,
    {
        // Zero means any port will do.
        if preferred != 0 {
            if let Some(port) = self.scan(preferred..=u16::MAX, &is_tracked).await? {
                return Ok(port);
            }
        }
        // Let the OS choose, making sure it doesn't hand out a tracked port.
        for _ in 0..16 {
            let port = self.probe_any().await?;
            if !is_tracked(port) {
                return Ok(port);
            }
        }
        Err(PortError::PortUnavailable(preferred))
    }

    // Find a free port only within the given range.
    pub async fn allocate_within<F>(
        &self,
        range: RangeInclusive<u16>,
        is_tracked: F,
    ) -> Result<u16, PortError>
    where
        F: Fn(u16) -> bool,
    {
        let start = *range.start();
        self.scan(range, &is_tracked)
            .await?
            .ok_or(PortError::PortUnavailable(start))
    }

    async fn scan<F>(
        &self,
        range: RangeInclusive<u16>,
        is_tracked: &F,
    ) -> Result<Option<u16>, PortError>
    where
        F: Fn(u16) -> bool,
    {
        for port in range {
            if port == 0 || is_tracked(port) {
                continue;
            }
            match self.probe(port).await {
                Ok(true) => {
                    debug!(%port, "Allocated local port.");
                    return Ok(Some(port));
                }
                Ok(false) => trace!(%port, "Port is busy."),
                Err(source) => return Err(PortError::Probe { port, source }),
            }
        }
        Ok(None)
    }

    // Returns whether the port could be bound at this moment.
    async fn probe(&self, port: u16) -> io::Result<bool> {
        match TcpListener::bind((self.listen_address, port)).await {
            Ok(_) => Ok(true),
            Err(error) if is_port_taken(&error) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn probe_any(&self) -> Result<u16, PortError> {
        let listener = TcpListener::bind((self.listen_address, 0))
            .await
            .map_err(|source| PortError::Probe { port: 0, source })?;
        listener
            .local_addr()
            .map(|address| address.port())
            .map_err(|source| PortError::Probe { port: 0, source })
    }
}

// Bind errors that mean "try another port" rather than "give up".
pub(crate) fn is_port_taken(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}
