use std::{future::Future, sync::Arc};

use color_eyre::eyre::{Context, eyre};
use tracing::{debug, error, info, warn};

use crate::{
    config::ApplicationConfig,
    error::ForwardError,
    hosts::{ElevatedFileAccess, HostsFileEditor, PrivilegedFileAccess},
    manager::ForwardManager,
    port_allocator::PortAllocator,
    proxy::ReverseProxyServer,
    registry::SessionRegistry,
    router::DomainRouter,
    session::SessionOptions,
    tunnel::{KubeTunnelOpener, TunnelOpener},
};

// Run until a termination signal is received, forwarding to pods through the Kubernetes API.
pub async fn entrypoint(config: ApplicationConfig) -> color_eyre::Result<()> {
    let access = ElevatedFileAccess::builder()
        .elevation_command(config.elevation_command_args())
        .build();
    entrypoint_with(config, KubeTunnelOpener::new(), access, wait_for_signal()).await
}

// Run with the given tunnel and file access capabilities until `shutdown_signal` resolves.
pub async fn entrypoint_with<T, A, S>(
    config: ApplicationConfig,
    opener: T,
    access: A,
    shutdown_signal: S,
) -> color_eyre::Result<()>
where
    T: TunnelOpener,
    A: PrivilegedFileAccess,
    S: Future<Output = ()>,
{
    let hosts = (!config.disable_hosts_file).then(|| {
        HostsFileEditor::builder()
            .maybe_path(config.hosts_file.clone())
            .access(access)
            .write_timeout(config.privileged_write_timeout.into())
            .build()
    });

    if config.cleanup {
        let Some(hosts) = hosts else {
            return Err(eyre!("--cleanup can't be used with --disable-hosts-file"));
        };
        let result = hosts
            .cleanup()
            .await
            .with_context(|| format!("Error cleaning up {}", hosts.path().display()))?;
        info!(?result, path = %hosts.path().display(), "Hosts file cleaned up.");
        return Ok(());
    }

    let manager = build_manager(&config, opener, hosts);

    let mut started = 0;
    for request in config.forwards.iter().cloned() {
        let key = request.key.clone();
        match manager.start_forward(request).await {
            Ok(info) => {
                info!(%key, local_port = %info.local_port, "Forward ready.");
                started += 1;
            }
            Err(error) => error!(%key, %error, "Unable to start forward."),
        }
    }
    if started == 0 && !config.forwards.is_empty() {
        if let Err(shutdown_error) = manager.shutdown().await {
            error!(error = %shutdown_error, "Error shutting down.");
        }
        return Err(eyre!("None of the forwards could be started"));
    }

    match manager.commit().await {
        Ok(outcome) => {
            if let Some(port) = outcome.proxy_port {
                info!(%port, "Reverse proxy ready.");
            }
            debug!(?outcome, "Committed forwards.");
        }
        // Routing keeps working without the hosts file; domains just won't resolve.
        Err(ForwardError::Hosts(error)) => warn!(%error, "Hosts file not updated."),
        // Forwards stay reachable on their local ports without the reverse proxy.
        Err(error) => warn!(%error, "Domains are unavailable. Use the local ports instead."),
    }

    shutdown_signal.await;
    info!("kubehost is shutting down.");
    manager
        .shutdown()
        .await
        .with_context(|| "Error shutting down forwards")
}

fn build_manager<T, A>(
    config: &ApplicationConfig,
    opener: T,
    hosts: Option<HostsFileEditor<A>>,
) -> Arc<ForwardManager<T, A>>
where
    T: TunnelOpener,
    A: PrivilegedFileAccess,
{
    let options = SessionOptions::builder()
        .buffer_size(config.buffer_size)
        .maybe_connection_timeout(config.connection_timeout.map(Into::into))
        .verify_tunnel(config.verify_tunnel_on_start)
        .build();
    let registry = SessionRegistry::builder()
        .opener(Arc::new(opener))
        .allocator(PortAllocator::new(config.listen_address))
        .options(options)
        .build();
    let proxy = ReverseProxyServer::builder()
        .router(Arc::new(DomainRouter::new()))
        .listen_address(config.listen_address)
        .upstream_address(config.listen_address)
        .buffer_size(config.buffer_size)
        .maybe_http_request_timeout(config.http_request_timeout.map(Into::into))
        .maybe_connection_timeout(config.connection_timeout.map(Into::into))
        .build();
    Arc::new(
        ForwardManager::builder()
            .registry(registry)
            .proxy(proxy)
            .maybe_hosts(hosts)
            .proxy_port(config.proxy_port)
            .shutdown_timeout(config.shutdown_timeout.into())
            .build(),
    )
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut signal_terminate, mut signal_interrupt) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
        (Err(error), _) | (_, Err(error)) => {
            error!(%error, "Unable to listen for signals. Falling back to Ctrl+C.");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal_terminate.recv() => debug!("Received SIGTERM."),
        _ = signal_interrupt.recv() => debug!("Received SIGINT."),
    };
}

#[cfg(windows)]
async fn wait_for_signal() {
    use tokio::signal::windows;

    let (mut signal_c, mut signal_break, mut signal_close, mut signal_shutdown) = match (
        windows::ctrl_c(),
        windows::ctrl_break(),
        windows::ctrl_close(),
        windows::ctrl_shutdown(),
    ) {
        (Ok(c), Ok(r#break), Ok(close), Ok(shutdown)) => (c, r#break, close, shutdown),
        _ => {
            error!("Unable to listen for console events. Falling back to Ctrl+C.");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = signal_c.recv() => debug!("Received CTRL_C."),
        _ = signal_break.recv() => debug!("Received CTRL_BREAK."),
        _ = signal_close.recv() => debug!("Received CTRL_CLOSE."),
        _ = signal_shutdown.recv() => debug!("Received CTRL_SHUTDOWN."),
    };
}
