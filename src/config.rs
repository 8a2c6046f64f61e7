use std::{net::IpAddr, path::PathBuf};

use clap::Parser;
use humantime::Duration;

use crate::{manager::ForwardRequest, session::SessionKey};

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Pod port to forward, optionally exposed through a domain on the reverse proxy.
    ///
    /// Format is CONTEXT/NAMESPACE/POD:REMOTE_PORT[:LOCAL_PORT][=DOMAIN].
    /// Without LOCAL_PORT, the remote port is tried first locally.
    /// Can be repeated.
    #[arg(
        long = "forward",
        value_parser = parse_forward,
        value_name = "CONTEXT/NAMESPACE/POD:REMOTE[:LOCAL][=DOMAIN]"
    )]
    pub forwards: Vec<ForwardRequest>,

    /// Address to listen on for forwarded ports and the reverse proxy.
    #[arg(long, default_value = "127.0.0.1", value_name = "ADDRESS")]
    pub listen_address: IpAddr,

    /// Preferred port for the reverse proxy. If it's unavailable, 8080 is tried next.
    #[arg(long, default_value_t = 80, value_name = "PORT")]
    pub proxy_port: u16,

    /// Hosts file to manage. Defaults to the OS hosts file.
    #[arg(long, value_name = "FILE")]
    pub hosts_file: Option<PathBuf>,

    /// Command used to gain privileges when writing to the hosts file.
    /// Set to an empty string to run file commands directly.
    #[arg(long, default_value = "sudo -n", value_name = "COMMAND")]
    pub elevation_command: String,

    /// Size of the buffer used when copying data between connections.
    #[arg(
        long,
        default_value_t = 32_768,
        value_parser = validate_buffer_size,
        value_name = "BYTES"
    )]
    pub buffer_size: usize,

    /// Time until a forwarded connection is forcibly closed.
    /// By default, connections never time out.
    #[arg(long, value_name = "DURATION")]
    pub connection_timeout: Option<Duration>,

    /// Time until an HTTP request through the reverse proxy is cancelled.
    #[arg(long, value_name = "DURATION")]
    pub http_request_timeout: Option<Duration>,

    /// Time to wait for a privileged write to the hosts file, including any password prompt.
    #[arg(long, default_value = "60s", value_name = "DURATION")]
    pub privileged_write_timeout: Duration,

    /// Maximum time spent stopping forwards and cleaning up when exiting.
    #[arg(long, default_value = "10s", value_name = "DURATION")]
    pub shutdown_timeout: Duration,

    /// Open one tunnel as soon as each forward starts, failing the forward if the pod is unreachable.
    #[arg(long, default_value_t = false)]
    pub verify_tunnel_on_start: bool,

    /// Don't modify the hosts file. Domains must then be resolved by other means.
    #[arg(long, default_value_t = false)]
    pub disable_hosts_file: bool,

    /// Only empty the managed section of the hosts file, then exit.
    #[arg(long, default_value_t = false)]
    pub cleanup: bool,
}

impl ApplicationConfig {
    // Elevation command split into program and arguments.
    pub fn elevation_command_args(&self) -> Vec<String> {
        self.elevation_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

fn validate_buffer_size(value: &str) -> Result<usize, String> {
    let size: usize = value.parse().map_err(|_| "invalid number".to_string())?;
    if size < 1_024 {
        Err("buffer size must be at least 1024 bytes".into())
    } else {
        Ok(size)
    }
}

fn parse_port(value: &str, name: &str) -> Result<u16, String> {
    value
        .parse::<u16>()
        .map_err(|_| format!("invalid {name} {value:?}"))
}

// Parse CONTEXT/NAMESPACE/POD:REMOTE[:LOCAL][=DOMAIN].
// Context names may contain slashes, so the target is split from the right.
pub fn parse_forward(value: &str) -> Result<ForwardRequest, String> {
    let (target, domain) = match value.split_once('=') {
        Some((target, domain)) if !domain.trim().is_empty() => {
            (target, Some(domain.trim().to_string()))
        }
        Some(_) => return Err("domain must not be empty".into()),
        None => (value, None),
    };
    let mut parts = target.rsplitn(3, '/');
    let (Some(pod_ports), Some(namespace), Some(context)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err("expected CONTEXT/NAMESPACE/POD:REMOTE_PORT".into());
    };
    let mut ports = pod_ports.split(':');
    let pod = ports.next().unwrap_or_default();
    let remote_port = match ports.next() {
        Some(port) => parse_port(port, "remote port")?,
        None => return Err("missing remote port".into()),
    };
    let desired_local_port = match ports.next() {
        Some(port) => parse_port(port, "local port")?,
        None => remote_port,
    };
    if ports.next().is_some() {
        return Err("too many ports".into());
    }
    if context.is_empty() || namespace.is_empty() || pod.is_empty() {
        return Err("context, namespace and pod must not be empty".into());
    }
    if remote_port == 0 {
        return Err("remote port must not be 0".into());
    }
    Ok(ForwardRequest {
        key: SessionKey::new(context, namespace, pod, remote_port),
        desired_local_port,
        domain,
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod application_config_tests {
    use std::{net::Ipv4Addr, time::Duration};

    use clap::Parser;

    use crate::session::SessionKey;

    use super::{ApplicationConfig, parse_forward};

    #[test]
    fn parses_forward_with_domain() {
        let request = parse_forward("kind-dev/default/web-7d9f:8080:18080=web.default.kind-dev")
            .unwrap();
        assert_eq!(
            request.key,
            SessionKey::new("kind-dev", "default", "web-7d9f", 8080)
        );
        assert_eq!(request.desired_local_port, 18080);
        assert_eq!(request.domain.as_deref(), Some("web.default.kind-dev"));
    }

    #[test]
    fn local_port_defaults_to_remote_port() {
        let request = parse_forward("ctx/ns/pod:3000").unwrap();
        assert_eq!(request.desired_local_port, 3000);
        assert_eq!(request.domain, None);
    }

    #[test]
    fn context_may_contain_slashes() {
        let request =
            parse_forward("arn:aws:eks:eu-west-1:123:cluster/prod/api/api-0:80=api.api.prod")
                .unwrap();
        assert_eq!(request.key.context, "arn:aws:eks:eu-west-1:123:cluster/prod");
        assert_eq!(request.key.namespace, "api");
        assert_eq!(request.key.pod, "api-0");
        assert_eq!(request.key.remote_port, 80);
    }

    #[test]
    fn rejects_invalid_forwards() {
        for value in [
            "ns/pod:80",
            "ctx/ns/pod",
            "ctx/ns/pod:http",
            "ctx/ns/pod:0",
            "ctx/ns/pod:80:81:82",
            "ctx//pod:80",
            "ctx/ns/pod:80=",
        ] {
            assert!(parse_forward(value).is_err(), "{value} should be rejected");
        }
    }

    #[test]
    fn uses_defaults() {
        let config = ApplicationConfig::parse_from(["kubehost"]);
        assert!(config.forwards.is_empty());
        assert_eq!(config.listen_address, Ipv4Addr::LOCALHOST);
        assert_eq!(config.proxy_port, 80);
        assert_eq!(config.hosts_file, None);
        assert_eq!(config.elevation_command_args(), vec!["sudo", "-n"]);
        assert_eq!(config.buffer_size, 32_768);
        assert_eq!(config.connection_timeout, None);
        assert_eq!(*config.shutdown_timeout, Duration::from_secs(10));
        assert!(!config.cleanup);
    }

    #[test]
    fn parses_options() {
        let config = ApplicationConfig::parse_from([
            "kubehost",
            "--forward=ctx/ns/web:80=web.ns.ctx",
            "--forward",
            "ctx/ns/api:8080:0",
            "--proxy-port=18080",
            "--hosts-file=/tmp/hosts",
            "--elevation-command=",
            "--http-request-timeout=5s",
            "--privileged-write-timeout=2m",
            "--disable-hosts-file",
        ]);
        assert_eq!(config.forwards.len(), 2);
        assert_eq!(config.forwards[1].desired_local_port, 0);
        assert_eq!(config.proxy_port, 18080);
        assert!(config.elevation_command_args().is_empty());
        assert_eq!(
            config.http_request_timeout.map(Into::into),
            Some(Duration::from_secs(5))
        );
        assert_eq!(*config.privileged_write_timeout, Duration::from_secs(120));
        assert!(config.disable_hosts_file);
    }

    #[test]
    fn rejects_small_buffer_size() {
        assert!(ApplicationConfig::try_parse_from(["kubehost", "--buffer-size=10"]).is_err());
    }
}
