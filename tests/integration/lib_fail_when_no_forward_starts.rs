use clap::Parser;
use kubehost::{ApplicationConfig, DirectFileAccess, entrypoint_with};
use tempfile::NamedTempFile;

use crate::common::{LocalTunnelOpener, free_port};

/// This test ensures that kubehost exits with an error when every forward fails to start,
/// and leaves the hosts file alone.
#[test_log::test(tokio::test)]
async fn lib_fail_when_no_forward_starts() {
    let hosts_file = NamedTempFile::new().unwrap();
    std::fs::write(hosts_file.path(), "127.0.0.1 localhost\n").unwrap();
    let proxy_port = free_port().await;
    let config = ApplicationConfig::parse_from([
        "kubehost".to_string(),
        "--forward=kind/default/missing:80:0=missing.default.kind".into(),
        format!("--proxy-port={proxy_port}"),
        format!("--hosts-file={}", hosts_file.path().display()),
        "--verify-tunnel-on-start".into(),
    ]);
    let result = entrypoint_with(
        config,
        LocalTunnelOpener::default(),
        DirectFileAccess,
        std::future::pending(),
    )
    .await;
    assert!(result.is_err(), "entrypoint should fail");
    assert_eq!(
        std::fs::read_to_string(hosts_file.path()).unwrap(),
        "127.0.0.1 localhost\n"
    );
}
