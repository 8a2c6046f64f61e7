use clap::Parser;
use kubehost::{
    ApplicationConfig, DirectFileAccess, SECTION_END, SECTION_START, entrypoint_with,
};
use tempfile::NamedTempFile;

use crate::common::LocalTunnelOpener;

/// This test ensures that --cleanup empties a section left behind by a previous run,
/// keeping every other line.
#[test_log::test(tokio::test)]
async fn lib_cleanup_mode() {
    let hosts_file = NamedTempFile::new().unwrap();
    std::fs::write(
        hosts_file.path(),
        format!(
            "127.0.0.1 localhost\n\n{SECTION_START}\n127.0.0.1\tweb.default.kind\n127.0.0.1\tapi.default.kind\n{SECTION_END}\n\n10.0.0.5 db.internal\n"
        ),
    )
    .unwrap();
    let config = ApplicationConfig::parse_from([
        "kubehost".to_string(),
        format!("--hosts-file={}", hosts_file.path().display()),
        "--cleanup".into(),
    ]);
    // Cleanup returns right away, without waiting for a signal.
    entrypoint_with(
        config,
        LocalTunnelOpener::default(),
        DirectFileAccess,
        std::future::pending(),
    )
    .await
    .expect("cleanup failed");
    let content = std::fs::read_to_string(hosts_file.path()).unwrap();
    assert_eq!(
        content,
        format!("127.0.0.1 localhost\n\n{SECTION_START}\n{SECTION_END}\n\n10.0.0.5 db.internal\n")
    );

    // Running it again changes nothing.
    let config = ApplicationConfig::parse_from([
        "kubehost".to_string(),
        format!("--hosts-file={}", hosts_file.path().display()),
        "--cleanup".into(),
    ]);
    entrypoint_with(
        config,
        LocalTunnelOpener::default(),
        DirectFileAccess,
        std::future::pending(),
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read_to_string(hosts_file.path()).unwrap(), content);
}
