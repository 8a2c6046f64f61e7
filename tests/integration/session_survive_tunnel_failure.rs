use std::{collections::HashMap, sync::Arc, time::Duration};

use kubehost::{SessionKey, SessionRegistry, SessionStatus};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};

use crate::common::LocalTunnelOpener;

/// This test ensures that a session keeps listening when its tunnel can't be opened,
/// and that other sessions are unaffected.
#[test_log::test(tokio::test)]
async fn session_survive_tunnel_failure() {
    // A pod that echoes back what it receives
    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_address = echo.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = echo.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    let registry = SessionRegistry::builder()
        .opener(Arc::new(LocalTunnelOpener {
            pods: HashMap::from([("echo".into(), echo_address)]),
        }))
        .build();
    let broken = registry
        .start_session(SessionKey::new("kind", "default", "gone", 80), 0)
        .await
        .unwrap();
    let working = registry
        .start_session(SessionKey::new("kind", "default", "echo", 80), 0)
        .await
        .unwrap();

    // The broken session closes the accepted connection...
    let mut stream = TcpStream::connect(("127.0.0.1", broken.local_port))
        .await
        .unwrap();
    let mut buf = [0u8; 4];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
    // ...but keeps listening.
    assert!(
        TcpStream::connect(("127.0.0.1", broken.local_port))
            .await
            .is_ok()
    );
    assert_eq!(
        registry.get(&broken.key).unwrap().status,
        SessionStatus::Listening
    );

    let mut stream = TcpStream::connect(("127.0.0.1", working.local_port))
        .await
        .unwrap();
    stream.write_all(b"ping").await.unwrap();
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(
        registry.get(&working.key).unwrap().status,
        SessionStatus::Active
    );
    assert!(registry.stop_all().await.is_empty());
}
