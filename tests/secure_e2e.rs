use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use flick::{Event, Session, SessionConfig};
use tokio::sync::mpsc::UnboundedReceiver;

async fn wait_for(
    rx: &mut UnboundedReceiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(20), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if pred(&ev) {
            return ev;
        }
        if let Event::Error { kind, message } = &ev {
            panic!("unexpected error event ({kind:?}): {message}");
        }
    }
}

fn write_file(path: &Path, size: usize) -> Result<()> {
    let mut f = std::fs::File::create(path)?;
    let mut val: u8 = 0;
    let mut buf = vec![0u8; 8 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(3);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

// The only test in this binary, so the config-dir override cannot race
// another test's TLS setup.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn secure_loopback_transfer_pins_and_completes() -> Result<()> {
    let config_dir = tempfile::tempdir()?;
    std::env::set_var("FLICK_CONFIG_DIR", config_dir.path());

    let save_dir = tempfile::tempdir()?;
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("secret.bin");
    write_file(&src, 150_000)?;

    let (server, mut server_events) = Session::new(SessionConfig {
        device_name: "receiver".into(),
        save_dir: save_dir.path().to_path_buf(),
        port: 0,
        prefer_secure: true,
        ..SessionConfig::default()
    });
    let addr = server.start_listening().await?;

    let (client, mut client_events) = Session::new(SessionConfig {
        device_name: "sender".into(),
        prefer_secure: true,
        ..SessionConfig::default()
    });
    client.connect("127.0.0.1", addr.port(), "receiver").await?;
    assert!(client.is_secured(), "handshake should have upgraded to tls");

    wait_for(&mut server_events, |e| matches!(e, Event::Connected { .. })).await;
    assert!(server.is_secured());

    client.offer_file(&src).await?;
    let ev = wait_for(&mut server_events, |e| {
        matches!(e, Event::TransferComplete { .. })
    })
    .await;
    if let Event::TransferComplete { path: Some(p), .. } = ev {
        assert_eq!(std::fs::read(p)?, std::fs::read(&src)?);
    } else {
        panic!("completion event without a path");
    }
    wait_for(&mut client_events, |e| {
        matches!(e, Event::TransferComplete { .. })
    })
    .await;

    // First contact pinned the server's certificate fingerprint.
    let pins = std::fs::read_to_string(config_dir.path().join("known_hosts"))?;
    assert!(pins.contains(&format!("127.0.0.1:{}", addr.port())));

    client.shutdown();
    server.shutdown();
    Ok(())
}
