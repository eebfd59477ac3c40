use std::net::IpAddr;
use std::time::Duration;

use anyhow::Result;
use flick::discovery::{Advertiser, DiscoveryListener};

fn free_udp_port() -> Result<u16> {
    let sock = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(sock.local_addr()?.port())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn beacon_reaches_listener_on_loopback() -> Result<()> {
    let port = free_udp_port()?;
    let mut listener = DiscoveryListener::bind_port(port).await?;

    let advertiser = Advertiser::start_to(
        "flick://192.168.7.4:4000|den-laptop".to_string(),
        IpAddr::from([127, 0, 0, 1]),
        port,
    );

    let peer = tokio::time::timeout(Duration::from_secs(10), listener.next())
        .await
        .expect("no beacon heard")
        .expect("listener stopped");
    assert_eq!(peer.descriptor.name, "den-laptop");
    assert_eq!(peer.descriptor.host, "192.168.7.4");
    assert_eq!(peer.descriptor.port, 4000);

    advertiser.stop();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeat_beacons_do_not_duplicate_peers() -> Result<()> {
    let port = free_udp_port()?;
    let mut listener = DiscoveryListener::bind_port(port).await?;

    let _adv_a = Advertiser::start_to(
        "flick://10.0.0.8:4000|phone".to_string(),
        IpAddr::from([127, 0, 0, 1]),
        port,
    );
    let _adv_b = Advertiser::start_to(
        "flick://10.0.0.9:4000|tablet".to_string(),
        IpAddr::from([127, 0, 0, 1]),
        port,
    );

    // Two distinct names announce themselves, however often they beacon.
    for _ in 0..2 {
        tokio::time::timeout(Duration::from_secs(10), listener.next())
            .await
            .expect("no beacon heard")
            .expect("listener stopped");
    }
    // Give repeat beacons a chance to arrive, then check the roster.
    tokio::time::sleep(Duration::from_secs(4)).await;
    let peers = listener.peers();
    assert_eq!(peers.len(), 2);

    let mut names: Vec<_> = peers.iter().map(|p| p.descriptor.name.clone()).collect();
    names.sort();
    assert_eq!(names, vec!["phone", "tablet"]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_datagrams_are_ignored() -> Result<()> {
    let port = free_udp_port()?;
    let mut listener = DiscoveryListener::bind_port(port).await?;

    let sock = tokio::net::UdpSocket::bind("127.0.0.1:0").await?;
    sock.send_to(b"garbage with no shape", ("127.0.0.1", port))
        .await?;
    sock.send_to(b"flick://1.2.3.4:not-a-port|x", ("127.0.0.1", port))
        .await?;
    sock.send_to(b"flick://5.6.7.8:4000|survivor", ("127.0.0.1", port))
        .await?;

    let peer = tokio::time::timeout(Duration::from_secs(10), listener.next())
        .await
        .expect("valid beacon not heard")
        .expect("listener stopped");
    assert_eq!(peer.descriptor.name, "survivor");
    assert_eq!(listener.peers().len(), 1);
    Ok(())
}
