use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn loopback_session(local_id: &str) -> (Arc<ChuteSession>, PeerEndpoint) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    let session = ChuteSession::from_udp_socket(socket, local_id).unwrap();
    (session, PeerEndpoint::from_addr(addr))
}

async fn wait_connected(session: &Arc<ChuteSession>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if session.is_connected().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn expect_receive(session: &Arc<ChuteSession>, expected: &str, timeout: Duration) {
    match tokio::time::timeout(timeout, session.recv_message()).await {
        Ok(Some(msg)) => assert_eq!(msg, expected.as_bytes()),
        other => panic!("timeout waiting for message {expected:?}: {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_and_exchange() -> Result<()> {
    let (a, _a_ep) = loopback_session("111111111");
    let (b, b_ep) = loopback_session("222222222");
    b.start();

    a.connect(b_ep, "222222222").await?;
    assert!(a.is_connected_to("222222222").await);
    assert!(wait_connected(&b, Duration::from_secs(2)).await);
    assert_eq!(b.current_peer_id().await, "111111111");

    a.send(b"hello B").await?;
    expect_receive(&b, "hello B", Duration::from_secs(2)).await;

    b.send(b"hello A").await?;
    expect_receive(&a, "hello A", Duration::from_secs(2)).await;

    // connected <=> peer id non-empty, in one observation per side.
    assert!(!a.current_peer_id().await.is_empty());
    assert!(!b.current_peer_id().await.is_empty());

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_busy_rejection() -> Result<()> {
    let (a, _) = loopback_session("111111111");
    let (b, b_ep) = loopback_session("222222222");
    let (c, _) = loopback_session("333333333");
    b.start();

    a.connect(b_ep.clone(), "222222222").await?;
    assert!(wait_connected(&b, Duration::from_secs(2)).await);

    // B is occupied; the third dialer is turned away with "busy".
    let err = c.connect(b_ep, "222222222").await.unwrap_err();
    assert!(matches!(err, Error::ErrBusy), "unexpected error: {err}");

    // B stays connected to A.
    assert!(b.is_connected_to("111111111").await);

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_dial_while_connected_is_busy() -> Result<()> {
    let (a, _) = loopback_session("111111111");
    let (b, b_ep) = loopback_session("222222222");
    b.start();

    a.connect(b_ep.clone(), "222222222").await?;
    let err = a.connect(b_ep, "222222222").await.unwrap_err();
    assert!(matches!(err, Error::ErrBusy));

    a.close().await;
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_identity_rejected() -> Result<()> {
    let (anon, _) = loopback_session("");
    let (b, b_ep) = loopback_session("222222222");
    b.start();

    let err = anon.connect(b_ep, "222222222").await.unwrap_err();
    assert!(matches!(err, Error::ErrBusy), "unexpected error: {err}");
    assert!(!b.is_connected().await);

    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_identity_too_long_rejected_locally() {
    let long_id = "9".repeat(IDENTITY_LIMIT + 1);
    let (session, _) = loopback_session(&long_id);
    let (b, b_ep) = loopback_session("222222222");
    b.start();

    let err = session.connect(b_ep, "222222222").await.unwrap_err();
    assert!(matches!(err, Error::ErrIdentityTooLong));

    b.close().await;
}

#[tokio::test]
async fn test_read_line_limits() -> Result<()> {
    let server_sock = std::net::UdpSocket::bind("127.0.0.1:0")?;
    server_sock.set_nonblocking(true)?;
    let server_addr = server_sock.local_addr()?;
    let server = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        Some(server_config()?),
        server_sock,
        Arc::new(quinn::TokioRuntime),
    )?;

    let client_sock = std::net::UdpSocket::bind("127.0.0.1:0")?;
    client_sock.set_nonblocking(true)?;
    let client = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        client_sock,
        Arc::new(quinn::TokioRuntime),
    )?;

    let dialed = client
        .connect_with(client_config()?, server_addr, "chute")?
        .await?;
    let accepted = server.accept().await.expect("endpoint closed").await?;

    // A line over the limit, never terminated.
    let (mut send, _recv) = dialed.open_bi().await?;
    send.write_all(&[b'a'; IDENTITY_LIMIT + 16]).await?;
    let (_reply, mut recv) = accepted.accept_bi().await?;
    assert!(matches!(
        read_line(&mut recv).await,
        Err(Error::ErrIdentityTooLong)
    ));

    // A terminated line inside the limit round-trips trimmed.
    let (mut send, _recv) = dialed.open_bi().await?;
    send.write_all(b"  123456789\n").await?;
    let (_reply, mut recv) = accepted.accept_bi().await?;
    assert_eq!(read_line(&mut recv).await?, "123456789");

    client.close(0u32.into(), b"done");
    server.close(0u32.into(), b"done");
    Ok(())
}

#[tokio::test]
async fn test_close_idempotent_and_on_close_once() -> Result<()> {
    let (a, _) = loopback_session("111111111");
    let (b, b_ep) = loopback_session("222222222");
    b.start();
    a.connect(b_ep, "222222222").await?;

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        a.set_on_close(Box::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));
    }

    a.close().await;
    a.close().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!a.is_connected().await);
    assert!(a.current_peer_id().await.is_empty());

    // The peer observes the loss and clears its own state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while b.is_connected().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!b.is_connected().await);
    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_send_after_close_fails() -> Result<()> {
    let (a, _) = loopback_session("111111111");
    let (b, b_ep) = loopback_session("222222222");
    b.start();
    a.connect(b_ep, "222222222").await?;

    a.close().await;
    let err = a.send(b"too late").await.unwrap_err();
    assert!(matches!(err, Error::ErrNoActiveSession));

    b.close().await;
    Ok(())
}

#[tokio::test]
async fn test_receive_queue_drops_newest() {
    let (a, _) = loopback_session("111111111");

    for i in 0..(RECEIVE_QUEUE_CAPACITY as u8 + 4) {
        // The read loop uses the same non-blocking send; overflow drops.
        let _ = a.receive_tx.try_send(vec![i]);
    }

    let msgs = a.drain_messages(50).await;
    assert_eq!(msgs.len(), RECEIVE_QUEUE_CAPACITY);
    assert_eq!(msgs.first(), Some(&vec![0u8]));
    assert_eq!(
        msgs.last(),
        Some(&vec![RECEIVE_QUEUE_CAPACITY as u8 - 1]),
        "overflow must drop the newest, not the oldest"
    );
}

#[tokio::test]
async fn test_drain_respects_cap() {
    let (a, _) = loopback_session("111111111");
    for i in 0..5u8 {
        let _ = a.receive_tx.try_send(vec![i]);
    }
    assert_eq!(a.drain_messages(3).await.len(), 3);
    assert_eq!(a.drain_messages(3).await.len(), 2);
}
