use super::*;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Mutex as TestMutex;
use std::time::Instant;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};

struct LookupMock {
    // statuses served in order; when exhausted, serves the info body
    script: Vec<u16>,
    info: IceInfo,
}

async fn handle(
    mock: Arc<TestMutex<LookupMock>>,
    req: Request<Body>,
) -> std::result::Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_owned();
    let _ = hyper::body::to_bytes(req.into_body()).await?;
    let mut mock = mock.lock().unwrap();
    let resp = match path.as_str() {
        "/lookup" => {
            if mock.script.is_empty() {
                Response::new(Body::from(serde_json::to_vec(&mock.info).unwrap()))
            } else {
                let status = mock.script.remove(0);
                let mut resp = Response::new(Body::empty());
                *resp.status_mut() = hyper::StatusCode::from_u16(status).unwrap();
                resp
            }
        }
        "/health" => Response::new(Body::empty()),
        _ => {
            let mut resp = Response::new(Body::empty());
            *resp.status_mut() = hyper::StatusCode::NOT_FOUND;
            resp
        }
    };
    Ok(resp)
}

async fn spawn_lookup_mock(script: Vec<u16>) -> SocketAddr {
    let mock = Arc::new(TestMutex::new(LookupMock {
        script,
        info: IceInfo {
            id: "222222222".to_owned(),
            ufrag: "ufrag".to_owned(),
            password: "password".to_owned(),
            candidates: vec!["1299692247 1 udp 2122134271 127.0.0.1 54321 typ host".to_owned()],
        },
    }));
    let make_svc = make_service_fn(move |_| {
        let mock = Arc::clone(&mock);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&mock), req))) }
    });
    let server = Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn test_lookup_poll_rate_limit_backoff() -> Result<()> {
    let addr = spawn_lookup_mock(vec![429, 429]).await;
    let rendezvous = RendezvousClient::new(&addr.to_string());

    let started = Instant::now();
    let info = wait_for_ice_info(
        &rendezvous,
        "222222222",
        "111111111",
        Duration::from_secs(30),
    )
    .await?;
    let elapsed = started.elapsed();

    assert_eq!(info.id, "222222222");
    // Two rate-limited responses force at least two 3-second back-offs.
    assert!(
        elapsed >= Duration::from_secs(6),
        "back-off too short: {elapsed:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_lookup_poll_declined_aborts() {
    let addr = spawn_lookup_mock(vec![403]).await;
    let rendezvous = RendezvousClient::new(&addr.to_string());

    let started = Instant::now();
    let err = wait_for_ice_info(
        &rendezvous,
        "222222222",
        "111111111",
        Duration::from_secs(30),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ErrDeclined));
    // A decline aborts immediately instead of burning the poll budget.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_lookup_poll_not_found_until_timeout() {
    let addr = spawn_lookup_mock(vec![404, 404, 404, 404, 404, 404, 404, 404]).await;
    let rendezvous = RendezvousClient::new(&addr.to_string());

    let err = wait_for_ice_info(
        &rendezvous,
        "222222222",
        "111111111",
        Duration::from_secs(3),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::ErrLookupTimeout(ref id) if id == "222222222"));
}

#[tokio::test]
async fn test_lookup_poll_misses_then_hit() -> Result<()> {
    let addr = spawn_lookup_mock(vec![404, 404]).await;
    let rendezvous = RendezvousClient::new(&addr.to_string());

    let info = wait_for_ice_info(
        &rendezvous,
        "222222222",
        "111111111",
        Duration::from_secs(30),
    )
    .await?;
    assert_eq!(info.id, "222222222");
    Ok(())
}

#[tokio::test]
async fn test_connect_rejects_empty_target() {
    let manager = ConnectionManager::new("111111111", "127.0.0.1:1");
    let err = manager.connect("").await.unwrap_err();
    assert!(matches!(err, Error::ErrMissingTargetId));
}

#[tokio::test]
async fn test_connect_with_peer_info_rejects_empty_id() {
    let manager = ConnectionManager::new("111111111", "127.0.0.1:1");
    let err = manager
        .connect_with_peer_info(IceInfo {
            id: String::new(),
            ufrag: "u".to_owned(),
            password: "p".to_owned(),
            candidates: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ErrMissingPeerId));
}

#[tokio::test]
async fn test_health_snapshot() {
    let manager = ConnectionManager::new("111111111", "127.0.0.1:1");
    assert_eq!(manager.rendezvous_health(), (false, false));

    manager.set_rendezvous_health(true);
    assert_eq!(manager.rendezvous_health(), (true, true));

    manager.set_rendezvous_health(false);
    assert_eq!(manager.rendezvous_health(), (false, true));
}

#[tokio::test]
async fn test_check_health_against_mock() {
    let addr = spawn_lookup_mock(vec![]).await;
    let manager = ConnectionManager::new("111111111", &addr.to_string());
    manager.check_rendezvous_health().await;
    assert_eq!(manager.rendezvous_health(), (true, true));
}
