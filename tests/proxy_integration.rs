//! End-to-end tests over plain HTTP: a stub upstream records what actually
//! reaches it while raw proxy requests are pushed through a bound
//! `ProxyServer`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use git_auth_proxy::config::{Config, MismatchPolicy};
use git_auth_proxy::gate::DecisionContext;
use git_auth_proxy::proxy::tls::TlsHandler;
use git_auth_proxy::proxy::ProxyServer;

/// What the stub upstream observed: one (path, authorization) pair per
/// request that actually reached it.
type Observed = Arc<Mutex<Vec<(String, Option<String>)>>>;

async fn spawn_upstream() -> (SocketAddr, Observed) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let observed: Observed = Arc::new(Mutex::new(Vec::new()));

    let recorded = observed.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = recorded.clone();
                    async move {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(String::from);
                        recorded
                            .lock()
                            .unwrap()
                            .push((req.uri().path().to_string(), auth));
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("upstream ok"))))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, observed)
}

async fn spawn_proxy(config: &Config) -> (SocketAddr, broadcast::Sender<()>) {
    let gate = Arc::new(DecisionContext::from_config(config).expect("decision context"));
    let ca_dir = tempfile::tempdir().expect("tempdir");
    let tls = Arc::new(
        TlsHandler::new(
            Some(ca_dir.path().join("ca.crt")),
            Some(ca_dir.path().join("ca.key")),
        )
        .expect("tls handler"),
    );

    let proxy = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), gate, tls)
        .await
        .expect("bind proxy");
    let addr = proxy.local_addr().expect("proxy addr");

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = proxy.run(shutdown_rx).await;
    });

    (addr, shutdown_tx)
}

fn config(upstream: SocketAddr, policy: MismatchPolicy) -> Config {
    Config {
        port: 0,
        health_port: 1,
        host: "127.0.0.1".into(),
        anonymous: false,
        repository_url: format!("http://127.0.0.1:{}/group/project.git", upstream.port()),
        token: Some("sekrit".into()),
        policy,
        ca_cert_path: None,
        ca_key_path: None,
    }
}

/// Issue an absolute-form GET through the proxy and return the raw response.
/// The Host header deliberately lies; the gate must only trust the request
/// line.
async fn proxy_get(proxy: SocketAddr, url: &str) -> String {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    let request =
        format!("GET {url} HTTP/1.1\r\nHost: evil.example.com\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("send request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.expect("read response");
    String::from_utf8_lossy(&response).into_owned()
}

/// Raw TCP stub for tunnel tests: answers `ping\n` with `pong\n` and counts
/// accepted connections.
async fn spawn_tcp_stub() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = [0u8; 5];
                if stream.read_exact(&mut buf).await.is_ok() && &buf == b"ping\n" {
                    let _ = stream.write_all(b"pong\n").await;
                }
            });
        }
    });

    (addr, connections)
}

/// Send a CONNECT for `authority` and read the reply head up to the blank
/// line. On a 2xx reply the returned stream is the open tunnel.
async fn proxy_connect(proxy: SocketAddr, authority: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.expect("connect proxy");
    let request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n");
    stream.write_all(request.as_bytes()).await.expect("send CONNECT");

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("read CONNECT reply");
        head.extend_from_slice(&byte);
    }
    (stream, String::from_utf8_lossy(&head).into_owned())
}

#[tokio::test]
async fn matching_request_gets_credential_and_reaches_upstream() {
    let (upstream, observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;

    let url = format!(
        "http://127.0.0.1:{}/group/project.git/info/refs?service=git-upload-pack",
        upstream.port()
    );
    let response = proxy_get(proxy, &url).await;

    assert!(response.contains("200 OK"), "response was: {response}");
    assert!(response.contains("upstream ok"), "response was: {response}");

    let seen = observed.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "/group/project.git/info/refs");
    let expected = format!("Basic {}", BASE64.encode("oauth2:sekrit"));
    assert_eq!(seen[0].1.as_deref(), Some(expected.as_str()));
}

#[tokio::test]
async fn restrictive_mismatch_is_denied_and_upstream_untouched() {
    let (upstream, observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;

    let url = format!("http://127.0.0.1:{}/other/project.git/info/refs", upstream.port());
    let response = proxy_get(proxy, &url).await;

    assert!(response.contains("200 OK"), "response was: {response}");
    assert!(
        response.contains("This proxy does not allow you to access"),
        "response was: {response}"
    );
    assert!(observed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn restrictive_mismatched_host_is_never_dialed() {
    let (upstream, _observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;

    // A host with nothing listening: if the proxy tried to contact it the
    // response would be a 502, not the explanatory denial.
    let response = proxy_get(proxy, "http://127.0.0.1:9/group/project.git/info/refs").await;

    assert!(response.contains("200 OK"), "response was: {response}");
    assert!(
        response.contains("This proxy does not allow you to access"),
        "response was: {response}"
    );
}

#[tokio::test]
async fn permissive_mismatch_is_forwarded_without_credential() {
    let (upstream, observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Permissive)).await;

    let url = format!("http://127.0.0.1:{}/other/project.git/info/refs", upstream.port());
    let response = proxy_get(proxy, &url).await;

    assert!(response.contains("200 OK"), "response was: {response}");
    assert!(response.contains("upstream ok"), "response was: {response}");

    let seen = observed.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "/other/project.git/info/refs");
    assert_eq!(seen[0].1, None, "no credential may leak on a mismatch");
}

#[tokio::test]
async fn anonymous_session_forwards_without_credential_even_on_match() {
    let (upstream, observed) = spawn_upstream().await;
    let mut cfg = config(upstream, MismatchPolicy::Restrictive);
    cfg.anonymous = true;
    cfg.token = None;
    let (proxy, _shutdown) = spawn_proxy(&cfg).await;

    let url = format!(
        "http://127.0.0.1:{}/group/project.git/info/refs",
        upstream.port()
    );
    let response = proxy_get(proxy, &url).await;

    assert!(response.contains("upstream ok"), "response was: {response}");
    let seen = observed.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, None);
}

#[tokio::test]
async fn sibling_path_does_not_receive_credential() {
    let (upstream, observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Permissive)).await;

    let url = format!(
        "http://127.0.0.1:{}/group/project.git-mirror/info/refs",
        upstream.port()
    );
    proxy_get(proxy, &url).await;

    let seen = observed.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].1, None);
}

#[tokio::test]
async fn restrictive_connect_to_unrelated_host_is_refused_and_never_dialed() {
    let (upstream, _observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;
    let (stub, connections) = spawn_tcp_stub().await;

    let authority = format!("127.0.0.1:{}", stub.port());
    let (mut stream, head) = proxy_connect(proxy, &authority).await;
    assert!(head.contains("403"), "reply was: {head}");

    // The denial body is a single line.
    let mut body = Vec::new();
    let mut byte = [0u8; 1];
    while !body.ends_with(b"\n") {
        stream.read_exact(&mut byte).await.expect("read denial body");
        body.extend_from_slice(&byte);
    }
    let body = String::from_utf8_lossy(&body);
    assert!(
        body.contains("This proxy does not allow you to access"),
        "body was: {body}"
    );
    assert!(
        body.contains(&format!("https://127.0.0.1:{}", stub.port())),
        "body was: {body}"
    );
    assert_eq!(connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn permissive_connect_tunnels_unrelated_hosts_untouched() {
    let (upstream, _observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Permissive)).await;
    let (stub, connections) = spawn_tcp_stub().await;

    let authority = format!("127.0.0.1:{}", stub.port());
    let (mut stream, head) = proxy_connect(proxy, &authority).await;
    assert!(head.contains("200"), "reply was: {head}");

    stream.write_all(b"ping\n").await.expect("write through tunnel");
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await.expect("read through tunnel");
    assert_eq!(&reply, b"pong\n");
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn anonymous_connect_tunnels_everything_even_in_restrictive_mode() {
    let (upstream, _observed) = spawn_upstream().await;
    let mut cfg = config(upstream, MismatchPolicy::Restrictive);
    cfg.anonymous = true;
    cfg.token = None;
    let (proxy, _shutdown) = spawn_proxy(&cfg).await;
    let (stub, connections) = spawn_tcp_stub().await;

    let authority = format!("127.0.0.1:{}", stub.port());
    let (mut stream, head) = proxy_connect(proxy, &authority).await;
    assert!(head.contains("200"), "reply was: {head}");

    stream.write_all(b"ping\n").await.expect("write through tunnel");
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).await.expect("read through tunnel");
    assert_eq!(&reply, b"pong\n");
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn proxy_keeps_serving_after_clients_abort() {
    let (upstream, observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;

    // Clients that connect and reset without ever sending a request.
    for _ in 0..3 {
        let stream = TcpStream::connect(proxy).await.expect("connect proxy");
        stream
            .set_linger(Some(std::time::Duration::ZERO))
            .expect("set linger");
        drop(stream);
    }

    let url = format!(
        "http://127.0.0.1:{}/group/project.git/info/refs",
        upstream.port()
    );
    let response = proxy_get(proxy, &url).await;
    assert!(response.contains("upstream ok"), "response was: {response}");
    assert_eq!(observed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn direct_origin_form_request_is_refused() {
    let (upstream, _observed) = spawn_upstream().await;
    let (proxy, _shutdown) = spawn_proxy(&config(upstream, MismatchPolicy::Restrictive)).await;

    let response = proxy_get(proxy, "/group/project.git/info/refs").await;
    assert!(response.contains("400"), "response was: {response}");
}
