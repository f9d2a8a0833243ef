//! The interception engine: accepts proxy connections, tunnels or terminates
//! TLS, and runs every outbound request through the gate before it is sent
//! upstream.
//!
//! Plain-HTTP proxy requests (absolute-form) are gated and forwarded
//! directly. CONNECT requests to the repository endpoint are intercepted
//! with an on-the-fly certificate so the inner requests can be gated
//! per-path; CONNECT to anything else is blindly tunneled or denied,
//! depending on the mismatch policy.

pub mod tls;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::{HeaderName, CONTENT_TYPE};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, trace};

use crate::config::MismatchPolicy;
use crate::error::{is_benign_disconnect, Result, TransportError};
use crate::gate::{denial_message, Decision, DecisionContext, RequestTarget, Scheme};
use tls::TlsHandler;

type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;
type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct ProxyServer {
    listener: TcpListener,
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    gate: Arc<DecisionContext>,
    tls: Arc<TlsHandler>,
    /// Shared upstream client. Redirects stay disabled; git clients follow
    /// them on their own and a silent redirect could carry the credential to
    /// a host the gate never approved.
    client: reqwest::Client,
}

impl ProxyServer {
    pub async fn bind(
        addr: SocketAddr,
        gate: Arc<DecisionContext>,
        tls: Arc<TlsHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(TransportError::Upstream)?;
        Ok(Self {
            listener,
            inner: Arc::new(ProxyInner { gate, tls, client }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    // Accept failures (an aborted handshake, fd exhaustion)
                    // are local to that connection attempt; the listener
                    // stays up.
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            if is_benign_disconnect(&e) {
                                trace!(error = %e, "client disconnected during accept");
                            } else {
                                error!(error = %e, "failed to accept connection");
                            }
                            continue;
                        }
                    };
                    let inner = self.inner.clone();
                    tokio::spawn(async move {
                        inner.serve_client(stream, peer).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("Proxy server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

impl ProxyInner {
    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let inner = self.clone();
        let service = service_fn(move |req| {
            let inner = inner.clone();
            async move { inner.handle(req).await }
        });

        let result = hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await;

        if let Err(e) = result {
            if is_benign_disconnect(&e) {
                trace!(peer = %peer, "client disconnected");
            } else {
                error!(peer = %peer, error = %e, "connection error");
            }
        }
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> std::result::Result<Response<ProxyBody>, Infallible> {
        if req.method() == Method::CONNECT {
            return Ok(self.handle_connect(req));
        }

        // A plain-HTTP proxy request carries the full destination in its
        // request line; origin-form means someone pointed a browser straight
        // at the proxy port.
        let uri = req.uri().clone();
        let (host, port) = match (uri.host(), uri.scheme_str()) {
            (Some(host), Some("http")) => (host.to_string(), uri.port_u16().unwrap_or(80)),
            _ => {
                return Ok(text_response(
                    StatusCode::BAD_REQUEST,
                    "This is a proxy; it only serves proxy requests\n",
                ))
            }
        };
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let target = RequestTarget::new(Scheme::Http, &host, port, &path);

        Ok(self.forward(target, req).await)
    }

    fn handle_connect(self: Arc<Self>, req: Request<Incoming>) -> Response<ProxyBody> {
        let authority = match req.uri().authority() {
            Some(authority) => authority.clone(),
            None => {
                return text_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority\n")
            }
        };
        let host = authority.host().to_ascii_lowercase();
        let port = authority.port_u16().unwrap_or(443);

        // Only the repository endpoint is worth eavesdropping on; in
        // anonymous mode nothing is, and every tunnel is passed through.
        let intercept = !self.gate.anonymous() && self.gate.is_target_endpoint(&host, port);

        if !intercept
            && !self.gate.anonymous()
            && self.gate.policy() == MismatchPolicy::Restrictive
        {
            // A 2xx answer to CONNECT means the tunnel is open, so the
            // refusal has to be an error status for the body to survive.
            let url = format!("https://{host}:{port}");
            info!(url = %url, "destination does not match repository, refusing tunnel");
            return text_response(StatusCode::FORBIDDEN, &denial_message(&url));
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    if is_benign_disconnect(&e) {
                        trace!(host = %host, "client abandoned tunnel before upgrade");
                    } else {
                        error!(host = %host, error = %e, "tunnel upgrade failed");
                    }
                    return;
                }
            };

            let io = TokioIo::new(upgraded);
            let result = if intercept {
                inner.intercept_tls(io, host.clone(), port).await
            } else {
                inner.tunnel(io, &host, port).await
            };

            if let Err(e) = result {
                if is_benign_disconnect(e.as_ref()) {
                    trace!(host = %host, "peer closed tunnel");
                } else {
                    error!(host = %host, port = port, error = %e, "tunnel error");
                }
            }
        });

        // 200 releases the client into the tunnel; the spawned task takes
        // over once hyper completes the upgrade.
        Response::new(empty_body())
    }

    /// Blind byte-for-byte relay for destinations the gate has no interest
    /// in. Nothing is observed or modified.
    async fn tunnel(
        &self,
        mut client: TokioIo<Upgraded>,
        host: &str,
        port: u16,
    ) -> std::result::Result<(), BoxError> {
        let mut upstream = TcpStream::connect((host, port)).await?;
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        Ok(())
    }

    /// Terminate TLS with a minted certificate and gate each request inside
    /// the tunnel individually. Scheme, host and port come from the CONNECT
    /// authority the engine actually dialed, not from any header.
    async fn intercept_tls(
        self: Arc<Self>,
        io: TokioIo<Upgraded>,
        host: String,
        port: u16,
    ) -> std::result::Result<(), BoxError> {
        let server_config = self.tls.server_config(&host)?;
        let acceptor = TlsAcceptor::from(server_config);
        let tls_stream = acceptor.accept(io).await?;

        let inner = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let inner = inner.clone();
            let host = host.clone();
            async move {
                let path = req
                    .uri()
                    .path_and_query()
                    .map(|pq| pq.as_str())
                    .unwrap_or("/")
                    .to_string();
                let target = RequestTarget::new(Scheme::Https, &host, port, &path);
                Ok::<_, Infallible>(inner.forward(target, req).await)
            }
        });

        hyper::server::conn::http1::Builder::new()
            .serve_connection(TokioIo::new(tls_stream), service)
            .await?;
        Ok(())
    }

    /// Gate one request and forward it upstream, streaming both bodies.
    async fn forward(&self, target: RequestTarget, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let decision = self.gate.apply(&target, &mut parts.headers);
        if decision == Decision::Reject {
            return text_response(StatusCode::OK, &denial_message(&target.url()));
        }

        match self.send_upstream(&target, parts, body).await {
            Ok(response) => response,
            Err(e) => {
                error!(url = %target, error = %e, "upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, "upstream request failed\n")
            }
        }
    }

    async fn send_upstream(
        &self,
        target: &RequestTarget,
        parts: http::request::Parts,
        body: Incoming,
    ) -> std::result::Result<Response<ProxyBody>, TransportError> {
        let url = target.url();
        let mut builder = self.client.request(parts.method, url.as_str());
        for (name, value) in parts.headers.iter() {
            if skip_when_forwarding(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let body_stream =
            BodyStream::new(body).try_filter_map(|frame| async move { Ok(frame.into_data().ok()) });
        let response = builder
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await?;

        let mut reply = Response::builder().status(response.status());
        for (name, value) in response.headers().iter() {
            if skip_when_forwarding(name) {
                continue;
            }
            reply = reply.header(name, value);
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(Frame::data).map_err(io::Error::other));
        let reply = reply
            .body(StreamBody::new(stream).boxed_unsync())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        Ok(reply)
    }
}

/// Hop-by-hop headers plus Host, which reqwest derives from the URL; the
/// forwarded request and reply are re-framed by the respective clients.
fn skip_when_forwarding(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .expect("static response construction cannot fail")
}

fn empty_body() -> ProxyBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}
