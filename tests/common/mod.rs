#![allow(dead_code)]

use gantry::{Builder, Inject, InstantiateErrorKind};
use http::{Request, Response};
use std::{
    convert::Infallible,
    future::{ready, Ready},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};
use tonic::{body::BoxBody, server::NamedService};
use tower_service::Service;

pub struct Settings {
    pub greeting: String,
}

/// Service implementation resolved from the container
pub struct Echo {
    pub settings: Arc<Settings>,
    pub calls: AtomicUsize,
}

impl Echo {
    pub fn factory(Inject(settings): Inject<Settings>) -> Result<Self, InstantiateErrorKind> {
        Ok(Self {
            settings,
            calls: AtomicUsize::new(0),
        })
    }
}

/// Minimal gRPC server for [`Echo`] answering every call with a trailers-only OK response
/// that carries the configured greeting in a header.
#[derive(Clone)]
pub struct EchoServer {
    inner: Arc<Echo>,
}

impl EchoServer {
    pub fn from_arc(inner: Arc<Echo>) -> Self {
        Self { inner }
    }
}

impl NamedService for EchoServer {
    const NAME: &'static str = "test.Echo";
}

impl<B> Service<Request<B>> for EchoServer {
    type Response = Response<BoxBody>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _request: Request<B>) -> Self::Future {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);

        let response = Response::builder()
            .header("content-type", "application/grpc")
            .header("grpc-status", "0")
            .header("x-greeting", self.inner.settings.greeting.as_str())
            .body(tonic::body::empty_body())
            .unwrap();
        ready(Ok(response))
    }
}

pub fn localhost() -> Builder {
    Builder::new().host(IpAddr::V4(Ipv4Addr::LOCALHOST)).grpc_port(0).http_port(0)
}

/// Sends a raw HTTP/1.1 request and reads the response until the server closes the connection
pub async fn http_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

pub async fn get(addr: SocketAddr, path: &str) -> String {
    get_with_headers(addr, path, "").await
}

/// Each header in `headers` ends with `\r\n`
pub async fn get_with_headers(addr: SocketAddr, path: &str, headers: &str) -> String {
    http_request(
        addr,
        format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{headers}Connection: close\r\n\r\n").as_bytes(),
    )
    .await
}

/// Calls `path` with an empty message framed for `content_type`
pub async fn call(addr: SocketAddr, path: &str, content_type: &str, headers: &str) -> String {
    let mut request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: {content_type}\r\nContent-Length: 5\r\n{headers}Connection: close\r\n\r\n"
    )
    .into_bytes();
    request.extend_from_slice(&[0, 0, 0, 0, 0]);

    http_request(addr, &request).await
}
