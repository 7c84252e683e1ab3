#![allow(dead_code)]

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// How the raw test server treats each request it parses.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Respond {
        status: u16,
        body: &'static str,
        delay: Duration,
    },
    /// Accepts and reads, never answers.
    Silent,
}

impl Behavior {
    pub fn ok(body: &'static str) -> Self {
        Behavior::Respond {
            status: 200,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Behavior::Respond {
            status,
            body: "",
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Behavior::Respond {
            status: 200,
            body: "hello world",
            delay,
        }
    }
}

/// What the raw server has seen across all of its sockets.
#[derive(Debug, Default)]
pub struct Received {
    /// Every request body, in arrival order.
    pub bodies: Vec<String>,
    /// Most requests any single socket had read but not yet answered.
    pub max_outstanding: usize,
}

pub struct TestServer {
    pub url: String,
    pub received: Arc<Mutex<Received>>,
}

impl TestServer {
    pub fn bodies(&self) -> Vec<String> {
        self.received.lock().unwrap().bodies.clone()
    }

    pub fn request_count(&self) -> usize {
        self.received.lock().unwrap().bodies.len()
    }

    pub fn max_outstanding(&self) -> usize {
        self.received.lock().unwrap().max_outstanding
    }
}

/// An HTTP/1.1 server built on `httparse` that understands pipelined
/// requests and answers them in order.
pub async fn raw_server(behavior: Behavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let received = Arc::new(Mutex::new(Received::default()));

    let accepted = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let received = accepted.clone();
            tokio::spawn(async move {
                let _ = serve(socket, behavior, received).await;
            });
        }
    });

    TestServer { url, received }
}

async fn serve<S: AsyncRead + AsyncWrite + Unpin>(
    mut socket: S,
    behavior: Behavior,
    received: Arc<Mutex<Received>>,
) -> std::io::Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);

        let mut parsed = Vec::new();
        while let Some((consumed, body)) = next_request(&pending) {
            pending.drain(..consumed);
            parsed.push(body);
        }
        {
            let mut received = received.lock().unwrap();
            received.max_outstanding = received.max_outstanding.max(parsed.len());
            received.bodies.extend(parsed.iter().cloned());
        }

        for _ in &parsed {
            if let Behavior::Respond { status, body, delay } = behavior {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let response = format!(
                    "HTTP/1.1 {} Test\r\nContent-Length: {}\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await?;
            }
        }
    }
}

/// The raw server on a Unix domain socket at `path`.
#[cfg(unix)]
pub async fn raw_unix_server(path: &std::path::Path, behavior: Behavior) -> TestServer {
    let _ = std::fs::remove_file(path);
    let listener = tokio::net::UnixListener::bind(path).unwrap();
    let received = Arc::new(Mutex::new(Received::default()));

    let accepted = received.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            let received = accepted.clone();
            tokio::spawn(async move {
                let _ = serve(socket, behavior, received).await;
            });
        }
    });

    TestServer {
        url: "http://localhost".to_string(),
        received,
    }
}

/// Length of the first complete request in `pending` and its body.
fn next_request(pending: &[u8]) -> Option<(usize, String)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    let head = match request.parse(pending) {
        Ok(httparse::Status::Complete(head)) => head,
        _ => return None,
    };

    let length = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    if pending.len() < head + length {
        return None;
    }

    let body = String::from_utf8_lossy(&pending[head..head + length]).into_owned();
    let mut consumed = head + length;
    if length > 0 && pending[consumed..].starts_with(b"\r\n") {
        consumed += 2;
    }
    Some((consumed, body))
}

/// A hyper server answering `200 hello world`.
pub async fn hello_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|_request: Request<Incoming>| async {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(
                        b"hello world",
                    ))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(socket), service)
                    .await;
            });
        }
    });

    url
}
