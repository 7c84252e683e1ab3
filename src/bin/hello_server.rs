use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Target server for trying volley out: answers every request with
/// `200 hello world`, optionally after a fixed delay.
///
/// Usage: hello_server [port] [delay_ms]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hello_server=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|p| p.parse().ok()).unwrap_or(3000);
    let delay = Duration::from_millis(args.next().and_then(|d| d.parse().ok()).unwrap_or(0));

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    info!("Hello server listening on port {} with {:?} delay", port, delay);

    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("New connection from {}", peer);
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| hello(request, delay));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(socket), service)
                .await
            {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn hello(
    _request: Request<Incoming>,
    delay: Duration,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    Ok(Response::new(Full::new(Bytes::from_static(b"hello world"))))
}
