//! The relay's HTTP service.
//!
//! # Responsibilities
//! - Accept keep-alive-enabled connections
//! - Serve the monitoring page
//! - Dispatch every other request through the plugin chain and the engine

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::net::{TcpListener, TcpStream};
use tower_http::trace::TraceLayer;

use crate::plugin::Plugin;
use crate::relay::RelayEngine;

/// Path of the monitoring page.
pub const MONITOR_PATH: &str = "/__relay__up__/";

struct RelayState {
    engine: RelayEngine,
    plugins: Vec<Box<dyn Plugin>>,
}

/// The relay service: monitoring page plus the traffic pipeline.
pub struct RelayService {
    router: Router,
}

impl RelayService {
    pub fn new(engine: RelayEngine, plugins: Vec<Box<dyn Plugin>>) -> Self {
        let state = Arc::new(RelayState { engine, plugins });

        let router = Router::new()
            .route(MONITOR_PATH, any(monitor))
            .fallback(dispatch)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        Self { router }
    }

    /// Serves connections from the listener until ctrl-c. In-flight
    /// requests are allowed to complete.
    pub async fn serve(self, listener: KeepAliveListener) -> std::io::Result<()> {
        let address = listener.local_addr()?;
        tracing::info!(%address, "relay listening");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<RemoteAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("relay stopped");
        Ok(())
    }
}

/// A simple page for monitoring.
async fn monitor() -> Html<&'static str> {
    Html("<html><body>Up</body></html>")
}

/// Runs a request through the plugin chain, then the forwarding engine.
/// The first response produced wins; if nothing services the request the
/// client gets a 404.
#[axum::debug_handler]
async fn dispatch(State(state): State<Arc<RelayState>>, mut request: Request<Body>) -> Response {
    let method = request.method().clone();
    let url = request.uri().clone();

    let mut info = state.engine.prepare(&mut request);

    let mut response = None;
    for plugin in &state.plugins {
        if let Some(plugin_response) = plugin.handle_request(&mut request, &info).await {
            if !info.serviced {
                info.serviced = true;
                response = Some(plugin_response);
            }
            // A response produced after the request was serviced is dropped;
            // `serviced` never goes back to false.
        }
    }

    if let Some(engine_response) = state.engine.forward(request, &info).await {
        if !info.serviced {
            info.serviced = true;
            response = Some(engine_response);
        }
    }

    match response {
        Some(response) => {
            tracing::debug!(%method, %url, "serviced");
            response
        }
        None => {
            tracing::debug!(%method, %url, "not serviced");
            (StatusCode::NOT_FOUND, "404 page not found").into_response()
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to install ctrl-c handler");
    }
    tracing::info!("shutdown signal received");
}

/// A TCP listener that enables a 30-second keepalive on every accepted
/// connection.
pub struct KeepAliveListener {
    inner: TcpListener,
}

impl KeepAliveListener {
    pub async fn bind(address: SocketAddr) -> std::io::Result<Self> {
        Ok(Self {
            inner: TcpListener::bind(address).await?,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// The connect-info type extracted for connections accepted through
/// [`KeepAliveListener`]. A local newtype is required because `axum`'s
/// blanket `Connected` implementation only covers its own `TcpListener`.
#[derive(Debug, Clone, Copy)]
pub struct RemoteAddr(pub SocketAddr);

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, KeepAliveListener>>
    for RemoteAddr
{
    fn connect_info(target: axum::serve::IncomingStream<'_, KeepAliveListener>) -> Self {
        RemoteAddr(*target.remote_addr())
    }
}

impl axum::serve::Listener for KeepAliveListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (TcpStream, SocketAddr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, address)) => {
                    let keepalive =
                        socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
                    if let Err(error) =
                        socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)
                    {
                        tracing::warn!(%error, "could not enable TCP keepalive");
                    }
                    return (stream, address);
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}
