//! Shared test scaffolding: the loopback catcher service and a helper that
//! wires a fully-configured relay to it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;

use traffic_relay::config::{read_options, Document};
use traffic_relay::env::{substitute_vars, MapProvider};
use traffic_relay::plugin::{default_factories, load, PluginFactory};
use traffic_relay::relay::RelayEngine;
use traffic_relay::service::{KeepAliveListener, RelayService};

/// The page served by the catcher's index route.
pub const INDEX_HTML: &str = "<html><body>Catcher</body></html>";

/// The configuration the test relay runs with. Every option is populated
/// through variable substitution, so each end-to-end test also exercises
/// the environment provider, the substitution layer, and the document
/// parser.
const CONFIG_TEMPLATE: &str = "\
relay:
  port: ${RELAY_PORT:0}
  target: ${TRAFFIC_RELAY_TARGET}
  max-body-size: ${TRAFFIC_RELAY_MAX_BODY_SIZE}

cookies:
  TRAFFIC_RELAY_COOKIES: ${TRAFFIC_RELAY_COOKIES}

headers:
  override-origin: ${TRAFFIC_RELAY_ORIGIN_OVERRIDE}

paths:
  TRAFFIC_PATHS_MATCH: ${TRAFFIC_PATHS_MATCH}
  TRAFFIC_PATHS_REPLACEMENT: ${TRAFFIC_PATHS_REPLACEMENT}
  TRAFFIC_RELAY_SPECIALS: ${TRAFFIC_RELAY_SPECIALS}

content-blocker:
  TRAFFIC_EXCLUDE_BODY_CONTENT: ${TRAFFIC_EXCLUDE_BODY_CONTENT}
  TRAFFIC_MASK_BODY_CONTENT: ${TRAFFIC_MASK_BODY_CONTENT}
  TRAFFIC_EXCLUDE_HEADER_CONTENT: ${TRAFFIC_EXCLUDE_HEADER_CONTENT}
  TRAFFIC_MASK_HEADER_CONTENT: ${TRAFFIC_MASK_HEADER_CONTENT}
";

/// The last request the catcher received, as observed on the upstream side
/// of the relay.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

type LastRequest = Arc<Mutex<Option<CapturedRequest>>>;

/// A loopback HTTP + WebSocket server used to observe what reached the
/// upstream side of the relay. `/echo` echoes WebSocket messages back;
/// `/favicon.ico` answers 404; everything else captures the request and
/// answers with a fixed page.
pub struct Catcher {
    address: SocketAddr,
    last_request: LastRequest,
}

impl Catcher {
    pub async fn start() -> Catcher {
        let last_request: LastRequest = Arc::new(Mutex::new(None));

        let app = Router::new()
            .route("/echo", get(echo))
            .route(
                "/favicon.ico",
                any(|| async { (StatusCode::NOT_FOUND, "No favicon") }),
            )
            .fallback(any(capture))
            .with_state(last_request.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("catcher should bind");
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });

        Catcher {
            address,
            last_request,
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn last_request(&self) -> CapturedRequest {
        self.last_request
            .lock()
            .unwrap()
            .clone()
            .expect("no last request available")
    }
}

async fn capture(State(last_request): State<LastRequest>, request: Request<Body>) -> Response {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .unwrap_or_default();

    *last_request.lock().unwrap() = Some(CapturedRequest {
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: parts.headers,
        body: body.to_vec(),
    });

    Html(INDEX_HTML).into_response()
}

async fn echo(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(echo_loop)
}

async fn echo_loop(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(_) | Message::Binary(_) => {
                if socket.send(message).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

/// Starts a catcher and a relay pointed at it, configured through the YAML
/// template with the given variables. Extra (test-only) plugin factories
/// run after the default set.
pub async fn start_catcher_and_relay(
    env: &[(&str, &str)],
    extra_factories: Vec<Box<dyn PluginFactory>>,
) -> (Catcher, SocketAddr) {
    let catcher = Catcher::start().await;

    let mut variables: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    variables.insert("TRAFFIC_RELAY_TARGET".to_string(), catcher.http_url());

    let provider = MapProvider::new(variables);
    let source = substitute_vars(&provider, CONFIG_TEMPLATE);
    let document = Document::from_yaml_str(&source).expect("test config should parse");
    let options = read_options(&document).expect("test options should read");

    let mut factories = default_factories();
    factories.extend(extra_factories);
    let plugins = load(&factories, &document).expect("test plugins should load");

    let engine = RelayEngine::new(&options.relay).expect("engine should build");
    let service = RelayService::new(engine, plugins);

    let listener = KeepAliveListener::bind("127.0.0.1:0".parse().unwrap())
        .await
        .expect("relay should bind");
    let address = listener.local_addr().unwrap();
    tokio::spawn(service.serve(listener));

    (catcher, address)
}

/// A reqwest client that ignores ambient proxy settings and connection
/// pooling, so tests observe exactly one connection each.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
