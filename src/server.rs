use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{DefaultBodyLimit, Request, State, WebSocketUpgrade};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};

use crate::bus::{ACTIVITY_CHANNEL, DEBUG_CHANNEL, ObserverBus, PROMPT_CHANNEL};
use crate::client::{LlmClient, UpstreamClient};
use crate::config::Config;
use crate::detector::Detector;
use crate::monitor::ActivityMonitor;
use crate::sandbox::PathSandbox;
use crate::tool::ToolChannel;
use crate::{files, inference};

// Server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub llm: LlmClient,
    pub upstream: UpstreamClient,
    pub detector: Arc<Detector>,
    pub tools: Arc<ToolChannel>,
    pub bus: ObserverBus,
    pub monitor: ActivityMonitor,
    pub sandbox: Arc<PathSandbox>,
    scrubbing: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(config: Config) -> crate::error::Result<Self> {
        let config = Arc::new(config);
        let bus = ObserverBus::new();
        let monitor = ActivityMonitor::new(bus.clone(), true);
        let llm = LlmClient::new(&config.llm);
        let upstream = UpstreamClient::new(&config.upstream);
        let detector = Arc::new(Detector::new(Arc::new(llm.clone()), monitor.clone()));
        let tools = Arc::new(ToolChannel::for_current_exe()?);
        let sandbox = Arc::new(PathSandbox::new(&config.scrub.data_path)?);

        Ok(Self {
            config,
            llm,
            upstream,
            detector,
            tools,
            bus,
            monitor,
            sandbox,
            // Scrubbing is on until someone turns it off.
            scrubbing: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Replace the tool channel, e.g. to spawn a specific binary instead
    /// of this executable.
    pub fn with_tools(mut self, tools: Arc<ToolChannel>) -> Self {
        self.tools = tools;
        self
    }

    pub fn scrubbing_enabled(&self) -> bool {
        self.scrubbing.load(Ordering::Relaxed)
    }

    pub fn set_scrubbing(&self, enabled: bool) {
        self.scrubbing.store(enabled, Ordering::Relaxed);
    }
}

pub fn router(state: AppState) -> Router {
    // Create CORS middleware
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/v1/chat/completions", post(inference::chat_completions))
        .route("/v1/models", get(inference::list_models))
        .route("/v1/mode", get(get_mode).post(set_mode))
        .route("/api/v1/files", post(files::upload))
        .route("/api/v1/files/download/{job_id}", get(files::download))
        .route("/ws/prompts", get(prompt_stream))
        .route("/ws/activity", get(activity_stream))
        .route("/ws/debug", get(debug_stream))
        .route("/health", get(health))
        .route("/api/config", get(frontend_config))
        .layer(DefaultBodyLimit::max(
            state.config.scrub.file_limit() + 64 * 1024,
        ))
        .layer(cors);

    if state.config.dev_mode {
        router = router.layer(middleware::from_fn_with_state(
            state.clone(),
            trace_middleware,
        ));
    }

    router.with_state(state)
}

pub async fn start_server(config: Config) -> anyhow::Result<()> {
    let address = format!("{}:{}", config.server.address, config.server.port);
    let state = AppState::new(config)?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Server started successfully on {address}");
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct ModeBody {
    scrubbing: bool,
}

async fn get_mode(State(state): State<AppState>) -> Json<ModeBody> {
    Json(ModeBody {
        scrubbing: state.scrubbing_enabled(),
    })
}

async fn set_mode(State(state): State<AppState>, Json(body): Json<ModeBody>) -> Json<ModeBody> {
    state.set_scrubbing(body.scrubbing);
    info!("Scrubbing mode set to: {}", body.scrubbing);
    Json(ModeBody {
        scrubbing: state.scrubbing_enabled(),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let llm_ok = state.llm.healthy().await;
    let upstream_ok = state.upstream.healthy().await;
    let all_ok = llm_ok && upstream_ok;

    Json(json!({
        "status": if all_ok { "ok" } else { "degraded" },
        "services": {
            "llm": if llm_ok { "ok" } else { "unavailable" },
            "openwebui": if upstream_ok { "ok" } else { "unavailable" },
        },
    }))
}

async fn frontend_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "dev_mode": state.config.dev_mode }))
}

async fn prompt_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| pump(socket, state.bus.clone(), PROMPT_CHANNEL))
}

async fn activity_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| pump(socket, state.bus.clone(), ACTIVITY_CHANNEL))
}

async fn debug_stream(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.config.dev_mode {
        return ws.on_upgrade(|mut socket| async move {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4000,
                    reason: "Debug mode not enabled".into(),
                })))
                .await;
        });
    }

    ws.on_upgrade(move |socket| pump(socket, state.bus.clone(), DEBUG_CHANNEL))
}

/// Thin pump from a bus channel to an observer socket: subscribe on
/// upgrade, forward every message, unsubscribe when the socket goes away.
async fn pump(mut socket: WebSocket, bus: ObserverBus, channel: &'static str) {
    let mut rx = bus.subscribe(channel).await;
    info!("Observer connected to {channel}");

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(message) => {
                    if socket.send(Message::Text(message.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    warn!("Observer on {channel} lagged, dropped {count} events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                // Observers are read-only; ignore anything they send.
                Some(Ok(_)) => {}
            },
        }
    }

    info!("Observer disconnected from {channel}");
}

/// Dev-mode middleware: bracket every request with trace events on the
/// debug channel.
async fn trace_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let trace_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    state
        .bus
        .publish(
            DEBUG_CHANNEL,
            &json!({
                "trace_id": trace_id,
                "stage": "request_start",
                "method": method,
                "path": path,
            }),
        )
        .await;

    let response = next.run(request).await;

    state
        .bus
        .publish(
            DEBUG_CHANNEL,
            &json!({
                "trace_id": trace_id,
                "stage": "request_end",
                "method": method,
                "path": path,
                "status": response.status().as_u16(),
            }),
        )
        .await;

    response
}
