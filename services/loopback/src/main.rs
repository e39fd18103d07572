//! Development backend speaking both channel protocols over WebSocket.

mod config;
mod generation;
mod recognition;

use crate::config::Config;
use crate::generation::{Step, script};
use crate::recognition::Transcriber;
use anyhow::Context;
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use duplex_voice_types::events::generation::GenerationErrorEvent;
use duplex_voice_types::{GenerationClientEvent, GenerationServerEvent, RecognitionClientEvent};
use futures_util::{Sink, SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

async fn send_json<S, T>(sink: &mut S, event: &T) -> anyhow::Result<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    T: serde::Serialize,
{
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Text payload of a frame, or `None` when the peer is done.
fn text_of(msg: Result<Message, axum::Error>) -> Option<Option<String>> {
    match msg {
        Ok(Message::Text(text)) => Some(Some(text.as_str().to_string())),
        Ok(Message::Close(_)) => None,
        Ok(_) => Some(None),
        Err(e) => {
            info!("websocket error: {}", e);
            None
        }
    }
}

async fn recognition_ws(ws: WebSocketUpgrade) -> Response {
    info!("recognition upgrade request received");
    ws.on_upgrade(recognition_socket)
}

async fn recognition_socket(mut socket: WebSocket) {
    info!("recognition connection established");
    let mut transcriber = Transcriber::default();

    while let Some(msg) = socket.recv().await {
        let Some(frame) = text_of(msg) else {
            break;
        };
        let Some(text) = frame else {
            continue;
        };
        let event = match serde_json::from_str::<RecognitionClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("unrecognized recognition message: {}", e);
                continue;
            }
        };
        for reply in transcriber.handle(event) {
            if let Err(e) = send_json(&mut socket, &reply).await {
                info!("recognition client went away: {}", e);
                return;
            }
        }
    }
    info!("recognition connection closed");
}

async fn generation_ws(ws: WebSocketUpgrade, State(pace): State<Duration>) -> Response {
    info!("generation upgrade request received");
    ws.on_upgrade(move |socket| generation_socket(socket, pace))
}

async fn play(steps: Vec<Step>, tx: mpsc::Sender<GenerationServerEvent>) {
    for step in steps {
        tokio::time::sleep(step.delay).await;
        if tx.send(step.event).await.is_err() {
            return;
        }
    }
}

async fn generation_socket(socket: WebSocket, pace: Duration) {
    info!("generation connection established");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<GenerationServerEvent>(64);

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = send_json(&mut sink, &event).await {
                info!("generation client went away: {}", e);
                break;
            }
        }
    });

    let mut running: Option<JoinHandle<()>> = None;
    while let Some(msg) = stream.next().await {
        let Some(frame) = text_of(msg) else {
            break;
        };
        let Some(text) = frame else {
            continue;
        };
        let event = match serde_json::from_str::<GenerationClientEvent>(&text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("unrecognized generation message: {}", e);
                let error = GenerationErrorEvent::new(&format!("invalid message: {e}"));
                if tx.send(GenerationServerEvent::Error(error)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        if let Some(task) = running.take() {
            task.abort();
        }
        match event {
            GenerationClientEvent::SendMessage(request) => {
                info!(request_id = %request.request_id(), "message: {:?}", request.message());
                match script(request.message(), request.request_id(), pace) {
                    Ok(steps) => running = Some(tokio::spawn(play(steps, tx.clone()))),
                    Err(e) => {
                        let error = GenerationErrorEvent::new(&format!("{e:#}"));
                        if tx.send(GenerationServerEvent::Error(error)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            GenerationClientEvent::StopGeneration => info!("generation stopped"),
        }
    }

    if let Some(task) = running.take() {
        task.abort();
    }
    drop(tx);
    let _ = writer.await;
    info!("generation connection closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(generation_ws))
        .route("/ws/realtime-speech", get(recognition_ws))
        .with_state(config.pace)
        .layer(cors);

    info!("loopback backend listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
