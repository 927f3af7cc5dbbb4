use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use murmur_core::{ChatError, ChatServices};
use murmur_types::api::Claims;
use murmur_types::events::{GatewayCommand, GatewayEvent};

use crate::auth::validate_token;
use crate::handlers::{HandlerTable, Session, correlation_of};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub jwt_secret: String,
    /// Ping interval. Two consecutive missed pongs drop the socket.
    pub heartbeat: Duration,
    /// How long an unauthenticated socket may take to send `Identify`.
    pub identify_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret,
            heartbeat: Duration::from_secs(15),
            identify_timeout: Duration::from_secs(10),
        }
    }
}

/// Everything a gateway connection needs, cheap to clone into each socket task.
#[derive(Clone)]
pub struct Gateway {
    services: ChatServices,
    handlers: Arc<HandlerTable>,
    config: Arc<GatewayConfig>,
}

impl Gateway {
    pub fn new(services: ChatServices, config: GatewayConfig) -> Self {
        Self {
            services,
            handlers: Arc::new(HandlerTable::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// Drive one WebSocket from handshake to disconnect. `claims` is set when
/// the token was already validated at upgrade time; otherwise the socket
/// must send `Identify` first.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, claims: Option<Claims>) {
    let (mut sender, mut receiver) = socket.split();

    let claims = match claims {
        Some(claims) => claims,
        None => match wait_for_identify(&mut receiver, &gateway.config).await {
            Some(claims) => claims,
            None => {
                warn!("WebSocket client failed to identify, closing");
                return;
            }
        },
    };

    let session = Session {
        user_id: claims.sub,
        username: claims.username,
        connection_id: Uuid::new_v4(),
    };

    let ready = GatewayEvent::Ready {
        user_id: session.user_id,
        username: session.username.clone(),
        connection_id: session.connection_id,
    };
    if !send_event(&mut sender, &ready).await {
        return;
    }

    run_connection_loop(sender, receiver, gateway, session).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    session: Session,
) {
    let (tx, mut user_rx) = mpsc::unbounded_channel::<GatewayEvent>();
    let services = gateway.services.clone();
    let connection_id = session.connection_id;

    if let Err(e) = services
        .presence
        .open(session.user_id, &session.username, connection_id, tx)
        .await
    {
        error!("Failed to open connection {} for user {}: {}", connection_id, session.user_id, e);
        services.presence.close(connection_id).await;
        return;
    }
    info!("{} ({}) connected to gateway on {}", session.username, session.user_id, connection_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;
    let heartbeat_interval = gateway.config.heartbeat;

    // registry -> client, plus heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = user_rx.recv() => {
                    // channel closes when the registry drops the entry (reaped)
                    let Some(event) = event else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // client -> handler table
    let recv_services = services.clone();
    let handlers = gateway.handlers.clone();
    let recv_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        let correlation_id = correlation_of(&cmd);
                        let name = cmd.name();
                        if let Err(e) = handlers.dispatch(&recv_services, &recv_session, cmd).await {
                            reject(&recv_services, &recv_session, name, e, correlation_id).await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            recv_session.username,
                            recv_session.user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        reject(
                            &recv_services,
                            &recv_session,
                            "unparsed",
                            ChatError::InvalidInput("malformed command"),
                            None,
                        )
                        .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                    recv_services.registry.touch(recv_session.connection_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    services.presence.close(connection_id).await;
    info!("{} ({}) disconnected from gateway", session.username, session.user_id);
}

/// Answer a failed command on the issuing connection only.
async fn reject(
    services: &ChatServices,
    session: &Session,
    command: &str,
    err: ChatError,
    correlation_id: Option<String>,
) {
    match &err {
        ChatError::Transient(e) => {
            error!("{} from user {} failed: {:#}", command, session.user_id, e);
        }
        other => {
            warn!("{} from user {} rejected: {}", command, session.user_id, other);
        }
    }

    services
        .registry
        .send_to_connection(
            session.connection_id,
            GatewayEvent::Error {
                code: err.code().to_string(),
                correlation_id,
            },
        )
        .await;
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &GatewayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to serialize gateway event: {}", e);
            // not the socket's fault; keep it open
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

async fn wait_for_identify(receiver: &mut SplitStream<WebSocket>, config: &GatewayConfig) -> Option<Claims> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) = serde_json::from_str::<GatewayCommand>(&text) {
                    return match validate_token(&config.jwt_secret, &token) {
                        Ok(claims) => Some(claims),
                        Err(e) => {
                            warn!("Identify rejected: {}", e);
                            None
                        }
                    };
                }
            }
        }
        None
    };

    tokio::time::timeout(config.identify_timeout, identify)
        .await
        .ok()
        .flatten()
}
