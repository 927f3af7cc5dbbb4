use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use murmur_core::{ChatServices, CoreConfig, LogNotifier, NewGroup};
use murmur_db::Database;
use murmur_gateway::GatewayConfig;
use murmur_server::build_app;
use murmur_types::api::Claims;
use murmur_types::events::{GatewayCommand, GatewayEvent};
use murmur_types::models::ChatId;

const SECRET: &str = "gateway-secret";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn token(user_id: i64, username: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: username.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

/// Serve the app on an ephemeral port with users 1 and 2 sharing a group.
async fn start() -> (SocketAddr, ChatId) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    db.upsert_user(1, "ana", None).unwrap();
    db.upsert_user(2, "ben", None).unwrap();

    let services = ChatServices::new(db, Arc::new(LogNotifier), CoreConfig::default());
    let chat = services
        .groups
        .create_group(
            1,
            NewGroup {
                title: "crew".into(),
                member_ids: vec![2],
                ..NewGroup::default()
            },
        )
        .await
        .unwrap();

    let app = build_app(services, GatewayConfig::new(SECRET.into()));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, chat.id)
}

async fn send(ws: &mut Socket, cmd: &GatewayCommand) {
    let text = serde_json::to_string(cmd).unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Read events until one matches, failing after a few seconds.
async fn expect(ws: &mut Socket, matches: impl Fn(&GatewayEvent) -> bool) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("socket closed").expect("socket error");
            if let Message::Text(text) = msg {
                let event: GatewayEvent = serde_json::from_str(text.as_str()).unwrap();
                if matches(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn two_clients_exchange_a_message() {
    let (addr, chat_id) = start().await;

    // query-string authentication
    let (mut ana, _) = connect_async(format!("ws://{}/gateway?token={}", addr, token(1, "ana")))
        .await
        .unwrap();
    let ready = expect(&mut ana, |e| matches!(e, GatewayEvent::Ready { .. })).await;
    assert!(matches!(ready, GatewayEvent::Ready { user_id: 1, .. }));

    // Identify handshake
    let (mut ben, _) = connect_async(format!("ws://{}/gateway", addr)).await.unwrap();
    send(&mut ben, &GatewayCommand::Identify { token: token(2, "ben") }).await;
    expect(&mut ben, |e| matches!(e, GatewayEvent::Ready { user_id: 2, .. })).await;

    // snapshot proves ana is registered before anything is sent
    expect(&mut ben, |e| {
        matches!(e, GatewayEvent::UserStatusChanged { user_id: 1, is_online: true, .. })
    })
    .await;
    expect(&mut ana, |e| {
        matches!(e, GatewayEvent::UserStatusChanged { user_id: 2, is_online: true, .. })
    })
    .await;

    send(
        &mut ben,
        &GatewayCommand::SendMessage {
            chat_id,
            content: "hi ana".into(),
            correlation_id: Some("local-1".into()),
        },
    )
    .await;

    let confirmation = expect(&mut ben, |e| {
        matches!(
            e,
            GatewayEvent::MessageCorrelationConfirmation { .. } | GatewayEvent::NewMessage { .. }
        )
    })
    .await;
    let GatewayEvent::MessageCorrelationConfirmation { correlation_id, message_id } = confirmation else {
        panic!("confirmation must precede the broadcast, got {:?}", confirmation);
    };
    assert_eq!(correlation_id, "local-1");

    let received = expect(&mut ana, |e| matches!(e, GatewayEvent::NewMessage { .. })).await;
    let GatewayEvent::NewMessage { message } = received else { unreachable!() };
    assert_eq!(message.id, message_id);
    assert_eq!(message.content, "hi ana");
    assert_eq!(message.sender_username, "ben");

    // read receipt flows back to the sender
    send(&mut ana, &GatewayCommand::MarkRead { message_id }).await;
    expect(&mut ben, |e| {
        matches!(e, GatewayEvent::MessageRead { reader_id: 1, .. })
    })
    .await;

    // ben leaving the gateway flips presence for ana
    ben.close(None).await.unwrap();
    expect(&mut ana, |e| {
        matches!(e, GatewayEvent::UserStatusChanged { user_id: 2, is_online: false, .. })
    })
    .await;
}

#[tokio::test]
async fn rejected_commands_get_an_error_event() {
    let (addr, chat_id) = start().await;
    let (mut ana, _) = connect_async(format!("ws://{}/gateway?token={}", addr, token(1, "ana")))
        .await
        .unwrap();
    expect(&mut ana, |e| matches!(e, GatewayEvent::Ready { .. })).await;

    ana.send(Message::Text("{\"type\":\"Nonsense\"}".into())).await.unwrap();
    let error = expect(&mut ana, |e| matches!(e, GatewayEvent::Error { .. })).await;
    assert!(matches!(error, GatewayEvent::Error { ref code, .. } if code == "invalid_input"));

    send(
        &mut ana,
        &GatewayCommand::SendMessage {
            chat_id,
            content: "   ".into(),
            correlation_id: Some("local-2".into()),
        },
    )
    .await;
    let error = expect(&mut ana, |e| matches!(e, GatewayEvent::Error { .. })).await;
    match error {
        GatewayEvent::Error { code, correlation_id } => {
            assert_eq!(code, "invalid_input");
            assert_eq!(correlation_id.as_deref(), Some("local-2"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn bad_tokens_are_refused_at_upgrade() {
    let (addr, _) = start().await;
    let result = connect_async(format!("ws://{}/gateway?token=forged", addr)).await;
    assert!(result.is_err());
}
