use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

use murmur_core::{ChatServices, CoreConfig, LogNotifier};
use murmur_db::Database;
use murmur_gateway::GatewayConfig;
use murmur_server::build_app;
use murmur_types::api::Claims;

const SECRET: &str = "test-secret";

fn app() -> Router {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let services = ChatServices::new(db, Arc::new(LogNotifier), CoreConfig::default());
    build_app(services, GatewayConfig::new(SECRET.into()))
}

fn token(user_id: i64, username: &str) -> String {
    let claims = Claims {
        sub: user_id,
        username: username.into(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header("authorization", format!("Bearer {}", token));
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn requests_without_a_valid_bearer_are_unauthorized() {
    let app = app();
    let (status, _) = call(&app, Method::GET, "/chats", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::GET, "/chats", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn group_conversation_over_http() {
    let app = app();
    let (ana, ben, cyd) = (token(1, "ana"), token(2, "ben"), token(3, "cyd"));

    // first request caches the identity
    for t in [&ben, &cyd] {
        let (status, body) = call(&app, Method::GET, "/chats", Some(t), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    let (status, chat) = call(
        &app,
        Method::POST,
        "/chats/group",
        Some(&ana),
        Some(json!({ "title": "crew", "member_ids": [2] })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(chat["owner_id"], 1);
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let (status, message) = call(
        &app,
        Method::POST,
        &format!("/chats/{}/messages", chat_id),
        Some(&ben),
        Some(json!({ "content": "hello crew" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["sender_username"], "ben");
    let message_id = message["id"].as_i64().unwrap();

    let (status, chats) = call(&app, Method::GET, "/chats", Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chats[0]["unread_count"], 1);

    let (status, read) = call(&app, Method::POST, &format!("/messages/{}/read", message_id), Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["marked"], json!([message_id]));

    let (_, readers) = call(&app, Method::GET, &format!("/messages/{}/reads", message_id), Some(&ben), None).await;
    assert_eq!(readers[0]["reader_id"], 1);

    let (status, edited) = call(
        &app,
        Method::PATCH,
        &format!("/messages/{}", message_id),
        Some(&ben),
        Some(json!({ "content": "hello everyone" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["is_edited"], true);

    let (status, history) = call(&app, Method::GET, &format!("/chats/{}/messages?limit=10", chat_id), Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history[0]["content"], "hello everyone");

    // outsiders get a generic forbidden
    let (status, body) = call(&app, Method::GET, &format!("/chats/{}/messages", chat_id), Some(&cyd), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({ "error": "forbidden" }));
}

#[tokio::test]
async fn lifecycle_errors_map_to_stable_codes() {
    let app = app();
    let (ana, ben) = (token(1, "ana"), token(2, "ben"));
    call(&app, Method::GET, "/chats", Some(&ben), None).await;

    let (_, chat) = call(
        &app,
        Method::POST,
        "/chats/group",
        Some(&ana),
        Some(json!({ "title": "crew", "member_ids": [2] })),
    )
    .await;
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::POST, &format!("/chats/{}/leave", chat_id), Some(&ana), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_state");

    let (status, body) = call(
        &app,
        Method::POST,
        &format!("/chats/{}/messages", chat_id),
        Some(&ben),
        Some(json!({ "content": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_input");

    let (status, _) = call(&app, Method::DELETE, &format!("/chats/{}/members/1", chat_id), Some(&ben), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/chats/{}/owner", chat_id),
        Some(&ana),
        Some(json!({ "new_owner_id": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, Method::POST, &format!("/chats/{}/leave", chat_id), Some(&ana), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(&app, Method::DELETE, &format!("/chats/{}", chat_id), Some(&ben), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(&app, Method::GET, &format!("/chats/{}", chat_id), Some(&ben), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn join_links_work_over_http() {
    let app = app();
    let (ana, eli) = (token(1, "ana"), token(5, "eli"));

    let (_, chat) = call(&app, Method::POST, "/chats/group", Some(&ana), Some(json!({ "title": "open" }))).await;
    let chat_id = chat["id"].as_str().unwrap().to_string();

    let (status, link) = call(&app, Method::POST, &format!("/chats/{}/join-link", chat_id), Some(&ana), None).await;
    assert_eq!(status, StatusCode::OK);
    let join_link = link["join_link"].as_str().unwrap().to_string();

    let (status, joined) = call(&app, Method::POST, &format!("/join/{}", join_link), Some(&eli), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(joined["id"], chat_id.as_str());

    let (_, details) = call(&app, Method::GET, &format!("/chats/{}", chat_id), Some(&eli), None).await;
    assert_eq!(details["participants"].as_array().unwrap().len(), 2);
}
