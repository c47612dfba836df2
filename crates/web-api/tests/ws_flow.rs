mod support;

use config::ChatConfig;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Error as WsError};

use support::{emit, expect_event, TestServer};

#[tokio::test]
async fn handshake_without_valid_credentials_is_refused() {
    let server = TestServer::start().await;

    let err = connect_async(server.ws_url())
        .await
        .expect_err("missing token must be refused");
    match err {
        WsError::Http(response) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("unexpected error {other:?}"),
    }

    let err = connect_async(format!("{}?token=not-a-jwt", server.ws_url()))
        .await
        .expect_err("invalid token must be refused");
    assert!(matches!(err, WsError::Http(ref response) if response.status().as_u16() == 401));

    let health = server
        .http
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .expect("health");
    assert_eq!(health.status(), StatusCode::OK);
}

#[tokio::test]
async fn conversation_messaging_over_socket_and_rest() {
    let server = TestServer::start().await;
    let (owner_id, owner_token) = server.user().await;
    let (buyer_id, buyer_token) = server.user().await;
    let ad_id = server.ad_owned_by(owner_id).await;

    let response = server
        .http
        .post(server.url("/conversations"))
        .bearer_auth(&buyer_token)
        .json(&json!({ "adId": ad_id, "text": "Is the bike still available?" }))
        .send()
        .await
        .expect("start conversation");
    assert_eq!(response.status(), StatusCode::CREATED);
    let started: Value = response.json().await.expect("json");
    assert_eq!(started["created"], true);
    let conversation_id = started["conversation"]["id"].as_str().expect("id").to_owned();

    let unread: Value = server
        .http
        .get(server.url("/conversations/unread-count"))
        .header("cookie", format!("access_token={owner_token}"))
        .send()
        .await
        .expect("unread")
        .json()
        .await
        .expect("json");
    assert_eq!(unread["totalUnread"], 1);

    let mut owner = server.connect_with_protocol(&owner_token).await;
    let mut buyer = server.connect_with_query(&buyer_token).await;

    emit(&mut owner, "conversation:join", json!({ "conversationId": conversation_id, "markAsRead": true })).await;
    let joined = expect_event(&mut owner, "conversation:joined").await;
    assert_eq!(joined["conversationId"], conversation_id.as_str());
    emit(&mut buyer, "conversation:join", json!({ "conversationId": conversation_id })).await;
    expect_event(&mut buyer, "conversation:joined").await;

    emit(
        &mut buyer,
        "message:send",
        json!({ "conversationId": conversation_id, "text": "I can pick it up today", "clientTempId": "tmp-1" }),
    )
    .await;
    let new_message = expect_event(&mut owner, "message:new").await;
    assert_eq!(new_message["message"]["text"], "I can pick it up today");
    assert_eq!(new_message["message"]["senderId"], buyer_id.to_string());
    let echoed = expect_event(&mut buyer, "message:new").await;
    assert_eq!(echoed["message"]["clientTempId"], "tmp-1");

    let response = server
        .http
        .post(server.url(&format!("/conversations/{conversation_id}/read")))
        .bearer_auth(&owner_token)
        .send()
        .await
        .expect("mark read");
    assert_eq!(response.status(), StatusCode::OK);
    let read = expect_event(&mut buyer, "message:read").await;
    assert_eq!(read["readerId"], owner_id.to_string());

    let page: Value = server
        .http
        .get(server.url(&format!("/conversations/{conversation_id}/messages?limit=1")))
        .bearer_auth(&buyer_token)
        .send()
        .await
        .expect("history")
        .json()
        .await
        .expect("json");
    assert_eq!(page["hasMore"], true);
    assert_eq!(page["messages"][0]["text"], "I can pick it up today");
}

#[tokio::test]
async fn invalid_frames_produce_error_events() {
    let server = TestServer::start().await;
    let (_, token) = server.user().await;
    let mut socket = server.connect_with_query(&token).await;

    emit(&mut socket, "message:send", json!({ "conversationId": "not-a-uuid" })).await;
    let error = expect_event(&mut socket, "error").await;
    assert_eq!(error["code"], "VALIDATION_ERROR");

    emit(&mut socket, "conversation:explode", json!({})).await;
    let error = expect_event(&mut socket, "error").await;
    assert_eq!(error["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn rest_send_shares_the_message_bucket() {
    let server = TestServer::with_chat_config(ChatConfig {
        messages_per_window: 2,
        ..ChatConfig::default()
    })
    .await;
    let (owner_id, _) = server.user().await;
    let (_, buyer_token) = server.user().await;
    let ad_id = server.ad_owned_by(owner_id).await;

    let started: Value = server
        .http
        .post(server.url("/conversations"))
        .bearer_auth(&buyer_token)
        .json(&json!({ "adId": ad_id }))
        .send()
        .await
        .expect("start")
        .json()
        .await
        .expect("json");
    let conversation_id = started["conversation"]["id"].as_str().expect("id").to_owned();
    let path = server.url(&format!("/conversations/{conversation_id}/messages"));

    for text in ["first", "second"] {
        let response = server
            .http
            .post(&path)
            .bearer_auth(&buyer_token)
            .json(&json!({ "text": text }))
            .send()
            .await
            .expect("send");
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let response = server
        .http
        .post(&path)
        .bearer_auth(&buyer_token)
        .json(&json!({ "text": "third" }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["code"], "RATE_LIMITED");

    let anonymous = server
        .http
        .get(server.url("/conversations"))
        .send()
        .await
        .expect("list");
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn starting_with_text_counts_against_the_message_bucket() {
    let server = TestServer::with_chat_config(ChatConfig {
        messages_per_window: 1,
        ..ChatConfig::default()
    })
    .await;
    let (owner_id, _) = server.user().await;
    let (_, buyer_token) = server.user().await;
    let first_ad = server.ad_owned_by(owner_id).await;
    let second_ad = server.ad_owned_by(owner_id).await;

    let start = |ad_id, text: Option<&str>| {
        let body = match text {
            Some(text) => json!({ "adId": ad_id, "text": text }),
            None => json!({ "adId": ad_id }),
        };
        server
            .http
            .post(server.url("/conversations"))
            .bearer_auth(&buyer_token)
            .json(&body)
            .send()
    };

    let response = start(first_ad, Some("is it still available?")).await.expect("start");
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = start(second_ad, Some("and this one?")).await.expect("start");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["code"], "RATE_LIMITED");

    // 不带首条消息不消耗配额
    let response = start(second_ad, Some("   ")).await.expect("start");
    assert_eq!(response.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn search_finds_only_the_callers_messages() {
    let server = TestServer::start().await;
    let (owner_id, owner_token) = server.user().await;
    let (_, buyer_token) = server.user().await;
    let (_, stranger_token) = server.user().await;
    let ad_id = server.ad_owned_by(owner_id).await;

    let started: Value = server
        .http
        .post(server.url("/conversations"))
        .bearer_auth(&buyer_token)
        .json(&json!({ "adId": ad_id, "text": "Is the BIKE still available?" }))
        .send()
        .await
        .expect("start")
        .json()
        .await
        .expect("json");
    let conversation_id = started["conversation"]["id"].as_str().expect("id").to_owned();
    let response = server
        .http
        .post(server.url(&format!("/conversations/{conversation_id}/messages")))
        .bearer_auth(&owner_token)
        .json(&json!({ "text": "yes, 100% ready to ride" }))
        .send()
        .await
        .expect("send");
    assert_eq!(response.status(), StatusCode::CREATED);

    let search = |token: &str, q: &str| {
        server
            .http
            .get(server.url("/messages/search"))
            .bearer_auth(token)
            .query(&[("q", q)])
            .send()
    };

    let found: Value = search(&owner_token, "bike")
        .await
        .expect("search")
        .json()
        .await
        .expect("json");
    assert_eq!(found["query"], "bike");
    assert_eq!(found["hasMore"], false);
    let messages = found["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "Is the BIKE still available?");

    // 通配符按字面匹配
    let found: Value = search(&buyer_token, "%")
        .await
        .expect("search")
        .json()
        .await
        .expect("json");
    let messages = found["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["text"], "yes, 100% ready to ride");

    let found: Value = search(&stranger_token, "bike")
        .await
        .expect("search")
        .json()
        .await
        .expect("json");
    assert!(found["messages"].as_array().expect("messages").is_empty());

    let response = search(&owner_token, "   ").await.expect("search");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["code"], "VALIDATION_ERROR");
}
