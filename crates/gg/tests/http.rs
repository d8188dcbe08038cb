use std::time::Duration;

use assert_matches::assert_matches;
use purple_core::ErrorKind;
use purple_gg::client::spawn_avatar_fetch;
use purple_gg::oauth::{OAuthEndpoints, Token, request_access_token};
use purple_gg::{AvatarApi, AvatarUpdate, GgError, Liveness};
use reqwest::Client;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn authorization(request: &Request) -> String {
    request
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn body(request: &Request) -> String {
    String::from_utf8(request.body.clone()).expect("request body should be utf8")
}

async fn mount_token_endpoints(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/request_token"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "oauth_token": "req",
            "oauth_token_secret": "reqsec"
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "oauth_token": "acc",
            "oauth_token_secret": "accsec"
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn token_dance_authorizes_the_request_token() {
    let server = MockServer::start().await;
    mount_token_endpoints(&server).await;

    let endpoints = OAuthEndpoints::from_api_base(&server.uri()).unwrap();
    let token = request_access_token(&Client::new(), &endpoints, 123456, "tajne")
        .await
        .expect("token dance should succeed");
    assert_eq!(
        token,
        Token {
            token: "acc".into(),
            secret: "accsec".into()
        }
    );

    let requests = server.received_requests().await.expect("requests are recorded");
    assert_eq!(requests.len(), 3);

    let request_token = authorization(&requests[0]);
    assert!(request_token.starts_with("OAuth "));
    assert!(request_token.contains("oauth_consumer_key=\"123456\""));
    assert!(request_token.contains("oauth_signature_method=\"HMAC-SHA1\""));
    assert!(!request_token.contains("oauth_token="));

    let authorize = body(&requests[1]);
    assert!(authorize.contains("request_token=req"));
    assert!(authorize.contains("uin=123456"));
    assert!(authorize.contains("password=tajne"));

    assert!(authorization(&requests[2]).contains("oauth_token=\"req\""));
}

#[tokio::test]
async fn rejected_credentials_stop_the_dance() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request_token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/authorize"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let endpoints = OAuthEndpoints::from_api_base(&server.uri()).unwrap();
    let error = request_access_token(&Client::new(), &endpoints, 123456, "wrong")
        .await
        .unwrap_err();
    assert_matches!(error, GgError::Status { status: 401, .. });
    assert_eq!(ErrorKind::from(&error), ErrorKind::AuthenticationFailed);
}

#[tokio::test]
async fn malformed_token_response_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request_token"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let endpoints = OAuthEndpoints::from_api_base(&server.uri()).unwrap();
    let error = request_access_token(&Client::new(), &endpoints, 123456, "tajne")
        .await
        .unwrap_err();
    assert_matches!(error, GgError::Malformed { endpoint, .. } if endpoint == "request_token");
}

fn avatar_api(server: &MockServer) -> AvatarApi {
    AvatarApi::new(Client::new(), &server.uri(), &server.uri()).unwrap()
}

#[tokio::test]
async fn avatar_image_is_downloaded_only_when_the_timestamp_changes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/avatars/42/0.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "timestamp": 100,
            "bigAvatar": format!("{}/img/42", server.uri())
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/img/42"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
        .expect(1)
        .mount(&server)
        .await;

    let api = avatar_api(&server);
    assert_eq!(
        api.fetch(42, None).await.unwrap(),
        AvatarUpdate::Image {
            timestamp: 100,
            data: vec![1, 2, 3]
        }
    );
    assert_eq!(api.fetch(42, Some(100)).await.unwrap(), AvatarUpdate::Unchanged);
}

#[tokio::test]
async fn avatar_without_image_means_removed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/avatars/7/0.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "timestamp": 5 })))
        .mount(&server)
        .await;

    let update = avatar_api(&server).fetch(7, Some(1)).await.unwrap();
    assert_eq!(update, AvatarUpdate::Removed { timestamp: 5 });
}

#[tokio::test]
async fn missing_avatar_info_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/avatars/7/0.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let error = avatar_api(&server).fetch(7, None).await.unwrap_err();
    assert_matches!(error, GgError::Status { status: 404, .. });
}

#[tokio::test]
async fn upload_is_signed_with_the_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let token = Token {
        token: "acc".into(),
        secret: "accsec".into(),
    };
    avatar_api(&server)
        .upload(42, "tajne", &token, &[1, 2, 3])
        .await
        .expect("upload should succeed");

    let requests = server.received_requests().await.expect("requests are recorded");
    assert!(authorization(&requests[0]).contains("oauth_token=\"acc\""));
    let form = body(&requests[0]);
    assert!(form.contains("uin=42"));
    assert!(form.contains("photo=AQID"));
}

#[tokio::test]
async fn results_for_a_closed_session_are_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/avatars/42/0.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "timestamp": 1 }))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let live = Liveness::new();
    let task = spawn_avatar_fetch(avatar_api(&server), 42, None, live.clone(), done_tx.clone());
    live.kill();
    task.await.unwrap();
    assert!(done_rx.try_recv().is_err());

    let live = Liveness::new();
    spawn_avatar_fetch(avatar_api(&server), 42, None, live, done_tx)
        .await
        .unwrap();
    assert!(done_rx.try_recv().is_ok());
}
