//! Integration tests for the gateway HTTP API: push webhook to /events fan-out, token
//! checks and send error mapping. The upstream platform is an httpmock server.

use dingo::channels::routes::now_ms;
use dingo::channels::{webhook_signature, InboundEvent};
use dingo::config::Config;
use dingo::gateway::{self, GatewayState};
use dingo::manager::GatewayManager;
use futures_util::StreamExt;
use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "api-token";
const SECRET: &str = "SECwebhook";

struct TestGateway {
    addr: std::net::SocketAddr,
    manager: Arc<GatewayManager>,
    _stop: oneshot::Sender<()>,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn wait_for_subscribers(&self, n: usize) {
        for _ in 0..100 {
            if self.manager.broker().subscriber_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} subscriber(s)", n);
    }
}

fn push_config(api_base: &str, token: Option<&str>) -> Config {
    let mut config = Config::default();
    config.gateway.bind = "127.0.0.1".to_string();
    config.gateway.token = token.map(str::to_string);
    config.dingtalk.client_id = Some("ding-client".to_string());
    config.dingtalk.client_secret = Some("secret".to_string());
    config.dingtalk.agent_id = Some("4242".to_string());
    config.dingtalk.use_stream = false;
    config.dingtalk.webhook_secret = Some(SECRET.to_string());
    config.dingtalk.api_base = api_base.to_string();
    config
}

async fn spawn_gateway(config: Config) -> TestGateway {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    let manager = Arc::new(GatewayManager::new(Arc::new(config)));
    manager.start().await.expect("start manager");
    let (stop, stopped) = oneshot::channel::<()>();
    let state = GatewayState::new(manager.clone());
    tokio::spawn(async move {
        let _ = gateway::serve(listener, state, async move {
            let _ = stopped.await;
        })
        .await;
    });
    TestGateway {
        addr,
        manager,
        _stop: stop,
    }
}

fn chatbot_body(msg_id: &str) -> serde_json::Value {
    serde_json::json!({
        "msgId": msg_id,
        "msgtype": "text",
        "text": { "content": "ping" },
        "conversationType": "1",
        "conversationId": "cid-1",
        "senderStaffId": "staff-7",
        "senderNick": "Lee"
    })
}

fn mock_token(server: &MockServer) {
    server.mock(|when, then| {
        when.method(GET).path("/gettoken");
        then.status(200)
            .json_body(serde_json::json!({"errcode": 0, "access_token": "t1", "expires_in": 7200}));
    });
}

#[tokio::test]
async fn signed_webhook_is_streamed_to_event_sockets() {
    let gw = spawn_gateway(push_config("http://unused", None)).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(gw.ws_url("/events"))
        .await
        .expect("ws connect");
    gw.wait_for_subscribers(1).await;

    let ts = "1700000000000";
    let res: serde_json::Value = reqwest::Client::new()
        .post(gw.url("/dingtalk/webhook"))
        .header("timestamp", ts)
        .header("sign", webhook_signature(SECRET, ts))
        .json(&chatbot_body("msg-42"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res, serde_json::json!({"success": true}));

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("event frame within 2s")
        .unwrap()
        .unwrap();
    let Message::Text(text) = frame else {
        panic!("expected text frame, got {:?}", frame);
    };
    let event: InboundEvent = serde_json::from_str(&text).unwrap();
    assert_eq!(event.msg_id, "msg-42");
    assert_eq!(event.sender, "staff-7");
    assert_eq!(event.sender_name, "Lee");
    assert_eq!(event.receiver, "ding-client");
    assert!(!event.is_group);

    drop(ws);
    gw.wait_for_subscribers(0).await;
}

#[tokio::test]
async fn webhook_signature_falls_back_to_query_and_rejects_bad_sign() {
    let gw = spawn_gateway(push_config("http://unused", None)).await;
    let mut sub = gw.manager.register_listener().await;
    let client = reqwest::Client::new();

    let ts = "1700000000123";
    let res = client
        .post(gw.url("/dingtalk/webhook"))
        .query(&[("timestamp", ts), ("sign", webhook_signature(SECRET, ts).as_str())])
        .json(&chatbot_body("q-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["success"], true);

    let res = client
        .post(gw.url("/dingtalk/webhook"))
        .header("timestamp", ts)
        .header("sign", "bm90IGEgc2lnbmF0dXJl")
        .json(&chatbot_body("q-2"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({"success": false, "error": "invalid_signature"})
    );

    let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.msg_id, "q-1");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn webhook_accepts_signature_field_in_header_or_query() {
    let gw = spawn_gateway(push_config("http://unused", None)).await;
    let mut sub = gw.manager.register_listener().await;
    let client = reqwest::Client::new();
    let ts = "1700000000456";
    let signature = webhook_signature(SECRET, ts);

    let res: serde_json::Value = client
        .post(gw.url("/dingtalk/webhook"))
        .header("timestamp", ts)
        .header("signature", signature.as_str())
        .json(&chatbot_body("h-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res, serde_json::json!({"success": true}));

    let res: serde_json::Value = client
        .post(gw.url("/dingtalk/webhook"))
        .query(&[("timestamp", ts), ("signature", signature.as_str())])
        .json(&chatbot_body("h-2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(res, serde_json::json!({"success": true}));

    for expected in ["h-1", "h-2"] {
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.msg_id, expected);
    }
}

#[tokio::test]
async fn protected_routes_require_bearer_token() {
    let gw = spawn_gateway(push_config("http://unused", Some(TOKEN))).await;
    let client = reqwest::Client::new();

    let health = client.get(gw.url("/")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let res = client
        .post(gw.url("/send/text"))
        .json(&serde_json::json!({"target": "u", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let res = client
        .post(gw.url("/send/markdown"))
        .bearer_auth("wrong")
        .json(&serde_json::json!({"target": "u", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    assert!(tokio_tungstenite::connect_async(gw.ws_url("/events"))
        .await
        .is_err());

    let mut request = gw.ws_url("/events").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", format!("Bearer {}", TOKEN).parse().unwrap());
    let (_ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("authorized ws connect");
    gw.wait_for_subscribers(1).await;

    let (_ws_query, _) =
        tokio_tungstenite::connect_async(gw.ws_url(&format!("/events?token={}", TOKEN)))
            .await
            .expect("query token ws connect");
    gw.wait_for_subscribers(2).await;
}

#[tokio::test]
async fn send_text_with_token_reaches_work_notification() {
    let server = MockServer::start();
    mock_token(&server);
    let notify = server.mock(|when, then| {
        when.method(POST)
            .path("/topapi/message/corpconversation/asyncsend_v2")
            .query_param("access_token", "t1")
            .json_body_includes(
                r#"{"userid_list":"staff-7","msg":{"msgtype":"text","text":{"content":"hello"}}}"#,
            );
        then.status(200).json_body(serde_json::json!({"errcode": 0}));
    });
    let gw = spawn_gateway(push_config(&server.base_url(), Some(TOKEN))).await;

    let res = reqwest::Client::new()
        .post(gw.url("/send/text"))
        .bearer_auth(TOKEN)
        .json(&serde_json::json!({"target": "staff-7", "content": "hello"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"status": "sent"}));
    notify.assert_calls(1);
}

#[tokio::test]
async fn reply_uses_session_webhook_from_inbound_message() {
    let server = MockServer::start();
    let hook = server.mock(|when, then| {
        when.method(POST)
            .path("/robot/sendBySession")
            .json_body_includes(r#"{"text":{"content":"pong"},"at":{"atUserIds":["staff-7"]}}"#);
        then.status(200).json_body(serde_json::json!({"errcode": 0}));
    });
    let gw = spawn_gateway(push_config(&server.base_url(), None)).await;
    let client = reqwest::Client::new();

    let mut body = chatbot_body("s-1");
    body["sessionWebhook"] = server.url("/robot/sendBySession").into();
    body["sessionWebhookExpiredTime"] = (now_ms() + 60_000).into();
    let ts = "1";
    client
        .post(gw.url("/dingtalk/webhook"))
        .header("timestamp", ts)
        .header("sign", webhook_signature(SECRET, ts))
        .json(&body)
        .send()
        .await
        .unwrap();

    let res = client
        .post(gw.url("/send/text"))
        .json(&serde_json::json!({"target": "staff-7", "content": "pong", "at_list": ["staff-7"]}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    hook.assert_calls(1);
}

#[tokio::test]
async fn upstream_rejection_maps_to_bad_gateway() {
    let server = MockServer::start();
    mock_token(&server);
    server.mock(|when, then| {
        when.method(POST)
            .path("/topapi/message/corpconversation/asyncsend_v2");
        then.status(200)
            .json_body(serde_json::json!({"errcode": 60020, "errmsg": "ip not in whitelist"}));
    });
    let gw = spawn_gateway(push_config(&server.base_url(), None)).await;

    let res = reqwest::Client::new()
        .post(gw.url("/send/markdown"))
        .json(&serde_json::json!({"target": "u", "title": "Deploy", "content": "**done**"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "rejected");
    assert!(body["error"].as_str().unwrap().contains("ip not in whitelist"));
}

#[tokio::test]
async fn sends_after_stop_are_unavailable() {
    let gw = spawn_gateway(push_config("http://unused", None)).await;
    gw.manager.stop().await;

    let res = reqwest::Client::new()
        .post(gw.url("/send/text"))
        .json(&serde_json::json!({"target": "u", "content": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 503);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["kind"], "not_started");
}
