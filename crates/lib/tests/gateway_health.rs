//! Integration test: start the gateway in push mode on a free port, GET /, assert health JSON.
//! Needs no upstream platform. The server task is left running when the test ends.

use dingo::config::Config;
use dingo::gateway;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

#[tokio::test]
async fn gateway_health_http_responds_with_running() {
    let port = free_port();

    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.dingtalk.client_id = Some("ding-client".to_string());
    config.dingtalk.client_secret = Some("secret".to_string());
    config.dingtalk.agent_id = Some("4242".to_string());
    config.dingtalk.use_stream = false;

    let gateway_handle = tokio::spawn(async move {
        let _ = gateway::run_gateway(config, None).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let json: serde_json::Value = resp.json().await.expect("parse JSON");
                assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
                assert_eq!(json.get("channel").and_then(|v| v.as_str()), Some("dingtalk"));
                assert_eq!(json.get("mode").and_then(|v| v.as_str()), Some("push"));
                assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
                return;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    gateway_handle.abort();
    panic!(
        "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
        url, last_err
    );
}

#[tokio::test]
async fn stream_mode_without_connector_exits_with_error() {
    let mut config = Config::default();
    config.gateway.port = free_port();
    config.gateway.bind = "127.0.0.1".to_string();
    config.dingtalk.client_id = Some("ding-client".to_string());
    config.dingtalk.client_secret = Some("secret".to_string());
    config.dingtalk.agent_id = Some("4242".to_string());
    config.dingtalk.use_stream = true;

    let result = tokio::time::timeout(Duration::from_secs(5), gateway::run_gateway(config, None))
        .await
        .expect("gateway should stop on its own");
    let err = result.expect_err("stream failure is an error");
    assert!(format!("{:#}", err).contains("stream"), "{:#}", err);
}
