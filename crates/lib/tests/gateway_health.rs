//! Integration test: start the gateway with no channels on a free port, GET /, assert health JSON.
//! Needs no modem, SMTP server or HTTP endpoint.

use smsgw::config::Config;
use smsgw::gateway::Gateway;
use std::time::Duration;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

#[tokio::test]
async fn status_health_responds_with_running() {
    let port = free_port();
    let mut config = Config::default();
    config.status.port = port;
    config.status.bind = "127.0.0.1".to_string();

    let gateway = Gateway::start(config).await.expect("start gateway");
    assert_eq!(gateway.status_addr().map(|a| a.port()), Some(port));

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    let mut health = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                health = Some(resp.json::<serde_json::Value>().await.expect("parse JSON"));
                break;
            }
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let Some(json) = health else {
        panic!(
            "GET {} did not return 200 with health JSON within 5s; last error: {:?}",
            url, last_err
        );
    };
    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));
    assert_eq!(json.get("multipartPending").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(json.get("stored").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        json.get("channels").and_then(|v| v.as_array()).map(Vec::len),
        Some(0)
    );

    let messages: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/messages", port))
        .send()
        .await
        .expect("GET /messages")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(messages, serde_json::json!([]));

    gateway.shutdown().await;
}
