//! Integration tests for the admin API.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use common::{wait_until, TestHarness};
use knive_av::ToolRegistry;

const CHANNELS: &str = r#"
[[channels]]
name = "Bus"
slug = "bus"
url = "https://bus.example"

[channels.feed]
host = "127.0.0.1"
port = 0
secret = "abc"

[[channels.outlets]]
type = "archive"

[[channels.outlets]]
type = "relay"
host = "127.0.0.1"
port = 9
secret = "remote-secret"
"#;

async fn harness() -> (TestHarness, String) {
    let (harness, addr) = TestHarness::with_server(CHANNELS, ToolRegistry::default()).await;
    (harness, format!("http://{addr}"))
}

#[tokio::test]
async fn health() {
    let (_h, base) = harness().await;
    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn list_and_get_channels() {
    let (_h, base) = harness().await;

    let channels: Vec<Value> = reqwest::get(format!("{base}/api/v1/channels"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["slug"], "bus");
    assert_eq!(channels[0]["url"], "https://bus.example");
    assert_eq!(channels[0]["running"], false);
    assert_eq!(channels[0]["stages"].as_array().unwrap().len(), 3);

    let resp = reqwest::get(format!("{base}/api/v1/channels/tram")).await.unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 404);
    assert!(body["error"].as_str().unwrap().contains("tram"));
}

#[tokio::test]
async fn recording_lifecycle() {
    let (harness, base) = harness().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/api/v1/channels/bus/recording");

    let resp = client.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    let episode: Value = resp.json().await.unwrap();
    assert!(episode["ended_at"].is_null());
    let id = episode["id"].as_str().unwrap().to_string();
    assert!(harness.data_dir().join("bus").join(&id).is_dir());

    let resp = client.post(&url).send().await.unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 409);

    let resp = client.delete(&url).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let stopped: Value = resp.json().await.unwrap();
    assert_eq!(stopped["id"], id.as_str());
    assert!(!stopped["ended_at"].is_null());

    let events: Vec<Value> = reqwest::get(format!("{base}/api/v1/events?limit=10"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|e| e["payload"]["type"].as_str())
        .collect();
    assert_eq!(kinds, ["recording_stopped", "recording_started"]);
}

#[tokio::test]
async fn timed_recording_stops_by_itself() {
    let (harness, base) = harness().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/v1/channels/bus/recording"))
        .json(&json!({"auto_stop_secs": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let channel = harness.channel("bus");
    let mut recording = true;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while recording && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        recording = channel.is_recording().await;
    }
    assert!(!recording);

    let resp = client
        .post(format!("{base}/api/v1/channels/bus/recording"))
        .json(&json!({"auto_stop_secs": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn config_hides_secrets_and_accepts_known_keys() {
    let (harness, base) = harness().await;
    let client = reqwest::Client::new();

    let config: Value = reqwest::get(format!("{base}/api/v1/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["channels"][0]["feed"]["secret"], "********");
    assert_eq!(config["channels"][0]["outlets"][1]["secret"], "********");
    assert_eq!(config["server"]["port"], 8080);

    let resp = client
        .put(format!("{base}/api/v1/config/server/port"))
        .json(&json!(9090))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(harness.ctx.settings.snapshot().server.port, 9090);

    let resp = client
        .put(format!("{base}/api/v1/config/channels/secret"))
        .json(&json!("leak"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("unknown setting"));

    let config: Value = reqwest::get(format!("{base}/api/v1/config"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(config["server"]["port"], 9090);
}

#[tokio::test]
async fn channel_start_shows_up_in_status() {
    let (harness, base) = harness().await;
    let channel = harness.channel("bus");
    channel.start().await.unwrap();

    let status: Value = reqwest::get(format!("{base}/api/v1/channels/bus"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["running"], true);
    assert!(status["feed_address"].as_str().unwrap().starts_with("127.0.0.1:"));

    channel.stop().await.unwrap();
    wait_until(Duration::from_secs(5), || !channel.is_running()).await;
}
