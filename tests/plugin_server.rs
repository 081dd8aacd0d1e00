//! End-to-end checks: the plugin transport wired to a real driver,
//! with a live netlink subscription underneath. Only paths that need
//! no ARP traffic are exercised here; probe behavior is covered by
//! the unit tests against fakes.

use std::sync::Arc;

use arp_ipam::driver::{Driver, DriverConfigBuilder};
use arp_ipam::plugin::{self, Ipam};
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn start_driver() -> (Arc<dyn Ipam>, CancellationToken) {
    let quit = CancellationToken::new();
    let (driver, _tasks) = Driver::new(DriverConfigBuilder::new().build(), quit.clone())
        .expect("netlink subscription");
    (Arc::new(driver), quit)
}

async fn post_json(ipam: Arc<dyn Ipam>, path: &str, body: Value) -> (StatusCode, Value) {
    let app = plugin::router(ipam);
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn activation_handshake() {
    let (ipam, quit) = start_driver();

    let (status, body) = post_json(Arc::clone(&ipam), "/Plugin.Activate", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "Implements": ["IpamDriver"] }));

    let (status, body) = post_json(ipam, "/IpamDriver.GetCapabilities", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "RequiresMACAddress": false }));

    quit.cancel();
}

#[tokio::test]
async fn pool_lifecycle_over_the_wire() {
    let (ipam, quit) = start_driver();

    let (status, body) = post_json(
        Arc::clone(&ipam),
        "/IpamDriver.RequestPool",
        json!({ "Pool": "127.0.0.0/8", "SubPool": "", "V6": false }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["PoolID"], "127.0.0.0/8");
    assert_eq!(body["Pool"], "127.0.0.0/8");

    let (status, body) = post_json(
        ipam,
        "/IpamDriver.ReleasePool",
        json!({ "PoolID": "127.0.0.0/8" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    quit.cancel();
}

#[tokio::test]
async fn non_local_pool_is_refused() {
    let (ipam, quit) = start_driver();

    let (status, body) = post_json(
        ipam,
        "/IpamDriver.RequestPool",
        json!({ "Pool": "198.51.100.0/24" }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["Err"], "pool is not a local network: 198.51.100.0/24");

    quit.cancel();
}

#[tokio::test]
async fn gateway_address_is_granted_unprobed() {
    let (ipam, quit) = start_driver();

    let (status, body) = post_json(
        ipam,
        "/IpamDriver.RequestAddress",
        json!({
            "PoolID": "127.0.0.0/8",
            "Address": "127.0.0.1",
            "Options": { "RequestAddressType": "com.docker.network.gateway" }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Address"], "127.0.0.1/8");

    quit.cancel();
}

#[tokio::test]
async fn releasing_an_absent_address_succeeds() {
    let (ipam, quit) = start_driver();

    let (status, body) = post_json(
        ipam,
        "/IpamDriver.ReleaseAddress",
        json!({ "PoolID": "127.0.0.0/8", "Address": "127.0.0.250" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    quit.cancel();
}
