//! Docker libnetwork remote IPAM protocol: the wire types, the
//! capability trait the transport dispatches on, and the HTTP server.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Error, Result};

pub const DEFAULT_ADDRESS_SPACE: &str = "arp-ipam-default";

pub const REQUEST_ADDRESS_TYPE_OPTION: &str = "RequestAddressType";
pub const GATEWAY_ADDRESS_TYPE: &str = "com.docker.network.gateway";

const PLUGIN_SPEC_DIR: &str = "/run/docker/plugins";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    #[serde(rename = "RequiresMACAddress")]
    pub requires_mac_address: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddressSpacesResponse {
    pub local_default_address_space: String,
    pub global_default_address_space: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPoolRequest {
    #[serde(default)]
    pub address_space: String,
    #[serde(default)]
    pub pool: String,
    #[serde(default)]
    pub sub_pool: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default)]
    pub v6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPoolResponse {
    #[serde(rename = "PoolID")]
    pub pool_id: String,
    pub pool: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleasePoolRequest {
    #[serde(default, rename = "PoolID")]
    pub pool_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestAddressRequest {
    #[serde(default, rename = "PoolID")]
    pub pool_id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestAddressResponse {
    pub address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReleaseAddressRequest {
    #[serde(default, rename = "PoolID")]
    pub pool_id: String,
    #[serde(default)]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActivateResponse {
    #[serde(rename = "Implements")]
    implements: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Err")]
    err: String,
}

/// The IPAM operations as one capability interface, so the transport
/// accepts any implementation and tests can serve a fake in-process.
#[async_trait]
pub trait Ipam: Send + Sync {
    async fn get_capabilities(&self) -> Result<CapabilitiesResponse>;
    async fn get_default_address_spaces(&self) -> Result<AddressSpacesResponse>;
    async fn request_pool(&self, req: RequestPoolRequest) -> Result<RequestPoolResponse>;
    async fn release_pool(&self, req: ReleasePoolRequest) -> Result<()>;
    async fn request_address(&self, req: RequestAddressRequest) -> Result<RequestAddressResponse>;
    async fn release_address(&self, req: ReleaseAddressRequest) -> Result<()>;
}

type IpamState = Arc<dyn Ipam>;

pub fn router(ipam: IpamState) -> Router {
    Router::new()
        .route("/Plugin.Activate", post(activate))
        .route("/IpamDriver.GetCapabilities", post(get_capabilities))
        .route(
            "/IpamDriver.GetDefaultAddressSpaces",
            post(get_default_address_spaces),
        )
        .route("/IpamDriver.RequestPool", post(request_pool))
        .route("/IpamDriver.ReleasePool", post(release_pool))
        .route("/IpamDriver.RequestAddress", post(request_address))
        .route("/IpamDriver.ReleaseAddress", post(release_address))
        .with_state(ipam)
}

/// Serve the plugin protocol until the quit token fires, then drain.
pub async fn serve(address: &str, ipam: IpamState, quit: CancellationToken) -> io::Result<()> {
    let addr = normalize_bind_addr(address);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "serving IPAM plugin");
    axum::serve(listener, router(ipam))
        .with_graceful_shutdown(async move { quit.cancelled().await })
        .await
}

/// Docker-style bind addresses may omit the host (":8080").
pub fn normalize_bind_addr(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => address.to_string(),
    }
}

/// Register the plugin with the container runtime by dropping a spec
/// file where it discovers plugins. Best-effort: callers log a failure
/// and keep serving.
pub fn write_spec_file(plugin_name: &str, address: &str) -> io::Result<PathBuf> {
    let dir = PathBuf::from(PLUGIN_SPEC_DIR);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{plugin_name}.spec"));
    std::fs::write(&path, format!("tcp://{}", normalize_bind_addr(address)))?;
    Ok(path)
}

async fn activate() -> Json<ActivateResponse> {
    Json(ActivateResponse {
        implements: vec!["IpamDriver".to_string()],
    })
}

async fn get_capabilities(State(ipam): State<IpamState>) -> Response {
    respond(ipam.get_capabilities().await)
}

async fn get_default_address_spaces(State(ipam): State<IpamState>) -> Response {
    respond(ipam.get_default_address_spaces().await)
}

async fn request_pool(
    State(ipam): State<IpamState>,
    Json(req): Json<RequestPoolRequest>,
) -> Response {
    respond(ipam.request_pool(req).await)
}

async fn release_pool(
    State(ipam): State<IpamState>,
    Json(req): Json<ReleasePoolRequest>,
) -> Response {
    respond_empty(ipam.release_pool(req).await)
}

async fn request_address(
    State(ipam): State<IpamState>,
    Json(req): Json<RequestAddressRequest>,
) -> Response {
    respond(ipam.request_address(req).await)
}

async fn release_address(
    State(ipam): State<IpamState>,
    Json(req): Json<ReleaseAddressRequest>,
) -> Response {
    respond_empty(ipam.release_address(req).await)
}

fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(err),
    }
}

fn respond_empty(result: Result<()>) -> Response {
    match result {
        Ok(()) => Json(serde_json::json!({})).into_response(),
        Err(err) => error_response(err),
    }
}

fn error_response(err: Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            err: err.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::net::Ipv4Addr;
    use tower::ServiceExt;

    struct FakeIpam;

    #[async_trait]
    impl Ipam for FakeIpam {
        async fn get_capabilities(&self) -> Result<CapabilitiesResponse> {
            Ok(CapabilitiesResponse {
                requires_mac_address: false,
            })
        }

        async fn get_default_address_spaces(&self) -> Result<AddressSpacesResponse> {
            Ok(AddressSpacesResponse {
                local_default_address_space: DEFAULT_ADDRESS_SPACE.to_string(),
                global_default_address_space: DEFAULT_ADDRESS_SPACE.to_string(),
            })
        }

        async fn request_pool(&self, req: RequestPoolRequest) -> Result<RequestPoolResponse> {
            if req.pool.is_empty() {
                return Err(Error::InvalidInput(
                    "automatic pool assignment not supported".to_string(),
                ));
            }
            Ok(RequestPoolResponse {
                pool_id: req.pool.clone(),
                pool: req.pool,
            })
        }

        async fn release_pool(&self, _req: ReleasePoolRequest) -> Result<()> {
            Ok(())
        }

        async fn request_address(
            &self,
            req: RequestAddressRequest,
        ) -> Result<RequestAddressResponse> {
            if req.address == "10.1.6.51" {
                return Err(Error::AddressInUse(Ipv4Addr::new(10, 1, 6, 51)));
            }
            Ok(RequestAddressResponse {
                address: "10.1.6.50/24".to_string(),
            })
        }

        async fn release_address(&self, _req: ReleaseAddressRequest) -> Result<()> {
            Ok(())
        }
    }

    async fn post_json(path: &str, body: Value) -> (StatusCode, Value) {
        let app = router(Arc::new(FakeIpam));
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
        let value = serde_json::from_slice(&bytes).unwrap();
        (status, value)
    }

    #[tokio::test]
    async fn activate_advertises_the_ipam_driver() {
        let (status, body) = post_json("/Plugin.Activate", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "Implements": ["IpamDriver"] }));
    }

    #[tokio::test]
    async fn capabilities_use_docker_field_spelling() {
        let (status, body) = post_json("/IpamDriver.GetCapabilities", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "RequiresMACAddress": false }));
    }

    #[tokio::test]
    async fn default_address_spaces() {
        let (status, body) = post_json("/IpamDriver.GetDefaultAddressSpaces", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "LocalDefaultAddressSpace": "arp-ipam-default",
                "GlobalDefaultAddressSpace": "arp-ipam-default",
            })
        );
    }

    #[tokio::test]
    async fn request_pool_round_trip() {
        let (status, body) = post_json(
            "/IpamDriver.RequestPool",
            json!({ "Pool": "10.1.6.0/24", "SubPool": "", "V6": false }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["PoolID"], "10.1.6.0/24");
        assert_eq!(body["Pool"], "10.1.6.0/24");
    }

    #[tokio::test]
    async fn errors_map_to_the_err_field() {
        let (status, body) = post_json("/IpamDriver.RequestPool", json!({ "Pool": "" })).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["Err"], "automatic pool assignment not supported");
    }

    #[tokio::test]
    async fn address_in_use_is_reported() {
        let (status, body) = post_json(
            "/IpamDriver.RequestAddress",
            json!({ "PoolID": "10.1.6.0/24", "Address": "10.1.6.51" }),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["Err"], "address already in use: 10.1.6.51");
    }

    #[tokio::test]
    async fn release_operations_return_an_empty_object() {
        let (status, body) = post_json(
            "/IpamDriver.ReleasePool",
            json!({ "PoolID": "10.1.6.0/24" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
    }

    #[test]
    fn bind_addresses_may_omit_the_host() {
        assert_eq!(normalize_bind_addr(":8080"), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn request_wire_fields_deserialize() {
        let req: RequestAddressRequest = serde_json::from_str(
            r#"{ "PoolID": "10.1.6.0/24", "Address": "10.1.6.1",
                 "Options": { "RequestAddressType": "com.docker.network.gateway" } }"#,
        )
        .unwrap();
        assert_eq!(req.pool_id, "10.1.6.0/24");
        assert_eq!(req.address, "10.1.6.1");
        assert_eq!(
            req.options.get(REQUEST_ADDRESS_TYPE_OPTION).unwrap(),
            GATEWAY_ADDRESS_TYPE
        );
    }
}
