//! Shared helpers for unit tests.

use reqwest::StatusCode;
use serde_json::{json, Value};

use incus_core::config::IncusClientConfig;
use incus_core::transport::{ApiRequest, RawResponse, Transport};

use crate::client::{Client, ClientBuilder};
use crate::Result;

mockall::mock! {
    pub Transport {}

    #[async_trait::async_trait]
    impl Transport for Transport {
        async fn send(&self, request: ApiRequest) -> Result<RawResponse>;
        fn supports_long_poll(&self) -> bool;
    }
}

/// Client with default settings talking to `transport`.
pub fn client_with(transport: MockTransport) -> Client {
    ClientBuilder::from_config(IncusClientConfig::default())
        .with_transport(transport)
        .build()
        .unwrap()
}

/// Synchronous success envelope around `metadata`.
pub fn sync_response(metadata: Value) -> RawResponse {
    RawResponse::json(
        StatusCode::OK,
        &json!({
            "type": "sync",
            "status": "Success",
            "status_code": 200,
            "operation": "",
            "error_code": 0,
            "error": "",
            "metadata": metadata
        }),
    )
}

/// Asynchronous envelope referencing operation `id`.
pub fn async_response(id: &str) -> RawResponse {
    RawResponse::json(
        StatusCode::ACCEPTED,
        &json!({
            "type": "async",
            "status": "Operation created",
            "status_code": 100,
            "operation": format!("/1.0/operations/{id}"),
            "error_code": 0,
            "error": "",
            "metadata": operation_json(id, "Running", 103)
        }),
    )
}

/// Operation payload as served by `/1.0/operations/{id}`.
pub fn operation_json(id: &str, status: &str, status_code: u16) -> Value {
    json!({
        "id": id,
        "class": "task",
        "description": "Test operation",
        "created_at": "2024-05-01T10:00:00Z",
        "updated_at": "2024-05-01T10:00:01Z",
        "status": status,
        "status_code": status_code,
        "resources": {"instances": ["/1.0/instances/c1"]},
        "metadata": null,
        "may_cancel": false,
        "err": "",
        "location": "none"
    })
}
