//! End-to-end client workflows against a mocked Incus server.

use std::time::Duration;

use secrecy::SecretString;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use incus_client::{
    CertificateCreate, Client, ClientBuilder, ClusterMemberStatus, Created, Error,
    InstanceCreate, InstanceSource, OperationStatus, Outcome, RetryPolicy, StateOptions,
};

fn sync(metadata: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "type": "sync",
        "status": "Success",
        "status_code": 200,
        "operation": "",
        "error_code": 0,
        "error": "",
        "metadata": metadata
    }))
}

fn operation(id: &str, status: &str, status_code: u16) -> Value {
    json!({
        "id": id,
        "class": "task",
        "description": "Test operation",
        "created_at": "2024-05-02T07:10:00Z",
        "updated_at": "2024-05-02T07:10:01Z",
        "status": status,
        "status_code": status_code,
        "resources": {},
        "metadata": null,
        "may_cancel": false,
        "err": "",
        "location": "none"
    })
}

fn accepted(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(202).set_body_json(json!({
        "type": "async",
        "status": "Operation created",
        "status_code": 100,
        "operation": format!("/1.0/operations/{id}"),
        "error_code": 0,
        "error": "",
        "metadata": operation(id, "Running", 103)
    }))
}

fn not_found(message: &str) -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(json!({
        "type": "error",
        "error": message,
        "error_code": 404
    }))
}

fn instance(name: &str, status: &str) -> Value {
    json!({
        "name": name,
        "type": "container",
        "status": status,
        "status_code": if status == "Running" { 103 } else { 102 },
        "config": {},
        "devices": {},
        "profiles": ["default"]
    })
}

#[tokio::test]
async fn list_returns_one_model_per_element() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances"))
        .and(query_param("recursion", "1"))
        .respond_with(sync(json!([
            instance("a", "Running"),
            instance("b", "Stopped"),
            instance("c", "Running")
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let instances = client.instances().list().await.unwrap();

    let names: Vec<&str> = instances.iter().map(|instance| instance.key()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(instances.iter().filter(|instance| instance.is_running()).count(), 2);
}

#[tokio::test]
async fn get_missing_instance_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/ghost"))
        .respond_with(not_found("Instance not found"))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let err = client.instances().get("ghost").await.unwrap_err();

    match &err {
        Error::NotFound(failure) => assert_eq!(failure.message, "Instance not found"),
        other => panic!("expected NotFound, got {other:?}"),
    }
    assert!(!client.instances().exists("ghost").await.unwrap());
}

#[tokio::test]
async fn project_scope_is_sent_for_scoped_kinds_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/profiles"))
        .and(query_param("project", "dev"))
        .respond_with(sync(json!([{"name": "default"}])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/storage-pools"))
        .and(query_param_is_missing("project"))
        .respond_with(sync(json!([{"name": "default", "driver": "dir"}])))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder(server.uri())
        .unwrap()
        .with_project("dev")
        .build()
        .unwrap();

    assert_eq!(client.profiles().list().await.unwrap().len(), 1);
    assert_eq!(client.storage_pools().list().await.unwrap()[0].driver, "dir");
}

#[tokio::test]
async fn create_with_wait_follows_operation_then_fetches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1.0/instances"))
        .and(body_partial_json(json!({
            "name": "web02",
            "source": {"type": "image", "alias": "alpine/edge"}
        })))
        .respond_with(accepted("op-create"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/operations/op-create/wait"))
        .and(query_param("timeout", "30"))
        .respond_with(sync(operation("op-create", "Success", 200)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/web02"))
        .respond_with(sync(instance("web02", "Stopped")))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let request = InstanceCreate::new("web02", InstanceSource::image_alias("alpine/edge"));
    let created = client.instances().create(&request, true).await.unwrap();

    let instance = created.into_resource().expect("instance should be ready");
    assert_eq!(instance.name, "web02");
    assert_eq!(instance.status, "Stopped");
}

#[tokio::test]
async fn create_failure_surfaces_operation_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1.0/instances"))
        .respond_with(accepted("op-bad"))
        .mount(&server)
        .await;
    let mut failed = operation("op-bad", "Failure", 400);
    failed["err"] = json!("Failed creating instance from image: no space left");
    Mock::given(method("GET"))
        .and(path("/1.0/operations/op-bad/wait"))
        .respond_with(sync(failed))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let request = InstanceCreate::new("web03", InstanceSource::image_alias("alpine/edge"));
    let err = client.instances().create(&request, true).await.unwrap_err();

    match err {
        Error::Operation(operation) => {
            assert_eq!(operation.status, OperationStatus::Failure);
            assert!(operation.err.contains("no space left"));
        }
        other => panic!("expected operation error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_without_wait_returns_tracker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1.0/instances"))
        .respond_with(accepted("op-later"))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let request = InstanceCreate::new("web04", InstanceSource::none());
    let created = client.instances().create(&request, false).await.unwrap();

    match created {
        Created::Pending(tracker) => {
            assert_eq!(tracker.id(), "op-later");
            assert_eq!(tracker.status(), OperationStatus::Running);
        }
        Created::Ready(_) => panic!("creation should still be pending"),
    }
}

#[tokio::test]
async fn waiting_on_pending_delete_does_not_resend_delete() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/1.0/instances/old"))
        .respond_with(accepted("op-del"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/operations/op-del/wait"))
        .respond_with(sync(operation("op-del", "Success", 200)))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let outcome = client.instances().delete("old", false).await.unwrap();
    assert!(outcome.is_pending());

    let mut tracker = outcome.into_tracker().unwrap();
    let finished = tracker.wait(None).await.unwrap();
    assert!(finished.is_success());

    // A second wait is answered from the recorded terminal state.
    let again = tracker.wait(None).await.unwrap();
    assert_eq!(again.status, OperationStatus::Success);
}

#[tokio::test]
async fn wait_times_out_with_last_status() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/1.0/instances/slow/state"))
        .and(body_partial_json(json!({"action": "stop"})))
        .respond_with(accepted("op-slow"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/slow"))
        .respond_with(sync(instance("slow", "Running")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/operations/op-slow/wait"))
        .respond_with(
            sync(operation("op-slow", "Success", 200)).set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let instance = client.instances().get("slow").await.unwrap();
    let mut tracker = instance
        .stop(StateOptions::new(), false)
        .await
        .unwrap()
        .into_tracker()
        .unwrap();

    let err = tracker
        .wait(Some(Duration::from_millis(500)))
        .await
        .unwrap_err();
    match err {
        Error::OperationTimeout {
            id, last_status, ..
        } => {
            assert_eq!(id, "op-slow");
            assert_eq!(last_status, OperationStatus::Running);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(!tracker.is_done());
}

#[tokio::test]
async fn start_with_wait_completes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/web01"))
        .respond_with(sync(instance("web01", "Stopped")))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/1.0/instances/web01/state"))
        .and(body_partial_json(json!({"action": "start", "force": false})))
        .respond_with(accepted("op-start"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/operations/op-start/wait"))
        .respond_with(sync(operation("op-start", "Success", 200)))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let instance = client.instances().get("web01").await.unwrap();
    let outcome = instance.start(StateOptions::new(), true).await.unwrap();

    match outcome.into_success().unwrap() {
        Outcome::Completed(operation) => assert_eq!(operation.id, "op-start"),
        other => panic!("expected completed operation, got {other:?}"),
    }
}

#[tokio::test]
async fn image_lookup_by_alias() {
    let server = MockServer::start().await;
    let fingerprint = "06b86454720d36b20f94e31c6812e05ec51c1b568cf3a8abd273769d213394bb";
    Mock::given(method("GET"))
        .and(path("/1.0/images/aliases/alpine"))
        .respond_with(sync(json!({
            "name": "alpine",
            "target": fingerprint,
            "description": ""
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/1.0/images/{fingerprint}")))
        .respond_with(sync(json!({
            "fingerprint": fingerprint,
            "aliases": [{"name": "alpine", "description": ""}],
            "properties": {"os": "Alpine"},
            "size": 3108892
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/1.0/images/aliases"))
        .and(body_partial_json(json!({"name": "latest", "target": fingerprint})))
        .respond_with(sync(Value::Null))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let images = client.images();
    let image = images.get_by_alias("alpine").await.unwrap();
    assert_eq!(image.key(), fingerprint);
    assert!(image.has_alias("alpine"));

    images.create_alias("latest", fingerprint, "").await.unwrap();
}

#[tokio::test]
async fn cluster_with_members() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/cluster"))
        .respond_with(sync(json!({"server_name": "node1", "enabled": true})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/cluster/members"))
        .and(query_param("recursion", "1"))
        .respond_with(sync(json!([
            {"server_name": "node1", "status": "Online", "url": "https://10.0.0.11:8443"},
            {"server_name": "node2", "status": "Offline", "message": "No heartbeat"}
        ])))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let cluster = client.cluster().get().await.unwrap();

    assert!(cluster.enabled);
    assert_eq!(cluster.server_name, "node1");
    assert_eq!(cluster.members.len(), 2);
    assert_eq!(cluster.members[1].status, ClusterMemberStatus::Offline);
}

#[tokio::test]
async fn certificate_created_from_token_is_located_by_name() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/1.0/certificates"))
        .and(body_partial_json(json!({
            "name": "laptop",
            "trust_token": "eyJjbGllbnRfbmFtZSI6ImxhcHRvcCJ9",
            "type": "client"
        })))
        .respond_with(sync(Value::Null))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/certificates"))
        .and(query_param("recursion", "1"))
        .respond_with(sync(json!([
            {"fingerprint": "aaa", "name": "ci", "type": "client"},
            {"fingerprint": "bbb", "name": "laptop", "type": "client"}
        ])))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let request = CertificateCreate::from_token(
        "laptop",
        SecretString::from("eyJjbGllbnRfbmFtZSI6ImxhcHRvcCJ9".to_string()),
    );
    let created = client.certificates().create(&request, true).await.unwrap();

    let certificate = created.into_resource().unwrap();
    assert_eq!(certificate.key(), "bbb");
}

#[tokio::test]
async fn concurrent_requests_share_one_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/a"))
        .respond_with(sync(instance("a", "Running")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0/instances/b"))
        .respond_with(sync(instance("b", "Stopped")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/1.0"))
        .respond_with(sync(json!({"api_version": "1.0", "auth": "trusted"})))
        .mount(&server)
        .await;

    let client = Client::new(server.uri()).unwrap();
    let instances = client.instances();
    let (a, b, info) = tokio::join!(instances.get("a"), instances.get("b"), client.server_info());

    assert!(a.unwrap().is_running());
    assert!(!b.unwrap().is_running());
    assert!(info.unwrap().is_trusted());
}

#[tokio::test]
async fn disabled_retries_send_a_single_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.0"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = ClientBuilder::new(server.uri())
        .unwrap()
        .with_retry_policy(RetryPolicy::no_retry())
        .build()
        .unwrap();

    assert!(client.server_info().await.is_err());
}
