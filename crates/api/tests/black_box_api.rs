use std::sync::Arc;

use chrono::Utc;
use regsync_api::app::services::{wire, Engine};
use regsync_core::{EmployeeId, TenantId};
use regsync_infra::alerts::InMemoryAlertSink;
use regsync_infra::config::SyncConfig;
use regsync_infra::registry::ScriptedRegistryClient;
use regsync_infra::registry::scripted::accepted_receipt;
use regsync_infra::store::{ConnectionStore, InMemorySyncStore, OutboxStore};
use regsync_infra::vault::{CredentialVault, RegistryCredentials};
use regsync_infra::writer::OutboxWriter;
use regsync_outbox::{
    Connection, EntityRef, InboundResult, MessageKind, Mutation, OutboxMessage, ResultEntity,
    ResultOutcome,
};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    store: Arc<InMemorySyncStore>,
    registry: Arc<ScriptedRegistryClient>,
    engine: Engine,
    connection: Connection,
}

impl TestServer {
    async fn spawn() -> Self {
        let config = SyncConfig::from_lookup(|var| match var {
            "REGISTRY_BASE_URL" => Some("http://registry.invalid".to_string()),
            "REGSYNC_CREDENTIAL_KEYS" => {
                Some("1:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string())
            }
            _ => None,
        })
        .unwrap();

        let store = InMemorySyncStore::arc();
        let registry = Arc::new(ScriptedRegistryClient::new());
        let vault = Arc::new(config.vault().unwrap());

        let tenant = TenantId::new();
        let sealed = vault.seal(tenant, &RegistryCredentials::new("acme", "pw")).unwrap();
        let connection = Connection::new(tenant, "EMP-1", sealed, Utc::now());
        store.insert_connection(&connection).await.unwrap();

        let (services, engine) = wire(
            store.clone(),
            registry.clone(),
            vault,
            Arc::new(InMemoryAlertSink::new()),
            &config,
        );

        // Same router as prod, bound to an ephemeral port.
        let app = regsync_api::app::build_app(services);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle, store, registry, engine, connection }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn enqueue(&self, mutation: Mutation) -> OutboxMessage {
        let mut unit = self.store.begin();
        let message = OutboxWriter::new(8)
            .enqueue(&mut unit, &self.connection, self.connection.tenant_id, mutation)
            .await
            .unwrap();
        unit.commit().unwrap();
        message
    }

    async fn dispatch(&self) {
        self.engine.dispatcher.run_once(Utc::now()).await.unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(srv.url("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn webhook_receipt_reconciles_once() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let emp = EmployeeId::new();
    let msg = srv
        .enqueue(Mutation::employee(MessageKind::EmployeeCreate, emp, json!({"name": "Ada"})))
        .await;

    // Scripted registry answers `pending_validation` by default.
    srv.dispatch().await;

    let receipt = accepted_receipt(
        msg.id,
        vec![InboundResult {
            outcome: ResultOutcome::Success,
            entities: vec![ResultEntity { entity: EntityRef::Employee(emp), registry_id: Some("R-1".into()) }],
            details: None,
        }],
    );

    let res = client.post(srv.url("/registry/receipts")).json(&receipt).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "accepted");

    let res = client.post(srv.url("/registry/receipts")).json(&receipt).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["outcome"], "duplicate");

    let res = client.get(srv.url(&format!("/messages/{}", msg.id))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let detail: serde_json::Value = res.json().await.unwrap();
    assert_eq!(detail["message"]["status"], "accepted");
    assert_eq!(detail["receipts"].as_array().unwrap().len(), 2);
    assert_eq!(detail["results"].as_array().unwrap().len(), 1);

    let res = client
        .get(srv.url(&format!("/organizations/{}/stats", srv.connection.tenant_id)))
        .send()
        .await
        .unwrap();
    let stats: serde_json::Value = res.json().await.unwrap();
    assert_eq!(stats["accepted"], 1);
    assert_eq!(stats["queued"], 0);
}

#[tokio::test]
async fn webhook_for_unknown_message_is_not_found() {
    let srv = TestServer::spawn().await;
    let receipt = accepted_receipt(regsync_core::MessageId::new(), vec![]);
    let res = reqwest::Client::new()
        .post(srv.url("/registry/receipts"))
        .json(&receipt)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn webhook_receipt_without_results_is_refused_and_dispatch_continues() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let msg = srv
        .enqueue(Mutation::employee(MessageKind::EmployeeCreate, EmployeeId::new(), json!({})))
        .await;
    srv.dispatch().await;

    let forged = accepted_receipt(msg.id, vec![]);
    let res = client.post(srv.url("/registry/receipts")).json(&forged).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "unprocessable_receipt");

    let stored = srv.store.get_message(msg.id).await.unwrap().unwrap();
    assert_eq!(stored.status, regsync_outbox::MessageStatus::Sent);
    let conn = srv.store.get_connection(srv.connection.id).await.unwrap().unwrap();
    assert_eq!(conn.status, regsync_outbox::ConnectionStatus::Active);

    // The connection still dispatches.
    srv.enqueue(Mutation::employee(MessageKind::EmployeeCreate, EmployeeId::new(), json!({})))
        .await;
    srv.registry.push_accepted();
    srv.dispatch().await;
    assert_eq!(srv.registry.submitted().len(), 2);
}

#[tokio::test]
async fn rejected_message_replays_as_a_fresh_copy() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let msg = srv
        .enqueue(Mutation::employee(MessageKind::EmployeeUpdate, EmployeeId::new(), json!({"cor": "x"})))
        .await;
    srv.registry.push_rejected("invalid COR code");
    srv.dispatch().await;

    let res = client
        .get(srv.url(&format!("/connections/{}/messages/open", srv.connection.id)))
        .send()
        .await
        .unwrap();
    let open: serde_json::Value = res.json().await.unwrap();
    assert!(open.as_array().unwrap().is_empty());

    let res = client.post(srv.url(&format!("/messages/{}/replay", msg.id))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let copy: serde_json::Value = res.json().await.unwrap();
    assert_eq!(copy["status"], "queued");
    assert_eq!(copy["attempts"], 0);
    assert_eq!(copy["replay_of"], msg.id.to_string());

    let original = srv.store.get_message(msg.id).await.unwrap().unwrap();
    assert_eq!(original.status, regsync_outbox::MessageStatus::Rejected);

    let res = client
        .get(srv.url(&format!("/connections/{}/messages/open", srv.connection.id)))
        .send()
        .await
        .unwrap();
    let open: serde_json::Value = res.json().await.unwrap();
    assert_eq!(open.as_array().unwrap().len(), 1);

    // Only failed messages replay.
    let res = client
        .post(srv.url(&format!("/messages/{}/replay", copy["id"].as_str().unwrap())))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn reactivation_restores_a_failed_connection() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let msg = srv
        .enqueue(Mutation::employee(MessageKind::EmployeeCreate, EmployeeId::new(), json!({})))
        .await;
    srv.registry.push_unauthorized();
    srv.dispatch().await;

    let conn = srv.store.get_connection(srv.connection.id).await.unwrap().unwrap();
    assert_eq!(conn.status, regsync_outbox::ConnectionStatus::Error);

    let res = client
        .post(srv.url(&format!("/connections/{}/reactivate", srv.connection.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "active");
    assert!(body.get("credentials").is_none());

    srv.registry.push_accepted();
    srv.dispatch().await;
    let stored = srv.store.get_message(msg.id).await.unwrap().unwrap();
    assert_eq!(stored.status, regsync_outbox::MessageStatus::Accepted);
}

#[tokio::test]
async fn drift_report_is_served_after_a_run() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let path = format!("/organizations/{}/drift/latest", srv.connection.tenant_id);

    let res = client.get(srv.url(&path)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    srv.engine.drift.run_once(Utc::now()).await.unwrap();

    let res = client.get(srv.url(&path)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let report: serde_json::Value = res.json().await.unwrap();
    assert_eq!(report["connection_id"], srv.connection.id.to_string());
    assert!(report["entries"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn error_list_shows_exhausted_and_superseded_messages() {
    let srv = TestServer::spawn().await;
    let emp = EmployeeId::new();
    srv.enqueue(Mutation::employee(MessageKind::EmployeeUpdate, emp, json!({})))
        .await;
    srv.enqueue(Mutation::employee(MessageKind::EmployeeDelete, emp, json!({})))
        .await;
    srv.registry.push_accepted();
    srv.dispatch().await;

    let res = reqwest::get(srv.url(&format!(
        "/organizations/{}/messages/errors?limit=10",
        srv.connection.tenant_id
    )))
    .await
    .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let errors: serde_json::Value = res.json().await.unwrap();
    let errors = errors.as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["last_error"].as_str().unwrap().starts_with("superseded by"));
}
