// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the HTTP surface and the HTTP communication service.

#![cfg(feature = "http")]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::test_persistence;
use serde_json::Value;
use vvrte_core::entities::{RealVehicle, RealVehicleType, VirtualVehicle, VirtualVehicleState};
use vvrte_node::migrator::{ChunkProperties, MigrationChunk};
use vvrte_core::persistence::{Persistence, SqlitePersistence};
use vvrte_node::http::HttpCommunicationService;
use vvrte_node::runtime::NodeRuntime;
use vvrte_node::script::MockScriptRuntime;

struct HttpNode {
    runtime: NodeRuntime,
    persistence: Arc<SqlitePersistence>,
    base: String,
}

impl HttpNode {
    async fn start(name: &str) -> Self {
        Self::start_with_body_limit(name, None).await
    }

    async fn start_with_body_limit(name: &str, max_body_bytes: Option<usize>) -> Self {
        let persistence = test_persistence().await;
        let mut builder = NodeRuntime::builder();
        if let Some(limit) = max_body_bytes {
            builder = builder.max_connector_body_bytes(limit);
        }
        let runtime = builder
            .persistence(persistence.clone())
            .script_runtime(Arc::new(MockScriptRuntime::new()))
            .communication(Arc::new(HttpCommunicationService::new()))
            .real_vehicle_name(name)
            .stuck_sweep_interval(Duration::from_secs(3600))
            .queue_drain_interval(Duration::from_secs(3600))
            .http_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");
        let addr = runtime.http_addr().expect("HTTP server running");

        Self {
            runtime,
            persistence,
            base: format!("http://{}", addr),
        }
    }

    async fn register(&self, name: &str, url: &str, vehicle_type: RealVehicleType) {
        self.persistence
            .insert_real_vehicle(&RealVehicle::new(name, url, vehicle_type))
            .await
            .unwrap();
    }

    async fn insert_vehicle(&self, name: &str) -> VirtualVehicle {
        let mut vehicle = VirtualVehicle::new(name, 1, "// http");
        vehicle.id = self.persistence.insert_virtual_vehicle(&vehicle).await.unwrap();
        vehicle
    }
}

async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not reached in time");
}

#[tokio::test]
async fn test_health_and_vehicle_listing() {
    let node = HttpNode::start("gs1").await;
    let client = reqwest::Client::new();

    let health = client.get(format!("{}/health", node.base)).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.json::<Value>().await.unwrap()["status"], "ok");

    let vehicle = node.insert_vehicle("vv-listed").await;
    let list: Value = client
        .get(format!("{}/vehicles", node.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let entries = list.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["id"], vehicle.id);
    assert_eq!(entries[0]["uuid"], vehicle.uuid.as_str());
    assert_eq!(entries[0]["state"], "INIT");

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_endpoints_map_errors_to_status_codes() {
    let node = HttpNode::start("gs1").await;
    node.register("gs1", &node.base, RealVehicleType::GroundStation)
        .await;
    let client = reqwest::Client::new();

    let vehicles = futures::future::join_all(
        ["vv-a", "vv-b", "vv-c"].map(|name| node.insert_vehicle(name)),
    )
    .await;

    let responses = futures::future::join_all(vehicles.iter().map(|vv| {
        client
            .post(format!("{}/vehicles/{}/start", node.base, vv.id))
            .send()
    }))
    .await;
    for response in responses {
        let response = response.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.json::<Value>().await.unwrap()["status"], "accepted");
    }

    node.runtime.wait_idle().await;
    for vv in &vehicles {
        let stored = node.persistence.get_virtual_vehicle(vv.id).await.unwrap().unwrap();
        assert_eq!(stored.state, VirtualVehicleState::Finished);
    }

    let conflict = client
        .post(format!("{}/vehicles/{}/start", node.base, vehicles[0].id))
        .send()
        .await
        .unwrap();
    assert_eq!(conflict.status(), 409);
    assert_eq!(conflict.json::<Value>().await.unwrap()["code"], "INVALID_STATE");

    let missing = client
        .post(format!("{}/vehicles/4711/resume", node.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let restarted = client
        .post(format!("{}/vehicles/{}/restart", node.base, vehicles[1].id))
        .send()
        .await
        .unwrap();
    assert_eq!(restarted.status(), 200);

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connectors_reject_empty_payloads() {
    let node = HttpNode::start("gs1").await;
    let client = reqwest::Client::new();

    for connector in ["migration", "migration-ack"] {
        let response = client
            .post(format!("{}/connector/{}", node.base, connector))
            .body(Vec::<u8>::new())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "{}", connector);
        assert_eq!(
            response.json::<Value>().await.unwrap()["code"],
            "VALIDATION_ERROR"
        );
    }

    // Garbage is accepted as a job and fails there, leaving nothing behind.
    let accepted = client
        .post(format!("{}/connector/migration", node.base))
        .body(b"not an archive".to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);
    let job_id = accepted.json::<Value>().await.unwrap()["job_id"]
        .as_i64()
        .unwrap();

    node.runtime.wait_idle().await;
    let job = node.persistence.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, vvrte_core::entities::JobStatus::Failed);
    assert!(node.persistence.list_virtual_vehicles().await.unwrap().is_empty());

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_finished_vehicle_migrates_over_http() {
    let rv1 = HttpNode::start("rv1").await;
    let gs1 = HttpNode::start("gs1").await;

    for node in [&rv1, &gs1] {
        node.register("rv1", &rv1.base, RealVehicleType::Quadrocopter)
            .await;
        node.register("gs1", &gs1.base, RealVehicleType::GroundStation)
            .await;
    }

    let vehicle = rv1.insert_vehicle("vv-remote").await;
    rv1.runtime.launcher().start(vehicle.id).await.unwrap();

    let gs1_persistence = gs1.persistence.clone();
    let uuid = vehicle.uuid.clone();
    wait_for(|| {
        let persistence = gs1_persistence.clone();
        let uuid = uuid.clone();
        async move {
            matches!(
                persistence.find_virtual_vehicle_by_uuid(&uuid).await,
                Ok(Some(vv)) if vv.state == VirtualVehicleState::Finished
            )
        }
    })
    .await;

    let rv1_persistence = rv1.persistence.clone();
    let id = vehicle.id;
    wait_for(|| {
        let persistence = rv1_persistence.clone();
        async move { matches!(persistence.get_virtual_vehicle(id).await, Ok(None)) }
    })
    .await;

    rv1.runtime.shutdown().await.unwrap();
    gs1.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_client_reports_refused_payloads() {
    use vvrte_core::communication::{CommunicationService, MIGRATION_CONNECTOR};

    let node = HttpNode::start("gs1").await;
    let target = RealVehicle::new("gs1", format!("{}/", node.base), RealVehicleType::GroundStation);

    let response = HttpCommunicationService::new()
        .transfer(&target, MIGRATION_CONNECTOR, &[])
        .await
        .unwrap();
    assert!(!response.is_ok());
    assert!(response.content_text().contains("VALIDATION_ERROR"));

    let offline = RealVehicle::new("gone", "http://127.0.0.1:1", RealVehicleType::Robot);
    let err = HttpCommunicationService::new()
        .transfer(&offline, MIGRATION_CONNECTOR, b"x")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "TRANSFER_ERROR");

    node.runtime.shutdown().await.unwrap();
}

fn chunk_with_continuation(uuid: &str, continuation: Vec<u8>) -> MigrationChunk {
    MigrationChunk {
        properties: ChunkProperties {
            name: "vv-heavy".to_string(),
            uuid: uuid.to_string(),
            api_version: 1,
            pre_migration_state: Some(VirtualVehicleState::Finished),
            state_info: None,
            chunk_number: 0,
            migration_source: Some("rv1".to_string()),
            start_time: None,
            end_time: None,
            last_chunk: true,
        },
        code: Some("// heavy".to_string()),
        continuation: Some(continuation),
        storage: vec![],
    }
}

#[tokio::test]
async fn test_migration_connector_accepts_chunks_above_two_mebibytes() {
    let node = HttpNode::start("gs1").await;
    // Nobody listens for rv1, so only the acknowledgement fails.
    node.register("rv1", "http://127.0.0.1:1", RealVehicleType::Quadrocopter)
        .await;

    let uuid = "6a1f4c1e-0000-4000-8000-000000000003";
    let snapshot = vec![7u8; 3 * 1024 * 1024];
    let payload = chunk_with_continuation(uuid, snapshot.clone())
        .encode(chrono::Utc::now())
        .unwrap();
    assert!(payload.len() > 2 * 1024 * 1024);

    let response = reqwest::Client::new()
        .post(format!("{}/connector/migration", node.base))
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    node.runtime.wait_idle().await;
    let stored = node
        .persistence
        .find_virtual_vehicle_by_uuid(uuid)
        .await
        .unwrap()
        .expect("chunk was stored");
    assert_eq!(stored.continuation.map(|c| c.len()), Some(snapshot.len()));

    node.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_migration_connector_enforces_configured_limit() {
    let node = HttpNode::start_with_body_limit("gs1", Some(1024)).await;

    let payload = chunk_with_continuation("6a1f4c1e-0000-4000-8000-000000000004", vec![1u8; 4096])
        .encode(chrono::Utc::now())
        .unwrap();
    let response = reqwest::Client::new()
        .post(format!("{}/connector/migration", node.base))
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 413);

    node.runtime.wait_idle().await;
    assert!(node.persistence.list_virtual_vehicles().await.unwrap().is_empty());

    node.runtime.shutdown().await.unwrap();
}
