// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for vvrte-node integration tests.
//!
//! Every [`TestNode`] runs a full [`NodeRuntime`] on its own in-memory SQLite
//! database. Nodes talk to each other through a [`LoopbackNetwork`], which
//! hands connector payloads straight to the destination node's migrator.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use vvrte_core::CoreError;
use vvrte_core::communication::{
    CommunicationResponse, CommunicationService, MIGRATION_ACK_CONNECTOR, MIGRATION_CONNECTOR,
};
use vvrte_core::entities::{
    RealVehicle, RealVehicleType, VirtualVehicle, VirtualVehicleState, VirtualVehicleStorage,
};
use vvrte_core::geodesy::PolarCoordinate;
use vvrte_core::persistence::{Persistence, SqlitePersistence};
use vvrte_node::migrator::Migrator;
use vvrte_node::runtime::NodeRuntime;
use vvrte_node::script::MockScriptRuntime;

/// Area of rv1: lng 13.00..13.02, lat 47.80..47.82.
pub const RV1_AREA: &str = r#"{"type":"Polygon","coordinates":[[[13.00,47.80],[13.02,47.80],[13.02,47.82],[13.00,47.82],[13.00,47.80]]]}"#;

/// Area of rv2: lng 13.03..13.05, lat 47.80..47.84.
pub const RV2_AREA: &str = r#"{"type":"Polygon","coordinates":[[[13.03,47.80],[13.05,47.80],[13.05,47.84],[13.03,47.84],[13.03,47.80]]]}"#;

/// A position inside the area of rv1.
pub fn rv1_position() -> PolarCoordinate {
    PolarCoordinate::new(47.81, 13.01, 20.0)
}

/// A position inside the area of rv2 only.
pub fn rv2_position() -> PolarCoordinate {
    PolarCoordinate::new(47.8229, 13.0408, 20.0)
}

/// A position no real vehicle operates at.
pub fn nowhere() -> PolarCoordinate {
    PolarCoordinate::new(48.5, 14.5, 20.0)
}

/// URL of a node on the loopback network.
pub fn url_of(name: &str) -> String {
    format!("loop://{}", name)
}

/// Create an in-memory SQLite pool with the schema applied.
pub async fn test_persistence() -> Arc<SqlitePersistence> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    vvrte_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqlitePersistence::new(pool))
}

/// Register the fleet every node knows: rv1, rv2 and the ground station gs1.
pub async fn register_fleet(persistence: &dyn Persistence) {
    let mut rv1 = RealVehicle::new("rv1", url_of("rv1"), RealVehicleType::Quadrocopter);
    rv1.area_of_operation = Some(RV1_AREA.to_string());
    let mut rv2 = RealVehicle::new("rv2", url_of("rv2"), RealVehicleType::Quadrocopter);
    rv2.area_of_operation = Some(RV2_AREA.to_string());
    let gs1 = RealVehicle::new("gs1", url_of("gs1"), RealVehicleType::GroundStation);

    for vehicle in [rv1, rv2, gs1] {
        persistence
            .insert_real_vehicle(&vehicle)
            .await
            .expect("Failed to register real vehicle");
    }
}

// ============================================================================
// Loopback network
// ============================================================================

/// In-process transport between test nodes, keyed by real vehicle URL.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: Mutex<HashMap<String, Weak<Migrator>>>,
    offline: Mutex<HashSet<String>>,
    deliveries_left: Mutex<HashMap<String, usize>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route payloads for `url` to `migrator`.
    pub fn attach(&self, url: &str, migrator: &Arc<Migrator>) {
        self.nodes
            .lock()
            .unwrap()
            .insert(url.to_string(), Arc::downgrade(migrator));
    }

    /// Refuse every payload addressed to the real vehicle `name`.
    ///
    /// Bringing a vehicle back online also lifts its delivery limit.
    pub fn set_offline(&self, name: &str, offline: bool) {
        let mut set = self.offline.lock().unwrap();
        if offline {
            set.insert(name.to_string());
        } else {
            set.remove(name);
            self.deliveries_left.lock().unwrap().remove(name);
        }
    }

    /// Deliver `count` more payloads to `name`, then refuse the rest.
    pub fn limit_deliveries(&self, name: &str, count: usize) {
        self.deliveries_left
            .lock()
            .unwrap()
            .insert(name.to_string(), count);
    }

    fn reachable(&self, name: &str) -> bool {
        if self.offline.lock().unwrap().contains(name) {
            return false;
        }
        match self.deliveries_left.lock().unwrap().get_mut(name) {
            Some(0) => false,
            Some(left) => {
                *left -= 1;
                true
            }
            None => true,
        }
    }

    fn migrator_for(&self, url: &str) -> Option<Arc<Migrator>> {
        self.nodes.lock().unwrap().get(url).and_then(Weak::upgrade)
    }
}

#[async_trait]
impl CommunicationService for LoopbackNetwork {
    async fn transfer(
        &self,
        destination: &RealVehicle,
        connector: &str,
        payload: &[u8],
    ) -> vvrte_core::Result<CommunicationResponse> {
        if !self.reachable(&destination.name) {
            return Ok(CommunicationResponse::failed(format!(
                "{} is unreachable",
                destination.name
            )));
        }

        let migrator = self.migrator_for(&destination.url).ok_or_else(|| {
            CoreError::transfer(format!("no node listening at {}", destination.url))
        })?;

        let result = match connector {
            MIGRATION_CONNECTOR => migrator.queue_chunk(payload.to_vec()).await,
            MIGRATION_ACK_CONNECTOR => migrator.ack_chunk(payload.to_vec()).await,
            other => {
                return Ok(CommunicationResponse::failed(format!(
                    "unknown connector {}",
                    other
                )));
            }
        };

        Ok(match result {
            Ok(_) => CommunicationResponse::ok(),
            Err(e) => CommunicationResponse::failed(e.to_string()),
        })
    }
}

// ============================================================================
// Test nodes
// ============================================================================

/// One running node of the test fleet.
pub struct TestNode {
    pub name: String,
    pub runtime: NodeRuntime,
    pub scripts: MockScriptRuntime,
    pub persistence: Arc<SqlitePersistence>,
}

impl TestNode {
    /// Start node `name` with the default chunk size.
    pub async fn start(network: &Arc<LoopbackNetwork>, name: &str) -> Self {
        Self::start_with_chunk_size(network, name, vvrte_node::migrator::DEFAULT_CHUNK_SIZE).await
    }

    /// Start node `name` attached to `network`.
    pub async fn start_with_chunk_size(
        network: &Arc<LoopbackNetwork>,
        name: &str,
        chunk_size: usize,
    ) -> Self {
        let persistence = test_persistence().await;
        register_fleet(persistence.as_ref()).await;
        let scripts = MockScriptRuntime::new();

        let runtime = NodeRuntime::builder()
            .persistence(persistence.clone())
            .script_runtime(Arc::new(scripts.clone()))
            .communication(network.clone())
            .real_vehicle_name(name)
            .migration_chunk_size(chunk_size)
            .stuck_sweep_interval(Duration::from_secs(3600))
            .queue_drain_interval(Duration::from_secs(3600))
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        network.attach(&url_of(name), runtime.migrator());

        Self {
            name: name.to_string(),
            runtime,
            scripts,
            persistence,
        }
    }

    /// Insert a new INIT vehicle with `entries` storage items named `key-00`, `key-01`, ...
    pub async fn create_vehicle(&self, name: &str, entries: usize) -> VirtualVehicle {
        let mut vehicle = VirtualVehicle::new(name, 1, format!("// code of {}", name));
        vehicle.id = self
            .persistence
            .insert_virtual_vehicle(&vehicle)
            .await
            .expect("Failed to insert virtual vehicle");

        for index in 0..entries {
            self.persistence
                .save_storage_item(&VirtualVehicleStorage {
                    id: 0,
                    vehicle_id: vehicle.id,
                    name: format!("key-{:02}", index),
                    modification_time: chrono::Utc::now(),
                    content: format!("value {}", index).into_bytes(),
                })
                .await
                .expect("Failed to save storage item");
        }
        vehicle
    }

    pub async fn vehicle(&self, id: i64) -> Option<VirtualVehicle> {
        self.persistence
            .get_virtual_vehicle(id)
            .await
            .expect("Failed to load virtual vehicle")
    }

    pub async fn vehicle_by_uuid(&self, uuid: &str) -> Option<VirtualVehicle> {
        self.persistence
            .find_virtual_vehicle_by_uuid(uuid)
            .await
            .expect("Failed to load virtual vehicle")
    }

    pub async fn state_of(&self, id: i64) -> VirtualVehicleState {
        self.vehicle(id).await.expect("virtual vehicle exists").state
    }

    /// Storage of a vehicle as `(name, content)` pairs, ordered by name.
    pub async fn storage_of(&self, vehicle_id: i64) -> Vec<(String, String)> {
        self.persistence
            .list_storage_items_after(vehicle_id, "", 1000)
            .await
            .expect("Failed to list storage")
            .into_iter()
            .map(|item| (item.name, String::from_utf8_lossy(&item.content).into_owned()))
            .collect()
    }

    fn busy(&self) -> bool {
        let jobs = self.runtime.jobs();
        [vvrte_core::jobs::VEHICLE_QUEUE, vvrte_core::jobs::MIGRATION_QUEUE]
            .iter()
            .any(|name| jobs.queue(name).map(|q| q.running_count() > 0).unwrap_or(false))
    }
}

/// Wait until no job runs on any of `nodes`.
///
/// A job hands work to another node before it ends, so the fleet is settled
/// once a full pass sees every node idle twice in a row.
pub async fn settle(nodes: &[&TestNode]) {
    let result = tokio::time::timeout(Duration::from_secs(20), async {
        let mut quiet_passes = 0;
        while quiet_passes < 2 {
            for node in nodes {
                node.runtime.wait_idle().await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            if nodes.iter().any(|node| node.busy()) {
                quiet_passes = 0;
            } else {
                quiet_passes += 1;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "fleet did not settle in time");
}
