// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for placement decisions against a persisted fleet.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{nowhere, register_fleet, rv1_position, rv2_position, test_persistence};
use vvrte_core::entities::{OWN_REAL_VEHICLE_PARAMETER, SensorDefinition, Task};
use vvrte_core::persistence::Persistence;
use vvrte_node::mapper::Mapper;
use vvrte_node::script::resolve_task_request;

async fn mapper_for(own: Option<&str>) -> (Mapper, Arc<dyn Persistence>) {
    let persistence: Arc<dyn Persistence> = test_persistence().await;
    register_fleet(persistence.as_ref()).await;
    if let Some(name) = own {
        persistence
            .set_parameter(OWN_REAL_VEHICLE_PARAMETER, name)
            .await
            .unwrap();
    }
    (Mapper::new(persistence.clone()), persistence)
}

fn names(decision: &vvrte_node::mapper::MappingDecision) -> Vec<&str> {
    decision.candidates.iter().map(|rv| rv.name.as_str()).collect()
}

#[tokio::test]
async fn test_task_inside_own_area_stays_local() {
    let (mapper, _) = mapper_for(Some("rv1")).await;
    let task = Task::new(rv1_position(), vec![], Utc::now());

    let decision = mapper.decide(&task).await.unwrap();
    assert!(!decision.migrate);
    assert!(decision.candidates.is_empty());
    assert_eq!(decision.task, Some(task));
}

#[tokio::test]
async fn test_task_elsewhere_migrates_to_covering_vehicle() {
    let (mapper, _) = mapper_for(Some("rv1")).await;
    let task = Task::new(rv2_position(), vec![], Utc::now());

    let decision = mapper.decide(&task).await.unwrap();
    assert!(decision.migrate);
    assert_eq!(names(&decision), vec!["rv2"]);
}

#[tokio::test]
async fn test_uncovered_task_falls_back_to_ground_stations() {
    let (mapper, _) = mapper_for(Some("rv1")).await;
    let task = Task::new(nowhere(), vec![], Utc::now());

    let decision = mapper.decide(&task).await.unwrap();
    assert!(decision.migrate);
    assert_eq!(names(&decision), vec!["gs1"]);
}

#[tokio::test]
async fn test_ground_station_never_proposes_itself() {
    let (mapper, _) = mapper_for(Some("gs1")).await;
    let task = Task::new(nowhere(), vec![], Utc::now());

    let decision = mapper.decide(&task).await.unwrap();
    assert!(decision.migrate);
    assert!(decision.candidates.is_empty());
}

#[tokio::test]
async fn test_unknown_own_vehicle_defers_placement() {
    let (mapper, _) = mapper_for(None).await;
    let task = Task::new(rv1_position(), vec![], Utc::now());

    let decision = mapper.decide(&task).await.unwrap();
    assert!(decision.migrate);
    assert!(decision.candidates.is_empty());
}

#[tokio::test]
async fn test_missing_sensor_forces_migration() {
    let (mapper, persistence) = mapper_for(Some("rv1")).await;

    let camera = SensorDefinition::new(2, "Camera", "PICTURE");
    let mut rv2 = persistence
        .find_real_vehicle_by_name("rv2")
        .await
        .unwrap()
        .unwrap();
    // rv2 carries the camera and gets an area that also covers rv1's.
    rv2.sensors = vec![camera.clone()];
    rv2.area_of_operation = Some(
        r#"{"type":"Polygon","coordinates":[[[12.9,47.7],[13.1,47.7],[13.1,47.9],[12.9,47.9],[12.9,47.7]]]}"#
            .to_string(),
    );
    persistence.update_real_vehicle(&rv2).await.unwrap();

    let task = Task::new(rv1_position(), vec![camera], Utc::now());
    let decision = mapper.decide(&task).await.unwrap();
    assert!(decision.migrate);
    assert_eq!(names(&decision), vec!["rv2"]);
}

#[tokio::test]
async fn test_deleted_vehicles_are_not_candidates() {
    let (mapper, persistence) = mapper_for(Some("rv1")).await;

    let mut rv2 = persistence
        .find_real_vehicle_by_name("rv2")
        .await
        .unwrap()
        .unwrap();
    rv2.deleted = true;
    persistence.update_real_vehicle(&rv2).await.unwrap();

    let task = Task::new(rv2_position(), vec![], Utc::now());
    let decision = mapper.decide(&task).await.unwrap();
    assert_eq!(names(&decision), vec!["gs1"]);
}

#[tokio::test]
async fn test_task_request_resolution() {
    let (mapper, _) = mapper_for(Some("rv1")).await;

    let local = resolve_task_request(&mapper, Task::new(rv1_position(), vec![], Utc::now()))
        .await
        .unwrap();
    assert!(local.task.is_some());
    assert!(local.decision.is_none());

    let remote = resolve_task_request(&mapper, Task::new(rv2_position(), vec![], Utc::now()))
        .await
        .unwrap();
    assert!(remote.task.is_none());
    assert!(remote.decision.unwrap().migrate);
}
