// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in scheduling strategies.

use vvrte_core::entities::Task;
use vvrte_core::geodesy::{PolarCoordinate, Wgs84};

use super::SchedulingStrategy;

/// Strategy names known to [`strategy_by_name`].
pub const STRATEGY_NAMES: &[&str] = &["default", "reverse", "nearest"];

/// Resolve a strategy by its configured name.
pub fn strategy_by_name(name: &str) -> Option<Box<dyn SchedulingStrategy>> {
    match name {
        "default" => Some(Box::new(FifoStrategy)),
        "reverse" => Some(Box::new(ReverseStrategy)),
        "nearest" => Some(Box::new(NearestNeighbourStrategy)),
        _ => None,
    }
}

fn by_creation(a: &Task, b: &Task) -> std::cmp::Ordering {
    a.creation_time
        .cmp(&b.creation_time)
        .then_with(|| a.id.cmp(&b.id))
}

/// Oldest task first.
pub struct FifoStrategy;

impl SchedulingStrategy for FifoStrategy {
    fn schedule(
        &self,
        _position: &PolarCoordinate,
        _depots: &[PolarCoordinate],
        scheduled: &mut Vec<Task>,
        pending: &mut Vec<Task>,
    ) -> bool {
        pending.sort_by(by_creation);
        scheduled.append(pending);
        true
    }
}

/// Newest task first.
pub struct ReverseStrategy;

impl SchedulingStrategy for ReverseStrategy {
    fn schedule(
        &self,
        _position: &PolarCoordinate,
        _depots: &[PolarCoordinate],
        scheduled: &mut Vec<Task>,
        pending: &mut Vec<Task>,
    ) -> bool {
        pending.sort_by(|a, b| by_creation(b, a));
        scheduled.append(pending);
        true
    }
}

/// Greedy tour: always the closest remaining task next.
///
/// With a depot, the task closest to the first depot is held back and visited
/// last, so the tour ends near it. Each task records the leg length in
/// `distance_to_target`.
pub struct NearestNeighbourStrategy;

impl SchedulingStrategy for NearestNeighbourStrategy {
    fn schedule(
        &self,
        position: &PolarCoordinate,
        depots: &[PolarCoordinate],
        scheduled: &mut Vec<Task>,
        pending: &mut Vec<Task>,
    ) -> bool {
        let mut remaining = std::mem::take(pending);
        remaining.sort_by(by_creation);

        let last = depots
            .first()
            .filter(|_| remaining.len() > 1)
            .and_then(|depot| closest(&remaining, depot))
            .map(|index| remaining.remove(index));

        let mut current = *position;
        while let Some(index) = closest(&remaining, &current) {
            let mut task = remaining.remove(index);
            task.distance_to_target = Wgs84.distance(&current, &task.position);
            current = task.position;
            scheduled.push(task);
        }

        if let Some(mut task) = last {
            task.distance_to_target = Wgs84.distance(&current, &task.position);
            scheduled.push(task);
        }
        true
    }
}

fn closest(tasks: &[Task], from: &PolarCoordinate) -> Option<usize> {
    tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (i, Wgs84.distance(from, &t.position)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn task(id: i64, created: i64, north: f64) -> Task {
        let origin = PolarCoordinate::new(48.0, 13.0, 400.0);
        let mut task = Task::new(
            Wgs84.walk(&origin, north, 0.0, 0.0),
            vec![],
            Utc.timestamp_opt(created, 0).unwrap(),
        );
        task.id = id;
        task
    }

    fn ids(tasks: &[Task]) -> Vec<i64> {
        tasks.iter().map(|t| t.id).collect()
    }

    #[test]
    fn test_registry() {
        for name in STRATEGY_NAMES {
            assert!(strategy_by_name(name).is_some(), "{}", name);
        }
        assert!(strategy_by_name("com.example.Unknown").is_none());
    }

    #[test]
    fn test_fifo_and_reverse() {
        let origin = PolarCoordinate::new(48.0, 13.0, 400.0);
        let pool = vec![task(1, 30, 0.0), task(2, 10, 0.0), task(3, 20, 0.0)];

        let (mut scheduled, mut pending) = (Vec::new(), pool.clone());
        assert!(FifoStrategy.schedule(&origin, &[], &mut scheduled, &mut pending));
        assert!(pending.is_empty());
        assert_eq!(ids(&scheduled), vec![2, 3, 1]);

        let (mut scheduled, mut pending) = (Vec::new(), pool);
        assert!(ReverseStrategy.schedule(&origin, &[], &mut scheduled, &mut pending));
        assert_eq!(ids(&scheduled), vec![1, 3, 2]);
    }

    #[test]
    fn test_nearest_neighbour_tour() {
        let origin = PolarCoordinate::new(48.0, 13.0, 400.0);
        let mut pending = vec![
            task(1, 1, 300.0),
            task(2, 2, 100.0),
            task(3, 3, -50.0),
            task(4, 4, 200.0),
        ];
        let mut scheduled = Vec::new();

        assert!(NearestNeighbourStrategy.schedule(&origin, &[], &mut scheduled, &mut pending));
        // -50 first (50 m), then 100 (150 m), 200, 300.
        assert_eq!(ids(&scheduled), vec![3, 2, 4, 1]);
        assert!((scheduled[0].distance_to_target - 50.0).abs() < 0.5);
        assert!((scheduled[1].distance_to_target - 150.0).abs() < 0.5);
    }

    #[test]
    fn test_nearest_neighbour_ends_near_depot() {
        let origin = PolarCoordinate::new(48.0, 13.0, 400.0);
        let depot = Wgs84.walk(&origin, -60.0, 0.0, 0.0);
        let mut pending = vec![task(1, 1, 100.0), task(2, 2, -50.0), task(3, 3, 200.0)];
        let mut scheduled = Vec::new();

        NearestNeighbourStrategy.schedule(&origin, &[depot], &mut scheduled, &mut pending);
        assert_eq!(ids(&scheduled), vec![1, 3, 2]);
    }
}
