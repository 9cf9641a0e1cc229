// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use common::{f32_tensor, fast_config, run_ranks, run_ranks_with};
use dynamo_collectives::timeline::{Phase, TimelineEvent};
use dynamo_collectives::{
    CollectiveError, Collectives, CollectivesConfig, LocalCluster, LoopState, TimelineSink,
};
use parking_lot::Mutex;
use serde_json::Value;

#[test]
fn test_shutdown_resolves_outstanding_operations() -> anyhow::Result<()> {
    let sets = LocalCluster::new(1, 3)?;
    let results = run_ranks(sets, fast_config(), |rank, collectives| {
        // only rank 0 ever submits this one
        let orphan = if rank == 0 {
            Some(collectives.allreduce("orphan", f32_tensor(&[1.0])?)?)
        } else {
            None
        };
        let shared = collectives
            .allreduce("shared", f32_tensor(&[1.0])?)?
            .wait()?
            .to_vec::<f32>()?;

        collectives.shutdown()?;
        assert_eq!(collectives.state(), LoopState::ShutDown);

        let orphan = orphan.map(|h| h.wait());
        let late = collectives.allreduce("late", f32_tensor(&[1.0])?);
        Ok((shared, orphan, late.is_err_and(|e| matches!(e, CollectiveError::ShutDown))))
    })?;

    for (shared, _, late_rejected) in &results {
        assert_eq!(shared, &vec![3.0]);
        assert!(late_rejected);
    }
    assert!(matches!(results[0].1, Some(Err(CollectiveError::ShutDown))));
    Ok(())
}

#[test]
fn test_one_rank_shutting_down_stops_the_job() -> anyhow::Result<()> {
    let sets = LocalCluster::new(1, 2)?;
    let results = run_ranks(sets, fast_config(), |rank, collectives| {
        if rank == 1 {
            collectives.shutdown()?;
            return Ok(None);
        }
        // rank 1 never joins, so this can only end by shutdown
        let result = collectives.allreduce("never", f32_tensor(&[1.0])?)?.wait();
        Ok(Some(result))
    })?;
    assert!(matches!(results[0], Some(Err(CollectiveError::ShutDown))));
    Ok(())
}

#[test]
fn test_reinitialize_after_shutdown() -> anyhow::Result<()> {
    let first = LocalCluster::new(1, 2)?;
    let second = LocalCluster::new(1, 2)?;

    let handles: Vec<_> = first
        .into_iter()
        .zip(second)
        .map(|(a, b)| {
            thread::spawn(move || -> anyhow::Result<Vec<f32>> {
                let collectives = Collectives::new(fast_config())?;
                let mut outputs = Vec::new();
                for comms in [a, b] {
                    collectives.initialize(comms)?;
                    outputs.extend(
                        collectives
                            .allreduce("step", f32_tensor(&[2.0])?)?
                            .wait()?
                            .to_vec::<f32>()?,
                    );
                    collectives.shutdown()?;
                    assert_eq!(collectives.state(), LoopState::ShutDown);
                }
                Ok(outputs)
            })
        })
        .collect();

    for handle in handles {
        let outputs = handle.join().map_err(|_| anyhow!("rank panicked"))??;
        assert_eq!(outputs, vec![4.0, 4.0]);
    }
    Ok(())
}

#[test]
fn test_topology_accessors() -> anyhow::Result<()> {
    let sets = LocalCluster::new(2, 3)?;
    let results = run_ranks(sets, fast_config(), |rank, collectives| {
        assert_eq!(collectives.size()?, 6);
        assert_eq!(collectives.local_size()?, 3);
        assert_eq!(collectives.cross_size()?, 2);
        assert_eq!(collectives.local_rank()?, rank % 3);
        assert_eq!(collectives.cross_rank()?, rank / 3);
        Ok(collectives.is_homogeneous()?)
    })?;
    assert!(results.into_iter().all(|homogeneous| homogeneous));

    let uneven = LocalCluster::from_layout(vec![0, 0, 0, 1], None)?;
    let results = run_ranks(uneven, fast_config(), |_, collectives| {
        let sum = collectives
            .allreduce("x", f32_tensor(&[1.0])?)?
            .wait()?
            .to_vec::<f32>()?;
        Ok((collectives.is_homogeneous()?, sum))
    })?;
    for (homogeneous, sum) in results {
        assert!(!homogeneous);
        assert_eq!(sum, vec![4.0]);
    }
    Ok(())
}

#[test]
fn test_timeline_file_is_written_by_the_coordinator() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("timeline.json");
    let mut config = fast_config();
    config.timeline.path = Some(path.clone());
    config.timeline.mark_cycles = true;

    let sets = LocalCluster::new(1, 2)?;
    run_ranks(sets, config, |rank, collectives| {
        collectives
            .allreduce("grad", f32_tensor(&[rank as f32; 4])?)?
            .wait()?;
        collectives
            .allgather("rows", f32_tensor(&[rank as f32])?)?
            .wait()?;
        Ok(())
    })?;

    let text = std::fs::read_to_string(&path)?;
    assert!(text.starts_with('['));
    let events: Vec<Value> = text
        .lines()
        .skip(1)
        .map(|l| serde_json::from_str(l.trim_end_matches(',')))
        .collect::<Result<_, _>>()?;

    let names: Vec<&str> = events.iter().filter_map(|e| e["name"].as_str()).collect();
    for expected in [
        "CYCLE_START",
        "QUEUE",
        "NEGOTIATE_REDUCE",
        "REDUCE",
        "NEGOTIATE_GATHER",
        "GATHER",
    ] {
        assert!(names.contains(&expected), "missing {expected} in {names:?}");
    }
    let rows: Vec<&str> = events
        .iter()
        .filter(|e| e["name"] == "process_name")
        .filter_map(|e| e["args"]["name"].as_str())
        .collect();
    assert_eq!(rows, vec!["grad", "rows"]);
    Ok(())
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<TimelineEvent>>>);

impl TimelineSink for Capture {
    fn record(&mut self, event: &TimelineEvent) {
        self.0.lock().push(event.clone());
    }
}

#[test]
fn test_custom_timeline_sink() -> anyhow::Result<()> {
    let capture = Capture::default();
    let sink = capture.clone();
    let sets = LocalCluster::new(1, 2)?;
    run_ranks_with(
        sets,
        move |_| Ok(Collectives::new(fast_config())?.with_timeline(sink.clone())),
        |_, collectives| {
            collectives
                .broadcast("weights", f32_tensor(&[1.0, 2.0])?, 1)?
                .wait()?;
            Ok(())
        },
    )?;

    let events = capture.0.lock();
    let weights: Vec<&TimelineEvent> = events.iter().filter(|e| e.tensor == "weights").collect();
    let begins = weights.iter().filter(|e| e.phase == Phase::Begin).count();
    let ends = weights.iter().filter(|e| e.phase == Phase::End).count();
    assert!(begins > 0);
    assert_eq!(begins, ends);
    // only the coordinator records, so every event appears once
    let executes = weights
        .iter()
        .filter(|e| e.activity.as_deref() == Some("BROADCAST"))
        .count();
    assert_eq!(executes, 1);
    Ok(())
}

#[test]
fn test_unwritable_timeline_fails_initialization() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = CollectivesConfig {
        timeline: dynamo_collectives::config::TimelineConfig {
            path: Some(dir.path().join("missing").join("timeline.json")),
            mark_cycles: false,
        },
        ..fast_config()
    };
    let collectives = Collectives::new(config)?;
    let mut sets = LocalCluster::new(1, 1)?;
    let err = collectives.initialize(sets.remove(0)).unwrap_err();
    match err {
        CollectiveError::Config(cause) => assert!(matches!(
            *cause,
            dynamo_collectives::config::ConfigError::Timeline { .. }
        )),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(collectives.state(), LoopState::ShutDown);
    Ok(())
}
