//! Concurrent arbitration exercise.
//!
//! One thread per endpoint issues tagged writes through its own session. With
//! `--loopback` the writes land on an in-process device, which lets the report
//! include overlap and interleaving checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use serde::Serialize;

use spibridge::backing::{MemoryBus, MemoryFactory};
use spibridge::{Bridge, BridgeConfig, BridgeError, QueueSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub ops: usize,
    pub frame_len: usize,
    pub loopback: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            ops: 100,
            frame_len: 16,
            loopback: false,
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub endpoints: usize,
    pub completed: usize,
    pub failures: BTreeMap<&'static str, usize>,
    pub elapsed_ms: u64,
    pub queue: Option<QueueSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub interleaved_frames: usize,
}

#[derive(Debug, Default)]
struct Tally {
    completed: usize,
    failures: BTreeMap<&'static str, usize>,
}

fn failure_label(err: &BridgeError) -> &'static str {
    match err {
        BridgeError::NotFound(_) => "not_found",
        BridgeError::NotReady => "not_ready",
        BridgeError::Timeout => "timeout",
        BridgeError::Cancelled => "cancelled",
        BridgeError::NotSupported { .. } => "not_supported",
        BridgeError::Upstream(_) => "upstream",
        _ => "other",
    }
}

pub fn run(config: BridgeConfig, options: &Options) -> anyhow::Result<Report> {
    let mut buses = Vec::new();
    let bridge = if options.loopback {
        let mut factory = MemoryFactory::new();
        for target in &config.backing_targets {
            let bus = MemoryBus::new();
            factory = factory.with_bus(target.clone(), bus.clone());
            buses.push(bus);
        }
        Bridge::new(config, factory)?
    } else {
        Bridge::with_devices(config)?
    };

    let endpoints = bridge.endpoints().len();
    tracing::info!(endpoints, ops = options.ops, loopback = options.loopback, "Starting exercise");

    let start = Instant::now();
    let workers: Vec<_> = (0..endpoints)
        .map(|index| {
            let bridge = Arc::clone(&bridge);
            let ops = options.ops;
            let frame = vec![tag(index); options.frame_len];
            thread::spawn(move || worker(&bridge, index, ops, &frame))
        })
        .collect();

    let mut report = Report {
        endpoints,
        ..Report::default()
    };
    for handle in workers {
        let tally = handle
            .join()
            .map_err(|_| anyhow::anyhow!("exercise worker panicked"))?
            .context("endpoint could not be opened")?;
        report.completed += tally.completed;
        for (label, count) in tally.failures {
            *report.failures.entry(label).or_default() += count;
        }
    }
    report.elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
    report.queue = Some(bridge.snapshot());

    if !buses.is_empty() {
        report.max_concurrency = buses.iter().map(MemoryBus::max_concurrency).max();
        report.interleaved_frames = buses
            .iter()
            .map(|bus| interleaved_frames(&bus.written(), options.frame_len))
            .sum();
    }

    tracing::info!(
        completed = report.completed,
        elapsed_ms = report.elapsed_ms,
        "Exercise finished"
    );
    Ok(report)
}

fn tag(index: usize) -> u8 {
    (index % 255) as u8 + 1
}

fn worker(bridge: &Arc<Bridge>, index: usize, ops: usize, frame: &[u8]) -> spibridge::Result<Tally> {
    let mut session = bridge.open(index)?;
    let mut tally = Tally::default();
    for _ in 0..ops {
        match session.write(frame) {
            Ok(_) => tally.completed += 1,
            Err(e) => {
                tracing::warn!(endpoint = index, error = %e, "Write failed");
                *tally.failures.entry(failure_label(&e)).or_default() += 1;
            }
        }
    }
    session.close();
    Ok(tally)
}

/// Frames whose bytes did not all come from the same writer.
fn interleaved_frames(written: &[u8], frame_len: usize) -> usize {
    written
        .chunks(frame_len)
        .filter(|frame| frame.iter().any(|b| *b != frame[0]))
        .count()
}
