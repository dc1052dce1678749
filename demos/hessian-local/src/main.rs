//! Minimal end-to-end use of the Gridmill tracker: compute the numerical
//! Hessian of a harmonic test potential, entirely in-process.
//!
//! The in-memory store plays the document database and the harmonic model
//! plays the compute cluster, so the whole lifecycle (submission, polling,
//! retrieval, workflow stepping) runs exactly as it would against real
//! backends, just faster.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use gridmill_hessian::harmonic::{HarmonicModel, JsonCodec};
use gridmill_hessian::{hessian_result, Geometry, HessianWorkflow, JobParams, RunKind};
use gridmill_store::MemoryStore;
use gridmill_tracker::batch::inprocess::InProcessBatchClient;
use gridmill_tracker::batch::ResourceRequest;
use gridmill_tracker::entity::{standard_views, Task};
use gridmill_tracker::{Context, PollerConfig, Scheduler, TaskDriver, WorkflowRegistry};
use nalgebra::{DMatrix, Vector3};

#[derive(Debug, Parser)]
pub struct Cli {
    /// Number of atoms in the synthetic chain molecule.
    #[clap(long, default_value_t = 2)]
    atoms: usize,

    /// Polling tick, in milliseconds.
    #[clap(long, default_value_t = 50)]
    tick_ms: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Cli::parse();

    let coords = 3 * args.atoms;
    let springs = test_stiffness(coords);
    let model = HarmonicModel::new(springs.clone());

    let store = Arc::new(MemoryStore::with_views(standard_views()));
    let batch = Arc::new(InProcessBatchClient::new(move |job| {
        let model = model.clone();
        async move { model.run_deck(&job.files) }
    }));
    let cx = Context::new(store, batch);

    let config = PollerConfig {
        tick: Duration::from_millis(args.tick_ms),
    };
    let scheduler = Scheduler::new(cx.clone(), config.clone());
    let mut registry = WorkflowRegistry::new();
    registry.register(HessianWorkflow::machine(Arc::new(JsonCodec)));
    let driver = TaskDriver::new(cx.clone(), registry, config.clone());

    let deck = chain_input(args.atoms);
    let task = HessianWorkflow::create(
        &cx,
        "demo",
        &format!("{}-atom chain hessian", args.atoms),
        &deck,
        &ResourceRequest::new("harmonic"),
        &JsonCodec,
    )
    .await
    .unwrap();
    println!("created task {}", task.id());

    loop {
        scheduler.run_once().await.unwrap();
        driver.run_once().await.unwrap();

        let task = Task::load(&cx, task.id()).await.unwrap();
        println!(
            "task {} state={} transition={} children={}",
            task.id(),
            task.state(),
            task.transition(),
            task.children().len()
        );
        if task.done() {
            report(&task, &springs);
            break;
        }
        tokio::time::sleep(config.tick).await;
    }
}

fn report(task: &Task, springs: &DMatrix<f64>) {
    if !task.successful() {
        println!(
            "task failed: {}",
            task.error_message().unwrap_or("no error recorded")
        );
        return;
    }
    let numeric = hessian_result(task).unwrap();
    let deviation = (&numeric - springs).abs().max();
    println!("numerical hessian ({} coordinates):", numeric.nrows());
    println!("{numeric:.4}");
    println!("max deviation from the analytic matrix: {deviation:.2e}");
}

/// Input deck for a linear chain of atoms spaced 1.8 Bohr apart.
fn chain_input(atoms: usize) -> Vec<u8> {
    use gridmill_hessian::SinglePointCodec;

    let geometry = Geometry {
        symbols: (0..atoms).map(|_| "H".to_string()).collect(),
        positions: (0..atoms)
            .map(|i| Vector3::new(0.0, 0.0, 1.8 * i as f64))
            .collect(),
    };
    let params = JobParams {
        title: "seed".to_string(),
        kind: RunKind::Gradient,
        orbital_guess: None,
        extra: BTreeMap::new(),
    };
    JsonCodec.write_input(&geometry, &params).unwrap()
}

/// Symmetric positive-definite spring matrix with distinct entries.
fn test_stiffness(n: usize) -> DMatrix<f64> {
    let a = DMatrix::from_fn(n, n, |i, j| ((7 * i + 3 * j) % 5) as f64 * 0.1);
    &a + a.transpose() + DMatrix::identity(n, n) * 4.0
}
