//! The Hessian-by-finite-differences workflow.
//!
//! `WAIT → GENERATE → GEN_WAIT → PROCESS → PROCESS_WAIT → POSTPROCESS`: wait
//! for the unperturbed single-point job, spawn one displaced gradient job per
//! Cartesian coordinate, wait for all of them, add the at-equilibrium
//! Hessian job, then assemble the central-difference matrix from the
//! children's gradients.

use std::sync::Arc;

use error_stack::{IntoReport, Report, ResultExt};
use gridmill_store::DocId;
use gridmill_tracker::batch::{FileMap, ResourceRequest};
use gridmill_tracker::{
    children_done, Context, EntityError, Job, KillChildren, StateHandler, StateMachine, StateName,
    StepError, Task,
};
use nalgebra::{DMatrix, DVector};
use serde_json::json;
use tracing::{event, Level};

use crate::codec::{Geometry, RunKind, SinglePointCodec, SinglePointOutput};

pub const WORKFLOW_KIND: &str = "ghessian";

/// Name under which input decks travel, on the task and on every child job.
pub const INPUT_FILE: &str = "input.inp";

const WAIT: StateName = StateName::from_static("WAIT");
const GENERATE: StateName = StateName::from_static("GENERATE");
const GEN_WAIT: StateName = StateName::from_static("GEN_WAIT");
const PROCESS: StateName = StateName::from_static("PROCESS");
const PROCESS_WAIT: StateName = StateName::from_static("PROCESS_WAIT");
const POSTPROCESS: StateName = StateName::from_static("POSTPROCESS");

/// One-sided displacement applied to each coordinate, in Bohr.
const DISPLACEMENT: f64 = 0.0052918;
/// Bohr per Angstrom; the assembled matrix is scaled back into the
/// application's gradient units.
pub(crate) const BOHR_PER_ANGSTROM: f64 = 1.8897161646320724;

const KEY_REQUEST: &str = "request";
const KEY_TOTAL_JOBS: &str = "total_jobs";

pub struct HessianWorkflow;

impl HessianWorkflow {
    /// Build the state machine for registration under [`WORKFLOW_KIND`].
    pub fn machine(codec: Arc<dyn SinglePointCodec>) -> StateMachine {
        StateMachine::new(WORKFLOW_KIND)
            .handler(
                WAIT,
                WaitChildren {
                    next: GENERATE,
                },
            )
            .handler(
                GENERATE,
                Generate {
                    codec: codec.clone(),
                },
            )
            .handler(
                GEN_WAIT,
                WaitChildren {
                    next: PROCESS,
                },
            )
            .handler(
                PROCESS,
                Process {
                    codec: codec.clone(),
                },
            )
            .handler(
                PROCESS_WAIT,
                WaitChildren {
                    next: POSTPROCESS,
                },
            )
            .handler(POSTPROCESS, Postprocess { codec })
            .handler(StateName::KILLED, KillChildren)
    }

    /// Start a Hessian computation: validate the deck, persist the task, and
    /// seed it with the unperturbed single-point job. The task comes back
    /// already released to the driver.
    pub async fn create(
        cx: &Context,
        author: &str,
        title: &str,
        input_deck: &[u8],
        request: &ResourceRequest,
        codec: &dyn SinglePointCodec,
    ) -> Result<Task, Report<EntityError>> {
        codec.parse_input(input_deck).map_err(|report| {
            report.change_context(EntityError::Validation(
                "input deck rejected by the application codec".to_string(),
            ))
        })?;

        let mut task = Task::create(cx, author, title, WORKFLOW_KIND, WAIT).await?;
        task.attach_file(cx, INPUT_FILE, input_deck.to_vec()).await?;
        task.user_data_mut().insert(
            KEY_REQUEST.to_string(),
            serde_json::to_value(request)
                .into_report()
                .change_context(EntityError::Store)?,
        );
        set_counter(&mut task, KEY_TOTAL_JOBS, 1);

        let mut files = FileMap::new();
        files.insert(INPUT_FILE.to_string(), input_deck.to_vec());
        let job = Job::create(cx, author, &format!("{title} [unperturbed]"), &files, request).await?;
        task.add_child(cx, &job).await?;
        task.start(cx).await?;
        event!(Level::INFO, task = %task.id(), "created hessian task");
        Ok(task)
    }
}

/// Poll until every child run has ended successfully, then move on.
struct WaitChildren {
    next: StateName,
}

#[async_trait::async_trait]
impl StateHandler for WaitChildren {
    async fn on_main(
        &self,
        cx: &Context,
        task: &mut Task,
    ) -> Result<StateName, Report<StepError>> {
        if children_done(cx, task).await? {
            Ok(self.next.clone())
        } else {
            Ok(task.state().clone())
        }
    }
}

struct Generate {
    codec: Arc<dyn SinglePointCodec>,
}

#[async_trait::async_trait]
impl StateHandler for Generate {
    /// Runs once: read the converged orbitals out of the unperturbed child
    /// and create one displaced gradient job per Cartesian coordinate,
    /// seeding each with the orbital guess.
    async fn on_main(
        &self,
        cx: &Context,
        task: &mut Task,
    ) -> Result<StateName, Report<StepError>> {
        let seed_id = first_child(task)?;
        let seed = child_output(cx, self.codec.as_ref(), seed_id).await?;

        let deck = task
            .read_file(cx, INPUT_FILE)
            .await
            .change_context(StepError::Store)?;
        let (geometry, mut params) = self
            .codec
            .parse_input(&deck)
            .change_context(StepError::Handler)?;
        params.kind = RunKind::Gradient;
        params.orbital_guess = seed.orbitals;

        let request = stored_request(task)?;
        let author = task.author().to_string();
        let title = task.title().to_string();
        for displaced in perturbed_geometries(&geometry) {
            let n = counter(task, KEY_TOTAL_JOBS);
            params.title = format!("job_number_{n}");
            let deck = self
                .codec
                .write_input(&displaced, &params)
                .change_context(StepError::Handler)?;
            let mut files = FileMap::new();
            files.insert(INPUT_FILE.to_string(), deck);
            let job = Job::create(cx, &author, &format!("{title} [displacement {n}]"), &files, &request)
                .await
                .change_context(StepError::Store)?;
            task.add_child(cx, &job)
                .await
                .change_context(StepError::Store)?;
            set_counter(task, KEY_TOTAL_JOBS, n + 1);
        }
        event!(
            Level::INFO,
            task = %task.id(),
            displacements = geometry.coordinate_count(),
            "generated displaced gradient jobs"
        );
        Ok(GEN_WAIT)
    }
}

struct Process {
    codec: Arc<dyn SinglePointCodec>,
}

#[async_trait::async_trait]
impl StateHandler for Process {
    /// Runs once: add the at-equilibrium Hessian job.
    async fn on_main(
        &self,
        cx: &Context,
        task: &mut Task,
    ) -> Result<StateName, Report<StepError>> {
        let seed_id = first_child(task)?;
        let seed = child_output(cx, self.codec.as_ref(), seed_id).await?;

        let deck = task
            .read_file(cx, INPUT_FILE)
            .await
            .change_context(StepError::Store)?;
        let (geometry, mut params) = self
            .codec
            .parse_input(&deck)
            .change_context(StepError::Handler)?;
        params.kind = RunKind::Hessian;
        params.orbital_guess = seed.orbitals;
        let n = counter(task, KEY_TOTAL_JOBS);
        params.title = format!("job_number_{n}");

        let deck = self
            .codec
            .write_input(&geometry, &params)
            .change_context(StepError::Handler)?;
        let mut files = FileMap::new();
        files.insert(INPUT_FILE.to_string(), deck);
        let request = stored_request(task)?;
        let author = task.author().to_string();
        let title = task.title().to_string();
        let job = Job::create(cx, &author, &format!("{title} [equilibrium hessian]"), &files, &request)
            .await
            .change_context(StepError::Store)?;
        task.add_child(cx, &job)
            .await
            .change_context(StepError::Store)?;
        set_counter(task, KEY_TOTAL_JOBS, n + 1);
        Ok(PROCESS_WAIT)
    }
}

struct Postprocess {
    codec: Arc<dyn SinglePointCodec>,
}

#[async_trait::async_trait]
impl StateHandler for Postprocess {
    /// Runs once, terminal: assemble the numerical Hessian from the gradient
    /// children by central differences and store it as the task's result.
    async fn on_main(
        &self,
        cx: &Context,
        task: &mut Task,
    ) -> Result<StateName, Report<StepError>> {
        let children = task.children().to_vec();
        // Everything except the trailing equilibrium-Hessian job carries a
        // gradient column: the unperturbed child first, then one child per
        // displaced coordinate.
        let gradient_children = &children[..children.len() - 1];
        let mut outputs = Vec::with_capacity(gradient_children.len());
        for id in gradient_children {
            outputs.push(child_output(cx, self.codec.as_ref(), *id).await?);
        }
        let columns: Vec<DVector<f64>> = outputs.iter().map(SinglePointOutput::gradient_flat).collect();
        let coords = columns[0].len();
        if columns.len() != coords + 1 {
            return Err(Report::new(StepError::Handler).attach_printable(format!(
                "expected {} gradient jobs, found {}",
                coords + 1,
                columns.len()
            )));
        }

        let hessian = assemble_hessian(&columns) / BOHR_PER_ANGSTROM;
        let rows: Vec<Vec<f64>> = hessian
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect();
        task.set_result(json!({
            "hessian": rows,
            "energy": outputs[0].energy,
        }));
        event!(Level::INFO, task = %task.id(), coords, "assembled numerical hessian");
        Ok(StateName::COMPLETE)
    }
}

/// The assembled matrix out of a finished task's result data.
pub fn hessian_result(task: &Task) -> Option<DMatrix<f64>> {
    let value = task.result()?.get("hessian")?.clone();
    let rows: Vec<Vec<f64>> = serde_json::from_value(value).ok()?;
    let n = rows.len();
    let m = rows.first()?.len();
    Some(DMatrix::from_fn(n, m, |i, j| rows[i][j]))
}

/// One geometry per Cartesian coordinate, displaced by [`DISPLACEMENT`]
/// along that coordinate only. The zero-displacement point is not included;
/// the unperturbed job already exists.
fn perturbed_geometries(reference: &Geometry) -> Vec<Geometry> {
    let flat = reference.flatten();
    (0..flat.len())
        .map(|i| {
            let mut coords = flat.clone();
            coords[i] += DISPLACEMENT;
            reference.with_coordinates(&coords)
        })
        .collect()
}

/// Central-difference assembly over the gradient columns: column 0 is the
/// unperturbed gradient, column `i + 1` the gradient after displacing
/// coordinate `i`. Symmetrized by construction.
fn assemble_hessian(columns: &[DVector<f64>]) -> DMatrix<f64> {
    let n = columns[0].len();
    let mut hessian = DMatrix::zeros(n, n);
    for i in 0..n {
        for j in 0..n {
            hessian[(i, j)] = ((columns[j + 1][i] - columns[0][i])
                + (columns[i + 1][j] - columns[0][j]))
                / (2.0 * DISPLACEMENT);
        }
    }
    hessian
}

fn first_child(task: &Task) -> Result<DocId, Report<StepError>> {
    task.children()
        .first()
        .copied()
        .ok_or_else(|| Report::new(StepError::Handler).attach_printable("task has no seed child"))
}

async fn child_output(
    cx: &Context,
    codec: &dyn SinglePointCodec,
    id: DocId,
) -> Result<SinglePointOutput, Report<StepError>> {
    let job = Job::load(cx, id).await.change_context(StepError::Store)?;
    let run = job.run(cx).await.change_context(StepError::Store)?;
    let files = run
        .load_output_files(cx)
        .await
        .change_context(StepError::Store)?;
    codec.parse_output(&files).change_context(StepError::Handler)
}

fn stored_request(task: &Task) -> Result<ResourceRequest, Report<StepError>> {
    let value = task
        .user_data()
        .get(KEY_REQUEST)
        .cloned()
        .ok_or_else(|| Report::new(StepError::Handler).attach_printable("task has no stored resource request"))?;
    serde_json::from_value(value)
        .into_report()
        .change_context(StepError::Handler)
}

fn counter(task: &Task, key: &str) -> u64 {
    task.user_data()
        .get(key)
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
}

fn set_counter(task: &mut Task, key: &str, value: u64) {
    task.user_data_mut().insert(key.to_string(), json!(value));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use gridmill_store::MemoryStore;
    use gridmill_tracker::batch::fail_wrapper::{BatchOp, FailingBatchClient};
    use gridmill_tracker::batch::inprocess::InProcessBatchClient;
    use gridmill_tracker::batch::{BatchClient, BatchError};
    use gridmill_tracker::entity::standard_views;
    use gridmill_tracker::{PollerConfig, Scheduler, TaskDriver, Transition, WorkflowRegistry};
    use nalgebra::Vector3;

    use super::*;
    use crate::harmonic::{HarmonicModel, JsonCodec};

    fn two_atoms() -> Geometry {
        Geometry {
            symbols: vec!["O".to_string(), "H".to_string()],
            positions: vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.81)],
        }
    }

    /// Symmetric positive-definite spring matrix with distinct entries.
    fn stiffness(n: usize) -> DMatrix<f64> {
        let a = DMatrix::from_fn(n, n, |i, j| ((7 * i + 3 * j) % 5) as f64 * 0.1);
        &a + a.transpose() + DMatrix::identity(n, n) * 4.0
    }

    fn input_deck(geometry: &Geometry) -> Vec<u8> {
        let params = crate::codec::JobParams {
            title: "seed".to_string(),
            kind: RunKind::Gradient,
            orbital_guess: None,
            extra: Default::default(),
        };
        JsonCodec.write_input(geometry, &params).unwrap()
    }

    fn harness(batch: Arc<dyn BatchClient>) -> (Context, Scheduler, TaskDriver) {
        let store = Arc::new(MemoryStore::with_views(standard_views()));
        let cx = Context::new(store, batch);
        let scheduler = Scheduler::new(cx.clone(), PollerConfig::default());
        let mut registry = WorkflowRegistry::new();
        registry.register(HessianWorkflow::machine(Arc::new(JsonCodec)));
        let driver = TaskDriver::new(cx.clone(), registry, PollerConfig::default());
        (cx, scheduler, driver)
    }

    fn harmonic_batch(model: HarmonicModel) -> Arc<dyn BatchClient> {
        Arc::new(
            InProcessBatchClient::new(move |job| {
                let model = model.clone();
                async move { model.run_deck(&job.files) }
            })
            .with_running_polls(0),
        )
    }

    async fn drive(cx: &Context, scheduler: &Scheduler, driver: &TaskDriver, id: DocId) -> Task {
        for _ in 0..30 {
            scheduler.run_once().await.unwrap();
            driver.run_once().await.unwrap();
            let task = Task::load(cx, id).await.unwrap();
            if task.done() {
                return task;
            }
        }
        panic!("hessian workflow did not finish");
    }

    #[tokio::test]
    async fn generate_spawns_one_job_per_coordinate() {
        let geometry = two_atoms();
        let model = HarmonicModel::new(stiffness(6));
        let (cx, scheduler, driver) = harness(harmonic_batch(model));

        let task = HessianWorkflow::create(
            &cx,
            "mark",
            "water hessian",
            &input_deck(&geometry),
            &ResourceRequest::new("gamess"),
            &JsonCodec,
        )
        .await
        .unwrap();
        assert_eq!(task.children().len(), 1);

        // Let the unperturbed job finish, then step the task once: GENERATE
        // must add exactly one displaced job per coordinate.
        for _ in 0..3 {
            scheduler.run_once().await.unwrap();
        }
        driver.run_once().await.unwrap();

        let task = Task::load(&cx, task.id()).await.unwrap();
        assert_eq!(task.state().as_str(), "GEN_WAIT");
        assert_eq!(task.children().len(), 7, "1 unperturbed + 6 displaced");
    }

    #[tokio::test]
    async fn computes_the_analytic_hessian_of_a_harmonic_potential() {
        let geometry = two_atoms();
        let springs = stiffness(6);
        let model = HarmonicModel::new(springs.clone());
        let (cx, scheduler, driver) = harness(harmonic_batch(model));

        let task = HessianWorkflow::create(
            &cx,
            "mark",
            "water hessian",
            &input_deck(&geometry),
            &ResourceRequest::new("gamess"),
            &JsonCodec,
        )
        .await
        .unwrap();

        let task = drive(&cx, &scheduler, &driver, task.id()).await;
        assert!(task.successful(), "error: {:?}", task.error_message());
        // The equilibrium-Hessian job was added after the gradient wave.
        assert_eq!(task.children().len(), 8);

        let numeric = hessian_result(&task).unwrap();
        assert_eq!(numeric.shape(), (6, 6));
        let diff = (&numeric - &springs).abs().max();
        assert!(diff < 1e-3, "max deviation {diff}");
        let asym = (&numeric - numeric.transpose()).abs().max();
        assert!(asym < 1e-3, "asymmetry {asym}");
    }

    #[tokio::test]
    async fn failed_child_errors_the_task_until_retried() {
        let geometry = two_atoms();
        let model = HarmonicModel::new(stiffness(6));
        let outages = Arc::new(AtomicUsize::new(1));
        let counter = outages.clone();
        let batch = Arc::new(FailingBatchClient::new(
            InProcessBatchClient::new(move |job| {
                let model = model.clone();
                async move { model.run_deck(&job.files) }
            })
            .with_running_polls(0),
            move |op| match op {
                BatchOp::Submit { files, .. } => {
                    let poisoned = files
                        .values()
                        .any(|bytes| String::from_utf8_lossy(bytes).contains("job_number_3"));
                    if poisoned
                        && counter
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok()
                    {
                        Err(BatchError::SubmitFailed)
                    } else {
                        Ok(())
                    }
                }
                _ => Ok(()),
            },
        ));
        let (cx, scheduler, driver) = harness(batch);

        let task = HessianWorkflow::create(
            &cx,
            "mark",
            "water hessian",
            &input_deck(&geometry),
            &ResourceRequest::new("gamess"),
            &JsonCodec,
        )
        .await
        .unwrap();

        // The poisoned displacement job errors its run, and the waiting task
        // follows it into the ERROR meta-transition.
        for _ in 0..6 {
            scheduler.run_once().await.unwrap();
            driver.run_once().await.unwrap();
        }
        let loaded = Task::load(&cx, task.id()).await.unwrap();
        assert_eq!(loaded.transition(), Transition::Error);
        assert!(loaded.error_message().unwrap().contains("child job"));

        // Operator retry clones the errored run; the outage is over, so the
        // workflow runs through to completion.
        driver.retry(task.id()).await.unwrap();
        let task = drive(&cx, &scheduler, &driver, task.id()).await;
        assert!(task.successful());
    }
}
