use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::future::join_all;
use tracing::{error, info, warn};

use taskhive::config::{CoordConfig, StoreBackend};
use taskhive::llm::{
    self, Generator, GeneratorBackend, GeneratorConfig, ScriptedGenerator, create_generator,
};
use taskhive::pipeline::{Pipeline, PipelineRunner, RunOutcome, StageEngine};
use taskhive::project::{ProjectSeed, seed_project};
use taskhive::registry::{EventKind, WorkerRecord, WorkerStatus};
use taskhive::store::{CoordStore, open_store};

/// How long an idle worker waits before re-polling the queue or slot pool.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let seed_path = std::env::var("TASKHIVE_SEED").unwrap_or_else(|_| {
        eprintln!("Error: TASKHIVE_SEED not set");
        eprintln!("  export TASKHIVE_SEED=./seed.json");
        std::process::exit(1);
    });

    let data_dir = std::env::var("TASKHIVE_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let backend = match std::env::var("TASKHIVE_STORE").as_deref() {
        Ok("json") => StoreBackend::JsonFile,
        _ => StoreBackend::Sqlite,
    };
    let slot_count: u32 = std::env::var("TASKHIVE_SLOTS")
        .unwrap_or_else(|_| "8".to_string())
        .parse()
        .unwrap_or(8);
    let model =
        std::env::var("TASKHIVE_MODEL").unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

    let config = CoordConfig {
        data_dir: PathBuf::from(&data_dir),
        output_dir: PathBuf::from(&data_dir).join("outputs"),
        backend,
        slot_count,
        ..CoordConfig::default()
    };

    eprintln!("🐝 TaskHive v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Store: {} under {}",
        match backend {
            StoreBackend::Sqlite => "libSQL",
            StoreBackend::JsonFile => "JSON document",
        },
        data_dir
    );

    // ── Generators ──────────────────────────────────────────────────────
    // A script file turns the whole run into a deterministic dry run; the
    // API key is only required without one.
    let (fallback, llm_config): (Arc<dyn Generator>, Option<GeneratorConfig>) =
        match std::env::var("TASKHIVE_SCRIPT") {
            Ok(path) => {
                let raw = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading script file {path}"))?;
                let responses: Vec<String> =
                    serde_json::from_str(&raw).with_context(|| format!("script file {path}"))?;
                eprintln!("   Model: scripted dry run ({} responses)", responses.len());
                (Arc::new(ScriptedGenerator::new("script", responses)), None)
            }
            Err(_) => {
                let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
                    eprintln!("Error: ANTHROPIC_API_KEY not set (TASKHIVE_SCRIPT runs without it)");
                    eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
                    std::process::exit(1);
                });
                let llm_config = GeneratorConfig {
                    backend: GeneratorBackend::Anthropic,
                    api_key: secrecy::SecretString::from(api_key),
                    model: model.clone(),
                    base_url: llm::anthropic::DEFAULT_BASE_URL.to_string(),
                    max_tokens: llm::anthropic::DEFAULT_MAX_TOKENS,
                };
                eprintln!("   Model: {model}");
                (create_generator("default", &llm_config)?, Some(llm_config))
            }
        };

    // ── Store & project ─────────────────────────────────────────────────
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {data_dir}"))?;
    let store = open_store(&config).await?;

    let raw = tokio::fs::read_to_string(&seed_path)
        .await
        .with_context(|| format!("reading seed {seed_path}"))?;
    let seed = ProjectSeed::from_json(&raw)?;
    let pipeline = Arc::new(Pipeline::load(seed.pipeline.clone())?);

    let workers_dir = config.data_dir.join("workers");
    let project = seed_project(&store, &seed, &workers_dir).await?;
    if !project.fresh {
        recover_interrupted(&store, &config).await?;
    }

    eprintln!(
        "   Project: {} ({} workers, depth {}, fan-out {}){}",
        project.meta.name,
        project.worker_ids.len(),
        project.meta.depth,
        project.meta.fan_out,
        if project.fresh { "" } else { " [resumed]" }
    );
    eprintln!(
        "   Pipeline: {} ({} stages)\n",
        pipeline.name(),
        pipeline.stages().len()
    );

    // ── Engine & runner ─────────────────────────────────────────────────
    let mut engine = StageEngine::new(
        Arc::clone(&fallback),
        &config.output_dir,
        config.generation_timeout,
    );
    if let Some(llm_config) = &llm_config {
        for executor in distinct_executors(&pipeline) {
            let generator = create_generator(&executor, llm_config)?;
            engine = engine.with_generator(executor, generator);
        }
    }
    let runner = Arc::new(PipelineRunner::new(
        Arc::clone(&store),
        Arc::clone(&pipeline),
        engine,
        config.max_stage_retries,
    ));

    // ── Worker loops ────────────────────────────────────────────────────
    let workers = store.list_workers().await?;
    let leaf_layer = project.meta.depth - 1;
    let (leaves, supervisors): (Vec<WorkerRecord>, Vec<WorkerRecord>) =
        workers.into_iter().partition(|w| w.layer == leaf_layer);
    let runnable: Vec<WorkerRecord> = leaves
        .into_iter()
        .filter(|w| !w.status.is_terminal())
        .collect();
    if runnable.is_empty() {
        let counts = store.queue_counts(None).await?;
        if counts.unassigned > 0 {
            warn!(
                queued = counts.unassigned,
                "No runnable leaf workers; queued tasks will not be claimed"
            );
        }
    }

    // Supervisors only park in slots left over after every leaf could hold
    // one, so a deep tree cannot starve its own leaves.
    let reserve = (config.slot_count as usize).saturating_sub(runnable.len());
    let mut parked: Vec<(i64, Option<u32>)> = Vec::with_capacity(supervisors.len());
    for worker in supervisors.iter().take(reserve) {
        let slot = park_supervisor(&store, worker).await?;
        parked.push((worker.id, slot));
    }
    for worker in supervisors.iter().skip(reserve) {
        parked.push((worker.id, None));
    }

    let mut handles = Vec::with_capacity(runnable.len());
    for worker in runnable {
        handles.push(tokio::spawn(run_leaf_worker(
            Arc::clone(&store),
            Arc::clone(&runner),
            worker,
        )));
    }
    for result in join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "Worker loop panicked");
        }
    }

    for (worker_id, slot) in parked {
        stop_supervisor(&store, worker_id, slot).await?;
    }

    // ── Summary ─────────────────────────────────────────────────────────
    let counts = store.queue_counts(None).await?;
    let detail = format!(
        "done {}, failed {}, queued {}",
        counts.done, counts.failed, counts.unassigned
    );
    store
        .append_event(EventKind::ProjectStopped, None, None, Some(&detail))
        .await?;
    info!(
        done = counts.done,
        failed = counts.failed,
        queued = counts.unassigned,
        "Project run finished"
    );
    eprintln!("\n   Finished: {detail}");

    Ok(())
}

/// Executor names declared by the pipeline's non-terminal stages.
fn distinct_executors(pipeline: &Pipeline) -> Vec<String> {
    let mut names: Vec<String> = pipeline
        .stages()
        .iter()
        .filter(|s| !s.terminal && !s.executor.is_empty())
        .map(|s| s.executor.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Requeue claims and free slots left behind by an interrupted run.
///
/// The driver owns every worker in the store, so at startup any claim or
/// slot held by a non-terminal worker is an orphan of a previous process.
async fn recover_interrupted(
    store: &Arc<dyn CoordStore>,
    config: &CoordConfig,
) -> anyhow::Result<()> {
    let stale: HashSet<i64> = store
        .stale_workers(config.heartbeat_stale_after)
        .await?
        .iter()
        .map(|w| w.id)
        .collect();
    for worker in store.list_workers().await? {
        if worker.status.is_terminal() {
            continue;
        }
        let released = store.release_all_for_worker(worker.id).await?;
        if let Some(slot) = worker.slot_id {
            store.release_slot(slot).await?;
        }
        if released > 0 || stale.contains(&worker.id) {
            warn!(
                worker = %worker.folder_name,
                released,
                "Recovered interrupted worker"
            );
        }
    }
    Ok(())
}

/// Put a non-leaf worker into `AwaitingSubordinates` if the slot pool
/// allows. Supervisors left `Queued` are shut down at the end of the run.
async fn park_supervisor(
    store: &Arc<dyn CoordStore>,
    worker: &WorkerRecord,
) -> anyhow::Result<Option<u32>> {
    if worker.status.is_terminal() {
        return Ok(None);
    }
    let slot = match worker.status {
        WorkerStatus::Queued => {
            let Some(slot) = store.assign_slot(worker.id).await? else {
                return Ok(None);
            };
            store
                .update_worker_status(worker.id, WorkerStatus::SlotAssigned, None)
                .await?;
            Some(slot)
        }
        // resumed from an interrupted run; recovery freed the old slot
        _ => store.assign_slot(worker.id).await?,
    };
    if worker.status != WorkerStatus::AwaitingSubordinates {
        store
            .update_worker_status(worker.id, WorkerStatus::AwaitingSubordinates, None)
            .await?;
    }
    Ok(slot)
}

async fn stop_supervisor(
    store: &Arc<dyn CoordStore>,
    worker_id: i64,
    slot: Option<u32>,
) -> anyhow::Result<()> {
    if let Some(worker) = store.get_worker(worker_id).await? {
        match worker.status {
            WorkerStatus::Queued | WorkerStatus::SlotAssigned => {
                store
                    .update_worker_status(worker_id, WorkerStatus::Shutdown, None)
                    .await?;
            }
            status if status.is_active() => {
                store
                    .update_worker_status(worker_id, WorkerStatus::Done, None)
                    .await?;
            }
            _ => {}
        }
    }
    if let Some(slot) = slot {
        store.release_slot(slot).await?;
    }
    Ok(())
}

/// Claim/execute loop for one leaf worker. Errors mark the worker failed
/// and hand its claims back to the queue.
async fn run_leaf_worker(
    store: Arc<dyn CoordStore>,
    runner: Arc<PipelineRunner>,
    worker: WorkerRecord,
) {
    let worker_id = worker.id;
    let name = worker.folder_name.clone();
    if let Err(e) = leaf_loop(&store, &runner, worker).await {
        error!(worker = %name, error = %e, "Worker loop aborted");
        if let Err(e) = store.release_all_for_worker(worker_id).await {
            error!(worker = %name, error = %e, "Could not requeue claims");
        }
        if let Ok(Some(record)) = store.get_worker(worker_id).await {
            if let Some(slot) = record.slot_id {
                store.release_slot(slot).await.ok();
            }
        }
        store
            .update_worker_status(worker_id, WorkerStatus::Error, Some(&e.to_string()))
            .await
            .ok();
    }
}

async fn leaf_loop(
    store: &Arc<dyn CoordStore>,
    runner: &PipelineRunner,
    worker: WorkerRecord,
) -> anyhow::Result<()> {
    // Wait for a slot; bail out if the partition drains before one frees up.
    let slot = loop {
        store.record_heartbeat(worker.id).await?;
        if let Some(slot) = store.assign_slot(worker.id).await? {
            break slot;
        }
        if store.queue_counts(Some(&worker.role)).await?.unassigned == 0 {
            store
                .update_worker_status(worker.id, WorkerStatus::Shutdown, None)
                .await?;
            info!(worker = %worker.folder_name, "No slot and no queued work, shutting down");
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };

    if worker.status == WorkerStatus::Queued {
        store
            .update_worker_status(worker.id, WorkerStatus::SlotAssigned, None)
            .await?;
    }
    if worker.status != WorkerStatus::Idle {
        store
            .update_worker_status(worker.id, WorkerStatus::Idle, None)
            .await?;
    }
    info!(worker = %worker.folder_name, role = %worker.role, slot, "Worker started");

    loop {
        store.record_heartbeat(worker.id).await?;
        let Some(task) = store.claim_next(worker.id, Some(&worker.role)).await? else {
            let counts = store.queue_counts(Some(&worker.role)).await?;
            if counts.unassigned == 0 && counts.processing == 0 {
                break;
            }
            // a sibling's task may yet requeue
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        store
            .update_worker_status(worker.id, WorkerStatus::Working, None)
            .await?;
        match runner.run(worker.id, &task).await {
            Ok(RunOutcome::Completed) => {}
            Ok(RunOutcome::Failed { requeued }) => {
                if requeued {
                    info!(task_id = task.id, "Task requeued for another attempt");
                }
            }
            Ok(RunOutcome::Paused { stage }) => {
                info!(task_id = task.id, stage = %stage, "Task paused for another executor");
            }
            Err(e) => {
                warn!(task_id = task.id, error = %e, "Pipeline error, failing task");
                store.fail_task(task.id, &e.to_string()).await?;
            }
        }
        store
            .update_worker_status(worker.id, WorkerStatus::Idle, None)
            .await?;
    }

    store
        .update_worker_status(worker.id, WorkerStatus::Done, None)
        .await?;
    store.release_slot(slot).await?;
    info!(worker = %worker.folder_name, "Worker finished");
    Ok(())
}
