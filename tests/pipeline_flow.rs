//! End-to-end pipeline flow over a real store.
//!
//! Tasks are seeded into an in-memory store, claimed the way the driver
//! does, and run through a draft → review pipeline with scripted
//! generators standing in for the real backend.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tempfile::TempDir;

use taskhive::config::CoordConfig;
use taskhive::llm::{Generator, ScriptedGenerator};
use taskhive::pipeline::{
    Pipeline, PipelineDef, PipelineRunner, PipelineStage, PipelineTask, RunOutcome, StageEngine,
    StageInput, StageOutcome, Verdict,
};
use taskhive::registry::NewWorker;
use taskhive::store::{CoordStore, LibSqlStore};
use taskhive::task::TaskStatus;

/// Draft → review pipeline with a rework edge back to the draft stage.
fn review_pipeline() -> Arc<Pipeline> {
    let def = PipelineDef {
        name: "report".to_string(),
        stages: vec![
            PipelineStage {
                id: 1,
                name: "draft".to_string(),
                executor: "writer".to_string(),
                instructions: "Write the quarterly report.".to_string(),
                inputs: vec![StageInput {
                    source: "initial".to_string(),
                }],
                ..Default::default()
            },
            PipelineStage {
                id: 2,
                name: "review".to_string(),
                executor: "auditor".to_string(),
                audit: true,
                instructions: "Review the draft for substance.".to_string(),
                inputs: vec![StageInput {
                    source: "draft".to_string(),
                }],
                pass_to: Some("complete".to_string()),
                fail_to: Some("draft".to_string()),
                ..Default::default()
            },
            PipelineStage {
                id: 3,
                name: "complete".to_string(),
                terminal: true,
                success: true,
                ..Default::default()
            },
            PipelineStage {
                id: 4,
                name: "abandoned".to_string(),
                terminal: true,
                ..Default::default()
            },
        ],
        failure_stage: None,
    };
    Arc::new(Pipeline::load(def).unwrap())
}

async fn setup(dir: &TempDir, max_task_retries: u32) -> (Arc<dyn CoordStore>, i64) {
    let config = CoordConfig {
        data_dir: dir.path().to_path_buf(),
        output_dir: dir.path().join("outputs"),
        max_task_retries,
        ..CoordConfig::default()
    };
    let store: Arc<dyn CoordStore> =
        Arc::new(LibSqlStore::new_memory(&config).await.unwrap());
    let worker_id = store
        .register_worker(&NewWorker {
            folder_name: "agent-WKR2-0-1-00001".to_string(),
            folder_path: "/tmp/hive/agent-WKR2-0-1-00001".to_string(),
            role: "WKR2".to_string(),
            layer: 1,
            parent_id: None,
        })
        .await
        .unwrap();
    (store, worker_id)
}

/// Runner whose every executor resolves to one scripted generator.
fn scripted_runner<I, S>(
    store: Arc<dyn CoordStore>,
    pipeline: Arc<Pipeline>,
    dir: &TempDir,
    responses: I,
) -> PipelineRunner
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let generator: Arc<dyn Generator> = Arc::new(ScriptedGenerator::new("scripted", responses));
    let engine = StageEngine::new(generator, dir.path().join("outputs"), Duration::from_secs(5));
    PipelineRunner::new(store, pipeline, engine, 1)
}

#[tokio::test]
async fn task_completes_and_persists_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let (store, worker) = setup(&dir, 1).await;
    let task_id = store
        .create_task("WKR2", &json!({ "title": "Q3 revenue" }))
        .await
        .unwrap();
    let task = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();

    let runner = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        [
            "Revenue grew 12% to $4.2M.",
            "Solid numbers.\n\nverdict: pass",
        ],
    );
    let outcome = runner.run(worker, &task).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let task = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    let location = task.result_location.unwrap();
    assert!(location.contains("task_00001"));

    // One markdown file per executed stage.
    assert!(Path::new(&location).join("draft.md").is_file());
    assert!(Path::new(&location).join("review.md").is_file());

    // The final pipeline position survives completion for the audit trail.
    let raw = store.load_pipeline_state(task_id).await.unwrap().unwrap();
    let ptask = PipelineTask::from_json(&raw).unwrap();
    assert!(ptask.finished);
    assert_eq!(ptask.history.len(), 2);
    assert_eq!(ptask.history[0].stage_name, "draft");
    assert_eq!(ptask.history[0].outcome, StageOutcome::Completed);
    assert_eq!(ptask.history[1].outcome, StageOutcome::AuditPassed);
}

#[tokio::test]
async fn audit_failure_reworks_with_feedback() {
    let dir = tempfile::tempdir().unwrap();
    let (store, worker) = setup(&dir, 1).await;
    store
        .create_task("WKR2", &json!({ "title": "Q3 revenue" }))
        .await
        .unwrap();
    let task = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();

    let runner = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        [
            "Numbers were fine I guess.",
            "Too vague, name actual figures.\n\nverdict: fail",
            "Revenue grew 12% to $4.2M.",
            "Concrete and clear.\n\nverdict: pass",
        ],
    );
    let outcome = runner.run(worker, &task).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let raw = store.load_pipeline_state(task.id).await.unwrap().unwrap();
    let ptask = PipelineTask::from_json(&raw).unwrap();
    assert_eq!(ptask.rework_count, 1);
    assert_eq!(ptask.history.len(), 4, "draft, review, draft, review");
    assert_eq!(ptask.audits.len(), 2);
    assert_eq!(ptask.audits[0].verdict, Verdict::Fail);
    assert!(
        ptask.audits[0]
            .feedback
            .as_deref()
            .unwrap()
            .contains("Too vague"),
    );
    assert_eq!(ptask.audits[1].verdict, Verdict::Pass);
    // The passing audit cleared the carried feedback.
    assert_eq!(ptask.feedback, None);
    // The rework overwrote the first draft in the output pool.
    assert_eq!(
        ptask.output_for("draft"),
        Some("Revenue grew 12% to $4.2M.")
    );
}

#[tokio::test]
async fn generation_outage_requeues_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (store, worker) = setup(&dir, 1).await;
    let task_id = store
        .create_task("WKR2", &json!({ "title": "Q3 revenue" }))
        .await
        .unwrap();
    let task = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();

    // An exhausted script fails every generation; the stage retries, hits
    // the limit, and the task lands on the failure terminal.
    let dead = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        Vec::<String>::new(),
    );
    let outcome = dead.run(worker, &task).await.unwrap();
    assert_eq!(outcome, RunOutcome::Failed { requeued: true });

    let failed = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Unassigned);
    assert_eq!(failed.retries, 1);
    // The requeue wiped the pipeline position, so the retry starts fresh.
    assert_eq!(failed.pipeline_state, None);

    let task = store.claim_next(worker, Some("WKR2")).await.unwrap().unwrap();
    let recovered = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        ["Back online: revenue $4.2M.", "Good.\n\nverdict: pass"],
    );
    assert_eq!(
        recovered.run(worker, &task).await.unwrap(),
        RunOutcome::Completed
    );
    let done = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Done);
}

#[tokio::test]
async fn paused_task_hands_off_between_executors() {
    let dir = tempfile::tempdir().unwrap();
    let (store, writer) = setup(&dir, 1).await;
    let auditor = store
        .register_worker(&NewWorker {
            folder_name: "agent-WKR2-0-2-00002".to_string(),
            folder_path: "/tmp/hive/agent-WKR2-0-2-00002".to_string(),
            role: "WKR2".to_string(),
            layer: 1,
            parent_id: None,
        })
        .await
        .unwrap();
    let task_id = store
        .create_task("WKR2", &json!({ "title": "Q3 revenue" }))
        .await
        .unwrap();

    // The drafting worker can only execute writer stages.
    let task = store.claim_next(writer, Some("WKR2")).await.unwrap().unwrap();
    let draft_runner = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        ["Revenue grew 12% to $4.2M."],
    )
    .with_executors(vec!["writer".to_string()]);
    let outcome = draft_runner.run(writer, &task).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Paused {
            stage: "review".to_string()
        }
    );

    // Paused means released with the position saved.
    let parked = store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(parked.status, TaskStatus::Unassigned);
    let raw = parked.pipeline_state.unwrap();
    let snapshot = PipelineTask::from_json(&raw).unwrap();
    assert_eq!(snapshot.current_stage, 2);
    assert_eq!(snapshot.history.len(), 1);

    // A reviewing worker picks it up where it stopped.
    let task = store.claim_next(auditor, Some("WKR2")).await.unwrap().unwrap();
    let review_runner = scripted_runner(
        Arc::clone(&store),
        review_pipeline(),
        &dir,
        ["Concrete and clear.\n\nverdict: pass"],
    )
    .with_executors(vec!["auditor".to_string()]);
    assert_eq!(
        review_runner.run(auditor, &task).await.unwrap(),
        RunOutcome::Completed
    );

    let raw = store.load_pipeline_state(task_id).await.unwrap().unwrap();
    let ptask = PipelineTask::from_json(&raw).unwrap();
    assert_eq!(ptask.history.len(), 2, "no stage ran twice across the handoff");
    assert!(ptask.finished);
}

#[tokio::test]
async fn two_workers_drain_the_queue_without_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let (store, first) = setup(&dir, 1).await;
    let second = store
        .register_worker(&NewWorker {
            folder_name: "agent-WKR2-0-2-00002".to_string(),
            folder_path: "/tmp/hive/agent-WKR2-0-2-00002".to_string(),
            role: "WKR2".to_string(),
            layer: 1,
            parent_id: None,
        })
        .await
        .unwrap();
    for i in 1..=3 {
        store
            .create_task("WKR2", &json!({ "title": format!("report {i}") }))
            .await
            .unwrap();
    }

    let def = PipelineDef {
        name: "single".to_string(),
        stages: vec![
            PipelineStage {
                id: 1,
                name: "work".to_string(),
                executor: "writer".to_string(),
                instructions: "Do the work.".to_string(),
                inputs: vec![StageInput {
                    source: "initial".to_string(),
                }],
                next: Some("complete".to_string()),
                ..Default::default()
            },
            PipelineStage {
                id: 2,
                name: "complete".to_string(),
                terminal: true,
                success: true,
                ..Default::default()
            },
            PipelineStage {
                id: 3,
                name: "failed".to_string(),
                terminal: true,
                ..Default::default()
            },
        ],
        failure_stage: None,
    };
    let pipeline = Arc::new(Pipeline::load(def).unwrap());
    let runner = Arc::new(scripted_runner(
        Arc::clone(&store),
        pipeline,
        &dir,
        ["one", "two", "three"],
    ));

    let mut handles = Vec::new();
    for worker_id in [first, second] {
        let store = Arc::clone(&store);
        let runner = Arc::clone(&runner);
        handles.push(tokio::spawn(async move {
            let mut ran = 0u32;
            while let Some(task) = store.claim_next(worker_id, Some("WKR2")).await.unwrap() {
                let outcome = runner.run(worker_id, &task).await.unwrap();
                assert_eq!(outcome, RunOutcome::Completed);
                ran += 1;
            }
            ran
        }));
    }
    let total: u32 = join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .sum();
    assert_eq!(total, 3);

    let counts = store.queue_counts(Some("WKR2")).await.unwrap();
    assert_eq!(counts.done, 3);
    assert_eq!(counts.unassigned, 0);
    assert_eq!(counts.processing, 0);

    // Store-side counters credit whichever worker ran each task.
    let workers = store.list_workers().await.unwrap();
    let credited: u32 = workers.iter().map(|w| w.tasks_completed).sum();
    assert_eq!(credited, 3);
}
