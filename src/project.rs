//! Project setup: seed documents, team planning, and registration.
//!
//! A project seed names the pipeline, the initial tasks, and the shape of
//! the worker tree (depth and fan-out). `seed_project` applies it exactly
//! once per store; restarting against a seeded store resumes instead of
//! duplicating workers and tasks.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

use crate::error::ProjectError;
use crate::hierarchy::catalog;
use crate::hierarchy::{AgentIdentity, MAX_FAN_OUT, MAX_UID};
use crate::pipeline::PipelineDef;
use crate::registry::{EventKind, NewWorker};
use crate::store::CoordStore;

/// Meta key the project document is stored under.
const PROJECT_META_KEY: &str = "project";

// ── Seed document ───────────────────────────────────────────────────

/// One initial task in a seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedTask {
    /// Queue partition; defaults to the leaf role of the planned hierarchy.
    #[serde(default)]
    pub layer: Option<String>,
    pub payload: serde_json::Value,
}

/// The project seed consumed at creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSeed {
    pub name: String,
    pub pipeline: PipelineDef,
    pub tasks: Vec<SeedTask>,
    /// Layers in the worker tree, root included.
    #[serde(default = "default_depth")]
    pub depth: u8,
    /// Direct subordinates per manager.
    #[serde(default = "default_fan_out")]
    pub fan_out: u8,
}

fn default_depth() -> u8 {
    2
}

fn default_fan_out() -> u8 {
    3
}

impl ProjectSeed {
    pub fn from_json(raw: &str) -> Result<Self, ProjectError> {
        let seed: ProjectSeed = serde_json::from_str(raw)
            .map_err(|e| ProjectError::InvalidSeed(format!("seed JSON: {e}")))?;
        seed.validate()?;
        Ok(seed)
    }

    fn validate(&self) -> Result<(), ProjectError> {
        if self.name.trim().is_empty() {
            return Err(ProjectError::InvalidSeed("project name is empty".to_string()));
        }
        if self.depth == 0 || self.depth > catalog::MAX_DEPTH {
            return Err(ProjectError::DepthOutOfRange(self.depth));
        }
        if self.pipeline.stages.is_empty() {
            return Err(ProjectError::InvalidSeed(
                "pipeline has no stages".to_string(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(ProjectError::InvalidSeed("seed has no tasks".to_string()));
        }
        Ok(())
    }

    /// Queue partition for tasks that don't declare one: the leaf role of
    /// the planned hierarchy, so leaf workers claim their own queue.
    pub fn default_layer(&self) -> &'static str {
        catalog::role_at(self.depth, self.depth - 1).unwrap_or("tasks")
    }
}

// ── Uid allocation ──────────────────────────────────────────────────

/// Hands out unique uids for one project's identities.
pub struct UidAllocator {
    used: HashSet<u32>,
    next_sequential: Option<u32>,
}

impl UidAllocator {
    /// Random allocation, the normal mode.
    pub fn new() -> Self {
        Self {
            used: HashSet::new(),
            next_sequential: None,
        }
    }

    /// Deterministic 1, 2, 3... allocation for reproducible trees.
    pub fn sequential() -> Self {
        Self {
            used: HashSet::new(),
            next_sequential: Some(1),
        }
    }

    /// Next unused uid. `plan_team` bounds team size to the uid space
    /// before allocating.
    pub fn allocate(&mut self) -> u32 {
        if let Some(next) = self.next_sequential.as_mut() {
            let uid = *next;
            *next += 1;
            self.used.insert(uid);
            return uid;
        }
        let mut rng = rand::thread_rng();
        loop {
            let uid = rng.gen_range(1..=MAX_UID);
            if self.used.insert(uid) {
                return uid;
            }
        }
    }
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Team planning ───────────────────────────────────────────────────

/// One planned position in the worker tree.
#[derive(Debug, Clone)]
pub struct PlannedWorker {
    pub identity: AgentIdentity,
    /// Zero-based hierarchy layer; 0 is the root.
    pub layer: u8,
    /// Index of the parent within the plan; `None` for the root.
    pub parent: Option<usize>,
}

/// Plan a full worker tree: breadth-first, every manager gets `fan_out`
/// subordinates, the last layer is all leaves.
pub fn plan_team(
    depth: u8,
    fan_out: u8,
    uids: &mut UidAllocator,
) -> Result<Vec<PlannedWorker>, ProjectError> {
    if depth == 0 || depth > catalog::MAX_DEPTH {
        return Err(ProjectError::DepthOutOfRange(depth));
    }
    if depth > 1 && fan_out == 0 {
        return Err(ProjectError::InvalidSeed(
            "fan-out must be at least 1 for a multi-layer hierarchy".to_string(),
        ));
    }
    if fan_out > MAX_FAN_OUT {
        return Err(ProjectError::InvalidSeed(format!(
            "fan-out {fan_out} exceeds the maximum of {MAX_FAN_OUT}"
        )));
    }
    let planned = team_size(depth, fan_out);
    if planned > MAX_UID as u64 {
        return Err(ProjectError::InvalidSeed(format!(
            "planned team of {planned} workers exceeds the uid space"
        )));
    }

    let root_fan_out = if depth == 1 { 0 } else { fan_out };
    let root = AgentIdentity::new(catalog::ROOT_ROLE, root_fan_out, 1, uids.allocate())?;
    let mut plan = vec![PlannedWorker {
        identity: root,
        layer: 0,
        parent: None,
    }];

    let mut frontier = vec![0usize];
    for layer in 1..depth {
        let role = catalog::role_at(depth, layer).ok_or(ProjectError::DepthOutOfRange(depth))?;
        let child_fan_out = if layer + 1 == depth { 0 } else { fan_out };
        let mut next_frontier = Vec::with_capacity(frontier.len() * fan_out as usize);
        for &parent_idx in &frontier {
            for sibling in 1..=fan_out as u32 {
                let uid = uids.allocate();
                let identity =
                    plan[parent_idx]
                        .identity
                        .child(role, child_fan_out, sibling, uid)?;
                plan.push(PlannedWorker {
                    identity,
                    layer,
                    parent: Some(parent_idx),
                });
                next_frontier.push(plan.len() - 1);
            }
        }
        frontier = next_frontier;
    }
    Ok(plan)
}

fn team_size(depth: u8, fan_out: u8) -> u64 {
    let mut total: u64 = 0;
    let mut layer_count: u64 = 1;
    for _ in 0..depth {
        total = total.saturating_add(layer_count);
        layer_count = layer_count.saturating_mul(fan_out as u64);
    }
    total
}

/// Register a planned tree, creating each worker's folder on disk.
///
/// Parents are registered before their children so the tree edge lands
/// with the row; folders nest under the parent's folder, which keeps the
/// full chain recoverable from any worker's path.
pub async fn register_team(
    store: &dyn CoordStore,
    plan: &[PlannedWorker],
    base_dir: &Path,
) -> Result<Vec<i64>, ProjectError> {
    let mut ids: Vec<i64> = Vec::with_capacity(plan.len());
    let mut paths: Vec<PathBuf> = Vec::with_capacity(plan.len());

    for worker in plan {
        let folder_name = worker.identity.encode();
        let folder_path = match worker.parent {
            Some(parent_idx) => paths[parent_idx].join(&folder_name),
            None => base_dir.join(&folder_name),
        };
        fs::create_dir_all(&folder_path).await?;

        let id = store
            .register_worker(&NewWorker {
                folder_name,
                folder_path: folder_path.to_string_lossy().into_owned(),
                role: worker.identity.role.clone(),
                layer: worker.layer,
                parent_id: worker.parent.map(|i| ids[i]),
            })
            .await?;
        ids.push(id);
        paths.push(folder_path);
    }
    Ok(ids)
}

// ── Seeding ─────────────────────────────────────────────────────────

/// Metadata stored once per project under the store's `project` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub project_id: String,
    pub name: String,
    pub pipeline_name: String,
    pub depth: u8,
    pub fan_out: u8,
    pub task_count: usize,
    pub created_at: DateTime<Utc>,
}

/// What `seed_project` produced or found.
pub struct SeededProject {
    pub meta: ProjectMeta,
    pub worker_ids: Vec<i64>,
    /// False when the store was already seeded and nothing was created.
    pub fresh: bool,
}

/// Apply a seed to a store exactly once.
///
/// A store that already carries project metadata is left untouched; its
/// existing workers and tasks are picked up instead, so restarting the
/// driver resumes the same project.
pub async fn seed_project(
    store: &Arc<dyn CoordStore>,
    seed: &ProjectSeed,
    base_dir: &Path,
) -> Result<SeededProject, ProjectError> {
    if let Some(raw) = store.get_meta(PROJECT_META_KEY).await? {
        let meta: ProjectMeta = serde_json::from_str(&raw)
            .map_err(|e| ProjectError::Serialization(format!("project meta: {e}")))?;
        let worker_ids = store.list_workers().await?.iter().map(|w| w.id).collect();
        info!(project = %meta.name, "Store already seeded, resuming project");
        return Ok(SeededProject {
            meta,
            worker_ids,
            fresh: false,
        });
    }

    seed.validate()?;

    let mut uids = UidAllocator::new();
    let plan = plan_team(seed.depth, seed.fan_out, &mut uids)?;
    let worker_ids = register_team(store.as_ref(), &plan, base_dir).await?;

    let default_layer = seed.default_layer();
    for task in &seed.tasks {
        let layer = task.layer.as_deref().unwrap_or(default_layer);
        store.create_task(layer, &task.payload).await?;
    }

    let meta = ProjectMeta {
        project_id: uuid::Uuid::new_v4().to_string(),
        name: seed.name.clone(),
        pipeline_name: seed.pipeline.name.clone(),
        depth: seed.depth,
        fan_out: seed.fan_out,
        task_count: seed.tasks.len(),
        created_at: Utc::now(),
    };
    let raw = serde_json::to_string(&meta)
        .map_err(|e| ProjectError::Serialization(format!("project meta: {e}")))?;
    store.set_meta(PROJECT_META_KEY, &raw).await?;
    store
        .append_event(
            EventKind::ProjectStarted,
            None,
            None,
            Some(&format!(
                "project '{}' seeded: {} workers, {} tasks",
                meta.name,
                worker_ids.len(),
                meta.task_count
            )),
        )
        .await?;
    info!(
        project = %meta.name,
        workers = worker_ids.len(),
        tasks = meta.task_count,
        "Project seeded"
    );
    Ok(SeededProject {
        meta,
        worker_ids,
        fresh: true,
    })
}
