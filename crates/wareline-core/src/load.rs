//! Dependency-ordered, idempotent batch load into a [`Sink`]

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::{IntegrityError, PipelineError, SinkError, Stage};
use crate::graph::DependencyGraph;
use crate::layout::{BoundEntity, BoundLayout, EntityKind};
use crate::sink::Sink;
use crate::split::{EntitySets, Row};

pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Unit of atomicity for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    /// One transaction per entity set: a failure commits none of its rows
    #[default]
    EntitySet,
    /// One transaction per batch: earlier batches stay committed
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntityOutcome {
    Loaded,
    Failed { error: String },
    /// Not attempted because an entity it depends on failed
    Skipped { blocked_by: String },
    Cancelled,
}

/// Load result for one entity set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityLoad {
    pub entity: String,
    pub kind: EntityKind,
    pub submitted: usize,
    pub inserted: usize,
    pub already_present: usize,
    pub batches: usize,
    #[serde(flatten)]
    pub outcome: EntityOutcome,
}

impl EntityLoad {
    fn new(entity: &BoundEntity, submitted: usize) -> Self {
        Self {
            entity: entity.name.clone(),
            kind: entity.kind,
            submitted,
            inserted: 0,
            already_present: 0,
            batches: 0,
            outcome: EntityOutcome::Loaded,
        }
    }
}

#[derive(Debug, Default)]
pub struct LoadReport {
    /// Per-entity results in load order
    pub entities: Vec<EntityLoad>,
    /// First failure, if any
    pub error: Option<PipelineError>,
}

impl LoadReport {
    pub fn entity(&self, name: &str) -> Option<&EntityLoad> {
        self.entities.iter().find(|e| e.entity == name)
    }

    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

pub struct BatchLoader<'a> {
    sink: &'a mut dyn Sink,
    batch_size: usize,
    scope: TransactionScope,
    cancel: Option<&'a CancelToken>,
    on_batch: Option<&'a dyn Fn(&str, usize)>,
}

impl<'a> BatchLoader<'a> {
    pub fn new(sink: &'a mut dyn Sink, batch_size: usize, scope: TransactionScope) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            scope,
            cancel: None,
            on_batch: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Called after each written batch with (entity, rows in batch).
    pub fn on_batch(mut self, f: &'a dyn Fn(&str, usize)) -> Self {
        self.on_batch = Some(f);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }

    /// Write every entity set in dependency order.
    ///
    /// Only configuration problems (a cycle, an entity missing from the
    /// layout) return `Err`; sink failures and cancellation are recorded in
    /// the report. Entities that depend on a failed one are skipped, and
    /// independent entities are still loaded.
    pub fn load(
        &mut self,
        layout: &BoundLayout,
        graph: &DependencyGraph,
        sets: &EntitySets,
    ) -> Result<LoadReport, IntegrityError> {
        let order = graph.load_order()?;
        let mut report = LoadReport::default();
        let mut blocked: Vec<(String, String)> = Vec::new();

        for name in order {
            let entity = layout
                .entity(&name)
                .ok_or_else(|| IntegrityError::UnknownEntity {
                    entity: name.clone(),
                })?;
            let rows = sets.get(&name).map(|s| s.rows()).unwrap_or_default();
            let mut result = EntityLoad::new(entity, rows.len());

            if let Some((_, by)) = blocked.iter().find(|(n, _)| *n == name) {
                log::warn!("Skipping {name}: depends on failed {by}");
                result.outcome = EntityOutcome::Skipped {
                    blocked_by: by.clone(),
                };
                report.entities.push(result);
                continue;
            }

            if self.cancelled() {
                result.outcome = EntityOutcome::Cancelled;
                report.entities.push(result);
                report
                    .error
                    .get_or_insert(PipelineError::Cancelled { stage: Stage::Load });
                continue;
            }

            match self.load_entity(entity, rows, &mut result) {
                Ok(()) => {
                    log::info!(
                        "Loaded {name}: {} new, {} already present ({} batches)",
                        result.inserted,
                        result.already_present,
                        result.batches
                    );
                }
                Err(err) => {
                    log::error!("Loading {name} failed: {err}");
                    result.outcome = match &err {
                        PipelineError::Cancelled { .. } => EntityOutcome::Cancelled,
                        other => EntityOutcome::Failed {
                            error: other.to_string(),
                        },
                    };
                    for dependent in graph.dependents(&name) {
                        if !blocked.iter().any(|(n, _)| *n == dependent) {
                            blocked.push((dependent, name.clone()));
                        }
                    }
                    report.error.get_or_insert(err);
                }
            }
            report.entities.push(result);
        }
        Ok(report)
    }

    fn load_entity(
        &mut self,
        entity: &BoundEntity,
        rows: &[Row],
        result: &mut EntityLoad,
    ) -> Result<(), PipelineError> {
        if rows.is_empty() {
            return Ok(());
        }
        let per_set = self.scope == TransactionScope::EntitySet;
        let sink_err = |committed: usize, source: SinkError| PipelineError::Sink {
            entity: entity.name.clone(),
            committed,
            source,
        };

        if per_set {
            self.sink.begin(entity).map_err(|e| sink_err(0, e))?;
        }

        let mut committed = 0usize;
        for batch in rows.chunks(self.batch_size) {
            if self.cancelled() {
                if per_set {
                    self.rollback(entity);
                    result.inserted = 0;
                    result.batches = 0;
                }
                result.already_present = committed.saturating_sub(result.inserted);
                return Err(PipelineError::Cancelled { stage: Stage::Load });
            }

            let written = self.write_batch(entity, batch, per_set);
            match written {
                Ok(n) => {
                    result.inserted += n;
                    result.batches += 1;
                    if !per_set {
                        committed += batch.len();
                    }
                    if let Some(f) = self.on_batch {
                        f(&entity.name, batch.len());
                    }
                }
                Err(e) => {
                    if per_set {
                        self.rollback(entity);
                        result.inserted = 0;
                        result.batches = 0;
                    }
                    result.already_present = committed.saturating_sub(result.inserted);
                    return Err(sink_err(committed, e));
                }
            }
        }

        if per_set {
            if let Err(e) = self.sink.commit(entity) {
                self.rollback(entity);
                result.inserted = 0;
                result.batches = 0;
                return Err(sink_err(0, e));
            }
        }
        result.already_present = rows.len() - result.inserted;
        Ok(())
    }

    fn write_batch(
        &mut self,
        entity: &BoundEntity,
        batch: &[Row],
        per_set: bool,
    ) -> Result<usize, SinkError> {
        if per_set {
            return self.sink.upsert_batch(entity, batch);
        }
        self.sink.begin(entity)?;
        let written = self
            .sink
            .upsert_batch(entity, batch)
            .and_then(|n| self.sink.commit(entity).map(|()| n));
        if written.is_err() {
            self.rollback(entity);
        }
        written
    }

    fn rollback(&mut self, entity: &BoundEntity) {
        if let Err(e) = self.sink.rollback(entity) {
            log::warn!("Rollback of {} failed: {e}", entity.name);
        }
    }
}
