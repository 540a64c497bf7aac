//! Metadata scope assembly.
//!
//! Tasks read metadata from three places: their ancestor chain (loop
//! bindings and spec values inherit downwards), explicitly requested
//! sibling tasks, and for do-while containers their named children.
//! This module turns those sources into the scopes the expression
//! evaluator works on.

use std::collections::HashMap;
use std::sync::Arc;

use pipeline_domain::entities::{MetadataRequest, MetadataRequestKind, MetadataValue, Task};
use pipeline_domain::repositories::{MetadataRepository, TaskRepository};
use pipeline_domain::{is_expression, ExpressionEvaluator, PipelineError, PipelineResult};

pub struct MetadataResolver {
    tasks: Arc<dyn TaskRepository>,
    metadata: Arc<dyn MetadataRepository>,
}

impl MetadataResolver {
    pub fn new(tasks: Arc<dyn TaskRepository>, metadata: Arc<dyn MetadataRepository>) -> Self {
        Self { tasks, metadata }
    }

    pub async fn root_of(&self, task: &Task) -> PipelineResult<i64> {
        let mut current = task.clone();
        while let Some(parent_id) = current.parent_id {
            current = self
                .tasks
                .find_by_id(parent_id)
                .await?
                .ok_or(PipelineError::TaskNotFound { id: parent_id })?;
        }
        Ok(current.id)
    }

    /// Metadata visible to a task: its own items plus everything on
    /// its ancestor chain, with nearer tasks shadowing farther ones.
    pub async fn collect_inherited(
        &self,
        task: &Task,
    ) -> PipelineResult<HashMap<String, MetadataValue>> {
        let mut chain = vec![task.clone()];
        let mut cursor = task.clone();
        while let Some(parent_id) = cursor.parent_id {
            cursor = self
                .tasks
                .find_by_id(parent_id)
                .await?
                .ok_or(PipelineError::TaskNotFound { id: parent_id })?;
            chain.push(cursor.clone());
        }

        let mut merged = HashMap::new();
        // Root first, so descendants override.
        for ancestor in chain.iter().rev() {
            for item in self.metadata.get_task_metadata(ancestor.id).await? {
                merged.insert(item.keyword, item.value);
            }
        }
        Ok(merged)
    }

    /// Finds the task a metadata request points at. Sibling requests
    /// resolve anywhere in the submission tree; child requests only
    /// within the requesting task's own subtree. Unresolved by-name
    /// requests are bound once the target exists.
    pub async fn resolve_target(
        &self,
        task: &Task,
        request: &MetadataRequest,
    ) -> PipelineResult<Option<Task>> {
        if let Some(id) = request.referenced_task_id {
            // Re-resolve child requests by name: do-while iterations
            // re-create children and the latest one wins.
            if request.kind == MetadataRequestKind::Sibling {
                return self.tasks.find_by_id(id).await;
            }
        }
        let search_root = match request.kind {
            MetadataRequestKind::Sibling => self.root_of(task).await?,
            MetadataRequestKind::Child => task.id,
        };
        let found = self
            .tasks
            .find_descendant_by_name(search_root, &request.referenced_name)
            .await?;
        if let Some(target) = &found {
            if request.referenced_task_id != Some(target.id) {
                self.metadata
                    .resolve_request(task.id, request.kind, &request.referenced_name, target.id)
                    .await?;
            }
        }
        Ok(found)
    }

    /// Metadata published by each task this one requested, keyed by
    /// the name used in the request.
    pub async fn resolve_requested(
        &self,
        task: &Task,
    ) -> PipelineResult<HashMap<String, HashMap<String, MetadataValue>>> {
        let mut resolved = HashMap::new();
        for request in self.metadata.requests_for_task(task.id).await? {
            let target = self.resolve_target(task, &request).await?.ok_or_else(|| {
                PipelineError::expansion(format!(
                    "task {} requests metadata from unknown task '{}'",
                    task.id, request.referenced_name
                ))
            })?;
            let items = self.metadata.get_task_metadata(target.id).await?;
            let map = items.into_iter().map(|i| (i.keyword, i.value)).collect();
            resolved.insert(request.referenced_name.clone(), map);
        }
        Ok(resolved)
    }

    /// An evaluator loaded with everything this task can see.
    pub async fn evaluator_for(&self, task: &Task) -> PipelineResult<ExpressionEvaluator> {
        let metadata = self.collect_inherited(task).await?;
        let requested = self.resolve_requested(task).await?;
        Ok(ExpressionEvaluator::new(metadata, requested))
    }
}

/// Resolves any expression-valued metadata in place, for handing a
/// fully literal scope to a worker.
pub fn evaluate_metadata_scope(
    evaluator: &ExpressionEvaluator,
) -> PipelineResult<HashMap<String, MetadataValue>> {
    let mut out = HashMap::with_capacity(evaluator.metadata.len());
    for (keyword, value) in &evaluator.metadata {
        let resolved = match value {
            MetadataValue::Str(s) if is_expression(s) => {
                evaluator.evaluate_expression(s)?.into()
            }
            other => other.clone(),
        };
        out.insert(keyword.clone(), resolved);
    }
    Ok(out)
}
