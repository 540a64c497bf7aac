//! Task-chain expansion.
//!
//! A submitted chain descriptor is turned into an [`ExpansionPlan`]
//! and persisted atomically. Chains and for-loops are structural and
//! expand eagerly at submission; conditionals and do-while loops are
//! expanded by the scheduler once the metadata they depend on exists.
//! Control containers keep their own descriptor JSON as task metadata
//! so deferred expansion survives restarts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use tracing::debug;

use pipeline_domain::chain::{ChainDescriptor, CommonFields, RangeSpec, TaskDescriptor};
use pipeline_domain::entities::{
    MetadataItem, MetadataRequestKind, MetadataValue, Task, METADATA_LOOP_CLOSED,
    METADATA_TASK_DESCRIPTION, TASK_TYPE_CHAIN,
};
use pipeline_domain::plan::{
    ExpansionPlan, PlanParent, PlanProductRef, PlanTaskRef, PlannedInput, PlannedMetadataRequest,
    PlannedProduct, PlannedTask,
};
use pipeline_domain::repositories::{MetadataRepository, ProductRepository};
use pipeline_domain::{ExpressionEvaluator, PipelineError, PipelineResult};

use crate::context::MetadataResolver;

/// Planning context carried down the descriptor tree.
#[derive(Clone)]
struct Scope {
    parent: PlanParent,
    job_name: Option<String>,
    working_directory: String,
    /// Metadata visible to expressions at this point: inherited values
    /// plus loop bindings introduced on the way down.
    bindings: HashMap<String, MetadataValue>,
    requested: HashMap<String, HashMap<String, MetadataValue>>,
}

impl Scope {
    fn evaluator(&self) -> ExpressionEvaluator {
        ExpressionEvaluator::new(self.bindings.clone(), self.requested.clone())
    }

    /// Scope for the children of a descriptor, with its overrides
    /// applied.
    fn descend(&self, parent: PlanParent, common: &CommonFields) -> Scope {
        Scope {
            parent,
            job_name: common.job_name.clone().or_else(|| self.job_name.clone()),
            working_directory: common
                .working_directory
                .clone()
                .unwrap_or_else(|| self.working_directory.clone()),
            bindings: self.bindings.clone(),
            requested: self.requested.clone(),
        }
    }
}

pub struct ChainExpander {
    products: Arc<dyn ProductRepository>,
    metadata: Arc<dyn MetadataRepository>,
    resolver: Arc<MetadataResolver>,
}

impl ChainExpander {
    pub fn new(
        products: Arc<dyn ProductRepository>,
        metadata: Arc<dyn MetadataRepository>,
        resolver: Arc<MetadataResolver>,
    ) -> Self {
        Self {
            products,
            metadata,
            resolver,
        }
    }

    /// Plans a whole submission under a fresh root container. Any
    /// error rejects the submission; nothing is persisted.
    pub async fn plan_submission(
        &self,
        descriptor: &ChainDescriptor,
    ) -> PipelineResult<ExpansionPlan> {
        let mut plan = ExpansionPlan::default();
        let root = plan.add_task(PlannedTask {
            parent: PlanParent::Existing(None),
            task_type: TASK_TYPE_CHAIN.to_string(),
            name: None,
            job_name: descriptor.job_name.clone(),
            working_directory: descriptor
                .working_directory
                .clone()
                .unwrap_or_else(|| ".".to_string()),
        });
        let scope = Scope {
            parent: PlanParent::Planned(root),
            job_name: plan.tasks[root].job_name.clone(),
            working_directory: plan.tasks[root].working_directory.clone(),
            bindings: HashMap::new(),
            requested: HashMap::new(),
        };
        for task in &descriptor.task_list {
            self.plan_descriptor(task, scope.clone(), &mut plan).await?;
        }
        debug!(
            tasks = plan.tasks.len(),
            products = plan.products.len(),
            "planned chain submission"
        );
        Ok(plan)
    }

    /// Expands a conditional container: evaluates its criterion against
    /// the metadata of the tasks it named and plans the branch taken.
    pub async fn expand_conditional(&self, task: &Task) -> PipelineResult<ExpansionPlan> {
        let descriptor = self.load_descriptor(task).await?;
        let (criterion, task_list, else_task_list) = match descriptor {
            TaskDescriptor::Conditional {
                criterion,
                task_list,
                else_task_list,
                ..
            } => (criterion, task_list, else_task_list),
            other => {
                return Err(PipelineError::expansion(format!(
                    "task {} is a {} but was asked to expand as a conditional",
                    task.id,
                    other.task_type()
                )))
            }
        };

        let evaluator = self.resolver.evaluator_for(task).await?;
        let take_main = evaluator.evaluate_expression(&criterion)?.truthy();
        debug!(task_id = task.id, take_main, "evaluated conditional criterion");
        let branch = if take_main { task_list } else { else_task_list };

        let scope = Scope {
            parent: PlanParent::Existing(Some(task.id)),
            job_name: task.job_name.clone(),
            working_directory: task.working_directory.clone(),
            bindings: evaluator.metadata.clone(),
            requested: evaluator.requested_metadata.clone(),
        };
        let mut plan = ExpansionPlan::default();
        for descriptor in &branch {
            self.plan_descriptor(descriptor, scope.clone(), &mut plan)
                .await?;
        }
        Ok(plan)
    }

    /// Plans the next iteration of a do-while container and advances
    /// its iteration counter in the same plan.
    pub async fn expand_do_while_iteration(&self, task: &Task) -> PipelineResult<ExpansionPlan> {
        let descriptor = self.load_descriptor(task).await?;
        let (iteration_name, task_list) = match descriptor {
            TaskDescriptor::DoWhileLoop {
                iteration_name,
                task_list,
                ..
            } => (iteration_name, task_list),
            other => {
                return Err(PipelineError::expansion(format!(
                    "task {} is a {} but was asked to expand as a do-while loop",
                    task.id,
                    other.task_type()
                )))
            }
        };

        let counter_keyword = format!("{iteration_name}_index");
        let completed = self
            .metadata
            .get_task_metadata_value(task.id, &counter_keyword)
            .await?
            .and_then(|item| item.value.as_f64())
            .unwrap_or(0.0) as i64;
        // Iterations count from one.
        let iteration = completed + 1;
        debug!(task_id = task.id, iteration, "expanding do-while iteration");

        // Child metadata requests may not resolve yet (the first
        // iteration has no children), so plan against inherited
        // metadata only.
        let mut bindings = self.resolver.collect_inherited(task).await?;
        bindings.insert(
            counter_keyword.clone(),
            MetadataValue::Float(iteration as f64),
        );

        let mut plan = ExpansionPlan::default();
        let container = plan.add_task(PlannedTask {
            parent: PlanParent::Existing(Some(task.id)),
            task_type: TASK_TYPE_CHAIN.to_string(),
            name: None,
            job_name: task.job_name.clone(),
            working_directory: task.working_directory.clone(),
        });
        plan.add_metadata(
            container,
            MetadataItem::new(counter_keyword.clone(), iteration as f64),
        );
        plan.add_existing_metadata(
            task.id,
            MetadataItem::new(counter_keyword, iteration as f64),
        );

        let scope = Scope {
            parent: PlanParent::Planned(container),
            job_name: task.job_name.clone(),
            working_directory: task.working_directory.clone(),
            bindings,
            requested: HashMap::new(),
        };
        for descriptor in &task_list {
            self.plan_descriptor(descriptor, scope.clone(), &mut plan)
                .await?;
        }
        Ok(plan)
    }

    /// Re-evaluates a do-while container's repeat criterion against the
    /// metadata of its named children.
    pub async fn should_repeat(&self, task: &Task) -> PipelineResult<bool> {
        let descriptor = self.load_descriptor(task).await?;
        let repeat_criterion = match descriptor {
            TaskDescriptor::DoWhileLoop {
                repeat_criterion, ..
            } => repeat_criterion,
            other => {
                return Err(PipelineError::expansion(format!(
                    "task {} is a {} but was asked for a repeat decision",
                    task.id,
                    other.task_type()
                )))
            }
        };
        let evaluator = self.resolver.evaluator_for(task).await?;
        Ok(evaluator.evaluate_expression(&repeat_criterion)?.truthy())
    }

    /// Marks a do-while container as finished; it is never expanded
    /// again.
    pub async fn close_loop(&self, task: &Task) -> PipelineResult<()> {
        debug!(task_id = task.id, "closing do-while loop");
        self.metadata
            .record_task_metadata(task.id, &MetadataItem::new(METADATA_LOOP_CLOSED, 1.0))
            .await
    }

    /// True once [`close_loop`](Self::close_loop) has run.
    pub async fn is_loop_closed(&self, task: &Task) -> PipelineResult<bool> {
        Ok(self
            .metadata
            .get_task_metadata_value(task.id, METADATA_LOOP_CLOSED)
            .await?
            .is_some())
    }

    async fn load_descriptor(&self, task: &Task) -> PipelineResult<TaskDescriptor> {
        let item = self
            .metadata
            .get_task_metadata_value(task.id, METADATA_TASK_DESCRIPTION)
            .await?
            .ok_or_else(|| {
                PipelineError::expansion(format!(
                    "control task {} has no stored descriptor",
                    task.id
                ))
            })?;
        let json = item.value.as_str().ok_or_else(|| {
            PipelineError::expansion(format!(
                "control task {} has a non-text descriptor",
                task.id
            ))
        })?;
        Ok(serde_json::from_str(json)?)
    }

    fn plan_descriptor<'a>(
        &'a self,
        descriptor: &'a TaskDescriptor,
        scope: Scope,
        plan: &'a mut ExpansionPlan,
    ) -> BoxFuture<'a, PipelineResult<()>> {
        async move {
            match descriptor {
                TaskDescriptor::Leaf {
                    task_type,
                    common,
                    inputs,
                    outputs,
                    spec,
                } => {
                    self.plan_leaf(task_type, common, inputs, outputs, spec, &scope, plan)
                        .await
                }
                TaskDescriptor::Chain { common, task_list } => {
                    let container = plan.add_task(PlannedTask {
                        parent: scope.parent,
                        task_type: TASK_TYPE_CHAIN.to_string(),
                        name: common.name.clone(),
                        job_name: common.job_name.clone().or_else(|| scope.job_name.clone()),
                        working_directory: common
                            .working_directory
                            .clone()
                            .unwrap_or_else(|| scope.working_directory.clone()),
                    });
                    let child_scope = scope.descend(PlanParent::Planned(container), common);
                    for task in task_list {
                        self.plan_descriptor(task, child_scope.clone(), plan).await?;
                    }
                    Ok(())
                }
                TaskDescriptor::ForLoop {
                    common,
                    parameter,
                    range,
                    task_list,
                } => {
                    self.plan_for_loop(common, parameter, range, task_list, &scope, plan)
                        .await
                }
                TaskDescriptor::DoWhileLoop { common, .. } => {
                    self.plan_control_container(descriptor, common, &scope, plan)
                }
                TaskDescriptor::Conditional { common, .. } => {
                    self.plan_control_container(descriptor, common, &scope, plan)
                }
            }
        }
        .boxed()
    }

    #[allow(clippy::too_many_arguments)]
    async fn plan_leaf(
        &self,
        task_type: &str,
        common: &CommonFields,
        inputs: &std::collections::BTreeMap<String, JsonValue>,
        outputs: &std::collections::BTreeMap<String, JsonValue>,
        spec: &std::collections::BTreeMap<String, JsonValue>,
        scope: &Scope,
        plan: &mut ExpansionPlan,
    ) -> PipelineResult<()> {
        let evaluator = scope.evaluator();
        let working_directory = common
            .working_directory
            .clone()
            .unwrap_or_else(|| scope.working_directory.clone());

        let index = plan.add_task(PlannedTask {
            parent: scope.parent,
            task_type: task_type.to_string(),
            name: common.name.clone(),
            job_name: common.job_name.clone().or_else(|| scope.job_name.clone()),
            working_directory: working_directory.clone(),
        });

        for (semantic_type, filename_field) in inputs {
            let filename = evaluator.evaluate_field(filename_field)?.to_display_string();
            let product = self
                .find_product(plan, &working_directory, &filename)
                .await?
                .ok_or_else(|| {
                    PipelineError::expansion(format!(
                        "input <{semantic_type}> of task '{task_type}' references \
                         {working_directory}/{filename}, which no task produces"
                    ))
                })?;
            plan.add_input(PlannedInput {
                consumer: index,
                product,
                semantic_type: semantic_type.clone(),
            });
        }

        for (semantic_type, filename_field) in outputs {
            let filename = evaluator.evaluate_field(filename_field)?.to_display_string();
            if plan
                .products
                .iter()
                .any(|p| p.directory == working_directory && p.filename == filename)
            {
                return Err(PipelineError::expansion(format!(
                    "output <{semantic_type}> of task '{task_type}' would overwrite \
                     {working_directory}/{filename}, which another task already declares"
                )));
            }
            plan.add_product(PlannedProduct {
                generator: index,
                directory: working_directory.clone(),
                filename,
                semantic_type: semantic_type.clone(),
                mime_type: None,
            });
        }

        for (keyword, field) in spec {
            // String spec values are stored raw; expressions among them
            // are resolved when the worker's context is built, once
            // requested metadata exists.
            let value = match field {
                JsonValue::String(s) => MetadataValue::Str(s.clone()),
                other => evaluator.evaluate_field(other)?,
            };
            plan.add_metadata(index, MetadataItem::new(keyword.clone(), value));
        }

        self.plan_requests(common, index, plan);
        Ok(())
    }

    async fn plan_for_loop(
        &self,
        common: &CommonFields,
        parameter: &str,
        range: &RangeSpec,
        task_list: &[TaskDescriptor],
        scope: &Scope,
        plan: &mut ExpansionPlan,
    ) -> PipelineResult<()> {
        let evaluator = scope.evaluator();
        let values = iteration_values(range, &evaluator)?;

        let loop_index = plan.add_task(PlannedTask {
            parent: scope.parent,
            task_type: pipeline_domain::TASK_TYPE_FOR_LOOP.to_string(),
            name: common.name.clone(),
            job_name: common.job_name.clone().or_else(|| scope.job_name.clone()),
            working_directory: common
                .working_directory
                .clone()
                .unwrap_or_else(|| scope.working_directory.clone()),
        });
        self.plan_requests(common, loop_index, plan);
        let loop_scope = scope.descend(PlanParent::Planned(loop_index), common);

        let index_keyword = format!("{parameter}_index");
        for (ordinal, value) in values.into_iter().enumerate() {
            let iteration = plan.add_task(PlannedTask {
                parent: PlanParent::Planned(loop_index),
                task_type: TASK_TYPE_CHAIN.to_string(),
                name: None,
                job_name: loop_scope.job_name.clone(),
                working_directory: loop_scope.working_directory.clone(),
            });
            plan.add_metadata(iteration, MetadataItem::new(parameter, value.clone()));
            plan.add_metadata(
                iteration,
                MetadataItem::new(index_keyword.clone(), ordinal as f64),
            );

            let mut iteration_scope =
                loop_scope.descend(PlanParent::Planned(iteration), &CommonFields::default());
            iteration_scope
                .bindings
                .insert(parameter.to_string(), value);
            iteration_scope
                .bindings
                .insert(index_keyword.clone(), MetadataValue::Float(ordinal as f64));

            for task in task_list {
                self.plan_descriptor(task, iteration_scope.clone(), plan)
                    .await?;
            }
        }
        Ok(())
    }

    /// Plans a conditional or do-while container whose children only
    /// materialize later. The descriptor travels with the task.
    fn plan_control_container(
        &self,
        descriptor: &TaskDescriptor,
        common: &CommonFields,
        scope: &Scope,
        plan: &mut ExpansionPlan,
    ) -> PipelineResult<()> {
        let index = plan.add_task(PlannedTask {
            parent: scope.parent,
            task_type: descriptor.task_type().to_string(),
            name: common.name.clone(),
            job_name: common.job_name.clone().or_else(|| scope.job_name.clone()),
            working_directory: common
                .working_directory
                .clone()
                .unwrap_or_else(|| scope.working_directory.clone()),
        });
        plan.add_metadata(
            index,
            MetadataItem::new(
                METADATA_TASK_DESCRIPTION,
                serde_json::to_string(descriptor)?,
            ),
        );
        self.plan_requests(common, index, plan);
        Ok(())
    }

    fn plan_requests(&self, common: &CommonFields, index: usize, plan: &mut ExpansionPlan) {
        for name in &common.requires_metadata_from {
            let referenced = plan.find_task_by_name(name).map(PlanTaskRef::Planned);
            plan.add_request(PlannedMetadataRequest {
                task: index,
                kind: MetadataRequestKind::Sibling,
                referenced,
                referenced_name: name.clone(),
            });
        }
        for name in &common.requires_metadata_from_child {
            // Children do not exist yet; resolved by name at read time.
            plan.add_request(PlannedMetadataRequest {
                task: index,
                kind: MetadataRequestKind::Child,
                referenced: None,
                referenced_name: name.clone(),
            });
        }
    }

    /// Looks up an input product, preferring products planned in this
    /// pass (latest first, so do-while iterations shadow earlier ones)
    /// and falling back to the store.
    async fn find_product(
        &self,
        plan: &ExpansionPlan,
        directory: &str,
        filename: &str,
    ) -> PipelineResult<Option<PlanProductRef>> {
        let planned = plan
            .products
            .iter()
            .enumerate()
            .rev()
            .find(|(_, p)| p.directory == directory && p.filename == filename)
            .map(|(i, _)| PlanProductRef::Planned(i));
        if planned.is_some() {
            return Ok(planned);
        }
        let existing = self
            .products
            .find_by_location(directory, filename)
            .await?
            .map(|p| PlanProductRef::Existing(p.id));
        Ok(existing)
    }
}

/// Materializes a for-loop's iteration values.
fn iteration_values(
    range: &RangeSpec,
    evaluator: &ExpressionEvaluator,
) -> PipelineResult<Vec<MetadataValue>> {
    match range {
        RangeSpec::Values(values) => values
            .iter()
            .map(|v| evaluator.evaluate_field(v))
            .collect(),
        RangeSpec::Linear(bounds) => {
            let [start, end, count] = eval_bounds(bounds, evaluator)?;
            Ok(linspace(start, end, count_to_usize(count)?)
                .into_iter()
                .map(MetadataValue::Float)
                .collect())
        }
        RangeSpec::Log(bounds) => {
            let [start, end, count] = eval_bounds(bounds, evaluator)?;
            if start <= 0.0 || end <= 0.0 {
                return Err(PipelineError::expansion(
                    "log_range bounds must be positive",
                ));
            }
            Ok(linspace(start.log10(), end.log10(), count_to_usize(count)?)
                .into_iter()
                .map(|exponent| MetadataValue::Float(10f64.powf(exponent)))
                .collect())
        }
    }
}

fn eval_bounds(
    bounds: &[JsonValue; 3],
    evaluator: &ExpressionEvaluator,
) -> PipelineResult<[f64; 3]> {
    let mut out = [0.0; 3];
    for (slot, field) in out.iter_mut().zip(bounds.iter()) {
        *slot = evaluator.evaluate_field(field)?.as_f64().ok_or_else(|| {
            PipelineError::expansion(format!("range bound {field} is not numeric"))
        })?;
    }
    Ok(out)
}

fn count_to_usize(count: f64) -> PipelineResult<usize> {
    if count < 1.0 || count.fract() != 0.0 {
        return Err(PipelineError::expansion(format!(
            "range count must be a positive integer, got {count}"
        )));
    }
    Ok(count as usize)
}

/// Evenly spaced values including both endpoints.
fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![start];
    }
    let step = (end - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::default()
    }

    #[test]
    fn linspace_includes_both_endpoints() {
        let values = linspace(0.0, 10.0, 5);
        assert_eq!(values, vec![0.0, 2.5, 5.0, 7.5, 10.0]);
        assert_eq!(linspace(3.0, 7.0, 1), vec![3.0]);
    }

    #[test]
    fn linear_range_evaluates_expression_bounds() {
        let range = RangeSpec::Linear([
            serde_json::json!(0),
            serde_json::json!("(2 * 5)"),
            serde_json::json!(3),
        ]);
        let values = iteration_values(&range, &evaluator()).unwrap();
        assert_eq!(
            values,
            vec![
                MetadataValue::Float(0.0),
                MetadataValue::Float(5.0),
                MetadataValue::Float(10.0)
            ]
        );
    }

    #[test]
    fn log_range_is_geometric() {
        let range = RangeSpec::Log([
            serde_json::json!(1),
            serde_json::json!(100),
            serde_json::json!(3),
        ]);
        let values = iteration_values(&range, &evaluator()).unwrap();
        let nums: Vec<f64> = values.iter().map(|v| v.as_f64().unwrap()).collect();
        assert!((nums[0] - 1.0).abs() < 1e-9);
        assert!((nums[1] - 10.0).abs() < 1e-9);
        assert!((nums[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn log_range_rejects_non_positive_bounds() {
        let range = RangeSpec::Log([
            serde_json::json!(0),
            serde_json::json!(100),
            serde_json::json!(3),
        ]);
        assert!(iteration_values(&range, &evaluator()).is_err());
    }

    #[test]
    fn explicit_values_keep_strings() {
        let range = RangeSpec::Values(vec![
            serde_json::json!("earth"),
            serde_json::json!("jupiter"),
        ]);
        let values = iteration_values(&range, &evaluator()).unwrap();
        assert_eq!(values[0].as_str(), Some("earth"));
        assert_eq!(values[1].as_str(), Some("jupiter"));
    }

    #[test]
    fn fractional_count_is_rejected() {
        let range = RangeSpec::Linear([
            serde_json::json!(0),
            serde_json::json!(1),
            serde_json::json!(2.5),
        ]);
        assert!(iteration_values(&range, &evaluator()).is_err());
    }
}
