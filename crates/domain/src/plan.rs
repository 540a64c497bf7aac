//! Expansion plans.
//!
//! Expanding a chain descriptor is a pure planning pass: it produces an
//! [`ExpansionPlan`] describing every task, product, input edge,
//! metadata item and metadata request to create, without touching the
//! store. The plan is then persisted in a single transaction, so a
//! submission either lands completely or not at all.
//!
//! Rows planned in the same pass reference each other by plan-local
//! index; references to rows that already exist in the store carry
//! their database ids.

use crate::entities::{MetadataItem, MetadataRequestKind};

/// Parent of a planned task: either a task already in the store (or
/// none, for a submission root) or another task planned in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanParent {
    Existing(Option<i64>),
    Planned(usize),
}

/// A file product referenced by a planned input edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanProductRef {
    Existing(i64),
    Planned(usize),
}

/// A task referenced by a planned metadata request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTaskRef {
    Existing(i64),
    Planned(usize),
}

#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub parent: PlanParent,
    pub task_type: String,
    pub name: Option<String>,
    pub job_name: Option<String>,
    pub working_directory: String,
}

#[derive(Debug, Clone)]
pub struct PlannedProduct {
    /// Index of the generating task within [`ExpansionPlan::tasks`].
    pub generator: usize,
    pub directory: String,
    pub filename: String,
    pub semantic_type: String,
    pub mime_type: Option<String>,
}

/// A dependency edge from a planned task to a file product it consumes.
#[derive(Debug, Clone)]
pub struct PlannedInput {
    /// Index of the consuming task within [`ExpansionPlan::tasks`].
    pub consumer: usize,
    pub product: PlanProductRef,
    pub semantic_type: String,
}

/// A metadata-dependency edge from a planned task. The referenced task
/// may be unresolved at planning time (a do-while child that only
/// materializes in a later iteration); it is then recorded by name and
/// resolved when the metadata is read.
#[derive(Debug, Clone)]
pub struct PlannedMetadataRequest {
    pub task: usize,
    pub kind: MetadataRequestKind,
    pub referenced: Option<PlanTaskRef>,
    pub referenced_name: String,
}

/// Everything one expansion pass wants to create, in store-insertion
/// order.
#[derive(Debug, Clone, Default)]
pub struct ExpansionPlan {
    pub tasks: Vec<PlannedTask>,
    pub products: Vec<PlannedProduct>,
    pub inputs: Vec<PlannedInput>,
    /// Metadata items to attach to planned tasks, keyed by task index.
    pub metadata: Vec<(usize, MetadataItem)>,
    /// Metadata items to attach to tasks that already exist in the
    /// store, e.g. the iteration counter on a do-while container.
    pub existing_metadata: Vec<(i64, MetadataItem)>,
    pub requests: Vec<PlannedMetadataRequest>,
}

impl ExpansionPlan {
    pub fn add_task(&mut self, task: PlannedTask) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn add_product(&mut self, product: PlannedProduct) -> usize {
        self.products.push(product);
        self.products.len() - 1
    }

    pub fn add_input(&mut self, input: PlannedInput) {
        self.inputs.push(input);
    }

    pub fn add_metadata(&mut self, task: usize, item: MetadataItem) {
        self.metadata.push((task, item));
    }

    pub fn add_existing_metadata(&mut self, task_id: i64, item: MetadataItem) {
        self.existing_metadata.push((task_id, item));
    }

    pub fn add_request(&mut self, request: PlannedMetadataRequest) {
        self.requests.push(request);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Index of the most recently planned task with the given name,
    /// used to resolve sibling metadata references during planning.
    pub fn find_task_by_name(&self, name: &str) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| t.name.as_deref() == Some(name))
            .map(|(i, _)| i)
    }
}
