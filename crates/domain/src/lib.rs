//! Domain layer of the pipeline scheduler: entities, chain
//! descriptors, the expression evaluator, expansion plans and the
//! repository/queue ports everything else is written against.

pub mod chain;
pub mod entities;
pub mod errors;
pub mod expression;
pub mod plan;
pub mod ports;
pub mod repositories;

pub use chain::{ChainDescriptor, CommonFields, RangeSpec, TaskDescriptor};
pub use entities::{
    AttemptStatus, FileProduct, FileProductVersion, MetadataItem, MetadataRequest,
    MetadataRequestKind, MetadataValue, OutputFileDescriptor, RunTimes, SchedulingAttempt, Task,
    TaskContext, TaskSchedulingInfo, TaskState, METADATA_LOOP_CLOSED, METADATA_TASK_DESCRIPTION,
    TASK_TYPE_CHAIN, TASK_TYPE_CONDITIONAL, TASK_TYPE_DO_WHILE_LOOP, TASK_TYPE_FOR_LOOP,
};
pub use errors::{PipelineError, PipelineResult};
pub use expression::{constants_table, is_expression, ExpressionEvaluator, Value};
pub use plan::{
    ExpansionPlan, PlanParent, PlanProductRef, PlanTaskRef, PlannedInput, PlannedMetadataRequest,
    PlannedProduct, PlannedTask,
};
pub use ports::messaging::WorkQueue;
pub use repositories::{
    AttemptRepository, MetadataRepository, PersistedPlan, ProductRepository, TaskRepository,
};
