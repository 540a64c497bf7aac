//! User-submitted task-chain descriptors.
//!
//! The submission document is JSON with a `task_list` of task
//! descriptors. Each descriptor carries a `task` type tag; the four
//! control-flow tags map to dedicated variants of [`TaskDescriptor`]
//! and every other tag is a leaf task handed to an external worker.
//! Validation happens at parse time so a malformed chain is rejected
//! before anything touches the task graph store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::entities::{
    TASK_TYPE_CHAIN, TASK_TYPE_CONDITIONAL, TASK_TYPE_DO_WHILE_LOOP, TASK_TYPE_FOR_LOOP,
};
use crate::errors::{PipelineError, PipelineResult};

/// The user-submitted tree; immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawChainDescriptor")]
pub struct ChainDescriptor {
    pub job_name: Option<String>,
    pub working_directory: Option<String>,
    pub task_list: Vec<TaskDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawChainDescriptor {
    job_name: Option<String>,
    working_directory: Option<String>,
    task_list: Vec<RawTaskDescriptor>,
}

impl TryFrom<RawChainDescriptor> for ChainDescriptor {
    type Error = PipelineError;

    fn try_from(raw: RawChainDescriptor) -> PipelineResult<Self> {
        Ok(Self {
            job_name: raw.job_name,
            working_directory: raw.working_directory,
            task_list: raw
                .task_list
                .into_iter()
                .map(TaskDescriptor::try_from)
                .collect::<PipelineResult<Vec<_>>>()?,
        })
    }
}

impl ChainDescriptor {
    pub fn from_json(json: &str) -> PipelineResult<Self> {
        let raw: RawChainDescriptor = serde_json::from_str(json)
            .map_err(|e| PipelineError::invalid_descriptor(e.to_string()))?;
        Self::try_from(raw)
    }
}

/// Fields shared by every descriptor variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommonFields {
    /// Optional label used by sibling tasks for metadata references.
    pub name: Option<String>,
    /// Overrides the inherited job name for this subtree.
    pub job_name: Option<String>,
    /// Overrides the inherited working directory for this subtree.
    pub working_directory: Option<String>,
    /// Names of sibling tasks whose metadata this node needs before it
    /// can be scheduled (or, for a conditional, expanded).
    pub requires_metadata_from: Vec<String>,
    /// Names of descendant tasks whose metadata gates a do-while
    /// continuation decision.
    pub requires_metadata_from_child: Vec<String>,
}

/// The iteration-value specification of a for-loop; exactly one form
/// must be supplied. Range bounds and counts may themselves be
/// expressions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RangeSpec {
    /// Explicit list of values.
    Values(Vec<JsonValue>),
    /// `[start, end, count]` with uniform spacing.
    Linear([JsonValue; 3]),
    /// `[start, end, count]` with geometric spacing.
    Log([JsonValue; 3]),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskDescriptor {
    /// A concrete science task run by an external worker.
    Leaf {
        task_type: String,
        common: CommonFields,
        /// Semantic name -> filename; filenames may be expressions.
        inputs: BTreeMap<String, JsonValue>,
        /// Semantic name -> filename for products this task creates.
        outputs: BTreeMap<String, JsonValue>,
        /// Task-specific configuration; values may be expressions and
        /// are recorded as task metadata once evaluated.
        spec: BTreeMap<String, JsonValue>,
    },
    Chain {
        common: CommonFields,
        task_list: Vec<TaskDescriptor>,
    },
    ForLoop {
        common: CommonFields,
        /// Metadata keyword the iteration value is bound to; the
        /// 0-based ordinal is bound to `{parameter}_index`.
        parameter: String,
        range: RangeSpec,
        task_list: Vec<TaskDescriptor>,
    },
    DoWhileLoop {
        common: CommonFields,
        /// Keyword under which the 1-based completed-iteration count is
        /// published into the loop scope as `{iteration_name}_index`.
        iteration_name: String,
        /// Expression re-evaluated after each iteration against the
        /// metadata of the children named in
        /// `requires_metadata_from_child`.
        repeat_criterion: String,
        task_list: Vec<TaskDescriptor>,
    },
    Conditional {
        common: CommonFields,
        /// Expression evaluated once the tasks named in
        /// `requires_metadata_from` have completed.
        criterion: String,
        task_list: Vec<TaskDescriptor>,
        else_task_list: Vec<TaskDescriptor>,
    },
}

impl TaskDescriptor {
    pub fn common(&self) -> &CommonFields {
        match self {
            TaskDescriptor::Leaf { common, .. }
            | TaskDescriptor::Chain { common, .. }
            | TaskDescriptor::ForLoop { common, .. }
            | TaskDescriptor::DoWhileLoop { common, .. }
            | TaskDescriptor::Conditional { common, .. } => common,
        }
    }

    pub fn task_type(&self) -> &str {
        match self {
            TaskDescriptor::Leaf { task_type, .. } => task_type,
            TaskDescriptor::Chain { .. } => TASK_TYPE_CHAIN,
            TaskDescriptor::ForLoop { .. } => TASK_TYPE_FOR_LOOP,
            TaskDescriptor::DoWhileLoop { .. } => TASK_TYPE_DO_WHILE_LOOP,
            TaskDescriptor::Conditional { .. } => TASK_TYPE_CONDITIONAL,
        }
    }
}

/// Wire shape of one task descriptor before validation. Unknown fields
/// are collected into `extra` and become the leaf task's spec.
#[derive(Debug, Clone, Deserialize)]
struct RawTaskDescriptor {
    task: String,
    name: Option<String>,
    job_name: Option<String>,
    working_directory: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, JsonValue>,
    #[serde(default)]
    outputs: BTreeMap<String, JsonValue>,
    #[serde(default)]
    requires_metadata_from: Vec<String>,
    #[serde(default)]
    requires_metadata_from_child: Vec<String>,
    parameter: Option<String>,
    values: Option<Vec<JsonValue>>,
    linear_range: Option<Vec<JsonValue>>,
    log_range: Option<Vec<JsonValue>>,
    iteration_name: Option<String>,
    repeat_criterion: Option<String>,
    criterion: Option<String>,
    task_list: Option<Vec<RawTaskDescriptor>>,
    task_list_else: Option<Vec<RawTaskDescriptor>>,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

fn convert_task_list(
    raw: Option<Vec<RawTaskDescriptor>>,
) -> PipelineResult<Vec<TaskDescriptor>> {
    raw.unwrap_or_default()
        .into_iter()
        .map(TaskDescriptor::try_from)
        .collect()
}

fn fixed_range(tag: &str, values: Vec<JsonValue>) -> PipelineResult<[JsonValue; 3]> {
    <[JsonValue; 3]>::try_from(values).map_err(|v| {
        PipelineError::invalid_descriptor(format!(
            "<{tag}> must be [start, end, count], got {} elements",
            v.len()
        ))
    })
}

impl TryFrom<RawTaskDescriptor> for TaskDescriptor {
    type Error = PipelineError;

    fn try_from(raw: RawTaskDescriptor) -> PipelineResult<Self> {
        let common = CommonFields {
            name: raw.name,
            job_name: raw.job_name,
            working_directory: raw.working_directory,
            requires_metadata_from: raw.requires_metadata_from,
            requires_metadata_from_child: raw.requires_metadata_from_child,
        };

        match raw.task.as_str() {
            TASK_TYPE_CHAIN => Ok(TaskDescriptor::Chain {
                common,
                task_list: convert_task_list(raw.task_list)?,
            }),
            TASK_TYPE_FOR_LOOP => {
                let parameter = raw.parameter.ok_or_else(|| {
                    PipelineError::invalid_descriptor(
                        "<execution_for_loop> requires a <parameter> name",
                    )
                })?;
                let mut ranges: Vec<RangeSpec> = Vec::new();
                if let Some(values) = raw.values {
                    ranges.push(RangeSpec::Values(values));
                }
                if let Some(linear) = raw.linear_range {
                    ranges.push(RangeSpec::Linear(fixed_range("linear_range", linear)?));
                }
                if let Some(log) = raw.log_range {
                    ranges.push(RangeSpec::Log(fixed_range("log_range", log)?));
                }
                let mut ranges = ranges.into_iter();
                let range = match (ranges.next(), ranges.next()) {
                    (Some(range), None) => range,
                    _ => {
                        return Err(PipelineError::invalid_descriptor(
                            "iteration values must be specified as exactly one of \
                             <values>, <linear_range> or <log_range>",
                        ))
                    }
                };
                Ok(TaskDescriptor::ForLoop {
                    common,
                    parameter,
                    range,
                    task_list: convert_task_list(raw.task_list)?,
                })
            }
            TASK_TYPE_DO_WHILE_LOOP => {
                let iteration_name = raw.iteration_name.ok_or_else(|| {
                    PipelineError::invalid_descriptor(
                        "<execution_do_while_loop> requires an <iteration_name>",
                    )
                })?;
                let repeat_criterion = raw.repeat_criterion.ok_or_else(|| {
                    PipelineError::invalid_descriptor(
                        "<execution_do_while_loop> requires a <repeat_criterion>",
                    )
                })?;
                Ok(TaskDescriptor::DoWhileLoop {
                    common,
                    iteration_name,
                    repeat_criterion,
                    task_list: convert_task_list(raw.task_list)?,
                })
            }
            TASK_TYPE_CONDITIONAL => {
                let criterion = raw.criterion.ok_or_else(|| {
                    PipelineError::invalid_descriptor(
                        "<execution_conditional> requires a <criterion>",
                    )
                })?;
                Ok(TaskDescriptor::Conditional {
                    common,
                    criterion,
                    task_list: convert_task_list(raw.task_list)?,
                    else_task_list: convert_task_list(raw.task_list_else)?,
                })
            }
            leaf => {
                if leaf.is_empty() {
                    return Err(PipelineError::invalid_descriptor(
                        "task descriptor has an empty <task> tag",
                    ));
                }
                Ok(TaskDescriptor::Leaf {
                    task_type: leaf.to_string(),
                    common,
                    inputs: raw.inputs,
                    outputs: raw.outputs,
                    spec: raw.extra,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_leaf_chain() {
        let chain = ChainDescriptor::from_json(
            r#"{
                "job_name": "demo",
                "working_directory": "demo_dir",
                "task_list": [
                    {"task": "synthesis_psls", "name": "synth",
                     "outputs": {"lightcurve": "earth.lc"},
                     "duration": 730},
                    {"task": "transit_search",
                     "inputs": {"lightcurve": "earth.lc"}}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(chain.job_name.as_deref(), Some("demo"));
        assert_eq!(chain.task_list.len(), 2);
        match &chain.task_list[0] {
            TaskDescriptor::Leaf {
                task_type,
                common,
                outputs,
                spec,
                ..
            } => {
                assert_eq!(task_type, "synthesis_psls");
                assert_eq!(common.name.as_deref(), Some("synth"));
                assert!(outputs.contains_key("lightcurve"));
                assert_eq!(spec.get("duration"), Some(&serde_json::json!(730)));
            }
            other => panic!("expected leaf, got {other:?}"),
        }
    }

    #[test]
    fn for_loop_requires_exactly_one_range_spec() {
        let none = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_for_loop", "parameter": "size",
                               "task_list": []}]}"#,
        );
        assert!(none.is_err());

        let two = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_for_loop", "parameter": "size",
                               "values": [1, 2], "linear_range": [0, 1, 5],
                               "task_list": []}]}"#,
        );
        assert!(two.is_err());

        let one = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_for_loop", "parameter": "size",
                               "log_range": [1, 100, 3], "task_list": []}]}"#,
        );
        assert!(one.is_ok());
    }

    #[test]
    fn linear_range_must_have_three_elements() {
        let err = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_for_loop", "parameter": "size",
                               "linear_range": [0, 1], "task_list": []}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn do_while_requires_iteration_name_and_criterion() {
        let err = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_do_while_loop", "task_list": []}]}"#,
        );
        assert!(err.is_err());

        let ok = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_do_while_loop",
                               "iteration_name": "pass",
                               "repeat_criterion": "(metadata['pass_index'] < 3)",
                               "requires_metadata_from_child": ["verify"],
                               "task_list": [{"task": "verify", "name": "verify"}]}]}"#,
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn conditional_keeps_both_branches() {
        let chain = ChainDescriptor::from_json(
            r#"{"task_list": [{"task": "execution_conditional",
                               "criterion": "(metadata['snr'] > 5)",
                               "requires_metadata_from": ["search"],
                               "task_list": [{"task": "vetting"}],
                               "task_list_else": [{"task": "discard"}]}]}"#,
        )
        .unwrap();
        match &chain.task_list[0] {
            TaskDescriptor::Conditional {
                task_list,
                else_task_list,
                ..
            } => {
                assert_eq!(task_list.len(), 1);
                assert_eq!(else_task_list.len(), 1);
            }
            other => panic!("expected conditional, got {other:?}"),
        }
    }
}
