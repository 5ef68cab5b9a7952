//! The plugin extension point: node kinds, their executors, and the
//! execution context handed to them.
//!
//! A node kind is a record of `{schema, executor, default_policy}`; dispatch
//! is by registry lookup, never by inheritance. Config validation happens
//! before execution and returns a typed failure.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::ErrorInfo;
use crate::event::{LogLevel, VarOp};
use crate::flow::condition::Condition;
use crate::flow::{EdgeLabel, Flow, Node, NodePolicy};
use crate::storage::VarStore;
use crate::types::PersistentVar;

/// Edge routing hint returned by a successful execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NextHint {
    /// Terminate the current graph with success.
    End,
    /// Follow the outgoing edge carrying this label.
    EdgeLabel { label: EdgeLabel },
}

/// Control directive: a value a node returns that the walker interprets as a
/// loop or sub-execution before advancing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ControlDirective {
    Foreach {
        list_var: String,
        item_var: String,
        subflow_id: String,
    },
    While {
        condition: Condition,
        subflow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u64>,
    },
    ExecuteSubflow {
        subflow_id: String,
    },
    ExecuteFlow {
        flow_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<FxHashMap<String, Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inline: Option<bool>,
    },
}

/// Successful result of one node execution attempt.
///
/// `vars_patch` is an ordered op list applied to the run's variable map;
/// `next` overrides edge selection; `control` runs a directive before the
/// walker advances.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeOutcome {
    pub vars_patch: Vec<VarOp>,
    pub outputs: Option<FxHashMap<String, Value>>,
    pub next: Option<NextHint>,
    pub control: Option<ControlDirective>,
}

impl NodeOutcome {
    #[must_use]
    pub fn ok() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars_patch.push(VarOp::Set {
            name: name.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn delete_var(mut self, name: impl Into<String>) -> Self {
        self.vars_patch.push(VarOp::Delete { name: name.into() });
        self
    }

    #[must_use]
    pub fn with_outputs(mut self, outputs: FxHashMap<String, Value>) -> Self {
        self.outputs = Some(outputs);
        self
    }

    #[must_use]
    pub fn end(mut self) -> Self {
        self.next = Some(NextHint::End);
        self
    }

    #[must_use]
    pub fn follow(mut self, label: EdgeLabel) -> Self {
        self.next = Some(NextHint::EdgeLabel { label });
        self
    }

    #[must_use]
    pub fn with_control(mut self, control: ControlDirective) -> Self {
        self.control = Some(control);
        self
    }
}

/// Sink for node-scoped log lines; implemented by the walker's write queue
/// so plugin logs land in the run's event trace without blocking.
pub trait RunLog: Send + Sync {
    fn log(&self, level: LogLevel, node_id: Option<&str>, message: &str);
}

/// Discarding logger for tests and detached execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullLog;

impl RunLog for NullLog {
    fn log(&self, _level: LogLevel, _node_id: Option<&str>, _message: &str) {}
}

/// Store for binary artifacts captured during execution (screenshots and
/// similar). The engine core only records them; rendering is out of scope.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn save(&self, run_id: &str, name: &str, bytes: Vec<u8>)
        -> Result<(), ErrorInfo>;
    async fn list(&self, run_id: &str) -> Result<Vec<String>, ErrorInfo>;
}

/// Process-local artifact store; the default wiring.
#[derive(Clone, Default)]
pub struct MemoryArtifacts {
    inner: Arc<Mutex<FxHashMap<String, Vec<(String, Vec<u8>)>>>>,
}

impl MemoryArtifacts {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, run_id: &str, name: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .get(run_id)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, bytes)| bytes.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn save(&self, run_id: &str, name: &str, bytes: Vec<u8>) -> Result<(), ErrorInfo> {
        self.inner
            .lock()
            .entry(run_id.to_string())
            .or_default()
            .push((name.to_string(), bytes));
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<String>, ErrorInfo> {
        Ok(self
            .inner
            .lock()
            .get(run_id)
            .map(|items| items.iter().map(|(n, _)| n.clone()).collect())
            .unwrap_or_default())
    }
}

/// Expected JSON type of a config field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Array,
    Object,
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Any => true,
        }
    }

    fn expects(self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "boolean",
            FieldKind::Array => "array",
            FieldKind::Object => "object",
            FieldKind::Any => "any",
        }
    }
}

#[derive(Clone, Debug)]
struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Declarative config schema checked before every execution. Unknown fields
/// are allowed; plugins own their config shape.
#[derive(Clone, Debug, Default)]
pub struct ConfigSchema {
    fields: Vec<FieldSpec>,
}

impl ConfigSchema {
    /// Accepts any config, including null.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    #[must_use]
    pub fn optional_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Validate a node's config blob against this schema.
    pub fn validate(&self, kind: &str, config: &Value) -> Result<(), ErrorInfo> {
        if self.fields.is_empty() {
            return Ok(());
        }
        let Some(map) = config.as_object() else {
            if config.is_null() && self.fields.iter().all(|f| !f.required) {
                return Ok(());
            }
            return Err(ErrorInfo::validation(format!(
                "config for node kind `{kind}` must be an object"
            )));
        };
        for field in &self.fields {
            match map.get(&field.name) {
                Some(value) => {
                    if !field.kind.accepts(value) {
                        return Err(ErrorInfo::validation(format!(
                            "config field `{}` for node kind `{kind}` must be {}",
                            field.name,
                            field.kind.expects()
                        )));
                    }
                }
                None if field.required => {
                    return Err(ErrorInfo::validation(format!(
                        "config for node kind `{kind}` is missing required field `{}`",
                        field.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Execution context passed to a plugin for one attempt.
///
/// The `vars` map is borrowed exclusively for the duration of the attempt;
/// between suspension points the walker owns it uncontested.
pub struct ExecCtx<'a> {
    pub run_id: &'a str,
    pub flow: &'a Flow,
    pub node_id: &'a str,
    pub tab_id: &'a str,
    pub vars: &'a mut FxHashMap<String, Value>,
    pub logger: Arc<dyn RunLog>,
    pub persistent: Arc<dyn VarStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    out_labels: Vec<EdgeLabel>,
}

impl<'a> ExecCtx<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        run_id: &'a str,
        flow: &'a Flow,
        node_id: &'a str,
        tab_id: &'a str,
        vars: &'a mut FxHashMap<String, Value>,
        logger: Arc<dyn RunLog>,
        persistent: Arc<dyn VarStore>,
        artifacts: Arc<dyn ArtifactStore>,
        out_labels: Vec<EdgeLabel>,
    ) -> Self {
        Self {
            run_id,
            flow,
            node_id,
            tab_id,
            vars,
            logger,
            persistent,
            artifacts,
            out_labels,
        }
    }

    pub fn log_info(&self, message: impl AsRef<str>) {
        self.logger
            .log(LogLevel::Info, Some(self.node_id), message.as_ref());
    }

    pub fn log_warn(&self, message: impl AsRef<str>) {
        self.logger
            .log(LogLevel::Warn, Some(self.node_id), message.as_ref());
    }

    pub fn log_error(&self, message: impl AsRef<str>) {
        self.logger
            .log(LogLevel::Error, Some(self.node_id), message.as_ref());
    }

    /// Whether the current node has an outgoing edge with this label.
    /// Plugins use this to pick a routable [`NextHint`].
    #[must_use]
    pub fn has_out_edge(&self, label: &EdgeLabel) -> bool {
        self.out_labels.contains(label)
    }

    pub async fn get_persistent(&self, key: &str) -> Result<Option<PersistentVar>, ErrorInfo> {
        self.persistent.get(key).await.map_err(Into::into)
    }

    pub async fn set_persistent(&self, key: &str, value: Value) -> Result<PersistentVar, ErrorInfo> {
        self.persistent.set(key, value).await.map_err(Into::into)
    }

    pub async fn delete_persistent(&self, key: &str) -> Result<bool, ErrorInfo> {
        self.persistent.delete(key).await.map_err(Into::into)
    }

    pub async fn save_artifact(&self, name: &str, bytes: Vec<u8>) -> Result<(), ErrorInfo> {
        self.artifacts.save(self.run_id, name, bytes).await
    }
}

/// A unit of node work. Implementations must be idempotent: the engine
/// guarantees at-least-once execution, not exactly-once.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &mut ExecCtx<'_>,
        node: &Node,
    ) -> Result<NodeOutcome, ErrorInfo>;
}

/// Everything the engine knows about one node kind.
#[derive(Clone)]
pub struct NodeDefinition {
    pub kind: String,
    pub schema: ConfigSchema,
    pub default_policy: Option<NodePolicy>,
    pub executor: Arc<dyn NodeExecutor>,
}

impl NodeDefinition {
    #[must_use]
    pub fn new(kind: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            kind: kind.into(),
            schema: ConfigSchema::permissive(),
            default_policy: None,
            executor,
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: ConfigSchema) -> Self {
        self.schema = schema;
        self
    }

    #[must_use]
    pub fn with_default_policy(mut self, policy: NodePolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }
}

impl std::fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Registry mapping node kinds to their definitions. Registered at boot,
/// read-mostly afterwards; `reset` exists for tests.
#[derive(Default)]
pub struct PluginRegistry {
    defs: RwLock<FxHashMap<String, Arc<NodeDefinition>>>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: NodeDefinition) {
        self.defs.write().insert(def.kind.clone(), Arc::new(def));
    }

    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<NodeDefinition>> {
        self.defs.read().get(kind).cloned()
    }

    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.defs.read().keys().cloned().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Drop every registration. Test hook.
    pub fn reset(&self) {
        self.defs.write().clear();
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
