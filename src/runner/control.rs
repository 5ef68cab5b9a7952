//! Control-directive execution: foreach, while, execute-subflow, and
//! execute-flow.
//!
//! Every directive entry increments the control depth (capped by
//! `max_control_stack_depth`) and validates the target graph before walking
//! it. Cancellation is observed between iterations and between execute-flow
//! stages; a canceled loop does not emit `control.completed`.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{ErrorCode, ErrorInfo};
use crate::event::{LogLevel, RunEventKind};
use crate::flow::condition::Condition;
use crate::flow::{validate_graph, Flow, Node};
use crate::plugin::ControlDirective;
use crate::types::FlowId;

use super::{GraphRef, RunRunner, Suspension, WalkOutcome};

impl RunRunner {
    /// Run one directive to completion (or cancellation) before the walker
    /// advances past the emitting node.
    pub(crate) async fn run_directive(
        &mut self,
        flow: &Arc<Flow>,
        node: &Node,
        directive: ControlDirective,
    ) -> Result<WalkOutcome, ErrorInfo> {
        if self.control_depth >= self.deps.config.max_control_stack_depth {
            return Err(ErrorInfo::new(
                ErrorCode::ControlStackOverflow,
                format!(
                    "control stack exceeded {} levels at node `{}`",
                    self.deps.config.max_control_stack_depth, node.id
                ),
            ));
        }
        self.control_depth += 1;
        let result = match directive {
            ControlDirective::Foreach {
                list_var,
                item_var,
                subflow_id,
            } => {
                self.run_foreach(flow, node, &list_var, &item_var, &subflow_id)
                    .await
            }
            ControlDirective::While {
                condition,
                subflow_id,
                max_iterations,
            } => {
                self.run_while(flow, node, &condition, &subflow_id, max_iterations)
                    .await
            }
            ControlDirective::ExecuteSubflow { subflow_id } => {
                self.run_execute_subflow(flow, node, &subflow_id).await
            }
            ControlDirective::ExecuteFlow {
                flow_id,
                args,
                inline,
            } => {
                self.run_execute_flow(node, &flow_id, args, inline.unwrap_or(true))
                    .await
            }
        };
        self.control_depth -= 1;
        result
    }

    fn subflow_entry(&self, flow: &Flow, subflow_id: &str) -> Result<String, ErrorInfo> {
        let graph = flow.subflow(subflow_id).ok_or_else(|| {
            ErrorInfo::validation(format!(
                "subflow `{subflow_id}` not found in flow `{}`",
                flow.id
            ))
        })?;
        validate_graph(graph).map_err(ErrorInfo::from)?;
        Ok(graph.entry_node_id.clone())
    }

    async fn run_foreach(
        &mut self,
        flow: &Arc<Flow>,
        node: &Node,
        list_var: &str,
        item_var: &str,
        subflow_id: &str,
    ) -> Result<WalkOutcome, ErrorInfo> {
        let items: Vec<Value> = {
            let vars = self.vars.lock().await;
            match vars.get(list_var) {
                Some(Value::Array(items)) => items.clone(),
                Some(other) => {
                    return Err(ErrorInfo::validation(format!(
                        "foreach list `{list_var}` is {}, expected an array",
                        json_type_name(other)
                    )));
                }
                None => {
                    return Err(ErrorInfo::validation(format!(
                        "foreach list `{list_var}` is not set"
                    )));
                }
            }
        };
        let entry = self.subflow_entry(flow, subflow_id)?;
        let total = items.len() as u64;
        let started = Instant::now();

        self.writer.event(RunEventKind::ControlStarted {
            node_id: node.id.clone(),
            kind: "foreach".to_string(),
            subflow_id: Some(subflow_id.to_string()),
            flow_id: None,
            total_iterations: Some(total),
        });

        let index_var = format!("{item_var}_index");
        for (i, element) in items.into_iter().enumerate() {
            if let WalkOutcome::Canceled = self.iteration_gate().await? {
                return Ok(WalkOutcome::Canceled);
            }
            self.writer.event(RunEventKind::ControlIteration {
                node_id: node.id.clone(),
                iteration: i as u64,
                total_iterations: Some(total),
            });
            {
                let mut vars = self.vars.lock().await;
                vars.insert(item_var.to_string(), element);
                vars.insert(index_var.clone(), Value::from(i as u64));
            }
            match self
                .walk(flow.clone(), GraphRef::Subflow(subflow_id.to_string()), entry.clone())
                .await?
            {
                WalkOutcome::Canceled => return Ok(WalkOutcome::Canceled),
                WalkOutcome::Completed => {}
            }
        }

        self.writer.event(RunEventKind::ControlCompleted {
            node_id: node.id.clone(),
            total_iterations: Some(total),
            took_ms: started.elapsed().as_millis() as u64,
        });
        Ok(WalkOutcome::Completed)
    }

    async fn run_while(
        &mut self,
        flow: &Arc<Flow>,
        node: &Node,
        condition: &Condition,
        subflow_id: &str,
        max_iterations: Option<u64>,
    ) -> Result<WalkOutcome, ErrorInfo> {
        let cap = max_iterations.unwrap_or(self.deps.config.default_while_max_iterations);
        if cap == 0 {
            return Err(ErrorInfo::validation(
                "while maxIterations must be a positive integer",
            ));
        }
        let entry = self.subflow_entry(flow, subflow_id)?;
        let started = Instant::now();

        self.writer.event(RunEventKind::ControlStarted {
            node_id: node.id.clone(),
            kind: "while".to_string(),
            subflow_id: Some(subflow_id.to_string()),
            flow_id: None,
            total_iterations: None,
        });

        let mut iteration: u64 = 0;
        loop {
            if iteration >= cap {
                self.writer.event(RunEventKind::Log {
                    level: LogLevel::Warn,
                    message: format!(
                        "while at node `{}` reached its iteration cap of {cap}",
                        node.id
                    ),
                    node_id: Some(node.id.clone()),
                });
                break;
            }
            if let WalkOutcome::Canceled = self.iteration_gate().await? {
                return Ok(WalkOutcome::Canceled);
            }
            let proceed = {
                let vars = self.vars.lock().await;
                condition.evaluate(&vars)
            };
            if !proceed {
                break;
            }
            self.writer.event(RunEventKind::ControlIteration {
                node_id: node.id.clone(),
                iteration,
                total_iterations: None,
            });
            match self
                .walk(flow.clone(), GraphRef::Subflow(subflow_id.to_string()), entry.clone())
                .await?
            {
                WalkOutcome::Canceled => return Ok(WalkOutcome::Canceled),
                WalkOutcome::Completed => {}
            }
            iteration += 1;
        }

        self.writer.event(RunEventKind::ControlCompleted {
            node_id: node.id.clone(),
            total_iterations: Some(iteration),
            took_ms: started.elapsed().as_millis() as u64,
        });
        Ok(WalkOutcome::Completed)
    }

    async fn run_execute_subflow(
        &mut self,
        flow: &Arc<Flow>,
        node: &Node,
        subflow_id: &str,
    ) -> Result<WalkOutcome, ErrorInfo> {
        let entry = self.subflow_entry(flow, subflow_id)?;
        let started = Instant::now();
        self.writer.event(RunEventKind::ControlStarted {
            node_id: node.id.clone(),
            kind: "executeSubflow".to_string(),
            subflow_id: Some(subflow_id.to_string()),
            flow_id: None,
            total_iterations: None,
        });
        match self
            .walk(flow.clone(), GraphRef::Subflow(subflow_id.to_string()), entry)
            .await?
        {
            WalkOutcome::Canceled => return Ok(WalkOutcome::Canceled),
            WalkOutcome::Completed => {}
        }
        self.writer.event(RunEventKind::ControlCompleted {
            node_id: node.id.clone(),
            total_iterations: None,
            took_ms: started.elapsed().as_millis() as u64,
        });
        Ok(WalkOutcome::Completed)
    }

    async fn run_execute_flow(
        &mut self,
        node: &Node,
        flow_id: &str,
        args: Option<rustc_hash::FxHashMap<String, Value>>,
        inline: bool,
    ) -> Result<WalkOutcome, ErrorInfo> {
        if self.flow_stack.iter().any(|id| id == flow_id) {
            let mut path: Vec<FlowId> = self.flow_stack.clone();
            path.push(flow_id.to_string());
            return Err(ErrorInfo::new(
                ErrorCode::FlowCycle,
                format!("flow call cycle: {}", path.join(" -> ")),
            )
            .with_data(serde_json::json!({ "path": path })));
        }

        let target = self
            .deps
            .storage
            .flows
            .get(flow_id)
            .await
            .map_err(ErrorInfo::from)?
            .ok_or_else(|| {
                ErrorInfo::new(ErrorCode::FlowNotFound, format!("flow `{flow_id}` not found"))
            })?;
        validate_graph(&target.graph).map_err(ErrorInfo::from)?;

        let started = Instant::now();
        self.writer.event(RunEventKind::ControlStarted {
            node_id: node.id.clone(),
            kind: "executeFlow".to_string(),
            subflow_id: None,
            flow_id: Some(flow_id.to_string()),
            total_iterations: None,
        });

        // Non-inline runs on the shared map but restores this snapshot on
        // every exit path, including failure and cancellation.
        let saved = if inline {
            None
        } else {
            Some(self.vars.lock().await.clone())
        };

        {
            let mut vars = self.vars.lock().await;
            for (key, value) in &target.var_defaults {
                if !vars.contains_key(key) {
                    vars.insert(key.clone(), value.clone());
                }
            }
            if let Some(args) = &args {
                for (key, value) in args {
                    vars.insert(key.clone(), value.clone());
                }
            }
        }

        if let WalkOutcome::Canceled = self.iteration_gate().await? {
            if let Some(saved) = saved {
                *self.vars.lock().await = saved;
            }
            return Ok(WalkOutcome::Canceled);
        }

        let entry = target.graph.entry_node_id.clone();
        let target = Arc::new(target);
        self.flow_stack.push(flow_id.to_string());
        let result = self.walk(target, GraphRef::Main, entry).await;
        self.flow_stack.pop();

        if let Some(saved) = saved {
            *self.vars.lock().await = saved;
        }

        match result? {
            WalkOutcome::Canceled => Ok(WalkOutcome::Canceled),
            WalkOutcome::Completed => {
                self.writer.event(RunEventKind::ControlCompleted {
                    node_id: node.id.clone(),
                    total_iterations: None,
                    took_ms: started.elapsed().as_millis() as u64,
                });
                Ok(WalkOutcome::Completed)
            }
        }
    }

    /// Iteration boundary: a suspension point expressed in walk outcomes.
    async fn iteration_gate(&mut self) -> Result<WalkOutcome, ErrorInfo> {
        match self.suspension_point().await {
            Suspension::Continue => Ok(WalkOutcome::Completed),
            Suspension::Canceled => Ok(WalkOutcome::Canceled),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
