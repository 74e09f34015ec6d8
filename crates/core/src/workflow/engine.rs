//! Bounded-concurrency workflow execution engine.
//!
//! Executions enter a FIFO queue and are claimed by `tick` while fewer than
//! `max_concurrent_executions` are running. Each claimed execution is driven
//! by one pass that runs the definition's actions in order and stops at the
//! first action that fails or waits for a retry. A retry re-enters through a
//! later tick once its backoff has elapsed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::config::WorkflowConfig;
use crate::context::ContextCache;
use crate::domain::business::{BusinessContext, BusinessId};
use crate::domain::workflow::{
    ActionResult, ActionStatus, ExecutionId, ExecutionRequest, ExecutionStatus,
    WorkflowDefinition, WorkflowExecution, WorkflowId, WorkflowTrigger,
};
use crate::errors::{ApplicationError, DomainError};
use crate::workflow::actions::{validate_parameters, ActionExecutor, ActionScope};
use crate::workflow::trigger::{conditions_hold, evaluate_trigger};

const ACTOR: &str = "workflow-engine";

#[derive(Default)]
struct EngineState {
    definitions: HashMap<WorkflowId, WorkflowDefinition>,
    executions: HashMap<ExecutionId, WorkflowExecution>,
    queue: VecDeque<ExecutionId>,
    running: HashSet<ExecutionId>,
    in_flight: HashSet<ExecutionId>,
    retry_due: HashMap<ExecutionId, Instant>,
    finished: VecDeque<ExecutionId>,
}

impl EngineState {
    fn execution_mut(&mut self, id: &ExecutionId) -> Result<&mut WorkflowExecution, ApplicationError> {
        self.executions.get_mut(id).ok_or_else(|| ApplicationError::not_found("execution", id.0.clone()))
    }

    fn has_running_execution(&self, workflow_id: &WorkflowId) -> bool {
        self.running.iter().any(|id| {
            self.executions.get(id).is_some_and(|execution| &execution.workflow_id == workflow_id)
        })
    }
}

/// Which executions a tick handed to workers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub started: Vec<ExecutionId>,
    pub resumed: Vec<ExecutionId>,
}

enum PassOutcome {
    Completed,
    Failed(String),
    RetryScheduled,
    Cancelled,
}

pub struct WorkflowEngine {
    config: WorkflowConfig,
    contexts: Arc<ContextCache>,
    executor: Arc<dyn ActionExecutor>,
    audit: Arc<dyn AuditSink>,
    state: Mutex<EngineState>,
    wake: Notify,
    idle: Notify,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowConfig,
        contexts: Arc<ContextCache>,
        executor: Arc<dyn ActionExecutor>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            config,
            contexts,
            executor,
            audit,
            state: Mutex::new(EngineState::default()),
            wake: Notify::new(),
            idle: Notify::new(),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub async fn register_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        validate_definition(&definition)?;

        let mut state = self.state.lock().await;
        if state.definitions.contains_key(&definition.id) {
            return Err(ApplicationError::InvalidInput(format!(
                "workflow {} is already registered",
                definition.id
            )));
        }

        let now = Utc::now();
        definition.version = 1;
        definition.created_at = now;
        definition.updated_at = now;
        state.definitions.insert(definition.id.clone(), definition.clone());
        drop(state);

        info!(
            event_name = "workflow.definition.registered",
            workflow_id = %definition.id,
            business_id = %definition.business_id,
            actions = definition.actions.len(),
            "workflow registered"
        );
        self.emit_definition_audit(&definition, "workflow.definition.registered");

        Ok(definition)
    }

    /// Replaces a definition and bumps its version. Refused while any
    /// execution of the workflow is running.
    pub async fn update_workflow(
        &self,
        mut definition: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        validate_definition(&definition)?;

        let mut state = self.state.lock().await;
        if state.has_running_execution(&definition.id) {
            return Err(ApplicationError::InvalidInput(format!(
                "workflow {} has running executions",
                definition.id
            )));
        }
        let current = state
            .definitions
            .get(&definition.id)
            .ok_or_else(|| ApplicationError::not_found("workflow", definition.id.0.clone()))?;

        definition.version = current.version + 1;
        definition.created_at = current.created_at;
        definition.updated_at = Utc::now();
        state.definitions.insert(definition.id.clone(), definition.clone());
        drop(state);

        self.emit_definition_audit(&definition, "workflow.definition.updated");
        Ok(definition)
    }

    pub async fn deactivate_workflow(&self, workflow_id: &WorkflowId) -> Result<(), ApplicationError> {
        let mut state = self.state.lock().await;
        let definition = state
            .definitions
            .get_mut(workflow_id)
            .ok_or_else(|| ApplicationError::not_found("workflow", workflow_id.0.clone()))?;
        definition.active = false;
        definition.updated_at = Utc::now();
        let definition = definition.clone();
        drop(state);

        self.emit_definition_audit(&definition, "workflow.definition.deactivated");
        Ok(())
    }

    pub async fn workflow(&self, workflow_id: &WorkflowId) -> Result<WorkflowDefinition, ApplicationError> {
        self.state
            .lock()
            .await
            .definitions
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found("workflow", workflow_id.0.clone()))
    }

    pub async fn workflows(&self, business_id: &BusinessId) -> Vec<WorkflowDefinition> {
        let state = self.state.lock().await;
        let mut definitions: Vec<_> = state
            .definitions
            .values()
            .filter(|definition| &definition.business_id == business_id)
            .cloned()
            .collect();
        definitions.sort_by(|left, right| left.id.cmp(&right.id));
        definitions
    }

    /// Queues a run and wakes the scheduler. The run starts on the next tick
    /// with a free slot.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionId, ApplicationError> {
        let mut state = self.state.lock().await;
        let definition = state
            .definitions
            .get(&request.workflow_id)
            .ok_or_else(|| ApplicationError::not_found("workflow", request.workflow_id.0.clone()))?;

        if !definition.active {
            return Err(ApplicationError::InvalidInput(format!(
                "workflow {} is inactive",
                definition.id
            )));
        }
        if definition.business_id != request.business_id {
            return Err(ApplicationError::InvalidInput(format!(
                "workflow {} does not belong to business {}",
                definition.id, request.business_id
            )));
        }

        let execution = WorkflowExecution {
            id: ExecutionId::generate(),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version,
            business_id: request.business_id,
            status: ExecutionStatus::Pending,
            triggered_by: request.triggered_by,
            context: request.context,
            action_results: definition
                .actions
                .iter()
                .map(|action| ActionResult::pending(action.id.clone()))
                .collect(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        };
        let execution_id = execution.id.clone();
        let queued = execution.clone();
        state.queue.push_back(execution_id.clone());
        state.executions.insert(execution_id.clone(), execution);
        let queue_depth = state.queue.len();
        drop(state);

        info!(
            event_name = "workflow.execution.queued",
            correlation_id = %execution_id,
            execution_id = %execution_id,
            workflow_id = %queued.workflow_id,
            business_id = %queued.business_id,
            triggered_by = %queued.triggered_by,
            queue_depth,
            "workflow execution queued"
        );
        self.emit_execution_audit(&queued, "workflow.execution.queued", AuditOutcome::Success, None);
        self.wake.notify_one();

        Ok(execution_id)
    }

    pub async fn get_execution_status(
        &self,
        execution_id: &ExecutionId,
    ) -> Result<WorkflowExecution, ApplicationError> {
        self.state
            .lock()
            .await
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ApplicationError::not_found("execution", execution_id.0.clone()))
    }

    pub async fn executions(&self, business_id: &BusinessId) -> Vec<WorkflowExecution> {
        let state = self.state.lock().await;
        let mut executions: Vec<_> = state
            .executions
            .values()
            .filter(|execution| &execution.business_id == business_id)
            .cloned()
            .collect();
        executions.sort_by(|left, right| left.created_at.cmp(&right.created_at));
        executions
    }

    /// Cooperative cancel: only a running execution can be cancelled. An
    /// action already dispatched finishes, but nothing after it is started.
    pub async fn cancel_execution(&self, execution_id: &ExecutionId) -> Result<bool, ApplicationError> {
        let mut state = self.state.lock().await;
        let execution = state.execution_mut(execution_id)?;
        if execution.status != ExecutionStatus::Running {
            debug!(
                event_name = "workflow.execution.cancel_ignored",
                execution_id = %execution_id,
                status = execution.status.as_str(),
                "cancel ignored for non-running execution"
            );
            return Ok(false);
        }

        transition(execution, ExecutionStatus::Cancelled)?;
        execution.completed_at = Some(Utc::now());
        skip_pending(execution);
        let cancelled = execution.clone();
        self.finish(&mut state, execution_id);
        drop(state);

        info!(
            event_name = "workflow.execution.cancelled",
            correlation_id = %execution_id,
            execution_id = %execution_id,
            workflow_id = %cancelled.workflow_id,
            "workflow execution cancelled"
        );
        self.emit_execution_audit(&cancelled, "workflow.execution.cancelled", AuditOutcome::Success, None);
        self.wake.notify_one();
        Ok(true)
    }

    /// Checks a definition's trigger against `context` plus a fresh business
    /// snapshot mounted under `business`.
    pub async fn evaluate_trigger(
        &self,
        workflow_id: &WorkflowId,
        context: &Value,
        event: Option<&str>,
    ) -> Result<bool, ApplicationError> {
        let definition = self.workflow(workflow_id).await?;
        if matches!(definition.trigger, WorkflowTrigger::Manual | WorkflowTrigger::TimeBased { .. }) {
            return Ok(true);
        }
        let business = self.contexts.get(&definition.business_id).await?;
        let scope = evaluation_scope(context, &business)?;
        Ok(evaluate_trigger(&definition.trigger, &scope, event))
    }

    /// Executes every active event-triggered workflow of the business whose
    /// event type matches and whose conditions hold.
    pub async fn emit_event(
        &self,
        business_id: &BusinessId,
        event_type: &str,
        context: Value,
    ) -> Result<Vec<ExecutionId>, ApplicationError> {
        let candidates: Vec<WorkflowDefinition> = {
            let state = self.state.lock().await;
            let mut candidates: Vec<_> = state
                .definitions
                .values()
                .filter(|definition| definition.active && &definition.business_id == business_id)
                .filter(|definition| {
                    matches!(&definition.trigger, WorkflowTrigger::EventBased { event_type: expected, .. } if expected == event_type)
                })
                .cloned()
                .collect();
            candidates.sort_by(|left, right| left.id.cmp(&right.id));
            candidates
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let needs_business = candidates.iter().any(|definition| {
            matches!(&definition.trigger, WorkflowTrigger::EventBased { conditions, .. } if !conditions.is_empty())
        });
        let scope = if needs_business {
            let business = self.contexts.get(business_id).await?;
            evaluation_scope(&context, &business)?
        } else {
            context.clone()
        };

        let mut started = Vec::new();
        for definition in candidates {
            let WorkflowTrigger::EventBased { conditions, .. } = &definition.trigger else {
                continue;
            };
            if !conditions_hold(conditions, &scope) {
                continue;
            }
            let execution_id = self
                .execute(ExecutionRequest {
                    workflow_id: definition.id.clone(),
                    business_id: business_id.clone(),
                    triggered_by: format!("event:{event_type}"),
                    context: context.clone(),
                })
                .await?;
            started.push(execution_id);
        }

        debug!(
            event_name = "workflow.event.dispatched",
            business_id = %business_id,
            event_type,
            executions = started.len(),
            "workflow event dispatched"
        );
        Ok(started)
    }

    /// Claims queued executions up to the concurrency cap and resumes running
    /// executions whose retry backoff has elapsed. Each claimed execution is
    /// driven on its own task.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport::default();
        let mut claimed = Vec::new();
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            let due: Vec<ExecutionId> = state
                .retry_due
                .iter()
                .filter(|(_, due_at)| **due_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for execution_id in due {
                if state.in_flight.contains(&execution_id) {
                    continue;
                }
                state.retry_due.remove(&execution_id);
                state.in_flight.insert(execution_id.clone());
                report.resumed.push(execution_id);
            }

            while state.running.len() < self.config.max_concurrent_executions {
                let Some(execution_id) = state.queue.pop_front() else {
                    break;
                };
                let definition_actions = state
                    .executions
                    .get(&execution_id)
                    .and_then(|execution| state.definitions.get(&execution.workflow_id))
                    .map(|definition| (definition.version, definition.actions.clone()));
                let Ok(execution) = state.execution_mut(&execution_id) else {
                    continue;
                };
                if execution.status != ExecutionStatus::Pending {
                    continue;
                }
                if let Some((version, actions)) = definition_actions {
                    if version != execution.workflow_version {
                        execution.workflow_version = version;
                        execution.action_results =
                            actions.iter().map(|action| ActionResult::pending(action.id.clone())).collect();
                    }
                }
                if transition(execution, ExecutionStatus::Running).is_err() {
                    continue;
                }
                execution.started_at = Some(Utc::now());
                claimed.push(execution.clone());
                state.running.insert(execution_id.clone());
                state.in_flight.insert(execution_id.clone());
                report.started.push(execution_id);
            }
        }

        for execution in &claimed {
            info!(
                event_name = "workflow.execution.started",
                correlation_id = %execution.id,
                execution_id = %execution.id,
                workflow_id = %execution.workflow_id,
                business_id = %execution.business_id,
                "workflow execution started"
            );
            self.emit_execution_audit(execution, "workflow.execution.started", AuditOutcome::Success, None);
        }

        for execution_id in report.started.iter().chain(report.resumed.iter()) {
            let engine = Arc::clone(self);
            let execution_id = execution_id.clone();
            tokio::spawn(async move { engine.run_pass(execution_id).await });
        }

        report
    }

    /// Resolves once no execution is being driven by a worker.
    pub async fn wait_for_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state.lock().await.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Ticks on every interval and whenever new work is queued, until
    /// `shutdown` flips to true.
    pub async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            event_name = "workflow.scheduler.started",
            tick_interval_ms = self.config.tick_interval_ms,
            max_concurrent_executions = self.config.max_concurrent_executions,
            "workflow scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
            self.tick().await;
        }

        info!(event_name = "workflow.scheduler.stopped", "workflow scheduler stopped");
    }

    async fn run_pass(self: Arc<Self>, execution_id: ExecutionId) {
        let outcome = self.drive(&execution_id).await;

        let mut state = self.state.lock().await;
        state.in_flight.remove(&execution_id);

        let finished = match outcome {
            Ok(PassOutcome::RetryScheduled) | Ok(PassOutcome::Cancelled) => None,
            Ok(PassOutcome::Completed) => {
                settle(&mut state, &execution_id, ExecutionStatus::Completed, None)
            }
            Ok(PassOutcome::Failed(error)) | Err(error) => {
                settle(&mut state, &execution_id, ExecutionStatus::Failed, Some(error))
            }
        };

        if finished.is_some() {
            self.finish(&mut state, &execution_id);
        }
        let idle = state.in_flight.is_empty();
        drop(state);

        if let Some(execution) = finished {
            if execution.status == ExecutionStatus::Completed {
                info!(
                    event_name = "workflow.execution.completed",
                    correlation_id = %execution.id,
                    execution_id = %execution.id,
                    workflow_id = %execution.workflow_id,
                    "workflow execution completed"
                );
                self.emit_execution_audit(
                    &execution,
                    "workflow.execution.completed",
                    AuditOutcome::Success,
                    None,
                );
            } else {
                warn!(
                    event_name = "workflow.execution.failed",
                    correlation_id = %execution.id,
                    execution_id = %execution.id,
                    workflow_id = %execution.workflow_id,
                    error = execution.error.as_deref().unwrap_or("unknown"),
                    "workflow execution failed"
                );
                self.emit_execution_audit(
                    &execution,
                    "workflow.execution.failed",
                    AuditOutcome::Failed,
                    execution.error.clone(),
                );
            }
            self.wake.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Runs the remaining actions of one execution strictly in order.
    /// `Err` carries an execution-level failure such as an unavailable
    /// business context.
    async fn drive(self: &Arc<Self>, execution_id: &ExecutionId) -> Result<PassOutcome, String> {
        let (execution, definition) = {
            let state = self.state.lock().await;
            let execution = state
                .executions
                .get(execution_id)
                .cloned()
                .ok_or_else(|| format!("execution {execution_id} disappeared"))?;
            let definition = state
                .definitions
                .get(&execution.workflow_id)
                .cloned()
                .ok_or_else(|| format!("workflow {} is not registered", execution.workflow_id))?;
            (execution, definition)
        };

        let business = self
            .contexts
            .get(&execution.business_id)
            .await
            .map_err(|error| format!("business context unavailable: {error}"))?;
        let scope_values = evaluation_scope(&execution.context, &business).map_err(|error| error.to_string())?;
        let scope = ActionScope {
            execution_id: &execution_id.0,
            business: business.as_ref(),
            values: &scope_values,
        };

        for (index, action) in definition.actions.iter().enumerate() {
            let retry_count = {
                let mut state = self.state.lock().await;
                let Ok(execution) = state.execution_mut(execution_id) else {
                    return Err(format!("execution {execution_id} disappeared"));
                };
                if execution.status != ExecutionStatus::Running {
                    return Ok(PassOutcome::Cancelled);
                }
                let Some(result) = execution.action_results.get_mut(index) else {
                    return Err(format!("execution {execution_id} has no slot for action {}", action.id));
                };
                match result.status {
                    ActionStatus::Completed | ActionStatus::Skipped => continue,
                    ActionStatus::Pending | ActionStatus::Running | ActionStatus::Failed => {}
                }
                result.status = ActionStatus::Running;
                result.started_at = Some(Utc::now());
                result.next_attempt_at = None;
                result.retry_count
            };

            debug!(
                event_name = "workflow.action.started",
                correlation_id = %execution_id,
                execution_id = %execution_id,
                action_id = %action.id,
                action_type = action.action_type.as_str(),
                retry_count,
                "workflow action started"
            );

            let outcome = self.executor.execute(action, &scope).await;

            let mut state = self.state.lock().await;
            let Ok(execution) = state.execution_mut(execution_id) else {
                return Err(format!("execution {execution_id} disappeared"));
            };
            let still_running = execution.status == ExecutionStatus::Running;
            let Some(result) = execution.action_results.get_mut(index) else {
                return Err(format!("execution {execution_id} has no slot for action {}", action.id));
            };

            match outcome {
                Ok(output) => {
                    result.status = ActionStatus::Completed;
                    result.completed_at = Some(Utc::now());
                    result.output = Some(output);
                    result.error = None;
                    let audit_target = execution.clone();
                    drop(state);
                    self.emit_action_audit(&audit_target, &action.id, "workflow.action.completed", AuditOutcome::Success, None);
                    if !still_running {
                        return Ok(PassOutcome::Cancelled);
                    }
                }
                Err(error) => {
                    let message = error.to_string();
                    let retry = action
                        .retry_policy
                        .as_ref()
                        .filter(|policy| result.retry_count < policy.max_retries && still_running);

                    if let Some(policy) = retry {
                        result.retry_count += 1;
                        let delay = policy.delay_for(result.retry_count);
                        result.status = ActionStatus::Pending;
                        result.error = Some(message.clone());
                        result.next_attempt_at = chrono::Duration::from_std(delay)
                            .ok()
                            .map(|delay| Utc::now() + delay);
                        let attempt = result.retry_count;
                        let audit_target = execution.clone();
                        state.retry_due.insert(execution_id.clone(), Instant::now() + delay);
                        drop(state);

                        warn!(
                            event_name = "workflow.action.retry_scheduled",
                            correlation_id = %execution_id,
                            execution_id = %execution_id,
                            action_id = %action.id,
                            retry_count = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "workflow action failed; retry scheduled"
                        );
                        self.emit_action_audit(
                            &audit_target,
                            &action.id,
                            "workflow.action.retry_scheduled",
                            AuditOutcome::Rejected,
                            Some(message),
                        );

                        let engine = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            engine.wake.notify_one();
                        });
                        return Ok(PassOutcome::RetryScheduled);
                    }

                    result.status = ActionStatus::Failed;
                    result.completed_at = Some(Utc::now());
                    result.error = Some(message.clone());
                    let audit_target = execution.clone();
                    drop(state);

                    self.emit_action_audit(
                        &audit_target,
                        &action.id,
                        "workflow.action.failed",
                        AuditOutcome::Failed,
                        Some(message.clone()),
                    );
                    if !still_running {
                        return Ok(PassOutcome::Cancelled);
                    }
                    return Ok(PassOutcome::Failed(format!("action {} failed: {message}", action.id)));
                }
            }
        }

        Ok(PassOutcome::Completed)
    }

    fn finish(&self, state: &mut EngineState, execution_id: &ExecutionId) {
        state.running.remove(execution_id);
        state.retry_due.remove(execution_id);
        state.finished.push_back(execution_id.clone());
        while state.finished.len() > self.config.max_history {
            if let Some(oldest) = state.finished.pop_front() {
                state.executions.remove(&oldest);
            }
        }
    }

    fn emit_definition_audit(&self, definition: &WorkflowDefinition, event_type: &str) {
        let context = AuditContext::new(
            Some(definition.business_id.clone()),
            Some(definition.id.0.clone()),
            definition.id.0.clone(),
            ACTOR,
        );
        self.audit.emit(
            AuditEvent::new(&context, event_type, AuditCategory::Workflow, AuditOutcome::Success)
                .with_metadata("version", definition.version.to_string())
                .with_metadata("active", definition.active.to_string()),
        );
    }

    fn emit_execution_audit(
        &self,
        execution: &WorkflowExecution,
        event_type: &str,
        outcome: AuditOutcome,
        error: Option<String>,
    ) {
        let context = AuditContext::new(
            Some(execution.business_id.clone()),
            Some(execution.id.0.clone()),
            execution.id.0.clone(),
            ACTOR,
        );
        let mut event = AuditEvent::new(&context, event_type, AuditCategory::Workflow, outcome)
            .with_metadata("workflow_id", execution.workflow_id.0.clone())
            .with_metadata("status", execution.status.as_str())
            .with_metadata("triggered_by", execution.triggered_by.clone());
        if let Some(error) = error {
            event = event.with_metadata("error", error);
        }
        self.audit.emit(event);
    }

    fn emit_action_audit(
        &self,
        execution: &WorkflowExecution,
        action_id: &str,
        event_type: &str,
        outcome: AuditOutcome,
        error: Option<String>,
    ) {
        let context = AuditContext::new(
            Some(execution.business_id.clone()),
            Some(execution.id.0.clone()),
            execution.id.0.clone(),
            ACTOR,
        );
        let retry_count = execution
            .action_results
            .iter()
            .find(|result| result.action_id == action_id)
            .map(|result| result.retry_count)
            .unwrap_or_default();
        let mut event = AuditEvent::new(&context, event_type, AuditCategory::Workflow, outcome)
            .with_metadata("action_id", action_id)
            .with_metadata("retry_count", retry_count.to_string());
        if let Some(error) = error {
            event = event.with_metadata("error", error);
        }
        self.audit.emit(event);
    }
}

fn validate_definition(definition: &WorkflowDefinition) -> Result<(), ApplicationError> {
    if definition.id.0.trim().is_empty() {
        return Err(ApplicationError::InvalidInput("workflow id must not be empty".to_string()));
    }
    if definition.name.trim().is_empty() {
        return Err(ApplicationError::InvalidInput("workflow name must not be empty".to_string()));
    }
    if definition.actions.is_empty() {
        return Err(ApplicationError::InvalidInput(format!(
            "workflow {} must define at least one action",
            definition.id
        )));
    }

    let mut seen = HashSet::new();
    for action in &definition.actions {
        if !seen.insert(action.id.as_str()) {
            return Err(ApplicationError::InvalidInput(format!(
                "workflow {} repeats action id `{}`",
                definition.id, action.id
            )));
        }
        if let Some(policy) = &action.retry_policy {
            if policy.backoff_multiplier < 1.0 || !policy.backoff_multiplier.is_finite() {
                return Err(ApplicationError::InvalidInput(format!(
                    "action `{}` backoff_multiplier must be at least 1.0",
                    action.id
                )));
            }
        }
        validate_parameters(action).map_err(|error| ApplicationError::InvalidInput(error.to_string()))?;
    }
    Ok(())
}

fn transition(execution: &mut WorkflowExecution, to: ExecutionStatus) -> Result<(), DomainError> {
    if !execution.status.can_transition_to(to) {
        return Err(DomainError::InvalidExecutionTransition { from: execution.status, to });
    }
    execution.status = to;
    Ok(())
}

/// Moves a running execution to its terminal status. `None` when it already
/// left `running`, e.g. through a cancel that raced the pass.
fn settle(
    state: &mut EngineState,
    execution_id: &ExecutionId,
    to: ExecutionStatus,
    error: Option<String>,
) -> Option<WorkflowExecution> {
    let execution = state.executions.get_mut(execution_id)?;
    transition(execution, to).ok()?;
    execution.completed_at = Some(Utc::now());
    if let Some(error) = error {
        execution.error = Some(error);
        skip_pending(execution);
    }
    Some(execution.clone())
}

fn skip_pending(execution: &mut WorkflowExecution) {
    for result in &mut execution.action_results {
        if result.status == ActionStatus::Pending {
            result.status = ActionStatus::Skipped;
            result.next_attempt_at = None;
        }
    }
}

/// Execution context with the business snapshot mounted under `business`.
fn evaluation_scope(context: &Value, business: &BusinessContext) -> Result<Value, ApplicationError> {
    let business = serde_json::to_value(business)
        .map_err(|error| ApplicationError::Persistence(format!("business context encoding: {error}")))?;
    let mut scope = match context {
        Value::Object(map) => Value::Object(map.clone()),
        Value::Null => json!({}),
        other => json!({ "value": other.clone() }),
    };
    if let Value::Object(map) = &mut scope {
        map.insert("business".to_string(), business);
    }
    Ok(scope)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::WorkflowEngine;
    use crate::audit::InMemoryAuditSink;
    use crate::config::{ContextCacheConfig, WorkflowConfig};
    use crate::context::ContextCache;
    use crate::domain::business::{
        BusinessId, BusinessProfile, FinancialSnapshot, IndustryProfile, OperationalMetrics,
        RecentActivity,
    };
    use crate::domain::workflow::{
        ActionStatus, ActionType, ConditionOperator, ExecutionRequest, ExecutionStatus,
        RetryPolicy, TriggerCondition, WorkflowAction, WorkflowDefinition, WorkflowId,
        WorkflowTrigger,
    };
    use crate::errors::ApplicationError;
    use crate::ports::{BusinessDataProvider, ProviderError};
    use crate::workflow::actions::{ActionError, ActionExecutor, ActionScope};

    struct StaticProvider;

    #[async_trait]
    impl BusinessDataProvider for StaticProvider {
        async fn profile(&self, _business_id: &BusinessId) -> Result<BusinessProfile, ProviderError> {
            Ok(BusinessProfile {
                name: "Reyes Plumbing".to_string(),
                industry: "plumbing".to_string(),
                phone: None,
                email: Some("office@reyes.example".to_string()),
                hours: "Mon-Fri 8am-6pm".to_string(),
                services: Vec::new(),
                available_slots: Vec::new(),
            })
        }

        async fn recent_activity(
            &self,
            _business_id: &BusinessId,
            window_days: u32,
        ) -> Result<RecentActivity, ProviderError> {
            Ok(RecentActivity { window_days, ..RecentActivity::default() })
        }

        async fn financial_snapshot(&self, _business_id: &BusinessId) -> Result<FinancialSnapshot, ProviderError> {
            Ok(FinancialSnapshot { overdue_invoice_count: 2, ..FinancialSnapshot::default() })
        }

        async fn operational_metrics(&self, _business_id: &BusinessId) -> Result<OperationalMetrics, ProviderError> {
            Ok(OperationalMetrics::default())
        }

        async fn industry_profile(&self, _business_id: &BusinessId) -> Result<IndustryProfile, ProviderError> {
            Ok(IndustryProfile::default())
        }
    }

    /// Records every action it runs. `fail` ids always fail; `flaky` ids fail
    /// on their first `flaky_failures` attempts.
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: StdMutex<Vec<String>>,
        fail: Vec<String>,
        flaky: Vec<String>,
        flaky_failures: usize,
        flaky_attempts: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ActionExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            action: &WorkflowAction,
            _scope: &ActionScope<'_>,
        ) -> Result<Value, ActionError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(action.id.clone());
            }
            if action.action_type == ActionType::Delay {
                let seconds = action.parameters.get("seconds").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            if self.fail.contains(&action.id) {
                return Err(ActionError::Failed(format!("{} exploded", action.id)));
            }
            if self.flaky.contains(&action.id)
                && self.flaky_attempts.fetch_add(1, Ordering::SeqCst) < self.flaky_failures
            {
                return Err(ActionError::Failed("relay timeout".to_string()));
            }
            Ok(json!({ "ok": action.id }))
        }
    }

    fn business() -> BusinessId {
        BusinessId("biz-1".to_string())
    }

    fn log_action(id: &str) -> WorkflowAction {
        WorkflowAction {
            id: id.to_string(),
            action_type: ActionType::Log,
            parameters: json!({ "message": id }),
            retry_policy: None,
        }
    }

    fn definition(id: &str, actions: Vec<WorkflowAction>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: WorkflowId(id.to_string()),
            business_id: business(),
            name: format!("{id} workflow"),
            description: String::new(),
            trigger: WorkflowTrigger::Manual,
            actions,
            active: true,
            version: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn request(id: &str) -> ExecutionRequest {
        ExecutionRequest {
            workflow_id: WorkflowId(id.to_string()),
            business_id: business(),
            triggered_by: "test".to_string(),
            context: json!({ "customer_name": "Dana" }),
        }
    }

    fn engine(executor: Arc<ScriptedExecutor>, max_concurrent: usize) -> (Arc<WorkflowEngine>, InMemoryAuditSink) {
        let audit = InMemoryAuditSink::default();
        let contexts = Arc::new(ContextCache::new(Arc::new(StaticProvider), ContextCacheConfig::default()));
        let engine = WorkflowEngine::new(
            WorkflowConfig { max_concurrent_executions: max_concurrent, tick_interval_ms: 100, max_history: 50 },
            contexts,
            executor,
            Arc::new(audit.clone()),
        );
        (Arc::new(engine), audit)
    }

    #[tokio::test]
    async fn failing_middle_action_stops_the_run() {
        let executor = Arc::new(ScriptedExecutor { fail: vec!["two".to_string()], ..Default::default() });
        let (engine, audit) = engine(executor.clone(), 10);
        engine
            .register_workflow(definition("wf", vec![log_action("one"), log_action("two"), log_action("three")]))
            .await
            .expect("register");

        let id = engine.execute(request("wf")).await.expect("execute");
        engine.tick().await;
        engine.wait_for_idle().await;

        let execution = engine.get_execution_status(&id).await.expect("status");
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(executor.calls(), vec!["one".to_string(), "two".to_string()]);
        let statuses: Vec<_> = execution.action_results.iter().map(|result| result.status).collect();
        assert_eq!(statuses, vec![ActionStatus::Completed, ActionStatus::Failed, ActionStatus::Skipped]);
        assert!(execution.error.as_deref().is_some_and(|error| error.contains("two")));
        assert_eq!(audit.events_of_type("workflow.execution.failed").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_cap_keeps_second_run_pending() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (engine, _audit) = engine(executor, 1);
        let slow = WorkflowAction {
            id: "wait".to_string(),
            action_type: ActionType::Delay,
            parameters: json!({ "seconds": 30 }),
            retry_policy: None,
        };
        engine.register_workflow(definition("wf", vec![slow])).await.expect("register");

        let first = engine.execute(request("wf")).await.expect("first");
        let second = engine.execute(request("wf")).await.expect("second");

        let report = engine.tick().await;
        assert_eq!(report.started, vec![first.clone()]);
        tokio::task::yield_now().await;
        engine.tick().await;

        assert_eq!(engine.get_execution_status(&first).await.map(|e| e.status), Ok(ExecutionStatus::Running));
        assert_eq!(engine.get_execution_status(&second).await.map(|e| e.status), Ok(ExecutionStatus::Pending));

        engine.wait_for_idle().await;
        assert_eq!(engine.get_execution_status(&first).await.map(|e| e.status), Ok(ExecutionStatus::Completed));
        assert_eq!(engine.get_execution_status(&second).await.map(|e| e.status), Ok(ExecutionStatus::Pending));

        let report = engine.tick().await;
        assert_eq!(report.started, vec![second.clone()]);
        engine.wait_for_idle().await;
        assert_eq!(engine.get_execution_status(&second).await.map(|e| e.status), Ok(ExecutionStatus::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_backoff_before_resuming() {
        let executor = Arc::new(ScriptedExecutor {
            flaky: vec!["notify".to_string()],
            flaky_failures: 1,
            ..Default::default()
        });
        let (engine, audit) = engine(executor.clone(), 10);
        let mut notify = log_action("notify");
        notify.retry_policy = Some(RetryPolicy { max_retries: 2, retry_delay_ms: 5_000, backoff_multiplier: 2.0 });
        engine
            .register_workflow(definition("wf", vec![notify, log_action("after")]))
            .await
            .expect("register");

        let id = engine.execute(request("wf")).await.expect("execute");
        engine.tick().await;
        engine.wait_for_idle().await;

        let waiting = engine.get_execution_status(&id).await.expect("status");
        assert_eq!(waiting.status, ExecutionStatus::Running);
        assert_eq!(waiting.action_results[0].status, ActionStatus::Pending);
        assert_eq!(waiting.action_results[0].retry_count, 1);
        assert!(waiting.action_results[0].next_attempt_at.is_some());
        assert_eq!(executor.calls(), vec!["notify".to_string()]);

        tokio::time::advance(Duration::from_millis(4_000)).await;
        assert!(engine.tick().await.resumed.is_empty());

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(engine.tick().await.resumed, vec![id.clone()]);
        engine.wait_for_idle().await;

        let done = engine.get_execution_status(&id).await.expect("status");
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(executor.calls(), vec!["notify".to_string(), "notify".to_string(), "after".to_string()]);
        assert_eq!(audit.events_of_type("workflow.action.retry_scheduled").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_run() {
        let executor = Arc::new(ScriptedExecutor { fail: vec!["notify".to_string()], ..Default::default() });
        let (engine, audit) = engine(executor.clone(), 10);
        let mut notify = log_action("notify");
        notify.retry_policy = Some(RetryPolicy { max_retries: 2, retry_delay_ms: 5_000, backoff_multiplier: 2.0 });
        engine
            .register_workflow(definition("wf", vec![log_action("one"), notify, log_action("after")]))
            .await
            .expect("register");

        let id = engine.execute(request("wf")).await.expect("execute");
        engine.tick().await;
        engine.wait_for_idle().await;

        tokio::time::advance(Duration::from_millis(5_000)).await;
        assert_eq!(engine.tick().await.resumed, vec![id.clone()]);
        engine.wait_for_idle().await;
        assert_eq!(engine.get_execution_status(&id).await.map(|e| e.status), Ok(ExecutionStatus::Running));

        tokio::time::advance(Duration::from_millis(10_000)).await;
        assert_eq!(engine.tick().await.resumed, vec![id.clone()]);
        engine.wait_for_idle().await;

        let failed = engine.get_execution_status(&id).await.expect("status");
        assert_eq!(failed.status, ExecutionStatus::Failed);
        assert_eq!(executor.calls(), vec!["one", "notify", "notify", "notify"]);
        assert_eq!(failed.action_results[1].retry_count, 2);
        assert!(failed.action_results[1].next_attempt_at.is_none());
        let statuses: Vec<_> = failed.action_results.iter().map(|result| result.status).collect();
        assert_eq!(statuses, vec![ActionStatus::Completed, ActionStatus::Failed, ActionStatus::Skipped]);
        assert!(failed.error.as_deref().is_some_and(|error| error.contains("notify")));
        assert_eq!(audit.events_of_type("workflow.action.retry_scheduled").len(), 2);
        assert_eq!(audit.events_of_type("workflow.execution.failed").len(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(engine.tick().await.resumed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_only_applies_to_running_executions() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (engine, _audit) = engine(executor.clone(), 1);
        let slow = WorkflowAction {
            id: "wait".to_string(),
            action_type: ActionType::Delay,
            parameters: json!({ "seconds": 10 }),
            retry_policy: None,
        };
        engine
            .register_workflow(definition("wf", vec![slow, log_action("after")]))
            .await
            .expect("register");

        let running = engine.execute(request("wf")).await.expect("running");
        let pending = engine.execute(request("wf")).await.expect("pending");
        engine.tick().await;

        assert_eq!(engine.cancel_execution(&pending).await, Ok(false));
        assert_eq!(engine.get_execution_status(&pending).await.map(|e| e.status), Ok(ExecutionStatus::Pending));

        assert_eq!(engine.cancel_execution(&running).await, Ok(true));
        assert_eq!(engine.cancel_execution(&running).await, Ok(false));
        engine.wait_for_idle().await;

        let cancelled = engine.get_execution_status(&running).await.expect("status");
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.action_results[1].status, ActionStatus::Skipped);
        assert!(!executor.calls().contains(&"after".to_string()));

        let unknown = engine.cancel_execution(&crate::domain::workflow::ExecutionId("exec-missing".to_string())).await;
        assert!(matches!(unknown, Err(ApplicationError::NotFound { kind: "execution", .. })));
    }

    #[tokio::test]
    async fn update_bumps_version_and_emit_event_matches_conditions() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (engine, _audit) = engine(executor, 10);

        let mut escalation = definition("escalation", vec![log_action("page")]);
        escalation.trigger = WorkflowTrigger::EventBased {
            event_type: "conversation.escalated".to_string(),
            conditions: vec![TriggerCondition {
                field: "business.financials.overdue_invoice_count".to_string(),
                operator: ConditionOperator::GreaterThan,
                value: json!(1),
            }],
        };
        let registered = engine.register_workflow(escalation.clone()).await.expect("register");
        assert_eq!(registered.version, 1);

        let updated = engine.update_workflow(escalation).await.expect("update");
        assert_eq!(updated.version, 2);

        let started = engine
            .emit_event(&business(), "conversation.escalated", json!({ "reason": "human_request" }))
            .await
            .expect("emit");
        assert_eq!(started.len(), 1);
        let none = engine.emit_event(&business(), "lead.captured", json!({})).await.expect("emit");
        assert!(none.is_empty());

        let duplicate = engine.register_workflow(definition("escalation", vec![log_action("x")])).await;
        assert!(matches!(duplicate, Err(ApplicationError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn inactive_or_unknown_workflows_are_rejected() {
        let executor = Arc::new(ScriptedExecutor::default());
        let (engine, _audit) = engine(executor, 10);
        engine.register_workflow(definition("wf", vec![log_action("one")])).await.expect("register");
        engine.deactivate_workflow(&WorkflowId("wf".to_string())).await.expect("deactivate");

        assert!(matches!(engine.execute(request("wf")).await, Err(ApplicationError::InvalidInput(_))));
        assert!(matches!(
            engine.execute(request("missing")).await,
            Err(ApplicationError::NotFound { kind: "workflow", .. })
        ));
    }
}
