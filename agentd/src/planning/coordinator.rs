//! The planning coordinator.
//!
//! Drives one task from prompt to done: pre-planning, planning, the
//! execution/reflection loop and verification. Phases return structured
//! results the coordinator reacts to; replans are budgeted; the control
//! plane is polled between actions and the in-flight action always
//! completes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use eyre::{Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use ctxstore::{PlanningHistoryStore, ToolCallStatus, estimate_tokens};

use crate::config::Config;
use crate::context::{ContextCompressor, TaskContextManager};
use crate::control::{ControlAction, ControlPlane};
use crate::llm::{ChatMessage, LlmClient};
use crate::mcp::ToolCaller;
use crate::tracker::TrackedTask;

use super::decision::{ErrorClassification, ReplanDecision, RewindScope};
use super::parse::{extract_json, strip_think};
use super::preplan::PrePlanningManager;
use super::progress::ProgressCommentManager;
use super::prompts;
use super::replan::ReplanManager;

/// How one run ended, from the coordinator's point of view.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed { verification_passed: bool },
    Failed { error: String },
    Paused { planning_state: Value },
    Stopped { planning_state: Value },
}

/// Result of executing one action.
struct ActionResult {
    error: Option<String>,
    /// Same tool failed too many times in a row
    abort_to_reflection: bool,
    detail: Value,
}

/// Verification verdict after the action list is exhausted.
struct VerifyResult {
    passed: bool,
    comment: String,
    additional_actions: Vec<Value>,
}

/// Drives the phased loop for one task.
pub struct PlanningCoordinator {
    config: Config,
    llm: Arc<dyn LlmClient>,
    tools: HashMap<String, Arc<dyn ToolCaller>>,
    task: Arc<dyn TrackedTask>,
    control: Option<Arc<dyn ControlPlane>>,

    preplan: PrePlanningManager,
    replan: ReplanManager,
    compressor: ContextCompressor,
    progress: ProgressCommentManager,

    current_plan: Option<Value>,
    action_counter: usize,
    executed_actions: usize,
    revision_counter: u32,
    verification_rounds: u32,
    last_error_tool: Option<String>,
    consecutive_tool_errors: u32,
}

impl PlanningCoordinator {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        tools: HashMap<String, Arc<dyn ToolCaller>>,
        task: Arc<dyn TrackedTask>,
        control: Option<Arc<dyn ControlPlane>>,
    ) -> Self {
        let available_tools: Vec<String> = tools
            .values()
            .flat_map(|t| {
                t.schemas()
                    .into_iter()
                    .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
            })
            .collect();

        let context_length = config.active_provider().context_length;
        Self {
            preplan: PrePlanningManager::new(config.pre_planning.clone()),
            replan: ReplanManager::new(config.replanning.clone(), available_tools),
            compressor: ContextCompressor::new(llm.clone(), &config.context_storage, context_length),
            progress: ProgressCommentManager::new(),
            config,
            llm,
            tools,
            task,
            control,
            current_plan: None,
            action_counter: 0,
            executed_actions: 0,
            revision_counter: 0,
            verification_rounds: 0,
            last_error_tool: None,
            consecutive_tool_errors: 0,
        }
    }

    /// Run the task to an outcome. Errors escaping here are caught at the
    /// consumer boundary and turn into a failed task.
    pub async fn run(&mut self, ctx: &TaskContextManager) -> Result<TaskOutcome> {
        let mut history = ctx.planning_history()?;
        history.set_issue_id(self.task.key().number().to_string());

        self.restore_state(ctx);

        // Seed the conversation on a fresh attempt. Resumed runs already
        // carry their window.
        let user_request = self.task.prompt().await?;
        let messages = ctx.messages();
        if messages.count_messages()? == 0 {
            messages.add_message("user", &user_request, None)?;
        }

        // Pre-planning, skipped when disabled or a plan already exists
        // (resume).
        let preplan_context = if history.has_plan()? || !self.config.pre_planning.enabled {
            Value::Null
        } else {
            match self.control_check().await {
                ControlAction::Continue => {}
                action => return Ok(self.interrupted(action)),
            }
            let result = self.preplan.execute(&self.llm, &self.tools, &user_request).await?;
            let context = result.context_value();

            // Replan gate on the understanding.
            let prompt = self.replan.prompts().goal_understanding(&result.understanding, &user_request);
            let decision = self.replan.decide(&self.llm, prompt).await;
            let verdict = self.replan.evaluate_and_record(&history, "goal_understanding", &decision);
            if verdict.execute {
                info!("run: replanning goal understanding");
                let redone = self.preplan.execute(&self.llm, &self.tools, &user_request).await?;
                redone.context_value()
            } else {
                context
            }
        };

        // Planning.
        match self.control_check().await {
            ControlAction::Continue => {}
            action => return Ok(self.interrupted(action)),
        }
        if let Some(plan) = history.latest_plan()? {
            info!("run: found existing plan, resuming execution");
            self.current_plan = Some(plan);
        } else {
            let Some(plan) = self.plan(ctx, &history, &user_request, &preplan_context).await? else {
                return Ok(TaskOutcome::Failed {
                    error: "planning phase produced no usable plan".to_string(),
                });
            };
            history.save_plan(&plan)?;
            self.progress.post_plan(self.task.as_ref(), &plan_actions(&plan)).await;
            self.current_plan = Some(plan);
        }

        // Execution loop with reflection, then verification.
        loop {
            match self.control_check().await {
                ControlAction::Continue => {}
                action => return Ok(self.interrupted(action)),
            }

            if self.executed_actions >= self.config.planning.max_actions {
                warn!("run: action budget exhausted, moving to verification");
            }

            let actions = self.actions();
            if self.action_counter >= actions.len() || self.executed_actions >= self.config.planning.max_actions {
                let verdict = self.verify(ctx, &history).await?;
                if !verdict.additional_actions.is_empty()
                    && self.verification_rounds < self.config.planning.max_verification_rounds
                    && self.executed_actions < self.config.planning.max_actions
                {
                    self.verification_rounds += 1;
                    self.append_additional_actions(verdict.additional_actions);
                    continue;
                }

                self.progress.mark_complete(self.task.as_ref(), &self.actions()).await;
                let comment = if verdict.comment.is_empty() {
                    "Task completed.".to_string()
                } else {
                    verdict.comment.clone()
                };
                if let Err(e) = self.task.comment(&comment, true).await {
                    warn!(error = %e, "run: completion comment failed");
                }
                return Ok(TaskOutcome::Completed {
                    verification_passed: verdict.passed,
                });
            }

            let action = actions[self.action_counter].clone();
            let result = self.execute_action(ctx, &action).await?;
            self.executed_actions += 1;
            self.action_counter += 1;
            self.progress
                .update_progress(self.task.as_ref(), &self.actions(), self.action_counter)
                .await;

            // Replan gate on errors, before the cheaper reflection path.
            if let Some(error) = &result.error
                && !result.abort_to_reflection
            {
                let prompt = self
                    .replan
                    .prompts()
                    .execution(&action, &result.detail, self.consecutive_tool_errors);
                let decision = self.replan.decide(&self.llm, prompt).await;
                let verdict = self.replan.evaluate_and_record(&history, "execution", &decision);
                if verdict.execute {
                    self.apply_replan(ctx, &history, &decision, &user_request).await?;
                    continue;
                }
                if ErrorClassification::parse(&decision.error_classification) == Some(ErrorClassification::Fatal) {
                    warn!(error = %error, "run: error classified fatal, continuing under override policy");
                }
                debug!(error = %error, "run: proceeding past action error");
            }

            // Reflection on error or at the configured cadence.
            let interval = self.config.planning.reflection_interval;
            let should_reflect = result.error.is_some()
                || result.abort_to_reflection
                || (interval > 0 && self.action_counter > 0 && self.action_counter % interval == 0);
            if should_reflect {
                self.reflect(ctx, &history, &result.detail).await?;
            }
        }
    }

    fn actions(&self) -> Vec<Value> {
        self.current_plan.as_ref().map(|p| plan_actions(p)).unwrap_or_default()
    }

    /// Serialize resumable loop state.
    pub fn planning_state(&self) -> Value {
        let current_phase = if self.current_plan.is_some() { "execution" } else { "planning" };
        json!({
            "current_phase": current_phase,
            "action_counter": self.action_counter,
            "total_actions": self.actions().len(),
            "revision_counter": self.revision_counter,
            "verification_rounds": self.verification_rounds,
        })
    }

    fn restore_state(&mut self, ctx: &TaskContextManager) {
        let Some(state) = ctx.restored_planning_state() else {
            return;
        };
        self.action_counter = state.get("action_counter").and_then(Value::as_u64).unwrap_or(0) as usize;
        self.revision_counter = state.get("revision_counter").and_then(Value::as_u64).unwrap_or(0) as u32;
        self.verification_rounds = state.get("verification_rounds").and_then(Value::as_u64).unwrap_or(0) as u32;
        info!(action_counter = self.action_counter, "restore_state: loop state restored");
    }

    fn interrupted(&self, action: ControlAction) -> TaskOutcome {
        let planning_state = self.planning_state();
        match action {
            ControlAction::Pause => TaskOutcome::Paused { planning_state },
            ControlAction::Stop => TaskOutcome::Stopped { planning_state },
            ControlAction::Continue => unreachable!("interrupted with Continue"),
        }
    }

    async fn control_check(&self) -> ControlAction {
        match &self.control {
            Some(control) => control.poll().await,
            None => ControlAction::Continue,
        }
    }

    /// Planning phase: one window round producing the structured plan, with
    /// a replan gate on the generated action sequence.
    async fn plan(
        &mut self,
        ctx: &TaskContextManager,
        history: &PlanningHistoryStore,
        user_request: &str,
        preplan_context: &Value,
    ) -> Result<Option<Value>> {
        let mut prompt = prompts::PLANNING
            .replace("{task}", user_request)
            .replace("{context}", &preplan_context.to_string())
            .replace("{tools}", &self.tool_catalog_text());

        // Repository-carried agent rules go ahead of everything else.
        let rules_loader = super::rules::ProjectRulesLoader::new(self.config.project_rules.clone());
        if let Some(rules) = rules_loader.load(self.tools.get("executor")).await {
            prompt = format!("=== Project rules ===\n{rules}\n{prompt}");
        }

        let response = self.chat_through_window(ctx, &prompt).await?;
        let Some(mut plan) = extract_json(&response) else {
            warn!("plan: unparseable planning response");
            return Ok(None);
        };

        // Replan gate on the action sequence.
        let action_plan = plan.get("action_plan").cloned().unwrap_or(Value::Null);
        let subtasks = plan.pointer("/task_decomposition/subtasks").cloned().unwrap_or(Value::Null);
        let decision_prompt = self.replan.prompts().action_sequence(&action_plan, &subtasks);
        let decision = self.replan.decide(&self.llm, decision_prompt).await;
        let verdict = self.replan.evaluate_and_record(history, "action_sequence", &decision);
        if verdict.execute {
            info!("plan: regenerating action plan per replan decision");
            let retry_prompt = format!(
                "The previous plan was judged infeasible: {}\nIssues: {:?}\nProduce a corrected plan in the same JSON shape.",
                decision.reasoning, decision.issues_found
            );
            let response = self.chat_through_window(ctx, &retry_prompt).await?;
            if let Some(regenerated) = extract_json(&response) {
                plan = regenerated;
            }
        }

        Ok(Some(plan))
    }

    /// One action: prompt the model, dispatch any tool calls, decide done.
    async fn execute_action(&mut self, ctx: &TaskContextManager, action: &Value) -> Result<ActionResult> {
        debug!(action = %action, "execute_action: called");
        let prompt = prompts::ACTION.replace("{action}", &action.to_string());
        let response_text = match self.chat_through_window(ctx, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                return Ok(ActionResult {
                    error: Some(e.to_string()),
                    abort_to_reflection: false,
                    detail: json!({"status": "error", "error": e.to_string()}),
                });
            }
        };

        let data = extract_json(&response_text).unwrap_or(Value::Null);

        // Tool calls may come through the function-calling channel or as a
        // JSON command in the reply body.
        let mut calls: Vec<(String, Value)> = Vec::new();
        if let Some(call) = data.get("function_call") {
            match call {
                Value::Array(items) => {
                    for item in items {
                        if let Some(name) = item.get("name").and_then(Value::as_str) {
                            calls.push((name.to_string(), item.get("arguments").cloned().unwrap_or(json!({}))));
                        }
                    }
                }
                Value::Object(_) => {
                    if let Some(name) = call.get("name").and_then(Value::as_str) {
                        calls.push((name.to_string(), call.get("arguments").cloned().unwrap_or(json!({}))));
                    }
                }
                _ => {}
            }
        }
        if let Some(command) = data.get("command")
            && let Some(tool) = command.get("tool").and_then(Value::as_str)
        {
            calls.push((tool.to_string(), command.get("args").cloned().unwrap_or(json!({}))));
        }

        let mut last_error = None;
        let mut abort = false;
        for (name, args) in calls {
            let outcome_error = self.dispatch_tool_call(ctx, &name, args).await?;
            match outcome_error {
                None => {
                    self.last_error_tool = None;
                    self.consecutive_tool_errors = 0;
                }
                Some(error) => {
                    if self.last_error_tool.as_deref() == Some(name.as_str()) {
                        self.consecutive_tool_errors += 1;
                    } else {
                        self.last_error_tool = Some(name.clone());
                        self.consecutive_tool_errors = 1;
                    }
                    last_error = Some(error);

                    if self.consecutive_tool_errors >= self.config.planning.max_consecutive_tool_errors {
                        warn!(tool = %name, "execute_action: consecutive error cap hit, aborting to reflection");
                        if let Err(e) = self
                            .task
                            .comment(&format!("⚠️ Tool `{name}` failed repeatedly; re-evaluating the plan."), false)
                            .await
                        {
                            debug!(error = %e, "execute_action: abort comment failed");
                        }
                        abort = true;
                        break;
                    }
                }
            }
        }

        let done = data.get("done").and_then(Value::as_bool).unwrap_or(false);
        let status = if last_error.is_some() { "error" } else { "success" };
        let failed_tool = if abort { self.last_error_tool.clone() } else { None };
        Ok(ActionResult {
            error: last_error.clone(),
            abort_to_reflection: abort,
            detail: json!({
                "status": status,
                "done": done,
                "action": action,
                "error": last_error,
                "failed_tool": failed_tool,
            }),
        })
    }

    /// Route one call to its server, record it, and feed the output back
    /// into the window. Returns the error text for failed calls.
    async fn dispatch_tool_call(&self, ctx: &TaskContextManager, name: &str, args: Value) -> Result<Option<String>> {
        let Some((server, tool)) = self.split_tool(name) else {
            let error = format!("unknown tool: {name}");
            ctx.tool_log()
                .record(name, args, ToolCallStatus::Error, 0, None, Some(error.clone()))?;
            ctx.messages()
                .add_message("tool", &format!("error: {error}"), Some(name))?;
            return Ok(Some(error));
        };

        let client = self.tools[&server].clone();
        let start = Instant::now();
        let outcome = client.call(&tool, args.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (status, result, error) = if outcome.success {
            (ToolCallStatus::Success, Some(outcome.content.clone()), None)
        } else {
            let error = outcome.error.clone().unwrap_or_else(|| "tool call failed".to_string());
            (ToolCallStatus::Error, None, Some(error))
        };
        ctx.tool_log().record(name, args, status, duration_ms, result, error.clone())?;

        let feedback = match &error {
            None => format!("output: {}", outcome.content),
            Some(error) => format!("error: {error}"),
        };
        ctx.messages().add_message("tool", &feedback, Some(name))?;
        ctx.add_stats(0, 1, estimate_tokens(&feedback) as i64, 0).await?;

        Ok(error)
    }

    /// Reflection phase; may revise the plan within the revision budget.
    async fn reflect(&mut self, ctx: &TaskContextManager, history: &PlanningHistoryStore, results: &Value) -> Result<()> {
        let plan = self.current_plan.clone().unwrap_or(Value::Null);
        let prompt = prompts::REFLECTION
            .replace("{results}", &results.to_string())
            .replace("{plan}", &plan.to_string());

        let response = self.chat_through_window(ctx, &prompt).await?;
        let Some(reflection) = extract_json(&response) else {
            warn!("reflect: unparseable reflection");
            return Ok(());
        };
        history.save_reflection(&reflection)?;

        if reflection.get("plan_revision_needed").and_then(Value::as_bool) != Some(true) {
            return Ok(());
        }
        if self.revision_counter >= self.config.planning.max_revisions {
            warn!(max = self.config.planning.max_revisions, "reflect: revision budget exhausted");
            return Ok(());
        }
        self.revision_counter += 1;

        let revision_prompt = prompts::REVISION
            .replace("{reflection}", &reflection.to_string())
            .replace("{plan}", &plan.to_string());
        let response = self.chat_through_window(ctx, &revision_prompt).await?;
        if let Some(revised) = extract_json(&response) {
            history.save_revision(&revised, &reflection)?;
            info!(revision = self.revision_counter, "reflect: plan revised");
            self.current_plan = Some(revised);
            self.progress
                .update_progress(self.task.as_ref(), &self.actions(), self.action_counter)
                .await;
        } else {
            warn!("reflect: unparseable revision, keeping current plan");
        }
        Ok(())
    }

    /// Verification phase against the plan's success criteria.
    async fn verify(&mut self, ctx: &TaskContextManager, history: &PlanningHistoryStore) -> Result<VerifyResult> {
        let plan = self.current_plan.clone().unwrap_or(Value::Null);
        let criteria = plan
            .pointer("/goal_understanding/success_criteria")
            .cloned()
            .unwrap_or(json!([]));

        let executed: Vec<Value> = self
            .actions()
            .iter()
            .take(self.action_counter)
            .map(|a| {
                json!({
                    "task_id": a.get("task_id").cloned().unwrap_or(Value::Null),
                    "purpose": a.get("purpose").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();

        let workspace = self.workspace_state().await;

        let prompt = prompts::VERIFICATION
            .replace("{criteria}", &criteria.to_string())
            .replace("{actions}", &json!(executed).to_string())
            .replace("{workspace}", &workspace);

        let response = self.chat_through_window(ctx, &prompt).await?;
        let verification = extract_json(&response).unwrap_or_else(|| {
            warn!("verify: unparseable verification, treating as failed");
            json!({"verification_passed": false, "comment": "verification response was unparseable"})
        });
        history.save_verification(&verification)?;

        let additional = if verification.get("additional_work_needed").and_then(Value::as_bool) == Some(true) {
            verification
                .get("additional_actions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        Ok(VerifyResult {
            passed: verification
                .get("verification_passed")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            comment: verification
                .get("comment")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            additional_actions: additional,
        })
    }

    /// TODO/FIXME sweep through the executor, when one is wired.
    async fn workspace_state(&self) -> String {
        let Some(executor) = self.tools.get("executor") else {
            return "workspace state unavailable".to_string();
        };
        let outcome = executor
            .call(
                "execute_command",
                json!({"command": "grep -rn 'TODO\\|FIXME' . 2>/dev/null | head -50"}),
            )
            .await;
        if outcome.success && !outcome.content.is_empty() {
            format!("Placeholder scan:\n{}", outcome.content)
        } else {
            "Placeholder scan: none found".to_string()
        }
    }

    fn append_additional_actions(&mut self, additional: Vec<Value>) {
        info!(count = additional.len(), "append_additional_actions: verification added work");
        if let Some(plan) = self.current_plan.as_mut()
            && let Some(actions) = plan
                .pointer_mut("/action_plan/actions")
                .and_then(Value::as_array_mut)
        {
            for mut action in additional {
                if let Some(object) = action.as_object_mut() {
                    object.insert("source".into(), Value::String("Additional Work (From Verification)".into()));
                }
                actions.push(action);
            }
        }
    }

    /// Apply an executed replan decision by rewind level: 1 retries the
    /// action, 2 regenerates the remaining actions, 3 regenerates the whole
    /// action plan, 4 re-decomposes subtasks, 5 re-runs goal understanding.
    /// Downstream counters reset with the scope of the rewind.
    async fn apply_replan(
        &mut self,
        ctx: &TaskContextManager,
        history: &PlanningHistoryStore,
        decision: &ReplanDecision,
        user_request: &str,
    ) -> Result<()> {
        let scope = decision.rewind_scope();
        info!(?scope, level = decision.replan_level, replan_type = %decision.replan_type, "apply_replan: called");

        let plan = self.current_plan.clone().unwrap_or(Value::Null);
        match scope {
            RewindScope::RetryAction => {
                // Rewind the pointer so the same action runs again.
                self.action_counter = self.action_counter.saturating_sub(1);
                Ok(())
            }
            RewindScope::RegenerateRemaining => {
                // Completed work is held fixed; only the remainder is replanned.
                let completed: Vec<Value> = self.actions().iter().take(self.action_counter).cloned().collect();
                let prompt = format!(
                    "Replanning required ({}). Reason: {}\n\
                     Already completed actions (do not repeat them): {}\n\
                     Original request:\n{}\n\n\
                     Produce a new plan for the REMAINING work in the same JSON shape \
                     (goal_understanding, task_decomposition, action_plan).",
                    decision.replan_type,
                    decision.reasoning,
                    json!(completed),
                    user_request,
                );
                self.adopt_regenerated_plan(ctx, history, decision, &prompt).await
            }
            RewindScope::RegenerateActionPlan => {
                let prompt = format!(
                    "Replanning required ({}). Reason: {}\n\
                     Keep the goal understanding and task decomposition below, but \
                     regenerate the ENTIRE action plan for the whole task from the start:\n{}\n\
                     Original request:\n{}\n\n\
                     Produce the full plan in the same JSON shape \
                     (goal_understanding, task_decomposition, action_plan).",
                    decision.replan_type, decision.reasoning, plan, user_request,
                );
                self.revision_counter = 0;
                self.verification_rounds = 0;
                self.adopt_regenerated_plan(ctx, history, decision, &prompt).await
            }
            RewindScope::Redecompose => {
                let goal = plan.get("goal_understanding").cloned().unwrap_or(Value::Null);
                let prompt = format!(
                    "Replanning required ({}). Reason: {}\n\
                     Keep this goal understanding:\n{}\n\
                     Re-decompose the task into subtasks from scratch and build a new \
                     action plan for them.\n\
                     Original request:\n{}\n\n\
                     Produce the full plan in the same JSON shape \
                     (goal_understanding, task_decomposition, action_plan).",
                    decision.replan_type, decision.reasoning, goal, user_request,
                );
                self.revision_counter = 0;
                self.verification_rounds = 0;
                self.adopt_regenerated_plan(ctx, history, decision, &prompt).await
            }
            RewindScope::RerunGoalUnderstanding => {
                // Everything downstream of understanding is discarded:
                // pre-planning runs again, then a fresh planning phase.
                self.revision_counter = 0;
                self.verification_rounds = 0;

                let preplan_context = if self.config.pre_planning.enabled {
                    self.preplan
                        .execute(&self.llm, &self.tools, user_request)
                        .await?
                        .context_value()
                } else {
                    Value::Null
                };

                match self.plan(ctx, history, user_request, &preplan_context).await? {
                    Some(new_plan) => {
                        history.save_revision(&new_plan, &decision.to_value())?;
                        self.current_plan = Some(new_plan);
                        self.action_counter = 0;
                        self.progress.post_plan(self.task.as_ref(), &self.actions()).await;
                    }
                    None => warn!("apply_replan: re-planning after goal rewind failed, keeping current plan"),
                }
                Ok(())
            }
        }
    }

    /// Ask the model for a replacement plan and adopt it: record the
    /// revision, reset the action pointer, repost the checklist.
    async fn adopt_regenerated_plan(
        &mut self,
        ctx: &TaskContextManager,
        history: &PlanningHistoryStore,
        decision: &ReplanDecision,
        prompt: &str,
    ) -> Result<()> {
        let response = self.chat_through_window(ctx, prompt).await?;
        if let Some(plan) = extract_json(&response) {
            history.save_revision(&plan, &decision.to_value())?;
            self.current_plan = Some(plan);
            self.action_counter = 0;
            self.progress.post_plan(self.task.as_ref(), &self.actions()).await;
        } else {
            warn!("adopt_regenerated_plan: regenerated plan unparseable, keeping current plan");
        }
        Ok(())
    }

    /// One window round: append the user prompt, compress when over
    /// threshold, call the model, post thoughts, append the reply.
    /// Returns the think-stripped reply text.
    async fn chat_through_window(&self, ctx: &TaskContextManager, user_text: &str) -> Result<String> {
        let messages = ctx.messages();
        messages.add_message("user", user_text, None)?;

        if self.compressor.should_compress(&messages)? {
            if self.compressor.compress(&messages, &ctx.summaries()).await?.is_some() {
                ctx.add_stats(1, 0, 0, 1).await?;
            }
        }

        let window: Vec<ChatMessage> = messages.read_current()?.into_iter().map(ChatMessage::from).collect();
        let response = self.llm.chat(&window).await.map_err(|e| eyre!("LLM request failed: {e}"))?;

        let (cleaned, thoughts) = strip_think(&response.content);
        for thought in thoughts {
            if let Err(e) = self.task.comment(&thought, false).await {
                debug!(error = %e, "chat_through_window: thought comment failed");
            }
        }

        messages.add_message("assistant", &cleaned, None)?;
        let tokens = estimate_tokens(user_text) + response.tokens_estimated;
        ctx.add_stats(1, 0, tokens as i64, 0).await?;

        // Function calls arriving through the structured channel are folded
        // into the parseable body shape.
        if !response.function_calls.is_empty() && extract_json(&cleaned).is_none() {
            let calls: Vec<Value> = response
                .function_calls
                .iter()
                .map(|c| json!({"name": c.name, "arguments": c.arguments}))
                .collect();
            return Ok(json!({"function_call": calls}).to_string());
        }

        Ok(cleaned)
    }

    fn split_tool(&self, name: &str) -> Option<(String, String)> {
        let mut best: Option<(String, String)> = None;
        for server in self.tools.keys() {
            if let Some(rest) = name.strip_prefix(&format!("{server}_"))
                && best.as_ref().is_none_or(|(s, _)| server.len() > s.len())
            {
                best = Some((server.clone(), rest.to_string()));
            }
        }
        best
    }

    fn tool_catalog_text(&self) -> String {
        let mut names: Vec<String> = self
            .tools
            .values()
            .flat_map(|t| {
                t.schemas()
                    .into_iter()
                    .filter_map(|s| s.get("name").and_then(Value::as_str).map(str::to_string))
            })
            .collect();
        names.sort();
        names.join(", ")
    }
}

fn plan_actions(plan: &Value) -> Vec<Value> {
    plan.pointer("/action_plan/actions")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TaskContextManager;
    use crate::db::DbHandle;
    use crate::domain::{TaskKey, TaskRun};
    use crate::llm::mock::MockLlmClient;
    use crate::tracker::testing::MockToolServer;
    use async_trait::async_trait;
    use ctxstore::ContextLayout;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const PLAN_TWO_ACTIONS: &str = r#"{
        "goal_understanding": {"goal": "fix the bug", "success_criteria": ["tests pass"]},
        "task_decomposition": {"subtasks": [{"task_id": "task_1", "description": "d", "dependencies": [], "estimated_complexity": "low"}], "reasoning": "simple"},
        "action_plan": {
            "execution_order": ["task_1", "task_2"],
            "actions": [
                {"task_id": "task_1", "purpose": "read the code", "tool": "github_get_file_contents", "parameters": {}, "expected_outcome": "code read", "fallback": "skip"},
                {"task_id": "task_2", "purpose": "apply the fix", "tool": "executor_execute_command", "parameters": {}, "expected_outcome": "fix applied", "fallback": "skip"}
            ]
        }
    }"#;

    const VERIFICATION_PASSED: &str =
        r#"{"verification_passed": true, "completion_confidence": 0.9, "comment": "all good", "issues_found": [], "placeholder_detected": {"count": 0, "locations": []}, "additional_work_needed": false, "additional_actions": []}"#;

    /// PLAN_TWO_ACTIONS trimmed to its first action.
    fn plan_one_action() -> String {
        let mut plan: Value = serde_json::from_str(PLAN_TWO_ACTIONS).unwrap();
        plan.pointer_mut("/action_plan/actions").and_then(Value::as_array_mut).unwrap().truncate(1);
        plan.pointer_mut("/action_plan/execution_order")
            .and_then(Value::as_array_mut)
            .unwrap()
            .truncate(1);
        plan.to_string()
    }

    struct Fixture {
        _temp: TempDir,
        db: DbHandle,
        ctx: TaskContextManager,
        task: Arc<dyn TrackedTask>,
        server: Arc<MockToolServer>,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let layout = ContextLayout::new(temp.path());
        let db = DbHandle::spawn_in_memory().unwrap();
        let run = TaskRun::new(
            TaskKey::GithubIssue {
                owner: "acme".to_string(),
                repo: "svc".to_string(),
                number: 42,
            },
            None,
        );
        let ctx = TaskContextManager::create(layout.clone(), db.clone(), run, "mock", "mock-model", 100_000)
            .await
            .unwrap();

        let server = MockToolServer::new("github");
        server.respond_with("get_issue_comments", serde_json::json!([])).await;
        server.respond_with("create_issue_comment", serde_json::json!({"id": 1})).await;
        server.respond_with("update_issue_comment", serde_json::json!({})).await;
        let payload = serde_json::json!({
            "number": 42, "title": "Fix bug", "body": "The bug.",
            "repository_url": "https://api.github.com/repos/acme/svc", "labels": [],
        });
        let task: Arc<dyn TrackedTask> = Arc::new(
            crate::tracker::GithubTask::from_payload(&payload, server.clone(), crate::config::TrackerConfig::default())
                .unwrap(),
        );

        Fixture {
            _temp: temp,
            db,
            ctx,
            task,
            server,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        // Keep the mock scripts deterministic: no replan LLM round-trips.
        config.replanning.enabled = false;
        config.pre_planning.enabled = false;
        config
    }

    fn coordinator(fixture: &Fixture, llm: MockLlmClient) -> PlanningCoordinator {
        let mut tools: HashMap<String, Arc<dyn ToolCaller>> = HashMap::new();
        tools.insert("github".to_string(), fixture.server.clone());
        PlanningCoordinator::new(test_config(), Arc::new(llm), tools, fixture.task.clone(), None)
    }

    #[tokio::test]
    async fn test_happy_path_two_actions() {
        let fixture = fixture().await;
        let llm = MockLlmClient::from_texts(&[
            PLAN_TWO_ACTIONS,
            r#"{"done": true, "comment": "read"}"#,
            r#"{"done": true, "comment": "fixed"}"#,
            VERIFICATION_PASSED,
        ]);
        let mut coordinator = coordinator(&fixture, llm);

        let outcome = coordinator.run(&fixture.ctx).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { verification_passed: true }));

        // Plan and verification recorded
        let history = fixture.ctx.planning_history().unwrap();
        assert!(history.has_plan().unwrap());
        assert_eq!(history.read_all().unwrap().iter().filter(|e| e["type"] == "verification").count(), 1);

        // Stats mirrored: 4 LLM calls
        let record = fixture.db.get_required(&fixture.ctx.run().uuid).await.unwrap();
        assert_eq!(record.llm_call_count, 4);
        assert!(record.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_unparseable_plan_fails_task() {
        let fixture = fixture().await;
        let llm = MockLlmClient::from_texts(&["I have no plan, only vibes"]);
        let mut coordinator = coordinator(&fixture, llm);

        let outcome = coordinator.run(&fixture.ctx).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_tool_error_cap_aborts_to_reflection() {
        let fixture = fixture().await;
        fixture.server.fail_with("get_file_contents", "not found").await;

        // One action that calls the same failing tool three times.
        let action_reply = r#"{"function_call": [
            {"name": "github_get_file_contents", "arguments": {}},
            {"name": "github_get_file_contents", "arguments": {}},
            {"name": "github_get_file_contents", "arguments": {}}
        ]}"#;

        let llm = MockLlmClient::from_texts(&[
            &plan_one_action(),
            action_reply,
            // Reflection after the abort
            r#"{"evaluation": "tool keeps failing", "success": false, "failure_reason": "github_get_file_contents unavailable", "key_failures": ["github_get_file_contents"], "plan_revision_needed": false}"#,
            VERIFICATION_PASSED,
        ]);
        let mut coordinator = coordinator(&fixture, llm);

        let outcome = coordinator.run(&fixture.ctx).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { .. }));

        // Three error records against the same tool
        let tool_log = fixture.ctx.tool_log().read_all().unwrap();
        let errors: Vec<_> = tool_log
            .iter()
            .filter(|r| r.status == ToolCallStatus::Error && r.tool == "github_get_file_contents")
            .collect();
        assert_eq!(errors.len(), 3);

        // The reflection was recorded and lists the failing tool
        let history = fixture.ctx.planning_history().unwrap();
        let reflections = history.reflections().unwrap();
        assert_eq!(reflections.len(), 1);
        assert!(
            reflections[0]["evaluation"]["key_failures"]
                .as_array()
                .unwrap()
                .iter()
                .any(|f| f == "github_get_file_contents")
        );
    }

    #[tokio::test]
    async fn test_verification_appends_additional_actions() {
        let fixture = fixture().await;

        let verification_more_work = r#"{
            "verification_passed": false, "completion_confidence": 0.5, "comment": "missing tests",
            "issues_found": ["no tests"], "placeholder_detected": {"count": 0, "locations": []},
            "additional_work_needed": true,
            "additional_actions": [{"task_id": "extra_1", "purpose": "add tests", "tool": "executor_execute_command", "parameters": {}, "expected_outcome": "tests added", "fallback": "skip"}]
        }"#;

        let llm = MockLlmClient::from_texts(&[
            &plan_one_action(),
            r#"{"done": true, "comment": "did it"}"#,
            verification_more_work,
            r#"{"done": true, "comment": "tests added"}"#,
            VERIFICATION_PASSED,
        ]);
        let mut coordinator = coordinator(&fixture, llm);

        let outcome = coordinator.run(&fixture.ctx).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Completed { verification_passed: true }));

        // The appended action is marked as verification work
        let actions = coordinator.actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1]["source"], "Additional Work (From Verification)");
        assert_eq!(coordinator.verification_rounds, 1);
    }

    struct PauseAfter {
        polls: AtomicUsize,
        pause_at: usize,
    }

    #[async_trait]
    impl ControlPlane for PauseAfter {
        async fn poll(&self) -> ControlAction {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n >= self.pause_at { ControlAction::Pause } else { ControlAction::Continue }
        }
    }

    #[tokio::test]
    async fn test_pause_signal_interrupts_between_actions() {
        let fixture = fixture().await;
        let llm = MockLlmClient::from_texts(&[PLAN_TWO_ACTIONS, r#"{"done": true, "comment": "read"}"#]);

        let mut tools: HashMap<String, Arc<dyn ToolCaller>> = HashMap::new();
        tools.insert("github".to_string(), fixture.server.clone());
        let control: Arc<dyn ControlPlane> = Arc::new(PauseAfter {
            polls: AtomicUsize::new(0),
            pause_at: 2,
        });
        let mut coordinator = PlanningCoordinator::new(
            test_config(),
            Arc::new(llm),
            tools,
            fixture.task.clone(),
            Some(control),
        );

        let outcome = coordinator.run(&fixture.ctx).await.unwrap();
        match outcome {
            TaskOutcome::Paused { planning_state } => {
                assert_eq!(planning_state["action_counter"], 1);
                assert_eq!(planning_state["total_actions"], 2);
            }
            other => panic!("expected pause, got {other:?}"),
        }
    }
}
