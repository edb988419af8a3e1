//! Consumer: run one dequeued task to completion.
//!
//! Pops key dicts, reconstructs tasks, owns the run's context directory and
//! container, and drives the planning coordinator. Exceptions escaping a
//! phase are caught here: the task fails with a posted comment rather than
//! crashing the process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, eyre};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use ctxstore::ContextLayout;

use crate::config::Config;
use crate::context::{ContextCompressor, ContextInheritanceManager, TaskContextManager};
use crate::control::{ControlAction, ControlPlane, PauseResumeManager, TaskStopManager};
use crate::db::DbHandle;
use crate::domain::{TaskKey, TaskRun};
use crate::exec::{EnvironmentSetupManager, ExecEnvManager, ExecutorToolCaller, SetupStatus};
use crate::llm::LlmClient;
use crate::mcp::{McpServerConfig, ToolCaller, ToolClient};
use crate::planning::{PlanningCoordinator, TaskOutcome};
use crate::queueing::TaskQueue;
use crate::tracker::{TaskGetter, TrackedTask};

/// Queue poll timeout; an empty poll ends the consumer pass.
const QUEUE_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// One consumer process: a single task runs at a time.
pub struct Consumer {
    config: Config,
    db: DbHandle,
    layout: ContextLayout,
    llm: Arc<dyn LlmClient>,
    tracker_client: Arc<dyn ToolCaller>,
    exec: Option<Arc<ExecEnvManager>>,
}

impl Consumer {
    pub fn new(
        config: Config,
        db: DbHandle,
        layout: ContextLayout,
        llm: Arc<dyn LlmClient>,
        tracker_client: Arc<dyn ToolCaller>,
        exec: Option<Arc<ExecEnvManager>>,
    ) -> Self {
        Self {
            config,
            db,
            layout,
            llm,
            tracker_client,
            exec,
        }
    }

    /// Startup pass: reconcile orphaned running rows against the
    /// filesystem, and re-enqueue paused runs for pickup.
    pub async fn startup_recovery(&self, queue: &dyn TaskQueue) -> Result<(usize, usize)> {
        let live = self.layout.list_running()?;
        let reconciled = self.db.mark_orphaned_running_failed(live).await.map_err(|e| eyre!(e))?;
        if reconciled > 0 {
            warn!(reconciled, "startup_recovery: orphaned running rows failed");
        }

        let pause_manager = PauseResumeManager::new(&self.config.pause_resume);
        let mut requeued = 0;
        if !pause_manager.check_pause_signal() {
            for state in self.layout.list_paused()? {
                let mut dict = state.task_key.clone();
                if let Some(object) = dict.as_object_mut() {
                    object.insert("uuid".into(), Value::String(state.uuid.clone()));
                    object.insert("is_resumed".into(), Value::Bool(true));
                    if let Some(user) = &state.user {
                        object.insert("user".into(), Value::String(user.clone()));
                    }
                }
                queue.put(dict).await;
                requeued += 1;
            }
        }
        info!(requeued, reconciled, "startup_recovery: done");
        Ok((requeued, reconciled))
    }

    /// Consume until a poll comes back empty.
    pub async fn run_until_empty(&self, queue: &dyn TaskQueue) -> Result<usize> {
        let mut processed = 0;
        while let Some(dict) = queue.get(QUEUE_POLL_TIMEOUT).await {
            if let Err(e) = self.process_dict(&dict).await {
                error!(%dict, error = %e, "run_until_empty: task processing failed");
            }
            processed += 1;
        }
        info!(processed, "run_until_empty: queue drained");
        Ok(processed)
    }

    /// Process one dequeued key dict end to end.
    pub async fn process_dict(&self, dict: &Value) -> Result<()> {
        let key = TaskKey::from_dict(dict)?;
        let uuid = dict.get("uuid").and_then(Value::as_str).map(str::to_string);
        let user = dict.get("user").and_then(Value::as_str).map(str::to_string);
        let is_resumed = dict.get("is_resumed").and_then(Value::as_bool).unwrap_or(false);

        let tracker_config = self.config.tracker(key.source()).clone();
        let getter = TaskGetter::new(key.source(), self.tracker_client.clone(), tracker_config.clone());
        let task = getter.from_key(&key).await?;

        // The processing label may have been withdrawn between enqueue and
        // pickup; fresh attempts are skipped then.
        if !is_resumed && !task.check().await.unwrap_or(false) {
            info!(%key, "process_dict: processing label absent, skipping");
            return Ok(());
        }

        let run = match (is_resumed, uuid) {
            (true, Some(uuid)) => TaskRun::resumed(key.clone(), uuid, user),
            (_, Some(uuid)) => {
                let mut run = TaskRun::new(key.clone(), user);
                run.uuid = uuid;
                run
            }
            (_, None) => TaskRun::new(key.clone(), user),
        };
        let run_uuid = run.uuid.clone();

        let pause_manager = PauseResumeManager::new(&self.config.pause_resume);
        let provider = self.config.llm.provider.clone();
        let section = self.config.active_provider().clone();

        let ctx = if run.is_resumed {
            let ctx = TaskContextManager::resume(self.layout.clone(), self.db.clone(), run).await?;
            pause_manager.announce_resume(task.as_ref(), &tracker_config).await;
            ctx
        } else {
            let ctx = TaskContextManager::create(
                self.layout.clone(),
                self.db.clone(),
                run,
                &provider,
                &section.model,
                section.context_length,
            )
            .await?;
            self.seed_inherited_context(&ctx, task.as_ref(), &key).await;
            ctx
        };

        // Container and tool catalog.
        let mut tools: HashMap<String, Arc<dyn ToolCaller>> = HashMap::new();
        tools.insert(self.tracker_client.name().to_string(), self.tracker_client.clone());
        let mut text_editor: Option<Arc<ToolClient>> = None;
        let container = match &self.exec {
            Some(exec) if exec.is_enabled() => {
                match exec.prepare(&run_uuid, task.clone_spec().as_ref(), None).await {
                    Ok(info) => {
                        let container_name = ExecEnvManager::container_name(&run_uuid);

                        // Setup verification; fixable failures are repaired
                        // through the model, fatal ones proceed with warning.
                        // Nothing to verify when no repository was checked out.
                        if task.clone_spec().is_some() {
                            let setup = EnvironmentSetupManager::new(exec.clone(), self.llm.clone());
                            if let SetupStatus::ProceededWithWarning(reason) =
                                setup.verify_and_repair(&container_name).await
                                && let Err(e) = task
                                    .comment(&format!("⚠️ Environment setup is degraded: {reason}"), false)
                                    .await
                            {
                                warn!(error = %e, "process_dict: setup warning comment failed");
                            }
                        }

                        let wrapper = ExecutorToolCaller::new(exec.clone(), container_name.clone());
                        tools.insert("executor".to_string(), Arc::new(wrapper));

                        // Optional in-container text editor server.
                        if self.config.executor.text_editor_mcp_enabled {
                            let mut command =
                                vec!["docker".to_string(), "exec".to_string(), "-i".to_string(), container_name];
                            command.extend(self.config.executor.text_editor_command.clone());
                            match ToolClient::start(McpServerConfig::new("text_editor", command)).await {
                                Ok(client) => {
                                    let client = Arc::new(client);
                                    tools.insert("text_editor".to_string(), client.clone());
                                    text_editor = Some(client);
                                }
                                Err(e) => warn!(error = %e, "process_dict: text editor server failed to start"),
                            }
                        }
                        Some(info)
                    }
                    Err(e) => {
                        // Proceed without a sandbox rather than losing the run.
                        warn!(error = %e, "process_dict: environment preparation failed");
                        None
                    }
                }
            }
            _ => None,
        };

        let control: Arc<dyn ControlPlane> = Arc::new(ConsumerControl {
            pause: PauseResumeManager::new(&self.config.pause_resume),
            stop: Mutex::new(TaskStopManager::new(&self.config.task_stop)),
            task: task.clone(),
            bot_name: tracker_config.bot_name.clone(),
        });

        let mut coordinator = PlanningCoordinator::new(
            self.config.clone(),
            self.llm.clone(),
            tools,
            task.clone(),
            Some(control),
        );

        let outcome = coordinator.run(&ctx).await;
        self.finalize(ctx, task, &tracker_config, outcome).await?;

        // Owned subprocesses first, then the container itself.
        if let Some(editor) = &text_editor {
            editor.stop().await;
        }
        if let (Some(exec), Some(_)) = (&self.exec, container)
            && let Err(e) = exec.cleanup(&run_uuid).await
        {
            warn!(error = %e, "process_dict: container cleanup failed");
        }
        Ok(())
    }

    async fn seed_inherited_context(&self, ctx: &TaskContextManager, task: &dyn TrackedTask, key: &TaskKey) {
        let inheritance =
            ContextInheritanceManager::new(self.layout.clone(), self.db.clone(), &self.config.context_inheritance);
        let user_request = match task.prompt().await {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "seed_inherited_context: prompt unavailable");
                return;
            }
        };

        match inheritance.inherit(key, &user_request).await {
            Ok(Some(inherited)) => {
                let messages = ctx.messages();
                for message in &inherited.seed_messages {
                    if let Err(e) = messages.add_message(&message.role, &message.content, None) {
                        warn!(error = %e, "seed_inherited_context: seed write failed");
                        return;
                    }
                }
                let comment = inheritance.notification_comment(&inherited);
                if let Err(e) = task.comment(&comment, false).await {
                    warn!(error = %e, "seed_inherited_context: notification comment failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "seed_inherited_context: inheritance lookup failed"),
        }
    }

    /// Route the coordinator outcome into the terminal or suspended state.
    async fn finalize(
        &self,
        ctx: TaskContextManager,
        task: Arc<dyn TrackedTask>,
        tracker_config: &crate::config::TrackerConfig,
        outcome: Result<TaskOutcome>,
    ) -> Result<()> {
        match outcome {
            Ok(TaskOutcome::Completed { verification_passed }) => {
                info!(verification_passed, "finalize: task completed");
                // Final summary feeds the next run on this key.
                let compressor = ContextCompressor::new(
                    self.llm.clone(),
                    &self.config.context_storage,
                    self.config.active_provider().context_length,
                );
                if let Err(e) = compressor.final_summary(&ctx.messages(), &ctx.summaries()).await {
                    warn!(error = %e, "finalize: final summary failed");
                }
                ctx.complete().await?;
                if let Err(e) = task.finish().await {
                    warn!(error = %e, "finalize: done-label swap failed");
                }
            }
            Ok(TaskOutcome::Failed { error }) => {
                warn!(%error, "finalize: task failed");
                if let Err(e) = task
                    .comment(&format!("❌ Task failed: {error}"), true)
                    .await
                {
                    warn!(error = %e, "finalize: failure comment failed");
                }
                ctx.fail(&error).await?;
            }
            Ok(TaskOutcome::Paused { planning_state }) => {
                let pause_manager = PauseResumeManager::new(&self.config.pause_resume);
                pause_manager
                    .pause_task(ctx, task.as_ref(), tracker_config, Some(planning_state))
                    .await?;
            }
            Ok(TaskOutcome::Stopped { planning_state }) => {
                let stop_manager = TaskStopManager::new(&self.config.task_stop);
                stop_manager
                    .stop_task(ctx, task.as_ref(), tracker_config, Some(&planning_state))
                    .await?;
            }
            Err(e) => {
                error!(error = %e, "finalize: coordinator error");
                if let Err(comment_err) = task
                    .comment(&format!("❌ An error occurred while processing this task: {e}"), true)
                    .await
                {
                    warn!(error = %comment_err, "finalize: failure comment failed");
                }
                ctx.fail(&e.to_string()).await?;
            }
        }
        Ok(())
    }
}

/// Control plane polled by the coordinator: pause file first, then the
/// rate-limited assignee check.
struct ConsumerControl {
    pause: PauseResumeManager,
    stop: Mutex<TaskStopManager>,
    task: Arc<dyn TrackedTask>,
    bot_name: Option<String>,
}

#[async_trait]
impl ControlPlane for ConsumerControl {
    async fn poll(&self) -> ControlAction {
        if self.pause.check_pause_signal() {
            return ControlAction::Pause;
        }

        let should_check = self.stop.lock().await.should_check_now();
        if should_check {
            let stop = self.stop.lock().await;
            if !stop.is_bot_assigned(self.task.as_ref(), self.bot_name.as_deref()).await {
                return ControlAction::Stop;
            }
        }
        ControlAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockLlmClient;
    use crate::queueing::InMemoryQueue;
    use crate::tracker::testing::MockToolServer;
    use chrono::Utc;
    use ctxstore::{RunState, TaskState};
    use serde_json::json;
    use taskdb::{TaskRecord, TaskStatus};
    use tempfile::TempDir;

    fn consumer(temp: &TempDir, db: DbHandle, llm: MockLlmClient) -> Consumer {
        let mut config = Config::default();
        config.context_storage.base_dir = temp.path().to_path_buf();
        config.pause_resume.signal_file = temp.path().join("pause_signal");
        config.replanning.enabled = false;
        config.pre_planning.enabled = false;

        Consumer::new(
            config,
            db,
            ContextLayout::new(temp.path()),
            Arc::new(llm),
            MockToolServer::new("github"),
            None,
        )
    }

    #[tokio::test]
    async fn test_startup_requeues_paused_runs() {
        let temp = TempDir::new().unwrap();
        let layout = ContextLayout::new(temp.path());
        layout.ensure_dirs().unwrap();

        // Seed a paused run on disk
        let dir = layout.run_dir(RunState::Paused, "paused-uuid");
        std::fs::create_dir_all(&dir).unwrap();
        TaskState {
            task_key: json!({"type": "github_issue", "owner": "acme", "repo": "svc", "number": 42}),
            uuid: "paused-uuid".to_string(),
            user: Some("alice".to_string()),
            paused_at: Utc::now(),
            status: "paused".to_string(),
            resume_count: 0,
            resumed_at: None,
            last_error: None,
            context_path: "contexts/paused/paused-uuid".to_string(),
            planning_state: None,
        }
        .save(&dir)
        .unwrap();

        let db = DbHandle::spawn_in_memory().unwrap();
        let consumer = consumer(&temp, db, MockLlmClient::from_texts(&[]));
        let queue = InMemoryQueue::new();

        let (requeued, _) = consumer.startup_recovery(&queue).await.unwrap();
        assert_eq!(requeued, 1);

        let dict = queue.get(Duration::from_millis(10)).await.unwrap();
        assert_eq!(dict["is_resumed"], true);
        assert_eq!(dict["uuid"], "paused-uuid");
        assert_eq!(dict["user"], "alice");
        assert_eq!(dict["type"], "github_issue");
    }

    #[tokio::test]
    async fn test_startup_skips_requeue_while_signal_present() {
        let temp = TempDir::new().unwrap();
        let layout = ContextLayout::new(temp.path());
        layout.ensure_dirs().unwrap();

        let dir = layout.run_dir(RunState::Paused, "p-1");
        std::fs::create_dir_all(&dir).unwrap();
        TaskState {
            task_key: json!({"type": "gitlab_issue", "project_id": 7, "issue_iid": 3}),
            uuid: "p-1".to_string(),
            user: None,
            paused_at: Utc::now(),
            status: "paused".to_string(),
            resume_count: 0,
            resumed_at: None,
            last_error: None,
            context_path: String::new(),
            planning_state: None,
        }
        .save(&dir)
        .unwrap();

        std::fs::write(temp.path().join("pause_signal"), "").unwrap();

        let db = DbHandle::spawn_in_memory().unwrap();
        let consumer = consumer(&temp, db, MockLlmClient::from_texts(&[]));
        let queue = InMemoryQueue::new();

        let (requeued, _) = consumer.startup_recovery(&queue).await.unwrap();
        assert_eq!(requeued, 0);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_startup_reconciles_orphaned_rows() {
        let temp = TempDir::new().unwrap();
        let db = DbHandle::spawn_in_memory().unwrap();

        // Running row with no directory behind it
        let parts = taskdb::TaskKeyParts {
            task_source: "github".to_string(),
            task_type: "issue".to_string(),
            owner: Some("acme".to_string()),
            repo: Some("svc".to_string()),
            project_id: None,
            number: 1,
        };
        db.insert(TaskRecord::new_pending("orphan", &parts, None)).await.unwrap();
        db.set_status("orphan", TaskStatus::Running).await.unwrap();

        let consumer = consumer(&temp, db.clone(), MockLlmClient::from_texts(&[]));
        let queue = InMemoryQueue::new();

        let (_, reconciled) = consumer.startup_recovery(&queue).await.unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(db.get_required("orphan").await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_label_skips_task() {
        let temp = TempDir::new().unwrap();
        let db = DbHandle::spawn_in_memory().unwrap();

        let server = MockToolServer::new("github");
        // Label was withdrawn upstream: no processing label on the item
        server
            .respond_with(
                "get_issue",
                json!({"number": 5, "title": "t", "labels": [{"name": "bug"}],
                       "repository_url": "https://api.github.com/repos/acme/svc"}),
            )
            .await;

        let mut config = Config::default();
        config.context_storage.base_dir = temp.path().to_path_buf();
        let consumer = Consumer::new(
            config,
            db.clone(),
            ContextLayout::new(temp.path()),
            Arc::new(MockLlmClient::from_texts(&[])),
            server,
            None,
        );

        let dict = json!({"type": "github_issue", "owner": "acme", "repo": "svc", "number": 5, "uuid": "u-5"});
        consumer.process_dict(&dict).await.unwrap();

        // Nothing ran: no context directory, no status change
        assert!(ContextLayout::new(temp.path()).find("u-5").is_none());
    }
}
