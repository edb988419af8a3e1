//! Producer-side task enumeration and key-based reconstruction.

use std::sync::Arc;

use eyre::{Result, eyre};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::domain::TaskKey;
use crate::mcp::ToolCaller;

use super::github::{GithubTask, into_result, parse_json};
use super::gitlab::GitlabTask;
use super::task::TrackedTask;

/// Enumerates activation-labeled work items and rebuilds tasks from keys.
pub struct TaskGetter {
    source: String,
    client: Arc<dyn ToolCaller>,
    config: TrackerConfig,
}

impl TaskGetter {
    pub fn new(source: impl Into<String>, client: Arc<dyn ToolCaller>, config: TrackerConfig) -> Self {
        Self {
            source: source.into(),
            client,
            config,
        }
    }

    /// Fetch open items carrying the activation label.
    pub async fn list_tasks(&self) -> Result<Vec<Arc<dyn TrackedTask>>> {
        match self.source.as_str() {
            "gitlab" => self.list_gitlab().await,
            _ => self.list_github().await,
        }
    }

    /// Rebuild a task from a dequeued key. The upstream item is re-fetched
    /// so labels and assignees are current.
    pub async fn from_key(&self, key: &TaskKey) -> Result<Arc<dyn TrackedTask>> {
        debug!(%key, "from_key: called");
        match key {
            TaskKey::GithubIssue { owner, repo, number } => {
                let payload = self.fetch_github_issue(owner, repo, *number).await?;
                Ok(Arc::new(GithubTask::from_payload(&payload, self.client.clone(), self.config.clone())?))
            }
            TaskKey::GithubPullRequest { owner, repo, number } => {
                let mut payload = self.fetch_github_issue(owner, repo, *number).await?;
                // The issues API marks PRs but does not carry the branch.
                if payload.get("pull_request").is_none() {
                    payload["pull_request"] = json!({});
                }
                if let Ok(pr) = self.fetch_github_pull(owner, repo, *number).await
                    && let Some(head) = pr.get("head")
                {
                    payload["head"] = head.clone();
                }
                Ok(Arc::new(GithubTask::from_payload(&payload, self.client.clone(), self.config.clone())?))
            }
            TaskKey::GitlabIssue { project_id, issue_iid } => {
                let outcome = self
                    .client
                    .call("get_issue", json!({"project_id": project_id, "issue_iid": issue_iid}))
                    .await;
                let payload = parse_json(into_result(outcome)?)?;
                Ok(Arc::new(GitlabTask::from_payload(&payload, self.client.clone(), self.config.clone())?))
            }
            TaskKey::GitlabMergeRequest { project_id, mr_iid } => {
                let outcome = self
                    .client
                    .call(
                        "get_merge_request",
                        json!({"project_id": project_id, "merge_request_iid": mr_iid}),
                    )
                    .await;
                let payload = parse_json(into_result(outcome)?)?;
                Ok(Arc::new(GitlabTask::from_payload(&payload, self.client.clone(), self.config.clone())?))
            }
        }
    }

    async fn list_github(&self) -> Result<Vec<Arc<dyn TrackedTask>>> {
        let query = format!("label:\"{}\" state:open", self.config.bot_label);
        let outcome = self.client.call("search_issues", json!({"query": query})).await;
        let payload = parse_json(into_result(outcome)?)?;

        // search_issues wraps results in `items`; tolerate a bare array too.
        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .or_else(|| payload.as_array().cloned())
            .ok_or_else(|| eyre!("unexpected search_issues shape"))?;

        let mut tasks: Vec<Arc<dyn TrackedTask>> = Vec::new();
        for item in &items {
            match GithubTask::from_payload(item, self.client.clone(), self.config.clone()) {
                Ok(task) => tasks.push(Arc::new(task)),
                Err(e) => warn!(error = %e, "list_github: skipping unparseable item"),
            }
        }
        info!(count = tasks.len(), "list_github: enumerated");
        Ok(tasks)
    }

    async fn list_gitlab(&self) -> Result<Vec<Arc<dyn TrackedTask>>> {
        let outcome = self
            .client
            .call(
                "list_issues",
                json!({"labels": self.config.bot_label, "state": "opened"}),
            )
            .await;
        let payload = parse_json(into_result(outcome)?)?;
        let items = payload
            .as_array()
            .cloned()
            .ok_or_else(|| eyre!("unexpected list_issues shape"))?;

        let mut tasks: Vec<Arc<dyn TrackedTask>> = Vec::new();
        for item in &items {
            match GitlabTask::from_payload(item, self.client.clone(), self.config.clone()) {
                Ok(task) => tasks.push(Arc::new(task)),
                Err(e) => warn!(error = %e, "list_gitlab: skipping unparseable item"),
            }
        }
        info!(count = tasks.len(), "list_gitlab: enumerated");
        Ok(tasks)
    }

    async fn fetch_github_issue(&self, owner: &str, repo: &str, number: i64) -> Result<Value> {
        let outcome = self
            .client
            .call("get_issue", json!({"owner": owner, "repo": repo, "issue_number": number}))
            .await;
        let mut payload = parse_json(into_result(outcome)?)?;
        // Some server versions omit repository_url on direct fetches.
        if payload.get("repository_url").is_none() {
            payload["repository_url"] = json!(format!("https://api.github.com/repos/{owner}/{repo}"));
        }
        Ok(payload)
    }

    async fn fetch_github_pull(&self, owner: &str, repo: &str, number: i64) -> Result<Value> {
        let outcome = self
            .client
            .call(
                "get_pull_request",
                json!({"owner": owner, "repo": repo, "pullNumber": number}),
            )
            .await;
        parse_json(into_result(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::testing::MockToolServer;

    #[tokio::test]
    async fn test_list_github_parses_items() {
        let server = MockToolServer::new("github");
        server
            .respond_with(
                "search_issues",
                json!({"items": [
                    {"number": 1, "title": "a", "repository_url": "https://api.github.com/repos/acme/svc", "labels": []},
                    {"number": 2, "title": "b", "repository_url": "https://api.github.com/repos/acme/svc", "labels": []},
                    {"title": "broken, no number"}
                ]}),
            )
            .await;

        let getter = TaskGetter::new("github", server.clone(), TrackerConfig::default());
        let tasks = getter.list_tasks().await.unwrap();
        // Broken item skipped, not fatal
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].key().number(), 1);

        let calls = server.calls().await;
        assert!(calls[0].1["query"].as_str().unwrap().contains("coding agent"));
    }

    #[tokio::test]
    async fn test_from_key_github_issue() {
        let server = MockToolServer::new("github");
        server
            .respond_with(
                "get_issue",
                json!({"number": 42, "title": "t", "repository_url": "https://api.github.com/repos/acme/svc", "labels": []}),
            )
            .await;

        let getter = TaskGetter::new("github", server, TrackerConfig::default());
        let key = TaskKey::GithubIssue {
            owner: "acme".to_string(),
            repo: "svc".to_string(),
            number: 42,
        };
        let task = getter.from_key(&key).await.unwrap();
        assert_eq!(task.key(), &key);
    }

    #[tokio::test]
    async fn test_from_key_github_pr_grafts_head() {
        let server = MockToolServer::new("github");
        server
            .respond_with("get_issue", json!({"number": 7, "title": "pr", "labels": []}))
            .await;
        server
            .respond_with("get_pull_request", json!({"head": {"ref": "feature/x"}}))
            .await;

        let getter = TaskGetter::new("github", server, TrackerConfig::default());
        let key = TaskKey::GithubPullRequest {
            owner: "acme".to_string(),
            repo: "svc".to_string(),
            number: 7,
        };
        let task = getter.from_key(&key).await.unwrap();
        assert_eq!(task.clone_spec().unwrap().branch.as_deref(), Some("feature/x"));
    }

    #[tokio::test]
    async fn test_from_key_gitlab_issue() {
        let server = MockToolServer::new("gitlab");
        server
            .respond_with("get_issue", json!({"iid": 3, "project_id": 7, "title": "t", "labels": []}))
            .await;

        let getter = TaskGetter::new("gitlab", server, TrackerConfig::default());
        let key = TaskKey::GitlabIssue {
            project_id: 7,
            issue_iid: 3,
        };
        let task = getter.from_key(&key).await.unwrap();
        assert_eq!(task.key(), &key);
    }
}
