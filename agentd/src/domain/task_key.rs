//! Work-item identity.
//!
//! A `TaskKey` names an issue, pull request or merge request independent of
//! any attempt to process it. The dict form is the canonical queue transport
//! and must stay wire-compatible with already-enqueued items, so the `type`
//! discriminator and field names are load-bearing.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use taskdb::TaskKeyParts;

/// Identity of a unit of work, tagged by source and kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKey {
    GithubIssue {
        owner: String,
        repo: String,
        number: i64,
    },
    GithubPullRequest {
        owner: String,
        repo: String,
        number: i64,
    },
    GitlabIssue {
        project_id: i64,
        issue_iid: i64,
    },
    GitlabMergeRequest {
        project_id: i64,
        mr_iid: i64,
    },
}

impl TaskKey {
    /// Canonical dict form for queue transport.
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("task key serializes")
    }

    /// Rebuild from the dict form. Unknown discriminators are an error.
    pub fn from_dict(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone()).context("Invalid task key dict")
    }

    /// Which tracker this key belongs to: "github" or "gitlab".
    pub fn source(&self) -> &'static str {
        match self {
            Self::GithubIssue { .. } | Self::GithubPullRequest { .. } => "github",
            Self::GitlabIssue { .. } | Self::GitlabMergeRequest { .. } => "gitlab",
        }
    }

    /// The issue/PR number or GitLab iid.
    pub fn number(&self) -> i64 {
        match self {
            Self::GithubIssue { number, .. } | Self::GithubPullRequest { number, .. } => *number,
            Self::GitlabIssue { issue_iid, .. } => *issue_iid,
            Self::GitlabMergeRequest { mr_iid, .. } => *mr_iid,
        }
    }

    /// True for pull/merge requests, which carry a source branch to check out.
    pub fn is_change_request(&self) -> bool {
        matches!(self, Self::GithubPullRequest { .. } | Self::GitlabMergeRequest { .. })
    }

    /// The flattened database projection.
    pub fn db_parts(&self) -> TaskKeyParts {
        match self {
            Self::GithubIssue { owner, repo, number } => TaskKeyParts {
                task_source: "github".to_string(),
                task_type: "issue".to_string(),
                owner: Some(owner.clone()),
                repo: Some(repo.clone()),
                project_id: None,
                number: *number,
            },
            Self::GithubPullRequest { owner, repo, number } => TaskKeyParts {
                task_source: "github".to_string(),
                task_type: "pull_request".to_string(),
                owner: Some(owner.clone()),
                repo: Some(repo.clone()),
                project_id: None,
                number: *number,
            },
            Self::GitlabIssue { project_id, issue_iid } => TaskKeyParts {
                task_source: "gitlab".to_string(),
                task_type: "issue".to_string(),
                owner: None,
                repo: None,
                project_id: Some(*project_id),
                number: *issue_iid,
            },
            Self::GitlabMergeRequest { project_id, mr_iid } => TaskKeyParts {
                task_source: "gitlab".to_string(),
                task_type: "merge_request".to_string(),
                owner: None,
                repo: None,
                project_id: Some(*project_id),
                number: *mr_iid,
            },
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GithubIssue { owner, repo, number } => write!(f, "{owner}/{repo}#{number}"),
            Self::GithubPullRequest { owner, repo, number } => write!(f, "{owner}/{repo}#{number} (PR)"),
            Self::GitlabIssue { project_id, issue_iid } => write!(f, "project {project_id} #{issue_iid}"),
            Self::GitlabMergeRequest { project_id, mr_iid } => write!(f, "project {project_id} !{mr_iid}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn all_variants() -> Vec<TaskKey> {
        vec![
            TaskKey::GithubIssue {
                owner: "acme".to_string(),
                repo: "svc".to_string(),
                number: 42,
            },
            TaskKey::GithubPullRequest {
                owner: "acme".to_string(),
                repo: "svc".to_string(),
                number: 7,
            },
            TaskKey::GitlabIssue {
                project_id: 11,
                issue_iid: 3,
            },
            TaskKey::GitlabMergeRequest {
                project_id: 11,
                mr_iid: 9,
            },
        ]
    }

    #[test]
    fn test_dict_round_trip_all_variants() {
        for key in all_variants() {
            let dict = key.to_dict();
            let restored = TaskKey::from_dict(&dict).unwrap();
            assert_eq!(key, restored);
        }
    }

    #[test]
    fn test_wire_format_github_issue() {
        let key = TaskKey::GithubIssue {
            owner: "acme".to_string(),
            repo: "svc".to_string(),
            number: 42,
        };
        assert_eq!(
            key.to_dict(),
            json!({"type": "github_issue", "owner": "acme", "repo": "svc", "number": 42})
        );
    }

    #[test]
    fn test_wire_format_gitlab_merge_request() {
        let key = TaskKey::GitlabMergeRequest {
            project_id: 11,
            mr_iid: 9,
        };
        assert_eq!(key.to_dict(), json!({"type": "gitlab_merge_request", "project_id": 11, "mr_iid": 9}));
    }

    #[test]
    fn test_unknown_discriminator_rejected() {
        let dict = json!({"type": "bitbucket_issue", "number": 1});
        assert!(TaskKey::from_dict(&dict).is_err());
    }

    #[test]
    fn test_db_parts_github() {
        let key = TaskKey::GithubPullRequest {
            owner: "acme".to_string(),
            repo: "svc".to_string(),
            number: 7,
        };
        let parts = key.db_parts();
        assert_eq!(parts.task_source, "github");
        assert_eq!(parts.task_type, "pull_request");
        assert_eq!(parts.owner.as_deref(), Some("acme"));
        assert_eq!(parts.number, 7);
        assert!(parts.project_id.is_none());
    }

    #[test]
    fn test_db_parts_gitlab_uses_iid_as_number() {
        let key = TaskKey::GitlabIssue {
            project_id: 11,
            issue_iid: 3,
        };
        let parts = key.db_parts();
        assert_eq!(parts.task_source, "gitlab");
        assert_eq!(parts.project_id, Some(11));
        assert_eq!(parts.number, 3);
        assert!(parts.owner.is_none());
    }

    #[test]
    fn test_change_request_detection() {
        let keys = all_variants();
        assert!(!keys[0].is_change_request());
        assert!(keys[1].is_change_request());
        assert!(!keys[2].is_change_request());
        assert!(keys[3].is_change_request());
    }

    #[test]
    fn test_display_forms() {
        let keys = all_variants();
        assert_eq!(keys[0].to_string(), "acme/svc#42");
        assert_eq!(keys[3].to_string(), "project 11 !9");
    }

    proptest::proptest! {
        #[test]
        fn prop_github_dict_round_trip(owner in "[A-Za-z0-9-]{1,30}", repo in "[A-Za-z0-9._-]{1,30}", number in 1i64..1_000_000) {
            let key = TaskKey::GithubIssue { owner, repo, number };
            proptest::prop_assert_eq!(TaskKey::from_dict(&key.to_dict()).unwrap(), key);
        }

        #[test]
        fn prop_gitlab_dict_round_trip(project_id in 1i64..1_000_000, iid in 1i64..1_000_000) {
            let key = TaskKey::GitlabMergeRequest { project_id, mr_iid: iid };
            proptest::prop_assert_eq!(TaskKey::from_dict(&key.to_dict()).unwrap(), key);
        }
    }
}
