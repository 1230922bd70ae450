use serde::{Deserialize, Serialize};

/// Input for creating an issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIssue {
    pub title: String,
    pub body: String,
    /// Tracker priority; 1 is urgent.
    pub priority: i32,
}

impl NewIssue {
    /// An urgent issue (priority 1).
    pub fn urgent(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            priority: 1,
        }
    }
}

/// A created issue as returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// Human-facing identifier, e.g. "ENG-123". May be empty.
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub url: String,
}

/// A comment on an issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueComment {
    pub body: String,
    #[serde(default)]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_sets_priority_one() {
        let issue = NewIssue::urgent("t", "b");
        assert_eq!(issue.priority, 1);
        assert_eq!(issue.title, "t");
    }

    #[test]
    fn issue_tolerates_missing_optional_fields() {
        let issue: Issue = serde_json::from_str(r#"{"id":"abc"}"#).unwrap();
        assert_eq!(issue.id, "abc");
        assert!(issue.url.is_empty());
    }
}
