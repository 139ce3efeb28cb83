//! Per-user notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Notification category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
    Success,
    Grade,
    System,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Info => "INFO",
            NotificationKind::Warning => "WARNING",
            NotificationKind::Error => "ERROR",
            NotificationKind::Success => "SUCCESS",
            NotificationKind::Grade => "GRADE",
            NotificationKind::System => "SYSTEM",
        }
    }
}

/// A short notice addressed to a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<i64>,
    pub user_id: i64,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(
        user_id: i64,
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationKind,
    ) -> Self {
        Self {
            notification_id: None,
            user_id,
            title: title.into(),
            message: message.into(),
            kind,
            action_url: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_notification_expiry() {
        let now = Utc::now();
        let notification = Notification::new(3, "Reminder", "Fees due", NotificationKind::Warning)
            .with_expiry(now - Duration::minutes(1));
        assert!(notification.is_expired(now));
    }

    #[test]
    fn test_notification_serializes_kind() {
        let notification = Notification::new(3, "Grade", "Math: 15/20", NotificationKind::Grade)
            .with_action_url("/grades/3");
        let value = serde_json::to_value(&notification).unwrap();
        assert_eq!(value["kind"], "GRADE");
        assert_eq!(value["actionUrl"], "/grades/3");
        assert_eq!(value["userId"], 3);
    }
}
