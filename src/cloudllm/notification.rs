//! Notification entities and port (ambient external collaborator per §1/§6).
//!
//! [`NotificationRequest`] mirrors the wire shape the source posts to its
//! `ntfy`-style backend; the concrete delivery backend is an external
//! collaborator, so this module ships the port plus an in-memory double used
//! by the workflow's own tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::cloudllm::errors::Result;

/// A single custom action button on a delivered notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationAction {
    pub action: String,
    pub label: String,
    pub url: String,
    #[serde(default)]
    pub clear: bool,
}

/// The outbound notification shape. Defaults mirror the source: a friendly
/// placeholder title/message/tags/priority and markdown rendering on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRequest {
    pub topic: String,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub actions: Vec<NotificationAction>,
    #[serde(default)]
    pub click: Option<String>,
    #[serde(default)]
    pub attach: Option<String>,
    #[serde(default = "default_markdown")]
    pub markdown: bool,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub call: Option<String>,
}

fn default_message() -> String {
    "👋 Hello there".to_string()
}

fn default_title() -> String {
    "Notification".to_string()
}

fn default_tags() -> Vec<String> {
    vec!["notification".to_string()]
}

fn default_priority() -> u8 {
    3
}

fn default_markdown() -> bool {
    true
}

impl NotificationRequest {
    /// Build a request against `topic` carrying the source's documented
    /// defaults for every other field.
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            message: default_message(),
            title: default_title(),
            tags: default_tags(),
            priority: default_priority(),
            actions: Vec::new(),
            click: None,
            attach: None,
            markdown: default_markdown(),
            icon: None,
            delay: None,
            email: None,
            call: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

/// A delivered notification, as handed back by the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub topic: String,
    pub message: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Delivery timestamp, serialized ISO-8601 by `chrono`'s `serde` feature
    /// (§6's "custom encoder serializes timestamps as ISO-8601" data-encoding
    /// note). Generated by the gateway at send time, never by workflow code,
    /// per the replay-determinism rule (§5/§9: clocks belong in activities).
    pub delivered_at: chrono::DateTime<chrono::Utc>,
}

/// Notification delivery port. A concrete backend (`ntfy`, email, etc.) is
/// an external collaborator per §1; this crate ships the port plus
/// [`InMemoryNotificationGateway`] for workflow tests.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send(&self, request: NotificationRequest) -> Result<Notification>;
}

/// Records every request it receives instead of delivering anywhere. Used by
/// `BaseWorkflow` tests to assert notification content without a live
/// backend.
#[derive(Default)]
pub struct InMemoryNotificationGateway {
    sent: Mutex<Vec<NotificationRequest>>,
}

impl InMemoryNotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<NotificationRequest> {
        self.sent.lock().expect("notification log poisoned").clone()
    }
}

#[async_trait]
impl NotificationGateway for InMemoryNotificationGateway {
    async fn send(&self, request: NotificationRequest) -> Result<Notification> {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            topic: request.topic.clone(),
            message: request.message.clone(),
            title: Some(request.title.clone()),
            delivered_at: chrono::Utc::now(),
        };
        self.sent.lock().expect("notification log poisoned").push(request);
        Ok(notification)
    }
}
