use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a document or of a single plugin step, with the wire spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentStatus {
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "timed-out")]
    TimedOut,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "success-and-reboot")]
    SuccessAndReboot,
}

impl DocumentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DocumentStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::InProgress => "in-progress",
            DocumentStatus::Success => "success",
            DocumentStatus::Failed => "failed",
            DocumentStatus::TimedOut => "timed-out",
            DocumentStatus::Cancelled => "cancelled",
            DocumentStatus::SuccessAndReboot => "success-and-reboot",
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DocumentType {
    #[serde(rename = "send-command")]
    SendCommand,
    #[serde(rename = "cancel-command")]
    CancelCommand,
    #[serde(rename = "send-command-offline")]
    SendCommandOffline,
    #[serde(rename = "cancel-command-offline")]
    CancelCommandOffline,
}

impl DocumentType {
    pub fn is_cancel(&self) -> bool {
        matches!(
            self,
            DocumentType::CancelCommand | DocumentType::CancelCommandOffline
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub command_id: String,
    pub document_id: String,
    pub instance_id: String,
    pub message_id: String,
    pub created_date: String,
    pub document_name: String,
    pub status: DocumentStatus,
    pub run_id: String,
}

/// Configuration blob handed to a plugin implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfiguration {
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub output_bucket: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub orchestration_dir: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub precondition_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginResult {
    pub plugin_name: String,
    pub code: i32,
    pub status: DocumentStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub standard_output: String,
    #[serde(default)]
    pub standard_error: String,
    #[serde(default)]
    pub output_bucket: String,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginState {
    pub plugin_id: String,
    pub plugin_name: String,
    pub configuration: PluginConfiguration,
    #[serde(default)]
    pub has_executed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PluginResult>,
}

/// Populated only for cancel documents; names the command to cancel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelInfo {
    pub cancel_command_id: String,
}

/// The persisted, resumable representation of a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub document_info: DocumentInfo,
    pub plugin_states: Vec<PluginState>,
    pub document_type: DocumentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_info: Option<CancelInfo>,
}

impl DocumentState {
    /// Aggregate status over all steps. Any step without a terminal result
    /// keeps the document in progress; terminal statuses are ranked
    /// failed > timed-out > cancelled > success-and-reboot > success.
    pub fn aggregate_status(&self) -> DocumentStatus {
        aggregate_status(self.plugin_states.iter().map(|p| {
            p.result
                .as_ref()
                .map(|r| r.status)
                .unwrap_or(DocumentStatus::InProgress)
        }))
    }
}

pub fn aggregate_status<I>(statuses: I) -> DocumentStatus
where
    I: IntoIterator<Item = DocumentStatus>,
{
    let mut aggregate = DocumentStatus::Success;
    for status in statuses {
        let rank = |s: DocumentStatus| match s {
            DocumentStatus::InProgress => 5,
            DocumentStatus::Failed => 4,
            DocumentStatus::TimedOut => 3,
            DocumentStatus::Cancelled => 2,
            DocumentStatus::SuccessAndReboot => 1,
            DocumentStatus::Success => 0,
        };
        if rank(status) > rank(aggregate) {
            aggregate = status;
        }
    }
    aggregate
}
