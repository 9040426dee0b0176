use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::document::state::{DocumentState, DocumentStatus, PluginResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl AgentInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalInfo {
    pub agent_info: AgentInfo,
    pub utc_date_time: String,
    pub runtime_status_counts: HashMap<String, u32>,
}

/// Payload sent back for a document, either incrementally or as the final
/// reply. `runtime_status` is keyed by plugin id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub additional_info: AdditionalInfo,
    pub document_status: DocumentStatus,
    pub document_trace_output: String,
    pub runtime_status: HashMap<String, PluginResult>,
}

impl ReplyPayload {
    /// Builds the reply for the document's current progress.
    pub fn from_document(document: &DocumentState) -> Self {
        let runtime_status: HashMap<String, PluginResult> = document
            .plugin_states
            .iter()
            .filter_map(|p| p.result.clone().map(|r| (p.plugin_id.clone(), r)))
            .collect();

        let mut runtime_status_counts: HashMap<String, u32> = HashMap::new();
        for result in runtime_status.values() {
            *runtime_status_counts
                .entry(result.status.as_str().to_string())
                .or_default() += 1;
        }

        let document_trace_output = document
            .plugin_states
            .iter()
            .map(|p| match &p.result {
                Some(result) => format!(
                    "{}: {} (code {})",
                    p.plugin_id, result.status, result.code
                ),
                None => format!("{}: not started", p.plugin_id),
            })
            .collect::<Vec<_>>()
            .join("\n");

        Self {
            additional_info: AdditionalInfo {
                agent_info: AgentInfo::current(),
                utc_date_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                runtime_status_counts,
            },
            document_status: document.aggregate_status(),
            document_trace_output,
            runtime_status,
        }
    }

    /// Reply emitted right after a document is accepted, before any plugin
    /// has run.
    pub fn in_progress(document: &DocumentState) -> Self {
        let mut payload = Self::from_document(document);
        payload.document_status = DocumentStatus::InProgress;
        payload
    }
}

/// A reply that failed to transmit, waiting on disk for the reply loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedReply {
    pub reply_id: String,
    pub message_id: String,
    pub payload: ReplyPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::state::{
        DocumentInfo, DocumentType, PluginConfiguration, PluginState,
    };
    use chrono::Utc;

    fn document_with_results() -> DocumentState {
        let result = |status: DocumentStatus, code: i32| PluginResult {
            plugin_name: "aws:runShellScript".to_string(),
            code,
            status,
            start_time: Utc::now(),
            end_time: Utc::now(),
            output: String::new(),
            standard_output: String::new(),
            standard_error: String::new(),
            output_bucket: String::new(),
            output_prefix: String::new(),
            error: None,
        };
        DocumentState {
            document_info: DocumentInfo {
                command_id: "cmd-1".to_string(),
                document_id: "doc-1".to_string(),
                instance_id: "i-0".to_string(),
                message_id: "aws.ssm.cmd-1.i-0".to_string(),
                created_date: "2024-03-01T10:00:00Z".to_string(),
                document_name: "shell".to_string(),
                status: DocumentStatus::InProgress,
                run_id: "run-1".to_string(),
            },
            plugin_states: vec![
                PluginState {
                    plugin_id: "step-0".to_string(),
                    plugin_name: "aws:runShellScript".to_string(),
                    configuration: PluginConfiguration::default(),
                    has_executed: true,
                    result: Some(result(DocumentStatus::Success, 0)),
                },
                PluginState {
                    plugin_id: "step-1".to_string(),
                    plugin_name: "aws:runShellScript".to_string(),
                    configuration: PluginConfiguration::default(),
                    has_executed: true,
                    result: Some(result(DocumentStatus::Failed, 1)),
                },
            ],
            document_type: DocumentType::SendCommand,
            cancel_info: None,
        }
    }

    #[test]
    fn test_reply_aggregates_statuses_and_counts() {
        let payload = ReplyPayload::from_document(&document_with_results());
        assert_eq!(payload.document_status, DocumentStatus::Failed);
        assert_eq!(payload.runtime_status.len(), 2);
        assert_eq!(
            payload.additional_info.runtime_status_counts.get("success"),
            Some(&1)
        );
        assert_eq!(
            payload.additional_info.runtime_status_counts.get("failed"),
            Some(&1)
        );
        assert!(payload.document_trace_output.contains("step-0: success"));
        assert!(payload.document_trace_output.contains("step-1: failed"));
    }

    #[test]
    fn test_in_progress_reply_overrides_status() {
        let payload = ReplyPayload::in_progress(&document_with_results());
        assert_eq!(payload.document_status, DocumentStatus::InProgress);
    }
}
