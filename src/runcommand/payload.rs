use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::state::{
    CancelInfo, DocumentInfo, DocumentState, DocumentStatus, DocumentType, PluginConfiguration,
    PluginState,
};
use crate::message::{Message, MessageError, Topic};

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("could not parse command payload: `{0}`")]
    Parse(#[from] serde_json::Error),
    #[error("command payload has no plugin steps")]
    NoPlugins,
    #[error("cancel payload names no target command")]
    NoCancelTarget,
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Wire form of a send-command document body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandPayload {
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub document_name: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub plugins: Vec<PluginStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginStep {
    #[serde(default)]
    pub plugin_id: String,
    pub plugin_name: String,
    #[serde(default)]
    pub configuration: PluginConfiguration,
}

/// Wire form of a cancel-command body; references the original command's
/// message id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelPayload {
    pub cancel_message_id: String,
}

/// Builds the persisted document state for a send-command message.
pub fn build_send_command_document(
    message: &Message,
    instance_id: &str,
) -> Result<DocumentState, PayloadError> {
    let payload: CommandPayload = serde_json::from_str(&message.payload)?;
    if payload.plugins.is_empty() {
        return Err(PayloadError::NoPlugins);
    }
    let command_id = message.command_id()?;

    let document_type = match message.parse_topic()? {
        Topic::SendCommandOffline { .. } => DocumentType::SendCommandOffline,
        _ => DocumentType::SendCommand,
    };
    let document_name = match message.parse_topic()? {
        Topic::SendCommand { document_name } | Topic::SendCommandOffline { document_name } => {
            document_name.unwrap_or_else(|| payload.document_name.clone())
        }
        _ => payload.document_name.clone(),
    };

    let plugin_states = payload
        .plugins
        .iter()
        .enumerate()
        .map(|(index, step)| PluginState {
            plugin_id: if step.plugin_id.is_empty() {
                format!("{}_{index}", step.plugin_name)
            } else {
                step.plugin_id.clone()
            },
            plugin_name: step.plugin_name.clone(),
            configuration: step.configuration.clone(),
            has_executed: false,
            result: None,
        })
        .collect();

    Ok(DocumentState {
        document_info: DocumentInfo {
            command_id,
            document_id: payload.document_id,
            instance_id: instance_id.to_string(),
            message_id: message.message_id.clone(),
            created_date: message.created_date.clone(),
            document_name,
            status: DocumentStatus::InProgress,
            run_id: payload.run_id,
        },
        plugin_states,
        document_type,
        cancel_info: None,
    })
}

/// Builds the document state for a cancel-command message. The target command
/// id is embedded in the referenced message id.
pub fn build_cancel_command_document(
    message: &Message,
    instance_id: &str,
) -> Result<DocumentState, PayloadError> {
    let payload: CancelPayload = serde_json::from_str(&message.payload)?;
    if payload.cancel_message_id.is_empty() {
        return Err(PayloadError::NoCancelTarget);
    }
    let target = Message {
        message_id: payload.cancel_message_id.clone(),
        ..Message::default()
    };
    let cancel_command_id = target.command_id()?;
    let command_id = message.command_id()?;

    let document_type = match message.parse_topic()? {
        Topic::CancelCommandOffline => DocumentType::CancelCommandOffline,
        _ => DocumentType::CancelCommand,
    };

    Ok(DocumentState {
        document_info: DocumentInfo {
            command_id,
            document_id: String::new(),
            instance_id: instance_id.to_string(),
            message_id: message.message_id.clone(),
            created_date: message.created_date.clone(),
            document_name: String::new(),
            status: DocumentStatus::InProgress,
            run_id: String::new(),
        },
        plugin_states: Vec::new(),
        document_type,
        cancel_info: Some(CancelInfo { cancel_command_id }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn send_message(payload: &str) -> Message {
        Message {
            message_id: "aws.ssm.cmd123.i-0123456789".to_string(),
            destination: "i-0123456789".to_string(),
            topic: "send-command.shell".to_string(),
            created_date: "2024-03-01T10:00:00Z".to_string(),
            payload: payload.to_string(),
        }
    }

    #[test]
    fn test_build_send_command_document() {
        let payload = r#"{
            "document_id": "doc-9",
            "document_name": "ignored-in-favor-of-topic",
            "run_id": "run-7",
            "plugins": [
                {"plugin_name": "aws:runShellScript"},
                {"plugin_id": "custom-id", "plugin_name": "aws:refreshAssociation"}
            ]
        }"#;
        let document =
            build_send_command_document(&send_message(payload), "i-0123456789").unwrap();

        assert_eq!(document.document_info.command_id, "cmd123");
        assert_eq!(document.document_info.document_name, "shell");
        assert_eq!(document.document_type, DocumentType::SendCommand);
        assert_eq!(document.plugin_states.len(), 2);
        assert_eq!(document.plugin_states[0].plugin_id, "aws:runShellScript_0");
        assert_eq!(document.plugin_states[1].plugin_id, "custom-id");
        assert!(document.cancel_info.is_none());
    }

    #[test]
    fn test_send_command_rejects_empty_plugins() {
        assert_matches!(
            build_send_command_document(&send_message(r#"{"plugins": []}"#), "i-0"),
            Err(PayloadError::NoPlugins)
        );
    }

    #[test]
    fn test_send_command_rejects_bad_json() {
        assert_matches!(
            build_send_command_document(&send_message("not json"), "i-0"),
            Err(PayloadError::Parse(_))
        );
    }

    #[test]
    fn test_build_cancel_command_document() {
        let mut message = send_message(
            r#"{"cancel_message_id": "aws.ssm.original-cmd.i-0123456789"}"#,
        );
        message.topic = "cancel-command.abc".to_string();
        message.message_id = "aws.ssm.cancel-cmd.i-0123456789".to_string();

        let document = build_cancel_command_document(&message, "i-0123456789").unwrap();
        assert_eq!(document.document_type, DocumentType::CancelCommand);
        assert_eq!(document.document_info.command_id, "cancel-cmd");
        assert_eq!(
            document.cancel_info.unwrap().cancel_command_id,
            "original-cmd"
        );
    }

    #[test]
    fn test_cancel_command_rejects_missing_target() {
        let mut message = send_message(r#"{"cancel_message_id": ""}"#);
        message.topic = "cancel-command".to_string();
        assert_matches!(
            build_cancel_command_document(&message, "i-0"),
            Err(PayloadError::NoCancelTarget)
        );
    }
}
