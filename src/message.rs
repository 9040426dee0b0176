use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix shared by every message id: `aws.ssm.<command_id>.<instance_id>`.
pub const MESSAGE_ID_PREFIX: &str = "aws.ssm";

pub const TOPIC_SEND_COMMAND: &str = "send-command";
pub const TOPIC_CANCEL_COMMAND: &str = "cancel-command";
pub const TOPIC_SEND_COMMAND_OFFLINE: &str = "send-command-offline";
pub const TOPIC_CANCEL_COMMAND_OFFLINE: &str = "cancel-command-offline";

#[derive(Error, Debug, PartialEq)]
pub enum MessageError {
    #[error("message `{0}` misses required field `{1}`")]
    MissingField(String, &'static str),
    #[error("unrecognized topic `{0}`")]
    UnrecognizedTopic(String),
    #[error("message id `{0}` does not embed a command id")]
    MalformedMessageId(String),
}

/// Unit delivered by long-poll from the message service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub created_date: String,
    #[serde(default)]
    pub payload: String,
}

/// Parsed topic kind. The suffix after the first dot names the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Topic {
    SendCommand { document_name: Option<String> },
    CancelCommand,
    SendCommandOffline { document_name: Option<String> },
    CancelCommandOffline,
}

impl Topic {
    pub fn is_cancel(&self) -> bool {
        matches!(self, Topic::CancelCommand | Topic::CancelCommandOffline)
    }
}

impl Message {
    /// Checks the fields the pipeline relies on before dispatch.
    pub fn validate(&self) -> Result<(), MessageError> {
        let required = [
            ("topic", &self.topic),
            ("destination", &self.destination),
            ("message_id", &self.message_id),
            ("created_date", &self.created_date),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(MessageError::MissingField(self.message_id.clone(), name));
            }
        }
        Ok(())
    }

    pub fn parse_topic(&self) -> Result<Topic, MessageError> {
        let (kind, suffix) = match self.topic.split_once('.') {
            Some((kind, suffix)) => (kind, Some(suffix)),
            None => (self.topic.as_str(), None),
        };
        let document_name = suffix.filter(|s| !s.is_empty()).map(str::to_string);
        match kind {
            TOPIC_SEND_COMMAND => Ok(Topic::SendCommand { document_name }),
            TOPIC_CANCEL_COMMAND => Ok(Topic::CancelCommand),
            TOPIC_SEND_COMMAND_OFFLINE => Ok(Topic::SendCommandOffline { document_name }),
            TOPIC_CANCEL_COMMAND_OFFLINE => Ok(Topic::CancelCommandOffline),
            _ => Err(MessageError::UnrecognizedTopic(self.topic.clone())),
        }
    }

    /// Extracts the command id embedded in `aws.ssm.<command_id>.<instance_id>`.
    pub fn command_id(&self) -> Result<String, MessageError> {
        parse_command_id(&self.message_id)
            .ok_or_else(|| MessageError::MalformedMessageId(self.message_id.clone()))
    }
}

/// Builds the wire message id for a command targeting an instance.
pub fn format_message_id(command_id: &str, instance_id: &str) -> String {
    format!("{MESSAGE_ID_PREFIX}.{command_id}.{instance_id}")
}

fn parse_command_id(message_id: &str) -> Option<String> {
    let rest = message_id.strip_prefix(MESSAGE_ID_PREFIX)?.strip_prefix('.')?;
    let (command_id, _instance_id) = rest.split_once('.')?;
    if command_id.is_empty() {
        return None;
    }
    Some(command_id.to_string())
}
