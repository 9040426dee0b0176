use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{SecondsFormat, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Transport, TransportBuilder, TransportError};
use crate::message::{format_message_id, Message, TOPIC_SEND_COMMAND_OFFLINE};
use crate::runcommand::payload::CommandPayload;
use crate::runcommand::reply::ReplyPayload;

const NEW_DIR: &str = "new";
const SUBMITTED_DIR: &str = "submitted";
const INVALID_DIR: &str = "invalid";
const COMPLETED_DIR: &str = "completed";

/// File-system transport: operators drop documents into
/// `<data-root>/commands/new/` and the poll loop turns them into synthetic
/// offline messages. Sources move to `submitted/` or `invalid/` on dispatch;
/// terminal results land in `completed/<command-id>`.
pub struct OfflineTransport {
    commands_root: PathBuf,
    stopped: AtomicBool,
}

impl OfflineTransport {
    fn dir(&self, name: &str) -> PathBuf {
        self.commands_root.join(name)
    }

    fn ensure_dirs(&self) -> io::Result<()> {
        for name in [NEW_DIR, SUBMITTED_DIR, INVALID_DIR, COMPLETED_DIR] {
            fs::create_dir_all(self.dir(name))?;
        }
        Ok(())
    }

    fn move_source(&self, file_name: &str, to: &str) {
        let from = self.dir(NEW_DIR).join(file_name);
        let target = self.dir(to).join(file_name);
        if let Err(err) = fs::rename(&from, &target) {
            warn!(file = file_name, to, %err, "could not move offline command source");
        }
    }

    fn is_valid_document(content: &str) -> bool {
        serde_json::from_str::<CommandPayload>(content)
            .map(|payload| !payload.plugins.is_empty())
            .unwrap_or(false)
    }
}

impl Transport for OfflineTransport {
    /// Scans `new/` and synthesizes one send-command-offline message per
    /// valid file.
    fn get_messages(&self, instance_id: &str) -> Result<Vec<Message>, TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::Stopped);
        }
        self.ensure_dirs()
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let mut file_names: Vec<String> = fs::read_dir(self.dir(NEW_DIR))
            .map_err(|err| TransportError::Io(err.to_string()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        file_names.sort();

        let mut messages = Vec::new();
        for file_name in file_names {
            let path = self.dir(NEW_DIR).join(&file_name);
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(file = file_name, %err, "could not read offline command");
                    continue;
                }
            };

            if !Self::is_valid_document(&content) {
                debug!(file = file_name, "offline command is unparseable");
                self.move_source(&file_name, INVALID_DIR);
                continue;
            }

            let command_id = Uuid::new_v4().simple().to_string();
            let document_name = Path::new(&file_name)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| file_name.clone());
            messages.push(Message {
                message_id: format_message_id(&command_id, instance_id),
                destination: instance_id.to_string(),
                topic: format!("{TOPIC_SEND_COMMAND_OFFLINE}.{document_name}"),
                created_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
                payload: content,
            });
            self.move_source(&file_name, SUBMITTED_DIR);
        }
        Ok(messages)
    }

    /// The source file already moved on dispatch; nothing to acknowledge.
    fn ack(&self, _message_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Terminal results are written to `completed/<command-id>`; intermediate
    /// progress has no offline consumer.
    fn send_reply(&self, message_id: &str, payload: &ReplyPayload) -> Result<(), TransportError> {
        if !payload.document_status.is_terminal() {
            return Ok(());
        }
        self.ensure_dirs()
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let command_id = Message {
            message_id: message_id.to_string(),
            ..Message::default()
        }
        .command_id()
        .map_err(|err| TransportError::Encoding(err.to_string()))?;

        let body = serde_json::to_vec_pretty(payload)
            .map_err(|err| TransportError::Encoding(err.to_string()))?;
        fs::write(self.dir(COMPLETED_DIR).join(command_id), body)
            .map_err(|err| TransportError::Io(err.to_string()))
    }

    fn fail(&self, message_id: &str, reason: &str) -> Result<(), TransportError> {
        warn!(message_id, reason, "offline command failed dispatch");
        Ok(())
    }

    fn delete(&self, _message_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct OfflineTransportBuilder {
    data_root: PathBuf,
}

impl OfflineTransportBuilder {
    pub fn new(data_root: &Path) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
        }
    }
}

impl TransportBuilder for OfflineTransportBuilder {
    type T = OfflineTransport;

    fn build(&self) -> Result<Self::T, TransportError> {
        let transport = OfflineTransport {
            commands_root: self.data_root.join("commands"),
            stopped: AtomicBool::new(false),
        };
        transport
            .ensure_dirs()
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::state::DocumentStatus;
    use crate::runcommand::reply::{AdditionalInfo, AgentInfo};
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn transport(data_root: &Path) -> OfflineTransport {
        OfflineTransportBuilder::new(data_root).build().unwrap()
    }

    fn valid_document() -> String {
        serde_json::json!({
            "plugins": [{"plugin_name": "aws:runShellScript"}]
        })
        .to_string()
    }

    #[test]
    fn test_valid_document_becomes_offline_message() {
        let dir = tempdir().unwrap();
        let transport = transport(dir.path());
        let new_dir = dir.path().join("commands").join(NEW_DIR);
        fs::write(new_dir.join("restart-nginx.json"), valid_document()).unwrap();

        let messages = transport.get_messages("i-0123456789").unwrap();
        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(message.topic, "send-command-offline.restart-nginx");
        assert!(message.message_id.starts_with("aws.ssm."));
        assert!(message.validate().is_ok());

        // source moved to submitted
        assert!(!new_dir.join("restart-nginx.json").exists());
        assert!(dir
            .path()
            .join("commands")
            .join(SUBMITTED_DIR)
            .join("restart-nginx.json")
            .exists());
    }

    #[test]
    fn test_unparseable_document_is_quarantined() {
        let dir = tempdir().unwrap();
        let transport = transport(dir.path());
        fs::write(
            dir.path().join("commands").join(NEW_DIR).join("broken.json"),
            "not a document",
        )
        .unwrap();

        let messages = transport.get_messages("i-0123456789").unwrap();
        assert!(messages.is_empty());
        assert!(dir
            .path()
            .join("commands")
            .join(INVALID_DIR)
            .join("broken.json")
            .exists());
    }

    #[test]
    fn test_terminal_reply_lands_in_completed() {
        let dir = tempdir().unwrap();
        let transport = transport(dir.path());

        let payload = ReplyPayload {
            additional_info: AdditionalInfo {
                agent_info: AgentInfo::current(),
                utc_date_time: "2024-03-01T10:00:00Z".to_string(),
                runtime_status_counts: HashMap::new(),
            },
            document_status: DocumentStatus::Success,
            document_trace_output: String::new(),
            runtime_status: HashMap::new(),
        };
        transport
            .send_reply("aws.ssm.cmd0ffl1ne.i-0123456789", &payload)
            .unwrap();

        assert!(dir
            .path()
            .join("commands")
            .join(COMPLETED_DIR)
            .join("cmd0ffl1ne")
            .exists());
    }

    #[test]
    fn test_in_progress_reply_is_not_written() {
        let dir = tempdir().unwrap();
        let transport = transport(dir.path());

        let payload = ReplyPayload {
            additional_info: AdditionalInfo {
                agent_info: AgentInfo::current(),
                utc_date_time: "2024-03-01T10:00:00Z".to_string(),
                runtime_status_counts: HashMap::new(),
            },
            document_status: DocumentStatus::InProgress,
            document_trace_output: String::new(),
            runtime_status: HashMap::new(),
        };
        transport
            .send_reply("aws.ssm.cmd0ffl1ne.i-0123456789", &payload)
            .unwrap();
        assert!(!dir
            .path()
            .join("commands")
            .join(COMPLETED_DIR)
            .join("cmd0ffl1ne")
            .exists());
    }
}
