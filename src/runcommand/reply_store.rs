use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use super::reply::BufferedReply;

const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

#[derive(Error, Debug)]
pub enum ReplyStoreError {
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
    #[error("serialization error: `{0}`")]
    Serialization(#[from] serde_json::Error),
    #[error("malformed reply file name `{0}`")]
    MalformedName(String),
}

/// Durable queue of replies that failed to transmit, under
/// `<data-root>/<instance-id>/replies/`. File names are
/// `<reply_id>_<yyyy-mm-ddThh-mm-ss>` and never change after the write.
pub struct ReplyStore {
    dir: PathBuf,
}

fn well_formed_name() -> &'static Regex {
    static NAME: OnceLock<Regex> = OnceLock::new();
    NAME.get_or_init(|| {
        Regex::new(r"^(reply|[0-9a-fA-F-]+)_\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}$")
            .expect("reply file name pattern is valid")
    })
}

impl ReplyStore {
    pub fn new(data_root: &Path, instance_id: &str) -> Self {
        Self {
            dir: data_root.join(instance_id).join("replies"),
        }
    }

    pub fn ensure_dir(&self) -> Result<(), ReplyStoreError> {
        Ok(fs::create_dir_all(&self.dir)?)
    }

    /// Well-formed reply file names, lexicographic.
    pub fn list(&self) -> Result<Vec<String>, ReplyStoreError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if well_formed_name().is_match(&name) {
                names.push(name);
            } else {
                debug!(name, "skipping file with unexpected name in reply dir");
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn load(&self, name: &str) -> Result<BufferedReply, ReplyStoreError> {
        if !well_formed_name().is_match(name) {
            return Err(ReplyStoreError::MalformedName(name.to_string()));
        }
        let contents = fs::read(self.dir.join(name))?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Idempotent per reply id: if any file already starts with the reply's
    /// id the write is skipped.
    pub fn persist(&self, reply: &BufferedReply) -> Result<(), ReplyStoreError> {
        self.ensure_dir()?;
        let prefix = format!("{}_", reply.reply_id);
        for existing in self.list()? {
            if existing.starts_with(&prefix) {
                debug!(reply_id = reply.reply_id, "reply already persisted");
                return Ok(());
            }
        }
        let name = format!(
            "{}_{}",
            reply.reply_id,
            Utc::now().format(FILE_TIMESTAMP_FORMAT)
        );
        fs::write(self.dir.join(name), serde_json::to_vec(reply)?)?;
        Ok(())
    }

    /// Removes a persisted reply; a missing file is not an error.
    pub fn delete(&self, name: &str) -> Result<(), ReplyStoreError> {
        match fs::remove_file(self.dir.join(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::state::DocumentStatus;
    use crate::runcommand::reply::{AdditionalInfo, AgentInfo, ReplyPayload};
    use assert_matches::assert_matches;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn buffered_reply(reply_id: &str) -> BufferedReply {
        BufferedReply {
            reply_id: reply_id.to_string(),
            message_id: "aws.ssm.cmd-1.i-0".to_string(),
            payload: ReplyPayload {
                additional_info: AdditionalInfo {
                    agent_info: AgentInfo::current(),
                    utc_date_time: "2024-03-01T10:00:00Z".to_string(),
                    runtime_status_counts: HashMap::new(),
                },
                document_status: DocumentStatus::Success,
                document_trace_output: String::new(),
                runtime_status: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_persist_list_load_delete() {
        let dir = tempdir().unwrap();
        let store = ReplyStore::new(dir.path(), "i-0123456789");

        let reply = buffered_reply("0e1d7a51-53e8-4d7a-8a14-a51e0bd6a0a5");
        store.persist(&reply).unwrap();

        let names = store.list().unwrap();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("0e1d7a51-53e8-4d7a-8a14-a51e0bd6a0a5_"));

        let loaded = store.load(&names[0]).unwrap();
        assert_eq!(loaded, reply);

        store.delete(&names[0]).unwrap();
        assert!(store.list().unwrap().is_empty());
        // deleting again tolerates absence
        store.delete(&names[0]).unwrap();
    }

    #[test]
    fn test_persist_is_idempotent_per_reply_id() {
        let dir = tempdir().unwrap();
        let store = ReplyStore::new(dir.path(), "i-0123456789");

        let reply = buffered_reply("3f2b8e1c-aaaa-bbbb-cccc-123456789012");
        store.persist(&reply).unwrap();
        store.persist(&reply).unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_skips_malformed_names() {
        let dir = tempdir().unwrap();
        let store = ReplyStore::new(dir.path(), "i-0123456789");
        store.ensure_dir().unwrap();

        let replies = dir.path().join("i-0123456789").join("replies");
        fs::write(replies.join("not-a-reply.txt"), b"{}").unwrap();
        fs::write(replies.join("reply_2024-03-01T10-00-00"), b"{}").unwrap();
        fs::write(
            replies.join("0e1d7a51-53e8-4d7a-8a14-a51e0bd6a0a5_2024-03-01T10-00-00"),
            b"{}",
        )
        .unwrap();

        let names = store.list().unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|n| n != "not-a-reply.txt"));
    }

    #[test]
    fn test_load_rejects_malformed_name() {
        let dir = tempdir().unwrap();
        let store = ReplyStore::new(dir.path(), "i-0123456789");
        assert_matches!(
            store.load("../escape"),
            Err(ReplyStoreError::MalformedName(_))
        );
    }
}
