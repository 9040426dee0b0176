use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use super::state::DocumentState;

/// Lifecycle directory a document state lives in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateDir {
    Pending,
    Current,
    Completed,
    Corrupt,
}

impl StateDir {
    pub fn dir_name(&self) -> &'static str {
        match self {
            StateDir::Pending => "pending",
            StateDir::Current => "current",
            StateDir::Completed => "completed",
            StateDir::Corrupt => "corrupt",
        }
    }
}

#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("document `{0}` not found under `{1}`")]
    NotFound(String, &'static str),
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
    #[error("serialization error: `{0}`")]
    Serialization(#[from] serde_json::Error),
}

/// On-disk store of document states under
/// `<data-root>/<instance-id>/documents/state/{pending,current,completed,corrupt}`.
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(data_root: &Path, instance_id: &str) -> Self {
        Self {
            root: data_root
                .join(instance_id)
                .join("documents")
                .join("state"),
        }
    }

    pub fn ensure_dirs(&self) -> Result<(), DocumentStoreError> {
        for dir in [
            StateDir::Pending,
            StateDir::Current,
            StateDir::Completed,
            StateDir::Corrupt,
        ] {
            fs::create_dir_all(self.dir_path(dir))?;
        }
        Ok(())
    }

    /// Writes the state as JSON. The write goes to a temp file first and is
    /// renamed into place so readers never observe a partial document.
    pub fn save(&self, state: &DocumentState, dir: StateDir) -> Result<(), DocumentStoreError> {
        let path = self.document_path(&state.document_info.command_id, dir);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn load(&self, command_id: &str, dir: StateDir) -> Result<DocumentState, DocumentStoreError> {
        let path = self.document_path(command_id, dir);
        let contents = fs::read(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                DocumentStoreError::NotFound(command_id.to_string(), dir.dir_name())
            } else {
                DocumentStoreError::Io(err)
            }
        })?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Moves a record between lifecycle directories with a single rename.
    pub fn move_document(
        &self,
        command_id: &str,
        from: StateDir,
        to: StateDir,
    ) -> Result<(), DocumentStoreError> {
        let from_path = self.document_path(command_id, from);
        let to_path = self.document_path(command_id, to);
        fs::rename(&from_path, &to_path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                DocumentStoreError::NotFound(command_id.to_string(), from.dir_name())
            } else {
                DocumentStoreError::Io(err)
            }
        })
    }

    /// Moves an unparseable record aside so it is not retried forever.
    pub fn quarantine(&self, command_id: &str, from: StateDir) {
        if let Err(err) = self.move_document(command_id, from, StateDir::Corrupt) {
            warn!(command_id, %err, "could not quarantine corrupt document state");
        }
    }

    pub fn list(&self, dir: StateDir) -> Result<Vec<String>, DocumentStoreError> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(self.dir_path(dir)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn dir_path(&self, dir: StateDir) -> PathBuf {
        self.root.join(dir.dir_name())
    }

    fn document_path(&self, command_id: &str, dir: StateDir) -> PathBuf {
        self.dir_path(dir).join(command_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::state::{
        DocumentInfo, DocumentStatus, DocumentType, PluginConfiguration, PluginState,
    };
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    fn sample_state(command_id: &str) -> DocumentState {
        DocumentState {
            document_info: DocumentInfo {
                command_id: command_id.to_string(),
                document_id: "doc-1".to_string(),
                instance_id: "i-0123456789".to_string(),
                message_id: format!("aws.ssm.{command_id}.i-0123456789"),
                created_date: "2024-03-01T10:00:00Z".to_string(),
                document_name: "shell".to_string(),
                status: DocumentStatus::InProgress,
                run_id: "run-1".to_string(),
            },
            plugin_states: vec![PluginState {
                plugin_id: "step-0".to_string(),
                plugin_name: "aws:runShellScript".to_string(),
                configuration: PluginConfiguration::default(),
                has_executed: false,
                result: None,
            }],
            document_type: DocumentType::SendCommand,
            cancel_info: None,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::new(dir.path(), "i-0123456789");
        store.ensure_dirs().unwrap();

        let state = sample_state("cmd-1");
        store.save(&state, StateDir::Current).unwrap();

        let loaded = store.load("cmd-1", StateDir::Current).unwrap();
        assert_eq!(state, loaded);
    }

    #[test]
    fn test_move_document_between_dirs() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::new(dir.path(), "i-0123456789");
        store.ensure_dirs().unwrap();

        let state = sample_state("cmd-2");
        store.save(&state, StateDir::Current).unwrap();
        store
            .move_document("cmd-2", StateDir::Current, StateDir::Completed)
            .unwrap();

        assert_matches!(
            store.load("cmd-2", StateDir::Current),
            Err(DocumentStoreError::NotFound(_, "current"))
        );
        assert_eq!(
            store.load("cmd-2", StateDir::Completed).unwrap(),
            state
        );
        assert_eq!(store.list(StateDir::Completed).unwrap(), vec!["cmd-2"]);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::new(dir.path(), "i-none");
        assert!(store.list(StateDir::Pending).unwrap().is_empty());
    }

    #[test]
    fn test_move_missing_document_fails() {
        let dir = tempdir().unwrap();
        let store = DocumentStore::new(dir.path(), "i-0123456789");
        store.ensure_dirs().unwrap();
        assert_matches!(
            store.move_document("ghost", StateDir::Current, StateDir::Completed),
            Err(DocumentStoreError::NotFound(_, _))
        );
    }
}
