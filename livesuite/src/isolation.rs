//! Config isolation: the subject only ever sees a run-scoped copy of its
//! configuration, and the original is hashed before and after the run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use livesuite_common::ErrorCategory;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

/// Location of the copy, relative to the run directory.
pub const ISOLATED_CONFIG_RELATIVE: &str = "tmp/config.json";

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("failed to resolve config path {path}: {source}")]
    Resolve { path: PathBuf, source: io::Error },

    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write isolated config {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("parse config failed: {source}")]
    Parse { source: serde_json::Error },

    #[error("original config changed unexpectedly: {path}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

impl IsolationError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Infrastructure
    }
}

/// One subject account as stored in its config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub mobile: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub token: String,
}

impl AccountEntry {
    /// Email if present, otherwise mobile. Trimmed; `None` when both are
    /// blank.
    pub fn identifier(&self) -> Option<String> {
        [self.email.trim(), self.mobile.trim()]
            .into_iter()
            .find(|id| !id.is_empty())
            .map(str::to_string)
    }
}

/// The parts of the subject's config the harness needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
}

impl ConfigSnapshot {
    /// First API key, trimmed. Empty when the config has none.
    pub fn api_key(&self) -> String {
        self.keys
            .first()
            .map(|k| k.trim().to_string())
            .unwrap_or_default()
    }

    /// Identifier of the first account that has one.
    pub fn account_id(&self) -> Option<String> {
        self.accounts.iter().find_map(AccountEntry::identifier)
    }
}

/// Result of isolating a config file into a run directory.
#[derive(Debug, Clone)]
pub struct IsolatedConfig {
    /// Absolute path of the untouched original.
    pub original_path: PathBuf,
    /// Writable copy handed to the subject.
    pub copy_path: PathBuf,
    /// Hex SHA-256 of the original at isolation time.
    pub original_hash: String,
    pub snapshot: ConfigSnapshot,
}

impl IsolatedConfig {
    pub fn api_key(&self) -> String {
        self.snapshot.api_key()
    }

    pub fn account_id(&self) -> Option<String> {
        self.snapshot.account_id()
    }

    /// Re-hash the original and fail if it changed since isolation.
    pub fn verify_untouched(&self) -> Result<(), IsolationError> {
        verify_untouched(&self.original_path, &self.original_hash)
    }
}

/// Hex SHA-256 of a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Copy `config_path` to `<run_dir>/tmp/config.json`, hash the original and
/// parse bootstrap values.
///
/// The copy is written before parsing, so a parse failure still leaves it
/// on disk for inspection.
pub fn isolate(config_path: &Path, run_dir: &Path) -> Result<IsolatedConfig, IsolationError> {
    let original_path = std::path::absolute(config_path).map_err(|source| IsolationError::Resolve {
        path: config_path.to_path_buf(),
        source,
    })?;
    let raw = fs::read(&original_path).map_err(|source| IsolationError::Read {
        path: original_path.clone(),
        source,
    })?;
    let original_hash = content_hash(&raw);

    let copy_path = run_dir.join(ISOLATED_CONFIG_RELATIVE);
    if let Some(parent) = copy_path.parent() {
        fs::create_dir_all(parent).map_err(|source| IsolationError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&copy_path, &raw).map_err(|source| IsolationError::Write {
        path: copy_path.clone(),
        source,
    })?;
    debug!(copy = %copy_path.display(), "Wrote isolated config copy");

    let snapshot: ConfigSnapshot =
        serde_json::from_slice(&raw).map_err(|source| IsolationError::Parse { source })?;

    info!(
        original = %original_path.display(),
        hash = %original_hash,
        keys = snapshot.keys.len(),
        accounts = snapshot.accounts.len(),
        "Config isolated"
    );

    Ok(IsolatedConfig {
        original_path,
        copy_path,
        original_hash,
        snapshot,
    })
}

/// Fail with [`IsolationError::IntegrityMismatch`] if `path` no longer
/// hashes to `expected`.
pub fn verify_untouched(path: &Path, expected: &str) -> Result<(), IsolationError> {
    let raw = fs::read(path).map_err(|source| IsolationError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let actual = content_hash(&raw);
    if actual != expected {
        return Err(IsolationError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "keys": ["  sk-test-1 ", "sk-test-2"],
        "accounts": [
            {"email": " ", "mobile": "", "password": "x"},
            {"email": "", "mobile": " 13800000000 ", "password": "p"},
            {"email": "b@example.com", "password": "q"}
        ],
        "unrelated": {"kept": true}
    }"#;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_isolate_copies_hashes_and_parses() {
        let src = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let path = write_config(&src, SAMPLE);

        let isolated = isolate(&path, run.path()).unwrap();
        assert!(isolated.original_path.is_absolute());
        assert_eq!(isolated.copy_path, run.path().join("tmp/config.json"));
        assert_eq!(fs::read_to_string(&isolated.copy_path).unwrap(), SAMPLE);
        assert_eq!(isolated.original_hash, content_hash(SAMPLE.as_bytes()));
        assert_eq!(isolated.api_key(), "sk-test-1");
        assert_eq!(isolated.account_id().as_deref(), Some("13800000000"));
    }

    #[test]
    fn test_email_preferred_over_mobile() {
        let account = AccountEntry {
            email: "a@example.com".into(),
            mobile: "123".into(),
            ..AccountEntry::default()
        };
        assert_eq!(account.identifier().as_deref(), Some("a@example.com"));
    }

    #[test]
    fn test_empty_config_has_no_bootstrap_values() {
        let src = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let path = write_config(&src, "{}");
        let isolated = isolate(&path, run.path()).unwrap();
        assert_eq!(isolated.api_key(), "");
        assert_eq!(isolated.account_id(), None);
    }

    #[test]
    fn test_parse_error_still_leaves_copy() {
        let src = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let path = write_config(&src, "{not json");

        let err = isolate(&path, run.path()).unwrap_err();
        assert!(matches!(err, IsolationError::Parse { .. }));
        assert!(err.to_string().starts_with("parse config failed"));
        assert!(run.path().join("tmp/config.json").exists());
    }

    #[test]
    fn test_missing_source_is_read_error() {
        let run = TempDir::new().unwrap();
        let err = isolate(Path::new("/definitely/not/here.json"), run.path()).unwrap_err();
        assert!(matches!(err, IsolationError::Read { .. }));
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn test_writes_to_copy_do_not_affect_integrity() {
        let src = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let path = write_config(&src, SAMPLE);
        let isolated = isolate(&path, run.path()).unwrap();

        fs::write(&isolated.copy_path, r#"{"keys":["changed"]}"#).unwrap();
        isolated.verify_untouched().unwrap();
    }

    #[test]
    fn test_modified_original_fails_integrity() {
        let src = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let path = write_config(&src, SAMPLE);
        let isolated = isolate(&path, run.path()).unwrap();

        fs::write(&path, r#"{"keys":[]}"#).unwrap();
        let err = isolated.verify_untouched().unwrap_err();
        match err {
            IsolationError::IntegrityMismatch {
                expected, actual, ..
            } => assert_ne!(expected, actual),
            other => panic!("unexpected error: {other}"),
        }
    }
}
