//! Local credential file for the CLI
//!
//! Holds the refresh token obtained by `stack login`. Writes go through a
//! temp file + rename so a crash mid-write never leaves a truncated file,
//! and the file is created with 0600 permissions.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default location relative to `$HOME`.
const DEFAULT_RELATIVE_PATH: &str = ".stack/credentials.json";

/// What `stack login` persists.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub refresh_token: String,
    /// API the token was issued by
    pub api_url: String,
    /// Unix milliseconds
    pub saved_at: u64,
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredential")
            .field("refresh_token", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("saved_at", &self.saved_at)
            .finish()
    }
}

/// Handle to the credential file at a fixed path.
#[derive(Debug, Clone)]
pub struct CredentialFile {
    path: PathBuf,
}

impl CredentialFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `$HOME/.stack/credentials.json`
    pub fn default_path() -> Result<PathBuf> {
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .context("HOME is not set; pass --credentials or set STACK_CLI_CREDENTIALS")?;
        Ok(PathBuf::from(home).join(DEFAULT_RELATIVE_PATH))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored credential, if any.
    pub async fn load(&self) -> Result<Option<StoredCredential>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        let credential = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(credential))
    }

    /// Replace the stored credential.
    pub async fn save(&self, credential: &StoredCredential) -> Result<()> {
        let json = serde_json::to_string_pretty(credential).context("serializing credential")?;
        write_atomic(&self.path, json.as_bytes()).await
    }

    /// Remove the stored credential. Returns whether there was one.
    pub async fn clear(&self) -> Result<bool> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed credential file");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

/// Write `data` to `path` atomically with 0600 permissions, creating the
/// parent directory if needed.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .context("credential path has no parent directory")?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, data)
        .await
        .context("writing temp credential file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .context("setting credential file permissions")?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("renaming temp credential file")?;

    debug!(path = %path.display(), "persisted credential");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(token: &str) -> StoredCredential {
        StoredCredential {
            refresh_token: token.into(),
            api_url: "https://api.example.com".into(),
            saved_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(dir.path().join("nested/credentials.json"));

        assert!(file.load().await.unwrap().is_none());
        file.save(&credential("rt_1")).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(credential("rt_1")));

        file.save(&credential("rt_2")).await.unwrap();
        assert_eq!(file.load().await.unwrap().unwrap().refresh_token, "rt_2");
    }

    #[tokio::test]
    async fn clear_removes_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let file = CredentialFile::new(dir.path().join("credentials.json"));
        file.save(&credential("rt")).await.unwrap();

        assert!(file.clear().await.unwrap());
        assert!(!file.path().exists());
        assert!(!file.clear().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        let err = CredentialFile::new(path).load().await.unwrap_err();
        assert!(format!("{err:#}").contains("parsing"), "got: {err:#}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        CredentialFile::new(path.clone())
            .save(&credential("rt"))
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[test]
    fn debug_hides_token() {
        let debug = format!("{:?}", credential("rt_secret"));
        assert!(!debug.contains("rt_secret"));
    }
}
