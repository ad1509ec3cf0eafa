use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Overrides the location of the registry file.
pub const REGISTRY_CONFIG_ENV: &str = "KILN_REGISTRY_CONFIG";
/// Overrides the token stored in the registry file.
pub const REGISTRY_TOKEN_ENV: &str = "KILN_REGISTRY_TOKEN";

/// Where images are pulled from and pushed to.
///
/// On disk this is a small JSON document:
///
/// ```json
/// { "url": "https://registry.example.com", "auth_token": "..." }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl RemoteConfig {
    /// `url` without a scheme is taken as HTTPS.
    pub fn new(url: &str) -> Self {
        Self {
            url: normalize_url(url),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.auth_token = Some(token.to_owned());
        self
    }

    /// Replace the token with `KILN_REGISTRY_TOKEN` when it is set.
    #[must_use]
    pub fn with_env_token(self) -> Self {
        match std::env::var(REGISTRY_TOKEN_ENV) {
            Ok(token) if !token.is_empty() => self.with_token(&token),
            _ => self,
        }
    }

    /// Registry host and port, for log lines.
    pub fn host(&self) -> &str {
        let rest = self
            .url
            .split_once("://")
            .map_or(self.url.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }

    /// The registry file named by `KILN_REGISTRY_CONFIG`, or
    /// `~/.config/kiln/registry.json`. `Ok(None)` when there is no such file.
    pub fn discover() -> Result<Option<Self>, RemoteError> {
        let path = match std::env::var_os(REGISTRY_CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => match std::env::var_os("HOME") {
                Some(home) => PathBuf::from(home).join(".config/kiln/registry.json"),
                None => return Ok(None),
            },
        };
        Ok(Self::load_if_present(&path)?.map(Self::with_env_token))
    }

    pub fn load_if_present(path: &Path) -> Result<Option<Self>, RemoteError> {
        match std::fs::read(path) {
            Ok(bytes) => Self::from_json(path, &bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, RemoteError> {
        let bytes = std::fs::read(path)?;
        Self::from_json(path, &bytes)
    }

    fn from_json(path: &Path, bytes: &[u8]) -> Result<Self, RemoteError> {
        let raw: Self = serde_json::from_slice(bytes)
            .map_err(|e| RemoteError::Config(format!("{}: {e}", path.display())))?;
        if raw.url.trim().is_empty() {
            return Err(RemoteError::Config(format!("{}: empty registry url", path.display())));
        }
        Ok(Self {
            url: normalize_url(&raw.url),
            auth_token: raw.auth_token.filter(|t| !t.is_empty()),
        })
    }

    /// Write the file atomically. It holds a credential, so on unix it is
    /// readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<(), RemoteError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| RemoteError::Serialization(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(path).map_err(|e| RemoteError::Io(e.error))?;
        Ok(())
    }
}

fn normalize_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.contains("://") {
        url.to_owned()
    } else {
        format!("https://{url}")
    }
}
