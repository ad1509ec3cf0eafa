use crate::RemoteError;
use kiln_schema::Digest;
use std::fmt;

/// An image reference: `repository[:tag]` or `repository@sha256:<hex>`.
///
/// Repositories are interpreted relative to the transport they are used
/// with; a configured registry URL supplies the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, RemoteError> {
        let invalid = || RemoteError::InvalidReference(reference.to_owned());
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid());
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest).map_err(|_| invalid())?)),
            None => (reference, None),
        };

        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(name[split + 1..].to_owned()))
            }
            None => (name, None),
        };

        let valid_repo = !repository.is_empty()
            && repository.split('/').all(|part| {
                !part.is_empty()
                    && part != "."
                    && part != ".."
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || b"._-:".contains(&b))
            });
        let valid_tag = tag.as_deref().is_none_or(|t| {
            !t.is_empty()
                && t.len() <= 128
                && t.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b))
        });
        if !valid_repo || !valid_tag {
            return Err(invalid());
        }

        Ok(Self {
            repository: repository.to_owned(),
            tag,
            digest,
        })
    }

    /// The manifest reference: the digest if pinned, else the tag, else `latest`.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(d), _) => d.to_string(),
            (None, Some(t)) => t.clone(),
            (None, None) => "latest".to_owned(),
        }
    }

    /// Same repository with a different tag, digest cleared.
    #[must_use]
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: Some(tag.to_owned()),
            digest: None,
        }
    }

    /// Same repository pinned to `digest`.
    #[must_use]
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.digest, &self.tag) {
            (Some(d), _) => write!(f, "{}@{d}", self.repository),
            (None, Some(t)) => write!(f, "{}:{t}", self.repository),
            (None, None) => write!(f, "{}:latest", self.repository),
        }
    }
}

impl std::str::FromStr for ImageRef {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
