//! Repository names, references, and the object-key layout.
//!
//! Every persisted key is derived through these types:
//!
//! ```text
//! <repo>/manifests/<reference>    reference = tag or "sha256:<hex>"
//! <repo>/blobs/<digest>
//! <repo>/uploads/<upload-id>      upload state record
//! _scratch/<uuid>                 reconciler scratch objects
//! <upload-id>                     in-flight multipart staging key
//! ```

use crate::digest::Digest;
use crate::upload::UploadId;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Key prefix for reconciler scratch objects. The leading underscore keeps
/// it outside the repository-name grammar, so it can never collide with a
/// repository's keys.
pub const SCRATCH_PREFIX: &str = "_scratch";

/// Maximum length of a repository name, per the OCI distribution grammar.
const MAX_NAME_LEN: usize = 255;

/// Maximum length of a tag.
const MAX_TAG_LEN: usize = 128;

/// A validated, slash-separated repository name (e.g. `lib/app`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryName(String);

impl RepositoryName {
    /// Parse and validate a repository name.
    ///
    /// Components are lowercase alphanumerics separated by `.`, `_`, or `-`
    /// runs, joined with `/`.
    pub fn parse(name: &str) -> crate::Result<Self> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(crate::Error::InvalidRepositoryName(format!(
                "name length must be 1..={MAX_NAME_LEN}, got {}",
                name.len()
            )));
        }
        for component in name.split('/') {
            if component.is_empty() {
                return Err(crate::Error::InvalidRepositoryName(
                    "empty path component".to_string(),
                ));
            }
            let bytes = component.as_bytes();
            if !bytes[0].is_ascii_lowercase() && !bytes[0].is_ascii_digit() {
                return Err(crate::Error::InvalidRepositoryName(format!(
                    "component must start with [a-z0-9]: {component}"
                )));
            }
            if !bytes[bytes.len() - 1].is_ascii_lowercase()
                && !bytes[bytes.len() - 1].is_ascii_digit()
            {
                return Err(crate::Error::InvalidRepositoryName(format!(
                    "component must end with [a-z0-9]: {component}"
                )));
            }
            for c in component.chars() {
                if !matches!(c, 'a'..='z' | '0'..='9' | '.' | '_' | '-') {
                    return Err(crate::Error::InvalidRepositoryName(format!(
                        "invalid character {c:?} in component: {component}"
                    )));
                }
            }
        }
        Ok(Self(name.to_string()))
    }

    /// Get the name string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object key for a manifest stored under a reference.
    pub fn manifest_key(&self, reference: &Reference) -> String {
        format!("{}/manifests/{reference}", self.0)
    }

    /// Key prefix under which all of this repository's manifests live.
    pub fn manifest_prefix(&self) -> String {
        format!("{}/manifests/", self.0)
    }

    /// Object key for a blob stored under its digest.
    pub fn blob_key(&self, digest: &Digest) -> String {
        format!("{}/blobs/{digest}", self.0)
    }

    /// Key prefix under which all of this repository's blobs live.
    pub fn blob_prefix(&self) -> String {
        format!("{}/blobs/", self.0)
    }

    /// Object key for the authoritative upload-state record.
    pub fn upload_key(&self, id: &UploadId) -> String {
        format!("{}/uploads/{id}", self.0)
    }
}

impl fmt::Debug for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepositoryName({self})")
    }
}

impl fmt::Display for RepositoryName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for RepositoryName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RepositoryName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A manifest reference: either a tag or a digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    /// Parse a reference string. Anything starting with `sha256:` must be a
    /// well-formed digest; everything else is validated as a tag.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.starts_with("sha256:") {
            return Ok(Self::Digest(Digest::parse(s)?));
        }
        if s.is_empty() || s.len() > MAX_TAG_LEN {
            return Err(crate::Error::InvalidReference(format!(
                "tag length must be 1..={MAX_TAG_LEN}, got {}",
                s.len()
            )));
        }
        let first = s.as_bytes()[0];
        if !first.is_ascii_alphanumeric() && first != b'_' {
            return Err(crate::Error::InvalidReference(format!(
                "tag must start with [a-zA-Z0-9_]: {s}"
            )));
        }
        for c in s.chars() {
            if !matches!(c, 'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-') {
                return Err(crate::Error::InvalidReference(format!(
                    "invalid character {c:?} in tag: {s}"
                )));
            }
        }
        Ok(Self::Tag(s.to_string()))
    }

    /// Get the digest when the reference is one.
    pub fn as_digest(&self) -> Option<&Digest> {
        match self {
            Self::Digest(digest) => Some(digest),
            Self::Tag(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "{tag}"),
            Self::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// Key for a reconciler scratch object.
pub fn scratch_key(id: Uuid) -> String {
    format!("{SCRATCH_PREFIX}/{id}")
}
