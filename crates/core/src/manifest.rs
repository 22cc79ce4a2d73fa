//! Image manifest parsing.
//!
//! The manifest is treated as an opaque document: parsing yields the typed
//! shape plus the set of digests it references, which is all the engine needs
//! for layer verification and garbage collection.

use crate::digest::Digest;
use serde::Deserialize;

#[derive(Deserialize)]
struct RawDescriptor {
    digest: String,
}

#[derive(Deserialize)]
struct RawFsLayer {
    #[serde(rename = "blobSum")]
    blob_sum: String,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    config: Option<RawDescriptor>,
    #[serde(default)]
    layers: Option<Vec<RawDescriptor>>,
    #[serde(default)]
    manifests: Option<Vec<RawDescriptor>>,
    #[serde(default, rename = "fsLayers")]
    fs_layers: Option<Vec<RawFsLayer>>,
}

/// A parsed image manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageManifest {
    /// Schema 1: a flat list of layer blob sums.
    V1 { fs_layers: Vec<Digest> },
    /// Schema 2: a config blob plus ordered layers.
    V2 { config: Digest, layers: Vec<Digest> },
    /// A manifest list / image index referencing child manifests.
    Index { manifests: Vec<Digest> },
}

impl ImageManifest {
    /// Parse manifest bytes into the typed shape.
    ///
    /// The variant is decided by which reference lists are present, not by
    /// the media type, so schema-violating documents fail here rather than
    /// downstream.
    pub fn parse(bytes: &[u8]) -> crate::Result<Self> {
        let raw: RawManifest = serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::Manifest(format!("invalid JSON: {e}")))?;

        if let Some(manifests) = raw.manifests {
            let manifests = parse_digests(manifests)?;
            if manifests.is_empty() {
                return Err(crate::Error::Manifest(
                    "index references no manifests".to_string(),
                ));
            }
            return Ok(Self::Index { manifests });
        }

        if let (Some(config), Some(layers)) = (raw.config, raw.layers) {
            let config = Digest::parse(&config.digest)
                .map_err(|e| crate::Error::Manifest(e.to_string()))?;
            return Ok(Self::V2 {
                config,
                layers: parse_digests(layers)?,
            });
        }

        if let Some(fs_layers) = raw.fs_layers {
            let fs_layers = fs_layers
                .into_iter()
                .map(|l| {
                    Digest::parse(&l.blob_sum).map_err(|e| crate::Error::Manifest(e.to_string()))
                })
                .collect::<crate::Result<Vec<_>>>()?;
            return Ok(Self::V1 { fs_layers });
        }

        Err(crate::Error::Manifest(
            "document matches no known manifest schema".to_string(),
        ))
    }

    /// Whether this is a manifest list / index.
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index { .. })
    }

    /// Blob digests this manifest references directly (empty for an index).
    pub fn referenced_blobs(&self) -> Vec<Digest> {
        match self {
            Self::V1 { fs_layers } => fs_layers.clone(),
            Self::V2 { config, layers } => {
                let mut digests = Vec::with_capacity(layers.len() + 1);
                digests.extend_from_slice(layers);
                digests.push(*config);
                digests
            }
            Self::Index { .. } => Vec::new(),
        }
    }

    /// Child manifest digests (empty unless this is an index).
    pub fn referenced_manifests(&self) -> &[Digest] {
        match self {
            Self::Index { manifests } => manifests,
            _ => &[],
        }
    }
}

fn parse_digests(descriptors: Vec<RawDescriptor>) -> crate::Result<Vec<Digest>> {
    descriptors
        .into_iter()
        .map(|d| Digest::parse(&d.digest).map_err(|e| crate::Error::Manifest(e.to_string())))
        .collect()
}
