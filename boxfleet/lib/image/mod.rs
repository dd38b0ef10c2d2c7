//! Local image store: unpacked images ready to stage into sandboxes.
//!
//! An image lives under `<store>/<sanitized-ref>/` as an unpacked `rootfs/`
//! tree plus a `manifest.json` describing how to run it. Populating the
//! store (pulling and unpacking) happens out of band; the reconciler only
//! ever reads it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    utils::{self, IMAGE_MANIFEST_FILENAME, ROOTFS_SUBDIR},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Runtime-relevant facts about an image, stored as `manifest.json` next to
/// its unpacked root filesystem.
#[derive(Debug, Default, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct ImageManifest {
    /// The image entrypoint.
    #[serde(default)]
    #[builder(default)]
    entrypoint: Vec<String>,

    /// The default command, appended to the entrypoint.
    #[serde(default)]
    #[builder(default)]
    cmd: Vec<String>,

    /// Environment variables the image expects, as `VAR=VALUE` strings.
    #[serde(default)]
    #[builder(default)]
    env: Vec<String>,

    /// The working directory the process starts in.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    working_dir: Option<String>,
}

/// An image resolved to local disk.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PreparedImage {
    /// The image's runtime manifest.
    manifest: ImageManifest,

    /// The unpacked root filesystem inside the store.
    rootfs_dir: PathBuf,
}

/// A source of ready-to-run images.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Makes `reference` available locally and returns its manifest and the
    /// path of its unpacked root filesystem.
    async fn prepare(&self, reference: &str) -> BoxfleetResult<PreparedImage>;
}

/// The file-system backed image store.
#[derive(Debug, Clone)]
pub struct NativeImageStore {
    store_dir: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageManifest {
    /// The argv this image runs when the box spec supplies no command.
    pub fn default_args(&self) -> Vec<String> {
        self.entrypoint.iter().chain(self.cmd.iter()).cloned().collect()
    }
}

impl NativeImageStore {
    /// Creates a store rooted at the given directory.
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
        }
    }

    /// The directory a reference resolves to inside the store.
    pub fn image_dir(&self, reference: &str) -> PathBuf {
        self.store_dir.join(sanitize_reference(reference))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies an image's root filesystem into a sandbox, preserving ownership,
/// permissions, symlinks and device nodes.
pub async fn stage_rootfs(source: &Path, dest: &Path) -> BoxfleetResult<()> {
    tokio::fs::create_dir_all(dest).await?;
    let source_contents = format!("{}/.", source.to_string_lossy());
    utils::run("cp", &["-a", &source_contents, &dest.to_string_lossy()]).await
}

/// Maps an image reference onto a single path component.
fn sanitize_reference(reference: &str) -> String {
    reference
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ImageProvider for NativeImageStore {
    async fn prepare(&self, reference: &str) -> BoxfleetResult<PreparedImage> {
        let image_dir = self.image_dir(reference);
        let manifest_path = image_dir.join(IMAGE_MANIFEST_FILENAME);
        let rootfs_dir = image_dir.join(ROOTFS_SUBDIR);

        let contents = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(BoxfleetError::ImageNotFound(reference.to_string()));
            }
            Err(error) => return Err(error.into()),
        };
        if !rootfs_dir.is_dir() {
            return Err(BoxfleetError::ImageNotFound(reference.to_string()));
        }

        let manifest = serde_json::from_str(&contents)?;
        Ok(PreparedImage {
            manifest,
            rootfs_dir,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
