//! Per-caller sdk data directories.
//!
//! Directory layout under the configured root:
//!
//! ```text
//! <root>/ce/<user_id>/<package>/<sdk>
//! <root>/de/<user_id>/<package>/<sdk>
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::identity::CallingIdentity;
use crate::models::sdk::StorageDirs;
use crate::sandbox::BoxFuture;
use crate::{AppError, Result};

/// Provisions data directories before a worker starts and before an sdk loads.
pub trait StorageDirProvider: Send + Sync {
    /// Prepare the caller's package-level directories.
    ///
    /// Called before the caller's worker is started; a worker started without
    /// them cannot mount its data mirror.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on file-system failure.
    fn prepare(&self, caller: &CallingIdentity) -> BoxFuture<'_, Result<()>>;

    /// Directories for one sdk, created if missing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on file-system failure and `AppError::Internal`
    /// for an sdk name that is not a single path component.
    fn sdk_storage_dirs(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
    ) -> BoxFuture<'_, Result<StorageDirs>>;
}

/// File-system backed [`StorageDirProvider`].
#[derive(Debug, Clone)]
pub struct FsStorageProvider {
    root: PathBuf,
}

impl FsStorageProvider {
    /// Provider rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn package_dirs(&self, caller: &CallingIdentity) -> (PathBuf, PathBuf) {
        let user = caller.user_id().to_string();
        let ce = self.root.join("ce").join(&user).join(caller.package_name());
        let de = self.root.join("de").join(&user).join(caller.package_name());
        (ce, de)
    }
}

fn validate_component(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(AppError::Internal(format!("invalid sdk name for storage: {name:?}")));
    }
    Ok(())
}

impl StorageDirProvider for FsStorageProvider {
    fn prepare(&self, caller: &CallingIdentity) -> BoxFuture<'_, Result<()>> {
        let (ce, de) = self.package_dirs(caller);
        Box::pin(async move {
            tokio::fs::create_dir_all(&ce).await?;
            tokio::fs::create_dir_all(&de).await?;
            debug!(ce = %ce.display(), de = %de.display(), "prepared caller storage");
            Ok(())
        })
    }

    fn sdk_storage_dirs(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
    ) -> BoxFuture<'_, Result<StorageDirs>> {
        let (ce_base, de_base) = self.package_dirs(caller);
        let sdk_name = sdk_name.to_owned();
        Box::pin(async move {
            validate_component(&sdk_name)?;
            let dirs = StorageDirs {
                ce: ce_base.join(&sdk_name),
                de: de_base.join(&sdk_name),
            };
            tokio::fs::create_dir_all(&dirs.ce).await?;
            tokio::fs::create_dir_all(&dirs.de).await?;
            Ok(dirs)
        })
    }
}
