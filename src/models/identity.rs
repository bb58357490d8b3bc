//! Calling identity of an application requesting sdk loads.

use std::fmt;
use std::hash::{Hash, Hasher};

use tokio_util::sync::CancellationToken;

use crate::packages::PackageResolver;
use crate::{AppError, Result};

/// Number of uids reserved for each user profile.
pub const PER_USER_RANGE: u32 = 100_000;

/// First application id.
pub const FIRST_APPLICATION_UID: u32 = 10_000;

/// Last application id.
pub const LAST_APPLICATION_UID: u32 = 19_999;

/// First application id of the sandbox range.
pub const FIRST_SDK_SANDBOX_UID: u32 = 20_000;

/// Handle to the caller's own process.
///
/// `exited` is cancelled by whoever observes the caller process going away;
/// the coordinator watches it to run caller-death cleanup.
#[derive(Debug, Clone)]
pub struct ProcessToken {
    /// Operating-system process id of the caller.
    pub pid: u32,
    /// Fires once the caller process has exited.
    pub exited: CancellationToken,
}

impl ProcessToken {
    /// Token for a live process.
    #[must_use]
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            exited: CancellationToken::new(),
        }
    }

    /// Whether the process has already been reported dead.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }
}

/// Verified identity of a caller.
///
/// Two identities denote the same caller iff `uid` and `package_name` match;
/// the process token is carried for death observation and targeted kills only.
#[derive(Debug, Clone)]
pub struct CallingIdentity {
    uid: u32,
    package_name: String,
    process_token: Option<ProcessToken>,
}

impl CallingIdentity {
    /// Verify that `package_name` is installed for `uid` and build an identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CallerMismatch` if the package is unknown in the
    /// uid's user profile or is installed under a different uid.
    pub fn verify(resolver: &dyn PackageResolver, uid: u32, package_name: &str) -> Result<Self> {
        let user_id = uid / PER_USER_RANGE;
        let Some(package_uid) = resolver.package_uid(user_id, package_name) else {
            return Err(AppError::CallerMismatch(format!("{package_name} not found")));
        };

        if package_uid != uid {
            return Err(AppError::CallerMismatch(format!(
                "{package_name} does not belong to uid {uid}"
            )));
        }

        Ok(Self::new_unchecked(uid, package_name))
    }

    /// Build an identity without consulting a resolver.
    ///
    /// Intended for tests and for callers whose identity was verified upstream.
    #[must_use]
    pub fn new_unchecked(uid: u32, package_name: impl Into<String>) -> Self {
        Self {
            uid,
            package_name: package_name.into(),
            process_token: None,
        }
    }

    /// Attach the caller's process token.
    #[must_use]
    pub fn with_process_token(mut self, token: ProcessToken) -> Self {
        self.process_token = Some(token);
        self
    }

    /// Effective uid of the caller.
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Package name of the caller.
    #[must_use]
    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Caller process token, if one was supplied.
    #[must_use]
    pub fn process_token(&self) -> Option<&ProcessToken> {
        self.process_token.as_ref()
    }

    /// User profile the caller runs in.
    #[must_use]
    pub fn user_id(&self) -> u32 {
        self.uid / PER_USER_RANGE
    }

    /// Application id within the user profile.
    #[must_use]
    pub fn app_id(&self) -> u32 {
        self.uid % PER_USER_RANGE
    }

    /// Uid the caller's worker process runs as.
    ///
    /// Application ids are shifted into the sandbox range; any other uid is
    /// returned unchanged.
    #[must_use]
    pub fn sandbox_uid(&self) -> u32 {
        let app_id = self.app_id();
        if (FIRST_APPLICATION_UID..=LAST_APPLICATION_UID).contains(&app_id) {
            self.user_id() * PER_USER_RANGE
                + (app_id - FIRST_APPLICATION_UID + FIRST_SDK_SANDBOX_UID)
        } else {
            self.uid
        }
    }

    /// Name of the caller's worker process.
    #[must_use]
    pub fn sandbox_process_name(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.package_name)
    }
}

impl PartialEq for CallingIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid && self.package_name == other.package_name
    }
}

impl Eq for CallingIdentity {}

impl Hash for CallingIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uid.hash(state);
        self.package_name.hash(state);
    }
}

impl fmt::Display for CallingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallingIdentity{{uid: {}, package: {}}}", self.uid, self.package_name)
    }
}
