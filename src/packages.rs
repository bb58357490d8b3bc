//! Installed-package lookup used for caller verification and sdk resolution.

use std::collections::HashMap;

use serde::Deserialize;

use crate::models::identity::{CallingIdentity, PER_USER_RANGE};
use crate::models::sdk::SdkProviderInfo;

/// Read-only view of the installed packages.
pub trait PackageResolver: Send + Sync {
    /// Uid `package` is installed under in `user_id`, if installed.
    fn package_uid(&self, user_id: u32, package: &str) -> Option<u32>;

    /// Resolve the provider of `sdk_name` among the caller's sdk dependencies.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason when the sdk is not a dependency of
    /// the caller or does not declare a provider class.
    fn resolve_sdk(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
    ) -> std::result::Result<SdkProviderInfo, String>;
}

/// Sdk dependency declared by a package.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SdkEntry {
    /// Sdk library name.
    pub name: String,
    /// Package declaring the sdk library; defaults to the sdk name.
    #[serde(default)]
    pub declaring_package: Option<String>,
    /// Provider entry point; absent means the sdk is unusable.
    #[serde(default)]
    pub provider_class: Option<String>,
}

/// Installed package and its sdk dependencies.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PackageEntry {
    /// Package name.
    pub package_name: String,
    /// Full uid (user id and app id).
    pub uid: u32,
    /// Sdk libraries the package depends on.
    #[serde(default)]
    pub sdks: Vec<SdkEntry>,
}

/// In-memory package table.
#[derive(Debug, Clone, Default)]
pub struct StaticPackageRegistry {
    packages: HashMap<(u32, String), PackageEntry>,
}

impl StaticPackageRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from configuration entries.
    #[must_use]
    pub fn from_entries(entries: &[PackageEntry]) -> Self {
        entries
            .iter()
            .cloned()
            .fold(Self::new(), |registry, entry| registry.with_package(entry))
    }

    /// Add or replace a package.
    #[must_use]
    pub fn with_package(mut self, entry: PackageEntry) -> Self {
        let key = (entry.uid / PER_USER_RANGE, entry.package_name.clone());
        self.packages.insert(key, entry);
        self
    }

    /// Convenience: install `package` under `uid` depending on `sdks`, each
    /// with a provider class.
    #[must_use]
    pub fn with_app(self, uid: u32, package: &str, sdks: &[&str]) -> Self {
        self.with_package(PackageEntry {
            package_name: package.to_owned(),
            uid,
            sdks: sdks
                .iter()
                .map(|name| SdkEntry {
                    name: (*name).to_owned(),
                    declaring_package: None,
                    provider_class: Some(format!("{name}.Provider")),
                })
                .collect(),
        })
    }
}

impl PackageResolver for StaticPackageRegistry {
    fn package_uid(&self, user_id: u32, package: &str) -> Option<u32> {
        self.packages
            .get(&(user_id, package.to_owned()))
            .map(|entry| entry.uid)
    }

    fn resolve_sdk(
        &self,
        caller: &CallingIdentity,
        sdk_name: &str,
    ) -> std::result::Result<SdkProviderInfo, String> {
        let not_found = || format!("{sdk_name} not found for loading");

        let entry = self
            .packages
            .get(&(caller.user_id(), caller.package_name().to_owned()))
            .ok_or_else(not_found)?;
        let sdk = entry
            .sdks
            .iter()
            .find(|sdk| sdk.name == sdk_name)
            .ok_or_else(not_found)?;

        match sdk.provider_class.as_deref() {
            Some(class) if !class.trim().is_empty() => Ok(SdkProviderInfo {
                sdk_name: sdk.name.clone(),
                declaring_package: sdk
                    .declaring_package
                    .clone()
                    .unwrap_or_else(|| sdk.name.clone()),
                provider_class: class.to_owned(),
            }),
            _ => Err(format!("{sdk_name} did not set a provider class")),
        }
    }
}
