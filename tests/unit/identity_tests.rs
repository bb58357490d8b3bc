//! Caller verification and uid arithmetic.

use std::collections::HashSet;

use sdk_sandbox_broker::models::identity::{CallingIdentity, ProcessToken};
use sdk_sandbox_broker::packages::StaticPackageRegistry;
use sdk_sandbox_broker::ErrorCode;

fn registry() -> StaticPackageRegistry {
    StaticPackageRegistry::new()
        .with_app(10_123, "com.example.app", &["sdk.alpha"])
        .with_app(1_010_123, "com.example.work", &[])
}

#[test]
fn verify_accepts_matching_uid() {
    let id = CallingIdentity::verify(&registry(), 10_123, "com.example.app").expect("verified");
    assert_eq!(id.uid(), 10_123);
    assert_eq!(id.package_name(), "com.example.app");
    assert!(id.process_token().is_none());
}

#[test]
fn verify_rejects_unknown_package() {
    let err = CallingIdentity::verify(&registry(), 10_123, "com.example.ghost").expect_err("unknown");
    assert_eq!(err.code(), ErrorCode::CallerMismatch);
}

#[test]
fn verify_rejects_foreign_uid() {
    let err = CallingIdentity::verify(&registry(), 10_999, "com.example.app").expect_err("foreign");
    assert_eq!(err.code(), ErrorCode::CallerMismatch);
}

#[test]
fn verify_is_scoped_to_the_user_profile() {
    // Installed for user 10 only.
    assert!(CallingIdentity::verify(&registry(), 1_010_123, "com.example.work").is_ok());
    assert!(CallingIdentity::verify(&registry(), 10_123, "com.example.work").is_err());
}

#[test]
fn identity_equality_ignores_process_token() {
    let plain = CallingIdentity::new_unchecked(10_123, "com.example.app");
    let with_token = plain.clone().with_process_token(ProcessToken::new(7));
    assert_eq!(plain, with_token);

    let set: HashSet<_> = [plain, with_token].into_iter().collect();
    assert_eq!(set.len(), 1);
    assert_ne!(
        CallingIdentity::new_unchecked(10_123, "com.example.app"),
        CallingIdentity::new_unchecked(10_124, "com.example.app")
    );
}

#[test]
fn app_uids_map_into_the_sandbox_range() {
    let id = CallingIdentity::new_unchecked(1_010_123, "com.example.app");
    assert_eq!(id.user_id(), 10);
    assert_eq!(id.app_id(), 10_123);
    assert_eq!(id.sandbox_uid(), 1_020_123);
}

#[test]
fn non_app_uids_are_unchanged() {
    let system = CallingIdentity::new_unchecked(1_000, "android");
    assert_eq!(system.sandbox_uid(), 1_000);
}

#[test]
fn process_name_appends_suffix() {
    let id = CallingIdentity::new_unchecked(10_123, "com.example.app");
    assert_eq!(id.sandbox_process_name("_sdk_sandbox"), "com.example.app_sdk_sandbox");
}

#[test]
fn process_token_reports_exit() {
    let token = ProcessToken::new(99);
    assert!(!token.has_exited());
    token.exited.cancel();
    assert!(token.has_exited());
}
