//! BDD scenarios for the instance lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Restart waits for a new boot identity"
)]
fn scenario_restart_new_boot(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Deleting twice contacts the backend once"
)]
fn scenario_delete_twice(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Deleted instances refuse commands"
)]
fn scenario_deleted_refuses(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Encrypted key without an agent fails before connecting"
)]
fn scenario_encrypted_key(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "First boot falls back when cloud-init cannot wait"
)]
fn scenario_first_boot_fallback(lifecycle_context: LifecycleContext) {
    drop(lifecycle_context);
}
