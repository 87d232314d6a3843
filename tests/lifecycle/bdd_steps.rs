//! BDD step definitions for instance lifecycle behaviour.

use std::sync::Arc;

use rstest_bdd_macros::{given, then, when};
use tempfile::TempDir;
use vigil::test_support::BackendCall;

use super::test_helpers::{
    FailureKind, LifecycleContext, LifecycleResult, build_instance, failure, write_encrypted_key,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a ready guest")]
fn ready_guest(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context
}

#[given("a guest whose boot identity reads \"{ids}\"")]
fn guest_with_boot_ids(mut lifecycle_context: LifecycleContext, ids: String) -> LifecycleContext {
    lifecycle_context.guest = lifecycle_context
        .guest
        .with_boot_ids(ids.split(',').map(str::trim));
    lifecycle_context
}

#[given("the backend reboots the guest")]
fn backend_reboots_guest(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.backend = lifecycle_context
        .backend
        .rebooting(&lifecycle_context.guest);
    lifecycle_context
}

#[given("a guest whose cloud-init cannot wait for completion")]
fn guest_without_status_wait(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.guest = lifecycle_context.guest.without_status_wait();
    lifecycle_context
}

#[given("an encrypted private key and no agent")]
fn encrypted_key_without_agent(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temporary key dir: {err}"));
    lifecycle_context.key = Some(Arc::new(write_encrypted_key(&dir)));
    lifecycle_context.key_dir = Some(Arc::new(dir));
    lifecycle_context
}

#[when("I restart the instance and wait")]
fn restart_and_wait(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    let mut instance = build_instance(&lifecycle_context);
    lifecycle_context.outcome = Some(match instance.restart(true) {
        Ok(report) => LifecycleResult::Success(report),
        Err(err) => failure(&err),
    });
    lifecycle_context
}

#[when("I wait for the instance")]
fn wait_for_instance(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    let mut instance = build_instance(&lifecycle_context);
    lifecycle_context.outcome = Some(match instance.wait() {
        Ok(report) => LifecycleResult::Success(Some(report)),
        Err(err) => failure(&err),
    });
    lifecycle_context
}

#[when("I delete the instance twice")]
fn delete_twice(mut lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let mut instance = build_instance(&lifecycle_context);
    instance
        .delete(true)
        .map_err(|err| StepError::Assertion(format!("first delete failed: {err}")))?;
    let calls_after_first = lifecycle_context.backend.call_count();
    let second = instance.delete(true);
    if lifecycle_context.backend.call_count() != calls_after_first {
        return Err(StepError::Assertion(String::from(
            "second delete reached the backend",
        )));
    }
    lifecycle_context.outcome = Some(match second {
        Ok(()) => LifecycleResult::Success(None),
        Err(err) => failure(&err),
    });
    Ok(lifecycle_context)
}

#[when("I delete the instance and run \"{command}\"")]
fn delete_then_run(mut lifecycle_context: LifecycleContext, command: String) -> LifecycleContext {
    let mut instance = build_instance(&lifecycle_context);
    let result = instance
        .delete(true)
        .and_then(|()| instance.execute(command.as_str(), None));
    lifecycle_context.outcome = Some(match result {
        Ok(_) => LifecycleResult::Success(None),
        Err(err) => failure(&err),
    });
    lifecycle_context
}

#[when("I run \"{command}\" on the instance")]
fn run_command(mut lifecycle_context: LifecycleContext, command: String) -> LifecycleContext {
    let mut instance = build_instance(&lifecycle_context);
    lifecycle_context.outcome = Some(match instance.execute(command.as_str(), None) {
        Ok(_) => LifecycleResult::Success(None),
        Err(err) => failure(&err),
    });
    lifecycle_context
}

#[then("the lifecycle succeeds")]
fn lifecycle_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    match &lifecycle_context.outcome {
        Some(LifecycleResult::Success(_)) => Ok(()),
        Some(LifecycleResult::Failure(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the lifecycle fails with error kind \"{kind}\"")]
fn lifecycle_fails(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    let expected = match kind.as_str() {
        "encrypted key" => FailureKind::EncryptedKey,
        "terminal" => FailureKind::Terminal,
        "timeout" => FailureKind::Timeout,
        other => {
            return Err(StepError::Assertion(format!("unknown failure kind {other}")));
        }
    };
    let Some(LifecycleResult::Failure(failure)) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )))
    }
}

#[then("the boot identity was read \"{count}\" times while waiting")]
fn identity_polls(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let Some(LifecycleResult::Success(Some(report))) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected a readiness report",
        )));
    };
    if report.identity_polls == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} identity polls, got {}",
            report.identity_polls
        )))
    }
}

#[then("the reported boot identity is \"{id}\"")]
fn reported_boot_id(lifecycle_context: &LifecycleContext, id: String) -> Result<(), StepError> {
    let Some(LifecycleResult::Success(Some(report))) = &lifecycle_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected a readiness report",
        )));
    };
    if report.boot_id.as_str() == id {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected boot identity {id}, got {}",
            report.boot_id
        )))
    }
}

#[then("the backend received \"{count}\" delete request")]
fn delete_requests(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let actual = lifecycle_context.backend.count(BackendCall::Delete);
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} delete requests, got {actual}"
        )))
    }
}

#[then("the guest saw \"{count}\" connection attempts")]
fn connection_attempts(lifecycle_context: &LifecycleContext, count: u32) -> Result<(), StepError> {
    let actual = lifecycle_context.guest.connect_attempts();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} connection attempts, got {actual}"
        )))
    }
}

#[then("the guest ran the fallback readiness loop")]
fn fallback_loop_ran(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let guest = &lifecycle_context.guest;
    if !guest.ran("/run/cloud-init/result.json") {
        return Err(StepError::Assertion(String::from(
            "fallback loop was not executed",
        )));
    }
    if guest.ran("--wait") {
        return Err(StepError::Assertion(String::from(
            "cloud-init status --wait should not run without support",
        )));
    }
    Ok(())
}
