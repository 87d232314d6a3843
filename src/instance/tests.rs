//! Unit tests for the lifecycle orchestrator.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use super::*;
use crate::channel::ConnectFailureKind;
use crate::test_support::{BackendCall, FakeClock, FakeGuest, GuestConnector, ScriptedBackend};

const A: &str = "aaaaaaaa-0000-4000-8000-000000000000";
const B: &str = "bbbbbbbb-0000-4000-8000-000000000000";

struct Harness {
    guest: FakeGuest,
    backend: ScriptedBackend,
    clock: Arc<FakeClock>,
    instance: Instance<ScriptedBackend, GuestConnector>,
}

fn harness_with(guest: FakeGuest, backend: ScriptedBackend) -> Harness {
    let clock = Arc::new(FakeClock::new());
    let instance = Instance::new(
        backend.clone(),
        InstanceHandle::new("i-1", "192.0.2.10"),
        guest.connector(),
        None,
        InstanceSettings::default(),
        clock.clone(),
    );
    Harness {
        guest,
        backend,
        clock,
        instance,
    }
}

#[fixture]
fn harness() -> Harness {
    harness_with(FakeGuest::new(), ScriptedBackend::new())
}

fn argv(words: &[&str]) -> Vec<String> {
    words.iter().map(|word| (*word).to_owned()).collect()
}

#[test]
fn restart_waits_for_a_new_boot_identity() {
    let guest = FakeGuest::new().with_boot_ids([A, A, A, A, B]);
    let backend = ScriptedBackend::new().rebooting(&guest);
    let mut h = harness_with(guest, backend);

    let report = h
        .instance
        .restart(true)
        .expect("restart succeeds")
        .expect("waited");

    assert_eq!(report.identity_polls, 4);
    assert_eq!(report.boot_id.as_str(), B);
    assert_eq!(h.instance.cached_boot_id().map(BootId::as_str), Some(B));
    assert_eq!(h.backend.count(BackendCall::Reboot), 1);
}

#[test]
fn restart_flushes_before_rebooting() {
    let guest = FakeGuest::new();
    let backend = ScriptedBackend::new().rebooting(&guest);
    let mut h = harness_with(guest, backend);

    let report = h.instance.restart(false).expect("restart requested");

    assert!(report.is_none());
    assert_eq!(h.guest.boot_id_reads(), 0);
    assert_eq!(h.guest.executed(), vec![argv(&["sh", "-c", "sync"])]);
    assert_eq!(h.backend.calls(), vec![BackendCall::Reboot]);
}

#[test]
fn restart_of_unreachable_guest_waits_as_for_a_fresh_boot() {
    let guest = FakeGuest::new().unreachable_for(1).with_boot_ids([A]);
    let backend = ScriptedBackend::new().rebooting(&guest);
    let mut h = harness_with(guest, backend);

    let report = h
        .instance
        .restart(true)
        .expect("restart succeeds")
        .expect("waited");

    assert_eq!(report.boot_id.as_str(), A);
    assert_eq!(report.identity_polls, 1);
}

#[test]
fn guest_initiated_reboot_tolerates_the_dropped_session() {
    let guest = FakeGuest::new().with_boot_ids([A, B]);
    let backend = ScriptedBackend::new().with_reboot(RebootRequest::Guest);
    let mut h = harness_with(guest, backend);

    let report = h
        .instance
        .restart(true)
        .expect("restart succeeds")
        .expect("waited");

    assert_eq!(report.boot_id.as_str(), B);
    assert!(
        h.guest
            .executed()
            .contains(&argv(&["sudo", "--", "shutdown", "-r", "now"]))
    );
}

#[test]
fn guest_reboot_that_never_reaches_the_guest_is_an_error() {
    let guest = FakeGuest::new().refusing(u32::MAX, ConnectFailureKind::Refused);
    let backend = ScriptedBackend::new().with_reboot(RebootRequest::Guest);
    let mut h = harness_with(guest, backend);

    let err = h.instance.restart(false).expect_err("reboot never issued");

    let InstanceError::Channel(ref channel) = err else {
        panic!("expected channel error, got {err:?}");
    };
    assert!(channel.is_unreachable());
    assert!(!channel.is_session_lost());
    assert!(!h.guest.ran("shutdown"));
}

#[test]
fn unreachable_guest_does_not_delay_the_reboot_request() {
    let guest = FakeGuest::new().refusing(u32::MAX, ConnectFailureKind::Refused);
    let backend = ScriptedBackend::new();
    let mut h = harness_with(guest, backend);

    let report = h.instance.restart(false).expect("reboot requested");

    assert!(report.is_none());
    assert_eq!(h.backend.count(BackendCall::Reboot), 1);
    assert_eq!(h.guest.connect_attempts(), 1);
    assert_eq!(h.clock.elapsed(), Duration::ZERO);
}

#[rstest]
fn delete_twice_makes_no_second_backend_call(mut harness: Harness) {
    harness.instance.delete(true).expect("first delete");
    let calls = harness.backend.call_count();

    harness.instance.delete(true).expect("second delete is a no-op");

    assert_eq!(harness.backend.call_count(), calls);
    assert_eq!(harness.backend.count(BackendCall::Delete), 1);
    assert!(harness.instance.is_terminal());
}

#[rstest]
fn terminal_instances_reject_other_operations(mut harness: Harness) {
    harness.instance.delete(false).expect("delete");

    let err = harness
        .instance
        .execute("true", None)
        .expect_err("instance is gone");

    assert!(matches!(err, InstanceError::Terminal { id } if id == "i-1"));
    assert!(matches!(
        harness.instance.start(false),
        Err(InstanceError::Terminal { .. })
    ));
    assert_eq!(harness.guest.connect_attempts(), 0);
}

#[test]
fn pending_delete_fails_under_fail_policy() {
    let backend = ScriptedBackend::new().delete_pending_for(u32::MAX);
    let mut h = harness_with(FakeGuest::new(), backend);

    let err = h.instance.delete(true).expect_err("delete never completes");

    assert!(matches!(
        err,
        InstanceError::Pending {
            operation: "delete",
            ..
        }
    ));
    assert!(h.instance.is_terminal());
    assert_eq!(h.clock.elapsed(), Duration::from_secs(600));
}

#[test]
fn pending_delete_only_warns_under_warn_policy() {
    let backend = ScriptedBackend::new()
        .delete_pending_for(u32::MAX)
        .with_delete_policy(PendingPolicy::Warn);
    let mut h = harness_with(FakeGuest::new(), backend);

    h.instance.delete(true).expect("warn policy tolerates pending delete");
    assert!(h.instance.is_terminal());
}

#[test]
fn rejected_delete_leaves_the_instance_live() {
    let backend = ScriptedBackend::new().failing("request_delete");
    let mut h = harness_with(FakeGuest::new(), backend);

    let err = h.instance.delete(true).expect_err("provider rejects");

    assert!(matches!(err, InstanceError::Backend { .. }));
    assert!(!h.instance.is_terminal());
}

#[test]
fn start_refreshes_the_address() {
    let backend = ScriptedBackend::new().with_address("198.51.100.7");
    let mut h = harness_with(FakeGuest::new(), backend);

    let report = h.instance.start(false).expect("start requested");

    assert!(report.is_none());
    assert_eq!(h.instance.handle().address, "198.51.100.7");
    assert_eq!(
        h.backend.calls(),
        vec![BackendCall::Start, BackendCall::ResolveAddress]
    );
}

#[test]
fn start_and_wait_tracks_power_state() {
    let backend = ScriptedBackend::new()
        .with_power_states([PowerState::Pending, PowerState::Pending, PowerState::Running]);
    let mut h = harness_with(FakeGuest::new().with_boot_ids([A]), backend);

    let report = h
        .instance
        .start(true)
        .expect("start succeeds")
        .expect("waited");

    assert_eq!(report.boot_id.as_str(), A);
    assert_eq!(h.instance.last_power_state(), Some(PowerState::Running));
    assert_eq!(h.backend.count(BackendCall::PowerState), 3);
}

#[test]
fn shutdown_polls_until_stopped() {
    let backend = ScriptedBackend::new().stop_pending_for(2);
    let mut h = harness_with(FakeGuest::new(), backend);

    h.instance.shutdown(true).expect("stops");

    assert_eq!(h.backend.count(BackendCall::IsStopped), 3);
    assert_eq!(h.clock.sleeps(), vec![Duration::from_secs(5); 2]);
}

#[test]
fn shutdown_that_never_completes_is_pending() {
    let backend = ScriptedBackend::new().stop_pending_for(u32::MAX);
    let mut h = harness_with(FakeGuest::new(), backend);

    let err = h.instance.shutdown(true).expect_err("never stops");

    assert!(err.to_string().contains("stop still pending"));
}

#[rstest]
fn get_boot_id_caches_the_value(mut harness: Harness) {
    let id = harness.instance.get_boot_id().expect("boot id");
    assert_eq!(harness.instance.cached_boot_id(), Some(&id));
}

#[rstest]
fn run_script_uses_a_fresh_temp_path_each_time(mut harness: Harness) {
    harness.instance.run_script("#!/bin/sh\necho one\n").expect("first");
    harness.instance.run_script("#!/bin/sh\necho two\n").expect("second");

    assert_eq!(
        harness.guest.file("/tmp/vigil-0000"),
        Some(b"#!/bin/sh\necho one\n".to_vec())
    );
    assert!(harness.guest.file("/tmp/vigil-0001").is_some());
}

#[rstest]
fn push_and_pull_preserve_bytes(mut harness: Harness) {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
    let local = root.join("payload.bin");
    let copy = root.join("copy.bin");
    let bytes = [0_u8, 1, 2, 255, b'\n', b'\'', b'"'];
    std::fs::write(&local, bytes).expect("write payload");

    harness
        .instance
        .push_file(&local, "/srv/payload.bin")
        .expect("push");
    harness
        .instance
        .pull_file("/srv/payload.bin", &copy)
        .expect("pull");

    assert_eq!(harness.guest.file("/srv/payload.bin"), Some(bytes.to_vec()));
    assert_eq!(std::fs::read(&copy).expect("read copy"), bytes.to_vec());
}

#[test]
fn short_writes_fail_the_integrity_check() {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");
    let local = root.join("payload.txt");
    std::fs::write(&local, "hello").expect("write payload");
    let mut h = harness_with(FakeGuest::new().with_short_writes(), ScriptedBackend::new());

    let err = h
        .instance
        .push_file(&local, "/tmp/payload.txt")
        .expect_err("size mismatch");

    assert!(matches!(err, InstanceError::Transfer { .. }));
    assert!(err.to_string().contains("expected 5"));
}

#[rstest]
fn pulling_a_missing_file_is_an_error(mut harness: Harness) {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf-8 temp dir");

    let err = harness
        .instance
        .pull_file("/nonexistent", &root.join("out"))
        .expect_err("missing file");

    assert!(err.to_string().contains("No such file"));
    assert!(!root.join("out").exists());
}

#[rstest]
fn package_helpers_run_apt_noninteractively(mut harness: Harness) {
    harness.instance.install(&["jq", "curl"]).expect("install");
    harness.instance.update().expect("update");

    let executed = harness.guest.executed();
    let apt = |args: &[&str]| {
        let mut full = argv(&["sudo", "--", "env", "DEBIAN_FRONTEND=noninteractive", "apt-get"]);
        full.extend(argv(args));
        full
    };
    assert_eq!(
        executed,
        vec![
            apt(&["update"]),
            apt(&["install", "--yes", "jq", "curl"]),
            apt(&["update"]),
            apt(&["--yes", "upgrade"]),
        ]
    );
}

#[rstest]
fn clean_resets_cloud_init(mut harness: Harness) {
    let outcome = harness.instance.clean().expect("clean");

    assert!(outcome.ok());
    assert_eq!(
        harness.guest.executed(),
        vec![
            argv(&["sudo", "--", "cloud-init", "clean", "--logs"]),
            argv(&["sudo", "--", "rm", "-f", "/var/log/syslog"]),
        ]
    );
}
