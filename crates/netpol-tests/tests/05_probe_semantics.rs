//! Probe Semantics
//!
//! Exercises the connectivity probe's retry and classification rules
//! against a scripted cluster. These run without any feature flag and
//! without a cluster.

use netpol_tests::canary::CanarySpec;
use netpol_tests::mock::{exec_echo, exec_raw, exec_refused, MockCluster};
use netpol_tests::reachability::FailureReason;
use netpol_tests::shell::PodOs;
use netpol_tests::{ConnectivityProbe, PodRef, ProbeError, ProbeOptions, Reachability};
use std::sync::Arc;
use std::time::Duration;

const TARGET: &str = "10.0.0.5:80";
const SOURCE_IP: &str = "10.0.1.7";

fn source_pod() -> PodRef {
    PodRef {
        namespace: "netpol-e2e-semantics".to_string(),
        name: "client-0".to_string(),
        container: None,
        ip: SOURCE_IP.to_string(),
        host_network: false,
        os: PodOs::Linux,
        sidecar: None,
    }
}

fn probe_with(cluster: &Arc<MockCluster>) -> ConnectivityProbe {
    common::telemetry::init_test_tracing();
    ConnectivityProbe::new(
        cluster.clone(),
        ProbeOptions::default()
            .with_budget(Duration::from_millis(200))
            .with_interval(Duration::from_millis(10)),
    )
}

fn failure_reason(err: &ProbeError) -> FailureReason {
    err.failure()
        .unwrap_or_else(|| panic!("expected a connectivity verdict, got: {}", err))
        .reason
        .clone()
}

#[tokio::test]
async fn test_unreachable_passes_when_every_attempt_fails() {
    let cluster = Arc::new(MockCluster::new().with_exec_script(vec![exec_refused()]));

    let report = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::Unreachable)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(report.attempts, 2);
    assert_eq!(cluster.exec_count(), 2);
    assert!(!report.verdict.success);
    assert_eq!(report.last_mismatch, None);
}

#[tokio::test]
async fn test_unreachable_fails_when_refusal_was_transient() {
    let cluster = Arc::new(
        MockCluster::new().with_exec_script(vec![exec_refused(), exec_echo(SOURCE_IP)]),
    );

    let err = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::Unreachable)
        .await
        .expect_err("an open path must not pass as unreachable");

    assert_eq!(failure_reason(&err), FailureReason::UnexpectedlySucceeded);
    assert!(err.to_string().contains("Connection unexpectedly succeeded"));
}

#[tokio::test]
async fn test_unreachable_retries_until_deny_is_programmed() {
    let cluster = Arc::new(MockCluster::new().with_exec_script(vec![
        exec_echo(SOURCE_IP),
        exec_echo(SOURCE_IP),
        exec_refused(),
    ]));

    let report = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::Unreachable)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(report.attempts, 3);
    assert_eq!(report.last_mismatch, Some(FailureReason::UnexpectedlySucceeded));
}

#[tokio::test]
async fn test_windows_pod_is_probed_with_powershell() {
    let cluster = Arc::new(MockCluster::new().with_pod_os(PodOs::Windows));
    let source = PodRef::lookup(cluster.as_ref(), "netpol-e2e-semantics", "iis-0")
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    probe_with(&cluster)
        .expect(source, TARGET, Reachability::Unreachable)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    let calls = cluster.exec_calls();
    assert!(calls
        .iter()
        .all(|c| c.argv.first().map(String::as_str) == Some("powershell.exe")));
}

#[tokio::test]
async fn test_reachable_passes_after_transient_failures() {
    let cluster = Arc::new(MockCluster::new().with_exec_script(vec![
        exec_refused(),
        exec_refused(),
        exec_echo(SOURCE_IP),
    ]));

    let report = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::ReachableNoTranslation)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(report.attempts, 3);
    assert_eq!(report.verdict.observed_source_ip.as_deref(), Some(SOURCE_IP));
}

#[tokio::test]
async fn test_persistent_source_ip_mismatch_fails_after_budget() {
    let cluster = Arc::new(MockCluster::new().with_exec_script(vec![exec_echo("10.0.9.9")]));

    let err = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::ReachableNoTranslation)
        .await
        .expect_err("mismatched source IP must fail");

    assert_eq!(
        failure_reason(&err),
        FailureReason::IncorrectSourceIp {
            observed: "10.0.9.9".to_string(),
            expected: SOURCE_IP.to_string(),
        }
    );
    assert!(err.to_string().contains("the server saw incorrect source IP"));

    let failure = err.failure().expect("verdict failure");
    assert!(failure.elapsed >= Duration::from_millis(200));
    assert!(cluster.exec_count() > 2, "mismatch should be retried");
}

#[tokio::test]
async fn test_translation_skips_source_ip_check() {
    let cluster = Arc::new(MockCluster::new().with_exec_script(vec![exec_echo("192.168.99.1")]));

    let report = probe_with(&cluster)
        .expect(source_pod(), TARGET, Reachability::ReachableWithTranslation)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    assert_eq!(report.attempts, 1);
    assert_eq!(report.verdict.observed_source_ip.as_deref(), Some("192.168.99.1"));
}

#[tokio::test]
async fn test_malformed_output_fails_every_expectation() {
    for expect in [
        Reachability::Unreachable,
        Reachability::ReachableNoTranslation,
        Reachability::ReachableWithTranslation,
    ] {
        let cluster = Arc::new(
            MockCluster::new().with_exec_script(vec![exec_raw("garbage-no-equals-sign")]),
        );

        let err = probe_with(&cluster)
            .expect(source_pod(), TARGET, expect)
            .await
            .expect_err("malformed output must not satisfy any expectation");

        assert!(
            matches!(failure_reason(&err), FailureReason::UnexpectedStdoutFormat { .. }),
            "{}: {}",
            expect,
            err
        );
        assert!(err.to_string().contains("unexpected stdout format"));
        assert!(cluster.exec_count() >= 2);
    }
}

#[tokio::test]
async fn test_verdict_is_stable_for_static_state() {
    for _ in 0..3 {
        let cluster = Arc::new(MockCluster::new().with_exec_script(vec![exec_echo("10.0.9.9")]));
        let result = probe_with(&cluster)
            .expect(source_pod(), TARGET, Reachability::ReachableNoTranslation)
            .await;
        assert!(result.is_err());
    }
}

#[tokio::test]
async fn test_canary_source_is_created_and_removed() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_pod_ip(SOURCE_IP)
            .with_exec_script(vec![exec_echo(SOURCE_IP)]),
    );
    let spec = CanarySpec::new("netpol-e2e-semantics")
        .with_label("app", "client")
        .on_node("worker-1");

    let report = probe_with(&cluster)
        .expect(spec, TARGET, Reachability::ReachableNoTranslation)
        .await
        .unwrap_or_else(|e| panic!("{}", e));

    let created = cluster.created_pods();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["metadata"]["labels"]["app"], "client");
    assert_eq!(cluster.deleted_pods(), vec![report.source_pod]);
}
