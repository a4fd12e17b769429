//! P1 Policy Enforcement Tests
//!
//! Apply Calico policies in a fresh namespace and assert the connectivity
//! each one should produce, using canary pods as sources and an echo server
//! as the target.

#![cfg(feature = "policy")]

use netpol_tests::canary::CanarySpec;
use netpol_tests::context::{SuiteContext, TestNamespace};
use netpol_tests::echo::EchoServer;
use netpol_tests::matrix::{run_matrix, Scenario};
use netpol_tests::Reachability;
use serial_test::serial;

fn context() -> SuiteContext {
    common::telemetry::init_test_tracing();
    SuiteContext::from_env().expect("Suite configuration should be valid")
}

async fn setup(ctx: &SuiteContext) -> (TestNamespace, EchoServer) {
    let ns = ctx
        .create_namespace()
        .await
        .expect("Test namespace should be created");
    let echo = ctx
        .deploy_echo_server(&ns.name, &[("app", "server")])
        .await
        .expect("Echo server should become ready");
    (ns, echo)
}

fn default_deny(namespace: &str) -> String {
    format!(
        r#"apiVersion: projectcalico.org/v3
kind: NetworkPolicy
metadata:
  name: default-deny
  namespace: {namespace}
spec:
  selector: all()
  types:
  - Ingress
"#
    )
}

fn allow_from_client(namespace: &str) -> String {
    format!(
        r#"apiVersion: projectcalico.org/v3
kind: NetworkPolicy
metadata:
  name: allow-client
  namespace: {namespace}
spec:
  order: 100
  selector: app == 'server'
  types:
  - Ingress
  ingress:
  - action: Allow
    protocol: TCP
    source:
      selector: role == 'client'
    destination:
      ports:
      - 8080
"#
    )
}

fn global_deny_egress(namespace: &str) -> String {
    format!(
        r#"apiVersion: projectcalico.org/v3
kind: GlobalNetworkPolicy
metadata:
  name: netpol-e2e-deny-egress-{namespace}
spec:
  order: 10
  selector: quarantine == 'true' && projectcalico.org/namespace == '{namespace}'
  types:
  - Egress
  egress:
  - action: Deny
"#
    )
}

/// Unlabelled canaries are denied, labelled canaries get through without
/// address translation.
#[tokio::test]
#[serial]
async fn test_namespace_policy_matrix() {
    let ctx = context();
    let (ns, echo) = setup(&ctx).await;

    ctx.policy()
        .apply(&default_deny(&ns.name))
        .await
        .expect("default-deny should apply");
    ctx.policy()
        .apply(&allow_from_client(&ns.name))
        .await
        .expect("allow-client should apply");

    let target = echo.target();
    let scenarios = vec![
        Scenario::new(
            "client role allowed",
            CanarySpec::new(&ns.name).with_label("role", "client"),
            &target,
            Reachability::ReachableNoTranslation,
        ),
        Scenario::new(
            "unlabelled denied",
            CanarySpec::new(&ns.name),
            &target,
            Reachability::Unreachable,
        ),
        Scenario::new(
            "other role denied",
            CanarySpec::new(&ns.name).with_label("role", "batch"),
            &target,
            Reachability::Unreachable,
        ),
    ];

    let report = run_matrix(&ctx.probe(), &scenarios).await;

    for name in ["allow-client", "default-deny"] {
        if let Err(e) = ctx.policy().delete("networkpolicy", name, Some(ns.name.as_str())).await {
            eprintln!("Failed to delete policy {}: {}", name, e);
        }
    }
    ns.teardown(&ctx).await;

    if let Err(failure) = report.into_result() {
        panic!("{}", failure);
    }
}

/// Removing a policy restores connectivity; the probe's retry budget absorbs
/// the programming delay.
#[tokio::test]
#[serial]
async fn test_policy_removal_restores_connectivity() {
    let ctx = context();
    let (ns, echo) = setup(&ctx).await;
    let probe = ctx.probe();

    ctx.policy()
        .apply(&default_deny(&ns.name))
        .await
        .expect("default-deny should apply");

    let denied = probe
        .expect(CanarySpec::new(&ns.name), &echo.target(), Reachability::Unreachable)
        .await;

    ctx.policy()
        .delete("networkpolicy", "default-deny", Some(ns.name.as_str()))
        .await
        .expect("default-deny should be deleted");

    let restored = probe
        .expect(
            CanarySpec::new(&ns.name),
            &echo.target(),
            Reachability::ReachableNoTranslation,
        )
        .await;

    ns.teardown(&ctx).await;

    if let Err(e) = denied {
        panic!("while default-deny applied: {}", e);
    }
    if let Err(e) = restored {
        panic!("after default-deny removed: {}", e);
    }
}

/// A global egress deny only affects pods it selects.
#[tokio::test]
#[serial]
async fn test_global_policy_selects_by_label() {
    let ctx = context();
    let (ns, echo) = setup(&ctx).await;
    let policy_name = format!("netpol-e2e-deny-egress-{}", ns.name);

    ctx.policy()
        .apply(&global_deny_egress(&ns.name))
        .await
        .expect("global deny should apply");

    let target = echo.target();
    let scenarios = vec![
        Scenario::new(
            "quarantined denied",
            CanarySpec::new(&ns.name).with_label("quarantine", "true"),
            &target,
            Reachability::Unreachable,
        ),
        Scenario::new(
            "unquarantined allowed",
            CanarySpec::new(&ns.name).with_label("quarantine", "false"),
            &target,
            Reachability::ReachableNoTranslation,
        ),
    ];

    let report = run_matrix(&ctx.probe(), &scenarios).await;

    if let Err(e) = ctx.policy().delete("globalnetworkpolicy", &policy_name, None).await {
        eprintln!("Failed to delete global policy {}: {}", policy_name, e);
    }
    ns.teardown(&ctx).await;

    if let Err(failure) = report.into_result() {
        panic!("{}", failure);
    }
}
