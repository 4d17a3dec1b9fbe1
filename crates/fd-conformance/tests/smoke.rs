use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fd_conformance::{
    run_demo_conformance, run_dispatch_conformance, run_profiling_conformance, run_smoke,
    run_unbox_error_conformance, HarnessConfig,
};
use fd_core::{make_tensor_cpu, DispatchKey};
use fd_dispatch::{DispatchError, Dispatcher, Kernel, OperatorName};
use fd_value::Value;

#[test]
fn smoke_report_finds_every_fixture() {
    let config = HarnessConfig::default_paths();
    let report = run_smoke(&config);
    assert_eq!(report.suite, "smoke");
    assert_eq!(report.cases_total, 2);
    assert_eq!(report.fixture_count, 2);
    assert!(config.fixture_root.join("dispatch_cases.json").exists());
}

#[test]
fn dispatch_fixture_routes_every_case() {
    let config = HarnessConfig::default_paths();
    let (report, cases) =
        run_dispatch_conformance(&config).expect("dispatch conformance should run");

    assert_eq!(report.suite, "dispatch_matrix");
    assert_eq!(report.cases_total, cases.len());
    assert_eq!(report.cases_total, report.cases_passed);
    for case in &cases {
        assert!(case.passed(), "case '{}' failed routing", case.name);
        assert_eq!(case.forensic_log.outcome, "pass");
    }
}

#[test]
fn error_fixture_fails_closed() {
    let config = HarnessConfig::default_paths();
    let (report, cases) =
        run_unbox_error_conformance(&config).expect("error conformance should run");

    assert_eq!(report.suite, "unbox_errors");
    assert_eq!(report.cases_total, report.cases_passed);
    for case in &cases {
        assert!(case.kind_ok, "case '{}' observed the wrong error kind", case.name);
        assert!(
            case.message_ok,
            "case '{}' observed the wrong error message",
            case.name
        );
    }
}

#[test]
fn profiling_suite_accounts_for_calls() {
    let (report, cases) = run_profiling_conformance().expect("profiling conformance should run");
    assert_eq!(report.suite, "call_statistics");
    assert_eq!(report.cases_total, report.cases_passed);
    assert!(cases.iter().any(|case| case.name == "wrapper_redispatch_accounts_twice"));
}

#[test]
fn demo_suite_routes_every_operator() {
    let (report, cases) = run_demo_conformance().expect("demo conformance should run");
    assert_eq!(report.suite, "demo_operators");
    assert_eq!(report.cases_total, 5);
    assert_eq!(report.cases_passed, 5);
    for case in &cases {
        assert_eq!(case.forensic_log.reason_code, "demo_routing_ok");
    }
}

#[test]
fn register_call_deregister_round_trip() {
    let dispatcher = Dispatcher::new();
    let name = OperatorName::new("op_x");

    let handle = dispatcher.register_operator(name.clone());
    handle.set_kernel(
        DispatchKey::CatchAll,
        Kernel::from_unboxed(|value: i64| value * 2),
    );

    let out = dispatcher
        .call(&name, &[Value::Int(21)])
        .expect("registered operator should dispatch");
    assert_eq!(out[0].to_int(), Ok(42));

    assert!(dispatcher.deregister_operator(&name));
    let err = dispatcher
        .call(&name, &[])
        .expect_err("deregistered operator must be unknown");
    assert_eq!(
        err,
        DispatchError::UnknownOperator {
            name: "op_x".to_string(),
        }
    );
}

#[test]
fn callbacks_observe_registration_lifecycle() {
    let dispatcher = Dispatcher::new();
    let events = Arc::new(AtomicUsize::new(0));
    let counter = events.clone();
    dispatcher.add_registration_callback(Arc::new(move |_name: &OperatorName, _registered| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));

    let name = OperatorName::new("observed");
    dispatcher.register_operator(name.clone());
    dispatcher.register_operator(name.clone());
    dispatcher.deregister_operator(&name);

    assert_eq!(events.load(Ordering::Relaxed), 2);
}

#[test]
fn handle_debug_string_is_stable_across_the_public_api() {
    let dispatcher = Dispatcher::new();
    let handle = dispatcher.register_operator(OperatorName::new("add"));
    handle.set_kernel(
        DispatchKey::CPU,
        Kernel::from_unboxed(|lhs: fd_core::TensorHandle, _rhs: fd_core::TensorHandle| {
            make_tensor_cpu(lhs.sizes().to_vec())
        }),
    );
    handle.set_kernel(DispatchKey::CatchAll, Kernel::from_unboxed(|| ()));

    assert_eq!(
        handle.debug_string(),
        "OperatorHandle(add) { CPU: registered; CatchAll: registered }"
    );
}
