#![forbid(unsafe_code)]

mod logging;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use fd_core::{
    make_tensor_cpu, make_tensor_cuda, DispatchKey, GlobalDispatchState, TensorHandle,
};
use fd_dispatch::{
    compute_dispatch_key_set, DispatchError, Dispatcher, Kernel, OperatorName,
};
use fd_kernels::register_demo_operators;
use fd_value::Value;
use serde::de::DeserializeOwned;
use serde::Deserialize;

pub use logging::{flags_label, StructuredCaseLog};

/// Suites that mutate the process-wide dispatch flags serialize on this
/// lock and restore the baseline before releasing it.
static FLAGS_GUARD: Mutex<()> = Mutex::new(());

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        Self {
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub suite: &'static str,
    pub fixture_count: usize,
    pub cases_total: usize,
    pub cases_passed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCaseReport {
    pub name: String,
    pub trace_ok: bool,
    pub backend_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl DispatchCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.trace_ok && self.backend_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCaseReport {
    pub name: String,
    pub kind_ok: bool,
    pub message_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ErrorCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.kind_ok && self.message_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilingCaseReport {
    pub name: String,
    pub stats_ok: bool,
    pub debug_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl ProfilingCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.stats_ok && self.debug_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoCaseReport {
    pub name: String,
    pub routed_ok: bool,
    pub forensic_log: StructuredCaseLog,
}

impl DemoCaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.routed_ok
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchFixtureFile {
    cases: Vec<DispatchCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct DispatchCase {
    name: String,
    backend: String,
    #[serde(default)]
    requires_grad: bool,
    #[serde(default)]
    global_autograd: bool,
    #[serde(default)]
    global_tracing: bool,
    #[serde(default)]
    global_profiling: bool,
    expected_trace: Vec<String>,
    expected_result_backend: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorFixtureFile {
    cases: Vec<ErrorCase>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorCase {
    name: String,
    operator: String,
    #[serde(default)]
    deregister: bool,
    args: Vec<String>,
    expected_kind: String,
    expected_fragment: String,
}

fn load_fixture<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let raw = fs::read_to_string(path)
        .map_err(|error| format!("failed to read fixture {}: {error}", path.display()))?;
    serde_json::from_str(&raw)
        .map_err(|error| format!("failed to parse fixture {}: {error}", path.display()))
}

fn key_from_label(label: &str) -> Result<DispatchKey, String> {
    match label {
        "CPU" => Ok(DispatchKey::CPU),
        "CUDA" => Ok(DispatchKey::CUDA),
        "Autograd" => Ok(DispatchKey::Autograd),
        "Tracing" => Ok(DispatchKey::Tracing),
        "Profiling" => Ok(DispatchKey::Profiling),
        "CatchAll" => Ok(DispatchKey::CatchAll),
        "Undefined" => Ok(DispatchKey::Undefined),
        other => Err(format!("unknown dispatch key label '{other}'")),
    }
}

fn argument_from_label(label: &str) -> Result<Value, String> {
    match label {
        "tensor_cpu" => Ok(Value::Tensor(make_tensor_cpu(vec![2, 2]))),
        "tensor_cuda" => Ok(Value::Tensor(make_tensor_cuda(vec![2, 2]))),
        "double" => Ok(Value::Double(3.14)),
        "int" => Ok(Value::Int(7)),
        "bool" => Ok(Value::Bool(true)),
        other => Err(format!("unknown argument label '{other}'")),
    }
}

pub type KeyTrace = Arc<Mutex<Vec<DispatchKey>>>;

fn record(trace: &KeyTrace, key: DispatchKey) {
    trace
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(key);
}

fn recorded(trace: &KeyTrace) -> Vec<DispatchKey> {
    trace
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn backend_tensor(backend: DispatchKey, sizes: Vec<i64>) -> TensorHandle {
    match backend {
        DispatchKey::CUDA => make_tensor_cuda(sizes),
        _ => make_tensor_cpu(sizes),
    }
}

/// Registers an `add` operator whose kernels record the selected key:
/// CPU/CUDA terminals plus the three functionality wrappers, each
/// redispatching with the strictly-lower-priority remainder of the set.
pub fn install_instrumented_add(dispatcher: &Arc<Dispatcher>, trace: &KeyTrace) {
    let name = OperatorName::new("add");
    let handle = dispatcher.register_operator(name.clone());

    for backend in [DispatchKey::CPU, DispatchKey::CUDA] {
        let trace = trace.clone();
        handle.set_kernel(
            backend,
            Kernel::from_boxed(move |args| {
                record(&trace, backend);
                let lhs = args
                    .first()
                    .ok_or(DispatchError::ArityMismatch {
                        expected: 2,
                        observed: 0,
                    })?
                    .to_tensor()?;
                Ok(vec![Value::Tensor(backend_tensor(
                    backend,
                    lhs.sizes().to_vec(),
                ))])
            }),
        );
    }

    for key in [
        DispatchKey::Autograd,
        DispatchKey::Tracing,
        DispatchKey::Profiling,
    ] {
        let trace = trace.clone();
        let dispatcher = dispatcher.clone();
        let name = name.clone();
        handle.set_kernel(
            key,
            Kernel::from_boxed(move |args| {
                record(&trace, key);
                let keyset = compute_dispatch_key_set(args).lower_priority_than(key);
                dispatcher.call_with_keys(&name, keyset, args)
            }),
        );
    }
}

fn apply_global_flags(case: &DispatchCase) {
    let state = GlobalDispatchState::instance();
    state.set_autograd_enabled(case.global_autograd);
    state.set_tracing_enabled(case.global_tracing);
    state.set_profiling_enabled(case.global_profiling);
}

fn run_dispatch_case(case: &DispatchCase) -> Result<DispatchCaseReport, String> {
    let backend = key_from_label(&case.backend)?;
    let expected_backend = key_from_label(&case.expected_result_backend)?;
    let expected_trace = case
        .expected_trace
        .iter()
        .map(|label| key_from_label(label))
        .collect::<Result<Vec<_>, _>>()?;

    let dispatcher = Arc::new(Dispatcher::new());
    let trace: KeyTrace = Arc::new(Mutex::new(Vec::new()));
    install_instrumented_add(&dispatcher, &trace);

    let lhs = backend_tensor(backend, vec![2, 3]);
    let rhs = backend_tensor(backend, vec![2, 3]);
    if case.requires_grad {
        lhs.set_requires_grad(true);
    }

    apply_global_flags(case);
    let outcome = dispatcher.call(
        &OperatorName::new("add"),
        &[Value::Tensor(lhs), Value::Tensor(rhs)],
    );
    GlobalDispatchState::instance().reset();

    let out = outcome.map_err(|error| format!("case '{}' failed to dispatch: {error}", case.name))?;
    let trace_ok = recorded(&trace) == expected_trace;
    let backend_ok = out
        .first()
        .and_then(|value| value.to_tensor().ok())
        .is_some_and(|tensor| tensor.backend_key() == expected_backend);

    let passed = trace_ok && backend_ok;
    let scenario = flags_label(case.global_autograd, case.global_tracing, case.global_profiling);
    Ok(DispatchCaseReport {
        name: case.name.clone(),
        trace_ok,
        backend_ok,
        forensic_log: StructuredCaseLog::new(
            "dispatch_matrix",
            "dispatch_cases.json",
            "FD-P1-003",
            case.name.as_str(),
            format!("dispatch_matrix/{scenario}:{}", case.name),
            vec!["crates/fd-conformance/fixtures/dispatch_cases.json".to_string()],
            "cargo test -p fd-conformance dispatch_fixture_routes_every_case -- --nocapture"
                .to_string(),
            if passed { "pass" } else { "fail" },
            if passed { "routing_ok" } else { "routing_mismatch" },
        ),
    })
}

/// Routing matrix: for each fixture case, an instrumented `add` operator
/// must be reached in exactly the expected wrapper-then-backend order.
pub fn run_dispatch_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<DispatchCaseReport>), String> {
    let fixture: DispatchFixtureFile =
        load_fixture(&config.fixture_root.join("dispatch_cases.json"))?;

    let _guard = FLAGS_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let mut reports = Vec::new();
    for case in &fixture.cases {
        reports.push(run_dispatch_case(case)?);
    }
    GlobalDispatchState::instance().reset();

    let cases_passed = reports.iter().filter(|report| report.passed()).count();
    Ok((
        HarnessReport {
            suite: "dispatch_matrix",
            fixture_count: 1,
            cases_total: reports.len(),
            cases_passed,
        },
        reports,
    ))
}

fn scale_native(lhs: TensorHandle, _rhs: TensorHandle) -> TensorHandle {
    make_tensor_cpu(lhs.sizes().to_vec())
}

fn install_error_probe_operators(dispatcher: &Arc<Dispatcher>) {
    let scale = dispatcher.register_operator(OperatorName::new("scale"));
    scale.set_kernel(DispatchKey::CPU, Kernel::from_unboxed(scale_native));

    let cuda_only = dispatcher.register_operator(OperatorName::new("cuda_only"));
    cuda_only.set_kernel(DispatchKey::CUDA, Kernel::from_unboxed(scale_native));

    let probe = dispatcher.register_operator(OperatorName::new("probe"));
    probe.set_kernel(DispatchKey::CatchAll, Kernel::from_unboxed(|| ()));
}

fn run_error_case(case: &ErrorCase) -> Result<ErrorCaseReport, String> {
    let dispatcher = Arc::new(Dispatcher::new());
    install_error_probe_operators(&dispatcher);
    if case.deregister {
        dispatcher.deregister_operator(&OperatorName::parse(&case.operator));
    }

    let args = case
        .args
        .iter()
        .map(|label| argument_from_label(label))
        .collect::<Result<Vec<_>, _>>()?;

    let err = match dispatcher.call_by_name(&case.operator, &args) {
        Ok(_) => {
            return Err(format!(
                "case '{}' expected a {} failure but the call succeeded",
                case.name, case.expected_kind
            ))
        }
        Err(err) => err,
    };

    let kind_ok = err.kind() == case.expected_kind;
    let message_ok = err.to_string().contains(&case.expected_fragment);
    let passed = kind_ok && message_ok;
    Ok(ErrorCaseReport {
        name: case.name.clone(),
        kind_ok,
        message_ok,
        forensic_log: StructuredCaseLog::new(
            "unbox_errors",
            "unbox_error_cases.json",
            "FD-P1-004",
            case.name.as_str(),
            format!("unbox_errors/baseline:{}", case.name),
            vec!["crates/fd-conformance/fixtures/unbox_error_cases.json".to_string()],
            "cargo test -p fd-conformance error_fixture_fails_closed -- --nocapture".to_string(),
            if passed { "pass" } else { "fail" },
            if passed {
                "error_contract_ok"
            } else {
                "error_contract_mismatch"
            },
        ),
    })
}

/// Error matrix: arity, type, unknown-operator and no-kernel failures
/// must surface with the expected kind and message fragment.
pub fn run_unbox_error_conformance(
    config: &HarnessConfig,
) -> Result<(HarnessReport, Vec<ErrorCaseReport>), String> {
    let fixture: ErrorFixtureFile =
        load_fixture(&config.fixture_root.join("unbox_error_cases.json"))?;

    let _guard = FLAGS_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let mut reports = Vec::new();
    for case in &fixture.cases {
        reports.push(run_error_case(case)?);
    }

    let cases_passed = reports.iter().filter(|report| report.passed()).count();
    Ok((
        HarnessReport {
            suite: "unbox_errors",
            fixture_count: 1,
            cases_total: reports.len(),
            cases_passed,
        },
        reports,
    ))
}

fn profiling_log(case_id: &str, passed: bool) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "call_statistics",
        "none",
        "FD-P1-005",
        case_id,
        format!("call_statistics/baseline:{case_id}"),
        Vec::new(),
        "cargo test -p fd-conformance profiling_suite_accounts_for_calls -- --nocapture"
            .to_string(),
        if passed { "pass" } else { "fail" },
        if passed {
            "statistics_ok"
        } else {
            "statistics_mismatch"
        },
    )
}

/// Statistics suite: counters move only on successful calls, wrapper
/// redispatch accounts one entry per dispatcher-level call, and the
/// debug dump renders the counts.
pub fn run_profiling_conformance() -> Result<(HarnessReport, Vec<ProfilingCaseReport>), String> {
    let _guard = FLAGS_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let mut reports = Vec::new();

    {
        let dispatcher = Arc::new(Dispatcher::new());
        let trace: KeyTrace = Arc::new(Mutex::new(Vec::new()));
        install_instrumented_add(&dispatcher, &trace);
        dispatcher.enable_profiling(true);

        let args = vec![
            Value::Tensor(make_tensor_cpu(vec![2])),
            Value::Tensor(make_tensor_cpu(vec![2])),
        ];
        for _ in 0..3 {
            dispatcher
                .call(&OperatorName::new("add"), &args)
                .map_err(|error| format!("profiled call failed: {error}"))?;
        }

        let stats = dispatcher.call_statistics();
        let stats_ok = stats
            .get(&OperatorName::new("add"))
            .is_some_and(|entry| {
                entry.call_count == 3 && entry.key_counts.get(&DispatchKey::CPU) == Some(&3)
            });
        let dump = dispatcher.debug_string();
        let debug_ok = dump.contains("add: 3 calls") && dump.contains("CPU: 3 times");
        let passed = stats_ok && debug_ok;
        reports.push(ProfilingCaseReport {
            name: "three_backend_calls".to_string(),
            stats_ok,
            debug_ok,
            forensic_log: profiling_log("three_backend_calls", passed),
        });
    }

    {
        let dispatcher = Arc::new(Dispatcher::new());
        let trace: KeyTrace = Arc::new(Mutex::new(Vec::new()));
        install_instrumented_add(&dispatcher, &trace);
        dispatcher.enable_profiling(true);

        let lhs = make_tensor_cpu(vec![2]);
        lhs.set_requires_grad(true);
        let args = vec![Value::Tensor(lhs), Value::Tensor(make_tensor_cpu(vec![2]))];
        dispatcher
            .call(&OperatorName::new("add"), &args)
            .map_err(|error| format!("wrapper-profiled call failed: {error}"))?;

        let stats = dispatcher.call_statistics();
        let stats_ok = stats
            .get(&OperatorName::new("add"))
            .is_some_and(|entry| {
                entry.call_count == 2
                    && entry.key_counts.get(&DispatchKey::Autograd) == Some(&1)
                    && entry.key_counts.get(&DispatchKey::CPU) == Some(&1)
            });
        let debug_ok = dispatcher.debug_string().contains("add: 2 calls");
        let passed = stats_ok && debug_ok;
        reports.push(ProfilingCaseReport {
            name: "wrapper_redispatch_accounts_twice".to_string(),
            stats_ok,
            debug_ok,
            forensic_log: profiling_log("wrapper_redispatch_accounts_twice", passed),
        });
    }

    {
        let dispatcher = Arc::new(Dispatcher::new());
        let trace: KeyTrace = Arc::new(Mutex::new(Vec::new()));
        install_instrumented_add(&dispatcher, &trace);
        dispatcher.enable_profiling(true);

        let _ = dispatcher.call(&OperatorName::new("add"), &[]);
        let _ = dispatcher.call(&OperatorName::new("missing"), &[]);
        dispatcher
            .call(
                &OperatorName::new("add"),
                &[
                    Value::Tensor(make_tensor_cpu(vec![2])),
                    Value::Tensor(make_tensor_cpu(vec![2])),
                ],
            )
            .map_err(|error| format!("recovery call failed: {error}"))?;

        let stats = dispatcher.call_statistics();
        let stats_ok = stats
            .get(&OperatorName::new("add"))
            .is_some_and(|entry| entry.call_count == 1)
            && !stats.contains_key(&OperatorName::new("missing"));
        let passed = stats_ok;
        reports.push(ProfilingCaseReport {
            name: "failures_leave_counters_unchanged".to_string(),
            stats_ok,
            debug_ok: true,
            forensic_log: profiling_log("failures_leave_counters_unchanged", passed),
        });
    }

    let cases_passed = reports.iter().filter(|report| report.passed()).count();
    Ok((
        HarnessReport {
            suite: "call_statistics",
            fixture_count: 0,
            cases_total: reports.len(),
            cases_passed,
        },
        reports,
    ))
}

fn demo_log(case_id: &str, passed: bool) -> StructuredCaseLog {
    StructuredCaseLog::new(
        "demo_operators",
        "none",
        "FD-P1-006",
        case_id,
        format!("demo_operators/baseline:{case_id}"),
        Vec::new(),
        "cargo test -p fd-conformance demo_suite_routes_every_operator -- --nocapture".to_string(),
        if passed { "pass" } else { "fail" },
        if passed { "demo_routing_ok" } else { "demo_routing_mismatch" },
    )
}

/// Demo-operator suite: the stock operator set must route end to end.
pub fn run_demo_conformance() -> Result<(HarnessReport, Vec<DemoCaseReport>), String> {
    let _guard = FLAGS_GUARD.lock().unwrap_or_else(PoisonError::into_inner);
    let dispatcher = Arc::new(Dispatcher::new());
    register_demo_operators(&dispatcher);
    let mut reports = Vec::new();

    let cuda_pair = dispatcher
        .call_by_name(
            "add",
            &[
                Value::Tensor(make_tensor_cuda(vec![3, 4])),
                Value::Tensor(make_tensor_cuda(vec![3, 4])),
            ],
        )
        .map_err(|error| format!("demo add failed: {error}"))?;
    let routed_ok = cuda_pair
        .first()
        .and_then(|value| value.to_tensor().ok())
        .is_some_and(|tensor| tensor.is_cuda());
    reports.push(DemoCaseReport {
        name: "add_routes_to_cuda".to_string(),
        routed_ok,
        forensic_log: demo_log("add_routes_to_cuda", routed_ok),
    });

    let grad_pair = {
        let lhs = make_tensor_cpu(vec![2, 2]);
        lhs.set_requires_grad(true);
        dispatcher
            .call_by_name(
                "add",
                &[Value::Tensor(lhs), Value::Tensor(make_tensor_cpu(vec![2, 2]))],
            )
            .map_err(|error| format!("demo autograd add failed: {error}"))?
    };
    let routed_ok = grad_pair
        .first()
        .and_then(|value| value.to_tensor().ok())
        .is_some_and(|tensor| tensor.is_cpu());
    reports.push(DemoCaseReport {
        name: "add_wrapper_chain_reaches_cpu".to_string(),
        routed_ok,
        forensic_log: demo_log("add_wrapper_chain_reaches_cpu", routed_ok),
    });

    let scalar = dispatcher
        .call_by_name("add.scalar", &[Value::Double(3.0), Value::Double(0.5)])
        .map_err(|error| format!("demo scalar add failed: {error}"))?;
    let routed_ok = scalar.first().is_some_and(|value| value.to_double() == Ok(3.5));
    reports.push(DemoCaseReport {
        name: "scalar_overload_uses_catch_all".to_string(),
        routed_ok,
        forensic_log: demo_log("scalar_overload_uses_catch_all", routed_ok),
    });

    let rank = dispatcher
        .call_by_name(
            "tensor_rank",
            &[Value::Tensor(make_tensor_cuda(vec![2, 3, 4]))],
        )
        .map_err(|error| format!("demo tensor_rank failed: {error}"))?;
    let routed_ok = rank.first().is_some_and(|value| value.to_int() == Ok(3));
    reports.push(DemoCaseReport {
        name: "tensor_rank_is_backend_independent".to_string(),
        routed_ok,
        forensic_log: demo_log("tensor_rank_is_backend_independent", routed_ok),
    });

    let cleared = {
        let tensor = make_tensor_cpu(vec![2]);
        tensor.set_requires_grad(true);
        let out = dispatcher
            .call_by_name("clear_grad", &[Value::Tensor(tensor.clone())])
            .map_err(|error| format!("demo clear_grad failed: {error}"))?;
        out.is_empty() && !tensor.requires_grad()
    };
    reports.push(DemoCaseReport {
        name: "clear_grad_returns_empty_list".to_string(),
        routed_ok: cleared,
        forensic_log: demo_log("clear_grad_returns_empty_list", cleared),
    });

    let cases_passed = reports.iter().filter(|report| report.passed()).count();
    Ok((
        HarnessReport {
            suite: "demo_operators",
            fixture_count: 0,
            cases_total: reports.len(),
            cases_passed,
        },
        reports,
    ))
}

/// Fixture presence probe, run first by the matrix binary.
#[must_use]
pub fn run_smoke(config: &HarnessConfig) -> HarnessReport {
    let fixtures = ["dispatch_cases.json", "unbox_error_cases.json"];
    let fixture_count = fixtures
        .iter()
        .filter(|name| config.fixture_root.join(name).exists())
        .count();
    HarnessReport {
        suite: "smoke",
        fixture_count,
        cases_total: fixtures.len(),
        cases_passed: fixture_count,
    }
}
