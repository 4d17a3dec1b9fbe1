#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use fd_core::{DispatchKey, DispatchKeySet, GlobalDispatchState, TensorHandle};
use fd_value::{Value, ValueError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    UnknownOperator { name: String },
    NoKernel { op: String, keyset: String },
    InvalidKernel,
    ArityMismatch { expected: usize, observed: usize },
    Type(ValueError),
}

impl DispatchError {
    /// Stable machine-readable label, used by conformance fixtures.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownOperator { .. } => "unknown_operator",
            Self::NoKernel { .. } => "no_kernel",
            Self::InvalidKernel => "invalid_kernel",
            Self::ArityMismatch { .. } => "arity_mismatch",
            Self::Type(_) => "type_mismatch",
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOperator { name } => {
                write!(f, "operator '{name}' is not registered")
            }
            Self::NoKernel { op, keyset } => {
                write!(
                    f,
                    "no kernel found for operator '{op}' with dispatch key set {keyset}"
                )
            }
            Self::InvalidKernel => {
                write!(f, "attempted to invoke an uninitialized kernel")
            }
            Self::ArityMismatch { expected, observed } => {
                write!(
                    f,
                    "argument count mismatch: expected {expected}, observed {observed}"
                )
            }
            Self::Type(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<ValueError> for DispatchError {
    fn from(value: ValueError) -> Self {
        Self::Type(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorName {
    base: String,
    overload: String,
}

impl OperatorName {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            overload: String::new(),
        }
    }

    pub fn with_overload(base: impl Into<String>, overload: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            overload: overload.into(),
        }
    }

    /// Splits a full name on the first `.`; `"add.scalar"` names the
    /// `scalar` overload of `add`.
    #[must_use]
    pub fn parse(full: &str) -> Self {
        match full.split_once('.') {
            Some((base, overload)) if !overload.is_empty() => Self::with_overload(base, overload),
            _ => Self::new(full),
        }
    }

    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn overload_name(&self) -> &str {
        &self.overload
    }

    #[must_use]
    pub fn full_name(&self) -> String {
        if self.overload.is_empty() {
            self.base.clone()
        } else {
            format!("{}.{}", self.base, self.overload)
        }
    }
}

impl fmt::Display for OperatorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.overload.is_empty() {
            f.write_str(&self.base)
        } else {
            write!(f, "{}.{}", self.base, self.overload)
        }
    }
}

impl From<&str> for OperatorName {
    fn from(full: &str) -> Self {
        Self::parse(full)
    }
}

type BoxedFn = dyn Fn(&[Value]) -> Result<Vec<Value>, DispatchError> + Send + Sync;

/// Extraction of one positional parameter from a boxed argument.
pub trait UnboxValue: Sized {
    fn unbox(value: &Value) -> Result<Self, ValueError>;
}

impl UnboxValue for TensorHandle {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_tensor()
    }
}

impl UnboxValue for f64 {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_double()
    }
}

impl UnboxValue for i64 {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_int()
    }
}

impl UnboxValue for bool {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_bool()
    }
}

impl UnboxValue for String {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_string()
    }
}

impl UnboxValue for Vec<i64> {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_int_list()
    }
}

impl UnboxValue for Vec<f64> {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_double_list()
    }
}

impl UnboxValue for Vec<TensorHandle> {
    fn unbox(value: &Value) -> Result<Self, ValueError> {
        value.to_tensor_list()
    }
}

/// Wrapping of a native return value into the boxed return list. A unit
/// return maps to the empty list, everything else to one element.
pub trait BoxReturn {
    fn into_values(self) -> Vec<Value>;
}

impl BoxReturn for () {
    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }
}

impl BoxReturn for Value {
    fn into_values(self) -> Vec<Value> {
        vec![self]
    }
}

impl BoxReturn for TensorHandle {
    fn into_values(self) -> Vec<Value> {
        vec![Value::Tensor(self)]
    }
}

impl BoxReturn for f64 {
    fn into_values(self) -> Vec<Value> {
        vec![Value::Double(self)]
    }
}

impl BoxReturn for i64 {
    fn into_values(self) -> Vec<Value> {
        vec![Value::Int(self)]
    }
}

impl BoxReturn for bool {
    fn into_values(self) -> Vec<Value> {
        vec![Value::Bool(self)]
    }
}

impl BoxReturn for String {
    fn into_values(self) -> Vec<Value> {
        vec![Value::String(self)]
    }
}

impl BoxReturn for Vec<i64> {
    fn into_values(self) -> Vec<Value> {
        vec![Value::IntList(self)]
    }
}

impl BoxReturn for Vec<f64> {
    fn into_values(self) -> Vec<Value> {
        vec![Value::DoubleList(self)]
    }
}

impl BoxReturn for Vec<TensorHandle> {
    fn into_values(self) -> Vec<Value> {
        vec![Value::TensorList(self)]
    }
}

/// A natively typed callable adapted to the boxed calling convention.
/// The argument count is checked against the native arity first, then
/// each positional parameter is extracted in order. A parameter or
/// return type outside the supported set has no impl, so registration
/// of such a kernel does not compile.
pub trait UnboxedKernel<Args>: Send + Sync {
    fn arity(&self) -> usize;

    fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError>;
}

macro_rules! impl_unboxed_kernel {
    ($count:expr $(, ($index:expr, $ty:ident, $var:ident))*) => {
        impl<Fun, Ret $(, $ty)*> UnboxedKernel<($($ty,)*)> for Fun
        where
            Fun: Fn($($ty),*) -> Ret + Send + Sync,
            Ret: BoxReturn,
            $($ty: UnboxValue,)*
        {
            fn arity(&self) -> usize {
                $count
            }

            fn invoke(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
                if args.len() != $count {
                    return Err(DispatchError::ArityMismatch {
                        expected: $count,
                        observed: args.len(),
                    });
                }
                $(let $var = <$ty as UnboxValue>::unbox(&args[$index])?;)*
                Ok(self($($var),*).into_values())
            }
        }
    };
}

impl_unboxed_kernel!(0);
impl_unboxed_kernel!(1, (0, A0, a0));
impl_unboxed_kernel!(2, (0, A0, a0), (1, A1, a1));
impl_unboxed_kernel!(3, (0, A0, a0), (1, A1, a1), (2, A2, a2));
impl_unboxed_kernel!(4, (0, A0, a0), (1, A1, a1), (2, A2, a2), (3, A3, a3));

/// Boxed kernel function. The default-constructed kernel is invalid and
/// fails with `InvalidKernel` when invoked.
#[derive(Clone, Default)]
pub struct Kernel {
    boxed: Option<Arc<BoxedFn>>,
}

impl Kernel {
    #[must_use]
    pub fn from_boxed<F>(kernel: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Vec<Value>, DispatchError> + Send + Sync + 'static,
    {
        Self {
            boxed: Some(Arc::new(kernel)),
        }
    }

    /// Adapts a natively typed function, capturing it by value.
    #[must_use]
    pub fn from_unboxed<Args, F>(kernel: F) -> Self
    where
        F: UnboxedKernel<Args> + 'static,
    {
        Self::from_boxed(move |args: &[Value]| kernel.invoke(args))
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.boxed.is_some()
    }

    pub fn call_boxed(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        match &self.boxed {
            Some(boxed) => boxed(args),
            None => Err(DispatchError::InvalidKernel),
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            f.write_str("Kernel(valid)")
        } else {
            f.write_str("Kernel(invalid)")
        }
    }
}

/// Union of the key sets of every tensor among the arguments (`Tensor`
/// and `TensorList` variants both contribute); a tensor-free argument
/// list falls back to the functionality keys alone.
#[must_use]
pub fn compute_dispatch_key_set(args: &[Value]) -> DispatchKeySet {
    compute_dispatch_key_set_with(args, GlobalDispatchState::instance())
}

#[must_use]
pub fn compute_dispatch_key_set_with(
    args: &[Value],
    state: &GlobalDispatchState,
) -> DispatchKeySet {
    let mut combined = DispatchKeySet::empty();
    for arg in args {
        match arg {
            Value::Tensor(tensor) => combined |= tensor.key_set_with(state),
            Value::TensorList(tensors) => {
                for tensor in tensors {
                    combined |= tensor.key_set_with(state);
                }
            }
            _ => {}
        }
    }
    if combined.is_empty() {
        combined = state.functionality_keys();
    }
    combined
}

/// Per-operator dispatch table. Lookup walks the key set in ascending
/// priority order and falls back to `CatchAll`; the `Undefined` sentinel
/// is never selected.
#[derive(Debug)]
pub struct OperatorHandle {
    name: OperatorName,
    dispatch_table: RwLock<HashMap<DispatchKey, Kernel>>,
}

impl OperatorHandle {
    #[must_use]
    pub fn new(name: OperatorName) -> Self {
        Self {
            name,
            dispatch_table: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &OperatorName {
        &self.name
    }

    pub fn set_kernel(&self, key: DispatchKey, kernel: Kernel) {
        let mut table = self
            .dispatch_table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        table.insert(key, kernel);
    }

    pub fn remove_kernel(&self, key: DispatchKey) -> bool {
        let mut table = self
            .dispatch_table
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        table.remove(&key).is_some()
    }

    #[must_use]
    pub fn has_kernel(&self, key: DispatchKey) -> bool {
        let table = self
            .dispatch_table
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        table.contains_key(&key)
    }

    /// The selected kernel is cloned out so no lock is held while it runs.
    #[must_use]
    pub fn lookup_kernel(&self, keyset: DispatchKeySet) -> Option<Kernel> {
        let table = self
            .dispatch_table
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for key in keyset.to_ordered_vec() {
            if key == DispatchKey::Undefined {
                continue;
            }
            if let Some(kernel) = table.get(&key) {
                return Some(kernel.clone());
            }
        }
        table.get(&DispatchKey::CatchAll).cloned()
    }

    pub fn call_with_keys(
        &self,
        keyset: DispatchKeySet,
        args: &[Value],
    ) -> Result<Vec<Value>, DispatchError> {
        let Some(kernel) = self.lookup_kernel(keyset) else {
            return Err(DispatchError::NoKernel {
                op: self.name.full_name(),
                keyset: keyset.to_string(),
            });
        };
        kernel.call_boxed(args)
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        self.call_with_keys(self.compute_dispatch_key_set(args), args)
    }

    #[must_use]
    pub fn compute_dispatch_key_set(&self, args: &[Value]) -> DispatchKeySet {
        compute_dispatch_key_set(args)
    }

    /// Registered keys in ascending priority order.
    #[must_use]
    pub fn registered_keys(&self) -> Vec<DispatchKey> {
        let table = self
            .dispatch_table
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<DispatchKey> = table.keys().copied().collect();
        keys.sort_by_key(|key| key.priority());
        keys
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let entries = self
            .registered_keys()
            .into_iter()
            .map(|key| format!("{key}: registered"))
            .collect::<Vec<_>>()
            .join("; ");
        if entries.is_empty() {
            format!("OperatorHandle({}) {{ }}", self.name)
        } else {
            format!("OperatorHandle({}) {{ {entries} }}", self.name)
        }
    }
}

pub type RegistrationCallback = Arc<dyn Fn(&OperatorName, bool) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStats {
    pub call_count: u64,
    pub key_counts: BTreeMap<DispatchKey, u64>,
}

/// Process-wide registry mapping operator names to handles. Registry
/// reads and writes serialize on one mutex; the statistics map has its
/// own lock so the hot path does not contend with registration.
///
/// Registration callbacks run synchronously while the registry lock is
/// held: a callback must not reenter the dispatcher or it deadlocks.
pub struct Dispatcher {
    operators: Mutex<BTreeMap<OperatorName, Arc<OperatorHandle>>>,
    callbacks: Mutex<Vec<RegistrationCallback>>,
    profiling_enabled: AtomicBool,
    call_stats: Mutex<BTreeMap<OperatorName, CallStats>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            operators: Mutex::new(BTreeMap::new()),
            callbacks: Mutex::new(Vec::new()),
            profiling_enabled: AtomicBool::new(false),
            call_stats: Mutex::new(BTreeMap::new()),
        }
    }

    /// The process-wide singleton; initialization is lazy and
    /// thread-safe. Private instances built with `new` stay fully
    /// independent of it.
    #[must_use]
    pub fn instance() -> Arc<Dispatcher> {
        static INSTANCE: OnceLock<Arc<Dispatcher>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(Dispatcher::new())).clone()
    }

    /// Idempotent: a repeated name returns the existing handle unchanged
    /// and fires no callback.
    pub fn register_operator(&self, name: OperatorName) -> Arc<OperatorHandle> {
        let mut operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = operators.get(&name) {
            return existing.clone();
        }
        let handle = Arc::new(OperatorHandle::new(name.clone()));
        operators.insert(name.clone(), handle.clone());
        self.notify_registration(&name, true);
        handle
    }

    #[must_use]
    pub fn find_operator(&self, name: &OperatorName) -> Option<Arc<OperatorHandle>> {
        let operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        operators.get(name).cloned()
    }

    #[must_use]
    pub fn has_operator(&self, name: &OperatorName) -> bool {
        let operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        operators.contains_key(name)
    }

    pub fn deregister_operator(&self, name: &OperatorName) -> bool {
        let mut operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        if operators.remove(name).is_some() {
            self.notify_registration(name, false);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn all_operator_names(&self) -> Vec<OperatorName> {
        let operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        operators.keys().cloned().collect()
    }

    pub fn call(&self, name: &OperatorName, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        let handle = self
            .find_operator(name)
            .ok_or_else(|| DispatchError::UnknownOperator {
                name: name.full_name(),
            })?;
        let keyset = compute_dispatch_key_set(args);
        let result = handle.call_with_keys(keyset, args)?;
        self.record_call(name, keyset.highest_priority());
        Ok(result)
    }

    pub fn call_with_keys(
        &self,
        name: &OperatorName,
        keyset: DispatchKeySet,
        args: &[Value],
    ) -> Result<Vec<Value>, DispatchError> {
        let handle = self
            .find_operator(name)
            .ok_or_else(|| DispatchError::UnknownOperator {
                name: name.full_name(),
            })?;
        let result = handle.call_with_keys(keyset, args)?;
        self.record_call(name, keyset.highest_priority());
        Ok(result)
    }

    pub fn call_by_name(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, DispatchError> {
        self.call(&OperatorName::parse(name), args)
    }

    pub fn add_registration_callback(&self, callback: RegistrationCallback) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        callbacks.push(callback);
    }

    pub fn enable_profiling(&self, enabled: bool) {
        self.profiling_enabled.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn profiling_enabled(&self) -> bool {
        self.profiling_enabled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn call_statistics(&self) -> BTreeMap<OperatorName, CallStats> {
        let stats = self.call_stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.clone()
    }

    pub fn reset_call_statistics(&self) {
        let mut stats = self.call_stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.clear();
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::from("Dispatcher {\n");
        let _ = writeln!(out, "  Registered operators: {}", operators.len());
        for (name, handle) in operators.iter() {
            let _ = writeln!(out, "  {} {{", name.full_name());
            for key in handle.registered_keys() {
                let _ = writeln!(out, "    {key}");
            }
            out.push_str("  }\n");
        }
        drop(operators);

        if self.profiling_enabled() {
            out.push_str("\n  Call Statistics:\n");
            let stats = self.call_stats.lock().unwrap_or_else(PoisonError::into_inner);
            for (name, entry) in stats.iter() {
                let _ = writeln!(out, "    {}: {} calls", name.full_name(), entry.call_count);
                let mut keys: Vec<(DispatchKey, u64)> =
                    entry.key_counts.iter().map(|(k, v)| (*k, *v)).collect();
                keys.sort_by_key(|(key, _)| key.priority());
                for (key, count) in keys {
                    let _ = writeln!(out, "      {key}: {count} times");
                }
            }
        }

        out.push('}');
        out
    }

    /// Runs while the registry lock is held; a panicking callback is
    /// swallowed and the remaining callbacks still run.
    fn notify_registration(&self, name: &OperatorName, registered: bool) {
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            let _ = catch_unwind(AssertUnwindSafe(|| callback(name, registered)));
        }
    }

    /// Statistics are touched only after the kernel returned
    /// successfully; a failed call leaves them unchanged.
    fn record_call(&self, name: &OperatorName, key: DispatchKey) {
        if !self.profiling_enabled() {
            return;
        }
        let mut stats = self.call_stats.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = stats.entry(name.clone()).or_default();
        entry.call_count += 1;
        *entry.key_counts.entry(key).or_default() += 1;
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operators = self.operators.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Dispatcher")
            .field("operators", &operators.len())
            .field("profiling_enabled", &self.profiling_enabled())
            .finish_non_exhaustive()
    }
}
