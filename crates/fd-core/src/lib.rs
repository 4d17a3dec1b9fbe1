#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Sub, SubAssign};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DispatchKey {
    CPU = 0,
    CUDA = 1,
    Autograd = 2,
    Tracing = 3,
    Profiling = 4,
    Undefined = 5,
    CatchAll = 6,
}

/// All keys in ascending priority-number order. `Undefined` sorts last.
const PRIORITY_ORDER: [DispatchKey; 7] = [
    DispatchKey::Autograd,
    DispatchKey::Tracing,
    DispatchKey::Profiling,
    DispatchKey::CPU,
    DispatchKey::CUDA,
    DispatchKey::CatchAll,
    DispatchKey::Undefined,
];

impl DispatchKey {
    #[must_use]
    pub const fn all() -> &'static [DispatchKey] {
        &[
            DispatchKey::CPU,
            DispatchKey::CUDA,
            DispatchKey::Autograd,
            DispatchKey::Tracing,
            DispatchKey::Profiling,
            DispatchKey::Undefined,
            DispatchKey::CatchAll,
        ]
    }

    #[must_use]
    pub const fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// Lower number = higher priority. Functionality keys must outrank
    /// backend keys so wrappers interpose before the terminal backend
    /// kernel; `CatchAll` sits below every backend.
    #[must_use]
    pub const fn priority(self) -> u8 {
        match self {
            Self::Autograd => 0,
            Self::Tracing => 1,
            Self::Profiling => 2,
            Self::CPU => 10,
            Self::CUDA => 11,
            Self::CatchAll => 100,
            Self::Undefined => 255,
        }
    }

    #[must_use]
    pub const fn is_backend(self) -> bool {
        matches!(self, Self::CPU | Self::CUDA)
    }

    #[must_use]
    pub const fn is_functionality(self) -> bool {
        matches!(self, Self::Autograd | Self::Tracing | Self::Profiling)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CPU => "CPU",
            Self::CUDA => "CUDA",
            Self::Autograd => "Autograd",
            Self::Tracing => "Tracing",
            Self::Profiling => "Profiling",
            Self::Undefined => "Undefined",
            Self::CatchAll => "CatchAll",
        }
    }
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DispatchKeySet {
    bits: u64,
}

impl DispatchKeySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    #[must_use]
    pub const fn single(key: DispatchKey) -> Self {
        Self { bits: key.bit() }
    }

    #[must_use]
    pub fn from_keys(keys: &[DispatchKey]) -> Self {
        let mut out = Self::empty();
        for key in keys {
            out.add(*key);
        }
        out
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.bits == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn add(&mut self, key: DispatchKey) {
        self.bits |= key.bit();
    }

    pub fn remove(&mut self, key: DispatchKey) {
        self.bits &= !key.bit();
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    #[must_use]
    pub const fn has(self, key: DispatchKey) -> bool {
        (self.bits & key.bit()) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            bits: self.bits | other.bits,
        }
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self {
            bits: self.bits & other.bits,
        }
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self {
            bits: self.bits & !other.bits,
        }
    }

    #[must_use]
    pub const fn is_subset(self, other: Self) -> bool {
        (self.bits & !other.bits) == 0
    }

    /// The subset with strictly lower priority than `key`. This is the
    /// set a wrapper redispatches with after peeling: recomputing from
    /// the arguments may reintroduce higher-priority functionality keys,
    /// and dropping everything at or above the peeled key guarantees no
    /// wrapper that already ran can be selected again.
    #[must_use]
    pub fn lower_priority_than(self, key: DispatchKey) -> Self {
        let mut out = Self::empty();
        for candidate in PRIORITY_ORDER {
            if candidate.priority() > key.priority() && self.has(candidate) {
                out.add(candidate);
            }
        }
        out
    }

    /// The member with the smallest priority number, or `Undefined` for
    /// the empty set.
    #[must_use]
    pub fn highest_priority(self) -> DispatchKey {
        PRIORITY_ORDER
            .iter()
            .copied()
            .find(|key| self.has(*key))
            .unwrap_or(DispatchKey::Undefined)
    }

    /// Members sorted by ascending priority number.
    #[must_use]
    pub fn to_ordered_vec(self) -> Vec<DispatchKey> {
        PRIORITY_ORDER
            .iter()
            .copied()
            .filter(|key| self.has(*key))
            .collect()
    }
}

impl BitOr for DispatchKeySet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for DispatchKeySet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.bits |= rhs.bits;
    }
}

impl BitAnd for DispatchKeySet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl BitAndAssign for DispatchKeySet {
    fn bitand_assign(&mut self, rhs: Self) {
        self.bits &= rhs.bits;
    }
}

impl Sub for DispatchKeySet {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.difference(rhs)
    }
}

impl SubAssign for DispatchKeySet {
    fn sub_assign(&mut self, rhs: Self) {
        self.bits &= !rhs.bits;
    }
}

impl FromIterator<DispatchKey> for DispatchKeySet {
    fn from_iter<I: IntoIterator<Item = DispatchKey>>(iter: I) -> Self {
        let mut out = Self::empty();
        for key in iter {
            out.add(key);
        }
        out
    }
}

impl fmt::Display for DispatchKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, key) in self.to_ordered_vec().into_iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            f.write_str(key.as_str())?;
        }
        f.write_str("}")
    }
}

/// Process-wide feature flags. Reads happen on every dispatch with
/// relaxed ordering; flags only change interpositional behavior, so
/// eventual visibility across threads is acceptable.
#[derive(Debug)]
pub struct GlobalDispatchState {
    autograd: AtomicBool,
    tracing: AtomicBool,
    profiling: AtomicBool,
}

impl GlobalDispatchState {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            autograd: AtomicBool::new(false),
            tracing: AtomicBool::new(false),
            profiling: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn instance() -> &'static GlobalDispatchState {
        static GLOBAL: GlobalDispatchState = GlobalDispatchState::new();
        &GLOBAL
    }

    pub fn set_autograd_enabled(&self, enabled: bool) {
        self.autograd.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn autograd_enabled(&self) -> bool {
        self.autograd.load(Ordering::Relaxed)
    }

    pub fn set_tracing_enabled(&self, enabled: bool) {
        self.tracing.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn tracing_enabled(&self) -> bool {
        self.tracing.load(Ordering::Relaxed)
    }

    pub fn set_profiling_enabled(&self, enabled: bool) {
        self.profiling.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn profiling_enabled(&self) -> bool {
        self.profiling.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn functionality_keys(&self) -> DispatchKeySet {
        let mut keys = DispatchKeySet::empty();
        if self.autograd_enabled() {
            keys.add(DispatchKey::Autograd);
        }
        if self.tracing_enabled() {
            keys.add(DispatchKey::Tracing);
        }
        if self.profiling_enabled() {
            keys.add(DispatchKey::Profiling);
        }
        keys
    }

    pub fn reset(&self) {
        self.set_autograd_enabled(false);
        self.set_tracing_enabled(false);
        self.set_profiling_enabled(false);
    }
}

impl Default for GlobalDispatchState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorError {
    NotABackendKey { key: DispatchKey },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotABackendKey { key } => {
                write!(f, "dispatch key {key} is not a backend key")
            }
        }
    }
}

impl std::error::Error for TensorError {}

/// Minimal tensor stand-in: shape, backend key and grad flag are the only
/// attributes the dispatch core consumes.
#[derive(Debug)]
pub struct TensorImpl {
    id: u64,
    sizes: Vec<i64>,
    backend_key: DispatchKey,
    requires_grad: AtomicBool,
}

pub type TensorHandle = Arc<TensorImpl>;

impl TensorImpl {
    pub fn new(sizes: Vec<i64>, backend_key: DispatchKey) -> Result<Self, TensorError> {
        if !backend_key.is_backend() {
            return Err(TensorError::NotABackendKey { key: backend_key });
        }
        Ok(Self::backend(sizes, backend_key))
    }

    fn backend(sizes: Vec<i64>, backend_key: DispatchKey) -> Self {
        Self {
            id: NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed),
            sizes,
            backend_key,
            requires_grad: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    #[must_use]
    pub fn dim(&self) -> i64 {
        self.sizes.len() as i64
    }

    #[must_use]
    pub fn numel(&self) -> i64 {
        if self.sizes.is_empty() {
            return 0;
        }
        self.sizes.iter().copied().fold(1i64, i64::saturating_mul)
    }

    #[must_use]
    pub fn backend_key(&self) -> DispatchKey {
        self.backend_key
    }

    #[must_use]
    pub fn is_cpu(&self) -> bool {
        self.backend_key == DispatchKey::CPU
    }

    #[must_use]
    pub fn is_cuda(&self) -> bool {
        self.backend_key == DispatchKey::CUDA
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.requires_grad.store(requires_grad, Ordering::Relaxed);
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.requires_grad.load(Ordering::Relaxed)
    }

    /// Backend key, plus `Autograd` when the tensor wants gradients, plus
    /// the process-wide functionality keys.
    #[must_use]
    pub fn key_set(&self) -> DispatchKeySet {
        self.key_set_with(GlobalDispatchState::instance())
    }

    #[must_use]
    pub fn key_set_with(&self, state: &GlobalDispatchState) -> DispatchKeySet {
        let mut keys = DispatchKeySet::single(self.backend_key);
        if self.requires_grad() {
            keys.add(DispatchKey::Autograd);
        }
        keys | state.functionality_keys()
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        let shape = self
            .sizes
            .iter()
            .map(|size| size.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut out = format!("shape=[{shape}], backend={}", self.backend_key);
        if self.requires_grad() {
            out.push_str(", requires_grad=true");
        }
        out
    }
}

pub fn make_tensor(sizes: Vec<i64>, backend_key: DispatchKey) -> Result<TensorHandle, TensorError> {
    TensorImpl::new(sizes, backend_key).map(Arc::new)
}

#[must_use]
pub fn make_tensor_cpu(sizes: Vec<i64>) -> TensorHandle {
    Arc::new(TensorImpl::backend(sizes, DispatchKey::CPU))
}

#[must_use]
pub fn make_tensor_cuda(sizes: Vec<i64>) -> TensorHandle {
    Arc::new(TensorImpl::backend(sizes, DispatchKey::CUDA))
}

/// Union of the key sets of every tensor; a tensor-free argument list
/// falls back to the functionality keys alone.
#[must_use]
pub fn combined_key_set(tensors: &[TensorHandle]) -> DispatchKeySet {
    combined_key_set_with(tensors, GlobalDispatchState::instance())
}

#[must_use]
pub fn combined_key_set_with(
    tensors: &[TensorHandle],
    state: &GlobalDispatchState,
) -> DispatchKeySet {
    let mut combined = DispatchKeySet::empty();
    for tensor in tensors {
        combined |= tensor.key_set_with(state);
    }
    if combined.is_empty() {
        combined = state.functionality_keys();
    }
    combined
}
