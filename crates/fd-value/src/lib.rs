#![forbid(unsafe_code)]

use std::fmt;
use std::mem;

use fd_core::TensorHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    None,
    Tensor,
    Double,
    Int,
    Bool,
    String,
    IntList,
    DoubleList,
    TensorList,
}

impl ValueTag {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Tensor => "Tensor",
            Self::Double => "Double",
            Self::Int => "Int",
            Self::Bool => "Bool",
            Self::String => "String",
            Self::IntList => "IntList",
            Self::DoubleList => "DoubleList",
            Self::TensorList => "TensorList",
        }
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueError {
    TypeMismatch {
        expected: ValueTag,
        observed: ValueTag,
    },
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, observed } => {
                write!(f, "value type mismatch: expected {expected}, observed {observed}")
            }
        }
    }
}

impl std::error::Error for ValueError {}

/// Tagged union over the runtime types of the boxed calling convention.
/// Cloning is deep for list payloads and shared for tensors; `take`
/// transfers the payload out and leaves `None` behind.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    None,
    Tensor(TensorHandle),
    Double(f64),
    Int(i64),
    Bool(bool),
    String(String),
    IntList(Vec<i64>),
    DoubleList(Vec<f64>),
    TensorList(Vec<TensorHandle>),
}

impl Value {
    #[must_use]
    pub fn tag(&self) -> ValueTag {
        match self {
            Self::None => ValueTag::None,
            Self::Tensor(_) => ValueTag::Tensor,
            Self::Double(_) => ValueTag::Double,
            Self::Int(_) => ValueTag::Int,
            Self::Bool(_) => ValueTag::Bool,
            Self::String(_) => ValueTag::String,
            Self::IntList(_) => ValueTag::IntList,
            Self::DoubleList(_) => ValueTag::DoubleList,
            Self::TensorList(_) => ValueTag::TensorList,
        }
    }

    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Self::Tensor(_))
    }

    #[must_use]
    pub fn is_tensor_list(&self) -> bool {
        matches!(self, Self::TensorList(_))
    }

    fn mismatch(&self, expected: ValueTag) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            observed: self.tag(),
        }
    }

    pub fn to_tensor(&self) -> Result<TensorHandle, ValueError> {
        match self {
            Self::Tensor(tensor) => Ok(tensor.clone()),
            other => Err(other.mismatch(ValueTag::Tensor)),
        }
    }

    pub fn to_double(&self) -> Result<f64, ValueError> {
        match self {
            Self::Double(value) => Ok(*value),
            other => Err(other.mismatch(ValueTag::Double)),
        }
    }

    pub fn to_int(&self) -> Result<i64, ValueError> {
        match self {
            Self::Int(value) => Ok(*value),
            other => Err(other.mismatch(ValueTag::Int)),
        }
    }

    pub fn to_bool(&self) -> Result<bool, ValueError> {
        match self {
            Self::Bool(value) => Ok(*value),
            other => Err(other.mismatch(ValueTag::Bool)),
        }
    }

    pub fn to_string(&self) -> Result<String, ValueError> {
        match self {
            Self::String(value) => Ok(value.clone()),
            other => Err(other.mismatch(ValueTag::String)),
        }
    }

    pub fn to_int_list(&self) -> Result<Vec<i64>, ValueError> {
        match self {
            Self::IntList(values) => Ok(values.clone()),
            other => Err(other.mismatch(ValueTag::IntList)),
        }
    }

    pub fn to_double_list(&self) -> Result<Vec<f64>, ValueError> {
        match self {
            Self::DoubleList(values) => Ok(values.clone()),
            other => Err(other.mismatch(ValueTag::DoubleList)),
        }
    }

    pub fn to_tensor_list(&self) -> Result<Vec<TensorHandle>, ValueError> {
        match self {
            Self::TensorList(tensors) => Ok(tensors.clone()),
            other => Err(other.mismatch(ValueTag::TensorList)),
        }
    }

    /// Moves the payload out, leaving this value in the `None` state.
    #[must_use]
    pub fn take(&mut self) -> Value {
        mem::take(self)
    }

    #[must_use]
    pub fn debug_string(&self) -> String {
        match self {
            Self::None => "None".to_string(),
            Self::Tensor(tensor) => format!("Tensor({})", tensor.debug_string()),
            Self::Double(value) => format!("Double({value})"),
            Self::Int(value) => format!("Int({value})"),
            Self::Bool(value) => format!("Bool({value})"),
            Self::String(value) => format!("String(\"{value}\")"),
            Self::IntList(values) => format!("IntList([{}])", join_display(values)),
            Self::DoubleList(values) => format!("DoubleList([{}])", join_display(values)),
            Self::TensorList(tensors) => {
                let rendered = tensors
                    .iter()
                    .map(|tensor| tensor.debug_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("TensorList([{rendered}])")
            }
        }
    }
}

fn join_display<T: fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<TensorHandle> for Value {
    fn from(value: TensorHandle) -> Self {
        Self::Tensor(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<i64>> for Value {
    fn from(value: Vec<i64>) -> Self {
        Self::IntList(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Self::DoubleList(value)
    }
}

impl From<Vec<TensorHandle>> for Value {
    fn from(value: Vec<TensorHandle>) -> Self {
        Self::TensorList(value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fd_core::{make_tensor_cpu, make_tensor_cuda};
    use proptest::prelude::*;

    use super::{Value, ValueError, ValueTag};

    #[test]
    fn default_value_is_none() {
        let value = Value::default();
        assert!(value.is_none());
        assert_eq!(value.tag(), ValueTag::None);
    }

    #[test]
    fn scalar_round_trips() {
        assert_eq!(Value::Double(3.25).to_double(), Ok(3.25));
        assert_eq!(Value::Int(-7).to_int(), Ok(-7));
        assert_eq!(Value::Bool(true).to_bool(), Ok(true));
        assert_eq!(
            Value::String("hello".to_string()).to_string(),
            Ok("hello".to_string())
        );
    }

    #[test]
    fn list_round_trips() {
        assert_eq!(Value::IntList(vec![1, 2, 3]).to_int_list(), Ok(vec![1, 2, 3]));
        assert_eq!(
            Value::DoubleList(vec![0.5, 1.5]).to_double_list(),
            Ok(vec![0.5, 1.5])
        );

        let tensor = make_tensor_cpu(vec![2]);
        let list = Value::TensorList(vec![tensor.clone()]);
        let extracted = list.to_tensor_list().expect("tensor list should extract");
        assert_eq!(extracted.len(), 1);
        assert!(Arc::ptr_eq(&extracted[0], &tensor));
    }

    #[test]
    fn tensor_accessor_shares_the_tensor() {
        let tensor = make_tensor_cuda(vec![3, 4]);
        let value = Value::Tensor(tensor.clone());
        let extracted = value.to_tensor().expect("tensor should extract");
        assert!(Arc::ptr_eq(&extracted, &tensor));
    }

    #[test]
    fn wrong_accessor_reports_both_tags() {
        let value = Value::Double(3.25);
        let err = value.to_tensor().expect_err("double is not a tensor");
        assert_eq!(
            err,
            ValueError::TypeMismatch {
                expected: ValueTag::Tensor,
                observed: ValueTag::Double,
            }
        );
        assert_eq!(
            err.to_string(),
            "value type mismatch: expected Tensor, observed Double"
        );
    }

    #[test]
    fn every_accessor_rejects_none() {
        let value = Value::None;
        assert!(value.to_tensor().is_err());
        assert!(value.to_double().is_err());
        assert!(value.to_int().is_err());
        assert!(value.to_bool().is_err());
        assert!(value.to_string().is_err());
        assert!(value.to_int_list().is_err());
        assert!(value.to_double_list().is_err());
        assert!(value.to_tensor_list().is_err());
    }

    #[test]
    fn take_leaves_none_behind() {
        let mut value = Value::Int(9);
        let moved = value.take();
        assert_eq!(moved.to_int(), Ok(9));
        assert!(value.is_none());
    }

    #[test]
    fn clone_shares_tensor_payloads() {
        let tensor = make_tensor_cpu(vec![2, 2]);
        let original = Value::Tensor(tensor.clone());
        let copy = original.clone();

        let lhs = original.to_tensor().expect("original extracts");
        let rhs = copy.to_tensor().expect("copy extracts");
        assert!(Arc::ptr_eq(&lhs, &rhs));
        // original + copy + the two extractions + the local binding
        assert_eq!(Arc::strong_count(&tensor), 5);
    }

    #[test]
    fn dropping_values_releases_tensor_references() {
        let tensor = make_tensor_cpu(vec![1]);
        {
            let _held = Value::Tensor(tensor.clone());
            assert_eq!(Arc::strong_count(&tensor), 2);
        }
        assert_eq!(Arc::strong_count(&tensor), 1);
    }

    #[test]
    fn from_str_builds_string_variant() {
        let value = Value::from("literal");
        assert_eq!(value.tag(), ValueTag::String);
        assert_eq!(value.to_string(), Ok("literal".to_string()));
    }

    #[test]
    fn debug_strings_render_payloads() {
        assert_eq!(Value::None.debug_string(), "None");
        assert_eq!(Value::Double(2.5).debug_string(), "Double(2.5)");
        assert_eq!(Value::Int(42).debug_string(), "Int(42)");
        assert_eq!(Value::Bool(false).debug_string(), "Bool(false)");
        assert_eq!(Value::from("x").debug_string(), "String(\"x\")");
        assert_eq!(
            Value::IntList(vec![1, 2]).debug_string(),
            "IntList([1, 2])"
        );

        let tensor = make_tensor_cpu(vec![2, 3]);
        assert_eq!(
            Value::Tensor(tensor).debug_string(),
            "Tensor(shape=[2, 3], backend=CPU)"
        );
    }

    proptest! {
        #[test]
        fn prop_int_round_trip(payload in any::<i64>()) {
            prop_assert_eq!(Value::Int(payload).to_int(), Ok(payload));
        }

        #[test]
        fn prop_double_round_trip(payload in -1.0e12f64..1.0e12f64) {
            prop_assert_eq!(Value::Double(payload).to_double(), Ok(payload));
        }

        #[test]
        fn prop_int_list_round_trip(payload in prop::collection::vec(any::<i64>(), 0..8)) {
            prop_assert_eq!(Value::IntList(payload.clone()).to_int_list(), Ok(payload));
        }

        #[test]
        fn prop_string_round_trip(payload in "[a-zA-Z0-9_]{0,16}") {
            prop_assert_eq!(
                Value::String(payload.clone()).to_string(),
                Ok(payload)
            );
        }

        #[test]
        fn prop_wrong_accessor_always_mismatches(payload in any::<i64>()) {
            let value = Value::Int(payload);
            let err = value.to_double().expect_err("int is not a double");
            prop_assert_eq!(
                err,
                ValueError::TypeMismatch {
                    expected: ValueTag::Double,
                    observed: ValueTag::Int,
                }
            );
        }
    }
}
