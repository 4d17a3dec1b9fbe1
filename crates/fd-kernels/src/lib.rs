#![forbid(unsafe_code)]

use std::sync::Arc;

use fd_core::{make_tensor_cpu, make_tensor_cuda, DispatchKey, TensorHandle};
use fd_dispatch::{compute_dispatch_key_set, Dispatcher, Kernel, OperatorName};

// Placeholder kernels: no arithmetic happens anywhere here, results only
// propagate shape and backend.

#[must_use]
pub fn add_cpu(lhs: TensorHandle, _rhs: TensorHandle) -> TensorHandle {
    make_tensor_cpu(lhs.sizes().to_vec())
}

#[must_use]
pub fn add_cuda(lhs: TensorHandle, _rhs: TensorHandle) -> TensorHandle {
    make_tensor_cuda(lhs.sizes().to_vec())
}

#[must_use]
pub fn add_scalar(lhs: f64, rhs: f64) -> f64 {
    lhs + rhs
}

/// Result lands on the tensor argument's backend.
#[must_use]
pub fn add_tensor_scalar(tensor: TensorHandle, _offset: f64) -> TensorHandle {
    match tensor.backend_key() {
        DispatchKey::CUDA => make_tensor_cuda(tensor.sizes().to_vec()),
        _ => make_tensor_cpu(tensor.sizes().to_vec()),
    }
}

#[must_use]
pub fn tensor_rank(tensor: TensorHandle) -> i64 {
    tensor.dim()
}

pub fn clear_grad(tensor: TensorHandle) {
    tensor.set_requires_grad(false);
}

/// Boxed wrapper kernel for a functionality key: recomputes the key set
/// from the arguments, peels everything at or above its own priority and
/// re-enters the dispatcher. Recomputation can reintroduce keys a
/// higher-priority wrapper already handled, so masking only the own key
/// would loop between wrappers once two functionality flags are active.
#[must_use]
pub fn redispatch_wrapper(
    dispatcher: Arc<Dispatcher>,
    name: OperatorName,
    own_key: DispatchKey,
) -> Kernel {
    Kernel::from_boxed(move |args| {
        let keyset = compute_dispatch_key_set(args).lower_priority_than(own_key);
        dispatcher.call_with_keys(&name, keyset, args)
    })
}

/// Installs the demo operator set:
///
/// - `add`: CPU and CUDA backends plus Autograd/Tracing/Profiling
///   wrappers that peel their key and redispatch.
/// - `add.scalar`: f64 addition. Scalar-only calls derive a tensor-free
///   key set, so the kernel sits under `CatchAll`.
/// - `add.tensor_scalar`: tensor plus scalar under CPU.
/// - `tensor_rank`: backend-independent, under `CatchAll`.
/// - `clear_grad`: unit return, same kernel for both backends.
pub fn register_demo_operators(dispatcher: &Arc<Dispatcher>) {
    let add_name = OperatorName::new("add");
    let add = dispatcher.register_operator(add_name.clone());
    add.set_kernel(DispatchKey::CPU, Kernel::from_unboxed(add_cpu));
    add.set_kernel(DispatchKey::CUDA, Kernel::from_unboxed(add_cuda));
    for key in [
        DispatchKey::Autograd,
        DispatchKey::Tracing,
        DispatchKey::Profiling,
    ] {
        add.set_kernel(
            key,
            redispatch_wrapper(dispatcher.clone(), add_name.clone(), key),
        );
    }

    let scalar = dispatcher.register_operator(OperatorName::with_overload("add", "scalar"));
    scalar.set_kernel(DispatchKey::CatchAll, Kernel::from_unboxed(add_scalar));

    let mixed = dispatcher.register_operator(OperatorName::with_overload("add", "tensor_scalar"));
    mixed.set_kernel(DispatchKey::CPU, Kernel::from_unboxed(add_tensor_scalar));

    let rank = dispatcher.register_operator(OperatorName::new("tensor_rank"));
    rank.set_kernel(DispatchKey::CatchAll, Kernel::from_unboxed(tensor_rank));

    let clear = dispatcher.register_operator(OperatorName::new("clear_grad"));
    clear.set_kernel(DispatchKey::CPU, Kernel::from_unboxed(clear_grad));
    clear.set_kernel(DispatchKey::CUDA, Kernel::from_unboxed(clear_grad));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fd_core::{make_tensor_cpu, make_tensor_cuda, DispatchKey};
    use fd_dispatch::{DispatchError, Dispatcher, OperatorName};
    use fd_value::Value;

    use super::{add_cpu, add_tensor_scalar, register_demo_operators, tensor_rank};

    fn demo_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::new());
        register_demo_operators(&dispatcher);
        dispatcher
    }

    #[test]
    fn add_cpu_propagates_first_shape() {
        let out = add_cpu(make_tensor_cpu(vec![2, 3]), make_tensor_cpu(vec![2, 3]));
        assert_eq!(out.sizes(), &[2, 3]);
        assert!(out.is_cpu());
    }

    #[test]
    fn add_tensor_scalar_keeps_the_tensor_backend() {
        let out = add_tensor_scalar(make_tensor_cuda(vec![1, 4]), 5.0);
        assert!(out.is_cuda());
        assert_eq!(out.sizes(), &[1, 4]);
    }

    #[test]
    fn demo_add_routes_to_cpu_backend() {
        let dispatcher = demo_dispatcher();
        let args = vec![
            Value::Tensor(make_tensor_cpu(vec![2, 3])),
            Value::Tensor(make_tensor_cpu(vec![2, 3])),
        ];
        let out = dispatcher
            .call_by_name("add", &args)
            .expect("cpu pair should dispatch");
        let tensor = out[0].to_tensor().expect("result tensor");
        assert!(tensor.is_cpu());
        assert_eq!(tensor.sizes(), &[2, 3]);
    }

    #[test]
    fn demo_add_routes_to_cuda_backend() {
        let dispatcher = demo_dispatcher();
        let args = vec![
            Value::Tensor(make_tensor_cuda(vec![3, 4])),
            Value::Tensor(make_tensor_cuda(vec![3, 4])),
        ];
        let out = dispatcher
            .call_by_name("add", &args)
            .expect("cuda pair should dispatch");
        assert!(out[0].to_tensor().expect("result tensor").is_cuda());
    }

    #[test]
    fn autograd_wrapper_redispatches_to_backend() {
        let dispatcher = demo_dispatcher();
        let lhs = make_tensor_cpu(vec![2, 2]);
        lhs.set_requires_grad(true);

        let args = vec![
            Value::Tensor(lhs),
            Value::Tensor(make_tensor_cpu(vec![2, 2])),
        ];
        let out = dispatcher
            .call_by_name("add", &args)
            .expect("grad pair should route through the wrapper to CPU");
        assert!(out[0].to_tensor().expect("result tensor").is_cpu());
    }

    #[test]
    fn scalar_overload_dispatches_through_catch_all() {
        let dispatcher = demo_dispatcher();
        let out = dispatcher
            .call_by_name("add.scalar", &[Value::Double(3.0), Value::Double(0.25)])
            .expect("scalar overload should hit the catch-all kernel");
        assert_eq!(out[0].to_double(), Ok(3.25));
    }

    #[test]
    fn tensor_rank_works_for_both_backends() {
        let dispatcher = demo_dispatcher();
        let cpu = dispatcher
            .call_by_name("tensor_rank", &[Value::Tensor(make_tensor_cpu(vec![2, 3, 4]))])
            .expect("cpu rank should dispatch");
        assert_eq!(cpu[0].to_int(), Ok(3));

        let cuda = dispatcher
            .call_by_name("tensor_rank", &[Value::Tensor(make_tensor_cuda(vec![8]))])
            .expect("cuda rank should dispatch");
        assert_eq!(cuda[0].to_int(), Ok(1));
        assert_eq!(tensor_rank(make_tensor_cpu(Vec::new())), 0);
    }

    #[test]
    fn clear_grad_returns_nothing_and_flips_the_flag() {
        let dispatcher = demo_dispatcher();
        let tensor = make_tensor_cpu(vec![2]);
        tensor.set_requires_grad(true);

        let out = dispatcher
            .call_by_name("clear_grad", &[Value::Tensor(tensor.clone())])
            .expect("unit kernel should dispatch");
        assert!(out.is_empty());
        assert!(!tensor.requires_grad());
    }

    #[test]
    fn mixed_overload_rejects_swapped_arguments() {
        let dispatcher = demo_dispatcher();
        let err = dispatcher
            .call_by_name(
                "add.tensor_scalar",
                &[
                    Value::Double(5.0),
                    Value::Tensor(make_tensor_cpu(vec![2, 3])),
                ],
            )
            .expect_err("swapped argument order must fail closed");
        assert_eq!(err.kind(), "type_mismatch");
    }

    #[test]
    fn demo_registry_lists_all_operators() {
        let dispatcher = demo_dispatcher();
        let names: Vec<String> = dispatcher
            .all_operator_names()
            .iter()
            .map(OperatorName::full_name)
            .collect();
        assert_eq!(
            names,
            vec![
                "add",
                "add.scalar",
                "add.tensor_scalar",
                "clear_grad",
                "tensor_rank",
            ]
        );

        let add = dispatcher
            .find_operator(&OperatorName::new("add"))
            .expect("add should be registered");
        assert_eq!(
            add.registered_keys(),
            vec![
                DispatchKey::Autograd,
                DispatchKey::Tracing,
                DispatchKey::Profiling,
                DispatchKey::CPU,
                DispatchKey::CUDA,
            ]
        );
    }

    #[test]
    fn mixed_overload_requires_cpu_tensor() {
        let dispatcher = demo_dispatcher();
        let err = dispatcher
            .call_by_name(
                "add.tensor_scalar",
                &[
                    Value::Tensor(make_tensor_cuda(vec![2])),
                    Value::Double(1.0),
                ],
            )
            .expect_err("cuda tensor has no kernel for this overload");
        assert!(matches!(err, DispatchError::NoKernel { .. }));
        assert!(err.to_string().contains("{CUDA}"));
    }
}
