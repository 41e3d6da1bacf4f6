//! Endpoints served by the demo processes.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tandem_ipc::{Endpoint, HandlerError, IpcHandle, Value, ValueType, WeakIpcHandle};
use tracing::{info, warn};

/// Arithmetic and byte helpers served by the child.
pub struct Math;

impl Math {
    fn div(&self, a: i64, b: i64) -> Result<i64, HandlerError> {
        if b == 0 {
            return Err(HandlerError::msg("zero division"));
        }
        a.checked_div(b)
            .ok_or_else(|| HandlerError::msg("integer overflow"))
    }

    fn xor_data(&self, a: &[u8], b: &[u8]) -> Result<Vec<u8>, HandlerError> {
        if a.is_empty() || b.is_empty() {
            return Err(HandlerError::msg("empty input data"));
        }
        if a.len() != b.len() {
            return Err(HandlerError::msg("input data length mismatch"));
        }
        Ok(a.iter().zip(b).map(|(x, y)| x ^ y).collect())
    }

    fn sum(&self, values: &[Value]) -> Result<i64, HandlerError> {
        values.iter().try_fold(0i64, |acc, v| {
            let n = v
                .as_int()
                .ok_or_else(|| HandlerError::msg("expected int elements"))?;
            acc.checked_add(n)
                .ok_or_else(|| HandlerError::msg("integer overflow"))
        })
    }
}

pub fn math() -> Endpoint {
    Endpoint::of(Math)
        .method("Div", [ValueType::Int, ValueType::Int], |math, args| async move {
            Ok(vec![Value::Int(math.div(args.int(0)?, args.int(1)?)?)])
        })
        .method("XorData", [ValueType::Blob, ValueType::Blob], |math, args| async move {
            Ok(vec![Value::Blob(math.xor_data(args.blob(0)?, args.blob(1)?)?)])
        })
        .method(
            "Sum",
            [ValueType::array_of(ValueType::Int)],
            |math, args| async move { Ok(vec![Value::Int(math.sum(args.array(0)?)?)]) },
        )
        .method("Explode", [], |_, args| async move {
            if args.is_empty() {
                panic!("explode requested");
            }
            Ok(vec![])
        })
        .build()
}

/// Calls back into the parent from inside a handler.
///
/// The connection owns this endpoint, so the worker only holds a weak handle.
#[derive(Default)]
pub struct Worker {
    parent: OnceLock<WeakIpcHandle>,
}

impl Worker {
    /// Give the worker the connection it should call the parent through.
    pub fn attach(&self, handle: &IpcHandle) {
        if self.parent.set(handle.downgrade()).is_err() {
            warn!("Worker already attached to a connection");
        }
    }

    fn parent(&self) -> Result<IpcHandle, HandlerError> {
        self.parent
            .get()
            .ok_or_else(|| HandlerError::msg("worker is not attached"))?
            .upgrade()
            .ok_or_else(|| HandlerError::msg("connection is closed"))
    }
}

pub fn worker(worker: Arc<Worker>) -> Endpoint {
    Endpoint::of_shared(worker)
        .method("Sleep", [ValueType::Int], |_, args| async move {
            let ms = args.int(0)?;
            let ms = u64::try_from(ms).map_err(|_| HandlerError::msg("negative duration"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(vec![Value::Int(ms as i64)])
        })
        // Call the parent and relay its results.
        .method("Ask", [ValueType::Str], |worker, args| async move {
            let parent = worker.parent()?;
            let method = args.str(0)?;
            parent
                .call(method, Vec::<Value>::new())
                .await
                .map_err(|e| HandlerError::msg(e.to_string()))
        })
        // Start a call to the parent and return without waiting for it.
        .method("Poke", [ValueType::Str], |worker, args| async move {
            let parent = worker.parent()?;
            let method = args.str(0)?.to_string();
            tokio::spawn(async move {
                match parent.call(&method, Vec::<Value>::new()).await {
                    Ok(results) => info!("{} returned {:?}", method, results),
                    Err(e) => warn!("{} failed: {}", method, e),
                }
            });
            Ok(vec![])
        })
        .build()
}

/// Served by the demo parent.
pub fn host() -> Endpoint {
    Endpoint::new("Host")
        .method("Greet", [], |_, _| async move {
            Ok(vec![Value::from("hello from parent")])
        })
        .method("Log", [ValueType::Str], |_, args| async move {
            info!("child says: {}", args.str(0)?);
            Ok(vec![])
        })
        .build()
}
