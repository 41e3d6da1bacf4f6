//! Local endpoints and method dispatch.
//!
//! An endpoint is a named object whose methods the remote side may call as
//! `"<Endpoint>.<Method>"`. Each method is registered with its parameter
//! types and an async invoker, so validation and coercion happen against an
//! explicit table instead of runtime introspection.
//!
//! # Example
//!
//! ```rust
//! use tandem_ipc::{Args, Endpoint, HandlerError, Value, ValueType};
//!
//! struct Math;
//!
//! impl Math {
//!     fn div(&self, a: i64, b: i64) -> Result<i64, HandlerError> {
//!         if b == 0 {
//!             return Err(HandlerError::msg("zero division"));
//!         }
//!         Ok(a / b)
//!     }
//! }
//!
//! let endpoint = Endpoint::of(Math)
//!     .method("Div", [ValueType::Int, ValueType::Int], |math, args: Args| async move {
//!         Ok(vec![Value::Int(math.div(args.int(0)?, args.int(1)?)?)])
//!     })
//!     .build();
//!
//! assert_eq!(endpoint.name(), "Math");
//! ```

use crate::value::{Value, ValueType};
use crate::{IpcError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Error returned by a method handler. Sent to the caller as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError(String);

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        Self(err.to_string())
    }
}

/// Outcome of a handler: the ordinary results, or the trailing error slot.
pub type HandlerResult = std::result::Result<Vec<Value>, HandlerError>;

type Invoker = Arc<dyn Fn(Args) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Coerced arguments of one call, in declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Args {
    values: Vec<Value>,
}

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.values
    }

    fn typed<'a, T>(
        &'a self,
        index: usize,
        expected: &str,
        pick: impl FnOnce(&'a Value) -> Option<T>,
    ) -> std::result::Result<T, HandlerError> {
        let value = self
            .values
            .get(index)
            .ok_or_else(|| HandlerError::msg(format!("missing argument {}", index)))?;
        pick(value).ok_or_else(|| {
            HandlerError::msg(format!(
                "argument {}: expected {}, got {}",
                index,
                expected,
                value.value_type()
            ))
        })
    }

    pub fn int(&self, index: usize) -> std::result::Result<i64, HandlerError> {
        self.typed(index, "int", Value::as_int)
    }

    pub fn str(&self, index: usize) -> std::result::Result<&str, HandlerError> {
        self.typed(index, "string", Value::as_str)
    }

    pub fn bool(&self, index: usize) -> std::result::Result<bool, HandlerError> {
        self.typed(index, "bool", Value::as_bool)
    }

    pub fn blob(&self, index: usize) -> std::result::Result<&[u8], HandlerError> {
        self.typed(index, "blob", Value::as_blob)
    }

    pub fn array(&self, index: usize) -> std::result::Result<&[Value], HandlerError> {
        self.typed(index, "array", Value::as_array)
    }
}

struct Method {
    params: Vec<ValueType>,
    invoke: Invoker,
}

/// A named local object exposing callable methods.
pub struct Endpoint {
    name: String,
    methods: HashMap<String, Method>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<&String> = self.methods.keys().collect();
        methods.sort();
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

impl Endpoint {
    /// Start an endpoint without backing state.
    pub fn new(name: impl Into<String>) -> EndpointBuilder<()> {
        EndpointBuilder {
            name: name.into(),
            target: Arc::new(()),
            methods: HashMap::new(),
        }
    }

    /// Start an endpoint backed by `target`, named after its type.
    pub fn of<T: Send + Sync + 'static>(target: T) -> EndpointBuilder<T> {
        Self::of_shared(Arc::new(target))
    }

    /// Like [`Endpoint::of`] for an already shared object.
    pub fn of_shared<T: Send + Sync + 'static>(target: Arc<T>) -> EndpointBuilder<T> {
        EndpointBuilder {
            name: type_name_of::<T>(),
            target,
            methods: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Declared parameter types of a method.
    pub fn params(&self, method: &str) -> Option<&[ValueType]> {
        self.methods.get(method).map(|m| m.params.as_slice())
    }
}

/// Builder collecting the dispatch table of one endpoint.
pub struct EndpointBuilder<T> {
    name: String,
    target: Arc<T>,
    methods: HashMap<String, Method>,
}

impl<T: Send + Sync + 'static> EndpointBuilder<T> {
    /// Override the endpoint name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a method.
    ///
    /// `params` are the declared parameter types; incoming arguments are
    /// checked against their count and coerced before `handler` runs.
    pub fn method<F, Fut>(
        mut self,
        name: impl Into<String>,
        params: impl IntoIterator<Item = ValueType>,
        handler: F,
    ) -> Self
    where
        F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let target = self.target.clone();
        let invoke: Invoker = Arc::new(move |args| handler(target.clone(), args).boxed());
        let name = name.into();
        if self.methods.contains_key(&name) {
            warn!("Method {}.{} registered twice, keeping the last", self.name, name);
        }
        self.methods.insert(
            name,
            Method {
                params: params.into_iter().collect(),
                invoke,
            },
        );
        self
    }

    pub fn build(self) -> Endpoint {
        Endpoint {
            name: self.name,
            methods: self.methods,
        }
    }
}

impl<T: Send + Sync + 'static> From<EndpointBuilder<T>> for Endpoint {
    fn from(builder: EndpointBuilder<T>) -> Self {
        builder.build()
    }
}

/// Last path segment of a type name, without generics.
fn type_name_of<T>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Split `"Endpoint.Method"`; exactly two non-empty parts are required.
pub fn split_method(method: &str) -> Result<(&str, &str)> {
    let mut parts = method.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(endpoint), Some(name), None) if !endpoint.is_empty() && !name.is_empty() => {
            Ok((endpoint, name))
        }
        _ => Err(IpcError::InvalidMethodName(method.to_string())),
    }
}

/// Endpoints exposed by one IPC instance, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    endpoints: HashMap<String, Arc<Endpoint>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint. A second endpoint with the same name replaces the first.
    pub fn insert(&mut self, endpoint: Endpoint) {
        if self.endpoints.contains_key(endpoint.name()) {
            warn!("Endpoint {} registered twice, keeping the last", endpoint.name());
        }
        self.endpoints
            .insert(endpoint.name().to_string(), Arc::new(endpoint));
    }

    pub fn get(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name).map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Resolve, validate and invoke one call.
    ///
    /// Every failure, including a panicking handler, comes back as a
    /// call-local error.
    pub async fn dispatch(&self, method: &str, args: Vec<serde_json::Value>) -> Result<Vec<Value>> {
        let (endpoint_name, method_name) = split_method(method)?;

        let endpoint = self
            .endpoints
            .get(endpoint_name)
            .ok_or_else(|| IpcError::EndpointNotFound(endpoint_name.to_string()))?;

        let entry = endpoint
            .methods
            .get(method_name)
            .ok_or_else(|| IpcError::MethodNotFound {
                endpoint: endpoint_name.to_string(),
                method: method_name.to_string(),
            })?;

        if args.len() != entry.params.len() {
            return Err(IpcError::ArgumentCountMismatch {
                expected: entry.params.len(),
                got: args.len(),
            });
        }

        let values = args
            .iter()
            .zip(&entry.params)
            .enumerate()
            .map(|(index, (raw, ty))| {
                Value::coerce(raw, ty).map_err(|e| IpcError::ArgumentType {
                    index,
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!("Invoking {}", method);

        let invoke = entry.invoke.clone();
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| invoke(Args::new(values))))
            .map_err(|panic| IpcError::HandlerPanicked(panic_message(panic.as_ref())))?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(results)) => Ok(results),
            Ok(Err(err)) => Err(IpcError::Handler(err.0)),
            Err(panic) => Err(IpcError::HandlerPanicked(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
