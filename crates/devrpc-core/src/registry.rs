//! Named functions an Endpoint exposes to its peer.
//!
//! A registry is assembled once with [`RegistryBuilder`] and frozen into an
//! `Arc<FunctionRegistry>`. Endpoints and Groups only ever see the frozen
//! form, so there is no way to mutate it after the first Endpoint exists.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// A locally callable function.
///
/// Arguments arrive exactly as the caller sent them; an `Err` is forwarded to
/// the caller as a remote error carrying the error chain as its description.
#[async_trait]
pub trait RpcFunction: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct FnFunction<F>(F);

#[async_trait]
impl<F, Fut> RpcFunction for FnFunction<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Function with a declared argument shape `A` and result shape `R`.
struct TypedFunction<A, R, F> {
    name: String,
    f: F,
    _shape: PhantomData<fn(A) -> R>,
}

#[async_trait]
impl<A, R, F, Fut> RpcFunction for TypedFunction<A, R, F>
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let decoded: A = decode_args(args)
            .with_context(|| format!("invalid arguments for {}", self.name))?;
        let result = (self.f)(decoded).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Positional args decode as a sequence (tuples, `Vec`, tuple structs).
/// No args also decode as unit.
fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> serde_json::Result<A> {
    if args.is_empty() {
        if let Ok(unit) = serde_json::from_value(Value::Null) {
            return Ok(unit);
        }
    }
    serde_json::from_value(Value::Array(args))
}

/// Immutable mapping from method name to function.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn RpcFunction>>,
}

impl FunctionRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// A registry with no functions, for peers that only call out.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn RpcFunction>> {
        self.functions.get(method).cloned()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.functions.contains_key(method)
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Collects functions before freezing them into a [`FunctionRegistry`].
///
/// Registering a name twice keeps the last function.
#[derive(Default)]
pub struct RegistryBuilder {
    functions: HashMap<String, Arc<dyn RpcFunction>>,
}

impl RegistryBuilder {
    /// Register a function over raw positional args.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_function(name, Arc::new(FnFunction(f)))
    }

    /// Register a function whose positional args decode into `A`.
    ///
    /// ```rust,ignore
    /// let registry = FunctionRegistry::builder()
    ///     .register_typed("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
    ///     .build();
    /// ```
    pub fn register_typed<A, R, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let name = name.into();
        let function = TypedFunction {
            name: name.clone(),
            f,
            _shape: PhantomData,
        };
        self.register_function(name, Arc::new(function))
    }

    pub fn register_function(
        mut self,
        name: impl Into<String>,
        function: Arc<dyn RpcFunction>,
    ) -> Self {
        self.functions.insert(name.into(), function);
        self
    }

    pub fn build(self) -> Arc<FunctionRegistry> {
        Arc::new(FunctionRegistry {
            functions: self.functions,
        })
    }
}
