//! Method Registry
//!
//! Maps `"Namespace.method"` names to invocable handlers. Components are not
//! discovered by inspecting live objects: each one is described by an
//! [`Exposed`] capability table built once at startup, listing its callable
//! methods and, optionally, the table it extends.
//!
//! # Registration rules
//!
//! - **Explicit namespace**: only the component's own methods are registered,
//!   under the given namespace. The `extends` chain is not walked.
//! - **No namespace**: the full chain is walked, most-derived first, and the
//!   component's own type name is used as namespace. A method overridden
//!   lower in the chain shadows the inherited one.
//! - Methods whose name starts with `_` are internal and never registered.
//! - Re-registration adds missing names and never replaces an existing entry.
//!
//! # Example
//!
//! ```
//! use birpc_server::{Exposed, MethodRegistry};
//!
//! let calc = Exposed::new("Calc").method("add", |params| {
//!     Ok(params.arg::<i64>(0)? + params.arg::<i64>(1)?)
//! });
//!
//! let registry = MethodRegistry::new();
//! registry.register(&calc, None);
//! assert!(registry.list().contains("Calc.add"));
//! ```

use futures::future::{self, BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use birpc_common::protocol::builtin::{self, LIST_COMPONENTS};
use birpc_common::{MethodName, Params, Result, RpcError};

/// Prefix marking a member as internal. Such members are never exposed.
pub const INTERNAL_MARKER: char = '_';

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// A registered method: takes the positional arguments, yields a JSON value.
pub type Handler = Arc<dyn Fn(Params) -> HandlerFuture + Send + Sync>;

fn to_json<R: Serialize>(value: R) -> Result<Value> {
    serde_json::to_value(value).map_err(RpcError::from)
}

/// Capability table describing one exposable component.
///
/// Built once, then handed to [`MethodRegistry::register`]. Cloning is cheap,
/// handlers are shared.
#[derive(Clone)]
pub struct Exposed {
    /// Namespace used when none is given at registration
    type_name: String,
    /// Own methods, in declaration order
    methods: Vec<(String, Handler)>,
    /// Table this component extends
    parent: Option<Arc<Exposed>>,
}

impl Exposed {
    /// Creates an empty capability table.
    ///
    /// # Arguments
    /// * `type_name` - Namespace used when registering without an explicit one
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            methods: Vec::new(),
            parent: None,
        }
    }

    /// Adds a synchronous method.
    ///
    /// The handler's return value is serialized to JSON. Returning an error
    /// reports it to the caller; a panic is caught by the registry.
    pub fn method<F, R>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Params) -> Result<R> + Send + Sync + 'static,
        R: Serialize,
    {
        let handler: Handler =
            Arc::new(move |params| future::ready(handler(params).and_then(to_json)).boxed());
        self.declare(name, handler)
    }

    /// Adds an asynchronous method.
    ///
    /// The dispatch loop does not wait for the returned future: other inbound
    /// messages keep being dispatched while it runs.
    pub fn async_method<F, Fut, R>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let handler: Handler = Arc::new(move |params| {
            let fut = handler(params);
            async move { fut.await.and_then(to_json) }.boxed()
        });
        self.declare(name, handler)
    }

    /// Declares that this component extends `parent`.
    ///
    /// Only registration without an explicit namespace sees the parent's
    /// methods.
    pub fn extends(mut self, parent: Exposed) -> Self {
        self.parent = Some(Arc::new(parent));
        self
    }

    fn declare(mut self, name: &str, handler: Handler) -> Self {
        self.methods.retain(|(existing, _)| existing != name);
        self.methods.push((name.to_string(), handler));
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Names of the methods declared directly on this table.
    pub fn own_methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|(name, _)| name.as_str())
    }

    /// Resolves the registry entries this table contributes.
    fn entries(&self, namespace: Option<&str>) -> Vec<(MethodName, Handler)> {
        let public = |name: &str| !name.starts_with(INTERNAL_MARKER);

        if let Some(namespace) = namespace {
            return self
                .methods
                .iter()
                .filter(|(name, _)| public(name))
                .map(|(name, handler)| (format!("{}.{}", namespace, name), handler.clone()))
                .collect();
        }

        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        let mut current = Some(self);
        while let Some(exposed) = current {
            for (name, handler) in &exposed.methods {
                if public(name) && seen.insert(name.as_str()) {
                    entries.push((format!("{}.{}", self.type_name, name), handler.clone()));
                }
            }
            current = exposed.parent.as_deref();
        }
        entries
    }
}

impl fmt::Debug for Exposed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exposed")
            .field("type_name", &self.type_name)
            .field("methods", &self.own_methods().collect::<Vec<_>>())
            .field("parent", &self.parent.as_ref().map(|p| p.type_name.as_str()))
            .finish()
    }
}

type MethodTable = BTreeMap<MethodName, Handler>;

fn read(table: &RwLock<MethodTable>) -> RwLockReadGuard<'_, MethodTable> {
    table.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(table: &RwLock<MethodTable>) -> RwLockWriteGuard<'_, MethodTable> {
    table.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn advertised(table: &MethodTable) -> BTreeSet<MethodName> {
    table
        .keys()
        .filter(|name| !builtin::is_system_method(name))
        .cloned()
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Registry of locally exposed methods.
///
/// Shared read-mostly by every remote of a connection manager: dispatch takes
/// a read lock just long enough to clone the handler, so late registrations
/// never block behind a running handler.
///
/// Cloning is cheap, clones share the same table.
#[derive(Clone)]
pub struct MethodRegistry {
    methods: Arc<RwLock<MethodTable>>,
}

impl MethodRegistry {
    /// Creates a registry holding only the built-in `system.listComponents`.
    pub fn new() -> Self {
        let methods = Arc::new(RwLock::new(MethodTable::new()));

        // weak, or the table would own itself through the handler
        let table = Arc::downgrade(&methods);
        let list_components: Handler = Arc::new(move |_params| {
            let names = table
                .upgrade()
                .map(|table| advertised(&read(&table)))
                .unwrap_or_default();
            future::ready(Ok(builtin::component_list(&names))).boxed()
        });
        write(&methods).insert(LIST_COMPONENTS.to_string(), list_components);

        Self { methods }
    }

    /// Registers a component.
    ///
    /// # Arguments
    /// * `exposed` - The component's capability table
    /// * `namespace` - Explicit namespace; `None` uses the type name and walks `extends`
    ///
    /// # Returns
    /// The names that were not registered before, in registration order
    pub fn register(&self, exposed: &Exposed, namespace: Option<&str>) -> Vec<MethodName> {
        let mut added = Vec::new();
        {
            let mut table = write(&self.methods);
            for (name, handler) in exposed.entries(namespace) {
                if builtin::is_system_method(&name) {
                    warn!("Refusing to register reserved method {}", name);
                    continue;
                }
                match table.entry(name) {
                    Entry::Vacant(slot) => {
                        added.push(slot.key().clone());
                        slot.insert(handler);
                    }
                    Entry::Occupied(slot) => {
                        debug!("{} already registered, keeping existing handler", slot.key());
                    }
                }
            }
        }

        info!(
            "Registered {} ({} new methods)",
            namespace.unwrap_or(exposed.type_name()),
            added.len()
        );
        added
    }

    /// Invokes a registered method.
    ///
    /// Handler failures come back as the handler's own error. A panicking
    /// handler is caught here and reported as [`RpcError::Internal`]; it never
    /// unwinds into the dispatch loop.
    ///
    /// # Errors
    /// [`RpcError::MethodNotFound`] if `method` is not registered
    pub async fn invoke(&self, method: &str, params: Params) -> Result<Value> {
        let handler = read(&self.methods)
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(future) => future,
            Err(payload) => return Err(Self::panicked(method, payload.as_ref())),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(Self::panicked(method, payload.as_ref())),
        }
    }

    fn panicked(method: &str, payload: &(dyn Any + Send)) -> RpcError {
        let message = panic_message(payload);
        warn!("Handler for {} panicked: {}", method, message);
        RpcError::Internal(message)
    }

    /// Names advertised to peers. Reserved `system.*` methods are excluded.
    pub fn list(&self) -> BTreeSet<MethodName> {
        advertised(&read(&self.methods))
    }

    pub fn contains(&self, method: &str) -> bool {
        read(&self.methods).contains_key(method)
    }

    /// Number of advertised methods.
    pub fn len(&self) -> usize {
        self.list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.list())
            .finish()
    }
}
