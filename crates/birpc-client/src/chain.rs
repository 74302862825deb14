//! CallChain: the asynchronous result of an outbound call
//!
//! A `CallChain` is a single-assignment cell holding either a value or an
//! [`RpcError`], plus the continuations waiting for it. It is settled exactly
//! once through its [`Resolver`]; later attempts are ignored.
//!
//! Continuations registered before settlement run once, in registration
//! order, when the chain settles. Continuations registered afterwards run
//! immediately on the registering thread.
//!
//! # Combinators
//!
//! - [`CallChain::then`] / [`CallChain::and_then`]: run on success, error passes through
//! - [`CallChain::catch`] / [`CallChain::or_else`]: run on error, value passes through
//! - [`CallChain::all`]: wait for several chains, keep every outcome
//!
//! A chain is also a future: `chain.await` yields its outcome.
//!
//! # Example
//!
//! ```
//! use birpc_client::CallChain;
//! use birpc_common::RpcError;
//!
//! let (chain, resolver) = CallChain::<i64>::pending();
//! let doubled = chain
//!     .then(|n| Ok(n * 2))
//!     .then(|n| if n > 10 { Err(RpcError::Handler("too big".into())) } else { Ok(n) })
//!     .catch(|_| Ok(-1));
//!
//! resolver.resolve(21);
//! assert_eq!(doubled.peek(), Some(Ok(-1)));
//! ```

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::IntoFuture;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use birpc_common::{Result, RpcError};

type Continuation<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum ChainState<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Result<T>),
}

type SharedState<T> = Arc<Mutex<ChainState<T>>>;

fn lock<S>(state: &Mutex<S>) -> MutexGuard<'_, S> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a continuation body, turning a panic into an error outcome.
fn guarded<U>(body: impl FnOnce() -> Result<U>) -> Result<U> {
    std::panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|m| m.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "continuation panicked".to_string());
        Err(RpcError::Handler(message))
    })
}

/// Settles `state` if still pending. First writer wins.
fn settle<T: Clone>(state: &Mutex<ChainState<T>>, outcome: Result<T>) -> bool {
    let waiting = {
        let mut guard = lock(state);
        let waiting = match &mut *guard {
            ChainState::Settled(_) => return false,
            ChainState::Pending(waiting) => std::mem::take(waiting),
        };
        *guard = ChainState::Settled(outcome.clone());
        waiting
    };

    for continuation in waiting {
        continuation(&outcome);
    }
    true
}

/// Asynchronous result of a call. `T` defaults to a raw JSON value.
///
/// Cloning yields another handle to the same cell.
pub struct CallChain<T = Value> {
    state: SharedState<T>,
}

/// Write side of a [`CallChain`].
///
/// Dropping an unused resolver settles its chain with
/// [`RpcError::Internal`], so nobody waits on a result that cannot come.
pub struct Resolver<T = Value> {
    state: SharedState<T>,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Settles the chain. Returns `false` if it was already settled.
    pub fn settle(self, outcome: Result<T>) -> bool {
        settle(&self.state, outcome)
    }

    pub fn resolve(self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(self, error: RpcError) -> bool {
        self.settle(Err(error))
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let abandoned = || Err(RpcError::Internal("call abandoned before settling".into()));
        let waiting = {
            let mut guard = lock(&self.state);
            let waiting = match &mut *guard {
                ChainState::Settled(_) => return,
                ChainState::Pending(waiting) => std::mem::take(waiting),
            };
            *guard = ChainState::Settled(abandoned());
            waiting
        };
        // no T: Clone bound here, one fresh error per continuation
        for continuation in waiting {
            continuation(&abandoned());
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> CallChain<T> {
    /// Creates an unsettled chain and the resolver that settles it.
    pub fn pending() -> (CallChain<T>, Resolver<T>) {
        let state = Arc::new(Mutex::new(ChainState::Pending(Vec::new())));
        (
            CallChain {
                state: state.clone(),
            },
            Resolver { state },
        )
    }

    /// A chain already settled with `outcome`.
    pub fn settled(outcome: Result<T>) -> Self {
        CallChain {
            state: Arc::new(Mutex::new(ChainState::Settled(outcome))),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: RpcError) -> Self {
        Self::settled(Err(error))
    }

    /// The outcome, if the chain has settled.
    pub fn peek(&self) -> Option<Result<T>> {
        match &*lock(&self.state) {
            ChainState::Pending(_) => None,
            ChainState::Settled(outcome) => Some(outcome.clone()),
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(&*lock(&self.state), ChainState::Settled(_))
    }

    /// Registers a raw continuation.
    fn on_settled(&self, continuation: impl FnOnce(&Result<T>) + Send + 'static) {
        let outcome = {
            let mut guard = lock(&self.state);
            match &mut *guard {
                ChainState::Pending(waiting) => {
                    waiting.push(Box::new(continuation));
                    return;
                }
                ChainState::Settled(outcome) => outcome.clone(),
            }
        };
        continuation(&outcome);
    }

    /// Chains a success continuation.
    ///
    /// The new chain settles with `on_success`'s outcome. If this chain fails,
    /// `on_success` is never called and the error is forwarded untouched.
    /// A panic inside `on_success` settles the new chain as an error.
    pub fn then<U, F>(&self, on_success: F) -> CallChain<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Result<U> + Send + 'static,
    {
        let (next, resolver) = CallChain::pending();
        self.on_settled(move |outcome| {
            let outcome = match outcome {
                Ok(value) => {
                    let value = value.clone();
                    guarded(move || on_success(value))
                }
                Err(error) => Err(error.clone()),
            };
            resolver.settle(outcome);
        });
        next
    }

    /// Like [`then`](Self::then), but the continuation returns another chain
    /// whose eventual outcome the new chain adopts.
    pub fn and_then<U, F>(&self, on_success: F) -> CallChain<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> CallChain<U> + Send + 'static,
    {
        let (next, resolver) = CallChain::pending();
        self.on_settled(move |outcome| match outcome {
            Ok(value) => {
                let value = value.clone();
                match guarded(move || Ok(on_success(value))) {
                    Ok(inner) => inner.adopt_into(resolver),
                    Err(error) => {
                        resolver.reject(error);
                    }
                }
            }
            Err(error) => {
                resolver.reject(error.clone());
            }
        });
        next
    }

    /// Chains an error handler.
    ///
    /// Runs only if this chain failed; its result becomes the new chain's
    /// outcome, so returning `Ok` marks the error as handled. Values pass
    /// through untouched.
    pub fn catch<F>(&self, on_error: F) -> CallChain<T>
    where
        F: FnOnce(RpcError) -> Result<T> + Send + 'static,
    {
        let (next, resolver) = CallChain::pending();
        self.on_settled(move |outcome| {
            let outcome = match outcome {
                Ok(value) => Ok(value.clone()),
                Err(error) => {
                    let error = error.clone();
                    guarded(move || on_error(error))
                }
            };
            resolver.settle(outcome);
        });
        next
    }

    /// Like [`catch`](Self::catch), but the handler returns another chain.
    pub fn or_else<F>(&self, on_error: F) -> CallChain<T>
    where
        F: FnOnce(RpcError) -> CallChain<T> + Send + 'static,
    {
        let (next, resolver) = CallChain::pending();
        self.on_settled(move |outcome| match outcome {
            Ok(value) => {
                resolver.resolve(value.clone());
            }
            Err(error) => {
                let error = error.clone();
                match guarded(move || Ok(on_error(error))) {
                    Ok(inner) => inner.adopt_into(resolver),
                    Err(error) => {
                        resolver.reject(error);
                    }
                }
            }
        });
        next
    }

    fn adopt_into(&self, resolver: Resolver<T>) {
        self.on_settled(move |outcome| {
            resolver.settle(outcome.clone());
        });
    }

    /// Waits for the outcome.
    pub async fn wait(self) -> Result<T> {
        self.await
    }
}

impl<T> CallChain<T>
where
    T: Clone + Send + 'static,
{
    /// Waits for every chain and collects all outcomes by key.
    ///
    /// Never fails: a failed chain shows up as an `Err` entry. With no chains
    /// the result is an empty map, available immediately.
    pub fn all<K, I>(chains: I) -> CallChain<BTreeMap<K, Result<T>>>
    where
        K: Ord + Clone + Send + 'static,
        I: IntoIterator<Item = (K, CallChain<T>)>,
    {
        let chains: Vec<(K, CallChain<T>)> = chains.into_iter().collect();
        if chains.is_empty() {
            return CallChain::resolved(BTreeMap::new());
        }

        let (all, resolver) = CallChain::pending();
        let gather = Arc::new(Mutex::new(Gather {
            results: BTreeMap::new(),
            remaining: chains.len(),
            resolver: Some(resolver),
        }));

        for (key, chain) in chains {
            let gather = gather.clone();
            chain.on_settled(move |outcome| {
                let finished = {
                    let mut gather = lock(&gather);
                    gather.results.insert(key, outcome.clone());
                    gather.remaining -= 1;
                    if gather.remaining == 0 {
                        let results = std::mem::take(&mut gather.results);
                        gather.resolver.take().map(|resolver| (resolver, results))
                    } else {
                        None
                    }
                };
                if let Some((resolver, results)) = finished {
                    resolver.resolve(results);
                }
            });
        }

        all
    }
}

struct Gather<K, T> {
    results: BTreeMap<K, Result<T>>,
    remaining: usize,
    resolver: Option<Resolver<BTreeMap<K, Result<T>>>>,
}

impl<T> Clone for CallChain<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for CallChain<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        let (tx, rx) = oneshot::channel();
        self.on_settled(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Err(RpcError::Internal("call chain dropped".into())))
        }
        .boxed()
    }
}

impl<T: fmt::Debug> fmt::Debug for CallChain<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*lock(&self.state) {
            ChainState::Pending(waiting) => f
                .debug_struct("CallChain")
                .field("pending", &waiting.len())
                .finish(),
            ChainState::Settled(outcome) => f
                .debug_struct("CallChain")
                .field("settled", outcome)
                .finish(),
        }
    }
}
