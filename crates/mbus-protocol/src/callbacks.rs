/// Application callbacks bound to action names.
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::types::Handle;

/// What a callback hands back.
///
/// For plain messages the reply is ignored. For requests it becomes the
/// response, unless it is falsy.
pub enum Reply {
    /// Nothing to say.
    None,
    /// Answer right away.
    Value(Value),
    /// Answer once the future completes.
    Deferred(BoxFuture<'static, Value>),
}

impl Reply {
    /// Answer with whatever `fut` resolves to.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Value> + Send + 'static,
    {
        Reply::Deferred(fut.boxed())
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Value(v)
    }
}

impl From<Option<Value>> for Reply {
    fn from(v: Option<Value>) -> Self {
        v.map_or(Reply::None, Reply::Value)
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::None
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::None => f.write_str("Reply::None"),
            Reply::Value(v) => write!(f, "Reply::Value({v})"),
            Reply::Deferred(_) => f.write_str("Reply::Deferred(..)"),
        }
    }
}

type CallbackFn = dyn Fn(&str, &Value, &Handle) -> Reply + Send + Sync;

/// A callback invoked as `(action, payload, from)`.
///
/// Clones share identity: removing any clone removes the binding.
#[derive(Clone)]
pub struct Callback(Arc<CallbackFn>);

impl Callback {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str, &Value, &Handle) -> Reply + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, action: &str, payload: &Value, from: &Handle) -> Reply {
        (self.0)(action, payload, from)
    }

    /// Whether `other` is this very callback.
    pub fn same_as(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback({:p})", Arc::as_ptr(&self.0))
    }
}

/// Ordered action → callback bindings.
#[derive(Default)]
pub struct CallbackRegistry {
    bindings: Vec<(String, Callback)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to `action`. The same callback may be bound twice.
    pub fn add(&mut self, action: &str, callback: Callback) {
        self.bindings.push((action.to_string(), callback));
    }

    /// Remove the first binding of `callback` to `action`.
    pub fn remove(&mut self, action: &str, callback: &Callback) -> bool {
        let found = self
            .bindings
            .iter()
            .position(|(a, cb)| a == action && cb.same_as(callback));
        match found {
            Some(i) => {
                self.bindings.remove(i);
                true
            }
            None => false,
        }
    }

    /// Callbacks bound to `action`, in binding order.
    pub fn for_action(&self, action: &str) -> Vec<Callback> {
        self.bindings
            .iter()
            .filter(|(a, _)| a == action)
            .map(|(_, cb)| cb.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
