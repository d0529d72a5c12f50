//! Request-scoped context propagated through a call chain.
//!
//! A [`Context`] is immutable: deriving a value, a cancellation scope or a
//! deadline returns a child and leaves the parent untouched. Values are
//! keyed by type and looked up by walking the chain from child to root, so
//! a child shadows its ancestors but an ancestor never sees a child's value.

use crate::error::ServiceError;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;

struct Layer {
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
    parent: Option<Arc<Layer>>,
}

#[derive(Clone)]
pub struct Context {
    values: Option<Arc<Layer>>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

/// Cancels the context it was created with, and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Context {
    /// An empty root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            values: None,
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let layer = Layer {
            key: TypeId::of::<T>(),
            value: Arc::new(value),
            parent: self.values.clone(),
        };
        Self {
            values: Some(Arc::new(layer)),
            token: self.token.clone(),
            deadline: self.deadline,
        }
    }

    /// The nearest value of type `T` in the chain.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let key = TypeId::of::<T>();
        let mut current = self.values.as_deref();
        while let Some(layer) = current {
            if layer.key == key {
                return layer.value.downcast_ref::<T>();
            }
            current = layer.parent.as_deref();
        }
        None
    }

    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let token = self.token.child_token();
        let ctx = Self {
            values: self.values.clone(),
            token: token.clone(),
            deadline: self.deadline,
        };
        (ctx, CancelHandle { token })
    }

    /// A child whose deadline is the earlier of `deadline` and the parent's.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            values: self.values.clone(),
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    /// A timeout too large to represent leaves the deadline unchanged.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the context is done, or `None` while it is still live.
    pub fn err(&self) -> Option<ServiceError> {
        if self.token.is_cancelled() {
            return Some(ServiceError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ServiceError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ServiceError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => ServiceError::Cancelled,
                    _ = time::sleep_until(deadline) => ServiceError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ServiceError::Cancelled
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut depth = 0;
        let mut current = self.values.as_deref();
        while let Some(layer) = current {
            depth += 1;
            current = layer.parent.as_deref();
        }
        f.debug_struct("Context")
            .field("values", &depth)
            .field("cancelled", &self.token.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}
