//! Opaque payload values exchanged over channels.
//!
//! The runtime never inspects payloads: a [`Value`] is a shared-ownership
//! handle whose lifetime ends when the last holder releases it. Cloning a
//! `Value` clones the handle, not the contents, so the value a receiver
//! obtains is exactly the allocation the sender supplied.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cx::Cx;

/// The type-erased future a tasklet body produces.
pub type BodyFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// An opaque, reference-counted payload.
#[derive(Clone)]
pub struct Value(Arc<dyn Any + Send + Sync>);

impl Value {
    /// Wraps `value` in a shared payload handle.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrows the contents as `T`, if that is what they are.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// True if the contents are a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    /// True if `self` and `other` are handles to the same allocation.
    ///
    /// This is the identity relation the round-trip guarantee is stated in:
    /// a value received from a channel is `ptr_eq` to the value sent.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True if the contents are a callable tasklet body.
    #[must_use]
    pub fn is_callable(&self) -> bool {
        self.is::<TaskletBody>()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&"..").finish()
    }
}

/// A reusable callable that a tasklet can be bound to.
///
/// This is the dynamic-surface counterpart of passing a closure to
/// [`Scheduler::create_tasklet`](crate::Scheduler::create_tasklet): a
/// `TaskletBody` can be wrapped in a [`Value`] and later bound via
/// [`Scheduler::create_tasklet_value`](crate::Scheduler::create_tasklet_value),
/// which rejects non-callable payloads with `InvalidCallable`.
#[derive(Clone)]
pub struct TaskletBody(Arc<dyn Fn(Cx) -> BodyFuture + Send + Sync>);

impl TaskletBody {
    /// Wraps a body factory. The factory runs once per bound tasklet, at
    /// creation time; the returned future is the deferred call.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Arc::new(move |cx| Box::pin(f(cx))))
    }

    pub(crate) fn bind(&self, cx: Cx) -> BodyFuture {
        (self.0)(cx)
    }
}

impl fmt::Debug for TaskletBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskletBody").finish_non_exhaustive()
    }
}
