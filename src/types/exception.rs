//! Exception objects carried across channel rendezvous.
//!
//! `send_throw` hands one of these to the matched receiver instead of a
//! value; the receiver's `receive` call surfaces it as
//! [`Failure::Raised`](crate::Failure::Raised) at its resumption point.

use core::fmt;

use super::Value;

/// A named exception kind.
///
/// The runtime does not define a kind hierarchy; kinds compare by name and
/// exist so an embedding layer can distinguish its own exception families.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExceptionKind(&'static str);

impl ExceptionKind {
    /// Creates a kind with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The kind's name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0
    }
}

impl fmt::Debug for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExceptionKind({})", self.0)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Optional traceback context attached to a thrown exception.
///
/// Opaque to the runtime; frames are carried verbatim from thrower to
/// receiver.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Traceback {
    frames: Vec<String>,
}

impl Traceback {
    /// Creates a traceback from context frames, outermost first.
    #[must_use]
    pub fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }

    /// The carried frames.
    #[must_use]
    pub fn frames(&self) -> &[String] {
        &self.frames
    }
}

impl fmt::Debug for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Traceback")
            .field("depth", &self.frames.len())
            .finish()
    }
}

/// An exception instance: a kind plus optional payload and traceback.
#[derive(Clone, Debug)]
pub struct Exception {
    kind: ExceptionKind,
    value: Option<Value>,
    traceback: Option<Traceback>,
}

impl Exception {
    /// Creates an exception of `kind` with no payload.
    #[must_use]
    pub fn new(kind: ExceptionKind) -> Self {
        Self {
            kind,
            value: None,
            traceback: None,
        }
    }

    /// Attaches a payload value.
    #[must_use]
    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Attaches a traceback.
    #[must_use]
    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }

    /// The exception kind.
    #[must_use]
    pub fn kind(&self) -> ExceptionKind {
        self.kind
    }

    /// The attached payload, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// The attached traceback, if any.
    #[must_use]
    pub fn traceback(&self) -> Option<&Traceback> {
        self.traceback.as_ref()
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.value.is_some() {
            f.write_str(" (with value)")?;
        }
        Ok(())
    }
}

impl PartialEq for Exception {
    /// Equivalence for delivery-fidelity checks: same kind, identical payload
    /// handle, equal traceback frames.
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && match (&self.value, &other.value) {
                (Some(a), Some(b)) => a.ptr_eq(b),
                (None, None) => true,
                _ => false,
            }
            && self.traceback == other.traceback
    }
}
