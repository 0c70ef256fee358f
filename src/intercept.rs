//! The seam between a capture session and the engine that actually hooks code.
//!
//! An engine (breakpoint debugger, inline trampoline, Frida-style agent, ...)
//! implements [`Interceptor`] and drives a [`CallListener`] with one
//! `on_enter`/`on_leave` pair per call. Each call is described by an
//! [`Invocation`], which exposes the raw argument words and an identity that is
//! the same for an entry and its matching exit.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;

/// Identity of a single in-flight call, as assigned by the engine.
///
/// Must be unique among calls that are in flight at the same time. Keying on
/// the thread alone is not enough for recursive functions; engines usually mix
/// in the stack pointer or a per-thread depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:x}", self.0)
    }
}

pub trait Invocation {
    fn call_id(&self) -> CallId;

    /// Raw machine word of the 0-based argument `index`, per the target's
    /// calling convention.
    fn argument(&self, index: usize) -> usize;
}

pub trait CallListener: Send + Sync {
    fn on_enter(&self, call: &dyn Invocation);
    fn on_leave(&self, call: &dyn Invocation);
}

pub trait Interceptor {
    /// Install an entry/exit hook at `address`. The listener stays attached for
    /// the rest of the process lifetime.
    fn attach(&mut self, address: usize, listener: Arc<dyn CallListener>) -> Result<()>;
}
