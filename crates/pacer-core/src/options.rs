//! Option values that are either a literal or resolved against live state.

use std::fmt;
use std::sync::Arc;

/// A configuration value that is either fixed or computed from the current
/// state snapshot of the primitive that owns it.
///
/// Resolvers are evaluated lazily at every decision point, never at
/// construction time.
///
/// ```ignore
/// let wait: Dynamic<Duration, DebouncerState> =
///     Dynamic::resolver(|s| Duration::from_millis(100 * (s.execution_count as u64 + 1)));
/// ```
pub enum Dynamic<T, S> {
    Static(T),
    Resolver(Arc<dyn Fn(&S) -> T + Send + Sync>),
}

impl<T, S> Dynamic<T, S> {
    pub fn resolver(f: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Dynamic::Resolver(Arc::new(f))
    }
}

impl<T: Clone, S> Dynamic<T, S> {
    pub fn resolve(&self, state: &S) -> T {
        match self {
            Dynamic::Static(v) => v.clone(),
            Dynamic::Resolver(f) => f(state),
        }
    }
}

impl<T, S> From<T> for Dynamic<T, S> {
    fn from(value: T) -> Self {
        Dynamic::Static(value)
    }
}

impl<T: Clone, S> Clone for Dynamic<T, S> {
    fn clone(&self) -> Self {
        match self {
            Dynamic::Static(v) => Dynamic::Static(v.clone()),
            Dynamic::Resolver(f) => Dynamic::Resolver(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug, S> fmt::Debug for Dynamic<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Dynamic::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Callback receiving a state snapshot.
pub type Hook<S> = Arc<dyn Fn(&S) + Send + Sync>;

/// Callback receiving a produced value or an error, e.g. `on_success`.
pub type ValueHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Resolve the implicit `throw_on_error` default used by the async
/// debouncer, throttler, rate limiter, queuer and batcher: errors are
/// raised unless the caller registered an `on_error` hook.
pub(crate) fn throws(explicit: Option<bool>, has_error_hook: bool) -> bool {
    explicit.unwrap_or(!has_error_hook)
}
