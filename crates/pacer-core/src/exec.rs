//! Boxed forms of the functions the primitives wrap, and the shared
//! bookkeeping for settling an async execution.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::options::{Hook, ValueHook, throws};
use crate::outcome::{Outcome, Settle};
use crate::store::{Derive, Store};

pub(crate) type SyncFn<A> = Arc<dyn Fn(A) + Send + Sync>;

pub(crate) type AsyncFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

pub(crate) fn boxed<A, T, E, F, Fut>(f: F) -> AsyncFn<A, T, E>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

/// Counters every async state keeps.
pub(crate) trait SettleCounters {
    fn record_success(&mut self);
    fn record_error(&mut self, error: String);
}

/// Borrowed view of the result hooks of an async options struct.
pub(crate) struct ResultHooks<'a, T, E, S> {
    pub on_success: Option<&'a ValueHook<T>>,
    pub on_error: Option<&'a ValueHook<E>>,
    pub on_settled: Option<&'a Hook<S>>,
    pub throw_on_error: Option<bool>,
}

/// Record `outcome` in `store`, run the hooks, and decide what callers see.
///
/// Cancelled executions touch no counters and fire no hooks.
pub(crate) fn settle<T, E, S>(store: &Store<S>, hooks: ResultHooks<'_, T, E, S>, outcome: Outcome<T, E>) -> Result<Option<T>, E>
where
    E: Display,
    S: Clone + Derive + SettleCounters,
{
    let reply = match outcome {
        Outcome::Success(value) => {
            store.update(|s| s.record_success());
            if let Some(hook) = hooks.on_success {
                hook(&value);
            }
            Ok(Some(value))
        }
        Outcome::Failure(err) => {
            store.update(|s| s.record_error(err.to_string()));
            if let Some(hook) = hooks.on_error {
                hook(&err);
            }
            if throws(hooks.throw_on_error, hooks.on_error.is_some()) {
                Err(err)
            } else {
                Ok(None)
            }
        }
        Outcome::Cancelled => {
            tracing::debug!("execution aborted");
            return Ok(None);
        }
    };
    if let Some(hook) = hooks.on_settled {
        hook(&store.get());
    }
    reply
}

/// Hand a reply to every caller waiting on it. With nobody waiting, a
/// raised error is logged instead of dropped silently.
pub(crate) fn reply_all<T: Clone, E: Clone + Display>(reply: Result<Option<T>, E>, waiters: Vec<Settle<T, E>>, what: &str) {
    if waiters.is_empty() {
        if let Err(err) = &reply {
            tracing::error!(error = %err, "{what} failed");
        }
        return;
    }
    for waiter in waiters {
        let _ = waiter.send(reply.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::lock;

    #[derive(Debug, Clone, Default)]
    struct Counters {
        ok: u32,
        failed: u32,
        last: Option<String>,
    }

    impl Derive for Counters {
        fn derive(&mut self) {}
    }

    impl SettleCounters for Counters {
        fn record_success(&mut self) {
            self.ok += 1;
        }

        fn record_error(&mut self, error: String) {
            self.failed += 1;
            self.last = Some(error);
        }
    }

    fn no_hooks<'a>() -> ResultHooks<'a, u32, String, Counters> {
        ResultHooks {
            on_success: None,
            on_error: None,
            on_settled: None,
            throw_on_error: None,
        }
    }

    #[test]
    fn success_and_failure_are_counted() {
        let store = Store::new(Counters::default());
        assert_eq!(settle(&store, no_hooks(), Outcome::Success(4)), Ok(Some(4)));
        assert_eq!(
            settle(&store, no_hooks(), Outcome::Failure("bad".to_string())),
            Err("bad".to_string())
        );
        assert_eq!(settle(&store, no_hooks(), Outcome::Cancelled), Ok(None));
        let counters = store.get();
        assert_eq!((counters.ok, counters.failed), (1, 1));
        assert_eq!(counters.last.as_deref(), Some("bad"));
    }

    #[test]
    fn error_hook_swallows_by_default() {
        let store = Store::new(Counters::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let on_error: ValueHook<String> = Arc::new(move |e: &String| lock(&sink).push(e.clone()));
        let settled = Arc::new(Mutex::new(0));
        let count = Arc::clone(&settled);
        let on_settled: Hook<Counters> = Arc::new(move |_: &Counters| *lock(&count) += 1);
        let hooks: ResultHooks<'_, u32, String, Counters> = ResultHooks {
            on_success: None,
            on_error: Some(&on_error),
            on_settled: Some(&on_settled),
            throw_on_error: None,
        };
        assert_eq!(settle(&store, hooks, Outcome::Failure("x".to_string())), Ok(None));
        assert_eq!(*lock(&seen), vec!["x".to_string()]);
        assert_eq!(*lock(&settled), 1);
    }
}
