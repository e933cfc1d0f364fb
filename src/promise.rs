// ABOUTME: Lazy answer (promise) - single-assignment, thread-safe deferred call result
// ABOUTME: first observation forces the wait-loop thunk; concurrent observers rendezvous on it

use crate::bag::Params;
use crate::error::RpcError;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

type Thunk = Box<dyn FnOnce() -> Result<Option<Params>, RpcError> + Send>;

enum State {
    Pending(Thunk),
    Forcing(ThreadId),
    Ready(Result<Option<Params>, Arc<RpcError>>),
}

/// A deferred call result. Creating one never blocks: the enclosing `call`
/// has already put the outbound frame on the wire and registered the
/// receiver slot by the time this is returned. The first call to
/// [`force`](LazyAnswer::force) drives the connection's wait loop for this
/// call's id (identical semantics to a non-lazy `call`, cooperatively taking
/// read-duty if no answer is ready yet); later observers block on the same
/// result rather than re-running the loop.
///
/// Because the underlying error can't cheaply be cloned to every
/// rendezvousing observer, a forced error is shared via `Arc`.
pub struct LazyAnswer {
    shared: Arc<(Mutex<State>, Condvar)>,
}

impl std::fmt::Debug for LazyAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match &*self.shared.0.lock().unwrap() {
            State::Pending(_) => "Pending",
            State::Forcing(_) => "Forcing",
            State::Ready(_) => "Ready",
        };
        f.debug_struct("LazyAnswer").field("state", &label).finish()
    }
}

impl LazyAnswer {
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> Result<Option<Params>, RpcError> + Send + 'static,
    {
        LazyAnswer {
            shared: Arc::new((Mutex::new(State::Pending(Box::new(thunk))), Condvar::new())),
        }
    }

    /// Forces the promise, blocking until a result is available. Idempotent
    /// and safe to call from multiple threads concurrently; a thunk that
    /// tries to force its own promise from within itself fails with
    /// [`RpcError::ReentrantForce`] instead of deadlocking. Resolves to
    /// `Ok(None)` rather than an error if the connection closes cleanly
    /// before an answer arrives.
    pub fn force(&self) -> Result<Option<Params>, Arc<RpcError>> {
        let (mutex, cond) = &*self.shared;
        let mut state = mutex.lock().unwrap();
        loop {
            match &*state {
                State::Ready(result) => return result.clone(),
                State::Forcing(tid) if *tid == std::thread::current().id() => {
                    return Err(Arc::new(RpcError::ReentrantForce));
                }
                State::Forcing(_) => {
                    state = cond.wait(state).unwrap();
                }
                State::Pending(_) => {
                    let thunk = match std::mem::replace(&mut *state, State::Forcing(std::thread::current().id())) {
                        State::Pending(thunk) => thunk,
                        _ => unreachable!(),
                    };
                    drop(state);
                    let result = thunk().map_err(Arc::new);
                    state = mutex.lock().unwrap();
                    *state = State::Ready(result.clone());
                    cond.notify_all();
                    return result;
                }
            }
        }
    }

    /// True once a result has been computed (does not force).
    pub fn is_ready(&self) -> bool {
        matches!(&*self.shared.0.lock().unwrap(), State::Ready(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn force_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let p = LazyAnswer::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            let mut bag = Params::new();
            bag.insert("ok", "yes");
            Ok(Some(bag))
        });
        assert!(!p.is_ready());
        let first = p.force().unwrap().unwrap();
        let second = p.force().unwrap().unwrap();
        assert_eq!(first.get_str("ok"), Some("yes"));
        assert_eq!(second.get_str("ok"), Some("yes"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_observers_rendezvous_on_one_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let p = Arc::new(LazyAnswer::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            let mut bag = Params::new();
            bag.insert("ok", "yes");
            Ok(Some(bag))
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let p = p.clone();
                std::thread::spawn(move || p.force().unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap().get_str("ok"), Some("yes"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn errors_are_shared_across_observers() {
        let p = LazyAnswer::new(|| Err(RpcError::ConnectionDetached));
        let e1 = p.force().unwrap_err();
        let e2 = p.force().unwrap_err();
        assert!(Arc::ptr_eq(&e1, &e2));
    }
}
