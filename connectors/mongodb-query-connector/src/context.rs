//! Ambient transaction context.
//!
//! A per-task scope stack carrying the active session handle. The storage
//! is task-local, not thread-local: a logical task keeps its context across
//! `await` suspension, and unrelated concurrent tasks see disjoint stacks.
//!
//! Imperative `enter`/`exit` (used by the transaction handle) require the
//! task to have storage installed, via [`attach`] or [`scope`]. Without
//! storage, `enter` is a warned no-op and reads simply see no session.

use crate::driver::SessionHandle;
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static STORE: RefCell<Vec<ContextData>>;
}

/// One context scope. The key set is small and fixed; `session` is the only
/// key the core itself reads.
#[derive(Clone, Default)]
pub struct ContextData {
    pub session: Option<SessionHandle>,
}

impl ContextData {
    pub fn with_session(session: SessionHandle) -> Self {
        ContextData {
            session: Some(session),
        }
    }
}

/// Install empty root storage for the task and run the future inside it.
pub async fn attach<F: Future>(future: F) -> F::Output {
    STORE.scope(RefCell::new(Vec::new()), future).await
}

/// Push a scope onto the current task's stack.
pub fn enter(data: ContextData) {
    let pushed = STORE
        .try_with(|store| {
            store.borrow_mut().push(data);
        })
        .is_ok();

    if !pushed {
        tracing::warn!("transaction context entered outside task storage, ignoring");
    }
}

/// Pop the innermost scope.
pub fn exit() {
    let _ = STORE.try_with(|store| {
        store.borrow_mut().pop();
    });
}

/// The innermost session on the stack, scanning outward so child scopes
/// inherit what they do not shadow.
pub fn session() -> Option<SessionHandle> {
    STORE
        .try_with(|store| {
            store
                .borrow()
                .iter()
                .rev()
                .find_map(|data| data.session.clone())
        })
        .ok()
        .flatten()
}

/// Write the session into the innermost scope only.
pub fn set_session(session: SessionHandle) {
    let _ = STORE.try_with(|store| {
        if let Some(innermost) = store.borrow_mut().last_mut() {
            innermost.session = Some(session);
        }
    });
}

/// Run the future inside a fresh scope, exiting on every path. Installs
/// root storage when the task has none yet.
pub async fn scope<F: Future>(data: ContextData, future: F) -> F::Output {
    if STORE.try_with(|_| ()).is_ok() {
        enter(data);
        let _guard = ExitGuard;
        future.await
    } else {
        STORE
            .scope(RefCell::new(vec![data]), future)
            .await
    }
}

/// Pops the scope pushed by [`scope`] even when the future is dropped
/// mid-flight.
struct ExitGuard;

impl Drop for ExitGuard {
    fn drop(&mut self) {
        exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SessionHandle;

    #[tokio::test]
    async fn concurrent_tasks_observe_disjoint_sessions() {
        let task = |name: &'static str| async move {
            let handle = SessionHandle::detached();
            scope(ContextData::with_session(handle.clone()), async move {
                tokio::task::yield_now().await;
                let seen = session().expect("session in scope");
                assert!(seen.is_same(&handle), "task {name} saw a foreign session");
            })
            .await;
        };

        let (a, b) = tokio::join!(tokio::spawn(task("a")), tokio::spawn(task("b")));
        a.unwrap();
        b.unwrap();
    }

    #[tokio::test]
    async fn nested_scopes_inherit_and_shadow() {
        let outer = SessionHandle::detached();
        let inner = SessionHandle::detached();

        scope(ContextData::with_session(outer.clone()), async {
            // A scope without its own session inherits the outer one.
            scope(ContextData::default(), async {
                assert!(session().unwrap().is_same(&outer));
            })
            .await;

            // A scope with a session shadows the outer one.
            scope(ContextData::with_session(inner.clone()), async {
                assert!(session().unwrap().is_same(&inner));
            })
            .await;

            assert!(session().unwrap().is_same(&outer));
        })
        .await;
    }

    #[tokio::test]
    async fn imperative_enter_and_exit_bracket_the_session() {
        attach(async {
            assert!(session().is_none());

            let handle = SessionHandle::detached();
            enter(ContextData::with_session(handle.clone()));
            assert!(session().unwrap().is_same(&handle));

            exit();
            assert!(session().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn enter_without_storage_is_a_no_op() {
        enter(ContextData::with_session(SessionHandle::detached()));
        assert!(session().is_none());
    }

    #[tokio::test]
    async fn set_session_writes_the_innermost_scope_only() {
        let late = SessionHandle::detached();

        attach(async {
            enter(ContextData::default());
            enter(ContextData::default());
            set_session(late.clone());
            assert!(session().unwrap().is_same(&late));

            exit();
            assert!(session().is_none());
        })
        .await;
    }
}
