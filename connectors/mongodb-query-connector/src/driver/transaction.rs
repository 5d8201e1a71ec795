//! Transaction finalization handle.

use crate::context::{self, ContextData};
use crate::driver::SessionHandle;
use crate::error::{Error, Result};

/// A started transaction. Created by [`Driver::begin_transaction`]
/// (entering the ambient context on the way in); `commit` and `rollback`
/// finalize the backend transaction and exit the context exactly once.
///
/// [`Driver::begin_transaction`]: crate::driver::Driver::begin_transaction
pub struct Transaction {
    session: SessionHandle,
    finished: bool,
}

impl Transaction {
    /// Enter the ambient context with the session and hand out the
    /// finalization handle. The backend transaction must already be
    /// started on the session, if there is one.
    pub fn start(session: SessionHandle) -> Self {
        context::enter(ContextData::with_session(session.clone()));
        Transaction {
            session,
            finished: false,
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Commit and exit the context. Further calls are no-ops. A commit
    /// failure triggers a best-effort abort (its own error ignored) before
    /// surfacing as a finalization error.
    pub async fn commit(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let outcome = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) => session.commit_transaction().await,
                None => Ok(()),
            }
        };

        context::exit();

        match outcome {
            Ok(()) => Ok(()),
            Err(commit_error) => {
                let mut guard = self.session.lock().await;
                if let Some(session) = guard.as_mut() {
                    if let Err(abort_error) = session.abort_transaction().await {
                        tracing::warn!(
                            error = %abort_error,
                            "rollback after failed commit also failed"
                        );
                    }
                }
                Err(Error::TransactionFinalization(commit_error))
            }
        }
    }

    /// Abort and exit the context. Further calls are no-ops.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let outcome = {
            let mut guard = self.session.lock().await;
            match guard.as_mut() {
                Some(session) => session.abort_transaction().await,
                None => Ok(()),
            }
        };

        context::exit();
        outcome.map_err(Error::Backend)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("transaction dropped without commit or rollback");
            context::exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;

    #[tokio::test]
    async fn commit_exits_the_context_exactly_once() {
        context::attach(async {
            let mut tx = Transaction::start(SessionHandle::detached());
            assert!(context::session().is_some());

            tx.commit().await.unwrap();
            assert!(context::session().is_none());

            // Repeated finalization is a safe no-op.
            tx.commit().await.unwrap();
            tx.rollback().await.unwrap();
            assert!(context::session().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn rollback_exits_the_context() {
        context::attach(async {
            let mut tx = Transaction::start(SessionHandle::detached());
            tx.rollback().await.unwrap();
            assert!(context::session().is_none());
        })
        .await;
    }

    #[tokio::test]
    async fn dropping_an_unfinished_transaction_releases_the_scope() {
        context::attach(async {
            {
                let _tx = Transaction::start(SessionHandle::detached());
                assert!(context::session().is_some());
            }
            assert!(context::session().is_none());
        })
        .await;
    }
}
