use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

/// Work that is deferred until the session's current transaction completes
#[async_trait]
pub trait TxSynchronization: Send + Sync + 'static {
    /// Called on registration, returning `false` declines registration.
    fn validate(&self, _context: &TransactionContext) -> bool {
        true
    }

    async fn after_commit(&self) {}

    async fn after_rollback(&self) {}
}

/// Outcome of ending a transaction, i.e. what the session has to do to complete it
pub struct TxCompletion {
    pub was_in_transaction: bool,
    /// the transaction can not be committed because the connection was interrupted while it was
    ///  open
    pub failed: bool,
    pub synchronizations: Vec<Arc<dyn TxSynchronization>>,
}

/// Local state of a transacted session's current transaction
#[derive(Default)]
pub struct TransactionContext {
    inner: Mutex<TxInner>,
}

#[derive(Default)]
struct TxInner {
    in_transaction: bool,
    failed: bool,
    synchronizations: Vec<Arc<dyn TxSynchronization>>,
}

impl TransactionContext {
    pub fn new() -> TransactionContext {
        Default::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.lock().in_transaction
    }

    /// returns `true` if this call started a new transaction
    pub fn begin(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.in_transaction {
            return false;
        }
        inner.in_transaction = true;
        inner.failed = false;
        true
    }

    /// Marks the open transaction (if any) as failed: its remote counterpart is gone, so
    ///  completing it can only mean rolling it back.
    pub fn mark_failed(&self) {
        let mut inner = self.inner.lock();
        if inner.in_transaction {
            debug!("transaction failed due to connection interruption");
            inner.failed = true;
        }
    }

    pub fn is_failed(&self) -> bool {
        self.inner.lock().failed
    }

    /// Registers a synchronization with the open transaction. Returns `false` if there is no
    ///  open transaction, or if the synchronization declined to be registered.
    pub fn register_synchronization(&self, sync: Arc<dyn TxSynchronization>) -> bool {
        if !self.in_transaction() {
            return false;
        }
        if !sync.validate(self) {
            return false;
        }
        self.inner.lock().synchronizations.push(sync);
        true
    }

    /// Ends the current transaction, handing out what is needed to complete it
    pub fn complete(&self) -> TxCompletion {
        let mut inner = self.inner.lock();
        let result = TxCompletion {
            was_in_transaction: inner.in_transaction,
            failed: inner.failed,
            synchronizations: std::mem::take(&mut inner.synchronizations),
        };
        inner.in_transaction = false;
        inner.failed = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestSync {
        accept: bool,
    }

    impl TxSynchronization for TestSync {
        fn validate(&self, _context: &TransactionContext) -> bool {
            self.accept
        }
    }

    #[test]
    fn test_register_requires_open_transaction() {
        let context = TransactionContext::new();
        assert!(!context.register_synchronization(Arc::new(TestSync { accept: true })));

        assert!(context.begin());
        assert!(!context.begin());
        assert!(context.register_synchronization(Arc::new(TestSync { accept: true })));
        assert!(!context.register_synchronization(Arc::new(TestSync { accept: false })));

        let completion = context.complete();
        assert!(completion.was_in_transaction);
        assert!(!completion.failed);
        assert_eq!(completion.synchronizations.len(), 1);

        assert!(!context.in_transaction());
        assert_eq!(context.complete().synchronizations.len(), 0);
    }

    #[test]
    fn test_mark_failed() {
        let context = TransactionContext::new();
        context.mark_failed();
        assert!(!context.is_failed());

        context.begin();
        context.mark_failed();
        assert!(context.is_failed());

        let completion = context.complete();
        assert!(completion.failed);
        assert!(!context.is_failed());
    }
}
