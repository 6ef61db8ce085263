//! Transaction engine (C9): ordered operation execution with compensating
//! rollback, bounded retries, and timeouts, serialized behind a single
//! FIFO writer per database handle (spec §4.9, §5).

use crate::error::{DbError, Result};
use crate::wal::{OpIntent, WriteAheadLog};
use crate::storage::StorageBackend;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A boxed, `Send` future, used where `async fn` in a trait object would
/// otherwise be needed.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A closure that reverses a prior operation's effect. Must be safe to run
/// more than once (spec §9 "Transaction compensations") — the rollback path
/// retries a failing compensation up to [`TransactionConfig::max_rollback_retries`]
/// times, so it is stored as a shareable `Fn`, not a one-shot `FnOnce`.
pub type Compensation = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A single step of a transaction: a named intent (for the WAL) and the
/// closure that performs it, producing a compensation if it succeeds.
pub struct Operation {
    pub name: String,
    pub args: serde_json::Value,
    execute: Box<dyn FnOnce() -> BoxFuture<'static, Result<Compensation>> + Send>,
}

impl Operation {
    /// Build an operation from its WAL-visible name/args and its execution
    /// closure. `execute` returns the compensation for its own effect.
    pub fn new<F>(name: impl Into<String>, args: serde_json::Value, execute: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<Compensation>> + Send + 'static,
    {
        Self {
            name: name.into(),
            args,
            execute: Box::new(execute),
        }
    }
}

/// Lifecycle state of a [`Transaction`] (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Executing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxState {
    fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

/// An ordered sequence of operations executed atomically by a
/// [`TransactionEngine`].
pub struct Transaction {
    pub id: String,
    operations: Vec<Operation>,
    state: TxState,
}

impl Transaction {
    /// Start a new, empty transaction in the `Pending` state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operations: Vec::new(),
            state: TxState::Pending,
        }
    }

    /// Append an operation. Fails if the transaction has already started
    /// executing or reached a terminal state.
    pub fn add_operation(&mut self, op: Operation) -> Result<()> {
        if self.state != TxState::Pending {
            return Err(DbError::InvalidTransactionState(format!(
                "cannot add an operation to a transaction in state {:?}",
                self.state
            )));
        }
        self.operations.push(op);
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TxState {
        self.state
    }
}

/// Tunables for [`TransactionEngine`], defaults per spec §4.9.
#[derive(Debug, Clone, Copy)]
pub struct TransactionConfig {
    pub max_rollback_retries: usize,
    pub default_timeout: Option<Duration>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_rollback_retries: 3,
            default_timeout: None,
        }
    }
}

/// Cooperative cancellation signal: checked between operations, never
/// interrupting one already running (spec §5 "Cancellation").
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single-writer, WAL-backed execution engine. Transactions from different
/// callers are serialized through `writer_lock`; reads elsewhere in the
/// database proceed concurrently and are unaffected by it.
pub struct TransactionEngine<S: StorageBackend> {
    wal: Arc<WriteAheadLog<S>>,
    config: TransactionConfig,
    writer_lock: Mutex<()>,
}

impl<S: StorageBackend> TransactionEngine<S> {
    pub fn new(wal: Arc<WriteAheadLog<S>>, config: TransactionConfig) -> Self {
        Self {
            wal,
            config,
            writer_lock: Mutex::new(()),
        }
    }

    /// Execute `tx` to completion: append WAL intent, run operations in
    /// order, and either commit or roll back. Mutates `tx.state` in place.
    ///
    /// `timeout` overrides [`TransactionConfig::default_timeout`] for this
    /// call only. `cancel`, if supplied, is polled between operations.
    pub async fn execute(
        &self,
        tx: &mut Transaction,
        timeout: Option<Duration>,
        cancel: Option<CancelSignal>,
    ) -> Result<()> {
        if tx.state.is_terminal() {
            return Err(DbError::InvalidTransactionState(format!(
                "transaction {} already reached a terminal state ({:?})",
                tx.id, tx.state
            )));
        }
        if tx.state != TxState::Pending {
            return Err(DbError::InvalidTransactionState(format!(
                "transaction {} is not pending (state {:?})",
                tx.id, tx.state
            )));
        }
        let _writer = self.writer_lock.lock().await;
        tx.state = TxState::Executing;
        tracing::debug!(tx_id = %tx.id, "transaction executing");

        let intents: Vec<OpIntent> = tx
            .operations
            .iter()
            .map(|op| OpIntent {
                op: op.name.clone(),
                args: op.args.clone(),
            })
            .collect();
        let lsn = self.wal.append_intent(&tx.id, intents).await?;

        let effective_timeout = timeout.or(self.config.default_timeout);
        let run = self.run_operations(tx, cancel);
        let outcome = match effective_timeout {
            Some(d) => match tokio::time::timeout(d, run).await {
                Ok(result) => result,
                Err(_) => Err(OperationsFailure::Timeout),
            },
            None => run.await,
        };

        match outcome {
            Ok(()) => {
                self.wal.mark_committed(lsn).await?;
                tx.state = TxState::Committed;
                tracing::debug!(tx_id = %tx.id, "transaction committed");
                Ok(())
            }
            Err(OperationsFailure::OpError(completed, err)) => {
                self.rollback(tx, completed).await;
                self.wal.mark_aborted(lsn).await?;
                tx.state = TxState::RolledBack;
                Err(err)
            }
            Err(OperationsFailure::Timeout) => {
                // The timed-out future was dropped by `tokio::time::timeout`
                // before it could report which compensations it collected;
                // conservatively run none beyond what already committed to
                // state outside the closures (callers' `execute` closures
                // must not leave partial effects visible without returning
                // a compensation first).
                self.wal.mark_aborted(lsn).await?;
                tx.state = TxState::RolledBack;
                Err(DbError::TransactionTimeout(effective_timeout.unwrap_or_default()))
            }
            Err(OperationsFailure::Cancelled(completed)) => {
                self.rollback(tx, completed).await;
                self.wal.mark_aborted(lsn).await?;
                tx.state = TxState::RolledBack;
                Err(DbError::InvalidTransactionState(format!(
                    "transaction {} cancelled",
                    tx.id
                )))
            }
        }
    }

    async fn run_operations(
        &self,
        tx: &mut Transaction,
        cancel: Option<CancelSignal>,
    ) -> std::result::Result<(), OperationsFailure> {
        let mut completed: Vec<Compensation> = Vec::with_capacity(tx.operations.len());
        for op in tx.operations.drain(..) {
            if let Some(sig) = &cancel {
                if sig.is_cancelled() {
                    return Err(OperationsFailure::Cancelled(completed));
                }
            }
            let name = op.name.clone();
            match (op.execute)().await {
                Ok(compensation) => completed.push(compensation),
                Err(err) => {
                    tracing::warn!(tx_id = %tx.id, op = %name, error = %err, "operation failed, rolling back");
                    return Err(OperationsFailure::OpError(completed, err));
                }
            }
        }
        Ok(())
    }

    /// Run recorded compensations in reverse order, retrying each up to
    /// `max_rollback_retries` times. A compensation that still fails after
    /// retries is logged but does not block the remaining rollbacks (spec
    /// §4.9).
    async fn rollback(&self, tx: &Transaction, completed: Vec<Compensation>) {
        tx_state_rolling_back(tx);
        for compensation in completed.into_iter().rev() {
            let mut last_err = None;
            for attempt in 0..=self.config.max_rollback_retries {
                match compensation().await {
                    Ok(()) => {
                        last_err = None;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(tx_id = %tx.id, attempt, error = %err, "rollback compensation attempt failed");
                        last_err = Some(err);
                    }
                }
            }
            if let Some(err) = last_err {
                tracing::error!(tx_id = %tx.id, error = %err, "rollback compensation failed after retries");
            }
        }
    }
}

fn tx_state_rolling_back(tx: &Transaction) {
    tracing::debug!(tx_id = %tx.id, "transaction rolling back");
}

enum OperationsFailure {
    OpError(Vec<Compensation>, DbError),
    Timeout,
    Cancelled(Vec<Compensation>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use crate::wal::FlushStrategy;
    use std::sync::atomic::AtomicUsize;

    async fn engine() -> TransactionEngine<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        let wal = Arc::new(
            WriteAheadLog::open(backend, FlushStrategy::PerOperation)
                .await
                .unwrap(),
        );
        TransactionEngine::new(wal, TransactionConfig::default())
    }

    #[tokio::test]
    async fn successful_transaction_commits() {
        let engine = engine().await;
        let applied = Arc::new(AtomicUsize::new(0));
        let a2 = applied.clone();
        let mut tx = Transaction::new("tx1");
        tx.add_operation(Operation::new("inc", serde_json::json!({}), move || {
            Box::pin(async move {
                a2.fetch_add(1, Ordering::SeqCst);
                let c: Compensation = Arc::new(|| Box::pin(async { Ok(()) }));
                Ok(c)
            })
        }))
        .unwrap();
        engine.execute(&mut tx, None, None).await.unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_operation_rolls_back_prior_ones() {
        let engine = engine().await;
        let rolled_back = Arc::new(AtomicUsize::new(0));
        let rb2 = rolled_back.clone();
        let mut tx = Transaction::new("tx2");
        tx.add_operation(Operation::new("ok", serde_json::json!({}), move || {
            Box::pin(async move {
                let c: Compensation = Arc::new(move || {
                    let rb3 = rb2.clone();
                    Box::pin(async move {
                        rb3.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                });
                Ok(c)
            })
        }))
        .unwrap();
        tx.add_operation(Operation::new("fails", serde_json::json!({}), || {
            Box::pin(async { Err(DbError::InvalidInput("boom".into())) })
        }))
        .unwrap();

        let err = engine.execute(&mut tx, None, None).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput(_)));
        assert_eq!(tx.state(), TxState::RolledBack);
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reexecuting_terminal_transaction_is_rejected() {
        let engine = engine().await;
        let mut tx = Transaction::new("tx3");
        tx.add_operation(Operation::new("noop", serde_json::json!({}), || {
            Box::pin(async { Ok(Arc::new(|| Box::pin(async { Ok(()) }) as BoxFuture<'static, Result<()>>) as Compensation) })
        }))
        .unwrap();
        engine.execute(&mut tx, None, None).await.unwrap();
        let err = engine.execute(&mut tx, None, None).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTransactionState(_)));
    }

    #[tokio::test]
    async fn timeout_triggers_rollback_state() {
        let engine = engine().await;
        let mut tx = Transaction::new("tx4");
        tx.add_operation(Operation::new("slow", serde_json::json!({}), || {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let c: Compensation = Arc::new(|| Box::pin(async { Ok(()) }));
                Ok(c)
            })
        }))
        .unwrap();
        let err = engine
            .execute(&mut tx, Some(Duration::from_millis(1)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::TransactionTimeout(_)));
        assert_eq!(tx.state(), TxState::RolledBack);
    }

    #[tokio::test]
    async fn adding_operation_after_execution_fails() {
        let engine = engine().await;
        let mut tx = Transaction::new("tx5");
        engine.execute(&mut tx, None, None).await.unwrap();
        let err = tx
            .add_operation(Operation::new("late", serde_json::json!({}), || {
                Box::pin(async { Ok(Arc::new(|| Box::pin(async { Ok(()) }) as BoxFuture<'static, Result<()>>) as Compensation) })
            }))
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidTransactionState(_)));
    }
}
