//! Operation-level serialization
//!
//! Unlike the task guard, which rejects a second submission, these locks make
//! callers of the same operation wait their turn.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::lock::Mutex as AsyncMutex;
use tracing::trace;

/// Named async locks, one per operation
#[derive(Default)]
pub struct OperationLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl OperationLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, operation: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(operation.to_string()).or_default().clone()
    }

    /// Run `fut` while holding the lock for `operation`
    pub async fn serialized<T, F>(&self, operation: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.lock_for(operation);
        let _guard = lock.lock().await;
        trace!(operation, "operation lock acquired");
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_same_operation_queues() {
        smol::block_on(async {
            let locks = Arc::new(OperationLocks::new());
            let inside = Arc::new(AtomicUsize::new(0));
            let max_inside = Arc::new(AtomicUsize::new(0));

            let tasks: Vec<_> = (0..4)
                .map(|_| {
                    let locks = locks.clone();
                    let inside = inside.clone();
                    let max_inside = max_inside.clone();
                    smol::spawn(async move {
                        locks
                            .serialized("recover", async {
                                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                                max_inside.fetch_max(now, Ordering::SeqCst);
                                smol::Timer::after(std::time::Duration::from_millis(5)).await;
                                inside.fetch_sub(1, Ordering::SeqCst);
                            })
                            .await
                    })
                })
                .collect();

            for task in tasks {
                task.await;
            }

            // Every caller ran, one at a time
            assert_eq!(max_inside.load(Ordering::SeqCst), 1);
            assert_eq!(inside.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_different_operations_do_not_block() {
        smol::block_on(async {
            let locks = OperationLocks::new();
            let value = locks
                .serialized("precheck", locks.serialized("recover", async { 7 }))
                .await;
            assert_eq!(value, 7);
        });
    }
}
