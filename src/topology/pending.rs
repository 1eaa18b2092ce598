/// Buffer for operations issued before the topology is usable
///
/// Reads and writes queue separately so the drain can release writes first;
/// a write issued before a read must not be reordered behind it. The buffer
/// is bounded: overflowing it fails every buffered operation at once, on the
/// grounds that a topology this far behind will not serve any of them in
/// useful time.
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

type Waiter = oneshot::Sender<DriverResult<()>>;

#[derive(Default)]
struct Queues {
    writes: VecDeque<Waiter>,
    reads: VecDeque<Waiter>,
}

impl Queues {
    fn len(&self) -> usize {
        self.writes.len() + self.reads.len()
    }
}

pub struct PendingOperationQueue {
    limit: Option<usize>,
    queues: Mutex<Queues>,
}

impl PendingOperationQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            queues: Mutex::new(Queues::default()),
        }
    }

    /// Park one operation until the topology is ready. The returned receiver
    /// yields `Ok(())` when the operation may proceed, or the failure that
    /// voided it.
    pub fn enqueue(&self, kind: OperationKind) -> oneshot::Receiver<DriverResult<()>> {
        let (sender, receiver) = oneshot::channel();
        let overflow = {
            let mut queues = lock(&self.queues);
            match self.limit {
                Some(limit) if queues.len() + 1 > limit => {
                    let Queues { writes, reads } = &mut *queues;
                    let mut drained: Vec<Waiter> =
                        writes.drain(..).chain(reads.drain(..)).collect();
                    drained.push(sender);
                    Some((drained, limit))
                }
                _ => {
                    match kind {
                        OperationKind::Write => queues.writes.push_back(sender),
                        OperationKind::Read => queues.reads.push_back(sender),
                    }
                    None
                }
            }
        };

        if let Some((waiters, limit)) = overflow {
            debug!(
                "Pending buffer limit {} exceeded; failing {} buffered operations",
                limit,
                waiters.len()
            );
            for waiter in waiters {
                let _ = waiter.send(Err(DriverError::PendingLimitExceeded { limit }));
            }
        }
        receiver
    }

    /// Release every buffered operation, writes before reads.
    pub fn drain_ready(&self) {
        let waiters: Vec<Waiter> = {
            let mut queues = lock(&self.queues);
            let Queues { writes, reads } = &mut *queues;
            writes.drain(..).chain(reads.drain(..)).collect()
        };
        if !waiters.is_empty() {
            debug!("Releasing {} buffered operations", waiters.len());
        }
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Fail every buffered operation.
    pub fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> DriverError,
    {
        let waiters: Vec<Waiter> = {
            let mut queues = lock(&self.queues);
            let Queues { writes, reads } = &mut *queues;
            writes.drain(..).chain(reads.drain(..)).collect()
        };
        for waiter in waiters {
            let _ = waiter.send(Err(make_error()));
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.queues).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
