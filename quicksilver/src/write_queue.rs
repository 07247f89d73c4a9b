//! The background write queue.
//!
//! Mutations don't run on the caller's thread: they are enqueued here and a
//! single worker executes them in FIFO order, which is what makes "at most
//! one writer" hold without any writer-side locking discipline.  Reads get
//! read-your-writes coherency by calling
//! [WriteQueue::wait_for_outstanding_operations] first.
//!
//! The drain barrier has one subtlety: a waiter must observe that everything
//! enqueued *before its call* has finished, without operations racing in
//! behind its back and extending the wait forever.  While a wait is in
//! progress an intercept buffer replaces the direct enqueue path; once the
//! worker quiesces the buffer is flushed into the real queue in order, so
//! anything submitted during the quiesce window lands after the observation
//! point.
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;
use crossbeam::channel as chan;
use log::*;

use crate::io_handle::IoHandle;
use crate::statement::Statement;
use crate::value::SqlValue;

/// One queued operation.
pub(crate) enum WriteOp {
    /// Run a mutating statement under the database lock.
    Sql {
        handle: Arc<IoHandle>,
        statement: Statement,
        args: Vec<SqlValue>,
    },

    /// Commit, optionally renewing the transaction.
    Commit { handle: Arc<IoHandle>, renew: bool },

    /// Stop the worker.  Internal; enqueued exactly once, by shutdown.
    Shutdown,
}

impl WriteOp {
    fn run(&self) {
        match self {
            WriteOp::Sql {
                handle,
                statement,
                args,
            } => {
                // Failures are already counted and logged by the handle.
                handle.update(statement, args);
            }
            WriteOp::Commit { handle, renew } => {
                handle.commit(*renew);
            }
            WriteOp::Shutdown => {}
        }
    }
}

/// The enqueue path.  Guarded by its own mutex (the add lock); while a drain
/// is waiting, `intercept` buffers new arrivals instead of the channel.
struct SendState {
    channel: chan::Sender<WriteOp>,
    intercept: Option<Vec<WriteOp>>,
}

/// Count of operations handed to the worker and not yet completed.
struct OutstandingState {
    count: Mutex<u64>,
    quiesced: Condvar,
}

impl OutstandingState {
    fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.quiesced.notify_all();
        }
    }

    fn wait_for_zero(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.quiesced.wait(count).unwrap();
        }
    }
}

pub(crate) struct WriteQueue {
    sender: Mutex<SendState>,

    /// Serializes waiters so their observation points don't interleave.
    wait_lock: Mutex<()>,

    outstanding: Arc<OutstandingState>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

fn worker_thread(receiver: chan::Receiver<WriteOp>, outstanding: Arc<OutstandingState>) {
    for op in receiver.iter() {
        let stop = matches!(op, WriteOp::Shutdown);
        op.run();
        outstanding.decrement();
        if stop {
            break;
        }
    }
    debug!("Write queue worker stopped");
}

impl WriteQueue {
    pub(crate) fn new() -> Result<WriteQueue> {
        let (sender, receiver) = chan::unbounded();
        let outstanding = Arc::new(OutstandingState {
            count: Mutex::new(0),
            quiesced: Condvar::new(),
        });

        let worker_outstanding = outstanding.clone();
        let worker = std::thread::Builder::new()
            .name("quicksilver write queue".into())
            .spawn(move || worker_thread(receiver, worker_outstanding))?;

        Ok(WriteQueue {
            sender: Mutex::new(SendState {
                channel: sender,
                intercept: None,
            }),
            wait_lock: Mutex::new(()),
            outstanding,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub(crate) fn enqueue(&self, op: WriteOp) {
        let mut sender = self.sender.lock().unwrap();
        if let Some(buffer) = sender.intercept.as_mut() {
            buffer.push(op);
            return;
        }

        self.outstanding.increment();
        if sender.channel.send(op).is_err() {
            // Worker is gone; nothing will ever run this.
            self.outstanding.decrement();
            warn!("Operation enqueued after the write queue shut down; dropped");
        }
    }

    /// Block until every operation enqueued before this call has completed.
    ///
    /// Operations submitted by other threads while the wait is in progress
    /// are buffered and re-enqueued, in order, after the observation point;
    /// they do not extend the wait.
    pub(crate) fn wait_for_outstanding_operations(&self) {
        let _serial = self.wait_lock.lock().unwrap();

        {
            let mut sender = self.sender.lock().unwrap();
            sender.intercept = Some(Vec::new());
        }

        // The add lock is dropped here: producers may keep submitting, into
        // the buffer, while we wait.
        self.outstanding.wait_for_zero();

        let mut sender = self.sender.lock().unwrap();
        let buffered = sender.intercept.take().unwrap_or_default();
        for op in buffered {
            self.outstanding.increment();
            if sender.channel.send(op).is_err() {
                self.outstanding.decrement();
                warn!("Operation buffered across shutdown; dropped");
            }
        }
    }

    /// Operations enqueued and not yet completed.  Excludes anything sitting
    /// in an intercept buffer.
    pub(crate) fn outstanding_operations(&self) -> u64 {
        *self.outstanding.count.lock().unwrap()
    }

    /// Stop the worker after everything currently queued has run.
    pub(crate) fn shutdown(&self) {
        self.enqueue(WriteOp::Shutdown);
        let worker = self.worker.lock().unwrap().take();
        if let Some(handle) = worker {
            if handle.join().is_err() {
                error!("Write queue worker panicked");
            }
        }
    }
}
