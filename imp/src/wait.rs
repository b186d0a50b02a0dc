// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Blocking primitives shared by pools and channels.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::{Error, Result};

/// How long a blocking call may suspend the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Check once and return [`Error::Timeout`] immediately if nothing is ready.
    NoWait,
    /// Block until the resource becomes available.
    Forever,
    /// Block for at most the given duration.
    Timeout(Duration),
}

impl WaitMode {
    /// Interprets a millisecond count the way the C API does: `0` polls,
    /// negative values block indefinitely and positive values are a deadline.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use imp::WaitMode;
    ///
    /// assert_eq!(WaitMode::from_millis(0), WaitMode::NoWait);
    /// assert_eq!(WaitMode::from_millis(-1), WaitMode::Forever);
    /// assert_eq!(
    ///     WaitMode::from_millis(40),
    ///     WaitMode::Timeout(Duration::from_millis(40))
    /// );
    /// ```
    pub fn from_millis(ms: i32) -> Self {
        match ms {
            0 => WaitMode::NoWait,
            ms if ms < 0 => WaitMode::Forever,
            ms => WaitMode::Timeout(Duration::from_millis(ms.unsigned_abs().into())),
        }
    }
}

impl From<Duration> for WaitMode {
    fn from(timeout: Duration) -> Self {
        if timeout.is_zero() {
            WaitMode::NoWait
        } else {
            WaitMode::Timeout(timeout)
        }
    }
}

impl From<i32> for WaitMode {
    fn from(ms: i32) -> Self {
        WaitMode::from_millis(ms)
    }
}

/// Receives one item from `rx` honouring `wait`.
///
/// A disconnected channel is reported as [`Error::Other`] so callers can tell
/// a torn-down queue from an ordinary timeout.
pub(crate) fn recv_with<T>(rx: &Receiver<T>, wait: WaitMode) -> Result<T> {
    match wait {
        WaitMode::NoWait => rx.try_recv().map_err(|e| match e {
            TryRecvError::Empty => Error::Timeout,
            TryRecvError::Disconnected => Error::Other("Queue closed.".to_string()),
        }),
        WaitMode::Forever => rx
            .recv()
            .map_err(|_| Error::Other("Queue closed.".to_string())),
        WaitMode::Timeout(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => Error::Timeout,
            RecvTimeoutError::Disconnected => Error::Other("Queue closed.".to_string()),
        }),
    }
}

/// Counting semaphore built on an unbounded token channel.
///
/// Each token in the channel is one unit of the count. Closing drops the
/// sending half: waiters drain the remaining tokens and then fail instead of
/// blocking, and later posts are ignored.
pub(crate) struct Semaphore {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl Semaphore {
    pub(crate) fn new(initial: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let semaphore = Self {
            tx: Mutex::new(Some(tx)),
            rx,
        };
        for _ in 0..initial {
            semaphore.post();
        }
        semaphore
    }

    /// Increments the count, waking one waiter if any.
    pub(crate) fn post(&self) {
        if let Some(tx) = self.tx.lock().as_ref() {
            // The receiver lives in `self`; sending cannot fail.
            let _ = tx.send(());
        }
    }

    /// Decrements the count, suspending according to `wait` while it is zero.
    ///
    /// Fails with [`Error::Other`] once the semaphore is closed and drained.
    pub(crate) fn wait(&self, wait: WaitMode) -> Result<()> {
        recv_with(&self.rx, wait)
    }

    /// Wakes every blocked waiter with an error.
    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    /// Current count.
    pub(crate) fn available(&self) -> usize {
        self.rx.len()
    }
}
