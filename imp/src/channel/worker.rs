// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Per-channel worker threads.

use std::{
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::{Error, Result};

/// A channel's execution context.
///
/// Frames are processed on the producer's thread, so the worker only waits
/// for cancellation, waking every `idle` interval. Dropping the cancel sender
/// wakes it immediately.
pub(crate) struct Worker {
    channel: usize,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(channel: usize, idle: Duration) -> Result<Self> {
        let (cancel, cancelled) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(format!("imp-chn{channel}"))
            .spawn(move || idle_loop(channel, &cancelled, idle))
            .map_err(|e| {
                Error::Other(format!("Failed to start worker for channel {channel}: {e}"))
            })?;
        Ok(Self {
            channel,
            cancel: Some(cancel),
            handle: Some(handle),
        })
    }

    /// Cancels the worker and waits for it to exit.
    pub(crate) fn stop(mut self) -> Result<()> {
        self.stop_inner()
    }

    fn stop_inner(&mut self) -> Result<()> {
        drop(self.cancel.take());
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| {
                Error::Other(format!("Worker for channel {} panicked.", self.channel))
            }),
            None => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(e) = self.stop_inner() {
            error!(channel = self.channel, error = %e, "Failed to stop worker.");
        }
    }
}

fn idle_loop(channel: usize, cancelled: &Receiver<()>, idle: Duration) {
    debug!(channel, "Worker started.");
    loop {
        match cancelled.recv_timeout(idle) {
            Err(RecvTimeoutError::Timeout) => trace!(channel, "Worker idle."),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(channel, "Worker stopped.");
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn stop_does_not_wait_for_idle_interval() {
        let worker = Worker::spawn(0, Duration::from_secs(5)).unwrap();
        let start = Instant::now();
        worker.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn drop_joins_the_thread() {
        let worker = Worker::spawn(1, Duration::from_millis(5)).unwrap();
        thread::sleep(Duration::from_millis(20));
        drop(worker);
    }
}
