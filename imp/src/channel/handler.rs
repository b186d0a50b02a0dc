// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

use crate::{FrameInfo, Result};

/// Algorithm plugged into an analysis channel.
///
/// `process` runs on the producer's thread for every frame delivered to a
/// running channel, and each success makes one result available to
/// [`crate::ChannelTable::poll_result`]. All methods run under the channel's
/// lock, so an implementation never sees two calls at once.
pub trait ChannelHandler: Send {
    /// Value handed out by [`Self::get_result`].
    type Output: Send;

    /// Analyzes one frame.
    fn process(&mut self, frame: &FrameInfo) -> Result<()>;

    /// Fetches the result of the most recently processed frame.
    fn get_result(&mut self) -> Result<Self::Output>;

    /// Called once when the channel is created. Failure aborts creation.
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the channel is destroyed, after its worker has stopped.
    fn exit(&mut self) {}

    /// Returns a result obtained from [`Self::get_result`].
    fn release_result(&mut self, _result: Self::Output) -> Result<()> {
        Ok(())
    }

    /// Discards buffered partial results. Called when the channel stops.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
