// SPDX-License-Identifier: Apache-2.0

//! Errors for the dispatch queues.
//!
//! Important note: errors carrying the rejected item must stay `Send` so the
//! caller can recover the item from any step-execution task.

/// Errors that can occur enqueueing an item.
#[derive(thiserror::Error, Debug)]
pub enum EnqueueError<T> {
    /// The queue set is cancelled and accepts no new items.
    #[error("The dispatch queues are cancelled and the item could not be enqueued")]
    Cancelled(T),
}

impl<T> EnqueueError<T> {
    /// Returns the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Cancelled(item) => item,
        }
    }
}
