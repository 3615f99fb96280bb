//! Bounded result queue drained by a single long-lived consumer.
//!
//! Producers (transaction executions) block when the queue is full, which
//! bounds the number of in-flight scratch overlays to the queue capacity.
//! Items are handed to the callback in push order. The pipeline itself has no
//! policy: validation and commit ordering belong to the callback.

use crate::error::PipelineError;
use crossbeam::channel::{bounded, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Capacity of the result queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Cloneable producer handle for a [`ResultPipeline`].
#[derive(Debug)]
pub struct ResultSender<T> {
    sender: Sender<T>,
}

impl<T> Clone for ResultSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> ResultSender<T> {
    /// Enqueues an item, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), PipelineError> {
        self.sender.send(item).map_err(|_| PipelineError::Closed)
    }
}

/// A bounded queue plus exactly one consumer thread.
pub struct ResultPipeline<T> {
    sender: Option<Sender<T>>,
    consumer: Option<JoinHandle<()>>,
    capacity: usize,
}

impl<T: Send + 'static> ResultPipeline<T> {
    /// Starts the consumer thread.
    ///
    /// `callback` runs on the consumer for every item, one at a time, so any
    /// state it owns needs no locking.
    pub fn start<F>(capacity: usize, mut callback: F) -> Result<Self, PipelineError>
    where
        F: FnMut(T) + Send + 'static,
    {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded::<T>(capacity);
        let consumer = thread::Builder::new()
            .name("result-drain".to_string())
            .spawn(move || {
                for item in receiver.iter() {
                    callback(item);
                }
                debug!("result queue closed, consumer exiting");
            })?;

        Ok(Self {
            sender: Some(sender),
            consumer: Some(consumer),
            capacity,
        })
    }
}

impl<T> ResultPipeline<T> {
    /// Enqueues an item, blocking while the queue is full.
    pub fn push(&self, item: T) -> Result<(), PipelineError> {
        match &self.sender {
            Some(sender) => sender.send(item).map_err(|_| PipelineError::Closed),
            None => Err(PipelineError::Closed),
        }
    }

    /// Returns a producer handle, or `None` after shutdown.
    pub fn sender(&self) -> Option<ResultSender<T>> {
        self.sender.as_ref().map(|sender| ResultSender {
            sender: sender.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items waiting for the consumer.
    pub fn len(&self) -> usize {
        self.sender.as_ref().map_or(0, Sender::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue, lets the consumer drain what is left, and joins it.
    ///
    /// The consumer only exits once every [`ResultSender`] is dropped as well.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        self.close()
    }

    fn close(&mut self) -> Result<(), PipelineError> {
        drop(self.sender.take());
        match self.consumer.take() {
            Some(consumer) => consumer.join().map_err(|_| {
                error!("result consumer panicked");
                PipelineError::ConsumerPanicked
            }),
            None => Ok(()),
        }
    }
}

impl<T> Drop for ResultPipeline<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
