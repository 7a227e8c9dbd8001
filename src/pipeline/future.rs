//! Handle to an image that may still be computing

use crate::buffer::VolumeBuffer;
use crate::executor::{WorkerEvent, WorkerFuture};
use std::time::Duration;

enum Inner {
    Ready(VolumeBuffer),
    Pending(WorkerFuture),
    Done(Option<VolumeBuffer>),
}

/// An image that is either already available or being produced by a
/// private worker run on copies of the operators.
pub struct ImageFuture {
    inner: Inner,
}

impl ImageFuture {
    pub fn ready(buffer: VolumeBuffer) -> Self {
        Self {
            inner: Inner::Ready(buffer),
        }
    }

    pub(crate) fn pending(future: WorkerFuture) -> Self {
        Self {
            inner: Inner::Pending(future),
        }
    }

    /// Block until finished. `Some(true)` on success, `Some(false)` on
    /// failure or cancel, `None` on timeout.
    pub fn wait(&mut self, timeout: Duration) -> Option<bool> {
        let future = match &self.inner {
            Inner::Ready(_) => return Some(true),
            Inner::Done(result) => return Some(result.is_some()),
            Inner::Pending(future) => future,
        };
        let result = match future.wait(timeout)? {
            WorkerEvent::Finished(true) => future.take_result(),
            _ => None,
        };
        let ok = result.is_some();
        self.inner = Inner::Done(result);
        Some(ok)
    }

    pub fn is_finished(&self) -> bool {
        match &self.inner {
            Inner::Pending(future) => !future.is_running(),
            _ => true,
        }
    }

    /// The image, once available
    pub fn result(&self) -> Option<&VolumeBuffer> {
        match &self.inner {
            Inner::Ready(buffer) => Some(buffer),
            Inner::Done(result) => result.as_ref(),
            Inner::Pending(_) => None,
        }
    }

    pub fn into_result(self) -> Option<VolumeBuffer> {
        match self.inner {
            Inner::Ready(buffer) => Some(buffer),
            Inner::Done(result) => result,
            Inner::Pending(_) => None,
        }
    }

    pub fn cancel(&self) {
        if let Inner::Pending(future) = &self.inner {
            future.cancel();
        }
    }
}

impl std::fmt::Debug for ImageFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner {
            Inner::Ready(_) => "ready",
            Inner::Pending(_) => "pending",
            Inner::Done(Some(_)) => "done",
            Inner::Done(None) => "failed",
        };
        f.debug_struct("ImageFuture").field("state", &state).finish()
    }
}
