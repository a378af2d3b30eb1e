// Buffer draining for the frame-ready handler
//
// The stream hands buffers out and expects every one of them back before it
// can reuse it. Only the newest buffer is worth delivering; older ones go
// straight back so the stream never runs dry.

use tracing::trace;

/// A stream's buffer queue
pub(crate) trait BufferQueue {
    type Buffer;

    /// Take the next ready buffer, if any
    fn dequeue(&mut self) -> Option<Self::Buffer>;

    /// Hand a buffer back to the stream
    fn requeue(&mut self, buffer: Self::Buffer);
}

/// Payload inspection needed before a buffer is delivered
pub(crate) trait QueuedFrame {
    /// The primary data plane has memory behind it
    fn has_data(&mut self) -> bool;

    /// Bytes of valid payload in the primary plane
    fn payload_size(&mut self) -> u32;
}

/// A dequeued buffer that goes back to its queue when dropped
pub(crate) struct Dequeued<'q, Q: BufferQueue> {
    queue: &'q mut Q,
    buffer: Option<Q::Buffer>,
}

impl<'q, Q: BufferQueue> Dequeued<'q, Q> {
    pub(crate) fn buffer_mut(&mut self) -> &mut Q::Buffer {
        // Only taken in Drop
        self.buffer.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<Q: BufferQueue> Drop for Dequeued<'_, Q> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.queue.requeue(buffer);
        }
    }
}

/// Dequeue everything ready, requeue all but the newest buffer
pub(crate) fn drain_latest<Q: BufferQueue>(queue: &mut Q) -> Option<Dequeued<'_, Q>> {
    let mut latest = None;
    let mut recycled = 0usize;

    while let Some(next) = queue.dequeue() {
        if let Some(older) = latest.replace(next) {
            queue.requeue(older);
            recycled += 1;
        }
    }

    if recycled > 0 {
        trace!("Recycled {} stale buffers", recycled);
    }

    latest.map(|buffer| Dequeued {
        queue,
        buffer: Some(buffer),
    })
}

/// What the frame-ready handler did with the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOutcome {
    /// Nothing was queued
    Idle,
    /// Newest buffer had no data plane or an empty payload
    Skipped,
    Delivered,
}

/// Drain the queue and hand the newest non-empty buffer to `deliver`
///
/// The buffer is back in the queue by the time this returns, whatever the
/// outcome.
pub(crate) fn process_latest<Q>(queue: &mut Q, deliver: impl FnOnce(&mut Q::Buffer)) -> ProcessOutcome
where
    Q: BufferQueue,
    Q::Buffer: QueuedFrame,
{
    let Some(mut latest) = drain_latest(queue) else {
        return ProcessOutcome::Idle;
    };

    let buffer = latest.buffer_mut();
    if !buffer.has_data() {
        trace!("Skipping buffer without a data plane");
        return ProcessOutcome::Skipped;
    }
    if buffer.payload_size() == 0 {
        trace!("Skipping empty buffer");
        return ProcessOutcome::Skipped;
    }

    deliver(buffer);
    ProcessOutcome::Delivered
}
