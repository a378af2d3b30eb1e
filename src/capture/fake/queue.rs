use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::capture::pipewire::queue::{BufferQueue, QueuedFrame};

/// A queued buffer as the frame-ready handler sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeBuffer {
    pub id: u32,
    /// Whether the primary plane is mapped
    pub mapped: bool,
    /// Chunk size of the primary plane
    pub size: u32,
}

impl FakeBuffer {
    pub fn new(id: u32, size: u32) -> Self {
        Self {
            id,
            mapped: true,
            size,
        }
    }

    pub fn unmapped(id: u32) -> Self {
        Self {
            id,
            mapped: false,
            size: 0,
        }
    }
}

impl QueuedFrame for FakeBuffer {
    fn has_data(&mut self) -> bool {
        self.mapped
    }

    fn payload_size(&mut self) -> u32 {
        self.size
    }
}

/// Buffer queue that records the order buffers are handed back in
#[derive(Debug, Default)]
pub struct FakeQueue {
    ready: VecDeque<FakeBuffer>,
    returned: Arc<Mutex<Vec<u32>>>,
}

impl FakeQueue {
    pub fn with_buffers(buffers: Vec<FakeBuffer>) -> Self {
        Self {
            ready: buffers.into(),
            returned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Ids of requeued buffers, in requeue order
    pub fn returned(&self) -> Vec<u32> {
        self.returned.lock().unwrap().clone()
    }

    /// Shared view of the requeue log, readable while the queue is borrowed
    pub fn returned_log(&self) -> Arc<Mutex<Vec<u32>>> {
        Arc::clone(&self.returned)
    }

    pub fn pending(&self) -> usize {
        self.ready.len()
    }
}

impl BufferQueue for FakeQueue {
    type Buffer = FakeBuffer;

    fn dequeue(&mut self) -> Option<FakeBuffer> {
        self.ready.pop_front()
    }

    fn requeue(&mut self, buffer: FakeBuffer) {
        // Returned buffers go to the producer, not back to the ready list
        self.returned.lock().unwrap().push(buffer.id);
    }
}
