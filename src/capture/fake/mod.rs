// Fakes for testing
//
// Stand-ins for the X server and a PipeWire buffer queue, so the capture
// logic can be exercised without native libraries.

mod display;
mod queue;

pub use display::{FakeDisplay, FakeSegment};
pub use queue::{FakeBuffer, FakeQueue};

#[cfg(test)]
mod tests;
