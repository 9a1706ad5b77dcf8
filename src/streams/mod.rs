pub mod error;
mod signal;
pub mod writable;

pub use error::StreamError;
pub use writable::{
    WritableSink, WritableStream, WritableStreamBuilder, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};

/// Result alias used throughout the stream APIs
pub type StreamResult<T> = Result<T, StreamError>;

/// Type-level marker for unlocked streams
pub struct Unlocked;
/// Type-level marker for locked streams
pub struct Locked;

/// Generic queuing strategy trait
///
/// Sizes are `f64` so the desired size (`high_water_mark - queued size`) can
/// go negative while writes are in flight. A strategy returning a non-finite
/// or negative size errors the stream at enqueue time.
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> f64;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> f64;
}

/// Count-based strategy
#[derive(Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> f64 {
        1.0
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&[u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&[u8]) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}
