use anyhow::Result;

use crate::types::Batch;

/// Synchronous batch consumer.
///
/// `deliver` runs on the loader's thread, so a slow sink slows batch hand-out and
/// the time it takes shows up in the controller's end-to-end batch time.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, batch: Batch) -> Result<()>;
}
