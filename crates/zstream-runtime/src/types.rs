use std::sync::Arc;

/// A batch is the unit of delivery to the consumer.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Logical row indices along axis 0, in delivery order.
    pub sample_ids: Arc<[u64]>,
    /// Prefix-sum offsets into `payload` for each sample (length = sample_count + 1).
    ///
    /// Invariants:
    /// - offsets[0] == 0
    /// - offsets is non-decreasing
    /// - offsets.last() == payload.len()
    pub offsets: Arc<[u64]>,
    /// Row-major bytes of every sample, concatenated.
    pub payload: Arc<[u8]>,
}

impl Batch {
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn sample_count(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }

    /// Bytes of the `i`-th sample.
    pub fn sample(&self, i: usize) -> Option<&[u8]> {
        let start = usize::try_from(*self.offsets.get(i)?).ok()?;
        let end = usize::try_from(*self.offsets.get(i + 1)?).ok()?;
        self.payload.get(start..end)
    }
}

/// Accumulates samples into a [`Batch`].
#[derive(Debug, Default)]
pub(crate) struct BatchBuilder {
    sample_ids: Vec<u64>,
    offsets: Vec<u64>,
    payload: Vec<u8>,
}

impl BatchBuilder {
    pub(crate) fn with_capacity(samples: usize, bytes: usize) -> Self {
        let mut offsets = Vec::with_capacity(samples + 1);
        offsets.push(0);
        Self {
            sample_ids: Vec::with_capacity(samples),
            offsets,
            payload: Vec::with_capacity(bytes),
        }
    }

    pub(crate) fn push(&mut self, sample_id: u64, bytes: &[u8]) {
        self.sample_ids.push(sample_id);
        self.payload.extend_from_slice(bytes);
        self.offsets.push(self.payload.len() as u64);
    }

    pub(crate) fn finish(self) -> Batch {
        Batch {
            sample_ids: Arc::from(self.sample_ids),
            offsets: Arc::from(self.offsets),
            payload: Arc::from(self.payload),
        }
    }
}
