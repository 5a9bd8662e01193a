use std::time::Duration;

/// Counters collected by a single decode call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeStats {
    /// The number of decoded members.
    pub members: usize,
    /// The number of compressed bytes covered by the decoded members.
    pub compressed_bytes: u64,
    /// The number of bytes produced.
    pub decompressed_bytes: u64,
    /// Time spent discovering member boundaries.
    pub scan_time: Duration,
    /// Time spent decoding members, including the wait for the slowest worker.
    pub decode_time: Duration,
}

impl DecodeStats {
    /// The total wall time of the call.
    pub fn elapsed(&self) -> Duration {
        self.scan_time + self.decode_time
    }

    /// Decompressed bytes per second over the whole call.
    ///
    /// Returns `None` if no time was measured.
    pub fn throughput(&self) -> Option<f64> {
        let secs = self.elapsed().as_secs_f64();
        (secs > 0.0).then(|| self.decompressed_bytes as f64 / secs)
    }

    /// The ratio of decompressed to compressed bytes.
    pub fn ratio(&self) -> Option<f64> {
        (self.compressed_bytes > 0)
            .then(|| self.decompressed_bytes as f64 / self.compressed_bytes as f64)
    }

    pub(crate) fn merge(&mut self, other: &Self) {
        self.members += other.members;
        self.compressed_bytes += other.compressed_bytes;
        self.decompressed_bytes += other.decompressed_bytes;
        self.scan_time += other.scan_time;
        self.decode_time += other.decode_time;
    }
}
