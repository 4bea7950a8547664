//! Resources: immutable byte-segment payloads with a TTL.

use std::time::Duration;

/// An ordered sequence of byte segments plus a TTL.
///
/// Each segment corresponds to one successful upstream call (for a
/// paginated REST source, one page per segment). A resource is immutable
/// after it is put into a store; readers share the stored value instead of
/// copying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    data: Vec<Vec<u8>>,
    ttl: Duration,
}

impl Resource {
    #[must_use]
    pub fn new(data: Vec<Vec<u8>>, ttl: Duration) -> Self {
        Self { data, ttl }
    }

    /// A resource holding a single segment.
    #[must_use]
    pub fn single(segment: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: vec![segment],
            ttl,
        }
    }

    #[must_use]
    pub fn data(&self) -> &[Vec<u8>] {
        &self.data
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Segments decoded as UTF-8, with invalid sequences replaced.
    ///
    /// This is the projection handed to the sandbox as server state; lossy
    /// decoding keeps a single bad byte in one upstream page from failing
    /// the whole request.
    #[must_use]
    pub fn segments_lossy(&self) -> Vec<String> {
        self.data
            .iter()
            .map(|segment| String::from_utf8_lossy(segment).into_owned())
            .collect()
    }
}
