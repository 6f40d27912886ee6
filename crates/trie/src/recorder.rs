//! Access recording for proof generation.
//!
//! A [`Recorder`] attached to a database-backed lookup captures, in visit
//! order, every `(digest, encoding)` pair resolved through the store —
//! including hashed-value preimages. Proof generation replays these records.

use filament_primitives::Hash256;

/// One recorded store access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedNode {
    /// Digest the data was fetched under.
    pub hash: Hash256,
    /// The fetched bytes: a node encoding or a value preimage.
    pub data: Vec<u8>,
}

/// Records the ordered store accesses of a lookup.
#[derive(Debug, Default)]
pub struct Recorder {
    nodes: Vec<RecordedNode>,
}

impl Recorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one access.
    pub fn record(&mut self, hash: Hash256, data: Vec<u8>) {
        log::trace!("recorder: {} ({} bytes)", hash, data.len());
        self.nodes.push(RecordedNode { hash, data });
    }

    /// Number of recorded accesses.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Takes the recorded accesses, leaving the recorder empty.
    pub fn drain(&mut self) -> Vec<RecordedNode> {
        std::mem::take(&mut self.nodes)
    }
}

/// A peekable cursor over recorded accesses.
#[derive(Debug)]
pub struct RecordedNodesIter {
    nodes: Vec<RecordedNode>,
    pos: usize,
}

impl RecordedNodesIter {
    /// A cursor over the given records.
    pub fn new(nodes: Vec<RecordedNode>) -> Self {
        Self { nodes, pos: 0 }
    }

    /// The next record without advancing.
    pub fn peek(&self) -> Option<&RecordedNode> {
        self.nodes.get(self.pos)
    }

    /// The next record, advancing the cursor.
    pub fn next(&mut self) -> Option<&RecordedNode> {
        let record = self.nodes.get(self.pos)?;
        self.pos += 1;
        Some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> Hash256 {
        Hash256::from_slice(&[n; 32]).unwrap()
    }

    #[test]
    fn test_record_preserves_order() {
        let mut recorder = Recorder::new();
        recorder.record(hash(1), vec![1]);
        recorder.record(hash(2), vec![2]);
        assert_eq!(recorder.len(), 2);

        let drained = recorder.drain();
        assert_eq!(drained[0].hash, hash(1));
        assert_eq!(drained[1].hash, hash(2));
        assert!(recorder.is_empty());
    }

    #[test]
    fn test_iter_peek_does_not_advance() {
        let mut iter = RecordedNodesIter::new(vec![
            RecordedNode {
                hash: hash(1),
                data: vec![1],
            },
            RecordedNode {
                hash: hash(2),
                data: vec![2],
            },
        ]);

        assert_eq!(iter.peek().map(|r| r.hash), Some(hash(1)));
        assert_eq!(iter.peek().map(|r| r.hash), Some(hash(1)));
        assert_eq!(iter.next().map(|r| r.hash), Some(hash(1)));
        assert_eq!(iter.next().map(|r| r.hash), Some(hash(2)));
        assert!(iter.next().is_none());
        assert!(iter.peek().is_none());
    }
}
