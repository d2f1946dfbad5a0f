//! Size-bounded batch assembly for the publisher.

/// Ordered set of encoded envelopes bounded by count and wire size
#[derive(Debug)]
pub struct MessageBatch {
    bodies: Vec<Vec<u8>>,
    first_index: usize,
    bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

impl MessageBatch {
    /// An empty batch whose first entry will be input envelope `first_index`
    pub fn new(first_index: usize, max_messages: usize, max_bytes: usize) -> Self {
        Self {
            bodies: Vec::with_capacity(max_messages.min(1024)),
            first_index,
            bytes: 0,
            max_messages,
            max_bytes,
        }
    }

    /// Add an encoded envelope, handing it back if it does not fit
    pub fn try_add(&mut self, body: Vec<u8>) -> Result<(), Vec<u8>> {
        if self.is_full() || self.bytes + body.len() > self.max_bytes {
            return Err(body);
        }
        self.bytes += body.len();
        self.bodies.push(body);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    /// Whether the count limit has been reached
    pub fn is_full(&self) -> bool {
        self.bodies.len() >= self.max_messages
    }

    /// Total encoded size in bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn first_index(&self) -> usize {
        self.first_index
    }

    /// Consume the batch, yielding its bodies in insertion order
    pub fn into_bodies(self) -> Vec<Vec<u8>> {
        self.bodies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_limit() {
        let mut batch = MessageBatch::new(0, 2, 1024);
        assert!(batch.try_add(b"a".to_vec()).is_ok());
        assert!(batch.try_add(b"b".to_vec()).is_ok());
        assert!(batch.is_full());
        assert_eq!(batch.try_add(b"c".to_vec()), Err(b"c".to_vec()));
        assert_eq!(batch.into_bodies(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_byte_limit() {
        let mut batch = MessageBatch::new(4, 10, 8);
        assert!(batch.try_add(vec![0; 5]).is_ok());
        assert!(batch.try_add(vec![0; 4]).is_err());
        assert!(batch.try_add(vec![0; 3]).is_ok());
        assert_eq!(batch.bytes(), 8);
        assert_eq!(batch.first_index(), 4);
    }

    #[test]
    fn test_oversized_body_never_fits_empty_batch() {
        let mut batch = MessageBatch::new(0, 10, 8);
        assert!(batch.try_add(vec![0; 9]).is_err());
        assert!(batch.is_empty());
    }
}
