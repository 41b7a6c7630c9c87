use std::collections::VecDeque;

use bytes::Bytes;


/// The two per-connection send FIFOs sharing one socket: `proto` (route
///  sets/diffs, pings, pongs, route requests) and `data` (user frames).
///
/// The write pump drains `proto` fully before `data`, with one exception: a
///  data frame that has begun going out is completed before switching back,
///  latched by `sending_from_data`. Byte sizes track the sum of queued frame
///  lengths; a frame leaves the accounting only once fully written.
pub struct SendQueues {
    proto: VecDeque<Bytes>,
    data: VecDeque<Bytes>,
    proto_size: usize,
    data_size: usize,
    max_proto_size: usize,
    max_data_size: usize,
    sending_from_data: bool,
    offset: usize,
}

impl SendQueues {
    pub fn new(max_proto_size: usize, max_data_size: usize) -> SendQueues {
        SendQueues {
            proto: VecDeque::new(),
            data: VecDeque::new(),
            proto_size: 0,
            data_size: 0,
            max_proto_size,
            max_data_size,
            sending_from_data: false,
            offset: 0,
        }
    }

    pub fn proto_size(&self) -> usize {
        self.proto_size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn max_data_size(&self) -> usize {
        self.max_data_size
    }

    pub fn is_empty(&self) -> bool {
        self.proto.is_empty() && self.data.is_empty()
    }

    pub fn can_push_proto(&self, len: usize) -> bool {
        self.proto_size + len < self.max_proto_size
    }

    pub fn can_push_data(&self, len: usize) -> bool {
        self.data_size + len < self.max_data_size
    }

    /// Enqueues a protocol frame, `false` if the queue cap rejects it.
    pub fn push_proto(&mut self, frame: Bytes) -> bool {
        if !self.can_push_proto(frame.len()) {
            return false;
        }
        self.proto_size += frame.len();
        self.proto.push_back(frame);
        true
    }

    /// Enqueues a data frame, `false` if the queue cap rejects it.
    pub fn push_data(&mut self, frame: Bytes) -> bool {
        if !self.can_push_data(frame.len()) {
            return false;
        }
        self.data_size += frame.len();
        self.data.push_back(frame);
        true
    }

    /// The unwritten remainder of the frame the pump should send next, or
    ///  `None` when both queues are drained. Selecting a data frame while
    ///  the proto queue is empty latches `sending_from_data` until that frame
    ///  completes.
    pub fn next_chunk(&mut self) -> Option<&[u8]> {
        if self.sending_from_data {
            return self.data.front().map(|f| &f[self.offset..]);
        }
        if let Some(f) = self.proto.front() {
            return Some(&f[self.offset..]);
        }
        if self.data.front().is_some() {
            self.sending_from_data = true;
            return self.data.front().map(|f| &f[self.offset..]);
        }
        None
    }

    /// Records `n` bytes of the current frame as written.
    pub fn advance(&mut self, n: usize) {
        self.offset += n;

        let queue = if self.sending_from_data { &mut self.data } else { &mut self.proto };
        let frame_len = queue.front().map(|f| f.len()).unwrap_or(0);
        debug_assert!(self.offset <= frame_len);

        if self.offset == frame_len {
            queue.pop_front();
            if self.sending_from_data {
                self.data_size -= frame_len;
            } else {
                self.proto_size -= frame_len;
            }
            self.offset = 0;
            self.sending_from_data = false;
        }
    }

    /// Discards everything, including a partially written frame.
    pub fn clear(&mut self) {
        self.proto.clear();
        self.data.clear();
        self.proto_size = 0;
        self.data_size = 0;
        self.sending_from_data = false;
        self.offset = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn frame(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn test_size_accounting() {
        let mut q = SendQueues::new(100, 100);
        assert!(q.push_proto(frame(1, 10)));
        assert!(q.push_data(frame(2, 20)));
        assert!(q.push_data(frame(3, 30)));
        assert_eq!(q.proto_size(), 10);
        assert_eq!(q.data_size(), 50);

        // partial write keeps the frame in the accounting
        q.next_chunk().unwrap();
        q.advance(4);
        assert_eq!(q.proto_size(), 10);
        q.advance(6);
        assert_eq!(q.proto_size(), 0);
        assert_eq!(q.data_size(), 50);
    }

    #[test]
    fn test_proto_drains_before_data() {
        let mut q = SendQueues::new(100, 100);
        q.push_data(frame(2, 4));
        q.push_proto(frame(1, 4));

        assert_eq!(q.next_chunk().unwrap(), &[1, 1, 1, 1]);
        q.advance(4);
        assert_eq!(q.next_chunk().unwrap(), &[2, 2, 2, 2]);
        q.advance(4);
        assert!(q.next_chunk().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_mid_frame_latch() {
        let mut q = SendQueues::new(100, 100);
        q.push_data(frame(2, 4));

        // the data frame is begun...
        assert_eq!(q.next_chunk().unwrap(), &[2, 2, 2, 2]);
        q.advance(2);

        // ...and a proto frame arriving mid-frame must wait for it to finish
        q.push_proto(frame(1, 4));
        assert_eq!(q.next_chunk().unwrap(), &[2, 2]);
        q.advance(2);

        assert_eq!(q.next_chunk().unwrap(), &[1, 1, 1, 1]);
        q.advance(4);
        assert!(q.next_chunk().is_none());
    }

    #[test]
    fn test_push_rejects_at_cap() {
        let mut q = SendQueues::new(8, 8);
        assert!(q.push_data(frame(1, 7)));
        // 7 + 1 == max is still rejected: the cap is exclusive
        assert!(!q.push_data(frame(2, 1)));
        assert_eq!(q.data_size(), 7);

        assert!(q.push_proto(frame(3, 7)));
        assert!(!q.push_proto(frame(4, 2)));
        assert_eq!(q.proto_size(), 7);
    }

    #[test]
    fn test_clear_resets_partial_write() {
        let mut q = SendQueues::new(100, 100);
        q.push_data(frame(2, 4));
        q.next_chunk().unwrap();
        q.advance(2);

        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.data_size(), 0);

        q.push_proto(frame(1, 4));
        assert_eq!(q.next_chunk().unwrap(), &[1, 1, 1, 1]);
    }
}
