//! A dynamically sized FIFO byte queue backed by a plain vector. Data is
//! appended at the tail and read from the head; the head space is compacted
//! once it grows past half of the storage.

use std::io;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
    limit: usize,
}

impl Buffer {
    /// Create a buffer holding at most `limit` bytes of live data.
    #[inline]
    pub fn new(limit: usize) -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
            limit,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining free capacity in the buffer.
    #[inline]
    pub fn free_capacity(&self) -> usize {
        self.limit - self.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Consume `count` bytes from the head.
    #[inline]
    pub fn move_head(&mut self, count: usize) {
        self.head += count;
        assert!(self.head <= self.data.len(), "Buffer head moved past tail");
        self.compact();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Append bytes at the tail. Panics when the limit would be crossed, the
    /// caller is expected to check `free_capacity` first.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        assert!(bytes.len() <= self.free_capacity(), "Buffer overrun");
        self.data.extend_from_slice(bytes);
    }

    /// Read from the supplied reader until it would block, the source is
    /// exhausted or the buffer is full. A closed peer surfaces as
    /// `UnexpectedEof` so callers can drop the connection.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<usize> {
        let mut total_count = 0usize;
        let mut chunk = [0u8; 65536];

        loop {
            let room = self.free_capacity().min(chunk.len());
            if room == 0 {
                return Ok(total_count);
            }

            match reader.read(&mut chunk[..room]) {
                Ok(0) => {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                Ok(read_count) => {
                    self.data.extend_from_slice(&chunk[..read_count]);
                    total_count += read_count;
                }
                Err(error) => {
                    if error.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total_count);
                    }
                    return Err(error);
                }
            }
        }
    }

    /// Write the buffered data to the supplied writer until it would block
    /// or the buffer drains.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total_count = 0usize;

        while !self.is_empty() {
            match writer.write(self.read_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(write_count) => {
                    self.move_head(write_count);
                    total_count += write_count;
                }
                Err(error) => {
                    if error.kind() == io::ErrorKind::WouldBlock {
                        return Ok(total_count);
                    }
                    return Err(error);
                }
            }
        }

        Ok(total_count)
    }

    #[inline]
    fn compact(&mut self) {
        if self.head == self.data.len() {
            self.data.clear();
            self.head = 0;
        } else if self.head > self.data.len() / 2 {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }

        fn clear(&mut self) {
            self.data.clear();
            self.cursor = 0;
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..(self.cursor + count)]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..32768).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new(65536);

        let count = buffer.ingress(&mut channel).unwrap();
        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        channel.clear();
        let count = buffer.egress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(channel.data[..], mock_data[..]);
    }

    #[test]
    fn test_ingress_stops_at_limit() {
        let mock_data = vec![1u8; 4096];
        let mut channel = MockChannel::new(mock_data, 512, 4096);

        let mut buffer = Buffer::new(1024);

        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, 1024);
        assert_eq!(buffer.free_capacity(), 0);
    }

    #[test]
    fn test_ingress_eof() {
        let mut buffer = Buffer::new(1024);

        // An empty cursor reports Ok(0), which must surface as an error.
        let result = buffer.ingress(io::Cursor::new(Vec::<u8>::new()));

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_head_compaction() {
        let mut buffer = Buffer::new(1024);
        buffer.extend(&[1, 2, 3, 4, 5, 6]);

        buffer.move_head(4);

        assert_eq!(buffer.read_slice(), &[5, 6]);
        assert_eq!(buffer.head, 0);

        buffer.move_head(2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        let mut sink = [0u8; 0];

        let mut buffer = Buffer::new(1024);
        buffer.extend(&[1]);

        let result = buffer.egress(&mut sink[..]);

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }
}
