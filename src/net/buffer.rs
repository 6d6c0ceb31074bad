use std::io::{self, IoSliceMut, Read, Write};

/// bytes reserved in front of the readable region so a length prefix can be
/// prepended without moving data
pub const CHEAP_PREPEND: usize = 8;
/// initial writable capacity of a fresh buffer
pub const INITIAL_SIZE: usize = 1024;

/// An application-level byte buffer sitting between the socket and the codec.
///
/// The backing storage is split into three regions:
///
/// ```text
/// +-------------------+------------------+------------------+
/// | prependable bytes |  readable bytes  |  writable bytes  |
/// +-------------------+------------------+------------------+
/// 0      <=      reader_index   <=   writer_index    <=   len
/// ```
///
/// Reads from a descriptor land in the writable region; the codec consumes
/// from the readable region. The prependable region starts out as
/// [`CHEAP_PREPEND`] reserved bytes and grows as data is retrieved, which lets
/// the buffer reclaim space by shifting instead of reallocating.
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Buffer {
    /// creates a buffer with [`INITIAL_SIZE`] writable bytes
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// creates a buffer with `initial_size` writable bytes
    pub fn with_capacity(initial_size: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial_size],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// number of bytes available to read
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// number of bytes that can be written before the storage has to grow
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// number of bytes in front of the readable region
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// a view of the readable region
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// finds the first `\r\n` in the readable region, returning its offset
    /// relative to [`peek`](Buffer::peek)
    pub fn find_crlf(&self) -> Option<usize> {
        self.peek().windows(2).position(|w| w == b"\r\n")
    }

    /// takes `len` bytes out of the readable region by advancing the reader
    /// index; taking everything resets both indices to the reserved prefix
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// discards the whole readable region
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// takes `len` bytes out of the readable region as a `String`
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let result = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        result
    }

    /// takes the whole readable region as a `String`
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// appends `data` after the readable region, growing the storage if needed
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// makes room for at least `len` writable bytes
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    /// copies `data` into the prependable region, immediately before the
    /// readable bytes
    pub fn prepend(&mut self, data: &[u8]) {
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Reads from `src` once, scatter style: the first IO slice is the
    /// writable tail, the second is a 64 KiB stack extension. Anything that
    /// lands in the extension is appended afterwards, so one syscall can
    /// ingest far more than the current writable space and still leave a
    /// single contiguous readable region.
    ///
    /// Returns the byte count from the underlying read; `Ok(0)` means the
    /// peer closed the connection.
    pub fn read_from<R: Read>(&mut self, mut src: R) -> io::Result<usize> {
        let mut extra = [0u8; 65536];
        let writable = self.writable_bytes();

        let n = if writable < extra.len() {
            let start = self.writer_index;
            let (_, tail) = self.buf.split_at_mut(start);
            let mut slices = [IoSliceMut::new(tail), IoSliceMut::new(&mut extra)];
            src.read_vectored(&mut slices)?
        } else {
            let start = self.writer_index;
            src.read(&mut self.buf[start..])?
        };

        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// writes the readable region to `dst` with a single call; the caller
    /// retrieves however many bytes were accepted
    pub fn write_to<W: Write>(&self, mut dst: W) -> io::Result<usize> {
        dst.write(self.peek())
    }

    /// Grow or compact so that at least `len` bytes are writable. When the
    /// slack on both sides (minus the reserved prefix) can hold the request,
    /// the readable region is shifted down instead of reallocating.
    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = self.reader_index + readable;
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let buffer = Buffer::new();
        assert_eq!(buffer.readable_bytes(), 0);
        assert_eq!(buffer.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn append_and_retrieve() {
        let mut buffer = Buffer::new();
        let data = "Hello, World!";
        buffer.append(data.as_bytes());

        assert_eq!(buffer.readable_bytes(), data.len());
        assert_eq!(buffer.retrieve_all_as_string(), data);
        assert_eq!(buffer.readable_bytes(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buffer = Buffer::new();
        buffer.append(b"Test Data");

        assert_eq!(buffer.peek(), b"Test Data");
        assert_eq!(buffer.readable_bytes(), 9);
    }

    #[test]
    fn retrieve_partial() {
        let mut buffer = Buffer::new();
        let data = "Hello, World!";
        buffer.append(data.as_bytes());

        assert_eq!(buffer.retrieve_as_string(5), "Hello");
        assert_eq!(buffer.readable_bytes(), data.len() - 5);
    }

    #[test]
    fn find_crlf() {
        let mut buffer = Buffer::new();
        buffer.append(b"Line1\r\nLine2\r\n");

        assert_eq!(buffer.find_crlf(), Some(5));
    }

    #[test]
    fn multiple_append() {
        let mut buffer = Buffer::new();
        buffer.append(b"Part1");
        buffer.append(b" ");
        buffer.append(b"Part2");

        assert_eq!(buffer.retrieve_all_as_string(), "Part1 Part2");
    }

    #[test]
    fn empty_retrieve() {
        let mut buffer = Buffer::new();
        assert!(buffer.retrieve_all_as_string().is_empty());
    }

    #[test]
    fn large_data_grows_storage() {
        let mut buffer = Buffer::new();
        let large = vec![b'X'; 10000];
        buffer.append(&large);

        assert_eq!(buffer.readable_bytes(), 10000);
        assert_eq!(buffer.retrieve_all_as_string(), String::from_utf8(large).unwrap());
    }

    #[test]
    fn retrieve_then_append_reuses_front_space() {
        let mut buffer = Buffer::with_capacity(32);
        buffer.append(&[b'a'; 24]);
        buffer.retrieve(20);
        // 4 readable left; front slack should absorb this without resizing
        buffer.append(&[b'b'; 24]);

        assert_eq!(buffer.readable_bytes(), 28);
        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND);
        assert_eq!(&buffer.peek()[..4], b"aaaa");
    }

    #[test]
    fn prepend_fills_reserved_prefix() {
        let mut buffer = Buffer::new();
        buffer.append(b"payload");
        buffer.prepend(&[0, 7]);

        assert_eq!(buffer.prependable_bytes(), CHEAP_PREPEND - 2);
        assert_eq!(buffer.peek(), &b"\x00\x07payload"[..]);
    }

    #[test]
    fn read_from_overflows_into_extension() {
        let mut buffer = Buffer::with_capacity(16);
        let data = vec![b'z'; 4000];
        let n = buffer.read_from(&data[..]).unwrap();

        assert_eq!(n, 4000);
        assert_eq!(buffer.readable_bytes(), 4000);
        assert!(buffer.peek().iter().all(|&b| b == b'z'));
    }
}
