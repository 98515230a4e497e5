use std::io::{self, ErrorKind, Read};

/// Bytes provides single-byte reads over a reader with the ability to push
/// bytes back if they are not needed yet, i.e., peek-and-push. Pushed bytes
/// are returned before any further reads, most recently pushed first.
pub struct Bytes<R>
where
    R: Read + Send,
{
    reader: io::BufReader<R>,
    cache: Vec<u8>,
    buf: [u8; 1],
}

impl<R> Bytes<R>
where
    R: Read + Send,
{
    pub fn new(reader: R) -> Self {
        Bytes {
            reader: io::BufReader::new(reader),
            cache: Vec::new(),
            buf: [0u8; 1],
        }
    }

    /// Produce the next byte, from the push-back cache if non-empty.
    ///
    /// # Errors
    /// [ErrorKind::UnexpectedEof] when the underlying reader is exhausted.
    pub fn next(&mut self) -> Result<u8, io::Error> {
        if let Some(b) = self.cache.pop() {
            return Ok(b);
        }
        let n = self.reader.read(&mut self.buf)?;
        if n == 0 {
            return Err(io::Error::from(ErrorKind::UnexpectedEof));
        }
        Ok(self.buf[0])
    }

    /// Push a byte back to be returned by the next call to `next`.
    pub fn push(&mut self, b: u8) {
        self.cache.push(b);
    }
}
