//! packet buffers with the low-level operations for reading and writing
//! DNS names, including compression pointers

use std::collections::HashMap;
use std::io::Read;

use derive_more::{Display, Error, From};

#[derive(Debug, Display, From, Error)]
pub enum BufferError {
    EndOfBuffer,
    WriteUnsupported,
    LabelTooLong,
    NameTooLong,
    EmptyLabel,
    InvalidPointer,
    TooManyJumps,
    InvalidLabelLength,
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, BufferError>;

/// Upper bound on a single label, per RFC 1035
const MAX_LABEL_LEN: usize = 63;

/// Upper bound on the encoded size of a full name, terminator included
const MAX_NAME_LEN: usize = 255;

/// Upper bound on compression pointer hops within one name
const MAX_JUMPS: usize = 128;

/// Common operations for buffers holding DNS packet data.
///
/// The trait covers plain byte access, the integer accessors used by the
/// protocol module, and name reading/writing. Compression is a property of
/// the buffer: implementations that keep a suffix lookup map compress names
/// on write, implementations that don't emit them verbatim.
pub trait PacketBuffer {
    fn read(&mut self) -> Result<u8>;
    fn get(&mut self, pos: usize) -> Result<u8>;
    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]>;
    fn write(&mut self, val: u8) -> Result<()>;
    fn set(&mut self, pos: usize, val: u8) -> Result<()>;
    fn pos(&self) -> usize;
    fn seek(&mut self, pos: usize) -> Result<()>;
    fn step(&mut self, steps: usize) -> Result<()>;
    fn find_label(&self, label: &str) -> Option<usize>;
    fn save_label(&mut self, label: &str, pos: usize);

    fn write_u8(&mut self, val: u8) -> Result<()> {
        self.write(val)
    }

    fn write_u16(&mut self, val: u16) -> Result<()> {
        self.write((val >> 8) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn write_u32(&mut self, val: u32) -> Result<()> {
        self.write(((val >> 24) & 0xFF) as u8)?;
        self.write(((val >> 16) & 0xFF) as u8)?;
        self.write(((val >> 8) & 0xFF) as u8)?;
        self.write((val & 0xFF) as u8)?;

        Ok(())
    }

    fn set_u16(&mut self, pos: usize, val: u16) -> Result<()> {
        self.set(pos, (val >> 8) as u8)?;
        self.set(pos + 1, (val & 0xFF) as u8)?;

        Ok(())
    }

    fn read_u16(&mut self) -> Result<u16> {
        let res = ((self.read()? as u16) << 8) | (self.read()? as u16);

        Ok(res)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let res = ((self.read()? as u32) << 24)
            | ((self.read()? as u32) << 16)
            | ((self.read()? as u32) << 8)
            | (self.read()? as u32);

        Ok(res)
    }

    /// Write a name in labeled form, compressing suffixes against earlier
    /// occurrences whenever the buffer keeps a lookup map.
    ///
    /// A trailing root dot is accepted and normalized away. Labels over 63
    /// bytes and names whose uncompressed encoding exceeds 255 bytes are
    /// rejected.
    fn write_qname(&mut self, qname: &str) -> Result<()> {
        let qname = qname.strip_suffix('.').unwrap_or(qname);
        if qname.is_empty() {
            return self.write_u8(0);
        }

        let split_str = qname.split('.').collect::<Vec<&str>>();

        let mut encoded_len = 1;
        for label in &split_str {
            encoded_len += 1 + label.len();
        }
        if encoded_len > MAX_NAME_LEN {
            return Err(BufferError::NameTooLong);
        }

        let mut jump_performed = false;
        for (i, label) in split_str.iter().enumerate() {
            if label.is_empty() {
                return Err(BufferError::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(BufferError::LabelTooLong);
            }

            let search_lbl = split_str[i..].join(".");
            if let Some(prev_pos) = self.find_label(&search_lbl) {
                // Pointers carry a 14 bit offset; suffixes further out
                // are written in full.
                if prev_pos <= 0x3FFF {
                    self.write_u16(0xC000 | (prev_pos as u16))?;
                    jump_performed = true;
                    break;
                }
            }

            self.save_label(&search_lbl, self.pos());

            self.write_u8(label.len() as u8)?;
            for b in label.as_bytes() {
                self.write(*b)?;
            }
        }

        if !jump_performed {
            self.write_u8(0)?;
        }

        Ok(())
    }

    /// Read a name, following compression pointers.
    ///
    /// Every pointer must target an offset strictly before the name being
    /// read, and each chained pointer strictly before the previous target,
    /// so a crafted packet cannot loop the reader. Hop count and decoded
    /// size are bounded on top of that. The reader position ends up just
    /// past the name's encoding regardless of any jumps taken.
    fn read_qname(&mut self, outstr: &mut String) -> Result<()> {
        let name_start = self.pos();
        let mut pos = name_start;

        let mut jumped = false;
        let mut jumps = 0;
        let mut jump_limit = name_start;
        let mut total_len = 0;

        let mut delim = "";
        loop {
            let len = self.get(pos)?;

            match len & 0xC0 {
                0xC0 => {
                    let b2 = self.get(pos + 1)? as u16;
                    let offset = ((((len as u16) ^ 0xC0) << 8) | b2) as usize;
                    if offset >= jump_limit {
                        return Err(BufferError::InvalidPointer);
                    }

                    if !jumped {
                        self.seek(pos + 2)?;
                    }

                    jump_limit = offset;
                    pos = offset;
                    jumped = true;
                    jumps += 1;
                    if jumps > MAX_JUMPS {
                        return Err(BufferError::TooManyJumps);
                    }
                }
                0x00 => {
                    if len == 0 {
                        total_len += 1;
                        if total_len > MAX_NAME_LEN {
                            return Err(BufferError::NameTooLong);
                        }
                        break;
                    }

                    pos += 1;

                    total_len += 1 + len as usize;
                    if total_len > MAX_NAME_LEN {
                        return Err(BufferError::NameTooLong);
                    }

                    let str_buffer = self.get_range(pos, len as usize)?;
                    outstr.push_str(delim);
                    outstr.push_str(&String::from_utf8_lossy(str_buffer));
                    delim = ".";

                    pos += len as usize;
                }
                // 0x40 and 0x80 are reserved label types
                _ => return Err(BufferError::InvalidLabelLength),
            }
        }

        if !jumped {
            self.seek(pos + 1)?;
        }

        Ok(())
    }
}

/// Fixed-size buffer matching the classical 512 byte UDP DNS limit.
///
/// Used on the unicast client path; since there is no label lookup map,
/// names written through it are never compressed.
pub struct BytePacketBuffer {
    pub buf: [u8; 512],
    pub pos: usize,
}

impl BytePacketBuffer {
    pub fn new() -> BytePacketBuffer {
        BytePacketBuffer {
            buf: [0; 512],
            pos: 0,
        }
    }
}

impl Default for BytePacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer for BytePacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buf[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buf[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buf[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[self.pos] = val;
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buf.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buf[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }

    fn find_label(&self, _label: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _label: &str, _pos: usize) {}
}

/// Growable buffer with a suffix lookup map for name compression.
///
/// Encoding starts from the classical 512 byte capacity and grows as
/// needed; mDNS datagrams up to the link MTU decode through the same type
/// via [`VectorPacketBuffer::from_bytes`].
pub struct VectorPacketBuffer {
    pub buffer: Vec<u8>,
    pub pos: usize,
    pub label_lookup: HashMap<String, usize>,
}

impl VectorPacketBuffer {
    pub fn new() -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: Vec::with_capacity(512),
            pos: 0,
            label_lookup: HashMap::new(),
        }
    }

    /// Wrap received bytes for decoding.
    pub fn from_bytes(data: &[u8]) -> VectorPacketBuffer {
        VectorPacketBuffer {
            buffer: data.to_vec(),
            pos: 0,
            label_lookup: HashMap::new(),
        }
    }
}

impl Default for VectorPacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketBuffer for VectorPacketBuffer {
    fn read(&mut self) -> Result<u8> {
        if self.pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        if start + len > self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, val: u8) -> Result<()> {
        if self.pos == self.buffer.len() {
            self.buffer.push(val);
        } else if self.pos < self.buffer.len() {
            self.buffer[self.pos] = val;
        } else {
            return Err(BufferError::EndOfBuffer);
        }
        self.pos += 1;

        Ok(())
    }

    fn set(&mut self, pos: usize, val: u8) -> Result<()> {
        if pos >= self.buffer.len() {
            return Err(BufferError::EndOfBuffer);
        }
        self.buffer[pos] = val;

        Ok(())
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.pos += steps;

        Ok(())
    }

    fn find_label(&self, label: &str) -> Option<usize> {
        self.label_lookup.get(label).copied()
    }

    fn save_label(&mut self, label: &str, pos: usize) {
        self.label_lookup.insert(label.to_string(), pos);
    }
}

/// Read-only buffer that pulls bytes from a stream on demand, for use with
/// the length-prefixed framing of stream transports.
pub struct StreamPacketBuffer<'a, T>
where
    T: Read,
{
    pub stream: &'a mut T,
    pub buffer: Vec<u8>,
    pub pos: usize,
}

impl<'a, T> StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    pub fn new(stream: &'a mut T) -> StreamPacketBuffer<'a, T> {
        StreamPacketBuffer {
            stream,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    fn fill_to(&mut self, end: usize) -> Result<()> {
        while self.buffer.len() < end {
            let mut local_buffer = [0; 512];
            let read = self.stream.read(&mut local_buffer)?;
            if read == 0 {
                return Err(BufferError::EndOfBuffer);
            }
            self.buffer.extend_from_slice(&local_buffer[..read]);
        }

        Ok(())
    }
}

impl<'a, T> PacketBuffer for StreamPacketBuffer<'a, T>
where
    T: Read + 'a,
{
    fn read(&mut self) -> Result<u8> {
        self.fill_to(self.pos + 1)?;
        let res = self.buffer[self.pos];
        self.pos += 1;

        Ok(res)
    }

    fn get(&mut self, pos: usize) -> Result<u8> {
        self.fill_to(pos + 1)?;
        Ok(self.buffer[pos])
    }

    fn get_range(&mut self, start: usize, len: usize) -> Result<&[u8]> {
        self.fill_to(start + len)?;
        Ok(&self.buffer[start..start + len])
    }

    fn write(&mut self, _val: u8) -> Result<()> {
        Err(BufferError::WriteUnsupported)
    }

    fn set(&mut self, _pos: usize, _val: u8) -> Result<()> {
        Err(BufferError::WriteUnsupported)
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.pos {
            self.fill_to(pos)?;
        }
        self.pos = pos;

        Ok(())
    }

    fn step(&mut self, steps: usize) -> Result<()> {
        self.seek(self.pos + steps)
    }

    fn find_label(&self, _label: &str) -> Option<usize> {
        None
    }

    fn save_label(&mut self, _label: &str, _pos: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qname_roundtrip_uncompressed() {
        let mut buffer = BytePacketBuffer::new();
        buffer.write_qname("www.google.com").unwrap();

        assert_eq!(
            &buffer.buf[0..16],
            &[3, b'w', b'w', b'w', 6, b'g', b'o', b'o', b'g', b'l', b'e', 3, b'c', b'o', b'm', 0]
        );

        buffer.seek(0).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "www.google.com");
        assert_eq!(buffer.pos(), 16);
    }

    #[test]
    fn test_root_name() {
        let mut buffer = BytePacketBuffer::new();
        buffer.write_qname("").unwrap();
        assert_eq!(buffer.buf[0], 0);

        buffer.seek(0).unwrap();
        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "");
        assert_eq!(buffer.pos(), 1);
    }

    #[test]
    fn test_trailing_dot_normalized() {
        let mut absolute = BytePacketBuffer::new();
        absolute.write_qname("example.com.").unwrap();

        let mut relative = BytePacketBuffer::new();
        relative.write_qname("example.com").unwrap();

        assert_eq!(absolute.buf[..absolute.pos], relative.buf[..relative.pos]);
    }

    #[test]
    fn test_shared_suffix_compression() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("a.example.com").unwrap();
        let first_len = buffer.pos;
        buffer.write_qname("b.example.com").unwrap();

        // second name collapses to one label plus a pointer to the
        // "example.com" suffix at offset 2
        assert_eq!(&buffer.buffer[first_len..], &[1, b'b', 0xC0, 0x02]);

        buffer.seek(0).unwrap();
        let mut first = String::new();
        buffer.read_qname(&mut first).unwrap();
        let mut second = String::new();
        buffer.read_qname(&mut second).unwrap();

        assert_eq!(first, "a.example.com");
        assert_eq!(second, "b.example.com");
    }

    #[test]
    fn test_compression_multiple_suffix_levels() {
        let mut buffer = VectorPacketBuffer::new();
        buffer.write_qname("mail.example.com").unwrap();
        buffer.write_qname("example.com").unwrap();
        buffer.write_qname("com").unwrap();

        buffer.seek(0).unwrap();
        for expected in ["mail.example.com", "example.com", "com"] {
            let mut name = String::new();
            buffer.read_qname(&mut name).unwrap();
            assert_eq!(name, expected);
        }
    }

    #[test]
    fn test_forward_pointer_rejected() {
        // pointer at the start of the name targeting a later offset
        let mut buffer = VectorPacketBuffer::from_bytes(&[0xC0, 0x04, 0, 0, 3, b'f', b'o', b'o', 0]);

        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::InvalidPointer)
        ));
    }

    #[test]
    fn test_pointer_cycle_rejected() {
        // two pointers targeting each other; the second hop would have to
        // move forward again, which the decreasing-offset rule forbids
        let mut buffer = VectorPacketBuffer::from_bytes(&[0xC0, 0x02, 0xC0, 0x00, 0x00]);

        buffer.seek(2).unwrap();
        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::InvalidPointer)
        ));
    }

    #[test]
    fn test_self_pointer_rejected() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[0xC0, 0x00]);

        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::InvalidPointer)
        ));
    }

    #[test]
    fn test_reserved_label_types_rejected() {
        for first in [0x40u8, 0x80] {
            let mut buffer = VectorPacketBuffer::from_bytes(&[first, 0x01, 0x00]);
            let mut name = String::new();
            assert!(matches!(
                buffer.read_qname(&mut name),
                Err(BufferError::InvalidLabelLength)
            ));
        }
    }

    #[test]
    fn test_unterminated_name_fails() {
        let mut buffer = VectorPacketBuffer::from_bytes(&[3, b'f', b'o', b'o']);

        let mut name = String::new();
        assert!(matches!(
            buffer.read_qname(&mut name),
            Err(BufferError::EndOfBuffer)
        ));
    }

    #[test]
    fn test_label_too_long_rejected() {
        let long_label = "x".repeat(64);
        let mut buffer = VectorPacketBuffer::new();
        assert!(matches!(
            buffer.write_qname(&long_label),
            Err(BufferError::LabelTooLong)
        ));
    }

    #[test]
    fn test_name_too_long_rejected() {
        let name = (0..5).map(|_| "y".repeat(60)).collect::<Vec<_>>().join(".");
        let mut buffer = VectorPacketBuffer::new();
        assert!(matches!(
            buffer.write_qname(&name),
            Err(BufferError::NameTooLong)
        ));
    }

    #[test]
    fn test_empty_label_rejected() {
        let mut buffer = VectorPacketBuffer::new();
        assert!(matches!(
            buffer.write_qname("a..b"),
            Err(BufferError::EmptyLabel)
        ));
    }

    #[test]
    fn test_stream_buffer_reads() {
        let data = vec![3, b'w', b'w', b'w', 0, 0x12, 0x34];
        let mut cursor = std::io::Cursor::new(data);
        let mut buffer = StreamPacketBuffer::new(&mut cursor);

        let mut name = String::new();
        buffer.read_qname(&mut name).unwrap();
        assert_eq!(name, "www");
        assert_eq!(buffer.read_u16().unwrap(), 0x1234);
    }
}
