// Length-prefixed text framing.
//
// Wire form of one frame: `"<decimalLength>: <payload>"`, where the decimal
// length counts the payload bytes only. No terminator follows the payload and
// the prefix is authoritative, so several frames can sit back to back in a
// single TCP read, and one frame can be spread across many reads.
//
// `FrameDecoder` is the receiving half: readers `push` whatever bytes the
// socket returned and then `pop` until it reports `Ok(None)`. Decoder state
// survives across pushes, so frames straddling the transport's read chunk
// boundary reassemble transparently. A malformed prefix is a `FrameError`;
// the stream cannot be resynchronized after one and the caller must drop the
// connection.
//
// `MAX_MESSAGE_SIZE` (16 MB) protects against unbounded buffering from a
// corrupt length prefix.

use crate::error::FrameError;

/// Maximum allowed payload size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Separator between the length prefix and the payload.
const PREFIX_SEPARATOR: &[u8] = b": ";

/// Longest accepted run of prefix digits. Anything longer is corrupt.
const MAX_PREFIX_DIGITS: usize = 10;

/// Wrap a payload into a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let prefix = format!("{}: ", payload.len());
    let mut frame = Vec::with_capacity(prefix.len() + payload.len());
    frame.extend_from_slice(prefix.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Incremental frame reassembler for one byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes read from the stream.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the next complete frame payload, if the buffer holds one.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some((payload_len, header_len)) = self.parse_prefix()? else {
            return Ok(None);
        };
        let total = header_len + payload_len;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let payload = self.buffer[header_len..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(payload))
    }

    /// Parse `"<digits>: "` at the head of the buffer. Returns the payload
    /// length and the header length once the whole header is buffered.
    fn parse_prefix(&self) -> Result<Option<(usize, usize)>, FrameError> {
        let mut digits = 0;
        for &byte in &self.buffer {
            if byte.is_ascii_digit() {
                digits += 1;
                if digits > MAX_PREFIX_DIGITS {
                    return Err(FrameError::PrefixTooLong);
                }
            } else if byte == PREFIX_SEPARATOR[0] {
                break;
            } else {
                return Err(FrameError::InvalidPrefix(byte));
            }
        }
        if digits == self.buffer.len() {
            // Still waiting for the separator.
            return Ok(None);
        }
        if digits == 0 {
            return Err(FrameError::EmptyPrefix);
        }

        let header_len = digits + PREFIX_SEPARATOR.len();
        if self.buffer.len() < header_len {
            return Ok(None);
        }
        let separator = &self.buffer[digits..header_len];
        if separator != PREFIX_SEPARATOR {
            return Err(FrameError::InvalidPrefix(separator[1]));
        }

        // Digits are ASCII, so this cannot fail short of overflow, which the
        // digit cap already rules out on 64-bit targets.
        let text = std::str::from_utf8(&self.buffer[..digits])
            .map_err(|_| FrameError::InvalidPrefix(self.buffer[0]))?;
        let payload_len: usize = text.parse().map_err(|_| FrameError::PrefixTooLong)?;
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(FrameError::TooLarge(payload_len));
        }
        Ok(Some((payload_len, header_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(frame) = decoder.pop().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_prefixes_byte_length() {
        assert_eq!(encode_frame(b"ALIVE Alice"), b"11: ALIVE Alice".to_vec());
        // Length counts bytes, not characters.
        assert_eq!(encode_frame("é".as_bytes()), b"2: \xc3\xa9".to_vec());
    }

    #[test]
    fn single_frame() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&encode_frame(b"QUIT Alice"));
        assert_eq!(drain(&mut decoder), vec![b"QUIT Alice".to_vec()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn two_frames_in_one_push() {
        let mut wire = encode_frame(b"ALIVE Alice");
        wire.extend(encode_frame(b"QUIT Alice"));
        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        assert_eq!(
            drain(&mut decoder),
            vec![b"ALIVE Alice".to_vec(), b"QUIT Alice".to_vec()]
        );
    }

    #[test]
    fn frame_split_into_every_chunk_size() {
        let payload = b"MOVE Alice 3 4 120.5 12 7 0 -11 22 100.25 -3.5".to_vec();
        let wire = encode_frame(&payload);
        for chunk_size in 1..=wire.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder.push(chunk);
                frames.extend(drain(&mut decoder));
            }
            assert_eq!(frames, vec![payload.clone()], "chunk size {chunk_size}");
        }
    }

    #[test]
    fn frames_straddling_read_chunk_boundary() {
        let big = vec![b'x'; 20_000];
        let mut wire = encode_frame(b"ALIVE Alice");
        wire.extend(encode_frame(&big));
        wire.extend(encode_frame(b"QUIT Alice"));

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in wire.chunks(8 * 1024) {
            decoder.push(chunk);
            frames.extend(drain(&mut decoder));
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1], big);
        assert_eq!(frames[2], b"QUIT Alice".to_vec());
    }

    #[test]
    fn empty_payload() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"0: ");
        assert_eq!(drain(&mut decoder), vec![Vec::<u8>::new()]);
    }

    #[test]
    fn incomplete_header_waits() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"12");
        assert_eq!(decoder.pop(), Ok(None));
        decoder.push(b":");
        assert_eq!(decoder.pop(), Ok(None));
        decoder.push(b" ALIVE");
        assert_eq!(decoder.pop(), Ok(None));
        decoder.push(b" Alice");
        assert_eq!(decoder.pop(), Ok(Some(b"ALIVE Alice".to_vec())));
    }

    #[test]
    fn rejects_non_digit_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"ab: hello");
        assert_eq!(decoder.pop(), Err(FrameError::InvalidPrefix(b'a')));
    }

    #[test]
    fn rejects_missing_digits() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b": hello");
        assert_eq!(decoder.pop(), Err(FrameError::EmptyPrefix));
    }

    #[test]
    fn rejects_bad_separator() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"5:hello");
        assert_eq!(decoder.pop(), Err(FrameError::InvalidPrefix(b'h')));
    }

    #[test]
    fn rejects_runaway_prefix() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"12345678901");
        assert_eq!(decoder.pop(), Err(FrameError::PrefixTooLong));
    }

    #[test]
    fn rejects_oversized_length() {
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("{}: ", MAX_MESSAGE_SIZE + 1).as_bytes());
        assert_eq!(
            decoder.pop(),
            Err(FrameError::TooLarge(MAX_MESSAGE_SIZE + 1))
        );
    }
}
