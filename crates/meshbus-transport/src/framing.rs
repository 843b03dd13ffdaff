//! Length-prefixed framing for byte-stream transports.
//!
//! Each frame is a 4-byte big-endian length followed by that many payload
//! bytes. [`FrameAccumulator`] buffers stream reads and yields complete
//! frames; [`encode_frame`] produces the wire form.

use crate::error::TransportError;

pub const LEN_PREFIX: usize = 4;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>, TransportError> {
    if payload.len() > max_len {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: max_len,
    })?;
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Stateful buffer that turns arbitrary stream reads into whole frames.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    max_len: usize,
}

impl FrameAccumulator {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_len,
        }
    }

    /// Feed bytes read from the stream and extract every complete frame.
    ///
    /// A length prefix above the limit is an error; the stream cannot be
    /// resynchronised after that, so the caller should drop the connection.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, TransportError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = &self.buffer[consumed..];
            let Some(prefix) = rest.first_chunk::<LEN_PREFIX>() else {
                break;
            };
            let len = u32::from_be_bytes(*prefix) as usize;
            if len > self.max_len {
                return Err(TransportError::FrameTooLarge {
                    len,
                    max: self.max_len,
                });
            }
            if rest.len() < LEN_PREFIX + len {
                break;
            }
            frames.push(rest[LEN_PREFIX..LEN_PREFIX + len].to_vec());
            consumed += LEN_PREFIX + len;
        }
        self.buffer.drain(..consumed);
        Ok(frames)
    }

    /// Bytes buffered towards an incomplete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn arbitrary_read_boundaries_preserve_frames(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
            chunk in 1usize..16,
        ) {
            let mut wire = Vec::new();
            for p in &payloads {
                wire.extend(encode_frame(p, 1024).unwrap());
            }
            let mut acc = FrameAccumulator::new(1024);
            let mut out = Vec::new();
            for piece in wire.chunks(chunk) {
                out.extend(acc.feed(piece).unwrap());
            }
            prop_assert_eq!(out, payloads);
            prop_assert_eq!(acc.pending(), 0);
        }
    }
}
