// SPDX-License-Identifier: BSD-3-Clause
//! HDLC-style byte framing: a 0x7E flag on each end, 0x7E/0x7D escaped in
//! the body, CRC-16/CCITT trailer. Spreadtrum BSL traffic and Qualcomm diag
//! both ride on this.

use crc::{Algorithm, Crc};

use crate::error::FrameError;

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// CRC-16/CCITT with the parameters the Qualcomm tooling world settled on
/// (reflected, init and xorout 0xFFFF; also known as X-25).
pub const CRC_CCITT_ALG: Algorithm<u16> = Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xffff,
    refin: true,
    refout: true,
    xorout: 0xffff,
    check: 0x906e,
    residue: 0xf0b8,
};

pub const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_CCITT_ALG);

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == FLAG || byte == ESCAPE {
        out.push(ESCAPE);
        out.push(byte ^ ESCAPE_XOR);
    } else {
        out.push(byte);
    }
}

/// Frame `payload`: flag, escaped body, escaped little-endian CRC of the
/// unescaped body, flag.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let crc = CRC_CCITT.checksum(payload);

    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(FLAG);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    for b in crc.to_le_bytes() {
        push_escaped(&mut out, b);
    }
    out.push(FLAG);
    out
}

/// Unescape and CRC-check one frame body (the bytes between two flags).
fn decode_body(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut raw = Vec::with_capacity(body.len());
    let mut iter = body.iter();
    while let Some(&b) = iter.next() {
        match b {
            ESCAPE => match iter.next() {
                Some(&e) if e == FLAG ^ ESCAPE_XOR || e == ESCAPE ^ ESCAPE_XOR => {
                    raw.push(e ^ ESCAPE_XOR)
                }
                Some(_) => return Err(FrameError::BadFrame),
                None => return Err(FrameError::Truncated),
            },
            FLAG => return Err(FrameError::BadFrame),
            _ => raw.push(b),
        }
    }

    if raw.len() < 2 {
        return Err(FrameError::Truncated);
    }
    let (payload, trailer) = raw.split_at(raw.len() - 2);
    let got = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = CRC_CCITT.checksum(payload);
    if got != computed {
        return Err(FrameError::BadChecksum { got, computed });
    }
    Ok(payload.to_vec())
}

/// Decode a complete `7E .. 7E` frame.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, FrameError> {
    if frame.len() < 2 || frame[0] != FLAG || frame[frame.len() - 1] != FLAG {
        return Err(FrameError::BadFrame);
    }
    decode_body(&frame[1..frame.len() - 1])
}

/// Incremental deframer over an arbitrarily chopped byte stream.
///
/// Stray flags between frames decode as empty frames and are discarded. On
/// a bad frame the scan position advances by a single byte, so resync after
/// garbage is O(n) and never skips a valid frame start.
#[derive(Debug)]
pub struct Deframer {
    buf: Vec<u8>,
    max_frame: usize,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl Deframer {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame payload, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. Garbage is consumed silently
    /// one byte at a time; only an over-long unterminated frame is an error.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            // Drop anything ahead of the first flag; it can never be part
            // of a frame we can validate.
            let Some(start) = self.buf.iter().position(|&b| b == FLAG) else {
                self.buf.clear();
                return Ok(None);
            };
            self.buf.drain(..start);

            let Some(end_rel) = self.buf[1..].iter().position(|&b| b == FLAG) else {
                if self.buf.len() > self.max_frame {
                    self.buf.clear();
                    return Err(FrameError::Oversize {
                        limit: self.max_frame,
                    });
                }
                return Ok(None);
            };
            let end = end_rel + 1;

            if end == 1 {
                // Adjacent flags: an empty frame, or the closing flag of the
                // previous frame doubling as our opener. Skip one byte.
                self.buf.drain(..1);
                continue;
            }

            match decode_body(&self.buf[1..end].to_vec()) {
                Ok(payload) => {
                    // The closing flag stays; it may open the next frame.
                    self.buf.drain(..end);
                    return Ok(Some(payload));
                }
                Err(_) => {
                    self.buf.drain(..1);
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_parameters_match_the_reference_check() {
        assert_eq!(CRC_CCITT.checksum(b"123456789"), 0x906e);
    }

    #[test]
    fn empty_bsl_connect_payload_frames_as_expected() {
        // A BSL message with type 0x0004 and no data
        let payload = [0x00, 0x04, 0x00, 0x00];
        let frame = encode(&payload);

        let crc = CRC_CCITT.checksum(&payload).to_le_bytes();
        assert_eq!(
            frame,
            vec![0x7E, 0x00, 0x04, 0x00, 0x00, crc[0], crc[1], 0x7E]
        );
        assert_eq!(decode(&frame).unwrap(), payload);
    }

    #[test]
    fn escapes_flags_and_escapes_in_the_body() {
        let payload = [0x7E, 0x11, 0x7D, 0x22];
        let frame = encode(&payload);

        // Escaped region: 7D 5E 11 7D 5D 22
        assert_eq!(&frame[1..7], &[0x7D, 0x5E, 0x11, 0x7D, 0x5D, 0x22]);
        assert_eq!(decode(&frame).unwrap(), payload);
    }

    #[test]
    fn round_trips_every_byte_value() {
        let payload: Vec<u8> = (0..=255).collect();
        assert_eq!(decode(&encode(&payload)).unwrap(), payload);
    }

    #[test]
    fn rejects_a_corrupted_trailer() {
        let mut frame = encode(&[1, 2, 3]);
        let n = frame.len();
        frame[n - 2] ^= 0xFF;
        assert!(matches!(
            decode(&frame),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn deframer_reassembles_split_input() {
        let frame = encode(&[0xAA, 0xBB, 0xCC]);
        let mut d = Deframer::default();

        let (a, b) = frame.split_at(3);
        d.push(a);
        assert_eq!(d.next_frame().unwrap(), None);
        d.push(b);
        assert_eq!(d.next_frame().unwrap(), Some(vec![0xAA, 0xBB, 0xCC]));
    }

    #[test]
    fn deframer_resynchronises_after_garbage() {
        let mut d = Deframer::default();
        d.push(&[0x13, 0x37, 0xFF]); // noise with no flag
        d.push(&encode(&[1, 2]));
        d.push(&[0x7E, 0x7E]); // stray flags
        d.push(&encode(&[3, 4]));

        assert_eq!(d.next_frame().unwrap(), Some(vec![1, 2]));
        assert_eq!(d.next_frame().unwrap(), Some(vec![3, 4]));
        assert_eq!(d.next_frame().unwrap(), None);
    }

    #[test]
    fn deframer_survives_a_corrupt_frame_between_good_ones() {
        let mut d = Deframer::default();
        d.push(&encode(&[1]));
        let mut bad = encode(&[9, 9, 9]);
        bad[2] ^= 0x55;
        d.push(&bad);
        d.push(&encode(&[2]));

        assert_eq!(d.next_frame().unwrap(), Some(vec![1]));
        assert_eq!(d.next_frame().unwrap(), Some(vec![2]));
    }

    #[test]
    fn deframer_reports_oversize_runaway_frames() {
        let mut d = Deframer::new(16);
        d.push(&[0x7E]);
        d.push(&[0u8; 32]);
        assert!(matches!(
            d.next_frame(),
            Err(FrameError::Oversize { limit: 16 })
        ));
    }
}
