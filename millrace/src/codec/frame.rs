//! mVRL frame encoding and the resynchronizing decoder.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::label::Label;
use crate::object::{Value, WireValue};

/// Leading frame magic, the bytes `mVRL`.
pub const FRAME_MAGIC: u32 = 0x6D56_524C;
/// Trailing frame magic, the bytes `VEND`.
pub const END_MAGIC: u32 = 0x5645_4E44;

/// The smallest legal frame: header, empty payload, trailer.
pub const MIN_FRAME_BYTES: usize = 20;
/// A practical cap preventing memory blow-up on a malicious stream.
pub const MAX_FRAME_BYTES: usize = 128 * 1024;

const VITA_EXT: u32 = 1 << 31;
const VITA_TSF: u32 = 1 << 30;
const VITA_SID: u32 = 1 << 28;

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

/// One event carried by an mVRL frame.
#[derive(Clone, Debug, PartialEq)]
pub enum WireEvent {
    /// Raw stream bytes; the timestamp carries the producer's total
    /// element count at the start of the frame.
    Buffer {
        /// Destination port index at the deserializer.
        stream: u32,
        /// Producer total elements when the frame began.
        total_elements: u64,
        /// The element bytes.
        data: Vec<u8>,
    },
    /// A label; its absolute index rides in the timestamp field.
    Label {
        /// Destination port index at the deserializer.
        stream: u32,
        /// The label, with an absolute element index.
        label: Label,
    },
    /// An out-of-band message.
    Message {
        /// Destination port index at the deserializer.
        stream: u32,
        /// The message payload.
        value: Value,
    },
}

#[derive(Serialize, Deserialize)]
struct WireLabel {
    id: String,
    width: u64,
    data: WireValue,
}

fn label_to_blob(label: &Label) -> Result<Vec<u8>, Error> {
    let wire = WireLabel {
        id: label.id.clone(),
        width: label.width,
        data: label.data.to_wire()?,
    };
    bincode::serialize(&wire).map_err(|e| Error::runtime(format!("label serialization: {e}")))
}

fn label_from_blob(blob: &[u8], index: u64) -> Result<Label, Error> {
    let wire: WireLabel = bincode::deserialize(blob)
        .map_err(|e| Error::runtime(format!("label deserialization: {e}")))?;
    Ok(Label {
        id: wire.id,
        data: Value::from_wire(wire.data),
        index,
        width: wire.width,
    })
}

/// Lays out one frame.
///
/// The length word carries the unpadded byte count (header + payload +
/// trailer); the frame itself is padded up to a 4-byte boundary with the
/// trailer in its last word.
pub fn encode_frame(
    seq: u32,
    stream: u32,
    ext: bool,
    tsf: Option<u64>,
    payload: &[u8],
) -> Result<Vec<u8>, Error> {
    let header_bytes = if tsf.is_some() { 24 } else { 16 };
    let frame_bytes = header_bytes + payload.len() + 4;
    if frame_bytes > MAX_FRAME_BYTES {
        return Err(Error::assertion(format!(
            "frame of {frame_bytes} bytes exceeds the {MAX_FRAME_BYTES} byte cap"
        )));
    }
    let padded_bytes = pad4(frame_bytes);
    let vita_words = (padded_bytes / 4 - 3) as u32;

    let mut frame = vec![0u8; padded_bytes];
    BigEndian::write_u32(&mut frame[0..4], FRAME_MAGIC);
    BigEndian::write_u32(
        &mut frame[4..8],
        ((seq & 0xfff) << 20) | (frame_bytes as u32 & 0xfffff),
    );
    let mut vita = VITA_SID | ((seq & 0xf) << 16) | (vita_words & 0xffff);
    if ext {
        vita |= VITA_EXT;
    }
    if tsf.is_some() {
        vita |= VITA_TSF;
    }
    BigEndian::write_u32(&mut frame[8..12], vita);
    BigEndian::write_u32(&mut frame[12..16], stream);
    if let Some(tsf) = tsf {
        BigEndian::write_u64(&mut frame[16..24], tsf);
    }
    frame[header_bytes..header_bytes + payload.len()].copy_from_slice(payload);
    let end = padded_bytes - 4;
    BigEndian::write_u32(&mut frame[end..], END_MAGIC);
    Ok(frame)
}

/// Frames events with a per-stream sequence number.
#[derive(Default)]
pub struct FrameEncoder {
    seqs: HashMap<u32, u32>,
}

impl FrameEncoder {
    /// A fresh encoder with every stream sequence at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self, stream: u32) -> u32 {
        let entry = self.seqs.entry(stream).or_insert(0);
        let seq = *entry;
        *entry = (seq + 1) & 0xfff;
        seq
    }

    /// Encodes one event into a frame.
    ///
    /// Serialization failures of user payloads (opaque values) surface as
    /// errors without consuming a sequence number.
    pub fn encode(&mut self, event: &WireEvent) -> Result<Vec<u8>, Error> {
        match event {
            WireEvent::Buffer {
                stream,
                total_elements,
                data,
            } => {
                let seq = self.next_seq(*stream);
                encode_frame(seq, *stream, false, Some(*total_elements), data)
            }
            WireEvent::Label { stream, label } => {
                let payload = label_to_blob(label)?;
                let seq = self.next_seq(*stream);
                encode_frame(seq, *stream, true, Some(label.index), &payload)
            }
            WireEvent::Message { stream, value } => {
                let payload = value.to_blob()?;
                let seq = self.next_seq(*stream);
                encode_frame(seq, *stream, true, None, &payload)
            }
        }
    }
}

/// A resynchronizing frame scanner.
///
/// Feed bytes with [`FrameDecoder::push`] and poll events with
/// [`FrameDecoder::next`]. Any consistency failure advances the scan by a
/// single byte and resumes; sequence discontinuities are counted and
/// logged but never fatal.
#[derive(Default)]
pub struct FrameDecoder {
    acc: Vec<u8>,
    pos: usize,
    total_read: u64,
    expected_seq: HashMap<u32, u32>,
    seq_gaps: u64,
    decode_errors: u64,
}

impl FrameDecoder {
    /// A fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends transport bytes to the scan window.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.acc.drain(..self.pos);
            self.pos = 0;
        }
        self.acc.extend_from_slice(bytes);
    }

    /// Total bytes consumed: skipped junk plus whole (padded) frames.
    pub fn total_bytes_read(&self) -> u64 {
        self.total_read
    }

    /// Observed sequence discontinuities.
    pub fn seq_gaps(&self) -> u64 {
        self.seq_gaps
    }

    /// Frames whose payload failed to deserialize (frame skipped).
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    fn skip_one(&mut self) {
        self.pos += 1;
        self.total_read += 1;
    }

    /// Scans for the next valid frame and decodes its event.
    ///
    /// Returns `None` when the window holds no complete frame.
    pub fn next(&mut self) -> Option<WireEvent> {
        loop {
            let base = self.pos;
            let available = self.acc.len() - base;
            if available < MIN_FRAME_BYTES {
                return None;
            }
            if BigEndian::read_u32(&self.acc[base..base + 4]) != FRAME_MAGIC {
                self.skip_one();
                continue;
            }
            let word1 = BigEndian::read_u32(&self.acc[base + 4..base + 8]);
            let frame_bytes = (word1 & 0xfffff) as usize;
            let seq = word1 >> 20;
            if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&frame_bytes) {
                self.skip_one();
                continue;
            }
            let padded_bytes = pad4(frame_bytes);
            if available < padded_bytes {
                // A fragment; wait for more transport bytes.
                return None;
            }
            if BigEndian::read_u32(&self.acc[base + padded_bytes - 4..base + padded_bytes])
                != END_MAGIC
            {
                self.skip_one();
                continue;
            }
            let vita = BigEndian::read_u32(&self.acc[base + 8..base + 12]);
            let vita_consistent = vita & VITA_SID != 0
                && ((vita >> 16) & 0xf) == (seq & 0xf)
                && (vita & 0xffff) as usize == padded_bytes / 4 - 3;
            if !vita_consistent {
                self.skip_one();
                continue;
            }
            let has_tsf = vita & VITA_TSF != 0;
            let ext = vita & VITA_EXT != 0;
            let header_bytes = if has_tsf { 24 } else { 16 };
            if frame_bytes < header_bytes + 4 {
                self.skip_one();
                continue;
            }
            let stream = BigEndian::read_u32(&self.acc[base + 12..base + 16]);
            let tsf = if has_tsf {
                BigEndian::read_u64(&self.acc[base + 16..base + 24])
            } else {
                0
            };
            let payload = self.acc[base + header_bytes..base + frame_bytes - 4].to_vec();

            // The frame is consistent; it is consumed regardless of what
            // the payload deserializes to.
            self.pos += padded_bytes;
            self.total_read += padded_bytes as u64;

            if let Some(&expected) = self.expected_seq.get(&stream) {
                if expected != seq {
                    self.seq_gaps += 1;
                    tracing::warn!(stream, expected, got = seq, "mVRL sequence discontinuity");
                }
            }
            self.expected_seq.insert(stream, (seq + 1) & 0xfff);

            if !ext {
                return Some(WireEvent::Buffer {
                    stream,
                    total_elements: tsf,
                    data: payload,
                });
            }
            if has_tsf {
                match label_from_blob(&payload, tsf) {
                    Ok(label) => return Some(WireEvent::Label { stream, label }),
                    Err(error) => {
                        self.decode_errors += 1;
                        tracing::error!(%error, "mVRL label payload skipped");
                        continue;
                    }
                }
            }
            match Value::from_blob(&payload) {
                Ok(value) => return Some(WireEvent::Message { stream, value }),
                Err(error) => {
                    self.decode_errors += 1;
                    tracing::error!(%error, "mVRL message payload skipped");
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
    fn frame_layout_is_bit_exact() {
        let frame = encode_frame(5, 2, false, Some(100), &[0xAB; 6]).unwrap();
        // 24 header bytes + 6 payload + 4 trailer = 34, padded to 36.
        assert_eq!(frame.len(), 36);
        assert_eq!(&frame[0..4], b"mVRL");
        let word1 = BigEndian::read_u32(&frame[4..8]);
        assert_eq!(word1 >> 20, 5);
        assert_eq!(word1 & 0xfffff, 34);
        let vita = BigEndian::read_u32(&frame[8..12]);
        assert_ne!(vita & VITA_TSF, 0);
        assert_eq!(vita & VITA_EXT, 0);
        assert_ne!(vita & VITA_SID, 0);
        assert_eq!((vita >> 16) & 0xf, 5);
        assert_eq!(vita & 0xffff, 36 / 4 - 3);
        assert_eq!(BigEndian::read_u32(&frame[12..16]), 2);
        assert_eq!(BigEndian::read_u64(&frame[16..24]), 100);
        assert_eq!(&frame[24..30], &[0xAB; 6]);
        assert_eq!(&frame[32..36], b"VEND");
    }

    #[test]
    fn round_trip_with_leading_junk() {
        let events = vec![
            WireEvent::Buffer {
                stream: 0,
                total_elements: 100,
                data: vec![7u8; 17],
            },
            WireEvent::Label {
                stream: 0,
                label: Label::new("T", Value::Int(7), 5),
            },
            WireEvent::Message {
                stream: 0,
                value: Value::Str("hello".into()),
            },
        ];
        let mut encoder = FrameEncoder::new();
        let mut wire = vec![0x00, 0xFF, 0xAA];
        for event in &events {
            wire.extend_from_slice(&encoder.encode(event).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        decoder.push(&wire);
        let mut decoded = Vec::new();
        while let Some(event) = decoder.next() {
            decoded.push(event);
        }
        assert_eq!(decoded, events);
        assert_eq!(decoder.total_bytes_read(), wire.len() as u64);
        assert_eq!(decoder.seq_gaps(), 0);
    }

    #[test]
    fn resync_after_corruption() {
        let mut encoder = FrameEncoder::new();
        let good = encoder
            .encode(&WireEvent::Message {
                stream: 1,
                value: Value::Int(42),
            })
            .unwrap();
        let mut corrupted = good.clone();
        // Damage the trailer so the first copy fails validation.
        let len = corrupted.len();
        corrupted[len - 1] = 0;
        let second = encoder
            .encode(&WireEvent::Message {
                stream: 1,
                value: Value::Int(43),
            })
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&corrupted);
        decoder.push(&second);
        // The damaged frame is scanned through; the next one decodes.
        let event = decoder.next().unwrap();
        assert_eq!(
            event,
            WireEvent::Message {
                stream: 1,
                value: Value::Int(43)
            }
        );
        assert!(decoder.next().is_none());
    }

    #[test]
    fn seq_redundancy_mismatch_resyncs() {
        let mut frame = encode_frame(3, 0, false, Some(0), &[1, 2, 3, 4]).unwrap();
        // Flip the redundant seq bits in the vita word.
        let mut vita = BigEndian::read_u32(&frame[8..12]);
        vita ^= 0xf << 16;
        BigEndian::write_u32(&mut frame[8..12], vita);

        let mut decoder = FrameDecoder::new();
        decoder.push(&frame);
        // The frame is rejected and scanned through byte-by-byte.
        assert!(decoder.next().is_none());
        assert!(decoder.total_bytes_read() > 0);
    }

    #[test]
    fn fragments_wait_for_completion() {
        let mut encoder = FrameEncoder::new();
        let frame = encoder
            .encode(&WireEvent::Buffer {
                stream: 0,
                total_elements: 0,
                data: vec![9u8; 40],
            })
            .unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..frame.len() / 2]);
        assert!(decoder.next().is_none());
        decoder.push(&frame[frame.len() / 2..]);
        let event = decoder.next().unwrap();
        match event {
            WireEvent::Buffer { data, .. } => assert_eq!(data, vec![9u8; 40]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn oversize_frames_are_rejected() {
        assert!(encode_frame(0, 0, false, None, &vec![0u8; MAX_FRAME_BYTES]).is_err());
    }

    #[test]
    fn gap_detection_counts_lost_frames() {
        let mut encoder = FrameEncoder::new();
        let first = encoder
            .encode(&WireEvent::Message {
                stream: 0,
                value: Value::Int(1),
            })
            .unwrap();
        let _lost = encoder
            .encode(&WireEvent::Message {
                stream: 0,
                value: Value::Int(2),
            })
            .unwrap();
        let third = encoder
            .encode(&WireEvent::Message {
                stream: 0,
                value: Value::Int(3),
            })
            .unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.push(&first);
        decoder.push(&third);
        assert!(decoder.next().is_some());
        assert!(decoder.next().is_some());
        assert_eq!(decoder.seq_gaps(), 1);
    }
}
