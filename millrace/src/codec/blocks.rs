//! The serializer and deserializer blocks built on the mVRL codec.

use std::any::Any;

use crate::block::{Block, BlockSetup, WorkIo};
use crate::buffer::BufferChunk;
use crate::codec::frame::{FrameDecoder, FrameEncoder, WireEvent};
use crate::dtype::DType;
use crate::error::Error;

/// Serializes the streams, labels, and messages of its input ports into
/// one mVRL byte stream on output `0`.
///
/// Input ports are indexed from zero; the index becomes the frame
/// stream-id. Messages are framed as they arrive, labels ahead of the
/// buffers they annotate, then the visible stream bytes.
pub struct Serializer {
    ports: usize,
    encoder: FrameEncoder,
}

impl Serializer {
    /// A serializer with `ports` input ports.
    pub fn new(ports: usize) -> Self {
        Self {
            ports: ports.max(1),
            encoder: FrameEncoder::new(),
        }
    }
}

impl Block for Serializer {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("Serializer");
        for index in 0..self.ports {
            setup.input(index, DType::u8(), "");
        }
        setup.output(0, DType::u8(), "");
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let (inputs, outputs) = io.split();
        let output = &mut outputs[0];

        for (index, input) in inputs.iter_mut().enumerate() {
            let stream = index as u32;

            // Messages are asynchronous; frame them first.
            while let Some(value) = input.pop_message() {
                match self.encoder.encode(&WireEvent::Message { stream, value }) {
                    Ok(frame) => output.post_buffer(BufferChunk::from_vec(frame, DType::u8())),
                    Err(error) => {
                        tracing::warn!(%error, "unserializable message skipped");
                    }
                }
            }

            // Labels go ahead of the stream bytes they annotate.
            for label in input.take_labels() {
                match self.encoder.encode(&WireEvent::Label { stream, label }) {
                    Ok(frame) => output.post_buffer(BufferChunk::from_vec(frame, DType::u8())),
                    Err(error) => {
                        tracing::warn!(%error, "unserializable label skipped");
                    }
                }
            }

            let visible = input.buffer().len();
            if visible > 0 {
                let event = WireEvent::Buffer {
                    stream,
                    total_elements: input.total_elements(),
                    data: input.buffer().to_vec(),
                };
                match self.encoder.encode(&event) {
                    Ok(frame) => {
                        output.post_buffer(BufferChunk::from_vec(frame, DType::u8()));
                        input.consume(visible)?;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "stream frame skipped");
                    }
                }
            }
        }
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Deserializes an mVRL byte stream from input `0` onto its output ports.
///
/// The frame stream-id selects the output port; a stream-id with no
/// matching port is an assertion violation that fails the block.
pub struct Deserializer {
    ports: usize,
    decoder: FrameDecoder,
}

impl Deserializer {
    /// A deserializer with `ports` output ports.
    pub fn new(ports: usize) -> Self {
        Self {
            ports: ports.max(1),
            decoder: FrameDecoder::new(),
        }
    }
}

impl Block for Deserializer {
    fn setup(&mut self, setup: &mut BlockSetup) {
        setup.set_name("Deserializer");
        setup.input(0, DType::u8(), "");
        for index in 0..self.ports {
            setup.output(index, DType::u8(), "");
        }
    }

    fn work(&mut self, io: &mut WorkIo) -> Result<(), Error> {
        let (inputs, outputs) = io.split();
        let input = &mut inputs[0];

        let visible = input.buffer().len();
        if visible > 0 {
            self.decoder.push(input.buffer());
            input.consume(visible)?;
        }

        while let Some(event) = self.decoder.next() {
            let stream = match &event {
                WireEvent::Buffer { stream, .. }
                | WireEvent::Label { stream, .. }
                | WireEvent::Message { stream, .. } => *stream as usize,
            };
            if stream >= outputs.len() {
                return Err(Error::assertion(format!(
                    "frame has stream-id {stream}, but the block has {} outputs",
                    outputs.len()
                )));
            }
            let output = &mut outputs[stream];
            match event {
                WireEvent::Buffer { data, .. } => {
                    output.post_buffer(BufferChunk::from_vec(data, DType::u8()));
                }
                WireEvent::Label { label, .. } => {
                    output.post_label_at(label);
                }
                WireEvent::Message { value, .. } => {
                    output.post_message(value);
                }
            }
        }
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}
