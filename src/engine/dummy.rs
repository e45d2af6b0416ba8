// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy engine whose only purpose is to let the session run so we can test
//! it in isolation.
//!
//! The dummy parser understands a trivial bitstream made of units, all integers big endian:
//!
//! * sequence unit: `'S'`, codec (u32), coded width (u32), coded height (u32), chroma format
//!   (u8), minimum number of decode surfaces (u8);
//! * picture unit: `'P'`, picture index (u8), flags (u8), payload length (u16), payload.
//!
//! Pictures are displayed in decode order, after `max_display_delay` more pictures have been
//! decoded or at the end of the stream. [`StreamWriter`] produces such streams.
//!
//! The parser runs either inline, invoking the callbacks from within [`DecodeEngine::parse`], or
//! on its own thread, in which case `parse` only queues the packet.

use std::collections::VecDeque;
use std::io::Cursor;
use std::io::Read;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::thread;
use std::thread::JoinHandle;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::engine::CallbackTable;
use crate::engine::DecodeEngine;
use crate::engine::DecoderCreateInfo;
use crate::engine::DisplayInfo;
use crate::engine::EngineError;
use crate::engine::EngineResult;
use crate::engine::ParserParams;
use crate::engine::PictureParams;
use crate::engine::SourcePacket;
use crate::engine::VideoFormat;
use crate::ChromaFormat;
use crate::Codec;
use crate::Rational;
use crate::Rect;
use crate::Resolution;

const TAG_SEQUENCE: u8 = b'S';
const TAG_PICTURE: u8 = b'P';

/// The picture is a field rather than a frame.
pub const FIELD_PIC: u8 = 1 << 0;
pub const BOTTOM_FIELD: u8 = 1 << 1;
/// Second field of a pair. Decoded into the surface of the first field, and not displayed
/// separately.
pub const SECOND_FIELD: u8 = 1 << 2;
pub const INTRA_PIC: u8 = 1 << 3;
pub const REF_PIC: u8 = 1 << 4;
pub const TOP_FIELD_FIRST: u8 = 1 << 5;

pub const STATUS_INVALID_BITSTREAM: i32 = 1;
pub const STATUS_DECODE_FAILED: i32 = 2;
pub const STATUS_INVALID_SURFACE: i32 = 3;
pub const STATUS_CREATE_FAILED: i32 = 4;
pub const STATUS_PARSER_GONE: i32 = 5;

/// Builds streams for the dummy parser.
#[derive(Debug, Default)]
pub struct StreamWriter {
    buf: BytesMut,
}

impl StreamWriter {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn sequence(
        mut self,
        codec: Codec,
        coded_resolution: Resolution,
        chroma_format: ChromaFormat,
        min_num_decode_surfaces: u8,
    ) -> Self {
        self.buf.put_u8(TAG_SEQUENCE);
        self.buf.put_u32(codec as u32);
        self.buf.put_u32(coded_resolution.width);
        self.buf.put_u32(coded_resolution.height);
        self.buf.put_u8(chroma_format as u8);
        self.buf.put_u8(min_num_decode_surfaces);
        self
    }

    /// Adds a picture unit. `flags` is a combination of the flag constants of this module.
    pub fn picture(mut self, index: u8, flags: u8, payload: &[u8]) -> Self {
        self.buf.put_u8(TAG_PICTURE);
        self.buf.put_u8(index);
        self.buf.put_u8(flags);
        self.buf.put_u16(payload.len() as u16);
        self.buf.put_slice(payload);
        self
    }

    /// Adds a progressive frame.
    pub fn frame(self, index: u8, payload: &[u8]) -> Self {
        self.picture(index, REF_PIC, payload)
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Calls received by a [`DummyEngine`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ParserCreated { sequence_header_len: usize },
    ParserDestroyed,
    Parsed { len: usize, end_of_stream: bool },
    DecoderCreated(DecoderCreateInfo),
    DecoderDestroyed,
    Decoded(usize),
}

#[derive(Debug, Default)]
struct Shared {
    events: Mutex<Vec<EngineEvent>>,
    /// Last payload decoded into each surface.
    surfaces: Mutex<Vec<Bytes>>,
    decode_calls: AtomicUsize,
    live_parsers: AtomicUsize,
    live_decoders: AtomicUsize,
}

impl Shared {
    fn record(&self, event: EngineEvent) {
        log::trace!("dummy engine: {event:?}");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Dummy engine that can be used for any codec.
#[derive(Debug, Default)]
pub struct DummyEngine {
    threaded: bool,
    fail_decode_at: Option<usize>,
    panic_decode_at: Option<usize>,
    fail_create_decoder: bool,
    shared: Arc<Shared>,
}

impl DummyEngine {
    pub fn new() -> Self {
        Default::default()
    }

    /// Run the parser on its own thread.
    pub fn threaded(mut self) -> Self {
        self.threaded = true;
        self
    }

    /// Make the `n`th decode call (starting at 0) fail.
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Make the `n`th decode call (starting at 0) panic.
    pub fn panic_decode_at(mut self, n: usize) -> Self {
        self.panic_decode_at = Some(n);
        self
    }

    pub fn fail_create_decoder(mut self) -> Self {
        self.fail_create_decoder = true;
        self
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the payload of the last picture decoded into surface `index`.
    pub fn surface(&self, index: usize) -> Option<Bytes> {
        self.shared
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn decode_calls(&self) -> usize {
        self.shared.decode_calls.load(Ordering::SeqCst)
    }

    pub fn live_parsers(&self) -> usize {
        self.shared.live_parsers.load(Ordering::SeqCst)
    }

    pub fn live_decoders(&self) -> usize {
        self.shared.live_decoders.load(Ordering::SeqCst)
    }
}

/// Parsing state, owned either by the caller of `parse` or by the parser thread.
struct ParserCore {
    callbacks: CallbackTable,
    max_decode_surfaces: usize,
    max_display_delay: usize,
    pending_display: VecDeque<DisplayInfo>,
}

impl ParserCore {
    fn process(
        &mut self,
        payload: &[u8],
        timestamp: Option<i64>,
        end_of_stream: bool,
    ) -> EngineResult<()> {
        let mut cursor = Cursor::new(payload);
        while (cursor.position() as usize) < payload.len() {
            match self.process_unit(&mut cursor, timestamp) {
                Ok(true) => (),
                // The callback reported the failure to its owner already, skip the rest of the
                // packet.
                Ok(false) => return Ok(()),
                Err(e) => {
                    log::debug!("dummy parser: {e:#}");
                    return Err(EngineError::Status {
                        call: "parse",
                        status: STATUS_INVALID_BITSTREAM,
                    });
                }
            }
        }

        if end_of_stream {
            while let Some(info) = self.pending_display.pop_front() {
                // SAFETY: the callback target outlives the parser.
                if !unsafe { self.callbacks.display(&info) } {
                    break;
                }
            }
        }

        Ok(())
    }

    fn process_unit(
        &mut self,
        cursor: &mut Cursor<&[u8]>,
        timestamp: Option<i64>,
    ) -> anyhow::Result<bool> {
        let tag = cursor.read_u8()?;
        match tag {
            TAG_SEQUENCE => {
                let codec = cursor.read_u32::<BigEndian>()?;
                let codec = Codec::n(codec).with_context(|| format!("invalid codec {codec}"))?;
                let coded_width = cursor.read_u32::<BigEndian>()?;
                let coded_height = cursor.read_u32::<BigEndian>()?;
                let chroma = cursor.read_u8()?;
                let chroma_format = ChromaFormat::n(chroma as u32)
                    .with_context(|| format!("invalid chroma format {chroma}"))?;
                let min_num_decode_surfaces = cursor.read_u8()?;

                let format = VideoFormat {
                    codec,
                    coded_width,
                    coded_height,
                    chroma_format,
                    display_area: Rect {
                        left: 0,
                        top: 0,
                        right: coded_width as i16,
                        bottom: coded_height as i16,
                    },
                    min_num_decode_surfaces,
                    frame_rate: Rational::new(30, 1),
                    ..Default::default()
                };

                // SAFETY: the callback target outlives the parser.
                Ok(unsafe { self.callbacks.sequence(&format) })
            }
            TAG_PICTURE => {
                let picture_index = cursor.read_u8()? as usize;
                let flags = cursor.read_u8()?;
                let len = cursor.read_u16::<BigEndian>()? as usize;
                let mut bitstream = vec![0u8; len];
                cursor
                    .read_exact(&mut bitstream)
                    .context("truncated picture payload")?;

                if picture_index >= self.max_decode_surfaces {
                    return Err(anyhow!(
                        "picture index {picture_index} exceeds {} surfaces",
                        self.max_decode_surfaces
                    ));
                }

                let params = PictureParams {
                    picture_index,
                    field_pic: flags & FIELD_PIC != 0,
                    bottom_field: flags & BOTTOM_FIELD != 0,
                    second_field: flags & SECOND_FIELD != 0,
                    ref_pic: flags & REF_PIC != 0,
                    intra_pic: flags & INTRA_PIC != 0,
                    bitstream: Bytes::from(bitstream),
                };

                // SAFETY: the callback target outlives the parser.
                if !unsafe { self.callbacks.decode(&params) } {
                    return Ok(false);
                }

                if params.second_field {
                    return Ok(true);
                }

                self.pending_display.push_back(DisplayInfo {
                    picture_index,
                    progressive_frame: !params.field_pic,
                    top_field_first: flags & TOP_FIELD_FIRST != 0,
                    repeat_first_field: 0,
                    timestamp,
                });

                while self.pending_display.len() > self.max_display_delay {
                    let Some(info) = self.pending_display.pop_front() else {
                        break;
                    };
                    // SAFETY: the callback target outlives the parser.
                    if !unsafe { self.callbacks.display(&info) } {
                        return Ok(false);
                    }
                }

                Ok(true)
            }
            tag => Err(anyhow!("unknown unit tag {tag:#x}")),
        }
    }
}

struct Job {
    payload: Bytes,
    timestamp: Option<i64>,
    end_of_stream: bool,
    /// Set when the submitter waits for the job to complete.
    done: Option<mpsc::Sender<EngineResult<()>>>,
}

enum ParserMode {
    Inline(ParserCore),
    Threaded {
        jobs: mpsc::Sender<Job>,
        worker: JoinHandle<()>,
    },
}

pub struct Parser {
    mode: ParserMode,
}

pub struct Decoder {
    info: DecoderCreateInfo,
}

impl Decoder {
    pub fn info(&self) -> &DecoderCreateInfo {
        &self.info
    }
}

impl DecodeEngine for DummyEngine {
    type Parser = Parser;
    type Decoder = Decoder;

    fn create_parser(&self, params: &ParserParams) -> EngineResult<Parser> {
        let core = ParserCore {
            callbacks: params.callbacks,
            max_decode_surfaces: params.max_decode_surfaces,
            max_display_delay: params.max_display_delay as usize,
            pending_display: VecDeque::new(),
        };

        let mode = if self.threaded {
            let (jobs, receiver) = mpsc::channel::<Job>();
            let mut core = core;
            let worker = thread::Builder::new()
                .name(String::from("dummy-parser"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let res = core.process(&job.payload, job.timestamp, job.end_of_stream);
                        match job.done {
                            Some(done) => {
                                let _ = done.send(res);
                            }
                            None => {
                                if let Err(e) = res {
                                    log::error!("dummy parser thread: {e}");
                                }
                            }
                        }
                    }
                })
                .map_err(|e| {
                    log::error!("failed to spawn the parser thread: {e}");
                    EngineError::Status {
                        call: "create_parser",
                        status: STATUS_CREATE_FAILED,
                    }
                })?;

            ParserMode::Threaded { jobs, worker }
        } else {
            ParserMode::Inline(core)
        };

        self.shared.live_parsers.fetch_add(1, Ordering::SeqCst);
        self.shared.record(EngineEvent::ParserCreated {
            sequence_header_len: params.sequence_header.as_ref().map_or(0, Bytes::len),
        });

        Ok(Parser { mode })
    }

    fn destroy_parser(&self, parser: Parser) {
        if let ParserMode::Threaded { jobs, worker } = parser.mode {
            // Closing the channel stops the thread once its queue is empty.
            drop(jobs);
            if worker.join().is_err() {
                log::error!("dummy parser thread panicked");
            }
        }

        self.shared.live_parsers.fetch_sub(1, Ordering::SeqCst);
        self.shared.record(EngineEvent::ParserDestroyed);
    }

    fn parse(&self, parser: &mut Parser, packet: &SourcePacket) -> EngineResult<()> {
        self.shared.record(EngineEvent::Parsed {
            len: packet.payload.len(),
            end_of_stream: packet.end_of_stream,
        });

        match &mut parser.mode {
            ParserMode::Inline(core) => {
                core.process(packet.payload, packet.timestamp, packet.end_of_stream)
            }
            ParserMode::Threaded { jobs, .. } => {
                let gone = EngineError::Status {
                    call: "parse",
                    status: STATUS_PARSER_GONE,
                };

                // Wait for the end of stream to be processed, so all pending pictures have been
                // displayed once we return.
                let (done, completion) = if packet.end_of_stream {
                    let (tx, rx) = mpsc::channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };

                jobs.send(Job {
                    payload: Bytes::copy_from_slice(packet.payload),
                    timestamp: packet.timestamp,
                    end_of_stream: packet.end_of_stream,
                    done,
                })
                .map_err(|_| gone.clone())?;

                match completion {
                    Some(rx) => rx.recv().map_err(|_| gone)?,
                    None => Ok(()),
                }
            }
        }
    }

    fn create_decoder(&self, info: &DecoderCreateInfo) -> EngineResult<Decoder> {
        if self.fail_create_decoder {
            return Err(EngineError::Status {
                call: "create_decoder",
                status: STATUS_CREATE_FAILED,
            });
        }

        *self
            .shared
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = vec![Bytes::new(); info.num_decode_surfaces];
        self.shared.live_decoders.fetch_add(1, Ordering::SeqCst);
        self.shared.record(EngineEvent::DecoderCreated(info.clone()));

        Ok(Decoder { info: info.clone() })
    }

    fn destroy_decoder(&self, _decoder: Decoder) {
        self.shared.live_decoders.fetch_sub(1, Ordering::SeqCst);
        self.shared.record(EngineEvent::DecoderDestroyed);
    }

    fn decode(&self, decoder: &Decoder, params: &PictureParams) -> EngineResult<()> {
        let call = self.shared.decode_calls.fetch_add(1, Ordering::SeqCst);

        if self.panic_decode_at == Some(call) {
            panic!("dummy decoder crashed on call {call}");
        }
        if self.fail_decode_at == Some(call) {
            return Err(EngineError::Status {
                call: "decode",
                status: STATUS_DECODE_FAILED,
            });
        }
        if params.picture_index >= decoder.info.num_decode_surfaces {
            return Err(EngineError::Status {
                call: "decode",
                status: STATUS_INVALID_SURFACE,
            });
        }

        let mut surfaces = self
            .shared
            .surfaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(surface) = surfaces.get_mut(params.picture_index) {
            *surface = params.bitstream.clone();
        }
        drop(surfaces);

        self.shared.record(EngineEvent::Decoded(params.picture_index));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CallbackTarget;
    use crate::engine::DecodeEventSink;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Sequence(Codec, u32, u32),
        Decode(usize, bool),
        Display(usize, Option<i64>),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Call>>,
    }

    impl DecodeEventSink for RecordingSink {
        fn on_sequence(&self, format: &VideoFormat) -> bool {
            self.calls.lock().unwrap().push(Call::Sequence(
                format.codec,
                format.coded_width,
                format.coded_height,
            ));
            true
        }

        fn on_decode(&self, params: &PictureParams) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Decode(params.picture_index, params.second_field));
            true
        }

        fn on_display(&self, info: &DisplayInfo) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Display(info.picture_index, info.timestamp));
            true
        }

        fn on_callback_panic(&self, _: &'static str, _: String) {}
    }

    fn params(target: &CallbackTarget) -> ParserParams {
        ParserParams {
            codec: Codec::H264,
            max_decode_surfaces: 4,
            max_display_delay: 1,
            sequence_header: None,
            callbacks: target.table(),
        }
    }

    fn packet(payload: &[u8], timestamp: Option<i64>) -> SourcePacket<'_> {
        SourcePacket {
            payload,
            timestamp,
            end_of_stream: false,
        }
    }

    #[test]
    fn inline_parser_invokes_callbacks() {
        let sink = Arc::new(RecordingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let engine = DummyEngine::new();
        let mut parser = engine.create_parser(&params(&target)).unwrap();

        let header = StreamWriter::new()
            .sequence(Codec::H264, Resolution::from((64, 48)), ChromaFormat::Yuv420, 4)
            .build();
        engine.parse(&mut parser, &packet(&header, None)).unwrap();
        let first = StreamWriter::new().frame(0, b"a").build();
        engine.parse(&mut parser, &packet(&first, Some(10))).unwrap();
        let fields = StreamWriter::new()
            .picture(1, FIELD_PIC, b"b")
            .picture(1, FIELD_PIC | SECOND_FIELD | BOTTOM_FIELD, b"c")
            .build();
        engine.parse(&mut parser, &packet(&fields, Some(20))).unwrap();
        engine
            .parse(
                &mut parser,
                &SourcePacket {
                    end_of_stream: true,
                    ..Default::default()
                },
            )
            .unwrap();
        engine.destroy_parser(parser);

        assert_eq!(
            *sink.calls.lock().unwrap(),
            vec![
                Call::Sequence(Codec::H264, 64, 48),
                Call::Decode(0, false),
                Call::Decode(1, false),
                Call::Display(0, Some(10)),
                Call::Decode(1, true),
                Call::Display(1, Some(20)),
            ]
        );
        assert_eq!(engine.live_parsers(), 0);
    }

    #[test]
    fn threaded_parser_drains_on_end_of_stream() {
        let sink = Arc::new(RecordingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let engine = DummyEngine::new().threaded();
        let mut parser = engine.create_parser(&params(&target)).unwrap();

        for i in 0..3u8 {
            let frame = StreamWriter::new().frame(i, &[i]).build();
            engine.parse(&mut parser, &packet(&frame, Some(i as i64))).unwrap();
        }
        engine
            .parse(
                &mut parser,
                &SourcePacket {
                    end_of_stream: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let displayed: Vec<_> = sink
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Display(index, _) => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(displayed, vec![0, 1, 2]);

        engine.destroy_parser(parser);
        assert_eq!(engine.live_parsers(), 0);
    }

    #[test]
    fn malformed_units_fail_parsing() {
        let sink = Arc::new(RecordingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let engine = DummyEngine::new();
        let mut parser = engine.create_parser(&params(&target)).unwrap();

        let bad_status = Err(EngineError::Status {
            call: "parse",
            status: STATUS_INVALID_BITSTREAM,
        });
        assert_eq!(engine.parse(&mut parser, &packet(b"X", None)), bad_status);

        let truncated = StreamWriter::new().frame(0, b"abcdef").build();
        assert_eq!(
            engine.parse(&mut parser, &packet(&truncated[..truncated.len() - 2], None)),
            bad_status
        );

        let out_of_range = StreamWriter::new().frame(9, b"a").build();
        assert_eq!(engine.parse(&mut parser, &packet(&out_of_range, None)), bad_status);

        engine.destroy_parser(parser);
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn decoder_fault_injection() {
        let engine = DummyEngine::new().fail_decode_at(1);
        let info = DecoderCreateInfo {
            codec: Codec::Vp9,
            coded_resolution: Resolution::from((64, 64)),
            target_resolution: Resolution::from((64, 64)),
            display_area: Default::default(),
            chroma_format: ChromaFormat::Yuv420,
            output_format: Default::default(),
            deinterlace_mode: Default::default(),
            num_decode_surfaces: 2,
            num_output_surfaces: 1,
            creation_flags: Default::default(),
        };
        let decoder = engine.create_decoder(&info).unwrap();
        assert_eq!(decoder.info(), &info);

        let params = |picture_index| PictureParams {
            picture_index,
            bitstream: Bytes::from_static(b"data"),
            ..Default::default()
        };
        assert!(engine.decode(&decoder, &params(0)).is_ok());
        assert!(engine.decode(&decoder, &params(1)).is_err());
        assert_eq!(
            engine.decode(&decoder, &params(2)),
            Err(EngineError::Status {
                call: "decode",
                status: STATUS_INVALID_SURFACE,
            })
        );
        assert_eq!(engine.surface(0), Some(Bytes::from_static(b"data")));
        assert_eq!(engine.surface(1), Some(Bytes::new()));

        engine.destroy_decoder(decoder);
        assert_eq!(engine.live_decoders(), 0);
        assert_eq!(engine.decode_calls(), 3);
    }
}
