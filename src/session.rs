// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode sessions.
//!
//! A [`DecodeSession`] drives one decode stream. It owns the engine parser and decoder, receives
//! the parser callbacks and turns them into [`FrameQueue`] operations:
//!
//! * the sequence callback checks the stream format against the one the decoder was created for,
//! * the decode callback reserves the target surface before letting the engine decode into it,
//!   waiting for the consumer to release it if needed,
//! * the display callback publishes the decoded picture to the consumer.
//!
//! Failures happening inside callbacks cannot be returned to the caller of
//! [`DecodeSession::feed`] directly, since callbacks may run on an engine thread. They are
//! recorded as a sticky error instead, which ends the frame queue and makes every subsequent
//! [`DecodeSession::feed`] fail. Callers should check [`DecodeSession::error`] after feeding,
//! flushing, and draining the queue.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::RwLock;

use bytes::Bytes;
use thiserror::Error;

use crate::engine::guarded;
use crate::engine::CallbackTarget;
use crate::engine::CreationFlags;
use crate::engine::DecodeEngine;
use crate::engine::DecodeEventSink;
use crate::engine::DecoderCreateInfo;
use crate::engine::DisplayInfo;
use crate::engine::EngineError;
use crate::engine::EngineLock;
use crate::engine::ParserParams;
use crate::engine::PictureParams;
use crate::engine::SourcePacket;
use crate::engine::VideoFormat;
use crate::engine::MAX_SEQUENCE_HEADER_LEN;
use crate::engine::NATIVE_TIME_BASE;
use crate::format::FormatChange;
use crate::format::FormatDescriptor;
use crate::format::FormatNegotiator;
use crate::frame_queue::FieldInfo;
use crate::frame_queue::FrameQueue;
use crate::frame_queue::SlotState;
use crate::frame_queue::DEFAULT_CAPACITY;
use crate::probe::CapabilityProbe;
use crate::utils::is_valid_time_base;
use crate::utils::rescale_timestamp;
use crate::ChromaFormat;
use crate::Codec;
use crate::DeinterlaceMode;
use crate::Rational;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("hardware decode engine is not available on this host")]
    EngineUnavailable,
    #[error("allocation failed: {0}")]
    AllocationError(String),
    #[error("failed to create the {object}: {source}")]
    CreateFailed {
        object: &'static str,
        source: EngineError,
    },
    #[error("dynamic format change rejected: {current} -> {incoming}")]
    FormatChangeRejected {
        current: FormatDescriptor,
        incoming: FormatDescriptor,
    },
    #[error("failed to decode picture {picture_index}: {source}")]
    DecodeFailed {
        picture_index: usize,
        source: EngineError,
    },
    #[error("failed to parse the bitstream: {0}")]
    ParseFailed(#[from] EngineError),
    #[error("{callback} callback panicked: {message}")]
    CallbackPanicked {
        callback: &'static str,
        message: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session has never been opened.
    Uninitialized,
    /// [`DecodeSession::open`] is in progress.
    Initializing,
    /// Packets are accepted.
    Running,
    /// The end of stream has been sent, remaining frames can be drained from the queue.
    Draining,
    Closed,
}

/// Pixels removed from each edge of the decoded pictures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Description of the stream to decode, as known by the demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub codec: Codec,
    /// Display resolution.
    pub resolution: Resolution,
    /// Coded resolution, if known. Defaults to the display resolution.
    pub coded_resolution: Option<Resolution>,
    pub chroma_format: ChromaFormat,
    pub crop: Crop,
    /// Time base of the timestamps passed to [`DecodeSession::feed`].
    pub time_base: Rational,
    /// Codec extradata, fed to the parser as soon as the session is open.
    pub sequence_header: Option<Bytes>,
}

impl StreamDescriptor {
    /// Describes a 4:2:0 stream with millisecond timestamps.
    pub fn new(codec: Codec, resolution: Resolution) -> Self {
        Self {
            codec,
            resolution,
            coded_resolution: None,
            chroma_format: ChromaFormat::Yuv420,
            crop: Default::default(),
            time_base: Rational::new(1, 1000),
            sequence_header: None,
        }
    }
}

/// Decoder settings chosen by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeHints {
    /// Size of the output surfaces. Defaults to the display resolution.
    pub target_resolution: Option<Resolution>,
    pub output_format: SurfaceFormat,
    pub deinterlace_mode: DeinterlaceMode,
    pub creation_flags: CreationFlags,
    /// Number of decode surfaces, i.e. capacity of the frame queue.
    pub num_decode_surfaces: usize,
    pub num_output_surfaces: u32,
    pub max_display_delay: u32,
}

impl Default for DecodeHints {
    fn default() -> Self {
        Self {
            target_resolution: None,
            output_format: SurfaceFormat::NV12,
            deinterlace_mode: DeinterlaceMode::Weave,
            creation_flags: CreationFlags::PreferCuvid,
            num_decode_surfaces: DEFAULT_CAPACITY,
            num_output_surfaces: 1,
            max_display_delay: 1,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_i16(value: u32) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

/// State shared between the session and the parser callbacks.
struct SessionCore<E: DecodeEngine> {
    engine: Arc<E>,
    lock: EngineLock,
    decoder: RwLock<Option<E::Decoder>>,
    queue: Arc<FrameQueue>,
    format: Mutex<FormatNegotiator>,
    fault: Mutex<Option<Error>>,
    decoded_frames: AtomicU64,
}

impl<E: DecodeEngine> SessionCore<E> {
    /// Records `error` as the session's sticky error, unless one is already set, and ends the
    /// queue so nobody stays blocked on it.
    fn set_fault(&self, error: Error) {
        let mut fault = lock(&self.fault);
        if fault.is_none() {
            log::error!("decode session failed: {error}");
            *fault = Some(error);
        } else {
            log::debug!("ignoring failure after the session failed: {error}");
        }
        drop(fault);

        self.queue.mark_ended();
    }

    fn fault(&self) -> Option<Error> {
        lock(&self.fault).clone()
    }

    fn has_fault(&self) -> bool {
        lock(&self.fault).is_some()
    }

    /// Makes sure surface `index` is reserved for the picture described by `params`.
    fn reserve_surface(&self, params: &PictureParams) -> Result<()> {
        let index = params.picture_index;

        // Both fields of a frame are decoded into the surface reserved for the first one.
        if params.second_field {
            return match self.queue.slot_state(index) {
                Ok(SlotState::Reserved) => Ok(()),
                Ok(state) => Err(Error::InvalidState(format!(
                    "second field decoded into surface {index} while it is {state:?}"
                ))),
                Err(e) => Err(Error::InvalidState(e.to_string())),
            };
        }

        self.queue
            .reserve(index)
            .map(|_| ())
            .map_err(|e| Error::InvalidState(format!("cannot reserve surface {index}: {e}")))
    }
}

impl<E: DecodeEngine> DecodeEventSink for SessionCore<E> {
    fn on_sequence(&self, format: &VideoFormat) -> bool {
        log::trace!(
            "sequence: {:?} {}x{} {:?}",
            format.codec,
            format.coded_width,
            format.coded_height,
            format.chroma_format
        );

        if format.min_num_decode_surfaces as usize > self.queue.capacity() {
            log::warn!(
                "stream needs {} decode surfaces, only {} available",
                format.min_num_decode_surfaces,
                self.queue.capacity()
            );
        }

        let change = lock(&self.format).negotiate(format);
        match change {
            FormatChange::Unchanged | FormatChange::Accepted { .. } => true,
            FormatChange::Rejected { current, incoming } => {
                self.set_fault(Error::FormatChangeRejected { current, incoming });
                false
            }
        }
    }

    fn on_decode(&self, params: &PictureParams) -> bool {
        let index = params.picture_index;
        log::trace!("decode picture {index}");

        if self.has_fault() {
            return false;
        }

        if let Err(e) = self.reserve_surface(params) {
            // The queue is ended under our feet when the session fails or closes.
            if self.queue.is_ended() {
                log::debug!("dropping picture {index}: {e}");
            } else {
                self.set_fault(e);
            }
            return false;
        }

        let decoder = self
            .decoder
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(decoder) = decoder.as_ref() else {
            // Closing takes the decoder right after ending the queue.
            if self.queue.is_ended() {
                log::debug!("dropping picture {index}: decoder destroyed");
            } else {
                self.set_fault(Error::InvalidState(String::from(
                    "decode callback received without a decoder",
                )));
            }
            return false;
        };

        let res = {
            let _engine = self.lock.lock();
            guarded("decode", || self.engine.decode(decoder, params))
        };

        match res {
            Ok(()) => true,
            Err(source) => {
                self.set_fault(Error::DecodeFailed {
                    picture_index: index,
                    source,
                });
                false
            }
        }
    }

    fn on_display(&self, info: &DisplayInfo) -> bool {
        log::trace!(
            "display picture {}, timestamp {:?}",
            info.picture_index,
            info.timestamp
        );

        let field = FieldInfo {
            progressive_frame: info.progressive_frame,
            top_field_first: info.top_field_first,
            repeat_first_field: info.repeat_first_field,
        };

        match self.queue.publish(info.picture_index, info.timestamp, field) {
            Ok(()) => {
                self.decoded_frames.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) => {
                self.set_fault(Error::InvalidState(format!(
                    "cannot display picture {}: {e}",
                    info.picture_index
                )));
                false
            }
        }
    }

    fn on_callback_panic(&self, callback: &'static str, message: String) {
        self.set_fault(Error::CallbackPanicked { callback, message });
    }
}

/// A decode session, bound to one engine.
///
/// The session is driven by a single feeder through [`DecodeSession::feed`] and
/// [`DecodeSession::flush`]. Decoded frames are consumed through the queue returned by
/// [`DecodeSession::frame_queue`], usually from another thread.
pub struct DecodeSession<E: DecodeEngine> {
    engine: Arc<E>,
    lock: EngineLock,
    probe: Box<dyn CapabilityProbe>,
    state: SessionState,
    core: Option<Arc<SessionCore<E>>>,
    parser: Option<E::Parser>,
    /// Must outlive `parser`.
    callback_target: Option<CallbackTarget>,
    decoder_info: Option<DecoderCreateInfo>,
    time_base: Rational,
    flush_result: Option<Result<()>>,
    /// Outcome of the session, once closed.
    terminal: Option<Result<()>>,
}

impl<E: DecodeEngine> DecodeSession<E> {
    /// Creates a session for `engine`. `probe` is consulted every time the session is opened, and
    /// `lock` serializes the decoder calls with any other user of the same engine context.
    pub fn new(engine: Arc<E>, probe: impl CapabilityProbe + 'static, lock: EngineLock) -> Self {
        Self {
            engine,
            lock,
            probe: Box::new(probe),
            state: SessionState::Uninitialized,
            core: None,
            parser: None,
            callback_target: None,
            decoder_info: None,
            time_base: NATIVE_TIME_BASE,
            flush_result: None,
            terminal: None,
        }
    }

    /// Opens the session for `stream`, closing it first if it was already open.
    ///
    /// If `stream` carries a sequence header, it is fed to the parser before returning. If
    /// `tolerate_format_change` is false, any change of codec, coded size or chroma format
    /// reported by the stream is fatal to the session.
    ///
    /// On failure, the session is left closed with all its resources released.
    pub fn open(
        &mut self,
        stream: &StreamDescriptor,
        hints: &DecodeHints,
        tolerate_format_change: bool,
    ) -> Result<()> {
        self.close();
        self.state = SessionState::Initializing;
        self.terminal = None;

        match self.init(stream, hints, tolerate_format_change) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close();
                self.terminal = Some(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn init(
        &mut self,
        stream: &StreamDescriptor,
        hints: &DecodeHints,
        tolerate_format_change: bool,
    ) -> Result<()> {
        if !self.probe.hardware_decode_available() {
            log::error!("hardware decode engine not available");
            return Err(Error::EngineUnavailable);
        }
        log::debug!("hardware decode engine available");

        validate(stream, hints)?;

        let coded_resolution = stream
            .coded_resolution
            .filter(|r| r.get_area() > 0)
            .unwrap_or(stream.resolution);
        let target_resolution = hints
            .target_resolution
            .filter(|r| r.get_area() > 0)
            .unwrap_or(stream.resolution);

        let queue = FrameQueue::new(hints.num_decode_surfaces, target_resolution)
            .map_err(|e| Error::AllocationError(e.to_string()))?;

        let format = FormatDescriptor {
            codec: stream.codec,
            coded_resolution,
            chroma_format: stream.chroma_format,
        };
        let core = Arc::new(SessionCore {
            engine: Arc::clone(&self.engine),
            lock: self.lock.clone(),
            decoder: RwLock::new(None),
            queue: Arc::new(queue),
            format: Mutex::new(FormatNegotiator::new(format, tolerate_format_change)),
            fault: Mutex::new(None),
            decoded_frames: AtomicU64::new(0),
        });
        self.core = Some(Arc::clone(&core));

        let target = CallbackTarget::new(core.clone());
        let params = ParserParams {
            codec: stream.codec,
            max_decode_surfaces: hints.num_decode_surfaces,
            max_display_delay: hints.max_display_delay,
            sequence_header: stream.sequence_header.clone(),
            callbacks: target.table(),
        };
        self.callback_target = Some(target);

        let engine = &self.engine;
        let parser = guarded("create_parser", || engine.create_parser(&params)).map_err(|source| {
            log::error!("failed to create the video parser: {source}");
            Error::CreateFailed {
                object: "parser",
                source,
            }
        })?;
        self.parser = Some(parser);
        log::debug!("created video parser");

        let info = DecoderCreateInfo {
            codec: stream.codec,
            coded_resolution,
            target_resolution,
            display_area: Rect {
                left: to_i16(stream.crop.left),
                top: to_i16(stream.crop.top),
                right: to_i16(stream.resolution.width - stream.crop.right),
                bottom: to_i16(stream.resolution.height - stream.crop.bottom),
            },
            chroma_format: stream.chroma_format,
            output_format: hints.output_format,
            deinterlace_mode: hints.deinterlace_mode,
            num_decode_surfaces: hints.num_decode_surfaces,
            num_output_surfaces: hints.num_output_surfaces,
            creation_flags: hints.creation_flags,
        };
        let decoder = {
            let _engine = self.lock.lock();
            guarded("create_decoder", || engine.create_decoder(&info))
        }
        .map_err(|source| {
            log::error!("failed to create the decoder: {source}");
            Error::CreateFailed {
                object: "decoder",
                source,
            }
        })?;
        *core
            .decoder
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(decoder);
        self.decoder_info = Some(info);
        log::debug!("created decoder");

        self.time_base = stream.time_base;
        self.state = SessionState::Running;

        if let Some(header) = stream.sequence_header.as_ref().filter(|h| !h.is_empty()) {
            self.submit(header, None).map_err(|e| {
                log::error!("failed to decode the sequence header: {e}");
                e
            })?;
            if let Some(fault) = core.fault() {
                return Err(fault);
            }
        }

        Ok(())
    }

    /// Submits one packet of compressed data.
    ///
    /// `timestamp` is expressed in the time base of the stream descriptor. An empty `payload`
    /// marks the end of the stream, see [`DecodeSession::flush`].
    ///
    /// An error returned by this method concerns the packet itself. Failures detected by the
    /// engine callbacks are reported through [`DecodeSession::error`], and make the next calls
    /// fail.
    pub fn feed(&mut self, payload: &[u8], timestamp: Option<i64>) -> Result<()> {
        if payload.is_empty() {
            return self.flush();
        }

        if self.state != SessionState::Running {
            return Err(Error::InvalidState(format!(
                "cannot feed a session in state {:?}",
                self.state
            )));
        }
        if let Some(fault) = self.error() {
            return Err(Error::InvalidState(format!("session failed: {fault}")));
        }

        self.submit(payload, timestamp)
    }

    /// Sends the end of stream to the parser and ends the frame queue once the last pictures have
    /// been published.
    ///
    /// Calling this on a closed session returns the outcome of the session.
    pub fn flush(&mut self) -> Result<()> {
        match self.state {
            SessionState::Running => (),
            SessionState::Draining => return self.flush_result.clone().unwrap_or(Ok(())),
            SessionState::Closed => return self.terminal.clone().unwrap_or(Ok(())),
            state => {
                return Err(Error::InvalidState(format!(
                    "cannot flush a session in state {state:?}"
                )))
            }
        }

        self.state = SessionState::Draining;
        let res = match self.error() {
            Some(fault) => Err(fault),
            None => self
                .parse(&SourcePacket {
                    payload: &[],
                    timestamp: None,
                    end_of_stream: true,
                })
                .and_then(|()| self.error().map_or(Ok(()), Err)),
        };

        if let Some(core) = &self.core {
            core.queue.mark_ended();
            log::debug!(
                "flushed decode session, {} frames decoded",
                core.decoded_frames.load(Ordering::SeqCst)
            );
        }

        self.flush_result = Some(res.clone());
        res
    }

    /// Destroys the engine objects and releases the frame queue. Consumers still holding the
    /// queue see it ended.
    pub fn close(&mut self) {
        if let Some(core) = &self.core {
            core.queue.mark_ended();

            let decoder = core
                .decoder
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            // The decoder goes first, as the parser may still call into it.
            if let Some(decoder) = decoder {
                let engine = &self.engine;
                let _engine = self.lock.lock();
                let _ = guarded("destroy_decoder", || {
                    engine.destroy_decoder(decoder);
                    Ok(())
                });
            }
        }

        if let Some(parser) = self.parser.take() {
            let engine = &self.engine;
            let _ = guarded("destroy_parser", || {
                engine.destroy_parser(parser);
                Ok(())
            });
        }
        self.callback_target = None;

        if let Some(core) = self.core.take() {
            self.terminal = Some(match core.fault() {
                Some(fault) => Err(fault),
                None => self.flush_result.clone().unwrap_or(Ok(())),
            });
            log::debug!(
                "closed decode session, {} frames decoded",
                core.decoded_frames.load(Ordering::SeqCst)
            );
        }

        self.flush_result = None;
        self.decoder_info = None;
        self.state = SessionState::Closed;
    }

    fn submit(&mut self, payload: &[u8], timestamp: Option<i64>) -> Result<()> {
        let timestamp = timestamp.map(|ts| rescale_timestamp(ts, self.time_base, NATIVE_TIME_BASE));

        self.parse(&SourcePacket {
            payload,
            timestamp,
            end_of_stream: false,
        })
    }

    fn parse(&mut self, packet: &SourcePacket) -> Result<()> {
        let (Some(parser), Some(core)) = (self.parser.as_mut(), self.core.as_ref()) else {
            return Err(Error::InvalidState(String::from("no parser")));
        };

        // The parser is not covered by the engine lock: it re-enters the decoder through the
        // decode callback, which takes it.
        let engine = &self.engine;
        guarded("parse", || engine.parse(parser, packet)).map_err(|source| {
            let error = Error::ParseFailed(source);
            core.set_fault(error.clone());
            error
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the sticky error of the session, if any.
    pub fn error(&self) -> Option<Error> {
        self.core.as_ref().and_then(|core| core.fault())
    }

    /// Number of frames published to the queue since the session was opened.
    pub fn decoded_frames(&self) -> u64 {
        self.core
            .as_ref()
            .map_or(0, |core| core.decoded_frames.load(Ordering::SeqCst))
    }

    /// Current reference format of the stream.
    pub fn format(&self) -> Option<FormatDescriptor> {
        self.core
            .as_ref()
            .map(|core| lock(&core.format).current())
    }

    pub fn frame_queue(&self) -> Option<Arc<FrameQueue>> {
        self.core.as_ref().map(|core| Arc::clone(&core.queue))
    }

    /// Parameters the decoder was created with.
    pub fn decoder_info(&self) -> Option<&DecoderCreateInfo> {
        self.decoder_info.as_ref()
    }
}

impl<E: DecodeEngine> Drop for DecodeSession<E> {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate(stream: &StreamDescriptor, hints: &DecodeHints) -> Result<()> {
    let Resolution { width, height } = stream.resolution;
    if width == 0 || height == 0 {
        return Err(Error::InvalidArgument(format!(
            "invalid display resolution {}",
            stream.resolution
        )));
    }

    let exceeds = |a: u32, b: u32, limit: u32| a.checked_add(b).map_or(true, |sum| sum >= limit);
    if exceeds(stream.crop.left, stream.crop.right, width)
        || exceeds(stream.crop.top, stream.crop.bottom, height)
    {
        return Err(Error::InvalidArgument(format!(
            "crop {:?} does not fit in {}",
            stream.crop, stream.resolution
        )));
    }

    if !is_valid_time_base(stream.time_base) {
        return Err(Error::InvalidArgument(format!(
            "invalid time base {}",
            stream.time_base
        )));
    }

    if let Some(header) = &stream.sequence_header {
        if header.len() > MAX_SEQUENCE_HEADER_LEN {
            return Err(Error::InvalidArgument(format!(
                "sequence header of {} bytes exceeds {MAX_SEQUENCE_HEADER_LEN} bytes",
                header.len()
            )));
        }
    }

    if hints.num_output_surfaces == 0 {
        return Err(Error::InvalidArgument(String::from(
            "at least one output surface is needed",
        )));
    }

    Ok(())
}
