// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to the external decode engine.
//!
//! An engine is made of a parser, which splits the bitstream into pictures and decides when they
//! are to be displayed, and a decoder, which turns picture parameters into decoded surfaces. The
//! parser reports its progress through three callbacks, registered as a [`CallbackTable`] of
//! `extern "C"` entry points and an opaque `user_data` pointer:
//!
//! * the sequence callback, invoked when a sequence header has been parsed,
//! * the decode callback, invoked when a picture is ready to be decoded,
//! * the display callback, invoked when a decoded picture is due for display.
//!
//! Callbacks may be invoked synchronously from within [`DecodeEngine::parse`], or from a thread
//! owned by the engine. The entry points forward them to a [`DecodeEventSink`] and make sure no
//! panic ever unwinds into the engine.

pub mod dummy;

use std::ffi::c_int;
use std::ffi::c_void;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use bytes::Bytes;
use thiserror::Error;

use crate::utils::panic_message;
use crate::ChromaFormat;
use crate::Codec;
use crate::DeinterlaceMode;
use crate::Rational;
use crate::Rect;
use crate::Resolution;
use crate::SurfaceFormat;

/// Time base of the timestamps exchanged with the engine (100ns ticks).
pub const NATIVE_TIME_BASE: Rational = Rational::new(1, 10_000_000);

/// Maximum size of a sequence header that can be handed to the parser at creation time.
pub const MAX_SEQUENCE_HEADER_LEN: usize = 1024;

/// Error returned by engine methods.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{call} failed with status {status}")]
    Status { call: &'static str, status: i32 },
    #[error("{call} panicked: {message}")]
    Panicked { call: &'static str, message: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Sequence parameters reported by the parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub codec: Codec,
    pub coded_width: u32,
    pub coded_height: u32,
    pub chroma_format: ChromaFormat,
    pub display_area: Rect,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub progressive_sequence: bool,
    /// Minimum number of surfaces the decoder needs for this stream.
    pub min_num_decode_surfaces: u8,
    pub frame_rate: Rational,
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self {
            codec: Codec::H264,
            coded_width: 0,
            coded_height: 0,
            chroma_format: Default::default(),
            display_area: Default::default(),
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            progressive_sequence: true,
            min_num_decode_surfaces: 0,
            frame_rate: Rational::new(0, 1),
        }
    }
}

/// A unit of compressed data handed to the parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourcePacket<'a> {
    pub payload: &'a [u8],
    /// Presentation timestamp in [`NATIVE_TIME_BASE`] units.
    pub timestamp: Option<i64>,
    /// Set on the last packet of the stream. The parser must emit every pending picture before
    /// returning from the corresponding [`DecodeEngine::parse`] call.
    pub end_of_stream: bool,
}

/// Parameters of a picture about to be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PictureParams {
    /// Index of the surface the picture is decoded into.
    pub picture_index: usize,
    pub field_pic: bool,
    pub bottom_field: bool,
    pub second_field: bool,
    pub ref_pic: bool,
    pub intra_pic: bool,
    /// Engine-specific picture data.
    pub bitstream: Bytes,
}

/// A decoded picture due for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub picture_index: usize,
    pub progressive_frame: bool,
    pub top_field_first: bool,
    pub repeat_first_field: i32,
    /// Timestamp of the packet the picture came from, in [`NATIVE_TIME_BASE`] units.
    pub timestamp: Option<i64>,
}

/// Hint for the engine about which decode path to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CreationFlags {
    Default,
    PreferCuda,
    PreferDxva,
    /// Use the dedicated video decode hardware.
    #[default]
    PreferCuvid,
}

pub type SequenceCallback = unsafe extern "C" fn(*mut c_void, *const VideoFormat) -> c_int;
pub type DecodeCallback = unsafe extern "C" fn(*mut c_void, *const PictureParams) -> c_int;
pub type DisplayCallback = unsafe extern "C" fn(*mut c_void, *const DisplayInfo) -> c_int;

/// Callbacks registered with the parser. Each returns a non-zero value on success and zero on
/// failure.
#[derive(Debug, Clone, Copy)]
pub struct CallbackTable {
    pub user_data: *mut c_void,
    pub sequence: SequenceCallback,
    pub decode: DecodeCallback,
    pub display: DisplayCallback,
}

// SAFETY: `user_data` points to a `DecodeEventSink`, which is `Send + Sync`, and stays valid as
// long as the parser it was registered with exists.
unsafe impl Send for CallbackTable {}
// SAFETY: see above.
unsafe impl Sync for CallbackTable {}

impl CallbackTable {
    /// Invokes the sequence callback.
    ///
    /// # Safety
    ///
    /// `user_data` must still be valid, i.e. the [`CallbackTarget`] that produced this table must
    /// not have been dropped.
    pub unsafe fn sequence(&self, format: &VideoFormat) -> bool {
        (self.sequence)(self.user_data, format) != 0
    }

    /// Invokes the decode callback.
    ///
    /// # Safety
    ///
    /// Same as [`CallbackTable::sequence`].
    pub unsafe fn decode(&self, params: &PictureParams) -> bool {
        (self.decode)(self.user_data, params) != 0
    }

    /// Invokes the display callback.
    ///
    /// # Safety
    ///
    /// Same as [`CallbackTable::sequence`].
    pub unsafe fn display(&self, info: &DisplayInfo) -> bool {
        (self.display)(self.user_data, info) != 0
    }
}

/// Parameters used to create a parser.
#[derive(Debug, Clone)]
pub struct ParserParams {
    pub codec: Codec,
    pub max_decode_surfaces: usize,
    /// Number of pictures the parser may hold back before displaying them.
    pub max_display_delay: u32,
    /// Sequence header known before the first packet, at most [`MAX_SEQUENCE_HEADER_LEN`] bytes.
    pub sequence_header: Option<Bytes>,
    pub callbacks: CallbackTable,
}

/// Parameters used to create a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderCreateInfo {
    pub codec: Codec,
    pub coded_resolution: Resolution,
    pub target_resolution: Resolution,
    pub display_area: Rect,
    pub chroma_format: ChromaFormat,
    pub output_format: SurfaceFormat,
    pub deinterlace_mode: DeinterlaceMode,
    pub num_decode_surfaces: usize,
    pub num_output_surfaces: u32,
    pub creation_flags: CreationFlags,
}

/// Operations offered by a decode engine.
///
/// Implementations must accept calls from any thread. The session serializes decoder calls with
/// its [`EngineLock`], and parser calls through exclusive access to the parser.
pub trait DecodeEngine: Send + Sync + 'static {
    type Parser: Send + 'static;
    type Decoder: Send + Sync + 'static;

    fn create_parser(&self, params: &ParserParams) -> EngineResult<Self::Parser>;

    /// Destroys `parser`. No callback may be invoked once this returns.
    fn destroy_parser(&self, parser: Self::Parser);

    /// Submits `packet` to the parser, which may invoke any of its callbacks before returning.
    fn parse(&self, parser: &mut Self::Parser, packet: &SourcePacket) -> EngineResult<()>;

    fn create_decoder(&self, info: &DecoderCreateInfo) -> EngineResult<Self::Decoder>;

    fn destroy_decoder(&self, decoder: Self::Decoder);

    /// Decodes a picture into the surface designated by `params.picture_index`.
    fn decode(&self, decoder: &Self::Decoder, params: &PictureParams) -> EngineResult<()>;
}

/// Receiver of the parser callbacks.
///
/// Methods return `true` to let the parser proceed and `false` to report a failure to it.
pub trait DecodeEventSink: Send + Sync {
    fn on_sequence(&self, format: &VideoFormat) -> bool;

    fn on_decode(&self, params: &PictureParams) -> bool;

    fn on_display(&self, info: &DisplayInfo) -> bool;

    /// Called when one of the methods above panicked. The panic has been contained and the
    /// engine told that the callback failed.
    fn on_callback_panic(&self, callback: &'static str, message: String);
}

/// Owns the `user_data` registered with a parser.
///
/// Must outlive the parser it was registered with.
pub struct CallbackTarget {
    sink: *mut Arc<dyn DecodeEventSink>,
}

// SAFETY: the pointee is an `Arc` of a `Send + Sync` object, owned by this struct.
unsafe impl Send for CallbackTarget {}

impl CallbackTarget {
    pub fn new(sink: Arc<dyn DecodeEventSink>) -> Self {
        Self {
            sink: Box::into_raw(Box::new(sink)),
        }
    }

    /// Returns the callback table to register with a parser.
    pub fn table(&self) -> CallbackTable {
        CallbackTable {
            user_data: self.sink.cast(),
            sequence: handle_video_sequence,
            decode: handle_picture_decode,
            display: handle_picture_display,
        }
    }
}

impl Drop for CallbackTarget {
    fn drop(&mut self) {
        // SAFETY: `sink` was obtained from `Box::into_raw` in `new` and is released only here.
        drop(unsafe { Box::from_raw(self.sink) });
    }
}

/// Recovers the sink from `user_data`, invokes `callback` on it and converts the outcome into
/// the engine's status convention.
///
/// # Safety
///
/// `user_data` must be null or come from a live [`CallbackTarget`], and `arg` must be null or
/// point to a valid `T`.
unsafe fn dispatch<T>(
    name: &'static str,
    user_data: *mut c_void,
    arg: *const T,
    callback: impl FnOnce(&dyn DecodeEventSink, &T) -> bool,
) -> c_int {
    let sink = (user_data as *const Arc<dyn DecodeEventSink>).as_ref();
    let (Some(sink), Some(arg)) = (sink, arg.as_ref()) else {
        log::error!("{name} callback invoked with a null pointer");
        return 0;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| callback(sink.as_ref(), arg))) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            log::error!("{name} callback panicked: {message}");
            // Must not unwind either.
            let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                sink.on_callback_panic(name, message)
            }));
            0
        }
    }
}

/// Sequence callback entry point.
///
/// # Safety
///
/// `user_data` must come from [`CallbackTarget::table`] and `format` must be null or valid.
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn handle_video_sequence(
    user_data: *mut c_void,
    format: *const VideoFormat,
) -> c_int {
    dispatch("sequence", user_data, format, |sink, format| {
        sink.on_sequence(format)
    })
}

/// Decode callback entry point.
///
/// # Safety
///
/// `user_data` must come from [`CallbackTarget::table`] and `params` must be null or valid.
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn handle_picture_decode(
    user_data: *mut c_void,
    params: *const PictureParams,
) -> c_int {
    dispatch("decode", user_data, params, |sink, params| {
        sink.on_decode(params)
    })
}

/// Display callback entry point.
///
/// # Safety
///
/// `user_data` must come from [`CallbackTarget::table`] and `info` must be null or valid.
#[allow(improper_ctypes_definitions)]
pub unsafe extern "C" fn handle_picture_display(
    user_data: *mut c_void,
    info: *const DisplayInfo,
) -> c_int {
    dispatch("display", user_data, info, |sink, info| sink.on_display(info))
}

/// Runs an engine call, turning a panic into [`EngineError::Panicked`].
pub(crate) fn guarded<T>(
    call: &'static str,
    f: impl FnOnce() -> EngineResult<T>,
) -> EngineResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("{call} panicked: {message}");
        Err(EngineError::Panicked { call, message })
    })
}

/// Lock serializing the calls made to an engine's decoder.
///
/// Clones share the same lock, so several sessions using the same engine context can be handed
/// the same handle.
#[derive(Debug, Clone, Default)]
pub struct EngineLock(Arc<Mutex<()>>);

impl EngineLock {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;

    #[derive(Default)]
    struct CountingSink {
        sequences: AtomicUsize,
        decodes: AtomicUsize,
        displays: AtomicUsize,
        panics: Mutex<Vec<(&'static str, String)>>,
    }

    impl DecodeEventSink for CountingSink {
        fn on_sequence(&self, format: &VideoFormat) -> bool {
            self.sequences.fetch_add(1, Ordering::SeqCst);
            format.coded_width > 0
        }

        fn on_decode(&self, params: &PictureParams) -> bool {
            if params.picture_index == 13 {
                panic!("unlucky picture");
            }
            self.decodes.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_display(&self, _: &DisplayInfo) -> bool {
            self.displays.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_callback_panic(&self, callback: &'static str, message: String) {
            self.panics.lock().unwrap().push((callback, message));
        }
    }

    #[test]
    fn callbacks_reach_the_sink() {
        let sink = Arc::new(CountingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let table = target.table();

        let format = VideoFormat {
            coded_width: 64,
            coded_height: 64,
            ..Default::default()
        };
        unsafe {
            assert!(table.sequence(&format));
            assert!(!table.sequence(&VideoFormat::default()));
            assert!(table.decode(&PictureParams::default()));
            assert!(table.display(&DisplayInfo::default()));
        }

        assert_eq!(sink.sequences.load(Ordering::SeqCst), 2);
        assert_eq!(sink.decodes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.displays.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panics_do_not_cross_the_boundary() {
        let sink = Arc::new(CountingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let table = target.table();

        let params = PictureParams {
            picture_index: 13,
            ..Default::default()
        };
        assert!(!unsafe { table.decode(&params) });

        let panics = sink.panics.lock().unwrap();
        assert_eq!(panics.len(), 1);
        assert_eq!(panics[0].0, "decode");
        assert_eq!(panics[0].1, "unlucky picture");
    }

    #[test]
    fn null_pointers_are_rejected() {
        let sink = Arc::new(CountingSink::default());
        let target = CallbackTarget::new(sink.clone());
        let table = target.table();

        unsafe {
            assert_eq!(handle_video_sequence(table.user_data, ptr::null()), 0);
            assert_eq!(
                handle_picture_display(ptr::null_mut(), &DisplayInfo::default()),
                0
            );
        }
        assert_eq!(sink.sequences.load(Ordering::SeqCst), 0);
        assert_eq!(sink.displays.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn target_keeps_sink_alive() {
        let sink = Arc::new(CountingSink::default());
        let target = CallbackTarget::new(sink.clone());
        assert_eq!(Arc::strong_count(&sink), 2);
        drop(target);
        assert_eq!(Arc::strong_count(&sink), 1);
    }

    #[test]
    fn guarded_calls() {
        assert_eq!(guarded("ok", || Ok(3)), Ok(3));
        assert_eq!(
            guarded::<()>("failing", || Err(EngineError::Status {
                call: "failing",
                status: 1
            })),
            Err(EngineError::Status {
                call: "failing",
                status: 1
            })
        );
        assert_eq!(
            guarded::<()>("panicking", || panic!("engine fault")),
            Err(EngineError::Panicked {
                call: "panicking",
                message: String::from("engine fault"),
            })
        );
    }
}
