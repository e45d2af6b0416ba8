// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Orchestration layer for callback-driven hardware video decode engines.
//!
//! The engine itself (parser and decoder) is opaque and reached through the
//! [`engine::DecodeEngine`] trait. A [`session::DecodeSession`] feeds it compressed packets,
//! receives its sequence/decode/display callbacks, and hands decoded pictures over to consumers
//! through a bounded [`frame_queue::FrameQueue`].

pub mod engine;
pub mod format;
pub mod frame_queue;
pub mod probe;
pub mod session;
pub mod utils;

use std::fmt;
use std::str::FromStr;

use enumn::N;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can hold a picture of size `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Compressed formats understood by decode engines. The discriminants follow the engine's native
/// numbering so raw values coming from the engine can be converted with [`Codec::n`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum Codec {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    H264 = 4,
    Jpeg = 5,
    H264Svc = 6,
    H264Mvc = 7,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

impl FromStr for Codec {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mpeg1" | "MPEG1" => Ok(Codec::Mpeg1),
            "mpeg2" | "MPEG2" => Ok(Codec::Mpeg2),
            "mpeg4" | "MPEG4" => Ok(Codec::Mpeg4),
            "vc1" | "VC1" => Ok(Codec::Vc1),
            "h264" | "H264" => Ok(Codec::H264),
            "jpeg" | "JPEG" => Ok(Codec::Jpeg),
            "hevc" | "HEVC" | "h265" | "H265" => Ok(Codec::Hevc),
            "vp8" | "VP8" => Ok(Codec::Vp8),
            "vp9" | "VP9" => Ok(Codec::Vp9),
            "av1" | "AV1" => Ok(Codec::Av1),
            _ => Err("unrecognized codec. Valid values: mpeg1, mpeg2, mpeg4, vc1, h264, jpeg, hevc, vp8, vp9, av1"),
        }
    }
}

/// Chroma subsampling of the coded pictures.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum ChromaFormat {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

/// Layout of the surfaces the decoder writes into.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, N)]
#[repr(u32)]
pub enum SurfaceFormat {
    #[default]
    NV12 = 0,
    P016 = 1,
    Yuv444 = 2,
    Yuv444P16 = 3,
}

impl FromStr for SurfaceFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(SurfaceFormat::NV12),
            "p016" | "P016" => Ok(SurfaceFormat::P016),
            "yuv444" | "YUV444" => Ok(SurfaceFormat::Yuv444),
            "yuv444p16" | "YUV444P16" => Ok(SurfaceFormat::Yuv444P16),
            _ => Err("unrecognized surface format. Valid values: nv12, p016, yuv444, yuv444p16"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, N)]
#[repr(u32)]
pub enum DeinterlaceMode {
    #[default]
    Weave = 0,
    Bob = 1,
    Adaptive = 2,
}

/// A rational number, used to express time bases.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }
}

impl From<(i64, i64)> for Rational {
    fn from(value: (i64, i64)) -> Self {
        Self::new(value.0, value.1)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Rectangle in pixels, edges expressed as absolute coordinates.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}
