// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Detection of dynamic format changes.
//!
//! The engine reports the sequence parameters of the stream every time it parses a sequence
//! header. The session keeps the parameters its decoder was created with and compares every
//! notification against them. Only the codec, the coded size and the chroma format take part in
//! the comparison: the target size and the display area are fixed when the session is opened.

use std::fmt;

use crate::engine::VideoFormat;
use crate::ChromaFormat;
use crate::Codec;
use crate::Resolution;

/// The subset of the stream format that the decoder depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub codec: Codec,
    pub coded_resolution: Resolution,
    pub chroma_format: ChromaFormat,
}

impl FormatDescriptor {
    /// Whether `format` can be decoded by a decoder created for `self`.
    pub fn matches(&self, format: &VideoFormat) -> bool {
        *self == FormatDescriptor::from(format)
    }
}

impl From<&VideoFormat> for FormatDescriptor {
    fn from(format: &VideoFormat) -> Self {
        Self {
            codec: format.codec,
            coded_resolution: Resolution::from((format.coded_width, format.coded_height)),
            chroma_format: format.chroma_format,
        }
    }
}

impl fmt::Display for FormatDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} {:?}",
            self.codec, self.coded_resolution, self.chroma_format
        )
    }
}

/// Outcome of a sequence notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatChange {
    /// The format is the one the decoder was created for.
    Unchanged,
    /// The format changed and the new one is now the reference.
    Accepted {
        previous: FormatDescriptor,
        current: FormatDescriptor,
    },
    /// The format changed but changes are not tolerated. The reference is left untouched.
    Rejected {
        current: FormatDescriptor,
        incoming: FormatDescriptor,
    },
}

/// Keeps track of the reference format of a session.
#[derive(Debug, Clone)]
pub struct FormatNegotiator {
    current: FormatDescriptor,
    tolerate_change: bool,
}

impl FormatNegotiator {
    pub fn new(current: FormatDescriptor, tolerate_change: bool) -> Self {
        Self {
            current,
            tolerate_change,
        }
    }

    pub fn current(&self) -> FormatDescriptor {
        self.current
    }

    pub fn tolerates_change(&self) -> bool {
        self.tolerate_change
    }

    /// Compares `incoming` against the reference format.
    pub fn negotiate(&mut self, incoming: &VideoFormat) -> FormatChange {
        if self.current.matches(incoming) {
            return FormatChange::Unchanged;
        }

        let incoming = FormatDescriptor::from(incoming);
        if self.tolerate_change {
            let previous = std::mem::replace(&mut self.current, incoming);
            log::debug!("dynamic format change detected: {previous} -> {incoming}");
            FormatChange::Accepted {
                previous,
                current: incoming,
            }
        } else {
            log::error!(
                "dynamic format change detected: {} -> {incoming}",
                self.current
            );
            FormatChange::Rejected {
                current: self.current,
                incoming,
            }
        }
    }
}
