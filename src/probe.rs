// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Answers whether hardware decoding is available on this host.
//!
//! Not finding the engine is an expected condition: the caller is supposed to fall back to
//! software decoding.

use std::path::Path;
use std::path::PathBuf;

use libloading::Library;

pub trait CapabilityProbe: Send {
    fn hardware_decode_available(&self) -> bool;
}

impl<F> CapabilityProbe for F
where
    F: Fn() -> bool + Send,
{
    fn hardware_decode_available(&self) -> bool {
        self()
    }
}

/// Checks that the shared library implementing the engine can be loaded.
///
/// Bare names are resolved by the dynamic loader, following its own search order
/// (`LD_LIBRARY_PATH`, the loader cache, then the system directories).
#[derive(Debug, Clone)]
pub struct LibraryProbe {
    candidates: Vec<PathBuf>,
}

impl LibraryProbe {
    /// Probe for any of `names`, tried in order.
    pub fn new<S: Into<PathBuf>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            candidates: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Probe for the NVIDIA video decode library.
    pub fn nvcuvid() -> Self {
        Self::new(["libnvcuvid.so.1", "libnvcuvid.so"])
    }

    /// Only try the current names inside `dirs`, as absolute paths.
    pub fn with_dirs<P: AsRef<Path>>(self, dirs: impl IntoIterator<Item = P>) -> Self {
        let dirs: Vec<PathBuf> = dirs.into_iter().map(|d| d.as_ref().to_path_buf()).collect();
        let candidates = dirs
            .iter()
            .flat_map(|dir| self.candidates.iter().map(move |name| dir.join(name)))
            .collect();

        Self { candidates }
    }

    /// Returns the first candidate the loader accepts. The library is unloaded again before
    /// returning.
    pub fn find(&self) -> Option<&Path> {
        self.candidates.iter().map(PathBuf::as_path).find(|candidate| {
            // SAFETY: the candidates name the engine's own library, whose initializers are
            // expected to run in this process anyway.
            match unsafe { Library::new(candidate) } {
                Ok(library) => {
                    drop(library);
                    true
                }
                Err(e) => {
                    log::debug!("cannot load {}: {e}", candidate.display());
                    false
                }
            }
        })
    }
}

impl CapabilityProbe for LibraryProbe {
    fn hardware_decode_available(&self) -> bool {
        match self.find() {
            Some(path) => {
                log::debug!("{} available", path.display());
                true
            }
            None => {
                log::debug!("none of {:?} could be loaded", self.candidates);
                false
            }
        }
    }
}
