// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! hwdecdemo, drives a decode session over the dummy engine. A synthetic stream is generated,
//! fed packet by packet while a consumer thread drains the frame queue, and the MD5 of every
//! decoded surface is printed.

use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use anyhow::Context;
use argh::FromArgs;

use hwdec_session::engine::dummy::DummyEngine;
use hwdec_session::engine::dummy::StreamWriter;
use hwdec_session::engine::EngineLock;
use hwdec_session::frame_queue::FrameQueueError;
use hwdec_session::probe::CapabilityProbe;
use hwdec_session::probe::LibraryProbe;
use hwdec_session::session::DecodeHints;
use hwdec_session::session::DecodeSession;
use hwdec_session::session::StreamDescriptor;
use hwdec_session::ChromaFormat;
use hwdec_session::Codec;
use hwdec_session::Rational;
use hwdec_session::Resolution;
use hwdec_session::SurfaceFormat;

/// Decode a synthetic stream through a hardware decode session
#[derive(Debug, FromArgs)]
struct Args {
    /// codec announced by the stream. Default: h264
    #[argh(option, default = "Codec::H264")]
    codec: Codec,

    /// width of the stream. Default: 320
    #[argh(option, default = "320")]
    width: u32,

    /// height of the stream. Default: 240
    #[argh(option, default = "240")]
    height: u32,

    /// number of frames to decode. Default: 30
    #[argh(option, default = "30")]
    frames: u32,

    /// number of decode surfaces. Default: 4
    #[argh(option, default = "4")]
    surfaces: usize,

    /// pixel format of the output surfaces. Default: nv12
    #[argh(option, default = "SurfaceFormat::NV12")]
    output_format: SurfaceFormat,

    /// run the parser on its own thread
    #[argh(switch)]
    threaded: bool,

    /// refuse to run if the NVIDIA decode library cannot be found
    #[argh(switch)]
    require_library: bool,

    /// print the MD5 of every decoded frame
    #[argh(switch)]
    compute_md5: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Args = argh::from_env();
    if args.surfaces == 0 || args.surfaces > u8::MAX as usize {
        return Err(anyhow!("the number of surfaces must be between 1 and 255"));
    }

    let mut engine = DummyEngine::new();
    if args.threaded {
        engine = engine.threaded();
    }
    let engine = Arc::new(engine);

    let library = LibraryProbe::nvcuvid();
    let require_library = args.require_library;
    let probe = move || !require_library || library.hardware_decode_available();

    let resolution = Resolution::from((args.width, args.height));
    let mut session = DecodeSession::new(Arc::clone(&engine), probe, EngineLock::new());

    let stream = StreamDescriptor {
        time_base: Rational::new(1, 30),
        sequence_header: Some(
            StreamWriter::new()
                .sequence(args.codec, resolution, ChromaFormat::Yuv420, args.surfaces as u8)
                .build(),
        ),
        ..StreamDescriptor::new(args.codec, resolution)
    };
    let hints = DecodeHints {
        output_format: args.output_format,
        num_decode_surfaces: args.surfaces,
        ..Default::default()
    };
    session
        .open(&stream, &hints, false)
        .context("failed to open the decode session")?;

    let queue = session
        .frame_queue()
        .ok_or_else(|| anyhow!("session has no frame queue"))?;
    let consumer_engine = Arc::clone(&engine);
    let compute_md5 = args.compute_md5;
    let consumer = thread::Builder::new()
        .name(String::from("consumer"))
        .spawn(move || -> anyhow::Result<u64> {
            let mut frames = 0;
            loop {
                let frame = match queue.take_ready() {
                    Ok(frame) => frame,
                    Err(FrameQueueError::EndOfStream) => return Ok(frames),
                    Err(e) => return Err(e.into()),
                };

                if compute_md5 {
                    let surface = consumer_engine
                        .surface(frame.index())
                        .unwrap_or_default();
                    println!("{:x}", md5::compute(&surface));
                }
                log::debug!(
                    "frame {} from surface {}, timestamp {:?}",
                    frame.sequence,
                    frame.index(),
                    frame.timestamp
                );

                queue.release(frame.index())?;
                frames += 1;
            }
        })?;

    for i in 0..args.frames {
        let index = (i as usize % args.surfaces) as u8;
        let packet = StreamWriter::new().frame(index, &i.to_be_bytes()).build();
        session
            .feed(&packet, Some(i as i64))
            .with_context(|| format!("failed to feed frame {i}"))?;
    }
    let flushed = session.flush();

    let frames = consumer
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))??;
    flushed.context("decoding failed")?;

    println!("decoded {frames} frames");
    Ok(())
}
