//! Demo driver: push a coded bitstream file through a memory-to-memory
//! decoder node chunk by chunk and write the raw frames it returns.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;

use mem2mem::{
    CodecKind, Error, Meta, Payload, Session, SessionConfig,
    v4l2::{V4l2Device, open_first, video_nodes},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Coded input file (raw bitstream chunks).
    input: PathBuf,

    /// Where to write decoded frame data.
    #[clap(short, long, default_value = "out.raw")]
    output: PathBuf,

    /// Device node; all /dev/video* nodes are probed when omitted.
    #[clap(short, long)]
    device: Option<PathBuf>,

    /// Codec of the input stream.
    #[clap(short, long, default_value = "h264")]
    codec: String,

    /// Coded width hint.
    #[clap(long, default_value_t = 1280)]
    width: u32,

    /// Coded height hint.
    #[clap(long, default_value_t = 720)]
    height: u32,

    /// Bytes fed per submission.
    #[clap(long, default_value_t = 65536)]
    chunk: usize,
}

fn parse_codec(name: &str) -> Result<CodecKind> {
    Ok(match name.to_ascii_lowercase().as_str() {
        "h264" => CodecKind::H264,
        "mpeg2" => CodecKind::Mpeg2,
        "vp8" => CodecKind::Vp8,
        "vp9" => CodecKind::Vp9,
        other => bail!("unknown codec {other}"),
    })
}

/// Pulls one frame and appends its planes to `output`. `Ok(false)` means
/// nothing was ready within the timeout.
fn recv_one(
    session: &mut Session<V4l2Device>,
    output: &mut File,
    timeout_ms: i32,
) -> mem2mem::Result<bool> {
    let frame = match session.recv(timeout_ms) {
        Ok(frame) => frame,
        Err(Error::Empty) => return Ok(false),
        Err(e) => return Err(e),
    };
    if frame.corrupted {
        eprintln!("frame {} flagged corrupted", frame.sequence);
    }
    for i in 0..frame.plane_count() {
        output.write_all(frame.plane(i)).map_err(Error::Io)?;
    }
    Ok(true)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let codec = parse_codec(&args.codec)?;

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })?;
    }

    let config = SessionConfig::decoder(codec, args.width, args.height);
    let wanted = config.output_format.clone();

    let dev = match &args.device {
        Some(path) => V4l2Device::open(path)?,
        None => open_first(video_nodes(), |dev| {
            use mem2mem::Device;
            dev.try_format(mem2mem::Direction::Output, &wanted)
                .map(|got| got.pixelformat == wanted.pixelformat)
                .unwrap_or(false)
        })?,
    };

    let mut session = Session::new(dev, config).context("session setup")?;
    println!("* capture format: {:?}", session.capture_format());

    let mut input = File::open(&args.input)?;
    let mut output = File::create(&args.output)?;
    let mut chunk = vec![0u8; args.chunk];
    let mut pts: i64 = 0;
    let mut frames: u64 = 0;
    let mut eof = false;

    'outer: while !term.load(Ordering::SeqCst) {
        if !eof {
            let n = input.read(&mut chunk)?;
            if n == 0 {
                eof = true;
                session.send(&Payload::end_marker())?;
            } else {
                let meta = Meta { pts: Some(pts), duration: 1, ..Meta::default() };
                pts += 1;
                let payload = Payload::bytes(&chunk[..n], meta);
                loop {
                    match session.send(&payload) {
                        Ok(report) => {
                            if report.truncated {
                                eprintln!("chunk truncated; raise the buffer size");
                            }
                            break;
                        }
                        // Free a slot by consuming output, then retry.
                        Err(Error::Backpressure) => {
                            match recv_one(&mut session, &mut output, -1) {
                                Ok(true) => frames += 1,
                                Ok(false) => {}
                                Err(Error::EndOfStream) => break 'outer,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        Err(Error::EndOfStream) => break 'outer,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        loop {
            match recv_one(&mut session, &mut output, if eof { 100 } else { 0 }) {
                Ok(true) => frames += 1,
                Ok(false) => break,
                Err(Error::EndOfStream) => break 'outer,
                Err(e) => return Err(e.into()),
            }
        }
    }

    session.end()?;
    println!("{frames} frames written to {}", args.output.display());
    Ok(())
}
