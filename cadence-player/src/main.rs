//! # Cadence Player
//!
//! Thin binary around cadence-core: a synthetic tone + test-pattern
//! source, an audio device pulling the engine's render port, and a frame
//! sink that ships raw BGRA frames to another process over a local
//! control socket.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;

use cadence_core::audio::{audio_decode_loop, AudioParams, SampleConverter};
use cadence_core::decoder::{
    AudioBlock, AudioTimestamps, DecodeSource, Decoder, Picture, Receive, ReorderMode,
    SendOutcome, VideoTimestamps,
};
use cadence_core::frame::FrameMeta;
use cadence_core::packet::Packet;
use cadence_core::reader::{MediaSource, Read, ReadDriver, SourceError, StreamKind};
use cadence_core::session::{PlaybackSession, SeekTarget, SessionConfig, SyncMode};
use cadence_core::video::{video_decode_loop, RefreshScheduler, VideoSink};

const SAMPLE_RATE: u32 = 48_000;
const SAMPLES_PER_BLOCK: usize = 1024;
const TONE_HZ: f64 = 440.0;
const FPS: f64 = 25.0;
const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;

// ============================================================================
// Options
// ============================================================================

#[derive(Clone)]
struct Options {
    /// Synthetic stream length in seconds.
    duration: f64,
    sink_addr: Option<String>,
    /// Shared key announced to the sink before the first frame.
    key: u64,
    no_audio: bool,
    loop_count: u32,
    sync: SyncMode,
    volume: f64,
}

impl Options {
    fn from_args(args: &[String]) -> Result<Self> {
        let mut opts = Options {
            duration: 10.0,
            sink_addr: None,
            key: 0,
            no_audio: false,
            loop_count: 1,
            sync: SyncMode::Audio,
            volume: 1.0,
        };
        let mut iter = args.iter().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--sink" => {
                    opts.sink_addr = Some(
                        iter.next()
                            .ok_or_else(|| anyhow!("--sink needs an address"))?
                            .clone(),
                    );
                }
                "--key" => {
                    opts.key = iter
                        .next()
                        .ok_or_else(|| anyhow!("--key needs a value"))?
                        .parse()
                        .context("--key must be an integer")?;
                }
                "--no-audio" => opts.no_audio = true,
                "--loop" => {
                    opts.loop_count = iter
                        .next()
                        .ok_or_else(|| anyhow!("--loop needs a count (0 = forever)"))?
                        .parse()
                        .context("--loop must be an integer")?;
                }
                "--sync" => {
                    opts.sync = match iter
                        .next()
                        .ok_or_else(|| anyhow!("--sync needs a mode"))?
                        .as_str()
                    {
                        "audio" => SyncMode::Audio,
                        "video" => SyncMode::Video,
                        "ext" => SyncMode::External,
                        other => return Err(anyhow!("unknown sync mode: {other}")),
                    };
                }
                "--volume" => {
                    opts.volume = iter
                        .next()
                        .ok_or_else(|| anyhow!("--volume needs a value"))?
                        .parse()
                        .context("--volume must be a number")?;
                }
                input if !input.starts_with("--") => {
                    // "synth:SECONDS" or a bare number of seconds.
                    let secs = input.strip_prefix("synth:").unwrap_or(input);
                    opts.duration = secs
                        .parse()
                        .with_context(|| format!("bad input: {input}"))?;
                }
                other => return Err(anyhow!("unknown option: {other}")),
            }
        }
        Ok(opts)
    }
}

// ============================================================================
// Synthetic demuxer
// ============================================================================

/// Interleaves empty-payload packets for a tone and a test pattern; the
/// decode sources synthesize content from the timestamps alone.
struct SyntheticSource {
    duration: f64,
    audio_enabled: bool,
    audio_pts: f64,
    video_pts: f64,
}

impl SyntheticSource {
    fn new(duration: f64, audio_enabled: bool) -> Self {
        Self {
            duration,
            audio_enabled,
            audio_pts: 0.0,
            video_pts: 0.0,
        }
    }
}

impl MediaSource for SyntheticSource {
    fn read(&mut self) -> Read {
        let block_dur = SAMPLES_PER_BLOCK as f64 / SAMPLE_RATE as f64;
        let frame_dur = 1.0 / FPS;
        let audio_due = self.audio_enabled && self.audio_pts < self.duration;
        let video_due = self.video_pts < self.duration;
        if !audio_due && !video_due {
            return Read::Eof;
        }
        // Deliver whichever stream is furthest behind.
        if audio_due && (!video_due || self.audio_pts <= self.video_pts) {
            let pts = self.audio_pts;
            self.audio_pts += block_dur;
            Read::Packet {
                kind: StreamKind::Audio,
                packet: Packet::new(bytes::Bytes::new(), pts, block_dur, -1),
            }
        } else {
            let pts = self.video_pts;
            self.video_pts += frame_dur;
            Read::Packet {
                kind: StreamKind::Video,
                packet: Packet::new(bytes::Bytes::new(), pts, frame_dur, -1),
            }
        }
    }

    fn seek(&mut self, target: &SeekTarget) -> Result<(), SourceError> {
        match target {
            SeekTarget::Time { pos, .. } => {
                let pos = pos.clamp(0.0, self.duration);
                self.audio_pts = pos;
                self.video_pts = pos;
                Ok(())
            }
            SeekTarget::Bytes { .. } => {
                Err(SourceError("synthetic source cannot seek by bytes".into()))
            }
        }
    }

    fn start_time(&self) -> f64 {
        0.0
    }
}

// ============================================================================
// Synthetic decoders
// ============================================================================

/// Phase-continuous sine generator driven by packet timestamps.
struct ToneDecoder {
    phase: f64,
    buffered: VecDeque<AudioBlock>,
    draining: bool,
}

impl ToneDecoder {
    fn new() -> Self {
        Self {
            phase: 0.0,
            buffered: VecDeque::new(),
            draining: false,
        }
    }
}

impl DecodeSource for ToneDecoder {
    type Frame = AudioBlock;

    fn send(&mut self, packet: &Packet) -> SendOutcome {
        if packet.eos {
            self.draining = true;
            return SendOutcome::Accepted;
        }
        let step = TONE_HZ * std::f64::consts::TAU / SAMPLE_RATE as f64;
        let mut samples = Vec::with_capacity(SAMPLES_PER_BLOCK * 2);
        for _ in 0..SAMPLES_PER_BLOCK {
            let s = (self.phase.sin() * 0.2) as f32;
            self.phase = (self.phase + step) % std::f64::consts::TAU;
            samples.push(s);
            samples.push(s);
        }
        self.buffered.push_back(AudioBlock {
            samples,
            channels: 2,
            sample_rate: SAMPLE_RATE,
            pts: packet.pts,
            pos: packet.pos,
        });
        SendOutcome::Accepted
    }

    fn receive(&mut self) -> Receive<AudioBlock> {
        if let Some(block) = self.buffered.pop_front() {
            Receive::Frame(block)
        } else if self.draining {
            self.draining = false;
            Receive::EndOfStream
        } else {
            Receive::NeedMoreInput
        }
    }

    fn flush(&mut self) {
        self.buffered.clear();
        self.draining = false;
    }

    fn name(&self) -> &str {
        "tone"
    }
}

/// Moving BGRA gradient keyed off the packet timestamp.
struct PatternDecoder {
    buffered: VecDeque<Picture>,
    draining: bool,
}

impl PatternDecoder {
    fn new() -> Self {
        Self {
            buffered: VecDeque::new(),
            draining: false,
        }
    }

    fn render(pts: f64) -> Vec<u8> {
        let mut data = vec![0u8; (WIDTH * HEIGHT * 4) as usize];
        let shift = (pts * 120.0) as u32;
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let i = ((y * WIDTH + x) * 4) as usize;
                data[i] = (x * 255 / WIDTH) as u8;
                data[i + 1] = (y * 255 / HEIGHT) as u8;
                data[i + 2] = (((x + shift) % WIDTH) * 255 / WIDTH) as u8;
                data[i + 3] = 255;
            }
        }
        data
    }
}

impl DecodeSource for PatternDecoder {
    type Frame = Picture;

    fn send(&mut self, packet: &Packet) -> SendOutcome {
        if packet.eos {
            self.draining = true;
            return SendOutcome::Accepted;
        }
        self.buffered.push_back(Picture {
            data: Self::render(packet.pts),
            width: WIDTH,
            height: HEIGHT,
            sar: 1.0,
            pts: packet.pts,
            best_effort_pts: packet.pts,
            dts: packet.pts,
            pos: packet.pos,
        });
        SendOutcome::Accepted
    }

    fn receive(&mut self) -> Receive<Picture> {
        if let Some(picture) = self.buffered.pop_front() {
            Receive::Frame(picture)
        } else if self.draining {
            self.draining = false;
            Receive::EndOfStream
        } else {
            Receive::NeedMoreInput
        }
    }

    fn flush(&mut self) {
        self.buffered.clear();
        self.draining = false;
    }

    fn name(&self) -> &str {
        "pattern"
    }
}

// ============================================================================
// Sample conversion
// ============================================================================

/// Nearest-sample converter handling rate, channel count, and the small
/// stretch/shrink the drift correction asks for.
struct LinearConverter {
    target: AudioParams,
}

impl SampleConverter for LinearConverter {
    fn convert(&mut self, block: &AudioBlock, wanted_nb_samples: usize) -> Vec<f32> {
        let src_frames = block.nb_samples();
        if src_frames == 0 {
            return Vec::new();
        }
        // wanted is expressed in source samples; scale to the device rate.
        let out_frames =
            (wanted_nb_samples as u64 * self.target.freq as u64 / block.sample_rate as u64) as usize;
        let src_ch = block.channels as usize;
        let dst_ch = self.target.channels as usize;
        let mut out = Vec::with_capacity(out_frames * dst_ch);
        for i in 0..out_frames {
            let src = (i * src_frames / out_frames).min(src_frames - 1) * src_ch;
            for c in 0..dst_ch {
                out.push(block.samples[src + c.min(src_ch - 1)]);
            }
        }
        out
    }
}

// ============================================================================
// Frame sinks
// ============================================================================

/// Announces `{width, height, key}` once, then streams raw BGRA frames.
struct TcpFrameSink {
    stream: Option<TcpStream>,
}

impl TcpFrameSink {
    fn connect(addr: &str, key: u64) -> Result<Self> {
        let mut stream =
            TcpStream::connect(addr).with_context(|| format!("connecting frame sink {addr}"))?;
        let handshake = serde_json::json!({
            "width": WIDTH,
            "height": HEIGHT,
            "key": key,
        });
        let mut line = serde_json::to_vec(&handshake)?;
        line.push(b'\n');
        stream.write_all(&line).context("frame sink handshake")?;
        tracing::info!(addr, "frame sink connected");
        Ok(Self {
            stream: Some(stream),
        })
    }
}

impl VideoSink for TcpFrameSink {
    fn display(&mut self, picture: &Picture, meta: FrameMeta) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(err) = stream.write_all(&picture.data) {
                tracing::warn!(%err, pts = meta.pts, "frame sink lost; disabling");
                self.stream = None;
            }
        }
    }
}

/// Headless sink for runs without a consumer attached.
struct NullSink;

impl VideoSink for NullSink {
    fn display(&mut self, _picture: &Picture, meta: FrameMeta) {
        tracing::trace!(pts = meta.pts, "frame presented");
    }
}

// ============================================================================
// Audio output
// ============================================================================

#[cfg(feature = "audio")]
mod audio_out {
    use super::*;
    use cadence_core::audio::{AudioPullPort, AudioRenderer};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use parking_lot::Mutex;

    /// Open the default device and wire its callback to the render port.
    /// Returns the negotiated format and the live stream.
    pub fn start(
        session: Arc<PlaybackSession>,
        volume: f64,
    ) -> Result<(AudioParams, cpal::Stream)> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| anyhow!("no audio output device"))?;
        let supported = device.default_output_config()?;
        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let target = AudioParams {
            freq: config.sample_rate.0,
            channels: config.channels,
        };
        // The device does not expose its buffer depth up front; assume a
        // 20 ms period for latency accounting.
        let hw_buf_size = target.bytes_per_sec() / 50;
        session.set_volume(volume);

        let renderer = Mutex::new(AudioRenderer::new(
            session,
            LinearConverter { target },
            target,
            hw_buf_size,
        ));

        let err_fn = |err| tracing::error!(%err, "audio stream error");
        let stream = match sample_format {
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    renderer.lock().fill(data);
                },
                err_fn,
                None,
            )?,
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut buf = vec![0.0f32; data.len()];
                    renderer.lock().fill(&mut buf);
                    for (dst, src) in data.iter_mut().zip(&buf) {
                        *dst = (src * i16::MAX as f32) as i16;
                    }
                },
                err_fn,
                None,
            )?,
            other => return Err(anyhow!("unsupported sample format: {other:?}")),
        };
        stream.play()?;
        Ok((target, stream))
    }
}

// ============================================================================
// Entry point
// ============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let opts = Options::from_args(&args)?;
    tracing::info!(
        version = cadence_core::VERSION,
        duration = opts.duration,
        "cadence player starting"
    );

    let config = SessionConfig {
        sync: opts.sync,
        loop_count: opts.loop_count,
        autoexit: true,
        volume: opts.volume,
        ..SessionConfig::default()
    };
    let session = PlaybackSession::new(config);
    session.open_video();

    let want_audio = !opts.no_audio;

    // Audio device first: when it cannot open, fall back to video-only so
    // the master clock selection degrades the same way a missing stream
    // would.
    #[cfg(feature = "audio")]
    let _audio_stream = if want_audio {
        match audio_out::start(session.clone(), opts.volume) {
            Ok((target, stream)) => {
                session.open_audio();
                tracing::info!(
                    freq = target.freq,
                    channels = target.channels,
                    "audio output opened"
                );
                Some(stream)
            }
            Err(err) => {
                tracing::warn!(%err, "audio output unavailable; continuing without");
                None
            }
        }
    } else {
        None
    };
    #[cfg(not(feature = "audio"))]
    if want_audio {
        tracing::warn!("built without the audio feature; continuing without");
    }

    // Decode drivers.
    let mut video_decoder = Decoder::new(
        PatternDecoder::new(),
        VideoTimestamps {
            reorder: ReorderMode::Auto,
        },
        session.videoq.clone(),
        session.continue_read.clone(),
    );
    video_decoder.set_start_pts(0.0);
    let video_finished = video_decoder.finished_handle();

    let mut audio_decoder = if session.has_audio() {
        let mut decoder = Decoder::new(
            ToneDecoder::new(),
            AudioTimestamps::new(),
            session.audioq.clone(),
            session.continue_read.clone(),
        );
        decoder.set_start_pts(0.0);
        Some(decoder)
    } else {
        None
    };

    // Read driver.
    let mut reader = ReadDriver::new(
        session.clone(),
        SyntheticSource::new(opts.duration, session.has_audio()),
    );
    reader.set_video_finished(video_finished);
    if let Some(decoder) = &audio_decoder {
        reader.set_audio_finished(decoder.finished_handle());
    }

    let video_thread = {
        let session = session.clone();
        thread::Builder::new()
            .name("video-decode".into())
            .spawn(move || video_decode_loop(&session, &mut video_decoder, 1.0 / FPS))?
    };
    let audio_thread = match audio_decoder.take() {
        Some(mut decoder) => {
            let session = session.clone();
            Some(
                thread::Builder::new()
                    .name("audio-decode".into())
                    .spawn(move || audio_decode_loop(&session, &mut decoder))?,
            )
        }
        None => None,
    };
    let reader_thread = thread::Builder::new()
        .name("reader".into())
        .spawn(move || reader.run())?;

    // Refresh loop on the main thread.
    let mut sink: Box<dyn VideoSink> = match &opts.sink_addr {
        Some(addr) => Box::new(TcpFrameSink::connect(addr, opts.key)?),
        None => Box::new(NullSink),
    };
    let mut scheduler = RefreshScheduler::new(session.clone());
    while !reader_thread.is_finished() {
        let wait = scheduler.step(sink.as_mut());
        thread::sleep(wait);
    }

    session.shutdown();
    let finished = reader_thread
        .join()
        .map_err(|_| anyhow!("reader thread panicked"))?;
    video_thread
        .join()
        .map_err(|_| anyhow!("video decode thread panicked"))?;
    if let Some(handle) = audio_thread {
        handle
            .join()
            .map_err(|_| anyhow!("audio decode thread panicked"))?;
    }

    tracing::info!(finished, "cadence player exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_the_control_surface() {
        let args: Vec<String> = [
            "cadence", "synth:3", "--sink", "127.0.0.1:9000", "--key", "7", "--loop", "2",
            "--sync", "ext", "--no-audio",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let opts = Options::from_args(&args).unwrap();
        assert_eq!(opts.duration, 3.0);
        assert_eq!(opts.sink_addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(opts.key, 7);
        assert_eq!(opts.loop_count, 2);
        assert_eq!(opts.sync, SyncMode::External);
        assert!(opts.no_audio);
    }

    #[test]
    fn synthetic_source_interleaves_and_ends() {
        let mut source = SyntheticSource::new(0.1, true);
        let mut audio = 0;
        let mut video = 0;
        loop {
            match source.read() {
                Read::Packet { kind, .. } => match kind {
                    StreamKind::Audio => audio += 1,
                    StreamKind::Video => video += 1,
                },
                Read::Eof => break,
                _ => panic!("unexpected read result"),
            }
        }
        // 0.1 s of content: 5 audio blocks (21.3 ms each) and 3 frames.
        assert_eq!(audio, 5);
        assert_eq!(video, 3);
        source
            .seek(&SeekTarget::Time { pos: 0.0, rel: 0.0 })
            .unwrap();
        assert!(matches!(source.read(), Read::Packet { .. }));
    }

    #[test]
    fn tone_decoder_is_phase_continuous() {
        let mut decoder = ToneDecoder::new();
        let p0 = Packet::new(bytes::Bytes::new(), 0.0, 0.02, -1);
        let p1 = Packet::new(bytes::Bytes::new(), 0.02, 0.02, -1);
        decoder.send(&p0);
        decoder.send(&p1);
        let a = match decoder.receive() {
            Receive::Frame(f) => f,
            _ => panic!("expected frame"),
        };
        let b = match decoder.receive() {
            Receive::Frame(f) => f,
            _ => panic!("expected frame"),
        };
        // No discontinuity across the block boundary.
        let last = a.samples[a.samples.len() - 2];
        let first = b.samples[0];
        assert!((last - first).abs() < 0.02);
    }

    #[test]
    fn converter_honors_channel_and_length_changes() {
        let mut converter = LinearConverter {
            target: AudioParams {
                freq: 48_000,
                channels: 2,
            },
        };
        let block = AudioBlock {
            samples: vec![0.5; 1024 * 2],
            channels: 2,
            sample_rate: 48_000,
            pts: 0.0,
            pos: -1,
        };
        let shrunk = converter.convert(&block, 1024 * 90 / 100);
        assert_eq!(shrunk.len(), (1024 * 90 / 100) * 2);
        assert!(shrunk.iter().all(|&s| s == 0.5));
    }
}
