//! Audio output backends.
//!
//! A backend opens a mono stream at a requested rate and invokes a [`RenderCallback`] on its
//! own schedule. [`CpalBackend`] talks to the host's default output device; [`ManualBackend`]
//! runs the callback synchronously on demand for tests and offline rendering.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::BridgeError;

/// Driver-invoked render function: fill the mono frame, given the playback time in seconds of
/// its first sample.
pub type RenderCallback = Box<dyn FnMut(&mut [f32], f64) + Send + 'static>;

/// An open output stream. Dropping it closes the stream and releases the callback.
pub trait OutputStream {
    /// Begin invoking the render callback.
    fn play(&mut self) -> Result<(), BridgeError>;
    /// Stop invoking the render callback.
    fn pause(&mut self) -> Result<(), BridgeError>;
}

/// Source of output streams.
pub trait OutputBackend {
    /// Stream type produced by [`open`](Self::open).
    type Stream: OutputStream;

    /// Rate used when the caller does not request one.
    fn default_sample_rate(&self) -> Result<u32, BridgeError>;

    /// Open a paused stream at `sample_rate`. Asynchronous stream failures bump `errors`.
    fn open(
        &self,
        sample_rate: u32,
        callback: RenderCallback,
        errors: Arc<AtomicU64>,
    ) -> Result<Self::Stream, BridgeError>;
}

type CallbackSlot = Arc<Mutex<Option<RenderCallback>>>;

/// Backend whose callback runs only when [`render`](Self::render) is called.
#[derive(Clone)]
pub struct ManualBackend {
    sample_rate: u32,
    slot: CallbackSlot,
    playing: Arc<AtomicBool>,
}

impl ManualBackend {
    /// Create a backend reporting `sample_rate` as its default.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            slot: Arc::new(Mutex::new(None)),
            playing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a stream is open and playing.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    /// Invoke the callback for one frame. Returns `None` unless a stream is open and playing.
    pub fn render(&self, frames: usize, timebase: f64) -> Option<Vec<f32>> {
        if !self.is_playing() {
            return None;
        }
        let mut slot = self.slot.lock();
        let callback = slot.as_mut()?;
        let mut out = vec![0.0f32; frames];
        callback(&mut out, timebase);
        Some(out)
    }

    /// Render consecutive frames with a timebase advancing at the backend rate.
    pub fn render_blocks(&self, frames: usize, blocks: usize, start: f64) -> Vec<f32> {
        let mut recorded = Vec::with_capacity(frames * blocks);
        for block in 0..blocks {
            let timebase = start + (block * frames) as f64 / self.sample_rate as f64;
            match self.render(frames, timebase) {
                Some(frame) => recorded.extend(frame),
                None => break,
            }
        }
        recorded
    }
}

impl OutputBackend for ManualBackend {
    type Stream = ManualStream;

    fn default_sample_rate(&self) -> Result<u32, BridgeError> {
        Ok(self.sample_rate)
    }

    fn open(
        &self,
        _sample_rate: u32,
        callback: RenderCallback,
        _errors: Arc<AtomicU64>,
    ) -> Result<Self::Stream, BridgeError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(BridgeError::Device("manual stream already open".into()));
        }
        *slot = Some(callback);
        Ok(ManualStream {
            slot: Arc::clone(&self.slot),
            playing: Arc::clone(&self.playing),
        })
    }
}

/// Stream handed out by [`ManualBackend`].
pub struct ManualStream {
    slot: CallbackSlot,
    playing: Arc<AtomicBool>,
}

impl OutputStream for ManualStream {
    fn play(&mut self) -> Result<(), BridgeError> {
        self.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<(), BridgeError> {
        self.playing.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for ManualStream {
    fn drop(&mut self) {
        self.playing.store(false, Ordering::Release);
        // Taking the lock waits out any render in flight.
        self.slot.lock().take();
    }
}

#[cfg(feature = "cpal")]
pub use self::host::{CpalBackend, CpalStream};

#[cfg(feature = "cpal")]
mod host {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{
        BufferSize, Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream,
        StreamConfig, StreamInstant, SupportedBufferSize,
    };
    use tracing::{debug, error, info};

    use super::{OutputBackend, OutputStream, RenderCallback};
    use crate::BridgeError;

    const DEFAULT_SCRATCH_FRAMES: usize = 8_192;
    const MIN_SCRATCH_FRAMES: usize = 256;
    const MAX_SCRATCH_FRAMES: usize = 16_384;

    /// Mono scratch length for a device buffer range; larger callbacks render in chunks.
    fn scratch_frames(buffer_size: &SupportedBufferSize) -> usize {
        match buffer_size {
            SupportedBufferSize::Range { max, .. } => {
                (*max as usize).clamp(MIN_SCRATCH_FRAMES, MAX_SCRATCH_FRAMES)
            }
            SupportedBufferSize::Unknown => DEFAULT_SCRATCH_FRAMES,
        }
    }

    /// Fill interleaved `data` through `callback`, at most `mono.len()` frames per call.
    ///
    /// Each chunk's timebase is advanced by the frames already rendered.
    fn render_interleaved<T>(
        data: &mut [T],
        channels: usize,
        mono: &mut [f32],
        sample_rate: f64,
        timebase: f64,
        callback: &mut RenderCallback,
    ) where
        T: SizedSample + FromSample<f32>,
    {
        let chunk_frames = mono.len().max(1);
        let mut rendered = 0usize;
        for chunk in data.chunks_mut(chunk_frames * channels) {
            let frames = chunk.len() / channels;
            let block = &mut mono[..frames];
            callback(block, timebase + rendered as f64 / sample_rate);
            for (frame, sample) in chunk.chunks_exact_mut(channels).zip(block.iter()) {
                frame.fill(T::from_sample(*sample));
            }
            rendered += frames;
        }
    }

    /// Backend bound to the default output device of the default host.
    pub struct CpalBackend {
        device: Device,
    }

    impl CpalBackend {
        /// Resolve the default output device.
        pub fn default_device() -> Result<Self, BridgeError> {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(BridgeError::NoOutputDevice)?;
            let name = device.name().unwrap_or_else(|_| "unknown".to_string());
            info!(device = %name, host = ?host.id(), "using default output device");
            Ok(Self { device })
        }

        fn build<T>(
            &self,
            config: &StreamConfig,
            scratch_frames: usize,
            mut callback: RenderCallback,
            errors: Arc<AtomicU64>,
        ) -> Result<Stream, BridgeError>
        where
            T: SizedSample + FromSample<f32>,
        {
            let channels = config.channels.max(1) as usize;
            let sample_rate = config.sample_rate.0 as f64;
            let mut mono = vec![0.0f32; scratch_frames];
            let mut origin: Option<StreamInstant> = None;

            self.device
                .build_output_stream(
                    config,
                    move |data: &mut [T], info: &cpal::OutputCallbackInfo| {
                        let playback = info.timestamp().playback;
                        let start = *origin.get_or_insert(playback);
                        let timebase = playback
                            .duration_since(&start)
                            .map(|elapsed| elapsed.as_secs_f64())
                            .unwrap_or(0.0);
                        render_interleaved(
                            data,
                            channels,
                            &mut mono,
                            sample_rate,
                            timebase,
                            &mut callback,
                        );
                    },
                    move |err| {
                        error!("audio stream error: {err}");
                        errors.fetch_add(1, Ordering::Relaxed);
                    },
                    None,
                )
                .map_err(|e| BridgeError::Device(format!("failed to build stream: {e}")))
        }
    }

    impl OutputBackend for CpalBackend {
        type Stream = CpalStream;

        fn default_sample_rate(&self) -> Result<u32, BridgeError> {
            let config = self
                .device
                .default_output_config()
                .map_err(|e| BridgeError::Device(format!("failed to query default config: {e}")))?;
            Ok(config.sample_rate().0)
        }

        fn open(
            &self,
            sample_rate: u32,
            callback: RenderCallback,
            errors: Arc<AtomicU64>,
        ) -> Result<Self::Stream, BridgeError> {
            let supported = self
                .device
                .default_output_config()
                .map_err(|e| BridgeError::Device(format!("failed to query default config: {e}")))?;
            let config = StreamConfig {
                channels: supported.channels(),
                sample_rate: SampleRate(sample_rate),
                buffer_size: BufferSize::Default,
            };
            let scratch = scratch_frames(supported.buffer_size());
            debug!(
                sample_rate,
                channels = config.channels,
                format = ?supported.sample_format(),
                scratch,
                "opening output stream"
            );

            let stream = match supported.sample_format() {
                SampleFormat::F32 => self.build::<f32>(&config, scratch, callback, errors)?,
                SampleFormat::I16 => self.build::<i16>(&config, scratch, callback, errors)?,
                SampleFormat::U16 => self.build::<u16>(&config, scratch, callback, errors)?,
                SampleFormat::I32 => self.build::<i32>(&config, scratch, callback, errors)?,
                other => {
                    return Err(BridgeError::Device(format!(
                        "unsupported sample format {other:?}"
                    )));
                }
            };
            Ok(CpalStream { stream })
        }
    }

    /// Running `cpal` output stream.
    pub struct CpalStream {
        stream: Stream,
    }

    impl OutputStream for CpalStream {
        fn play(&mut self) -> Result<(), BridgeError> {
            self.stream
                .play()
                .map_err(|e| BridgeError::Device(format!("failed to start stream: {e}")))
        }

        fn pause(&mut self) -> Result<(), BridgeError> {
            self.stream
                .pause()
                .map_err(|e| BridgeError::Device(format!("failed to pause stream: {e}")))
        }
    }

}
