//! Producer-to-device bridge.
//!
//! Two execution contexts meet here. The producer context calls [`Bridge::push_samples`] (or a
//! [`SampleSender`]) whenever a burst arrives. The driver context runs the render callback
//! registered on the output stream; it drains the ring through the resampler, zero-pads short
//! frames and applies the active processor. The ring is the only state both sides touch, and the
//! driver side only ever `try_lock`s it, so the callback never waits on the producer.

use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::BridgeError;
use crate::config::BridgeConfig;
use crate::device::{OutputBackend, OutputStream, RenderCallback};
use crate::processor::{OutputProcessor, PassThrough};
use crate::resample::{Resample, RingPull, StreamingResampler};
use crate::ring::{RingBuffer, SharedRing, monotonic_timestamp_ns};

/// Lifecycle state of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No output stream is open.
    Idle,
    /// The output stream is open and invoking the render callback.
    Running,
}

/// Processor hand-off between the control thread and the render callback.
enum Handoff {
    Empty,
    Pending(Box<dyn OutputProcessor>),
    /// Held only so the displaced processor is dropped off the render thread.
    Retired { _processor: Box<dyn OutputProcessor> },
}

type HandoffSlot = Arc<Mutex<Handoff>>;

/// Counters maintained by the render path.
#[derive(Default)]
struct RenderStats {
    callbacks: AtomicU64,
    padded_callbacks: AtomicU64,
    padded_samples: AtomicU64,
    silent_callbacks: AtomicU64,
}

/// Per-callback pipeline: resample, pad, process.
///
/// Owned by the render callback while the stream runs. Exposed so that the frame pipeline can
/// be driven directly with any [`Resample`] implementation.
pub struct Renderer {
    resampler: Box<dyn Resample>,
    processor: Box<dyn OutputProcessor>,
    sample_rate: f64,
    handoff: HandoffSlot,
    stats: Arc<RenderStats>,
}

impl Renderer {
    /// Pipeline at `sample_rate` with a unity pass-through processor.
    pub fn new(resampler: Box<dyn Resample>, sample_rate: f64) -> Self {
        Self {
            resampler,
            processor: Box::new(PassThrough::default()),
            sample_rate,
            handoff: Arc::new(Mutex::new(Handoff::Empty)),
            stats: Arc::new(RenderStats::default()),
        }
    }

    /// Replace the active processor immediately, returning the previous one.
    pub fn set_processor(
        &mut self,
        processor: Box<dyn OutputProcessor>,
    ) -> Box<dyn OutputProcessor> {
        std::mem::replace(&mut self.processor, processor)
    }

    /// Label of the active processor.
    pub fn processor_name(&self) -> &'static str {
        self.processor.name()
    }

    /// Produce one output frame into `out`.
    ///
    /// Pulls `out.len()` samples from the resampler, fills any shortfall with zeros and runs the
    /// active processor over the whole frame.
    pub fn render(&mut self, out: &mut [f32], timebase: f64) {
        self.adopt_pending();

        let produced = self.resampler.read(out);
        if produced < out.len() {
            out[produced..].fill(0.0);
            self.stats.padded_callbacks.fetch_add(1, Ordering::Relaxed);
            self.stats
                .padded_samples
                .fetch_add((out.len() - produced) as u64, Ordering::Relaxed);
        }
        self.processor.process(out, self.sample_rate, timebase);
        self.stats.callbacks.fetch_add(1, Ordering::Relaxed);
    }

    fn adopt_pending(&mut self) {
        let Some(mut slot) = self.handoff.try_lock() else {
            return;
        };
        let taken = std::mem::replace(&mut *slot, Handoff::Empty);
        *slot = match taken {
            Handoff::Pending(next) => Handoff::Retired {
                _processor: std::mem::replace(&mut self.processor, next),
            },
            other => other,
        };
    }
}

/// Cloneable producer-side handle that writes into a bridge's ring.
#[derive(Clone)]
pub struct SampleSender {
    ring: SharedRing,
    last_push_ns: Arc<AtomicU64>,
}

impl SampleSender {
    fn new(ring: SharedRing) -> Self {
        Self {
            ring,
            last_push_ns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append samples; overrun policy is that of [`RingBuffer::write`].
    ///
    /// The ring lock is held only for the copy.
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let lost = self.ring.lock().write(samples);
        self.last_push_ns
            .store(monotonic_timestamp_ns().max(1), Ordering::Relaxed);
        if lost > 0 {
            trace!(lost, written = samples.len(), "ring overrun");
        }
    }
}

/// Diagnostics snapshot of a [`Bridge`].
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeStatus {
    /// Lifecycle state.
    pub state: BridgeState,
    /// Producer rate in Hertz.
    pub input_sample_rate: f64,
    /// Device rate in Hertz.
    pub output_sample_rate: u32,
    /// Output rate over input rate.
    pub ratio: f64,
    /// Ring capacity in samples.
    pub capacity: usize,
    /// Unread samples in the ring.
    pub available: usize,
    /// Unread samples lost to overwrites since construction.
    pub overrun_samples: u64,
    /// Milliseconds since the last non-empty push, `None` before the first one.
    pub last_push_age_ms: Option<f64>,
    /// Frames rendered through the processor.
    pub callbacks: u64,
    /// Frames that needed zero padding after resampling.
    pub padded_callbacks: u64,
    /// Total zero samples inserted by padding.
    pub padded_samples: u64,
    /// Frames replaced by silence because the pipeline was busy or faulted.
    pub silent_callbacks: u64,
    /// Resampler pulls answered with the zero placeholder.
    pub placeholder_pulls: u64,
    /// Resampler pulls that found the ring locked by the producer and supplied nothing.
    pub contended_pulls: u64,
    /// Rate-converter failures.
    pub resampler_faults: u64,
    /// Asynchronous errors reported by the output stream.
    pub stream_errors: u64,
}

struct PullCounters {
    placeholders: Arc<AtomicU64>,
    contended: Arc<AtomicU64>,
    faults: Arc<AtomicU64>,
}

/// Owns the ring, the resampler, the active processor and the output stream.
pub struct Bridge<B: OutputBackend> {
    backend: B,
    input_sample_rate: f64,
    output_sample_rate: u32,
    ratio: f64,
    sender: SampleSender,
    renderer: Arc<Mutex<Renderer>>,
    handoff: HandoffSlot,
    stats: Arc<RenderStats>,
    pulls: PullCounters,
    stream_errors: Arc<AtomicU64>,
    stream: Option<B::Stream>,
}

impl<B: OutputBackend> Bridge<B> {
    /// Validate `config`, resolve the output rate and build the idle pipeline.
    pub fn new(config: &BridgeConfig, backend: B) -> Result<Self, BridgeError> {
        config.validate()?;
        let output_sample_rate = match config.output_sample_rate {
            Some(rate) => rate,
            None => backend.default_sample_rate()?,
        };
        if output_sample_rate == 0 {
            return Err(BridgeError::InvalidSampleRate(0.0));
        }
        let ratio = output_sample_rate as f64 / config.input_sample_rate;

        let ring = RingBuffer::shared(config.capacity)
            .ok_or(BridgeError::InvalidCapacity(config.capacity))?;
        let sender = SampleSender::new(Arc::clone(&ring));
        let pull = RingPull::new(ring);
        let placeholders = pull.placeholder_counter();
        let contended = pull.contention_counter();
        let resampler = StreamingResampler::new(
            pull,
            ratio,
            config.converter,
            config.chunk_frames,
            config.capacity,
        )?;
        let faults = resampler.fault_counter();

        let renderer = Renderer::new(Box::new(resampler), output_sample_rate as f64);
        let handoff = Arc::clone(&renderer.handoff);
        let stats = Arc::clone(&renderer.stats);

        info!(
            input_sample_rate = config.input_sample_rate,
            output_sample_rate,
            ratio,
            capacity = config.capacity,
            converter = %config.converter,
            "bridge created"
        );

        Ok(Self {
            backend,
            input_sample_rate: config.input_sample_rate,
            output_sample_rate,
            ratio,
            sender,
            renderer: Arc::new(Mutex::new(renderer)),
            handoff,
            stats,
            pulls: PullCounters {
                placeholders,
                contended,
                faults,
            },
            stream_errors: Arc::new(AtomicU64::new(0)),
            stream: None,
        })
    }

    /// Producer rate in Hertz.
    pub fn input_sample_rate(&self) -> f64 {
        self.input_sample_rate
    }

    /// Device rate in Hertz.
    pub fn output_sample_rate(&self) -> u32 {
        self.output_sample_rate
    }

    /// Output rate over input rate.
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        if self.stream.is_some() {
            BridgeState::Running
        } else {
            BridgeState::Idle
        }
    }

    /// Append samples from the producer context.
    pub fn push_samples(&self, samples: &[f32]) {
        self.sender.push(samples);
    }

    /// Handle for pushing samples from another thread.
    pub fn sender(&self) -> SampleSender {
        self.sender.clone()
    }

    /// Replace the active processor from the next rendered frame on.
    ///
    /// A processor queued earlier but not yet picked up is discarded in favour of this one.
    pub fn attach_processor(&self, processor: Box<dyn OutputProcessor>) {
        let name = processor.name();
        let previous = std::mem::replace(&mut *self.handoff.lock(), Handoff::Pending(processor));
        if self.stream.is_none() {
            // No callback will pick it up; apply now.
            self.renderer.lock().adopt_pending();
        }
        drop(previous);
        debug!(processor = name, "output processor attached");
    }

    /// Label of the processor that rendered the most recent frame.
    ///
    /// Briefly locks the render pipeline, so avoid polling it while running.
    pub fn processor_name(&self) -> &'static str {
        self.renderer.lock().processor_name()
    }

    /// Open the output stream and begin rendering.
    pub fn start(&mut self) -> Result<(), BridgeError> {
        if self.stream.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        let renderer = Arc::clone(&self.renderer);
        let stats = Arc::clone(&self.stats);
        let callback: RenderCallback = Box::new(move |out: &mut [f32], timebase: f64| {
            let rendered = match renderer.try_lock() {
                Some(mut renderer) => {
                    catch_unwind(AssertUnwindSafe(|| renderer.render(out, timebase))).is_ok()
                }
                None => false,
            };
            if !rendered {
                out.fill(0.0);
                stats.silent_callbacks.fetch_add(1, Ordering::Relaxed);
            }
        });

        let mut stream =
            self.backend
                .open(self.output_sample_rate, callback, Arc::clone(&self.stream_errors))?;
        stream.play()?;
        self.stream = Some(stream);
        info!(sample_rate = self.output_sample_rate, "output stream started");
        Ok(())
    }

    /// Halt the output stream and release it. No callback runs after this returns.
    ///
    /// Stopping an idle bridge does nothing. The stream is released even if pausing fails.
    pub fn stop(&mut self) -> Result<(), BridgeError> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let paused = stream.pause();
        drop(stream);
        info!("output stream stopped");
        paused
    }

    /// Start the stream and return a guard that stops it when dropped.
    pub fn activate(&mut self) -> Result<ActiveBridge<'_, B>, BridgeError> {
        self.start()?;
        Ok(ActiveBridge { bridge: self })
    }

    /// Run `body` with the stream active, stopping it on every exit path.
    pub fn run<R>(&mut self, body: impl FnOnce(&Bridge<B>) -> R) -> Result<R, BridgeError> {
        let active = self.activate()?;
        let result = body(&active);
        active.finish()?;
        Ok(result)
    }

    /// Diagnostics snapshot.
    pub fn status(&self) -> BridgeStatus {
        let (capacity, available, overrun_samples) = {
            let ring = self.sender.ring.lock();
            (ring.capacity(), ring.available(), ring.overrun_samples())
        };
        let last_write_ns = self.sender.last_push_ns.load(Ordering::Relaxed);
        let last_push_age_ms = (last_write_ns > 0).then(|| {
            monotonic_timestamp_ns().saturating_sub(last_write_ns) as f64 / 1_000_000.0
        });

        BridgeStatus {
            state: self.state(),
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            ratio: self.ratio,
            capacity,
            available,
            overrun_samples,
            last_push_age_ms,
            callbacks: self.stats.callbacks.load(Ordering::Relaxed),
            padded_callbacks: self.stats.padded_callbacks.load(Ordering::Relaxed),
            padded_samples: self.stats.padded_samples.load(Ordering::Relaxed),
            silent_callbacks: self.stats.silent_callbacks.load(Ordering::Relaxed),
            placeholder_pulls: self.pulls.placeholders.load(Ordering::Relaxed),
            contended_pulls: self.pulls.contended.load(Ordering::Relaxed),
            resampler_faults: self.pulls.faults.load(Ordering::Relaxed),
            stream_errors: self.stream_errors.load(Ordering::Relaxed),
        }
    }
}

impl<B: OutputBackend> Drop for Bridge<B> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("failed to stop output stream: {err}");
        }
    }
}

/// Scope guard holding a running [`Bridge`]; dropping it stops the stream.
pub struct ActiveBridge<'a, B: OutputBackend> {
    bridge: &'a mut Bridge<B>,
}

impl<B: OutputBackend> ActiveBridge<'_, B> {
    /// Stop the stream now, surfacing any error.
    pub fn finish(self) -> Result<(), BridgeError> {
        self.bridge.stop()
    }
}

impl<B: OutputBackend> Deref for ActiveBridge<'_, B> {
    type Target = Bridge<B>;

    fn deref(&self) -> &Self::Target {
        self.bridge
    }
}

impl<B: OutputBackend> Drop for ActiveBridge<'_, B> {
    fn drop(&mut self) {
        if let Err(err) = self.bridge.stop() {
            error!("failed to stop output stream: {err}");
        }
    }
}
