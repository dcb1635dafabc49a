//! Pull-driven streaming rate conversion.
//!
//! [`StreamingResampler`] produces output on demand and fetches input through a [`PullSource`]
//! only when its internal queue runs dry, so it can be driven entirely from the device callback.
//! Rate conversion itself is delegated to `rubato` fixed-output resamplers.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rubato::{
    FastFixedOut, PolynomialDegree, Resampler as _, SincFixedOut, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};
use serde::Deserialize;

use crate::BridgeError;
use crate::ring::SharedRing;

/// Converter quality selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConverterType {
    /// Long band-limited sinc kernel with cubic interpolation.
    SincBest,
    /// Medium sinc kernel.
    SincMedium,
    /// Short sinc kernel; the cheapest band-limited option.
    #[default]
    SincFastest,
    /// Linear interpolation between neighbouring input samples.
    Linear,
    /// Nearest-sample hold.
    ZeroOrderHold,
}

impl ConverterType {
    /// Every selectable converter, in descending quality order.
    pub const ALL: [ConverterType; 5] = [
        ConverterType::SincBest,
        ConverterType::SincMedium,
        ConverterType::SincFastest,
        ConverterType::Linear,
        ConverterType::ZeroOrderHold,
    ];

    /// Stable identifier used in config files and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConverterType::SincBest => "sinc-best",
            ConverterType::SincMedium => "sinc-medium",
            ConverterType::SincFastest => "sinc-fastest",
            ConverterType::Linear => "linear",
            ConverterType::ZeroOrderHold => "zero-order-hold",
        }
    }

    fn sinc_parameters(&self) -> Option<SincInterpolationParameters> {
        let (sinc_len, f_cutoff, oversampling_factor, interpolation, window) = match self {
            ConverterType::SincBest => (
                256,
                0.95,
                256,
                SincInterpolationType::Cubic,
                WindowFunction::BlackmanHarris2,
            ),
            ConverterType::SincMedium => (
                128,
                0.925,
                128,
                SincInterpolationType::Linear,
                WindowFunction::Blackman2,
            ),
            ConverterType::SincFastest => (
                64,
                0.915,
                64,
                SincInterpolationType::Linear,
                WindowFunction::Hann2,
            ),
            ConverterType::Linear | ConverterType::ZeroOrderHold => return None,
        };
        Some(SincInterpolationParameters {
            sinc_len,
            f_cutoff,
            interpolation,
            oversampling_factor,
            window,
        })
    }
}

impl fmt::Display for ConverterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConverterType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        ConverterType::ALL
            .into_iter()
            .find(|converter| converter.as_str() == normalized)
            .ok_or_else(|| {
                let names: Vec<&str> = ConverterType::ALL.iter().map(|c| c.as_str()).collect();
                format!("unknown converter '{s}', expected one of {}", names.join(", "))
            })
    }
}

/// Input side of a [`StreamingResampler`].
pub trait PullSource: Send {
    /// Append input samples to `dest`. Must never block.
    ///
    /// Appending nothing means input is momentarily out of reach; the resampler then ends the
    /// current read short instead of inventing samples.
    fn pull(&mut self, dest: &mut Vec<f32>);
}

/// Output side of a rate converter as seen by the device callback.
pub trait Resample: Send {
    /// Fill `out` from the front, returning how many samples were written.
    ///
    /// May return fewer than `out.len()` samples at stream edges or on internal faults.
    fn read(&mut self, out: &mut [f32]) -> usize;

    /// Output rate divided by input rate.
    fn ratio(&self) -> f64;
}

/// Pull adapter that drains the shared ring into the resampler.
///
/// An empty ring yields a single zero placeholder so the converter keeps running. If the
/// producer holds the lock at that instant nothing is appended, so no sample is ever inserted
/// ahead of data already in the ring.
pub struct RingPull {
    ring: SharedRing,
    placeholders: Arc<AtomicU64>,
    contended: Arc<AtomicU64>,
}

impl RingPull {
    /// Wrap `ring` with fresh counters.
    pub fn new(ring: SharedRing) -> Self {
        Self {
            ring,
            placeholders: Arc::new(AtomicU64::new(0)),
            contended: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Counter of pulls answered with the zero placeholder.
    pub fn placeholder_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.placeholders)
    }

    /// Counter of pulls that found the ring locked by the producer and appended nothing.
    pub fn contention_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.contended)
    }
}

impl PullSource for RingPull {
    fn pull(&mut self, dest: &mut Vec<f32>) {
        let Some(mut ring) = self.ring.try_lock() else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if ring.drain_into(dest) == 0 {
            self.placeholders.fetch_add(1, Ordering::Relaxed);
            dest.push(0.0);
        }
    }
}

enum Engine {
    Sinc(SincFixedOut<f32>),
    Polynomial(FastFixedOut<f32>),
}

impl Engine {
    fn new(converter: ConverterType, ratio: f64, chunk_frames: usize) -> Result<Self, BridgeError> {
        let engine = match converter.sinc_parameters() {
            Some(params) => SincFixedOut::<f32>::new(ratio, 1.0, params, chunk_frames, 1)
                .map(Engine::Sinc),
            None => {
                let degree = if converter == ConverterType::ZeroOrderHold {
                    PolynomialDegree::Nearest
                } else {
                    PolynomialDegree::Linear
                };
                FastFixedOut::<f32>::new(ratio, 1.0, degree, chunk_frames, 1).map(Engine::Polynomial)
            }
        };
        engine.map_err(|e| BridgeError::Resampler(format!("failed to create {converter}: {e}")))
    }

    fn input_frames_next(&self) -> usize {
        match self {
            Engine::Sinc(r) => r.input_frames_next(),
            Engine::Polynomial(r) => r.input_frames_next(),
        }
    }

    fn input_frames_max(&self) -> usize {
        match self {
            Engine::Sinc(r) => r.input_frames_max(),
            Engine::Polynomial(r) => r.input_frames_max(),
        }
    }

    fn output_frames_max(&self) -> usize {
        match self {
            Engine::Sinc(r) => r.output_frames_max(),
            Engine::Polynomial(r) => r.output_frames_max(),
        }
    }

    fn process(&mut self, input: &[f32], output: &mut [f32]) -> Result<(usize, usize), String> {
        let wave_in = [input];
        let mut wave_out = [output];
        let result = match self {
            Engine::Sinc(r) => r.process_into_buffer(&wave_in, &mut wave_out, None),
            Engine::Polynomial(r) => r.process_into_buffer(&wave_in, &mut wave_out, None),
        };
        result.map_err(|e| e.to_string())
    }
}

/// Mono streaming resampler pulling its input on demand.
pub struct StreamingResampler<P: PullSource> {
    engine: Engine,
    source: P,
    ratio: f64,
    pending: Vec<f32>,
    output: Vec<f32>,
    output_pos: usize,
    output_len: usize,
    faults: Arc<AtomicU64>,
}

impl<P: PullSource> StreamingResampler<P> {
    /// Build a converter producing `ratio` output samples per input sample.
    ///
    /// `chunk_frames` is the engine's fixed output block. `max_pull` bounds how many samples a
    /// single [`PullSource::pull`] may append; staging space for it is reserved up front so the
    /// output path never reallocates.
    pub fn new(
        source: P,
        ratio: f64,
        converter: ConverterType,
        chunk_frames: usize,
        max_pull: usize,
    ) -> Result<Self, BridgeError> {
        if !(ratio.is_finite() && ratio > 0.0) {
            return Err(BridgeError::Resampler(format!("invalid ratio {ratio}")));
        }
        let engine = Engine::new(converter, ratio, chunk_frames.max(1))?;
        let pending = Vec::with_capacity(engine.input_frames_max() + max_pull.max(1));
        let output = vec![0.0; engine.output_frames_max()];
        Ok(Self {
            engine,
            source,
            ratio,
            pending,
            output,
            output_pos: 0,
            output_len: 0,
            faults: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Counter of engine failures; each one ends the current read early.
    pub fn fault_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.faults)
    }

    /// Samples pulled from the source but not yet consumed by the engine.
    pub fn pending_input(&self) -> usize {
        self.pending.len()
    }

    fn refill(&mut self) -> bool {
        let needed = self.engine.input_frames_next();
        while self.pending.len() < needed {
            let before = self.pending.len();
            self.source.pull(&mut self.pending);
            if self.pending.len() == before {
                return false;
            }
        }

        match self.engine.process(&self.pending[..needed], &mut self.output) {
            Ok((consumed, produced)) => {
                self.pending.drain(..consumed.min(self.pending.len()));
                self.output_pos = 0;
                self.output_len = produced;
                produced > 0
            }
            Err(_) => {
                self.faults.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

impl<P: PullSource> Resample for StreamingResampler<P> {
    fn read(&mut self, out: &mut [f32]) -> usize {
        let mut written = 0;
        while written < out.len() {
            if self.output_pos == self.output_len && !self.refill() {
                break;
            }
            let count = (self.output_len - self.output_pos).min(out.len() - written);
            out[written..written + count]
                .copy_from_slice(&self.output[self.output_pos..self.output_pos + count]);
            self.output_pos += count;
            written += count;
        }
        written
    }

    fn ratio(&self) -> f64 {
        self.ratio
    }
}
