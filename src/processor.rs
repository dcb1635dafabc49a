//! Per-callback output stages applied to resampled frames.
//!
//! A processor sees each frame exactly once, in device order, and rewrites it in place. Any
//! state it needs between frames lives on the processor itself.

use std::f64::consts::TAU;

/// Frame transform run on the real-time output path.
///
/// Implementations must not block, allocate or perform I/O inside [`process`](Self::process).
pub trait OutputProcessor: Send {
    /// Transform `frame` in place.
    ///
    /// `sample_rate` is the device output rate in Hertz and `timebase` the device-reported
    /// playback time of the first sample in seconds.
    fn process(&mut self, frame: &mut [f32], sample_rate: f64, timebase: f64);

    /// Short human-readable label used in logs.
    fn name(&self) -> &'static str;
}

/// Scales samples by input gain and output volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassThrough {
    /// Multiplier applied to incoming samples.
    pub input_gain: f32,
    /// Multiplier applied to outgoing samples.
    pub output_volume: f32,
}

impl PassThrough {
    /// Construct with explicit gain and volume.
    pub fn new(input_gain: f32, output_volume: f32) -> Self {
        Self {
            input_gain,
            output_volume,
        }
    }
}

impl Default for PassThrough {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl OutputProcessor for PassThrough {
    fn process(&mut self, frame: &mut [f32], _sample_rate: f64, _timebase: f64) {
        let scale = self.output_volume * self.input_gain;
        for sample in frame.iter_mut() {
            *sample *= scale;
        }
    }

    fn name(&self) -> &'static str {
        "pass-through"
    }
}

/// Phase-continuous frequency modulation of the sample stream onto a cosine carrier.
///
/// The instantaneous frequency is `carrier_frequency + input_gain * sample` Hertz. The integral
/// of the modulating signal is carried across frames in a phase accumulator so consecutive
/// frames join without a discontinuity.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyModulator {
    /// Multiplier applied to incoming samples before integration.
    pub input_gain: f32,
    /// Multiplier applied to the modulated carrier.
    pub output_volume: f32,
    /// Carrier frequency in Hertz.
    pub carrier_frequency: f64,
    last_phase: f64,
}

impl FrequencyModulator {
    /// Construct with explicit parameters and a zero phase accumulator.
    pub fn new(input_gain: f32, output_volume: f32, carrier_frequency: f64) -> Self {
        Self {
            input_gain,
            output_volume,
            carrier_frequency,
            last_phase: 0.0,
        }
    }

    /// Modulation phase carried into the next frame, in radians within `[0, 2π)`.
    pub fn last_phase(&self) -> f64 {
        self.last_phase
    }

    /// Zero the phase accumulator.
    pub fn reset(&mut self) {
        self.last_phase = 0.0;
    }
}

impl Default for FrequencyModulator {
    fn default() -> Self {
        Self::new(1.0, 1.0, 500.0)
    }
}

impl OutputProcessor for FrequencyModulator {
    fn process(&mut self, frame: &mut [f32], sample_rate: f64, timebase: f64) {
        if sample_rate.is_nan() || sample_rate <= 0.0 {
            frame.fill(0.0);
            return;
        }
        if frame.is_empty() {
            return;
        }
        let gain = self.input_gain as f64;
        let volume = self.output_volume as f64;
        let carrier_step = TAU * self.carrier_frequency;
        let mut fm_phase = self.last_phase;

        for (index, sample) in frame.iter_mut().enumerate() {
            fm_phase += TAU * gain * (*sample as f64) / sample_rate;
            let time = timebase + index as f64 / sample_rate;
            let carrier_phase = carrier_step * time;
            *sample = (volume * (carrier_phase + fm_phase).cos()) as f32;
        }

        // Wrapping keeps precision on long runs without changing the waveform.
        self.last_phase = fm_phase.rem_euclid(TAU);
    }

    fn name(&self) -> &'static str {
        "frequency-modulator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: f64 = 48_000.0;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (index, (x, y)) in a.iter().zip(b).enumerate() {
            assert!((x - y).abs() < 1e-4, "sample {index}: {x} vs {y}");
        }
    }

    #[test]
    fn pass_through_scales_by_gain_and_volume() {
        let mut processor = PassThrough::new(2.0, 0.25);
        let mut frame = vec![1.0, -0.5, 0.0, 4.0];
        processor.process(&mut frame, RATE, 0.0);
        assert_eq!(frame, vec![0.5, -0.25, 0.0, 2.0]);
    }

    #[test]
    fn zero_input_yields_bare_carrier() {
        let mut fm = FrequencyModulator::new(1.0, 0.5, 1_000.0);
        let mut frame = vec![0.0f32; 64];
        fm.process(&mut frame, RATE, 0.25);
        for (index, sample) in frame.iter().enumerate() {
            let t = 0.25 + index as f64 / RATE;
            let expected = 0.5 * (TAU * 1_000.0 * t).cos();
            assert!((*sample as f64 - expected).abs() < 1e-5);
        }
        assert_eq!(fm.last_phase(), 0.0);
    }

    #[test]
    fn split_frames_match_single_frame() {
        let input: Vec<f32> = (0..256).map(|i| ((i as f32) * 0.05).sin() * 300.0).collect();

        let mut whole = FrequencyModulator::new(1.5, 0.8, 700.0);
        let mut joined = input.clone();
        whole.process(&mut joined, RATE, 1.0);

        let mut split = FrequencyModulator::new(1.5, 0.8, 700.0);
        let (head, tail) = input.split_at(100);
        let mut first = head.to_vec();
        let mut second = tail.to_vec();
        split.process(&mut first, RATE, 1.0);
        split.process(&mut second, RATE, 1.0 + 100.0 / RATE);
        first.extend_from_slice(&second);

        assert_close(&joined, &first);
        assert!((whole.last_phase() - split.last_phase()).abs() < 1e-9);
    }

    #[test]
    fn constant_input_advances_phase_accumulator() {
        let mut fm = FrequencyModulator::new(1.0, 1.0, 0.0);
        let mut frame = vec![100.0f32; 120];
        fm.process(&mut frame, 1_200.0, 0.0);
        // 100 Hz for 0.1 s is ten full turns.
        assert!(fm.last_phase() < 1e-6 || (TAU - fm.last_phase()) < 1e-6);

        fm.reset();
        let mut half = vec![100.0f32; 6];
        fm.process(&mut half, 1_200.0, 0.0);
        assert!((fm.last_phase() - std::f64::consts::PI).abs() < 1e-9);
    }

    #[test]
    fn invalid_rate_yields_silence() {
        let mut fm = FrequencyModulator::new(1.0, 1.0, 440.0);
        let mut frame = vec![0.75f32; 8];
        fm.process(&mut frame, 0.0, 0.0);
        assert_eq!(frame, vec![0.0; 8]);
        let mut frame = vec![0.75f32; 8];
        fm.process(&mut frame, f64::NAN, 0.0);
        assert_eq!(frame, vec![0.0; 8]);
        assert_eq!(fm.last_phase(), 0.0);
    }

    #[test]
    fn empty_frame_keeps_state() {
        let mut fm = FrequencyModulator::new(1.0, 1.0, 440.0);
        let mut frame = vec![50.0f32; 10];
        fm.process(&mut frame, RATE, 0.0);
        let phase = fm.last_phase();
        fm.process(&mut [], RATE, 0.0);
        assert_eq!(fm.last_phase(), phase);
    }
}
