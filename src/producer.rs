//! Sample producers feeding a bridge from their own polling loop.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use dasp_signal::{ConstHz, Signal, Sine};
use tracing::{debug, warn};

use crate::bridge::SampleSender;

/// Failures a producer may report for a single poll.
#[derive(thiserror::Error, Debug)]
pub enum ProducerError {
    /// Acquisition produced nothing within the poll window.
    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),
    /// Transport failure talking to the acquisition hardware.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// A source returning the samples covering each requested poll window.
pub trait SampleSource: Send {
    /// Block for roughly `poll` and return the samples it covered. May be empty.
    fn read(&mut self, poll: Duration) -> Result<Vec<f32>, ProducerError>;

    /// Nominal sample rate in Hertz.
    fn sample_rate(&self) -> f64;
}

/// Converts poll windows into whole sample counts, carrying the fractional remainder.
#[derive(Debug, Clone)]
struct SampleClock {
    sample_rate: f64,
    remainder: f64,
}

impl SampleClock {
    fn new(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            remainder: 0.0,
        }
    }

    fn samples_for(&mut self, poll: Duration) -> usize {
        let exact = poll.as_secs_f64() * self.sample_rate + self.remainder;
        // Absorb representation error so 0.05 s at 3600 Hz is 180 samples, not 179.
        let whole = (exact + 1e-9).floor();
        self.remainder = (exact - whole).max(0.0);
        whole as usize
    }
}

/// Stand-in used when no acquisition hardware is attached: zeros at the nominal rate.
pub struct SilenceSource {
    clock: SampleClock,
    pace: bool,
}

impl SilenceSource {
    /// Source sleeping for each poll window like a real device would.
    pub fn new(sample_rate: f64) -> Self {
        Self {
            clock: SampleClock::new(sample_rate),
            pace: true,
        }
    }

    /// Source returning immediately; for offline use.
    pub fn unpaced(sample_rate: f64) -> Self {
        Self {
            clock: SampleClock::new(sample_rate),
            pace: false,
        }
    }
}

impl SampleSource for SilenceSource {
    fn read(&mut self, poll: Duration) -> Result<Vec<f32>, ProducerError> {
        if self.pace {
            std::thread::sleep(poll);
        }
        Ok(vec![0.0; self.clock.samples_for(poll)])
    }

    fn sample_rate(&self) -> f64 {
        self.clock.sample_rate
    }
}

/// Synthetic sine producer.
pub struct ToneSource {
    signal: Sine<ConstHz>,
    amplitude: f32,
    clock: SampleClock,
    pace: bool,
}

impl ToneSource {
    /// Sine of `frequency` Hertz and peak `amplitude`, paced by the poll window.
    pub fn new(sample_rate: f64, frequency: f64, amplitude: f32) -> Self {
        Self {
            signal: dasp_signal::rate(sample_rate).const_hz(frequency).sine(),
            amplitude,
            clock: SampleClock::new(sample_rate),
            pace: true,
        }
    }

    /// Disable sleeping between polls.
    pub fn unpaced(mut self) -> Self {
        self.pace = false;
        self
    }
}

impl SampleSource for ToneSource {
    fn read(&mut self, poll: Duration) -> Result<Vec<f32>, ProducerError> {
        if self.pace {
            std::thread::sleep(poll);
        }
        let count = self.clock.samples_for(poll);
        Ok((0..count)
            .map(|_| self.signal.next() as f32 * self.amplitude)
            .collect())
    }

    fn sample_rate(&self) -> f64 {
        self.clock.sample_rate
    }
}

/// Subtract the block mean; a crude high-pass for drifting DC offsets.
pub fn remove_mean(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64;
    for sample in samples.iter_mut() {
        *sample -= mean as f32;
    }
}

/// Options for [`run_producer`].
#[derive(Debug, Clone, Copy)]
pub struct ProducerOptions {
    /// Poll window requested from the source.
    pub poll: Duration,
    /// Apply [`remove_mean`] to every block.
    pub highpass: bool,
}

/// Totals reported by [`run_producer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Successful polls.
    pub polls: u64,
    /// Samples pushed to the bridge.
    pub samples: u64,
    /// Polls that failed.
    pub errors: u64,
}

/// Poll `source` and push into `sender` until `stop` fires or disconnects.
///
/// Failed polls are logged and retried after one poll window; they never reach the ring.
pub fn run_producer(
    source: &mut dyn SampleSource,
    sender: &SampleSender,
    options: ProducerOptions,
    stop: &Receiver<()>,
) -> ProducerStats {
    let mut stats = ProducerStats::default();
    loop {
        match stop.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match source.read(options.poll) {
            Ok(mut samples) => {
                if options.highpass {
                    remove_mean(&mut samples);
                }
                sender.push(&samples);
                stats.polls += 1;
                stats.samples += samples.len() as u64;
            }
            Err(err) => {
                stats.errors += 1;
                warn!("producer poll failed: {err}");
                match stop.recv_timeout(options.poll) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
    debug!(
        polls = stats.polls,
        samples = stats.samples,
        errors = stats.errors,
        "producer stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_clock_carries_fractions() {
        let mut clock = SampleClock::new(5.0);
        let poll = Duration::from_millis(500);
        let counts: Vec<usize> = (0..4).map(|_| clock.samples_for(poll)).collect();
        assert_eq!(counts.iter().sum::<usize>(), 10);
        assert_eq!(counts, vec![2, 3, 2, 3]);
    }

    #[test]
    fn silence_matches_poll_window() {
        let mut source = SilenceSource::unpaced(3_600.0);
        let block = source.read(Duration::from_millis(50)).unwrap();
        assert_eq!(block.len(), 180);
        assert!(block.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn tone_is_continuous_across_polls() {
        let mut source = ToneSource::new(1_000.0, 10.0, 0.5).unpaced();
        let mut joined = source.read(Duration::from_millis(30)).unwrap();
        joined.extend(source.read(Duration::from_millis(70)).unwrap());
        assert_eq!(joined.len(), 100);
        for (index, sample) in joined.iter().enumerate() {
            let expected = 0.5 * (std::f64::consts::TAU * 10.0 * index as f64 / 1_000.0).sin();
            assert!((*sample as f64 - expected).abs() < 1e-5, "sample {index}");
        }
    }

    #[test]
    fn remove_mean_centres_block() {
        let mut block = vec![1.0, 2.0, 3.0, 6.0];
        remove_mean(&mut block);
        assert_eq!(block, vec![-2.0, -1.0, 0.0, 3.0]);
        remove_mean(&mut []);
    }
}
