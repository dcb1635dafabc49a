#![deny(missing_docs)]

//! Rate-decoupling bridge from a bursty sample producer to a real-time audio output.
//!
//! A producer pushes scalar samples at its own irregular cadence into a [`RingBuffer`]. The
//! audio driver pulls fixed-size frames on its own clock; each pull drains the ring through a
//! [`StreamingResampler`], zero-pads short frames, runs the active [`OutputProcessor`] and
//! hands the result to the device. The [`Bridge`] owns all of these and the output stream.
//!
//! ```no_run
//! # #[cfg(feature = "cpal")]
//! # fn demo() -> Result<(), soundbridge::BridgeError> {
//! use soundbridge::{Bridge, BridgeConfig, CpalBackend, FrequencyModulator};
//!
//! let backend = CpalBackend::default_device()?;
//! let mut bridge = Bridge::new(&BridgeConfig::new(3_600.0), backend)?;
//! bridge.attach_processor(Box::new(FrequencyModulator::new(1.0, 0.1, 500.0)));
//! bridge.run(|bridge| {
//!     for _ in 0..100 {
//!         bridge.push_samples(&[0.0; 180]);
//!         std::thread::sleep(std::time::Duration::from_millis(50));
//!     }
//! })?;
//! # Ok(())
//! # }
//! ```

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod bridge;
pub mod config;
pub mod device;
pub mod processor;
pub mod producer;
pub mod resample;
pub mod ring;


pub use bridge::{ActiveBridge, Bridge, BridgeState, BridgeStatus, Renderer, SampleSender};
pub use config::{BridgeConfig, ConfigError, RelayConfig, SourceKind};
#[cfg(feature = "cpal")]
pub use device::CpalBackend;
pub use device::{ManualBackend, OutputBackend, OutputStream, RenderCallback};
pub use processor::{FrequencyModulator, OutputProcessor, PassThrough};
pub use producer::{ProducerError, SampleSource, SilenceSource, ToneSource};
pub use resample::{ConverterType, PullSource, Resample, RingPull, StreamingResampler};
pub use ring::{RingBuffer, RingError, SharedRing};

static TRACING_INIT: Once = Once::new();

/// Install the global `tracing` subscriber once, honouring `RUST_LOG` (default `info`).
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Error enumeration for bridge construction and stream control.
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// `start` was called while the output stream was already running.
    #[error("output stream already running")]
    AlreadyRunning,
    /// Ring capacity must be at least one sample.
    #[error("invalid ring capacity {0}, must be positive")]
    InvalidCapacity(usize),
    /// Sample rates must be finite and positive.
    #[error("invalid sample rate {0} Hz, must be positive")]
    InvalidSampleRate(f64),
    /// Resampler output chunk must be at least one frame.
    #[error("invalid resampler chunk of {0} frames, must be positive")]
    InvalidChunkFrames(usize),
    /// The rate converter could not be built or failed.
    #[error("resampler: {0}")]
    Resampler(String),
    /// The audio device rejected a request.
    #[error("audio device: {0}")]
    Device(String),
    /// No default output device is available on this host.
    #[error("no default output device")]
    NoOutputDevice,
}
