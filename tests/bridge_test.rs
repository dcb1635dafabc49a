use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;

use soundbridge::producer::{ProducerOptions, run_producer};
use soundbridge::{
    Bridge, BridgeConfig, BridgeState, ConverterType, FrequencyModulator, ManualBackend,
    OutputProcessor, PassThrough, ProducerError, Renderer, Resample, SampleSource, ToneSource,
};

const OUTPUT_RATE: u32 = 8_000;

fn manual_bridge(input_rate: f64) -> (Bridge<ManualBackend>, ManualBackend) {
    let backend = ManualBackend::new(OUTPUT_RATE);
    let config = BridgeConfig::new(input_rate)
        .with_capacity(1_024)
        .with_converter(ConverterType::Linear)
        .with_chunk_frames(64);
    let bridge = Bridge::new(&config, backend.clone()).expect("bridge");
    (bridge, backend)
}

/// Supplies `limit` samples of 0.25 per read, then stops short.
struct Partial {
    limit: usize,
}

impl Resample for Partial {
    fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.limit.min(out.len());
        out[..n].fill(0.25);
        n
    }

    fn ratio(&self) -> f64 {
        1.0
    }
}

/// Doubles every sample so padding stays visibly zero.
struct Doubler;

impl OutputProcessor for Doubler {
    fn process(&mut self, frame: &mut [f32], _sample_rate: f64, _timebase: f64) {
        for sample in frame.iter_mut() {
            *sample *= 2.0;
        }
    }

    fn name(&self) -> &'static str {
        "doubler"
    }
}

#[test]
fn short_pull_is_padded_with_zeros() {
    let mut renderer = Renderer::new(Box::new(Partial { limit: 6 }), OUTPUT_RATE as f64);
    renderer.set_processor(Box::new(Doubler));

    let mut frame = vec![7.0f32; 10];
    renderer.render(&mut frame, 0.0);
    assert_eq!(frame.len(), 10);
    assert_eq!(&frame[..6], &[0.5; 6]);
    assert_eq!(&frame[6..], &[0.0; 4]);
}

#[test]
fn empty_bridge_renders_silence() {
    let (mut bridge, backend) = manual_bridge(4_000.0);
    let frames = bridge
        .run(|_| backend.render_blocks(128, 3, 0.0))
        .expect("run");
    assert_eq!(frames, vec![0.0; 384]);
    let status = bridge.status();
    assert_eq!(status.state, BridgeState::Idle);
    assert!(status.placeholder_pulls > 0);
    assert_eq!(status.callbacks, 3);
}

#[test]
fn frequency_modulation_is_continuous_across_callbacks() {
    let (mut bridge, backend) = manual_bridge(OUTPUT_RATE as f64);
    bridge.attach_processor(Box::new(FrequencyModulator::new(1.0, 1.0, 440.0)));

    let through_bridge = bridge
        .run(|bridge| {
            bridge.push_samples(&[0.0; 600]);
            backend.render_blocks(100, 5, 0.0)
        })
        .expect("run");

    let mut reference = FrequencyModulator::new(1.0, 1.0, 440.0);
    let mut whole = vec![0.0f32; 500];
    reference.process(&mut whole, OUTPUT_RATE as f64, 0.0);

    assert_eq!(through_bridge.len(), whole.len());
    for (index, (a, b)) in through_bridge.iter().zip(&whole).enumerate() {
        assert!((a - b).abs() < 1e-4, "sample {index}: {a} vs {b}");
    }
}

#[test]
fn processor_swap_takes_effect_on_next_frame() {
    let (mut bridge, backend) = manual_bridge(OUTPUT_RATE as f64);
    bridge.start().expect("start");

    bridge.attach_processor(Box::new(PassThrough::new(1.0, 0.0)));
    bridge.push_samples(&[0.5; 256]);
    let muted = backend.render(64, 0.0).expect("render");
    assert!(muted.iter().all(|&s| s == 0.0));
    assert_eq!(bridge.processor_name(), "pass-through");

    bridge.attach_processor(Box::new(FrequencyModulator::default()));
    backend.render(64, 0.008).expect("render");
    assert_eq!(bridge.processor_name(), "frequency-modulator");
    bridge.stop().expect("stop");
}

#[test]
fn dropping_the_bridge_closes_the_stream() {
    let (mut bridge, backend) = manual_bridge(OUTPUT_RATE as f64);
    bridge.start().expect("start");
    assert!(backend.is_playing());
    drop(bridge);
    assert!(!backend.is_playing());
    assert!(backend.render(16, 0.0).is_none());
}

/// Yields fixed blocks, fails once, and asks the loop to stop after `stop_after` reads.
struct Scripted {
    reads: usize,
    stop_after: usize,
    fail_on: usize,
    stop: Sender<()>,
}

impl SampleSource for Scripted {
    fn read(&mut self, _poll: Duration) -> Result<Vec<f32>, ProducerError> {
        self.reads += 1;
        if self.reads == self.stop_after {
            let _ = self.stop.send(());
        }
        if self.reads == self.fail_on {
            return Err(ProducerError::Other("sensor offline".into()));
        }
        Ok(vec![1.0, 2.0, 3.0, 6.0])
    }

    fn sample_rate(&self) -> f64 {
        800.0
    }
}

#[test]
fn producer_loop_pushes_until_stopped() {
    let (bridge, _backend) = manual_bridge(800.0);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let mut source = Scripted {
        reads: 0,
        stop_after: 4,
        fail_on: 2,
        stop: stop_tx,
    };
    let options = ProducerOptions {
        poll: Duration::from_millis(1),
        highpass: true,
    };

    let stats = run_producer(&mut source, &bridge.sender(), options, &stop_rx);
    assert_eq!(stats.polls, 3);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.samples, 12);

    let status = bridge.status();
    assert_eq!(status.available, 12);
}

#[test]
fn producer_thread_feeds_running_bridge() {
    let (mut bridge, backend) = manual_bridge(4_000.0);
    let sender = bridge.sender();
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let pushed = Arc::new(AtomicU64::new(0));
    let pushed_in_thread = Arc::clone(&pushed);

    bridge.start().expect("start");
    let producer = thread::spawn(move || {
        let mut source = ToneSource::new(4_000.0, 100.0, 0.5).unpaced();
        let options = ProducerOptions {
            poll: Duration::from_millis(5),
            highpass: false,
        };
        let stats = run_producer(&mut source, &sender, options, &stop_rx);
        pushed_in_thread.store(stats.samples, Ordering::Relaxed);
    });

    let mut rendered = 0;
    for block in 0..20 {
        let timebase = (block * 160) as f64 / OUTPUT_RATE as f64;
        if let Some(frame) = backend.render(160, timebase) {
            assert_eq!(frame.len(), 160);
            assert!(frame.iter().all(|s| s.abs() <= 0.6));
            rendered += 1;
        }
        thread::sleep(Duration::from_millis(1));
    }
    stop_tx.send(()).expect("stop signal");
    producer.join().expect("producer thread");
    bridge.stop().expect("stop");

    assert_eq!(rendered, 20);
    assert!(pushed.load(Ordering::Relaxed) > 0);
}
