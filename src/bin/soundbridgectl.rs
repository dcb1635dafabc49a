use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;

use soundbridge::producer::{ProducerOptions, run_producer};
use soundbridge::{
    Bridge, BridgeStatus, ConverterType, CpalBackend, FrequencyModulator, OutputProcessor,
    PassThrough, RelayConfig, SampleSource, SilenceSource, SourceKind, ToneSource,
};

/// Relay a polled sample stream to the default audio output.
#[derive(Parser, Debug)]
#[command(name = "soundbridgectl", version)]
struct Cli {
    /// TOML file with relay parameters; flags override its values.
    #[arg(long, short = 'c', env = "SOUNDBRIDGE_CONFIG")]
    config: Option<PathBuf>,
    /// Producer sample rate (Hz).
    #[arg(long, short = 'r')]
    sample_rate: Option<f64>,
    /// Input gain.
    #[arg(long, short = 'g')]
    gain: Option<f32>,
    /// Output volume.
    #[arg(long, short = 'v')]
    volume: Option<f32>,
    /// FM carrier frequency (Hz).
    #[arg(long, short = 'f')]
    carrier_frequency: Option<f64>,
    /// Frequency-modulate onto the carrier.
    #[arg(long, short = 'm', overrides_with = "no_modulation")]
    modulation: bool,
    /// Pass samples through without modulation.
    #[arg(long)]
    no_modulation: bool,
    /// Subtract each block's mean before output.
    #[arg(long, overrides_with = "no_highpass")]
    highpass: bool,
    /// Leave the input unfiltered.
    #[arg(long)]
    no_highpass: bool,
    /// Producer poll window (ms).
    #[arg(long)]
    poll_ms: Option<u64>,
    /// Ring capacity (samples).
    #[arg(long)]
    capacity: Option<usize>,
    /// Rate converter: sinc-best, sinc-medium, sinc-fastest, linear, zero-order-hold.
    #[arg(long)]
    converter: Option<ConverterType>,
    /// Device sample rate (Hz); device default when omitted.
    #[arg(long)]
    output_sample_rate: Option<u32>,
    /// Synthetic producer: silence or tone.
    #[arg(long, short = 's')]
    source: Option<SourceKind>,
    /// Tone producer frequency (Hz).
    #[arg(long)]
    tone_frequency: Option<f64>,
    /// Print bridge diagnostics on exit.
    #[arg(long)]
    status: bool,
}

impl Cli {
    fn relay_config(&self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => RelayConfig::default(),
        };
        if let Some(v) = self.sample_rate {
            config.sample_rate = v;
        }
        if let Some(v) = self.gain {
            config.gain = v;
        }
        if let Some(v) = self.volume {
            config.volume = v;
        }
        if let Some(v) = self.carrier_frequency {
            config.carrier_frequency = v;
        }
        if self.modulation {
            config.modulation = true;
        }
        if self.no_modulation {
            config.modulation = false;
        }
        if self.highpass {
            config.highpass = true;
        }
        if self.no_highpass {
            config.highpass = false;
        }
        if let Some(v) = self.poll_ms {
            config.poll_ms = v;
        }
        if let Some(v) = self.capacity {
            config.capacity = v;
        }
        if let Some(v) = self.converter {
            config.converter = v;
        }
        if self.output_sample_rate.is_some() {
            config.output_sample_rate = self.output_sample_rate;
        }
        if let Some(v) = self.source {
            config.source = v;
        }
        if let Some(v) = self.tone_frequency {
            config.tone_frequency = v;
        }
        config.validate()?;
        Ok(config)
    }
}

fn print_parameters(config: &RelayConfig) {
    println!("Parameters:");
    let rows: [(&str, String); 9] = [
        ("Sample rate (Hz):", config.sample_rate.to_string()),
        ("Source:", config.source.to_string()),
        ("Input gain:", config.gain.to_string()),
        ("Volume:", config.volume.to_string()),
        ("FM carrier frequency (Hz):", config.carrier_frequency.to_string()),
        ("Perform frequency modulation?", config.modulation.to_string()),
        ("Filter input signal?", config.highpass.to_string()),
        ("Converter:", config.converter.to_string()),
        ("Ring capacity (samples):", config.capacity.to_string()),
    ];
    for (label, value) in rows {
        println!("  {label} {value}");
    }
}

fn print_status(status: &BridgeStatus) {
    println!("State        : {:?}", status.state);
    println!(
        "Rates        : {} Hz -> {} Hz (ratio {:.4})",
        status.input_sample_rate, status.output_sample_rate, status.ratio
    );
    println!(
        "Ring         : {}/{} samples, {} lost to overrun",
        status.available, status.capacity, status.overrun_samples
    );
    println!(
        "Callbacks    : {} rendered, {} padded ({} samples), {} silent",
        status.callbacks, status.padded_callbacks, status.padded_samples, status.silent_callbacks
    );
    println!(
        "Pulls        : {} placeholder, {} contended, {} resampler faults",
        status.placeholder_pulls, status.contended_pulls, status.resampler_faults
    );
    println!("Stream errors: {}", status.stream_errors);
}

fn build_processor(config: &RelayConfig) -> Box<dyn OutputProcessor> {
    if config.modulation {
        Box::new(FrequencyModulator::new(
            config.gain,
            config.volume,
            config.carrier_frequency,
        ))
    } else {
        Box::new(PassThrough::new(config.gain, config.volume))
    }
}

fn build_source(config: &RelayConfig) -> Box<dyn SampleSource> {
    match config.source {
        SourceKind::Silence => Box::new(SilenceSource::new(config.sample_rate)),
        SourceKind::Tone => Box::new(ToneSource::new(
            config.sample_rate,
            config.tone_frequency,
            1.0,
        )),
    }
}

fn is_stop_key(key: &KeyEvent) -> bool {
    if key.kind == KeyEventKind::Release {
        return false;
    }
    matches!(key.code, KeyCode::Esc | KeyCode::Char('q'))
        || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
}

fn wait_for_stop_key() -> io::Result<()> {
    enable_raw_mode()?;
    let outcome = (|| -> io::Result<()> {
        loop {
            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(key) = event::read()? {
                    if is_stop_key(&key) {
                        return Ok(());
                    }
                }
            }
        }
    })();
    disable_raw_mode()?;
    outcome
}

fn main() -> Result<()> {
    soundbridge::init_tracing();
    let cli = Cli::parse();
    let config = cli.relay_config()?;
    print_parameters(&config);
    println!();

    let backend = CpalBackend::default_device()?;
    let mut bridge = Bridge::new(&config.bridge_config(), backend)?;
    bridge.attach_processor(build_processor(&config));

    let sender = bridge.sender();
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    let mut source = build_source(&config);
    let options = ProducerOptions {
        poll: config.poll_interval(),
        highpass: config.highpass,
    };
    let producer = thread::Builder::new()
        .name("soundbridge-producer".into())
        .spawn(move || run_producer(source.as_mut(), &sender, options, &stop_rx))
        .context("spawning producer thread")?;

    println!("Playing back...  Press ESC to stop.");
    io::stdout().flush()?;
    let waited = bridge.run(|_| wait_for_stop_key())?;

    let _ = stop_tx.send(());
    let produced = producer
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;
    waited.context("reading keyboard")?;
    println!("Stopping.");
    info!(
        polls = produced.polls,
        samples = produced.samples,
        errors = produced.errors,
        "relay finished"
    );

    if cli.status {
        print_status(&bridge.status());
    }
    Ok(())
}
