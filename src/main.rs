use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use ava_voice::voice::{
    AudioCapture, AudioFrame, AudioPlayback, HttpTts, PlaybackSink, TtsEngine,
};
use ava_voice::{Config, Daemon};

/// Ava - half-duplex voice assistant front-end
#[derive(Parser)]
#[command(name = "ava", version, about)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, env = "AVA_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the config file location
    ConfigPath,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info",
        1 => "info,ava_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.as_deref();

    // Handle subcommands
    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(config_path, duration).await,
            Command::TestSpeaker => test_speaker(config_path).await,
            Command::TestTts { text } => test_tts(config_path, &text).await,
            Command::ConfigPath => {
                config_path_cmd(config_path);
                Ok(())
            }
        };
    }

    let config = Config::load(config_path)?;
    tracing::debug!(path = ?config.config_path, "loaded configuration");

    let wake = config
        .tunables
        .policy
        .wake_phrases
        .first()
        .cloned()
        .unwrap_or_default();
    tracing::info!(
        backend = %config.backend.base_url,
        mode = ?config.tunables.policy.mode,
        "ava ready - say \"{wake}\""
    );

    // Run until interrupted
    Daemon::new(config).run().await?;

    Ok(())
}

/// Test microphone input
#[allow(clippy::future_not_send)]
async fn test_mic(config_path: Option<&Path>, duration: u64) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let audio = &config.tunables.audio;
    let echo = &config.tunables.echo;

    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::open(audio.capture_sample_rate, audio.chunk_frames)?;
    capture.start()?;

    println!("Sample rate: {} Hz", capture.sample_rate());
    println!(
        "Speech starts at RMS {:.0}, ends below {:.0}",
        echo.start_rms, echo.stop_rms
    );
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let frames = capture.frames();
        let samples: Vec<i16> = frames
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect();
        let rms = AudioFrame::new(samples.clone(), capture.sample_rate()).rms();
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (rms / 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let marker = if rms >= echo.start_rms { "speech" } else { "" };

        println!(
            "[{:2}s] RMS: {:6.0} | Peak: {:5} | [{}] {}",
            i + 1,
            rms,
            peak,
            meter,
            marker
        );
    }

    capture.stop();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");
    println!("  4. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Test speaker output with a sine wave
#[allow(clippy::future_not_send)]
async fn test_speaker(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let sample_rate = config.tunables.audio.playback_sample_rate;

    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = AudioPlayback::open(sample_rate)?;
    let queue = playback.queue();

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    queue.write(&AudioFrame::from_f32(&samples, sample_rate))?;
    wait_for_drain(&queue, Duration::from_secs(4)).await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");
    println!("  3. Try: pavucontrol (to check output levels)");

    Ok(())
}

/// Test TTS output through the configured provider
#[allow(clippy::future_not_send)]
async fn test_tts(config_path: Option<&Path>, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let config = Config::load(config_path)?;
    let tts = HttpTts::new(&config.tts, config.api_keys.for_tts(config.tts.provider))?;
    let playback = AudioPlayback::open(config.tunables.audio.playback_sample_rate)?;
    let queue = playback.queue();

    println!("Synthesizing speech with {}...", config.tts.model);
    let mut stream = tts.synthesize(text, queue.sample_rate()).await?;
    let mut total = Duration::ZERO;
    while let Some(frame) = stream.next().await {
        let frame = frame?;
        total += frame.duration();
        queue.write(&frame)?;
    }
    println!("Got {:.1}s of audio", total.as_secs_f32());

    println!("Playing audio...");
    wait_for_drain(&queue, total + Duration::from_secs(1)).await;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

/// Print where the config file is (or would be)
fn config_path_cmd(config_path: Option<&Path>) {
    let path = config_path
        .map(Path::to_path_buf)
        .or_else(ava_voice::config::file::config_file_path);
    match path {
        Some(path) if path.exists() => println!("{}", path.display()),
        Some(path) => println!("{} (not created yet)", path.display()),
        None => println!("no config directory available on this platform"),
    }
}

async fn wait_for_drain(queue: &impl PlaybackSink, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while queue.pending_samples() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the device flush its own buffer
    tokio::time::sleep(Duration::from_millis(200)).await;
}
