//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ava_voice::config::EchoConfig;
use ava_voice::voice::{
    AudioFrame, EchoGate, MicAction, PlaybackQueue, PlaybackSink, TranscriptEvent,
    TranscriptFilter, pcm16_rms, samples_to_wav,
};
use ava_voice::Tunables;

const SAMPLE_RATE: u32 = 16_000;

/// Generate sine wave audio samples
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<f32> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

fn random_frame(rng: &mut StdRng) -> AudioFrame {
    let level: i16 = rng.gen_range(0..12_000);
    let samples = (0..320)
        .map(|_| rng.gen_range(-level..=level))
        .collect();
    AudioFrame::new(samples, SAMPLE_RATE)
}

#[test]
fn test_no_forwarding_while_playing_and_user_silent() {
    for seed in 0..32 {
        let mut rng = StdRng::seed_from_u64(seed);
        let gate = EchoGate::new(EchoConfig::default());
        let start = Instant::now();
        let mut playing = false;

        for i in 0..400 {
            let now = start + Duration::from_millis(20 * i);
            if rng.gen_bool(0.05) {
                playing = !playing;
                if playing {
                    gate.playback_started();
                } else {
                    gate.playback_finished_at(now);
                }
            }
            if playing {
                gate.observe_playback_frame(&random_frame(&mut rng));
            }

            let action = gate.process_mic_frame_at(&random_frame(&mut rng), now);
            let state = gate.snapshot();
            if state.tts_active && !state.user_speaking {
                assert_ne!(action, MicAction::Forward, "seed {seed} frame {i}");
            }
        }
    }
}

#[test]
fn test_loud_speech_during_playback_gets_through() {
    let gate = EchoGate::new(EchoConfig::default());
    let start = Instant::now();
    gate.playback_started();

    let echo = AudioFrame::new(vec![1_500; 320], SAMPLE_RATE);
    for _ in 0..10 {
        gate.observe_playback_frame(&echo);
    }
    let threshold = gate.playback_threshold();
    assert!(threshold > EchoConfig::default().start_rms);

    let voice = AudioFrame::from_f32(&generate_sine_samples(220.0, 0.02, 0.9), SAMPLE_RATE);
    assert!(voice.rms() > threshold);

    let mut forwarded = false;
    for i in 0..10 {
        let now = start + Duration::from_millis(20 * i);
        forwarded |= gate.process_mic_frame_at(&voice, now) == MicAction::Forward;
    }
    assert!(forwarded);
    assert!(gate.is_user_speaking());
}

#[test]
fn test_grace_period_after_playback() {
    let config = EchoConfig {
        keepalive_interval: None,
        ..EchoConfig::default()
    };
    let grace = config.post_speech_grace;
    let gate = EchoGate::new(config);
    let start = Instant::now();

    gate.playback_started();
    gate.playback_finished_at(start);

    let quiet_voice = AudioFrame::new(vec![900; 320], SAMPLE_RATE);
    assert_eq!(
        gate.process_mic_frame_at(&AudioFrame::silence(320, SAMPLE_RATE), start),
        MicAction::Drop
    );

    let after = start + grace + Duration::from_millis(1);
    assert_eq!(gate.process_mic_frame_at(&quiet_voice, after), MicAction::Forward);
}

#[test]
fn test_samples_to_wav() {
    let samples = AudioFrame::from_f32(&generate_sine_samples(440.0, 0.1, 0.5), SAMPLE_RATE);
    let wav_data = samples_to_wav(samples.samples(), SAMPLE_RATE).unwrap();

    // Check WAV header magic
    assert_eq!(&wav_data[0..4], b"RIFF");
    assert_eq!(&wav_data[8..12], b"WAVE");
    assert!(wav_data.len() > 44);

    let mut reader = hound::WavReader::new(Cursor::new(wav_data)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(spec.channels, 1);
    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read, samples.samples());
}

#[test]
fn test_pcm16_rms_edge_cases() {
    assert!(pcm16_rms(&[]).abs() < f32::EPSILON);
    assert!(pcm16_rms(&[0x10, 0x27, 0x05]).abs() < f32::EPSILON);

    let frame = AudioFrame::new(vec![-1000, 1000, -1000, 1000], SAMPLE_RATE);
    assert!((pcm16_rms(&frame.to_pcm_bytes()) - 1000.0).abs() < 0.01);

    let silence = AudioFrame::silence(160, SAMPLE_RATE);
    assert!(pcm16_rms(&silence.to_pcm_bytes()).abs() < f32::EPSILON);
}

#[test]
fn test_playback_queue_tracks_pending() {
    let queue = PlaybackQueue::new(24_000);
    let frame = AudioFrame::silence(480, 24_000);

    queue.write(&frame).unwrap();
    queue.write(&frame).unwrap();
    assert_eq!(queue.pending_samples(), 960);

    assert!(queue.write(&AudioFrame::silence(480, 16_000)).is_err());
    assert_eq!(queue.pending_samples(), 960);

    queue.clear();
    assert_eq!(queue.pending_samples(), 0);
}

#[test]
fn test_filter_passes_only_finals() {
    let mut filter = TranscriptFilter::new(Tunables::default().transcript);
    let start = Instant::now();

    for (i, word) in ["turn", "turn on", "turn on the", "turn on the lights"]
        .iter()
        .enumerate()
    {
        let now = start + Duration::from_millis(50 * i as u64);
        assert!(
            filter
                .accept_at(TranscriptEvent::partial(*word, "u1"), now)
                .is_none()
        );
    }

    let output = filter.accept_at(
        TranscriptEvent::final_result("turn on the lights", "u1").with_confidence(0.9),
        start + Duration::from_millis(300),
    );
    assert!(matches!(
        output,
        Some(ava_voice::voice::FilterOutput::Final(ref t)) if t.text() == "turn on the lights"
    ));
}
