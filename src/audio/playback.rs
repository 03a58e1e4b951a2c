//! Playback of synthesized speech.
//!
//! [`AudioSink`] is the orchestrator's single playback element: `play`
//! resolves once the clip has ended or playback failed. A failure is a
//! value, not an error, so the waiting turn always resumes.

use crate::config::AudioConfig;
use crate::error::{CompanionError, Result};
use crate::tts::AudioHandle;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// How a playback attempt finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Ended,
    /// Playback could not start or broke off; treated like `Ended`.
    Failed(String),
}

/// The single playback element.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `handle` to completion.
    async fn play(&self, handle: &AudioHandle) -> PlaybackOutcome;
}

/// Decoded mono PCM.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode an encoded clip (WAV, MP3, AAC, OGG) into mono f32 samples.
///
/// # Errors
///
/// Returns [`CompanionError::Resource`] if the data format cannot be detected or decoded.
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Result<DecodedAudio> {
    use symphonia::core::audio::SampleBuffer;
    use symphonia::core::codecs::DecoderOptions;
    use symphonia::core::errors::Error as SymphError;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let source = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(source), Default::default());

    let mut hint = Hint::new();
    if let Some(mime) = content_type {
        hint.mime_type(mime);
    }

    let detected = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| CompanionError::Resource(format!("failed to detect audio format: {e}")))?;

    let mut format = detected.format;
    let track = format
        .default_track()
        .ok_or_else(|| CompanionError::Resource("no default audio track".into()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| CompanionError::Resource("unknown sample rate".into()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| CompanionError::Resource(format!("failed to create decoder: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(CompanionError::Resource(format!("audio read error: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(CompanionError::Resource(format!("audio decode error: {e}"))),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let frames = decoded.frames() as u64;
        let required = usize::try_from(frames).unwrap_or(usize::MAX).saturating_mul(channels);
        if sample_buf.as_ref().is_none_or(|b| b.capacity() < required) {
            sample_buf = Some(SampleBuffer::<f32>::new(frames, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.copy_interleaved_ref(decoded);

        if channels == 1 {
            samples.extend_from_slice(buf.samples());
        } else {
            for frame in buf.samples().chunks_exact(channels) {
                samples.push(frame.iter().sum::<f32>() / channels as f32);
            }
        }
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

/// Speaker output via `cpal`.
pub struct CpalAudioSink {
    config: AudioConfig,
}

impl CpalAudioSink {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    fn output_device(&self) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let device = if let Some(ref name) = self.config.output_device {
            host.output_devices()
                .map_err(|e| CompanionError::Resource(format!("cannot enumerate devices: {e}")))?
                .find(|d| {
                    d.description()
                        .ok()
                        .map(|desc| desc.name() == name)
                        .unwrap_or(false)
                })
                .ok_or_else(|| CompanionError::Resource(format!("output device '{name}' not found")))?
        } else {
            host.default_output_device()
                .ok_or_else(|| CompanionError::Resource("no default output device".into()))?
        };
        Ok(device)
    }

    /// Blocking playback of decoded samples.
    fn play_blocking(&self, audio: DecodedAudio) -> Result<()> {
        let device = self.output_device()?;
        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!("playing {} samples on {device_name}", audio.samples.len());

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: audio.sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let volume = self.config.volume;
        let state = Arc::new(Mutex::new(PlaybackBuffer {
            samples: audio.samples,
            position: 0,
            finished: false,
            failed: None,
        }));
        let data_state = Arc::clone(&state);
        let error_state = Arc::clone(&state);

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    let Ok(mut buf) = data_state.lock() else {
                        return;
                    };
                    for sample in data.iter_mut() {
                        if buf.position < buf.samples.len() {
                            *sample = buf.samples[buf.position] * volume;
                            buf.position += 1;
                        } else {
                            *sample = 0.0;
                            buf.finished = true;
                        }
                    }
                },
                move |err| {
                    error!("audio output stream error: {err}");
                    if let Ok(mut buf) = error_state.lock() {
                        buf.failed = Some(err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| CompanionError::Resource(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| CompanionError::Resource(format!("failed to start output stream: {e}")))?;

        loop {
            std::thread::sleep(Duration::from_millis(10));
            let buf = state
                .lock()
                .map_err(|e| CompanionError::Resource(format!("playback buffer lock poisoned: {e}")))?;
            if let Some(reason) = &buf.failed {
                return Err(CompanionError::Resource(reason.clone()));
            }
            if buf.finished {
                break;
            }
        }

        drop(stream);
        Ok(())
    }
}

#[async_trait]
impl AudioSink for CpalAudioSink {
    async fn play(&self, handle: &AudioHandle) -> PlaybackOutcome {
        let audio = match decode(&handle.bytes, handle.content_type.as_deref()) {
            Ok(audio) => audio,
            Err(e) => {
                warn!("cannot play audio handle {}: {e}", handle.id);
                return PlaybackOutcome::Failed(e.to_string());
            }
        };

        let sink = Self::new(self.config.clone());
        match tokio::task::spawn_blocking(move || sink.play_blocking(audio)).await {
            Ok(Ok(())) => PlaybackOutcome::Ended,
            Ok(Err(e)) => {
                warn!("playback failed: {e}");
                PlaybackOutcome::Failed(e.to_string())
            }
            Err(e) => {
                warn!("playback task aborted: {e}");
                PlaybackOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Shared playback progress.
struct PlaybackBuffer {
    samples: Vec<f32>,
    position: usize,
    finished: bool,
    failed: Option<String>,
}

/// List available output devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| CompanionError::Resource(format!("cannot enumerate devices: {e}")))?;
    Ok(devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
        .collect())
}
