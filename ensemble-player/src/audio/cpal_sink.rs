//! cpal-backed local sink
//!
//! Builds an output stream on the default host, queues written packets in
//! a shared buffer the audio callback drains, and keeps a played-frame
//! counter so `pos()` reports the emitted-sample index in the stream
//! timeline.

use super::{LocalSink, SinkEventSender, SinkState};
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use ensemble_common::timing::SAMPLE_RATE;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// State shared with the audio callback thread.
struct Shared {
    /// Interleaved i16 samples waiting for the device
    queue: Mutex<VecDeque<i16>>,
    /// Stereo frames the callback has consumed since start
    played_frames: AtomicU64,
    /// Volume scale 0.0-1.0
    volume: Mutex<f32>,
    /// First-callback latch for the Running notification
    running_sent: AtomicBool,
}

pub struct CpalSink {
    device: Option<Device>,
    config: Option<(StreamConfig, SampleFormat)>,
    stream: Option<Stream>,
    shared: Arc<Shared>,
    events: SinkEventSender,
    /// Stream-timeline anchor for pos(), set at start
    pos_base: u64,
    device_name: Option<String>,
}

impl CpalSink {
    /// Create a sink targeting `device_name` (None = default device).
    ///
    /// Sink-initiated state changes are sent on `events`.
    pub fn new(device_name: Option<String>, events: SinkEventSender) -> Self {
        Self {
            device: None,
            config: None,
            stream: None,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                played_frames: AtomicU64::new(0),
                volume: Mutex::new(0.75),
                running_sent: AtomicBool::new(false),
            }),
            events,
            pos_base: 0,
            device_name,
        }
    }

    /// Pick the output device, falling back to the default on a miss.
    fn find_device(&self) -> Result<Device> {
        let host = cpal::default_host();

        if let Some(name) = self.device_name.as_ref() {
            let mut devices = host
                .output_devices()
                .map_err(|e| Error::LocalAudio(format!("failed to enumerate devices: {}", e)))?;

            if let Some(dev) = devices.find(|d| d.name().ok().as_ref() == Some(name)) {
                info!("Found requested audio device: {}", name);
                return Ok(dev);
            }

            warn!("Requested device '{}' not found, falling back to default", name);
        }

        host.default_output_device()
            .ok_or_else(|| Error::LocalAudio("no default output device".to_string()))
    }

    /// Prefer a 44.1 kHz stereo configuration matching the stream format.
    fn best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| Error::LocalAudio(format!("failed to get device configs: {}", e)))?;

        let preferred = configs.into_iter().find(|c| {
            c.channels() == 2
                && c.min_sample_rate().0 <= SAMPLE_RATE
                && c.max_sample_rate().0 >= SAMPLE_RATE
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        });

        if let Some(supported) = preferred {
            let sample_format = supported.sample_format();
            let config = supported
                .with_sample_rate(cpal::SampleRate(SAMPLE_RATE))
                .config();
            return Ok((config, sample_format));
        }

        let supported = device
            .default_output_config()
            .map_err(|e| Error::LocalAudio(format!("failed to get default config: {}", e)))?;

        Ok((supported.config(), supported.sample_format()))
    }

    fn build_stream(&self) -> Result<Stream> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::LocalAudio("sink not open".to_string()))?;
        let (config, sample_format) = self
            .config
            .clone()
            .ok_or_else(|| Error::LocalAudio("sink not open".to_string()))?;

        let stream = match sample_format {
            SampleFormat::F32 => self.build_stream_f32(device, &config)?,
            SampleFormat::I16 => self.build_stream_i16(device, &config)?,
            other => {
                return Err(Error::LocalAudio(format!(
                    "unsupported sample format: {:?}",
                    other
                )));
            }
        };

        Ok(stream)
    }

    fn build_stream_f32(&self, device: &Device, config: &StreamConfig) -> Result<Stream> {
        let channels = config.channels as usize;
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let err_events = self.events.clone();

        device
            .build_output_stream(
                config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !shared.running_sent.swap(true, Ordering::SeqCst) {
                        let _ = events.send(SinkState::Running);
                    }

                    let volume = *shared.volume.lock().unwrap();
                    let mut queue = shared.queue.lock().unwrap();
                    let mut consumed = 0u64;

                    for frame in data.chunks_mut(channels) {
                        let (l, r) = match (queue.pop_front(), queue.pop_front()) {
                            (Some(l), Some(r)) => {
                                consumed += 1;
                                (l, r)
                            }
                            // Underrun: emit silence, do not advance pos
                            _ => (0, 0),
                        };

                        frame[0] = (f32::from(l) / 32_768.0 * volume).clamp(-1.0, 1.0);
                        if channels > 1 {
                            frame[1] = (f32::from(r) / 32_768.0 * volume).clamp(-1.0, 1.0);
                        }
                    }

                    shared.played_frames.fetch_add(consumed, Ordering::SeqCst);
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    let _ = err_events.send(SinkState::Failed);
                },
                None,
            )
            .map_err(|e| Error::LocalAudio(format!("failed to build stream: {}", e)))
    }

    fn build_stream_i16(&self, device: &Device, config: &StreamConfig) -> Result<Stream> {
        let channels = config.channels as usize;
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let err_events = self.events.clone();

        device
            .build_output_stream(
                config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    if !shared.running_sent.swap(true, Ordering::SeqCst) {
                        let _ = events.send(SinkState::Running);
                    }

                    let volume = *shared.volume.lock().unwrap();
                    let mut queue = shared.queue.lock().unwrap();
                    let mut consumed = 0u64;

                    for frame in data.chunks_mut(channels) {
                        let (l, r) = match (queue.pop_front(), queue.pop_front()) {
                            (Some(l), Some(r)) => {
                                consumed += 1;
                                (l, r)
                            }
                            _ => (0, 0),
                        };

                        frame[0] = (f32::from(l) * volume) as i16;
                        if channels > 1 {
                            frame[1] = (f32::from(r) * volume) as i16;
                        }
                    }

                    shared.played_frames.fetch_add(consumed, Ordering::SeqCst);
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    let _ = err_events.send(SinkState::Failed);
                },
                None,
            )
            .map_err(|e| Error::LocalAudio(format!("failed to build stream: {}", e)))
    }
}

impl LocalSink for CpalSink {
    fn open(&mut self) -> Result<()> {
        let device = self.find_device()?;
        let config = Self::best_config(&device)?;

        debug!(
            "Audio config: rate={}, channels={}, format={:?}",
            config.0.sample_rate.0, config.0.channels, config.1
        );

        self.device = Some(device);
        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self, pb_pos: u64, next_rtptime: u64) -> Result<()> {
        self.pos_base = pb_pos;
        self.shared.played_frames.store(0, Ordering::SeqCst);
        self.shared.running_sent.store(false, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().clear();

        let stream = self.build_stream()?;
        stream
            .play()
            .map_err(|e| Error::LocalAudio(format!("failed to start stream: {}", e)))?;
        self.stream = Some(stream);

        debug!(
            "Local audio started: pos={}, first packet rtptime={}",
            pb_pos, next_rtptime
        );
        Ok(())
    }

    fn write(&mut self, pcm: &[u8], _rtptime: u64) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::LocalAudio("sink not started".to_string()));
        }

        let mut queue = self.shared.queue.lock().unwrap();
        for bytes in pcm.chunks_exact(2) {
            queue.push_back(i16::from_le_bytes([bytes[0], bytes[1]]));
        }
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                warn!("Failed to pause stream: {}", e);
            }
        }
        self.shared.queue.lock().unwrap().clear();
    }

    fn close(&mut self) {
        self.stop();
        self.device = None;
        self.config = None;
    }

    fn set_volume(&mut self, volume: u8) {
        let scale = f32::from(volume.min(100)) / 100.0;
        *self.shared.volume.lock().unwrap() = scale;
        debug!("Local volume set to {:.2}", scale);
    }

    fn pos(&self) -> u64 {
        self.pos_base + self.shared.played_frames.load(Ordering::SeqCst)
    }
}
