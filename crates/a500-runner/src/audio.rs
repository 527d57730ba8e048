//! Audio output: a cpal stream fed by a lock-free SPSC ring.
//!
//! The producer side lives on the UI thread, which forwards the per-frame
//! sample batches received from the emulation thread. The cpal callback
//! pops samples; underruns play silence, overruns drop the incoming
//! sample and are counted.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;

pub struct AudioOutput {
    _stream: Stream,
    producer: ringbuf::HeapProd<f32>,
    pub overruns: u64,
}

impl AudioOutput {
    /// Open the default output device. Returns `None` when no audio device
    /// is available; the emulator runs fine without one.
    pub fn new(sample_rate: u32) -> Option<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device()?;

        let config = StreamConfig {
            channels: 2,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Roughly a quarter second of buffering against scheduling jitter,
        // pre-filled halfway with silence so startup does not underrun.
        let ring = HeapRb::<f32>::new(sample_rate as usize / 2);
        let (mut producer, mut consumer) = ring.split();
        for _ in 0..sample_rate as usize / 4 {
            let _ = producer.try_push(0.0);
        }

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().unwrap_or(0.0);
                    }
                },
                |err| eprintln!("audio stream error: {err}"),
                None,
            )
            .ok()?;
        stream.play().ok()?;

        Some(Self {
            _stream: stream,
            producer,
            overruns: 0,
        })
    }

    /// Push one batch of interleaved stereo samples.
    pub fn push(&mut self, samples: &[f32]) {
        for &sample in samples {
            if self.producer.try_push(sample).is_err() {
                self.overruns += 1;
            }
        }
    }
}
