//! Sliding-window batching of samples into channel-major epochs.

use std::collections::VecDeque;

use futures::stream::{self, Stream, StreamExt};
use log::warn;

use crate::error::SdkResult;
use crate::protocol::{DEFAULT_SAMPLING_RATE, EPOCH_DURATION, EPOCH_INTERVAL};
use crate::types::{DeviceInfo, Epoch, EpochInfo, Sample};

/// Window parameters and the channel metadata stamped on every epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochOptions {
    /// Samples per epoch.
    pub duration: usize,
    /// Samples between the first sample of consecutive epochs.
    pub interval: usize,
    pub sampling_rate: f64,
    pub channel_names: Vec<String>,
}

impl Default for EpochOptions {
    fn default() -> Self {
        Self {
            duration: EPOCH_DURATION,
            interval: EPOCH_INTERVAL,
            sampling_rate: DEFAULT_SAMPLING_RATE,
            channel_names: Vec::new(),
        }
    }
}

impl EpochOptions {
    /// Options for a device, falling back to the hardware default sampling
    /// rate (with a warning) when the device did not report one.
    pub fn for_device(device: &DeviceInfo) -> Self {
        let sampling_rate = match device.sampling_rate {
            Some(rate) if rate > 0.0 => rate,
            _ => {
                warn!(
                    "device {} did not report a sampling rate, assuming {DEFAULT_SAMPLING_RATE} Hz",
                    device.device_id
                );
                DEFAULT_SAMPLING_RATE
            }
        };
        Self {
            sampling_rate,
            channel_names: device.channel_names.clone(),
            ..Self::default()
        }
    }
}

/// Stateful epoch builder.  Feed samples one at a time with [`push`].
///
/// With `interval == duration` windows are back to back; a smaller interval
/// makes them overlap.  An interval larger than the duration skips the
/// samples in between.
///
/// [`push`]: EpochBuilder::push
#[derive(Debug)]
pub struct EpochBuilder {
    options: EpochOptions,
    window: VecDeque<Sample>,
    /// Samples still to skip before the next window may start.
    skip: usize,
    /// Samples received since the last emission (or since the start).
    since_emit: usize,
    emitted_any: bool,
}

impl EpochBuilder {
    pub fn new(options: EpochOptions) -> Self {
        let options = EpochOptions {
            duration: options.duration.max(1),
            interval: options.interval.max(1),
            ..options
        };
        Self {
            window: VecDeque::with_capacity(options.duration),
            options,
            skip: 0,
            since_emit: 0,
            emitted_any: false,
        }
    }

    pub fn push(&mut self, sample: Sample) -> Option<Epoch> {
        if self.skip > 0 {
            self.skip -= 1;
            return None;
        }

        self.window.push_back(sample);
        if self.window.len() > self.options.duration {
            self.window.pop_front();
        }
        self.since_emit += 1;

        let ready = self.window.len() == self.options.duration
            && (!self.emitted_any
                || self.since_emit >= self.options.interval.min(self.options.duration));
        if !ready {
            return None;
        }

        let epoch = self.build();
        self.emitted_any = true;
        self.since_emit = 0;
        if self.options.interval > self.options.duration {
            self.skip = self.options.interval - self.options.duration;
            self.window.clear();
        }
        Some(epoch)
    }

    fn build(&self) -> Epoch {
        let first = self.window.front();
        let start_time = first.map(|s| s.timestamp).unwrap_or_default();
        let sampling_rate = first
            .and_then(|s| s.info.as_ref())
            .and_then(|i| i.sampling_rate)
            .unwrap_or(self.options.sampling_rate);

        let channels = self.window.iter().map(|s| s.data.len()).max().unwrap_or(0);
        let data = (0..channels)
            .map(|ch| {
                self.window
                    .iter()
                    .map(|s| s.data.get(ch).copied().unwrap_or(f64::NAN))
                    .collect()
            })
            .collect();

        Epoch {
            data,
            info: EpochInfo {
                sampling_rate,
                start_time,
                channel_names: self.options.channel_names.clone(),
                notch_frequency: None,
            },
        }
    }
}

/// Batch a fallible sample stream into epochs.  The first error is forwarded
/// and ends the stream.
pub fn epochs<S>(samples: S, options: EpochOptions) -> impl Stream<Item = SdkResult<Epoch>> + Send
where
    S: Stream<Item = SdkResult<Sample>> + Send,
{
    samples
        .scan((EpochBuilder::new(options), false), |(builder, failed), item| {
            if *failed {
                return futures::future::ready(None);
            }
            let out = match item {
                Ok(sample) => builder.push(sample).map(Ok),
                Err(e) => {
                    *failed = true;
                    Some(Err(e))
                }
            };
            futures::future::ready(Some(stream::iter(out)))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;
    use crate::types::SampleInfo;

    fn sample(i: usize, channels: usize) -> Sample {
        Sample {
            timestamp: 1_000 + i as u64,
            data: (0..channels).map(|c| (i * 10 + c) as f64).collect(),
            marker: None,
            info: None,
        }
    }

    fn options(duration: usize, interval: usize) -> EpochOptions {
        EpochOptions {
            duration,
            interval,
            sampling_rate: 256.0,
            channel_names: vec!["C3".into(), "C4".into()],
        }
    }

    #[test]
    fn thirty_two_samples_make_two_epochs() {
        let mut b = EpochBuilder::new(options(16, 16));
        let out: Vec<Epoch> = (0..32).filter_map(|i| b.push(sample(i, 2))).collect();
        assert_eq!(out.len(), 2);
        for (n, epoch) in out.iter().enumerate() {
            assert_eq!(epoch.data.len(), 2);
            assert_eq!(epoch.data[0].len(), 16);
            assert_eq!(epoch.info.start_time, 1_000 + 16 * n as u64);
            assert_eq!(epoch.info.sampling_rate, 256.0);
            assert_eq!(epoch.info.channel_names, vec!["C3", "C4"]);
        }
        assert_eq!(out[1].data[1][0], 16.0 * 10.0 + 1.0);
    }

    #[test]
    fn overlapping_windows() {
        let mut b = EpochBuilder::new(options(4, 2));
        let starts: Vec<u64> = (0..10)
            .filter_map(|i| b.push(sample(i, 1)))
            .map(|e| e.info.start_time)
            .collect();
        assert_eq!(starts, vec![1_000, 1_002, 1_004, 1_006]);
    }

    #[test]
    fn gapped_windows() {
        let mut b = EpochBuilder::new(options(2, 3));
        let starts: Vec<u64> = (0..9)
            .filter_map(|i| b.push(sample(i, 1)))
            .map(|e| e.info.start_time)
            .collect();
        assert_eq!(starts, vec![1_000, 1_003, 1_006]);
    }

    #[test]
    fn sample_rate_prefers_first_sample_info() {
        let mut b = EpochBuilder::new(options(2, 2));
        let mut first = sample(0, 1);
        first.info = Some(SampleInfo {
            sampling_rate: Some(500.0),
        });
        assert!(b.push(first).is_none());
        let epoch = b.push(sample(1, 1)).unwrap();
        assert_eq!(epoch.info.sampling_rate, 500.0);
    }

    #[test]
    fn device_without_rate_falls_back() {
        let device = DeviceInfo {
            device_id: "d".into(),
            channel_names: vec!["CP3".into()],
            ..Default::default()
        };
        let opts = EpochOptions::for_device(&device);
        assert_eq!(opts.sampling_rate, DEFAULT_SAMPLING_RATE);
        assert_eq!(opts.channel_names, vec!["CP3"]);
    }

    #[tokio::test]
    async fn stream_ends_after_first_error() {
        let items: Vec<SdkResult<Sample>> = vec![
            Ok(sample(0, 1)),
            Ok(sample(1, 1)),
            Err(SdkError::Framing {
                len: 3,
                sample_size: 18,
            }),
            Ok(sample(2, 1)),
            Ok(sample(3, 1)),
        ];
        let out: Vec<SdkResult<Epoch>> = epochs(stream::iter(items), options(2, 2)).collect().await;
        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
    }
}
