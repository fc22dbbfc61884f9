// Copyright (c) 2026 Jan Holthuis <jan.holthuis@rub.de>
//
// This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0. If a copy
// of the MPL was not distributed with this file, You can obtain one at
// http://mozilla.org/MPL/2.0/.
//
// SPDX-License-Identifier: MPL-2.0

//! Audio analysis.
//!
//! The library core only depends on the [`AudioAnalyzer`] trait and the
//! [`TrackProbe`] record it yields. The default implementation probes stream
//! parameters through [`lofty`] and, when a full check is requested, decodes
//! the stream with [`symphonia`] while feeding an EBU R 128 loudness
//! analysis.

use std::path::Path;
use thiserror::Error;

use lofty::AudioFile;
use lofty::TaggedFileExt;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use ebur128::{EbuR128, Mode};

/// ReplayGain 2.0 Reference Gain
///
/// See the [ReplayGain 2.0 specification][rg2spec] for details.
///
/// [rg2spec]: https://wiki.hydrogenaud.io/index.php?title=ReplayGain_2.0_specification#Reference_level
const REPLAYGAIN2_REFERENCE_LUFS: f64 = -18.0;

/// What the caller wants out of a probe.
#[derive(Debug, Clone, Copy)]
pub struct ProbeRequest {
    /// Decode the stream (required for any loudness work).
    pub decode: bool,
    /// Run the EBU R 128 loudness analysis.
    pub ebur128: bool,
    /// Also measure the loudness range.
    pub lra: bool,
}

impl ProbeRequest {
    /// Full verification: decode and measure loudness including range.
    #[must_use]
    pub fn full() -> Self {
        Self {
            decode: true,
            ebur128: true,
            lra: true,
        }
    }

    /// Header-only probe for files with a valid verification stamp.
    #[must_use]
    pub fn header_only() -> Self {
        Self {
            decode: false,
            ebur128: false,
            lra: false,
        }
    }
}

/// Stream parameters and loudness measurements of a single audio file.
///
/// The loudness fields are only populated when the probe decoded the
/// stream.
#[derive(Debug, Clone, Default)]
pub struct TrackProbe {
    /// Container/codec name (`mp3`, `vorbis`, `flac`, `wavpack`).
    pub format_name: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Bit rate in bits per second.
    pub bit_rate: u32,
    /// Bit depth; lossy codecs without a fixed depth report 16.
    pub bit_depth: u32,
    /// Duration in seconds, from the container header.
    pub duration_secs: f64,
    /// Absolute difference between header duration and decoded duration.
    pub duration_diff: f64,
    /// Total number of audio frames.
    pub total_frames: u64,
    /// ReplayGain 2.0 track gain in dB.
    pub rg2_gain: Option<f64>,
    /// Sample peak, linear scale.
    pub sample_peak: Option<f64>,
    /// EBU R 128 loudness range in LU.
    pub ebur128_lra: Option<f64>,
    /// EBU R 128 integrated loudness in LUFS.
    pub ebur128_iloud: Option<f64>,
    /// EBU R 128 relative threshold in LUFS.
    pub relative_threshold: Option<f64>,
}

/// Failure class of an analysis, used by the audio-file factory to decide
/// between corruption, lost loudness and a hard reject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerErrorKind {
    /// The codec failed while decoding; the stream is damaged.
    Codec,
    /// The loudness analysis failed; the stream itself decoded fine.
    EbuR128,
    /// The container could not be opened at all.
    Format,
}

/// An error during analysis.
#[derive(Error, Debug)]
#[error("{kind:?}: {message}")]
pub struct AnalyzerError {
    /// Failure class.
    kind: AnalyzerErrorKind,
    /// Human-readable description.
    message: String,
    /// Header-level probe data gathered before the failure, if any.
    partial: Option<Box<TrackProbe>>,
}

impl AnalyzerError {
    /// Create a codec failure, optionally carrying partial probe data.
    #[must_use]
    pub fn codec(message: impl Into<String>, partial: Option<TrackProbe>) -> Self {
        Self {
            kind: AnalyzerErrorKind::Codec,
            message: message.into(),
            partial: partial.map(Box::new),
        }
    }

    /// Create a loudness-analysis failure carrying the stream probe.
    #[must_use]
    pub fn ebur128(message: impl Into<String>, partial: Option<TrackProbe>) -> Self {
        Self {
            kind: AnalyzerErrorKind::EbuR128,
            message: message.into(),
            partial: partial.map(Box::new),
        }
    }

    /// Create a hard format failure.
    #[must_use]
    pub fn format(message: impl Into<String>) -> Self {
        Self {
            kind: AnalyzerErrorKind::Format,
            message: message.into(),
            partial: None,
        }
    }

    /// Failure class.
    #[must_use]
    pub fn kind(&self) -> AnalyzerErrorKind {
        self.kind
    }

    /// Take the partial probe data out of the error, if any.
    #[must_use]
    pub fn take_partial(&mut self) -> Option<TrackProbe> {
        self.partial.take().map(|probe| *probe)
    }
}

/// Probes audio files.
pub trait AudioAnalyzer: Send + Sync {
    /// Analyze the file at `path` according to `request`.
    fn analyze(&self, path: &Path, request: ProbeRequest) -> Result<TrackProbe, AnalyzerError>;
}

/// Audio reader.
struct AudioReader {
    /// Audio format reader.
    format: Box<dyn FormatReader>,
    /// Audio decoder.
    decoder: Box<dyn Decoder>,
    /// Track ID.
    track_id: u32,
}

impl AudioReader {
    /// Create an audio reader from the given path.
    fn new(path: &Path) -> Result<Self, SymphoniaError> {
        let src = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(src), MediaSourceStreamOptions::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let _ = hint.with_extension(ext);
        }

        let meta_opts: MetadataOptions = MetadataOptions::default();
        let fmt_opts: FormatOptions = FormatOptions::default();

        let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| SymphoniaError::Unsupported("no supported audio tracks"))?;
        let track_id = track.id;

        let dec_opts: DecoderOptions = DecoderOptions::default();
        let decoder = symphonia::default::get_codecs().make(&track.codec_params, &dec_opts)?;

        Ok(Self {
            format,
            decoder,
            track_id,
        })
    }

    /// Number of channels of the selected track.
    fn channel_count(&self) -> Option<usize> {
        self.format
            .tracks()
            .iter()
            .find(|track| track.id == self.track_id)
            .and_then(|track| track.codec_params.channels)
            .map(symphonia::core::audio::Channels::count)
    }

    /// Read the next packet(s) that belongs to the current track, decode it and return a reference
    /// to the decoded audio buffer.
    fn next_buffer(&mut self) -> Result<symphonia::core::audio::AudioBufferRef<'_>, SymphoniaError>
    {
        let packet = loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                err => break err,
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            break Ok(packet);
        };
        packet.and_then(|pkt| self.decoder.decode(&pkt))
    }
}

/// Map a lofty file type to the probe's codec name.
fn format_name(file_type: lofty::FileType) -> Option<&'static str> {
    match file_type {
        lofty::FileType::Mpeg => Some("mp3"),
        lofty::FileType::Vorbis => Some("vorbis"),
        lofty::FileType::Flac => Some("flac"),
        lofty::FileType::WavPack => Some("wavpack"),
        _ => None,
    }
}

/// Default analyzer backed by [`lofty`] (headers) and [`symphonia`] +
/// [`ebur128`] (decode and loudness).
#[derive(Debug, Clone, Copy, Default)]
pub struct SymphoniaAnalyzer;

impl SymphoniaAnalyzer {
    /// Probe the stream parameters from the container header.
    fn header_probe(path: &Path) -> Result<TrackProbe, AnalyzerError> {
        let tagged = lofty::read_from_path(path)
            .map_err(|err| AnalyzerError::format(format!("failed to open container: {err}")))?;
        let name = format_name(tagged.file_type())
            .ok_or_else(|| AnalyzerError::format("unsupported audio container"))?;

        let properties = tagged.properties();
        let sample_rate = properties.sample_rate().unwrap_or(0);
        let duration_secs = properties.duration().as_secs_f64();
        Ok(TrackProbe {
            format_name: name.to_string(),
            sample_rate,
            bit_rate: properties.audio_bitrate().unwrap_or(0) * 1000,
            bit_depth: properties.bit_depth().map_or(16, u32::from),
            duration_secs,
            duration_diff: 0.0,
            total_frames: (duration_secs * f64::from(sample_rate)).round() as u64,
            ..TrackProbe::default()
        })
    }

    /// Decode the stream, feeding the loudness analysis.
    fn decode_probe(
        path: &Path,
        request: ProbeRequest,
        mut probe: TrackProbe,
    ) -> Result<TrackProbe, AnalyzerError> {
        let codec_err =
            |message: String, partial: &TrackProbe| AnalyzerError::codec(message, Some(partial.clone()));

        let mut reader = AudioReader::new(path)
            .map_err(|err| codec_err(format!("failed to open stream: {err}"), &probe))?;
        let channels = reader
            .channel_count()
            .ok_or_else(|| codec_err("missing audio channels".to_string(), &probe))?;
        let channels_u32 = u32::try_from(channels)
            .map_err(|_| codec_err("missing audio channels".to_string(), &probe))?;

        let mut ebur = if request.ebur128 {
            let mode = if request.lra {
                Mode::all()
            } else {
                Mode::I | Mode::SAMPLE_PEAK
            };
            Some(
                EbuR128::new(channels_u32, probe.sample_rate, mode).map_err(|err| {
                    AnalyzerError::ebur128(
                        format!("failed to initialize loudness analysis: {err}"),
                        Some(probe.clone()),
                    )
                })?,
            )
        } else {
            None
        };
        // Feed roughly one second of interleaved samples at a time.
        let chunk_size = probe.sample_rate as usize * channels;

        let mut sample_buf: Option<SampleBuffer<i16>> = None;
        let mut frames_decoded: u64 = 0;
        loop {
            let audio_buf = match reader.next_buffer() {
                Ok(buffer) => buffer,
                Err(SymphoniaError::IoError(err))
                    if err.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(SymphoniaError::ResetRequired) => break,
                Err(err) => {
                    return Err(codec_err(format!("decode failed: {err}"), &probe));
                }
            };

            frames_decoded += audio_buf.frames() as u64;
            if sample_buf.is_none() {
                let spec = *audio_buf.spec();
                let duration = audio_buf.capacity() as u64;
                sample_buf = Some(SampleBuffer::<i16>::new(duration, spec));
            }

            if let (Some(buf), Some(ebur)) = (&mut sample_buf, &mut ebur) {
                buf.copy_interleaved_ref(audio_buf);
                let samples: Vec<f32> = buf
                    .samples()
                    .iter()
                    .map(|&sample| f32::from(sample) / f32::from(i16::MAX))
                    .collect();
                for chunk in samples.chunks(chunk_size.max(1)) {
                    ebur.add_frames_f32(chunk).map_err(|err| {
                        AnalyzerError::ebur128(
                            format!("loudness analysis failed: {err}"),
                            Some(probe.clone()),
                        )
                    })?;
                }
            }
        }

        if probe.sample_rate > 0 {
            let decoded_secs = frames_decoded as f64 / f64::from(probe.sample_rate);
            probe.duration_diff = (probe.duration_secs - decoded_secs).abs();
            if probe.duration_secs == 0.0 {
                probe.duration_secs = decoded_secs;
            }
        }
        probe.total_frames = frames_decoded;

        if let Some(ebur) = ebur {
            let ebur_err = |message: String, partial: &TrackProbe| {
                AnalyzerError::ebur128(message, Some(partial.clone()))
            };
            let iloud = ebur
                .loudness_global()
                .map_err(|err| ebur_err(format!("integrated loudness failed: {err}"), &probe))?;
            let peak = (0..channels_u32)
                .map(|channel_index| ebur.sample_peak(channel_index))
                .try_fold(0.0f64, |a, b| b.map(|b| a.max(b)))
                .map_err(|err| ebur_err(format!("sample peak failed: {err}"), &probe))?;
            probe.ebur128_iloud = Some(iloud);
            probe.sample_peak = Some(peak);
            probe.rg2_gain = Some(REPLAYGAIN2_REFERENCE_LUFS - iloud);
            probe.relative_threshold = ebur.relative_threshold().ok();
            if request.lra {
                probe.ebur128_lra = ebur.loudness_range().ok();
            }
        }

        Ok(probe)
    }
}

impl AudioAnalyzer for SymphoniaAnalyzer {
    fn analyze(&self, path: &Path, request: ProbeRequest) -> Result<TrackProbe, AnalyzerError> {
        log::debug!("Analyzing file: {}", path.display());
        let probe = Self::header_probe(path)?;
        if !request.decode {
            return Ok(probe);
        }
        Self::decode_probe(path, request, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_request_presets() {
        let full = ProbeRequest::full();
        assert!(full.decode && full.ebur128 && full.lra);
        let header = ProbeRequest::header_only();
        assert!(!header.decode && !header.ebur128 && !header.lra);
    }

    #[test]
    fn test_error_partial_roundtrip() {
        let probe = TrackProbe {
            format_name: "flac".to_string(),
            sample_rate: 44_100,
            ..TrackProbe::default()
        };
        let mut err = AnalyzerError::codec("broken stream", Some(probe));
        assert_eq!(err.kind(), AnalyzerErrorKind::Codec);
        let partial = err.take_partial().expect("partial probe");
        assert_eq!(partial.format_name, "flac");
        assert!(err.take_partial().is_none());
    }

    #[test]
    fn test_format_error_on_garbage() {
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).unwrap();
        let path = dir.path().join("noise.flac");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let err = SymphoniaAnalyzer
            .analyze(&path, ProbeRequest::header_only())
            .unwrap_err();
        assert_eq!(err.kind(), AnalyzerErrorKind::Format);
    }
}
