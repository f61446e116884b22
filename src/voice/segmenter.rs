//! Utterance segmentation
//!
//! Turns a live stream of audio frames into discrete utterances using a
//! short-term energy VAD. One segmenter per connection.
//!
//! ```text
//! Idle --(trigger_voiced_frames voiced)--> Voiced --(unvoiced)--> TrailingSilence
//!  ^                                         ^                        |
//!  |                                         +-------(voiced)---------+
//!  +---------------(end_silence_ms of silence, or max_utterance_ms)---+
//! ```
//!
//! An utterance cut at `max_utterance_ms` may be followed by more speech or
//! by silence. In the silent case, once `end_silence_ms` passes the
//! segmenter reports [`Segment::SpeechEnded`] so the caller can close the turn.

use super::audio::{PcmDecoder, calculate_rms, samples_to_wav};
use crate::Result;
use crate::config::VadConfig;

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// Waiting for speech
    Idle,
    /// Accumulating an utterance
    Voiced,
    /// Speech paused; the utterance closes if silence lasts long enough
    TrailingSilence,
}

/// A detected span of speech, handed off by value to transcription
#[derive(Debug, Clone)]
pub struct UtteranceBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Offset of the first sample from the start of the connection's audio
    pub start_ms: u64,
    /// Offset just past the last sample
    pub end_ms: u64,
    /// RMS of every frame in the utterance
    pub energy_trace: Vec<f32>,
    /// Closed by the length cap while speech was still going on
    pub forced: bool,
}

impl UtteranceBuffer {
    /// Length of the audio in seconds
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Loudest frame energy in the utterance
    #[must_use]
    pub fn peak_rms(&self) -> f32 {
        self.energy_trace.iter().copied().fold(0.0, f32::max)
    }

    /// Encode as 16-bit mono WAV for transcription engines
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        samples_to_wav(&self.samples, self.sample_rate)
    }
}

/// Why a closed utterance was dropped instead of forwarded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscardReason {
    TooShort { duration_secs: f32 },
    TooQuiet { peak_rms: f32 },
}

/// Outcome of closing an utterance
#[derive(Debug)]
pub enum Segment {
    Utterance(UtteranceBuffer),
    Discarded(DiscardReason),
    /// The speaker fell silent right after a length cut, with no
    /// continuation to close the turn
    SpeechEnded,
}

impl Segment {
    /// The utterance, if it passed the noise filter
    #[must_use]
    pub fn into_utterance(self) -> Option<UtteranceBuffer> {
        match self {
            Self::Utterance(u) => Some(u),
            Self::Discarded(_) | Self::SpeechEnded => None,
        }
    }
}

/// Per-connection VAD state machine
#[derive(Debug)]
pub struct UtteranceSegmenter {
    config: VadConfig,
    state: VadState,

    /// Voiced frames seen while idle, promoted once the trigger count is hit
    candidate: Vec<f32>,
    candidate_trace: Vec<f32>,
    consecutive_voiced: u32,

    utterance: Vec<f32>,
    utterance_trace: Vec<f32>,
    utterance_start: u64,

    /// Silence after speech, restored into the utterance if speech resumes
    tail: Vec<f32>,
    tail_trace: Vec<f32>,

    /// The last utterance was cut at the length cap
    after_cut: bool,
    /// Unvoiced samples seen while idle since that cut
    idle_silence: usize,

    /// Samples consumed since the connection opened
    clock: u64,

    decoder: PcmDecoder,
    pending: Vec<f32>,
}

impl UtteranceSegmenter {
    #[must_use]
    pub fn new(config: VadConfig) -> Self {
        tracing::debug!(
            frame_ms = config.frame_ms,
            trigger = config.trigger_voiced_frames,
            end_silence_ms = config.end_silence_ms,
            max_utterance_ms = config.max_utterance_ms,
            "segmenter initialized"
        );

        Self {
            config,
            state: VadState::Idle,
            candidate: Vec::new(),
            candidate_trace: Vec::new(),
            consecutive_voiced: 0,
            utterance: Vec::new(),
            utterance_trace: Vec::new(),
            utterance_start: 0,
            tail: Vec::new(),
            tail_trace: Vec::new(),
            after_cut: false,
            idle_silence: 0,
            clock: 0,
            decoder: PcmDecoder::new(),
            pending: Vec::new(),
        }
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> VadState {
        self.state
    }

    /// Feed raw little-endian 16-bit PCM of any length
    ///
    /// Bytes are assembled into fixed-size frames; leftovers wait for the
    /// next call.
    pub fn push_pcm(&mut self, bytes: &[u8]) -> Vec<Segment> {
        let mut pending = std::mem::take(&mut self.pending);
        self.decoder.decode_into(bytes, &mut pending);

        let frame_len = self.config.frame_samples().max(1);
        let mut segments = Vec::new();

        let mut frames = pending.chunks_exact(frame_len);
        for frame in frames.by_ref() {
            segments.extend(self.push_frame(frame));
        }
        self.pending = frames.remainder().to_vec();

        segments
    }

    /// Score one frame by energy and advance the state machine
    pub fn push_frame(&mut self, frame: &[f32]) -> Option<Segment> {
        let rms = calculate_rms(frame);
        let voiced = rms > self.config.voice_threshold;
        self.advance(frame, rms, voiced)
    }

    /// Advance with an externally supplied voice decision
    pub fn push_frame_with_decision(&mut self, frame: &[f32], voiced: bool) -> Option<Segment> {
        let rms = calculate_rms(frame);
        self.advance(frame, rms, voiced)
    }

    /// Close any open utterance, as if the speaker fell silent
    pub fn flush(&mut self) -> Option<Segment> {
        self.pending.clear();
        match self.state {
            VadState::Idle => {
                self.reset_candidate();
                self.end_after_cut()
            }
            VadState::Voiced | VadState::TrailingSilence => Some(self.emit(false)),
        }
    }

    /// Drop all buffered audio and return to idle
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.reset_candidate();
        self.utterance.clear();
        self.utterance_trace.clear();
        self.tail.clear();
        self.tail_trace.clear();
        self.pending.clear();
        self.after_cut = false;
        self.idle_silence = 0;
    }

    fn advance(&mut self, frame: &[f32], rms: f32, voiced: bool) -> Option<Segment> {
        let frame_start = self.clock;
        self.clock += frame.len() as u64;

        match self.state {
            VadState::Idle => {
                if !voiced {
                    self.reset_candidate();
                    if self.after_cut {
                        self.idle_silence += frame.len();
                        if self.idle_silence >= self.ms_to_samples(self.config.end_silence_ms) {
                            return self.end_after_cut();
                        }
                    }
                    return None;
                }
                self.idle_silence = 0;

                if self.candidate.is_empty() {
                    self.utterance_start = frame_start;
                }
                self.candidate.extend_from_slice(frame);
                self.candidate_trace.push(rms);
                self.consecutive_voiced += 1;

                if self.consecutive_voiced >= self.config.trigger_voiced_frames {
                    self.utterance = std::mem::take(&mut self.candidate);
                    self.utterance_trace = std::mem::take(&mut self.candidate_trace);
                    self.consecutive_voiced = 0;
                    self.state = VadState::Voiced;
                    tracing::trace!(rms, start_ms = self.to_ms(self.utterance_start), "speech started");
                }
            }
            VadState::Voiced => {
                if voiced {
                    self.utterance.extend_from_slice(frame);
                    self.utterance_trace.push(rms);
                } else {
                    self.tail.extend_from_slice(frame);
                    self.tail_trace.push(rms);
                    self.state = VadState::TrailingSilence;
                }
            }
            VadState::TrailingSilence => {
                if voiced {
                    // Speech resumed: the pause becomes part of the utterance
                    self.utterance.append(&mut self.tail);
                    self.utterance_trace.append(&mut self.tail_trace);
                    self.utterance.extend_from_slice(frame);
                    self.utterance_trace.push(rms);
                    self.state = VadState::Voiced;
                } else {
                    self.tail.extend_from_slice(frame);
                    self.tail_trace.push(rms);
                }
            }
        }

        if self.state == VadState::TrailingSilence
            && self.tail.len() >= self.ms_to_samples(self.config.end_silence_ms)
        {
            return Some(self.emit(false));
        }

        if self.state != VadState::Idle
            && self.utterance.len() + self.tail.len()
                >= self.ms_to_samples(self.config.max_utterance_ms)
        {
            return Some(self.emit(true));
        }

        None
    }

    /// Close the open utterance and apply the noise filter
    ///
    /// Trailing silence is dropped. Buffers are cleared either way.
    fn emit(&mut self, forced: bool) -> Segment {
        let samples = std::mem::take(&mut self.utterance);
        let energy_trace = std::mem::take(&mut self.utterance_trace);
        self.tail.clear();
        self.tail_trace.clear();
        self.reset_candidate();
        self.state = VadState::Idle;
        self.after_cut = forced;
        self.idle_silence = 0;

        let start = self.utterance_start;
        let end = start + samples.len() as u64;
        let utterance = UtteranceBuffer {
            samples,
            sample_rate: self.config.sample_rate,
            start_ms: self.to_ms(start),
            end_ms: self.to_ms(end),
            energy_trace,
            forced,
        };

        let duration_secs = utterance.duration_secs();
        if duration_secs < self.config.min_utterance_sec {
            tracing::debug!(duration_secs, "utterance too short, discarded");
            return Segment::Discarded(DiscardReason::TooShort { duration_secs });
        }

        let peak_rms = utterance.peak_rms();
        if peak_rms < self.config.min_rms {
            tracing::debug!(peak_rms, "utterance too quiet, discarded");
            return Segment::Discarded(DiscardReason::TooQuiet { peak_rms });
        }

        tracing::debug!(
            start_ms = utterance.start_ms,
            end_ms = utterance.end_ms,
            duration_secs,
            peak_rms,
            forced,
            "utterance complete"
        );
        Segment::Utterance(utterance)
    }

    fn end_after_cut(&mut self) -> Option<Segment> {
        if !std::mem::take(&mut self.after_cut) {
            return None;
        }
        self.idle_silence = 0;
        tracing::trace!(at_ms = self.to_ms(self.clock), "speech ended after length cut");
        Some(Segment::SpeechEnded)
    }

    fn reset_candidate(&mut self) {
        self.candidate.clear();
        self.candidate_trace.clear();
        self.consecutive_voiced = 0;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ms_to_samples(&self, ms: u32) -> usize {
        (u64::from(self.config.sample_rate) * u64::from(ms) / 1000) as usize
    }

    fn to_ms(&self, samples: u64) -> u64 {
        if self.config.sample_rate == 0 {
            return 0;
        }
        samples * 1000 / u64::from(self.config.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VadConfig {
        VadConfig::default()
    }

    fn frame(amplitude: f32) -> Vec<f32> {
        vec![amplitude; config().frame_samples()]
    }

    fn feed(seg: &mut UtteranceSegmenter, amplitude: f32, frames: usize) -> Vec<Segment> {
        let f = frame(amplitude);
        (0..frames).filter_map(|_| seg.push_frame(&f)).collect()
    }

    #[test]
    fn single_voiced_frame_never_triggers() {
        let mut seg = UtteranceSegmenter::new(config());
        assert!(feed(&mut seg, 0.2, 1).is_empty());
        assert!(feed(&mut seg, 0.0, 50).is_empty());
        assert_eq!(seg.state(), VadState::Idle);
    }

    #[test]
    fn silence_just_under_threshold_keeps_utterance_open() {
        let mut seg = UtteranceSegmenter::new(config());
        assert!(feed(&mut seg, 0.2, 20).is_empty());
        // 240ms of silence
        assert!(feed(&mut seg, 0.0, 12).is_empty());
        assert_eq!(seg.state(), VadState::TrailingSilence);

        let segments = feed(&mut seg, 0.0, 1);
        assert_eq!(segments.len(), 1);
        assert_eq!(seg.state(), VadState::Idle);
    }

    #[test]
    fn resumed_speech_keeps_pause_audio() {
        let mut seg = UtteranceSegmenter::new(config());
        feed(&mut seg, 0.2, 10);
        feed(&mut seg, 0.0, 5);
        assert_eq!(seg.state(), VadState::TrailingSilence);
        feed(&mut seg, 0.2, 10);
        assert_eq!(seg.state(), VadState::Voiced);

        let segments = feed(&mut seg, 0.0, 13);
        let utterance = segments.into_iter().next().unwrap().into_utterance().unwrap();
        assert_eq!(utterance.samples.len(), 25 * config().frame_samples());
        assert!(!utterance.forced);
    }

    #[test]
    fn max_length_forces_emission() {
        let mut seg = UtteranceSegmenter::new(config());
        // 7000ms at 20ms frames
        let segments = feed(&mut seg, 0.2, 350);
        assert_eq!(segments.len(), 1);

        let utterance = segments.into_iter().next().unwrap().into_utterance().unwrap();
        assert!(utterance.forced);
        assert_eq!(utterance.end_ms - utterance.start_ms, 7000);
    }

    #[test]
    fn short_utterance_is_discarded() {
        let mut seg = UtteranceSegmenter::new(config());
        feed(&mut seg, 0.2, 3);
        let segments = feed(&mut seg, 0.0, 13);
        assert!(matches!(
            segments.as_slice(),
            [Segment::Discarded(DiscardReason::TooShort { .. })]
        ));
    }

    #[test]
    fn quiet_utterance_is_discarded() {
        // Voiced by external decision, but below the noise floor
        let mut seg = UtteranceSegmenter::new(config());
        let quiet = frame(0.002);
        for _ in 0..20 {
            assert!(seg.push_frame_with_decision(&quiet, true).is_none());
        }
        let silent = frame(0.0);
        let mut out = None;
        for _ in 0..13 {
            out = out.or(seg.push_frame_with_decision(&silent, false));
        }
        assert!(matches!(
            out,
            Some(Segment::Discarded(DiscardReason::TooQuiet { .. }))
        ));
    }

    #[test]
    fn pcm_bytes_are_assembled_into_frames() {
        let mut seg = UtteranceSegmenter::new(config());
        let loud: Vec<u8> = std::iter::repeat_n(8000i16, 320 * 20)
            .flat_map(i16::to_le_bytes)
            .collect();
        let quiet = vec![0u8; 320 * 2 * 13];

        // Odd-sized writes that split frames and samples
        let mut segments = Vec::new();
        for chunk in loud.chunks(333).chain(quiet.chunks(333)) {
            segments.extend(seg.push_pcm(chunk));
        }

        assert_eq!(segments.len(), 1);
        let utterance = segments.into_iter().next().unwrap().into_utterance().unwrap();
        assert_eq!(utterance.samples.len(), 320 * 20);
        assert_eq!(utterance.start_ms, 0);
        assert_eq!(utterance.end_ms, 400);
    }

    #[test]
    fn silence_after_length_cut_ends_speech() {
        let mut seg = UtteranceSegmenter::new(config());
        let cut = feed(&mut seg, 0.2, 350);
        assert!(matches!(&cut[..], [Segment::Utterance(u)] if u.forced));

        assert!(feed(&mut seg, 0.0, 12).is_empty());
        let ended = feed(&mut seg, 0.0, 1);
        assert!(matches!(ended.as_slice(), [Segment::SpeechEnded]));

        // Reported once
        assert!(feed(&mut seg, 0.0, 50).is_empty());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn continuation_after_cut_closes_normally() {
        let mut seg = UtteranceSegmenter::new(config());
        feed(&mut seg, 0.2, 350);
        feed(&mut seg, 0.2, 30);

        let segments = feed(&mut seg, 0.0, 60);
        assert!(matches!(&segments[..], [Segment::Utterance(u)] if !u.forced));
    }

    #[test]
    fn flush_after_cut_ends_speech() {
        let mut seg = UtteranceSegmenter::new(config());
        feed(&mut seg, 0.2, 350);
        assert!(matches!(seg.flush(), Some(Segment::SpeechEnded)));
        assert!(seg.flush().is_none());
    }

    #[test]
    fn flush_closes_open_utterance() {
        let mut seg = UtteranceSegmenter::new(config());
        feed(&mut seg, 0.2, 20);
        let segment = seg.flush().unwrap();
        assert!(segment.into_utterance().is_some());
        assert!(seg.flush().is_none());
    }
}
