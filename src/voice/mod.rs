//! Voice processing module
//!
//! Segments inbound audio into utterances, dispatches them to the
//! transcription engine, and streams synthesized replies back.

pub mod admission;
pub mod audio;
pub mod segmenter;
pub mod stream;
pub mod stt;
pub mod tts;

pub use admission::{AdmissionPermit, AdmissionQueue, AdmissionStats};
pub use audio::{PcmDecoder, calculate_rms, samples_to_wav};
pub use segmenter::{DiscardReason, Segment, UtteranceBuffer, UtteranceSegmenter, VadState};
pub use stream::{SpeechStreamDispatcher, StreamEvent, StreamOutcome, StreamSink, StreamingStats};
pub use stt::{HttpTranscriber, Transcriber, Transcript, TranscriptionDispatcher};
pub use tts::{
    AudioStream, CacheStats, CachingSynthesizer, HttpSynthesizer, SpeechRequest, SynthesisCache,
    Synthesizer,
};
