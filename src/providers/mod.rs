//! STT/TTS provider plumbing
//!
//! An ordered registry of endpoints, a failover walk over them, and the
//! transcribe/synthesize pipelines that ride on top.

pub mod failover;
pub mod registry;
pub mod stt;
pub mod tts;

pub use failover::{run_failover, FailoverSuccess, ProviderCallOutcome};
pub use registry::{EndpointDescriptor, Locality, ProviderRegistry, ProviderRole};
pub use stt::{SttOutcome, TranscribePipeline};
pub use tts::{PlaybackMode, SynthesizePipeline, TtsOutcome, TtsRequest};
