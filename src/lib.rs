//! VoiceMode - voice interaction runtime
//!
//! Connects conversational agents to human speech through interchangeable
//! STT/TTS providers:
//! - Conversation loop: speak a message, listen, transcribe, post-process
//! - Streaming TTS playback with VAD-driven barge-in
//! - Ordered provider failover with local-aware compression policy
//! - Connect: persistent WebSocket presence/messaging client with
//!   filesystem mailboxes
//!
//! # Example
//!
//! ```ignore
//! use voicemode::config::Config;
//! use voicemode::conversation::{Conversation, ConverseOptions};
//!
//! #[tokio::main]
//! async fn main() {
//!     let conversation = Conversation::new(Config::from_env());
//!     let reply = conversation
//!         .converse("What would you like to do next?", &ConverseOptions::default())
//!         .await;
//!     println!("{}", reply);
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod types;
pub mod config;
pub mod events;
pub mod exchanges;

// Audio and providers
pub mod audio;
pub mod providers;
pub mod conversation;

// Connect and process-level utilities
pub mod auth;
pub mod conch;
pub mod connect;
pub mod service;

// Re-export commonly used types for convenience
pub use config::Config;
pub use conversation::{Conversation, ConverseOptions};
pub use error::VoiceModeError;

pub use audio::{BargeInMonitor, NonBlockingPlayer};

pub use providers::{
    ProviderRegistry,
    SynthesizePipeline,
    TranscribePipeline,
};

pub use connect::{ConnectClient, UserManager};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - voice interaction runtime", NAME, VERSION)
}
