//! Speech-recognition engine abstraction.

pub mod command;
pub mod transcriber;

pub use command::{CommandEngineFactory, CommandTranscriber};
pub use transcriber::{
    ChunkTranscript, EngineFactory, MockEngineFactory, MockTranscriber, Transcriber,
};
