//! Voice media: emotion-to-voice mapping, streaming STT, streaming TTS.

pub mod emotion_map;
pub mod recognition;
pub mod synthesis;
