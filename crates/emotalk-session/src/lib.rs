//! Conversation session orchestration for emotalk.
//!
//! A [`ConversationSession`] ties one client connection to the recognition,
//! reply-generation, and synthesis capabilities held in [`Services`]. Each
//! completed utterance runs through the [`Pipeline`] under a per-session lock,
//! so a session's outbound events never interleave. Finished practice
//! conversations can be scored afterwards with [`review_conversation`].

pub mod accumulator;
pub mod events;
pub mod feedback;
pub mod pipeline;
pub mod registry;
pub mod reply;
pub mod session;

#[cfg(test)]
mod test_support;

pub use events::EventSink;
pub use feedback::{FeedbackService, SessionFeedback, review_conversation};
pub use pipeline::{Pipeline, PipelineJob};
pub use registry::{Availability, Services};
pub use reply::ReplyAdapter;
pub use session::{ConversationSession, InboundOutcome, SessionState};
