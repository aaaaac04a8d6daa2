//! Victron-style CAN frame encoders and publisher scheduler.

pub mod frames;
pub mod publisher;

pub use frames::{CanChannel, FrameContext, Identity, CHANNEL_CATALOGUE};
pub use publisher::{CanPublisher, PublisherMode};
