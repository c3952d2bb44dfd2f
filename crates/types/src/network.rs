//! Network message traits and priority classification.
//!
//! These traits mark types as network messages for serialization and
//! routing. The consensus core only distinguishes two tiers: consensus
//! envelopes are liveness-critical and never dropped, while transaction
//! fetch traffic is deferrable catch-up work.

use sbor::prelude::{BasicDecode, BasicEncode, BasicSbor};

/// Network message priority levels.
///
/// Lower numeric values = higher priority. Priority determines queue
/// ordering and backpressure behavior in the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[repr(u8)]
pub enum MessagePriority {
    /// Liveness-critical consensus messages. Never dropped.
    Critical = 0,

    /// Background fetch/sync operations. Fully deferrable.
    Background = 1,
}

impl MessagePriority {
    /// Whether this priority level can be dropped under backpressure.
    #[inline]
    pub fn is_droppable(&self) -> bool {
        matches!(self, MessagePriority::Background)
    }
}

/// Marker trait for network messages.
///
/// All messages sent over the network must implement this trait.
/// Each message type declares its priority for network QoS.
pub trait NetworkMessage: Send + Sync + Sized + BasicEncode + BasicDecode {
    /// Unique message type identifier for routing.
    fn message_type_id() -> &'static str
    where
        Self: Sized;

    /// The priority level for this message type.
    ///
    /// Defaults to `Background` - override for higher priority messages.
    fn priority() -> MessagePriority
    where
        Self: Sized,
    {
        MessagePriority::Background
    }
}
