use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber};

use crate::aggregate::AggregateField;
use crate::connector::ConnectionStatus;
use crate::sensors::{NormalizeError, Reading, SourceId};

/// Channel capacity for engine notifications.
/// Publishers never wait: a full channel overwrites the oldest entry and a
/// slow subscriber sees a lag count instead of stalling ingestion.
pub const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Number of subscribers that can listen to engine events
/// (dashboard renderer, loggers, tests)
pub const EVENT_SUBSCRIBERS: usize = 4;

/// Counted publishers; the engine itself only uses immediate publishers,
/// which do not take a slot
pub const EVENT_PUBLISHERS: usize = 1;

/// Notifications emitted after engine state has changed
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A reading was admitted into a source's tables
    Reading { source: SourceId, reading: Reading },
    /// A source connector changed state
    Status {
        source: SourceId,
        status: ConnectionStatus,
    },
    /// A payload was rejected and dropped
    Dropped {
        source: SourceId,
        error: NormalizeError,
    },
    /// An aggregate field was refreshed or failed to refresh
    Aggregate { field: AggregateField, ok: bool },
}

pub type EventChannel = PubSubChannel<
    CriticalSectionRawMutex,
    EngineEvent,
    EVENT_CHANNEL_CAPACITY,
    EVENT_SUBSCRIBERS,
    EVENT_PUBLISHERS,
>;

pub type EventSubscriber<'a> = Subscriber<
    'a,
    CriticalSectionRawMutex,
    EngineEvent,
    EVENT_CHANNEL_CAPACITY,
    EVENT_SUBSCRIBERS,
    EVENT_PUBLISHERS,
>;

/// Publish without waiting for subscribers
pub(crate) fn notify(channel: &EventChannel, event: EngineEvent) {
    channel.immediate_publisher().publish_immediate(event);
}
