use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

pub const INVENTORY_CHANNEL: &str = "inventory";
pub const WAITLIST_CHANNEL: &str = "waitlist";
pub const STAFF_CHANNEL: &str = "staff";

/// One delivered message: the channel it was published on plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: Arc<str>,
    pub payload: Arc<str>,
}

/// Broadcast hub for LISTEN/NOTIFY, keyed by channel name.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it on first use.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish on one channel. No-op if nobody is listening.
    pub fn publish(&self, channel: &str, payload: Arc<str>) {
        if let Some(sender) = self.channels.get(channel)
            && sender.send(Notification {
                channel: Arc::from(channel),
                payload,
            })
            .is_err()
        {
            // Last receiver is gone; drop the channel so the map doesn't grow forever.
            drop(sender);
            self.channels.remove_if(channel, |_, s| s.receiver_count() == 0);
        }
    }

    /// Publish a committed event to every channel it concerns.
    pub fn send(&self, event: &Event) {
        let channels = event_channels(event);
        if channels.is_empty() {
            return;
        }
        let payload: Arc<str> = match serde_json::to_string(&event.redacted()) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::warn!("notification payload encoding failed: {e}");
                return;
            }
        };
        for channel in channels {
            self.publish(&channel, payload.clone());
        }
    }
}

pub fn resource_channel(id: &ulid::Ulid) -> String {
    format!("resource_{id}")
}

pub fn lane_channel(lane: &str) -> String {
    format!("lane_{lane}")
}

/// Channels an event is published on.
pub fn event_channels(event: &Event) -> Vec<String> {
    let mut channels: Vec<String> = event.resource_ids().iter().map(resource_channel).collect();
    match event {
        Event::ResourceAdded { id, .. } | Event::ResourceRetired { id } => {
            channels.push(resource_channel(id));
            channels.push(INVENTORY_CHANNEL.into());
        }
        Event::StatusChanged { .. } | Event::Renewed { .. } => {
            channels.push(INVENTORY_CHANNEL.into());
        }
        Event::LaneOpened { session } => {
            channels.push(lane_channel(&session.lane));
            channels.push(INVENTORY_CHANNEL.into());
        }
        Event::LaneClosed { lane, .. } | Event::CheckedIn { lane, .. } => {
            channels.push(lane_channel(lane));
            channels.push(INVENTORY_CHANNEL.into());
        }
        Event::CheckedOut { withdrawn, .. } => {
            channels.push(INVENTORY_CHANNEL.into());
            if !withdrawn.is_empty() {
                channels.push(WAITLIST_CHANNEL.into());
            }
        }
        Event::WaitlistJoined { .. } | Event::WaitlistLeft { .. } => {
            channels.push(WAITLIST_CHANNEL.into());
        }
        Event::UpgradeOffered { .. } | Event::OfferExpired { .. } | Event::Upgraded { .. } => {
            channels.push(WAITLIST_CHANNEL.into());
            channels.push(INVENTORY_CHANNEL.into());
        }
        Event::StaffAdded { .. }
        | Event::StaffDeactivated { .. }
        | Event::SessionOpened { .. }
        | Event::SessionClosed { .. }
        | Event::ClockedIn { .. }
        | Event::ClockedOut { .. }
        | Event::ShiftScheduled { .. }
        | Event::ShiftRemoved { .. } => {
            channels.push(STAFF_CHANNEL.into());
        }
        Event::LineItemAdded { .. } | Event::Snapshot(_) => {}
    }
    channels
}

/// Whether a client may LISTEN on `channel`.
pub fn is_valid_channel(channel: &str) -> bool {
    if matches!(channel, INVENTORY_CHANNEL | WAITLIST_CHANNEL | STAFF_CHANNEL) {
        return true;
    }
    if let Some(id) = channel.strip_prefix("resource_") {
        return ulid::Ulid::from_string(id).is_ok();
    }
    if let Some(lane) = channel.strip_prefix("lane_") {
        return is_valid_lane_name(lane);
    }
    false
}

pub fn is_valid_lane_name(lane: &str) -> bool {
    !lane.is_empty()
        && lane.len() <= crate::limits::MAX_LANE_NAME_LEN
        && lane.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
