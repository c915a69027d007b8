use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::channel::PeerChannel;
use crate::media::MediaSet;
use crate::protocol::{Notification, PeerInfo};
use crate::types::PeerId;

/// What a participant told us about itself on join
#[derive(Debug, Clone, Default)]
pub struct PeerProfile {
    pub display_name: Option<String>,
    pub device: Value,
    pub rtp_capabilities: Option<Value>,
    pub sctp_capabilities: Option<Value>,
}

/// One WebSocket participant of a session
pub struct Peer {
    id: PeerId,
    channel: PeerChannel,
    joined: AtomicBool,
    closed: AtomicBool,
    profile: RwLock<PeerProfile>,
    pub(crate) media: MediaSet,
}

impl Peer {
    #[must_use]
    pub fn new(id: PeerId, channel: PeerChannel) -> Self {
        Self {
            id,
            channel,
            joined: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            profile: RwLock::new(PeerProfile::default()),
            media: MediaSet::default(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Record the join; false if the peer had already joined
    pub(crate) fn join(&self, profile: PeerProfile) -> bool {
        let mut current = self.profile.write();
        if self.joined.swap(true, Ordering::SeqCst) {
            return false;
        }
        *current = profile;
        true
    }

    /// Mark closed; returns false if it already was
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn profile(&self) -> PeerProfile {
        self.profile.read().clone()
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> Option<Value> {
        self.profile.read().rtp_capabilities.clone()
    }

    #[must_use]
    pub fn has_sctp_capabilities(&self) -> bool {
        self.profile.read().sctp_capabilities.is_some()
    }

    /// Returns the previous display name
    pub(crate) fn set_display_name(&self, display_name: String) -> Option<String> {
        self.profile.write().display_name.replace(display_name)
    }

    #[must_use]
    pub fn info(&self) -> PeerInfo {
        let profile = self.profile.read();
        PeerInfo {
            id: self.id.to_string(),
            display_name: profile.display_name.clone(),
            device: profile.device.clone(),
        }
    }

    pub fn notify(&self, notification: &Notification) {
        self.channel.notify(notification);
    }
}
