use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::ChangeNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for appointment change notices, one channel per shop.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<ChangeNotice>>,
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

    /// Subscribe to changes for a shop. Creates the channel if needed.
    pub fn subscribe(&self, shop_id: Ulid) -> broadcast::Receiver<ChangeNotice> {
        let sender = self
            .channels
            .entry(shop_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, shop_id: Ulid, notice: &ChangeNotice) {
        if let Some(sender) = self.channels.get(&shop_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a shop's channel once its last subscriber is gone.
    pub fn remove_if_idle(&self, shop_id: &Ulid) {
        self.channels
            .remove_if(shop_id, |_, sender| sender.receiver_count() == 0);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
