//! Connection-scoped subscriptions for new headers and per-script status
//! changes. A subscription is a connection id plus a bounded send handle;
//! delivery happens on the engine task with a deadline, and a subscriber
//! that cannot be reached in time is dropped.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use faro_log::log_warn;
use faro_primitives::{Hash256, HEADER_LEN};

pub type ConnectionId = u64;

const DELIVERY_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    NewHeader {
        height: i64,
        header: [u8; HEADER_LEN],
    },
    ScriptStatus {
        script_hash: Hash256,
        status: Option<Hash256>,
    },
}

#[derive(Default)]
pub struct SubscriptionHub {
    header_subs: HashMap<ConnectionId, mpsc::Sender<Notification>>,
    script_subs: HashMap<Hash256, HashMap<ConnectionId, mpsc::Sender<Notification>>>,
}

impl SubscriptionHub {
    pub fn subscribe_headers(&mut self, id: ConnectionId, sender: mpsc::Sender<Notification>) {
        self.header_subs.insert(id, sender);
    }

    pub fn subscribe_script(
        &mut self,
        id: ConnectionId,
        script_hash: Hash256,
        sender: mpsc::Sender<Notification>,
    ) {
        self.script_subs
            .entry(script_hash)
            .or_default()
            .insert(id, sender);
    }

    pub fn unsubscribe_all(&mut self, id: ConnectionId) {
        self.header_subs.remove(&id);
        self.script_subs.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }

    pub async fn notify_header(&mut self, height: i64, header: [u8; HEADER_LEN]) {
        if self.header_subs.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for (id, sender) in &self.header_subs {
            let notification = Notification::NewHeader { height, header };
            match timeout(DELIVERY_DEADLINE, sender.send(notification)).await {
                Ok(Ok(())) => {}
                _ => dead.push(*id),
            }
        }
        self.drop_subscribers(dead);
    }

    pub async fn notify_script(&mut self, script_hash: &Hash256, status: Option<Hash256>) {
        let Some(subscribers) = self.script_subs.get(script_hash) else {
            return;
        };
        let mut dead = Vec::new();
        for (id, sender) in subscribers {
            let notification = Notification::ScriptStatus {
                script_hash: *script_hash,
                status,
            };
            match timeout(DELIVERY_DEADLINE, sender.send(notification)).await {
                Ok(Ok(())) => {}
                _ => dead.push(*id),
            }
        }
        self.drop_subscribers(dead);
    }

    fn drop_subscribers(&mut self, dead: Vec<ConnectionId>) {
        for id in dead {
            log_warn!("dropping subscriber {id}: notification delivery failed");
            self.unsubscribe_all(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: u8) -> [u8; HEADER_LEN] {
        [tag; HEADER_LEN]
    }

    #[tokio::test]
    async fn header_notifications_reach_every_subscriber() {
        let mut hub = SubscriptionHub::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.subscribe_headers(1, tx1);
        hub.subscribe_headers(2, tx2);

        hub.notify_header(7, header(0xaa)).await;
        let expected = Notification::NewHeader {
            height: 7,
            header: header(0xaa),
        };
        assert_eq!(rx1.recv().await.unwrap(), expected);
        assert_eq!(rx2.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn script_notifications_are_scoped_to_the_hash() {
        let mut hub = SubscriptionHub::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.subscribe_script(1, [0x11; 32], tx1);
        hub.subscribe_script(2, [0x22; 32], tx2);

        hub.notify_script(&[0x11; 32], Some([0x99; 32])).await;
        assert_eq!(
            rx1.recv().await.unwrap(),
            Notification::ScriptStatus {
                script_hash: [0x11; 32],
                status: Some([0x99; 32]),
            }
        );
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_removes_every_subscription() {
        let mut hub = SubscriptionHub::default();
        let (tx, mut rx) = mpsc::channel(4);
        hub.subscribe_headers(1, tx.clone());
        hub.subscribe_script(1, [0x11; 32], tx);

        hub.unsubscribe_all(1);
        hub.notify_header(1, header(1)).await;
        hub.notify_script(&[0x11; 32], None).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_receiver_is_dropped() {
        let mut hub = SubscriptionHub::default();
        let (tx, rx) = mpsc::channel(4);
        hub.subscribe_headers(1, tx);
        drop(rx);

        hub.notify_header(1, header(1)).await;
        assert!(hub.header_subs.is_empty());
    }
}
