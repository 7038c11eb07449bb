//! Per-entity mailboxes with send-only addresses.
//!
//! Every entity owns exactly one receiving [`Mailbox`] per lane and processes
//! it strictly in arrival order. Other entities only ever hold an [`Address`],
//! which can enqueue messages but cannot observe or mutate the owner.
//!
//! # Lanes
//!
//! ```text
//!   mailbox()                    tokio mpsc, unbounded (protocol lanes)
//!   bounded_mailbox(Block)       tokio mpsc, sender waits for space
//!   bounded_mailbox(DropOldest)  tokio broadcast ring, oldest displaced
//! ```
//!
//! Protocol lanes are unbounded because the request/reply protocol already
//! limits their depth. Displacement is counted by the receiving side.

use crate::error::EnvError;
use crate::types::EntityId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// What a bounded mailbox does with a message that arrives while it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// The sender waits for space.
    Block,

    /// The oldest queued message is discarded to make room.
    DropOldest,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Block => f.write_str("block"),
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop_oldest" | "drop-oldest" | "dropoldest" => Ok(OverflowPolicy::DropOldest),
            _ => Err(format!("Unknown overflow policy: {}", s)),
        }
    }
}

/// Bound and overflow policy for a mailbox.
///
/// Neither field has a default: the bound is a deliberate integration choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Maximum number of queued messages
    pub capacity: usize,

    /// Behavior when a message arrives at a full mailbox
    pub overflow: OverflowPolicy,
}

impl MailboxConfig {
    /// Creates a new mailbox configuration.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self { capacity, overflow }
    }
}

enum Tx<M> {
    Unbounded(mpsc::UnboundedSender<M>),
    Bounded(mpsc::Sender<M>),
    Ring(broadcast::Sender<M>),
}

impl<M> Clone for Tx<M> {
    fn clone(&self) -> Self {
        match self {
            Tx::Unbounded(tx) => Tx::Unbounded(tx.clone()),
            Tx::Bounded(tx) => Tx::Bounded(tx.clone()),
            Tx::Ring(tx) => Tx::Ring(tx.clone()),
        }
    }
}

enum WeakTx<M> {
    Unbounded(mpsc::WeakUnboundedSender<M>),
    Bounded(mpsc::WeakSender<M>),
    Ring(broadcast::WeakSender<M>),
}

enum Rx<M> {
    Unbounded(mpsc::UnboundedReceiver<M>),
    Bounded(mpsc::Receiver<M>),
    /// The ring may hold more than `capacity` slots; the excess is shed on receive.
    Ring(broadcast::Receiver<M>, usize),
}

/// Creates an unbounded mailbox owned by `owner` and the first address
/// pointing at it.
pub fn mailbox<M>(owner: EntityId) -> (Address<M>, Mailbox<M>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Address {
            owner: owner.clone(),
            tx: Tx::Unbounded(tx),
        },
        Mailbox {
            owner,
            rx: Rx::Unbounded(rx),
            capacity: None,
            displaced: 0,
        },
    )
}

/// Creates a bounded mailbox that applies `config.overflow` when full.
///
/// A capacity of 0 is treated as 1.
pub fn bounded_mailbox<M: Clone>(owner: EntityId, config: MailboxConfig) -> (Address<M>, Mailbox<M>) {
    let capacity = config.capacity.max(1);
    let (tx, rx) = match config.overflow {
        OverflowPolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (Tx::Bounded(tx), Rx::Bounded(rx))
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity.next_power_of_two());
            (Tx::Ring(tx), Rx::Ring(rx, capacity))
        }
    };
    (
        Address {
            owner: owner.clone(),
            tx,
        },
        Mailbox {
            owner,
            rx,
            capacity: Some(capacity),
            displaced: 0,
        },
    )
}

/// Send-only handle to an entity's mailbox.
///
/// Cloning an address is cheap. When the last address is dropped the owner's
/// `recv` returns `None` once the queue drains.
pub struct Address<M> {
    owner: EntityId,
    tx: Tx<M>,
}

impl<M> Address<M> {
    /// Returns the identity of the entity this address delivers to.
    pub fn id(&self) -> &EntityId {
        &self.owner
    }

    /// Enqueues a message, applying the overflow policy if the mailbox is full.
    ///
    /// # Returns
    /// * `Ok(())` - Message queued (possibly displacing the oldest one)
    /// * `Err(EnvError::MailboxClosed)` - The owner has stopped receiving
    pub async fn send(&self, message: M) -> Result<(), EnvError> {
        let delivered = match &self.tx {
            Tx::Unbounded(tx) => tx.send(message).is_ok(),
            Tx::Bounded(tx) => tx.send(message).await.is_ok(),
            Tx::Ring(tx) => tx.send(message).is_ok(),
        };
        if delivered {
            Ok(())
        } else {
            Err(EnvError::closed(&self.owner))
        }
    }

    /// Returns true if the owner has stopped receiving.
    pub fn is_closed(&self) -> bool {
        match &self.tx {
            Tx::Unbounded(tx) => tx.is_closed(),
            Tx::Bounded(tx) => tx.is_closed(),
            Tx::Ring(tx) => tx.receiver_count() == 0,
        }
    }

    /// Creates a handle that does not keep the mailbox open.
    ///
    /// An entity keeps a weak handle to itself so it can hand out its own
    /// address in replies without preventing its mailbox from closing.
    pub fn downgrade(&self) -> WeakAddress<M> {
        let tx = match &self.tx {
            Tx::Unbounded(tx) => WeakTx::Unbounded(tx.downgrade()),
            Tx::Bounded(tx) => WeakTx::Bounded(tx.downgrade()),
            Tx::Ring(tx) => WeakTx::Ring(tx.downgrade()),
        };
        WeakAddress {
            owner: self.owner.clone(),
            tx,
        }
    }
}

impl<M> Clone for Address<M> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M> PartialEq for Address<M> {
    fn eq(&self, other: &Self) -> bool {
        match (&self.tx, &other.tx) {
            (Tx::Unbounded(a), Tx::Unbounded(b)) => a.same_channel(b),
            (Tx::Bounded(a), Tx::Bounded(b)) => a.same_channel(b),
            (Tx::Ring(a), Tx::Ring(b)) => a.same_channel(b),
            _ => false,
        }
    }
}

impl<M> Eq for Address<M> {}

impl<M> std::fmt::Debug for Address<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.owner)
    }
}

/// Address that does not count as a sender.
pub struct WeakAddress<M> {
    owner: EntityId,
    tx: WeakTx<M>,
}

impl<M> WeakAddress<M> {
    /// Returns the identity of the entity this address delivers to.
    pub fn id(&self) -> &EntityId {
        &self.owner
    }

    /// Upgrades to a full address, or `None` once every address is gone.
    pub fn upgrade(&self) -> Option<Address<M>> {
        let tx = match &self.tx {
            WeakTx::Unbounded(tx) => Tx::Unbounded(tx.upgrade()?),
            WeakTx::Bounded(tx) => Tx::Bounded(tx.upgrade()?),
            WeakTx::Ring(tx) => Tx::Ring(tx.upgrade()?),
        };
        Some(Address {
            owner: self.owner.clone(),
            tx,
        })
    }
}

impl<M> Clone for WeakAddress<M> {
    fn clone(&self) -> Self {
        let tx = match &self.tx {
            WeakTx::Unbounded(tx) => WeakTx::Unbounded(tx.clone()),
            WeakTx::Bounded(tx) => WeakTx::Bounded(tx.clone()),
            WeakTx::Ring(tx) => WeakTx::Ring(tx.clone()),
        };
        Self {
            owner: self.owner.clone(),
            tx,
        }
    }
}

impl<M> std::fmt::Debug for WeakAddress<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakAddress({})", self.owner)
    }
}

/// Receiving end of an entity's mailbox. Exactly one exists per mailbox.
///
/// Dropping it closes the mailbox: pending and future sends fail.
pub struct Mailbox<M> {
    owner: EntityId,
    rx: Rx<M>,
    capacity: Option<usize>,
    displaced: u64,
}

impl<M> Mailbox<M> {
    /// Returns the identity of the owning entity.
    pub fn owner(&self) -> &EntityId {
        &self.owner
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        match &self.rx {
            Rx::Unbounded(rx) => rx.len(),
            Rx::Bounded(rx) => rx.len(),
            Rx::Ring(rx, capacity) => rx.len().min(*capacity),
        }
    }

    /// Returns true if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound, or `None` for an unbounded mailbox.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Number of messages displaced by the `DropOldest` policy so far.
    ///
    /// Counted as the owner receives, so the total is final once `recv`
    /// has returned `None`.
    pub fn displaced(&self) -> u64 {
        self.displaced
    }

    fn record_displaced(&mut self, count: u64) {
        self.displaced += count;
        warn!(
            "Mailbox of {} full, displaced {} oldest message(s) (total displaced: {})",
            self.owner, count, self.displaced
        );
    }
}

impl<M: Clone> Mailbox<M> {
    /// Receives the next message in arrival order.
    ///
    /// Returns `None` once every address has been dropped and the queue is
    /// empty. Cancel-safe: a message is only removed when it is returned or
    /// counted as displaced.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            let (received, queued) = match &mut self.rx {
                Rx::Unbounded(rx) => return rx.recv().await,
                Rx::Bounded(rx) => return rx.recv().await,
                Rx::Ring(rx, capacity) => {
                    let received = rx.recv().await;
                    (received, rx.len() >= *capacity)
                }
            };
            match received {
                // `capacity` newer messages are queued behind this one.
                Ok(_) if queued => self.record_displaced(1),
                Ok(message) => return Some(message),
                Err(RecvError::Lagged(count)) => self.record_displaced(count),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Receives a message if one is queued, without waiting.
    pub fn try_recv(&mut self) -> Option<M> {
        loop {
            let (received, queued) = match &mut self.rx {
                Rx::Unbounded(rx) => return rx.try_recv().ok(),
                Rx::Bounded(rx) => return rx.try_recv().ok(),
                Rx::Ring(rx, capacity) => {
                    let received = rx.try_recv();
                    (received, rx.len() >= *capacity)
                }
            };
            match received {
                Ok(_) if queued => self.record_displaced(1),
                Ok(message) => return Some(message),
                Err(TryRecvError::Lagged(count)) => self.record_displaced(count),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn bounded(capacity: usize, overflow: OverflowPolicy) -> (Address<u64>, Mailbox<u64>) {
        bounded_mailbox(EntityId::from("caller-1"), MailboxConfig::new(capacity, overflow))
    }

    #[tokio::test]
    async fn test_messages_arrive_in_send_order() {
        let (address, mut inbox) = mailbox::<u64>(EntityId::from("tower-a"));

        for i in 0..100 {
            address.send(i).await.unwrap();
        }

        for i in 0..100 {
            assert_eq!(inbox.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_recv_returns_none_after_last_address_dropped() {
        for overflow in [OverflowPolicy::Block, OverflowPolicy::DropOldest] {
            let (address, mut inbox) = bounded(4, overflow);
            let second = address.clone();

            address.send(1).await.unwrap();
            drop(address);
            second.send(2).await.unwrap();
            drop(second);

            assert_eq!(inbox.recv().await, Some(1));
            assert_eq!(inbox.recv().await, Some(2));
            assert_eq!(inbox.recv().await, None);
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_displaces_front() {
        let (address, mut inbox) = bounded(2, OverflowPolicy::DropOldest);

        address.send(1).await.unwrap();
        address.send(2).await.unwrap();
        address.send(3).await.unwrap();
        assert_eq!(inbox.len(), 2);

        assert_eq!(inbox.try_recv(), Some(2));
        assert_eq!(inbox.displaced(), 1);
        assert_eq!(inbox.try_recv(), Some(3));
        assert_eq!(inbox.try_recv(), None);
    }

    #[tokio::test]
    async fn test_drop_oldest_respects_non_power_of_two_capacity() {
        let (address, mut inbox) = bounded(3, OverflowPolicy::DropOldest);
        for i in 0..5 {
            address.send(i).await.unwrap();
        }
        drop(address);

        let mut received = Vec::new();
        while let Some(value) = inbox.recv().await {
            received.push(value);
        }
        assert_eq!(received, vec![2, 3, 4]);
        assert_eq!(inbox.displaced(), 2);
    }

    #[tokio::test]
    async fn test_block_waits_for_space() {
        let (address, mut inbox) = bounded(1, OverflowPolicy::Block);
        address.send(1).await.unwrap();

        let sender = address.clone();
        let pending = tokio::spawn(async move { sender.send(2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        assert_eq!(inbox.len(), 1);

        assert_eq!(inbox.recv().await, Some(1));
        pending.await.unwrap().unwrap();
        assert_eq!(inbox.recv().await, Some(2));
        assert_eq!(inbox.displaced(), 0);
    }

    #[tokio::test]
    async fn test_send_to_dropped_mailbox_fails() {
        for overflow in [OverflowPolicy::Block, OverflowPolicy::DropOldest] {
            let (address, inbox) = bounded(1, overflow);
            drop(inbox);

            assert!(address.is_closed());
            assert!(matches!(address.send(1).await, Err(EnvError::MailboxClosed(_))));
        }
    }

    #[tokio::test]
    async fn test_blocked_sender_released_when_mailbox_dropped() {
        let (address, inbox) = bounded(1, OverflowPolicy::Block);
        address.send(1).await.unwrap();

        let sender = address.clone();
        let pending = tokio::spawn(async move { sender.send(2).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(inbox);
        assert!(pending.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_weak_address_does_not_keep_mailbox_open() {
        let (address, mut inbox) = mailbox::<u64>(EntityId::from("tower-a"));
        let weak = address.downgrade();

        let upgraded = weak.upgrade().unwrap();
        assert_eq!(upgraded, address);
        upgraded.send(5).await.unwrap();
        drop(upgraded);
        drop(address);

        assert!(weak.upgrade().is_none());
        assert_eq!(inbox.recv().await, Some(5));
        assert_eq!(inbox.recv().await, None);
    }

    #[test]
    fn test_overflow_policy_parse() {
        assert_eq!("block".parse::<OverflowPolicy>(), Ok(OverflowPolicy::Block));
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert!("lifo".parse::<OverflowPolicy>().is_err());
    }

    #[test]
    fn test_address_debug_shows_only_identity() {
        let (address, _inbox) = bounded(1, OverflowPolicy::Block);
        assert_eq!(format!("{:?}", address), "Address(caller-1)");
    }

    #[test]
    fn test_addresses_of_different_mailboxes_differ() {
        let (a, _a_inbox) = mailbox::<u64>(EntityId::from("tower-a"));
        let (b, _b_inbox) = mailbox::<u64>(EntityId::from("tower-a"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    proptest! {
        #[test]
        fn prop_drop_oldest_keeps_newest_suffix(capacity in 1usize..8, count in 0u64..32) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let (address, mut inbox) = bounded(capacity, OverflowPolicy::DropOldest);
                for i in 0..count {
                    address.send(i).await.unwrap();
                }

                let kept = (count as usize).min(capacity) as u64;
                let mut received = Vec::new();
                while let Some(value) = inbox.try_recv() {
                    received.push(value);
                }
                let expected: Vec<u64> = (count - kept..count).collect();
                prop_assert_eq!(received, expected);
                prop_assert_eq!(inbox.displaced(), count - kept);
                Ok::<(), proptest::test_runner::TestCaseError>(())
            })?;
        }
    }
}
