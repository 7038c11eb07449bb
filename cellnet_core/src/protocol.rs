//! The message vocabulary exchanged between Universe, towers and callers.
//!
//! Every envelope carries only the fields its interaction needs. Addresses
//! are send-only handles; holding one never grants access to the addressed
//! entity's state.

use crate::cdr::Cdr;
use cellnet_env::{Address, EntityId};

/// Send-only handle to any entity in the simulation.
pub type Addr = Address<Message>;

#[derive(Debug, Clone)]
pub enum Message {
    /// Initial wiring from the Universe
    Setup {
        universe: Addr,
        towers: Vec<Addr>,
        users: Vec<Addr>,
    },

    /// Begin ticking
    Start,

    /// One simulated time step
    Tick { tick: u64 },

    /// Caller position update, observability only
    Move { caller_id: EntityId, x: f64, y: f64 },

    /// Survey from a caller at `(x, y)`; the reply goes to `source`
    SignalReportRequest { source: Addr, x: f64, y: f64 },

    SignalReport {
        distance: f64,
        power: f64,
        tower_id: EntityId,
        tower: Addr,
    },

    /// Admission request. `reconnect` marks a handoff attempt.
    Hello {
        caller: Addr,
        cdr: Cdr,
        reconnect: bool,
    },

    Connect { tower_id: EntityId, tower: Addr },

    Fail { tower_id: EntityId },

    /// Release of a tower slot. The CDR is final unless this is the source
    /// side of a handoff.
    Disconnect { caller_id: EntityId, cdr: Cdr },

    /// A finalized CDR on its way to the external sink
    Log { cdr: Cdr },
}

impl Message {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Setup { .. } => "Setup",
            Message::Start => "Start",
            Message::Tick { .. } => "Tick",
            Message::Move { .. } => "Move",
            Message::SignalReportRequest { .. } => "SignalReportRequest",
            Message::SignalReport { .. } => "SignalReport",
            Message::Hello { .. } => "Hello",
            Message::Connect { .. } => "Connect",
            Message::Fail { .. } => "Fail",
            Message::Disconnect { .. } => "Disconnect",
            Message::Log { .. } => "Log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellnet_env::mailbox;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Message::Start.kind(), "Start");
        assert_eq!(Message::Tick { tick: 3 }.kind(), "Tick");
        assert_eq!(
            Message::Fail {
                tower_id: EntityId::from("tower-a")
            }
            .kind(),
            "Fail"
        );
    }

    #[tokio::test]
    async fn test_reply_address_travels_in_envelope() {
        let (caller, mut caller_inbox) = mailbox::<Message>(EntityId::from("caller-1"));
        let (tower, mut tower_inbox) = mailbox::<Message>(EntityId::from("tower-a"));

        tower
            .send(Message::SignalReportRequest {
                source: caller.clone(),
                x: 1.0,
                y: 0.0,
            })
            .await
            .unwrap();

        match tower_inbox.recv().await {
            Some(Message::SignalReportRequest { source, .. }) => {
                assert_eq!(source.id().as_str(), "caller-1");
                source
                    .send(Message::Fail {
                        tower_id: tower.id().clone(),
                    })
                    .await
                    .unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(caller_inbox.recv().await, Some(Message::Fail { .. })));
    }
}
