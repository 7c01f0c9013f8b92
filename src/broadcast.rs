use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{deserialize, generate_id, serialize, Address, Membership, MessageId, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BebMessage {
    mid: MessageId,
    data: Opaque,
}

/// Best-effort broadcast: one perfect-link send per peer plus a local
/// self-delivery. Validity only while the sender stays up; no agreement on
/// crash.
pub struct BasicBroadcast {
    upper: ModuleId,
    pl: ModuleId,
    membership: Arc<Membership>,
}

impl BasicBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "BasicBroadcast",
            vec![Uses::of(Interface::PerfectLink, "pl")],
            |seed| {
                Boot::init(BasicBroadcast {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    membership: seed.membership,
                })
            },
        )
    }
}

impl Module for BasicBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let message = serialize(&BebMessage {
                    mid: generate_id(),
                    data: message,
                });
                for dest in self.membership.peers() {
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest,
                            message: message.clone(),
                        },
                    );
                }
                // the local copy skips the link layer entirely
                let src = self.membership.addr();
                ctx.post(ctx.id(), Event::Deliver { src, message });
            }
            Event::Deliver { src, message } => match deserialize::<BebMessage>(&message) {
                Ok(message) => ctx.post(
                    self.upper,
                    Event::Deliver {
                        src,
                        message: message.data,
                    },
                ),
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RbMessage {
    origin: Address,
    data: Opaque,
}

/// Lazy reliable broadcast: deliver on first sight, relay only for origins
/// already reported crashed. Agreement leans on the completeness of the
/// perfect failure detector.
pub struct LazyReliableBroadcast {
    upper: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    correct: HashSet<Address>,
    from: HashMap<Address, BTreeSet<Opaque>>,
}

impl LazyReliableBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "LazyReliableBroadcast",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(LazyReliableBroadcast {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    correct: seed.membership.members().iter().copied().collect(),
                    membership: seed.membership,
                    from: HashMap::new(),
                })
            },
        )
    }
}

impl Module for LazyReliableBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let origin = self.membership.addr();
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&RbMessage {
                            origin,
                            data: message,
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => {
                let message: RbMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                let seen = self.from.entry(message.origin).or_default();
                if !seen.contains(&message.data) {
                    seen.insert(message.data.clone());
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src: message.origin,
                            message: message.data.clone(),
                        },
                    );
                    if !self.correct.contains(&message.origin) {
                        ctx.post(
                            self.beb,
                            Event::Broadcast {
                                message: serialize(&message),
                            },
                        );
                    }
                }
            }
            Event::Crash { peer } => {
                self.correct.remove(&peer);
                for data in self.from.entry(peer).or_default().clone() {
                    ctx.post(
                        self.beb,
                        Event::Broadcast {
                            message: serialize(&RbMessage { origin: peer, data }),
                        },
                    );
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// Eager reliable broadcast: every first receipt is relayed, no failure
/// detector involved.
pub struct EagerReliableBroadcast {
    upper: ModuleId,
    beb: ModuleId,
    delivered: BTreeSet<Opaque>,
}

impl EagerReliableBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "EagerReliableBroadcast",
            vec![Uses::of(Interface::BestEffortBroadcast, "beb")],
            |seed| {
                Boot::init(EagerReliableBroadcast {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    delivered: BTreeSet::new(),
                })
            },
        )
    }
}

impl Module for EagerReliableBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => ctx.post(self.beb, Event::Broadcast { message }),
            Event::Deliver { src, message } => {
                if self.delivered.insert(message.clone()) {
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src,
                            message: message.clone(),
                        },
                    );
                    ctx.post(self.beb, Event::Broadcast { message });
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UrbMessage {
    origin: Address,
    payload: Opaque,
}

/// All-ack uniform reliable broadcast: delivery waits until every process
/// not reported crashed has echoed the message.
pub struct AllAckUniformBroadcast {
    upper: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    delivered: BTreeSet<Opaque>,
    pending: BTreeSet<(Address, Opaque)>,
    correct: HashSet<Address>,
    ack: HashMap<Opaque, HashSet<Address>>,
}

impl AllAckUniformBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "AllAckUniformBroadcast",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(AllAckUniformBroadcast {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    correct: seed.membership.members().iter().copied().collect(),
                    membership: seed.membership,
                    delivered: BTreeSet::new(),
                    pending: BTreeSet::new(),
                    ack: HashMap::new(),
                })
            },
        )
    }

    fn can_deliver(&self, payload: &Opaque) -> bool {
        let acked = match self.ack.get(payload) {
            Some(acked) => acked,
            None => return false,
        };
        self.correct.iter().all(|p| acked.contains(p))
    }

    fn check_deliver(&mut self, ctx: &mut Context<'_>) {
        let ready: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, payload)| !self.delivered.contains(payload) && self.can_deliver(payload))
            .cloned()
            .collect();
        for (origin, payload) in ready {
            self.delivered.insert(payload.clone());
            ctx.post(
                self.upper,
                Event::Deliver {
                    src: origin,
                    message: payload,
                },
            );
        }
    }
}

impl Module for AllAckUniformBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let origin = self.membership.addr();
                self.pending.insert((origin, message.clone()));
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&UrbMessage {
                            origin,
                            payload: message,
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => {
                let message: UrbMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                self.ack
                    .entry(message.payload.clone())
                    .or_default()
                    .insert(src);
                self.check_deliver(ctx);
                let key = (message.origin, message.payload.clone());
                if !self.pending.contains(&key) {
                    self.pending.insert(key);
                    ctx.post(
                        self.beb,
                        Event::Broadcast {
                            message: serialize(&message),
                        },
                    );
                }
            }
            Event::Crash { peer } => {
                self.correct.remove(&peer);
                // a smaller correct set may complete an ack quorum
                self.check_deliver(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UrbGossip {
    origin: Address,
    payload: Opaque,
    through: Address,
}

/// Majority-ack uniform reliable broadcast: fail-silent, no failure
/// detector, correct while a majority of members stays up.
pub struct MajorityAckUniformBroadcast {
    upper: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    delivered: BTreeSet<Opaque>,
    pending: BTreeSet<(Address, Opaque)>,
    ack: HashMap<Opaque, HashSet<Address>>,
}

impl MajorityAckUniformBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "MajorityAckUniformBroadcast",
            vec![Uses::of(Interface::BestEffortBroadcast, "beb")],
            |seed| {
                Boot::init(MajorityAckUniformBroadcast {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    membership: seed.membership,
                    delivered: BTreeSet::new(),
                    pending: BTreeSet::new(),
                    ack: HashMap::new(),
                })
            },
        )
    }

    fn check_deliver(&mut self, ctx: &mut Context<'_>) {
        let ready: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, payload)| {
                !self.delivered.contains(payload)
                    && self
                        .ack
                        .get(payload)
                        .map_or(false, |acked| self.membership.majority(acked.len()))
            })
            .cloned()
            .collect();
        for (origin, payload) in ready {
            self.delivered.insert(payload.clone());
            info!("{}: deliver from {}", ctx.name(), origin);
            ctx.post(
                self.upper,
                Event::Deliver {
                    src: origin,
                    message: payload,
                },
            );
        }
    }
}

impl Module for MajorityAckUniformBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let origin = self.membership.addr();
                self.pending.insert((origin, message.clone()));
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&UrbGossip {
                            origin,
                            payload: message,
                            through: origin,
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => {
                let message: UrbGossip = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                self.ack
                    .entry(message.payload.clone())
                    .or_default()
                    .insert(src);
                self.check_deliver(ctx);
                let key = (message.origin, message.payload.clone());
                if !self.pending.contains(&key) {
                    self.pending.insert(key.clone());
                    ctx.post(
                        self.beb,
                        Event::Broadcast {
                            message: serialize(&UrbGossip {
                                origin: message.origin,
                                payload: message.payload,
                                through: self.membership.addr(),
                            }),
                        },
                    );
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::registry::Interface;
    use crate::runtime::Event;
    use crate::simulated::{delivered, System};
    use crate::tests::TRACING;

    #[tokio::test(start_paused = true)]
    async fn lazy_reliable_reaches_every_correct_process() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::ReliableBroadcast,
            "rb",
        );
        system.inject(
            0,
            Event::Broadcast {
                message: b"hello".to_vec(),
            },
        );
        for i in 0..3 {
            let (src, message) =
                timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(src, system.members[0]);
            assert_eq!(message, b"hello".to_vec());
        }
        // no duplicates
        assert!(
            timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_reliable_relays_for_a_crashed_origin() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::ReliableBroadcast,
            "rb",
        );
        let (a, c) = (system.members[0], system.members[2]);
        // the origin can talk to everyone except the third process
        system.hub.cut(a, c);
        system.inject(
            0,
            Event::Broadcast {
                message: b"m".to_vec(),
            },
        );
        let (src, _) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(src, a);

        // once the origin is reported crashed, the second process relays
        system.hub.crash(a);
        let (src, message) =
            timeout(Duration::from_secs(600), delivered(&mut system.mailboxes[2]))
                .await
                .unwrap();
        assert_eq!(src, a);
        assert_eq!(message, b"m".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn eager_reliable_delivers_once_everywhere() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::ReliableBroadcast, "EagerReliableBroadcast");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(100),
            Interface::ReliableBroadcast,
            "rb",
            registry,
        );
        system.inject(
            0,
            Event::Broadcast {
                message: b"m".to_vec(),
            },
        );
        for i in 0..3 {
            let (_, message) =
                timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(message, b"m".to_vec());
        }
        assert!(
            timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[0]))
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn majority_ack_delivers_uniformly() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::UniformReliableBroadcast,
            "urb",
        );
        system.inject(
            0,
            Event::Broadcast {
                message: b"u".to_vec(),
            },
        );
        for i in 0..3 {
            let (src, message) =
                timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(src, system.members[0]);
            assert_eq!(message, b"u".to_vec());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_ack_unblocks_when_detector_excludes_the_crashed() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::UniformReliableBroadcast, "AllAckUniformBroadcast");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(100),
            Interface::UniformReliableBroadcast,
            "urb",
            registry,
        );
        let crashed = system.members[2];
        system.hub.crash(crashed);
        system.inject(
            0,
            Event::Broadcast {
                message: b"u".to_vec(),
            },
        );
        // delivery has to wait for the detector to shrink `correct`
        for i in 0..2 {
            let (src, message) =
                timeout(Duration::from_secs(600), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(src, system.members[0]);
            assert_eq!(message, b"u".to_vec());
        }
    }
}
