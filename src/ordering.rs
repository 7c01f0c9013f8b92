use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::common::{deserialize, digest, serialize, Address, Digest, Membership, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FifoBroadcastMessage {
    sn: u64,
    origin: Address,
    data: Opaque,
}

/// FIFO-order reliable broadcast: per-origin sequence numbers over
/// reliable broadcast, contiguous prefixes surfaced in order.
pub struct BroadcastWithSequenceNumber {
    upper: ModuleId,
    rb: ModuleId,
    membership: Arc<Membership>,
    lsn: u64,
    pending: HashMap<Address, BTreeMap<u64, Opaque>>,
    next: HashMap<Address, u64>,
}

impl BroadcastWithSequenceNumber {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "BroadcastWithSequenceNumber",
            vec![Uses::of(Interface::ReliableBroadcast, "rb")],
            |seed| {
                Boot::init(BroadcastWithSequenceNumber {
                    upper: seed.upper,
                    rb: seed.lower("rb"),
                    membership: seed.membership,
                    lsn: 0,
                    pending: HashMap::new(),
                    next: HashMap::new(),
                })
            },
        )
    }
}

impl Module for BroadcastWithSequenceNumber {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let record = serialize(&FifoBroadcastMessage {
                    sn: self.lsn,
                    origin: self.membership.addr(),
                    data: message,
                });
                self.lsn += 1;
                ctx.post(self.rb, Event::Broadcast { message: record });
            }
            Event::Deliver { src, message } => {
                let message: FifoBroadcastMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                let origin = message.origin;
                self.pending
                    .entry(origin)
                    .or_default()
                    .insert(message.sn, message.data);
                let next = self.next.entry(origin).or_insert(0);
                let pending = self.pending.get_mut(&origin).unwrap();
                while let Some(data) = pending.remove(&*next) {
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src: origin,
                            message: data,
                        },
                    );
                    *next += 1;
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CausalMessage {
    past: Vec<(Address, Digest, Opaque)>,
    data: Opaque,
}

/// No-waiting causal broadcast: each message drags along the ordered past
/// of its sender, and a receiver first delivers whatever it has not seen
/// from that past. Nothing is ever delayed; the past grows without bound
/// (garbage collecting it is out of scope here).
pub struct NoWaitingCausalBroadcast {
    upper: ModuleId,
    rb: ModuleId,
    membership: Arc<Membership>,
    delivered: HashSet<Digest>,
    past: Vec<(Address, Digest, Opaque)>,
    past_keys: HashSet<(Address, Digest)>,
}

impl NoWaitingCausalBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "NoWaitingCausalBroadcast",
            vec![Uses::of(Interface::ReliableBroadcast, "rb")],
            |seed| {
                Boot::init(NoWaitingCausalBroadcast {
                    upper: seed.upper,
                    rb: seed.lower("rb"),
                    membership: seed.membership,
                    delivered: HashSet::new(),
                    past: Vec::new(),
                    past_keys: HashSet::new(),
                })
            },
        )
    }

    fn record_past(&mut self, origin: Address, hash: Digest, data: Opaque) {
        if self.past_keys.insert((origin, hash)) {
            self.past.push((origin, hash, data));
        }
    }
}

impl Module for NoWaitingCausalBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let record = serialize(&CausalMessage {
                    past: self.past.clone(),
                    data: message.clone(),
                });
                ctx.post(self.rb, Event::Broadcast { message: record });
                let addr = self.membership.addr();
                let hash = digest(&message);
                self.record_past(addr, hash, message);
            }
            Event::Deliver { src, message } => {
                let message: CausalMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                let hash = digest(&message.data);
                if self.delivered.contains(&hash) {
                    return;
                }
                for (origin, past_hash, data) in message.past {
                    if self.delivered.insert(past_hash) {
                        ctx.post(
                            self.upper,
                            Event::Deliver {
                                src: origin,
                                message: data.clone(),
                            },
                        );
                        self.record_past(origin, past_hash, data);
                    }
                }
                self.delivered.insert(hash);
                self.record_past(src, hash, message.data.clone());
                ctx.post(
                    self.upper,
                    Event::Deliver {
                        src,
                        message: message.data,
                    },
                );
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClockMessage {
    clock: Vec<u64>,
    data: Opaque,
}

/// Waiting causal broadcast over vector clocks: a message is buffered
/// until its attached clock is dominated by the local one.
pub struct WaitingCausalBroadcast {
    upper: ModuleId,
    rb: ModuleId,
    membership: Arc<Membership>,
    clock: Vec<u64>,
    lsn: u64,
    pending: Vec<(Vec<u64>, Opaque, Address)>,
}

impl WaitingCausalBroadcast {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "WaitingCausalBroadcast",
            vec![Uses::of(Interface::ReliableBroadcast, "rb")],
            |seed| {
                let n = seed.membership.n();
                Boot::init(WaitingCausalBroadcast {
                    upper: seed.upper,
                    rb: seed.lower("rb"),
                    membership: seed.membership,
                    clock: vec![0; n],
                    lsn: 0,
                    pending: Vec::new(),
                })
            },
        )
    }
}

fn dominated(clock: &[u64], by: &[u64]) -> bool {
    clock.iter().zip(by).all(|(w, v)| w <= v)
}

impl Module for WaitingCausalBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let mut clock = self.clock.clone();
                clock[self.membership.self_rank()] = self.lsn;
                self.lsn += 1;
                ctx.post(
                    self.rb,
                    Event::Broadcast {
                        message: serialize(&ClockMessage {
                            clock,
                            data: message,
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => {
                let message: ClockMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                self.pending.push((message.clock, message.data, src));
                loop {
                    let position = self
                        .pending
                        .iter()
                        .position(|(clock, _, _)| dominated(clock, &self.clock));
                    let (_, data, sender) = match position {
                        Some(position) => self.pending.swap_remove(position),
                        None => break,
                    };
                    self.clock[self.membership.rank(sender)] += 1;
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src: sender,
                            message: data,
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
    async fn fifo_broadcast_preserves_sender_order_under_jitter() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(500),
            Interface::FifoReliableBroadcast,
            "frb",
        );
        for i in 0..5u8 {
            system.inject(
                0,
                Event::Broadcast {
                    message: vec![i],
                },
            );
        }
        for mailbox in &mut system.mailboxes {
            for i in 0..5u8 {
                let (src, message) = timeout(Duration::from_secs(120), delivered(mailbox))
                    .await
                    .unwrap();
                assert_eq!(src, system.members[0]);
                assert_eq!(message, vec![i]);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn no_waiting_causal_carries_the_past() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::CausalOrderBroadcast,
            "crb",
        );
        let (a, c) = (system.members[0], system.members[2]);
        // the third process cannot hear the first directly
        system.hub.cut(a, c);

        system.inject(
            0,
            Event::Broadcast {
                message: b"m1".to_vec(),
            },
        );
        let (_, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(message, b"m1".to_vec());

        // the second process broadcasts causally after m1; its past makes
        // the third deliver m1 first
        system.inject(
            1,
            Event::Broadcast {
                message: b"m2".to_vec(),
            },
        );
        let (src, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(src, a);
        assert_eq!(message, b"m1".to_vec());
        let (src, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(src, system.members[1]);
        assert_eq!(message, b"m2".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn vector_clocks_hold_back_the_future() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::CausalOrderBroadcast, "WaitingCausalBroadcast");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(100),
            Interface::CausalOrderBroadcast,
            "crb",
            registry,
        );
        let (a, c) = (system.members[0], system.members[2]);
        system.hub.cut(a, c);

        system.inject(
            0,
            Event::Broadcast {
                message: b"m1".to_vec(),
            },
        );
        let (_, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(message, b"m1".to_vec());
        system.inject(
            1,
            Event::Broadcast {
                message: b"m2".to_vec(),
            },
        );

        // m2 waits at the third process; the stubborn link pushes m1
        // through once the link heals, unblocking both in causal order
        tokio::time::sleep(Duration::from_secs(30)).await;
        system.hub.uncut(a, c);
        let (src, message) = timeout(Duration::from_secs(120), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(src, a);
        assert_eq!(message, b"m1".to_vec());
        let (src, message) = timeout(Duration::from_secs(120), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(src, system.members[1]);
        assert_eq!(message, b"m2".to_vec());
    }
}
