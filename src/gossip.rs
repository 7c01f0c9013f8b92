use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::common::{deserialize, digest, serialize, Address, Digest, Membership, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId, Timer};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GossipMessage {
    origin: Address,
    payload: Opaque,
    rounds: u64,
}

/// Eager probabilistic (gossip) broadcast: forward to `K` random peers,
/// decrementing a rounds-to-live counter. Delivery is probabilistic; the
/// fanout and round count trade message load against the miss rate.
pub struct EagerProbabilisticBroadcast {
    upper: ModuleId,
    fll: ModuleId,
    membership: Arc<Membership>,
    delivered: HashSet<Digest>,
}

impl EagerProbabilisticBroadcast {
    pub const ROUNDS: u64 = 2;
    pub const FANOUT: usize = 3;

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "EagerProbabilisticBroadcast",
            vec![Uses::of(Interface::FairLossLink, "fll")],
            |seed| {
                Boot::init(EagerProbabilisticBroadcast {
                    upper: seed.upper,
                    fll: seed.lower("fll"),
                    membership: seed.membership,
                    delivered: HashSet::new(),
                })
            },
        )
    }
}

fn gossip(
    ctx: &mut Context<'_>,
    fll: ModuleId,
    membership: &Membership,
    fanout: usize,
    message: Opaque,
) {
    let peers: Vec<Address> = membership.peers().collect();
    let fanout = fanout.min(peers.len());
    for dest in peers.choose_multiple(&mut rand::thread_rng(), fanout) {
        ctx.post(
            fll,
            Event::Send {
                dest: *dest,
                message: message.clone(),
            },
        );
    }
}

impl Module for EagerProbabilisticBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                self.delivered.insert(digest(&message));
                let src = self.membership.addr();
                ctx.post(
                    self.upper,
                    Event::Deliver {
                        src,
                        message: message.clone(),
                    },
                );
                gossip(
                    ctx,
                    self.fll,
                    &self.membership,
                    Self::FANOUT,
                    serialize(&GossipMessage {
                        origin: src,
                        payload: message,
                        rounds: Self::ROUNDS,
                    }),
                );
            }
            Event::Deliver { src, message } => {
                let message: GossipMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                if self.delivered.insert(digest(&message.payload)) {
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src: message.origin,
                            message: message.payload.clone(),
                        },
                    );
                }
                if message.rounds > 1 {
                    gossip(
                        ctx,
                        self.fll,
                        &self.membership,
                        Self::FANOUT,
                        serialize(&GossipMessage {
                            rounds: message.rounds - 1,
                            ..message
                        }),
                    );
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LazyGossip {
    Message {
        origin: Address,
        payload: Opaque,
        sn: u64,
    },
    Request {
        origin: Address,
        sn: u64,
        dest: Address,
        rounds: u64,
    },
}

/// Lazy probabilistic broadcast: epidemic push for dissemination, then a
/// pull phase over per-origin sequence numbers. A random `alpha` share of
/// receivers stores each message to answer later pull requests; a gap that
/// recovery cannot fill is skipped after `DELTA`, so later messages from
/// the same origin still flow.
pub struct LazyProbabilisticBroadcast {
    upper: ModuleId,
    fll: ModuleId,
    upb: ModuleId,
    membership: Arc<Membership>,
    alpha: f64,
    lsn: u64,
    next: HashMap<Address, u64>,
    pending: HashMap<Address, BTreeMap<u64, Opaque>>,
    stored: HashMap<(Address, u64), Opaque>,
}

impl LazyProbabilisticBroadcast {
    pub const ALPHA: f64 = 0.5;
    pub const DELTA: Duration = Duration::from_secs(5);
    pub const ROUNDS: u64 = 2;
    pub const FANOUT: usize = 3;

    pub fn blueprint() -> Blueprint {
        Self::blueprint_with(Self::ALPHA)
    }

    /// The storing probability is a construction parameter; 0 disables the
    /// pull phase entirely, 1 makes every receiver a holder.
    pub fn blueprint_with(alpha: f64) -> Blueprint {
        Blueprint::new(
            "LazyProbabilisticBroadcast",
            vec![
                Uses::of(Interface::FairLossLink, "fll"),
                Uses::named(
                    Interface::ProbabilisticBroadcast,
                    "EagerProbabilisticBroadcast",
                    "upb",
                ),
            ],
            move |seed| {
                Boot::init(LazyProbabilisticBroadcast {
                    upper: seed.upper,
                    fll: seed.lower("fll"),
                    upb: seed.lower("upb"),
                    membership: seed.membership,
                    alpha,
                    lsn: 0,
                    next: HashMap::new(),
                    pending: HashMap::new(),
                    stored: HashMap::new(),
                })
            },
        )
    }

    fn deliver_pending(&mut self, ctx: &mut Context<'_>, origin: Address) {
        let next = self.next.entry(origin).or_insert(0);
        let pending = self.pending.entry(origin).or_default();
        while let Some(payload) = pending.remove(&*next) {
            ctx.post(
                self.upper,
                Event::Deliver {
                    src: origin,
                    message: payload,
                },
            );
            *next += 1;
        }
    }

    fn dissemination(&mut self, ctx: &mut Context<'_>, raw: Opaque, origin: Address, payload: Opaque, sn: u64) {
        if rand::thread_rng().gen::<f64>() < self.alpha {
            self.stored.insert((origin, sn), raw);
        }
        let next = *self.next.entry(origin).or_insert(0);
        if sn == next {
            self.next.insert(origin, next + 1);
            self.pending.entry(origin).or_default().remove(&sn);
            ctx.post(
                self.upper,
                Event::Deliver {
                    src: origin,
                    message: payload,
                },
            );
            self.deliver_pending(ctx, origin);
        } else if sn > next {
            self.pending.entry(origin).or_default().insert(sn, payload);
            for missing in next..sn {
                if !self.pending[&origin].contains_key(&missing) {
                    gossip(
                        ctx,
                        self.fll,
                        &self.membership,
                        Self::FANOUT,
                        serialize(&LazyGossip::Request {
                            origin,
                            sn: missing,
                            dest: self.membership.addr(),
                            rounds: Self::ROUNDS,
                        }),
                    );
                }
            }
            ctx.set_timer(Self::DELTA, Timer::Gap { origin, sn });
        }
    }

    fn recovery(&mut self, ctx: &mut Context<'_>, origin: Address, sn: u64, dest: Address, rounds: u64) {
        if let Some(raw) = self.stored.get(&(origin, sn)) {
            ctx.post(
                self.fll,
                Event::Send {
                    dest,
                    message: raw.clone(),
                },
            );
        } else if rounds > 1 {
            gossip(
                ctx,
                self.fll,
                &self.membership,
                Self::FANOUT,
                serialize(&LazyGossip::Request {
                    origin,
                    sn,
                    dest,
                    rounds: rounds - 1,
                }),
            );
        }
    }
}

impl Module for LazyProbabilisticBroadcast {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Broadcast { message } => {
                let record = serialize(&LazyGossip::Message {
                    origin: self.membership.addr(),
                    payload: message,
                    sn: self.lsn,
                });
                self.lsn += 1;
                ctx.post(self.upb, Event::Broadcast { message: record });
            }
            // both the dissemination child and direct fair-loss recovery
            // sends surface here
            Event::Deliver { src, message } => match deserialize::<LazyGossip>(&message) {
                Ok(LazyGossip::Message { origin, payload, sn }) => {
                    self.dissemination(ctx, message, origin, payload, sn)
                }
                Ok(LazyGossip::Request {
                    origin,
                    sn,
                    dest,
                    rounds,
                }) => self.recovery(ctx, origin, sn, dest, rounds),
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Timeout(Timer::Gap { origin, sn }) => {
                if sn > *self.next.entry(origin).or_insert(0) {
                    self.next.insert(origin, sn);
                    info!("{}: skip ahead to {} for {}", ctx.name(), sn, origin);
                    self.deliver_pending(ctx, origin);
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::registry::Interface;
    use crate::runtime::Event;
    use crate::simulated::{delivered, System};
    use crate::tests::TRACING;

    #[tokio::test(start_paused = true)]
    async fn eager_full_fanout_reaches_everyone() {
        *TRACING;
        // 4 members: the fanout of 3 covers every peer in the first hop
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::ProbabilisticBroadcast, "EagerProbabilisticBroadcast");
            registry
        };
        let mut system = System::launch_with(
            4,
            Duration::from_millis(100),
            Interface::ProbabilisticBroadcast,
            "pb",
            registry,
        );
        system.inject(
            0,
            Event::Broadcast {
                message: b"gossip".to_vec(),
            },
        );
        for i in 0..4 {
            let (src, message) =
                timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(src, system.members[0]);
            assert_eq!(message, b"gossip".to_vec());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_pull_phase_recovers_a_missed_message() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.replace(
                Interface::ProbabilisticBroadcast,
                super::LazyProbabilisticBroadcast::blueprint_with(1.0),
            );
            registry
        };
        let mut system = System::launch_with(
            4,
            Duration::from_millis(50),
            Interface::ProbabilisticBroadcast,
            "pb",
            registry,
        );
        let loner = system.members[2];

        // the third process misses the first broadcast entirely
        system.hub.crash(loner);
        system.inject(
            0,
            Event::Broadcast {
                message: b"first".to_vec(),
            },
        );
        for i in [0, 1, 3] {
            let (_, message) =
                timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                    .await
                    .unwrap();
            assert_eq!(message, b"first".to_vec());
        }
        sleep(Duration::from_secs(10)).await;
        system.hub.heal(loner);

        // the second broadcast exposes the gap; with every receiver
        // storing, the pull succeeds and order is restored
        system.inject(
            0,
            Event::Broadcast {
                message: b"second".to_vec(),
            },
        );
        let (_, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(message, b"first".to_vec());
        let (_, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(message, b"second".to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn lazy_skips_ahead_when_recovery_cannot_help() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.replace(
                Interface::ProbabilisticBroadcast,
                super::LazyProbabilisticBroadcast::blueprint_with(0.0),
            );
            registry
        };
        let mut system = System::launch_with(
            4,
            Duration::from_millis(50),
            Interface::ProbabilisticBroadcast,
            "pb",
            registry,
        );
        let loner = system.members[2];

        system.hub.crash(loner);
        system.inject(
            0,
            Event::Broadcast {
                message: b"lost".to_vec(),
            },
        );
        for i in [0, 1, 3] {
            timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[i]))
                .await
                .unwrap();
        }
        sleep(Duration::from_secs(10)).await;
        system.hub.heal(loner);

        system.inject(
            0,
            Event::Broadcast {
                message: b"after".to_vec(),
            },
        );
        // nobody stored the first message; after DELTA the gap is skipped
        let (_, message) = timeout(Duration::from_secs(120), delivered(&mut system.mailboxes[2]))
            .await
            .unwrap();
        assert_eq!(message, b"after".to_vec());
    }
}
