use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{deserialize, generate_id, serialize, Address, Membership, MessageId};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId, Timer};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HeartbeatMessage {
    Request { mid: MessageId },
    Reply { mid: MessageId },
}

/// Perfect failure detector under the synchronous assumption: a peer that
/// misses a whole heartbeat period is crashed. Strong completeness and
/// strong accuracy as long as the period exceeds the worst round trip.
pub struct ExcludeOnTimeout {
    upper: ModuleId,
    pl: ModuleId,
    membership: Arc<Membership>,
    alive: HashSet<Address>,
    detected: HashSet<Address>,
}

impl ExcludeOnTimeout {
    pub const TIMEOUT: Duration = Duration::from_secs(10);

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "ExcludeOnTimeout",
            vec![Uses::of(Interface::PerfectLink, "pl")],
            |seed| {
                Boot::init(ExcludeOnTimeout {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    alive: seed.membership.peers().collect(),
                    membership: seed.membership,
                    detected: HashSet::new(),
                })
            },
        )
    }
}

impl Module for ExcludeOnTimeout {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => ctx.set_timer(Self::TIMEOUT, Timer::Tick),
            Event::Timeout(Timer::Tick) => {
                for peer in self.membership.peers() {
                    if !self.alive.contains(&peer) && !self.detected.contains(&peer) {
                        self.detected.insert(peer);
                        ctx.post(self.upper, Event::Crash { peer });
                    }
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest: peer,
                            message: serialize(&HeartbeatMessage::Request { mid: generate_id() }),
                        },
                    );
                }
                self.alive.clear();
                ctx.set_timer(Self::TIMEOUT, Timer::Tick);
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(HeartbeatMessage::Request { .. }) => ctx.post(
                    self.pl,
                    Event::Send {
                        dest: src,
                        message: serialize(&HeartbeatMessage::Reply { mid: generate_id() }),
                    },
                ),
                Ok(HeartbeatMessage::Reply { .. }) => {
                    self.alive.insert(src);
                }
                Err(_) => debug!("{}: malformed heartbeat from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Heartbeat {
    heartbeat: MessageId,
}

/// Eventually perfect failure detector: suspicions are revocable and every
/// false suspicion stretches the period, so after some global
/// stabilization time the suspected set settles on the actually crashed.
pub struct IncreasingTimeout {
    upper: ModuleId,
    pl: ModuleId,
    membership: Arc<Membership>,
    alive: HashSet<Address>,
    suspected: HashSet<Address>,
    delay: Duration,
}

impl IncreasingTimeout {
    pub const DELAY: Duration = Duration::from_secs(4);

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "IncreasingTimeout",
            vec![Uses::of(Interface::PerfectLink, "pl")],
            |seed| {
                Boot::init(IncreasingTimeout {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    alive: seed.membership.peers().collect(),
                    membership: seed.membership,
                    suspected: HashSet::new(),
                    delay: Self::DELAY,
                })
            },
        )
    }
}

impl Module for IncreasingTimeout {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => ctx.set_timer(self.delay, Timer::Tick),
            Event::Timeout(Timer::Tick) => {
                if !self.alive.is_disjoint(&self.suspected) {
                    self.delay += Self::DELAY;
                    info!(
                        "{}: wrong suspicion, delay increased to {:?}",
                        ctx.name(),
                        self.delay
                    );
                }
                for peer in self.membership.peers() {
                    if !self.alive.contains(&peer) && !self.suspected.contains(&peer) {
                        self.suspected.insert(peer);
                        ctx.post(self.upper, Event::Suspect { peer });
                    } else if self.alive.contains(&peer) && self.suspected.contains(&peer) {
                        self.suspected.remove(&peer);
                        ctx.post(self.upper, Event::Restore { peer });
                    }
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest: peer,
                            message: serialize(&Heartbeat {
                                heartbeat: generate_id(),
                            }),
                        },
                    );
                }
                self.alive.clear();
                ctx.set_timer(self.delay, Timer::Tick);
            }
            // any response counts as a liveness proof
            Event::Deliver { src, message: _ } => {
                self.alive.insert(src);
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
    use crate::simulated::System;
    use crate::tests::TRACING;

    async fn next_crash(
        mailbox: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) -> crate::common::Address {
        loop {
            match mailbox.recv().await.expect("mailbox open") {
                Event::Crash { peer } => return peer,
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn perfect_detects_only_the_crashed() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::PerfectFailureDetector,
            "p",
        );
        let crashed = system.members[2];
        system.hub.crash(crashed);

        for i in 0..2 {
            let peer = timeout(Duration::from_secs(600), next_crash(&mut system.mailboxes[i]))
                .await
                .unwrap();
            assert_eq!(peer, crashed);
        }
        // strong accuracy: nobody else is ever reported
        for i in 0..2 {
            assert!(timeout(
                Duration::from_secs(120),
                next_crash(&mut system.mailboxes[i])
            )
            .await
            .is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_perfect_revokes_wrong_suspicion() {
        *TRACING;
        let mut system = System::launch(
            2,
            Duration::from_millis(100),
            Interface::EventuallyPerfectFailureDetector,
            "ep",
        );
        let other = system.members[1];
        system.hub.crash(other);

        loop {
            match timeout(Duration::from_secs(600), system.mailboxes[0].recv())
                .await
                .unwrap()
                .unwrap()
            {
                Event::Suspect { peer } => {
                    assert_eq!(peer, other);
                    break;
                }
                _ => {}
            }
        }

        system.hub.heal(other);
        loop {
            match timeout(Duration::from_secs(600), system.mailboxes[0].recv())
                .await
                .unwrap()
                .unwrap()
            {
                Event::Restore { peer } => {
                    assert_eq!(peer, other);
                    break;
                }
                _ => {}
            }
        }
    }
}
