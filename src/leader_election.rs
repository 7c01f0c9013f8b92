use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::common::{
    deserialize, digest, generate_id, hex, serialize, Address, Membership, MessageId,
};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId, Timer};
use crate::store::Store;

/// Monarchical leader election over the perfect failure detector: the
/// leader is the highest-addressed member not yet reported crashed.
/// Suspicions are permanent, so there is no restore path.
pub struct MonarchicalLeaderElection {
    upper: ModuleId,
    membership: Arc<Membership>,
    suspected: HashSet<Address>,
    leader: Option<Address>,
}

impl MonarchicalLeaderElection {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "MonarchicalLeaderElection",
            vec![Uses::of(Interface::PerfectFailureDetector, "p")],
            |seed| {
                Boot::init(MonarchicalLeaderElection {
                    upper: seed.upper,
                    membership: seed.membership,
                    suspected: HashSet::new(),
                    leader: None,
                })
            },
        )
    }

    fn elect(&mut self, ctx: &mut Context<'_>) {
        let leader = self
            .membership
            .members()
            .iter()
            .copied()
            .filter(|p| !self.suspected.contains(p))
            .max();
        if let Some(leader) = leader {
            if self.leader != Some(leader) {
                self.leader = Some(leader);
                ctx.post(self.upper, Event::Leader { leader });
            }
        }
    }
}

impl Module for MonarchicalLeaderElection {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => self.elect(ctx),
            Event::Crash { peer } => {
                self.suspected.insert(peer);
                self.elect(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// As above, but over the eventually perfect detector: reacts to both
/// suspicion and restoration and emits `Trust` on every change.
pub struct MonarchicalEventualLeaderElection {
    upper: ModuleId,
    membership: Arc<Membership>,
    suspected: HashSet<Address>,
    leader: Option<Address>,
}

impl MonarchicalEventualLeaderElection {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "MonarchicalEventualLeaderElection",
            vec![Uses::of(Interface::EventuallyPerfectFailureDetector, "p")],
            |seed| {
                Boot::init(MonarchicalEventualLeaderElection {
                    upper: seed.upper,
                    membership: seed.membership,
                    suspected: HashSet::new(),
                    leader: None,
                })
            },
        )
    }

    fn elect(&mut self, ctx: &mut Context<'_>) {
        let leader = self
            .membership
            .members()
            .iter()
            .copied()
            .filter(|p| !self.suspected.contains(p))
            .max();
        if let Some(leader) = leader {
            if self.leader != Some(leader) {
                self.leader = Some(leader);
                ctx.post(self.upper, Event::Trust { leader });
            }
        }
    }
}

impl Module for MonarchicalEventualLeaderElection {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => self.elect(ctx),
            Event::Suspect { peer } => {
                self.suspected.insert(peer);
                self.elect(ctx);
            }
            Event::Restore { peer } => {
                self.suspected.remove(&peer);
                self.elect(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EpochHeartbeat {
    msgid: MessageId,
    epoch: u64,
}

/// Eventual leader detection for the crash-recovery model, over fair-loss
/// links only. Each process persists an epoch counter bumped on every
/// recovery; the elected leader is the candidate with the fewest restarts,
/// ties broken by the highest address.
pub struct ElectLowerEpoch {
    upper: ModuleId,
    fll: ModuleId,
    membership: Arc<Membership>,
    store: Store,
    epoch: u64,
    candidates: HashMap<Address, u64>,
    leader: Option<Address>,
    delay: Duration,
}

impl ElectLowerEpoch {
    pub const DELAY: Duration = Duration::from_millis(500);

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "ElectLowerEpoch",
            vec![Uses::of(Interface::FairLossLink, "fll")],
            |seed| {
                let storeid =
                    hex(&digest(format!("{}@{}", seed.name, seed.membership.addr()).as_bytes()));
                let store = Store::new(&seed.store_dir, &storeid);
                let module = ElectLowerEpoch {
                    upper: seed.upper,
                    fll: seed.lower("fll"),
                    membership: seed.membership,
                    epoch: 0,
                    candidates: HashMap::new(),
                    leader: None,
                    delay: Self::DELAY,
                    store,
                };
                if module.store.exists() {
                    Boot::recover(module)
                } else {
                    Boot::init(module)
                }
            },
        )
    }

    fn pulse(&mut self, ctx: &mut Context<'_>) {
        for dest in self.membership.members().iter().copied() {
            ctx.post(
                self.fll,
                Event::Send {
                    dest,
                    message: serialize(&EpochHeartbeat {
                        msgid: generate_id(),
                        epoch: self.epoch,
                    }),
                },
            );
        }
        self.candidates.clear();
        ctx.set_timer(self.delay, Timer::Tick);
    }
}

/// Deterministic pick: the minimal epoch, the largest address among ties.
fn select_candidate(candidates: &HashMap<Address, u64>) -> Option<(Address, u64)> {
    let min_epoch = candidates.values().copied().min()?;
    candidates
        .iter()
        .filter(|(_, epoch)| **epoch == min_epoch)
        .map(|(addr, epoch)| (*addr, *epoch))
        .max()
}

impl Module for ElectLowerEpoch {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {
                self.epoch = 0;
                self.store.store(&self.epoch).expect("stable store write");
                self.candidates.clear();
                ctx.post(ctx.id(), Event::Recovery);
            }
            Event::Recovery => {
                let leader = self.membership.max();
                self.leader = Some(leader);
                ctx.post(self.upper, Event::Trust { leader });
                self.delay = Self::DELAY;
                self.epoch = self.store.retrieve::<u64>().expect("stable store read") + 1;
                self.store.store(&self.epoch).expect("stable store write");
                info!("{}: running with epoch {}", ctx.name(), self.epoch);
                self.pulse(ctx);
            }
            Event::Timeout(Timer::Tick) => {
                if let Some((leader, _)) = select_candidate(&self.candidates) {
                    if self.leader != Some(leader) {
                        self.leader = Some(leader);
                        self.delay += Self::DELAY;
                        info!("{}: delay increased to {:?}", ctx.name(), self.delay);
                        ctx.post(self.upper, Event::Trust { leader });
                    }
                }
                self.pulse(ctx);
            }
            Event::Deliver { src, message } => match deserialize::<EpochHeartbeat>(&message) {
                Ok(heartbeat) => {
                    self.candidates.insert(src, heartbeat.epoch);
                }
                Err(_) => debug!("{}: malformed heartbeat from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::select_candidate;
    use crate::registry::Interface;
    use crate::runtime::Event;
    use crate::simulated::System;
    use crate::tests::TRACING;

    async fn next_leader(
        mailbox: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) -> crate::common::Address {
        loop {
            match mailbox.recv().await.expect("mailbox open") {
                Event::Leader { leader } | Event::Trust { leader } => return leader,
                _ => {}
            }
        }
    }

    #[test]
    fn candidate_selection_prefers_low_epoch_then_high_address() {
        let a = "127.0.0.1:5000".parse().unwrap();
        let b = "127.0.0.1:5001".parse().unwrap();
        let c = "127.0.0.1:5002".parse().unwrap();
        let candidates = [(a, 1), (b, 3), (c, 1)].into_iter().collect();
        assert_eq!(select_candidate(&candidates), Some((c, 1)));
        let candidates = [(a, 2), (b, 1)].into_iter().collect();
        assert_eq!(select_candidate(&candidates), Some((b, 1)));
        assert_eq!(select_candidate(&Default::default()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn monarch_falls_to_next_rank_on_crash() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::LeaderElection,
            "le",
        );
        let top = system.members[2];
        for i in 0..3 {
            let leader = timeout(Duration::from_secs(60), next_leader(&mut system.mailboxes[i]))
                .await
                .unwrap();
            assert_eq!(leader, top);
        }

        system.hub.crash(top);
        for i in 0..2 {
            let leader = timeout(Duration::from_secs(600), next_leader(&mut system.mailboxes[i]))
                .await
                .unwrap();
            assert_eq!(leader, system.members[1]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn eventual_monarch_trusts_again_after_heal() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::EventualLeaderDetector,
            "omega",
        );
        let top = system.members[2];
        let leader = timeout(Duration::from_secs(60), next_leader(&mut system.mailboxes[0]))
            .await
            .unwrap();
        assert_eq!(leader, top);

        system.hub.crash(top);
        let leader = timeout(Duration::from_secs(600), next_leader(&mut system.mailboxes[0]))
            .await
            .unwrap();
        assert_eq!(leader, system.members[1]);

        system.hub.heal(top);
        let leader = timeout(Duration::from_secs(600), next_leader(&mut system.mailboxes[0]))
            .await
            .unwrap();
        assert_eq!(leader, top);
    }

    #[tokio::test(start_paused = true)]
    async fn lower_epoch_leader_survives_crash_of_current() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::EventualLeaderDetector, "ElectLowerEpoch");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(50),
            Interface::EventualLeaderDetector,
            "ele",
            registry,
        );
        let top = system.members[2];
        // everyone boots with epoch 1, so the highest address wins
        let leader = timeout(Duration::from_secs(60), next_leader(&mut system.mailboxes[0]))
            .await
            .unwrap();
        assert_eq!(leader, top);

        system.hub.crash(top);
        loop {
            let leader = timeout(Duration::from_secs(600), next_leader(&mut system.mailboxes[0]))
                .await
                .unwrap();
            if leader == system.members[1] {
                break;
            }
        }
    }
}
