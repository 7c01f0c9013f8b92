use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{deserialize, serialize, Address, Membership, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FloodingMessage {
    Proposal {
        round: u64,
        proposals: BTreeSet<Opaque>,
    },
    Decided {
        decision: Opaque,
    },
}

/// Flooding consensus (regular): proposal sets flood the system; a round
/// completes at a process once every not-yet-crashed process contributed,
/// and a quiescent round (no newly observed crash) decides the minimal
/// value in the set.
pub struct FloodingConsensus {
    upper: ModuleId,
    beb: ModuleId,
    correct: HashSet<Address>,
    round: u64,
    decision: Option<Opaque>,
    proposals: HashMap<u64, BTreeSet<Opaque>>,
    receivedfrom: HashMap<u64, HashSet<Address>>,
}

impl FloodingConsensus {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "FloodingConsensus",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                let members: HashSet<_> = seed.membership.members().iter().copied().collect();
                let mut receivedfrom = HashMap::new();
                receivedfrom.insert(0, members.clone());
                Boot::init(FloodingConsensus {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    correct: members,
                    round: 1,
                    decision: None,
                    proposals: HashMap::new(),
                    receivedfrom,
                })
            },
        )
    }

    fn try_to_decide(&mut self, ctx: &mut Context<'_>) {
        if self.decision.is_some() {
            return;
        }
        let current = self.receivedfrom.entry(self.round).or_default().clone();
        if !self.correct.iter().all(|p| current.contains(p)) {
            return;
        }
        if current == *self.receivedfrom.entry(self.round - 1).or_default() {
            // a quiescent round saw every proposal any correct process can
            // ever relay; the minimal value is the deterministic tie-break
            let decision = self
                .proposals
                .entry(self.round)
                .or_default()
                .iter()
                .next()
                .cloned()
                .expect("complete round carries proposals");
            self.decide(ctx, decision);
        } else {
            self.round += 1;
            let proposals = self.proposals.entry(self.round - 1).or_default().clone();
            info!("{}: moving to round {}", ctx.name(), self.round);
            ctx.post(
                self.beb,
                Event::Broadcast {
                    message: serialize(&FloodingMessage::Proposal {
                        round: self.round,
                        proposals,
                    }),
                },
            );
        }
    }

    fn decide(&mut self, ctx: &mut Context<'_>, decision: Opaque) {
        info!("{}: decided in round {}", ctx.name(), self.round);
        self.decision = Some(decision.clone());
        ctx.post(
            self.beb,
            Event::Broadcast {
                message: serialize(&FloodingMessage::Decided {
                    decision: decision.clone(),
                }),
            },
        );
        ctx.post(self.upper, Event::Decide { value: decision });
    }
}

impl Module for FloodingConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Propose { value } => {
                self.proposals.entry(1).or_default().insert(value);
                let proposals = self.proposals[&1].clone();
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&FloodingMessage::Proposal {
                            round: 1,
                            proposals,
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(FloodingMessage::Proposal { round, proposals }) => {
                    self.receivedfrom.entry(round).or_default().insert(src);
                    self.proposals.entry(round).or_default().extend(proposals);
                    self.try_to_decide(ctx);
                }
                Ok(FloodingMessage::Decided { decision }) => {
                    if self.decision.is_none() && self.correct.contains(&src) {
                        self.decide(ctx, decision);
                    }
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Crash { peer } => {
                info!("{}: {} crashed", ctx.name(), peer);
                self.correct.remove(&peer);
                self.try_to_decide(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HierarchicalMessage {
    Decided { proposal: Opaque },
}

/// Hierarchical consensus: rounds walk the rank order; the round-r leader
/// (rank r-1) imposes its current proposal, lower processes adopt what
/// more important ones decided before them.
pub struct HierarchicalConsensus {
    upper: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    detectedranks: HashSet<usize>,
    delivered: HashSet<usize>,
    round: u64,
    proposal: Option<Opaque>,
    proposer: Option<usize>,
    broadcast: bool,
}

impl HierarchicalConsensus {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "HierarchicalConsensus",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(HierarchicalConsensus {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    membership: seed.membership,
                    detectedranks: HashSet::new(),
                    delivered: HashSet::new(),
                    round: 1,
                    proposal: None,
                    proposer: None,
                    broadcast: false,
                })
            },
        )
    }

    fn leader_rank(&self) -> usize {
        self.round as usize - 1
    }

    fn advance(&mut self, ctx: &mut Context<'_>) {
        while self.round <= self.membership.n() as u64
            && (self.detectedranks.contains(&self.leader_rank())
                || self.delivered.contains(&self.leader_rank()))
        {
            self.round += 1;
        }
        self.try_to_decide(ctx);
    }

    fn try_to_decide(&mut self, ctx: &mut Context<'_>) {
        if self.round <= self.membership.n() as u64
            && self.leader_rank() == self.membership.self_rank()
            && self.proposal.is_some()
            && !self.broadcast
        {
            self.broadcast = true;
            let proposal = self.proposal.clone().unwrap();
            ctx.post(
                self.beb,
                Event::Broadcast {
                    message: serialize(&HierarchicalMessage::Decided {
                        proposal: proposal.clone(),
                    }),
                },
            );
            ctx.post(self.upper, Event::Decide { value: proposal });
        }
    }
}

impl Module for HierarchicalConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Propose { value } => {
                if self.proposal.is_none() {
                    self.proposal = Some(value);
                }
                self.try_to_decide(ctx);
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(HierarchicalMessage::Decided { proposal }) => {
                    let rank = self.membership.rank(src);
                    if rank < self.membership.self_rank()
                        && self.proposer.map_or(true, |adopted| rank > adopted)
                    {
                        self.proposal = Some(proposal);
                        self.proposer = Some(rank);
                    }
                    self.delivered.insert(rank);
                    self.advance(ctx);
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Crash { peer } => {
                info!("{}: {} crashed", ctx.name(), peer);
                self.detectedranks.insert(self.membership.rank(peer));
                self.advance(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum FloodingUniformMessage {
    Proposal {
        round: u64,
        proposals: BTreeSet<Opaque>,
    },
}

/// Flooding uniform consensus: always runs N rounds and only decides in
/// the last, which tolerates one crash per round without an early decision
/// leaking out.
pub struct FloodingUniformConsensus {
    upper: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    correct: HashSet<Address>,
    round: u64,
    decision: Option<Opaque>,
    proposalset: BTreeSet<Opaque>,
    receivedfrom: HashMap<u64, HashSet<Address>>,
}

impl FloodingUniformConsensus {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "FloodingUniformConsensus",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(FloodingUniformConsensus {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    correct: seed.membership.members().iter().copied().collect(),
                    membership: seed.membership,
                    round: 1,
                    decision: None,
                    proposalset: BTreeSet::new(),
                    receivedfrom: HashMap::new(),
                })
            },
        )
    }

    fn check(&mut self, ctx: &mut Context<'_>) {
        loop {
            if self.decision.is_some() {
                return;
            }
            let current = self.receivedfrom.entry(self.round).or_default();
            if !self.correct.iter().all(|p| current.contains(p)) {
                return;
            }
            if self.round == self.membership.n() as u64 {
                let decision = self
                    .proposalset
                    .iter()
                    .next()
                    .cloned()
                    .expect("complete final round carries proposals");
                info!("{}: decided after {} rounds", ctx.name(), self.round);
                self.decision = Some(decision.clone());
                ctx.post(self.upper, Event::Decide { value: decision });
                return;
            }
            self.round += 1;
            ctx.post(
                self.beb,
                Event::Broadcast {
                    message: serialize(&FloodingUniformMessage::Proposal {
                        round: self.round,
                        proposals: self.proposalset.clone(),
                    }),
                },
            );
        }
    }
}

impl Module for FloodingUniformConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Propose { value } => {
                self.proposalset.insert(value);
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&FloodingUniformMessage::Proposal {
                            round: 1,
                            proposals: self.proposalset.clone(),
                        }),
                    },
                );
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(FloodingUniformMessage::Proposal { round, proposals }) => {
                    self.receivedfrom.entry(round).or_default().insert(src);
                    self.proposalset.extend(proposals);
                    self.check(ctx);
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Crash { peer } => {
                info!("{}: {} crashed", ctx.name(), peer);
                self.correct.remove(&peer);
                self.check(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum HucMessage {
    Proposal { proposal: Opaque },
    Ack,
    Decided { decision: Opaque },
}

/// Hierarchical uniform consensus: the round leader imposes its proposal
/// and collects acks from everyone not detected as crashed; the decision
/// travels by reliable broadcast so it survives the leader.
pub struct HierarchicalUniformConsensus {
    upper: ModuleId,
    pl: ModuleId,
    beb: ModuleId,
    rb: ModuleId,
    membership: Arc<Membership>,
    detectedranks: HashSet<usize>,
    ackranks: HashSet<usize>,
    round: u64,
    proposal: Option<Opaque>,
    decision: Option<Opaque>,
    proposed: HashMap<usize, Opaque>,
    proposal_sent: bool,
    decided_sent: bool,
}

impl HierarchicalUniformConsensus {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "HierarchicalUniformConsensus",
            vec![
                Uses::of(Interface::PerfectLink, "pl"),
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::ReliableBroadcast, "rb"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(HierarchicalUniformConsensus {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    beb: seed.lower("beb"),
                    rb: seed.lower("rb"),
                    membership: seed.membership,
                    detectedranks: HashSet::new(),
                    ackranks: HashSet::new(),
                    round: 1,
                    proposal: None,
                    decision: None,
                    proposed: HashMap::new(),
                    proposal_sent: false,
                    decided_sent: false,
                })
            },
        )
    }

    fn leader_rank(&self) -> usize {
        self.round as usize - 1
    }

    fn try_to_propose(&mut self, ctx: &mut Context<'_>) {
        if self.round <= self.membership.n() as u64
            && self.leader_rank() == self.membership.self_rank()
            && self.proposal.is_some()
            && self.decision.is_none()
            && !self.proposal_sent
        {
            self.proposal_sent = true;
            ctx.post(
                self.beb,
                Event::Broadcast {
                    message: serialize(&HucMessage::Proposal {
                        proposal: self.proposal.clone().unwrap(),
                    }),
                },
            );
        }
    }

    fn round_up(&mut self, ctx: &mut Context<'_>) {
        while self.round <= self.membership.n() as u64
            && self.detectedranks.contains(&self.leader_rank())
        {
            if let Some(adopted) = self.proposed.get(&self.leader_rank()) {
                self.proposal = Some(adopted.clone());
            }
            self.round += 1;
        }
        self.try_to_propose(ctx);
    }

    fn try_to_decide(&mut self, ctx: &mut Context<'_>) {
        let covered = self.detectedranks.union(&self.ackranks).count();
        if !self.decided_sent && self.decision.is_none() && covered == self.membership.n() {
            self.decided_sent = true;
            ctx.post(
                self.rb,
                Event::Broadcast {
                    message: serialize(&HucMessage::Decided {
                        decision: self.proposal.clone().expect("acked proposal"),
                    }),
                },
            );
        }
    }
}

impl Module for HierarchicalUniformConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Propose { value } => {
                if self.proposal.is_none() {
                    self.proposal = Some(value);
                }
                self.try_to_propose(ctx);
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(HucMessage::Proposal { proposal }) => {
                    let rank = self.membership.rank(src);
                    self.proposed.insert(rank, proposal);
                    if rank + 1 >= self.round as usize {
                        ctx.post(
                            self.pl,
                            Event::Send {
                                dest: src,
                                message: serialize(&HucMessage::Ack),
                            },
                        );
                    }
                    self.round_up(ctx);
                }
                Ok(HucMessage::Ack) => {
                    self.ackranks.insert(self.membership.rank(src));
                    self.try_to_decide(ctx);
                }
                Ok(HucMessage::Decided { decision }) => {
                    if self.decision.is_none() {
                        self.decision = Some(decision.clone());
                        ctx.post(self.upper, Event::Decide { value: decision });
                    }
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Crash { peer } => {
                info!("{}: {} crashed", ctx.name(), peer);
                self.detectedranks.insert(self.membership.rank(peer));
                self.round_up(ctx);
                self.try_to_decide(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EpochChangeMessage {
    NewEpoch { ts: u64 },
    Nack,
}

/// Leader-based epoch change: whenever the eventual leader detector speaks,
/// the trusted process stamps a fresh epoch `rank + k*N`, globally unique
/// per leader. Receivers only start epochs from the process they currently
/// trust, with strictly increasing timestamps; everything else is nacked
/// so the leader can try a higher stamp.
pub struct LeaderBasedEpochChange {
    upper: ModuleId,
    pl: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    trusted: Option<Address>,
    lastts: u64,
    ts: u64,
}

impl LeaderBasedEpochChange {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "LeaderBasedEpochChange",
            vec![
                Uses::of(Interface::PerfectLink, "pl"),
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::EventualLeaderDetector, "o"),
            ],
            |seed| {
                let ts = seed.membership.self_rank() as u64;
                Boot::init(LeaderBasedEpochChange {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    beb: seed.lower("beb"),
                    membership: seed.membership,
                    trusted: None,
                    lastts: 0,
                    ts,
                })
            },
        )
    }

    fn new_epoch(&mut self, ctx: &mut Context<'_>) {
        self.ts += self.membership.n() as u64;
        ctx.post(
            self.beb,
            Event::Broadcast {
                message: serialize(&EpochChangeMessage::NewEpoch { ts: self.ts }),
            },
        );
    }
}

impl Module for LeaderBasedEpochChange {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Trust { leader } => {
                self.trusted = Some(leader);
                if leader == self.membership.addr() {
                    self.new_epoch(ctx);
                }
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(EpochChangeMessage::NewEpoch { ts }) => {
                    if Some(src) == self.trusted && ts > self.lastts {
                        self.lastts = ts;
                        ctx.post(self.upper, Event::StartEpoch { ts, leader: src });
                    } else {
                        ctx.post(
                            self.pl,
                            Event::Send {
                                dest: src,
                                message: serialize(&EpochChangeMessage::Nack),
                            },
                        );
                    }
                }
                Ok(EpochChangeMessage::Nack) => {
                    if self.trusted == Some(self.membership.addr()) {
                        self.new_epoch(ctx);
                    }
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EpochConsensusMessage {
    Read,
    State { ts: u64, val: Option<Opaque> },
    Write { ts: u64, val: Opaque },
    Accept,
    Decided { val: Opaque },
}

/// Single-shot epoch consensus (read/write): the epoch leader reads a
/// majority of states, adopts the highest timestamped value if any, writes
/// it with its own epoch timestamp, and declares it decided once a
/// majority accepted. An aborted instance reports its state and goes
/// silent; its successor inherits the state.
pub struct ReadWriteEpochConsensus {
    upper: ModuleId,
    pl: ModuleId,
    beb: ModuleId,
    membership: Arc<Membership>,
    ets: u64,
    valts: u64,
    val: Option<Opaque>,
    tmpval: Option<Opaque>,
    states: HashMap<Address, (u64, Option<Opaque>)>,
    accepted: usize,
    halted: bool,
}

impl ReadWriteEpochConsensus {
    pub fn blueprint() -> Blueprint {
        Self::blueprint_with(0, 0, None)
    }

    /// An instance for epoch `ets`, seeded with the state an earlier epoch
    /// reported on abort.
    pub fn blueprint_with(ets: u64, valts: u64, val: Option<Opaque>) -> Blueprint {
        Blueprint::new(
            "ReadWriteEpochConsensus",
            vec![
                Uses::of(Interface::PerfectLink, "pl"),
                Uses::of(Interface::BestEffortBroadcast, "beb"),
            ],
            move |seed| {
                Boot::init(ReadWriteEpochConsensus {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    beb: seed.lower("beb"),
                    membership: seed.membership,
                    ets,
                    valts,
                    val: val.clone(),
                    tmpval: None,
                    states: HashMap::new(),
                    accepted: 0,
                    halted: false,
                })
            },
        )
    }

    fn check_to_write(&mut self, ctx: &mut Context<'_>) {
        if !self.membership.majority(self.states.len()) {
            return;
        }
        let highest = self
            .states
            .values()
            .max()
            .cloned()
            .expect("majority of states collected");
        if let (_, Some(val)) = highest {
            self.tmpval = Some(val);
        }
        self.states.clear();
        ctx.post(
            self.beb,
            Event::Broadcast {
                message: serialize(&EpochConsensusMessage::Write {
                    ts: self.ets,
                    val: self.tmpval.clone().expect("leader proposed"),
                }),
            },
        );
    }
}

impl Module for ReadWriteEpochConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        if self.halted {
            debug!("{}: halted, ignoring {:?}", ctx.name(), event);
            return;
        }
        match event {
            Event::Init => {}
            // only the epoch leader proposes
            Event::Propose { value } => {
                self.tmpval = Some(value);
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&EpochConsensusMessage::Read),
                    },
                );
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(EpochConsensusMessage::Read) => ctx.post(
                    self.pl,
                    Event::Send {
                        dest: src,
                        message: serialize(&EpochConsensusMessage::State {
                            ts: self.valts,
                            val: self.val.clone(),
                        }),
                    },
                ),
                Ok(EpochConsensusMessage::State { ts, val }) => {
                    self.states.insert(src, (ts, val));
                    self.check_to_write(ctx);
                }
                Ok(EpochConsensusMessage::Write { ts, val }) => {
                    self.valts = ts;
                    self.val = Some(val);
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest: src,
                            message: serialize(&EpochConsensusMessage::Accept),
                        },
                    );
                }
                Ok(EpochConsensusMessage::Accept) => {
                    self.accepted += 1;
                    if self.membership.majority(self.accepted) {
                        self.accepted = 0;
                        ctx.post(
                            self.beb,
                            Event::Broadcast {
                                message: serialize(&EpochConsensusMessage::Decided {
                                    val: self.tmpval.clone().expect("leader proposed"),
                                }),
                            },
                        );
                    }
                }
                Ok(EpochConsensusMessage::Decided { val }) => {
                    ctx.post(self.upper, Event::Decide { value: val });
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Abort => {
                ctx.post(
                    self.upper,
                    Event::Aborted {
                        ts: self.valts,
                        value: self.val.clone(),
                    },
                );
                self.halted = true;
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// Leader-driven (uniform) consensus: one epoch-change stream and one
/// epoch-consensus instance per started epoch. Each `StartEpoch` aborts
/// the running instance; the state it reports seeds the next instance,
/// named by the globally agreed epoch timestamp. The first decision of
/// any epoch is the decision.
pub struct LeaderDrivenConsensus {
    upper: ModuleId,
    membership: Arc<Membership>,
    val: Option<Opaque>,
    proposed: bool,
    decided: bool,
    ets: u64,
    leader: Address,
    instance: Option<ModuleId>,
    newts: u64,
    newleader: Address,
}

impl LeaderDrivenConsensus {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "LeaderDrivenConsensus",
            vec![Uses::of(Interface::EpochChange, "ec")],
            |seed| {
                let leader = seed.membership.max();
                Boot::init(LeaderDrivenConsensus {
                    upper: seed.upper,
                    membership: seed.membership,
                    val: None,
                    proposed: false,
                    decided: false,
                    ets: 0,
                    leader,
                    instance: None,
                    newts: 0,
                    newleader: leader,
                })
            },
        )
    }

    fn start_instance(&mut self, ctx: &mut Context<'_>, valts: u64, val: Option<Opaque>) {
        let name = format!("{}.ep{}", ctx.name(), self.ets);
        let instance = ctx.build_with(
            &ReadWriteEpochConsensus::blueprint_with(self.ets, valts, val),
            &name,
            ctx.id(),
        );
        self.instance = Some(instance);
        self.maybe_propose(ctx);
    }

    fn maybe_propose(&mut self, ctx: &mut Context<'_>) {
        if self.leader == self.membership.addr() && self.val.is_some() && !self.proposed {
            self.proposed = true;
            ctx.post(
                self.instance.expect("instance started"),
                Event::Propose {
                    value: self.val.clone().unwrap(),
                },
            );
        }
    }
}

impl Module for LeaderDrivenConsensus {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {
                // a default epoch 0 with the highest-ranked leader is
                // assumed active everywhere at startup
                self.start_instance(ctx, 0, None);
            }
            Event::Propose { value } => {
                self.val = Some(value);
                self.maybe_propose(ctx);
            }
            Event::StartEpoch { ts, leader } => {
                info!("{}: start epoch {} led by {}", ctx.name(), ts, leader);
                self.newts = ts;
                self.newleader = leader;
                ctx.post(self.instance.expect("instance started"), Event::Abort);
            }
            Event::Aborted { ts, value } => {
                self.ets = self.newts;
                self.leader = self.newleader;
                self.proposed = false;
                self.start_instance(ctx, ts, value);
            }
            Event::Decide { value } => {
                if !self.decided {
                    self.decided = true;
                    ctx.post(self.upper, Event::Decide { value });
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}
