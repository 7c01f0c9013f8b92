use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::common::{deserialize, generate_id, serialize, Address, Ballot, Membership, MessageId, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PaxosMessage {
    Prepare {
        n: Ballot,
    },
    Promise {
        n: Ballot,
        accepted: (Option<Ballot>, Option<Opaque>),
    },
    Accept {
        n: Ballot,
        v: Opaque,
    },
    Accepted {
        n: Ballot,
    },
    Decided {
        v: Opaque,
    },
}

/// Single-decree Paxos with proposer and acceptor colocated on every
/// process. Ballots are `(round, address)` pairs ordered lexicographically,
/// so competing proposers in the same round are totally ordered by address.
///
/// The proposer only counts promises for ballots it issued itself; a
/// promise echoing a competitor's higher ballot merely teaches it the
/// round to beat. Once a quorum accepts, the chosen value is broadcast so
/// non-proposing replicas learn it too.
pub struct Synod {
    upper: ModuleId,
    beb: ModuleId,
    fll: ModuleId,
    membership: Arc<Membership>,
    // proposer
    max_round: u64,
    my_value: Option<Opaque>,
    proposals: HashMap<Ballot, Opaque>,
    promises: HashMap<Ballot, HashMap<Address, (Option<Ballot>, Option<Opaque>)>>,
    issued: HashSet<Ballot>,
    accepted: HashMap<Ballot, HashSet<Address>>,
    chosen: bool,
    // acceptor
    min_proposal: Option<Ballot>,
    accepted_proposal: Option<Ballot>,
    accepted_value: Option<Opaque>,
}

impl Synod {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "Synod",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::FairLossLink, "fll"),
            ],
            |seed| {
                Boot::init(Synod {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    fll: seed.lower("fll"),
                    membership: seed.membership,
                    max_round: 0,
                    my_value: None,
                    proposals: HashMap::new(),
                    promises: HashMap::new(),
                    issued: HashSet::new(),
                    accepted: HashMap::new(),
                    chosen: false,
                    min_proposal: None,
                    accepted_proposal: None,
                    accepted_value: None,
                })
            },
        )
    }

    /// The value to push under our ballot `n`: a previously accepted value
    /// from the promise quorum wins, else whatever we proposed for `n`,
    /// falling back to the latest value this process proposed at all.
    fn value_for(&mut self, n: Ballot) -> Option<Opaque> {
        let highest = self
            .promises
            .get(&n)
            .into_iter()
            .flat_map(|quorum| quorum.values())
            .filter(|(accn, _)| accn.is_some())
            .max_by_key(|(accn, _)| *accn)
            .and_then(|(_, accv)| accv.clone());
        if let Some(value) = highest {
            self.proposals.insert(n, value.clone());
            return Some(value);
        }
        self.proposals
            .get(&n)
            .cloned()
            .or_else(|| self.my_value.clone())
    }

    fn choose(&mut self, ctx: &mut Context<'_>, value: Opaque) {
        self.chosen = true;
        info!("{}: chose a value", ctx.name());
        ctx.post(
            self.beb,
            Event::Broadcast {
                message: serialize(&PaxosMessage::Decided { v: value.clone() }),
            },
        );
        ctx.post(self.upper, Event::Decide { value });
    }
}

impl Module for Synod {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Propose { value } => {
                if self.chosen {
                    return;
                }
                self.max_round += 1;
                let n = Ballot {
                    round: self.max_round,
                    addr: self.membership.addr(),
                };
                self.proposals.insert(n, value.clone());
                self.my_value = Some(value);
                info!("{}: proposing at ballot {:?}", ctx.name(), n);
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&PaxosMessage::Prepare { n }),
                    },
                );
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                // proposer half
                Ok(PaxosMessage::Promise { n, accepted }) => {
                    if n.round > self.max_round {
                        self.max_round = n.round;
                    }
                    if n.addr != self.membership.addr() {
                        // a competitor holds this ballot, nothing to collect
                        return;
                    }
                    let quorum = self.promises.entry(n).or_default();
                    quorum.insert(src, accepted);
                    let count = quorum.len();
                    if self.membership.majority(count) && !self.issued.contains(&n) {
                        self.issued.insert(n);
                        match self.value_for(n) {
                            Some(v) => ctx.post(
                                self.beb,
                                Event::Broadcast {
                                    message: serialize(&PaxosMessage::Accept { n, v }),
                                },
                            ),
                            None => warn!("{}: no value for promised ballot {:?}", ctx.name(), n),
                        }
                    }
                }
                Ok(PaxosMessage::Accepted { n }) => {
                    let quorum = self.accepted.entry(n).or_default();
                    quorum.insert(src);
                    if self.membership.majority(quorum.len()) && !self.chosen {
                        match self.proposals.get(&n).cloned().or_else(|| self.my_value.clone()) {
                            Some(value) => self.choose(ctx, value),
                            None => warn!("{}: no value for accepted ballot {:?}", ctx.name(), n),
                        }
                    }
                }
                // acceptor half
                Ok(PaxosMessage::Prepare { n }) => {
                    if self.min_proposal.map_or(true, |min| n > min) {
                        self.min_proposal = Some(n);
                    }
                    ctx.post(
                        self.fll,
                        Event::Send {
                            dest: src,
                            message: serialize(&PaxosMessage::Promise {
                                n: self.min_proposal.unwrap(),
                                accepted: (self.accepted_proposal, self.accepted_value.clone()),
                            }),
                        },
                    );
                }
                Ok(PaxosMessage::Accept { n, v }) => {
                    if self.min_proposal.map_or(true, |min| n >= min) {
                        self.min_proposal = Some(n);
                        self.accepted_proposal = Some(n);
                        self.accepted_value = Some(v);
                        ctx.post(
                            self.fll,
                            Event::Send {
                                dest: src,
                                message: serialize(&PaxosMessage::Accepted { n }),
                            },
                        );
                    } else {
                        debug!("{}: reject accept below {:?}", ctx.name(), self.min_proposal);
                    }
                }
                // learner
                Ok(PaxosMessage::Decided { v }) => {
                    if !self.chosen {
                        self.chosen = true;
                        ctx.post(self.upper, Event::Decide { value: v });
                    }
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotValue {
    pos: u64,
    cid: MessageId,
    command: Opaque,
}

#[derive(Debug, Clone)]
struct LogEntry {
    cid: MessageId,
    command: Opaque,
}

/// Multi-Paxos skeleton: one Synod instance per log slot, named by the
/// slot position so every replica's acceptors line up on the same
/// channels. A command that loses its slot to a competing client request
/// is re-proposed at the next free position; the contiguous log prefix is
/// surfaced in order as `Executed` indications.
///
/// Every replica keeps a window of upcoming slot instances built ahead of
/// use, so a prepare for a fresh slot always finds its acceptor.
pub struct MultiPaxos {
    upper: ModuleId,
    name: String,
    slots: BTreeMap<u64, ModuleId>,
    built: u64,
    next_pos: u64,
    next_execute: u64,
    logs: BTreeMap<u64, LogEntry>,
    pending: HashMap<u64, (MessageId, Opaque)>,
}

impl MultiPaxos {
    pub const WINDOW: u64 = 4;

    pub fn blueprint() -> Blueprint {
        Blueprint::new("MultiPaxos", vec![], |seed| {
            Boot::init(MultiPaxos {
                upper: seed.upper,
                name: seed.name.to_string(),
                slots: BTreeMap::new(),
                built: 0,
                next_pos: 0,
                next_execute: 0,
                logs: BTreeMap::new(),
                pending: HashMap::new(),
            })
        })
    }

    fn ensure_slots(&mut self, ctx: &mut Context<'_>, upto: u64) {
        while self.built < upto {
            let name = format!("{}.{}", self.name, self.built);
            let slot = ctx.build_with(&Synod::blueprint(), &name, ctx.id());
            self.slots.insert(self.built, slot);
            self.built += 1;
        }
    }

    fn propose(&mut self, ctx: &mut Context<'_>, cid: MessageId, command: Opaque) {
        let pos = self.next_pos;
        self.next_pos += 1;
        self.ensure_slots(ctx, pos + Self::WINDOW);
        self.pending.insert(pos, (cid, command.clone()));
        debug!("{}: proposing at slot {}", ctx.name(), pos);
        ctx.post(
            self.slots[&pos],
            Event::Propose {
                value: serialize(&SlotValue { pos, cid, command }),
            },
        );
    }
}

impl Module for MultiPaxos {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => self.ensure_slots(ctx, Self::WINDOW),
            Event::Execute { command } => {
                let cid = generate_id();
                self.propose(ctx, cid, command);
            }
            Event::Decide { value } => {
                let decided: SlotValue = match deserialize(&value) {
                    Ok(decided) => decided,
                    Err(_) => {
                        warn!("{}: undecodable slot decision", ctx.name());
                        return;
                    }
                };
                self.ensure_slots(ctx, decided.pos + Self::WINDOW);
                if self.logs.contains_key(&decided.pos) {
                    return;
                }
                self.logs.insert(
                    decided.pos,
                    LogEntry {
                        cid: decided.cid,
                        command: decided.command,
                    },
                );
                if self.next_pos <= decided.pos {
                    self.next_pos = decided.pos + 1;
                }
                // a competing request took our slot; try the next one
                if let Some((cid, command)) = self.pending.remove(&decided.pos) {
                    if cid != decided.cid {
                        info!("{}: slot {} lost, re-proposing", ctx.name(), decided.pos);
                        self.propose(ctx, cid, command);
                    }
                }
                while let Some(entry) = self.logs.get(&self.next_execute) {
                    ctx.post(
                        self.upper,
                        Event::Executed {
                            pos: self.next_execute,
                            command: entry.command.clone(),
                        },
                    );
                    self.next_execute += 1;
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}
