use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::common::{deserialize, serialize, Address, Membership, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum RegisterMessage {
    Write { val: Opaque },
    Ack,
}

/// (1,N) regular register in the fail-stop model: the writer imposes its
/// value on everybody and waits for acks from every process not reported
/// crashed; a reader returns its local copy.
pub struct ReadOneWriteAll {
    upper: ModuleId,
    beb: ModuleId,
    pl: ModuleId,
    val: Option<Opaque>,
    correct: HashSet<Address>,
    writeset: HashSet<Address>,
}

impl ReadOneWriteAll {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "ReadOneWriteAll",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectLink, "pl"),
                Uses::of(Interface::PerfectFailureDetector, "p"),
            ],
            |seed| {
                Boot::init(ReadOneWriteAll {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    pl: seed.lower("pl"),
                    val: None,
                    correct: seed.membership.members().iter().copied().collect(),
                    writeset: HashSet::new(),
                })
            },
        )
    }

    fn check(&mut self, ctx: &mut Context<'_>) {
        if self.correct.iter().all(|p| self.writeset.contains(p)) {
            self.writeset.clear();
            ctx.post(self.upper, Event::WriteReturn);
        }
    }
}

impl Module for ReadOneWriteAll {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Read => ctx.post(
                self.upper,
                Event::ReadReturn {
                    value: self.val.clone(),
                },
            ),
            Event::Write { value } => ctx.post(
                self.beb,
                Event::Broadcast {
                    message: serialize(&RegisterMessage::Write { val: value }),
                },
            ),
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(RegisterMessage::Write { val }) => {
                    self.val = Some(val);
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest: src,
                            message: serialize(&RegisterMessage::Ack),
                        },
                    );
                }
                Ok(RegisterMessage::Ack) => {
                    self.writeset.insert(src);
                    self.check(ctx);
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            Event::Crash { peer } => {
                self.correct.remove(&peer);
                self.check(ctx);
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum MajorityMessage {
    Write { ts: u64, val: Opaque },
    Ack { ts: u64 },
    Read { rid: u64 },
    Value { rid: u64, ts: u64, val: Option<Opaque> },
}

/// (1,N) regular register in the fail-silent model: write timestamps and
/// majority quorums replace the failure detector. A read collects a
/// majority of timestamped copies and returns the freshest.
pub struct MajorityVotingRegularRegister {
    upper: ModuleId,
    beb: ModuleId,
    pl: ModuleId,
    membership: Arc<Membership>,
    ts: u64,
    val: Option<Opaque>,
    wts: u64,
    acks: usize,
    rid: u64,
    readlist: HashMap<Address, (u64, Option<Opaque>)>,
}

impl MajorityVotingRegularRegister {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "MajorityVotingRegularRegister",
            vec![
                Uses::of(Interface::BestEffortBroadcast, "beb"),
                Uses::of(Interface::PerfectLink, "pl"),
            ],
            |seed| {
                Boot::init(MajorityVotingRegularRegister {
                    upper: seed.upper,
                    beb: seed.lower("beb"),
                    pl: seed.lower("pl"),
                    membership: seed.membership,
                    ts: 0,
                    val: None,
                    wts: 0,
                    acks: 0,
                    rid: 0,
                    readlist: HashMap::new(),
                })
            },
        )
    }
}

impl Module for MajorityVotingRegularRegister {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Write { value } => {
                self.wts += 1;
                self.acks = 0;
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&MajorityMessage::Write {
                            ts: self.wts,
                            val: value,
                        }),
                    },
                );
            }
            Event::Read => {
                self.rid += 1;
                self.readlist.clear();
                ctx.post(
                    self.beb,
                    Event::Broadcast {
                        message: serialize(&MajorityMessage::Read { rid: self.rid }),
                    },
                );
            }
            Event::Deliver { src, message } => match deserialize(&message) {
                Ok(MajorityMessage::Write { ts, val }) => {
                    if ts > self.ts {
                        self.ts = ts;
                        self.val = Some(val);
                    }
                    ctx.post(
                        self.pl,
                        Event::Send {
                            dest: src,
                            message: serialize(&MajorityMessage::Ack { ts }),
                        },
                    );
                }
                Ok(MajorityMessage::Ack { ts }) => {
                    if ts == self.wts {
                        self.acks += 1;
                        if self.membership.majority(self.acks) {
                            self.acks = 0;
                            ctx.post(self.upper, Event::WriteReturn);
                        }
                    }
                }
                Ok(MajorityMessage::Read { rid }) => ctx.post(
                    self.pl,
                    Event::Send {
                        dest: src,
                        message: serialize(&MajorityMessage::Value {
                            rid,
                            ts: self.ts,
                            val: self.val.clone(),
                        }),
                    },
                ),
                Ok(MajorityMessage::Value { rid, ts, val }) => {
                    if rid == self.rid {
                        self.readlist.insert(src, (ts, val));
                        if self.membership.majority(self.readlist.len()) {
                            // the largest timestamp carries the value
                            // written last
                            let (_, freshest) = self
                                .readlist
                                .values()
                                .max_by_key(|(ts, _)| *ts)
                                .cloned()
                                .expect("majority of read replies");
                            self.readlist.clear();
                            ctx.post(self.upper, Event::ReadReturn { value: freshest });
                        }
                    }
                }
                Err(_) => warn!("{}: malformed message from {}", ctx.name(), src),
            },
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stamped {
    ts: u64,
    val: Opaque,
}

/// From (1,N) regular to (1,1) atomic: the writer stamps values, the
/// reader caches the freshest stamp it ever observed so reads never go
/// backwards.
pub struct RegularToAtomic {
    upper: ModuleId,
    onrr: ModuleId,
    ts: u64,
    val: Option<Opaque>,
    wts: u64,
}

impl RegularToAtomic {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "RegularToAtomic",
            vec![Uses::of(Interface::OneNRegularRegister, "onrr")],
            |seed| {
                Boot::init(RegularToAtomic {
                    upper: seed.upper,
                    onrr: seed.lower("onrr"),
                    ts: 0,
                    val: None,
                    wts: 0,
                })
            },
        )
    }
}

impl Module for RegularToAtomic {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Write { value } => {
                self.wts += 1;
                ctx.post(
                    self.onrr,
                    Event::Write {
                        value: serialize(&Stamped {
                            ts: self.wts,
                            val: value,
                        }),
                    },
                );
            }
            Event::WriteReturn => ctx.post(self.upper, Event::WriteReturn),
            Event::Read => ctx.post(self.onrr, Event::Read),
            Event::ReadReturn { value } => {
                if let Some(bytes) = value {
                    match deserialize::<Stamped>(&bytes) {
                        Ok(stamped) => {
                            if stamped.ts > self.ts {
                                self.ts = stamped.ts;
                                self.val = Some(stamped.val);
                            }
                        }
                        Err(_) => warn!("{}: undecodable stamped value", ctx.name()),
                    }
                }
                ctx.post(
                    self.upper,
                    Event::ReadReturn {
                        value: self.val.clone(),
                    },
                );
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// From (1,1) atomic to (1,N) atomic: one per-reader sub-register, writes
/// fan out to all of them, reads collect all and keep the freshest stamp.
pub struct AtomicFanOut {
    upper: ModuleId,
    name: String,
    membership: Arc<Membership>,
    subs: Vec<ModuleId>,
    ts: u64,
    writing: bool,
    write_acks: usize,
    reading: bool,
    replies: usize,
    best: Option<(u64, Opaque)>,
}

impl AtomicFanOut {
    pub fn blueprint() -> Blueprint {
        Blueprint::new("AtomicFanOut", vec![], |seed| {
            Boot::init(AtomicFanOut {
                upper: seed.upper,
                name: seed.name.to_string(),
                membership: seed.membership,
                subs: Vec::new(),
                ts: 0,
                writing: false,
                write_acks: 0,
                reading: false,
                replies: 0,
                best: None,
            })
        })
    }
}

impl Module for AtomicFanOut {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {
                for rank in 0..self.membership.n() {
                    let name = format!("{}.{}", self.name, rank);
                    let sub = ctx.build(Interface::OneOneAtomicRegister, &name, ctx.id());
                    self.subs.push(sub);
                }
            }
            Event::Write { value } => {
                self.ts += 1;
                self.writing = true;
                self.write_acks = 0;
                let stamped = serialize(&Stamped {
                    ts: self.ts,
                    val: value,
                });
                for sub in self.subs.clone() {
                    ctx.post(
                        sub,
                        Event::Write {
                            value: stamped.clone(),
                        },
                    );
                }
            }
            Event::WriteReturn => {
                if !self.writing {
                    return;
                }
                self.write_acks += 1;
                if self.write_acks == self.subs.len() {
                    self.writing = false;
                    ctx.post(self.upper, Event::WriteReturn);
                }
            }
            Event::Read => {
                self.reading = true;
                self.replies = 0;
                self.best = None;
                for sub in self.subs.clone() {
                    ctx.post(sub, Event::Read);
                }
            }
            Event::ReadReturn { value } => {
                if !self.reading {
                    return;
                }
                self.replies += 1;
                if let Some(bytes) = value {
                    if let Ok(stamped) = deserialize::<Stamped>(&bytes) {
                        if self.best.as_ref().map_or(true, |(ts, _)| stamped.ts > *ts) {
                            self.best = Some((stamped.ts, stamped.val));
                        }
                    }
                }
                if self.replies == self.subs.len() {
                    self.reading = false;
                    ctx.post(
                        self.upper,
                        Event::ReadReturn {
                            value: self.best.clone().map(|(_, val)| val),
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
    use crate::simulated::System;
    use crate::tests::TRACING;

    async fn write_return(mailbox: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) {
        loop {
            if let Event::WriteReturn = mailbox.recv().await.expect("mailbox open") {
                return;
            }
        }
    }

    async fn read_return(
        mailbox: &mut tokio::sync::mpsc::UnboundedReceiver<Event>,
    ) -> Option<Vec<u8>> {
        loop {
            if let Event::ReadReturn { value } = mailbox.recv().await.expect("mailbox open") {
                return value;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_one_write_all_completes_and_propagates() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::OneNRegularRegister, "ReadOneWriteAll");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(100),
            Interface::OneNRegularRegister,
            "reg",
            registry,
        );
        system.inject(
            0,
            Event::Write {
                value: b"v".to_vec(),
            },
        );
        timeout(Duration::from_secs(600), write_return(&mut system.mailboxes[0]))
            .await
            .unwrap();

        system.inject(1, Event::Read);
        let value = timeout(Duration::from_secs(60), read_return(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn read_one_write_all_finishes_despite_a_crash() {
        *TRACING;
        let registry = || {
            let mut registry = crate::registry::defaults();
            registry.bind(Interface::OneNRegularRegister, "ReadOneWriteAll");
            registry
        };
        let mut system = System::launch_with(
            3,
            Duration::from_millis(100),
            Interface::OneNRegularRegister,
            "reg",
            registry,
        );
        system.hub.crash(system.members[2]);
        system.inject(
            0,
            Event::Write {
                value: b"v".to_vec(),
            },
        );
        // completes once the detector excludes the crashed member
        timeout(Duration::from_secs(600), write_return(&mut system.mailboxes[0]))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn majority_read_returns_the_last_write() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::OneNRegularRegister,
            "reg",
        );
        for value in [b"v1", b"v2"] {
            system.inject(
                0,
                Event::Write {
                    value: value.to_vec(),
                },
            );
            timeout(Duration::from_secs(600), write_return(&mut system.mailboxes[0]))
                .await
                .unwrap();
        }

        system.inject(1, Event::Read);
        let value = timeout(Duration::from_secs(600), read_return(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(value, Some(b"v2".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn one_one_atomic_reads_never_go_backwards() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::OneOneAtomicRegister,
            "areg",
        );
        system.inject(
            0,
            Event::Write {
                value: b"new".to_vec(),
            },
        );
        timeout(Duration::from_secs(600), write_return(&mut system.mailboxes[0]))
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            system.inject(1, Event::Read);
            let value = timeout(Duration::from_secs(600), read_return(&mut system.mailboxes[1]))
                .await
                .unwrap();
            seen.push(value);
        }
        // once the new value is observed it sticks
        let first_new = seen.iter().position(|v| v == &Some(b"new".to_vec()));
        if let Some(at) = first_new {
            for value in &seen[at..] {
                assert_eq!(value, &Some(b"new".to_vec()));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_register_serves_any_reader() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::OneNAtomicRegister,
            "nreg",
        );
        system.inject(
            0,
            Event::Write {
                value: b"shared".to_vec(),
            },
        );
        timeout(Duration::from_secs(600), write_return(&mut system.mailboxes[0]))
            .await
            .unwrap();

        for reader in [1, 2] {
            system.inject(reader, Event::Read);
            let value = timeout(
                Duration::from_secs(600),
                read_return(&mut system.mailboxes[reader]),
            )
            .await
            .unwrap();
            assert_eq!(value, Some(b"shared".to_vec()));
        }
    }
}
