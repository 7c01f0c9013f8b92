use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::{deserialize, digest, generate_id, hex, serialize, Address, Digest, MessageId, Opaque};
use crate::registry::{Blueprint, Interface, Uses};
use crate::runtime::{Boot, Context, Event, Module, ModuleId, Timer};
use crate::store::Store;
use crate::transport::LinkSender;

/// Fair-loss point-to-point links, the thin shim over the datagram
/// endpoint. A sent message arrives zero or more times; no retransmission,
/// no duplicate suppression.
pub struct BasicLink {
    upper: ModuleId,
    link: LinkSender,
}

impl BasicLink {
    pub fn blueprint() -> Blueprint {
        Blueprint::new("BasicLink", vec![], |seed| {
            Boot::init(BasicLink {
                upper: seed.upper,
                link: seed.link,
            })
        })
    }
}

impl Module for BasicLink {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Send { dest, message } => self.link.send(dest, message),
            Event::Deliver { src, message } => ctx.post(self.upper, Event::Deliver { src, message }),
            event => ctx.unhandled(&event),
        }
    }
}

/// Stubborn links by unbounded retransmission: every `DELTA` the whole
/// sent-set goes out again, forever. The set is never evicted; upper
/// layers are expected to deduplicate.
pub struct RetransmitForever {
    upper: ModuleId,
    fll: ModuleId,
    sent: BTreeSet<(Address, Opaque)>,
}

impl RetransmitForever {
    pub const DELTA: Duration = Duration::from_secs(10);

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "RetransmitForever",
            vec![Uses::of(Interface::FairLossLink, "fll")],
            |seed| {
                Boot::init(RetransmitForever {
                    upper: seed.upper,
                    fll: seed.lower("fll"),
                    sent: BTreeSet::new(),
                })
            },
        )
    }
}

impl Module for RetransmitForever {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => ctx.set_timer(Self::DELTA, Timer::Tick),
            Event::Timeout(Timer::Tick) => {
                for (dest, message) in &self.sent {
                    ctx.post(
                        self.fll,
                        Event::Send {
                            dest: *dest,
                            message: message.clone(),
                        },
                    );
                }
                ctx.set_timer(Self::DELTA, Timer::Tick);
            }
            Event::Send { dest, message } => {
                self.sent.insert((dest, message.clone()));
                ctx.post(self.fll, Event::Send { dest, message });
            }
            Event::Deliver { src, message } => ctx.post(self.upper, Event::Deliver { src, message }),
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StubbornMessage {
    Data { mid: MessageId, data: Opaque },
    Ack { mid: MessageId },
}

/// Stubborn links with acknowledgement: unacked `(peer, mid)` pairs are
/// retransmitted every `DELTA`, acked ones are evicted.
pub struct RetransmitWithAck {
    upper: ModuleId,
    fll: ModuleId,
    sent: BTreeMap<(Address, MessageId), Opaque>,
}

impl RetransmitWithAck {
    pub const DELTA: Duration = Duration::from_secs(10);

    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "RetransmitWithAck",
            vec![Uses::of(Interface::FairLossLink, "fll")],
            |seed| {
                Boot::init(RetransmitWithAck {
                    upper: seed.upper,
                    fll: seed.lower("fll"),
                    sent: BTreeMap::new(),
                })
            },
        )
    }

    fn data(mid: MessageId, data: &Opaque) -> Opaque {
        serialize(&StubbornMessage::Data {
            mid,
            data: data.clone(),
        })
    }
}

impl Module for RetransmitWithAck {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => ctx.set_timer(Self::DELTA, Timer::Tick),
            Event::Timeout(Timer::Tick) => {
                for ((dest, mid), data) in &self.sent {
                    ctx.post(
                        self.fll,
                        Event::Send {
                            dest: *dest,
                            message: Self::data(*mid, data),
                        },
                    );
                }
                ctx.set_timer(Self::DELTA, Timer::Tick);
            }
            Event::Send { dest, message } => {
                let mid = generate_id();
                self.sent.insert((dest, mid), message.clone());
                ctx.post(
                    self.fll,
                    Event::Send {
                        dest,
                        message: Self::data(mid, &message),
                    },
                );
            }
            Event::Deliver { src, message } => {
                let message = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                match message {
                    StubbornMessage::Data { mid, data } => {
                        ctx.post(self.upper, Event::Deliver { src, message: data });
                        ctx.post(
                            self.fll,
                            Event::Send {
                                dest: src,
                                message: serialize(&StubbornMessage::Ack { mid }),
                            },
                        );
                    }
                    StubbornMessage::Ack { mid } => {
                        self.sent.remove(&(src, mid));
                    }
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// Perfect (reliable) links: the stubborn layer below guarantees delivery,
/// this layer drops everything it has delivered before, by digest of the
/// encoded message.
pub struct EliminateDuplicates {
    upper: ModuleId,
    sl: ModuleId,
    delivered: HashSet<Digest>,
}

impl EliminateDuplicates {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "EliminateDuplicates",
            vec![Uses::of(Interface::StubbornLink, "sl")],
            |seed| {
                Boot::init(EliminateDuplicates {
                    upper: seed.upper,
                    sl: seed.lower("sl"),
                    delivered: HashSet::new(),
                })
            },
        )
    }
}

impl Module for EliminateDuplicates {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Send { dest, message } => ctx.post(self.sl, Event::Send { dest, message }),
            Event::Deliver { src, message } => {
                if self.delivered.insert(digest(&message)) {
                    ctx.post(self.upper, Event::Deliver { src, message });
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

/// Perfect links whose `delivered` set survives restarts. The set is
/// persisted after every insert; a crash between delivery and persist may
/// re-deliver, never lose.
pub struct LogDelivered {
    upper: ModuleId,
    sl: ModuleId,
    store: Store,
    delivered: BTreeSet<Opaque>,
}

impl LogDelivered {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "LogDelivered",
            vec![Uses::of(Interface::StubbornLink, "sl")],
            |seed| {
                let storeid = hex(&digest(format!("{}@{}", seed.name, seed.membership.addr()).as_bytes()));
                let store = Store::new(&seed.store_dir, &storeid);
                let module = LogDelivered {
                    upper: seed.upper,
                    sl: seed.lower("sl"),
                    delivered: BTreeSet::new(),
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
}

impl Module for LogDelivered {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => self.store.store(&self.delivered).expect("stable store write"),
            Event::Recovery => {
                self.delivered = self.store.retrieve().expect("stable store read");
                debug!("{}: recovered {} delivered entries", ctx.name(), self.delivered.len());
            }
            Event::Send { dest, message } => ctx.post(self.sl, Event::Send { dest, message }),
            Event::Deliver { src, message } => {
                if !self.delivered.contains(&message) {
                    self.delivered.insert(message.clone());
                    self.store.store(&self.delivered).expect("stable store write");
                    ctx.post(self.upper, Event::Deliver { src, message });
                }
            }
            event => ctx.unhandled(&event),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SequencedMessage {
    seq: u64,
    payload: Opaque,
}

/// FIFO-order perfect links: per-destination sequence numbers on the send
/// side, contiguous-prefix reordering buffers on the receive side.
pub struct SequenceNumber {
    upper: ModuleId,
    pl: ModuleId,
    seq: HashMap<Address, u64>,
    next: HashMap<Address, u64>,
    buffer: HashMap<Address, BTreeMap<u64, Opaque>>,
}

impl SequenceNumber {
    pub fn blueprint() -> Blueprint {
        Blueprint::new(
            "SequenceNumber",
            vec![Uses::of(Interface::PerfectLink, "pl")],
            |seed| {
                Boot::init(SequenceNumber {
                    upper: seed.upper,
                    pl: seed.lower("pl"),
                    seq: HashMap::new(),
                    next: HashMap::new(),
                    buffer: HashMap::new(),
                })
            },
        )
    }
}

impl Module for SequenceNumber {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
        match event {
            Event::Init => {}
            Event::Send { dest, message } => {
                let seq = self.seq.entry(dest).or_insert(0);
                let message = serialize(&SequencedMessage {
                    seq: *seq,
                    payload: message,
                });
                *seq += 1;
                ctx.post(self.pl, Event::Send { dest, message });
            }
            Event::Deliver { src, message } => {
                let message: SequencedMessage = match deserialize(&message) {
                    Ok(message) => message,
                    Err(_) => {
                        warn!("{}: malformed message from {}", ctx.name(), src);
                        return;
                    }
                };
                self.buffer
                    .entry(src)
                    .or_default()
                    .insert(message.seq, message.payload);
                let next = self.next.entry(src).or_insert(0);
                let buffer = self.buffer.get_mut(&src).unwrap();
                while let Some(payload) = buffer.remove(&*next) {
                    ctx.post(
                        self.upper,
                        Event::Deliver {
                            src,
                            message: payload,
                        },
                    );
                    *next += 1;
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

    use crate::common::Membership;
    use crate::registry::{self, Interface};
    use crate::runtime::{Event, Stack, StackConfig};
    use crate::simulated::{delivered, Hub, System};
    use crate::tests::TRACING;

    #[tokio::test(start_paused = true)]
    async fn stubborn_resends_collapse_to_one_delivery() {
        *TRACING;
        let mut system = System::launch(
            3,
            Duration::from_millis(100),
            Interface::PerfectLink,
            "pl",
        );
        let b = system.members[1];
        for _ in 0..5 {
            system.inject(
                0,
                Event::Send {
                    dest: b,
                    message: b"m".to_vec(),
                },
            );
        }

        let (src, message) = timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
            .await
            .unwrap();
        assert_eq!(src, system.members[0]);
        assert_eq!(message, b"m".to_vec());
        // retransmissions keep arriving below for a while, none may surface
        assert!(
            timeout(Duration::from_secs(60), delivered(&mut system.mailboxes[1]))
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_link_reorders_jittered_messages() {
        *TRACING;
        let mut system = System::launch(
            2,
            Duration::from_millis(500),
            Interface::FifoLink,
            "fifo",
        );
        let b = system.members[1];
        for i in 0..10u8 {
            system.inject(
                0,
                Event::Send {
                    dest: b,
                    message: vec![i],
                },
            );
        }
        for i in 0..10u8 {
            let (_, message) =
                timeout(Duration::from_secs(120), delivered(&mut system.mailboxes[1]))
                    .await
                    .unwrap();
            assert_eq!(message, vec![i]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn logged_link_suppresses_across_restart() {
        *TRACING;
        let store_dir = std::env::temp_dir().join(format!(
            "stratum-logged-{:x}",
            crate::common::generate_id()
        ));
        std::fs::create_dir_all(&store_dir).unwrap();
        let members: Vec<crate::common::Address> = (0..2)
            .map(|i| format!("127.0.0.1:{}", 6000 + i).parse().unwrap())
            .collect();
        let hub = Hub::new(Duration::from_millis(50));

        let launch = |addr| {
            let (endpoint, inbound) = hub.attach(addr);
            let mut stack = Stack::new(
                Membership::new(addr, members.iter().copied()),
                endpoint,
                inbound,
                registry::defaults(),
                StackConfig {
                    store_dir: store_dir.clone(),
                },
            );
            let (root, mailbox) = stack.mount(Interface::LoggedPerfectLink, "lpl");
            let injector = stack.injector();
            (root, mailbox, injector, tokio::spawn(stack.run()))
        };

        let (a_root, _a_mailbox, a_injector, _a_task) = launch(members[0]);
        let (_b_root, mut b_mailbox, _b_injector, b_task) = launch(members[1]);
        a_injector
            .send((
                a_root,
                Event::Send {
                    dest: members[1],
                    message: b"once".to_vec(),
                },
            ))
            .unwrap();
        let (_, message) = timeout(Duration::from_secs(60), delivered(&mut b_mailbox))
            .await
            .unwrap();
        assert_eq!(message, b"once".to_vec());

        // restart the receiver with the same stable storage
        b_task.abort();
        let (_b_root, mut b_mailbox, _b_injector, _b_task) = launch(members[1]);
        a_injector
            .send((
                a_root,
                Event::Send {
                    dest: members[1],
                    message: b"once".to_vec(),
                },
            ))
            .unwrap();
        assert!(
            timeout(Duration::from_secs(60), delivered(&mut b_mailbox))
                .await
                .is_err()
        );
    }
}
