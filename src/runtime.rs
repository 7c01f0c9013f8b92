use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::common::{Address, Membership, Opaque};
use crate::registry::{Blueprint, Interface, Registry};
use crate::transport::{Endpoint, Inbound, LinkSender};

/// Index of a module instance within its process stack.
pub type ModuleId = usize;

/// The requests and indications exchanged between stacked modules.
///
/// A single tagged type for the whole catalogue keeps dispatch uniform: a
/// module matches the variants it understands and hands the rest to
/// [`Context::unhandled`]. Payload-carrying variants hold the payload as an
/// opaque encoded value; each layer owns its wire type and decodes on
/// delivery.
#[derive(Debug, Clone)]
pub enum Event {
    Init,
    /// Replaces `Init` for a module whose stable state survived a restart.
    Recovery,
    Send { dest: Address, message: Opaque },
    Deliver { src: Address, message: Opaque },
    Broadcast { message: Opaque },
    Crash { peer: Address },
    Suspect { peer: Address },
    Restore { peer: Address },
    Leader { leader: Address },
    Trust { leader: Address },
    Propose { value: Opaque },
    Decide { value: Opaque },
    StartEpoch { ts: u64, leader: Address },
    Abort,
    Aborted { ts: u64, value: Option<Opaque> },
    Read,
    ReadReturn { value: Option<Opaque> },
    Write { value: Opaque },
    WriteReturn,
    Execute { command: Opaque },
    Executed { pos: u64, command: Opaque },
    Timeout(Timer),
}

/// Timer payloads. Timers cannot be cancelled; a module that no longer
/// cares about a firing must treat it as a no-op.
#[derive(Debug, Clone)]
pub enum Timer {
    /// Periodic tick (retransmission, heartbeat rounds).
    Tick,
    /// Skip-ahead deadline for a sequence gap at `origin`.
    Gap { origin: Address, sn: u64 },
}

pub trait Module: Send {
    fn handle(&mut self, ctx: &mut Context<'_>, event: Event);
}

/// What a blueprint constructor receives: identity, wiring, and process-wide
/// facilities. `lower` holds the child ids built from the blueprint's `uses`
/// declarations, keyed by role.
pub struct Seed<'a> {
    pub id: ModuleId,
    pub upper: ModuleId,
    pub name: &'a str,
    pub lower: HashMap<&'static str, ModuleId>,
    pub membership: Arc<Membership>,
    pub link: LinkSender,
    pub store_dir: PathBuf,
}

impl Seed<'_> {
    pub fn lower(&self, role: &str) -> ModuleId {
        *self
            .lower
            .get(role)
            .unwrap_or_else(|| panic!("{}: no child bound for role {}", self.name, role))
    }
}

/// A constructed module plus its lifecycle event, `Init` or `Recovery`.
pub struct Boot {
    pub module: Box<dyn Module>,
    pub first: Event,
}

impl Boot {
    pub fn init(module: impl Module + 'static) -> Self {
        Self {
            module: Box::new(module),
            first: Event::Init,
        }
    }

    pub fn recover(module: impl Module + 'static) -> Self {
        Self {
            module: Box::new(module),
            first: Event::Recovery,
        }
    }
}

pub type Injector = UnboundedSender<(ModuleId, Event)>;

pub struct StackConfig {
    pub store_dir: PathBuf,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            store_dir: ".".into(),
        }
    }
}

struct Slot {
    name: String,
    module: Option<Box<dyn Module>>,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    target: ModuleId,
    timer: Timer,
}

// min-heap on (deadline, seq); seq keeps same-deadline timers FIFO
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Per-process stack of event-driven modules on a cooperative scheduler.
///
/// Every event is enqueued and executed to completion; a handler never
/// interrupts another, and events posted from within a handler run after
/// the handler returns, in FIFO order of post. Timers are enqueued
/// deliveries at a future deadline. Inbound datagrams are routed by channel
/// name to the owning module as `Deliver` events.
pub struct Stack {
    slots: Vec<Slot>,
    queue: VecDeque<(ModuleId, Event)>,
    timers: BinaryHeap<TimerEntry>,
    timer_seq: u64,
    channels: HashMap<String, ModuleId>,
    membership: Arc<Membership>,
    endpoint: Arc<dyn Endpoint>,
    inbound: UnboundedReceiver<Inbound>,
    commands: UnboundedReceiver<(ModuleId, Event)>,
    injector: Injector,
    registry: Arc<Registry>,
    config: StackConfig,
}

impl Stack {
    pub fn new(
        membership: Membership,
        endpoint: Arc<dyn Endpoint>,
        inbound: UnboundedReceiver<Inbound>,
        registry: Registry,
        config: StackConfig,
    ) -> Self {
        let (injector, commands) = mpsc::unbounded_channel();
        Self {
            slots: Vec::new(),
            queue: VecDeque::new(),
            timers: BinaryHeap::new(),
            timer_seq: 0,
            channels: HashMap::new(),
            membership: Arc::new(membership),
            endpoint,
            inbound,
            commands,
            injector,
            registry: Arc::new(registry),
            config,
        }
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Handle for posting events from outside the scheduler (tests, admin).
    pub fn injector(&self) -> Injector {
        self.injector.clone()
    }

    /// Builds the module tree for `interface` under an application mailbox
    /// and returns the root id plus the mailbox receiver carrying every
    /// indication the root emits upward.
    pub fn mount(
        &mut self,
        interface: Interface,
        name: &str,
    ) -> (ModuleId, UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = self.add_slot(&format!("{}#app", name));
        self.slots[app].module = Some(Box::new(Mailbox { tx }));
        let root = self.build_module(interface, None, name, app);
        (root, rx)
    }

    pub fn post(&mut self, target: ModuleId, event: Event) {
        self.queue.push_back((target, event));
    }

    /// Runs queued events to completion without waiting on timers or the
    /// network. Mostly useful for tests that drive a stack synchronously.
    pub fn drain(&mut self) {
        while let Some((id, event)) = self.queue.pop_front() {
            self.dispatch(id, event);
        }
    }

    pub async fn run(mut self) {
        loop {
            self.drain();
            let now = Instant::now();
            if let Some(head) = self.timers.peek() {
                if head.deadline <= now {
                    let entry = self.timers.pop().unwrap();
                    self.queue
                        .push_back((entry.target, Event::Timeout(entry.timer)));
                    continue;
                }
            }
            let deadline = self.timers.peek().map(|entry| entry.deadline);
            tokio::select! {
                inbound = self.inbound.recv() => match inbound {
                    Some((channel, src, message)) => self.route(channel, src, message),
                    // transport torn down
                    None => break,
                },
                command = self.commands.recv() => {
                    // never closes, the stack keeps an injector of its own
                    if let Some((id, event)) = command {
                        self.queue.push_back((id, event));
                    }
                }
                _ = sleep_until(deadline.unwrap_or(now + Duration::from_secs(3600))), if deadline.is_some() => {}
            }
        }
    }

    fn add_slot(&mut self, name: &str) -> ModuleId {
        self.slots.push(Slot {
            name: name.to_string(),
            module: None,
        });
        self.slots.len() - 1
    }

    fn dispatch(&mut self, id: ModuleId, event: Event) {
        let mut module = match self.slots[id].module.take() {
            Some(module) => module,
            None => {
                warn!("event {:?} for unconstructed module {}", event, id);
                return;
            }
        };
        let mut ctx = Context { stack: self, id };
        module.handle(&mut ctx, event);
        self.slots[id].module = Some(module);
    }

    fn route(&mut self, channel: String, src: Address, message: Opaque) {
        match self.channels.get(&channel) {
            Some(&id) => self.queue.push_back((id, Event::Deliver { src, message })),
            None => warn!("drop message from {} for unknown channel {}", src, channel),
        }
    }

    fn build_module(
        &mut self,
        interface: Interface,
        implementation: Option<&str>,
        name: &str,
        upper: ModuleId,
    ) -> ModuleId {
        let registry = self.registry.clone();
        self.build_from(registry.resolve(interface, implementation), name, upper)
    }

    fn build_from(&mut self, blueprint: &Blueprint, name: &str, upper: ModuleId) -> ModuleId {
        let id = self.add_slot(name);
        if self.channels.insert(name.to_string(), id).is_some() {
            panic!("duplicate module name {}", name);
        }
        let mut lower = HashMap::new();
        for uses in blueprint.uses() {
            let child = self.build_module(
                uses.interface,
                uses.implementation,
                &format!("{}.{}", name, uses.role),
                id,
            );
            lower.insert(uses.role, child);
        }
        let boot = blueprint.construct(Seed {
            id,
            upper,
            name,
            lower,
            membership: self.membership.clone(),
            link: LinkSender::new(name, self.endpoint.clone()),
            store_dir: self.config.store_dir.clone(),
        });
        self.slots[id].module = Some(boot.module);
        // lifecycle events are posted, never run inline, so cyclic
        // upper/lower references observed during dispatch are fully built
        self.queue.push_back((id, boot.first));
        id
    }
}

/// Forwards every indication reaching the top of a stack into a channel.
struct Mailbox {
    tx: UnboundedSender<Event>,
}

impl Module for Mailbox {
    fn handle(&mut self, _ctx: &mut Context<'_>, event: Event) {
        if matches!(event, Event::Init) {
            return;
        }
        if self.tx.send(event).is_err() {
            debug!("application mailbox closed");
        }
    }
}

/// Scheduler facilities exposed to a module while it handles one event.
pub struct Context<'a> {
    stack: &'a mut Stack,
    id: ModuleId,
}

impl Context<'_> {
    /// Id of the module currently handling an event.
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.stack.slots[self.id].name
    }

    pub fn membership(&self) -> &Membership {
        &self.stack.membership
    }

    pub fn post(&mut self, target: ModuleId, event: Event) {
        self.stack.queue.push_back((target, event));
    }

    /// Arms a timer delivering `Timeout(timer)` back to this module.
    pub fn set_timer(&mut self, delay: Duration, timer: Timer) {
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.stack.timer_seq,
            target: self.id,
            timer,
        };
        self.stack.timer_seq += 1;
        self.stack.timers.push(entry);
    }

    /// Builds a fresh module tree at runtime using the bound implementation
    /// for `interface`. Instance names must be globally agreed for the new
    /// tree's link channels to line up across processes.
    pub fn build(&mut self, interface: Interface, name: &str, upper: ModuleId) -> ModuleId {
        self.stack.build_module(interface, None, name, upper)
    }

    /// As [`Context::build`], but from an explicit blueprint. Used for
    /// instances that carry construction parameters, like an epoch
    /// consensus seeded with an inherited state.
    pub fn build_with(&mut self, blueprint: &Blueprint, name: &str, upper: ModuleId) -> ModuleId {
        self.stack.build_from(blueprint, name, upper)
    }

    /// Modules ignore events they do not understand, by design: a shared
    /// delivery channel may surface events (`Crash`, stale timeouts) at
    /// modules that do not react to them.
    pub fn unhandled(&self, event: &Event) {
        warn!("{}: dropping event {:?}", self.name(), event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::common::Membership;
    use crate::registry::{Blueprint, Interface, Registry};
    use crate::simulated::Hub;
    use crate::tests::TRACING;

    /// Forwards everything upward; used to observe scheduler behavior.
    struct Probe {
        upper: ModuleId,
    }

    impl Module for Probe {
        fn handle(&mut self, ctx: &mut Context<'_>, event: Event) {
            match event {
                Event::Init => ctx.post(
                    self.upper,
                    Event::Decide {
                        value: b"init".to_vec(),
                    },
                ),
                // three posts from one handler must surface in order
                Event::Propose { .. } => {
                    for value in [b"1", b"2", b"3"] {
                        ctx.post(
                            self.upper,
                            Event::Decide {
                                value: value.to_vec(),
                            },
                        );
                    }
                }
                Event::Broadcast { .. } => {
                    let origin = ctx.membership().addr();
                    ctx.set_timer(
                        Duration::from_millis(10),
                        Timer::Gap { origin, sn: 1 },
                    );
                    ctx.set_timer(
                        Duration::from_millis(10),
                        Timer::Gap { origin, sn: 2 },
                    );
                }
                Event::Timeout(Timer::Gap { sn, .. }) => ctx.post(
                    self.upper,
                    Event::Decide {
                        value: vec![sn as u8],
                    },
                ),
                event => ctx.unhandled(&event),
            }
        }
    }

    fn probe_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register(
            Interface::Consensus,
            Blueprint::new("Probe", vec![], |seed| {
                Boot::init(Probe { upper: seed.upper })
            }),
        );
        registry.bind(Interface::Consensus, "Probe");
        registry
    }

    fn probe_stack() -> (Stack, ModuleId, UnboundedReceiver<Event>) {
        let addr = "127.0.0.1:7000".parse().unwrap();
        let hub = Hub::new(Duration::ZERO);
        let (endpoint, inbound) = hub.attach(addr);
        let mut stack = Stack::new(
            Membership::new(addr, [addr]),
            endpoint,
            inbound,
            probe_registry(),
            StackConfig::default(),
        );
        let (root, mailbox) = stack.mount(Interface::Consensus, "probe");
        (stack, root, mailbox)
    }

    #[tokio::test]
    async fn lifecycle_events_are_posted_not_inlined() {
        *TRACING;
        let (mut stack, _root, mut mailbox) = probe_stack();
        // construction finished, but nothing ran yet
        assert!(mailbox.try_recv().is_err());
        stack.drain();
        match mailbox.try_recv().unwrap() {
            Event::Decide { value } => assert_eq!(value, b"init".to_vec()),
            event => panic!("unexpected {:?}", event),
        }
    }

    #[tokio::test]
    async fn posts_from_one_handler_run_in_fifo_order() {
        *TRACING;
        let (mut stack, root, mut mailbox) = probe_stack();
        stack.drain();
        mailbox.try_recv().unwrap(); // init marker

        stack.post(
            root,
            Event::Propose {
                value: Vec::new(),
            },
        );
        stack.drain();
        for expected in [b"1", b"2", b"3"] {
            match mailbox.try_recv().unwrap() {
                Event::Decide { value } => assert_eq!(value, expected.to_vec()),
                event => panic!("unexpected {:?}", event),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_deadline_timers_fire_in_arming_order() {
        *TRACING;
        let (stack, root, mut mailbox) = probe_stack();
        let injector = stack.injector();
        tokio::spawn(stack.run());
        injector
            .send((
                root,
                Event::Broadcast {
                    message: Vec::new(),
                },
            ))
            .unwrap();

        let mut values = Vec::new();
        while values.len() < 2 {
            match timeout(Duration::from_secs(1), mailbox.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Event::Decide { value } if value != b"init".to_vec() => values.push(value),
                _ => {}
            }
        }
        assert_eq!(values, vec![vec![1], vec![2]]);
    }

    #[tokio::test]
    #[should_panic(expected = "duplicate module name")]
    async fn colliding_instance_names_are_fatal() {
        let (mut stack, _root, _mailbox) = probe_stack();
        stack.mount(Interface::Consensus, "probe");
    }
}
