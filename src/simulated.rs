use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::common::{Address, Membership, Opaque};
use crate::registry::{self, Interface, Registry};
use crate::runtime::{Event, Injector, ModuleId, Stack, StackConfig};
use crate::transport::{random_delay, Endpoint, Inbound};

/// In-memory network hub for writing test cases. Each attached address gets
/// its own inbound queue; datagrams take two independent random-delay draws
/// (the send leg and the delivery leg) before arriving. Crashed or
/// partitioned addresses exchange nothing until healed.
pub struct Hub {
    state: Arc<Mutex<HubState>>,
    delay_max: Duration,
}

struct HubState {
    links: HashMap<Address, mpsc::UnboundedSender<Inbound>>,
    down: HashSet<Address>,
    cut: HashSet<(Address, Address)>,
}

impl Hub {
    pub fn new(delay_max: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                links: HashMap::new(),
                down: HashSet::new(),
                cut: HashSet::new(),
            })),
            delay_max,
        }
    }

    pub fn attach(&self, addr: Address) -> (Arc<HubEndpoint>, UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().links.insert(addr, tx);
        let endpoint = Arc::new(HubEndpoint {
            addr,
            delay_max: self.delay_max,
            state: self.state.clone(),
        });
        (endpoint, rx)
    }

    /// Cuts an address off in both directions. Models a crash-stop (never
    /// heal) or a partition (heal later).
    pub fn crash(&self, addr: Address) {
        self.state.lock().unwrap().down.insert(addr);
    }

    pub fn heal(&self, addr: Address) {
        self.state.lock().unwrap().down.remove(&addr);
    }

    /// Drops everything flowing from `from` to `to`, one direction only.
    pub fn cut(&self, from: Address, to: Address) {
        self.state.lock().unwrap().cut.insert((from, to));
    }

    pub fn uncut(&self, from: Address, to: Address) {
        self.state.lock().unwrap().cut.remove(&(from, to));
    }
}

pub struct HubEndpoint {
    addr: Address,
    delay_max: Duration,
    state: Arc<Mutex<HubState>>,
}

impl Endpoint for HubEndpoint {
    fn send(&self, channel: &str, dest: Address, message: Opaque) {
        let state = self.state.clone();
        {
            let guard = state.lock().unwrap();
            if guard.down.contains(&self.addr) || !guard.links.contains_key(&dest) {
                debug!("{} -> {} dropped at send", self.addr, dest);
                return;
            }
        }
        let delay = random_delay(self.delay_max) + random_delay(self.delay_max);
        let channel = channel.to_string();
        let src = self.addr;
        tokio::spawn(async move {
            sleep(delay).await;
            let guard = state.lock().unwrap();
            if guard.down.contains(&src)
                || guard.down.contains(&dest)
                || guard.cut.contains(&(src, dest))
            {
                debug!("{} -> {} dropped in flight", src, dest);
                return;
            }
            if let Some(tx) = guard.links.get(&dest) {
                let _ = tx.send((channel, src, message));
            }
        });
    }
}

/// A complete simulated deployment: one stack per member, all mounted with
/// the same root interface, running on the current tokio runtime.
pub struct System {
    pub hub: Hub,
    pub members: Vec<Address>,
    pub roots: Vec<ModuleId>,
    pub injectors: Vec<Injector>,
    pub mailboxes: Vec<UnboundedReceiver<Event>>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl System {
    pub fn launch(n: usize, delay_max: Duration, interface: Interface, name: &str) -> Self {
        Self::launch_with(n, delay_max, interface, name, registry::defaults)
    }

    pub fn launch_with(
        n: usize,
        delay_max: Duration,
        interface: Interface,
        name: &str,
        registry: impl Fn() -> Registry,
    ) -> Self {
        let members: Vec<Address> = (0..n)
            .map(|i| format!("127.0.0.1:{}", 5000 + i).parse().unwrap())
            .collect();
        let hub = Hub::new(delay_max);
        let store_dir = std::env::temp_dir().join(format!(
            "stratum-system-{:x}",
            crate::common::generate_id()
        ));
        std::fs::create_dir_all(&store_dir).unwrap();

        let mut roots = Vec::new();
        let mut injectors = Vec::new();
        let mut mailboxes = Vec::new();
        let mut tasks = Vec::new();
        for &addr in &members {
            let (endpoint, inbound) = hub.attach(addr);
            let mut stack = Stack::new(
                Membership::new(addr, members.iter().copied()),
                endpoint,
                inbound,
                registry(),
                StackConfig {
                    store_dir: store_dir.clone(),
                },
            );
            let (root, mailbox) = stack.mount(interface, name);
            roots.push(root);
            injectors.push(stack.injector());
            mailboxes.push(mailbox);
            tasks.push(tokio::spawn(stack.run()));
        }
        Self {
            hub,
            members,
            roots,
            injectors,
            mailboxes,
            tasks,
        }
    }

    pub fn inject(&self, i: usize, event: Event) {
        self.injectors[i].send((self.roots[i], event)).unwrap();
    }
}

/// Waits for the next `Decide` indication, skipping everything else.
pub async fn decided(mailbox: &mut UnboundedReceiver<Event>) -> Opaque {
    loop {
        match mailbox.recv().await.expect("mailbox open") {
            Event::Decide { value } => return value,
            _ => {}
        }
    }
}

/// Waits for the next `Deliver` indication, skipping everything else.
pub async fn delivered(mailbox: &mut UnboundedReceiver<Event>) -> (Address, Opaque) {
    loop {
        match mailbox.recv().await.expect("mailbox open") {
            Event::Deliver { src, message } => return (src, message),
            _ => {}
        }
    }
}
