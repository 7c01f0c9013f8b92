use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::runtime::Builder;
use tracing::{info, warn, Level};

use stratum::common::{Address, Membership};
use stratum::registry::{self, Interface};
use stratum::runtime::{Event, Injector, ModuleId, Stack, StackConfig};
use stratum::transport::{Endpoint, UdpEndpoint, DELAY_MAX};

#[derive(Parser)]
#[clap(name = "proc", about = "Run one (or all) members of a protocol stack")]
struct Args {
    /// Log level: trace, debug, info, warn, error
    #[clap(short, long, default_value = "info")]
    level: String,
    /// Shortcut for debug-level logging
    #[clap(short, long)]
    verbose: bool,
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// Which member this OS process runs
    #[clap(short = 'i', long, default_value_t = 0)]
    host_id: usize,
    #[clap(short = 'n', long, default_value_t = 3)]
    member_count: usize,
    #[clap(long, default_value_t = 5000)]
    port_start: u16,
    /// Run every member in this process, one stack each
    #[clap(short, long)]
    all_in_one: bool,
    /// Root interface to mount: consensus, uniform-consensus, epoch-change,
    /// broadcast, register, replicated-log
    #[clap(short, long, default_value = "consensus")]
    module: String,
    /// Accept admin pokes that make random members propose
    #[clap(short = 'A', long)]
    admin: bool,
    #[clap(long, default_value_t = 4000)]
    admin_port: u16,
    #[clap(long, default_value = ".")]
    store_dir: PathBuf,
}

fn root_interface(module: &str) -> (Interface, &'static str) {
    match module {
        "consensus" => (Interface::Consensus, "con"),
        "uniform-consensus" => (Interface::UniformConsensus, "ucon"),
        "epoch-change" => (Interface::EpochChange, "ec"),
        "broadcast" => (Interface::ReliableBroadcast, "rb"),
        "register" => (Interface::OneNRegularRegister, "reg"),
        "replicated-log" => (Interface::ReplicatedLog, "mp"),
        other => panic!("unknown module {}", other),
    }
}

fn log_indications(addr: Address, mut mailbox: tokio::sync::mpsc::UnboundedReceiver<Event>) {
    tokio::spawn(async move {
        while let Some(event) = mailbox.recv().await {
            match event {
                Event::Decide { value } => {
                    info!("{}: decision {:?}", addr, String::from_utf8_lossy(&value))
                }
                Event::Deliver { src, message } => info!(
                    "{}: recv {:?} from {}",
                    addr,
                    String::from_utf8_lossy(&message),
                    src
                ),
                Event::Executed { pos, command } => info!(
                    "{}: executed [{}] {:?}",
                    addr,
                    pos,
                    String::from_utf8_lossy(&command)
                ),
                Event::StartEpoch { ts, leader } => {
                    info!("{}: {} starts epoch {}", addr, leader, ts)
                }
                Event::Crash { peer } => info!("{}: {} crashed", addr, peer),
                Event::Suspect { peer } => info!("{}: suspect {}", addr, peer),
                Event::Restore { peer } => info!("{}: restore {}", addr, peer),
                Event::Leader { leader } | Event::Trust { leader } => {
                    info!("{}: leader {}", addr, leader)
                }
                event => info!("{}: {:?}", addr, event),
            }
        }
    });
}

async fn admin_poker(port: u16, targets: Vec<(ModuleId, Injector)>) {
    let socket = match UdpSocket::bind(("127.0.0.1", port)).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("admin endpoint failed to bind: {}", err);
            return;
        }
    };
    info!("admin at 127.0.0.1:{}", port);
    let mut buffer = [0; 64];
    loop {
        let (length, _) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(_) => continue,
        };
        let count = String::from_utf8_lossy(&buffer[..length])
            .trim()
            .parse::<usize>()
            .unwrap_or(1)
            .min(targets.len());
        // poke a few random members to propose random one-letter values
        let mut rng = rand::thread_rng();
        for (root, injector) in targets.choose_multiple(&mut rng, count) {
            let value = vec![b'A' + rng.gen_range(0..26)];
            let _ = injector.send((
                *root,
                Event::Propose {
                    value,
                },
            ));
        }
    }
}

fn main() {
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::from_str(&args.level).expect("valid log level")
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let members: Vec<Address> = (0..args.member_count)
        .map(|i| {
            format!("{}:{}", args.host, args.port_start + i as u16)
                .parse()
                .expect("valid member address")
        })
        .collect();
    let (interface, name) = root_interface(&args.module);

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let mut targets = Vec::new();
        for (i, &addr) in members.iter().enumerate() {
            if i != args.host_id && !args.all_in_one {
                continue;
            }
            let (endpoint, inbound) = UdpEndpoint::bind(addr, DELAY_MAX)
                .await
                .expect("bind member socket");
            let mut stack = Stack::new(
                Membership::new(addr, members.iter().copied()),
                endpoint as Arc<dyn Endpoint>,
                inbound,
                registry::defaults(),
                StackConfig {
                    store_dir: args.store_dir.clone(),
                },
            );
            let (root, mailbox) = stack.mount(interface, name);
            info!("listen at {}", addr);
            log_indications(addr, mailbox);
            targets.push((root, stack.injector()));
            tokio::spawn(stack.run());
        }

        if args.admin {
            tokio::spawn(admin_poker(args.admin_port, targets));
        }

        tokio::signal::ctrl_c().await.expect("install signal handler");
        info!("shutting down");
        // stacks stop with the process
        tokio::time::sleep(Duration::from_millis(50)).await;
    });
}
