//! Layered distributed protocol abstractions collection.
//!
//! Every abstraction from the catalogue — point-to-point links, failure
//! detectors, broadcast, ordering, consensus, registers — is an event-driven
//! module with a published interface: the requests it accepts, the
//! indications it emits, and the properties it offers. Higher abstractions
//! never talk to the network themselves; they declare the interfaces they
//! consume and the composition layer wires a per-process stack out of the
//! bound implementations.
//!
//! The document here mainly covers:
//! * How a stack is put together. Check [`registry`] for the interface
//!   catalogue and [`runtime`] for the scheduler contract; [`link`] is the
//!   beginner example of a module family.
//! * How to evaluate with this codebase. The `proc` binary runs one or all
//!   members of a deployment over kernel UDP; tests run whole deployments
//!   on [`simulated`] with paused time.
//!
//! # Scheduling model
//!
//! One cooperative event loop per process. Handlers run to completion and
//! never interrupt each other; everything a handler causes — posting an
//! event, arming a timer, building a module — takes effect after it
//! returns, in FIFO order. Timers are enqueued deliveries at a deadline and
//! cannot be cancelled; stale firings must be no-ops for their module.
//! The transport delays every send and every delivery by an independent
//! uniform draw, which is what models asynchrony here: nothing else in the
//! codebase is allowed to race.

/// Common definitions. Extract them so future refactor can be easier.
///
/// Kept specification-like on purpose: aliases such as
/// [`Address`](common::Address) and [`Opaque`](common::Opaque) pin down what
/// the rest of the codebase may assume about identity and payloads, and the
/// bincode helpers are the single deterministic encoding used for wire
/// frames, dedup digests and stable storage alike.
pub mod common;

/// Event scheduler and module stack: [`Event`](runtime::Event),
/// [`Module`](runtime::Module), [`Stack`](runtime::Stack),
/// [`Context`](runtime::Context).
pub mod runtime;

/// Interface names, blueprints and the registry binding abstract names to
/// concrete implementations.
pub mod registry;

/// Datagram endpoints: the wire frame, the UDP transport, and the random
/// latency model both directions share.
pub mod transport;

/// Simulated facilities for writing test cases.
#[cfg(any(test, doc))]
pub mod simulated;

/// Stable storage with atomic-replace semantics, one file per storeid.
pub mod store;

/// Point-to-point links: fair-loss, stubborn (both flavors), perfect,
/// logged-perfect, FIFO.
pub mod link;

/// Failure detectors: perfect and eventually perfect.
pub mod failure_detector;

/// Leader detectors: monarchical over either failure detector, and the
/// crash-recovery elect-lower-epoch variant.
pub mod leader_election;

/// Broadcast: best-effort, reliable (lazy and eager), uniform reliable
/// (all-ack and majority-ack).
pub mod broadcast;

/// Probabilistic (gossip) broadcast: eager push, and lazy push with a pull
/// recovery phase.
pub mod gossip;

/// Ordered broadcast: FIFO, no-waiting causal, vector-clock causal.
pub mod ordering;

/// Consensus: flooding and hierarchical (regular and uniform), epoch
/// change, epoch consensus, and the leader-driven composition.
pub mod consensus;

/// Paxos: single-decree Synod and the Multi-Paxos slot-allocation skeleton.
pub mod paxos;

/// Registers: (1,N) regular (read-one-write-all and majority voting), and
/// the atomic (1,1) and (1,N) layerings above them.
pub mod register;

#[cfg(test)]
pub mod tests {
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref TRACING: () = {
            tracing_subscriber::fmt::init();
        };
    }
}
