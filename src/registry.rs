use std::collections::HashMap;
use std::fmt::Write as _;

use crate::runtime::{Boot, Seed};

/// Abstract interface names. A stack is composed by binding each interface
/// to one concrete implementation and letting `uses` declarations pull in
/// child trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Interface {
    FairLossLink,
    StubbornLink,
    PerfectLink,
    LoggedPerfectLink,
    FifoLink,
    PerfectFailureDetector,
    EventuallyPerfectFailureDetector,
    LeaderElection,
    EventualLeaderDetector,
    BestEffortBroadcast,
    ReliableBroadcast,
    UniformReliableBroadcast,
    ProbabilisticBroadcast,
    FifoReliableBroadcast,
    CausalOrderBroadcast,
    Consensus,
    UniformConsensus,
    EpochChange,
    EpochConsensus,
    ReplicatedLog,
    OneNRegularRegister,
    OneOneAtomicRegister,
    OneNAtomicRegister,
}

/// One `uses` declaration: which interface a module consumes, under which
/// role attribute. `implementation` pins a specific candidate instead of
/// the bound one (e.g. lazy gossip disseminating through the eager
/// variant, whatever `ProbabilisticBroadcast` itself is bound to).
#[derive(Debug, Clone, Copy)]
pub struct Uses {
    pub interface: Interface,
    pub implementation: Option<&'static str>,
    pub role: &'static str,
}

impl Uses {
    pub fn of(interface: Interface, role: &'static str) -> Self {
        Self {
            interface,
            implementation: None,
            role,
        }
    }

    pub fn named(interface: Interface, implementation: &'static str, role: &'static str) -> Self {
        Self {
            interface,
            implementation: Some(implementation),
            role,
        }
    }
}

/// A concrete module implementation: its name, the interfaces it consumes,
/// and its constructor.
pub struct Blueprint {
    implementation: &'static str,
    uses: Vec<Uses>,
    construct: Box<dyn Fn(Seed<'_>) -> Boot + Send + Sync>,
}

impl Blueprint {
    pub fn new(
        implementation: &'static str,
        uses: Vec<Uses>,
        construct: impl Fn(Seed<'_>) -> Boot + Send + Sync + 'static,
    ) -> Self {
        Self {
            implementation,
            uses,
            construct: Box::new(construct),
        }
    }

    pub fn implementation(&self) -> &'static str {
        self.implementation
    }

    pub fn uses(&self) -> &[Uses] {
        &self.uses
    }

    pub(crate) fn construct(&self, seed: Seed<'_>) -> Boot {
        (self.construct)(seed)
    }
}

/// Process-wide mapping from interface names to implementations.
/// Implementations register as candidates; `bind` selects the one used
/// when a `uses` declaration does not pin a candidate itself. Resolution
/// failures are fatal: they can only happen at stack-construction time.
#[derive(Default)]
pub struct Registry {
    candidates: HashMap<Interface, Vec<Blueprint>>,
    bound: HashMap<Interface, &'static str>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interface: Interface, blueprint: Blueprint) {
        self.candidates.entry(interface).or_default().push(blueprint);
    }

    /// Swaps in a blueprint for an already-registered implementation name,
    /// keeping any binding to it. Lets tests reparameterize a candidate.
    pub fn replace(&mut self, interface: Interface, blueprint: Blueprint) {
        let candidates = self.candidates.entry(interface).or_default();
        candidates.retain(|candidate| candidate.implementation != blueprint.implementation);
        candidates.push(blueprint);
    }

    pub fn bind(&mut self, interface: Interface, implementation: &'static str) {
        assert!(
            self.candidate(interface, implementation).is_some(),
            "binding {:?} to unregistered implementation {}",
            interface,
            implementation,
        );
        self.bound.insert(interface, implementation);
    }

    fn candidate(&self, interface: Interface, implementation: &str) -> Option<&Blueprint> {
        self.candidates
            .get(&interface)?
            .iter()
            .find(|blueprint| blueprint.implementation == implementation)
    }

    pub fn resolve(&self, interface: Interface, implementation: Option<&str>) -> &Blueprint {
        let implementation = implementation
            .or_else(|| self.bound.get(&interface).copied())
            .unwrap_or_else(|| panic!("no binding for interface {:?}", interface));
        self.candidate(interface, implementation).unwrap_or_else(|| {
            panic!(
                "no candidate {} registered for {:?}",
                implementation, interface
            )
        })
    }

    /// Renders the interface catalogue: every candidate and its `uses`
    /// list, bound implementations marked.
    pub fn describe(&self) -> String {
        let mut interfaces: Vec<_> = self.candidates.keys().copied().collect();
        interfaces.sort_unstable();
        let mut out = String::new();
        for interface in interfaces {
            writeln!(out, "{:?}", interface).unwrap();
            for blueprint in &self.candidates[&interface] {
                let mark = if self.bound.get(&interface) == Some(&blueprint.implementation) {
                    "*"
                } else {
                    "-"
                };
                writeln!(out, "{} {}", mark, blueprint.implementation).unwrap();
                for uses in &blueprint.uses {
                    match uses.implementation {
                        Some(pinned) => {
                            writeln!(out, "  + {:?} ({}) as {}", uses.interface, pinned, uses.role)
                                .unwrap()
                        }
                        None => writeln!(out, "  + {:?} as {}", uses.interface, uses.role).unwrap(),
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}

/// The stock registry: every implementation in the crate as a candidate,
/// with the default bindings a plain consensus stack expects.
pub fn defaults() -> Registry {
    let mut registry = Registry::new();

    registry.register(Interface::FairLossLink, crate::link::BasicLink::blueprint());
    registry.register(
        Interface::StubbornLink,
        crate::link::RetransmitForever::blueprint(),
    );
    registry.register(
        Interface::StubbornLink,
        crate::link::RetransmitWithAck::blueprint(),
    );
    registry.register(
        Interface::PerfectLink,
        crate::link::EliminateDuplicates::blueprint(),
    );
    registry.register(
        Interface::LoggedPerfectLink,
        crate::link::LogDelivered::blueprint(),
    );
    registry.register(Interface::FifoLink, crate::link::SequenceNumber::blueprint());

    registry.register(
        Interface::PerfectFailureDetector,
        crate::failure_detector::ExcludeOnTimeout::blueprint(),
    );
    registry.register(
        Interface::EventuallyPerfectFailureDetector,
        crate::failure_detector::IncreasingTimeout::blueprint(),
    );

    registry.register(
        Interface::LeaderElection,
        crate::leader_election::MonarchicalLeaderElection::blueprint(),
    );
    registry.register(
        Interface::EventualLeaderDetector,
        crate::leader_election::MonarchicalEventualLeaderElection::blueprint(),
    );
    registry.register(
        Interface::EventualLeaderDetector,
        crate::leader_election::ElectLowerEpoch::blueprint(),
    );

    registry.register(
        Interface::BestEffortBroadcast,
        crate::broadcast::BasicBroadcast::blueprint(),
    );
    registry.register(
        Interface::ReliableBroadcast,
        crate::broadcast::LazyReliableBroadcast::blueprint(),
    );
    registry.register(
        Interface::ReliableBroadcast,
        crate::broadcast::EagerReliableBroadcast::blueprint(),
    );
    registry.register(
        Interface::UniformReliableBroadcast,
        crate::broadcast::AllAckUniformBroadcast::blueprint(),
    );
    registry.register(
        Interface::UniformReliableBroadcast,
        crate::broadcast::MajorityAckUniformBroadcast::blueprint(),
    );

    registry.register(
        Interface::ProbabilisticBroadcast,
        crate::gossip::EagerProbabilisticBroadcast::blueprint(),
    );
    registry.register(
        Interface::ProbabilisticBroadcast,
        crate::gossip::LazyProbabilisticBroadcast::blueprint(),
    );

    registry.register(
        Interface::FifoReliableBroadcast,
        crate::ordering::BroadcastWithSequenceNumber::blueprint(),
    );
    registry.register(
        Interface::CausalOrderBroadcast,
        crate::ordering::NoWaitingCausalBroadcast::blueprint(),
    );
    registry.register(
        Interface::CausalOrderBroadcast,
        crate::ordering::WaitingCausalBroadcast::blueprint(),
    );

    registry.register(
        Interface::Consensus,
        crate::consensus::FloodingConsensus::blueprint(),
    );
    registry.register(
        Interface::Consensus,
        crate::consensus::HierarchicalConsensus::blueprint(),
    );
    registry.register(Interface::Consensus, crate::paxos::Synod::blueprint());
    registry.register(
        Interface::UniformConsensus,
        crate::consensus::FloodingUniformConsensus::blueprint(),
    );
    registry.register(
        Interface::UniformConsensus,
        crate::consensus::HierarchicalUniformConsensus::blueprint(),
    );
    registry.register(
        Interface::UniformConsensus,
        crate::consensus::LeaderDrivenConsensus::blueprint(),
    );
    registry.register(
        Interface::EpochChange,
        crate::consensus::LeaderBasedEpochChange::blueprint(),
    );
    registry.register(
        Interface::EpochConsensus,
        crate::consensus::ReadWriteEpochConsensus::blueprint(),
    );
    registry.register(Interface::ReplicatedLog, crate::paxos::MultiPaxos::blueprint());

    registry.register(
        Interface::OneNRegularRegister,
        crate::register::ReadOneWriteAll::blueprint(),
    );
    registry.register(
        Interface::OneNRegularRegister,
        crate::register::MajorityVotingRegularRegister::blueprint(),
    );
    registry.register(
        Interface::OneOneAtomicRegister,
        crate::register::RegularToAtomic::blueprint(),
    );
    registry.register(
        Interface::OneNAtomicRegister,
        crate::register::AtomicFanOut::blueprint(),
    );

    registry.bind(Interface::FairLossLink, "BasicLink");
    registry.bind(Interface::StubbornLink, "RetransmitWithAck");
    registry.bind(Interface::PerfectLink, "EliminateDuplicates");
    registry.bind(Interface::LoggedPerfectLink, "LogDelivered");
    registry.bind(Interface::FifoLink, "SequenceNumber");
    registry.bind(Interface::PerfectFailureDetector, "ExcludeOnTimeout");
    registry.bind(
        Interface::EventuallyPerfectFailureDetector,
        "IncreasingTimeout",
    );
    registry.bind(Interface::LeaderElection, "MonarchicalLeaderElection");
    registry.bind(
        Interface::EventualLeaderDetector,
        "MonarchicalEventualLeaderElection",
    );
    registry.bind(Interface::BestEffortBroadcast, "BasicBroadcast");
    registry.bind(Interface::ReliableBroadcast, "LazyReliableBroadcast");
    registry.bind(
        Interface::UniformReliableBroadcast,
        "MajorityAckUniformBroadcast",
    );
    registry.bind(Interface::ProbabilisticBroadcast, "LazyProbabilisticBroadcast");
    registry.bind(Interface::FifoReliableBroadcast, "BroadcastWithSequenceNumber");
    registry.bind(Interface::CausalOrderBroadcast, "NoWaitingCausalBroadcast");
    registry.bind(Interface::Consensus, "FloodingConsensus");
    registry.bind(Interface::UniformConsensus, "FloodingUniformConsensus");
    registry.bind(Interface::EpochChange, "LeaderBasedEpochChange");
    registry.bind(Interface::EpochConsensus, "ReadWriteEpochConsensus");
    registry.bind(Interface::ReplicatedLog, "MultiPaxos");
    registry.bind(Interface::OneNRegularRegister, "MajorityVotingRegularRegister");
    registry.bind(Interface::OneOneAtomicRegister, "RegularToAtomic");
    registry.bind(Interface::OneNAtomicRegister, "AtomicFanOut");

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_everything_bound() {
        let registry = defaults();
        for interface in [
            Interface::FairLossLink,
            Interface::StubbornLink,
            Interface::PerfectLink,
            Interface::BestEffortBroadcast,
            Interface::ReliableBroadcast,
            Interface::UniformReliableBroadcast,
            Interface::Consensus,
            Interface::UniformConsensus,
            Interface::EpochChange,
            Interface::EpochConsensus,
            Interface::OneNRegularRegister,
        ] {
            registry.resolve(interface, None);
        }
    }

    #[test]
    fn pinned_candidate_overrides_binding() {
        let registry = defaults();
        let stubborn = registry.resolve(Interface::StubbornLink, Some("RetransmitForever"));
        assert_eq!(stubborn.implementation(), "RetransmitForever");
        let bound = registry.resolve(Interface::StubbornLink, None);
        assert_eq!(bound.implementation(), "RetransmitWithAck");
    }

    #[test]
    #[should_panic(expected = "no binding")]
    fn unbound_interface_is_fatal() {
        let registry = Registry::new();
        registry.resolve(Interface::Consensus, None);
    }

    #[test]
    fn describe_lists_candidates_and_uses() {
        let catalogue = defaults().describe();
        assert!(catalogue.contains("* RetransmitWithAck"));
        assert!(catalogue.contains("- RetransmitForever"));
        assert!(catalogue.contains("* FloodingConsensus"));
        assert!(catalogue.contains("+ BestEffortBroadcast as beb"));
    }
}
