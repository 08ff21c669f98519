//! Core domain models for sortie.
//!
//! Agents, links and the chain that orders them, facts, and the immutable
//! ability/adversary/planner definitions operations are built from.

pub mod ability;
pub mod agent;
pub mod chain;
pub mod definitions;
pub mod fact;
pub mod link;

pub use ability::{Ability, Adversary, ExecutorDef, FactSource, ParserDef, PlannerDefinition};
pub use agent::{AgentDefaults, AgentRecord, NormalizedProfile, Paw, Platform, Privilege};
pub use chain::LinkChain;
pub use definitions::Definitions;
pub use fact::{Fact, FactStore, InMemoryFactStore};
pub use link::{Instruction, Link, LinkCandidate, LinkId, LinkResult, LinkStatus, OperationId};
