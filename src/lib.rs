//! Reactive flow installation engine for an OpenFlow 1.3 SDN controller plugin.
//!
//! A switch-connection layer (external) delivers parsed packet-in and flow-removed events; this
//! crate's [`pipeline::PipelineDriver`] runs them through an ordered chain of user-supplied
//! packet-miss handlers ([`decision::Decision`]-producing closures over a [`packet::PacketView`]),
//! locates or synthesises a [`flow::Flow`] for the packet via the [`runtime::TraceTree`], and asks
//! the [`backend::Backend`] to install the resulting rule on the switches it applies to. A
//! secondary [`stp::SpanningTree`] component maintains per-switch broadcast port sets over a
//! discovered link graph.
//!
//! The OpenFlow wire codec, the switch-connection manager, link discovery, and topology shortest
//! path are external collaborators: everything this crate consumes or produces is an already
//! decoded Rust value.

pub mod backend;
pub mod config;
pub mod decision;
pub mod error;
pub mod flow;
pub mod oxm;
pub mod packet;
pub mod pipeline;
pub mod port;
pub mod runtime;
pub mod stp;

pub use backend::{Backend, MapleBackend, SwitchConnection};
pub use config::MapleConfig;
pub use decision::{CustomDecision, Decision};
pub use error::{MapleError, Result};
pub use flow::{Flow, FlowRef, FlowRemovedReason, FlowState};
pub use pipeline::{PacketIn, PacketInReason, PipelineDriver};
pub use stp::{SpanningTree, Topology};
