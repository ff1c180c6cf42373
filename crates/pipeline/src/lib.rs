#![doc = include_str!("../README.md")]

pub mod factory;
pub mod node;
pub mod plugin;
pub mod selector;
pub mod topology;
pub mod virtual_node;
pub mod worker;

pub mod prelude {
    pub use crate::{
        factory::{FactoryError, FactoryState, FrameFactory, Routed},
        node::{ControlId, NodeCompletion, NodeError, PipeNode, SharedNode, share},
        plugin::{Capability, CapabilityKind, CapabilitySet, PluginError, VendorPlugin},
        selector::{CaptureSelector, REPROCESSING_HOLD_COUNT, SelectionCriterion},
        topology::{BranchFlag, GraphVariant, Linkage, StageDescriptor, Topology, stage},
        virtual_node::VirtualNode,
        worker::{CompletionSink, RetryBudget, StageWorker, release_buffer},
    };
    pub use aperture_core::prelude::*;
}
