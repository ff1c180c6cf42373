use aperture_core::prelude::{FrameKind, RequestFlags, StageId};
use smallvec::SmallVec;

/// Well-known stage ids.
///
/// A stage id names one hardware or software processing step; which of them
/// are active, and how they hand frames to each other, is declared per
/// scenario by [`Topology`].
pub mod stage {
    use aperture_core::prelude::StageId;

    /// Sensor front-end capture.
    pub const CAPTURE: StageId = StageId(0);
    /// Bayer-domain ISP (3A statistics + bayer processing).
    pub const BAYER: StageId = StageId(1);
    /// Main ISP.
    pub const ISP: StageId = StageId(2);
    /// Temporal/geometric post-processor (video stabilization path).
    pub const TPU: StageId = StageId(3);
    /// Dual-camera fusion.
    pub const FUSION: StageId = StageId(4);
    /// Preview scaler / color converter.
    pub const SCALER: StageId = StageId(5);
    /// Still-capture tap feeding the selector hold list.
    pub const CAPTURE_TAP: StageId = StageId(6);
    /// Picture crop/scale for still output.
    pub const PICTURE: StageId = StageId(7);
    /// JPEG encoder stage.
    pub const JPEG: StageId = StageId(8);
    /// Recording color conversion (video side branch).
    pub const VIDEO: StageId = StageId(9);
    /// Vision-only low-power stream.
    pub const VISION: StageId = StageId(10);
}

/// How a stage hands frames to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    /// Hardware passthrough; no software buffer handoff, the same worker
    /// drives the successor.
    Otf,
    /// Memory-mediated; the successor runs its own worker behind a queue.
    M2m,
    /// Last stage of the topology.
    Tail,
}

/// Which request flag gates an optional branch stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchFlag {
    Bayer,
    CaptureTap,
    PreviewCallback,
    Video,
}

impl BranchFlag {
    /// Whether `flags` enable this branch.
    pub fn enabled_in(self, flags: RequestFlags) -> bool {
        match self {
            BranchFlag::Bayer => flags.bayer,
            BranchFlag::CaptureTap => flags.capture_tap,
            BranchFlag::PreviewCallback => flags.preview_callback,
            BranchFlag::Video => flags.video,
        }
    }
}

/// One stage's place in a topology.
#[derive(Debug, Clone, Copy)]
pub struct StageDescriptor {
    pub id: StageId,
    pub name: &'static str,
    pub link: Linkage,
    /// `Some` when the stage participates per-frame, gated by a request
    /// flag snapshotted at frame creation.
    pub branch: Option<BranchFlag>,
    /// Dequeue wait for this stage's node, tuned to expected latency.
    pub node_wait_ms: u64,
}

const fn required(
    id: StageId,
    name: &'static str,
    link: Linkage,
    node_wait_ms: u64,
) -> StageDescriptor {
    StageDescriptor {
        id,
        name,
        link,
        branch: None,
        node_wait_ms,
    }
}

const fn optional(
    id: StageId,
    name: &'static str,
    link: Linkage,
    branch: BranchFlag,
    node_wait_ms: u64,
) -> StageDescriptor {
    StageDescriptor {
        id,
        name,
        link,
        branch: Some(branch),
        node_wait_ms,
    }
}

/// Named wiring variants, one per operating scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphVariant {
    Preview,
    PreviewTpu,
    PreviewDual,
    Reprocessing,
    Vision,
}

impl GraphVariant {
    /// Frame kind minted by this variant's full-journey constructor.
    pub fn frame_kind(self) -> FrameKind {
        match self {
            GraphVariant::Preview | GraphVariant::PreviewTpu | GraphVariant::PreviewDual => {
                FrameKind::Preview
            }
            GraphVariant::Reprocessing => FrameKind::Reprocessing,
            GraphVariant::Vision => FrameKind::Vision,
        }
    }

    /// Build the static topology for this variant.
    pub fn topology(self) -> Topology {
        use stage::*;
        let stages: Vec<StageDescriptor> = match self {
            GraphVariant::Preview => vec![
                required(CAPTURE, "capture", Linkage::Otf, 300),
                required(BAYER, "bayer", Linkage::M2m, 100),
                required(ISP, "isp", Linkage::Otf, 100),
                required(SCALER, "scaler", Linkage::M2m, 50),
                optional(CAPTURE_TAP, "capture_tap", Linkage::M2m, BranchFlag::CaptureTap, 2000),
                optional(VIDEO, "video", Linkage::Tail, BranchFlag::Video, 100),
            ],
            GraphVariant::PreviewTpu => vec![
                required(CAPTURE, "capture", Linkage::Otf, 300),
                required(BAYER, "bayer", Linkage::M2m, 100),
                required(ISP, "isp", Linkage::M2m, 100),
                required(TPU, "tpu", Linkage::Otf, 200),
                required(SCALER, "scaler", Linkage::M2m, 50),
                optional(CAPTURE_TAP, "capture_tap", Linkage::M2m, BranchFlag::CaptureTap, 2000),
                optional(VIDEO, "video", Linkage::Tail, BranchFlag::Video, 100),
            ],
            GraphVariant::PreviewDual => vec![
                required(CAPTURE, "capture", Linkage::Otf, 300),
                required(BAYER, "bayer", Linkage::M2m, 100),
                required(ISP, "isp", Linkage::M2m, 100),
                required(FUSION, "fusion", Linkage::Otf, 200),
                required(SCALER, "scaler", Linkage::M2m, 50),
                optional(CAPTURE_TAP, "capture_tap", Linkage::M2m, BranchFlag::CaptureTap, 2000),
                optional(VIDEO, "video", Linkage::Tail, BranchFlag::Video, 100),
            ],
            GraphVariant::Reprocessing => vec![
                required(BAYER, "bayer_re", Linkage::Otf, 2000),
                required(ISP, "isp_re", Linkage::M2m, 2000),
                required(PICTURE, "picture", Linkage::M2m, 1000),
                required(JPEG, "jpeg", Linkage::Tail, 2000),
            ],
            GraphVariant::Vision => vec![required(VISION, "vision", Linkage::Tail, 300)],
        };
        Topology {
            variant: self,
            stages,
        }
    }
}

/// Ordered stage list for one scenario, consumed by the generic worker
/// driver.
#[derive(Debug, Clone)]
pub struct Topology {
    pub variant: GraphVariant,
    pub stages: Vec<StageDescriptor>,
}

impl Topology {
    /// Ordered ids of every declared stage.
    pub fn stage_ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id).collect()
    }

    /// Descriptor for `id`, if declared.
    pub fn descriptor(&self, id: StageId) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Whether `id` is part of this topology.
    pub fn contains(&self, id: StageId) -> bool {
        self.descriptor(id).is_some()
    }

    /// Stages a frame with `flags` will visit, in order.
    pub fn stages_for(&self, flags: RequestFlags) -> SmallVec<[StageId; 8]> {
        self.stages
            .iter()
            .filter(|s| s.branch.is_none_or(|b| b.enabled_in(flags)))
            .map(|s| s.id)
            .collect()
    }

    /// Split into worker chains: a chain is a maximal run of OTF-linked
    /// stages; every optional branch stage is its own chain.
    pub fn chains(&self) -> Vec<Vec<StageDescriptor>> {
        let mut chains: Vec<Vec<StageDescriptor>> = Vec::new();
        let mut current: Vec<StageDescriptor> = Vec::new();
        for desc in &self.stages {
            if desc.branch.is_some() && !current.is_empty() {
                chains.push(std::mem::take(&mut current));
            }
            current.push(*desc);
            let chain_ends = match desc.link {
                Linkage::Otf => false,
                Linkage::M2m | Linkage::Tail => true,
            };
            if chain_ends || desc.branch.is_some() {
                chains.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            chains.push(current);
        }
        chains
    }

    /// Chain head stage whose chain contains `id`.
    pub fn chain_head_of(&self, id: StageId) -> Option<StageId> {
        self.chains()
            .into_iter()
            .find(|chain| chain.iter().any(|s| s.id == id))
            .and_then(|chain| chain.first().map(|s| s.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_core::prelude::RequestFlags;

    #[test]
    fn preview_chains_split_at_m2m_and_branches() {
        let topo = GraphVariant::Preview.topology();
        let chains: Vec<Vec<StageId>> = topo
            .chains()
            .into_iter()
            .map(|c| c.iter().map(|s| s.id).collect())
            .collect();
        assert_eq!(
            chains,
            vec![
                vec![stage::CAPTURE, stage::BAYER],
                vec![stage::ISP, stage::SCALER],
                vec![stage::CAPTURE_TAP],
                vec![stage::VIDEO],
            ]
        );
    }

    #[test]
    fn tpu_variant_inserts_post_processor() {
        let topo = GraphVariant::PreviewTpu.topology();
        assert!(topo.contains(stage::TPU));
        assert_eq!(topo.chain_head_of(stage::SCALER), Some(stage::TPU));
    }

    #[test]
    fn plain_frame_skips_optional_branches() {
        let topo = GraphVariant::Preview.topology();
        let plain = topo.stages_for(RequestFlags::default());
        assert_eq!(
            plain.as_slice(),
            &[stage::CAPTURE, stage::BAYER, stage::ISP, stage::SCALER]
        );
        let tapped = topo.stages_for(RequestFlags {
            capture_tap: true,
            ..RequestFlags::default()
        });
        assert!(tapped.contains(&stage::CAPTURE_TAP));
        assert!(!tapped.contains(&stage::VIDEO));
    }

    #[test]
    fn same_variant_reproduces_same_topology() {
        let a = GraphVariant::PreviewDual.topology();
        let b = GraphVariant::PreviewDual.topology();
        assert_eq!(a.stage_ids(), b.stage_ids());
    }

    #[test]
    fn reprocessing_is_a_separate_linear_graph() {
        let topo = GraphVariant::Reprocessing.topology();
        assert_eq!(
            topo.stage_ids(),
            vec![stage::BAYER, stage::ISP, stage::PICTURE, stage::JPEG]
        );
        assert!(!topo.contains(stage::SCALER));
    }
}
