use std::path::PathBuf;

use aperture_core::prelude::{AllocMode, MemoryKind, PoolGeometry, StageId};
use aperture_pipeline::prelude::{GraphVariant, stage};
use smallvec::smallvec;

/// Structured parameter snapshot consumed at session start and at explicit
/// preview restarts. The engine never mutates it mid-session; mode switches
/// swap the whole snapshot and re-derive everything.
#[derive(Debug, Clone)]
pub struct ParameterSnapshot {
    pub preview_width: u32,
    pub preview_height: u32,
    pub picture_width: u32,
    pub picture_height: u32,
    pub fps: u32,
    pub tpu_enabled: bool,
    pub dual_mode: bool,
    pub vision_mode: bool,
    pub high_resolution_callback: bool,
    pub series_shot_count: u32,
    pub hdr_enabled: bool,
    pub low_light_fusion: bool,
    pub long_exposure_ms: Option<u64>,
    pub flash_required: bool,
    pub bayer_buffer_count: usize,
    pub preview_buffer_count: usize,
    pub picture_buffer_count: usize,
    pub ae_settle_skip: u32,
    pub burst_dir: Option<PathBuf>,
}

impl Default for ParameterSnapshot {
    fn default() -> Self {
        Self {
            preview_width: 1920,
            preview_height: 1080,
            picture_width: 4032,
            picture_height: 3024,
            fps: 30,
            tpu_enabled: false,
            dual_mode: false,
            vision_mode: false,
            high_resolution_callback: false,
            series_shot_count: 1,
            hdr_enabled: false,
            low_light_fusion: false,
            long_exposure_ms: None,
            flash_required: false,
            bayer_buffer_count: 8,
            preview_buffer_count: 6,
            picture_buffer_count: 4,
            ae_settle_skip: 3,
            burst_dir: None,
        }
    }
}

/// One pool the session must size and allocate for a graph.
#[derive(Debug, Clone)]
pub struct PoolPlan {
    pub stage: StageId,
    pub name: &'static str,
    pub geometry: PoolGeometry,
}

/// Scenario flags re-derived deterministically from the parameter snapshot
/// every time a graph is (re)built; identical snapshots always produce
/// identical flags and pool plans.
#[derive(Debug, Clone)]
pub struct ScenarioFlags {
    pub variant: GraphVariant,
    pub reprocessing: bool,
    pub skip_frames: u32,
    pub series_shot_count: u32,
    pub preview_pools: Vec<PoolPlan>,
    pub reprocessing_pools: Vec<PoolPlan>,
}

/// Geometry comparison for pool-reuse decisions across restarts: a match
/// means `reset_buffers` suffices, anything else forces deinit + realloc.
pub trait PoolGeometryExt {
    fn matches(&self, other: &PoolGeometry) -> bool;
}

impl PoolGeometryExt for PoolGeometry {
    fn matches(&self, other: &PoolGeometry) -> bool {
        self.plane_count == other.plane_count
            && self.plane_sizes == other.plane_sizes
            && self.strides == other.strides
            && self.min_count == other.min_count
            && self.max_count == other.max_count
    }
}

fn geometry(size: usize, stride: usize, count: usize, meta: bool) -> PoolGeometry {
    PoolGeometry {
        plane_count: 1,
        plane_sizes: smallvec![size],
        strides: smallvec![stride],
        min_count: count,
        max_count: count,
        alloc_mode: AllocMode::AtOnce,
        memory: MemoryKind::Cached,
        needs_meta_plane: meta,
        needs_mapping: false,
    }
}

impl ScenarioFlags {
    pub fn derive(params: &ParameterSnapshot) -> Self {
        let variant = if params.vision_mode {
            GraphVariant::Vision
        } else if params.dual_mode {
            GraphVariant::PreviewDual
        } else if params.tpu_enabled {
            GraphVariant::PreviewTpu
        } else {
            GraphVariant::Preview
        };
        let reprocessing = !params.vision_mode;

        let bayer_bytes = (params.preview_width * params.preview_height * 2) as usize;
        let yuv_bytes = (params.preview_width * params.preview_height * 3 / 2) as usize;
        let picture_bytes = (params.picture_width * params.picture_height * 2) as usize;
        let jpeg_bytes = picture_bytes / 2;
        let stride = params.preview_width as usize;

        let preview_pools = match variant {
            GraphVariant::Vision => vec![PoolPlan {
                stage: stage::VISION,
                name: "vision",
                geometry: geometry(yuv_bytes, stride, params.preview_buffer_count, false),
            }],
            _ => {
                let mut pools = vec![
                    PoolPlan {
                        stage: stage::CAPTURE,
                        name: "bayer",
                        geometry: geometry(bayer_bytes, stride * 2, params.bayer_buffer_count, true),
                    },
                    PoolPlan {
                        stage: stage::BAYER,
                        name: "isp",
                        geometry: geometry(yuv_bytes, stride, params.preview_buffer_count, true),
                    },
                    PoolPlan {
                        stage: stage::SCALER,
                        name: "scp",
                        geometry: geometry(yuv_bytes, stride, params.preview_buffer_count, false),
                    },
                    PoolPlan {
                        stage: stage::VIDEO,
                        name: "video",
                        geometry: geometry(yuv_bytes, stride, 4, false),
                    },
                ];
                if reprocessing {
                    pools.push(PoolPlan {
                        stage: stage::CAPTURE_TAP,
                        name: "bayer_capture",
                        geometry: geometry(bayer_bytes, stride * 2, params.picture_buffer_count, true),
                    });
                }
                pools
            }
        };

        let reprocessing_pools = if reprocessing {
            vec![
                PoolPlan {
                    stage: stage::ISP,
                    name: "yuv_re",
                    geometry: geometry(picture_bytes, stride, params.picture_buffer_count, true),
                },
                PoolPlan {
                    stage: stage::PICTURE,
                    name: "picture",
                    geometry: geometry(picture_bytes, stride, params.picture_buffer_count, false),
                },
                PoolPlan {
                    stage: stage::JPEG,
                    name: "jpeg",
                    geometry: geometry(jpeg_bytes, 0, params.picture_buffer_count, false),
                },
            ]
        } else {
            Vec::new()
        };

        Self {
            variant,
            reprocessing,
            skip_frames: params.ae_settle_skip,
            series_shot_count: params.series_shot_count.max(1),
            preview_pools,
            reprocessing_pools,
        }
    }
}
