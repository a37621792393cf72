// Streaming Gaussian splat compositor for Bevy.
//
// Splat records stream in over HTTP or from disk, a background thread keeps
// them depth-sorted and packed into a GPU texture, and a render-graph node
// composites them over the main pass. Regions of splats carry editable rigid
// transforms and boundary volumes, and a GPU pick pass resolves cursor
// positions against the composited result.

pub mod region;
pub mod service;
pub mod sort_worker;
pub mod splat_picker;
pub mod splat_record;
pub mod splat_render;
pub mod stream_loader;
pub mod view_transform;

pub use region::{
    BoundaryFace, BoundaryFaceGeometry, FileRegionStore, GizmoMode, GizmoSample,
    PersistedRegionState, RegionRegistry, RegionStore, SplatRegion,
};
pub use service::{
    CameraRig, SplatServiceConfig, SplatServicePlugin, SplattingContext,
};
pub use sort_worker::{
    RegionSortParams, SortCommand, SortOutput, SortThrottle, SortWorkerHandle,
};
pub use splat_picker::{PickCallbacks, PickHit, PickerRequest, PickerResult, SplatPickerPlugin};
pub use splat_record::{convert_ply, SplatRecord, SplatStore, RECORD_STRIDE};
pub use splat_render::{SplatRenderPlugin, SplatRenderState, SplatViewInputs};
pub use stream_loader::{LoadEvent, SourceKind, StreamLoad};
pub use view_transform::{
    compose_projection, compose_view, focal_lengths, unproject_pick, AXIS_CONVENTION, MM_TO_M,
};

use bevy::asset::embedded_asset;
use bevy::prelude::*;

struct EmbeddedShadersPlugin;

impl Plugin for EmbeddedShadersPlugin {
    fn build(&self, app: &mut App) {
        embedded_asset!(app, "../assets/shaders/splat_render.wgsl");
    }
}

/// Everything in one plugin: rendering, picking, and the streaming service.
#[derive(Default)]
pub struct SplatCompositorPlugin {
    pub config: SplatServiceConfig,
}

impl Plugin for SplatCompositorPlugin {
    fn build(&self, app: &mut App) {
        app.add_plugins((
            EmbeddedShadersPlugin,
            SplatRenderPlugin,
            SplatPickerPlugin,
            SplatServicePlugin {
                config: self.config.clone(),
            },
        ));
    }
}
