// Main-world orchestration: owns the record store, the region registry, the
// sorting thread and the active stream load, and drives all of them from
// three chained Update systems. The renderer and the sorting thread only ever
// see data that passed through here; nothing in this module blocks.

use bevy::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::region::{
    BoundaryFace, FileRegionStore, GizmoMode, GizmoSample, RegionRegistry, RegionStore,
    SplatRegion,
};
use crate::sort_worker::{SortCommand, SortOutput, SortThrottle, SortWorkerHandle};
use crate::splat_picker::PickCameraContext;
use crate::splat_record::{convert_ply, SplatStore};
use crate::splat_render::{
    RegionUniform, SplatRenderState, SplatTextureData, SplatViewInputs, MAX_REGIONS,
};
use crate::stream_loader::{LoadEvent, SourceKind, StreamLoad};
use crate::view_transform::{compose_projection, compose_view, focal_lengths, MM_TO_M};

/// Host camera and viewport state, written by the embedding application every
/// frame. Spatial values in scene millimeters, angles in radians.
#[derive(Resource, Clone, Copy)]
pub struct CameraRig {
    pub camera_world: Mat4,
    pub ground_world: Mat4,
    /// Height of the splat scene's floor above the ground plane.
    pub floor_offset: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    /// Viewport size in pixels.
    pub viewport: Vec2,
    /// Global multiplier on splat footprints.
    pub splat_scale: f32,
}

impl Default for CameraRig {
    fn default() -> Self {
        Self {
            camera_world: Mat4::IDENTITY,
            ground_world: Mat4::IDENTITY,
            floor_offset: 0.0,
            fov_y: 1.0,
            near: 100.0,
            far: 1_000_000.0,
            viewport: Vec2::new(1920.0, 1080.0),
            splat_scale: 1.0,
        }
    }
}

#[derive(Clone)]
pub struct SplatServiceConfig {
    /// Directory for persisted region state.
    pub persistence_dir: PathBuf,
    pub throttle: SortThrottle,
    /// Device 2D texture dimension limit the packed texture must fit.
    pub max_texture_dim: u32,
}

impl Default for SplatServiceConfig {
    fn default() -> Self {
        Self {
            persistence_dir: PathBuf::from("splat_regions"),
            throttle: SortThrottle::default(),
            max_texture_dim: 8192,
        }
    }
}

type ShownCallback = Box<dyn Fn(u8) + Send + Sync>;
type HiddenCallback = Box<dyn Fn() + Send + Sync>;

struct ActiveLoad {
    load: StreamLoad,
    /// PLY bodies are converted whole, so bytes accumulate here until
    /// completion instead of landing in the store per chunk.
    ply_bytes: Vec<u8>,
}

/// The one object tying the pipeline together. Loads are driven strictly one
/// at a time so each region's records pack append-only into the shared store.
#[derive(Resource)]
pub struct SplattingContext {
    store: SplatStore,
    registry: RegionRegistry,
    sorter: SortWorkerHandle,
    active: Option<ActiveLoad>,
    queued: VecDeque<(u8, String)>,
    hidden_splats: Arc<HashSet<u32>>,
    last_sent_count: u32,
    visible: bool,
    shown_callbacks: Vec<ShownCallback>,
    hidden_callbacks: Vec<HiddenCallback>,
}

impl SplattingContext {
    pub fn new(config: &SplatServiceConfig) -> Self {
        Self::with_store(
            Box::new(FileRegionStore::new(config.persistence_dir.clone())),
            config.throttle,
            config.max_texture_dim,
        )
    }

    pub fn with_store(
        store: Box<dyn RegionStore>,
        throttle: SortThrottle,
        max_texture_dim: u32,
    ) -> Self {
        Self {
            store: SplatStore::new(),
            registry: RegionRegistry::new(store, crate::splat_record::RECORD_STRIDE),
            sorter: SortWorkerHandle::spawn(throttle, max_texture_dim),
            active: None,
            queued: VecDeque::new(),
            hidden_splats: Arc::new(HashSet::new()),
            last_sent_count: 0,
            visible: false,
            shown_callbacks: Vec::new(),
            hidden_callbacks: Vec::new(),
        }
    }

    /// Registers a region for `file_path` (restoring any persisted state),
    /// queues its stream load, and makes the renderer visible. Returns the
    /// new region id.
    pub fn show_splat_renderer(&mut self, file_path: &str) -> u8 {
        let region_id = self.registry.register_region(file_path);
        self.queued.push_back((region_id, file_path.to_string()));
        self.visible = true;
        self.start_next_load();
        region_id
    }

    /// Hides the composited output. Loaded data, sort state and the packed
    /// texture all stay put for the next show.
    pub fn hide_splat_renderer(&mut self) {
        if !self.visible {
            return;
        }
        self.visible = false;
        for callback in &self.hidden_callbacks {
            callback();
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Called with the region id once that region's stream has fully loaded.
    pub fn on_splat_shown(&mut self, callback: impl Fn(u8) + Send + Sync + 'static) {
        self.shown_callbacks.push(Box::new(callback));
    }

    pub fn on_splat_hidden(&mut self, callback: impl Fn() + Send + Sync + 'static) {
        self.hidden_callbacks.push(Box::new(callback));
    }

    /// Tags a region's splats with a host label, carried through the packed
    /// texture flags into pick results. Forces a texture re-encode.
    pub fn set_region_label(&mut self, region_id: u8, label: u16) {
        self.registry.set_region_label(region_id, label);
        self.sorter.send(SortCommand::SetRegions {
            regions: self.registry.sort_params(),
        });
        self.sorter.send(SortCommand::EncodeTexture { force: true });
    }

    /// Replaces the hidden-splat set; the packed texture re-encodes with the
    /// visibility flags flipped.
    pub fn set_hidden_splats(&mut self, hidden: HashSet<u32>) {
        self.hidden_splats = Arc::new(hidden);
        self.sorter.send(SortCommand::SetVisibility {
            hidden: self.hidden_splats.clone(),
        });
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    pub fn record_count(&self) -> usize {
        self.store.record_count()
    }

    // --- gizmo passthroughs; every edit is mirrored to the sorting thread

    pub fn attach_gizmo(&mut self, region_id: u8) {
        self.registry.attach_gizmo(region_id);
    }

    pub fn detach_gizmo(&mut self) {
        self.registry.detach_gizmo();
    }

    pub fn gizmo_mode(&self) -> Option<(u8, GizmoMode)> {
        self.registry.gizmo_mode()
    }

    pub fn begin_boundary_drag(&mut self, face: BoundaryFace, gizmo_local: Vec3) {
        self.registry.begin_boundary_drag(face, gizmo_local);
    }

    pub fn end_boundary_drag(&mut self) {
        self.registry.end_boundary_drag();
    }

    /// Applies a gizmo pose sample and pushes the resulting region state to
    /// the sorting thread with an immediate re-sort.
    pub fn apply_gizmo_sample(&mut self, sample: GizmoSample) {
        self.registry.change_from_gizmo(sample);
        self.sync_regions();
    }

    pub fn raycast_boundary_face(
        &self,
        region_id: u8,
        origin: Vec3,
        dir: Vec3,
    ) -> Option<(BoundaryFace, Vec3)> {
        self.registry.raycast_boundary_face(region_id, origin, dir)
    }

    pub fn show_boundaries(&mut self) {
        self.registry.show();
    }

    pub fn hide_boundaries(&mut self) {
        self.registry.hide();
    }

    fn sync_regions(&self) {
        self.sorter.send(SortCommand::SetRegions {
            regions: self.registry.sort_params(),
        });
        self.sorter.send(SortCommand::ForceSort);
    }

    fn start_next_load(&mut self) {
        if self.active.is_some() {
            return;
        }
        if let Some((region_id, source)) = self.queued.pop_front() {
            self.active = Some(ActiveLoad {
                load: StreamLoad::start(region_id, &source),
                ply_bytes: Vec::new(),
            });
        }
    }

    /// Ships the latest store snapshot to the sorting thread when new records
    /// arrived since the last push. Each push also refreshes the region slices
    /// and queues a texture re-encode.
    fn push_buffer_if_grown(&mut self) {
        let count = self.store.record_count() as u32;
        if count > self.last_sent_count {
            self.sorter.send(SortCommand::SetBuffer {
                records: self.store.snapshot(),
                vertex_count: count,
            });
            self.sorter.send(SortCommand::SetRegions {
                regions: self.registry.sort_params(),
            });
            self.sorter.send(SortCommand::EncodeTexture { force: false });
            self.last_sent_count = count;
        }
    }

    /// Drops a trailing partial record left by a stream that ended short so
    /// the next region's records stay stride-aligned in the shared store.
    fn discard_partial_record(&mut self, region_id: u8) {
        let partial = self.store.truncate_partial();
        if partial != 0 {
            warn!(region_id, partial, "discarding trailing partial record");
            self.registry.discard_bytes(region_id, partial);
        }
    }

    fn finalize_load(&mut self, region_id: u8, ply_bytes: Vec<u8>) {
        self.discard_partial_record(region_id);
        if !ply_bytes.is_empty() {
            match convert_ply(&ply_bytes) {
                Ok(records) => {
                    self.registry.record_bytes(region_id, records.len());
                    self.store.append(&records);
                }
                Err(err) => {
                    error!(region_id, %err, "PLY conversion failed");
                    return;
                }
            }
        }
        self.push_buffer_if_grown();
        let restored = self
            .registry
            .region(region_id)
            .map(SplatRegion::restored)
            .unwrap_or(false);
        if !restored {
            self.sorter.send(SortCommand::ComputeRegionBounds { region_id });
        }
        info!(region_id, records = self.store.record_count(), "region fully streamed");
        for callback in &self.shown_callbacks {
            callback(region_id);
        }
    }
}

fn region_uniform(region: &SplatRegion) -> RegionUniform {
    let q = region.quaternion;
    RegionUniform {
        position_offset: region.position_offset.extend(0.0),
        quaternion: Vec4::new(q.x, q.y, q.z, q.w),
        boundary_min: region.boundary_min.extend(0.0),
        boundary_max: region.boundary_max.extend(0.0),
    }
}

/// Drains the active stream load: splat chunks append straight into the
/// store, PLY bytes accumulate for conversion on completion. At most one
/// load runs at a time.
fn drive_stream_loads(mut ctx: ResMut<SplattingContext>) {
    let Some(mut active) = ctx.active.take() else {
        ctx.start_next_load();
        return;
    };
    let region_id = active.load.region_id;
    let mut outcome = None;
    while let Some(event) = active.load.try_next() {
        match event {
            LoadEvent::Chunk(bytes) => match active.load.kind {
                SourceKind::Splat => {
                    ctx.registry.record_bytes(region_id, bytes.len());
                    ctx.store.append(&bytes);
                }
                SourceKind::Ply => active.ply_bytes.extend_from_slice(&bytes),
            },
            LoadEvent::Complete { total_bytes } => {
                outcome = Some(Ok(total_bytes));
                break;
            }
            LoadEvent::Failed(err) => {
                outcome = Some(Err(err));
                break;
            }
        }
    }
    ctx.push_buffer_if_grown();
    match outcome {
        None => ctx.active = Some(active),
        Some(Ok(_)) => {
            ctx.finalize_load(region_id, active.ply_bytes);
            ctx.start_next_load();
        }
        Some(Err(err)) => {
            // Whole records already appended stay renderable; the region
            // just stops growing.
            error!(region_id, %err, "splat stream failed");
            ctx.discard_partial_record(region_id);
            ctx.start_next_load();
        }
    }
}

/// Moves finished sort/encode results into the main-world render state.
fn poll_sort_outputs(mut ctx: ResMut<SplattingContext>, mut state: ResMut<SplatRenderState>) {
    let mut outputs = Vec::new();
    while let Some(output) = ctx.sorter.try_recv() {
        outputs.push(output);
    }
    for output in outputs {
        match output {
            SortOutput::SortResult {
                depth_index,
                vertex_count,
                generation,
            } => {
                state.depth_index = depth_index;
                state.sorted_count = vertex_count;
                state.sort_generation = generation;
            }
            SortOutput::TextureReady {
                width,
                rows,
                data,
                generation,
            } => {
                state.texture = Some(SplatTextureData {
                    width,
                    rows,
                    data,
                    generation,
                });
            }
            SortOutput::RegionBounds { region_id, min, max } => {
                ctx.registry
                    .update_boundary_from_streamed_bounds(region_id, min, max);
                ctx.sync_regions();
            }
            SortOutput::EncodeFailed { reason } => {
                warn!(reason, "packed texture encode failed, keeping previous texture");
            }
        }
    }
}

/// Composes the per-frame view inputs from the host camera and requests a
/// (throttled) re-sort against the current view.
fn update_view_inputs(
    ctx: Res<SplattingContext>,
    rig: Res<CameraRig>,
    mut state: ResMut<SplatRenderState>,
    mut inputs: ResMut<SplatViewInputs>,
    mut pick_context: ResMut<PickCameraContext>,
) {
    let aspect = rig.viewport.x / rig.viewport.y.max(1.0);
    let view = compose_view(rig.camera_world, rig.ground_world, rig.floor_offset);
    let proj = compose_projection(rig.fov_y, aspect, rig.near, rig.far);

    inputs.view = view;
    inputs.proj = proj;
    inputs.focal = focal_lengths(rig.fov_y, rig.viewport);
    inputs.viewport = rig.viewport;
    inputs.splat_scale = rig.splat_scale;
    inputs.regions = ctx
        .registry
        .regions()
        .iter()
        .take(MAX_REGIONS)
        .map(region_uniform)
        .collect();

    state.visible = ctx.visible;

    *pick_context = PickCameraContext {
        camera_world: rig.camera_world,
        ground_world: rig.ground_world,
        floor_offset: rig.floor_offset,
        fov_y: rig.fov_y,
        aspect,
    };

    if ctx.last_sent_count > 0 {
        // The sorter works on raw record positions (millimeters), so fold the
        // mm scaling into the view-projection to keep its near-plane test in
        // clip units.
        ctx.sorter.send(SortCommand::Sort {
            view_proj: proj * view * Mat4::from_scale(Vec3::splat(MM_TO_M)),
        });
    }
}

#[derive(Default)]
pub struct SplatServicePlugin {
    pub config: SplatServiceConfig,
}

impl Plugin for SplatServicePlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(SplattingContext::new(&self.config))
            .init_resource::<CameraRig>()
            .init_resource::<SplatRenderState>()
            .init_resource::<SplatViewInputs>()
            .init_resource::<PickCameraContext>()
            .add_systems(
                Update,
                (drive_stream_loads, poll_sort_outputs, update_view_inputs).chain(),
            );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::PersistedRegionState;
    use crate::splat_record::{SplatRecord, RECORD_STRIDE};
    use anyhow::Result;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct MemoryStore(Mutex<HashMap<u8, PersistedRegionState>>);

    impl MemoryStore {
        fn new() -> Box<Self> {
            Box::new(Self(Mutex::new(HashMap::new())))
        }
    }

    impl RegionStore for MemoryStore {
        fn load(&self, region_id: u8) -> Option<PersistedRegionState> {
            self.0.lock().unwrap().get(&region_id).cloned()
        }

        fn save(&self, region_id: u8, state: &PersistedRegionState) -> Result<()> {
            self.0.lock().unwrap().insert(region_id, state.clone());
            Ok(())
        }
    }

    fn write_splat_file(records: usize) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "splat_service_{}_{records}.splat",
            std::process::id()
        ));
        let mut bytes = Vec::with_capacity(records * RECORD_STRIDE);
        for i in 0..records {
            let record = SplatRecord {
                position: Vec3::new(i as f32, 0.0, 10.0 + i as f32),
                scale: Vec3::splat(1.0),
                color: [200, 100, 50, 255],
                rotation: Quat::IDENTITY,
            };
            bytes.extend_from_slice(&record.encode());
        }
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn test_app() -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins)
            .insert_resource(SplattingContext::with_store(
                MemoryStore::new(),
                SortThrottle::disabled(),
                8192,
            ))
            .init_resource::<CameraRig>()
            .init_resource::<SplatRenderState>()
            .init_resource::<SplatViewInputs>()
            .init_resource::<PickCameraContext>()
            .add_systems(
                Update,
                (drive_stream_loads, poll_sort_outputs, update_view_inputs).chain(),
            );
        app
    }

    fn update_until(app: &mut App, mut done: impl FnMut(&App) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            app.update();
            if done(app) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn streamed_file_becomes_sorted_and_visible() {
        let path = write_splat_file(1000);
        let mut app = test_app();
        let shown = Arc::new(AtomicU32::new(0));
        {
            let mut ctx = app.world_mut().resource_mut::<SplattingContext>();
            let shown = shown.clone();
            ctx.on_splat_shown(move |region_id| {
                shown.store(region_id as u32, Ordering::SeqCst);
            });
            let region_id = ctx.show_splat_renderer(path.to_str().unwrap());
            assert_eq!(region_id, 1);
            assert!(ctx.is_visible());
        }
        let loaded = update_until(&mut app, |app| {
            let state = app.world().resource::<SplatRenderState>();
            state.sorted_count == 1000 && state.texture.is_some()
        });
        assert!(loaded, "stream never produced a full sort");
        let state = app.world().resource::<SplatRenderState>();
        assert!(state.visible);
        assert_eq!(state.depth_index.len(), 1000);
        assert_eq!(shown.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn streamed_bounds_tighten_the_region_boundary() {
        let path = write_splat_file(50);
        let mut app = test_app();
        let region_id = app
            .world_mut()
            .resource_mut::<SplattingContext>()
            .show_splat_renderer(path.to_str().unwrap());
        let bounded = update_until(&mut app, |app| {
            let ctx = app.world().resource::<SplattingContext>();
            ctx.registry()
                .region(region_id)
                .is_some_and(|r| r.boundary_max.x < f32::MAX)
        });
        assert!(bounded, "region bounds never arrived");
        let ctx = app.world().resource::<SplattingContext>();
        let region = ctx.registry().region(region_id).unwrap();
        assert_eq!(region.boundary_min, Vec3::new(0.0, 0.0, 10.0));
        assert_eq!(region.boundary_max, Vec3::new(49.0, 0.0, 59.0));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn hide_fires_callbacks_and_keeps_data() {
        let path = write_splat_file(10);
        let mut app = test_app();
        let hidden = Arc::new(AtomicU32::new(0));
        {
            let mut ctx = app.world_mut().resource_mut::<SplattingContext>();
            let hidden = hidden.clone();
            ctx.on_splat_hidden(move || {
                hidden.fetch_add(1, Ordering::SeqCst);
            });
            ctx.show_splat_renderer(path.to_str().unwrap());
        }
        assert!(update_until(&mut app, |app| {
            app.world().resource::<SplatRenderState>().sorted_count == 10
        }));
        {
            let mut ctx = app.world_mut().resource_mut::<SplattingContext>();
            ctx.hide_splat_renderer();
            // Hiding twice does not fire twice.
            ctx.hide_splat_renderer();
            assert_eq!(ctx.record_count(), 10);
        }
        app.update();
        assert_eq!(hidden.load(Ordering::SeqCst), 1);
        assert!(!app.world().resource::<SplatRenderState>().visible);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn aborted_stream_discards_partial_record_and_keeps_alignment() {
        let mut ctx =
            SplattingContext::with_store(MemoryStore::new(), SortThrottle::disabled(), 8192);
        let first = ctx.registry.register_region("a.splat");
        // Two whole records plus 13 bytes of a third, cut off mid-record.
        let record = SplatRecord {
            position: Vec3::new(1.0, 2.0, 3.0),
            scale: Vec3::ONE,
            color: [255; 4],
            rotation: Quat::IDENTITY,
        }
        .encode();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&record);
        bytes.extend_from_slice(&record);
        bytes.extend_from_slice(&record[..13]);
        ctx.registry.record_bytes(first, bytes.len());
        ctx.store.append(&bytes);

        ctx.discard_partial_record(first);
        assert_eq!(ctx.store.record_count(), 2);
        assert_eq!(ctx.store.byte_len() % RECORD_STRIDE, 0);
        let params = ctx.registry.sort_params();
        assert_eq!(params[0].record_count, 2);

        // The next region packs directly after the surviving records.
        let second = ctx.registry.register_region("b.splat");
        assert_eq!(
            ctx.registry.region(second).unwrap().byte_offset,
            2 * RECORD_STRIDE
        );
    }

    #[test]
    fn truncated_file_still_renders_whole_records() {
        let path = write_splat_file(12);
        // Chop the last record short.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(11 * RECORD_STRIDE + 7);
        std::fs::write(&path, &bytes).unwrap();

        let mut app = test_app();
        app.world_mut()
            .resource_mut::<SplattingContext>()
            .show_splat_renderer(path.to_str().unwrap());
        assert!(update_until(&mut app, |app| {
            app.world().resource::<SplatRenderState>().sorted_count == 11
        }));
        let ctx = app.world().resource::<SplattingContext>();
        assert_eq!(ctx.record_count(), 11);
        assert_eq!(ctx.registry().sort_params()[0].record_count, 11);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn second_region_packs_after_the_first() {
        let first = write_splat_file(30);
        let second = write_splat_file(20);
        let mut app = test_app();
        {
            let mut ctx = app.world_mut().resource_mut::<SplattingContext>();
            ctx.show_splat_renderer(first.to_str().unwrap());
            ctx.show_splat_renderer(second.to_str().unwrap());
        }
        assert!(update_until(&mut app, |app| {
            app.world().resource::<SplatRenderState>().sorted_count == 50
        }));
        let ctx = app.world().resource::<SplattingContext>();
        let params = ctx.registry().sort_params();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].first_record, 30);
        assert_eq!(params[1].record_count, 20);
        let _ = std::fs::remove_file(&first);
        let _ = std::fs::remove_file(&second);
    }
}
