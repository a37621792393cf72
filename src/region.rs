// Region registry: per-region rigid transforms, axis-aligned boundary
// volumes, the boundary-editing gizmo state machine, and JSON persistence.
//
// All spatial values here are in scene millimeters, stored and persisted
// verbatim; the mm→m conversion happens once at view composition.

use crate::sort_worker::RegionSortParams;
use anyhow::{Context, Result};
use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

/// One face of a region's axis-aligned boundary box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryFace {
    PosX,
    NegX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl BoundaryFace {
    pub const ALL: [BoundaryFace; 6] = [
        Self::PosX,
        Self::NegX,
        Self::PosY,
        Self::NegY,
        Self::PosZ,
        Self::NegZ,
    ];

    /// 0 = x, 1 = y, 2 = z.
    pub fn axis(self) -> usize {
        match self {
            Self::PosX | Self::NegX => 0,
            Self::PosY | Self::NegY => 1,
            Self::PosZ | Self::NegZ => 2,
        }
    }

    pub fn sign(self) -> f32 {
        match self {
            Self::PosX | Self::PosY | Self::PosZ => 1.0,
            Self::NegX | Self::NegY | Self::NegZ => -1.0,
        }
    }

    pub fn normal(self) -> Vec3 {
        let mut n = Vec3::ZERO;
        n[self.axis()] = self.sign();
        n
    }
}

/// Gizmo interaction mode for the single active gizmo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GizmoMode {
    /// Dragging the whole region's rigid transform.
    Transform,
    /// Dragging one boundary face along its axis.
    Boundary,
}

#[derive(Debug, Clone, Copy)]
struct GizmoState {
    region_id: u8,
    mode: GizmoMode,
    active_face: Option<BoundaryFace>,
    last_gizmo_local: Vec3,
}

/// Pose sample reported by the host's gizmo on drag.
#[derive(Debug, Clone, Copy)]
pub struct GizmoSample {
    /// Gizmo position in scene space (becomes the region offset).
    pub position: Vec3,
    pub quaternion: Quat,
    /// Gizmo position expressed in the boundary group's local space, used
    /// for incremental face deltas.
    pub local_position: Vec3,
}

/// One boundary face as renderable/raycastable geometry, in region-local
/// space: a rectangle centered on the face with the face's outward normal.
#[derive(Debug, Clone, Copy)]
pub struct BoundaryFaceGeometry {
    pub face: BoundaryFace,
    pub center: Vec3,
    pub normal: Vec3,
    /// Half sizes along the two in-plane axes (axis order skips the normal).
    pub half_extents: [f32; 2],
}

#[derive(Debug, Clone)]
pub struct SplatRegion {
    pub region_id: u8,
    pub file_path: String,
    /// Start of this region's records in the shared store.
    pub byte_offset: usize,
    pub bytes_read: usize,
    /// Host-assigned tag carried through the packed texture into pick
    /// results. Session-scoped, not persisted.
    pub label: u16,
    pub position_offset: Vec3,
    pub quaternion: Quat,
    pub boundary_min: Vec3,
    pub boundary_max: Vec3,
    /// Persisted state was applied; stream-computed bounds must not clobber it.
    restored: bool,
}

impl SplatRegion {
    pub fn boundary_center(&self) -> Vec3 {
        (self.boundary_min + self.boundary_max) * 0.5
    }

    /// True once persisted state has been applied; stream-computed bounds
    /// are then ignored for this region.
    pub fn restored(&self) -> bool {
        self.restored
    }

    /// Inclusive on both corners.
    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.boundary_min).all() && p.cmple(self.boundary_max).all()
    }

    pub fn boundary_faces(&self) -> [BoundaryFaceGeometry; 6] {
        let center = self.boundary_center();
        let half = (self.boundary_max - self.boundary_min) * 0.5;
        BoundaryFace::ALL.map(|face| {
            let axis = face.axis();
            let mut c = center;
            c[axis] = if face.sign() > 0.0 {
                self.boundary_max[axis]
            } else {
                self.boundary_min[axis]
            };
            let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
            BoundaryFaceGeometry {
                face,
                center: c,
                normal: face.normal(),
                half_extents: [half[u], half[v]],
            }
        })
    }

    fn sort_params(&self, record_stride: usize) -> RegionSortParams {
        RegionSortParams {
            region_id: self.region_id,
            label: self.label,
            first_record: (self.byte_offset / record_stride) as u32,
            record_count: (self.bytes_read / record_stride) as u32,
            position_offset: self.position_offset,
            quaternion: self.quaternion,
            boundary_min: self.boundary_min,
            boundary_max: self.boundary_max,
        }
    }

    fn persisted(&self) -> PersistedRegionState {
        PersistedRegionState {
            position_offset: self.position_offset.to_array(),
            quaternion: self.quaternion.to_array(),
            boundary_min: self.boundary_min.to_array(),
            boundary_max: self.boundary_max.to_array(),
        }
    }

    fn apply_persisted(&mut self, state: &PersistedRegionState) {
        self.position_offset = Vec3::from_array(state.position_offset);
        self.quaternion = Quat::from_array(state.quaternion).normalize();
        self.boundary_min = Vec3::from_array(state.boundary_min);
        self.boundary_max = Vec3::from_array(state.boundary_max);
        self.restored = true;
    }
}

/// Durable per-region transform/boundary state, key `splat_region_<id>`.
/// All values in millimeters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRegionState {
    pub position_offset: [f32; 3],
    pub quaternion: [f32; 4],
    pub boundary_min: [f32; 3],
    pub boundary_max: [f32; 3],
}

/// Durable key-value storage for region state.
pub trait RegionStore: Send + Sync {
    fn load(&self, region_id: u8) -> Option<PersistedRegionState>;
    fn save(&self, region_id: u8, state: &PersistedRegionState) -> Result<()>;
}

/// File-backed store: one `splat_region_<id>.json` per region.
pub struct FileRegionStore {
    dir: PathBuf,
}

impl FileRegionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, region_id: u8) -> PathBuf {
        self.dir.join(format!("splat_region_{region_id}.json"))
    }
}

impl RegionStore for FileRegionStore {
    fn load(&self, region_id: u8) -> Option<PersistedRegionState> {
        let raw = std::fs::read_to_string(self.path(region_id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(region_id, %err, "discarding unreadable persisted region state");
                None
            }
        }
    }

    fn save(&self, region_id: u8, state: &PersistedRegionState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating region store dir {:?}", self.dir))?;
        let json = serde_json::to_string(state)?;
        std::fs::write(self.path(region_id), json)
            .with_context(|| format!("writing region {region_id} state"))
    }
}

/// All regions of the current session plus the single active gizmo.
pub struct RegionRegistry {
    regions: Vec<SplatRegion>,
    gizmo: Option<GizmoState>,
    store: Box<dyn RegionStore>,
    record_stride: usize,
    boundaries_visible: bool,
}

impl RegionRegistry {
    pub fn new(store: Box<dyn RegionStore>, record_stride: usize) -> Self {
        Self {
            regions: Vec::new(),
            gizmo: None,
            store,
            record_stride,
            boundaries_visible: false,
        }
    }

    /// Registers a region whose source file is starting to load. Its byte
    /// offset is the end of all previously registered regions (append-only
    /// packing into the shared store). Persisted state, if any, is applied
    /// immediately and wins over stream-computed bounds later.
    pub fn register_region(&mut self, file_path: &str) -> u8 {
        let region_id = self.regions.len() as u8 + 1;
        let byte_offset = self.regions.iter().map(|r| r.bytes_read).sum();
        let mut region = SplatRegion {
            region_id,
            file_path: file_path.to_string(),
            byte_offset,
            bytes_read: 0,
            label: 0,
            position_offset: Vec3::ZERO,
            quaternion: Quat::IDENTITY,
            boundary_min: Vec3::splat(f32::MIN),
            boundary_max: Vec3::splat(f32::MAX),
            restored: false,
        };
        if let Some(state) = self.store.load(region_id) {
            region.apply_persisted(&state);
            info!(region_id, file_path, "restored persisted region state");
        } else {
            info!(region_id, file_path, "registered region");
        }
        self.regions.push(region);
        region_id
    }

    /// Advances a region's ingested byte count as stream chunks land.
    pub fn record_bytes(&mut self, region_id: u8, additional: usize) {
        if let Some(region) = self.region_mut(region_id) {
            region.bytes_read += additional;
        }
    }

    /// Backs out bytes discarded after the stream ended (trailing partial
    /// record), keeping later regions' offsets stride-aligned.
    pub fn discard_bytes(&mut self, region_id: u8, removed: usize) {
        if let Some(region) = self.region_mut(region_id) {
            region.bytes_read = region.bytes_read.saturating_sub(removed);
        }
    }

    /// Tags a region's splats with a host-assigned label. Takes effect on
    /// the next texture encode.
    pub fn set_region_label(&mut self, region_id: u8, label: u16) {
        if let Some(region) = self.region_mut(region_id) {
            region.label = label;
        } else {
            warn!(region_id, "label for unknown region ignored");
        }
    }

    /// Applies bounds computed from the streamed records, unless persisted
    /// state already set the boundary. The applied boundary is persisted as
    /// the region's initial durable state.
    pub fn update_boundary_from_streamed_bounds(&mut self, region_id: u8, min: Vec3, max: Vec3) {
        let Some(region) = self.region_mut(region_id) else { return };
        if region.restored {
            return;
        }
        region.boundary_min = min.min(max);
        region.boundary_max = max.max(min);
        self.persist(region_id);
    }

    pub fn region(&self, region_id: u8) -> Option<&SplatRegion> {
        self.regions.iter().find(|r| r.region_id == region_id)
    }

    fn region_mut(&mut self, region_id: u8) -> Option<&mut SplatRegion> {
        self.regions.iter_mut().find(|r| r.region_id == region_id)
    }

    pub fn regions(&self) -> &[SplatRegion] {
        &self.regions
    }

    /// Snapshot for the sorting thread, sent after every registry mutation.
    pub fn sort_params(&self) -> Vec<RegionSortParams> {
        self.regions
            .iter()
            .map(|r| r.sort_params(self.record_stride))
            .collect()
    }

    // --- gizmo state machine: None → Transform → Boundary → Transform → None

    /// Activates the gizmo on one region in transform mode. Any gizmo on
    /// another region is detached first (single active gizmo).
    pub fn attach_gizmo(&mut self, region_id: u8) {
        if self.region(region_id).is_none() {
            warn!(region_id, "gizmo attach on unknown region ignored");
            return;
        }
        self.gizmo = Some(GizmoState {
            region_id,
            mode: GizmoMode::Transform,
            active_face: None,
            last_gizmo_local: Vec3::ZERO,
        });
    }

    pub fn detach_gizmo(&mut self) {
        self.gizmo = None;
    }

    pub fn gizmo_mode(&self) -> Option<(u8, GizmoMode)> {
        self.gizmo.map(|g| (g.region_id, g.mode))
    }

    pub fn active_face(&self) -> Option<BoundaryFace> {
        self.gizmo.and_then(|g| g.active_face)
    }

    /// Clicking a boundary face switches the active gizmo to boundary mode.
    /// `gizmo_local` is the gizmo's starting position in the boundary
    /// group's local space, the baseline for incremental deltas.
    pub fn begin_boundary_drag(&mut self, face: BoundaryFace, gizmo_local: Vec3) {
        let Some(gizmo) = self.gizmo.as_mut() else {
            warn!("boundary drag without an active gizmo ignored");
            return;
        };
        gizmo.mode = GizmoMode::Boundary;
        gizmo.active_face = Some(face);
        gizmo.last_gizmo_local = gizmo_local;
    }

    /// Clicking empty space while in boundary mode falls back to transform
    /// mode on the same region.
    pub fn end_boundary_drag(&mut self) {
        if let Some(gizmo) = self.gizmo.as_mut() {
            gizmo.mode = GizmoMode::Transform;
            gizmo.active_face = None;
        }
    }

    /// Applies the gizmo's current pose: in transform mode the region takes
    /// the pose directly; in boundary mode the gizmo's local-space movement
    /// becomes a one-sided min/max adjustment along the active face's axis,
    /// clamped so `min <= max` always holds. Every change is persisted.
    pub fn change_from_gizmo(&mut self, sample: GizmoSample) {
        let Some(mut gizmo) = self.gizmo else { return };
        let Some(region) = self.region_mut(gizmo.region_id) else { return };
        match gizmo.mode {
            GizmoMode::Transform => {
                region.position_offset = sample.position;
                region.quaternion = sample.quaternion.normalize();
            }
            GizmoMode::Boundary => {
                let Some(face) = gizmo.active_face else { return };
                let axis = face.axis();
                let delta = sample.local_position[axis] - gizmo.last_gizmo_local[axis];
                if face.sign() > 0.0 {
                    region.boundary_max[axis] =
                        (region.boundary_max[axis] + delta).max(region.boundary_min[axis]);
                } else {
                    region.boundary_min[axis] =
                        (region.boundary_min[axis] + delta).min(region.boundary_max[axis]);
                }
                gizmo.last_gizmo_local = sample.local_position;
                self.gizmo = Some(gizmo);
            }
        }
        self.persist(gizmo.region_id);
    }

    /// Ray vs. the six boundary faces of a region, in scene space. Returns
    /// the nearest hit face and the local-space hit point, used to decide
    /// which face a click starts dragging.
    pub fn raycast_boundary_face(
        &self,
        region_id: u8,
        origin: Vec3,
        dir: Vec3,
    ) -> Option<(BoundaryFace, Vec3)> {
        let region = self.region(region_id)?;
        let inv = region.quaternion.conjugate();
        let local_origin = inv * (origin - region.position_offset);
        let local_dir = inv * dir;
        let mut best: Option<(f32, BoundaryFace, Vec3)> = None;
        for geom in region.boundary_faces() {
            let axis = geom.face.axis();
            if local_dir[axis].abs() < 1e-8 {
                continue;
            }
            let t = (geom.center[axis] - local_origin[axis]) / local_dir[axis];
            if t <= 0.0 {
                continue;
            }
            let hit = local_origin + local_dir * t;
            let (u, v) = ((axis + 1) % 3, (axis + 2) % 3);
            if (hit[u] - geom.center[u]).abs() <= geom.half_extents[0]
                && (hit[v] - geom.center[v]).abs() <= geom.half_extents[1]
            {
                if best.map(|(bt, _, _)| t < bt).unwrap_or(true) {
                    best = Some((t, geom.face, hit));
                }
            }
        }
        best.map(|(_, face, hit)| (face, hit))
    }

    pub fn show(&mut self) {
        self.boundaries_visible = true;
    }

    pub fn hide(&mut self) {
        self.boundaries_visible = false;
        self.gizmo = None;
    }

    pub fn boundaries_visible(&self) -> bool {
        self.boundaries_visible
    }

    fn persist(&mut self, region_id: u8) {
        let Some(region) = self.region(region_id) else { return };
        let state = region.persisted();
        if let Err(err) = self.store.save(region_id, &state) {
            warn!(region_id, %err, "failed to persist region state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splat_record::RECORD_STRIDE;
    use std::collections::HashMap;
    use std::sync::Mutex;

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

    fn registry() -> RegionRegistry {
        RegionRegistry::new(MemoryStore::new(), RECORD_STRIDE)
    }

    #[test]
    fn byte_offsets_pack_append_only() {
        let mut reg = registry();
        let a = reg.register_region("a.splat");
        reg.record_bytes(a, 10 * RECORD_STRIDE);
        let b = reg.register_region("b.splat");
        reg.record_bytes(b, 4 * RECORD_STRIDE);
        let c = reg.register_region("c.splat");
        assert_eq!(reg.region(b).unwrap().byte_offset, 10 * RECORD_STRIDE);
        assert_eq!(reg.region(c).unwrap().byte_offset, 14 * RECORD_STRIDE);
        let params = reg.sort_params();
        assert_eq!(params[1].first_record, 10);
        assert_eq!(params[1].record_count, 4);
    }

    #[test]
    fn labels_flow_into_sort_params() {
        let mut reg = registry();
        let a = reg.register_region("a.splat");
        reg.record_bytes(a, 3 * RECORD_STRIDE);
        let b = reg.register_region("b.splat");
        reg.set_region_label(b, 7);
        reg.set_region_label(99, 1); // unknown region, ignored
        let params = reg.sort_params();
        assert_eq!(params[0].label, 0);
        assert_eq!(params[1].label, 7);
    }

    #[test]
    fn gizmo_mode_machine() {
        let mut reg = registry();
        let id = reg.register_region("a.splat");
        assert_eq!(reg.gizmo_mode(), None);
        reg.attach_gizmo(id);
        assert_eq!(reg.gizmo_mode(), Some((id, GizmoMode::Transform)));
        reg.begin_boundary_drag(BoundaryFace::PosX, Vec3::ZERO);
        assert_eq!(reg.gizmo_mode(), Some((id, GizmoMode::Boundary)));
        assert_eq!(reg.active_face(), Some(BoundaryFace::PosX));
        reg.end_boundary_drag();
        assert_eq!(reg.gizmo_mode(), Some((id, GizmoMode::Transform)));
        assert_eq!(reg.active_face(), None);
        reg.detach_gizmo();
        assert_eq!(reg.gizmo_mode(), None);
    }

    #[test]
    fn boundary_edits_keep_min_below_max() {
        let mut reg = registry();
        let id = reg.register_region("a.splat");
        reg.update_boundary_from_streamed_bounds(id, Vec3::splat(-100.0), Vec3::splat(100.0));
        reg.attach_gizmo(id);
        reg.begin_boundary_drag(BoundaryFace::PosX, Vec3::ZERO);
        // Drag the +x face far past the -x face.
        reg.change_from_gizmo(GizmoSample {
            position: Vec3::ZERO,
            quaternion: Quat::IDENTITY,
            local_position: Vec3::new(-500.0, 0.0, 0.0),
        });
        let region = reg.region(id).unwrap();
        assert!(region.boundary_min.x <= region.boundary_max.x);
        assert_eq!(region.boundary_max.x, region.boundary_min.x);
        // Drag back out: incremental deltas resume from the clamped state.
        reg.change_from_gizmo(GizmoSample {
            position: Vec3::ZERO,
            quaternion: Quat::IDENTITY,
            local_position: Vec3::new(-440.0, 0.0, 0.0),
        });
        let region = reg.region(id).unwrap();
        assert_eq!(region.boundary_max.x, -40.0);
        assert!(region.boundary_min.x <= region.boundary_max.x);
    }

    #[test]
    fn transform_edits_and_persistence_round_trip() {
        let dir = std::env::temp_dir().join(format!("splat_region_rt_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let pose = GizmoSample {
            position: Vec3::new(120.0, 0.0, -45.0),
            quaternion: Quat::from_rotation_y(0.5),
            local_position: Vec3::ZERO,
        };
        {
            let mut reg =
                RegionRegistry::new(Box::new(FileRegionStore::new(&dir)), RECORD_STRIDE);
            let id = reg.register_region("a.splat");
            reg.update_boundary_from_streamed_bounds(id, Vec3::splat(-10.0), Vec3::splat(10.0));
            reg.attach_gizmo(id);
            reg.change_from_gizmo(pose);
        }
        // A fresh registry over the same store restores the edited state.
        let mut fresh = RegionRegistry::new(Box::new(FileRegionStore::new(&dir)), RECORD_STRIDE);
        let id = fresh.register_region("a.splat");
        fresh.update_boundary_from_streamed_bounds(id, Vec3::splat(-999.0), Vec3::splat(999.0));
        let region = fresh.region(id).unwrap();
        assert!((region.position_offset - pose.position).length() < 1e-5);
        assert!(region.quaternion.dot(pose.quaternion).abs() > 1.0 - 1e-5);
        assert_eq!(region.boundary_min, Vec3::splat(-10.0));
        assert_eq!(region.boundary_max, Vec3::splat(10.0));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn restored_state_wins_over_streamed_bounds() {
        let store = MemoryStore::new();
        store
            .save(
                1,
                &PersistedRegionState {
                    position_offset: [1.0, 2.0, 3.0],
                    quaternion: [0.0, 0.0, 0.0, 1.0],
                    boundary_min: [-5.0, -5.0, -5.0],
                    boundary_max: [5.0, 5.0, 5.0],
                },
            )
            .unwrap();
        let mut reg = RegionRegistry::new(store, RECORD_STRIDE);
        let id = reg.register_region("a.splat");
        reg.update_boundary_from_streamed_bounds(id, Vec3::splat(-999.0), Vec3::splat(999.0));
        let region = reg.region(id).unwrap();
        assert_eq!(region.boundary_min, Vec3::splat(-5.0));
        assert_eq!(region.boundary_max, Vec3::splat(5.0));
        assert_eq!(region.position_offset, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn file_store_round_trips_json() {
        let dir = std::env::temp_dir().join(format!("splat_region_store_{}", std::process::id()));
        let store = FileRegionStore::new(&dir);
        let state = PersistedRegionState {
            position_offset: [10.0, 20.0, 30.0],
            quaternion: [0.0, 0.7071, 0.0, 0.7071],
            boundary_min: [-100.0, 0.0, -100.0],
            boundary_max: [100.0, 2500.0, 100.0],
        };
        store.save(3, &state).unwrap();
        let raw = std::fs::read_to_string(dir.join("splat_region_3.json")).unwrap();
        assert!(raw.contains("positionOffset"));
        assert_eq!(store.load(3).unwrap(), state);
        assert!(store.load(4).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn raycast_hits_the_facing_boundary_plane() {
        let mut reg = registry();
        let id = reg.register_region("a.splat");
        reg.update_boundary_from_streamed_bounds(id, Vec3::splat(-50.0), Vec3::splat(50.0));
        let hit = reg
            .raycast_boundary_face(id, Vec3::new(200.0, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0))
            .unwrap();
        assert_eq!(hit.0, BoundaryFace::PosX);
        assert!((hit.1.x - 50.0).abs() < 1e-4);
        // A ray that misses the box hits nothing.
        assert!(reg
            .raycast_boundary_face(id, Vec3::new(200.0, 500.0, 0.0), Vec3::new(-1.0, 0.0, 0.0))
            .is_none());
    }
}
