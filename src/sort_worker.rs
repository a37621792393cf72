// Background depth-sorting and texture-encoding thread.
//
// The render thread never blocks on this worker: commands go in over one
// channel, results come back over another, and the renderer keeps drawing
// with the previous depth index / texture until a newer one arrives.

use crate::splat_record::{SplatRecord, RECORD_STRIDE};
use glam::{Mat4, Quat, Vec3};
use half::f16;
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Fixed width of the packed attribute texture.
pub const TEXTURE_WIDTH: u32 = 2048;
/// Two RGBA32Uint texels per splat: position+flags, covariance+color.
pub const TEXELS_PER_SPLAT: u32 = 2;
const TEXEL_BYTES: usize = 16;
const SPLAT_TEXTURE_BYTES: usize = TEXELS_PER_SPLAT as usize * TEXEL_BYTES;

/// 256 × 256 depth buckets for the single-pass counting sort.
const DEPTH_BUCKETS: usize = 65536;
/// Out-of-boundary and behind-camera splats land here, after every real depth.
const CULLED_BUCKET: u32 = DEPTH_BUCKETS as u32;
const DEPTH_SCALE: f32 = 4096.0;

/// When the camera barely rotated and no data arrived, re-sorting is skipped
/// and the previous depth index stays in effect. The threshold compares the
/// dot product of consecutive view-projection z-rows against `1.0`; whether it
/// should scale with scene extent is unresolved, so it is a tunable rather
/// than a constant.
#[derive(Debug, Clone, Copy)]
pub struct SortThrottle {
    pub rotation_threshold: f32,
}

impl Default for SortThrottle {
    fn default() -> Self {
        Self { rotation_threshold: 0.01 }
    }
}

impl SortThrottle {
    /// Re-sort on every request, useful for tests and captures.
    pub fn disabled() -> Self {
        Self { rotation_threshold: 0.0 }
    }

    /// Tolerates more rotation before re-sorting, for very large scenes.
    pub fn relaxed() -> Self {
        Self { rotation_threshold: 0.05 }
    }
}

/// Per-region parameters mirrored from the registry: which slice of the
/// record store belongs to the region, its rigid transform, and its
/// axis-aligned boundary in region-local space.
#[derive(Debug, Clone, Copy)]
pub struct RegionSortParams {
    pub region_id: u8,
    pub label: u16,
    pub first_record: u32,
    pub record_count: u32,
    pub position_offset: Vec3,
    pub quaternion: Quat,
    pub boundary_min: Vec3,
    pub boundary_max: Vec3,
}

impl RegionSortParams {
    /// Boundary test is inclusive on both corners.
    #[inline]
    fn contains(&self, p: Vec3) -> bool {
        p.x >= self.boundary_min.x
            && p.y >= self.boundary_min.y
            && p.z >= self.boundary_min.z
            && p.x <= self.boundary_max.x
            && p.y <= self.boundary_max.y
            && p.z <= self.boundary_max.z
    }
}

/// Commands into the worker. Exhaustively matched; never shared memory.
pub enum SortCommand {
    /// Replace the working record snapshot. `vertex_count` must equal
    /// `records.len() / 32` exactly or the buffer is dropped.
    SetBuffer { records: Arc<[u8]>, vertex_count: u32 },
    /// Mirror the current region transforms/boundaries.
    SetRegions { regions: Vec<RegionSortParams> },
    /// Re-sort for a new view-projection, subject to the throttle.
    Sort { view_proj: Mat4 },
    /// Re-sort with the last view, bypassing the throttle once. Issued after
    /// region transform or boundary edits.
    ForceSort,
    /// Rebuild the packed texture if the vertex count grew since the last
    /// encode, or unconditionally when `force` is set (after a flag-affecting
    /// edit such as a region label change).
    EncodeTexture { force: bool },
    /// Flip per-splat visibility flags and re-encode.
    SetVisibility { hidden: Arc<HashSet<u32>> },
    /// Scan a region's records and report their axis-aligned bounds.
    ComputeRegionBounds { region_id: u8 },
    Shutdown,
}

/// Results out of the worker.
pub enum SortOutput {
    SortResult {
        depth_index: Arc<Vec<u32>>,
        vertex_count: u32,
        generation: u64,
    },
    TextureReady {
        width: u32,
        rows: u32,
        data: Arc<Vec<u8>>,
        generation: u64,
    },
    RegionBounds {
        region_id: u8,
        min: Vec3,
        max: Vec3,
    },
    /// Capability failure (texture would exceed device limits). Fatal for
    /// encoding, not for rendering with the previous texture.
    EncodeFailed { reason: String },
}

/// Owning handle to the sorting thread. Dropping it shuts the thread down.
pub struct SortWorkerHandle {
    commands: Sender<SortCommand>,
    // Mutex only to make the handle Sync; polled from one system.
    results: Mutex<Receiver<SortOutput>>,
    thread: Option<JoinHandle<()>>,
}

impl SortWorkerHandle {
    pub fn spawn(throttle: SortThrottle, max_texture_dim: u32) -> Self {
        let (command_tx, command_rx) = mpsc::channel();
        let (result_tx, result_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("splat-sort".into())
            .spawn(move || {
                Worker::new(throttle, max_texture_dim, result_tx).run(command_rx);
            })
            .ok();
        if thread.is_none() {
            warn!("failed to spawn splat sorting thread");
        }
        Self {
            commands: command_tx,
            results: Mutex::new(result_rx),
            thread,
        }
    }

    pub fn send(&self, command: SortCommand) {
        if self.commands.send(command).is_err() {
            warn!("splat sorting thread is gone, command dropped");
        }
    }

    /// Non-blocking poll, called once per frame by the render-side driver.
    pub fn try_recv(&self) -> Option<SortOutput> {
        self.results.lock().ok()?.try_recv().ok()
    }
}

impl Drop for SortWorkerHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(SortCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct Worker {
    throttle: SortThrottle,
    max_texture_dim: u32,
    records: Arc<[u8]>,
    vertex_count: usize,
    regions: Vec<RegionSortParams>,
    hidden: Arc<HashSet<u32>>,
    depth_index: Arc<Vec<u32>>,
    last_view_proj: Option<Mat4>,
    last_view_zrow: Option<Vec3>,
    last_sorted_count: usize,
    encoded_count: usize,
    sort_generation: u64,
    texture_generation: u64,
    results: Sender<SortOutput>,
}

struct PendingSort {
    view_proj: Mat4,
    force: bool,
}

impl Worker {
    fn new(throttle: SortThrottle, max_texture_dim: u32, results: Sender<SortOutput>) -> Self {
        Self {
            throttle,
            max_texture_dim,
            records: Arc::from(&[][..]),
            vertex_count: 0,
            regions: Vec::new(),
            hidden: Arc::new(HashSet::new()),
            depth_index: Arc::new(Vec::new()),
            last_view_proj: None,
            last_view_zrow: None,
            last_sorted_count: 0,
            encoded_count: 0,
            sort_generation: 0,
            texture_generation: 0,
            results,
        }
    }

    fn run(mut self, commands: Receiver<SortCommand>) {
        info!("splat sorting thread started");
        'outer: loop {
            let Ok(first) = commands.recv() else { break };
            let mut pending = None;
            if !self.apply(first, &mut pending) {
                break;
            }
            // Coalesce everything already queued so a burst of camera moves
            // costs one sort, always against the most recent view.
            loop {
                match commands.try_recv() {
                    Ok(command) => {
                        if !self.apply(command, &mut pending) {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }
            if let Some(sort) = pending.take() {
                self.sort(sort.view_proj, sort.force);
            }
        }
        debug!("splat sorting thread exiting");
    }

    /// Returns false on shutdown.
    fn apply(&mut self, command: SortCommand, pending: &mut Option<PendingSort>) -> bool {
        match command {
            SortCommand::SetBuffer { records, vertex_count } => {
                let expected = vertex_count as usize * RECORD_STRIDE;
                if records.len() != expected || records.len() % RECORD_STRIDE != 0 {
                    warn!(
                        len = records.len(),
                        vertex_count, "malformed splat buffer dropped"
                    );
                    return true;
                }
                self.records = records;
                self.vertex_count = vertex_count as usize;
            }
            SortCommand::SetRegions { mut regions } => {
                regions.sort_unstable_by_key(|r| r.first_record);
                self.regions = regions;
            }
            SortCommand::Sort { view_proj } => {
                let force = pending.as_ref().map(|p| p.force).unwrap_or(false);
                *pending = Some(PendingSort { view_proj, force });
            }
            SortCommand::ForceSort => {
                if let Some(view_proj) = pending.as_ref().map(|p| p.view_proj).or(self.last_view_proj) {
                    *pending = Some(PendingSort { view_proj, force: true });
                }
            }
            SortCommand::EncodeTexture { force } => self.encode_texture(force),
            SortCommand::SetVisibility { hidden } => {
                self.hidden = hidden;
                self.encode_texture(true);
            }
            SortCommand::ComputeRegionBounds { region_id } => self.compute_region_bounds(region_id),
            SortCommand::Shutdown => return false,
        }
        true
    }

    fn region_for(&self, record: u32) -> Option<&RegionSortParams> {
        // Regions are kept sorted by first_record.
        let idx = self.regions.partition_point(|r| r.first_record <= record);
        let region = self.regions[..idx].last()?;
        (record < region.first_record + region.record_count).then_some(region)
    }

    /// Single-pass counting sort of all splats by projected depth.
    ///
    /// Depth key is the clip-space z `(row2 · p + t) * 4096` of the
    /// region-transformed position, where `t` is the view-projection's z
    /// translation, bucketed into 65536 slots plus one sentinel for culled
    /// splats; prefix sums then one linear scatter produce a back-to-front
    /// permutation of `[0, vertex_count)`. `depth < 1` is the near-plane
    /// test, so `view_proj` must be expressed in record units.
    fn sort(&mut self, view_proj: Mat4, force: bool) {
        let count = self.vertex_count;
        if count == 0 {
            return;
        }
        let zrow = Vec3::new(view_proj.x_axis.z, view_proj.y_axis.z, view_proj.z_axis.z);
        let ztrans = view_proj.w_axis.z;
        if !force && count == self.last_sorted_count {
            if let Some(prev) = self.last_view_zrow {
                if (prev.dot(zrow) - 1.0).abs() < self.throttle.rotation_threshold {
                    debug!("sort skipped, camera barely rotated");
                    return;
                }
            }
        }

        const CULLED: i32 = i32::MIN;
        let mut depths = vec![0i32; count];
        let mut min_depth = i32::MAX;
        let mut max_depth = i32::MIN;
        for i in 0..count {
            let bytes = &self.records[i * RECORD_STRIDE..];
            let local = SplatRecord::decode_position(bytes);
            let depth = match self.region_for(i as u32) {
                Some(region) => {
                    if !region.contains(local) {
                        depths[i] = CULLED;
                        continue;
                    }
                    let world = region.quaternion * local + region.position_offset;
                    ((zrow.dot(world) + ztrans) * DEPTH_SCALE) as i32
                }
                None => ((zrow.dot(local) + ztrans) * DEPTH_SCALE) as i32,
            };
            if depth < 1 {
                // Behind the camera.
                depths[i] = CULLED;
                continue;
            }
            depths[i] = depth;
            min_depth = min_depth.min(depth);
            max_depth = max_depth.max(depth);
        }
        if min_depth > max_depth {
            // Everything culled; still emit a valid permutation.
            min_depth = 0;
            max_depth = 1;
        }

        let inv = (DEPTH_BUCKETS - 1) as f32 / (max_depth - min_depth).max(1) as f32;
        let mut buckets = vec![0u32; count];
        let mut counts = vec![0u32; DEPTH_BUCKETS + 1];
        for i in 0..count {
            let bucket = if depths[i] == CULLED {
                CULLED_BUCKET
            } else {
                // Far depths map to low buckets so ascending scatter order
                // is back-to-front.
                (DEPTH_BUCKETS as u32 - 1) - ((depths[i] - min_depth) as f32 * inv) as u32
            };
            buckets[i] = bucket;
            counts[bucket as usize] += 1;
        }
        let mut starts = vec![0u32; DEPTH_BUCKETS + 1];
        for b in 1..=DEPTH_BUCKETS {
            starts[b] = starts[b - 1] + counts[b - 1];
        }
        let mut depth_index = vec![0u32; count];
        for i in 0..count {
            let slot = &mut starts[buckets[i] as usize];
            depth_index[*slot as usize] = i as u32;
            *slot += 1;
        }

        self.depth_index = Arc::new(depth_index);
        self.last_view_proj = Some(view_proj);
        self.last_view_zrow = Some(zrow);
        self.last_sorted_count = count;
        self.sort_generation += 1;
        let _ = self.results.send(SortOutput::SortResult {
            depth_index: self.depth_index.clone(),
            vertex_count: count as u32,
            generation: self.sort_generation,
        });
    }

    /// Rebuilds the packed attribute texture. Runs only when the vertex count
    /// grew (or `force`, after a visibility edit) because encoding touches
    /// every splat and is far less frequent than sorting.
    fn encode_texture(&mut self, force: bool) {
        let count = self.vertex_count;
        if count == 0 || (!force && count == self.encoded_count) {
            return;
        }
        let rows = ((count as u32 * TEXELS_PER_SPLAT) + TEXTURE_WIDTH - 1) / TEXTURE_WIDTH;
        if rows > self.max_texture_dim {
            let reason = format!(
                "packed texture needs {rows} rows for {count} splats, device limit is {}",
                self.max_texture_dim
            );
            warn!("{reason}");
            let _ = self.results.send(SortOutput::EncodeFailed { reason });
            return;
        }

        let mut data = vec![0u8; rows as usize * TEXTURE_WIDTH as usize * TEXEL_BYTES];
        let records = &self.records;
        let hidden = &self.hidden;
        let regions = &self.regions;
        data[..count * SPLAT_TEXTURE_BYTES]
            .par_chunks_exact_mut(SPLAT_TEXTURE_BYTES)
            .enumerate()
            .for_each(|(i, texels)| {
                let Some(record) = SplatRecord::decode(&records[i * RECORD_STRIDE..]) else {
                    return;
                };
                let (region_id, label) = region_flags(regions, i as u32);
                let visible = !hidden.contains(&(i as u32)) as u32;
                let flags = visible | (region_id as u32) << 8 | (label as u32) << 16;
                let cov = record.covariance();
                let words = [
                    record.position.x.to_bits(),
                    record.position.y.to_bits(),
                    record.position.z.to_bits(),
                    flags,
                    pack_half2x16(4.0 * cov[0], 4.0 * cov[1]),
                    pack_half2x16(4.0 * cov[2], 4.0 * cov[3]),
                    pack_half2x16(4.0 * cov[4], 4.0 * cov[5]),
                    u32::from_le_bytes(record.color),
                ];
                for (slot, word) in texels.chunks_exact_mut(4).zip(words) {
                    slot.copy_from_slice(&word.to_le_bytes());
                }
            });

        self.encoded_count = count;
        self.texture_generation += 1;
        info!(count, rows, "packed splat texture encoded");
        let _ = self.results.send(SortOutput::TextureReady {
            width: TEXTURE_WIDTH,
            rows,
            data: Arc::new(data),
            generation: self.texture_generation,
        });
    }

    fn compute_region_bounds(&self, region_id: u8) {
        let Some(region) = self.regions.iter().find(|r| r.region_id == region_id) else {
            warn!(region_id, "bounds requested for unknown region");
            return;
        };
        let first = region.first_record as usize;
        let last = (first + region.record_count as usize).min(self.vertex_count);
        if first >= last {
            return;
        }
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for i in first..last {
            let p = SplatRecord::decode_position(&self.records[i * RECORD_STRIDE..]);
            min = min.min(p);
            max = max.max(p);
        }
        let _ = self.results.send(SortOutput::RegionBounds { region_id, min, max });
    }
}

fn region_flags(regions: &[RegionSortParams], record: u32) -> (u8, u16) {
    let idx = regions.partition_point(|r| r.first_record <= record);
    match regions[..idx].last() {
        Some(r) if record < r.first_record + r.record_count => (r.region_id, r.label),
        _ => (0, 0),
    }
}

#[inline]
fn pack_half2x16(a: f32, b: f32) -> u32 {
    f16::from_f32(a).to_bits() as u32 | (f16::from_f32(b).to_bits() as u32) << 16
}
