// GPU picking: the same instanced splat geometry rendered into an off-screen
// Rgba32Float target with a fragment variant that writes
// {camera z, splat index, region/label, 1.0}, then a single-pixel readback.
// Reusing the display rasterization keeps what is picked pixel-identical to
// what is seen; the cost is one extra scene pass per query, so requests are
// rate-limited to one in flight.

use bevy::{
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        extract_resource::{ExtractResource, ExtractResourcePlugin},
        render_graph::{RenderGraphExt, RenderLabel, ViewNode, ViewNodeRunner},
        render_resource::{
            Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor, Extent3d, LoadOp,
            MapMode, Operations, PipelineCache, RenderPassColorAttachment, RenderPassDescriptor,
            StoreOp, TexelCopyBufferInfo, TexelCopyBufferLayout, Texture, TextureDescriptor,
            TextureDimension, TextureUsages, TextureView, TextureViewDescriptor,
        },
        renderer::{RenderDevice, RenderQueue},
        view::ExtractedView,
        Render, RenderApp, RenderSystems,
    },
};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::splat_render::{
    ExtractedSplatScene, SplatBindGroup, SplatGpuResources, SplatPipelineIds, SplatRenderLabel,
    PICK_TARGET_FORMAT,
};
use crate::view_transform::unproject_pick;

/// Host camera state captured with each pick request so the hit position can
/// be reconstructed in scene space. Updated every frame by the service.
#[derive(Resource, Clone, Copy)]
pub struct PickCameraContext {
    pub camera_world: Mat4,
    pub ground_world: Mat4,
    pub floor_offset: f32,
    pub fov_y: f32,
    pub aspect: f32,
}

impl Default for PickCameraContext {
    fn default() -> Self {
        Self {
            camera_world: Mat4::IDENTITY,
            ground_world: Mat4::IDENTITY,
            floor_offset: 0.0,
            fov_y: 1.0,
            aspect: 1.0,
        }
    }
}

/// Pick request in 0..1 screen coordinates, v down from the top. A new
/// request while one is in flight replaces the pending one (latest wins).
#[derive(Resource, Default)]
pub struct PickerRequest {
    pending: Option<Vec2>,
}

impl PickerRequest {
    pub fn request(&mut self, uv: Vec2) {
        self.pending = Some(uv.clamp(Vec2::ZERO, Vec2::ONE));
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickHit {
    pub world_position: Vec3,
    pub splat_index: u32,
    pub region_id: u8,
    pub label: u16,
    pub camera_depth: f32,
}

/// Outcome of the most recent completed pick. `hit` is None for a zero-alpha
/// readback, which is a normal miss rather than an error.
#[derive(Resource, Default)]
pub struct PickerResult {
    pub hit: Option<PickHit>,
    pub generation: u64,
}

/// Host callbacks invoked on every pick hit. Misses invoke nothing.
#[derive(Resource, Default)]
pub struct PickCallbacks {
    callbacks: Vec<Box<dyn Fn(&PickHit) + Send + Sync>>,
}

impl PickCallbacks {
    pub fn on_position_picked(&mut self, callback: impl Fn(&PickHit) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }
}

enum PickSlot {
    Idle,
    InFlight {
        uv: Vec2,
        context: PickCameraContext,
        rendered: bool,
    },
    Ready {
        pixel: [f32; 4],
        uv: Vec2,
        context: PickCameraContext,
    },
}

/// Readback state shared between the main and render worlds via one Arc.
#[derive(Resource, Clone, ExtractResource)]
pub struct PickReadbackShared(Arc<Mutex<PickSlot>>);

impl Default for PickReadbackShared {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(PickSlot::Idle)))
    }
}

#[derive(Resource, Default)]
struct PickTargets {
    texture: Option<Texture>,
    view: Option<TextureView>,
    size: UVec2,
    readback: Option<Buffer>,
}

pub struct SplatPickerPlugin;

impl Plugin for SplatPickerPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<PickCameraContext>()
            .init_resource::<PickerRequest>()
            .init_resource::<PickerResult>()
            .init_resource::<PickCallbacks>()
            .init_resource::<PickReadbackShared>()
            .add_plugins(ExtractResourcePlugin::<PickReadbackShared>::default())
            .add_systems(Update, (dispatch_pick_requests, apply_pick_results).chain());

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app
            .init_resource::<PickTargets>()
            .add_systems(
                Render,
                prepare_pick_targets.in_set(RenderSystems::PrepareResources),
            )
            .add_systems(
                Render,
                finish_pick_readback.in_set(RenderSystems::Cleanup),
            )
            .add_render_graph_node::<ViewNodeRunner<PickRenderNode>>(Core3d, PickRenderLabel)
            .add_render_graph_edges(
                Core3d,
                (
                    SplatRenderLabel,
                    PickRenderLabel,
                    Node3d::StartMainPassPostProcessing,
                ),
            );
    }
}

fn dispatch_pick_requests(
    mut request: ResMut<PickerRequest>,
    context: Res<PickCameraContext>,
    shared: Res<PickReadbackShared>,
) {
    let Some(uv) = request.pending else { return };
    let Ok(mut slot) = shared.0.lock() else { return };
    if matches!(*slot, PickSlot::Idle) {
        *slot = PickSlot::InFlight {
            uv,
            context: *context,
            rendered: false,
        };
        request.pending = None;
    }
}

fn apply_pick_results(
    shared: Res<PickReadbackShared>,
    callbacks: Res<PickCallbacks>,
    mut result: ResMut<PickerResult>,
) {
    let Ok(mut slot) = shared.0.lock() else { return };
    let PickSlot::Ready { pixel, uv, context } = &*slot else {
        return;
    };
    let (pixel, uv, context) = (*pixel, *uv, *context);
    *slot = PickSlot::Idle;
    drop(slot);

    result.generation += 1;
    if pixel[3] == 0.0 {
        // Nothing under the cursor.
        result.hit = None;
        debug!("pick miss at {uv:?}");
        return;
    }
    let region_and_label = pixel[2] as u32;
    let world_position = unproject_pick(
        uv,
        pixel[0],
        context.camera_world,
        context.ground_world,
        context.floor_offset,
        context.fov_y,
        context.aspect,
    );
    let hit = PickHit {
        world_position,
        splat_index: pixel[1] as u32,
        region_id: (region_and_label & 0xff) as u8,
        label: (region_and_label >> 8) as u16,
        camera_depth: pixel[0],
    };
    for callback in &callbacks.callbacks {
        callback(&hit);
    }
    result.hit = Some(hit);
}

fn prepare_pick_targets(
    render_device: Res<RenderDevice>,
    views: Query<&ExtractedView, Without<Camera2d>>,
    mut targets: ResMut<PickTargets>,
) {
    let Some(view) = views.iter().next() else { return };
    let size = UVec2::new(view.viewport.z.max(1), view.viewport.w.max(1));
    if targets.texture.is_none() || targets.size != size {
        let texture = render_device.create_texture(&TextureDescriptor {
            label: Some("splat_pick_target"),
            size: Extent3d {
                width: size.x,
                height: size.y,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: PICK_TARGET_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        targets.view = Some(texture.create_view(&TextureViewDescriptor::default()));
        targets.texture = Some(texture);
        targets.size = size;
    }
    if targets.readback.is_none() {
        targets.readback = Some(render_device.create_buffer(&BufferDescriptor {
            label: Some("splat_pick_readback"),
            size: 256,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }));
    }
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct PickRenderLabel;

#[derive(Default)]
pub struct PickRenderNode;

impl ViewNode for PickRenderNode {
    type ViewQuery = &'static SplatPipelineIds;

    fn run<'w>(
        &self,
        _graph: &mut bevy::render::render_graph::RenderGraphContext,
        render_context: &mut bevy::render::renderer::RenderContext<'w>,
        pipeline_ids: bevy::ecs::query::QueryItem<'w, 'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), bevy::render::render_graph::NodeRunError> {
        let shared = world.resource::<PickReadbackShared>();
        {
            let Ok(slot) = shared.0.lock() else { return Ok(()) };
            match &*slot {
                PickSlot::InFlight { rendered: false, .. } => {}
                _ => return Ok(()),
            }
        }
        let Some(scene) = world.get_resource::<ExtractedSplatScene>() else {
            return Ok(());
        };
        let gpu = world.resource::<SplatGpuResources>();
        let targets = world.resource::<PickTargets>();
        let (Some(bind_group), Some(target_view)) =
            (&world.resource::<SplatBindGroup>().0, &targets.view)
        else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();
        let Some(pipeline) = pipeline_cache.get_render_pipeline(pipeline_ids.pick) else {
            return Ok(());
        };
        // With nothing drawable the pass still clears the target, so the
        // readback reports a miss instead of stale data.
        let mut pass = render_context
            .command_encoder()
            .begin_render_pass(&RenderPassDescriptor {
                label: Some("splat_pick_pass"),
                color_attachments: &[Some(RenderPassColorAttachment {
                    view: target_view,
                    resolve_target: None,
                    ops: Operations {
                        load: LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        if scene.visible && gpu.instance_count > 0 {
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.draw(0..4, 0..gpu.instance_count);
        }
        drop(pass);

        if let Ok(mut slot) = shared.0.lock() {
            if let PickSlot::InFlight { rendered, .. } = &mut *slot {
                *rendered = true;
            }
        }
        Ok(())
    }
}

/// Copies the cursor pixel out of the pick target and maps it synchronously,
/// after the graph's command buffers have been submitted. Picking is a
/// deliberate GPU stall point, bounded by the one-in-flight rate limit.
fn finish_pick_readback(
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    targets: Res<PickTargets>,
    shared: Res<PickReadbackShared>,
) {
    let (uv, context) = {
        let Ok(slot) = shared.0.lock() else { return };
        match &*slot {
            PickSlot::InFlight {
                uv,
                context,
                rendered: true,
            } => (*uv, *context),
            _ => return,
        }
    };
    let (Some(texture), Some(readback)) = (&targets.texture, &targets.readback) else {
        return;
    };

    let px = ((uv.x * targets.size.x as f32) as u32).min(targets.size.x - 1);
    let py = ((uv.y * targets.size.y as f32) as u32).min(targets.size.y - 1);

    let mut encoder = render_device.create_command_encoder(&CommandEncoderDescriptor {
        label: Some("splat_pick_readback_encoder"),
    });
    let mut source = texture.as_image_copy();
    source.origin.x = px;
    source.origin.y = py;
    encoder.copy_texture_to_buffer(
        source,
        TexelCopyBufferInfo {
            buffer: readback,
            layout: TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(256),
                rows_per_image: None,
            },
        },
        Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: 1,
        },
    );
    render_queue.submit(Some(encoder.finish()));

    let buffer_slice = readback.slice(..16);
    let mapping_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mapping_done_clone = mapping_done.clone();
    buffer_slice.map_async(MapMode::Read, move |result| {
        if result.is_ok() {
            mapping_done_clone.store(true, std::sync::atomic::Ordering::Release);
        } else {
            warn!("failed to map pick readback buffer");
        }
    });

    let wgpu_device = render_device.wgpu_device();
    let timeout = std::time::Duration::from_secs(2);
    let start = std::time::Instant::now();
    loop {
        let _ = wgpu_device.poll(wgpu::PollType::Wait);
        if mapping_done.load(std::sync::atomic::Ordering::Acquire) {
            let data = buffer_slice.get_mapped_range();
            let mut pixel = [0.0f32; 4];
            pixel.copy_from_slice(bytemuck::cast_slice(&data[..16]));
            drop(data);
            readback.unmap();
            if let Ok(mut slot) = shared.0.lock() {
                *slot = PickSlot::Ready { pixel, uv, context };
            }
            return;
        }
        if start.elapsed() > timeout {
            warn!("timed out waiting for pick readback");
            readback.unmap();
            if let Ok(mut slot) = shared.0.lock() {
                *slot = PickSlot::Idle;
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_clamped_and_latest_wins() {
        let mut request = PickerRequest::default();
        request.request(Vec2::new(-0.5, 2.0));
        assert_eq!(request.pending, Some(Vec2::new(0.0, 1.0)));
        request.request(Vec2::new(0.25, 0.75));
        assert_eq!(request.pending, Some(Vec2::new(0.25, 0.75)));
    }

    use std::sync::atomic::{AtomicBool, Ordering};

    fn pick_app(pixel: [f32; 4]) -> (App, Arc<AtomicBool>) {
        let shared = PickReadbackShared::default();
        if let Ok(mut slot) = shared.0.lock() {
            *slot = PickSlot::Ready {
                pixel,
                uv: Vec2::splat(0.5),
                context: PickCameraContext::default(),
            };
        }
        let fired = Arc::new(AtomicBool::new(false));
        let mut callbacks = PickCallbacks::default();
        let fired_clone = fired.clone();
        callbacks.on_position_picked(move |_| fired_clone.store(true, Ordering::Relaxed));

        let mut app = App::new();
        app.add_plugins(MinimalPlugins)
            .insert_resource(shared)
            .insert_resource(callbacks)
            .init_resource::<PickerResult>()
            .add_systems(Update, apply_pick_results);
        (app, fired)
    }

    #[test]
    fn zero_alpha_readback_is_a_miss() {
        let (mut app, fired) = pick_app([3.5, 42.0, 0.0, 0.0]);
        app.update();
        let result = app.world().resource::<PickerResult>();
        assert_eq!(result.generation, 1);
        assert!(result.hit.is_none());
        assert!(!fired.load(Ordering::Relaxed), "miss must not fire callbacks");
        let shared = app.world().resource::<PickReadbackShared>();
        assert!(matches!(*shared.0.lock().unwrap(), PickSlot::Idle));
    }

    #[test]
    fn hit_readback_decodes_payload_and_fires_callbacks() {
        // Payload word as written by the pick shader: region in the low
        // byte, label above it.
        let payload = (3u32 | (77u32 << 8)) as f32;
        let (mut app, fired) = pick_app([3.5, 42.0, payload, 1.0]);
        app.update();
        let result = app.world().resource::<PickerResult>();
        assert_eq!(result.generation, 1);
        let hit = result.hit.as_ref().unwrap();
        assert_eq!(hit.splat_index, 42);
        assert_eq!(hit.region_id, 3);
        assert_eq!(hit.label, 77);
        assert_eq!(hit.camera_depth, 3.5);
        assert!(fired.load(Ordering::Relaxed));
        let shared = app.world().resource::<PickReadbackShared>();
        assert!(matches!(*shared.0.lock().unwrap(), PickSlot::Idle));
    }
}
