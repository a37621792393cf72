// Splat compositing for Bevy's render graph.
//
// The main world owns the latest sort/texture results (SplatRenderState) and
// the per-frame view inputs (SplatViewInputs); everything is copied into the
// render world each frame, uploaded in the prepare phase, and drawn by a
// single instanced TriangleStrip pass between the main pass and
// post-processing. Ordering comes entirely from the depth index, so the pass
// carries no depth attachment.

use bevy::{
    asset::load_embedded_asset,
    core_pipeline::core_3d::graph::{Core3d, Node3d},
    prelude::*,
    render::{
        render_graph::{RenderGraphExt, RenderLabel, ViewNode, ViewNodeRunner},
        render_resource::{
            binding_types::{storage_buffer_read_only_sized, texture_2d, uniform_buffer},
            BindGroup, BindGroupEntries, BindGroupLayout, BindGroupLayoutEntries, BlendComponent,
            BlendFactor, BlendOperation, BlendState, Buffer, BufferInitDescriptor, BufferUsages,
            CachedRenderPipelineId, ColorTargetState, ColorWrites, Extent3d, FragmentState,
            LoadOp, MultisampleState, Operations, PipelineCache, PrimitiveState,
            PrimitiveTopology, RenderPassDescriptor, RenderPipelineDescriptor, ShaderStages,
            ShaderType, SpecializedRenderPipeline, SpecializedRenderPipelines, StoreOp,
            TexelCopyBufferLayout, Texture, TextureDescriptor, TextureDimension, TextureFormat,
            TextureSampleType, TextureUsages, TextureView, TextureViewDescriptor, VertexState,
        },
        renderer::{RenderDevice, RenderQueue},
        view::{ExtractedView, Msaa, ViewTarget},
        Extract, ExtractSchedule, Render, RenderApp, RenderSystems,
    },
};
use std::sync::Arc;

use crate::sort_worker::{TEXELS_PER_SPLAT, TEXTURE_WIDTH};
use crate::view_transform::MM_TO_M;

/// Fixed capacity of the per-region uniform array.
pub const MAX_REGIONS: usize = 8;

/// Format of the off-screen picking target.
pub const PICK_TARGET_FORMAT: TextureFormat = TextureFormat::Rgba32Float;

/// Per-region uniforms consumed by the vertex stage: rigid transform plus the
/// region-local boundary used for the in-shader discard.
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, ShaderType)]
#[repr(C)]
pub struct RegionUniform {
    pub position_offset: Vec4,
    pub quaternion: Vec4,
    pub boundary_min: Vec4,
    pub boundary_max: Vec4,
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable, ShaderType)]
#[repr(C)]
pub struct SplatUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub focal: Vec2,
    pub viewport: Vec2,
    pub scale_factor: f32,
    pub splat_scale: f32,
    pub region_count: u32,
    pub _pad: u32,
    pub regions: [RegionUniform; MAX_REGIONS],
}

/// Latest results handed over by the sorting thread, owned by the main world.
/// The renderer keeps drawing with whatever is here; it never waits.
#[derive(Resource)]
pub struct SplatRenderState {
    pub visible: bool,
    pub depth_index: Arc<Vec<u32>>,
    pub sorted_count: u32,
    pub sort_generation: u64,
    pub texture: Option<SplatTextureData>,
}

impl Default for SplatRenderState {
    fn default() -> Self {
        Self {
            visible: false,
            depth_index: Arc::new(Vec::new()),
            sorted_count: 0,
            sort_generation: 0,
            texture: None,
        }
    }
}

#[derive(Clone)]
pub struct SplatTextureData {
    pub width: u32,
    pub rows: u32,
    pub data: Arc<Vec<u8>>,
    pub generation: u64,
}

/// Per-frame view state composed by the service from the host's camera rig.
#[derive(Resource, Clone)]
pub struct SplatViewInputs {
    pub view: Mat4,
    pub proj: Mat4,
    pub focal: Vec2,
    pub viewport: Vec2,
    pub splat_scale: f32,
    pub regions: Vec<RegionUniform>,
}

impl Default for SplatViewInputs {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            focal: Vec2::splat(1.0),
            viewport: Vec2::new(1.0, 1.0),
            splat_scale: 1.0,
            regions: Vec::new(),
        }
    }
}

/// Render-world copy of everything the draw needs this frame.
#[derive(Resource)]
pub struct ExtractedSplatScene {
    pub visible: bool,
    pub depth_index: Arc<Vec<u32>>,
    pub sorted_count: u32,
    pub sort_generation: u64,
    pub texture: Option<SplatTextureData>,
    pub uniforms: SplatUniforms,
}

#[derive(Resource, Default)]
pub struct SplatGpuResources {
    pub uniform_buffer: Option<Buffer>,
    pub index_buffer: Option<Buffer>,
    index_capacity: u32,
    uploaded_sort_generation: u64,
    pub texture: Option<Texture>,
    pub texture_view: Option<TextureView>,
    texture_rows: u32,
    uploaded_texture_generation: u64,
    /// Splats actually drawable: sorted count capped to what the texture holds.
    pub instance_count: u32,
    texture_splat_capacity: u32,
}

#[derive(Resource, Default)]
pub struct SplatBindGroup(pub Option<BindGroup>);

#[derive(Component)]
pub struct SplatPipelineIds {
    pub color: CachedRenderPipelineId,
    pub pick: CachedRenderPipelineId,
}

pub struct SplatRenderPlugin;

impl Plugin for SplatRenderPlugin {
    fn build(&self, app: &mut App) {
        app.init_resource::<SplatRenderState>();
        app.init_resource::<SplatViewInputs>();

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app
            .init_resource::<SpecializedRenderPipelines<SplatPipeline>>()
            .init_resource::<SplatGpuResources>()
            .init_resource::<SplatBindGroup>()
            .add_systems(ExtractSchedule, extract_splat_scene)
            .add_systems(
                Render,
                prepare_splat_pipelines.in_set(RenderSystems::Prepare),
            )
            .add_systems(
                Render,
                prepare_splat_buffers.in_set(RenderSystems::PrepareResources),
            )
            .add_systems(
                Render,
                prepare_splat_bind_group.in_set(RenderSystems::PrepareBindGroups),
            )
            .add_render_graph_node::<ViewNodeRunner<SplatRenderNode>>(Core3d, SplatRenderLabel)
            .add_render_graph_edges(
                Core3d,
                (
                    Node3d::EndMainPass,
                    SplatRenderLabel,
                    Node3d::StartMainPassPostProcessing,
                ),
            );
    }

    fn finish(&self, app: &mut App) {
        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };
        render_app.init_resource::<SplatPipeline>();
    }
}

fn extract_splat_scene(
    mut commands: Commands,
    state: Extract<Res<SplatRenderState>>,
    inputs: Extract<Res<SplatViewInputs>>,
) {
    let mut uniforms = SplatUniforms {
        view: inputs.view,
        proj: inputs.proj,
        focal: inputs.focal,
        viewport: inputs.viewport,
        scale_factor: MM_TO_M,
        splat_scale: inputs.splat_scale,
        region_count: inputs.regions.len().min(MAX_REGIONS) as u32,
        _pad: 0,
        regions: [RegionUniform::zeroed(); MAX_REGIONS],
    };
    for (slot, region) in inputs.regions.iter().take(MAX_REGIONS).enumerate() {
        uniforms.regions[slot] = *region;
    }
    commands.insert_resource(ExtractedSplatScene {
        visible: state.visible,
        depth_index: state.depth_index.clone(),
        sorted_count: state.sorted_count,
        sort_generation: state.sort_generation,
        texture: state.texture.clone(),
        uniforms,
    });
}

#[derive(Resource)]
pub struct SplatPipeline {
    pub bind_group_layout: BindGroupLayout,
    pub shader: Handle<Shader>,
}

impl FromWorld for SplatPipeline {
    fn from_world(world: &mut World) -> Self {
        let asset_server = world.resource::<AssetServer>();
        let render_device = world.resource::<RenderDevice>();

        let bind_group_layout = render_device.create_bind_group_layout(
            Some("splat_bind_group_layout"),
            &BindGroupLayoutEntries::sequential(
                ShaderStages::VERTEX_FRAGMENT,
                (
                    // @binding(0): view/projection/region uniforms
                    uniform_buffer::<SplatUniforms>(false),
                    // @binding(1): packed attribute texture
                    texture_2d(TextureSampleType::Uint),
                    // @binding(2): sorted instance indices
                    storage_buffer_read_only_sized(false, None),
                ),
            ),
        );

        let shader = load_embedded_asset!(asset_server, "../assets/shaders/splat_render.wgsl");

        Self {
            bind_group_layout,
            shader,
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone)]
pub struct SplatPipelineKey {
    pub hdr: bool,
    pub msaa_samples: u32,
    pub pick: bool,
}

impl SpecializedRenderPipeline for SplatPipeline {
    type Key = SplatPipelineKey;

    fn specialize(&self, key: Self::Key) -> RenderPipelineDescriptor {
        let mut shader_defs = vec![];
        if key.pick {
            shader_defs.push("PICK_PASS".into());
        }

        let (target_format, blend, samples) = if key.pick {
            // Rgba32Float is not blendable; back-to-front order plus the
            // alpha-threshold discard make plain overwrite resolve the
            // nearest fragment anyway.
            (PICK_TARGET_FORMAT, None, 1)
        } else {
            let format = if key.hdr {
                ViewTarget::TEXTURE_FORMAT_HDR
            } else {
                TextureFormat::Rgba8UnormSrgb
            };
            // Premultiplied alpha: shader outputs vec4(rgb * a, a).
            let blend = Some(BlendState {
                color: BlendComponent {
                    src_factor: BlendFactor::One,
                    dst_factor: BlendFactor::OneMinusSrcAlpha,
                    operation: BlendOperation::Add,
                },
                alpha: BlendComponent {
                    src_factor: BlendFactor::One,
                    dst_factor: BlendFactor::OneMinusSrcAlpha,
                    operation: BlendOperation::Add,
                },
            });
            (format, blend, key.msaa_samples)
        };

        RenderPipelineDescriptor {
            label: Some("splat_composite_pipeline".into()),
            layout: vec![self.bind_group_layout.clone()],
            vertex: VertexState {
                shader: self.shader.clone(),
                shader_defs: shader_defs.clone(),
                entry_point: Some("vertex".into()),
                buffers: vec![],
            },
            primitive: PrimitiveState {
                topology: PrimitiveTopology::TriangleStrip,
                cull_mode: None,
                ..default()
            },
            // Splats are pre-sorted back-to-front; no depth attachment.
            depth_stencil: None,
            multisample: MultisampleState {
                count: samples,
                ..Default::default()
            },
            fragment: Some(FragmentState {
                shader: self.shader.clone(),
                shader_defs,
                entry_point: Some("fragment".into()),
                targets: vec![Some(ColorTargetState {
                    format: target_format,
                    blend,
                    write_mask: ColorWrites::ALL,
                })],
                ..default()
            }),
            ..default()
        }
    }
}

fn prepare_splat_pipelines(
    mut commands: Commands,
    pipeline_cache: Res<PipelineCache>,
    mut pipelines: ResMut<SpecializedRenderPipelines<SplatPipeline>>,
    pipeline: Res<SplatPipeline>,
    views: Query<(Entity, &ExtractedView, &Msaa), Without<Camera2d>>,
) {
    for (entity, view, msaa) in &views {
        let color = pipelines.specialize(
            &pipeline_cache,
            &pipeline,
            SplatPipelineKey {
                hdr: view.hdr,
                msaa_samples: msaa.samples(),
                pick: false,
            },
        );
        let pick = pipelines.specialize(
            &pipeline_cache,
            &pipeline,
            SplatPipelineKey {
                hdr: view.hdr,
                msaa_samples: 1,
                pick: true,
            },
        );
        commands.entity(entity).insert(SplatPipelineIds { color, pick });
    }
}

fn prepare_splat_buffers(
    render_device: Res<RenderDevice>,
    render_queue: Res<RenderQueue>,
    scene: Option<Res<ExtractedSplatScene>>,
    mut gpu: ResMut<SplatGpuResources>,
) {
    let Some(scene) = scene else { return };

    match &gpu.uniform_buffer {
        Some(buffer) => render_queue.write_buffer(buffer, 0, bytemuck::bytes_of(&scene.uniforms)),
        None => {
            gpu.uniform_buffer = Some(render_device.create_buffer_with_data(
                &BufferInitDescriptor {
                    label: Some("splat_uniform_buffer"),
                    contents: bytemuck::bytes_of(&scene.uniforms),
                    usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST,
                },
            ));
        }
    }

    if scene.sorted_count > 0 && scene.sort_generation != gpu.uploaded_sort_generation {
        let contents: &[u8] = bytemuck::cast_slice(scene.depth_index.as_slice());
        let needs_realloc = gpu
            .index_buffer
            .as_ref()
            .map(|_| scene.sorted_count > gpu.index_capacity)
            .unwrap_or(true);
        if needs_realloc {
            gpu.index_buffer = Some(render_device.create_buffer_with_data(
                &BufferInitDescriptor {
                    label: Some("splat_depth_index_buffer"),
                    contents,
                    usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
                },
            ));
            gpu.index_capacity = scene.sorted_count;
        } else if let Some(buffer) = &gpu.index_buffer {
            render_queue.write_buffer(buffer, 0, contents);
        }
        gpu.uploaded_sort_generation = scene.sort_generation;
    }

    if let Some(texture_data) = &scene.texture {
        if texture_data.generation != gpu.uploaded_texture_generation {
            if gpu.texture.is_none() || texture_data.rows != gpu.texture_rows {
                let texture = render_device.create_texture(&TextureDescriptor {
                    label: Some("splat_packed_texture"),
                    size: Extent3d {
                        width: texture_data.width,
                        height: texture_data.rows,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: TextureDimension::D2,
                    format: TextureFormat::Rgba32Uint,
                    usage: TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                gpu.texture_view = Some(texture.create_view(&TextureViewDescriptor::default()));
                gpu.texture = Some(texture);
                gpu.texture_rows = texture_data.rows;
                gpu.texture_splat_capacity =
                    texture_data.rows * texture_data.width / TEXELS_PER_SPLAT;
            }
            if let Some(texture) = &gpu.texture {
                render_queue.write_texture(
                    texture.as_image_copy(),
                    &texture_data.data,
                    TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(texture_data.width * 16),
                        rows_per_image: Some(texture_data.rows),
                    },
                    Extent3d {
                        width: texture_data.width,
                        height: texture_data.rows,
                        depth_or_array_layers: 1,
                    },
                );
                gpu.uploaded_texture_generation = texture_data.generation;
            }
        }
    }

    gpu.instance_count = scene.sorted_count.min(gpu.texture_splat_capacity);
}

fn prepare_splat_bind_group(
    render_device: Res<RenderDevice>,
    pipeline: Res<SplatPipeline>,
    gpu: Res<SplatGpuResources>,
    mut bind_group: ResMut<SplatBindGroup>,
) {
    bind_group.0 = match (&gpu.uniform_buffer, &gpu.texture_view, &gpu.index_buffer) {
        (Some(uniforms), Some(texture_view), Some(indices)) => {
            Some(render_device.create_bind_group(
                Some("splat_bind_group"),
                &pipeline.bind_group_layout,
                &BindGroupEntries::sequential((
                    uniforms.as_entire_binding(),
                    texture_view,
                    indices.as_entire_binding(),
                )),
            ))
        }
        _ => None,
    };
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct SplatRenderLabel;

#[derive(Default)]
pub struct SplatRenderNode;

impl ViewNode for SplatRenderNode {
    type ViewQuery = (
        &'static ExtractedView,
        &'static ViewTarget,
        &'static SplatPipelineIds,
    );

    fn run<'w>(
        &self,
        _graph: &mut bevy::render::render_graph::RenderGraphContext,
        render_context: &mut bevy::render::renderer::RenderContext<'w>,
        (view, target, pipeline_ids): bevy::ecs::query::QueryItem<'w, 'w, Self::ViewQuery>,
        world: &'w World,
    ) -> Result<(), bevy::render::render_graph::NodeRunError> {
        let Some(scene) = world.get_resource::<ExtractedSplatScene>() else {
            return Ok(());
        };
        let gpu = world.resource::<SplatGpuResources>();
        if !scene.visible || gpu.instance_count == 0 {
            return Ok(());
        }
        let Some(bind_group) = &world.resource::<SplatBindGroup>().0 else {
            return Ok(());
        };
        let pipeline_cache = world.resource::<PipelineCache>();
        let Some(pipeline) = pipeline_cache.get_render_pipeline(pipeline_ids.color) else {
            return Ok(());
        };

        let mut color_attachment = target.get_color_attachment();
        color_attachment.ops = Operations {
            load: LoadOp::Load,
            store: StoreOp::Store,
        };
        let mut pass = render_context
            .command_encoder()
            .begin_render_pass(&RenderPassDescriptor {
                label: Some("splat_composite_pass"),
                color_attachments: &[Some(color_attachment)],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        pass.set_viewport(
            view.viewport.x as f32,
            view.viewport.y as f32,
            view.viewport.z as f32,
            view.viewport.w as f32,
            0.0,
            1.0,
        );
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.draw(0..4, 0..gpu.instance_count);
        Ok(())
    }
}

// bytemuck::Zeroable is derived; expose a zeroed constructor for the
// fixed-size region array.
impl RegionUniform {
    pub fn zeroed() -> Self {
        bytemuck::Zeroable::zeroed()
    }

    pub fn identity() -> Self {
        Self {
            position_offset: Vec4::ZERO,
            quaternion: Vec4::new(0.0, 0.0, 0.0, 1.0),
            boundary_min: Vec4::splat(f32::MIN),
            boundary_max: Vec4::splat(f32::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_matches_std140_layout() {
        // 2 mat4 + (focal, viewport) + (scale, splat_scale, count, pad)
        // + 8 regions of 4 vec4s.
        let expected = 2 * 64 + 16 + 16 + MAX_REGIONS * 64;
        assert_eq!(std::mem::size_of::<SplatUniforms>(), expected);
        assert_eq!(std::mem::size_of::<RegionUniform>(), 64);
    }

    #[test]
    fn extracted_region_count_is_capped() {
        let inputs = SplatViewInputs {
            regions: vec![RegionUniform::identity(); MAX_REGIONS + 3],
            ..Default::default()
        };
        assert_eq!(inputs.regions.len().min(MAX_REGIONS), MAX_REGIONS);
    }
}
