//! End-to-end draw scenarios
//!
//! Each test builds a small pipeline, submits draws through the renderer, and
//! checks the framebuffer bytes after `synchronize`.

use ash::vk;
use raster_engine::api::{ImageView, Query, QueryType};
use raster_engine::api::image::ImageViewDesc;
use raster_engine::device::context::{Context, Stream};
use raster_engine::device::renderer::Renderer;
use raster_engine::pipeline::shader::{
    Dst, OpCode, Operand, OutputSlot, ShaderModule, ShaderOp, Src, WRITE_ALL,
};
use raster_engine::RendererConfig;
use std::sync::Arc;

/// A color target over owned bytes
struct Target {
    storage: Vec<u8>,
    view: Arc<ImageView>,
    width: u32,
}

impl Target {
    fn new(width: u32, height: u32) -> Self {
        let desc = ImageViewDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
        };
        let mut storage = vec![0u8; ImageView::required_size(&desc)];
        let ptr = storage.as_mut_ptr();
        Self {
            storage,
            view: Arc::new(ImageView::new(desc, ptr)),
            width,
        }
    }

    fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let offset = ((y * self.width + x) * 4) as usize;
        self.storage[offset..offset + 4].try_into().unwrap()
    }
}

fn passthrough_vertex_shader() -> Arc<ShaderModule> {
    Arc::new(ShaderModule::new(
        vec![ShaderOp {
            op: OpCode::Mov,
            dst: Dst::Output(OutputSlot::Position),
            mask: WRITE_ALL,
            srcs: vec![Operand::new(Src::Input(0))],
        }],
        0,
        1,
        0,
    ))
}

fn solid_color_pixel_shader(color: [f32; 4]) -> Arc<ShaderModule> {
    Arc::new(ShaderModule::new(
        vec![ShaderOp {
            op: OpCode::Mov,
            dst: Dst::Output(OutputSlot::Color(0)),
            mask: WRITE_ALL,
            srcs: vec![Operand::new(Src::Constant(color))],
        }],
        0,
        0,
        0,
    ))
}

/// Binds clip-space positions as stream 0
fn bind_positions(context: &mut Context, positions: &[[f32; 4]]) {
    context.input[0] = Stream {
        buffer: positions.as_ptr().cast::<u8>(),
        stride: 16,
        instance_stride: 0,
        format: vk::Format::R32G32B32A32_SFLOAT,
        count: positions.len() as u32,
    };
}

fn renderer_for_tests() -> Renderer {
    let config = RendererConfig {
        worker_threads: 4,
        ..Default::default()
    };
    Renderer::new(&config).unwrap()
}

fn full_viewport(renderer: &Renderer, width: u32, height: u32) {
    renderer.set_viewport(vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f32,
        height: height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    });
    renderer.set_scissor(vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width, height },
    });
}

#[test]
fn test_single_triangle_fills_expected_pixels() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // Window-space corners (0,0), (2.9,0), (0,2.9): exactly the three pixel
    // centers (0,0), (1,0), (0,1) are covered, with no on-edge ties.
    let positions = [
        [-1.0f32, -1.0, 0.5, 1.0],
        [0.45, -1.0, 0.5, 1.0],
        [-1.0, 0.45, 0.5, 1.0],
    ];

    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &positions);

    renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    renderer.synchronize();

    let red = [255, 0, 0, 255];
    let empty = [0, 0, 0, 0];
    for y in 0..4 {
        for x in 0..4 {
            let expected = if (x, y) == (0, 0) || (x, y) == (1, 0) || (x, y) == (0, 1) {
                red
            } else {
                empty
            };
            assert_eq!(target.pixel(x, y), expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn test_back_face_culling_discards_clockwise_triangle() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // Screen-clockwise winding with counter-clockwise front faces.
    let positions = [
        [-1.0f32, -1.0, 0.5, 1.0],
        [0.45, -1.0, 0.5, 1.0],
        [-1.0, 0.45, 0.5, 1.0],
    ];

    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    context.cull_mode = vk::CullModeFlags::BACK;
    context.front_face = vk::FrontFace::COUNTER_CLOCKWISE;
    bind_positions(&mut context, &positions);

    renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    renderer.synchronize();

    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(target.pixel(x, y), [0, 0, 0, 0], "pixel ({x}, {y})");
        }
    }
}

/// A triangle that covers the whole viewport
const FULLSCREEN: [[f32; 4]; 3] = [
    [-1.0, -1.0, 0.5, 1.0],
    [3.0, -1.0, 0.5, 1.0],
    [-1.0, 3.0, 0.5, 1.0],
];

#[test]
fn test_overlapping_draws_commit_in_submission_order() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // Draw A: red everywhere.
    let mut context_a = Context::new(passthrough_vertex_shader());
    context_a.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context_a.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context_a, &FULLSCREEN);
    renderer.draw(&context_a, vk::IndexType::UINT32, 1, 0, None, true);

    // Draw B: blue over the left half (window x < 2).
    let left_half = [
        [-1.0f32, -1.0, 0.5, 1.0],
        [0.0, -1.0, 0.5, 1.0],
        [-1.0, 49.0, 0.5, 1.0],
    ];
    let mut context_b = Context::new(passthrough_vertex_shader());
    context_b.pixel_shader = Some(solid_color_pixel_shader([0.0, 0.0, 1.0, 1.0]));
    context_b.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context_b, &left_half);
    renderer.draw(&context_b, vk::IndexType::UINT32, 1, 0, None, true);

    renderer.synchronize();

    for y in 0..4 {
        for x in 0..4 {
            let expected = if x < 2 { [0, 0, 255, 255] } else { [255, 0, 0, 255] };
            assert_eq!(target.pixel(x, y), expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn test_many_overlapping_draws_resolve_to_the_last() {
    let renderer = renderer_for_tests();
    let target = Target::new(8, 8);
    full_viewport(&renderer, 8, 8);

    let colors: Vec<[f32; 4]> = (0..12)
        .map(|i| [(i as f32 + 1.0) / 16.0, 0.0, 0.0, 1.0])
        .collect();

    for color in &colors {
        let mut context = Context::new(passthrough_vertex_shader());
        context.pixel_shader = Some(solid_color_pixel_shader(*color));
        context.color_targets[0] = Some(Arc::clone(&target.view));
        bind_positions(&mut context, &FULLSCREEN);
        renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    }
    renderer.synchronize();

    let last = colors.last().unwrap();
    let expected_r = (last[0] * 255.0).round() as u8;
    for y in 0..8 {
        for x in 0..8 {
            assert_eq!(target.pixel(x, y)[0], expected_r, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn test_repeated_pipeline_hits_all_three_caches() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    let vertex_shader = passthrough_vertex_shader();
    let pixel_shader = solid_color_pixel_shader([0.0, 1.0, 0.0, 1.0]);

    for _ in 0..2 {
        let mut context = Context::new(Arc::clone(&vertex_shader));
        context.pixel_shader = Some(Arc::clone(&pixel_shader));
        context.color_targets[0] = Some(Arc::clone(&target.view));
        bind_positions(&mut context, &FULLSCREEN);
        // update=true forces state re-resolution; identical state keys must
        // hit the caches rather than rebuild.
        renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    }
    renderer.synchronize();

    for stats in renderer.cache_stats() {
        assert_eq!(stats.misses, 1, "exactly one build per stage");
        assert!(stats.hits >= 1, "second draw must hit the cache");
    }
}

#[test]
fn test_point_expansion_covers_a_3x3_block() {
    let renderer = renderer_for_tests();
    let target = Target::new(10, 10);
    full_viewport(&renderer, 10, 10);

    // Vertex shader: position from input 0, point size 3.
    let vertex_shader = Arc::new(ShaderModule::new(
        vec![
            ShaderOp {
                op: OpCode::Mov,
                dst: Dst::Output(OutputSlot::Position),
                mask: WRITE_ALL,
                srcs: vec![Operand::new(Src::Input(0))],
            },
            ShaderOp {
                op: OpCode::Mov,
                dst: Dst::Output(OutputSlot::PointSize),
                mask: WRITE_ALL,
                srcs: vec![Operand::new(Src::Constant([3.0; 4]))],
            },
        ],
        0,
        1,
        0,
    ));

    let positions = [[0.0f32, 0.0, 0.5, 1.0]];
    let mut context = Context::new(vertex_shader);
    context.topology = vk::PrimitiveTopology::POINT_LIST;
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 1.0, 1.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &positions);

    renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    renderer.synchronize();

    // The point centers on the corner at window (5, 5); its 3-pixel square
    // spans [3.5, 6.5), which under the top-left fill rule covers the 3×3
    // block with corners (3,3) and (5,5).
    let mut written = Vec::new();
    for y in 0..10 {
        for x in 0..10 {
            if target.pixel(x, y) != [0, 0, 0, 0] {
                written.push((x, y));
            }
        }
    }
    assert_eq!(written.len(), 9, "expected a 3×3 block, got {written:?}");
    for (x, y) in &written {
        assert!((3..=5).contains(x) && (3..=5).contains(y), "unexpected pixel ({x}, {y})");
    }
    assert!(written.contains(&(5, 5)));
}

#[test]
fn test_occlusion_query_counts_scissored_samples() {
    let renderer = renderer_for_tests();
    let target = Target::new(8, 8);
    full_viewport(&renderer, 8, 8);
    renderer.set_scissor(vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D { width: 3, height: 3 },
    });

    let query = Arc::new(Query::new(QueryType::Occlusion));
    renderer.add_query(Arc::clone(&query));

    // Two triangles: one covering the viewport (clipped to the 3×3 scissor),
    // one entirely outside the scissor region.
    let positions = [
        // fullscreen
        [-1.0f32, -1.0, 0.5, 1.0],
        [3.0, -1.0, 0.5, 1.0],
        [-1.0, 3.0, 0.5, 1.0],
        // bottom-right corner, outside the scissor
        [0.5, 0.5, 0.5, 1.0],
        [0.9, 0.5, 0.5, 1.0],
        [0.5, 0.9, 0.5, 1.0],
    ];

    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &positions);

    renderer.draw(&context, vk::IndexType::UINT32, 2, 0, None, true);
    renderer.synchronize();

    assert!(query.is_finished());
    assert_eq!(query.value(), 9);

    renderer.remove_query(&query);
}

#[test]
fn test_indexed_draw_reuses_vertices() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // A quad from four vertices and six indices; both triangles share an
    // edge, exercising the per-batch vertex cache.
    let positions = [
        [-1.0f32, -1.0, 0.5, 1.0],
        [1.0, -1.0, 0.5, 1.0],
        [1.0, 1.0, 0.5, 1.0],
        [-1.0, 1.0, 0.5, 1.0],
    ];
    let indices: [u32; 6] = [0, 1, 2, 0, 2, 3];

    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([0.0, 1.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &positions);
    context.index_buffer = Some(raster_engine::api::Buffer::new(
        indices.as_ptr() as *mut u8,
        std::mem::size_of_val(&indices),
    ));

    renderer.draw(&context, vk::IndexType::UINT32, 2, 0, None, true);
    renderer.synchronize();

    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(target.pixel(x, y), [0, 255, 0, 255], "pixel ({x}, {y})");
        }
    }
}

#[test]
fn test_fence_signals_after_draw() {
    use raster_engine::api::Fence;

    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    let fence = Arc::new(Fence::new());
    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &FULLSCREEN);

    renderer.draw(
        &context,
        vk::IndexType::UINT32,
        1,
        0,
        Some(Arc::clone(&fence) as Arc<dyn raster_engine::api::TaskEvents>),
        true,
    );
    fence.wait();
    assert!(fence.is_signaled());
}

#[test]
fn test_failed_routine_build_still_fires_events() {
    use raster_engine::api::Fence;

    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // No pixel shader bound without rasterizer discard: an invalid state.
    let mut context = Context::new(passthrough_vertex_shader());
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_positions(&mut context, &FULLSCREEN);

    let fence = Arc::new(Fence::new());
    renderer.draw(
        &context,
        vk::IndexType::UINT32,
        1,
        0,
        Some(Arc::clone(&fence) as Arc<dyn raster_engine::api::TaskEvents>),
        true,
    );
    // The draw is skipped, but the fence must not deadlock.
    fence.wait();
}

#[test]
fn test_rasterizer_discard_skips_pixels_and_occlusion() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    let query = Arc::new(Query::new(QueryType::Occlusion));
    renderer.add_query(Arc::clone(&query));

    let mut context = Context::new(passthrough_vertex_shader());
    context.pixel_shader = Some(solid_color_pixel_shader([1.0, 0.0, 0.0, 1.0]));
    context.color_targets[0] = Some(Arc::clone(&target.view));
    context.rasterizer_discard = true;
    bind_positions(&mut context, &FULLSCREEN);

    renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    renderer.synchronize();

    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(target.pixel(x, y), [0, 0, 0, 0]);
        }
    }
    assert_eq!(query.value(), 0);
    renderer.remove_query(&query);
}

#[test]
fn test_depth_test_rejects_farther_fragments() {
    let renderer = renderer_for_tests();
    let target = Target::new(4, 4);
    full_viewport(&renderer, 4, 4);

    // Depth attachment initialized to the near draw's depth.
    let depth_desc = ImageViewDesc {
        format: vk::Format::D32_SFLOAT,
        view_type: vk::ImageViewType::TYPE_2D,
        width: 4,
        height: 4,
        depth: 1,
        mip_levels: 1,
        array_layers: 1,
    };
    let mut depth_storage = vec![0u8; ImageView::required_size(&depth_desc)];
    let depth_ptr = depth_storage.as_mut_ptr();
    for texel in depth_storage.chunks_exact_mut(4) {
        texel.copy_from_slice(&1.0f32.to_le_bytes());
    }
    let depth_view = Arc::new(ImageView::new(depth_desc, depth_ptr));

    let near = [
        [-1.0f32, -1.0, 0.25, 1.0],
        [3.0, -1.0, 0.25, 1.0],
        [-1.0, 3.0, 0.25, 1.0],
    ];
    let far = [
        [-1.0f32, -1.0, 0.75, 1.0],
        [3.0, -1.0, 0.75, 1.0],
        [-1.0, 3.0, 0.75, 1.0],
    ];

    let draw_with_depth = |positions: &[[f32; 4]], color: [f32; 4]| {
        let mut context = Context::new(passthrough_vertex_shader());
        context.pixel_shader = Some(solid_color_pixel_shader(color));
        context.color_targets[0] = Some(Arc::clone(&target.view));
        context.depth_target = Some(Arc::clone(&depth_view));
        context.depth_test_enable = true;
        context.depth_write_enable = true;
        context.depth_compare_op = vk::CompareOp::LESS;
        bind_positions(&mut context, positions);
        renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    };

    draw_with_depth(&near, [1.0, 0.0, 0.0, 1.0]);
    draw_with_depth(&far, [0.0, 0.0, 1.0, 1.0]);
    renderer.synchronize();

    // The far (blue) draw fails the depth test everywhere.
    for y in 0..4 {
        for x in 0..4 {
            assert_eq!(target.pixel(x, y), [255, 0, 0, 255], "pixel ({x}, {y})");
        }
    }
    drop(depth_storage);
}
