//! Scene demo: renders a few test scenes with the software pipeline and
//! writes them out as PNGs.

use ash::vk;
use image::{ImageBuffer, Rgba};
use raster_engine::api::image::ImageViewDesc;
use raster_engine::api::ImageView;
use raster_engine::device::context::{Context, Stream};
use raster_engine::device::renderer::Renderer;
use raster_engine::pipeline::shader::{
    Dst, OpCode, Operand, OutputSlot, ShaderModule, ShaderOp, Src, WRITE_ALL,
};
use raster_engine::RendererConfig;
use std::sync::Arc;

const WIDTH: u32 = 256;
const HEIGHT: u32 = 256;

struct Target {
    storage: Vec<u8>,
    view: Arc<ImageView>,
}

impl Target {
    fn new() -> Self {
        let desc = ImageViewDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            width: WIDTH,
            height: HEIGHT,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
        };
        let mut storage = vec![0u8; ImageView::required_size(&desc)];
        let ptr = storage.as_mut_ptr();
        Self {
            storage,
            view: Arc::new(ImageView::new(desc, ptr)),
        }
    }

    fn save(&self, path: &str) {
        let image: ImageBuffer<Rgba<u8>, _> =
            ImageBuffer::from_raw(WIDTH, HEIGHT, self.storage.clone())
                .expect("framebuffer size mismatch");
        image.save(path).expect("failed to write PNG");
        log::info!("wrote {path}");
    }
}

/// Vertex shader: position from stream 0, color varying from stream 1
fn gradient_vertex_shader() -> Arc<ShaderModule> {
    Arc::new(ShaderModule::new(
        vec![
            ShaderOp {
                op: OpCode::Mov,
                dst: Dst::Output(OutputSlot::Position),
                mask: WRITE_ALL,
                srcs: vec![Operand::new(Src::Input(0))],
            },
            ShaderOp {
                op: OpCode::Mov,
                dst: Dst::Output(OutputSlot::Varying(0)),
                mask: WRITE_ALL,
                srcs: vec![Operand::new(Src::Input(1))],
            },
        ],
        0,
        2,
        1,
    ))
}

/// Pixel shader: interpolated varying 0 straight to the first attachment
fn varying_pixel_shader() -> Arc<ShaderModule> {
    Arc::new(ShaderModule::new(
        vec![ShaderOp {
            op: OpCode::Mov,
            dst: Dst::Output(OutputSlot::Color(0)),
            mask: WRITE_ALL,
            srcs: vec![Operand::new(Src::Input(0))],
        }],
        0,
        1,
        1,
    ))
}

fn bind_stream(context: &mut Context, slot: usize, data: &[[f32; 4]]) {
    context.input[slot] = Stream {
        buffer: data.as_ptr().cast::<u8>(),
        stride: 16,
        instance_stride: 0,
        format: vk::Format::R32G32B32A32_SFLOAT,
        count: data.len() as u32,
    };
}

fn main() {
    raster_engine::foundation::logging::init();

    let config = RendererConfig::default();
    let renderer = Renderer::new(&config).expect("renderer initialization failed");

    renderer.set_viewport(vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: WIDTH as f32,
        height: HEIGHT as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    });
    renderer.set_scissor(vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: WIDTH,
            height: HEIGHT,
        },
    });

    // Scene 1: the classic color-interpolated triangle.
    let target = Target::new();
    let positions = [
        [0.0f32, -0.8, 0.5, 1.0],
        [0.8, 0.8, 0.5, 1.0],
        [-0.8, 0.8, 0.5, 1.0],
    ];
    let colors = [
        [1.0f32, 0.0, 0.0, 1.0],
        [0.0, 1.0, 0.0, 1.0],
        [0.0, 0.0, 1.0, 1.0],
    ];

    let mut context = Context::new(gradient_vertex_shader());
    context.pixel_shader = Some(varying_pixel_shader());
    context.color_targets[0] = Some(Arc::clone(&target.view));
    bind_stream(&mut context, 0, &positions);
    bind_stream(&mut context, 1, &colors);

    renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
    renderer.synchronize();
    target.save("scene_triangle.png");

    // Scene 2: a fan of alpha-blended triangles.
    let target = Target::new();
    let mut context = Context::new(gradient_vertex_shader());
    context.pixel_shader = Some(varying_pixel_shader());
    context.color_targets[0] = Some(Arc::clone(&target.view));
    context.blend[0].enable = true;
    context.blend[0].src_factor = vk::BlendFactor::SRC_ALPHA;
    context.blend[0].dst_factor = vk::BlendFactor::ONE_MINUS_SRC_ALPHA;

    for step in 0..6 {
        let angle = step as f32 * std::f32::consts::TAU / 6.0;
        let (sin, cos) = angle.sin_cos();
        let positions = [
            [0.0f32, 0.0, 0.5, 1.0],
            [0.9 * cos, 0.9 * sin, 0.5, 1.0],
            [
                0.9 * (angle + 0.9).cos(),
                0.9 * (angle + 0.9).sin(),
                0.5,
                1.0,
            ],
        ];
        let shade = step as f32 / 5.0;
        let colors = [
            [1.0f32, shade, 1.0 - shade, 0.65],
            [shade, 1.0 - shade, 1.0, 0.65],
            [1.0 - shade, 1.0, shade, 0.65],
        ];
        bind_stream(&mut context, 0, &positions);
        bind_stream(&mut context, 1, &colors);
        renderer.draw(&context, vk::IndexType::UINT32, 1, 0, None, true);
        renderer.synchronize();
    }
    target.save("scene_fan.png");
}
