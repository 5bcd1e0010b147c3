//! Draw-call scheduler
//!
//! `draw` turns one submission into parallel work while preserving the
//! ordering contract: vertex and primitive phases of different batches run
//! freely in parallel, pixel work is serialized across batches by tickets
//! (taken in batch order, retired in numeric order), and within one batch it
//! fans out across screen-space clusters joined by a wait group. Draw and
//! batch records are borrowed from pools; a shared guard runs the draw's
//! teardown after the last batch worker exits.

use super::clipper::{self, compute_clip_flags};
use super::context::{Context, Stream};
use super::pixel_processor::{PixelProcessor, SamplingRoutineCache};
use super::primitive::{
    ClipFlags, DrawData, Polygon, Primitive, StencilData, Triangle, TransformedVertex, VertexTask,
};
use super::setup_processor::{SetupProcessor, SetupState};
use super::vertex_processor::VertexProcessor;
use crate::api::{Query, QueryType, TaskEvents};
use crate::config::RendererConfig;
use crate::foundation::math::{clamp, iround, Vec4};
use crate::pipeline::constants::{
    BATCH_SIZE, CLUSTER_COUNT, MAX_BATCH_INSTANCES, MAX_IMAGE_BINDINGS, MAX_POINT_SIZE,
    MAX_PRIMITIVES, MAX_VERTEX_INPUTS,
};
use crate::reactor::backend::BuildOptions;
use crate::reactor::Routine;
use crate::task::{Loan, Pool, Scheduler, Ticket, TicketQueue, WaitGroup};
use crate::EngineError;
use ash::vk;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type VertexRoutineFn =
    unsafe extern "C" fn(*mut TransformedVertex, *const u32, *mut VertexTask, *const DrawData);
type SetupRoutineFn =
    unsafe extern "C" fn(*mut Primitive, *const Triangle, *const Polygon, *const DrawData) -> i32;
type PixelRoutineFn = unsafe extern "C" fn(*const Primitive, i32, i32, *const DrawData);

/// `DrawData` wrapper giving generated code interior-mutable access to the
/// per-cluster counters while the host holds shared references.
struct SharedDrawData(UnsafeCell<DrawData>);

// Cluster counters are exclusively owned per cluster task; everything else
// is read-only during execution.
unsafe impl Send for SharedDrawData {}
unsafe impl Sync for SharedDrawData {}

impl SharedDrawData {
    fn get(&self) -> *mut DrawData {
        self.0.get()
    }
}

/// Primitive class resolved at submit time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupKind {
    Triangle,
    Line,
    Point,
}

/// A once-written record describing one submitted draw
pub struct DrawCall {
    id: u64,
    data: Box<SharedDrawData>,
    topology: vk::PrimitiveTopology,
    index_type: vk::IndexType,
    setup_kind: SetupKind,
    setup_state: SetupState,
    occlusion_enabled: bool,

    vertex_routine: Option<Arc<Routine>>,
    setup_routine: Option<Arc<Routine>>,
    pixel_routine: Option<Arc<Routine>>,
    vertex_entry: usize,
    setup_entry: usize,
    pixel_entry: usize,

    num_primitives: u32,
    num_primitives_per_batch: u32,
    num_batches: u32,
    num_batch_workers: u32,

    batch_tickets: Mutex<Vec<Option<Ticket>>>,
    queries: Vec<Arc<Query>>,
    events: Option<Arc<dyn TaskEvents>>,
}

impl Default for DrawCall {
    fn default() -> Self {
        Self {
            id: 0,
            data: Box::new(SharedDrawData(UnsafeCell::new(DrawData::default()))),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            index_type: vk::IndexType::UINT32,
            setup_kind: SetupKind::Triangle,
            setup_state: SetupState {
                states: bytemuck::Zeroable::zeroed(),
                hash: 0,
            },
            occlusion_enabled: false,
            vertex_routine: None,
            setup_routine: None,
            pixel_routine: None,
            vertex_entry: 0,
            setup_entry: 0,
            pixel_entry: 0,
            num_primitives: 0,
            num_primitives_per_batch: 0,
            num_batches: 0,
            num_batch_workers: 0,
            batch_tickets: Mutex::new(Vec::new()),
            queries: Vec::new(),
            events: None,
        }
    }
}

impl DrawCall {
    fn setup(&self) {
        for query in &self.queries {
            query.start();
        }
        if let Some(events) = &self.events {
            events.start();
        }
    }

    fn teardown(&mut self) {
        if let Some(events) = self.events.take() {
            events.finish();
        }

        let data = unsafe { &*self.data.get() };
        for query in self.queries.drain(..) {
            if query.query_type() == QueryType::Occlusion {
                for cluster in 0..CLUSTER_COUNT {
                    query.add(u64::from(data.occlusion[cluster]));
                }
            }
            query.finish();
        }

        self.vertex_routine = None;
        self.setup_routine = None;
        self.pixel_routine = None;
    }
}

/// Runs the draw's teardown when the last batch worker drops its clone
struct DrawGuard {
    draw: Mutex<Option<Loan<Box<DrawCall>>>>,
}

impl DrawGuard {
    fn with_draw<R>(&self, f: impl FnOnce(&DrawCall) -> R) -> R {
        let guard = self.draw.lock().unwrap();
        f(guard.as_ref().unwrap())
    }
}

impl Drop for DrawGuard {
    fn drop(&mut self) {
        if let Some(mut draw) = self.draw.lock().unwrap().take() {
            log::trace!("draw {} finished", draw.id);
            draw.teardown();
        }
    }
}

/// A slice of a draw assigned to one worker pass
pub struct BatchData {
    id: u32,
    first_primitive: u32,
    num_primitives: u32,
    num_visible: usize,
    indices: Vec<[u32; 3]>,
    triangles: Vec<Triangle>,
    primitives: Vec<Primitive>,
    vertex_task: Box<VertexTask>,
}

impl Default for BatchData {
    fn default() -> Self {
        Self {
            id: 0,
            first_primitive: 0,
            num_primitives: 0,
            num_visible: 0,
            // One extra primitive record absorbs SIMD-width overrun.
            indices: vec![[0; 3]; BATCH_SIZE + 1],
            triangles: vec![Triangle::default(); BATCH_SIZE + 1],
            primitives: vec![Primitive::default(); BATCH_SIZE],
            vertex_task: Box::new(VertexTask::default()),
        }
    }
}

/// Mutable submission-side state shared by consecutive draws
struct RenderState {
    viewport: vk::Viewport,
    scissor: vk::Rect2D,
    setup_state: Option<SetupState>,
    vertex_routine: Option<Arc<Routine>>,
    setup_routine: Option<Arc<Routine>>,
    pixel_routine: Option<Arc<Routine>>,
}

/// The software renderer: routine caches plus the draw scheduler
pub struct Renderer {
    scheduler: Arc<Scheduler>,
    vertex_processor: VertexProcessor,
    setup_processor: SetupProcessor,
    pixel_processor: PixelProcessor,
    sampling_cache: SamplingRoutineCache,
    build_options: BuildOptions,
    tickets: TicketQueue,
    draw_call_pool: Pool<Box<DrawCall>>,
    batch_data_pool: Pool<Box<BatchData>>,
    queries: Mutex<Vec<Arc<Query>>>,
    state: Mutex<RenderState>,
    next_draw_id: AtomicU64,
    force_single_batch_worker: bool,
}

impl Renderer {
    /// Creates a renderer from the configuration
    pub fn new(config: &RendererConfig) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InitializationFailed(e.to_string()))?;
        log::debug!("creating renderer: {config:?}");

        let build_options = BuildOptions {
            backend: config.backend,
            opt_level: config.optimization_level,
            resolver: None,
        };

        Ok(Self {
            scheduler: Scheduler::new(config.worker_threads),
            vertex_processor: VertexProcessor::new(config.routine_cache_capacity),
            setup_processor: SetupProcessor::new(config.routine_cache_capacity),
            pixel_processor: PixelProcessor::new(config.routine_cache_capacity),
            sampling_cache: SamplingRoutineCache::new(),
            build_options,
            tickets: TicketQueue::new(),
            draw_call_pool: Pool::new(16, || Box::new(DrawCall::default())),
            batch_data_pool: Pool::new(MAX_BATCH_INSTANCES, || Box::new(BatchData::default())),
            queries: Mutex::new(Vec::new()),
            state: Mutex::new(RenderState {
                viewport: vk::Viewport {
                    x: 0.0,
                    y: 0.0,
                    width: 0.0,
                    height: 0.0,
                    min_depth: 0.0,
                    max_depth: 1.0,
                },
                scissor: vk::Rect2D::default(),
                setup_state: None,
                vertex_routine: None,
                setup_routine: None,
                pixel_routine: None,
            }),
            next_draw_id: AtomicU64::new(1),
            force_single_batch_worker: config.force_single_batch_worker,
        })
    }

    /// Sets the viewport for subsequent draws
    pub fn set_viewport(&self, viewport: vk::Viewport) {
        self.state.lock().unwrap().viewport = viewport;
    }

    /// Sets the scissor for subsequent draws
    pub fn set_scissor(&self, scissor: vk::Rect2D) {
        self.state.lock().unwrap().scissor = scissor;
    }

    /// Attaches a query; subsequent draws update it
    pub fn add_query(&self, query: Arc<Query>) {
        self.queries.lock().unwrap().push(query);
    }

    /// Detaches a query
    pub fn remove_query(&self, query: &Arc<Query>) {
        self.queries
            .lock()
            .unwrap()
            .retain(|q| !Arc::ptr_eq(q, query));
    }

    /// Advances instance-rate streams by their per-instance stride
    pub fn advance_instance_attributes(streams: &mut [Stream]) {
        for stream in streams.iter_mut().take(MAX_VERTEX_INPUTS) {
            if stream.count != 0 && stream.instance_stride != 0 {
                stream.buffer =
                    unsafe { stream.buffer.add(stream.instance_stride as usize) };
            }
        }
    }

    /// Drains all outstanding work
    pub fn synchronize(&self) {
        let ticket = self.tickets.take();
        ticket.wait(&self.scheduler);
        ticket.done();
    }

    /// Per-stage routine cache statistics, in vertex/setup/pixel order
    pub fn cache_stats(&self) -> [crate::foundation::cache::CacheStats; 3] {
        [
            self.vertex_processor.cache_stats(),
            self.setup_processor.cache_stats(),
            self.pixel_processor.cache_stats(),
        ]
    }

    fn has_occlusion_query(&self) -> bool {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .any(|q| q.query_type() == QueryType::Occlusion)
    }

    /// Submits one draw. `count` is the primitive count; `update` indicates
    /// the pipeline state changed since the previous draw and the three
    /// routines must be re-resolved.
    pub fn draw(
        &self,
        context: &Context,
        index_type: vk::IndexType,
        count: u32,
        base_vertex: i32,
        events: Option<Arc<dyn TaskEvents>>,
        update: bool,
    ) {
        if count == 0 {
            return;
        }
        if cfg!(debug_assertions) && count > MAX_PRIMITIVES {
            log::warn!("draw of {count} primitives exceeds the supported maximum; ignored");
            return;
        }
        if context.multi_sample_mask == 0 {
            return;
        }

        let id = self.next_draw_id.fetch_add(1, Ordering::Relaxed);
        let occlusion = self.has_occlusion_query();

        // Resolve state keys and routines under the submission lock.
        let (viewport, scissor, setup_state, routines) = {
            let mut state = self.state.lock().unwrap();
            if update || state.vertex_routine.is_none() {
                let vertex_state = VertexProcessor::update(context);
                let setup_state = SetupProcessor::update(context);
                let pixel_state = PixelProcessor::update(context, occlusion);

                let resolved = (|| {
                    let vertex = self.vertex_processor.routine(
                        &vertex_state,
                        &context.vertex_shader,
                        &self.build_options,
                    )?;
                    let setup = self
                        .setup_processor
                        .routine(&setup_state, &self.build_options)?;
                    let pixel = if context.rasterizer_discard {
                        None
                    } else {
                        let shader = context.pixel_shader.as_ref().ok_or_else(|| {
                            crate::reactor::backend::BuildError::InvalidState(
                                "draw without a pixel shader".into(),
                            )
                        })?;
                        Some(self.pixel_processor.routine(
                            &pixel_state,
                            shader,
                            &context.descriptor_set,
                            &self.sampling_cache,
                            &self.build_options,
                        )?)
                    };
                    Ok::<_, crate::reactor::backend::BuildError>((vertex, setup, pixel))
                })();

                match resolved {
                    Ok((vertex, setup, pixel)) => {
                        state.setup_state = Some(setup_state);
                        state.vertex_routine = Some(vertex);
                        state.setup_routine = Some(setup);
                        state.pixel_routine = pixel;
                    }
                    Err(error) => {
                        log::warn!("draw {id} skipped: {error}");
                        // Failing draws still notify observers so fences
                        // attached to them cannot deadlock.
                        if let Some(events) = events {
                            events.start();
                            events.finish();
                        }
                        return;
                    }
                }
            }

            (
                state.viewport,
                state.scissor,
                state.setup_state.unwrap(),
                (
                    state.vertex_routine.clone().unwrap(),
                    state.setup_routine.clone().unwrap(),
                    state.pixel_routine.clone(),
                ),
            )
        };

        let mut draw = self.draw_call_pool.borrow();
        let (vertex_routine, setup_routine, pixel_routine) = routines;

        draw.id = id;
        draw.topology = context.topology;
        draw.index_type = index_type;
        draw.setup_kind = if context.is_draw_triangle() {
            SetupKind::Triangle
        } else if context.is_draw_line() {
            SetupKind::Line
        } else {
            SetupKind::Point
        };
        draw.setup_state = setup_state;
        draw.occlusion_enabled = occlusion && !context.rasterizer_discard;

        draw.vertex_entry = vertex_routine.entry(0) as usize;
        draw.setup_entry = setup_routine.entry(0) as usize;
        draw.pixel_entry = pixel_routine.as_ref().map_or(0, |r| r.entry(0) as usize);
        draw.vertex_routine = Some(vertex_routine);
        draw.setup_routine = Some(setup_routine);
        draw.pixel_routine = pixel_routine;

        let ms = context.sample_count.max(1);
        draw.num_primitives = count;
        draw.num_primitives_per_batch = (BATCH_SIZE as u32 / ms).max(1);
        draw.num_batches = count.div_ceil(draw.num_primitives_per_batch);
        let worker_limit = if self.force_single_batch_worker {
            1
        } else {
            self.scheduler.worker_count() as u32
        };
        draw.num_batch_workers = draw
            .num_batches
            .min(MAX_BATCH_INSTANCES as u32)
            .min(worker_limit)
            .max(1);

        *draw.batch_tickets.lock().unwrap() = self
            .tickets
            .take_n(draw.num_batches as usize)
            .into_iter()
            .map(Some)
            .collect();

        draw.queries = if draw.occlusion_enabled {
            self.queries.lock().unwrap().clone()
        } else {
            Vec::new()
        };
        draw.events = events;

        // Fill the per-draw data block.
        {
            let data = unsafe { &mut *draw.data.get() };
            *data = DrawData::default();

            for (index, stream) in context.input.iter().enumerate() {
                data.input[index].buffer = stream.buffer;
                data.input[index].stride = stream.stride as i32;
                data.input[index].count = stream.count as i32;
            }
            data.indices = context
                .index_buffer
                .map_or(std::ptr::null(), |b| b.get_pointer(0) as *const u8);
            data.instance_id = context.instance_id;
            data.base_vertex = base_vertex;
            data.push_constants = context.push_constants;

            if let Some(shader) = &context.pixel_shader {
                for binding in shader.sampled_bindings() {
                    if usize::from(binding) >= MAX_IMAGE_BINDINGS {
                        continue;
                    }
                    if let Some((view, _)) =
                        context.descriptor_set.image_at(u32::from(binding))
                    {
                        data.image_descriptors[usize::from(binding)] = view.descriptor();
                    }
                }
            }

            // Viewport-derived constants.
            let half_width = 0.5 * viewport.width;
            let half_height = 0.5 * viewport.height;
            data.viewport_scale = [half_width, half_height];
            data.viewport_offset = [viewport.x + half_width, viewport.y + half_height];
            data.half_pixel = [
                if half_width != 0.0 { 0.5 / half_width } else { 0.0 },
                if half_height != 0.0 { 0.5 / half_height } else { 0.0 },
            ];
            let mut near = viewport.min_depth;
            if context.is_draw_triangle() {
                near += context.depth_bias;
            }
            data.depth_near = near;
            data.depth_range = viewport.max_depth - viewport.min_depth;
            data.slope_depth_bias = context.slope_depth_bias;
            data.line_width = context.line_width;

            data.stencil_front = StencilData {
                reference: context.front_stencil.reference as i32,
                compare_mask: context.front_stencil.compare_mask as i32,
                write_mask: context.front_stencil.write_mask as i32,
                reserved: 0,
            };
            data.stencil_back = StencilData {
                reference: context.back_stencil.reference as i32,
                compare_mask: context.back_stencil.compare_mask as i32,
                write_mask: context.back_stencil.write_mask as i32,
                reserved: 0,
            };

            if context.alpha_to_coverage {
                match ms {
                    4 => data.a2c = [0.2, 0.4, 0.6, 0.8],
                    2 => data.a2c = [0.25, 0.75, 0.0, 0.0],
                    _ => {}
                }
            }

            for (index, target) in context.color_targets.iter().enumerate() {
                if let Some(view) = target {
                    data.color_buffer[index] =
                        view.get_offset_pointer((0, 0, 0), vk::ImageAspectFlags::COLOR, 0, 0);
                    data.color_pitch_b[index] =
                        view.row_pitch_bytes(vk::ImageAspectFlags::COLOR, 0);
                }
            }
            if let Some(view) = &context.depth_target {
                data.depth_buffer =
                    view.get_offset_pointer((0, 0, 0), vk::ImageAspectFlags::DEPTH, 0, 0);
                data.depth_pitch_b = view.row_pitch_bytes(vk::ImageAspectFlags::DEPTH, 0);
            }
            if let Some(view) = &context.stencil_target {
                data.stencil_buffer =
                    view.get_offset_pointer((0, 0, 0), vk::ImageAspectFlags::STENCIL, 0, 0);
                data.stencil_pitch_b = view.row_pitch_bytes(vk::ImageAspectFlags::STENCIL, 0);
            }

            data.scissor_x0 = scissor.offset.x;
            data.scissor_x1 = scissor.offset.x + scissor.extent.width as i32;
            data.scissor_y0 = scissor.offset.y;
            data.scissor_y1 = scissor.offset.y + scissor.extent.height as i32;
        }

        self.run_draw(draw);
    }

    fn run_draw(&self, draw: Loan<Box<DrawCall>>) {
        draw.setup();
        let num_batch_workers = draw.num_batch_workers;
        let guard = Arc::new(DrawGuard {
            draw: Mutex::new(Some(draw)),
        });

        for worker in 0..num_batch_workers {
            let guard = Arc::clone(&guard);
            let scheduler = Arc::clone(&self.scheduler);
            let batch_pool = self.batch_data_pool.clone();
            self.scheduler.spawn(move || {
                run_batch_worker(worker, &guard, &scheduler, &batch_pool);
            });
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.synchronize();
    }
}

fn run_batch_worker(
    worker: u32,
    guard: &DrawGuard,
    scheduler: &Arc<Scheduler>,
    batch_pool: &Pool<Box<BatchData>>,
) {
    // The guard keeps the draw record alive and untouched for this worker's
    // whole lifetime; phases must not serialize on its lock.
    let draw_ptr = guard.with_draw(|draw| draw as *const DrawCall);
    let draw = unsafe { &*draw_ptr };

    let num_batches = draw.num_batches;
    let num_batch_workers = draw.num_batch_workers;
    let per_batch = draw.num_primitives_per_batch;
    let num_primitives = draw.num_primitives;
    let discard = draw.setup_state.rasterizer_discard();

    let mut batch_id = worker;
    while batch_id < num_batches {
        let mut batch = batch_pool.borrow();
        batch.id = batch_id;
        batch.first_primitive = batch_id * per_batch;
        batch.num_primitives =
            (batch.first_primitive + per_batch).min(num_primitives) - batch.first_primitive;
        batch.num_visible = 0;

        let ticket = draw.batch_tickets.lock().unwrap()[batch_id as usize]
            .take()
            .expect("batch ticket already taken");
        log::trace!(
            "draw {}, batch {} ({} primitives)",
            draw.id,
            batch.id,
            batch.num_primitives
        );

        process_vertices(draw, &mut batch);

        if !discard {
            process_primitives(draw, &mut batch);

            if batch.num_visible > 0 {
                ticket.wait(scheduler);
                process_pixels(draw, &batch, scheduler);
            }
        }

        drop(ticket);
        batch_id += num_batch_workers;
    }
}

/// Widens indices for one batch per the topology, appending one repeated
/// index record for SIMD overrun, and applying the base vertex.
fn extract_batch_indices(draw: &DrawCall, batch: &mut BatchData) {
    let data = unsafe { &*draw.data.get() };
    let base = data.base_vertex;
    let start = batch.first_primitive;
    let count = batch.num_primitives;

    let fetch: Box<dyn Fn(u32) -> u32> = if data.indices.is_null() {
        Box::new(move |i: u32| (i as i32 + base) as u32)
    } else {
        match draw.index_type {
            vk::IndexType::UINT16 => {
                let indices = data.indices as *const u16;
                Box::new(move |i: u32| {
                    (unsafe { *indices.add(i as usize) } as i32 + base) as u32
                })
            }
            _ => {
                let indices = data.indices as *const u32;
                Box::new(move |i: u32| {
                    (unsafe { *indices.add(i as usize) } as i32 + base) as u32
                })
            }
        }
    };

    match draw.topology {
        vk::PrimitiveTopology::POINT_LIST => {
            for i in 0..count {
                let v = fetch(start + i);
                batch.indices[i as usize] = [v, v, v];
            }
        }
        vk::PrimitiveTopology::LINE_LIST => {
            for i in 0..count {
                let base_index = 2 * (start + i);
                let v0 = fetch(base_index);
                let v1 = fetch(base_index + 1);
                batch.indices[i as usize] = [v0, v1, v1];
            }
        }
        vk::PrimitiveTopology::LINE_STRIP => {
            for i in 0..count {
                let v0 = fetch(start + i);
                let v1 = fetch(start + i + 1);
                batch.indices[i as usize] = [v0, v1, v1];
            }
        }
        vk::PrimitiveTopology::TRIANGLE_LIST => {
            for i in 0..count {
                let base_index = 3 * (start + i);
                batch.indices[i as usize] =
                    [fetch(base_index), fetch(base_index + 1), fetch(base_index + 2)];
            }
        }
        vk::PrimitiveTopology::TRIANGLE_STRIP => {
            for i in 0..count {
                let index = start + i;
                let odd = index & 1;
                batch.indices[i as usize] = [
                    fetch(index),
                    fetch(index + odd + 1),
                    fetch(index + (1 - odd) + 1),
                ];
            }
        }
        vk::PrimitiveTopology::TRIANGLE_FAN => {
            for i in 0..count {
                let index = start + i + 1;
                batch.indices[i as usize] = [fetch(index), fetch(index + 1), fetch(0)];
            }
        }
        other => {
            log::error!("unsupported topology {other:?}");
            for i in 0..count {
                batch.indices[i as usize] = [0; 3];
            }
        }
    }

    // Repeat the last record to absorb SIMD-width overrun.
    let last = batch.indices[count as usize - 1][2];
    batch.indices[count as usize] = [last; 3];
}

fn process_vertices(draw: &DrawCall, batch: &mut BatchData) {
    extract_batch_indices(draw, batch);

    batch.vertex_task.primitive_start = batch.first_primitive;
    batch.vertex_task.vertex_count = batch.num_primitives * 3;
    if batch.vertex_task.vertex_cache.draw_call != draw.id {
        batch.vertex_task.vertex_cache.clear();
        batch.vertex_task.vertex_cache.draw_call = draw.id;
    }

    let routine: VertexRoutineFn = unsafe { std::mem::transmute(draw.vertex_entry) };
    unsafe {
        routine(
            &mut batch.triangles[0].v0,
            batch.indices.as_ptr().cast::<u32>(),
            batch.vertex_task.as_mut(),
            draw.data.get(),
        );
    }
}

fn process_primitives(draw: &DrawCall, batch: &mut BatchData) {
    let setup: SetupRoutineFn = unsafe { std::mem::transmute(draw.setup_entry) };
    let data = draw.data.get();
    let count = batch.num_primitives as usize;
    let mut visible = 0usize;

    let multisample = draw.setup_state.states.multisample > 1;
    for i in 0..count {
        let triangle = batch.triangles[i];
        let accepted = match draw.setup_kind {
            SetupKind::Triangle => {
                setup_triangle(setup, &triangle, data, &mut batch.primitives[visible])
            }
            SetupKind::Line => {
                setup_line(setup, &triangle, data, &mut batch.primitives[visible], multisample)
            }
            SetupKind::Point => {
                let mut triangle = triangle;
                setup_point(setup, &mut triangle, data, &mut batch.primitives[visible])
            }
        };
        if accepted {
            visible += 1;
        }
    }

    batch.num_visible = visible;
}

fn setup_triangle(
    setup: SetupRoutineFn,
    triangle: &Triangle,
    data: *const DrawData,
    primitive: &mut Primitive,
) -> bool {
    let f0 = ClipFlags::from_bits_retain(triangle.v0.clip_flags);
    let f1 = ClipFlags::from_bits_retain(triangle.v1.clip_flags);
    let f2 = ClipFlags::from_bits_retain(triangle.v2.clip_flags);

    // All three vertices outside one plane, or any non-finite: cull.
    if (f0 & f1 & f2) != ClipFlags::FINITE {
        return false;
    }

    let mut polygon = Polygon::from_slice(&[
        triangle.v0.position,
        triangle.v1.position,
        triangle.v2.position,
    ]);

    let crossed = (f0 | f1 | f2) & !ClipFlags::FINITE;
    if !crossed.is_empty() && !clipper::clip(&mut polygon, crossed) {
        return false;
    }

    unsafe { setup(primitive, triangle, &polygon, data) != 0 }
}

fn setup_line(
    setup: SetupRoutineFn,
    triangle: &Triangle,
    data: *const DrawData,
    primitive: &mut Primitive,
    multisample: bool,
) -> bool {
    let data_ref = unsafe { &*data };
    let line_width = data_ref.line_width;

    let p0 = Vec4::from(triangle.v0.position);
    let p1 = Vec4::from(triangle.v1.position);

    if p0.w <= 0.0 && p1.w <= 0.0 {
        return false;
    }

    let half_width = data_ref.viewport_scale[0];
    let half_height = data_ref.viewport_scale[1];
    let dx = half_width * (p1.x / p1.w - p0.x / p0.w);
    let dy = half_height * (p1.y / p1.w - p0.y / p0.w);
    if dx == 0.0 && dy == 0.0 {
        return false;
    }

    if multisample {
        // Rectangle of width line_width perpendicular to the line.
        let scale = line_width * 0.5 / (dx * dx + dy * dy).sqrt();
        let (dx, dy) = (dx * scale, dy * scale);
        let corners = [
            Vec4::new(p0.x - dy * p0.w / half_height, p0.y + dx * p0.w / half_width, p0.z, p0.w),
            Vec4::new(p1.x - dy * p1.w / half_height, p1.y + dx * p1.w / half_width, p1.z, p1.w),
            Vec4::new(p1.x + dy * p1.w / half_height, p1.y - dx * p1.w / half_width, p1.z, p1.w),
            Vec4::new(p0.x + dy * p0.w / half_height, p0.y - dx * p0.w / half_width, p0.z, p0.w),
        ];
        return clip_and_setup(setup, triangle, data, primitive, &corners);
    }

    // Diamond-exit convention: each endpoint expands into a small diamond
    // and six of the eight points form the hull, selected by direction.
    let dx0 = line_width * 0.5 * p0.w / half_width;
    let dy0 = line_width * 0.5 * p0.w / half_height;
    let dx1 = line_width * 0.5 * p1.w / half_width;
    let dy1 = line_width * 0.5 * p1.w / half_height;

    let points = [
        Vec4::new(p0.x - dx0, p0.y, p0.z, p0.w),
        Vec4::new(p0.x, p0.y + dy0, p0.z, p0.w),
        Vec4::new(p0.x + dx0, p0.y, p0.z, p0.w),
        Vec4::new(p0.x, p0.y - dy0, p0.z, p0.w),
        Vec4::new(p1.x - dx1, p1.y, p1.z, p1.w),
        Vec4::new(p1.x, p1.y + dy1, p1.z, p1.w),
        Vec4::new(p1.x + dx1, p1.y, p1.z, p1.w),
        Vec4::new(p1.x, p1.y - dy1, p1.z, p1.w),
    ];

    let hull: [usize; 6] = if dx > -dy {
        if dx > dy {
            [0, 1, 5, 6, 7, 3] // right
        } else {
            [0, 4, 5, 6, 2, 3] // down
        }
    } else if dx > dy {
        [0, 1, 2, 6, 7, 4] // up
    } else {
        [1, 2, 3, 7, 4, 5] // left
    };

    let corners: Vec<Vec4> = hull.iter().map(|&i| points[i]).collect();
    clip_and_setup(setup, triangle, data, primitive, &corners)
}

fn setup_point(
    setup: SetupRoutineFn,
    triangle: &mut Triangle,
    data: *const DrawData,
    primitive: &mut Primitive,
) -> bool {
    let data_ref = unsafe { &*data };
    let point_size = clamp(triangle.v0.point_size, 1.0, MAX_POINT_SIZE);

    let v = Vec4::from(triangle.v0.position);
    let extent_x = point_size * v.w * data_ref.half_pixel[0];
    let extent_y = point_size * v.w * data_ref.half_pixel[1];

    let corners = [
        Vec4::new(v.x - extent_x, v.y + extent_y, v.z, v.w),
        Vec4::new(v.x + extent_x, v.y + extent_y, v.z, v.w),
        Vec4::new(v.x + extent_x, v.y - extent_y, v.z, v.w),
        Vec4::new(v.x - extent_x, v.y - extent_y, v.z, v.w),
    ];

    // The synthetic second and third vertices carry the sprite's projected
    // extent so interpolation has a consistent basis.
    triangle.v1 = triangle.v0;
    triangle.v2 = triangle.v0;
    let half_extent = iround(16.0 * 0.5 * point_size);
    triangle.v1.projected_x += half_extent;
    let y_sign = if data_ref.viewport_scale[1] > 0.0 { 1 } else { -1 };
    triangle.v2.projected_y -= half_extent * y_sign;

    clip_and_setup(setup, triangle, data, primitive, &corners)
}

fn clip_and_setup(
    setup: SetupRoutineFn,
    triangle: &Triangle,
    data: *const DrawData,
    primitive: &mut Primitive,
    corners: &[Vec4],
) -> bool {
    let mut and_flags = ClipFlags::all();
    let mut or_flags = ClipFlags::empty();
    for corner in corners {
        let flags = compute_clip_flags(*corner);
        and_flags &= flags;
        or_flags |= flags;
    }
    if and_flags != ClipFlags::FINITE {
        return false;
    }

    let vertices: Vec<[f32; 4]> = corners.iter().map(|v| [v.x, v.y, v.z, v.w]).collect();
    let mut polygon = Polygon::from_slice(&vertices);

    let crossed = or_flags & !ClipFlags::FINITE;
    if !crossed.is_empty() && !clipper::clip(&mut polygon, crossed) {
        return false;
    }

    unsafe { setup(primitive, triangle, &polygon, data) != 0 }
}

fn process_pixels(draw: &DrawCall, batch: &BatchData, scheduler: &Arc<Scheduler>) {
    if draw.pixel_entry == 0 {
        return;
    }
    let routine: PixelRoutineFn = unsafe { std::mem::transmute(draw.pixel_entry) };
    let prims = batch.primitives.as_ptr() as usize;
    let visible = batch.num_visible as i32;
    let data = draw.data.get() as usize;

    if draw.topology != vk::PrimitiveTopology::POINT_LIST {
        let group = WaitGroup::new(CLUSTER_COUNT);
        for cluster in 0..CLUSTER_COUNT {
            let group = group.clone();
            scheduler.spawn_pixel(move || {
                let routine = routine;
                unsafe {
                    routine(
                        prims as *const Primitive,
                        visible,
                        cluster as i32,
                        data as *const DrawData,
                    );
                }
                group.done();
            });
        }
        group.wait(scheduler);
    } else {
        // Points are small; running clusters inline avoids task contention.
        for cluster in 0..CLUSTER_COUNT {
            unsafe {
                routine(
                    prims as *const Primitive,
                    visible,
                    cluster as i32,
                    data as *const DrawData,
                );
            }
        }
    }
}
