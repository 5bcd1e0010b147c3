//! Vertex routine generation
//!
//! Emitted ABI: `(out_vertices, indices, task, draw_data)`. For each index
//! the routine consults the batch's direct-mapped vertex cache, and on a miss
//! fetches the bound attributes, executes the vertex shader, computes clip
//! flags and fixed-point projected coordinates, and fills the cache slot. The
//! cache is keyed on the final (base-vertex-adjusted) index the host wrote
//! into the batch index list.
//!
//! Shader registers hold one vertex with its components in SIMD lanes, so
//! every shader op maps to a single lane-wise vector op.

use crate::device::primitive::{
    ClipFlags, DrawData, TransformedVertex, VertexCache, VertexInputStream, VertexTask,
};
use crate::device::vertex_processor::VertexState;
use crate::pipeline::constants::VERTEX_CACHE_SIZE;
use crate::pipeline::shader::{
    Builtin, Dst, OpCode, Operand, OutputSlot, ShaderModule, ShaderOp, Src, XYZW,
};
use crate::pipeline::texel;
use crate::reactor::backend::{self, BuildError, BuildOptions};
use crate::reactor::ir::{CmpOp, FCmpOp, MemType, Type, Value};
use crate::reactor::{FunctionBuilder, Routine};
use ash::vk;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

const VERTEX_SIZE: usize = size_of::<TransformedVertex>();

/// Results of one shader invocation
pub(crate) struct VertexOutputs {
    pub position: Value,
    pub point_size: Value,
    pub varyings: Vec<Value>,
}

/// Walks a straight-line shader with vec4 registers held as `Float4` values.
/// `sample` is invoked for `Sample` ops; stages that cannot sample pass a
/// closure returning an error.
pub(crate) struct ShaderWalker<'a> {
    pub shader: &'a ShaderModule,
    pub inputs: Vec<Value>,
    pub push_constants: Value,
    pub instance_index: Option<Value>,
    pub frag_coord: Option<Value>,
}

impl ShaderWalker<'_> {
    fn read_operand(&self, b: &mut FunctionBuilder, temps: &[Value], operand: &Operand) -> Value {
        let value = match operand.src {
            Src::Temp(r) => temps[r as usize],
            Src::Input(i) => self.inputs[i as usize],
            Src::Constant(c) => b.const_float4(c),
            Src::PushConstant(slot) => {
                let p = b.ptr_add_imm(self.push_constants, i32::from(slot) * 16);
                b.load(MemType::F32x4, p)
            }
            Src::Builtin(Builtin::InstanceIndex) => self
                .instance_index
                .expect("instance index is not available in this stage"),
            Src::Builtin(Builtin::FragCoord) => self
                .frag_coord
                .expect("fragment coordinates are not available in this stage"),
        };
        if operand.swizzle == XYZW {
            value
        } else {
            b.shuffle(value, operand.swizzle)
        }
    }

    fn apply_mask(b: &mut FunctionBuilder, mask: u8, new: Value, old: Value) -> Value {
        if mask == 0b1111 {
            return new;
        }
        let lanes = [
            if mask & 1 != 0 { -1 } else { 0 },
            if mask & 2 != 0 { -1 } else { 0 },
            if mask & 4 != 0 { -1 } else { 0 },
            if mask & 8 != 0 { -1 } else { 0 },
        ];
        let select = b.const_int4(lanes);
        b.blend(select, new, old)
    }

    fn horizontal_sum(b: &mut FunctionBuilder, v: Value) -> Value {
        let rotated = b.shuffle(v, [2, 3, 0, 1]);
        let pairs = b.vfadd(v, rotated);
        let swapped = b.shuffle(pairs, [1, 0, 3, 2]);
        b.vfadd(pairs, swapped)
    }

    /// Executes the op list. `sample` resolves `Sample` ops to a value.
    pub fn run(
        &self,
        b: &mut FunctionBuilder,
        mut sample: impl FnMut(&mut FunctionBuilder, u8, Value) -> Result<Value, BuildError>,
    ) -> Result<VertexOutputs, BuildError> {
        let zero4 = b.const_float4([0.0; 4]);
        let mut temps = vec![zero4; self.shader.temp_count as usize];
        let mut position = b.const_float4([0.0, 0.0, 0.0, 1.0]);
        let one = b.const_float4([1.0; 4]);
        let mut point_size = one;
        let mut varyings = vec![zero4; self.shader.varying_count as usize];

        for op in &self.shader.ops {
            let result = self.evaluate(b, &temps, op, &mut sample)?;
            let slot: &mut Value = match op.dst {
                Dst::Temp(r) => &mut temps[r as usize],
                Dst::Output(OutputSlot::Position) => &mut position,
                Dst::Output(OutputSlot::PointSize) => &mut point_size,
                Dst::Output(OutputSlot::Varying(v)) => &mut varyings[v as usize],
                Dst::Output(OutputSlot::Color(_)) => {
                    return Err(BuildError::InvalidState(
                        "vertex shader writes a color output".into(),
                    ))
                }
            };
            *slot = Self::apply_mask(b, op.mask, result, *slot);
        }

        Ok(VertexOutputs {
            position,
            point_size,
            varyings,
        })
    }

    fn evaluate(
        &self,
        b: &mut FunctionBuilder,
        temps: &[Value],
        op: &ShaderOp,
        sample: &mut impl FnMut(&mut FunctionBuilder, u8, Value) -> Result<Value, BuildError>,
    ) -> Result<Value, BuildError> {
        let src = |b: &mut FunctionBuilder, i: usize| self.read_operand(b, temps, &op.srcs[i]);
        Ok(match op.op {
            OpCode::Mov => src(b, 0),
            OpCode::Add => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfadd(a, c)
            }
            OpCode::Sub => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfsub(a, c)
            }
            OpCode::Mul => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfmul(a, c)
            }
            OpCode::Div => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfdiv(a, c)
            }
            OpCode::Min => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfmin(a, c)
            }
            OpCode::Max => {
                let a = src(b, 0);
                let c = src(b, 1);
                b.vfmax(a, c)
            }
            OpCode::Mad => {
                let a = src(b, 0);
                let c = src(b, 1);
                let d = src(b, 2);
                let product = b.vfmul(a, c);
                b.vfadd(product, d)
            }
            OpCode::Sqrt => {
                let a = src(b, 0);
                b.vfsqrt(a)
            }
            OpCode::Rcp => {
                let a = src(b, 0);
                let one = b.const_float4([1.0; 4]);
                b.vfdiv(one, a)
            }
            OpCode::Rsq => {
                let a = src(b, 0);
                let root = b.vfsqrt(a);
                let one = b.const_float4([1.0; 4]);
                b.vfdiv(one, root)
            }
            OpCode::Dot3 => {
                let a = src(b, 0);
                let c = src(b, 1);
                let product = b.vfmul(a, c);
                let zero = b.const_float(0.0);
                let trimmed = b.insert(product, zero, 3);
                Self::horizontal_sum(b, trimmed)
            }
            OpCode::Dot4 => {
                let a = src(b, 0);
                let c = src(b, 1);
                let product = b.vfmul(a, c);
                Self::horizontal_sum(b, product)
            }
            OpCode::Sample { binding } => {
                let coord = src(b, 0);
                sample(b, binding, coord)?
            }
        })
    }
}

/// Emits scalar clip-flag computation for a clip-space position
fn emit_clip_flags(b: &mut FunctionBuilder, position: Value) -> Value {
    let x = b.extract(position, 0);
    let y = b.extract(position, 1);
    let z = b.extract(position, 2);
    let w = b.extract(position, 3);
    let neg_w = b.fneg(w);
    let zero_f = b.const_float(0.0);

    let zero = b.const_int(0);
    let flags = b.var_init(zero);
    let set_flag = |b: &mut FunctionBuilder, cond: Value, bit: ClipFlags| {
        b.if_then(cond, |b| {
            let current = b.get(&flags);
            let bit = b.const_int(bit.bits() as i32);
            let updated = b.or_(current, bit);
            b.set(&flags, updated);
        });
    };

    let max_x = b.fcmp(FCmpOp::Gt, x, w);
    set_flag(b, max_x, ClipFlags::MAX_X);
    let max_y = b.fcmp(FCmpOp::Gt, y, w);
    set_flag(b, max_y, ClipFlags::MAX_Y);
    let max_z = b.fcmp(FCmpOp::Gt, z, w);
    set_flag(b, max_z, ClipFlags::MAX_Z);
    let min_x = b.fcmp(FCmpOp::Lt, x, neg_w);
    set_flag(b, min_x, ClipFlags::MIN_X);
    let min_y = b.fcmp(FCmpOp::Lt, y, neg_w);
    set_flag(b, min_y, ClipFlags::MIN_Y);
    let min_z = b.fcmp(FCmpOp::Lt, z, zero_f);
    set_flag(b, min_z, ClipFlags::MIN_Z);

    // Finite check per component: |v| compared against infinity is false for
    // NaN and infinities alike under ordered comparison.
    let infinity = b.const_float(f32::INFINITY);
    let mut finite = b.const_bool(true);
    for component in [x, y, z, w] {
        let magnitude = b.fabs(component);
        let ok = b.fcmp(FCmpOp::Lt, magnitude, infinity);
        finite = b.and_(finite, ok);
    }
    set_flag(b, finite, ClipFlags::FINITE);

    b.get(&flags)
}

/// Generates the vertex routine for one state key
pub fn generate(
    state: &VertexState,
    shader: &ShaderModule,
    options: &BuildOptions,
) -> Result<Arc<Routine>, BuildError> {
    if state.states.shader_id != shader.identifier() {
        return Err(BuildError::InvalidState(
            "vertex state does not describe the supplied shader".into(),
        ));
    }
    if shader.samples_images() {
        return Err(BuildError::Unsupported(
            "image sampling in vertex shaders".into(),
        ));
    }
    if shader
        .ops
        .iter()
        .any(|op| matches!(op.dst, Dst::Output(OutputSlot::Color(_))))
    {
        return Err(BuildError::InvalidState(
            "vertex shader writes a color output".into(),
        ));
    }

    let mut b = FunctionBuilder::new(&[Type::Ptr; 4], Type::Void);
    let out_base = b.param(0);
    let indices = b.param(1);
    let task = b.param(2);
    let data = b.param(3);

    let vertex_count = {
        let p = b.ptr_add_imm(task, offset_of!(VertexTask, vertex_count) as i32);
        b.load(MemType::I32, p)
    };
    let tags_base = b.ptr_add_imm(
        task,
        (offset_of!(VertexTask, vertex_cache) + offset_of!(VertexCache, tags)) as i32,
    );
    let cache_base = b.ptr_add_imm(
        task,
        (offset_of!(VertexTask, vertex_cache) + offset_of!(VertexCache, vertices)) as i32,
    );

    let push_constants = b.ptr_add_imm(data, offset_of!(DrawData, push_constants) as i32);
    let instance_raw = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, instance_id) as i32);
        b.load(MemType::I32, p)
    };
    let instance_f = b.itof(instance_raw);
    let instance_vec = b.splat(instance_f);

    let viewport_scale_x = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_scale) as i32);
        b.load(MemType::F32, p)
    };
    let viewport_scale_y = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_scale) as i32 + 4);
        b.load(MemType::F32, p)
    };
    let viewport_offset_x = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_offset) as i32);
        b.load(MemType::F32, p)
    };
    let viewport_offset_y = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_offset) as i32 + 4);
        b.load(MemType::F32, p)
    };

    let zero = b.const_int(0);
    b.for_range(zero, vertex_count, 1, |b, i| {
        let index_ptr = b.ptr_index(indices, i, 4);
        let index = b.load(MemType::I32, index_ptr);
        let out_ptr = b.ptr_index(out_base, i, VERTEX_SIZE as u32);

        let slot_mask = b.const_int(VERTEX_CACHE_SIZE as i32 - 1);
        let slot = b.and_(index, slot_mask);
        let tag_ptr = b.ptr_index(tags_base, slot, 4);
        let cached_tag = b.load(MemType::I32, tag_ptr);
        let record_ptr = b.ptr_index(cache_base, slot, VERTEX_SIZE as u32);

        let miss = b.icmp(CmpOp::Ne, cached_tag, index);
        b.if_then(miss, |b| {
            // Fetch attributes.
            let mut inputs = Vec::new();
            for stream in 0..shader.input_count as usize {
                let format = vk::Format::from_raw(state.states.input_format[stream]);
                let stream_base = offset_of!(DrawData, input)
                    + stream * size_of::<VertexInputStream>();
                if format == vk::Format::UNDEFINED {
                    inputs.push(b.const_float4([0.0, 0.0, 0.0, 1.0]));
                    continue;
                }

                let buffer = {
                    let p = b.ptr_add_imm(
                        data,
                        (stream_base + offset_of!(VertexInputStream, buffer)) as i32,
                    );
                    b.load_ptr(p)
                };
                let stride = {
                    let p = b.ptr_add_imm(
                        data,
                        (stream_base + offset_of!(VertexInputStream, stride)) as i32,
                    );
                    b.load(MemType::I32, p)
                };

                let fetch_index = if state.states.robust_buffer_access != 0 {
                    let count = {
                        let p = b.ptr_add_imm(
                            data,
                            (stream_base + offset_of!(VertexInputStream, count)) as i32,
                        );
                        b.load(MemType::I32, p)
                    };
                    let one = b.const_int(1);
                    let last = b.sub(count, one);
                    let clamped = b.var_init(index);
                    let over = b.icmp(CmpOp::Sgt, index, last);
                    b.if_then(over, |b| b.set(&clamped, last));
                    let zero = b.const_int(0);
                    let current = b.get(&clamped);
                    let under = b.icmp(CmpOp::Slt, current, zero);
                    b.if_then(under, |b| b.set(&clamped, zero));
                    b.get(&clamped)
                } else {
                    index
                };

                let byte_offset = b.mul(fetch_index, stride);
                let element = b.ptr_add(buffer, byte_offset);
                let value = match texel::decode(b, format, element) {
                    Ok(v) => v,
                    Err(_) => b.const_float4([0.0, 0.0, 0.0, 1.0]),
                };
                inputs.push(value);
            }

            let walker = ShaderWalker {
                shader,
                inputs,
                push_constants,
                instance_index: Some(instance_vec),
                frag_coord: None,
            };
            let outputs = walker
                .run(b, |_, _, _| {
                    Err(BuildError::Unsupported(
                        "image sampling in vertex shaders".into(),
                    ))
                })
                .expect("vertex walker cannot fail after validation");

            // Fill the cache record.
            let pos_ptr =
                b.ptr_add_imm(record_ptr, offset_of!(TransformedVertex, position) as i32);
            b.store(MemType::F32x4, pos_ptr, outputs.position);

            let flags = emit_clip_flags(b, outputs.position);
            let flags_ptr =
                b.ptr_add_imm(record_ptr, offset_of!(TransformedVertex, clip_flags) as i32);
            b.store(MemType::I32, flags_ptr, flags);

            let point_size = b.extract(outputs.point_size, 0);
            let size_ptr =
                b.ptr_add_imm(record_ptr, offset_of!(TransformedVertex, point_size) as i32);
            b.store(MemType::F32, size_ptr, point_size);

            // Projected window coordinates in 12.4 fixed point, guarded
            // against w = 0.
            let x = b.extract(outputs.position, 0);
            let y = b.extract(outputs.position, 1);
            let w = b.extract(outputs.position, 3);
            let zero_f = b.const_float(0.0);
            let sixteen = b.const_float(16.0);
            let px = b.var_init(zero);
            let py = b.var_init(zero);
            let w_ok = b.fcmp(FCmpOp::Ne, w, zero_f);
            b.if_then(w_ok, |b| {
                let one = b.const_float(1.0);
                let inv_w = b.fdiv(one, w);
                let ndc_x = b.fmul(x, inv_w);
                let ndc_y = b.fmul(y, inv_w);
                let wx = b.fmul(ndc_x, viewport_scale_x);
                let wx = b.fadd(wx, viewport_offset_x);
                let wy = b.fmul(ndc_y, viewport_scale_y);
                let wy = b.fadd(wy, viewport_offset_y);
                let fx = b.fmul(wx, sixteen);
                let fy = b.fmul(wy, sixteen);
                let ix = b.ftoi(fx);
                let iy = b.ftoi(fy);
                b.set(&px, ix);
                b.set(&py, iy);
            });
            let px_val = b.get(&px);
            let px_ptr =
                b.ptr_add_imm(record_ptr, offset_of!(TransformedVertex, projected_x) as i32);
            b.store(MemType::I32, px_ptr, px_val);
            let py_val = b.get(&py);
            let py_ptr =
                b.ptr_add_imm(record_ptr, offset_of!(TransformedVertex, projected_y) as i32);
            b.store(MemType::I32, py_ptr, py_val);

            for (v, value) in outputs.varyings.iter().enumerate() {
                let offset = offset_of!(TransformedVertex, varyings) + v * 16;
                let p = b.ptr_add_imm(record_ptr, offset as i32);
                b.store(MemType::F32x4, p, *value);
            }

            b.store(MemType::I32, tag_ptr, index);
        });

        // Copy the (now valid) cache record to the output slot.
        debug_assert_eq!(VERTEX_SIZE % 16, 0);
        for chunk in 0..VERTEX_SIZE / 16 {
            let src = b.ptr_add_imm(record_ptr, (chunk * 16) as i32);
            let v = b.load(MemType::F32x4, src);
            let dst = b.ptr_add_imm(out_ptr, (chunk * 16) as i32);
            b.store(MemType::F32x4, dst, v);
        }
    });

    b.ret(None);
    let func = b.finish();
    backend::build(&func, "vertex_routine", options)
}
