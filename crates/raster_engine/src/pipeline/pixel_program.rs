//! Pixel routine generation
//!
//! Emitted ABI: `(primitives, visible_count, cluster, draw_data)`. For every
//! visible primitive the routine walks the 2×2 pixel quads of the bounding
//! box whose quad row modulo the cluster count matches `cluster`, evaluates
//! coverage against the edge equations, runs the depth and stencil tests,
//! executes the fragment shader one quad at a time (four pixels in SIMD
//! lanes, registers in structure-of-arrays form), blends, and writes the
//! surviving lanes to the bound attachments. Occlusion-passing samples are
//! accumulated into the cluster's counter.
//!
//! Multisample rasterization has no code path here; requesting it fails the
//! build, as does alpha-to-coverage at single sampling.

use crate::api::image::SampledImageDescriptor;
use crate::device::pixel_processor::PixelState;
use crate::device::primitive::{DrawData, Plane, Primitive, StencilData};
use crate::pipeline::constants::CLUSTER_COUNT;
use crate::pipeline::shader::{Builtin, Dst, OpCode, Operand, OutputSlot, ShaderModule, Src, XYZW};
use crate::pipeline::texel;
use crate::reactor::backend::{self, BuildError, BuildOptions};
use crate::reactor::ir::{CmpOp, FCmpOp, MemType, Type, Value};
use crate::reactor::{FunctionBuilder, Routine, Var};
use ash::vk;
use std::any::Any;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

const PRIMITIVE_SIZE: usize = size_of::<Primitive>();
const PLANE_SIZE: usize = size_of::<Plane>();
const DESCRIPTOR_SIZE: usize = size_of::<SampledImageDescriptor>();

/// A shader register in structure-of-arrays form: one `Float4` per component,
/// lanes are the four quad pixels.
type SoaReg = [Value; 4];

/// Loads a plane from the primitive and splats its coefficients
fn load_plane(b: &mut FunctionBuilder, prim: Value, offset: usize) -> (Value, Value, Value) {
    let pa = b.ptr_add_imm(prim, offset as i32);
    let a = b.load(MemType::F32, pa);
    let pb = b.ptr_add_imm(prim, (offset + 4) as i32);
    let bb = b.load(MemType::F32, pb);
    let pc = b.ptr_add_imm(prim, (offset + 8) as i32);
    let c = b.load(MemType::F32, pc);
    let a4 = b.splat(a);
    let b4 = b.splat(bb);
    let c4 = b.splat(c);
    (a4, b4, c4)
}

/// `a·px + b·py + c` over the quad
fn eval_plane(
    b: &mut FunctionBuilder,
    plane: (Value, Value, Value),
    px: Value,
    py: Value,
) -> Value {
    let ax = b.vfmul(plane.0, px);
    let by = b.vfmul(plane.1, py);
    let sum = b.vfadd(ax, by);
    b.vfadd(sum, plane.2)
}

/// Walks a straight-line shader with SoA registers
struct SoaWalker<'a> {
    shader: &'a ShaderModule,
    /// Interpolated varyings, per input register
    inputs: Vec<SoaReg>,
    data: Value,
    frag_coord: SoaReg,
    instance_vec: Value,
    /// Sampler routine entry per binding
    samplers: &'a [(u8, Arc<Routine>)],
}

impl SoaWalker<'_> {
    fn read_operand(&self, b: &mut FunctionBuilder, temps: &[SoaReg], operand: &Operand) -> SoaReg {
        let base: SoaReg = match operand.src {
            Src::Temp(r) => temps[r as usize],
            Src::Input(i) => self.inputs[i as usize],
            Src::Constant(c) => [
                b.const_splat(c[0]),
                b.const_splat(c[1]),
                b.const_splat(c[2]),
                b.const_splat(c[3]),
            ],
            Src::PushConstant(slot) => {
                let mut reg = [self.frag_coord[0]; 4];
                for (component, item) in reg.iter_mut().enumerate() {
                    let offset = offset_of!(DrawData, push_constants)
                        + usize::from(slot) * 16
                        + component * 4;
                    let p = b.ptr_add_imm(self.data, offset as i32);
                    let scalar = b.load(MemType::F32, p);
                    *item = b.splat(scalar);
                }
                reg
            }
            Src::Builtin(Builtin::FragCoord) => self.frag_coord,
            Src::Builtin(Builtin::InstanceIndex) => [self.instance_vec; 4],
        };
        if operand.swizzle == XYZW {
            base
        } else {
            [
                base[operand.swizzle[0] as usize],
                base[operand.swizzle[1] as usize],
                base[operand.swizzle[2] as usize],
                base[operand.swizzle[3] as usize],
            ]
        }
    }

    fn componentwise(
        b: &mut FunctionBuilder,
        x: SoaReg,
        y: SoaReg,
        mut op: impl FnMut(&mut FunctionBuilder, Value, Value) -> Value,
    ) -> SoaReg {
        [
            op(b, x[0], y[0]),
            op(b, x[1], y[1]),
            op(b, x[2], y[2]),
            op(b, x[3], y[3]),
        ]
    }

    fn dot(b: &mut FunctionBuilder, x: SoaReg, y: SoaReg, components: usize) -> SoaReg {
        let mut sum: Option<Value> = None;
        for c in 0..components {
            let product = b.vfmul(x[c], y[c]);
            sum = Some(match sum {
                None => product,
                Some(acc) => b.vfadd(acc, product),
            });
        }
        let sum = sum.unwrap();
        [sum; 4]
    }

    fn sample(
        &self,
        b: &mut FunctionBuilder,
        binding: u8,
        coord: SoaReg,
    ) -> Result<SoaReg, BuildError> {
        let routine = self
            .samplers
            .iter()
            .find(|(slot, _)| *slot == binding)
            .map(|(_, routine)| routine)
            .ok_or_else(|| {
                BuildError::InvalidState(format!("no sampler routine for binding {binding}"))
            })?;

        let coords_block = b.alloca(64);
        let out_block = b.alloca(64);
        for (component, value) in coord.iter().enumerate() {
            let p = b.ptr_add_imm(coords_block, (component * 16) as i32);
            b.store(MemType::F32x4, p, *value);
        }

        let descriptor = b.ptr_add_imm(
            self.data,
            (offset_of!(DrawData, image_descriptors) + usize::from(binding) * DESCRIPTOR_SIZE)
                as i32,
        );
        let entry = b.const_ptr(routine.entry(0));
        let null = b.const_ptr::<u8>(std::ptr::null());
        b.call_ptr(entry, &[descriptor, coords_block, out_block, null], Type::Void);

        let mut out = [coord[0]; 4];
        for (component, item) in out.iter_mut().enumerate() {
            let p = b.ptr_add_imm(out_block, (component * 16) as i32);
            *item = b.load(MemType::F32x4, p);
        }
        Ok(out)
    }

    fn run(
        &self,
        b: &mut FunctionBuilder,
        color_count: usize,
    ) -> Result<Vec<SoaReg>, BuildError> {
        let zero = b.const_splat(0.0);
        let zero_reg: SoaReg = [zero; 4];
        let mut temps = vec![zero_reg; self.shader.temp_count as usize];
        let mut colors = vec![zero_reg; color_count];

        for op in &self.shader.ops {
            let result: SoaReg = match op.op {
                OpCode::Mov => self.read_operand(b, &temps, &op.srcs[0]),
                OpCode::Add => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfadd(p, q))
                }
                OpCode::Sub => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfsub(p, q))
                }
                OpCode::Mul => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfmul(p, q))
                }
                OpCode::Div => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfdiv(p, q))
                }
                OpCode::Min => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfmin(p, q))
                }
                OpCode::Max => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::componentwise(b, x, y, |b, p, q| b.vfmax(p, q))
                }
                OpCode::Mad => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    let z = self.read_operand(b, &temps, &op.srcs[2]);
                    let product = Self::componentwise(b, x, y, |b, p, q| b.vfmul(p, q));
                    Self::componentwise(b, product, z, |b, p, q| b.vfadd(p, q))
                }
                OpCode::Sqrt => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    x.map(|v| b.vfsqrt(v))
                }
                OpCode::Rcp => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let one = b.const_splat(1.0);
                    x.map(|v| b.vfdiv(one, v))
                }
                OpCode::Rsq => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let one = b.const_splat(1.0);
                    x.map(|v| {
                        let root = b.vfsqrt(v);
                        b.vfdiv(one, root)
                    })
                }
                OpCode::Dot3 => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::dot(b, x, y, 3)
                }
                OpCode::Dot4 => {
                    let x = self.read_operand(b, &temps, &op.srcs[0]);
                    let y = self.read_operand(b, &temps, &op.srcs[1]);
                    Self::dot(b, x, y, 4)
                }
                OpCode::Sample { binding } => {
                    let coord = self.read_operand(b, &temps, &op.srcs[0]);
                    self.sample(b, binding, coord)?
                }
            };

            let slot: &mut SoaReg = match op.dst {
                Dst::Temp(r) => &mut temps[r as usize],
                Dst::Output(OutputSlot::Color(i)) => {
                    let index = i as usize;
                    if index >= colors.len() {
                        return Err(BuildError::InvalidState(format!(
                            "pixel shader writes unbound color output {index}"
                        )));
                    }
                    &mut colors[index]
                }
                Dst::Output(other) => {
                    return Err(BuildError::InvalidState(format!(
                        "pixel shader writes vertex output {other:?}"
                    )))
                }
            };
            for component in 0..4 {
                if op.mask & (1 << component) != 0 {
                    slot[component] = result[component];
                }
            }
        }

        Ok(colors)
    }
}

fn depth_compare_predicate(op: vk::CompareOp) -> Option<FCmpOp> {
    match op {
        vk::CompareOp::LESS => Some(FCmpOp::Lt),
        vk::CompareOp::LESS_OR_EQUAL => Some(FCmpOp::Le),
        vk::CompareOp::GREATER => Some(FCmpOp::Gt),
        vk::CompareOp::GREATER_OR_EQUAL => Some(FCmpOp::Ge),
        vk::CompareOp::EQUAL => Some(FCmpOp::Eq),
        vk::CompareOp::NOT_EQUAL => Some(FCmpOp::Ne),
        _ => None,
    }
}

/// Emits a per-lane AoS color gather from SoA shader output
fn lane_color(b: &mut FunctionBuilder, soa: &SoaReg, lane: u8) -> Value {
    let mut out = b.const_float4([0.0; 4]);
    for (component, vec) in soa.iter().enumerate() {
        let scalar = b.extract(*vec, lane);
        out = b.insert(out, scalar, component as u8);
    }
    out
}

/// Builds one blend factor as an AoS vec4
fn blend_factor(
    b: &mut FunctionBuilder,
    kind: u32,
    src: Value,
    dst: Value,
) -> Result<Value, BuildError> {
    let factor = vk::BlendFactor::from_raw(kind as i32);
    Ok(match factor {
        vk::BlendFactor::ZERO => b.const_float4([0.0; 4]),
        vk::BlendFactor::ONE => b.const_float4([1.0; 4]),
        vk::BlendFactor::SRC_COLOR => src,
        vk::BlendFactor::ONE_MINUS_SRC_COLOR => {
            let one = b.const_float4([1.0; 4]);
            b.vfsub(one, src)
        }
        vk::BlendFactor::DST_COLOR => dst,
        vk::BlendFactor::ONE_MINUS_DST_COLOR => {
            let one = b.const_float4([1.0; 4]);
            b.vfsub(one, dst)
        }
        vk::BlendFactor::SRC_ALPHA => {
            let alpha = b.extract(src, 3);
            b.splat(alpha)
        }
        vk::BlendFactor::ONE_MINUS_SRC_ALPHA => {
            let alpha = b.extract(src, 3);
            let alpha4 = b.splat(alpha);
            let one = b.const_float4([1.0; 4]);
            b.vfsub(one, alpha4)
        }
        vk::BlendFactor::DST_ALPHA => {
            let alpha = b.extract(dst, 3);
            b.splat(alpha)
        }
        vk::BlendFactor::ONE_MINUS_DST_ALPHA => {
            let alpha = b.extract(dst, 3);
            let alpha4 = b.splat(alpha);
            let one = b.const_float4([1.0; 4]);
            b.vfsub(one, alpha4)
        }
        other => {
            return Err(BuildError::Unsupported(format!(
                "blend factor {other:?}"
            )))
        }
    })
}

/// Applies the blend equation for one lane's AoS colors
fn blend_colors(
    b: &mut FunctionBuilder,
    key: &crate::device::pixel_processor::BlendKey,
    src: Value,
    dst: Value,
) -> Result<Value, BuildError> {
    let op = vk::BlendOp::from_raw(key.op as i32);
    let alpha_op = vk::BlendOp::from_raw(key.alpha_op as i32);

    let combine = |b: &mut FunctionBuilder,
                   op: vk::BlendOp,
                   src_factor: u32,
                   dst_factor: u32|
     -> Result<Value, BuildError> {
        Ok(match op {
            vk::BlendOp::MIN => b.vfmin(src, dst),
            vk::BlendOp::MAX => b.vfmax(src, dst),
            _ => {
                let sf = blend_factor(b, src_factor, src, dst)?;
                let df = blend_factor(b, dst_factor, src, dst)?;
                let s = b.vfmul(src, sf);
                let d = b.vfmul(dst, df);
                match op {
                    vk::BlendOp::ADD => b.vfadd(s, d),
                    vk::BlendOp::SUBTRACT => b.vfsub(s, d),
                    vk::BlendOp::REVERSE_SUBTRACT => b.vfsub(d, s),
                    other => {
                        return Err(BuildError::Unsupported(format!("blend op {other:?}")))
                    }
                }
            }
        })
    };

    let color = combine(b, op, key.src_factor, key.dst_factor)?;
    let alpha = combine(b, alpha_op, key.src_alpha_factor, key.dst_alpha_factor)?;
    let alpha_scalar = b.extract(alpha, 3);
    Ok(b.insert(color, alpha_scalar, 3))
}

/// Emits one stencil face's test-and-update for a single lane.
/// Returns the lane's pass condition.
#[allow(clippy::too_many_arguments)]
fn emit_stencil_lane(
    b: &mut FunctionBuilder,
    key: &crate::device::pixel_processor::StencilKey,
    stencil_ptr: Value,
    stencil: &StencilLane,
    covered: Value,
    depth_passed: Value,
) -> Value {
    let stored = b.load(MemType::U8, stencil_ptr);
    let masked_stored = b.and_(stored, stencil.compare_mask);
    let masked_ref = b.and_(stencil.reference, stencil.compare_mask);
    let compare = vk::CompareOp::from_raw(key.compare_op as i32);
    let pass = match compare {
        vk::CompareOp::NEVER => b.const_bool(false),
        vk::CompareOp::ALWAYS => b.const_bool(true),
        vk::CompareOp::LESS => b.icmp(CmpOp::Slt, masked_ref, masked_stored),
        vk::CompareOp::LESS_OR_EQUAL => b.icmp(CmpOp::Sle, masked_ref, masked_stored),
        vk::CompareOp::GREATER => b.icmp(CmpOp::Sgt, masked_ref, masked_stored),
        vk::CompareOp::GREATER_OR_EQUAL => b.icmp(CmpOp::Sge, masked_ref, masked_stored),
        vk::CompareOp::EQUAL => b.icmp(CmpOp::Eq, masked_ref, masked_stored),
        vk::CompareOp::NOT_EQUAL => b.icmp(CmpOp::Ne, masked_ref, masked_stored),
        _ => b.const_bool(true),
    };

    let apply = |b: &mut FunctionBuilder, op_raw: u32, stored: Value, reference: Value| -> Value {
        let op = vk::StencilOp::from_raw(op_raw as i32);
        match op {
            vk::StencilOp::KEEP => stored,
            vk::StencilOp::ZERO => b.const_int(0),
            vk::StencilOp::REPLACE => reference,
            vk::StencilOp::INVERT => {
                let ones = b.const_int(0xFF);
                b.xor_(stored, ones)
            }
            vk::StencilOp::INCREMENT_AND_CLAMP => {
                let one = b.const_int(1);
                let sum = b.add(stored, one);
                let cap = b.const_int(255);
                let over = b.icmp(CmpOp::Sgt, sum, cap);
                let out = b.var_init(sum);
                b.if_then(over, |b| b.set(&out, cap));
                b.get(&out)
            }
            vk::StencilOp::DECREMENT_AND_CLAMP => {
                let one = b.const_int(1);
                let diff = b.sub(stored, one);
                let floor = b.const_int(0);
                let under = b.icmp(CmpOp::Slt, diff, floor);
                let out = b.var_init(diff);
                b.if_then(under, |b| b.set(&out, floor));
                b.get(&out)
            }
            vk::StencilOp::INCREMENT_AND_WRAP => {
                let one = b.const_int(1);
                let sum = b.add(stored, one);
                let mask = b.const_int(0xFF);
                b.and_(sum, mask)
            }
            vk::StencilOp::DECREMENT_AND_WRAP => {
                let one = b.const_int(1);
                let diff = b.sub(stored, one);
                let mask = b.const_int(0xFF);
                b.and_(diff, mask)
            }
            _ => stored,
        }
    };

    // Select the update per outcome; only covered lanes write.
    let new_value = b.var_init(stored);
    let stencil_fail = b.not(pass);
    b.if_then(stencil_fail, |b| {
        let v = apply(b, key.fail_op, stored, stencil.reference);
        b.set(&new_value, v);
    });
    let depth_fail = b.not(depth_passed);
    let pass_and_depth_fail = b.and_(pass, depth_fail);
    b.if_then(pass_and_depth_fail, |b| {
        let v = apply(b, key.depth_fail_op, stored, stencil.reference);
        b.set(&new_value, v);
    });
    let full_pass = b.and_(pass, depth_passed);
    b.if_then(full_pass, |b| {
        let v = apply(b, key.pass_op, stored, stencil.reference);
        b.set(&new_value, v);
    });

    b.if_then(covered, |b| {
        let value = b.get(&new_value);
        let keep_bits = {
            let inv = b.const_int(0xFF);
            let not_mask = b.xor_(stencil.write_mask, inv);
            b.and_(stored, not_mask)
        };
        let write_bits = b.and_(value, stencil.write_mask);
        let merged = b.or_(keep_bits, write_bits);
        b.store(MemType::U8, stencil_ptr, merged);
    });

    b.and_(covered, pass)
}

struct StencilLane {
    reference: Value,
    compare_mask: Value,
    write_mask: Value,
}

/// Generates the pixel routine for one state key. `samplers` supplies the
/// resolved sampling sub-routines, which the produced routine captures.
pub fn generate(
    state: &PixelState,
    shader: &ShaderModule,
    samplers: &[(u8, Arc<Routine>)],
    options: &BuildOptions,
) -> Result<Arc<Routine>, BuildError> {
    if state.states.sample_count > 1 {
        return Err(BuildError::Unsupported(
            "multisample pixel processing".into(),
        ));
    }
    if state.states.alpha_to_coverage != 0 {
        return Err(BuildError::InvalidState(
            "alpha-to-coverage requires multisample rasterization".into(),
        ));
    }
    if shader.input_count > state.states.varying_count as u8 {
        return Err(BuildError::InvalidState(
            "pixel shader reads more varyings than the vertex stage provides".into(),
        ));
    }
    let depth_format = vk::Format::from_raw(state.states.depth_format);
    if state.states.depth_test != 0
        && !matches!(depth_format, vk::Format::D32_SFLOAT | vk::Format::D32_SFLOAT_S8_UINT)
    {
        return Err(BuildError::Unsupported(format!(
            "depth attachment format {depth_format:?}"
        )));
    }
    let stencil_format = vk::Format::from_raw(state.states.stencil_format);
    if state.states.stencil_enable != 0 && stencil_format != vk::Format::S8_UINT {
        return Err(BuildError::Unsupported(format!(
            "stencil attachment format {stencil_format:?}"
        )));
    }
    let depth_bpp: u32 = if depth_format == vk::Format::D32_SFLOAT_S8_UINT { 8 } else { 4 };

    let color_formats: Vec<(usize, vk::Format)> = state
        .states
        .color_format
        .iter()
        .enumerate()
        .filter_map(|(i, &raw)| {
            let format = vk::Format::from_raw(raw);
            (format != vk::Format::UNDEFINED).then_some((i, format))
        })
        .collect();
    for (_, format) in &color_formats {
        if texel::is_integer_format(*format) {
            return Err(BuildError::Unsupported(
                "integer color attachments".into(),
            ));
        }
        texel::bytes_per_texel(*format)?;
    }
    let color_count = color_formats.iter().map(|(i, _)| i + 1).max().unwrap_or(0);

    let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Int, Type::Int, Type::Ptr], Type::Void);
    let prims = b.param(0);
    let count = b.param(1);
    let cluster = b.param(2);
    let data = b.param(3);

    // Attachment pointers and pitches.
    let depth_base = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, depth_buffer) as i32);
        b.load_ptr(p)
    };
    let depth_pitch = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, depth_pitch_b) as i32);
        b.load(MemType::I32, p)
    };
    let stencil_base = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, stencil_buffer) as i32);
        b.load_ptr(p)
    };
    let stencil_pitch = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, stencil_pitch_b) as i32);
        b.load(MemType::I32, p)
    };
    let mut color_bases = Vec::new();
    let mut color_pitches = Vec::new();
    for (index, _) in &color_formats {
        let p = b.ptr_add_imm(
            data,
            (offset_of!(DrawData, color_buffer) + index * 8) as i32,
        );
        color_bases.push(b.load_ptr(p));
        let p = b.ptr_add_imm(
            data,
            (offset_of!(DrawData, color_pitch_b) + index * 4) as i32,
        );
        color_pitches.push(b.load(MemType::I32, p));
    }

    let instance_raw = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, instance_id) as i32);
        b.load(MemType::I32, p)
    };
    let instance_f = b.itof(instance_raw);
    let instance_vec = b.splat(instance_f);

    let stencil_front = StencilLane {
        reference: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_front) + offset_of!(StencilData, reference)) as i32,
            );
            b.load(MemType::I32, p)
        },
        compare_mask: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_front) + offset_of!(StencilData, compare_mask))
                    as i32,
            );
            b.load(MemType::I32, p)
        },
        write_mask: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_front) + offset_of!(StencilData, write_mask)) as i32,
            );
            b.load(MemType::I32, p)
        },
    };
    let stencil_back = StencilLane {
        reference: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_back) + offset_of!(StencilData, reference)) as i32,
            );
            b.load(MemType::I32, p)
        },
        compare_mask: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_back) + offset_of!(StencilData, compare_mask))
                    as i32,
            );
            b.load(MemType::I32, p)
        },
        write_mask: {
            let p = b.ptr_add_imm(
                data,
                (offset_of!(DrawData, stencil_back) + offset_of!(StencilData, write_mask)) as i32,
            );
            b.load(MemType::I32, p)
        },
    };

    let mut emit_error: Option<BuildError> = None;

    let zero_i = b.const_int(0);
    b.for_range(zero_i, count, 1, |b, p_index| {
        let prim = b.ptr_index(prims, p_index, PRIMITIVE_SIZE as u32);

        let min_x = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, min_x) as i32);
            b.load(MemType::I32, p)
        };
        let max_x = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, max_x) as i32);
            b.load(MemType::I32, p)
        };
        let min_y = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, min_y) as i32);
            b.load(MemType::I32, p)
        };
        let max_y = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, max_y) as i32);
            b.load(MemType::I32, p)
        };
        let edge_count = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, edge_count) as i32);
            b.load(MemType::I32, p)
        };
        let facing = {
            let p = b.ptr_add_imm(prim, offset_of!(Primitive, facing) as i32);
            b.load(MemType::I32, p)
        };

        let w_plane = load_plane(b, prim, offset_of!(Primitive, w_plane));
        let z_plane = load_plane(b, prim, offset_of!(Primitive, z_plane));

        let occlusion_count = {
            let zero = b.const_int(0);
            b.var_init(zero)
        };

        // First quad row of this cluster's stripe.
        let one = b.const_int(1);
        let base_qy = b.ashr(min_y, one);
        let lane_mask = b.const_int(CLUSTER_COUNT as i32 - 1);
        let rem = b.and_(base_qy, lane_mask);
        let delta = {
            let d = b.sub(cluster, rem);
            b.and_(d, lane_mask)
        };
        let first_qy = b.add(base_qy, delta);
        let last_qy = {
            let top = b.sub(max_y, one);
            b.ashr(top, one)
        };

        let qy = b.var_init(first_qy);
        b.while_loop(
            |b| {
                let current = b.get(&qy);
                b.icmp(CmpOp::Sle, current, last_qy)
            },
            |b| {
                let current_qy = b.get(&qy);
                let y = b.shl(current_qy, one);

                let x_start = {
                    let mask = b.const_int(!1);
                    b.and_(min_x, mask)
                };
                let x = b.var_init(x_start);
                b.while_loop(
                    |b| {
                        let current = b.get(&x);
                        b.icmp(CmpOp::Slt, current, max_x)
                    },
                    |b| {
                        let current_x = b.get(&x);
                        if let Err(e) = emit_quad(
                            b,
                            state,
                            shader,
                            &QuadContext {
                                data,
                                x: current_x,
                                y,
                                min_x,
                                max_x,
                                min_y,
                                max_y,
                                edge_count,
                                facing,
                                prim,
                                w_plane,
                                z_plane,
                                depth_base,
                                depth_pitch,
                                depth_bpp,
                                stencil_base,
                                stencil_pitch,
                                color_formats: &color_formats,
                                color_bases: &color_bases,
                                color_pitches: &color_pitches,
                                color_count,
                                instance_vec,
                                stencil_front: &stencil_front,
                                stencil_back: &stencil_back,
                                occlusion_count: &occlusion_count,
                                samplers,
                            },
                        ) {
                            if emit_error.is_none() {
                                emit_error = Some(e);
                            }
                        }
                        let two = b.const_int(2);
                        let next = b.add(current_x, two);
                        b.set(&x, next);
                    },
                );

                let step = b.const_int(CLUSTER_COUNT as i32);
                let next = b.add(current_qy, step);
                b.set(&qy, next);
            },
        );

        if state.occlusion_enabled() {
            let counter_ptr = {
                let base = b.ptr_add_imm(data, offset_of!(DrawData, occlusion) as i32);
                b.ptr_index(base, cluster, 4)
            };
            let current = b.load(MemType::I32, counter_ptr);
            let add = b.get(&occlusion_count);
            let sum = b.add(current, add);
            b.store(MemType::I32, counter_ptr, sum);
        }
    });

    if let Some(e) = emit_error {
        return Err(e);
    }

    b.ret(None);
    let func = b.finish();

    let captures: Vec<Arc<dyn Any + Send + Sync>> = samplers
        .iter()
        .map(|(_, routine)| Arc::clone(routine) as Arc<dyn Any + Send + Sync>)
        .collect();
    backend::build_with_captures(&func, "pixel_routine", options, captures)
}

struct QuadContext<'a> {
    data: Value,
    x: Value,
    y: Value,
    min_x: Value,
    max_x: Value,
    min_y: Value,
    max_y: Value,
    edge_count: Value,
    facing: Value,
    prim: Value,
    w_plane: (Value, Value, Value),
    z_plane: (Value, Value, Value),
    depth_base: Value,
    depth_pitch: Value,
    depth_bpp: u32,
    stencil_base: Value,
    stencil_pitch: Value,
    color_formats: &'a [(usize, vk::Format)],
    color_bases: &'a [Value],
    color_pitches: &'a [Value],
    color_count: usize,
    instance_vec: Value,
    stencil_front: &'a StencilLane,
    stencil_back: &'a StencilLane,
    occlusion_count: &'a Var,
    samplers: &'a [(u8, Arc<Routine>)],
}

fn emit_quad(
    b: &mut FunctionBuilder,
    state: &PixelState,
    shader: &ShaderModule,
    ctx: &QuadContext<'_>,
) -> Result<(), BuildError> {
    // Pixel centers of the quad.
    let xf = b.itof(ctx.x);
    let x4 = b.splat(xf);
    let x_off = b.const_float4([0.5, 1.5, 0.5, 1.5]);
    let px = b.vfadd(x4, x_off);
    let yf = b.itof(ctx.y);
    let y4 = b.splat(yf);
    let y_off = b.const_float4([0.5, 0.5, 1.5, 1.5]);
    let py = b.vfadd(y4, y_off);

    // Integer lane coordinates for bounds and addressing.
    let xi = {
        let base = b.splat(ctx.x);
        let off = b.const_int4([0, 1, 0, 1]);
        b.vadd(base, off)
    };
    let yi = {
        let base = b.splat(ctx.y);
        let off = b.const_int4([0, 0, 1, 1]);
        b.vadd(base, off)
    };

    // Coverage: inside the bounding box...
    let mask = {
        let max_x4 = b.splat(ctx.max_x);
        let in_x_hi = b.vcmp_gt(max_x4, xi);
        let min_x4 = b.splat(ctx.min_x);
        let one4 = b.const_int4([1; 4]);
        let min_m1 = b.vsub(min_x4, one4);
        let in_x_lo = b.vcmp_gt(xi, min_m1);
        let max_y4 = b.splat(ctx.max_y);
        let in_y_hi = b.vcmp_gt(max_y4, yi);
        let min_y4 = b.splat(ctx.min_y);
        let min_m1 = b.vsub(min_y4, one4);
        let in_y_lo = b.vcmp_gt(yi, min_m1);
        let a = b.vand(in_x_hi, in_x_lo);
        let c = b.vand(in_y_hi, in_y_lo);
        b.vand(a, c)
    };
    let mask_var = b.var_init(mask);

    // ...and on the inside of every edge.
    let zero_i = b.const_int(0);
    b.for_range(zero_i, ctx.edge_count, 1, |b, e| {
        let edge_base = b.ptr_add_imm(ctx.prim, offset_of!(Primitive, edges) as i32);
        let edge_ptr = b.ptr_index(edge_base, e, PLANE_SIZE as u32);
        let a = b.load(MemType::F32, edge_ptr);
        let pb = b.ptr_add_imm(edge_ptr, 4);
        let bb = b.load(MemType::F32, pb);
        let pc = b.ptr_add_imm(edge_ptr, 8);
        let c = b.load(MemType::F32, pc);
        let a4 = b.splat(a);
        let b4 = b.splat(bb);
        let c4 = b.splat(c);
        let value = eval_plane(b, (a4, b4, c4), px, py);
        let zero4 = b.const_float4([0.0; 4]);
        let inside = b.vfcmp(FCmpOp::Ge, value, zero4);
        let current = b.get(&mask_var);
        let merged = b.vand(current, inside);
        b.set(&mask_var, merged);
    });

    let covered = {
        let m = b.get(&mask_var);
        b.any_lane(m)
    };

    let mut error = None;
    b.if_then(covered, |b| {
        if let Err(e) = emit_covered_quad(b, state, shader, ctx, &mask_var, px, py, xi, yi) {
            error = Some(e);
        }
    });
    match error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Clamped per-lane address within the primitive's bounds
fn lane_address(
    b: &mut FunctionBuilder,
    base: Value,
    pitch: Value,
    bpp: u32,
    xi: Value,
    yi: Value,
    lane: u8,
    max_x: Value,
    max_y: Value,
) -> Value {
    let one = b.const_int(1);
    let x = b.extract(xi, lane);
    let x_cap = b.sub(max_x, one);
    let x = {
        let over = b.icmp(CmpOp::Sgt, x, x_cap);
        let out = b.var_init(x);
        b.if_then(over, |b| b.set(&out, x_cap));
        b.get(&out)
    };
    let y = b.extract(yi, lane);
    let y_cap = b.sub(max_y, one);
    let y = {
        let over = b.icmp(CmpOp::Sgt, y, y_cap);
        let out = b.var_init(y);
        b.if_then(over, |b| b.set(&out, y_cap));
        b.get(&out)
    };
    let row = b.mul(y, pitch);
    let bpp_v = b.const_int(bpp as i32);
    let col = b.mul(x, bpp_v);
    let offset = b.add(row, col);
    b.ptr_add(base, offset)
}

#[allow(clippy::too_many_arguments)]
fn emit_covered_quad(
    b: &mut FunctionBuilder,
    state: &PixelState,
    shader: &ShaderModule,
    ctx: &QuadContext<'_>,
    mask_var: &Var,
    px: Value,
    py: Value,
    xi: Value,
    yi: Value,
) -> Result<(), BuildError> {
    let rhw = eval_plane(b, ctx.w_plane, px, py);
    let z = eval_plane(b, ctx.z_plane, px, py);

    // Depth test.
    if state.states.depth_test != 0 {
        let compare = vk::CompareOp::from_raw(state.states.depth_compare as i32);
        match compare {
            vk::CompareOp::NEVER => {
                let zero4 = b.const_int4([0; 4]);
                b.set(mask_var, zero4);
            }
            vk::CompareOp::ALWAYS => {}
            _ => {
                let predicate = depth_compare_predicate(compare).unwrap();
                let mut dst = b.const_float4([0.0; 4]);
                for lane in 0..4u8 {
                    let addr = lane_address(
                        b,
                        ctx.depth_base,
                        ctx.depth_pitch,
                        ctx.depth_bpp,
                        xi,
                        yi,
                        lane,
                        ctx.max_x,
                        ctx.max_y,
                    );
                    let value = b.load(MemType::F32, addr);
                    dst = b.insert(dst, value, lane);
                }
                let pass = b.vfcmp(predicate, z, dst);
                let current = b.get(mask_var);
                let merged = b.vand(current, pass);
                b.set(mask_var, merged);
            }
        }
    }

    // Stencil test and update, per lane, facing-selected.
    if state.stencil_active() {
        let front = {
            let zero = b.const_int(0);
            b.icmp(CmpOp::Ne, ctx.facing, zero)
        };
        let mask = b.get(mask_var);
        let mut new_mask = b.const_int4([0; 4]);
        for lane in 0..4u8 {
            let lane_bit = b.extract(mask, lane);
            let covered = b.int_to_bool(lane_bit);
            let addr = lane_address(
                b,
                ctx.stencil_base,
                ctx.stencil_pitch,
                1,
                xi,
                yi,
                lane,
                ctx.max_x,
                ctx.max_y,
            );
            // Depth already folded into the mask; the stencil update's
            // depth-fail path uses the pre-stencil coverage as its depth
            // verdict.
            let passed_out = b.var(Type::Bool);
            b.if_then_else(
                front,
                |b| {
                    let passed = emit_stencil_lane(
                        b,
                        &state.states.front_stencil,
                        addr,
                        ctx.stencil_front,
                        covered,
                        covered,
                    );
                    b.set(&passed_out, passed);
                },
                |b| {
                    let passed = emit_stencil_lane(
                        b,
                        &state.states.back_stencil,
                        addr,
                        ctx.stencil_back,
                        covered,
                        covered,
                    );
                    b.set(&passed_out, passed);
                },
            );
            let passed = b.get(&passed_out);
            let as_int = {
                let zero = b.const_int(0);
                let all = b.const_int(-1);
                let out = b.var_init(zero);
                b.if_then(passed, |b| b.set(&out, all));
                b.get(&out)
            };
            new_mask = b.insert(new_mask, as_int, lane);
        }
        b.set(mask_var, new_mask);
    }

    // Occlusion: count surviving samples.
    if state.occlusion_enabled() {
        let mask = b.get(mask_var);
        let bits = b.movmask(mask);
        let mut total = {
            let one_bit = b.const_int(1);
            b.and_(bits, one_bit)
        };
        for shift in 1..4 {
            let s = b.const_int(shift);
            let shifted = b.lshr(bits, s);
            let one_bit = b.const_int(1);
            let bit = b.and_(shifted, one_bit);
            total = b.add(total, bit);
        }
        let current = b.get(ctx.occlusion_count);
        let sum = b.add(current, total);
        b.set(ctx.occlusion_count, sum);
    }

    // Depth write for surviving lanes.
    if state.states.depth_write != 0 {
        let mask = b.get(mask_var);
        for lane in 0..4u8 {
            let lane_bit = b.extract(mask, lane);
            let write = b.int_to_bool(lane_bit);
            let addr = lane_address(
                b,
                ctx.depth_base,
                ctx.depth_pitch,
                ctx.depth_bpp,
                xi,
                yi,
                lane,
                ctx.max_x,
                ctx.max_y,
            );
            let value = b.extract(z, lane);
            b.if_then(write, |b| {
                b.store(MemType::F32, addr, value);
            });
        }
    }

    if ctx.color_count == 0 {
        return Ok(());
    }

    // Interpolated varyings for the shader, perspective corrected.
    let one4 = b.const_float4([1.0; 4]);
    let w = b.vfdiv(one4, rhw);
    let mut inputs = Vec::new();
    for varying in 0..shader.input_count as usize {
        let mut reg = [px; 4];
        for component in 0..4 {
            let offset = offset_of!(Primitive, varying_planes)
                + (varying * 4 + component) * PLANE_SIZE;
            let plane = load_plane(b, ctx.prim, offset);
            let premultiplied = eval_plane(b, plane, px, py);
            reg[component] = b.vfmul(premultiplied, w);
        }
        inputs.push(reg);
    }

    let frag_coord: SoaReg = [px, py, z, rhw];
    let walker = SoaWalker {
        shader,
        inputs,
        data: ctx.data,
        frag_coord,
        instance_vec: ctx.instance_vec,
        samplers: ctx.samplers,
    };
    let colors = walker.run(b, ctx.color_count)?;

    // Blend and store per attachment, per surviving lane.
    let mask = b.get(mask_var);
    for (slot, (attachment, format)) in ctx.color_formats.iter().enumerate() {
        let key = &state.states.blend[*attachment];
        let bpp = texel::bytes_per_texel(*format)?;
        let soa = &colors[*attachment];

        for lane in 0..4u8 {
            let lane_bit = b.extract(mask, lane);
            let write = b.int_to_bool(lane_bit);
            let mut error = None;
            b.if_then(write, |b| {
                let addr = lane_address(
                    b,
                    ctx.color_bases[slot],
                    ctx.color_pitches[slot],
                    bpp,
                    xi,
                    yi,
                    lane,
                    ctx.max_x,
                    ctx.max_y,
                );
                let src = lane_color(b, soa, lane);

                let needs_dst = key.enable != 0 || key.write_mask != 0xF;
                let result = if needs_dst {
                    let dst = match texel::decode(b, *format, addr) {
                        Ok(v) => v,
                        Err(e) => {
                            error = Some(e);
                            return;
                        }
                    };
                    let blended = if key.enable != 0 {
                        match blend_colors(b, key, src, dst) {
                            Ok(v) => v,
                            Err(e) => {
                                error = Some(e);
                                return;
                            }
                        }
                    } else {
                        src
                    };
                    if key.write_mask != 0xF {
                        let lanes = [
                            if key.write_mask & 1 != 0 { -1 } else { 0 },
                            if key.write_mask & 2 != 0 { -1 } else { 0 },
                            if key.write_mask & 4 != 0 { -1 } else { 0 },
                            if key.write_mask & 8 != 0 { -1 } else { 0 },
                        ];
                        let select = b.const_int4(lanes);
                        b.blend(select, blended, dst)
                    } else {
                        blended
                    }
                } else {
                    src
                };

                if let Err(e) = texel::encode(b, *format, addr, result) {
                    error = Some(e);
                }
            });
            if let Some(e) = error {
                return Err(e);
            }
        }
    }

    Ok(())
}
