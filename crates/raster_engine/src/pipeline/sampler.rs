//! Sampler routine generation
//!
//! Distills an image view plus sampler state plus a sampling method into a
//! [`SamplerState`] key, and emits the routine that computes a texel read or
//! write. The filter/mipmap/addressing selection rules follow the Vulkan
//! semantics: gather forces a point-filtered 2×2 footprint, fetch is point
//! filtered with border robustness, anisotropic filtering only applies to 2D
//! views without an explicit LOD, cube faces use seamless addressing on the
//! first two coordinates and treat the third as a face index.
//!
//! Read ABI: `(descriptor, coords, rgba_out, constants)` where coords and
//! rgba are 4-lane structure-of-arrays blocks (u[4] v[4] w[4] q[4]). Writes
//! take an additional per-lane execution mask.

use crate::api::descriptor::SamplerDesc;
use crate::api::image::{ImageViewIdentifier, SampledImageDescriptor};
use crate::foundation::math::canonical_bits;
use crate::pipeline::texel;
use crate::reactor::backend::{self, BuildError, BuildOptions};
use crate::reactor::ir::{CmpOp, FCmpOp, MemType, Type, Value};
use crate::reactor::{FunctionBuilder, Routine};
use ash::vk;
use std::mem::offset_of;
use std::sync::Arc;

/// How the shader invokes the sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerMethod {
    /// Sample with an implicitly computed level of detail
    Implicit,
    /// Sample with an explicit level of detail
    Lod,
    /// Texel fetch with integer coordinates
    Fetch,
    /// 2×2 four-texel gather of one component
    Gather,
    /// Storage-image style texel write
    Write,
    /// Level-of-detail query
    Query,
}

/// Resolved texture filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Nearest for both minification and magnification
    Point,
    /// Linear minification, nearest magnification
    MinLinearMagPoint,
    /// Nearest minification, linear magnification
    MinPointMagLinear,
    /// Linear for both
    Linear,
    /// Anisotropic (filters as linear; the anisotropy ceiling is not walked)
    Anisotropic,
    /// Four-texel gather footprint
    Gather,
}

/// Resolved mip filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MipmapType {
    /// Single-level sampling, no level selection
    None,
    /// Nearest level
    Point,
    /// Interpolate between adjacent levels
    Linear,
}

/// Resolved addressing mode per coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressingMode {
    /// Repeat
    Wrap,
    /// Mirrored repeat
    Mirror,
    /// Mirror once then clamp
    MirrorOnce,
    /// Clamp to edge
    Clamp,
    /// Clamp to border color
    Border,
    /// Cube-face seamless (resolved to per-face clamp)
    Seamless,
    /// Coordinate selects the cube face
    CubeFace,
    /// Coordinate is ignored by this view dimensionality
    Unused,
}

/// Resolved border color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorderKind {
    /// (0, 0, 0, 0)
    TransparentBlack,
    /// (0, 0, 0, 1)
    OpaqueBlack,
    /// (1, 1, 1, 1)
    OpaqueWhite,
}

/// Out-of-bounds texel policy, selected per call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutOfBoundsBehavior {
    /// No checks; the caller guarantees coordinates are in range
    Undefined,
    /// Out-of-range reads return zero, writes are discarded
    Nullify,
    /// Coordinates clamp into the allocation
    RobustBufferAccess,
}

/// The sampling call site's identity, part of the routine cache key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageInstruction {
    /// Sampling method
    pub method: SamplerMethod,
    /// Out-of-bounds policy
    pub out_of_bounds: OutOfBoundsBehavior,
    /// Component index returned by gather
    pub gather_component: u8,
}

/// Packed sampler state: every bit that affects the generated routine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerState {
    /// Texel format (raw `vk::Format`)
    pub format: i32,
    /// View dimensionality (raw `vk::ImageViewType`)
    pub view_type: i32,
    /// Resolved filter
    pub filter: FilterType,
    /// Resolved mip filter
    pub mipmap: MipmapType,
    /// Addressing per coordinate
    pub address: [AddressingMode; 3],
    /// Border color for border addressing
    pub border: BorderKind,
    /// Depth-compare sampling enabled
    pub compare_enable: bool,
    /// Depth-compare operator (raw `vk::CompareOp`)
    pub compare_op: i32,
    /// Canonicalized LOD clamp bounds and bias
    pub min_lod_bits: u32,
    /// See `min_lod_bits`
    pub max_lod_bits: u32,
    /// See `min_lod_bits`
    pub lod_bias_bits: u32,
}

/// Ports the filter selection table
pub fn convert_filter_mode(
    sampler: &SamplerDesc,
    view_type: vk::ImageViewType,
    method: SamplerMethod,
) -> FilterType {
    if method == SamplerMethod::Gather {
        return FilterType::Gather;
    }
    if method == SamplerMethod::Fetch {
        return FilterType::Point;
    }
    if sampler.anisotropy_enable
        && matches!(
            view_type,
            vk::ImageViewType::TYPE_2D | vk::ImageViewType::TYPE_2D_ARRAY
        )
        && method != SamplerMethod::Lod
    {
        return FilterType::Anisotropic;
    }
    match (sampler.mag_filter, sampler.min_filter) {
        (vk::Filter::NEAREST, vk::Filter::NEAREST) => FilterType::Point,
        (vk::Filter::NEAREST, vk::Filter::LINEAR) => FilterType::MinLinearMagPoint,
        (vk::Filter::LINEAR, vk::Filter::NEAREST) => FilterType::MinPointMagLinear,
        (vk::Filter::LINEAR, vk::Filter::LINEAR) => FilterType::Linear,
        (mag, min) => panic!("unsupported filter pair {mag:?}/{min:?}"),
    }
}

/// Ports the mip-mode selection: no sampler means point (fetch takes an
/// integer level operand), non-identity YCbCr elides mip selection entirely.
pub fn convert_mipmap_mode(sampler: Option<&SamplerDesc>) -> MipmapType {
    let Some(sampler) = sampler else {
        return MipmapType::Point;
    };
    if !sampler.ycbcr_rgb_identity {
        return MipmapType::None;
    }
    match sampler.mipmap_mode {
        vk::SamplerMipmapMode::NEAREST => MipmapType::Point,
        vk::SamplerMipmapMode::LINEAR => MipmapType::Linear,
        other => panic!("unsupported mipmap mode {other:?}"),
    }
}

/// Ports the addressing-mode selection per coordinate index
pub fn convert_addressing_mode(
    coordinate_index: usize,
    sampler: Option<&SamplerDesc>,
    view_type: vk::ImageViewType,
) -> AddressingMode {
    match view_type {
        vk::ImageViewType::TYPE_1D | vk::ImageViewType::TYPE_1D_ARRAY => {
            if coordinate_index >= 1 {
                return AddressingMode::Unused;
            }
        }
        vk::ImageViewType::TYPE_2D | vk::ImageViewType::TYPE_2D_ARRAY => {
            if coordinate_index == 2 {
                return AddressingMode::Unused;
            }
        }
        vk::ImageViewType::TYPE_3D => {}
        vk::ImageViewType::CUBE | vk::ImageViewType::CUBE_ARRAY => {
            // Cube faces are addressed as 2D images; the wrap modes of the
            // sampler do not apply to them.
            return if coordinate_index <= 1 {
                AddressingMode::Seamless
            } else {
                AddressingMode::CubeFace
            };
        }
        other => panic!("unsupported image view type {other:?}"),
    }

    let Some(sampler) = sampler else {
        // Fetch without a sampler still needs addressing that prevents
        // out-of-bounds reads; border replacement handles that.
        return AddressingMode::Border;
    };

    let mode = match coordinate_index {
        0 => sampler.address_mode_u,
        1 => sampler.address_mode_v,
        _ => sampler.address_mode_w,
    };
    match mode {
        vk::SamplerAddressMode::REPEAT => AddressingMode::Wrap,
        vk::SamplerAddressMode::MIRRORED_REPEAT => AddressingMode::Mirror,
        vk::SamplerAddressMode::CLAMP_TO_EDGE => AddressingMode::Clamp,
        vk::SamplerAddressMode::CLAMP_TO_BORDER => AddressingMode::Border,
        vk::SamplerAddressMode::MIRROR_CLAMP_TO_EDGE => AddressingMode::MirrorOnce,
        other => panic!("unsupported address mode {other:?}"),
    }
}

fn convert_border(color: vk::BorderColor) -> BorderKind {
    match color {
        vk::BorderColor::FLOAT_TRANSPARENT_BLACK | vk::BorderColor::INT_TRANSPARENT_BLACK => {
            BorderKind::TransparentBlack
        }
        vk::BorderColor::FLOAT_OPAQUE_BLACK | vk::BorderColor::INT_OPAQUE_BLACK => {
            BorderKind::OpaqueBlack
        }
        vk::BorderColor::FLOAT_OPAQUE_WHITE | vk::BorderColor::INT_OPAQUE_WHITE => {
            BorderKind::OpaqueWhite
        }
        other => panic!("unsupported border color {other:?}"),
    }
}

/// Distills the code-affecting sampler state for one call site
pub fn update_sampler_state(
    instruction: ImageInstruction,
    view: ImageViewIdentifier,
    sampler: Option<&SamplerDesc>,
) -> SamplerState {
    let mut state = SamplerState {
        format: view.format.as_raw(),
        view_type: view.view_type.as_raw(),
        filter: FilterType::Point,
        mipmap: convert_mipmap_mode(sampler),
        address: [
            convert_addressing_mode(0, sampler, view.view_type),
            convert_addressing_mode(1, sampler, view.view_type),
            convert_addressing_mode(2, sampler, view.view_type),
        ],
        border: BorderKind::TransparentBlack,
        compare_enable: false,
        compare_op: vk::CompareOp::ALWAYS.as_raw(),
        min_lod_bits: 0,
        max_lod_bits: 0,
        lod_bias_bits: 0,
    };

    if let Some(sampler) = sampler {
        state.filter = convert_filter_mode(sampler, view.view_type, instruction.method);
        state.border = convert_border(sampler.border_color);
        state.compare_enable = sampler.compare_enable;
        state.compare_op = sampler.compare_op.as_raw();
        state.min_lod_bits = canonical_bits(sampler.min_lod);
        state.max_lod_bits = canonical_bits(sampler.max_lod);
        state.lod_bias_bits = canonical_bits(sampler.mip_lod_bias);

        // With a single mip level and a filter that does not split on the
        // level of detail, the LOD computation is dead; pin it to zero.
        let filter_splits = matches!(
            state.filter,
            FilterType::MinLinearMagPoint | FilterType::MinPointMagLinear
        );
        if view.single_mip_level && !filter_splits && instruction.method != SamplerMethod::Query {
            state.min_lod_bits = 0;
            state.max_lod_bits = 0;
        }
    } else {
        if instruction.method == SamplerMethod::Fetch && view.single_mip_level {
            state.min_lod_bits = 0;
            state.max_lod_bits = 0;
        }
        state.border = BorderKind::TransparentBlack;
    }

    state
}

/// Dimensionality facts derived from the view type
struct ViewShape {
    dims: usize,
    arrayed: bool,
}

fn view_shape(view_type: i32) -> Result<ViewShape, BuildError> {
    let vt = vk::ImageViewType::from_raw(view_type);
    Ok(match vt {
        vk::ImageViewType::TYPE_1D => ViewShape { dims: 1, arrayed: false },
        vk::ImageViewType::TYPE_1D_ARRAY => ViewShape { dims: 1, arrayed: true },
        vk::ImageViewType::TYPE_2D => ViewShape { dims: 2, arrayed: false },
        vk::ImageViewType::TYPE_2D_ARRAY => ViewShape { dims: 2, arrayed: true },
        vk::ImageViewType::TYPE_3D => ViewShape { dims: 3, arrayed: false },
        other => {
            return Err(BuildError::Unsupported(format!(
                "sampling from {other:?} views"
            )))
        }
    })
}

/// Loads and pins the descriptor fields the routine needs
struct DescriptorValues {
    base: Value,
    width: Value,
    height: Value,
    depth: Value,
    mip_levels: Value,
    array_layers: Value,
    layer_pitch: Value,
    desc: Value,
}

impl DescriptorValues {
    fn load(b: &mut FunctionBuilder, desc: Value) -> Self {
        let field = |b: &mut FunctionBuilder, offset: usize| {
            let p = b.ptr_add_imm(desc, offset as i32);
            b.load(MemType::I32, p)
        };
        let base_p = b.ptr_add_imm(desc, offset_of!(SampledImageDescriptor, base) as i32);
        let base = b.load_ptr(base_p);
        Self {
            base,
            width: field(b, offset_of!(SampledImageDescriptor, width)),
            height: field(b, offset_of!(SampledImageDescriptor, height)),
            depth: field(b, offset_of!(SampledImageDescriptor, depth)),
            mip_levels: field(b, offset_of!(SampledImageDescriptor, mip_levels)),
            array_layers: field(b, offset_of!(SampledImageDescriptor, array_layers)),
            layer_pitch: field(b, offset_of!(SampledImageDescriptor, layer_pitch)),
            desc,
        }
    }

    /// Loads a per-level i32 from one of the descriptor arrays
    fn level_field(
        &self,
        b: &mut FunctionBuilder,
        array_offset: usize,
        level: Value,
    ) -> Value {
        let base = b.ptr_add_imm(self.desc, array_offset as i32);
        let p = b.ptr_index(base, level, 4);
        b.load(MemType::I32, p)
    }
}

fn imax(b: &mut FunctionBuilder, a: Value, bound: i32) -> Value {
    let out = b.var_init(a);
    let bound = b.const_int(bound);
    let below = b.icmp(CmpOp::Slt, a, bound);
    b.if_then(below, |b| b.set(&out, bound));
    b.get(&out)
}

fn iclamp_dynamic(b: &mut FunctionBuilder, v: Value, lo: Value, hi: Value) -> Value {
    let out = b.var_init(v);
    let below = b.icmp(CmpOp::Slt, v, lo);
    b.if_then(below, |b| b.set(&out, lo));
    let cur = b.get(&out);
    let above = b.icmp(CmpOp::Sgt, cur, hi);
    b.if_then(above, |b| b.set(&out, hi));
    b.get(&out)
}

/// floor(x) as an Int, correct for negative inputs
fn ifloor(b: &mut FunctionBuilder, x: Value) -> Value {
    let t = b.ftoi(x);
    let back = b.itof(t);
    let out = b.var_init(t);
    let overshot = b.fcmp(FCmpOp::Gt, back, x);
    b.if_then(overshot, |b| {
        let one = b.const_int(1);
        let adjusted = b.sub(t, one);
        b.set(&out, adjusted);
    });
    b.get(&out)
}

/// Piecewise-linear log2 approximation: exponent plus mantissa fraction
fn log2_approx(b: &mut FunctionBuilder, x: Value) -> Value {
    let bits = b.bitcast(Type::Int, x);
    let shift = b.const_int(23);
    let biased = b.lshr(bits, shift);
    let mask = b.const_int(0xFF);
    let biased = b.and_(biased, mask);
    let bias = b.const_int(127);
    let exponent = b.sub(biased, bias);
    let exponent_f = b.itof(exponent);

    let mant_mask = b.const_int(0x007F_FFFF);
    let mant_bits = b.and_(bits, mant_mask);
    let one_exp = b.const_int(0x3F80_0000);
    let mant_one_bits = b.or_(mant_bits, one_exp);
    let mantissa = b.bitcast(Type::Float, mant_one_bits);
    let one = b.const_float(1.0);
    let fraction = b.fsub(mantissa, one);

    b.fadd(exponent_f, fraction)
}

/// Border constant for the state's border kind and format class
fn border_color(b: &mut FunctionBuilder, state: &SamplerState) -> Value {
    let integer = texel::is_integer_format(vk::Format::from_raw(state.format));
    match (state.border, integer) {
        (BorderKind::TransparentBlack, false) => b.const_float4([0.0, 0.0, 0.0, 0.0]),
        (BorderKind::OpaqueBlack, false) => b.const_float4([0.0, 0.0, 0.0, 1.0]),
        (BorderKind::OpaqueWhite, false) => b.const_float4([1.0, 1.0, 1.0, 1.0]),
        (BorderKind::TransparentBlack, true) => b.const_int4([0, 0, 0, 0]),
        (BorderKind::OpaqueBlack, true) => b.const_int4([0, 0, 0, 1]),
        (BorderKind::OpaqueWhite, true) => b.const_int4([1, 1, 1, 1]),
    }
}

struct SamplerEmitter<'a> {
    state: &'a SamplerState,
    instruction: ImageInstruction,
    shape: ViewShape,
    format: vk::Format,
}

impl<'a> SamplerEmitter<'a> {
    /// Applies mirroring address modes in normalized-coordinate space,
    /// reducing them to clamp addressing on the texel index.
    fn prewrap_coord(&self, b: &mut FunctionBuilder, mode: AddressingMode, u: Value) -> Value {
        match mode {
            AddressingMode::Mirror => {
                // Period-2 triangle wave into [0, 1].
                let half = b.const_float(0.5);
                let scaled = b.fmul(u, half);
                let fl = ifloor(b, scaled);
                let fl = b.itof(fl);
                let two = b.const_float(2.0);
                let base = b.fmul(fl, two);
                let m = b.fsub(u, base); // in [0, 2)
                let one = b.const_float(1.0);
                let centered = b.fsub(m, one);
                let bits = b.bitcast(Type::Int, centered);
                let abs_mask = b.const_int(i32::MAX);
                let abs_bits = b.and_(bits, abs_mask);
                let magnitude = b.bitcast(Type::Float, abs_bits);
                b.fsub(one, magnitude)
            }
            AddressingMode::MirrorOnce => {
                let bits = b.bitcast(Type::Int, u);
                let abs_mask = b.const_int(i32::MAX);
                let abs_bits = b.and_(bits, abs_mask);
                let magnitude = b.bitcast(Type::Float, abs_bits);
                let one = b.const_float(1.0);
                b.fmin(magnitude, one)
            }
            _ => u,
        }
    }

    /// Maps a texel index into range per the address mode.
    /// Returns the index and an out-of-bounds flag (border mode only).
    fn address_index(
        &self,
        b: &mut FunctionBuilder,
        mode: AddressingMode,
        index: Value,
        size: Value,
    ) -> (Value, Value) {
        let zero = b.const_int(0);
        let one = b.const_int(1);
        let max_index = b.sub(size, one);
        match mode {
            AddressingMode::Wrap => {
                let index_f = b.itof(index);
                let size_f = b.itof(size);
                let ratio = b.fdiv(index_f, size_f);
                let whole = ifloor(b, ratio);
                let whole_scaled = b.mul(whole, size);
                let wrapped = b.sub(index, whole_scaled);
                let wrapped = iclamp_dynamic(b, wrapped, zero, max_index);
                let in_bounds = b.const_bool(false);
                (wrapped, in_bounds)
            }
            AddressingMode::Border => {
                let low = b.icmp(CmpOp::Slt, index, zero);
                let high = b.icmp(CmpOp::Sgt, index, max_index);
                let oob = b.or_(low, high);
                let clamped = iclamp_dynamic(b, index, zero, max_index);
                (clamped, oob)
            }
            // Mirror modes were folded into [0,1] beforehand; everything
            // else clamps to the edge.
            _ => {
                let clamped = iclamp_dynamic(b, index, zero, max_index);
                let oob = b.const_bool(false);
                (clamped, oob)
            }
        }
    }

    /// Loads and decodes the texel at integer coordinates, applying border
    /// or nullify replacement when `oob` is set.
    fn fetch_texel(
        &self,
        b: &mut FunctionBuilder,
        d: &DescriptorValues,
        level: Value,
        ix: Value,
        iy: Value,
        iz: Value,
        layer: Value,
        oob: Value,
    ) -> Result<Value, BuildError> {
        let bpp = texel::bytes_per_texel(self.format)?;
        let row_pitch =
            d.level_field(b, offset_of!(SampledImageDescriptor, row_pitch), level);
        let slice_pitch =
            d.level_field(b, offset_of!(SampledImageDescriptor, slice_pitch), level);
        let level_offset =
            d.level_field(b, offset_of!(SampledImageDescriptor, level_offset), level);

        let x_bytes = b.const_int(bpp as i32);
        let x_off = b.mul(ix, x_bytes);
        let y_off = b.mul(iy, row_pitch);
        let z_off = b.mul(iz, slice_pitch);
        let l_off = b.mul(layer, d.layer_pitch);
        let offset = b.add(level_offset, x_off);
        let offset = b.add(offset, y_off);
        let offset = b.add(offset, z_off);
        let offset = b.add(offset, l_off);
        let ptr = b.ptr_add(d.base, offset);

        let color = texel::decode(b, self.format, ptr)?;
        let ty = b.type_of(color);
        let result = b.var_init(color);
        let replacement = match self.instruction.out_of_bounds {
            OutOfBoundsBehavior::Nullify => {
                if ty == Type::Float4 {
                    b.const_float4([0.0; 4])
                } else {
                    b.const_int4([0; 4])
                }
            }
            _ => border_color(b, self.state),
        };
        b.if_then(oob, |b| b.set(&result, replacement));
        Ok(b.get(&result))
    }

    /// One nearest-filter tap at normalized coordinates
    #[allow(clippy::too_many_arguments)]
    fn point_tap(
        &self,
        b: &mut FunctionBuilder,
        d: &DescriptorValues,
        level: Value,
        sizes: &[Value; 3],
        coords: &[Value; 3],
        layer: Value,
    ) -> Result<Value, BuildError> {
        let mut indices = [None; 3];
        let mut oob = b.const_bool(false);
        for dim in 0..self.shape.dims {
            let mode = self.state.address[dim];
            let u = self.prewrap_coord(b, mode, coords[dim]);
            let size_f = b.itof(sizes[dim]);
            let scaled = b.fmul(u, size_f);
            let index = ifloor(b, scaled);
            let (index, dim_oob) = self.address_index(b, mode, index, sizes[dim]);
            oob = b.or_(oob, dim_oob);
            indices[dim] = Some(index);
        }
        let zero = b.const_int(0);
        let ix = indices[0].unwrap_or(zero);
        let iy = indices[1].unwrap_or(zero);
        let iz = indices[2].unwrap_or(zero);
        self.fetch_texel(b, d, level, ix, iy, iz, layer, oob)
    }

    /// Linear filtering: 2^dims taps blended by the sub-texel fractions
    #[allow(clippy::too_many_arguments)]
    fn linear_tap(
        &self,
        b: &mut FunctionBuilder,
        d: &DescriptorValues,
        level: Value,
        sizes: &[Value; 3],
        coords: &[Value; 3],
        layer: Value,
    ) -> Result<Value, BuildError> {
        let mut base_index = [None; 3];
        let mut fraction = [None; 3];
        for dim in 0..self.shape.dims {
            let mode = self.state.address[dim];
            let u = self.prewrap_coord(b, mode, coords[dim]);
            let size_f = b.itof(sizes[dim]);
            let scaled = b.fmul(u, size_f);
            let half = b.const_float(0.5);
            let centered = b.fsub(scaled, half);
            let i0 = ifloor(b, centered);
            let i0_f = b.itof(i0);
            let frac = b.fsub(centered, i0_f);
            base_index[dim] = Some(i0);
            fraction[dim] = Some(frac);
        }

        let taps = 1usize << self.shape.dims;
        let mut blended: Option<Value> = None;
        for tap in 0..taps {
            let mut indices = [None; 3];
            let mut oob = b.const_bool(false);
            for dim in 0..self.shape.dims {
                let step = (tap >> dim) & 1;
                let base = base_index[dim].unwrap();
                let index = if step == 1 {
                    let one = b.const_int(1);
                    b.add(base, one)
                } else {
                    base
                };
                let (index, dim_oob) =
                    self.address_index(b, self.state.address[dim], index, sizes[dim]);
                oob = b.or_(oob, dim_oob);
                indices[dim] = Some(index);
            }
            let zero = b.const_int(0);
            let ix = indices[0].unwrap_or(zero);
            let iy = indices[1].unwrap_or(zero);
            let iz = indices[2].unwrap_or(zero);
            let color = self.fetch_texel(b, d, level, ix, iy, iz, layer, oob)?;

            // Per-tap weight: product over dims of frac or (1 - frac).
            let one = b.const_float(1.0);
            let mut weight: Option<Value> = None;
            for dim in 0..self.shape.dims {
                let frac = fraction[dim].unwrap();
                let w = if (tap >> dim) & 1 == 1 {
                    frac
                } else {
                    b.fsub(one, frac)
                };
                weight = Some(match weight {
                    None => w,
                    Some(acc) => b.fmul(acc, w),
                });
            }
            let weight = weight.unwrap();
            let weight4 = b.splat(weight);
            let contribution = b.vfmul(color, weight4);
            blended = Some(match blended {
                None => contribution,
                Some(acc) => b.vfadd(acc, contribution),
            });
        }
        Ok(blended.unwrap())
    }

    /// Gather: the four point taps of the 2×2 linear footprint, returning
    /// one component per output lane in (i0j1, i1j1, i1j0, i0j0) order.
    fn gather_taps(
        &self,
        b: &mut FunctionBuilder,
        d: &DescriptorValues,
        level: Value,
        sizes: &[Value; 3],
        coords: &[Value; 3],
        layer: Value,
    ) -> Result<Value, BuildError> {
        let mut base_index = [None; 2];
        for dim in 0..2 {
            let mode = self.state.address[dim];
            let u = self.prewrap_coord(b, mode, coords[dim]);
            let size_f = b.itof(sizes[dim]);
            let scaled = b.fmul(u, size_f);
            let half = b.const_float(0.5);
            let centered = b.fsub(scaled, half);
            base_index[dim] = Some(ifloor(b, centered));
        }

        let component = self.instruction.gather_component;
        let mut out = if texel::is_integer_format(self.format) {
            b.const_int4([0; 4])
        } else {
            b.const_float4([0.0; 4])
        };
        let order = [(0, 1), (1, 1), (1, 0), (0, 0)];
        for (lane, (dx, dy)) in order.into_iter().enumerate() {
            let mut oob = b.const_bool(false);
            let mut idx = [None; 2];
            for (dim, step) in [(0usize, dx), (1usize, dy)] {
                let base = base_index[dim].unwrap();
                let index = if step == 1 {
                    let one = b.const_int(1);
                    b.add(base, one)
                } else {
                    base
                };
                let (index, dim_oob) =
                    self.address_index(b, self.state.address[dim], index, sizes[dim]);
                oob = b.or_(oob, dim_oob);
                idx[dim] = Some(index);
            }
            let zero = b.const_int(0);
            let color = self.fetch_texel(
                b,
                d,
                level,
                idx[0].unwrap(),
                idx[1].unwrap(),
                zero,
                layer,
                oob,
            )?;
            let picked = b.extract(color, component);
            out = b.insert(out, picked, lane as u8);
        }
        Ok(out)
    }

    /// Filtered color at one level for one lane's coordinates
    #[allow(clippy::too_many_arguments)]
    fn sample_level(
        &self,
        b: &mut FunctionBuilder,
        d: &DescriptorValues,
        level: Value,
        coords: &[Value; 3],
        layer: Value,
        lod: Value,
    ) -> Result<Value, BuildError> {
        // Level extents: extent >> level with a floor of one texel.
        let mut sizes = [None; 3];
        let extents = [d.width, d.height, d.depth];
        for dim in 0..3 {
            let shifted = b.ashr(extents[dim], level);
            sizes[dim] = Some(imax(b, shifted, 1));
        }
        let sizes = [sizes[0].unwrap(), sizes[1].unwrap(), sizes[2].unwrap()];

        match self.state.filter {
            FilterType::Point => self.point_tap(b, d, level, &sizes, coords, layer),
            FilterType::Linear | FilterType::Anisotropic => {
                self.linear_tap(b, d, level, &sizes, coords, layer)
            }
            FilterType::Gather => self.gather_taps(b, d, level, &sizes, coords, layer),
            FilterType::MinLinearMagPoint | FilterType::MinPointMagLinear => {
                let minifying = {
                    let zero = b.const_float(0.0);
                    b.fcmp(FCmpOp::Gt, lod, zero)
                };
                let min_linear = self.state.filter == FilterType::MinLinearMagPoint;
                let out = b.var(Type::Float4);
                let state = self;
                let mut min_error = None;
                let mut mag_error = None;
                b.if_then_else(
                    minifying,
                    |b| {
                        let r = if min_linear {
                            state.linear_tap(b, d, level, &sizes, coords, layer)
                        } else {
                            state.point_tap(b, d, level, &sizes, coords, layer)
                        };
                        match r {
                            Ok(v) => b.set(&out, v),
                            Err(e) => min_error = Some(e),
                        }
                    },
                    |b| {
                        let r = if min_linear {
                            state.point_tap(b, d, level, &sizes, coords, layer)
                        } else {
                            state.linear_tap(b, d, level, &sizes, coords, layer)
                        };
                        match r {
                            Ok(v) => b.set(&out, v),
                            Err(e) => mag_error = Some(e),
                        }
                    },
                );
                if let Some(e) = min_error.or(mag_error) {
                    return Err(e);
                }
                Ok(b.get(&out))
            }
        }
    }
}

/// Emits a sampling routine for the given call site and state
pub fn emit_sampler_routine(
    instruction: ImageInstruction,
    state: &SamplerState,
    options: &BuildOptions,
) -> Result<Arc<Routine>, BuildError> {
    if instruction.method == SamplerMethod::Write {
        return emit_write_routine(instruction, state, options);
    }
    if instruction.method == SamplerMethod::Query {
        return Err(BuildError::Unsupported(
            "level-of-detail query sampling".into(),
        ));
    }
    let format = vk::Format::from_raw(state.format);
    let integer = texel::is_integer_format(format);
    if integer
        && !matches!(state.filter, FilterType::Point | FilterType::Gather)
    {
        return Err(BuildError::InvalidState(format!(
            "filter {:?} on integer format {format:?}",
            state.filter
        )));
    }
    if integer && state.mipmap == MipmapType::Linear {
        return Err(BuildError::InvalidState(format!(
            "linear mip filtering on integer format {format:?}"
        )));
    }

    let shape = view_shape(state.view_type)?;
    let emitter = SamplerEmitter {
        state,
        instruction,
        shape,
        format,
    };

    let mut b = FunctionBuilder::new(&[Type::Ptr; 4], Type::Void);
    let desc_ptr = b.param(0);
    let coords_ptr = b.param(1);
    let out_ptr = b.param(2);
    let d = DescriptorValues::load(&mut b, desc_ptr);

    let u_vec = b.load(MemType::F32x4, coords_ptr);
    let v_ptr = b.ptr_add_imm(coords_ptr, 16);
    let v_vec = b.load(MemType::F32x4, v_ptr);
    let w_ptr = b.ptr_add_imm(coords_ptr, 32);
    let w_vec = b.load(MemType::F32x4, w_ptr);
    let q_ptr = b.ptr_add_imm(coords_ptr, 48);
    let q_vec = b.load(MemType::F32x4, q_ptr);

    // Level of detail is a per-quad quantity.
    let min_lod = b.const_float(f32::from_bits(state.min_lod_bits));
    let max_lod = b.const_float(f32::from_bits(state.max_lod_bits));
    let lod = match instruction.method {
        SamplerMethod::Lod => {
            let explicit = b.extract(q_vec, 0);
            let bias = b.const_float(f32::from_bits(state.lod_bias_bits));
            let biased = b.fadd(explicit, bias);
            let lo = b.fmax(biased, min_lod);
            b.fmin(lo, max_lod)
        }
        SamplerMethod::Implicit => {
            if state.mipmap == MipmapType::None && state.min_lod_bits == state.max_lod_bits {
                b.const_float(f32::from_bits(state.min_lod_bits))
            } else {
                let u0 = b.extract(u_vec, 0);
                let u1 = b.extract(u_vec, 1);
                let u2 = b.extract(u_vec, 2);
                let v0 = b.extract(v_vec, 0);
                let v1 = b.extract(v_vec, 1);
                let v2 = b.extract(v_vec, 2);
                let wf = b.itof(d.width);
                let hf = b.itof(d.height);
                let dudx = b.fsub(u1, u0);
                let dudx = b.fmul(dudx, wf);
                let dvdx = b.fsub(v1, v0);
                let dvdx = b.fmul(dvdx, hf);
                let dudy = b.fsub(u2, u0);
                let dudy = b.fmul(dudy, wf);
                let dvdy = b.fsub(v2, v0);
                let dvdy = b.fmul(dvdy, hf);
                let dx2 = {
                    let a = b.fmul(dudx, dudx);
                    let c = b.fmul(dvdx, dvdx);
                    b.fadd(a, c)
                };
                let dy2 = {
                    let a = b.fmul(dudy, dudy);
                    let c = b.fmul(dvdy, dvdy);
                    b.fadd(a, c)
                };
                let d2 = b.fmax(dx2, dy2);
                // Guard the log against zero-derivative quads.
                let tiny = b.const_float(f32::MIN_POSITIVE);
                let d2 = b.fmax(d2, tiny);
                let log = log2_approx(&mut b, d2);
                let half = b.const_float(0.5);
                let lod = b.fmul(log, half);
                let bias = b.const_float(f32::from_bits(state.lod_bias_bits));
                let lod = b.fadd(lod, bias);
                let lod = b.fmax(lod, min_lod);
                b.fmin(lod, max_lod)
            }
        }
        SamplerMethod::Fetch | SamplerMethod::Gather => b.const_float(0.0),
        SamplerMethod::Write | SamplerMethod::Query => unreachable!(),
    };

    // Level selection from the clamped LOD.
    let levels_minus_one = {
        let one = b.const_int(1);
        b.sub(d.mip_levels, one)
    };
    let zero_i = b.const_int(0);
    let (level0, level1, level_frac) = if instruction.method == SamplerMethod::Fetch {
        // Fetch carries its level operand in the q lane's bit pattern.
        let q0 = b.extract(q_vec, 0);
        let requested = b.bitcast(Type::Int, q0);
        let level = iclamp_dynamic(&mut b, requested, zero_i, levels_minus_one);
        (level, level, b.const_float(0.0))
    } else {
        match state.mipmap {
        MipmapType::None => (zero_i, zero_i, b.const_float(0.0)),
        MipmapType::Point => {
            let half = b.const_float(0.5);
            let nudged = b.fadd(lod, half);
            let level = ifloor(&mut b, nudged);
            let level = iclamp_dynamic(&mut b, level, zero_i, levels_minus_one);
            (level, level, b.const_float(0.0))
        }
        MipmapType::Linear => {
            let l0 = ifloor(&mut b, lod);
            let l0 = iclamp_dynamic(&mut b, l0, zero_i, levels_minus_one);
            let one = b.const_int(1);
            let l1 = b.add(l0, one);
            let l1 = iclamp_dynamic(&mut b, l1, zero_i, levels_minus_one);
            let l0f = b.itof(l0);
            let frac = b.fsub(lod, l0f);
            let frac = {
                let zero = b.const_float(0.0);
                let one_f = b.const_float(1.0);
                let lo = b.fmax(frac, zero);
                b.fmin(lo, one_f)
            };
            (l0, l1, frac)
        }
        }
    };

    let integer_result = integer;
    let mut r_acc = if integer_result {
        b.const_int4([0; 4])
    } else {
        b.const_float4([0.0; 4])
    };
    let mut g_acc = r_acc;
    let mut b_acc = r_acc;
    let mut a_acc = r_acc;

    for lane in 0..4u8 {
        let u = b.extract(u_vec, lane);
        let v = b.extract(v_vec, lane);
        let w = b.extract(w_vec, lane);

        // Fetch uses integer texel coordinates carried in the float lanes'
        // bit patterns.
        let (coords, layer) = if instruction.method == SamplerMethod::Fetch {
            let xi = b.bitcast(Type::Int, u);
            let yi = b.bitcast(Type::Int, v);
            let zi = b.bitcast(Type::Int, w);
            // Reconstruct normalized coordinates so shared taps can scale
            // them back; fetch paths use the indices directly instead.
            let layer = if emitter.shape.arrayed {
                let max_layer = {
                    let one = b.const_int(1);
                    b.sub(d.array_layers, one)
                };
                iclamp_dynamic(&mut b, zi, zero_i, max_layer)
            } else {
                zero_i
            };
            // Fetch is a point tap on exact indices.
            let oob = match instruction.out_of_bounds {
                OutOfBoundsBehavior::Undefined => b.const_bool(false),
                _ => {
                    let sizes = [d.width, d.height, d.depth];
                    let mut oob = b.const_bool(false);
                    for (dim, size) in sizes.iter().enumerate().take(emitter.shape.dims) {
                        let idx = [xi, yi, zi][dim];
                        let low = b.icmp(CmpOp::Slt, idx, zero_i);
                        let one = b.const_int(1);
                        let hi_bound = b.sub(*size, one);
                        let high = b.icmp(CmpOp::Sgt, idx, hi_bound);
                        let dim_oob = b.or_(low, high);
                        oob = b.or_(oob, dim_oob);
                    }
                    oob
                }
            };
            let zi_or_zero = if emitter.shape.dims == 3 { zi } else { zero_i };
            let color = emitter.fetch_texel(&mut b, &d, level0, xi, yi, zi_or_zero, layer, oob)?;
            let r = b.extract(color, 0);
            let g = b.extract(color, 1);
            let bl = b.extract(color, 2);
            let a = b.extract(color, 3);
            r_acc = b.insert(r_acc, r, lane);
            g_acc = b.insert(g_acc, g, lane);
            b_acc = b.insert(b_acc, bl, lane);
            a_acc = b.insert(a_acc, a, lane);
            continue;
        } else {
            let layer = if emitter.shape.arrayed {
                let layer_coord = if emitter.shape.dims == 1 { v } else { w };
                let rounded = {
                    let half = b.const_float(0.5);
                    let nudged = b.fadd(layer_coord, half);
                    ifloor(&mut b, nudged)
                };
                let max_layer = {
                    let one = b.const_int(1);
                    b.sub(d.array_layers, one)
                };
                iclamp_dynamic(&mut b, rounded, zero_i, max_layer)
            } else {
                zero_i
            };
            ([u, v, w], layer)
        };

        let color0 = emitter.sample_level(&mut b, &d, level0, &coords, layer, lod)?;
        let color = if state.mipmap == MipmapType::Linear {
            let color1 = emitter.sample_level(&mut b, &d, level1, &coords, layer, lod)?;
            let frac4 = b.splat(level_frac);
            let one = b.const_splat(1.0);
            let inv = b.vfsub(one, frac4);
            let lo = b.vfmul(color0, inv);
            let hi = b.vfmul(color1, frac4);
            b.vfadd(lo, hi)
        } else {
            color0
        };

        // Depth-compare sampling: reference in q, result in the red channel.
        let color = if state.compare_enable {
            let reference = b.extract(q_vec, lane);
            let depth = b.extract(color, 0);
            let op = vk::CompareOp::from_raw(state.compare_op);
            let passed = emit_compare(&mut b, op, reference, depth);
            let out = b.var(Type::Float4);
            let pass_color = b.const_float4([1.0, 0.0, 0.0, 1.0]);
            let fail_color = b.const_float4([0.0, 0.0, 0.0, 1.0]);
            b.if_then_else(
                passed,
                |b| b.set(&out, pass_color),
                |b| b.set(&out, fail_color),
            );
            b.get(&out)
        } else {
            color
        };

        let r = b.extract(color, 0);
        let g = b.extract(color, 1);
        let bl = b.extract(color, 2);
        let a = b.extract(color, 3);
        r_acc = b.insert(r_acc, r, lane);
        g_acc = b.insert(g_acc, g, lane);
        b_acc = b.insert(b_acc, bl, lane);
        a_acc = b.insert(a_acc, a, lane);
    }

    let store_mem = if integer_result { MemType::I32x4 } else { MemType::F32x4 };
    b.store(store_mem, out_ptr, r_acc);
    let g_ptr = b.ptr_add_imm(out_ptr, 16);
    b.store(store_mem, g_ptr, g_acc);
    let b_ptr = b.ptr_add_imm(out_ptr, 32);
    b.store(store_mem, b_ptr, b_acc);
    let a_ptr = b.ptr_add_imm(out_ptr, 48);
    b.store(store_mem, a_ptr, a_acc);
    b.ret(None);

    let func = b.finish();
    backend::build(&func, "image_sampler", options)
}

/// `reference OP sampled` per the compare operator
fn emit_compare(
    b: &mut FunctionBuilder,
    op: vk::CompareOp,
    reference: Value,
    sampled: Value,
) -> Value {
    match op {
        vk::CompareOp::NEVER => b.const_bool(false),
        vk::CompareOp::ALWAYS => b.const_bool(true),
        vk::CompareOp::LESS => b.fcmp(FCmpOp::Lt, reference, sampled),
        vk::CompareOp::LESS_OR_EQUAL => b.fcmp(FCmpOp::Le, reference, sampled),
        vk::CompareOp::GREATER => b.fcmp(FCmpOp::Gt, reference, sampled),
        vk::CompareOp::GREATER_OR_EQUAL => b.fcmp(FCmpOp::Ge, reference, sampled),
        vk::CompareOp::EQUAL => b.fcmp(FCmpOp::Eq, reference, sampled),
        vk::CompareOp::NOT_EQUAL => b.fcmp(FCmpOp::Ne, reference, sampled),
        other => panic!("unsupported compare op {other:?}"),
    }
}

/// Emits a storage-write routine:
/// `(descriptor, int_coords, rgba, constants, lane_mask)`
fn emit_write_routine(
    instruction: ImageInstruction,
    state: &SamplerState,
    options: &BuildOptions,
) -> Result<Arc<Routine>, BuildError> {
    let format = vk::Format::from_raw(state.format);
    let shape = view_shape(state.view_type)?;
    let integer = texel::is_integer_format(format);

    let mut b = FunctionBuilder::new(&[Type::Ptr; 5], Type::Void);
    let desc_ptr = b.param(0);
    let coords_ptr = b.param(1);
    let rgba_ptr = b.param(2);
    let mask_ptr = b.param(4);
    let d = DescriptorValues::load(&mut b, desc_ptr);

    let x_vec = b.load(MemType::I32x4, coords_ptr);
    let y_ptr = b.ptr_add_imm(coords_ptr, 16);
    let y_vec = b.load(MemType::I32x4, y_ptr);
    let z_ptr = b.ptr_add_imm(coords_ptr, 32);
    let z_vec = b.load(MemType::I32x4, z_ptr);
    let mask_vec = b.load(MemType::I32x4, mask_ptr);

    let mem = if integer { MemType::I32x4 } else { MemType::F32x4 };
    let r_vec = b.load(mem, rgba_ptr);
    let g_p = b.ptr_add_imm(rgba_ptr, 16);
    let g_vec = b.load(mem, g_p);
    let b_p = b.ptr_add_imm(rgba_ptr, 32);
    let b_vec = b.load(mem, b_p);
    let a_p = b.ptr_add_imm(rgba_ptr, 48);
    let a_vec = b.load(mem, a_p);

    let bpp = texel::bytes_per_texel(format)?;
    let zero = b.const_int(0);
    let one = b.const_int(1);

    for lane in 0..4u8 {
        let active = {
            let m = b.extract(mask_vec, lane);
            b.icmp(CmpOp::Ne, m, zero)
        };
        let x = b.extract(x_vec, lane);
        let y = b.extract(y_vec, lane);
        let z = b.extract(z_vec, lane);

        // Bounds per policy: nullify skips, robust clamps, undefined trusts.
        let mut in_bounds = b.const_bool(true);
        let mut xs = x;
        let mut ys = y;
        let mut zs = z;
        match instruction.out_of_bounds {
            OutOfBoundsBehavior::Undefined => {}
            OutOfBoundsBehavior::Nullify => {
                let sizes = [d.width, d.height, d.depth];
                for dim in 0..shape.dims {
                    let idx = [x, y, z][dim];
                    let limit = b.sub(sizes[dim], one);
                    let low_ok = b.icmp(CmpOp::Sge, idx, zero);
                    let high_ok = b.icmp(CmpOp::Sle, idx, limit);
                    let dim_ok = b.and_(low_ok, high_ok);
                    in_bounds = b.and_(in_bounds, dim_ok);
                }
            }
            OutOfBoundsBehavior::RobustBufferAccess => {
                let wx = b.sub(d.width, one);
                xs = iclamp_dynamic(&mut b, x, zero, wx);
                let hy = b.sub(d.height, one);
                ys = iclamp_dynamic(&mut b, y, zero, hy);
                let dz = b.sub(d.depth, one);
                zs = iclamp_dynamic(&mut b, z, zero, dz);
            }
        }

        let write = b.and_(active, in_bounds);

        // Per-lane texel color in component lanes.
        let r = b.extract(r_vec, lane);
        let g = b.extract(g_vec, lane);
        let bl = b.extract(b_vec, lane);
        let a = b.extract(a_vec, lane);
        let mut rgba = if integer {
            b.const_int4([0; 4])
        } else {
            b.const_float4([0.0; 4])
        };
        rgba = b.insert(rgba, r, 0);
        rgba = b.insert(rgba, g, 1);
        rgba = b.insert(rgba, bl, 2);
        rgba = b.insert(rgba, a, 3);

        let row0 = b.ptr_add_imm(d.desc, offset_of!(SampledImageDescriptor, row_pitch) as i32);
        let row_pitch = b.load(MemType::I32, row0);
        let slice0 =
            b.ptr_add_imm(d.desc, offset_of!(SampledImageDescriptor, slice_pitch) as i32);
        let slice_pitch = b.load(MemType::I32, slice0);

        let x_bytes = b.const_int(bpp as i32);
        let x_off = b.mul(xs, x_bytes);
        let y_off = b.mul(ys, row_pitch);
        let z_off = b.mul(zs, slice_pitch);
        let offset = b.add(x_off, y_off);
        let offset = b.add(offset, z_off);
        let ptr = b.ptr_add(d.base, offset);

        let mut emit_error = None;
        b.if_then(write, |b| {
            if let Err(e) = texel::encode(b, format, ptr, rgba) {
                emit_error = Some(e);
            }
        });
        if let Some(e) = emit_error {
            return Err(e);
        }
    }

    b.ret(None);
    let func = b.finish();
    backend::build(&func, "image_write", options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::image::{ImageView, ImageViewDesc};

    type SampleFn = extern "C" fn(*const SampledImageDescriptor, *const f32, *mut f32, *const u8);

    fn checkerboard_view() -> (Vec<u8>, ImageView) {
        // 2×2 RGBA8: red, green / blue, white
        let desc = ImageViewDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            width: 2,
            height: 2,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
        };
        let mut storage = vec![
            255, 0, 0, 255, /* */ 0, 255, 0, 255, //
            0, 0, 255, 255, /* */ 255, 255, 255, 255,
        ];
        let ptr = storage.as_mut_ptr();
        (storage, ImageView::new(desc, ptr))
    }

    fn sample_at(state: &SamplerState, instruction: ImageInstruction, u: f32, v: f32) -> [f32; 4] {
        let routine = emit_sampler_routine(instruction, state, &BuildOptions::default()).unwrap();
        let f: SampleFn = unsafe { std::mem::transmute(routine.entry(0)) };

        let (_storage, view) = checkerboard_view();
        let descriptor = view.descriptor();
        // SoA quad with all lanes at the same coordinate.
        let mut coords = [0f32; 16];
        coords[0..4].copy_from_slice(&[u; 4]);
        coords[4..8].copy_from_slice(&[v; 4]);
        let mut out = [0f32; 16];
        f(&descriptor, coords.as_ptr(), out.as_mut_ptr(), std::ptr::null());
        [out[0], out[4], out[8], out[12]]
    }

    fn point_state() -> SamplerState {
        let view = ImageViewIdentifier {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            single_mip_level: true,
        };
        let instruction = ImageInstruction {
            method: SamplerMethod::Implicit,
            out_of_bounds: OutOfBoundsBehavior::Nullify,
            gather_component: 0,
        };
        update_sampler_state(instruction, view, Some(&SamplerDesc::default()))
    }

    #[test]
    fn test_point_sample_picks_texel_centers() {
        let state = point_state();
        let instruction = ImageInstruction {
            method: SamplerMethod::Implicit,
            out_of_bounds: OutOfBoundsBehavior::Nullify,
            gather_component: 0,
        };
        let red = sample_at(&state, instruction, 0.25, 0.25);
        assert_eq!(red, [1.0, 0.0, 0.0, 1.0]);
        let white = sample_at(&state, instruction, 0.75, 0.75);
        assert_eq!(white, [1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_wrap_addressing_repeats() {
        let state = point_state();
        let instruction = ImageInstruction {
            method: SamplerMethod::Implicit,
            out_of_bounds: OutOfBoundsBehavior::Nullify,
            gather_component: 0,
        };
        let wrapped = sample_at(&state, instruction, 1.25, -0.75);
        assert_eq!(wrapped, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_linear_sample_blends_at_texel_boundary() {
        let view = ImageViewIdentifier {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            single_mip_level: true,
        };
        let instruction = ImageInstruction {
            method: SamplerMethod::Implicit,
            out_of_bounds: OutOfBoundsBehavior::Nullify,
            gather_component: 0,
        };
        let mut sampler = SamplerDesc::default();
        sampler.min_filter = vk::Filter::LINEAR;
        sampler.mag_filter = vk::Filter::LINEAR;
        sampler.address_mode_u = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        sampler.address_mode_v = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        let state = update_sampler_state(instruction, view, Some(&sampler));

        // Dead center of the image: equal blend of all four texels.
        let center = sample_at(&state, instruction, 0.5, 0.5);
        for (got, want) in center.iter().zip([0.5, 0.5, 0.5, 1.0]) {
            assert!((got - want).abs() < 0.01, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_filter_conversion_rules() {
        let mut sampler = SamplerDesc::default();
        sampler.anisotropy_enable = true;
        sampler.min_filter = vk::Filter::LINEAR;
        sampler.mag_filter = vk::Filter::LINEAR;
        assert_eq!(
            convert_filter_mode(&sampler, vk::ImageViewType::TYPE_2D, SamplerMethod::Implicit),
            FilterType::Anisotropic
        );
        // Explicit LOD suppresses anisotropy; 3D views never get it.
        assert_eq!(
            convert_filter_mode(&sampler, vk::ImageViewType::TYPE_2D, SamplerMethod::Lod),
            FilterType::Linear
        );
        assert_eq!(
            convert_filter_mode(&sampler, vk::ImageViewType::TYPE_3D, SamplerMethod::Implicit),
            FilterType::Linear
        );
        assert_eq!(
            convert_filter_mode(&sampler, vk::ImageViewType::TYPE_2D, SamplerMethod::Gather),
            FilterType::Gather
        );
        assert_eq!(
            convert_filter_mode(&sampler, vk::ImageViewType::TYPE_2D, SamplerMethod::Fetch),
            FilterType::Point
        );
    }

    #[test]
    fn test_addressing_conversion_rules() {
        let sampler = SamplerDesc::default();
        assert_eq!(
            convert_addressing_mode(2, Some(&sampler), vk::ImageViewType::TYPE_2D),
            AddressingMode::Unused
        );
        assert_eq!(
            convert_addressing_mode(0, Some(&sampler), vk::ImageViewType::CUBE),
            AddressingMode::Seamless
        );
        assert_eq!(
            convert_addressing_mode(2, Some(&sampler), vk::ImageViewType::CUBE),
            AddressingMode::CubeFace
        );
        // Samplerless fetch falls back to border robustness.
        assert_eq!(
            convert_addressing_mode(0, None, vk::ImageViewType::TYPE_2D),
            AddressingMode::Border
        );
    }

    #[test]
    fn test_single_mip_elides_lod_clamp() {
        let view = ImageViewIdentifier {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            single_mip_level: true,
        };
        let instruction = ImageInstruction {
            method: SamplerMethod::Implicit,
            out_of_bounds: OutOfBoundsBehavior::Nullify,
            gather_component: 0,
        };
        let mut sampler = SamplerDesc::default();
        sampler.min_lod = 2.0;
        sampler.max_lod = 5.0;
        let state = update_sampler_state(instruction, view, Some(&sampler));
        assert_eq!(state.min_lod_bits, 0);
        assert_eq!(state.max_lod_bits, 0);
    }
}
