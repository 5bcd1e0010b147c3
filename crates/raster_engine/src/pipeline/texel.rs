//! Texel packing and unpacking
//!
//! Emits the per-format conversion between stored texel bytes and shader
//! values: `Float4` in [0,1] / [-1,1] for normalized formats, `Int4` for
//! integer formats, natural range for float formats. Consumed by the sampler
//! generator for reads and writes, by the pixel stage for color attachments,
//! and by the vertex stage for attribute fetch.
//!
//! A format outside the supported matrix fails the build; there are no
//! runtime "unsupported format" paths in generated code.

use crate::reactor::backend::BuildError;
use crate::reactor::ir::{CmpOp, MemType, Type, Value};
use crate::reactor::FunctionBuilder;
use ash::vk;

/// Whether the format decodes to `Int4` rather than `Float4`
pub fn is_integer_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::R8_UINT
            | vk::Format::R8_SINT
            | vk::Format::R8G8_UINT
            | vk::Format::R8G8_SINT
            | vk::Format::R8G8B8A8_UINT
            | vk::Format::R8G8B8A8_SINT
            | vk::Format::A2B10G10R10_UINT_PACK32
            | vk::Format::R16_UINT
            | vk::Format::R16_SINT
            | vk::Format::R16G16_UINT
            | vk::Format::R16G16_SINT
            | vk::Format::R16G16B16A16_UINT
            | vk::Format::R16G16B16A16_SINT
            | vk::Format::R32_UINT
            | vk::Format::R32_SINT
            | vk::Format::R32G32_UINT
            | vk::Format::R32G32_SINT
            | vk::Format::R32G32B32_UINT
            | vk::Format::R32G32B32_SINT
            | vk::Format::R32G32B32A32_UINT
            | vk::Format::R32G32B32A32_SINT
            | vk::Format::S8_UINT
    )
}

/// Bytes occupied by one texel of the format
pub fn bytes_per_texel(format: vk::Format) -> Result<u32, BuildError> {
    Ok(match format {
        vk::Format::R8_UNORM
        | vk::Format::R8_SNORM
        | vk::Format::R8_UINT
        | vk::Format::R8_SINT
        | vk::Format::S8_UINT => 1,
        vk::Format::R8G8_UNORM
        | vk::Format::R8G8_SNORM
        | vk::Format::R8G8_UINT
        | vk::Format::R8G8_SINT
        | vk::Format::R16_SFLOAT
        | vk::Format::R16_UNORM
        | vk::Format::R16_SNORM
        | vk::Format::R16_UINT
        | vk::Format::R16_SINT
        | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::R8G8B8A8_SINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::A2B10G10R10_UINT_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R16G16_UNORM
        | vk::Format::R16G16_SNORM
        | vk::Format::R16G16_UINT
        | vk::Format::R16G16_SINT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::R32_SINT
        | vk::Format::D32_SFLOAT
        | vk::Format::D24_UNORM_S8_UINT => 4,
        vk::Format::R16G16B16A16_SFLOAT
        | vk::Format::R16G16B16A16_UNORM
        | vk::Format::R16G16B16A16_SNORM
        | vk::Format::R16G16B16A16_UINT
        | vk::Format::R16G16B16A16_SINT
        | vk::Format::R32G32_SFLOAT
        | vk::Format::R32G32_UINT
        | vk::Format::R32G32_SINT
        | vk::Format::D32_SFLOAT_S8_UINT => 8,
        vk::Format::R32G32B32_SFLOAT
        | vk::Format::R32G32B32_UINT
        | vk::Format::R32G32B32_SINT => 12,
        vk::Format::R32G32B32A32_SFLOAT
        | vk::Format::R32G32B32A32_UINT
        | vk::Format::R32G32B32A32_SINT => 16,
        other => {
            return Err(BuildError::Unsupported(format!(
                "texel format {other:?}"
            )))
        }
    })
}

/// Rounds a float to the nearest integer, halfway away from zero
fn round_to_int(b: &mut FunctionBuilder, x: Value) -> Value {
    let bits = b.bitcast(Type::Int, x);
    let sign_mask = b.const_int(i32::MIN);
    let sign = b.and_(bits, sign_mask);
    let half_bits = b.const_int(0.5f32.to_bits() as i32);
    let signed_half_bits = b.or_(half_bits, sign);
    let signed_half = b.bitcast(Type::Float, signed_half_bits);
    let nudged = b.fadd(x, signed_half);
    b.ftoi(nudged)
}

fn fclamp(b: &mut FunctionBuilder, x: Value, lo: f32, hi: f32) -> Value {
    let lo = b.const_float(lo);
    let hi = b.const_float(hi);
    let x = b.fmax(x, lo);
    b.fmin(x, hi)
}

fn iclamp(b: &mut FunctionBuilder, x: Value, lo: i32, hi: i32) -> Value {
    let out = b.var_init(x);
    let lo = b.const_int(lo);
    let hi = b.const_int(hi);
    let below = b.icmp(CmpOp::Slt, x, lo);
    b.if_then(below, |b| b.set(&out, lo));
    let current = b.get(&out);
    let above = b.icmp(CmpOp::Sgt, current, hi);
    b.if_then(above, |b| b.set(&out, hi));
    b.get(&out)
}

/// Unsigned clamp for UINT encodes (values compare as unsigned)
fn uclamp(b: &mut FunctionBuilder, x: Value, hi: u32) -> Value {
    let out = b.var_init(x);
    let hi = b.const_int(hi as i32);
    let above = b.icmp(CmpOp::Uge, x, hi);
    b.if_then(above, |b| b.set(&out, hi));
    b.get(&out)
}

/// Decodes 16 half-float bits (in an `Int`) to a `Float`.
///
/// The shift-and-scale trick: aligning the half exponent under the float
/// exponent and multiplying by 2^112 rescales both normals and denormals.
/// Infinities and NaNs decode to large finite values, which the supported
/// format matrix never produces.
fn half_to_float(b: &mut FunctionBuilder, h: Value) -> Value {
    let magnitude_mask = b.const_int(0x7FFF);
    let magnitude = b.and_(h, magnitude_mask);
    let thirteen = b.const_int(13);
    let aligned = b.shl(magnitude, thirteen);
    let unscaled = b.bitcast(Type::Float, aligned);
    let scale = b.const_float(f32::from_bits(0x7780_0000)); // 2^112
    let value = b.fmul(unscaled, scale);

    let sign_mask = b.const_int(0x8000);
    let sign = b.and_(h, sign_mask);
    let sixteen = b.const_int(16);
    let sign_bit = b.shl(sign, sixteen);
    let value_bits = b.bitcast(Type::Int, value);
    let combined = b.or_(value_bits, sign_bit);
    b.bitcast(Type::Float, combined)
}

/// Encodes a `Float` into 16 half bits (in an `Int`), truncating the mantissa
fn float_to_half(b: &mut FunctionBuilder, f: Value) -> Value {
    let bits = b.bitcast(Type::Int, f);
    let sixteen = b.const_int(16);
    let shifted = b.lshr(bits, sixteen);
    let sign_mask = b.const_int(0x8000);
    let sign = b.and_(shifted, sign_mask);

    let magnitude_mask = b.const_int(0x7FFF_FFFF);
    let magnitude_bits = b.and_(bits, magnitude_mask);
    let magnitude = b.bitcast(Type::Float, magnitude_bits);
    let scale = b.const_float(f32::from_bits(0x0880_0000)); // 2^-112
    let scaled = b.fmul(magnitude, scale);
    let scaled_bits = b.bitcast(Type::Int, scaled);
    let thirteen = b.const_int(13);
    let h = b.lshr(scaled_bits, thirteen);
    let h = iclamp(b, h, 0, 0x7BFF); // clamp overflow below infinity
    b.or_(h, sign)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Numeric {
    Unorm,
    Snorm,
    Uint,
    Sint,
    Sfloat,
}

struct Channels {
    /// component index (after BGRA swap) and byte offset per stored channel
    offsets: Vec<(usize, i32)>,
}

fn channel_layout(count: usize, stride: i32, bgra: bool) -> Channels {
    let mut offsets = Vec::with_capacity(count);
    for channel in 0..count {
        let component = if bgra && channel == 0 {
            2
        } else if bgra && channel == 2 {
            0
        } else {
            channel
        };
        offsets.push((component, channel as i32 * stride));
    }
    Channels { offsets }
}

/// Decodes one texel at `ptr`. Returns `Float4` (rgba) for normalized and
/// float formats, `Int4` for integer formats. Missing components read as
/// zero with alpha one.
pub fn decode(
    b: &mut FunctionBuilder,
    format: vk::Format,
    ptr: Value,
) -> Result<Value, BuildError> {
    use vk::Format as F;
    let result = match format {
        F::R8_UNORM => decode_bytes(b, ptr, 1, false, Numeric::Unorm),
        F::R8G8_UNORM => decode_bytes(b, ptr, 2, false, Numeric::Unorm),
        F::R8G8B8A8_UNORM => decode_bytes(b, ptr, 4, false, Numeric::Unorm),
        F::B8G8R8A8_UNORM => decode_bytes(b, ptr, 4, true, Numeric::Unorm),
        F::R8_SNORM => decode_bytes(b, ptr, 1, false, Numeric::Snorm),
        F::R8G8_SNORM => decode_bytes(b, ptr, 2, false, Numeric::Snorm),
        F::R8G8B8A8_SNORM => decode_bytes(b, ptr, 4, false, Numeric::Snorm),
        F::R8_UINT => decode_bytes(b, ptr, 1, false, Numeric::Uint),
        F::R8G8_UINT => decode_bytes(b, ptr, 2, false, Numeric::Uint),
        F::R8G8B8A8_UINT => decode_bytes(b, ptr, 4, false, Numeric::Uint),
        F::R8_SINT => decode_bytes(b, ptr, 1, false, Numeric::Sint),
        F::R8G8_SINT => decode_bytes(b, ptr, 2, false, Numeric::Sint),
        F::R8G8B8A8_SINT => decode_bytes(b, ptr, 4, false, Numeric::Sint),

        F::R16_UNORM => decode_words(b, ptr, 1, Numeric::Unorm),
        F::R16G16_UNORM => decode_words(b, ptr, 2, Numeric::Unorm),
        F::R16G16B16A16_UNORM => decode_words(b, ptr, 4, Numeric::Unorm),
        F::R16_SNORM => decode_words(b, ptr, 1, Numeric::Snorm),
        F::R16G16_SNORM => decode_words(b, ptr, 2, Numeric::Snorm),
        F::R16G16B16A16_SNORM => decode_words(b, ptr, 4, Numeric::Snorm),
        F::R16_UINT => decode_words(b, ptr, 1, Numeric::Uint),
        F::R16G16_UINT => decode_words(b, ptr, 2, Numeric::Uint),
        F::R16G16B16A16_UINT => decode_words(b, ptr, 4, Numeric::Uint),
        F::R16_SINT => decode_words(b, ptr, 1, Numeric::Sint),
        F::R16G16_SINT => decode_words(b, ptr, 2, Numeric::Sint),
        F::R16G16B16A16_SINT => decode_words(b, ptr, 4, Numeric::Sint),
        F::R16_SFLOAT => decode_half(b, ptr, 1),
        F::R16G16_SFLOAT => decode_half(b, ptr, 2),
        F::R16G16B16A16_SFLOAT => decode_half(b, ptr, 4),

        F::R32_SFLOAT => decode_dwords(b, ptr, 1, Numeric::Sfloat),
        F::R32G32_SFLOAT => decode_dwords(b, ptr, 2, Numeric::Sfloat),
        F::R32G32B32_SFLOAT => decode_dwords(b, ptr, 3, Numeric::Sfloat),
        F::R32G32B32A32_SFLOAT => decode_dwords(b, ptr, 4, Numeric::Sfloat),
        F::R32_UINT | F::R32_SINT => decode_dwords(b, ptr, 1, Numeric::Sint),
        F::R32G32_UINT | F::R32G32_SINT => decode_dwords(b, ptr, 2, Numeric::Sint),
        F::R32G32B32_UINT | F::R32G32B32_SINT => decode_dwords(b, ptr, 3, Numeric::Sint),
        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT => decode_dwords(b, ptr, 4, Numeric::Sint),

        F::A2B10G10R10_UNORM_PACK32 => decode_1010102(b, ptr, Numeric::Unorm),
        F::A2B10G10R10_UINT_PACK32 => decode_1010102(b, ptr, Numeric::Uint),
        F::B10G11R11_UFLOAT_PACK32 => decode_11_11_10(b, ptr),

        F::D16_UNORM => decode_words(b, ptr, 1, Numeric::Unorm),
        F::D32_SFLOAT | F::D32_SFLOAT_S8_UINT => decode_dwords(b, ptr, 1, Numeric::Sfloat),
        F::D24_UNORM_S8_UINT => {
            let word = b.load(MemType::I32, ptr);
            let mask = b.const_int(0x00FF_FFFF);
            let depth_bits = b.and_(word, mask);
            let depth = b.itof(depth_bits);
            let scale = b.const_float(1.0 / 16_777_215.0);
            let depth = b.fmul(depth, scale);
            let base = b.const_float4([0.0, 0.0, 0.0, 1.0]);
            b.insert(base, depth, 0)
        }
        F::S8_UINT => decode_bytes(b, ptr, 1, false, Numeric::Uint),

        other => {
            return Err(BuildError::Unsupported(format!(
                "texel decode for {other:?}"
            )))
        }
    };
    Ok(result)
}

/// Decodes the stencil aspect of a combined depth/stencil texel as an `Int`
pub fn decode_stencil(
    b: &mut FunctionBuilder,
    format: vk::Format,
    ptr: Value,
) -> Result<Value, BuildError> {
    match format {
        vk::Format::S8_UINT => Ok(b.load(MemType::U8, ptr)),
        vk::Format::D24_UNORM_S8_UINT => {
            let p = b.ptr_add_imm(ptr, 3);
            Ok(b.load(MemType::U8, p))
        }
        vk::Format::D32_SFLOAT_S8_UINT => {
            let p = b.ptr_add_imm(ptr, 4);
            Ok(b.load(MemType::U8, p))
        }
        other => Err(BuildError::Unsupported(format!(
            "stencil aspect of {other:?}"
        ))),
    }
}

fn float_defaults(b: &mut FunctionBuilder) -> Value {
    b.const_float4([0.0, 0.0, 0.0, 1.0])
}

fn int_defaults(b: &mut FunctionBuilder) -> Value {
    b.const_int4([0, 0, 0, 1])
}

fn decode_bytes(
    b: &mut FunctionBuilder,
    ptr: Value,
    count: usize,
    bgra: bool,
    numeric: Numeric,
) -> Value {
    let layout = channel_layout(count, 1, bgra);
    let mut out = match numeric {
        Numeric::Uint | Numeric::Sint => int_defaults(b),
        _ => float_defaults(b),
    };
    for (component, offset) in layout.offsets {
        let p = b.ptr_add_imm(ptr, offset);
        let value = match numeric {
            Numeric::Unorm => {
                let raw = b.load(MemType::U8, p);
                let f = b.itof(raw);
                let scale = b.const_float(1.0 / 255.0);
                b.fmul(f, scale)
            }
            Numeric::Snorm => {
                let raw = b.load(MemType::I8, p);
                let f = b.itof(raw);
                let scale = b.const_float(1.0 / 127.0);
                let f = b.fmul(f, scale);
                let floor = b.const_float(-1.0);
                b.fmax(f, floor)
            }
            Numeric::Uint => b.load(MemType::U8, p),
            Numeric::Sint => b.load(MemType::I8, p),
            Numeric::Sfloat => unreachable!("no 8-bit float formats"),
        };
        out = b.insert(out, value, component as u8);
    }
    out
}

fn decode_words(b: &mut FunctionBuilder, ptr: Value, count: usize, numeric: Numeric) -> Value {
    let layout = channel_layout(count, 2, false);
    let mut out = match numeric {
        Numeric::Uint | Numeric::Sint => int_defaults(b),
        _ => float_defaults(b),
    };
    for (component, offset) in layout.offsets {
        let p = b.ptr_add_imm(ptr, offset);
        let value = match numeric {
            Numeric::Unorm => {
                let raw = b.load(MemType::U16, p);
                let f = b.itof(raw);
                let scale = b.const_float(1.0 / 65535.0);
                b.fmul(f, scale)
            }
            Numeric::Snorm => {
                let raw = b.load(MemType::I16, p);
                let f = b.itof(raw);
                let scale = b.const_float(1.0 / 32767.0);
                let f = b.fmul(f, scale);
                let floor = b.const_float(-1.0);
                b.fmax(f, floor)
            }
            Numeric::Uint => b.load(MemType::U16, p),
            Numeric::Sint => b.load(MemType::I16, p),
            Numeric::Sfloat => unreachable!("halves decode via decode_half"),
        };
        out = b.insert(out, value, component as u8);
    }
    out
}

fn decode_half(b: &mut FunctionBuilder, ptr: Value, count: usize) -> Value {
    let mut out = float_defaults(b);
    for channel in 0..count {
        let p = b.ptr_add_imm(ptr, channel as i32 * 2);
        let raw = b.load(MemType::U16, p);
        let value = half_to_float(b, raw);
        out = b.insert(out, value, channel as u8);
    }
    out
}

fn decode_dwords(b: &mut FunctionBuilder, ptr: Value, count: usize, numeric: Numeric) -> Value {
    let mut out = match numeric {
        Numeric::Sfloat => float_defaults(b),
        _ => int_defaults(b),
    };
    for channel in 0..count {
        let p = b.ptr_add_imm(ptr, channel as i32 * 4);
        let value = match numeric {
            Numeric::Sfloat => b.load(MemType::F32, p),
            _ => b.load(MemType::I32, p),
        };
        out = b.insert(out, value, channel as u8);
    }
    out
}

fn decode_1010102(b: &mut FunctionBuilder, ptr: Value, numeric: Numeric) -> Value {
    let word = b.load(MemType::I32, ptr);
    let widths = [(0u8, 0i32, 1023i32), (1, 10, 1023), (2, 20, 1023), (3, 30, 3)];
    let mut out = match numeric {
        Numeric::Uint => int_defaults(b),
        _ => float_defaults(b),
    };
    for (component, shift, max) in widths {
        let shift_v = b.const_int(shift);
        let shifted = b.lshr(word, shift_v);
        let mask = b.const_int(max);
        let raw = b.and_(shifted, mask);
        let value = match numeric {
            Numeric::Uint => raw,
            _ => {
                let f = b.itof(raw);
                let scale = b.const_float(1.0 / max as f32);
                b.fmul(f, scale)
            }
        };
        out = b.insert(out, value, component);
    }
    out
}

fn decode_11_11_10(b: &mut FunctionBuilder, ptr: Value) -> Value {
    let word = b.load(MemType::I32, ptr);
    let mut out = float_defaults(b);
    // 11-bit floats widen to half bits by a 4-bit mantissa shift, 10-bit by 5.
    let fields = [(0u8, 0i32, 0x7FFi32, 4i32), (1, 11, 0x7FF, 4), (2, 22, 0x3FF, 5)];
    for (component, shift, mask, widen) in fields {
        let shift_v = b.const_int(shift);
        let shifted = b.lshr(word, shift_v);
        let mask_v = b.const_int(mask);
        let raw = b.and_(shifted, mask_v);
        let widen_v = b.const_int(widen);
        let half_bits = b.shl(raw, widen_v);
        let value = half_to_float(b, half_bits);
        out = b.insert(out, value, component);
    }
    out
}

/// Encodes `rgba` into one texel at `ptr`. `rgba` must be `Float4` for
/// normalized/float formats and `Int4` for integer formats; values are
/// clamped to the format's representable range.
pub fn encode(
    b: &mut FunctionBuilder,
    format: vk::Format,
    ptr: Value,
    rgba: Value,
) -> Result<(), BuildError> {
    use vk::Format as F;
    match format {
        F::R8_UNORM => encode_bytes(b, ptr, rgba, 1, false, Numeric::Unorm),
        F::R8G8_UNORM => encode_bytes(b, ptr, rgba, 2, false, Numeric::Unorm),
        F::R8G8B8A8_UNORM => encode_bytes(b, ptr, rgba, 4, false, Numeric::Unorm),
        F::B8G8R8A8_UNORM => encode_bytes(b, ptr, rgba, 4, true, Numeric::Unorm),
        F::R8_SNORM => encode_bytes(b, ptr, rgba, 1, false, Numeric::Snorm),
        F::R8G8_SNORM => encode_bytes(b, ptr, rgba, 2, false, Numeric::Snorm),
        F::R8G8B8A8_SNORM => encode_bytes(b, ptr, rgba, 4, false, Numeric::Snorm),
        F::R8_UINT => encode_bytes(b, ptr, rgba, 1, false, Numeric::Uint),
        F::R8G8_UINT => encode_bytes(b, ptr, rgba, 2, false, Numeric::Uint),
        F::R8G8B8A8_UINT => encode_bytes(b, ptr, rgba, 4, false, Numeric::Uint),
        F::R8_SINT => encode_bytes(b, ptr, rgba, 1, false, Numeric::Sint),
        F::R8G8_SINT => encode_bytes(b, ptr, rgba, 2, false, Numeric::Sint),
        F::R8G8B8A8_SINT => encode_bytes(b, ptr, rgba, 4, false, Numeric::Sint),

        F::R16_UNORM => encode_words(b, ptr, rgba, 1, Numeric::Unorm),
        F::R16G16_UNORM => encode_words(b, ptr, rgba, 2, Numeric::Unorm),
        F::R16G16B16A16_UNORM => encode_words(b, ptr, rgba, 4, Numeric::Unorm),
        F::R16_SNORM => encode_words(b, ptr, rgba, 1, Numeric::Snorm),
        F::R16G16_SNORM => encode_words(b, ptr, rgba, 2, Numeric::Snorm),
        F::R16G16B16A16_SNORM => encode_words(b, ptr, rgba, 4, Numeric::Snorm),
        F::R16_UINT => encode_words(b, ptr, rgba, 1, Numeric::Uint),
        F::R16G16_UINT => encode_words(b, ptr, rgba, 2, Numeric::Uint),
        F::R16G16B16A16_UINT => encode_words(b, ptr, rgba, 4, Numeric::Uint),
        F::R16_SINT => encode_words(b, ptr, rgba, 1, Numeric::Sint),
        F::R16G16_SINT => encode_words(b, ptr, rgba, 2, Numeric::Sint),
        F::R16G16B16A16_SINT => encode_words(b, ptr, rgba, 4, Numeric::Sint),
        F::R16_SFLOAT => encode_half(b, ptr, rgba, 1),
        F::R16G16_SFLOAT => encode_half(b, ptr, rgba, 2),
        F::R16G16B16A16_SFLOAT => encode_half(b, ptr, rgba, 4),

        F::R32_SFLOAT => encode_dwords(b, ptr, rgba, 1),
        F::R32G32_SFLOAT => encode_dwords(b, ptr, rgba, 2),
        F::R32G32B32_SFLOAT => encode_dwords(b, ptr, rgba, 3),
        F::R32G32B32A32_SFLOAT => encode_dwords(b, ptr, rgba, 4),
        F::R32_UINT | F::R32_SINT => encode_dwords(b, ptr, rgba, 1),
        F::R32G32_UINT | F::R32G32_SINT => encode_dwords(b, ptr, rgba, 2),
        F::R32G32B32_UINT | F::R32G32B32_SINT => encode_dwords(b, ptr, rgba, 3),
        F::R32G32B32A32_UINT | F::R32G32B32A32_SINT => encode_dwords(b, ptr, rgba, 4),

        F::A2B10G10R10_UNORM_PACK32 => encode_1010102(b, ptr, rgba, Numeric::Unorm),
        F::A2B10G10R10_UINT_PACK32 => encode_1010102(b, ptr, rgba, Numeric::Uint),
        F::B10G11R11_UFLOAT_PACK32 => encode_11_11_10(b, ptr, rgba),

        F::D16_UNORM => encode_words(b, ptr, rgba, 1, Numeric::Unorm),
        F::D32_SFLOAT | F::D32_SFLOAT_S8_UINT => encode_dwords(b, ptr, rgba, 1),
        F::S8_UINT => encode_bytes(b, ptr, rgba, 1, false, Numeric::Uint),

        other => {
            return Err(BuildError::Unsupported(format!(
                "texel encode for {other:?}"
            )))
        }
    }
    Ok(())
}

fn encode_bytes(
    b: &mut FunctionBuilder,
    ptr: Value,
    rgba: Value,
    count: usize,
    bgra: bool,
    numeric: Numeric,
) {
    let layout = channel_layout(count, 1, bgra);
    for (component, offset) in layout.offsets {
        let p = b.ptr_add_imm(ptr, offset);
        let raw = match numeric {
            Numeric::Unorm => {
                let f = b.extract(rgba, component as u8);
                let f = fclamp(b, f, 0.0, 1.0);
                let scale = b.const_float(255.0);
                let f = b.fmul(f, scale);
                round_to_int(b, f)
            }
            Numeric::Snorm => {
                let f = b.extract(rgba, component as u8);
                let f = fclamp(b, f, -1.0, 1.0);
                let scale = b.const_float(127.0);
                let f = b.fmul(f, scale);
                round_to_int(b, f)
            }
            Numeric::Uint => {
                let v = b.extract(rgba, component as u8);
                uclamp(b, v, 255)
            }
            Numeric::Sint => {
                let v = b.extract(rgba, component as u8);
                iclamp(b, v, -128, 127)
            }
            Numeric::Sfloat => unreachable!("no 8-bit float formats"),
        };
        b.store(MemType::U8, p, raw);
    }
}

fn encode_words(
    b: &mut FunctionBuilder,
    ptr: Value,
    rgba: Value,
    count: usize,
    numeric: Numeric,
) {
    for channel in 0..count {
        let p = b.ptr_add_imm(ptr, channel as i32 * 2);
        let raw = match numeric {
            Numeric::Unorm => {
                let f = b.extract(rgba, channel as u8);
                let f = fclamp(b, f, 0.0, 1.0);
                let scale = b.const_float(65535.0);
                let f = b.fmul(f, scale);
                round_to_int(b, f)
            }
            Numeric::Snorm => {
                let f = b.extract(rgba, channel as u8);
                let f = fclamp(b, f, -1.0, 1.0);
                let scale = b.const_float(32767.0);
                let f = b.fmul(f, scale);
                round_to_int(b, f)
            }
            Numeric::Uint => {
                let v = b.extract(rgba, channel as u8);
                uclamp(b, v, 65535)
            }
            Numeric::Sint => {
                let v = b.extract(rgba, channel as u8);
                iclamp(b, v, -32768, 32767)
            }
            Numeric::Sfloat => unreachable!("halves encode via encode_half"),
        };
        b.store(MemType::U16, p, raw);
    }
}

fn encode_half(b: &mut FunctionBuilder, ptr: Value, rgba: Value, count: usize) {
    for channel in 0..count {
        let p = b.ptr_add_imm(ptr, channel as i32 * 2);
        let f = b.extract(rgba, channel as u8);
        let h = float_to_half(b, f);
        b.store(MemType::U16, p, h);
    }
}

fn encode_dwords(b: &mut FunctionBuilder, ptr: Value, rgba: Value, count: usize) {
    let is_float = b.type_of(rgba) == Type::Float4;
    for channel in 0..count {
        let p = b.ptr_add_imm(ptr, channel as i32 * 4);
        let v = b.extract(rgba, channel as u8);
        if is_float {
            b.store(MemType::F32, p, v);
        } else {
            b.store(MemType::I32, p, v);
        }
    }
}

fn encode_1010102(b: &mut FunctionBuilder, ptr: Value, rgba: Value, numeric: Numeric) {
    let fields = [(0u8, 0i32, 1023i32), (1, 10, 1023), (2, 20, 1023), (3, 30, 3)];
    let zero = b.const_int(0);
    let word = b.var_init(zero);
    for (component, shift, max) in fields {
        let raw = match numeric {
            Numeric::Uint => {
                let v = b.extract(rgba, component);
                uclamp(b, v, max as u32)
            }
            _ => {
                let f = b.extract(rgba, component);
                let f = fclamp(b, f, 0.0, 1.0);
                let scale = b.const_float(max as f32);
                let f = b.fmul(f, scale);
                round_to_int(b, f)
            }
        };
        let shift_v = b.const_int(shift);
        let placed = b.shl(raw, shift_v);
        let acc = b.get(&word);
        let acc = b.or_(acc, placed);
        b.set(&word, acc);
    }
    let packed = b.get(&word);
    b.store(MemType::I32, ptr, packed);
}

fn encode_11_11_10(b: &mut FunctionBuilder, ptr: Value, rgba: Value) {
    let zero = b.const_int(0);
    let word = b.var_init(zero);
    let fields = [(0u8, 0i32, 4i32, 0x7FFi32), (1, 11, 4, 0x7FF), (2, 22, 5, 0x3FF)];
    for (component, shift, narrow, mask) in fields {
        let f = b.extract(rgba, component);
        // Unsigned format: negative inputs clamp to zero.
        let floor = b.const_float(0.0);
        let f = b.fmax(f, floor);
        let h = float_to_half(b, f);
        let narrow_v = b.const_int(narrow);
        let narrowed = b.lshr(h, narrow_v);
        let mask_v = b.const_int(mask);
        let field = b.and_(narrowed, mask_v);
        let shift_v = b.const_int(shift);
        let placed = b.shl(field, shift_v);
        let acc = b.get(&word);
        let acc = b.or_(acc, placed);
        b.set(&word, acc);
    }
    let packed = b.get(&word);
    b.store(MemType::I32, ptr, packed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::backend::{build, BuildOptions};
    use crate::reactor::ir::Type;

    /// Builds `decode(encode(x))` round-trip routines for a format and runs
    /// them over the provided values.
    fn roundtrip_floats(format: vk::Format, inputs: [f32; 4]) -> [f32; 4] {
        let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Ptr, Type::Ptr], Type::Void);
        let input_ptr = b.param(0);
        let texel_ptr = b.param(1);
        let output_ptr = b.param(2);
        let rgba = b.load(MemType::F32x4, input_ptr);
        encode(&mut b, format, texel_ptr, rgba).unwrap();
        let back = decode(&mut b, format, texel_ptr).unwrap();
        b.store(MemType::F32x4, output_ptr, back);
        b.ret(None);
        let func = b.finish();
        let routine = build(&func, "roundtrip", &BuildOptions::default()).unwrap();

        let f: extern "C" fn(*const f32, *mut u8, *mut f32) =
            unsafe { std::mem::transmute(routine.entry(0)) };
        let mut texel = [0u8; 16];
        let mut out = [0f32; 4];
        f(inputs.as_ptr(), texel.as_mut_ptr(), out.as_mut_ptr());
        out
    }

    #[test]
    fn test_unorm8_roundtrip_is_exact_on_representable_values() {
        let inputs = [0.0, 1.0, 128.0 / 255.0, 17.0 / 255.0];
        let out = roundtrip_floats(vk::Format::R8G8B8A8_UNORM, inputs);
        for (got, want) in out.iter().zip(inputs) {
            assert!((got - want).abs() < 1e-6, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_bgra_swaps_red_and_blue() {
        let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Ptr], Type::Void);
        let texel_ptr = b.param(0);
        let rgba = b.const_float4([1.0, 0.5, 0.0, 1.0]);
        encode(&mut b, vk::Format::B8G8R8A8_UNORM, texel_ptr, rgba).unwrap();
        b.ret(None);
        let func = b.finish();
        let routine = build(&func, "bgra", &BuildOptions::default()).unwrap();

        let f: extern "C" fn(*mut u8, *mut u8) = unsafe { std::mem::transmute(routine.entry(0)) };
        let mut texel = [0u8; 4];
        f(texel.as_mut_ptr(), std::ptr::null_mut());
        assert_eq!(texel, [0, 128, 255, 255]); // B, G, R, A in memory
    }

    #[test]
    fn test_half_roundtrip() {
        let inputs = [0.0, 1.0, -2.5, 0.125];
        let out = roundtrip_floats(vk::Format::R16G16B16A16_SFLOAT, inputs);
        for (got, want) in out.iter().zip(inputs) {
            assert!((got - want).abs() < 1e-3, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_unorm_encode_clamps() {
        let out = roundtrip_floats(vk::Format::R8G8B8A8_UNORM, [-0.5, 2.0, 0.25, 1.0]);
        assert_eq!(out[0], 0.0);
        assert_eq!(out[1], 1.0);
    }

    #[test]
    fn test_1010102_roundtrip() {
        let inputs = [0.0, 1.0, 512.0 / 1023.0, 2.0 / 3.0];
        let out = roundtrip_floats(vk::Format::A2B10G10R10_UNORM_PACK32, inputs);
        for (got, want) in out.iter().zip(inputs) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn test_unsupported_format_is_a_build_error() {
        let mut b = FunctionBuilder::new(&[Type::Ptr], Type::Void);
        let p = b.param(0);
        assert!(matches!(
            decode(&mut b, vk::Format::ASTC_4X4_UNORM_BLOCK, p),
            Err(BuildError::Unsupported(_))
        ));
    }
}
