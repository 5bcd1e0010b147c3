//! Setup routine generation
//!
//! Emitted ABI: `(primitive_out, triangle_in, polygon, draw_data) → bool`.
//! The routine transforms the clipped polygon to window space, derives the
//! pixel bounding box clamped to the scissor, builds one half-space edge
//! equation per polygon edge (inside is non-negative; a quarter-subpixel
//! bias on non-top-left edges realizes the fill rule), computes the
//! interpolation planes from the primitive's basis vertices, and applies the
//! depth bias terms. Returns false when the primitive is culled: back-facing,
//! zero area, fully outside the scissor, or with a non-positive w basis.
//!
//! Interpolation bases: triangles solve the plane through their three
//! vertices; lines interpolate along the segment only; points are flat.

use crate::device::primitive::{DrawData, Plane, Polygon, Primitive, TransformedVertex};
use crate::device::setup_processor::{SetupState, KIND_LINE, KIND_POINT, KIND_TRIANGLE};
use crate::pipeline::constants::MAX_CLIPPED_VERTICES;
use crate::reactor::backend::{self, BuildError, BuildOptions};
use crate::reactor::ir::{CmpOp, FCmpOp, MemType, Type, Value};
use crate::reactor::{FunctionBuilder, Routine, Var};
use std::mem::{offset_of, size_of};
use std::sync::Arc;

const VERTEX_SIZE: usize = size_of::<TransformedVertex>();
const PLANE_SIZE: usize = size_of::<Plane>();

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

fn fmax_var(b: &mut FunctionBuilder, var: &Var, v: Value) {
    let cur = b.get(var);
    let bigger = b.fmax(cur, v);
    b.set(var, bigger);
}

fn fmin_var(b: &mut FunctionBuilder, var: &Var, v: Value) {
    let cur = b.get(var);
    let smaller = b.fmin(cur, v);
    b.set(var, smaller);
}

fn store_plane(b: &mut FunctionBuilder, base: Value, offset: usize, a: Value, bb: Value, c: Value) {
    let pa = b.ptr_add_imm(base, offset as i32);
    b.store(MemType::F32, pa, a);
    let pb = b.ptr_add_imm(base, (offset + 4) as i32);
    b.store(MemType::F32, pb, bb);
    let pc = b.ptr_add_imm(base, (offset + 8) as i32);
    b.store(MemType::F32, pc, c);
}

/// Loads one f32 field of a triangle's basis vertex
fn vertex_f32(b: &mut FunctionBuilder, tri: Value, vertex: usize, offset: usize) -> Value {
    let p = b.ptr_add_imm(tri, (vertex * VERTEX_SIZE + offset) as i32);
    b.load(MemType::F32, p)
}

/// Generates the setup routine for one state key
pub fn generate(state: &SetupState, options: &BuildOptions) -> Result<Arc<Routine>, BuildError> {
    let kind = state.states.kind;
    let varying_count = state.states.varying_count as usize;

    let mut b = FunctionBuilder::new(&[Type::Ptr; 4], Type::Int);
    let prim = b.param(0);
    let tri = b.param(1);
    let poly = b.param(2);
    let data = b.param(3);

    let count = {
        let p = b.ptr_add_imm(poly, offset_of!(Polygon, count) as i32);
        b.load(MemType::I32, p)
    };
    let three = b.const_int(3);
    let too_small = b.icmp(CmpOp::Slt, count, three);
    b.if_then(too_small, |b| {
        let zero = b.const_int(0);
        b.ret(Some(zero));
    });

    // Viewport constants.
    let scale_x = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_scale) as i32);
        b.load(MemType::F32, p)
    };
    let scale_y = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_scale) as i32 + 4);
        b.load(MemType::F32, p)
    };
    let offset_x = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_offset) as i32);
        b.load(MemType::F32, p)
    };
    let offset_y = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, viewport_offset) as i32 + 4);
        b.load(MemType::F32, p)
    };

    // Window-space polygon vertices and the float bounding box.
    let xs = b.alloca((MAX_CLIPPED_VERTICES * 4) as u32);
    let ys = b.alloca((MAX_CLIPPED_VERTICES * 4) as u32);
    let big = b.const_float(1.0e30);
    let neg_big = b.const_float(-1.0e30);
    let min_x = b.var_init(big);
    let max_x = b.var_init(neg_big);
    let min_y = b.var_init(big);
    let max_y = b.var_init(neg_big);
    let degenerate = {
        let zero = b.const_int(0);
        b.var_init(zero)
    };

    let zero_i = b.const_int(0);
    b.for_range(zero_i, count, 1, |b, i| {
        let vp = b.ptr_index(poly, i, 16);
        let vertex = b.load(MemType::F32x4, vp);
        let w = b.extract(vertex, 3);
        let tiny = b.const_float(1.0e-6);
        let bad_w = b.fcmp(FCmpOp::Lt, w, tiny);
        b.if_then(bad_w, |b| {
            let one = b.const_int(1);
            b.set(&degenerate, one);
        });
        let one_f = b.const_float(1.0);
        let safe_w = b.fmax(w, tiny);
        let inv_w = b.fdiv(one_f, safe_w);

        let cx = b.extract(vertex, 0);
        let ndc_x = b.fmul(cx, inv_w);
        let wx = b.fmul(ndc_x, scale_x);
        let wx = b.fadd(wx, offset_x);
        let cy = b.extract(vertex, 1);
        let ndc_y = b.fmul(cy, inv_w);
        let wy = b.fmul(ndc_y, scale_y);
        let wy = b.fadd(wy, offset_y);

        let xp = b.ptr_index(xs, i, 4);
        b.store(MemType::F32, xp, wx);
        let yp = b.ptr_index(ys, i, 4);
        b.store(MemType::F32, yp, wy);

        fmin_var(b, &min_x, wx);
        fmax_var(b, &max_x, wx);
        fmin_var(b, &min_y, wy);
        fmax_var(b, &max_y, wy);
    });

    {
        let bad = b.get(&degenerate);
        let bad = b.int_to_bool(bad);
        b.if_then(bad, |b| {
            let zero = b.const_int(0);
            b.ret(Some(zero));
        });
    }

    // Integer pixel bounds: centers at k + 0.5 within [min, max], then the
    // scissor clamp.
    let half = b.const_float(0.5);
    let one_i = b.const_int(1);
    let minx_f = b.get(&min_x);
    let shifted = b.fsub(minx_f, half);
    let lo = ifloor(&mut b, shifted);
    let bb_min_x = b.add(lo, one_i);
    let maxx_f = b.get(&max_x);
    let shifted = b.fsub(maxx_f, half);
    let hi = ifloor(&mut b, shifted);
    let bb_max_x = b.add(hi, one_i);
    let miny_f = b.get(&min_y);
    let shifted = b.fsub(miny_f, half);
    let lo = ifloor(&mut b, shifted);
    let bb_min_y = b.add(lo, one_i);
    let maxy_f = b.get(&max_y);
    let shifted = b.fsub(maxy_f, half);
    let hi = ifloor(&mut b, shifted);
    let bb_max_y = b.add(hi, one_i);

    let clamp_lo = |b: &mut FunctionBuilder, v: Value, bound: Value| {
        let out = b.var_init(v);
        let below = b.icmp(CmpOp::Slt, v, bound);
        b.if_then(below, |b| b.set(&out, bound));
        b.get(&out)
    };
    let clamp_hi = |b: &mut FunctionBuilder, v: Value, bound: Value| {
        let out = b.var_init(v);
        let above = b.icmp(CmpOp::Sgt, v, bound);
        b.if_then(above, |b| b.set(&out, bound));
        b.get(&out)
    };

    let scissor_x0 = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, scissor_x0) as i32);
        b.load(MemType::I32, p)
    };
    let scissor_x1 = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, scissor_x1) as i32);
        b.load(MemType::I32, p)
    };
    let scissor_y0 = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, scissor_y0) as i32);
        b.load(MemType::I32, p)
    };
    let scissor_y1 = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, scissor_y1) as i32);
        b.load(MemType::I32, p)
    };

    let bb_min_x = clamp_lo(&mut b, bb_min_x, scissor_x0);
    let bb_max_x = clamp_hi(&mut b, bb_max_x, scissor_x1);
    let bb_min_y = clamp_lo(&mut b, bb_min_y, scissor_y0);
    let bb_max_y = clamp_hi(&mut b, bb_max_y, scissor_y1);

    let empty_x = b.icmp(CmpOp::Sge, bb_min_x, bb_max_x);
    b.if_then(empty_x, |b| {
        let zero = b.const_int(0);
        b.ret(Some(zero));
    });
    let empty_y = b.icmp(CmpOp::Sge, bb_min_y, bb_max_y);
    b.if_then(empty_y, |b| {
        let zero = b.const_int(0);
        b.ret(Some(zero));
    });

    // Signed polygon area (shoelace). In window coordinates (y down) a
    // negative sum is counter-clockwise on screen.
    let zero_f = b.const_float(0.0);
    let area2 = b.var_init(zero_f);
    b.for_range(zero_i, count, 1, |b, i| {
        let j = {
            let next = b.add(i, one_i);
            let wrapped = b.var_init(next);
            let at_end = b.icmp(CmpOp::Sge, next, count);
            b.if_then(at_end, |b| {
                let zero = b.const_int(0);
                b.set(&wrapped, zero);
            });
            b.get(&wrapped)
        };
        let xi = {
            let p = b.ptr_index(xs, i, 4);
            b.load(MemType::F32, p)
        };
        let yi = {
            let p = b.ptr_index(ys, i, 4);
            b.load(MemType::F32, p)
        };
        let xj = {
            let p = b.ptr_index(xs, j, 4);
            b.load(MemType::F32, p)
        };
        let yj = {
            let p = b.ptr_index(ys, j, 4);
            b.load(MemType::F32, p)
        };
        let cross_a = b.fmul(xi, yj);
        let cross_b = b.fmul(xj, yi);
        let cross = b.fsub(cross_a, cross_b);
        let acc = b.get(&area2);
        let acc = b.fadd(acc, cross);
        b.set(&area2, acc);
    });

    let area = b.get(&area2);
    let flat = b.fcmp(FCmpOp::Eq, area, zero_f);
    b.if_then(flat, |b| {
        let zero = b.const_int(0);
        b.ret(Some(zero));
    });

    let facing = if kind == KIND_TRIANGLE {
        // Facing: screen counter-clockwise is a negative shoelace sum.
        let screen_ccw = b.fcmp(FCmpOp::Lt, area, zero_f);
        let front = if state.states.front_ccw != 0 {
            screen_ccw
        } else {
            b.not(screen_ccw)
        };
        let cull_front = state.states.cull_mode & 0b01 != 0;
        let cull_back = state.states.cull_mode & 0b10 != 0;
        if cull_front {
            b.if_then(front, |b| {
                let zero = b.const_int(0);
                b.ret(Some(zero));
            });
        }
        if cull_back {
            let back = b.not(front);
            b.if_then(back, |b| {
                let zero = b.const_int(0);
                b.ret(Some(zero));
            });
        }
        b.bool_to_int(front)
    } else {
        b.const_int(1)
    };
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, facing) as i32);
    b.store(MemType::I32, p, facing);

    // Edge equations, inside non-negative. The orientation flip makes both
    // windings rasterize; the quarter-subpixel bias on non-top-left edges
    // breaks shared-edge ties.
    let positive_area = b.fcmp(FCmpOp::Gt, area, zero_f);
    let orient = {
        let out = b.var(Type::Float);
        let plus = b.const_float(1.0);
        let minus = b.const_float(-1.0);
        b.if_then_else(positive_area, |b| b.set(&out, plus), |b| b.set(&out, minus));
        b.get(&out)
    };

    b.for_range(zero_i, count, 1, |b, i| {
        let j = {
            let next = b.add(i, one_i);
            let wrapped = b.var_init(next);
            let at_end = b.icmp(CmpOp::Sge, next, count);
            b.if_then(at_end, |b| {
                let zero = b.const_int(0);
                b.set(&wrapped, zero);
            });
            b.get(&wrapped)
        };
        let x0 = {
            let p = b.ptr_index(xs, i, 4);
            b.load(MemType::F32, p)
        };
        let y0 = {
            let p = b.ptr_index(ys, i, 4);
            b.load(MemType::F32, p)
        };
        let x1 = {
            let p = b.ptr_index(xs, j, 4);
            b.load(MemType::F32, p)
        };
        let y1 = {
            let p = b.ptr_index(ys, j, 4);
            b.load(MemType::F32, p)
        };

        let a_raw = b.fsub(y0, y1);
        let a = b.fmul(a_raw, orient);
        let b_raw = b.fsub(x1, x0);
        let bb = b.fmul(b_raw, orient);
        let ax = b.fmul(a, x0);
        let by = b.fmul(bb, y0);
        let sum = b.fadd(ax, by);
        let c = b.fneg(sum);

        // Fill-rule bias for edges that are neither top nor left.
        let zero = b.const_float(0.0);
        let a_pos = b.fcmp(FCmpOp::Gt, a, zero);
        let a_zero = b.fcmp(FCmpOp::Eq, a, zero);
        let b_pos = b.fcmp(FCmpOp::Gt, bb, zero);
        let horizontal_top = b.and_(a_zero, b_pos);
        let top_left = b.or_(a_pos, horizontal_top);
        let biased_c = b.var_init(c);
        let not_top_left = b.not(top_left);
        b.if_then(not_top_left, |b| {
            let abs_a = b.fabs(a);
            let abs_b = b.fabs(bb);
            let scale = b.fadd(abs_a, abs_b);
            let eps = b.const_float(1.0 / 256.0);
            let bias = b.fmul(scale, eps);
            let adjusted = b.fsub(c, bias);
            b.set(&biased_c, adjusted);
        });
        let c = b.get(&biased_c);

        let edge_offset = offset_of!(Primitive, edges) as i32;
        let edge_base = b.ptr_add_imm(prim, edge_offset);
        let edge_ptr = b.ptr_index(edge_base, i, PLANE_SIZE as u32);
        b.store(MemType::F32, edge_ptr, a);
        let pb = b.ptr_add_imm(edge_ptr, 4);
        b.store(MemType::F32, pb, bb);
        let pc = b.ptr_add_imm(edge_ptr, 8);
        b.store(MemType::F32, pc, c);
    });

    // Store bounds and edge count.
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, min_x) as i32);
    b.store(MemType::I32, p, bb_min_x);
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, max_x) as i32);
    b.store(MemType::I32, p, bb_max_x);
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, min_y) as i32);
    b.store(MemType::I32, p, bb_min_y);
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, max_y) as i32);
    b.store(MemType::I32, p, bb_max_y);
    let p = b.ptr_add_imm(prim, offset_of!(Primitive, edge_count) as i32);
    b.store(MemType::I32, p, count);

    // Interpolation planes from the basis vertices.
    emit_gradients(&mut b, state, kind, varying_count, prim, tri, data, scale_x, scale_y, offset_x, offset_y)?;

    let one = b.const_int(1);
    b.ret(Some(one));
    let func = b.finish();
    backend::build(&func, "setup_routine", options)
}

/// Emits the plane computations for 1/w, window z, and the varyings
#[allow(clippy::too_many_arguments)]
fn emit_gradients(
    b: &mut FunctionBuilder,
    state: &SetupState,
    kind: u32,
    varying_count: usize,
    prim: Value,
    tri: Value,
    data: Value,
    scale_x: Value,
    scale_y: Value,
    offset_x: Value,
    offset_y: Value,
) -> Result<(), BuildError> {
    let pos_off = offset_of!(TransformedVertex, position);
    let depth_near = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, depth_near) as i32);
        b.load(MemType::F32, p)
    };
    let depth_range = {
        let p = b.ptr_add_imm(data, offset_of!(DrawData, depth_range) as i32);
        b.load(MemType::F32, p)
    };

    // Per basis vertex: window x/y, 1/w, window z.
    let basis = match kind {
        KIND_TRIANGLE => 3,
        KIND_LINE => 2,
        _ => 1,
    };
    let mut wx = Vec::new();
    let mut wy = Vec::new();
    let mut rhw = Vec::new();
    let mut wz = Vec::new();
    for v in 0..basis {
        let x = vertex_f32(b, tri, v, pos_off);
        let y = vertex_f32(b, tri, v, pos_off + 4);
        let z = vertex_f32(b, tri, v, pos_off + 8);
        let w = vertex_f32(b, tri, v, pos_off + 12);

        let tiny = b.const_float(1.0e-6);
        let bad = b.fcmp(FCmpOp::Lt, w, tiny);
        b.if_then(bad, |b| {
            let zero = b.const_int(0);
            b.ret(Some(zero));
        });
        let one = b.const_float(1.0);
        let inv_w = b.fdiv(one, w);

        let ndc_x = b.fmul(x, inv_w);
        let window_x = b.fmul(ndc_x, scale_x);
        let window_x = b.fadd(window_x, offset_x);
        let ndc_y = b.fmul(y, inv_w);
        let window_y = b.fmul(ndc_y, scale_y);
        let window_y = b.fadd(window_y, offset_y);
        let ndc_z = b.fmul(z, inv_w);
        let window_z = b.fmul(ndc_z, depth_range);
        let window_z = b.fadd(window_z, depth_near);

        wx.push(window_x);
        wy.push(window_y);
        rhw.push(inv_w);
        wz.push(window_z);
    }

    // Plane builder per interpolated quantity.
    enum Basis {
        Triangle { inv_det: Value },
        Line { gx: Value, gy: Value },
        Point,
    }

    let basis_kind = match kind {
        KIND_TRIANGLE => {
            let dx1 = b.fsub(wx[1], wx[0]);
            let dy1 = b.fsub(wy[1], wy[0]);
            let dx2 = b.fsub(wx[2], wx[0]);
            let dy2 = b.fsub(wy[2], wy[0]);
            let m0 = b.fmul(dx1, dy2);
            let m1 = b.fmul(dx2, dy1);
            let det = b.fsub(m0, m1);
            let zero = b.const_float(0.0);
            let flat = b.fcmp(FCmpOp::Eq, det, zero);
            b.if_then(flat, |b| {
                let zero = b.const_int(0);
                b.ret(Some(zero));
            });
            let one = b.const_float(1.0);
            let inv_det = b.fdiv(one, det);
            Basis::Triangle { inv_det }
        }
        KIND_LINE => {
            let dx = b.fsub(wx[1], wx[0]);
            let dy = b.fsub(wy[1], wy[0]);
            let dx2 = b.fmul(dx, dx);
            let dy2 = b.fmul(dy, dy);
            let len2 = b.fadd(dx2, dy2);
            let zero = b.const_float(0.0);
            let degenerate = b.fcmp(FCmpOp::Eq, len2, zero);
            b.if_then(degenerate, |b| {
                let zero = b.const_int(0);
                b.ret(Some(zero));
            });
            let gx = b.fdiv(dx, len2);
            let gy = b.fdiv(dy, len2);
            Basis::Line { gx, gy }
        }
        _ => Basis::Point,
    };

    let dx1 = if basis >= 2 { Some(b.fsub(wx[1], wx[0])) } else { None };
    let dy1 = if basis >= 2 { Some(b.fsub(wy[1], wy[0])) } else { None };
    let dx2 = if basis >= 3 { Some(b.fsub(wx[2], wx[0])) } else { None };
    let dy2 = if basis >= 3 { Some(b.fsub(wy[2], wy[0])) } else { None };

    let plane_of = |b: &mut FunctionBuilder, values: &[Value]| -> (Value, Value, Value) {
        match &basis_kind {
            Basis::Triangle { inv_det } => {
                let df1 = b.fsub(values[1], values[0]);
                let df2 = b.fsub(values[2], values[0]);
                let t0 = b.fmul(df1, dy2.unwrap());
                let t1 = b.fmul(df2, dy1.unwrap());
                let num_a = b.fsub(t0, t1);
                let a = b.fmul(num_a, *inv_det);
                let t2 = b.fmul(df2, dx1.unwrap());
                let t3 = b.fmul(df1, dx2.unwrap());
                let num_b = b.fsub(t2, t3);
                let bb = b.fmul(num_b, *inv_det);
                let ax = b.fmul(a, wx[0]);
                let by = b.fmul(bb, wy[0]);
                let sum = b.fadd(ax, by);
                let c = b.fsub(values[0], sum);
                (a, bb, c)
            }
            Basis::Line { gx, gy } => {
                let df = b.fsub(values[1], values[0]);
                let a = b.fmul(df, *gx);
                let bb = b.fmul(df, *gy);
                let ax = b.fmul(a, wx[0]);
                let by = b.fmul(bb, wy[0]);
                let sum = b.fadd(ax, by);
                let c = b.fsub(values[0], sum);
                (a, bb, c)
            }
            Basis::Point => {
                let zero = b.const_float(0.0);
                (zero, zero, values[0])
            }
        }
    };

    // 1/w plane.
    let (a, bb, c) = plane_of(b, &rhw);
    store_plane(b, prim, offset_of!(Primitive, w_plane), a, bb, c);

    // Window z plane, with the slope-scaled bias folded into the constant.
    let (a, bb, mut c) = plane_of(b, &wz);
    if state.states.slope_depth_bias_used != 0 {
        let slope = {
            let p = b.ptr_add_imm(data, offset_of!(DrawData, slope_depth_bias) as i32);
            b.load(MemType::F32, p)
        };
        let abs_a = b.fabs(a);
        let abs_b = b.fabs(bb);
        let m = b.fmax(abs_a, abs_b);
        let bias = b.fmul(slope, m);
        c = b.fadd(c, bias);
    }
    store_plane(b, prim, offset_of!(Primitive, z_plane), a, bb, c);

    // Varying planes, premultiplied by 1/w for perspective correction.
    let varying_off = offset_of!(TransformedVertex, varyings);
    for varying in 0..varying_count {
        for component in 0..4 {
            let field = varying_off + varying * 16 + component * 4;
            let mut values = Vec::new();
            for v in 0..basis {
                let raw = vertex_f32(b, tri, v, field);
                let premultiplied = b.fmul(raw, rhw[v]);
                values.push(premultiplied);
            }
            let (a, bb, c) = plane_of(b, &values);
            let offset = offset_of!(Primitive, varying_planes)
                + (varying * 4 + component) * PLANE_SIZE;
            store_plane(b, prim, offset, a, bb, c);
        }
    }

    Ok(())
}
