//! IR optimization passes
//!
//! The optimizing backend runs these before lowering: constant folding,
//! algebraic simplification, block-local common-subexpression elimination,
//! and dead-code elimination. The pass set and iteration count scale with
//! [`OptLevel`](super::backend::OptLevel).
//!
//! Replaced instructions are never deleted from the arena; uses are rewritten
//! and DCE drops unreferenced instructions from the block lists.

use super::backend::OptLevel;
use super::ir::{CmpOp, FCmpOp, Function, Op, Terminator, Value};
use std::collections::HashMap;

/// Runs the pass pipeline for the given level
pub fn run(func: &mut Function, level: OptLevel) {
    let iterations = match level {
        OptLevel::None => return,
        OptLevel::Less | OptLevel::Default => 1,
        OptLevel::Aggressive => 4,
    };

    for _ in 0..iterations {
        let mut replacements = HashMap::new();
        fold_constants(func);
        if level >= OptLevel::Default {
            simplify_algebra(func, &mut replacements);
        }
        apply_replacements(func, &replacements);
        if level >= OptLevel::Default {
            local_cse(func);
        }
        eliminate_dead_code(func);
    }
}

fn resolve(map: &HashMap<Value, Value>, mut value: Value) -> Value {
    while let Some(&next) = map.get(&value) {
        if next == value {
            break;
        }
        value = next;
    }
    value
}

fn apply_replacements(func: &mut Function, map: &HashMap<Value, Value>) {
    if map.is_empty() {
        return;
    }
    let resolve = |v: Value| resolve(map, v);
    for inst in &mut func.insts {
        inst.op.map_operands(&resolve);
    }
    for block in &mut func.blocks {
        match &mut block.term {
            Some(Terminator::CondBr(cond, _, _)) => *cond = resolve(*cond),
            Some(Terminator::Ret(Some(value))) => *value = resolve(*value),
            _ => {}
        }
    }
}

fn as_const_int(func: &Function, value: Value) -> Option<i32> {
    match func.op_of(value) {
        Op::ConstInt(v) => Some(*v),
        _ => None,
    }
}

fn as_const_float(func: &Function, value: Value) -> Option<f32> {
    match func.op_of(value) {
        Op::ConstFloat(bits) => Some(f32::from_bits(*bits)),
        _ => None,
    }
}

fn fold_constants(func: &mut Function) {
    for index in 0..func.insts.len() {
        let folded = {
            let op = &func.insts[index].op;
            match op {
                Op::Add(a, b) => fold_int(func, *a, *b, i32::wrapping_add),
                Op::Sub(a, b) => fold_int(func, *a, *b, i32::wrapping_sub),
                Op::Mul(a, b) => fold_int(func, *a, *b, i32::wrapping_mul),
                Op::And(a, b) => fold_int(func, *a, *b, |x, y| x & y),
                Op::Or(a, b) => fold_int(func, *a, *b, |x, y| x | y),
                Op::Xor(a, b) => fold_int(func, *a, *b, |x, y| x ^ y),
                Op::Shl(a, b) => fold_int(func, *a, *b, |x, y| x.wrapping_shl(y as u32)),
                Op::AShr(a, b) => fold_int(func, *a, *b, |x, y| x.wrapping_shr(y as u32)),
                Op::LShr(a, b) => {
                    fold_int(func, *a, *b, |x, y| ((x as u32) >> (y as u32 & 31)) as i32)
                }
                Op::ICmp(op, a, b) => {
                    let (x, y) = (as_const_int(func, *a), as_const_int(func, *b));
                    match (x, y) {
                        (Some(x), Some(y)) => {
                            let r = match op {
                                CmpOp::Eq => x == y,
                                CmpOp::Ne => x != y,
                                CmpOp::Slt => x < y,
                                CmpOp::Sle => x <= y,
                                CmpOp::Sgt => x > y,
                                CmpOp::Sge => x >= y,
                                CmpOp::Ult => (x as u32) < (y as u32),
                                CmpOp::Uge => (x as u32) >= (y as u32),
                            };
                            Some(Op::ConstInt(i32::from(r)))
                        }
                        _ => None,
                    }
                }
                Op::FAdd(a, b) => fold_float(func, *a, *b, |x, y| x + y),
                Op::FSub(a, b) => fold_float(func, *a, *b, |x, y| x - y),
                Op::FMul(a, b) => fold_float(func, *a, *b, |x, y| x * y),
                Op::FDiv(a, b) => fold_float(func, *a, *b, |x, y| x / y),
                Op::FCmp(op, a, b) => {
                    let (x, y) = (as_const_float(func, *a), as_const_float(func, *b));
                    match (x, y) {
                        (Some(x), Some(y)) => {
                            let r = match op {
                                FCmpOp::Eq => x == y,
                                FCmpOp::Ne => x != y || x.is_nan() || y.is_nan(),
                                FCmpOp::Lt => x < y,
                                FCmpOp::Le => x <= y,
                                FCmpOp::Gt => x > y,
                                FCmpOp::Ge => x >= y,
                            };
                            Some(Op::ConstInt(i32::from(r)))
                        }
                        _ => None,
                    }
                }
                Op::IToF(a) => as_const_int(func, *a).map(|v| Op::ConstFloat((v as f32).to_bits())),
                Op::FToI(a) => as_const_float(func, *a).map(|v| Op::ConstInt(v as i32)),
                Op::Splat(a) => {
                    if let Some(v) = as_const_int(func, *a) {
                        Some(Op::ConstInt4([v; 4]))
                    } else {
                        as_const_float(func, *a).map(|v| Op::ConstFloat4([v.to_bits(); 4]))
                    }
                }
                _ => None,
            }
        };

        if let Some(op) = folded {
            func.insts[index].op = op;
        }
    }
}

fn fold_int(func: &Function, a: Value, b: Value, op: impl Fn(i32, i32) -> i32) -> Option<Op> {
    let x = as_const_int(func, a)?;
    let y = as_const_int(func, b)?;
    Some(Op::ConstInt(op(x, y)))
}

fn fold_float(func: &Function, a: Value, b: Value, op: impl Fn(f32, f32) -> f32) -> Option<Op> {
    let x = as_const_float(func, a)?;
    let y = as_const_float(func, b)?;
    Some(Op::ConstFloat(op(x, y).to_bits()))
}

fn simplify_algebra(func: &mut Function, replacements: &mut HashMap<Value, Value>) {
    for index in 0..func.insts.len() {
        let this = Value(index as u32);
        let replacement = {
            let op = &func.insts[index].op;
            match op {
                Op::Add(a, b) | Op::Or(a, b) | Op::Xor(a, b) => {
                    if as_const_int(func, *b) == Some(0) {
                        Some(*a)
                    } else if as_const_int(func, *a) == Some(0) {
                        Some(*b)
                    } else {
                        None
                    }
                }
                Op::Sub(a, b) | Op::Shl(a, b) | Op::AShr(a, b) | Op::LShr(a, b) => {
                    if as_const_int(func, *b) == Some(0) {
                        Some(*a)
                    } else {
                        None
                    }
                }
                Op::Mul(a, b) => {
                    if as_const_int(func, *b) == Some(1) {
                        Some(*a)
                    } else if as_const_int(func, *a) == Some(1) {
                        Some(*b)
                    } else {
                        None
                    }
                }
                Op::FMul(a, b) => {
                    if as_const_float(func, *b) == Some(1.0) {
                        Some(*a)
                    } else if as_const_float(func, *a) == Some(1.0) {
                        Some(*b)
                    } else {
                        None
                    }
                }
                Op::FAdd(a, b) => {
                    // Exact only for +0.0 on the right.
                    if as_const_float(func, *b) == Some(0.0)
                        && as_const_float(func, *b).map(f32::is_sign_positive) == Some(true)
                    {
                        Some(*a)
                    } else if as_const_float(func, *a) == Some(0.0)
                        && as_const_float(func, *a).map(f32::is_sign_positive) == Some(true)
                    {
                        Some(*b)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(value) = replacement {
            if value != this {
                replacements.insert(this, value);
            }
        }
    }
}

fn local_cse(func: &mut Function) {
    #[derive(PartialEq)]
    struct Key(Op);
    impl Eq for Key {}
    impl std::hash::Hash for Key {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            // Cheap discriminant + operand hash; equality does the real work.
            std::mem::discriminant(&self.0).hash(state);
            for operand in self.0.operands() {
                operand.0.hash(state);
            }
        }
    }

    let mut replacements = HashMap::new();
    for block in &func.blocks {
        let mut seen: HashMap<Key, Value> = HashMap::new();
        for &value in &block.insts {
            let inst = &func.insts[value.0 as usize];
            // Loads are never forwarded; stores may intervene.
            if inst.op.has_side_effects() || matches!(inst.op, Op::Load(..) | Op::Param(_)) {
                continue;
            }
            match seen.entry(Key(inst.op.clone())) {
                std::collections::hash_map::Entry::Occupied(existing) => {
                    replacements.insert(value, *existing.get());
                }
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(value);
                }
            }
        }
    }
    apply_replacements(func, &replacements);
}

fn eliminate_dead_code(func: &mut Function) {
    let mut live = vec![false; func.insts.len()];
    let mut work = Vec::new();

    for block in &func.blocks {
        for &value in &block.insts {
            if func.insts[value.0 as usize].op.has_side_effects() {
                work.push(value);
            }
        }
        match &block.term {
            Some(Terminator::CondBr(cond, _, _)) => work.push(*cond),
            Some(Terminator::Ret(Some(value))) => work.push(*value),
            _ => {}
        }
    }

    while let Some(value) = work.pop() {
        if std::mem::replace(&mut live[value.0 as usize], true) {
            continue;
        }
        work.extend(func.insts[value.0 as usize].op.operands());
    }

    for block in &mut func.blocks {
        block.insts.retain(|v| live[v.0 as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::builder::FunctionBuilder;
    use crate::reactor::ir::Type;

    #[test]
    fn test_constant_folding_collapses_arithmetic() {
        let mut b = FunctionBuilder::new(&[], Type::Int);
        let two = b.const_int(2);
        let three = b.const_int(3);
        let sum = b.add(two, three);
        b.ret(Some(sum));
        let mut func = b.finish();

        run(&mut func, OptLevel::Default);
        assert_eq!(*func.op_of(sum), Op::ConstInt(5));
    }

    #[test]
    fn test_dead_code_is_dropped() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let p = b.param(0);
        let unused = b.add(p, p);
        let _ = b.mul(unused, unused); // also dead
        b.ret(Some(p));
        let mut func = b.finish();

        let before = func.blocks[0].insts.len();
        run(&mut func, OptLevel::Less);
        assert!(func.blocks[0].insts.len() < before);
    }

    #[test]
    fn test_cse_reuses_duplicate_expressions() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let p = b.param(0);
        let a = b.add(p, p);
        let c = b.add(p, p);
        let sum = b.add(a, c);
        b.ret(Some(sum));
        let mut func = b.finish();

        run(&mut func, OptLevel::Default);
        let operands = func.op_of(sum).operands();
        assert_eq!(operands[0], operands[1]);
    }

    #[test]
    fn test_mul_by_one_simplifies() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let p = b.param(0);
        let one = b.const_int(1);
        let product = b.mul(p, one);
        b.ret(Some(product));
        let mut func = b.finish();

        run(&mut func, OptLevel::Default);
        match func.blocks[0].term.as_ref().unwrap() {
            Terminator::Ret(Some(value)) => assert_eq!(*value, p),
            other => panic!("unexpected terminator {other:?}"),
        }
    }
}
