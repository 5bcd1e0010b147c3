//! Function builder with structured control flow
//!
//! Stage generators never touch blocks or terminators directly; they build
//! straight-line expressions and use `if_then` / `if_then_else` /
//! `while_loop` / `do_until` / `for_range`, which may nest freely. Values
//! that cross control flow live in [`Var`] stack slots.
//!
//! All type mismatches are programmer errors and panic immediately.

use super::ir::{
    Block, BlockId, CmpOp, FCmpOp, Function, Inst, MemType, Op, Terminator, Type, Value,
};

/// A mutable stack-slot variable
#[derive(Debug, Clone, Copy)]
pub struct Var {
    slot: Value,
    ty: Type,
}

impl Var {
    /// The variable's value type
    pub fn ty(&self) -> Type {
        self.ty
    }
}

/// Builds one function from entry to `finish`
pub struct FunctionBuilder {
    func: Function,
    current: BlockId,
    params: Vec<Value>,
}

impl FunctionBuilder {
    /// Starts a function with the given parameter and return types; the
    /// insertion point is the empty entry block.
    pub fn new(params: &[Type], ret: Type) -> Self {
        let mut func = Function::new(params, ret);
        let mut param_values = Vec::with_capacity(params.len());
        for (index, &ty) in params.iter().enumerate() {
            assert!(
                matches!(ty, Type::Int | Type::Long | Type::Ptr),
                "function parameters must be integer or pointer typed"
            );
            let value = Value(func.insts.len() as u32);
            func.insts.push(Inst {
                op: Op::Param(index as u32),
                ty,
            });
            func.blocks[0].insts.push(value);
            param_values.push(value);
        }
        Self {
            func,
            current: BlockId(0),
            params: param_values,
        }
    }

    /// The `index`-th parameter value
    pub fn param(&self, index: usize) -> Value {
        self.params[index]
    }

    /// Result type of a previously built value
    pub fn type_of(&self, value: Value) -> Type {
        self.func.type_of(value)
    }

    fn push(&mut self, op: Op, ty: Type) -> Value {
        let value = Value(self.func.insts.len() as u32);
        self.func.insts.push(Inst { op, ty });
        self.func.blocks[self.current.0 as usize].insts.push(value);
        value
    }

    fn expect(&self, value: Value, ty: Type) {
        let actual = self.func.type_of(value);
        assert!(
            actual == ty,
            "type mismatch: expected {ty:?}, found {actual:?}"
        );
    }

    fn expect_same(&self, a: Value, b: Value) -> Type {
        let ta = self.func.type_of(a);
        let tb = self.func.type_of(b);
        assert!(ta == tb, "type mismatch between operands: {ta:?} vs {tb:?}");
        ta
    }

    // ---- constants -------------------------------------------------------

    /// 32-bit integer constant
    pub fn const_int(&mut self, v: i32) -> Value {
        self.push(Op::ConstInt(v), Type::Int)
    }

    /// 64-bit integer constant
    pub fn const_long(&mut self, v: i64) -> Value {
        self.push(Op::ConstLong(v), Type::Long)
    }

    /// Float constant
    pub fn const_float(&mut self, v: f32) -> Value {
        self.push(Op::ConstFloat(v.to_bits()), Type::Float)
    }

    /// Integer vector constant
    pub fn const_int4(&mut self, v: [i32; 4]) -> Value {
        self.push(Op::ConstInt4(v), Type::Int4)
    }

    /// Float vector constant
    pub fn const_float4(&mut self, v: [f32; 4]) -> Value {
        self.push(Op::ConstFloat4(v.map(f32::to_bits)), Type::Float4)
    }

    /// Float vector constant with all lanes equal
    pub fn const_splat(&mut self, v: f32) -> Value {
        self.const_float4([v; 4])
    }

    /// Integer vector constant with all lanes equal
    pub fn const_splat_int(&mut self, v: i32) -> Value {
        self.const_int4([v; 4])
    }

    /// Embedded host pointer
    pub fn const_ptr<T>(&mut self, p: *const T) -> Value {
        self.push(Op::ConstPtr(p as u64), Type::Ptr)
    }

    /// `true` / `false` constant
    pub fn const_bool(&mut self, v: bool) -> Value {
        let value = self.push(Op::ConstInt(i32::from(v)), Type::Bool);
        value
    }

    // ---- scalar integer --------------------------------------------------

    /// Integer add
    pub fn add(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::Add(a, b), Type::Int)
    }

    /// Integer subtract
    pub fn sub(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::Sub(a, b), Type::Int)
    }

    /// Integer multiply
    pub fn mul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::Mul(a, b), Type::Int)
    }

    /// Bitwise and (integers and booleans)
    pub fn and_(&mut self, a: Value, b: Value) -> Value {
        let ty = self.expect_same(a, b);
        assert!(matches!(ty, Type::Int | Type::Bool));
        self.push(Op::And(a, b), ty)
    }

    /// Bitwise or (integers and booleans)
    pub fn or_(&mut self, a: Value, b: Value) -> Value {
        let ty = self.expect_same(a, b);
        assert!(matches!(ty, Type::Int | Type::Bool));
        self.push(Op::Or(a, b), ty)
    }

    /// Bitwise xor
    pub fn xor_(&mut self, a: Value, b: Value) -> Value {
        let ty = self.expect_same(a, b);
        assert!(matches!(ty, Type::Int | Type::Bool));
        self.push(Op::Xor(a, b), ty)
    }

    /// Boolean negation
    pub fn not(&mut self, a: Value) -> Value {
        self.expect(a, Type::Bool);
        let one = self.push(Op::ConstInt(1), Type::Bool);
        self.push(Op::Xor(a, one), Type::Bool)
    }

    /// Shift left
    pub fn shl(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::Shl(a, b), Type::Int)
    }

    /// Arithmetic shift right
    pub fn ashr(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::AShr(a, b), Type::Int)
    }

    /// Logical shift right
    pub fn lshr(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int);
        self.expect(b, Type::Int);
        self.push(Op::LShr(a, b), Type::Int)
    }

    /// Integer comparison
    pub fn icmp(&mut self, op: CmpOp, a: Value, b: Value) -> Value {
        let ty = self.expect_same(a, b);
        assert!(matches!(ty, Type::Int | Type::Long | Type::Ptr | Type::Bool));
        self.push(Op::ICmp(op, a, b), Type::Bool)
    }

    // ---- scalar float ----------------------------------------------------

    /// Float add
    pub fn fadd(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FAdd(a, b), Type::Float)
    }

    /// Float subtract
    pub fn fsub(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FSub(a, b), Type::Float)
    }

    /// Float multiply
    pub fn fmul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FMul(a, b), Type::Float)
    }

    /// Float divide
    pub fn fdiv(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FDiv(a, b), Type::Float)
    }

    /// Float minimum
    pub fn fmin(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FMin(a, b), Type::Float)
    }

    /// Float maximum
    pub fn fmax(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FMax(a, b), Type::Float)
    }

    /// Float square root
    pub fn fsqrt(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float);
        self.push(Op::FSqrt(a), Type::Float)
    }

    /// Float negation
    pub fn fneg(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float);
        let bits = self.push(Op::Bitcast(Type::Int, a), Type::Int);
        let sign = self.const_int(i32::MIN);
        let flipped = self.push(Op::Xor(bits, sign), Type::Int);
        self.push(Op::Bitcast(Type::Float, flipped), Type::Float)
    }

    /// Float absolute value
    pub fn fabs(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float);
        let bits = self.push(Op::Bitcast(Type::Int, a), Type::Int);
        let mask = self.const_int(i32::MAX);
        let cleared = self.push(Op::And(bits, mask), Type::Int);
        self.push(Op::Bitcast(Type::Float, cleared), Type::Float)
    }

    /// Float comparison
    pub fn fcmp(&mut self, op: FCmpOp, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float);
        self.expect(b, Type::Float);
        self.push(Op::FCmp(op, a, b), Type::Bool)
    }

    // ---- conversions -----------------------------------------------------

    /// Int → Float
    pub fn itof(&mut self, a: Value) -> Value {
        self.expect(a, Type::Int);
        self.push(Op::IToF(a), Type::Float)
    }

    /// Float → Int, truncating toward zero
    pub fn ftoi(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float);
        self.push(Op::FToI(a), Type::Int)
    }

    /// Int → Long sign extension
    pub fn itol(&mut self, a: Value) -> Value {
        self.expect(a, Type::Int);
        self.push(Op::IToL(a), Type::Long)
    }

    /// Long → Int truncation
    pub fn ltoi(&mut self, a: Value) -> Value {
        self.expect(a, Type::Long);
        self.push(Op::LToI(a), Type::Int)
    }

    /// Reinterpret bits between same-width types
    pub fn bitcast(&mut self, ty: Type, a: Value) -> Value {
        let from = self.func.type_of(a);
        assert!(
            from.size() == ty.size() && from != ty,
            "bitcast requires distinct same-width types ({from:?} → {ty:?})"
        );
        self.push(Op::Bitcast(ty, a), ty)
    }

    /// Bool → Int (0/1)
    pub fn bool_to_int(&mut self, a: Value) -> Value {
        self.expect(a, Type::Bool);
        let zero = self.const_int(0);
        self.push(Op::Or(a, zero), Type::Int)
    }

    /// Int → Bool (nonzero test)
    pub fn int_to_bool(&mut self, a: Value) -> Value {
        self.expect(a, Type::Int);
        let zero = self.const_int(0);
        self.icmp(CmpOp::Ne, a, zero)
    }

    // ---- SIMD integer ----------------------------------------------------

    /// Lane-wise integer add
    pub fn vadd(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VAdd(a, b), Type::Int4)
    }

    /// Lane-wise integer subtract
    pub fn vsub(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VSub(a, b), Type::Int4)
    }

    /// Lane-wise integer multiply
    pub fn vmul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VMul(a, b), Type::Int4)
    }

    /// Lane-wise and
    pub fn vand(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VAnd(a, b), Type::Int4)
    }

    /// Lane-wise or
    pub fn vor(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VOr(a, b), Type::Int4)
    }

    /// Lane-wise xor
    pub fn vxor(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VXor(a, b), Type::Int4)
    }

    /// Lane-wise complement
    pub fn vnot(&mut self, a: Value) -> Value {
        self.expect(a, Type::Int4);
        let ones = self.const_int4([-1; 4]);
        self.push(Op::VXor(a, ones), Type::Int4)
    }

    /// Lane-wise shift left by an immediate
    pub fn vshl_imm(&mut self, a: Value, bits: u8) -> Value {
        self.expect(a, Type::Int4);
        self.push(Op::VShlImm(a, bits), Type::Int4)
    }

    /// Lane-wise arithmetic shift right by an immediate
    pub fn vashr_imm(&mut self, a: Value, bits: u8) -> Value {
        self.expect(a, Type::Int4);
        self.push(Op::VAShrImm(a, bits), Type::Int4)
    }

    /// Lane-wise logical shift right by an immediate
    pub fn vlshr_imm(&mut self, a: Value, bits: u8) -> Value {
        self.expect(a, Type::Int4);
        self.push(Op::VLShrImm(a, bits), Type::Int4)
    }

    /// Lane-wise equality mask
    pub fn vcmp_eq(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VCmpEq(a, b), Type::Int4)
    }

    /// Lane-wise signed greater-than mask
    pub fn vcmp_gt(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Int4);
        self.expect(b, Type::Int4);
        self.push(Op::VCmpGt(a, b), Type::Int4)
    }

    // ---- SIMD float ------------------------------------------------------

    /// Lane-wise float add
    pub fn vfadd(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFAdd(a, b), Type::Float4)
    }

    /// Lane-wise float subtract
    pub fn vfsub(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFSub(a, b), Type::Float4)
    }

    /// Lane-wise float multiply
    pub fn vfmul(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFMul(a, b), Type::Float4)
    }

    /// Lane-wise float divide
    pub fn vfdiv(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFDiv(a, b), Type::Float4)
    }

    /// Lane-wise float minimum
    pub fn vfmin(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFMin(a, b), Type::Float4)
    }

    /// Lane-wise float maximum
    pub fn vfmax(&mut self, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFMax(a, b), Type::Float4)
    }

    /// Lane-wise float square root
    pub fn vfsqrt(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float4);
        self.push(Op::VFSqrt(a), Type::Float4)
    }

    /// Lane-wise float negation
    pub fn vfneg(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float4);
        let sign = self.const_int4([i32::MIN; 4]);
        let bits = self.push(Op::Bitcast(Type::Int4, a), Type::Int4);
        let flipped = self.push(Op::VXor(bits, sign), Type::Int4);
        self.push(Op::Bitcast(Type::Float4, flipped), Type::Float4)
    }

    /// Lane-wise float absolute value
    pub fn vfabs(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float4);
        let mask = self.const_int4([i32::MAX; 4]);
        let bits = self.push(Op::Bitcast(Type::Int4, a), Type::Int4);
        let cleared = self.push(Op::VAnd(bits, mask), Type::Int4);
        self.push(Op::Bitcast(Type::Float4, cleared), Type::Float4)
    }

    /// Lane-wise float comparison producing an `Int4` mask
    pub fn vfcmp(&mut self, op: FCmpOp, a: Value, b: Value) -> Value {
        self.expect(a, Type::Float4);
        self.expect(b, Type::Float4);
        self.push(Op::VFCmp(op, a, b), Type::Int4)
    }

    /// Lane-wise float → int, truncating
    pub fn vftoi(&mut self, a: Value) -> Value {
        self.expect(a, Type::Float4);
        self.push(Op::VFToI(a), Type::Int4)
    }

    /// Lane-wise int → float
    pub fn vitof(&mut self, a: Value) -> Value {
        self.expect(a, Type::Int4);
        self.push(Op::VIToF(a), Type::Float4)
    }

    // ---- lanes -----------------------------------------------------------

    /// Single-source lane shuffle
    pub fn shuffle(&mut self, a: Value, lanes: [u8; 4]) -> Value {
        let ty = self.func.type_of(a);
        assert!(ty.is_vector());
        assert!(lanes.iter().all(|&l| l < 4), "shuffle lane out of range");
        self.push(Op::Shuffle(a, lanes), ty)
    }

    /// Replace lane `lane` of `vec` with `scalar`
    pub fn insert(&mut self, vec: Value, scalar: Value, lane: u8) -> Value {
        let ty = self.func.type_of(vec);
        assert!(ty.is_vector() && lane < 4);
        let expected = if ty == Type::Float4 { Type::Float } else { Type::Int };
        self.expect(scalar, expected);
        self.push(Op::Insert(vec, scalar, lane), ty)
    }

    /// Extract lane `lane` of `vec` as a scalar
    pub fn extract(&mut self, vec: Value, lane: u8) -> Value {
        let ty = self.func.type_of(vec);
        assert!(ty.is_vector() && lane < 4);
        let out = if ty == Type::Float4 { Type::Float } else { Type::Int };
        self.push(Op::Extract(vec, lane), out)
    }

    /// Broadcast a scalar into all lanes
    pub fn splat(&mut self, scalar: Value) -> Value {
        let ty = match self.func.type_of(scalar) {
            Type::Float => Type::Float4,
            Type::Int => Type::Int4,
            other => panic!("cannot splat {other:?}"),
        };
        self.push(Op::Splat(scalar), ty)
    }

    /// Bitwise select: lanes of `a` where `mask` is set, else `b`
    pub fn blend(&mut self, mask: Value, a: Value, b: Value) -> Value {
        self.expect(mask, Type::Int4);
        let ty = self.expect_same(a, b);
        assert!(ty.is_vector());
        self.push(Op::Blend(mask, a, b), ty)
    }

    /// Sign-bit mask of the four lanes as an `Int`
    pub fn movmask(&mut self, a: Value) -> Value {
        let ty = self.func.type_of(a);
        assert!(ty.is_vector());
        self.push(Op::MovMask(a), Type::Int)
    }

    /// True when any lane of an `Int4` mask is set
    pub fn any_lane(&mut self, mask: Value) -> Value {
        let bits = self.movmask(mask);
        self.int_to_bool(bits)
    }

    // ---- memory ----------------------------------------------------------

    /// Typed load
    pub fn load(&mut self, mem: MemType, ptr: Value) -> Value {
        self.expect(ptr, Type::Ptr);
        self.push(Op::Load(mem, ptr), mem.loaded_type())
    }

    /// Typed store
    pub fn store(&mut self, mem: MemType, ptr: Value, value: Value) {
        self.expect(ptr, Type::Ptr);
        let expected = mem.loaded_type();
        let actual = self.func.type_of(value);
        let compatible = actual == expected || (expected == Type::Int && actual == Type::Bool);
        assert!(compatible, "store of {actual:?} through {mem:?} pointer");
        self.push(Op::Store(mem, ptr, value), Type::Void);
    }

    /// Loads a pointer-sized value and types it as a pointer
    pub fn load_ptr(&mut self, ptr: Value) -> Value {
        let raw = self.load(MemType::I64, ptr);
        self.bitcast(Type::Ptr, raw)
    }

    /// Fixed-size scratch slot; yields its address
    pub fn alloca(&mut self, bytes: u32) -> Value {
        self.push(Op::Alloca(bytes), Type::Ptr)
    }

    /// Pointer plus a byte offset held in an `Int`
    pub fn ptr_add(&mut self, ptr: Value, offset: Value) -> Value {
        self.expect(ptr, Type::Ptr);
        self.expect(offset, Type::Int);
        self.push(Op::PtrAdd(ptr, offset), Type::Ptr)
    }

    /// Pointer plus a constant byte offset
    pub fn ptr_add_imm(&mut self, ptr: Value, offset: i32) -> Value {
        self.expect(ptr, Type::Ptr);
        if offset == 0 {
            return ptr;
        }
        self.push(Op::PtrAddImm(ptr, offset), Type::Ptr)
    }

    /// Pointer plus `index * scale` bytes
    pub fn ptr_index(&mut self, ptr: Value, index: Value, scale: u32) -> Value {
        self.expect(ptr, Type::Ptr);
        self.expect(index, Type::Int);
        self.push(Op::PtrAddScaled(ptr, index, scale), Type::Ptr)
    }

    // ---- calls -----------------------------------------------------------

    /// Call through a function-pointer value
    pub fn call_ptr(&mut self, target: Value, args: &[Value], ret: Type) -> Value {
        self.expect(target, Type::Ptr);
        assert!(args.len() <= 6, "at most six call arguments are supported");
        for &arg in args {
            let ty = self.func.type_of(arg);
            assert!(
                matches!(ty, Type::Int | Type::Long | Type::Ptr | Type::Bool),
                "call arguments must be integer or pointer typed, found {ty:?}"
            );
        }
        self.push(Op::CallPtr(target, args.to_vec(), ret), ret)
    }

    /// Call a named symbol resolved at build time
    pub fn call_named(&mut self, name: &str, args: &[Value], ret: Type) -> Value {
        assert!(args.len() <= 6, "at most six call arguments are supported");
        for &arg in args {
            let ty = self.func.type_of(arg);
            assert!(
                matches!(ty, Type::Int | Type::Long | Type::Ptr | Type::Bool),
                "call arguments must be integer or pointer typed, found {ty:?}"
            );
        }
        self.push(Op::CallNamed(name.to_string(), args.to_vec(), ret), ret)
    }

    // ---- variables -------------------------------------------------------

    /// Declares an uninitialized variable
    pub fn var(&mut self, ty: Type) -> Var {
        assert!(ty != Type::Void);
        let slot = self.alloca(ty.size() as u32);
        Var { slot, ty }
    }

    /// Declares a variable initialized to `value`
    pub fn var_init(&mut self, value: Value) -> Var {
        let ty = self.func.type_of(value);
        let var = self.var(ty);
        self.set(&var, value);
        var
    }

    /// Current value of a variable
    pub fn get(&mut self, var: &Var) -> Value {
        let mem = Self::mem_type(var.ty);
        let loaded = self.load(mem, var.slot);
        if var.ty == Type::Bool {
            return self.int_to_bool(loaded);
        }
        loaded
    }

    /// Assigns a variable
    pub fn set(&mut self, var: &Var, value: Value) {
        let actual = self.func.type_of(value);
        assert!(actual == var.ty, "assignment of {actual:?} to {:?} variable", var.ty);
        self.store(Self::mem_type(var.ty), var.slot, value);
    }

    fn mem_type(ty: Type) -> MemType {
        match ty {
            Type::Bool | Type::Int => MemType::I32,
            Type::Long | Type::Ptr => MemType::I64,
            Type::Float => MemType::F32,
            Type::Int4 => MemType::I32x4,
            Type::Float4 => MemType::F32x4,
            Type::Void => unreachable!(),
        }
    }

    // ---- control flow ----------------------------------------------------

    fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block::default());
        id
    }

    fn terminate(&mut self, term: Terminator) {
        let block = &mut self.func.blocks[self.current.0 as usize];
        if block.term.is_none() {
            block.term = Some(term);
        }
    }

    /// Returns from the function
    pub fn ret(&mut self, value: Option<Value>) {
        if let Some(v) = value {
            let actual = self.func.type_of(v);
            let ok = actual == self.func.ret
                || (self.func.ret == Type::Int && actual == Type::Bool);
            assert!(ok, "return of {actual:?} from {:?} function", self.func.ret);
        } else {
            assert!(self.func.ret == Type::Void, "missing return value");
        }
        self.terminate(Terminator::Ret(value));
    }

    /// Runs `then` when `cond` is true
    pub fn if_then(&mut self, cond: Value, then: impl FnOnce(&mut Self)) {
        self.expect(cond, Type::Bool);
        let then_block = self.new_block();
        let join_block = self.new_block();
        self.terminate(Terminator::CondBr(cond, then_block, join_block));

        self.current = then_block;
        then(self);
        self.terminate(Terminator::Br(join_block));

        self.current = join_block;
    }

    /// Runs `then` when `cond` is true, `otherwise` when false
    pub fn if_then_else(
        &mut self,
        cond: Value,
        then: impl FnOnce(&mut Self),
        otherwise: impl FnOnce(&mut Self),
    ) {
        self.expect(cond, Type::Bool);
        let then_block = self.new_block();
        let else_block = self.new_block();
        let join_block = self.new_block();
        self.terminate(Terminator::CondBr(cond, then_block, else_block));

        self.current = then_block;
        then(self);
        self.terminate(Terminator::Br(join_block));

        self.current = else_block;
        otherwise(self);
        self.terminate(Terminator::Br(join_block));

        self.current = join_block;
    }

    /// `while cond { body }`; the condition is re-evaluated each iteration
    pub fn while_loop(
        &mut self,
        cond: impl FnOnce(&mut Self) -> Value,
        body: impl FnOnce(&mut Self),
    ) {
        let cond_block = self.new_block();
        let body_block = self.new_block();
        let exit_block = self.new_block();

        self.terminate(Terminator::Br(cond_block));

        self.current = cond_block;
        let c = cond(self);
        self.expect(c, Type::Bool);
        self.terminate(Terminator::CondBr(c, body_block, exit_block));

        self.current = body_block;
        body(self);
        self.terminate(Terminator::Br(cond_block));

        self.current = exit_block;
    }

    /// `do { body } until cond`; `body` returns the exit condition
    pub fn do_until(&mut self, body: impl FnOnce(&mut Self) -> Value) {
        let body_block = self.new_block();
        let exit_block = self.new_block();

        self.terminate(Terminator::Br(body_block));

        self.current = body_block;
        let done = body(self);
        self.expect(done, Type::Bool);
        self.terminate(Terminator::CondBr(done, exit_block, body_block));

        self.current = exit_block;
    }

    /// `for i in (start..end).step_by(step) { body(i) }` over `Int` values
    pub fn for_range(
        &mut self,
        start: Value,
        end: Value,
        step: i32,
        body: impl FnOnce(&mut Self, Value),
    ) {
        assert!(step > 0, "for_range requires a positive step");
        self.expect(start, Type::Int);
        self.expect(end, Type::Int);
        let index = self.var_init(start);
        self.while_loop(
            |b| {
                let i = b.get(&index);
                b.icmp(CmpOp::Slt, i, end)
            },
            |b| {
                let i = b.get(&index);
                body(b, i);
                let i = b.get(&index);
                let step = b.const_int(step);
                let next = b.add(i, step);
                b.set(&index, next);
            },
        );
    }

    /// Finalizes the function. Blocks left unterminated return void.
    pub fn finish(mut self) -> Function {
        for block in &mut self.func.blocks {
            if block.term.is_none() {
                assert!(
                    self.func.ret == Type::Void,
                    "non-void function has a fall-through block"
                );
                block.term = Some(Terminator::Ret(None));
            }
        }
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_function_shape() {
        let mut b = FunctionBuilder::new(&[Type::Int, Type::Int], Type::Int);
        let sum = b.add(b.param(0), b.param(1));
        b.ret(Some(sum));
        let func = b.finish();
        assert_eq!(func.blocks.len(), 1);
        assert_eq!(
            func.blocks[0].term,
            Some(Terminator::Ret(Some(sum)))
        );
    }

    #[test]
    fn test_control_flow_blocks() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Void);
        let zero = b.const_int(0);
        let positive = b.icmp(CmpOp::Sgt, b.param(0), zero);
        let out = b.var(Type::Int);
        b.if_then_else(
            positive,
            |b| {
                let one = b.const_int(1);
                b.set(&out, one);
            },
            |b| {
                let neg = b.const_int(-1);
                b.set(&out, neg);
            },
        );
        b.ret(None);
        let func = b.finish();
        // entry + then + else + join
        assert_eq!(func.blocks.len(), 4);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_type_mismatch_panics() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Void);
        let f = b.const_float(1.0);
        let _ = b.add(b.param(0), f);
    }
}
