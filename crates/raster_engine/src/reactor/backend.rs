//! IR lowering backends
//!
//! Both backends lower through the same x86-64 SysV emitter and produce
//! ABI-identical entry points. [`BackendKind::Optimizing`] runs the pass
//! pipeline first; [`BackendKind::Direct`] lowers the arena as built, which
//! is faster per build but produces more code. Every live value owns a
//! 16-byte frame slot and instructions move operands through fixed scratch
//! registers — code quality is the optimizer's concern, correctness the
//! emitter's.

use super::ir::{CmpOp, FCmpOp, Function, MemType, Op, Terminator, Type, Value};
use super::passes;
use super::routine::Routine;
use super::x86::{gpr, Assembler, Cond, Label, SsePredicate};
use crate::foundation::memory::{CodeMemory, MemoryError};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Optimization effort for the optimizing backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum OptLevel {
    /// No passes
    None,
    /// Folding and dead-code elimination only
    Less,
    /// Folding, algebraic simplification, CSE, DCE
    #[serde(rename = "default")]
    Default,
    /// The default pipeline iterated to a fixpoint
    Aggressive,
}

impl Default for OptLevel {
    fn default() -> Self {
        OptLevel::Default
    }
}

/// Which backend lowers IR to machine code
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Run the pass pipeline before lowering
    Optimizing,
    /// Lower immediately for minimal build latency
    Direct,
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Optimizing
    }
}

/// Resolves named external symbols to host addresses at build time
pub type SymbolResolver = Arc<dyn Fn(&str) -> Option<*const u8> + Send + Sync>;

/// Build-time configuration shared by all routine builds
#[derive(Clone, Default)]
pub struct BuildOptions {
    /// Backend selection
    pub backend: BackendKind,
    /// Pass pipeline effort (optimizing backend only)
    pub opt_level: OptLevel,
    /// Optional resolver for `CallNamed` symbols
    pub resolver: Option<SymbolResolver>,
}

/// Errors that fail a routine build
#[derive(Debug, Error)]
pub enum BuildError {
    /// Executable memory could not be allocated or sealed
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// A `CallNamed` symbol was not satisfied by the resolver
    #[error("unresolved external symbol `{0}`")]
    UnresolvedSymbol(String),
    /// The configuration selects functionality with no code path
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    /// The pipeline state describes a nonsense configuration
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
}

/// Builds a routine with no captured resources
pub fn build(
    func: &Function,
    name: &str,
    options: &BuildOptions,
) -> Result<Arc<Routine>, BuildError> {
    build_with_captures(func, name, options, Vec::new())
}

/// Builds a routine that keeps `captures` alive for its own lifetime
pub fn build_with_captures(
    func: &Function,
    name: &str,
    options: &BuildOptions,
    captures: Vec<Arc<dyn Any + Send + Sync>>,
) -> Result<Arc<Routine>, BuildError> {
    let mut func = func.clone();
    if options.backend == BackendKind::Optimizing {
        passes::run(&mut func, options.opt_level);
    }

    let code = Lowerer::new(&func, options).lower()?;

    let mut memory = CodeMemory::allocate(code.len())?;
    memory.write(&code)?;
    memory.seal()?;
    log::debug!("emitted routine `{name}` ({} bytes)", code.len());

    Ok(Arc::new(Routine::new(memory, vec![0], captures)))
}

const ARG_REGS: [u8; 6] = [gpr::RDI, gpr::RSI, gpr::RDX, gpr::RCX, gpr::R8, gpr::R9];

struct Lowerer<'a> {
    func: &'a Function,
    options: &'a BuildOptions,
    asm: Assembler,
    /// rbp-relative slot displacement per live value
    slots: Vec<Option<i32>>,
    /// rbp-relative buffer displacement per `Alloca`
    alloca_offsets: Vec<Option<i32>>,
    block_labels: Vec<Label>,
}

impl<'a> Lowerer<'a> {
    fn new(func: &'a Function, options: &'a BuildOptions) -> Self {
        Self {
            func,
            options,
            asm: Assembler::new(),
            slots: vec![None; func.insts.len()],
            alloca_offsets: vec![None; func.insts.len()],
            block_labels: Vec::new(),
        }
    }

    fn lower(mut self) -> Result<Vec<u8>, BuildError> {
        // Assign a 16-byte slot to every value reachable from a block, then
        // carve alloca buffers below them.
        let mut next_slot = 0i32;
        for block in &self.func.blocks {
            for &value in &block.insts {
                let index = value.0 as usize;
                if self.slots[index].is_none() && self.func.insts[index].ty != Type::Void {
                    next_slot += 16;
                    self.slots[index] = Some(-next_slot);
                }
            }
        }
        for block in &self.func.blocks {
            for &value in &block.insts {
                let index = value.0 as usize;
                if let Op::Alloca(bytes) = self.func.insts[index].op {
                    let size = ((bytes + 15) & !15).max(16) as i32;
                    next_slot += size;
                    self.alloca_offsets[index] = Some(-next_slot);
                }
            }
        }
        let frame_size = (next_slot + 15) & !15;

        for _ in &self.func.blocks {
            let label = self.asm.label();
            self.block_labels.push(label);
        }

        self.asm.push_rbp();
        self.asm.mov_rbp_rsp();
        self.asm.sub_rsp_imm32(frame_size);

        // Spill parameters into their slots.
        for (index, inst) in self.func.insts.iter().enumerate() {
            if let Op::Param(n) = inst.op {
                if let Some(disp) = self.slots[index] {
                    let wide = matches!(inst.ty, Type::Long | Type::Ptr);
                    self.asm
                        .mov_mem_reg(wide, gpr::RBP, disp, ARG_REGS[n as usize]);
                }
            }
        }

        for (block_index, block) in self.func.blocks.iter().enumerate() {
            let label = self.block_labels[block_index];
            self.asm.bind(label);
            for &value in &block.insts {
                self.lower_inst(value)?;
            }
            self.lower_terminator(block.term.as_ref().expect("unterminated block"))?;
        }

        Ok(self.asm.finish())
    }

    fn slot(&self, value: Value) -> i32 {
        self.slots[value.0 as usize].expect("value used before it has a slot")
    }

    fn is_wide(&self, value: Value) -> bool {
        matches!(self.func.type_of(value), Type::Long | Type::Ptr)
    }

    fn load_gpr(&mut self, reg: u8, value: Value) {
        let wide = self.is_wide(value);
        let disp = self.slot(value);
        self.asm.mov_reg_mem(wide, reg, gpr::RBP, disp);
    }

    fn store_gpr(&mut self, value: Value, reg: u8) {
        let wide = self.is_wide(value);
        let disp = self.slot(value);
        self.asm.mov_mem_reg(wide, gpr::RBP, disp, reg);
    }

    fn load_ss(&mut self, xmm: u8, value: Value) {
        let disp = self.slot(value);
        self.asm.movss_load(xmm, gpr::RBP, disp);
    }

    fn store_ss(&mut self, value: Value, xmm: u8) {
        let disp = self.slot(value);
        self.asm.movss_store(gpr::RBP, disp, xmm);
    }

    fn load_ps(&mut self, xmm: u8, value: Value) {
        let disp = self.slot(value);
        self.asm.movups_load(xmm, gpr::RBP, disp);
    }

    fn store_ps(&mut self, value: Value, xmm: u8) {
        let disp = self.slot(value);
        self.asm.movups_store(gpr::RBP, disp, xmm);
    }

    fn store_bool_from_al(&mut self, value: Value) {
        self.asm.movzx8_reg_reg(gpr::RAX, gpr::RAX);
        self.store_gpr(value, gpr::RAX);
    }

    fn lower_inst(&mut self, value: Value) -> Result<(), BuildError> {
        let inst = &self.func.insts[value.0 as usize];
        let op = inst.op.clone();
        match op {
            Op::Param(_) => {} // spilled in the prologue

            Op::ConstInt(v) => {
                self.asm.mov_reg_imm32(gpr::RAX, v as u32);
                self.store_gpr(value, gpr::RAX);
            }
            Op::ConstLong(v) => {
                self.asm.mov_reg_imm64(gpr::RAX, v as u64);
                self.store_gpr(value, gpr::RAX);
            }
            Op::ConstPtr(v) => {
                self.asm.mov_reg_imm64(gpr::RAX, v);
                self.store_gpr(value, gpr::RAX);
            }
            Op::ConstFloat(bits) => {
                self.asm.mov_reg_imm32(gpr::RAX, bits);
                let disp = self.slot(value);
                self.asm.mov_mem_reg(false, gpr::RBP, disp, gpr::RAX);
            }
            Op::ConstInt4(v) => {
                let bits = v.map(|x| x as u32);
                self.emit_const_vec(value, bits);
            }
            Op::ConstFloat4(bits) => {
                self.emit_const_vec(value, bits);
            }

            Op::Add(a, b) => self.int_binop(value, a, b, |asm| asm.add_reg_reg(false, gpr::RAX, gpr::RCX)),
            Op::Sub(a, b) => self.int_binop(value, a, b, |asm| asm.sub_reg_reg(false, gpr::RAX, gpr::RCX)),
            Op::Mul(a, b) => self.int_binop(value, a, b, |asm| asm.imul_reg_reg(gpr::RAX, gpr::RCX)),
            Op::And(a, b) => self.int_binop(value, a, b, |asm| asm.and_reg_reg(false, gpr::RAX, gpr::RCX)),
            Op::Or(a, b) => self.int_binop(value, a, b, |asm| asm.or_reg_reg(false, gpr::RAX, gpr::RCX)),
            Op::Xor(a, b) => self.int_binop(value, a, b, |asm| asm.xor_reg_reg(false, gpr::RAX, gpr::RCX)),
            Op::Shl(a, b) => self.int_binop(value, a, b, |asm| asm.shl_cl(gpr::RAX)),
            Op::AShr(a, b) => self.int_binop(value, a, b, |asm| asm.sar_cl(gpr::RAX)),
            Op::LShr(a, b) => self.int_binop(value, a, b, |asm| asm.shr_cl(gpr::RAX)),

            Op::ICmp(cmp, a, b) => {
                let wide = self.is_wide(a);
                self.load_gpr(gpr::RAX, a);
                self.load_gpr(gpr::RCX, b);
                self.asm.cmp_reg_reg(wide, gpr::RAX, gpr::RCX);
                let cond = match cmp {
                    CmpOp::Eq => Cond::E,
                    CmpOp::Ne => Cond::Ne,
                    CmpOp::Slt => Cond::L,
                    CmpOp::Sle => Cond::Le,
                    CmpOp::Sgt => Cond::G,
                    CmpOp::Sge => Cond::Ge,
                    CmpOp::Ult => Cond::B,
                    CmpOp::Uge => Cond::Ae,
                };
                self.asm.setcc(cond, gpr::RAX);
                self.store_bool_from_al(value);
            }

            Op::FAdd(a, b) => self.float_binop(value, a, b, 0x58),
            Op::FSub(a, b) => self.float_binop(value, a, b, 0x5C),
            Op::FMul(a, b) => self.float_binop(value, a, b, 0x59),
            Op::FDiv(a, b) => self.float_binop(value, a, b, 0x5E),
            Op::FMin(a, b) => self.float_binop(value, a, b, 0x5D),
            Op::FMax(a, b) => self.float_binop(value, a, b, 0x5F),
            Op::FSqrt(a) => {
                self.load_ss(0, a);
                self.asm.ss_op(0x51, 0, 0);
                self.store_ss(value, 0);
            }

            Op::FCmp(cmp, a, b) => self.lower_fcmp(value, cmp, a, b),

            Op::IToF(a) => {
                self.load_gpr(gpr::RAX, a);
                self.asm.cvtsi2ss(0, gpr::RAX);
                self.store_ss(value, 0);
            }
            Op::FToI(a) => {
                self.load_ss(0, a);
                self.asm.cvttss2si(gpr::RAX, 0);
                self.store_gpr(value, gpr::RAX);
            }
            Op::IToL(a) => {
                self.load_gpr(gpr::RAX, a);
                self.asm.movsxd(gpr::RAX, gpr::RAX);
                self.store_gpr(value, gpr::RAX);
            }
            Op::LToI(a) => {
                let disp = self.slot(a);
                self.asm.mov_reg_mem(false, gpr::RAX, gpr::RBP, disp);
                self.store_gpr(value, gpr::RAX);
            }
            Op::Bitcast(ty, a) => {
                let from = self.slot(a);
                let to = self.slot(value);
                match ty.size() {
                    4 => {
                        self.asm.mov_reg_mem(false, gpr::RAX, gpr::RBP, from);
                        self.asm.mov_mem_reg(false, gpr::RBP, to, gpr::RAX);
                    }
                    8 => {
                        self.asm.mov_reg_mem(true, gpr::RAX, gpr::RBP, from);
                        self.asm.mov_mem_reg(true, gpr::RBP, to, gpr::RAX);
                    }
                    16 => {
                        self.asm.movups_load(0, gpr::RBP, from);
                        self.asm.movups_store(gpr::RBP, to, 0);
                    }
                    _ => unreachable!(),
                }
            }

            Op::VAdd(a, b) => self.packed_int_binop(value, a, b, 0xFE),
            Op::VSub(a, b) => self.packed_int_binop(value, a, b, 0xFA),
            Op::VMul(a, b) => {
                self.load_ps(0, a);
                self.load_ps(1, b);
                self.asm.pmulld(0, 1);
                self.store_ps(value, 0);
            }
            Op::VAnd(a, b) => self.packed_int_binop(value, a, b, 0xDB),
            Op::VOr(a, b) => self.packed_int_binop(value, a, b, 0xEB),
            Op::VXor(a, b) => self.packed_int_binop(value, a, b, 0xEF),
            Op::VCmpEq(a, b) => self.packed_int_binop(value, a, b, 0x76),
            Op::VCmpGt(a, b) => self.packed_int_binop(value, a, b, 0x66),
            Op::VShlImm(a, bits) => self.packed_shift(value, a, 6, bits),
            Op::VLShrImm(a, bits) => self.packed_shift(value, a, 2, bits),
            Op::VAShrImm(a, bits) => self.packed_shift(value, a, 4, bits),

            Op::VFAdd(a, b) => self.packed_float_binop(value, a, b, 0x58),
            Op::VFSub(a, b) => self.packed_float_binop(value, a, b, 0x5C),
            Op::VFMul(a, b) => self.packed_float_binop(value, a, b, 0x59),
            Op::VFDiv(a, b) => self.packed_float_binop(value, a, b, 0x5E),
            Op::VFMin(a, b) => self.packed_float_binop(value, a, b, 0x5D),
            Op::VFMax(a, b) => self.packed_float_binop(value, a, b, 0x5F),
            Op::VFSqrt(a) => {
                self.load_ps(0, a);
                self.asm.ps_op(0x51, 0, 0);
                self.store_ps(value, 0);
            }
            Op::VFCmp(cmp, a, b) => {
                let (first, second, predicate) = match cmp {
                    FCmpOp::Eq => (a, b, SsePredicate::Eq),
                    FCmpOp::Lt => (a, b, SsePredicate::Lt),
                    FCmpOp::Le => (a, b, SsePredicate::Le),
                    FCmpOp::Ne => (a, b, SsePredicate::Neq),
                    FCmpOp::Gt => (b, a, SsePredicate::Lt),
                    FCmpOp::Ge => (b, a, SsePredicate::Le),
                };
                self.load_ps(0, first);
                self.load_ps(1, second);
                self.asm.cmpps(0, 1, predicate);
                self.store_ps(value, 0);
            }
            Op::VFToI(a) => {
                self.load_ps(0, a);
                self.asm.cvttps2dq(0, 0);
                self.store_ps(value, 0);
            }
            Op::VIToF(a) => {
                self.load_ps(0, a);
                self.asm.cvtdq2ps(0, 0);
                self.store_ps(value, 0);
            }

            Op::Shuffle(a, lanes) => {
                let order =
                    lanes[0] | (lanes[1] << 2) | (lanes[2] << 4) | (lanes[3] << 6);
                self.load_ps(0, a);
                self.asm.pshufd(0, 0, order);
                self.store_ps(value, 0);
            }
            Op::Insert(vec, scalar, lane) => {
                self.load_ps(0, vec);
                self.store_ps(value, 0);
                let scalar_disp = self.slot(scalar);
                self.asm.mov_reg_mem(false, gpr::RAX, gpr::RBP, scalar_disp);
                let dest = self.slot(value) + 4 * i32::from(lane);
                self.asm.mov_mem_reg(false, gpr::RBP, dest, gpr::RAX);
            }
            Op::Extract(vec, lane) => {
                let src = self.slot(vec) + 4 * i32::from(lane);
                self.asm.mov_reg_mem(false, gpr::RAX, gpr::RBP, src);
                self.store_gpr(value, gpr::RAX);
            }
            Op::Splat(scalar) => {
                let disp = self.slot(scalar);
                self.asm.movss_load(0, gpr::RBP, disp);
                self.asm.shufps(0, 0, 0x00);
                self.store_ps(value, 0);
            }
            Op::Blend(mask, a, b) => {
                self.load_ps(0, mask);
                self.load_ps(1, a);
                self.load_ps(2, b);
                self.asm.pd_op(0xDB, 1, 0); // a & mask
                self.asm.pd_op(0xDF, 0, 2); // !mask & b
                self.asm.pd_op(0xEB, 1, 0);
                self.store_ps(value, 1);
            }
            Op::MovMask(a) => {
                self.load_ps(0, a);
                self.asm.movmskps(gpr::RAX, 0);
                self.store_gpr(value, gpr::RAX);
            }

            Op::Load(mem, ptr) => {
                self.load_gpr(gpr::RAX, ptr);
                match mem {
                    MemType::I8 => {
                        self.asm.movsx8_reg_mem(gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::U8 => {
                        self.asm.movzx8_reg_mem(gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::I16 => {
                        self.asm.movsx16_reg_mem(gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::U16 => {
                        self.asm.movzx16_reg_mem(gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::I32 => {
                        self.asm.mov_reg_mem(false, gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::I64 => {
                        self.asm.mov_reg_mem(true, gpr::RCX, gpr::RAX, 0);
                        self.store_gpr(value, gpr::RCX);
                    }
                    MemType::F32 => {
                        self.asm.movss_load(0, gpr::RAX, 0);
                        self.store_ss(value, 0);
                    }
                    MemType::I32x4 | MemType::F32x4 => {
                        self.asm.movups_load(0, gpr::RAX, 0);
                        self.store_ps(value, 0);
                    }
                }
            }
            Op::Store(mem, ptr, val) => {
                self.load_gpr(gpr::RAX, ptr);
                match mem {
                    MemType::I8 | MemType::U8 => {
                        self.load_gpr(gpr::RCX, val);
                        self.asm.mov_mem8_reg(gpr::RAX, 0, gpr::RCX);
                    }
                    MemType::I16 | MemType::U16 => {
                        self.load_gpr(gpr::RCX, val);
                        self.asm.mov_mem16_reg(gpr::RAX, 0, gpr::RCX);
                    }
                    MemType::I32 => {
                        self.load_gpr(gpr::RCX, val);
                        self.asm.mov_mem_reg(false, gpr::RAX, 0, gpr::RCX);
                    }
                    MemType::I64 => {
                        self.load_gpr(gpr::RCX, val);
                        self.asm.mov_mem_reg(true, gpr::RAX, 0, gpr::RCX);
                    }
                    MemType::F32 => {
                        self.load_ss(0, val);
                        self.asm.movss_store(gpr::RAX, 0, 0);
                    }
                    MemType::I32x4 | MemType::F32x4 => {
                        self.load_ps(0, val);
                        self.asm.movups_store(gpr::RAX, 0, 0);
                    }
                }
            }
            Op::Alloca(_) => {
                let offset = self.alloca_offsets[value.0 as usize]
                    .expect("alloca without a reserved buffer");
                self.asm.lea(gpr::RAX, gpr::RBP, offset);
                self.store_gpr(value, gpr::RAX);
            }
            Op::PtrAdd(ptr, offset) => {
                self.load_gpr(gpr::RAX, ptr);
                let disp = self.slot(offset);
                self.asm.mov_reg_mem(false, gpr::RCX, gpr::RBP, disp);
                self.asm.movsxd(gpr::RCX, gpr::RCX);
                self.asm.add_reg_reg(true, gpr::RAX, gpr::RCX);
                self.store_gpr(value, gpr::RAX);
            }
            Op::PtrAddImm(ptr, offset) => {
                self.load_gpr(gpr::RAX, ptr);
                self.asm.add_reg_imm32(true, gpr::RAX, offset);
                self.store_gpr(value, gpr::RAX);
            }
            Op::PtrAddScaled(ptr, index, scale) => {
                self.load_gpr(gpr::RAX, ptr);
                let disp = self.slot(index);
                self.asm.mov_reg_mem(false, gpr::RCX, gpr::RBP, disp);
                self.asm
                    .imul_reg_reg_imm32(gpr::RCX, gpr::RCX, scale as i32);
                self.asm.movsxd(gpr::RCX, gpr::RCX);
                self.asm.add_reg_reg(true, gpr::RAX, gpr::RCX);
                self.store_gpr(value, gpr::RAX);
            }

            Op::CallPtr(target, ref args, ret) => {
                self.load_gpr(gpr::R10, target);
                self.emit_call(value, args, ret);
            }
            Op::CallNamed(ref name, ref args, ret) => {
                let address = self
                    .options
                    .resolver
                    .as_ref()
                    .and_then(|resolve| resolve(name))
                    .ok_or_else(|| BuildError::UnresolvedSymbol(name.clone()))?;
                self.asm.mov_reg_imm64(gpr::R10, address as u64);
                self.emit_call(value, args, ret);
            }
        }
        Ok(())
    }

    fn emit_const_vec(&mut self, value: Value, bits: [u32; 4]) {
        let disp = self.slot(value);
        let lo = u64::from(bits[0]) | (u64::from(bits[1]) << 32);
        let hi = u64::from(bits[2]) | (u64::from(bits[3]) << 32);
        self.asm.mov_reg_imm64(gpr::RAX, lo);
        self.asm.mov_mem_reg(true, gpr::RBP, disp, gpr::RAX);
        self.asm.mov_reg_imm64(gpr::RAX, hi);
        self.asm.mov_mem_reg(true, gpr::RBP, disp + 8, gpr::RAX);
    }

    fn int_binop(&mut self, value: Value, a: Value, b: Value, emit: impl FnOnce(&mut Assembler)) {
        self.load_gpr(gpr::RAX, a);
        self.load_gpr(gpr::RCX, b);
        emit(&mut self.asm);
        self.store_gpr(value, gpr::RAX);
    }

    fn float_binop(&mut self, value: Value, a: Value, b: Value, opcode: u8) {
        self.load_ss(0, a);
        self.load_ss(1, b);
        self.asm.ss_op(opcode, 0, 1);
        self.store_ss(value, 0);
    }

    fn packed_float_binop(&mut self, value: Value, a: Value, b: Value, opcode: u8) {
        self.load_ps(0, a);
        self.load_ps(1, b);
        self.asm.ps_op(opcode, 0, 1);
        self.store_ps(value, 0);
    }

    fn packed_int_binop(&mut self, value: Value, a: Value, b: Value, opcode: u8) {
        self.load_ps(0, a);
        self.load_ps(1, b);
        self.asm.pd_op(opcode, 0, 1);
        self.store_ps(value, 0);
    }

    fn packed_shift(&mut self, value: Value, a: Value, digit: u8, bits: u8) {
        self.load_ps(0, a);
        self.asm.pshift_imm(digit, 0, bits);
        self.store_ps(value, 0);
    }

    fn lower_fcmp(&mut self, value: Value, cmp: FCmpOp, a: Value, b: Value) {
        match cmp {
            FCmpOp::Gt | FCmpOp::Ge => {
                self.load_ss(0, a);
                self.load_ss(1, b);
                self.asm.ucomiss(0, 1);
                let cond = if cmp == FCmpOp::Gt { Cond::A } else { Cond::Ae };
                self.asm.setcc(cond, gpr::RAX);
                self.store_bool_from_al(value);
            }
            FCmpOp::Lt | FCmpOp::Le => {
                self.load_ss(0, b);
                self.load_ss(1, a);
                self.asm.ucomiss(0, 1);
                let cond = if cmp == FCmpOp::Lt { Cond::A } else { Cond::Ae };
                self.asm.setcc(cond, gpr::RAX);
                self.store_bool_from_al(value);
            }
            FCmpOp::Eq => {
                self.load_ss(0, a);
                self.load_ss(1, b);
                self.asm.ucomiss(0, 1);
                self.asm.setcc(Cond::E, gpr::RAX);
                self.asm.setcc(Cond::Np, gpr::RCX);
                self.asm.movzx8_reg_reg(gpr::RAX, gpr::RAX);
                self.asm.movzx8_reg_reg(gpr::RCX, gpr::RCX);
                self.asm.and_reg_reg(false, gpr::RAX, gpr::RCX);
                self.store_gpr(value, gpr::RAX);
            }
            FCmpOp::Ne => {
                self.load_ss(0, a);
                self.load_ss(1, b);
                self.asm.ucomiss(0, 1);
                self.asm.setcc(Cond::Ne, gpr::RAX);
                self.asm.setcc(Cond::P, gpr::RCX);
                self.asm.movzx8_reg_reg(gpr::RAX, gpr::RAX);
                self.asm.movzx8_reg_reg(gpr::RCX, gpr::RCX);
                self.asm.or_reg_reg(false, gpr::RAX, gpr::RCX);
                self.store_gpr(value, gpr::RAX);
            }
        }
    }

    fn emit_call(&mut self, value: Value, args: &[Value], ret: Type) {
        for (index, &arg) in args.iter().enumerate() {
            let wide = self.is_wide(arg);
            let disp = self.slot(arg);
            self.asm.mov_reg_mem(wide, ARG_REGS[index], gpr::RBP, disp);
        }
        self.asm.call_reg(gpr::R10);
        match ret {
            Type::Void => {}
            Type::Int | Type::Bool => self.store_gpr(value, gpr::RAX),
            Type::Long | Type::Ptr => {
                let disp = self.slot(value);
                self.asm.mov_mem_reg(true, gpr::RBP, disp, gpr::RAX);
            }
            Type::Float => self.store_ss(value, 0),
            Type::Int4 | Type::Float4 => {
                panic!("vector returns are not part of the call ABI")
            }
        }
    }

    fn lower_terminator(&mut self, term: &Terminator) -> Result<(), BuildError> {
        match term {
            Terminator::Br(target) => {
                let label = self.block_labels[target.0 as usize];
                self.asm.jmp(label);
            }
            Terminator::CondBr(cond, then_block, else_block) => {
                self.load_gpr(gpr::RAX, *cond);
                self.asm.test_reg_reg(false, gpr::RAX, gpr::RAX);
                let then_label = self.block_labels[then_block.0 as usize];
                let else_label = self.block_labels[else_block.0 as usize];
                self.asm.jcc(Cond::Ne, then_label);
                self.asm.jmp(else_label);
            }
            Terminator::Ret(value) => {
                if let Some(v) = value {
                    match self.func.ret {
                        Type::Int | Type::Bool => self.load_gpr(gpr::RAX, *v),
                        Type::Long | Type::Ptr => {
                            let disp = self.slot(*v);
                            self.asm.mov_reg_mem(true, gpr::RAX, gpr::RBP, disp);
                        }
                        Type::Float => self.load_ss(0, *v),
                        other => {
                            return Err(BuildError::Unsupported(format!(
                                "return type {other:?} is not part of the call ABI"
                            )))
                        }
                    }
                }
                self.asm.leave();
                self.asm.ret();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::builder::FunctionBuilder;
    use crate::reactor::ir::{CmpOp, MemType, Type};

    fn options(backend: BackendKind) -> BuildOptions {
        BuildOptions {
            backend,
            ..Default::default()
        }
    }

    fn build_both(func: &Function, name: &str) -> Vec<Arc<Routine>> {
        vec![
            build(func, name, &options(BackendKind::Optimizing)).unwrap(),
            build(func, name, &options(BackendKind::Direct)).unwrap(),
        ]
    }

    #[test]
    fn test_add_function_runs() {
        let mut b = FunctionBuilder::new(&[Type::Int, Type::Int], Type::Int);
        let sum = b.add(b.param(0), b.param(1));
        b.ret(Some(sum));
        let func = b.finish();

        for routine in build_both(&func, "add") {
            let f: extern "C" fn(i32, i32) -> i32 =
                unsafe { std::mem::transmute(routine.entry(0)) };
            assert_eq!(f(2, 40), 42);
            assert_eq!(f(-5, 3), -2);
        }
    }

    #[test]
    fn test_loop_sums_range() {
        // sum of 0..n
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let total = b.var(Type::Int);
        let zero = b.const_int(0);
        b.set(&total, zero);
        let start = b.const_int(0);
        b.for_range(start, b.param(0), 1, |b, i| {
            let t = b.get(&total);
            let t = b.add(t, i);
            b.set(&total, t);
        });
        let result = b.get(&total);
        b.ret(Some(result));
        let func = b.finish();

        for routine in build_both(&func, "sum") {
            let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(routine.entry(0)) };
            assert_eq!(f(10), 45);
            assert_eq!(f(0), 0);
            assert_eq!(f(1), 0);
        }
    }

    #[test]
    fn test_branching_selects_max() {
        let mut b = FunctionBuilder::new(&[Type::Int, Type::Int], Type::Int);
        let out = b.var(Type::Int);
        let bigger = b.icmp(CmpOp::Sgt, b.param(0), b.param(1));
        b.if_then_else(
            bigger,
            |b| {
                let a = b.param(0);
                b.set(&out, a);
            },
            |b| {
                let a = b.param(1);
                b.set(&out, a);
            },
        );
        let result = b.get(&out);
        b.ret(Some(result));
        let func = b.finish();

        for routine in build_both(&func, "max") {
            let f: extern "C" fn(i32, i32) -> i32 =
                unsafe { std::mem::transmute(routine.entry(0)) };
            assert_eq!(f(3, 9), 9);
            assert_eq!(f(9, 3), 9);
            assert_eq!(f(-1, -2), -1);
        }
    }

    #[test]
    fn test_float_and_memory_ops() {
        // out[0] = sqrt(in[0]) + in[1] * 2.0
        let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Ptr], Type::Void);
        let x = b.load(MemType::F32, b.param(0));
        let second = b.ptr_add_imm(b.param(0), 4);
        let y = b.load(MemType::F32, second);
        let root = b.fsqrt(x);
        let two = b.const_float(2.0);
        let scaled = b.fmul(y, two);
        let sum = b.fadd(root, scaled);
        b.store(MemType::F32, b.param(1), sum);
        b.ret(None);
        let func = b.finish();

        for routine in build_both(&func, "fma") {
            let f: extern "C" fn(*const f32, *mut f32) =
                unsafe { std::mem::transmute(routine.entry(0)) };
            let input = [9.0f32, 4.0];
            let mut output = [0.0f32];
            f(input.as_ptr(), output.as_mut_ptr());
            assert_eq!(output[0], 11.0);
        }
    }

    #[test]
    fn test_simd_lane_arithmetic() {
        // out = a * b + splat(1.0)
        let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Ptr, Type::Ptr], Type::Void);
        let va = b.load(MemType::F32x4, b.param(0));
        let vb = b.load(MemType::F32x4, b.param(1));
        let product = b.vfmul(va, vb);
        let one = b.const_splat(1.0);
        let sum = b.vfadd(product, one);
        b.store(MemType::F32x4, b.param(2), sum);
        b.ret(None);
        let func = b.finish();

        for routine in build_both(&func, "simd_mad") {
            let f: extern "C" fn(*const f32, *const f32, *mut f32) =
                unsafe { std::mem::transmute(routine.entry(0)) };
            let a = [1.0f32, 2.0, 3.0, 4.0];
            let b_in = [10.0f32, 20.0, 30.0, 40.0];
            let mut out = [0.0f32; 4];
            f(a.as_ptr(), b_in.as_ptr(), out.as_mut_ptr());
            assert_eq!(out, [11.0, 41.0, 91.0, 161.0]);
        }
    }

    #[test]
    fn test_simd_compare_and_blend() {
        // out = a > b ? a : b (lane-wise max via mask)
        let mut b = FunctionBuilder::new(&[Type::Ptr, Type::Ptr, Type::Ptr], Type::Void);
        let va = b.load(MemType::F32x4, b.param(0));
        let vb = b.load(MemType::F32x4, b.param(1));
        let mask = b.vfcmp(crate::reactor::ir::FCmpOp::Gt, va, vb);
        let picked = b.blend(mask, va, vb);
        b.store(MemType::F32x4, b.param(2), picked);
        b.ret(None);
        let func = b.finish();

        for routine in build_both(&func, "simd_max") {
            let f: extern "C" fn(*const f32, *const f32, *mut f32) =
                unsafe { std::mem::transmute(routine.entry(0)) };
            let a = [1.0f32, 5.0, 3.0, 0.0];
            let b_in = [2.0f32, 4.0, 3.0, -1.0];
            let mut out = [0.0f32; 4];
            f(a.as_ptr(), b_in.as_ptr(), out.as_mut_ptr());
            assert_eq!(out, [2.0, 5.0, 3.0, 0.0]);
        }
    }

    extern "C" fn double_it(x: i32) -> i32 {
        x * 2
    }

    #[test]
    fn test_call_through_pointer() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let target = b.const_ptr(double_it as *const u8);
        let doubled = b.call_ptr(target, &[b.param(0)], Type::Int);
        b.ret(Some(doubled));
        let func = b.finish();

        for routine in build_both(&func, "call") {
            let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(routine.entry(0)) };
            assert_eq!(f(21), 42);
        }
    }

    #[test]
    fn test_named_symbol_resolution() {
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let result = b.call_named("double_it", &[b.param(0)], Type::Int);
        b.ret(Some(result));
        let func = b.finish();

        let mut opts = options(BackendKind::Optimizing);
        assert!(matches!(
            build(&func, "named", &opts),
            Err(BuildError::UnresolvedSymbol(_))
        ));

        opts.resolver = Some(Arc::new(|name: &str| {
            (name == "double_it").then(|| double_it as *const u8)
        }));
        let routine = build(&func, "named", &opts).unwrap();
        let f: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(routine.entry(0)) };
        assert_eq!(f(8), 16);
    }

    #[test]
    fn test_backends_agree_on_results() {
        // A mixed integer/float kernel evaluated over a range of inputs.
        let mut b = FunctionBuilder::new(&[Type::Int], Type::Int);
        let x = b.param(0);
        let xf = b.itof(x);
        let squared = b.fmul(xf, xf);
        let half = b.const_float(0.5);
        let scaled = b.fmul(squared, half);
        let back = b.ftoi(scaled);
        let three = b.const_int(3);
        let masked = b.and_(back, three);
        let sum = b.add(masked, x);
        b.ret(Some(sum));
        let func = b.finish();

        let optimized = build(&func, "kernel", &options(BackendKind::Optimizing)).unwrap();
        let direct = build(&func, "kernel", &options(BackendKind::Direct)).unwrap();
        let fo: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(optimized.entry(0)) };
        let fd: extern "C" fn(i32) -> i32 = unsafe { std::mem::transmute(direct.entry(0)) };
        for x in -20..20 {
            assert_eq!(fo(x), fd(x));
        }
    }
}
