//! x86-64 instruction encoding.
//!
//! Only the forms the baseline compiler emits are provided. 64-bit forms
//! carry no suffix; `*32` forms operate on the low dword and zero the upper
//! half of the destination, which is what int32 fast paths rely on.

use super::JitError;
use super::codebuf::{CodeBuffer, Label};

/// General-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    /// Low three bits, as they appear in ModR/M and SIB.
    pub fn code(self) -> u8 {
        (self as u8) & 0x7
    }

    pub fn is_extended(self) -> bool {
        (self as u8) >= 8
    }
}

/// SSE register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
}

/// `[base + index*8 + disp]`, index optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<Reg>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Self {
        Self {
            base,
            index: None,
            disp,
        }
    }

    /// `[base + index*8]`
    pub fn indexed(base: Reg, index: Reg) -> Self {
        Self {
            base,
            index: Some(index),
            disp: 0,
        }
    }
}

/// Condition codes for `jcc` and `setcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl Cond {
    pub fn invert(self) -> Self {
        match self {
            Cond::O => Cond::No,
            Cond::No => Cond::O,
            Cond::B => Cond::Ae,
            Cond::Ae => Cond::B,
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::Be => Cond::A,
            Cond::A => Cond::Be,
            Cond::S => Cond::Ns,
            Cond::Ns => Cond::S,
            Cond::P => Cond::Np,
            Cond::Np => Cond::P,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Group-1 arithmetic, by their ModR/M extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alu {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// Group-2 shifts, by their ModR/M extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Shift {
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    Dword,
    Qword,
}

fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

fn fits_i8(value: i32) -> bool {
    (-128..=127).contains(&value)
}

#[derive(Debug, Default)]
pub struct Assembler {
    buf: CodeBuffer,
}

impl Assembler {
    pub fn new() -> Self {
        Self {
            buf: CodeBuffer::with_capacity(4096),
        }
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind(&mut self, label: Label) -> Result<(), JitError> {
        self.buf.bind(label)
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.buf.label_offset(label)
    }

    pub fn finish(self) -> Result<Vec<u8>, JitError> {
        self.buf.finish()
    }

    // ----- encoding primitives -----

    /// REX prefix. `reg`, `index` and `rm` are full 4-bit register numbers.
    /// `byte_regs` forces a prefix so that codes 4-7 name SPL..DIL.
    fn rex(&mut self, width: Width, reg: u8, index: u8, rm: u8, byte_regs: bool) {
        let mut rex = 0x40;
        if width == Width::Qword {
            rex |= 0x08;
        }
        rex |= (reg >> 3 & 1) << 2;
        rex |= (index >> 3 & 1) << 1;
        rex |= rm >> 3 & 1;
        if rex != 0x40 || byte_regs {
            self.buf.emit_u8(rex);
        }
    }

    /// `op reg, rm` with a register operand in ModR/M.rm.
    fn op_rr(&mut self, width: Width, opcode: &[u8], reg: u8, rm: u8) {
        self.rex(width, reg, 0, rm, false);
        self.buf.emit_bytes(opcode);
        self.buf.emit_u8(modrm(0b11, reg, rm));
    }

    /// `op reg, [mem]`.
    fn op_rm(&mut self, width: Width, opcode: &[u8], reg: u8, mem: Mem) {
        let index = mem.index.map_or(0, |r| r as u8);
        self.rex(width, reg, index, mem.base as u8, false);
        self.buf.emit_bytes(opcode);
        self.mem_operand(reg, mem);
    }

    fn mem_operand(&mut self, reg: u8, mem: Mem) {
        let base = mem.base.code();
        // rbp/r13 with mod=00 means RIP-relative or no base; use a zero disp8.
        let mode = if mem.disp == 0 && base != 0b101 {
            0b00
        } else if fits_i8(mem.disp) {
            0b01
        } else {
            0b10
        };
        match mem.index {
            Some(index) => {
                self.buf.emit_u8(modrm(mode, reg, 0b100));
                self.buf.emit_u8(modrm(0b11, index.code(), base));
            }
            None if base == 0b100 => {
                self.buf.emit_u8(modrm(mode, reg, 0b100));
                self.buf.emit_u8(0x24);
            }
            None => self.buf.emit_u8(modrm(mode, reg, base)),
        }
        match mode {
            0b01 => self.buf.emit_u8(mem.disp as u8),
            0b10 => self.buf.emit_u32(mem.disp as u32),
            _ => {}
        }
    }

    /// SSE `prefix [REX] 0F op /r`.
    fn sse(&mut self, prefix: u8, width: Width, op: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(prefix);
        self.rex(width, reg, 0, rm, false);
        self.buf.emit_bytes(&[0x0F, op]);
        self.buf.emit_u8(modrm(0b11, reg, rm));
    }

    // ----- moves -----

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(Width::Qword, &[0x89], src as u8, dst as u8);
    }

    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_rr(Width::Dword, &[0x89], src as u8, dst as u8);
    }

    /// Load a 64-bit constant using the shortest encoding.
    pub fn mov_ri(&mut self, dst: Reg, imm: u64) {
        if let Ok(imm) = u32::try_from(imm) {
            self.rex(Width::Dword, 0, 0, dst as u8, false);
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u32(imm);
        } else if let Ok(imm) = i32::try_from(imm as i64) {
            self.rex(Width::Qword, 0, 0, dst as u8, false);
            self.buf.emit_u8(0xC7);
            self.buf.emit_u8(modrm(0b11, 0, dst.code()));
            self.buf.emit_u32(imm as u32);
        } else {
            self.rex(Width::Qword, 0, 0, dst as u8, false);
            self.buf.emit_u8(0xB8 + dst.code());
            self.buf.emit_u64(imm);
        }
    }

    pub fn load(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(Width::Qword, &[0x8B], dst as u8, mem);
    }

    /// Zero-extending 32-bit load.
    pub fn load32(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(Width::Dword, &[0x8B], dst as u8, mem);
    }

    /// Zero-extending byte load.
    pub fn load8(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(Width::Dword, &[0x0F, 0xB6], dst as u8, mem);
    }

    pub fn store(&mut self, mem: Mem, src: Reg) {
        self.op_rm(Width::Qword, &[0x89], src as u8, mem);
    }

    /// `lea dst, [rip + label]`
    pub fn lea_label(&mut self, dst: Reg, label: Label) {
        self.rex(Width::Qword, dst as u8, 0, 0, false);
        self.buf.emit_u8(0x8D);
        self.buf.emit_u8(modrm(0b00, dst.code(), 0b101));
        self.buf.emit_label_ref(label);
    }

    /// `lea dst, [mem]`
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.op_rm(Width::Qword, &[0x8D], dst as u8, mem);
    }

    pub fn movsxd(&mut self, dst: Reg, src: Reg) {
        self.op_rr(Width::Qword, &[0x63], dst as u8, src as u8);
    }

    pub fn movzx8(&mut self, dst: Reg, src: Reg) {
        self.rex(Width::Dword, dst as u8, 0, src as u8, src.code() >= 4);
        self.buf.emit_bytes(&[0x0F, 0xB6]);
        self.buf.emit_u8(modrm(0b11, dst.code(), src.code()));
    }

    pub fn push(&mut self, reg: Reg) {
        self.rex(Width::Dword, 0, 0, reg as u8, false);
        self.buf.emit_u8(0x50 + reg.code());
    }

    pub fn pop(&mut self, reg: Reg) {
        self.rex(Width::Dword, 0, 0, reg as u8, false);
        self.buf.emit_u8(0x58 + reg.code());
    }

    // ----- integer arithmetic -----

    pub fn alu_rr(&mut self, op: Alu, dst: Reg, src: Reg) {
        self.op_rr(Width::Qword, &[(op as u8) << 3 | 1], src as u8, dst as u8);
    }

    pub fn alu_rr32(&mut self, op: Alu, dst: Reg, src: Reg) {
        self.op_rr(Width::Dword, &[(op as u8) << 3 | 1], src as u8, dst as u8);
    }

    fn alu_imm(&mut self, width: Width, op: Alu, dst: Reg, imm: i32) {
        self.rex(width, 0, 0, dst as u8, false);
        if fits_i8(imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    pub fn alu_ri(&mut self, op: Alu, dst: Reg, imm: i32) {
        self.alu_imm(Width::Qword, op, dst, imm);
    }

    pub fn alu_ri32(&mut self, op: Alu, dst: Reg, imm: i32) {
        self.alu_imm(Width::Dword, op, dst, imm);
    }

    pub fn imul_rr32(&mut self, dst: Reg, src: Reg) {
        self.op_rr(Width::Dword, &[0x0F, 0xAF], dst as u8, src as u8);
    }

    /// Sign-extend eax into edx.
    pub fn cdq(&mut self) {
        self.buf.emit_u8(0x99);
    }

    /// Signed edx:eax / src; quotient in eax, remainder in edx.
    pub fn idiv32(&mut self, src: Reg) {
        self.op_rr(Width::Dword, &[0xF7], 7, src as u8);
    }

    pub fn neg32(&mut self, dst: Reg) {
        self.op_rr(Width::Dword, &[0xF7], 3, dst as u8);
    }

    pub fn not32(&mut self, dst: Reg) {
        self.op_rr(Width::Dword, &[0xF7], 2, dst as u8);
    }

    pub fn shift_ri(&mut self, op: Shift, dst: Reg, imm: u8) {
        self.op_rr(Width::Qword, &[0xC1], op as u8, dst as u8);
        self.buf.emit_u8(imm);
    }

    /// 32-bit shift by cl; the count is masked to five bits by the CPU.
    pub fn shift_cl32(&mut self, op: Shift, dst: Reg) {
        self.op_rr(Width::Dword, &[0xD3], op as u8, dst as u8);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.op_rr(Width::Qword, &[0x85], b as u8, a as u8);
    }

    pub fn test_rr32(&mut self, a: Reg, b: Reg) {
        self.op_rr(Width::Dword, &[0x85], b as u8, a as u8);
    }

    pub fn setcc(&mut self, cond: Cond, dst: Reg) {
        self.rex(Width::Dword, 0, 0, dst as u8, dst.code() >= 4);
        self.buf.emit_bytes(&[0x0F, 0x90 + cond as u8]);
        self.buf.emit_u8(modrm(0b11, 0, dst.code()));
    }

    // ----- control flow -----

    pub fn jmp(&mut self, label: Label) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label);
    }

    pub fn jcc(&mut self, cond: Cond, label: Label) {
        self.buf.emit_bytes(&[0x0F, 0x80 + cond as u8]);
        self.buf.emit_label_ref(label);
    }

    pub fn jmp_r(&mut self, target: Reg) {
        self.op_rr(Width::Dword, &[0xFF], 4, target as u8);
    }

    pub fn call_r(&mut self, target: Reg) {
        self.op_rr(Width::Dword, &[0xFF], 2, target as u8);
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ----- scalar double -----

    /// `movq xmm, r64`
    pub fn movq_to_xmm(&mut self, dst: Xmm, src: Reg) {
        self.sse(0x66, Width::Qword, 0x6E, dst.0, src as u8);
    }

    /// `movq r64, xmm`
    pub fn movq_from_xmm(&mut self, dst: Reg, src: Xmm) {
        self.sse(0x66, Width::Qword, 0x7E, src.0, dst as u8);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse(0xF2, Width::Dword, 0x58, dst.0, src.0);
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse(0xF2, Width::Dword, 0x59, dst.0, src.0);
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse(0xF2, Width::Dword, 0x5C, dst.0, src.0);
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse(0xF2, Width::Dword, 0x5E, dst.0, src.0);
    }

    pub fn sqrtsd(&mut self, dst: Xmm, src: Xmm) {
        self.sse(0xF2, Width::Dword, 0x51, dst.0, src.0);
    }

    /// Unordered compare; sets ZF, PF and CF. PF=1 means a NaN was involved.
    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.sse(0x66, Width::Dword, 0x2E, a.0, b.0);
    }

    /// `cvtsi2sd xmm, r64`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Reg) {
        self.sse(0xF2, Width::Qword, 0x2A, dst.0, src as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut Assembler)) -> Vec<u8> {
        let mut asm = Assembler::new();
        f(&mut asm);
        asm.finish().unwrap()
    }

    #[test]
    fn test_mov_rr() {
        assert_eq!(assemble(|a| a.mov_rr(Reg::Rax, Reg::Rcx)), [0x48, 0x89, 0xC8]);
        assert_eq!(assemble(|a| a.mov_rr(Reg::R9, Reg::R8)), [0x4D, 0x89, 0xC1]);
        assert_eq!(assemble(|a| a.mov_rr32(Reg::Rcx, Reg::Rax)), [0x89, 0xC1]);
    }

    #[test]
    fn test_mov_ri_picks_shortest_form() {
        assert_eq!(assemble(|a| a.mov_ri(Reg::Rax, 5)), [0xB8, 5, 0, 0, 0]);
        assert_eq!(
            assemble(|a| a.mov_ri(Reg::R10, u64::MAX)),
            [0x49, 0xC7, 0xC2, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        let bits = 0x7FFA_0000_0000_0000u64;
        let mut expected = vec![0x49, 0xBB];
        expected.extend_from_slice(&bits.to_le_bytes());
        assert_eq!(assemble(|a| a.mov_ri(Reg::R11, bits)), expected);
    }

    #[test]
    fn test_loads_and_stores() {
        assert_eq!(assemble(|a| a.load(Reg::Rax, Mem::base(Reg::Rbx, 8))), [0x48, 0x8B, 0x43, 0x08]);
        assert_eq!(assemble(|a| a.load(Reg::R13, Mem::base(Reg::Rbx, 0))), [0x4C, 0x8B, 0x2B]);
        assert_eq!(assemble(|a| a.store(Mem::base(Reg::Rbx, 0), Reg::R13)), [0x4C, 0x89, 0x2B]);
        // r13 and r12 bases need a disp8 and a SIB byte respectively.
        assert_eq!(assemble(|a| a.load(Reg::Rax, Mem::base(Reg::R13, 0))), [0x49, 0x8B, 0x45, 0x00]);
        assert_eq!(
            assemble(|a| a.load(Reg::Rax, Mem::base(Reg::R12, 8))),
            [0x49, 0x8B, 0x44, 0x24, 0x08]
        );
        assert_eq!(
            assemble(|a| a.load(Reg::Rax, Mem::base(Reg::Rbx, 0x200))),
            [0x48, 0x8B, 0x83, 0x00, 0x02, 0x00, 0x00]
        );
    }

    #[test]
    fn test_indexed_operands() {
        assert_eq!(
            assemble(|a| a.load(Reg::Rax, Mem::indexed(Reg::Rax, Reg::R11))),
            [0x4A, 0x8B, 0x04, 0xD8]
        );
        assert_eq!(
            assemble(|a| a.store(Mem::indexed(Reg::Rax, Reg::R11), Reg::R13)),
            [0x4E, 0x89, 0x2C, 0xD8]
        );
    }

    #[test]
    fn test_narrow_loads() {
        assert_eq!(assemble(|a| a.load32(Reg::R10, Mem::base(Reg::Rax, 16))), [0x44, 0x8B, 0x50, 0x10]);
        assert_eq!(assemble(|a| a.load8(Reg::R10, Mem::base(Reg::Rax, 0x40))), [0x44, 0x0F, 0xB6, 0x50, 0x40]);
    }

    #[test]
    fn test_alu() {
        assert_eq!(assemble(|a| a.alu_rr(Alu::Add, Reg::Rax, Reg::Rdx)), [0x48, 0x01, 0xD0]);
        assert_eq!(assemble(|a| a.alu_rr32(Alu::Add, Reg::Rax, Reg::Rdx)), [0x01, 0xD0]);
        assert_eq!(assemble(|a| a.alu_rr(Alu::Cmp, Reg::R11, Reg::Rcx)), [0x49, 0x39, 0xCB]);
        assert_eq!(assemble(|a| a.alu_ri(Alu::Sub, Reg::Rsp, 8)), [0x48, 0x83, 0xEC, 0x08]);
        assert_eq!(
            assemble(|a| a.alu_ri32(Alu::Cmp, Reg::Rax, 0x7FFA)),
            [0x81, 0xF8, 0xFA, 0x7F, 0x00, 0x00]
        );
        assert_eq!(assemble(|a| a.imul_rr32(Reg::Rax, Reg::Rdx)), [0x0F, 0xAF, 0xC2]);
        assert_eq!(assemble(|a| a.idiv32(Reg::R11)), [0x41, 0xF7, 0xFB]);
        assert_eq!(assemble(|a| a.neg32(Reg::Rax)), [0xF7, 0xD8]);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(assemble(|a| a.shift_ri(Shift::Shr, Reg::Rax, 48)), [0x48, 0xC1, 0xE8, 0x30]);
        assert_eq!(assemble(|a| a.shift_ri(Shift::Sar, Reg::Rax, 16)), [0x48, 0xC1, 0xF8, 0x10]);
        assert_eq!(assemble(|a| a.shift_cl32(Shift::Shl, Reg::Rax)), [0xD3, 0xE0]);
    }

    #[test]
    fn test_push_pop() {
        assert_eq!(assemble(|a| a.push(Reg::Rbx)), [0x53]);
        assert_eq!(assemble(|a| a.push(Reg::R12)), [0x41, 0x54]);
        assert_eq!(assemble(|a| a.pop(Reg::R15)), [0x41, 0x5F]);
    }

    #[test]
    fn test_indirect_branches() {
        assert_eq!(assemble(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
        assert_eq!(assemble(|a| a.jmp_r(Reg::Rcx)), [0xFF, 0xE1]);
        assert_eq!(assemble(|a| a.ret()), [0xC3]);
    }

    #[test]
    fn test_label_branches() {
        let code = assemble(|a| {
            let target = a.new_label();
            a.jcc(Cond::E, target);
            a.jmp(target);
            a.bind(target).unwrap();
        });
        assert_eq!(code, [0x0F, 0x84, 5, 0, 0, 0, 0xE9, 0, 0, 0, 0]);
    }

    #[test]
    fn test_lea_label() {
        let code = assemble(|a| {
            let target = a.new_label();
            a.lea_label(Reg::Rdx, target);
            a.bind(target).unwrap();
        });
        assert_eq!(code, [0x48, 0x8D, 0x15, 0, 0, 0, 0]);
    }

    #[test]
    fn test_setcc_and_movzx() {
        assert_eq!(assemble(|a| a.setcc(Cond::E, Reg::Rax)), [0x0F, 0x94, 0xC0]);
        assert_eq!(assemble(|a| a.setcc(Cond::L, Reg::Rsi)), [0x40, 0x0F, 0x9C, 0xC6]);
        assert_eq!(assemble(|a| a.movzx8(Reg::Rax, Reg::Rax)), [0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn test_sse() {
        assert_eq!(assemble(|a| a.movq_to_xmm(Xmm::XMM0, Reg::Rax)), [0x66, 0x48, 0x0F, 0x6E, 0xC0]);
        assert_eq!(assemble(|a| a.movq_from_xmm(Reg::Rax, Xmm::XMM0)), [0x66, 0x48, 0x0F, 0x7E, 0xC0]);
        assert_eq!(assemble(|a| a.addsd(Xmm::XMM0, Xmm::XMM1)), [0xF2, 0x0F, 0x58, 0xC1]);
        assert_eq!(assemble(|a| a.ucomisd(Xmm::XMM0, Xmm::XMM1)), [0x66, 0x0F, 0x2E, 0xC1]);
        assert_eq!(assemble(|a| a.cvtsi2sd(Xmm::XMM0, Reg::Rax)), [0xF2, 0x48, 0x0F, 0x2A, 0xC0]);
        assert_eq!(assemble(|a| a.sqrtsd(Xmm::XMM0, Xmm::XMM0)), [0xF2, 0x0F, 0x51, 0xC0]);
    }

    #[test]
    fn test_movsxd() {
        assert_eq!(assemble(|a| a.movsxd(Reg::Rax, Reg::Rsi)), [0x48, 0x63, 0xC6]);
    }
}
