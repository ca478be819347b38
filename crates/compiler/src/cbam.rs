//! CBAM machine-code list, label resolution and serialization.
//!
//! The target is a 32-register stack-frame machine. Operations carry up to
//! three operands, each with an addressing mode and a value class. Label
//! operands are resolved to absolute byte addresses in a linear sweep that
//! assigns every operation its starting address (4 bytes per opcode word,
//! 4 per non-register operand, 4 per indexed displacement, 4 more for a
//! float literal); forward references are backpatched. String-id operands
//! become `code_size + string_offset`.
//!
//! The serialized listing is pure ASCII: one decimal u32 per instruction
//! word and literal word, then `S`, then the pooled string bytes as
//! little-endian words (appended by the driver).

use std::fmt::Write as _;

use crate::ast::Label;
use crate::constab::{ConstId, ConstTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Halt,
    MovB,
    MovS,
    MovL,
    MovF,
    PushB,
    PushS,
    PushL,
    PushF,
    PopL,
    PopF,
    AddS,
    AddL,
    NegS,
    NegL,
    MathOp,
    Not,
    CpL,
    CpF,
    ShlL,
    ShrL,
    BAndL,
    BOrL,
    BNotL,
    Jmp,
    Br,
    BsAll,
    BsAny,
    Bl,
    Frame,
    Jsr,
    Rts,
}

impl Opcode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Halt => "HALT",
            Opcode::MovB => "MOVB",
            Opcode::MovS => "MOVS",
            Opcode::MovL => "MOVL",
            Opcode::MovF => "MOVF",
            Opcode::PushB => "PUSHB",
            Opcode::PushS => "PUSHS",
            Opcode::PushL => "PUSHL",
            Opcode::PushF => "PUSHF",
            Opcode::PopL => "POPL",
            Opcode::PopF => "POPF",
            Opcode::AddS => "ADDS",
            Opcode::AddL => "ADDL",
            Opcode::NegS => "NEGS",
            Opcode::NegL => "NEGL",
            Opcode::MathOp => "MATHOP",
            Opcode::Not => "NOT",
            Opcode::CpL => "CPL",
            Opcode::CpF => "CPF",
            Opcode::ShlL => "SHLL",
            Opcode::ShrL => "SHRL",
            Opcode::BAndL => "BANDL",
            Opcode::BOrL => "BORL",
            Opcode::BNotL => "BNOTL",
            Opcode::Jmp => "JMP",
            Opcode::Br => "BR",
            Opcode::BsAll => "BSALL",
            Opcode::BsAny => "BSANY",
            Opcode::Bl => "BL",
            Opcode::Frame => "FRAME",
            Opcode::Jsr => "JSR",
            Opcode::Rts => "RTS",
        }
    }

    fn has_float_literal(self) -> bool {
        matches!(self, Opcode::MovF | Opcode::PushF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Lit,
    Direct,
    Ind,
    Idx,
    PostIdxInd,
    PreIdxInd,
    DblInd,
    IdxDblInd,
}

impl Mode {
    pub fn encoding(self) -> u32 {
        match self {
            Mode::Lit => 6,
            Mode::Direct => 0,
            Mode::Ind => 1,
            Mode::Idx => 2,
            Mode::PostIdxInd => 3,
            Mode::PreIdxInd => 5,
            Mode::DblInd => 4,
            Mode::IdxDblInd => 7,
        }
    }

    fn has_displacement(self) -> bool {
        matches!(self, Mode::Idx | Mode::PostIdxInd | Mode::PreIdxInd | Mode::IdxDblInd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    Val,
    Reg,
    Label,
    StringId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbamOperand {
    pub mode: Mode,
    pub vtype: ValType,
    pub value: [i32; 2],
}

impl CbamOperand {
    pub fn lit(v: i32) -> Self {
        CbamOperand { mode: Mode::Lit, vtype: ValType::Val, value: [v, 0] }
    }

    /// Float literal: mantissa and decimal exponent, two words.
    pub fn lit_pair(mantissa: i32, exponent: i32) -> Self {
        CbamOperand { mode: Mode::Lit, vtype: ValType::Val, value: [mantissa, exponent] }
    }

    pub fn reg(r: u8) -> Self {
        CbamOperand { mode: Mode::Direct, vtype: ValType::Reg, value: [r as i32, 0] }
    }

    pub fn reg_ind(r: u8) -> Self {
        CbamOperand { mode: Mode::Ind, vtype: ValType::Reg, value: [r as i32, 0] }
    }

    pub fn reg_idx(r: u8, d: i32) -> Self {
        CbamOperand { mode: Mode::Idx, vtype: ValType::Reg, value: [r as i32, d] }
    }

    pub fn reg_preidx_ind(r: u8, d: i32) -> Self {
        CbamOperand { mode: Mode::PreIdxInd, vtype: ValType::Reg, value: [r as i32, d] }
    }

    pub fn label(l: Label) -> Self {
        CbamOperand { mode: Mode::Lit, vtype: ValType::Label, value: [l, 0] }
    }

    pub fn string(id: ConstId) -> Self {
        CbamOperand { mode: Mode::Lit, vtype: ValType::StringId, value: [id.0 as i32, 0] }
    }
}

#[derive(Debug, Clone)]
pub struct CbamOp {
    pub labels: Vec<Label>,
    pub opcode: Opcode,
    pub operands: Vec<CbamOperand>,
}

/// The growing machine-code list of one compilation.
#[derive(Debug, Default)]
pub struct CodeList {
    pub ops: Vec<CbamOp>,
    pending: Vec<Label>,
    label_count: Label,
    code_size: u32,
    resolved: bool,
}

fn operand_bytes(opcode: Opcode, operand: &CbamOperand) -> u32 {
    let mut bytes = 0;
    if operand.vtype != ValType::Reg {
        bytes += 4;
    }
    if operand.mode.has_displacement() {
        bytes += 4;
    }
    if operand.mode == Mode::Lit && opcode.has_float_literal() {
        bytes += 4;
    }
    bytes
}

impl CodeList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue label numbering where the front end stopped.
    pub fn set_label_base(&mut self, count: Label) {
        self.label_count = count;
    }

    pub fn get_label(&mut self) -> Label {
        self.label_count += 1;
        self.label_count
    }

    /// Attach a label to the next operation added; labels set after the
    /// last operation address the end of the code.
    pub fn set_label(&mut self, label: Label) {
        self.pending.push(label);
    }

    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    pub fn add_operator(&mut self, opcode: Opcode) {
        let labels = std::mem::take(&mut self.pending);
        self.ops.push(CbamOp { labels, opcode, operands: Vec::with_capacity(3) });
        self.code_size += 4;
    }

    /// Append an operand to the operation added last.
    pub fn add_operand(&mut self, operand: CbamOperand) {
        let index = match self.ops.len() {
            0 => return,
            n => n - 1,
        };
        debug_assert!(self.ops[index].operands.len() < 3, "more than three operands");
        self.code_size += operand_bytes(self.ops[index].opcode, &operand);
        self.ops[index].operands.push(operand);
    }

    /// Branches with a limited jump offset are rewritten at build time:
    /// `BR` becomes a `JMP`, `BSALL`/`BSANY` become an inverted bit test
    /// that skips over a full-range `JMP`.
    pub fn add_branch(&mut self, opcode: Opcode, target: Label, pattern: i32) {
        match opcode {
            Opcode::Br | Opcode::Jmp => {
                self.add_operator(Opcode::Jmp);
                self.add_operand(CbamOperand::label(target));
            }
            Opcode::BsAll | Opcode::BsAny => {
                self.add_operator(Opcode::Not);
                self.add_operator(opcode);
                self.add_operand(CbamOperand::lit(8));
                self.add_operand(CbamOperand::lit(pattern));
                self.add_operand(CbamOperand::lit(pattern));
                self.add_operator(Opcode::Jmp);
                self.add_operand(CbamOperand::label(target));
            }
            other => {
                // not range-limited; emit as written
                self.add_operator(other);
                self.add_operand(CbamOperand::label(target));
            }
        }
    }

    /// Two sweeps folded into one pass: assign byte addresses, resolve and
    /// backpatch label operands, rewrite string ids to absolute addresses
    /// inside the final image. Idempotent.
    pub fn resolve(&mut self, consts: &ConstTable) -> Result<(), String> {
        if self.resolved {
            return Ok(());
        }

        let buckets = self.label_count.max(0) as usize + 1;
        let mut addresses: Vec<Option<u32>> = vec![None; buckets];
        let mut patches: Vec<Vec<(usize, usize)>> = vec![Vec::new(); buckets];
        let mut current: u32 = 0;

        for i in 0..self.ops.len() {
            let labels = std::mem::take(&mut self.ops[i].labels);
            for &label in &labels {
                let slot = label as usize;
                if slot >= buckets {
                    return Err(format!("label {} out of range", label));
                }
                addresses[slot] = Some(current);
                for &(op_index, operand_index) in &patches[slot] {
                    self.ops[op_index].operands[operand_index].value[0] = current as i32;
                }
                patches[slot].clear();
            }
            self.ops[i].labels = labels;

            current += 4;
            let opcode = self.ops[i].opcode;
            for operand_index in 0..self.ops[i].operands.len() {
                match self.ops[i].operands[operand_index].vtype {
                    ValType::Label => {
                        let slot = self.ops[i].operands[operand_index].value[0] as usize;
                        if slot >= buckets {
                            return Err(format!("label {} out of range", slot));
                        }
                        match addresses[slot] {
                            Some(address) => {
                                self.ops[i].operands[operand_index].value[0] = address as i32;
                            }
                            None => patches[slot].push((i, operand_index)),
                        }
                        self.ops[i].operands[operand_index].vtype = ValType::Val;
                    }
                    ValType::StringId => {
                        let id = ConstId(self.ops[i].operands[operand_index].value[0] as u32);
                        let offset = consts
                            .string_offset(id)
                            .ok_or("string id missing from the constant pool")?;
                        self.ops[i].operands[operand_index].value[0] =
                            (self.code_size + offset) as i32;
                        self.ops[i].operands[operand_index].vtype = ValType::Val;
                    }
                    ValType::Val | ValType::Reg => {}
                }
                current += operand_bytes(opcode, &self.ops[i].operands[operand_index]);
            }
        }

        // labels addressing the end of the code (the string area)
        for &label in &self.pending {
            let slot = label as usize;
            if slot >= buckets {
                return Err(format!("label {} out of range", label));
            }
            addresses[slot] = Some(current);
            for &(op_index, operand_index) in &patches[slot] {
                self.ops[op_index].operands[operand_index].value[0] = current as i32;
            }
            patches[slot].clear();
        }

        if let Some(missing) = patches.iter().position(|bucket| !bucket.is_empty()) {
            return Err(format!("label {} is never defined", missing));
        }

        debug_assert_eq!(current, self.code_size, "address sweep disagrees with size tracking");
        self.resolved = true;
        Ok(())
    }

    /// The encoded instruction stream: one u32 per opcode word, followed by
    /// the literal words of its operands. Requires resolved labels.
    pub fn instruction_words(&self) -> Result<Vec<u32>, String> {
        if !self.resolved {
            return Err("instruction words requested before label resolution".to_string());
        }
        let mut words = Vec::new();
        for op in &self.ops {
            let mut word = op.opcode.code() << 27;
            for (j, operand) in op.operands.iter().enumerate().take(3) {
                if matches!(operand.vtype, ValType::Label | ValType::StringId) {
                    return Err("unresolved operand in the code list".to_string());
                }
                word |= operand.mode.encoding() << (5 + 8 * (2 - j));
                if operand.vtype == ValType::Reg {
                    word |= 1 << (24 + 2 - j);
                    word |= ((operand.value[0] as u32) & 0x1f) << (8 * (2 - j));
                }
            }
            words.push(word);
            for operand in op.operands.iter().take(3) {
                if operand.vtype == ValType::Val {
                    words.push(operand.value[0] as u32);
                }
                if operand.mode.has_displacement() {
                    words.push(operand.value[1] as u32);
                }
                if operand.mode == Mode::Lit && op.opcode.has_float_literal() {
                    words.push(operand.value[1] as u32);
                }
            }
        }
        Ok(words)
    }

    /// Human-readable listing with byte addresses, for `-d` output.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        let mut current: u32 = 0;
        for op in &self.ops {
            let _ = write!(out, "{} : {} ", current, op.opcode.name());
            current += 4;
            for operand in op.operands.iter().take(3) {
                current += operand_bytes(op.opcode, operand);
                write_cbam_operand(&mut out, op.opcode, operand);
            }
            out.push('\n');
        }
        out
    }
}

fn write_cbam_operand(out: &mut String, opcode: Opcode, operand: &CbamOperand) {
    match (operand.mode, operand.vtype) {
        (Mode::Lit, ValType::Val) => {
            if opcode.has_float_literal() {
                let _ = write!(out, "#{}*10^{} ", operand.value[0], operand.value[1]);
            } else {
                let _ = write!(out, "#{} ", operand.value[0]);
            }
        }
        (Mode::Lit, ValType::Label) => {
            let _ = write!(out, "#LABEL_{} ", operand.value[0]);
        }
        (Mode::Lit, ValType::StringId) => {
            let _ = write!(out, "#STRING_{} ", operand.value[0]);
        }
        (Mode::Direct, ValType::Reg) => {
            let _ = write!(out, "R{} ", operand.value[0]);
        }
        (Mode::Direct, ValType::Val) => {
            let _ = write!(out, "{} ", operand.value[0]);
        }
        (Mode::Ind, ValType::Reg) => {
            let _ = write!(out, "R{}* ", operand.value[0]);
        }
        (Mode::Idx, ValType::Reg) => {
            let _ = write!(out, "R{}[{}] ", operand.value[0], operand.value[1]);
        }
        (Mode::PostIdxInd, ValType::Reg) => {
            let _ = write!(out, "R{}*[{}] ", operand.value[0], operand.value[1]);
        }
        (Mode::PreIdxInd, ValType::Reg) => {
            let _ = write!(out, "R{}[{}]* ", operand.value[0], operand.value[1]);
        }
        (Mode::DblInd, ValType::Reg) => {
            let _ = write!(out, "R{}** ", operand.value[0]);
        }
        (Mode::IdxDblInd, ValType::Reg) => {
            let _ = write!(out, "R{}*[{}]* ", operand.value[0], operand.value[1]);
        }
        _ => out.push_str("[?] "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_encoding_register_operands() {
        let mut cl = CodeList::new();
        cl.add_operator(Opcode::MovL);
        cl.add_operand(CbamOperand::reg(3));
        cl.add_operand(CbamOperand::lit(42));
        cl.resolve(&ConstTable::new()).expect("resolve");
        let words = cl.instruction_words().expect("words");
        // MOVL = 3; operand 0: direct register 3; operand 1: literal
        let expected = (3u32 << 27) | (1 << 26) | (3 << 16) | (6 << (5 + 8));
        assert_eq!(words, vec![expected, 42]);
    }

    #[test]
    fn test_backward_label_resolves_immediately() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.set_label(l);
        cl.add_operator(Opcode::PopL);
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(l));
        cl.resolve(&ConstTable::new()).expect("resolve");
        assert_eq!(cl.ops[1].operands[0].vtype, ValType::Val);
        assert_eq!(cl.ops[1].operands[0].value[0], 0);
    }

    #[test]
    fn test_forward_label_is_backpatched() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.add_operator(Opcode::Jmp); // 4 bytes + 4 literal
        cl.add_operand(CbamOperand::label(l));
        cl.add_operator(Opcode::PopL); // 4 bytes
        cl.set_label(l); // end of code: 12
        cl.resolve(&ConstTable::new()).expect("resolve");
        assert_eq!(cl.ops[0].operands[0].value[0], 12);
    }

    #[test]
    fn test_multiple_forward_references_to_one_label() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(l));
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(l));
        cl.set_label(l);
        cl.add_operator(Opcode::Halt);
        cl.add_operand(CbamOperand::lit(0));
        cl.resolve(&ConstTable::new()).expect("resolve");
        assert_eq!(cl.ops[0].operands[0].value[0], 16);
        assert_eq!(cl.ops[1].operands[0].value[0], 16);
    }

    #[test]
    fn test_undefined_label_is_an_error() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(l));
        assert!(cl.resolve(&ConstTable::new()).is_err());
    }

    #[test]
    fn test_string_id_resolves_past_code_end() {
        let mut consts = ConstTable::new();
        let id = consts.insert(b"hi\0", true);
        let mut cl = CodeList::new();
        cl.add_operator(Opcode::MovL);
        cl.add_operand(CbamOperand::reg_idx(29, -1)); // 4 + 4 displacement
        cl.add_operand(CbamOperand::string(id)); // 4
        cl.resolve(&consts).expect("resolve");
        // code is 12 bytes; the string sits right after it
        assert_eq!(cl.ops[0].operands[1].value[0], 12);
        assert_eq!(cl.ops[0].operands[1].vtype, ValType::Val);
    }

    #[test]
    fn test_float_literal_takes_two_words() {
        let mut cl = CodeList::new();
        cl.add_operator(Opcode::MovF);
        cl.add_operand(CbamOperand::reg(24));
        cl.add_operand(CbamOperand::lit_pair(325, -2));
        cl.resolve(&ConstTable::new()).expect("resolve");
        assert_eq!(cl.code_size(), 12);
        let words = cl.instruction_words().expect("words");
        assert_eq!(words.len(), 3);
        assert_eq!(words[1], 325);
        assert_eq!(words[2], (-2i32) as u32);
    }

    #[test]
    fn test_branch_rewrite_inverts_and_jumps() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.set_label(l);
        cl.add_operator(Opcode::PopL);
        cl.add_branch(Opcode::BsAny, l, 2);
        let names: Vec<_> = cl.ops.iter().map(|op| op.opcode).collect();
        assert_eq!(names, vec![Opcode::PopL, Opcode::Not, Opcode::BsAny, Opcode::Jmp]);
        assert_eq!(cl.ops[2].operands[0], CbamOperand::lit(8));
        cl.resolve(&ConstTable::new()).expect("resolve");
        assert_eq!(cl.ops[3].operands[0].value[0], 0);
    }

    #[test]
    fn test_br_rewrites_to_jmp() {
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.set_label(l);
        cl.add_branch(Opcode::Br, l, 0);
        assert_eq!(cl.ops[0].opcode, Opcode::Jmp);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let consts = ConstTable::new();
        let mut cl = CodeList::new();
        let l = cl.get_label();
        cl.set_label(l);
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(l));
        cl.resolve(&consts).expect("first resolve");
        let words = cl.instruction_words().expect("words");
        cl.resolve(&consts).expect("second resolve");
        assert_eq!(cl.instruction_words().expect("words again"), words);
    }
}
