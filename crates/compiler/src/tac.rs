//! Three-address intermediate representation.
//!
//! A `TacOp` is a statement kind, up to three operands and an optional
//! arithmetic/comparison operator. Operands vary independently along two
//! axes: the payload (constant long, constant float pair, long or float
//! virtual temporary, machine register, label, string id) and an addressing
//! mode (direct, indirect, indexed, indexed-then-indirected).
//!
//! Virtual temporaries are numbered monotonically per width class. Each
//! records the half-open interval `[first_use, last_use)` of operations it
//! is live across, which later drives the linear register allocation.
//!
//! A quirk inherited from the frame model: a float temporary referenced
//! through a non-direct mode holds an *address* and therefore lives in a
//! long temporary; only direct `VFloat` operands name a float temporary.

use std::fmt::Write as _;

use crate::ast::Label;
use crate::constab::ConstId;

/// Index of a virtual temporary within its width class.
pub type TempId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TacKind {
    NoOp,
    Assign,
    Unary,
    Binary,
    Goto,
    Cond,
    Frame,
    Jsr,
    Rts,
    Halt,
    PopL,
    PopF,
    PushL,
    PushF,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Oper {
    Add,
    Sub,
    Mult,
    Div,
    Mod,
    Neg,
    LNot,
    Shl,
    Shr,
    BAnd,
    BOr,
    BNot,
    IntToFloat,
    RLower,
    RLeq,
    REq,
    RGeq,
    RGreater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    None,
    CLong(i32),
    /// `(mantissa, decimal exponent)` pair of a real constant.
    CFloat(i32, i32),
    VByte(TempId),
    VLong(TempId),
    VFloat(TempId),
    Label(Label),
    Reg(u8),
    StringId(ConstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Direct,
    /// The operand holds an address; access goes through it.
    Ind,
    /// Base plus a fixed element displacement.
    Ix(i32),
    /// Indexed, then indirected.
    IxInd(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand {
    pub kind: OperandKind,
    pub mode: AddrMode,
}

impl Operand {
    pub const NONE: Operand = Operand { kind: OperandKind::None, mode: AddrMode::Direct };

    pub fn clong(v: i32) -> Operand {
        Operand { kind: OperandKind::CLong(v), mode: AddrMode::Direct }
    }

    pub fn cfloat(mantissa: i32, exponent: i32) -> Operand {
        Operand { kind: OperandKind::CFloat(mantissa, exponent), mode: AddrMode::Direct }
    }

    pub fn vbyte(t: TempId) -> Operand {
        Operand { kind: OperandKind::VByte(t), mode: AddrMode::Direct }
    }

    pub fn vbyte_ind(t: TempId) -> Operand {
        Operand { kind: OperandKind::VByte(t), mode: AddrMode::Ind }
    }

    pub fn vbyte_ix(t: TempId, d: i32) -> Operand {
        Operand { kind: OperandKind::VByte(t), mode: AddrMode::Ix(d) }
    }

    pub fn vlong(t: TempId) -> Operand {
        Operand { kind: OperandKind::VLong(t), mode: AddrMode::Direct }
    }

    pub fn vlong_ind(t: TempId) -> Operand {
        Operand { kind: OperandKind::VLong(t), mode: AddrMode::Ind }
    }

    pub fn vlong_ix(t: TempId, d: i32) -> Operand {
        Operand { kind: OperandKind::VLong(t), mode: AddrMode::Ix(d) }
    }

    pub fn vfloat(t: TempId) -> Operand {
        Operand { kind: OperandKind::VFloat(t), mode: AddrMode::Direct }
    }

    pub fn vfloat_ind(t: TempId) -> Operand {
        Operand { kind: OperandKind::VFloat(t), mode: AddrMode::Ind }
    }

    pub fn vfloat_ix(t: TempId, d: i32) -> Operand {
        Operand { kind: OperandKind::VFloat(t), mode: AddrMode::Ix(d) }
    }

    pub fn label(l: Label) -> Operand {
        Operand { kind: OperandKind::Label(l), mode: AddrMode::Direct }
    }

    pub fn reg(r: u8) -> Operand {
        Operand { kind: OperandKind::Reg(r), mode: AddrMode::Direct }
    }

    pub fn reg_ind(r: u8) -> Operand {
        Operand { kind: OperandKind::Reg(r), mode: AddrMode::Ind }
    }

    pub fn reg_ix(r: u8, d: i32) -> Operand {
        Operand { kind: OperandKind::Reg(r), mode: AddrMode::Ix(d) }
    }

    pub fn string_id(id: ConstId) -> Operand {
        Operand { kind: OperandKind::StringId(id), mode: AddrMode::Direct }
    }

    /// The long temporary this operand refers to, if any. Direct `VFloat`
    /// operands name a float temporary instead and are excluded.
    pub fn long_temp(&self) -> Option<TempId> {
        match (self.kind, self.mode) {
            (OperandKind::VByte(t), _) | (OperandKind::VLong(t), _) => Some(t),
            (OperandKind::VFloat(t), mode) if mode != AddrMode::Direct => Some(t),
            _ => None,
        }
    }

    /// Whether the accessed value is 8 bytes wide.
    pub fn is_float_value(&self) -> bool {
        matches!(self.kind, OperandKind::VFloat(_) | OperandKind::CFloat(..))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TacOp {
    pub labels: Vec<Label>,
    pub kind: TacKind,
    pub ops: [Operand; 3],
    pub oper: Option<Oper>,
}

/// Live range of a virtual temporary, in operation indices.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UseRange {
    pub first: u32,
    pub last: u32,
    /// Set when the optimizer substitutes the temporary away.
    pub dead: bool,
}

/// The growing TAC stream of one compilation, together with its label and
/// temporary counters.
#[derive(Debug, Clone, Default)]
pub struct TacBuf {
    pub ops: Vec<TacOp>,
    pending: Vec<Label>,
    label_count: Label,
    pub longs: Vec<UseRange>,
    pub floats: Vec<UseRange>,
}

impl TacBuf {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: TacKind, ops: [Operand; 3], oper: Option<Oper>) {
        let labels = std::mem::take(&mut self.pending);
        self.ops.push(TacOp { labels, kind, ops, oper });
    }

    pub fn assign(&mut self, dst: Operand, src: Operand) {
        self.push(TacKind::Assign, [dst, src, Operand::NONE], None);
    }

    pub fn unary(&mut self, dst: Operand, src: Operand, oper: Oper) {
        self.push(TacKind::Unary, [dst, src, Operand::NONE], Some(oper));
    }

    pub fn binary(&mut self, dst: Operand, lhs: Operand, rhs: Operand, oper: Oper) {
        self.push(TacKind::Binary, [dst, lhs, rhs], Some(oper));
    }

    pub fn cond(&mut self, lhs: Operand, rhs: Operand, target: Label, rel: Oper) {
        self.push(TacKind::Cond, [lhs, rhs, Operand::label(target)], Some(rel));
    }

    pub fn goto(&mut self, target: Label) {
        self.push(TacKind::Goto, [Operand::label(target), Operand::NONE, Operand::NONE], None);
    }

    /// `FRAME depth_delta, frame_size_longs`
    pub fn frame(&mut self, depth_delta: i32, size_longs: i32) {
        self.push(
            TacKind::Frame,
            [Operand::clong(depth_delta), Operand::clong(size_longs), Operand::NONE],
            None,
        );
    }

    pub fn jsr_label(&mut self, target: Label) {
        self.push(TacKind::Jsr, [Operand::label(target), Operand::NONE, Operand::NONE], None);
    }

    /// Call one of the host trampolines at a fixed negative address.
    pub fn jsr_builtin(&mut self, address: i32) {
        self.push(TacKind::Jsr, [Operand::clong(address), Operand::NONE, Operand::NONE], None);
    }

    pub fn rts(&mut self, slots: i32) {
        self.push(TacKind::Rts, [Operand::clong(slots), Operand::NONE, Operand::NONE], None);
    }

    pub fn halt(&mut self, code: Operand) {
        self.push(TacKind::Halt, [code, Operand::NONE, Operand::NONE], None);
    }

    pub fn popl(&mut self) {
        self.push(TacKind::PopL, [Operand::NONE; 3], None);
    }

    pub fn popf(&mut self) {
        self.push(TacKind::PopF, [Operand::NONE; 3], None);
    }

    pub fn pushl(&mut self, value: Operand) {
        self.push(TacKind::PushL, [value, Operand::NONE, Operand::NONE], None);
    }

    pub fn pushf(&mut self, value: Operand) {
        self.push(TacKind::PushF, [value, Operand::NONE, Operand::NONE], None);
    }

    // --- labels ---

    pub fn get_label(&mut self) -> Label {
        self.label_count += 1;
        self.label_count
    }

    /// Attach a label to the next operation pushed.
    pub fn set_label(&mut self, label: Label) {
        self.pending.push(label);
    }

    pub fn label_count(&self) -> Label {
        self.label_count
    }

    /// Labels set after the last operation (they address the end of the
    /// stream).
    pub fn pending_labels(&self) -> &[Label] {
        &self.pending
    }

    // --- virtual temporaries ---

    pub fn alloc_long(&mut self) -> TempId {
        let id = self.longs.len() as TempId;
        self.longs.push(UseRange { first: self.ops.len() as u32, last: 0, dead: false });
        id
    }

    pub fn alloc_float(&mut self) -> TempId {
        let id = self.floats.len() as TempId;
        self.floats.push(UseRange { first: self.ops.len() as u32, last: 0, dead: false });
        id
    }

    pub fn free_long(&mut self, t: TempId) {
        let range = &mut self.longs[t as usize];
        debug_assert_eq!(range.last, 0, "long temporary freed twice");
        range.last = self.ops.len() as u32;
    }

    pub fn free_float(&mut self, t: TempId) {
        let range = &mut self.floats[t as usize];
        debug_assert_eq!(range.last, 0, "float temporary freed twice");
        range.last = self.ops.len() as u32;
    }

    // --- listing ---

    /// Human-readable listing, one operation per line, labels leading.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            if op.kind == TacKind::NoOp {
                continue;
            }
            for label in &op.labels {
                let _ = write!(out, "{} ", label);
            }
            out.push('\t');
            match op.kind {
                TacKind::Assign => {
                    write_operand(&mut out, &op.ops[0]);
                    out.push_str(" := ");
                    write_operand(&mut out, &op.ops[1]);
                }
                TacKind::Unary => {
                    write_operand(&mut out, &op.ops[0]);
                    let name = match op.oper {
                        Some(Oper::Neg) => "-",
                        Some(Oper::LNot) => "LNOT",
                        Some(Oper::BNot) => "BNOT",
                        Some(Oper::IntToFloat) => "INT2FLOAT",
                        _ => "?",
                    };
                    let _ = write!(out, " := {}( ", name);
                    write_operand(&mut out, &op.ops[1]);
                    out.push_str(" )");
                }
                TacKind::Binary => {
                    write_operand(&mut out, &op.ops[0]);
                    out.push_str(" := ");
                    write_operand(&mut out, &op.ops[1]);
                    let name = match op.oper {
                        Some(Oper::Add) => "+",
                        Some(Oper::Sub) => "-",
                        Some(Oper::Mult) => "*",
                        Some(Oper::Div) => "/",
                        Some(Oper::Mod) => "%",
                        Some(Oper::Shl) => "<<",
                        Some(Oper::Shr) => ">>",
                        Some(Oper::BAnd) => "&",
                        Some(Oper::BOr) => "|",
                        _ => "?",
                    };
                    let _ = write!(out, " {} ", name);
                    write_operand(&mut out, &op.ops[2]);
                }
                TacKind::Goto => {
                    out.push_str("goto ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::Cond => {
                    out.push_str("if ");
                    write_operand(&mut out, &op.ops[0]);
                    let name = match op.oper {
                        Some(Oper::RLower) => "<",
                        Some(Oper::RLeq) => "<=",
                        Some(Oper::REq) => "==",
                        Some(Oper::RGeq) => ">=",
                        Some(Oper::RGreater) => ">",
                        _ => "?",
                    };
                    let _ = write!(out, " {} ", name);
                    write_operand(&mut out, &op.ops[1]);
                    out.push_str(" then goto ");
                    write_operand(&mut out, &op.ops[2]);
                }
                TacKind::Frame => {
                    out.push_str("FRAME ");
                    write_operand(&mut out, &op.ops[0]);
                    out.push(' ');
                    write_operand(&mut out, &op.ops[1]);
                }
                TacKind::Jsr => {
                    out.push_str("JSR ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::Rts => {
                    out.push_str("RTS ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::Halt => {
                    out.push_str("HALT ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::PopL => out.push_str("POPL"),
                TacKind::PopF => out.push_str("POPF"),
                TacKind::PushL => {
                    out.push_str("PUSHL ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::PushF => {
                    out.push_str("PUSHF ");
                    write_operand(&mut out, &op.ops[0]);
                }
                TacKind::NoOp => {}
            }
            out.push('\n');
        }
        out
    }
}

fn write_operand(out: &mut String, op: &Operand) {
    if op.mode == AddrMode::Ind {
        out.push('*');
    }
    match op.kind {
        OperandKind::None => out.push('-'),
        OperandKind::CLong(v) => {
            let _ = write!(out, "#{}", v);
        }
        OperandKind::CFloat(m, e) => {
            let _ = write!(out, "#({}*10^{})", m, e);
        }
        OperandKind::VByte(t) => {
            let _ = write!(out, "Byte(l{})", t);
        }
        OperandKind::VLong(t) => {
            let _ = write!(out, "l{}", t);
        }
        OperandKind::VFloat(t) => {
            if op.mode == AddrMode::Direct {
                let _ = write!(out, "f{}", t);
            } else {
                let _ = write!(out, "l{}", t);
            }
        }
        OperandKind::Label(l) => {
            let _ = write!(out, "LABEL_{}", l);
        }
        OperandKind::Reg(r) => {
            let _ = write!(out, "R{}", r);
        }
        OperandKind::StringId(id) => {
            let _ = write!(out, "STRING_{}", id.0);
        }
    }
    if let AddrMode::Ix(d) | AddrMode::IxInd(d) = op.mode {
        let _ = write!(out, "[{}]", d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_attach_to_next_op() {
        let mut tac = TacBuf::new();
        let l = tac.get_label();
        tac.set_label(l);
        tac.assign(Operand::vlong(0), Operand::clong(1));
        tac.goto(l);
        assert_eq!(tac.ops[0].labels, vec![l]);
        assert!(tac.ops[1].labels.is_empty());
    }

    #[test]
    fn test_temp_ranges_track_first_and_last_use() {
        let mut tac = TacBuf::new();
        let t = tac.alloc_long();
        tac.assign(Operand::vlong(t), Operand::clong(1));
        tac.pushl(Operand::vlong(t));
        tac.free_long(t);
        let range = tac.longs[t as usize];
        assert_eq!(range.first, 0);
        assert_eq!(range.last, 2);
        assert!(range.first <= range.last);
    }

    #[test]
    fn test_pending_labels_at_end_are_exposed() {
        let mut tac = TacBuf::new();
        tac.rts(0);
        let l = tac.get_label();
        tac.set_label(l);
        assert_eq!(tac.pending_labels(), &[l]);
    }

    #[test]
    fn test_long_temp_classification() {
        assert_eq!(Operand::vlong(3).long_temp(), Some(3));
        assert_eq!(Operand::vbyte_ind(2).long_temp(), Some(2));
        // an indirect float reference is an address held in a long temp
        assert_eq!(Operand::vfloat_ind(4).long_temp(), Some(4));
        assert_eq!(Operand::vfloat(4).long_temp(), None);
        assert_eq!(Operand::clong(7).long_temp(), None);
    }

    #[test]
    fn test_listing_shapes() {
        let mut tac = TacBuf::new();
        let t = tac.alloc_long();
        tac.assign(Operand::vlong(t), Operand::clong(3));
        tac.binary(Operand::reg(29), Operand::reg(29), Operand::clong(8), Oper::Add);
        let listing = tac.listing();
        assert!(listing.contains("l0 := #3"));
        assert!(listing.contains("R29 := R29 + #8"));
    }
}
