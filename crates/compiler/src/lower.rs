//! TAC to CBAM lowering with linear live-range register allocation.
//!
//! Registers 0..23 are general purpose; 24..27 are scratch used by the
//! expanded opcode sequences, 28 is the PSW, 29 the stack pointer, 30 the
//! argument pointer and 31 the PC. A long temporary takes one general
//! register, a float temporary an even-aligned pair. Allocation scans the
//! operations forward: at a temporary's first use it takes any register
//! whose current assignment has expired; running out of registers is a hard
//! failure, the file is treated as provably sufficient for compilable
//! programs.
//!
//! Around each user-level call every general register still live past the
//! `JSR` is spilled to the CPU stack (padded to an even count) and restored
//! afterwards in reverse.

use crate::ast::Label;
use crate::cbam::{CbamOperand, CodeList, Opcode};
use crate::diag::Code;
use crate::tac::{AddrMode, Oper, Operand, OperandKind, TacBuf, TacKind};
use crate::Session;

const GENERAL_REGISTERS: usize = 24;

pub fn lower(sess: &mut Session, tac: &TacBuf) -> Result<CodeList, String> {
    let mut cl = CodeList::new();
    cl.set_label_base(tac.label_count());

    // forward-scan register assignment
    let mut regl = vec![0u8; tac.longs.len()];
    let mut regf = vec![0u8; tac.floats.len()];
    let mut reg_exp = [0u32; GENERAL_REGISTERS];
    let mut next_long = 0usize;
    let mut next_float = 0usize;

    // registers spilled between a FRAME and its matching JSR; call setup
    // can nest when an actual parameter itself contains a call
    let mut save_stack: Vec<Vec<u8>> = Vec::new();

    for (i, op) in tac.ops.iter().enumerate() {
        for &label in &op.labels {
            cl.set_label(label);
        }

        while next_long < tac.longs.len()
            && (tac.longs[next_long].dead || tac.longs[next_long].first == i as u32)
        {
            if !tac.longs[next_long].dead {
                let free = (0..GENERAL_REGISTERS).find(|&j| reg_exp[j] <= i as u32);
                match free {
                    Some(j) => {
                        regl[next_long] = j as u8;
                        reg_exp[j] = tac.longs[next_long].last;
                    }
                    None => {
                        sess.diags.internal(Code::OutOfRegisters, "lower");
                        return Err("register allocation exhausted".to_string());
                    }
                }
            }
            next_long += 1;
        }

        while next_float < tac.floats.len()
            && (tac.floats[next_float].dead || tac.floats[next_float].first == i as u32)
        {
            if !tac.floats[next_float].dead {
                let free = (0..GENERAL_REGISTERS)
                    .step_by(2)
                    .find(|&j| reg_exp[j] <= i as u32 && reg_exp[j + 1] <= i as u32);
                match free {
                    Some(j) => {
                        regf[next_float] = j as u8;
                        reg_exp[j] = tac.floats[next_float].last;
                        reg_exp[j + 1] = tac.floats[next_float].last;
                    }
                    None => {
                        sess.diags.internal(Code::OutOfRegisters, "lower");
                        return Err("register allocation exhausted".to_string());
                    }
                }
            }
            next_float += 1;
        }

        match op.kind {
            TacKind::NoOp => {}

            TacKind::Assign => {
                let dst = &op.ops[0];
                let src = &op.ops[1];
                let opcode = if matches!(dst.kind, OperandKind::VByte(_))
                    || matches!(src.kind, OperandKind::VByte(_))
                {
                    Opcode::MovB
                } else if dst.is_float_value() || src.is_float_value() {
                    Opcode::MovF
                } else {
                    Opcode::MovL
                };
                cl.add_operator(opcode);
                cl.add_operand(convert(dst, &regl, &regf)?);
                cl.add_operand(convert(src, &regl, &regf)?);
            }

            TacKind::Unary => match op.oper {
                Some(Oper::Neg) => {
                    if !op.ops[0].is_float_value() {
                        cl.add_operator(Opcode::NegL);
                        cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                        cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
                    } else {
                        cl.add_operator(Opcode::MovF);
                        cl.add_operand(CbamOperand::reg(24));
                        cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
                        cl.add_operator(Opcode::MathOp);
                        cl.add_operand(CbamOperand::lit(131));
                        cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                    }
                }
                Some(Oper::BNot) => {
                    cl.add_operator(Opcode::BNotL);
                    cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                    cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
                }
                Some(Oper::LNot) => {
                    cl.add_operator(Opcode::BNotL);
                    cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                    cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
                    cl.add_operator(Opcode::BAndL);
                    cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                    cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                    cl.add_operand(CbamOperand::lit(1));
                }
                Some(Oper::IntToFloat) => {
                    cl.add_operator(Opcode::MovL);
                    cl.add_operand(CbamOperand::reg(24));
                    cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
                    cl.add_operator(Opcode::MathOp);
                    cl.add_operand(CbamOperand::lit(193));
                    cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                }
                other => return Err(format!("illegal unary operator {:?}", other)),
            },

            TacKind::Binary => {
                lower_binary(&mut cl, op.oper, &op.ops, &regl, &regf)?;
            }

            TacKind::Goto => {
                let target = label_of(&op.ops[0])?;
                cl.add_branch(Opcode::Br, target, 0);
            }

            TacKind::Cond => {
                lower_cond(&mut cl, op.oper, &op.ops, &regl, &regf)?;
            }

            TacKind::Frame => {
                // spill every general register that must survive a
                // user-level call
                let jsr_pos =
                    matching_jsr(tac, i).ok_or("FRAME without a matching JSR")?;
                let mut saved = Vec::new();
                if matches!(tac.ops[jsr_pos].ops[0].kind, OperandKind::Label(_)) {
                    for (j, &expires) in reg_exp.iter().enumerate() {
                        if expires > jsr_pos as u32 {
                            cl.add_operator(Opcode::PushL);
                            cl.add_operand(CbamOperand::reg(j as u8));
                            saved.push(j as u8);
                        }
                    }
                    if saved.len() % 2 == 1 {
                        cl.add_operator(Opcode::PushL);
                        cl.add_operand(CbamOperand::reg(0));
                    }
                }
                save_stack.push(saved);
                cl.add_operator(Opcode::Frame);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                cl.add_operand(convert(&op.ops[1], &regl, &regf)?);
            }

            TacKind::Jsr => {
                cl.add_operator(Opcode::Jsr);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
                if let Some(saved) = save_stack.pop() {
                    if saved.is_empty() {
                        // builtin trampoline, nothing was spilled
                    } else {
                        if saved.len() % 2 == 1 {
                            cl.add_operator(Opcode::PopL);
                        }
                        for &r in saved.iter().rev() {
                            cl.add_operator(Opcode::PopL);
                            cl.add_operator(Opcode::MovL);
                            cl.add_operand(CbamOperand::reg(r));
                            cl.add_operand(CbamOperand::reg_ind(29));
                        }
                    }
                }
            }

            TacKind::Rts => {
                cl.add_operator(Opcode::Rts);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
            }

            TacKind::Halt => {
                cl.add_operator(Opcode::Halt);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
            }

            TacKind::PopL => cl.add_operator(Opcode::PopL),
            TacKind::PopF => cl.add_operator(Opcode::PopF),

            TacKind::PushL => {
                cl.add_operator(Opcode::PushL);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
            }
            TacKind::PushF => {
                cl.add_operator(Opcode::PushF);
                cl.add_operand(convert(&op.ops[0], &regl, &regf)?);
            }
        }
    }

    for &label in tac.pending_labels() {
        cl.set_label(label);
    }

    Ok(cl)
}

/// The JSR balancing a FRAME. Call setup sequences nest like parentheses
/// when an actual parameter contains another call.
fn matching_jsr(tac: &TacBuf, frame_at: usize) -> Option<usize> {
    let mut depth = 0;
    for (k, op) in tac.ops.iter().enumerate().skip(frame_at + 1) {
        match op.kind {
            TacKind::Frame => depth += 1,
            TacKind::Jsr => {
                if depth == 0 {
                    return Some(k);
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Map a TAC operand to a machine operand, substituting the registers the
/// allocator picked for the virtual temporaries.
fn convert(op: &Operand, regl: &[u8], regf: &[u8]) -> Result<CbamOperand, String> {
    let operand = match (op.kind, op.mode) {
        (OperandKind::CLong(v), AddrMode::Direct) => CbamOperand::lit(v),
        (OperandKind::CFloat(m, e), AddrMode::Direct) => CbamOperand::lit_pair(m, e),
        (OperandKind::VByte(t), AddrMode::Direct)
        | (OperandKind::VLong(t), AddrMode::Direct) => CbamOperand::reg(regl[t as usize]),
        (OperandKind::VFloat(t), AddrMode::Direct) => CbamOperand::reg(regf[t as usize]),
        (OperandKind::Label(l), AddrMode::Direct) => CbamOperand::label(l),
        (OperandKind::Reg(r), AddrMode::Direct) => CbamOperand::reg(r),
        (OperandKind::StringId(id), AddrMode::Direct) => CbamOperand::string(id),

        (OperandKind::VByte(t), AddrMode::Ind)
        | (OperandKind::VLong(t), AddrMode::Ind)
        | (OperandKind::VFloat(t), AddrMode::Ind) => CbamOperand::reg_ind(regl[t as usize]),
        (OperandKind::Reg(r), AddrMode::Ind) => CbamOperand::reg_ind(r),

        (OperandKind::VByte(t), AddrMode::Ix(d))
        | (OperandKind::VLong(t), AddrMode::Ix(d))
        | (OperandKind::VFloat(t), AddrMode::Ix(d)) => CbamOperand::reg_idx(regl[t as usize], d),
        (OperandKind::Reg(r), AddrMode::Ix(d)) => CbamOperand::reg_idx(r, d),

        (OperandKind::VByte(t), AddrMode::IxInd(d))
        | (OperandKind::VLong(t), AddrMode::IxInd(d))
        | (OperandKind::VFloat(t), AddrMode::IxInd(d)) => {
            CbamOperand::reg_preidx_ind(regl[t as usize], d)
        }
        (OperandKind::Reg(r), AddrMode::IxInd(d)) => CbamOperand::reg_preidx_ind(r, d),

        (kind, mode) => {
            return Err(format!("illegal operand combination {:?}/{:?}", kind, mode));
        }
    };
    Ok(operand)
}

fn label_of(op: &Operand) -> Result<Label, String> {
    match op.kind {
        OperandKind::Label(l) => Ok(l),
        other => Err(format!("label operand expected, found {:?}", other)),
    }
}

fn power_of_two_shifts(operand: &Operand) -> Option<u32> {
    match (operand.kind, operand.mode) {
        (OperandKind::CLong(v @ (2 | 4 | 8)), AddrMode::Direct) => Some(v.trailing_zeros()),
        _ => None,
    }
}

fn lower_binary(
    cl: &mut CodeList,
    oper: Option<Oper>,
    ops: &[Operand; 3],
    regl: &[u8],
    regf: &[u8],
) -> Result<(), String> {
    if ops[0].is_float_value() {
        // scratch pairs 24/25 and 26/27 feed the float unit
        cl.add_operator(Opcode::MovF);
        cl.add_operand(CbamOperand::reg(24));
        cl.add_operand(convert(&ops[1], regl, regf)?);
        cl.add_operator(Opcode::MovF);
        cl.add_operand(CbamOperand::reg(26));
        cl.add_operand(convert(&ops[2], regl, regf)?);
        cl.add_operator(Opcode::MathOp);
        let function = match oper {
            Some(Oper::Add) => 129,
            Some(Oper::Sub) => 130,
            Some(Oper::Mult) => 132,
            Some(Oper::Div) => 133,
            other => return Err(format!("illegal float operator {:?}", other)),
        };
        cl.add_operand(CbamOperand::lit(function));
        cl.add_operand(convert(&ops[0], regl, regf)?);
        return Ok(());
    }

    match oper {
        Some(Oper::Add) => {
            cl.add_operator(Opcode::AddL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[1], regl, regf)?);
            cl.add_operand(convert(&ops[2], regl, regf)?);
        }
        Some(Oper::Sub) => {
            cl.add_operator(Opcode::NegL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[2], regl, regf)?);
            cl.add_operator(Opcode::AddL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[1], regl, regf)?);
            cl.add_operand(convert(&ops[0], regl, regf)?);
        }
        Some(Oper::Mult) => {
            if let Some(shifts) = power_of_two_shifts(&ops[2]) {
                cl.add_operator(Opcode::MovL);
                cl.add_operand(convert(&ops[0], regl, regf)?);
                cl.add_operand(convert(&ops[1], regl, regf)?);
                for _ in 0..shifts {
                    cl.add_operator(Opcode::ShlL);
                    cl.add_operand(convert(&ops[0], regl, regf)?);
                }
            } else if let Some(shifts) = power_of_two_shifts(&ops[1]) {
                cl.add_operator(Opcode::MovL);
                cl.add_operand(convert(&ops[0], regl, regf)?);
                cl.add_operand(convert(&ops[2], regl, regf)?);
                for _ in 0..shifts {
                    cl.add_operator(Opcode::ShlL);
                    cl.add_operand(convert(&ops[0], regl, regf)?);
                }
            } else {
                math_op(cl, 3, ops, regl, regf)?;
            }
        }
        Some(Oper::Div) => {
            if let Some(shifts) = power_of_two_shifts(&ops[2]) {
                cl.add_operator(Opcode::MovL);
                cl.add_operand(convert(&ops[0], regl, regf)?);
                cl.add_operand(convert(&ops[1], regl, regf)?);
                for _ in 0..shifts {
                    cl.add_operator(Opcode::ShrL);
                    cl.add_operand(convert(&ops[0], regl, regf)?);
                }
            } else {
                math_op(cl, 4, ops, regl, regf)?;
            }
        }
        Some(Oper::Mod) => math_op(cl, 5, ops, regl, regf)?,
        Some(Oper::Shl) | Some(Oper::Shr) => {
            let count = match ops[2].kind {
                OperandKind::CLong(v) if v >= 0 => v,
                other => return Err(format!("illegal shift count {:?}", other)),
            };
            let shift = if oper == Some(Oper::Shl) { Opcode::ShlL } else { Opcode::ShrL };
            cl.add_operator(Opcode::MovL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[1], regl, regf)?);
            for _ in 0..count {
                cl.add_operator(shift);
                cl.add_operand(convert(&ops[0], regl, regf)?);
            }
        }
        Some(Oper::BAnd) => {
            cl.add_operator(Opcode::BAndL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[1], regl, regf)?);
            cl.add_operand(convert(&ops[2], regl, regf)?);
        }
        Some(Oper::BOr) => {
            cl.add_operator(Opcode::BOrL);
            cl.add_operand(convert(&ops[0], regl, regf)?);
            cl.add_operand(convert(&ops[1], regl, regf)?);
            cl.add_operand(convert(&ops[2], regl, regf)?);
        }
        other => return Err(format!("illegal binary operator {:?}", other)),
    }
    Ok(())
}

/// Two-input `MATHOP`: inputs through scratch registers 24 and 25.
fn math_op(
    cl: &mut CodeList,
    function: i32,
    ops: &[Operand; 3],
    regl: &[u8],
    regf: &[u8],
) -> Result<(), String> {
    cl.add_operator(Opcode::MovL);
    cl.add_operand(CbamOperand::reg(24));
    cl.add_operand(convert(&ops[1], regl, regf)?);
    cl.add_operator(Opcode::MovL);
    cl.add_operand(CbamOperand::reg(25));
    cl.add_operand(convert(&ops[2], regl, regf)?);
    cl.add_operator(Opcode::MathOp);
    cl.add_operand(CbamOperand::lit(function));
    cl.add_operand(convert(&ops[0], regl, regf)?);
    Ok(())
}

fn lower_cond(
    cl: &mut CodeList,
    oper: Option<Oper>,
    ops: &[Operand; 3],
    regl: &[u8],
    regf: &[u8],
) -> Result<(), String> {
    let rel = oper.ok_or("COND without a relation")?;
    let target = label_of(&ops[2])?;
    let float = ops[0].is_float_value() || ops[1].is_float_value();

    if float {
        // subtract via the float unit; the sign convention mirrors the
        // integer path below
        let (first, second) = match rel {
            Oper::RLower | Oper::RLeq => (&ops[1], &ops[0]),
            _ => (&ops[0], &ops[1]),
        };
        cl.add_operator(Opcode::MovF);
        cl.add_operand(CbamOperand::reg(24));
        cl.add_operand(convert(first, regl, regf)?);
        cl.add_operator(Opcode::MovF);
        cl.add_operand(CbamOperand::reg(26));
        cl.add_operand(convert(second, regl, regf)?);
        cl.add_operator(Opcode::MathOp);
        cl.add_operand(CbamOperand::lit(130));
        cl.add_operand(CbamOperand::reg(24));
    } else {
        // compute rhs - lhs (or the mirror image) and test the PSW
        let (negated, added) = match rel {
            Oper::RLower | Oper::RLeq | Oper::REq => (&ops[0], &ops[1]),
            _ => (&ops[1], &ops[0]),
        };
        cl.add_operator(Opcode::NegL);
        cl.add_operand(CbamOperand::reg(24));
        cl.add_operand(convert(negated, regl, regf)?);
        cl.add_operator(Opcode::AddL);
        cl.add_operand(CbamOperand::reg(25));
        cl.add_operand(convert(added, regl, regf)?);
        cl.add_operand(CbamOperand::reg(24));
    }

    let pattern = match rel {
        Oper::RLower | Oper::RGreater => 6,
        Oper::RLeq | Oper::RGeq => 4,
        Oper::REq => 2,
        other => return Err(format!("illegal relation {:?}", other)),
    };

    if rel == Oper::REq {
        // equality branches on the zero bit; the builder inverts and
        // expands to a full-range jump
        cl.add_branch(Opcode::BsAny, target, pattern);
    } else {
        cl.add_operator(Opcode::BsAny);
        cl.add_operand(CbamOperand::lit(8));
        cl.add_operand(CbamOperand::lit(pattern));
        cl.add_operand(CbamOperand::lit(pattern));
        cl.add_operator(Opcode::Jmp);
        cl.add_operand(CbamOperand::label(target));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::{semantic, tacgen, typecheck, Options, Session};

    fn lowered(source: &str, opts: Options) -> (CodeList, TacBuf, Session) {
        let mut sess = Session::new(opts);
        let mut parser = Parser::new(source.as_bytes());
        let mut root = parser.parse(&mut sess).expect("parse failed");
        semantic::analyze(&mut sess, &mut root);
        typecheck::check(&mut sess, &mut root);
        assert!(sess.diags.gencode(), "{}", sess.diags.render());
        let mut tac = tacgen::generate(&mut sess, &root).expect("TAC generation failed");
        if sess.opts.optimize {
            crate::optimize::optimize(&mut tac);
        }
        let cl = lower(&mut sess, &tac).expect("lowering failed");
        (cl, tac, sess)
    }

    #[test]
    fn test_no_overlapping_live_ranges_share_a_register() {
        let (_, tac, mut sess) = lowered(
            "PROGRAM p;\n\
             DECLARE x : INTEGER; y : INTEGER;\n\
             BEGIN x := 1 + 2 * 3; y := x + x; WRITE(FORMAT(y)) END.",
            Options::default(),
        );
        // redo the assignment to inspect it
        let mut regl = vec![0u8; tac.longs.len()];
        let mut reg_exp = [0u32; GENERAL_REGISTERS];
        for (t, range) in tac.longs.iter().enumerate() {
            if range.dead {
                continue;
            }
            let j = (0..GENERAL_REGISTERS)
                .find(|&j| reg_exp[j] <= range.first)
                .expect("allocation must succeed");
            regl[t] = j as u8;
            reg_exp[j] = range.last;
        }
        for (a, ra) in tac.longs.iter().enumerate() {
            for (b, rb) in tac.longs.iter().enumerate().skip(a + 1) {
                if ra.dead || rb.dead || regl[a] != regl[b] {
                    continue;
                }
                let disjoint = ra.last <= rb.first || rb.last <= ra.first;
                assert!(disjoint, "temps {} and {} overlap in R{}", a, b, regl[a]);
            }
        }
        // the real lowering agrees with the model
        let _ = lower(&mut sess, &tac).expect("lowering failed");
    }

    #[test]
    fn test_halt_program_serializes() {
        let (mut cl, _, sess) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN RETURN END.",
            Options::default(),
        );
        cl.resolve(&sess.consts).expect("resolve");
        let words = cl.instruction_words().expect("words");
        assert!(!words.is_empty());
        // the listing ends in HALT #0: opcode 0, literal operand
        let tail = &words[words.len() - 2..];
        assert_eq!(tail[0], 6 << 21);
        assert_eq!(tail[1], 0);
    }

    #[test]
    fn test_mult_by_power_of_two_becomes_shifts() {
        // the optimizer propagates #4 into the multiply, which then
        // strength-reduces to two shifts
        let (cl, _, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN READ(x); x := x * 4; WRITE(FORMAT(x)) END.",
            Options { optimize: true, ..Options::default() },
        );
        let shifts = cl.ops.iter().filter(|op| op.opcode == Opcode::ShlL).count();
        assert_eq!(shifts, 2);
        // and no integer multiply goes through the math unit
        assert!(!cl
            .ops
            .iter()
            .any(|op| op.opcode == Opcode::MathOp && op.operands[0] == CbamOperand::lit(3)));
    }

    #[test]
    fn test_general_mult_uses_mathop() {
        let (cl, _, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; y : INTEGER;\n\
             BEGIN READ(x); READ(y); x := x * y; WRITE(FORMAT(x)) END.",
            Options::default(),
        );
        assert!(cl
            .ops
            .iter()
            .any(|op| op.opcode == Opcode::MathOp && op.operands[0] == CbamOperand::lit(3)));
    }

    #[test]
    fn test_float_arithmetic_uses_scratch_pairs() {
        let (cl, _, _) = lowered(
            "PROGRAM p; DECLARE y : REAL; BEGIN y := 1.5 + 2.5; WRITE(FORMAT(y)) END.",
            Options::default(),
        );
        assert!(cl
            .ops
            .iter()
            .any(|op| op.opcode == Opcode::MathOp && op.operands[0] == CbamOperand::lit(129)));
        // inputs staged through R24 and R26
        assert!(cl.ops.iter().any(|op| {
            op.opcode == Opcode::MovF && op.operands.first() == Some(&CbamOperand::reg(26))
        }));
    }

    #[test]
    fn test_cond_emits_bit_test_and_jump() {
        let (cl, _, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER;\n\
             BEGIN x := 0; WHILE x < 3 DO x := x + 1 END END.",
            Options::default(),
        );
        // the loop condition tests the sign/zero bits and jumps
        assert!(cl.ops.iter().any(|op| op.opcode == Opcode::BsAny));
        assert!(cl.ops.iter().any(|op| op.opcode == Opcode::Jmp));
        // the equality test against 0 carries the inverting NOT
        assert!(cl.ops.iter().any(|op| op.opcode == Opcode::Not));
    }

    #[test]
    fn test_registers_saved_around_user_calls() {
        // `1 + f(2)` keeps the temporary holding 1 live across the call
        let (cl, _, _) = lowered(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             FUNCTION f (a : INTEGER) : INTEGER;\n\
             DECLARE t : INTEGER;\n\
             BEGIN RETURN(a) END;\n\
             BEGIN x := 1 + f(2); WRITE(FORMAT(x)) END.",
            Options::default(),
        );
        let frame_at = cl
            .ops
            .iter()
            .position(|op| op.opcode == Opcode::Frame && op.operands[1] != CbamOperand::lit(1))
            .expect("user FRAME");
        // at least one PUSHL of a live register directly before the FRAME,
        // padded to an even count
        let mut pushes = 0;
        let mut at = frame_at;
        while at > 0 && cl.ops[at - 1].opcode == Opcode::PushL {
            pushes += 1;
            at -= 1;
        }
        assert!(pushes >= 2 && pushes % 2 == 0, "saw {} pushes", pushes);
        // and they are restored through the stack pointer afterwards
        assert!(cl.ops.iter().any(|op| {
            op.opcode == Opcode::MovL && op.operands.get(1) == Some(&CbamOperand::reg_ind(29))
        }));
    }

    #[test]
    fn test_builtin_calls_do_not_spill() {
        let (cl, _, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1; WRITE(FORMAT(x)) END.",
            Options::default(),
        );
        // FORMAT's trampoline call is not a user call: no PUSHL spills
        // directly before its FRAME
        let frames: Vec<usize> = cl
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| op.opcode == Opcode::Frame)
            .map(|(i, _)| i)
            .collect();
        for at in frames {
            assert!(at == 0 || cl.ops[at - 1].opcode != Opcode::PushL);
        }
    }
}
