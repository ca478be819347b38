//! Base-block optimization of the TAC stream.
//!
//! The stream is cut into base blocks: straight-line stretches with labels
//! only at entry and control flow only at exit. Inside each block, three
//! rules iterate to fixpoint:
//!
//! * single-use copy propagation: a temporary assigned a constant,
//!   register, label, string id or another long temporary, and referenced
//!   exactly once later in the block, is substituted into that reference
//!   and its definition deleted;
//! * constant folding: binary operations on two constants collapse to an
//!   assignment, as do additions of zero, multiplications by one and the
//!   negation of a constant;
//! * address fusion: `t := Reg + #c` followed by a single access through
//!   `t` rewrites the access into an indexed operand, scaled by the scalar
//!   width of the moved value.
//!
//! Labels of deleted operations migrate to the next live operation. A
//! second run over already-optimized TAC finds nothing to do.

use crate::tac::{AddrMode, Oper, Operand, OperandKind, TacBuf, TacKind, TempId, UseRange};

fn is_flow(kind: TacKind) -> bool {
    matches!(kind, TacKind::Goto | TacKind::Cond | TacKind::Jsr | TacKind::Rts | TacKind::Halt)
}

pub fn optimize(tac: &mut TacBuf) {
    let len = tac.ops.len();
    let mut i = 0;
    while i < len {
        let start = i;
        while i + 1 < len && tac.ops[i + 1].labels.is_empty() && !is_flow(tac.ops[i].kind) {
            i += 1;
        }
        let stop = i;
        if stop > start {
            optimize_block(tac, start, stop);
        }
        i += 1;
    }
}

fn optimize_block(tac: &mut TacBuf, start: usize, stop: usize) {
    loop {
        let mut found = false;
        found |= propagate_copies(tac, start, stop);
        found |= fold_constants(tac, start, stop);
        found |= fuse_addresses(tac, start, stop);
        if !found {
            break;
        }
    }
}

/// First use of long temporary `t` strictly after operation `after`.
fn next_use(tac: &TacBuf, t: TempId, after: usize) -> Option<usize> {
    for (k, op) in tac.ops.iter().enumerate().skip(after + 1) {
        if op.ops.iter().any(|operand| operand.long_temp() == Some(t)) {
            return Some(k);
        }
    }
    None
}

/// Whether `t`, defined at `def`, has exactly one later reference and that
/// reference does not escape the block ending at `stop`.
fn used_once_and_only_here(tac: &TacBuf, t: TempId, def: usize, stop: usize) -> bool {
    let last = tac.longs[t as usize].last as usize;
    if last == 0 || last > stop + 1 {
        return false;
    }
    match next_use(tac, t, def) {
        Some(k) => k + 1 >= last,
        None => false,
    }
}

/// Delete the operation at `index`, migrating its labels to the next live
/// operation.
fn kill(tac: &mut TacBuf, index: usize) {
    let labels = std::mem::take(&mut tac.ops[index].labels);
    tac.ops[index].kind = TacKind::NoOp;
    tac.ops[index].ops = [Operand::NONE; 3];
    tac.ops[index].oper = None;
    if labels.is_empty() {
        return;
    }
    let mut to = index + 1;
    while to < tac.ops.len() && tac.ops[to].kind == TacKind::NoOp {
        to += 1;
    }
    if to < tac.ops.len() {
        let mut merged = labels;
        merged.append(&mut tac.ops[to].labels);
        tac.ops[to].labels = merged;
    }
}

fn clear_temp(tac: &mut TacBuf, t: TempId) {
    tac.longs[t as usize] = UseRange { first: 0, last: 0, dead: true };
}

fn propagate_copies(tac: &mut TacBuf, start: usize, stop: usize) -> bool {
    let mut found = false;
    for j in start..stop {
        if tac.ops[j].kind != TacKind::Assign {
            continue;
        }
        let dst = tac.ops[j].ops[0];
        let src = tac.ops[j].ops[1];
        let t = match (dst.kind, dst.mode) {
            (OperandKind::VLong(t), AddrMode::Direct) => t,
            _ => continue,
        };
        let substitutable = src.mode == AddrMode::Direct
            && matches!(
                src.kind,
                OperandKind::CLong(_)
                    | OperandKind::VLong(_)
                    | OperandKind::Reg(_)
                    | OperandKind::StringId(_)
                    | OperandKind::Label(_)
            );
        if !substitutable || !used_once_and_only_here(tac, t, j, stop) {
            continue;
        }

        let last = tac.longs[t as usize].last as usize;
        for k in j + 1..last.min(tac.ops.len()) {
            for slot in 0..3 {
                let operand = tac.ops[k].ops[slot];
                if operand.long_temp() == Some(t) {
                    // the payload is replaced, the addressing mode stays
                    tac.ops[k].ops[slot] = Operand { kind: src.kind, mode: operand.mode };
                }
            }
        }

        if let OperandKind::VLong(src_t) = src.kind {
            let merged = tac.longs[src_t as usize].last.max(tac.longs[t as usize].last);
            tac.longs[src_t as usize].last = merged;
        }

        kill(tac, j);
        clear_temp(tac, t);
        found = true;
    }
    found
}

fn const_pair(op: &crate::tac::TacOp) -> Option<(i32, i32)> {
    match (op.ops[1], op.ops[2]) {
        (
            Operand { kind: OperandKind::CLong(a), mode: AddrMode::Direct },
            Operand { kind: OperandKind::CLong(b), mode: AddrMode::Direct },
        ) => Some((a, b)),
        _ => None,
    }
}

fn fold_constants(tac: &mut TacBuf, start: usize, stop: usize) -> bool {
    let mut found = false;
    for j in start..stop {
        let dst_is_vlong = matches!(
            (tac.ops[j].ops[0].kind, tac.ops[j].ops[0].mode),
            (OperandKind::VLong(_), AddrMode::Direct)
        );

        // two constant operands collapse to an assignment
        if tac.ops[j].kind == TacKind::Binary && dst_is_vlong {
            if let Some((a, b)) = const_pair(&tac.ops[j]) {
                let folded = match tac.ops[j].oper {
                    Some(Oper::Add) => Some(a.wrapping_add(b)),
                    Some(Oper::Sub) => Some(a.wrapping_sub(b)),
                    Some(Oper::Mult) => Some(a.wrapping_mul(b)),
                    Some(Oper::Div) if b != 0 => Some(a.wrapping_div(b)),
                    Some(Oper::Mod) if b != 0 => Some(a.wrapping_rem(b)),
                    Some(Oper::Shl) if (0..32).contains(&b) => Some(a.wrapping_shl(b as u32)),
                    Some(Oper::Shr) if (0..32).contains(&b) => Some(a.wrapping_shr(b as u32)),
                    Some(Oper::BAnd) => Some(a & b),
                    Some(Oper::BOr) => Some(a | b),
                    _ => None,
                };
                if let Some(folded) = folded {
                    tac.ops[j].kind = TacKind::Assign;
                    tac.ops[j].ops[1] = Operand::clong(folded);
                    tac.ops[j].ops[2] = Operand::NONE;
                    tac.ops[j].oper = None;
                    found = true;
                    continue;
                }
            }
        }

        // negation of a constant
        if tac.ops[j].kind == TacKind::Unary && tac.ops[j].oper == Some(Oper::Neg) && dst_is_vlong
        {
            if let Operand { kind: OperandKind::CLong(v), mode: AddrMode::Direct } =
                tac.ops[j].ops[1]
            {
                tac.ops[j].kind = TacKind::Assign;
                tac.ops[j].ops[1] = Operand::clong(v.wrapping_neg());
                tac.ops[j].oper = None;
                found = true;
                continue;
            }
        }

        // x + 0 and x * 1 collapse to plain moves
        if tac.ops[j].kind == TacKind::Binary && dst_is_vlong {
            let neutral = match tac.ops[j].oper {
                Some(Oper::Add) => Some(0),
                Some(Oper::Mult) => Some(1),
                _ => None,
            };
            if let Some(neutral) = neutral {
                let lhs_neutral = tac.ops[j].ops[1]
                    == Operand { kind: OperandKind::CLong(neutral), mode: AddrMode::Direct };
                let rhs_neutral = tac.ops[j].ops[2]
                    == Operand { kind: OperandKind::CLong(neutral), mode: AddrMode::Direct };
                if lhs_neutral || rhs_neutral {
                    if lhs_neutral {
                        tac.ops[j].ops[1] = tac.ops[j].ops[2];
                    }
                    tac.ops[j].kind = TacKind::Assign;
                    tac.ops[j].ops[2] = Operand::NONE;
                    tac.ops[j].oper = None;
                    found = true;
                }
            }
        }
    }
    found
}

fn fuse_addresses(tac: &mut TacBuf, start: usize, stop: usize) -> bool {
    let mut found = false;
    for j in start..stop {
        if !(tac.ops[j].kind == TacKind::Binary && tac.ops[j].oper == Some(Oper::Add)) {
            continue;
        }
        let t = match (tac.ops[j].ops[0].kind, tac.ops[j].ops[0].mode) {
            (OperandKind::VLong(t), AddrMode::Direct) => t,
            _ => continue,
        };
        let base = match (tac.ops[j].ops[1].kind, tac.ops[j].ops[1].mode) {
            (OperandKind::Reg(r), AddrMode::Direct) => r,
            _ => continue,
        };
        let displacement = match (tac.ops[j].ops[2].kind, tac.ops[j].ops[2].mode) {
            (OperandKind::CLong(c), AddrMode::Direct) => c,
            _ => continue,
        };
        if !used_once_and_only_here(tac, t, j, stop) {
            continue;
        }

        let last = tac.longs[t as usize].last as usize;
        let mut k = last.saturating_sub(1).min(tac.ops.len().saturating_sub(1));
        while k > j && tac.ops[k].kind == TacKind::NoOp {
            k -= 1;
        }
        if k <= j || tac.ops[k].kind != TacKind::Assign {
            continue;
        }

        let load_dst = tac.ops[k].ops[0];
        let load_src = tac.ops[k].ops[1];

        let is_load = matches!(
            (load_dst.kind, load_dst.mode),
            (OperandKind::VLong(_), AddrMode::Direct)
                | (OperandKind::VFloat(_), AddrMode::Direct)
        ) && load_src.mode == AddrMode::Ind
            && load_src.long_temp() == Some(t);

        let is_store = load_dst.mode == AddrMode::Ind && load_dst.long_temp() == Some(t);

        if is_load {
            let scale =
                if matches!(load_dst.kind, OperandKind::VFloat(_)) { 8 } else { 4 };
            tac.ops[k].ops[1] = Operand::reg_ix(base, displacement / scale);
        } else if is_store {
            let scale = if load_src.is_float_value() { 8 } else { 4 };
            tac.ops[k].ops[0] = Operand::reg_ix(base, displacement / scale);
        } else {
            continue;
        }

        kill(tac, j);
        clear_temp(tac, t);
        found = true;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::{semantic, tacgen, typecheck, Options, Session};

    fn optimized(source: &str) -> (TacBuf, TacBuf) {
        let mut sess = Session::new(Options { optimize: true, ..Options::default() });
        let mut parser = Parser::new(source.as_bytes());
        let mut root = parser.parse(&mut sess).expect("parse failed");
        semantic::analyze(&mut sess, &mut root);
        typecheck::check(&mut sess, &mut root);
        assert!(sess.diags.gencode(), "{}", sess.diags.render());
        let raw = tacgen::generate(&mut sess, &root).expect("TAC generation failed");
        let mut opt = raw.clone();
        optimize(&mut opt);
        (raw, opt)
    }

    fn live_ops(tac: &TacBuf) -> usize {
        tac.ops.iter().filter(|op| op.kind != TacKind::NoOp).count()
    }

    #[test]
    fn test_constant_addition_folds() {
        let (raw, opt) = optimized(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1 + 2 END.",
        );
        // 1 + 2 becomes a plain move of #3 somewhere in the stream
        assert!(opt.ops.iter().any(|op| {
            op.kind == TacKind::Assign
                && matches!(op.ops[1].kind, OperandKind::CLong(3))
        }));
        // and no live binary op computes it any more
        assert!(!opt.ops.iter().any(|op| {
            op.kind == TacKind::Binary && const_pair(op).is_some()
        }));
        assert!(live_ops(&opt) < live_ops(&raw));
    }

    #[test]
    fn test_optimize_is_idempotent() {
        let (_, opt) = optimized(
            "PROGRAM p;\n\
             DECLARE\n\
             a : ARRAY[1..3] OF INTEGER;\n\
             x : INTEGER;\n\
             BEGIN a[1] := 10; a[2] := a[1] + 5; x := a[2] * 2; WRITE(FORMAT(x)) END.",
        );
        let mut again = opt.clone();
        optimize(&mut again);
        assert_eq!(opt.ops, again.ops, "second optimization pass changed the stream");
    }

    #[test]
    fn test_address_fusion_produces_indexed_operand() {
        let (_, opt) = optimized(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 7 END.",
        );
        // the store of #7 through the computed address collapses into an
        // indexed store relative to the frame base register
        assert!(opt.ops.iter().any(|op| {
            op.kind == TacKind::Assign
                && matches!(op.ops[0].mode, AddrMode::Ix(_))
                && matches!(op.ops[0].kind, OperandKind::Reg(_))
        }));
    }

    #[test]
    fn test_labels_survive_deletion() {
        let (raw, opt) = optimized(
            "PROGRAM p;\n\
             DECLARE x : INTEGER;\n\
             BEGIN\n\
             WHILE x < 3 DO x := x + 1 END\n\
             END.",
        );
        let count_labels =
            |tac: &TacBuf| tac.ops.iter().map(|op| op.labels.len()).sum::<usize>();
        assert_eq!(
            count_labels(&raw) + raw.pending_labels().len(),
            count_labels(&opt) + opt.pending_labels().len()
        );
        // every label still sits on a live operation
        for op in &opt.ops {
            if !op.labels.is_empty() {
                assert_ne!(op.kind, TacKind::NoOp);
            }
        }
    }

    #[test]
    fn test_copy_propagation_does_not_cross_blocks() {
        // the loop-back edge makes the condition's operand live across
        // blocks; its defining move must survive
        let (_, opt) = optimized(
            "PROGRAM p;\n\
             DECLARE x : INTEGER;\n\
             BEGIN\n\
             x := 0;\n\
             WHILE x < 10 DO x := x + 1 END\n\
             END.",
        );
        assert!(opt.ops.iter().any(|op| op.kind == TacKind::Cond));
        assert!(opt.ops.iter().any(|op| op.kind == TacKind::Goto));
    }

    #[test]
    fn test_untouched_stream_stays_untouched() {
        // a single flow op per block leaves nothing to do
        let (raw, opt) =
            optimized("PROGRAM p; DECLARE x : INTEGER; BEGIN RETURN END.");
        assert_eq!(live_ops(&raw), live_ops(&opt));
    }
}
