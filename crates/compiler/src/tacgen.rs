//! Lowering of the typed tree to three-address code.
//!
//! Each routine is lowered in isolation: formals get frame offsets first,
//! then local variables, both through a bitmap slot packer that fills
//! partially used 8-byte cells with sub-8-byte scalars. Nested routines are
//! emitted before their parent's body; address labels are issued on demand
//! so forward calls work.
//!
//! Addressing a variable at static nesting difference `d` walks `d` links
//! from the argument pointer, adds the 8-byte frame header plus the frame
//! offset, and dereferences once more per REF layer beyond the first (VAR
//! parameters).

use crate::ast::{Coercion, Decl, DeclKind, Expr, ExprKind, IndexExpr, IndexKind, ObjId, Stat,
    StatKind, Type, TypeTag};
use crate::ast::BinOp;
use crate::constab::ConstId;
use crate::diag::{Class, Code, Domain};
use crate::tac::{Oper, Operand, TacBuf, TempId};
use crate::Session;

/// Stack pointer register.
const SP: u8 = 29;
/// Argument pointer / static link base register.
const AP: u8 = 30;

/// Print/read trampolines at fixed negative addresses, provided by the host.
const TRAP_PRINT_INT: i32 = -8;
const TRAP_PRINT_REAL: i32 = -12;
const TRAP_PRINT_BOOL: i32 = -16;
const TRAP_PRINT_STRING: i32 = -20;
const TRAP_READ_INT: i32 = -40;
const TRAP_READ_REAL: i32 = -48;
const TRAP_READ_BOOL: i32 = -56;

fn up4(n: u32) -> i32 {
    ((n + 3) & !3) as i32
}

/// Generate the TAC stream for a whole program.
pub fn generate(sess: &mut Session, root: &Decl) -> Result<TacBuf, String> {
    let mut generator = TacGen {
        sess,
        tac: TacBuf::new(),
        depth: 0,
        range_label: None,
        string_cr: None,
        popcount: 0,
        seg: SegAlloc::new(),
    };

    let root_obj = root.object.ok_or("program root carries no object")?;
    let root_label = generator.tac.get_label();
    generator.sess.objects[root_obj].label = Some(root_label);

    // nested routines are emitted first; jump over them to the entry point
    let has_routines = match &root.kind {
        DeclKind::Proc { decls, .. } => decls.iter().any(|d| !d.is_var()),
        _ => false,
    };
    if has_routines {
        generator.tac.goto(root_label);
    }

    generator.decl(root)?;
    Ok(generator.tac)
}

struct TacGen<'a> {
    sess: &'a mut Session,
    tac: TacBuf,
    depth: u16,
    /// Label of the shared range-error trampoline, once emitted.
    range_label: Option<i32>,
    /// Pooled `"\n"` used by WRITELN.
    string_cr: Option<ConstId>,
    /// Bytes left on the CPU stack by the last statement's calls.
    popcount: i32,
    seg: SegAlloc,
}

impl TacGen<'_> {
    fn decl(&mut self, node: &Decl) -> Result<(), String> {
        let (formals, decls, stats, func_ret) = match &node.kind {
            DeclKind::Var { .. } => return Ok(()),
            DeclKind::Proc { formals, decls, stats, .. } => (formals, decls, stats, None),
            DeclKind::Func { formals, decls, stats, ret, .. } => {
                (formals, decls, stats, Some(ret))
            }
        };
        let object = node.object.ok_or("routine carries no object")?;

        // frame layout: formals first, local variables after
        self.seg.reset();
        for formal in formals {
            let obj = formal.object.ok_or("formal carries no object")?;
            let (align, len) = {
                let ty = self.sess.objects[obj].var_type();
                (ty.align(), ty.byte_len())
            };
            self.sess.objects[obj].location = self.seg.insert(align, len);
        }
        let formals_space = self.seg.length();
        self.sess.objects[object].location = formals_space;

        for decl in decls.iter().filter(|d| d.is_var()) {
            let obj = decl.object.ok_or("variable carries no object")?;
            let (align, len) = {
                let ty = self.sess.objects[obj].var_type();
                (ty.align(), ty.byte_len())
            };
            self.sess.objects[obj].location = self.seg.insert(align, len);
        }
        let variable_space = self.seg.length();

        // nested routines first
        self.depth += 1;
        for decl in decls.iter().filter(|d| !d.is_var()) {
            let obj = decl.object.ok_or("routine carries no object")?;
            if self.sess.objects[obj].label.is_none() {
                let label = self.tac.get_label();
                self.sess.objects[obj].label = Some(label);
            }
            self.decl(decl)?;
        }
        self.depth -= 1;

        let own_label = self.sess.objects[object].label.ok_or("routine has no label")?;
        self.tac.set_label(own_label);

        if self.depth == 0 || variable_space > formals_space {
            let grow =
                variable_space - formals_space + if self.depth == 0 { 4 } else { 0 };
            self.tac.binary(Operand::reg(SP), Operand::reg(SP), Operand::clong(grow), Oper::Add);
        }

        let returned = self.stats(stats)?;
        if !returned {
            match func_ret {
                Some(ret) => {
                    // fell off the end of a function: the result slot is
                    // still reserved, its value is undefined
                    self.sess.diags.log(
                        Class::Warning,
                        Domain::Semantic,
                        Code::FuncNoReturn,
                        None,
                        node.line,
                    );
                    match ret.simplify().tag() {
                        TypeTag::Boolean | TypeTag::Integer => {
                            self.tac.binary(
                                Operand::reg(SP),
                                Operand::reg(SP),
                                Operand::clong(4),
                                Oper::Add,
                            );
                            self.tac.rts(1);
                        }
                        TypeTag::Real => {
                            self.tac.binary(
                                Operand::reg(SP),
                                Operand::reg(SP),
                                Operand::clong(8),
                                Oper::Add,
                            );
                            self.tac.rts(2);
                        }
                        TypeTag::Array => {
                            let n = up4(ret.byte_len());
                            self.tac.binary(
                                Operand::reg(SP),
                                Operand::reg(SP),
                                Operand::clong(n),
                                Oper::Add,
                            );
                            self.tac.rts(n / 4);
                        }
                        TypeTag::String => {
                            self.sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::StringUnsupported,
                                Some("function result".to_string()),
                                node.line,
                            );
                        }
                        other => return Err(format!("illegal result type {:?}", other)),
                    }
                }
                None => {
                    if self.depth > 0 {
                        self.tac.rts(0);
                    } else {
                        self.tac.halt(Operand::clong(0));
                    }
                }
            }
        }
        Ok(())
    }

    fn stats(&mut self, stats: &[Stat]) -> Result<bool, String> {
        let mut returned = false;
        for stat in stats {
            if returned {
                self.sess.diags.log(
                    Class::Notice,
                    Domain::Semantic,
                    Code::NeverReached,
                    None,
                    stat.line,
                );
                break;
            }
            self.popcount = 0;
            returned = self.stat(stat)?;
            if self.popcount != 0 {
                let pop = self.popcount;
                self.tac.binary(
                    Operand::reg(SP),
                    Operand::reg(SP),
                    Operand::clong(-pop),
                    Oper::Add,
                );
                self.popcount = 0;
            }
        }
        Ok(returned)
    }

    /// Lower one statement; the result says whether it was a RETURN.
    fn stat(&mut self, stat: &Stat) -> Result<bool, String> {
        match &stat.kind {
            StatKind::Assign { target, value } => {
                let v = self.expr(value)?;
                let adr = self.index(target)?;
                match value.final_tag() {
                    TypeTag::Array => {
                        let v = v.ok_or("array value missing")?;
                        self.copy_array(adr, v, target.ty())?;
                        self.tac.free_long(v);
                    }
                    TypeTag::Real => {
                        let v = v.ok_or("real value missing")?;
                        self.tac.assign(Operand::vfloat_ind(adr), Operand::vfloat(v));
                        self.tac.free_float(v);
                    }
                    TypeTag::Boolean => {
                        let v = v.ok_or("boolean value missing")?;
                        self.tac.assign(Operand::vbyte_ind(adr), Operand::vbyte(v));
                        self.tac.free_long(v);
                    }
                    TypeTag::Integer => {
                        let v = v.ok_or("integer value missing")?;
                        self.tac.assign(Operand::vlong_ind(adr), Operand::vlong(v));
                        self.tac.free_long(v);
                    }
                    TypeTag::String => {
                        self.sess.diags.log(
                            Class::Error,
                            Domain::Type,
                            Code::StringUnsupported,
                            Some("assignment".to_string()),
                            stat.line,
                        );
                        if let Some(v) = v {
                            self.tac.free_long(v);
                        }
                    }
                    other => return Err(format!("illegal assignment type {:?}", other)),
                }
                self.tac.free_long(adr);
            }

            StatKind::Call { name, actuals } => {
                let obj = name.object.ok_or("unresolved call target")?;
                self.call_any(obj, actuals)?;
            }

            StatKind::If { cond, then_stats, else_stats } => {
                let v = self.expr(cond)?.ok_or("condition has no value")?;
                let else_label = self.tac.get_label();
                self.tac.cond(Operand::vlong(v), Operand::clong(0), else_label, Oper::REq);
                self.tac.free_long(v);
                self.stats(then_stats)?;
                let end_label = self.tac.get_label();
                self.tac.goto(end_label);
                self.tac.set_label(else_label);
                self.stats(else_stats)?;
                self.tac.set_label(end_label);
            }

            StatKind::While { cond, body } => {
                let loop_label = self.tac.get_label();
                self.tac.set_label(loop_label);
                let v = self.expr(cond)?.ok_or("condition has no value")?;
                let end_label = self.tac.get_label();
                self.tac.cond(Operand::vlong(v), Operand::clong(0), end_label, Oper::REq);
                self.stats(body)?;
                self.tac.goto(loop_label);
                self.tac.set_label(end_label);
                self.tac.free_long(v);
            }

            StatKind::Write { arg } | StatKind::WriteLn { arg } => {
                // STRING expressions print as they evaluate
                if let Some(v) = self.expr(arg)? {
                    self.tac.free_long(v);
                }
                if matches!(stat.kind, StatKind::WriteLn { .. }) {
                    self.tac.frame(0, 1);
                    let cr = match self.string_cr {
                        Some(id) => id,
                        None => {
                            let id = self.sess.consts.insert(b"\n\0", true);
                            self.string_cr = Some(id);
                            id
                        }
                    };
                    self.tac.assign(Operand::reg_ix(SP, -1), Operand::string_id(cr));
                    self.tac.jsr_builtin(TRAP_PRINT_STRING);
                }
            }

            StatKind::Read { arg } => {
                let target = match &arg.kind {
                    ExprKind::Index(index) => index,
                    _ => return Err("READ argument is not a variable".to_string()),
                };
                self.tac.frame(0, 0);
                match arg.real_tag() {
                    TypeTag::Integer => {
                        self.tac.jsr_builtin(TRAP_READ_INT);
                        self.tac.popl();
                        let v = self.tac.alloc_long();
                        self.tac.assign(Operand::vlong(v), Operand::reg_ind(SP));
                        let adr = self.index(target)?;
                        self.tac.assign(Operand::vlong_ind(adr), Operand::vlong(v));
                        self.tac.free_long(v);
                        self.tac.free_long(adr);
                    }
                    TypeTag::Real => {
                        self.tac.jsr_builtin(TRAP_READ_REAL);
                        self.tac.popf();
                        let v = self.tac.alloc_float();
                        self.tac.assign(Operand::vfloat(v), Operand::reg_ind(SP));
                        let adr = self.index(target)?;
                        self.tac.assign(Operand::vfloat_ind(adr), Operand::vfloat(v));
                        self.tac.free_float(v);
                        self.tac.free_long(adr);
                    }
                    TypeTag::Boolean => {
                        self.tac.jsr_builtin(TRAP_READ_BOOL);
                        self.tac.popl();
                        let v = self.tac.alloc_long();
                        self.tac.assign(Operand::vlong(v), Operand::reg_ind(SP));
                        let adr = self.index(target)?;
                        self.tac.assign(Operand::vbyte_ind(adr), Operand::vlong(v));
                        self.tac.free_long(v);
                        self.tac.free_long(adr);
                    }
                    other => return Err(format!("illegal READ type {:?}", other)),
                }
            }

            StatKind::Return { value } => {
                if self.depth == 0 {
                    self.tac.halt(Operand::clong(0));
                } else {
                    match value {
                        Some(expr) => {
                            let v = self.expr(expr)?;
                            match expr.final_tag() {
                                TypeTag::Array => {
                                    let v = v.ok_or("array value missing")?;
                                    let n = up4(expr.ty().byte_len());
                                    let adr = self.tac.alloc_long();
                                    self.tac.assign(Operand::vlong(adr), Operand::reg(SP));
                                    self.tac.binary(
                                        Operand::reg(SP),
                                        Operand::reg(SP),
                                        Operand::clong(n),
                                        Oper::Add,
                                    );
                                    self.copy_array(adr, v, expr.ty())?;
                                    self.tac.rts(n / 4);
                                    self.tac.free_long(adr);
                                    self.tac.free_long(v);
                                }
                                TypeTag::Real => {
                                    let v = v.ok_or("real value missing")?;
                                    self.tac.pushf(Operand::vfloat(v));
                                    self.tac.rts(2);
                                    self.tac.free_float(v);
                                }
                                TypeTag::Boolean | TypeTag::Integer => {
                                    let v = v.ok_or("value missing")?;
                                    self.tac.pushl(Operand::vlong(v));
                                    self.tac.rts(1);
                                    self.tac.free_long(v);
                                }
                                TypeTag::String => {
                                    self.sess.diags.log(
                                        Class::Error,
                                        Domain::Type,
                                        Code::StringUnsupported,
                                        Some("function result".to_string()),
                                        stat.line,
                                    );
                                }
                                other => {
                                    return Err(format!("illegal result type {:?}", other))
                                }
                            }
                        }
                        None => self.tac.rts(0),
                    }
                }
                return Ok(true);
            }

            StatKind::Fail { value } => match value {
                Some(expr) => {
                    let v = self.expr(expr)?.ok_or("FAIL value missing")?;
                    self.tac.halt(Operand::vlong(v));
                    self.tac.free_long(v);
                }
                None => self.tac.halt(Operand::clong(1)),
            },
        }
        Ok(false)
    }

    /// Lower an expression. STRING-typed expressions print immediately and
    /// yield no temporary.
    fn expr(&mut self, node: &Expr) -> Result<Option<TempId>, String> {
        let mut result = match &node.kind {
            ExprKind::Binary { op, op_type, lhs, rhs } => {
                self.binary_expr(node, *op, *op_type, lhs, rhs.as_deref())?
            }

            ExprKind::IfThenElse { cond, then_expr, else_expr } => {
                let v = self.expr(cond)?.ok_or("condition has no value")?;
                let else_label = self.tac.get_label();
                self.tac.cond(Operand::vlong(v), Operand::clong(0), else_label, Oper::REq);
                self.tac.free_long(v);

                match node.real_tag() {
                    TypeTag::String => {
                        // both arms print; no value to merge
                        self.expr(then_expr)?;
                        let end_label = self.tac.get_label();
                        self.tac.goto(end_label);
                        self.tac.set_label(else_label);
                        self.expr(else_expr)?;
                        self.tac.set_label(end_label);
                        None
                    }
                    TypeTag::Real => {
                        let r = self.tac.alloc_float();
                        let vt = self.expr(then_expr)?.ok_or("branch has no value")?;
                        self.tac.assign(Operand::vfloat(r), Operand::vfloat(vt));
                        self.tac.free_float(vt);
                        let end_label = self.tac.get_label();
                        self.tac.goto(end_label);
                        self.tac.set_label(else_label);
                        let ve = self.expr(else_expr)?.ok_or("branch has no value")?;
                        self.tac.assign(Operand::vfloat(r), Operand::vfloat(ve));
                        self.tac.free_float(ve);
                        self.tac.set_label(end_label);
                        Some(r)
                    }
                    _ => {
                        let r = self.tac.alloc_long();
                        let vt = self.expr(then_expr)?.ok_or("branch has no value")?;
                        self.tac.assign(Operand::vlong(r), Operand::vlong(vt));
                        self.tac.free_long(vt);
                        let end_label = self.tac.get_label();
                        self.tac.goto(end_label);
                        self.tac.set_label(else_label);
                        let ve = self.expr(else_expr)?.ok_or("branch has no value")?;
                        self.tac.assign(Operand::vlong(r), Operand::vlong(ve));
                        self.tac.free_long(ve);
                        self.tac.set_label(end_label);
                        Some(r)
                    }
                }
            }

            ExprKind::FunCall { name, actuals } => {
                let obj = name.object.ok_or("unresolved call target")?;
                self.call_any(obj, actuals)?;
                match node.real_tag() {
                    TypeTag::Boolean | TypeTag::Integer => {
                        self.tac.popl();
                        let r = self.tac.alloc_long();
                        self.tac.assign(Operand::vlong(r), Operand::reg_ind(SP));
                        Some(r)
                    }
                    TypeTag::Real => {
                        self.tac.popf();
                        let r = self.tac.alloc_float();
                        self.tac.assign(Operand::vfloat(r), Operand::reg_ind(SP));
                        Some(r)
                    }
                    TypeTag::Array => {
                        // the result stays on the CPU stack; address it
                        let n = up4(node.ty().byte_len());
                        let r = self.tac.alloc_long();
                        self.tac.binary(
                            Operand::vlong(r),
                            Operand::reg(SP),
                            Operand::clong(-n),
                            Oper::Add,
                        );
                        self.popcount += n;
                        Some(r)
                    }
                    TypeTag::String => {
                        self.sess.diags.log(
                            Class::Error,
                            Domain::Type,
                            Code::StringUnsupported,
                            Some("function result".to_string()),
                            node.line,
                        );
                        None
                    }
                    other => return Err(format!("illegal call result type {:?}", other)),
                }
            }

            ExprKind::Index(index) => {
                let adr = self.index(index)?;
                match node.real_tag() {
                    TypeTag::Array => Some(adr), // address of the first element
                    TypeTag::Real => {
                        let r = self.tac.alloc_float();
                        self.tac.assign(Operand::vfloat(r), Operand::vfloat_ind(adr));
                        self.tac.free_long(adr);
                        Some(r)
                    }
                    TypeTag::Boolean => {
                        let r = self.tac.alloc_long();
                        self.tac.assign(Operand::vbyte(r), Operand::vbyte_ind(adr));
                        self.tac.free_long(adr);
                        Some(r)
                    }
                    _ => {
                        let r = self.tac.alloc_long();
                        self.tac.assign(Operand::vlong(r), Operand::vlong_ind(adr));
                        self.tac.free_long(adr);
                        Some(r)
                    }
                }
            }

            ExprKind::IntConst(v) => {
                let r = self.tac.alloc_long();
                self.tac.assign(Operand::vlong(r), Operand::clong(*v));
                Some(r)
            }

            ExprKind::RealConst(id) => {
                let bytes = self
                    .sess
                    .consts
                    .lookup(*id)
                    .ok_or("real constant not in the pool")?;
                let mantissa = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let exponent = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                let r = self.tac.alloc_float();
                self.tac.assign(Operand::vfloat(r), Operand::cfloat(mantissa, exponent));
                Some(r)
            }

            ExprKind::BoolConst(v) => {
                let r = self.tac.alloc_long();
                self.tac.assign(Operand::vlong(r), Operand::clong(*v as i32));
                Some(r)
            }

            ExprKind::StringConst(id) => {
                self.tac.frame(0, 1);
                self.tac.assign(Operand::reg_ix(SP, -1), Operand::string_id(*id));
                self.tac.jsr_builtin(TRAP_PRINT_STRING);
                None
            }

            ExprKind::Format(inner) => {
                let v = self.expr(inner)?;
                match inner.final_tag() {
                    TypeTag::Boolean => {
                        let v = v.ok_or("FORMAT operand missing")?;
                        self.tac.frame(0, 1);
                        let slot = self.tac.alloc_long();
                        self.tac.binary(
                            Operand::vlong(slot),
                            Operand::reg(SP),
                            Operand::clong(-4),
                            Oper::Add,
                        );
                        self.tac.assign(Operand::vbyte_ind(slot), Operand::vlong(v));
                        self.tac.free_long(v);
                        self.tac.free_long(slot);
                        self.tac.jsr_builtin(TRAP_PRINT_BOOL);
                    }
                    TypeTag::Integer => {
                        let v = v.ok_or("FORMAT operand missing")?;
                        self.tac.frame(0, 1);
                        self.tac.assign(Operand::reg_ix(SP, -1), Operand::vlong(v));
                        self.tac.free_long(v);
                        self.tac.jsr_builtin(TRAP_PRINT_INT);
                    }
                    TypeTag::Real => {
                        let v = v.ok_or("FORMAT operand missing")?;
                        self.tac.frame(0, 3);
                        self.tac.assign(Operand::reg_ix(SP, -1), Operand::vfloat(v));
                        self.tac.free_float(v);
                        self.tac.jsr_builtin(TRAP_PRINT_REAL);
                    }
                    TypeTag::String => {} // already printed itself
                    other => return Err(format!("illegal FORMAT type {:?}", other)),
                }
                None
            }
        };

        if node.coercion == Coercion::IntToReal {
            let v = result.ok_or("coercion applied to a value-less expression")?;
            let r = self.tac.alloc_float();
            self.tac.unary(Operand::vfloat(r), Operand::vlong(v), Oper::IntToFloat);
            self.tac.free_long(v);
            result = Some(r);
        }

        Ok(result)
    }

    fn binary_expr(
        &mut self,
        node: &Expr,
        op: BinOp,
        op_type: TypeTag,
        lhs: &Expr,
        rhs: Option<&Expr>,
    ) -> Result<Option<TempId>, String> {
        match op_type {
            TypeTag::Real => {
                let rhs = rhs.ok_or("missing right operand")?;
                let v2 = self.expr(rhs)?.ok_or("operand has no value")?;
                let v1 = self.expr(lhs)?.ok_or("operand has no value")?;
                let result = if op.is_relation() {
                    let r = self.tac.alloc_long();
                    let true_label = self.tac.get_label();
                    match op {
                        BinOp::Lower => self.tac.cond(
                            Operand::vfloat(v1),
                            Operand::vfloat(v2),
                            true_label,
                            Oper::RLower,
                        ),
                        BinOp::Leq => self.tac.cond(
                            Operand::vfloat(v1),
                            Operand::vfloat(v2),
                            true_label,
                            Oper::RLeq,
                        ),
                        BinOp::Equal => self.tac.cond(
                            Operand::vfloat(v1),
                            Operand::vfloat(v2),
                            true_label,
                            Oper::REq,
                        ),
                        BinOp::Geq => self.tac.cond(
                            Operand::vfloat(v2),
                            Operand::vfloat(v1),
                            true_label,
                            Oper::RLeq,
                        ),
                        BinOp::Greater => self.tac.cond(
                            Operand::vfloat(v2),
                            Operand::vfloat(v1),
                            true_label,
                            Oper::RLower,
                        ),
                        _ => unreachable!(),
                    }
                    self.tac.assign(Operand::vlong(r), Operand::clong(0));
                    let end_label = self.tac.get_label();
                    self.tac.goto(end_label);
                    self.tac.set_label(true_label);
                    self.tac.assign(Operand::vlong(r), Operand::clong(1));
                    self.tac.set_label(end_label);
                    r
                } else {
                    let oper = match op {
                        BinOp::Add => Oper::Add,
                        BinOp::Minus => Oper::Sub,
                        BinOp::Mult => Oper::Mult,
                        BinOp::Div => Oper::Div,
                        other => return Err(format!("illegal REAL operator {:?}", other)),
                    };
                    let r = self.tac.alloc_float();
                    self.tac.binary(
                        Operand::vfloat(r),
                        Operand::vfloat(v1),
                        Operand::vfloat(v2),
                        oper,
                    );
                    r
                };
                self.tac.free_float(v1);
                self.tac.free_float(v2);
                Ok(Some(result))
            }

            TypeTag::String => match op {
                BinOp::Concat => {
                    // concatenation of printing expressions prints in order
                    self.expr(lhs)?;
                    if let Some(rhs) = rhs {
                        self.expr(rhs)?;
                    }
                    Ok(None)
                }
                BinOp::Equal => {
                    self.sess.diags.log(
                        Class::Error,
                        Domain::Type,
                        Code::StringUnsupported,
                        Some("comparison".to_string()),
                        node.line,
                    );
                    Ok(None)
                }
                other => Err(format!("illegal STRING operator {:?}", other)),
            },

            // BOOLEANs compute like INTEGERs
            _ => {
                let r = self.tac.alloc_long();
                if op == BinOp::Not {
                    let v1 = self.expr(lhs)?.ok_or("operand has no value")?;
                    self.tac.unary(Operand::vlong(r), Operand::vlong(v1), Oper::LNot);
                    self.tac.free_long(v1);
                    return Ok(Some(r));
                }

                let rhs = rhs.ok_or("missing right operand")?;
                let v2 = self.expr(rhs)?.ok_or("operand has no value")?;
                let v1 = self.expr(lhs)?.ok_or("operand has no value")?;

                if op.is_relation() {
                    let true_label = self.tac.get_label();
                    match op {
                        BinOp::Lower => self.tac.cond(
                            Operand::vlong(v1),
                            Operand::vlong(v2),
                            true_label,
                            Oper::RLower,
                        ),
                        BinOp::Leq => self.tac.cond(
                            Operand::vlong(v1),
                            Operand::vlong(v2),
                            true_label,
                            Oper::RLeq,
                        ),
                        BinOp::Equal => self.tac.cond(
                            Operand::vlong(v1),
                            Operand::vlong(v2),
                            true_label,
                            Oper::REq,
                        ),
                        BinOp::Geq => self.tac.cond(
                            Operand::vlong(v2),
                            Operand::vlong(v1),
                            true_label,
                            Oper::RLeq,
                        ),
                        BinOp::Greater => self.tac.cond(
                            Operand::vlong(v2),
                            Operand::vlong(v1),
                            true_label,
                            Oper::RLower,
                        ),
                        _ => unreachable!(),
                    }
                    self.tac.assign(Operand::vlong(r), Operand::clong(0));
                    let end_label = self.tac.get_label();
                    self.tac.goto(end_label);
                    self.tac.set_label(true_label);
                    self.tac.assign(Operand::vlong(r), Operand::clong(1));
                    self.tac.set_label(end_label);
                } else {
                    let oper = match op {
                        BinOp::Add => Oper::Add,
                        BinOp::Minus => Oper::Sub,
                        BinOp::Mult => Oper::Mult,
                        BinOp::Div => Oper::Div,
                        BinOp::Mod => Oper::Mod,
                        other => return Err(format!("illegal operator {:?}", other)),
                    };
                    self.tac.binary(
                        Operand::vlong(r),
                        Operand::vlong(v1),
                        Operand::vlong(v2),
                        oper,
                    );
                }
                self.tac.free_long(v1);
                self.tac.free_long(v2);
                Ok(Some(r))
            }
        }
    }

    /// Lower a call: `FRAME`, parameter stores into the callee frame, `JSR`.
    fn call_any(&mut self, obj: ObjId, actuals: &[Expr]) -> Result<(), String> {
        use crate::ast::ObjectKind;

        let (callee_depth, location, formals) = {
            let object = &self.sess.objects[obj];
            let formals = match &object.kind {
                ObjectKind::Routine { formals, .. } => formals.clone(),
                ObjectKind::Var { .. } => return Err("call target is not a routine".to_string()),
            };
            (object.depth, object.location, formals)
        };

        self.tac.frame(1 + self.depth as i32 - callee_depth as i32, location / 4 + 1);

        let mut base = None;
        if !formals.is_empty() {
            let b = self.tac.alloc_long();
            self.tac.binary(Operand::vlong(b), Operand::reg(SP), Operand::clong(-location), Oper::Add);
            base = Some(b);
        }

        for (formal, actual) in formals.iter().zip(actuals) {
            let (refdepth, offset) = {
                let fobj = &self.sess.objects[*formal];
                (fobj.var_type().refdepth(), fobj.location)
            };
            let base = base.ok_or("parameter store without base")?;

            if refdepth > 1 {
                // VAR parameter: pass the address
                let target = match &actual.kind {
                    ExprKind::Index(index) => index,
                    _ => return Err("VAR actual is not a variable".to_string()),
                };
                let v = self.index(target)?;
                self.tac.assign(Operand::vlong_ix(base, offset / 4), Operand::vlong(v));
                self.tac.free_long(v);
            } else {
                let v = self.expr(actual)?;
                match actual.final_tag() {
                    TypeTag::Real => {
                        let v = v.ok_or("parameter value missing")?;
                        self.tac.assign(Operand::vfloat_ix(base, offset / 8), Operand::vfloat(v));
                        self.tac.free_float(v);
                    }
                    TypeTag::Array => {
                        let v = v.ok_or("parameter value missing")?;
                        let adr = self.tac.alloc_long();
                        self.tac.binary(
                            Operand::vlong(adr),
                            Operand::vlong(base),
                            Operand::clong(offset),
                            Oper::Add,
                        );
                        self.copy_array(adr, v, actual.ty())?;
                        self.tac.free_long(v);
                        self.tac.free_long(adr);
                    }
                    TypeTag::Integer => {
                        let v = v.ok_or("parameter value missing")?;
                        self.tac.assign(Operand::vlong_ix(base, offset / 4), Operand::vlong(v));
                        self.tac.free_long(v);
                    }
                    TypeTag::Boolean => {
                        let v = v.ok_or("parameter value missing")?;
                        self.tac.assign(Operand::vbyte_ix(base, offset), Operand::vlong(v));
                        self.tac.free_long(v);
                    }
                    TypeTag::String => {
                        self.sess.diags.log(
                            Class::Error,
                            Domain::Type,
                            Code::StringUnsupported,
                            Some("parameter passing".to_string()),
                            actual.line,
                        );
                        if let Some(v) = v {
                            self.tac.free_long(v);
                        }
                    }
                    other => return Err(format!("illegal parameter type {:?}", other)),
                }
            }
        }

        if let Some(base) = base {
            self.tac.free_long(base);
        }

        if self.sess.objects[obj].label.is_none() {
            let label = self.tac.get_label();
            self.sess.objects[obj].label = Some(label);
        }
        let label = self.sess.objects[obj].label.ok_or("callee has no label")?;
        self.tac.jsr_label(label);
        Ok(())
    }

    /// Element-wise copy loop between two array addresses.
    fn copy_array(&mut self, dst: TempId, src: TempId, ty: &Type) -> Result<(), String> {
        let data_len = self.tac.alloc_long();
        let unit_len = self.tac.alloc_long();
        self.tac.assign(Operand::vlong(data_len), Operand::clong(-(ty.byte_len() as i32)));
        let loop_label = self.tac.get_label();

        match ty.element().tag() {
            TypeTag::Integer => {
                self.tac.assign(Operand::vlong(unit_len), Operand::clong(4));
                self.tac.set_label(loop_label);
                self.tac.assign(Operand::vlong_ind(dst), Operand::vlong_ind(src));
            }
            TypeTag::Real => {
                self.tac.assign(Operand::vlong(unit_len), Operand::clong(8));
                self.tac.set_label(loop_label);
                self.tac.assign(Operand::vfloat_ind(dst), Operand::vfloat_ind(src));
            }
            TypeTag::Boolean => {
                self.tac.assign(Operand::vlong(unit_len), Operand::clong(1));
                self.tac.set_label(loop_label);
                self.tac.assign(Operand::vbyte_ind(dst), Operand::vbyte_ind(src));
            }
            other => return Err(format!("illegal array element type {:?}", other)),
        }

        self.tac.binary(Operand::vlong(src), Operand::vlong(src), Operand::vlong(unit_len), Oper::Add);
        self.tac.binary(Operand::vlong(dst), Operand::vlong(dst), Operand::vlong(unit_len), Oper::Add);
        self.tac.binary(
            Operand::vlong(data_len),
            Operand::vlong(data_len),
            Operand::vlong(unit_len),
            Oper::Add,
        );
        self.tac.cond(Operand::vlong(data_len), Operand::clong(0), loop_label, Oper::RLower);
        self.tac.free_long(data_len);
        self.tac.free_long(unit_len);
        Ok(())
    }

    /// Compute the address of a designator into a long temporary.
    fn index(&mut self, node: &IndexExpr) -> Result<TempId, String> {
        let base_name = node.base_name();
        let obj = base_name.object.ok_or("unresolved variable")?;
        let (obj_depth, location, base_ty) = {
            let object = &self.sess.objects[obj];
            (object.depth, object.location, object.var_type().clone())
        };
        let refdepth = base_ty.refdepth();

        let mut var_offset = self.tac.alloc_long();
        self.tac.assign(Operand::vlong(var_offset), Operand::clong(0));

        // subscripts in source order pair with dimensions outermost-first
        let mut subscripts: Vec<&Expr> = Vec::new();
        let mut walk = node;
        while let IndexKind::Index { base, index } = &walk.kind {
            subscripts.push(index);
            walk = base;
        }
        subscripts.reverse();

        let mut ty = base_ty.simplify();
        for subscript in subscripts {
            let (lwb, upb, elem) = match ty {
                Type::Array { lwb, upb, elem } => (*lwb, *upb, elem.as_ref()),
                other => return Err(format!("subscript applied to {:?}", other.tag())),
            };
            let v = self.expr(subscript)?.ok_or("subscript has no value")?;
            let adjusted = self.tac.alloc_long();
            self.tac.binary(Operand::vlong(adjusted), Operand::vlong(v), Operand::clong(-lwb), Oper::Add);
            self.tac.free_long(v);

            if self.sess.opts.range_checks {
                self.range_check(adjusted, upb - lwb);
            }

            let scaled = self.tac.alloc_long();
            self.tac.binary(
                Operand::vlong(scaled),
                Operand::vlong(adjusted),
                Operand::clong(elem.byte_len() as i32),
                Oper::Mult,
            );
            self.tac.free_long(adjusted);
            let summed = self.tac.alloc_long();
            self.tac.binary(
                Operand::vlong(summed),
                Operand::vlong(scaled),
                Operand::vlong(var_offset),
                Oper::Add,
            );
            self.tac.free_long(scaled);
            self.tac.free_long(var_offset);
            var_offset = summed;
            ty = elem;
        }

        // base address: static-link walk, frame header, extra REF layers
        let mut address = self.tac.alloc_long();
        self.tac.assign(Operand::vlong(address), Operand::reg(AP));
        for _ in 0..(1 + self.depth as i32 - obj_depth as i32) {
            let next = self.tac.alloc_long();
            self.tac.assign(Operand::vlong(next), Operand::vlong_ind(address));
            self.tac.free_long(address);
            address = next;
        }
        let next = self.tac.alloc_long();
        self.tac.binary(
            Operand::vlong(next),
            Operand::vlong(address),
            Operand::clong(4 + 4 + location),
            Oper::Add,
        );
        self.tac.free_long(address);
        address = next;
        for _ in 1..refdepth {
            let next = self.tac.alloc_long();
            self.tac.assign(Operand::vlong(next), Operand::vlong_ind(address));
            self.tac.free_long(address);
            address = next;
        }

        let result = self.tac.alloc_long();
        self.tac.binary(
            Operand::vlong(result),
            Operand::vlong(var_offset),
            Operand::vlong(address),
            Oper::Add,
        );
        self.tac.free_long(var_offset);
        self.tac.free_long(address);
        Ok(result)
    }

    /// Range checks for one adjusted subscript. The error trampoline is
    /// emitted inline at the first check; every later check jumps to it.
    fn range_check(&mut self, adjusted: TempId, extent: i32) {
        match self.range_label {
            None => {
                let message = self.sess.consts.insert(b"runtime error: range check\n\0", true);
                let error_label = self.tac.get_label();
                self.range_label = Some(error_label);
                let ok_label = self.tac.get_label();
                self.tac.cond(Operand::vlong(adjusted), Operand::clong(0), ok_label, Oper::RGeq);

                self.tac.set_label(error_label);
                self.tac.frame(0, 1);
                let slot = self.tac.alloc_long();
                self.tac.binary(Operand::vlong(slot), Operand::reg(SP), Operand::clong(-4), Oper::Add);
                self.tac.assign(Operand::vlong_ind(slot), Operand::string_id(message));
                self.tac.free_long(slot);
                self.tac.jsr_builtin(TRAP_PRINT_STRING);
                self.tac.halt(Operand::clong(1));
                self.tac.set_label(ok_label);
            }
            Some(error_label) => {
                self.tac.cond(Operand::vlong(adjusted), Operand::clong(0), error_label, Oper::RLower);
            }
        }
        let error_label = match self.range_label {
            Some(label) => label,
            None => return,
        };
        self.tac.cond(Operand::vlong(adjusted), Operand::clong(extent), error_label, Oper::RGreater);
    }
}

// ============================================================================
//                    Frame slot packing (bitmap allocator)
// ============================================================================

const SEG_CELLS: usize = 65536 / 8;

/// Packs variables into 8-byte frame cells. Each cell carries a bitmap of
/// its occupied bytes; sub-8-byte scalars fill gaps in partially used cells,
/// larger alignments start a new cell. Offsets land directly in generated
/// code, so the packing is part of the calling convention.
struct SegAlloc {
    used: Vec<u8>,
    max: usize,
}

/// Bitmap of `m` bytes ending at byte `n` of a cell; byte 0 of the cell is
/// the highest bit.
fn bits(m: usize, n: usize) -> u8 {
    (((0xffusize >> (8 - m)) << (n - m)) & 0xff) as u8
}

impl SegAlloc {
    fn new() -> Self {
        SegAlloc { used: vec![0; SEG_CELLS], max: 0 }
    }

    fn reset(&mut self) {
        for cell in &mut self.used[..self.max.min(SEG_CELLS)] {
            *cell = 0;
        }
        self.max = 0;
    }

    /// Frame bytes in use, in whole cells.
    fn length(&self) -> i32 {
        (self.max * 8) as i32
    }

    /// Reserve `length` bytes at `align` and return the byte offset.
    fn insert(&mut self, align: u32, length: u32) -> i32 {
        let align = align.max(1) as usize;
        let mut length = length as usize;

        // small scalars first try the gaps of earlier cells
        if align < 8 && length > 0 && length <= 4 {
            for i in 0..self.max {
                if self.used[i] == 0xff {
                    continue;
                }
                let mut j = 8 - align;
                while j >= length {
                    if self.used[i] & bits(length, j) == 0 {
                        self.used[i] |= bits(length, j);
                        return (8 * i + 8 - j) as i32;
                    }
                    if j < align {
                        break;
                    }
                    j -= align;
                }
            }
        }

        // otherwise start in the tail of the last cell when possible
        let result;
        if align < 8 && self.max > 0 {
            let mut taken = 0;
            let mut i = 8 - align;
            while i > 0 {
                if self.used[self.max - 1] & bits(i, i) == 0 {
                    self.used[self.max - 1] |= bits(i, i);
                    length = length.saturating_sub(i);
                    taken = i;
                    break;
                }
                if i < align {
                    break;
                }
                i -= align;
            }
            result = (8 * self.max - taken) as i32;
        } else {
            result = (8 * self.max) as i32;
        }

        for _ in 0..length / 8 {
            self.used[self.max] = 0xff;
            self.max += 1;
        }
        length &= 7;
        if length > 0 {
            self.used[self.max] = bits(length, 8);
            self.max += 1;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::tac::TacKind;
    use crate::{semantic, typecheck, Options};

    fn lowered_with(source: &str, opts: Options) -> (TacBuf, Session) {
        let mut sess = Session::new(opts);
        let mut parser = Parser::new(source.as_bytes());
        let mut root = parser.parse(&mut sess).expect("parse failed");
        semantic::analyze(&mut sess, &mut root);
        typecheck::check(&mut sess, &mut root);
        assert!(sess.diags.gencode(), "{}", sess.diags.render());
        let tac = generate(&mut sess, &root).expect("TAC generation failed");
        (tac, sess)
    }

    fn lowered(source: &str) -> (TacBuf, Session) {
        lowered_with(source, Options::default())
    }

    #[test]
    fn test_return_only_program_halts() {
        let (tac, _) = lowered("PROGRAM p; DECLARE x : INTEGER; BEGIN RETURN END.");
        let halts: Vec<_> = tac.ops.iter().filter(|op| op.kind == TacKind::Halt).collect();
        assert_eq!(halts.len(), 1);
        assert_eq!(halts[0].ops[0], Operand::clong(0));
    }

    #[test]
    fn test_temp_ranges_are_well_formed() {
        let (tac, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1 + 2 * 3; WRITE(FORMAT(x)) END.",
        );
        for range in tac.longs.iter().chain(tac.floats.iter()) {
            assert!(range.first <= range.last, "range {:?}", range);
        }
    }

    #[test]
    fn test_call_emits_frame_and_jsr() {
        let (tac, _) = lowered(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             FUNCTION f (a : INTEGER) : INTEGER;\n\
             DECLARE t : INTEGER;\n\
             BEGIN RETURN(a * a) END;\n\
             BEGIN x := f(4) END.",
        );
        let frame = tac
            .ops
            .iter()
            .find(|op| op.kind == TacKind::Frame && op.ops[1] != Operand::clong(1))
            .expect("user-level FRAME");
        // one INTEGER formal occupies one 8-byte cell: 8/4 + 1 slots
        assert_eq!(frame.ops[1], Operand::clong(3));
        assert!(tac.ops.iter().any(|op| op.kind == TacKind::Jsr
            && matches!(op.ops[0].kind, crate::tac::OperandKind::Label(_))));
        // the result is popped and fetched through the stack pointer
        assert!(tac.ops.iter().any(|op| op.kind == TacKind::PopL));
    }

    #[test]
    fn test_range_checks_emitted_by_default() {
        let source = "PROGRAM p; DECLARE a : ARRAY[1..3] OF INTEGER; BEGIN a[2] := 10 END.";
        let (checked, _) = lowered(source);
        let (unchecked, _) = lowered_with(
            source,
            Options { range_checks: false, ..Options::default() },
        );
        let conds = |tac: &TacBuf| tac.ops.iter().filter(|op| op.kind == TacKind::Cond).count();
        // lower- and upper-bound check plus the trampoline's own guard
        assert!(conds(&checked) >= 2);
        assert_eq!(conds(&unchecked), 0);
        // the range-check message is pooled exactly once
        let (two, _) = lowered(
            "PROGRAM p; DECLARE a : ARRAY[1..3] OF INTEGER; BEGIN a[1] := 1; a[2] := 2 END.",
        );
        let halts = two.ops.iter().filter(|op| op.kind == TacKind::Halt).count();
        // one HALT 1 in the trampoline, one HALT 0 at program end
        assert_eq!(halts, 2);
    }

    #[test]
    fn test_static_link_walk_for_outer_variable() {
        let (tac, _) = lowered(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q;\n\
             DECLARE y : INTEGER;\n\
             BEGIN y := x END;\n\
             BEGIN q() END.",
        );
        // accessing x from q walks one static link: an indirect load of the
        // frame pointer before the header offset is added
        let walks = tac
            .ops
            .iter()
            .filter(|op| {
                op.kind == TacKind::Assign
                    && op.ops[1].mode == crate::tac::AddrMode::Ind
                    && matches!(op.ops[1].kind, crate::tac::OperandKind::VLong(_))
            })
            .count();
        assert!(walks >= 1);
    }

    #[test]
    fn test_writeln_prints_newline_string() {
        let (tac, sess) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN WRITELN(FORMAT(1)) END.",
        );
        // the pooled newline is passed to the print-string trampoline
        assert!(tac.ops.iter().any(|op| {
            op.kind == TacKind::Jsr && op.ops[0] == Operand::clong(TRAP_PRINT_STRING)
        }));
        assert!(sess.consts.string_words().iter().any(|&w| w & 0xff == b'\n' as u32));
    }

    #[test]
    fn test_format_real_uses_three_slot_frame() {
        let (tac, _) = lowered("PROGRAM p; DECLARE y : REAL; BEGIN WRITE(FORMAT(1.5)) END.");
        assert!(tac
            .ops
            .iter()
            .any(|op| op.kind == TacKind::Frame && op.ops[1] == Operand::clong(3)));
        assert!(tac
            .ops
            .iter()
            .any(|op| op.kind == TacKind::Jsr && op.ops[0] == Operand::clong(TRAP_PRINT_REAL)));
    }

    #[test]
    fn test_coercion_becomes_int2float() {
        let (tac, _) = lowered(
            "PROGRAM p; DECLARE x : INTEGER; y : REAL; BEGIN y := x + 1.5 END.",
        );
        assert!(tac
            .ops
            .iter()
            .any(|op| op.kind == TacKind::Unary && op.oper == Some(Oper::IntToFloat)));
    }

    #[test]
    fn test_var_parameter_passes_address() {
        let (tac, _) = lowered(
            "PROGRAM p;\n\
             DECLARE\n\
             a : ARRAY[1..2] OF INTEGER;\n\
             PROCEDURE q (VAR b : ARRAY[1..2] OF INTEGER);\n\
             DECLARE t : INTEGER;\n\
             BEGIN b[1] := 7 END;\n\
             BEGIN q(a) END.",
        );
        // the actual's address is stored into the callee frame slot, and no
        // element copy loop runs at the call site
        assert!(tac.ops.iter().any(|op| {
            op.kind == TacKind::Assign && matches!(op.ops[0].mode, crate::tac::AddrMode::Ix(_))
        }));
        // inside q, the VAR formal costs one extra dereference
        let derefs = tac
            .ops
            .iter()
            .filter(|op| op.kind == TacKind::Assign && op.ops[1].mode == crate::tac::AddrMode::Ind)
            .count();
        assert!(derefs >= 1);
    }

    #[test]
    fn test_array_value_parameter_copies_elements() {
        let (tac, _) = lowered(
            "PROGRAM p;\n\
             DECLARE\n\
             a : ARRAY[1..2] OF INTEGER;\n\
             PROCEDURE q (b : ARRAY[1..2] OF INTEGER);\n\
             DECLARE t : INTEGER;\n\
             BEGIN t := b[1] END;\n\
             BEGIN q(a) END.",
        );
        // the copy loop ends on a backward conditional branch
        assert!(tac.ops.iter().any(|op| op.kind == TacKind::Cond && op.oper == Some(Oper::RLower)));
    }

    #[test]
    fn test_fail_without_argument_halts_one() {
        let (tac, _) = lowered("PROGRAM p; DECLARE x : INTEGER; BEGIN FAIL() END.");
        assert!(tac
            .ops
            .iter()
            .any(|op| op.kind == TacKind::Halt && op.ops[0] == Operand::clong(1)));
    }

    // --- slot packer ---

    #[test]
    fn test_seg_packs_booleans_into_one_cell() {
        let mut seg = SegAlloc::new();
        let a = seg.insert(1, 1);
        let b = seg.insert(1, 1);
        let c = seg.insert(1, 1);
        assert_eq!(a, 0);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(seg.length(), 8);
    }

    #[test]
    fn test_seg_packs_two_ints_into_one_cell() {
        let mut seg = SegAlloc::new();
        let a = seg.insert(4, 4);
        let b = seg.insert(4, 4);
        assert_eq!(a, 0);
        assert_eq!(b, 4);
        assert_eq!(seg.length(), 8);
    }

    #[test]
    fn test_seg_real_starts_a_new_cell() {
        let mut seg = SegAlloc::new();
        seg.insert(4, 4);
        let r = seg.insert(8, 8);
        assert_eq!(r % 8, 0);
        assert_eq!(seg.length(), 16);
    }

    #[test]
    fn test_seg_bool_fills_gap_next_to_int() {
        let mut seg = SegAlloc::new();
        let i = seg.insert(4, 4);
        let b = seg.insert(1, 1);
        assert_eq!(i, 0);
        // the boolean lands inside the same 8-byte cell
        assert!(b > 0 && b < 8, "offset {}", b);
        assert_eq!(seg.length(), 8);
    }

    #[test]
    fn test_seg_array_spans_cells() {
        let mut seg = SegAlloc::new();
        let a = seg.insert(4, 12);
        assert_eq!(a, 0);
        assert_eq!(seg.length(), 16);
        let next = seg.insert(4, 4);
        // the tail of the array's last cell is reused
        assert_eq!(next, 12);
    }

    #[test]
    fn test_seg_reset_clears_state() {
        let mut seg = SegAlloc::new();
        seg.insert(8, 8);
        seg.reset();
        assert_eq!(seg.length(), 0);
        assert_eq!(seg.insert(4, 4), 0);
    }
}
