//! Type attribution and checking.
//!
//! Decorates every expression with its type, inserts INTEGER-to-REAL
//! coercions where the rules allow them, resolves names against the
//! environment chain, and validates parameter passing. Problems are
//! reported and the affected node gets the ERROR type so checking can
//! continue; the ERROR type then matches anything, which keeps one mistake
//! from echoing through every enclosing expression.

use crate::ast::{
    BinOp, Coercion, Decl, DeclKind, EnvId, Expr, ExprKind, IndexExpr, IndexKind, Name, ObjId,
    ObjectKind, Stat, StatKind, Type, TypeTag,
};
use crate::diag::{Class, Code, Domain};
use crate::Session;

pub fn check(sess: &mut Session, root: &mut Decl) {
    let mut checker = Checker { blocks: Vec::new() };
    checker.decl(sess, root);
}

/// The routine whose statements are being checked.
struct BlockCtx {
    env: EnvId,
    /// `Some` inside a FUNCTION, with its declared result type.
    func_ret: Option<Type>,
}

struct Checker {
    blocks: Vec<BlockCtx>,
}

/// INTEGER coerces to REAL; everything else must match structurally. The
/// ERROR type converts to anything so follow-up errors stay quiet.
fn coercion_of(src: &Type, dst: &Type) -> Coercion {
    let src = src.simplify();
    let dst = dst.simplify();
    if src.tag() == TypeTag::Error || dst.tag() == TypeTag::Error {
        return Coercion::Ok;
    }
    if src.same_type(dst) {
        return Coercion::Ok;
    }
    if src.tag() == TypeTag::Integer && dst.tag() == TypeTag::Real {
        return Coercion::IntToReal;
    }
    Coercion::Error
}

fn is_a(expr: &Expr, tags: &[TypeTag]) -> bool {
    let tag = expr.real_tag();
    tag == TypeTag::Error || tags.contains(&tag)
}

impl Checker {
    fn decl(&mut self, sess: &mut Session, node: &mut Decl) {
        let env = node.env;
        let (decls, stats, func_ret) = match &mut node.kind {
            DeclKind::Var { .. } => return,
            DeclKind::Proc { decls, stats, .. } => (decls, stats, None),
            DeclKind::Func { decls, stats, ret, .. } => (decls, stats, Some(ret.clone())),
        };
        let env = match env {
            Some(env) => env,
            None => return, // semantic analysis failed on this node
        };

        self.blocks.push(BlockCtx { env, func_ret });
        for decl in decls.iter_mut() {
            self.decl(sess, decl);
        }
        self.stats(sess, stats);
        self.blocks.pop();
    }

    fn stats(&mut self, sess: &mut Session, stats: &mut [Stat]) {
        for stat in stats.iter_mut() {
            self.stat(sess, stat);
        }
    }

    fn stat(&mut self, sess: &mut Session, stat: &mut Stat) {
        let line = stat.line;
        match &mut stat.kind {
            StatKind::Assign { target, value } => {
                self.index(sess, target);
                self.expr(sess, value);
                value.coercion = self.assign_coercion(sess, target, value);
            }
            StatKind::Call { name, actuals } => {
                let object = self.resolve(sess, name);
                for actual in actuals.iter_mut() {
                    self.expr(sess, actual);
                }
                match object {
                    Some(obj) if sess.objects[obj].is_routine() => {
                        self.check_params(sess, obj, actuals, line);
                    }
                    Some(_) => {
                        sess.diags.log(Class::Error, Domain::Semantic, Code::NoFuncOrProc, None, line);
                    }
                    None => {}
                }
            }
            StatKind::Write { arg } | StatKind::WriteLn { arg } => {
                self.expr(sess, arg);
                if !is_a(arg, &[TypeTag::String]) {
                    sess.diags.log(
                        Class::Error,
                        Domain::Type,
                        Code::ParamType,
                        Some("1=STRING".to_string()),
                        line,
                    );
                }
            }
            StatKind::Read { arg } => {
                self.expr(sess, arg);
                if !matches!(arg.kind, ExprKind::Index(_))
                    || !is_a(arg, &[TypeTag::Integer, TypeTag::Real, TypeTag::Boolean])
                {
                    sess.diags.log(
                        Class::Error,
                        Domain::Type,
                        Code::NoSimpleTypeActual,
                        None,
                        line,
                    );
                }
            }
            StatKind::If { cond, then_stats, else_stats } => {
                self.expr(sess, cond);
                self.stats(sess, then_stats);
                self.stats(sess, else_stats);
                if !is_a(cond, &[TypeTag::Boolean]) {
                    sess.diags.log(Class::Error, Domain::Type, Code::BooleanNeeded, None, line);
                }
            }
            StatKind::While { cond, body } => {
                self.expr(sess, cond);
                self.stats(sess, body);
                if !is_a(cond, &[TypeTag::Boolean]) {
                    sess.diags.log(Class::Error, Domain::Type, Code::BooleanNeeded, None, line);
                }
            }
            StatKind::Return { value } => {
                let func_ret = self.blocks.last().and_then(|b| b.func_ret.clone());
                match value {
                    Some(expr) => match func_ret {
                        None => {
                            sess.diags.log(
                                Class::Error,
                                Domain::Semantic,
                                Code::ParamInProcReturn,
                                None,
                                line,
                            );
                            self.expr(sess, expr);
                        }
                        Some(ret) => {
                            self.expr(sess, expr);
                            expr.coercion = coercion_of(expr.ty(), &ret);
                            if expr.coercion == Coercion::Error {
                                sess.diags.log(
                                    Class::Error,
                                    Domain::Type,
                                    Code::WrongType,
                                    None,
                                    line,
                                );
                            }
                        }
                    },
                    None => {
                        if func_ret.is_some() {
                            sess.diags.log(
                                Class::Error,
                                Domain::Semantic,
                                Code::NoParamInFuncReturn,
                                None,
                                line,
                            );
                        }
                    }
                }
            }
            StatKind::Fail { value } => match value {
                Some(expr) => {
                    self.expr(sess, expr);
                    if !is_a(expr, &[TypeTag::Integer]) {
                        sess.diags.log(
                            Class::Error,
                            Domain::Type,
                            Code::ParamType,
                            Some("#1=INTEGER".to_string()),
                            line,
                        );
                    }
                }
                None => {
                    sess.diags.log(Class::Warning, Domain::Type, Code::ParamCount, None, line);
                }
            },
        }
    }

    fn expr(&mut self, sess: &mut Session, node: &mut Expr) {
        let line = node.line;
        match &mut node.kind {
            ExprKind::Binary { op, op_type, lhs, rhs } => {
                let op = *op;
                self.expr(sess, lhs);
                if let Some(rhs) = rhs.as_deref_mut() {
                    self.expr(sess, rhs);
                }
                match op {
                    BinOp::Equal => {
                        let rhs = match rhs.as_deref_mut() {
                            Some(r) => r,
                            None => return,
                        };
                        let domain =
                            [TypeTag::Integer, TypeTag::Real, TypeTag::Boolean, TypeTag::String];
                        if !is_a(lhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongLhsType,
                                Some("REAL, INTEGER, BOOLEAN or STRING".to_string()),
                                line,
                            );
                        }
                        if !is_a(rhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("REAL, INTEGER, BOOLEAN or STRING".to_string()),
                                line,
                            );
                        }
                        *op_type = unify_operands(sess, lhs, rhs, line);
                        node.ty = Some(Type::Boolean);
                    }
                    BinOp::Lower | BinOp::Leq | BinOp::Geq | BinOp::Greater => {
                        let rhs = match rhs.as_deref_mut() {
                            Some(r) => r,
                            None => return,
                        };
                        let domain = [TypeTag::Integer, TypeTag::Real, TypeTag::Boolean];
                        if !is_a(lhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongLhsType,
                                Some("REAL, INTEGER or BOOLEAN".to_string()),
                                line,
                            );
                        }
                        if !is_a(rhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("REAL, INTEGER or BOOLEAN".to_string()),
                                line,
                            );
                        }
                        *op_type = unify_operands(sess, lhs, rhs, line);
                        node.ty = Some(Type::Boolean);
                    }
                    BinOp::Mod => {
                        let rhs = match rhs.as_deref_mut() {
                            Some(r) => r,
                            None => return,
                        };
                        if !is_a(lhs, &[TypeTag::Integer]) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongLhsType,
                                Some("INTEGER".to_string()),
                                line,
                            );
                        }
                        if !is_a(rhs, &[TypeTag::Integer]) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("INTEGER".to_string()),
                                line,
                            );
                        }
                        *op_type = TypeTag::Integer;
                        node.ty = Some(Type::Integer);
                    }
                    BinOp::Concat => {
                        let rhs = match rhs.as_deref_mut() {
                            Some(r) => r,
                            None => return,
                        };
                        if !is_a(lhs, &[TypeTag::String]) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongLhsType,
                                Some("STRING".to_string()),
                                line,
                            );
                        }
                        if !is_a(rhs, &[TypeTag::String]) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("STRING".to_string()),
                                line,
                            );
                        }
                        *op_type = TypeTag::String;
                        node.ty = Some(Type::String);
                    }
                    BinOp::Add | BinOp::Minus | BinOp::Mult | BinOp::Div => {
                        let rhs = match rhs.as_deref_mut() {
                            Some(r) => r,
                            None => return,
                        };
                        let domain = [TypeTag::Integer, TypeTag::Real];
                        if !is_a(lhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongLhsType,
                                Some("INTEGER or REAL".to_string()),
                                line,
                            );
                        }
                        if !is_a(rhs, &domain) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("INTEGER or REAL".to_string()),
                                line,
                            );
                        }
                        let unified = unify_operands(sess, lhs, rhs, line);
                        *op_type = unified;
                        node.ty = Some(if unified == TypeTag::Real {
                            Type::Real
                        } else {
                            lhs.ty().simplify().clone()
                        });
                    }
                    BinOp::Not => {
                        if !is_a(lhs, &[TypeTag::Boolean]) {
                            sess.diags.log(
                                Class::Error,
                                Domain::Type,
                                Code::WrongRhsType,
                                Some("BOOLEAN".to_string()),
                                line,
                            );
                        }
                        *op_type = TypeTag::Boolean;
                        node.ty = Some(Type::Boolean);
                    }
                }
            }
            ExprKind::IfThenElse { cond, then_expr, else_expr } => {
                self.expr(sess, cond);
                self.expr(sess, then_expr);
                self.expr(sess, else_expr);
                if !is_a(cond, &[TypeTag::Boolean]) {
                    sess.diags.log(Class::Error, Domain::Type, Code::BooleanNeeded, None, line);
                }
                match coercion_of(then_expr.ty(), else_expr.ty()) {
                    Coercion::Ok => {
                        node.ty = Some(then_expr.ty().simplify().clone());
                    }
                    Coercion::IntToReal => {
                        then_expr.coercion = Coercion::IntToReal;
                        node.ty = Some(Type::Real);
                    }
                    Coercion::Error => match coercion_of(else_expr.ty(), then_expr.ty()) {
                        Coercion::IntToReal => {
                            else_expr.coercion = Coercion::IntToReal;
                            node.ty = Some(Type::Real);
                        }
                        _ => {
                            sess.diags.log(Class::Error, Domain::Type, Code::WrongType, None, line);
                            node.ty = Some(then_expr.ty().simplify().clone());
                        }
                    },
                }
            }
            ExprKind::FunCall { name, actuals } => {
                let object = self.resolve(sess, name);
                for actual in actuals.iter_mut() {
                    self.expr(sess, actual);
                }
                let callee = object.map(|obj| {
                    let ret = match &sess.objects[obj].kind {
                        ObjectKind::Routine { ret, .. } => Some(ret.clone()),
                        ObjectKind::Var { .. } => None,
                    };
                    (obj, ret)
                });
                match callee {
                    Some((obj, Some(Some(ret)))) => {
                        node.ty = Some(ret);
                        self.check_params(sess, obj, actuals, line);
                    }
                    Some((obj, Some(None))) => {
                        // a procedure has no value
                        sess.diags.log(Class::Error, Domain::Semantic, Code::NoFuncOrProc, None, line);
                        node.ty = Some(Type::Error);
                        self.check_params(sess, obj, actuals, line);
                    }
                    Some((_, None)) => {
                        sess.diags.log(Class::Error, Domain::Semantic, Code::NoFuncOrProc, None, line);
                        node.ty = Some(Type::Error);
                    }
                    None => {
                        node.ty = Some(Type::Error);
                    }
                }
            }
            ExprKind::Format(inner) => {
                self.expr(sess, inner);
                // any input type is allowed
                node.ty = Some(Type::String);
            }
            ExprKind::Index(index) => {
                self.index(sess, index);
                node.ty = Some(index.ty().clone());
            }
            ExprKind::IntConst(_) => node.ty = Some(Type::Integer),
            ExprKind::RealConst(_) => node.ty = Some(Type::Real),
            ExprKind::BoolConst(_) => node.ty = Some(Type::Boolean),
            ExprKind::StringConst(_) => node.ty = Some(Type::String),
        }
    }

    /// Attribute a designator. Every subscript must be an INTEGER
    /// expression; fewer subscripts than declared dimensions leave an array
    /// type of the remaining dimensions; more are an error. The resulting
    /// type keeps the base variable's REF wrapping.
    fn index(&mut self, sess: &mut Session, node: &mut IndexExpr) {
        let refdepth = self.index_inner(sess, node);
        if let Some(refdepth) = refdepth {
            if node.subscript_count() > 0 && refdepth > 0 {
                node.ty = node.ty.take().map(|t| t.wrapped(refdepth));
            }
        }
    }

    fn index_inner(&mut self, sess: &mut Session, node: &mut IndexExpr) -> Option<u8> {
        let line = node.line;
        match &mut node.kind {
            IndexKind::Name(name) => {
                let obj = match self.resolve(sess, name) {
                    Some(obj) => obj,
                    None => {
                        node.ty = Some(Type::Error);
                        return None;
                    }
                };
                if sess.objects[obj].is_routine() {
                    sess.diags.log(Class::Error, Domain::Semantic, Code::NoVariable, None, line);
                    node.ty = Some(Type::Error);
                    return None;
                }
                let ty = sess.objects[obj].var_type().clone();
                let refdepth = ty.refdepth();
                node.ty = Some(ty);
                Some(refdepth)
            }
            IndexKind::Index { base, index } => {
                let refdepth = self.index_inner(sess, base);
                self.expr(sess, index);
                if !is_a(index, &[TypeTag::Integer]) {
                    sess.diags.log(Class::Error, Domain::Type, Code::NotIndexType, None, index.line);
                }
                match base.ty().simplify() {
                    Type::Array { elem, .. } => {
                        node.ty = Some((**elem).clone());
                        refdepth
                    }
                    Type::Error => {
                        node.ty = Some(Type::Error);
                        None
                    }
                    _ => {
                        sess.diags.log(
                            Class::Error,
                            Domain::Type,
                            Code::TooManyIndices,
                            None,
                            line,
                        );
                        node.ty = Some(Type::Error);
                        None
                    }
                }
            }
        }
    }

    /// Resolve a name against the enclosing routine's scope chain.
    fn resolve(&mut self, sess: &mut Session, name: &mut Name) -> Option<ObjId> {
        if name.object.is_some() {
            return name.object;
        }
        let mut env = self.blocks.last().map(|b| b.env);
        while let Some(e) = env {
            let found = sess.envs[e]
                .decls
                .iter()
                .copied()
                .find(|&obj| sess.objects[obj].ident == name.ident);
            if let Some(obj) = found {
                name.object = Some(obj);
                return Some(obj);
            }
            env = sess.envs[e].parent;
        }
        sess.diags.log(Class::Error, Domain::Semantic, Code::Undeclared, None, name.line);
        None
    }

    /// Positional matching of actuals against a routine's formals.
    fn check_params(&mut self, sess: &mut Session, routine: ObjId, actuals: &mut [Expr], line: u32) {
        let formals = match &sess.objects[routine].kind {
            ObjectKind::Routine { formals, .. } => formals.clone(),
            ObjectKind::Var { .. } => return,
        };

        for (n, (formal, actual)) in formals.iter().zip(actuals.iter_mut()).enumerate() {
            let fty = sess.objects[*formal].var_type().clone();
            let coer = coercion_of(actual.ty(), &fty);
            if fty.refdepth() == 2 {
                // VAR formal: a variable reference of the identical type
                if !matches!(actual.kind, ExprKind::Index(_)) {
                    sess.diags.log(
                        Class::Error,
                        Domain::Type,
                        Code::NoSimpleTypeActual,
                        Some((n + 1).to_string()),
                        actual.line,
                    );
                } else if coer != Coercion::Ok {
                    sess.diags.log(
                        Class::Error,
                        Domain::Type,
                        Code::ParamType,
                        Some((n + 1).to_string()),
                        actual.line,
                    );
                }
            } else if coer == Coercion::Error {
                sess.diags.log(
                    Class::Error,
                    Domain::Type,
                    Code::ParamType,
                    Some((n + 1).to_string()),
                    actual.line,
                );
            } else {
                actual.coercion = coer;
            }
        }

        if formals.len() != actuals.len() {
            let at = if actuals.len() > formals.len() {
                actuals[formals.len()].line
            } else {
                actuals.last().map(|a| a.line).unwrap_or(line)
            };
            sess.diags.log(Class::Error, Domain::Type, Code::ParamCount, None, at);
        }
    }

    /// Assignment compatibility: scalars may coerce, arrays must be
    /// structurally identical and copy whole.
    fn assign_coercion(
        &mut self,
        sess: &mut Session,
        target: &IndexExpr,
        value: &Expr,
    ) -> Coercion {
        let left = target.ty().simplify();
        if left.array_depth() == 0 {
            let coer = coercion_of(value.ty(), left);
            if coer == Coercion::Error {
                sess.diags.log(Class::Error, Domain::Type, Code::WrongType, None, target.line);
            }
            coer
        } else if left.same_type(value.ty()) {
            Coercion::Ok
        } else {
            sess.diags.log(Class::Error, Domain::Type, Code::WrongType, None, target.line);
            Coercion::Error
        }
    }
}

/// Make the two operand types meet: coerce the INTEGER side to REAL when
/// they differ, report when they cannot meet at all. Returns the operand
/// domain of the operation.
fn unify_operands(sess: &mut Session, lhs: &mut Expr, rhs: &mut Expr, line: u32) -> TypeTag {
    match coercion_of(lhs.ty(), rhs.ty()) {
        Coercion::Ok => lhs.real_tag(),
        Coercion::IntToReal => {
            lhs.coercion = Coercion::IntToReal;
            TypeTag::Real
        }
        Coercion::Error => match coercion_of(rhs.ty(), lhs.ty()) {
            Coercion::IntToReal => {
                rhs.coercion = Coercion::IntToReal;
                TypeTag::Real
            }
            _ => {
                sess.diags.log(Class::Error, Domain::Type, Code::WrongType, None, line);
                lhs.real_tag()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::semantic;
    use crate::Options;

    fn checked(source: &str) -> (Decl, Session) {
        let mut sess = Session::new(Options::default());
        let mut parser = Parser::new(source.as_bytes());
        let mut root = parser.parse(&mut sess).expect("parse failed");
        semantic::analyze(&mut sess, &mut root);
        check(&mut sess, &mut root);
        (root, sess)
    }

    fn root_stats(root: &Decl) -> &[Stat] {
        match &root.kind {
            DeclKind::Proc { stats, .. } => stats,
            _ => panic!("root must be a procedure"),
        }
    }

    #[test]
    fn test_int_to_real_coercion_on_mixed_add() {
        let (root, sess) = checked(
            "PROGRAM p; DECLARE x : INTEGER; y : REAL; BEGIN y := x + 1.5 END.",
        );
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
        let value = match &root_stats(&root)[0].kind {
            StatKind::Assign { value, .. } => value,
            _ => panic!(),
        };
        match &value.kind {
            ExprKind::Binary { op_type, lhs, .. } => {
                assert_eq!(*op_type, TypeTag::Real);
                assert_eq!(lhs.coercion, Coercion::IntToReal);
            }
            _ => panic!(),
        }
        assert_eq!(value.real_tag(), TypeTag::Real);
    }

    #[test]
    fn test_every_expression_typed_or_error_logged() {
        let (root, sess) =
            checked("PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1 + 2 * 3 END.");
        assert!(!sess.diags.has_errors());
        fn walk(expr: &Expr) {
            assert!(expr.ty.is_some(), "untyped expression: {:?}", expr.kind);
            if let ExprKind::Binary { lhs, rhs, .. } = &expr.kind {
                walk(lhs);
                if let Some(rhs) = rhs {
                    walk(rhs);
                }
            }
        }
        if let StatKind::Assign { value, .. } = &root_stats(&root)[0].kind {
            walk(value);
        }
    }

    #[test]
    fn test_undeclared_identifier() {
        let (_, sess) = checked("PROGRAM p; DECLARE x : INTEGER; BEGIN y := 1 END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::Undeclared));
        assert!(!sess.diags.gencode());
    }

    #[test]
    fn test_mod_requires_integers() {
        let (_, sess) =
            checked("PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1.5 % 2 END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::WrongLhsType));
    }

    #[test]
    fn test_relation_yields_boolean() {
        let (root, sess) = checked(
            "PROGRAM p; DECLARE b : BOOLEAN; x : INTEGER; BEGIN b := x < 2.5 END.",
        );
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
        if let StatKind::Assign { value, .. } = &root_stats(&root)[0].kind {
            assert_eq!(value.real_tag(), TypeTag::Boolean);
            if let ExprKind::Binary { op_type, lhs, .. } = &value.kind {
                assert_eq!(*op_type, TypeTag::Real);
                assert_eq!(lhs.coercion, Coercion::IntToReal);
            }
        }
    }

    #[test]
    fn test_write_requires_string() {
        let (_, sess) = checked("PROGRAM p; DECLARE x : INTEGER; BEGIN WRITE(x) END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::ParamType));
    }

    #[test]
    fn test_write_format_is_fine() {
        let (_, sess) =
            checked("PROGRAM p; DECLARE x : INTEGER; BEGIN WRITE(FORMAT(x)) END.");
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
    }

    #[test]
    fn test_read_rejects_expression() {
        let (_, sess) = checked(
            "PROGRAM p; DECLARE s : STRING; BEGIN READ(s) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::NoSimpleTypeActual));
    }

    #[test]
    fn test_var_param_requires_variable_actual() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q (VAR n : INTEGER);\n\
             DECLARE t : INTEGER;\n\
             BEGIN n := 1 END;\n\
             BEGIN q(x + 1) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::NoSimpleTypeActual));
    }

    #[test]
    fn test_var_param_requires_identical_type() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q (VAR r : REAL);\n\
             DECLARE t : INTEGER;\n\
             BEGIN r := 1.0 END;\n\
             BEGIN q(x) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::ParamType));
    }

    #[test]
    fn test_value_param_coerces_int_to_real() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q (r : REAL);\n\
             DECLARE t : INTEGER;\n\
             BEGIN t := 0 END;\n\
             BEGIN q(x) END.",
        );
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
    }

    #[test]
    fn test_param_count_mismatch() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             PROCEDURE q (a : INTEGER);\n\
             DECLARE t : INTEGER;\n\
             BEGIN t := a END;\n\
             BEGIN q(1, 2) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::ParamCount));
    }

    #[test]
    fn test_return_value_in_procedure_is_error() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             PROCEDURE q;\n\
             DECLARE t : INTEGER;\n\
             BEGIN RETURN(1) END;\n\
             BEGIN q() END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::ParamInProcReturn));
    }

    #[test]
    fn test_return_without_value_in_function_is_error() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             FUNCTION f (a : INTEGER) : INTEGER;\n\
             DECLARE t : INTEGER;\n\
             BEGIN RETURN() END;\n\
             BEGIN x := f(1) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::NoParamInFuncReturn));
    }

    #[test]
    fn test_partial_subscript_leaves_array_type() {
        let (root, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             a : ARRAY[1..2] OF ARRAY[1..3] OF INTEGER;\n\
             b : ARRAY[0..2] OF INTEGER;\n\
             BEGIN b := a[1] END.",
        );
        // extents match (1..3 vs 0..2), so the whole-array assignment is legal
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
        if let StatKind::Assign { value, .. } = &root_stats(&root)[0].kind {
            assert_eq!(value.real_tag(), TypeTag::Array);
        }
    }

    #[test]
    fn test_too_many_subscripts() {
        let (_, sess) = checked(
            "PROGRAM p; DECLARE a : ARRAY[1..2] OF INTEGER; BEGIN a[1][2] := 0 END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::TooManyIndices));
        assert!(!sess.diags.gencode());
    }

    #[test]
    fn test_subscript_must_be_integer() {
        let (_, sess) = checked(
            "PROGRAM p; DECLARE a : ARRAY[1..2] OF INTEGER; BEGIN a[1.5] := 0 END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::NotIndexType));
    }

    #[test]
    fn test_inner_scope_sees_outer_variable() {
        let (_, sess) = checked(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q;\n\
             DECLARE y : INTEGER;\n\
             BEGIN y := x END;\n\
             BEGIN q() END.",
        );
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
    }

    #[test]
    fn test_if_then_else_expression_unifies_to_real() {
        let (root, sess) = checked(
            "PROGRAM p; DECLARE y : REAL; BEGIN y := IF TRUE THEN 1 ELSE 2.5 END END.",
        );
        assert!(!sess.diags.has_errors(), "{}", sess.diags.render());
        if let StatKind::Assign { value, .. } = &root_stats(&root)[0].kind {
            assert_eq!(value.real_tag(), TypeTag::Real);
            if let ExprKind::IfThenElse { then_expr, .. } = &value.kind {
                assert_eq!(then_expr.coercion, Coercion::IntToReal);
            }
        }
    }

    #[test]
    fn test_calling_a_variable_is_an_error() {
        let (_, sess) =
            checked("PROGRAM p; DECLARE x : INTEGER; BEGIN x() END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::NoFuncOrProc));
    }
}
