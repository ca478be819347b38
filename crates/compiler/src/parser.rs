//! Recursive-descent parser.
//!
//! One function per production. On a syntax error the production reports
//! `<symbol> expected` and returns `None`; callers propagate the `None`
//! upward and the parse as a whole fails. A missing semicolon between
//! statements is only a warning: it is reported as inserted and parsing
//! continues.

use crate::ast::{
    BinOp, Decl, DeclKind, Expr, ExprKind, Formal, IndexExpr, IndexKind, Name, Stat, StatKind,
    Type, TypeTag,
};
use crate::diag::{Class, Code, Domain};
use crate::scanner::Scanner;
use crate::symtab::Token;
use crate::Session;

pub struct Parser<'a> {
    scan: Scanner<'a>,
    tok: Token,
    line: u32,
}

impl<'a> Parser<'a> {
    pub fn new(source: &'a [u8]) -> Self {
        Parser { scan: Scanner::new(source), tok: Token::Eof, line: 0 }
    }

    /// Parse a whole program. The returned declaration is the program root,
    /// a parameterless procedure.
    pub fn parse(&mut self, sess: &mut Session) -> Option<Decl> {
        self.advance(sess);
        if self.tok == Token::Eof {
            sess.diags.log(Class::Fatal, Domain::File, Code::FileEmpty, Some("parse".into()), 0);
            return None;
        }
        self.prog(sess)
    }

    fn advance(&mut self, sess: &mut Session) {
        let lexed = self.scan.get(sess);
        self.tok = lexed.token;
        self.line = lexed.line;
    }

    /// Require the next symbol to be of `expected`'s kind and consume it.
    fn expect(&mut self, sess: &mut Session, expected: Token) -> Option<()> {
        if self.tok.same_kind(&expected) {
            self.advance(sess);
            Some(())
        } else {
            sess.diags.log(
                Class::Error,
                Domain::Semantic,
                Code::SymbolExpected,
                Some(expected.describe().to_string()),
                self.line,
            );
            None
        }
    }

    fn expected(&mut self, sess: &mut Session, what: &str) {
        sess.diags.log(
            Class::Error,
            Domain::Semantic,
            Code::SymbolExpected,
            Some(what.to_string()),
            self.line,
        );
    }

    /// Consume a statement separator; a missing one is inserted with a
    /// warning.
    fn eocmd(&mut self, sess: &mut Session) {
        if self.tok.same_kind(&Token::Semicolon) {
            self.advance(sess);
        } else {
            sess.diags.log(Class::Warning, Domain::Semantic, Code::MissingSemicolon, None, self.line);
        }
    }

    // === Program = PROGRAM Name ';' DECLARE Decls BEGIN Stats END '.' ===

    fn prog(&mut self, sess: &mut Session) -> Option<Decl> {
        let line = self.line;
        self.expect(sess, Token::Program)?;
        let name = self.name(sess)?;
        self.eocmd(sess);
        self.expect(sess, Token::Declare)?;
        let decls = self.decls(sess)?;
        self.expect(sess, Token::Begin)?;
        let stats = self.stats(sess)?;
        self.expect(sess, Token::End)?;
        self.expect(sess, Token::Dot)?;
        Some(Decl {
            kind: DeclKind::Proc { name, formals: Vec::new(), decls, stats },
            line,
            object: None,
            env: None,
        })
    }

    fn starts_decl(&self) -> bool {
        matches!(self.tok, Token::Ident(_) | Token::Procedure | Token::Function)
    }

    fn decls(&mut self, sess: &mut Session) -> Option<Vec<Decl>> {
        let mut out = Vec::new();
        if !self.starts_decl() {
            return Some(out); // empty declaration section
        }
        out.push(self.decl(sess)?);
        while self.tok.same_kind(&Token::Semicolon) {
            self.advance(sess);
            if !self.starts_decl() {
                break; // the semicolon closed the section
            }
            out.push(self.decl(sess)?);
        }
        Some(out)
    }

    fn decl(&mut self, sess: &mut Session) -> Option<Decl> {
        let line = self.line;
        match self.tok {
            Token::Ident(_) => {
                let name = self.name(sess)?;
                self.expect(sess, Token::Colon)?;
                let ty = self.type_(sess)?;
                Some(Decl { kind: DeclKind::Var { name, ty }, line, object: None, env: None })
            }
            Token::Procedure => {
                self.advance(sess);
                let name = self.name(sess)?;
                let formals = self.formals(sess)?;
                self.eocmd(sess);
                self.expect(sess, Token::Declare)?;
                let decls = self.decls(sess)?;
                self.expect(sess, Token::Begin)?;
                let stats = self.stats(sess)?;
                self.expect(sess, Token::End)?;
                Some(Decl {
                    kind: DeclKind::Proc { name, formals, decls, stats },
                    line,
                    object: None,
                    env: None,
                })
            }
            Token::Function => {
                self.advance(sess);
                let name = self.name(sess)?;
                let formals = self.formals(sess)?;
                self.expect(sess, Token::Colon)?;
                let ret = self.type_(sess)?;
                self.eocmd(sess);
                self.expect(sess, Token::Declare)?;
                let decls = self.decls(sess)?;
                self.expect(sess, Token::Begin)?;
                let stats = self.stats(sess)?;
                self.expect(sess, Token::End)?;
                Some(Decl {
                    kind: DeclKind::Func { name, formals, ret, decls, stats },
                    line,
                    object: None,
                    env: None,
                })
            }
            _ => {
                self.expected(sess, "PROCEDURE, FUNCTION or identifier");
                None
            }
        }
    }

    // === Formals = [ '(' Formal { ';' Formal } ')' ] ===

    fn formals(&mut self, sess: &mut Session) -> Option<Vec<Formal>> {
        let mut out = Vec::new();
        if !self.tok.same_kind(&Token::LParen) {
            return Some(out); // no parameters
        }
        self.advance(sess);
        out.push(self.formal(sess)?);
        while self.tok.same_kind(&Token::Semicolon) {
            self.advance(sess);
            out.push(self.formal(sess)?);
        }
        self.expect(sess, Token::RParen)?;
        Some(out)
    }

    fn formal(&mut self, sess: &mut Session) -> Option<Formal> {
        let line = self.line;
        match self.tok {
            Token::Ident(_) => {
                let name = self.name(sess)?;
                self.expect(sess, Token::Colon)?;
                let ty = self.type_(sess)?.wrapped(1);
                Some(Formal { name, ty, line, object: None })
            }
            Token::Var => {
                self.advance(sess);
                let name = self.name(sess)?;
                self.expect(sess, Token::Colon)?;
                let ty = self.type_(sess)?.wrapped(2);
                Some(Formal { name, ty, line, object: None })
            }
            _ => {
                self.expected(sess, "identifier or VAR");
                None
            }
        }
    }

    fn type_(&mut self, sess: &mut Session) -> Option<Type> {
        match self.tok {
            Token::Integer => {
                self.advance(sess);
                Some(Type::Integer)
            }
            Token::Real => {
                self.advance(sess);
                Some(Type::Real)
            }
            Token::Boolean => {
                self.advance(sess);
                Some(Type::Boolean)
            }
            Token::String => {
                self.advance(sess);
                Some(Type::String)
            }
            Token::Array => {
                self.advance(sess);
                self.expect(sess, Token::LBracket)?;
                let lwb = if let Token::IntConst(v) = self.tok { v } else { 0 };
                self.expect(sess, Token::IntConst(0))?;
                self.expect(sess, Token::Range)?;
                let upb = if let Token::IntConst(v) = self.tok { v } else { 0 };
                self.expect(sess, Token::IntConst(0))?;
                self.expect(sess, Token::RBracket)?;
                self.expect(sess, Token::Of)?;
                let elem = self.type_(sess)?;
                Some(Type::Array { lwb, upb, elem: Box::new(elem) })
            }
            _ => {
                self.expected(sess, "Type (INTEGER, REAL, BOOLEAN or STRING)");
                None
            }
        }
    }

    // === Statements ===

    fn starts_stat(&self) -> bool {
        matches!(
            self.tok,
            Token::Ident(_)
                | Token::If
                | Token::While
                | Token::Read
                | Token::Write
                | Token::WriteLn
                | Token::Return
                | Token::Fail
        )
    }

    fn stats(&mut self, sess: &mut Session) -> Option<Vec<Stat>> {
        let mut out = Vec::new();
        if !self.starts_stat() {
            return Some(out); // empty statement list
        }
        out.push(self.stat(sess)?);
        loop {
            if self.tok.same_kind(&Token::Semicolon) {
                self.advance(sess);
                if !self.starts_stat() {
                    break; // trailing semicolon
                }
                out.push(self.stat(sess)?);
            } else if self.starts_stat() {
                sess.diags.log(
                    Class::Warning,
                    Domain::Semantic,
                    Code::MissingSemicolon,
                    None,
                    self.line,
                );
                out.push(self.stat(sess)?);
            } else {
                break;
            }
        }
        Some(out)
    }

    fn stat(&mut self, sess: &mut Session) -> Option<Stat> {
        let line = self.line;
        match self.tok {
            Token::Ident(_) => {
                let name = self.name(sess)?;
                self.assign_or_call(sess, name, line)
            }
            Token::If => {
                self.advance(sess);
                let cond = self.expr(sess)?;
                self.expect(sess, Token::Then)?;
                let then_stats = self.stats(sess)?;
                self.expect(sess, Token::Else)?;
                let else_stats = self.stats(sess)?;
                self.expect(sess, Token::End)?;
                Some(Stat { kind: StatKind::If { cond, then_stats, else_stats }, line })
            }
            Token::While => {
                self.advance(sess);
                let cond = self.expr(sess)?;
                self.expect(sess, Token::Do)?;
                let body = self.stats(sess)?;
                self.expect(sess, Token::End)?;
                Some(Stat { kind: StatKind::While { cond, body }, line })
            }
            Token::Read => {
                self.advance(sess);
                self.expect(sess, Token::LParen)?;
                let target = self.var(sess)?;
                let arg = Expr::new(ExprKind::Index(target), line);
                self.expect(sess, Token::RParen)?;
                Some(Stat { kind: StatKind::Read { arg }, line })
            }
            Token::Write | Token::WriteLn => {
                let is_line = self.tok == Token::WriteLn;
                self.advance(sess);
                self.expect(sess, Token::LParen)?;
                let arg = self.expr(sess)?;
                self.expect(sess, Token::RParen)?;
                let kind = if is_line {
                    StatKind::WriteLn { arg }
                } else {
                    StatKind::Write { arg }
                };
                Some(Stat { kind, line })
            }
            Token::Return => {
                self.advance(sess);
                let mut value = None;
                if self.tok.same_kind(&Token::LParen) {
                    self.advance(sess);
                    if !self.tok.same_kind(&Token::RParen) {
                        value = Some(self.expr(sess)?);
                    }
                    self.expect(sess, Token::RParen)?;
                } else {
                    sess.diags.log(
                        Class::Warning,
                        Domain::Semantic,
                        Code::SymbolExpected,
                        Some("'('".to_string()),
                        self.line,
                    );
                }
                Some(Stat { kind: StatKind::Return { value }, line })
            }
            Token::Fail => {
                self.advance(sess);
                self.expect(sess, Token::LParen)?;
                let mut value = None;
                if !self.tok.same_kind(&Token::RParen) {
                    value = Some(self.expr(sess)?);
                }
                self.expect(sess, Token::RParen)?;
                Some(Stat { kind: StatKind::Fail { value }, line })
            }
            _ => {
                self.expected(sess, "IF, WHILE, READ, WRITE, WRITELN, RETURN, FAIL or identifier");
                None
            }
        }
    }

    /// What follows an identifier in statement position: subscripted or
    /// plain assignment, or a procedure call.
    fn assign_or_call(&mut self, sess: &mut Session, name: Name, line: u32) -> Option<Stat> {
        match self.tok {
            Token::LBracket => {
                let base = IndexExpr::from_name(name, line);
                let target = self.index_chain(sess, base)?;
                self.expect(sess, Token::Assign)?;
                let value = self.expr(sess)?;
                Some(Stat { kind: StatKind::Assign { target, value }, line })
            }
            Token::Assign => {
                let target = IndexExpr::from_name(name, line);
                self.advance(sess);
                let value = self.expr(sess)?;
                Some(Stat { kind: StatKind::Assign { target, value }, line })
            }
            Token::LParen => {
                self.advance(sess);
                let actuals = if self.tok.same_kind(&Token::RParen) {
                    Vec::new()
                } else {
                    self.actuals(sess)?
                };
                self.expect(sess, Token::RParen)?;
                Some(Stat { kind: StatKind::Call { name, actuals }, line })
            }
            _ => {
                // a call without parentheses is tolerated, but flagged
                sess.diags.log(
                    Class::Warning,
                    Domain::Semantic,
                    Code::SymbolExpected,
                    Some("'('".to_string()),
                    self.line,
                );
                Some(Stat { kind: StatKind::Call { name, actuals: Vec::new() }, line })
            }
        }
    }

    fn actuals(&mut self, sess: &mut Session) -> Option<Vec<Expr>> {
        let mut out = vec![self.expr(sess)?];
        while self.tok.same_kind(&Token::Comma) {
            self.advance(sess);
            out.push(self.expr(sess)?);
        }
        Some(out)
    }

    // === Expressions, five precedence levels ===

    fn expr(&mut self, sess: &mut Session) -> Option<Expr> {
        if self.tok == Token::If {
            let line = self.line;
            self.advance(sess);
            let cond = self.expr(sess)?;
            self.expect(sess, Token::Then)?;
            let then_expr = self.expr(sess)?;
            self.expect(sess, Token::Else)?;
            let else_expr = self.expr(sess)?;
            self.expect(sess, Token::End)?;
            return Some(Expr::new(
                ExprKind::IfThenElse {
                    cond: Box::new(cond),
                    then_expr: Box::new(then_expr),
                    else_expr: Box::new(else_expr),
                },
                line,
            ));
        }

        let lhs = self.expr2(sess)?;
        if let Token::RelOp(op) = self.tok {
            let line = self.line;
            self.advance(sess);
            let rhs = self.expr2(sess)?;
            return Some(binary(op, lhs, rhs, line));
        }
        Some(lhs)
    }

    fn expr2(&mut self, sess: &mut Session) -> Option<Expr> {
        let mut result = self.expr3(sess)?;
        while let Token::NewOp(op) = self.tok {
            let line = self.line;
            self.advance(sess);
            let rhs = self.expr3(sess)?;
            result = binary(op, result, rhs, line);
        }
        Some(result)
    }

    fn expr3(&mut self, sess: &mut Session) -> Option<Expr> {
        let mut result = self.term(sess)?;
        while let Token::AddOp(op) = self.tok {
            let line = self.line;
            self.advance(sess);
            let rhs = self.term(sess)?;
            result = binary(op, result, rhs, line);
        }
        Some(result)
    }

    fn term(&mut self, sess: &mut Session) -> Option<Expr> {
        let mut result = self.factor(sess)?;
        while let Token::MulOp(op) = self.tok {
            let line = self.line;
            self.advance(sess);
            let rhs = self.factor(sess)?;
            result = binary(op, result, rhs, line);
        }
        Some(result)
    }

    fn factor(&mut self, sess: &mut Session) -> Option<Expr> {
        let line = self.line;
        match self.tok {
            Token::Not => {
                self.advance(sess);
                let operand = self.factor(sess)?;
                Some(Expr::new(
                    ExprKind::Binary {
                        op: BinOp::Not,
                        op_type: TypeTag::Error,
                        lhs: Box::new(operand),
                        rhs: None,
                    },
                    line,
                ))
            }
            Token::LParen => {
                self.advance(sess);
                let inner = self.expr(sess)?;
                self.expect(sess, Token::RParen)?;
                Some(inner)
            }
            Token::Ident(_) => {
                let name = self.name(sess)?;
                self.var_or_func(sess, name, line)
            }
            Token::IntConst(v) => {
                self.advance(sess);
                Some(Expr::new(ExprKind::IntConst(v), line))
            }
            Token::RealConst(id) => {
                self.advance(sess);
                Some(Expr::new(ExprKind::RealConst(id), line))
            }
            Token::StringConst(id) => {
                self.advance(sess);
                Some(Expr::new(ExprKind::StringConst(id), line))
            }
            Token::False => {
                self.advance(sess);
                Some(Expr::new(ExprKind::BoolConst(false), line))
            }
            Token::True => {
                self.advance(sess);
                Some(Expr::new(ExprKind::BoolConst(true), line))
            }
            Token::Format => {
                self.advance(sess);
                self.expect(sess, Token::LParen)?;
                let inner = self.expr(sess)?;
                self.expect(sess, Token::RParen)?;
                Some(Expr::new(ExprKind::Format(Box::new(inner)), line))
            }
            _ => {
                self.expected(sess, "NOT, '(', constant or identifier");
                None
            }
        }
    }

    /// An identifier in expression position: function call or variable.
    fn var_or_func(&mut self, sess: &mut Session, name: Name, line: u32) -> Option<Expr> {
        if self.tok.same_kind(&Token::LParen) {
            self.advance(sess);
            let actuals = if self.tok.same_kind(&Token::RParen) {
                Vec::new()
            } else {
                self.actuals(sess)?
            };
            self.expect(sess, Token::RParen)?;
            Some(Expr::new(ExprKind::FunCall { name, actuals }, line))
        } else {
            let base = IndexExpr::from_name(name, line);
            let index = self.index_chain(sess, base)?;
            Some(Expr::new(ExprKind::Index(index), line))
        }
    }

    fn var(&mut self, sess: &mut Session) -> Option<IndexExpr> {
        let line = self.line;
        let name = self.name(sess)?;
        self.index_chain(sess, IndexExpr::from_name(name, line))
    }

    /// Left-associative subscript chain: `base [ e ] [ e ] ...`
    fn index_chain(&mut self, sess: &mut Session, mut base: IndexExpr) -> Option<IndexExpr> {
        while self.tok.same_kind(&Token::LBracket) {
            let line = self.line;
            self.advance(sess);
            let index = self.expr(sess)?;
            self.expect(sess, Token::RBracket)?;
            base = IndexExpr {
                kind: IndexKind::Index { base: Box::new(base), index: Box::new(index) },
                line,
                ty: None,
            };
        }
        Some(base)
    }

    fn name(&mut self, sess: &mut Session) -> Option<Name> {
        if let Token::Ident(id) = self.tok {
            let line = self.line;
            self.advance(sess);
            Some(Name::new(id, line))
        } else {
            self.expected(sess, "identifier");
            None
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr, line: u32) -> Expr {
    Expr::new(
        ExprKind::Binary {
            op,
            op_type: TypeTag::Error,
            lhs: Box::new(lhs),
            rhs: Some(Box::new(rhs)),
        },
        line,
    )
}
