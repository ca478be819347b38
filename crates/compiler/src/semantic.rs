//! Static environment construction.
//!
//! Walks the declaration tree, creates one semantic object per declared
//! name, stamps it with the static nesting depth, and builds the scope
//! chain: each procedure or function gets an environment holding its
//! formals and local declarations, linked to the enclosing scope. The
//! environment id is allocated before the scope's children are analyzed so
//! nested declarations can already name it; the declaration list is patched
//! in afterwards.
//!
//! Also checks what can be checked without types being attributed yet:
//! redeclarations within one scope and array bounds.

use crate::ast::{Decl, DeclKind, EnvId, Formal, Object, ObjectKind, ObjId, Type};
use crate::diag::{Class, Code, Domain};
use crate::symtab::SymId;
use crate::Session;

pub fn analyze(sess: &mut Session, root: &mut Decl) {
    let mut analyzer = Analyzer { depth: 0 };
    analyzer.decl(sess, root, None);
}

struct Analyzer {
    depth: u16,
}

impl Analyzer {
    fn decl(&mut self, sess: &mut Session, node: &mut Decl, parent: Option<EnvId>) {
        match &mut node.kind {
            DeclKind::Var { name, ty } => {
                // declared variables carry one synthetic REF layer
                let stored = ty.clone().wrapped(1);
                let object = sess.objects.alloc(Object {
                    kind: ObjectKind::Var { ty: stored },
                    ident: name.ident,
                    location: 0,
                    label: None,
                    depth: self.depth,
                });
                name.object = Some(object);
                node.object = Some(object);
                self.check_type(sess, ty, node.line);
            }
            DeclKind::Proc { .. } | DeclKind::Func { .. } => {
                self.routine(sess, node, parent);
            }
        }
    }

    fn routine(&mut self, sess: &mut Session, node: &mut Decl, parent: Option<EnvId>) {
        let line = node.line;
        let (name, formals, decls, ret) = match &mut node.kind {
            DeclKind::Proc { name, formals, decls, .. } => (name, formals, decls, None),
            DeclKind::Func { name, formals, decls, ret, .. } => {
                (name, formals, decls, Some(ret.clone()))
            }
            DeclKind::Var { .. } => return,
        };

        if let Some(ret) = &ret {
            self.check_type(sess, ret, line);
        }

        let object = sess.objects.alloc(Object {
            kind: ObjectKind::Routine { formals: Vec::new(), ret },
            ident: name.ident,
            location: 0,
            label: None,
            depth: self.depth,
        });
        name.object = Some(object);
        node.object = Some(object);

        // the scope exists before its members, so children can link to it
        let env = sess.envs.alloc(parent);
        node.env = Some(env);

        self.depth += 1;

        let mut scope: Vec<ObjId> = Vec::new();
        let mut formal_objects = Vec::with_capacity(formals.len());
        for formal in formals.iter_mut() {
            let obj = self.formal(sess, formal);
            formal_objects.push(obj);
            if is_declared(sess, &scope, formal.name.ident) {
                sess.diags.log(Class::Error, Domain::Semantic, Code::DeclaredTwice, None, formal.line);
            }
            scope.push(obj);
        }
        if let ObjectKind::Routine { formals: slot, .. } = &mut sess.objects[object].kind {
            *slot = formal_objects;
        }

        for decl in decls.iter_mut() {
            self.decl(sess, decl, Some(env));
            if let Some(obj) = decl.object {
                let ident = sess.objects[obj].ident;
                if is_declared(sess, &scope, ident) {
                    sess.diags.log(
                        Class::Error,
                        Domain::Semantic,
                        Code::DeclaredTwice,
                        None,
                        decl.line,
                    );
                }
                scope.push(obj);
            }
        }

        sess.envs.set_decls(env, scope);
        self.depth -= 1;
    }

    fn formal(&mut self, sess: &mut Session, formal: &mut Formal) -> ObjId {
        // the REF wrapping was already applied by the parser
        let object = sess.objects.alloc(Object {
            kind: ObjectKind::Var { ty: formal.ty.clone() },
            ident: formal.name.ident,
            location: 0,
            label: None,
            depth: self.depth,
        });
        formal.name.object = Some(object);
        formal.object = Some(object);
        self.check_type(sess, &formal.ty, formal.line);
        object
    }

    fn check_type(&mut self, sess: &mut Session, ty: &Type, line: u32) {
        match ty {
            Type::Array { lwb, upb, elem } => {
                if lwb > upb {
                    sess.diags.log(Class::Error, Domain::Semantic, Code::LwbGreaterUpb, None, line);
                }
                self.check_type(sess, elem, line);
            }
            Type::Ref(inner) => self.check_type(sess, inner, line),
            _ => {}
        }
    }
}

fn is_declared(sess: &Session, scope: &[ObjId], ident: SymId) -> bool {
    scope.iter().any(|&obj| sess.objects[obj].ident == ident)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::Options;

    fn analyzed(source: &str) -> (Decl, Session) {
        let mut sess = Session::new(Options::default());
        let mut parser = Parser::new(source.as_bytes());
        let mut root = parser.parse(&mut sess).expect("parse failed");
        analyze(&mut sess, &mut root);
        (root, sess)
    }

    #[test]
    fn test_objects_attached_and_depth_stamped() {
        let (root, sess) = analyzed(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q;\n\
             DECLARE y : INTEGER;\n\
             BEGIN y := 1 END;\n\
             BEGIN q() END.",
        );
        let root_obj = root.object.expect("root object");
        assert_eq!(sess.objects[root_obj].depth, 0);
        let decls = match &root.kind {
            DeclKind::Proc { decls, .. } => decls,
            _ => panic!(),
        };
        // x and q are declared inside the root scope, depth 1
        assert_eq!(sess.objects[decls[0].object.unwrap()].depth, 1);
        assert_eq!(sess.objects[decls[1].object.unwrap()].depth, 1);
        // q's local y sits one level deeper
        let q_decls = match &decls[1].kind {
            DeclKind::Proc { decls, .. } => decls,
            _ => panic!(),
        };
        assert_eq!(sess.objects[q_decls[0].object.unwrap()].depth, 2);
    }

    #[test]
    fn test_env_chain_links_to_parent() {
        let (root, sess) = analyzed(
            "PROGRAM p;\n\
             DECLARE\n\
             PROCEDURE q;\n\
             DECLARE y : INTEGER;\n\
             BEGIN y := 1 END;\n\
             BEGIN q() END.",
        );
        let root_env = root.env.expect("root env");
        let decls = match &root.kind {
            DeclKind::Proc { decls, .. } => decls,
            _ => panic!(),
        };
        let q_env = decls[0].env.expect("q env");
        assert_eq!(sess.envs[q_env].parent, Some(root_env));
        assert_eq!(sess.envs[root_env].parent, None);
    }

    #[test]
    fn test_redeclaration_reported_and_codegen_disabled() {
        let (_, sess) =
            analyzed("PROGRAM p; DECLARE x : INTEGER; x : REAL; BEGIN END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::DeclaredTwice));
        assert!(!sess.diags.gencode());
    }

    #[test]
    fn test_duplicate_formal_reported() {
        let (_, sess) = analyzed(
            "PROGRAM p;\n\
             DECLARE\n\
             PROCEDURE q (a : INTEGER; a : REAL);\n\
             DECLARE t : INTEGER;\n\
             BEGIN t := 0 END;\n\
             BEGIN q(1, 2.0) END.",
        );
        assert!(sess.diags.records().iter().any(|d| d.code == Code::DeclaredTwice));
    }

    #[test]
    fn test_same_name_in_different_scopes_is_fine() {
        let (_, sess) = analyzed(
            "PROGRAM p;\n\
             DECLARE\n\
             x : INTEGER;\n\
             PROCEDURE q;\n\
             DECLARE x : REAL;\n\
             BEGIN x := 1.0 END;\n\
             BEGIN q() END.",
        );
        assert!(!sess.diags.records().iter().any(|d| d.code == Code::DeclaredTwice));
    }

    #[test]
    fn test_bad_array_bounds_reported() {
        let (_, sess) =
            analyzed("PROGRAM p; DECLARE a : ARRAY[5..2] OF INTEGER; BEGIN END.");
        assert!(sess.diags.records().iter().any(|d| d.code == Code::LwbGreaterUpb));
        assert!(!sess.diags.gencode());
    }

    #[test]
    fn test_variable_objects_carry_one_ref_layer() {
        let (root, sess) = analyzed("PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1 END.");
        let decls = match &root.kind {
            DeclKind::Proc { decls, .. } => decls,
            _ => panic!(),
        };
        let obj = decls[0].object.unwrap();
        assert_eq!(sess.objects[obj].var_type().refdepth(), 1);
    }
}
