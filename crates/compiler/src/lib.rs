//! MiniLAX compiler library.
//!
//! Compiles MiniLAX source to a textual machine-code listing for the CBAM
//! virtual machine. The pipeline is a single-threaded batch of phases, each
//! consuming its predecessor's output completely:
//!
//! ```text
//! source -> tokens -> AST -> analyzed AST -> typed AST -> TAC -> CBAM -> listing
//! ```
//!
//! Source-level problems are buffered in [`diag::Diagnostics`] and reported
//! after the phases; semantic and type errors disable code generation but
//! the remaining phases still run so every problem is reported in one go.
//! All compilation state (symbol table, constant pool, object and
//! environment arenas, flags) lives in a per-invocation [`Session`]; there
//! is no process-wide mutable state.

pub mod ast;
pub mod cbam;
pub mod constab;
pub mod diag;
pub mod lower;
pub mod optimize;
pub mod parser;
pub mod scanner;
pub mod semantic;
pub mod symtab;
pub mod tac;
pub mod tacgen;
pub mod typecheck;

pub use diag::Diagnostics;
pub use parser::Parser;

use std::fs;
use std::path::Path;

use tracing::info;

use crate::ast::{Envs, Objects};
use crate::constab::ConstTable;
use crate::diag::{Class, Code, Domain};
use crate::symtab::SymbolTable;

/// Per-invocation switches, all driven by the CLI.
#[derive(Debug, Clone)]
pub struct Options {
    pub verbose: bool,
    /// Dump the intermediate stages to stdout.
    pub debug: bool,
    /// Run the base-block TAC optimizer.
    pub optimize: bool,
    /// Emit array subscript range checks (on by default).
    pub range_checks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options { verbose: false, debug: false, optimize: false, range_checks: true }
    }
}

/// Everything one compilation owns: interning tables, diagnostics, the
/// object and environment arenas, and the option flags.
#[derive(Debug)]
pub struct Session {
    pub syms: SymbolTable,
    pub consts: ConstTable,
    pub diags: Diagnostics,
    pub objects: Objects,
    pub envs: Envs,
    pub opts: Options,
}

impl Session {
    pub fn new(opts: Options) -> Self {
        Session {
            syms: SymbolTable::new(),
            consts: ConstTable::new(),
            diags: Diagnostics::new(),
            objects: Objects::default(),
            envs: Envs::default(),
            opts,
        }
    }
}

/// The outcome of one compilation: the session with its buffered
/// diagnostics, and the serialized listing when code generation ran
/// through.
#[derive(Debug)]
pub struct Compilation {
    pub session: Session,
    pub listing: Option<Vec<u8>>,
}

impl Compilation {
    fn failed(session: Session) -> Self {
        Compilation { session, listing: None }
    }
}

/// Run the whole pipeline over a source buffer.
pub fn compile_source(source: &[u8], opts: Options) -> Compilation {
    let mut sess = Session::new(opts);

    info!("parsing");
    let mut parser = Parser::new(source);
    let mut root = match parser.parse(&mut sess) {
        Some(root) => root,
        None => return Compilation::failed(sess),
    };

    info!("semantic analysis");
    semantic::analyze(&mut sess, &mut root);

    info!("type checking");
    typecheck::check(&mut sess, &mut root);

    if !sess.diags.gencode() {
        return Compilation::failed(sess);
    }

    info!("generating code");
    let mut tac = match tacgen::generate(&mut sess, &root) {
        Ok(tac) => tac,
        Err(message) => {
            sess.diags.internal(Code::IllegalTag, &message);
            return Compilation::failed(sess);
        }
    };
    if sess.opts.debug {
        println!("==========result of intermediate code generation===========");
        print!("{}", tac.listing());
    }

    if sess.opts.optimize {
        info!("optimizing");
        optimize::optimize(&mut tac);
        if sess.opts.debug {
            println!("==========result of optimization===========");
            print!("{}", tac.listing());
        }
    }

    let mut code = match lower::lower(&mut sess, &tac) {
        Ok(code) => code,
        Err(message) => {
            sess.diags.internal(Code::IllegalOperand, &message);
            return Compilation::failed(sess);
        }
    };
    if let Err(message) = code.resolve(&sess.consts) {
        sess.diags.internal(Code::IllegalOperand, &message);
        return Compilation::failed(sess);
    }
    if sess.opts.debug {
        println!("==============result of code generation==================");
        print!("{}", code.listing());
    }

    // the back end may have found an unsupported construct on the way
    if !sess.diags.gencode() {
        return Compilation::failed(sess);
    }

    info!("writing code");
    let words = match code.instruction_words() {
        Ok(words) => words,
        Err(message) => {
            sess.diags.internal(Code::IllegalOperand, &message);
            return Compilation::failed(sess);
        }
    };

    let mut listing = String::new();
    for word in words {
        listing.push_str(&word.to_string());
        listing.push('\n');
    }
    listing.push_str("S\n");
    for word in sess.consts.string_words() {
        listing.push_str(&word.to_string());
        listing.push('\n');
    }

    Compilation { session: sess, listing: Some(listing.into_bytes()) }
}

/// Compile a source file to a listing file. Diagnostics print to stdout at
/// the end; the output file is only written when no error was reported.
pub fn compile_file(input: &Path, output: &Path, opts: Options) -> Result<(), String> {
    let source = match fs::read(input) {
        Ok(source) => source,
        Err(_) => {
            let mut diags = Diagnostics::new();
            diags.log(Class::Abort, Domain::File, Code::OpenFile, Some("compile_file".into()), 0);
            diags.print();
            return Err(format!("could not read {}", input.display()));
        }
    };

    let compilation = compile_source(&source, opts);
    let sess = &compilation.session;
    let ok = compilation.listing.is_some() && !sess.diags.has_errors();

    if ok {
        if let Some(listing) = &compilation.listing {
            if let Err(error) = fs::write(output, listing) {
                sess.diags.print();
                return Err(format!("failed to write {}: {}", output.display(), error));
            }
        }
        println!("compilation finished");
    } else {
        println!("No code generated due to errors.");
    }

    sess.diags.print();

    if ok { Ok(()) } else { Err("compilation failed".to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing_of(source: &str) -> Vec<u8> {
        let compilation = compile_source(source.as_bytes(), Options::default());
        assert!(
            !compilation.session.diags.has_errors(),
            "{}",
            compilation.session.diags.render()
        );
        compilation.listing.expect("listing")
    }

    #[test]
    fn test_empty_source_is_a_file_error() {
        let compilation = compile_source(b"", Options::default());
        assert!(compilation.listing.is_none());
        assert!(compilation
            .session
            .diags
            .records()
            .iter()
            .any(|d| d.code == Code::FileEmpty && d.class == Class::Fatal));
    }

    #[test]
    fn test_return_only_program_compiles_to_halt() {
        let listing = listing_of("PROGRAM p; DECLARE x : INTEGER; BEGIN RETURN END.");
        let text = String::from_utf8(listing).expect("ascii listing");
        let mut lines = text.lines().rev();
        // the listing ends with the S marker (no strings follow), preceded
        // by HALT #0: a zero literal after the HALT opcode word
        assert_eq!(lines.next(), Some("S"));
        assert_eq!(lines.next(), Some("0"));
        assert_eq!(lines.next(), Some(&(6u32 << 21).to_string()[..]));
    }

    #[test]
    fn test_listing_is_decimal_words_then_strings() {
        let listing = listing_of(
            "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 3; WRITE(FORMAT(x)) END.",
        );
        let text = String::from_utf8(listing).expect("ascii listing");
        let mut seen_marker = false;
        for line in text.lines() {
            if line == "S" {
                seen_marker = true;
                continue;
            }
            assert!(line.parse::<u32>().is_ok(), "bad listing line {:?}", line);
        }
        assert!(seen_marker);
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let source = "PROGRAM p;\n\
                      DECLARE a : ARRAY[1..3] OF INTEGER;\n\
                      BEGIN a[1] := 10; a[2] := a[1] + 5; WRITE(FORMAT(a[2])) END.";
        let first = listing_of(source);
        let second = listing_of(source);
        assert_eq!(first, second);
    }

    #[test]
    fn test_redeclaration_produces_no_listing() {
        let compilation = compile_source(
            b"PROGRAM p; DECLARE x : INTEGER; x : REAL; BEGIN END.",
            Options::default(),
        );
        assert!(compilation.listing.is_none());
        assert!(compilation
            .session
            .diags
            .records()
            .iter()
            .any(|d| d.code == Code::DeclaredTwice));
    }

    #[test]
    fn test_optimized_listing_is_smaller() {
        let source = "PROGRAM p; DECLARE x : INTEGER; BEGIN x := 1 + 2; WRITE(FORMAT(x)) END.";
        let plain = listing_of(source);
        let optimized = {
            let compilation = compile_source(
                source.as_bytes(),
                Options { optimize: true, ..Options::default() },
            );
            compilation.listing.expect("listing")
        };
        assert!(optimized.len() < plain.len());
    }

    #[test]
    fn test_range_checks_grow_the_listing() {
        let source =
            "PROGRAM p; DECLARE a : ARRAY[1..3] OF INTEGER; BEGIN a[2] := 1 END.";
        let with_checks = listing_of(source);
        let without = {
            let compilation = compile_source(
                source.as_bytes(),
                Options { range_checks: false, ..Options::default() },
            );
            compilation.listing.expect("listing")
        };
        assert!(with_checks.len() > without.len());
    }
}
