//! Buffered compile-time diagnostics.
//!
//! Problems found during the phases are not printed on the spot: they are
//! buffered here and emitted in one batch at shutdown, capped at
//! [`MAX_REPORTED`] entries. Fatal-or-worse records disable code generation,
//! as do error-class records in the semantic and type domains; the later
//! phases keep running either way so one bad declaration does not hide the
//! next.

use std::fmt::Write as _;

pub const MAX_REPORTED: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Class {
    Notice,
    Comment,
    Warning,
    Error,
    Fatal,
    Abort,
}

impl Class {
    fn as_str(&self) -> &'static str {
        match self {
            Class::Notice => "Notice",
            Class::Comment => "Comment",
            Class::Warning => "Warning",
            Class::Error => "Error",
            Class::Fatal => "Fatal Error",
            Class::Abort => "Abort Error",
        }
    }
}

/// The domain a record belongs to. `System` flags coding errors in the
/// compiler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    File,
    Memory,
    System,
    Syntax,
    Semantic,
    Type,
}

impl Domain {
    fn as_str(&self) -> &'static str {
        match self {
            Domain::File => "File",
            Domain::Memory => "Memory",
            Domain::System => "Internal",
            Domain::Syntax => "Syntax",
            Domain::Semantic => "Semantic",
            Domain::Type => "Type",
        }
    }

    /// Source-level domains report a line number, the others a location
    /// string (usually the function that failed).
    fn has_line(&self) -> bool {
        matches!(self, Domain::Syntax | Domain::Semantic | Domain::Type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    // file
    OpenFile,
    FileEmpty,
    // syntax
    StringNotTerminated,
    RealConstExpSign,
    IllegalChar,
    // semantic
    SymbolExpected,
    MissingSemicolon,
    DeclaredTwice,
    LwbGreaterUpb,
    NoFuncOrProc,
    NoVariable,
    Undeclared,
    FuncNoReturn,
    NeverReached,
    // type
    WrongType,
    ParamType,
    ParamCount,
    ParamInProcReturn,
    NoParamInFuncReturn,
    NoSimpleTypeActual,
    BooleanNeeded,
    WrongLhsType,
    WrongRhsType,
    TooManyIndices,
    NotIndexType,
    NoReadArray,
    StringUnsupported,
    // internal
    NotInConstab,
    IllegalTag,
    IllegalOperand,
    OutOfRegisters,
    MoreErrors,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub class: Class,
    pub domain: Domain,
    pub code: Code,
    pub info: Option<String>,
    pub line: u32,
}

impl Diagnostic {
    fn message(&self, out: &mut String) {
        let info = self.info.as_deref().unwrap_or("?");
        match self.code {
            Code::OpenFile => out.push_str("could not open file"),
            Code::FileEmpty => out.push_str("file is empty"),
            Code::StringNotTerminated => out.push_str("string not terminated"),
            Code::RealConstExpSign => {
                out.push_str("sign of exponent in real constant missing")
            }
            Code::IllegalChar => out.push_str("illegal character in input"),
            Code::SymbolExpected => {
                let _ = write!(out, "{} expected", info);
            }
            Code::MissingSemicolon => out.push_str("semicolon missing (inserted)"),
            Code::DeclaredTwice => out.push_str("identifier declared twice"),
            Code::LwbGreaterUpb => {
                out.push_str("lower bound of array exceeds upper bound")
            }
            Code::NoFuncOrProc => out.push_str("identifier is not a procedure/function"),
            Code::NoVariable => out.push_str("identifier is not a variable"),
            Code::Undeclared => out.push_str("identifier undeclared"),
            Code::FuncNoReturn => out.push_str("function might not return a value"),
            Code::NeverReached => out.push_str("code is never reached => ignoring"),
            Code::WrongType => {
                out.push_str("types don't match");
                if let Some(info) = &self.info {
                    let _ = write!(out, ", {} expected", info);
                }
            }
            Code::ParamType => {
                let _ = write!(out, "actual type doesn't match declaration (#{})", info);
            }
            Code::ParamCount => {
                out.push_str("number of parameters differs from declaration")
            }
            Code::ParamInProcReturn => {
                out.push_str("procedure return must not have any parameters")
            }
            Code::NoParamInFuncReturn => {
                out.push_str("function return must have one parameter")
            }
            Code::NoSimpleTypeActual => out.push_str("actual must be of simple type"),
            Code::BooleanNeeded => out.push_str("condition is not a BOOLEAN expression"),
            Code::WrongLhsType => out.push_str("illegal type on left hand side"),
            Code::WrongRhsType => out.push_str("illegal type on right hand side"),
            Code::TooManyIndices => out.push_str("more indices used than declared"),
            Code::NotIndexType => out.push_str("index is not an INTEGER expression"),
            Code::NoReadArray => out.push_str("cannot read ARRAYs directly"),
            Code::StringUnsupported => {
                let _ = write!(out, "{} is not supported for STRING operands", info);
            }
            Code::NotInConstab => out.push_str("requested constant table id does not exist"),
            Code::IllegalTag => {
                let _ = write!(out, "illegal tag in an {} node", info);
            }
            Code::IllegalOperand => {
                out.push_str("illegal combination of operand modes and types")
            }
            Code::OutOfRegisters => out.push_str("register allocation exhausted"),
            Code::MoreErrors => out.push_str("more errors reported"),
        }
    }
}

#[derive(Debug)]
pub struct Diagnostics {
    buffer: Vec<Diagnostic>,
    total: usize,
    gencode: bool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Diagnostics { buffer: Vec::new(), total: 0, gencode: true }
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&mut self, class: Class, domain: Domain, code: Code, info: Option<String>, line: u32) {
        if class >= Class::Fatal
            || (class >= Class::Error && matches!(domain, Domain::Semantic | Domain::Type))
        {
            self.gencode = false;
        }
        if self.buffer.len() < MAX_REPORTED {
            self.buffer.push(Diagnostic { class, domain, code, info, line });
        }
        self.total += 1;
    }

    /// Internal compiler error: something a correct front end never hands
    /// the back end.
    pub fn internal(&mut self, code: Code, info: &str) {
        self.log(Class::Fatal, Domain::System, code, Some(info.to_string()), 0);
    }

    /// Whether code generation is still allowed.
    pub fn gencode(&self) -> bool {
        self.gencode
    }

    pub fn has_errors(&self) -> bool {
        self.buffer.iter().any(|d| d.class >= Class::Error)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn records(&self) -> &[Diagnostic] {
        &self.buffer
    }

    /// Render the buffered records the way the reporter prints them at
    /// shutdown.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.total == 0 {
            return out;
        }
        let _ = writeln!(out, "number of errors reported: {}", self.total);
        for d in &self.buffer {
            if d.domain.has_line() {
                let _ = write!(
                    out,
                    "{}: {} Error in line {} : ",
                    d.class.as_str(),
                    d.domain.as_str(),
                    d.line
                );
            } else {
                let _ = write!(
                    out,
                    "{}: {} Error in {} : ",
                    d.class.as_str(),
                    d.domain.as_str(),
                    d.info.as_deref().unwrap_or("?")
                );
            }
            d.message(&mut out);
            out.push('\n');
        }
        if self.total > self.buffer.len() {
            let more = Diagnostic {
                class: Class::Comment,
                domain: Domain::System,
                code: Code::MoreErrors,
                info: None,
                line: 0,
            };
            let _ = write!(out, "{}: {} Error in {} : ", more.class.as_str(), "Internal", "log");
            more.message(&mut out);
            out.push('\n');
        }
        out
    }

    pub fn print(&self) {
        let rendered = self.render();
        if !rendered.is_empty() {
            print!("{}", rendered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warnings_keep_codegen_enabled() {
        let mut diags = Diagnostics::new();
        diags.log(Class::Warning, Domain::Semantic, Code::MissingSemicolon, None, 3);
        assert!(diags.gencode());
        assert!(!diags.has_errors());
    }

    #[test]
    fn test_semantic_error_disables_codegen() {
        let mut diags = Diagnostics::new();
        diags.log(Class::Error, Domain::Semantic, Code::DeclaredTwice, None, 2);
        assert!(!diags.gencode());
        assert!(diags.has_errors());
    }

    #[test]
    fn test_syntax_error_keeps_codegen() {
        // Lexical errors are recoverable and do not gate the back end.
        let mut diags = Diagnostics::new();
        diags.log(Class::Error, Domain::Syntax, Code::StringNotTerminated, None, 1);
        assert!(diags.gencode());
        assert!(diags.has_errors());
    }

    #[test]
    fn test_buffer_caps_at_limit_but_counts_all() {
        let mut diags = Diagnostics::new();
        for i in 0..150 {
            diags.log(Class::Notice, Domain::Semantic, Code::NeverReached, None, i);
        }
        assert_eq!(diags.records().len(), MAX_REPORTED);
        assert_eq!(diags.total(), 150);
        assert!(diags.render().contains("more errors reported"));
    }

    #[test]
    fn test_render_line_and_location_forms() {
        let mut diags = Diagnostics::new();
        diags.log(Class::Error, Domain::Semantic, Code::SymbolExpected, Some("BEGIN".into()), 7);
        diags.log(Class::Abort, Domain::File, Code::OpenFile, Some("compile_file".into()), 0);
        let out = diags.render();
        assert!(out.contains("Error: Semantic Error in line 7 : BEGIN expected"));
        assert!(out.contains("Abort Error: File Error in compile_file : could not open file"));
        assert!(out.starts_with("number of errors reported: 2"));
    }
}
