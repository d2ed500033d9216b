use std::fmt;
use std::io;
use std::path::PathBuf;

//===----------------------------------------------------------------------===//
// Fault
//
// Interpreter failures. Each kind maps to a small numeric code that scripts
// can observe through `catch` as `(ERR . code)` and raise with `throw`.
//===----------------------------------------------------------------------===//

#[derive(Debug, Clone)]
pub enum Fault {
    /// `first`/`next`/`set-first!`/`set-next!` on something that is not a pair.
    NotAPair,
    /// Asynchronous interruption.
    Break,
    /// Environment lookup or `setq` miss; carries the symbol name when known.
    UnboundSymbol(String),
    /// Applying a value that is not a primitive, closure or macro.
    CannotApply,
    /// Arity mismatch, bad argument, or a failed file open.
    Arguments(String),
    /// Reserved.
    StackOver,
    /// The collector could not free enough space.
    OutOfMemory,
    /// Reader failure.
    Syntax(String),
    /// An arbitrary code raised by `throw`.
    Raised(i32),
}

impl Fault {
    /// The numeric code observable through `catch`.
    pub fn code(&self) -> i32 {
        match self {
            Fault::NotAPair => 1,
            Fault::Break => 2,
            Fault::UnboundSymbol(_) => 3,
            Fault::CannotApply => 4,
            Fault::Arguments(_) => 5,
            Fault::StackOver => 6,
            Fault::OutOfMemory => 7,
            Fault::Syntax(_) => 8,
            Fault::Raised(n) => *n,
        }
    }

    /// The human label for a code, empty for codes outside the table.
    pub fn label(code: i32) -> &'static str {
        match code {
            1 => "not a pair",
            2 => "break",
            3 => "unbound symbol",
            4 => "cannot apply",
            5 => "arguments",
            6 => "stack over",
            7 => "out of memory",
            8 => "syntax",
            _ => "",
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::UnboundSymbol(name) if !name.is_empty() => {
                write!(f, "unbound symbol: {}", name)
            }
            Fault::Arguments(detail) if !detail.is_empty() => {
                write!(f, "arguments: {}", detail)
            }
            Fault::Syntax(detail) if !detail.is_empty() => {
                write!(f, "syntax: {}", detail)
            }
            Fault::Raised(n) => {
                let label = Fault::label(*n);
                if label.is_empty() {
                    write!(f, "error {}", n)
                } else {
                    write!(f, "{}", label)
                }
            }
            other => write!(f, "{}", Fault::label(other.code())),
        }
    }
}

//===----------------------------------------------------------------------===//
// HouseError
//
// Host-side failures: sandbox violations, manifest problems, daemon boot.
//===----------------------------------------------------------------------===//

#[derive(Debug)]
pub enum HouseError {
    /// An underlying OS error on a sandboxed path.
    Io { path: PathBuf, source: io::Error },
    /// A path that resolves outside the sandbox root.
    OutsideSandbox(PathBuf),
    /// A malformed manifest line.
    Manifest { line: usize, reason: String },
    /// `evoke` with a language the host cannot instantiate.
    UnknownLanguage(String),
    /// An interpreter fault during daemon bootstrap.
    Boot(Fault),
}

impl fmt::Display for HouseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HouseError::Io { path, source } => {
                write!(f, "i/o error on {}: {}", path.display(), source)
            }
            HouseError::OutsideSandbox(path) => {
                write!(f, "path escapes the sandbox: {}", path.display())
            }
            HouseError::Manifest { line, reason } => {
                write!(f, "manifest line {}: {}", line, reason)
            }
            HouseError::UnknownLanguage(lang) => {
                write!(f, "no runtime for language '{}'", lang)
            }
            HouseError::Boot(fault) => write!(f, "daemon bootstrap failed: {}", fault),
        }
    }
}

impl std::error::Error for HouseError {}
