//! Interactive REPL over a single interpreter instance.
//!
//! The outer loop is the interpreter's recovery boundary: an uncaught fault
//! is reported with its numeric code, the root registry is truncated back to
//! the permanent globals, and the loop re-arms. A collection is forced before
//! every prompt, and the prompt shows the free cell count.

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use crate::daemon::House;
use crate::error::Fault;
use crate::interp::Interp;
use crate::printer::print_value;
use crate::sandbox::Sandbox;

const HISTORY_FILE: &str = ".dollhouse-history";

pub struct Repl {
    house: House,
    interp: Interp,
}

impl Repl {
    pub fn new(sandbox: Sandbox, heap_cells: usize) -> Result<Self, Fault> {
        let house = House::with_heap(sandbox, heap_cells);
        let interp = Interp::new(heap_cells)?;
        Ok(Repl { house, interp })
    }

    pub fn set_trace(&mut self, level: u64) {
        self.interp.set_trace(level);
    }

    /// Unclosed parens or an open string mean the form continues on the next
    /// line.
    fn is_incomplete(input: &str) -> bool {
        let mut depth = 0i32;
        let mut in_string = false;
        let mut escaped = false;
        for c in input.chars() {
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                '\\' if in_string => escaped = true,
                '"' => in_string = !in_string,
                ';' if !in_string => break,
                '(' if !in_string => depth += 1,
                ')' if !in_string => depth -= 1,
                _ => {}
            }
        }
        depth > 0 || in_string
    }

    fn help_message(&self) -> String {
        format!(
            "{}\n\
             \n{}\n  \
             :help, :h      Show this help message\n  \
             :quit, :q      Exit\n  \
             :load <file>   Evaluate a file from the sandbox\n  \
             :gc            Force a collection\n\
             \n{}\n  \
             (+ 1 2 3)                  => 6\n  \
             (define n 42)              => n\n  \
             (catch (first 3))          => (ERR . 1)\n",
            format!("Dollhouse REPL v{}", env!("CARGO_PKG_VERSION")).bold(),
            "Commands:".yellow().bold(),
            "Examples:".yellow().bold()
        )
    }

    fn handle_command(&mut self, line: &str) -> Option<bool> {
        let parts: Vec<&str> = line.trim().split_whitespace().collect();
        match parts.first().copied() {
            Some(":help") | Some(":h") => {
                println!("{}", self.help_message());
                Some(false)
            }
            Some(":quit") | Some(":q") => Some(true),
            Some(":gc") => {
                self.interp.force_collect();
                println!("{} free cells", self.interp.heap.free_cells());
                Some(false)
            }
            Some(":load") => {
                match parts.get(1) {
                    None => eprintln!("{}", "Usage: :load <file>".red()),
                    Some(name) => match self.house.sandbox().read_all(name) {
                        Ok(data) => {
                            let src = String::from_utf8_lossy(&data).into_owned();
                            self.eval_and_report(&src);
                        }
                        Err(err) => eprintln!("{} {}", "Error:".red().bold(), err),
                    },
                }
                Some(false)
            }
            _ => None,
        }
    }

    fn eval_and_report(&mut self, src: &str) {
        match self.interp.eval_source(&mut self.house, src) {
            Ok(value) => {
                println!("{}", print_value(&self.interp.heap, value).yellow());
            }
            Err(fault) => {
                eprintln!(
                    "{}",
                    format!("ERR {}: {}", fault.code(), fault).red().bold()
                );
                self.interp.recover();
            }
        }
    }

    pub fn run(&mut self) {
        let mut editor = match DefaultEditor::new() {
            Ok(editor) => editor,
            Err(err) => {
                eprintln!("{} {}", "cannot start line editor:".red(), err);
                return;
            }
        };
        let _ = editor.load_history(HISTORY_FILE);

        println!(
            "{}",
            format!("Dollhouse v{} - type :help for help", env!("CARGO_PKG_VERSION"))
                .cyan()
        );

        let mut buffer = String::new();
        loop {
            self.interp.force_collect();
            let prompt = if buffer.is_empty() {
                format!("{}> ", self.interp.heap.free_cells())
            } else {
                "..  ".to_string()
            };
            match editor.readline(&prompt) {
                Ok(line) => {
                    if buffer.is_empty() && line.trim_start().starts_with(':') {
                        let _ = editor.add_history_entry(line.as_str());
                        match self.handle_command(&line) {
                            Some(true) => break,
                            Some(false) => continue,
                            None => {
                                eprintln!("{} {}", "unknown command".red(), line.trim());
                                continue;
                            }
                        }
                    }

                    if !buffer.is_empty() {
                        buffer.push('\n');
                    }
                    buffer.push_str(&line);
                    if Self::is_incomplete(&buffer) {
                        continue;
                    }

                    let _ = editor.add_history_entry(buffer.as_str());
                    let _ = editor.save_history(HISTORY_FILE);
                    if !buffer.trim().is_empty() {
                        let input = std::mem::take(&mut buffer);
                        self.eval_and_report(&input);
                    } else {
                        buffer.clear();
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    buffer.clear();
                    continue;
                }
                Err(ReadlineError::Eof) => break,
                Err(err) => {
                    eprintln!("{} {:?}", "readline error:".red(), err);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_detection() {
        assert!(Repl::is_incomplete("(+ 1"));
        assert!(Repl::is_incomplete("\"open string"));
        assert!(!Repl::is_incomplete("(+ 1 2)"));
        assert!(!Repl::is_incomplete("(print \")\")"));
        // Comments hide parens.
        assert!(!Repl::is_incomplete("1 ; ("));
    }
}
