use std::io::{self, BufRead, Write};

use colored::Colorize;

use crate::daemon::{
    Direction, House, Interface, DAEMON_NAME_LEN, FORMAT_LEN, INTERFACE_NAME_LEN, LANG_LEN,
    TYPE_LEN,
};
use crate::error::Fault;
use crate::heap::{Heap, Root};
use crate::manifest::clip;
use crate::printer::{num_to_string, print_value, write_value};
use crate::reader::{read_form, ProgramStack, MAX_GOSUB_RECURSE};
use crate::value::{Tag, Value};

/// Default cells per semispace.
pub const HEAP_CELLS: usize = 8192;

/// `input` truncates lines at this many bytes.
pub const INPUT_BUFFER_SIZE: usize = 1024;

/// The two roots that survive outer-loop recovery: `#t` and the global
/// environment, pushed first at construction.
const PERMANENT_ROOTS: usize = 2;

//===----------------------------------------------------------------------===//
// Host-facing interpreter state
//===----------------------------------------------------------------------===//

/// How a pending output is rendered when the router synthesises the
/// consumer-side invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// A string payload: emitted quoted, with `"` and `\` escaped.
    Text,
    /// A byte-list payload: emitted as `(list b ...)`.
    Bytes,
    /// A stringified scalar: emitted as bare source text.
    Literal,
}

/// The daemon's single pending-output slot. Overwritten by later `output`s
/// until the router drains it.
#[derive(Debug, Clone)]
pub struct PendingOutput {
    pub port: String,
    pub kind: PayloadKind,
    pub data: Vec<u8>,
}

enum Out {
    Stdout,
    Capture(String),
}

pub enum TickStatus {
    /// One top-level form was evaluated.
    Ran,
    /// The main program cursor is exhausted.
    Finished,
}

//===----------------------------------------------------------------------===//
// Interpreter instance
//===----------------------------------------------------------------------===//

/// One interpreter: heaps, cursor stack, primitives state, and the slots the
/// host reads between ticks (yield flag, pending output, declared
/// interfaces). Every daemon owns exactly one.
pub struct Interp {
    pub heap: Heap,
    pub sources: ProgramStack,
    trace: u64,
    pub yielded: bool,
    pub pending: Option<PendingOutput>,
    interfaces: Vec<Interface>,
    fresh: Vec<Interface>,
    tru: Root,
    genv: Root,
    out: Out,
}

impl Interp {
    pub fn new(cells: usize) -> Result<Self, Fault> {
        let mut heap = Heap::new(cells);
        let tru_v = heap.intern(b"#t")?;
        let tru = heap.push_root(tru_v);
        let genv = heap.push_root(Value::NIL);
        let mut it = Interp {
            heap,
            sources: ProgramStack::new(),
            trace: 0,
            yielded: false,
            pending: None,
            interfaces: Vec::new(),
            fresh: Vec::new(),
            tru,
            genv,
            out: Out::Stdout,
        };
        // Seed the global environment with #t and the primitives.
        let e = it.env_pair(it.heap.root(tru), it.heap.root(tru), genv)?;
        it.heap.set_root(genv, e);
        for (i, prim) in PRIMITIVES.iter().enumerate() {
            let name = it.heap.intern(prim.name.as_bytes())?;
            let e = it.env_pair(name, Value::boxed(Tag::Primitive, i as u64), genv)?;
            it.heap.set_root(genv, e);
        }
        Ok(it)
    }

    pub fn global_env(&self) -> Root {
        self.genv
    }

    pub fn interfaces(&self) -> &[Interface] {
        &self.interfaces
    }

    /// Record a declared interface, skipping exact duplicates, and queue it
    /// for router matching.
    pub fn declare_interface(&mut self, iface: Interface) {
        if self.interfaces.iter().any(|i| *i == iface) {
            return;
        }
        self.interfaces.push(iface.clone());
        self.fresh.push(iface);
    }

    /// Interfaces declared since the host last looked.
    pub fn take_fresh(&mut self) -> Vec<Interface> {
        std::mem::take(&mut self.fresh)
    }

    pub fn set_trace(&mut self, level: u64) {
        self.trace = level;
    }

    /// Redirect `print`/`write` into a buffer; used by tests.
    pub fn capture_output(&mut self) {
        self.out = Out::Capture(String::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            Out::Stdout => String::new(),
            Out::Capture(buf) => std::mem::take(buf),
        }
    }

    fn emit(&mut self, s: &str) {
        match &mut self.out {
            Out::Stdout => {
                print!("{}", s);
                let _ = io::stdout().flush();
            }
            Out::Capture(buf) => buf.push_str(s),
        }
    }

    /// Force a collection; the REPL runs one per line.
    pub fn force_collect(&mut self) {
        self.heap.collect_now();
    }

    /// Outer-boundary recovery after an uncaught fault: truncate the root
    /// registry back to the permanent globals so the heap stays reachable.
    pub fn recover(&mut self) {
        self.heap.release(PERMANENT_ROOTS);
    }

    //===------------------------------------------------------------------===//
    // Environments
    //===------------------------------------------------------------------===//

    /// `((v . x) . env)`, reading `env` through its root so a collection
    /// triggered by the first cons is observed.
    fn env_pair(&mut self, v: Value, x: Value, env: Root) -> Result<Value, Fault> {
        let b = self.heap.cons(v, x)?;
        self.heap.cons(b, self.heap.root(env))
    }

    /// Look a symbol up in an environment list. Empty-name atoms are nil.
    fn assoc(&self, v: Value, env: Value) -> Result<Value, Fault> {
        if v.tag() == Tag::Atom && self.heap.bytes(v).is_empty() {
            return Ok(Value::NIL);
        }
        let mut e = env;
        while e.tag() == Tag::Pair {
            let binding = self.heap.first(e)?;
            if self.heap.first(binding)? == v {
                return self.heap.next(binding);
            }
            e = self.heap.next(e)?;
        }
        if v.tag() == Tag::Atom {
            Err(Fault::UnboundSymbol(
                String::from_utf8_lossy(self.heap.bytes(v)).into_owned(),
            ))
        } else {
            Err(Fault::UnboundSymbol(String::new()))
        }
    }

    /// Install or overwrite a binding: in place when the name is already
    /// bound in the current environment, else prepended to the global one.
    fn install(&mut self, v: Value, x: Value, e: Root) -> Result<(), Fault> {
        let mut d = self.heap.root(e);
        while d.tag() == Tag::Pair && self.heap.first(self.heap.first(d)?)? != v {
            d = self.heap.next(d)?;
        }
        if d.tag() == Tag::Pair {
            self.heap.set_next(self.heap.first(d)?, x)?;
        } else {
            let ne = self.env_pair(v, x, self.genv)?;
            self.heap.set_root(self.genv, ne);
        }
        Ok(())
    }

    fn more(&self, v: Value) -> Result<bool, Fault> {
        if v.is_nil() {
            return Ok(false);
        }
        Ok(!self.heap.next(v)?.is_nil())
    }

    fn nth(&self, mut s: Value, n: usize) -> Result<Value, Fault> {
        for _ in 0..n {
            s = self.heap.next(s)?;
        }
        self.heap.first(s)
    }

    fn tru_value(&self) -> Value {
        self.heap.root(self.tru)
    }

    fn boolean(&self, b: bool) -> Value {
        if b {
            self.tru_value()
        } else {
            Value::NIL
        }
    }

    //===------------------------------------------------------------------===//
    // Evaluation
    //===------------------------------------------------------------------===//

    pub fn eval(&mut self, house: &mut House, x: Value, e: Root) -> Result<Value, Fault> {
        if self.trace == 0 {
            return self.step(house, x, e);
        }
        let m = self.heap.mark();
        let xr = self.heap.push_root(x);
        let y = self.step(house, self.heap.root(xr), e)?;
        let count = self.heap.root_count();
        let shown_x = print_value(&self.heap, self.heap.root(xr));
        let shown_y = print_value(&self.heap, y);
        println!(
            "{} {} {} {}",
            format!("{:4}:", count).green(),
            shown_x.yellow(),
            "=>".cyan(),
            shown_y.yellow()
        );
        if self.trace > 1 {
            // Level 2 waits for a keypress between steps.
            let mut pause = String::new();
            let _ = io::stdin().lock().read_line(&mut pause);
        }
        self.heap.release(m);
        Ok(y)
    }

    /// The tail-call step loop. Failures propagate without releasing the
    /// registered roots; `catch` or the outer boundary truncates back to its
    /// snapshot, which is what restores the registry.
    fn step(&mut self, house: &mut House, x0: Value, env: Root) -> Result<Value, Fault> {
        let m = self.heap.mark();
        let x = self.heap.push_root(x0);
        let f = self.heap.push_root(Value::NIL);
        let v = self.heap.push_root(Value::NIL);
        let d = self.heap.push_root(Value::NIL);
        let z = self.heap.push_root(Value::NIL);
        let mut e = env;
        let value = loop {
            let cur = self.heap.root(x);
            if cur.tag() == Tag::Atom {
                break self.assoc(cur, self.heap.root(e))?;
            }
            if cur.tag() != Tag::Pair {
                break cur;
            }
            let head = self.heap.first(cur)?;
            let fv = self.eval(house, head, e)?;
            self.heap.set_root(f, fv);
            let args = self.heap.next(self.heap.root(x))?;
            self.heap.set_root(x, args);
            // Evaluate in a copy of the environment so primitives such as
            // `let` can extend it without touching the caller's slot.
            self.heap.set_root(z, self.heap.root(e));
            e = z;
            match self.heap.root(f).tag() {
                Tag::Primitive => {
                    let idx = self.heap.root(f).ord() as usize;
                    let prim = &PRIMITIVES[idx];
                    let r = (prim.run)(self, house, x, e)?;
                    if prim.tail {
                        self.heap.set_root(x, r);
                        continue;
                    }
                    break r;
                }
                Tag::Closure => {
                    let clo = self.heap.root(f);
                    let inner = self.heap.first(clo)?;
                    self.heap.set_root(v, self.heap.first(inner)?);
                    let cap = self.heap.next(clo)?;
                    let captured = if cap.is_nil() { self.heap.root(self.genv) } else { cap };
                    self.heap.set_root(d, captured);
                    // Positional parameters pair with eagerly evaluated
                    // actuals left to right.
                    while self.heap.root(v).tag() == Tag::Pair
                        && self.heap.root(x).tag() == Tag::Pair
                    {
                        let arg = self.heap.first(self.heap.root(x))?;
                        let y = self.eval(house, arg, e)?;
                        let name = self.heap.first(self.heap.root(v))?;
                        let nd = self.env_pair(name, y, d)?;
                        self.heap.set_root(d, nd);
                        let nv = self.heap.next(self.heap.root(v))?;
                        self.heap.set_root(v, nv);
                        let nx = self.heap.next(self.heap.root(x))?;
                        self.heap.set_root(x, nx);
                    }
                    if self.heap.root(v).tag() == Tag::Pair {
                        // Actuals ended in a dotted expression; evaluate it
                        // and keep binding from the resulting list.
                        let y = self.eval(house, self.heap.root(x), e)?;
                        self.heap.set_root(x, y);
                        while self.heap.root(v).tag() == Tag::Pair
                            && self.heap.root(x).tag() == Tag::Pair
                        {
                            let name = self.heap.first(self.heap.root(v))?;
                            let val = self.heap.first(self.heap.root(x))?;
                            let nd = self.env_pair(name, val, d)?;
                            self.heap.set_root(d, nd);
                            let nv = self.heap.next(self.heap.root(v))?;
                            self.heap.set_root(v, nv);
                            let nx = self.heap.next(self.heap.root(x))?;
                            self.heap.set_root(x, nx);
                        }
                        if self.heap.root(v).tag() == Tag::Pair {
                            return Err(Fault::Arguments("too few actuals".into()));
                        }
                    } else if self.heap.root(x).tag() == Tag::Pair {
                        let rest = self.evlis(house, x, e)?;
                        self.heap.set_root(x, rest);
                    } else if !self.heap.root(x).is_nil() {
                        let y = self.eval(house, self.heap.root(x), e)?;
                        self.heap.set_root(x, y);
                    }
                    if !self.heap.root(v).is_nil() {
                        // A dotted or bare formal takes the remaining
                        // actuals as one list.
                        let nd =
                            self.env_pair(self.heap.root(v), self.heap.root(x), d)?;
                        self.heap.set_root(d, nd);
                    }
                    let body = self.heap.next(self.heap.first(self.heap.root(f))?)?;
                    self.heap.set_root(x, body);
                    e = d;
                }
                Tag::Macro => {
                    // Formals bind to the unevaluated operands; the body's
                    // result re-enters the loop for evaluation.
                    self.heap.set_root(d, self.heap.root(self.genv));
                    self.heap.set_root(v, self.heap.first(self.heap.root(f))?);
                    while self.heap.root(v).tag() == Tag::Pair
                        && self.heap.root(x).tag() == Tag::Pair
                    {
                        let name = self.heap.first(self.heap.root(v))?;
                        let val = self.heap.first(self.heap.root(x))?;
                        let nd = self.env_pair(name, val, d)?;
                        self.heap.set_root(d, nd);
                        let nv = self.heap.next(self.heap.root(v))?;
                        self.heap.set_root(v, nv);
                        let nx = self.heap.next(self.heap.root(x))?;
                        self.heap.set_root(x, nx);
                    }
                    if self.heap.root(v).tag() == Tag::Pair {
                        return Err(Fault::Arguments("too few operands".into()));
                    }
                    if !self.heap.root(v).is_nil() {
                        let nd =
                            self.env_pair(self.heap.root(v), self.heap.root(x), d)?;
                        self.heap.set_root(d, nd);
                    }
                    let body = self.heap.next(self.heap.root(f))?;
                    let y = self.eval(house, body, d)?;
                    self.heap.set_root(x, y);
                }
                _ => return Err(Fault::CannotApply),
            }
        };
        self.heap.release(m);
        Ok(value)
    }

    /// Evaluate every element of the list in `t`, consuming the root slot as
    /// it walks so partial results stay reachable.
    fn evlis(&mut self, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
        let m = self.heap.mark();
        let s = self.heap.push_root(Value::NIL);
        let p = self.heap.push_root(Value::NIL);
        while self.heap.root(t).tag() == Tag::Pair {
            let arg = self.heap.first(self.heap.root(t))?;
            let y = self.eval(house, arg, e)?;
            let cell = self.heap.cons(y, Value::NIL)?;
            let pv = self.heap.root(p);
            if pv.tag() == Tag::Pair {
                self.heap.set_next(pv, cell)?;
            } else {
                self.heap.set_root(s, cell);
            }
            self.heap.set_root(p, cell);
            let nt = self.heap.next(self.heap.root(t))?;
            self.heap.set_root(t, nt);
        }
        if !self.heap.root(t).is_nil() {
            // Dotted argument list.
            let y = self.eval(house, self.heap.root(t), e)?;
            let pv = self.heap.root(p);
            if pv.tag() == Tag::Pair {
                self.heap.set_next(pv, y)?;
            } else {
                self.heap.set_root(s, y);
            }
        }
        let r = self.heap.root(s);
        self.heap.release(m);
        Ok(r)
    }

    /// Evaluate all but the last form of `l` in `e`; return the last form
    /// unevaluated (nil when `l` is empty). The tail of `begin` and of the
    /// binding initialisers in the let family.
    fn begin_prefix(&mut self, house: &mut House, l: Value, e: Root) -> Result<Value, Fault> {
        let m = self.heap.mark();
        let lr = self.heap.push_root(l);
        while self.more(self.heap.root(lr))? {
            let a = self.heap.first(self.heap.root(lr))?;
            self.eval(house, a, e)?;
            let n = self.heap.next(self.heap.root(lr))?;
            self.heap.set_root(lr, n);
        }
        let lv = self.heap.root(lr);
        let r = if lv.is_nil() { Value::NIL } else { self.heap.first(lv)? };
        self.heap.release(m);
        Ok(r)
    }

    fn make_closure(&mut self, params: Value, body: Value, env: Root) -> Result<Value, Fault> {
        let inner = self.heap.cons(params, body)?;
        // The global environment is captured as nil so closures see later
        // global definitions at application time.
        let ev = self.heap.root(env);
        let cap = if ev == self.heap.root(self.genv) { Value::NIL } else { ev };
        let cell = self.heap.cons(inner, cap)?;
        Ok(Value::boxed(Tag::Closure, cell.ord()))
    }

    /// The printed bytes a value contributes to `string`, `output` names and
    /// file paths: atom/string contents, a byte per numeric list element, or
    /// the numeric literal.
    fn value_bytes_into(&self, y: Value, out: &mut Vec<u8>) -> Result<(), Fault> {
        match y.tag() {
            Tag::Atom | Tag::String => out.extend_from_slice(self.heap.bytes(y)),
            Tag::Pair => {
                let mut p = y;
                while p.tag() == Tag::Pair {
                    out.push(self.heap.first(p)?.as_f64() as u8);
                    p = self.heap.next(p)?;
                }
            }
            _ => {
                let n = y.as_f64();
                if n == n {
                    out.extend_from_slice(num_to_string(n).as_bytes());
                }
            }
        }
        Ok(())
    }

    fn list_bytes(&self, mut s: Value) -> Result<Vec<u8>, Fault> {
        let mut out = Vec::new();
        while !s.is_nil() {
            let y = self.heap.first(s)?;
            self.value_bytes_into(y, &mut out)?;
            s = self.heap.next(s)?;
        }
        Ok(out)
    }

    //===------------------------------------------------------------------===//
    // Top-level driving
    //===------------------------------------------------------------------===//

    /// Evaluate one top-level form from the cursor stack. The scheduler calls
    /// this once per tick.
    pub fn tick(&mut self, house: &mut House) -> Result<TickStatus, Fault> {
        match read_form(&mut self.heap, &mut self.sources)? {
            None => Ok(TickStatus::Finished),
            Some(form) => {
                self.eval(house, form, self.genv)?;
                Ok(TickStatus::Ran)
            }
        }
    }

    /// Evaluate a whole source text as the main program, returning the value
    /// of the last form. Used by the REPL and tests.
    pub fn eval_source(&mut self, house: &mut House, src: &str) -> Result<Value, Fault> {
        self.sources.set_main(src.to_string());
        let m = self.heap.mark();
        let lr = self.heap.push_root(Value::NIL);
        let result = loop {
            match read_form(&mut self.heap, &mut self.sources) {
                Err(e) => break Err(e),
                Ok(None) => break Ok(self.heap.root(lr)),
                Ok(Some(form)) => match self.eval(house, form, self.genv) {
                    Ok(val) => self.heap.set_root(lr, val),
                    Err(e) => break Err(e),
                },
            }
        };
        self.heap.release(m);
        result
    }

    /// Like `eval_source`, but through a detached cursor so the daemon's own
    /// program stack is left untouched. Host inspection hook.
    pub fn eval_snippet(&mut self, house: &mut House, src: &str) -> Result<Value, Fault> {
        let mut local = ProgramStack::new();
        local.set_main(src.to_string());
        let m = self.heap.mark();
        let lr = self.heap.push_root(Value::NIL);
        let result = loop {
            match read_form(&mut self.heap, &mut local) {
                Err(e) => break Err(e),
                Ok(None) => break Ok(self.heap.root(lr)),
                Ok(Some(form)) => match self.eval(house, form, self.genv) {
                    Ok(val) => self.heap.set_root(lr, val),
                    Err(e) => break Err(e),
                },
            }
        };
        self.heap.release(m);
        result
    }
}

//===----------------------------------------------------------------------===//
// Primitives
//
// Each has a name, a function, and a tail flag: a tail primitive's result
// replaces the current expression in the step loop instead of returning.
//===----------------------------------------------------------------------===//

type PrimFn = fn(&mut Interp, &mut House, Root, Root) -> Result<Value, Fault>;

pub struct Primitive {
    pub name: &'static str,
    run: PrimFn,
    tail: bool,
}

macro_rules! prim {
    ($name:literal, $f:ident) => {
        Primitive { name: $name, run: $f, tail: false }
    };
    ($name:literal, $f:ident, tail) => {
        Primitive { name: $name, run: $f, tail: true }
    };
}

pub static PRIMITIVES: &[Primitive] = &[
    prim!("type", f_type),
    prim!("eval", f_eval, tail),
    prim!("quote", f_quote),
    prim!("pair", f_pair),
    prim!("first", f_first),
    prim!("next", f_next),
    prim!("+", f_add),
    prim!("-", f_sub),
    prim!("*", f_mul),
    prim!("/", f_div),
    prim!("int", f_int),
    prim!("<", f_lt),
    prim!("eq?", f_eq),
    prim!("not", f_not),
    prim!("or", f_or),
    prim!("and", f_and),
    prim!("list", f_list),
    prim!("begin", f_begin, tail),
    prim!("while", f_while),
    prim!("cond", f_cond, tail),
    prim!("if", f_if, tail),
    prim!("lambda", f_lambda),
    prim!("macro", f_macro),
    prim!("define", f_define),
    prim!("assoc", f_assoc),
    prim!("env", f_env),
    prim!("let", f_let, tail),
    prim!("let*", f_leta, tail),
    prim!("letrec", f_letrec, tail),
    prim!("letrec*", f_letreca, tail),
    prim!("setq", f_setq),
    prim!("set-first!", f_setfirst),
    prim!("set-next!", f_setnext),
    prim!("read", f_read),
    prim!("print", f_print),
    prim!("println", f_println),
    prim!("write", f_write),
    prim!("string", f_string),
    prim!("gosub", f_gosub, tail),
    prim!("trace", f_trace),
    prim!("catch", f_catch),
    prim!("throw", f_throw),
    prim!("quit", f_quit),
    prim!("yield", f_yield),
    prim!("output", f_output),
    prim!("input", f_input),
    prim!("register-interface", f_register_interface),
    prim!("evoke", f_evoke),
];

fn f_type(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let x = it.heap.first(s)?;
    Ok(Value::num(match x.tag() {
        Tag::Nil => -1.0,
        Tag::Primitive => 1.0,
        Tag::Atom => 2.0,
        Tag::String => 3.0,
        Tag::Pair => 4.0,
        Tag::Closure => 6.0,
        Tag::Macro => 7.0,
        _ => 0.0,
    }))
}

fn f_eval(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    it.heap.first(s)
}

fn f_quote(it: &mut Interp, _house: &mut House, t: Root, _e: Root) -> Result<Value, Fault> {
    it.heap.first(it.heap.root(t))
}

fn f_pair(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let x = it.heap.first(s)?;
    let y = it.heap.first(it.heap.next(s)?)?;
    it.heap.cons(x, y)
}

fn f_first(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    it.heap.first(it.heap.first(s)?)
}

fn f_next(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    it.heap.next(it.heap.first(s)?)
}

fn f_add(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    let mut n = it.heap.first(s)?.as_f64();
    loop {
        s = it.heap.next(s)?;
        if s.is_nil() {
            break;
        }
        n += it.heap.first(s)?.as_f64();
    }
    Ok(Value::num(n))
}

fn f_sub(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    let head = it.heap.first(s)?.as_f64();
    let mut n = if it.heap.next(s)?.is_nil() { -head } else { head };
    loop {
        s = it.heap.next(s)?;
        if s.is_nil() {
            break;
        }
        n -= it.heap.first(s)?.as_f64();
    }
    Ok(Value::num(n))
}

fn f_mul(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    let mut n = it.heap.first(s)?.as_f64();
    loop {
        s = it.heap.next(s)?;
        if s.is_nil() {
            break;
        }
        n *= it.heap.first(s)?.as_f64();
    }
    Ok(Value::num(n))
}

fn f_div(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    let head = it.heap.first(s)?.as_f64();
    let mut n = if it.heap.next(s)?.is_nil() { 1.0 / head } else { head };
    loop {
        s = it.heap.next(s)?;
        if s.is_nil() {
            break;
        }
        n /= it.heap.first(s)?.as_f64();
    }
    Ok(Value::num(n))
}

fn f_int(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let v = it.heap.first(s)?;
    let n = v.as_f64();
    if n < 1e16 && n > -1e16 {
        Ok(Value::num((n as i64) as f64))
    } else {
        Ok(v)
    }
}

fn f_lt(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let x = it.heap.first(s)?;
    let y = it.heap.first(it.heap.next(s)?)?;
    let lt = if x.tag() == y.tag() && x.is_bytes() {
        it.heap.bytes(x) < it.heap.bytes(y)
    } else if x.as_f64() == x.as_f64() && y.as_f64() == y.as_f64() {
        x.as_f64() < y.as_f64()
    } else {
        x.tag_bits() < y.tag_bits()
    };
    Ok(it.boolean(lt))
}

fn f_eq(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let x = it.heap.first(s)?;
    let y = it.heap.first(it.heap.next(s)?)?;
    let eq = if x.tag() == Tag::String && y.tag() == Tag::String {
        it.heap.bytes(x) == it.heap.bytes(y)
    } else {
        x == y
    };
    Ok(it.boolean(eq))
}

fn f_not(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let x = it.heap.first(s)?;
    Ok(it.boolean(x.is_nil()))
}

fn f_or(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut x = Value::NIL;
    while !it.heap.root(t).is_nil() {
        let a = it.heap.first(it.heap.root(t))?;
        x = it.eval(house, a, e)?;
        if !x.is_nil() {
            break;
        }
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    Ok(x)
}

fn f_and(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut x = it.tru_value();
    while !it.heap.root(t).is_nil() {
        let a = it.heap.first(it.heap.root(t))?;
        x = it.eval(house, a, e)?;
        if x.is_nil() {
            break;
        }
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    Ok(x)
}

fn f_list(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    it.evlis(house, t, e)
}

fn f_begin(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    while it.more(it.heap.root(t))? {
        let a = it.heap.first(it.heap.root(t))?;
        it.eval(house, a, e)?;
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    let tv = it.heap.root(t);
    if tv.is_nil() {
        Ok(Value::NIL)
    } else {
        it.heap.first(tv)
    }
}

fn f_while(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let m = it.heap.mark();
    let s = it.heap.push_root(Value::NIL);
    let xr = it.heap.push_root(Value::NIL);
    loop {
        let cond = it.heap.first(it.heap.root(t))?;
        if it.eval(house, cond, e)?.is_nil() {
            break;
        }
        let body = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(s, body);
        while !it.heap.root(s).is_nil() {
            let a = it.heap.first(it.heap.root(s))?;
            let y = it.eval(house, a, e)?;
            it.heap.set_root(xr, y);
            let n = it.heap.next(it.heap.root(s))?;
            it.heap.set_root(s, n);
        }
    }
    let r = it.heap.root(xr);
    it.heap.release(m);
    Ok(r)
}

fn f_cond(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    loop {
        let tv = it.heap.root(t);
        if tv.is_nil() {
            break;
        }
        let clause = it.heap.first(tv)?;
        let test = it.heap.first(clause)?;
        if !it.eval(house, test, e)?.is_nil() {
            break;
        }
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    if !it.heap.root(t).is_nil() {
        let body = it.heap.next(it.heap.first(it.heap.root(t))?)?;
        it.heap.set_root(t, body);
    }
    f_begin(it, house, t, e)
}

fn f_if(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let cond = it.heap.first(it.heap.root(t))?;
    if it.eval(house, cond, e)?.is_nil() {
        let rest = it.heap.next(it.heap.next(it.heap.root(t))?)?;
        it.heap.set_root(t, rest);
        f_begin(it, house, t, e)
    } else {
        it.heap.first(it.heap.next(it.heap.root(t))?)
    }
}

fn f_lambda(it: &mut Interp, _house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let tv = it.heap.root(t);
    let params = it.heap.first(tv)?;
    let body = it.heap.first(it.heap.next(tv)?)?;
    it.make_closure(params, body, e)
}

fn f_macro(it: &mut Interp, _house: &mut House, t: Root, _e: Root) -> Result<Value, Fault> {
    let tv = it.heap.root(t);
    let params = it.heap.first(tv)?;
    let body = it.heap.first(it.heap.next(tv)?)?;
    let cell = it.heap.cons(params, body)?;
    Ok(Value::boxed(Tag::Macro, cell.ord()))
}

fn f_define(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let expr = it.heap.first(it.heap.next(it.heap.root(t))?)?;
    let x = it.eval(house, expr, e)?;
    let v = it.heap.first(it.heap.root(t))?;
    it.install(v, x, e)?;
    it.heap.first(it.heap.root(t))
}

fn f_assoc(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let v = it.heap.first(s)?;
    let env = it.heap.first(it.heap.next(s)?)?;
    it.assoc(v, env)
}

fn f_env(it: &mut Interp, _house: &mut House, _t: Root, e: Root) -> Result<Value, Fault> {
    Ok(it.heap.root(e))
}

fn f_let(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let m = it.heap.mark();
    let d = it.heap.push_root(it.heap.root(e));
    while it.more(it.heap.root(t))? {
        let entry = it.heap.first(it.heap.root(t))?;
        let inits = it.heap.next(entry)?;
        let last = it.begin_prefix(house, inits, e)?;
        // Initialisers see the environment as it was at entry.
        let x = it.eval(house, last, d)?;
        let name = it.heap.first(it.heap.first(it.heap.root(t))?)?;
        let ne = it.env_pair(name, x, e)?;
        it.heap.set_root(e, ne);
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    let body = it.heap.first(it.heap.root(t))?;
    it.heap.release(m);
    Ok(body)
}

fn f_leta(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    while it.more(it.heap.root(t))? {
        let entry = it.heap.first(it.heap.root(t))?;
        let inits = it.heap.next(entry)?;
        let last = it.begin_prefix(house, inits, e)?;
        // Sequential: each initialiser sees the bindings before it.
        let x = it.eval(house, last, e)?;
        let name = it.heap.first(it.heap.first(it.heap.root(t))?)?;
        let ne = it.env_pair(name, x, e)?;
        it.heap.set_root(e, ne);
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    it.heap.first(it.heap.root(t))
}

fn f_letrec(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let m = it.heap.mark();
    let s = it.heap.push_root(it.heap.root(t));
    // Bind every name to nil first so the initialisers can refer to each
    // other, then patch each binding pair in place.
    while it.more(it.heap.root(s))? {
        let name = it.heap.first(it.heap.first(it.heap.root(s))?)?;
        let ne = it.env_pair(name, Value::NIL, e)?;
        it.heap.set_root(e, ne);
        let n = it.heap.next(it.heap.root(s))?;
        it.heap.set_root(s, n);
    }
    while it.more(it.heap.root(t))? {
        let entry = it.heap.first(it.heap.root(t))?;
        let inits = it.heap.next(entry)?;
        let last = it.begin_prefix(house, inits, e)?;
        let x = it.eval(house, last, e)?;
        // Re-read the name through the rooted entry: the evaluation above may
        // have moved the heap under any value held across it.
        let name = it.heap.first(it.heap.first(it.heap.root(t))?)?;
        let mut scan = it.heap.root(e);
        loop {
            let binding = it.heap.first(scan)?;
            if it.heap.first(binding)? == name {
                it.heap.set_next(binding, x)?;
                break;
            }
            scan = it.heap.next(scan)?;
        }
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    let tv = it.heap.root(t);
    let r = if tv.is_nil() { Value::NIL } else { it.heap.first(tv)? };
    it.heap.release(m);
    Ok(r)
}

fn f_letreca(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    while it.more(it.heap.root(t))? {
        let entry = it.heap.first(it.heap.root(t))?;
        let name = it.heap.first(entry)?;
        let ne = it.env_pair(name, Value::NIL, e)?;
        it.heap.set_root(e, ne);
        // Re-read the entry through the rooted list: env_pair may have moved
        // the heap.
        let entry = it.heap.first(it.heap.root(t))?;
        let inits = it.heap.next(entry)?;
        let last = it.begin_prefix(house, inits, e)?;
        let x = it.eval(house, last, e)?;
        let binding = it.heap.first(it.heap.root(e))?;
        it.heap.set_next(binding, x)?;
        let n = it.heap.next(it.heap.root(t))?;
        it.heap.set_root(t, n);
    }
    let tv = it.heap.root(t);
    if tv.is_nil() {
        Ok(Value::NIL)
    } else {
        it.heap.first(tv)
    }
}

fn f_setq(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let expr = it.heap.first(it.heap.next(it.heap.root(t))?)?;
    let x = it.eval(house, expr, e)?;
    let v = it.heap.first(it.heap.root(t))?;
    let mut d = it.heap.root(e);
    while d.tag() == Tag::Pair && it.heap.first(it.heap.first(d)?)? != v {
        d = it.heap.next(d)?;
    }
    if d.tag() == Tag::Pair {
        it.heap.set_next(it.heap.first(d)?, x)
    } else if v.tag() == Tag::Atom {
        Err(Fault::UnboundSymbol(
            String::from_utf8_lossy(it.heap.bytes(v)).into_owned(),
        ))
    } else {
        Err(Fault::UnboundSymbol(String::new()))
    }
}

fn f_setfirst(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let p = it.heap.first(s)?;
    let x = it.heap.first(it.heap.next(s)?)?;
    it.heap.set_first(p, x)
}

fn f_setnext(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let p = it.heap.first(s)?;
    let x = it.heap.first(it.heap.next(s)?)?;
    it.heap.set_next(p, x)
}

fn f_read(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let path_bytes = it.list_bytes(s)?;
    let path = String::from_utf8_lossy(&path_bytes).into_owned();
    match house.sandbox().read_all(&path) {
        Ok(data) => it.heap.string(&data),
        Err(err) => Err(Fault::Arguments(format!("cannot open {}: {}", path, err))),
    }
}

fn f_print(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    while !s.is_nil() {
        let x = it.heap.first(s)?;
        let text = print_value(&it.heap, x);
        it.emit(&text);
        s = it.heap.next(s)?;
    }
    Ok(Value::NIL)
}

fn f_println(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    f_print(it, house, t, e)?;
    it.emit("\n");
    Ok(Value::NIL)
}

fn f_write(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let mut s = it.evlis(house, t, e)?;
    while !s.is_nil() {
        let x = it.heap.first(s)?;
        let text = write_value(&it.heap, x);
        it.emit(&text);
        s = it.heap.next(s)?;
    }
    Ok(Value::NIL)
}

fn f_string(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let buf = it.list_bytes(s)?;
    it.heap.string(&buf)
}

fn f_gosub(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    if it.sources.depth() >= MAX_GOSUB_RECURSE {
        // Documented no-op past the recursion cap.
        return Ok(Value::NIL);
    }
    let s = it.evlis(house, t, e)?;
    let src = it.list_bytes(s)?;
    let text = format!("(eval\n{}\n)", String::from_utf8_lossy(&src));
    let before = it.sources.depth();
    if !it.sources.push(text) {
        return Ok(Value::NIL);
    }
    let outcome = match read_form(&mut it.heap, &mut it.sources) {
        Ok(Some(form)) => it.eval(house, form, e).map(|_| ()),
        Ok(None) => Ok(()),
        Err(err) => Err(err),
    };
    while it.sources.depth() > before {
        it.sources.pop();
    }
    outcome?;
    Ok(Value::NIL)
}

fn f_trace(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let saved = it.trace;
    let tv = it.heap.root(t);
    it.trace = if tv.is_nil() { 1 } else { it.heap.first(tv)?.as_f64() as u64 };
    if it.more(it.heap.root(t))? {
        let expr = it.heap.first(it.heap.next(it.heap.root(t))?)?;
        let r = it.eval(house, expr, e);
        it.trace = saved;
        return r;
    }
    Ok(Value::num(it.trace as f64))
}

fn f_catch(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let snapshot = it.heap.mark();
    let body = it.heap.first(it.heap.root(t))?;
    match it.eval(house, body, e) {
        Ok(v) => Ok(v),
        Err(fault) => {
            // Unwind every root the failed evaluation left registered, then
            // surface the code as (ERR . code).
            it.heap.release(snapshot);
            let a = it.heap.intern(b"ERR")?;
            it.heap.cons(a, Value::num(fault.code() as f64))
        }
    }
}

fn f_throw(it: &mut Interp, _house: &mut House, t: Root, _e: Root) -> Result<Value, Fault> {
    let n = it.heap.first(it.heap.root(t))?;
    Err(Fault::Raised(n.as_f64() as i32))
}

fn f_quit(_it: &mut Interp, _house: &mut House, _t: Root, _e: Root) -> Result<Value, Fault> {
    std::process::exit(0);
}

fn f_yield(it: &mut Interp, _house: &mut House, _t: Root, _e: Root) -> Result<Value, Fault> {
    it.yielded = true;
    Ok(Value::NIL)
}

fn f_output(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let name_expr = it.heap.first(it.heap.root(t))?;
    let name_val = it.eval(house, name_expr, e)?;
    let mut name_bytes = Vec::new();
    it.value_bytes_into(name_val, &mut name_bytes)?;
    let port = clip(&String::from_utf8_lossy(&name_bytes), INTERFACE_NAME_LEN);
    if !it.interfaces.iter().any(|i| i.name == port) {
        return Ok(Value::num(0.0));
    }
    let payload_expr = it.heap.first(it.heap.next(it.heap.root(t))?)?;
    let val = it.eval(house, payload_expr, e)?;
    let (kind, data) = match val.tag() {
        Tag::String => (PayloadKind::Text, it.heap.bytes(val).to_vec()),
        Tag::Pair => {
            let mut bytes = Vec::new();
            let mut p = val;
            while p.tag() == Tag::Pair {
                bytes.push(it.heap.first(p)?.as_f64() as u8);
                p = it.heap.next(p)?;
            }
            (PayloadKind::Bytes, bytes)
        }
        _ => {
            let mut bytes = Vec::new();
            it.value_bytes_into(val, &mut bytes)?;
            (PayloadKind::Literal, bytes)
        }
    };
    let written = data.len();
    it.pending = Some(PendingOutput { port, kind, data });
    Ok(Value::num(written as f64))
}

fn f_input(it: &mut Interp, _house: &mut House, _t: Root, _e: Root) -> Result<Value, Fault> {
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|err| Fault::Arguments(format!("stdin: {}", err)))?;
    let mut bytes = line.into_bytes();
    if bytes.last() == Some(&b'\n') {
        bytes.pop();
    }
    bytes.truncate(INPUT_BUFFER_SIZE);
    it.heap.string(&bytes)
}

fn f_register_interface(
    it: &mut Interp,
    house: &mut House,
    t: Root,
    e: Root,
) -> Result<Value, Fault> {
    let s = it.evlis(house, t, e)?;
    let m = it.heap.mark();
    let sr = it.heap.push_root(s);
    let closure = it.nth(it.heap.root(sr), 3)?;
    if closure.tag() != Tag::Closure {
        it.heap.release(m);
        return Ok(Value::NIL);
    }
    let field = |it: &Interp, idx: usize, max: usize| -> Result<String, Fault> {
        let v = it.nth(it.heap.root(sr), idx)?;
        let mut bytes = Vec::new();
        it.value_bytes_into(v, &mut bytes)?;
        Ok(clip(&String::from_utf8_lossy(&bytes), max))
    };
    let name = field(it, 0, INTERFACE_NAME_LEN)?;
    let kind = field(it, 1, TYPE_LEN)?;
    let format = field(it, 2, FORMAT_LEN)?;
    let direction = Direction::from_flag(it.nth(it.heap.root(sr), 4)?.as_f64() as u8);
    let triggering = it.nth(it.heap.root(sr), 5)?.as_f64() as u8 != 0;
    it.declare_interface(Interface {
        name: name.clone(),
        kind,
        format,
        direction,
        triggering,
    });
    // Bind the handler under the port name through the ordinary define path
    // so `(<name> payload)` invocations find it.
    let cr = it.heap.push_root(closure);
    let atom = it.heap.intern(name.as_bytes())?;
    let ar = it.heap.push_root(atom);
    it.install(it.heap.root(ar), it.heap.root(cr), e)?;
    let r = it.heap.root(ar);
    it.heap.release(m);
    Ok(r)
}

fn f_evoke(it: &mut Interp, house: &mut House, t: Root, e: Root) -> Result<Value, Fault> {
    let fexpr = it.heap.first(it.heap.root(t))?;
    let fval = it.eval(house, fexpr, e)?;
    let mut fb = Vec::new();
    it.value_bytes_into(fval, &mut fb)?;
    let lexpr = it.heap.first(it.heap.next(it.heap.root(t))?)?;
    let lval = it.eval(house, lexpr, e)?;
    let mut lb = Vec::new();
    it.value_bytes_into(lval, &mut lb)?;
    let filename = clip(&String::from_utf8_lossy(&fb), DAEMON_NAME_LEN);
    let language = clip(&String::from_utf8_lossy(&lb), LANG_LEN);
    match house.start_daemon(&filename, &language) {
        Ok(id) => Ok(Value::num(id.get() as f64)),
        Err(err) => {
            tracing::warn!(%err, script = %filename, "evoke failed");
            Ok(Value::NIL)
        }
    }
}
