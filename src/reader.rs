use logos::Logos;

use crate::error::Fault;
use crate::heap::Heap;
use crate::value::{Tag, Value};

//===----------------------------------------------------------------------===//
// Tokens
//
// The tokenizer runs over a byte-buffer cursor rather than a whole file:
// daemons read one top-level form per scheduling tick, and `gosub` and
// router deliveries splice synthetic source on top of the program. Each
// token is lexed from the remaining slice and the cursor advances past it.
//===----------------------------------------------------------------------===//

/// Replaces the escape set `\a \b \t \n \v \f \r`; any other `\x` is `x`.
fn unescape(slice: &str) -> String {
    let inner = &slice[1..slice.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('a') => out.push('\u{7}'),
            Some('b') => out.push('\u{8}'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('v') => out.push('\u{b}'),
            Some('f') => out.push('\u{c}'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[derive(Logos, Debug, PartialEq, Clone)]
pub enum Token {
    // Anything at or below space counts as whitespace, as do ;-comments.
    #[regex(r"[\x00-\x20]+", logos::skip)]
    #[regex(r";[^\n]*", logos::skip)]
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("'")]
    Quote,
    #[token("`")]
    Backtick,
    #[token(",")]
    Comma,

    // A string literal closed on the same line.
    #[regex(r#""([^"\\\n]|\\[^\n])*""#, |lex| unescape(lex.slice()))]
    Str(String),

    // A string that ran into end-of-line or end-of-input.
    #[regex(r#""([^"\\\n]|\\[^\n])*"#, priority = 0)]
    Unterminated,

    // A symbol-or-number token, delimited by whitespace and punctuation.
    #[regex(r#"[^\x00-\x20();'`,"]+"#, |lex| lex.slice().to_owned())]
    Word(String),
}

struct TokenStream<'s> {
    text: &'s str,
    pos: usize,
}

impl<'s> TokenStream<'s> {
    fn new(text: &'s str, pos: usize) -> Self {
        TokenStream { text, pos }
    }

    fn next(&mut self) -> Result<Option<Token>, Fault> {
        let mut lex = Token::lexer(&self.text[self.pos..]);
        match lex.next() {
            None => {
                self.pos = self.text.len();
                Ok(None)
            }
            Some(Ok(Token::Unterminated)) => {
                self.pos += lex.span().end;
                Err(Fault::Syntax("missing \"".into()))
            }
            Some(Ok(tok)) => {
                self.pos += lex.span().end;
                Ok(Some(tok))
            }
            Some(Err(())) => Err(Fault::Syntax("unreadable input".into())),
        }
    }
}

//===----------------------------------------------------------------------===//
// Program cursor stack
//===----------------------------------------------------------------------===//

/// Bound on nested source synthesis (`gosub`, router deliveries). Pushing
/// past it is a documented silent no-op, not a failure.
pub const MAX_GOSUB_RECURSE: usize = 10;

#[derive(Debug, Clone)]
struct Cursor {
    text: String,
    pos: usize,
}

/// A small stack of source buffers with read positions. The bottom cursor is
/// the daemon's main program; synthetic sources are pushed on top and popped
/// once exhausted.
#[derive(Debug, Default)]
pub struct ProgramStack {
    stack: Vec<Cursor>,
}

impl ProgramStack {
    pub fn new() -> Self {
        ProgramStack { stack: Vec::new() }
    }

    /// Replace the whole stack with a single main-program cursor.
    pub fn set_main(&mut self, text: String) {
        self.stack.clear();
        self.stack.push(Cursor { text, pos: 0 });
    }

    /// Push a synthetic source. Returns false (and does nothing) at the
    /// recursion cap.
    pub fn push(&mut self, text: String) -> bool {
        if self.stack.len() >= MAX_GOSUB_RECURSE {
            return false;
        }
        self.stack.push(Cursor { text, pos: 0 });
        true
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    fn top(&self) -> Option<&Cursor> {
        self.stack.last()
    }

    fn advance_top(&mut self, pos: usize) {
        if let Some(cur) = self.stack.last_mut() {
            cur.pos = pos;
        }
    }

    fn advance_top_to_end(&mut self) {
        if let Some(cur) = self.stack.last_mut() {
            cur.pos = cur.text.len();
        }
    }
}

//===----------------------------------------------------------------------===//
// Parser
//===----------------------------------------------------------------------===//

pub struct Reader<'h> {
    heap: &'h mut Heap,
}

impl<'h> Reader<'h> {
    pub fn new(heap: &'h mut Heap) -> Self {
        Reader { heap }
    }

    /// Read the next expression from the stream.
    fn expr(&mut self, ts: &mut TokenStream) -> Result<Value, Fault> {
        let tok = ts
            .next()?
            .ok_or_else(|| Fault::Syntax("unexpected end of input".into()))?;
        self.parse(tok, ts)
    }

    /// Wrap `x` as `(quote x)`.
    fn quoted(&mut self, x: Value) -> Result<Value, Fault> {
        let m = self.heap.mark();
        let s = self.heap.cons(x, Value::NIL)?;
        let sr = self.heap.push_root(s);
        let q = self.heap.intern(b"quote")?;
        let r = self.heap.cons(q, self.heap.root(sr));
        self.heap.release(m);
        r
    }

    fn parse(&mut self, tok: Token, ts: &mut TokenStream) -> Result<Value, Fault> {
        match tok {
            Token::LParen => self.list(ts),
            Token::Quote => {
                let x = self.expr(ts)?;
                self.quoted(x)
            }
            Token::Backtick => {
                let tok = ts
                    .next()?
                    .ok_or_else(|| Fault::Syntax("unexpected end of input".into()))?;
                self.tick(tok, ts)
            }
            Token::Str(s) => self.heap.string(s.as_bytes()),
            Token::RParen => Err(Fault::Syntax("unexpected )".into())),
            Token::Comma => self.heap.intern(b","),
            Token::Unterminated => Err(Fault::Syntax("missing \"".into())),
            Token::Word(w) => match w.parse::<f64>() {
                Ok(n) => Ok(Value::num(n)),
                Err(_) => self.heap.intern(w.as_bytes()),
            },
        }
    }

    fn list(&mut self, ts: &mut TokenStream) -> Result<Value, Fault> {
        let m = self.heap.mark();
        let t = self.heap.push_root(Value::NIL);
        let p = self.heap.push_root(Value::NIL);
        let result = loop {
            let tok = match ts.next()? {
                Some(tok) => tok,
                None => break Err(Fault::Syntax("expecting )".into())),
            };
            match tok {
                Token::RParen => break Ok(self.heap.root(t)),
                Token::Word(w) if w == "." => {
                    // Dotted tail: one expression, then the closing paren.
                    let x = match self.expr(ts) {
                        Ok(x) => x,
                        Err(e) => break Err(e),
                    };
                    match ts.next() {
                        Ok(Some(Token::RParen)) => {}
                        Ok(_) => break Err(Fault::Syntax("expecting )".into())),
                        Err(e) => break Err(e),
                    }
                    let pv = self.heap.root(p);
                    if pv.tag() == Tag::Pair {
                        if let Err(e) = self.heap.set_next(pv, x) {
                            break Err(e);
                        }
                    } else {
                        self.heap.set_root(t, x);
                    }
                    break Ok(self.heap.root(t));
                }
                other => {
                    let x = match self.parse(other, ts) {
                        Ok(x) => x,
                        Err(e) => break Err(e),
                    };
                    let cell = match self.heap.cons(x, Value::NIL) {
                        Ok(c) => c,
                        Err(e) => break Err(e),
                    };
                    let pv = self.heap.root(p);
                    if pv.tag() == Tag::Pair {
                        if let Err(e) = self.heap.set_next(pv, cell) {
                            break Err(e);
                        }
                    } else {
                        self.heap.set_root(t, cell);
                    }
                    self.heap.set_root(p, cell);
                }
            }
        };
        self.heap.release(m);
        result
    }

    /// Structural quasiquote: a non-list operand becomes `(quote x)`, a list
    /// becomes `(list ...)` with each element recursively converted and `,y`
    /// splicing in `y` unquoted.
    fn tick(&mut self, tok: Token, ts: &mut TokenStream) -> Result<Value, Fault> {
        match tok {
            Token::Comma => self.expr(ts),
            Token::LParen => {
                let m = self.heap.mark();
                let head = self
                    .heap
                    .intern(b"list")
                    .and_then(|q| self.heap.cons(q, Value::NIL))?;
                let t = self.heap.push_root(head);
                let p = self.heap.push_root(head);
                let result = loop {
                    let tok = match ts.next() {
                        Ok(Some(tok)) => tok,
                        Ok(None) => break Err(Fault::Syntax("expecting )".into())),
                        Err(e) => break Err(e),
                    };
                    match tok {
                        Token::RParen => break Ok(self.heap.root(t)),
                        Token::Word(w) if w == "." => {
                            let x = match self.expr(ts) {
                                Ok(x) => x,
                                Err(e) => break Err(e),
                            };
                            match ts.next() {
                                Ok(Some(Token::RParen)) => {}
                                Ok(_) => break Err(Fault::Syntax("expecting )".into())),
                                Err(e) => break Err(e),
                            }
                            if let Err(e) = self.heap.set_next(self.heap.root(p), x) {
                                break Err(e);
                            }
                            break Ok(self.heap.root(t));
                        }
                        other => {
                            let x = match self.tick(other, ts) {
                                Ok(x) => x,
                                Err(e) => break Err(e),
                            };
                            let cell = match self.heap.cons(x, Value::NIL) {
                                Ok(c) => c,
                                Err(e) => break Err(e),
                            };
                            if let Err(e) = self.heap.set_next(self.heap.root(p), cell) {
                                break Err(e);
                            }
                            self.heap.set_root(p, cell);
                        }
                    }
                };
                self.heap.release(m);
                result
            }
            other => {
                let x = self.parse(other, ts)?;
                self.quoted(x)
            }
        }
    }
}

/// Read one top-level form from the top cursor of `sources`. Exhausted
/// synthetic cursors are popped; an exhausted main cursor yields `None`.
/// On a syntax fault the rest of the top cursor is abandoned so the outer
/// loop does not re-read the offending text forever.
pub fn read_form(
    heap: &mut Heap,
    sources: &mut ProgramStack,
) -> Result<Option<Value>, Fault> {
    loop {
        let parsed = {
            let Some(cursor) = sources.top() else {
                return Ok(None);
            };
            let mut ts = TokenStream::new(&cursor.text, cursor.pos);
            match ts.next() {
                Err(e) => Err(e),
                Ok(None) => Ok(None),
                Ok(Some(tok)) => {
                    Reader::new(heap).parse(tok, &mut ts).map(|v| Some((v, ts.pos)))
                }
            }
        };
        match parsed {
            Ok(Some((v, pos))) => {
                sources.advance_top(pos);
                return Ok(Some(v));
            }
            Ok(None) => {
                if sources.depth() > 1 {
                    sources.pop();
                    continue;
                }
                return Ok(None);
            }
            Err(e) => {
                sources.advance_top_to_end();
                return Err(e);
            }
        }
    }
}
