use crate::heap::Heap;
use crate::interp::PRIMITIVES;
use crate::value::{Tag, Value};

/// Printed form of a number. Rust's shortest-round-trip formatting keeps
/// `read` of the output equal to the input under float equality, and emits
/// `inf`/`NaN` tokens the reader recognises.
pub fn num_to_string(n: f64) -> String {
    format!("{}", n)
}

fn quote_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            _ => out.push(b as char),
        }
    }
    out.push('"');
    out
}

fn print_list(heap: &Heap, p: Value, out: &mut String) {
    out.push('(');
    let mut t = p;
    loop {
        print_into(heap, heap.cell(t.ord() as usize + 1), out);
        let rest = heap.cell(t.ord() as usize);
        if rest.is_nil() {
            break;
        }
        if rest.tag() != Tag::Pair {
            out.push_str(" . ");
            print_into(heap, rest, out);
            break;
        }
        out.push(' ');
        t = rest;
    }
    out.push(')');
}

fn print_into(heap: &Heap, v: Value, out: &mut String) {
    match v.tag() {
        Tag::Nil => out.push_str("()"),
        Tag::Primitive => {
            let idx = v.ord() as usize;
            let name = PRIMITIVES.get(idx).map(|p| p.name).unwrap_or("?");
            out.push('<');
            out.push_str(name);
            out.push('>');
        }
        Tag::Atom => out.push_str(&String::from_utf8_lossy(heap.bytes(v))),
        Tag::String => out.push_str(&quote_string(heap.bytes(v))),
        Tag::Pair => print_list(heap, v, out),
        Tag::Closure => out.push_str(&format!("{{{}}}", v.ord())),
        Tag::Macro => out.push_str(&format!("[{}]", v.ord())),
        Tag::Forward => out.push_str("#forward"),
        Tag::Num => out.push_str(&num_to_string(v.as_f64())),
    }
}

/// The quoted printed form: strings appear in double quotes with `"` and `\`
/// escaped, which is what `print` and the REPL show.
pub fn print_value(heap: &Heap, v: Value) -> String {
    let mut out = String::new();
    print_into(heap, v, &mut out);
    out
}

/// The raw form used by `write`: string contents pass through unquoted.
pub fn write_value(heap: &Heap, v: Value) -> String {
    if v.tag() == Tag::String {
        String::from_utf8_lossy(heap.bytes(v)).into_owned()
    } else {
        print_value(heap, v)
    }
}
