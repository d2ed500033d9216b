use dollhouse::daemon::House;
use dollhouse::interp::{Interp, HEAP_CELLS};
use dollhouse::printer::print_value;
use dollhouse::sandbox::Sandbox;

fn fixture() -> (House, Interp) {
    let dir = std::env::temp_dir().join(format!("dollhouse-interp-{}", std::process::id()));
    let _ = std::fs::create_dir_all(&dir);
    let house = House::new(Sandbox::new(dir));
    let interp = Interp::new(HEAP_CELLS).expect("interpreter boots");
    (house, interp)
}

fn eval(house: &mut House, it: &mut Interp, src: &str) -> String {
    let value = it
        .eval_source(house, src)
        .unwrap_or_else(|fault| panic!("failed to eval `{}`: {}", src, fault));
    print_value(&it.heap, value)
}

#[test]
fn arithmetic() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(+ 1 2 3)"), "6");
    assert_eq!(eval(&mut house, &mut it, "(/ 2)"), "0.5");
    assert_eq!(eval(&mut house, &mut it, "(- 5)"), "-5");
    assert_eq!(eval(&mut house, &mut it, "(* 2 3 4)"), "24");
    assert_eq!(eval(&mut house, &mut it, "(- 10 1 2)"), "7");
    assert_eq!(eval(&mut house, &mut it, "(int 3.7)"), "3");
    assert_eq!(eval(&mut house, &mut it, "(int -3.7)"), "-3");
}

#[test]
fn closures_capture_their_environment() {
    let (mut house, mut it) = fixture();
    eval(
        &mut house,
        &mut it,
        "(define mk (lambda (n) (lambda () (setq n (+ n 1)) n)))",
    );
    eval(&mut house, &mut it, "(define c (mk 10))");
    assert_eq!(eval(&mut house, &mut it, "(c)"), "11");
    assert_eq!(eval(&mut house, &mut it, "(c)"), "12");
    assert_eq!(eval(&mut house, &mut it, "(c)"), "13");
    // A second counter is independent.
    eval(&mut house, &mut it, "(define c2 (mk 100))");
    assert_eq!(eval(&mut house, &mut it, "(c2)"), "101");
    assert_eq!(eval(&mut house, &mut it, "(c)"), "14");
}

#[test]
fn macros_receive_unevaluated_operands() {
    let (mut house, mut it) = fixture();
    eval(
        &mut house,
        &mut it,
        "(define swap (macro (a b) (list 'let (list 'tmp a) \
         (list 'begin (list 'setq a b) (list 'setq b 'tmp)))))",
    );
    eval(&mut house, &mut it, "(define x 1)");
    eval(&mut house, &mut it, "(define y 2)");
    eval(&mut house, &mut it, "(swap x y)");
    assert_eq!(eval(&mut house, &mut it, "(list x y)"), "(2 1)");
}

#[test]
fn quasiquote_builds_evaluable_forms() {
    let (mut house, mut it) = fixture();
    eval(&mut house, &mut it, "(define b 5)");
    assert_eq!(eval(&mut house, &mut it, "(eval `(+ ,b 1))"), "6");
    assert_eq!(eval(&mut house, &mut it, "`x"), "x");
}

#[test]
fn catch_recovers_and_reports_codes() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(catch (first 3))"), "(ERR . 1)");
    assert_eq!(eval(&mut house, &mut it, "(+ 1 1)"), "2");
    assert_eq!(eval(&mut house, &mut it, "(catch (undefined-sym))"), "(ERR . 3)");
    assert_eq!(eval(&mut house, &mut it, "(catch (throw 42))"), "(ERR . 42)");
    assert_eq!(eval(&mut house, &mut it, "(catch ((quote x) 1))"), "(ERR . 4)");
}

#[test]
fn catch_restores_the_root_count() {
    let (mut house, mut it) = fixture();
    let before = it.heap.root_count();
    eval(&mut house, &mut it, "(catch (first (first (first 3))))");
    assert_eq!(it.heap.root_count(), before);
    // Success leaves the count alone too.
    eval(&mut house, &mut it, "(catch (+ 1 2))");
    assert_eq!(it.heap.root_count(), before);
}

#[test]
fn setq_on_unbound_symbol_is_code_3() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(catch (setq ghost 1))"), "(ERR . 3)");
}

#[test]
fn let_binds_in_parallel_and_shadows() {
    let (mut house, mut it) = fixture();
    eval(&mut house, &mut it, "(define v 'b)");
    // Inside the binding scope the lookup sees the shadowing value...
    assert_eq!(
        eval(&mut house, &mut it, "(let (v 'a) (assoc 'v (env)))"),
        "a"
    );
    // ...and outside it the original binding is untouched.
    assert_eq!(eval(&mut house, &mut it, "(assoc 'v (env))"), "b");

    // Initialisers are evaluated in the environment at entry.
    eval(&mut house, &mut it, "(define a 10)");
    assert_eq!(eval(&mut house, &mut it, "(let (a 1) (b a) b)"), "10");
}

#[test]
fn let_star_binds_sequentially() {
    let (mut house, mut it) = fixture();
    assert_eq!(
        eval(&mut house, &mut it, "(let* (a 1) (b (+ a 1)) (+ a b))"),
        "3"
    );
}

#[test]
fn letrec_supports_mutual_recursion() {
    let (mut house, mut it) = fixture();
    let src = "(letrec \
                 (ev? (lambda (n) (if (eq? n 0) #t (od? (- n 1))))) \
                 (od? (lambda (n) (if (eq? n 0) () (ev? (- n 1))))) \
                 (ev? 10))";
    assert_eq!(eval(&mut house, &mut it, src), "#t");
    let src = "(letrec* \
                 (down (lambda (n) (if (eq? n 0) 'done (down (- n 1))))) \
                 (down 5))";
    assert_eq!(eval(&mut house, &mut it, src), "done");
}

#[test]
fn tail_recursion_runs_in_bounded_roots() {
    let (mut house, mut it) = fixture();
    eval(
        &mut house,
        &mut it,
        "(define count (lambda (n) (if (eq? n 0) 'done (count (- n 1)))))",
    );
    assert_eq!(eval(&mut house, &mut it, "(count 100000)"), "done");
    // Only the two permanent roots survive between top-level forms.
    assert_eq!(it.heap.root_count(), 2);
}

#[test]
fn variadic_parameters() {
    let (mut house, mut it) = fixture();
    eval(&mut house, &mut it, "(define all (lambda args args))");
    assert_eq!(eval(&mut house, &mut it, "(all 1 2 3)"), "(1 2 3)");
    eval(&mut house, &mut it, "(define tail (lambda (a . rest) rest))");
    assert_eq!(eval(&mut house, &mut it, "(tail 1 2 3)"), "(2 3)");
    assert_eq!(
        eval(&mut house, &mut it, "(catch ((lambda (a b) a) 1))"),
        "(ERR . 5)"
    );
}

#[test]
fn ordering_is_total_across_kinds() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(< 1 2)"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(< 2 1)"), "()");
    assert_eq!(eval(&mut house, &mut it, "(< 'abc 'abd)"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(< \"a\" \"b\")"), "#t");
    // Non-numbers order by tag when kinds differ.
    assert_eq!(eval(&mut house, &mut it, "(< 'sym \"str\")"), "#t");
}

#[test]
fn equality_rules() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(eq? 'foo 'foo)"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(eq? 'foo 'bar)"), "()");
    assert_eq!(eval(&mut house, &mut it, "(eq? \"ab\" \"ab\")"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(eq? 1 1)"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(eq? (pair 1 2) (pair 1 2))"), "()");
    assert_eq!(eval(&mut house, &mut it, "(not ())"), "#t");
    assert_eq!(eval(&mut house, &mut it, "(not 1)"), "()");
}

#[test]
fn conditionals_and_loops() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(if () 1 2)"), "2");
    assert_eq!(eval(&mut house, &mut it, "(if 9 1 2)"), "1");
    assert_eq!(eval(&mut house, &mut it, "(cond (() 1) (#t 2))"), "2");
    assert_eq!(eval(&mut house, &mut it, "(and 1 2 3)"), "3");
    assert_eq!(eval(&mut house, &mut it, "(and 1 () 3)"), "()");
    assert_eq!(eval(&mut house, &mut it, "(or () 2 3)"), "2");
    eval(&mut house, &mut it, "(define i 0)");
    eval(&mut house, &mut it, "(define acc 0)");
    eval(
        &mut house,
        &mut it,
        "(while (< i 3) (setq acc (+ acc i)) (setq i (+ i 1)))",
    );
    assert_eq!(eval(&mut house, &mut it, "acc"), "3");
}

#[test]
fn pairs_and_mutation() {
    let (mut house, mut it) = fixture();
    eval(&mut house, &mut it, "(define p (pair 1 2))");
    assert_eq!(eval(&mut house, &mut it, "(first p)"), "1");
    assert_eq!(eval(&mut house, &mut it, "(next p)"), "2");
    eval(&mut house, &mut it, "(set-first! p 9)");
    eval(&mut house, &mut it, "(set-next! p 8)");
    assert_eq!(eval(&mut house, &mut it, "p"), "(9 . 8)");
    assert_eq!(eval(&mut house, &mut it, "(catch (set-first! 7 1))"), "(ERR . 1)");
}

#[test]
fn string_builds_from_mixed_parts() {
    let (mut house, mut it) = fixture();
    assert_eq!(
        eval(&mut house, &mut it, "(string \"a\" 'b 1)"),
        "\"ab1\""
    );
    // A list contributes one byte per numeric element.
    assert_eq!(eval(&mut house, &mut it, "(string (list 104 105))"), "\"hi\"");
}

#[test]
fn type_reports_the_kind_ordinal() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(type ())"), "-1");
    assert_eq!(eval(&mut house, &mut it, "(type 1.5)"), "0");
    assert_eq!(eval(&mut house, &mut it, "(type first)"), "1");
    assert_eq!(eval(&mut house, &mut it, "(type 'x)"), "2");
    assert_eq!(eval(&mut house, &mut it, "(type \"s\")"), "3");
    assert_eq!(eval(&mut house, &mut it, "(type (pair 1 2))"), "4");
    assert_eq!(eval(&mut house, &mut it, "(type (lambda (x) x))"), "6");
    assert_eq!(eval(&mut house, &mut it, "(type (macro (x) x))"), "7");
}

#[test]
fn define_returns_the_name_and_overwrites() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(define q 1)"), "q");
    assert_eq!(eval(&mut house, &mut it, "q"), "1");
    eval(&mut house, &mut it, "(define q 2)");
    assert_eq!(eval(&mut house, &mut it, "q"), "2");
}

#[test]
fn gosub_evaluates_synthesised_source() {
    let (mut house, mut it) = fixture();
    eval(&mut house, &mut it, "(define gx 0)");
    eval(&mut house, &mut it, "(gosub \"(define gx 7)\")");
    assert_eq!(eval(&mut house, &mut it, "gx"), "7");
    // Pieces are stringified and concatenated before parsing.
    eval(&mut house, &mut it, "(gosub \"(define gx \" 41 \")\")");
    assert_eq!(eval(&mut house, &mut it, "gx"), "41");
}

#[test]
fn gosub_recursion_is_capped_silently() {
    let (mut house, mut it) = fixture();
    eval(
        &mut house,
        &mut it,
        "(define rec (lambda (n) (if (eq? n 0) () \
         (gosub (string \"(rec \" (- n 1) \")\")))))",
    );
    // Far deeper than the cursor-stack bound; the overflow levels are
    // silent no-ops rather than failures.
    assert_eq!(eval(&mut house, &mut it, "(rec 40)"), "()");
}

#[test]
fn print_and_write_render_differently() {
    let (mut house, mut it) = fixture();
    it.capture_output();
    eval(&mut house, &mut it, "(print \"hi\" 42)");
    assert_eq!(it.take_output(), "\"hi\"42");
    eval(&mut house, &mut it, "(write \"hi\")");
    assert_eq!(it.take_output(), "hi");
    eval(&mut house, &mut it, "(println 'done)");
    assert_eq!(it.take_output(), "done\n");
}

#[test]
fn output_without_declared_interface_writes_nothing() {
    let (mut house, mut it) = fixture();
    assert_eq!(eval(&mut house, &mut it, "(output 'nope 42)"), "0");
    assert!(it.pending.is_none());
}
