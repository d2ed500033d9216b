use dollhouse::daemon::{Direction, House};
use dollhouse::sandbox::Sandbox;

fn scratch_house(tag: &str) -> House {
    let dir = std::env::temp_dir().join(format!(
        "dollhouse-router-{}-{}",
        tag,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    House::new(Sandbox::new(dir))
}

fn write_script(house: &House, name: &str, body: &str) {
    house.sandbox().write_all(name, body.as_bytes()).unwrap();
}

const PRODUCER: &str = "\
(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
(output 'tick 42)
";

const CONSUMER: &str = "\
(define last 0)
(register-interface 'tick 'num 'scalar (lambda (v) (define last v)) 1 1)
";

#[test]
fn matching_ports_become_one_interlink_and_deliver() {
    let mut house = scratch_house("deliver");
    write_script(&house, "a.lisp", PRODUCER);
    write_script(&house, "b.lisp", CONSUMER);
    let a = house.start_daemon("a.lisp", "lisp").unwrap();
    let b = house.start_daemon("b.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.interlinks().len(), 1);
    let link = &house.interlinks()[0];
    assert_eq!(link.producer, a);
    assert_eq!(link.consumer, b);
    assert_eq!(link.name, "tick");
    assert_eq!(house.eval_in(b, "last").unwrap(), "42");
    // The producer's slot was drained by the delivery.
    assert!(house.daemon(a).unwrap().interp.pending.is_none());
}

#[test]
fn handler_runs_once_per_populated_slot() {
    let mut house = scratch_house("once");
    write_script(&house, "a.lisp", PRODUCER);
    write_script(
        &house,
        "b.lisp",
        "(define count 0)
(register-interface 'tick 'num 'scalar (lambda (v) (define count (+ count 1))) 1 1)
",
    );
    house.start_daemon("a.lisp", "lisp").unwrap();
    let b = house.start_daemon("b.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.eval_in(b, "count").unwrap(), "1");
}

#[test]
fn one_output_fans_out_to_every_matching_interlink() {
    let mut house = scratch_house("fanout");
    write_script(&house, "a.lisp", PRODUCER);
    write_script(&house, "b.lisp", CONSUMER);
    // The producer's OUT port exists before either consumer declares its IN,
    // so each declaration pairs into its own interlink on the same port.
    let a = house.start_daemon("a.lisp", "lisp").unwrap();
    let b1 = house.start_daemon("b.lisp", "lisp").unwrap();
    let b2 = house.start_daemon("b.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.interlinks().len(), 2);
    let mut consumers: Vec<_> =
        house.interlinks().iter().map(|l| l.consumer).collect();
    consumers.sort_by_key(|id| id.get());
    assert_eq!(consumers, vec![b1, b2]);
    assert!(house.interlinks().iter().all(|l| l.producer == a));

    // The single populated slot delivered to both consumers, then cleared.
    assert_eq!(house.eval_in(b1, "last").unwrap(), "42");
    assert_eq!(house.eval_in(b2, "last").unwrap(), "42");
    assert!(house.daemon(a).unwrap().interp.pending.is_none());
}

#[test]
fn several_candidates_tiebreak_to_the_lowest_id() {
    let mut house = scratch_house("tiebreak");
    // Both consumers declare their IN port on the first cycle; the producer
    // only declares its OUT on the second, once two candidates exist.
    write_script(
        &house,
        "in.lisp",
        "(register-interface 'tick 'num 'scalar (lambda (v) (define last v)) 1 1)
(define last 0)
",
    );
    write_script(
        &house,
        "out.lisp",
        "(define warmup 0)
(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
(output 'tick 42)
",
    );
    let b1 = house.start_daemon("in.lisp", "lisp").unwrap();
    let b2 = house.start_daemon("in.lisp", "lisp").unwrap();
    let a = house.start_daemon("out.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.interlinks().len(), 1);
    let link = &house.interlinks()[0];
    assert_eq!(link.producer, a);
    assert_eq!(link.consumer, b1);
    assert_eq!(house.eval_in(b1, "last").unwrap(), "42");
    assert_eq!(house.eval_in(b2, "last").unwrap(), "0");
}

#[test]
fn yield_skips_delivery_for_one_cycle() {
    let mut house = scratch_house("yield");
    write_script(&house, "b.lisp", CONSUMER);
    write_script(
        &house,
        "a.lisp",
        "(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
(begin (output 'tick 7) (yield))
",
    );
    let b = house.start_daemon("b.lisp", "lisp").unwrap();
    let _a = house.start_daemon("a.lisp", "lisp").unwrap();

    // Cycle 1: b defines, a declares its port. Cycle 2: b declares and the
    // interlink forms; a outputs but yields, so nothing is delivered.
    house.cycle();
    house.cycle();
    assert_eq!(house.interlinks().len(), 1);
    assert_eq!(house.eval_in(b, "last").unwrap(), "0");

    // Next cycle the pending slot is still populated and goes out.
    house.cycle();
    assert_eq!(house.eval_in(b, "last").unwrap(), "7");
}

#[test]
fn non_triggering_ports_consume_on_their_own_tick() {
    let mut house = scratch_house("trigger");
    write_script(
        &house,
        "b.lisp",
        "(define last 0)
(register-interface 'tick 'num 'scalar (lambda (v) (define last v)) 1 0)
",
    );
    write_script(
        &house,
        "a.lisp",
        "(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
(output 'tick 9)
",
    );
    let b = house.start_daemon("b.lisp", "lisp").unwrap();
    let _a = house.start_daemon("a.lisp", "lisp").unwrap();

    house.cycle();
    house.cycle();
    // Delivered onto b's cursor stack but not yet evaluated.
    assert_eq!(house.eval_in(b, "last").unwrap(), "0");
    house.cycle();
    assert_eq!(house.eval_in(b, "last").unwrap(), "9");
}

#[test]
fn string_payloads_arrive_escaped_and_intact() {
    let mut house = scratch_house("strings");
    write_script(
        &house,
        "b.lisp",
        "(define last ())
(register-interface 'log 'char 'string (lambda (v) (define last v)) 1 1)
",
    );
    write_script(
        &house,
        "a.lisp",
        "(register-interface 'log 'char 'string (lambda (x) x) 0 0)
(output 'log \"say \\\"hi\\\"\")
",
    );
    let b = house.start_daemon("b.lisp", "lisp").unwrap();
    house.start_daemon("a.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.eval_in(b, "last").unwrap(), "\"say \\\"hi\\\"\"");
}

#[test]
fn byte_list_payloads_arrive_as_lists() {
    let mut house = scratch_house("bytes");
    write_script(
        &house,
        "b.lisp",
        "(define last ())
(register-interface 'raw 'num 'list (lambda (v) (define last v)) 1 1)
",
    );
    write_script(
        &house,
        "a.lisp",
        "(register-interface 'raw 'num 'list (lambda (x) x) 0 0)
(output 'raw (list 104 105))
",
    );
    let b = house.start_daemon("b.lisp", "lisp").unwrap();
    house.start_daemon("a.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.eval_in(b, "last").unwrap(), "(104 105)");
}

#[test]
fn repeated_declarations_are_idempotent() {
    let mut house = scratch_house("idempotent");
    write_script(
        &house,
        "a.lisp",
        "(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
(register-interface 'tick 'num 'scalar (lambda (x) x) 0 0)
",
    );
    let a = house.start_daemon("a.lisp", "lisp").unwrap();
    house.run(Some(10));
    assert_eq!(house.daemon(a).unwrap().interp.interfaces().len(), 1);
    assert!(house.interlinks().is_empty());
}

#[test]
fn evoke_starts_a_sibling_daemon() {
    let mut house = scratch_house("evoke");
    write_script(&house, "child.lisp", "(define cv 1)\n");
    write_script(
        &house,
        "parent.lisp",
        "(define kid (evoke \"child.lisp\" \"lisp\"))
(define bad (evoke \"child.lisp\" \"python\"))
(define missing (evoke \"nothere.lisp\" \"lisp\"))
",
    );
    let parent = house.start_daemon("parent.lisp", "lisp").unwrap();

    house.run(Some(10));

    assert_eq!(house.daemon_count(), 2);
    assert_eq!(house.eval_in(parent, "kid").unwrap(), "2");
    assert_eq!(house.eval_in(parent, "bad").unwrap(), "()");
    assert_eq!(house.eval_in(parent, "missing").unwrap(), "()");
    let kid = house.daemon_by_name("child.lisp").unwrap();
    assert_eq!(house.eval_in(kid, "cv").unwrap(), "1");
}

#[test]
fn manifests_boot_daemons_with_registered_info() {
    let mut house = scratch_house("manifest");
    write_script(&house, "clock.lisp", "(define t 0)\n");
    write_script(
        &house,
        "clock.proc",
        "name: clock
filename: clock.lisp
interface: tick,num,scalar,0,0
",
    );
    let id = house.boot_manifest("clock.proc").unwrap();
    assert_eq!(house.daemon_by_name("clock"), Some(id));

    let info = house.infos().next().unwrap();
    assert_eq!(info.name, "clock");
    assert_eq!(info.script, "clock.lisp");
    assert_eq!(info.interfaces.len(), 1);
    assert_eq!(info.interfaces[0].direction, Direction::Out);

    house.run(Some(10));
    assert!(house.daemon(id).unwrap().finished);
}

#[test]
fn kill_tears_down_interlinks() {
    let mut house = scratch_house("kill");
    write_script(&house, "a.lisp", PRODUCER);
    write_script(&house, "b.lisp", CONSUMER);
    let a = house.start_daemon("a.lisp", "lisp").unwrap();
    let b = house.start_daemon("b.lisp", "lisp").unwrap();
    house.run(Some(10));
    assert_eq!(house.interlinks().len(), 1);

    assert!(house.kill(a));
    assert!(house.interlinks().is_empty());
    assert_eq!(house.daemon_count(), 1);
    assert!(house.daemon(a).is_none());
    assert!(house.daemon(b).is_some());
    // Killing twice is a no-op.
    assert!(!house.kill(a));
}

#[test]
fn faulting_daemons_recover_and_keep_their_turn_order() {
    let mut house = scratch_house("fault");
    write_script(
        &house,
        "a.lisp",
        "(first 3)
(define alive 1)
",
    );
    let a = house.start_daemon("a.lisp", "lisp").unwrap();
    house.run(Some(10));
    // The first form faulted; the outer boundary recovered and the second
    // form still ran on the following cycle.
    assert_eq!(house.eval_in(a, "alive").unwrap(), "1");
}
