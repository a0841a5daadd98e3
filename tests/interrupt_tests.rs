use std::cell::Cell;
use std::rc::Rc;

use wyrm::{
    poll_and_consume, request_interrupt, Error, ExportValue, Imports, Instance, Module,
    ModuleImports, Poll, RuntimeFunction, ValType, WasmValue,
};

fn drain_latch() {
    while poll_and_consume() == Poll::Interrupted {}
}

fn instantiate(wat_src: &str) -> Instance {
    let bytes = wat::parse_str(wat_src).unwrap();
    let module = Rc::new(Module::compile(bytes).unwrap());
    Instance::instantiate(module, &Imports::new()).unwrap()
}

fn instantiate_with(wat_src: &str, imports: &Imports) -> Instance {
    let bytes = wat::parse_str(wat_src).unwrap();
    let module = Rc::new(Module::compile(bytes).unwrap());
    Instance::instantiate(module, imports).unwrap()
}

#[test]
fn poll_without_request_is_not_interrupted() {
    drain_latch();
    assert_eq!(poll_and_consume(), Poll::NotInterrupted);
    assert_eq!(poll_and_consume(), Poll::NotInterrupted);
}

#[test]
fn poll_consumes_the_request() {
    drain_latch();
    request_interrupt();
    assert_eq!(poll_and_consume(), Poll::Interrupted);
    // self-resetting: the same request is observed exactly once
    assert_eq!(poll_and_consume(), Poll::NotInterrupted);
}

#[test]
fn repeated_requests_coalesce() {
    drain_latch();
    request_interrupt();
    request_interrupt();
    request_interrupt();
    assert_eq!(poll_and_consume(), Poll::Interrupted);
    assert_eq!(poll_and_consume(), Poll::NotInterrupted);
}

#[test]
fn latch_can_be_rearmed_after_consumption() {
    drain_latch();
    for _ in 0..3 {
        request_interrupt();
        assert_eq!(poll_and_consume(), Poll::Interrupted);
        assert_eq!(poll_and_consume(), Poll::NotInterrupted);
    }
}

#[test]
fn is_interrupted_helper() {
    drain_latch();
    assert!(!poll_and_consume().is_interrupted());
    request_interrupt();
    assert!(poll_and_consume().is_interrupted());
}

#[test]
fn requests_are_thread_local() {
    drain_latch();
    request_interrupt();
    // another thread must not observe this thread's request
    let other = std::thread::spawn(|| poll_and_consume());
    assert_eq!(other.join().unwrap(), Poll::NotInterrupted);
    // and this thread's request is still pending
    assert_eq!(poll_and_consume(), Poll::Interrupted);
}

#[test]
fn request_on_another_thread_does_not_leak_here() {
    drain_latch();
    let other = std::thread::spawn(|| {
        request_interrupt();
        poll_and_consume()
    });
    assert_eq!(other.join().unwrap(), Poll::Interrupted);
    assert_eq!(poll_and_consume(), Poll::NotInterrupted);
}

#[test]
fn pending_request_aborts_at_invoke_entry() {
    drain_latch();
    let instance = instantiate(
        r#"(module
             (func (export "add") (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.add))"#,
    );
    request_interrupt();
    let err = instance
        .call("add", &[WasmValue::from_i32(1), WasmValue::from_i32(2)])
        .unwrap_err();
    assert_eq!(err, Error::Trap("execution aborted"));
    // the abort consumed the request, so the next call runs normally
    let result = instance
        .call("add", &[WasmValue::from_i32(1), WasmValue::from_i32(2)])
        .unwrap();
    assert_eq!(result.unwrap().as_i32(), 3);
}

#[test]
fn host_function_can_abort_a_hot_loop() {
    drain_latch();
    // the host callback arms the latch; the loop's next back edge observes it
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "stop".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![], None, |_| {
            request_interrupt();
            Ok(None)
        })),
    );
    imports.insert("env".to_string(), env);

    let instance = instantiate_with(
        r#"(module
             (import "env" "stop" (func $stop))
             (func (export "spin")
               (call $stop)
               (loop $l (br $l))))"#,
        &imports,
    );
    let err = instance.call("spin", &[]).unwrap_err();
    assert_eq!(err, Error::Trap("execution aborted"));
}

#[test]
fn abort_lands_on_the_next_checkpoint() {
    drain_latch();
    // the counter import arms the latch on its fifth call; the loop then
    // makes no further progress past the following back edge
    let calls = Rc::new(Cell::new(0u32));
    let calls_seen = calls.clone();
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "tick".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![], None, move |_| {
            let n = calls_seen.get() + 1;
            calls_seen.set(n);
            if n == 5 {
                request_interrupt();
            }
            Ok(None)
        })),
    );
    imports.insert("env".to_string(), env);

    let instance = instantiate_with(
        r#"(module
             (import "env" "tick" (func $tick))
             (func (export "run")
               (loop $l
                 (call $tick)
                 (br $l))))"#,
        &imports,
    );
    let err = instance.call("run", &[]).unwrap_err();
    assert_eq!(err, Error::Trap("execution aborted"));
    assert_eq!(calls.get(), 5);
}

#[test]
fn interrupted_instance_remains_usable() {
    drain_latch();
    let instance = instantiate(
        r#"(module
             (global $g (mut i32) (i32.const 0))
             (func (export "bump") (result i32)
               global.get $g
               i32.const 1
               i32.add
               global.set $g
               global.get $g))"#,
    );
    assert_eq!(instance.call("bump", &[]).unwrap().unwrap().as_i32(), 1);

    request_interrupt();
    assert_eq!(instance.call("bump", &[]).unwrap_err(), Error::Trap("execution aborted"));

    // state survives the abort and execution resumes cleanly
    assert_eq!(instance.call("bump", &[]).unwrap().unwrap().as_i32(), 2);
}

#[test]
fn abort_maps_to_the_generic_trap() {
    drain_latch();
    let instance = instantiate(
        r#"(module (func (export "nop")))"#,
    );
    request_interrupt();
    let err = instance.call("nop", &[]).unwrap_err();
    match err {
        Error::Trap(msg) => assert_eq!(msg, "execution aborted"),
        other => panic!("expected a trap, got {other:?}"),
    }
}

#[test]
fn checkpoint_fires_at_callee_entry() {
    drain_latch();
    // arming inside a host call aborts before the next wasm callee starts
    let entered = Rc::new(Cell::new(false));
    let entered_seen = entered.clone();
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "arm".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![], None, |_| {
            request_interrupt();
            Ok(None)
        })),
    );
    env.insert(
        "mark".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![], None, move |_| {
            entered_seen.set(true);
            Ok(None)
        })),
    );
    imports.insert("env".to_string(), env);

    let instance = instantiate_with(
        r#"(module
             (import "env" "arm" (func $arm))
             (import "env" "mark" (func $mark))
             (func $leaf (call $mark))
             (func (export "run")
               (call $arm)
               (call $leaf)))"#,
        &imports,
    );
    let err = instance.call("run", &[]).unwrap_err();
    assert_eq!(err, Error::Trap("execution aborted"));
    assert!(!entered.get(), "callee body must not run after the latch was armed");
}

#[test]
fn host_trap_propagates_unchanged() {
    drain_latch();
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "boom".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![], Some(ValType::I32), |_| {
            Err(Error::Trap("unreachable"))
        })),
    );
    imports.insert("env".to_string(), env);

    let instance = instantiate_with(
        r#"(module
             (import "env" "boom" (func $boom (result i32)))
             (func (export "run") (result i32) (call $boom)))"#,
        &imports,
    );
    assert_eq!(instance.call("run", &[]).unwrap_err(), Error::Trap("unreachable"));
}
