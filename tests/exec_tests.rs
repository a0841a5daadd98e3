use std::rc::Rc;

use wyrm::{
    Error, ExportValue, Imports, Instance, Module, ModuleImports, RuntimeFunction, ValType,
    WasmValue,
};

fn compile(wat_src: &str) -> Rc<Module> {
    let bytes = wat::parse_str(wat_src).unwrap();
    Rc::new(Module::compile(bytes).unwrap())
}

fn instantiate(wat_src: &str) -> Instance {
    Instance::instantiate(compile(wat_src), &Imports::new()).unwrap()
}

fn call_i32(instance: &Instance, name: &str, args: &[WasmValue]) -> i32 {
    instance.call(name, args).unwrap().unwrap().as_i32()
}

#[test]
fn add_u32() {
    let instance = instantiate(
        r#"(module
             (func (export "add") (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.add))"#,
    );
    let args = [WasmValue::from_i32(2), WasmValue::from_i32(40)];
    assert_eq!(call_i32(&instance, "add", &args), 42);
}

#[test]
fn add_u64() {
    let instance = instantiate(
        r#"(module
             (func (export "add64") (param i64 i64) (result i64)
               local.get 0
               local.get 1
               i64.add))"#,
    );
    let args = [WasmValue::from_i64(1 << 40), WasmValue::from_i64(7)];
    let result = instance.call("add64", &args).unwrap().unwrap();
    assert_eq!(result.as_i64(), (1 << 40) + 7);
}

#[test]
fn wrapping_arithmetic() {
    let instance = instantiate(
        r#"(module
             (func (export "wrap") (result i32)
               i32.const 2147483647
               i32.const 1
               i32.add))"#,
    );
    assert_eq!(call_i32(&instance, "wrap", &[]), i32::MIN);
}

#[test]
fn float_arithmetic() {
    let instance = instantiate(
        r#"(module
             (func (export "hypot2") (param f64 f64) (result f64)
               local.get 0
               local.get 0
               f64.mul
               local.get 1
               local.get 1
               f64.mul
               f64.add
               f64.sqrt))"#,
    );
    let args = [WasmValue::from_f64(3.0), WasmValue::from_f64(4.0)];
    let result = instance.call("hypot2", &args).unwrap().unwrap();
    assert_eq!(result.as_f64(), 5.0);
}

#[test]
fn locals_and_tee() {
    let instance = instantiate(
        r#"(module
             (func (export "square_plus") (param i32) (result i32)
               (local i32)
               local.get 0
               local.get 0
               i32.mul
               local.tee 1
               local.get 1
               i32.add))"#,
    );
    assert_eq!(call_i32(&instance, "square_plus", &[WasmValue::from_i32(5)]), 50);
}

#[test]
fn if_else_result() {
    let instance = instantiate(
        r#"(module
             (func (export "pick") (param i32) (result i32)
               local.get 0
               (if (result i32)
                 (then i32.const 10)
                 (else i32.const 20))))"#,
    );
    assert_eq!(call_i32(&instance, "pick", &[WasmValue::from_i32(1)]), 10);
    assert_eq!(call_i32(&instance, "pick", &[WasmValue::from_i32(0)]), 20);
}

#[test]
fn if_without_else() {
    let instance = instantiate(
        r#"(module
             (func (export "clamp") (param i32) (result i32)
               (local i32)
               local.get 0
               local.set 1
               local.get 0
               i32.const 100
               i32.gt_s
               (if (then i32.const 100 local.set 1))
               local.get 1))"#,
    );
    assert_eq!(call_i32(&instance, "clamp", &[WasmValue::from_i32(250)]), 100);
    assert_eq!(call_i32(&instance, "clamp", &[WasmValue::from_i32(7)]), 7);
}

#[test]
fn loop_sums_to_n() {
    let instance = instantiate(
        r#"(module
             (func (export "sum") (param i32) (result i32)
               (local i32)
               (block $done
                 (loop $next
                   local.get 0
                   i32.eqz
                   br_if $done
                   local.get 1
                   local.get 0
                   i32.add
                   local.set 1
                   local.get 0
                   i32.const 1
                   i32.sub
                   local.set 0
                   br $next))
               local.get 1))"#,
    );
    assert_eq!(call_i32(&instance, "sum", &[WasmValue::from_i32(100)]), 5050);
}

#[test]
fn block_break_with_value() {
    let instance = instantiate(
        r#"(module
             (func (export "early") (result i32)
               (block (result i32)
                 i32.const 7
                 br 0
                 )))"#,
    );
    assert_eq!(call_i32(&instance, "early", &[]), 7);
}

#[test]
fn br_table_dispatch() {
    let instance = instantiate(
        r#"(module
             (func (export "route") (param i32) (result i32)
               (block $b2
                 (block $b1
                   (block $b0
                     local.get 0
                     br_table $b0 $b1 $b2)
                   (return (i32.const 10)))
                 (return (i32.const 11)))
               (return (i32.const 22))))"#,
    );
    assert_eq!(call_i32(&instance, "route", &[WasmValue::from_i32(0)]), 10);
    assert_eq!(call_i32(&instance, "route", &[WasmValue::from_i32(1)]), 11);
    assert_eq!(call_i32(&instance, "route", &[WasmValue::from_i32(2)]), 22);
    assert_eq!(call_i32(&instance, "route", &[WasmValue::from_i32(9)]), 22);
}

#[test]
fn branch_to_function_label_returns() {
    // br to the outermost label acts as a return, including from a callee
    let instance = instantiate(
        r#"(module
             (func $inner (param i32) (result i32)
               local.get 0
               i32.const 2
               i32.mul
               br 0)
             (func (export "outer") (param i32) (result i32)
               local.get 0
               call $inner
               i32.const 1
               i32.add))"#,
    );
    assert_eq!(call_i32(&instance, "outer", &[WasmValue::from_i32(20)]), 41);
}

#[test]
fn select_picks_by_condition() {
    let instance = instantiate(
        r#"(module
             (func (export "sel") (param i32) (result i32)
               i32.const 111
               i32.const 222
               local.get 0
               select))"#,
    );
    assert_eq!(call_i32(&instance, "sel", &[WasmValue::from_i32(1)]), 111);
    assert_eq!(call_i32(&instance, "sel", &[WasmValue::from_i32(0)]), 222);
}

#[test]
fn recursive_factorial() {
    let instance = instantiate(
        r#"(module
             (func $fac (export "fac") (param i64) (result i64)
               local.get 0
               i64.const 1
               i64.le_s
               (if (result i64)
                 (then i64.const 1)
                 (else
                   local.get 0
                   local.get 0
                   i64.const 1
                   i64.sub
                   call $fac
                   i64.mul))))"#,
    );
    let result = instance.call("fac", &[WasmValue::from_i64(10)]).unwrap().unwrap();
    assert_eq!(result.as_i64(), 3628800);
}

#[test]
fn runaway_recursion_exhausts_the_stack() {
    let instance = instantiate(
        r#"(module
             (func $down (export "down") (param i32) (result i32)
               local.get 0
               call $down))"#,
    );
    let err = instance.call("down", &[WasmValue::from_i32(0)]).unwrap_err();
    assert_eq!(err, Error::Trap("call stack exhausted"));
}

#[test]
fn globals_persist_between_calls() {
    let instance = instantiate(
        r#"(module
             (global $counter (mut i32) (i32.const 0))
             (func (export "bump") (result i32)
               global.get $counter
               i32.const 1
               i32.add
               global.set $counter
               global.get $counter))"#,
    );
    assert_eq!(call_i32(&instance, "bump", &[]), 1);
    assert_eq!(call_i32(&instance, "bump", &[]), 2);
    assert_eq!(call_i32(&instance, "bump", &[]), 3);
}

#[test]
fn exported_global_access() {
    let instance = instantiate(
        r#"(module
             (global (export "answer") i32 (i32.const 42))
             (global (export "state") (mut i64) (i64.const -1)))"#,
    );
    let answer = instance.global("answer").unwrap();
    assert_eq!(answer.ty, ValType::I32);
    assert_eq!(answer.get().as_i32(), 42);
    assert_eq!(answer.set(WasmValue::from_i32(0)).unwrap_err(), Error::Validation("global is immutable"));

    let state = instance.global("state").unwrap();
    assert!(state.mutable);
    state.set(WasmValue::from_i64(99)).unwrap();
    assert_eq!(state.get().as_i64(), 99);
}

#[test]
fn memory_load_store() {
    let instance = instantiate(
        r#"(module
             (memory (export "mem") 1)
             (func (export "poke") (param i32 i32)
               local.get 0
               local.get 1
               i32.store)
             (func (export "peek") (param i32) (result i32)
               local.get 0
               i32.load))"#,
    );
    let args = [WasmValue::from_i32(16), WasmValue::from_i32(-77)];
    instance.call("poke", &args).unwrap();
    assert_eq!(call_i32(&instance, "peek", &[WasmValue::from_i32(16)]), -77);

    // embedder-side view of the same memory
    let mem = instance.memory().unwrap();
    assert_eq!(mem.borrow().load_i32(16, 0).unwrap(), -77);
}

#[test]
fn data_segment_initializes_memory() {
    let instance = instantiate(
        r#"(module
             (memory 1)
             (data (i32.const 8) "wyrm")
             (func (export "byte_at") (param i32) (result i32)
               local.get 0
               i32.load8_u))"#,
    );
    assert_eq!(call_i32(&instance, "byte_at", &[WasmValue::from_i32(8)]), b'w' as i32);
    assert_eq!(call_i32(&instance, "byte_at", &[WasmValue::from_i32(11)]), b'm' as i32);

    let mem = instance.memory().unwrap();
    assert_eq!(mem.borrow().read_string(8, 4).unwrap(), "wyrm");
}

#[test]
fn memory_grow_and_size() {
    let instance = instantiate(
        r#"(module
             (memory 1 3)
             (func (export "grow") (param i32) (result i32)
               local.get 0
               memory.grow)
             (func (export "size") (result i32)
               memory.size))"#,
    );
    assert_eq!(call_i32(&instance, "size", &[]), 1);
    assert_eq!(call_i32(&instance, "grow", &[WasmValue::from_i32(2)]), 1);
    assert_eq!(call_i32(&instance, "size", &[]), 3);
    // past the declared maximum: grow reports failure with -1
    assert_eq!(call_i32(&instance, "grow", &[WasmValue::from_i32(1)]), -1);
}

#[test]
fn embedder_resize_respects_the_maximum() {
    let instance = instantiate(r#"(module (memory (export "mem") 1 2))"#);
    let mem = instance.memory().unwrap();
    mem.borrow_mut().resize(2).unwrap();
    assert_eq!(mem.borrow().size(), 2);
    // resize never shrinks
    mem.borrow_mut().resize(1).unwrap();
    assert_eq!(mem.borrow().size(), 2);
    assert_eq!(
        mem.borrow_mut().resize(5).unwrap_err(),
        Error::Validation("memory size must be at most 65536 pages (4GiB)")
    );
}

#[test]
fn out_of_bounds_access_traps() {
    let instance = instantiate(
        r#"(module
             (memory 1)
             (func (export "peek") (param i32) (result i32)
               local.get 0
               i32.load))"#,
    );
    let err = instance.call("peek", &[WasmValue::from_i32(65536)]).unwrap_err();
    assert_eq!(err, Error::Trap("out of bounds memory access"));
}

#[test]
fn call_indirect_through_table() {
    let instance = instantiate(
        r#"(module
             (type $binop (func (param i32 i32) (result i32)))
             (table 2 funcref)
             (elem (i32.const 0) $add $sub)
             (func $add (type $binop) local.get 0 local.get 1 i32.add)
             (func $sub (type $binop) local.get 0 local.get 1 i32.sub)
             (func (export "apply") (param i32 i32 i32) (result i32)
               local.get 1
               local.get 2
               local.get 0
               call_indirect (type $binop)))"#,
    );
    let add = [WasmValue::from_i32(0), WasmValue::from_i32(30), WasmValue::from_i32(12)];
    let sub = [WasmValue::from_i32(1), WasmValue::from_i32(30), WasmValue::from_i32(12)];
    assert_eq!(call_i32(&instance, "apply", &add), 42);
    assert_eq!(call_i32(&instance, "apply", &sub), 18);
}

#[test]
fn call_indirect_traps() {
    let instance = instantiate(
        r#"(module
             (type $none (func))
             (type $unary (func (param i32) (result i32)))
             (table 3 funcref)
             (elem (i32.const 0) $noop)
             (func $noop)
             (func (export "bad_sig") (param i32) (result i32)
               local.get 0
               i32.const 0
               call_indirect (type $unary))
             (func (export "hole")
               i32.const 1
               call_indirect (type $none))
             (func (export "oob")
               i32.const 9
               call_indirect (type $none)))"#,
    );
    assert_eq!(
        instance.call("bad_sig", &[WasmValue::from_i32(1)]).unwrap_err(),
        Error::Trap("indirect call type mismatch")
    );
    assert_eq!(instance.call("hole", &[]).unwrap_err(), Error::Trap("uninitialized element"));
    assert_eq!(instance.call("oob", &[]).unwrap_err(), Error::Trap("undefined element"));
}

#[test]
fn host_import_links_and_runs() {
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "mul".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(
            vec![ValType::I32, ValType::I32],
            Some(ValType::I32),
            |args| Ok(Some(WasmValue::from_i32(args[0].as_i32() * args[1].as_i32()))),
        )),
    );
    imports.insert("env".to_string(), env);

    let module = compile(
        r#"(module
             (import "env" "mul" (func $mul (param i32 i32) (result i32)))
             (func (export "sixfold") (param i32) (result i32)
               local.get 0
               i32.const 6
               call $mul))"#,
    );
    let instance = Instance::instantiate(module, &imports).unwrap();
    assert_eq!(call_i32(&instance, "sixfold", &[WasmValue::from_i32(7)]), 42);
}

#[test]
fn missing_import_fails_to_link() {
    let module = compile(
        r#"(module
             (import "env" "absent" (func)))"#,
    );
    let err = Instance::instantiate(module, &Imports::new()).unwrap_err();
    assert_eq!(err, Error::Link("unknown import"));
}

#[test]
fn import_signature_mismatch_fails_to_link() {
    let mut imports = Imports::new();
    let mut env = ModuleImports::new();
    env.insert(
        "f".to_string(),
        ExportValue::Function(RuntimeFunction::new_host(vec![ValType::I64], None, |_| Ok(None))),
    );
    imports.insert("env".to_string(), env);

    let module = compile(
        r#"(module
             (import "env" "f" (func (param i32))))"#,
    );
    let err = Instance::instantiate(module, &imports).unwrap_err();
    assert_eq!(err, Error::Link("incompatible import type"));
}

#[test]
fn start_function_runs_at_instantiation() {
    let instance = instantiate(
        r#"(module
             (global $ready (mut i32) (i32.const 0))
             (func $init (global.set $ready (i32.const 1)))
             (start $init)
             (func (export "ready") (result i32)
               global.get $ready))"#,
    );
    assert_eq!(call_i32(&instance, "ready", &[]), 1);
}

#[test]
fn trapping_start_is_uninstantiable() {
    let module = compile(
        r#"(module
             (func $boom unreachable)
             (start $boom))"#,
    );
    let err = Instance::instantiate(module, &Imports::new()).unwrap_err();
    assert_eq!(err, Error::Uninstantiable("unreachable"));
}

#[test]
fn arithmetic_traps() {
    let instance = instantiate(
        r#"(module
             (func (export "div") (param i32 i32) (result i32)
               local.get 0
               local.get 1
               i32.div_s)
             (func (export "to_int") (param f64) (result i32)
               local.get 0
               i32.trunc_f64_s))"#,
    );
    let div0 = [WasmValue::from_i32(1), WasmValue::from_i32(0)];
    assert_eq!(instance.call("div", &div0).unwrap_err(), Error::Trap("integer divide by zero"));

    let overflow = [WasmValue::from_i32(i32::MIN), WasmValue::from_i32(-1)];
    assert_eq!(instance.call("div", &overflow).unwrap_err(), Error::Trap("integer overflow"));

    let nan = [WasmValue::from_f64(f64::NAN)];
    assert_eq!(
        instance.call("to_int", &nan).unwrap_err(),
        Error::Trap("invalid conversion to integer")
    );
    let huge = [WasmValue::from_f64(1e300)];
    assert_eq!(instance.call("to_int", &huge).unwrap_err(), Error::Trap("integer overflow"));
}

#[test]
fn wrong_argument_count_is_rejected() {
    let instance = instantiate(
        r#"(module
             (func (export "id") (param i32) (result i32)
               local.get 0))"#,
    );
    let err = instance.call("id", &[]).unwrap_err();
    assert_eq!(err, Error::Trap("invalid number of arguments"));
}

#[test]
fn unknown_export_lookup_fails() {
    let instance = instantiate(r#"(module (func (export "here")))"#);
    assert_eq!(instance.function("missing").unwrap_err(), Error::Link("function lookup failed"));
    assert!(instance.function("here").is_ok());
}

#[test]
fn malformed_modules_are_rejected() {
    assert_eq!(
        Module::compile(b"not wasm".to_vec()).unwrap_err(),
        Error::Malformed("magic header not detected")
    );
    assert_eq!(
        Module::compile(b"\0asm\x02\0\0\0".to_vec()).unwrap_err(),
        Error::Malformed("unknown binary version")
    );
    assert_eq!(
        Module::compile(b"\0asm".to_vec()).unwrap_err(),
        Error::Malformed("unexpected end of section or function")
    );
}

#[test]
fn structural_limits_are_enforced() {
    let compile_err = |src: &str| Module::compile(wat::parse_str(src).unwrap()).unwrap_err();

    assert_eq!(
        compile_err("(module (memory 1) (memory 1))"),
        Error::Validation("multiple memories")
    );
    assert_eq!(
        compile_err("(module (table 1 funcref) (table 1 funcref))"),
        Error::Validation("multiple tables")
    );
    assert_eq!(
        compile_err("(module (func (result i32 i32) (i32.const 1) (i32.const 2)))"),
        Error::Validation("invalid result arity")
    );
    assert_eq!(
        compile_err("(module (memory 65537 65537))"),
        Error::Validation("memory size must be at most 65536 pages (4GiB)")
    );
    let too_many_locals = format!("(module (func (local {})))", "i64 ".repeat(50001));
    assert_eq!(compile_err(&too_many_locals), Error::Malformed("too many locals"));
}

#[test]
fn out_of_order_sections_are_rejected() {
    // memory section (id 5) followed by a type section (id 1)
    let bytes = vec![
        0x00, 0x61, 0x73, 0x6d, 1, 0, 0, 0, // magic + version
        5, 3, 1, 0, 1, // memory section: one memory, min 1, no max
        1, 1, 0, // empty type section, out of order
    ];
    assert_eq!(Module::compile(bytes).unwrap_err(), Error::Malformed("junk after last section"));
}

#[test]
fn over_aligned_memory_access_is_rejected() {
    let err = Module::compile(
        wat::parse_str(
            r#"(module (memory 1)
                 (func (result i32)
                   i32.const 0
                   i32.load align=8))"#,
        )
        .unwrap(),
    )
    .unwrap_err();
    assert_eq!(err, Error::Validation("alignment must not be larger than natural"));

    // the natural alignment itself is fine
    compile(
        r#"(module (memory 1)
             (func (result i32)
               i32.const 0
               i32.load align=4))"#,
    );
}

#[test]
fn local_access_below_the_operand_stack_traps() {
    // these bodies pass the compile-time scan (the local indices exist) but
    // drain the operand region below the local slots at run time
    let instance = instantiate(
        r#"(module
             (func (export "get") (param i32) (result i32)
               drop
               local.get 0)
             (func (export "set") (param i32)
               drop
               i32.const 1
               local.set 0)
             (func (export "tee") (param i32 i32)
               drop
               drop
               i32.const 1
               local.tee 1
               drop))"#,
    );
    let one = [WasmValue::from_i32(1)];
    let two = [WasmValue::from_i32(1), WasmValue::from_i32(2)];
    assert_eq!(instance.call("get", &one).unwrap_err(), Error::Trap("stack underflow"));
    assert_eq!(instance.call("set", &one).unwrap_err(), Error::Trap("stack underflow"));
    assert_eq!(instance.call("tee", &two).unwrap_err(), Error::Trap("stack underflow"));
}

#[test]
fn summary_debug_formatting() {
    let module = compile(r#"(module (memory 1) (func (export "noop")))"#);
    let dump = format!("{module:?}");
    assert!(dump.contains("Module") && dump.contains("functions: 1"));

    let instance = Instance::instantiate(module, &Imports::new()).unwrap();
    assert!(format!("{instance:?}").contains("memory_pages: Some(1)"));
    assert!(format!("{:?}", instance.function("noop").unwrap()).contains("Wasm"));
}

#[test]
fn custom_sections_are_skipped() {
    let bytes = wat::parse_str(r#"(module (func (export "two") (result i32) i32.const 2))"#).unwrap();
    // append a custom section: id 0, size 5, name "note" (len 4)
    let mut with_custom = bytes.clone();
    with_custom.extend_from_slice(&[0, 5, 4, b'n', b'o', b't', b'e']);
    let module = Rc::new(Module::compile(with_custom).unwrap());
    let instance = Instance::instantiate(module, &Imports::new()).unwrap();
    assert_eq!(call_i32(&instance, "two", &[]), 2);
}

#[test]
fn sixty_four_bit_bit_ops() {
    let instance = instantiate(
        r#"(module
             (func (export "popcnt") (param i64) (result i64)
               local.get 0
               i64.popcnt)
             (func (export "rotl") (param i64 i64) (result i64)
               local.get 0
               local.get 1
               i64.rotl))"#,
    );
    let v = [WasmValue::from_u64(0xff00_ff00_ff00_ff00)];
    assert_eq!(instance.call("popcnt", &v).unwrap().unwrap().as_u64(), 32);
    let r = [WasmValue::from_u64(1), WasmValue::from_u64(64 + 8)];
    assert_eq!(instance.call("rotl", &r).unwrap().unwrap().as_u64(), 256);
}

#[test]
fn float_min_max_semantics() {
    let instance = instantiate(
        r#"(module
             (func (export "fmin") (param f64 f64) (result f64)
               local.get 0
               local.get 1
               f64.min)
             (func (export "fmax") (param f64 f64) (result f64)
               local.get 0
               local.get 1
               f64.max))"#,
    );
    let zeros = [WasmValue::from_f64(0.0), WasmValue::from_f64(-0.0)];
    let min = instance.call("fmin", &zeros).unwrap().unwrap().as_f64();
    assert!(min == 0.0 && min.is_sign_negative());
    let max = instance.call("fmax", &zeros).unwrap().unwrap().as_f64();
    assert!(max == 0.0 && max.is_sign_positive());

    let with_nan = [WasmValue::from_f64(1.0), WasmValue::from_f64(f64::NAN)];
    assert!(instance.call("fmin", &with_nan).unwrap().unwrap().as_f64().is_nan());
}
