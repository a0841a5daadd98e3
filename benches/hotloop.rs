use std::hint::black_box;
use std::rc::Rc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use wyrm::{Imports, Instance, Module, RuntimeFunction, WasmValue};

// Loop-heavy workloads: every iteration crosses the loop opcode, so these
// measure the steady-state cost of the interpreter's per-back-edge
// interrupt checkpoint along with plain dispatch.
const HOTLOOP_WAT: &str = r#"
(module
  (func (export "sum") (param i32) (result i64)
    (local $i i32)
    (local $acc i64)
    (block $done
      (loop $next
        local.get $i
        local.get 0
        i32.ge_u
        br_if $done
        local.get $acc
        local.get $i
        i64.extend_i32_u
        i64.add
        local.set $acc
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $next))
    local.get $acc)
  (func $fib (export "fib") (param i32) (result i64)
    local.get 0
    i32.const 2
    i32.lt_u
    (if (result i64)
      (then local.get 0 i64.extend_i32_u)
      (else
        local.get 0
        i32.const 1
        i32.sub
        call $fib
        local.get 0
        i32.const 2
        i32.sub
        call $fib
        i64.add))))
"#;

fn setup() -> (Instance, RuntimeFunction, RuntimeFunction) {
    let bytes = wat::parse_str(HOTLOOP_WAT).expect("assemble benchmark module");
    let module = Rc::new(Module::compile(bytes).expect("compile benchmark module"));
    let instance = Instance::instantiate(module, &Imports::new()).expect("instantiate");
    let sum = match instance.function("sum") {
        Ok(f) => f.clone(),
        Err(e) => panic!("export 'sum' missing: {e}"),
    };
    let fib = match instance.function("fib") {
        Ok(f) => f.clone(),
        Err(e) => panic!("export 'fib' missing: {e}"),
    };
    (instance, sum, fib)
}

fn bench_hotloop(c: &mut Criterion) {
    let (instance, sum, fib) = setup();

    let mut group = c.benchmark_group("hotloop");
    group.throughput(Throughput::Elements(1_000_000));
    group.bench_function("sum_1m", |b| {
        b.iter(|| {
            let args = [WasmValue::from_i32(black_box(1_000_000))];
            let result = instance.invoke(&sum, &args).expect("invoke sum");
            black_box(result);
        })
    });
    group.finish();

    c.bench_function("fib_25", |b| {
        b.iter(|| {
            let args = [WasmValue::from_i32(black_box(25))];
            let result = instance.invoke(&fib, &args).expect("invoke fib");
            black_box(result);
        })
    });
}

criterion_group!(benches, bench_hotloop);
criterion_main!(benches);
