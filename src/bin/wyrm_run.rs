use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use clap::Parser;
use wyrm::{ExportValue, Imports, Instance, Module, WasmValue};

#[derive(Parser, Debug)]
#[command(name = "wyrm-run")]
#[command(about = "Execute WebAssembly modules with the wyrm interpreter")]
#[command(long_about = "
Examples:
  # Run the default _start function (if exported)
  wyrm-run module.wasm

  # Invoke a specific function with arguments (value:type pairs)
  wyrm-run module.wasm --invoke add --args 10:i32 20:i32

  # WAT input is assembled on the fly
  wyrm-run module.wat --invoke main
")]
struct Args {
    /// Path to a .wasm or .wat module
    wasm_file: PathBuf,

    /// Function to invoke (defaults to _start)
    #[arg(short, long)]
    invoke: Option<String>,

    /// Arguments to pass (format: value:type, e.g. 42:i32, 3.14:f64)
    #[arg(short, long, value_delimiter = ' ', num_args = 0..)]
    args: Vec<String>,

    /// List exported functions instead of running
    #[arg(short, long)]
    list_exports: bool,

    /// Print progress to stderr
    #[arg(short, long)]
    debug: bool,
}

fn parse_value(arg: &str) -> Result<WasmValue, String> {
    let (value_str, type_str) = arg
        .split_once(':')
        .ok_or_else(|| format!("invalid argument '{arg}', expected value:type (e.g. 42:i32)"))?;
    match type_str {
        "i32" => value_str
            .parse::<i32>()
            .map(WasmValue::from_i32)
            .map_err(|_| format!("failed to parse '{value_str}' as i32")),
        "i64" => value_str
            .parse::<i64>()
            .map(WasmValue::from_i64)
            .map_err(|_| format!("failed to parse '{value_str}' as i64")),
        "f32" => value_str
            .parse::<f32>()
            .map(WasmValue::from_f32)
            .map_err(|_| format!("failed to parse '{value_str}' as f32")),
        "f64" => value_str
            .parse::<f64>()
            .map(WasmValue::from_f64)
            .map_err(|_| format!("failed to parse '{value_str}' as f64")),
        _ => Err(format!("unknown type '{type_str}', supported: i32, i64, f32, f64")),
    }
}

fn read_module_bytes(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    if path.extension().and_then(|s| s.to_str()) == Some("wat") {
        Ok(wat::parse_file(path)?)
    } else {
        Ok(fs::read(path)?)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.debug {
        eprintln!("loading module from {:?}", args.wasm_file);
    }
    let bytes = read_module_bytes(&args.wasm_file)?;
    if args.debug {
        eprintln!("module size: {} bytes", bytes.len());
    }

    let module = Rc::new(Module::compile(bytes).map_err(|e| format!("compile failed: {e}"))?);
    let imports = Imports::new();
    let instance = Instance::instantiate(module, &imports)
        .map_err(|e| format!("instantiation failed: {e}"))?;

    if args.list_exports {
        println!("Exported functions:");
        for (name, export) in &instance.exports {
            if let ExportValue::Function(func) = export {
                let sig = func.signature();
                let params = sig
                    .params
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                match sig.result {
                    Some(r) => println!("  {name} ({params}) -> {r}"),
                    None => println!("  {name} ({params})"),
                }
            }
        }
        return Ok(());
    }

    let func_name = args.invoke.as_deref().unwrap_or("_start");
    let func = instance
        .function(func_name)
        .map_err(|_| format!("function '{func_name}' not found in exports"))?
        .clone();

    let mut wasm_args = Vec::with_capacity(args.args.len());
    for arg in &args.args {
        wasm_args.push(parse_value(arg)?);
    }
    if wasm_args.len() != func.n_params() {
        return Err(format!(
            "function '{func_name}' expects {} arguments, {} provided",
            func.n_params(),
            wasm_args.len()
        )
        .into());
    }

    let result = instance
        .invoke(&func, &wasm_args)
        .map_err(|e| format!("execution failed: {e}"))?;

    match (result, func.signature().result) {
        (Some(v), Some(ty)) => println!("{}", v.display(ty)),
        (Some(v), None) => println!("{}", v.as_i64()),
        (None, _) => {
            if args.debug {
                eprintln!("function completed (no return value)");
            }
        }
    }
    Ok(())
}
