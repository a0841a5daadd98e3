use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Serialize;
use wyrm::module::ExternKind;
use wyrm::{Module, Signature};

#[derive(Parser, Debug)]
#[command(name = "wyrm-inspect")]
#[command(about = "Inspect the structure of a WebAssembly module")]
#[command(long_about = "
Examples:
  # Human-readable summary
  wyrm-inspect module.wasm

  # Machine-readable summary
  wyrm-inspect module.wasm --json
")]
struct Args {
    /// Path to a .wasm or .wat module
    wasm_file: PathBuf,

    /// Emit the summary as JSON
    #[arg(long)]
    json: bool,

    /// Show only exports
    #[arg(long)]
    exports_only: bool,
}

#[derive(Serialize)]
struct FunctionInfo {
    index: u32,
    signature: String,
    imported: bool,
}

#[derive(Serialize)]
struct ExportInfo {
    name: String,
    kind: &'static str,
    index: u32,
}

#[derive(Serialize)]
struct ImportInfo {
    module: String,
    field: String,
    kind: &'static str,
}

#[derive(Serialize)]
struct ModuleSummary {
    size: usize,
    types: Vec<String>,
    imports: Vec<ImportInfo>,
    functions: Vec<FunctionInfo>,
    exports: Vec<ExportInfo>,
    memory_pages: Option<(u32, u32)>,
    table_size: Option<(u32, u32)>,
    globals: usize,
    start: Option<u32>,
}

fn kind_name(kind: ExternKind) -> &'static str {
    match kind {
        ExternKind::Func => "function",
        ExternKind::Table => "table",
        ExternKind::Mem => "memory",
        ExternKind::Global => "global",
    }
}

fn format_signature(sig: &Signature) -> String {
    let params = sig.params.iter().map(|t| t.name()).collect::<Vec<_>>().join(", ");
    match sig.result {
        Some(r) => format!("({params}) -> {r}"),
        None => format!("({params})"),
    }
}

fn summarize(module: &Module, size: usize) -> ModuleSummary {
    let mut imports: Vec<ImportInfo> = Vec::new();
    for (module_name, fields) in &module.imports {
        for (field, kind) in fields {
            imports.push(ImportInfo {
                module: module_name.clone(),
                field: field.clone(),
                kind: kind_name(*kind),
            });
        }
    }
    imports.sort_by(|a, b| (&a.module, &a.field).cmp(&(&b.module, &b.field)));

    let functions = module
        .functions
        .iter()
        .enumerate()
        .map(|(i, f)| FunctionInfo {
            index: i as u32,
            signature: format_signature(&f.ty),
            imported: f.import.is_some(),
        })
        .collect();

    let mut exports: Vec<ExportInfo> = module
        .exports
        .iter()
        .map(|(name, e)| ExportInfo { name: name.clone(), kind: kind_name(e.kind), index: e.idx })
        .collect();
    exports.sort_by(|a, b| a.name.cmp(&b.name));

    ModuleSummary {
        size,
        types: module.types.iter().map(format_signature).collect(),
        imports,
        functions,
        exports,
        memory_pages: module.memory.as_ref().map(|m| (m.min, m.max)),
        table_size: module.table.as_ref().map(|t| (t.min, t.max)),
        globals: module.globals.len(),
        start: module.start,
    }
}

fn print_summary(path: &PathBuf, summary: &ModuleSummary, exports_only: bool) {
    if !exports_only {
        println!("Module: {}", path.display());
        println!("Size: {} bytes", summary.size);
        println!();

        if summary.imports.is_empty() {
            println!("Imports: none");
        } else {
            println!("Imports:");
            for imp in &summary.imports {
                println!("  {}.{} ({})", imp.module, imp.field, imp.kind);
            }
        }
        println!();

        println!("Functions:");
        for f in &summary.functions {
            let marker = if f.imported { " [imported]" } else { "" };
            println!("  [{}] {}{}", f.index, f.signature, marker);
        }
        println!();

        match summary.memory_pages {
            Some((min, max)) => println!("Memory: {min}..{max} pages"),
            None => println!("Memory: none"),
        }
        match summary.table_size {
            Some((min, max)) => println!("Table: {min}..{max} elements"),
            None => println!("Table: none"),
        }
        println!("Globals: {}", summary.globals);
        if let Some(start) = summary.start {
            println!("Start function: {start}");
        }
        println!();
    }

    if summary.exports.is_empty() {
        println!("Exports: none");
    } else {
        println!("Exports:");
        for e in &summary.exports {
            println!("  {} ({}, index {})", e.name, e.kind, e.index);
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let bytes = if args.wasm_file.extension().and_then(|s| s.to_str()) == Some("wat") {
        wat::parse_file(&args.wasm_file)?
    } else {
        fs::read(&args.wasm_file)?
    };
    let size = bytes.len();
    let module = Module::compile(bytes).map_err(|e| format!("compile failed: {e}"))?;
    let summary = summarize(&module, size);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&args.wasm_file, &summary, args.exports_only);
    }
    Ok(())
}
