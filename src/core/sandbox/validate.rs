use wasmtime::{ExternType, Module};

use super::unit::{self, IMPORT_MODULE};

/// Check that agent code compiles and fits the unit ABI, without running it.
pub(crate) fn check_code(code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("generated code is empty".to_string());
    }

    let engine = unit::engine().map_err(|e| format!("could not start validator: {:#}", e))?;
    let module =
        Module::new(&engine, code).map_err(|e| format!("code does not compile: {:#}", e))?;

    for import in module.imports() {
        if import.module() != IMPORT_MODULE {
            return Err(format!(
                "import {}.{} is outside the '{}' capability namespace",
                import.module(),
                import.name(),
                IMPORT_MODULE
            ));
        }
    }

    // Catches unknown capability names and signature mismatches.
    let linker = unit::build_linker(&engine).map_err(|e| format!("{:#}", e))?;
    linker
        .instantiate_pre(&module)
        .map_err(|e| format!("unresolvable import: {:#}", e))?;

    match module.get_export("run") {
        Some(ExternType::Func(ty)) if ty.params().len() == 0 && ty.results().len() == 0 => {}
        Some(_) => return Err("export `run` must be a function with no params or results".to_string()),
        None => return Err("module does not export `run`".to_string()),
    }
    match module.get_export("memory") {
        Some(ExternType::Memory(_)) => Ok(()),
        _ => Err("module must export its linear memory as `memory`".to_string()),
    }
}
