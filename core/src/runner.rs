/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * Wasmtime Runtime Execution for Sprig WASM Binaries.
 *
 * Loads a compiled module, instantiates it with zero imports, and invokes
 * the exported `entry` function with the initial bump-allocator offset.
 * The return value is a tagged 32-bit word; tag-assertion failures inside
 * the module surface here as traps.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 */

use std::fmt;
use wasmtime::{Engine, Instance, Module, Store};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Debug, Clone)]
pub struct RunError {
    pub message: String,
    pub context: String,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.context, self.message)
    }
}

impl std::error::Error for RunError {}

// =============================================================================
// Public API
// =============================================================================

/// Instantiate a compiled module and call its exported `entry` function.
///
/// The module declares its own linear memory and imports nothing;
/// `heap_base` is the initial allocation-pointer value, conventionally 0.
pub fn run_entry(bytes: &[u8], heap_base: i32) -> Result<i32, RunError> {
    let engine = Engine::default();
    let module = Module::from_binary(&engine, bytes).map_err(|e| RunError {
        message: format!("failed to load module: {}", e),
        context: "run_entry::load".to_string(),
    })?;

    let mut store = Store::new(&engine, ());
    let instance = Instance::new(&mut store, &module, &[]).map_err(|e| RunError {
        message: format!("failed to instantiate: {}", e),
        context: "run_entry::instantiate".to_string(),
    })?;

    let entry = instance
        .get_typed_func::<i32, i32>(&mut store, "entry")
        .map_err(|e| RunError {
            message: format!("no entry export: {}", e),
            context: "run_entry::get_entry".to_string(),
        })?;

    entry.call(&mut store, heap_base).map_err(|e| RunError {
        message: format!("execution trapped: {}", e),
        context: "run_entry::call_entry".to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
