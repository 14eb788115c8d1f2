/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Sprig Lisp Compiler.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * 1. OPEN SOURCE: You may use this file under the terms of the GNU Affero
 * General Public License v3.0. If you link to this code, your ENTIRE
 * application must be open-sourced under AGPLv3.
 *
 * 2. COMMERCIAL: For proprietary use, you must obtain a Commercial License
 * from Sovereign Systems.
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

//! Sprig — a miniature Lisp compiled directly to WebAssembly.
//!
//! `compile` takes one top-level expression and produces a self-contained
//! binary module exporting a single `entry(heap_base) -> tagged i32`
//! function. Compilation is a pure, synchronous transformation; every call
//! starts from fresh local tables, environments and function lists.

pub mod ast;
pub mod codegen;
pub mod encoder;
pub mod parser;
#[cfg(not(target_arch = "wasm32"))]
pub mod runner;

use thiserror::Error;

/// Everything the top-level compile entry point can fail with. Lexing and
/// parsing keep their own error enums; the code generator's failures are
/// flat variants here. All are synchronous and none are recovered
/// internally — a malformed program aborts compilation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("lex error: {0}")]
    Lex(#[from] parser::LexError),
    #[error("parse error: {0}")]
    Parse(#[from] parser::ParseError),
    #[error("undefined variable '{0}'")]
    UnboundVariable(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("unexpected token type: expected {expected}, found {found}")]
    UnexpectedTokenType {
        expected: &'static str,
        found: String,
    },
}

pub use codegen::{compile, compile_with_memory, lower_program};
pub use encoder::{FuncDef, MemoryLimits, Module, ValType};
