/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * WASM Code Generator for the Sprig Language.
 *
 * Lowers symbolic-expression trees to raw stack-machine instruction bytes
 * and function descriptors. Runtime values are tagged 32-bit words; pairs
 * and closures live in linear memory behind a bump allocator whose pointer
 * is threaded through local slot 0 of every generated function.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

use crate::ast::{Form, Token, TokenKind};
use crate::encoder::{write_i32, write_u32, FuncDef, MemoryLimits, Module, ValType};
use crate::parser;
use crate::CompileError;
use std::collections::HashMap;

// =============================================================================
// Tagged Value Representation
// =============================================================================

/// Runtime values are 32-bit words whose two low bits name the type:
///
/// - `01` fixnum — remaining 30 bits are the signed payload
/// - `10` boolean — bit 2 is the truth value; nil is the false boolean
/// - `11` pair — remaining bits are a word-aligned byte offset into memory
/// - `00` raw pointer — closures only, identified by a marker word in memory
///   rather than a tag
pub const TAG_MASK: i32 = 0b11;
pub const FIXNUM_TAG: i32 = 0b01;
pub const BOOLEAN_TAG: i32 = 0b10;
pub const PAIR_TAG: i32 = 0b11;

/// Tagged nil: the false boolean, `(0 << 2) | 10`.
pub const NIL: i32 = BOOLEAN_TAG;

/// First word of every closure object ("clos" in ASCII); the second word is
/// the function-table index. Pairs carry no marker, so this constant is what
/// separates the two 8-byte heap shapes at runtime.
pub const CLOSURE_MARKER: i32 = 0x636c_6f73;

/// Pairs and closures are both two-word heap cells.
pub const HEAP_CELL_SIZE: i32 = 8;

/// The bump allocation pointer occupies local slot 0 of every function,
/// passed in as its single parameter.
const ALLOC_PTR: u32 = 0;

/// Export and debug name of the implicit top-level function.
pub const ENTRY_NAME: &str = "entry";

pub fn tagged_fixnum(value: i32) -> i32 {
    value.wrapping_shl(2) | FIXNUM_TAG
}

pub fn tagged_boolean(value: bool) -> i32 {
    ((value as i32) << 2) | BOOLEAN_TAG
}

pub fn tagged_pair(offset: i32) -> i32 {
    offset | PAIR_TAG
}

// =============================================================================
// Instruction Assembler
// =============================================================================

mod op {
    pub const UNREACHABLE: u8 = 0x00;
    pub const BLOCK: u8 = 0x02;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0b;
    pub const CALL_INDIRECT: u8 = 0x11;
    pub const DROP: u8 = 0x1a;
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const I32_LOAD: u8 = 0x28;
    pub const I32_STORE: u8 = 0x36;
    pub const I32_CONST: u8 = 0x41;
    pub const I32_EQZ: u8 = 0x45;
    pub const I32_EQ: u8 = 0x46;
    pub const I32_NE: u8 = 0x47;
    pub const I32_ADD: u8 = 0x6a;
    pub const I32_SUB: u8 = 0x6b;
    pub const I32_AND: u8 = 0x71;
    pub const I32_OR: u8 = 0x72;
    pub const I32_SHL: u8 = 0x74;
    pub const I32_SHR_S: u8 = 0x75;
    pub const I32_SHR_U: u8 = 0x76;

    pub const BLOCKTYPE_EMPTY: u8 = 0x40;
    pub const BLOCKTYPE_I32: u8 = 0x7f;
}

/// Tiny instruction-byte emitter. Structured control is emitted with
/// explicit `else_`/`end` calls; the caller owns the nesting discipline.
struct Asm {
    bytes: Vec<u8>,
}

impl Asm {
    fn new() -> Self {
        Asm { bytes: Vec::new() }
    }

    fn raw(&mut self, code: &[u8]) {
        self.bytes.extend_from_slice(code);
    }

    fn op(&mut self, opcode: u8) {
        self.bytes.push(opcode);
    }

    fn i32_const(&mut self, value: i32) {
        self.bytes.push(op::I32_CONST);
        write_i32(&mut self.bytes, value);
    }

    fn local_get(&mut self, index: u32) {
        self.bytes.push(op::LOCAL_GET);
        write_u32(&mut self.bytes, index);
    }

    fn local_set(&mut self, index: u32) {
        self.bytes.push(op::LOCAL_SET);
        write_u32(&mut self.bytes, index);
    }

    // memarg: alignment exponent (4-byte aligned), then byte offset
    fn i32_load(&mut self, offset: u32) {
        self.bytes.push(op::I32_LOAD);
        write_u32(&mut self.bytes, 2);
        write_u32(&mut self.bytes, offset);
    }

    fn i32_store(&mut self, offset: u32) {
        self.bytes.push(op::I32_STORE);
        write_u32(&mut self.bytes, 2);
        write_u32(&mut self.bytes, offset);
    }

    fn block_i32(&mut self) {
        self.bytes.push(op::BLOCK);
        self.bytes.push(op::BLOCKTYPE_I32);
    }

    fn if_i32(&mut self) {
        self.bytes.push(op::IF);
        self.bytes.push(op::BLOCKTYPE_I32);
    }

    fn if_empty(&mut self) {
        self.bytes.push(op::IF);
        self.bytes.push(op::BLOCKTYPE_EMPTY);
    }

    fn else_(&mut self) {
        self.bytes.push(op::ELSE);
    }

    fn end(&mut self) {
        self.bytes.push(op::END);
    }

    fn call_indirect(&mut self, type_index: u32) {
        self.bytes.push(op::CALL_INDIRECT);
        write_u32(&mut self.bytes, type_index);
        self.bytes.push(0x00); // table 0
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

fn untag_fixnum(asm: &mut Asm) {
    asm.i32_const(2);
    asm.op(op::I32_SHR_S);
}

fn tag_fixnum(asm: &mut Asm) {
    asm.i32_const(2);
    asm.op(op::I32_SHL);
    asm.i32_const(FIXNUM_TAG);
    asm.op(op::I32_OR);
}

fn tag_boolean(asm: &mut Asm) {
    asm.i32_const(2);
    asm.op(op::I32_SHL);
    asm.i32_const(BOOLEAN_TAG);
    asm.op(op::I32_OR);
}

// =============================================================================
// Locals & Environment
// =============================================================================

/// One slot in a function's flat local-variable space. Slot 0 is always the
/// implicit allocation-pointer parameter; named slots come from `let`
/// bindings, unnamed ones are compiler temporaries. The table is append-only:
/// slots are never removed or reordered, so an index handed out while
/// compiling an enclosing scope stays valid inside nested scopes.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalSlot {
    pub name: Option<String>,
    pub ty: ValType,
}

fn alloc_pointer_slot() -> LocalSlot {
    LocalSlot {
        name: Some("heap".to_string()),
        ty: ValType::I32,
    }
}

fn temp_slot(locals: &mut Vec<LocalSlot>) -> u32 {
    let index = locals.len() as u32;
    locals.push(LocalSlot {
        name: None,
        ty: ValType::I32,
    });
    index
}

/// Lexical environment: identifier name to local-slot index. Scopes extend
/// it by cloning, never by mutating a parent frame in place.
pub type Env = HashMap<String, u32>;

fn lookup(env: &Env, name: &str) -> Result<u32, CompileError> {
    env.get(name)
        .copied()
        .ok_or_else(|| CompileError::UnboundVariable(name.to_string()))
}

// =============================================================================
// Expression Compiler
// =============================================================================

/// Result of lowering one expression: its instruction bytes plus the local
/// table and function list as they stand afterwards. Both are threaded by
/// value through every recursive call — sibling expressions must observe
/// each other's slot allocations, and lambda bodies must append to the one
/// shared function list.
pub struct Lowered {
    pub code: Vec<u8>,
    pub locals: Vec<LocalSlot>,
    pub funcs: Vec<FuncDef>,
}

pub fn compile_expr(
    form: &Form,
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    match form {
        Form::Atom(token) => compile_atom(token, locals, env, funcs),
        Form::List(items) => compile_list(items, locals, env, funcs),
    }
}

fn compile_atom(
    token: &Token,
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let mut asm = Asm::new();
    match &token.kind {
        TokenKind::Id(name) => asm.local_get(lookup(env, name)?),
        TokenKind::Integer(value) => asm.i32_const(tagged_fixnum(*value)),
        TokenKind::Boolean(value) => asm.i32_const(tagged_boolean(*value)),
        other => {
            return Err(CompileError::UnexpectedTokenType {
                expected: "immediate value or identifier",
                found: other.to_string(),
            })
        }
    }
    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

fn compile_list(
    items: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let (head, operands) = match items.split_first() {
        Some(split) => split,
        None => {
            return Err(CompileError::NotImplemented(
                "the empty application ()".to_string(),
            ))
        }
    };
    let token = match head {
        Form::Atom(token) => token,
        Form::List(_) => {
            return Err(CompileError::UnexpectedTokenType {
                expected: "operator",
                found: head.describe(),
            })
        }
    };
    match &token.kind {
        TokenKind::Plus => compile_arith(op::I32_ADD, operands, locals, env, funcs),
        TokenKind::Minus => compile_arith(op::I32_SUB, operands, locals, env, funcs),
        TokenKind::Id(name) => match name.as_str() {
            "let" => compile_let(operands, locals, env, funcs),
            "if" => compile_if(operands, locals, env, funcs),
            "lambda" => compile_lambda(operands, locals, funcs),
            "not" => compile_not(operands, locals, env, funcs),
            "fixnum?" => compile_predicate(FIXNUM_TAG, operands, locals, env, funcs),
            "boolean?" => compile_predicate(BOOLEAN_TAG, operands, locals, env, funcs),
            "cons" => compile_cons(operands, locals, env, funcs),
            "car" => compile_pair_access(0, operands, locals, env, funcs),
            "cdr" => compile_pair_access(4, operands, locals, env, funcs),
            _ => compile_invoke(name, operands, locals, env, funcs),
        },
        other => Err(CompileError::UnexpectedTokenType {
            expected: "operator",
            found: other.to_string(),
        }),
    }
}

/// `+` and `-` fold left over their untagged operands; unary `-` negates.
fn compile_arith(
    opcode: u8,
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    if operands.is_empty() {
        return Err(CompileError::NotImplemented(
            "arithmetic with no operands".to_string(),
        ));
    }
    let mut asm = Asm::new();
    let mut locals = locals;
    let mut funcs = funcs;
    if opcode == op::I32_SUB && operands.len() == 1 {
        asm.i32_const(0);
        let lowered = compile_expr(&operands[0], locals, env, funcs)?;
        asm.raw(&lowered.code);
        locals = lowered.locals;
        funcs = lowered.funcs;
        untag_fixnum(&mut asm);
        asm.op(op::I32_SUB);
    } else {
        for (i, operand) in operands.iter().enumerate() {
            let lowered = compile_expr(operand, locals, env, funcs)?;
            asm.raw(&lowered.code);
            locals = lowered.locals;
            funcs = lowered.funcs;
            untag_fixnum(&mut asm);
            if i > 0 {
                asm.op(opcode);
            }
        }
    }
    tag_fixnum(&mut asm);
    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

fn one_operand<'a>(name: &str, operands: &'a [Form]) -> Result<&'a Form, CompileError> {
    match operands {
        [operand] => Ok(operand),
        _ => Err(CompileError::NotImplemented(format!(
            "{} with {} operands",
            name,
            operands.len()
        ))),
    }
}

fn compile_not(
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let operand = one_operand("not", operands)?;
    let lowered = compile_expr(operand, locals, env, funcs)?;
    let mut asm = Asm::new();
    asm.raw(&lowered.code);
    // Shift the tag out and test the truth bit.
    asm.i32_const(2);
    asm.op(op::I32_SHR_U);
    asm.op(op::I32_EQZ);
    tag_boolean(&mut asm);
    Ok(Lowered {
        code: asm.finish(),
        locals: lowered.locals,
        funcs: lowered.funcs,
    })
}

fn compile_predicate(
    tag: i32,
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let name = if tag == FIXNUM_TAG { "fixnum?" } else { "boolean?" };
    let operand = one_operand(name, operands)?;
    let lowered = compile_expr(operand, locals, env, funcs)?;
    let mut asm = Asm::new();
    asm.raw(&lowered.code);
    asm.i32_const(TAG_MASK);
    asm.op(op::I32_AND);
    asm.i32_const(tag);
    asm.op(op::I32_EQ);
    tag_boolean(&mut asm);
    Ok(Lowered {
        code: asm.finish(),
        locals: lowered.locals,
        funcs: lowered.funcs,
    })
}

/// Both halves are evaluated into temporaries before the allocator is
/// touched, so operand side effects (including nested allocation) land in
/// source order ahead of this cell's bump.
fn compile_cons(
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    if operands.len() != 2 {
        return Err(CompileError::NotImplemented(format!(
            "cons with {} operands",
            operands.len()
        )));
    }
    let mut asm = Asm::new();
    let lowered = compile_expr(&operands[0], locals, env, funcs)?;
    asm.raw(&lowered.code);
    let mut locals = lowered.locals;
    let mut funcs = lowered.funcs;
    let car_slot = temp_slot(&mut locals);
    asm.local_set(car_slot);

    let lowered = compile_expr(&operands[1], locals, env, funcs)?;
    asm.raw(&lowered.code);
    locals = lowered.locals;
    funcs = lowered.funcs;
    let cdr_slot = temp_slot(&mut locals);
    asm.local_set(cdr_slot);

    asm.local_get(ALLOC_PTR);
    asm.local_get(car_slot);
    asm.i32_store(0);
    asm.local_get(ALLOC_PTR);
    asm.local_get(cdr_slot);
    asm.i32_store(4);

    // The cell address, pair-tagged, is the value; then bump.
    asm.local_get(ALLOC_PTR);
    asm.i32_const(PAIR_TAG);
    asm.op(op::I32_OR);
    asm.local_get(ALLOC_PTR);
    asm.i32_const(HEAP_CELL_SIZE);
    asm.op(op::I32_ADD);
    asm.local_set(ALLOC_PTR);

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

/// `car` (offset 0) and `cdr` (offset 4). Nil passes through as nil; any
/// other non-pair operand is dereferenced blindly — undefined behavior by
/// design of the language.
fn compile_pair_access(
    offset: u32,
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let name = if offset == 0 { "car" } else { "cdr" };
    let operand = one_operand(name, operands)?;
    let lowered = compile_expr(operand, locals, env, funcs)?;
    let mut asm = Asm::new();
    asm.raw(&lowered.code);
    let mut locals = lowered.locals;
    let slot = temp_slot(&mut locals);
    asm.local_set(slot);

    asm.local_get(slot);
    asm.i32_const(NIL);
    asm.op(op::I32_NE);
    asm.if_i32();
    asm.local_get(slot);
    asm.i32_const(PAIR_TAG);
    asm.op(op::I32_SUB);
    asm.i32_load(offset);
    asm.else_();
    asm.i32_const(NIL);
    asm.end();

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs: lowered.funcs,
    })
}

fn compile_let(
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    let (bindings_form, body) = match operands.split_first() {
        Some(split) => split,
        None => {
            return Err(CompileError::NotImplemented(
                "let without a binding list".to_string(),
            ))
        }
    };
    let bindings = match bindings_form {
        Form::List(bindings) => bindings,
        other => {
            return Err(CompileError::UnexpectedTokenType {
                expected: "binding list",
                found: other.describe(),
            })
        }
    };
    if body.is_empty() {
        return Err(CompileError::NotImplemented(
            "let without a body".to_string(),
        ));
    }

    let mut locals = locals;
    let mut funcs = funcs;

    // Every bound name gets the next free slot up front; initializers are
    // compiled afterwards against the outer environment only. Bindings
    // cannot see each other (let, not let*).
    let mut inner = env.clone();
    let mut bound = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let pair = match binding {
            Form::List(pair) if pair.len() == 2 => pair,
            other => {
                return Err(CompileError::UnexpectedTokenType {
                    expected: "(name expression) binding",
                    found: other.describe(),
                })
            }
        };
        let name = pair[0]
            .as_id()
            .ok_or_else(|| CompileError::UnexpectedTokenType {
                expected: "binding name",
                found: pair[0].describe(),
            })?;
        let index = locals.len() as u32;
        locals.push(LocalSlot {
            name: Some(name.to_string()),
            ty: ValType::I32,
        });
        inner.insert(name.to_string(), index);
        bound.push((index, &pair[1]));
    }

    let mut asm = Asm::new();
    asm.block_i32();
    for (index, init) in bound {
        let lowered = compile_expr(init, locals, env, funcs)?;
        asm.raw(&lowered.code);
        locals = lowered.locals;
        funcs = lowered.funcs;
        asm.local_set(index);
    }
    for (i, expr) in body.iter().enumerate() {
        let lowered = compile_expr(expr, locals, &inner, funcs)?;
        asm.raw(&lowered.code);
        locals = lowered.locals;
        funcs = lowered.funcs;
        // Only the last body expression's value survives the block.
        if i + 1 < body.len() {
            asm.op(op::DROP);
        }
    }
    asm.end();

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

/// Only nil is falsy; every other value, including fixnum zero, takes the
/// then-branch. A missing else-branch yields nil.
fn compile_if(
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    if operands.len() < 2 || operands.len() > 3 {
        return Err(CompileError::NotImplemented(format!(
            "if with {} operands",
            operands.len()
        )));
    }
    let mut asm = Asm::new();
    let lowered = compile_expr(&operands[0], locals, env, funcs)?;
    asm.raw(&lowered.code);
    let mut locals = lowered.locals;
    let mut funcs = lowered.funcs;
    asm.i32_const(NIL);
    asm.op(op::I32_NE);
    asm.if_i32();

    let lowered = compile_expr(&operands[1], locals, env, funcs)?;
    asm.raw(&lowered.code);
    locals = lowered.locals;
    funcs = lowered.funcs;
    asm.else_();
    match operands.get(2) {
        Some(else_form) => {
            let lowered = compile_expr(else_form, locals, env, funcs)?;
            asm.raw(&lowered.code);
            locals = lowered.locals;
            funcs = lowered.funcs;
        }
        None => asm.i32_const(NIL),
    }
    asm.end();

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

/// A lambda body compiles in functional isolation — fresh local table,
/// empty environment — but appends to the shared function list, whose
/// position becomes the closure's function-table index. The call site emits
/// closure allocation into the enclosing function: marker word, table
/// index, and the raw (untagged) cell address as the value.
fn compile_lambda(
    operands: &[Form],
    locals: Vec<LocalSlot>,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    if operands.len() != 2 {
        return Err(CompileError::NotImplemented(format!(
            "lambda with {} operands",
            operands.len()
        )));
    }
    let params = match &operands[0] {
        Form::List(params) => params,
        other => {
            return Err(CompileError::UnexpectedTokenType {
                expected: "parameter list",
                found: other.describe(),
            })
        }
    };
    if !params.is_empty() {
        return Err(CompileError::NotImplemented(
            "lambda parameters".to_string(),
        ));
    }

    let lowered = compile_expr(&operands[1], vec![alloc_pointer_slot()], &Env::new(), funcs)?;
    let mut funcs = lowered.funcs;
    let index = funcs.len() as u32;
    funcs.push(FuncDef {
        name: format!("lambda_{}", index),
        params: vec![ValType::I32],
        results: vec![ValType::I32],
        locals: lowered.locals[1..].iter().map(|slot| slot.ty).collect(),
        code: lowered.code,
        export: None,
    });

    let mut asm = Asm::new();
    asm.local_get(ALLOC_PTR);
    asm.i32_const(CLOSURE_MARKER);
    asm.i32_store(0);
    asm.local_get(ALLOC_PTR);
    asm.i32_const(index as i32);
    asm.i32_store(4);
    asm.local_get(ALLOC_PTR);
    asm.local_get(ALLOC_PTR);
    asm.i32_const(HEAP_CELL_SIZE);
    asm.op(op::I32_ADD);
    asm.local_set(ALLOC_PTR);

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

/// Zero-argument closure invocation `(f)`. Two runtime assertions guard the
/// indirect call: the value's tag bits must be `00`, and the cell's first
/// word must be the closure marker. Either failing traps `unreachable`.
fn compile_invoke(
    name: &str,
    operands: &[Form],
    locals: Vec<LocalSlot>,
    env: &Env,
    funcs: Vec<FuncDef>,
) -> Result<Lowered, CompileError> {
    if !operands.is_empty() {
        return Err(CompileError::NotImplemented(format!(
            "calls with arguments: ({} ...)",
            name
        )));
    }
    let slot = lookup(env, name)?;
    let mut asm = Asm::new();

    asm.local_get(slot);
    asm.i32_const(TAG_MASK);
    asm.op(op::I32_AND);
    asm.if_empty();
    asm.op(op::UNREACHABLE);
    asm.end();

    asm.local_get(slot);
    asm.i32_load(0);
    asm.i32_const(CLOSURE_MARKER);
    asm.op(op::I32_NE);
    asm.if_empty();
    asm.op(op::UNREACHABLE);
    asm.end();

    // Thread the caller's allocation pointer; the table index lives in the
    // closure's second word. All signatures are identical, so type 0 fits.
    asm.local_get(ALLOC_PTR);
    asm.local_get(slot);
    asm.i32_load(4);
    asm.call_indirect(0);

    Ok(Lowered {
        code: asm.finish(),
        locals,
        funcs,
    })
}

// =============================================================================
// Top-Level Entry Points
// =============================================================================

/// Lower a parsed program to a module descriptor. Lambdas occupy function
/// indices in the order their bodies finish compiling; the implicit entry
/// function is appended last, named and exported as `entry`.
pub fn lower_program(form: &Form, memory: MemoryLimits) -> Result<Module, CompileError> {
    let lowered = compile_expr(form, vec![alloc_pointer_slot()], &Env::new(), Vec::new())?;
    let mut funcs = lowered.funcs;
    funcs.push(FuncDef {
        name: ENTRY_NAME.to_string(),
        params: vec![ValType::I32],
        results: vec![ValType::I32],
        locals: lowered.locals[1..].iter().map(|slot| slot.ty).collect(),
        code: lowered.code,
        export: Some(ENTRY_NAME.to_string()),
    });
    Ok(Module { memory, funcs })
}

/// Compile one source program to a complete binary module.
pub fn compile(source: &str) -> Result<Vec<u8>, CompileError> {
    compile_with_memory(source, MemoryLimits::default())
}

pub fn compile_with_memory(source: &str, memory: MemoryLimits) -> Result<Vec<u8>, CompileError> {
    let form = parser::parse_source(source)?;
    Ok(lower_program(&form, memory)?.encode())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_source;

    fn lower(source: &str) -> Module {
        lower_program(&parse_source(source).unwrap(), MemoryLimits::default())
            .expect("lowering failed")
    }

    #[test]
    fn test_tagged_immediates() {
        assert_eq!(tagged_fixnum(0), 1);
        assert_eq!(tagged_fixnum(238), 953);
        assert_eq!(tagged_fixnum(-55), -219);
        assert_eq!(tagged_boolean(false), 2);
        assert_eq!(tagged_boolean(false), NIL);
        assert_eq!(tagged_boolean(true), 6);
        assert_eq!(tagged_pair(8), 11);
    }

    #[test]
    fn test_literal_program() {
        let module = lower("5");
        assert_eq!(module.funcs.len(), 1);
        let entry = &module.funcs[0];
        assert_eq!(entry.name, "entry");
        assert_eq!(entry.export.as_deref(), Some("entry"));
        assert_eq!(entry.params, vec![ValType::I32]);
        assert_eq!(entry.results, vec![ValType::I32]);
        assert!(entry.locals.is_empty());
        // i32.const 21  (5 << 2 | fixnum tag)
        assert_eq!(entry.code, vec![0x41, 0x15]);
    }

    #[test]
    fn test_let_assigns_slots_in_declaration_order() {
        let module = lower("(let ((a 0x1) (b 2)) (+ a b))");
        // Two named slots beyond the allocation-pointer parameter.
        assert_eq!(module.funcs[0].locals, vec![ValType::I32, ValType::I32]);
    }

    #[test]
    fn test_sibling_expressions_use_distinct_slots() {
        // Each cons takes two temporaries and each car one more; siblings
        // must not collide.
        let module = lower("(+ (car (cons 1 2)) (car (cons 3 4)))");
        assert_eq!(module.funcs[0].locals.len(), 6);
    }

    #[test]
    fn test_lambda_function_order() {
        let module = lower("(let ((f (lambda () 1)) (g (lambda () 2))) (f))");
        let names: Vec<&str> = module.funcs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["lambda_0", "lambda_1", "entry"]);
        assert!(module.funcs[0].export.is_none());
        assert!(module.funcs[1].export.is_none());
        assert_eq!(module.funcs[2].export.as_deref(), Some("entry"));
    }

    #[test]
    fn test_nested_lambda_appends_inner_first() {
        let module = lower("(let ((f (lambda () (lambda () 1)))) (f))");
        let names: Vec<&str> = module.funcs.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["lambda_0", "lambda_1", "entry"]);
        // The inner closure is allocated by the outer lambda's body, which
        // therefore stores table index 0.
        assert!(module.funcs[1].code.windows(2).any(|w| w == [0x41, 0x00]));
    }

    #[test]
    fn test_lambda_body_is_isolated() {
        // The body starts from an empty environment; outer bindings are
        // invisible.
        let result = compile("(let ((a 1) (f (lambda () a))) (f))");
        assert!(matches!(
            result,
            Err(CompileError::UnboundVariable(name)) if name == "a"
        ));
    }

    #[test]
    fn test_unbound_variable() {
        assert!(matches!(
            compile("x"),
            Err(CompileError::UnboundVariable(name)) if name == "x"
        ));
        assert!(matches!(
            compile("(f)"),
            Err(CompileError::UnboundVariable(name)) if name == "f"
        ));
    }

    #[test]
    fn test_not_implemented() {
        assert!(matches!(
            compile("(lambda (x) x)"),
            Err(CompileError::NotImplemented(_))
        ));
        assert!(matches!(
            compile("(foo 1 2)"),
            Err(CompileError::NotImplemented(_))
        ));
        assert!(matches!(compile("(+)"), Err(CompileError::NotImplemented(_))));
        assert!(matches!(compile("()"), Err(CompileError::NotImplemented(_))));
        assert!(matches!(
            compile("(cons 1)"),
            Err(CompileError::NotImplemented(_))
        ));
        assert!(matches!(
            compile("(if 1)"),
            Err(CompileError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_unexpected_token_type() {
        assert!(matches!(
            compile("(1 2)"),
            Err(CompileError::UnexpectedTokenType { .. })
        ));
        assert!(matches!(
            compile("(let x 1)"),
            Err(CompileError::UnexpectedTokenType { .. })
        ));
        assert!(matches!(
            compile("(let ((5 1)) 2)"),
            Err(CompileError::UnexpectedTokenType { .. })
        ));
        assert!(matches!(
            compile("((lambda () 1))"),
            Err(CompileError::UnexpectedTokenType { .. })
        ));
    }

    #[test]
    fn test_compiled_modules_validate() {
        let programs = [
            "238",
            "(not t)",
            "(+ 1 2 3)",
            "(let ((a 255) (b 1)) (+ a b))",
            "(if nil 1 2)",
            "(cons 8 (cons 5 nil))",
            "(car (cons 13 17))",
            "(let ((f (lambda () (+ 7 3)))) (f))",
        ];
        for source in programs {
            let bytes = compile(source).expect("compile failed");
            let result = wasmparser::Validator::new().validate_all(&bytes);
            assert!(
                result.is_ok(),
                "module for {:?} failed validation: {:?}",
                source,
                result.err()
            );
        }
    }
}
