//! Binary module assembler.
//!
//! Serializes a list of lowered function descriptors into a complete
//! WebAssembly binary: magic header, then type, function, table, memory,
//! export, element and code sections, and a trailing custom `name` section
//! with per-function debug names. Counts and payload sizes are unsigned
//! LEB128; `i32.const` operands are signed LEB128.
//!
//! This stage is a structural serializer only — it performs no semantic
//! validation of the instruction bytes it frames.

use std::fmt;

/// Binary format version emitted in the module header.
pub const WASM_VERSION: u32 = 1;

// Section ids, in the order they are emitted.
const SEC_CUSTOM: u8 = 0;
const SEC_TYPE: u8 = 1;
const SEC_FUNCTION: u8 = 3;
const SEC_TABLE: u8 = 4;
const SEC_MEMORY: u8 = 5;
const SEC_EXPORT: u8 = 7;
const SEC_ELEMENT: u8 = 9;
const SEC_CODE: u8 = 10;

const FUNC_TYPE: u8 = 0x60;
const FUNCREF: u8 = 0x70;
const LIMITS_MIN_MAX: u8 = 0x01;
const EXPORT_FUNC: u8 = 0x00;
const NAME_SUBSEC_FUNCTIONS: u8 = 0x01;

const OP_I32_CONST: u8 = 0x41;
const OP_END: u8 = 0x0b;

// ─── LEB128 ──────────────────────────────────────────────────────────────────

/// Append an unsigned LEB128 encoding of `value`.
pub fn write_u32(out: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Append a signed LEB128 encoding of `value`.
pub fn write_i32(out: &mut Vec<u8>, mut value: i32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7; // arithmetic shift keeps the sign
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// Local and value type. The tagged-value runtime is built entirely from
/// 32-bit words, so this is the only type the compiler ever emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
}

impl ValType {
    fn byte(self) -> u8 {
        match self {
            ValType::I32 => 0x7f,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
        }
    }
}

/// One lowered function. `locals` lists the declared locals beyond the
/// parameters; `code` is the raw instruction bytes without the terminating
/// `end` (the assembler frames that).
#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    pub locals: Vec<ValType>,
    pub code: Vec<u8>,
    pub export: Option<String>,
}

/// Linear memory bounds, in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLimits {
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        MemoryLimits {
            initial_pages: 2,
            maximum_pages: 16,
        }
    }
}

/// The final artifact handed to the assembler: memory bounds plus the
/// ordered function list. List position is the function index used by the
/// function table and the export/name sections.
#[derive(Debug, Clone)]
pub struct Module {
    pub memory: MemoryLimits,
    pub funcs: Vec<FuncDef>,
}

// ─── Assembly ────────────────────────────────────────────────────────────────

fn section(out: &mut Vec<u8>, id: u8, payload: &[u8]) {
    out.push(id);
    write_u32(out, payload.len() as u32);
    out.extend_from_slice(payload);
}

/// Run-length encode consecutive equal local types for the code-section
/// local declaration header.
fn local_groups(locals: &[ValType]) -> Vec<(u32, ValType)> {
    let mut groups: Vec<(u32, ValType)> = Vec::new();
    for &ty in locals {
        match groups.last_mut() {
            Some((count, t)) if *t == ty => *count += 1,
            _ => groups.push((1, ty)),
        }
    }
    groups
}

impl Module {
    /// Serialize the whole module.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"\0asm");
        out.extend_from_slice(&WASM_VERSION.to_le_bytes());

        let func_count = self.funcs.len() as u32;

        // Type section: one signature entry per function, duplicated rather
        // than deduplicated, so function i always uses type i.
        let mut payload = Vec::new();
        write_u32(&mut payload, func_count);
        for func in &self.funcs {
            payload.push(FUNC_TYPE);
            write_u32(&mut payload, func.params.len() as u32);
            for param in &func.params {
                payload.push(param.byte());
            }
            write_u32(&mut payload, func.results.len() as u32);
            for result in &func.results {
                payload.push(result.byte());
            }
        }
        section(&mut out, SEC_TYPE, &payload);

        // Function section: signature index per function, declaration order.
        let mut payload = Vec::new();
        write_u32(&mut payload, func_count);
        for index in 0..func_count {
            write_u32(&mut payload, index);
        }
        section(&mut out, SEC_FUNCTION, &payload);

        // Table section: one funcref table sized to the function list.
        let mut payload = Vec::new();
        write_u32(&mut payload, 1);
        payload.push(FUNCREF);
        payload.push(LIMITS_MIN_MAX);
        write_u32(&mut payload, func_count);
        write_u32(&mut payload, func_count);
        section(&mut out, SEC_TABLE, &payload);

        // Memory section.
        let mut payload = Vec::new();
        write_u32(&mut payload, 1);
        payload.push(LIMITS_MIN_MAX);
        write_u32(&mut payload, self.memory.initial_pages);
        write_u32(&mut payload, self.memory.maximum_pages);
        section(&mut out, SEC_MEMORY, &payload);

        // Export section: only functions carrying an export name.
        let exports: Vec<(u32, &str)> = self
            .funcs
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.export.as_deref().map(|name| (i as u32, name)))
            .collect();
        let mut payload = Vec::new();
        write_u32(&mut payload, exports.len() as u32);
        for (index, name) in exports {
            write_u32(&mut payload, name.len() as u32);
            payload.extend_from_slice(name.as_bytes());
            payload.push(EXPORT_FUNC);
            write_u32(&mut payload, index);
        }
        section(&mut out, SEC_EXPORT, &payload);

        // Element section: one active segment filling table slots 0..n with
        // the function indices, enabling call_indirect by list position.
        let mut payload = Vec::new();
        write_u32(&mut payload, 1);
        payload.push(0x00); // active segment, table 0
        payload.push(OP_I32_CONST);
        write_i32(&mut payload, 0);
        payload.push(OP_END);
        write_u32(&mut payload, func_count);
        for index in 0..func_count {
            write_u32(&mut payload, index);
        }
        section(&mut out, SEC_ELEMENT, &payload);

        // Code section: each body is length-prefixed and carries its own
        // local declarations ahead of the instruction bytes.
        let mut payload = Vec::new();
        write_u32(&mut payload, func_count);
        for func in &self.funcs {
            let mut body = Vec::new();
            let groups = local_groups(&func.locals);
            write_u32(&mut body, groups.len() as u32);
            for (count, ty) in groups {
                write_u32(&mut body, count);
                body.push(ty.byte());
            }
            body.extend_from_slice(&func.code);
            body.push(OP_END);
            write_u32(&mut payload, body.len() as u32);
            payload.extend_from_slice(&body);
        }
        section(&mut out, SEC_CODE, &payload);

        // Custom name section: function-names subsection, one entry per
        // function in list order.
        let mut names = Vec::new();
        write_u32(&mut names, func_count);
        for (index, func) in self.funcs.iter().enumerate() {
            write_u32(&mut names, index as u32);
            write_u32(&mut names, func.name.len() as u32);
            names.extend_from_slice(func.name.as_bytes());
        }
        let mut payload = Vec::new();
        write_u32(&mut payload, 4);
        payload.extend_from_slice(b"name");
        payload.push(NAME_SUBSEC_FUNCTIONS);
        write_u32(&mut payload, names.len() as u32);
        payload.extend_from_slice(&names);
        section(&mut out, SEC_CUSTOM, &payload);

        out
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn u32_bytes(value: u32) -> Vec<u8> {
        let mut out = Vec::new();
        write_u32(&mut out, value);
        out
    }

    fn i32_bytes(value: i32) -> Vec<u8> {
        let mut out = Vec::new();
        write_i32(&mut out, value);
        out
    }

    #[test]
    fn test_leb128_unsigned() {
        assert_eq!(u32_bytes(0), vec![0x00]);
        assert_eq!(u32_bytes(7), vec![0x07]);
        assert_eq!(u32_bytes(127), vec![0x7f]);
        assert_eq!(u32_bytes(128), vec![0x80, 0x01]);
        assert_eq!(u32_bytes(624485), vec![0xe5, 0x8e, 0x26]);
        assert_eq!(
            u32_bytes(u32::MAX),
            vec![0xff, 0xff, 0xff, 0xff, 0x0f]
        );
    }

    #[test]
    fn test_leb128_signed() {
        assert_eq!(i32_bytes(0), vec![0x00]);
        assert_eq!(i32_bytes(2), vec![0x02]);
        assert_eq!(i32_bytes(63), vec![0x3f]);
        assert_eq!(i32_bytes(64), vec![0xc0, 0x00]);
        assert_eq!(i32_bytes(-1), vec![0x7f]);
        assert_eq!(i32_bytes(-64), vec![0x40]);
        assert_eq!(i32_bytes(-65), vec![0xbf, 0x7f]);
        assert_eq!(i32_bytes(-123456), vec![0xc0, 0xbb, 0x78]);
        assert_eq!(
            i32_bytes(i32::MIN),
            vec![0x80, 0x80, 0x80, 0x80, 0x78]
        );
    }

    fn single_func_module() -> Module {
        // entry: (i32) -> i32, body `local.get 0`
        Module {
            memory: MemoryLimits::default(),
            funcs: vec![FuncDef {
                name: "entry".to_string(),
                params: vec![ValType::I32],
                results: vec![ValType::I32],
                locals: vec![],
                code: vec![0x20, 0x00],
                export: Some("entry".to_string()),
            }],
        }
    }

    #[test]
    fn test_module_header() {
        let bytes = single_func_module().encode();
        assert_eq!(&bytes[0..4], b"\0asm");
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
    }

    #[test]
    fn test_section_order_and_framing() {
        // Walk the emitted container section by section: every declared
        // payload length must match the bytes that follow it, and the ids
        // must appear in the fixed emission order.
        let bytes = single_func_module().encode();
        let mut pos = 8;
        let mut ids = Vec::new();
        while pos < bytes.len() {
            let id = bytes[pos];
            pos += 1;
            let mut size: u32 = 0;
            let mut shift = 0;
            loop {
                let byte = bytes[pos];
                pos += 1;
                size |= ((byte & 0x7f) as u32) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            pos += size as usize;
            assert!(pos <= bytes.len(), "section {} overruns the buffer", id);
            ids.push(id);
        }
        assert_eq!(pos, bytes.len(), "trailing garbage after last section");
        assert_eq!(ids, vec![1, 3, 4, 5, 7, 9, 10, 0]);
    }

    #[test]
    fn test_local_groups_run_length() {
        assert!(local_groups(&[]).is_empty());
        assert_eq!(
            local_groups(&[ValType::I32, ValType::I32, ValType::I32]),
            vec![(3, ValType::I32)]
        );
    }

    #[test]
    fn test_module_validates() {
        let bytes = single_func_module().encode();
        let result = wasmparser::Validator::new().validate_all(&bytes);
        assert!(result.is_ok(), "validation failed: {:?}", result.err());
    }

    #[test]
    fn test_two_function_module_validates() {
        // A lambda ahead of the entry function, called indirectly.
        let lambda = FuncDef {
            name: "lambda_0".to_string(),
            params: vec![ValType::I32],
            results: vec![ValType::I32],
            locals: vec![],
            code: vec![0x41, 0x29], // i32.const 41
            export: None,
        };
        let mut entry_code = vec![0x20, 0x00]; // local.get 0 (argument)
        entry_code.extend_from_slice(&[0x41, 0x00]); // i32.const 0 (table slot)
        entry_code.extend_from_slice(&[0x11, 0x00, 0x00]); // call_indirect type 0, table 0
        let entry = FuncDef {
            name: "entry".to_string(),
            params: vec![ValType::I32],
            results: vec![ValType::I32],
            locals: vec![ValType::I32],
            code: entry_code,
            export: Some("entry".to_string()),
        };
        let module = Module {
            memory: MemoryLimits::default(),
            funcs: vec![lambda, entry],
        };
        let bytes = module.encode();
        let result = wasmparser::Validator::new().validate_all(&bytes);
        assert!(result.is_ok(), "validation failed: {:?}", result.err());
    }
}
