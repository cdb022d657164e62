// File: src/bytecode.rs
//
// Bytecode instruction set, compiled-function representation, and the MPBC binary
// serialization format for the Skiff VM.
//
// Unlike the teacher's work-in-progress `bytecode.rs` (a `Vec<OpCode>` of structured,
// field-carrying enum variants), instructions here are raw bytes: one opcode byte
// followed by its operand bytes, exactly as laid out in the wire format. This is what
// makes "serialize the chunk to MPBC bytes" and "fetch-decode over the bytecode blob"
// the same representation, per spec §4.3/§6.

use std::rc::Rc;

/// One-byte opcode discriminants. Multi-byte operands that follow an opcode in the
/// code stream are always big-endian, per spec §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Pop = 0,
    Dup = 1,
    Dup2 = 2,
    Swap = 3,
    SwapUnder = 4,
    Rot3Under = 5,
    Const = 6,
    Null = 7,
    True = 8,
    False = 9,
    GetLocal = 10,
    SetLocal = 11,
    GetGlobal = 12,
    SetGlobal = 13,
    DefineGlobal = 14,
    DefineRootGlobal = 15,
    GetUpvalue = 16,
    SetUpvalue = 17,
    CloseUpvalue = 18,
    Add = 19,
    Sub = 20,
    Mul = 21,
    Div = 22,
    Mod = 23,
    Neg = 24,
    BitAnd = 25,
    BitOr = 26,
    BitXor = 27,
    BitNot = 28,
    Shl = 29,
    Shr = 30,
    Not = 31,
    And = 32,
    Or = 33,
    Eq = 34,
    Ne = 35,
    Lt = 36,
    Le = 37,
    Gt = 38,
    Ge = 39,
    Jump = 40,
    JumpIfFalse = 41,
    JumpIfTrue = 42,
    JumpIfNotNull = 43,
    Loop = 44,
    Call = 45,
    Return = 46,
    Closure = 47,
    NewArray = 48,
    NewObject = 49,
    GetField = 50,
    SetField = 51,
    GetIndex = 52,
    SetIndex = 53,
    Class = 54,
    Inherit = 55,
    Method = 56,
    StaticMethod = 57,
    StaticField = 58,
    GetProperty = 59,
    SetProperty = 60,
    GetSuper = 61,
    Invoke = 62,
    SuperInvoke = 63,
    Import = 64,
    This = 65,
    BuildString = 66,
    GetIter = 67,
    ForIter = 68,
    ForIterKV = 69,
    ForIterLocal = 70,
    ForIterKVLocal = 71,
    CloseIter = 72,
    SetupTry = 73,
    Throw = 74,
    EndTry = 75,
    EndFinally = 76,
}

impl OpCode {
    pub fn from_byte(b: u8) -> Option<OpCode> {
        const LAST: u8 = OpCode::EndFinally as u8;
        match b {
            0..=LAST => Some(unsafe { std::mem::transmute::<u8, OpCode>(b) }),
            _ => None,
        }
    }
}

/// Descriptor for one upvalue captured by a closure, emitted alongside `Closure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// `true`: capture the *directly* enclosing function's local at `index`.
    /// `false`: forward the enclosing function's own upvalue at `index`.
    pub is_local: bool,
    pub index: u16,
}

/// Constants that can live in a prototype's constant pool.
#[derive(Debug, Clone)]
pub enum Constant {
    Null,
    Number(f64),
    Str(Rc<str>),
    Bool(bool),
    Function(Rc<FunctionPrototype>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Null, Constant::Null) => true,
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            (Constant::Bool(a), Constant::Bool(b)) => a == b,
            // Function constants are never deduplicated against each other: each
            // function literal is its own prototype even if byte-identical.
            _ => false,
        }
    }
}

/// Compile-time description of one function body: bytecode, constants, debug info,
/// and the upvalue descriptor list a closure over it must honor.
#[derive(Debug, Clone)]
pub struct FunctionPrototype {
    pub name: Rc<str>,
    /// Name of the class this prototype is a method of, if any (used to resolve `super`).
    pub class_name: Option<Rc<str>>,
    pub arity: u8,
    pub has_rest_param: bool,
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    /// Parallel to `code`: `lines[i]` is the source line of `code[i]`.
    pub lines: Vec<u16>,
    pub upvalues: Vec<UpvalueDesc>,
    /// Debug-only local variable names, indexed by slot.
    pub local_names: Vec<Rc<str>>,
    /// `Some(names)` restricts a module body's exports to `names`; `None` exports
    /// every top-level binding. Only meaningful for a module's top-level prototype.
    pub exports: Option<Vec<Rc<str>>>,
    /// Whether this is a class constructor (returns `this` implicitly).
    pub is_initializer: bool,
}

impl FunctionPrototype {
    pub fn line_for_offset(&self, offset: usize) -> u16 {
        self.lines.get(offset).copied().unwrap_or_else(|| self.lines.last().copied().unwrap_or(0))
    }

    /// Intern a constant, deduplicating scalar constants that already match.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        if let Some(idx) = self.constants.iter().position(|c| c == &constant) {
            return idx as u16;
        }
        let idx = self.constants.len();
        assert!(idx < u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        idx as u16
    }
}

pub const MAGIC: [u8; 4] = *b"MPBC";
pub const VERSION: u8 = 4;

/// Errors raised while deserializing a prebuilt bytecode blob (spec §7 "Bytecode load
/// error").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    BadMagic,
    UnsupportedVersion(u8),
    Truncated,
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::BadMagic => write!(f, "not an MPBC bytecode blob (bad magic)"),
            LoadError::UnsupportedVersion(v) => write!(f, "unsupported bytecode version {v}"),
            LoadError::Truncated => write!(f, "truncated bytecode stream"),
        }
    }
}

impl std::error::Error for LoadError {}

mod wire {
    use super::LoadError;

    pub fn write_u8(out: &mut Vec<u8>, v: u8) {
        out.push(v);
    }

    pub fn write_i32(out: &mut Vec<u8>, v: i32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(out: &mut Vec<u8>, v: f64) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u16(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_str(out: &mut Vec<u8>, s: &str) {
        write_i32(out, s.len() as i32);
        out.extend_from_slice(s.as_bytes());
    }

    pub struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Reader { buf, pos: 0 }
        }

        pub fn read_u8(&mut self) -> Result<u8, LoadError> {
            let b = *self.buf.get(self.pos).ok_or(LoadError::Truncated)?;
            self.pos += 1;
            Ok(b)
        }

        pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
            let end = self.pos.checked_add(n).ok_or(LoadError::Truncated)?;
            let slice = self.buf.get(self.pos..end).ok_or(LoadError::Truncated)?;
            self.pos = end;
            Ok(slice)
        }

        pub fn read_i32(&mut self) -> Result<i32, LoadError> {
            let bytes = self.read_bytes(4)?;
            Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
        }

        pub fn read_f64(&mut self) -> Result<f64, LoadError> {
            let bytes = self.read_bytes(8)?;
            Ok(f64::from_le_bytes(bytes.try_into().unwrap()))
        }

        pub fn read_u16(&mut self) -> Result<u16, LoadError> {
            let bytes = self.read_bytes(2)?;
            Ok(u16::from_be_bytes(bytes.try_into().unwrap()))
        }

        pub fn read_str(&mut self) -> Result<String, LoadError> {
            let len = self.read_i32()?;
            if len < 0 {
                return Err(LoadError::Truncated);
            }
            let bytes = self.read_bytes(len as usize)?;
            String::from_utf8(bytes.to_vec()).map_err(|_| LoadError::Truncated)
        }
    }
}

/// Serialize a prototype to the bit-exact MPBC format described in spec §6.
pub fn serialize(proto: &FunctionPrototype) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    wire::write_u8(&mut out, VERSION);
    write_prototype_body(&mut out, proto);
    out
}

fn write_prototype_body(out: &mut Vec<u8>, proto: &FunctionPrototype) {
    wire::write_i32(out, proto.constants.len() as i32);
    for c in &proto.constants {
        write_constant(out, c);
    }
    wire::write_i32(out, proto.code.len() as i32);
    out.extend_from_slice(&proto.code);
    wire::write_i32(out, proto.lines.len() as i32);
    for &line in &proto.lines {
        wire::write_u16(out, line);
    }
    wire::write_u8(out, proto.has_rest_param as u8);
}

fn write_constant(out: &mut Vec<u8>, c: &Constant) {
    match c {
        Constant::Null => wire::write_u8(out, 0),
        Constant::Number(n) => {
            wire::write_u8(out, 1);
            wire::write_f64(out, *n);
        }
        Constant::Str(s) => {
            wire::write_u8(out, 2);
            wire::write_str(out, s);
        }
        Constant::Bool(b) => {
            wire::write_u8(out, 3);
            wire::write_u8(out, if *b { 1 } else { 0 });
        }
        Constant::Function(proto) => {
            wire::write_u8(out, 4);
            wire::write_str(out, &proto.name);
            wire::write_str(out, proto.class_name.as_deref().unwrap_or(""));
            wire::write_i32(out, proto.arity as i32);
            wire::write_i32(out, proto.upvalues.len() as i32);
            let mut body = Vec::new();
            write_prototype_body(&mut body, proto);
            wire::write_i32(out, body.len() as i32);
            out.extend_from_slice(&body);
        }
    }
}

/// Deserialize a prototype previously produced by [`serialize`].
///
/// Note: per spec §6 the wire format does not re-encode debug-only local names or
/// module exports, so a round-tripped prototype (top-level or nested) carries empty
/// debug info for those two fields. `has_rest_param` round-trips exactly since it's
/// semantically load-bearing (it changes arity-checking and argument-binding
/// behavior at call time, not just debugging), unlike `local_names`/`exports`.
pub fn deserialize(bytes: &[u8]) -> Result<FunctionPrototype, LoadError> {
    let mut r = wire::Reader::new(bytes);
    let magic = r.read_bytes(4)?;
    if magic != MAGIC {
        return Err(LoadError::BadMagic);
    }
    let version = r.read_u8()?;
    if version != VERSION {
        return Err(LoadError::UnsupportedVersion(version));
    }
    read_prototype_body(&mut r, "<script>".into(), None, 0)
}

fn read_prototype_body(
    r: &mut wire::Reader,
    name: Rc<str>,
    class_name: Option<Rc<str>>,
    arity: u8,
) -> Result<FunctionPrototype, LoadError> {
    let constant_count = r.read_i32()?;
    if constant_count < 0 {
        return Err(LoadError::Truncated);
    }
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        constants.push(read_constant(r)?);
    }
    let code_len = r.read_i32()?;
    if code_len < 0 {
        return Err(LoadError::Truncated);
    }
    let code = r.read_bytes(code_len as usize)?.to_vec();
    let line_count = r.read_i32()?;
    if line_count < 0 {
        return Err(LoadError::Truncated);
    }
    let mut lines = Vec::with_capacity(line_count as usize);
    for _ in 0..line_count {
        lines.push(r.read_u16()?);
    }
    let has_rest_param = r.read_u8()? != 0;
    Ok(FunctionPrototype {
        name,
        class_name,
        arity,
        has_rest_param,
        code,
        constants,
        lines,
        upvalues: Vec::new(),
        local_names: Vec::new(),
        exports: None,
        is_initializer: false,
    })
}

/// Operands consumed by each opcode after its byte, for disassembly. Must track
/// `dispatch`'s read order in `vm.rs` exactly.
enum Operands {
    None,
    U8,
    U16,
    I16,
    ConstU16,
    ConstU16U8,
    U8I16,
    TryDesc,
    ClosureDesc,
}

fn operand_shape(op: OpCode) -> Operands {
    use OpCode::*;
    match op {
        Pop | Dup | Dup2 | Swap | SwapUnder | Rot3Under | Null | True | False | Add | Sub | Mul | Div | Mod | Neg
        | BitAnd | BitOr | BitXor | BitNot | Shl | Shr | Not | And | Or | Eq | Ne | Lt | Le | Gt | Ge | Return
        | NewObject | GetIndex | SetIndex | Inherit | This | GetIter | ForIter | ForIterKV | CloseIter | Throw
        | EndTry | EndFinally | CloseUpvalue => Operands::None,
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => Operands::U8,
        Const | GetGlobal | SetGlobal | DefineGlobal | DefineRootGlobal | Class | Import | Method | StaticMethod
        | StaticField | GetProperty | SetProperty | GetField | SetField | GetSuper => Operands::ConstU16,
        Invoke | SuperInvoke => Operands::ConstU16U8,
        Jump | JumpIfFalse | JumpIfTrue | JumpIfNotNull => Operands::I16,
        ForIterLocal | ForIterKVLocal => Operands::U8I16,
        Loop | BuildString | NewArray => Operands::U16,
        SetupTry => Operands::TryDesc,
        Closure => Operands::ClosureDesc,
    }
}

/// Renders `proto`'s bytecode as a human-readable listing, spec §4.9's `disasm`
/// subcommand, recursing into nested function/closure constants.
pub fn disassemble(proto: &FunctionPrototype) -> String {
    let mut out = String::new();
    disassemble_into(proto, &mut out);
    out
}

fn disassemble_into(proto: &FunctionPrototype, out: &mut String) {
    out.push_str(&format!("== {} ==\n", proto.name));
    let mut offset = 0usize;
    while offset < proto.code.len() {
        offset = disassemble_instruction(proto, offset, out);
    }
    for constant in &proto.constants {
        if let Constant::Function(nested) = constant {
            out.push('\n');
            disassemble_into(nested, out);
        }
    }
}

fn disassemble_instruction(proto: &FunctionPrototype, offset: usize, out: &mut String) -> usize {
    let line = proto.line_for_offset(offset);
    let byte = proto.code[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        out.push_str(&format!("{offset:04} {line:4} UNKNOWN({byte})\n"));
        return offset + 1;
    };

    let read_u8 = |at: usize| proto.code[at];
    let read_u16 = |at: usize| u16::from_be_bytes([proto.code[at], proto.code[at + 1]]);
    let read_i16 = |at: usize| i16::from_be_bytes([proto.code[at], proto.code[at + 1]]);

    match operand_shape(op) {
        Operands::None => {
            out.push_str(&format!("{offset:04} {line:4} {op:?}\n"));
            offset + 1
        }
        Operands::U8 => {
            let a = read_u8(offset + 1);
            out.push_str(&format!("{offset:04} {line:4} {op:?} {a}\n"));
            offset + 2
        }
        Operands::U16 => {
            let a = read_u16(offset + 1);
            out.push_str(&format!("{offset:04} {line:4} {op:?} {a}\n"));
            offset + 3
        }
        Operands::I16 => {
            let a = read_i16(offset + 1);
            out.push_str(&format!("{offset:04} {line:4} {op:?} {a} -> {}\n", offset as i64 + 3 + a as i64));
            offset + 3
        }
        Operands::U8I16 => {
            let slot = read_u8(offset + 1);
            let a = read_i16(offset + 2);
            out.push_str(&format!("{offset:04} {line:4} {op:?} {slot} {a} -> {}\n", offset as i64 + 4 + a as i64));
            offset + 4
        }
        Operands::ConstU16 => {
            let idx = read_u16(offset + 1);
            let name = proto.constants.get(idx as usize).map(describe_constant).unwrap_or_else(|| "?".into());
            out.push_str(&format!("{offset:04} {line:4} {op:?} {idx} ; {name}\n"));
            offset + 3
        }
        Operands::ConstU16U8 => {
            let idx = read_u16(offset + 1);
            let argc = read_u8(offset + 3);
            let name = proto.constants.get(idx as usize).map(describe_constant).unwrap_or_else(|| "?".into());
            out.push_str(&format!("{offset:04} {line:4} {op:?} {idx} {argc} ; {name}\n"));
            offset + 4
        }
        Operands::TryDesc => {
            let catch = read_u16(offset + 1);
            let finally = read_u16(offset + 3);
            let catch_slot = read_u8(offset + 5);
            out.push_str(&format!("{offset:04} {line:4} {op:?} catch={catch:#06x} finally={finally:#06x} slot={catch_slot}\n"));
            offset + 6
        }
        Operands::ClosureDesc => {
            let idx = read_u16(offset + 1);
            let name = proto.constants.get(idx as usize).map(describe_constant).unwrap_or_else(|| "?".into());
            let upvalue_count = read_u8(offset + 3) as usize;
            out.push_str(&format!("{offset:04} {line:4} {op:?} {idx} ; {name}\n"));
            let mut next = offset + 4;
            for _ in 0..upvalue_count {
                let is_local = proto.code[next];
                let index = read_u16(next + 1);
                out.push_str(&format!("     |                  {} {index}\n", if is_local != 0 { "local" } else { "upvalue" }));
                next += 3;
            }
            next
        }
    }
}

fn describe_constant(c: &Constant) -> String {
    match c {
        Constant::Null => "null".to_string(),
        Constant::Bool(b) => b.to_string(),
        Constant::Number(n) => n.to_string(),
        Constant::Str(s) => format!("{s:?}"),
        Constant::Function(f) => format!("<fn {}>", f.name),
    }
}

fn read_constant(r: &mut wire::Reader) -> Result<Constant, LoadError> {
    let tag = r.read_u8()?;
    match tag {
        0 => Ok(Constant::Null),
        1 => Ok(Constant::Number(r.read_f64()?)),
        2 => Ok(Constant::Str(r.read_str()?.into())),
        3 => Ok(Constant::Bool(r.read_u8()? != 0)),
        4 => {
            let name = r.read_str()?;
            let class_name_raw = r.read_str()?;
            let class_name = if class_name_raw.is_empty() { None } else { Some(class_name_raw.into()) };
            let arity = r.read_i32()?;
            let _upvalue_count = r.read_i32()?;
            let body_len = r.read_i32()?;
            if body_len < 0 {
                return Err(LoadError::Truncated);
            }
            let body_bytes = r.read_bytes(body_len as usize)?;
            let mut nested = wire::Reader::new(body_bytes);
            let proto = read_prototype_body(&mut nested, name.into(), class_name, arity.max(0) as u8)?;
            Ok(Constant::Function(Rc::new(proto)))
        }
        _ => Err(LoadError::Truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proto() -> FunctionPrototype {
        FunctionPrototype {
            name: "main".into(),
            class_name: None,
            arity: 0,
            has_rest_param: false,
            code: vec![OpCode::Const as u8, 0, 0, OpCode::Return as u8],
            constants: vec![Constant::Number(42.0)],
            lines: vec![1, 1, 1, 1],
            upvalues: vec![],
            local_names: vec![],
            exports: None,
            is_initializer: false,
        }
    }

    #[test]
    fn opcode_roundtrips_through_byte() {
        assert_eq!(OpCode::from_byte(OpCode::Return as u8), Some(OpCode::Return));
        assert_eq!(OpCode::from_byte(OpCode::EndFinally as u8), Some(OpCode::EndFinally));
        assert_eq!(OpCode::from_byte(200), None);
    }

    #[test]
    fn serialize_deserialize_roundtrip_preserves_code_and_constants() {
        let proto = sample_proto();
        let bytes = serialize(&proto);
        assert_eq!(&bytes[0..4], &MAGIC);
        assert_eq!(bytes[4], VERSION);
        let back = deserialize(&bytes).expect("valid blob");
        assert_eq!(back.code, proto.code);
        assert_eq!(back.lines, proto.lines);
        assert_eq!(back.constants.len(), proto.constants.len());
        match (&back.constants[0], &proto.constants[0]) {
            (Constant::Number(a), Constant::Number(b)) => assert_eq!(a, b),
            _ => panic!("constant kind mismatch"),
        }
    }

    #[test]
    fn roundtrip_preserves_has_rest_param() {
        let mut proto = sample_proto();
        proto.has_rest_param = true;
        proto.arity = 1;
        let bytes = serialize(&proto);
        let back = deserialize(&bytes).expect("valid blob");
        assert!(back.has_rest_param);
    }

    #[test]
    fn roundtrip_preserves_has_rest_param_on_nested_function_constant() {
        let mut inner = sample_proto();
        inner.name = "variadic".into();
        inner.arity = 2;
        inner.has_rest_param = true;

        let mut outer = sample_proto();
        outer.constants = vec![Constant::Function(Rc::new(inner))];

        let bytes = serialize(&outer);
        let back = deserialize(&bytes).expect("valid blob");
        match &back.constants[0] {
            Constant::Function(nested) => {
                assert!(nested.has_rest_param);
                assert_eq!(nested.arity, 2);
            }
            other => panic!("expected a function constant, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = vec![b'X', b'X', b'X', b'X', VERSION];
        assert_eq!(deserialize(&bytes), Err(LoadError::BadMagic));
    }

    #[test]
    fn rejects_unsupported_version() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(9);
        assert_eq!(deserialize(&bytes), Err(LoadError::UnsupportedVersion(9)));
    }

    #[test]
    fn rejects_truncated_stream() {
        let mut bytes = MAGIC.to_vec();
        bytes.push(VERSION);
        assert_eq!(deserialize(&bytes), Err(LoadError::Truncated));
    }

    #[test]
    fn constant_pool_dedups_equal_scalars() {
        let mut proto = sample_proto();
        let a = proto.add_constant(Constant::Str("x".into()));
        let b = proto.add_constant(Constant::Str("x".into()));
        assert_eq!(a, b);
        let c = proto.add_constant(Constant::Str("y".into()));
        assert_ne!(a, c);
    }

    #[test]
    fn disassemble_lists_every_instruction() {
        let text = disassemble(&sample_proto());
        assert!(text.contains("Const 0 ; 42"));
        assert!(text.contains("Return"));
    }
}
