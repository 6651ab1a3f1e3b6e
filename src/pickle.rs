//! Restricted pickle decoder.
//!
//! Archive members are Python pickles of a dictionary holding a numpy image
//! buffer and a label list. This module decodes the subset of the pickle
//! machine those files use into a typed [`Value`] tree. It never executes
//! anything: globals are kept as names, and only a fixed set of known
//! constructors is interpreted.
//!
//! ## Accepted input
//!
//! - Protocols 0 through 5, with in-band data only.
//! - Containers: dict, list, tuple; scalars: None, bool, int (up to 64 bits),
//!   float; text and byte strings.
//! - Python 2 `str` values decode as [`Value::Bytes`], matching what
//!   `pickle.load(f, encoding="bytes")` returns.
//! - Constructors interpreted on `REDUCE`/`BUILD`:
//!   - `numpy.dtype` becomes [`Value::Dtype`]
//!   - `numpy.core.multiarray._reconstruct` followed by `BUILD` becomes [`Value::NdArray`]
//!   - `numpy.core.numeric._frombuffer` becomes [`Value::NdArray`]
//!   - `_codecs.encode(s, "latin1")` and `bytearray(...)` become [`Value::Bytes`]
//!
//!   The `numpy._core` module spelling used by numpy 2 is accepted as well.
//!   Any other constructor is kept as an inert [`Value::Object`].
//!
//! ## Memo
//!
//! Memoized values are stored by copy. Pickles memoize an object before its
//! `BUILD` runs, so the memo slots of a built object are rewritten with the
//! built value; a `numpy.dtype` fetched later keeps its byte order. A container
//! fetched from the memo does not see items appended after it was memoized.
//! Batch files never rely on that aliasing.

use std::fmt;
use thiserror::Error;

/// Decoding failure with the byte offset of the offending opcode.
#[derive(Debug, Error)]
#[error("pickle offset {offset}: {reason}")]
pub struct PickleError {
    pub offset: usize,
    pub reason: String,
}

/// Element type of a numpy array, e.g. `u1` or `<i8`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dtype {
    /// Kind code: `u`, `i`, `b`, `f`, ...
    pub kind: char,
    /// Size of one element in bytes.
    pub item_size: usize,
    /// `<`, `>` or `|` (not applicable).
    pub byte_order: char,
}

impl Dtype {
    /// Parse a numpy type string such as `u1`, `<i8` or `|u1`.
    pub fn parse(descr: &str) -> Option<Self> {
        let mut chars = descr.chars().peekable();
        let mut byte_order = '|';
        if let Some(&c) = chars.peek()
            && matches!(c, '<' | '>' | '|' | '=')
        {
            byte_order = if c == '=' { '<' } else { c };
            chars.next();
        }
        let kind = chars.next()?;
        let item_size = chars.collect::<String>().parse::<usize>().ok()?;
        if item_size == 0 {
            return None;
        }
        Some(Self {
            kind,
            item_size,
            byte_order,
        })
    }

    pub fn is_integer(&self) -> bool {
        matches!(self.kind, 'i' | 'u' | 'b')
    }

    pub fn is_big_endian(&self) -> bool {
        self.byte_order == '>'
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.byte_order, self.kind, self.item_size)
    }
}

/// A reconstructed numpy array with its raw, C- or Fortran-ordered buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct NdArray {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub fortran_order: bool,
    pub data: Vec<u8>,
}

impl NdArray {
    /// Product of the dimensions, or `None` if it overflows `usize`.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }

    /// Decode an integer array into `i64` values.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        if !self.dtype.is_integer() || !matches!(self.dtype.item_size, 1 | 2 | 4 | 8) {
            return None;
        }
        let size = self.dtype.item_size;
        let expected = self.element_count()?.checked_mul(size)?;
        if self.data.len() != expected {
            return None;
        }
        let signed = self.dtype.kind == 'i';
        let big = self.dtype.is_big_endian();
        let out = self
            .data
            .chunks_exact(size)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                if big {
                    buf[8 - size..].copy_from_slice(chunk);
                    buf.reverse();
                } else {
                    buf[..size].copy_from_slice(chunk);
                }
                let raw = u64::from_le_bytes(buf);
                if signed && size < 8 {
                    let shift = 64 - 8 * size as u32;
                    ((raw << shift) as i64) >> shift
                } else {
                    raw as i64
                }
            })
            .collect();
        Some(out)
    }
}

/// Decoded pickle value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Insertion-ordered key/value pairs.
    Dict(Vec<(Value, Value)>),
    Global {
        module: String,
        name: String,
    },
    /// A constructor call that is not interpreted.
    Object {
        callable: Box<Value>,
        args: Box<Value>,
        state: Option<Box<Value>>,
    },
    Dtype(Dtype),
    NdArray(NdArray),
}

impl Value {
    /// Text of a string-like key, whether pickled as `str` or `bytes`.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Look up `key` in a dict value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Dict(items) => items
                .iter()
                .find(|(k, _)| k.as_key() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Short type name for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Global { .. } => "global",
            Value::Object { .. } => "object",
            Value::Dtype(_) => "dtype",
            Value::NdArray(_) => "ndarray",
        }
    }

    fn is_global(&self, module_suffix: &str, name: &str) -> bool {
        match self {
            Value::Global { module, name: n } => {
                n == name
                    && (module == module_suffix
                        || module.ends_with(&format!(".{module_suffix}")))
            }
            _ => false,
        }
    }
}

/// Decode a complete pickle stream.
///
/// # Errors
///
/// Returns [`PickleError`] for truncated input, unknown or unsupported opcodes,
/// stack underflow, and integers that do not fit in 64 bits.
pub fn from_slice(bytes: &[u8]) -> Result<Value, PickleError> {
    Machine::new(bytes).run()
}

// ============================================================================
// Opcodes
// ============================================================================

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';
    pub const REDUCE: u8 = b'R';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

// ============================================================================
// Machine
// ============================================================================

struct Machine<'a> {
    input: &'a [u8],
    pos: usize,
    /// Offset of the opcode being executed.
    op_start: usize,
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: Vec<Option<Value>>,
    /// `(stack depth, memo index)` for values memoized while on the stack.
    memo_aliases: Vec<(usize, usize)>,
}

impl<'a> Machine<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            op_start: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: Vec::new(),
            memo_aliases: Vec::new(),
        }
    }

    fn err(&self, reason: impl Into<String>) -> PickleError {
        PickleError {
            offset: self.op_start,
            reason: reason.into(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PickleError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.input.len())
            .ok_or_else(|| self.err(format!("truncated: need {n} more bytes")))?;
        let input = self.input;
        let slice = &input[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PickleError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PickleError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PickleError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, PickleError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn len_u64(&mut self) -> Result<usize, PickleError> {
        let n = self.u64()?;
        usize::try_from(n).map_err(|_| self.err("length overflows usize"))
    }

    fn line(&mut self) -> Result<&'a [u8], PickleError> {
        let input = self.input;
        let rest = &input[self.pos..];
        let nl = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| self.err("unterminated text argument"))?;
        let line = &rest[..nl];
        self.pos += nl + 1;
        Ok(line)
    }

    fn line_str(&mut self) -> Result<&'a str, PickleError> {
        let line = self.line()?;
        std::str::from_utf8(line).map_err(|_| self.err("text argument is not UTF-8"))
    }

    fn utf8(&self, bytes: &[u8]) -> Result<String, PickleError> {
        String::from_utf8(bytes.to_vec()).map_err(|_| self.err("string is not valid UTF-8"))
    }

    fn push(&mut self, v: Value) {
        let depth = self.stack.len();
        self.memo_aliases.retain(|&(d, _)| d < depth);
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<Value, PickleError> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() <= floor {
            return Err(self.err("stack underflow"));
        }
        self.stack.pop().ok_or_else(|| self.err("stack underflow"))
    }

    fn top_mut(&mut self) -> Result<&mut Value, PickleError> {
        let offset = self.op_start;
        self.stack.last_mut().ok_or(PickleError {
            offset,
            reason: "stack underflow".to_string(),
        })
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>, PickleError> {
        let mark = self.marks.pop().ok_or_else(|| self.err("no mark on stack"))?;
        Ok(self.stack.split_off(mark))
    }

    fn memo_put(&mut self, idx: usize) -> Result<(), PickleError> {
        let v = self
            .stack
            .last()
            .cloned()
            .ok_or_else(|| self.err("memoize on empty stack"))?;
        if self.memo.len() <= idx {
            self.memo.resize(idx + 1, None);
        }
        self.memo[idx] = Some(v);
        let alias = (self.stack.len() - 1, idx);
        if !self.memo_aliases.contains(&alias) {
            self.memo_aliases.push(alias);
        }
        Ok(())
    }

    fn memo_get(&mut self, idx: usize) -> Result<(), PickleError> {
        let v = self
            .memo
            .get(idx)
            .and_then(Option::clone)
            .ok_or_else(|| self.err(format!("memo key {idx} not found")))?;
        self.push(v);
        Ok(())
    }

    fn run(mut self) -> Result<Value, PickleError> {
        loop {
            self.op_start = self.pos;
            let code = self.u8()?;
            match code {
                op::PROTO => {
                    let version = self.u8()?;
                    if version > 5 {
                        return Err(self.err(format!("unsupported protocol {version}")));
                    }
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => {
                    let v = self.pop()?;
                    return Ok(v);
                }
                op::MARK => self.marks.push(self.stack.len()),
                op::POP => {
                    self.pop()?;
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let v = self.top_mut()?.clone();
                    self.push(v);
                }

                // ---- scalars ----
                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),
                op::BININT => {
                    let v = self.u32()? as i32;
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT1 => {
                    let v = self.u8()?;
                    self.push(Value::Int(i64::from(v)));
                }
                op::BININT2 => {
                    let v = self.u16()?;
                    self.push(Value::Int(i64::from(v)));
                }
                op::LONG1 => {
                    let n = usize::from(self.u8()?);
                    let bytes = self.take(n)?;
                    let v = self.long_from_le(bytes)?;
                    self.push(Value::Int(v));
                }
                op::LONG4 => {
                    let n = self.u32()? as usize;
                    let bytes = self.take(n)?;
                    let v = self.long_from_le(bytes)?;
                    self.push(Value::Int(v));
                }
                op::INT => {
                    let text = self.line_str()?;
                    let v = match text {
                        "00" => Value::Bool(false),
                        "01" => Value::Bool(true),
                        t => Value::Int(
                            t.parse::<i64>()
                                .map_err(|_| self.err(format!("bad INT literal {t:?}")))?,
                        ),
                    };
                    self.push(v);
                }
                op::LONG => {
                    let text = self.line_str()?;
                    let digits = text.strip_suffix('L').unwrap_or(text);
                    let v = digits
                        .parse::<i64>()
                        .map_err(|_| self.err(format!("LONG literal {text:?} out of range")))?;
                    self.push(Value::Int(v));
                }
                op::BINFLOAT => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(self.take(8)?);
                    self.push(Value::Float(f64::from_be_bytes(buf)));
                }
                op::FLOAT => {
                    let text = self.line_str()?;
                    let v = text
                        .parse::<f64>()
                        .map_err(|_| self.err(format!("bad FLOAT literal {text:?}")))?;
                    self.push(Value::Float(v));
                }

                // ---- strings ----
                op::BINSTRING => {
                    let n = self.u32()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::SHORT_BINSTRING => {
                    let n = usize::from(self.u8()?);
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::STRING => {
                    let line = self.line()?;
                    let b = self.unquote(line)?;
                    self.push(Value::Bytes(b));
                }
                op::BINBYTES => {
                    let n = self.u32()? as usize;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::SHORT_BINBYTES => {
                    let n = usize::from(self.u8()?);
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::BINBYTES8 | op::BYTEARRAY8 => {
                    let n = self.len_u64()?;
                    let b = self.take(n)?.to_vec();
                    self.push(Value::Bytes(b));
                }
                op::BINUNICODE => {
                    let n = self.u32()? as usize;
                    let b = self.take(n)?;
                    let s = self.utf8(b)?;
                    self.push(Value::Str(s));
                }
                op::SHORT_BINUNICODE => {
                    let n = usize::from(self.u8()?);
                    let b = self.take(n)?;
                    let s = self.utf8(b)?;
                    self.push(Value::Str(s));
                }
                op::BINUNICODE8 => {
                    let n = self.len_u64()?;
                    let b = self.take(n)?;
                    let s = self.utf8(b)?;
                    self.push(Value::Str(s));
                }
                op::UNICODE => {
                    let s = self.line_str()?.to_string();
                    self.push(Value::Str(s));
                }

                // ---- containers ----
                op::EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                op::EMPTY_LIST => self.push(Value::List(Vec::new())),
                op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                op::EMPTY_SET => self.push(Value::List(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Value::Tuple(items));
                }
                op::TUPLE1 => {
                    let a = self.pop()?;
                    self.push(Value::Tuple(vec![a]));
                }
                op::TUPLE2 => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Tuple(vec![a, b]));
                }
                op::TUPLE3 => {
                    let c = self.pop()?;
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Tuple(vec![a, b, c]));
                }
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                op::DICT => {
                    let items = self.pop_mark()?;
                    let pairs = self.pairs(items)?;
                    self.push(Value::Dict(pairs));
                }
                op::APPEND => {
                    let v = self.pop()?;
                    self.extend_top(vec![v])?;
                }
                op::APPENDS | op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    self.extend_top(items)?;
                }
                op::SETITEM => {
                    let v = self.pop()?;
                    let k = self.pop()?;
                    self.insert_top(vec![(k, v)])?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = self.pairs(items)?;
                    self.insert_top(pairs)?;
                }

                // ---- memo ----
                op::BINPUT => {
                    let idx = usize::from(self.u8()?);
                    self.memo_put(idx)?;
                }
                op::LONG_BINPUT => {
                    let idx = self.u32()? as usize;
                    self.memo_put(idx)?;
                }
                op::PUT => {
                    let text = self.line_str()?;
                    let idx = text
                        .parse::<usize>()
                        .map_err(|_| self.err(format!("bad PUT index {text:?}")))?;
                    self.memo_put(idx)?;
                }
                op::MEMOIZE => {
                    let idx = self.memo.len();
                    self.memo_put(idx)?;
                }
                op::BINGET => {
                    let idx = usize::from(self.u8()?);
                    self.memo_get(idx)?;
                }
                op::LONG_BINGET => {
                    let idx = self.u32()? as usize;
                    self.memo_get(idx)?;
                }
                op::GET => {
                    let text = self.line_str()?;
                    let idx = text
                        .parse::<usize>()
                        .map_err(|_| self.err(format!("bad GET index {text:?}")))?;
                    self.memo_get(idx)?;
                }

                // ---- objects ----
                op::GLOBAL => {
                    let module = self.line_str()?.to_string();
                    let name = self.line_str()?.to_string();
                    self.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    match (module, name) {
                        (Value::Str(module), Value::Str(name)) => {
                            self.push(Value::Global { module, name })
                        }
                        _ => return Err(self.err("STACK_GLOBAL expects two strings")),
                    }
                }
                op::REDUCE | op::NEWOBJ => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let v = self.reduce(callable, args)?;
                    self.push(v);
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let v = self.reduce(callable, args)?;
                    self.push(v);
                }
                op::BUILD => {
                    let state = self.pop()?;
                    let obj = self.pop()?;
                    let depth = self.stack.len();
                    let slots: Vec<usize> = self
                        .memo_aliases
                        .iter()
                        .filter(|&&(d, _)| d == depth)
                        .map(|&(_, idx)| idx)
                        .collect();
                    let v = self.build(obj, state)?;
                    self.push(v);
                    for idx in slots {
                        self.memo_put(idx)?;
                    }
                }
                op::NEXT_BUFFER | op::READONLY_BUFFER => {
                    return Err(self.err("out-of-band buffers are not supported"));
                }
                other => {
                    return Err(self.err(format!("unsupported opcode 0x{other:02x}")));
                }
            }
        }
    }

    fn long_from_le(&self, bytes: &[u8]) -> Result<i64, PickleError> {
        if bytes.is_empty() {
            return Ok(0);
        }
        if bytes.len() > 8 {
            // Wider encodings are fine as long as the extra bytes are pure sign extension.
            let (low, high) = bytes.split_at(8);
            let negative = low[7] & 0x80 != 0;
            let fill = if negative { 0xff } else { 0x00 };
            if high.iter().any(|&b| b != fill) {
                return Err(self.err("integer does not fit in 64 bits"));
            }
            return self.long_from_le(low);
        }
        let negative = bytes[bytes.len() - 1] & 0x80 != 0;
        let mut buf = if negative { [0xffu8; 8] } else { [0u8; 8] };
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buf))
    }

    fn unquote(&self, line: &[u8]) -> Result<Vec<u8>, PickleError> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let inner = match line {
            [b'\'', rest @ .., b'\''] | [b'"', rest @ .., b'"'] => rest,
            _ => return Err(self.err("STRING argument is not quoted")),
        };
        let mut out = Vec::with_capacity(inner.len());
        let mut i = 0;
        while i < inner.len() {
            let b = inner[i];
            if b != b'\\' || i + 1 == inner.len() {
                out.push(b);
                i += 1;
                continue;
            }
            let next = inner[i + 1];
            i += 2;
            match next {
                b'n' => out.push(b'\n'),
                b't' => out.push(b'\t'),
                b'r' => out.push(b'\r'),
                b'\\' => out.push(b'\\'),
                b'\'' => out.push(b'\''),
                b'"' => out.push(b'"'),
                b'x' if i + 2 <= inner.len() => {
                    let hex = std::str::from_utf8(&inner[i..i + 2])
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                        .ok_or_else(|| self.err("bad \\x escape in STRING"))?;
                    out.push(hex);
                    i += 2;
                }
                other => {
                    out.push(b'\\');
                    out.push(other);
                }
            }
        }
        Ok(out)
    }

    fn pairs(&self, items: Vec<Value>) -> Result<Vec<(Value, Value)>, PickleError> {
        if items.len() % 2 != 0 {
            return Err(self.err("odd number of items for dict"));
        }
        let mut out = Vec::with_capacity(items.len() / 2);
        let mut it = items.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            out.push((k, v));
        }
        Ok(out)
    }

    fn extend_top(&mut self, items: Vec<Value>) -> Result<(), PickleError> {
        let offset = self.op_start;
        match self.top_mut()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(PickleError {
                offset,
                reason: format!("cannot append to {}", other.kind()),
            }),
        }
    }

    fn insert_top(&mut self, pairs: Vec<(Value, Value)>) -> Result<(), PickleError> {
        let offset = self.op_start;
        match self.top_mut()? {
            Value::Dict(dict) => {
                for (k, v) in pairs {
                    match dict.iter_mut().find(|(existing, _)| *existing == k) {
                        Some(slot) => slot.1 = v,
                        None => dict.push((k, v)),
                    }
                }
                Ok(())
            }
            other => Err(PickleError {
                offset,
                reason: format!("cannot set items on {}", other.kind()),
            }),
        }
    }

    fn reduce(&self, callable: Value, args: Value) -> Result<Value, PickleError> {
        let argv = match args {
            Value::Tuple(items) => items,
            other => {
                return Ok(Value::Object {
                    callable: Box::new(callable),
                    args: Box::new(other),
                    state: None,
                });
            }
        };

        if callable.is_global("numpy", "dtype") {
            let descr = argv
                .first()
                .and_then(Value::as_key)
                .ok_or_else(|| self.err("numpy.dtype expects a type string"))?;
            let dtype = Dtype::parse(descr)
                .ok_or_else(|| self.err(format!("unsupported dtype {descr:?}")))?;
            return Ok(Value::Dtype(dtype));
        }

        let is_bytes_ctor = callable.is_global("_codecs", "encode")
            || callable.is_global("builtins", "bytearray")
            || callable.is_global("__builtin__", "bytearray");
        if is_bytes_ctor {
            match argv.first() {
                Some(Value::Str(text)) => return self.latin1(text).map(Value::Bytes),
                Some(Value::Bytes(b)) => return Ok(Value::Bytes(b.clone())),
                None => return Ok(Value::Bytes(Vec::new())),
                Some(_) => {}
            }
        }

        if callable.is_global("numeric", "_frombuffer") {
            return self.frombuffer(argv);
        }

        Ok(Value::Object {
            callable: Box::new(callable),
            args: Box::new(Value::Tuple(argv)),
            state: None,
        })
    }

    /// Python 3 pickles `bytes` under protocol 2 as a latin-1 decoded `str`.
    fn latin1(&self, text: &str) -> Result<Vec<u8>, PickleError> {
        text.chars()
            .map(|c| u8::try_from(u32::from(c)))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| self.err("latin-1 string holds a character above U+00FF"))
    }

    /// `_frombuffer(buf, dtype, shape, order)`.
    fn frombuffer(&self, argv: Vec<Value>) -> Result<Value, PickleError> {
        let mut it = argv.into_iter();
        match (it.next(), it.next(), it.next(), it.next()) {
            (Some(Value::Bytes(data)), Some(Value::Dtype(dtype)), Some(shape), Some(order)) => {
                let shape = self.shape(&shape)?;
                let fortran_order = order.as_key() == Some("F");
                Ok(Value::NdArray(NdArray {
                    shape,
                    dtype,
                    fortran_order,
                    data,
                }))
            }
            _ => Err(self.err("numpy _frombuffer arguments have an unexpected layout")),
        }
    }

    fn build(&self, obj: Value, state: Value) -> Result<Value, PickleError> {
        match obj {
            Value::Dtype(mut dtype) => {
                // (version, byteorder, subdescr, names, fields, elsize, alignment, flags)
                if let Value::Tuple(items) = &state
                    && let Some(order) = items.get(1).and_then(Value::as_key)
                    && let Some(c) = order.chars().next()
                {
                    dtype.byte_order = if c == '=' { '<' } else { c };
                }
                Ok(Value::Dtype(dtype))
            }
            Value::Object { callable, .. } if callable.is_global("multiarray", "_reconstruct") => {
                self.ndarray_from_state(state)
            }
            Value::Object { callable, args, .. } => Ok(Value::Object {
                callable,
                args,
                state: Some(Box::new(state)),
            }),
            other => Ok(other),
        }
    }

    /// `ndarray.__setstate__((version, shape, dtype, is_fortran, rawdata))`;
    /// version 0 pickles omit the leading version field.
    fn ndarray_from_state(&self, state: Value) -> Result<Value, PickleError> {
        let Value::Tuple(mut items) = state else {
            return Err(self.err("ndarray state is not a tuple"));
        };
        if items.len() == 5 {
            items.remove(0);
        }
        let [shape, dtype, fortran, raw] = <[Value; 4]>::try_from(items)
            .map_err(|_| self.err("ndarray state has an unexpected length"))?;
        let shape = self.shape(&shape)?;
        let dtype = match dtype {
            Value::Dtype(dtype) => dtype,
            other => return Err(self.err(format!("ndarray dtype is {}", other.kind()))),
        };
        let fortran_order = match fortran {
            Value::Bool(b) => b,
            Value::Int(i) => i != 0,
            other => return Err(self.err(format!("ndarray order flag is {}", other.kind()))),
        };
        let data = match raw {
            Value::Bytes(b) => b,
            other => {
                return Err(self.err(format!(
                    "ndarray holds {} instead of a raw buffer",
                    other.kind()
                )));
            }
        };
        Ok(Value::NdArray(NdArray {
            shape,
            dtype,
            fortran_order,
            data,
        }))
    }

    fn shape(&self, v: &Value) -> Result<Vec<usize>, PickleError> {
        let Value::Tuple(dims) = v else {
            return Err(self.err(format!("array shape is {}", v.kind())));
        };
        dims.iter()
            .map(|d| match d {
                Value::Int(n) if *n >= 0 => Ok(*n as usize),
                _ => Err(self.err("array dimension is not a non-negative int")),
            })
            .collect()
    }
}
