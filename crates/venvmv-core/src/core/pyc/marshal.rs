//! Reader/writer for the serialized code-object format carried in bytecode
//! cache files.
//!
//! Only the subset reachable from module-level code objects is supported.
//! Reading preserves type tags, string flavors, and back-reference numbering,
//! so writing an untouched tree reproduces the input byte for byte; that is
//! what lets the cache rewriter skip writes when nothing changed.

const FLAG_REF: u8 = 0x80;
const MAX_DEPTH: usize = 500;

/// Field layout of a serialized code object, selected by the cache magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeLayout {
    /// 3.7: `nlocals` plus the three variable-name tuples.
    Py37,
    /// 3.8 through 3.10: adds `posonlyargcount`.
    Py38,
    /// 3.11 and later: locals-plus tables, `qualname`, exception table.
    Py311,
}

#[derive(Debug, thiserror::Error)]
pub enum MarshalError {
    #[error("truncated data at offset {0}")]
    UnexpectedEof(usize),
    #[error("unknown type byte 0x{byte:02x} at offset {offset}")]
    UnknownType { byte: u8, offset: usize },
    #[error("implausible size {size} at offset {offset}")]
    BadSize { size: i64, offset: usize },
    #[error("nesting deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("code object fields do not match the {0:?} layout")]
    LayoutMismatch(CodeLayout),
}

/// On-wire string flavor. Interned variants keep interning across a rewrite;
/// short/ascii tags are widened at write time when the content outgrows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrKind {
    /// `u`: UTF-8, 4-byte length.
    Unicode,
    /// `t`: interned UTF-8, 4-byte length.
    Interned,
    /// `a`: ASCII, 4-byte length.
    Ascii,
    /// `A`: interned ASCII, 4-byte length.
    AsciiInterned,
    /// `z`: ASCII, 1-byte length.
    ShortAscii,
    /// `Z`: interned ASCII, 1-byte length.
    ShortAsciiInterned,
}

impl StrKind {
    /// Widest tag able to carry `bytes` without changing interning, never
    /// narrower than `self`.
    fn for_bytes(self, bytes: &[u8]) -> StrKind {
        let ascii = bytes.is_ascii();
        let short = bytes.len() < 256;
        match self {
            StrKind::Unicode | StrKind::Interned => self,
            StrKind::Ascii => {
                if ascii {
                    StrKind::Ascii
                } else {
                    StrKind::Unicode
                }
            }
            StrKind::AsciiInterned => {
                if ascii {
                    StrKind::AsciiInterned
                } else {
                    StrKind::Interned
                }
            }
            StrKind::ShortAscii => {
                if !ascii {
                    StrKind::Unicode
                } else if !short {
                    StrKind::Ascii
                } else {
                    StrKind::ShortAscii
                }
            }
            StrKind::ShortAsciiInterned => {
                if !ascii {
                    StrKind::Interned
                } else if !short {
                    StrKind::AsciiInterned
                } else {
                    StrKind::ShortAsciiInterned
                }
            }
        }
    }

    fn type_byte(self) -> u8 {
        match self {
            StrKind::Unicode => b'u',
            StrKind::Interned => b't',
            StrKind::Ascii => b'a',
            StrKind::AsciiInterned => b'A',
            StrKind::ShortAscii => b'z',
            StrKind::ShortAsciiInterned => b'Z',
        }
    }

    fn short_length(self) -> bool {
        matches!(self, StrKind::ShortAscii | StrKind::ShortAsciiInterned)
    }
}

/// A node in the constant tree. `flag_ref` mirrors the on-wire ref flag so
/// back-reference numbering survives a rewrite unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Obj {
    pub flag_ref: bool,
    pub value: Value,
}

impl Obj {
    #[must_use]
    pub fn plain(value: Value) -> Self {
        Self {
            flag_ref: false,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    True,
    False,
    StopIteration,
    Ellipsis,
    Int(i32),
    Int64(i64),
    /// Arbitrary-precision integer: sign-carrying digit count plus 15-bit
    /// digits, kept verbatim.
    Long { size: i32, digits: Vec<u16> },
    /// `g`: IEEE double.
    Float(f64),
    /// `f`: legacy text float, kept verbatim.
    FloatText(Vec<u8>),
    /// `y`: IEEE double pair.
    Complex { real: f64, imag: f64 },
    /// `x`: legacy text complex, kept verbatim.
    ComplexText { real: Vec<u8>, imag: Vec<u8> },
    Bytes(Vec<u8>),
    Str { kind: StrKind, bytes: Vec<u8> },
    Tuple { small: bool, items: Vec<Obj> },
    List(Vec<Obj>),
    Dict(Vec<(Obj, Obj)>),
    Set(Vec<Obj>),
    FrozenSet(Vec<Obj>),
    Code(Box<Code>),
    /// `r`: back reference to the nth ref-flagged object in stream order.
    Ref(u32),
}

/// A deserialized code object. Fields that exist only in some layouts are
/// optional; the populated set must agree with the layout used for writing.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub argcount: i32,
    pub posonlyargcount: Option<i32>,
    pub kwonlyargcount: i32,
    pub nlocals: Option<i32>,
    pub stacksize: i32,
    pub flags: i32,
    pub code: Obj,
    pub consts: Obj,
    pub names: Obj,
    pub varnames: Option<Obj>,
    pub freevars: Option<Obj>,
    pub cellvars: Option<Obj>,
    pub localsplusnames: Option<Obj>,
    pub localspluskinds: Option<Obj>,
    pub filename: Obj,
    pub name: Obj,
    pub qualname: Option<Obj>,
    pub firstlineno: i32,
    pub linetable: Obj,
    pub exceptiontable: Option<Obj>,
}

/// Deserialize one object tree from `data`.
pub fn read(data: &[u8], layout: CodeLayout) -> Result<Obj, MarshalError> {
    Reader {
        data,
        pos: 0,
        layout,
    }
    .read_object(0)
}

/// Serialize `obj` with the given code-object layout.
pub fn write(obj: &Obj, layout: CodeLayout) -> Result<Vec<u8>, MarshalError> {
    let mut writer = Writer {
        out: Vec::new(),
        layout,
    };
    writer.write_object(obj)?;
    Ok(writer.out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    layout: CodeLayout,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MarshalError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(MarshalError::UnexpectedEof(self.pos))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, MarshalError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, MarshalError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, MarshalError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, MarshalError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, MarshalError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    /// Length fields are signed on the wire; anything negative or larger
    /// than the remaining input is corrupt.
    fn length(&mut self) -> Result<usize, MarshalError> {
        let offset = self.pos;
        let raw = self.i32()?;
        let size = usize::try_from(raw).map_err(|_| MarshalError::BadSize {
            size: i64::from(raw),
            offset,
        })?;
        if size > self.data.len() - self.pos {
            return Err(MarshalError::BadSize {
                size: i64::from(raw),
                offset,
            });
        }
        Ok(size)
    }

    fn short_length(&mut self) -> Result<usize, MarshalError> {
        let offset = self.pos;
        let size = usize::from(self.u8()?);
        if size > self.data.len() - self.pos {
            return Err(MarshalError::BadSize {
                size: size as i64,
                offset,
            });
        }
        Ok(size)
    }

    fn read_items(&mut self, n: usize, depth: usize) -> Result<Vec<Obj>, MarshalError> {
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.read_object(depth + 1)?);
        }
        Ok(items)
    }

    fn read_str(&mut self, kind: StrKind) -> Result<Value, MarshalError> {
        let n = if kind.short_length() {
            self.short_length()?
        } else {
            self.length()?
        };
        Ok(Value::Str {
            kind,
            bytes: self.take(n)?.to_vec(),
        })
    }

    fn read_object(&mut self, depth: usize) -> Result<Obj, MarshalError> {
        if depth > MAX_DEPTH {
            return Err(MarshalError::TooDeep);
        }
        let offset = self.pos;
        let raw = self.u8()?;
        let flag_ref = raw & FLAG_REF != 0;
        let value = match raw & !FLAG_REF {
            b'N' => Value::None,
            b'T' => Value::True,
            b'F' => Value::False,
            b'S' => Value::StopIteration,
            b'.' => Value::Ellipsis,
            b'i' => Value::Int(self.i32()?),
            b'I' => Value::Int64(self.i64()?),
            b'l' => {
                let size_offset = self.pos;
                let size = self.i32()?;
                let count = size.unsigned_abs() as usize;
                if count.checked_mul(2).is_none_or(|n| n > self.data.len() - self.pos) {
                    return Err(MarshalError::BadSize {
                        size: i64::from(size),
                        offset: size_offset,
                    });
                }
                let mut digits = Vec::with_capacity(count);
                for _ in 0..count {
                    let bytes = self.take(2)?;
                    digits.push(u16::from_le_bytes([bytes[0], bytes[1]]));
                }
                Value::Long { size, digits }
            }
            b'g' => Value::Float(self.f64()?),
            b'f' => {
                let n = self.short_length()?;
                Value::FloatText(self.take(n)?.to_vec())
            }
            b'y' => Value::Complex {
                real: self.f64()?,
                imag: self.f64()?,
            },
            b'x' => {
                let real_len = self.short_length()?;
                let real = self.take(real_len)?.to_vec();
                let imag_len = self.short_length()?;
                let imag = self.take(imag_len)?.to_vec();
                Value::ComplexText { real, imag }
            }
            b's' => {
                let n = self.length()?;
                Value::Bytes(self.take(n)?.to_vec())
            }
            b'u' => self.read_str(StrKind::Unicode)?,
            b't' => self.read_str(StrKind::Interned)?,
            b'a' => self.read_str(StrKind::Ascii)?,
            b'A' => self.read_str(StrKind::AsciiInterned)?,
            b'z' => self.read_str(StrKind::ShortAscii)?,
            b'Z' => self.read_str(StrKind::ShortAsciiInterned)?,
            b'(' => {
                let n = self.length()?;
                Value::Tuple {
                    small: false,
                    items: self.read_items(n, depth)?,
                }
            }
            b')' => {
                let n = self.short_length()?;
                Value::Tuple {
                    small: true,
                    items: self.read_items(n, depth)?,
                }
            }
            b'[' => {
                let n = self.length()?;
                Value::List(self.read_items(n, depth)?)
            }
            b'<' => {
                let n = self.length()?;
                Value::Set(self.read_items(n, depth)?)
            }
            b'>' => {
                let n = self.length()?;
                Value::FrozenSet(self.read_items(n, depth)?)
            }
            b'{' => {
                let mut pairs = Vec::new();
                loop {
                    let mark = self.pos;
                    if self.u8()? == b'0' {
                        break;
                    }
                    self.pos = mark;
                    let key = self.read_object(depth + 1)?;
                    let value = self.read_object(depth + 1)?;
                    pairs.push((key, value));
                }
                Value::Dict(pairs)
            }
            b'r' => Value::Ref(self.u32()?),
            b'c' => Value::Code(Box::new(self.read_code(depth)?)),
            byte => {
                return Err(MarshalError::UnknownType { byte, offset });
            }
        };
        Ok(Obj { flag_ref, value })
    }

    fn read_code(&mut self, depth: usize) -> Result<Code, MarshalError> {
        let layout = self.layout;
        let argcount = self.i32()?;
        let posonlyargcount = if layout == CodeLayout::Py37 {
            None
        } else {
            Some(self.i32()?)
        };
        let kwonlyargcount = self.i32()?;
        let nlocals = if layout == CodeLayout::Py311 {
            None
        } else {
            Some(self.i32()?)
        };
        let stacksize = self.i32()?;
        let flags = self.i32()?;
        let code = self.read_object(depth + 1)?;
        let consts = self.read_object(depth + 1)?;
        let names = self.read_object(depth + 1)?;
        let (varnames, freevars, cellvars, localsplusnames, localspluskinds) =
            if layout == CodeLayout::Py311 {
                let names = self.read_object(depth + 1)?;
                let kinds = self.read_object(depth + 1)?;
                (None, None, None, Some(names), Some(kinds))
            } else {
                let varnames = self.read_object(depth + 1)?;
                let freevars = self.read_object(depth + 1)?;
                let cellvars = self.read_object(depth + 1)?;
                (Some(varnames), Some(freevars), Some(cellvars), None, None)
            };
        let filename = self.read_object(depth + 1)?;
        let name = self.read_object(depth + 1)?;
        let qualname = if layout == CodeLayout::Py311 {
            Some(self.read_object(depth + 1)?)
        } else {
            None
        };
        let firstlineno = self.i32()?;
        let linetable = self.read_object(depth + 1)?;
        let exceptiontable = if layout == CodeLayout::Py311 {
            Some(self.read_object(depth + 1)?)
        } else {
            None
        };
        Ok(Code {
            argcount,
            posonlyargcount,
            kwonlyargcount,
            nlocals,
            stacksize,
            flags,
            code,
            consts,
            names,
            varnames,
            freevars,
            cellvars,
            localsplusnames,
            localspluskinds,
            filename,
            name,
            qualname,
            firstlineno,
            linetable,
            exceptiontable,
        })
    }
}

struct Writer {
    out: Vec<u8>,
    layout: CodeLayout,
}

impl Writer {
    fn tag(&mut self, byte: u8, flag_ref: bool) {
        self.out.push(if flag_ref { byte | FLAG_REF } else { byte });
    }

    fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn i32(&mut self, value: i32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    fn length(&mut self, n: usize) -> Result<(), MarshalError> {
        let value = u32::try_from(n).map_err(|_| MarshalError::BadSize {
            size: n as i64,
            offset: self.out.len(),
        })?;
        self.u32(value);
        Ok(())
    }

    fn write_object(&mut self, obj: &Obj) -> Result<(), MarshalError> {
        let flag = obj.flag_ref;
        match &obj.value {
            Value::None => self.tag(b'N', flag),
            Value::True => self.tag(b'T', flag),
            Value::False => self.tag(b'F', flag),
            Value::StopIteration => self.tag(b'S', flag),
            Value::Ellipsis => self.tag(b'.', flag),
            Value::Int(value) => {
                self.tag(b'i', flag);
                self.i32(*value);
            }
            Value::Int64(value) => {
                self.tag(b'I', flag);
                self.out.extend_from_slice(&value.to_le_bytes());
            }
            Value::Long { size, digits } => {
                self.tag(b'l', flag);
                self.i32(*size);
                for digit in digits {
                    self.out.extend_from_slice(&digit.to_le_bytes());
                }
            }
            Value::Float(value) => {
                self.tag(b'g', flag);
                self.out.extend_from_slice(&value.to_le_bytes());
            }
            Value::FloatText(text) => {
                self.tag(b'f', flag);
                self.short_bytes(text)?;
            }
            Value::Complex { real, imag } => {
                self.tag(b'y', flag);
                self.out.extend_from_slice(&real.to_le_bytes());
                self.out.extend_from_slice(&imag.to_le_bytes());
            }
            Value::ComplexText { real, imag } => {
                self.tag(b'x', flag);
                self.short_bytes(real)?;
                self.short_bytes(imag)?;
            }
            Value::Bytes(bytes) => {
                self.tag(b's', flag);
                self.length(bytes.len())?;
                self.out.extend_from_slice(bytes);
            }
            Value::Str { kind, bytes } => {
                let kind = kind.for_bytes(bytes);
                self.tag(kind.type_byte(), flag);
                if kind.short_length() {
                    self.short_bytes(bytes)?;
                } else {
                    self.length(bytes.len())?;
                    self.out.extend_from_slice(bytes);
                }
            }
            Value::Tuple { small, items } => {
                if *small && items.len() < 256 {
                    self.tag(b')', flag);
                    self.out.push(items.len() as u8);
                } else {
                    self.tag(b'(', flag);
                    self.length(items.len())?;
                }
                for item in items {
                    self.write_object(item)?;
                }
            }
            Value::List(items) => {
                self.tag(b'[', flag);
                self.length(items.len())?;
                for item in items {
                    self.write_object(item)?;
                }
            }
            Value::Dict(pairs) => {
                self.tag(b'{', flag);
                for (key, value) in pairs {
                    self.write_object(key)?;
                    self.write_object(value)?;
                }
                self.out.push(b'0');
            }
            Value::Set(items) => {
                self.tag(b'<', flag);
                self.length(items.len())?;
                for item in items {
                    self.write_object(item)?;
                }
            }
            Value::FrozenSet(items) => {
                self.tag(b'>', flag);
                self.length(items.len())?;
                for item in items {
                    self.write_object(item)?;
                }
            }
            Value::Code(code) => {
                self.tag(b'c', flag);
                self.write_code(code)?;
            }
            Value::Ref(index) => {
                self.tag(b'r', flag);
                self.u32(*index);
            }
        }
        Ok(())
    }

    fn short_bytes(&mut self, bytes: &[u8]) -> Result<(), MarshalError> {
        let len = u8::try_from(bytes.len()).map_err(|_| MarshalError::BadSize {
            size: bytes.len() as i64,
            offset: self.out.len(),
        })?;
        self.out.push(len);
        self.out.extend_from_slice(bytes);
        Ok(())
    }

    fn write_code(&mut self, code: &Code) -> Result<(), MarshalError> {
        let layout = self.layout;
        let mismatch = || MarshalError::LayoutMismatch(layout);
        self.i32(code.argcount);
        if layout != CodeLayout::Py37 {
            self.i32(code.posonlyargcount.ok_or_else(mismatch)?);
        }
        self.i32(code.kwonlyargcount);
        if layout != CodeLayout::Py311 {
            self.i32(code.nlocals.ok_or_else(mismatch)?);
        }
        self.i32(code.stacksize);
        self.i32(code.flags);
        self.write_object(&code.code)?;
        self.write_object(&code.consts)?;
        self.write_object(&code.names)?;
        if layout == CodeLayout::Py311 {
            self.write_object(code.localsplusnames.as_ref().ok_or_else(mismatch)?)?;
            self.write_object(code.localspluskinds.as_ref().ok_or_else(mismatch)?)?;
        } else {
            self.write_object(code.varnames.as_ref().ok_or_else(mismatch)?)?;
            self.write_object(code.freevars.as_ref().ok_or_else(mismatch)?)?;
            self.write_object(code.cellvars.as_ref().ok_or_else(mismatch)?)?;
        }
        self.write_object(&code.filename)?;
        self.write_object(&code.name)?;
        if layout == CodeLayout::Py311 {
            self.write_object(code.qualname.as_ref().ok_or_else(mismatch)?)?;
        }
        self.i32(code.firstlineno);
        self.write_object(&code.linetable)?;
        if layout == CodeLayout::Py311 {
            self.write_object(code.exceptiontable.as_ref().ok_or_else(mismatch)?)?;
        }
        Ok(())
    }
}
