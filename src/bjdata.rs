//! Binary JData (BJData Draft 3) and UBJSON decoding into `serde_json`.
//!
//! Draft 3 is little-endian; UBJSON and BJData Draft 1 are big-endian and
//! selected with `big_endian = true`. Supported markers:
//!
//! | Marker | Type | Marker | Type |
//! |--------|------|--------|------|
//! | `Z` | null | `h` | float16 |
//! | `N` | no-op | `d` | float32 |
//! | `T` `F` | bool | `D` | float64 |
//! | `i` `U` | int8 / uint8 | `C` | char |
//! | `I` `u` | int16 / uint16 | `B` | byte |
//! | `l` `m` | int32 / uint32 | `S` | string |
//! | `L` `M` | int64 / uint64 | `H` | high-precision number |
//! | `[` `]` | array | `{` `}` | object |
//!
//! Optimized containers (`$` type, `#` count) are supported. A typed
//! N-dimensional array (`#` followed by a dimension vector) decodes to a
//! JData annotated array object.
//!
//! Input is untrusted: nesting is capped at [`MAX_DEPTH`] containers and
//! element counts are checked against the bytes actually present before
//! anything is allocated.

use serde_json::{json, Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum BjdataError {
    #[error("unexpected end of data at byte {pos}: need {need}, have {have}")]
    Eof { pos: usize, need: usize, have: usize },
    #[error("unknown marker 0x{marker:02x} at byte {pos}")]
    UnknownMarker { marker: u8, pos: usize },
    #[error("expected an integer marker at byte {pos}, got 0x{marker:02x}")]
    ExpectedInteger { marker: u8, pos: usize },
    #[error("negative length {value} at byte {pos}")]
    NegativeLength { value: i64, pos: usize },
    #[error("{0} trailing bytes after the top-level value")]
    Trailing(usize),
    #[error("containers nested deeper than {limit} at byte {pos}")]
    TooDeep { limit: usize, pos: usize },
    #[error("dimension product overflows at byte {pos}")]
    SizeOverflow { pos: usize },
    #[error("{count} elements of a zero-width type at byte {pos} (limit {limit})")]
    TooManyElements { count: usize, limit: usize, pos: usize },
}

pub type Result<T> = std::result::Result<T, BjdataError>;

/// Maximum container nesting, the same limit serde_json applies.
pub const MAX_DEPTH: usize = 128;

/// `Z`/`T`/`F` elements carry no payload, so their count can't be checked
/// against the input length.
const MAX_ZERO_WIDTH_ELEMENTS: usize = 1 << 20;

/// Fixed-size scalar types that may appear after `$`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scalar {
    Null,
    True,
    False,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float16,
    Float32,
    Float64,
    Char,
    Byte,
}

impl Scalar {
    fn from_marker(m: u8) -> Option<Self> {
        Some(match m {
            b'Z' => Scalar::Null,
            b'T' => Scalar::True,
            b'F' => Scalar::False,
            b'i' => Scalar::Int8,
            b'U' => Scalar::UInt8,
            b'I' => Scalar::Int16,
            b'u' => Scalar::UInt16,
            b'l' => Scalar::Int32,
            b'm' => Scalar::UInt32,
            b'L' => Scalar::Int64,
            b'M' => Scalar::UInt64,
            b'h' => Scalar::Float16,
            b'd' => Scalar::Float32,
            b'D' => Scalar::Float64,
            b'C' => Scalar::Char,
            b'B' => Scalar::Byte,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Scalar::Null | Scalar::True | Scalar::False => 0,
            Scalar::Int8 | Scalar::UInt8 | Scalar::Char | Scalar::Byte => 1,
            Scalar::Int16 | Scalar::UInt16 | Scalar::Float16 => 2,
            Scalar::Int32 | Scalar::UInt32 | Scalar::Float32 => 4,
            Scalar::Int64 | Scalar::UInt64 | Scalar::Float64 => 8,
        }
    }

    /// JData `_ArrayType_` name.
    fn jdata_name(self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::True | Scalar::False => "logical",
            Scalar::Int8 => "int8",
            Scalar::UInt8 | Scalar::Byte => "uint8",
            Scalar::Int16 => "int16",
            Scalar::UInt16 => "uint16",
            Scalar::Int32 => "int32",
            Scalar::UInt32 => "uint32",
            Scalar::Int64 => "int64",
            Scalar::UInt64 => "uint64",
            Scalar::Float16 => "half",
            Scalar::Float32 => "single",
            Scalar::Float64 => "double",
            Scalar::Char => "char",
        }
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            Scalar::Int8
                | Scalar::UInt8
                | Scalar::Int16
                | Scalar::UInt16
                | Scalar::Int32
                | Scalar::UInt32
                | Scalar::Int64
                | Scalar::UInt64
        )
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    big_endian: bool,
    depth: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(BjdataError::Eof {
                pos: self.pos,
                need: n,
                have: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn next_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        if self.big_endian {
            buf.reverse();
        }
        // buf is now little-endian
        Ok(buf)
    }

    fn scalar(&mut self, ty: Scalar) -> Result<Value> {
        Ok(match ty {
            Scalar::Null => Value::Null,
            Scalar::True => Value::Bool(true),
            Scalar::False => Value::Bool(false),
            Scalar::Int8 => Value::from(i8::from_le_bytes(self.fixed()?)),
            Scalar::UInt8 | Scalar::Byte => Value::from(self.next_byte()?),
            Scalar::Int16 => Value::from(i16::from_le_bytes(self.fixed()?)),
            Scalar::UInt16 => Value::from(u16::from_le_bytes(self.fixed()?)),
            Scalar::Int32 => Value::from(i32::from_le_bytes(self.fixed()?)),
            Scalar::UInt32 => Value::from(u32::from_le_bytes(self.fixed()?)),
            Scalar::Int64 => Value::from(i64::from_le_bytes(self.fixed()?)),
            Scalar::UInt64 => Value::from(u64::from_le_bytes(self.fixed()?)),
            Scalar::Float16 => float_value(f16_to_f32(u16::from_le_bytes(self.fixed()?)) as f64),
            Scalar::Float32 => float_value(f32::from_le_bytes(self.fixed()?) as f64),
            Scalar::Float64 => float_value(f64::from_le_bytes(self.fixed()?)),
            Scalar::Char => Value::String((self.next_byte()? as char).to_string()),
        })
    }

    /// Integer (length/count) preceded by its own type marker.
    fn length(&mut self) -> Result<usize> {
        let pos = self.pos;
        let marker = self.next_byte()?;
        let ty = Scalar::from_marker(marker)
            .filter(|t| t.is_integer())
            .ok_or(BjdataError::ExpectedInteger { marker, pos })?;
        let value = self.scalar(ty)?;
        if let Some(u) = value.as_u64() {
            return Ok(u as usize);
        }
        let signed = value.as_i64().unwrap_or_default();
        Err(BjdataError::NegativeLength { value: signed, pos })
    }

    fn string(&mut self) -> Result<String> {
        let len = self.length()?;
        let raw = self.take(len)?;
        Ok(match std::str::from_utf8(raw) {
            Ok(s) => s.to_string(),
            // latin-1 fallback: every byte maps to the code point of equal value
            Err(_) => raw.iter().map(|&b| b as char).collect(),
        })
    }

    fn value(&mut self) -> Result<Value> {
        let mut pos = self.pos;
        let mut marker = self.next_byte()?;
        while marker == b'N' {
            pos = self.pos;
            marker = self.next_byte()?;
        }
        match marker {
            b'S' => Ok(Value::String(self.string()?)),
            b'H' => Ok(Value::String(self.string()?)),
            b'[' => self.nested(pos, Self::array),
            b'{' => self.nested(pos, Self::object),
            m => match Scalar::from_marker(m) {
                Some(ty) => self.scalar(ty),
                None => Err(BjdataError::UnknownMarker { marker: m, pos }),
            },
        }
    }

    /// Run `parse` one container level deeper.
    fn nested<T>(&mut self, pos: usize, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_DEPTH {
            return Err(BjdataError::TooDeep { limit: MAX_DEPTH, pos });
        }
        self.depth += 1;
        let out = parse(self);
        self.depth -= 1;
        out
    }

    /// Optional `$type` and `#count` after a container opener.
    fn container_header(&mut self) -> Result<(Option<Scalar>, Option<Count>)> {
        let mut ty = None;
        if self.peek() == Some(b'$') {
            self.pos += 1;
            let pos = self.pos;
            let marker = self.next_byte()?;
            ty = Some(
                Scalar::from_marker(marker).ok_or(BjdataError::UnknownMarker { marker, pos })?,
            );
        }
        let mut count = None;
        if self.peek() == Some(b'#') {
            self.pos += 1;
            if self.peek() == Some(b'[') {
                let pos = self.pos;
                self.pos += 1;
                let col_major = if self.peek() == Some(b'[') {
                    self.pos += 1;
                    true
                } else {
                    false
                };
                let dims = self.nested(pos, Self::dims)?;
                if col_major && self.peek() == Some(b']') {
                    self.pos += 1;
                }
                count = Some(Count::Dims { dims, col_major });
            } else {
                count = Some(Count::Flat(self.length()?));
            }
        }
        Ok((ty, count))
    }

    /// Dimension vector after `#[`; the opening bracket is consumed.
    fn dims(&mut self) -> Result<Vec<usize>> {
        let (ty, count) = self.container_header()?;
        let mut dims = Vec::new();
        match (ty, count) {
            (Some(ty), Some(Count::Flat(n))) => {
                for _ in 0..n {
                    dims.push(as_dim(self.scalar(ty)?, self.pos)?);
                }
            }
            (None, Some(Count::Flat(n))) => {
                for _ in 0..n {
                    dims.push(self.length()?);
                }
            }
            _ => {
                while self.peek() != Some(b']') {
                    let pos = self.pos;
                    dims.push(as_dim(self.value()?, pos)?);
                }
                self.pos += 1;
            }
        }
        Ok(dims)
    }

    /// Every element needs at least `size` bytes; zero-width types are capped.
    fn guard_elements(&self, count: usize, size: usize) -> Result<()> {
        if size == 0 {
            if count > MAX_ZERO_WIDTH_ELEMENTS {
                return Err(BjdataError::TooManyElements {
                    count,
                    limit: MAX_ZERO_WIDTH_ELEMENTS,
                    pos: self.pos,
                });
            }
            return Ok(());
        }
        let need = count.saturating_mul(size);
        if need > self.remaining() {
            return Err(BjdataError::Eof {
                pos: self.pos,
                need,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    fn array(&mut self) -> Result<Value> {
        let (ty, count) = self.container_header()?;
        match (ty, count) {
            (Some(ty), Some(Count::Dims { dims, col_major })) => {
                let total = element_count(&dims, self.pos)?;
                self.guard_elements(total, ty.size())?;
                let mut data = Vec::with_capacity(total.min(self.remaining() + 1));
                for _ in 0..total {
                    data.push(self.scalar(ty)?);
                }
                let mut obj = Map::new();
                obj.insert("_ArrayType_".into(), json!(ty.jdata_name()));
                obj.insert("_ArraySize_".into(), json!(dims));
                if col_major {
                    obj.insert("_ArrayOrder_".into(), json!("f"));
                }
                obj.insert("_ArrayData_".into(), Value::Array(data));
                Ok(Value::Object(obj))
            }
            (None, Some(Count::Dims { dims, .. })) => {
                let total = element_count(&dims, self.pos)?;
                self.guard_elements(total, 1)?;
                let mut out = Vec::with_capacity(total);
                for _ in 0..total {
                    out.push(self.value()?);
                }
                Ok(Value::Array(out))
            }
            (Some(ty), Some(Count::Flat(n))) => {
                self.guard_elements(n, ty.size())?;
                if ty == Scalar::Char {
                    let raw = self.take(n)?;
                    return Ok(Value::String(raw.iter().map(|&b| b as char).collect()));
                }
                let mut out = Vec::with_capacity(n.min(self.remaining() + 1));
                for _ in 0..n {
                    out.push(self.scalar(ty)?);
                }
                Ok(Value::Array(out))
            }
            (None, Some(Count::Flat(n))) => {
                self.guard_elements(n, 1)?;
                let mut out = Vec::with_capacity(n);
                for _ in 0..n {
                    out.push(self.value()?);
                }
                Ok(Value::Array(out))
            }
            (_, None) => {
                let mut out = Vec::new();
                loop {
                    match self.peek() {
                        Some(b']') => {
                            self.pos += 1;
                            break;
                        }
                        Some(b'N') => self.pos += 1,
                        Some(_) => out.push(self.value()?),
                        None => {
                            return Err(BjdataError::Eof {
                                pos: self.pos,
                                need: 1,
                                have: 0,
                            })
                        }
                    }
                }
                Ok(Value::Array(out))
            }
        }
    }

    fn object(&mut self) -> Result<Value> {
        let (ty, count) = self.container_header()?;
        let mut obj = Map::new();
        let n = match count {
            Some(Count::Flat(n)) => Some(n),
            Some(Count::Dims { dims, .. }) => Some(element_count(&dims, self.pos)?),
            None => None,
        };
        if let Some(n) = n {
            // each entry has at least a one-byte key length
            self.guard_elements(n, 1)?;
        }
        let mut read_entry = |r: &mut Self| -> Result<()> {
            let key = r.string()?;
            let value = match ty {
                Some(ty) => r.scalar(ty)?,
                None => r.value()?,
            };
            obj.insert(key, value);
            Ok(())
        };
        match n {
            Some(n) => {
                for _ in 0..n {
                    read_entry(self)?;
                }
            }
            None => loop {
                match self.peek() {
                    Some(b'}') => {
                        self.pos += 1;
                        break;
                    }
                    Some(b'N') => self.pos += 1,
                    Some(_) => read_entry(self)?,
                    None => {
                        return Err(BjdataError::Eof {
                            pos: self.pos,
                            need: 1,
                            have: 0,
                        })
                    }
                }
            },
        }
        Ok(Value::Object(obj))
    }
}

enum Count {
    Flat(usize),
    Dims { dims: Vec<usize>, col_major: bool },
}

fn element_count(dims: &[usize], pos: usize) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(BjdataError::SizeOverflow { pos })
}

fn as_dim(v: Value, pos: usize) -> Result<usize> {
    match v.as_u64() {
        Some(u) => Ok(u as usize),
        None => Err(BjdataError::NegativeLength {
            value: v.as_i64().unwrap_or(-1),
            pos,
        }),
    }
}

/// JSON has no NaN/Inf; JData encodes them as strings.
fn float_value(f: f64) -> Value {
    if f.is_nan() {
        Value::String("_NaN_".into())
    } else if f.is_infinite() {
        Value::String(if f > 0.0 { "_Inf_" } else { "-_Inf_" }.into())
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// IEEE 754 binary16 → binary32.
fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let frac = (bits & 0x3ff) as u32;
    let out = match (exp, frac) {
        (0, 0) => sign << 31,
        (0, _) => {
            // subnormal: renormalize
            let mut e: i32 = 0;
            let mut f = frac;
            while f & 0x400 == 0 {
                f <<= 1;
                e -= 1;
            }
            let exp32 = (127 - 15 + 1 + e) as u32;
            (sign << 31) | (exp32 << 23) | ((f & 0x3ff) << 13)
        }
        (0x1f, 0) => (sign << 31) | 0x7f80_0000,
        (0x1f, _) => (sign << 31) | 0x7fc0_0000 | (frac << 13),
        _ => (sign << 31) | ((exp + 127 - 15) << 23) | (frac << 13),
    };
    f32::from_bits(out)
}

/// Decode one top-level value; trailing bytes are an error.
pub fn decode(data: &[u8], big_endian: bool) -> Result<Value> {
    let (value, rest) = decode_prefix(data, big_endian)?;
    if rest > 0 {
        return Err(BjdataError::Trailing(rest));
    }
    Ok(value)
}

/// Decode one top-level value and report how many bytes were left over.
pub fn decode_prefix(data: &[u8], big_endian: bool) -> Result<(Value, usize)> {
    let mut reader = Reader {
        data,
        pos: 0,
        big_endian,
        depth: 0,
    };
    let value = reader.value()?;
    Ok((value, reader.remaining()))
}

/// True when the buffer looks like text JSON rather than BJData: `{` or `[`
/// followed by whitespace, a quote, a digit, `-`, `[` or `{`.
pub fn detect_json(data: &[u8]) -> bool {
    let trimmed: &[u8] = {
        let start = data
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(data.len());
        &data[start..]
    };
    match trimmed {
        [first, second, ..] if *first == b'{' || *first == b'[' => {
            matches!(*second, b' ' | b'\t' | b'\n' | b'\r' | b'"' | b'-' | b'[' | b'{' | b'0'..=b'9')
                || (*first == b'{' && *second == b'}')
                || (*first == b'[' && *second == b']')
        }
        [first, ..] => !matches!(*first, b'{' | b'['),
        [] => true,
    }
}
