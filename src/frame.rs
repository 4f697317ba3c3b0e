//! Schema-driven binary frame codec.
//!
//! A schema file declares named frames:
//!
//! ```yaml
//! frames:
//!   status:
//!     header: "AA 55"
//!     tail: "0D 0A"
//!     crc: crc16_modbus
//!     fields:
//!       - {name: cmd, type: u8, const: 0x10}
//!       - {name: seq, type: u16, endian: little}
//!       - {name: label, type: str, length: 8}
//!       - {name: payload, type: bytes}
//! ```
//!
//! On the wire a frame is `header + fields + crc + tail`. The CRC covers the
//! encoded fields only. CRC-16/Modbus is appended little-endian.

use crate::error::{Error, Result};
use crate::protocol::crc;
use crate::value::{Value, ValueMap, from_hex, to_hex, yaml_key};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrcKind {
    #[default]
    None,
    Crc8,
    Crc16Modbus,
}

impl CrcKind {
    pub fn width(self) -> usize {
        match self {
            CrcKind::None => 0,
            CrcKind::Crc8 => 1,
            CrcKind::Crc16Modbus => 2,
        }
    }

    fn compute(self, payload: &[u8]) -> Vec<u8> {
        match self {
            CrcKind::None => Vec::new(),
            CrcKind::Crc8 => vec![crc::crc8(payload)],
            CrcKind::Crc16Modbus => crc::crc16_modbus(payload).to_le_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    U8,
    U16,
    U32,
    Bytes,
    #[serde(alias = "string")]
    Str,
}

impl FieldType {
    fn int_width(self) -> Option<usize> {
        match self {
            FieldType::U8 => Some(1),
            FieldType::U16 => Some(2),
            FieldType::U32 => Some(4),
            FieldType::Bytes | FieldType::Str => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "ascii")]
    Ascii,
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "latin-1", alias = "latin1", alias = "iso-8859-1")]
    Latin1,
}

impl Encoding {
    fn encode(self, text: &str) -> std::result::Result<Vec<u8>, String> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(format!("'{}' is not ASCII", text))
                }
            }
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).map_err(|_| format!("'{}' is not Latin-1", c)))
                .collect(),
        }
    }

    fn decode(self, data: &[u8]) -> String {
        match self {
            Encoding::Latin1 => data.iter().map(|&b| char::from(b)).collect(),
            Encoding::Ascii | Encoding::Utf8 => String::from_utf8_lossy(data).into_owned(),
        }
    }
}

/// One field of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: Option<String>,
    pub ftype: FieldType,
    /// Declared constant, already converted to the field's value type.
    pub constant: Option<Value>,
    pub length: Option<usize>,
    pub endian: Endian,
    pub encoding: Encoding,
}

impl FieldDef {
    /// Encoded width, if it does not depend on the value.
    pub fn width(&self) -> Option<usize> {
        self.ftype.int_width().or(self.length)
    }

    fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| format!("<{:?}>", self.ftype))
    }
}

/// A named frame layout.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameDef {
    pub name: String,
    pub header: Vec<u8>,
    pub tail: Vec<u8>,
    pub crc: CrcKind,
    pub fields: Vec<FieldDef>,
}

impl FrameDef {
    /// Total encoded length, or `None` if any field is variable-width.
    pub fn fixed_length(&self) -> Option<usize> {
        let body: Option<usize> = self.fields.iter().map(FieldDef::width).sum();
        Some(self.header.len() + body? + self.crc.width() + self.tail.len())
    }

    /// A frame can only be picked out of a byte stream if it ends with a
    /// tail or has a fixed length.
    pub fn ensure_receivable(&self) -> Result<()> {
        if self.tail.is_empty() && self.fixed_length().is_none() {
            return Err(Error::UnmatchableFrame(self.name.clone()));
        }
        Ok(())
    }

    fn field_error(&self, field: &FieldDef, message: impl Into<String>) -> Error {
        Error::FieldValue {
            frame: self.name.clone(),
            field: field.label(),
            message: message.into(),
        }
    }

    /// Encode `values` into a complete frame.
    pub fn build(&self, values: &ValueMap) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for field in &self.fields {
            let value = match (&field.constant, &field.name) {
                (Some(c), _) => c,
                (None, Some(name)) => values
                    .get(name)
                    .ok_or_else(|| self.field_error(field, "no value given"))?,
                (None, None) => return Err(self.field_error(field, "unnamed field needs a const")),
            };
            self.encode_field(field, value, &mut body)?;
        }
        let mut out = Vec::with_capacity(self.header.len() + body.len() + 2 + self.tail.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&body);
        out.extend(self.crc.compute(&body));
        out.extend_from_slice(&self.tail);
        Ok(out)
    }

    fn encode_field(&self, field: &FieldDef, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        if let Some(width) = field.ftype.int_width() {
            let n = value
                .as_i64()
                .ok_or_else(|| self.field_error(field, format!("expected an integer, got {}", value.type_name())))?;
            let max = (1u64 << (width * 8)) - 1;
            let n = u64::try_from(n)
                .ok()
                .filter(|n| *n <= max)
                .ok_or_else(|| self.field_error(field, format!("{} does not fit in {} byte(s)", n, width)))?;
            let bytes = n.to_be_bytes();
            let be = &bytes[8 - width..];
            match field.endian {
                Endian::Big => out.extend_from_slice(be),
                Endian::Little => out.extend(be.iter().rev()),
            }
            return Ok(());
        }

        let mut raw = match field.ftype {
            FieldType::Str => {
                let text = match value {
                    Value::Str(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                field
                    .encoding
                    .encode(&text)
                    .map_err(|msg| self.field_error(field, msg))?
            }
            _ => match value {
                Value::Bytes(b) => b.clone(),
                Value::Str(s) => from_hex(s)
                    .ok_or_else(|| self.field_error(field, format!("'{}' is not hex", s)))?,
                Value::List(items) => items
                    .iter()
                    .map(|v| v.as_i64().and_then(|n| u8::try_from(n).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .ok_or_else(|| self.field_error(field, "list items must be bytes"))?,
                Value::Null => Vec::new(),
                other => {
                    return Err(self.field_error(
                        field,
                        format!("expected bytes or hex text, got {}", other.type_name()),
                    ));
                }
            },
        };
        if let Some(len) = field.length {
            raw.resize(len, 0);
        }
        out.extend(raw);
        Ok(())
    }

    /// Decode a complete frame into its named fields.
    pub fn parse(&self, data: &[u8]) -> Result<ValueMap> {
        let need = self.header.len() + self.tail.len() + self.crc.width();
        if data.len() < need {
            return Err(Error::FrameTooShort {
                frame: self.name.clone(),
                len: data.len(),
                need,
            });
        }
        let rest = data
            .strip_prefix(self.header.as_slice())
            .ok_or_else(|| Error::HeaderMismatch {
                frame: self.name.clone(),
            })?;
        let rest = rest
            .strip_suffix(self.tail.as_slice())
            .ok_or_else(|| Error::TailMismatch {
                frame: self.name.clone(),
            })?;
        let (payload, crc_part) = rest.split_at(rest.len() - self.crc.width());
        if self.crc != CrcKind::None {
            let expected = self.crc.compute(payload);
            if expected != crc_part {
                return Err(Error::CrcMismatch {
                    frame: self.name.clone(),
                    expected: to_hex(&expected),
                    actual: to_hex(crc_part),
                });
            }
        }

        let fixed: usize = self.fields.iter().filter_map(FieldDef::width).sum();
        if payload.len() < fixed {
            return Err(Error::FrameTooShort {
                frame: self.name.clone(),
                len: data.len(),
                need: need + fixed,
            });
        }

        let mut result = ValueMap::new();
        let mut pos = 0;
        for (i, field) in self.fields.iter().enumerate() {
            let width = match field.width() {
                Some(w) => w,
                None => {
                    // A variable field takes what the later fixed fields leave.
                    let after: usize = self.fields[i + 1..].iter().filter_map(FieldDef::width).sum();
                    payload.len() - pos - after
                }
            };
            let chunk = &payload[pos..pos + width];
            pos += width;

            let value = match field.ftype {
                FieldType::U8 | FieldType::U16 | FieldType::U32 => {
                    let fold = |acc: i64, b: &u8| (acc << 8) | i64::from(*b);
                    Value::Int(match field.endian {
                        Endian::Big => chunk.iter().fold(0, fold),
                        Endian::Little => chunk.iter().rev().fold(0, fold),
                    })
                }
                FieldType::Str => {
                    Value::Str(field.encoding.decode(chunk).trim_end_matches('\0').to_string())
                }
                FieldType::Bytes => Value::Bytes(chunk.to_vec()),
            };

            if let Some(constant) = &field.constant {
                if !value.loose_eq(constant) {
                    return Err(Error::ConstMismatch {
                        frame: self.name.clone(),
                        field: field.label(),
                        expected: constant.to_string(),
                        actual: value.to_string(),
                    });
                }
            }
            if let Some(name) = &field.name {
                result.insert(name.clone(), value);
            }
        }

        if pos != payload.len() {
            return Err(Error::FieldValue {
                frame: self.name.clone(),
                field: "<trailing>".into(),
                message: format!("{} unexpected byte(s) after the last field", payload.len() - pos),
            });
        }
        Ok(result)
    }
}

#[derive(Deserialize)]
struct RawSchema {
    #[serde(default)]
    frames: serde_yaml::Mapping,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFrame {
    #[serde(default)]
    header: Option<serde_yaml::Value>,
    #[serde(default)]
    tail: Option<serde_yaml::Value>,
    #[serde(default)]
    crc: Option<CrcKind>,
    #[serde(default)]
    fields: Vec<RawField>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawField {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default = "default_field_type")]
    ftype: FieldType,
    #[serde(rename = "const", default)]
    constant: Option<serde_yaml::Value>,
    #[serde(default)]
    length: Option<usize>,
    #[serde(default)]
    endian: Endian,
    #[serde(default)]
    encoding: Encoding,
}

fn default_field_type() -> FieldType {
    FieldType::Bytes
}

/// A set of frame definitions loaded from one schema document.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSchema {
    frames: BTreeMap<String, FrameDef>,
}

impl ProtocolSchema {
    /// Load a schema file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::File {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
            .map_err(|e| Error::Script(format!("schema {}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let raw: RawSchema = serde_yaml::from_str(text)?;
        let mut frames = BTreeMap::new();
        for (name, node) in raw.frames {
            let name = yaml_key(name);
            let frame: RawFrame = serde_yaml::from_value(node)
                .map_err(|e| Error::Script(format!("frame '{}': {}", name, e)))?;
            let def = convert_frame(&name, frame)?;
            frames.insert(name, def);
        }
        if frames.is_empty() {
            return Err(Error::Script("no frames defined".into()));
        }
        Ok(Self { frames })
    }

    pub fn frame(&self, name: &str) -> Result<&FrameDef> {
        self.frames
            .get(name)
            .ok_or_else(|| Error::UnknownFrame(name.to_string()))
    }

    pub fn frame_names(&self) -> impl Iterator<Item = &str> {
        self.frames.keys().map(String::as_str)
    }

    pub fn build(&self, frame: &str, values: &ValueMap) -> Result<Vec<u8>> {
        self.frame(frame)?.build(values)
    }

    pub fn parse(&self, frame: &str, data: &[u8]) -> Result<ValueMap> {
        self.frame(frame)?.parse(data)
    }
}

fn hex_bytes(frame: &str, what: &str, value: Option<serde_yaml::Value>) -> Result<Vec<u8>> {
    let bad = |v: &Value| Error::Script(format!("frame '{}': {} {} is not hex bytes", frame, what, v));
    match value.map(Value::from) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Str(s)) => from_hex(&s).ok_or_else(|| bad(&Value::Str(s.clone()))),
        Some(Value::Int(n)) => {
            let bytes = u64::try_from(n).map_err(|_| bad(&Value::Int(n)))?.to_be_bytes();
            let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
            Ok(bytes[skip..].to_vec())
        }
        Some(Value::List(items)) => items
            .iter()
            .map(|v| v.as_i64().and_then(|n| u8::try_from(n).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| bad(&Value::List(items.clone()))),
        Some(other) => Err(bad(&other)),
    }
}

fn convert_frame(name: &str, raw: RawFrame) -> Result<FrameDef> {
    let mut fields = Vec::with_capacity(raw.fields.len());
    for f in raw.fields {
        if f.ftype.int_width().is_some() && f.length.is_some() {
            return Err(Error::Script(format!(
                "frame '{}': integer field {:?} cannot declare a length",
                name,
                f.name.as_deref().unwrap_or("?")
            )));
        }
        let constant = match f.constant.map(Value::from) {
            None | Some(Value::Null) => None,
            Some(c) => Some(normalize_const(name, f.ftype, c)?),
        };
        fields.push(FieldDef {
            name: f.name,
            ftype: f.ftype,
            constant,
            length: f.length,
            endian: f.endian,
            encoding: f.encoding,
        });
    }
    Ok(FrameDef {
        name: name.to_string(),
        header: hex_bytes(name, "header", raw.header)?,
        tail: hex_bytes(name, "tail", raw.tail)?,
        crc: raw.crc.unwrap_or_default(),
        fields,
    })
}

fn normalize_const(frame: &str, ftype: FieldType, c: Value) -> Result<Value> {
    let bad = || Error::Script(format!("frame '{}': const {} does not match type {:?}", frame, c, ftype));
    match ftype {
        FieldType::U8 | FieldType::U16 | FieldType::U32 => c.as_i64().map(Value::Int).ok_or_else(bad),
        FieldType::Str => Ok(Value::Str(c.to_string())),
        FieldType::Bytes => match &c {
            Value::Str(s) => from_hex(s).map(Value::Bytes).ok_or_else(bad),
            Value::Bytes(_) => Ok(c.clone()),
            _ => Err(bad()),
        },
    }
}
