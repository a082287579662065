// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! In-memory ASN.1 values and DER encoding.
//!
//! Values form an owned tree of tagged variants. Constructed values
//! keep their children in declaration order together with an optional
//! per-child name used for named lookup; elements marked as defaulted
//! are not emitted when encoding.

use core::fmt;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use num_bigint_dig::{BigInt, BigUint};

use crate::{
    asn1::tag::{self, Tag, TagClass, universal},
    error::{Error, Result},
};

/// Object identifier with the `40*a + b` first-arc folding applied at
/// the wire level only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(Vec<u64>);

impl Oid {
    pub fn new(arcs: &[u64]) -> Self {
        Oid(arcs.to_vec())
    }

    pub fn arcs(&self) -> &[u64] {
        &self.0
    }

    pub fn encode_content(&self) -> Result<Vec<u8>> {
        if self.0.len() < 2 {
            return Err(Error::parse("Bad object identifier"));
        }
        if self.0[0] > 2 || (self.0[0] < 2 && self.0[1] > 39) {
            return Err(Error::parse("Bad object identifier"));
        }
        let mut out = Vec::new();
        push_base128(&mut out, 40 * self.0[0] + self.0[1]);
        for &arc in &self.0[2..] {
            push_base128(&mut out, arc);
        }
        Ok(out)
    }

    pub fn decode_content(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::parse("Bad object identifier"));
        }
        let mut arcs = Vec::new();
        let mut value: u64 = 0;
        let mut in_arc = false;
        for (i, &byte) in data.iter().enumerate() {
            value = value
                .checked_shl(7)
                .and_then(|v| v.checked_add((byte & 0x7f) as u64))
                .ok_or_else(|| Error::parse("Bad object identifier"))?;
            in_arc = true;
            if byte & 0x80 == 0 {
                if arcs.is_empty() {
                    let first = match value {
                        v if v < 40 => (0, v),
                        v if v < 80 => (1, v - 40),
                        v => (2, v - 80),
                    };
                    arcs.push(first.0);
                    arcs.push(first.1);
                } else {
                    arcs.push(value);
                }
                value = 0;
                in_arc = false;
            } else if i == data.len() - 1 {
                return Err(Error::parse("Bad object identifier"));
            }
        }
        if in_arc {
            return Err(Error::parse("Bad object identifier"));
        }
        Ok(Oid(arcs))
    }
}

fn push_base128(out: &mut Vec<u8>, value: u64) {
    let mut parts = Vec::new();
    let mut v = value;
    loop {
        parts.push((v & 0x7f) as u8);
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    parts.reverse();
    let last = parts.len() - 1;
    for (i, part) in parts.into_iter().enumerate() {
        out.push(if i == last { part } else { part | 0x80 });
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for arc in &self.0 {
            if !first {
                write!(f, ".")?;
            }
            write!(f, "{arc}")?;
            first = false;
        }
        Ok(())
    }
}

/// Bit string as `(unused_bits, payload)` with MSB-first bit order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitString {
    pub unused: u8,
    pub data: Vec<u8>,
}

impl BitString {
    /// Wraps whole octets (no unused bits).
    pub fn from_octets(data: impl Into<Vec<u8>>) -> Self {
        BitString {
            unused: 0,
            data: data.into(),
        }
    }

    /// Builds from individual bits, trailing zero bits stripped, as DER
    /// named-bit encoding requires.
    pub fn from_bits(bits: &[bool]) -> Self {
        let significant = bits.iter().rposition(|b| *b).map_or(0, |p| p + 1);
        let mut data = vec![0u8; significant.div_ceil(8)];
        for (i, &bit) in bits[..significant].iter().enumerate() {
            if bit {
                data[i / 8] |= 0x80 >> (i % 8);
            }
        }
        let unused = if significant % 8 == 0 {
            0
        } else {
            (8 - significant % 8) as u8
        };
        BitString { unused, data }
    }

    pub fn bit(&self, index: usize) -> bool {
        let byte = index / 8;
        if byte >= self.data.len() {
            return false;
        }
        self.data[byte] & (0x80 >> (index % 8)) != 0
    }

    pub fn encode_content(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(self.unused);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode_content(data: &[u8]) -> Result<Self> {
        let Some((&unused, rest)) = data.split_first() else {
            return Err(Error::parse("Invalid coding"));
        };
        if unused > 7 || (unused > 0 && rest.is_empty()) {
            return Err(Error::parse("Invalid coding"));
        }
        Ok(BitString {
            unused,
            data: rest.to_vec(),
        })
    }
}

/// Child slot of a constructed value.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub value: Value,
    pub name: Option<String>,
    /// Supplied from a definition default; not emitted on encode.
    pub default: bool,
}

/// Ordered children plus name lookup for Sequence/Set values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Constructed {
    elems: Vec<Element>,
}

impl Constructed {
    pub fn new() -> Self {
        Constructed::default()
    }

    pub fn push(&mut self, value: Value) {
        self.elems.push(Element {
            value,
            name: None,
            default: false,
        });
    }

    pub fn push_named(&mut self, value: Value, name: impl Into<String>) {
        self.elems.push(Element {
            value,
            name: Some(name.into()),
            default: false,
        });
    }

    pub fn push_default(&mut self, value: Value, name: Option<String>) {
        self.elems.push(Element {
            value,
            name,
            default: true,
        });
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.elems
            .iter()
            .find(|e| e.name.as_deref() == Some(name))
            .map(|e| &e.value)
    }

    /// Like [`Constructed::get`] but `None` when the slot was filled
    /// from a definition default.
    pub fn get_explicit(&self, name: &str) -> Option<&Value> {
        self.elems
            .iter()
            .find(|e| e.name.as_deref() == Some(name) && !e.default)
            .map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.elems.iter().map(|e| &e.value)
    }

    pub fn elements(&self) -> &[Element] {
        &self.elems
    }
}

impl FromIterator<Value> for Constructed {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        let mut c = Constructed::new();
        for v in iter {
            c.push(v);
        }
        c
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedValue {
    pub tag: Tag,
    pub explicit: bool,
    pub inner: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(BigInt),
    BitString(BitString),
    OctetString(Vec<u8>),
    ObjectIdentifier(Oid),
    Enumerated(BigInt),
    Utf8String(String),
    NumericString(String),
    PrintableString(String),
    Ia5String(String),
    VisibleString(String),
    UtcTime(DateTime<Utc>),
    GeneralizedTime(DateTime<Utc>),
    UniversalString(String),
    Sequence(Constructed),
    SequenceOf(Constructed),
    Set(Constructed),
    SetOf(Constructed),
    Tagged(Box<TaggedValue>),
    /// Raw DER of a value outside the modeled universe.
    Unknown(Tag, Vec<u8>),
}

impl Value {
    pub fn integer(n: impl Into<BigInt>) -> Self {
        Value::Integer(n.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::BitString(_) => "BitString",
            Value::OctetString(_) => "OctetString",
            Value::ObjectIdentifier(_) => "ObjectIdentifier",
            Value::Enumerated(_) => "Enumerated",
            Value::Utf8String(_) => "UTF8String",
            Value::NumericString(_) => "NumericString",
            Value::PrintableString(_) => "PrintableString",
            Value::Ia5String(_) => "IA5String",
            Value::VisibleString(_) => "VisibleString",
            Value::UtcTime(_) => "UTCTime",
            Value::GeneralizedTime(_) => "GeneralizedTime",
            Value::UniversalString(_) => "UniversalString",
            Value::Sequence(_) => "Sequence",
            Value::SequenceOf(_) => "SequenceOf",
            Value::Set(_) => "Set",
            Value::SetOf(_) => "SetOf",
            Value::Tagged(_) => "Tagged",
            Value::Unknown(_, _) => "Unknown",
        }
    }

    /// Effective identifier tag of the value.
    pub fn tag(&self) -> Tag {
        match self {
            Value::Null => Tag::universal(universal::NULL),
            Value::Boolean(_) => Tag::universal(universal::BOOLEAN),
            Value::Integer(_) => Tag::universal(universal::INTEGER),
            Value::BitString(_) => Tag::universal(universal::BIT_STRING),
            Value::OctetString(_) => Tag::universal(universal::OCTET_STRING),
            Value::ObjectIdentifier(_) => {
                Tag::universal(universal::OBJECT_IDENTIFIER)
            },
            Value::Enumerated(_) => Tag::universal(universal::ENUMERATED),
            Value::Utf8String(_) => Tag::universal(universal::UTF8_STRING),
            Value::NumericString(_) => Tag::universal(universal::NUMERIC_STRING),
            Value::PrintableString(_) => {
                Tag::universal(universal::PRINTABLE_STRING)
            },
            Value::Ia5String(_) => Tag::universal(universal::IA5_STRING),
            Value::VisibleString(_) => Tag::universal(universal::VISIBLE_STRING),
            Value::UtcTime(_) => Tag::universal(universal::UTC_TIME),
            Value::GeneralizedTime(_) => {
                Tag::universal(universal::GENERALIZED_TIME)
            },
            Value::UniversalString(_) => {
                Tag::universal(universal::UNIVERSAL_STRING)
            },
            Value::Sequence(_) | Value::SequenceOf(_) => {
                Tag::universal(universal::SEQUENCE)
            },
            Value::Set(_) | Value::SetOf(_) => Tag::universal(universal::SET),
            Value::Tagged(t) => t.tag,
            Value::Unknown(tag, _) => *tag,
        }
    }

    pub fn is_constructed(&self) -> bool {
        match self {
            Value::Sequence(_)
            | Value::SequenceOf(_)
            | Value::Set(_)
            | Value::SetOf(_) => true,
            Value::Tagged(t) => {
                if t.explicit {
                    true
                } else {
                    t.inner.is_constructed()
                }
            },
            Value::Unknown(_, der) => der
                .first()
                .is_some_and(|first| first & 0x20 != 0),
            _ => false,
        }
    }

    /// Content octets, without identifier and length.
    pub fn encode_content(&self) -> Result<Vec<u8>> {
        match self {
            Value::Null => Ok(Vec::new()),
            Value::Boolean(b) => Ok(vec![if *b { 0xff } else { 0x00 }]),
            Value::Integer(n) | Value::Enumerated(n) => {
                Ok(n.to_signed_bytes_be())
            },
            Value::BitString(bits) => Ok(bits.encode_content()),
            Value::OctetString(data) => Ok(data.clone()),
            Value::ObjectIdentifier(oid) => oid.encode_content(),
            Value::Utf8String(s) => Ok(s.as_bytes().to_vec()),
            Value::NumericString(s) => {
                check_charset(s, |c| c.is_ascii_digit() || c == ' ')?;
                Ok(s.as_bytes().to_vec())
            },
            Value::PrintableString(s) => {
                check_charset(s, is_printable_char)?;
                Ok(s.as_bytes().to_vec())
            },
            Value::Ia5String(s) => {
                check_charset(s, |c| c as u32 <= 0x7f)?;
                Ok(s.as_bytes().to_vec())
            },
            Value::VisibleString(s) => {
                check_charset(s, |c| (0x20..=0x7e).contains(&(c as u32)))?;
                Ok(s.as_bytes().to_vec())
            },
            Value::UtcTime(t) => encode_utc_time(t),
            Value::GeneralizedTime(t) => encode_generalized_time(t),
            Value::UniversalString(s) => {
                let mut out = Vec::with_capacity(s.chars().count() * 4);
                for c in s.chars() {
                    out.extend_from_slice(&(c as u32).to_be_bytes());
                }
                Ok(out)
            },
            Value::Sequence(c) | Value::SequenceOf(c) => {
                let mut out = Vec::new();
                for elem in c.elements() {
                    if elem.default {
                        continue;
                    }
                    out.extend_from_slice(&elem.value.encode_der()?);
                }
                Ok(out)
            },
            Value::Set(c) | Value::SetOf(c) => {
                let mut ders = Vec::with_capacity(c.len());
                for elem in c.elements() {
                    if elem.default {
                        continue;
                    }
                    ders.push(elem.value.encode_der()?);
                }
                // DER set order: lexicographic over element encodings.
                ders.sort();
                Ok(ders.concat())
            },
            Value::Tagged(t) => {
                if t.explicit {
                    t.inner.encode_der()
                } else {
                    t.inner.encode_content()
                }
            },
            Value::Unknown(_, der) => {
                let (_, _, id_len) = Tag::decode(der)?;
                let (len, len_len) = tag::decode_length(&der[id_len..])?;
                let len =
                    len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
                let start = id_len + len_len;
                if der.len() < start + len {
                    return Err(Error::parse("Incomplete data"));
                }
                Ok(der[start..start + len].to_vec())
            },
        }
    }

    /// Full DER encoding: identifier, length, content.
    pub fn encode_der(&self) -> Result<Vec<u8>> {
        if let Value::Unknown(_, der) = self {
            return Ok(der.clone());
        }
        let content = self.encode_content()?;
        let mut out = self.tag().encode(self.is_constructed());
        out.extend_from_slice(&tag::encode_length(content.len()));
        out.extend_from_slice(&content);
        Ok(out)
    }

    /// Universal-type parser: dispatches on the leading identifier for
    /// known universal tags. With `allow_unknown`, anything else comes
    /// back as an [`Value::Unknown`] wrapper carrying the raw DER.
    pub fn from_der_opts(data: &[u8], allow_unknown: bool) -> Result<(Value, usize)> {
        let (tag_val, constructed, id_len) = Tag::decode(data)?;
        let (len, len_len) = tag::decode_length(&data[id_len..])?;
        let len = len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
        let start = id_len + len_len;
        if data.len() < start + len {
            return Err(Error::parse("Incomplete data"));
        }
        let content = &data[start..start + len];
        let total = start + len;

        if tag_val.class != TagClass::Universal {
            if allow_unknown {
                return Ok((
                    Value::Unknown(tag_val, data[..total].to_vec()),
                    total,
                ));
            }
            return Err(Error::parse(format!("unknown tag {tag_val}")));
        }

        let value = match tag_val.number {
            universal::NULL => {
                if !content.is_empty() {
                    return Err(Error::parse("Invalid coding"));
                }
                Value::Null
            },
            universal::BOOLEAN => match content {
                [0x00] => Value::Boolean(false),
                [0xff] => Value::Boolean(true),
                _ => return Err(Error::parse("Invalid coding")),
            },
            universal::INTEGER => Value::Integer(decode_integer(content)?),
            universal::ENUMERATED => Value::Enumerated(decode_integer(content)?),
            universal::BIT_STRING => {
                Value::BitString(BitString::decode_content(content)?)
            },
            universal::OCTET_STRING => Value::OctetString(content.to_vec()),
            universal::OBJECT_IDENTIFIER => {
                Value::ObjectIdentifier(Oid::decode_content(content)?)
            },
            universal::UTF8_STRING => Value::Utf8String(decode_utf8(content)?),
            universal::NUMERIC_STRING => {
                Value::NumericString(decode_utf8(content)?)
            },
            universal::PRINTABLE_STRING => {
                Value::PrintableString(decode_utf8(content)?)
            },
            universal::IA5_STRING => Value::Ia5String(decode_utf8(content)?),
            universal::VISIBLE_STRING => {
                Value::VisibleString(decode_utf8(content)?)
            },
            universal::UTC_TIME => Value::UtcTime(decode_utc_time(content)?),
            universal::GENERALIZED_TIME => {
                Value::GeneralizedTime(decode_generalized_time(content)?)
            },
            universal::UNIVERSAL_STRING => {
                Value::UniversalString(decode_utf32(content)?)
            },
            universal::SEQUENCE => {
                Value::Sequence(decode_children(content, allow_unknown)?)
            },
            universal::SET => Value::Set(decode_children(content, allow_unknown)?),
            _ => {
                if allow_unknown {
                    Value::Unknown(tag_val, data[..total].to_vec())
                } else {
                    return Err(Error::parse(format!("unknown tag {tag_val}")));
                }
            },
        };

        if value.is_constructed() != constructed
            && !matches!(value, Value::Unknown(_, _))
        {
            return Err(Error::parse("Invalid coding"));
        }
        Ok((value, total))
    }

    pub fn from_der(data: &[u8]) -> Result<(Value, usize)> {
        Value::from_der_opts(data, false)
    }

    pub fn as_integer(&self) -> Option<&BigInt> {
        match self {
            Value::Integer(n) | Value::Enumerated(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_oid(&self) -> Option<&Oid> {
        match self {
            Value::ObjectIdentifier(oid) => Some(oid),
            _ => None,
        }
    }

    pub fn as_octets(&self) -> Option<&[u8]> {
        match self {
            Value::OctetString(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_bit_string(&self) -> Option<&BitString> {
        match self {
            Value::BitString(bits) => Some(bits),
            _ => None,
        }
    }

    pub fn as_constructed(&self) -> Option<&Constructed> {
        match self {
            Value::Sequence(c)
            | Value::SequenceOf(c)
            | Value::Set(c)
            | Value::SetOf(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8String(s)
            | Value::NumericString(s)
            | Value::PrintableString(s)
            | Value::Ia5String(s)
            | Value::VisibleString(s)
            | Value::UniversalString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::UtcTime(t) | Value::GeneralizedTime(t) => Some(t),
            _ => None,
        }
    }

    /// Unwraps a tagged value, or returns the value itself.
    pub fn untagged(&self) -> &Value {
        match self {
            Value::Tagged(t) => &t.inner,
            other => other,
        }
    }
}

fn decode_children(content: &[u8], allow_unknown: bool) -> Result<Constructed> {
    let mut out = Constructed::new();
    let mut offset = 0;
    while offset < content.len() {
        let (child, used) = Value::from_der_opts(&content[offset..], allow_unknown)?;
        out.push(child);
        offset += used;
    }
    Ok(out)
}

fn decode_integer(content: &[u8]) -> Result<BigInt> {
    if content.is_empty() {
        return Err(Error::parse("Invalid coding"));
    }
    if content.len() > 1 {
        // Reject redundant leading octets; DER integers are minimal.
        let redundant = (content[0] == 0x00 && content[1] & 0x80 == 0)
            || (content[0] == 0xff && content[1] & 0x80 != 0);
        if redundant {
            return Err(Error::parse("Invalid coding"));
        }
    }
    Ok(BigInt::from_signed_bytes_be(content))
}

fn decode_utf8(content: &[u8]) -> Result<String> {
    String::from_utf8(content.to_vec())
        .map_err(|_| Error::parse("invalid UTF-8 in string value"))
}

fn decode_utf32(content: &[u8]) -> Result<String> {
    if content.len() % 4 != 0 {
        return Err(Error::parse("Invalid coding"));
    }
    let mut out = String::with_capacity(content.len() / 4);
    for chunk in content.chunks_exact(4) {
        let code = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.push(
            char::from_u32(code)
                .ok_or_else(|| Error::parse("invalid UTF-32 code point"))?,
        );
    }
    Ok(out)
}

fn check_charset(s: &str, allowed: impl Fn(char) -> bool) -> Result<()> {
    if let Some(bad) = s.chars().find(|c| !allowed(*c)) {
        return Err(Error::parse(format!(
            "character {bad:?} not allowed in string type"
        )));
    }
    Ok(())
}

fn is_printable_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || " '()+,-./:=?".contains(c)
}

fn encode_utc_time(t: &DateTime<Utc>) -> Result<Vec<u8>> {
    let year = t.year();
    if !(1950..2050).contains(&year) {
        return Err(Error::parse("year out of UTCTime range"));
    }
    if t.nanosecond() != 0 {
        return Err(Error::parse("UTCTime does not carry fractional seconds"));
    }
    Ok(format!(
        "{:02}{:02}{:02}{:02}{:02}{:02}Z",
        year % 100,
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    )
    .into_bytes())
}

fn decode_utc_time(content: &[u8]) -> Result<DateTime<Utc>> {
    let s = std::str::from_utf8(content)
        .map_err(|_| Error::parse("Invalid coding"))?;
    if s.len() != 13 || !s.ends_with('Z') {
        return Err(Error::parse("Invalid coding"));
    }
    let digits = &s[..12];
    let parse2 = |i: usize| -> Result<u32> {
        digits[i..i + 2]
            .parse()
            .map_err(|_| Error::parse("Invalid coding"))
    };
    let yy = parse2(0)?;
    let year = if yy >= 50 { 1900 + yy } else { 2000 + yy } as i32;
    make_datetime(year, parse2(2)?, parse2(4)?, parse2(6)?, parse2(8)?, parse2(10)?, 0)
}

fn encode_generalized_time(t: &DateTime<Utc>) -> Result<Vec<u8>> {
    if t.nanosecond() % 1000 != 0 {
        return Err(Error::parse(
            "GeneralizedTime precision is limited to microseconds",
        ));
    }
    let mut s = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    let micros = t.nanosecond() / 1000;
    if micros > 0 {
        let frac = format!("{micros:06}");
        s.push('.');
        s.push_str(frac.trim_end_matches('0'));
    }
    s.push('Z');
    Ok(s.into_bytes())
}

fn decode_generalized_time(content: &[u8]) -> Result<DateTime<Utc>> {
    let s = std::str::from_utf8(content)
        .map_err(|_| Error::parse("Invalid coding"))?;
    let Some(s) = s.strip_suffix('Z') else {
        return Err(Error::parse("Invalid coding"));
    };
    if s.len() < 14 {
        return Err(Error::parse("Invalid coding"));
    }
    let (base, frac) = s.split_at(14);
    let micros = if frac.is_empty() {
        0
    } else {
        let Some(frac) = frac.strip_prefix('.') else {
            return Err(Error::parse("Invalid coding"));
        };
        if frac.is_empty() || frac.len() > 6 {
            return Err(Error::parse("Invalid coding"));
        }
        let value: u32 = frac
            .parse()
            .map_err(|_| Error::parse("Invalid coding"))?;
        value * 10u32.pow(6 - frac.len() as u32)
    };
    let parse2 = |i: usize| -> Result<u32> {
        base[i..i + 2]
            .parse()
            .map_err(|_| Error::parse("Invalid coding"))
    };
    let year: i32 = base[..4]
        .parse()
        .map_err(|_| Error::parse("Invalid coding"))?;
    make_datetime(
        year,
        parse2(4)?,
        parse2(6)?,
        parse2(8)?,
        parse2(10)?,
        parse2(12)?,
        micros,
    )
}

fn make_datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> Result<DateTime<Utc>> {
    Utc.with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .map(|t| t + chrono::Duration::microseconds(micros as i64))
        .ok_or_else(|| Error::parse("invalid time value"))
}

/// Convenience constructor for unsigned integers.
pub fn uint_value(n: &BigUint) -> Value {
    Value::Integer(BigInt::from(n.clone()))
}
