// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Structural templates that drive DER parsing.
//!
//! A definition mirrors one production of a schema: sequences and sets
//! carry ordered field lists with per-field names, optionality and
//! defaults; choices carry their alternatives keyed by tag; tagged
//! definitions rewrite or wrap the inner encoding. Parsing a definition
//! yields a [`Value`] tree with named children.

use std::rc::Rc;

use crate::{
    asn1::{
        tag::{self, Tag, TagClass, universal},
        value::{Constructed, TaggedValue, Value},
    },
    error::{Error, Result},
};

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub def: Def,
    pub name: Option<String>,
    pub optional: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct SequenceDef {
    pub fields: Vec<FieldDef>,
}

impl SequenceDef {
    pub fn new() -> Self {
        SequenceDef::default()
    }

    pub fn field(mut self, def: Def, name: &str) -> Self {
        self.fields.push(FieldDef {
            def,
            name: Some(name.to_string()),
            optional: false,
            default: None,
        });
        self
    }

    pub fn optional(mut self, def: Def, name: &str) -> Self {
        self.fields.push(FieldDef {
            def,
            name: Some(name.to_string()),
            optional: true,
            default: None,
        });
        self
    }

    pub fn with_default(mut self, def: Def, name: &str, default: Value) -> Self {
        self.fields.push(FieldDef {
            def,
            name: Some(name.to_string()),
            optional: false,
            default: Some(default),
        });
        self
    }
}

#[derive(Debug, Clone)]
pub enum Def {
    /// Any universal value; unknown tags wrap as raw DER when allowed.
    Any { allow_unknown: bool },
    Null,
    Boolean,
    Integer,
    BitString,
    OctetString,
    ObjectIdentifier,
    Enumerated,
    Utf8String,
    NumericString,
    PrintableString,
    Ia5String,
    VisibleString,
    UtcTime,
    GeneralizedTime,
    UniversalString,
    Sequence(Rc<SequenceDef>),
    SequenceOf(Rc<Def>),
    Set(Rc<SequenceDef>),
    SetOf(Rc<Def>),
    /// Alternatives dispatched by the peeked tag.
    Choice(Rc<Vec<Def>>),
    Tagged {
        tag: Tag,
        explicit: bool,
        inner: Rc<Def>,
    },
}

impl Def {
    pub fn sequence(def: SequenceDef) -> Self {
        Def::Sequence(Rc::new(def))
    }

    pub fn sequence_of(inner: Def) -> Self {
        Def::SequenceOf(Rc::new(inner))
    }

    pub fn set(def: SequenceDef) -> Self {
        Def::Set(Rc::new(def))
    }

    pub fn set_of(inner: Def) -> Self {
        Def::SetOf(Rc::new(inner))
    }

    pub fn choice(alts: Vec<Def>) -> Self {
        Def::Choice(Rc::new(alts))
    }

    pub fn explicit(tag_number: u32, inner: Def) -> Self {
        Def::Tagged {
            tag: Tag::context(tag_number),
            explicit: true,
            inner: Rc::new(inner),
        }
    }

    pub fn implicit(tag_number: u32, inner: Def) -> Self {
        Def::Tagged {
            tag: Tag::context(tag_number),
            explicit: false,
            inner: Rc::new(inner),
        }
    }

    /// The identifier tag this definition produces, when unambiguous.
    pub fn natural_tag(&self) -> Option<Tag> {
        let number = match self {
            Def::Any { .. } | Def::Choice(_) => return None,
            Def::Tagged { tag, .. } => return Some(*tag),
            Def::Null => universal::NULL,
            Def::Boolean => universal::BOOLEAN,
            Def::Integer => universal::INTEGER,
            Def::BitString => universal::BIT_STRING,
            Def::OctetString => universal::OCTET_STRING,
            Def::ObjectIdentifier => universal::OBJECT_IDENTIFIER,
            Def::Enumerated => universal::ENUMERATED,
            Def::Utf8String => universal::UTF8_STRING,
            Def::NumericString => universal::NUMERIC_STRING,
            Def::PrintableString => universal::PRINTABLE_STRING,
            Def::Ia5String => universal::IA5_STRING,
            Def::VisibleString => universal::VISIBLE_STRING,
            Def::UtcTime => universal::UTC_TIME,
            Def::GeneralizedTime => universal::GENERALIZED_TIME,
            Def::UniversalString => universal::UNIVERSAL_STRING,
            Def::Sequence(_) | Def::SequenceOf(_) => universal::SEQUENCE,
            Def::Set(_) | Def::SetOf(_) => universal::SET,
        };
        Some(Tag::universal(number))
    }

    /// True if a value with identifier `t` can parse under this
    /// definition.
    pub fn matches(&self, t: Tag) -> bool {
        match self {
            Def::Any { .. } => true,
            Def::Choice(alts) => alts.iter().any(|alt| alt.matches(t)),
            other => other.natural_tag() == Some(t),
        }
    }

    /// Parses one value: `(value, octets_used)`.
    pub fn parse(&self, data: &[u8]) -> Result<(Value, usize)> {
        match self {
            Def::Any { allow_unknown } => Value::from_der_opts(data, *allow_unknown),
            Def::Sequence(seq_def) => {
                let (content, total) =
                    expect_constructed(data, universal::SEQUENCE)?;
                let children = parse_sequence_fields(&seq_def.fields, content)?;
                Ok((Value::Sequence(children), total))
            },
            Def::SequenceOf(inner) => {
                let (content, total) =
                    expect_constructed(data, universal::SEQUENCE)?;
                let mut out = Constructed::new();
                let mut offset = 0;
                while offset < content.len() {
                    let (child, used) = inner.parse(&content[offset..])?;
                    out.push(child);
                    offset += used;
                }
                Ok((Value::SequenceOf(out), total))
            },
            Def::Set(seq_def) => {
                let (content, total) = expect_constructed(data, universal::SET)?;
                let children = parse_set_fields(&seq_def.fields, content)?;
                Ok((Value::Set(children), total))
            },
            Def::SetOf(inner) => {
                let (content, total) = expect_constructed(data, universal::SET)?;
                let mut out = Constructed::new();
                let mut offset = 0;
                while offset < content.len() {
                    let (child, used) = inner.parse(&content[offset..])?;
                    out.push(child);
                    offset += used;
                }
                Ok((Value::SetOf(out), total))
            },
            Def::Choice(alts) => {
                let (t, _, _) = Tag::decode(data)?;
                let alt = alts
                    .iter()
                    .find(|alt| alt.matches(t))
                    .ok_or_else(|| {
                        Error::parse(format!("tag {t} not allowed by choice"))
                    })?;
                alt.parse(data)
            },
            Def::Tagged {
                tag: expected,
                explicit,
                inner,
            } => {
                let (t, constructed, id_len) = Tag::decode(data)?;
                if t != *expected {
                    return Err(Error::parse("Explicit tag mismatch"));
                }
                let (len, len_len) = tag::decode_length(&data[id_len..])?;
                let len = len.ok_or_else(|| {
                    Error::parse("Indefinite length not supported")
                })?;
                let start = id_len + len_len;
                if data.len() < start + len {
                    return Err(Error::parse("Incomplete data"));
                }
                let content = &data[start..start + len];
                let total = start + len;

                let inner_value = if *explicit {
                    if !constructed {
                        return Err(Error::parse("Explicit tag mismatch"));
                    }
                    let (value, used) = inner.parse(content)?;
                    if used != len {
                        return Err(Error::parse("Invalid coding"));
                    }
                    value
                } else {
                    // Rewrite the identifier octets back to the inner
                    // definition's natural tag, keeping the constructed
                    // bit from the wire.
                    let natural = inner.natural_tag().ok_or_else(|| {
                        Error::parse("implicit tag over ambiguous definition")
                    })?;
                    let mut rebuilt = natural.encode(constructed);
                    rebuilt.extend_from_slice(&tag::encode_length(len));
                    rebuilt.extend_from_slice(content);
                    let (value, used) = inner.parse(&rebuilt)?;
                    if used != rebuilt.len() {
                        return Err(Error::parse("Invalid coding"));
                    }
                    value
                };
                Ok((
                    Value::Tagged(Box::new(TaggedValue {
                        tag: *expected,
                        explicit: *explicit,
                        inner: inner_value,
                    })),
                    total,
                ))
            },
            primitive => {
                let (t, _, _) = Tag::decode(data)?;
                if !primitive.matches(t) {
                    return Err(Error::parse(format!(
                        "unexpected tag {t} for {primitive:?}"
                    )));
                }
                Value::from_der(data)
            },
        }
    }

    /// Parses and requires the input to be fully consumed.
    pub fn parse_exact(&self, data: &[u8]) -> Result<Value> {
        let (value, used) = self.parse(data)?;
        if used != data.len() {
            return Err(Error::parse("Invalid coding"));
        }
        Ok(value)
    }
}

fn expect_constructed(data: &[u8], number: u32) -> Result<(&[u8], usize)> {
    let (t, constructed, id_len) = Tag::decode(data)?;
    if t != Tag::universal(number) || !constructed {
        return Err(Error::parse(format!("unexpected tag {t}")));
    }
    let (len, len_len) = tag::decode_length(&data[id_len..])?;
    let len = len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
    let start = id_len + len_len;
    if data.len() < start + len {
        return Err(Error::parse("Incomplete data"));
    }
    Ok((&data[start..start + len], start + len))
}

fn parse_sequence_fields(fields: &[FieldDef], content: &[u8]) -> Result<Constructed> {
    let mut out = Constructed::new();
    let mut offset = 0;
    for field in fields {
        let next_tag = if offset < content.len() {
            Some(Tag::decode(&content[offset..])?.0)
        } else {
            None
        };
        if let Some(t) = next_tag
            && field.def.matches(t)
        {
            let (value, used) = field.def.parse(&content[offset..])?;
            match &field.name {
                Some(name) => out.push_named(value, name.clone()),
                None => out.push(value),
            }
            offset += used;
            continue;
        }
        if let Some(default) = &field.default {
            out.push_default(default.clone(), field.name.clone());
        } else if field.optional {
            continue;
        } else {
            return Err(Error::parse(format!(
                "missing required element {}",
                field.name.as_deref().unwrap_or("<unnamed>")
            )));
        }
    }
    if offset != content.len() {
        return Err(Error::parse("Invalid coding"));
    }
    Ok(out)
}

fn parse_set_fields(fields: &[FieldDef], content: &[u8]) -> Result<Constructed> {
    let mut parsed: Vec<Option<Value>> = vec![None; fields.len()];
    let mut offset = 0;
    while offset < content.len() {
        let (t, _, _) = Tag::decode(&content[offset..])?;
        let index = fields
            .iter()
            .position(|f| f.def.matches(t))
            .ok_or_else(|| Error::parse(format!("tag {t} not allowed in set")))?;
        if parsed[index].is_some() {
            return Err(Error::parse(format!("duplicate tag {t} in set")));
        }
        let (value, used) = fields[index].def.parse(&content[offset..])?;
        parsed[index] = Some(value);
        offset += used;
    }

    let mut out = Constructed::new();
    for (field, slot) in fields.iter().zip(parsed) {
        match slot {
            Some(value) => match &field.name {
                Some(name) => out.push_named(value, name.clone()),
                None => out.push(value),
            },
            None => {
                if let Some(default) = &field.default {
                    out.push_default(default.clone(), field.name.clone());
                } else if !field.optional {
                    return Err(Error::parse(format!(
                        "missing required element {}",
                        field.name.as_deref().unwrap_or("<unnamed>")
                    )));
                }
            },
        }
    }
    Ok(out)
}

/// Helper used by set parsing of raw values and extension scans: total
/// octets of the TLV at the head of `data`.
pub fn element_span(data: &[u8]) -> Result<usize> {
    let (_, _, id_len) = Tag::decode(data)?;
    let (len, len_len) = tag::decode_length(&data[id_len..])?;
    let len = len.ok_or_else(|| Error::parse("Indefinite length not supported"))?;
    Ok(id_len + len_len + len)
}

/// Returns true when the value's identifier belongs to the context
/// class with the given number; used when scanning optional slots.
pub fn is_context(value: &Value, number: u32) -> bool {
    let t = value.tag();
    t.class == TagClass::Context && t.number == number
}
