// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! X.501 names: a map from attribute-type OID to string value, encoded
//! as an RDNSequence of single-element sets.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;

use crate::{
    asn1::{Def, Oid, SequenceDef, Value, value::Constructed},
    error::{Error, Result},
};

/// Attribute types addressable by a short name.
static ATTRIBUTES: Lazy<Vec<(&'static str, Oid)>> = Lazy::new(|| {
    vec![
        ("common_name", Oid::new(&[2, 5, 4, 3])),
        ("serial_number", Oid::new(&[2, 5, 4, 5])),
        ("country", Oid::new(&[2, 5, 4, 6])),
        ("locality", Oid::new(&[2, 5, 4, 7])),
        ("state_or_province", Oid::new(&[2, 5, 4, 8])),
        ("organization", Oid::new(&[2, 5, 4, 10])),
        ("organizational_unit", Oid::new(&[2, 5, 4, 11])),
        ("dn_qualifier", Oid::new(&[2, 5, 4, 46])),
    ]
});

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Name {
    attrs: BTreeMap<Oid, String>,
}

impl Name {
    pub fn new() -> Self {
        Name::default()
    }

    /// OID registered for a short attribute name.
    pub fn oid_for(attr: &str) -> Option<Oid> {
        ATTRIBUTES
            .iter()
            .find(|(name, _)| *name == attr)
            .map(|(_, oid)| oid.clone())
    }

    pub fn set(&mut self, oid: Oid, value: impl Into<String>) {
        self.attrs.insert(oid, value.into());
    }

    /// Sets an attribute by its short name, e.g. `common_name`.
    pub fn set_attr(&mut self, attr: &str, value: impl Into<String>) -> Result<()> {
        let oid = Name::oid_for(attr)
            .ok_or_else(|| Error::validation(format!("unknown attribute {attr}")))?;
        self.set(oid, value);
        Ok(())
    }

    pub fn get(&self, oid: &Oid) -> Option<&str> {
        self.attrs.get(oid).map(String::as_str)
    }

    pub fn get_attr(&self, attr: &str) -> Option<&str> {
        Name::oid_for(attr).and_then(|oid| self.get(&oid))
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Oid, &str)> {
        self.attrs.iter().map(|(oid, v)| (oid, v.as_str()))
    }

    /// RDNSequence parse template.
    pub fn def() -> Def {
        let atv = SequenceDef::new()
            .field(Def::ObjectIdentifier, "type")
            .field(Def::Any { allow_unknown: false }, "value");
        Def::sequence_of(Def::set_of(Def::sequence(atv)))
    }

    /// Builds the RDNSequence value: one single-element SET per
    /// attribute.
    pub fn to_asn1(&self) -> Value {
        let mut rdns = Constructed::new();
        for (oid, value) in &self.attrs {
            let mut atv = Constructed::new();
            atv.push_named(Value::ObjectIdentifier(oid.clone()), "type");
            atv.push_named(Value::Utf8String(value.clone()), "value");
            let mut set = Constructed::new();
            set.push(Value::Sequence(atv));
            rdns.push(Value::SetOf(set));
        }
        Value::SequenceOf(rdns)
    }

    pub fn encode_der(&self) -> Result<Vec<u8>> {
        self.to_asn1().encode_der()
    }

    pub fn from_asn1(value: &Value) -> Result<Name> {
        let rdns = value
            .as_constructed()
            .ok_or_else(|| Error::parse("name is not an RDN sequence"))?;
        let mut name = Name::new();
        for rdn in rdns.values() {
            let set = rdn
                .as_constructed()
                .ok_or_else(|| Error::parse("RDN is not a set"))?;
            for atv in set.values() {
                let atv = atv
                    .as_constructed()
                    .ok_or_else(|| Error::parse("bad attribute value shape"))?;
                let oid = atv
                    .values()
                    .next()
                    .and_then(Value::as_oid)
                    .ok_or_else(|| Error::parse("attribute type is not an OID"))?;
                let text = atv
                    .values()
                    .nth(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::parse("attribute value is not a string"))?;
                name.set(oid.clone(), text);
            }
        }
        Ok(name)
    }

    pub fn import_der(data: &[u8]) -> Result<Name> {
        let value = Name::def().parse_exact(data)?;
        Name::from_asn1(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_der_roundtrip() {
        let mut name = Name::new();
        name.set_attr("common_name", "channel.example").expect("attr");
        name.set_attr("organization", "Example Org").expect("attr");
        name.set_attr("country", "NO").expect("attr");

        let der = name.encode_der().expect("encode");
        let back = Name::import_der(&der).expect("import");
        assert_eq!(back, name);
        assert_eq!(back.get_attr("common_name"), Some("channel.example"));
    }

    #[test]
    fn unknown_attribute_is_rejected() {
        let mut name = Name::new();
        assert!(name.set_attr("favourite_color", "green").is_err());
    }
}
