//! A format-neutral parameter tree.
//!
//! A [`ParamList`] keeps its entries in insertion order and (de)serializes as
//! a map, so any serde format that has maps can carry adapt parameters.

use super::error::ConfigError;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// One parameter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(String),
    List(ParamList),
}

impl ParamValue {
    fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Int(_) => "int",
            ParamValue::Real(_) => "real",
            ParamValue::Str(_) => "string",
            ParamValue::List(_) => "sublist",
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Real(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<ParamList> for ParamValue {
    fn from(v: ParamList) -> Self {
        ParamValue::List(v)
    }
}

/// Named parameters in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParamList {
    entries: Vec<(String, ParamValue)>,
}

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite an entry, keeping its original position.
    pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> &mut Self {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_owned(), value)),
        }
        self
    }

    /// Builder form of [`ParamList::set`].
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_sublist(&self, name: &str) -> bool {
        matches!(self.get(name), Some(ParamValue::List(_)))
    }

    /// The sublist `name`, if present; a plain value there is an error.
    pub fn sublist(&self, name: &str) -> Result<Option<&ParamList>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::List(l)) => Ok(Some(l)),
            Some(_) => Err(ConfigError::ExpectedSublist(name.to_owned())),
        }
    }

    fn wrong(name: &str, expected: &'static str) -> ConfigError {
        ConfigError::WrongType {
            param: name.to_owned(),
            expected,
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(Self::wrong(name, "bool")),
        }
    }

    /// A real parameter; integers are accepted.
    pub fn get_real(&self, name: &str) -> Result<Option<f64>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Real(x)) => Ok(Some(*x)),
            Some(ParamValue::Int(i)) => Ok(Some(*i as f64)),
            Some(_) => Err(Self::wrong(name, "real")),
        }
    }

    /// A non-negative integer parameter.
    pub fn get_count(&self, name: &str) -> Result<Option<usize>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Int(i)) => usize::try_from(*i).map(Some).map_err(|_| ConfigError::InvalidValue {
                param: name.to_owned(),
                reason: format!("{i} is negative"),
            }),
            Some(_) => Err(Self::wrong(name, "int")),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>, ConfigError> {
        match self.get(name) {
            None => Ok(None),
            Some(ParamValue::Str(s)) => Ok(Some(s)),
            Some(_) => Err(Self::wrong(name, "string")),
        }
    }

    /// Like [`ParamList::get_str`] but the entry must exist.
    pub fn require_str(&self, name: &str) -> Result<&str, ConfigError> {
        self.get_str(name)?.ok_or_else(|| ConfigError::MissingEntry(name.to_owned()))
    }
}

impl fmt::Display for ParamList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_level(list: &ParamList, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            for (name, value) in list.iter() {
                let pad = "  ".repeat(depth);
                match value {
                    ParamValue::List(sub) => {
                        writeln!(f, "{pad}{name}:")?;
                        write_level(sub, depth + 1, f)?;
                    }
                    ParamValue::Bool(b) => writeln!(f, "{pad}{name}: {b}")?,
                    ParamValue::Int(i) => writeln!(f, "{pad}{name}: {i}")?,
                    ParamValue::Real(x) => writeln!(f, "{pad}{name}: {x}")?,
                    ParamValue::Str(s) => writeln!(f, "{pad}{name}: \"{s}\"")?,
                }
            }
            Ok(())
        }
        write_level(self, 0, f)
    }
}

impl Serialize for ParamList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

struct ParamListVisitor;

impl<'de> Visitor<'de> for ParamListVisitor {
    type Value = ParamList;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a map of parameters")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<ParamList, A::Error> {
        let mut list = ParamList::new();
        while let Some((name, value)) = access.next_entry::<String, ParamValue>()? {
            list.set(&name, value);
        }
        Ok(list)
    }
}

impl<'de> Deserialize<'de> for ParamList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ParamListVisitor)
    }
}

impl ParamValue {
    /// Diagnostic name of the stored type.
    pub fn kind(&self) -> &'static str {
        self.type_name()
    }
}
