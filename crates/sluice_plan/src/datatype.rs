//! Datatypes, the restriction partial order, and compound (tabular) types.
//!
//! A datatype may restrict any number of other datatypes. Restriction is
//! reflexive and transitive: `integer` restricts `float`, which restricts
//! `string`, so an integer column is acceptable wherever a string is.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Primitive representation a datatype bottoms out in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinType {
    /// Any text
    String,
    /// Signed integer
    Integer,
    /// Floating point number
    Float,
    /// `true`/`false` (also `t`/`f`, `1`/`0`)
    Boolean,
}

impl BuiltinType {
    /// Check a single cell value
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason if the value does not parse
    pub fn check(&self, value: &str) -> Result<(), String> {
        match self {
            Self::String => Ok(()),
            Self::Integer => value
                .trim()
                .parse::<i64>()
                .map(|_| ())
                .map_err(|_| format!("was not integer: {:?}", value)),
            Self::Float => value
                .trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| format!("was not float: {:?}", value)),
            Self::Boolean => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "false" | "t" | "f" | "1" | "0" | "yes" | "no" | "y" | "n" => Ok(()),
                _ => Err(format!("was not boolean: {:?}", value)),
            },
        }
    }
}

/// A named datatype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datatype {
    /// Unique name
    pub name: String,
    /// How cells of this type are checked
    pub builtin: BuiltinType,
    /// Names of the datatypes this one restricts
    #[serde(default)]
    pub restricts: Vec<String>,
}

impl Datatype {
    /// Create a datatype with no restrictions
    #[must_use]
    pub fn new(name: impl Into<String>, builtin: BuiltinType) -> Self {
        Self {
            name: name.into(),
            builtin,
            restricts: Vec::new(),
        }
    }

    /// Add a supertype
    #[must_use]
    pub fn restricting(mut self, supertype: impl Into<String>) -> Self {
        self.restricts.push(supertype.into());
        self
    }
}

/// Registry of datatypes keyed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatatypeRegistry {
    types: IndexMap<String, Datatype>,
}

impl DatatypeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: IndexMap::new(),
        }
    }

    /// Registry holding the four builtin datatypes
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Datatype::new("string", BuiltinType::String));
        reg.register(Datatype::new("float", BuiltinType::Float).restricting("string"));
        reg.register(Datatype::new("integer", BuiltinType::Integer).restricting("float"));
        reg.register(Datatype::new("boolean", BuiltinType::Boolean).restricting("string"));
        reg
    }

    /// Add or replace a datatype
    pub fn register(&mut self, datatype: Datatype) {
        self.types.insert(datatype.name.clone(), datatype);
    }

    /// Look up a datatype
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Datatype> {
        self.types.get(name)
    }

    /// Whether a datatype is known
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Whether `sub` restricts `sup` (reflexive and transitive)
    #[must_use]
    pub fn is_restriction(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        let mut stack = vec![sub];
        let mut seen = Vec::new();
        while let Some(current) = stack.pop() {
            if seen.contains(&current) {
                continue;
            }
            seen.push(current);
            if let Some(dt) = self.types.get(current) {
                for parent in &dt.restricts {
                    if parent == sup {
                        return true;
                    }
                    stack.push(parent.as_str());
                }
            }
        }
        false
    }

    /// Builtin representation used to check cells of a datatype
    #[must_use]
    pub fn builtin_of(&self, name: &str) -> BuiltinType {
        self.types
            .get(name)
            .map_or(BuiltinType::String, |dt| dt.builtin)
    }

    /// Number of registered datatypes
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for DatatypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// One column of a compound datatype
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// 1-based column position
    pub idx: u32,
    /// Header name
    pub name: String,
    /// Datatype name
    pub datatype: String,
}

impl ColumnSpec {
    /// Create a column
    #[must_use]
    pub fn new(idx: u32, name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            idx,
            name: name.into(),
            datatype: datatype.into(),
        }
    }
}

/// Tabular datatype: an ordered list of typed, named columns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundDatatype {
    /// Unique name
    pub name: String,
    /// Columns in position order
    pub columns: Vec<ColumnSpec>,
}

impl CompoundDatatype {
    /// Create a compound datatype, sorting columns by position
    #[must_use]
    pub fn new(name: impl Into<String>, mut columns: Vec<ColumnSpec>) -> Self {
        columns.sort_by_key(|c| c.idx);
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Expected header row
    #[must_use]
    pub fn header(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Column at a 1-based position
    #[must_use]
    pub fn column(&self, idx: u32) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.idx == idx)
    }

    /// Number of columns
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Whether every column of `self` restricts the same-named column of `other`
    #[must_use]
    pub fn is_restriction_of(&self, other: &Self, registry: &DatatypeRegistry) -> bool {
        if self.name == other.name {
            return true;
        }
        self.columns.len() == other.columns.len()
            && self.columns.iter().zip(&other.columns).all(|(mine, theirs)| {
                mine.idx == theirs.idx
                    && mine.name == theirs.name
                    && registry.is_restriction(&mine.datatype, &theirs.datatype)
            })
    }
}
