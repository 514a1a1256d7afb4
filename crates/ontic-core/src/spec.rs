//! Canonical type specs.
//!
//! A [`TypeSpec`] is the authoritative structured description of a field's
//! type, used for drift detection, payload normalisation and column
//! classification. The tree has six node kinds; recursive shapes are
//! expressed with a named [`TypeSpec::Ref`] back-edge rather than an
//! object graph.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_hash, to_canonical_json};

/// Primitive leaf types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Primitive {
    Str,
    Int,
    Float,
    Bool,
    Datetime,
    Null,
}

impl Primitive {
    /// Stable lowercase name, used in the legacy string grammar.
    pub fn as_str(&self) -> &'static str {
        match self {
            Primitive::Str => "str",
            Primitive::Int => "int",
            Primitive::Float => "float",
            Primitive::Bool => "bool",
            Primitive::Datetime => "datetime",
            Primitive::Null => "null",
        }
    }
}

/// Canonical type description tree.
///
/// The derived equality is exact tree equality; schema comparison uses
/// [`TypeSpec::structurally_equal`], which normalises unions and
/// resolves `ref` back-edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeSpec {
    /// A scalar leaf.
    Primitive {
        /// Which primitive.
        name: Primitive,
    },
    /// Homogeneous ordered list.
    List {
        /// Element type.
        item: Box<TypeSpec>,
    },
    /// Open string-keyed mapping.
    Dict {
        /// Value type.
        value: Box<TypeSpec>,
    },
    /// Union of alternatives; members kept sorted by canonical JSON.
    Union {
        /// Member types.
        members: Vec<TypeSpec>,
    },
    /// Closed record with named fields, keys sorted lexicographically.
    TypedDict {
        /// Simple name of the record shape (qualified on collision).
        name: String,
        /// Field name to field type.
        fields: BTreeMap<String, TypeSpec>,
    },
    /// Back-edge to an enclosing [`TypeSpec::TypedDict`] by name.
    Ref {
        /// Name of the referenced typed dict.
        name: String,
    },
}

impl TypeSpec {
    // -- Constructors --------------------------------------------------------

    pub fn str() -> Self {
        TypeSpec::Primitive { name: Primitive::Str }
    }

    pub fn int() -> Self {
        TypeSpec::Primitive { name: Primitive::Int }
    }

    pub fn float() -> Self {
        TypeSpec::Primitive { name: Primitive::Float }
    }

    pub fn bool() -> Self {
        TypeSpec::Primitive { name: Primitive::Bool }
    }

    pub fn datetime() -> Self {
        TypeSpec::Primitive {
            name: Primitive::Datetime,
        }
    }

    pub fn null() -> Self {
        TypeSpec::Primitive { name: Primitive::Null }
    }

    pub fn list(item: TypeSpec) -> Self {
        TypeSpec::List { item: Box::new(item) }
    }

    pub fn dict(value: TypeSpec) -> Self {
        TypeSpec::Dict { value: Box::new(value) }
    }

    pub fn union(members: impl IntoIterator<Item = TypeSpec>) -> Self {
        TypeSpec::Union {
            members: members.into_iter().collect(),
        }
    }

    /// `optional[T]` is modelled as `union[T, null]`.
    pub fn optional(inner: TypeSpec) -> Self {
        TypeSpec::union([inner, TypeSpec::null()])
    }

    pub fn typed_dict(
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (&'static str, TypeSpec)>,
    ) -> Self {
        TypeSpec::TypedDict {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    pub fn reference(name: impl Into<String>) -> Self {
        TypeSpec::Ref { name: name.into() }
    }

    // -- Classification ------------------------------------------------------

    /// Returns `true` for a bare scalar leaf (not unions of scalars).
    pub fn is_scalar(&self) -> bool {
        matches!(self, TypeSpec::Primitive { .. })
    }

    /// Returns `true` for list-typed specs, including `optional[list[..]]`.
    pub fn is_list(&self) -> bool {
        match self {
            TypeSpec::List { .. } => true,
            TypeSpec::Union { members } => members.iter().any(|m| matches!(m, TypeSpec::List { .. })),
            _ => false,
        }
    }

    /// The scalar primitive this spec maps to as a typed storage column,
    /// if it is classified as one. `optional[P]` also classifies, since
    /// storage columns are nullable; mixed unions do not.
    pub fn scalar_column(&self) -> Option<Primitive> {
        match self {
            TypeSpec::Primitive { name } if *name != Primitive::Null => Some(*name),
            TypeSpec::Union { members } => {
                let non_null: Vec<&TypeSpec> = members
                    .iter()
                    .filter(|m| !matches!(m, TypeSpec::Primitive { name: Primitive::Null }))
                    .collect();
                match non_null.as_slice() {
                    [TypeSpec::Primitive { name }] if *name != Primitive::Null => Some(*name),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Statically follows dot-path segments through the tree: typed
    /// dicts by field name, dicts into their value type, optional
    /// wrappers transparently. An empty path resolves to `self`.
    pub fn resolve_path(&self, segments: &[String]) -> PathResolution<'_> {
        let mut current = self;
        for segment in segments {
            // Unwrap optional wrappers before descending.
            loop {
                match current {
                    TypeSpec::Union { members } => {
                        let non_null: Vec<&TypeSpec> = members
                            .iter()
                            .filter(|m| {
                                !matches!(m, TypeSpec::Primitive { name: Primitive::Null })
                            })
                            .collect();
                        match non_null.as_slice() {
                            [single] => current = *single,
                            _ => return PathResolution::Unknown,
                        }
                    }
                    _ => break,
                }
            }
            current = match current {
                TypeSpec::TypedDict { fields, .. } => match fields.get(segment) {
                    Some(spec) => spec,
                    None => return PathResolution::Never,
                },
                TypeSpec::Dict { value } => value,
                TypeSpec::Ref { .. } => return PathResolution::Unknown,
                // Scalars and lists have no named members to descend into.
                _ => return PathResolution::Never,
            };
        }
        PathResolution::Resolved(current)
    }

    // -- Canonical form ------------------------------------------------------

    /// Returns the canonicalised tree: union members sorted by their
    /// canonical JSON rendering, recursively. Object keys are already
    /// sorted by construction (`BTreeMap`).
    pub fn normalize(&self) -> TypeSpec {
        match self {
            TypeSpec::Primitive { .. } | TypeSpec::Ref { .. } => self.clone(),
            TypeSpec::List { item } => TypeSpec::List {
                item: Box::new(item.normalize()),
            },
            TypeSpec::Dict { value } => TypeSpec::Dict {
                value: Box::new(value.normalize()),
            },
            TypeSpec::Union { members } => {
                let mut normalized: Vec<TypeSpec> =
                    members.iter().map(|m| m.normalize()).collect();
                normalized.sort_by_key(|m| m.canonical_json());
                normalized.dedup_by_key(|m| m.canonical_json());
                TypeSpec::Union { members: normalized }
            }
            TypeSpec::TypedDict { name, fields } => TypeSpec::TypedDict {
                name: name.clone(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.normalize()))
                    .collect(),
            },
        }
    }

    /// Canonical JSON rendering of the normalised tree.
    pub fn canonical_json(&self) -> String {
        let value = serde_json::to_value(self.normalize()).unwrap_or(serde_json::Value::Null);
        to_canonical_json(&value)
    }

    /// Stable SHA-256 fingerprint of the canonical form.
    pub fn fingerprint(&self) -> String {
        let value = serde_json::to_value(self.normalize()).unwrap_or(serde_json::Value::Null);
        canonical_hash(&value)
    }

    // -- Structural equality -------------------------------------------------

    /// Structural equality with `Ref` nodes resolved against the typed
    /// dicts defined in each tree. Two back-edges are equal iff they point
    /// at equal named trees; a visited set breaks cycles.
    pub fn structurally_equal(&self, other: &TypeSpec) -> bool {
        let defs_a = collect_defs(self);
        let defs_b = collect_defs(other);
        let mut visited = HashSet::new();
        eq_inner(
            &self.normalize(),
            &other.normalize(),
            &defs_a,
            &defs_b,
            &mut visited,
        )
    }
}

fn collect_defs(spec: &TypeSpec) -> HashMap<String, TypeSpec> {
    let mut defs = HashMap::new();
    fn walk(spec: &TypeSpec, defs: &mut HashMap<String, TypeSpec>) {
        match spec {
            TypeSpec::TypedDict { name, fields } => {
                defs.entry(name.clone()).or_insert_with(|| spec.normalize());
                for field in fields.values() {
                    walk(field, defs);
                }
            }
            TypeSpec::List { item } => walk(item, defs),
            TypeSpec::Dict { value } => walk(value, defs),
            TypeSpec::Union { members } => {
                for m in members {
                    walk(m, defs);
                }
            }
            TypeSpec::Primitive { .. } | TypeSpec::Ref { .. } => {}
        }
    }
    walk(spec, &mut defs);
    defs
}

fn eq_inner(
    a: &TypeSpec,
    b: &TypeSpec,
    defs_a: &HashMap<String, TypeSpec>,
    defs_b: &HashMap<String, TypeSpec>,
    visited: &mut HashSet<(String, String)>,
) -> bool {
    match (a, b) {
        (TypeSpec::Primitive { name: pa }, TypeSpec::Primitive { name: pb }) => pa == pb,
        (TypeSpec::List { item: ia }, TypeSpec::List { item: ib }) => {
            eq_inner(ia, ib, defs_a, defs_b, visited)
        }
        (TypeSpec::Dict { value: va }, TypeSpec::Dict { value: vb }) => {
            eq_inner(va, vb, defs_a, defs_b, visited)
        }
        (TypeSpec::Union { members: ma }, TypeSpec::Union { members: mb }) => {
            ma.len() == mb.len()
                && ma
                    .iter()
                    .zip(mb.iter())
                    .all(|(x, y)| eq_inner(x, y, defs_a, defs_b, visited))
        }
        (
            TypeSpec::TypedDict { name: na, fields: fa },
            TypeSpec::TypedDict { name: nb, fields: fb },
        ) => {
            if fa.len() != fb.len() {
                return false;
            }
            // Treat the pair as visited so self-referential dicts terminate.
            visited.insert((na.clone(), nb.clone()));
            fa.iter().zip(fb.iter()).all(|((ka, va), (kb, vb))| {
                ka == kb && eq_inner(va, vb, defs_a, defs_b, visited)
            })
        }
        (TypeSpec::Ref { name: na }, TypeSpec::Ref { name: nb }) => {
            if visited.contains(&(na.clone(), nb.clone())) {
                return true;
            }
            visited.insert((na.clone(), nb.clone()));
            match (defs_a.get(na), defs_b.get(nb)) {
                (Some(da), Some(db)) => eq_inner(da, db, defs_a, defs_b, visited),
                // Unresolvable back-edges fall back to name equality.
                _ => na == nb,
            }
        }
        _ => false,
    }
}

/// Outcome of statically following a dot path through a spec.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PathResolution<'a> {
    /// The path lands on this spec.
    Resolved(&'a TypeSpec),
    /// The tree cannot answer (mixed unions, recursive back-edges).
    Unknown,
    /// No value can ever exist at the path (descending through scalars,
    /// lists, or fields a typed dict does not declare).
    Never,
}

// ---------------------------------------------------------------------------
// Legacy string grammar
// ---------------------------------------------------------------------------

/// Synthesises a spec from the bounded legacy string grammar:
/// `str | int | float | bool | datetime | list[T] | dict[str, T] |
/// optional[T]`. Returns `None` when the string falls outside the grammar,
/// which callers treat as schema drift.
pub fn synthesize_legacy(input: &str) -> Option<TypeSpec> {
    let mut parser = LegacyParser {
        input: input.trim(),
        pos: 0,
    };
    let spec = parser.parse_type()?;
    parser.skip_ws();
    if parser.pos == parser.input.len() {
        Some(spec)
    } else {
        None
    }
}

struct LegacyParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> LegacyParser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn skip_ws(&mut self) {
        while self.rest().starts_with(' ') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_type(&mut self) -> Option<TypeSpec> {
        self.skip_ws();
        let ident_len = self
            .rest()
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or_else(|| self.rest().len());
        let ident = &self.rest()[..ident_len];
        self.pos += ident_len;

        match ident {
            "str" => Some(TypeSpec::str()),
            "int" => Some(TypeSpec::int()),
            "float" => Some(TypeSpec::float()),
            "bool" => Some(TypeSpec::bool()),
            "datetime" => Some(TypeSpec::datetime()),
            "null" | "none" => Some(TypeSpec::null()),
            "list" => {
                if !self.eat("[") {
                    return None;
                }
                let item = self.parse_type()?;
                if !self.eat("]") {
                    return None;
                }
                Some(TypeSpec::list(item))
            }
            "dict" => {
                if !self.eat("[") {
                    return None;
                }
                // Keys are always str in the legacy grammar.
                if !self.eat("str") {
                    return None;
                }
                if !self.eat(",") {
                    return None;
                }
                let value = self.parse_type()?;
                if !self.eat("]") {
                    return None;
                }
                Some(TypeSpec::dict(value))
            }
            "optional" => {
                if !self.eat("[") {
                    return None;
                }
                let inner = self.parse_type()?;
                if !self.eat("]") {
                    return None;
                }
                Some(TypeSpec::optional(inner))
            }
            _ => None,
        }
    }
}
