//! Native type name to [`CanonicalType`] tables.

use std::collections::HashMap;

use regex::Regex;

use crate::error::EngineError;
use crate::types::CanonicalType;

enum TypeTable {
    /// Exact lookup after lower-casing and stripping `(…)` parameters.
    Literal(HashMap<String, CanonicalType>),
    /// Ordered patterns, the first match wins.
    Patterns(Vec<(Regex, CanonicalType)>),
}

/// Maps native type strings of one backend kind to canonical types.
///
/// Mapping is total: a type missing from the table becomes
/// [`CanonicalType::Hierarchy`] and a warning is logged so the table can be
/// extended.
pub struct TypeMapper {
    backend: &'static str,
    table: TypeTable,
}

impl TypeMapper {
    pub fn literal(backend: &'static str, entries: &[(&str, CanonicalType)]) -> Self {
        let map = entries
            .iter()
            .map(|(name, ty)| (name.to_lowercase(), *ty))
            .collect();
        Self {
            backend,
            table: TypeTable::Literal(map),
        }
    }

    pub fn patterns(
        backend: &'static str,
        entries: &[(&str, CanonicalType)],
    ) -> Result<Self, EngineError> {
        let compiled = entries
            .iter()
            .map(|(pattern, ty)| {
                Regex::new(pattern).map(|re| (re, *ty)).map_err(|e| {
                    EngineError::Configuration(format!(
                        "invalid {backend} type pattern {pattern}: {e}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            backend,
            table: TypeTable::Patterns(compiled),
        })
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Canonical type for `native`, `None` when the table has no entry.
    pub fn lookup(&self, native: &str) -> Option<CanonicalType> {
        let lowered = native.trim().to_lowercase();
        match &self.table {
            TypeTable::Literal(map) => {
                let base = lowered
                    .split('(')
                    .next()
                    .unwrap_or_default()
                    .trim_end_matches(" unsigned")
                    .trim();
                map.get(base).copied()
            }
            TypeTable::Patterns(patterns) => patterns
                .iter()
                .find(|(re, _)| re.is_match(&lowered))
                .map(|(_, ty)| *ty),
        }
    }

    pub fn to_canonical(&self, native: &str) -> CanonicalType {
        match self.lookup(native) {
            Some(ty) => ty,
            None => {
                tracing::warn!(
                    backend = self.backend,
                    native_type = native,
                    "unmapped native type, treating as hierarchy"
                );
                CanonicalType::Hierarchy
            }
        }
    }
}

impl std::fmt::Debug for TypeMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = match &self.table {
            TypeTable::Literal(map) => map.len(),
            TypeTable::Patterns(patterns) => patterns.len(),
        };
        f.debug_struct("TypeMapper")
            .field("backend", &self.backend)
            .field("entries", &entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CanonicalType::*;

    #[test]
    fn literal_tables_strip_parameters() {
        let mapper = TypeMapper::literal("test", &[("varchar", Hierarchy), ("int", Numeric)]);
        assert_eq!(mapper.lookup("VARCHAR(255)"), Some(Hierarchy));
        assert_eq!(mapper.lookup("int(11) unsigned"), Some(Numeric));
        assert_eq!(mapper.lookup("geometry"), None);
        assert_eq!(mapper.to_canonical("geometry"), Hierarchy);
    }

    #[test]
    fn first_matching_pattern_wins() {
        let mapper = TypeMapper::patterns(
            "test",
            &[("^time$", Datetime), ("^time", Hierarchy), ("^timestamp", Numeric)],
        )
        .unwrap();
        assert_eq!(mapper.lookup("time"), Some(Datetime));
        assert_eq!(mapper.lookup("timestamp"), Some(Hierarchy));
    }

    #[test]
    fn broken_patterns_are_configuration_errors() {
        let err = TypeMapper::patterns("test", &[("(", Numeric)]).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
