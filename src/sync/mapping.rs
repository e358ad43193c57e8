//! Declarative table mappings and their projection onto flat records.
//!
//! A mapping names a target table, its primary-key column and, for each
//! column, a path template into the flattened record. Templates containing
//! the `{i}` placeholder describe repeating sub-structures: one row is
//! produced per index, starting at 0, until the primary-key path runs out.

use crate::error::{ConfigError, MappingError};
use crate::sync::flatten::{FlatRecord, PATH_SEPARATOR, Resolved};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

const INDEX_PLACEHOLDER: &str = "{i}";

const BUILTIN_BOOKING_MAPPING: &str = include_str!("../../config/booking_mapping.json");

static NULL: Value = Value::Null;

static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();

fn identifier_regex() -> &'static Regex {
    IDENTIFIER_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid identifier regex")
    })
}

fn check_identifier(name: &str) -> Result<(), ConfigError> {
    if identifier_regex().is_match(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index,
}

/// A parsed source path such as `refs.{i}.config.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPath {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        if template.is_empty() {
            return Err(invalid("empty path"));
        }

        let segments = template
            .split(PATH_SEPARATOR)
            .map(|segment| match segment {
                "" => Err(invalid("empty segment")),
                INDEX_PLACEHOLDER => Ok(Segment::Index),
                key if key.contains('{') || key.contains('}') => {
                    Err(invalid("only the {i} placeholder is supported"))
                }
                key => Ok(Segment::Key(key.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { segments })
    }

    pub fn is_indexed(&self) -> bool {
        self.segments.iter().any(|segment| *segment == Segment::Index)
    }

    /// Concrete path with every placeholder replaced by `index`.
    pub fn render(&self, index: usize) -> String {
        let index = index.to_string();
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Key(key) => key.as_str(),
                Segment::Index => index.as_str(),
            })
            .collect();
        join_segments(&parts)
    }
}

fn join_segments(parts: &[&str]) -> String {
    let separator = PATH_SEPARATOR.to_string();
    parts.join(separator.as_str())
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Key(key) => key.as_str(),
                Segment::Index => INDEX_PLACEHOLDER,
            })
            .collect();
        f.write_str(&join_segments(&parts))
    }
}

/// Table mapping as written in a mapping document.
#[derive(Debug, Deserialize)]
struct MappingSpec {
    name: String,
    table: String,
    #[serde(default)]
    primary_key: Option<String>,
    columns: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct MappingDocument {
    write_plan: Vec<String>,
    mappings: Vec<MappingSpec>,
}

/// A validated table mapping.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub name: String,
    pub table: String,
    pub primary_key: Option<String>,
    pub columns: Vec<(String, PathTemplate)>,
}

impl ColumnMapping {
    pub fn is_indexed(&self) -> bool {
        self.columns.iter().any(|(_, path)| path.is_indexed())
    }

    fn from_spec(spec: MappingSpec) -> Result<Self, ConfigError> {
        check_identifier(&spec.table)?;

        let mut columns = Vec::with_capacity(spec.columns.len());
        for (column, template) in spec.columns {
            check_identifier(&column)?;
            columns.push((column, PathTemplate::parse(&template)?));
        }

        let mapping = Self {
            name: spec.name,
            table: spec.table,
            primary_key: spec.primary_key,
            columns,
        };

        if let Some(pk) = &mapping.primary_key {
            let pk_path = mapping
                .columns
                .iter()
                .find(|(column, _)| column == pk)
                .map(|(_, path)| path)
                .ok_or_else(|| ConfigError::UnknownPrimaryKey {
                    mapping: mapping.name.clone(),
                    column: pk.clone(),
                })?;

            if mapping.is_indexed() && !pk_path.is_indexed() {
                return Err(ConfigError::UnindexedPrimaryKey {
                    mapping: mapping.name.clone(),
                });
            }
        }

        Ok(mapping)
    }

    fn primary_key_path(&self) -> Option<(&str, &PathTemplate)> {
        let pk = self.primary_key.as_deref()?;
        self.columns
            .iter()
            .find(|(column, _)| column == pk)
            .map(|(column, path)| (column.as_str(), path))
    }
}

/// Table order satisfying foreign-key dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePlan {
    tables: Vec<String>,
}

impl WritePlan {
    pub fn new<I, S>(tables: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut ordered = Vec::new();
        for table in tables {
            let table = table.into();
            check_identifier(&table)?;
            if !seen.insert(table.clone()) {
                return Err(ConfigError::DuplicatePlanEntry(table));
            }
            ordered.push(table);
        }
        Ok(Self { tables: ordered })
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|planned| planned == table)
    }
}

/// The complete mapping configuration for one run.
#[derive(Debug, Clone)]
pub struct MappingSet {
    pub write_plan: WritePlan,
    pub mappings: Vec<ColumnMapping>,
}

impl MappingSet {
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let document: MappingDocument = serde_json::from_str(document)?;
        let write_plan = WritePlan::new(document.write_plan)?;

        let mut mappings = Vec::with_capacity(document.mappings.len());
        for spec in document.mappings {
            let mapping = ColumnMapping::from_spec(spec)?;
            if !write_plan.contains(&mapping.table) {
                return Err(ConfigError::TableNotPlanned {
                    mapping: mapping.name,
                    table: mapping.table,
                });
            }
            mappings.push(mapping);
        }

        Ok(Self {
            write_plan,
            mappings,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let document = std::fs::read_to_string(path)?;
        Self::from_json(&document)
    }

    /// The booking mapping shipped with the binary.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_json(BUILTIN_BOOKING_MAPPING)
    }

    /// Load `path` when given, the built-in mapping otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                log::info!("loading table mappings from {}", path.display());
                Self::from_path(path)
            }
            None => Self::builtin(),
        }
    }
}

/// One row to upsert, derived from one record through one mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RowCandidate {
    pub table: String,
    pub mapping: String,
    pub primary_key: String,
    /// Column values in mapping order; always includes the primary key.
    pub values: Vec<(String, Value)>,
}

impl RowCandidate {
    pub fn primary_key_value(&self) -> &Value {
        self.values
            .iter()
            .find(|(column, _)| *column == self.primary_key)
            .map(|(_, value)| value)
            .unwrap_or(&NULL)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// Rows and diagnostics produced by projecting one record.
#[derive(Debug, Default)]
pub struct Projection {
    pub rows: Vec<RowCandidate>,
    pub diagnostics: Vec<MappingError>,
}

impl Projection {
    fn merge(&mut self, other: Projection) {
        self.rows.extend(other.rows);
        self.diagnostics.extend(other.diagnostics);
    }
}

pub struct EntityMapper {
    max_indexed_rows: usize,
}

impl EntityMapper {
    pub fn new(max_indexed_rows: usize) -> Self {
        Self { max_indexed_rows }
    }

    /// Project `flat` through every mapping of `set`, in declaration order.
    pub fn project_all(&self, flat: &FlatRecord, set: &MappingSet) -> Projection {
        let mut projection = Projection::default();
        for mapping in &set.mappings {
            projection.merge(self.project(flat, mapping));
        }
        projection
    }

    pub fn project(&self, flat: &FlatRecord, mapping: &ColumnMapping) -> Projection {
        let mut projection = Projection::default();

        let Some((pk_column, pk_path)) = mapping.primary_key_path() else {
            projection.diagnostics.push(MappingError::MissingPrimaryKey {
                mapping: mapping.name.clone(),
            });
            return projection;
        };

        if !mapping.is_indexed() {
            if is_present(flat, &pk_path.render(0)) {
                let row = self.build_row(flat, mapping, pk_column, 0, &mut projection.diagnostics);
                projection.rows.push(row);
            }
            return projection;
        }

        for index in 0..self.max_indexed_rows {
            if !is_present(flat, &pk_path.render(index)) {
                break;
            }
            let row = self.build_row(flat, mapping, pk_column, index, &mut projection.diagnostics);
            projection.rows.push(row);
        }

        projection
    }

    fn build_row(
        &self,
        flat: &FlatRecord,
        mapping: &ColumnMapping,
        pk_column: &str,
        index: usize,
        diagnostics: &mut Vec<MappingError>,
    ) -> RowCandidate {
        let values = mapping
            .columns
            .iter()
            .map(|(column, template)| {
                let path = template.render(index);
                let value = match flat.resolve(&path) {
                    Resolved::Missing => Value::Null,
                    Resolved::Scalar(value) => value.clone(),
                    Resolved::Subtree(tree) => coerce_container(mapping, column, path, &tree, diagnostics),
                };
                (column.clone(), value)
            })
            .collect();

        RowCandidate {
            table: mapping.table.clone(),
            mapping: mapping.name.clone(),
            primary_key: pk_column.to_string(),
            values,
        }
    }
}

fn is_present(flat: &FlatRecord, path: &str) -> bool {
    match flat.resolve(path) {
        Resolved::Missing | Resolved::Scalar(Value::Null) => false,
        Resolved::Scalar(_) | Resolved::Subtree(_) => true,
    }
}

/// Containers are stored as their JSON text.
fn coerce_container(
    mapping: &ColumnMapping,
    column: &str,
    path: String,
    tree: &Value,
    diagnostics: &mut Vec<MappingError>,
) -> Value {
    match serde_json::to_string(tree) {
        Ok(text) => {
            diagnostics.push(MappingError::ContainerCoerced {
                mapping: mapping.name.clone(),
                column: column.to_string(),
                path,
            });
            Value::String(text)
        }
        Err(source) => {
            diagnostics.push(MappingError::Encode {
                mapping: mapping.name.clone(),
                column: column.to_string(),
                source,
            });
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::flatten::flatten;
    use serde_json::json;

    fn mapping_set(document: Value) -> MappingSet {
        MappingSet::from_json(&document.to_string()).unwrap()
    }

    fn items_mapping() -> MappingSet {
        mapping_set(json!({
            "write_plan": ["item"],
            "mappings": [{
                "name": "items",
                "table": "item",
                "primary_key": "item_id",
                "columns": {"item_id": "items.{i}.id", "owner_id": "id"}
            }]
        }))
    }

    #[test]
    fn parses_and_renders_templates() {
        let template = PathTemplate::parse("refs.{i}.config.id").unwrap();
        assert!(template.is_indexed());
        assert_eq!(template.render(3), "refs.3.config.id");
        assert_eq!(template.to_string(), "refs.{i}.config.id");
        assert!(!PathTemplate::parse("customer.id").unwrap().is_indexed());
    }

    #[test]
    fn rejects_malformed_templates() {
        assert!(matches!(PathTemplate::parse("a..b"), Err(ConfigError::InvalidPath { .. })));
        assert!(matches!(PathTemplate::parse("a.{j}.b"), Err(ConfigError::InvalidPath { .. })));
        assert!(matches!(PathTemplate::parse(""), Err(ConfigError::InvalidPath { .. })));
    }

    #[test]
    fn builtin_mapping_loads() {
        let set = MappingSet::builtin().unwrap();
        assert_eq!(set.write_plan.tables().first().map(String::as_str), Some("company"));
        assert!(set.mappings.iter().all(|m| set.write_plan.contains(&m.table)));
        assert_eq!(set.mappings.iter().filter(|m| m.table == "address").count(), 4);
    }

    #[test]
    fn load_time_validation() {
        let unplanned = MappingSet::from_json(
            &json!({"write_plan": ["a"], "mappings": [{"name": "b", "table": "b", "columns": {"id": "id"}}]})
                .to_string(),
        );
        assert!(matches!(unplanned, Err(ConfigError::TableNotPlanned { .. })));

        let bad_pk = MappingSet::from_json(
            &json!({"write_plan": ["a"], "mappings": [{"name": "a", "table": "a", "primary_key": "nope", "columns": {"id": "id"}}]})
                .to_string(),
        );
        assert!(matches!(bad_pk, Err(ConfigError::UnknownPrimaryKey { .. })));

        let unindexed = MappingSet::from_json(
            &json!({"write_plan": ["a"], "mappings": [{"name": "a", "table": "a", "primary_key": "id", "columns": {"id": "id", "x": "xs.{i}.v"}}]})
                .to_string(),
        );
        assert!(matches!(unindexed, Err(ConfigError::UnindexedPrimaryKey { .. })));

        let injection = MappingSet::from_json(
            &json!({"write_plan": ["a; drop table a"], "mappings": []}).to_string(),
        );
        assert!(matches!(injection, Err(ConfigError::InvalidIdentifier(_))));

        let duplicate = MappingSet::from_json(&json!({"write_plan": ["a", "a"], "mappings": []}).to_string());
        assert!(matches!(duplicate, Err(ConfigError::DuplicatePlanEntry(_))));
    }

    #[test]
    fn plain_mapping_yields_one_row_with_nulls_for_missing_paths() {
        let set = mapping_set(json!({
            "write_plan": ["customer"],
            "mappings": [{
                "name": "customer",
                "table": "customer",
                "primary_key": "customer_id",
                "columns": {"customer_id": "customer.id", "name": "customer.name", "website": "website"}
            }]
        }));
        let flat = flatten(&json!({"customer": {"id": 1, "name": "Acme"}}), "");

        let projection = EntityMapper::new(50).project_all(&flat, &set);
        assert_eq!(projection.rows.len(), 1);
        let row = &projection.rows[0];
        assert_eq!(row.primary_key_value(), &json!(1));
        assert_eq!(row.get("name"), Some(&json!("Acme")));
        assert_eq!(row.get("website"), Some(&Value::Null));
        assert!(projection.diagnostics.is_empty());
    }

    #[test]
    fn null_primary_key_produces_no_row() {
        let set = mapping_set(json!({
            "write_plan": ["customer"],
            "mappings": [{"name": "c", "table": "customer", "primary_key": "customer_id", "columns": {"customer_id": "customer.id"}}]
        }));
        let flat = flatten(&json!({"customer": {"id": null}}), "");
        assert!(EntityMapper::new(50).project_all(&flat, &set).rows.is_empty());
    }

    #[test]
    fn mapping_without_primary_key_is_skipped_with_diagnostic() {
        let set = mapping_set(json!({
            "write_plan": ["note"],
            "mappings": [{"name": "notes", "table": "note", "columns": {"body": "notes"}}]
        }));
        let flat = flatten(&json!({"notes": "hello"}), "");

        let projection = EntityMapper::new(50).project_all(&flat, &set);
        assert!(projection.rows.is_empty());
        assert!(matches!(
            projection.diagnostics.as_slice(),
            [MappingError::MissingPrimaryKey { .. }]
        ));
    }

    #[test]
    fn indexed_mapping_stops_at_first_gap() {
        let flat: FlatRecord = [
            ("id".to_string(), json!(10)),
            ("items.0.id".to_string(), json!(5)),
            ("items.2.id".to_string(), json!(7)),
        ]
        .into_iter()
        .collect();

        let projection = EntityMapper::new(50).project_all(&flat, &items_mapping());
        assert_eq!(projection.rows.len(), 1);
        assert_eq!(projection.rows[0].primary_key_value(), &json!(5));
        assert_eq!(projection.rows[0].get("owner_id"), Some(&json!(10)));
    }

    #[test]
    fn indexed_mapping_respects_the_row_cap() {
        let flat = flatten(&json!({"id": 1, "items": [{"id": 1}, {"id": 2}, {"id": 3}]}), "");
        assert_eq!(EntityMapper::new(2).project_all(&flat, &items_mapping()).rows.len(), 2);
        assert_eq!(EntityMapper::new(50).project_all(&flat, &items_mapping()).rows.len(), 3);
    }

    #[test]
    fn container_values_are_serialized_and_reported() {
        let set = mapping_set(json!({
            "write_plan": ["booking"],
            "mappings": [{
                "name": "booking",
                "table": "booking",
                "primary_key": "booking_id",
                "columns": {"booking_id": "id", "tags": "tags"}
            }]
        }));
        let flat = flatten(&json!({"id": 3, "tags": ["a", "b"]}), "");

        let projection = EntityMapper::new(50).project_all(&flat, &set);
        assert_eq!(projection.rows[0].get("tags"), Some(&json!("[\"a\",\"b\"]")));
        assert!(matches!(
            projection.diagnostics.as_slice(),
            [MappingError::ContainerCoerced { column, .. }] if column == "tags"
        ));
    }
}
