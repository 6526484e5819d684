// Copyright 2024, The Tremor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use simd_json::{OwnedValue, StaticNode};
use std::fmt;

/// Fully qualified BigQuery table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId {
    project: String,
    dataset: String,
    table: String,
}

impl TableId {
    /// creates a new table id
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parses `table`, `dataset.table` or `project.dataset.table`, filling in the
    /// missing parts from the defaults.
    ///
    /// # Errors
    /// if the reference has empty parts or more than three of them
    pub fn parse(reference: &str, project: &str, dataset: &str) -> Result<Self, String> {
        let parts: Vec<&str> = reference.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(format!("Invalid table reference '{reference}'"));
        }
        match parts.as_slice() {
            [table] => Ok(Self::new(project, dataset, *table)),
            [dataset, table] => Ok(Self::new(project, *dataset, *table)),
            [project, dataset, table] => Ok(Self::new(*project, *dataset, *table)),
            _ => Err(format!("Invalid table reference '{reference}'")),
        }
    }

    /// Table name derived from a topic name: everything that is not a letter, digit or
    /// underscore becomes `_` and a leading digit is prefixed with `_`.
    #[must_use]
    pub fn sanitize(topic: &str) -> String {
        let mut name: String = topic
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
            name.insert(0, '_');
        }
        name
    }

    /// project id
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// dataset id
    #[must_use]
    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// table id
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// resource path as used by the storage write API
    #[must_use]
    pub fn path(&self) -> String {
        format!(
            "projects/{}/datasets/{}/tables/{}",
            self.project, self.dataset, self.table
        )
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// A partition of a topic in the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// topic
    pub topic: String,
    /// partition
    pub partition: i32,
}

impl TopicPartition {
    /// creates a new topic partition
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Position of a record in the log
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceOffset {
    /// topic and partition
    pub partition: TopicPartition,
    /// offset within the partition
    pub offset: i64,
}

impl SourceOffset {
    /// creates a new source offset
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            partition: TopicPartition::new(topic, partition),
            offset,
        }
    }
}

impl fmt::Display for SourceOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.offset)
    }
}

/// A typed column value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// null
    Null,
    /// boolean
    Bool(bool),
    /// 64 bit integer
    Int64(i64),
    /// double
    Float64(f64),
    /// string, also used for dates, times, timestamps and numerics
    String(String),
    /// binary
    Bytes(Vec<u8>),
    /// a record
    Struct(Vec<Field>),
    /// a repeated value
    Array(Vec<FieldValue>),
}

impl FieldValue {
    // rough in-memory footprint, used for the batch size threshold
    fn byte_size(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Int64(_) | Self::Float64(_) => 8,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Struct(fields) => fields.iter().map(Field::byte_size).sum(),
            Self::Array(values) => values.iter().map(Self::byte_size).sum(),
        }
    }

    /// Json representation as expected by the BigQuery REST API, bytes are base64 encoded
    #[must_use]
    pub fn to_json(&self) -> OwnedValue {
        match self {
            Self::Null => OwnedValue::Static(StaticNode::Null),
            Self::Bool(b) => OwnedValue::from(*b),
            Self::Int64(i) => OwnedValue::from(*i),
            Self::Float64(f) => OwnedValue::from(*f),
            Self::String(s) => OwnedValue::from(s.as_str()),
            Self::Bytes(b) => OwnedValue::from(BASE64.encode(b)),
            Self::Struct(fields) => fields_to_json(fields),
            Self::Array(values) => values.iter().map(Self::to_json).collect(),
        }
    }
}

impl From<&OwnedValue> for FieldValue {
    fn from(value: &OwnedValue) -> Self {
        match value {
            OwnedValue::Static(StaticNode::Null) => Self::Null,
            OwnedValue::Static(StaticNode::Bool(b)) => Self::Bool(*b),
            OwnedValue::Static(StaticNode::I64(i)) => Self::Int64(*i),
            OwnedValue::Static(StaticNode::U64(u)) => {
                i64::try_from(*u).map_or_else(|_| Self::String(u.to_string()), Self::Int64)
            }
            OwnedValue::Static(StaticNode::F64(f)) => Self::Float64(*f),
            OwnedValue::String(s) => Self::String(s.to_string()),
            OwnedValue::Array(values) => Self::Array(values.iter().map(Self::from).collect()),
            OwnedValue::Object(object) => Self::Struct(
                object
                    .iter()
                    .map(|(k, v)| Field::new(k.to_string(), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

/// A named column value
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    /// column name
    pub name: String,
    /// value
    pub value: FieldValue,
}

impl Field {
    /// creates a new field
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    fn byte_size(&self) -> usize {
        self.name.len() + self.value.byte_size()
    }
}

pub(crate) fn fields_to_json(fields: &[Field]) -> OwnedValue {
    fields
        .iter()
        .map(|f| (f.name.clone(), f.value.to_json()))
        .collect()
}

/// One structured event read from the log, bound for a destination table
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    table: TableId,
    fields: Vec<Field>,
    offset: SourceOffset,
    ingestion_time: u64,
    byte_size: usize,
}

impl Record {
    /// creates a new record, `ingestion_time` is in nanoseconds since the epoch
    #[must_use]
    pub fn new(table: TableId, fields: Vec<Field>, offset: SourceOffset, ingestion_time: u64) -> Self {
        let byte_size = fields.iter().map(Field::byte_size).sum();
        Self {
            table,
            fields,
            offset,
            ingestion_time,
            byte_size,
        }
    }

    /// Builds a record from a json object, each top level key becomes a column
    ///
    /// # Errors
    /// if the value is not an object
    pub fn from_json(
        table: TableId,
        value: &OwnedValue,
        offset: SourceOffset,
        ingestion_time: u64,
    ) -> Result<Self, String> {
        match FieldValue::from(value) {
            FieldValue::Struct(fields) => Ok(Self::new(table, fields, offset, ingestion_time)),
            _ => Err("record value is not an object".to_string()),
        }
    }

    /// destination table
    #[must_use]
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// columns in order
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// position in the log
    #[must_use]
    pub fn offset(&self) -> &SourceOffset {
        &self.offset
    }

    /// ingestion timestamp in nanoseconds
    #[must_use]
    pub fn ingestion_time(&self) -> u64 {
        self.ingestion_time
    }

    /// approximate size of the record in bytes
    #[must_use]
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// the row as a json object
    #[must_use]
    pub fn to_json(&self) -> OwnedValue {
        fields_to_json(&self.fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simd_json::prelude::*;
    use test_case::test_case;

    #[test_case("orders", "orders" ; "plain")]
    #[test_case("orders.v1", "orders_v1" ; "dots")]
    #[test_case("my-topic", "my_topic" ; "dashes")]
    #[test_case("1topic", "_1topic" ; "leading digit")]
    #[test_case("", "_" ; "empty")]
    fn topics_are_sanitized(topic: &str, expected: &str) {
        assert_eq!(expected, TableId::sanitize(topic));
    }

    #[test]
    fn table_references_are_parsed() -> Result<(), String> {
        assert_eq!(TableId::new("p", "d", "t"), TableId::parse("t", "p", "d")?);
        assert_eq!(TableId::new("p", "x", "t"), TableId::parse("x.t", "p", "d")?);
        assert_eq!(TableId::new("q", "x", "t"), TableId::parse("q.x.t", "p", "d")?);
        assert!(TableId::parse("a.b.c.d", "p", "d").is_err());
        assert!(TableId::parse("a..c", "p", "d").is_err());
        assert_eq!(
            "projects/p/datasets/d/tables/t",
            TableId::new("p", "d", "t").path()
        );
        Ok(())
    }

    #[test]
    fn records_are_built_from_json() -> Result<(), String> {
        let mut input = br#"{"a": 1, "b": "snot", "c": {"d": [true, null]}}"#.to_vec();
        let value = simd_json::to_owned_value(&mut input).map_err(|e| e.to_string())?;
        let record = Record::from_json(
            TableId::new("p", "d", "t"),
            &value,
            SourceOffset::new("topic", 0, 42),
            0,
        )?;
        assert_eq!(3, record.fields().len());
        let json = record.to_json();
        assert_eq!(Some(1), json.get_i64("a"));
        assert_eq!(Some("snot"), json.get_str("b"));
        assert!(record.byte_size() > 0);
        assert_eq!("topic-0@42", record.offset().to_string());

        let not_an_object = OwnedValue::from(12);
        assert!(Record::from_json(
            TableId::new("p", "d", "t"),
            &not_an_object,
            SourceOffset::new("topic", 0, 43),
            0
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn bytes_are_base64_encoded_in_json() {
        let value = FieldValue::Bytes(vec![1, 2, 3]).to_json();
        assert_eq!(Some("AQID"), value.as_str());
    }

    #[test]
    fn byte_size_accounts_for_names_and_values() {
        let record = Record::new(
            TableId::new("p", "d", "t"),
            vec![
                Field::new("ab", FieldValue::Int64(1)),
                Field::new("c", FieldValue::String("xyz".to_string())),
            ],
            SourceOffset::new("t", 0, 0),
            0,
        );
        assert_eq!(2 + 8 + 1 + 3, record.byte_size());
    }
}
