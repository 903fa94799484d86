//! Accumulator store and CSV exporter
//!
//! Each table collects rows in arrival order. A row is `category`, `time`,
//! then the payload fields in declaration order. Tables are written once, at
//! consumer shutdown.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::router::{route, Table};

/// One accumulated row, columns in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    fn push(&mut self, column: impl Into<String>, value: String) {
        self.cells.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.iter().map(|(c, _)| c.as_str())
    }
}

#[derive(Debug, Default)]
struct TableData {
    /// Union of row columns, first-seen order
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl TableData {
    fn push(&mut self, row: Row) {
        for column in row.columns() {
            if !self.columns.iter().any(|c| c == column) {
                self.columns.push(column.to_string());
            }
        }
        self.rows.push(row);
    }
}

#[derive(Debug, Default)]
pub struct AccumulatorStore {
    tables: BTreeMap<Table, TableData>,
}

impl AccumulatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` to its table, returning the table used
    pub fn append(&mut self, event: &Event) -> Result<Table> {
        let table = route(event.category()).table;
        let row = to_row(event)?;
        self.tables.entry(table).or_default().push(row);
        Ok(table)
    }

    pub fn rows(&self, table: Table) -> &[Row] {
        self.tables
            .get(&table)
            .map(|t| t.rows.as_slice())
            .unwrap_or_default()
    }

    pub fn len(&self, table: Table) -> usize {
        self.rows(table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.rows.is_empty())
    }

    /// Row count for every non-empty table
    pub fn counts(&self) -> BTreeMap<Table, usize> {
        self.tables
            .iter()
            .filter(|(_, t)| !t.rows.is_empty())
            .map(|(table, t)| (*table, t.rows.len()))
            .collect()
    }

    /// Write one `<table>.csv` per non-empty table into `dir`
    pub fn export(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;

        let mut written = Vec::new();
        for (table, data) in &self.tables {
            if data.rows.is_empty() {
                continue;
            }
            let path = dir.join(table.file_name());
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record(&data.columns)?;
            for row in &data.rows {
                writer.write_record(data.columns.iter().map(|c| row.get(c).unwrap_or("")))?;
            }
            writer.flush()?;
            written.push(path);
        }
        Ok(written)
    }
}

fn to_row(event: &Event) -> Result<Row> {
    let mut row = Row::default();
    row.push("category", event.category().to_string());
    row.push("time", event.time.to_string());

    match event.kind.fields()? {
        Value::Object(fields) => {
            for (column, value) in fields {
                row.push(column, cell(&value));
            }
        }
        other => {
            return Err(TelemetryError::decode(format!(
                "'{}' payload is not an object: {}",
                event.category(),
                other
            )))
        }
    }
    Ok(row)
}

/// Scalars as text, absent as empty, nested values as compact JSON
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        ClientMembership, EventKind, GraphUpdate, SchedulerLifecycle, SchedulerTransition,
    };
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn transition(key: &str, worker: Option<&str>) -> Event {
        Event::at(
            10.5,
            EventKind::SchedulerTransition(SchedulerTransition {
                key: key.into(),
                start: "processing".into(),
                finish: "memory".into(),
                stimulus_id: "s1".into(),
                prefix: Some("inc".into()),
                group: None,
                called_from: "tcp://10.0.0.1:8786".into(),
                worker: worker.map(String::from),
                thread: None,
                begins: None,
                ends: None,
                duration: None,
                size: Some(28),
            }),
        )
    }

    #[test]
    fn row_columns_follow_declaration_order() {
        let mut store = AccumulatorStore::new();
        let table = store.append(&transition("inc-1", Some("w1"))).unwrap();
        assert_eq!(table, Table::SchedulerTransition);

        let row = &store.rows(table)[0];
        let columns: Vec<&str> = row.columns().take(6).collect();
        assert_eq!(
            columns,
            vec!["category", "time", "key", "start", "finish", "stimulus_id"]
        );
        assert_eq!(row.get("category"), Some("scheduler_transition"));
        assert_eq!(row.get("time"), Some("10.5"));
        assert_eq!(row.get("group"), Some(""));
        assert_eq!(row.get("size"), Some("28"));
    }

    #[test]
    fn nested_values_are_json() {
        let mut store = AccumulatorStore::new();
        let graph = GraphUpdate {
            client: "c1".into(),
            keys: BTreeSet::from(["x".to_string()]),
            dependencies: BTreeMap::from([(
                "y".to_string(),
                BTreeSet::from(["x".to_string()]),
            )]),
            ..GraphUpdate::default()
        };
        store.append(&Event::at(1.0, EventKind::UpdateGraph(graph))).unwrap();

        let row = &store.rows(Table::Graph)[0];
        assert_eq!(row.get("keys"), Some(r#"["x"]"#));
        assert_eq!(row.get("dependencies"), Some(r#"{"y":["x"]}"#));
        assert_eq!(row.get("annotations"), Some("{}"));
    }

    #[test]
    fn duplicates_are_kept() {
        let mut store = AccumulatorStore::new();
        let event = Event::at(
            2.0,
            EventKind::AddClient(ClientMembership { client: "c1".into() }),
        );
        store.append(&event).unwrap();
        store.append(&event).unwrap();
        assert_eq!(store.len(Table::Client), 2);
    }

    #[test]
    fn export_writes_only_populated_tables() {
        let dir = TempDir::new().unwrap();
        let mut store = AccumulatorStore::new();
        store.append(&transition("a", Some("w1"))).unwrap();
        store.append(&transition("b", None)).unwrap();
        store
            .append(&Event::at(
                3.0,
                EventKind::Close(SchedulerLifecycle {
                    address: "tcp://s".into(),
                }),
            ))
            .unwrap();

        let written = store.export(dir.path()).unwrap();
        assert_eq!(
            written,
            vec![
                dir.path().join("scheduler_transition.csv"),
                dir.path().join("lifecycle.csv"),
            ]
        );

        let mut reader = csv::Reader::from_path(&written[0]).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "category");
        let worker_col = headers.iter().position(|h| h == "worker").unwrap();
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[0][worker_col], "w1");
        assert_eq!(&records[1][worker_col], "");
    }

    #[test]
    fn empty_store_exports_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("nested/out");
        let store = AccumulatorStore::new();
        assert!(store.is_empty());
        assert!(store.export(&out).unwrap().is_empty());
        assert!(out.is_dir());
    }
}
