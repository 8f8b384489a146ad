//! Parser for the store's annotated CSV response format.
//!
//! A response is a sequence of blocks. Each block opens with `#datatype`,
//! `#group` and `#default` annotation rows, then a header row, then data rows.
//! The first column of every row is reserved for annotations and is empty on
//! header and data rows. Blocks are separated by blank lines.

use super::{FluxRecord, FluxTable};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Number, Value};

const SYSTEM_COLUMNS: [&str; 8] = [
    "", "result", "table", "_start", "_stop", "_time", "_value", "_field",
];

#[derive(Default)]
struct Block {
    datatypes: Vec<String>,
    defaults: Vec<String>,
    header: Option<Vec<String>>,
}

impl Block {
    fn column(&self, name: &str) -> Option<usize> {
        self.header.as_ref()?.iter().position(|c| c == name)
    }

    fn cell<'r>(&'r self, row: &'r StringRecord, index: usize) -> &'r str {
        match row.get(index) {
            Some(cell) if !cell.is_empty() => cell,
            _ => self.defaults.get(index).map(String::as_str).unwrap_or(""),
        }
    }
}

/// Parses a full response body into tables, ordered by first appearance.
pub fn parse_tables(body: &str) -> Result<Vec<FluxTable>, StoreError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut tables: Vec<FluxTable> = Vec::new();
    let mut block = Block::default();
    let mut in_annotations = false;

    for row in reader.records() {
        let row = row?;
        if row.iter().all(str::is_empty) {
            block = Block::default();
            in_annotations = false;
            continue;
        }

        let first = row.get(0).unwrap_or("");
        if first.starts_with('#') {
            if !in_annotations {
                block = Block::default();
                in_annotations = true;
            }
            let cells = row.iter().map(str::to_string).collect();
            match first {
                "#datatype" => block.datatypes = cells,
                "#default" => block.defaults = cells,
                _ => {}
            }
            continue;
        }
        in_annotations = false;

        if block.header.is_none() {
            block.header = Some(row.iter().map(str::to_string).collect());
            continue;
        }

        if let Some(error_col) = block.column("error") {
            let message = block.cell(&row, error_col);
            return Err(StoreError::Malformed(format!("query failed: {}", message)));
        }

        let record = parse_record(&block, &row)?;
        match tables.iter_mut().find(|t| t.index == record.table) {
            Some(table) => table.records.push(record),
            None => tables.push(FluxTable::new(record.table, vec![record])),
        }
    }

    Ok(tables)
}

fn parse_record(block: &Block, row: &StringRecord) -> Result<FluxRecord, StoreError> {
    let header = block.header.as_deref().unwrap_or_default();

    let table = match block.column("table") {
        Some(i) => {
            let raw = block.cell(row, i);
            raw.parse::<i64>()
                .map_err(|_| StoreError::Malformed(format!("bad table id '{}'", raw)))?
        }
        None => 0,
    };

    let time = match block.column("_time") {
        Some(i) => {
            let raw = block.cell(row, i);
            let parsed = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| StoreError::Malformed(format!("bad _time '{}'", raw)))?;
            Some(parsed.with_timezone(&Utc))
        }
        None => None,
    };

    let value = match block.column("_value") {
        Some(i) => typed_value(block.cell(row, i), block.datatypes.get(i).map(String::as_str)),
        None => Value::Null,
    };

    let text = |name: &str| {
        block
            .column(name)
            .map(|i| block.cell(row, i).to_string())
            .filter(|s| !s.is_empty())
    };

    let tags = header
        .iter()
        .enumerate()
        .filter(|(_, name)| !SYSTEM_COLUMNS.contains(&name.as_str()) && name.as_str() != "_measurement")
        .map(|(i, name)| (name.clone(), block.cell(row, i).to_string()))
        .collect();

    Ok(FluxRecord {
        table,
        time,
        measurement: text("_measurement"),
        field: text("_field"),
        value,
        tags,
    })
}

/// Converts a cell using its `#datatype` annotation, guessing when absent.
fn typed_value(raw: &str, datatype: Option<&str>) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    let number = |n: Option<Number>| n.map(Value::Number).unwrap_or_else(|| Value::String(raw.to_string()));
    match datatype {
        Some("double") => number(raw.parse::<f64>().ok().and_then(Number::from_f64)),
        Some("long") => number(raw.parse::<i64>().ok().map(Number::from)),
        Some("unsignedLong") => number(raw.parse::<u64>().ok().map(Number::from)),
        Some("boolean") => match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(raw.to_string()),
        },
        Some(_) => Value::String(raw.to_string()),
        None => {
            if let Ok(i) = raw.parse::<i64>() {
                Value::Number(Number::from(i))
            } else {
                number(raw.parse::<f64>().ok().and_then(Number::from_f64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    const TWO_TABLES: &str = "\
#group,false,false,true,true,false,false,true,true,true
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,double,string,string,string
#default,_result,,,,,,,,
,result,table,_start,_stop,_time,_value,_field,_measurement,line
,,0,2024-03-04T00:00:00Z,2024-03-04T00:05:00Z,2024-03-04T00:00:10Z,72.5,temp,pump-1,A
,,0,2024-03-04T00:00:00Z,2024-03-04T00:05:00Z,2024-03-04T00:00:20Z,73,temp,pump-1,A
,,1,2024-03-04T00:00:00Z,2024-03-04T00:05:00Z,2024-03-04T00:00:10Z,1.2,vibration,pump-1,A

#group,false,false,true,true,false,false,true,true,true
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,boolean,string,string,string
#default,_result,,,,,,,,
,result,table,_start,_stop,_time,_value,_field,_measurement,line
,,2,2024-03-04T00:00:00Z,2024-03-04T00:05:00Z,2024-03-04T00:00:10Z,true,running,pump-1,A
";

    #[test]
    fn test_parses_blocks_into_tables() {
        let tables = parse_tables(TWO_TABLES).unwrap();
        assert_eq!(tables.len(), 3);
        assert_eq!(tables[0].records.len(), 2);

        let first = &tables[0].records[0];
        assert_eq!(first.time, Some(Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 10).unwrap()));
        assert_eq!(first.field.as_deref(), Some("temp"));
        assert_eq!(first.measurement.as_deref(), Some("pump-1"));
        assert_eq!(first.value, json!(72.5));
        assert_eq!(first.tags.get("line").map(String::as_str), Some("A"));
        assert!(!first.tags.contains_key("_start"));

        assert_eq!(tables[1].records[0].field.as_deref(), Some("vibration"));
        assert_eq!(tables[2].records[0].value, json!(true));
    }

    #[test]
    fn test_empty_body_has_no_tables() {
        assert!(parse_tables("").unwrap().is_empty());
        assert!(parse_tables("\r\n").unwrap().is_empty());
    }

    #[test]
    fn test_error_table_is_reported() {
        let body = "\
#datatype,string,string
#group,true,true
#default,,
,error,reference
,failed to parse query,897
";
        let err = parse_tables(body).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(ref m) if m.contains("failed to parse query")));
    }

    #[test]
    fn test_untyped_values_are_guessed() {
        assert_eq!(typed_value("12", None), json!(12));
        assert_eq!(typed_value("1.5", None), json!(1.5));
        assert_eq!(typed_value("on", None), json!("on"));
        assert_eq!(typed_value("", Some("double")), Value::Null);
        assert_eq!(typed_value("abc", Some("double")), json!("abc"));
    }
}
