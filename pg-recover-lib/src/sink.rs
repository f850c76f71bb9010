//! Row emission (spec §4.E step 5, §6 "Output row files"). A thin writer
//! chooses separators/quotes; the core only ever hands it already-decoded
//! field text.

use std::io::{self, Write};

use crate::attribute::FieldValue;

/// Receives decoded rows and renders them to an underlying writer in one
/// of the two output formats (spec §6).
pub trait RowSink {
    fn write_row(&mut self, table: &str, columns: &[String], fields: &[FieldValue]) -> io::Result<()>;
}

/// Tab-separated fields, `\n` row terminator, `\N` for NULL (spec §4.A
/// "SQL vs CSV quoting").
pub struct CsvSink<W: Write> {
    out: W,
}

impl<W: Write> CsvSink<W> {
    pub fn new(out: W) -> Self {
        CsvSink { out }
    }
}

fn csv_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

impl<W: Write> RowSink for CsvSink<W> {
    fn write_row(&mut self, _table: &str, _columns: &[String], fields: &[FieldValue]) -> io::Result<()> {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                write!(self.out, "\t")?;
            }
            match field {
                FieldValue::Null => write!(self.out, "\\N")?,
                FieldValue::Text(t) => write!(self.out, "{}", csv_escape(t))?,
                FieldValue::Placeholder(p) => write!(self.out, "{}", csv_escape(p))?,
            }
        }
        writeln!(self.out)
    }
}

/// `INSERT INTO tab(...) VALUES (...);` statements, single-quoted values,
/// `NULL` for nulls (spec §4.A / §6).
pub struct SqlSink<W: Write> {
    out: W,
}

impl<W: Write> SqlSink<W> {
    pub fn new(out: W) -> Self {
        SqlSink { out }
    }
}

fn sql_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

impl<W: Write> RowSink for SqlSink<W> {
    fn write_row(&mut self, table: &str, columns: &[String], fields: &[FieldValue]) -> io::Result<()> {
        write!(self.out, "INSERT INTO {}(", table)?;
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                write!(self.out, ", ")?;
            }
            write!(self.out, "{}", col)?;
        }
        write!(self.out, ") VALUES (")?;
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                write!(self.out, ", ")?;
            }
            match field {
                FieldValue::Null => write!(self.out, "NULL")?,
                FieldValue::Text(t) => write!(self.out, "{}", sql_quote(t))?,
                FieldValue::Placeholder(p) => write!(self.out, "{}", sql_quote(p))?,
            }
        }
        writeln!(self.out, ");")
    }
}

/// Emit an `UPDATE` statement for a recovered row pair (spec §4.E
/// "Update-mode emission").
pub fn write_update<W: Write>(out: &mut W, table: &str, changed: &[(String, String)], key: &(String, String)) -> io::Result<()> {
    write!(out, "UPDATE {} SET ", table)?;
    for (i, (col, val)) in changed.iter().enumerate() {
        if i > 0 {
            write!(out, ", ")?;
        }
        write!(out, "{} = {}", col, sql_quote(val))?;
    }
    writeln!(out, " WHERE {} = {};", key.0, sql_quote(&key.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_escapes_control_chars_and_nulls() {
        let mut buf = Vec::new();
        let mut sink = CsvSink::new(&mut buf);
        let cols = vec!["a".to_string(), "b".to_string()];
        sink.write_row("t", &cols, &[FieldValue::Text("line\n\ttab".to_string()), FieldValue::Null]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "line\\n\\ttab\t\\N\n");
    }

    #[test]
    fn sql_insert_quotes_values() {
        let mut buf = Vec::new();
        let mut sink = SqlSink::new(&mut buf);
        let cols = vec!["id".to_string(), "name".to_string()];
        sink.write_row("widgets", &cols, &[FieldValue::Text("1".to_string()), FieldValue::Text("O'Brien".to_string())]).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "INSERT INTO widgets(id, name) VALUES ('1', 'O''Brien');\n");
    }

    #[test]
    fn update_statement_sets_only_changed_columns() {
        let mut buf = Vec::new();
        write_update(&mut buf, "widgets", &[("name".to_string(), "new".to_string())], &("id".to_string(), "1".to_string())).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "UPDATE widgets SET name = 'new' WHERE id = '1';\n");
    }
}
