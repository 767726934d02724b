//! Minimal CSV reader for roster uploads.
//!
//! One physical line is one record. Quoted values may contain commas and
//! doubled quotes, but not line breaks.

use roster_core::RosterRow;
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CsvError {
    #[error("csv input has no header line")]
    MissingHeader,
    #[error("line {line}: header column {column} is empty")]
    EmptyHeader { line: usize, column: usize },
    #[error("line {line}: header {name:?} appears more than once")]
    DuplicateHeader { line: usize, name: String },
    #[error("line {line}: expected at most {expected} values, found {found}")]
    TooManyValues {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: unterminated quoted value")]
    UnterminatedQuote { line: usize },
    #[error("line {line}: unexpected character after closing quote")]
    TrailingAfterQuote { line: usize },
}

/// One data line, paired with its header names.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CsvRecord {
    pub line: usize,
    pub fields: Vec<(String, String)>,
}

/// A data line that did not produce a valid row.
#[derive(Debug, Clone, thiserror::Error, Serialize, Eq, PartialEq)]
#[error("row {row_index} (line {line}): {reason}")]
pub struct RowParseError {
    pub row_index: usize,
    pub line: usize,
    pub reason: String,
}

/// A validated row and where it came from. `row_index` counts every data
/// record in the file, rejected ones included.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ParsedRow {
    pub row_index: usize,
    pub line: usize,
    pub row: RosterRow,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRows {
    pub rows: Vec<ParsedRow>,
    pub rejected: Vec<RowParseError>,
}

impl ParsedRows {
    /// The valid rows in file order, ready for reconciliation.
    #[must_use]
    pub fn roster_rows(&self) -> Vec<RosterRow> {
        self.rows.iter().map(|parsed| parsed.row.clone()).collect()
    }
}

/// Splits CSV text into header-keyed records.
///
/// # Errors
/// Returns [`CsvError`] for header problems or a line that cannot be split.
pub fn parse_records(text: &str) -> Result<Vec<CsvRecord>, CsvError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((header_line, header_text)) = lines.next() else {
        return Err(CsvError::MissingHeader);
    };

    let headers = split_line(header_text, header_line)?;
    for (column, name) in headers.iter().enumerate() {
        if name.is_empty() {
            return Err(CsvError::EmptyHeader {
                line: header_line,
                column: column + 1,
            });
        }
        if headers[..column].contains(name) {
            return Err(CsvError::DuplicateHeader {
                line: header_line,
                name: name.clone(),
            });
        }
    }

    let mut records = Vec::new();
    for (line, text) in lines {
        let values = split_line(text, line)?;
        if values.len() > headers.len() {
            return Err(CsvError::TooManyValues {
                line,
                expected: headers.len(),
                found: values.len(),
            });
        }

        records.push(CsvRecord {
            line,
            fields: headers.iter().cloned().zip(values).collect(),
        });
    }

    Ok(records)
}

/// Parses CSV text and validates every record as a [`RosterRow`]. Rows that
/// fail validation are collected in `rejected` instead of aborting.
///
/// # Errors
/// Returns [`CsvError`] when the text itself cannot be split into records.
pub fn rows_from_csv(text: &str) -> Result<ParsedRows, CsvError> {
    let mut parsed = ParsedRows::default();
    for (row_index, record) in parse_records(text)?.into_iter().enumerate() {
        match RosterRow::from_record(record.fields) {
            Ok(row) => parsed.rows.push(ParsedRow {
                row_index,
                line: record.line,
                row,
            }),
            Err(err) => parsed.rejected.push(RowParseError {
                row_index,
                line: record.line,
                reason: err.to_string(),
            }),
        }
    }
    Ok(parsed)
}

fn split_line(text: &str, line: usize) -> Result<Vec<String>, CsvError> {
    let mut values = Vec::new();
    let mut chars = text.chars().peekable();

    loop {
        while chars.peek().is_some_and(|ch| *ch == ' ' || *ch == '\t') {
            chars.next();
        }

        if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        value.push('"');
                    }
                    Some('"') => break,
                    Some(ch) => value.push(ch),
                    None => return Err(CsvError::UnterminatedQuote { line }),
                }
            }
            while chars.peek().is_some_and(|ch| *ch == ' ' || *ch == '\t') {
                chars.next();
            }
            match chars.next() {
                None => {
                    values.push(value);
                    return Ok(values);
                }
                Some(',') => values.push(value),
                Some(_) => return Err(CsvError::TrailingAfterQuote { line }),
            }
        } else {
            let mut value = String::new();
            loop {
                match chars.next() {
                    None => {
                        values.push(value.trim().to_string());
                        return Ok(values);
                    }
                    Some(',') => break,
                    Some(ch) => value.push(ch),
                }
            }
            values.push(value.trim().to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::MemberId;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn quoted_values_keep_commas_and_quotes() {
        let records = must(parse_records(
            "id,first_name,note\n1,\"Lee, Ana\",\"said \"\"hi\"\"\"\n",
        ));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].line, 2);
        assert_eq!(
            records[0].fields,
            vec![
                ("id".to_string(), "1".to_string()),
                ("first_name".to_string(), "Lee, Ana".to_string()),
                ("note".to_string(), "said \"hi\"".to_string()),
            ]
        );
    }

    #[test]
    fn blank_lines_and_crlf_are_tolerated() {
        let records = must(parse_records("id , city\r\n\r\n 1 , NYC \r\n\n2,\r\n"));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields[1], ("city".to_string(), "NYC".to_string()));
        assert_eq!(records[1].line, 5);
        assert_eq!(records[1].fields[1], ("city".to_string(), String::new()));
    }

    #[test]
    fn short_lines_leave_trailing_columns_absent() {
        let records = must(parse_records("id,first_name,last_name\n1,Ana\n"));
        assert_eq!(records[0].fields.len(), 2);
    }

    #[test]
    fn header_problems_are_rejected() {
        assert_eq!(parse_records("\n\n"), Err(CsvError::MissingHeader));
        assert_eq!(
            parse_records("id,,city\n"),
            Err(CsvError::EmptyHeader { line: 1, column: 2 })
        );
        assert_eq!(
            parse_records("id,city,city\n"),
            Err(CsvError::DuplicateHeader {
                line: 1,
                name: "city".to_string()
            })
        );
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(
            parse_records("id\n1,2\n"),
            Err(CsvError::TooManyValues {
                line: 2,
                expected: 1,
                found: 2
            })
        );
        assert_eq!(
            parse_records("id\n\"1\n"),
            Err(CsvError::UnterminatedQuote { line: 2 })
        );
        assert_eq!(
            parse_records("id\n\"1\"x\n"),
            Err(CsvError::TrailingAfterQuote { line: 2 })
        );
    }

    #[test]
    fn rows_from_csv_separates_rejected_rows() {
        let parsed = must(rows_from_csv(
            "id,first_name,last_name,dob,city\n\
             1,Ana,Lee,1990-01-01,NYC\n\
             abc,Bo,Kim,1985-05-05,LA\n\
             3,Cy,Ng,1970-03-03\n",
        ));

        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].row.id, MemberId(1));
        assert_eq!(parsed.rows[1].row.id, MemberId(3));
        assert_eq!(parsed.rows[1].row_index, 2);
        assert_eq!(parsed.rows[1].line, 4);
        assert!(parsed.rows[1].row.extra_fields.is_empty());
        assert_eq!(parsed.roster_rows().len(), 2);

        assert_eq!(parsed.rejected.len(), 1);
        assert_eq!(parsed.rejected[0].row_index, 1);
        assert_eq!(parsed.rejected[0].line, 3);
        assert!(parsed.rejected[0].reason.contains("not an integer"));
    }
}
