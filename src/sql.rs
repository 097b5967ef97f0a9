use sqlparser::ast::{
    self, AssignmentTarget, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement,
    TableFactor, TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertSection {
        id: Ulid,
        course_id: String,
        term_id: String,
        capacity: u32,
        meetings: Vec<Span>,
        prerequisites: Prerequisite,
    },
    UpdateSection {
        id: Ulid,
        capacity: Option<u32>,
        status: Option<SectionStatus>,
    },
    ArchiveTerm {
        term_id: String,
    },
    /// One row per `(student_id, section_id)` request, processed in order.
    Register {
        requests: Vec<(Ulid, Ulid)>,
    },
    Drop {
        student_id: Ulid,
        section_id: Ulid,
    },
    InsertCompletedCourses {
        rows: Vec<(Ulid, String, Grade)>,
    },
    InsertHold {
        id: Ulid,
        student_id: Ulid,
        reason: String,
    },
    DeleteHold {
        id: Ulid,
    },
    SelectSectionStatus {
        section_id: Ulid,
    },
    SelectSections {
        term_id: Option<String>,
    },
    SelectWaitlist {
        section_id: Ulid,
    },
    SelectEnrollments {
        section_id: Option<Ulid>,
        student_id: Option<Ulid>,
    },
    SelectHolds {
        student_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported statement: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column {1} in {0}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("invalid prerequisite: {0}")]
    Prerequisite(String),
    #[error(transparent)]
    Value(#[from] ParseError),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if let Some(cmd) = parse_listen(trimmed) {
        return Ok(cmd);
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_listen(trimmed: &str) -> Option<Command> {
    let upper = trimmed.to_ascii_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches('"').to_string();
        return Some(Command::Listen { channel });
    }
    if upper == "UNLISTEN *" || upper == "UNLISTEN" {
        return Some(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        let channel = trimmed[9..].trim().trim_matches('"').to_string();
        if channel == "*" {
            return Some(Command::UnlistenAll);
        }
        return Some(Command::Unlisten { channel });
    }
    None
}

// ── INSERT ────────────────────────────────────────────────────

const SECTION_COLUMNS: &[&str] = &[
    "id",
    "course_id",
    "term_id",
    "capacity",
    "meetings",
    "prerequisites",
];
const REGISTRATION_COLUMNS: &[&str] = &["student_id", "section_id"];
const COMPLETED_COLUMNS: &[&str] = &["student_id", "course_id", "grade"];
const HOLD_COLUMNS: &[&str] = &["id", "student_id", "reason"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "sections" => {
            let rows = insert_rows(insert, "sections", SECTION_COLUMNS)?;
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported(
                    "sections are published one row at a time".into(),
                ));
            };
            let meetings = match row.get("meetings") {
                Some(expr) => parse_string_or_null(expr)?
                    .map(|text| parse_meetings(&text))
                    .transpose()?
                    .unwrap_or_default(),
                None => Vec::new(),
            };
            let prerequisites = match row.get("prerequisites") {
                Some(expr) => match parse_string_or_null(expr)? {
                    Some(text) => parse_prerequisite(&text)?,
                    None => Prerequisite::None,
                },
                None => Prerequisite::None,
            };
            Ok(Command::InsertSection {
                id: parse_ulid(row.require("id")?)?,
                course_id: parse_string(row.require("course_id")?)?,
                term_id: parse_string(row.require("term_id")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
                meetings,
                prerequisites,
            })
        }
        "registrations" => {
            let rows = insert_rows(insert, "registrations", REGISTRATION_COLUMNS)?;
            if rows.len() > MAX_BATCH_SIZE {
                return Err(SqlError::LimitExceeded("too many registrations in one statement"));
            }
            let requests = rows
                .iter()
                .map(|row| {
                    Ok((
                        parse_ulid(row.require("student_id")?)?,
                        parse_ulid(row.require("section_id")?)?,
                    ))
                })
                .collect::<Result<_, SqlError>>()?;
            Ok(Command::Register { requests })
        }
        "completed_courses" => {
            let rows = insert_rows(insert, "completed_courses", COMPLETED_COLUMNS)?;
            if rows.len() > MAX_BATCH_SIZE {
                return Err(SqlError::LimitExceeded("too many rows in one statement"));
            }
            let rows = rows
                .iter()
                .map(|row| {
                    Ok((
                        parse_ulid(row.require("student_id")?)?,
                        parse_string(row.require("course_id")?)?,
                        parse_grade(row.require("grade")?)?,
                    ))
                })
                .collect::<Result<_, SqlError>>()?;
            Ok(Command::InsertCompletedCourses { rows })
        }
        "holds" => {
            let rows = insert_rows(insert, "holds", HOLD_COLUMNS)?;
            let [row] = rows.as_slice() else {
                return Err(SqlError::Unsupported("holds are placed one row at a time".into()));
            };
            Ok(Command::InsertHold {
                id: parse_ulid(row.require("id")?)?,
                student_id: parse_ulid(row.require("student_id")?)?,
                reason: parse_string(row.require("reason")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// One VALUES row with its cells keyed by column name.
struct Row<'a> {
    cells: Vec<(&'static str, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, expr)| *expr)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

/// Resolve the column list (explicit, or the table's full column order) and
/// pair it with every VALUES row.
fn insert_rows<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    known: &[&'static str],
) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<&'static str> = if insert.columns.is_empty() {
        known.to_vec()
    } else {
        insert
            .columns
            .iter()
            .map(|ident| {
                let name = ident.value.to_lowercase();
                known
                    .iter()
                    .copied()
                    .find(|k| *k == name)
                    .ok_or(SqlError::UnknownColumn(table, name))
            })
            .collect::<Result<_, _>>()?
    };

    let values = insert_values(insert)?;
    values
        .iter()
        .map(|row| {
            if row.len() != columns.len() {
                return Err(SqlError::WrongArity(table, columns.len(), row.len()));
            }
            Ok(Row {
                cells: columns.iter().copied().zip(row.iter()).collect(),
            })
        })
        .collect()
}

fn insert_values(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = equality_filters(&delete.selection)?;
    match table.as_str() {
        "registrations" => Ok(Command::Drop {
            student_id: parse_ulid(required_filter(&filters, "student_id")?)?,
            section_id: parse_ulid(required_filter(&filters, "section_id")?)?,
        }),
        "holds" => Ok(Command::DeleteHold {
            id: parse_ulid(required_filter(&filters, "id")?)?,
        }),
        "terms" => Ok(Command::ArchiveTerm {
            term_id: parse_string(required_filter(&filters, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "sections" {
        return Err(SqlError::UnknownTable(table));
    }
    let filters = equality_filters(selection)?;
    let id = parse_ulid(required_filter(&filters, "id")?)?;

    let (mut capacity, mut status) = (None, None);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "capacity" => capacity = Some(parse_u32(&assignment.value)?),
            "status" => status = Some(parse_string(&assignment.value)?.parse::<SectionStatus>()?),
            _ => return Err(SqlError::UnknownColumn("sections", column)),
        }
    }
    if capacity.is_none() && status.is_none() {
        return Err(SqlError::Parse("UPDATE sets nothing".into()));
    }
    Ok(Command::UpdateSection {
        id,
        capacity,
        status,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = equality_filters(&select.selection)?;

    match table.as_str() {
        "section_status" => Ok(Command::SelectSectionStatus {
            section_id: parse_ulid(required_filter(&filters, "section_id")?)?,
        }),
        "sections" => Ok(Command::SelectSections {
            term_id: optional_filter(&filters, "term_id")
                .map(parse_string)
                .transpose()?,
        }),
        "waitlist" => Ok(Command::SelectWaitlist {
            section_id: parse_ulid(required_filter(&filters, "section_id")?)?,
        }),
        "enrollments" => {
            let section_id = optional_filter(&filters, "section_id")
                .map(parse_ulid)
                .transpose()?;
            let student_id = optional_filter(&filters, "student_id")
                .map(parse_ulid)
                .transpose()?;
            if section_id.is_none() && student_id.is_none() {
                return Err(SqlError::MissingFilter("section_id or student_id"));
            }
            Ok(Command::SelectEnrollments {
                section_id,
                student_id,
            })
        }
        "holds" => Ok(Command::SelectHolds {
            student_id: parse_ulid(required_filter(&filters, "student_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms of a conjunction. Anything else in the
/// WHERE clause is rejected rather than silently ignored.
fn equality_filters(selection: &Option<Expr>) -> Result<Vec<(String, &Expr)>, SqlError> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => walk(inner, out),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                walk(left, out)?;
                walk(right, out)
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => {
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
                out.push((column, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("filter {other}"))),
        }
    }

    let mut out = Vec::new();
    if let Some(expr) = selection {
        walk(expr, &mut out)?;
    }
    Ok(out)
}

fn optional_filter<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters
        .iter()
        .find(|(name, _)| name == column)
        .map(|(_, expr)| *expr)
}

fn required_filter<'a>(
    filters: &[(String, &'a Expr)],
    column: &'static str,
) -> Result<&'a Expr, SqlError> {
    optional_filter(filters, column).ok_or(SqlError::MissingFilter(column))
}

// ── Prerequisite expressions ──────────────────────────────────

/// Parse a prerequisite rule such as `CS101 >= C AND (MATH200 OR MATH210 >= 2.7)`.
/// A course is a bare or double-quoted identifier; `>=` takes a letter grade
/// (bare or quoted) or grade points. An empty rule means no prerequisite.
pub fn parse_prerequisite(text: &str) -> Result<Prerequisite, SqlError> {
    if text.len() > MAX_PREREQUISITE_LEN {
        return Err(SqlError::LimitExceeded("prerequisite rule too long"));
    }
    if text.trim().is_empty() {
        return Ok(Prerequisite::None);
    }
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect)
        .try_with_sql(text)
        .map_err(|e| SqlError::Prerequisite(e.to_string()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| SqlError::Prerequisite(e.to_string()))?;
    if parser.peek_token().token != Token::EOF {
        return Err(SqlError::Prerequisite(format!("trailing input in {text:?}")));
    }
    prerequisite_from_expr(&expr)
}

fn prerequisite_from_expr(expr: &Expr) -> Result<Prerequisite, SqlError> {
    match expr {
        Expr::Nested(inner) => prerequisite_from_expr(inner),
        Expr::BinaryOp {
            op: op @ (BinaryOperator::And | BinaryOperator::Or),
            ..
        } => {
            let mut terms = Vec::new();
            flatten(expr, op, &mut terms);
            let parts = terms
                .into_iter()
                .map(prerequisite_from_expr)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(if *op == BinaryOperator::And {
                Prerequisite::All(parts)
            } else {
                Prerequisite::Any(parts)
            })
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::GtEq,
            right,
        } => Ok(Prerequisite::Course {
            course_id: course_code(left)?,
            min_grade: Some(grade_operand(right)?),
        }),
        _ => Ok(Prerequisite::Course {
            course_id: course_code(expr)?,
            min_grade: None,
        }),
    }
}

/// Gather the operands of a chain of the same boolean operator, looking
/// through parentheses.
fn flatten<'a>(expr: &'a Expr, op: &BinaryOperator, out: &mut Vec<&'a Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: inner,
            right,
        } if inner == op => {
            flatten(left, op, out);
            flatten(right, op, out);
        }
        Expr::Nested(inner) if matches!(inner.as_ref(), Expr::BinaryOp { op: o, .. } if o == op) => {
            flatten(inner, op, out)
        }
        other => out.push(other),
    }
}

fn course_code(expr: &Expr) -> Result<String, SqlError> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::Nested(inner) => course_code(inner),
        _ => match extract_value(expr) {
            Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
            _ => Err(SqlError::Prerequisite(format!("expected a course, got {expr}"))),
        },
    }
}

fn grade_operand(expr: &Expr) -> Result<Grade, SqlError> {
    let text = match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        _ => match extract_value(expr) {
            Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => s.clone(),
            _ => return Err(SqlError::Prerequisite(format!("expected a grade, got {expr}"))),
        },
    };
    Ok(text.parse::<Grade>()?)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(s, _)) => Ok(Some(s.clone())),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    parse_string_or_null(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let text = parse_string(expr)?;
    Ulid::from_string(&text).map_err(|e| SqlError::Parse(format!("bad ULID {text:?}: {e}")))
}

/// Numbers arrive bare from simple queries and quoted from bound parameters.
fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        ..
    } = expr
    {
        return Err(SqlError::Parse(format!("expected non-negative integer, got {expr}")));
    }
    let text = parse_string(expr)?;
    text.trim()
        .parse::<u32>()
        .map_err(|e| SqlError::Parse(format!("bad integer {text:?}: {e}")))
}

fn parse_grade(expr: &Expr) -> Result<Grade, SqlError> {
    Ok(parse_string(expr)?.parse::<Grade>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECTION: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const STUDENT: &str = "01BX5ZZKBKACTAV9WEVGEMMVRZ";
    const OTHER: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    #[test]
    fn parse_insert_section() {
        let sql = format!(
            "INSERT INTO sections (id, course_id, term_id, capacity, meetings, prerequisites) \
             VALUES ('{SECTION}', 'CS201', '2026FA', 30, 'MON/WED 09:00-10:15', 'CS101 >= C')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSection {
                id,
                course_id,
                term_id,
                capacity,
                meetings,
                prerequisites,
            } => {
                assert_eq!(id, ulid(SECTION));
                assert_eq!(course_id, "CS201");
                assert_eq!(term_id, "2026FA");
                assert_eq!(capacity, 30);
                assert_eq!(meetings, vec![Span::new(540, 615), Span::new(2 * 1440 + 540, 2 * 1440 + 615)]);
                assert_eq!(
                    prerequisites,
                    Prerequisite::Course {
                        course_id: "CS101".into(),
                        min_grade: Some(Grade(200)),
                    }
                );
            }
            other => panic!("expected InsertSection, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_section_without_optional_columns() {
        let sql = format!(
            "INSERT INTO sections (id, course_id, term_id, capacity) VALUES ('{SECTION}', 'MATH200', '2026FA', '12')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertSection {
                capacity,
                meetings,
                prerequisites,
                ..
            } => {
                assert_eq!(capacity, 12);
                assert!(meetings.is_empty());
                assert_eq!(prerequisites, Prerequisite::None);
            }
            other => panic!("expected InsertSection, got {other:?}"),
        }
    }

    #[test]
    fn parse_insert_section_missing_capacity() {
        let sql = format!("INSERT INTO sections (id, course_id, term_id) VALUES ('{SECTION}', 'CS201', '2026FA')");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingColumn("capacity")));
    }

    #[test]
    fn parse_insert_section_bad_meetings() {
        let sql = format!(
            "INSERT INTO sections (id, course_id, term_id, capacity, meetings) VALUES ('{SECTION}', 'CS201', '2026FA', 30, 'XYZ 09:00-10:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(ParseError::Meeting(_)))));
    }

    #[test]
    fn parse_batch_registration() {
        let sql = format!(
            "INSERT INTO registrations (student_id, section_id) VALUES ('{STUDENT}', '{SECTION}'), ('{OTHER}', '{SECTION}')"
        );
        match parse_sql(&sql).unwrap() {
            Command::Register { requests } => {
                assert_eq!(
                    requests,
                    vec![(ulid(STUDENT), ulid(SECTION)), (ulid(OTHER), ulid(SECTION))]
                );
            }
            other => panic!("expected Register, got {other:?}"),
        }
    }

    #[test]
    fn parse_registration_columns_in_any_order() {
        let sql = format!("INSERT INTO registrations (section_id, student_id) VALUES ('{SECTION}', '{STUDENT}')");
        match parse_sql(&sql).unwrap() {
            Command::Register { requests } => assert_eq!(requests, vec![(ulid(STUDENT), ulid(SECTION))]),
            other => panic!("expected Register, got {other:?}"),
        }
    }

    #[test]
    fn parse_registration_wrong_arity() {
        let sql = format!("INSERT INTO registrations VALUES ('{STUDENT}')");
        assert_eq!(parse_sql(&sql), Err(SqlError::WrongArity("registrations", 2, 1)));
    }

    #[test]
    fn parse_drop() {
        let sql = format!("DELETE FROM registrations WHERE student_id = '{STUDENT}' AND section_id = '{SECTION}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::Drop {
                student_id: ulid(STUDENT),
                section_id: ulid(SECTION),
            }
        );
    }

    #[test]
    fn parse_drop_requires_both_filters() {
        let sql = format!("DELETE FROM registrations WHERE student_id = '{STUDENT}'");
        assert_eq!(parse_sql(&sql), Err(SqlError::MissingFilter("section_id")));
    }

    #[test]
    fn parse_update_capacity() {
        let sql = format!("UPDATE sections SET capacity = 45 WHERE id = '{SECTION}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSection {
                id: ulid(SECTION),
                capacity: Some(45),
                status: None,
            }
        );
    }

    #[test]
    fn parse_update_status() {
        let sql = format!("UPDATE sections SET status = 'cancelled' WHERE id = '{SECTION}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::UpdateSection {
                id: ulid(SECTION),
                capacity: None,
                status: Some(SectionStatus::Cancelled),
            }
        );
    }

    #[test]
    fn parse_update_unknown_status() {
        let sql = format!("UPDATE sections SET status = 'paused' WHERE id = '{SECTION}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Value(ParseError::Status(_)))));
    }

    #[test]
    fn parse_update_negative_capacity() {
        let sql = format!("UPDATE sections SET capacity = -3 WHERE id = '{SECTION}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_archive_term() {
        assert_eq!(
            parse_sql("DELETE FROM terms WHERE id = '2026FA'").unwrap(),
            Command::ArchiveTerm {
                term_id: "2026FA".into()
            }
        );
    }

    #[test]
    fn parse_completed_courses_letter_and_points() {
        let sql = format!(
            "INSERT INTO completed_courses (student_id, course_id, grade) VALUES ('{STUDENT}', 'CS101', 'B+'), ('{STUDENT}', 'MATH200', 2.7)"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertCompletedCourses { rows } => {
                assert_eq!(
                    rows,
                    vec![
                        (ulid(STUDENT), "CS101".to_string(), Grade(330)),
                        (ulid(STUDENT), "MATH200".to_string(), Grade(270)),
                    ]
                );
            }
            other => panic!("expected InsertCompletedCourses, got {other:?}"),
        }
    }

    #[test]
    fn parse_hold_lifecycle() {
        let sql = format!("INSERT INTO holds (id, student_id, reason) VALUES ('{OTHER}', '{STUDENT}', 'bursar')");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::InsertHold {
                id: ulid(OTHER),
                student_id: ulid(STUDENT),
                reason: "bursar".into(),
            }
        );
        let sql = format!("DELETE FROM holds WHERE id = '{OTHER}'");
        assert_eq!(parse_sql(&sql).unwrap(), Command::DeleteHold { id: ulid(OTHER) });
    }

    #[test]
    fn parse_selects() {
        let sql = format!("SELECT * FROM section_status WHERE section_id = '{SECTION}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectSectionStatus {
                section_id: ulid(SECTION)
            }
        );
        assert_eq!(
            parse_sql("SELECT * FROM sections").unwrap(),
            Command::SelectSections { term_id: None }
        );
        assert_eq!(
            parse_sql("SELECT * FROM sections WHERE term_id = '2026FA'").unwrap(),
            Command::SelectSections {
                term_id: Some("2026FA".into())
            }
        );
        let sql = format!("SELECT * FROM waitlist WHERE section_id = '{SECTION}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectWaitlist {
                section_id: ulid(SECTION)
            }
        );
        let sql = format!("SELECT * FROM enrollments WHERE student_id = '{STUDENT}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectEnrollments {
                section_id: None,
                student_id: Some(ulid(STUDENT)),
            }
        );
        let sql = format!("SELECT * FROM holds WHERE student_id = '{STUDENT}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::SelectHolds {
                student_id: ulid(STUDENT)
            }
        );
    }

    #[test]
    fn parse_enrollments_needs_a_filter() {
        assert_eq!(
            parse_sql("SELECT * FROM enrollments"),
            Err(SqlError::MissingFilter("section_id or student_id"))
        );
    }

    #[test]
    fn parse_unsupported_filter() {
        let sql = format!("SELECT * FROM waitlist WHERE section_id = '{SECTION}' OR section_id = '{OTHER}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_listen_unlisten() {
        let chan = format!("section_{SECTION}");
        assert_eq!(
            parse_sql(&format!("LISTEN {chan};")).unwrap(),
            Command::Listen { channel: chan.clone() }
        );
        assert_eq!(
            parse_sql(&format!("UNLISTEN {chan}")).unwrap(),
            Command::Unlisten { channel: chan }
        );
        assert_eq!(parse_sql("UNLISTEN *").unwrap(), Command::UnlistenAll);
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = "SELECT * FROM bookings";
        assert_eq!(parse_sql(sql), Err(SqlError::UnknownTable("bookings".into())));
    }

    #[test]
    fn parse_empty_errors() {
        assert_eq!(parse_sql(""), Err(SqlError::Empty));
    }

    #[test]
    fn prerequisite_nested_groups() {
        let rule = parse_prerequisite("CS101 >= C AND (MATH200 OR MATH210 >= 2.7)").unwrap();
        assert_eq!(
            rule,
            Prerequisite::All(vec![
                Prerequisite::Course {
                    course_id: "CS101".into(),
                    min_grade: Some(Grade(200)),
                },
                Prerequisite::Any(vec![
                    Prerequisite::Course {
                        course_id: "MATH200".into(),
                        min_grade: None,
                    },
                    Prerequisite::Course {
                        course_id: "MATH210".into(),
                        min_grade: Some(Grade(270)),
                    },
                ]),
            ])
        );
    }

    #[test]
    fn prerequisite_chains_flatten() {
        let rule = parse_prerequisite("A1 AND (B1 AND C1) AND D1").unwrap();
        match rule {
            Prerequisite::All(parts) => assert_eq!(parts.len(), 4),
            other => panic!("expected All, got {other:?}"),
        }
    }

    #[test]
    fn prerequisite_quoted_code_and_grade() {
        let rule = parse_prerequisite("\"CS-101\" >= 'B+'").unwrap();
        assert_eq!(
            rule,
            Prerequisite::Course {
                course_id: "CS-101".into(),
                min_grade: Some(Grade(330)),
            }
        );
    }

    #[test]
    fn prerequisite_display_reparses() {
        let rule = parse_prerequisite("CS101 >= 'B-' OR (MATH200 AND \"PHYS-1\")").unwrap();
        assert_eq!(parse_prerequisite(&rule.to_string()).unwrap(), rule);
    }

    #[test]
    fn prerequisite_empty_is_none() {
        assert_eq!(parse_prerequisite("  ").unwrap(), Prerequisite::None);
    }

    #[test]
    fn prerequisite_rejects_garbage() {
        assert!(parse_prerequisite("CS101 >=").is_err());
        assert!(parse_prerequisite("CS101 < C").is_err());
        assert!(parse_prerequisite("CS101 >= Z").is_err());
        assert!(parse_prerequisite("CS101 CS102").is_err());
    }

    #[test]
    fn prerequisite_too_long() {
        let text = vec!["CS101"; MAX_PREREQUISITE_LEN].join(" OR ");
        assert_eq!(
            parse_prerequisite(&text),
            Err(SqlError::LimitExceeded("prerequisite rule too long"))
        );
    }
}
