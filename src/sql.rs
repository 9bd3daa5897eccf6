use sqlparser::ast::{
    self, Expr, FromTable, Ident, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject,
    Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `INSERT INTO bookings (provider_id, date, time, ...) VALUES (...)`.
    /// Column names as written (unquoted names folded to lower case), in order.
    CreateBooking {
        fields: Vec<(String, Option<String>)>,
    },
    CancelBooking {
        id: Ulid,
    },
    RateBooking {
        booking_id: Ulid,
        stars: i64,
    },
    SelectMySchedule,
    SelectProviderRating {
        provider_id: String,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("one statement per query".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_single_row(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(column_ident).collect();

    match table.as_str() {
        "bookings" => {
            if columns.is_empty() {
                return Err(SqlError::Parse(
                    "INSERT INTO bookings needs a column list".into(),
                ));
            }
            if columns.len() != values.len() {
                return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
            }
            let mut fields = Vec::with_capacity(columns.len());
            for (column, value) in columns.into_iter().zip(&values) {
                if fields.iter().any(|(c, _)| *c == column) {
                    return Err(SqlError::Parse(format!("column {column} given twice")));
                }
                fields.push((column, parse_text_or_null(value)?));
            }
            Ok(Command::CreateBooking { fields })
        }
        "ratings" => {
            if values.len() != 2 {
                return Err(SqlError::WrongArity("ratings", 2, values.len()));
            }
            // Positional unless a column list says otherwise.
            let (mut id_at, mut stars_at) = (0, 1);
            if !columns.is_empty() {
                id_at = position(&columns, "booking_id")?;
                stars_at = position(&columns, "stars")?;
            }
            Ok(Command::RateBooking {
                booking_id: parse_ulid_expr(&values[id_at])?,
                stars: parse_i64_expr(&values[stars_at])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: parse_ulid_expr(where_eq(&delete.selection, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "bookings" => {
            if select.selection.is_some() {
                return Err(SqlError::Unsupported(
                    "bookings are listed for the logged-in user only".into(),
                ));
            }
            Ok(Command::SelectMySchedule)
        }
        "provider_ratings" => Ok(Command::SelectProviderRating {
            provider_id: parse_string_expr(where_eq(&select.selection, "provider_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

/// Postgres folds unquoted identifiers to lower case; quoted ones keep their spelling.
fn column_ident(ident: &Ident) -> String {
    if ident.quote_style.is_some() {
        ident.value.clone()
    } else {
        ident.value.to_lowercase()
    }
}

fn position(columns: &[String], name: &'static str) -> Result<usize, SqlError> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or(SqlError::MissingColumn(name))
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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_single_row(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.len() {
            0 => Err(SqlError::Parse("empty VALUES".into())),
            1 => Ok(values.rows[0].clone()),
            _ => Err(SqlError::Unsupported("one row per INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// The right-hand side of a `WHERE <column> = <value>` filter.
fn where_eq<'a>(selection: &'a Option<Expr>, column: &'static str) -> Result<&'a Expr, SqlError> {
    let mut expr = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    while let Expr::Nested(inner) = expr {
        expr = inner.as_ref();
    }
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => Ok(right.as_ref()),
        _ => Err(SqlError::MissingFilter(column)),
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Any literal as text; NULL as None.
fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n, _)) => Ok(Some(n.clone())),
        Some(Value::Boolean(b)) => Ok(Some(b.to_string())),
        Some(value) => Err(SqlError::Parse(format!("unsupported literal {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col} = ..."),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    #[test]
    fn parse_create_booking() {
        let sql = "INSERT INTO bookings (provider_id, date, time, provider_name) \
                   VALUES ('p1', '2025-11-01', '09:00', 'Maria Fernandes')";
        let cmd = parse_sql(sql).unwrap();
        assert_eq!(
            cmd,
            Command::CreateBooking {
                fields: vec![
                    ("provider_id".into(), Some("p1".into())),
                    ("date".into(), Some("2025-11-01".into())),
                    ("time".into(), Some("09:00".into())),
                    ("provider_name".into(), Some("Maria Fernandes".into())),
                ],
            }
        );
    }

    #[test]
    fn create_booking_keeps_quoted_column_case_and_nulls() {
        let sql = r#"INSERT INTO bookings ("providerId", DATE, "time", "clientAvatar", rooms) VALUES ('p1', '2025-11-01', '09:00', NULL, 3)"#;
        match parse_sql(sql).unwrap() {
            Command::CreateBooking { fields } => {
                assert_eq!(fields[0].0, "providerId");
                assert_eq!(fields[1].0, "date");
                assert_eq!(fields[3], ("clientAvatar".into(), None));
                assert_eq!(fields[4], ("rooms".into(), Some("3".into())));
            }
            cmd => panic!("expected CreateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn create_booking_requires_matching_columns() {
        let no_columns = "INSERT INTO bookings VALUES ('p1', '2025-11-01', '09:00')";
        assert!(matches!(parse_sql(no_columns), Err(SqlError::Parse(_))));

        let short = "INSERT INTO bookings (provider_id, date, time) VALUES ('p1', '2025-11-01')";
        assert!(matches!(
            parse_sql(short),
            Err(SqlError::WrongArity("bookings", 3, 2))
        ));

        let twice = "INSERT INTO bookings (date, date) VALUES ('2025-11-01', '2025-11-02')";
        assert!(parse_sql(twice).is_err());
    }

    #[test]
    fn create_booking_is_one_row() {
        let sql = "INSERT INTO bookings (provider_id, date, time) VALUES \
                   ('p1', '2025-11-01', '09:00'), ('p2', '2025-11-01', '09:00')";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_cancel_booking() {
        let sql = format!("DELETE FROM bookings WHERE id = '{ID}'");
        match parse_sql(&sql).unwrap() {
            Command::CancelBooking { id } => assert_eq!(id.to_string(), ID),
            cmd => panic!("expected CancelBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn cancel_booking_needs_id_filter() {
        assert!(matches!(
            parse_sql("DELETE FROM bookings"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM bookings WHERE provider_id = 'p1'"),
            Err(SqlError::MissingFilter("id"))
        ));
        assert!(parse_sql("DELETE FROM bookings WHERE id = 'not-a-ulid'").is_err());
    }

    #[test]
    fn parse_rate_booking() {
        let sql = format!("INSERT INTO ratings (booking_id, stars) VALUES ('{ID}', 4)");
        match parse_sql(&sql).unwrap() {
            Command::RateBooking { booking_id, stars } => {
                assert_eq!(booking_id.to_string(), ID);
                assert_eq!(stars, 4);
            }
            cmd => panic!("expected RateBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn rate_booking_columns_in_any_order() {
        let sql = format!("INSERT INTO ratings (stars, booking_id) VALUES ('5', '{ID}')");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::RateBooking { stars: 5, .. }
        ));
        let positional = format!("INSERT INTO ratings VALUES ('{ID}', -1)");
        assert!(matches!(
            parse_sql(&positional).unwrap(),
            Command::RateBooking { stars: -1, .. }
        ));
    }

    #[test]
    fn parse_select_schedule() {
        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectMySchedule
        );
        assert!(parse_sql("SELECT * FROM bookings WHERE provider_id = 'p1'").is_err());
    }

    #[test]
    fn parse_select_provider_rating() {
        let cmd = parse_sql("SELECT * FROM provider_ratings WHERE provider_id = 'p1'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectProviderRating {
                provider_id: "p1".into()
            }
        );
        assert!(matches!(
            parse_sql("SELECT * FROM provider_ratings"),
            Err(SqlError::MissingFilter("provider_id"))
        ));
    }

    #[test]
    fn parse_unknown_table_errors() {
        assert!(matches!(
            parse_sql("SELECT * FROM users"),
            Err(SqlError::UnknownTable(_))
        ));
        assert!(matches!(
            parse_sql("DELETE FROM ratings WHERE id = 'x'"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
        assert!(matches!(parse_sql("SELEC 1"), Err(SqlError::Parse(_))));
    }
}
