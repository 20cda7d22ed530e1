//! A small executor for constant handler queries.
//!
//! Evaluates a single `SELECT` without a database: literals, casts, string
//! concatenation, header arrays and columns of the `request` relation. It
//! backs the reference binary and the integration tests.
//!
//! Output columns map to `(status, headers, body)` by alias when every
//! column is aliased with one of those names, positionally otherwise. A
//! single `http_response(...)` call is also accepted, with positional
//! `(body, status, headers)` or named arguments.

use bytes::Bytes;
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, UnaryOperator, Value,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::handlers::validator::{normalize_type, REQUEST_CTE};
use crate::host::{Datum, ExecutionError, Interrupt, QueryExecutor, RequestBinding};
use crate::response::{HeaderTriple, Headers, ResponseParts};

/// Evaluates constant `SELECT` statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantExecutor;

impl ConstantExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl QueryExecutor for ConstantExecutor {
    fn execute(
        &self,
        query: &str,
        request: &RequestBinding,
        interrupt: &Interrupt,
    ) -> Result<ResponseParts, ExecutionError> {
        if interrupt.is_triggered() {
            return Err(ExecutionError::Canceled);
        }

        let select = parse_select(query)?;
        let scope = Scope::from_select(&select, request)?;
        if let Some(args) = response_call(&select) {
            let parts = scope.http_response(args)?;
            return if interrupt.is_triggered() {
                Err(ExecutionError::Canceled)
            } else {
                Ok(parts)
            };
        }

        let mut columns = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            let (expr, alias) = match item {
                SelectItem::UnnamedExpr(expr) => (expr, None),
                SelectItem::ExprWithAlias { expr, alias } => {
                    (expr, Some(alias.value.to_ascii_lowercase()))
                }
                other => {
                    return Err(ExecutionError::Unsupported(format!(
                        "select item {other}"
                    )))
                }
            };
            columns.push((alias, scope.eval(expr)?));
        }

        if interrupt.is_triggered() {
            return Err(ExecutionError::Canceled);
        }
        into_parts(columns)
    }
}

fn parse_select(query: &str) -> Result<Box<Select>, ExecutionError> {
    let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, query)
        .map_err(|e| ExecutionError::Query(e.to_string()))?;
    if statements.len() != 1 {
        return Err(ExecutionError::Query(format!(
            "expected one statement, found {}",
            statements.len()
        )));
    }
    let Statement::Query(query) = statements.remove(0) else {
        return Err(ExecutionError::Unsupported("only SELECT is supported".to_string()));
    };
    let Query { with, body, .. } = *query;
    if with.is_some() {
        return Err(ExecutionError::Unsupported("WITH clauses".to_string()));
    }
    match *body {
        SetExpr::Select(select) => Ok(select),
        other => Err(ExecutionError::Unsupported(format!("query body {other}"))),
    }
}

/// Names visible to expressions.
struct Scope<'a> {
    request: &'a RequestBinding,
    /// Whether `request` is in the FROM list, making bare column names visible.
    from_request: bool,
}

impl<'a> Scope<'a> {
    fn from_select(select: &Select, request: &'a RequestBinding) -> Result<Self, ExecutionError> {
        if select.selection.is_some() {
            return Err(ExecutionError::Unsupported("WHERE clauses".to_string()));
        }
        let from_request = match select.from.as_slice() {
            [] => false,
            [table] if table.joins.is_empty() => match &table.relation {
                TableFactor::Table { name, .. }
                    if name.to_string().eq_ignore_ascii_case(REQUEST_CTE) =>
                {
                    true
                }
                other => {
                    return Err(ExecutionError::Query(format!(
                        "relation {other} does not exist"
                    )))
                }
            },
            _ => return Err(ExecutionError::Unsupported("joins".to_string())),
        };
        Ok(Self {
            request,
            from_request,
        })
    }

    fn column(&self, name: &str) -> Result<Datum, ExecutionError> {
        self.request
            .column(&name.to_ascii_lowercase())
            .ok_or_else(|| ExecutionError::Query(format!("column {name} does not exist")))
    }

    fn eval(&self, expr: &Expr) -> Result<Datum, ExecutionError> {
        match expr {
            Expr::Value(value) => literal(&value.value),
            Expr::Nested(inner) => self.eval(inner),
            Expr::Identifier(ident) if self.from_request => self.column(&ident.value),
            Expr::Identifier(ident) => Err(ExecutionError::Query(format!(
                "column {} does not exist",
                ident.value
            ))),
            Expr::CompoundIdentifier(idents)
                if idents.len() == 2 && idents[0].value.eq_ignore_ascii_case(REQUEST_CTE) =>
            {
                if !self.from_request {
                    return Err(ExecutionError::Query(format!(
                        "missing FROM-clause entry for table \"{REQUEST_CTE}\""
                    )));
                }
                self.column(&idents[1].value)
            }
            Expr::Cast {
                expr, data_type, ..
            } => {
                let raw = data_type.to_string();
                cast(self.eval(expr)?, &normalize_type(&raw), raw.trim_end().ends_with("[]"))
            }
            Expr::BinaryOp {
                left,
                op: BinaryOperator::StringConcat,
                right,
            } => {
                let (left, right) = (self.eval(left)?, self.eval(right)?);
                match (left.to_text(), right.to_text()) {
                    (Some(l), Some(r)) => Ok(Datum::Text(l + &r)),
                    _ => Ok(Datum::Null),
                }
            }
            Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr,
            } => match self.eval(expr)? {
                Datum::Int(i) => i
                    .checked_neg()
                    .map(Datum::Int)
                    .ok_or_else(|| ExecutionError::Query("bigint out of range".to_string())),
                Datum::Float(f) => Ok(Datum::Float(-f)),
                other => Err(ExecutionError::Query(format!(
                    "operator does not exist: - {}",
                    other.type_name()
                ))),
            },
            Expr::Array(array) => {
                let mut headers = Headers::new();
                for elem in &array.elem {
                    headers.push(self.header(elem)?);
                }
                Ok(Datum::Headers(headers))
            }
            Expr::Function(function) => {
                let name = function.name.to_string().to_ascii_lowercase();
                let name = name.rsplit('.').next().unwrap_or(&name).to_string();
                match name.as_str() {
                    "convert_from" => {
                        let args = self.positional_args(&function.args)?;
                        match args.first() {
                            Some(Datum::Bytes(bytes)) => {
                                Ok(Datum::Text(String::from_utf8_lossy(bytes).into_owned()))
                            }
                            Some(Datum::Null) => Ok(Datum::Null),
                            _ => Err(ExecutionError::Query(
                                "convert_from expects a bytea argument".to_string(),
                            )),
                        }
                    }
                    "http_header" | "row" => {
                        let header = header_from(self.positional_args(&function.args)?)?;
                        Ok(Datum::Headers(Headers::from(vec![header])))
                    }
                    other => Err(ExecutionError::Query(format!(
                        "function {other} does not exist"
                    ))),
                }
            }
            other => Err(ExecutionError::Unsupported(format!("expression {other}"))),
        }
    }

    fn header(&self, expr: &Expr) -> Result<HeaderTriple, ExecutionError> {
        match expr {
            Expr::Tuple(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<Result<Vec<_>, _>>()?;
                header_from(values)
            }
            other => match self.eval(other)? {
                Datum::Headers(headers) if headers.len() == 1 => headers
                    .into_vec()
                    .pop()
                    .ok_or_else(|| ExecutionError::Query("empty header".to_string())),
                datum => Err(ExecutionError::Query(format!(
                    "cannot use {} as http_header",
                    datum.type_name()
                ))),
            },
        }
    }

    fn positional_args(&self, args: &FunctionArguments) -> Result<Vec<Datum>, ExecutionError> {
        match args {
            FunctionArguments::None => Ok(Vec::new()),
            FunctionArguments::List(list) => list
                .args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => self.eval(expr),
                    other => Err(ExecutionError::Unsupported(format!("argument {other}"))),
                })
                .collect(),
            FunctionArguments::Subquery(_) => {
                Err(ExecutionError::Unsupported("subquery arguments".to_string()))
            }
        }
    }

    /// `http_response(body, status, headers)` with positional or named arguments.
    fn http_response(&self, args: &FunctionArguments) -> Result<ResponseParts, ExecutionError> {
        let FunctionArguments::List(list) = args else {
            return Ok(ResponseParts::default());
        };
        let mut slots: [Option<Datum>; 3] = [None, None, None];
        for (position, arg) in list.args.iter().enumerate() {
            let (slot, expr) = match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => (position, expr),
                FunctionArg::Named {
                    name,
                    arg: FunctionArgExpr::Expr(expr),
                    ..
                } => {
                    let slot = match name.value.to_ascii_lowercase().as_str() {
                        "body" => 0,
                        "status" => 1,
                        "headers" => 2,
                        other => {
                            return Err(ExecutionError::Query(format!(
                                "http_response has no parameter {other}"
                            )))
                        }
                    };
                    (slot, expr)
                }
                other => return Err(ExecutionError::Unsupported(format!("argument {other}"))),
            };
            if slot >= slots.len() {
                return Err(ExecutionError::Query("too many arguments to http_response".to_string()));
            }
            slots[slot] = Some(self.eval(expr)?);
        }
        let [body, status, headers] = slots;
        parts_from(status, headers, body)
    }
}

fn literal(value: &Value) -> Result<Datum, ExecutionError> {
    match value {
        Value::Null => Ok(Datum::Null),
        Value::Boolean(b) => Ok(Datum::Bool(*b)),
        Value::Number(raw, _) => parse_number(raw),
        Value::SingleQuotedString(s) | Value::EscapedStringLiteral(s) => Ok(Datum::Text(s.clone())),
        Value::DollarQuotedString(s) => Ok(Datum::Text(s.value.clone())),
        other => Err(ExecutionError::Unsupported(format!("literal {other}"))),
    }
}

fn parse_number(raw: &str) -> Result<Datum, ExecutionError> {
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(Datum::Int(i));
    }
    raw.parse::<f64>()
        .map(Datum::Float)
        .map_err(|_| ExecutionError::Query(format!("invalid number {raw}")))
}

fn cast(datum: Datum, ty: &str, array: bool) -> Result<Datum, ExecutionError> {
    if datum.is_null() {
        return Ok(Datum::Null);
    }
    if array {
        return match (ty, datum) {
            ("http_header", Datum::Headers(headers)) => Ok(Datum::Headers(headers)),
            (ty, datum) => Err(cannot_cast(&datum, &format!("{ty}[]"))),
        };
    }

    match ty {
        "text" | "varchar" | "character varying" | "char" | "character" | "bpchar" | "name"
        | "http_method" => datum
            .to_text()
            .map(Datum::Text)
            .ok_or_else(|| cannot_cast(&Datum::Null, ty)),
        "bytea" => match datum {
            Datum::Bytes(bytes) => Ok(Datum::Bytes(bytes)),
            Datum::Text(text) => decode_bytea(&text).map(Datum::Bytes),
            other => Err(cannot_cast(&other, ty)),
        },
        "json" | "jsonb" => {
            let value = match datum {
                Datum::Json(v) | Datum::Jsonb(v) => v,
                Datum::Text(text) => serde_json::from_str(&text)
                    .map_err(|e| ExecutionError::Query(format!("invalid input syntax for type {ty}: {e}")))?,
                Datum::Int(i) => serde_json::Value::from(i),
                Datum::Bool(b) => serde_json::Value::from(b),
                other => return Err(cannot_cast(&other, ty)),
            };
            Ok(if ty == "json" {
                Datum::Json(value)
            } else {
                Datum::Jsonb(value)
            })
        }
        "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" => match datum {
            Datum::Int(i) => Ok(Datum::Int(i)),
            Datum::Float(f) => Ok(Datum::Int(f.round() as i64)),
            Datum::Text(text) => text
                .trim()
                .parse()
                .map(Datum::Int)
                .map_err(|_| ExecutionError::Query(format!("invalid input syntax for type {ty}: {text:?}"))),
            other => Err(cannot_cast(&other, ty)),
        },
        "bool" | "boolean" => match datum {
            Datum::Bool(b) => Ok(Datum::Bool(b)),
            Datum::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
                "t" | "true" | "yes" | "on" | "1" => Ok(Datum::Bool(true)),
                "f" | "false" | "no" | "off" | "0" => Ok(Datum::Bool(false)),
                _ => Err(ExecutionError::Query(format!("invalid input syntax for type boolean: {text:?}"))),
            },
            other => Err(cannot_cast(&other, ty)),
        },
        "float" | "float4" | "float8" | "real" | "double precision" | "numeric" | "decimal" => {
            match datum {
                Datum::Int(i) => Ok(Datum::Float(i as f64)),
                Datum::Float(f) => Ok(Datum::Float(f)),
                Datum::Text(text) => text
                    .trim()
                    .parse()
                    .map(Datum::Float)
                    .map_err(|_| ExecutionError::Query(format!("invalid input syntax for type {ty}: {text:?}"))),
                other => Err(cannot_cast(&other, ty)),
            }
        }
        other => Err(ExecutionError::Query(format!("type \"{other}\" does not exist"))),
    }
}

fn cannot_cast(datum: &Datum, ty: &str) -> ExecutionError {
    ExecutionError::Query(format!("cannot cast type {} to {ty}", datum.type_name()))
}

/// `\x` hex input, raw bytes otherwise.
fn decode_bytea(text: &str) -> Result<Bytes, ExecutionError> {
    let Some(hex) = text.strip_prefix("\\x") else {
        return Ok(Bytes::copy_from_slice(text.as_bytes()));
    };
    if hex.len() % 2 != 0 {
        return Err(ExecutionError::Query("invalid hexadecimal data: odd number of digits".to_string()));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| match (hex_digit(pair[0]), hex_digit(pair[1])) {
            (Some(high), Some(low)) => Ok(high << 4 | low),
            _ => Err(ExecutionError::Query(format!("invalid hexadecimal digit in {hex:?}"))),
        })
        .collect::<Result<Vec<u8>, _>>()
        .map(Bytes::from)
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}

fn header_from(values: Vec<Datum>) -> Result<HeaderTriple, ExecutionError> {
    let mut values = values.into_iter();
    let name = values.next().and_then(|d| d.to_text());
    let value = values.next().map(|d| d.to_text().unwrap_or_default());
    let append = match values.next() {
        None | Some(Datum::Null) => false,
        Some(Datum::Bool(b)) => b,
        Some(other) => {
            return Err(ExecutionError::Query(format!(
                "header append flag must be boolean, got {}",
                other.type_name()
            )))
        }
    };
    if values.next().is_some() {
        return Err(ExecutionError::Query("http_header takes at most three fields".to_string()));
    }
    match (name, value) {
        (Some(name), Some(value)) if !name.is_empty() => Ok(HeaderTriple {
            name,
            value,
            append,
        }),
        _ => Err(ExecutionError::Query("http_header requires a name and a value".to_string())),
    }
}

fn into_parts(columns: Vec<(Option<String>, Datum)>) -> Result<ResponseParts, ExecutionError> {
    if columns.len() > 3 {
        return Err(ExecutionError::Query(format!(
            "handler returned {} columns, expected at most 3",
            columns.len()
        )));
    }

    let by_alias = !columns.is_empty()
        && columns.iter().all(|(alias, _)| {
            matches!(alias.as_deref(), Some("status") | Some("headers") | Some("body"))
        });

    let mut slots: [Option<Datum>; 3] = [None, None, None];
    for (position, (alias, datum)) in columns.into_iter().enumerate() {
        let slot = if by_alias {
            match alias.as_deref() {
                Some("status") => 0,
                Some("headers") => 1,
                _ => 2,
            }
        } else {
            position
        };
        slots[slot] = Some(datum);
    }
    let [status, headers, body] = slots;
    parts_from(status, headers, body)
}

fn parts_from(
    status: Option<Datum>,
    headers: Option<Datum>,
    body: Option<Datum>,
) -> Result<ResponseParts, ExecutionError> {
    let status = match status {
        None | Some(Datum::Null) => None,
        Some(Datum::Int(code)) => Some(
            i32::try_from(code)
                .map_err(|_| ExecutionError::Query(format!("status {code} out of range")))?,
        ),
        Some(other) => {
            return Err(ExecutionError::Query(format!(
                "status must be an integer, got {}",
                other.type_name()
            )))
        }
    };
    let headers = match headers {
        None | Some(Datum::Null) => None,
        Some(Datum::Headers(headers)) => Some(headers),
        Some(other) => {
            return Err(ExecutionError::Query(format!(
                "headers must be http_header[], got {}",
                other.type_name()
            )))
        }
    };
    Ok(ResponseParts::new(status, headers, body))
}

/// Recognise `SELECT http_response(...)` as the sole projection.
fn response_call(select: &Select) -> Option<&FunctionArguments> {
    match select.projection.as_slice() {
        [SelectItem::UnnamedExpr(Expr::Function(function))]
        | [SelectItem::ExprWithAlias {
            expr: Expr::Function(function),
            ..
        }] => {
            let name = function.name.to_string().to_ascii_lowercase();
            (name.rsplit('.').next() == Some("http_response")).then_some(&function.args)
        }
        _ => None,
    }
}
