//! Parser for the statement shapes the standard dialects render.

use regex::Regex;
use sqlwrite_core::{Error, QueryErrorKind};
use std::sync::OnceLock;

const IDENT: &str = r#"(?:"(?:[^"]|"")+"|`(?:[^`]|``)+`|[A-Za-z_][A-Za-z0-9_]*)"#;
const PLACEHOLDER: &str = r"(?:\$\d+|\?\d*)";

/// A WHERE conjunct: `column = param` or `column IS NULL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Condition {
    pub column: String,
    /// Parameter index, or `None` for `IS NULL`
    pub param: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Statement {
    Insert {
        table: String,
        columns: Vec<String>,
        params: Vec<usize>,
    },
    Update {
        table: String,
        assignments: Vec<(String, usize)>,
        filter: Vec<Condition>,
    },
    Delete {
        table: String,
        filter: Vec<Condition>,
    },
    Select {
        columns: Vec<String>,
        table: String,
        filter: Vec<Condition>,
    },
}

impl Statement {
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. }
            | Statement::Select { table, .. } => table,
        }
    }

    /// Number of parameters the statement binds.
    pub fn param_count(&self) -> usize {
        let highest = match self {
            Statement::Insert { params, .. } => params.iter().max().copied(),
            Statement::Update {
                assignments,
                filter,
                ..
            } => assignments
                .iter()
                .map(|(_, p)| *p)
                .chain(filter.iter().filter_map(|c| c.param))
                .max(),
            Statement::Delete { filter, .. } | Statement::Select { filter, .. } => {
                filter.iter().filter_map(|c| c.param).max()
            }
        };
        highest.map_or(0, |p| p + 1)
    }
}

struct Grammar {
    insert: Regex,
    insert_default: Regex,
    update: Regex,
    delete: Regex,
    select: Regex,
    ident: Regex,
    placeholder: Regex,
    assignment: Regex,
    condition: Regex,
}

impl Grammar {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            insert: Regex::new(&format!(
                r"(?is)^INSERT\s+INTO\s+({IDENT})\s*\((.*)\)\s*VALUES\s*\((.*)\)\s*;?\s*$"
            ))?,
            insert_default: Regex::new(&format!(
                r"(?is)^INSERT\s+INTO\s+({IDENT})\s*(?:DEFAULT\s+VALUES|\(\s*\)\s*VALUES\s*\(\s*\))\s*;?\s*$"
            ))?,
            update: Regex::new(&format!(
                r"(?is)^UPDATE\s+({IDENT})\s+SET\s+(.+?)(?:\s+WHERE\s+(.+?))?\s*;?\s*$"
            ))?,
            delete: Regex::new(&format!(
                r"(?is)^DELETE\s+FROM\s+({IDENT})(?:\s+WHERE\s+(.+?))?\s*;?\s*$"
            ))?,
            select: Regex::new(&format!(
                r"(?is)^SELECT\s+(.+?)\s+FROM\s+({IDENT})(?:\s+WHERE\s+(.+?))?\s*;?\s*$"
            ))?,
            ident: Regex::new(IDENT)?,
            placeholder: Regex::new(PLACEHOLDER)?,
            assignment: Regex::new(&format!(r"^\s*({IDENT})\s*=\s*({PLACEHOLDER})\s*$"))?,
            condition: Regex::new(&format!(
                r"(?i)^\s*({IDENT})\s*(?:=\s*({PLACEHOLDER})|IS\s+NULL)\s*$"
            ))?,
        })
    }
}

fn grammar() -> Result<&'static Grammar, Error> {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    if let Some(grammar) = GRAMMAR.get() {
        return Ok(grammar);
    }
    let compiled = Grammar::compile().map_err(|e| {
        Error::query(QueryErrorKind::Syntax, "42000", format!("statement grammar: {e}"))
    })?;
    Ok(GRAMMAR.get_or_init(|| compiled))
}

fn syntax(sql: &str, message: &str) -> Error {
    Error::query(QueryErrorKind::Syntax, "42601", format!("{message}: {sql}")).with_sql(sql)
}

fn unquote(ident: &str) -> String {
    let bytes = ident.as_bytes();
    match bytes.first() {
        Some(b'"') if ident.len() >= 2 => ident[1..ident.len() - 1].replace("\"\"", "\""),
        Some(b'`') if ident.len() >= 2 => ident[1..ident.len() - 1].replace("``", "`"),
        _ => ident.to_string(),
    }
}

/// Numbers placeholders in order of appearance; `$n` and `?n` are explicit.
#[derive(Default)]
struct Placeholders {
    next: usize,
}

impl Placeholders {
    fn resolve(&mut self, token: &str) -> usize {
        let explicit = token
            .strip_prefix('$')
            .or_else(|| token.strip_prefix('?'))
            .and_then(|n| n.parse::<usize>().ok())
            .filter(|n| *n > 0);
        let index = match explicit {
            Some(n) => n - 1,
            None => self.next,
        };
        self.next = index + 1;
        index
    }
}

fn split_and(clause: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let upper = clause.to_ascii_uppercase();
    let upper = upper.as_bytes();
    let mut start = 0;
    let mut in_quote: Option<u8> = None;
    let bytes = clause.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'`' => in_quote = Some(b),
            None if upper[i..].starts_with(b" AND ") => {
                parts.push(&clause[start..i]);
                i += 5;
                start = i;
                continue;
            }
            None => {}
        }
        i += 1;
    }
    parts.push(&clause[start..]);
    parts
}

fn split_commas(list: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote: Option<u8> = None;
    for (i, b) in list.bytes().enumerate() {
        match in_quote {
            Some(q) if b == q => in_quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'`' => in_quote = Some(b),
            None if b == b',' => {
                parts.push(&list[start..i]);
                start = i + 1;
            }
            None => {}
        }
    }
    parts.push(&list[start..]);
    parts
}

fn parse_filter(
    g: &Grammar,
    sql: &str,
    clause: Option<&str>,
    placeholders: &mut Placeholders,
) -> Result<Vec<Condition>, Error> {
    let Some(clause) = clause else {
        return Ok(Vec::new());
    };
    split_and(clause)
        .into_iter()
        .map(|part| {
            let caps = g
                .condition
                .captures(part)
                .ok_or_else(|| syntax(sql, "unsupported condition"))?;
            Ok(Condition {
                column: unquote(&caps[1]),
                param: caps.get(2).map(|m| placeholders.resolve(m.as_str())),
            })
        })
        .collect()
}

/// Parse one statement.
pub(crate) fn parse(sql: &str) -> Result<Statement, Error> {
    let g = grammar()?;
    let mut placeholders = Placeholders::default();

    if let Some(caps) = g.insert_default.captures(sql) {
        return Ok(Statement::Insert {
            table: unquote(&caps[1]),
            columns: Vec::new(),
            params: Vec::new(),
        });
    }
    if let Some(caps) = g.insert.captures(sql) {
        let columns: Vec<String> = g
            .ident
            .find_iter(&caps[2])
            .map(|m| unquote(m.as_str()))
            .collect();
        let params: Vec<usize> = g
            .placeholder
            .find_iter(&caps[3])
            .map(|m| placeholders.resolve(m.as_str()))
            .collect();
        if columns.len() != params.len() {
            return Err(syntax(sql, "column and value counts differ"));
        }
        return Ok(Statement::Insert {
            table: unquote(&caps[1]),
            columns,
            params,
        });
    }
    if let Some(caps) = g.update.captures(sql) {
        let assignments = split_commas(&caps[2])
            .into_iter()
            .map(|part| {
                let a = g
                    .assignment
                    .captures(part)
                    .ok_or_else(|| syntax(sql, "unsupported assignment"))?;
                Ok((unquote(&a[1]), placeholders.resolve(&a[2])))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let filter = parse_filter(g, sql, caps.get(3).map(|m| m.as_str()), &mut placeholders)?;
        return Ok(Statement::Update {
            table: unquote(&caps[1]),
            assignments,
            filter,
        });
    }
    if let Some(caps) = g.delete.captures(sql) {
        let filter = parse_filter(g, sql, caps.get(2).map(|m| m.as_str()), &mut placeholders)?;
        return Ok(Statement::Delete {
            table: unquote(&caps[1]),
            filter,
        });
    }
    if let Some(caps) = g.select.captures(sql) {
        let columns = split_commas(&caps[1])
            .into_iter()
            .map(|c| unquote(c.trim()))
            .collect();
        let filter = parse_filter(g, sql, caps.get(3).map(|m| m.as_str()), &mut placeholders)?;
        return Ok(Statement::Select {
            columns,
            table: unquote(&caps[2]),
            filter,
        });
    }
    Err(syntax(sql, "unsupported statement"))
}
