//! Statement classification, table extraction and per-table grouping.
//!
//! Only `CREATE`, `ALTER` and `DROP` are accepted. Table names are pulled
//! out with regexes; statements the extractor cannot attribute to a table
//! run after the per-table loop.

use std::fmt;
use std::sync::LazyLock;

use regex_lite::Regex;
use serde::Serialize;

use crate::db::quote_ident;
use crate::error::{AlterguardError, Result};

// Table names may carry a `db.` qualifier, quoted or not. Group 1 is the
// schema, group 2 the table.
static CREATE_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?:`?([^`\s.(;]+)`?\.)?`?([^`\s.(;]+)`?",
    )
    .unwrap()
});

static ALTER_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*ALTER\s+TABLE\s+(?:`?([^`\s.;]+)`?\.)?`?([^`\s.;]+)`?").unwrap()
});

static DROP_TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*DROP\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:`?([^`\s.,;]+)`?\.)?`?([^`\s.,;]+)`?",
    )
    .unwrap()
});

static ALTER_BODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*ALTER\s+TABLE\s+(?:`?[^`\s.;]+`?\.)?`?[^`\s.;]+`?\s+(.+)$").unwrap()
});

/// Leading verb of an accepted statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    Create,
    Alter,
    Drop,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatementKind::Create => write!(f, "CREATE"),
            StatementKind::Alter => write!(f, "ALTER"),
            StatementKind::Drop => write!(f, "DROP"),
        }
    }
}

/// One submitted SQL statement and what was derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    /// Statement text, trimmed, without a trailing `;`.
    pub sql: String,
    /// Leading verb.
    pub kind: StatementKind,
    /// Target table, when the extractor recognised one.
    pub table: Option<String>,
    /// Schema qualifier written in front of the table, if any.
    pub schema: Option<String>,
    /// For `ALTER TABLE`, everything after the table name.
    pub alter_body: Option<String>,
}

impl Statement {
    /// Classify and decompose a raw statement.
    pub fn parse(raw: &str) -> Result<Self> {
        let sql = raw.trim().trim_end_matches(';').trim_end().to_string();
        let kind = classify(&sql)?;
        let (schema, table) = match extract_qualified_table(&sql) {
            Some((schema, table)) => (schema, Some(table)),
            None => (None, None),
        };
        let alter_body = match kind {
            StatementKind::Alter => extract_alter_body(&sql),
            _ => None,
        };

        Ok(Self {
            sql,
            kind,
            table,
            schema,
            alter_body,
        })
    }
}

fn classify(sql: &str) -> Result<StatementKind> {
    let verb = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match verb.as_str() {
        "CREATE" => Ok(StatementKind::Create),
        "ALTER" => Ok(StatementKind::Alter),
        "DROP" => Ok(StatementKind::Drop),
        _ => Err(AlterguardError::UnsupportedStatement {
            statement: sql.to_string(),
        }),
    }
}

/// Table targeted by a `CREATE TABLE`, `ALTER TABLE` or `DROP TABLE`,
/// without any schema qualifier.
pub fn extract_table_name(sql: &str) -> Option<String> {
    extract_qualified_table(sql).map(|(_, table)| table)
}

/// Schema qualifier and table name of a table-level statement.
pub fn extract_qualified_table(sql: &str) -> Option<(Option<String>, String)> {
    let caps = [&*CREATE_TABLE_RE, &*ALTER_TABLE_RE, &*DROP_TABLE_RE]
        .iter()
        .find_map(|re| re.captures(sql))?;
    let table = caps.get(2)?.as_str().trim_matches('`');
    if table.is_empty() {
        return None;
    }
    let schema = caps
        .get(1)
        .map(|m| m.as_str().trim_matches('`').to_string())
        .filter(|s| !s.is_empty());
    Some((schema, table.to_string()))
}

/// Clause list following `ALTER TABLE <name>`.
pub fn extract_alter_body(sql: &str) -> Option<String> {
    ALTER_BODY_RE
        .captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().trim_end_matches(';').trim_end().to_string())
        .filter(|body| !body.is_empty())
}

/// Parse a batch, failing on the first statement that cannot be classified.
pub fn parse_statements<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Statement>> {
    raw.iter().map(|s| Statement::parse(s.as_ref())).collect()
}

/// All pending work against one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableWorkGroup {
    /// Target table.
    pub table: String,
    /// ALTER clause lists, in submission order.
    pub alter_fragments: Vec<String>,
    /// CREATE/DROP statements and ALTERs without a clause list.
    pub other_statements: Vec<Statement>,
}

impl TableWorkGroup {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            alter_fragments: Vec::new(),
            other_statements: Vec::new(),
        }
    }

    /// Fragments joined into one comma-separated clause list.
    pub fn combined_fragments(&self) -> String {
        self.alter_fragments.join(", ")
    }

    /// The single compound `ALTER TABLE` covering every fragment.
    pub fn compound_alter(&self) -> Option<String> {
        if self.alter_fragments.is_empty() {
            return None;
        }
        Some(format!(
            "ALTER TABLE {} {}",
            quote_ident(&self.table),
            self.combined_fragments()
        ))
    }
}

/// Statements split into per-table groups and table-less leftovers.
#[derive(Debug, Clone, Default)]
pub struct GroupedStatements {
    /// Groups in order of each table's first appearance.
    pub groups: Vec<TableWorkGroup>,
    /// Statements with no extractable table name.
    pub unscoped: Vec<Statement>,
}

/// Group statements by table, merging ALTER fragments.
pub fn group_by_table(statements: &[Statement]) -> GroupedStatements {
    let mut grouped = GroupedStatements::default();

    for stmt in statements {
        let Some(table) = stmt.table.as_deref() else {
            grouped.unscoped.push(stmt.clone());
            continue;
        };

        let idx = match grouped.groups.iter().position(|g| g.table == table) {
            Some(idx) => idx,
            None => {
                grouped.groups.push(TableWorkGroup::new(table));
                grouped.groups.len() - 1
            }
        };
        let group = &mut grouped.groups[idx];

        match (stmt.kind, &stmt.alter_body) {
            (StatementKind::Alter, Some(body)) => group.alter_fragments.push(body.clone()),
            _ => group.other_statements.push(stmt.clone()),
        }
    }

    grouped
}

/// How a table's ALTERs get applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Plain `ALTER TABLE` on the connection.
    Direct,
    /// pt-online-schema-change.
    OnlineSchemaChange,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Direct => write!(f, "direct"),
            Strategy::OnlineSchemaChange => write!(f, "pt-osc"),
        }
    }
}

/// Tables at or below the threshold are altered directly.
pub fn choose_strategy(row_count: i64, threshold: i64) -> Strategy {
    if row_count <= threshold {
        Strategy::Direct
    } else {
        Strategy::OnlineSchemaChange
    }
}

/// Split piped input into statements.
///
/// A statement ends at a line whose trimmed text ends with `;`. Lines are
/// joined with single spaces, blank lines are skipped, and trailing text
/// without a terminator is kept as a final statement.
pub fn split_statements(input: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);

        if line.ends_with(';') {
            let stmt = current.trim_end_matches(';').trim();
            if !stmt.is_empty() {
                statements.push(stmt.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }

    statements
}
