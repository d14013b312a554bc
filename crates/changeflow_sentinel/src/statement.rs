//! Minimal SQL statement splitting and classification for plan checks.
//!
//! This is not a parser. It splits on top-level `;` while respecting
//! quotes and comments, then classifies each statement by its leading
//! keywords.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    CreateTable,
    AlterTable,
    DropTable,
    CreateIndex,
    DropIndex,
    CreateDatabase,
    Other,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::CreateTable => "CREATE_TABLE",
            StatementKind::AlterTable => "ALTER_TABLE",
            StatementKind::DropTable => "DROP_TABLE",
            StatementKind::CreateIndex => "CREATE_INDEX",
            StatementKind::DropIndex => "DROP_INDEX",
            StatementKind::CreateDatabase => "CREATE_DATABASE",
            StatementKind::Other => "OTHER",
        }
    }

    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }

    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable
                | StatementKind::AlterTable
                | StatementKind::DropTable
                | StatementKind::CreateIndex
                | StatementKind::DropIndex
                | StatementKind::CreateDatabase
        )
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Statement text without the trailing `;`, comments kept.
    pub text: String,
    /// 1-based line the statement starts on.
    pub line: usize,
    pub kind: StatementKind,
    /// Whether a top-level `WHERE` appears outside literals and comments.
    pub has_where: bool,
}

static KIND_PATTERNS: LazyLock<Vec<(Regex, StatementKind)>> = LazyLock::new(|| {
    [
        (r"^(SELECT|WITH|SHOW|EXPLAIN)\b", StatementKind::Select),
        (r"^(INSERT|REPLACE)\b", StatementKind::Insert),
        (r"^UPDATE\b", StatementKind::Update),
        (r"^DELETE\b", StatementKind::Delete),
        (r"^CREATE\s+(TEMPORARY\s+)?TABLE\b", StatementKind::CreateTable),
        (r"^ALTER\s+TABLE\b", StatementKind::AlterTable),
        (r"^(DROP\s+TABLE|TRUNCATE)\b", StatementKind::DropTable),
        (r"^CREATE\s+(UNIQUE\s+)?INDEX\b", StatementKind::CreateIndex),
        (r"^DROP\s+INDEX\b", StatementKind::DropIndex),
        (r"^CREATE\s+(DATABASE|SCHEMA)\b", StatementKind::CreateDatabase),
    ]
    .into_iter()
    .map(|(pattern, kind)| {
        let re = Regex::new(&format!("(?i){}", pattern)).expect("static pattern compiles");
        (re, kind)
    })
    .collect()
});

static WHERE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bWHERE\b").expect("static pattern compiles"));

fn classify(code: &str) -> StatementKind {
    let trimmed = code.trim_start();
    KIND_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(trimmed))
        .map(|(_, kind)| *kind)
        .unwrap_or(StatementKind::Other)
}

/// Splits `sql` into statements. Empty statements are dropped.
pub fn split_statements(sql: &str) -> Vec<Statement> {
    let mut out = Vec::new();
    // `text` keeps the raw source; `code` has literals and comments blanked
    // so keyword matching never sees their contents.
    let mut text = String::new();
    let mut code = String::new();
    let mut line = 1usize;
    let mut start_line: Option<usize> = None;
    let mut chars = sql.chars().peekable();

    let mut flush = |text: &mut String, code: &mut String, start: &mut Option<usize>| {
        let trimmed = text.trim();
        if !code.trim().is_empty() {
            out.push(Statement {
                text: trimmed.to_string(),
                line: start.unwrap_or(1),
                kind: classify(code),
                has_where: WHERE_RE.is_match(code),
            });
        }
        text.clear();
        code.clear();
        *start = None;
    };

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                start_line.get_or_insert(line);
                text.push(c);
                code.push(' ');
                while let Some(n) = chars.next() {
                    text.push(n);
                    if n == '\n' {
                        line += 1;
                    }
                    if n == '\\' && c != '`' {
                        if let Some(escaped) = chars.next() {
                            text.push(escaped);
                        }
                        continue;
                    }
                    if n == c {
                        // A doubled quote is an escaped quote.
                        if chars.peek() == Some(&c) {
                            if let Some(q) = chars.next() {
                                text.push(q);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                text.push(c);
                for n in chars.by_ref() {
                    if n == '\n' {
                        line += 1;
                        text.push(n);
                        break;
                    }
                    text.push(n);
                }
                code.push(' ');
            }
            '/' if chars.peek() == Some(&'*') => {
                text.push(c);
                let mut prev = '\0';
                for n in chars.by_ref() {
                    text.push(n);
                    if n == '\n' {
                        line += 1;
                    }
                    if prev == '*' && n == '/' {
                        break;
                    }
                    prev = n;
                }
                code.push(' ');
            }
            ';' => flush(&mut text, &mut code, &mut start_line),
            _ => {
                if c == '\n' {
                    line += 1;
                } else if !c.is_whitespace() {
                    start_line.get_or_insert(line);
                }
                text.push(c);
                code.push(c);
            }
        }
    }
    flush(&mut text, &mut code, &mut start_line);
    out
}
