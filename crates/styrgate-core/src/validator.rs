//! Structural SQL validation.
//!
//! Accepts only bounded SELECT statements against a closed set of
//! known production tables. Built on the sqlparser tokenizer so that
//! keyword and table checks operate on whole tokens: a keyword inside
//! a comment, a string literal, or an identifier such as `CREATED_AT`
//! does not trigger a rejection.

use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use thiserror::Error;

/// Tables that may be queried through the gateway. This is a closed
/// set: extending it requires a code change, not a runtime rule.
pub const ALLOWED_TABLES: [&str; 11] = [
    "DCPO.KHKNDHUR", // Customers
    "DCPO.OHKORDHR", // Orders - header
    "DCPO.ORKORDRR", // Orders - rows
    "DCPO.AHARTHUR", // Articles - main
    "EGU.AYARINFR",  // Articles - additional info
    "DCPO.LHLEVHUR", // Suppliers
    "DCPO.IHIORDHR", // Purchase orders - header
    "DCPO.IRIORDRR", // Purchase orders - rows
    "DCPO.KRKFAKTR", // Invoices
    "DCPO.KIINBETR", // Incoming payments
    "EGU.WSOUTSAV",  // Sales statistics
];

pub const FORBIDDEN_KEYWORDS: [&str; 13] = [
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "GRANT", "REVOKE", "TRUNCATE", "CREATE",
    "EXEC", "EXECUTE", "DECLARE", "CURSOR",
];

/// Why a statement was refused. Validation rejections are never
/// retried automatically; the caller must fix the query.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("only SELECT statements are allowed")]
    NotSelect,
    #[error("forbidden keyword detected: {0}")]
    ForbiddenKeyword(String),
    #[error("statement must include a FROM clause")]
    MissingFrom,
    #[error("table not allowed: {0}")]
    TableNotAllowed(String),
    #[error("statement could not be tokenized: {0}")]
    Unparseable(String),
}

/// A statement that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// The statement to execute, with a row limit appended if the
    /// original had none.
    pub sql: String,
    /// Schema-qualified tables referenced by FROM/JOIN, uppercased.
    pub tables: Vec<String>,
    /// Whether a `FETCH FIRST .. ROWS ONLY` clause was injected.
    pub limit_injected: bool,
}

#[derive(Debug, Clone)]
pub struct QueryValidator {
    allowed: HashSet<String>,
}

impl Default for QueryValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryValidator {
    pub fn new() -> Self {
        Self {
            allowed: ALLOWED_TABLES.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Validate a statement, short-circuiting on the first failure.
    ///
    /// The checks run in a fixed order: SELECT-only, forbidden
    /// keywords, FROM present, allow-listed tables, row limit. Only
    /// the last check rewrites the statement; everything else is a
    /// pure accept/reject decision.
    pub fn validate(&self, sql: &str, max_rows: usize) -> Result<NormalizedQuery, Rejection> {
        let tokens = tokenize(sql)?;

        let first = tokens
            .iter()
            .find(|t| !matches!(t, Token::Whitespace(_)))
            .ok_or(Rejection::NotSelect)?;
        match first {
            Token::Word(w) if w.keyword == Keyword::SELECT => {}
            _ => return Err(Rejection::NotSelect),
        }

        for token in &tokens {
            if let Token::Word(w) = token {
                if w.quote_style.is_none() {
                    let upper = w.value.to_uppercase();
                    if FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                        return Err(Rejection::ForbiddenKeyword(upper));
                    }
                }
            }
        }

        let has_from = tokens
            .iter()
            .any(|t| matches!(t, Token::Word(w) if w.keyword == Keyword::FROM));
        if !has_from {
            return Err(Rejection::MissingFrom);
        }

        let tables = extract_tables(&tokens);
        for table in &tables {
            if !self.allowed.contains(table) {
                return Err(Rejection::TableNotAllowed(table.clone()));
            }
        }

        let has_limit = tokens.iter().any(
            |t| matches!(t, Token::Word(w) if w.keyword == Keyword::FETCH || w.keyword == Keyword::LIMIT),
        );
        let mut out = sql.trim().trim_end_matches(';').trim_end().to_string();
        let limit_injected = !has_limit;
        if limit_injected {
            out = format!("{out} FETCH FIRST {max_rows} ROWS ONLY");
        }

        Ok(NormalizedQuery {
            sql: out,
            tables,
            limit_injected,
        })
    }
}

fn tokenize(sql: &str) -> Result<Vec<Token>, Rejection> {
    Tokenizer::new(&GenericDialect {}, sql)
        .tokenize()
        .map_err(|e| Rejection::Unparseable(e.to_string()))
}

/// Keywords that end a FROM list.
fn ends_from_list(keyword: Keyword) -> bool {
    matches!(
        keyword,
        Keyword::WHERE
            | Keyword::GROUP
            | Keyword::ORDER
            | Keyword::HAVING
            | Keyword::FETCH
            | Keyword::LIMIT
            | Keyword::ON
            | Keyword::JOIN
            | Keyword::LEFT
            | Keyword::RIGHT
            | Keyword::INNER
            | Keyword::OUTER
            | Keyword::FULL
            | Keyword::CROSS
            | Keyword::UNION
    )
}

/// Extract schema-qualified FROM/JOIN targets, including every member
/// of a comma-separated FROM list.
///
/// A bare identifier after FROM/JOIN is treated as a subquery alias
/// and never checked against the allow-list; a schema-qualified name
/// is definitive.
fn extract_tables(tokens: &[Token]) -> Vec<String> {
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    let mut tables = Vec::new();
    let mut i = 0;
    while i < significant.len() {
        let is_source_keyword = matches!(
            significant[i],
            Token::Word(w) if w.keyword == Keyword::FROM || w.keyword == Keyword::JOIN
        );
        if !is_source_keyword {
            i += 1;
            continue;
        }

        // One iteration per comma-separated list member.
        let mut j = i + 1;
        'items: loop {
            let mut parts = Vec::new();
            while j < significant.len() {
                match significant[j] {
                    Token::Word(w) => {
                        parts.push(w.value.to_uppercase());
                        if j + 1 < significant.len() && matches!(significant[j + 1], Token::Period)
                        {
                            j += 2;
                        } else {
                            j += 1;
                            break;
                        }
                    }
                    _ => break,
                }
            }

            if parts.len() >= 2 {
                let name = parts.join(".");
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }

            // Skip an optional alias, then continue past a comma to
            // the next list member; anything else ends the list.
            loop {
                match significant.get(j) {
                    Some(Token::Comma) => {
                        j += 1;
                        continue 'items;
                    }
                    Some(Token::Word(w)) if ends_from_list(w.keyword) => break 'items,
                    Some(Token::Word(_)) => j += 1,
                    _ => break 'items,
                }
            }
        }
        i = j.max(i + 1);
    }
    tables
}

/// Whether the statement projects a `*` wildcard. Enforcement treats
/// such a projection as referencing every column of its tables.
///
/// Only a `*` in projection position counts: directly after SELECT
/// (or DISTINCT/ALL), after a comma in the select list, or after a
/// period (`t.*`). `COUNT(*)` and arithmetic like `ORKVB * ORPRS`
/// project no columns and are not wildcards.
pub(crate) fn has_wildcard(sql: &str) -> bool {
    let Ok(tokens) = tokenize(sql) else {
        return false;
    };
    let significant: Vec<&Token> = tokens
        .iter()
        .filter(|t| !matches!(t, Token::Whitespace(_)))
        .collect();

    significant.windows(2).any(|pair| {
        matches!(pair[1], Token::Mul)
            && match pair[0] {
                Token::Comma | Token::Period => true,
                Token::Word(w) => matches!(
                    w.keyword,
                    Keyword::SELECT | Keyword::DISTINCT | Keyword::ALL
                ),
                _ => false,
            }
    })
}

/// All unquoted identifier tokens of a statement, uppercased. Used by
/// enforcement to detect blocked-column references.
pub(crate) fn identifier_tokens(sql: &str) -> HashSet<String> {
    match tokenize(sql) {
        Ok(tokens) => tokens
            .iter()
            .filter_map(|t| match t {
                Token::Word(w) => Some(w.value.to_uppercase()),
                _ => None,
            })
            .collect(),
        Err(_) => HashSet::new(),
    }
}
