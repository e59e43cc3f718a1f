//! SQL statement classification and bind variable scanning
//!
//! The driver treats SQL text as opaque apart from two things: the leading
//! keyword (to classify the statement) and `:name` markers outside string
//! literals (to find bind variables).

use std::fmt;

/// Statement type determined from the leading keyword
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementType {
    /// Anything else, DDL included
    #[default]
    Unknown,
    /// SELECT query
    Query,
    /// DML: INSERT, UPDATE, DELETE, MERGE
    Dml,
    /// PL/SQL block: BEGIN, DECLARE, CALL
    PlSql,
}

impl StatementType {
    /// Classify SQL text by its first keyword
    pub fn from_sql(sql: &str) -> Self {
        let first_word = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_uppercase();

        match first_word.as_str() {
            "SELECT" | "WITH" => StatementType::Query,
            "INSERT" | "UPDATE" | "DELETE" | "MERGE" => StatementType::Dml,
            "DECLARE" | "BEGIN" | "CALL" => StatementType::PlSql,
            _ => StatementType::Unknown,
        }
    }

    /// Check if this is a query (SELECT)
    pub fn is_query(&self) -> bool {
        *self == StatementType::Query
    }

    /// Check if this is a DML statement
    pub fn is_dml(&self) -> bool {
        *self == StatementType::Dml
    }

    /// Check if this is a PL/SQL block
    pub fn is_plsql(&self) -> bool {
        *self == StatementType::PlSql
    }
}

/// A bind variable reference found in SQL text.
///
/// Pure decimal tokens are positional references into the caller's extra
/// values (1-based); everything else is a name resolved against a variable
/// store or key-value set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindName {
    /// `:1`, `:2`, ... (1-based, `:0` is kept so it can be rejected)
    Positional(usize),
    /// `:name`
    Named(String),
}

impl BindName {
    fn from_token(token: &str) -> Self {
        if token.bytes().all(|b| b.is_ascii_digit()) {
            // Out-of-range digit strings can never match a supplied value.
            BindName::Positional(token.parse().unwrap_or(usize::MAX))
        } else {
            BindName::Named(token.to_string())
        }
    }

    /// Name used when registering the bind with the engine
    pub fn bind_text(&self) -> String {
        self.to_string()
    }

    /// The name, if this is a named reference
    pub fn as_named(&self) -> Option<&str> {
        match self {
            BindName::Named(name) => Some(name),
            BindName::Positional(_) => None,
        }
    }
}

impl fmt::Display for BindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindName::Positional(index) => write!(f, "{}", index),
            BindName::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Base,
    InLiteral,
    InBind,
}

fn is_bind_char(c: char) -> bool {
    c == '_' || c == '$' || c == '#' || c.is_ascii_alphanumeric()
}

/// Scan SQL text for bind variable references.
///
/// Returns one entry per occurrence, in source order, without
/// deduplication. Text inside single-quoted literals is skipped; a doubled
/// quote inside a literal does not leave it. A token immediately followed by
/// `=` is an assignment (`:=` or `name => value` style) and is dropped, as
/// is a bare `:` with no token characters after it.
pub fn scan_bind_variables(sql: &str) -> Vec<BindName> {
    let mut names = Vec::new();
    let mut token = String::new();
    let mut state = ScanState::Base;
    let mut literal_len = 0usize;
    let mut last = '\0';

    let emit = |token: &mut String, names: &mut Vec<BindName>| {
        if !token.is_empty() {
            names.push(BindName::from_token(token));
        }
        token.clear();
    };

    for c in sql.chars() {
        // A character that ends a token is examined again in the base state.
        if state == ScanState::InBind {
            if c == '=' {
                token.clear();
                state = ScanState::Base;
                last = c;
                continue;
            }
            if is_bind_char(c) {
                token.push(c);
                last = c;
                continue;
            }
            emit(&mut token, &mut names);
            state = ScanState::Base;
        }

        if state == ScanState::InLiteral {
            if c == '\'' && (last != '\'' || literal_len == 0) {
                state = ScanState::Base;
            }
            literal_len += 1;
        } else if c == '\'' {
            state = ScanState::InLiteral;
            literal_len = 0;
        } else if c == ':' {
            token.clear();
            state = ScanState::InBind;
        }
        last = c;
    }

    if state == ScanState::InBind {
        emit(&mut token, &mut names);
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(s: &str) -> BindName {
        BindName::Named(s.to_string())
    }

    #[test]
    fn test_statement_type_detection() {
        assert_eq!(StatementType::from_sql("SELECT * FROM dual"), StatementType::Query);
        assert_eq!(StatementType::from_sql("  with x as (select 1 from dual) select * from x"), StatementType::Query);
        assert_eq!(StatementType::from_sql("insert into t values (1)"), StatementType::Dml);
        assert_eq!(StatementType::from_sql("UPDATE t SET x = 1"), StatementType::Dml);
        assert_eq!(StatementType::from_sql("DELETE FROM t"), StatementType::Dml);
        assert_eq!(StatementType::from_sql("CREATE TABLE t (x NUMBER)"), StatementType::Unknown);
        assert_eq!(StatementType::from_sql("BEGIN NULL; END;"), StatementType::PlSql);
        assert_eq!(StatementType::from_sql("DECLARE x NUMBER; BEGIN NULL; END;"), StatementType::PlSql);
        assert_eq!(StatementType::from_sql("explain plan for select 1 from dual"), StatementType::Unknown);
        assert_eq!(StatementType::from_sql(""), StatementType::Unknown);
    }

    #[test]
    fn test_bind_variable_extraction() {
        let names = scan_bind_variables("SELECT * FROM t WHERE x = :x AND y = :y_2");
        assert_eq!(names, vec![named("x"), named("y_2")]);
    }

    #[test]
    fn test_positional_binds() {
        let names = scan_bind_variables("insert into t values (:1, :2, :10)");
        assert_eq!(
            names,
            vec![
                BindName::Positional(1),
                BindName::Positional(2),
                BindName::Positional(10)
            ]
        );
    }

    #[test]
    fn test_duplicates_preserved_in_order() {
        let names = scan_bind_variables("select :a, :b, :a from dual");
        assert_eq!(names, vec![named("a"), named("b"), named("a")]);
    }

    #[test]
    fn test_special_token_characters() {
        let names = scan_bind_variables("select :a$b#c_d from dual");
        assert_eq!(names, vec![named("a$b#c_d")]);
    }

    #[test]
    fn test_token_at_end_of_input() {
        assert_eq!(scan_bind_variables("select * from t where id = :id"), vec![named("id")]);
    }

    #[test]
    fn test_binds_in_literals_skipped() {
        assert!(scan_bind_variables("select ':x' from dual").is_empty());
        assert_eq!(
            scan_bind_variables("select 'a:b', :c from dual"),
            vec![named("c")]
        );
    }

    #[test]
    fn test_escaped_quote_in_literal() {
        assert!(scan_bind_variables("'it''s'").is_empty());
        assert!(scan_bind_variables("select 'it'':s' from dual").is_empty());
        assert_eq!(
            scan_bind_variables("select 'it''s', :name from dual"),
            vec![named("name")]
        );
    }

    #[test]
    fn test_empty_literal_before_terminator() {
        assert!(scan_bind_variables("''''").is_empty());
        assert_eq!(scan_bind_variables("select '''' || :x from dual"), vec![named("x")]);
        assert_eq!(scan_bind_variables("select '' || :x from dual"), vec![named("x")]);
    }

    #[test]
    fn test_assignment_aborts_token() {
        assert!(scan_bind_variables("begin x := 5; end;").is_empty());
        assert_eq!(
            scan_bind_variables("begin :out := f(:arg); end;"),
            vec![named("out"), named("arg")]
        );
        assert!(scan_bind_variables("begin p(:a=1); end;").is_empty());
    }

    #[test]
    fn test_terminator_is_rescanned() {
        // The quote that ends the token opens a literal.
        assert_eq!(scan_bind_variables(":a':b'"), vec![named("a")]);
        // The colon that ends the token starts the next one.
        assert_eq!(scan_bind_variables(":a:b"), vec![named("a"), named("b")]);
    }

    #[test]
    fn test_bind_name_display() {
        assert_eq!(BindName::Positional(3).bind_text(), "3");
        assert_eq!(named("abc").bind_text(), "abc");
        assert_eq!(named("abc").as_named(), Some("abc"));
        assert_eq!(BindName::Positional(0).as_named(), None);
    }
}
