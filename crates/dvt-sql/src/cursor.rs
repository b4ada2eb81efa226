use crate::lexer::{Keyword, Token, TokenKind, tokenize};

/// Completion region at a cursor position inside (possibly partial) SQL.
///
/// Partial input is the normal case here: the analyzer never fails, it
/// degrades to [CursorContext::Unknown] when the token scan gives nothing
/// better.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorContext {
    StatementStart,
    AfterSelect,
    SelectColumnList,
    /// After FROM; `entity` is set once a table name has been typed.
    AfterFrom { entity: Option<String> },
    /// After JOIN; `entity` is set once a table name has been typed.
    AfterJoin { entity: Option<String> },
    AfterOn,
    /// After WHERE; `condition_started` once any condition tokens exist.
    AfterWhere { condition_started: bool },
    AfterGroupBy,
    /// After ORDER BY; `complete` once an attribute and direction exist.
    AfterOrderBy { complete: bool },
    InString,
    Unknown,
}

/// Classifies the completion region at `cursor` (a byte offset) in `source`.
pub fn cursor_context(source: &str, cursor: usize) -> CursorContext {
    let cursor = cursor.min(source.len());
    let clamped = match (0..=cursor).rev().find(|i| source.is_char_boundary(*i)) {
        Some(boundary) => boundary,
        None => return CursorContext::Unknown,
    };
    let prefix = &source[..clamped];

    if inside_string_literal(prefix) {
        return CursorContext::InString;
    }
    let tokens = match tokenize(prefix) {
        Ok(lexed) => lexed.tokens,
        // the lexer chokes on partial input the string check missed
        Err(_) => return CursorContext::Unknown,
    };
    // drop the trailing EOF marker
    let tokens = &tokens[..tokens.len() - 1];
    if tokens.is_empty() {
        return CursorContext::StatementStart;
    }

    // Walk back to the most recent region-defining keyword
    for (index, token) in tokens.iter().enumerate().rev() {
        let after = &tokens[index + 1..];
        match &token.kind {
            TokenKind::Keyword(Keyword::On) => return CursorContext::AfterOn,
            TokenKind::Keyword(Keyword::Where) => {
                return CursorContext::AfterWhere { condition_started: !after.is_empty() };
            }
            TokenKind::Keyword(Keyword::Join) => {
                return CursorContext::AfterJoin { entity: first_ident(after) };
            }
            TokenKind::Keyword(Keyword::From) => {
                return CursorContext::AfterFrom { entity: first_ident(after) };
            }
            TokenKind::Keyword(Keyword::By) if index > 0 => {
                match &tokens[index - 1].kind {
                    TokenKind::Keyword(Keyword::Group) => return CursorContext::AfterGroupBy,
                    TokenKind::Keyword(Keyword::Order) => {
                        return CursorContext::AfterOrderBy { complete: order_complete(after) };
                    }
                    _ => {}
                }
            }
            TokenKind::Keyword(Keyword::Select) => {
                return if after.is_empty() {
                    CursorContext::AfterSelect
                } else {
                    CursorContext::SelectColumnList
                };
            }
            _ => {}
        }
    }
    CursorContext::Unknown
}

fn first_ident(tokens: &[Token]) -> Option<String> {
    tokens
        .iter()
        .find(|t| t.kind == TokenKind::Ident)
        .map(|t| t.text.clone())
}

/// An ORDER BY item is complete once an attribute has a direction keyword.
fn order_complete(tokens: &[Token]) -> bool {
    matches!(
        tokens.last().map(|t| &t.kind),
        Some(TokenKind::Keyword(Keyword::Asc)) | Some(TokenKind::Keyword(Keyword::Desc))
    )
}

/// Counts unescaped quotes: an odd number means the cursor sits inside a
/// string literal (the `''` escape reads as two quotes, keeping the count
/// even).
fn inside_string_literal(prefix: &str) -> bool {
    prefix.chars().filter(|c| *c == '\'').count() % 2 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context_at_end(source: &str) -> CursorContext {
        cursor_context(source, source.len())
    }

    #[test]
    fn test_statement_start() {
        assert_eq!(context_at_end(""), CursorContext::StatementStart);
        assert_eq!(context_at_end("   "), CursorContext::StatementStart);
    }

    #[test]
    fn test_after_select() {
        assert_eq!(context_at_end("SELECT "), CursorContext::AfterSelect);
        assert_eq!(context_at_end("SELECT name, "), CursorContext::SelectColumnList);
    }

    #[test]
    fn test_after_from_and_join() {
        assert_eq!(context_at_end("SELECT x FROM "), CursorContext::AfterFrom { entity: None });
        assert_eq!(
            context_at_end("SELECT x FROM account"),
            CursorContext::AfterFrom { entity: Some("account".to_string()) }
        );
        assert_eq!(
            context_at_end("SELECT x FROM account a JOIN "),
            CursorContext::AfterJoin { entity: None }
        );
        assert_eq!(
            context_at_end("SELECT x FROM account a INNER JOIN contact"),
            CursorContext::AfterJoin { entity: Some("contact".to_string()) }
        );
    }

    #[test]
    fn test_after_on_and_where() {
        assert_eq!(
            context_at_end("SELECT x FROM a JOIN b ON "),
            CursorContext::AfterOn
        );
        assert_eq!(
            context_at_end("SELECT x FROM account WHERE "),
            CursorContext::AfterWhere { condition_started: false }
        );
        assert_eq!(
            context_at_end("SELECT x FROM account WHERE statecode = "),
            CursorContext::AfterWhere { condition_started: true }
        );
    }

    #[test]
    fn test_group_and_order() {
        assert_eq!(
            context_at_end("SELECT x FROM t GROUP BY "),
            CursorContext::AfterGroupBy
        );
        assert_eq!(
            context_at_end("SELECT x FROM t ORDER BY "),
            CursorContext::AfterOrderBy { complete: false }
        );
        assert_eq!(
            context_at_end("SELECT x FROM t ORDER BY name"),
            CursorContext::AfterOrderBy { complete: false }
        );
        assert_eq!(
            context_at_end("SELECT x FROM t ORDER BY name DESC"),
            CursorContext::AfterOrderBy { complete: true }
        );
    }

    #[test]
    fn test_inside_string() {
        assert_eq!(
            context_at_end("SELECT x FROM t WHERE name = 'Conto"),
            CursorContext::InString
        );
        // '' escapes keep the parity even
        assert_eq!(
            context_at_end("SELECT x FROM t WHERE name = 'it''s' AND "),
            CursorContext::AfterWhere { condition_started: true }
        );
    }

    #[test]
    fn test_cursor_mid_source() {
        let source = "SELECT name FROM account WHERE statecode = 0";
        // cursor right after SELECT
        assert_eq!(cursor_context(source, 7), CursorContext::AfterSelect);
        // cursor at the end of FROM's entity
        assert_eq!(
            cursor_context(source, 24),
            CursorContext::AfterFrom { entity: Some("account".to_string()) }
        );
    }

    #[test]
    fn test_unknown_for_unparseable_prefix() {
        assert_eq!(context_at_end("^^"), CursorContext::Unknown);
    }
}
