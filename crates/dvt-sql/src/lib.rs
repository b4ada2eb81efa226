//! SQL frontend: lexer, recursive-descent parser, cursor-context analyzer
//! and the FetchXML transpiler.
//!
//! The supported surface is the T-SQL subset a migration engineer actually
//! writes against the platform: single-entity SELECTs with joins, filters,
//! aggregates and ordering, plus scripting scaffolding (DECLARE/SET, blocks,
//! TRY/CATCH) that parses into a typed AST.

pub mod ast;
mod cursor;
mod fetch;
mod lexer;
mod parser;

pub use cursor::{CursorContext, cursor_context};
pub use fetch::{TranspileOutput, VirtualColumn, transpile, transpile_sql};
pub use lexer::{Comment, Keyword, LexOutput, Token, TokenKind, tokenize};
pub use parser::{ParsedQuery, ParsedScript, parse, parse_query};
