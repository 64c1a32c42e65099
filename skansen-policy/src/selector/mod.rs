//! ## skansen-policy::selector
//! **Structured label predicates over named address sets**
//!
//! Grammar (`&&` binds tighter than `||`):
//!
//! ```text
//! expr       := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | primary
//! primary    := "(" expr ")" | "all()" | "has(" key ")" | comparison
//! comparison := key "==" value | key "!=" value
//!             | key "in" set  | key "not in" set
//! value      := '...' | "..."
//! set        := "{" [ value ( "," value )* ] "}"
//! ```

mod ast;
mod eval;
mod parser;

pub use ast::Selector;
pub use parser::{parse_selector, SelectorError};
