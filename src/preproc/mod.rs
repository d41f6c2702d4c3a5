//! Translation phases 1 through 4: physical lines are folded and split
//! into pp-tokens, directives are executed and macro invocations are
//! expanded.  The result is a token stream that re-emits as compilable
//! text with the original layout.

pub(crate) mod ast;
pub(crate) mod constexpr;
pub(crate) mod lexer;
pub(crate) mod macros;
pub(crate) mod output;
pub(crate) mod preprocessor;
pub(crate) mod subst;
