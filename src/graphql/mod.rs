//! GraphQL request understanding: body parsing, value equality and rule
//! selection.

pub mod equality;
pub mod matcher;
pub mod parser;

pub use equality::deep_equal;
pub use matcher::{candidates, endpoint_matches, select_rule, Specificity};
pub use parser::{parse, ParseMode, ParseOutcome, ParsedRequest};
