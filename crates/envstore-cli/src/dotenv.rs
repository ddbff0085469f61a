//! `.env` file parsing for `create --from-file`.

use std::io::Read;

use anyhow::{Context, Result};
use envstore_core::Variable;

/// Parse `.env` content into variables, in file order.
///
/// Parsing follows `dotenvy`: comments (full-line and after an unquoted
/// value), `export` prefixes, single and double quotes, escape sequences in
/// double quotes and multi-line quoted values. Keys are passed through
/// untouched so the repository can report invalid ones.
///
/// # Errors
///
/// Returns the first line that cannot be parsed, such as a line without `=`
/// or an unterminated quote. Nothing from the file is returned in that case.
pub fn parse_dotenv(reader: impl Read) -> Result<Vec<Variable>> {
    dotenvy::from_read_iter(reader)
        .map(|item| {
            let (key, value) = item.context("malformed .env line")?;
            Ok(Variable::new(key, value))
        })
        .collect()
}
