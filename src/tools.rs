//! Small helpers shared by the backup and restore paths.

use anyhow::{bail, Error};
use serde_json::Value;

pub fn required_string_param<'a>(param: &'a Value, name: &str) -> Result<&'a str, Error> {
    match param[name].as_str() {
        Some(s) => Ok(s),
        None => bail!("missing parameter '{}'", name),
    }
}
