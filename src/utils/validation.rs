use crate::utils::error::{Result, WkeError};
use std::collections::HashSet;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(WkeError::invalid(format!(
            "`{}` must be at least {}, but was {}",
            field_name, min_value, value
        )));
    }
    Ok(())
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(WkeError::invalid(format!(
            "`{}` cannot be empty or whitespace-only",
            field_name
        )));
    }
    Ok(())
}

/// Returns the first name that appears more than once.
pub fn find_duplicate<'a, I>(names: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    names.into_iter().find(|name| !seen.insert(*name))
}
