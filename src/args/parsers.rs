use std::time::Duration;

use crate::config::parse_duration_value;
use crate::error::ValidationError;

pub(super) fn parse_duration_arg(s: &str) -> Result<Duration, ValidationError> {
    parse_duration_value(s)
}
