use once_cell::sync::Lazy;
use regex::Regex;

/// Number of log lines kept from each stream of the executor container.
pub const LOG_LINES: usize = 2000;

pub const DEFAULT_USER_ERROR: &str = "No errors were reported in the logs.";

static LOG_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?m)^(?P<timestamp>([\d]+)-(0[1-9]|1[012])-(0[1-9]|[12][\d]|3[01])[Tt]([01][\d]|2[0-3]):([0-5][\d]):([0-5][\d]|60)(\.[\d]+)?(([Zz])|([\+|\-]([01][\d]|2[0-3]):[0-5][\d])))?(?P<error_message>.*)$",
    )
    .expect("log line pattern is valid")
});

/// Picks the message shown to a submitter from the executor's stderr: the
/// last non-empty line, with any leading RFC 3339 timestamp removed.
pub fn user_error(stderr: &str) -> String {
    LOG_LINE
        .captures_iter(stderr)
        .filter_map(|caps| caps.name("error_message"))
        .map(|m| m.as_str().trim())
        .filter(|message| !message.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_USER_ERROR.to_string())
}
