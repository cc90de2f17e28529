//! Topic name and filter validation
//!
//! Key rules:
//! - Topic names MUST NOT contain wildcards (+ or #)
//! - Multi-level wildcard (#) must occupy the last level
//! - Single-level wildcard (+) must occupy an entire level

/// Longest topic or filter the transport can carry (two-byte length prefix)
pub const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name (used when publishing)
///
/// Topic names:
/// - Must be at least 1 character
/// - Must not exceed 65535 bytes
/// - Must not contain null character
/// - Must not contain wildcards (+ or #)
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic name cannot be empty");
    }

    if topic.len() > MAX_TOPIC_LEN {
        return Err("topic name exceeds maximum length");
    }

    if topic.contains('\0') {
        return Err("topic name cannot contain null character");
    }

    if topic.contains('+') || topic.contains('#') {
        return Err("topic name cannot contain wildcards");
    }

    Ok(())
}

/// Validate the shape of a topic filter (used when subscribing)
///
/// Same length and null rules as topic names, plus:
/// - `#` must be the entire level and the last level
/// - `+` must be the entire level
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("topic filter cannot be empty");
    }

    if filter.len() > MAX_TOPIC_LEN {
        return Err("topic filter exceeds maximum length");
    }

    if filter.contains('\0') {
        return Err("topic filter cannot contain null character");
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') {
            if level != "#" {
                return Err("multi-level wildcard must occupy entire level");
            }
            if levels.peek().is_some() {
                return Err("multi-level wildcard must be last level");
            }
        }

        if level.contains('+') && level != "+" {
            return Err("single-level wildcard must occupy entire level");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test").is_ok());
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("/test/topic").is_ok());
        assert!(validate_topic_name("test/topic/").is_ok());

        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test+topic").is_err());
        assert!(validate_topic_name("test#topic").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("#").is_err());
        assert!(validate_topic_name("bad\0topic").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test").is_ok());
        assert!(validate_topic_filter("+").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("+/+/+").is_ok());
        assert!(validate_topic_filter("a//b").is_ok());

        assert_eq!(
            validate_topic_filter("test/#/more"),
            Err("multi-level wildcard must be last level")
        );
        assert_eq!(
            validate_topic_filter("test#"),
            Err("multi-level wildcard must occupy entire level")
        );
        assert_eq!(
            validate_topic_filter("+test"),
            Err("single-level wildcard must occupy entire level")
        );
        assert!(validate_topic_filter("").is_err());
    }

    #[test]
    fn test_topic_length_limit() {
        let long = "a".repeat(MAX_TOPIC_LEN + 1);
        assert!(validate_topic_name(&long).is_err());
        assert!(validate_topic_filter(&long).is_err());
        assert!(validate_topic_name(&long[..MAX_TOPIC_LEN]).is_ok());
    }
}
