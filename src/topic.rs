//! Topic names, filters and `$share/{group}/{filter}` shared subscriptions
//!
//! Wildcards are only legal in filters: `#` as the whole last level, `+` as
//! a whole level anywhere.

/// Build the shared-subscription filter for a group
pub fn shared_filter(group: &str, base: &str) -> String {
    format!("$share/{}/{}", group, base)
}

/// Split `$share/{group}/{filter}` into its group and inner filter
pub fn parse_shared_subscription(filter: &str) -> Option<(&str, &str)> {
    let rest = filter.strip_prefix("$share/")?;
    let (group, actual_filter) = rest.split_once('/')?;
    if group.is_empty() || actual_filter.is_empty() {
        return None;
    }
    Some((group, actual_filter))
}

/// Topic a PUBLISH may carry
pub fn validate_topic_name(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("empty topic name");
    }
    if topic.len() > 65535 {
        return Err("topic name longer than 65535 bytes");
    }
    if topic.contains('\0') {
        return Err("topic name contains NUL");
    }
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed in a topic name");
    }
    Ok(())
}

/// Validate a shared subscription group name
pub fn validate_group_name(group: &str) -> Result<(), &'static str> {
    if group.is_empty() {
        return Err("empty share group name");
    }
    if group.contains(['/', '+', '#']) {
        return Err("share group name contains '/', '+' or '#'");
    }
    Ok(())
}

/// Filter a SUBSCRIBE may carry, shared or not
pub fn validate_topic_filter(filter: &str) -> Result<(), &'static str> {
    if filter.is_empty() {
        return Err("empty topic filter");
    }
    if filter.contains('\0') {
        return Err("topic filter contains NUL");
    }

    let actual_filter = if filter.starts_with("$share/") {
        let (group, actual) =
            parse_shared_subscription(filter).ok_or("invalid shared subscription format")?;
        validate_group_name(group)?;
        actual
    } else {
        filter
    };

    let mut levels = actual_filter.split('/').peekable();
    while let Some(level) = levels.next() {
        let last = levels.peek().is_none();
        if level.contains('#') && (level != "#" || !last) {
            return Err("'#' must be the whole last level");
        }
        if level.contains('+') && level != "+" {
            return Err("'+' must be a whole level");
        }
    }

    Ok(())
}

/// Whether `filter` selects `topic`.
///
/// `$`-topics don't match filters starting with + or #
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for filter_level in filter.split('/') {
        if filter_level == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(_) if filter_level == "+" => {}
            Some(level) if level == filter_level => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_filter_roundtrip() {
        let filter = shared_filter("group-0", "verify/inflight");
        assert_eq!(filter, "$share/group-0/verify/inflight");
        assert_eq!(
            parse_shared_subscription(&filter),
            Some(("group-0", "verify/inflight"))
        );
        assert_eq!(parse_shared_subscription("verify/inflight"), None);
        assert_eq!(parse_shared_subscription("$share/g"), None);
        assert_eq!(parse_shared_subscription("$share//t"), None);
    }

    #[test]
    fn test_validate_topic_name() {
        assert!(validate_topic_name("test/topic").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("test/+/topic").is_err());
        assert!(validate_topic_name("test/#").is_err());
    }

    #[test]
    fn test_validate_topic_filter() {
        assert!(validate_topic_filter("test/+").is_ok());
        assert!(validate_topic_filter("test/#").is_ok());
        assert!(validate_topic_filter("$share/g/test/#").is_ok());
        assert!(validate_topic_filter("test/#/more").is_err());
        assert!(validate_topic_filter("test/a+").is_err());
        assert!(validate_topic_filter("$share/g+/t").is_err());
        assert!(validate_topic_filter("$share/g").is_err());
    }

    #[test]
    fn test_validate_group_name() {
        assert!(validate_group_name("group-1").is_ok());
        assert!(validate_group_name("").is_err());
        assert!(validate_group_name("a/b").is_err());
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches_filter("a/b/c", "a/b/c"));
        assert!(topic_matches_filter("a/b/c", "a/+/c"));
        assert!(topic_matches_filter("a/b/c", "a/#"));
        assert!(topic_matches_filter("a", "a/#"));
        assert!(!topic_matches_filter("a/b", "a/b/c"));
        assert!(!topic_matches_filter("a/b/c", "a/b"));
        assert!(!topic_matches_filter("$SYS/x", "#"));
        assert!(!topic_matches_filter("$SYS/x", "+/x"));
    }
}
