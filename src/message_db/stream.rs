//! Stream naming
//!
//! A stream name is `{category}-{id}`. The category ends at the first `-`, so a
//! category may contain `:` qualifiers (`topic:position`) but never `-`.

/// `{category}-{id}`
pub fn stream_name(category: &str, id: &str) -> String {
    format!("{}-{}", category, id)
}

/// Everything after the first `-`, or `None` for a bare category
pub fn id(stream_name: &str) -> Option<&str> {
    stream_name.split_once('-').map(|(_, id)| id)
}

/// Everything before the first `-`
pub fn category(stream_name: &str) -> &str {
    stream_name
        .split_once('-')
        .map_or(stream_name, |(category, _)| category)
}

pub fn is_category(name: &str) -> bool {
    !name.contains('-')
}
