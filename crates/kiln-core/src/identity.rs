//! Namespaced field identities inside repeated group instances.
//!
//! A field `name` living in instance `2` of group `people` is addressed as
//! `people-2-name`. Nested groups compose: the nested group `phones` inside
//! `people` instance 0 is `people-0-phones`, and its fields become
//! `people-0-phones-1-number`.
//!
//! Group ids are always known when composing or stripping, so the local id is
//! recovered by removing the exact `{group}-{digits}-` prefix. Local ids may
//! themselves contain the separator.

pub const SEPARATOR: char = '-';

/// Composes the external id of `local_id` inside `group_id` instance `index`.
///
/// Any prefix previously composed for the same group (at any index) is
/// stripped first, so reapplying is idempotent and relabeling to a new index
/// never stacks prefixes.
pub fn namespace(group_id: &str, index: usize, local_id: &str) -> String {
    let local = strip_group_prefix(group_id, local_id);
    format!("{group_id}{SEPARATOR}{index}{SEPARATOR}{local}")
}

/// Returns the authored id of `id` relative to `group_id`.
///
/// Ids that were never namespaced for this group come back unchanged.
pub fn strip_group_prefix<'a>(group_id: &str, id: &'a str) -> &'a str {
    let mut current = id;
    while let Some((_, rest)) = split_prefix(group_id, current) {
        current = rest;
    }
    current
}

/// Splits `id` into `(index, local)` when it carries a `{group_id}-{n}-` prefix.
pub fn split_prefix<'a>(group_id: &str, id: &'a str) -> Option<(usize, &'a str)> {
    let rest = id.strip_prefix(group_id)?.strip_prefix(SEPARATOR)?;
    let digits_end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)?;
    if digits_end == 0 {
        return None;
    }
    let (digits, tail) = rest.split_at(digits_end);
    let local = tail.strip_prefix(SEPARATOR)?;
    if local.is_empty() {
        return None;
    }
    let index = digits.parse::<usize>().ok()?;
    Some((index, local))
}

/// True when an authored id could be mistaken for a namespaced id of `group_id`.
pub fn looks_namespaced(group_id: &str, id: &str) -> bool {
    split_prefix(group_id, id).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composes_group_index_and_local_id() {
        assert_eq!(namespace("g1", 0, "name"), "g1-0-name");
        assert_eq!(namespace("g1", 12, "first-name"), "g1-12-first-name");
    }

    #[test]
    fn reapplying_namespace_is_idempotent() {
        let once = namespace("g1", 3, "age");
        assert_eq!(namespace("g1", 3, &once), once);
    }

    #[test]
    fn relabeling_replaces_the_old_index() {
        assert_eq!(namespace("g1", 1, "g1-4-age"), "g1-1-age");
        assert_eq!(namespace("g1", 0, "g1-0-g1-0-age"), "g1-0-age");
    }

    #[test]
    fn local_ids_may_contain_the_separator() {
        let id = namespace("people", 2, "home-phone");
        assert_eq!(strip_group_prefix("people", &id), "home-phone");
        assert_eq!(split_prefix("people", &id), Some((2, "home-phone")));
    }

    #[test]
    fn other_groups_prefixes_are_left_alone() {
        assert_eq!(strip_group_prefix("g2", "g1-0-name"), "g1-0-name");
        assert_eq!(split_prefix("g1", "g1-x-name"), None);
        assert_eq!(split_prefix("g1", "g1-0-"), None);
    }

    #[test]
    fn nested_groups_compose_transitively() {
        let nested_group = namespace("people", 0, "phones");
        let field = namespace(&nested_group, 1, "number");
        assert_eq!(field, "people-0-phones-1-number");

        assert_eq!(split_prefix(&nested_group, &field), Some((1, "number")));
        assert_eq!(split_prefix("people", "email"), None);
    }
}
