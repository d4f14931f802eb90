//! Leaf strategies for the three-way merge.

/// Picks the merged value of a single field from its three versions.
///
/// `base` is the last synced remote value, `local` the on-device value and
/// `remote` the latest server value.
pub trait DiffFinder<T>: Send + Sync {
    fn compare(&self, base: Option<&T>, local: Option<&T>, remote: Option<&T>) -> Option<T>;
}

/// Treats the field as one opaque value.
///
/// A remote change wins, then a local change, then the unchanged base.
/// A missing value never counts as a change, so one side clearing a field
/// can not wipe out the other side's edit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScalarDiffFinder;

impl<T: Clone + PartialEq> DiffFinder<T> for ScalarDiffFinder {
    fn compare(&self, base: Option<&T>, local: Option<&T>, remote: Option<&T>) -> Option<T> {
        changed(remote, base)
            .or_else(|| changed(local, base))
            .or(base)
            .cloned()
    }
}

/// `value` when it is present and differs from `base`.
fn changed<'a, T: PartialEq>(value: Option<&'a T>, base: Option<&T>) -> Option<&'a T> {
    value.filter(|v| Some(*v) != base)
}

/// Merges lists as sets of additions and removals against the base.
///
/// Local actions are applied first, then the remote actions that local did
/// not already perform. A missing list is treated as empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListDiffFinder;

#[derive(Debug, Clone, PartialEq)]
enum DiffItem<T> {
    Add(T),
    Remove(T),
}

impl<T: Clone + PartialEq + Send + Sync> DiffFinder<Vec<T>> for ListDiffFinder {
    fn compare(
        &self,
        base: Option<&Vec<T>>,
        local: Option<&Vec<T>>,
        remote: Option<&Vec<T>>,
    ) -> Option<Vec<T>> {
        let empty = Vec::new();
        let base = base.unwrap_or(&empty);
        let local = local.unwrap_or(&empty);
        let remote = remote.unwrap_or(&empty);

        let base_to_local = calculate_diff(base, local);
        let mut base_to_remote = calculate_diff(base, remote);

        let mut actions = Vec::with_capacity(base_to_local.len() + base_to_remote.len());
        for item in base_to_local {
            remove_first(&mut base_to_remote, &item);
            actions.push(item);
        }
        actions.extend(base_to_remote);

        let mut out = base.clone();
        for action in actions {
            match action {
                DiffItem::Add(value) => out.push(value),
                DiffItem::Remove(value) => remove_first(&mut out, &value),
            }
        }
        Some(out)
    }
}

fn calculate_diff<T: Clone + PartialEq>(old: &[T], new: &[T]) -> Vec<DiffItem<T>> {
    let removed = old
        .iter()
        .filter(|item| !new.contains(item))
        .cloned()
        .map(DiffItem::Remove);
    let added = new
        .iter()
        .filter(|item| !old.contains(item))
        .cloned()
        .map(DiffItem::Add);
    removed.chain(added).collect()
}

fn remove_first<T: PartialEq>(items: &mut Vec<T>, value: &T) {
    if let Some(index) = items.iter().position(|item| item == value) {
        items.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_scalar_remote_change_wins() {
        let merged = ScalarDiffFinder.compare(Some(&s("A")), Some(&s("B")), Some(&s("C")));
        assert_eq!(merged, Some(s("C")));
    }

    #[test]
    fn test_scalar_local_change_kept_when_remote_unchanged() {
        let merged = ScalarDiffFinder.compare(Some(&s("A")), Some(&s("B")), Some(&s("A")));
        assert_eq!(merged, Some(s("B")));
    }

    #[test]
    fn test_scalar_nobody_changed() {
        let merged = ScalarDiffFinder.compare(Some(&1), Some(&1), Some(&1));
        assert_eq!(merged, Some(1));
    }

    #[test]
    fn test_scalar_missing_value_is_not_a_change() {
        let merged = ScalarDiffFinder.compare(Some(&s("")), Some(&s("Pancake")), None);
        assert_eq!(merged, Some(s("Pancake")));

        let merged: Option<i32> = ScalarDiffFinder.compare(None, Some(&2), None);
        assert_eq!(merged, Some(2));
    }

    #[test]
    fn test_list_union_of_additions() {
        let merged = ListDiffFinder.compare(Some(&list(&[])), Some(&list(&["Sugar"])), Some(&list(&["Flour"])));
        assert_eq!(merged, Some(list(&["Sugar", "Flour"])));
    }

    #[test]
    fn test_list_same_addition_not_duplicated() {
        let merged = ListDiffFinder.compare(Some(&list(&["a"])), Some(&list(&["a", "b"])), Some(&list(&["a", "b"])));
        assert_eq!(merged, Some(list(&["a", "b"])));
    }

    #[test]
    fn test_list_removals_from_both_sides() {
        let merged = ListDiffFinder.compare(
            Some(&list(&["a", "b", "c"])),
            Some(&list(&["a", "c", "d"])),
            Some(&list(&["b", "c"])),
        );
        assert_eq!(merged, Some(list(&["c", "d"])));
    }

    #[test]
    fn test_list_missing_is_empty() {
        let merged = ListDiffFinder.compare(None, Some(&list(&["x"])), None);
        assert_eq!(merged, Some(list(&["x"])));
    }
}
