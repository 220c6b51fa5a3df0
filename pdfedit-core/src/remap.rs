use tracing::debug;

use crate::PageMap;

/// Old page number → new page number for one structural mutation.
///
/// `targets[old - 1]` holds the new page number, or `None` when the page was
/// removed. Built from page counts and indices only, so it can be computed
/// before the structural model is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageIndexRemap {
    targets: Vec<Option<usize>>,
    new_count: usize,
}

impl PageIndexRemap {
    pub fn identity(page_count: usize) -> Self {
        Self {
            targets: (1..=page_count).map(Some).collect(),
            new_count: page_count,
        }
    }

    /// `page` disappears; everything after it moves down by one.
    pub fn delete(page_count: usize, page: usize) -> Self {
        let targets = (1..=page_count)
            .map(|old| match old.cmp(&page) {
                std::cmp::Ordering::Less => Some(old),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(old - 1),
            })
            .collect();
        Self {
            targets,
            new_count: page_count.saturating_sub(1),
        }
    }

    /// A new page lands right after `after` (0 = at the front); everything
    /// after the insertion point moves up by one. The new page has no source.
    pub fn insert_after(page_count: usize, after: usize) -> Self {
        let targets = (1..=page_count)
            .map(|old| if old <= after { Some(old) } else { Some(old + 1) })
            .collect();
        Self {
            targets,
            new_count: page_count + 1,
        }
    }

    /// `added` pages appended after the last one; existing pages keep their
    /// numbers.
    pub fn append(page_count: usize, added: usize) -> Self {
        Self {
            targets: (1..=page_count).map(Some).collect(),
            new_count: page_count + added,
        }
    }

    /// Removes `from` from `[1..=page_count]` and reinserts it at position
    /// `to` of the remaining sequence.
    pub fn move_page(page_count: usize, from: usize, to: usize) -> Self {
        let mut order: Vec<usize> = (1..=page_count).filter(|&p| p != from).collect();
        let at = to.saturating_sub(1).min(order.len());
        order.insert(at, from);
        Self::from_order(&order, page_count)
    }

    /// `order[new - 1] = old`. Old pages missing from `order` are dropped.
    pub fn from_order(order: &[usize], old_count: usize) -> Self {
        let mut targets = vec![None; old_count];
        for (new_index, &old) in order.iter().enumerate() {
            if let Some(slot) = old.checked_sub(1).and_then(|i| targets.get_mut(i)) {
                *slot = Some(new_index + 1);
            }
        }
        Self {
            targets,
            new_count: order.len(),
        }
    }

    pub fn new_page(&self, old: usize) -> Option<usize> {
        old.checked_sub(1)
            .and_then(|i| self.targets.get(i))
            .copied()
            .flatten()
    }

    pub fn new_count(&self) -> usize {
        self.new_count
    }

    /// The inverse view: `order()[new - 1]` is the old page now at `new`, or
    /// `None` for a page the mutation created.
    pub fn order(&self) -> Vec<Option<usize>> {
        let mut order = vec![None; self.new_count];
        for (old_index, target) in self.targets.iter().enumerate() {
            if let Some(slot) = target.and_then(|new| order.get_mut(new - 1)) {
                *slot = Some(old_index + 1);
            }
        }
        order
    }

    pub fn is_identity(&self) -> bool {
        self.new_count == self.targets.len()
            && self
                .targets
                .iter()
                .enumerate()
                .all(|(i, t)| *t == Some(i + 1))
    }

    /// Moves every entry to its new key. Entries for removed pages are
    /// discarded; pages without an entry stay without one.
    pub fn apply<V>(&self, map: PageMap<V>) -> PageMap<V> {
        let mut remapped = PageMap::new();
        for (old, value) in map {
            match self.new_page(old) {
                Some(new) => {
                    remapped.insert(new, value);
                }
                None => debug!(page = old, "dropping side-table entry for removed page"),
            }
        }
        remapped
    }
}
