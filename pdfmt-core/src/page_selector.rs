//! Page selection and validation.

use std::collections::BTreeSet;

/// Partition of `[0, total_pages)` into pages to translate and pages to keep.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageSelection {
    pub to_translate: BTreeSet<u32>,
    pub to_preserve: BTreeSet<u32>,
}

impl PageSelection {
    pub fn total(&self) -> usize {
        self.to_translate.len() + self.to_preserve.len()
    }

    pub fn is_noop(&self) -> bool {
        self.to_translate.is_empty()
    }
}

pub struct PageSelector {
    total_pages: u32,
}

impl PageSelector {
    pub fn new(total_pages: u32) -> Self {
        Self { total_pages }
    }

    /// `None` selects every page. Out-of-range indices are dropped with a warning.
    pub fn select(&self, pages: Option<&[i64]>) -> PageSelection {
        let all: BTreeSet<u32> = (0..self.total_pages).collect();

        let selection = match pages {
            None => PageSelection {
                to_translate: all,
                to_preserve: BTreeSet::new(),
            },
            Some(pages) => {
                let mut to_translate = BTreeSet::new();
                for &index in pages {
                    if index >= 0 && index < i64::from(self.total_pages) {
                        to_translate.insert(index as u32);
                    } else {
                        log::warn!(
                            "Page index {} is out of range [0, {})",
                            index,
                            self.total_pages
                        );
                    }
                }
                let to_preserve = all.difference(&to_translate).copied().collect();
                PageSelection {
                    to_translate,
                    to_preserve,
                }
            }
        };

        log::info!(
            "Will translate {} pages, preserve {} pages",
            selection.to_translate.len(),
            selection.to_preserve.len()
        );
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[u32]) -> BTreeSet<u32> {
        items.iter().copied().collect()
    }

    #[test]
    fn none_selects_every_page() {
        let selection = PageSelector::new(10).select(None);
        assert_eq!(selection.to_translate, (0..10).collect());
        assert!(selection.to_preserve.is_empty());
    }

    #[test]
    fn partial_selection() {
        let selection = PageSelector::new(10).select(Some(&[1, 3, 5, 7]));
        assert_eq!(selection.to_translate, set(&[1, 3, 5, 7]));
        assert_eq!(selection.to_preserve, set(&[0, 2, 4, 6, 8, 9]));
    }

    #[test]
    fn out_of_range_indices_are_dropped() {
        let selection = PageSelector::new(10).select(Some(&[1, 5, 15, -1]));
        assert_eq!(selection.to_translate, set(&[1, 5]));
        assert_eq!(selection.to_preserve, set(&[0, 2, 3, 4, 6, 7, 8, 9]));
    }

    #[test]
    fn empty_selection_preserves_everything() {
        let selection = PageSelector::new(4).select(Some(&[]));
        assert!(selection.is_noop());
        assert_eq!(selection.to_preserve, set(&[0, 1, 2, 3]));
    }

    #[test]
    fn duplicates_collapse() {
        let selection = PageSelector::new(3).select(Some(&[2, 2, 0]));
        assert_eq!(selection.to_translate, set(&[0, 2]));
        assert_eq!(selection.total(), 3);
    }

    #[test]
    fn partition_covers_range_for_many_inputs() {
        for total in 0..12u32 {
            let inputs: [&[i64]; 4] = [&[], &[0], &[-3, 4, 11, 40], &[1, 2, 3, 5, 8, 13]];
            for pages in inputs {
                let selection = PageSelector::new(total).select(Some(pages));
                assert!(selection.to_translate.is_disjoint(&selection.to_preserve));
                let union: BTreeSet<u32> = selection
                    .to_translate
                    .union(&selection.to_preserve)
                    .copied()
                    .collect();
                assert_eq!(union, (0..total).collect());
                assert_eq!(selection.total(), total as usize);
            }
        }
    }

    #[test]
    fn zero_pages() {
        let selection = PageSelector::new(0).select(None);
        assert_eq!(selection.total(), 0);
    }
}
