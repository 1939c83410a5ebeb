#![forbid(unsafe_code)]

use std::fmt;

/// Identifier of a page managed by the cache.
///
/// IDs are handed out by the [`PageMap`](crate::PageMap) allocator,
/// strictly increase over the life of the map, and are never reused
/// within a process. Zero is reserved as the invalid ID.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    pub const INVALID: PageId = PageId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_id_is_zero() {
        assert!(!PageId::INVALID.is_valid());
        assert!(PageId(1).is_valid());
        assert_eq!(PageId::default(), PageId::INVALID);
    }

    #[test]
    fn ids_order_by_value() {
        assert!(PageId(1) < PageId(2));
        assert_eq!(PageId(7).to_string(), "7");
    }
}
