//! User Operation masks.
//!
//! A UO mask disables specific user-initiated operations (menu call, title
//! search). Masks exist at three granularities - playlist, current clip and
//! current menu page - and the player acts on their union.

use serde::{Deserialize, Serialize};

/// Index values reported to the application when an operation is masked.
pub const UO_MENU_CALL_INDEX: u32 = 0;
pub const UO_TITLE_SEARCH_INDEX: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UoMask {
    pub menu_call: bool,
    pub title_search: bool,
}

impl UoMask {
    pub const fn new(menu_call: bool, title_search: bool) -> Self {
        Self {
            menu_call,
            title_search,
        }
    }

    /// Combine two masks; an operation is disabled if either source disables it.
    pub fn union(self, other: UoMask) -> UoMask {
        UoMask {
            menu_call: self.menu_call || other.menu_call,
            title_search: self.title_search || other.title_search,
        }
    }

    /// Pack into event-parameter bits (bit 0 = menu call, bit 1 = title search).
    pub fn bits(self) -> u32 {
        (self.menu_call as u32) | ((self.title_search as u32) << 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_is_bitwise_or() {
        let a = UoMask::new(true, false);
        let b = UoMask::new(false, true);
        assert_eq!(a.union(b), UoMask::new(true, true));
        assert_eq!(a.union(UoMask::default()), a);
    }

    #[test]
    fn test_union_same_bit_does_not_change_value() {
        let a = UoMask::new(true, false);
        let b = UoMask::new(true, false);
        assert_eq!(a.union(b), a);
    }

    #[test]
    fn test_bits_packing() {
        assert_eq!(UoMask::default().bits(), 0);
        assert_eq!(UoMask::new(true, false).bits(), 1);
        assert_eq!(UoMask::new(false, true).bits(), 2);
        assert_eq!(UoMask::new(true, true).bits(), 3);
    }
}
