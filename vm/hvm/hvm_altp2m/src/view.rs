// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! View identifiers and the bounded set of views allocated to a domain.

use std::fmt;

/// The number of alternate views a domain may hold at once.
pub const MAX_ALTP2M: u16 = 10;

/// Identifies an alternate view within a domain.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId(u16);

impl ViewId {
    /// The view created when a domain activates alternate views.
    pub const DEFAULT: Self = Self(0);

    /// Returns the view id for `raw`, or `None` if it is outside the view
    /// namespace.
    pub const fn new(raw: u16) -> Option<Self> {
        if raw < MAX_ALTP2M {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Returns the raw id.
    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view{}", self.0)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A set of view ids, stored as a bitmap.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct ViewSet(u16);

// The bitmap must be able to hold every view id.
const _: () = assert!(MAX_ALTP2M as u32 <= u16::BITS);

impl ViewSet {
    /// Returns an empty set.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Returns true if `view` is in the set.
    pub fn contains(&self, view: ViewId) -> bool {
        self.0 & (1 << view.0) != 0
    }

    /// Adds `view`, returning false if it was already present.
    pub fn insert(&mut self, view: ViewId) -> bool {
        let present = self.contains(view);
        self.0 |= 1 << view.0;
        !present
    }

    /// Removes `view`, returning false if it was not present.
    pub fn remove(&mut self, view: ViewId) -> bool {
        let present = self.contains(view);
        self.0 &= !(1 << view.0);
        present
    }

    /// Removes all views.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns true if no views are present.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns the number of views present.
    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Returns the lowest view id not in the set, if any remain.
    pub fn first_free(&self) -> Option<ViewId> {
        ViewId::new((!self.0).trailing_zeros() as u16)
    }

    /// Iterates over the views in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ViewId> + use<> {
        let bits = self.0;
        (0..MAX_ALTP2M)
            .filter(move |i| bits & (1 << i) != 0)
            .map(ViewId)
    }
}

impl fmt::Debug for ViewSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<ViewId> for ViewSet {
    fn from_iter<T: IntoIterator<Item = ViewId>>(iter: T) -> Self {
        let mut set = Self::new();
        for view in iter {
            set.insert(view);
        }
        set
    }
}
