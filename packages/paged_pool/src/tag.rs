use std::fmt;

/// Opaque classification of the memory a pool acquires, forwarded to the page store.
///
/// Tags exist for accounting only: page stores may attribute bytes in use to a tag so that
/// diagnostics can show which subsystem owns how much memory. They never affect allocation.
///
/// # Examples
///
/// ```
/// use paged_pool::AllocTag;
///
/// const VNODE: AllocTag = AllocTag::new("vnode");
///
/// assert_eq!(VNODE.name(), "vnode");
/// assert_eq!(VNODE.to_string(), "vnode");
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AllocTag(&'static str);

impl AllocTag {
    /// Memory not attributed to any particular subsystem.
    pub const GENERIC: Self = Self::new("generic");

    /// Creates a tag with the given name.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name of the tag.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl Default for AllocTag {
    fn default() -> Self {
        Self::GENERIC
    }
}

impl fmt::Display for AllocTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}
