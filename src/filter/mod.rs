pub mod bloom;

/// A pluggable policy mapping a set of keys to a compact filter and
/// answering (possibly falsely-positive) membership queries against it.
pub trait FilterPolicy: Send + Sync {
    /// The name of this policy. It is stored with every filter block, so
    /// an incompatible change to the filter encoding must change the name.
    fn name(&self) -> &str;

    /// Appends a filter summarizing `keys` to `dst`.
    fn append_filter(&self, keys: &[Vec<u8>], dst: &mut Vec<u8>);

    /// Returns false only if `key` was certainly not in the set the
    /// filter was built from.
    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool;
}
