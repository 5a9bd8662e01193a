use std::ops::Range;

use crate::error::{Error, Result};

/// The lifecycle of a member during a decode call.
///
/// A member only ever moves forward: `Pending → Scanning → Decoding → Done`, or into `Failed`
/// from `Scanning` or `Decoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Pending,
    Scanning,
    Decoding,
    Done,
    Failed,
}

impl MemberState {
    /// Whether moving from `self` to `next` is a valid transition.
    pub fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Scanning)
                | (Self::Scanning, Self::Decoding | Self::Failed)
                | (Self::Decoding, Self::Done | Self::Failed)
        )
    }
}

/// A member discovered by the boundary scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    index: usize,
    offset: u64,
    size: u64,
    decompressed_size: Option<u64>,
}

impl Member {
    pub(crate) fn new(index: usize, offset: u64, size: u64, decompressed_size: Option<u64>) -> Self {
        Self {
            index,
            offset,
            size,
            decompressed_size,
        }
    }

    /// The zero based position of the member in its buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The offset of the first member byte in the compressed buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The compressed size of the member.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The offset just past the last member byte.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// The decompressed size, if the scan could determine it.
    pub fn decompressed_size(&self) -> Option<u64> {
        self.decompressed_size
    }

    /// The compressed byte range of the member.
    #[allow(clippy::missing_panics_doc)]
    pub fn range(&self) -> Range<usize> {
        // Members always lie within an in-memory buffer
        let start = usize::try_from(self.offset).expect("Member offset fits in usize");
        let end = usize::try_from(self.end()).expect("Member end fits in usize");
        start..end
    }
}

/// The ordered list of members found in a buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberTable {
    members: Vec<Member>,
}

impl MemberTable {
    /// Creates an empty member table.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, member: Member) {
        debug_assert_eq!(member.index, self.members.len());
        debug_assert_eq!(member.offset, self.size_comp());
        self.members.push(member);
    }

    /// The number of members.
    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// Whether the table holds no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// All members in order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Gets the member at `index`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range.
    pub fn member(&self, index: usize) -> Result<&Member> {
        self.members
            .get(index)
            .ok_or_else(Error::member_index_out_of_range)
    }

    /// The compressed start offset of the member at `index`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range.
    pub fn member_start(&self, index: usize) -> Result<u64> {
        self.member(index).map(Member::offset)
    }

    /// The compressed end offset of the member at `index`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range.
    pub fn member_end(&self, index: usize) -> Result<u64> {
        self.member(index).map(Member::end)
    }

    /// The compressed size of the member at `index`.
    ///
    /// # Errors
    ///
    /// Fails if the index is out of range.
    pub fn member_size(&self, index: usize) -> Result<u64> {
        self.member(index).map(Member::size)
    }

    /// The index of the member containing the compressed `offset`.
    ///
    /// Returns the last index if `offset` is past the end, and `0` for an empty table.
    pub fn member_index_at(&self, offset: u64) -> usize {
        let idx = self.members.partition_point(|m| m.end() <= offset);
        idx.min(self.members.len().saturating_sub(1))
    }

    /// The total compressed size of all members.
    pub fn size_comp(&self) -> u64 {
        self.members.last().map_or(0, Member::end)
    }

    /// The total decompressed size, if known for every member.
    pub fn size_decomp(&self) -> Option<u64> {
        self.members.iter().map(Member::decompressed_size).sum()
    }

    /// The largest compressed member size.
    pub fn max_member_size_comp(&self) -> u64 {
        self.members.iter().map(Member::size).max().unwrap_or(0)
    }

    /// The largest known decompressed member size.
    pub fn max_member_size_decomp(&self) -> Option<u64> {
        self.members.iter().filter_map(Member::decompressed_size).max()
    }
}

impl<'a> IntoIterator for &'a MemberTable {
    type Item = &'a Member;
    type IntoIter = std::slice::Iter<'a, Member>;

    fn into_iter(self) -> Self::IntoIter {
        self.members.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> MemberTable {
        let mut table = MemberTable::new();
        let mut offset = 0;
        for i in 0..5u64 {
            let size = (i + 1) * 10;
            table.push(Member::new(i as usize, offset, size, Some(size * 3)));
            offset += size;
        }
        table
    }

    #[test]
    fn member_functions() {
        let table = table();

        assert_eq!(table.num_members(), 5);
        assert_eq!(table.member_start(2).unwrap(), 30);
        assert_eq!(table.member_end(2).unwrap(), 60);
        assert_eq!(table.member_size(4).unwrap(), 50);
        assert_eq!(table.size_comp(), 150);
        assert_eq!(table.size_decomp(), Some(450));
        assert_eq!(table.max_member_size_comp(), 50);
        assert_eq!(table.max_member_size_decomp(), Some(150));
        assert_eq!(table.member(1).unwrap().range(), 10..30);
        assert!(table.member(5).unwrap_err().is_member_index_out_of_range());
    }

    #[test]
    fn member_index_at_offset() {
        let table = table();

        assert_eq!(table.member_index_at(0), 0);
        assert_eq!(table.member_index_at(9), 0);
        assert_eq!(table.member_index_at(10), 1);
        assert_eq!(table.member_index_at(149), 4);
        assert_eq!(table.member_index_at(1000), 4);
        assert_eq!(MemberTable::new().member_index_at(3), 0);
    }

    #[test]
    fn unknown_decompressed_size() {
        let mut table = table();
        table.push(Member::new(5, 150, 7, None));

        assert_eq!(table.size_decomp(), None);
        assert_eq!(table.max_member_size_decomp(), Some(150));
    }

    #[test]
    fn state_transitions() {
        use MemberState::*;

        assert!(Pending.can_become(Scanning));
        assert!(Scanning.can_become(Decoding));
        assert!(Scanning.can_become(Failed));
        assert!(Decoding.can_become(Done));
        assert!(Decoding.can_become(Failed));
        assert!(!Done.can_become(Decoding));
        assert!(!Failed.can_become(Scanning));
        assert!(!Pending.can_become(Done));
    }
}
