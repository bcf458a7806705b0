//! Priority-ordered transfer registry.

use std::cmp::Reverse;

use quay_events::InfoHash;
use quay_transfer_core::Transfer;

/// Every known transfer, in queue order.
///
/// Ordering is by descending [`Transfer::priority`]; the sort is stable, so
/// equal priorities keep their insertion order across repeated passes.
#[derive(Debug, Default)]
pub struct QueueList {
    transfers: Vec<Transfer>,
}

impl QueueList {
    /// Create an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            transfers: Vec::new(),
        }
    }

    /// Append at the tail, behind every existing transfer.
    pub fn push(&mut self, transfer: Transfer) {
        self.transfers.push(transfer);
    }

    /// Remove and return the transfer with the identifier.
    pub fn remove(&mut self, info_hash: &InfoHash) -> Option<Transfer> {
        let index = self.position(info_hash)?;
        Some(self.transfers.remove(index))
    }

    /// Remove every transfer, returning them in queue order.
    pub fn drain(&mut self) -> Vec<Transfer> {
        std::mem::take(&mut self.transfers)
    }

    /// Queue position of the transfer.
    #[must_use]
    pub fn position(&self, info_hash: &InfoHash) -> Option<usize> {
        self.transfers
            .iter()
            .position(|transfer| transfer.info_hash() == *info_hash)
    }

    /// Whether the identifier is registered.
    #[must_use]
    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.position(info_hash).is_some()
    }

    /// Transfer at queue position `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Transfer> {
        self.transfers.get(index)
    }

    /// Transfer with the identifier.
    #[must_use]
    pub fn find(&self, info_hash: &InfoHash) -> Option<&Transfer> {
        self.transfers
            .iter()
            .find(|transfer| transfer.info_hash() == *info_hash)
    }

    /// Mutable transfer with the identifier.
    pub fn find_mut(&mut self, info_hash: &InfoHash) -> Option<&mut Transfer> {
        self.transfers
            .iter_mut()
            .find(|transfer| transfer.info_hash() == *info_hash)
    }

    /// Transfers in queue order.
    pub fn iter(&self) -> std::slice::Iter<'_, Transfer> {
        self.transfers.iter()
    }

    /// Number of registered transfers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Stable sort by descending priority. Returns whether the order changed.
    pub fn order(&mut self) -> bool {
        let before: Vec<InfoHash> = self.transfers.iter().map(Transfer::info_hash).collect();
        self.transfers
            .sort_by_key(|transfer| Reverse(transfer.priority()));
        self.transfers
            .iter()
            .map(Transfer::info_hash)
            .ne(before.into_iter())
    }
}

impl<'a> IntoIterator for &'a QueueList {
    type Item = &'a Transfer;
    type IntoIter = std::slice::Iter<'a, Transfer>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_transfer_core::{FileEntry, TransferMetadata};

    fn transfer(id: u8, priority: i32) -> Transfer {
        Transfer::from_metadata(
            InfoHash::new([id; 20]),
            TransferMetadata {
                name: format!("t{id}"),
                data_dir: "/srv".into(),
                chunk_size: 16,
                files: vec![FileEntry {
                    path: "f.bin".into(),
                    size_bytes: 16,
                }],
                trackers: Vec::new(),
                seed_limits: None,
                priority,
            },
        )
        .expect("valid metadata")
    }

    fn ids(queue: &QueueList) -> Vec<u8> {
        queue.iter().map(|t| t.info_hash().as_bytes()[0]).collect()
    }

    #[test]
    fn order_is_descending_and_stable() {
        let mut queue = QueueList::new();
        for (id, priority) in [(1, 0), (2, 5), (3, 0), (4, 5), (5, -1), (6, 0)] {
            queue.push(transfer(id, priority));
        }
        assert!(queue.order());
        assert_eq!(ids(&queue), vec![2, 4, 1, 3, 6, 5]);
        assert!(!queue.order());
        assert_eq!(ids(&queue), vec![2, 4, 1, 3, 6, 5]);
    }

    #[test]
    fn lookup_and_removal() {
        let mut queue = QueueList::new();
        queue.push(transfer(1, 0));
        queue.push(transfer(2, 0));
        let hash = InfoHash::new([2; 20]);
        assert_eq!(queue.position(&hash), Some(1));
        assert!(queue.contains(&hash));
        assert_eq!(queue.remove(&hash).map(|t| t.info_hash()), Some(hash));
        assert!(!queue.contains(&hash));
        assert!(queue.remove(&hash).is_none());
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.is_empty());
    }
}
