//! First-come selection: peers in connection order take every remaining piece they hold.

use std::collections::{BTreeMap, HashSet};

use super::{PeerView, SelectionKind, SelectionStrategy};
use crate::torrent::PieceIndex;
use crate::torrent::pieces::BlockRequest;

#[derive(Debug, Default)]
pub struct SequentialStrategy;

impl SelectionStrategy for SequentialStrategy {
    fn kind(&self) -> SelectionKind {
        SelectionKind::Sequential
    }

    fn plan(
        &mut self,
        peers: &[PeerView<'_>],
        remaining: &BTreeMap<PieceIndex, Vec<BlockRequest>>,
    ) -> Vec<Vec<PieceIndex>> {
        let mut taken = HashSet::new();
        peers
            .iter()
            .map(|peer| {
                remaining
                    .keys()
                    .filter(|piece| peer.pieces.contains(piece))
                    .filter(|piece| taken.insert(**piece))
                    .copied()
                    .collect()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{remaining_for, view};
    use super::*;

    #[test]
    fn test_first_peer_takes_everything_it_holds() {
        let a = [1, 2, 3].into_iter().map(PieceIndex::new).collect();
        let b = [2, 3, 4].into_iter().map(PieceIndex::new).collect();
        let peers = [view(1, &a), view(2, &b)];

        let plan = SequentialStrategy.plan(&peers, &remaining_for(&[0, 1, 2, 3, 4]));

        assert_eq!(plan[0], vec![PieceIndex::new(1), PieceIndex::new(2), PieceIndex::new(3)]);
        assert_eq!(plan[1], vec![PieceIndex::new(4)]);
    }
}
