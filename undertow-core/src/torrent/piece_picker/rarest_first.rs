//! Rarest-first selection.
//!
//! Keeps a count of how many tracked peers hold each piece. Pieces are
//! handed out in ascending (holder count, piece index) order to the least
//! loaded holder, so every peer's list ends up ordered rarest first.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::{PeerView, SelectionKind, SelectionStrategy, assign_to_least_loaded};
use crate::torrent::PieceIndex;
use crate::torrent::pieces::BlockRequest;

#[derive(Debug, Default)]
pub struct RarestFirstStrategy {
    availability: HashMap<PieceIndex, u32>,
}

impl RarestFirstStrategy {
    /// Number of tracked peers holding `piece`.
    pub fn availability(&self, piece: PieceIndex) -> u32 {
        self.availability.get(&piece).copied().unwrap_or(0)
    }
}

impl SelectionStrategy for RarestFirstStrategy {
    fn kind(&self) -> SelectionKind {
        SelectionKind::RarestFirst
    }

    fn peer_gained_piece(&mut self, piece: PieceIndex) {
        *self.availability.entry(piece).or_insert(0) += 1;
    }

    fn peer_removed(&mut self, pieces: &BTreeSet<PieceIndex>) {
        for piece in pieces {
            if let Some(count) = self.availability.get_mut(piece) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.availability.remove(piece);
                }
            }
        }
    }

    fn plan(
        &mut self,
        peers: &[PeerView<'_>],
        remaining: &BTreeMap<PieceIndex, Vec<BlockRequest>>,
    ) -> Vec<Vec<PieceIndex>> {
        let mut order: Vec<PieceIndex> = remaining.keys().copied().collect();
        order.sort_by_key(|piece| (self.availability(*piece), *piece));

        let mut plan = assign_to_least_loaded(peers, order);
        for pieces in &mut plan {
            pieces.sort_by_key(|piece| (self.availability(*piece), *piece));
        }
        plan
    }
}
