//! Load-balanced selection: each piece goes to the holder with the shortest queue.

use std::collections::BTreeMap;

use super::{PeerView, SelectionKind, SelectionStrategy, assign_to_least_loaded};
use crate::torrent::PieceIndex;
use crate::torrent::pieces::BlockRequest;

#[derive(Debug, Default)]
pub struct LoadBalancedStrategy;

impl SelectionStrategy for LoadBalancedStrategy {
    fn kind(&self) -> SelectionKind {
        SelectionKind::LoadBalanced
    }

    fn plan(
        &mut self,
        peers: &[PeerView<'_>],
        remaining: &BTreeMap<PieceIndex, Vec<BlockRequest>>,
    ) -> Vec<Vec<PieceIndex>> {
        assign_to_least_loaded(peers, remaining.keys().copied())
    }
}
