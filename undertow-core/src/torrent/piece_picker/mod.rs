//! Piece selection.
//!
//! A [`PiecePicker`] owns the per-peer selection state and one pluggable
//! [`SelectionStrategy`]. Every selection round replaces each peer's queue of
//! assignments and flags every peer stale so sessions drop the batch they
//! were working from. Within a round a piece is handed to at most one peer.

pub mod load_balanced;
pub mod rarest_first;
pub mod sequential;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};

pub use load_balanced::LoadBalancedStrategy;
pub use rarest_first::RarestFirstStrategy;
pub use sequential::SequentialStrategy;

use super::PieceIndex;
use super::pieces::BlockRequest;

/// Selection policy chosen at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SelectionKind {
    /// Peers in connection order take every remaining piece they hold
    Sequential,
    /// Each piece goes to the holder with the fewest assignments
    LoadBalanced,
    /// Least available pieces first
    RarestFirst,
}

impl SelectionKind {
    /// Fresh strategy instance for this kind.
    pub fn build(self) -> Box<dyn SelectionStrategy> {
        match self {
            SelectionKind::Sequential => Box::new(SequentialStrategy),
            SelectionKind::LoadBalanced => Box::new(LoadBalancedStrategy),
            SelectionKind::RarestFirst => Box::new(RarestFirstStrategy::default()),
        }
    }
}

impl FromStr for SelectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "sequential" => Ok(SelectionKind::Sequential),
            "load-balanced" | "weight" => Ok(SelectionKind::LoadBalanced),
            "rarest-first" | "rarest" => Ok(SelectionKind::RarestFirst),
            _ => Err(format!("Invalid selection policy: {s}")),
        }
    }
}

impl fmt::Display for SelectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SelectionKind::Sequential => "sequential",
            SelectionKind::LoadBalanced => "load-balanced",
            SelectionKind::RarestFirst => "rarest-first",
        })
    }
}

/// One piece handed to a peer together with the blocks still missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub piece_index: PieceIndex,
    pub blocks: Vec<BlockRequest>,
}

/// What a strategy sees of an eligible peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerView<'a> {
    pub address: SocketAddr,
    pub pieces: &'a BTreeSet<PieceIndex>,
}

/// Trait for piece selection strategies.
///
/// `plan` receives the eligible peers in connection order and returns one
/// ordered piece list per peer, index-aligned with `peers`. Pieces listed for
/// more than one peer are only handed to the first.
pub trait SelectionStrategy: Send + fmt::Debug {
    fn kind(&self) -> SelectionKind;

    /// A tracked peer announced a piece it did not have before.
    fn peer_gained_piece(&mut self, _piece: PieceIndex) {}

    /// A tracked peer holding `pieces` went away.
    fn peer_removed(&mut self, _pieces: &BTreeSet<PieceIndex>) {}

    fn plan(
        &mut self,
        peers: &[PeerView<'_>],
        remaining: &BTreeMap<PieceIndex, Vec<BlockRequest>>,
    ) -> Vec<Vec<PieceIndex>>;
}

/// Hands each piece, in the given order, to the holder with the fewest
/// pieces so far. Ties go to the earlier peer.
pub(crate) fn assign_to_least_loaded(
    peers: &[PeerView<'_>],
    order: impl IntoIterator<Item = PieceIndex>,
) -> Vec<Vec<PieceIndex>> {
    let mut plan = vec![Vec::new(); peers.len()];
    for piece in order {
        let holder = peers
            .iter()
            .enumerate()
            .filter(|(_, peer)| peer.pieces.contains(&piece))
            .min_by_key(|(slot, _)| (plan[*slot].len(), *slot))
            .map(|(slot, _)| slot);
        if let Some(slot) = holder {
            plan[slot].push(piece);
        }
    }
    plan
}

#[derive(Debug, Default)]
struct PeerSelection {
    registered: u64,
    pieces: BTreeSet<PieceIndex>,
    assignments: VecDeque<Assignment>,
    bitfield_received: bool,
    stale: bool,
    finished: bool,
}

#[derive(Debug)]
struct PickerState {
    peers: HashMap<SocketAddr, PeerSelection>,
    next_registration: u64,
    strategy: Box<dyn SelectionStrategy>,
}

impl PickerState {
    fn peers_in_order(&self) -> Vec<SocketAddr> {
        let mut order: Vec<_> = self
            .peers
            .iter()
            .map(|(address, peer)| (peer.registered, *address))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, address)| address).collect()
    }

    fn bitfields_complete(&self) -> bool {
        self.peers.values().all(|peer| peer.bitfield_received)
    }
}

/// Thread-safe selection state shared by the coordinator and every session.
#[derive(Debug)]
pub struct PiecePicker {
    state: Mutex<PickerState>,
    bitfields_ready: Notify,
    rounds: watch::Sender<u64>,
}

impl PiecePicker {
    pub fn new(kind: SelectionKind) -> Self {
        Self::with_strategy(kind.build())
    }

    pub fn with_strategy(strategy: Box<dyn SelectionStrategy>) -> Self {
        let (rounds, _) = watch::channel(0);
        Self {
            state: Mutex::new(PickerState {
                peers: HashMap::new(),
                next_registration: 0,
                strategy,
            }),
            bitfields_ready: Notify::new(),
            rounds,
        }
    }

    pub fn kind(&self) -> SelectionKind {
        self.state.lock().strategy.kind()
    }

    /// Starts tracking `peer`. Returns false if it is already tracked.
    pub fn register_peer(&self, peer: SocketAddr) -> bool {
        let mut state = self.state.lock();
        if state.peers.contains_key(&peer) {
            return false;
        }
        let registered = state.next_registration;
        state.next_registration += 1;
        state.peers.insert(
            peer,
            PeerSelection {
                registered,
                ..Default::default()
            },
        );
        true
    }

    /// Stops tracking `peer` and drops its assignments.
    pub fn remove_peer(&self, peer: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(removed) = state.peers.remove(&peer) {
            state.strategy.peer_removed(&removed.pieces);
        }
        let complete = state.bitfields_complete();
        drop(state);
        if complete {
            self.bitfields_ready.notify_waiters();
        }
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn is_tracked(&self, peer: SocketAddr) -> bool {
        self.state.lock().peers.contains_key(&peer)
    }

    /// Records that `peer` holds `piece`. Repeats are ignored.
    pub fn record_peer_has_piece(&self, piece: PieceIndex, peer: SocketAddr) -> bool {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(selection) = state.peers.get_mut(&peer) else {
            return false;
        };
        let added = selection.pieces.insert(piece);
        if added {
            state.strategy.peer_gained_piece(piece);
        }
        added
    }

    /// Marks that `peer` has told us what it holds.
    pub fn mark_bitfield_received(&self, peer: SocketAddr) {
        let mut state = self.state.lock();
        if let Some(selection) = state.peers.get_mut(&peer) {
            selection.bitfield_received = true;
        }
        let complete = state.bitfields_complete();
        drop(state);
        if complete {
            self.bitfields_ready.notify_waiters();
        }
    }

    /// True once every tracked peer has reported a bitfield or a HAVE.
    pub fn peer_bitfields_complete(&self) -> bool {
        self.state.lock().bitfields_complete()
    }

    /// Waits until [`PiecePicker::peer_bitfields_complete`] holds or `timeout` elapses.
    ///
    /// Returns whether every tracked peer reported in time.
    pub async fn wait_for_peer_bitfields(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.bitfields_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.peer_bitfields_complete() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.peer_bitfields_complete();
            }
        }
    }

    /// Runs one selection round over `remaining`.
    ///
    /// Every peer's queue is replaced and every peer is flagged stale. A peer
    /// that has reported its pieces but holds none of the remaining ones is
    /// marked finished. Returns the number of pieces handed out.
    pub fn select_assignments(&self, mut remaining: BTreeMap<PieceIndex, Vec<BlockRequest>>) -> usize {
        let mut state = self.state.lock();
        let state = &mut *state;

        let order = state.peers_in_order();
        let eligible: Vec<SocketAddr> = order
            .iter()
            .copied()
            .filter(|address| {
                let peer = &state.peers[address];
                peer.bitfield_received && !peer.finished
            })
            .collect();

        let newly_finished: Vec<SocketAddr> = eligible
            .iter()
            .copied()
            .filter(|address| {
                state.peers[address]
                    .pieces
                    .iter()
                    .all(|piece| !remaining.contains_key(piece))
            })
            .collect();

        let views: Vec<PeerView<'_>> = eligible
            .iter()
            .map(|address| PeerView {
                address: *address,
                pieces: &state.peers[address].pieces,
            })
            .collect();
        let plan = state.strategy.plan(&views, &remaining);
        drop(views);

        for peer in state.peers.values_mut() {
            peer.assignments.clear();
            peer.stale = true;
        }

        let mut handed_out = 0;
        for (address, pieces) in eligible.iter().zip(plan) {
            let Some(peer) = state.peers.get_mut(address) else {
                continue;
            };
            for piece in pieces {
                if !peer.pieces.contains(&piece) {
                    continue;
                }
                // Removing from the shared view keeps the piece off every other peer
                if let Some(blocks) = remaining.remove(&piece) {
                    peer.assignments.push_back(Assignment {
                        piece_index: piece,
                        blocks,
                    });
                    handed_out += 1;
                }
            }
        }

        for address in &newly_finished {
            if let Some(peer) = state.peers.get_mut(address) {
                peer.finished = true;
            }
        }

        tracing::debug!(
            "Selection round ({}): {} pieces over {} peers, {} finished",
            state.strategy.kind(),
            handed_out,
            eligible.len(),
            newly_finished.len()
        );

        self.rounds.send_modify(|round| *round += 1);
        handed_out
    }

    /// Current ordered assignments of `peer`.
    pub fn assignments_for(&self, peer: SocketAddr) -> Vec<Assignment> {
        self.state
            .lock()
            .peers
            .get(&peer)
            .map(|selection| selection.assignments.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Takes up to `max_pieces` assignments off the front of `peer`'s queue.
    pub fn next_batch(&self, peer: SocketAddr, max_pieces: usize) -> Vec<Assignment> {
        let mut state = self.state.lock();
        let Some(selection) = state.peers.get_mut(&peer) else {
            return Vec::new();
        };
        let count = max_pieces.min(selection.assignments.len());
        selection.assignments.drain(..count).collect()
    }

    pub fn pending_assignment_count(&self, peer: SocketAddr) -> usize {
        self.state
            .lock()
            .peers
            .get(&peer)
            .map_or(0, |selection| selection.assignments.len())
    }

    pub fn mark_stale(&self, peer: SocketAddr) {
        if let Some(selection) = self.state.lock().peers.get_mut(&peer) {
            selection.stale = true;
        }
    }

    /// Whether `peer`'s batch was invalidated. Untracked peers read as stale.
    pub fn is_stale(&self, peer: SocketAddr) -> bool {
        self.state
            .lock()
            .peers
            .get(&peer)
            .is_none_or(|selection| selection.stale)
    }

    /// Reads and clears the stale flag.
    pub fn take_stale(&self, peer: SocketAddr) -> bool {
        match self.state.lock().peers.get_mut(&peer) {
            Some(selection) => std::mem::take(&mut selection.stale),
            None => true,
        }
    }

    /// Whether `peer` has nothing more to fetch. Untracked peers read as finished.
    pub fn is_finished(&self, peer: SocketAddr) -> bool {
        self.state
            .lock()
            .peers
            .get(&peer)
            .is_none_or(|selection| selection.finished)
    }

    /// Marks every tracked peer finished, used once the download completes.
    pub fn finish_all(&self) {
        let mut state = self.state.lock();
        for selection in state.peers.values_mut() {
            selection.finished = true;
            selection.assignments.clear();
        }
        drop(state);
        self.rounds.send_modify(|round| *round += 1);
    }

    /// Receiver ticking once per selection round.
    pub fn subscribe_rounds(&self) -> watch::Receiver<u64> {
        self.rounds.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    pub(crate) fn address(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    pub(crate) fn view(port: u16, pieces: &BTreeSet<PieceIndex>) -> PeerView<'_> {
        PeerView {
            address: address(port),
            pieces,
        }
    }

    pub(crate) fn remaining_for(indices: &[u32]) -> BTreeMap<PieceIndex, Vec<BlockRequest>> {
        indices
            .iter()
            .map(|index| {
                let piece = PieceIndex::new(*index);
                (
                    piece,
                    vec![
                        BlockRequest::new(piece, 0, 16_384),
                        BlockRequest::new(piece, 16_384, 16_384),
                    ],
                )
            })
            .collect()
    }

    fn picker_with(kind: SelectionKind, holdings: &[(u16, &[u32])]) -> PiecePicker {
        let picker = PiecePicker::new(kind);
        for (port, pieces) in holdings {
            picker.register_peer(address(*port));
            for piece in *pieces {
                picker.record_peer_has_piece(PieceIndex::new(*piece), address(*port));
            }
            picker.mark_bitfield_received(address(*port));
        }
        picker
    }

    #[test]
    fn test_no_block_assigned_twice() {
        let holdings: &[(u16, &[u32])] = &[
            (1, &[0, 1, 2, 3, 4, 5]),
            (2, &[0, 1, 2, 3, 4, 5]),
            (3, &[2, 3, 4]),
        ];
        for kind in [
            SelectionKind::Sequential,
            SelectionKind::LoadBalanced,
            SelectionKind::RarestFirst,
        ] {
            let picker = picker_with(kind, holdings);
            let handed_out = picker.select_assignments(remaining_for(&[0, 1, 2, 3, 4, 5]));
            assert_eq!(handed_out, 6, "{kind}");

            let mut seen = HashSet::new();
            for (port, _) in holdings {
                for assignment in picker.assignments_for(address(*port)) {
                    for block in assignment.blocks {
                        assert!(seen.insert(block), "{kind}: {block:?} assigned twice");
                    }
                }
            }
            assert_eq!(seen.len(), 12);
        }
    }

    #[test]
    fn test_rarest_first_orders_every_peer_list() {
        let picker = picker_with(
            SelectionKind::RarestFirst,
            &[(1, &[2, 5]), (2, &[2, 7]), (3, &[2, 8])],
        );

        picker.select_assignments(remaining_for(&[2, 5, 7, 8]));

        let first: Vec<_> = picker
            .assignments_for(address(1))
            .into_iter()
            .map(|a| a.piece_index)
            .collect();
        assert_eq!(first, vec![PieceIndex::new(5), PieceIndex::new(2)]);
    }

    #[test]
    fn test_round_marks_every_peer_stale() {
        let picker = picker_with(SelectionKind::LoadBalanced, &[(1, &[0]), (2, &[1])]);
        let mut rounds = picker.subscribe_rounds();

        picker.select_assignments(remaining_for(&[0, 1]));

        assert!(rounds.has_changed().unwrap());
        assert!(picker.take_stale(address(1)));
        assert!(!picker.take_stale(address(1)));
        assert!(picker.is_stale(address(2)));
        picker.mark_stale(address(1));
        assert!(picker.is_stale(address(1)));
    }

    #[test]
    fn test_peer_without_remaining_pieces_is_finished() {
        let picker = picker_with(SelectionKind::Sequential, &[(1, &[0, 1]), (2, &[7])]);

        picker.select_assignments(remaining_for(&[0, 1]));

        assert!(!picker.is_finished(address(1)));
        assert!(picker.is_finished(address(2)));
        assert!(picker.is_finished(address(99)));
    }

    #[test]
    fn test_next_batch_drains_in_order() {
        let picker = picker_with(SelectionKind::Sequential, &[(1, &[0, 1, 2])]);
        picker.select_assignments(remaining_for(&[0, 1, 2]));

        let batch = picker.next_batch(address(1), 2);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].piece_index, PieceIndex::new(0));
        assert_eq!(picker.pending_assignment_count(address(1)), 1);
        assert_eq!(picker.next_batch(address(1), 5).len(), 1);
        assert!(picker.next_batch(address(1), 5).is_empty());
    }

    #[test]
    fn test_peers_without_bitfield_get_nothing() {
        let picker = PiecePicker::new(SelectionKind::LoadBalanced);
        picker.register_peer(address(1));
        picker.record_peer_has_piece(PieceIndex::new(0), address(1));

        assert!(!picker.peer_bitfields_complete());
        assert_eq!(picker.select_assignments(remaining_for(&[0])), 0);
        assert!(!picker.is_finished(address(1)));
    }

    #[tokio::test]
    async fn test_wait_for_peer_bitfields_wakes_on_last_report() {
        let picker = Arc::new(PiecePicker::new(SelectionKind::RarestFirst));
        picker.register_peer(address(1));
        picker.register_peer(address(2));
        picker.mark_bitfield_received(address(1));

        let waiter = {
            let picker = Arc::clone(&picker);
            tokio::spawn(async move { picker.wait_for_peer_bitfields(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        picker.mark_bitfield_received(address(2));

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_peer_bitfields_times_out() {
        let picker = PiecePicker::new(SelectionKind::Sequential);
        picker.register_peer(address(1));

        assert!(!picker.wait_for_peer_bitfields(Duration::from_millis(20)).await);

        picker.remove_peer(address(1));
        assert!(picker.wait_for_peer_bitfields(Duration::from_millis(20)).await);
    }

    #[test]
    fn test_selection_kind_parsing() {
        assert_eq!(
            "rarest-first".parse::<SelectionKind>(),
            Ok(SelectionKind::RarestFirst)
        );
        assert_eq!(
            "load_balanced".parse::<SelectionKind>(),
            Ok(SelectionKind::LoadBalanced)
        );
        assert_eq!(
            "Sequential".parse::<SelectionKind>(),
            Ok(SelectionKind::Sequential)
        );
        assert!("random".parse::<SelectionKind>().is_err());
    }
}
