//! The DHT node: receive loop, RPC handlers, and the iterative protocols
//! (lookup, allocation, quorum fetch, republish, join) built on top of them.

use crate::diagnostics;
use crate::messaging::Messenger;
use crate::reconcile::most_represented;
use crate::routing::{xor_distance, Insertion, RoutingTable};
use crate::storage::{AccountStore, StoreError};
use crate::{lock, quorum, random_below, DhtConfig, Result};
use passtor_core::proto::{
    AccountNetwork, AllocationReply, AllocationRequest, Envelope, FetchReply, FetchRequest,
    LookupReply, LookupRequest, Payload, Ping,
};
use passtor_core::{
    bytes_to_hash, node_id_from_name, short_hex, Account, Hash, NodeAddr, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION, UDP_BUFFER_SIZE,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// State of one candidate during a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupStatus {
    pub node: NodeAddr,
    pub tested: bool,
    pub failed: bool,
}

impl LookupStatus {
    fn new(node: NodeAddr) -> Self {
        Self {
            node,
            tested: false,
            failed: false,
        }
    }
}

/// Order candidates: responsive nodes first, then by XOR distance to `target`
fn rank(candidates: &mut [LookupStatus], target: &Hash) {
    candidates.sort_by(|a, b| {
        a.failed
            .cmp(&b.failed)
            .then_with(|| xor_distance(&a.node.node_id, target).cmp(&xor_distance(&b.node.node_id, target)))
    });
}

/// Claim the closest untested candidate among the `k` best ranked ones
fn claim_untested(candidates: &mut [LookupStatus], target: &Hash, k: usize) -> Option<NodeAddr> {
    rank(candidates, target);
    // Limited to the k best ranked entries, not every untested candidate
    let status = candidates.iter_mut().take(k).find(|c| !c.tested)?;
    status.tested = true;
    Some(status.node)
}

/// Add newly learned nodes, skipping ourselves and known ones
fn merge(candidates: &mut Vec<LookupStatus>, nodes: Vec<NodeAddr>, local_id: &Hash) {
    for node in nodes {
        if &node.node_id == local_id || candidates.iter().any(|c| c.node.node_id == node.node_id) {
            continue;
        }
        candidates.push(LookupStatus::new(node));
    }
}

fn mark_failed(candidates: &mut [LookupStatus], node_id: &Hash) {
    if let Some(status) = candidates.iter_mut().find(|c| &c.node.node_id == node_id) {
        status.failed = true;
    }
}

#[derive(Default)]
struct FetchState {
    /// Answers from replicas, in arrival order
    results: Vec<Account>,
    /// Our own stored copy
    local: Option<Account>,
    done: bool,
    winner: Option<Account>,
}

impl FetchState {
    /// Vote over all answers. The local copy comes last so that replicas win ties.
    fn tally(&self, min: usize) -> (Option<Account>, bool) {
        let mut votes = self.results.clone();
        votes.extend(self.local.iter().cloned());
        most_represented(&votes, min)
    }
}

/// A DHT node. Cloning is cheap; all clones share the same node.
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    config: DhtConfig,
    messenger: Messenger,
    routing: RoutingTable,
    store: AccountStore,
    span: Span,
}

impl DhtNode {
    /// Bind a node whose ID is derived from its name
    pub async fn bind(name: &str, addr: SocketAddr, config: DhtConfig) -> Result<Self> {
        Self::bind_with_id(name, node_id_from_name(name), addr, config).await
    }

    pub async fn bind_with_id(
        name: &str,
        node_id: Hash,
        addr: SocketAddr,
        config: DhtConfig,
    ) -> Result<Self> {
        let messenger = Messenger::bind(addr, node_id, config.timeout).await?;
        let local = *messenger.local();
        let span = info_span!("passtor", node = %name);
        span.in_scope(|| info!(id = %short_hex(&node_id), addr = %local.addr, "node bound"));

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                routing: RoutingTable::new(local, config.k),
                store: AccountStore::new(),
                messenger,
                config,
                span,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local(&self) -> NodeAddr {
        *self.inner.messenger.local()
    }

    pub fn node_id(&self) -> Hash {
        self.inner.messenger.local().node_id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn store(&self) -> &AccountStore {
        &self.inner.store
    }

    pub fn messenger(&self) -> &Messenger {
        &self.inner.messenger
    }

    /// Logging context of this node
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Run the receive loop in a background task
    pub fn spawn_listener(&self) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(node.listen().instrument(self.span().clone()))
    }

    /// Receive loop: one datagram at a time, each handled in its own task.
    /// Runs until the task is dropped.
    pub async fn listen(self) {
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let (n, from) = match self.inner.messenger.recv(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                    continue;
                }
            };

            let envelope = match Envelope::from_bytes(&buf[..n]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(%from, error = %e, "dropping malformed packet");
                    continue;
                }
            };

            let node = self.clone();
            tokio::spawn(
                async move { node.dispatch(envelope, from).await }.instrument(self.span().clone()),
            );
        }
    }

    async fn dispatch(&self, envelope: Envelope, from: SocketAddr) {
        // The observed source address is what we can actually reach
        let sender = match envelope.sender.as_ref().map(NodeAddr::from_proto) {
            Some(Ok(sender)) => Some(NodeAddr::new(from, sender.node_id)),
            Some(Err(e)) => {
                warn!(%from, error = %e, "dropping message with malformed sender");
                return;
            }
            None => None,
        };

        if envelope.reply {
            self.inner.messenger.deliver_reply(envelope);
        } else {
            let Some(sender) = sender else {
                warn!(%from, kind = envelope.kind(), "dropping request without sender");
                return;
            };
            let id = envelope.id;
            let reply = match envelope.payload {
                Some(Payload::Ping(_)) => Payload::Ping(Ping {}),
                Some(Payload::LookupRequest(req)) => self.handle_lookup(req),
                Some(Payload::AllocationRequest(req)) => self.handle_allocation(req),
                Some(Payload::FetchRequest(req)) => self.handle_fetch(req),
                Some(Payload::LookupReply(_))
                | Some(Payload::AllocationReply(_))
                | Some(Payload::FetchReply(_))
                | None => {
                    warn!(peer = %sender, "dropping request without request payload");
                    return;
                }
            };
            self.inner.messenger.send_reply(id, reply, from).await;
        }

        if let Some(sender) = sender {
            self.add_peer(sender).await;
        }
    }

    fn handle_lookup(&self, req: LookupRequest) -> Payload {
        let nodes = match bytes_to_hash(&req.target) {
            Ok(target) => self
                .inner
                .routing
                .closest_nodes(&target, self.inner.config.k)
                .iter()
                .map(NodeAddr::to_proto)
                .collect(),
            Err(e) => {
                warn!(error = %e, "lookup request with malformed target");
                Vec::new()
            }
        };
        Payload::LookupReply(LookupReply { nodes })
    }

    fn handle_allocation(&self, req: AllocationRequest) -> Payload {
        let error = match req.account.map(Account::from_network) {
            None => "missing account".to_string(),
            Some(Err(e)) => e.to_string(),
            Some(Ok(account)) => {
                let id = account.id;
                let replication = req.replication.clamp(1, self.inner.config.k.max(1) as u32);
                match self.store_account(account.clone(), replication) {
                    Ok(()) => {
                        debug!(account = %short_hex(&id), index = req.index, "stored replica");
                        String::new()
                    }
                    // Re-allocation of the copy we already hold
                    Err(StoreError::AlreadyStored) if self.inner.store.holds(&account) => String::new(),
                    Err(e) => {
                        debug!(account = %short_hex(&id), error = %e, "refused replica");
                        e.to_string()
                    }
                }
            }
        };
        Payload::AllocationReply(AllocationReply { error })
    }

    fn handle_fetch(&self, req: FetchRequest) -> Payload {
        let account = bytes_to_hash(&req.id)
            .ok()
            .and_then(|id| self.inner.store.get(&id))
            .map(|account| account.to_network());
        Payload::FetchReply(FetchReply { account })
    }

    /// Offer a peer to the routing table.
    ///
    /// When its bucket is full the least recently seen entry is pinged and
    /// only replaced if it does not answer.
    pub async fn add_peer(&self, node: NodeAddr) {
        match self.inner.routing.insert(node) {
            Insertion::Inserted => debug!(peer = %node, "added peer"),
            Insertion::Full { tail } => {
                if self.ping(tail.addr).await.is_some() {
                    self.inner.routing.touch(&tail);
                    debug!(peer = %node, kept = %tail, "bucket full, keeping live peer");
                } else if self.inner.routing.replace(&tail, node) {
                    debug!(peer = %node, evicted = %tail, "replaced unresponsive peer");
                }
            }
            Insertion::Touched | Insertion::Ignored => {}
        }
    }

    /// Ping a peer; returns its address and ID if it answers
    pub async fn ping(&self, addr: SocketAddr) -> Option<NodeAddr> {
        let reply = self
            .inner
            .messenger
            .send_request(Payload::Ping(Ping {}), addr, self.inner.config.max_retries)
            .await?;
        match (reply.payload, reply.sender) {
            (Some(Payload::Ping(_)), Some(sender)) => {
                let sender = NodeAddr::from_proto(&sender).ok()?;
                Some(NodeAddr::new(addr, sender.node_id))
            }
            _ => {
                warn!(%addr, "unexpected reply to ping");
                None
            }
        }
    }

    async fn request_lookup(&self, peer: &NodeAddr, target: &Hash) -> Option<Vec<NodeAddr>> {
        let payload = Payload::LookupRequest(LookupRequest {
            target: target.to_vec(),
        });
        let reply = self
            .inner
            .messenger
            .send_request(payload, peer.addr, self.inner.config.max_retries)
            .await?;
        match reply.payload {
            Some(Payload::LookupReply(rep)) => Some(
                rep.nodes
                    .iter()
                    .filter_map(|n| NodeAddr::from_proto(n).ok())
                    .collect(),
            ),
            _ => {
                warn!(peer = %peer, "unexpected reply to lookup");
                None
            }
        }
    }

    /// Iterative parallel lookup of the nodes closest to `target`.
    ///
    /// Returns up to K entries, responsive nodes first, each group ordered by
    /// ascending distance to the target.
    pub async fn find_closest_nodes_detailed(&self, target: &Hash) -> Vec<LookupStatus> {
        let k = self.inner.config.k;
        let seeds = self.inner.routing.closest_nodes(target, k);
        let candidates = Arc::new(Mutex::new(
            seeds.into_iter().map(LookupStatus::new).collect::<Vec<_>>(),
        ));

        let mut workers = JoinSet::new();
        for _ in 0..self.inner.config.alpha.max(1) {
            let node = self.clone();
            let candidates = candidates.clone();
            let target = *target;
            workers.spawn(
                async move { node.lookup_worker(target, candidates).await }
                    .instrument(self.span().clone()),
            );
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "lookup worker failed");
            }
        }

        let mut candidates = lock(&candidates).clone();
        rank(&mut candidates, target);
        candidates.truncate(k);
        debug!(
            target = %short_hex(target),
            "lookup finished\n{}",
            diagnostics::format_distances(target, candidates.iter().map(|c| &c.node))
        );
        candidates
    }

    /// Iterative lookup returning only the node addresses
    pub async fn find_closest_nodes(&self, target: &Hash) -> Vec<NodeAddr> {
        self.find_closest_nodes_detailed(target)
            .await
            .into_iter()
            .map(|c| c.node)
            .collect()
    }

    async fn lookup_worker(&self, target: Hash, candidates: Arc<Mutex<Vec<LookupStatus>>>) {
        let k = self.inner.config.k;
        let local_id = self.node_id();
        loop {
            let Some(peer) = claim_untested(&mut lock(&candidates), &target, k) else {
                break;
            };
            match self.request_lookup(&peer, &target).await {
                Some(nodes) => merge(&mut lock(&candidates), nodes, &local_id),
                None => {
                    debug!(peer = %peer, "lookup peer unresponsive");
                    mark_failed(&mut lock(&candidates), &peer.node_id);
                }
            }
        }
    }

    async fn request_allocation(
        &self,
        peer: &NodeAddr,
        account: AccountNetwork,
        replication: u32,
        index: u32,
    ) -> std::result::Result<(), String> {
        let payload = Payload::AllocationRequest(AllocationRequest {
            account: Some(account),
            replication,
            index,
        });
        let reply = self
            .inner
            .messenger
            .send_request(payload, peer.addr, self.inner.config.max_retries)
            .await
            .ok_or_else(|| "no reply".to_string())?;
        match reply.payload {
            Some(Payload::AllocationReply(rep)) if rep.error.is_empty() => Ok(()),
            Some(Payload::AllocationReply(rep)) => Err(rep.error),
            _ => Err("unexpected reply".to_string()),
        }
    }

    /// Whether an allocation request carrying `account` fits in one datagram
    pub fn fits_in_datagram(&self, account: &Account) -> bool {
        let envelope = Envelope {
            version: PROTOCOL_VERSION,
            id: u64::MAX,
            reply: false,
            sender: Some(self.local().to_proto()),
            payload: Some(Payload::AllocationRequest(AllocationRequest {
                account: Some(account.to_network()),
                replication: u32::MAX,
                index: u32::MAX,
            })),
        };
        envelope.encoded_size() <= MAX_DATAGRAM_SIZE
    }

    /// Replicate a record on up to `replication` of the peers closest to `id`.
    ///
    /// Returns the peers that accepted it, possibly fewer than asked for.
    pub async fn allocate(&self, id: &Hash, replication: u32, account: &Account) -> Vec<NodeAddr> {
        if !self.fits_in_datagram(account) {
            warn!(account = %short_hex(id), "record too large for a datagram, not allocating");
            return Vec::new();
        }
        let candidates = Arc::new(self.find_closest_nodes(id).await);
        let next = Arc::new(AtomicUsize::new(0));
        let network = account.to_network();

        let mut workers = JoinSet::new();
        for index in 0..replication {
            let node = self.clone();
            let candidates = candidates.clone();
            let next = next.clone();
            let network = network.clone();
            workers.spawn(
                async move {
                    loop {
                        let peer = candidates.get(next.fetch_add(1, Ordering::SeqCst))?;
                        match node
                            .request_allocation(peer, network.clone(), replication, index)
                            .await
                        {
                            Ok(()) => return Some(*peer),
                            Err(reason) => debug!(peer = %peer, %reason, "allocation refused"),
                        }
                    }
                }
                .instrument(self.span().clone()),
            );
        }

        let mut allocations = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Some(peer)) => allocations.push(peer),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "allocation worker failed"),
            }
        }

        debug!(
            account = %short_hex(id),
            allocated = allocations.len(),
            replication,
            "allocation finished"
        );
        allocations
    }

    async fn request_fetch(&self, peer: &NodeAddr, id: &Hash) -> Option<Account> {
        let payload = Payload::FetchRequest(FetchRequest { id: id.to_vec() });
        let reply = self
            .inner
            .messenger
            .send_request(payload, peer.addr, self.inner.config.max_retries)
            .await?;
        match reply.payload {
            Some(Payload::FetchReply(rep)) => rep.account.and_then(|a| Account::from_network(a).ok()),
            _ => {
                warn!(peer = %peer, "unexpected reply to fetch");
                None
            }
        }
    }

    /// Quorum read with the configured acceptance threshold
    pub async fn fetch(&self, id: &Hash) -> Option<Account> {
        self.fetch_data(id, self.inner.config.threshold).await
    }

    /// Quorum read of a record.
    ///
    /// Replicas are queried by `replication` workers. As soon as
    /// `ceil(threshold * replication)` verified copies agree, that copy is
    /// returned; otherwise the most represented verified copy, if any. Our
    /// own stored copy counts as one answer, but never settles the read on
    /// its own while replicas can still be asked, and loses ties against them.
    pub async fn fetch_data(&self, id: &Hash, threshold: f64) -> Option<Account> {
        let min = quorum(threshold, self.inner.config.replication);
        let local = self.inner.store.get(id);
        let candidates = self.find_closest_nodes(id).await;
        self.fetch_from(id, candidates, min, local).await
    }

    /// Query `candidates` in order until `min` verified copies agree
    async fn fetch_from(
        &self,
        id: &Hash,
        candidates: Vec<NodeAddr>,
        min: usize,
        local: Option<Account>,
    ) -> Option<Account> {
        let state = Arc::new(Mutex::new(FetchState {
            local,
            ..FetchState::default()
        }));
        let candidates = Arc::new(candidates);
        let next = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(Notify::new());

        let mut workers = JoinSet::new();
        for _ in 0..self.inner.config.replication {
            let node = self.clone();
            let candidates = candidates.clone();
            let next = next.clone();
            let state = state.clone();
            let finished = finished.clone();
            let id = *id;
            workers.spawn(
                async move {
                    loop {
                        if lock(&state).done {
                            return;
                        }
                        let Some(peer) = candidates.get(next.fetch_add(1, Ordering::SeqCst)) else {
                            return;
                        };
                        let Some(account) = node.request_fetch(peer, &id).await else {
                            continue;
                        };

                        let mut guard = lock(&state);
                        guard.results.push(account);
                        if guard.done {
                            return;
                        }
                        if let (Some(account), true) = guard.tally(min) {
                            guard.done = true;
                            guard.winner = Some(account);
                            finished.notify_one();
                            return;
                        }
                    }
                }
                .instrument(self.span().clone()),
            );
        }

        tokio::select! {
            _ = finished.notified() => {}
            _ = async { while workers.join_next().await.is_some() {} } => {}
        }
        // Workers still waiting on a reply finish on their own
        workers.detach_all();

        let guard = lock(&state);
        if let Some(winner) = &guard.winner {
            debug!(account = %short_hex(id), answers = guard.results.len(), "fetch reached quorum");
            return Some(winner.clone());
        }
        let (best, _) = guard.tally(min);
        if best.is_some() {
            debug!(account = %short_hex(id), answers = guard.results.len(), "fetch below quorum");
        }
        best
    }

    /// Store a record on this node and schedule its republication
    pub fn store_account(&self, account: Account, replication: u32) -> std::result::Result<(), StoreError> {
        let (id, version) = (account.id, account.version);
        self.inner.store.store(account, replication)?;
        self.schedule_republish(id, version, replication);
        Ok(())
    }

    fn schedule_republish(&self, id: Hash, version: u64, replication: u32) {
        if !self.inner.config.republish {
            return;
        }
        let bound = 2 * replication.max(1) as u64 * self.inner.config.republish_interval.as_millis() as u64;
        let delay = Duration::from_millis(random_below(bound));
        let node = self.clone();
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                node.republish(id, version).await;
            }
            .instrument(self.span().clone()),
        );
    }

    /// Hand a stored record over to the peers currently closest to it.
    ///
    /// Skipped if the record changed since `version`. If no peer takes it,
    /// the record is kept locally. Returns the number of allocations made.
    pub async fn republish(&self, id: Hash, version: u64) -> Option<usize> {
        let Some(info) = self.inner.store.remove_if_version(&id, version) else {
            debug!(account = %short_hex(&id), version, "record changed, skipping republish");
            return None;
        };

        let allocations = self.allocate(&id, info.replication, &info.account).await;
        if allocations.len() < info.replication as usize {
            warn!(
                account = %short_hex(&id),
                allocated = allocations.len(),
                replication = info.replication,
                "republished record is under-replicated"
            );
        } else {
            info!(account = %short_hex(&id), "republished record");
        }

        if allocations.is_empty() {
            if let Err(e) = self.store_account(info.account, info.replication) {
                debug!(account = %short_hex(&id), error = %e, "record not restored");
            }
        }
        Some(allocations.len())
    }

    /// Join the DHT through the given seed peers.
    ///
    /// Without seeds the node starts a fresh DHT. Otherwise every seed is
    /// pinged and, if any answers, a lookup of our own ID fills the routing
    /// table. Returns false if no seed answered; the node then runs alone.
    pub async fn join(&self, seeds: &[SocketAddr]) -> bool {
        if seeds.is_empty() {
            info!("no bootstrap peers, starting a new DHT");
            return true;
        }

        let mut pings = JoinSet::new();
        for &seed in seeds {
            let node = self.clone();
            pings.spawn(async move { node.ping(seed).await }.instrument(self.span().clone()));
        }

        let mut alive = 0;
        while let Some(joined) = pings.join_next().await {
            if let Ok(Some(peer)) = joined {
                self.add_peer(peer).await;
                alive += 1;
            }
        }

        if alive == 0 {
            warn!("no bootstrap peer answered, starting a new DHT");
            return false;
        }

        let found = self.find_closest_nodes(&self.node_id()).await;
        for peer in found {
            self.add_peer(peer).await;
        }
        info!(seeds_alive = alive, peers = self.inner.routing.len(), "joined DHT");
        debug!("routing table\n{}", diagnostics::format_routing_table(&self.inner.routing));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::signed;
    use passtor_core::{account_id, HASH_SIZE};
    use tokio::net::UdpSocket;

    fn test_config() -> DhtConfig {
        DhtConfig {
            timeout: Duration::from_millis(100),
            max_retries: 1,
            republish: false,
            ..DhtConfig::default()
        }
    }

    async fn spawn_node(name: &str, id: Hash) -> DhtNode {
        let node = DhtNode::bind_with_id(name, id, "127.0.0.1:0".parse().unwrap(), test_config())
            .await
            .unwrap();
        node.spawn_listener();
        node
    }

    /// IDs split 5/5 on the top bit so that no bucket of any node overflows
    fn balanced_id(i: usize) -> Hash {
        const FIRST: [u8; 10] = [0x08, 0x28, 0x48, 0x58, 0x68, 0x88, 0xa8, 0xc8, 0xd8, 0xe8];
        let mut id = [i as u8; HASH_SIZE];
        id[0] = FIRST[i];
        id
    }

    async fn full_mesh(n: usize) -> Vec<DhtNode> {
        let mut nodes = Vec::new();
        for i in 0..n {
            nodes.push(spawn_node(&format!("node{i}"), balanced_id(i)).await);
        }
        for a in &nodes {
            for b in &nodes {
                a.add_peer(b.local()).await;
            }
        }
        nodes
    }

    /// A peer that never answers
    async fn silent_peer(seed: u8) -> (UdpSocket, NodeAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddr::new(socket.local_addr().unwrap(), passtor_core::hash(&[seed]));
        (socket, addr)
    }

    fn status(first: u8, failed: bool) -> LookupStatus {
        let mut id = [0u8; HASH_SIZE];
        id[0] = first;
        LookupStatus {
            node: NodeAddr::new("127.0.0.1:1".parse().unwrap(), id),
            tested: true,
            failed,
        }
    }

    #[test]
    fn test_rank_puts_live_nodes_first() {
        let target = [0u8; HASH_SIZE];
        let mut candidates = vec![status(0x01, true), status(0x40, false), status(0x02, false)];
        rank(&mut candidates, &target);
        let firsts: Vec<u8> = candidates.iter().map(|c| c.node.node_id[0]).collect();
        assert_eq!(firsts, vec![0x02, 0x40, 0x01]);
    }

    #[test]
    fn test_merge_skips_self_and_duplicates() {
        let local = [9u8; HASH_SIZE];
        let known = status(0x01, false);
        let mut candidates = vec![known.clone()];
        let fresh = status(0x02, false).node;
        merge(
            &mut candidates,
            vec![known.node, fresh, NodeAddr::new("127.0.0.1:2".parse().unwrap(), local)],
            &local,
        );
        assert_eq!(candidates.len(), 2);
        assert!(!candidates[1].tested);
    }

    #[test]
    fn test_claim_untested_only_within_k_best() {
        let target = [0u8; HASH_SIZE];
        let mut candidates = vec![status(0x01, false), status(0x02, false), status(0x03, false)];
        candidates[2].tested = false;
        assert_eq!(claim_untested(&mut candidates, &target, 2), None);
        assert_eq!(claim_untested(&mut candidates, &target, 3).map(|n| n.node_id[0]), Some(0x03));
        assert_eq!(claim_untested(&mut candidates, &target, 3), None);
    }

    #[tokio::test]
    async fn test_ping_and_routing_population() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;

        let pong = a.ping(b.local().addr).await.expect("b answers");
        assert_eq!(pong.node_id, b.node_id());

        // b learned about a from the request
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.routing().contains(&a.node_id()));
    }

    #[tokio::test]
    async fn test_malformed_packet_does_not_stop_listener() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.send_to(&[0xff, 0x00, 0x13, 0x37], b.local().addr).await.unwrap();

        assert!(a.ping(b.local().addr).await.is_some());
    }

    #[tokio::test]
    async fn test_find_closest_nodes_on_full_mesh() {
        let nodes = full_mesh(10).await;
        let target = passtor_core::hash(b"some target");

        let mut expected: Vec<NodeAddr> = nodes[1..].iter().map(|n| n.local()).collect();
        expected.sort_by_key(|n| xor_distance(&n.node_id, &target));
        expected.truncate(5);

        let found = nodes[0].find_closest_nodes_detailed(&target).await;
        assert_eq!(found.len(), 5);
        assert!(found.iter().all(|c| !c.failed));
        let found: Vec<NodeAddr> = found.into_iter().map(|c| c.node).collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_lookup_keeps_failed_nodes_last() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        let (_silent, dead) = silent_peer(1).await;
        a.routing().insert(b.local());
        a.routing().insert(dead);

        let found = a.find_closest_nodes_detailed(&dead.node_id).await;
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].node.node_id, b.node_id());
        assert!(!found[0].failed);
        assert_eq!(found[1].node, dead);
        assert!(found[1].failed);
    }

    #[tokio::test]
    async fn test_allocate_with_unreachable_peers() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        let c = spawn_node("c", passtor_core::hash(b"c")).await;
        let mut silent = Vec::new();
        for seed in 0..3 {
            let (socket, addr) = silent_peer(seed).await;
            a.routing().insert(addr);
            silent.push(socket);
        }
        a.routing().insert(b.local());
        a.routing().insert(c.local());
        assert_eq!(a.routing().len(), 5);

        let account = signed("alice", 1, 1);
        let allocations = a.allocate(&account.id, 3, &account).await;

        assert_eq!(allocations.len(), 2);
        assert!(allocations.iter().any(|n| n.node_id == b.node_id()));
        assert!(allocations.iter().any(|n| n.node_id == c.node_id()));
        assert_eq!(b.store().get(&account.id), Some(account.clone()));
        assert_eq!(c.store().get(&account.id), Some(account));
        assert_eq!(a.messenger().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_allocation_refusals_travel_back() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        a.routing().insert(b.local());

        b.store().store(signed("alice", 5, 1), 1).unwrap();

        let hijack = signed("alice", 6, 2);
        let result = a.request_allocation(&b.local(), hijack.to_network(), 1, 0).await;
        assert_eq!(result, Err("public key changed".to_string()));

        let stale = signed("alice", 4, 1);
        let result = a.request_allocation(&b.local(), stale.to_network(), 1, 0).await;
        assert_eq!(result, Err("already stored".to_string()));

        let mut forged = signed("alice", 7, 1);
        forged.version = 8;
        let result = a.request_allocation(&b.local(), forged.to_network(), 1, 0).await;
        assert_eq!(result, Err("does not verify".to_string()));

        // Same copy again is acknowledged
        let same = signed("alice", 5, 1);
        assert_eq!(a.request_allocation(&b.local(), same.to_network(), 1, 0).await, Ok(()));
    }

    #[tokio::test]
    async fn test_fetch_prefers_majority() {
        let nodes = full_mesh(4).await;
        let old = signed("alice", 1, 1);
        let new = signed("alice", 2, 1);
        nodes[1].store().store(old, 3).unwrap();
        nodes[2].store().store(new.clone(), 3).unwrap();
        nodes[3].store().store(new.clone(), 3).unwrap();

        assert_eq!(nodes[0].fetch(&new.id).await, Some(new));
    }

    #[tokio::test]
    async fn test_fetch_below_quorum_returns_best_copy() {
        let nodes = full_mesh(3).await;
        let account = signed("alice", 1, 1);
        nodes[1].store().store(account.clone(), 3).unwrap();

        assert_eq!(nodes[0].fetch(&account.id).await, Some(account));
        assert_eq!(nodes[0].fetch(&account_id("nobody")).await, None);
    }

    #[tokio::test]
    async fn test_fetch_counts_local_copy() {
        let node = spawn_node("alone", passtor_core::hash(b"alone")).await;
        let account = signed("alice", 1, 1);
        node.store().store(account.clone(), 1).unwrap();
        assert_eq!(node.fetch_data(&account.id, 0.3).await, Some(account));
    }

    fn bulky(keys_len: usize) -> Account {
        let mut account = Account::new(account_id("bulky"), vec![7u8; keys_len]);
        account.version = 1;
        account.sign(&ed25519_dalek::SigningKey::from_bytes(&[3u8; 32]))
    }

    #[tokio::test]
    async fn test_large_record_allocates_and_fetches() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        a.routing().insert(b.local());

        let account = bulky(10_000);
        assert!(a.fits_in_datagram(&account));
        let allocations = a.allocate(&account.id, 1, &account).await;
        assert_eq!(allocations.len(), 1);
        assert_eq!(b.store().get(&account.id), Some(account.clone()));

        assert_eq!(a.fetch(&account.id).await, Some(account));
    }

    #[tokio::test]
    async fn test_oversized_record_is_not_allocated() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        a.routing().insert(b.local());

        let account = bulky(70_000);
        assert!(!a.fits_in_datagram(&account));
        assert!(a.allocate(&account.id, 1, &account).await.is_empty());
        assert!(b.store().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_returns_at_quorum_without_waiting_for_silent_replica() {
        let config = DhtConfig {
            timeout: Duration::from_millis(500),
            ..test_config()
        };
        let mut nodes = Vec::new();
        for name in ["a", "b", "c"] {
            let node = DhtNode::bind(name, "127.0.0.1:0".parse().unwrap(), config.clone())
                .await
                .unwrap();
            node.spawn_listener();
            nodes.push(node);
        }
        let account = signed("alice", 1, 1);
        nodes[1].store().store(account.clone(), 3).unwrap();
        nodes[2].store().store(account.clone(), 3).unwrap();
        let (slow, slow_addr) = silent_peer(1).await;
        let (unused, unused_addr) = silent_peer(2).await;

        // Three workers claim b, c and the silent peer; two answers make the quorum
        let candidates = vec![nodes[1].local(), nodes[2].local(), slow_addr, unused_addr];
        let started = tokio::time::Instant::now();
        let fetched = nodes[0].fetch_from(&account.id, candidates, 2, None).await;
        let elapsed = started.elapsed();

        assert_eq!(fetched, Some(account));
        assert!(elapsed < Duration::from_millis(400), "fetch took {elapsed:?}");

        // Let the in-flight request to the silent peer run out
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let mut buf = [0u8; 512];
        let wait = Duration::from_millis(50);
        assert!(tokio::time::timeout(wait, slow.recv_from(&mut buf)).await.is_ok());
        assert!(tokio::time::timeout(wait, unused.recv_from(&mut buf)).await.is_err());
        assert_eq!(nodes[0].messenger().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_fetch_prefers_replicas_over_stale_local_copy() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        a.routing().insert(b.local());

        let stale = signed("alice", 1, 1);
        let fresh = signed("alice", 2, 1);
        a.store().store(stale, 3).unwrap();
        b.store().store(fresh.clone(), 3).unwrap();

        // A quorum of one: the local copy alone must not settle the read
        assert_eq!(a.fetch_data(&fresh.id, 0.3).await, Some(fresh));
    }

    /// IDs in bucket 0 of a node whose ID starts with a zero bit
    fn far_id(i: u8) -> Hash {
        let mut id = [i; HASH_SIZE];
        id[0] = 0x80 | i;
        id
    }

    #[tokio::test]
    async fn test_full_bucket_keeps_live_tail() {
        let a = spawn_node("a", [0u8; HASH_SIZE]).await;
        let live = spawn_node("live", far_id(1)).await;
        a.routing().insert(live.local());

        let mut silent = Vec::new();
        for i in 2..6 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            a.routing().insert(NodeAddr::new(socket.local_addr().unwrap(), far_id(i)));
            silent.push(socket);
        }
        assert_eq!(a.routing().len(), 5);

        let newcomer = NodeAddr::new("127.0.0.1:9".parse().unwrap(), far_id(9));
        a.add_peer(newcomer).await;

        assert!(a.routing().contains(&live.node_id()));
        assert!(!a.routing().contains(&newcomer.node_id));
        assert_eq!(a.routing().len(), 5);
    }

    #[tokio::test]
    async fn test_full_bucket_replaces_dead_tail() {
        let a = spawn_node("a", [0u8; HASH_SIZE]).await;
        let (_dead_socket, dead) = silent_peer(0).await;
        let dead = NodeAddr::new(dead.addr, far_id(1));
        a.routing().insert(dead);

        let live = spawn_node("live", far_id(2)).await;
        a.routing().insert(live.local());
        let mut silent = Vec::new();
        for i in 3..6 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            a.routing().insert(NodeAddr::new(socket.local_addr().unwrap(), far_id(i)));
            silent.push(socket);
        }
        assert_eq!(a.routing().len(), 5);

        let newcomer = NodeAddr::new("127.0.0.1:9".parse().unwrap(), far_id(9));
        a.add_peer(newcomer).await;

        assert!(a.routing().contains(&newcomer.node_id));
        assert!(!a.routing().contains(&dead.node_id));
        assert!(a.routing().contains(&live.node_id()));
        assert_eq!(a.routing().len(), 5);
    }

    #[tokio::test]
    async fn test_allocation_replication_is_clamped() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;

        let alice = signed("alice", 1, 1);
        let bob = signed("bob", 1, 1);
        assert_eq!(a.request_allocation(&b.local(), alice.to_network(), 1_000_000, 0).await, Ok(()));
        assert_eq!(a.request_allocation(&b.local(), bob.to_network(), 0, 0).await, Ok(()));

        assert_eq!(b.store().get_info(&alice.id).unwrap().replication, 5);
        assert_eq!(b.store().get_info(&bob.id).unwrap().replication, 1);
    }

    #[tokio::test]
    async fn test_join_through_seed() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        let c = spawn_node("c", passtor_core::hash(b"c")).await;

        assert!(a.join(&[]).await);
        assert!(b.join(&[a.local().addr]).await);
        assert!(c.join(&[a.local().addr]).await);

        assert!(c.routing().contains(&a.node_id()));
        assert!(c.routing().contains(&b.node_id()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.routing().contains(&c.node_id()));
    }

    #[tokio::test]
    async fn test_join_with_dead_seed_starts_alone() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let (_silent, dead) = silent_peer(9).await;
        assert!(!a.join(&[dead.addr]).await);
        assert!(a.routing().is_empty());
    }

    #[tokio::test]
    async fn test_republish_hands_record_over() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let b = spawn_node("b", passtor_core::hash(b"b")).await;
        a.routing().insert(b.local());

        let account = signed("alice", 3, 1);
        a.store_account(account.clone(), 1).unwrap();

        assert_eq!(a.republish(account.id, 2).await, None);
        assert!(a.store().get(&account.id).is_some());

        assert_eq!(a.republish(account.id, 3).await, Some(1));
        assert!(a.store().get(&account.id).is_none());
        assert_eq!(b.store().get(&account.id), Some(account));
    }

    #[tokio::test]
    async fn test_republish_without_peers_keeps_record() {
        let a = spawn_node("a", passtor_core::hash(b"a")).await;
        let account = signed("alice", 1, 1);
        a.store_account(account.clone(), 2).unwrap();

        assert_eq!(a.republish(account.id, 1).await, Some(0));
        assert_eq!(a.store().get(&account.id), Some(account));
    }
}
