//! Event intake: classification, duplicate suppression and per-session
//! dispatch.
//!
//! Everything that can change a session arrives through one inbox as an
//! [`Inbound`] message. Log entries are classified against the topic table,
//! then handed to a sequential lane for their contract address, so one
//! session never runs two handlers at once while different sessions
//! interleave freely.

use crate::abi;
use crate::config::TopicTable;
use crate::error::{FairSlotError, Result};
use crate::ledger::{EventFilter, LedgerClient};
use crate::session::{Command, EventGuards, Session, Step};
use crate::settlement;
use crate::storage::SessionStore;
use crate::types::{Address, Digest, Event, EventKind, EventPayload, LogEntry, TxId};
use crate::CHAIN_COUNT;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const INBOX_CAPACITY: usize = 256;

/// Messages accepted by the router.
#[derive(Debug)]
pub enum Inbound {
    Log(LogEntry),
    Tick,
    Shutdown,
}

/// Decode a raw log entry. Unknown topics and malformed payloads yield
/// `None`; neither is an error for the caller.
pub fn classify(table: &TopicTable, scale: u32, entry: &LogEntry) -> Option<Event> {
    let topic = entry.topics.first()?;
    let kind = match table.kind_of(topic) {
        Some(kind) => kind,
        None => {
            tracing::trace!("Ignoring unknown topic {} from {}", topic, entry.address);
            return None;
        }
    };

    match decode_payload(kind, &entry.data, scale) {
        Ok(payload) => Some(Event {
            address: entry.address,
            kind,
            transaction_id: entry.transaction_id.clone(),
            payload,
        }),
        Err(e) => {
            tracing::warn!(
                "Dropping malformed {} from {} (tx {}): {}",
                kind,
                entry.address,
                entry.transaction_id,
                e
            );
            None
        }
    }
}

fn decode_payload(kind: EventKind, data: &[u8], scale: u32) -> Result<EventPayload> {
    let digests = |data: &[u8], offset: usize| -> Result<[Digest; CHAIN_COUNT]> {
        let mut out = [Digest::ZERO; CHAIN_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = abi::read_digest(data, offset + i)?;
        }
        Ok(out)
    };

    let payload = match kind {
        EventKind::Occupied => {
            abi::expect_words(data, 1 + CHAIN_COUNT)?;
            EventPayload::Occupied {
                player: abi::read_address(data, 0)?,
                commitments: digests(data, 1)?,
            }
        }
        EventKind::BankerSeedInit => {
            abi::expect_words(data, CHAIN_COUNT)?;
            EventPayload::BankerSeedInit {
                commitments: digests(data, 0)?,
            }
        }
        EventKind::GameInitialized => {
            abi::expect_words(data, 4)?;
            let lines = u32::try_from(abi::read_u128(data, 2)?)
                .map_err(|_| FairSlotError::decode("Line count exceeds 32 bits"))?;
            EventPayload::GameInitialized {
                player: abi::read_address(data, 0)?,
                bet: abi::read_u128(data, 1)?,
                lines,
                chain_index: abi::read_chain_index(data, 3)?,
            }
        }
        EventKind::BankerSeedSet | EventKind::PlayerSeedSet => {
            abi::expect_words(data, 2)?;
            EventPayload::SeedSet {
                preimage: abi::read_digest(data, 0)?,
                chain_index: abi::read_chain_index(data, 1)?,
            }
        }
        EventKind::Confirmed => EventPayload::Confirmed(settlement::decode(data, scale)?),
        EventKind::PlayerLeft => EventPayload::PlayerLeft,
    };

    Ok(payload)
}

/// Duplicate check. Records the event in `guards` and returns `true` the
/// first time it is seen; later deliveries return `false`.
pub fn admit(guards: &mut EventGuards, event: &Event) -> bool {
    if guards.has_seen(event.kind, &event.transaction_id) {
        return false;
    }

    match event.kind {
        EventKind::Occupied => {
            if guards.occupied_handled() {
                return false;
            }
            guards.set_occupied_handled();
        }
        EventKind::Confirmed => {
            let chain_index = event.chain_index();
            if chain_index.is_some() && chain_index == guards.last_confirmed_chain() {
                return false;
            }
            if let Some(chain_index) = chain_index {
                guards.set_last_confirmed_chain(chain_index);
            }
        }
        _ => {}
    }

    guards.mark_seen(event.kind, event.transaction_id.clone());
    true
}

/// Receiver of routed events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Whether events for `address` should be delivered at all.
    fn watches(&self, address: &Address) -> bool;

    async fn on_event(&self, event: Event);

    async fn on_tick(&self) {}
}

pub struct EventRouter {
    table: TopicTable,
    scale: u32,
    handler: Arc<dyn EventHandler>,
    lanes: HashMap<Address, mpsc::UnboundedSender<Event>>,
    workers: Vec<JoinHandle<()>>,
    sweep: Option<JoinHandle<()>>,
}

impl EventRouter {
    pub fn new(table: TopicTable, scale: u32, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            table,
            scale,
            handler,
            lanes: HashMap::new(),
            workers: Vec::new(),
            sweep: None,
        }
    }

    /// Process the inbox until it closes or a `Shutdown` arrives.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Inbound>) {
        while let Some(message) = inbox.recv().await {
            match message {
                Inbound::Log(entry) => self.dispatch(entry),
                Inbound::Tick => self.tick(),
                Inbound::Shutdown => {
                    tracing::debug!("Router shutdown requested");
                    break;
                }
            }
        }

        // closing the lanes lets each worker drain and exit
        self.lanes.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        if let Some(sweep) = self.sweep.take() {
            let _ = sweep.await;
        }
    }

    fn dispatch(&mut self, entry: LogEntry) {
        if !self.handler.watches(&entry.address) {
            return;
        }
        let Some(event) = classify(&self.table, self.scale, &entry) else {
            return;
        };

        let address = event.address;
        if let Some(lane) = self.lanes.get(&address) {
            if let Err(mpsc::error::SendError(event)) = lane.send(event) {
                tracing::warn!("Lane for {} closed, dropping {}", address, event.kind);
            }
            return;
        }

        let (lane, mut rx) = mpsc::unbounded_channel::<Event>();
        let handler = self.handler.clone();
        self.workers.push(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.on_event(event).await;
            }
        }));
        let _ = lane.send(event);
        self.lanes.insert(address, lane);
    }

    fn tick(&mut self) {
        if let Some(previous) = &self.sweep {
            if !previous.is_finished() {
                tracing::debug!("Previous idle sweep still running, skipping tick");
                return;
            }
        }

        let handler = self.handler.clone();
        self.sweep = Some(tokio::spawn(async move {
            handler.on_tick().await;
        }));
    }
}

/// Handle to a running router and its feeder tasks.
pub struct RouterHandle {
    sender: mpsc::Sender<Inbound>,
    router: JoinHandle<()>,
    feeders: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Inbox sender, for injecting entries or ticks directly.
    pub fn sender(&self) -> mpsc::Sender<Inbound> {
        self.sender.clone()
    }

    pub async fn shutdown(self) {
        for feeder in &self.feeders {
            feeder.abort();
        }
        let _ = self.sender.send(Inbound::Shutdown).await;
        let _ = self.router.await;
    }
}

/// Subscribe through `ledger`, and start the router with a feeder task and,
/// when `tick_every` is set, an idle ticker sharing the same inbox.
pub async fn spawn(
    handler: Arc<dyn EventHandler>,
    ledger: &dyn LedgerClient,
    filter: EventFilter,
    table: TopicTable,
    scale: u32,
    tick_every: Option<Duration>,
) -> Result<RouterHandle> {
    let mut stream = ledger.subscribe(filter).await?;
    let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);

    let mut feeders = Vec::new();

    let tx = sender.clone();
    feeders.push(tokio::spawn(async move {
        while let Some(entry) = stream.next().await {
            if tx.send(Inbound::Log(entry)).await.is_err() {
                break;
            }
        }
        tracing::debug!("Ledger subscription ended");
    }));

    if let Some(period) = tick_every {
        let tx = sender.clone();
        feeders.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Inbound::Tick).await.is_err() {
                    break;
                }
            }
        }));
    }

    let router = tokio::spawn(EventRouter::new(table, scale, handler).run(inbox));

    Ok(RouterHandle {
        sender,
        router,
        feeders,
    })
}

/// Apply one event to its session under the per-address lock.
///
/// The transition runs on a working copy. Its commands are sent before the
/// copy is committed, so a transport failure leaves the session exactly as
/// it was. A fatal transition error commits the session as aborted.
pub(crate) async fn drive<U, F>(
    store: &SessionStore,
    ledger: &dyn LedgerClient,
    event: &Event,
    transition: F,
) -> Result<Vec<U>>
where
    F: FnOnce(&mut Session, &Event) -> Result<Step<U>>,
{
    let guard = store.lock(&event.address).await?;
    let mut working = guard.snapshot();

    if working.is_aborted() && event.kind != EventKind::PlayerLeft {
        tracing::debug!(
            "Session {} is aborted, ignoring {}",
            event.address,
            event.kind
        );
        return Ok(Vec::new());
    }

    if !admit(&mut working.guards, event) {
        tracing::debug!(
            "Discarding duplicate {} for {} (tx {})",
            event.kind,
            event.address,
            event.transaction_id
        );
        return Ok(Vec::new());
    }

    match transition(&mut working, event) {
        Ok(step) => {
            execute(ledger, &event.address, &step.commands).await?;
            guard.commit(working).await?;
            Ok(step.updates)
        }
        Err(e) if e.is_fatal() => {
            let mut aborted = guard.snapshot();
            admit(&mut aborted.guards, event);
            aborted.abort(e.to_string());
            tracing::warn!("Session {} aborted: {}", event.address, e);
            guard.commit(aborted).await?;
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Send commands to the ledger in order, stopping at the first failure.
pub(crate) async fn execute(
    ledger: &dyn LedgerClient,
    address: &Address,
    commands: &[Command],
) -> Result<Vec<TxId>> {
    let mut submitted = Vec::with_capacity(commands.len());
    for command in commands {
        let tx = match command {
            Command::CommitSeeds(commitments) => {
                ledger.submit_seed_commit(address, *commitments).await?
            }
            Command::RevealSeed {
                preimage,
                chain_index,
            } => {
                ledger
                    .submit_seed_reveal(address, *preimage, *chain_index)
                    .await?
            }
        };
        tracing::debug!("Submitted {:?} for {} as {}", command, address, tx);
        submitted.push(tx);
    }
    Ok(submitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::settlement::Settlement;
    use rust_decimal::Decimal;

    fn table() -> TopicTable {
        ProtocolConfig::default().topic_table().unwrap()
    }

    fn entry(kind: EventKind, data: Vec<u8>, tx: &str) -> LogEntry {
        LogEntry {
            address: Address([1u8; 20]),
            topics: vec![table().topic_for(kind)],
            data,
            transaction_id: TxId::new(tx),
        }
    }

    fn confirmed(chain_index: usize, tx: &str) -> Event {
        Event {
            address: Address([1u8; 20]),
            kind: EventKind::Confirmed,
            transaction_id: TxId::new(tx),
            payload: EventPayload::Confirmed(Settlement {
                payout: Decimal::ZERO,
                raw: 0,
                chain_index,
            }),
        }
    }

    #[test]
    fn test_classify_decodes_payloads() {
        let player = Address([9u8; 20]);
        let data = abi::pack(&[
            abi::encode_address(&player),
            [1u8; 32],
            [2u8; 32],
            [3u8; 32],
        ]);
        let event = classify(&table(), 18, &entry(EventKind::Occupied, data, "0x1")).unwrap();
        assert_eq!(
            event.payload,
            EventPayload::Occupied {
                player,
                commitments: [Digest([1u8; 32]), Digest([2u8; 32]), Digest([3u8; 32])],
            }
        );

        let data = abi::pack(&[[7u8; 32], abi::encode_u128(2)]);
        let event = classify(&table(), 18, &entry(EventKind::BankerSeedSet, data, "0x2")).unwrap();
        assert_eq!(event.kind, EventKind::BankerSeedSet);
        assert_eq!(event.chain_index(), Some(2));

        let event = classify(&table(), 18, &entry(EventKind::PlayerLeft, Vec::new(), "0x3")).unwrap();
        assert_eq!(event.payload, EventPayload::PlayerLeft);
    }

    #[test]
    fn test_classify_drops_unknown_and_malformed() {
        let mut unknown = entry(EventKind::Confirmed, Vec::new(), "0x1");
        unknown.topics = vec![Digest([5u8; 32])];
        assert!(classify(&table(), 18, &unknown).is_none());

        let mut untagged = entry(EventKind::Confirmed, Vec::new(), "0x1");
        untagged.topics.clear();
        assert!(classify(&table(), 18, &untagged).is_none());

        let short = entry(EventKind::Confirmed, vec![0u8; 32], "0x2");
        assert!(classify(&table(), 18, &short).is_none());

        let bad_index = abi::pack(&[[7u8; 32], abi::encode_u128(5)]);
        let bad = entry(EventKind::PlayerSeedSet, bad_index, "0x3");
        assert!(classify(&table(), 18, &bad).is_none());
    }

    #[test]
    fn test_admit_suppresses_duplicates() {
        let mut guards = EventGuards::default();

        assert!(admit(&mut guards, &confirmed(0, "0xa")));
        assert!(!admit(&mut guards, &confirmed(0, "0xa")));
        // same chain under a fresh tx id is still a repeat
        assert!(!admit(&mut guards, &confirmed(0, "0xb")));
        assert!(admit(&mut guards, &confirmed(1, "0xc")));
        // tx id check wins even when the chain changed
        assert!(!admit(&mut guards, &confirmed(2, "0xc")));
    }

    #[test]
    fn test_admit_occupied_once_per_tenancy() {
        let mut guards = EventGuards::default();
        let occupied = |tx: &str| Event {
            address: Address([1u8; 20]),
            kind: EventKind::Occupied,
            transaction_id: TxId::new(tx),
            payload: EventPayload::Occupied {
                player: Address([2u8; 20]),
                commitments: [Digest([1u8; 32]); CHAIN_COUNT],
            },
        };

        assert!(admit(&mut guards, &occupied("0x1")));
        assert!(!admit(&mut guards, &occupied("0x2")));
    }

    struct Recorder {
        watched: Address,
        events: parking_lot::Mutex<Vec<Event>>,
        ticks: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn watches(&self, address: &Address) -> bool {
            *address == self.watched
        }

        async fn on_event(&self, event: Event) {
            self.events.lock().push(event);
        }

        async fn on_tick(&self) {
            self.ticks
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_router_filters_and_orders() {
        let watched = Address([1u8; 20]);
        let recorder = Arc::new(Recorder {
            watched,
            events: parking_lot::Mutex::new(Vec::new()),
            ticks: std::sync::atomic::AtomicUsize::new(0),
        });
        let router = EventRouter::new(table(), 18, recorder.clone());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(router.run(rx));

        let seed_set = |chain: u128, tx: &str| {
            entry(
                EventKind::BankerSeedSet,
                abi::pack(&[[7u8; 32], abi::encode_u128(chain)]),
                tx,
            )
        };
        let mut stranger = seed_set(0, "0x0");
        stranger.address = Address([2u8; 20]);

        tx.send(Inbound::Log(seed_set(0, "0x1"))).await.unwrap();
        tx.send(Inbound::Log(stranger)).await.unwrap();
        tx.send(Inbound::Log(seed_set(1, "0x2"))).await.unwrap();
        tx.send(Inbound::Tick).await.unwrap();
        tx.send(Inbound::Shutdown).await.unwrap();
        task.await.unwrap();

        let events = recorder.events.lock();
        let indices: Vec<_> = events.iter().map(|e| e.chain_index()).collect();
        assert_eq!(indices, vec![Some(0), Some(1)]);
        assert_eq!(
            recorder.ticks.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
