//! The packet pipeline
//!
//! Per-peer packet order is preserved while AEAD work runs on a shared
//! worker pool: a nonce worker stamps each outbound packet with its counter
//! and enqueues it on BOTH the device-wide encryption channel and the peer's
//! sequential send queue; the sequential sender then awaits completions in
//! order. The inbound path mirrors this around the decryption pool. Bounded
//! queues drop their oldest item when full.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::device::index::IndexLookup;
use crate::device::peer::Peer;
use crate::device::pool::{BufferPool, PacketQueue, HEADER_RESERVE};
use crate::device::session::Session;
use crate::device::Device;
use crate::message::{classify, MessageType, Transport};

/// Shared AEAD channel depths
pub(crate) const ENCRYPT_QUEUE_SIZE: usize = 4096;
pub(crate) const DECRYPT_QUEUE_SIZE: usize = 4096;

/// Handshake queue depth; the under-load high-water mark derives from it
pub(crate) const HANDSHAKE_QUEUE_SIZE: usize = 1024;

/// Per-peer queue depth (nonce, ordered send, ordered receive)
const PEER_QUEUE_SIZE: usize = 512;

/// Timer tick granularity
const TIMER_TICK: Duration = Duration::from_millis(250);

/// A plaintext packet staged for a peer; payload at
/// `buf[HEADER_RESERVE..HEADER_RESERVE + len]`
pub(crate) struct OutboundItem {
    pub buf: Vec<u8>,
    pub len: usize,
}

/// Completion payload: the buffer comes back with Some(total/plaintext
/// length) on success or None when the item was dropped
type Completion = (Vec<u8>, Option<usize>);

pub(crate) struct EncryptJob {
    pub session: Arc<Session>,
    pub buf: Vec<u8>,
    pub len: usize,
    pub counter: u64,
    pub done: oneshot::Sender<Completion>,
}

pub(crate) struct DecryptJob {
    pub session: Arc<Session>,
    pub buf: Vec<u8>,
    pub len: usize,
    pub counter: u64,
    pub done: oneshot::Sender<Completion>,
}

pub(crate) struct HandshakeJob {
    pub data: Vec<u8>,
    pub src: SocketAddr,
}

/// Ordered send queue entry
pub(crate) struct SendEntry {
    pub done: oneshot::Receiver<Completion>,
    pub payload_len: usize,
}

/// Ordered receive queue entry
pub(crate) struct RecvEntry {
    pub done: oneshot::Receiver<Completion>,
    pub session: Arc<Session>,
    pub counter: u64,
    pub src: SocketAddr,
    pub datagram_len: usize,
}

/// A peer's work queues and its worker task handles
pub(crate) struct PeerQueues {
    pub nonce: PacketQueue<OutboundItem>,
    pub send_seq: PacketQueue<SendEntry>,
    pub recv_seq: PacketQueue<RecvEntry>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerQueues {
    pub fn shutdown(self, pool: &BufferPool) {
        self.nonce.close();
        self.send_seq.close();
        self.recv_seq.close();

        for item in self.nonce.flush() {
            pool.put(item.buf);
        }
        drop(self.send_seq.flush());
        drop(self.recv_seq.flush());

        for task in self.tasks {
            task.abort();
        }
    }
}

/// Extract the destination address of an inner IP packet
fn inner_dst(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[16..20].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[24..40].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Extract the source address of an inner IP packet
fn inner_src(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let octets: [u8; 4] = packet[12..16].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let octets: [u8; 16] = packet[8..24].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Spawn the device-wide tasks: TUN reader, UDP receivers, handshake worker,
/// AEAD worker pools, TUN event watcher, and maintenance tick
pub(crate) fn spawn_global_tasks(device: &Arc<Device>) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(tun_reader(Arc::clone(device))));
    tasks.push(tokio::spawn(udp_receiver(Arc::clone(device), true)));
    tasks.push(tokio::spawn(udp_receiver(Arc::clone(device), false)));
    tasks.push(tokio::spawn(handshake_worker(Arc::clone(device))));
    tasks.push(tokio::spawn(tun_event_watcher(Arc::clone(device))));
    tasks.push(tokio::spawn(maintenance(Arc::clone(device))));

    let workers = num_cpus::get().max(1);
    for _ in 0..workers {
        tasks.push(tokio::spawn(encrypt_worker(Arc::clone(device))));
        tasks.push(tokio::spawn(decrypt_worker(Arc::clone(device))));
    }

    tasks
}

/// Create and spawn one peer's sequential workers
pub(crate) fn start_peer_tasks(device: &Arc<Device>, peer: &Arc<Peer>) {
    let nonce = PacketQueue::new(PEER_QUEUE_SIZE);
    let send_seq = PacketQueue::new(PEER_QUEUE_SIZE);
    let recv_seq = PacketQueue::new(PEER_QUEUE_SIZE);

    let tasks = vec![
        tokio::spawn(nonce_worker(
            Arc::clone(device),
            Arc::clone(peer),
            nonce.clone(),
            send_seq.clone(),
        )),
        tokio::spawn(peer_sender(
            Arc::clone(device),
            Arc::clone(peer),
            send_seq.clone(),
        )),
        tokio::spawn(peer_receiver(
            Arc::clone(device),
            Arc::clone(peer),
            recv_seq.clone(),
        )),
        tokio::spawn(peer_timer(Arc::clone(device), Arc::clone(peer))),
    ];

    *peer.pipeline.lock() = Some(PeerQueues {
        nonce,
        send_seq,
        recv_seq,
        tasks,
    });
}

/// Stage an empty (keep-alive) packet on the peer's outbound path
pub(crate) fn queue_keepalive(device: &Arc<Device>, peer: &Arc<Peer>) {
    let Some(nonce) = peer.pipeline.lock().as_ref().map(|q| q.nonce.clone()) else {
        return;
    };
    let buf = device.pool.get();
    if let Some(dropped) = nonce.push(OutboundItem { buf, len: 0 }) {
        device.pool.put(dropped.buf);
    }
}

// === Outbound ==========================================================

async fn tun_reader(device: Arc<Device>) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let mut buf = device.pool.get();

        let read = tokio::select! {
            r = device.tun.read(&mut buf[HEADER_RESERVE..]) => r,
            _ = shutdown.changed() => {
                device.pool.put(buf);
                return;
            }
        };

        let len = match read {
            Ok(0) => {
                device.pool.put(buf);
                continue;
            }
            Ok(len) => len,
            Err(e) => {
                device.pool.put(buf);
                tracing::error!(error = %e, "TUN read failed; shutting down");
                let _ = device.shutdown_tx.send(true);
                return;
            }
        };

        if !device.up.load(Ordering::Relaxed) {
            device.pool.put(buf);
            continue;
        }

        let packet = &buf[HEADER_RESERVE..HEADER_RESERVE + len];
        let Some(dst) = inner_dst(packet) else {
            device.pool.put(buf);
            continue;
        };

        let Some(peer) = device.route(dst) else {
            tracing::debug!(%dst, "no peer for destination");
            device.pool.put(buf);
            continue;
        };

        if peer.endpoint().is_none() {
            tracing::debug!(peer = ?peer, "dropping packet: peer has no endpoint");
            device.pool.put(buf);
            continue;
        }

        let Some(nonce) = peer.pipeline.lock().as_ref().map(|q| q.nonce.clone()) else {
            device.pool.put(buf);
            continue;
        };
        if let Some(dropped) = nonce.push(OutboundItem { buf, len }) {
            device.pool.put(dropped.buf);
        }
    }
}

/// Per-peer worker: assigns nonces in arrival order, parking while no
/// usable key-pair exists
async fn nonce_worker(
    device: Arc<Device>,
    peer: Arc<Peer>,
    nonce: PacketQueue<OutboundItem>,
    send_seq: PacketQueue<SendEntry>,
) {
    let mut shutdown = device.shutdown_rx.clone();

    while let Some(OutboundItem { buf, len }) = nonce.pop().await {
        // Obtain a usable key-pair, triggering a handshake when none exists
        let mut gave_up = false;
        let assigned = loop {
            let now = Instant::now();
            let candidate = peer
                .sendable_session(now)
                .and_then(|s| s.try_next_counter(now).map(|c| (s, c)));
            if let Some(assigned) = candidate {
                break Some(assigned);
            }
            if gave_up {
                // The attempt was abandoned; this packet dies with it
                break None;
            }

            device.initiate_handshake(&peer, false).await;

            tokio::select! {
                _ = peer.wait_key_ready() => {}
                _ = shutdown.changed() => {
                    device.pool.put(buf);
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    gave_up = peer.timers.lock().handshake_attempt_started().is_none();
                }
            }
        };

        let Some((session, counter)) = assigned else {
            device.pool.put(buf);
            continue;
        };

        let now = Instant::now();
        if Device::needs_rekey_after_send(&session, counter, now) {
            device.initiate_handshake(&peer, false).await;
        }

        let (done_tx, done_rx) = oneshot::channel();

        // The sequential enqueue preserves order; the pool enqueue
        // dispatches the CPU work.
        send_seq.push(SendEntry {
            done: done_rx,
            payload_len: len,
        });

        let job = EncryptJob {
            session,
            buf,
            len,
            counter,
            done: done_tx,
        };
        if let Err(e) = device.encrypt_tx.send_async(job).await {
            device.pool.put(e.into_inner().buf);
            return;
        }
    }
}

async fn encrypt_worker(device: Arc<Device>) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let job = tokio::select! {
            job = device.encrypt_rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        let EncryptJob {
            session,
            mut buf,
            len,
            counter,
            done,
        } = job;

        // Pad to a 16-byte boundary without exceeding the MTU; keep-alives
        // stay empty
        let mtu = device.mtu.load(Ordering::Relaxed) as usize;
        let padded = if len == 0 {
            0
        } else {
            ((len + 15) & !15).min(mtu).max(len)
        };
        buf[HEADER_RESERVE + len..HEADER_RESERVE + padded].fill(0);

        Transport::write_header(&mut buf[..Transport::HEADER_LEN], session.remote_index(), counter);

        let outcome = session
            .seal_in_place(counter, &mut buf[HEADER_RESERVE..], padded)
            .ok()
            .map(|sealed| HEADER_RESERVE + sealed);

        if let Err((buf, _)) = done.send((buf, outcome)) {
            // The ordered entry was head-dropped; reclaim the buffer
            device.pool.put(buf);
        }
    }
}

/// Per-peer worker: transmits completed packets in nonce order
async fn peer_sender(device: Arc<Device>, peer: Arc<Peer>, send_seq: PacketQueue<SendEntry>) {
    while let Some(entry) = send_seq.pop().await {
        let Ok((buf, outcome)) = entry.done.await else {
            continue;
        };
        let Some(total) = outcome else {
            device.pool.put(buf);
            continue;
        };

        let Some(endpoint) = peer.endpoint() else {
            device.pool.put(buf);
            continue;
        };

        match device.udp.send(&buf[..total], endpoint.addr).await {
            Ok(()) => {
                peer.add_tx_bytes(total as u64);
                let now = Instant::now();
                let mut timers = peer.timers.lock();
                timers.on_any_packet_sent(now);
                if entry.payload_len > 0 {
                    timers.on_data_packet_sent(now);
                }
            }
            Err(e) => {
                tracing::debug!(peer = ?peer, error = %e, "UDP send failed");
            }
        }

        device.pool.put(buf);
    }
}

// === Inbound ===========================================================

async fn udp_receiver(device: Arc<Device>, v4: bool) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let mut buf = device.pool.get();

        let received = tokio::select! {
            r = async {
                if v4 {
                    device.udp.recv_v4(&mut buf).await
                } else {
                    device.udp.recv_v6(&mut buf).await
                }
            } => r,
            _ = shutdown.changed() => {
                device.pool.put(buf);
                return;
            }
        };

        match received {
            Ok((len, src)) => handle_datagram(&device, buf, len, src).await,
            Err(_) => {
                // Bind closed or rebinding; back off and retry
                device.pool.put(buf);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

async fn handle_datagram(device: &Arc<Device>, buf: Vec<u8>, len: usize, src: SocketAddr) {
    let msg_type = match classify(&buf[..len]) {
        Ok(t) => t,
        Err(_) => {
            device.pool.put(buf);
            return;
        }
    };

    match msg_type {
        MessageType::HandshakeInitiation
        | MessageType::HandshakeResponse
        | MessageType::CookieReply => {
            let job = HandshakeJob {
                data: buf[..len].to_vec(),
                src,
            };
            device.load.observe(device.handshake_tx.len() + 1);
            if device.handshake_tx.try_send(job).is_err() {
                tracing::debug!(%src, "handshake queue full; dropping frame");
            }
            device.pool.put(buf);
        }
        MessageType::TransportData => {
            let index = Transport::receiver_index(&buf[..len]);
            let Some(IndexLookup::Session(peer, session)) = device.index.lookup(index) else {
                device.pool.put(buf);
                return;
            };

            let now = Instant::now();
            if !session.receivable(now) {
                device.pool.put(buf);
                return;
            }

            let counter = Transport::counter(&buf[..len]);
            if session.counter_quick_check(counter).is_err() {
                device.pool.put(buf);
                return;
            }

            let Some(recv_seq) = peer.pipeline.lock().as_ref().map(|q| q.recv_seq.clone())
            else {
                device.pool.put(buf);
                return;
            };

            let (done_tx, done_rx) = oneshot::channel();
            recv_seq.push(RecvEntry {
                done: done_rx,
                session: Arc::clone(&session),
                counter,
                src,
                datagram_len: len,
            });

            let job = DecryptJob {
                session,
                buf,
                len,
                counter,
                done: done_tx,
            };
            if let Err(e) = device.decrypt_tx.send_async(job).await {
                device.pool.put(e.into_inner().buf);
            }
        }
    }
}

async fn handshake_worker(device: Arc<Device>) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let job = tokio::select! {
            job = device.handshake_rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        if let Err(e) = device.handle_handshake_frame(job.data, job.src).await {
            tracing::debug!(src = %job.src, error = %e, "handshake frame dropped");
        }
    }
}

async fn decrypt_worker(device: Arc<Device>) {
    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let job = tokio::select! {
            job = device.decrypt_rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => return,
            },
            _ = shutdown.changed() => return,
        };

        let DecryptJob {
            session,
            mut buf,
            len,
            counter,
            done,
        } = job;

        let outcome = session
            .open_in_place(counter, &mut buf[Transport::HEADER_LEN..len])
            .ok();

        if let Err((buf, _)) = done.send((buf, outcome)) {
            device.pool.put(buf);
        }
    }
}

/// Per-peer worker: commits counters, rotates sessions, and delivers inner
/// packets to the TUN in counter order
async fn peer_receiver(device: Arc<Device>, peer: Arc<Peer>, recv_seq: PacketQueue<RecvEntry>) {
    while let Some(entry) = recv_seq.pop().await {
        let RecvEntry {
            done,
            session,
            counter,
            src,
            datagram_len,
        } = entry;

        let Ok((buf, outcome)) = done.await else {
            continue;
        };
        let Some(plain_len) = outcome else {
            // AEAD failure: silent drop
            device.pool.put(buf);
            continue;
        };

        if session.counter_commit(counter).is_err() {
            tracing::debug!(peer = ?peer, counter, "replayed counter");
            device.pool.put(buf);
            continue;
        }

        // First authenticated packet under `next` promotes the rotation
        if let Some(displaced) = peer.promote_next_on_receive(&session) {
            device.index.unregister(displaced.local_index());
        }

        let now = Instant::now();
        peer.set_endpoint_addr(src);
        peer.add_rx_bytes(datagram_len as u64);
        {
            let mut timers = peer.timers.lock();
            timers.on_any_packet_received(now);
            if plain_len > 0 {
                timers.on_data_packet_received(now);
            }
        }

        if Device::needs_rekey_after_receive(&session, now)
            && peer
                .current_session()
                .is_some_and(|current| Arc::ptr_eq(&current, &session))
        {
            device.initiate_handshake(&peer, false).await;
        }

        if plain_len == 0 {
            // Keep-alive, consumed silently
            device.pool.put(buf);
            continue;
        }

        let packet = &buf[HEADER_RESERVE..HEADER_RESERVE + plain_len];
        let source_ok = inner_src(packet)
            .and_then(|ip| device.route(ip))
            .is_some_and(|owner| Arc::ptr_eq(&owner, &peer));

        if !source_ok {
            tracing::debug!(peer = ?peer, "inner source not routed to peer; dropping");
            device.pool.put(buf);
            continue;
        }

        if let Err(e) = device.tun.write(packet).await {
            tracing::debug!(error = %e, "TUN write failed");
        }
        device.pool.put(buf);
    }
}

// === Timers & maintenance ==============================================

async fn peer_timer(device: Arc<Device>, peer: Arc<Peer>) {
    use crate::device::timers::TimerAction;

    let mut shutdown = device.shutdown_rx.clone();
    let mut tick = tokio::time::interval(TIMER_TICK);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }

        let actions = peer.timers.lock().update(Instant::now());
        for action in actions {
            match action {
                TimerAction::RetransmitHandshake => {
                    tracing::debug!(peer = ?peer, "handshake retransmission");
                    device.initiate_handshake(&peer, true).await;
                }
                TimerAction::GiveUpHandshake => {
                    tracing::debug!(peer = ?peer, "handshake abandoned");
                    {
                        let mut handshake = peer.handshake.lock();
                        if let Some(index) = handshake.local_index() {
                            device.index.unregister(index);
                        }
                        handshake.zeroize();
                    }
                    if let Some(nonce) =
                        peer.pipeline.lock().as_ref().map(|q| q.nonce.clone())
                    {
                        for item in nonce.flush() {
                            device.pool.put(item.buf);
                        }
                    }
                }
                TimerAction::SendKeepalive | TimerAction::PersistentKeepalive => {
                    queue_keepalive(&device, &peer);
                }
                TimerAction::NewHandshake => {
                    tracing::debug!(peer = ?peer, "stale session; starting new handshake");
                    device.initiate_handshake(&peer, false).await;
                }
                TimerAction::ZeroKeyMaterial => {
                    tracing::debug!(peer = ?peer, "zeroizing key material");
                    device.clear_peer_crypto(&peer);
                }
            }
        }
    }
}

async fn tun_event_watcher(device: Arc<Device>) {
    use crate::tun::TunEvent;

    let mut shutdown = device.shutdown_rx.clone();

    loop {
        let event = tokio::select! {
            event = device.tun.next_event() => event,
            _ = shutdown.changed() => return,
        };

        match event {
            TunEvent::Up => {
                device.up.store(true, Ordering::Relaxed);
                let mtu = device.tun.mtu();
                if mtu != 0 {
                    device.mtu.store(mtu, Ordering::Relaxed);
                }
                tracing::info!("interface up");
            }
            TunEvent::Down => {
                device.up.store(false, Ordering::Relaxed);
                tracing::info!("interface down");
            }
            TunEvent::MtuChanged(mtu) => {
                device.mtu.store(mtu, Ordering::Relaxed);
                tracing::info!(mtu, "MTU changed");
            }
        }
    }
}

async fn maintenance(device: Arc<Device>) {
    let mut shutdown = device.shutdown_rx.clone();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.changed() => return,
        }
        device.rate_limiter.collect_garbage();
    }
}
