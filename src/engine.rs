//! Chunked transfer state machine.
//!
//! The engine is pure state: it consumes decoded messages and returns the
//! actions the connection should perform (writes, file saves, event
//! notifications) without touching sockets or disks itself. That keeps
//! the pull-based chunk flow testable without any I/O in the loop.
//!
//! One file moves in each direction at most. The receiver drives the
//! flow: after accepting an offer it requests chunk 0, and each stored
//! chunk triggers the request for the next until the last arrives.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{FileMeta, Message, CHUNK_SIZE};
use crate::session::{ErrorKind, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// One transfer as the session sees it: metadata plus completion state.
/// `available` flips once the file is fully sent, or saved to disk.
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub meta: FileMeta,
    pub direction: Direction,
    pub available: bool,
    /// Source path for outgoing files, saved path for incoming ones.
    pub path: Option<PathBuf>,
}

/// What the host must do in response to a message.
#[derive(Debug)]
pub enum Action {
    Send(Message),
    SaveFile { meta: FileMeta, bytes: Vec<u8> },
    Notify(Event),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a file is already being sent on this connection")]
    SendBusy,
}

/// Outgoing file, pre-sliced so chunk requests are a plain index lookup.
/// `delivered` remembers which indices have gone out, so a re-requested
/// chunk (after a corrupt payload) is not counted twice.
struct ActiveSendSet {
    id: Uuid,
    chunks: Vec<Vec<u8>>,
    delivered: Vec<bool>,
}

/// Incoming file, chunks kept by index until the last one lands.
struct ChunkStore {
    id: Uuid,
    total_chunks: u32,
    chunks: Vec<Option<Vec<u8>>>,
}

pub struct TransferEngine {
    chunk_size: usize,
    send_set: Option<ActiveSendSet>,
    store: Option<ChunkStore>,
    sent: Vec<TransferDescriptor>,
    received: Vec<TransferDescriptor>,
    total_sent_bytes: u64,
    total_received_bytes: u64,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// Smaller chunk sizes keep multi-chunk tests cheap.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            send_set: None,
            store: None,
            sent: Vec::new(),
            received: Vec::new(),
            total_sent_bytes: 0,
            total_received_bytes: 0,
        }
    }

    pub fn has_active_send(&self) -> bool {
        self.send_set.is_some()
    }

    pub fn has_active_receive(&self) -> bool {
        self.store.is_some()
    }

    pub fn sent_bytes(&self) -> u64 {
        self.total_sent_bytes
    }

    pub fn received_bytes(&self) -> u64 {
        self.total_received_bytes
    }

    pub fn sent_files(&self) -> Vec<TransferDescriptor> {
        self.sent.clone()
    }

    pub fn received_files(&self) -> Vec<TransferDescriptor> {
        self.received.clone()
    }

    /// Slice a file into the send set and produce the offer message.
    /// An empty file still travels as one zero-length chunk so the
    /// pull loop has something to request and finalize on.
    pub fn offer(
        &mut self,
        name: &str,
        mime_type: &str,
        path: Option<PathBuf>,
        data: &[u8],
    ) -> Result<Message, EngineError> {
        if self.send_set.is_some() {
            return Err(EngineError::SendBusy);
        }
        let chunks: Vec<Vec<u8>> = if data.is_empty() {
            vec![Vec::new()]
        } else {
            data.chunks(self.chunk_size).map(|c| c.to_vec()).collect()
        };
        let meta = FileMeta {
            id: Uuid::new_v4(),
            name: name.to_string(),
            size: data.len() as u64,
            mime_type: mime_type.to_string(),
            total_chunks: chunks.len() as u32,
        };
        self.send_set = Some(ActiveSendSet {
            id: meta.id,
            delivered: vec![false; chunks.len()],
            chunks,
        });
        self.sent.push(TransferDescriptor {
            meta: meta.clone(),
            direction: Direction::Outgoing,
            available: false,
            path,
        });
        Ok(Message::FileAck { file: meta })
    }

    pub fn handle_message(&mut self, msg: Message) -> Vec<Action> {
        match msg {
            Message::Connect { device_name } => {
                vec![Action::Notify(Event::Connected { peer: device_name })]
            }
            Message::FileAck { file } => self.on_file_offered(file),
            Message::SendChunkAck { chunk_no } => self.on_chunk_requested(chunk_no),
            Message::ReceiveChunkAck { chunk, chunk_no } => {
                self.on_chunk_received(chunk, chunk_no)
            }
        }
    }

    /// Peer offered a file: set up the chunk store and pull chunk 0.
    fn on_file_offered(&mut self, file: FileMeta) -> Vec<Action> {
        if self.store.is_some() {
            warn!(name = %file.name, "offer arrived while a receive is in progress");
            return vec![Action::Notify(Event::Error {
                kind: ErrorKind::Conflict,
                message: format!(
                    "rejecting offer of {:?}: a file is still being received",
                    file.name
                ),
            })];
        }
        if file.total_chunks == 0 {
            warn!(name = %file.name, "offer with zero chunks, ignoring");
            return vec![Action::Notify(Event::Error {
                kind: ErrorKind::Protocol,
                message: format!("offer of {:?} declares zero chunks", file.name),
            })];
        }
        self.store = Some(ChunkStore {
            id: file.id,
            total_chunks: file.total_chunks,
            chunks: vec![None; file.total_chunks as usize],
        });
        let descriptor = TransferDescriptor {
            meta: file,
            direction: Direction::Incoming,
            available: false,
            path: None,
        };
        self.received.push(descriptor.clone());
        vec![
            Action::Notify(Event::FileOffered(descriptor)),
            Action::Send(Message::SendChunkAck { chunk_no: 0 }),
        ]
    }

    /// Peer pulled a chunk: encode and send it, finishing the send set
    /// when the last chunk goes out.
    fn on_chunk_requested(&mut self, chunk_no: u32) -> Vec<Action> {
        let (encoded, len, last, id, first_delivery) = match self.send_set.as_mut() {
            None => {
                return vec![Action::Notify(Event::Error {
                    kind: ErrorKind::Conflict,
                    message: format!("peer requested chunk {chunk_no} but no send is active"),
                })];
            }
            Some(set) => match set.chunks.get(chunk_no as usize) {
                None => {
                    warn!(chunk_no, total = set.chunks.len(), "chunk request out of range");
                    return Vec::new();
                }
                Some(chunk) => {
                    let first_delivery = !set.delivered[chunk_no as usize];
                    set.delivered[chunk_no as usize] = true;
                    (
                        BASE64.encode(chunk),
                        chunk.len() as u64,
                        chunk_no as usize + 1 == set.chunks.len(),
                        set.id,
                        first_delivery,
                    )
                }
            },
        };

        if first_delivery {
            self.total_sent_bytes += len;
        }
        let mut actions = vec![
            Action::Send(Message::ReceiveChunkAck {
                chunk: encoded,
                chunk_no,
            }),
            Action::Notify(Event::Progress {
                sent_bytes: self.total_sent_bytes,
                received_bytes: self.total_received_bytes,
            }),
        ];
        if last {
            self.send_set = None;
            if let Some(d) = self.sent.iter_mut().find(|d| d.meta.id == id) {
                d.available = true;
                actions.push(Action::Notify(Event::TransferComplete {
                    descriptor: d.clone(),
                    path: d.path.clone(),
                }));
            }
        }
        actions
    }

    /// Chunk payload arrived: store it and pull the next, or hand the
    /// assembled file to the host once the last chunk is in.
    fn on_chunk_received(&mut self, chunk: String, chunk_no: u32) -> Vec<Action> {
        let Some(store) = self.store.as_mut() else {
            debug!(chunk_no, "chunk arrived with no receive in progress");
            return Vec::new();
        };
        if chunk_no >= store.total_chunks {
            warn!(chunk_no, total = store.total_chunks, "chunk index out of range");
            return Vec::new();
        }
        let bytes = match BASE64.decode(chunk.as_bytes()) {
            Ok(b) => b,
            Err(e) => {
                warn!(chunk_no, error = %e, "undecodable chunk payload, re-requesting");
                return vec![Action::Send(Message::SendChunkAck { chunk_no })];
            }
        };

        let len = bytes.len() as u64;
        // A duplicate delivery replaces the slot without recounting it.
        let first_delivery = store.chunks[chunk_no as usize].is_none();
        store.chunks[chunk_no as usize] = Some(bytes);
        let last = chunk_no + 1 == store.total_chunks;
        let id = store.id;

        if first_delivery {
            self.total_received_bytes += len;
        }
        let mut actions = vec![Action::Notify(Event::Progress {
            sent_bytes: self.total_sent_bytes,
            received_bytes: self.total_received_bytes,
        })];

        if !last {
            actions.push(Action::Send(Message::SendChunkAck {
                chunk_no: chunk_no + 1,
            }));
            return actions;
        }

        let Some(store) = self.store.take() else {
            return actions;
        };
        match assemble(store) {
            Ok(bytes) => {
                if let Some(d) = self.received.iter().find(|d| d.meta.id == id) {
                    actions.push(Action::SaveFile {
                        meta: d.meta.clone(),
                        bytes,
                    });
                }
            }
            Err(missing) => {
                actions.push(Action::Notify(Event::Error {
                    kind: ErrorKind::Protocol,
                    message: format!("transfer incomplete: chunk {missing} missing at finalization"),
                }));
            }
        }
        actions
    }

    /// The host saved the assembled file; mark the descriptor complete
    /// and return it for the completion event.
    pub fn mark_saved(&mut self, id: Uuid, path: PathBuf) -> Option<TransferDescriptor> {
        let d = self.received.iter_mut().find(|d| d.meta.id == id)?;
        d.available = true;
        d.path = Some(path);
        Some(d.clone())
    }

    /// Connection ended: drop everything in flight. Completed transfers
    /// stay in the history lists.
    pub fn reset(&mut self) {
        self.send_set = None;
        self.store = None;
        self.sent.retain(|d| d.available);
        self.received.retain(|d| d.available);
        self.total_sent_bytes = 0;
        self.total_received_bytes = 0;
    }
}

fn assemble(store: ChunkStore) -> Result<Vec<u8>, u32> {
    let mut out = Vec::new();
    for (i, chunk) in store.chunks.into_iter().enumerate() {
        match chunk {
            Some(bytes) => out.extend_from_slice(&bytes),
            None => return Err(i as u32),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_roundtrip(sender: &mut TransferEngine, data: &[u8]) -> Message {
        sender
            .offer("file.bin", "application/octet-stream", None, data)
            .unwrap()
    }

    /// Run a full pull loop between two engines and return the bytes the
    /// receiver would save.
    fn pump(sender: &mut TransferEngine, receiver: &mut TransferEngine, offer: Message) -> Vec<u8> {
        let mut to_sender: Vec<Message> = Vec::new();
        let mut to_receiver = vec![offer];
        let mut saved = None;
        for _ in 0..10_000 {
            if to_sender.is_empty() && to_receiver.is_empty() {
                break;
            }
            for msg in std::mem::take(&mut to_receiver) {
                for action in receiver.handle_message(msg) {
                    match action {
                        Action::Send(m) => to_sender.push(m),
                        Action::SaveFile { bytes, .. } => saved = Some(bytes),
                        Action::Notify(_) => {}
                    }
                }
            }
            for msg in std::mem::take(&mut to_sender) {
                for action in sender.handle_message(msg) {
                    match action {
                        Action::Send(m) => to_receiver.push(m),
                        Action::SaveFile { .. } => panic!("sender never saves"),
                        Action::Notify(_) => {}
                    }
                }
            }
        }
        saved.expect("transfer did not finalize")
    }

    #[test]
    fn multi_chunk_transfer_reassembles_exactly() {
        let mut sender = TransferEngine::with_chunk_size(8);
        let mut receiver = TransferEngine::with_chunk_size(8);
        let data: Vec<u8> = (0u8..=255).cycle().take(100).collect();
        let offer = offer_roundtrip(&mut sender, &data);
        let saved = pump(&mut sender, &mut receiver, offer);
        assert_eq!(saved, data);
        assert_eq!(sender.sent_bytes(), 100);
        assert_eq!(receiver.received_bytes(), 100);
        assert!(!sender.has_active_send());
        assert!(!receiver.has_active_receive());
    }

    #[test]
    fn short_final_chunk_is_handled() {
        let mut sender = TransferEngine::with_chunk_size(16);
        let mut receiver = TransferEngine::with_chunk_size(16);
        let data = vec![7u8; 33]; // two full chunks plus one byte
        let offer = offer_roundtrip(&mut sender, &data);
        if let Message::FileAck { file } = &offer {
            assert_eq!(file.total_chunks, 3);
        } else {
            panic!("offer is not a file_ack");
        }
        assert_eq!(pump(&mut sender, &mut receiver, offer), data);
    }

    #[test]
    fn empty_file_travels_as_one_empty_chunk() {
        let mut sender = TransferEngine::new();
        let mut receiver = TransferEngine::new();
        let offer = offer_roundtrip(&mut sender, &[]);
        if let Message::FileAck { file } = &offer {
            assert_eq!(file.total_chunks, 1);
            assert_eq!(file.size, 0);
        } else {
            panic!("offer is not a file_ack");
        }
        assert_eq!(pump(&mut sender, &mut receiver, offer), Vec::<u8>::new());
    }

    #[test]
    fn offer_while_sending_is_rejected() {
        let mut engine = TransferEngine::new();
        offer_roundtrip(&mut engine, b"first");
        let err = engine
            .offer("second.bin", "application/octet-stream", None, b"second")
            .unwrap_err();
        assert!(matches!(err, EngineError::SendBusy));
    }

    #[test]
    fn offer_while_receiving_yields_conflict() {
        let mut receiver = TransferEngine::new();
        let mut sender = TransferEngine::new();
        let offer = offer_roundtrip(&mut sender, b"data");
        receiver.handle_message(offer);
        assert!(receiver.has_active_receive());

        let mut other = TransferEngine::new();
        let second = offer_roundtrip(&mut other, b"more");
        let actions = receiver.handle_message(second);
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify(Event::Error {
                kind: ErrorKind::Conflict,
                ..
            })
        )));
        // No chunk request goes out for the rejected offer.
        assert!(!actions.iter().any(|a| matches!(a, Action::Send(_))));
    }

    #[test]
    fn undecodable_chunk_is_re_requested() {
        let mut receiver = TransferEngine::with_chunk_size(4);
        let mut sender = TransferEngine::with_chunk_size(4);
        let offer = offer_roundtrip(&mut sender, b"12345678");
        receiver.handle_message(offer);

        let actions = receiver.handle_message(Message::ReceiveChunkAck {
            chunk: "!!not-base64!!".into(),
            chunk_no: 0,
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::Send(Message::SendChunkAck { chunk_no: 0 })]
        ));
        assert_eq!(receiver.received_bytes(), 0);
    }

    #[test]
    fn chunk_request_without_active_send_is_a_conflict() {
        let mut engine = TransferEngine::new();
        let actions = engine.handle_message(Message::SendChunkAck { chunk_no: 0 });
        assert!(matches!(
            actions.as_slice(),
            [Action::Notify(Event::Error {
                kind: ErrorKind::Conflict,
                ..
            })]
        ));
    }

    #[test]
    fn out_of_range_request_is_dropped() {
        let mut sender = TransferEngine::with_chunk_size(4);
        offer_roundtrip(&mut sender, b"12345678");
        let actions = sender.handle_message(Message::SendChunkAck { chunk_no: 99 });
        assert!(actions.is_empty());
        assert!(sender.has_active_send());
    }

    #[test]
    fn stray_chunk_with_no_receive_is_ignored() {
        let mut engine = TransferEngine::new();
        let actions = engine.handle_message(Message::ReceiveChunkAck {
            chunk: BASE64.encode(b"data"),
            chunk_no: 0,
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn reset_discards_in_flight_state_but_keeps_history() {
        let mut sender = TransferEngine::with_chunk_size(4);
        let mut receiver = TransferEngine::with_chunk_size(4);

        // Finish one transfer so each side has a completed descriptor.
        let offer = offer_roundtrip(&mut sender, b"done");
        pump(&mut sender, &mut receiver, offer);
        let saved_id = receiver.received_files()[0].meta.id;
        receiver.mark_saved(saved_id, PathBuf::from("/tmp/done"));

        // Leave a second transfer dangling mid-flight.
        let offer = offer_roundtrip(&mut sender, b"interrupted-data");
        receiver.handle_message(offer);
        assert!(sender.has_active_send());
        assert!(receiver.has_active_receive());

        sender.reset();
        receiver.reset();
        assert!(!sender.has_active_send());
        assert!(!receiver.has_active_receive());
        assert_eq!(sender.sent_bytes(), 0);
        assert_eq!(receiver.received_bytes(), 0);
        assert_eq!(sender.sent_files().len(), 1);
        assert_eq!(receiver.received_files().len(), 1);
        assert!(receiver.received_files()[0].available);
    }

    #[test]
    fn receiver_requests_chunks_strictly_in_order() {
        let mut sender = TransferEngine::with_chunk_size(5);
        let mut receiver = TransferEngine::with_chunk_size(5);
        // 25 bytes in 5-byte chunks: requests must run 0..5 in order.
        let data = b"abcdefghijklmnopqrstuvwxy";
        let offer = offer_roundtrip(&mut sender, data);

        let mut requested = Vec::new();
        let mut inbound = vec![offer];
        while let Some(msg) = inbound.pop() {
            for action in receiver.handle_message(msg) {
                if let Action::Send(req @ Message::SendChunkAck { chunk_no }) = action {
                    requested.push(chunk_no);
                    for reply in sender.handle_message(req) {
                        if let Action::Send(m) = reply {
                            inbound.push(m);
                        }
                    }
                }
            }
        }
        assert_eq!(requested, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn finalizing_with_a_missing_chunk_is_an_error_not_a_file() {
        let mut receiver = TransferEngine::with_chunk_size(4);
        let mut sender = TransferEngine::with_chunk_size(4);
        let offer = offer_roundtrip(&mut sender, b"12345678");
        receiver.handle_message(offer);

        // Deliver only the final chunk, skipping chunk 0 entirely.
        let actions = receiver.handle_message(Message::ReceiveChunkAck {
            chunk: BASE64.encode(b"5678"),
            chunk_no: 1,
        });
        assert!(!actions.iter().any(|a| matches!(a, Action::SaveFile { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::Notify(Event::Error {
                kind: ErrorKind::Protocol,
                ..
            })
        )));
        // The store is cleared, so the connection is not stuck.
        assert!(!receiver.has_active_receive());
    }

    #[test]
    fn re_requested_chunk_is_counted_once() {
        let mut sender = TransferEngine::with_chunk_size(4);
        offer_roundtrip(&mut sender, b"12345678");

        // The receiver asks for chunk 0 twice, as it does after a corrupt
        // payload. The counter must not drift past the file size.
        sender.handle_message(Message::SendChunkAck { chunk_no: 0 });
        sender.handle_message(Message::SendChunkAck { chunk_no: 0 });
        assert_eq!(sender.sent_bytes(), 4);
        sender.handle_message(Message::SendChunkAck { chunk_no: 1 });
        assert_eq!(sender.sent_bytes(), 8);
    }

    #[test]
    fn duplicate_chunk_delivery_is_counted_once() {
        let mut sender = TransferEngine::with_chunk_size(4);
        let mut receiver = TransferEngine::with_chunk_size(4);
        let offer = offer_roundtrip(&mut sender, b"12345678");
        receiver.handle_message(offer);

        for _ in 0..2 {
            receiver.handle_message(Message::ReceiveChunkAck {
                chunk: BASE64.encode(b"1234"),
                chunk_no: 0,
            });
        }
        assert_eq!(receiver.received_bytes(), 4);
        assert!(receiver.has_active_receive());
    }

    #[test]
    fn connect_message_surfaces_peer_name() {
        let mut engine = TransferEngine::new();
        let actions = engine.handle_message(Message::Connect {
            device_name: "tablet".into(),
        });
        assert!(matches!(
            actions.as_slice(),
            [Action::Notify(Event::Connected { peer })] if peer == "tablet"
        ));
    }
}
