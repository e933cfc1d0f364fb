// ABOUTME: Connection - the dispatcher/state machine multiplexing calls, returns and call-backs
// ABOUTME: over one pair of byte streams, with no threads of its own

use crate::bag::Params;
use crate::call::{Call, CallHandler, HandlerAction};
use crate::error::{Result, RpcError};
use crate::frame::{id_or_sentinel, some_id, FrameReader, FrameWriter, FramingMode, WireEvent};
use crate::negotiate::{
    Protocol, HANDSHAKE_ACK, HANDSHAKE_ACK_BODY, HANDSHAKE_ACK_FRAME, HANDSHAKE_ID, HANDSHAKE_MARKER,
    HANDSHAKE_NOACK_FRAME,
};
use crate::promise::LazyAnswer;
use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

/// Construction-time options for a [`Connection`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// Which framing mode (and handshake behavior) this side starts with.
    pub protocol: Protocol,
    /// If set, `call` returns a [`LazyAnswer`] instead of blocking on the
    /// answer immediately; the wait loop only runs once something forces it.
    pub lazy_answers: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions { protocol: Protocol::Text, lazy_answers: false }
    }
}

/// What a finished `call` produced.
#[derive(Debug)]
pub enum Answer {
    /// The peer answered normally.
    Bag(Params),
    /// Lazy mode is enabled; force this to run the wait loop and get a
    /// [`Bag`](Answer::Bag) or [`Closed`](Answer::Closed).
    Lazy(LazyAnswer),
    /// The connection closed cleanly (or a handler requested early exit)
    /// before an answer arrived.
    Closed,
}

/// A weak, clonable reference to a [`Connection`], handed to every [`Call`]
/// so that queued calls don't keep the connection alive on their own.
#[derive(Clone)]
pub struct ConnectionHandle(Weak<Connection>);

impl ConnectionHandle {
    pub(crate) fn upgrade(&self) -> Result<Arc<Connection>> {
        self.0.upgrade().ok_or(RpcError::ConnectionDetached)
    }
}

enum HandlerSlotKind {
    Handler(Box<dyn CallHandler>),
    NoHandler { caller: String },
}

struct ReceiverSlot {
    /// `None` only while this slot's handler is out being invoked by the
    /// single thread permitted to touch it; never observed by anyone else.
    handler: Option<HandlerSlotKind>,
    queue: VecDeque<(Bytes, Params, Option<u32>)>,
}

#[derive(Default)]
struct DispatchState {
    pending_answers: HashMap<u32, Params>,
    receivers: HashMap<Option<u32>, ReceiverSlot>,
    closed: bool,
    error: Option<Arc<RpcError>>,
}

enum DriveOutcome {
    Answer(Params),
    Exited,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Pending,
    Done,
}

type BoxedReader = Box<dyn BufRead + Send>;
type BoxedWriter = Box<dyn Write + Send>;

struct ReaderState {
    reader: FrameReader<BoxedReader>,
    /// Params accumulated so far for the frame group currently in progress.
    /// Read-duty may pass between threads mid-group; this lives alongside
    /// the reader itself so whoever holds the read lock next picks up where
    /// the last reader left off.
    rets: Params,
}

/// The bidirectional, symmetric call/return/call-back multiplexer.
///
/// A `Connection` drives no threads of its own: every blocking operation
/// (`call`, `listen`, forcing a [`LazyAnswer`]) runs its wait loop on the
/// calling thread, cooperatively taking "read duty" (a non-blocking
/// try-lock on the shared reader) when no other thread currently holds it.
/// Multiple calling threads on the same connection rendezvous through a
/// shared dispatch table guarded by a single mutex plus condvar.
pub struct Connection {
    reader_state: Mutex<ReaderState>,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    state: Mutex<DispatchState>,
    cond: Condvar,
    id_counter: Mutex<u32>,
    protocol: Protocol,
    proto_ack: Mutex<HandshakeState>,
    detached: AtomicBool,
    lazy_answers: bool,
    self_handle: Weak<Connection>,
}

impl Connection {
    /// Builds a connection over an already-split pair of byte streams (e.g.
    /// a subprocess's stdout/stdin, or two halves of a pipe).
    pub fn new<R, W>(reader: R, writer: W, options: ConnectionOptions) -> std::io::Result<Arc<Connection>>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let initial_write_mode = match options.protocol {
            Protocol::Binary => FramingMode::Binary,
            _ => FramingMode::Text,
        };
        let initial_id = {
            let mut rng = rand::thread_rng();
            let mut id = rng.gen_range(1..=1000u32);
            if options.protocol.reserves_handshake_id() && id == HANDSHAKE_ID {
                id += 1;
            }
            id
        };
        let boxed_reader: BoxedReader = Box::new(BufReader::new(reader));
        let boxed_writer: BoxedWriter = Box::new(writer);
        let conn = Arc::new_cyclic(|weak| Connection {
            reader_state: Mutex::new(ReaderState {
                reader: FrameReader::new(boxed_reader, FramingMode::Text),
                rets: Params::new(),
            }),
            writer: Mutex::new(FrameWriter::new(boxed_writer, initial_write_mode)),
            state: Mutex::new(DispatchState::default()),
            cond: Condvar::new(),
            id_counter: Mutex::new(initial_id),
            protocol: options.protocol,
            proto_ack: Mutex::new(HandshakeState::Pending),
            detached: AtomicBool::new(false),
            lazy_answers: options.lazy_answers,
            self_handle: weak.clone(),
        });
        if options.protocol == Protocol::Binary {
            conn.writer.lock().unwrap().write_raw(&HANDSHAKE_NOACK_FRAME)?;
        }
        Ok(conn)
    }

    /// Convenience constructor over a single duplex stream such as a
    /// `TcpStream`: the write half is a cloned handle of the same socket.
    pub fn from_tcp_stream(
        stream: std::net::TcpStream,
        options: ConnectionOptions,
    ) -> std::io::Result<Arc<Connection>> {
        let _ = stream.set_nodelay(true);
        let writer = stream.try_clone()?;
        Connection::new(stream, writer, options)
    }

    /// Stops this side from taking read duty ever again. Does not touch the
    /// underlying streams or close anything; it only makes every subsequent
    /// read attempt fail with [`RpcError::ConnectionDetached`] (a read
    /// already in progress on another thread still completes normally).
    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// Issues a call and blocks for its answer (or, in lazy mode, returns
    /// immediately with a promise). `handler` receives any call-backs the
    /// peer directs back at this call while it's outstanding.
    #[track_caller]
    pub fn call(
        &self,
        func: impl Into<Bytes>,
        params: Params,
        handler: Option<Box<dyn CallHandler>>,
    ) -> Result<Answer> {
        self.ensure_handshake()?;
        let func = func.into();
        let id = self.next_call_id();
        let caller = std::panic::Location::caller().to_string();
        self.register_receiver(Some(id), handler, caller);
        if let Err(e) = self.send_call(&func, &params, id, None) {
            self.unregister_receiver(&Some(id));
            return Err(e);
        }
        if self.lazy_answers {
            let handle = ConnectionHandle(self.self_handle.clone());
            return Ok(Answer::Lazy(LazyAnswer::new(move || {
                let conn = handle.upgrade()?;
                conn.finish_call(Some(id))
            })));
        }
        self.finish_call(Some(id)).map(|opt| match opt {
            Some(bag) => Answer::Bag(bag),
            None => Answer::Closed,
        })
    }

    /// Enters an indefinite wait loop with no outstanding call of its own,
    /// dispatching anonymous inbound calls/call-backs to `handler` until the
    /// handler signals exit or the connection closes.
    pub fn listen(&self, handler: Box<dyn CallHandler>) -> Result<()> {
        self.register_receiver(None, Some(handler), "anonymous listener".into());
        let result = self.drive(None);
        self.unregister_receiver(&None);
        result.map(|_| ())
    }

    pub(crate) fn call_back_raw(
        &self,
        func: Bytes,
        params: Params,
        recv_id: Option<u32>,
        handler: Option<Box<dyn CallHandler>>,
    ) -> Result<Answer> {
        self.ensure_handshake()?;
        let id = self.next_call_id();
        self.register_receiver(Some(id), handler, format!("call-back `{}`", String::from_utf8_lossy(&func)));
        if let Err(e) = self.send_call(&func, &params, id, recv_id) {
            self.unregister_receiver(&Some(id));
            return Err(e);
        }
        if self.lazy_answers {
            let handle = ConnectionHandle(self.self_handle.clone());
            return Ok(Answer::Lazy(LazyAnswer::new(move || {
                let conn = handle.upgrade()?;
                conn.finish_call(Some(id))
            })));
        }
        self.finish_call(Some(id)).map(|opt| match opt {
            Some(bag) => Answer::Bag(bag),
            None => Answer::Closed,
        })
    }

    pub(crate) fn send_return(&self, id: Option<u32>, bag: &Params) -> Result<()> {
        let mut w = self.writer.lock().unwrap();
        for (k, v) in bag.iter() {
            w.write_param(k, v)?;
        }
        w.write_return(id_or_sentinel(id))?;
        Ok(())
    }

    fn send_call(&self, func: &[u8], params: &Params, id: u32, recv_id: Option<u32>) -> Result<()> {
        let mut w = self.writer.lock().unwrap();
        for (k, v) in params.iter() {
            w.write_param(k, v)?;
        }
        w.write_call(func, id, recv_id)?;
        Ok(())
    }

    fn finish_call(&self, id: Option<u32>) -> Result<Option<Params>> {
        let result = self.drive(id);
        self.unregister_receiver(&id);
        match result {
            Ok(DriveOutcome::Answer(bag)) => Ok(Some(bag)),
            Ok(DriveOutcome::Exited) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn next_call_id(&self) -> u32 {
        let mut counter = self.id_counter.lock().unwrap();
        loop {
            let id = *counter;
            *counter = counter.wrapping_add(1);
            if id != 0 && !(self.protocol.reserves_handshake_id() && id == HANDSHAKE_ID) {
                return id;
            }
        }
    }

    fn register_receiver(&self, key: Option<u32>, handler: Option<Box<dyn CallHandler>>, caller: String) {
        let kind = match handler {
            Some(h) => HandlerSlotKind::Handler(h),
            None => HandlerSlotKind::NoHandler { caller },
        };
        self.state
            .lock()
            .unwrap()
            .receivers
            .insert(key, ReceiverSlot { handler: Some(kind), queue: VecDeque::new() });
    }

    fn unregister_receiver(&self, key: &Option<u32>) {
        self.state.lock().unwrap().receivers.remove(key);
    }

    /// One-shot `prefer_binary` upgrade attempt, performed lazily before the
    /// first outbound call. Every caller blocks on the same mutex until
    /// whichever thread gets there first finishes the attempt.
    fn ensure_handshake(&self) -> Result<()> {
        if self.protocol != Protocol::PreferBinary {
            return Ok(());
        }
        let mut guard = self.proto_ack.lock().unwrap();
        if *guard == HandshakeState::Done {
            return Ok(());
        }
        self.register_receiver(Some(HANDSHAKE_ID), None, "prefer_binary handshake".into());
        let sent = {
            let mut w = self.writer.lock().unwrap();
            w.write_raw(&HANDSHAKE_ACK_FRAME)
        };
        if let Err(e) = sent {
            self.unregister_receiver(&Some(HANDSHAKE_ID));
            *guard = HandshakeState::Done;
            return Err(e.into());
        }
        let outcome = self.drive(Some(HANDSHAKE_ID));
        self.unregister_receiver(&Some(HANDSHAKE_ID));
        let accepted = matches!(&outcome, Ok(DriveOutcome::Answer(bag)) if bag.get_str("O") == Some("K"));
        let mode = if accepted { FramingMode::Binary } else { FramingMode::Text };
        self.writer.lock().unwrap().set_mode(mode);
        *guard = HandshakeState::Done;
        Ok(())
    }

    /// The core wait loop: pop a queued call-back for `target` and dispatch
    /// it to its handler; otherwise check for a ready answer; otherwise take
    /// read duty if free, or block on the condvar if someone else has it.
    fn drive(&self, target: Option<u32>) -> Result<DriveOutcome> {
        let mut state = self.state.lock().unwrap();
        loop {
            let queued = state.receivers.get_mut(&target).and_then(|slot| slot.queue.pop_front());
            if let Some((func, params, call_id)) = queued {
                let kind = state
                    .receivers
                    .get_mut(&target)
                    .and_then(|slot| slot.handler.take())
                    .expect("receiver handler taken by a second thread");
                drop(state);
                let handler = match kind {
                    HandlerSlotKind::Handler(h) => h,
                    HandlerSlotKind::NoHandler { .. } => {
                        unreachable!("the queue only ever holds calls for a receiver with a real handler")
                    }
                };
                let mut call = Call::new(ConnectionHandle(self.self_handle.clone()), func, params, call_id);
                let (handler, action) = run_handler(handler, &mut call);

                state = self.state.lock().unwrap();
                if let Some(slot) = state.receivers.get_mut(&target) {
                    slot.handler = Some(HandlerSlotKind::Handler(handler));
                }
                drop(state);

                let exit = match action {
                    HandlerAction::Handled => false,
                    HandlerAction::Answer(bag) => {
                        call.answer(bag)?;
                        false
                    }
                    HandlerAction::AnswerAndExit(bag) => {
                        call.answer(bag)?;
                        true
                    }
                };
                if exit {
                    return Ok(DriveOutcome::Exited);
                }
                state = self.state.lock().unwrap();
                continue;
            }

            if let Some(id) = target {
                if let Some(bag) = state.pending_answers.remove(&id) {
                    return Ok(DriveOutcome::Answer(bag));
                }
            }

            if state.closed {
                return Ok(DriveOutcome::Exited);
            }
            if let Some(err) = &state.error {
                return Err(err.dup());
            }

            match self.reader_state.try_lock() {
                Ok(mut rs) => {
                    drop(state);
                    self.receive_one(&mut rs);
                    drop(rs);
                    state = self.state.lock().unwrap();
                }
                Err(_) => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
    }

    /// Parses and dispatches exactly one wire event while holding read duty.
    /// Every outcome (including errors and EOF) is published into the shared
    /// dispatch state rather than returned, so it surfaces uniformly to
    /// whichever thread next checks the wait loop's exit conditions.
    fn receive_one(&self, rs: &mut ReaderState) {
        if self.detached.load(Ordering::Acquire) {
            self.store_error(RpcError::ConnectionDetached);
            return;
        }
        match rs.reader.read_event() {
            Ok(None) => {
                let mut state = self.state.lock().unwrap();
                state.closed = true;
                self.cond.notify_all();
            }
            Ok(Some(WireEvent::Param { key, value })) => {
                rs.rets.insert(key, value);
            }
            Ok(Some(WireEvent::Return { id })) => {
                let bag = std::mem::take(&mut rs.rets);
                if id != 0 {
                    let mut state = self.state.lock().unwrap();
                    state.pending_answers.insert(id, bag);
                    self.cond.notify_all();
                } else {
                    tracing::trace!("discarding anonymous return frame: nothing waits on it by id");
                }
            }
            Ok(Some(WireEvent::Call { func, id, recv_id })) => {
                if self.protocol.recognizes_handshake_on_read() && is_handshake_call(&func, id, recv_id) {
                    self.handle_inbound_handshake(rs, func[1]);
                    return;
                }
                let bag = std::mem::take(&mut rs.rets);
                let func_str = String::from_utf8_lossy(&func).into_owned();
                let mut state = self.state.lock().unwrap();
                match state.receivers.get_mut(&recv_id) {
                    None => {
                        state.error = Some(Arc::new(RpcError::NoCallbackDefined {
                            function: func_str,
                            already_returned: recv_id.is_some(),
                        }));
                    }
                    Some(slot) => match &slot.handler {
                        Some(HandlerSlotKind::NoHandler { caller }) => {
                            state.error = Some(Arc::new(RpcError::NoCallbackDefined {
                                function: caller.clone(),
                                already_returned: false,
                            }));
                        }
                        Some(HandlerSlotKind::Handler(_)) | None => {
                            // `None` means this slot's handler is checked out,
                            // mid-invocation, on the thread that owns it (a
                            // nested call from within that very handler just
                            // took read duty and landed here). Still queue it;
                            // the owning thread drains it on its next pass
                            // through `drive`.
                            slot.queue.push_back((func, bag, some_id(id)));
                        }
                    },
                }
                self.cond.notify_all();
            }
            Err(e) => self.store_error(e),
        }
    }

    fn handle_inbound_handshake(&self, rs: &mut ReaderState, second_byte: u8) {
        rs.reader.set_mode(FramingMode::Binary);
        rs.rets = Params::new();
        if second_byte == HANDSHAKE_ACK {
            let mut w = match self.writer.lock() {
                Ok(w) => w,
                Err(_) => return,
            };
            if let Err(e) = w.write_raw(HANDSHAKE_ACK_BODY) {
                drop(w);
                self.store_error(e.into());
            }
        }
    }

    fn store_error(&self, e: RpcError) {
        let mut state = self.state.lock().unwrap();
        state.error = Some(Arc::new(e));
        self.cond.notify_all();
    }
}

fn is_handshake_call(func: &[u8], id: u32, recv_id: Option<u32>) -> bool {
    recv_id.is_none() && id == HANDSHAKE_ID && func.len() == 2 && func[0] == HANDSHAKE_MARKER
}

fn run_handler(mut h: Box<dyn CallHandler>, call: &mut Call) -> (Box<dyn CallHandler>, HandlerAction) {
    let action = h.handle(call);
    (h, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::HandlerAction;
    use std::net::TcpListener;
    use std::thread;

    fn loopback_pair() -> (Arc<Connection>, Arc<Connection>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            Connection::from_tcp_stream(sock, ConnectionOptions::default()).unwrap()
        });
        let client_sock = std::net::TcpStream::connect(addr).unwrap();
        let client = Connection::from_tcp_stream(client_sock, ConnectionOptions::default()).unwrap();
        let server = server.join().unwrap();
        (client, server)
    }

    #[test]
    fn simple_call_and_echo_answer() {
        let (client, server) = loopback_pair();
        let server_thread = thread::spawn(move || {
            server
                .listen(Box::new(|call: &mut Call| {
                    let mut reply = Params::new();
                    reply.insert("echo", call.params().get_str("msg").unwrap_or("").to_string());
                    HandlerAction::Answer(reply)
                }))
                .unwrap();
        });

        let mut params = Params::new();
        params.insert("msg", "hello");
        let answer = client.call("echo", params, None).unwrap();
        match answer {
            Answer::Bag(bag) => assert_eq!(bag.get_str("echo"), Some("hello")),
            other => panic!("expected a bag, got {other:?}"),
        }
        client.detach();
        drop(client);
        let _ = server_thread.join();
    }

    #[test]
    fn call_back_round_trip() {
        let (client, server) = loopback_pair();
        let server_thread = thread::spawn(move || {
            server
                .listen(Box::new(|call: &mut Call| {
                    let mut cb_params = Params::new();
                    cb_params.insert("question", "ok?");
                    let cb_answer = call.call_back("ask", cb_params, None).unwrap();
                    let got = match cb_answer {
                        Answer::Bag(bag) => bag.get_str("answer").unwrap_or("").to_string(),
                        _ => String::new(),
                    };
                    let mut reply = Params::new();
                    reply.insert("got", got);
                    HandlerAction::Answer(reply)
                }))
                .unwrap();
        });

        let answer = client
            .call(
                "start",
                Params::new(),
                Some(Box::new(|call: &mut Call| {
                    assert_eq!(call.function(), b"ask");
                    let mut reply = Params::new();
                    reply.insert("answer", "yes");
                    HandlerAction::Answer(reply)
                })),
            )
            .unwrap();
        match answer {
            Answer::Bag(bag) => assert_eq!(bag.get_str("got"), Some("yes")),
            other => panic!("expected a bag, got {other:?}"),
        }
        client.detach();
        drop(client);
        let _ = server_thread.join();
    }

    #[test]
    fn answering_twice_is_rejected() {
        let (client, server) = loopback_pair();
        let server_thread = thread::spawn(move || {
            server
                .listen(Box::new(|call: &mut Call| {
                    call.answer(Params::new()).unwrap();
                    assert!(matches!(call.answer(Params::new()), Err(RpcError::DoubleAnswer)));
                    HandlerAction::Handled
                }))
                .unwrap();
        });
        let _ = client.call("noop", Params::new(), None).unwrap();
        client.detach();
        drop(client);
        let _ = server_thread.join();
    }

    #[test]
    fn call_against_a_vanished_peer_closes_cleanly() {
        let (client, server) = loopback_pair();
        drop(server);
        let answer = client.call("whatever", Params::new(), None).unwrap();
        assert!(matches!(answer, Answer::Closed));
    }
}
