// ABOUTME: Call context - the per-inbound-call object handed to a user handler
// ABOUTME: exposes the params, an at-most-once answer setter, and call_back

use crate::bag::Params;
use crate::connection::ConnectionHandle;
use crate::error::{Result, RpcError};
use bytes::Bytes;

/// What a [`CallHandler`] does with the `Call` it was given.
pub enum HandlerAction {
    /// The handler already answered (or intends to answer later via a
    /// further call-back chain); do not auto-answer.
    Handled,
    /// Auto-answer with this bag.
    Answer(Params),
    /// Auto-answer with this bag, and additionally terminate the anonymous
    /// wait loop that invoked this handler (meaningful only for a
    /// `Connection::call(None, Some(handler))` loop; ignored otherwise).
    AnswerAndExit(Params),
}

/// A handler invoked, on the thread that issued the originating call, for
/// every inbound call-back or anonymous call addressed to it.
pub trait CallHandler: Send {
    fn handle(&mut self, call: &mut Call) -> HandlerAction;
}

impl<F: FnMut(&mut Call) -> HandlerAction + Send> CallHandler for F {
    fn handle(&mut self, call: &mut Call) -> HandlerAction {
        self(call)
    }
}

/// An inbound call or call-back, as delivered to user code.
///
/// Holds a weak back-reference to the connection, rather than a strong one,
/// so that a `Call` sitting in a receiver's queue doesn't keep the
/// connection alive on its own (the connection owns the receiver, the
/// receiver's queue owns the `Call`, and the `Call` would otherwise own the
/// connection right back).
pub struct Call {
    conn: ConnectionHandle,
    func: Bytes,
    params: Params,
    id: Option<u32>,
    answered: bool,
}

impl Call {
    pub(crate) fn new(conn: ConnectionHandle, func: Bytes, params: Params, id: Option<u32>) -> Self {
        Call { conn, func, params, id, answered: false }
    }

    /// The function name this call/call-back invoked.
    pub fn function(&self) -> &[u8] {
        &self.func
    }

    pub fn function_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.func)
    }

    /// The inbound parameter bag.
    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn is_answered(&self) -> bool {
        self.answered
    }

    /// Sets the answer for this call, transmitting a return frame. At most
    /// once per `Call`; a second attempt raises [`RpcError::DoubleAnswer`].
    pub fn answer(&mut self, bag: Params) -> Result<()> {
        if self.answered {
            return Err(RpcError::DoubleAnswer);
        }
        let conn = self.conn.upgrade()?;
        conn.send_return(self.id, &bag)?;
        self.answered = true;
        Ok(())
    }

    /// Issues a further call-back addressed back to this call's originating
    /// receiver. Forbidden once this call has been answered, since there is
    /// no longer a live receiver on the other end to route it to; raises
    /// [`RpcError::CallAlreadyReturned`].
    pub fn call_back(
        &self,
        func: impl Into<Bytes>,
        params: Params,
        handler: Option<Box<dyn CallHandler>>,
    ) -> Result<crate::connection::Answer> {
        if self.answered {
            return Err(RpcError::CallAlreadyReturned);
        }
        let conn = self.conn.upgrade()?;
        conn.call_back_raw(func.into(), params, self.id, handler)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if !self.answered {
            tracing::trace!(func = %self.function_str(), "call dropped without an answer");
        }
    }
}
