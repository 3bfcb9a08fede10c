use std::fmt;
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, RawFd};
use std::task::{Context, Poll};

use super::conn::{Conn, Direct};
use super::endpoint::{Direction, Endpoint, Flow};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Compositor,
}

impl Side {
    fn reader(self) -> Direction {
        match self {
            Side::Client => Direction::Upstream,
            Side::Compositor => Direction::Downstream,
        }
    }

    fn writer(self) -> Direction {
        self.reader().reverse()
    }

    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Compositor => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Compositor => f.write_str("compositor"),
        }
    }
}

/// A remote client paired with its own compositor connection.
///
/// The upstream endpoint reads the client and writes the compositor, the
/// downstream endpoint does the opposite. Both connections and both buffers
/// (with any descriptors still queued in them) are released together when
/// the session is dropped.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    client: Conn,
    compositor: Conn,
    upstream: Endpoint,
    downstream: Endpoint,
    // Sides whose read readiness was cleared while their reader was full.
    parked: [bool; 2],
}

impl Session {
    pub fn new(id: SessionId, client: Conn, compositor: Conn, capacity: usize) -> Self {
        Session {
            id,
            client,
            compositor,
            upstream: Endpoint::new(Direction::Upstream, capacity),
            downstream: Endpoint::new(Direction::Downstream, capacity),
            parked: [false; 2],
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn conn(&self, side: Side) -> &Conn {
        match side {
            Side::Client => &self.client,
            Side::Compositor => &self.compositor,
        }
    }

    pub fn fd(&self, side: Side) -> RawFd {
        self.conn(side).as_raw_fd()
    }

    pub fn endpoint(&self, direction: Direction) -> &Endpoint {
        match direction {
            Direction::Upstream => &self.upstream,
            Direction::Downstream => &self.downstream,
        }
    }

    pub fn wants_read(&self, side: Side) -> bool {
        self.endpoint(side.reader()).wants_read()
    }

    // A parked side may hold data the reactor will not report again.
    pub fn is_parked(&self, side: Side) -> bool {
        self.parked[side.index()]
    }

    pub fn wants_write(&self, side: Side) -> bool {
        self.endpoint(side.writer()).wants_write()
    }

    // Data may have arrived before registration.
    pub fn start(&mut self) -> Result<Flow> {
        if self.pump(Direction::Upstream)? == Flow::Closed {
            return Ok(Flow::Closed);
        }
        self.pump(Direction::Downstream)
    }

    pub fn on_ready(&mut self, side: Side, readable: bool, writable: bool) -> Result<Flow> {
        if writable {
            self.flush(side.writer())?;
        }
        if readable {
            return self.pump(side.reader());
        }
        Ok(Flow::Open)
    }

    /// Watches a side whose reader has no room, so a reset is not missed
    /// while the other side is stalled. Returns the socket error once one is
    /// reported. Otherwise the side is parked: its read readiness is cleared
    /// and the task waits for the next kernel event on it. No data is read.
    pub fn poll_read_error(&mut self, side: Side, cx: &mut Context<'_>) -> Option<Error> {
        let conn = self.conn(side);
        match conn.poll_read_ready(cx) {
            Poll::Pending => None,
            Poll::Ready(Err(err)) => Some(err),
            Poll::Ready(Ok(())) => match conn.take_error() {
                Ok(Some(err)) | Err(err) => Some(err),
                Ok(None) => {
                    conn.clear_read_ready();
                    self.parked[side.index()] = true;
                    match self.conn(side).poll_read_ready(cx) {
                        Poll::Ready(Err(err)) => Some(err),
                        _ => None,
                    }
                }
            },
        }
    }

    fn pump(&mut self, direction: Direction) -> Result<Flow> {
        let Session {
            client,
            compositor,
            upstream,
            downstream,
            parked,
            ..
        } = self;
        let (endpoint, src, dst, side) = match direction {
            Direction::Upstream => (upstream, &*client, &*compositor, Side::Client),
            Direction::Downstream => (downstream, &*compositor, &*client, Side::Compositor),
        };

        let parked = &mut parked[side.index()];
        if !*parked {
            return endpoint.pump(src, dst);
        }
        let src = Direct::new(src);
        let flow = endpoint.pump(&src, dst)?;
        if src.drained() {
            *parked = false;
        }
        Ok(flow)
    }

    fn flush(&mut self, direction: Direction) -> Result<usize> {
        match direction {
            Direction::Upstream => self.upstream.flush(&self.compositor),
            Direction::Downstream => self.downstream.flush(&self.client),
        }
    }
}
